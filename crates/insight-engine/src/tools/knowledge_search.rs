use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use insight_core::errors::GatewayError;
use insight_core::insight::SearchHit;
use insight_core::tools::{required_str, CallContext, Tool, ToolInvocationError};

pub const TOOL_NAME: &str = "KnowledgeSearch";

#[async_trait]
pub trait SearchBackend: Send + Sync {
    async fn search(&self, query: &str, ctx: &CallContext) -> Result<Vec<SearchHit>, GatewayError>;
}

/// Ranked document search over the knowledge store.
pub struct KnowledgeSearchTool {
    backend: Arc<dyn SearchBackend>,
}

impl KnowledgeSearchTool {
    pub fn new(backend: Arc<dyn SearchBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl Tool for KnowledgeSearchTool {
    fn name(&self) -> &str {
        TOOL_NAME
    }

    fn description(&self) -> &str {
        "Search internal documents for context that explains the numbers. \
         Returns ranked hits with title, link and snippet."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["query"],
            "properties": {
                "query": {"type": "string", "description": "Search terms"}
            }
        })
    }

    async fn invoke(&self, args: Value, ctx: &CallContext) -> Result<Value, ToolInvocationError> {
        let query = required_str(&args, "query")?;
        ctx.thought(format!("Searching documents: {query}"));
        let hits = self.backend.search(query, ctx).await?;
        serde_json::to_value(hits).map_err(|e| ToolInvocationError::ExecutionFailed(e.to_string()))
    }
}

/// HTTP client for a search endpoint answering `{query, pageSize}` with
/// `results[].document.derivedStructData`.
pub struct SearchClient {
    client: reqwest::Client,
    endpoint: String,
    page_size: u32,
    timeout: Duration,
}

impl SearchClient {
    pub fn new(endpoint: impl Into<String>, page_size: u32, timeout: Duration) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GatewayError::InvalidRequest(format!("http client: {e}")))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            page_size,
            timeout,
        })
    }
}

/// Hits in rank order. A result is dropped only when it has neither a
/// derived title nor a link.
pub fn hits_from_response(body: &Value) -> Vec<SearchHit> {
    let Some(results) = body.get("results").and_then(Value::as_array) else {
        return Vec::new();
    };
    results
        .iter()
        .filter_map(|r| {
            let data = r.pointer("/document/derivedStructData")?;
            let title = data.get("title").and_then(Value::as_str).unwrap_or_default();
            let link = data.get("link").and_then(Value::as_str).unwrap_or_default();
            if title.is_empty() && link.is_empty() {
                return None;
            }
            let snippet = data
                .pointer("/snippets/0/snippet")
                .and_then(Value::as_str)
                .unwrap_or_default();
            Some(SearchHit {
                title: title.to_string(),
                link: link.to_string(),
                snippet: snippet.to_string(),
            })
        })
        .collect()
}

#[async_trait]
impl SearchBackend for SearchClient {
    async fn search(&self, query: &str, ctx: &CallContext) -> Result<Vec<SearchHit>, GatewayError> {
        let mut req = self
            .client
            .post(&self.endpoint)
            .json(&json!({"query": query, "pageSize": self.page_size}));
        if let Some(token) = &ctx.credential {
            req = req.bearer_auth(token.expose());
        }

        let resp = req.send().await.map_err(|e| {
            if e.is_timeout() {
                GatewayError::Timeout(self.timeout)
            } else {
                GatewayError::NetworkError(e.to_string())
            }
        })?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(GatewayError::from_status(status, body));
        }
        let body: Value = resp
            .json()
            .await
            .map_err(|e| GatewayError::MalformedResponse(e.to_string()))?;
        Ok(hits_from_response(&body))
    }
}
