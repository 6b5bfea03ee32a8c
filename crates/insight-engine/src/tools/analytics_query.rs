use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};

use insight_core::errors::GatewayError;
use insight_core::tools::{required_str, CallContext, Tool, ToolInvocationError};

use super::message_stream::{message_chunks, ChunkStream};
use crate::normalizer::StreamNormalizer;

pub const TOOL_NAME: &str = "AnalyticsQuery";

/// Source of raw analytics chunks for one question.
#[async_trait]
pub trait AnalyticsSource: Send + Sync {
    /// Open the answer stream. Chunks are yielded as the backend produces
    /// them.
    async fn chat(&self, question: &str, ctx: &CallContext) -> Result<ChunkStream, GatewayError>;
}

/// Answers a natural-language question from the governed semantic layer and
/// returns the merged insight.
pub struct AnalyticsQueryTool {
    source: Arc<dyn AnalyticsSource>,
    normalizer: StreamNormalizer,
}

impl AnalyticsQueryTool {
    pub fn new(source: Arc<dyn AnalyticsSource>, normalizer: StreamNormalizer) -> Self {
        Self { source, normalizer }
    }
}

#[async_trait]
impl Tool for AnalyticsQueryTool {
    fn name(&self) -> &str {
        TOOL_NAME
    }

    fn description(&self) -> &str {
        "Query governed analytics data with a natural-language question. Returns text \
         insights, the schema and result rows, the generated SQL and an explore link."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["question"],
            "properties": {
                "question": {
                    "type": "string",
                    "description": "The question to ask of the data"
                }
            }
        })
    }

    async fn invoke(&self, args: Value, ctx: &CallContext) -> Result<Value, ToolInvocationError> {
        let question = required_str(&args, "question")?;

        ctx.thought(format!("Analyzing question: {question}"));
        ctx.thought("Querying Looker data...");
        let chunks = self
            .source
            .chat(question, ctx)
            .await
            .map_err(|e| query_failed(ctx, e))?;

        ctx.thought("Processing results...");
        let (insight, report) = self
            .normalizer
            .merge_stream(chunks, &ctx.thoughts)
            .await
            .map_err(|e| query_failed(ctx, e))?;
        if !report.is_clean() {
            tracing::warn!(
                request_id = %ctx.request_id,
                omitted = report.omissions().count(),
                "analytics result merged with omissions"
            );
        }
        Ok(insight.into_value())
    }
}

fn query_failed(ctx: &CallContext, e: GatewayError) -> ToolInvocationError {
    tracing::warn!(request_id = %ctx.request_id, kind = e.error_kind(), error = %e, "analytics query failed");
    ctx.thought(format!("Error querying data: {e}"));
    ToolInvocationError::Backend(e)
}

/// Connection details for the data-chat service.
#[derive(Clone, Debug)]
pub struct DataChatConfig {
    pub endpoint: String,
    pub project: String,
    pub location: String,
    pub looker_instance_uri: String,
    pub lookml_model: String,
    pub explore: String,
    pub looker_client_id: Option<String>,
    pub looker_client_secret: Option<SecretString>,
    pub system_instruction: String,
    pub timeout: Duration,
}

/// HTTP client for the conversational analytics `:chat` endpoint. The
/// request's bearer credential is forwarded as-is.
pub struct DataChatClient {
    client: reqwest::Client,
    config: DataChatConfig,
}

impl DataChatClient {
    pub fn new(config: DataChatConfig) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| GatewayError::InvalidRequest(format!("http client: {e}")))?;
        Ok(Self { client, config })
    }

    fn parent(&self) -> String {
        format!(
            "projects/{}/locations/{}",
            self.config.project, self.config.location
        )
    }

    fn url(&self) -> String {
        format!(
            "{}/v1alpha/{}:chat",
            self.config.endpoint.trim_end_matches('/'),
            self.parent()
        )
    }

    fn request_body(&self, question: &str) -> Value {
        let c = &self.config;
        let mut looker = json!({
            "exploreReferences": [{
                "lookerInstanceUri": c.looker_instance_uri,
                "lookmlModel": c.lookml_model,
                "explore": c.explore,
            }],
        });
        if let (Some(id), Some(secret)) = (&c.looker_client_id, &c.looker_client_secret) {
            looker["credentials"] = json!({
                "oauth": {"secret": {"clientId": id, "clientSecret": secret.expose_secret()}}
            });
        }
        json!({
            "parent": self.parent(),
            "messages": [{"userMessage": {"text": question}}],
            "inlineContext": {
                "systemInstruction": c.system_instruction,
                "datasourceReferences": {"looker": looker},
                "options": {"analysis": {"python": {"enabled": false}}},
            },
        })
    }
}

#[async_trait]
impl AnalyticsSource for DataChatClient {
    async fn chat(&self, question: &str, ctx: &CallContext) -> Result<ChunkStream, GatewayError> {
        let mut req = self.client.post(self.url()).json(&self.request_body(question));
        if let Some(token) = &ctx.credential {
            req = req.bearer_auth(token.expose());
        }

        let resp = req.send().await.map_err(|e| {
            if e.is_timeout() {
                GatewayError::Timeout(self.config.timeout)
            } else {
                GatewayError::NetworkError(e.to_string())
            }
        })?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(GatewayError::from_status(status, body));
        }

        tracing::debug!(request_id = %ctx.request_id, "analytics chat stream opened");
        Ok(message_chunks(resp.bytes_stream(), ctx.cancel.clone()))
    }
}
