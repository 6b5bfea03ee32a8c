use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use tracing::instrument;

use insight_core::errors::GatewayError;
use insight_core::messages::{ReasoningTurn, Transcript};
use insight_core::provider::ReasoningProvider;
use insight_core::tools::ToolSpec;

use crate::converter;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Reasoning provider backed by a Gemini-style `generateContent` endpoint.
pub struct GeminiReasoner {
    client: Client,
    endpoint: String,
    model: String,
    api_key: Option<SecretString>,
    timeout: Duration,
}

impl GeminiReasoner {
    pub fn new(
        endpoint: impl Into<String>,
        model: impl Into<String>,
        api_key: Option<SecretString>,
        timeout: Duration,
    ) -> Result<Self, GatewayError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(timeout)
            .build()
            .map_err(|e| GatewayError::InvalidRequest(format!("http client: {e}")))?;
        Ok(Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            model: model.into(),
            api_key,
            timeout,
        })
    }

    fn url(&self) -> String {
        format!("{}/models/{}:generateContent", self.endpoint, self.model)
    }
}

#[async_trait]
impl ReasoningProvider for GeminiReasoner {
    fn name(&self) -> &str {
        "gemini"
    }

    fn model(&self) -> &str {
        &self.model
    }

    #[instrument(skip_all, fields(model = %self.model, entries = transcript.len()))]
    async fn next_turn(
        &self,
        transcript: &Transcript,
        tools: &[ToolSpec],
    ) -> Result<ReasoningTurn, GatewayError> {
        let body = converter::build_request_body(transcript, tools);

        let mut req = self.client.post(self.url()).json(&body);
        if let Some(key) = &self.api_key {
            req = req.header("x-goog-api-key", key.expose_secret());
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

        let value: Value = resp
            .json()
            .await
            .map_err(|e| GatewayError::MalformedResponse(e.to_string()))?;
        let turn = converter::parse_response(&value)?;
        tracing::debug!(
            tool_calls = turn.tool_calls.len(),
            has_text = turn.text.is_some(),
            "reasoning turn"
        );
        Ok(turn)
    }
}
