use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::errors::GatewayError;
use crate::ids::{RequestId, SessionId, UserId};
use crate::security::BearerToken;
use crate::thoughts::ThoughtSink;

/// Everything a tool invocation may need from the request that spawned it.
///
/// Passed explicitly to every invocation, including those running on pool
/// workers; tools must not look for request state anywhere else.
#[derive(Clone, Debug)]
pub struct CallContext {
    pub request_id: RequestId,
    pub session_id: SessionId,
    pub user_id: UserId,
    pub credential: Option<BearerToken>,
    pub cancel: CancellationToken,
    pub thoughts: ThoughtSink,
}

impl CallContext {
    pub fn new(session_id: SessionId, user_id: UserId) -> Self {
        Self {
            request_id: RequestId::new(),
            session_id,
            user_id,
            credential: None,
            cancel: CancellationToken::new(),
            thoughts: ThoughtSink::disconnected(),
        }
    }

    pub fn with_credential(mut self, credential: Option<BearerToken>) -> Self {
        self.credential = credential;
        self
    }

    pub fn with_thoughts(mut self, thoughts: ThoughtSink) -> Self {
        self.thoughts = thoughts;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Push a progress message for this request.
    pub fn thought(&self, text: impl Into<String>) {
        self.thoughts.emit(text);
    }
}

/// Tool description handed to the reasoning provider.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters_schema: serde_json::Value,
}

/// Uniform invocation contract over the external tools.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn parameters_schema(&self) -> serde_json::Value;

    /// Invoke with a JSON object of arguments. May block on network I/O.
    async fn invoke(
        &self,
        args: serde_json::Value,
        ctx: &CallContext,
    ) -> Result<serde_json::Value, ToolInvocationError>;

    fn to_spec(&self) -> ToolSpec {
        ToolSpec {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters_schema: self.parameters_schema(),
        }
    }
}

/// Structured failure of one tool call. Routed back to the reasoning
/// provider, never raised past the controller.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ToolInvocationError {
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("backend error: {0}")]
    Backend(#[from] GatewayError),
    #[error("execution failed: {0}")]
    ExecutionFailed(String),
    #[error("invalid tool output: {0}")]
    InvalidOutput(String),
    #[error("timeout after {0:?}")]
    Timeout(Duration),
    #[error("cancelled")]
    Cancelled,
    #[error("tool crashed: {0}")]
    Crashed(String),
}

/// Read a required string argument.
pub fn required_str<'a>(
    args: &'a serde_json::Value,
    key: &str,
) -> Result<&'a str, ToolInvocationError> {
    args.get(key)
        .and_then(serde_json::Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| ToolInvocationError::InvalidArguments(format!("{key} is required")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn required_str_present() {
        let args = json!({"question": "revenue by day"});
        assert_eq!(required_str(&args, "question").unwrap(), "revenue by day");
    }

    #[test]
    fn required_str_missing_or_blank() {
        let err = required_str(&json!({}), "query").unwrap_err();
        assert_eq!(err.to_string(), "invalid arguments: query is required");
        assert!(required_str(&json!({"query": "  "}), "query").is_err());
        assert!(required_str(&json!({"query": 3}), "query").is_err());
    }

    #[test]
    fn context_builders() {
        let ctx = CallContext::new(SessionId::from_raw("s"), UserId::from_raw("u"))
            .with_credential(Some(BearerToken::new("t")));
        assert_eq!(ctx.credential.as_ref().map(BearerToken::expose), Some("t"));
        assert!(!ctx.thoughts.is_connected());
        assert!(!ctx.cancel.is_cancelled());
    }

    #[test]
    fn gateway_errors_convert() {
        let err: ToolInvocationError = GatewayError::NetworkError("reset".into()).into();
        assert_eq!(err.to_string(), "backend error: network error: reset");
    }
}
