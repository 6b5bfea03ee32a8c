use std::time::Duration;

use insight_core::errors::GatewayError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The orchestration call itself failed (reasoning provider unreachable,
    /// rejected the request, or answered with garbage).
    #[error("controller fault: {0}")]
    ControllerFault(#[from] GatewayError),

    #[error("analysis aborted")]
    Aborted,

    #[error("run timeout after {0:?}")]
    RunTimeout(Duration),

    #[error("{0}")]
    Internal(String),
}

impl EngineError {
    /// Text shown to the end user on the error channel.
    pub fn user_message(&self) -> String {
        match self {
            Self::ControllerFault(e) => format!("analysis failed: {e}"),
            Self::Aborted => "analysis cancelled".to_string(),
            Self::RunTimeout(d) => format!("analysis timed out after {}s", d.as_secs()),
            Self::Internal(msg) => format!("internal error: {msg}"),
        }
    }
}
