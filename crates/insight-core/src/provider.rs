use async_trait::async_trait;

use crate::errors::GatewayError;
use crate::messages::{ReasoningTurn, Transcript};
use crate::tools::ToolSpec;

/// The reasoning process driving deep analysis. Given the conversation so
/// far and the tools on offer, decide the next turn: tool calls, terminal
/// text, or (rarely) neither.
#[async_trait]
pub trait ReasoningProvider: Send + Sync {
    fn name(&self) -> &str;
    fn model(&self) -> &str;

    async fn next_turn(
        &self,
        transcript: &Transcript,
        tools: &[ToolSpec],
    ) -> Result<ReasoningTurn, GatewayError>;
}
