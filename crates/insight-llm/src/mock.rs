use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use insight_core::errors::GatewayError;
use insight_core::messages::{ReasoningTurn, ToolCall, Transcript, TranscriptEntry};
use insight_core::provider::ReasoningProvider;
use insight_core::tools::ToolSpec;

/// Pre-programmed turns for deterministic testing without API calls.
#[derive(Clone, Debug)]
pub enum MockTurn {
    Turn(ReasoningTurn),
    Error(GatewayError),
    /// Wait a duration, then yield the inner turn.
    Delay(Duration, Box<MockTurn>),
}

impl MockTurn {
    pub fn text(text: &str) -> Self {
        Self::Turn(ReasoningTurn::text(text))
    }

    pub fn calls(calls: Vec<ToolCall>) -> Self {
        Self::Turn(ReasoningTurn::calls(calls))
    }

    pub fn empty() -> Self {
        Self::Turn(ReasoningTurn::default())
    }

    pub fn delayed(delay: Duration, inner: MockTurn) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

/// What the mock saw on one call.
#[derive(Clone, Debug)]
pub struct ObservedCall {
    pub entries: usize,
    /// Outcomes recorded in the transcript at call time.
    pub outcomes_seen: usize,
    pub tool_names: Vec<String>,
}

/// Mock reasoner that returns pre-programmed turns in sequence.
pub struct MockReasoner {
    turns: Vec<MockTurn>,
    call_count: AtomicUsize,
    observed: Mutex<Vec<ObservedCall>>,
}

impl MockReasoner {
    pub fn new(turns: Vec<MockTurn>) -> Self {
        Self {
            turns,
            call_count: AtomicUsize::new(0),
            observed: Mutex::new(Vec::new()),
        }
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::Relaxed)
    }

    pub fn observed(&self) -> Vec<ObservedCall> {
        self.observed.lock().clone()
    }
}

#[async_trait]
impl ReasoningProvider for MockReasoner {
    fn name(&self) -> &str {
        "mock"
    }

    fn model(&self) -> &str {
        "mock-model"
    }

    async fn next_turn(
        &self,
        transcript: &Transcript,
        tools: &[ToolSpec],
    ) -> Result<ReasoningTurn, GatewayError> {
        let outcomes_seen = transcript
            .entries
            .iter()
            .map(|e| match e {
                TranscriptEntry::Outcomes(o) => o.len(),
                _ => 0,
            })
            .sum();
        self.observed.lock().push(ObservedCall {
            entries: transcript.len(),
            outcomes_seen,
            tool_names: tools.iter().map(|t| t.name.clone()).collect(),
        });

        let idx = self.call_count.fetch_add(1, Ordering::Relaxed);
        let Some(turn) = self.turns.get(idx) else {
            return Err(GatewayError::InvalidRequest(format!(
                "MockReasoner: no turn configured for call {idx}"
            )));
        };
        resolve_turn(turn).await
    }
}

/// Unrolls nested delays iteratively to avoid recursive async.
async fn resolve_turn(turn: &MockTurn) -> Result<ReasoningTurn, GatewayError> {
    let mut current = turn;
    loop {
        match current {
            MockTurn::Turn(t) => return Ok(t.clone()),
            MockTurn::Error(e) => return Err(e.clone()),
            MockTurn::Delay(duration, inner) => {
                tokio::time::sleep(*duration).await;
                current = inner;
            }
        }
    }
}
