use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::ids::CallId;
use crate::tools::ToolInvocationError;

/// A tool call requested by the reasoning provider. `call_id` is opaque and
/// echoed back with the outcome.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub call_id: CallId,
    pub name: String,
    pub args: Value,
}

impl ToolCall {
    pub fn new(name: impl Into<String>, args: Value) -> Self {
        Self {
            call_id: CallId::new(),
            name: name.into(),
            args,
        }
    }
}

/// How a single tool call ended.
#[derive(Clone, Debug)]
pub enum OutcomeStatus {
    Success(Value),
    Failed(ToolInvocationError),
    /// The call was never dispatched (e.g. unknown tool name).
    NoResult(String),
}

/// Outcome of one call, tagged with its originating `call_id`.
#[derive(Clone, Debug)]
pub struct ToolOutcome {
    pub call_id: CallId,
    pub name: String,
    pub status: OutcomeStatus,
}

impl ToolOutcome {
    pub fn success(call: &ToolCall, payload: Value) -> Self {
        Self::with_status(call, OutcomeStatus::Success(payload))
    }

    pub fn failed(call: &ToolCall, error: ToolInvocationError) -> Self {
        Self::with_status(call, OutcomeStatus::Failed(error))
    }

    pub fn no_result(call: &ToolCall, reason: impl Into<String>) -> Self {
        Self::with_status(call, OutcomeStatus::NoResult(reason.into()))
    }

    fn with_status(call: &ToolCall, status: OutcomeStatus) -> Self {
        Self {
            call_id: call.call_id.clone(),
            name: call.name.clone(),
            status,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.status, OutcomeStatus::Success(_))
    }

    /// Shape fed back to the reasoning provider.
    pub fn response_payload(&self) -> Value {
        match &self.status {
            OutcomeStatus::Success(v) => json!({ "result": v }),
            OutcomeStatus::Failed(e) => json!({ "error": e.to_string() }),
            OutcomeStatus::NoResult(reason) => json!({ "error": reason, "no_result": true }),
        }
    }
}

/// What the reasoning provider decided for one round.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ReasoningTurn {
    pub text: Option<String>,
    pub tool_calls: Vec<ToolCall>,
}

impl ReasoningTurn {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            tool_calls: Vec::new(),
        }
    }

    pub fn calls(tool_calls: Vec<ToolCall>) -> Self {
        Self {
            text: None,
            tool_calls,
        }
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }

    /// Non-blank terminal text, if any.
    pub fn final_text(&self) -> Option<&str> {
        self.text.as_deref().filter(|t| !t.trim().is_empty())
    }
}

/// One entry of the conversation the controller keeps with the provider.
#[derive(Clone, Debug)]
pub enum TranscriptEntry {
    User(String),
    Model(ReasoningTurn),
    Outcomes(Vec<ToolOutcome>),
}

/// Conversation state for one controller run.
#[derive(Clone, Debug, Default)]
pub struct Transcript {
    pub system_instruction: Option<String>,
    pub entries: Vec<TranscriptEntry>,
}

impl Transcript {
    pub fn new(system_instruction: Option<String>, question: impl Into<String>) -> Self {
        Self {
            system_instruction,
            entries: vec![TranscriptEntry::User(question.into())],
        }
    }

    pub fn push(&mut self, entry: TranscriptEntry) {
        self.entries.push(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
