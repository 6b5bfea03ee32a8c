use serde_json::{json, Value};

use insight_core::errors::GatewayError;
use insight_core::ids::CallId;
use insight_core::messages::{ReasoningTurn, ToolCall, ToolOutcome, Transcript, TranscriptEntry};
use insight_core::tools::ToolSpec;

/// Convert a transcript and tool list into a `generateContent` request body.
pub fn build_request_body(transcript: &Transcript, tools: &[ToolSpec]) -> Value {
    let mut body = json!({
        "contents": transcript.entries.iter().map(convert_entry).collect::<Vec<_>>(),
    });

    if let Some(instruction) = &transcript.system_instruction {
        body["systemInstruction"] = json!({"parts": [{"text": instruction}]});
    }

    if !tools.is_empty() {
        let declarations: Vec<Value> = tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.parameters_schema,
                })
            })
            .collect();
        body["tools"] = json!([{"functionDeclarations": declarations}]);
    }

    body
}

fn convert_entry(entry: &TranscriptEntry) -> Value {
    match entry {
        TranscriptEntry::User(text) => json!({"role": "user", "parts": [{"text": text}]}),
        TranscriptEntry::Model(turn) => {
            let mut parts = Vec::new();
            if let Some(text) = &turn.text {
                parts.push(json!({"text": text}));
            }
            parts.extend(turn.tool_calls.iter().map(convert_tool_call));
            json!({"role": "model", "parts": parts})
        }
        TranscriptEntry::Outcomes(outcomes) => json!({
            "role": "user",
            "parts": outcomes.iter().map(convert_outcome).collect::<Vec<_>>(),
        }),
    }
}

fn convert_tool_call(call: &ToolCall) -> Value {
    json!({
        "functionCall": {
            "id": call.call_id,
            "name": call.name,
            "args": call.args,
        }
    })
}

fn convert_outcome(outcome: &ToolOutcome) -> Value {
    json!({
        "functionResponse": {
            "id": outcome.call_id,
            "name": outcome.name,
            "response": outcome.response_payload(),
        }
    })
}

/// Parse a `generateContent` response into the next reasoning turn.
///
/// Text parts are concatenated. Function calls without an `id` get a fresh
/// one so outcomes can still be matched.
pub fn parse_response(body: &Value) -> Result<ReasoningTurn, GatewayError> {
    if let Some(reason) = body
        .pointer("/promptFeedback/blockReason")
        .and_then(Value::as_str)
    {
        return Err(GatewayError::InvalidRequest(format!("prompt blocked: {reason}")));
    }

    let candidate = body
        .get("candidates")
        .and_then(Value::as_array)
        .and_then(|c| c.first())
        .ok_or_else(|| GatewayError::MalformedResponse("no candidates".into()))?;

    let parts = candidate
        .pointer("/content/parts")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();

    let mut text = String::new();
    let mut tool_calls = Vec::new();
    for part in parts {
        if let Some(t) = part.get("text").and_then(Value::as_str) {
            text.push_str(t);
        }
        if let Some(call) = part.get("functionCall") {
            let name = call
                .get("name")
                .and_then(Value::as_str)
                .ok_or_else(|| GatewayError::MalformedResponse("functionCall without name".into()))?;
            let call_id = call
                .get("id")
                .and_then(Value::as_str)
                .map(CallId::from_raw)
                .unwrap_or_default();
            tool_calls.push(ToolCall {
                call_id,
                name: name.to_string(),
                args: call.get("args").cloned().unwrap_or_else(|| json!({})),
            });
        }
    }

    Ok(ReasoningTurn {
        text: (!text.is_empty()).then_some(text),
        tool_calls,
    })
}
