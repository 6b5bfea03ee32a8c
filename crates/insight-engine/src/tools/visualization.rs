use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use insight_core::messages::Transcript;
use insight_core::provider::ReasoningProvider;
use insight_core::tools::{required_str, CallContext, Tool, ToolInvocationError};

pub const TOOL_NAME: &str = "Visualization";

/// Appended to the analyst instruction when charts are available.
pub const CHART_GUIDANCE: &str = "When a result has several rows, such as a time series or a \
    breakdown by category, call the Visualization tool with the question and those rows. \
    Output the JSON it returns unchanged in a fenced code block tagged json-chart, after \
    the markdown table of the data.";

const CHART_INSTRUCTION: &str = "You turn tabular query results into a chart configuration. \
    Reply with one JSON object and nothing else, shaped as \
    {\"type\": \"bar\" | \"line\" | \"pie\" | \"area\", \"title\": string, \"xAxisKey\": string, \
    \"data\": [records], \"series\": [{\"dataKey\": string, \"name\": string, \"fill\": string}]}. \
    Use line for trends over time, bar for comparing categories and pie only for a few parts \
    of a whole. Copy the records you were given into data. xAxisKey and every dataKey must be \
    keys of those records.";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChartKind {
    Bar,
    Line,
    Pie,
    Area,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartSeries {
    pub data_key: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub fill: Option<String>,
}

/// Structural view of a chart configuration. Extra keys are allowed and
/// passed through untouched.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartConfig {
    #[serde(rename = "type")]
    pub kind: ChartKind,
    #[serde(default)]
    pub title: String,
    pub x_axis_key: String,
    pub data: Vec<Map<String, Value>>,
    pub series: Vec<ChartSeries>,
}

impl ChartConfig {
    /// Check the structural shape of a chart reply.
    pub fn validate(value: &Value) -> Result<Self, ToolInvocationError> {
        let config: ChartConfig = serde_json::from_value(value.clone())
            .map_err(|e| ToolInvocationError::InvalidOutput(format!("chart config: {e}")))?;
        if config.x_axis_key.trim().is_empty() {
            return Err(ToolInvocationError::InvalidOutput("chart config: empty xAxisKey".into()));
        }
        if config.series.is_empty() {
            return Err(ToolInvocationError::InvalidOutput("chart config: no series".into()));
        }
        if let Some(i) = config.series.iter().position(|s| s.data_key.trim().is_empty()) {
            return Err(ToolInvocationError::InvalidOutput(format!(
                "chart config: series {i} has no dataKey"
            )));
        }
        Ok(config)
    }
}

/// Chart configuration for a set of result rows, produced by the reasoning
/// provider in a single turn without tools.
pub struct VisualizationTool {
    provider: Arc<dyn ReasoningProvider>,
}

impl VisualizationTool {
    pub fn new(provider: Arc<dyn ReasoningProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl Tool for VisualizationTool {
    fn name(&self) -> &str {
        TOOL_NAME
    }

    fn description(&self) -> &str {
        "Build the chart configuration for a set of result rows. Use it when the user asks \
         for a chart or the data shows a trend or a breakdown."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["question", "data"],
            "properties": {
                "question": {"type": "string", "description": "What the chart should answer"},
                "data": {
                    "type": "array",
                    "items": {"type": "object"},
                    "description": "Result rows to chart"
                }
            }
        })
    }

    async fn invoke(&self, args: Value, ctx: &CallContext) -> Result<Value, ToolInvocationError> {
        let question = required_str(&args, "question")?;
        let rows = rows_arg(&args)?;

        ctx.thought("Generating chart configuration...");
        let prompt = format!("Question: {question}\nData: {}", Value::Array(rows));
        let transcript = Transcript::new(Some(CHART_INSTRUCTION.to_string()), prompt);
        let turn = self.provider.next_turn(&transcript, &[]).await?;

        let text = turn
            .final_text()
            .ok_or_else(|| ToolInvocationError::InvalidOutput("no chart configuration returned".into()))?;
        let value: Value = serde_json::from_str(strip_fence(text))
            .map_err(|e| ToolInvocationError::InvalidOutput(format!("chart config is not JSON: {e}")))?;
        let config = ChartConfig::validate(&value)?;
        tracing::debug!(
            request_id = %ctx.request_id,
            kind = ?config.kind,
            rows = config.data.len(),
            "chart configured"
        );
        Ok(value)
    }
}

/// Rows arrive as a list of records or as that list serialized to a string.
fn rows_arg(args: &Value) -> Result<Vec<Value>, ToolInvocationError> {
    let invalid = || ToolInvocationError::InvalidArguments("data must be a list of records".into());
    let rows = match args.get("data") {
        Some(Value::Array(rows)) => rows.clone(),
        Some(Value::String(raw)) => match serde_json::from_str(raw) {
            Ok(Value::Array(rows)) => rows,
            _ => return Err(invalid()),
        },
        _ => return Err(invalid()),
    };
    if rows.iter().all(Value::is_object) {
        Ok(rows)
    } else {
        Err(invalid())
    }
}

/// The reply may wrap its JSON in a markdown fence.
fn strip_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let body = rest.split_once('\n').map_or("", |(_, body)| body).trim_end();
    body.strip_suffix("```").unwrap_or(body).trim()
}
