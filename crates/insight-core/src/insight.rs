//! Chunk and insight data model.
//!
//! The analytics service streams loosely-typed system messages. Each one is
//! classified into a [`RawChunk`] at the boundary; the normalizer folds a
//! sequence of them into a [`MergedInsight`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One unit of a streamed analytics response, classified by its
/// discriminating key. Discriminants are checked in the order
/// `text`, `schema`, `data`, `tool_use`, `tool_output`; anything else is kept
/// verbatim in `Unknown`.
#[derive(Clone, Debug, PartialEq)]
pub enum RawChunk {
    Text(Value),
    Schema(Value),
    Data(Value),
    ToolUse(Value),
    ToolOutput(Value),
    Unknown(Value),
}

const DISCRIMINANTS: [&str; 5] = ["text", "schema", "data", "tool_use", "tool_output"];

impl RawChunk {
    /// Classify a wire message such as `{"text": "..."}`.
    pub fn classify(value: Value) -> Self {
        let Value::Object(mut map) = value else {
            return Self::Unknown(value);
        };
        let Some(key) = DISCRIMINANTS.iter().find(|k| map.contains_key(**k)) else {
            return Self::Unknown(Value::Object(map));
        };
        let payload = map.remove(*key).unwrap_or(Value::Null);
        match *key {
            "text" => Self::Text(payload),
            "schema" => Self::Schema(payload),
            "data" => Self::Data(payload),
            "tool_use" => Self::ToolUse(payload),
            _ => Self::ToolOutput(payload),
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(Value::String(text.into()))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Text(_) => "text",
            Self::Schema(_) => "schema",
            Self::Data(_) => "data",
            Self::ToolUse(_) => "tool_use",
            Self::ToolOutput(_) => "tool_output",
            Self::Unknown(_) => "unknown",
        }
    }

    /// Back to the single-key wire form.
    pub fn to_value(&self) -> Value {
        let (key, payload) = match self {
            Self::Unknown(v) => return v.clone(),
            Self::Text(v) => ("text", v),
            Self::Schema(v) => ("schema", v),
            Self::Data(v) => ("data", v),
            Self::ToolUse(v) => ("tool_use", v),
            Self::ToolOutput(v) => ("tool_output", v),
        };
        let mut map = Map::new();
        map.insert(key.to_string(), payload.clone());
        Value::Object(map)
    }
}

impl Serialize for RawChunk {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(s)
    }
}

impl<'de> Deserialize<'de> for RawChunk {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        Value::deserialize(d).map(Self::classify)
    }
}

/// Schema field as returned by the semantic layer.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDescriptor {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_short: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

impl FieldDescriptor {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// First non-empty label in the order `label_short`, `label`, `title`.
    pub fn explicit_label(&self) -> Option<&str> {
        [&self.label_short, &self.label, &self.title]
            .into_iter()
            .flatten()
            .map(String::as_str)
            .find(|l| !l.is_empty())
    }

    /// Display label, falling back to the raw field name.
    pub fn display_label(&self) -> &str {
        self.explicit_label().unwrap_or(&self.name)
    }
}

/// Normalized record assembled from one analytics chunk stream.
///
/// Known keys: `text_insights`, `schema_insights` and `result`. Any other
/// top-level key carried by a data fragment is kept as-is.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MergedInsight(Map<String, Value>);

impl MergedInsight {
    pub fn from_map(map: Map<String, Value>) -> Self {
        Self(map)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn text_insights(&self) -> Vec<&str> {
        self.0
            .get("text_insights")
            .and_then(Value::as_array)
            .map(|a| a.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default()
    }

    pub fn schema_insights(&self) -> &[Value] {
        self.0
            .get("schema_insights")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn result(&self) -> Option<&Map<String, Value>> {
        self.0.get("result").and_then(Value::as_object)
    }

    pub fn explore_url(&self) -> Option<&str> {
        self.result()?.get("explore_url")?.as_str()
    }

    pub fn sql(&self) -> Option<&str> {
        self.result()?.get("sql")?.as_str()
    }

    /// Result rows, read from `result.rows` or, failing that, `result.data`.
    pub fn rows(&self) -> &[Value] {
        let Some(result) = self.result() else {
            return &[];
        };
        result
            .get("rows")
            .or_else(|| result.get("data"))
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

/// One ranked snippet from the knowledge-search service.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchHit {
    pub title: String,
    pub link: String,
    pub snippet: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn classify_known_discriminants() {
        assert_eq!(RawChunk::classify(json!({"text": "a"})), RawChunk::text("a"));
        assert!(matches!(RawChunk::classify(json!({"schema": {}})), RawChunk::Schema(_)));
        assert!(matches!(RawChunk::classify(json!({"data": {}})), RawChunk::Data(_)));
        assert!(matches!(RawChunk::classify(json!({"tool_use": {}})), RawChunk::ToolUse(_)));
        assert!(matches!(
            RawChunk::classify(json!({"tool_output": {}})),
            RawChunk::ToolOutput(_)
        ));
    }

    #[test]
    fn classify_prefers_text_over_data() {
        let chunk = RawChunk::classify(json!({"data": {"x": 1}, "text": "both"}));
        assert_eq!(chunk, RawChunk::text("both"));
    }

    #[test]
    fn unknown_chunks_pass_through() {
        let raw = json!({"analysis": {"progress": 0.5}});
        let chunk = RawChunk::classify(raw.clone());
        assert_eq!(chunk, RawChunk::Unknown(raw.clone()));
        assert_eq!(chunk.to_value(), raw);
        assert_eq!(RawChunk::classify(json!("bare")).kind(), "unknown");
    }

    #[test]
    fn deserializes_through_classify() {
        let chunks: Vec<RawChunk> =
            serde_json::from_str(r#"[{"text":"a"},{"data":{"result":{}}}]"#).unwrap();
        assert_eq!(chunks[0].kind(), "text");
        assert_eq!(chunks[1].kind(), "data");
    }

    #[test]
    fn label_preference_order() {
        let mut f = FieldDescriptor::named("users.count");
        assert_eq!(f.display_label(), "users.count");
        f.title = Some("Title".into());
        assert_eq!(f.display_label(), "Title");
        f.label = Some("Label".into());
        assert_eq!(f.display_label(), "Label");
        f.label_short = Some("Short".into());
        assert_eq!(f.display_label(), "Short");
    }

    #[test]
    fn empty_labels_are_skipped() {
        let f = FieldDescriptor {
            name: "x".into(),
            label_short: Some(String::new()),
            label: Some("X".into()),
            title: None,
        };
        assert_eq!(f.explicit_label(), Some("X"));
    }

    #[test]
    fn merged_insight_accessors() {
        let value = json!({
            "text_insights": ["hello"],
            "result": {"data": [{"a": 1}], "sql": "SELECT 1", "explore_url": "https://x"}
        });
        let insight: MergedInsight = serde_json::from_value(value).unwrap();
        assert_eq!(insight.text_insights(), vec!["hello"]);
        assert_eq!(insight.rows().len(), 1);
        assert_eq!(insight.sql(), Some("SELECT 1"));
        assert_eq!(insight.explore_url(), Some("https://x"));
        assert!(insight.schema_insights().is_empty());
    }
}
