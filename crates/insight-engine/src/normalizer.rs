//! Folds a chunked analytics response into one [`MergedInsight`].
//!
//! Pass one buckets chunks by discriminant; pass two folds the data
//! fragments with per-top-level-key overwrite. Derivation steps follow:
//! fallback deep-link, field relabeling, then flattening rows to scalar
//! cells. A step that cannot run contributes nothing and is recorded in the
//! [`MergeReport`]; merging never fails as a whole. Chunks may be pushed
//! from an iterator or consumed from a stream as they arrive.

use std::fmt;

use futures::{Stream, StreamExt};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use insight_core::errors::{GatewayError, MergeError};
use insight_core::insight::{FieldDescriptor, MergedInsight, RawChunk};
use insight_core::thoughts::ThoughtSink;

use crate::truncate;

const MAX_SQL_THOUGHT_BYTES: usize = 4 * 1024;

/// Where fallback deep-links point.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExploreTarget {
    pub base_url: String,
    pub model: String,
    pub explore: String,
}

impl ExploreTarget {
    pub fn new(
        base_url: impl Into<String>,
        model: impl Into<String>,
        explore: impl Into<String>,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            model: model.into(),
            explore: explore.into(),
        }
    }

    /// Deep-link for a field list. Pure in (target, field names).
    pub fn explore_url<S: AsRef<str>>(&self, fields: &[S]) -> String {
        let fields = fields
            .iter()
            .map(|f| urlencoding::encode(f.as_ref()).into_owned())
            .collect::<Vec<_>>()
            .join(",");
        format!(
            "{}/embed/explore/{}/{}?fields={}&toggle=vis,data",
            self.base_url.trim_end_matches('/'),
            urlencoding::encode(&self.model),
            urlencoding::encode(&self.explore),
            fields
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Step {
    Classify { index: usize },
    Fold,
    Fields,
    FallbackUrl,
    Relabel,
    Flatten,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Classify { index } => write!(f, "classify[{index}]"),
            Self::Fold => f.write_str("fold"),
            Self::Fields => f.write_str("fields"),
            Self::FallbackUrl => f.write_str("fallback_url"),
            Self::Relabel => f.write_str("relabel"),
            Self::Flatten => f.write_str("flatten"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StepOutcome {
    Applied,
    /// Nothing to do (precondition not met); not an error.
    Skipped(String),
    /// The step failed and its contribution was left out.
    Omitted(MergeError),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StepRecord {
    pub step: Step,
    pub outcome: StepOutcome,
}

/// Per-step account of one merge.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub steps: Vec<StepRecord>,
}

impl MergeReport {
    fn record(&mut self, step: Step, outcome: StepOutcome) {
        if let StepOutcome::Omitted(err) = &outcome {
            warn!(step = %step, error = %err, "merge step omitted");
        }
        self.steps.push(StepRecord { step, outcome });
    }

    pub fn omissions(&self) -> impl Iterator<Item = (&Step, &MergeError)> {
        self.steps.iter().filter_map(|r| match &r.outcome {
            StepOutcome::Omitted(e) => Some((&r.step, e)),
            _ => None,
        })
    }

    pub fn is_clean(&self) -> bool {
        self.omissions().next().is_none()
    }

    pub fn outcome(&self, step: Step) -> Option<&StepOutcome> {
        self.steps.iter().find(|r| r.step == step).map(|r| &r.outcome)
    }
}

#[derive(Clone, Debug, Default)]
pub struct StreamNormalizer {
    target: ExploreTarget,
}

impl StreamNormalizer {
    pub fn new(target: ExploreTarget) -> Self {
        Self { target }
    }

    pub fn target(&self) -> &ExploreTarget {
        &self.target
    }

    pub fn merge(&self, chunks: impl IntoIterator<Item = RawChunk>) -> MergedInsight {
        self.merge_with_report(chunks, &ThoughtSink::disconnected()).0
    }

    /// Merge and report. SQL and explore URLs carried by data fragments are
    /// surfaced as thoughts in chunk order.
    pub fn merge_with_report(
        &self,
        chunks: impl IntoIterator<Item = RawChunk>,
        thoughts: &ThoughtSink,
    ) -> (MergedInsight, MergeReport) {
        let mut acc = Accumulator::new(thoughts);
        for chunk in chunks {
            acc.push(chunk);
        }
        self.finish(acc)
    }

    /// Merge chunks as they arrive. Thoughts for a chunk are emitted before
    /// the next one is awaited. A transport error ends the merge.
    pub async fn merge_stream<S>(
        &self,
        mut chunks: S,
        thoughts: &ThoughtSink,
    ) -> Result<(MergedInsight, MergeReport), GatewayError>
    where
        S: Stream<Item = Result<RawChunk, GatewayError>> + Unpin,
    {
        let mut acc = Accumulator::new(thoughts);
        while let Some(chunk) = chunks.next().await {
            acc.push(chunk?);
        }
        Ok(self.finish(acc))
    }

    fn finish(&self, acc: Accumulator<'_>) -> (MergedInsight, MergeReport) {
        let Accumulator {
            mut report,
            text_insights,
            schema_insights,
            fragments,
            ..
        } = acc;

        let mut merged = fold(fragments);
        report.record(
            Step::Fold,
            if merged.is_empty() {
                StepOutcome::Skipped("no data fragments".into())
            } else {
                StepOutcome::Applied
            },
        );

        if !text_insights.is_empty() {
            merged.insert("text_insights".into(), Value::Array(text_insights));
        }
        if !schema_insights.is_empty() {
            merged.insert("schema_insights".into(), Value::Array(schema_insights));
        }

        let fields = collect_fields(&merged, &mut report);
        let url = self.derive_explore_url(&mut merged, &fields.from_result);
        report.record(Step::FallbackUrl, url);
        let relabeled = relabel(&mut merged, &fields.all);
        report.record(Step::Relabel, relabeled);
        let flattened = flatten_rows(&mut merged);
        report.record(Step::Flatten, flattened);

        (MergedInsight::from_map(merged), report)
    }

    fn derive_explore_url(&self, merged: &mut Map<String, Value>, fields: &[FieldDescriptor]) -> StepOutcome {
        let Some(result) = merged.get_mut("result").and_then(Value::as_object_mut) else {
            return StepOutcome::Skipped("no result".into());
        };
        if result.get("explore_url").is_some_and(|v| !v.is_null()) {
            return StepOutcome::Skipped("explore_url present".into());
        }
        if fields.is_empty() {
            return StepOutcome::Skipped("no field names".into());
        }
        if self.target.base_url.is_empty() {
            return StepOutcome::Skipped("no base endpoint configured".into());
        }
        let names: Vec<&str> = fields.iter().map(|f| f.name.as_str()).collect();
        result.insert(
            "explore_url".into(),
            Value::String(self.target.explore_url(&names)),
        );
        StepOutcome::Applied
    }
}

/// Classification state of one merge in progress.
struct Accumulator<'a> {
    thoughts: &'a ThoughtSink,
    report: MergeReport,
    text_insights: Vec<Value>,
    schema_insights: Vec<Value>,
    fragments: Vec<Map<String, Value>>,
    next_index: usize,
}

impl<'a> Accumulator<'a> {
    fn new(thoughts: &'a ThoughtSink) -> Self {
        Self {
            thoughts,
            report: MergeReport::default(),
            text_insights: Vec::new(),
            schema_insights: Vec::new(),
            fragments: Vec::new(),
            next_index: 0,
        }
    }

    fn push(&mut self, chunk: RawChunk) {
        let index = self.next_index;
        self.next_index += 1;
        let outcome = match chunk {
            RawChunk::Text(payload) => match text_of(&payload) {
                Some(text) => {
                    self.text_insights.push(Value::String(text));
                    StepOutcome::Applied
                }
                None => StepOutcome::Omitted(MergeError::MalformedChunk {
                    index,
                    reason: "text payload is neither a string nor a parts list".into(),
                }),
            },
            RawChunk::Schema(payload) => {
                self.schema_insights.push(payload);
                StepOutcome::Applied
            }
            RawChunk::Data(Value::Object(fragment)) => {
                surface_query_details(&fragment, self.thoughts);
                self.fragments.push(fragment);
                StepOutcome::Applied
            }
            RawChunk::Data(_) => StepOutcome::Omitted(MergeError::NonObjectFragment { index }),
            other => {
                debug!(index, kind = other.kind(), "passing over chunk");
                StepOutcome::Skipped(format!("{} chunks are not merged", other.kind()))
            }
        };
        self.report.record(Step::Classify { index }, outcome);
    }
}

/// Text chunks arrive either as a bare string or as `{"parts": [..]}`.
fn text_of(payload: &Value) -> Option<String> {
    match payload {
        Value::String(s) => Some(s.clone()),
        Value::Object(map) => {
            let parts = map.get("parts")?.as_array()?;
            let parts: Option<Vec<&str>> = parts.iter().map(Value::as_str).collect();
            Some(parts?.join(""))
        }
        _ => None,
    }
}

fn surface_query_details(fragment: &Map<String, Value>, thoughts: &ThoughtSink) {
    let Some(result) = fragment.get("result").and_then(Value::as_object) else {
        return;
    };
    if let Some(sql) = result.get("sql").and_then(Value::as_str) {
        thoughts.emit(format!(
            "Generated SQL: {}",
            truncate::truncate_output(sql, MAX_SQL_THOUGHT_BYTES)
        ));
    }
    if let Some(url) = result.get("explore_url").and_then(Value::as_str) {
        thoughts.emit(format!("Explore URL found: {url}"));
    }
}

/// Last write wins per top-level key. A later fragment's `result` replaces
/// an earlier one wholesale.
fn fold(fragments: Vec<Map<String, Value>>) -> Map<String, Value> {
    let mut merged = Map::new();
    for fragment in fragments {
        for (key, value) in fragment {
            merged.insert(key, value);
        }
    }
    merged
}

/// Field descriptors by origin. `from_result` feeds the fallback link;
/// `all` adds schema-insight descriptors for label lookup.
struct Fields {
    from_result: Vec<FieldDescriptor>,
    all: Vec<FieldDescriptor>,
}

/// Descriptors from `result.schema.fields`, then any schema insight carrying
/// `fields` or `schema.fields`. First occurrence of a name wins. A malformed
/// source or descriptor is left out and recorded; the rest are kept.
fn collect_fields(merged: &Map<String, Value>, report: &mut MergeReport) -> Fields {
    let mut errors = Vec::new();
    let from_result = merged
        .get("result")
        .and_then(|r| r.pointer("/schema/fields"))
        .map(|source| parse_descriptors(source, "result.schema.fields", &mut errors))
        .unwrap_or_default();

    let mut all = from_result.clone();
    if let Some(insights) = merged.get("schema_insights").and_then(Value::as_array) {
        for (i, insight) in insights.iter().enumerate() {
            let Some(source) = insight
                .get("fields")
                .or_else(|| insight.pointer("/schema/fields"))
            else {
                continue;
            };
            for descriptor in parse_descriptors(source, &format!("schema_insights[{i}]"), &mut errors) {
                if !all.iter().any(|f| f.name == descriptor.name) {
                    all.push(descriptor);
                }
            }
        }
    }

    if errors.is_empty() {
        report.record(
            Step::Fields,
            if all.is_empty() {
                StepOutcome::Skipped("no field descriptors".into())
            } else {
                StepOutcome::Applied
            },
        );
    }
    for err in errors {
        report.record(Step::Fields, StepOutcome::Omitted(err));
    }
    Fields { from_result, all }
}

fn parse_descriptors(source: &Value, origin: &str, errors: &mut Vec<MergeError>) -> Vec<FieldDescriptor> {
    let Some(list) = source.as_array() else {
        errors.push(MergeError::MalformedSchema(format!("{origin}: fields is not a list")));
        return Vec::new();
    };
    let mut out: Vec<FieldDescriptor> = Vec::new();
    for (i, field) in list.iter().enumerate() {
        match serde_json::from_value::<FieldDescriptor>(field.clone()) {
            Ok(d) if d.name.is_empty() => {
                errors.push(MergeError::MalformedSchema(format!("{origin}[{i}]: field without a name")));
            }
            Ok(d) => {
                if !out.iter().any(|f| f.name == d.name) {
                    out.push(d);
                }
            }
            Err(e) => errors.push(MergeError::MalformedSchema(format!("{origin}[{i}]: {e}"))),
        }
    }
    out
}

fn rows_mut(merged: &mut Map<String, Value>) -> Vec<&mut Vec<Value>> {
    let Some(result) = merged.get_mut("result").and_then(Value::as_object_mut) else {
        return Vec::new();
    };
    result
        .iter_mut()
        .filter(|(k, _)| *k == "rows" || *k == "data")
        .filter_map(|(_, v)| v.as_array_mut())
        .collect()
}

/// Rewrite row keys to display labels. Keys without a non-empty label, and
/// keys that match no descriptor, are kept as-is.
fn relabel(merged: &mut Map<String, Value>, fields: &[FieldDescriptor]) -> StepOutcome {
    let labels: Vec<(&str, &str)> = fields
        .iter()
        .filter_map(|f| f.explicit_label().map(|l| (f.name.as_str(), l)))
        .collect();
    if labels.is_empty() {
        return StepOutcome::Skipped("no labels".into());
    }

    let mut row_lists = rows_mut(merged);
    if row_lists.is_empty() {
        return StepOutcome::Skipped("no rows".into());
    }

    let mut bad_row = None;
    for rows in row_lists.iter_mut() {
        for (index, row) in rows.iter_mut().enumerate() {
            let Value::Object(cells) = row else {
                bad_row.get_or_insert(index);
                continue;
            };
            let relabeled: Map<String, Value> = std::mem::take(cells)
                .into_iter()
                .map(|(key, value)| {
                    let label = labels
                        .iter()
                        .find(|(name, _)| *name == key)
                        .map(|(_, l)| l.to_string());
                    (label.unwrap_or(key), value)
                })
                .collect();
            *cells = relabeled;
        }
    }

    match bad_row {
        Some(index) => StepOutcome::Omitted(MergeError::MalformedRow { index }),
        None => StepOutcome::Applied,
    }
}

/// Records map field names to scalars; nested cell values are rendered as
/// compact JSON strings.
fn flatten_rows(merged: &mut Map<String, Value>) -> StepOutcome {
    let mut row_lists = rows_mut(merged);
    if row_lists.is_empty() {
        return StepOutcome::Skipped("no rows".into());
    }
    let mut bad_row = None;
    for rows in row_lists.iter_mut() {
        for (index, row) in rows.iter_mut().enumerate() {
            let Value::Object(cells) = row else {
                bad_row.get_or_insert(index);
                continue;
            };
            for value in cells.values_mut() {
                if value.is_array() || value.is_object() {
                    *value = Value::String(value.to_string());
                }
            }
        }
    }
    match bad_row {
        Some(index) => StepOutcome::Omitted(MergeError::MalformedRow { index }),
        None => StepOutcome::Applied,
    }
}
