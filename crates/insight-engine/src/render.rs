//! Plain-text rendering of a merged insight for the direct chat path.

use serde_json::Value;

use insight_core::insight::MergedInsight;

pub const MAX_TABLE_ROWS: usize = 50;

/// Text insights, then a markdown table of the rows, then the explore link.
pub fn render_insight(insight: &MergedInsight) -> String {
    let mut sections: Vec<String> = insight
        .text_insights()
        .into_iter()
        .filter(|t| !t.trim().is_empty())
        .map(str::to_string)
        .collect();

    if let Some(table) = markdown_table(insight.rows(), MAX_TABLE_ROWS) {
        sections.push(table);
    }
    if let Some(url) = insight.explore_url() {
        sections.push(format!("Explore: {url}"));
    }

    if sections.is_empty() {
        "No results returned.".to_string()
    } else {
        sections.join("\n\n")
    }
}

/// Columns are the union of row keys in first-seen order. Returns `None`
/// when there is nothing tabular to show.
pub fn markdown_table(rows: &[Value], max_rows: usize) -> Option<String> {
    let objects: Vec<_> = rows.iter().filter_map(Value::as_object).collect();
    let mut columns: Vec<&str> = Vec::new();
    for row in &objects {
        for key in row.keys() {
            if !columns.contains(&key.as_str()) {
                columns.push(key);
            }
        }
    }
    if columns.is_empty() {
        return None;
    }

    let mut lines = Vec::with_capacity(objects.len().min(max_rows) + 3);
    lines.push(format!("| {} |", columns.iter().map(|c| escape_cell(c)).collect::<Vec<_>>().join(" | ")));
    lines.push(format!("|{}|", vec!["---"; columns.len()].join("|")));
    for row in objects.iter().take(max_rows) {
        let cells: Vec<String> = columns
            .iter()
            .map(|c| row.get(*c).map(cell_text).unwrap_or_default())
            .collect();
        lines.push(format!("| {} |", cells.join(" | ")));
    }
    if objects.len() > max_rows {
        lines.push(format!("({} more rows)", objects.len() - max_rows));
    }
    Some(lines.join("\n"))
}

fn cell_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => escape_cell(s),
        other => escape_cell(&other.to_string()),
    }
}

fn escape_cell(text: &str) -> String {
    text.replace('|', "\\|").replace('\n', " ")
}
