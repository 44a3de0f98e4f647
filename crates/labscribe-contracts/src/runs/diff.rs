use serde_json::Value;
use similar::TextDiff;

/// Unified line diff between two payloads, pretty-printed first so that
/// field-level edits land on their own lines. `None` when nothing changed.
pub fn payload_diff(prev: &str, curr: &str) -> Option<Vec<String>> {
    let prev = pretty(prev);
    let curr = pretty(curr);
    if prev == curr {
        return None;
    }
    let diff = TextDiff::from_lines(&prev, &curr);
    let rendered = diff.unified_diff().header("prev", "curr").to_string();
    Some(rendered.lines().map(str::to_string).collect())
}

fn pretty(text: &str) -> String {
    let mut rendered = serde_json::from_str::<Value>(text)
        .ok()
        .and_then(|value| serde_json::to_string_pretty(&value).ok())
        .unwrap_or_else(|| text.trim().to_string());
    rendered.push('\n');
    rendered
}
