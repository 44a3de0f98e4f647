use std::path::Path;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub started_at: String,
    pub finished_at: String,
    pub outcome: String,
    pub attempts: u64,
    pub valid: Vec<Map<String, Value>>,
    pub invalid: Vec<Map<String, Value>>,
}

impl RunSummary {
    pub fn total_resources(&self) -> u64 {
        (self.valid.len() + self.invalid.len()) as u64
    }
}

pub fn write_summary(
    path: &Path,
    summary: &RunSummary,
    extra: Option<&Map<String, Value>>,
) -> anyhow::Result<()> {
    let mut payload = Map::new();
    payload.insert("run_id".to_string(), Value::String(summary.run_id.clone()));
    payload.insert(
        "started_at".to_string(),
        Value::String(summary.started_at.clone()),
    );
    payload.insert(
        "finished_at".to_string(),
        Value::String(summary.finished_at.clone()),
    );
    payload.insert(
        "outcome".to_string(),
        Value::String(summary.outcome.clone()),
    );
    payload.insert(
        "attempts".to_string(),
        Value::Number(summary.attempts.into()),
    );
    payload.insert(
        "total_resources".to_string(),
        Value::Number(summary.total_resources().into()),
    );
    payload.insert(
        "valid".to_string(),
        Value::Array(summary.valid.iter().cloned().map(Value::Object).collect()),
    );
    payload.insert(
        "invalid".to_string(),
        Value::Array(summary.invalid.iter().cloned().map(Value::Object).collect()),
    );
    payload.insert("ts".to_string(), Value::String(now_utc_iso()));
    if let Some(extra) = extra {
        for (key, value) in extra {
            payload.insert(key.clone(), value.clone());
        }
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(&Value::Object(payload))?)?;
    Ok(())
}

pub fn read_summary(path: &Path) -> anyhow::Result<RunSummary> {
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Map, Value};

    use super::{read_summary, write_summary, RunSummary};

    fn row(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    fn summary() -> RunSummary {
        RunSummary {
            run_id: "run-123".to_string(),
            started_at: "2026-02-19T00:00:00+00:00".to_string(),
            finished_at: "2026-02-19T00:10:00+00:00".to_string(),
            outcome: "BUDGET_EXHAUSTED".to_string(),
            attempts: 3,
            valid: vec![row(json!({"kind": "Observation", "path": "resources/01-observation.json"}))],
            invalid: vec![row(json!({"kind": "DiagnosticReport", "message": "bad category"}))],
        }
    }

    #[test]
    fn write_summary_generates_expected_payload() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("summary.json");
        let mut extra = Map::new();
        extra.insert("query_id".to_string(), json!("query-456"));
        write_summary(&path, &summary(), Some(&extra))?;

        let parsed: Value = serde_json::from_str(&std::fs::read_to_string(path)?)?;
        assert_eq!(parsed["run_id"], json!("run-123"));
        assert_eq!(parsed["outcome"], json!("BUDGET_EXHAUSTED"));
        assert_eq!(parsed["attempts"], json!(3));
        assert_eq!(parsed["total_resources"], json!(2));
        assert_eq!(parsed["valid"][0]["kind"], json!("Observation"));
        assert_eq!(parsed["query_id"], json!("query-456"));
        assert!(parsed.get("ts").and_then(Value::as_str).is_some());
        Ok(())
    }

    #[test]
    fn summary_reads_back() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("nested").join("summary.json");
        write_summary(&path, &summary(), None)?;
        assert_eq!(read_summary(&path)?, summary());
        Ok(())
    }
}
