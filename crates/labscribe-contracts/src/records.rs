use std::fmt;

use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Bearer credential issued by the record authority. Lives in memory only.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub token: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_in: Option<u64>,
}

impl Credential {
    pub fn new(token: impl Into<String>, expires_in: Option<u64>) -> Self {
        Self::acquired(token, expires_in, Utc::now())
    }

    pub fn acquired(
        token: impl Into<String>,
        expires_in: Option<u64>,
        acquired_at: DateTime<Utc>,
    ) -> Self {
        Self {
            token: token.into(),
            acquired_at,
            expires_in,
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        let Some(lifetime) = self
            .expires_in
            .and_then(|seconds| i64::try_from(seconds).ok())
            .and_then(ChronoDuration::try_seconds)
        else {
            return false;
        };
        match self.acquired_at.checked_add_signed(lifetime) {
            Some(expiry) => now >= expiry,
            None => false,
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("token", &"<redacted>")
            .field("acquired_at", &self.acquired_at)
            .field("expires_in", &self.expires_in)
            .finish()
    }
}

/// Demographics identifying the subject of a record query.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SubjectFields {
    pub given_name: String,
    pub family_name: String,
    pub date_of_birth: String,
    #[serde(default)]
    pub address_lines: Vec<String>,
    #[serde(default)]
    pub address_city: String,
    #[serde(default)]
    pub address_state: String,
    #[serde(default)]
    pub postal_code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gender: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub telephone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssn: Option<String>,
}

impl SubjectFields {
    /// Returns the name of every missing minimum field; empty means submittable.
    pub fn missing_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.given_name.trim().is_empty() {
            missing.push("given_name");
        }
        if self.family_name.trim().is_empty() {
            missing.push("family_name");
        }
        if NaiveDate::parse_from_str(self.date_of_birth.trim(), "%Y-%m-%d").is_err() {
            missing.push("date_of_birth");
        }
        if self.address_lines.iter().all(|line| line.trim().is_empty()) {
            missing.push("address_lines");
        }
        missing
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueryStatus {
    Pending,
    Completed,
    Failed,
}

impl QueryStatus {
    /// Maps the authority's status vocabulary; unknown or absent means pending.
    pub fn from_wire(raw: Option<&str>) -> Self {
        let normalized = raw
            .map(|value| value.trim().to_ascii_uppercase())
            .unwrap_or_default();
        match normalized.as_str() {
            "COMPLETED" | "COMPLETE" | "SUCCEEDED" => Self::Completed,
            "FAILED" | "ERROR" | "CANCELED" | "CANCELLED" => Self::Failed,
            _ => Self::Pending,
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryFile {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Query {
    pub id: String,
    pub status: QueryStatus,
    #[serde(default)]
    pub files: Vec<QueryFile>,
}

impl Query {
    /// Reads `id`, `status` (or `state`) and `files` from an authority payload.
    pub fn from_wire(payload: &Value) -> Option<Self> {
        let id = payload
            .get("id")
            .and_then(|value| match value {
                Value::String(text) => Some(text.trim().to_string()),
                Value::Number(number) => Some(number.to_string()),
                _ => None,
            })
            .filter(|value| !value.is_empty())?;
        let status = QueryStatus::from_wire(
            payload
                .get("status")
                .or_else(|| payload.get("state"))
                .and_then(Value::as_str),
        );
        let files = payload
            .get("files")
            .and_then(Value::as_array)
            .map(|rows| rows.iter().filter_map(query_file_from_wire).collect())
            .unwrap_or_default();
        Some(Self { id, status, files })
    }
}

fn query_file_from_wire(row: &Value) -> Option<QueryFile> {
    let id = row
        .get("id")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())?
        .to_string();
    let content_type = row
        .get("type")
        .or_else(|| row.get("content_type"))
        .and_then(Value::as_str)
        .map(str::to_string);
    Some(QueryFile { id, content_type })
}

/// A fetched result file. Immutable once constructed.
#[derive(Clone, PartialEq, Eq)]
pub struct Artifact {
    pub query_id: String,
    pub file_id: String,
    pub bytes: Vec<u8>,
    pub content_type: String,
}

impl Artifact {
    pub fn is_image(&self) -> bool {
        self.content_type
            .trim()
            .to_ascii_lowercase()
            .starts_with("image/")
    }
}

impl fmt::Debug for Artifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Artifact")
            .field("query_id", &self.query_id)
            .field("file_id", &self.file_id)
            .field("len", &self.bytes.len())
            .field("content_type", &self.content_type)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use serde_json::json;

    use super::*;

    fn subject() -> SubjectFields {
        SubjectFields {
            given_name: "Grant".to_string(),
            family_name: "Bogisich".to_string(),
            date_of_birth: "1995-09-05".to_string(),
            address_lines: vec!["710 Batz Estate".to_string()],
            address_city: "Harwich".to_string(),
            address_state: "MA".to_string(),
            postal_code: "02645".to_string(),
            gender: Some("Male".to_string()),
            ..SubjectFields::default()
        }
    }

    #[test]
    fn complete_subject_has_no_missing_fields() {
        assert!(subject().missing_fields().is_empty());
    }

    #[test]
    fn missing_minimum_fields_are_named() {
        let mut fields = subject();
        fields.family_name = " ".to_string();
        fields.date_of_birth = "09/05/1995".to_string();
        fields.address_lines = vec![String::new()];
        assert_eq!(
            fields.missing_fields(),
            vec!["family_name", "date_of_birth", "address_lines"]
        );
    }

    #[test]
    fn subject_serializes_with_authority_keys() -> anyhow::Result<()> {
        let value = serde_json::to_value(subject())?;
        assert_eq!(value["given_name"], json!("Grant"));
        assert_eq!(value["address_lines"], json!(["710 Batz Estate"]));
        assert!(value.get("email").is_none());
        Ok(())
    }

    #[test]
    fn status_vocabulary_maps_to_three_states() {
        assert_eq!(QueryStatus::from_wire(Some("COMPLETE")), QueryStatus::Completed);
        assert_eq!(QueryStatus::from_wire(Some("completed")), QueryStatus::Completed);
        assert_eq!(QueryStatus::from_wire(Some("FAILED")), QueryStatus::Failed);
        assert_eq!(QueryStatus::from_wire(Some("RUNNING")), QueryStatus::Pending);
        assert_eq!(QueryStatus::from_wire(None), QueryStatus::Pending);
        assert!(!QueryStatus::Pending.is_terminal());
    }

    #[test]
    fn query_reads_state_fallback_and_files() {
        let query = Query::from_wire(&json!({
            "id": "query-456",
            "state": "COMPLETE",
            "files": [{"id": "file-123", "type": "application/pdf"}, {"type": "image/png"}]
        }))
        .unwrap_or_else(|| panic!("query should parse"));
        assert_eq!(query.id, "query-456");
        assert_eq!(query.status, QueryStatus::Completed);
        assert_eq!(query.files.len(), 1);
        assert_eq!(query.files[0].content_type.as_deref(), Some("application/pdf"));
    }

    #[test]
    fn query_without_id_is_rejected() {
        assert!(Query::from_wire(&json!({"status": "PENDING"})).is_none());
        assert!(Query::from_wire(&json!({"id": ""})).is_none());
    }

    #[test]
    fn credential_expiry_only_applies_with_a_lifetime() {
        let forever = Credential::new("abc", None);
        assert!(!forever.is_expired_at(Utc::now() + Duration::days(365)));

        let short = Credential::new("abc", Some(60));
        assert!(!short.is_expired_at(short.acquired_at + Duration::seconds(59)));
        assert!(short.is_expired_at(short.acquired_at + Duration::seconds(60)));
    }

    #[test]
    fn credential_debug_redacts_token() {
        let rendered = format!("{:?}", Credential::new("secret-token", None));
        assert!(!rendered.contains("secret-token"));
    }
}
