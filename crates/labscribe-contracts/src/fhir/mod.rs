mod datatypes;
mod diagnostic_report;
mod observation;

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub use diagnostic_report::DiagnosticReportSchema;
pub use observation::ObservationSchema;

pub const RESOURCE_TYPE_FIELD: &str = "resourceType";

/// Declared type of a FHIR payload, taken from its `resourceType` field.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    Observation,
    DiagnosticReport,
    Unsupported(String),
}

impl ResourceKind {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "Observation" => Self::Observation,
            "DiagnosticReport" => Self::DiagnosticReport,
            other => Self::Unsupported(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Observation => "Observation",
            Self::DiagnosticReport => "DiagnosticReport",
            Self::Unsupported(raw) => raw.as_str(),
        }
    }

    pub fn schema(&self) -> Option<&'static dyn ResourceSchema> {
        match self {
            Self::Observation => Some(&ObservationSchema),
            Self::DiagnosticReport => Some(&DiagnosticReportSchema),
            Self::Unsupported(_) => None,
        }
    }

    pub fn structural_check(&self, resource: &Map<String, Value>) -> ValidationResult {
        let Some(schema) = self.schema() else {
            return ValidationResult::invalid(
                Some(self.clone()),
                format!(
                    "Unsupported resource type '{}'. Only 'Observation' and 'DiagnosticReport' are supported.",
                    self.as_str()
                ),
                Vec::new(),
            );
        };
        let issues = schema.check(resource);
        if issues.is_empty() {
            return ValidationResult::valid(self.clone());
        }
        let detail = issues
            .iter()
            .map(ValidationIssue::to_string)
            .collect::<Vec<String>>()
            .join("; ");
        ValidationResult::invalid(
            Some(self.clone()),
            format!("{} JSON validation failed: {detail}", self.as_str()),
            issues,
        )
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structural rules for one resource kind.
pub trait ResourceSchema: Sync {
    fn kind(&self) -> ResourceKind;
    fn check(&self, resource: &Map<String, Value>) -> Vec<ValidationIssue>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub path: String,
    pub problem: String,
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.problem)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub kind: Option<ResourceKind>,
    pub message: String,
    pub valid: bool,
    #[serde(default)]
    pub issues: Vec<ValidationIssue>,
}

impl ValidationResult {
    pub fn valid(kind: ResourceKind) -> Self {
        Self {
            message: format!("{kind} JSON is valid"),
            kind: Some(kind),
            valid: true,
            issues: Vec::new(),
        }
    }

    pub fn invalid(
        kind: Option<ResourceKind>,
        message: impl Into<String>,
        issues: Vec<ValidationIssue>,
    ) -> Self {
        Self {
            kind,
            message: message.into(),
            valid: false,
            issues,
        }
    }
}

/// Validates raw payload text. Never panics and never errors; every failure
/// is folded into the returned result.
pub fn validate(payload: &str) -> ValidationResult {
    match serde_json::from_str::<Value>(payload) {
        Ok(value) => validate_value(&value),
        Err(err) => ValidationResult::invalid(
            None,
            format!("Error: payload is not valid JSON ({err})."),
            Vec::new(),
        ),
    }
}

pub fn validate_value(payload: &Value) -> ValidationResult {
    let Some(resource) = payload.as_object() else {
        return ValidationResult::invalid(
            None,
            format!(
                "Error: expected a JSON object with '{RESOURCE_TYPE_FIELD}', found {}.",
                datatypes::json_type_name(payload)
            ),
            Vec::new(),
        );
    };
    let declared = resource
        .get(RESOURCE_TYPE_FIELD)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty());
    let Some(declared) = declared else {
        return ValidationResult::invalid(
            None,
            format!("Error: '{RESOURCE_TYPE_FIELD}' key is missing in the provided JSON."),
            vec![ValidationIssue {
                path: RESOURCE_TYPE_FIELD.to_string(),
                problem: "required field is missing".to_string(),
            }],
        );
    };
    ResourceKind::parse(declared).structural_check(resource)
}
