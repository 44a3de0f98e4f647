use anyhow::bail;
use serde_json::{json, Map, Value};

use super::LocalTool;
use crate::fhir::{validate, validate_value};

pub const VALIDATE_TOOL_NAME: &str = "validate_hl7_fhir_json";

/// Exposes the resource validator to the model.
pub struct ValidateResourceTool;

impl LocalTool for ValidateResourceTool {
    fn name(&self) -> &str {
        VALIDATE_TOOL_NAME
    }

    fn description(&self) -> &str {
        "Validate HL7 FHIR JSON (Observation or DiagnosticReport). Returns a message describing the validity of the provided JSON and whether it is valid."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "fhir_json": {
                    "type": "string",
                    "description": "The FHIR resource, serialized as a JSON string."
                }
            },
            "required": ["fhir_json"],
            "additionalProperties": false
        })
    }

    fn invoke(&self, arguments: &Map<String, Value>) -> anyhow::Result<Value> {
        let result = match arguments.get("fhir_json") {
            Some(Value::String(raw)) => validate(raw),
            Some(value @ Value::Object(_)) => validate_value(value),
            Some(other) => bail!(
                "'fhir_json' must be a string or object, got {}",
                match other {
                    Value::Array(_) => "array",
                    Value::Number(_) => "number",
                    Value::Bool(_) => "boolean",
                    _ => "null",
                }
            ),
            None => bail!("missing required argument 'fhir_json'"),
        };
        Ok(json!({
            "message": result.message,
            "valid": result.valid,
            "resource_type": result.kind.as_ref().map(|kind| kind.as_str().to_string()),
        }))
    }
}
