use serde_json::{Map, Value};

use super::datatypes::{Check, Checker, RESOURCE_BASE_FIELDS};
use super::{ResourceKind, ResourceSchema, ValidationIssue};

const STATUS_CODES: &[&str] = &[
    "registered",
    "partial",
    "preliminary",
    "final",
    "amended",
    "corrected",
    "appended",
    "cancelled",
    "entered-in-error",
    "unknown",
];

const FIELDS: &[&str] = &[
    "identifier",
    "basedOn",
    "status",
    "category",
    "code",
    "subject",
    "encounter",
    "effectiveDateTime",
    "effectivePeriod",
    "issued",
    "performer",
    "resultsInterpreter",
    "specimen",
    "result",
    "imagingStudy",
    "media",
    "conclusion",
    "conclusionCode",
    "presentedForm",
];

const EFFECTIVE_VARIANTS: &[(&str, Check)] = &[
    ("DateTime", Checker::date_time),
    ("Period", Checker::period),
];

pub struct DiagnosticReportSchema;

impl ResourceSchema for DiagnosticReportSchema {
    fn kind(&self) -> ResourceKind {
        ResourceKind::DiagnosticReport
    }

    fn check(&self, resource: &Map<String, Value>) -> Vec<ValidationIssue> {
        let path = "DiagnosticReport";
        let mut checker = Checker::new();
        let allowed = [RESOURCE_BASE_FIELDS, FIELDS].concat();
        checker.known_fields(path, resource, &allowed);
        checker.resource_base(path, resource);

        checker.require(path, resource, "status", |checker, path, value| {
            checker.code_in(path, value, STATUS_CODES)
        });
        checker.require(path, resource, "code", Checker::codeable_concept);

        checker.optional_list(path, resource, "identifier", Checker::identifier);
        checker.optional_list(path, resource, "category", Checker::codeable_concept);
        checker.optional(path, resource, "subject", Checker::reference);
        checker.optional(path, resource, "encounter", Checker::reference);
        checker.choice(path, resource, "effective", EFFECTIVE_VARIANTS);
        checker.optional(path, resource, "issued", Checker::instant);
        for field in [
            "basedOn",
            "performer",
            "resultsInterpreter",
            "specimen",
            "result",
            "imagingStudy",
        ] {
            checker.optional_list(path, resource, field, Checker::reference);
        }
        checker.optional_list(path, resource, "media", media);
        checker.optional(path, resource, "conclusion", Checker::string);
        checker.optional_list(path, resource, "conclusionCode", Checker::codeable_concept);
        checker.optional_list(path, resource, "presentedForm", Checker::attachment);

        checker.into_issues()
    }
}

fn media(checker: &mut Checker, path: &str, value: &Value) {
    let Some(obj) = checker.object(path, value) else {
        return;
    };
    checker.known_fields(path, obj, &["id", "extension", "comment", "link"]);
    checker.optional(path, obj, "comment", Checker::string);
    checker.require(path, obj, "link", Checker::reference);
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::super::fixtures;
    use super::super::{validate_value, ResourceKind, ResourceSchema};
    use super::DiagnosticReportSchema;

    fn issue_paths(payload: &serde_json::Value) -> Vec<String> {
        validate_value(payload)
            .issues
            .into_iter()
            .map(|issue| issue.path)
            .collect()
    }

    #[test]
    fn schema_reports_its_kind() {
        assert_eq!(DiagnosticReportSchema.kind(), ResourceKind::DiagnosticReport);
    }

    #[test]
    fn singular_category_object_is_rejected() {
        let mut payload = fixtures::diagnostic_report();
        payload["category"] = json!({
            "coding": [{
                "system": "http://hl7.org/fhir/ValueSet/diagnostic-service-sections",
                "code": "LAB",
                "display": "Laboratory"
            }]
        });
        let result = validate_value(&payload);
        assert!(!result.valid);
        assert_eq!(
            result.message,
            "DiagnosticReport JSON validation failed: DiagnosticReport.category: expected array, found object"
        );
    }

    #[test]
    fn appended_status_is_report_only() {
        let mut payload = fixtures::diagnostic_report();
        payload["status"] = json!("appended");
        assert!(validate_value(&payload).valid);

        let mut observation = fixtures::observation();
        observation["status"] = json!("appended");
        assert!(!validate_value(&observation).valid);
    }

    #[test]
    fn results_must_be_references() {
        let mut payload = fixtures::diagnostic_report();
        payload["result"] = json!(["Observation/1"]);
        assert_eq!(issue_paths(&payload), vec!["DiagnosticReport.result[0]"]);
    }

    #[test]
    fn presented_form_is_checked_as_attachment() {
        let mut payload = fixtures::diagnostic_report();
        payload["presentedForm"] = json!([{"contentType": "application/pdf", "size": "12kb"}]);
        assert_eq!(
            issue_paths(&payload),
            vec!["DiagnosticReport.presentedForm[0].size"]
        );
    }

    #[test]
    fn effective_period_and_date_time_conflict() {
        let mut payload = fixtures::diagnostic_report();
        payload["effectivePeriod"] = json!({"start": "2015-01-12"});
        assert_eq!(issue_paths(&payload), vec!["DiagnosticReport.effective[x]"]);
    }
}
