use chrono::{DateTime, NaiveDate};
use serde_json::{Map, Value};

use super::ValidationIssue;

pub(crate) type Check = fn(&mut Checker, &str, &Value);

pub(crate) const RESOURCE_BASE_FIELDS: &[&str] = &[
    "resourceType",
    "id",
    "meta",
    "implicitRules",
    "language",
    "text",
    "contained",
    "extension",
    "modifierExtension",
];

pub(crate) fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Collects structural issues while walking a resource.
#[derive(Debug, Default)]
pub(crate) struct Checker {
    issues: Vec<ValidationIssue>,
}

impl Checker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_issues(self) -> Vec<ValidationIssue> {
        self.issues
    }

    pub fn issue(&mut self, path: &str, problem: impl Into<String>) {
        self.issues.push(ValidationIssue {
            path: path.to_string(),
            problem: problem.into(),
        });
    }

    fn wrong_type(&mut self, path: &str, expected: &str, found: &Value) {
        self.issue(
            path,
            format!("expected {expected}, found {}", json_type_name(found)),
        );
    }

    pub fn object<'v>(&mut self, path: &str, value: &'v Value) -> Option<&'v Map<String, Value>> {
        match value.as_object() {
            Some(obj) if obj.is_empty() => {
                self.issue(path, "object must not be empty");
                None
            }
            Some(obj) => Some(obj),
            None => {
                self.wrong_type(path, "object", value);
                None
            }
        }
    }

    pub fn array<'v>(&mut self, path: &str, value: &'v Value) -> Option<&'v [Value]> {
        match value.as_array() {
            Some(items) if items.is_empty() => {
                self.issue(path, "array must not be empty");
                None
            }
            Some(items) => Some(items.as_slice()),
            None => {
                self.wrong_type(path, "array", value);
                None
            }
        }
    }

    pub fn each(&mut self, path: &str, value: &Value, check: Check) {
        let Some(items) = self.array(path, value) else {
            return;
        };
        for (idx, item) in items.iter().enumerate() {
            check(self, &format!("{path}[{idx}]"), item);
        }
    }

    fn text<'v>(&mut self, path: &str, value: &'v Value) -> Option<&'v str> {
        match value.as_str() {
            Some(text) if text.trim().is_empty() => {
                self.issue(path, "string must not be empty");
                None
            }
            Some(text) => Some(text),
            None => {
                self.wrong_type(path, "string", value);
                None
            }
        }
    }

    pub fn string(&mut self, path: &str, value: &Value) {
        self.text(path, value);
    }

    pub fn boolean(&mut self, path: &str, value: &Value) {
        if !value.is_boolean() {
            self.wrong_type(path, "boolean", value);
        }
    }

    pub fn decimal(&mut self, path: &str, value: &Value) {
        if !value.is_number() {
            self.wrong_type(path, "number", value);
        }
    }

    pub fn integer(&mut self, path: &str, value: &Value) {
        if !(value.is_i64() || value.is_u64()) {
            self.wrong_type(path, "integer", value);
        }
    }

    pub fn code_in(&mut self, path: &str, value: &Value, allowed: &[&str]) {
        let Some(code) = self.text(path, value) else {
            return;
        };
        if !allowed.contains(&code) {
            self.issue(
                path,
                format!("'{code}' is not one of {}", allowed.join(", ")),
            );
        }
    }

    pub fn id(&mut self, path: &str, value: &Value) {
        let Some(id) = self.text(path, value) else {
            return;
        };
        let well_formed = id.len() <= 64
            && id
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '.');
        if !well_formed {
            self.issue(path, format!("'{id}' is not a valid id"));
        }
    }

    pub fn date_time(&mut self, path: &str, value: &Value) {
        let Some(raw) = self.text(path, value) else {
            return;
        };
        if !is_fhir_date_time(raw) {
            self.issue(path, format!("'{raw}' is not a valid dateTime"));
        }
    }

    pub fn instant(&mut self, path: &str, value: &Value) {
        let Some(raw) = self.text(path, value) else {
            return;
        };
        if DateTime::parse_from_rfc3339(raw).is_err() {
            self.issue(
                path,
                format!("'{raw}' is not a valid instant (timezone required)"),
            );
        }
    }

    pub fn required<'v>(
        &mut self,
        path: &str,
        obj: &'v Map<String, Value>,
        field: &str,
    ) -> Option<&'v Value> {
        match obj.get(field) {
            Some(Value::Null) | None => {
                self.issue(&format!("{path}.{field}"), "required field is missing");
                None
            }
            Some(value) => Some(value),
        }
    }

    pub fn require(&mut self, path: &str, obj: &Map<String, Value>, field: &str, check: Check) {
        if let Some(value) = self.required(path, obj, field) {
            check(self, &format!("{path}.{field}"), value);
        }
    }

    pub fn optional(&mut self, path: &str, obj: &Map<String, Value>, field: &str, check: Check) {
        if let Some(value) = obj.get(field) {
            check(self, &format!("{path}.{field}"), value);
        }
    }

    pub fn optional_list(
        &mut self,
        path: &str,
        obj: &Map<String, Value>,
        field: &str,
        check: Check,
    ) {
        if let Some(value) = obj.get(field) {
            self.each(&format!("{path}.{field}"), value, check);
        }
    }

    /// `value[x]`-style choice: at most one variant may be present.
    pub fn choice(
        &mut self,
        path: &str,
        obj: &Map<String, Value>,
        prefix: &str,
        variants: &[(&str, Check)],
    ) {
        let present: Vec<&(&str, Check)> = variants
            .iter()
            .filter(|(suffix, _)| obj.contains_key(&format!("{prefix}{suffix}")))
            .collect();
        if present.len() > 1 {
            let names = present
                .iter()
                .map(|(suffix, _)| format!("{prefix}{suffix}"))
                .collect::<Vec<String>>()
                .join(", ");
            self.issue(
                &format!("{path}.{prefix}[x]"),
                format!("only one of {names} may be present"),
            );
        }
        for (suffix, check) in present {
            let field = format!("{prefix}{suffix}");
            if let Some(value) = obj.get(&field) {
                check(self, &format!("{path}.{field}"), value);
            }
        }
    }

    /// Rejects keys outside `allowed`; `_field` primitive extensions follow their base field.
    pub fn known_fields(&mut self, path: &str, obj: &Map<String, Value>, allowed: &[&str]) {
        for key in obj.keys() {
            let base = key.strip_prefix('_').unwrap_or(key);
            if !allowed.contains(&base) {
                self.issue(&format!("{path}.{key}"), "unknown field");
            }
        }
    }

    pub fn resource_base(&mut self, path: &str, obj: &Map<String, Value>) {
        self.optional(path, obj, "id", Checker::id);
        self.optional(path, obj, "meta", Checker::any_object);
        self.optional(path, obj, "implicitRules", Checker::string);
        self.optional(path, obj, "language", Checker::string);
        self.optional(path, obj, "text", Checker::narrative);
        self.optional_list(path, obj, "contained", Checker::any_object);
        self.optional_list(path, obj, "extension", Checker::extension);
        self.optional_list(path, obj, "modifierExtension", Checker::extension);
    }

    pub fn any_object(&mut self, path: &str, value: &Value) {
        self.object(path, value);
    }

    pub fn extension(&mut self, path: &str, value: &Value) {
        let Some(obj) = self.object(path, value) else {
            return;
        };
        self.require(path, obj, "url", Checker::string);
    }

    pub fn narrative(&mut self, path: &str, value: &Value) {
        let Some(obj) = self.object(path, value) else {
            return;
        };
        self.known_fields(path, obj, &["id", "extension", "status", "div"]);
        self.require(path, obj, "status", |checker, path, value| {
            checker.code_in(path, value, &["generated", "extensions", "additional", "empty"])
        });
        self.require(path, obj, "div", Checker::string);
    }

    pub fn coding(&mut self, path: &str, value: &Value) {
        let Some(obj) = self.object(path, value) else {
            return;
        };
        self.known_fields(
            path,
            obj,
            &["id", "extension", "system", "version", "code", "display", "userSelected"],
        );
        self.optional_list(path, obj, "extension", Checker::extension);
        for field in ["system", "version", "code", "display"] {
            self.optional(path, obj, field, Checker::string);
        }
        self.optional(path, obj, "userSelected", Checker::boolean);
    }

    pub fn codeable_concept(&mut self, path: &str, value: &Value) {
        let Some(obj) = self.object(path, value) else {
            return;
        };
        self.known_fields(path, obj, &["id", "extension", "coding", "text"]);
        self.optional_list(path, obj, "extension", Checker::extension);
        self.optional_list(path, obj, "coding", Checker::coding);
        self.optional(path, obj, "text", Checker::string);
    }

    pub fn identifier(&mut self, path: &str, value: &Value) {
        let Some(obj) = self.object(path, value) else {
            return;
        };
        self.known_fields(
            path,
            obj,
            &["id", "extension", "use", "type", "system", "value", "period", "assigner"],
        );
        self.optional(path, obj, "use", |checker, path, value| {
            checker.code_in(path, value, &["usual", "official", "temp", "secondary", "old"])
        });
        self.optional(path, obj, "type", Checker::codeable_concept);
        self.optional(path, obj, "system", Checker::string);
        self.optional(path, obj, "value", Checker::string);
        self.optional(path, obj, "period", Checker::period);
        self.optional(path, obj, "assigner", Checker::reference);
    }

    pub fn reference(&mut self, path: &str, value: &Value) {
        let Some(obj) = self.object(path, value) else {
            return;
        };
        self.known_fields(
            path,
            obj,
            &["id", "extension", "reference", "type", "identifier", "display"],
        );
        self.optional(path, obj, "reference", Checker::string);
        self.optional(path, obj, "type", Checker::string);
        self.optional(path, obj, "identifier", Checker::identifier);
        self.optional(path, obj, "display", Checker::string);
    }

    pub fn quantity(&mut self, path: &str, value: &Value) {
        let Some(obj) = self.object(path, value) else {
            return;
        };
        self.known_fields(
            path,
            obj,
            &["id", "extension", "value", "comparator", "unit", "system", "code"],
        );
        self.optional(path, obj, "value", Checker::decimal);
        self.optional(path, obj, "comparator", |checker, path, value| {
            checker.code_in(path, value, &["<", "<=", ">=", ">"])
        });
        for field in ["unit", "system", "code"] {
            self.optional(path, obj, field, Checker::string);
        }
    }

    pub fn period(&mut self, path: &str, value: &Value) {
        let Some(obj) = self.object(path, value) else {
            return;
        };
        self.known_fields(path, obj, &["id", "extension", "start", "end"]);
        self.optional(path, obj, "start", Checker::date_time);
        self.optional(path, obj, "end", Checker::date_time);
    }

    pub fn range(&mut self, path: &str, value: &Value) {
        let Some(obj) = self.object(path, value) else {
            return;
        };
        self.known_fields(path, obj, &["id", "extension", "low", "high"]);
        self.optional(path, obj, "low", Checker::quantity);
        self.optional(path, obj, "high", Checker::quantity);
    }

    pub fn ratio(&mut self, path: &str, value: &Value) {
        let Some(obj) = self.object(path, value) else {
            return;
        };
        self.known_fields(path, obj, &["id", "extension", "numerator", "denominator"]);
        self.optional(path, obj, "numerator", Checker::quantity);
        self.optional(path, obj, "denominator", Checker::quantity);
    }

    pub fn annotation(&mut self, path: &str, value: &Value) {
        let Some(obj) = self.object(path, value) else {
            return;
        };
        self.known_fields(
            path,
            obj,
            &["id", "extension", "authorReference", "authorString", "time", "text"],
        );
        self.require(path, obj, "text", Checker::string);
        self.choice(
            path,
            obj,
            "author",
            &[("Reference", Checker::reference), ("String", Checker::string)],
        );
        self.optional(path, obj, "time", Checker::date_time);
    }

    pub fn attachment(&mut self, path: &str, value: &Value) {
        let Some(obj) = self.object(path, value) else {
            return;
        };
        self.known_fields(
            path,
            obj,
            &[
                "id",
                "extension",
                "contentType",
                "language",
                "data",
                "url",
                "size",
                "hash",
                "title",
                "creation",
            ],
        );
        for field in ["contentType", "language", "data", "url", "hash", "title"] {
            self.optional(path, obj, field, Checker::string);
        }
        self.optional(path, obj, "size", Checker::integer);
        self.optional(path, obj, "creation", Checker::date_time);
    }
}

/// FHIR `dateTime`: `YYYY`, `YYYY-MM`, `YYYY-MM-DD`, or a full timestamp with offset.
pub(crate) fn is_fhir_date_time(raw: &str) -> bool {
    let raw = raw.trim();
    match raw.len() {
        4 => raw.chars().all(|ch| ch.is_ascii_digit()),
        7 => NaiveDate::parse_from_str(&format!("{raw}-01"), "%Y-%m-%d").is_ok(),
        10 => NaiveDate::parse_from_str(raw, "%Y-%m-%d").is_ok(),
        _ => DateTime::parse_from_rfc3339(raw).is_ok(),
    }
}
