use serde_json::{Map, Value};

use super::datatypes::{Check, Checker, RESOURCE_BASE_FIELDS};
use super::{ResourceKind, ResourceSchema, ValidationIssue};

const STATUS_CODES: &[&str] = &[
    "registered",
    "preliminary",
    "final",
    "amended",
    "corrected",
    "cancelled",
    "entered-in-error",
    "unknown",
];

const FIELDS: &[&str] = &[
    "identifier",
    "basedOn",
    "partOf",
    "status",
    "category",
    "code",
    "subject",
    "focus",
    "encounter",
    "effectiveDateTime",
    "effectivePeriod",
    "effectiveTiming",
    "effectiveInstant",
    "issued",
    "performer",
    "dataAbsentReason",
    "interpretation",
    "note",
    "bodySite",
    "method",
    "specimen",
    "device",
    "referenceRange",
    "hasMember",
    "derivedFrom",
    "component",
];

const COMPONENT_FIELDS: &[&str] = &[
    "id",
    "extension",
    "modifierExtension",
    "code",
    "dataAbsentReason",
    "interpretation",
    "referenceRange",
];

const VALUE_FIELDS: &[&str] = &[
    "valueQuantity",
    "valueCodeableConcept",
    "valueString",
    "valueBoolean",
    "valueInteger",
    "valueRange",
    "valueRatio",
    "valueSampledData",
    "valueTime",
    "valueDateTime",
    "valuePeriod",
];

const VALUE_VARIANTS: &[(&str, Check)] = &[
    ("Quantity", Checker::quantity),
    ("CodeableConcept", Checker::codeable_concept),
    ("String", Checker::string),
    ("Boolean", Checker::boolean),
    ("Integer", Checker::integer),
    ("Range", Checker::range),
    ("Ratio", Checker::ratio),
    ("SampledData", Checker::any_object),
    ("Time", Checker::string),
    ("DateTime", Checker::date_time),
    ("Period", Checker::period),
];

const EFFECTIVE_VARIANTS: &[(&str, Check)] = &[
    ("DateTime", Checker::date_time),
    ("Period", Checker::period),
    ("Timing", Checker::any_object),
    ("Instant", Checker::instant),
];

pub struct ObservationSchema;

impl ResourceSchema for ObservationSchema {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Observation
    }

    fn check(&self, resource: &Map<String, Value>) -> Vec<ValidationIssue> {
        let path = "Observation";
        let mut checker = Checker::new();
        let allowed = [RESOURCE_BASE_FIELDS, FIELDS, VALUE_FIELDS].concat();
        checker.known_fields(path, resource, &allowed);
        checker.resource_base(path, resource);

        checker.require(path, resource, "status", |checker, path, value| {
            checker.code_in(path, value, STATUS_CODES)
        });
        checker.require(path, resource, "code", Checker::codeable_concept);

        checker.optional_list(path, resource, "identifier", Checker::identifier);
        for field in ["basedOn", "partOf", "focus", "performer", "hasMember", "derivedFrom"] {
            checker.optional_list(path, resource, field, Checker::reference);
        }
        checker.optional_list(path, resource, "category", Checker::codeable_concept);
        for field in ["subject", "encounter", "specimen", "device"] {
            checker.optional(path, resource, field, Checker::reference);
        }
        checker.choice(path, resource, "effective", EFFECTIVE_VARIANTS);
        checker.optional(path, resource, "issued", Checker::instant);
        checker.choice(path, resource, "value", VALUE_VARIANTS);
        for field in ["dataAbsentReason", "bodySite", "method"] {
            checker.optional(path, resource, field, Checker::codeable_concept);
        }
        checker.optional_list(path, resource, "interpretation", Checker::codeable_concept);
        checker.optional_list(path, resource, "note", Checker::annotation);
        checker.optional_list(path, resource, "referenceRange", reference_range);
        checker.optional_list(path, resource, "component", component);

        if resource.contains_key("dataAbsentReason")
            && VALUE_VARIANTS
                .iter()
                .any(|(suffix, _)| resource.contains_key(&format!("value{suffix}")))
        {
            checker.issue(
                &format!("{path}.dataAbsentReason"),
                "must not be present when a value[x] is present",
            );
        }

        checker.into_issues()
    }
}

fn reference_range(checker: &mut Checker, path: &str, value: &Value) {
    let Some(obj) = checker.object(path, value) else {
        return;
    };
    checker.known_fields(
        path,
        obj,
        &["id", "extension", "low", "high", "type", "appliesTo", "age", "text"],
    );
    checker.optional(path, obj, "low", Checker::quantity);
    checker.optional(path, obj, "high", Checker::quantity);
    checker.optional(path, obj, "type", Checker::codeable_concept);
    checker.optional_list(path, obj, "appliesTo", Checker::codeable_concept);
    checker.optional(path, obj, "age", Checker::range);
    checker.optional(path, obj, "text", Checker::string);
    if !["low", "high", "text"].iter().any(|field| obj.contains_key(*field)) {
        checker.issue(path, "must have at least a low, a high, or a text");
    }
}

fn component(checker: &mut Checker, path: &str, value: &Value) {
    let Some(obj) = checker.object(path, value) else {
        return;
    };
    let allowed = [COMPONENT_FIELDS, VALUE_FIELDS].concat();
    checker.known_fields(path, obj, &allowed);
    checker.require(path, obj, "code", Checker::codeable_concept);
    checker.choice(path, obj, "value", VALUE_VARIANTS);
    checker.optional(path, obj, "dataAbsentReason", Checker::codeable_concept);
    checker.optional_list(path, obj, "interpretation", Checker::codeable_concept);
    checker.optional_list(path, obj, "referenceRange", reference_range);
}
