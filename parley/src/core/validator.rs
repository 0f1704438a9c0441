//! Strict validation of one agent message.
//!
//! Stages run in a fixed order and each stage fails the whole message:
//!
//! 1. parse exactly one JSON object
//! 2. `schema_version` matches the output kind
//! 3. required fields, types, enums, unknown fields
//! 4. evidence gates (`{command, result}` pairs, review floor)
//! 5. cross-field consistency
//!
//! A compiled JSON Schema runs last as a backstop. Nothing is repaired: a
//! failure is reported back to the agent and the turn is retried.

use std::fmt;

use jsonschema::Draft;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::core::envelope::schema_version;
use crate::core::message::{
    Acceptance, GateDecision, MessageBody, ReviewMessage, ValidatedMessage,
};
use crate::core::schema::{
    ACCEPTANCE_VALUES, GATE_DECISION_VALUES, MIN_REVIEW_VERIFICATION, SEVERITY_VALUES,
    STATUS_VALUES, output_schema,
};
use crate::core::types::OutputKind;

/// Stable machine-readable validation codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValidationCode {
    #[serde(rename = "E_SCHEMA_PARSE")]
    SchemaParse,
    #[serde(rename = "E_SCHEMA_VERSION_MISMATCH")]
    SchemaVersion,
    #[serde(rename = "E_SCHEMA_MISSING_FIELD")]
    MissingField,
    #[serde(rename = "E_SCHEMA_INVALID_TYPE")]
    InvalidType,
    #[serde(rename = "E_SCHEMA_INVALID_ENUM")]
    InvalidEnum,
    #[serde(rename = "E_SCHEMA_UNEXPECTED_FIELD")]
    UnexpectedField,
    #[serde(rename = "E_SCHEMA_INVALID_FORMAT")]
    InvalidFormat,
    #[serde(rename = "E_EVIDENCE_MALFORMED")]
    EvidenceMalformed,
    #[serde(rename = "E_REVIEW_EVIDENCE_MISSING")]
    ReviewEvidenceMissing,
    #[serde(rename = "E_REVIEW_GATE_INCONSISTENT")]
    ReviewGateInconsistent,
    #[serde(rename = "E_SAFETY_COMMAND_DENIED")]
    SafetyCommandDenied,
    #[serde(rename = "E_SAFETY_COMMAND_NOT_ALLOWED")]
    SafetyCommandNotAllowed,
    #[serde(rename = "E_WORKDIR_COMMAND_OUTSIDE")]
    WorkdirCommandOutside,
    #[serde(rename = "E_DELIVERY_INVALID_DELIVERABLES")]
    DeliveryInvalidDeliverable,
    #[serde(rename = "E_DELIVERY_OUTSIDE_WORKDIR")]
    DeliveryOutsideWorkdir,
    #[serde(rename = "E_DELIVERY_MISSING_DELIVERABLE")]
    DeliveryMissingDeliverable,
    #[serde(rename = "E_DELIVERY_EXPECT_DIR")]
    DeliveryExpectDir,
    #[serde(rename = "E_DELIVERY_EXPECT_FILE")]
    DeliveryExpectFile,
}

impl ValidationCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ValidationCode::SchemaParse => "E_SCHEMA_PARSE",
            ValidationCode::SchemaVersion => "E_SCHEMA_VERSION_MISMATCH",
            ValidationCode::MissingField => "E_SCHEMA_MISSING_FIELD",
            ValidationCode::InvalidType => "E_SCHEMA_INVALID_TYPE",
            ValidationCode::InvalidEnum => "E_SCHEMA_INVALID_ENUM",
            ValidationCode::UnexpectedField => "E_SCHEMA_UNEXPECTED_FIELD",
            ValidationCode::InvalidFormat => "E_SCHEMA_INVALID_FORMAT",
            ValidationCode::EvidenceMalformed => "E_EVIDENCE_MALFORMED",
            ValidationCode::ReviewEvidenceMissing => "E_REVIEW_EVIDENCE_MISSING",
            ValidationCode::ReviewGateInconsistent => "E_REVIEW_GATE_INCONSISTENT",
            ValidationCode::SafetyCommandDenied => "E_SAFETY_COMMAND_DENIED",
            ValidationCode::SafetyCommandNotAllowed => "E_SAFETY_COMMAND_NOT_ALLOWED",
            ValidationCode::WorkdirCommandOutside => "E_WORKDIR_COMMAND_OUTSIDE",
            ValidationCode::DeliveryInvalidDeliverable => "E_DELIVERY_INVALID_DELIVERABLES",
            ValidationCode::DeliveryOutsideWorkdir => "E_DELIVERY_OUTSIDE_WORKDIR",
            ValidationCode::DeliveryMissingDeliverable => "E_DELIVERY_MISSING_DELIVERABLE",
            ValidationCode::DeliveryExpectDir => "E_DELIVERY_EXPECT_DIR",
            ValidationCode::DeliveryExpectFile => "E_DELIVERY_EXPECT_FILE",
        }
    }
}

impl fmt::Display for ValidationCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One violation, located by a JSONPath-like `path` (`$.verification[1].command`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub code: ValidationCode,
    pub message: String,
    pub path: String,
}

impl ValidationIssue {
    pub fn new(code: ValidationCode, path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            path: path.into(),
        }
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.code, self.path, self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} output rejected: {}", first_issue(.issues))]
pub struct ValidationFailure {
    pub kind: OutputKind,
    pub issues: Vec<ValidationIssue>,
}

fn first_issue(issues: &[ValidationIssue]) -> String {
    match issues {
        [] => "no issues recorded".to_string(),
        [only] => only.to_string(),
        [first, rest @ ..] => format!("{first} (+{} more)", rest.len()),
    }
}

impl ValidationFailure {
    pub fn has(&self, code: ValidationCode) -> bool {
        self.issues.iter().any(|issue| issue.code == code)
    }

    pub fn codes(&self) -> Vec<ValidationCode> {
        self.issues.iter().map(|issue| issue.code).collect()
    }

    /// Bullet list for the repair prompt.
    pub fn render(&self) -> String {
        self.issues
            .iter()
            .map(|issue| format!("- {issue}"))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Validate `raw` as a message of `kind`.
pub fn validate(raw: &str, kind: OutputKind) -> Result<ValidatedMessage, ValidationFailure> {
    let fail = |issues: Vec<ValidationIssue>| ValidationFailure { kind, issues };

    let value = parse_single_object(raw).map_err(|issue| fail(vec![issue]))?;
    let Some(object) = value.as_object() else {
        return Err(fail(vec![ValidationIssue::new(
            ValidationCode::SchemaParse,
            "$",
            format!("expected a JSON object, found {}", type_name(&value)),
        )]));
    };

    check_schema_version(object, kind).map_err(|issue| fail(vec![issue]))?;

    let mut issues = Vec::new();
    check_object(object, fields_for(kind), "$", &mut issues);
    if !issues.is_empty() {
        return Err(fail(issues));
    }

    check_evidence_gates(object, kind, &mut issues);
    if !issues.is_empty() {
        return Err(fail(issues));
    }

    let body = decode_body(&value, kind).map_err(|issue| fail(vec![issue]))?;
    if let MessageBody::Review(review) = &body {
        check_review_consistency(review, &mut issues);
    }
    if !issues.is_empty() {
        return Err(fail(issues));
    }

    issues.extend(schema_backstop(&value, kind));
    if !issues.is_empty() {
        return Err(fail(issues));
    }

    Ok(ValidatedMessage {
        body,
        content: value,
    })
}

/// `serde_json::from_str` rejects any non-whitespace after the first value,
/// so `{"a":1} trailing` and `{..}{..}` both fail here.
fn parse_single_object(raw: &str) -> Result<Value, ValidationIssue> {
    if raw.trim().is_empty() {
        return Err(ValidationIssue::new(
            ValidationCode::SchemaParse,
            "$",
            "empty output",
        ));
    }
    serde_json::from_str::<Value>(raw).map_err(|err| {
        ValidationIssue::new(
            ValidationCode::SchemaParse,
            "$",
            format!("output must be exactly one JSON object: {err}"),
        )
    })
}

fn check_schema_version(
    object: &Map<String, Value>,
    kind: OutputKind,
) -> Result<(), ValidationIssue> {
    let expected = schema_version(kind);
    match object.get("schema_version") {
        None => Err(ValidationIssue::new(
            ValidationCode::MissingField,
            "$.schema_version",
            "missing field: schema_version",
        )),
        Some(Value::String(found)) if found == expected => Ok(()),
        Some(Value::String(found)) => Err(ValidationIssue::new(
            ValidationCode::SchemaVersion,
            "$.schema_version",
            format!("expected '{expected}', found '{found}'"),
        )),
        Some(other) => Err(ValidationIssue::new(
            ValidationCode::InvalidType,
            "$.schema_version",
            format!("expected string, found {}", type_name(other)),
        )),
    }
}

#[derive(Debug, Clone, Copy)]
enum Shape {
    Text,
    Question,
    Enum(&'static [&'static str]),
    TextList { min: usize },
    /// Array whose entries are checked by the evidence stage.
    EvidenceList,
    Object(&'static [Field]),
    ObjectList(&'static [Field]),
}

#[derive(Debug, Clone, Copy)]
struct Field {
    name: &'static str,
    shape: Shape,
    required: bool,
}

const fn req(name: &'static str, shape: Shape) -> Field {
    Field {
        name,
        shape,
        required: true,
    }
}

const fn opt(name: &'static str, shape: Shape) -> Field {
    Field {
        name,
        shape,
        required: false,
    }
}

const PLAN_RESULT_FIELDS: &[Field] = &[
    req("requirement_breakdown", Shape::TextList { min: 1 }),
    req("implementation_scope", Shape::Text),
    req("acceptance_criteria", Shape::TextList { min: 1 }),
    req("handoff_notes", Shape::Text),
];

const DELIVERABLE_FIELDS: &[Field] = &[
    req("path", Shape::Text),
    opt("kind", Shape::Text),
    opt("summary", Shape::Text),
];

const DELIVERY_RESULT_FIELDS: &[Field] = &[
    req("task_understanding", Shape::Text),
    req("implementation_plan", Shape::Text),
    req("execution_evidence", Shape::EvidenceList),
    req("risks_and_rollback", Shape::Text),
    opt("deliverables", Shape::ObjectList(DELIVERABLE_FIELDS)),
];

const PLAN_FIELDS: &[Field] = &[
    req("schema_version", Shape::Text),
    req("status", Shape::Enum(&STATUS_VALUES)),
    req("result", Shape::Object(PLAN_RESULT_FIELDS)),
    req("next_question", Shape::Question),
    req("warnings", Shape::TextList { min: 0 }),
    req("errors", Shape::TextList { min: 0 }),
];

const DELIVERY_FIELDS: &[Field] = &[
    req("schema_version", Shape::Text),
    req("status", Shape::Enum(&STATUS_VALUES)),
    req("result", Shape::Object(DELIVERY_RESULT_FIELDS)),
    req("next_question", Shape::Question),
    req("warnings", Shape::TextList { min: 0 }),
    req("errors", Shape::TextList { min: 0 }),
];

const ISSUE_FIELDS: &[Field] = &[
    opt("id", Shape::Text),
    req("severity", Shape::Enum(&SEVERITY_VALUES)),
    req("summary", Shape::Text),
];

const GATE_FIELDS: &[Field] = &[
    req("decision", Shape::Enum(&GATE_DECISION_VALUES)),
    req("conditions", Shape::TextList { min: 0 }),
];

const REVIEW_FIELDS: &[Field] = &[
    req("schema_version", Shape::Text),
    req("status", Shape::Enum(&STATUS_VALUES)),
    req("acceptance", Shape::Enum(&ACCEPTANCE_VALUES)),
    req("verification", Shape::EvidenceList),
    req("root_cause", Shape::TextList { min: 0 }),
    req("issues", Shape::ObjectList(ISSUE_FIELDS)),
    req("gate", Shape::Object(GATE_FIELDS)),
    req("next_question", Shape::Question),
    req("warnings", Shape::TextList { min: 0 }),
    req("errors", Shape::TextList { min: 0 }),
];

fn fields_for(kind: OutputKind) -> &'static [Field] {
    match kind {
        OutputKind::Plan => PLAN_FIELDS,
        OutputKind::Delivery => DELIVERY_FIELDS,
        OutputKind::Review => REVIEW_FIELDS,
    }
}

fn check_object(
    object: &Map<String, Value>,
    fields: &[Field],
    path: &str,
    issues: &mut Vec<ValidationIssue>,
) {
    for field in fields {
        let field_path = format!("{path}.{}", field.name);
        match object.get(field.name) {
            Some(value) => check_value(value, field.shape, &field_path, issues),
            None if field.required => issues.push(ValidationIssue::new(
                ValidationCode::MissingField,
                field_path,
                format!("missing field: {}", field.name),
            )),
            None => {}
        }
    }
    for key in object.keys() {
        if !fields.iter().any(|field| field.name == key.as_str()) {
            issues.push(ValidationIssue::new(
                ValidationCode::UnexpectedField,
                format!("{path}.{key}"),
                format!("unexpected field: {key}"),
            ));
        }
    }
}

fn check_value(value: &Value, shape: Shape, path: &str, issues: &mut Vec<ValidationIssue>) {
    match shape {
        Shape::Text => {
            if !value.is_string() {
                issues.push(type_issue(path, "string", value));
            }
        }
        Shape::Question => match value.as_str() {
            None => issues.push(type_issue(path, "string", value)),
            Some(question) if question.trim().is_empty() => issues.push(ValidationIssue::new(
                ValidationCode::MissingField,
                path,
                "next_question must be non-empty",
            )),
            Some(question) if !question.contains(|c| c == '?' || c == '？') => {
                issues.push(ValidationIssue::new(
                    ValidationCode::InvalidFormat,
                    path,
                    "next_question must contain a question mark",
                ));
            }
            Some(_) => {}
        },
        Shape::Enum(allowed) => match value.as_str() {
            None => issues.push(type_issue(path, "string", value)),
            Some(found) if !allowed.contains(&found) => issues.push(ValidationIssue::new(
                ValidationCode::InvalidEnum,
                path,
                format!("expected one of [{}], found '{found}'", allowed.join(", ")),
            )),
            Some(_) => {}
        },
        Shape::TextList { min } => match value.as_array() {
            None => issues.push(type_issue(path, "array", value)),
            Some(items) => {
                for (idx, item) in items.iter().enumerate() {
                    if !item.is_string() {
                        issues.push(type_issue(&format!("{path}[{idx}]"), "string", item));
                    }
                }
                if items.len() < min {
                    issues.push(ValidationIssue::new(
                        ValidationCode::InvalidFormat,
                        path,
                        format!("must contain at least {min} item(s)"),
                    ));
                }
            }
        },
        Shape::EvidenceList => {
            if !value.is_array() {
                issues.push(type_issue(path, "array", value));
            }
        }
        Shape::Object(fields) => match value.as_object() {
            None => issues.push(type_issue(path, "object", value)),
            Some(object) => check_object(object, fields, path, issues),
        },
        Shape::ObjectList(fields) => match value.as_array() {
            None => issues.push(type_issue(path, "array", value)),
            Some(items) => {
                for (idx, item) in items.iter().enumerate() {
                    let item_path = format!("{path}[{idx}]");
                    match item.as_object() {
                        Some(object) => check_object(object, fields, &item_path, issues),
                        None => issues.push(type_issue(&item_path, "object", item)),
                    }
                }
            }
        },
    }
}

fn type_issue(path: &str, expected: &str, found: &Value) -> ValidationIssue {
    ValidationIssue::new(
        ValidationCode::InvalidType,
        path,
        format!("expected {expected}, found {}", type_name(found)),
    )
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn check_evidence_gates(
    object: &Map<String, Value>,
    kind: OutputKind,
    issues: &mut Vec<ValidationIssue>,
) {
    match kind {
        OutputKind::Plan => {}
        OutputKind::Delivery => {
            if let Some(entries) = object
                .get("result")
                .and_then(|result| result.get("execution_evidence"))
                .and_then(Value::as_array)
            {
                check_evidence_entries(entries, "$.result.execution_evidence", issues);
            }
        }
        OutputKind::Review => {
            let entries = object
                .get("verification")
                .and_then(Value::as_array)
                .map(Vec::as_slice)
                .unwrap_or_default();
            let well_formed = check_evidence_entries(entries, "$.verification", issues);
            if well_formed < MIN_REVIEW_VERIFICATION {
                issues.push(ValidationIssue::new(
                    ValidationCode::ReviewEvidenceMissing,
                    "$.verification",
                    format!(
                        "review requires at least {MIN_REVIEW_VERIFICATION} well-formed \
                         verification entries, found {well_formed}"
                    ),
                ));
            }
        }
    }
}

/// Flags every malformed entry by index; returns how many were well formed.
fn check_evidence_entries(
    entries: &[Value],
    path: &str,
    issues: &mut Vec<ValidationIssue>,
) -> usize {
    let mut well_formed = 0;
    for (idx, entry) in entries.iter().enumerate() {
        if is_evidence_pair(entry) {
            well_formed += 1;
        } else {
            issues.push(ValidationIssue::new(
                ValidationCode::EvidenceMalformed,
                format!("{path}[{idx}]"),
                format!(
                    "entry {} must be an object with exactly a non-empty string command \
                     and a string result",
                    idx + 1
                ),
            ));
        }
    }
    well_formed
}

fn is_evidence_pair(entry: &Value) -> bool {
    let Some(object) = entry.as_object() else {
        return false;
    };
    let command_ok = object
        .get("command")
        .and_then(Value::as_str)
        .is_some_and(|command| !command.trim().is_empty());
    let result_ok = object.get("result").is_some_and(Value::is_string);
    object.len() == 2 && command_ok && result_ok
}

fn decode_body(value: &Value, kind: OutputKind) -> Result<MessageBody, ValidationIssue> {
    let decoded = match kind {
        OutputKind::Plan => serde_json::from_value(value.clone()).map(MessageBody::Plan),
        OutputKind::Delivery => serde_json::from_value(value.clone()).map(MessageBody::Delivery),
        OutputKind::Review => serde_json::from_value(value.clone()).map(MessageBody::Review),
    };
    decoded.map_err(|err| {
        ValidationIssue::new(
            ValidationCode::InvalidFormat,
            "$",
            format!("decode {kind} message: {err}"),
        )
    })
}

fn check_review_consistency(review: &ReviewMessage, issues: &mut Vec<ValidationIssue>) {
    if review.acceptance == Acceptance::Pass {
        for (idx, issue) in review.issues.iter().enumerate() {
            if issue.severity.is_blocking() {
                issues.push(ValidationIssue::new(
                    ValidationCode::ReviewGateInconsistent,
                    format!("$.issues[{idx}]"),
                    format!(
                        "acceptance=pass while {:?} issue remains open: {}",
                        issue.severity, issue.summary
                    ),
                ));
            }
        }
    }
    if review.acceptance == Acceptance::Fail && review.gate.decision == GateDecision::Allow {
        issues.push(ValidationIssue::new(
            ValidationCode::ReviewGateInconsistent,
            "$.gate.decision",
            "gate.decision=allow contradicts acceptance=fail",
        ));
    }
}

fn schema_backstop(value: &Value, kind: OutputKind) -> Vec<ValidationIssue> {
    let schema = output_schema(kind);
    let compiled = match jsonschema::options().with_draft(Draft::Draft202012).build(&schema) {
        Ok(compiled) => compiled,
        Err(err) => {
            return vec![ValidationIssue::new(
                ValidationCode::InvalidFormat,
                "$",
                format!("compile {kind} schema: {err}"),
            )];
        }
    };
    compiled
        .iter_errors(value)
        .map(|err| ValidationIssue::new(ValidationCode::InvalidFormat, "$", err.to_string()))
        .collect()
}
