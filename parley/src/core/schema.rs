//! JSON Schemas for agent output, one per [`OutputKind`].
//!
//! These are handed to providers that accept an output schema, embedded in
//! turn prompts, and used as the final cross-check in the validator.

use serde_json::{Value, json};

use crate::core::envelope::schema_version;
use crate::core::types::OutputKind;

pub const STATUS_VALUES: [&str; 3] = ["ok", "partial", "failed"];
pub const ACCEPTANCE_VALUES: [&str; 3] = ["pass", "conditional", "fail"];
pub const GATE_DECISION_VALUES: [&str; 3] = ["allow", "conditional", "block"];
pub const SEVERITY_VALUES: [&str; 3] = ["P0", "P1", "P2"];

/// Minimum verification entries a review must cite.
pub const MIN_REVIEW_VERIFICATION: usize = 2;

fn string_list() -> Value {
    json!({"type": "array", "items": {"type": "string"}})
}

fn non_empty_string_list() -> Value {
    json!({"type": "array", "minItems": 1, "items": {"type": "string"}})
}

fn evidence_list(min_items: usize) -> Value {
    json!({
        "type": "array",
        "minItems": min_items,
        "items": {
            "type": "object",
            "additionalProperties": false,
            "required": ["command", "result"],
            "properties": {
                "command": {"type": "string"},
                "result": {"type": "string"},
            },
        },
    })
}

fn question() -> Value {
    json!({"type": "string", "minLength": 1, "pattern": "[?？]"})
}

fn plan_result() -> Value {
    json!({
        "type": "object",
        "additionalProperties": false,
        "required": [
            "requirement_breakdown",
            "implementation_scope",
            "acceptance_criteria",
            "handoff_notes",
        ],
        "properties": {
            "requirement_breakdown": non_empty_string_list(),
            "implementation_scope": {"type": "string"},
            "acceptance_criteria": non_empty_string_list(),
            "handoff_notes": {"type": "string"},
        },
    })
}

fn delivery_result() -> Value {
    json!({
        "type": "object",
        "additionalProperties": false,
        "required": [
            "task_understanding",
            "implementation_plan",
            "execution_evidence",
            "risks_and_rollback",
        ],
        "properties": {
            "task_understanding": {"type": "string"},
            "implementation_plan": {"type": "string"},
            "execution_evidence": evidence_list(0),
            "risks_and_rollback": {"type": "string"},
            "deliverables": {
                "type": "array",
                "items": {
                    "type": "object",
                    "additionalProperties": false,
                    "required": ["path"],
                    "properties": {
                        "path": {"type": "string"},
                        "kind": {"type": "string"},
                        "summary": {"type": "string"},
                    },
                },
            },
        },
    })
}

/// Output schema for `kind` (JSON Schema draft 2020-12).
pub fn output_schema(kind: OutputKind) -> Value {
    let version = schema_version(kind);
    match kind {
        OutputKind::Review => json!({
            "type": "object",
            "additionalProperties": false,
            "required": [
                "schema_version",
                "status",
                "acceptance",
                "verification",
                "root_cause",
                "issues",
                "gate",
                "next_question",
                "warnings",
                "errors",
            ],
            "properties": {
                "schema_version": {"type": "string", "enum": [version]},
                "status": {"type": "string", "enum": STATUS_VALUES},
                "acceptance": {"type": "string", "enum": ACCEPTANCE_VALUES},
                "verification": evidence_list(MIN_REVIEW_VERIFICATION),
                "root_cause": string_list(),
                "issues": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "additionalProperties": false,
                        "required": ["severity", "summary"],
                        "properties": {
                            "id": {"type": "string"},
                            "severity": {"type": "string", "enum": SEVERITY_VALUES},
                            "summary": {"type": "string"},
                        },
                    },
                },
                "gate": {
                    "type": "object",
                    "additionalProperties": false,
                    "required": ["decision", "conditions"],
                    "properties": {
                        "decision": {"type": "string", "enum": GATE_DECISION_VALUES},
                        "conditions": string_list(),
                    },
                },
                "next_question": question(),
                "warnings": string_list(),
                "errors": string_list(),
            },
        }),
        OutputKind::Plan | OutputKind::Delivery => {
            let result = if kind == OutputKind::Plan {
                plan_result()
            } else {
                delivery_result()
            };
            json!({
                "type": "object",
                "additionalProperties": false,
                "required": [
                    "schema_version",
                    "status",
                    "result",
                    "next_question",
                    "warnings",
                    "errors",
                ],
                "properties": {
                    "schema_version": {"type": "string", "enum": [version]},
                    "status": {"type": "string", "enum": STATUS_VALUES},
                    "result": result,
                    "next_question": question(),
                    "warnings": string_list(),
                    "errors": string_list(),
                },
            })
        }
    }
}
