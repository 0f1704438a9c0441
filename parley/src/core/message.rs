//! Typed agent messages produced by a successful validation.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::types::OutputKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Ok,
    Partial,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Acceptance {
    Pass,
    Conditional,
    Fail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    P0,
    P1,
    P2,
}

impl Severity {
    /// P0 and P1 block a passing review.
    pub fn is_blocking(self) -> bool {
        matches!(self, Severity::P0 | Severity::P1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GateDecision {
    Allow,
    Conditional,
    Block,
}

/// A concrete command an agent ran and what it observed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Evidence {
    pub command: String,
    pub result: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlanResult {
    pub requirement_breakdown: Vec<String>,
    pub implementation_scope: String,
    pub acceptance_criteria: Vec<String>,
    pub handoff_notes: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlanMessage {
    pub schema_version: String,
    pub status: Status,
    pub result: PlanResult,
    pub next_question: String,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Deliverable {
    pub path: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub summary: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeliveryResult {
    pub task_understanding: String,
    pub implementation_plan: String,
    pub execution_evidence: Vec<Evidence>,
    pub risks_and_rollback: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deliverables: Vec<Deliverable>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeliveryMessage {
    pub schema_version: String,
    pub status: Status,
    pub result: DeliveryResult,
    pub next_question: String,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReviewIssue {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub severity: Severity,
    pub summary: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Gate {
    pub decision: GateDecision,
    pub conditions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReviewMessage {
    pub schema_version: String,
    pub status: Status,
    pub acceptance: Acceptance,
    pub verification: Vec<Evidence>,
    pub root_cause: Vec<String>,
    pub issues: Vec<ReviewIssue>,
    pub gate: Gate,
    pub next_question: String,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

impl ReviewMessage {
    pub fn blocking_issues(&self) -> impl Iterator<Item = &ReviewIssue> {
        self.issues.iter().filter(|issue| issue.severity.is_blocking())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageBody {
    Plan(PlanMessage),
    Delivery(DeliveryMessage),
    Review(ReviewMessage),
}

/// A message that passed every validation stage, with the JSON it was parsed from.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedMessage {
    pub body: MessageBody,
    pub content: Value,
}

impl ValidatedMessage {
    pub fn kind(&self) -> OutputKind {
        match &self.body {
            MessageBody::Plan(_) => OutputKind::Plan,
            MessageBody::Delivery(_) => OutputKind::Delivery,
            MessageBody::Review(_) => OutputKind::Review,
        }
    }

    pub fn status(&self) -> Status {
        match &self.body {
            MessageBody::Plan(m) => m.status,
            MessageBody::Delivery(m) => m.status,
            MessageBody::Review(m) => m.status,
        }
    }

    pub fn next_question(&self) -> &str {
        match &self.body {
            MessageBody::Plan(m) => &m.next_question,
            MessageBody::Delivery(m) => &m.next_question,
            MessageBody::Review(m) => &m.next_question,
        }
    }

    /// Commands cited as evidence; plans cite none.
    pub fn evidence(&self) -> &[Evidence] {
        match &self.body {
            MessageBody::Plan(_) => &[],
            MessageBody::Delivery(m) => &m.result.execution_evidence,
            MessageBody::Review(m) => &m.verification,
        }
    }
}
