//! Canonical wrapper for one inter-agent message.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;

use crate::core::agents::AgentRoster;
use crate::core::message::{MessageBody, ValidatedMessage};
use crate::core::types::OutputKind;

pub const ENVELOPE_SCHEMA_VERSION: &str = "parley.envelope.v1";
pub const TASK_SCHEMA_VERSION: &str = "parley.task.v1";
pub const PLAN_SCHEMA_VERSION: &str = "parley.plan.v1";
pub const DELIVERY_SCHEMA_VERSION: &str = "parley.delivery.v1";
pub const REVIEW_SCHEMA_VERSION: &str = "parley.review.v1";

/// Expected `schema_version` for agent output of `kind`.
pub fn schema_version(kind: OutputKind) -> &'static str {
    match kind {
        OutputKind::Plan => PLAN_SCHEMA_VERSION,
        OutputKind::Delivery => DELIVERY_SCHEMA_VERSION,
        OutputKind::Review => REVIEW_SCHEMA_VERSION,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeRole {
    Task,
    Review,
    Final,
    Error,
    Observation,
}

impl EnvelopeRole {
    pub fn for_output(kind: OutputKind) -> Self {
        match kind {
            OutputKind::Plan => EnvelopeRole::Observation,
            OutputKind::Delivery => EnvelopeRole::Final,
            OutputKind::Review => EnvelopeRole::Review,
        }
    }
}

impl fmt::Display for EnvelopeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            EnvelopeRole::Task => "task",
            EnvelopeRole::Review => "review",
            EnvelopeRole::Final => "final",
            EnvelopeRole::Error => "error",
            EnvelopeRole::Observation => "observation",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub path: String,
    pub kind: String,
    pub summary: String,
}

/// Identity and time of a message, supplied by the caller so envelope
/// construction stays deterministic under test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stamp {
    pub message_id: String,
    pub timestamp: DateTime<Utc>,
}

impl Stamp {
    pub fn now() -> Self {
        Self {
            message_id: uuid::Uuid::new_v4().simple().to_string(),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("unknown envelope {field} '{name}'")]
    UnknownParty { field: &'static str, name: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub message_id: String,
    pub trace_id: String,
    pub schema_version: String,
    pub sender: String,
    pub recipient: String,
    pub role: EnvelopeRole,
    pub timestamp: DateTime<Utc>,
    pub content: Value,
    pub attachments: Vec<Attachment>,
    pub meta: BTreeMap<String, Value>,
}

impl Envelope {
    /// Task envelope opening a run: the user request addressed to the first agent.
    pub fn task(
        roster: &AgentRoster,
        stamp: Stamp,
        trace_id: &str,
        sender: &str,
        recipient: &str,
        request: &str,
    ) -> Result<Self, EnvelopeError> {
        let content = json!({
            "schema_version": TASK_SCHEMA_VERSION,
            "request": request,
        });
        Self::build(
            roster,
            stamp,
            trace_id,
            sender,
            recipient,
            EnvelopeRole::Task,
            content,
            Vec::new(),
        )
    }

    /// Envelope carrying one validated agent message.
    pub fn for_message(
        roster: &AgentRoster,
        stamp: Stamp,
        trace_id: &str,
        sender: &str,
        recipient: &str,
        message: &ValidatedMessage,
    ) -> Result<Self, EnvelopeError> {
        let attachments = match &message.body {
            MessageBody::Delivery(delivery) => delivery
                .result
                .deliverables
                .iter()
                .map(|item| Attachment {
                    path: item.path.clone(),
                    kind: item.kind.clone(),
                    summary: item.summary.clone(),
                })
                .collect(),
            _ => Vec::new(),
        };
        Self::build(
            roster,
            stamp,
            trace_id,
            sender,
            recipient,
            EnvelopeRole::for_output(message.kind()),
            message.content.clone(),
            attachments,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn build(
        roster: &AgentRoster,
        stamp: Stamp,
        trace_id: &str,
        sender: &str,
        recipient: &str,
        role: EnvelopeRole,
        content: Value,
        attachments: Vec<Attachment>,
    ) -> Result<Self, EnvelopeError> {
        if !roster.is_party(sender) {
            return Err(EnvelopeError::UnknownParty {
                field: "sender",
                name: sender.to_string(),
            });
        }
        if !roster.is_party(recipient) {
            return Err(EnvelopeError::UnknownParty {
                field: "recipient",
                name: recipient.to_string(),
            });
        }
        Ok(Self {
            message_id: stamp.message_id,
            trace_id: trace_id.to_string(),
            schema_version: ENVELOPE_SCHEMA_VERSION.to_string(),
            sender: sender.to_string(),
            recipient: recipient.to_string(),
            role,
            timestamp: stamp.timestamp,
            content,
            attachments,
            meta: BTreeMap::new(),
        })
    }

    pub fn with_meta(mut self, key: &str, value: Value) -> Self {
        self.meta.insert(key.to_string(), value);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::agents::ORCHESTRATOR_ID;
    use crate::test_support::two_agent_roster;

    fn fixed_stamp() -> Stamp {
        Stamp {
            message_id: "m-1".to_string(),
            timestamp: DateTime::from_timestamp(1_700_000_000, 0).expect("timestamp"),
        }
    }

    #[test]
    fn task_envelope_addresses_first_agent() {
        let roster = two_agent_roster();
        let env = Envelope::task(
            &roster,
            fixed_stamp(),
            "run-1",
            ORCHESTRATOR_ID,
            "builder",
            "add a health check",
        )
        .expect("task envelope");
        assert_eq!(env.role, EnvelopeRole::Task);
        assert_eq!(env.schema_version, ENVELOPE_SCHEMA_VERSION);
        assert_eq!(env.content["request"], "add a health check");
        assert_eq!(env.content["schema_version"], TASK_SCHEMA_VERSION);
    }

    #[test]
    fn unknown_recipient_is_rejected() {
        let roster = two_agent_roster();
        let err = Envelope::task(
            &roster,
            fixed_stamp(),
            "run-1",
            ORCHESTRATOR_ID,
            "stranger",
            "hi",
        )
        .unwrap_err();
        assert_eq!(
            err,
            EnvelopeError::UnknownParty {
                field: "recipient",
                name: "stranger".to_string()
            }
        );
    }

    #[test]
    fn role_follows_output_kind() {
        assert_eq!(EnvelopeRole::for_output(OutputKind::Plan), EnvelopeRole::Observation);
        assert_eq!(EnvelopeRole::for_output(OutputKind::Delivery), EnvelopeRole::Final);
        assert_eq!(EnvelopeRole::for_output(OutputKind::Review), EnvelopeRole::Review);
    }
}
