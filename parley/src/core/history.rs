//! Compact prior-turn summaries injected into each turn prompt.
//!
//! Only the latest plan, delivery and review are summarized, plus a flat list
//! of key changes. Every string is clipped so the block stays bounded.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::core::message::{
    DeliveryMessage, MessageBody, PlanMessage, ReviewMessage, ValidatedMessage,
};
use crate::core::types::OutputKind;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryLimits {
    /// Bound for the whole rendered block (chars).
    pub max_chars: usize,
    /// Bound for any single field (chars).
    pub field_max_chars: usize,
    pub evidence_limit: usize,
    pub issue_limit: usize,
    pub root_cause_limit: usize,
    pub include_key_changes: bool,
}

impl Default for HistoryLimits {
    fn default() -> Self {
        Self {
            max_chars: 3000,
            field_max_chars: 400,
            evidence_limit: 3,
            issue_limit: 5,
            root_cause_limit: 3,
            include_key_changes: true,
        }
    }
}

/// One accepted turn, as seen by the summarizer.
#[derive(Debug, Clone, Copy)]
pub struct HistoryEntry<'a> {
    pub turn: u32,
    pub agent: &'a str,
    pub message: &'a ValidatedMessage,
}

pub const NO_HISTORY: &str = "(no history)";

/// Clip to `max_chars` chars, marking the cut with `...`.
pub fn clip(text: &str, max_chars: usize) -> String {
    let text = text.trim();
    if max_chars == 0 {
        return String::new();
    }
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let keep = max_chars.saturating_sub(3);
    let mut clipped: String = text.chars().take(keep).collect();
    clipped.push_str("...");
    clipped
}

fn clip_list(items: &[String], limit: usize, field_max: usize) -> Vec<String> {
    items
        .iter()
        .take(limit)
        .map(|item| clip(item, field_max))
        .collect()
}

fn latest<'a>(entries: &[HistoryEntry<'a>], kind: OutputKind) -> Option<HistoryEntry<'a>> {
    entries
        .iter()
        .rev()
        .find(|entry| entry.message.kind() == kind)
        .copied()
}

fn summarize_plan(turn: u32, plan: &PlanMessage, limits: &HistoryLimits) -> Value {
    let field = limits.field_max_chars;
    let list_limit = limits.issue_limit.max(limits.evidence_limit);
    json!({
        "turn": turn,
        "status": plan.status,
        "requirement_breakdown": clip_list(&plan.result.requirement_breakdown, list_limit, field),
        "implementation_scope": clip(&plan.result.implementation_scope, field),
        "acceptance_criteria": clip_list(&plan.result.acceptance_criteria, list_limit, field),
        "handoff_notes": clip(&plan.result.handoff_notes, field),
        "next_question": clip(&plan.next_question, field),
    })
}

fn summarize_delivery(turn: u32, delivery: &DeliveryMessage, limits: &HistoryLimits) -> Value {
    let field = limits.field_max_chars;
    let result = &delivery.result;
    let evidence: Vec<String> = result
        .execution_evidence
        .iter()
        .take(limits.evidence_limit)
        .map(|item| format!("{} => {}", clip(&item.command, field), clip(&item.result, field)))
        .collect();
    let deliverables: Vec<String> = result
        .deliverables
        .iter()
        .take(limits.evidence_limit)
        .map(|item| {
            let mut line = clip(&item.path, field);
            if !item.kind.is_empty() {
                line.push_str(&format!(" ({})", clip(&item.kind, field)));
            }
            if !item.summary.is_empty() {
                line.push_str(&format!(": {}", clip(&item.summary, field)));
            }
            line
        })
        .collect();
    json!({
        "turn": turn,
        "status": delivery.status,
        "task_understanding": clip(&result.task_understanding, field),
        "implementation_plan": clip(&result.implementation_plan, field),
        "execution_evidence": evidence,
        "deliverables": deliverables,
        "risks_and_rollback": clip(&result.risks_and_rollback, field),
        "next_question": clip(&delivery.next_question, field),
    })
}

fn summarize_review(turn: u32, review: &ReviewMessage, limits: &HistoryLimits) -> Value {
    let field = limits.field_max_chars;
    let issues: Vec<Value> = review
        .issues
        .iter()
        .take(limits.issue_limit)
        .map(|issue| json!({"severity": issue.severity, "summary": clip(&issue.summary, field)}))
        .collect();
    json!({
        "turn": turn,
        "status": review.status,
        "acceptance": review.acceptance,
        "gate": {
            "decision": review.gate.decision,
            "conditions": clip_list(&review.gate.conditions, limits.issue_limit, field),
        },
        "issues": issues,
        "root_cause": clip_list(&review.root_cause, limits.root_cause_limit, field),
        "next_question": clip(&review.next_question, field),
    })
}

fn key_changes(
    plan: Option<&PlanMessage>,
    delivery: Option<&DeliveryMessage>,
    review: Option<&ReviewMessage>,
    limits: &HistoryLimits,
) -> Vec<String> {
    let field = limits.field_max_chars;
    let mut changes = Vec::new();
    if let Some(plan) = plan {
        for item in plan.result.acceptance_criteria.iter().take(limits.issue_limit) {
            changes.push(format!("acceptance: {}", clip(item, field)));
        }
    }
    if let Some(delivery) = delivery {
        for item in delivery.result.execution_evidence.iter().take(limits.evidence_limit) {
            changes.push(format!(
                "evidence: {} => {}",
                clip(&item.command, field),
                clip(&item.result, field)
            ));
        }
        for item in delivery.result.deliverables.iter().take(limits.evidence_limit) {
            changes.push(format!("deliverable: {}", clip(&item.path, field)));
        }
    }
    if let Some(review) = review {
        for issue in review.issues.iter().take(limits.issue_limit) {
            changes.push(format!("issue[{:?}]: {}", issue.severity, clip(&issue.summary, field)));
        }
    }
    changes
}

/// Render the history block for the next prompt.
pub fn format_history(entries: &[HistoryEntry<'_>], limits: &HistoryLimits) -> String {
    if entries.is_empty() {
        return NO_HISTORY.to_string();
    }

    let plan = latest(entries, OutputKind::Plan);
    let delivery = latest(entries, OutputKind::Delivery);
    let review = latest(entries, OutputKind::Review);

    let plan_body = plan.and_then(|entry| match &entry.message.body {
        MessageBody::Plan(plan) => Some((entry.turn, plan)),
        _ => None,
    });
    let delivery_body = delivery.and_then(|entry| match &entry.message.body {
        MessageBody::Delivery(delivery) => Some((entry.turn, delivery)),
        _ => None,
    });
    let review_body = review.and_then(|entry| match &entry.message.body {
        MessageBody::Review(review) => Some((entry.turn, review)),
        _ => None,
    });

    let mut lines = Vec::new();
    if let Some((turn, plan)) = plan_body {
        lines.push(format!("LATEST_PLAN={}", summarize_plan(turn, plan, limits)));
    }
    if let Some((turn, delivery)) = delivery_body {
        lines.push(format!(
            "LATEST_DELIVERY={}",
            summarize_delivery(turn, delivery, limits)
        ));
    }
    if let Some((turn, review)) = review_body {
        lines.push(format!("LATEST_REVIEW={}", summarize_review(turn, review, limits)));
    }
    if limits.include_key_changes {
        let changes = key_changes(
            plan_body.map(|(_, plan)| plan),
            delivery_body.map(|(_, delivery)| delivery),
            review_body.map(|(_, review)| review),
            limits,
        );
        if !changes.is_empty() {
            lines.push(format!("KEY_CHANGES={}", json!(changes)));
        }
    }

    if limits.max_chars == 0 {
        return lines.join("\n");
    }
    clip(&lines.join("\n"), limits.max_chars)
}

/// The most recent outstanding question, addressed to whoever speaks next.
pub fn peer_question<'a>(entries: &[HistoryEntry<'a>]) -> Option<&'a str> {
    entries
        .last()
        .map(|entry| entry.message.next_question())
        .filter(|question| !question.trim().is_empty())
}
