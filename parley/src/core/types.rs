//! Shared deterministic types for the orchestration core.
//!
//! These types define stable contracts between components. They carry no I/O
//! and serialize to the same shape across runs.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// External agent binary family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Codex,
    Claude,
    Gemini,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 3] = [
        ProviderKind::Codex,
        ProviderKind::Claude,
        ProviderKind::Gemini,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ProviderKind::Codex => "codex",
            ProviderKind::Claude => "claude",
            ProviderKind::Gemini => "gemini",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "codex" => Ok(ProviderKind::Codex),
            "claude" | "claude-minimax" | "claude_minimax" => Ok(ProviderKind::Claude),
            "gemini" => Ok(ProviderKind::Gemini),
            other => Err(format!("unknown provider '{other}'")),
        }
    }
}

/// Structured message kind an agent must produce each turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputKind {
    Plan,
    Delivery,
    Review,
}

impl OutputKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OutputKind::Plan => "plan",
            OutputKind::Delivery => "delivery",
            OutputKind::Review => "review",
        }
    }
}

impl fmt::Display for OutputKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutputKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "plan" => Ok(OutputKind::Plan),
            "delivery" => Ok(OutputKind::Delivery),
            "review" => Ok(OutputKind::Review),
            other => Err(format!("unknown output kind '{other}'")),
        }
    }
}

/// Whether an agent may act on the workspace or only answer in text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseMode {
    #[default]
    TextOnly,
    Execute,
}

/// Which timeout fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeoutKind {
    Idle,
    Max,
}

/// Why a governed process call failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProcessErrorKind {
    /// Binary missing or not spawnable.
    Launch,
    Timeout { which: TimeoutKind },
    /// Child terminated by a signal it did not get from us.
    Signal { signal: i32 },
    /// Nonzero exit status.
    Exit,
    /// The owning process was interrupted and reclaimed the child.
    Interrupted,
}

impl ProcessErrorKind {
    /// Stable reason label used in diagnostics and audit events.
    pub fn reason(self) -> &'static str {
        match self {
            ProcessErrorKind::Launch => "launch_error",
            ProcessErrorKind::Timeout {
                which: TimeoutKind::Idle,
            } => "idle_timeout",
            ProcessErrorKind::Timeout {
                which: TimeoutKind::Max,
            } => "max_timeout",
            ProcessErrorKind::Signal { .. } => "signal",
            ProcessErrorKind::Exit => "nonzero_exit",
            ProcessErrorKind::Interrupted => "interrupted",
        }
    }
}

/// How a turn ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TurnOutcome {
    /// Output passed validation.
    Accepted,
    /// Terminal failure; the run stops after this record.
    Failed { reason: String },
}

/// One entry of the append-only run transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnRecord {
    /// 1-indexed, strictly increasing within a run.
    pub index: u32,
    pub agent: String,
    pub provider: ProviderKind,
    /// Raw assistant text returned by the provider (last attempt).
    pub text: String,
    pub session_id: Option<String>,
    pub elapsed_ms: u64,
    /// Provider calls made for this turn, across both retry layers.
    pub attempts: u32,
    pub outcome: TurnOutcome,
    /// Validated message body on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Value>,
}

impl TurnRecord {
    pub fn is_accepted(&self) -> bool {
        self.outcome == TurnOutcome::Accepted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_aliases_parse_case_insensitively() {
        assert_eq!("Codex".parse::<ProviderKind>(), Ok(ProviderKind::Codex));
        assert_eq!(
            "claude-minimax".parse::<ProviderKind>(),
            Ok(ProviderKind::Claude)
        );
        assert!("gpt".parse::<ProviderKind>().is_err());
    }

    #[test]
    fn turn_outcome_serializes_tagged() {
        let failed = TurnOutcome::Failed {
            reason: "idle_timeout".to_string(),
        };
        let value = serde_json::to_value(&failed).expect("serialize");
        assert_eq!(value["kind"], "failed");
        assert_eq!(value["reason"], "idle_timeout");
    }
}
