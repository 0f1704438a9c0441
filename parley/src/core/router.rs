//! Next-agent selection with hop and loop limits.
//!
//! [`decide`] is a pure function of its arguments: replaying a recorded
//! history through it reproduces the same decisions.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::core::agents::AgentRoster;

/// Hex chars of the SHA-256 digest kept as the intent hash.
const INTENT_HASH_LEN: usize = 12;

static MENTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"@([^\s@,.;:!?，。！？、()\[\]{}<>"'`]+)"#).expect("mention regex should be valid")
});

/// Keyword route from one agent to another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteRule {
    pub id: String,
    /// Agent name the rule applies to, or `*` for any agent.
    pub from: String,
    pub to: String,
    /// Case-insensitive substrings; any one matching fires the rule. Empty
    /// means the rule always fires for `from`.
    #[serde(default)]
    pub keywords: Vec<String>,
    /// Higher runs first; ties keep declaration order.
    #[serde(default)]
    pub priority: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouterConfig {
    /// Rotation order for the fallback, as canonical agent ids.
    pub order: Vec<String>,
    pub rules: Vec<RouteRule>,
    pub max_hops: u32,
    pub loop_window: usize,
    pub loop_threshold: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteReason {
    Mention,
    Rule,
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub from: String,
    pub to: String,
    pub intent: String,
    /// Rotation hops stay in the window but never count as repeats.
    pub fallback: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteDecision {
    pub current: String,
    pub next_agent: String,
    pub reason: RouteReason,
    pub matched_rule: Option<String>,
    pub is_fallback: bool,
    pub hop_count: u32,
    /// Most recent fingerprints, oldest first, including this decision.
    pub window: Vec<Fingerprint>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouteError {
    #[error("route exceeded max hops ({hop_count} > {max_hops})")]
    MaxHopsExceeded { hop_count: u32, max_hops: u32 },
    #[error(
        "route loop detected: {}->{} repeated {repeats} times in the last {window} hops",
        .fingerprint.from,
        .fingerprint.to
    )]
    LoopDetected {
        fingerprint: Fingerprint,
        repeats: usize,
        window: usize,
    },
    #[error("route target '{0}' is not a known agent")]
    UnknownAgent(String),
}

struct Choice {
    next: String,
    reason: RouteReason,
    rule: Option<String>,
    intent_key: String,
}

/// Pick the agent that speaks after `current` produced `text`.
pub fn decide(
    current: &str,
    text: &str,
    history: &[RouteDecision],
    config: &RouterConfig,
    roster: &AgentRoster,
) -> Result<RouteDecision, RouteError> {
    let current = roster
        .canonical(current)
        .ok_or_else(|| RouteError::UnknownAgent(current.to_string()))?;

    let choice = match mention_target(current, text, roster) {
        Some(choice) => choice,
        None => match rule_target(current, text, config, roster)? {
            Some(choice) => choice,
            None => rotation_target(current, config, roster)?,
        },
    };

    let previous = history.last();
    let hop_count = previous.map_or(0, |decision| decision.hop_count) + 1;
    if hop_count > config.max_hops {
        return Err(RouteError::MaxHopsExceeded {
            hop_count,
            max_hops: config.max_hops,
        });
    }

    let is_fallback = choice.reason == RouteReason::Fallback;
    let fingerprint = Fingerprint {
        from: current.to_string(),
        to: choice.next.clone(),
        intent: intent_hash(&choice.intent_key),
        fallback: is_fallback,
    };
    let mut window: Vec<Fingerprint> = previous
        .map(|decision| decision.window.clone())
        .unwrap_or_default();
    window.push(fingerprint.clone());
    if window.len() > config.loop_window {
        let excess = window.len() - config.loop_window;
        window.drain(..excess);
    }

    if !is_fallback {
        let repeats = window
            .iter()
            .filter(|seen| !seen.fallback && **seen == fingerprint)
            .count();
        if repeats >= config.loop_threshold {
            return Err(RouteError::LoopDetected {
                fingerprint,
                repeats,
                window: config.loop_window,
            });
        }
    }

    Ok(RouteDecision {
        current: current.to_string(),
        next_agent: choice.next,
        reason: choice.reason,
        matched_rule: choice.rule,
        is_fallback,
        hop_count,
        window,
    })
}

/// `@Display Name` for every multi-word name in the roster, longest first.
fn multi_word_mention_re(roster: &AgentRoster) -> Option<Regex> {
    let mut names: Vec<&str> = roster.multi_word_names().collect();
    if names.is_empty() {
        return None;
    }
    names.sort_by_key(|name| std::cmp::Reverse(name.len()));
    let alternatives: Vec<String> = names
        .iter()
        .map(|name| {
            name.split_whitespace()
                .map(regex::escape)
                .collect::<Vec<_>>()
                .join(r"\s+")
        })
        .collect();
    Regex::new(&format!("(?i)@({})", alternatives.join("|"))).ok()
}

/// Canonical ids mentioned in `text`, in order of appearance, unknown names
/// dropped. A multi-word display name or alias matches when it is followed
/// by a non-word character or the end of the text; otherwise a mention runs
/// to the next whitespace or punctuation.
pub fn mentions<'a>(text: &str, roster: &'a AgentRoster) -> Vec<&'a str> {
    let spaced = multi_word_mention_re(roster);
    let mut found = Vec::new();
    let mut pos = 0;
    while let Some(offset) = text[pos..].find('@') {
        let at = pos + offset;
        let multi_word = spaced
            .as_ref()
            .and_then(|re| re.captures_at(text, at))
            .and_then(|caps| caps.get(1))
            .filter(|name| name.start() == at + 1)
            .filter(|name| {
                !text[name.end()..]
                    .chars()
                    .next()
                    .is_some_and(|c| c.is_alphanumeric() || c == '_')
            });
        let name = multi_word.or_else(|| {
            MENTION_RE
                .captures_at(text, at)
                .and_then(|caps| caps.get(1))
                .filter(|name| name.start() == at + 1)
        });
        match name {
            Some(name) => {
                found.extend(roster.canonical(name.as_str()));
                pos = name.end();
            }
            None => pos = at + 1,
        }
    }
    found
}

fn mention_target(current: &str, text: &str, roster: &AgentRoster) -> Option<Choice> {
    mentions(text, roster)
        .into_iter()
        .find(|id| *id != current)
        .map(|id| Choice {
            next: id.to_string(),
            reason: RouteReason::Mention,
            rule: None,
            intent_key: format!("mention:{id}"),
        })
}

fn rule_target(
    current: &str,
    text: &str,
    config: &RouterConfig,
    roster: &AgentRoster,
) -> Result<Option<Choice>, RouteError> {
    let haystack = text.to_lowercase();
    let mut candidates: Vec<&RouteRule> = config
        .rules
        .iter()
        .filter(|rule| rule.from == "*" || roster.canonical(&rule.from) == Some(current))
        .filter(|rule| {
            rule.keywords.is_empty()
                || rule
                    .keywords
                    .iter()
                    .any(|keyword| haystack.contains(&keyword.to_lowercase()))
        })
        .collect();
    // Stable sort keeps declaration order among equal priorities.
    candidates.sort_by_key(|rule| std::cmp::Reverse(rule.priority));

    let Some(rule) = candidates.first() else {
        return Ok(None);
    };
    let next = roster
        .canonical(&rule.to)
        .ok_or_else(|| RouteError::UnknownAgent(rule.to.clone()))?;
    Ok(Some(Choice {
        next: next.to_string(),
        reason: RouteReason::Rule,
        rule: Some(rule.id.clone()),
        intent_key: format!("rule:{}", rule.id),
    }))
}

fn rotation_target(
    current: &str,
    config: &RouterConfig,
    roster: &AgentRoster,
) -> Result<Choice, RouteError> {
    let order: Vec<&str> = if config.order.is_empty() {
        roster.ids().collect()
    } else {
        config.order.iter().map(String::as_str).collect()
    };
    let next = match order.iter().position(|id| *id == current) {
        Some(pos) => order[(pos + 1) % order.len()],
        None => order
            .first()
            .copied()
            .ok_or_else(|| RouteError::UnknownAgent(current.to_string()))?,
    };
    let next = roster
        .canonical(next)
        .ok_or_else(|| RouteError::UnknownAgent(next.to_string()))?;
    Ok(Choice {
        next: next.to_string(),
        reason: RouteReason::Fallback,
        rule: None,
        intent_key: "fallback".to_string(),
    })
}

fn intent_hash(key: &str) -> String {
    let digest = Sha256::digest(key.as_bytes());
    let mut hex = hex::encode(digest);
    hex.truncate(INTENT_HASH_LEN);
    hex
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{OutputKind, ProviderKind};
    use crate::test_support::{agent, two_agent_roster};

    fn config(rules: Vec<RouteRule>) -> RouterConfig {
        RouterConfig {
            order: vec!["builder".to_string(), "reviewer".to_string()],
            rules,
            max_hops: 20,
            loop_window: 6,
            loop_threshold: 2,
        }
    }

    fn rule(id: &str, from: &str, to: &str, keywords: &[&str], priority: i32) -> RouteRule {
        RouteRule {
            id: id.to_string(),
            from: from.to_string(),
            to: to.to_string(),
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
            priority,
        }
    }

    fn three_agent_roster() -> AgentRoster {
        let mut planner = agent("planner", ProviderKind::Gemini, OutputKind::Plan);
        planner.aliases = vec!["pm".to_string()];
        AgentRoster::new(vec![
            agent("builder", ProviderKind::Codex, OutputKind::Delivery),
            agent("reviewer", ProviderKind::Claude, OutputKind::Review),
            planner,
        ])
        .expect("roster")
    }

    #[test]
    fn falls_back_to_rotation() {
        let roster = two_agent_roster();
        let decision = decide("builder", "done?", &[], &config(vec![]), &roster).expect("decide");
        assert_eq!(decision.next_agent, "reviewer");
        assert!(decision.is_fallback);
        assert_eq!(decision.reason, RouteReason::Fallback);
        assert_eq!(decision.hop_count, 1);

        let back = decide("reviewer", "ok?", &[decision], &config(vec![]), &roster).expect("back");
        assert_eq!(back.next_agent, "builder");
    }

    #[test]
    fn mention_beats_rules_and_ignores_self() {
        let roster = three_agent_roster();
        let rules = vec![rule("r1", "builder", "reviewer", &["review"], 10)];
        let decision = decide(
            "builder",
            "@builder note to self. Please review, @PM?",
            &[],
            &config(rules),
            &roster,
        )
        .expect("decide");
        assert_eq!(decision.next_agent, "planner");
        assert_eq!(decision.reason, RouteReason::Mention);
        assert!(!decision.is_fallback);
    }

    #[test]
    fn unknown_mentions_fall_through() {
        let roster = three_agent_roster();
        let decision = decide("builder", "ping @nobody", &[], &config(vec![]), &roster)
            .expect("decide");
        assert_eq!(decision.reason, RouteReason::Fallback);
        assert_eq!(mentions("cc @Reviewer, @pm.", &roster), vec!["reviewer", "planner"]);
    }

    #[test]
    fn multi_word_display_names_are_mentionable() {
        let mut reviewer = agent("reviewer", ProviderKind::Claude, OutputKind::Review);
        reviewer.display_name = "Code Reviewer".to_string();
        let mut planner = agent("planner", ProviderKind::Gemini, OutputKind::Plan);
        planner.aliases = vec!["Code Reviewer Lead".to_string()];
        let roster = AgentRoster::new(vec![
            agent("builder", ProviderKind::Codex, OutputKind::Delivery),
            reviewer,
            planner,
        ])
        .expect("roster");

        assert_eq!(
            mentions("thanks @code  reviewer, and @Code Reviewer Lead?", &roster),
            vec!["reviewer", "planner"]
        );
        // A longer word is not a match for the shorter name.
        assert_eq!(mentions("@Code Reviewers please", &roster), Vec::<&str>::new());
        assert_eq!(mentions("@builder: done", &roster), vec!["builder"]);

        let decision = decide(
            "builder",
            "Over to @Code Reviewer for a look.",
            &[],
            &config(vec![]),
            &roster,
        )
        .expect("decide");
        assert_eq!(decision.next_agent, "reviewer");
        assert_eq!(decision.reason, RouteReason::Mention);
    }

    #[test]
    fn highest_priority_rule_wins_then_declaration_order() {
        let roster = three_agent_roster();
        let rules = vec![
            rule("low", "builder", "reviewer", &["plan"], 1),
            rule("first", "*", "planner", &["PLAN"], 5),
            rule("second", "builder", "reviewer", &["plan"], 5),
        ];
        let decision =
            decide("builder", "needs a plan", &[], &config(rules), &roster).expect("decide");
        assert_eq!(decision.matched_rule.as_deref(), Some("first"));
        assert_eq!(decision.next_agent, "planner");
        assert_eq!(decision.reason, RouteReason::Rule);
    }

    #[test]
    fn rule_from_other_agent_does_not_fire() {
        let roster = three_agent_roster();
        let rules = vec![rule("r", "reviewer", "planner", &[], 0)];
        let decision = decide("builder", "anything", &[], &config(rules), &roster).expect("decide");
        assert!(decision.is_fallback);
    }

    #[test]
    fn hop_count_increments_by_one() {
        let roster = two_agent_roster();
        let cfg = config(vec![]);
        let mut history = Vec::new();
        let mut current = "builder".to_string();
        for expected in 1..=5 {
            let decision = decide(&current, "next?", &history, &cfg, &roster).expect("decide");
            assert_eq!(decision.hop_count, expected);
            current = decision.next_agent.clone();
            history.push(decision);
        }
    }

    #[test]
    fn max_hops_is_enforced() {
        let roster = two_agent_roster();
        let mut cfg = config(vec![]);
        cfg.max_hops = 1;
        let first = decide("builder", "?", &[], &cfg, &roster).expect("first");
        let err = decide("reviewer", "?", &[first], &cfg, &roster).unwrap_err();
        assert_eq!(
            err,
            RouteError::MaxHopsExceeded {
                hop_count: 2,
                max_hops: 1
            }
        );
    }

    /// A->B->A->B driven by rules trips loop detection well before max hops.
    #[test]
    fn ping_pong_rules_raise_loop_detected() {
        let roster = two_agent_roster();
        let rules = vec![
            rule("to-review", "builder", "reviewer", &["ready"], 0),
            rule("to-build", "reviewer", "builder", &["fix"], 0),
        ];
        let cfg = config(rules);
        let mut history = Vec::new();
        let script = [("builder", "ready"), ("reviewer", "fix it"), ("builder", "ready")];
        let mut outcome = None;
        for (agent, text) in script {
            match decide(agent, text, &history, &cfg, &roster) {
                Ok(decision) => history.push(decision),
                Err(err) => {
                    outcome = Some(err);
                    break;
                }
            }
        }
        let err = outcome.expect("loop detected");
        assert!(matches!(err, RouteError::LoopDetected { repeats: 2, .. }));
        assert_eq!(history.len(), 2);
        assert!((history.len() as u32) < cfg.max_hops);
    }

    #[test]
    fn rotation_is_exempt_from_loop_detection() {
        let roster = two_agent_roster();
        let cfg = config(vec![]);
        let mut history: Vec<RouteDecision> = Vec::new();
        let mut current = "builder".to_string();
        for _ in 0..10 {
            let decision = decide(&current, "?", &history, &cfg, &roster).expect("rotation");
            current = decision.next_agent.clone();
            history.push(decision);
        }
        let last = history.last().expect("last");
        assert_eq!(last.window.len(), cfg.loop_window);
    }

    #[test]
    fn decisions_replay_identically() {
        let roster = two_agent_roster();
        let cfg = config(vec![rule("r", "builder", "reviewer", &["ready"], 0)]);
        let first = decide("builder", "ready?", &[], &cfg, &roster).expect("first");
        let again = decide("builder", "ready?", &[], &cfg, &roster).expect("again");
        assert_eq!(first, again);
        assert_eq!(first.window[0].intent.len(), INTENT_HASH_LEN);
    }
}
