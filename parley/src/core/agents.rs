//! Agent roster and name normalization.
//!
//! Every agent has one canonical ASCII id. Mentions, CLI arguments and config
//! keys may use the id, the display name, or any configured alias; lookups are
//! case-insensitive.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::types::{OutputKind, ProviderKind, ResponseMode};

/// Reserved sender/recipient for messages the run itself emits.
pub const ORCHESTRATOR_ID: &str = "orchestrator";

/// Static profile for one agent. Immutable for the duration of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentProfile {
    pub id: String,
    pub display_name: String,
    pub provider: ProviderKind,
    pub response_mode: ResponseMode,
    pub output: OutputKind,
    pub mission: String,
    pub aliases: Vec<String>,
    /// Provider-specific knobs (e.g. `permission_mode`, `sandbox`).
    pub provider_options: BTreeMap<String, String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RosterError {
    #[error("agent roster is empty")]
    Empty,
    #[error("agent id '{0}' must be non-empty ascii without whitespace or '@'")]
    InvalidId(String),
    #[error("duplicate agent id '{0}'")]
    DuplicateId(String),
    #[error("name '{name}' refers to both '{first}' and '{second}'")]
    AmbiguousName {
        name: String,
        first: String,
        second: String,
    },
}

/// Ordered set of agents with an alias table.
///
/// Declaration order is preserved; it drives rotation fallback in the router.
#[derive(Debug, Clone)]
pub struct AgentRoster {
    agents: Vec<AgentProfile>,
    names: HashMap<String, usize>,
}

impl AgentRoster {
    pub fn new(agents: Vec<AgentProfile>) -> Result<Self, RosterError> {
        if agents.is_empty() {
            return Err(RosterError::Empty);
        }
        let mut ids = HashSet::new();
        for agent in &agents {
            if !is_valid_id(&agent.id) {
                return Err(RosterError::InvalidId(agent.id.clone()));
            }
            if !ids.insert(fold(&agent.id)) {
                return Err(RosterError::DuplicateId(agent.id.clone()));
            }
        }

        let mut names: HashMap<String, usize> = HashMap::new();
        for (idx, agent) in agents.iter().enumerate() {
            let mut keys = vec![agent.id.as_str(), agent.display_name.as_str()];
            keys.extend(agent.aliases.iter().map(String::as_str));
            for key in keys {
                let key = fold(key);
                if key.is_empty() {
                    continue;
                }
                match names.get(&key) {
                    Some(&other) if other != idx => {
                        return Err(RosterError::AmbiguousName {
                            name: key,
                            first: agents[other].id.clone(),
                            second: agent.id.clone(),
                        });
                    }
                    _ => {
                        names.insert(key, idx);
                    }
                }
            }
        }
        Ok(Self { agents, names })
    }

    /// Resolve any id, display name, or alias to its profile.
    pub fn resolve(&self, name: &str) -> Option<&AgentProfile> {
        self.names.get(&fold(name)).map(|&idx| &self.agents[idx])
    }

    /// Canonical id for `name`, if it names a known agent.
    pub fn canonical(&self, name: &str) -> Option<&str> {
        self.resolve(name).map(|agent| agent.id.as_str())
    }

    /// Display names and aliases that span more than one word.
    pub fn multi_word_names(&self) -> impl Iterator<Item = &str> {
        self.agents
            .iter()
            .flat_map(|agent| {
                std::iter::once(agent.display_name.as_str())
                    .chain(agent.aliases.iter().map(String::as_str))
            })
            .map(str::trim)
            .filter(|name| name.contains(char::is_whitespace))
    }

    pub fn get(&self, id: &str) -> Option<&AgentProfile> {
        self.agents.iter().find(|agent| agent.id == id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.agents.iter().map(|agent| agent.id.as_str())
    }

    pub fn agents(&self) -> &[AgentProfile] {
        &self.agents
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// Valid envelope party: a known agent or the orchestrator itself.
    pub fn is_party(&self, id: &str) -> bool {
        id == ORCHESTRATOR_ID || self.get(id).is_some()
    }
}

/// Case- and whitespace-insensitive lookup key.
fn fold(name: &str) -> String {
    name.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id.is_ascii()
        && !id.contains('@')
        && !id.chars().any(char::is_whitespace)
        && id != ORCHESTRATOR_ID
}
