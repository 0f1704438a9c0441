//! Command and workspace policy applied to validated agent output.
//!
//! Deny patterns win over allow patterns. An empty allow list allows every
//! command that no deny pattern matches. Evidence commands must also stay
//! inside the run's workdir: absolute paths and `cd` targets are resolved
//! lexically against it.

use std::path::{Component, Path, PathBuf};

use regex::Regex;
use thiserror::Error;

use crate::core::message::Evidence;
use crate::core::validator::{ValidationCode, ValidationIssue};

#[derive(Debug, Error)]
pub enum SafetyError {
    #[error("invalid command pattern '{pattern}'")]
    Pattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("workdir {} is outside allowed roots", .0.display())]
    OutsideRoots(PathBuf),
}

#[derive(Debug, Clone, Default)]
pub struct SafetyPolicy {
    allow: Vec<Regex>,
    deny: Vec<Regex>,
    allowed_roots: Vec<PathBuf>,
    read_only: bool,
}

fn compile(patterns: &[String]) -> Result<Vec<Regex>, SafetyError> {
    patterns
        .iter()
        .filter(|pattern| !pattern.is_empty())
        .map(|pattern| {
            Regex::new(pattern).map_err(|source| SafetyError::Pattern {
                pattern: pattern.clone(),
                source,
            })
        })
        .collect()
}

impl SafetyPolicy {
    pub fn new(
        allow: &[String],
        deny: &[String],
        allowed_roots: Vec<PathBuf>,
        read_only: bool,
    ) -> Result<Self, SafetyError> {
        Ok(Self {
            allow: compile(allow)?,
            deny: compile(deny)?,
            allowed_roots,
            read_only,
        })
    }

    pub fn read_only(&self) -> bool {
        self.read_only
    }

    /// One issue per offending command, indexed like the evidence list.
    pub fn check_commands(&self, evidence: &[Evidence], path: &str) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();
        for (idx, item) in evidence.iter().enumerate() {
            let command = item.command.as_str();
            if self.deny.iter().any(|re| re.is_match(command)) {
                issues.push(ValidationIssue::new(
                    ValidationCode::SafetyCommandDenied,
                    format!("{path}[{idx}].command"),
                    format!("command is denied by policy: {command}"),
                ));
            } else if !self.allow.is_empty() && !self.allow.iter().any(|re| re.is_match(command)) {
                issues.push(ValidationIssue::new(
                    ValidationCode::SafetyCommandNotAllowed,
                    format!("{path}[{idx}].command"),
                    format!("command is not in the allow list: {command}"),
                ));
            }
        }
        issues
    }

    /// Flags evidence commands that reach outside `workdir`.
    pub fn check_command_paths(
        &self,
        evidence: &[Evidence],
        path: &str,
        workdir: &Path,
    ) -> Vec<ValidationIssue> {
        let root = normalize(workdir);
        let mut issues = Vec::new();
        for (idx, item) in evidence.iter().enumerate() {
            let mut outside: Vec<String> = command_paths(&item.command, &root)
                .into_iter()
                .filter(|(_, resolved)| !resolved.starts_with(&root))
                .map(|(raw, _)| raw)
                .collect();
            if outside.is_empty() {
                continue;
            }
            outside.sort();
            outside.dedup();
            issues.push(ValidationIssue::new(
                ValidationCode::WorkdirCommandOutside,
                format!("{path}[{idx}].command"),
                format!(
                    "command references paths outside workdir {}: {}",
                    root.display(),
                    outside.join(", ")
                ),
            ));
        }
        issues
    }

    /// Component-wise containment check; callers pass canonical paths.
    pub fn check_workdir(&self, workdir: &Path) -> Result<(), SafetyError> {
        if self.allowed_roots.is_empty()
            || self
                .allowed_roots
                .iter()
                .any(|root| workdir.starts_with(root))
        {
            return Ok(());
        }
        Err(SafetyError::OutsideRoots(workdir.to_path_buf()))
    }
}

/// Paths outside any workspace that commands may still touch.
const NEUTRAL_PATHS: &[&str] = &["/dev/null", "/dev/stdout", "/dev/stderr"];

/// Resolve `.` and `..` without touching the filesystem.
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

/// `(as written, resolved)` for every absolute path and `cd` target in
/// `command`.
fn command_paths(command: &str, root: &Path) -> Vec<(String, PathBuf)> {
    let tokens = shell_words::split(command)
        .unwrap_or_else(|_| command.split_whitespace().map(str::to_string).collect());
    let mut found = Vec::new();
    let mut after_cd = false;
    for token in &tokens {
        let raw = token.trim();
        let mut candidates = vec![raw];
        if raw.starts_with('-')
            && let Some((_, value)) = raw.split_once('=')
        {
            candidates.push(value.trim());
        }
        for candidate in candidates {
            let value = candidate
                .trim_matches(|c: char| matches!(c, '\'' | '"' | '`'))
                .trim_start_matches('(')
                .trim_end_matches(|c: char| matches!(c, ';' | ',' | '|' | '&' | ')'));
            if value.is_empty() || value.contains("://") || NEUTRAL_PATHS.contains(&value) {
                continue;
            }
            if value.starts_with('/') {
                found.push((value.to_string(), normalize(Path::new(value))));
            } else if after_cd && value != "-" && !value.starts_with('~') {
                found.push((value.to_string(), normalize(&root.join(value))));
            }
        }
        after_cd = raw == "cd";
    }
    found
}
