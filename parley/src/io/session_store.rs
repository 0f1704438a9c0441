//! Durable `(scope, provider) -> session id` mapping.
//!
//! The backing file is one JSON object keyed `scope:provider` with values
//! `{"sessionId": .., "updatedAt": ..}`. Bare `provider` keys written by older
//! versions are read as the global scope. A missing or unreadable file is an
//! empty store, never an error.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::core::types::ProviderKind;

pub const DEFAULT_SESSION_FILE: &str = ".parley/sessions.json";

/// Partition key for stored sessions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Scope {
    Global,
    /// One session per agent id.
    Agent(String),
    /// One session per project name.
    Project(String),
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Global => f.write_str("global"),
            Scope::Agent(id) => write!(f, "agent/{id}"),
            Scope::Project(name) => write!(f, "project/{name}"),
        }
    }
}

impl FromStr for Scope {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s == "global" {
            return Ok(Scope::Global);
        }
        let (kind, name) = s
            .split_once('/')
            .ok_or_else(|| anyhow!("invalid session scope '{s}'"))?;
        if name.is_empty() || name.contains(':') {
            return Err(anyhow!("invalid session scope '{s}'"));
        }
        match kind {
            "agent" => Ok(Scope::Agent(name.to_string())),
            "project" => Ok(Scope::Project(name.to_string())),
            _ => Err(anyhow!("invalid session scope '{s}'")),
        }
    }
}

fn store_key(scope: &Scope, provider: ProviderKind) -> String {
    format!("{scope}:{provider}")
}

/// Inverse of [`store_key`], accepting legacy bare provider keys.
fn parse_key(key: &str) -> Option<(Scope, ProviderKind)> {
    match key.rsplit_once(':') {
        Some((scope, provider)) => Some((scope.parse().ok()?, provider.parse().ok()?)),
        None => Some((Scope::Global, key.parse().ok()?)),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredSession {
    session_id: String,
    #[serde(default)]
    updated_at: String,
}

/// One stored session, as listed by [`SessionStore::entries`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEntry {
    pub scope: Scope,
    pub provider: ProviderKind,
    pub session_id: String,
    pub updated_at: Option<DateTime<Utc>>,
}

/// File-backed store. Every call re-reads the file so concurrent runs see
/// each other's last completed write.
#[derive(Debug, Clone)]
pub struct SessionStore {
    path: PathBuf,
}

impl SessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, scope: &Scope, provider: ProviderKind) -> Option<String> {
        let store = self.load();
        let lookup = |key: &str| {
            store
                .get(key)
                .and_then(|value| serde_json::from_value::<StoredSession>(value.clone()).ok())
                .map(|stored| stored.session_id)
                .filter(|id| !id.trim().is_empty())
        };
        lookup(&store_key(scope, provider)).or_else(|| {
            if *scope == Scope::Global {
                lookup(provider.as_str())
            } else {
                None
            }
        })
    }

    pub fn set(&self, scope: &Scope, provider: ProviderKind, session_id: &str) -> Result<()> {
        let mut store = self.load();
        let stored = StoredSession {
            session_id: session_id.to_string(),
            updated_at: Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
        };
        store.insert(
            store_key(scope, provider),
            serde_json::to_value(stored).context("serialize session entry")?,
        );
        if *scope == Scope::Global {
            store.remove(provider.as_str());
        }
        self.save(&store)?;
        debug!(%scope, %provider, "session stored");
        Ok(())
    }

    /// Returns whether anything was removed.
    pub fn clear(&self, scope: &Scope, provider: ProviderKind) -> Result<bool> {
        let mut store = self.load();
        let mut removed = store.remove(&store_key(scope, provider)).is_some();
        if *scope == Scope::Global {
            removed |= store.remove(provider.as_str()).is_some();
        }
        if removed {
            self.save(&store)?;
        }
        Ok(removed)
    }

    pub fn entries(&self) -> Vec<SessionEntry> {
        let mut entries: Vec<SessionEntry> = self
            .load()
            .into_iter()
            .filter_map(|(key, value)| {
                let (scope, provider) = parse_key(&key)?;
                let stored: StoredSession = serde_json::from_value(value).ok()?;
                Some(SessionEntry {
                    scope,
                    provider,
                    session_id: stored.session_id,
                    updated_at: DateTime::parse_from_rfc3339(&stored.updated_at)
                        .ok()
                        .map(|at| at.with_timezone(&Utc)),
                })
            })
            .collect();
        entries.sort_by(|a, b| (&a.scope, a.provider).cmp(&(&b.scope, b.provider)));
        entries.dedup_by(|later, earlier| {
            later.scope == earlier.scope && later.provider == earlier.provider
        });
        entries
    }

    fn load(&self) -> BTreeMap<String, Value> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return BTreeMap::new(),
            Err(err) => {
                warn!(path = %self.path.display(), err = %err, "SessionStoreCorrupt: unreadable, using empty store");
                return BTreeMap::new();
            }
        };
        match serde_json::from_str::<Value>(&contents) {
            Ok(Value::Object(map)) => map.into_iter().collect(),
            Ok(_) => {
                warn!(path = %self.path.display(), "SessionStoreCorrupt: not an object, using empty store");
                BTreeMap::new()
            }
            Err(err) => {
                warn!(path = %self.path.display(), err = %err, "SessionStoreCorrupt: invalid json, using empty store");
                BTreeMap::new()
            }
        }
    }

    fn save(&self, store: &BTreeMap<String, Value>) -> Result<()> {
        let mut buf = serde_json::to_string_pretty(store).context("serialize session store")?;
        buf.push('\n');
        write_atomic(&self.path, &buf)
    }
}

/// Write via a uniquely named sibling temp file, then rename over `path`.
pub(crate) fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let name = path
        .file_name()
        .with_context(|| format!("path missing file name {}", path.display()))?
        .to_string_lossy();
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos())
        .unwrap_or_default();
    let tmp_path = parent.join(format!(".{name}.tmp-{}-{nanos}", std::process::id()));
    let result = fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp file {}", tmp_path.display()))
        .and_then(|()| {
            fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))
        });
    if result.is_err() && tmp_path.exists() {
        let _ = fs::remove_file(&tmp_path);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_in(dir: &tempfile::TempDir) -> SessionStore {
        SessionStore::new(dir.path().join("state").join("sessions.json"))
    }

    #[test]
    fn set_then_get_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store_in(&temp);
        let scope = Scope::Agent("builder".to_string());
        store
            .set(&scope, ProviderKind::Codex, "thread-1")
            .expect("set");
        assert_eq!(
            store.get(&scope, ProviderKind::Codex).as_deref(),
            Some("thread-1")
        );
        assert_eq!(store.get(&scope, ProviderKind::Claude), None);
        assert_eq!(store.get(&Scope::Global, ProviderKind::Codex), None);

        let raw = fs::read_to_string(store.path()).expect("read");
        let value: Value = serde_json::from_str(&raw).expect("json");
        assert_eq!(value["agent/builder:codex"]["sessionId"], "thread-1");
        assert!(value["agent/builder:codex"]["updatedAt"].is_string());
    }

    #[test]
    fn unknown_key_is_none() {
        let temp = tempfile::tempdir().expect("tempdir");
        assert_eq!(store_in(&temp).get(&Scope::Global, ProviderKind::Gemini), None);
    }

    #[test]
    fn corrupt_file_is_an_empty_store() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store_in(&temp);
        fs::create_dir_all(store.path().parent().expect("parent")).expect("mkdir");
        fs::write(store.path(), "{not json").expect("write");
        assert_eq!(store.get(&Scope::Global, ProviderKind::Codex), None);
        assert!(store.entries().is_empty());

        store
            .set(&Scope::Global, ProviderKind::Codex, "fresh")
            .expect("set overwrites corrupt file");
        assert_eq!(
            store.get(&Scope::Global, ProviderKind::Codex).as_deref(),
            Some("fresh")
        );
    }

    #[test]
    fn legacy_bare_keys_read_as_global() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store_in(&temp);
        fs::create_dir_all(store.path().parent().expect("parent")).expect("mkdir");
        fs::write(
            store.path(),
            r#"{"claude": {"sessionId": "legacy", "updatedAt": "2025-01-01T00:00:00+00:00"}}"#,
        )
        .expect("write");
        assert_eq!(
            store.get(&Scope::Global, ProviderKind::Claude).as_deref(),
            Some("legacy")
        );
        let entries = store.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].scope, Scope::Global);
        assert!(entries[0].updated_at.is_some());

        assert!(store.clear(&Scope::Global, ProviderKind::Claude).expect("clear"));
        assert_eq!(store.get(&Scope::Global, ProviderKind::Claude), None);
        assert!(!store.clear(&Scope::Global, ProviderKind::Claude).expect("clear"));
    }

    #[test]
    fn writes_leave_no_temp_files() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store_in(&temp);
        store
            .set(&Scope::Project("demo".to_string()), ProviderKind::Gemini, "g-1")
            .expect("set");
        store
            .set(&Scope::Global, ProviderKind::Codex, "c-1")
            .expect("set");
        let names: Vec<String> = fs::read_dir(store.path().parent().expect("parent"))
            .expect("read dir")
            .map(|entry| entry.expect("entry").file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["sessions.json".to_string()]);
    }

    #[test]
    fn scope_parses_from_its_display_form() {
        for scope in [
            Scope::Global,
            Scope::Agent("reviewer".to_string()),
            Scope::Project("parley".to_string()),
        ] {
            assert_eq!(scope.to_string().parse::<Scope>().expect("parse"), scope);
        }
        assert!("agent/".parse::<Scope>().is_err());
        assert!("team/x".parse::<Scope>().is_err());
    }
}
