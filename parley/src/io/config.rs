//! Layered run configuration.
//!
//! Resolution order, later wins: built-in defaults, `parley.toml`,
//! `parley.local.toml`, then CLI overrides. Files are merged as raw TOML
//! tables before deserializing. Timeout tiers merge field by field over the
//! built-in tiers; every other table absent from both files keeps its default
//! as a whole (the default agents are replaced, not extended, once a file
//! defines `[agents]`). The result is frozen into [`RunSettings`].

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::agents::{AgentProfile, AgentRoster};
use crate::core::history::HistoryLimits;
use crate::core::retry::RetryPolicy;
use crate::core::router::{RouteRule, RouterConfig};
use crate::core::safety::SafetyPolicy;
use crate::core::types::{OutputKind, ProviderKind, ResponseMode};
use crate::io::process::ProcessLimits;
use crate::io::session_store::DEFAULT_SESSION_FILE;

pub const CONFIG_FILE: &str = "parley.toml";
pub const LOCAL_CONFIG_FILE: &str = "parley.local.toml";

/// Prompts above this size go to the child's stdin instead of argv.
pub const DEFAULT_STDIN_THRESHOLD_BYTES: usize = 96 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ParleyConfig {
    pub defaults: Defaults,
    /// Named timeout tiers (`quick`, `standard`, `complex`, or custom).
    pub timeouts: BTreeMap<String, TimeoutProfile>,
    /// Keyed by provider name (`codex`, `claude`, `gemini`).
    pub providers: BTreeMap<String, ProviderConfig>,
    pub run: RunConfig,
    /// Keyed by canonical agent id. Rotation follows key order unless
    /// `run.order` is set.
    pub agents: BTreeMap<String, AgentConfig>,
    pub routing: RoutingConfig,
    pub protocol: ProtocolConfig,
    pub history: HistoryLimits,
    pub safety: SafetyConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Defaults {
    pub timeout_level: String,
    /// Process-level retries after the first attempt.
    pub retry_attempts: u32,
    pub retry_backoff_secs: f64,
    /// Forward assistant text to stdout while it streams.
    pub stream: bool,
    /// Resume and persist provider sessions.
    pub use_session: bool,
    pub session_scope: SessionScopeKind,
    pub stdin_threshold_bytes: usize,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            timeout_level: "standard".to_string(),
            retry_attempts: 1,
            retry_backoff_secs: 1.0,
            stream: true,
            use_session: true,
            session_scope: SessionScopeKind::Agent,
            stdin_threshold_bytes: DEFAULT_STDIN_THRESHOLD_BYTES,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionScopeKind {
    Global,
    Agent,
    Project,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TimeoutProfile {
    pub idle_timeout_secs: f64,
    pub max_timeout_secs: f64,
    pub terminate_grace_secs: f64,
}

impl Default for TimeoutProfile {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 300.0,
            max_timeout_secs: 1800.0,
            terminate_grace_secs: 5.0,
        }
    }
}

impl TimeoutProfile {
    fn new(idle: f64, max: f64, grace: f64) -> Self {
        Self {
            idle_timeout_secs: idle,
            max_timeout_secs: max,
            terminate_grace_secs: grace,
        }
    }

    pub fn limits(&self) -> Result<ProcessLimits> {
        Ok(ProcessLimits {
            idle_timeout: seconds(self.idle_timeout_secs, "idle_timeout_secs")?,
            max_timeout: seconds(self.max_timeout_secs, "max_timeout_secs")?,
            terminate_grace: seconds(self.terminate_grace_secs, "terminate_grace_secs")?,
        })
    }

    fn validate(&self, name: &str) -> Result<()> {
        let positive = |value: f64| value.is_finite() && value > 0.0;
        if !positive(self.idle_timeout_secs) || !positive(self.max_timeout_secs) {
            return Err(anyhow!("timeouts.{name}: idle and max timeouts must be > 0"));
        }
        if !self.terminate_grace_secs.is_finite() || self.terminate_grace_secs < 0.0 {
            return Err(anyhow!("timeouts.{name}.terminate_grace_secs must be >= 0"));
        }
        Ok(())
    }
}

fn seconds(value: f64, field: &str) -> Result<Duration> {
    Duration::try_from_secs_f64(value).map_err(|err| anyhow!("{field} = {value}: {err}"))
}

fn default_timeouts() -> BTreeMap<String, TimeoutProfile> {
    BTreeMap::from([
        ("quick".to_string(), TimeoutProfile::new(60.0, 300.0, 3.0)),
        ("standard".to_string(), TimeoutProfile::new(300.0, 1800.0, 5.0)),
        ("complex".to_string(), TimeoutProfile::new(900.0, 3600.0, 8.0)),
    ])
}

/// Per-provider overrides of [`Defaults`].
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProviderConfig {
    /// Binary path; otherwise `<PROVIDER>_BIN`, then the provider name.
    pub binary: Option<String>,
    pub timeout_level: Option<String>,
    pub retry_attempts: Option<u32>,
    pub retry_backoff_secs: Option<f64>,
    pub stdin_threshold_bytes: Option<usize>,
    /// Default provider options, overridden per agent.
    pub options: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RunConfig {
    pub default_rounds: u32,
    pub start_agent: String,
    /// Rotation order; empty means agent declaration order.
    pub order: Vec<String>,
    pub workdir: Option<PathBuf>,
    pub session_file: PathBuf,
    /// JSONL audit log; none disables the file sink.
    pub audit_log: Option<PathBuf>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            default_rounds: 4,
            start_agent: "builder".to_string(),
            order: Vec::new(),
            workdir: None,
            session_file: PathBuf::from(DEFAULT_SESSION_FILE),
            audit_log: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    pub display_name: Option<String>,
    pub provider: ProviderKind,
    pub response_mode: ResponseMode,
    pub output: OutputKind,
    pub mission: String,
    pub aliases: Vec<String>,
    pub provider_options: BTreeMap<String, String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            display_name: None,
            provider: ProviderKind::Codex,
            response_mode: ResponseMode::TextOnly,
            output: OutputKind::Delivery,
            mission: String::new(),
            aliases: Vec::new(),
            provider_options: BTreeMap::new(),
        }
    }
}

fn default_agents() -> BTreeMap<String, AgentConfig> {
    BTreeMap::from([
        (
            "builder".to_string(),
            AgentConfig {
                display_name: Some("Builder".to_string()),
                provider: ProviderKind::Codex,
                response_mode: ResponseMode::Execute,
                output: OutputKind::Delivery,
                mission: "Implement the request in the working directory and report \
                          the evidence that it works."
                    .to_string(),
                aliases: vec!["dev".to_string()],
                provider_options: BTreeMap::new(),
            },
        ),
        (
            "reviewer".to_string(),
            AgentConfig {
                display_name: Some("Reviewer".to_string()),
                provider: ProviderKind::Claude,
                response_mode: ResponseMode::TextOnly,
                output: OutputKind::Review,
                mission: "Verify the latest delivery, list concrete issues and decide \
                          the release gate."
                    .to_string(),
                aliases: vec!["qa".to_string()],
                provider_options: BTreeMap::new(),
            },
        ),
    ])
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RoutingConfig {
    pub max_hops: u32,
    pub loop_window: usize,
    pub loop_threshold: usize,
    pub rules: Vec<RouteRule>,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            max_hops: 16,
            loop_window: 6,
            loop_threshold: 3,
            rules: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ProtocolConfig {
    /// In-turn re-prompts after a rejected output.
    pub max_retries: u32,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self { max_retries: 3 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SafetyConfig {
    pub read_only: bool,
    /// Empty allows any workdir.
    pub allowed_roots: Vec<PathBuf>,
    pub command_allowlist: Vec<String>,
    pub command_denylist: Vec<String>,
    pub codex_sandbox_read_only: String,
    pub codex_sandbox_default: String,
    pub claude_disallowed_tools_read_only: Vec<String>,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            read_only: false,
            allowed_roots: Vec::new(),
            command_allowlist: Vec::new(),
            command_denylist: Vec::new(),
            codex_sandbox_read_only: "read-only".to_string(),
            codex_sandbox_default: "workspace-write".to_string(),
            claude_disallowed_tools_read_only: vec![
                "Bash".to_string(),
                "Edit".to_string(),
                "Write".to_string(),
            ],
        }
    }
}

impl Default for ParleyConfig {
    fn default() -> Self {
        Self {
            defaults: Defaults::default(),
            timeouts: default_timeouts(),
            providers: BTreeMap::new(),
            run: RunConfig::default(),
            agents: default_agents(),
            routing: RoutingConfig::default(),
            protocol: ProtocolConfig::default(),
            history: HistoryLimits::default(),
            safety: SafetyConfig::default(),
        }
    }
}

impl ParleyConfig {
    pub fn validate(&self) -> Result<()> {
        for (name, profile) in &self.timeouts {
            profile.validate(name)?;
        }
        self.timeout(&self.defaults.timeout_level)?;
        for (name, provider) in &self.providers {
            name.parse::<ProviderKind>()
                .map_err(|err| anyhow!("providers.{name}: {err}"))?;
            if let Some(level) = &provider.timeout_level {
                self.timeout(level)
                    .with_context(|| format!("providers.{name}.timeout_level"))?;
            }
            if provider
                .retry_backoff_secs
                .is_some_and(|secs| !secs.is_finite() || secs < 0.0)
            {
                return Err(anyhow!("providers.{name}.retry_backoff_secs must be >= 0"));
            }
        }
        if self.defaults.retry_backoff_secs < 0.0 || !self.defaults.retry_backoff_secs.is_finite()
        {
            return Err(anyhow!("defaults.retry_backoff_secs must be >= 0"));
        }
        if self.run.default_rounds == 0 {
            return Err(anyhow!("run.default_rounds must be >= 1"));
        }
        if self.agents.is_empty() {
            return Err(anyhow!("at least one agent must be configured"));
        }
        if self.routing.loop_window == 0 || self.routing.loop_threshold < 2 {
            return Err(anyhow!(
                "routing.loop_window must be > 0 and routing.loop_threshold >= 2"
            ));
        }
        Ok(())
    }

    pub fn timeout(&self, level: &str) -> Result<&TimeoutProfile> {
        self.timeouts
            .get(level)
            .ok_or_else(|| anyhow!("unknown timeout level '{level}'"))
    }
}

/// Values supplied on the command line; `None` keeps the file value.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub rounds: Option<u32>,
    pub start_agent: Option<String>,
    pub workdir: Option<PathBuf>,
    pub timeout_level: Option<String>,
    pub read_only: Option<bool>,
    pub use_session: Option<bool>,
    pub stream: Option<bool>,
    pub session_file: Option<PathBuf>,
    pub audit_log: Option<PathBuf>,
}

/// Effective settings for one provider.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderSettings {
    pub binary: Option<String>,
    pub limits: ProcessLimits,
    pub retry: RetryPolicy,
    pub stdin_threshold_bytes: usize,
}

/// Everything a run needs, resolved once.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub roster: AgentRoster,
    pub providers: BTreeMap<ProviderKind, ProviderSettings>,
    pub router: RouterConfig,
    pub start_agent: String,
    pub rounds: u32,
    pub max_retries: u32,
    pub history: HistoryLimits,
    pub safety: SafetyPolicy,
    pub workdir: PathBuf,
    pub stream: bool,
    /// `None` when sessions are disabled.
    pub session_file: Option<PathBuf>,
    pub session_scope: SessionScopeKind,
    pub audit_log: Option<PathBuf>,
}

impl RunSettings {
    pub fn provider(&self, kind: ProviderKind) -> Option<&ProviderSettings> {
        self.providers.get(&kind)
    }
}

fn read_table(path: &Path) -> Result<Option<toml::Table>> {
    if !path.exists() {
        return Ok(None);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let table: toml::Table =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    debug!(path = %path.display(), "loaded config layer");
    Ok(Some(table))
}

/// Recursive merge; tables merge key by key, anything else is replaced.
fn merge_tables(base: &mut toml::Table, layer: toml::Table) {
    for (key, value) in layer {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

/// Load `parley.toml` and `parley.local.toml` from `dir`.
///
/// Missing files contribute nothing; with neither present this is
/// `ParleyConfig::default()`.
pub fn load_config(dir: &Path) -> Result<ParleyConfig> {
    load_config_files(&dir.join(CONFIG_FILE), &dir.join(LOCAL_CONFIG_FILE))
}

pub fn load_config_files(path: &Path, local_path: &Path) -> Result<ParleyConfig> {
    let mut merged = toml::Table::new();
    // Tiers merge per field over the built-in ones.
    merged.insert(
        "timeouts".to_string(),
        toml::Value::try_from(default_timeouts()).context("encode default timeouts")?,
    );
    for layer in [read_table(path)?, read_table(local_path)?]
        .into_iter()
        .flatten()
    {
        merge_tables(&mut merged, layer);
    }
    let cfg: ParleyConfig = toml::Value::Table(merged)
        .try_into()
        .context("decode merged config")?;
    cfg.validate()?;
    Ok(cfg)
}

fn env_binary(kind: ProviderKind) -> Option<String> {
    let var = format!("{}_BIN", kind.as_str().to_ascii_uppercase());
    std::env::var(var).ok().filter(|value| !value.trim().is_empty())
}

/// Provider defaults, then agent options, then the read-only clamp.
fn effective_options(
    agent: &AgentConfig,
    provider: Option<&ProviderConfig>,
    safety: &SafetyConfig,
    read_only: bool,
) -> BTreeMap<String, String> {
    let mut options = provider
        .map(|provider| provider.options.clone())
        .unwrap_or_default();
    options.extend(agent.provider_options.clone());
    match agent.provider {
        ProviderKind::Codex if read_only => {
            options.remove("exec_mode");
            options.insert("sandbox".to_string(), safety.codex_sandbox_read_only.clone());
        }
        ProviderKind::Codex => {
            options
                .entry("sandbox".to_string())
                .or_insert_with(|| safety.codex_sandbox_default.clone());
        }
        ProviderKind::Claude if read_only => {
            options.insert("permission_mode".to_string(), "default".to_string());
            options.insert(
                "disallowed_tools".to_string(),
                safety.claude_disallowed_tools_read_only.join(","),
            );
        }
        ProviderKind::Gemini if read_only => {
            options.remove("yolo");
            options.insert("approval_mode".to_string(), "default".to_string());
        }
        ProviderKind::Claude | ProviderKind::Gemini => {}
    }
    options
}

/// Freeze `cfg` plus `overrides` into [`RunSettings`].
///
/// Relative paths resolve against `base_dir`.
pub fn resolve(cfg: &ParleyConfig, overrides: &Overrides, base_dir: &Path) -> Result<RunSettings> {
    cfg.validate()?;
    let read_only = overrides.read_only.unwrap_or(cfg.safety.read_only);
    if let Some(level) = &overrides.timeout_level {
        cfg.timeout(level)?;
    }

    let mut profiles = Vec::with_capacity(cfg.agents.len());
    for (id, agent) in &cfg.agents {
        let provider_cfg = cfg.providers.get(agent.provider.as_str());
        profiles.push(AgentProfile {
            id: id.clone(),
            display_name: agent.display_name.clone().unwrap_or_else(|| id.clone()),
            provider: agent.provider,
            response_mode: agent.response_mode,
            output: agent.output,
            mission: agent.mission.clone(),
            aliases: agent.aliases.clone(),
            provider_options: effective_options(agent, provider_cfg, &cfg.safety, read_only),
        });
    }
    let roster = AgentRoster::new(profiles).context("build agent roster")?;

    let mut providers = BTreeMap::new();
    for kind in ProviderKind::ALL {
        let provider_cfg = cfg.providers.get(kind.as_str());
        let level = overrides
            .timeout_level
            .as_deref()
            .or(provider_cfg.and_then(|p| p.timeout_level.as_deref()))
            .unwrap_or(&cfg.defaults.timeout_level);
        let backoff = provider_cfg
            .and_then(|p| p.retry_backoff_secs)
            .unwrap_or(cfg.defaults.retry_backoff_secs);
        providers.insert(
            kind,
            ProviderSettings {
                binary: provider_cfg
                    .and_then(|p| p.binary.clone())
                    .or_else(|| env_binary(kind)),
                limits: cfg
                    .timeout(level)?
                    .limits()
                    .with_context(|| format!("timeouts.{level}"))?,
                retry: RetryPolicy {
                    attempts: provider_cfg
                        .and_then(|p| p.retry_attempts)
                        .unwrap_or(cfg.defaults.retry_attempts),
                    backoff: seconds(backoff, "retry_backoff_secs")
                        .with_context(|| format!("providers.{kind}"))?,
                },
                stdin_threshold_bytes: provider_cfg
                    .and_then(|p| p.stdin_threshold_bytes)
                    .unwrap_or(cfg.defaults.stdin_threshold_bytes),
            },
        );
    }

    let mut order = Vec::new();
    for name in &cfg.run.order {
        let id = roster
            .canonical(name)
            .ok_or_else(|| anyhow!("run.order names unknown agent '{name}'"))?;
        order.push(id.to_string());
    }
    if order.is_empty() {
        order = roster.ids().map(str::to_string).collect();
    }
    for rule in &cfg.routing.rules {
        if rule.from != "*" && roster.canonical(&rule.from).is_none() {
            return Err(anyhow!("route rule '{}' has unknown from '{}'", rule.id, rule.from));
        }
        if roster.canonical(&rule.to).is_none() {
            return Err(anyhow!("route rule '{}' has unknown to '{}'", rule.id, rule.to));
        }
    }

    let start_name = overrides
        .start_agent
        .as_deref()
        .unwrap_or(&cfg.run.start_agent);
    let start_agent = roster
        .canonical(start_name)
        .ok_or_else(|| anyhow!("unknown start agent '{start_name}'"))?
        .to_string();
    let rounds = overrides.rounds.unwrap_or(cfg.run.default_rounds);
    if rounds == 0 {
        return Err(anyhow!("rounds must be >= 1"));
    }

    let absolute = |path: &Path| {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            base_dir.join(path)
        }
    };
    let workdir = absolute(
        overrides
            .workdir
            .as_deref()
            .or(cfg.run.workdir.as_deref())
            .unwrap_or(Path::new(".")),
    );
    let workdir = workdir
        .canonicalize()
        .with_context(|| format!("resolve workdir {}", workdir.display()))?;
    let roots: Vec<PathBuf> = cfg
        .safety
        .allowed_roots
        .iter()
        .map(|root| {
            let root = absolute(root);
            root.canonicalize().unwrap_or(root)
        })
        .collect();
    let safety = SafetyPolicy::new(
        &cfg.safety.command_allowlist,
        &cfg.safety.command_denylist,
        roots,
        read_only,
    )
    .context("build safety policy")?;
    safety.check_workdir(&workdir)?;

    let use_session = overrides.use_session.unwrap_or(cfg.defaults.use_session);
    let session_file = use_session.then(|| {
        absolute(
            overrides
                .session_file
                .as_deref()
                .unwrap_or(&cfg.run.session_file),
        )
    });

    Ok(RunSettings {
        roster,
        providers,
        router: RouterConfig {
            order,
            rules: cfg.routing.rules.clone(),
            max_hops: cfg.routing.max_hops,
            loop_window: cfg.routing.loop_window,
            loop_threshold: cfg.routing.loop_threshold,
        },
        start_agent,
        rounds,
        max_retries: cfg.protocol.max_retries,
        history: cfg.history.clone(),
        safety,
        workdir,
        stream: overrides.stream.unwrap_or(cfg.defaults.stream),
        session_file,
        session_scope: cfg.defaults.session_scope,
        audit_log: overrides
            .audit_log
            .as_deref()
            .or(cfg.run.audit_log.as_deref())
            .map(absolute),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(temp.path()).expect("load");
        assert_eq!(cfg, ParleyConfig::default());
        assert_eq!(cfg.timeout("quick").expect("quick").idle_timeout_secs, 60.0);
        assert_eq!(
            cfg.timeout("complex").expect("complex").terminate_grace_secs,
            8.0
        );
    }

    #[test]
    fn local_file_overrides_shared_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(
            temp.path().join(CONFIG_FILE),
            "[run]\ndefault_rounds = 6\nstart_agent = \"reviewer\"\n\n[protocol]\nmax_retries = 1\n",
        )
        .expect("write");
        fs::write(
            temp.path().join(LOCAL_CONFIG_FILE),
            "[run]\ndefault_rounds = 2\n\n[timeouts.quick]\nidle_timeout_secs = 5.0\n",
        )
        .expect("write");

        let cfg = load_config(temp.path()).expect("load");
        assert_eq!(cfg.run.default_rounds, 2);
        assert_eq!(cfg.run.start_agent, "reviewer");
        assert_eq!(cfg.protocol.max_retries, 1);
        let quick = cfg.timeout("quick").expect("quick");
        assert_eq!(quick.idle_timeout_secs, 5.0);
        assert_eq!(quick.max_timeout_secs, 300.0);
        assert!(cfg.timeout("standard").is_ok());
    }

    #[test]
    fn configured_agents_replace_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(
            temp.path().join(CONFIG_FILE),
            r#"
[run]
start_agent = "planner"

[agents.planner]
provider = "gemini"
output = "plan"
mission = "Break the request down."
"#,
        )
        .expect("write");
        let cfg = load_config(temp.path()).expect("load");
        assert_eq!(cfg.agents.len(), 1);
        let settings = resolve(&cfg, &Overrides::default(), temp.path()).expect("resolve");
        assert_eq!(settings.start_agent, "planner");
        assert_eq!(settings.router.order, vec!["planner".to_string()]);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(
            temp.path().join(CONFIG_FILE),
            "[defaults]\ntimeout_level = \"glacial\"\n",
        )
        .expect("write");
        let err = load_config(temp.path()).unwrap_err();
        assert!(err.to_string().contains("glacial"));

        let mut cfg = ParleyConfig::default();
        cfg.providers
            .insert("gpt".to_string(), ProviderConfig::default());
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn resolve_applies_overrides_and_tiers() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut cfg = ParleyConfig::default();
        cfg.providers.insert(
            "claude".to_string(),
            ProviderConfig {
                timeout_level: Some("complex".to_string()),
                retry_attempts: Some(3),
                ..ProviderConfig::default()
            },
        );
        let overrides = Overrides {
            rounds: Some(2),
            start_agent: Some("QA".to_string()),
            use_session: Some(false),
            ..Overrides::default()
        };
        let settings = resolve(&cfg, &overrides, temp.path()).expect("resolve");
        assert_eq!(settings.rounds, 2);
        assert_eq!(settings.start_agent, "reviewer");
        assert_eq!(settings.session_file, None);

        let claude = settings.provider(ProviderKind::Claude).expect("claude");
        assert_eq!(claude.limits.idle_timeout, Duration::from_secs(900));
        assert_eq!(claude.retry.attempts, 3);
        let codex = settings.provider(ProviderKind::Codex).expect("codex");
        assert_eq!(codex.limits.max_timeout, Duration::from_secs(1800));
        assert_eq!(codex.retry.attempts, 1);

        let quick = Overrides {
            timeout_level: Some("quick".to_string()),
            ..Overrides::default()
        };
        let settings = resolve(&cfg, &quick, temp.path()).expect("resolve");
        let claude = settings.provider(ProviderKind::Claude).expect("claude");
        assert_eq!(claude.limits.terminate_grace, Duration::from_secs(3));
    }

    #[test]
    fn read_only_clamps_provider_options() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut cfg = ParleyConfig::default();
        if let Some(builder) = cfg.agents.get_mut("builder") {
            builder
                .provider_options
                .insert("exec_mode".to_string(), "bypass".to_string());
        }

        let settings = resolve(&cfg, &Overrides::default(), temp.path()).expect("resolve");
        let builder = settings.roster.get("builder").expect("builder");
        assert_eq!(builder.provider_options["sandbox"], "workspace-write");
        assert_eq!(builder.provider_options["exec_mode"], "bypass");

        let overrides = Overrides {
            read_only: Some(true),
            ..Overrides::default()
        };
        let settings = resolve(&cfg, &overrides, temp.path()).expect("resolve");
        assert!(settings.safety.read_only());
        let builder = settings.roster.get("builder").expect("builder");
        assert_eq!(builder.provider_options["sandbox"], "read-only");
        assert!(!builder.provider_options.contains_key("exec_mode"));
        let reviewer = settings.roster.get("reviewer").expect("reviewer");
        assert_eq!(reviewer.provider_options["disallowed_tools"], "Bash,Edit,Write");
    }

    #[test]
    fn read_only_drops_gemini_yolo() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut cfg = ParleyConfig::default();
        cfg.agents.insert(
            "planner".to_string(),
            AgentConfig {
                provider: ProviderKind::Gemini,
                output: OutputKind::Plan,
                provider_options: BTreeMap::from([
                    ("yolo".to_string(), "true".to_string()),
                    ("allowed_tools".to_string(), "read_file".to_string()),
                ]),
                ..AgentConfig::default()
            },
        );
        let overrides = Overrides {
            read_only: Some(true),
            ..Overrides::default()
        };

        let settings = resolve(&cfg, &overrides, temp.path()).expect("resolve");
        let planner = settings.roster.get("planner").expect("planner");
        assert!(!planner.provider_options.contains_key("yolo"));
        assert_eq!(planner.provider_options["approval_mode"], "default");
        assert_eq!(planner.provider_options["allowed_tools"], "read_file");
    }

    #[test]
    fn workdir_outside_allowed_roots_is_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let allowed = temp.path().join("allowed");
        fs::create_dir_all(&allowed).expect("mkdir");
        let mut cfg = ParleyConfig::default();
        cfg.safety.allowed_roots = vec![allowed.clone()];

        let inside = Overrides {
            workdir: Some(allowed),
            ..Overrides::default()
        };
        assert!(resolve(&cfg, &inside, temp.path()).is_ok());
        let err = resolve(&cfg, &Overrides::default(), temp.path()).unwrap_err();
        assert!(err.to_string().contains("outside allowed roots"));
    }

    #[test]
    fn non_finite_backoff_is_rejected_at_load() {
        let temp = tempfile::tempdir().expect("tempdir");
        for value in ["inf", "nan", "-1.0"] {
            fs::write(
                temp.path().join(CONFIG_FILE),
                format!("[providers.codex]\nretry_backoff_secs = {value}\n"),
            )
            .expect("write");
            let err = load_config(temp.path()).unwrap_err();
            assert!(
                format!("{err:#}").contains("providers.codex.retry_backoff_secs"),
                "{value}: {err:#}"
            );
        }
    }

    #[test]
    fn oversized_durations_fail_resolve_instead_of_panicking() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut cfg = ParleyConfig::default();
        cfg.providers.insert(
            "codex".to_string(),
            ProviderConfig {
                retry_backoff_secs: Some(1e300),
                ..ProviderConfig::default()
            },
        );
        let err = resolve(&cfg, &Overrides::default(), temp.path()).unwrap_err();
        assert!(format!("{err:#}").contains("retry_backoff_secs"), "{err:#}");

        let mut cfg = ParleyConfig::default();
        cfg.timeouts
            .insert("huge".to_string(), TimeoutProfile::new(1e300, 1e300, 1.0));
        cfg.defaults.timeout_level = "huge".to_string();
        let err = resolve(&cfg, &Overrides::default(), temp.path()).unwrap_err();
        assert!(format!("{err:#}").contains("timeouts.huge"), "{err:#}");
    }
}
