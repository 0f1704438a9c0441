//! Test-only fixtures: agent profiles, valid messages, scripted providers.

use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::path::Path;
use std::rc::Rc;
use std::time::Duration;

use serde_json::{Value, json};

use crate::core::agents::{AgentProfile, AgentRoster};
use crate::core::history::HistoryLimits;
use crate::core::retry::RetryPolicy;
use crate::core::router::RouterConfig;
use crate::core::safety::SafetyPolicy;
use crate::core::types::{OutputKind, ProcessErrorKind, ProviderKind, ResponseMode};
use crate::io::audit::{AuditEvent, AuditKind, AuditSink, RunSummary};
use crate::io::config::{
    DEFAULT_STDIN_THRESHOLD_BYTES, ProviderSettings, RunSettings, SessionScopeKind,
};
use crate::io::process::{ProcessFailure, ProcessLimits};
use crate::providers::{Provider, ProviderReply, ProviderRequest, TextSink};

/// Deterministic agent profile with no aliases or options.
pub fn agent(id: &str, provider: ProviderKind, output: OutputKind) -> AgentProfile {
    AgentProfile {
        id: id.to_string(),
        display_name: id.to_string(),
        provider,
        response_mode: match output {
            OutputKind::Delivery => ResponseMode::Execute,
            OutputKind::Plan | OutputKind::Review => ResponseMode::TextOnly,
        },
        output,
        mission: format!("{id} mission"),
        aliases: Vec::new(),
        provider_options: BTreeMap::new(),
    }
}

/// `builder` (codex, delivery) then `reviewer` (claude, review).
pub fn two_agent_roster() -> AgentRoster {
    AgentRoster::new(vec![
        agent("builder", ProviderKind::Codex, OutputKind::Delivery),
        agent("reviewer", ProviderKind::Claude, OutputKind::Review),
    ])
    .expect("two agent roster")
}

/// Settings for [`two_agent_roster`]: two rounds starting at `builder`, no
/// process retries, two repair attempts, sessions off.
pub fn run_settings(workdir: &Path) -> RunSettings {
    let provider = ProviderSettings {
        binary: None,
        limits: ProcessLimits {
            idle_timeout: Duration::from_secs(5),
            max_timeout: Duration::from_secs(10),
            terminate_grace: Duration::from_millis(200),
        },
        retry: RetryPolicy::none(),
        stdin_threshold_bytes: DEFAULT_STDIN_THRESHOLD_BYTES,
    };
    RunSettings {
        roster: two_agent_roster(),
        providers: ProviderKind::ALL
            .into_iter()
            .map(|kind| (kind, provider.clone()))
            .collect(),
        router: RouterConfig {
            order: vec!["builder".to_string(), "reviewer".to_string()],
            rules: Vec::new(),
            max_hops: 16,
            loop_window: 6,
            loop_threshold: 3,
        },
        start_agent: "builder".to_string(),
        rounds: 2,
        max_retries: 2,
        history: HistoryLimits::default(),
        safety: SafetyPolicy::default(),
        workdir: workdir.to_path_buf(),
        stream: true,
        session_file: None,
        session_scope: SessionScopeKind::Agent,
        audit_log: None,
    }
}

pub fn valid_plan() -> Value {
    json!({
        "schema_version": "parley.plan.v1",
        "status": "ok",
        "result": {
            "requirement_breakdown": ["expose a --version flag"],
            "implementation_scope": "src/main.rs only",
            "acceptance_criteria": ["`app --version` prints the crate version"],
            "handoff_notes": "clap derive already in use"
        },
        "next_question": "Should the flag also print the git hash?",
        "warnings": [],
        "errors": []
    })
}

pub fn valid_delivery() -> Value {
    json!({
        "schema_version": "parley.delivery.v1",
        "status": "ok",
        "result": {
            "task_understanding": "add a --version flag",
            "implementation_plan": "derive version on the clap command",
            "execution_evidence": [
                {"command": "cargo test", "result": "14 passed"}
            ],
            "risks_and_rollback": "revert the single commit"
        },
        "next_question": "Can you verify the flag output?",
        "warnings": [],
        "errors": []
    })
}

pub fn valid_review() -> Value {
    json!({
        "schema_version": "parley.review.v1",
        "status": "ok",
        "acceptance": "pass",
        "verification": [
            {"command": "cargo test", "result": "14 passed"},
            {"command": "cargo run -- --version", "result": "app 0.1.0"}
        ],
        "root_cause": [],
        "issues": [],
        "gate": {"decision": "allow", "conditions": []},
        "next_question": "Anything else to cover?",
        "warnings": [],
        "errors": []
    })
}

/// Successful provider reply.
pub fn reply(text: &str, session_id: Option<&str>) -> Result<ProviderReply, ProcessFailure> {
    Ok(ProviderReply {
        text: text.to_string(),
        session_id: session_id.map(str::to_string),
        elapsed_ms: 5,
        command: String::new(),
        return_code: Some(0),
        stderr_tail: Vec::new(),
    })
}

/// Failed provider call of `kind` with the given stderr tail.
pub fn failure(
    provider: ProviderKind,
    kind: ProcessErrorKind,
    stderr: &[&str],
) -> Result<ProviderReply, ProcessFailure> {
    Err(ProcessFailure {
        label: provider.as_str().to_string(),
        kind,
        command: format!("{provider} exec --json"),
        elapsed_ms: 7,
        return_code: matches!(kind, ProcessErrorKind::Exit).then_some(1),
        session_id: None,
        pid: Some(4242),
        stderr_tail: stderr.iter().map(|line| line.to_string()).collect(),
        detail: None,
    })
}

/// What a scripted provider was asked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    pub prompt: String,
    pub session_id: Option<String>,
    pub options: BTreeMap<String, String>,
}

#[derive(Default)]
struct Script {
    replies: VecDeque<Result<ProviderReply, ProcessFailure>>,
    calls: Vec<RecordedCall>,
}

/// Provider that replays canned results in order.
///
/// Clones share one script, so a test can keep a handle after moving the
/// provider into a [`crate::providers::ProviderSet`].
#[derive(Clone)]
pub struct ScriptedProvider {
    kind: ProviderKind,
    script: Rc<RefCell<Script>>,
}

impl ScriptedProvider {
    pub fn new(
        kind: ProviderKind,
        replies: impl IntoIterator<Item = Result<ProviderReply, ProcessFailure>>,
    ) -> Self {
        Self {
            kind,
            script: Rc::new(RefCell::new(Script {
                replies: replies.into_iter().collect(),
                calls: Vec::new(),
            })),
        }
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.script.borrow().calls.clone()
    }

    pub fn remaining(&self) -> usize {
        self.script.borrow().replies.len()
    }
}

impl Provider for ScriptedProvider {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    fn invoke(
        &self,
        request: &ProviderRequest<'_>,
        sink: Option<&mut dyn TextSink>,
    ) -> Result<ProviderReply, ProcessFailure> {
        let next = {
            let mut script = self.script.borrow_mut();
            script.calls.push(RecordedCall {
                prompt: request.prompt.to_string(),
                session_id: request.session_id.map(str::to_string),
                options: request.options.clone(),
            });
            script.replies.pop_front()
        };
        let next = next
            .unwrap_or_else(|| failure(self.kind, ProcessErrorKind::Launch, &["script exhausted"]))
            .map(|mut reply| {
                reply.command = format!("{} exec --json", self.kind);
                reply
            });
        if let (Ok(reply), Some(sink)) = (&next, sink) {
            sink.on_text(&reply.text);
        }
        next
    }
}

/// Audit sink that keeps every event in memory.
#[derive(Debug, Default)]
pub struct MemoryAudit {
    pub events: Vec<AuditEvent>,
    pub summary: Option<RunSummary>,
}

impl MemoryAudit {
    pub fn kinds(&self) -> Vec<AuditKind> {
        self.events.iter().map(|event| event.event).collect()
    }

    pub fn count(&self, kind: AuditKind) -> usize {
        self.events.iter().filter(|event| event.event == kind).count()
    }
}

impl AuditSink for MemoryAudit {
    fn record(&mut self, event: &AuditEvent) {
        self.events.push(event.clone());
    }

    fn finalize(&mut self, summary: &RunSummary) {
        assert!(self.summary.is_none(), "run finalized twice");
        self.summary = Some(summary.clone());
    }
}

/// Temporary directory of executable shell scripts standing in for agent CLIs.
#[cfg(unix)]
pub struct FakeBinaries {
    dir: tempfile::TempDir,
}

#[cfg(unix)]
impl FakeBinaries {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().expect("tempdir"),
        }
    }

    pub fn path(&self) -> &std::path::Path {
        self.dir.path()
    }

    /// Write `body` as `#!/bin/sh` script `name` and return its path.
    pub fn script(&self, name: &str, body: &str) -> String {
        use std::os::unix::fs::PermissionsExt;

        let path = self.dir.path().join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write script");
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
            .expect("chmod script");
        path.display().to_string()
    }
}

#[cfg(unix)]
impl Default for FakeBinaries {
    fn default() -> Self {
        Self::new()
    }
}
