//! Structured run events.
//!
//! The orchestrator reports through [`AuditSink`]; the CLI wires a tracing
//! sink and, when configured, an append-only JSONL file.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::core::types::TurnRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AuditKind {
    #[serde(rename = "run.started")]
    RunStarted,
    #[serde(rename = "turn.started")]
    TurnStarted,
    #[serde(rename = "turn.attempt.failed")]
    AttemptFailed,
    #[serde(rename = "protocol.rejected")]
    ProtocolRejected,
    #[serde(rename = "turn.completed")]
    TurnCompleted,
    #[serde(rename = "turn.failed")]
    TurnFailed,
    #[serde(rename = "route.decided")]
    RouteDecided,
    #[serde(rename = "run.cancelled")]
    RunCancelled,
    #[serde(rename = "run.dry_run")]
    RunDryRun,
    #[serde(rename = "run.finished")]
    RunFinished,
    #[serde(rename = "run.finalized")]
    RunFinalized,
}

impl AuditKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditKind::RunStarted => "run.started",
            AuditKind::TurnStarted => "turn.started",
            AuditKind::AttemptFailed => "turn.attempt.failed",
            AuditKind::ProtocolRejected => "protocol.rejected",
            AuditKind::TurnCompleted => "turn.completed",
            AuditKind::TurnFailed => "turn.failed",
            AuditKind::RouteDecided => "route.decided",
            AuditKind::RunCancelled => "run.cancelled",
            AuditKind::RunDryRun => "run.dry_run",
            AuditKind::RunFinished => "run.finished",
            AuditKind::RunFinalized => "run.finalized",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub ts: DateTime<Utc>,
    pub run_id: String,
    pub event: AuditKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub turn: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    pub data: Value,
}

impl AuditEvent {
    pub fn new(run_id: &str, event: AuditKind, data: Value) -> Self {
        Self {
            ts: Utc::now(),
            run_id: run_id.to_string(),
            event,
            turn: None,
            agent: None,
            data,
        }
    }

    pub fn for_turn(mut self, turn: u32, agent: &str) -> Self {
        self.turn = Some(turn);
        self.agent = Some(agent.to_string());
        self
    }
}

/// End-of-run record handed to every sink once.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    /// Terminal run state.
    pub status: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    pub rounds: u32,
    pub turns_completed: usize,
    pub workdir: String,
    pub dry_run: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
    pub turns: Vec<TurnRecord>,
}

pub trait AuditSink {
    /// Record one event. Sinks absorb their own I/O failures.
    fn record(&mut self, event: &AuditEvent);

    /// Called once after the last event of a run.
    fn finalize(&mut self, summary: &RunSummary) {
        let _ = summary;
    }
}

/// Emits every event as an `info!` line.
#[derive(Debug, Default)]
pub struct TracingAudit;

impl AuditSink for TracingAudit {
    fn record(&mut self, event: &AuditEvent) {
        info!(
            run_id = %event.run_id,
            event = event.event.as_str(),
            turn = event.turn,
            agent = event.agent.as_deref(),
            data = %event.data,
            "audit"
        );
    }

    fn finalize(&mut self, summary: &RunSummary) {
        info!(
            run_id = %summary.run_id,
            status = %summary.status,
            turns = summary.turns_completed,
            elapsed_ms = summary.elapsed_ms,
            "run finalized"
        );
    }
}

/// Appends one JSON object per line, flushed per event. On finalize it
/// also writes the summary to `<log stem>.summary.json` beside the log.
pub struct JsonlAudit {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl JsonlAudit {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("create audit dir {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open audit log {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
        })
    }

    pub fn summary_path(&self) -> PathBuf {
        let stem = self
            .path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| "audit".to_string());
        self.path.with_file_name(format!("{stem}.summary.json"))
    }

    fn write_summary(&self, summary: &RunSummary) -> Result<()> {
        let path = self.summary_path();
        let payload = serde_json::to_string_pretty(summary).context("serialize run summary")?;
        fs::write(&path, payload).with_context(|| format!("write {}", path.display()))
    }

    fn write(&mut self, event: &AuditEvent) -> Result<()> {
        serde_json::to_writer(&mut self.writer, event).context("serialize audit event")?;
        self.writer.write_all(b"\n").context("write audit newline")?;
        self.writer.flush().context("flush audit log")?;
        Ok(())
    }
}

impl AuditSink for JsonlAudit {
    fn record(&mut self, event: &AuditEvent) {
        if let Err(err) = self.write(event) {
            warn!(path = %self.path.display(), err = %err, "failed to write audit event");
        }
    }

    fn finalize(&mut self, summary: &RunSummary) {
        let data = match serde_json::to_value(summary) {
            Ok(data) => data,
            Err(err) => {
                warn!(err = %err, "failed to encode run summary");
                return;
            }
        };
        self.record(&AuditEvent::new(&summary.run_id, AuditKind::RunFinalized, data));
        if let Err(err) = self.write_summary(summary) {
            warn!(path = %self.path.display(), err = %format!("{err:#}"), "failed to write run summary");
        }
    }
}

/// Fans out to several sinks in order.
#[derive(Default)]
pub struct MultiAudit {
    sinks: Vec<Box<dyn AuditSink>>,
}

impl MultiAudit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: impl AuditSink + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }
}

impl AuditSink for MultiAudit {
    fn record(&mut self, event: &AuditEvent) {
        for sink in &mut self.sinks {
            sink.record(event);
        }
    }

    fn finalize(&mut self, summary: &RunSummary) {
        for sink in &mut self.sinks {
            sink.finalize(summary);
        }
    }
}

/// Size, digest and a bounded preview of a prompt or reply.
pub fn text_meta(text: &str, preview_chars: usize) -> Value {
    let digest = hex::encode(Sha256::digest(text.as_bytes()));
    let preview: String = text.chars().take(preview_chars).collect();
    json!({
        "chars": text.chars().count(),
        "sha256": digest,
        "preview": preview,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jsonl_sink_appends_one_object_per_line() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("logs").join("run.jsonl");
        let mut sink = JsonlAudit::open(&path).expect("open");
        sink.record(&AuditEvent::new("run-1", AuditKind::RunStarted, json!({"rounds": 2})));
        sink.record(
            &AuditEvent::new("run-1", AuditKind::TurnStarted, json!({})).for_turn(1, "builder"),
        );
        drop(sink);

        let contents = fs::read_to_string(&path).expect("read");
        let lines: Vec<Value> = contents
            .lines()
            .map(|line| serde_json::from_str(line).expect("json line"))
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["event"], "run.started");
        assert_eq!(lines[0]["data"]["rounds"], 2);
        assert!(lines[0].get("turn").is_none());
        assert_eq!(lines[1]["event"], "turn.started");
        assert_eq!(lines[1]["agent"], "builder");
    }

    #[test]
    fn finalize_appends_an_event_and_writes_the_summary_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("run.jsonl");
        let mut sink = JsonlAudit::open(&path).expect("open");
        let now = Utc::now();
        sink.finalize(&RunSummary {
            run_id: "run-1".to_string(),
            status: "failed".to_string(),
            started_at: now,
            ended_at: now,
            elapsed_ms: 12,
            rounds: 2,
            turns_completed: 0,
            workdir: "/srv/app".to_string(),
            dry_run: false,
            error: Some(json!({"reason": "launch_error"})),
            turns: Vec::new(),
        });
        let summary_path = sink.summary_path();
        drop(sink);

        assert_eq!(summary_path, temp.path().join("run.summary.json"));
        let last: Value = fs::read_to_string(&path)
            .expect("read")
            .lines()
            .last()
            .map(|line| serde_json::from_str(line).expect("json line"))
            .expect("event");
        assert_eq!(last["event"], "run.finalized");
        assert_eq!(last["data"]["status"], "failed");
        let summary: Value =
            serde_json::from_str(&fs::read_to_string(&summary_path).expect("summary"))
                .expect("summary json");
        assert_eq!(summary["run_id"], "run-1");
        assert_eq!(summary["error"]["reason"], "launch_error");
        assert_eq!(summary["rounds"], 2);
    }

    #[test]
    fn text_meta_hashes_and_clips() {
        let meta = text_meta("hello", 2);
        assert_eq!(meta["chars"], 5);
        assert_eq!(meta["preview"], "he");
        assert_eq!(
            meta["sha256"],
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }
}
