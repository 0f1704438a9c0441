//! Turn sequencing for one run.
//!
//! `Init -> Running -> (Switching -> Running)* -> Completed | Failed | Cancelled`.
//!
//! Each turn renders a prompt, calls the agent's provider and validates the
//! reply. Two retry budgets apply and never share a counter:
//!
//! - A reply that fails validation (or the safety policy) is sent back to the
//!   same agent with the structured issues, up to `max_retries` times.
//! - A provider call that fails with a transient process error is repeated
//!   with exponential backoff, up to the provider's `retry_attempts`.
//!
//! A dry run stops at the first rendered prompt: with no reply there is
//! nothing to validate or route on, so no provider is ever spawned.

use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::core::agents::{AgentProfile, ORCHESTRATOR_ID};
use crate::core::envelope::{Envelope, EnvelopeError, Stamp, schema_version};
use crate::core::history::{HistoryEntry, format_history, peer_question};
use crate::core::message::{MessageBody, ValidatedMessage};
use crate::core::retry::is_retryable;
use crate::core::schema::output_schema;
use crate::core::router::{RouteDecision, RouteError, decide};
use crate::core::types::{
    OutputKind, ProcessErrorKind, ProviderKind, ResponseMode, TurnOutcome, TurnRecord,
};
use crate::core::validator::{ValidationFailure, validate};
use crate::io::audit::{AuditEvent, AuditKind, AuditSink, RunSummary, text_meta};
use crate::io::config::{RunSettings, SessionScopeKind};
use crate::io::deliverables::verify_deliverables;
use crate::io::interrupt::{CancelToken, Interrupts};
use crate::io::process::{POLL_INTERVAL, ProcessFailure};
use crate::io::prompt::{PromptDump, Repair, TurnPromptInputs, build_turn_prompt};
use crate::io::session_store::{Scope, SessionStore};
use crate::providers::{ProviderReply, ProviderRequest, ProviderSet, TextSink};

/// Chars of prompt and reply text quoted in audit events.
const AUDIT_PREVIEW_CHARS: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Init,
    Running,
    Switching,
    Completed,
    Failed,
    Cancelled,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunState::Completed | RunState::Failed | RunState::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunState::Init => "init",
            RunState::Running => "running",
            RunState::Switching => "switching",
            RunState::Completed => "completed",
            RunState::Failed => "failed",
            RunState::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("unknown start agent '{0}'")]
    UnknownStartAgent(String),
    #[error("rounds must be >= 1")]
    ZeroRounds,
    #[error("agent '{agent}' uses provider '{provider}', which is not available")]
    MissingProvider { agent: String, provider: ProviderKind },
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
    #[error("render prompt for turn {turn}: {message}")]
    Prompt { turn: u32, message: String },
    #[error(
        "agent '{agent}' output still invalid after {retries} repair attempt(s) on turn {turn}: {failure}"
    )]
    ProtocolRetryExceeded {
        agent: String,
        turn: u32,
        retries: u32,
        failure: ValidationFailure,
    },
    #[error(transparent)]
    Process(Box<ProcessFailure>),
    #[error(transparent)]
    Route(#[from] RouteError),
}

impl RunError {
    /// Stable label for audit events and failed turn records.
    pub fn reason(&self) -> &'static str {
        match self {
            RunError::UnknownStartAgent(_) => "unknown_start_agent",
            RunError::ZeroRounds => "zero_rounds",
            RunError::MissingProvider { .. } => "missing_provider",
            RunError::Envelope(_) => "envelope",
            RunError::Prompt { .. } => "prompt",
            RunError::ProtocolRetryExceeded { .. } => "protocol_retry_exceeded",
            RunError::Process(failure) => failure.kind.reason(),
            RunError::Route(RouteError::MaxHopsExceeded { .. }) => "route_max_hops_exceeded",
            RunError::Route(RouteError::LoopDetected { .. }) => "route_loop_detected",
            RunError::Route(RouteError::UnknownAgent(_)) => "route_unknown_agent",
        }
    }
}

/// What went wrong with the process behind a failed turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunDiagnostic {
    pub agent: String,
    pub provider: ProviderKind,
    pub reason: String,
    pub command: String,
    pub elapsed_ms: u64,
    pub return_code: Option<i32>,
    pub session_id: Option<String>,
    pub stderr_tail: Vec<String>,
}

impl RunDiagnostic {
    fn from_failure(agent: &AgentProfile, failure: &ProcessFailure) -> Self {
        Self {
            agent: agent.id.clone(),
            provider: agent.provider,
            reason: failure.kind.reason().to_string(),
            command: failure.command.clone(),
            elapsed_ms: failure.elapsed_ms,
            return_code: failure.return_code,
            session_id: failure.session_id.clone(),
            stderr_tail: failure.stderr_tail.clone(),
        }
    }

    /// The last successful call of a turn, blamed for `reason`.
    fn from_reply(agent: &AgentProfile, reason: &str, reply: &ProviderReply) -> Self {
        Self {
            agent: agent.id.clone(),
            provider: agent.provider,
            reason: reason.to_string(),
            command: reply.command.clone(),
            elapsed_ms: reply.elapsed_ms,
            return_code: reply.return_code,
            session_id: reply.session_id.clone(),
            stderr_tail: reply.stderr_tail.clone(),
        }
    }
}

/// Pins a failure found between turns on the call that came before it.
fn blame(last_call: &mut Option<RunDiagnostic>, error: &RunError) -> Option<RunDiagnostic> {
    last_call.take().map(|call| RunDiagnostic {
        reason: error.reason().to_string(),
        ..call
    })
}

/// The prompt a dry run would have sent.
#[derive(Debug, Clone, Serialize)]
pub struct DryRunPreview {
    pub turn: u32,
    pub agent: String,
    pub provider: ProviderKind,
    pub prompt: String,
    /// Schema the reply would have been validated against.
    pub schema: Value,
}

/// Outcome of a run that got past `Init`.
#[derive(Debug)]
pub struct RunReport {
    pub run_id: String,
    /// Always terminal.
    pub state: RunState,
    pub transcript: Vec<TurnRecord>,
    pub routes: Vec<RouteDecision>,
    /// Envelopes for accepted messages, addressed to whoever spoke next.
    pub envelopes: Vec<Envelope>,
    pub failure: Option<RunError>,
    pub diagnostic: Option<RunDiagnostic>,
    /// Set only by dry runs.
    pub preview: Option<DryRunPreview>,
}

impl RunReport {
    fn fail(&mut self, error: RunError, diagnostic: Option<RunDiagnostic>) {
        self.failure = Some(error);
        self.diagnostic = diagnostic;
        self.state = RunState::Failed;
    }

    pub fn last_message(&self) -> Option<&Value> {
        self.transcript
            .iter()
            .rev()
            .find_map(|record| record.content.as_ref())
    }
}

enum TurnEnd {
    Accepted {
        record: TurnRecord,
        message: ValidatedMessage,
        call: RunDiagnostic,
    },
    Failed {
        record: TurnRecord,
        error: RunError,
        diagnostic: Option<RunDiagnostic>,
    },
    Cancelled {
        record: Option<TurnRecord>,
    },
    Previewed {
        prompt: String,
    },
}

struct Accepted {
    turn: u32,
    agent: String,
    message: ValidatedMessage,
}

/// Drives one run over a resolved configuration.
pub struct Orchestrator<'a> {
    settings: &'a RunSettings,
    providers: &'a ProviderSet,
    sessions: Option<&'a SessionStore>,
    cancel: CancelToken,
    abort: Option<CancelToken>,
    dry_run: bool,
    prompt_dump: Option<PromptDump>,
}

impl<'a> Orchestrator<'a> {
    pub fn new(settings: &'a RunSettings, providers: &'a ProviderSet) -> Self {
        Self {
            settings,
            providers,
            sessions: None,
            cancel: CancelToken::new(),
            abort: None,
            dry_run: false,
            prompt_dump: None,
        }
    }

    /// Render the first turn's prompt and stop without calling a provider.
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Write every rendered prompt to `dump`.
    pub fn with_prompt_dump(mut self, dump: PromptDump) -> Self {
        self.prompt_dump = Some(dump);
        self
    }

    pub fn with_sessions(mut self, sessions: &'a SessionStore) -> Self {
        self.sessions = Some(sessions);
        self
    }

    /// `cancel` is checked between turns and attempts; `abort` also reaches
    /// an in-flight provider call.
    pub fn with_interrupts(mut self, interrupts: &Interrupts) -> Self {
        self.cancel = interrupts.cancel.clone();
        self.abort = Some(interrupts.abort.clone());
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    fn check_init(&self) -> Result<&'a AgentProfile, RunError> {
        let settings = self.settings;
        if settings.rounds == 0 {
            return Err(RunError::ZeroRounds);
        }
        let start = settings
            .roster
            .resolve(&settings.start_agent)
            .ok_or_else(|| RunError::UnknownStartAgent(settings.start_agent.clone()))?;
        for agent in settings.roster.agents() {
            if !self.providers.contains(agent.provider)
                || settings.provider(agent.provider).is_none()
            {
                return Err(RunError::MissingProvider {
                    agent: agent.id.clone(),
                    provider: agent.provider,
                });
            }
        }
        Ok(start)
    }

    /// Run `task` to a terminal state.
    ///
    /// Errors are returned only for problems found before the first turn;
    /// anything later ends in a [`RunReport`] with `state == Failed`.
    #[instrument(skip_all, fields(rounds = self.settings.rounds))]
    pub fn run(
        &self,
        task: &str,
        audit: &mut dyn AuditSink,
        mut sink: Option<&mut dyn TextSink>,
    ) -> Result<RunReport, RunError> {
        let start = self.check_init()?;
        let settings = self.settings;
        let roster = &settings.roster;
        let run_id = uuid::Uuid::new_v4().simple().to_string();
        let started_at = Utc::now();
        let clock = Instant::now();
        // Fail fast on an unaddressable task before any provider is called.
        Envelope::task(roster, Stamp::now(), &run_id, ORCHESTRATOR_ID, &start.id, task)?;

        audit.record(&AuditEvent::new(
            &run_id,
            AuditKind::RunStarted,
            json!({
                "task": text_meta(task, AUDIT_PREVIEW_CHARS),
                "start_agent": start.id,
                "rounds": settings.rounds,
                "workdir": settings.workdir.display().to_string(),
                "read_only": settings.safety.read_only(),
                "dry_run": self.dry_run,
            }),
        ));
        info!(run_id = %run_id, start = %start.id, rounds = settings.rounds, "run started");

        let mut report = RunReport {
            run_id: run_id.clone(),
            state: RunState::Running,
            transcript: Vec::new(),
            routes: Vec::new(),
            envelopes: Vec::new(),
            failure: None,
            diagnostic: None,
            preview: None,
        };
        let mut accepted: Vec<Accepted> = Vec::new();
        let mut last_call: Option<RunDiagnostic> = None;
        let mut current = start;

        for turn in 1..=settings.rounds {
            if self.cancel.is_cancelled() {
                report.state = RunState::Cancelled;
                break;
            }
            audit.record(
                &AuditEvent::new(&run_id, AuditKind::TurnStarted, json!({"provider": current.provider}))
                    .for_turn(turn, &current.id),
            );
            info!(turn, agent = %current.id, provider = %current.provider, "turn started");

            let stream = if settings.stream {
                sink.as_mut().map(|s| &mut **s as &mut dyn TextSink)
            } else {
                None
            };
            match self.run_turn(&run_id, turn, task, current, &accepted, audit, stream) {
                TurnEnd::Accepted {
                    record,
                    message,
                    call,
                } => {
                    audit.record(
                        &AuditEvent::new(
                            &run_id,
                            AuditKind::TurnCompleted,
                            json!({
                                "attempts": record.attempts,
                                "elapsed_ms": record.elapsed_ms,
                                "status": message.status(),
                                "reply": text_meta(&record.text, AUDIT_PREVIEW_CHARS),
                            }),
                        )
                        .for_turn(turn, &current.id),
                    );
                    info!(turn, agent = %current.id, attempts = record.attempts, "turn accepted");
                    report.transcript.push(record);
                    last_call = Some(call);
                    accepted.push(Accepted {
                        turn,
                        agent: current.id.clone(),
                        message,
                    });
                }
                TurnEnd::Failed {
                    record,
                    error,
                    diagnostic,
                } => {
                    audit.record(
                        &AuditEvent::new(
                            &run_id,
                            AuditKind::TurnFailed,
                            json!({
                                "reason": error.reason(),
                                "error": error.to_string(),
                                "attempts": record.attempts,
                                "diagnostic": diagnostic,
                            }),
                        )
                        .for_turn(turn, &current.id),
                    );
                    warn!(turn, agent = %current.id, err = %error, "turn failed");
                    report.transcript.push(record);
                    report.fail(error, diagnostic);
                    break;
                }
                TurnEnd::Cancelled { record } => {
                    report.transcript.extend(record);
                    report.state = RunState::Cancelled;
                    break;
                }
                TurnEnd::Previewed { prompt } => {
                    let schema = output_schema(current.output);
                    audit.record(
                        &AuditEvent::new(
                            &run_id,
                            AuditKind::RunDryRun,
                            json!({
                                "provider": current.provider,
                                "output": current.output,
                                "prompt": text_meta(&prompt, AUDIT_PREVIEW_CHARS),
                                "schema_version": schema_version(current.output),
                            }),
                        )
                        .for_turn(turn, &current.id),
                    );
                    info!(turn, agent = %current.id, chars = prompt.len(), "dry run, prompt rendered");
                    report.preview = Some(DryRunPreview {
                        turn,
                        agent: current.id.clone(),
                        provider: current.provider,
                        prompt,
                        schema,
                    });
                    break;
                }
            }

            let next = if turn == settings.rounds {
                None
            } else {
                debug!(state = RunState::Switching.as_str(), turn, "routing");
                let text = report
                    .transcript
                    .last()
                    .map(|record| record.text.as_str())
                    .unwrap_or_default();
                match decide(&current.id, text, &report.routes, &settings.router, roster) {
                    Ok(decision) => Some(decision),
                    Err(err) => {
                        let error = RunError::Route(err);
                        audit.record(
                            &AuditEvent::new(
                                &run_id,
                                AuditKind::RouteDecided,
                                json!({"error": error.to_string(), "reason": error.reason()}),
                            )
                            .for_turn(turn, &current.id),
                        );
                        warn!(turn, err = %error, "routing failed");
                        let diagnostic = blame(&mut last_call, &error);
                        report.fail(error, diagnostic);
                        break;
                    }
                }
            };
            if let Some(decision) = &next {
                audit.record(
                    &AuditEvent::new(
                        &run_id,
                        AuditKind::RouteDecided,
                        json!({
                            "next_agent": decision.next_agent,
                            "reason": decision.reason,
                            "matched_rule": decision.matched_rule,
                            "is_fallback": decision.is_fallback,
                            "hop_count": decision.hop_count,
                        }),
                    )
                    .for_turn(turn, &current.id),
                );
                info!(turn, from = %current.id, to = %decision.next_agent, reason = ?decision.reason, "route decided");
            }

            let recipient = next
                .as_ref()
                .map_or(ORCHESTRATOR_ID, |decision| decision.next_agent.as_str());
            if let Some(entry) = accepted.last() {
                match Envelope::for_message(
                    roster,
                    Stamp::now(),
                    &run_id,
                    &current.id,
                    recipient,
                    &entry.message,
                ) {
                    Ok(envelope) => report.envelopes.push(envelope),
                    Err(err) => {
                        let error = RunError::Envelope(err);
                        warn!(turn, err = %error, "envelope rejected");
                        let diagnostic = blame(&mut last_call, &error);
                        report.fail(error, diagnostic);
                        break;
                    }
                }
            }

            let Some(decision) = next else {
                break;
            };
            let Some(next_agent) = roster.get(&decision.next_agent) else {
                let error = RunError::Route(RouteError::UnknownAgent(decision.next_agent.clone()));
                let diagnostic = blame(&mut last_call, &error);
                report.fail(error, diagnostic);
                break;
            };
            current = next_agent;
            report.routes.push(decision);
        }

        if report.state == RunState::Running {
            report.state = RunState::Completed;
        }
        if report.state == RunState::Cancelled {
            audit.record(&AuditEvent::new(
                &run_id,
                AuditKind::RunCancelled,
                json!({"turns": report.transcript.len()}),
            ));
            warn!(run_id = %run_id, "run cancelled");
        }
        audit.record(&AuditEvent::new(
            &run_id,
            AuditKind::RunFinished,
            json!({
                "state": report.state,
                "turns": report.transcript.len(),
                "reason": report.failure.as_ref().map(RunError::reason),
            }),
        ));
        info!(run_id = %run_id, state = report.state.as_str(), "run finished");
        audit.finalize(&RunSummary {
            run_id: run_id.clone(),
            status: report.state.as_str().to_string(),
            started_at,
            ended_at: Utc::now(),
            elapsed_ms: clock.elapsed().as_millis() as u64,
            rounds: settings.rounds,
            turns_completed: report.transcript.iter().filter(|r| r.is_accepted()).count(),
            workdir: settings.workdir.display().to_string(),
            dry_run: self.dry_run,
            error: report.failure.as_ref().map(|err| {
                json!({
                    "reason": err.reason(),
                    "message": err.to_string(),
                    "diagnostic": report.diagnostic,
                })
            }),
            turns: report.transcript.clone(),
        });
        Ok(report)
    }

    fn session_scope(&self, agent: &AgentProfile) -> Scope {
        match self.settings.session_scope {
            SessionScopeKind::Global => Scope::Global,
            SessionScopeKind::Agent => Scope::Agent(agent.id.clone()),
            SessionScopeKind::Project => Scope::Project(
                self.settings
                    .workdir
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .filter(|name| !name.is_empty() && !name.contains(':'))
                    .unwrap_or_else(|| "default".to_string()),
            ),
        }
    }

    /// Validation, then the command policy and workdir checks on what the
    /// reply cites. Deliverables are verified only for executing agents
    /// outside read-only runs.
    fn check_reply(
        &self,
        text: &str,
        agent: &AgentProfile,
    ) -> Result<ValidatedMessage, ValidationFailure> {
        let settings = self.settings;
        let kind = agent.output;
        let message = validate(text, kind)?;
        let path = match kind {
            OutputKind::Review => "$.verification",
            OutputKind::Plan | OutputKind::Delivery => "$.result.execution_evidence",
        };
        let mut issues = settings.safety.check_commands(message.evidence(), path);
        if issues.is_empty() {
            issues = settings
                .safety
                .check_command_paths(message.evidence(), path, &settings.workdir);
        }
        if issues.is_empty()
            && agent.response_mode == ResponseMode::Execute
            && !settings.safety.read_only()
            && let MessageBody::Delivery(delivery) = &message.body
        {
            issues = verify_deliverables(&delivery.result.deliverables, &settings.workdir);
        }
        if issues.is_empty() {
            Ok(message)
        } else {
            Err(ValidationFailure { kind, issues })
        }
    }

    /// Sleep `delay` in poll-sized slices, returning early once cancelled.
    fn backoff(&self, delay: Duration) {
        let deadline = Instant::now() + delay;
        loop {
            let now = Instant::now();
            if now >= deadline || self.is_cancelled() {
                return;
            }
            std::thread::sleep(POLL_INTERVAL.min(deadline - now));
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled() || self.abort.as_ref().is_some_and(CancelToken::is_cancelled)
    }

    fn remember_session(&self, scope: &Scope, provider: ProviderKind, session_id: Option<&str>) {
        let (Some(store), Some(session_id)) = (self.sessions, session_id) else {
            return;
        };
        if let Err(err) = store.set(scope, provider, session_id) {
            warn!(scope = %scope, provider = %provider, err = %format!("{err:#}"), "failed to save session");
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn run_turn(
        &self,
        run_id: &str,
        turn: u32,
        task: &str,
        agent: &AgentProfile,
        accepted: &[Accepted],
        audit: &mut dyn AuditSink,
        mut sink: Option<&mut dyn TextSink>,
    ) -> TurnEnd {
        let settings = self.settings;
        let started = Instant::now();
        let scope = self.session_scope(agent);
        let mut session_id = self
            .sessions
            .and_then(|store| store.get(&scope, agent.provider));

        let entries: Vec<HistoryEntry<'_>> = accepted
            .iter()
            .map(|entry| HistoryEntry {
                turn: entry.turn,
                agent: &entry.agent,
                message: &entry.message,
            })
            .collect();
        let history = format_history(&entries, &settings.history);
        let question = peer_question(&entries);
        let peers: Vec<&AgentProfile> = settings
            .roster
            .agents()
            .iter()
            .filter(|peer| peer.id != agent.id)
            .collect();

        let mut attempts = 0u32;
        let mut protocol_retries = 0u32;
        let mut process_retries = 0u32;
        let mut repair: Option<(ValidationFailure, String)> = None;
        let mut last_text = String::new();

        let record = |attempts: u32,
                      text: &str,
                      session_id: Option<String>,
                      outcome: TurnOutcome,
                      content: Option<Value>| TurnRecord {
            index: turn,
            agent: agent.id.clone(),
            provider: agent.provider,
            text: text.to_string(),
            session_id,
            elapsed_ms: started.elapsed().as_millis() as u64,
            attempts,
            outcome,
            content,
        };
        let failed = |error: RunError,
                      attempts: u32,
                      text: &str,
                      session_id: Option<String>,
                      diagnostic: Option<RunDiagnostic>| {
            let reason = error.reason().to_string();
            TurnEnd::Failed {
                record: record(attempts, text, session_id, TurnOutcome::Failed { reason }, None),
                error,
                diagnostic,
            }
        };

        // Checked at init.
        let (Some(provider), Some(provider_settings)) = (
            self.providers.get(agent.provider),
            settings.provider(agent.provider),
        ) else {
            return failed(
                RunError::MissingProvider {
                    agent: agent.id.clone(),
                    provider: agent.provider,
                },
                0,
                "",
                session_id,
                None,
            );
        };

        loop {
            if self.cancel.is_cancelled() {
                let record = (attempts > 0).then(|| {
                    record(
                        attempts,
                        &last_text,
                        session_id.clone(),
                        TurnOutcome::Failed {
                            reason: "cancelled".to_string(),
                        },
                        None,
                    )
                });
                return TurnEnd::Cancelled { record };
            }

            let task_envelope = match Envelope::task(
                &settings.roster,
                Stamp::now(),
                run_id,
                ORCHESTRATOR_ID,
                &agent.id,
                task,
            ) {
                Ok(envelope) => envelope.with_meta("turn", json!(turn)),
                Err(err) => return failed(err.into(), attempts, &last_text, session_id, None),
            };
            let prompt = match build_turn_prompt(&TurnPromptInputs {
                agent,
                peers: peers.clone(),
                task: &task_envelope,
                workdir: &settings.workdir,
                turn,
                rounds: settings.rounds,
                history: &history,
                peer_question: question,
                read_only: settings.safety.read_only(),
                repair: repair.as_ref().map(|(failure, previous)| Repair {
                    attempt: protocol_retries,
                    failure,
                    previous_output: previous,
                }),
            }) {
                Ok(prompt) => prompt,
                Err(err) => {
                    let error = RunError::Prompt {
                        turn,
                        message: format!("{err:#}"),
                    };
                    return failed(error, attempts, &last_text, session_id, None);
                }
            };
            if let Some(dump) = &self.prompt_dump
                && let Err(err) = dump.write(run_id, turn, attempts + 1, &agent.id, &prompt)
            {
                warn!(turn, err = %format!("{err:#}"), "failed to dump prompt");
            }
            if self.dry_run {
                return TurnEnd::Previewed { prompt };
            }

            attempts += 1;
            let request = ProviderRequest {
                prompt: &prompt,
                session_id: session_id.as_deref(),
                workdir: &settings.workdir,
                options: &agent.provider_options,
                settings: provider_settings,
                abort: self.abort.as_ref(),
            };
            debug!(turn, attempt = attempts, resume = session_id.is_some(), "calling provider");

            let stream = sink.as_mut().map(|s| &mut **s as &mut dyn TextSink);
            match provider.invoke(&request, stream) {
                Err(failure) => {
                    if failure.session_id.is_some() {
                        session_id.clone_from(&failure.session_id);
                    }
                    let interrupted = failure.kind == ProcessErrorKind::Interrupted;
                    let retrying = !interrupted
                        && is_retryable(failure.kind, &failure.stderr_tail)
                        && provider_settings.retry.allows(process_retries);
                    audit.record(
                        &AuditEvent::new(
                            run_id,
                            AuditKind::AttemptFailed,
                            json!({
                                "attempt": attempts,
                                "reason": failure.kind.reason(),
                                "elapsed_ms": failure.elapsed_ms,
                                "return_code": failure.return_code,
                                "retrying": retrying,
                            }),
                        )
                        .for_turn(turn, &agent.id),
                    );

                    if interrupted {
                        warn!(turn, agent = %agent.id, "provider call interrupted");
                        let record = record(
                            attempts,
                            &last_text,
                            session_id,
                            TurnOutcome::Failed {
                                reason: failure.kind.reason().to_string(),
                            },
                            None,
                        );
                        return TurnEnd::Cancelled {
                            record: Some(record),
                        };
                    }
                    if retrying {
                        let delay = provider_settings.retry.delay(process_retries);
                        process_retries += 1;
                        warn!(
                            turn,
                            agent = %agent.id,
                            reason = failure.kind.reason(),
                            retry = process_retries,
                            delay_ms = delay.as_millis() as u64,
                            "retrying provider call"
                        );
                        self.backoff(delay);
                        continue;
                    }
                    let diagnostic = RunDiagnostic::from_failure(agent, &failure);
                    let sid = session_id.clone();
                    return failed(
                        RunError::Process(Box::new(failure)),
                        attempts,
                        &last_text,
                        sid,
                        Some(diagnostic),
                    );
                }
                Ok(reply) => {
                    let call = RunDiagnostic::from_reply(agent, "ok", &reply);
                    if reply.session_id.is_some() {
                        session_id = reply.session_id;
                    }
                    last_text = reply.text;
                    match self.check_reply(&last_text, agent) {
                        Ok(message) => {
                            self.remember_session(&scope, agent.provider, session_id.as_deref());
                            let content = Some(message.content.clone());
                            return TurnEnd::Accepted {
                                record: record(
                                    attempts,
                                    &last_text,
                                    session_id,
                                    TurnOutcome::Accepted,
                                    content,
                                ),
                                message,
                                call,
                            };
                        }
                        Err(failure) => {
                            audit.record(
                                &AuditEvent::new(
                                    run_id,
                                    AuditKind::ProtocolRejected,
                                    json!({
                                        "attempt": attempts,
                                        "codes": failure.codes(),
                                        "issues": failure.issues,
                                        "reply": text_meta(&last_text, AUDIT_PREVIEW_CHARS),
                                    }),
                                )
                                .for_turn(turn, &agent.id),
                            );
                            if protocol_retries >= settings.max_retries {
                                let error = RunError::ProtocolRetryExceeded {
                                    agent: agent.id.clone(),
                                    turn,
                                    retries: protocol_retries,
                                    failure,
                                };
                                let diagnostic = RunDiagnostic {
                                    reason: error.reason().to_string(),
                                    session_id: session_id.clone(),
                                    ..call
                                };
                                let sid = session_id.clone();
                                return failed(error, attempts, &last_text, sid, Some(diagnostic));
                            }
                            protocol_retries += 1;
                            warn!(
                                turn,
                                agent = %agent.id,
                                retry = protocol_retries,
                                err = %failure,
                                "output rejected, asking for a repair"
                            );
                            repair = Some((failure, last_text.clone()));
                        }
                    }
                }
            }
        }
    }
}
