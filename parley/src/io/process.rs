//! Governed child process execution.
//!
//! Every provider call goes through [`invoke`]: the child gets its own process
//! group, stdout and stderr are drained concurrently by reader threads, and
//! the calling thread enforces an idle timeout (reset by any output line), a
//! hard wall-clock timeout and the abort token. Whatever the outcome, the
//! child is terminated (TERM, grace period, KILL) and reaped before returning.

use std::collections::VecDeque;
use std::fmt;
use std::io::{BufRead, BufReader, Read, Write};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

use crate::core::types::{ProcessErrorKind, TimeoutKind};
use crate::io::interrupt::{self, CancelToken};

/// How often the governor wakes to check clocks and the abort token.
pub const POLL_INTERVAL: Duration = Duration::from_millis(50);
/// Stderr lines kept for diagnostics.
pub const STDERR_TAIL_LINES: usize = 20;
/// Command text longer than this is truncated in diagnostics.
pub const COMMAND_REPR_LIMIT: usize = 800;
/// How long to keep draining pipes after the child exits.
const DRAIN_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessLimits {
    pub idle_timeout: Duration,
    pub max_timeout: Duration,
    pub terminate_grace: Duration,
}

impl Default for ProcessLimits {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(300),
            max_timeout: Duration::from_secs(1800),
            terminate_grace: Duration::from_secs(5),
        }
    }
}

/// One child process to run.
#[derive(Debug, Clone)]
pub struct Invocation {
    /// Label used in diagnostics, usually the provider name.
    pub label: String,
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    /// Written to the child's stdin, which is then closed.
    pub stdin: Option<String>,
    pub limits: ProcessLimits,
    pub abort: Option<CancelToken>,
}

impl Invocation {
    pub fn new(label: impl Into<String>, program: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
            stdin: None,
            limits: ProcessLimits::default(),
            abort: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Command line for diagnostics, bounded to [`COMMAND_REPR_LIMIT`] chars.
    pub fn command_repr(&self) -> String {
        let mut parts = vec![quote(&self.program)];
        parts.extend(self.args.iter().map(|arg| quote(arg)));
        let joined = parts.join(" ");
        let total = joined.chars().count();
        let mut repr = if total > COMMAND_REPR_LIMIT {
            let head: String = joined.chars().take(COMMAND_REPR_LIMIT).collect();
            format!("{head}...<truncated {} chars>", total - COMMAND_REPR_LIMIT)
        } else {
            joined
        };
        if let Some(cwd) = &self.cwd {
            repr.push_str(&format!(" (cwd={})", cwd.display()));
        }
        repr
    }
}

fn quote(arg: &str) -> String {
    if !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:@%+,".contains(c))
    {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

/// Result of a child that exited with status 0.
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub stdout: String,
    pub stderr_tail: Vec<String>,
    pub exit_code: i32,
    pub elapsed: Duration,
    pub pid: u32,
}

/// Why a governed call failed, with everything needed to diagnose it.
#[derive(Debug, Clone, Error)]
#[error(
    "[{label}] process failed: reason={}, elapsed_ms={elapsed_ms}, return_code={}, session_id={}, command={command}",
    .kind.reason(),
    Optional(.return_code),
    Optional(.session_id)
)]
pub struct ProcessFailure {
    pub label: String,
    pub kind: ProcessErrorKind,
    pub command: String,
    pub elapsed_ms: u64,
    pub return_code: Option<i32>,
    /// Filled in by the provider when the stream revealed a session.
    pub session_id: Option<String>,
    pub pid: Option<u32>,
    pub stderr_tail: Vec<String>,
    /// Spawn error text for launch failures.
    pub detail: Option<String>,
}

struct Optional<'a, T>(&'a Option<T>);

impl<T: fmt::Display> fmt::Display for Optional<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(value) => value.fmt(f),
            None => f.write_str("none"),
        }
    }
}

impl ProcessFailure {
    pub fn with_session(mut self, session_id: Option<String>) -> Self {
        if self.session_id.is_none() {
            self.session_id = session_id;
        }
        self
    }

    /// Multi-line report for terminal output.
    pub fn report(&self) -> String {
        let mut text = self.to_string();
        if let Some(detail) = &self.detail {
            text.push_str(&format!("\ndetail: {detail}"));
        }
        if !self.stderr_tail.is_empty() {
            text.push_str("\nstderr tail:");
            for line in &self.stderr_tail {
                text.push_str(&format!("\n  {line}"));
            }
        }
        text
    }
}

#[derive(Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

enum PipeEvent {
    Line(Stream, String),
    Closed,
}

/// Owns the child until it is reaped; terminating on drop covers every
/// early return and unwinding panic.
struct ChildGuard {
    child: Child,
    pid: u32,
    grace: Duration,
    reaped: bool,
}

impl ChildGuard {
    fn new(child: Child, grace: Duration) -> Self {
        let pid = child.id();
        interrupt::register_child(pid);
        Self {
            child,
            pid,
            grace,
            reaped: false,
        }
    }

    fn try_wait(&mut self) -> std::io::Result<Option<ExitStatus>> {
        let status = self.child.try_wait()?;
        if status.is_some() {
            self.mark_reaped();
        }
        Ok(status)
    }

    fn terminate(&mut self) {
        if self.reaped {
            return;
        }
        terminate_child(&mut self.child, self.pid, self.grace);
        self.mark_reaped();
    }

    fn mark_reaped(&mut self) {
        self.reaped = true;
        interrupt::unregister_child(self.pid);
    }
}

impl Drop for ChildGuard {
    fn drop(&mut self) {
        self.terminate();
    }
}

/// TERM the group, wait up to `grace`, then KILL and reap.
#[cfg(unix)]
fn terminate_child(child: &mut Child, pid: u32, grace: Duration) {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let group = i32::try_from(pid).ok().map(Pid::from_raw);
    if let Some(group) = group
        && let Err(err) = killpg(group, Signal::SIGTERM)
    {
        debug!(pid, err = %err, "SIGTERM to group failed");
    }
    match child.wait_timeout(grace) {
        Ok(Some(status)) => debug!(pid, ?status, "child exited after SIGTERM"),
        Ok(None) | Err(_) => {
            warn!(pid, grace_ms = grace.as_millis() as u64, "child ignored SIGTERM, killing");
            if let Some(group) = group {
                let _ = killpg(group, Signal::SIGKILL);
            }
            let _ = child.kill();
            if let Err(err) = child.wait() {
                error!(pid, err = %err, "failed to reap killed child");
            }
        }
    }
    // Stragglers that share the group but outlived the leader.
    if let Some(group) = group {
        let _ = killpg(group, Signal::SIGKILL);
    }
}

#[cfg(not(unix))]
fn terminate_child(child: &mut Child, pid: u32, grace: Duration) {
    if let Ok(Some(_)) = child.wait_timeout(grace.min(POLL_INTERVAL)) {
        return;
    }
    debug!(pid, "killing child");
    let _ = child.kill();
    if let Err(err) = child.wait() {
        error!(pid, err = %err, "failed to reap killed child");
    }
}

fn spawn_reader<R: Read + Send + 'static>(reader: R, stream: Stream, tx: Sender<PipeEvent>) {
    let _ = thread::Builder::new()
        .name("parley-pipe".to_string())
        .spawn(move || {
            let mut reader = BufReader::new(reader);
            let mut buf = Vec::new();
            loop {
                buf.clear();
                match reader.read_until(b'\n', &mut buf) {
                    Ok(0) => break,
                    Ok(_) => {
                        let line = String::from_utf8_lossy(&buf)
                            .trim_end_matches(['\r', '\n'])
                            .to_string();
                        if tx.send(PipeEvent::Line(stream, line)).is_err() {
                            return;
                        }
                    }
                    Err(err) => {
                        debug!(err = %err, "pipe read failed");
                        break;
                    }
                }
            }
            let _ = tx.send(PipeEvent::Closed);
        });
}

/// Run one child to completion under the governor.
///
/// `on_stdout` sees every stdout line in arrival order, on the calling
/// thread. Returns `Ok` only for exit status 0.
#[instrument(skip_all, fields(label = %invocation.label, program = %invocation.program))]
pub fn invoke(
    invocation: &Invocation,
    on_stdout: &mut dyn FnMut(&str),
) -> Result<ProcessOutput, ProcessFailure> {
    let started = Instant::now();
    let limits = invocation.limits;
    let failure = |kind: ProcessErrorKind,
                   return_code: Option<i32>,
                   pid: Option<u32>,
                   stderr_tail: Vec<String>,
                   detail: Option<String>| ProcessFailure {
        label: invocation.label.clone(),
        kind,
        command: invocation.command_repr(),
        elapsed_ms: started.elapsed().as_millis() as u64,
        return_code,
        session_id: None,
        pid,
        stderr_tail,
        detail,
    };

    let mut cmd = Command::new(&invocation.program);
    cmd.args(&invocation.args)
        .stdin(if invocation.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(cwd) = &invocation.cwd {
        cmd.current_dir(cwd);
    }
    for (key, value) in &invocation.env {
        cmd.env(key, value);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    debug!(command = %invocation.command_repr(), "spawning child process");
    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(err) => {
            error!(err = %err, "failed to spawn command");
            return Err(failure(
                ProcessErrorKind::Launch,
                None,
                None,
                Vec::new(),
                Some(err.to_string()),
            ));
        }
    };

    let stdin = child.stdin.take();
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let mut guard = ChildGuard::new(child, limits.terminate_grace);
    let pid = guard.pid;

    if let (Some(mut pipe), Some(input)) = (stdin, invocation.stdin.clone()) {
        let _ = thread::Builder::new()
            .name("parley-stdin".to_string())
            .spawn(move || {
                if let Err(err) = pipe.write_all(input.as_bytes()) {
                    debug!(err = %err, "stdin write failed");
                }
            });
    }

    let (tx, rx) = mpsc::channel();
    let mut open_pipes = 0usize;
    if let Some(stdout) = stdout {
        spawn_reader(stdout, Stream::Stdout, tx.clone());
        open_pipes += 1;
    }
    if let Some(stderr) = stderr {
        spawn_reader(stderr, Stream::Stderr, tx.clone());
        open_pipes += 1;
    }
    drop(tx);

    let mut collected = String::new();
    let mut stderr_tail: VecDeque<String> = VecDeque::with_capacity(STDERR_TAIL_LINES);
    let mut handle = |event: PipeEvent, open_pipes: &mut usize| match event {
        PipeEvent::Line(Stream::Stdout, line) => {
            on_stdout(&line);
            collected.push_str(&line);
            collected.push('\n');
        }
        PipeEvent::Line(Stream::Stderr, line) => {
            debug!(pid, line = %line, "child stderr");
            if stderr_tail.len() == STDERR_TAIL_LINES {
                stderr_tail.pop_front();
            }
            stderr_tail.push_back(line);
        }
        PipeEvent::Closed => *open_pipes = open_pipes.saturating_sub(1),
    };

    let mut last_activity = Instant::now();
    let status = loop {
        match rx.recv_timeout(POLL_INTERVAL) {
            Ok(event) => {
                if matches!(event, PipeEvent::Line(..)) {
                    last_activity = Instant::now();
                }
                handle(event, &mut open_pipes);
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => thread::sleep(POLL_INTERVAL),
        }

        match guard.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => {}
            Err(err) => {
                error!(pid, err = %err, "failed to poll child");
            }
        }

        let stop = if invocation
            .abort
            .as_ref()
            .is_some_and(CancelToken::is_cancelled)
        {
            Some(ProcessErrorKind::Interrupted)
        } else if started.elapsed() >= limits.max_timeout {
            Some(ProcessErrorKind::Timeout {
                which: TimeoutKind::Max,
            })
        } else if last_activity.elapsed() >= limits.idle_timeout {
            Some(ProcessErrorKind::Timeout {
                which: TimeoutKind::Idle,
            })
        } else {
            None
        };
        if let Some(kind) = stop {
            warn!(pid, reason = kind.reason(), "terminating child");
            guard.terminate();
            let tail = stderr_tail.into_iter().collect();
            return Err(failure(kind, None, Some(pid), tail, None));
        }
    };

    // Pipes may still hold lines written just before exit.
    let drain_deadline = Instant::now() + DRAIN_GRACE;
    while open_pipes > 0 {
        let remaining = drain_deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            debug!(pid, open_pipes, "pipes still open after exit, giving up drain");
            break;
        }
        match rx.recv_timeout(remaining) {
            Ok(event) => handle(event, &mut open_pipes),
            Err(_) => break,
        }
    }

    let elapsed = started.elapsed();
    let stderr_tail: Vec<String> = stderr_tail.into_iter().collect();
    if status.success() {
        debug!(pid, elapsed_ms = elapsed.as_millis() as u64, "child exited cleanly");
        return Ok(ProcessOutput {
            stdout: collected,
            stderr_tail,
            exit_code: 0,
            elapsed,
            pid,
        });
    }

    let kind = match signal_of(status) {
        Some(signal) => ProcessErrorKind::Signal { signal },
        None => ProcessErrorKind::Exit,
    };
    warn!(pid, exit_code = ?status.code(), reason = kind.reason(), "child failed");
    Err(failure(kind, status.code(), Some(pid), stderr_tail, None))
}

#[cfg(unix)]
fn signal_of(status: ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn signal_of(_status: ExitStatus) -> Option<i32> {
    None
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn shell(script: &str) -> Invocation {
        let mut invocation = Invocation::new("test", "sh").arg("-c").arg(script);
        invocation.limits = ProcessLimits {
            idle_timeout: Duration::from_secs(5),
            max_timeout: Duration::from_secs(10),
            terminate_grace: Duration::from_millis(200),
        };
        invocation
    }

    fn collect(invocation: &Invocation) -> (Result<ProcessOutput, ProcessFailure>, Vec<String>) {
        let mut lines = Vec::new();
        let result = invoke(invocation, &mut |line| lines.push(line.to_string()));
        (result, lines)
    }

    #[test]
    fn streams_stdout_lines_in_order() {
        let (result, lines) = collect(&shell("echo one; echo two >&2; echo three"));
        let output = result.expect("clean exit");
        assert_eq!(lines, vec!["one", "three"]);
        assert_eq!(output.stdout, "one\nthree\n");
        assert_eq!(output.stderr_tail, vec!["two"]);
        assert_eq!(output.exit_code, 0);
    }

    #[test]
    fn stdin_is_delivered_and_closed() {
        let mut invocation = shell("cat");
        invocation.stdin = Some("from stdin\n".to_string());
        let (result, lines) = collect(&invocation);
        result.expect("clean exit");
        assert_eq!(lines, vec!["from stdin"]);
    }

    #[test]
    fn nonzero_exit_keeps_stderr_tail() {
        let (result, _) = collect(&shell(
            "for i in $(seq 1 30); do echo line$i >&2; done; exit 3",
        ));
        let err = result.expect_err("nonzero exit");
        assert_eq!(err.kind, ProcessErrorKind::Exit);
        assert_eq!(err.return_code, Some(3));
        assert_eq!(err.stderr_tail.len(), STDERR_TAIL_LINES);
        assert_eq!(err.stderr_tail.last().map(String::as_str), Some("line30"));
        assert!(err.to_string().contains("reason=nonzero_exit"));
        assert!(err.to_string().contains("return_code=3"));
    }

    #[test]
    fn missing_binary_is_a_launch_error() {
        let invocation = Invocation::new("test", "/nonexistent/parley-binary");
        let (result, _) = collect(&invocation);
        let err = result.expect_err("launch error");
        assert_eq!(err.kind, ProcessErrorKind::Launch);
        assert!(err.detail.is_some());
        assert_eq!(err.pid, None);
    }

    #[test]
    fn idle_timeout_terminates_silent_child() {
        let mut invocation = shell("echo started; sleep 30");
        invocation.limits.idle_timeout = Duration::from_millis(300);
        let started = Instant::now();
        let (result, lines) = collect(&invocation);
        let err = result.expect_err("idle timeout");
        assert_eq!(
            err.kind,
            ProcessErrorKind::Timeout {
                which: TimeoutKind::Idle
            }
        );
        assert_eq!(lines, vec!["started"]);
        assert!(started.elapsed() < Duration::from_secs(5));
        let pid = err.pid.expect("pid");
        assert!(!interrupt::live_children().contains(&pid));
    }

    #[test]
    fn output_resets_idle_clock_but_not_max() {
        let mut invocation = shell("while true; do echo tick; sleep 0.1; done");
        invocation.limits.idle_timeout = Duration::from_millis(400);
        invocation.limits.max_timeout = Duration::from_millis(1200);
        let (result, lines) = collect(&invocation);
        let err = result.expect_err("max timeout");
        assert_eq!(
            err.kind,
            ProcessErrorKind::Timeout {
                which: TimeoutKind::Max
            }
        );
        assert!(lines.len() > 3);
    }

    #[test]
    fn abort_token_interrupts_in_flight_child() {
        let token = CancelToken::new();
        let mut invocation = shell("sleep 30");
        invocation.abort = Some(token.clone());
        let trigger = thread::spawn(move || {
            thread::sleep(Duration::from_millis(200));
            token.cancel();
        });
        let (result, _) = collect(&invocation);
        trigger.join().expect("trigger thread");
        assert_eq!(
            result.expect_err("interrupted").kind,
            ProcessErrorKind::Interrupted
        );
    }

    #[test]
    fn term_ignoring_child_is_killed_after_grace() {
        let mut invocation = shell("trap '' TERM; echo ready; sleep 30");
        invocation.limits.idle_timeout = Duration::from_millis(300);
        let started = Instant::now();
        let (result, _) = collect(&invocation);
        assert!(result.is_err());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn command_repr_quotes_and_truncates() {
        let mut invocation = Invocation::new("test", "codex").args(["exec", "hello world"]);
        invocation.cwd = Some(PathBuf::from("/tmp/work"));
        assert_eq!(
            invocation.command_repr(),
            "codex exec 'hello world' (cwd=/tmp/work)"
        );

        let long = Invocation::new("test", "codex").arg("x".repeat(1000));
        let repr = long.command_repr();
        assert!(repr.contains("...<truncated "));
        assert!(repr.starts_with("codex xxx"));
    }
}
