//! Cancellation flags and the OS interrupt watcher.
//!
//! Children are spawned in their own process group, so a terminal Ctrl-C
//! reaches only this process. The watcher turns SIGINT/SIGTERM into:
//!
//! - the run's cancel token (no new turn is scheduled), and
//! - the abort token polled by the process governor, which then terminates
//!   and reaps the in-flight child.
//!
//! A second signal reaps every live child group and exits immediately.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use tracing::{debug, warn};

/// Exit status used after a second interrupt (128 + SIGINT).
pub const FORCED_EXIT_CODE: i32 = 130;

/// Shared one-way flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Tokens tripped by the watcher.
#[derive(Debug, Clone, Default)]
pub struct Interrupts {
    /// Checked by the orchestrator at turn boundaries.
    pub cancel: CancelToken,
    /// Polled by the governor while a child runs.
    pub abort: CancelToken,
}

static LIVE_CHILDREN: Mutex<BTreeSet<u32>> = Mutex::new(BTreeSet::new());

/// Track a spawned child (also its process group id on unix).
pub(crate) fn register_child(pid: u32) {
    if let Ok(mut live) = LIVE_CHILDREN.lock() {
        live.insert(pid);
    }
}

pub(crate) fn unregister_child(pid: u32) {
    if let Ok(mut live) = LIVE_CHILDREN.lock() {
        live.remove(&pid);
    }
}

/// Pids of children that have not been reaped yet.
pub fn live_children() -> Vec<u32> {
    LIVE_CHILDREN
        .lock()
        .map(|live| live.iter().copied().collect())
        .unwrap_or_default()
}

/// Force-kill every live child group. Used right before the process exits.
pub fn reap_all() {
    for pid in live_children() {
        warn!(pid, "killing child still alive at exit");
        kill_group(pid);
        unregister_child(pid);
    }
}

#[cfg(unix)]
fn kill_group(pid: u32) {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    if let Err(err) = killpg(Pid::from_raw(raw), Signal::SIGKILL) {
        debug!(pid, err = %err, "killpg failed");
    }
}

#[cfg(not(unix))]
fn kill_group(pid: u32) {
    debug!(pid, "group kill unsupported on this platform");
}

/// Block SIGINT/SIGTERM on the calling thread and watch them from a
/// dedicated thread.
///
/// Must run on the main thread before any other thread is spawned so that
/// every later thread inherits the mask.
#[cfg(unix)]
pub fn install() -> Result<Interrupts> {
    use anyhow::Context;
    use nix::sys::signal::{SigSet, Signal};

    let interrupts = Interrupts::default();
    let mut set = SigSet::empty();
    set.add(Signal::SIGINT);
    set.add(Signal::SIGTERM);
    set.thread_block().context("block interrupt signals")?;

    let watcher = interrupts.clone();
    std::thread::Builder::new()
        .name("parley-interrupts".to_string())
        .spawn(move || {
            let mut seen = 0u32;
            loop {
                match set.wait() {
                    Ok(signal) => {
                        seen += 1;
                        if seen == 1 {
                            warn!(?signal, "interrupt received, cancelling run");
                            watcher.cancel.cancel();
                            watcher.abort.cancel();
                        } else {
                            warn!(?signal, "second interrupt, exiting");
                            reap_all();
                            std::process::exit(FORCED_EXIT_CODE);
                        }
                    }
                    Err(err) => {
                        warn!(err = %err, "signal wait failed, watcher stopping");
                        return;
                    }
                }
            }
        })
        .context("spawn interrupt watcher")?;
    Ok(interrupts)
}

#[cfg(not(unix))]
pub fn install() -> Result<Interrupts> {
    Ok(Interrupts::default())
}
