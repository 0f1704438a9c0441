//! Classification and backoff for failed provider calls.

use std::time::Duration;

use crate::core::types::ProcessErrorKind;

/// Lowercase stderr fragments that mark a nonzero exit as transient.
const TRANSIENT_MARKERS: [&str; 9] = [
    "timeout",
    "temporarily",
    "try again",
    "429",
    "503",
    "504",
    "connection",
    "network",
    "rate limit",
];

/// Whether a failure is worth another attempt.
///
/// Timeouts are retried. A nonzero exit is retried only when stderr looks
/// like a transient upstream problem. Launch errors, signals and interrupts
/// never are.
pub fn is_retryable(kind: ProcessErrorKind, stderr_tail: &[String]) -> bool {
    match kind {
        ProcessErrorKind::Timeout { .. } => true,
        ProcessErrorKind::Exit => {
            let tail = stderr_tail.join("\n").to_lowercase();
            TRANSIENT_MARKERS.iter().any(|marker| tail.contains(marker))
        }
        ProcessErrorKind::Launch
        | ProcessErrorKind::Signal { .. }
        | ProcessErrorKind::Interrupted => false,
    }
}

/// Per-provider budget for process-level retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub attempts: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            attempts: 0,
            backoff: Duration::ZERO,
        }
    }

    pub fn allows(&self, retries_done: u32) -> bool {
        retries_done < self.attempts
    }

    /// `backoff * 2^retry`, where `retry` counts from 0.
    pub fn delay(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry.min(16)).unwrap_or(u32::MAX);
        self.backoff.saturating_mul(factor)
    }
}
