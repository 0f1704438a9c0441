//! Process-governed multi-agent turn orchestration.
//!
//! A run hands a task to a sequence of external agent CLIs, one turn at a
//! time, and accepts a turn only when the agent's reply is a single JSON
//! object matching its versioned schema. The crate is split the same way
//! throughout:
//!
//! - **[`core`]**: Pure, deterministic logic (roster, validation, routing,
//!   history summaries, retry classification). No I/O.
//! - **[`io`]**: Side effects (process governor, session file, config,
//!   prompts, audit log, interrupt handling).
//! - **[`providers`]**: Adapters that turn a prompt into a governed call to
//!   `codex`, `claude` or `gemini` and decode their JSON event streams.
//!
//! [`orchestrator`] ties them together into one run.

pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod orchestrator;
pub mod providers;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
