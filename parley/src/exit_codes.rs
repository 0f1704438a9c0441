//! Stable exit codes for parley CLI commands.

/// Command succeeded; for `parley run`, every round completed.
pub const OK: i32 = 0;
/// Invalid input: config, arguments, or a message that failed `parley check`.
pub const INVALID: i32 = 1;
/// A run started but ended in a failed turn or route.
pub const FAILED: i32 = 2;
/// A run was cancelled by an interrupt.
pub const CANCELLED: i32 = 3;
