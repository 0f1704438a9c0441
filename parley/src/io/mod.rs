//! Side-effecting collaborators of the orchestrator.

pub mod audit;
pub mod config;
pub mod deliverables;
pub mod interrupt;
pub mod process;
pub mod prompt;
pub mod session_store;
