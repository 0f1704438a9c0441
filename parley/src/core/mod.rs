//! Deterministic, pure logic shared by the orchestrator.
//!
//! Core modules are free of I/O side effects. They operate on in-memory data
//! and return deterministic outputs suitable for tests.

pub mod agents;
pub mod envelope;
pub mod history;
pub mod message;
pub mod retry;
pub mod router;
pub mod safety;
pub mod schema;
pub mod types;
pub mod validator;
