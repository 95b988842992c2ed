//! Deterministic, pure logic shared by the job runner.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and an explicit `now`, and return deterministic outputs
//! suitable for tests.

pub mod health;
pub mod heartbeat;
pub mod model;
pub mod permission;
pub mod retry;
pub mod trailer;
pub mod types;
