//! Agent job dispatch and governance runner.
//!
//! Launches long-running agent CLI processes as supervised jobs, derives each
//! job's health from its on-disk artifacts, retries stalled or idle jobs up to
//! a bound, gates jobs on worktree permissions and commit history, and fans
//! invocations out to remote hosts. The architecture keeps a strict split:
//!
//! - **[`core`]**: Pure, deterministic logic (health derivation, no-op
//!   classification, retry policy, trailer parsing). No I/O.
//! - **[`io`]**: Side effects (artifact store, config, git, processes,
//!   providers, locks, remote transport).
//!
//! Orchestration modules ([`supervisor`], [`watchdog`], [`gates`], [`fanout`],
//! [`report`]) coordinate core logic with I/O to implement CLI commands.

pub mod core;
pub mod error;
pub mod exit_codes;
pub mod fanout;
pub mod gates;
pub mod io;
pub mod logging;
pub mod report;
pub mod supervisor;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod watchdog;
