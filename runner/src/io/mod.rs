//! I/O helpers for jobrunner commands.

pub mod artifacts;
pub mod clock;
pub mod config;
pub mod git;
pub mod lock;
pub mod monitor;
pub mod mutation;
pub mod process;
pub mod provider;
pub mod transport;
