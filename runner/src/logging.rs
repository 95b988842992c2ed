//! Operator diagnostics for the runner.
//!
//! # Separation of Concerns
//!
//! - **Tracing (this module)**: diagnostics via `RUST_LOG`, written to stderr.
//!   Never parsed by callers and not part of any command's stdout contract.
//!
//! - **Job artifacts (`io/artifacts`)**: `job.log`, `monitor.log`, heartbeats
//!   and outcomes under the state directory. Always written, unaffected by
//!   `RUST_LOG`.
//!
//! - **Fanout ledger**: one JSON line per remote attempt in
//!   `fanout/attempts.jsonl`, also always written.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG`; defaults to `warn`. The detached monitor inherits the
/// same setup, so its diagnostics land in the job's `monitor.log`.
///
/// # Example
/// ```bash
/// RUST_LOG=jobrunner=debug jobrunner status --task T-42
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    // A second init (e.g. from a test harness) is not an error worth failing on.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .try_init();
}
