pub mod artifacts;
pub mod config;
pub mod context;
pub mod contract; // Artifact contracts + crash dumps
pub mod doctor;
pub mod error;
pub mod file_lock;
pub mod hashing;
pub mod pipeline;
pub mod preflight;
pub mod redact;
pub mod retention; // Retention sweep + lessons learned
pub mod sync; // Resumable remote sync
pub mod worker_pool;

use tracing_subscriber::EnvFilter;

pub use config::OpsConfig;
pub use context::OpsContext;
pub use error::{ErrorCategory, OpsError};
pub use pipeline::orchestrator::{Orchestrator, RunOutcome, RunRequest};

/// Install the global tracing subscriber.
///
/// Honors `RUST_LOG`; falls back to [`config::default_log_filter`]. Safe to call
/// more than once (later calls are no-ops).
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config::default_log_filter())),
        )
        .try_init();

    tracing::info!("ingestops starting v{}", config::APP_VERSION);
}
