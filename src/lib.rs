//! Resumable, checkpointed migration of legacy document collections into
//! the new schema.

pub mod checkpoint;
pub mod config;
pub mod db;
pub mod error;
pub mod lock;
pub mod migration;
pub mod report;
pub mod steps;
pub mod store;
pub mod time;

pub use error::{AppError, AppResult};

/// Install the JSON tracing subscriber on stderr and bridge `log` records.
/// Safe to call more than once; later calls are no-ops.
pub fn init_logging() {
    let _ = tracing_log::LogTracer::init();
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var(config::LOG_FILTER_ENV)
                .unwrap_or_else(|_| config::DEFAULT_LOG_FILTER.into()),
        )
        .json()
        .with_target(true)
        .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
        .with_writer(std::io::stderr)
        .try_init();
}
