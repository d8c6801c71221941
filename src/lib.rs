pub mod batch;
pub mod cache;
pub mod clock;
pub mod config;
pub mod db;
pub mod errors;
pub mod models;
pub mod orchestrator;
pub mod progress;
pub mod repository;
pub mod weeks;

pub use crate::batch::{BatchCoordinator, BatchScope};
pub use crate::cache::{cache_key, CacheService};
pub use crate::clock::{Clock, ManualClock, SystemClock};
pub use crate::config::{BackendKind, EngineConfig};
pub use crate::db::json_store::JsonStore;
pub use crate::db::Database;
pub use crate::errors::{AppError, AppResult};
pub use crate::orchestrator::{
    CalculationReport, CalculationRequest, MetricPayload, MetricsCalculator, Orchestrator, ProgressCallback,
    WeekOutcome, RUN_ABANDONED, WEEKLY_METRICS_TASK,
};
pub use crate::progress::ProgressTracker;
pub use crate::repository::{open_store, with_transaction, EntityStore, TransactionGuard};
pub use crate::weeks::{last_n_weeks, WeekBucket, MAX_WEEKS};

use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;

static LOG_GUARD: std::sync::OnceLock<WorkerGuard> = std::sync::OnceLock::new();

/// Installs JSON logging to a daily rolling file under `log_dir`.
///
/// `filter` is used when `RUST_LOG` is unset.
pub fn init_logging(log_dir: &Path, filter: &str) -> AppResult<()> {
    std::fs::create_dir_all(log_dir)?;
    let file_appender = tracing_appender::rolling::daily(log_dir, "metrics.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    if LOG_GUARD.set(guard).is_err() {
        return Err(AppError::Internal("logging already initialised".to_string()));
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .json()
        .with_writer(non_blocking)
        .try_init()
        .map_err(|error| AppError::Internal(error.to_string()))
}
