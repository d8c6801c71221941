//! Incremental, cancellable "calculate the last N weeks" pipeline.
//!
//! Weeks run strictly in order on one worker. Cancellation is checked at the
//! top of each week only; a calculator call already in flight finishes.
//! Weeks persisted before a cancellation or a failure are kept.

use crate::batch::BatchCoordinator;
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::errors::{AppError, AppResult};
use crate::models::{MetricType, MetricsSnapshot, TaskProgress};
use crate::progress::{ProgressTracker, CANCELLED_BY_USER};
use crate::repository::{with_transaction, EntityStore};
use crate::weeks::{last_n_weeks, WeekBucket};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::task::JoinHandle;

pub const WEEKLY_METRICS_TASK: &str = "weekly_metrics";
const MAX_REPORTED_ERRORS: usize = 3;
const MAX_ERROR_CHARS: usize = 100;
pub const RUN_ABANDONED: &str = "Run stopped before completion";

pub type ProgressCallback = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Debug, Clone, PartialEq)]
pub struct MetricPayload {
    pub metric_type: MetricType,
    pub metrics: serde_json::Value,
    pub forecast: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WeekOutcome {
    Computed(Vec<MetricPayload>),
    Skipped(String),
}

/// External collaborator that turns raw query data into one week's metrics.
/// An `Err` from `compute` counts that week as failed.
pub trait MetricsCalculator: Send + Sync {
    fn compute(&self, week: &WeekBucket) -> anyhow::Result<WeekOutcome>;

    /// Metric types one computed week produces; used for the delta check.
    fn metric_types(&self) -> Vec<MetricType> {
        vec![MetricType::Dora, MetricType::Flow]
    }

    /// When the underlying query data last changed, if known.
    fn source_last_modified(&self) -> Option<DateTime<Utc>> {
        None
    }
}

#[derive(Debug, Clone)]
pub struct CalculationRequest {
    pub profile_id: String,
    pub query_id: String,
    pub n_weeks: usize,
    /// Replaces the "last N weeks from today" window when present.
    pub custom_weeks: Option<Vec<WeekBucket>>,
    pub force_recalculate: bool,
    /// Persist every computed week in one store transaction at the end of the
    /// run; a persistence failure then rolls all of them back and aborts.
    pub atomic: bool,
}

impl CalculationRequest {
    pub fn new(profile_id: &str, query_id: &str, n_weeks: usize) -> Self {
        Self {
            profile_id: profile_id.to_string(),
            query_id: query_id.to_string(),
            n_weeks,
            custom_weeks: None,
            force_recalculate: false,
            atomic: false,
        }
    }

    pub fn with_weeks(mut self, weeks: Vec<WeekBucket>) -> Self {
        self.custom_weeks = Some(weeks);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalculationReport {
    pub success: bool,
    pub cancelled: bool,
    pub summary: String,
    pub total: usize,
    pub processed: usize,
    pub computed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub errors: Vec<String>,
}

impl CalculationReport {
    pub fn as_tuple(&self) -> (bool, String) {
        (self.success, self.summary.clone())
    }
}

#[derive(Debug, Default)]
struct Tally {
    processed: usize,
    computed: usize,
    skipped: usize,
    failed: usize,
    errors: Vec<String>,
}

enum WeekStatus {
    Computed,
    Skipped(String),
}

/// Fails the run's progress record if the run future is dropped or unwinds
/// before reaching its own terminal transition.
struct RunGuard<'a> {
    tracker: &'a ProgressTracker,
    task_id: String,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        match self.tracker.abandon(WEEKLY_METRICS_TASK, &self.task_id, RUN_ABANDONED) {
            Ok(true) => tracing::warn!(task_id = %self.task_id, "weekly metrics run ended without finishing"),
            Ok(false) => {}
            Err(error) => tracing::error!(error = %error, "could not release the progress slot"),
        }
    }
}

enum WeekError {
    Calculator(String),
    Persist(AppError),
}

pub struct Orchestrator {
    store: Arc<dyn EntityStore>,
    batch: BatchCoordinator,
    tracker: Arc<ProgressTracker>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn EntityStore>,
        tracker: Arc<ProgressTracker>,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
    ) -> Self {
        Self {
            batch: BatchCoordinator::new(store.clone()),
            store,
            tracker,
            clock,
            config,
        }
    }

    pub fn tracker(&self) -> &Arc<ProgressTracker> {
        &self.tracker
    }

    pub fn progress(&self) -> Option<TaskProgress> {
        self.tracker.snapshot()
    }

    pub fn cancel(&self) -> AppResult<bool> {
        self.tracker.request_cancel(WEEKLY_METRICS_TASK)
    }

    /// Runs the request on its own tokio task so the caller stays responsive.
    pub fn spawn(
        self: Arc<Self>,
        calculator: Arc<dyn MetricsCalculator>,
        request: CalculationRequest,
        progress_callback: Option<ProgressCallback>,
    ) -> JoinHandle<AppResult<CalculationReport>> {
        tokio::spawn(async move {
            self.calculate_metrics_for_last_n_weeks(calculator.as_ref(), request, progress_callback.as_deref())
                .await
        })
    }

    /// A request for the configured default window.
    pub fn default_request(&self, profile_id: &str, query_id: &str) -> CalculationRequest {
        CalculationRequest::new(profile_id, query_id, self.config.default_weeks)
    }

    pub async fn calculate_metrics_for_last_n_weeks(
        &self,
        calculator: &dyn MetricsCalculator,
        request: CalculationRequest,
        progress_callback: Option<&(dyn Fn(&str) + Send + Sync)>,
    ) -> AppResult<CalculationReport> {
        if self.store.get_query(&request.profile_id, &request.query_id)?.is_none() {
            return Err(AppError::NotFound(format!(
                "Query not found: {}/{}",
                request.profile_id, request.query_id
            )));
        }

        let weeks = match request.custom_weeks.clone() {
            Some(weeks) => weeks,
            None => last_n_weeks(request.n_weeks, self.clock.now().date_naive())?,
        };
        let total = weeks.len();
        let notify = |message: &str| {
            if let Some(callback) = progress_callback {
                callback(message);
            }
        };

        let started = self.tracker.start_task(WEEKLY_METRICS_TASK)?;
        let _run = RunGuard {
            tracker: &self.tracker,
            task_id: started.task_id,
        };
        self.tracker.set_phase(WEEKLY_METRICS_TASK, "calculating")?;
        let opening = format!("Calculating metrics for {} weeks", total);
        self.tracker.update_progress(WEEKLY_METRICS_TASK, 0, total as u64, &opening)?;
        notify(&opening);
        tracing::info!(
            profile_id = %request.profile_id,
            query_id = %request.query_id,
            weeks = total,
            atomic = request.atomic,
            "weekly metrics run started"
        );

        let mut pending = if self.buffers_for_commit(&request) {
            Some(Vec::new())
        } else {
            None
        };

        let scope = match self.batch.enter() {
            Ok(scope) => scope,
            Err(error) => {
                let _ = self.tracker.fail_task(WEEKLY_METRICS_TASK, &error.to_string());
                return Err(error);
            }
        };

        let every = self.config.progress_every_weeks.max(1);
        let mut tally = Tally::default();
        let mut cancelled = false;

        for (index, week) in weeks.iter().enumerate() {
            if self.tracker.is_task_cancelled(WEEKLY_METRICS_TASK) {
                tracing::info!(week = %week.label, processed = tally.processed, "cancellation observed");
                cancelled = true;
                break;
            }

            match self.process_week(calculator, &request, week, pending.as_mut()) {
                Ok(WeekStatus::Computed) => tally.computed += 1,
                Ok(WeekStatus::Skipped(reason)) => {
                    tracing::debug!(week = %week.label, reason = %reason, "week skipped");
                    tally.skipped += 1;
                }
                Err(WeekError::Calculator(message)) => {
                    tracing::warn!(week = %week.label, error = %message, "week calculation failed");
                    tally.failed += 1;
                    tally.errors.push(format!("{}: {}", week.label, message));
                }
                Err(WeekError::Persist(error)) => {
                    tracing::warn!(week = %week.label, error = %error, "failed to save week snapshot");
                    tally.failed += 1;
                    tally.errors.push(format!("{}: {}", week.label, error));
                }
            }
            tally.processed += 1;

            let done = index + 1;
            if done % every == 0 || done == total {
                let message = format!("Processed {}/{} weeks ({})", done, total, week.label);
                if let Err(error) = self.tracker.update_progress(WEEKLY_METRICS_TASK, done as u64, total as u64, &message) {
                    tracing::warn!(error = %error, "progress update rejected");
                }
                notify(&message);
            }

            self.cooperative_yield().await;
        }

        if let Err(error) = scope.finish() {
            tracing::error!(error = %error, "batch flush failed; earlier writes are kept");
            tally.failed += 1;
            tally.errors.push(format!("flush: {}", error));
        }

        if let Some(snapshots) = pending {
            if let Err(error) = self.commit_snapshots(&snapshots) {
                tracing::error!(error = %error, weeks = tally.computed, "atomic commit failed; rolled back");
                let _ = self.tracker.fail_task(WEEKLY_METRICS_TASK, &error.to_string());
                return Err(error);
            }
        }

        let report = build_report(total, tally, cancelled);
        if cancelled {
            self.tracker.fail_task(WEEKLY_METRICS_TASK, CANCELLED_BY_USER)?;
        } else if report.success {
            self.tracker.complete_task(WEEKLY_METRICS_TASK, &report.summary)?;
        } else {
            self.tracker.fail_task(WEEKLY_METRICS_TASK, &report.summary)?;
        }
        notify(&report.summary);
        tracing::info!(
            computed = report.computed,
            skipped = report.skipped,
            failed = report.failed,
            cancelled = report.cancelled,
            "weekly metrics run finished"
        );
        Ok(report)
    }

    /// Atomic runs on a transactional backend hold their snapshots until the
    /// loop ends, so no transaction stays open across a suspension point.
    fn buffers_for_commit(&self, request: &CalculationRequest) -> bool {
        if !request.atomic {
            return false;
        }
        if !self.store.supports_transactions() {
            tracing::warn!("atomic run requested but the backend has no transactions; continuing best-effort");
            return false;
        }
        true
    }

    fn commit_snapshots(&self, snapshots: &[MetricsSnapshot]) -> AppResult<()> {
        with_transaction(self.store.as_ref(), |tx| {
            for snapshot in snapshots {
                tx.save_metrics_snapshot(snapshot)?;
            }
            Ok(())
        })
    }

    fn process_week(
        &self,
        calculator: &dyn MetricsCalculator,
        request: &CalculationRequest,
        week: &WeekBucket,
        pending: Option<&mut Vec<MetricsSnapshot>>,
    ) -> Result<WeekStatus, WeekError> {
        if !request.force_recalculate {
            if let Some(reason) = self.unchanged_since_last_run(calculator, request, week).map_err(WeekError::Persist)? {
                return Ok(WeekStatus::Skipped(reason));
            }
        }

        let payloads = match calculator.compute(week) {
            Ok(WeekOutcome::Computed(payloads)) => payloads,
            Ok(WeekOutcome::Skipped(reason)) => return Ok(WeekStatus::Skipped(reason)),
            Err(error) => return Err(WeekError::Calculator(format!("{:#}", error))),
        };
        if payloads.is_empty() {
            return Ok(WeekStatus::Skipped("calculator returned no metrics".to_string()));
        }

        let computed_at = self.clock.now();
        let snapshots = payloads.into_iter().map(|payload| MetricsSnapshot {
            profile_id: request.profile_id.clone(),
            query_id: request.query_id.clone(),
            snapshot_date: week.label.clone(),
            metric_type: payload.metric_type,
            metrics: payload.metrics,
            forecast: payload.forecast,
            computed_at,
        });
        match pending {
            Some(pending) => pending.extend(snapshots),
            None => {
                for snapshot in snapshots {
                    self.store.save_metrics_snapshot(&snapshot).map_err(WeekError::Persist)?;
                }
            }
        }
        Ok(WeekStatus::Computed)
    }

    /// Some(reason) when every expected snapshot for the week was computed at
    /// or after the source data last changed.
    fn unchanged_since_last_run(
        &self,
        calculator: &dyn MetricsCalculator,
        request: &CalculationRequest,
        week: &WeekBucket,
    ) -> AppResult<Option<String>> {
        let Some(source_modified) = calculator.source_last_modified() else {
            return Ok(None);
        };
        let metric_types = calculator.metric_types();
        if metric_types.is_empty() {
            return Ok(None);
        }
        for metric_type in metric_types {
            let existing =
                self.store
                    .get_metrics_snapshot(&request.profile_id, &request.query_id, &week.label, metric_type)?;
            match existing {
                Some(snapshot) if snapshot.computed_at >= source_modified => {}
                _ => return Ok(None),
            }
        }
        Ok(Some(format!("source unchanged since {}", source_modified.to_rfc3339())))
    }

    /// Suspension point between weeks so pollers on the same runtime get a turn.
    async fn cooperative_yield(&self) {
        if self.config.yield_millis == 0 {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(std::time::Duration::from_millis(self.config.yield_millis)).await;
        }
    }
}

fn build_report(total: usize, tally: Tally, cancelled: bool) -> CalculationReport {
    let summary = if cancelled {
        format!("Cancelled after calculating {}/{} weeks", tally.processed, total)
    } else {
        let mut summary = format!(
            "Calculated {}/{} weeks ({} skipped, {} failed)",
            tally.computed, total, tally.skipped, tally.failed
        );
        if !tally.errors.is_empty() {
            let shown = tally
                .errors
                .iter()
                .take(MAX_REPORTED_ERRORS)
                .map(|error| truncate(error, MAX_ERROR_CHARS))
                .collect::<Vec<_>>();
            summary.push_str(". Errors: ");
            summary.push_str(&shown.join("; "));
            if tally.errors.len() > MAX_REPORTED_ERRORS {
                summary.push_str(&format!(" (+{} more)", tally.errors.len() - MAX_REPORTED_ERRORS));
            }
        }
        summary
    };

    CalculationReport {
        success: !cancelled && tally.failed == 0,
        cancelled,
        summary,
        total,
        processed: tally.processed,
        computed: tally.computed,
        skipped: tally.skipped,
        failed: tally.failed,
        errors: tally.errors,
    }
}

fn truncate(raw: &str, max_chars: usize) -> String {
    if raw.chars().count() <= max_chars {
        return raw.to_string();
    }
    let truncated: String = raw.chars().take(max_chars - 3).collect();
    format!("{}...", truncated)
}
