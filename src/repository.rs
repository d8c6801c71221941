//! Repository contract shared by every storage backend.
//!
//! Reads return `Ok(None)` for absent rows and never fail because of absence.
//! Saves validate required fields (`AppError::Validation`) and require the
//! owning parent to exist (`AppError::NotFound`). Deletes fail with
//! `AppError::NotFound` when the target is absent and cascade through every
//! dependent row as one logical unit.
//!
//! Cache reads filter by expiry at read time, so an expired row is never
//! returned whether or not `cleanup_expired_cache` has run.

use crate::config::{BackendKind, EngineConfig};
use crate::db::json_store::JsonStore;
use crate::db::Database;
use crate::errors::{AppError, AppResult};
use crate::models::{
    ChangelogCacheEntry, JiraCacheEntry, MetricType, MetricsSnapshot, Profile, ProjectData, Query,
    SaveProfilePayload, SaveQueryPayload, TaskProgress,
};
use std::sync::Arc;

pub trait EntityStore: Send + Sync {
    // Profiles
    fn get_profile(&self, profile_id: &str) -> AppResult<Option<Profile>>;
    fn list_profiles(&self) -> AppResult<Vec<Profile>>;
    fn save_profile(&self, payload: SaveProfilePayload) -> AppResult<Profile>;
    fn delete_profile(&self, profile_id: &str) -> AppResult<()>;

    // Queries
    fn get_query(&self, profile_id: &str, query_id: &str) -> AppResult<Option<Query>>;
    fn list_queries(&self, profile_id: &str) -> AppResult<Vec<Query>>;
    fn save_query(&self, payload: SaveQueryPayload) -> AppResult<Query>;
    fn delete_query(&self, profile_id: &str, query_id: &str) -> AppResult<()>;

    // JIRA response cache
    fn get_jira_cache(&self, profile_id: &str, query_id: &str, cache_key: &str) -> AppResult<Option<JiraCacheEntry>>;
    fn save_jira_cache(&self, entry: &JiraCacheEntry) -> AppResult<()>;

    // JIRA changelog cache
    fn get_changelog_cache(
        &self,
        profile_id: &str,
        query_id: &str,
        issue_key: &str,
    ) -> AppResult<Option<ChangelogCacheEntry>>;
    fn save_changelog_cache(&self, entry: &ChangelogCacheEntry) -> AppResult<()>;

    /// Removes every expired row from both caches and returns how many went.
    fn cleanup_expired_cache(&self) -> AppResult<usize>;
    /// Removes every cache row of one query regardless of expiry.
    fn clear_query_cache(&self, profile_id: &str, query_id: &str) -> AppResult<usize>;

    // Project data
    fn get_project_data(&self, profile_id: &str, query_id: &str) -> AppResult<Option<ProjectData>>;
    fn save_project_data(&self, data: &ProjectData) -> AppResult<()>;

    // Metrics snapshots
    fn get_metrics_snapshot(
        &self,
        profile_id: &str,
        query_id: &str,
        snapshot_date: &str,
        metric_type: MetricType,
    ) -> AppResult<Option<MetricsSnapshot>>;
    /// Snapshots ordered by week ascending. `limit` keeps the most recent weeks.
    fn get_metrics_snapshots(
        &self,
        profile_id: &str,
        query_id: &str,
        metric_type: Option<MetricType>,
        limit: Option<usize>,
    ) -> AppResult<Vec<MetricsSnapshot>>;
    fn save_metrics_snapshot(&self, snapshot: &MetricsSnapshot) -> AppResult<()>;
    fn delete_metrics_snapshots(&self, profile_id: &str, query_id: &str) -> AppResult<usize>;

    // Task progress
    fn get_task_progress(&self, task_name: &str) -> AppResult<Option<TaskProgress>>;
    fn save_task_progress(&self, progress: &TaskProgress) -> AppResult<()>;
    fn clear_task_progress(&self, task_name: &str) -> AppResult<()>;

    // App state
    fn get_app_state(&self, key: &str) -> AppResult<Option<String>>;
    fn set_app_state(&self, key: &str, value: &str) -> AppResult<()>;
    fn delete_app_state(&self, key: &str) -> AppResult<()>;

    // Transactions
    fn supports_transactions(&self) -> bool;
    fn begin_transaction(&self) -> AppResult<()>;
    fn commit_transaction(&self) -> AppResult<()>;
    fn rollback_transaction(&self) -> AppResult<()>;

    /// Start deferring expensive I/O. Backends that write through ignore it.
    fn begin_batch(&self) -> AppResult<()> {
        Ok(())
    }

    /// Persist whatever `begin_batch` deferred.
    fn flush_batch(&self) -> AppResult<()> {
        Ok(())
    }
}

/// Pairs `begin_transaction` with exactly one commit or rollback.
///
/// Dropping the guard without calling [`TransactionGuard::commit`] rolls back.
pub struct TransactionGuard<'a> {
    store: &'a dyn EntityStore,
    finished: bool,
}

impl<'a> TransactionGuard<'a> {
    pub fn begin(store: &'a dyn EntityStore) -> AppResult<Self> {
        if !store.supports_transactions() {
            tracing::debug!("backend has no native transactions; writes are not isolated");
        }
        store.begin_transaction()?;
        Ok(Self { store, finished: false })
    }

    pub fn commit(mut self) -> AppResult<()> {
        self.finished = true;
        self.store.commit_transaction()
    }

    pub fn rollback(mut self) -> AppResult<()> {
        self.finished = true;
        self.store.rollback_transaction()
    }
}

impl Drop for TransactionGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(error) = self.store.rollback_transaction() {
                tracing::error!(error = %error, "rollback on drop failed");
            }
        }
    }
}

/// Runs `work` inside a transaction: commit on `Ok`, rollback and re-raise on `Err`.
pub fn with_transaction<T>(
    store: &dyn EntityStore,
    work: impl FnOnce(&dyn EntityStore) -> AppResult<T>,
) -> AppResult<T> {
    let guard = TransactionGuard::begin(store)?;
    match work(store) {
        Ok(value) => {
            guard.commit()?;
            Ok(value)
        }
        Err(error) => {
            if let Err(rollback_error) = guard.rollback() {
                tracing::error!(error = %rollback_error, "rollback after failure did not complete");
            }
            Err(error)
        }
    }
}

/// Opens the backend named by the configuration inside its data directory.
pub fn open_store(config: &EngineConfig) -> AppResult<Arc<dyn EntityStore>> {
    let store: Arc<dyn EntityStore> = match config.backend {
        BackendKind::Sqlite => Arc::new(Database::new(&config.data_dir.join("state.sqlite"))?),
        BackendKind::Json => Arc::new(JsonStore::open(&config.data_dir.join("state.json"))?),
    };
    tracing::info!(
        backend = config.backend.as_str(),
        data_dir = %config.data_dir.display(),
        transactional = store.supports_transactions(),
        "opened entity store"
    );
    Ok(store)
}

pub(crate) fn require(entity: &str, field: &str, value: &str) -> AppResult<()> {
    if value.trim().is_empty() {
        return Err(AppError::missing_field(entity, field));
    }
    Ok(())
}
