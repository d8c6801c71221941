//! Flat-file backend: the whole store is one JSON document.
//!
//! Outside a batch every mutation is applied to a copy, written to disk and
//! only then swapped in, so a failed write leaves memory and disk agreeing.
//! Inside a batch mutations apply in memory immediately and the file is
//! written once on `flush_batch`. Transactions are no-ops.
//!
//! Task progress lives in a sidecar file next to the store
//! (`state.progress.json` for `state.json`). It is written through on every
//! save, batch or not, and read from disk on every lookup so pollers and
//! cancel requests in other processes see it.

use crate::clock::{Clock, SystemClock};
use crate::errors::{AppError, AppResult};
use crate::models::{
    ChangelogCacheEntry, JiraCacheEntry, MetricType, MetricsSnapshot, Profile, ProjectData, Query,
    SaveProfilePayload, SaveQueryPayload, TaskProgress, ACTIVE_PROFILE_KEY,
};
use crate::repository::{require, EntityStore};
use crate::weeks::parse_week_label;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct StoreState {
    profiles: BTreeMap<String, Profile>,
    queries: Vec<Query>,
    jira_cache: Vec<JiraCacheEntry>,
    changelog_cache: Vec<ChangelogCacheEntry>,
    project_data: Vec<ProjectData>,
    metrics_snapshots: Vec<MetricsSnapshot>,
    app_state: BTreeMap<String, String>,
}

impl StoreState {
    fn has_query(&self, profile_id: &str, query_id: &str) -> bool {
        self.queries
            .iter()
            .any(|query| query.profile_id == profile_id && query.id == query_id)
    }

    fn ensure_query(&self, profile_id: &str, query_id: &str) -> AppResult<()> {
        if self.has_query(profile_id, query_id) {
            Ok(())
        } else {
            Err(AppError::NotFound(format!("Query not found: {}/{}", profile_id, query_id)))
        }
    }

    fn remove_query_dependents(&mut self, profile_id: &str, query_id: &str) {
        let owned = |p: &str, q: &str| p == profile_id && q == query_id;
        self.jira_cache.retain(|row| !owned(&row.profile_id, &row.query_id));
        self.changelog_cache.retain(|row| !owned(&row.profile_id, &row.query_id));
        self.project_data.retain(|row| !owned(&row.profile_id, &row.query_id));
        self.metrics_snapshots.retain(|row| !owned(&row.profile_id, &row.query_id));
    }
}

#[derive(Debug)]
pub struct JsonStore {
    path: PathBuf,
    progress_path: PathBuf,
    state: Mutex<StoreState>,
    progress_lock: Mutex<()>,
    batching: AtomicBool,
    dirty: AtomicBool,
    clock: Arc<dyn Clock>,
}

impl JsonStore {
    pub fn open(path: &Path) -> AppResult<Self> {
        Self::open_with_clock(path, Arc::new(SystemClock))
    }

    pub fn open_with_clock(path: &Path, clock: Arc<dyn Clock>) -> AppResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let state = if path.is_file() {
            let raw = fs::read_to_string(path)?;
            if raw.trim().is_empty() {
                StoreState::default()
            } else {
                serde_json::from_str::<StoreState>(&raw)
                    .map_err(|err| AppError::Io(format!("Corrupt store file {}: {}", path.display(), err)))?
            }
        } else {
            StoreState::default()
        };

        Ok(Self {
            path: path.to_path_buf(),
            progress_path: path.with_extension("progress.json"),
            state: Mutex::new(state),
            progress_lock: Mutex::new(()),
            batching: AtomicBool::new(false),
            dirty: AtomicBool::new(false),
            clock,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> AppResult<MutexGuard<'_, StoreState>> {
        self.state
            .lock()
            .map_err(|_| AppError::Internal("json store mutex poisoned".to_string()))
    }

    fn read<T>(&self, view: impl FnOnce(&StoreState) -> T) -> AppResult<T> {
        let state = self.lock()?;
        Ok(view(&state))
    }

    fn mutate<T>(&self, change: impl FnOnce(&mut StoreState) -> AppResult<T>) -> AppResult<T> {
        let mut state = self.lock()?;
        if self.batching.load(Ordering::SeqCst) {
            let value = change(&mut state)?;
            self.dirty.store(true, Ordering::SeqCst);
            return Ok(value);
        }
        let mut next = state.clone();
        let value = change(&mut next)?;
        self.write_file(&next)?;
        *state = next;
        Ok(value)
    }

    fn write_file(&self, state: &StoreState) -> AppResult<()> {
        write_atomically(&self.path, state)
    }

    fn read_progress(&self) -> AppResult<BTreeMap<String, TaskProgress>> {
        if !self.progress_path.is_file() {
            return Ok(BTreeMap::new());
        }
        let raw = fs::read_to_string(&self.progress_path)?;
        if raw.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        serde_json::from_str(&raw).map_err(|err| {
            AppError::Io(format!("Corrupt progress file {}: {}", self.progress_path.display(), err))
        })
    }

    fn update_progress_file(&self, change: impl FnOnce(&mut BTreeMap<String, TaskProgress>)) -> AppResult<()> {
        let _writer = self
            .progress_lock
            .lock()
            .map_err(|_| AppError::Internal("progress file mutex poisoned".to_string()))?;
        let mut records = self.read_progress()?;
        change(&mut records);
        write_atomically(&self.progress_path, &records)
    }
}

fn write_atomically(path: &Path, value: &impl Serialize) -> AppResult<()> {
    let raw = serde_json::to_string_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, raw).map_err(|err| AppError::Io(format!("Failed to write {}: {}", tmp.display(), err)))?;
    fs::rename(&tmp, path).map_err(|err| AppError::Io(format!("Failed to replace {}: {}", path.display(), err)))?;
    Ok(())
}

impl EntityStore for JsonStore {
    fn get_profile(&self, profile_id: &str) -> AppResult<Option<Profile>> {
        self.read(|state| state.profiles.get(profile_id).cloned())
    }

    fn list_profiles(&self) -> AppResult<Vec<Profile>> {
        self.read(|state| {
            let mut profiles = state.profiles.values().cloned().collect::<Vec<_>>();
            profiles.sort_by(|a, b| a.name.cmp(&b.name));
            profiles
        })
    }

    fn save_profile(&self, payload: SaveProfilePayload) -> AppResult<Profile> {
        require("profile", "name", &payload.name)?;
        let id = payload.id.unwrap_or_else(|| Uuid::new_v4().to_string());
        require("profile", "id", &id)?;
        let now = self.clock.now();

        self.mutate(|state| {
            let created_at = state.profiles.get(&id).map(|p| p.created_at).unwrap_or(now);
            let profile = Profile {
                id: id.clone(),
                name: payload.name,
                jira_config: payload.jira_config,
                field_mappings: payload.field_mappings,
                created_at,
                updated_at: now,
            };
            state.profiles.insert(id, profile.clone());
            Ok(profile)
        })
    }

    fn delete_profile(&self, profile_id: &str) -> AppResult<()> {
        self.mutate(|state| {
            if state.profiles.remove(profile_id).is_none() {
                return Err(AppError::NotFound(format!("Profile not found: {}", profile_id)));
            }
            let owned = state
                .queries
                .iter()
                .filter(|query| query.profile_id == profile_id)
                .map(|query| query.id.clone())
                .collect::<Vec<_>>();
            for query_id in owned {
                state.remove_query_dependents(profile_id, &query_id);
            }
            state.queries.retain(|query| query.profile_id != profile_id);
            if state.app_state.get(ACTIVE_PROFILE_KEY).map(String::as_str) == Some(profile_id) {
                state.app_state.remove(ACTIVE_PROFILE_KEY);
            }
            Ok(())
        })?;
        tracing::info!(profile_id = %profile_id, "deleted profile and its dependents");
        Ok(())
    }

    fn get_query(&self, profile_id: &str, query_id: &str) -> AppResult<Option<Query>> {
        self.read(|state| {
            state
                .queries
                .iter()
                .find(|query| query.profile_id == profile_id && query.id == query_id)
                .cloned()
        })
    }

    fn list_queries(&self, profile_id: &str) -> AppResult<Vec<Query>> {
        self.read(|state| {
            let mut queries = state
                .queries
                .iter()
                .filter(|query| query.profile_id == profile_id)
                .cloned()
                .collect::<Vec<_>>();
            queries.sort_by(|a, b| a.name.cmp(&b.name));
            queries
        })
    }

    fn save_query(&self, payload: SaveQueryPayload) -> AppResult<Query> {
        require("query", "profile_id", &payload.profile_id)?;
        require("query", "name", &payload.name)?;
        require("query", "jql", &payload.jql)?;
        let id = payload.id.unwrap_or_else(|| Uuid::new_v4().to_string());
        require("query", "id", &id)?;
        let now = self.clock.now();

        self.mutate(|state| {
            if !state.profiles.contains_key(&payload.profile_id) {
                return Err(AppError::NotFound(format!("Profile not found: {}", payload.profile_id)));
            }
            let existing = state
                .queries
                .iter()
                .position(|query| query.profile_id == payload.profile_id && query.id == id);
            let query = Query {
                id: id.clone(),
                profile_id: payload.profile_id.clone(),
                name: payload.name,
                jql: payload.jql,
                created_at: existing.map(|index| state.queries[index].created_at).unwrap_or(now),
                updated_at: now,
            };
            match existing {
                Some(index) => state.queries[index] = query.clone(),
                None => state.queries.push(query.clone()),
            }
            Ok(query)
        })
    }

    fn delete_query(&self, profile_id: &str, query_id: &str) -> AppResult<()> {
        self.mutate(|state| {
            if !state.has_query(profile_id, query_id) {
                return Err(AppError::NotFound(format!("Query not found: {}/{}", profile_id, query_id)));
            }
            state.remove_query_dependents(profile_id, query_id);
            state
                .queries
                .retain(|query| !(query.profile_id == profile_id && query.id == query_id));
            Ok(())
        })
    }

    fn get_jira_cache(&self, profile_id: &str, query_id: &str, cache_key: &str) -> AppResult<Option<JiraCacheEntry>> {
        let now = self.clock.now();
        self.read(|state| {
            state
                .jira_cache
                .iter()
                .find(|row| {
                    row.profile_id == profile_id
                        && row.query_id == query_id
                        && row.cache_key == cache_key
                        && row.expires_at > now
                })
                .cloned()
        })
    }

    fn save_jira_cache(&self, entry: &JiraCacheEntry) -> AppResult<()> {
        require("jira cache entry", "cache_key", &entry.cache_key)?;
        self.mutate(|state| {
            state.ensure_query(&entry.profile_id, &entry.query_id)?;
            match state.jira_cache.iter_mut().find(|row| {
                row.profile_id == entry.profile_id && row.query_id == entry.query_id && row.cache_key == entry.cache_key
            }) {
                Some(row) => *row = entry.clone(),
                None => state.jira_cache.push(entry.clone()),
            }
            Ok(())
        })
    }

    fn get_changelog_cache(
        &self,
        profile_id: &str,
        query_id: &str,
        issue_key: &str,
    ) -> AppResult<Option<ChangelogCacheEntry>> {
        let now = self.clock.now();
        self.read(|state| {
            state
                .changelog_cache
                .iter()
                .find(|row| {
                    row.profile_id == profile_id
                        && row.query_id == query_id
                        && row.issue_key == issue_key
                        && row.expires_at > now
                })
                .cloned()
        })
    }

    fn save_changelog_cache(&self, entry: &ChangelogCacheEntry) -> AppResult<()> {
        require("changelog cache entry", "issue_key", &entry.issue_key)?;
        self.mutate(|state| {
            state.ensure_query(&entry.profile_id, &entry.query_id)?;
            match state.changelog_cache.iter_mut().find(|row| {
                row.profile_id == entry.profile_id && row.query_id == entry.query_id && row.issue_key == entry.issue_key
            }) {
                Some(row) => *row = entry.clone(),
                None => state.changelog_cache.push(entry.clone()),
            }
            Ok(())
        })
    }

    fn cleanup_expired_cache(&self) -> AppResult<usize> {
        let now = self.clock.now();
        let expired = self.read(|state| {
            state.jira_cache.iter().filter(|row| row.expires_at <= now).count()
                + state.changelog_cache.iter().filter(|row| row.expires_at <= now).count()
        })?;
        if expired == 0 {
            return Ok(0);
        }
        self.mutate(|state| {
            let before = state.jira_cache.len() + state.changelog_cache.len();
            state.jira_cache.retain(|row| row.expires_at > now);
            state.changelog_cache.retain(|row| row.expires_at > now);
            Ok(before - state.jira_cache.len() - state.changelog_cache.len())
        })
    }

    fn clear_query_cache(&self, profile_id: &str, query_id: &str) -> AppResult<usize> {
        self.mutate(|state| {
            let before = state.jira_cache.len() + state.changelog_cache.len();
            state
                .jira_cache
                .retain(|row| !(row.profile_id == profile_id && row.query_id == query_id));
            state
                .changelog_cache
                .retain(|row| !(row.profile_id == profile_id && row.query_id == query_id));
            Ok(before - state.jira_cache.len() - state.changelog_cache.len())
        })
    }

    fn get_project_data(&self, profile_id: &str, query_id: &str) -> AppResult<Option<ProjectData>> {
        self.read(|state| {
            state
                .project_data
                .iter()
                .find(|row| row.profile_id == profile_id && row.query_id == query_id)
                .cloned()
        })
    }

    fn save_project_data(&self, data: &ProjectData) -> AppResult<()> {
        self.mutate(|state| {
            state.ensure_query(&data.profile_id, &data.query_id)?;
            match state
                .project_data
                .iter_mut()
                .find(|row| row.profile_id == data.profile_id && row.query_id == data.query_id)
            {
                Some(row) => *row = data.clone(),
                None => state.project_data.push(data.clone()),
            }
            Ok(())
        })
    }

    fn get_metrics_snapshot(
        &self,
        profile_id: &str,
        query_id: &str,
        snapshot_date: &str,
        metric_type: MetricType,
    ) -> AppResult<Option<MetricsSnapshot>> {
        self.read(|state| {
            state
                .metrics_snapshots
                .iter()
                .find(|row| {
                    row.profile_id == profile_id
                        && row.query_id == query_id
                        && row.snapshot_date == snapshot_date
                        && row.metric_type == metric_type
                })
                .cloned()
        })
    }

    fn get_metrics_snapshots(
        &self,
        profile_id: &str,
        query_id: &str,
        metric_type: Option<MetricType>,
        limit: Option<usize>,
    ) -> AppResult<Vec<MetricsSnapshot>> {
        self.read(|state| {
            let mut rows = state
                .metrics_snapshots
                .iter()
                .filter(|row| row.profile_id == profile_id && row.query_id == query_id)
                .filter(|row| metric_type.map_or(true, |wanted| row.metric_type == wanted))
                .cloned()
                .collect::<Vec<_>>();
            rows.sort_by(|a, b| {
                a.snapshot_date
                    .cmp(&b.snapshot_date)
                    .then(a.metric_type.cmp(&b.metric_type))
            });
            if let Some(limit) = limit {
                let skip = rows.len().saturating_sub(limit);
                rows.drain(..skip);
            }
            rows
        })
    }

    fn save_metrics_snapshot(&self, snapshot: &MetricsSnapshot) -> AppResult<()> {
        parse_week_label(&snapshot.snapshot_date)?;
        self.mutate(|state| {
            state.ensure_query(&snapshot.profile_id, &snapshot.query_id)?;
            match state.metrics_snapshots.iter_mut().find(|row| {
                row.profile_id == snapshot.profile_id
                    && row.query_id == snapshot.query_id
                    && row.snapshot_date == snapshot.snapshot_date
                    && row.metric_type == snapshot.metric_type
            }) {
                Some(row) => *row = snapshot.clone(),
                None => state.metrics_snapshots.push(snapshot.clone()),
            }
            Ok(())
        })
    }

    fn delete_metrics_snapshots(&self, profile_id: &str, query_id: &str) -> AppResult<usize> {
        self.mutate(|state| {
            let before = state.metrics_snapshots.len();
            state
                .metrics_snapshots
                .retain(|row| !(row.profile_id == profile_id && row.query_id == query_id));
            Ok(before - state.metrics_snapshots.len())
        })
    }

    fn get_task_progress(&self, task_name: &str) -> AppResult<Option<TaskProgress>> {
        Ok(self.read_progress()?.remove(task_name))
    }

    fn save_task_progress(&self, progress: &TaskProgress) -> AppResult<()> {
        require("task progress", "task_name", &progress.task_name)?;
        self.update_progress_file(|records| {
            records.insert(progress.task_name.clone(), progress.clone());
        })
    }

    fn clear_task_progress(&self, task_name: &str) -> AppResult<()> {
        self.update_progress_file(|records| {
            records.remove(task_name);
        })
    }

    fn get_app_state(&self, key: &str) -> AppResult<Option<String>> {
        self.read(|state| state.app_state.get(key).cloned())
    }

    fn set_app_state(&self, key: &str, value: &str) -> AppResult<()> {
        require("app state", "key", key)?;
        self.mutate(|state| {
            state.app_state.insert(key.to_string(), value.to_string());
            Ok(())
        })
    }

    fn delete_app_state(&self, key: &str) -> AppResult<()> {
        self.mutate(|state| {
            state.app_state.remove(key);
            Ok(())
        })
    }

    fn supports_transactions(&self) -> bool {
        false
    }

    fn begin_transaction(&self) -> AppResult<()> {
        Ok(())
    }

    fn commit_transaction(&self) -> AppResult<()> {
        Ok(())
    }

    fn rollback_transaction(&self) -> AppResult<()> {
        Ok(())
    }

    fn begin_batch(&self) -> AppResult<()> {
        self.batching.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn flush_batch(&self) -> AppResult<()> {
        let state = self.lock()?;
        self.batching.store(false, Ordering::SeqCst);
        if self.dirty.swap(false, Ordering::SeqCst) {
            if let Err(error) = self.write_file(&state) {
                self.dirty.store(true, Ordering::SeqCst);
                return Err(error);
            }
        }
        Ok(())
    }
}
