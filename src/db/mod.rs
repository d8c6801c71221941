pub mod json_store;

use crate::clock::{Clock, SystemClock};
use crate::errors::{AppError, AppResult};
use crate::models::{
    ChangelogCacheEntry, JiraCacheEntry, MetricType, MetricsSnapshot, Profile, ProjectData, Query,
    SaveProfilePayload, SaveQueryPayload, TaskProgress, TaskStatus, ACTIVE_PROFILE_KEY,
};
use crate::repository::{require, EntityStore};
use crate::weeks::parse_week_label;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, ThreadId};
use std::time::Duration;
use uuid::Uuid;

const SCHEMA_SQL: &str = include_str!("schema.sql");
/// How long a caller waits for another thread's transaction to finish.
const TRANSACTION_WAIT: Duration = Duration::from_secs(5);

/// SQLite backend. Cascades are enforced by foreign keys and run inside a
/// savepoint so they also nest under an explicit transaction.
///
/// An explicit transaction belongs to the thread that began it. Other threads
/// wait for it to commit or roll back instead of joining it.
#[derive(Debug)]
pub struct Database {
    conn: Mutex<Connection>,
    tx_owner: Mutex<Option<ThreadId>>,
    tx_released: Condvar,
    db_path: PathBuf,
    clock: Arc<dyn Clock>,
}

impl Database {
    pub fn new(path: &Path) -> AppResult<Self> {
        Self::with_clock(path, Arc::new(SystemClock))
    }

    pub fn with_clock(path: &Path, clock: Arc<dyn Clock>) -> AppResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| AppError::Io(err.to_string()))?;
        }
        let conn = Connection::open(path).map_err(AppError::from)?;
        conn.execute_batch(SCHEMA_SQL).map_err(AppError::from)?;

        Ok(Self {
            conn: Mutex::new(conn),
            tx_owner: Mutex::new(None),
            tx_released: Condvar::new(),
            db_path: path.to_path_buf(),
            clock,
        })
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    fn lock(&self) -> AppResult<MutexGuard<'_, Connection>> {
        let owner = self.wait_for_transaction()?;
        let conn = self.lock_conn()?;
        drop(owner);
        Ok(conn)
    }

    fn lock_conn(&self) -> AppResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| AppError::Internal("database mutex poisoned".to_string()))
    }

    /// Blocks while another thread owns a transaction. The returned guard
    /// keeps ownership from changing until the caller has the connection.
    fn wait_for_transaction(&self) -> AppResult<MutexGuard<'_, Option<ThreadId>>> {
        let me = thread::current().id();
        let owner = self
            .tx_owner
            .lock()
            .map_err(|_| AppError::Internal("transaction owner mutex poisoned".to_string()))?;
        let (owner, wait) = self
            .tx_released
            .wait_timeout_while(owner, TRANSACTION_WAIT, |owner| owner.is_some_and(|id| id != me))
            .map_err(|_| AppError::Internal("transaction owner mutex poisoned".to_string()))?;
        if wait.timed_out() && owner.is_some_and(|id| id != me) {
            return Err(AppError::Conflict(
                "the store is busy inside another caller's transaction".to_string(),
            ));
        }
        Ok(owner)
    }

    fn finish_transaction(&self, statement: &str) -> AppResult<()> {
        let me = thread::current().id();
        let mut owner = self
            .tx_owner
            .lock()
            .map_err(|_| AppError::Internal("transaction owner mutex poisoned".to_string()))?;
        if *owner != Some(me) {
            return Err(AppError::Internal(format!(
                "{} without a transaction owned by this caller",
                statement
            )));
        }
        let conn = self.lock_conn()?;
        if conn.is_autocommit() {
            *owner = None;
            self.tx_released.notify_all();
            return Err(AppError::Internal(format!("{} without an active transaction", statement)));
        }
        conn.execute_batch(statement)?;
        *owner = None;
        self.tx_released.notify_all();
        Ok(())
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}

impl EntityStore for Database {
    // ─── Profiles ───────────────────────────────────────────────────────────

    fn get_profile(&self, profile_id: &str) -> AppResult<Option<Profile>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT id, name, jira_config_json, field_mappings_json, created_at, updated_at
             FROM profiles WHERE id = ?1",
            [profile_id],
            parse_profile_row,
        )
        .optional()
        .map_err(AppError::from)
    }

    fn list_profiles(&self) -> AppResult<Vec<Profile>> {
        let conn = self.lock()?;
        let mut statement = conn.prepare(
            "SELECT id, name, jira_config_json, field_mappings_json, created_at, updated_at
             FROM profiles ORDER BY name ASC",
        )?;
        let profiles = statement
            .query_map([], parse_profile_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(profiles)
    }

    fn save_profile(&self, payload: SaveProfilePayload) -> AppResult<Profile> {
        require("profile", "name", &payload.name)?;
        let id = payload.id.unwrap_or_else(|| Uuid::new_v4().to_string());
        require("profile", "id", &id)?;
        let now = self.now();

        let conn = self.lock()?;
        let existing_created: Option<String> = conn
            .query_row("SELECT created_at FROM profiles WHERE id = ?1", [id.as_str()], |row| row.get(0))
            .optional()?;
        let created_at = match existing_created {
            Some(raw) => parse_time(&raw)?,
            None => now,
        };

        conn.execute(
            "INSERT INTO profiles (id, name, jira_config_json, field_mappings_json, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
               name = excluded.name,
               jira_config_json = excluded.jira_config_json,
               field_mappings_json = excluded.field_mappings_json,
               updated_at = excluded.updated_at",
            params![
                id,
                payload.name,
                serde_json::to_string(&payload.jira_config)?,
                serde_json::to_string(&payload.field_mappings)?,
                created_at.to_rfc3339(),
                now.to_rfc3339(),
            ],
        )?;

        Ok(Profile {
            id,
            name: payload.name,
            jira_config: payload.jira_config,
            field_mappings: payload.field_mappings,
            created_at,
            updated_at: now,
        })
    }

    fn delete_profile(&self, profile_id: &str) -> AppResult<()> {
        let mut conn = self.lock()?;
        let sp = conn.savepoint()?;
        sp.execute(
            "DELETE FROM app_state WHERE key = ?1 AND value = ?2",
            params![ACTIVE_PROFILE_KEY, profile_id],
        )?;
        let changed = sp.execute("DELETE FROM profiles WHERE id = ?1", [profile_id])?;
        if changed == 0 {
            sp.finish()?;
            return Err(AppError::NotFound(format!("Profile not found: {}", profile_id)));
        }
        sp.commit()?;
        tracing::info!(profile_id = %profile_id, "deleted profile and its dependents");
        Ok(())
    }

    // ─── Queries ────────────────────────────────────────────────────────────

    fn get_query(&self, profile_id: &str, query_id: &str) -> AppResult<Option<Query>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT id, profile_id, name, jql, created_at, updated_at
             FROM queries WHERE profile_id = ?1 AND id = ?2",
            params![profile_id, query_id],
            parse_query_row,
        )
        .optional()
        .map_err(AppError::from)
    }

    fn list_queries(&self, profile_id: &str) -> AppResult<Vec<Query>> {
        let conn = self.lock()?;
        let mut statement = conn.prepare(
            "SELECT id, profile_id, name, jql, created_at, updated_at
             FROM queries WHERE profile_id = ?1 ORDER BY name ASC",
        )?;
        let queries = statement
            .query_map([profile_id], parse_query_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(queries)
    }

    fn save_query(&self, payload: SaveQueryPayload) -> AppResult<Query> {
        require("query", "profile_id", &payload.profile_id)?;
        require("query", "name", &payload.name)?;
        require("query", "jql", &payload.jql)?;
        let id = payload.id.unwrap_or_else(|| Uuid::new_v4().to_string());
        require("query", "id", &id)?;
        let now = self.now();

        let conn = self.lock()?;
        if !row_exists(&conn, "SELECT COUNT(1) FROM profiles WHERE id = ?1", &[&payload.profile_id])? {
            return Err(AppError::NotFound(format!("Profile not found: {}", payload.profile_id)));
        }
        let existing_created: Option<String> = conn
            .query_row(
                "SELECT created_at FROM queries WHERE profile_id = ?1 AND id = ?2",
                params![payload.profile_id, id],
                |row| row.get(0),
            )
            .optional()?;
        let created_at = match existing_created {
            Some(raw) => parse_time(&raw)?,
            None => now,
        };

        conn.execute(
            "INSERT INTO queries (profile_id, id, name, jql, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(profile_id, id) DO UPDATE SET
               name = excluded.name,
               jql = excluded.jql,
               updated_at = excluded.updated_at",
            params![
                payload.profile_id,
                id,
                payload.name,
                payload.jql,
                created_at.to_rfc3339(),
                now.to_rfc3339(),
            ],
        )?;

        Ok(Query {
            id,
            profile_id: payload.profile_id,
            name: payload.name,
            jql: payload.jql,
            created_at,
            updated_at: now,
        })
    }

    fn delete_query(&self, profile_id: &str, query_id: &str) -> AppResult<()> {
        let mut conn = self.lock()?;
        let sp = conn.savepoint()?;
        let changed = sp.execute(
            "DELETE FROM queries WHERE profile_id = ?1 AND id = ?2",
            params![profile_id, query_id],
        )?;
        if changed == 0 {
            sp.finish()?;
            return Err(AppError::NotFound(format!("Query not found: {}/{}", profile_id, query_id)));
        }
        sp.commit()?;
        Ok(())
    }

    // ─── Caches ─────────────────────────────────────────────────────────────

    fn get_jira_cache(&self, profile_id: &str, query_id: &str, cache_key: &str) -> AppResult<Option<JiraCacheEntry>> {
        let now_ms = self.now().timestamp_millis();
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT profile_id, query_id, cache_key, payload_json, cached_at, expires_at_ms
                 FROM jira_cache
                 WHERE profile_id = ?1 AND query_id = ?2 AND cache_key = ?3 AND expires_at_ms > ?4",
                params![profile_id, query_id, cache_key, now_ms],
                |row| {
                    let raw_payload: String = row.get(3)?;
                    Ok((
                        JiraCacheEntry {
                            profile_id: row.get(0)?,
                            query_id: row.get(1)?,
                            cache_key: row.get(2)?,
                            payload: serde_json::Value::Null,
                            cached_at: parse_time(&row.get::<_, String>(4)?)?,
                            expires_at: parse_millis(row.get(5)?)?,
                        },
                        raw_payload,
                    ))
                },
            )
            .optional()?;
        Ok(row.and_then(|(mut entry, raw)| {
            entry.payload = cached_payload("jira_cache", &entry.cache_key, &raw)?;
            Some(entry)
        }))
    }

    fn save_jira_cache(&self, entry: &JiraCacheEntry) -> AppResult<()> {
        require("jira cache entry", "cache_key", &entry.cache_key)?;
        let conn = self.lock()?;
        ensure_query(&conn, &entry.profile_id, &entry.query_id)?;
        conn.execute(
            "INSERT INTO jira_cache (profile_id, query_id, cache_key, payload_json, cached_at, expires_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(profile_id, query_id, cache_key) DO UPDATE SET
               payload_json = excluded.payload_json,
               cached_at = excluded.cached_at,
               expires_at_ms = excluded.expires_at_ms",
            params![
                entry.profile_id,
                entry.query_id,
                entry.cache_key,
                serde_json::to_string(&entry.payload)?,
                entry.cached_at.to_rfc3339(),
                entry.expires_at.timestamp_millis(),
            ],
        )?;
        Ok(())
    }

    fn get_changelog_cache(
        &self,
        profile_id: &str,
        query_id: &str,
        issue_key: &str,
    ) -> AppResult<Option<ChangelogCacheEntry>> {
        let now_ms = self.now().timestamp_millis();
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT profile_id, query_id, issue_key, payload_json, cached_at, expires_at_ms
                 FROM jira_changelog_cache
                 WHERE profile_id = ?1 AND query_id = ?2 AND issue_key = ?3 AND expires_at_ms > ?4",
                params![profile_id, query_id, issue_key, now_ms],
                |row| {
                    let raw_payload: String = row.get(3)?;
                    Ok((
                        ChangelogCacheEntry {
                            profile_id: row.get(0)?,
                            query_id: row.get(1)?,
                            issue_key: row.get(2)?,
                            payload: serde_json::Value::Null,
                            cached_at: parse_time(&row.get::<_, String>(4)?)?,
                            expires_at: parse_millis(row.get(5)?)?,
                        },
                        raw_payload,
                    ))
                },
            )
            .optional()?;
        Ok(row.and_then(|(mut entry, raw)| {
            entry.payload = cached_payload("jira_changelog_cache", &entry.issue_key, &raw)?;
            Some(entry)
        }))
    }

    fn save_changelog_cache(&self, entry: &ChangelogCacheEntry) -> AppResult<()> {
        require("changelog cache entry", "issue_key", &entry.issue_key)?;
        let conn = self.lock()?;
        ensure_query(&conn, &entry.profile_id, &entry.query_id)?;
        conn.execute(
            "INSERT INTO jira_changelog_cache (profile_id, query_id, issue_key, payload_json, cached_at, expires_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(profile_id, query_id, issue_key) DO UPDATE SET
               payload_json = excluded.payload_json,
               cached_at = excluded.cached_at,
               expires_at_ms = excluded.expires_at_ms",
            params![
                entry.profile_id,
                entry.query_id,
                entry.issue_key,
                serde_json::to_string(&entry.payload)?,
                entry.cached_at.to_rfc3339(),
                entry.expires_at.timestamp_millis(),
            ],
        )?;
        Ok(())
    }

    fn cleanup_expired_cache(&self) -> AppResult<usize> {
        let now_ms = self.now().timestamp_millis();
        let conn = self.lock()?;
        let responses = conn.execute("DELETE FROM jira_cache WHERE expires_at_ms <= ?1", [now_ms])?;
        let changelogs = conn.execute("DELETE FROM jira_changelog_cache WHERE expires_at_ms <= ?1", [now_ms])?;
        Ok(responses + changelogs)
    }

    fn clear_query_cache(&self, profile_id: &str, query_id: &str) -> AppResult<usize> {
        let mut conn = self.lock()?;
        let sp = conn.savepoint()?;
        let responses = sp.execute(
            "DELETE FROM jira_cache WHERE profile_id = ?1 AND query_id = ?2",
            params![profile_id, query_id],
        )?;
        let changelogs = sp.execute(
            "DELETE FROM jira_changelog_cache WHERE profile_id = ?1 AND query_id = ?2",
            params![profile_id, query_id],
        )?;
        sp.commit()?;
        Ok(responses + changelogs)
    }

    // ─── Project data ───────────────────────────────────────────────────────

    fn get_project_data(&self, profile_id: &str, query_id: &str) -> AppResult<Option<ProjectData>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT profile_id, query_id, statistics_json, scope_json, updated_at
             FROM project_data WHERE profile_id = ?1 AND query_id = ?2",
            params![profile_id, query_id],
            |row| {
                Ok(ProjectData {
                    profile_id: row.get(0)?,
                    query_id: row.get(1)?,
                    statistics: parse_json(&row.get::<_, String>(2)?),
                    scope: parse_json(&row.get::<_, String>(3)?),
                    updated_at: parse_time(&row.get::<_, String>(4)?)?,
                })
            },
        )
        .optional()
        .map_err(AppError::from)
    }

    fn save_project_data(&self, data: &ProjectData) -> AppResult<()> {
        let conn = self.lock()?;
        ensure_query(&conn, &data.profile_id, &data.query_id)?;
        conn.execute(
            "INSERT INTO project_data (profile_id, query_id, statistics_json, scope_json, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(profile_id, query_id) DO UPDATE SET
               statistics_json = excluded.statistics_json,
               scope_json = excluded.scope_json,
               updated_at = excluded.updated_at",
            params![
                data.profile_id,
                data.query_id,
                serde_json::to_string(&data.statistics)?,
                serde_json::to_string(&data.scope)?,
                data.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    // ─── Metrics snapshots ──────────────────────────────────────────────────

    fn get_metrics_snapshot(
        &self,
        profile_id: &str,
        query_id: &str,
        snapshot_date: &str,
        metric_type: MetricType,
    ) -> AppResult<Option<MetricsSnapshot>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT profile_id, query_id, snapshot_date, metric_type, metrics_json, forecast_json, computed_at
             FROM metrics_snapshots
             WHERE profile_id = ?1 AND query_id = ?2 AND snapshot_date = ?3 AND metric_type = ?4",
            params![profile_id, query_id, snapshot_date, metric_type.as_str()],
            parse_snapshot_row,
        )
        .optional()
        .map_err(AppError::from)
    }

    fn get_metrics_snapshots(
        &self,
        profile_id: &str,
        query_id: &str,
        metric_type: Option<MetricType>,
        limit: Option<usize>,
    ) -> AppResult<Vec<MetricsSnapshot>> {
        let limit = limit.map(|value| value as i64).unwrap_or(-1);
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT profile_id, query_id, snapshot_date, metric_type, metrics_json, forecast_json, computed_at
             FROM metrics_snapshots
             WHERE profile_id = ?1 AND query_id = ?2 AND (?3 IS NULL OR metric_type = ?3)
             ORDER BY snapshot_date DESC, metric_type DESC
             LIMIT ?4",
        )?;
        let rows = stmt.query_map(
            params![profile_id, query_id, metric_type.map(MetricType::as_str), limit],
            parse_snapshot_row,
        )?;
        let mut result = rows.collect::<Result<Vec<_>, _>>()?;
        result.reverse();
        Ok(result)
    }

    fn save_metrics_snapshot(&self, snapshot: &MetricsSnapshot) -> AppResult<()> {
        parse_week_label(&snapshot.snapshot_date)?;
        let conn = self.lock()?;
        ensure_query(&conn, &snapshot.profile_id, &snapshot.query_id)?;
        let forecast = snapshot.forecast.as_ref().map(serde_json::to_string).transpose()?;
        conn.execute(
            "INSERT INTO metrics_snapshots
               (profile_id, query_id, snapshot_date, metric_type, metrics_json, forecast_json, computed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(profile_id, query_id, snapshot_date, metric_type) DO UPDATE SET
               metrics_json = excluded.metrics_json,
               forecast_json = excluded.forecast_json,
               computed_at = excluded.computed_at",
            params![
                snapshot.profile_id,
                snapshot.query_id,
                snapshot.snapshot_date,
                snapshot.metric_type.as_str(),
                serde_json::to_string(&snapshot.metrics)?,
                forecast,
                snapshot.computed_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn delete_metrics_snapshots(&self, profile_id: &str, query_id: &str) -> AppResult<usize> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "DELETE FROM metrics_snapshots WHERE profile_id = ?1 AND query_id = ?2",
            params![profile_id, query_id],
        )?;
        Ok(changed)
    }

    // ─── Task progress ──────────────────────────────────────────────────────

    fn get_task_progress(&self, task_name: &str) -> AppResult<Option<TaskProgress>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT task_id, task_name, phase, status, current, total, percent, message,
                    cancel_requested, started_at, updated_at
             FROM task_progress WHERE task_name = ?1",
            [task_name],
            |row| {
                Ok(TaskProgress {
                    task_id: row.get(0)?,
                    task_name: row.get(1)?,
                    phase: row.get(2)?,
                    status: TaskStatus::parse(&row.get::<_, String>(3)?),
                    current: row.get::<_, i64>(4)?.max(0) as u64,
                    total: row.get::<_, i64>(5)?.max(0) as u64,
                    percent: row.get::<_, i64>(6)?.clamp(0, 100) as u8,
                    message: row.get(7)?,
                    cancel_requested: row.get::<_, i32>(8)? != 0,
                    started_at: parse_time(&row.get::<_, String>(9)?)?,
                    updated_at: parse_time(&row.get::<_, String>(10)?)?,
                })
            },
        )
        .optional()
        .map_err(AppError::from)
    }

    fn save_task_progress(&self, progress: &TaskProgress) -> AppResult<()> {
        require("task progress", "task_name", &progress.task_name)?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO task_progress
               (task_name, task_id, phase, status, current, total, percent, message,
                cancel_requested, started_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                progress.task_name,
                progress.task_id,
                progress.phase,
                progress.status.as_str(),
                progress.current as i64,
                progress.total as i64,
                i64::from(progress.percent.min(100)),
                progress.message,
                progress.cancel_requested as i32,
                progress.started_at.to_rfc3339(),
                progress.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn clear_task_progress(&self, task_name: &str) -> AppResult<()> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM task_progress WHERE task_name = ?1", [task_name])?;
        Ok(())
    }

    // ─── App state ──────────────────────────────────────────────────────────

    fn get_app_state(&self, key: &str) -> AppResult<Option<String>> {
        let conn = self.lock()?;
        conn.query_row("SELECT value FROM app_state WHERE key = ?1", [key], |row| row.get(0))
            .optional()
            .map_err(AppError::from)
    }

    fn set_app_state(&self, key: &str, value: &str) -> AppResult<()> {
        require("app state", "key", key)?;
        let now = self.now().to_rfc3339();
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO app_state (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value, now],
        )?;
        Ok(())
    }

    fn delete_app_state(&self, key: &str) -> AppResult<()> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM app_state WHERE key = ?1", [key])?;
        Ok(())
    }

    // ─── Transactions ───────────────────────────────────────────────────────

    fn supports_transactions(&self) -> bool {
        true
    }

    fn begin_transaction(&self) -> AppResult<()> {
        let mut owner = self.wait_for_transaction()?;
        let conn = self.lock_conn()?;
        if owner.is_some() || !conn.is_autocommit() {
            return Err(AppError::Conflict("a transaction is already active".to_string()));
        }
        conn.execute_batch("BEGIN IMMEDIATE")?;
        *owner = Some(thread::current().id());
        Ok(())
    }

    fn commit_transaction(&self) -> AppResult<()> {
        self.finish_transaction("COMMIT")
    }

    fn rollback_transaction(&self) -> AppResult<()> {
        self.finish_transaction("ROLLBACK")
    }
}

fn ensure_query(conn: &Connection, profile_id: &str, query_id: &str) -> AppResult<()> {
    if row_exists(
        conn,
        "SELECT COUNT(1) FROM queries WHERE profile_id = ?1 AND id = ?2",
        &[&profile_id, &query_id],
    )? {
        Ok(())
    } else {
        Err(AppError::NotFound(format!("Query not found: {}/{}", profile_id, query_id)))
    }
}

fn row_exists(conn: &Connection, sql: &str, values: &[&dyn rusqlite::ToSql]) -> AppResult<bool> {
    let count: i64 = conn.query_row(sql, values, |row| row.get(0))?;
    Ok(count > 0)
}

fn parse_profile_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Profile> {
    Ok(Profile {
        id: row.get(0)?,
        name: row.get(1)?,
        jira_config: parse_json(&row.get::<_, String>(2)?),
        field_mappings: serde_json::from_str::<BTreeMap<String, String>>(&row.get::<_, String>(3)?)
            .unwrap_or_default(),
        created_at: parse_time(&row.get::<_, String>(4)?)?,
        updated_at: parse_time(&row.get::<_, String>(5)?)?,
    })
}

fn parse_query_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Query> {
    Ok(Query {
        id: row.get(0)?,
        profile_id: row.get(1)?,
        name: row.get(2)?,
        jql: row.get(3)?,
        created_at: parse_time(&row.get::<_, String>(4)?)?,
        updated_at: parse_time(&row.get::<_, String>(5)?)?,
    })
}

fn parse_snapshot_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MetricsSnapshot> {
    let raw_type: String = row.get(3)?;
    let metric_type = MetricType::parse(&raw_type).ok_or_else(|| {
        invalid_data(format!("Unknown metric type '{}'", raw_type))
    })?;
    Ok(MetricsSnapshot {
        profile_id: row.get(0)?,
        query_id: row.get(1)?,
        snapshot_date: row.get(2)?,
        metric_type,
        metrics: parse_json(&row.get::<_, String>(4)?),
        forecast: row
            .get::<_, Option<String>>(5)?
            .map(|raw| parse_json(&raw)),
        computed_at: parse_time(&row.get::<_, String>(6)?)?,
    })
}

fn parse_json(raw: &str) -> serde_json::Value {
    serde_json::from_str::<serde_json::Value>(raw).unwrap_or(serde_json::json!({}))
}

/// Cached payloads that no longer parse are a miss, not an empty hit.
fn cached_payload(table: &str, key: &str, raw: &str) -> Option<serde_json::Value> {
    match serde_json::from_str(raw) {
        Ok(payload) => Some(payload),
        Err(error) => {
            tracing::warn!(table, key, error = %error, "ignoring unreadable cache payload");
            None
        }
    }
}

fn parse_time(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|error| invalid_data(error.to_string()))
}

fn parse_millis(raw: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(raw)
        .ok_or_else(|| invalid_data(format!("Timestamp out of range: {}", raw)))
}

fn invalid_data(message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        0,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

#[cfg(test)]
mod tests {
    use super::Database;
    use crate::errors::AppError;
    use crate::models::{
        JiraCacheEntry, MetricType, MetricsSnapshot, SaveProfilePayload, SaveQueryPayload, TaskProgress, TaskStatus,
    };
    use crate::repository::EntityStore;
    use chrono::Utc;
    use std::sync::Arc;

    fn seeded(dir: &tempfile::TempDir) -> Database {
        let db = Database::new(&dir.path().join("test.db")).expect("db");
        db.save_profile(SaveProfilePayload {
            id: Some("p1".to_string()),
            name: "Platform".to_string(),
            jira_config: serde_json::json!({ "baseUrl": "https://jira.example.com" }),
            field_mappings: [("story_points".to_string(), "customfield_10002".to_string())].into(),
        })
        .expect("save profile");
        db.save_query(SaveQueryPayload {
            id: Some("q1".to_string()),
            profile_id: "p1".to_string(),
            name: "Sprint scope".to_string(),
            jql: "project = PLAT".to_string(),
        })
        .expect("save query");
        db
    }

    #[test]
    fn resaving_profile_keeps_created_at() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = seeded(&dir);
        let first = db.get_profile("p1").expect("get").expect("exists");

        let updated = db
            .save_profile(SaveProfilePayload {
                id: Some("p1".to_string()),
                name: "Platform Team".to_string(),
                jira_config: serde_json::json!({}),
                field_mappings: Default::default(),
            })
            .expect("resave");
        assert_eq!(updated.created_at, first.created_at);
        assert_eq!(db.list_profiles().expect("list").len(), 1);
        assert_eq!(db.get_profile("p1").expect("get").expect("exists").name, "Platform Team");
    }

    #[test]
    fn query_under_missing_profile_is_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = seeded(&dir);
        let err = db
            .save_query(SaveQueryPayload {
                id: None,
                profile_id: "ghost".to_string(),
                name: "x".to_string(),
                jql: "project = X".to_string(),
            })
            .expect_err("missing parent");
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[test]
    fn snapshot_with_bad_week_label_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = seeded(&dir);
        let err = db
            .save_metrics_snapshot(&MetricsSnapshot {
                profile_id: "p1".to_string(),
                query_id: "q1".to_string(),
                snapshot_date: "2026-10-19".to_string(),
                metric_type: MetricType::Flow,
                metrics: serde_json::json!({}),
                forecast: None,
                computed_at: Utc::now(),
            })
            .expect_err("bad label");
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[test]
    fn nested_begin_is_a_conflict_and_rollback_restores_state() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = seeded(&dir);

        db.begin_transaction().expect("begin");
        assert!(matches!(db.begin_transaction(), Err(AppError::Conflict(_))));
        db.delete_profile("p1").expect("cascade inside tx");
        assert!(db.get_query("p1", "q1").expect("get").is_none());
        db.rollback_transaction().expect("rollback");

        assert!(db.get_query("p1", "q1").expect("get").is_some());
        assert!(matches!(db.commit_transaction(), Err(AppError::Internal(_))));
    }

    #[test]
    fn other_threads_wait_for_a_transaction_instead_of_joining_it() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Arc::new(seeded(&dir));
        let payload = |id: &str| SaveProfilePayload {
            id: Some(id.to_string()),
            name: id.to_string(),
            jira_config: serde_json::json!({}),
            field_mappings: Default::default(),
        };

        db.begin_transaction().expect("begin");
        let writer = {
            let db = db.clone();
            let other = payload("other");
            std::thread::spawn(move || db.save_profile(other))
        };
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert!(!writer.is_finished());
        assert!(db.get_profile("other").expect("get").is_none());

        db.save_profile(payload("inside")).expect("save inside tx");
        db.rollback_transaction().expect("rollback");

        writer.join().expect("join").expect("save after rollback");
        assert!(db.get_profile("other").expect("get").is_some());
        assert!(db.get_profile("inside").expect("get").is_none());
    }

    #[test]
    fn unreadable_cache_payload_is_a_miss() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = seeded(&dir);
        let now = Utc::now();
        db.save_jira_cache(&JiraCacheEntry {
            profile_id: "p1".to_string(),
            query_id: "q1".to_string(),
            cache_key: "search".to_string(),
            payload: serde_json::json!({ "total": 3 }),
            cached_at: now,
            expires_at: now + chrono::Duration::hours(1),
        })
        .expect("save");
        assert!(db.get_jira_cache("p1", "q1", "search").expect("get").is_some());

        db.lock()
            .expect("lock")
            .execute("UPDATE jira_cache SET payload_json = '{\"total\": 3' WHERE cache_key = 'search'", [])
            .expect("corrupt row");
        assert!(db.get_jira_cache("p1", "q1", "search").expect("get").is_none());
    }

    #[test]
    fn task_progress_is_replaced_whole() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = seeded(&dir);
        let now = Utc::now();
        let mut record = TaskProgress {
            task_id: "t-1".to_string(),
            task_name: "metrics".to_string(),
            phase: "calculating".to_string(),
            status: TaskStatus::Running,
            current: 1,
            total: 4,
            percent: 25,
            message: "week 1".to_string(),
            cancel_requested: false,
            started_at: now,
            updated_at: now,
        };
        db.save_task_progress(&record).expect("save");
        record.current = 2;
        record.percent = 50;
        record.cancel_requested = true;
        db.save_task_progress(&record).expect("replace");

        let loaded = db.get_task_progress("metrics").expect("get").expect("exists");
        assert_eq!(loaded.percent, 50);
        assert!(loaded.cancel_requested);

        db.clear_task_progress("metrics").expect("clear");
        assert!(db.get_task_progress("metrics").expect("get").is_none());
    }
}
