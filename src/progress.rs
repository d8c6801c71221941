//! Single-slot progress state for the one long-running task.
//!
//! The slot is replaced whole on every change, so a concurrent poller sees
//! either the previous record or the next one, never a mix. Each record is
//! mirrored to the store so pollers in another process can read it too.

use crate::clock::Clock;
use crate::errors::{AppError, AppResult};
use crate::models::{TaskProgress, TaskStatus};
use crate::repository::EntityStore;
use std::sync::{Arc, RwLock};
use uuid::Uuid;

pub const CANCELLED_BY_USER: &str = "Operation cancelled by user";

/// `100 * current / total`, clamped to `[0, 100]`; 0 when `total` is 0.
pub fn percent_of(current: u64, total: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    (current.saturating_mul(100) / total).min(100) as u8
}

pub struct ProgressTracker {
    slot: RwLock<Option<TaskProgress>>,
    store: Option<Arc<dyn EntityStore>>,
    clock: Arc<dyn Clock>,
}

impl ProgressTracker {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            slot: RwLock::new(None),
            store: None,
            clock,
        }
    }

    pub fn with_store(store: Arc<dyn EntityStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            slot: RwLock::new(None),
            store: Some(store),
            clock,
        }
    }

    /// Claims the slot. A running task keeps it; a finished one is replaced.
    pub fn start_task(&self, task_name: &str) -> AppResult<TaskProgress> {
        if task_name.trim().is_empty() {
            return Err(AppError::missing_field("task", "task_name"));
        }
        let now = self.clock.now();
        let mut slot = self.write_slot()?;
        if let Some(active) = slot.as_ref() {
            if active.status == TaskStatus::Running {
                return Err(AppError::Conflict(format!(
                    "Task '{}' is already running ({}%)",
                    active.task_name, active.percent
                )));
            }
        }
        let record = TaskProgress {
            task_id: Uuid::new_v4().to_string(),
            task_name: task_name.to_string(),
            phase: "starting".to_string(),
            status: TaskStatus::Running,
            current: 0,
            total: 0,
            percent: 0,
            message: "Starting".to_string(),
            cancel_requested: false,
            started_at: now,
            updated_at: now,
        };
        self.mirror(&record);
        *slot = Some(record.clone());
        tracing::info!(task_name = %task_name, task_id = %record.task_id, "task started");
        Ok(record)
    }

    pub fn update_progress(&self, task_name: &str, current: u64, total: u64, message: &str) -> AppResult<TaskProgress> {
        self.replace(task_name, |record| {
            record.current = current;
            record.total = total;
            record.percent = percent_of(current, total);
            record.message = message.to_string();
        })
    }

    pub fn set_phase(&self, task_name: &str, phase: &str) -> AppResult<TaskProgress> {
        self.replace(task_name, |record| record.phase = phase.to_string())
    }

    /// Flags the running task for cancellation. Returns false when nothing
    /// with that name is running.
    pub fn request_cancel(&self, task_name: &str) -> AppResult<bool> {
        match self.replace_running(task_name, |record| record.cancel_requested = true) {
            Ok(_) => {
                tracing::info!(task_name = %task_name, "cancellation requested");
                Ok(true)
            }
            Err(AppError::NotFound(_)) => Ok(false),
            Err(error) => Err(error),
        }
    }

    /// True once cancellation was requested here or through the stored record.
    pub fn is_task_cancelled(&self, task_name: &str) -> bool {
        let Some(local) = self.current_record(task_name) else {
            return false;
        };
        if local.cancel_requested {
            return true;
        }
        if local.status == TaskStatus::Running && self.cancelled_in_store(&local) {
            let _ = self.replace_running(task_name, |record| record.cancel_requested = true);
            return true;
        }
        false
    }

    pub fn fail_task(&self, task_name: &str, reason: &str) -> AppResult<TaskProgress> {
        let record = self.replace(task_name, |record| {
            record.status = TaskStatus::Failed;
            record.message = reason.to_string();
        })?;
        tracing::warn!(task_name = %task_name, reason = %reason, "task failed");
        Ok(record)
    }

    pub fn complete_task(&self, task_name: &str, message: &str) -> AppResult<TaskProgress> {
        let record = self.replace(task_name, |record| {
            record.status = TaskStatus::Completed;
            record.percent = 100;
            record.current = record.total;
            record.message = message.to_string();
        })?;
        tracing::info!(task_name = %task_name, "task completed");
        Ok(record)
    }

    /// Fails the run identified by `task_id` if it is still running. Used when
    /// a run ends without reaching its own terminal transition.
    pub fn abandon(&self, task_name: &str, task_id: &str, reason: &str) -> AppResult<bool> {
        let still_running = self
            .current_record(task_name)
            .is_some_and(|record| record.task_id == task_id && record.status == TaskStatus::Running);
        if !still_running {
            return Ok(false);
        }
        self.replace_running(task_name, |record| {
            record.status = TaskStatus::Failed;
            record.message = reason.to_string();
        })?;
        tracing::warn!(task_name = %task_name, task_id = %task_id, reason = %reason, "task abandoned");
        Ok(true)
    }

    pub fn clear_task(&self, task_name: &str) -> AppResult<()> {
        {
            let mut slot = self.write_slot()?;
            if slot.as_ref().is_some_and(|record| record.task_name == task_name) {
                *slot = None;
            }
        }
        if let Some(store) = self.store.as_ref() {
            store.clear_task_progress(task_name)?;
        }
        Ok(())
    }

    /// What a poller sees: a full copy of the current record, if any.
    pub fn snapshot(&self) -> Option<TaskProgress> {
        self.slot.read().ok().and_then(|slot| slot.clone())
    }

    fn current_record(&self, task_name: &str) -> Option<TaskProgress> {
        self.snapshot().filter(|record| record.task_name == task_name)
    }

    fn replace(&self, task_name: &str, change: impl FnOnce(&mut TaskProgress)) -> AppResult<TaskProgress> {
        self.replace_where(task_name, false, change)
    }

    fn replace_running(&self, task_name: &str, change: impl FnOnce(&mut TaskProgress)) -> AppResult<TaskProgress> {
        self.replace_where(task_name, true, change)
    }

    fn replace_where(
        &self,
        task_name: &str,
        running_only: bool,
        change: impl FnOnce(&mut TaskProgress),
    ) -> AppResult<TaskProgress> {
        let mut slot = self.write_slot()?;
        let mut next = slot
            .as_ref()
            .filter(|record| record.task_name == task_name)
            .filter(|record| !running_only || record.status == TaskStatus::Running)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("No active task named '{}'", task_name)))?;
        change(&mut next);
        next.percent = next.percent.min(100);
        next.updated_at = self.clock.now();
        if next.status == TaskStatus::Running && !next.cancel_requested && self.cancelled_in_store(&next) {
            next.cancel_requested = true;
        }
        // Written while the slot is held so stored records land in slot order.
        self.mirror(&next);
        *slot = Some(next.clone());
        Ok(next)
    }

    /// Whether the stored copy of this exact run carries a cancel request
    /// written by someone else.
    fn cancelled_in_store(&self, record: &TaskProgress) -> bool {
        let Some(store) = self.store.as_ref() else {
            return false;
        };
        match store.get_task_progress(&record.task_name) {
            Ok(Some(stored)) => stored.task_id == record.task_id && stored.cancel_requested,
            Ok(None) => false,
            Err(error) => {
                tracing::warn!(task_name = %record.task_name, error = %error, "could not read stored progress");
                false
            }
        }
    }

    fn mirror(&self, record: &TaskProgress) {
        if let Some(store) = self.store.as_ref() {
            if let Err(error) = store.save_task_progress(record) {
                tracing::warn!(task_name = %record.task_name, error = %error, "failed to persist task progress");
            }
        }
    }

    fn write_slot(&self) -> AppResult<std::sync::RwLockWriteGuard<'_, Option<TaskProgress>>> {
        self.slot
            .write()
            .map_err(|_| AppError::Internal("progress slot lock poisoned".to_string()))
    }
}
