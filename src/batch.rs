use crate::errors::{AppError, AppResult};
use crate::repository::EntityStore;
use std::sync::{Arc, Mutex};

/// Groups many saves into one deferred backend flush.
///
/// Only the outermost scope calls `begin_batch` / `flush_batch`. Buffering is
/// not atomicity: writes applied before a failed flush stay applied.
pub struct BatchCoordinator {
    store: Arc<dyn EntityStore>,
    depth: Mutex<usize>,
}

impl BatchCoordinator {
    pub fn new(store: Arc<dyn EntityStore>) -> Self {
        Self {
            store,
            depth: Mutex::new(0),
        }
    }

    pub fn store(&self) -> &Arc<dyn EntityStore> {
        &self.store
    }

    pub fn enter(&self) -> AppResult<BatchScope<'_>> {
        let mut depth = self.lock_depth()?;
        if *depth == 0 {
            self.store.begin_batch()?;
        }
        *depth += 1;
        Ok(BatchScope {
            coordinator: self,
            finished: false,
        })
    }

    pub fn depth(&self) -> usize {
        self.depth.lock().map(|depth| *depth).unwrap_or(0)
    }

    fn lock_depth(&self) -> AppResult<std::sync::MutexGuard<'_, usize>> {
        self.depth
            .lock()
            .map_err(|_| AppError::Internal("batch depth mutex poisoned".to_string()))
    }

    fn leave(&self) -> AppResult<()> {
        let mut depth = self.lock_depth()?;
        *depth = depth.saturating_sub(1);
        if *depth == 0 {
            self.store.flush_batch()?;
        }
        Ok(())
    }
}

/// Leaving the scope flushes exactly once, either through [`BatchScope::finish`]
/// or on drop (including unwinding out of an error path).
pub struct BatchScope<'a> {
    coordinator: &'a BatchCoordinator,
    finished: bool,
}

impl BatchScope<'_> {
    /// Leaves the scope and reports the flush result.
    pub fn finish(mut self) -> AppResult<()> {
        self.finished = true;
        self.coordinator.leave()
    }
}

impl Drop for BatchScope<'_> {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(error) = self.coordinator.leave() {
                tracing::error!(error = %error, "batch flush on drop failed");
            }
        }
    }
}
