use crate::errors::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const DATA_DIR_ENV: &str = "JIRA_METRICS_DATA_DIR";
pub const BACKEND_ENV: &str = "JIRA_METRICS_BACKEND";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    #[default]
    Sqlite,
    Json,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sqlite => "sqlite",
            Self::Json => "json",
        }
    }

    pub fn parse(raw: &str) -> AppResult<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "sqlite" => Ok(Self::Sqlite),
            "json" => Ok(Self::Json),
            other => Err(AppError::Validation(format!("Unknown storage backend '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    pub backend: BackendKind,
    pub data_dir: PathBuf,
    pub cache_ttl_hours: i64,
    pub changelog_ttl_hours: i64,
    /// Progress is written every N weeks and always on the last one.
    pub progress_every_weeks: usize,
    /// 0 yields to the scheduler; anything above sleeps that long between weeks.
    pub yield_millis: u64,
    pub default_weeks: usize,
    pub log_filter: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Sqlite,
            data_dir: PathBuf::from(".jira-metrics"),
            cache_ttl_hours: 24,
            changelog_ttl_hours: 24 * 7,
            progress_every_weeks: 5,
            yield_millis: 0,
            default_weeks: 12,
            log_filter: "info".to_string(),
        }
    }
}

impl EngineConfig {
    pub fn load(path: &Path) -> AppResult<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Io(format!("Failed to read config {}: {}", path.display(), err)))?;
        Self::from_yaml_str(&raw)
    }

    pub fn from_yaml_str(raw: &str) -> AppResult<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self = serde_yaml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env_overrides(mut self) -> AppResult<Self> {
        if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
            if !dir.trim().is_empty() {
                self.data_dir = PathBuf::from(dir);
            }
        }
        if let Ok(backend) = std::env::var(BACKEND_ENV) {
            self.backend = BackendKind::parse(&backend)?;
        }
        Ok(self)
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.cache_ttl_hours <= 0 || self.changelog_ttl_hours <= 0 {
            return Err(AppError::Validation("cache TTLs must be positive".to_string()));
        }
        if self.progress_every_weeks == 0 {
            return Err(AppError::Validation("progressEveryWeeks must be at least 1".to_string()));
        }
        Ok(())
    }

    pub fn cache_ttl(&self) -> chrono::Duration {
        chrono::Duration::hours(self.cache_ttl_hours)
    }

    pub fn changelog_ttl(&self) -> chrono::Duration {
        chrono::Duration::hours(self.changelog_ttl_hours)
    }
}
