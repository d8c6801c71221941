use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// AppState key holding the id of the profile the dashboard currently shows.
pub const ACTIVE_PROFILE_KEY: &str = "active_profile_id";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub id: String,
    pub name: String,
    /// JIRA connection settings (base url, auth mode, ...). Opaque to the store.
    pub jira_config: serde_json::Value,
    pub field_mappings: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveProfilePayload {
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub jira_config: serde_json::Value,
    #[serde(default)]
    pub field_mappings: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Query {
    pub id: String,
    pub profile_id: String,
    pub name: String,
    pub jql: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveQueryPayload {
    pub id: Option<String>,
    pub profile_id: String,
    pub name: String,
    pub jql: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JiraCacheEntry {
    pub profile_id: String,
    pub query_id: String,
    pub cache_key: String,
    pub payload: serde_json::Value,
    pub cached_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangelogCacheEntry {
    pub profile_id: String,
    pub query_id: String,
    pub issue_key: String,
    pub payload: serde_json::Value,
    pub cached_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectData {
    pub profile_id: String,
    pub query_id: String,
    pub statistics: serde_json::Value,
    pub scope: serde_json::Value,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MetricType {
    Dora,
    Flow,
}

impl MetricType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Dora => "dora",
            Self::Flow => "flow",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "dora" => Some(Self::Dora),
            "flow" => Some(Self::Flow),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub profile_id: String,
    pub query_id: String,
    /// ISO week label, `YYYY-Www`.
    pub snapshot_date: String,
    pub metric_type: MetricType,
    pub metrics: serde_json::Value,
    pub forecast: Option<serde_json::Value>,
    pub computed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "running" => Self::Running,
            "completed" => Self::Completed,
            _ => Self::Failed,
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// Progress record for the single long-running task. Always replaced whole.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskProgress {
    pub task_id: String,
    pub task_name: String,
    pub phase: String,
    pub status: TaskStatus,
    pub current: u64,
    pub total: u64,
    pub percent: u8,
    pub message: String,
    pub cancel_requested: bool,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskProgress {
    pub fn cancelled(&self) -> bool {
        self.cancel_requested
    }
}
