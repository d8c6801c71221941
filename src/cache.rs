//! TTL cache for JIRA search responses and issue changelogs.
//!
//! Keys are opaque lookup tokens to the store. [`cache_key`] derives one from
//! everything that decides whether a payload is still valid, so editing the
//! JQL or a field mapping orphans old rows instead of serving them.

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::errors::AppResult;
use crate::models::{ChangelogCacheEntry, JiraCacheEntry};
use crate::repository::EntityStore;
use chrono::{DateTime, Duration, Utc};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;

pub fn cache_key(jql: &str, field_mappings: &BTreeMap<String, String>, extra: &[(&str, &str)]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"jql\0");
    hasher.update(jql.trim().as_bytes());
    for (field, jira_field) in field_mappings {
        hasher.update(b"\0map\0");
        hasher.update(field.as_bytes());
        hasher.update(b"=");
        hasher.update(jira_field.as_bytes());
    }
    let mut extra = extra.to_vec();
    extra.sort();
    for (name, value) in extra {
        hasher.update(b"\0opt\0");
        hasher.update(name.as_bytes());
        hasher.update(b"=");
        hasher.update(value.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

#[derive(Clone)]
pub struct CacheService {
    store: Arc<dyn EntityStore>,
    clock: Arc<dyn Clock>,
    response_ttl: Duration,
    changelog_ttl: Duration,
}

impl CacheService {
    pub fn new(store: Arc<dyn EntityStore>, clock: Arc<dyn Clock>, config: &EngineConfig) -> Self {
        Self {
            store,
            clock,
            response_ttl: config.cache_ttl(),
            changelog_ttl: config.changelog_ttl(),
        }
    }

    pub fn get_response(&self, profile_id: &str, query_id: &str, key: &str) -> AppResult<Option<serde_json::Value>> {
        let entry = self.store.get_jira_cache(profile_id, query_id, key)?;
        tracing::debug!(profile_id, query_id, hit = entry.is_some(), "jira cache lookup");
        Ok(entry.map(|entry| entry.payload))
    }

    /// Stores a response with the configured TTL.
    pub fn put_response(&self, profile_id: &str, query_id: &str, key: &str, payload: serde_json::Value) -> AppResult<()> {
        let expires_at = self.clock.now() + self.response_ttl;
        self.put_response_until(profile_id, query_id, key, payload, expires_at)
    }

    pub fn put_response_until(
        &self,
        profile_id: &str,
        query_id: &str,
        key: &str,
        payload: serde_json::Value,
        expires_at: DateTime<Utc>,
    ) -> AppResult<()> {
        self.store.save_jira_cache(&JiraCacheEntry {
            profile_id: profile_id.to_string(),
            query_id: query_id.to_string(),
            cache_key: key.to_string(),
            payload,
            cached_at: self.clock.now(),
            expires_at,
        })
    }

    pub fn get_changelog(
        &self,
        profile_id: &str,
        query_id: &str,
        issue_key: &str,
    ) -> AppResult<Option<serde_json::Value>> {
        Ok(self
            .store
            .get_changelog_cache(profile_id, query_id, issue_key)?
            .map(|entry| entry.payload))
    }

    pub fn put_changelog(
        &self,
        profile_id: &str,
        query_id: &str,
        issue_key: &str,
        payload: serde_json::Value,
    ) -> AppResult<()> {
        let now = self.clock.now();
        self.store.save_changelog_cache(&ChangelogCacheEntry {
            profile_id: profile_id.to_string(),
            query_id: query_id.to_string(),
            issue_key: issue_key.to_string(),
            payload,
            cached_at: now,
            expires_at: now + self.changelog_ttl,
        })
    }

    pub fn cleanup_expired(&self) -> AppResult<usize> {
        let removed = self.store.cleanup_expired_cache()?;
        if removed > 0 {
            tracing::info!(removed, "swept expired cache rows");
        }
        Ok(removed)
    }

    /// Drops every cached payload for one query, expired or not.
    pub fn invalidate_query(&self, profile_id: &str, query_id: &str) -> AppResult<usize> {
        let removed = self.store.clear_query_cache(profile_id, query_id)?;
        tracing::info!(profile_id, query_id, removed, "invalidated query cache");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::{cache_key, CacheService};
    use crate::clock::ManualClock;
    use crate::config::EngineConfig;
    use crate::db::Database;
    use crate::models::{SaveProfilePayload, SaveQueryPayload};
    use crate::repository::EntityStore;
    use chrono::{Duration, TimeZone, Utc};
    use std::collections::BTreeMap;
    use std::sync::Arc;

    #[test]
    fn key_changes_with_every_input_and_ignores_option_order() {
        let mut mappings = BTreeMap::new();
        mappings.insert("story_points".to_string(), "customfield_10002".to_string());
        let base = cache_key("project = KAFKA", &mappings, &[("expand", "changelog"), ("max", "100")]);

        assert_eq!(base, cache_key("project = KAFKA", &mappings, &[("max", "100"), ("expand", "changelog")]));
        assert_ne!(base, cache_key("project = KAFKA AND sprint = 3", &mappings, &[("expand", "changelog"), ("max", "100")]));

        mappings.insert("story_points".to_string(), "customfield_10016".to_string());
        assert_ne!(base, cache_key("project = KAFKA", &mappings, &[("expand", "changelog"), ("max", "100")]));
    }

    #[test]
    fn default_ttl_expires_payloads_on_read() {
        let dir = tempfile::tempdir().expect("tempdir");
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 10, 19, 8, 0, 0).unwrap()));
        let store: Arc<dyn EntityStore> =
            Arc::new(Database::with_clock(&dir.path().join("c.db"), clock.clone()).expect("db"));
        store
            .save_profile(SaveProfilePayload {
                id: Some("kafka".to_string()),
                name: "Kafka".to_string(),
                jira_config: serde_json::json!({}),
                field_mappings: BTreeMap::new(),
            })
            .expect("profile");
        store
            .save_query(SaveQueryPayload {
                id: Some("12w".to_string()),
                profile_id: "kafka".to_string(),
                name: "Last 12 weeks".to_string(),
                jql: "project = KAFKA".to_string(),
            })
            .expect("query");

        let cache = CacheService::new(store, clock.clone(), &EngineConfig::default());
        cache
            .put_changelog("kafka", "12w", "KAFKA-1", serde_json::json!({ "histories": [] }))
            .expect("put");
        clock.advance(Duration::days(6));
        assert!(cache.get_changelog("kafka", "12w", "KAFKA-1").expect("get").is_some());
        clock.advance(Duration::days(2));
        assert!(cache.get_changelog("kafka", "12w", "KAFKA-1").expect("get").is_none());
        assert_eq!(cache.cleanup_expired().expect("sweep"), 1);
    }
}
