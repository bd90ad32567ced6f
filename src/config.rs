use crate::services::metrics::{MetricCatalog, MetricDefinition};
use crate::services::tasks::{QueueConfig, TaskPolicy};
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_DATABASE_URL: &str = "sqlite://cv-analysis.db";
const MAX_TASK_TTL_HOURS: u64 = 24 * 365;

type Lookup<'a> = dyn Fn(&str) -> Option<String> + 'a;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone)]
pub struct CvConfig {
    pub database_url: String,
    pub api_version: String,
    pub task_max_retries: u32,
    pub task_lease_timeout_seconds: u64,
    pub primary_task_ttl_hours: u64,
    pub experimental_task_ttl_hours: u64,
    pub primary_task_priority: i32,
    pub experimental_task_priority: i32,
    pub serialize_group_windows: bool,
    pub poll_interval_ms: u64,
    pub max_poll_backoff_ms: u64,
    pub max_concurrent_tasks: usize,
    pub bucket_width_minutes: i64,
    pub catalog_path: Option<PathBuf>,
    pub log_format: LogFormat,
}

impl CvConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let lookup: &Lookup = &lookup;
        let poll_interval_ms = env_u64(lookup, "CV_POLL_INTERVAL_MS", 500).clamp(50, 10_000);
        let log_format = match env_string(lookup, "CV_LOG_FORMAT", "text")
            .to_lowercase()
            .as_str()
        {
            "json" => LogFormat::Json,
            _ => LogFormat::Text,
        };

        Self {
            database_url: env_string(lookup, "CV_DATABASE_URL", DEFAULT_DATABASE_URL),
            api_version: env_string(lookup, "CV_API_VERSION", "v1"),
            task_max_retries: env_u32(lookup, "CV_TASK_MAX_RETRIES", 3).clamp(1, 20),
            task_lease_timeout_seconds: env_u64(lookup, "CV_TASK_LEASE_TIMEOUT_SECONDS", 1200)
                .clamp(1, 86_400),
            primary_task_ttl_hours: env_u64(lookup, "CV_PRIMARY_TASK_TTL_HOURS", 168)
                .clamp(1, MAX_TASK_TTL_HOURS),
            experimental_task_ttl_hours: env_u64(lookup, "CV_EXPERIMENTAL_TASK_TTL_HOURS", 48)
                .clamp(1, MAX_TASK_TTL_HOURS),
            primary_task_priority: env_i32(lookup, "CV_PRIMARY_TASK_PRIORITY", 1),
            experimental_task_priority: env_i32(lookup, "CV_EXPERIMENTAL_TASK_PRIORITY", 5),
            serialize_group_windows: env_bool(lookup, "CV_SERIALIZE_GROUP_WINDOWS", true),
            poll_interval_ms,
            max_poll_backoff_ms: env_u64(lookup, "CV_MAX_POLL_BACKOFF_MS", 30_000)
                .max(poll_interval_ms),
            max_concurrent_tasks: env_usize(lookup, "CV_MAX_CONCURRENT_TASKS", 2).clamp(1, 16),
            bucket_width_minutes: env_i64(lookup, "CV_BUCKET_WIDTH_MINUTES", 1).clamp(1, 1440),
            catalog_path: env_optional_string(lookup, "CV_CATALOG_PATH").map(PathBuf::from),
            log_format,
        }
    }

    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            max_retries: self.task_max_retries,
            lease_timeout: chrono::Duration::seconds(saturating_i64(self.task_lease_timeout_seconds)),
            primary: TaskPolicy {
                ttl: chrono::Duration::hours(saturating_i64(self.primary_task_ttl_hours)),
                default_priority: self.primary_task_priority,
            },
            experimental: TaskPolicy {
                ttl: chrono::Duration::hours(saturating_i64(self.experimental_task_ttl_hours)),
                default_priority: self.experimental_task_priority,
            },
            serialize_group_windows: self.serialize_group_windows,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn max_poll_backoff(&self) -> Duration {
        Duration::from_millis(self.max_poll_backoff_ms)
    }

    /// Built-in catalog, with `CV_CATALOG_PATH` overrides applied when set.
    pub fn load_catalog(&self, explicit: Option<&Path>) -> Result<MetricCatalog> {
        match explicit.or(self.catalog_path.as_deref()) {
            Some(path) => load_catalog_overrides(path),
            None => Ok(MetricCatalog::builtin()),
        }
    }
}

pub fn load_catalog_overrides(path: &Path) -> Result<MetricCatalog> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read metric catalog at {}", path.display()))?;
    let overrides: Vec<MetricDefinition> = serde_json::from_str(&contents)
        .with_context(|| format!("failed to parse metric catalog at {}", path.display()))?;
    let count = overrides.len();
    let catalog = MetricCatalog::builtin()
        .with_overrides(overrides)
        .with_context(|| format!("invalid metric definition in {}", path.display()))?;
    tracing::info!(path = %path.display(), overrides = count, "loaded metric catalog overrides");
    Ok(catalog)
}

fn saturating_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn env_optional_string(lookup: &Lookup, key: &str) -> Option<String> {
    lookup(key)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_string(lookup: &Lookup, key: &str, default: &str) -> String {
    env_optional_string(lookup, key).unwrap_or_else(|| default.to_string())
}

fn env_bool(lookup: &Lookup, key: &str, default: bool) -> bool {
    match env_optional_string(lookup, key).map(|value| value.to_lowercase()) {
        Some(value) if value == "1" || value == "true" || value == "yes" => true,
        Some(value) if value == "0" || value == "false" || value == "no" => false,
        _ => default,
    }
}

fn env_u32(lookup: &Lookup, key: &str, default: u32) -> u32 {
    env_optional_string(lookup, key)
        .and_then(|value| value.parse::<u32>().ok())
        .unwrap_or(default)
}

fn env_u64(lookup: &Lookup, key: &str, default: u64) -> u64 {
    env_optional_string(lookup, key)
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_usize(lookup: &Lookup, key: &str, default: usize) -> usize {
    env_optional_string(lookup, key)
        .and_then(|value| value.parse::<usize>().ok())
        .unwrap_or(default)
}

fn env_i32(lookup: &Lookup, key: &str, default: i32) -> i32 {
    env_optional_string(lookup, key)
        .and_then(|value| value.parse::<i32>().ok())
        .unwrap_or(default)
}

fn env_i64(lookup: &Lookup, key: &str, default: i64) -> i64 {
    env_optional_string(lookup, key)
        .and_then(|value| value.parse::<i64>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(vars: &[(&str, &str)]) -> CvConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        CvConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_match_queue_defaults() {
        let config = config_from(&[]);
        assert_eq!(config.database_url, DEFAULT_DATABASE_URL);
        assert_eq!(config.api_version, "v1");
        assert_eq!(config.log_format, LogFormat::Text);
        assert!(config.catalog_path.is_none());
        assert_eq!(config.queue_config(), QueueConfig::default());
        assert_eq!(config.poll_interval(), Duration::from_millis(500));
    }

    #[test]
    fn values_are_trimmed_clamped_and_parsed() {
        let config = config_from(&[
            ("CV_TASK_MAX_RETRIES", " 99 "),
            ("CV_POLL_INTERVAL_MS", "1"),
            ("CV_MAX_POLL_BACKOFF_MS", "10"),
            ("CV_MAX_CONCURRENT_TASKS", "0"),
            ("CV_SERIALIZE_GROUP_WINDOWS", "no"),
            ("CV_EXPERIMENTAL_TASK_PRIORITY", "-2"),
            ("CV_LOG_FORMAT", "JSON"),
            ("CV_CATALOG_PATH", "   "),
            ("CV_BUCKET_WIDTH_MINUTES", "not-a-number"),
        ]);
        assert_eq!(config.task_max_retries, 20);
        assert_eq!(config.poll_interval_ms, 50);
        assert_eq!(config.max_poll_backoff_ms, 50);
        assert_eq!(config.max_concurrent_tasks, 1);
        assert!(!config.serialize_group_windows);
        assert_eq!(config.queue_config().experimental.default_priority, -2);
        assert_eq!(config.log_format, LogFormat::Json);
        assert!(config.catalog_path.is_none());
        assert_eq!(config.bucket_width_minutes, 1);
    }

    #[test]
    fn oversized_ttls_and_widths_are_clamped() {
        let config = config_from(&[
            ("CV_PRIMARY_TASK_TTL_HOURS", "3000000000"),
            ("CV_EXPERIMENTAL_TASK_TTL_HOURS", "18446744073709551615"),
            ("CV_TASK_LEASE_TIMEOUT_SECONDS", "18446744073709551615"),
            ("CV_MAX_CONCURRENT_TASKS", "1000000"),
            ("CV_BUCKET_WIDTH_MINUTES", "-5"),
        ]);
        assert_eq!(config.primary_task_ttl_hours, MAX_TASK_TTL_HOURS);
        assert_eq!(config.experimental_task_ttl_hours, MAX_TASK_TTL_HOURS);
        assert_eq!(config.task_lease_timeout_seconds, 86_400);
        assert_eq!(config.max_concurrent_tasks, 16);
        assert_eq!(config.bucket_width_minutes, 1);

        let queue = config.queue_config();
        assert_eq!(queue.primary.ttl, chrono::Duration::hours(24 * 365));
        assert_eq!(queue.experimental.ttl, chrono::Duration::hours(24 * 365));
    }

    #[test]
    fn catalog_overrides_load_from_json() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("catalog.json");
        std::fs::write(
            &path,
            r#"[{
                "metric_name": "checkoutLatency",
                "metric_type": "RESP_TIME",
                "thresholds": [{
                    "strategy": "RATIO",
                    "direction": "ALERT_WHEN_HIGHER",
                    "medium_threshold": 1.1,
                    "high_threshold": 1.3
                }]
            }]"#,
        )
        .unwrap();
        let config = config_from(&[("CV_CATALOG_PATH", path.to_str().unwrap())]);
        let catalog = config.load_catalog(None).unwrap();
        assert!(catalog.definition("checkoutLatency").is_ok());
        assert!(catalog.definition("requestsPerMinute").is_ok());

        std::fs::write(&path, r#"[{"metric_name": " ", "metric_type": "COUNT", "thresholds": []}]"#)
            .unwrap();
        assert!(config.load_catalog(None).is_err());
    }
}
