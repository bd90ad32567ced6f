use crate::services::metrics::MetricSample;
use crate::services::tasks::clock::ManualClock;
use crate::services::tasks::queue::{AnalysisTaskQueue, QueueConfig};
use crate::services::tasks::sqlite::SqliteTaskStore;
use crate::services::tasks::store::MemoryTaskStore;
use crate::services::tasks::types::{
    AnalysisTask, AnalysisTaskRequest, AnalysisType, TaskKind, TaskStatus,
};
use chrono::{DateTime, Duration, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use std::sync::Arc;
use tempfile::TempDir;
use uuid::Uuid;

pub fn fixed_now() -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(1_700_000_000_000).expect("timestamp")
}

pub fn sample(host: &str, minute: i64, value: Option<f64>) -> MetricSample {
    metric_sample("/checkout", "requestsPerMinute", host, minute, value)
}

pub fn metric_sample(
    transaction: &str,
    metric_name: &str,
    host: &str,
    minute: i64,
    value: Option<f64>,
) -> MetricSample {
    MetricSample {
        transaction: transaction.to_string(),
        metric_name: metric_name.to_string(),
        host: host.to_string(),
        timestamp_minute: minute,
        value,
    }
}

pub fn task_at(group_key: &str, analysis_minute: i64) -> AnalysisTask {
    let created_at = fixed_now();
    AnalysisTask {
        id: Uuid::new_v4(),
        kind: TaskKind::Primary,
        group_key: group_key.to_string(),
        analysis_minute,
        cluster_level: 0,
        group_name: "default".to_string(),
        analysis_type: AnalysisType::TimeSeries,
        service_guard: false,
        experiment_name: None,
        api_version: "v1".to_string(),
        status: TaskStatus::Queued,
        retry_count: 0,
        priority: 1,
        created_at,
        last_updated_at: created_at,
        lease_timeout: Duration::seconds(5),
        valid_until: created_at + Duration::days(7),
        error: None,
    }
}

pub fn request(group_key: &str, analysis_minute: i64) -> AnalysisTaskRequest {
    AnalysisTaskRequest::new(group_key, analysis_minute, "default", "v1")
}

pub fn memory_queue(config: QueueConfig) -> (AnalysisTaskQueue, ManualClock) {
    let clock = ManualClock::new(fixed_now());
    let queue = AnalysisTaskQueue::new(
        Arc::new(MemoryTaskStore::new()),
        Arc::new(clock.clone()),
        config,
    );
    (queue, clock)
}

pub async fn sqlite_store() -> (SqliteTaskStore, TempDir) {
    let dir = tempfile::tempdir().expect("tempdir");
    let options = SqliteConnectOptions::new()
        .filename(dir.path().join("tasks.db"))
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(std::time::Duration::from_secs(5));
    let pool = SqlitePoolOptions::new()
        .max_connections(4)
        .connect_with(options)
        .await
        .expect("sqlite pool");
    let store = SqliteTaskStore::new(pool);
    store.migrate().await.expect("migrate");
    (store, dir)
}

pub async fn sqlite_queue(config: QueueConfig) -> (AnalysisTaskQueue, ManualClock, TempDir) {
    let (store, dir) = sqlite_store().await;
    let clock = ManualClock::new(fixed_now());
    let queue = AnalysisTaskQueue::new(Arc::new(store), Arc::new(clock.clone()), config);
    (queue, clock, dir)
}
