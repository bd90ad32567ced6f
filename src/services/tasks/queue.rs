use super::clock::Clock;
use super::store::TaskStore;
use super::types::{
    AnalysisTask, AnalysisTaskRequest, AnalysisType, ClaimFilter, ClaimQuery, CompleteOutcome,
    EnqueueOutcome, FailureOutcome, QueueStats, TaskError, TaskKind, TaskStatus,
};
use crate::error::QueueError;
use chrono::Duration;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// TTL and default priority for one task kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskPolicy {
    pub ttl: Duration,
    pub default_priority: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    pub max_retries: u32,
    pub lease_timeout: Duration,
    pub primary: TaskPolicy,
    pub experimental: TaskPolicy,
    /// Hold back a primary window while an earlier window of the same series
    /// is still queued or running.
    pub serialize_group_windows: bool,
}

impl QueueConfig {
    pub fn policy(&self, kind: TaskKind) -> TaskPolicy {
        match kind {
            TaskKind::Primary => self.primary,
            TaskKind::Experimental => self.experimental,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            lease_timeout: Duration::minutes(20),
            primary: TaskPolicy {
                ttl: Duration::days(7),
                default_priority: 1,
            },
            experimental: TaskPolicy {
                ttl: Duration::days(2),
                default_priority: 5,
            },
            serialize_group_windows: true,
        }
    }
}

#[derive(Debug, Default)]
struct QueueCounters {
    enqueued: AtomicU64,
    duplicates: AtomicU64,
    deferred: AtomicU64,
    claimed: AtomicU64,
    reclaimed: AtomicU64,
    completed: AtomicU64,
    requeued: AtomicU64,
    retry_exhausted: AtomicU64,
    expired: AtomicU64,
}

/// In-process counters since this queue handle was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueMetrics {
    pub enqueued: u64,
    pub duplicates: u64,
    pub deferred: u64,
    pub claimed: u64,
    pub reclaimed: u64,
    pub completed: u64,
    pub requeued: u64,
    pub retry_exhausted: u64,
    pub expired: u64,
}

pub struct AnalysisTaskQueue {
    store: Arc<dyn TaskStore>,
    clock: Arc<dyn Clock>,
    config: QueueConfig,
    counters: QueueCounters,
}

impl AnalysisTaskQueue {
    pub fn new(store: Arc<dyn TaskStore>, clock: Arc<dyn Clock>, config: QueueConfig) -> Self {
        Self {
            store,
            clock,
            config,
            counters: QueueCounters::default(),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub async fn enqueue(&self, request: AnalysisTaskRequest) -> Result<EnqueueOutcome, QueueError> {
        let now = self.clock.now();
        let policy = self.config.policy(request.kind);
        let valid_until = now
            .checked_add_signed(policy.ttl)
            .ok_or(QueueError::TtlOverflow(policy.ttl))?;
        let experiment_name = match request.kind {
            TaskKind::Primary => None,
            TaskKind::Experimental => request.experiment_name,
        };
        let task = AnalysisTask {
            id: Uuid::new_v4(),
            kind: request.kind,
            group_key: request.group_key,
            analysis_minute: request.analysis_minute,
            cluster_level: request.cluster_level,
            group_name: request.group_name,
            analysis_type: request.analysis_type,
            service_guard: request.service_guard,
            experiment_name,
            api_version: request.api_version,
            status: TaskStatus::Queued,
            retry_count: 0,
            priority: request.priority.unwrap_or(policy.default_priority),
            created_at: now,
            last_updated_at: now,
            lease_timeout: self.config.lease_timeout,
            valid_until,
            error: None,
        };

        let gate = self.config.serialize_group_windows && task.kind == TaskKind::Primary;
        let outcome = self.store.insert_if_absent(&task, gate).await?;
        match &outcome {
            EnqueueOutcome::Enqueued(task) => {
                self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
                tracing::info!(
                    task_id = %task.id,
                    group_key = %task.group_key,
                    analysis_minute = task.analysis_minute,
                    kind = %task.kind,
                    "analysis task enqueued"
                );
            }
            EnqueueOutcome::AlreadyExists => {
                self.counters.duplicates.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    group_key = %task.group_key,
                    analysis_minute = task.analysis_minute,
                    "analysis task already exists"
                );
            }
            EnqueueOutcome::PrecedingWindowPending => {
                self.counters.deferred.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    group_key = %task.group_key,
                    analysis_minute = task.analysis_minute,
                    "earlier window still pending; analysis task not enqueued"
                );
            }
        }
        Ok(outcome)
    }

    pub async fn claim_next(
        &self,
        api_version: &str,
        filter: &ClaimFilter,
    ) -> Result<Option<AnalysisTask>, QueueError> {
        self.claim(TaskKind::Primary, api_version, filter.clone())
            .await
    }

    pub async fn claim_next_experimental(
        &self,
        api_version: &str,
        experiment_name: &str,
        analysis_types: &[AnalysisType],
    ) -> Result<Option<AnalysisTask>, QueueError> {
        let filter = ClaimFilter {
            service_guard: None,
            analysis_types: analysis_types.to_vec(),
            experiment_name: Some(experiment_name.to_string()),
        };
        self.claim(TaskKind::Experimental, api_version, filter).await
    }

    async fn claim(
        &self,
        kind: TaskKind,
        api_version: &str,
        filter: ClaimFilter,
    ) -> Result<Option<AnalysisTask>, QueueError> {
        let query = ClaimQuery {
            kind,
            api_version: api_version.to_string(),
            filter,
            max_retries: self.config.max_retries,
            now: self.clock.now(),
        };
        let Some(task) = self.store.claim_next(&query).await? else {
            return Ok(None);
        };

        self.counters.claimed.fetch_add(1, Ordering::Relaxed);
        if task.retry_count > 1 {
            self.counters.reclaimed.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                task_id = %task.id,
                group_key = %task.group_key,
                retry_count = task.retry_count,
                "reclaimed analysis task after lease expiry or failure"
            );
        } else {
            tracing::info!(
                task_id = %task.id,
                group_key = %task.group_key,
                analysis_minute = task.analysis_minute,
                "claimed analysis task"
            );
        }
        Ok(Some(task))
    }

    /// Polls until a task is claimed or `wait` elapses, doubling the sleep
    /// between empty polls up to `max_interval`.
    pub async fn poll_next(
        &self,
        api_version: &str,
        filter: &ClaimFilter,
        wait: std::time::Duration,
        interval: std::time::Duration,
        max_interval: std::time::Duration,
    ) -> Result<Option<AnalysisTask>, QueueError> {
        let deadline = tokio::time::Instant::now() + wait;
        let mut delay = interval;
        loop {
            if let Some(task) = self.claim_next(api_version, filter).await? {
                return Ok(Some(task));
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(delay.min(deadline - now)).await;
            delay = (delay * 2).min(max_interval);
        }
    }

    /// Terminal completion. Repeating it on a finished task is a no-op.
    pub async fn complete(
        &self,
        task_id: Uuid,
        status: TaskStatus,
    ) -> Result<CompleteOutcome, QueueError> {
        if !matches!(status, TaskStatus::Success | TaskStatus::Failed) {
            return Err(QueueError::InvalidCompletionStatus(status));
        }
        let outcome = self
            .store
            .complete(task_id, status, self.clock.now())
            .await?
            .ok_or(QueueError::TaskNotFound(task_id))?;
        match &outcome {
            CompleteOutcome::Completed(task) => {
                self.counters.completed.fetch_add(1, Ordering::Relaxed);
                tracing::info!(task_id = %task.id, status = %task.status, "analysis task completed");
            }
            CompleteOutcome::AlreadyTerminal(existing) => {
                tracing::debug!(task_id = %task_id, status = %existing, "analysis task already terminal");
            }
        }
        Ok(outcome)
    }

    /// Completes every live task of one window of a group, matched by key
    /// rather than id. Returns how many tasks were completed.
    pub async fn complete_window(
        &self,
        group_key: &str,
        analysis_minute: i64,
        analysis_type: AnalysisType,
        cluster_level: i32,
    ) -> Result<usize, QueueError> {
        let mut completed = 0;
        for task in self.store.list_group(group_key).await? {
            if task.status.is_terminal()
                || task.analysis_minute != analysis_minute
                || task.analysis_type != analysis_type
                || task.cluster_level != cluster_level
            {
                continue;
            }
            if let CompleteOutcome::Completed(_) = self.complete(task.id, TaskStatus::Success).await? {
                completed += 1;
            }
        }
        Ok(completed)
    }

    /// Worker-reported failure: requeue while budget remains, otherwise fail
    /// the task for good.
    pub async fn notify_failure(
        &self,
        task_id: Uuid,
        error: TaskError,
    ) -> Result<FailureOutcome, QueueError> {
        let outcome = self
            .store
            .record_failure(task_id, &error, self.config.max_retries, self.clock.now())
            .await?
            .ok_or(QueueError::TaskNotFound(task_id))?;
        match &outcome {
            FailureOutcome::Requeued(task) => {
                self.counters.requeued.fetch_add(1, Ordering::Relaxed);
                tracing::info!(
                    task_id = %task.id,
                    retry_count = task.retry_count,
                    error_code = %error.code,
                    "analysis task requeued after failure"
                );
            }
            FailureOutcome::RetryBudgetExhausted(task) => {
                self.counters.retry_exhausted.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    task_id = %task.id,
                    group_key = %task.group_key,
                    retry_count = task.retry_count,
                    error_code = %error.code,
                    "analysis task retry budget exhausted"
                );
            }
            FailureOutcome::NotRunning(status) => {
                tracing::debug!(task_id = %task_id, status = %status, "failure reported for task that is not running");
            }
        }
        Ok(outcome)
    }

    pub async fn get(&self, task_id: Uuid) -> Result<Option<AnalysisTask>, QueueError> {
        Ok(self.store.get(task_id).await?)
    }

    /// True once any task of the group has burned through its retries,
    /// whether or not the sweeper has failed it yet.
    pub async fn has_analysis_timed_out(&self, group_key: &str) -> Result<bool, QueueError> {
        let max_retries = self.config.max_retries;
        Ok(self
            .store
            .list_group(group_key)
            .await?
            .iter()
            .any(|task| match task.status {
                TaskStatus::Queued | TaskStatus::Running => task.retry_count >= max_retries,
                TaskStatus::Failed => task
                    .error
                    .as_ref()
                    .is_some_and(TaskError::is_retry_budget_exhausted),
                TaskStatus::Success | TaskStatus::Expired => false,
            }))
    }

    /// Whether the group has queued or running work, optionally only for
    /// windows at or after `since_minute`.
    pub async fn is_task_running_or_queued(
        &self,
        group_key: &str,
        since_minute: Option<i64>,
    ) -> Result<bool, QueueError> {
        Ok(self
            .store
            .list_group(group_key)
            .await?
            .iter()
            .any(|task| {
                matches!(task.status, TaskStatus::Queued | TaskStatus::Running)
                    && since_minute.map_or(true, |since| task.analysis_minute >= since)
            }))
    }

    pub async fn expire_overdue(&self) -> Result<u64, QueueError> {
        let expired = self.store.expire_overdue(self.clock.now()).await?;
        if expired > 0 {
            self.counters.expired.fetch_add(expired, Ordering::Relaxed);
            tracing::info!(expired, "expired analysis tasks past their ttl");
        }
        Ok(expired)
    }

    pub async fn sweep_exhausted(&self) -> Result<u64, QueueError> {
        let swept = self
            .store
            .sweep_exhausted(self.config.max_retries, self.clock.now())
            .await?;
        if swept > 0 {
            self.counters.retry_exhausted.fetch_add(swept, Ordering::Relaxed);
            tracing::warn!(swept, "failed abandoned analysis tasks with no retries left");
        }
        Ok(swept)
    }

    pub async fn stats(&self) -> Result<QueueStats, QueueError> {
        Ok(self.store.stats(self.config.max_retries).await?)
    }

    pub fn metrics(&self) -> QueueMetrics {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        QueueMetrics {
            enqueued: load(&self.counters.enqueued),
            duplicates: load(&self.counters.duplicates),
            deferred: load(&self.counters.deferred),
            claimed: load(&self.counters.claimed),
            reclaimed: load(&self.counters.reclaimed),
            completed: load(&self.counters.completed),
            requeued: load(&self.counters.requeued),
            retry_exhausted: load(&self.counters.retry_exhausted),
            expired: load(&self.counters.expired),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::tasks::clock::SystemClock;
    use crate::services::tasks::store::MemoryTaskStore;
    use crate::test_support::{memory_queue, request, sqlite_queue};
    use futures::future::join_all;
    use std::collections::HashSet;

    #[tokio::test]
    async fn duplicate_enqueue_stores_one_task() {
        let (queue, _clock) = memory_queue(QueueConfig::default());
        for _ in 0..5 {
            queue.enqueue(request("exec-1", 10)).await.unwrap();
        }
        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.queued, 1);
        let metrics = queue.metrics();
        assert_eq!(metrics.enqueued, 1);
        assert_eq!(metrics.duplicates, 4);
    }

    #[tokio::test]
    async fn completed_windows_stay_deduplicated() {
        let (queue, _clock) = memory_queue(QueueConfig::default());
        queue.enqueue(request("exec-1", 10)).await.unwrap();
        let task = queue.claim_next("v1", &ClaimFilter::default()).await.unwrap().unwrap();
        queue.complete(task.id, TaskStatus::Success).await.unwrap();
        assert_eq!(
            queue.enqueue(request("exec-1", 10)).await.unwrap(),
            EnqueueOutcome::AlreadyExists
        );
    }

    #[tokio::test]
    async fn later_window_waits_for_earlier_one() {
        let (queue, _clock) = memory_queue(QueueConfig::default());
        queue.enqueue(request("exec-1", 10)).await.unwrap();
        assert_eq!(
            queue.enqueue(request("exec-1", 11)).await.unwrap(),
            EnqueueOutcome::PrecedingWindowPending
        );
        // other groups and experiments are independent
        assert!(matches!(
            queue.enqueue(request("exec-2", 11)).await.unwrap(),
            EnqueueOutcome::Enqueued(_)
        ));
        assert!(matches!(
            queue
                .enqueue(request("exec-1", 11).experimental("ts-v2"))
                .await
                .unwrap(),
            EnqueueOutcome::Enqueued(_)
        ));

        let first = queue.claim_next("v1", &ClaimFilter::default()).await.unwrap().unwrap();
        queue.complete(first.id, TaskStatus::Success).await.unwrap();
        let second = queue.claim_next("v1", &ClaimFilter::default()).await.unwrap().unwrap();
        queue.complete(second.id, TaskStatus::Success).await.unwrap();
        assert!(matches!(
            queue.enqueue(request("exec-1", 11)).await.unwrap(),
            EnqueueOutcome::Enqueued(_)
        ));
    }

    #[tokio::test]
    async fn unrepresentable_ttl_is_rejected_without_inserting() {
        let mut config = QueueConfig::default();
        config.primary.ttl = Duration::milliseconds(i64::MAX);
        let (queue, _clock) = memory_queue(config);

        let err = queue.enqueue(request("exec-1", 10)).await.unwrap_err();
        assert!(matches!(err, QueueError::TtlOverflow(_)));
        assert!(!err.is_retryable());
        assert_eq!(queue.stats().await.unwrap().queued, 0);

        // experimental tasks keep their own bounded ttl
        let outcome = queue
            .enqueue(request("exec-1", 10).experimental("canary"))
            .await
            .unwrap();
        assert!(matches!(outcome, EnqueueOutcome::Enqueued(_)));
    }

    #[tokio::test]
    async fn window_gate_can_be_disabled() {
        let config = QueueConfig {
            serialize_group_windows: false,
            ..QueueConfig::default()
        };
        let (queue, _clock) = memory_queue(config);
        queue.enqueue(request("exec-1", 10)).await.unwrap();
        assert!(matches!(
            queue.enqueue(request("exec-1", 11)).await.unwrap(),
            EnqueueOutcome::Enqueued(_)
        ));
    }

    #[tokio::test]
    async fn claims_by_priority_then_fifo() {
        let (queue, clock) = memory_queue(QueueConfig {
            serialize_group_windows: false,
            ..QueueConfig::default()
        });
        queue.enqueue(request("default-priority", 1)).await.unwrap();
        clock.advance(Duration::seconds(1));
        queue
            .enqueue(request("urgent-a", 1).with_priority(0))
            .await
            .unwrap();
        clock.advance(Duration::seconds(1));
        queue
            .enqueue(request("urgent-b", 1).with_priority(0))
            .await
            .unwrap();
        clock.advance(Duration::seconds(1));
        queue
            .enqueue(request("background", 1).with_priority(9))
            .await
            .unwrap();

        let mut order = Vec::new();
        while let Some(task) = queue.claim_next("v1", &ClaimFilter::default()).await.unwrap() {
            order.push(task.group_key);
        }
        assert_eq!(order, vec!["urgent-a", "urgent-b", "default-priority", "background"]);
    }

    #[tokio::test]
    async fn api_version_and_kind_partition_the_queue() {
        let (queue, _clock) = memory_queue(QueueConfig::default());
        queue.enqueue(request("exec-1", 1)).await.unwrap();
        queue
            .enqueue(request("exec-1", 1).experimental("ts-v2"))
            .await
            .unwrap();

        assert!(queue.claim_next("v2", &ClaimFilter::default()).await.unwrap().is_none());
        assert!(queue
            .claim_next_experimental("v1", "other-model", &[])
            .await
            .unwrap()
            .is_none());
        let experimental = queue
            .claim_next_experimental("v1", "ts-v2", &[AnalysisType::TimeSeries])
            .await
            .unwrap()
            .expect("experimental task");
        assert_eq!(experimental.kind, TaskKind::Experimental);
        assert_eq!(experimental.priority, 5);
        let primary = queue.claim_next("v1", &ClaimFilter::default()).await.unwrap().unwrap();
        assert_eq!(primary.kind, TaskKind::Primary);
        assert_eq!(primary.priority, 1);
    }

    #[tokio::test]
    async fn claims_stop_after_retry_budget() {
        let config = QueueConfig {
            lease_timeout: Duration::seconds(5),
            ..QueueConfig::default()
        };
        let (queue, clock) = memory_queue(config);
        queue.enqueue(request("exec-1", 1)).await.unwrap();

        for attempt in 1..=3 {
            let task = queue
                .claim_next("v1", &ClaimFilter::default())
                .await
                .unwrap()
                .expect("claimable");
            assert_eq!(task.retry_count, attempt);
            clock.advance(Duration::seconds(10));
        }
        assert!(queue.claim_next("v1", &ClaimFilter::default()).await.unwrap().is_none());
        assert!(queue.has_analysis_timed_out("exec-1").await.unwrap());
        assert_eq!(queue.stats().await.unwrap().retry_exhausted, 1);

        assert_eq!(queue.sweep_exhausted().await.unwrap(), 1);
        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.retry_exhausted, 1);
        assert!(queue.has_analysis_timed_out("exec-1").await.unwrap());
        assert_eq!(queue.metrics().retry_exhausted, 1);
    }

    #[tokio::test]
    async fn abandoned_lease_is_reclaimed() {
        let config = QueueConfig {
            lease_timeout: Duration::seconds(5),
            ..QueueConfig::default()
        };
        let (queue, clock) = memory_queue(config);
        queue.enqueue(request("exec-1", 1)).await.unwrap();
        let first = queue.claim_next("v1", &ClaimFilter::default()).await.unwrap().unwrap();

        clock.advance(Duration::seconds(3));
        assert!(queue.claim_next("v1", &ClaimFilter::default()).await.unwrap().is_none());

        clock.advance(Duration::seconds(7));
        let again = queue
            .claim_next("v1", &ClaimFilter::default())
            .await
            .unwrap()
            .expect("reclaimed");
        assert_eq!(again.id, first.id);
        assert_eq!(again.retry_count, 2);
        assert_eq!(queue.metrics().reclaimed, 1);
    }

    #[tokio::test]
    async fn complete_round_trip_is_idempotent() {
        let (queue, _clock) = memory_queue(QueueConfig::default());
        queue.enqueue(request("exec-1", 1)).await.unwrap();
        let task = queue.claim_next("v1", &ClaimFilter::default()).await.unwrap().unwrap();

        let first = queue.complete(task.id, TaskStatus::Success).await.unwrap();
        assert!(matches!(first, CompleteOutcome::Completed(ref done) if done.status == TaskStatus::Success));
        let second = queue.complete(task.id, TaskStatus::Failed).await.unwrap();
        assert_eq!(second, CompleteOutcome::AlreadyTerminal(TaskStatus::Success));
        let stored = queue.get(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Success);
        assert_eq!(queue.metrics().completed, 1);
    }

    #[tokio::test]
    async fn complete_rejects_non_terminal_status_and_unknown_ids() {
        let (queue, _clock) = memory_queue(QueueConfig::default());
        let err = queue.complete(Uuid::new_v4(), TaskStatus::Running).await.unwrap_err();
        assert!(matches!(err, QueueError::InvalidCompletionStatus(TaskStatus::Running)));
        let missing = Uuid::new_v4();
        let err = queue.complete(missing, TaskStatus::Success).await.unwrap_err();
        assert!(matches!(err, QueueError::TaskNotFound(id) if id == missing));
    }

    #[tokio::test]
    async fn notify_failure_requeues_then_fails() {
        let (queue, _clock) = memory_queue(QueueConfig::default());
        queue.enqueue(request("exec-1", 1)).await.unwrap();
        let error = TaskError::new("provider_error", "upstream 503");

        for _ in 0..2 {
            let task = queue.claim_next("v1", &ClaimFilter::default()).await.unwrap().unwrap();
            let outcome = queue.notify_failure(task.id, error.clone()).await.unwrap();
            assert!(matches!(outcome, FailureOutcome::Requeued(_)));
            assert!(!queue.has_analysis_timed_out("exec-1").await.unwrap());
        }
        let task = queue.claim_next("v1", &ClaimFilter::default()).await.unwrap().unwrap();
        let outcome = queue.notify_failure(task.id, error.clone()).await.unwrap();
        assert!(matches!(outcome, FailureOutcome::RetryBudgetExhausted(_)));
        assert!(queue.has_analysis_timed_out("exec-1").await.unwrap());

        let repeat = queue.notify_failure(task.id, error).await.unwrap();
        assert_eq!(repeat, FailureOutcome::NotRunning(TaskStatus::Failed));
        assert_eq!(queue.metrics().requeued, 2);
        assert_eq!(queue.metrics().retry_exhausted, 1);
    }

    #[tokio::test]
    async fn running_or_queued_checks_later_windows() {
        let (queue, _clock) = memory_queue(QueueConfig::default());
        queue.enqueue(request("exec-1", 10)).await.unwrap();
        assert!(queue.is_task_running_or_queued("exec-1", None).await.unwrap());
        assert!(queue.is_task_running_or_queued("exec-1", Some(10)).await.unwrap());
        assert!(!queue.is_task_running_or_queued("exec-1", Some(11)).await.unwrap());
        assert!(!queue.is_task_running_or_queued("exec-2", None).await.unwrap());

        assert_eq!(
            queue
                .complete_window("exec-1", 10, AnalysisType::TimeSeries, 0)
                .await
                .unwrap(),
            1
        );
        assert!(!queue.is_task_running_or_queued("exec-1", None).await.unwrap());
    }

    #[tokio::test]
    async fn ttl_expires_unfinished_tasks() {
        let (queue, clock) = memory_queue(QueueConfig::default());
        queue.enqueue(request("exec-1", 1)).await.unwrap();
        queue
            .enqueue(request("exec-2", 1).experimental("ts-v2"))
            .await
            .unwrap();

        clock.advance(Duration::days(3));
        assert_eq!(queue.expire_overdue().await.unwrap(), 1, "experimental ttl is 2 days");
        assert!(queue
            .claim_next_experimental("v1", "ts-v2", &[])
            .await
            .unwrap()
            .is_none());

        clock.advance(Duration::days(5));
        assert!(
            queue.claim_next("v1", &ClaimFilter::default()).await.unwrap().is_none(),
            "past ttl even before the sweeper runs"
        );
        assert_eq!(queue.expire_overdue().await.unwrap(), 1);
        assert_eq!(queue.stats().await.unwrap().expired, 2);
    }

    #[tokio::test]
    async fn poll_next_returns_none_after_wait() {
        let (queue, _clock) = memory_queue(QueueConfig::default());
        let started = std::time::Instant::now();
        let polled = queue
            .poll_next(
                "v1",
                &ClaimFilter::default(),
                std::time::Duration::from_millis(60),
                std::time::Duration::from_millis(10),
                std::time::Duration::from_millis(40),
            )
            .await
            .unwrap();
        assert!(polled.is_none());
        assert!(started.elapsed() >= std::time::Duration::from_millis(60));
    }

    async fn assert_exclusive_claims(queue: Arc<AnalysisTaskQueue>, tasks: usize, claimers: usize) {
        for index in 0..tasks {
            queue
                .enqueue(request(&format!("exec-{index}"), 1))
                .await
                .unwrap();
        }

        let handles = (0..claimers).map(|_| {
            let queue = queue.clone();
            tokio::spawn(async move {
                let mut claimed = Vec::new();
                while let Some(task) = queue.claim_next("v1", &ClaimFilter::default()).await.unwrap() {
                    claimed.push(task.id);
                }
                claimed
            })
        });
        let mut seen = HashSet::new();
        let mut total = 0;
        for claimed in join_all(handles).await {
            for id in claimed.expect("claimer panicked") {
                total += 1;
                assert!(seen.insert(id), "task {id} handed out twice");
            }
        }
        assert_eq!(total, tasks);
        assert_eq!(queue.stats().await.unwrap().running, tasks as u64);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_claimers_never_share_a_task_in_memory() {
        let (queue, _clock) = memory_queue(QueueConfig::default());
        assert_exclusive_claims(Arc::new(queue), 25, 40).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_claimers_never_share_a_task_in_sqlite() {
        let (queue, _clock, _dir) = sqlite_queue(QueueConfig::default()).await;
        assert_exclusive_claims(Arc::new(queue), 25, 40).await;
    }

    #[tokio::test]
    async fn queue_works_over_any_store() {
        let store: Arc<dyn TaskStore> = Arc::new(MemoryTaskStore::new());
        let queue = AnalysisTaskQueue::new(store, Arc::new(SystemClock), QueueConfig::default());
        queue.enqueue(request("exec-1", 1)).await.unwrap();
        assert!(queue.claim_next("v1", &ClaimFilter::default()).await.unwrap().is_some());
    }
}
