use super::types::{
    AnalysisTask, ClaimQuery, CompleteOutcome, EnqueueOutcome, FailureOutcome, QueueStats,
    TaskError, TaskStatus,
};
use crate::error::StoreError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Persistence seam for the queue. Every method is a single atomic step
/// against the backing store; callers never read-then-write.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Inserts unless the dedup hash already exists, or (when
    /// `gate_preceding_windows` is set) an earlier window of the same series
    /// is still queued or running.
    async fn insert_if_absent(
        &self,
        task: &AnalysisTask,
        gate_preceding_windows: bool,
    ) -> Result<EnqueueOutcome, StoreError>;

    /// Picks the best claimable task and flips it to running in one step,
    /// bumping `retry_count` and stamping `last_updated_at`.
    async fn claim_next(&self, query: &ClaimQuery) -> Result<Option<AnalysisTask>, StoreError>;

    /// `Ok(None)` when no task has this id.
    async fn complete(
        &self,
        task_id: Uuid,
        status: TaskStatus,
        now: DateTime<Utc>,
    ) -> Result<Option<CompleteOutcome>, StoreError>;

    async fn record_failure(
        &self,
        task_id: Uuid,
        error: &TaskError,
        max_retries: u32,
        now: DateTime<Utc>,
    ) -> Result<Option<FailureOutcome>, StoreError>;

    async fn get(&self, task_id: Uuid) -> Result<Option<AnalysisTask>, StoreError>;

    /// All tasks of a group ordered by window then insertion.
    async fn list_group(&self, group_key: &str) -> Result<Vec<AnalysisTask>, StoreError>;

    async fn expire_overdue(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;

    async fn sweep_exhausted(&self, max_retries: u32, now: DateTime<Utc>) -> Result<u64, StoreError>;

    async fn stats(&self, max_retries: u32) -> Result<QueueStats, StoreError>;
}

#[derive(Debug, Clone)]
struct StoredTask {
    seq: u64,
    task: AnalysisTask,
}

#[derive(Debug, Default)]
struct MemoryState {
    tasks: HashMap<Uuid, StoredTask>,
    by_hash: HashMap<String, Uuid>,
    next_seq: u64,
}

/// In-process store; the mutex is the atomicity boundary.
#[derive(Debug, Default)]
pub struct MemoryTaskStore {
    state: Mutex<MemoryState>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn insert_if_absent(
        &self,
        task: &AnalysisTask,
        gate_preceding_windows: bool,
    ) -> Result<EnqueueOutcome, StoreError> {
        let mut state = self.state.lock().await;
        let hash = task.dedup_hash();
        if state.by_hash.contains_key(&hash) {
            return Ok(EnqueueOutcome::AlreadyExists);
        }
        if gate_preceding_windows
            && state
                .tasks
                .values()
                .any(|stored| stored.task.blocks_window(task))
        {
            return Ok(EnqueueOutcome::PrecedingWindowPending);
        }

        state.next_seq += 1;
        let seq = state.next_seq;
        state.by_hash.insert(hash, task.id);
        state.tasks.insert(
            task.id,
            StoredTask {
                seq,
                task: task.clone(),
            },
        );
        Ok(EnqueueOutcome::Enqueued(task.clone()))
    }

    async fn claim_next(&self, query: &ClaimQuery) -> Result<Option<AnalysisTask>, StoreError> {
        let mut state = self.state.lock().await;
        let Some(task_id) = state
            .tasks
            .values()
            .filter(|stored| stored.task.is_claimable(query))
            .min_by(|a, b| {
                a.task
                    .priority
                    .cmp(&b.task.priority)
                    .then(a.task.created_at.cmp(&b.task.created_at))
                    .then(a.seq.cmp(&b.seq))
            })
            .map(|stored| stored.task.id)
        else {
            return Ok(None);
        };

        let Some(stored) = state.tasks.get_mut(&task_id) else {
            return Ok(None);
        };
        stored.task.status = TaskStatus::Running;
        stored.task.retry_count += 1;
        stored.task.last_updated_at = query.now;
        Ok(Some(stored.task.clone()))
    }

    async fn complete(
        &self,
        task_id: Uuid,
        status: TaskStatus,
        now: DateTime<Utc>,
    ) -> Result<Option<CompleteOutcome>, StoreError> {
        let mut state = self.state.lock().await;
        let Some(stored) = state.tasks.get_mut(&task_id) else {
            return Ok(None);
        };
        if stored.task.status.is_terminal() {
            return Ok(Some(CompleteOutcome::AlreadyTerminal(stored.task.status)));
        }
        stored.task.status = status;
        stored.task.last_updated_at = now;
        Ok(Some(CompleteOutcome::Completed(stored.task.clone())))
    }

    async fn record_failure(
        &self,
        task_id: Uuid,
        error: &TaskError,
        max_retries: u32,
        now: DateTime<Utc>,
    ) -> Result<Option<FailureOutcome>, StoreError> {
        let mut state = self.state.lock().await;
        let Some(stored) = state.tasks.get_mut(&task_id) else {
            return Ok(None);
        };
        if stored.task.status != TaskStatus::Running {
            return Ok(Some(FailureOutcome::NotRunning(stored.task.status)));
        }
        stored.task.last_updated_at = now;
        if stored.task.retry_count >= max_retries {
            stored.task.status = TaskStatus::Failed;
            stored.task.error = Some(TaskError::retry_budget_exhausted(Some(error)));
            Ok(Some(FailureOutcome::RetryBudgetExhausted(stored.task.clone())))
        } else {
            stored.task.status = TaskStatus::Queued;
            stored.task.error = Some(error.clone());
            Ok(Some(FailureOutcome::Requeued(stored.task.clone())))
        }
    }

    async fn get(&self, task_id: Uuid) -> Result<Option<AnalysisTask>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.tasks.get(&task_id).map(|stored| stored.task.clone()))
    }

    async fn list_group(&self, group_key: &str) -> Result<Vec<AnalysisTask>, StoreError> {
        let state = self.state.lock().await;
        let mut tasks: Vec<&StoredTask> = state
            .tasks
            .values()
            .filter(|stored| stored.task.group_key == group_key)
            .collect();
        tasks.sort_by_key(|stored| (stored.task.analysis_minute, stored.seq));
        Ok(tasks.into_iter().map(|stored| stored.task.clone()).collect())
    }

    async fn expire_overdue(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        let mut expired = 0;
        for stored in state.tasks.values_mut() {
            if !stored.task.status.is_terminal() && !stored.task.is_live(now) {
                stored.task.status = TaskStatus::Expired;
                stored.task.last_updated_at = now;
                expired += 1;
            }
        }
        Ok(expired)
    }

    async fn sweep_exhausted(&self, max_retries: u32, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        let mut swept = 0;
        for stored in state.tasks.values_mut() {
            let task = &mut stored.task;
            let stranded = task.status == TaskStatus::Queued || task.lease_expired(now);
            if stranded && task.is_live(now) && task.retry_count >= max_retries {
                task.status = TaskStatus::Failed;
                task.error = Some(TaskError::retry_budget_exhausted(None));
                task.last_updated_at = now;
                swept += 1;
            }
        }
        Ok(swept)
    }

    async fn stats(&self, max_retries: u32) -> Result<QueueStats, StoreError> {
        let state = self.state.lock().await;
        let mut stats = QueueStats::default();
        for stored in state.tasks.values() {
            let task = &stored.task;
            stats.add_status(task.status, 1);
            let exhausted = match task.status {
                TaskStatus::Queued | TaskStatus::Running => task.retry_count >= max_retries,
                TaskStatus::Failed => task
                    .error
                    .as_ref()
                    .is_some_and(TaskError::is_retry_budget_exhausted),
                TaskStatus::Success | TaskStatus::Expired => false,
            };
            if exhausted {
                stats.retry_exhausted += 1;
            }
        }
        Ok(stats)
    }
}
