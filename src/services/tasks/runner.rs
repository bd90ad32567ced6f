use super::queue::AnalysisTaskQueue;
use super::types::{AnalysisTask, AnalysisType, ClaimFilter, CompleteOutcome, FailureOutcome, TaskError, TaskStatus};
use crate::error::QueueError;
use crate::services::metrics::{
    analyze_window, AnalysisOptions, BucketWindow, MetricCatalog, RiskLevel,
    VerificationRiskReport, WindowSamples,
};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

/// Fetches raw control and test samples for a claimed window.
#[async_trait]
pub trait SampleSource: Send + Sync {
    async fn fetch(&self, task: &AnalysisTask, window: BucketWindow) -> anyhow::Result<WindowSamples>;
}

/// Persists the report of a finished window.
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn save(&self, task: &AnalysisTask, report: &VerificationRiskReport) -> anyhow::Result<()>;
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub api_version: String,
    pub filter: ClaimFilter,
    pub poll_interval: Duration,
    pub max_backoff: Duration,
    pub max_concurrency: usize,
    pub bucket_width_minutes: i64,
    pub maintenance_interval: Duration,
    pub analysis: AnalysisOptions,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            api_version: "v1".to_string(),
            filter: ClaimFilter {
                analysis_types: vec![AnalysisType::TimeSeries],
                ..ClaimFilter::default()
            },
            poll_interval: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            max_concurrency: 2,
            bucket_width_minutes: 1,
            maintenance_interval: Duration::from_secs(60),
            analysis: AnalysisOptions::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TaskRunOutcome {
    Succeeded { task_id: Uuid, overall_risk: RiskLevel },
    Requeued { task_id: Uuid },
    Exhausted { task_id: Uuid },
    /// The task left `running` underneath us (expired, or completed by key).
    Abandoned { task_id: Uuid, status: TaskStatus },
}

pub struct AnalysisWorker {
    queue: Arc<AnalysisTaskQueue>,
    catalog: Arc<MetricCatalog>,
    source: Arc<dyn SampleSource>,
    sink: Arc<dyn ResultSink>,
    config: WorkerConfig,
    semaphore: Arc<Semaphore>,
    running: Arc<Mutex<HashSet<(Uuid, u32)>>>,
}

impl AnalysisWorker {
    pub fn new(
        queue: Arc<AnalysisTaskQueue>,
        catalog: Arc<MetricCatalog>,
        source: Arc<dyn SampleSource>,
        sink: Arc<dyn ResultSink>,
        config: WorkerConfig,
    ) -> Self {
        let max_concurrency = config.max_concurrency.max(1);
        Self {
            queue,
            catalog,
            source,
            sink,
            config,
            semaphore: Arc::new(Semaphore::new(max_concurrency)),
            running: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn start(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut consecutive_errors: u32 = 0;
            let mut last_maintenance: Option<Instant> = None;
            loop {
                let delay = self.poll_delay(consecutive_errors);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }

                let maintenance_due = last_maintenance
                    .map_or(true, |at| at.elapsed() >= self.config.maintenance_interval);
                if maintenance_due {
                    self.run_maintenance().await;
                    last_maintenance = Some(Instant::now());
                }

                while let Ok(permit) = self.semaphore.clone().try_acquire_owned() {
                    let task = match self
                        .queue
                        .claim_next(&self.config.api_version, &self.config.filter)
                        .await
                    {
                        Ok(task) => {
                            consecutive_errors = 0;
                            task
                        }
                        Err(err) => {
                            consecutive_errors = consecutive_errors.saturating_add(1);
                            tracing::warn!(
                                error = %err,
                                retryable = err.is_retryable(),
                                consecutive_errors,
                                "analysis worker failed to claim task"
                            );
                            drop(permit);
                            break;
                        }
                    };

                    let Some(task) = task else {
                        drop(permit);
                        break;
                    };

                    let worker = self.clone();
                    let span = tracing::info_span!(
                        "analysis_task",
                        task_id = %task.id,
                        group_key = %task.group_key,
                        analysis_minute = task.analysis_minute,
                        retry_count = task.retry_count,
                    );
                    tokio::spawn(async move {
                        let _permit = permit;
                        if let Err(err) = worker.run_one(task).instrument(span).await {
                            tracing::warn!(error = %err, "analysis task runner error");
                        }
                    });
                }
            }
            tracing::info!("analysis worker stopped");
        })
    }

    /// Claims and runs a single task inline.
    pub async fn run_once(&self) -> Result<Option<TaskRunOutcome>, QueueError> {
        let Some(task) = self
            .queue
            .claim_next(&self.config.api_version, &self.config.filter)
            .await?
        else {
            return Ok(None);
        };
        self.run_one(task).await.map(Some)
    }

    pub async fn run_maintenance(&self) {
        if let Err(err) = self.queue.expire_overdue().await {
            tracing::warn!(error = %err, "analysis task expiry failed");
        }
        if let Err(err) = self.queue.sweep_exhausted().await {
            tracing::warn!(error = %err, "analysis task retry sweep failed");
        }
    }

    fn poll_delay(&self, consecutive_errors: u32) -> Duration {
        let base = self.config.poll_interval;
        if consecutive_errors == 0 {
            return base;
        }
        let factor = 2u32.saturating_pow(consecutive_errors.min(16));
        base.saturating_mul(factor).min(self.config.max_backoff.max(base))
    }

    async fn run_one(&self, task: AnalysisTask) -> Result<TaskRunOutcome, QueueError> {
        let lease = (task.id, task.retry_count);
        if !self.running.lock().await.insert(lease) {
            tracing::error!(task_id = %task.id, retry_count = task.retry_count, "claim handed out twice");
            return Err(QueueError::ClaimRaceViolation(task.id));
        }

        let started = Instant::now();
        tracing::info!(phase = "runner_start", "analysis task execution started");
        let result = self.execute(&task).await;
        self.running.lock().await.remove(&lease);
        let duration_ms = millis_u64(started.elapsed());

        match result {
            Ok(report) => match self.queue.complete(task.id, TaskStatus::Success).await? {
                CompleteOutcome::Completed(_) => {
                    tracing::info!(
                        phase = "runner_complete",
                        status = "success",
                        overall_risk = %report.overall_risk,
                        skipped_metrics = report.skipped_metrics.len(),
                        duration_ms,
                        "analysis task execution finished"
                    );
                    Ok(TaskRunOutcome::Succeeded {
                        task_id: task.id,
                        overall_risk: report.overall_risk,
                    })
                }
                CompleteOutcome::AlreadyTerminal(status) => {
                    tracing::warn!(%status, duration_ms, "analysis task finished after leaving running");
                    Ok(TaskRunOutcome::Abandoned {
                        task_id: task.id,
                        status,
                    })
                }
            },
            Err(error) => {
                tracing::warn!(
                    phase = "runner_complete",
                    status = "failed",
                    error_code = %error.code,
                    error_message = %error.message,
                    duration_ms,
                    "analysis task execution finished"
                );
                match self.queue.notify_failure(task.id, error).await? {
                    FailureOutcome::Requeued(_) => Ok(TaskRunOutcome::Requeued { task_id: task.id }),
                    FailureOutcome::RetryBudgetExhausted(_) => {
                        Ok(TaskRunOutcome::Exhausted { task_id: task.id })
                    }
                    FailureOutcome::NotRunning(status) => Ok(TaskRunOutcome::Abandoned {
                        task_id: task.id,
                        status,
                    }),
                }
            }
        }
    }

    async fn execute(&self, task: &AnalysisTask) -> Result<VerificationRiskReport, TaskError> {
        let window = BucketWindow::new(task.analysis_minute, self.config.bucket_width_minutes);
        let samples = self
            .source
            .fetch(task, window)
            .await
            .map_err(|err| TaskError::new("sample_fetch_failed", format!("{err:#}")))?;
        let report = analyze_window(&self.catalog, window, &samples, &self.config.analysis);
        self.sink
            .save(task, &report)
            .await
            .map_err(|err| TaskError::new("result_save_failed", format!("{err:#}")))?;
        Ok(report)
    }
}

fn millis_u64(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}
