use super::store::TaskStore;
use super::types::{
    millis_to_datetime, AnalysisTask, ClaimQuery, CompleteOutcome, EnqueueOutcome,
    FailureOutcome, QueueStats, TaskError, TaskStatus, RETRY_BUDGET_EXHAUSTED,
};
use crate::error::StoreError;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use uuid::Uuid;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS analysis_tasks (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        id TEXT NOT NULL UNIQUE,
        kind TEXT NOT NULL,
        dedup_hash TEXT NOT NULL UNIQUE,
        group_key TEXT NOT NULL,
        analysis_minute INTEGER NOT NULL,
        cluster_level INTEGER NOT NULL,
        group_name TEXT NOT NULL,
        analysis_type TEXT NOT NULL,
        service_guard INTEGER NOT NULL,
        experiment_name TEXT NOT NULL DEFAULT '',
        api_version TEXT NOT NULL,
        status TEXT NOT NULL,
        retry_count INTEGER NOT NULL,
        priority INTEGER NOT NULL,
        created_at_ms INTEGER NOT NULL,
        last_updated_at_ms INTEGER NOT NULL,
        lease_timeout_ms INTEGER NOT NULL,
        valid_until_ms INTEGER NOT NULL,
        error_code TEXT,
        error TEXT
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS analysis_tasks_claim_idx
        ON analysis_tasks (kind, api_version, status, priority, created_at_ms)
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS analysis_tasks_group_idx
        ON analysis_tasks (group_key, analysis_minute)
    "#,
];

const TASK_COLUMNS: &str = "id, kind, group_key, analysis_minute, cluster_level, group_name, \
     analysis_type, service_guard, experiment_name, api_version, status, retry_count, priority, \
     created_at_ms, last_updated_at_ms, lease_timeout_ms, valid_until_ms, error";

#[derive(Debug, sqlx::FromRow)]
struct TaskRow {
    id: String,
    kind: String,
    group_key: String,
    analysis_minute: i64,
    cluster_level: i64,
    group_name: String,
    analysis_type: String,
    service_guard: bool,
    experiment_name: String,
    api_version: String,
    status: String,
    retry_count: i64,
    priority: i64,
    created_at_ms: i64,
    last_updated_at_ms: i64,
    lease_timeout_ms: i64,
    valid_until_ms: i64,
    error: Option<String>,
}

impl TaskRow {
    fn into_task(self) -> Result<AnalysisTask, StoreError> {
        let id = Uuid::parse_str(&self.id)
            .map_err(|err| StoreError::Corrupt(format!("task id {}: {err}", self.id)))?;
        let corrupt = |field: &str, detail: String| StoreError::Corrupt(format!("task {id} {field}: {detail}"));
        let timestamp = |field: &str, millis: i64| {
            millis_to_datetime(millis).ok_or_else(|| corrupt(field, format!("{millis} out of range")))
        };
        Ok(AnalysisTask {
            id,
            kind: self.kind.parse().map_err(|err| corrupt("kind", err))?,
            group_key: self.group_key,
            analysis_minute: self.analysis_minute,
            cluster_level: i32::try_from(self.cluster_level)
                .map_err(|err| corrupt("cluster_level", err.to_string()))?,
            group_name: self.group_name,
            analysis_type: self
                .analysis_type
                .parse()
                .map_err(|err| corrupt("analysis_type", err))?,
            service_guard: self.service_guard,
            experiment_name: Some(self.experiment_name).filter(|name| !name.is_empty()),
            api_version: self.api_version,
            status: self.status.parse().map_err(|err| corrupt("status", err))?,
            retry_count: u32::try_from(self.retry_count)
                .map_err(|err| corrupt("retry_count", err.to_string()))?,
            priority: i32::try_from(self.priority)
                .map_err(|err| corrupt("priority", err.to_string()))?,
            created_at: timestamp("created_at", self.created_at_ms)?,
            last_updated_at: timestamp("last_updated_at", self.last_updated_at_ms)?,
            lease_timeout: Duration::milliseconds(self.lease_timeout_ms),
            valid_until: timestamp("valid_until", self.valid_until_ms)?,
            error: self
                .error
                .as_deref()
                .map(serde_json::from_str::<TaskError>)
                .transpose()?,
        })
    }
}

fn into_tasks(rows: Vec<TaskRow>) -> Result<Vec<AnalysisTask>, StoreError> {
    rows.into_iter().map(TaskRow::into_task).collect()
}

/// SQLite-backed store. Every state transition is a single conditional
/// statement, so any number of processes may share the database file.
#[derive(Debug, Clone)]
pub struct SqliteTaskStore {
    pool: SqlitePool,
}

impl SqliteTaskStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn has_hash(&self, dedup_hash: &str) -> Result<bool, StoreError> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT seq FROM analysis_tasks WHERE dedup_hash = ?1")
            .bind(dedup_hash)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn insert_if_absent(
        &self,
        task: &AnalysisTask,
        gate_preceding_windows: bool,
    ) -> Result<EnqueueOutcome, StoreError> {
        let dedup_hash = task.dedup_hash();
        let inserted = sqlx::query(
            r#"
            INSERT INTO analysis_tasks (
                id, kind, dedup_hash, group_key, analysis_minute, cluster_level, group_name,
                analysis_type, service_guard, experiment_name, api_version, status, retry_count,
                priority, created_at_ms, last_updated_at_ms, lease_timeout_ms, valid_until_ms
            )
            SELECT ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18
            WHERE ?19 = 0 OR NOT EXISTS (
                SELECT 1 FROM analysis_tasks
                WHERE kind = ?2
                  AND group_key = ?4
                  AND cluster_level = ?6
                  AND group_name = ?7
                  AND analysis_type = ?8
                  AND api_version = ?11
                  AND status IN ('queued', 'running')
                  AND analysis_minute <= ?5
            )
            ON CONFLICT (dedup_hash) DO NOTHING
            "#,
        )
        .bind(task.id.to_string())
        .bind(task.kind.as_str())
        .bind(&dedup_hash)
        .bind(&task.group_key)
        .bind(task.analysis_minute)
        .bind(i64::from(task.cluster_level))
        .bind(&task.group_name)
        .bind(task.analysis_type.as_str())
        .bind(task.service_guard)
        .bind(task.experiment_name.as_deref().unwrap_or(""))
        .bind(&task.api_version)
        .bind(task.status.as_str())
        .bind(i64::from(task.retry_count))
        .bind(i64::from(task.priority))
        .bind(task.created_at.timestamp_millis())
        .bind(task.last_updated_at.timestamp_millis())
        .bind(task.lease_timeout.num_milliseconds())
        .bind(task.valid_until.timestamp_millis())
        .bind(gate_preceding_windows)
        .execute(&self.pool)
        .await?;

        if inserted.rows_affected() == 1 {
            return Ok(EnqueueOutcome::Enqueued(task.clone()));
        }
        if self.has_hash(&dedup_hash).await? {
            Ok(EnqueueOutcome::AlreadyExists)
        } else {
            Ok(EnqueueOutcome::PrecedingWindowPending)
        }
    }

    async fn claim_next(&self, query: &ClaimQuery) -> Result<Option<AnalysisTask>, StoreError> {
        let now_ms = query.now.timestamp_millis();
        let mut builder = QueryBuilder::<Sqlite>::new(
            "UPDATE analysis_tasks SET status = 'running', retry_count = retry_count + 1, last_updated_at_ms = ",
        );
        builder.push_bind(now_ms);
        builder.push(" WHERE seq = (SELECT seq FROM analysis_tasks WHERE kind = ");
        builder.push_bind(query.kind.as_str());
        builder.push(" AND api_version = ");
        builder.push_bind(query.api_version.as_str());
        builder.push(" AND valid_until_ms > ");
        builder.push_bind(now_ms);
        builder.push(" AND retry_count < ");
        builder.push_bind(i64::from(query.max_retries));
        builder.push(" AND (status = 'queued' OR (status = 'running' AND last_updated_at_ms + lease_timeout_ms < ");
        builder.push_bind(now_ms);
        builder.push("))");
        if let Some(service_guard) = query.filter.service_guard {
            builder.push(" AND service_guard = ");
            builder.push_bind(service_guard);
        }
        if let Some(experiment_name) = query.filter.experiment_name.as_deref() {
            builder.push(" AND experiment_name = ");
            builder.push_bind(experiment_name);
        }
        if !query.filter.analysis_types.is_empty() {
            builder.push(" AND analysis_type IN (");
            let mut separated = builder.separated(", ");
            for analysis_type in &query.filter.analysis_types {
                separated.push_bind(analysis_type.as_str());
            }
            separated.push_unseparated(")");
        }
        builder.push(" ORDER BY priority ASC, created_at_ms ASC, seq ASC LIMIT 1) RETURNING ");
        builder.push(TASK_COLUMNS);

        let row: Option<TaskRow> = builder
            .build_query_as()
            .fetch_optional(&self.pool)
            .await?;
        row.map(TaskRow::into_task).transpose()
    }

    async fn complete(
        &self,
        task_id: Uuid,
        status: TaskStatus,
        now: DateTime<Utc>,
    ) -> Result<Option<CompleteOutcome>, StoreError> {
        let sql = format!(
            "UPDATE analysis_tasks SET status = ?1, last_updated_at_ms = ?2 \
             WHERE id = ?3 AND status IN ('queued', 'running') RETURNING {TASK_COLUMNS}"
        );
        let row: Option<TaskRow> = sqlx::query_as(&sql)
            .bind(status.as_str())
            .bind(now.timestamp_millis())
            .bind(task_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        if let Some(row) = row {
            return Ok(Some(CompleteOutcome::Completed(row.into_task()?)));
        }
        Ok(self
            .get(task_id)
            .await?
            .map(|existing| CompleteOutcome::AlreadyTerminal(existing.status)))
    }

    async fn record_failure(
        &self,
        task_id: Uuid,
        error: &TaskError,
        max_retries: u32,
        now: DateTime<Utc>,
    ) -> Result<Option<FailureOutcome>, StoreError> {
        let exhausted = TaskError::retry_budget_exhausted(Some(error));
        let sql = format!(
            r#"
            UPDATE analysis_tasks
            SET status = CASE WHEN retry_count >= ?1 THEN 'failed' ELSE 'queued' END,
                error_code = CASE WHEN retry_count >= ?1 THEN ?2 ELSE ?3 END,
                error = CASE WHEN retry_count >= ?1 THEN ?4 ELSE ?5 END,
                last_updated_at_ms = ?6
            WHERE id = ?7 AND status = 'running'
            RETURNING {TASK_COLUMNS}
            "#
        );
        let row: Option<TaskRow> = sqlx::query_as(&sql)
            .bind(i64::from(max_retries))
            .bind(&exhausted.code)
            .bind(&error.code)
            .bind(serde_json::to_string(&exhausted)?)
            .bind(serde_json::to_string(error)?)
            .bind(now.timestamp_millis())
            .bind(task_id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let task = row.into_task()?;
                if task.status == TaskStatus::Failed {
                    Ok(Some(FailureOutcome::RetryBudgetExhausted(task)))
                } else {
                    Ok(Some(FailureOutcome::Requeued(task)))
                }
            }
            None => Ok(self
                .get(task_id)
                .await?
                .map(|existing| FailureOutcome::NotRunning(existing.status))),
        }
    }

    async fn get(&self, task_id: Uuid) -> Result<Option<AnalysisTask>, StoreError> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM analysis_tasks WHERE id = ?1");
        let row: Option<TaskRow> = sqlx::query_as(&sql)
            .bind(task_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(TaskRow::into_task).transpose()
    }

    async fn list_group(&self, group_key: &str) -> Result<Vec<AnalysisTask>, StoreError> {
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM analysis_tasks WHERE group_key = ?1 ORDER BY analysis_minute, seq"
        );
        let rows: Vec<TaskRow> = sqlx::query_as(&sql)
            .bind(group_key)
            .fetch_all(&self.pool)
            .await?;
        into_tasks(rows)
    }

    async fn expire_overdue(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE analysis_tasks
            SET status = 'expired', last_updated_at_ms = ?1
            WHERE status IN ('queued', 'running') AND valid_until_ms <= ?1
            "#,
        )
        .bind(now.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn sweep_exhausted(&self, max_retries: u32, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let exhausted = TaskError::retry_budget_exhausted(None);
        let result = sqlx::query(
            r#"
            UPDATE analysis_tasks
            SET status = 'failed', error_code = ?1, error = ?2, last_updated_at_ms = ?3
            WHERE retry_count >= ?4
              AND valid_until_ms > ?3
              AND (
                status = 'queued'
                OR (status = 'running' AND last_updated_at_ms + lease_timeout_ms < ?3)
              )
            "#,
        )
        .bind(&exhausted.code)
        .bind(serde_json::to_string(&exhausted)?)
        .bind(now.timestamp_millis())
        .bind(i64::from(max_retries))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn stats(&self, max_retries: u32) -> Result<QueueStats, StoreError> {
        let counts: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM analysis_tasks GROUP BY status")
                .fetch_all(&self.pool)
                .await?;
        let mut stats = QueueStats::default();
        for (status, count) in counts {
            let status: TaskStatus = status.parse().map_err(StoreError::Corrupt)?;
            stats.add_status(status, u64::try_from(count).unwrap_or_default());
        }

        let (exhausted,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM analysis_tasks
            WHERE (status IN ('queued', 'running') AND retry_count >= ?1)
               OR (status = 'failed' AND error_code = ?2)
            "#,
        )
        .bind(i64::from(max_retries))
        .bind(RETRY_BUDGET_EXHAUSTED)
        .fetch_one(&self.pool)
        .await?;
        stats.retry_exhausted = u64::try_from(exhausted).unwrap_or_default();
        Ok(stats)
    }
}
