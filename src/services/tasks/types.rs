use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Error code recorded on tasks that ran out of retries.
pub const RETRY_BUDGET_EXHAUSTED: &str = "retry_budget_exhausted";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Running,
    Success,
    Failed,
    Expired,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Success => "success",
            TaskStatus::Failed => "failed",
            TaskStatus::Expired => "expired",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Success | TaskStatus::Failed | TaskStatus::Expired
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "queued" => Ok(TaskStatus::Queued),
            "running" => Ok(TaskStatus::Running),
            "success" => Ok(TaskStatus::Success),
            "failed" => Ok(TaskStatus::Failed),
            "expired" => Ok(TaskStatus::Expired),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Primary,
    Experimental,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Primary => "primary",
            TaskKind::Experimental => "experimental",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "primary" => Ok(TaskKind::Primary),
            "experimental" => Ok(TaskKind::Experimental),
            other => Err(format!("unknown task kind: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisType {
    TimeSeries,
    LogMl,
    LogCluster,
    FeedbackAnalysis,
}

impl AnalysisType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisType::TimeSeries => "time_series",
            AnalysisType::LogMl => "log_ml",
            AnalysisType::LogCluster => "log_cluster",
            AnalysisType::FeedbackAnalysis => "feedback_analysis",
        }
    }
}

impl fmt::Display for AnalysisType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AnalysisType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "time_series" => Ok(AnalysisType::TimeSeries),
            "log_ml" => Ok(AnalysisType::LogMl),
            "log_cluster" => Ok(AnalysisType::LogCluster),
            "feedback_analysis" => Ok(AnalysisType::FeedbackAnalysis),
            other => Err(format!("unknown analysis type: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskError {
    pub code: String,
    pub message: String,
}

impl TaskError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn retry_budget_exhausted(last: Option<&TaskError>) -> Self {
        let message = match last {
            Some(last) => format!("retry budget exhausted; last error {}: {}", last.code, last.message),
            None => "retry budget exhausted; lease expired without completion".to_string(),
        };
        Self::new(RETRY_BUDGET_EXHAUSTED, message)
    }

    pub fn is_retry_budget_exhausted(&self) -> bool {
        self.code == RETRY_BUDGET_EXHAUSTED
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisTask {
    pub id: Uuid,
    pub kind: TaskKind,
    pub group_key: String,
    pub analysis_minute: i64,
    pub cluster_level: i32,
    pub group_name: String,
    pub analysis_type: AnalysisType,
    pub service_guard: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub experiment_name: Option<String>,
    pub api_version: String,
    pub status: TaskStatus,
    pub retry_count: u32,
    pub priority: i32,
    pub created_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
    #[serde(with = "duration_ms")]
    pub lease_timeout: Duration,
    pub valid_until: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,
}

impl AnalysisTask {
    pub fn dedup_hash(&self) -> String {
        dedup_hash_hex(&DedupKey {
            kind: self.kind,
            group_key: &self.group_key,
            analysis_minute: self.analysis_minute,
            cluster_level: self.cluster_level,
            group_name: &self.group_name,
            analysis_type: self.analysis_type,
            api_version: &self.api_version,
            experiment_name: self.experiment_name.as_deref(),
        })
    }

    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Running && self.last_updated_at + self.lease_timeout < now
    }

    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.valid_until > now
    }

    /// Tasks a later window of the same series must wait behind.
    pub fn blocks_window(&self, other: &AnalysisTask) -> bool {
        matches!(self.status, TaskStatus::Queued | TaskStatus::Running)
            && self.kind == other.kind
            && self.group_key == other.group_key
            && self.cluster_level == other.cluster_level
            && self.group_name == other.group_name
            && self.analysis_type == other.analysis_type
            && self.api_version == other.api_version
            && self.analysis_minute <= other.analysis_minute
    }

    /// Claim eligibility: queued or abandoned, within budget, not past TTL,
    /// and matching the caller's filter.
    pub fn is_claimable(&self, query: &ClaimQuery) -> bool {
        let available = self.status == TaskStatus::Queued || self.lease_expired(query.now);
        available
            && self.kind == query.kind
            && self.api_version == query.api_version
            && self.is_live(query.now)
            && self.retry_count < query.max_retries
            && query.filter.matches(self)
    }
}

mod duration_ms {
    use chrono::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(value.num_milliseconds())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let millis = i64::deserialize(deserializer)?;
        Ok(Duration::milliseconds(millis))
    }
}

struct DedupKey<'a> {
    kind: TaskKind,
    group_key: &'a str,
    analysis_minute: i64,
    cluster_level: i32,
    group_name: &'a str,
    analysis_type: AnalysisType,
    api_version: &'a str,
    experiment_name: Option<&'a str>,
}

fn dedup_hash_hex(key: &DedupKey<'_>) -> String {
    use sha2::Digest;
    use std::fmt::Write;
    let mut hasher = sha2::Sha256::new();
    for part in [
        key.kind.as_str(),
        key.group_key,
        &key.analysis_minute.to_string(),
        &key.cluster_level.to_string(),
        key.group_name,
        key.analysis_type.as_str(),
        key.api_version,
        key.experiment_name.unwrap_or(""),
    ] {
        hasher.update(part.as_bytes());
        hasher.update([0x1f]);
    }
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(&mut out, "{:02x}", byte);
    }
    out
}

/// What a producer supplies. Everything else is stamped by the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisTaskRequest {
    #[serde(default = "default_kind")]
    pub kind: TaskKind,
    pub group_key: String,
    pub analysis_minute: i64,
    #[serde(default)]
    pub cluster_level: i32,
    pub group_name: String,
    #[serde(default = "default_analysis_type")]
    pub analysis_type: AnalysisType,
    #[serde(default)]
    pub service_guard: bool,
    #[serde(default)]
    pub experiment_name: Option<String>,
    pub api_version: String,
    #[serde(default)]
    pub priority: Option<i32>,
}

fn default_kind() -> TaskKind {
    TaskKind::Primary
}

fn default_analysis_type() -> AnalysisType {
    AnalysisType::TimeSeries
}

impl AnalysisTaskRequest {
    pub fn new(
        group_key: impl Into<String>,
        analysis_minute: i64,
        group_name: impl Into<String>,
        api_version: impl Into<String>,
    ) -> Self {
        Self {
            kind: TaskKind::Primary,
            group_key: group_key.into(),
            analysis_minute,
            cluster_level: 0,
            group_name: group_name.into(),
            analysis_type: AnalysisType::TimeSeries,
            service_guard: false,
            experiment_name: None,
            api_version: api_version.into(),
            priority: None,
        }
    }

    pub fn experimental(mut self, experiment_name: impl Into<String>) -> Self {
        self.kind = TaskKind::Experimental;
        self.experiment_name = Some(experiment_name.into());
        self
    }

    pub fn with_analysis_type(mut self, analysis_type: AnalysisType) -> Self {
        self.analysis_type = analysis_type;
        self
    }

    pub fn with_cluster_level(mut self, cluster_level: i32) -> Self {
        self.cluster_level = cluster_level;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn service_guard(mut self, service_guard: bool) -> Self {
        self.service_guard = service_guard;
        self
    }
}

/// Worker-side selection criteria. An empty type list accepts any type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimFilter {
    #[serde(default)]
    pub service_guard: Option<bool>,
    #[serde(default)]
    pub analysis_types: Vec<AnalysisType>,
    #[serde(default)]
    pub experiment_name: Option<String>,
}

impl ClaimFilter {
    pub fn matches(&self, task: &AnalysisTask) -> bool {
        if self
            .service_guard
            .is_some_and(|service_guard| service_guard != task.service_guard)
        {
            return false;
        }
        if !self.analysis_types.is_empty() && !self.analysis_types.contains(&task.analysis_type) {
            return false;
        }
        match &self.experiment_name {
            Some(name) => task.experiment_name.as_deref() == Some(name.as_str()),
            None => true,
        }
    }
}

/// Fully resolved claim request handed to a store.
#[derive(Debug, Clone)]
pub struct ClaimQuery {
    pub kind: TaskKind,
    pub api_version: String,
    pub filter: ClaimFilter,
    pub max_retries: u32,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum EnqueueOutcome {
    Enqueued(AnalysisTask),
    AlreadyExists,
    PrecedingWindowPending,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum CompleteOutcome {
    Completed(AnalysisTask),
    AlreadyTerminal(TaskStatus),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum FailureOutcome {
    Requeued(AnalysisTask),
    RetryBudgetExhausted(AnalysisTask),
    NotRunning(TaskStatus),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub queued: u64,
    pub running: u64,
    pub success: u64,
    pub failed: u64,
    pub expired: u64,
    /// Tasks failed for lack of retries, plus live tasks already at the limit.
    pub retry_exhausted: u64,
}

impl QueueStats {
    pub fn add_status(&mut self, status: TaskStatus, count: u64) {
        match status {
            TaskStatus::Queued => self.queued += count,
            TaskStatus::Running => self.running += count,
            TaskStatus::Success => self.success += count,
            TaskStatus::Failed => self.failed += count,
            TaskStatus::Expired => self.expired += count,
        }
    }

    pub fn total(&self) -> u64 {
        self.queued + self.running + self.success + self.failed + self.expired
    }
}

pub fn millis_to_datetime(millis: i64) -> Option<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(millis)
}
