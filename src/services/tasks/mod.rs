//! Durable, deduplicated queue of per-window analysis tasks and the worker
//! that drains it.

pub mod clock;
pub mod files;
pub mod queue;
pub mod runner;
pub mod sqlite;
pub mod store;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use queue::{AnalysisTaskQueue, QueueConfig, QueueMetrics, TaskPolicy};
pub use runner::{AnalysisWorker, ResultSink, SampleSource, TaskRunOutcome, WorkerConfig};
pub use sqlite::SqliteTaskStore;
pub use store::{MemoryTaskStore, TaskStore};
pub use types::{
    AnalysisTask, AnalysisTaskRequest, AnalysisType, ClaimFilter, CompleteOutcome,
    EnqueueOutcome, FailureOutcome, QueueStats, TaskError, TaskKind, TaskStatus,
};
