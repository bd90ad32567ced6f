use crate::services::metrics::types::{AlertDirection, ComparisonStrategy};
use crate::services::tasks::types::TaskStatus;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown metric: {metric_name}")]
pub struct UnknownMetricError {
    pub metric_name: String,
}

/// Rejected metric definitions. Raised when a catalog is built or overridden,
/// never during evaluation.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ThresholdConfigError {
    #[error("metric name must not be blank")]
    BlankMetricName,
    #[error("metric {metric_name}: threshold values must be finite and non-negative")]
    InvalidValue { metric_name: String },
    #[error("metric {metric_name}: ratio thresholds must be greater than zero")]
    NonPositiveRatio { metric_name: String },
    #[error("metric {metric_name}: more than one {strategy} threshold for {direction}")]
    Duplicate {
        metric_name: String,
        strategy: ComparisonStrategy,
        direction: AlertDirection,
    },
    #[error(
        "metric {metric_name}: high threshold {high} is less severe than medium threshold {medium} ({strategy}, {direction})"
    )]
    SeverityOrder {
        metric_name: String,
        strategy: ComparisonStrategy,
        direction: AlertDirection,
        medium: f64,
        high: f64,
    },
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("task store query failed: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("task store payload could not be serialized: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("corrupt task record: {0}")]
    Corrupt(String),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Sqlx(_))
    }
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("analysis task {0} not found")]
    TaskNotFound(Uuid),
    #[error("analysis tasks can only be completed as success or failed (got {0})")]
    InvalidCompletionStatus(TaskStatus),
    #[error("analysis task {0} was handed to more than one claimer")]
    ClaimRaceViolation(Uuid),
    #[error("task ttl of {0} runs past the latest representable deadline")]
    TtlOverflow(chrono::Duration),
}

impl QueueError {
    /// Transient store failures may be retried by the caller; everything else
    /// is a caller or invariant error.
    pub fn is_retryable(&self) -> bool {
        match self {
            QueueError::Store(err) => err.is_retryable(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threshold_errors_name_the_metric() {
        let err = ThresholdConfigError::Duplicate {
            metric_name: "error".to_string(),
            strategy: ComparisonStrategy::Ratio,
            direction: AlertDirection::AlertWhenHigher,
        };
        let message = err.to_string();
        assert!(message.contains("error"));
        assert!(message.contains("RATIO"));
        assert!(message.contains("ALERT_WHEN_HIGHER"));
    }

    #[test]
    fn only_store_failures_are_retryable() {
        let corrupt = QueueError::Store(StoreError::Corrupt("bad kind".to_string()));
        assert!(!corrupt.is_retryable());
        let db = QueueError::Store(StoreError::Sqlx(sqlx::Error::PoolTimedOut));
        assert!(db.is_retryable());
        assert!(!QueueError::TaskNotFound(Uuid::nil()).is_retryable());
        assert!(!QueueError::InvalidCompletionStatus(TaskStatus::Queued).is_retryable());
        assert!(!QueueError::TtlOverflow(chrono::Duration::hours(1)).is_retryable());
    }
}
