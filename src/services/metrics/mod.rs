//! Rule-based risk comparison of a test host population against a control
//! population, one analysis window at a time.

pub mod bucket;
pub mod catalog;
pub mod pipeline;
pub mod risk;
pub mod threshold;
pub mod types;

pub use catalog::{MetricCatalog, SortKey, SortOrder};
pub use pipeline::{analyze_window, AnalysisOptions, WindowSamples};
pub use types::{
    BucketWindow, DataSummary, MetricAnalysisResult, MetricDefinition, MetricSample, RiskLevel,
    TransactionRiskSummary, VerificationRiskReport,
};
