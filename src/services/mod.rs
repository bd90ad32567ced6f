pub mod metrics;
pub mod tasks;
