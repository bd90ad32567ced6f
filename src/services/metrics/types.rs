use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Ordered severity. `Na` sorts below every real level so "maximum risk"
/// ignores it whenever any comparison produced a verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskLevel {
    Na,
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            RiskLevel::Na => "NA",
            RiskLevel::Low => "LOW",
            RiskLevel::Medium => "MEDIUM",
            RiskLevel::High => "HIGH",
        }
    }

    /// Numeric code used by downstream consumers (-1 for NA).
    pub fn risk_code(self) -> i32 {
        match self {
            RiskLevel::Na => -1,
            RiskLevel::Low => 0,
            RiskLevel::Medium => 1,
            RiskLevel::High => 2,
        }
    }

    pub fn from_risk_code(code: i32) -> Option<Self> {
        match code {
            -1 => Some(RiskLevel::Na),
            0 => Some(RiskLevel::Low),
            1 => Some(RiskLevel::Medium),
            2 => Some(RiskLevel::High),
            _ => None,
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MetricType {
    Throughput,
    RespTime,
    Error,
    Apdex,
    Count,
}

impl MetricType {
    pub fn as_str(self) -> &'static str {
        match self {
            MetricType::Throughput => "THROUGHPUT",
            MetricType::RespTime => "RESP_TIME",
            MetricType::Error => "ERROR",
            MetricType::Apdex => "APDEX",
            MetricType::Count => "COUNT",
        }
    }
}

impl fmt::Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ComparisonStrategy {
    Ratio,
    Delta,
}

impl fmt::Display for ComparisonStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ComparisonStrategy::Ratio => "RATIO",
            ComparisonStrategy::Delta => "DELTA",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertDirection {
    AlertWhenHigher,
    AlertWhenLower,
}

impl fmt::Display for AlertDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AlertDirection::AlertWhenHigher => "ALERT_WHEN_HIGHER",
            AlertDirection::AlertWhenLower => "ALERT_WHEN_LOWER",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Threshold {
    pub strategy: ComparisonStrategy,
    pub direction: AlertDirection,
    pub medium_threshold: f64,
    pub high_threshold: f64,
}

impl Threshold {
    pub fn new(
        strategy: ComparisonStrategy,
        direction: AlertDirection,
        medium_threshold: f64,
        high_threshold: f64,
    ) -> Self {
        Self {
            strategy,
            direction,
            medium_threshold,
            high_threshold,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricDefinition {
    pub metric_name: String,
    pub metric_type: MetricType,
    #[serde(default)]
    pub thresholds: Vec<Threshold>,
}

/// One observation. `value: None` is a gap reported by the provider and is
/// skipped during aggregation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    #[serde(default)]
    pub transaction: String,
    pub metric_name: String,
    pub host: String,
    pub timestamp_minute: i64,
    #[serde(default)]
    pub value: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSummary {
    pub value: f64,
    pub node_count: usize,
    pub node_list: Vec<String>,
    pub missing_data: bool,
}

impl DataSummary {
    /// Sentinel stored in `value` when no host contributed.
    pub const NO_DATA: f64 = -1.0;

    pub fn no_data() -> Self {
        Self {
            value: Self::NO_DATA,
            node_count: 0,
            node_list: Vec::new(),
            missing_data: true,
        }
    }

    pub fn has_value(&self) -> bool {
        self.node_count > 0 && self.value.is_finite()
    }

    /// Only complete summaries take part in threshold comparisons.
    pub fn is_comparable(&self) -> bool {
        self.has_value() && !self.missing_data
    }
}

/// Half-open range of minutes `[start_minute, start_minute + width_minutes)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketWindow {
    pub start_minute: i64,
    pub width_minutes: i64,
}

impl BucketWindow {
    pub fn new(start_minute: i64, width_minutes: i64) -> Self {
        Self {
            start_minute,
            width_minutes: width_minutes.max(1),
        }
    }

    pub fn end_minute(&self) -> i64 {
        self.start_minute.saturating_add(self.width_minutes)
    }

    pub fn contains(&self, minute: i64) -> bool {
        minute >= self.start_minute && minute < self.end_minute()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostAnalysisValue {
    pub host: String,
    pub test_value: f64,
    pub control_value: f64,
    pub risk_level: RiskLevel,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricAnalysisResult {
    pub metric_name: String,
    pub metric_type: MetricType,
    pub risk_level: RiskLevel,
    pub test_value: f64,
    pub control_value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_breakdown: Option<Vec<HostAnalysisValue>>,
    #[serde(default)]
    pub mismatch: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionRiskSummary {
    pub group_name: String,
    pub metrics: Vec<MetricAnalysisResult>,
    pub overall_risk: RiskLevel,
    #[serde(default)]
    pub host_risks: BTreeMap<String, RiskLevel>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationRiskReport {
    pub transactions: Vec<TransactionRiskSummary>,
    pub overall_risk: RiskLevel,
    pub skipped_metrics: Vec<String>,
    pub mismatch_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn risk_levels_are_ordered_with_na_lowest() {
        assert!(RiskLevel::Na < RiskLevel::Low);
        assert!(RiskLevel::Low < RiskLevel::Medium);
        assert!(RiskLevel::Medium < RiskLevel::High);
        let levels = [RiskLevel::Low, RiskLevel::Na, RiskLevel::High, RiskLevel::Medium];
        assert_eq!(levels.iter().copied().max(), Some(RiskLevel::High));
    }

    #[test]
    fn risk_codes_round_trip() {
        for level in [RiskLevel::Na, RiskLevel::Low, RiskLevel::Medium, RiskLevel::High] {
            assert_eq!(RiskLevel::from_risk_code(level.risk_code()), Some(level));
        }
        assert_eq!(RiskLevel::from_risk_code(7), None);
    }

    #[test]
    fn bucket_window_is_half_open() {
        let window = BucketWindow::new(100, 5);
        assert!(window.contains(100));
        assert!(window.contains(104));
        assert!(!window.contains(105));
        assert!(!window.contains(99));
        assert_eq!(BucketWindow::new(3, 0).width_minutes, 1);
    }

    #[test]
    fn definitions_parse_from_json() {
        let raw = r#"{
            "metric_name": "averageResponseTime",
            "metric_type": "RESP_TIME",
            "thresholds": [
                {"strategy": "RATIO", "direction": "ALERT_WHEN_HIGHER", "medium_threshold": 1.2, "high_threshold": 1.5}
            ]
        }"#;
        let definition: MetricDefinition = serde_json::from_str(raw).expect("parse definition");
        assert_eq!(definition.metric_type, MetricType::RespTime);
        assert_eq!(definition.thresholds.len(), 1);
        assert_eq!(definition.thresholds[0].direction, AlertDirection::AlertWhenHigher);
    }
}
