use super::types::{
    AlertDirection, ComparisonStrategy, DataSummary, MetricDefinition, RiskLevel, Threshold,
};
use crate::error::ThresholdConfigError;
use std::collections::HashSet;

/// Control values below this are treated as "no baseline" for ratios.
pub const RATIO_EPSILON: f64 = 1e-9;

/// Risk for one metric in one window. Incomplete data on either side is
/// `Na`; a definition without thresholds is informational and always `Low`.
pub fn evaluate(definition: &MetricDefinition, control: &DataSummary, test: &DataSummary) -> RiskLevel {
    if !control.is_comparable() || !test.is_comparable() {
        return RiskLevel::Na;
    }
    evaluate_values(definition, control.value, test.value)
}

/// Worst risk across every configured threshold pair.
pub fn evaluate_values(definition: &MetricDefinition, control: f64, test: f64) -> RiskLevel {
    if definition.thresholds.is_empty() {
        return RiskLevel::Low;
    }
    definition
        .thresholds
        .iter()
        .map(|threshold| classify(threshold, control, test))
        .max()
        .unwrap_or(RiskLevel::Na)
}

pub fn classify(threshold: &Threshold, control: f64, test: f64) -> RiskLevel {
    if !control.is_finite() || !test.is_finite() {
        return RiskLevel::Na;
    }
    match threshold.strategy {
        ComparisonStrategy::Ratio => {
            if control.abs() < RATIO_EPSILON {
                return RiskLevel::Na;
            }
            let ratio = test / control;
            match threshold.direction {
                AlertDirection::AlertWhenHigher => grade_rising(ratio, threshold),
                AlertDirection::AlertWhenLower => grade_falling(ratio, threshold),
            }
        }
        ComparisonStrategy::Delta => {
            let delta = match threshold.direction {
                AlertDirection::AlertWhenHigher => test - control,
                AlertDirection::AlertWhenLower => control - test,
            };
            grade_rising(delta, threshold)
        }
    }
}

fn grade_rising(value: f64, threshold: &Threshold) -> RiskLevel {
    if value >= threshold.high_threshold {
        RiskLevel::High
    } else if value >= threshold.medium_threshold {
        RiskLevel::Medium
    } else {
        RiskLevel::Low
    }
}

fn grade_falling(value: f64, threshold: &Threshold) -> RiskLevel {
    if value <= threshold.high_threshold {
        RiskLevel::High
    } else if value <= threshold.medium_threshold {
        RiskLevel::Medium
    } else {
        RiskLevel::Low
    }
}

/// Falling ratios are the only pairs graded with `<=`, so they are the only
/// pairs whose high threshold sits below the medium one.
fn high_below_medium(threshold: &Threshold) -> bool {
    threshold.strategy == ComparisonStrategy::Ratio
        && threshold.direction == AlertDirection::AlertWhenLower
}

impl MetricDefinition {
    pub fn validate(&self) -> Result<(), ThresholdConfigError> {
        let metric_name = self.metric_name.trim();
        if metric_name.is_empty() {
            return Err(ThresholdConfigError::BlankMetricName);
        }

        let mut seen = HashSet::new();
        for threshold in &self.thresholds {
            let (medium, high) = (threshold.medium_threshold, threshold.high_threshold);
            if !medium.is_finite() || !high.is_finite() || medium < 0.0 || high < 0.0 {
                return Err(ThresholdConfigError::InvalidValue {
                    metric_name: metric_name.to_string(),
                });
            }
            if threshold.strategy == ComparisonStrategy::Ratio && (medium <= 0.0 || high <= 0.0) {
                return Err(ThresholdConfigError::NonPositiveRatio {
                    metric_name: metric_name.to_string(),
                });
            }
            if !seen.insert((threshold.strategy, threshold.direction)) {
                return Err(ThresholdConfigError::Duplicate {
                    metric_name: metric_name.to_string(),
                    strategy: threshold.strategy,
                    direction: threshold.direction,
                });
            }
            let ordered = if high_below_medium(threshold) {
                high <= medium
            } else {
                high >= medium
            };
            if !ordered {
                return Err(ThresholdConfigError::SeverityOrder {
                    metric_name: metric_name.to_string(),
                    strategy: threshold.strategy,
                    direction: threshold.direction,
                    medium,
                    high,
                });
            }
        }
        Ok(())
    }
}
