use super::types::{AlertDirection, ComparisonStrategy, MetricDefinition, MetricType, Threshold};
use crate::error::{ThresholdConfigError, UnknownMetricError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::types::AlertDirection::{AlertWhenHigher as Higher, AlertWhenLower as Lower};
use super::types::ComparisonStrategy::{Delta, Ratio};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    Ascending,
    Descending,
}

/// A metric whose test value breaks ranking ties, in the given order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortKey {
    pub metric_name: String,
    pub order: SortOrder,
}

impl SortKey {
    pub fn new(metric_name: impl Into<String>, order: SortOrder) -> Self {
        Self {
            metric_name: metric_name.into(),
            order,
        }
    }
}

type BuiltinThreshold = (ComparisonStrategy, AlertDirection, f64, f64);

const THROUGHPUT_DEFAULTS: &[BuiltinThreshold] = &[(Ratio, Lower, 0.8, 0.5), (Delta, Lower, 20.0, 50.0)];
const RESPONSE_TIME_DEFAULTS: &[BuiltinThreshold] =
    &[(Ratio, Higher, 1.2, 1.5), (Delta, Higher, 20.0, 50.0)];
const ERROR_RATE_DEFAULTS: &[BuiltinThreshold] =
    &[(Ratio, Higher, 1.5, 2.0), (Delta, Higher, 0.01, 0.05)];
const APDEX_DEFAULTS: &[BuiltinThreshold] = &[(Ratio, Lower, 0.8, 0.6), (Delta, Lower, 0.05, 0.1)];

const BUILTIN_METRICS: &[(&str, MetricType, &[BuiltinThreshold])] = &[
    // New Relic
    ("requestsPerMinute", MetricType::Throughput, THROUGHPUT_DEFAULTS),
    ("averageResponseTime", MetricType::RespTime, RESPONSE_TIME_DEFAULTS),
    ("error", MetricType::Error, ERROR_RATE_DEFAULTS),
    ("apdexScore", MetricType::Apdex, APDEX_DEFAULTS),
    ("callCount", MetricType::Count, &[]),
    // AppDynamics
    ("Calls per Minute", MetricType::Throughput, THROUGHPUT_DEFAULTS),
    ("Average Response Time (ms)", MetricType::RespTime, RESPONSE_TIME_DEFAULTS),
    (
        "Errors per Minute",
        MetricType::Error,
        &[(Ratio, Higher, 1.5, 2.0), (Delta, Higher, 1.0, 5.0)],
    ),
    ("Stall Count", MetricType::Count, &[]),
    // Dynatrace
    ("requestsPerMin", MetricType::Throughput, THROUGHPUT_DEFAULTS),
    ("responseTime", MetricType::RespTime, RESPONSE_TIME_DEFAULTS),
    ("serverSideFailureRate", MetricType::Error, ERROR_RATE_DEFAULTS),
    ("clientSideFailureRate", MetricType::Error, ERROR_RATE_DEFAULTS),
];

const BUILTIN_SORT_KEYS: &[(&str, SortOrder)] = &[
    ("requestsPerMinute", SortOrder::Descending),
    ("averageResponseTime", SortOrder::Descending),
    ("error", SortOrder::Descending),
    ("apdexScore", SortOrder::Ascending),
    ("Calls per Minute", SortOrder::Descending),
    ("requestsPerMin", SortOrder::Descending),
];

/// Registry of known provider metrics. Built once and shared read-only.
#[derive(Debug, Clone)]
pub struct MetricCatalog {
    definitions: HashMap<String, MetricDefinition>,
    sort_keys: Vec<SortKey>,
}

impl MetricCatalog {
    pub fn new(
        definitions: Vec<MetricDefinition>,
        sort_keys: Vec<SortKey>,
    ) -> Result<Self, ThresholdConfigError> {
        let mut by_name = HashMap::with_capacity(definitions.len());
        for definition in definitions {
            definition.validate()?;
            by_name.insert(definition.metric_name.trim().to_string(), definition);
        }
        Ok(Self {
            definitions: by_name,
            sort_keys,
        })
    }

    /// Provider defaults for New Relic, AppDynamics and Dynatrace.
    pub fn builtin() -> Self {
        let definitions = BUILTIN_METRICS
            .iter()
            .map(|(name, metric_type, thresholds)| {
                let definition = MetricDefinition {
                    metric_name: (*name).to_string(),
                    metric_type: *metric_type,
                    thresholds: thresholds
                        .iter()
                        .map(|(strategy, direction, medium, high)| {
                            Threshold::new(*strategy, *direction, *medium, *high)
                        })
                        .collect(),
                };
                ((*name).to_string(), definition)
            })
            .collect();
        let sort_keys = BUILTIN_SORT_KEYS
            .iter()
            .map(|(name, order)| SortKey::new(*name, *order))
            .collect();
        Self {
            definitions,
            sort_keys,
        }
    }

    /// Replaces (or adds) definitions by metric name. Every override is
    /// validated before any of them is applied.
    pub fn with_overrides(
        mut self,
        overrides: Vec<MetricDefinition>,
    ) -> Result<Self, ThresholdConfigError> {
        for definition in &overrides {
            definition.validate()?;
        }
        for definition in overrides {
            self.definitions
                .insert(definition.metric_name.trim().to_string(), definition);
        }
        Ok(self)
    }

    pub fn resolve(&self, raw_metric_name: &str) -> Result<MetricType, UnknownMetricError> {
        self.definition(raw_metric_name)
            .map(|definition| definition.metric_type)
    }

    pub fn definition(&self, raw_metric_name: &str) -> Result<&MetricDefinition, UnknownMetricError> {
        self.definitions
            .get(raw_metric_name.trim())
            .ok_or_else(|| UnknownMetricError {
                metric_name: raw_metric_name.to_string(),
            })
    }

    pub fn sort_keys(&self) -> &[SortKey] {
        &self.sort_keys
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    pub fn metric_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.definitions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl Default for MetricCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_definitions_pass_validation() {
        let catalog = MetricCatalog::builtin();
        for name in catalog.metric_names() {
            let definition = catalog.definition(name).expect("builtin definition");
            definition
                .validate()
                .unwrap_or_else(|err| panic!("{name} failed validation: {err}"));
        }
        assert_eq!(catalog.len(), BUILTIN_METRICS.len());
    }

    #[test]
    fn resolve_maps_provider_names() {
        let catalog = MetricCatalog::builtin();
        assert_eq!(
            catalog.resolve("requestsPerMinute"),
            Ok(MetricType::Throughput)
        );
        assert_eq!(catalog.resolve(" apdexScore "), Ok(MetricType::Apdex));
        assert_eq!(
            catalog.resolve("Errors per Minute"),
            Ok(MetricType::Error)
        );
    }

    #[test]
    fn unknown_metric_is_an_error() {
        let catalog = MetricCatalog::builtin();
        let err = catalog.resolve("gcPauseTime").unwrap_err();
        assert_eq!(err.metric_name, "gcPauseTime");
    }

    #[test]
    fn sort_keys_lead_with_request_rate() {
        let catalog = MetricCatalog::builtin();
        let keys = catalog.sort_keys();
        assert_eq!(keys[0], SortKey::new("requestsPerMinute", SortOrder::Descending));
        assert_eq!(keys[3], SortKey::new("apdexScore", SortOrder::Ascending));
    }

    #[test]
    fn overrides_replace_defaults() {
        let catalog = MetricCatalog::builtin()
            .with_overrides(vec![MetricDefinition {
                metric_name: "error".to_string(),
                metric_type: MetricType::Error,
                thresholds: vec![Threshold::new(Delta, Higher, 0.5, 1.0)],
            }])
            .expect("valid override");
        let definition = catalog.definition("error").expect("error metric");
        assert_eq!(definition.thresholds.len(), 1);
        assert_eq!(definition.thresholds[0].medium_threshold, 0.5);
    }

    #[test]
    fn invalid_override_leaves_nothing_applied() {
        let result = MetricCatalog::builtin().with_overrides(vec![
            MetricDefinition {
                metric_name: "customLatency".to_string(),
                metric_type: MetricType::RespTime,
                thresholds: vec![Threshold::new(Ratio, Higher, 1.2, 1.5)],
            },
            MetricDefinition {
                metric_name: "error".to_string(),
                metric_type: MetricType::Error,
                thresholds: vec![Threshold::new(Ratio, Higher, 2.0, 1.5)],
            },
        ]);
        assert!(matches!(
            result,
            Err(ThresholdConfigError::SeverityOrder { .. })
        ));
    }

    #[test]
    fn new_rejects_invalid_definitions() {
        let result = MetricCatalog::new(
            vec![MetricDefinition {
                metric_name: "  ".to_string(),
                metric_type: MetricType::Count,
                thresholds: Vec::new(),
            }],
            Vec::new(),
        );
        assert_eq!(result.unwrap_err(), ThresholdConfigError::BlankMetricName);
    }
}
