use super::bucket::{host_means, summarize_population};
use super::catalog::MetricCatalog;
use super::risk::{aggregate, aggregate_run};
use super::threshold::{evaluate, evaluate_values};
use super::types::{
    BucketWindow, HostAnalysisValue, MetricAnalysisResult, MetricSample, RiskLevel,
    TransactionRiskSummary, VerificationRiskReport,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Raw control and test samples fetched for one analysis window.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WindowSamples {
    #[serde(default)]
    pub control: Vec<MetricSample>,
    #[serde(default)]
    pub test: Vec<MetricSample>,
}

#[derive(Debug, Clone, Default)]
pub struct AnalysisOptions {
    pub excluded_hosts: BTreeSet<String>,
    pub host_breakdown: bool,
    /// Verdicts from the parallel experimental model, keyed by transaction
    /// then metric. Only used to set `mismatch`.
    pub experimental_verdicts: BTreeMap<String, BTreeMap<String, RiskLevel>>,
}

#[derive(Default)]
struct SeriesSamples {
    control: Vec<MetricSample>,
    test: Vec<MetricSample>,
}

/// Runs bucket summary, threshold evaluation and risk aggregation for every
/// (transaction, metric) series in the window. Unknown metrics are skipped
/// and listed on the report.
pub fn analyze_window(
    catalog: &MetricCatalog,
    window: BucketWindow,
    samples: &WindowSamples,
    options: &AnalysisOptions,
) -> VerificationRiskReport {
    let mut series: BTreeMap<(&str, &str), SeriesSamples> = BTreeMap::new();
    for sample in &samples.control {
        series
            .entry((sample.transaction.as_str(), sample.metric_name.as_str()))
            .or_default()
            .control
            .push(sample.clone());
    }
    for sample in &samples.test {
        series
            .entry((sample.transaction.as_str(), sample.metric_name.as_str()))
            .or_default()
            .test
            .push(sample.clone());
    }

    let control_population = populations(&samples.control, &options.excluded_hosts);
    let test_population = populations(&samples.test, &options.excluded_hosts);
    let empty = BTreeSet::new();

    let mut skipped_metrics = BTreeSet::new();
    let mut by_transaction: BTreeMap<&str, Vec<MetricAnalysisResult>> = BTreeMap::new();
    for ((transaction, metric_name), series_samples) in &series {
        let definition = match catalog.definition(metric_name) {
            Ok(definition) => definition,
            Err(err) => {
                tracing::debug!(transaction, error = %err, "skipping unknown metric");
                skipped_metrics.insert(metric_name.to_string());
                continue;
            }
        };

        let control = summarize_population(
            &series_samples.control,
            window,
            control_population.get(transaction).unwrap_or(&empty),
            &options.excluded_hosts,
        );
        let test = summarize_population(
            &series_samples.test,
            window,
            test_population.get(transaction).unwrap_or(&empty),
            &options.excluded_hosts,
        );
        let risk_level = evaluate(definition, &control, &test);

        let host_breakdown = options.host_breakdown.then(|| {
            host_means(&series_samples.test, window, &options.excluded_hosts)
                .into_iter()
                .map(|(host, test_value)| HostAnalysisValue {
                    risk_level: if control.is_comparable() {
                        evaluate_values(definition, control.value, test_value)
                    } else {
                        RiskLevel::Na
                    },
                    host,
                    test_value,
                    control_value: control.value,
                })
                .collect()
        });

        let mismatch = options
            .experimental_verdicts
            .get(*transaction)
            .and_then(|verdicts| verdicts.get(*metric_name))
            .is_some_and(|experimental| *experimental != risk_level);

        by_transaction
            .entry(*transaction)
            .or_default()
            .push(MetricAnalysisResult {
                metric_name: metric_name.to_string(),
                metric_type: definition.metric_type,
                risk_level,
                test_value: test.value,
                control_value: control.value,
                host_breakdown,
                mismatch,
            });
    }

    let transactions: Vec<TransactionRiskSummary> = by_transaction
        .into_iter()
        .map(|(transaction, results)| aggregate(transaction, results, catalog.sort_keys()))
        .collect();
    aggregate_run(transactions, skipped_metrics, catalog.sort_keys())
}

/// Hosts that reported anything for a transaction form its expected
/// population on that side.
fn populations<'a>(
    samples: &'a [MetricSample],
    excluded_hosts: &BTreeSet<String>,
) -> BTreeMap<&'a str, BTreeSet<String>> {
    let mut out: BTreeMap<&str, BTreeSet<String>> = BTreeMap::new();
    for sample in samples {
        if excluded_hosts.contains(&sample.host) {
            continue;
        }
        out.entry(sample.transaction.as_str())
            .or_default()
            .insert(sample.host.clone());
    }
    out
}
