use super::catalog::{SortKey, SortOrder};
use super::types::{
    DataSummary, MetricAnalysisResult, RiskLevel, TransactionRiskSummary, VerificationRiskReport,
};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

/// What the ranking comparator needs to know about a result.
pub trait RankedResult {
    fn rank_risk(&self) -> RiskLevel;

    /// Whether the result carries per-host evidence. A missing breakdown
    /// counts the same as an empty one.
    fn has_host_data(&self) -> bool;

    fn sort_key_value(&self, metric_name: &str) -> Option<f64>;

    fn rank_name(&self) -> &str;
}

impl RankedResult for MetricAnalysisResult {
    fn rank_risk(&self) -> RiskLevel {
        self.risk_level
    }

    fn has_host_data(&self) -> bool {
        self.host_breakdown
            .as_ref()
            .is_some_and(|hosts| !hosts.is_empty())
    }

    fn sort_key_value(&self, metric_name: &str) -> Option<f64> {
        (self.metric_name == metric_name && self.test_value != DataSummary::NO_DATA)
            .then_some(self.test_value)
    }

    fn rank_name(&self) -> &str {
        &self.metric_name
    }
}

impl RankedResult for TransactionRiskSummary {
    fn rank_risk(&self) -> RiskLevel {
        self.overall_risk
    }

    fn has_host_data(&self) -> bool {
        !self.host_risks.is_empty()
    }

    fn sort_key_value(&self, metric_name: &str) -> Option<f64> {
        self.metrics
            .iter()
            .find_map(|metric| metric.sort_key_value(metric_name))
    }

    fn rank_name(&self) -> &str {
        &self.group_name
    }
}

/// Total order used for display and gating: worst risk first, then results
/// with host evidence, then catalog sort keys, then name.
pub fn compare_ranked<T: RankedResult>(a: &T, b: &T, sort_keys: &[SortKey]) -> Ordering {
    b.rank_risk()
        .cmp(&a.rank_risk())
        .then_with(|| b.has_host_data().cmp(&a.has_host_data()))
        .then_with(|| compare_sort_keys(a, b, sort_keys))
        .then_with(|| a.rank_name().cmp(b.rank_name()))
}

fn compare_sort_keys<T: RankedResult>(a: &T, b: &T, sort_keys: &[SortKey]) -> Ordering {
    for key in sort_keys {
        let ordering = match (
            a.sort_key_value(&key.metric_name),
            b.sort_key_value(&key.metric_name),
        ) {
            (None, None) => continue,
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (Some(left), Some(right)) => match key.order {
                SortOrder::Ascending => left.total_cmp(&right),
                SortOrder::Descending => right.total_cmp(&left),
            },
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

/// Sorts in place. Names are expected to be unique within one list; a
/// duplicate leaves the pair unordered relative to each other, so it is
/// reported instead of being broken arbitrarily.
pub fn rank<T: RankedResult>(results: &mut [T], sort_keys: &[SortKey]) {
    results.sort_by(|a, b| compare_ranked(a, b, sort_keys));
    for pair in results.windows(2) {
        if pair[0].rank_name() == pair[1].rank_name() {
            tracing::warn!(
                name = pair[0].rank_name(),
                "duplicate name in ranked results; ordering between them is not total"
            );
        }
    }
}

pub fn aggregate(
    group_name: impl Into<String>,
    mut results: Vec<MetricAnalysisResult>,
    sort_keys: &[SortKey],
) -> TransactionRiskSummary {
    let overall_risk = results
        .iter()
        .map(|result| result.risk_level)
        .max()
        .unwrap_or(RiskLevel::Na);

    let mut host_risks: BTreeMap<String, RiskLevel> = BTreeMap::new();
    for host in results
        .iter()
        .filter_map(|result| result.host_breakdown.as_ref())
        .flatten()
    {
        host_risks
            .entry(host.host.clone())
            .and_modify(|risk| *risk = (*risk).max(host.risk_level))
            .or_insert(host.risk_level);
    }

    rank(&mut results, sort_keys);
    TransactionRiskSummary {
        group_name: group_name.into(),
        metrics: results,
        overall_risk,
        host_risks,
    }
}

/// Rolls transactions up into one run-level report.
pub fn aggregate_run(
    mut transactions: Vec<TransactionRiskSummary>,
    skipped_metrics: BTreeSet<String>,
    sort_keys: &[SortKey],
) -> VerificationRiskReport {
    let overall_risk = transactions
        .iter()
        .map(|summary| summary.overall_risk)
        .max()
        .unwrap_or(RiskLevel::Na);
    let mismatch_count = transactions
        .iter()
        .flat_map(|summary| summary.metrics.iter())
        .filter(|metric| metric.mismatch)
        .count();
    rank(&mut transactions, sort_keys);
    VerificationRiskReport {
        transactions,
        overall_risk,
        skipped_metrics: skipped_metrics.into_iter().collect(),
        mismatch_count,
    }
}
