use super::types::{BucketWindow, DataSummary, MetricSample};
use statrs::statistics::Statistics;
use std::collections::{BTreeMap, BTreeSet};

/// Mean of each host's non-null samples inside `window`. Hosts with nothing
/// usable in the window are absent from the map.
pub fn host_means(
    samples: &[MetricSample],
    window: BucketWindow,
    excluded_hosts: &BTreeSet<String>,
) -> BTreeMap<String, f64> {
    let mut per_host: BTreeMap<&str, Vec<f64>> = BTreeMap::new();
    for sample in samples {
        if excluded_hosts.contains(&sample.host) || !window.contains(sample.timestamp_minute) {
            continue;
        }
        let Some(value) = sample.value.filter(|value| value.is_finite()) else {
            continue;
        };
        per_host.entry(sample.host.as_str()).or_default().push(value);
    }

    per_host
        .into_iter()
        .map(|(host, values)| (host.to_string(), values.iter().mean()))
        .collect()
}

/// Summarizes one series for one population. The expected population is
/// every non-excluded host that reported anything for the series, so a host
/// that only sent gaps (or only reported outside the window) marks the
/// bucket as missing data.
pub fn summarize(
    samples: &[MetricSample],
    window: BucketWindow,
    excluded_hosts: &BTreeSet<String>,
) -> DataSummary {
    let population: BTreeSet<String> = samples
        .iter()
        .filter(|sample| !excluded_hosts.contains(&sample.host))
        .map(|sample| sample.host.clone())
        .collect();
    summarize_population(samples, window, &population, excluded_hosts)
}

pub fn summarize_population(
    samples: &[MetricSample],
    window: BucketWindow,
    population: &BTreeSet<String>,
    excluded_hosts: &BTreeSet<String>,
) -> DataSummary {
    let per_host = host_means(samples, window, excluded_hosts);
    if per_host.is_empty() {
        return DataSummary::no_data();
    }

    let missing_data = population
        .iter()
        .filter(|host| !excluded_hosts.contains(*host))
        .any(|host| !per_host.contains_key(host));

    let value = per_host.values().mean();
    DataSummary {
        value,
        node_count: per_host.len(),
        node_list: per_host.into_keys().collect(),
        missing_data,
    }
}
