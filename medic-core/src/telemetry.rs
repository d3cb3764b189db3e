//! Metric retrieval for the Investigate/Verify phases and the z-score
//! anomaly detector.

use chrono::{Duration, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::incident::{LogEntry, MetricSeries};
use crate::ports::{LogQuery, MetricQuery, TelemetrySource};

pub const DEFAULT_Z_THRESHOLD: f64 = 2.0;
pub const LAMBDA_NAMESPACE: &str = "AWS/Lambda";
pub const INVESTIGATION_METRICS: [&str; 3] = ["Errors", "Duration", "Throttles"];

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Anomaly {
    pub index: usize,
    pub value: f64,
    pub zscore: f64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AnomalyReport {
    pub has_anomaly: bool,
    pub anomalies: Vec<Anomaly>,
}

/// Flags points whose population z-score exceeds `z_threshold`.
///
/// Series shorter than three points never report an anomaly. A zero standard
/// deviation yields z = 0 for every point.
pub fn analyze_anomalies(series: &MetricSeries, z_threshold: f64) -> AnomalyReport {
    let values = series.values();
    if values.len() < 3 {
        return AnomalyReport::default();
    }
    // A constant series has no outliers; rounding in the mean would
    // otherwise leave a tiny stddev that scores every point.
    if values.iter().all(|v| *v == values[0]) {
        return AnomalyReport::default();
    }

    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    let stddev = variance.sqrt();

    let anomalies: Vec<Anomaly> = values
        .iter()
        .enumerate()
        .filter_map(|(index, &value)| {
            let zscore = if stddev == 0.0 {
                0.0
            } else {
                (value - mean).abs() / stddev
            };
            (zscore > z_threshold).then_some(Anomaly {
                index,
                value,
                zscore,
            })
        })
        .collect();

    AnomalyReport {
        has_anomaly: !anomalies.is_empty(),
        anomalies,
    }
}

/// What the Investigate phase gathered. Individual fetch failures are kept
/// as messages instead of aborting the phase.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    pub metrics: Vec<MetricSeries>,
    pub logs: Vec<LogEntry>,
    pub failures: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct InvestigationWindow {
    pub lookback: Duration,
    pub period_secs: u32,
    pub log_limit: usize,
}

pub fn function_dimensions(resource_id: &str) -> BTreeMap<String, String> {
    BTreeMap::from([("FunctionName".to_string(), resource_id.to_string())])
}

pub fn log_group_for(resource_id: &str) -> String {
    format!("/aws/lambda/{resource_id}")
}

/// CloudWatch retains metric data for 15 months.
pub const MAX_WINDOW_MINUTES: i64 = 455 * 24 * 60;

/// A lookback of `minutes`, or `fallback` when `minutes` is not positive or
/// reaches past metric retention.
pub fn lookback_window(minutes: i64, fallback: Duration) -> Duration {
    match Some(minutes)
        .filter(|m| (1..=MAX_WINDOW_MINUTES).contains(m))
        .and_then(Duration::try_minutes)
    {
        Some(window) => window,
        None => {
            tracing::warn!(minutes, fallback_minutes = fallback.num_minutes(), "lookback window out of range");
            fallback
        }
    }
}

pub fn metric_query(
    resource_id: &str,
    metric_name: &str,
    lookback: Duration,
    period_secs: u32,
) -> MetricQuery {
    let end = Utc::now();
    MetricQuery {
        namespace: LAMBDA_NAMESPACE.into(),
        metric_name: metric_name.into(),
        dimensions: function_dimensions(resource_id),
        start: end - lookback,
        end,
        period_secs,
    }
}

/// Fetches the investigation metrics and recent logs concurrently. Reads are
/// independent, so no ordering is imposed among them.
pub async fn collect_snapshot(
    source: &dyn TelemetrySource,
    resource_id: &str,
    window: &InvestigationWindow,
) -> TelemetrySnapshot {
    let queries: Vec<MetricQuery> = INVESTIGATION_METRICS
        .iter()
        .map(|name| metric_query(resource_id, name, window.lookback, window.period_secs))
        .collect();
    let end = Utc::now();
    let log_query = LogQuery {
        log_group: log_group_for(resource_id),
        start: end - window.lookback,
        end,
        pattern: None,
        limit: window.log_limit,
    };

    let metric_futures = join_all(queries.iter().map(|q| source.get_metrics(q)));
    let (metric_results, log_result) =
        futures::join!(metric_futures, source.query_logs(&log_query));

    let mut snapshot = TelemetrySnapshot::default();
    for (query, result) in queries.iter().zip(metric_results) {
        match result {
            Ok(series) => snapshot.metrics.push(series),
            Err(err) => {
                tracing::warn!(metric = %query.metric_name, error = %err, "metric fetch failed");
                snapshot
                    .failures
                    .push(format!("{}: {err}", query.metric_name));
            }
        }
    }
    match log_result {
        Ok(logs) => snapshot.logs = logs,
        Err(err) => {
            tracing::warn!(error = %err, "log query failed");
            snapshot.failures.push(format!("logs: {err}"));
        }
    }
    snapshot
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ServiceError;
    use async_trait::async_trait;

    fn series(values: &[f64]) -> MetricSeries {
        MetricSeries::from_values("Errors", values)
    }

    #[test]
    fn short_series_never_anomalous() {
        for values in [&[][..], &[100.0][..], &[1.0, 1000.0][..]] {
            let report = analyze_anomalies(&series(values), 0.0);
            assert!(!report.has_anomaly);
            assert!(report.anomalies.is_empty());
        }
    }

    #[test]
    fn flags_only_the_outlier() {
        // mean 3.5, population stddev ~3.775: z(10) ~1.72, z(1) ~0.66, z(2) ~0.40
        let report = analyze_anomalies(&series(&[1.0, 2.0, 1.0, 10.0]), 1.5);
        assert!(report.has_anomaly);
        assert_eq!(report.anomalies.len(), 1);
        assert_eq!(report.anomalies[0].index, 3);
        assert_eq!(report.anomalies[0].value, 10.0);
        assert!((report.anomalies[0].zscore - 1.7219).abs() < 1e-3);
    }

    #[test]
    fn default_threshold_masks_single_outlier_in_four_points() {
        // With population statistics no point of a 4-sample series can exceed sqrt(3).
        let report = analyze_anomalies(&series(&[1.0, 2.0, 1.0, 10.0]), DEFAULT_Z_THRESHOLD);
        assert!(!report.has_anomaly);
    }

    #[test]
    fn three_point_outlier_is_eligible() {
        let report = analyze_anomalies(&series(&[0.0, 0.0, 9.0]), 1.0);
        assert_eq!(report.anomalies.len(), 1);
        assert_eq!(report.anomalies[0].index, 2);
    }

    #[test]
    fn zero_variance_never_flags() {
        for values in [&[5.0; 12][..], &[0.1, 0.1, 0.1][..], &[1e-7; 5][..]] {
            let report = analyze_anomalies(&series(values), 0.0);
            assert!(!report.has_anomaly, "{values:?} flagged");
            assert!(report.anomalies.is_empty());
        }
    }

    #[test]
    fn out_of_range_lookback_falls_back() {
        let fallback = Duration::minutes(5);
        assert_eq!(lookback_window(30, fallback), Duration::minutes(30));
        assert_eq!(lookback_window(MAX_WINDOW_MINUTES, fallback), Duration::minutes(MAX_WINDOW_MINUTES));
        for minutes in [0, -5, MAX_WINDOW_MINUTES + 1, i64::MAX, i64::MIN] {
            assert_eq!(lookback_window(minutes, fallback), fallback, "{minutes}");
        }
    }

    #[test]
    fn long_series_flags_spike() {
        let mut values = vec![1.0; 20];
        values[7] = 40.0;
        let report = analyze_anomalies(&series(&values), DEFAULT_Z_THRESHOLD);
        assert_eq!(report.anomalies.len(), 1);
        assert_eq!(report.anomalies[0].index, 7);
    }

    struct PartialSource;

    #[async_trait]
    impl TelemetrySource for PartialSource {
        async fn get_metrics(&self, query: &MetricQuery) -> Result<MetricSeries, ServiceError> {
            if query.metric_name == "Throttles" {
                return Err(ServiceError::Timeout("cloudwatch".into()));
            }
            assert_eq!(query.dimensions["FunctionName"], "orders-fn");
            Ok(MetricSeries::from_values(query.metric_name.clone(), &[1.0, 2.0]))
        }

        async fn query_logs(&self, query: &LogQuery) -> Result<Vec<LogEntry>, ServiceError> {
            assert_eq!(query.log_group, "/aws/lambda/orders-fn");
            Ok(vec![LogEntry {
                timestamp: Utc::now(),
                message: "Task timed out after 1.00 seconds".into(),
            }])
        }
    }

    #[tokio::test]
    async fn snapshot_tolerates_individual_failures() {
        let window = InvestigationWindow {
            lookback: Duration::minutes(60),
            period_secs: 300,
            log_limit: 50,
        };
        let snapshot = collect_snapshot(&PartialSource, "orders-fn", &window).await;

        assert_eq!(snapshot.metrics.len(), 2);
        assert_eq!(snapshot.logs.len(), 1);
        assert_eq!(snapshot.failures.len(), 1);
        assert!(snapshot.failures[0].starts_with("Throttles"));
    }
}
