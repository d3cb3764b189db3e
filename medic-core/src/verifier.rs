use chrono::Duration;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

use crate::incident::{Incident, VerificationCheck, VerificationResult};
use crate::ports::{InvocationMode, ResourceController, TelemetrySource};
use crate::telemetry::{lookback_window, metric_query};

pub const HEALTH_CHECK: &str = "health";
pub const FUNCTIONAL_CHECK: &str = "functional";
pub const METRIC_CHECK: &str = "metrics";
pub const DEFAULT_WINDOW_MINUTES: i64 = 5;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifySettings {
    /// Timeouts below this are treated as misconfigured.
    pub min_timeout_secs: u32,
    pub min_memory_mb: u32,
    pub window_minutes: i64,
    pub test_payload: serde_json::Value,
}

impl Default for VerifySettings {
    fn default() -> Self {
        Self {
            min_timeout_secs: 3,
            min_memory_mb: 256,
            window_minutes: DEFAULT_WINDOW_MINUTES,
            test_payload: json!({ "source": "lambda-medic", "test": true }),
        }
    }
}

pub struct Verifier {
    telemetry: Arc<dyn TelemetrySource>,
    controller: Arc<dyn ResourceController>,
    settings: VerifySettings,
}

impl Verifier {
    pub fn new(
        telemetry: Arc<dyn TelemetrySource>,
        controller: Arc<dyn ResourceController>,
        settings: VerifySettings,
    ) -> Self {
        Self {
            telemetry,
            controller,
            settings,
        }
    }

    /// Runs the health, functional and metric checks concurrently. A check
    /// that cannot be evaluated fails on its own without affecting the
    /// others; with no resource id every check is omitted.
    pub async fn verify(&self, incident: &Incident) -> VerificationResult {
        let resource_id = incident.resource_id.as_str();
        if resource_id.is_empty() {
            tracing::info!(incident_id = %incident.id, "no resource id; verification checks omitted");
            return VerificationResult::from_checks(Vec::new(), false);
        }

        let (health, functional, metrics) = futures::join!(
            self.health_check(resource_id),
            self.functional_check(resource_id),
            self.metric_check(resource_id),
        );
        let metrics_improved = metrics.passed;
        VerificationResult::from_checks(vec![health, functional, metrics], metrics_improved)
    }

    async fn health_check(&self, resource_id: &str) -> VerificationCheck {
        let mut issues = Vec::new();

        match self.controller.get_config(resource_id).await {
            Ok(config) => {
                if config.timeout_secs < self.settings.min_timeout_secs {
                    issues.push(format!(
                        "timeout {}s below {}s",
                        config.timeout_secs, self.settings.min_timeout_secs
                    ));
                }
                if config.memory_mb < self.settings.min_memory_mb {
                    issues.push(format!(
                        "memory {}MB below {}MB",
                        config.memory_mb, self.settings.min_memory_mb
                    ));
                }
            }
            Err(err) => issues.push(format!("config unavailable: {err}")),
        }

        match self
            .controller
            .invoke(resource_id, &json!({}), InvocationMode::DryRun)
            .await
        {
            Ok(outcome) if outcome.succeeded() => {}
            Ok(outcome) => issues.push(format!(
                "dry run returned {}{}",
                outcome.status_code,
                outcome.error.map(|e| format!(": {e}")).unwrap_or_default()
            )),
            Err(err) => issues.push(format!("dry run failed: {err}")),
        }

        VerificationCheck {
            name: HEALTH_CHECK.into(),
            passed: issues.is_empty(),
            details: if issues.is_empty() {
                "configuration healthy".into()
            } else {
                issues.join("; ")
            },
        }
    }

    async fn functional_check(&self, resource_id: &str) -> VerificationCheck {
        let (passed, details) = match self
            .controller
            .invoke(
                resource_id,
                &self.settings.test_payload,
                InvocationMode::RequestResponse,
            )
            .await
        {
            Ok(outcome) if outcome.succeeded() => {
                (true, format!("invocation returned {}", outcome.status_code))
            }
            Ok(outcome) => (
                false,
                format!(
                    "invocation returned {} with error {}",
                    outcome.status_code,
                    outcome.error.as_deref().unwrap_or("none")
                ),
            ),
            Err(err) => (false, format!("invocation failed: {err}")),
        };
        VerificationCheck {
            name: FUNCTIONAL_CHECK.into(),
            passed,
            details,
        }
    }

    fn window(&self) -> Duration {
        lookback_window(
            self.settings.window_minutes,
            Duration::minutes(DEFAULT_WINDOW_MINUTES),
        )
    }

    async fn metric_check(&self, resource_id: &str) -> VerificationCheck {
        let query = metric_query(
            resource_id,
            "Errors",
            self.window(),
            60,
        );
        let (passed, details) = match self.telemetry.get_metrics(&query).await {
            Ok(series) => {
                let errors = series.sum();
                (
                    errors == 0.0,
                    format!(
                        "{errors} error(s) in the last {} minutes",
                        self.window().num_minutes()
                    ),
                )
            }
            Err(err) => (false, format!("error metric unavailable: {err}")),
        };
        VerificationCheck {
            name: METRIC_CHECK.into(),
            passed,
            details,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ServiceError;
    use crate::incident::{LogEntry, MetricSeries, Severity};
    use crate::ports::{
        ConfigDelta, FunctionConfig, InvocationOutcome, LogQuery, MetricQuery,
    };
    use async_trait::async_trait;

    struct Telemetry(Result<Vec<f64>, ServiceError>);

    #[async_trait]
    impl TelemetrySource for Telemetry {
        async fn get_metrics(&self, query: &MetricQuery) -> Result<MetricSeries, ServiceError> {
            assert_eq!(query.end - query.start, Duration::minutes(5));
            self.0
                .clone()
                .map(|values| MetricSeries::from_values(&query.metric_name, &values))
        }

        async fn query_logs(&self, _: &LogQuery) -> Result<Vec<LogEntry>, ServiceError> {
            Ok(Vec::new())
        }
    }

    struct Controller {
        config: FunctionConfig,
        status_code: u16,
    }

    #[async_trait]
    impl ResourceController for Controller {
        async fn get_config(&self, _: &str) -> Result<FunctionConfig, ServiceError> {
            Ok(self.config.clone())
        }

        async fn update_config(
            &self,
            _: &str,
            _: &ConfigDelta,
        ) -> Result<FunctionConfig, ServiceError> {
            Err(ServiceError::Rejected("read only".into()))
        }

        async fn invoke(
            &self,
            _: &str,
            _: &serde_json::Value,
            mode: InvocationMode,
        ) -> Result<InvocationOutcome, ServiceError> {
            let status_code = match mode {
                InvocationMode::DryRun => 204,
                InvocationMode::RequestResponse => self.status_code,
            };
            Ok(InvocationOutcome {
                status_code,
                payload: json!({}),
                error: None,
            })
        }
    }

    fn verifier(errors: Result<Vec<f64>, ServiceError>, memory_mb: u32, status: u16) -> Verifier {
        Verifier::new(
            Arc::new(Telemetry(errors)),
            Arc::new(Controller {
                config: FunctionConfig {
                    memory_mb,
                    timeout_secs: 30,
                    ..FunctionConfig::default()
                },
                status_code: status,
            }),
            VerifySettings::default(),
        )
    }

    fn incident(resource_id: &str) -> Incident {
        Incident::new(Severity::High, resource_id, "verify me")
    }

    #[tokio::test]
    async fn healthy_function_passes_all_checks() {
        let result = verifier(Ok(vec![0.0, 0.0]), 512, 200)
            .verify(&incident("fn"))
            .await;
        assert!(result.success);
        assert!(result.metrics_improved);
        let names: Vec<&str> = result.checks.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec![HEALTH_CHECK, FUNCTIONAL_CHECK, METRIC_CHECK]);
    }

    #[tokio::test]
    async fn one_failing_check_fails_overall_only() {
        let result = verifier(Ok(vec![0.0]), 128, 200)
            .verify(&incident("fn"))
            .await;
        assert!(!result.success);
        assert!(result.metrics_improved);
        let health = &result.checks[0];
        assert!(!health.passed);
        assert!(health.details.contains("memory 128MB"));
        assert!(result.checks[1].passed);
    }

    #[tokio::test]
    async fn telemetry_failure_fails_metric_check() {
        let result = verifier(Err(ServiceError::Timeout("cw".into())), 512, 500)
            .verify(&incident("fn"))
            .await;
        assert!(!result.success);
        assert!(!result.metrics_improved);
        assert!(!result.checks[1].passed);
        assert!(result.checks[2].details.contains("unavailable"));
    }

    #[tokio::test]
    async fn missing_resource_omits_checks() {
        let result = verifier(Ok(vec![5.0]), 128, 500)
            .verify(&incident(""))
            .await;
        assert!(result.checks.is_empty());
        assert!(result.success);
    }

    #[tokio::test]
    async fn out_of_range_window_uses_default() {
        for window_minutes in [i64::MAX, 0, -30] {
            let verifier = Verifier::new(
                Arc::new(Telemetry(Ok(vec![0.0]))),
                Arc::new(Controller {
                    config: FunctionConfig {
                        memory_mb: 512,
                        timeout_secs: 30,
                        ..FunctionConfig::default()
                    },
                    status_code: 200,
                }),
                VerifySettings {
                    window_minutes,
                    ..VerifySettings::default()
                },
            );
            let result = verifier.verify(&incident("fn")).await;
            assert!(result.success, "window {window_minutes}");
            assert!(result.checks[2].details.ends_with("last 5 minutes"));
        }
    }
}
