//! Local stand-ins for the cloud: a misconfigured serverless function and a
//! canned reasoning service used when no LLM key is configured.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use medic_core::error::ServiceError;
use medic_core::incident::{LogEntry, MetricSeries};
use medic_core::ports::{
    ConfigDelta, FunctionConfig, InvocationMode, InvocationOutcome, LogQuery, MetricQuery,
    ReasoningRequest, ReasoningResponse, ReasoningService, ResourceController, TelemetrySource,
    ToolInvocation,
};
use medic_core::tool_loop::TurnContent;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Mutex;

const HEALTHY_MEMORY_MB: u32 = 256;
const HEALTHY_TIMEOUT_SECS: u32 = 3;

/// Functions start at 128 MB / 1 s and keep timing out until both values
/// reach the healthy minimums.
#[derive(Default)]
pub struct SimulatedFunction {
    functions: Mutex<HashMap<String, FunctionConfig>>,
}

impl SimulatedFunction {
    fn initial_config() -> FunctionConfig {
        FunctionConfig {
            memory_mb: 128,
            timeout_secs: 1,
            ..FunctionConfig::default()
        }
    }

    fn with_config<T>(&self, resource_id: &str, f: impl FnOnce(&mut FunctionConfig) -> T) -> T {
        let mut functions = self
            .functions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let config = functions
            .entry(resource_id.to_string())
            .or_insert_with(Self::initial_config);
        f(config)
    }

    pub fn config_of(&self, resource_id: &str) -> FunctionConfig {
        self.with_config(resource_id, |c| c.clone())
    }

    pub fn healthy(&self, resource_id: &str) -> bool {
        self.with_config(resource_id, |c| {
            c.memory_mb >= HEALTHY_MEMORY_MB && c.timeout_secs >= HEALTHY_TIMEOUT_SECS
        })
    }
}

#[async_trait]
impl TelemetrySource for SimulatedFunction {
    async fn get_metrics(&self, query: &MetricQuery) -> Result<MetricSeries, ServiceError> {
        let resource_id = query
            .dimensions
            .get("FunctionName")
            .ok_or_else(|| ServiceError::Rejected("FunctionName dimension required".into()))?;
        let healthy = self.healthy(resource_id);
        let timeout_ms = f64::from(self.config_of(resource_id).timeout_secs) * 1000.0;

        let steps = (query.end - query.start).num_seconds() / i64::from(query.period_secs.max(1));
        let steps = steps.clamp(1, 60) as usize;
        let values: Vec<f64> = (0..steps)
            .map(|i| {
                let latest = i + 1 == steps;
                match query.metric_name.as_str() {
                    "Errors" if healthy => 0.0,
                    "Errors" if latest => 37.0,
                    "Errors" => 1.0,
                    "Duration" if healthy => 180.0,
                    "Duration" => timeout_ms,
                    _ => 0.0,
                }
            })
            .collect();
        Ok(MetricSeries::from_values(&query.metric_name, &values))
    }

    async fn query_logs(&self, query: &LogQuery) -> Result<Vec<LogEntry>, ServiceError> {
        let resource_id = query.log_group.trim_start_matches("/aws/lambda/");
        if self.healthy(resource_id) {
            return Ok(Vec::new());
        }
        let config = self.config_of(resource_id);
        let now = Utc::now();
        Ok((0..query.limit.min(5))
            .map(|i| LogEntry {
                timestamp: now - Duration::seconds(i as i64 * 30),
                message: format!(
                    "Task timed out after {}.00 seconds (memory {} MB)",
                    config.timeout_secs, config.memory_mb
                ),
            })
            .collect())
    }
}

#[async_trait]
impl ResourceController for SimulatedFunction {
    async fn get_config(&self, resource_id: &str) -> Result<FunctionConfig, ServiceError> {
        Ok(self.config_of(resource_id))
    }

    async fn update_config(
        &self,
        resource_id: &str,
        delta: &ConfigDelta,
    ) -> Result<FunctionConfig, ServiceError> {
        tracing::info!(resource_id, ?delta, "simulated config update");
        Ok(self.with_config(resource_id, |config| {
            delta.apply_to(config);
            config.clone()
        }))
    }

    async fn invoke(
        &self,
        resource_id: &str,
        _payload: &serde_json::Value,
        mode: InvocationMode,
    ) -> Result<InvocationOutcome, ServiceError> {
        if mode == InvocationMode::DryRun {
            return Ok(InvocationOutcome {
                status_code: 204,
                payload: serde_json::Value::Null,
                error: None,
            });
        }
        Ok(if self.healthy(resource_id) {
            InvocationOutcome {
                status_code: 200,
                payload: json!({ "ok": true }),
                error: None,
            }
        } else {
            let timeout = self.config_of(resource_id).timeout_secs;
            InvocationOutcome {
                status_code: 200,
                payload: json!({ "errorMessage": format!("Task timed out after {timeout}.00 seconds") }),
                error: Some("Unhandled".into()),
            }
        })
    }
}

/// Reasoning without a model. During diagnosis it reads the function config
/// through the tool loop, then names the undersized setting.
#[derive(Default)]
pub struct CannedReasoning;

#[async_trait]
impl ReasoningService for CannedReasoning {
    async fn respond(&self, request: &ReasoningRequest) -> Result<ReasoningResponse, ServiceError> {
        let prompt = request
            .conversation
            .first()
            .and_then(|turn| turn.text())
            .unwrap_or_default();

        if prompt.contains("Describe the remediation steps") {
            return Ok(ReasoningResponse::text(
                "Raise the function memory and timeout to safe defaults.",
            ));
        }
        if request.tools.is_empty() {
            return Ok(ReasoningResponse::text(
                "Invocations exceed the configured timeout\n\
                 Recent logs show every request timing out at the limit.",
            ));
        }

        let config_result = request.conversation.iter().find_map(|turn| match &turn.content {
            TurnContent::ToolResults { results } => results.first().map(|r| r.output.clone()),
            _ => None,
        });
        let Some(config) = config_result else {
            let function_name = prompt
                .lines()
                .find_map(|line| line.strip_prefix("Function: "))
                .unwrap_or_default();
            return Ok(ReasoningResponse {
                text: None,
                tool_invocations: vec![ToolInvocation {
                    id: "canned-1".into(),
                    name: "get_function_config".into(),
                    input: json!({ "function_name": function_name }),
                }],
                confidence: None,
            });
        };

        Ok(ReasoningResponse::text(format!(
            "Function is under-provisioned: timeout {}s and memory {}MB\n\
             Duration is pinned at the timeout and every invocation times out.",
            config.get("timeout_secs").unwrap_or(&json!("?")),
            config.get("memory_mb").unwrap_or(&json!("?")),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[tokio::test]
    async fn recovers_once_limits_are_raised() {
        let sim = SimulatedFunction::default();
        assert!(!sim.healthy("fn"));

        let outcome = sim
            .invoke("fn", &json!({}), InvocationMode::RequestResponse)
            .await
            .expect("invoke");
        assert!(!outcome.succeeded());

        sim.update_config(
            "fn",
            &ConfigDelta {
                memory_mb: Some(512),
                timeout_secs: Some(30),
                environment: BTreeMap::new(),
            },
        )
        .await
        .expect("update");
        assert!(sim.healthy("fn"));
        let outcome = sim
            .invoke("fn", &json!({}), InvocationMode::RequestResponse)
            .await
            .expect("invoke");
        assert!(outcome.succeeded());
    }

    #[tokio::test]
    async fn metrics_follow_health() {
        let sim = SimulatedFunction::default();
        let end = Utc::now();
        let query = MetricQuery {
            namespace: "AWS/Lambda".into(),
            metric_name: "Errors".into(),
            dimensions: BTreeMap::from([("FunctionName".to_string(), "fn".to_string())]),
            start: end - Duration::minutes(60),
            end,
            period_secs: 300,
        };
        let series = sim.get_metrics(&query).await.expect("metrics");
        assert_eq!(series.points.len(), 12);
        assert!(series.sum() > 0.0);

        let mut query = query;
        query.dimensions.clear();
        assert!(sim.get_metrics(&query).await.is_err());
    }
}
