//! Diagnostic tools the reasoning service may call from inside the
//! tool-calling loop. Tools may run several times across iterations, so only
//! side-effect-free ones can be registered.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use medic_effects::Effect;
use schemars::JsonSchema;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::ports::{
    LogQuery, ResourceController, TelemetrySource, ToolDefinition, ToolInvocation,
};
use crate::telemetry::{log_group_for, metric_query};
use crate::tool_loop::ToolOutput;

#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, input: serde_json::Value) -> Result<serde_json::Value, String>;
}

#[derive(Clone)]
struct RegisteredTool {
    definition: ToolDefinition,
    effect: Effect,
    handler: Arc<dyn ToolHandler>,
}

#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: BTreeMap<String, RegisteredTool>,
}

impl ToolRegistry {
    pub fn register(
        &mut self,
        definition: ToolDefinition,
        effect: Effect,
        handler: Arc<dyn ToolHandler>,
    ) -> Result<(), String> {
        if !effect.side_effect_free() {
            return Err(format!(
                "tool '{}' has effect {effect:?}; only side-effect-free tools can be looped",
                definition.name
            ));
        }
        if self.tools.contains_key(&definition.name) {
            return Err(format!("tool '{}' already registered", definition.name));
        }
        self.tools.insert(
            definition.name.clone(),
            RegisteredTool {
                definition,
                effect,
                handler,
            },
        );
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.values().map(|t| t.definition.clone()).collect()
    }

    pub fn effect_of(&self, name: &str) -> Option<Effect> {
        self.tools.get(name).map(|t| t.effect)
    }

    /// Runs one invocation. Unknown tools and handler errors become error
    /// outputs tagged with the invocation id.
    pub async fn execute(&self, invocation: &ToolInvocation) -> ToolOutput {
        let Some(tool) = self.tools.get(&invocation.name) else {
            return ToolOutput::error(&invocation.id, format!("unknown tool '{}'", invocation.name));
        };

        tracing::debug!(tool = %invocation.name, id = %invocation.id, "executing tool");
        match tool.handler.call(invocation.input.clone()).await {
            Ok(output) => ToolOutput::ok(&invocation.id, output),
            Err(err) => ToolOutput::error(&invocation.id, err),
        }
    }

    /// Registry with the read-only tools backed by the telemetry source and
    /// resource controller.
    pub fn with_builtin_tools(
        telemetry: Arc<dyn TelemetrySource>,
        controller: Arc<dyn ResourceController>,
    ) -> Self {
        let mut registry = Self::default();
        let builtins: [(ToolDefinition, Arc<dyn ToolHandler>); 3] = [
            (
                definition::<GetMetricsInput>(
                    "get_metrics",
                    "Fetch a CloudWatch metric for a Lambda function over the last N minutes.",
                ),
                Arc::new(GetMetricsTool {
                    telemetry: telemetry.clone(),
                }),
            ),
            (
                definition::<QueryLogsInput>(
                    "query_logs",
                    "Fetch recent log lines for a Lambda function, optionally filtered by a pattern.",
                ),
                Arc::new(QueryLogsTool { telemetry }),
            ),
            (
                definition::<GetConfigInput>(
                    "get_function_config",
                    "Read the current memory, timeout and environment of a Lambda function.",
                ),
                Arc::new(GetConfigTool { controller }),
            ),
        ];
        for (def, handler) in builtins {
            // Names are distinct and every builtin only observes.
            let _ = registry.register(def, Effect::Observe, handler);
        }
        registry
    }
}

fn definition<T: JsonSchema>(name: &str, description: &str) -> ToolDefinition {
    let parameters = serde_json::to_value(schemars::schema_for!(T))
        .unwrap_or_else(|_| serde_json::json!({"type": "object"}));
    ToolDefinition {
        name: name.into(),
        description: description.into(),
        parameters,
    }
}

fn parse_input<T: for<'de> Deserialize<'de>>(input: serde_json::Value) -> Result<T, String> {
    serde_json::from_value(input).map_err(|e| format!("invalid tool input: {e}"))
}

#[derive(Debug, Deserialize, JsonSchema)]
struct GetMetricsInput {
    function_name: String,
    /// One of Errors, Duration, Throttles, Invocations.
    metric_name: String,
    minutes: Option<u32>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct QueryLogsInput {
    function_name: String,
    minutes: Option<u32>,
    pattern: Option<String>,
    limit: Option<usize>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct GetConfigInput {
    function_name: String,
}

struct GetMetricsTool {
    telemetry: Arc<dyn TelemetrySource>,
}

#[async_trait]
impl ToolHandler for GetMetricsTool {
    async fn call(&self, input: serde_json::Value) -> Result<serde_json::Value, String> {
        let input: GetMetricsInput = parse_input(input)?;
        let minutes = i64::from(input.minutes.unwrap_or(60));
        let query = metric_query(
            &input.function_name,
            &input.metric_name,
            Duration::minutes(minutes),
            60,
        );
        let series = self
            .telemetry
            .get_metrics(&query)
            .await
            .map_err(|e| e.to_string())?;
        serde_json::to_value(series).map_err(|e| e.to_string())
    }
}

struct QueryLogsTool {
    telemetry: Arc<dyn TelemetrySource>,
}

#[async_trait]
impl ToolHandler for QueryLogsTool {
    async fn call(&self, input: serde_json::Value) -> Result<serde_json::Value, String> {
        let input: QueryLogsInput = parse_input(input)?;
        let end = Utc::now();
        let query = LogQuery {
            log_group: log_group_for(&input.function_name),
            start: end - Duration::minutes(i64::from(input.minutes.unwrap_or(60))),
            end,
            pattern: input.pattern,
            limit: input.limit.unwrap_or(20).min(100),
        };
        let logs = self
            .telemetry
            .query_logs(&query)
            .await
            .map_err(|e| e.to_string())?;
        serde_json::to_value(logs).map_err(|e| e.to_string())
    }
}

struct GetConfigTool {
    controller: Arc<dyn ResourceController>,
}

#[async_trait]
impl ToolHandler for GetConfigTool {
    async fn call(&self, input: serde_json::Value) -> Result<serde_json::Value, String> {
        let input: GetConfigInput = parse_input(input)?;
        let config = self
            .controller
            .get_config(&input.function_name)
            .await
            .map_err(|e| e.to_string())?;
        serde_json::to_value(config).map_err(|e| e.to_string())
    }
}
