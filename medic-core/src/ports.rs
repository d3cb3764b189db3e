//! Contracts for the collaborators the responder drives. Concrete transports
//! live outside the core; everything here is injected as `Arc<dyn _>`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{ServiceError, StoreError};
use crate::incident::{AuditEntry, Incident, IncidentStatus, LogEntry, MetricSeries};
use crate::tool_loop::Turn;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MetricQuery {
    pub namespace: String,
    pub metric_name: String,
    pub dimensions: BTreeMap<String, String>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub period_secs: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogQuery {
    pub log_group: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub pattern: Option<String>,
    pub limit: usize,
}

#[async_trait]
pub trait TelemetrySource: Send + Sync {
    async fn get_metrics(&self, query: &MetricQuery) -> Result<MetricSeries, ServiceError>;

    async fn query_logs(&self, query: &LogQuery) -> Result<Vec<LogEntry>, ServiceError>;
}

/// A tool the reasoning service may call, as advertised to it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON schema of the tool's input object.
    pub parameters: serde_json::Value,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub id: String,
    pub name: String,
    pub input: serde_json::Value,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ReasoningRequest {
    pub preamble: Option<String>,
    pub conversation: Vec<Turn>,
    pub tools: Vec<ToolDefinition>,
    pub temperature: f64,
    pub max_tokens: u64,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ReasoningResponse {
    pub text: Option<String>,
    pub tool_invocations: Vec<ToolInvocation>,
    /// Model-reported confidence, when the service exposes one.
    pub confidence: Option<f64>,
}

impl ReasoningResponse {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::default()
        }
    }
}

#[async_trait]
pub trait ReasoningService: Send + Sync {
    async fn respond(&self, request: &ReasoningRequest) -> Result<ReasoningResponse, ServiceError>;
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FunctionConfig {
    pub memory_mb: u32,
    pub timeout_secs: u32,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
}

/// Partial configuration update. Unset fields are left unchanged; environment
/// entries are merged into the existing variables.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigDelta {
    pub memory_mb: Option<u32>,
    pub timeout_secs: Option<u32>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
}

impl ConfigDelta {
    pub fn is_empty(&self) -> bool {
        self.memory_mb.is_none() && self.timeout_secs.is_none() && self.environment.is_empty()
    }

    pub fn apply_to(&self, config: &mut FunctionConfig) {
        if let Some(memory) = self.memory_mb {
            config.memory_mb = memory;
        }
        if let Some(timeout) = self.timeout_secs {
            config.timeout_secs = timeout;
        }
        for (key, value) in &self.environment {
            config.environment.insert(key.clone(), value.clone());
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationMode {
    RequestResponse,
    /// Validates permissions and payload without running the function.
    DryRun,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InvocationOutcome {
    pub status_code: u16,
    pub payload: serde_json::Value,
    /// Application-level error signal reported by the function runtime.
    pub error: Option<String>,
}

impl InvocationOutcome {
    pub fn succeeded(&self) -> bool {
        (200..300).contains(&self.status_code) && self.error.is_none()
    }
}

#[async_trait]
pub trait ResourceController: Send + Sync {
    async fn get_config(&self, resource_id: &str) -> Result<FunctionConfig, ServiceError>;

    async fn update_config(
        &self,
        resource_id: &str,
        delta: &ConfigDelta,
    ) -> Result<FunctionConfig, ServiceError>;

    async fn invoke(
        &self,
        resource_id: &str,
        payload: &serde_json::Value,
        mode: InvocationMode,
    ) -> Result<InvocationOutcome, ServiceError>;
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn append(&self, entry: &AuditEntry) -> Result<(), ServiceError>;
}

#[async_trait]
pub trait IncidentStore: Send + Sync {
    async fn save(&self, incident: &Incident) -> Result<(), StoreError>;

    async fn update_status(
        &self,
        id: &str,
        status: IncidentStatus,
        details: Option<serde_json::Value>,
    ) -> Result<(), StoreError>;

    async fn get(&self, id: &str) -> Result<Option<Incident>, StoreError>;

    async fn list_open(&self) -> Result<Vec<Incident>, StoreError>;
}

/// Every collaborator the orchestrator needs, constructed by the caller.
#[derive(Clone)]
pub struct Services {
    pub telemetry: Arc<dyn TelemetrySource>,
    pub reasoning: Arc<dyn ReasoningService>,
    pub controller: Arc<dyn ResourceController>,
    pub audit: Arc<dyn AuditSink>,
    pub store: Arc<dyn IncidentStore>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delta_merges_environment_and_keeps_unset_fields() {
        let mut config = FunctionConfig {
            memory_mb: 128,
            timeout_secs: 3,
            environment: BTreeMap::from([("STAGE".to_string(), "prod".to_string())]),
        };
        let delta = ConfigDelta {
            memory_mb: Some(512),
            timeout_secs: None,
            environment: BTreeMap::from([("MARKER".to_string(), "1".to_string())]),
        };
        delta.apply_to(&mut config);

        assert_eq!(config.memory_mb, 512);
        assert_eq!(config.timeout_secs, 3);
        assert_eq!(config.environment.len(), 2);
    }

    #[test]
    fn invocation_success_requires_2xx_and_no_error() {
        let ok = InvocationOutcome {
            status_code: 200,
            payload: serde_json::json!({}),
            error: None,
        };
        assert!(ok.succeeded());

        let unhandled = InvocationOutcome {
            error: Some("Unhandled".into()),
            ..ok.clone()
        };
        assert!(!unhandled.succeeded());

        let throttled = InvocationOutcome {
            status_code: 429,
            ..ok
        };
        assert!(!throttled.succeeded());
    }
}
