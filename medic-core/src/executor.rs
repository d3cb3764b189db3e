use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::audit_log::record;
use crate::error::ServiceError;
use crate::incident::{
    ActionType, AuditEntry, AuditResult, ExecutionResult, RemediationAction, RemediationPlan,
};
use crate::ports::{AuditSink, ConfigDelta, ResourceController};

/// Environment variable touched to force a redeployment.
pub const RESTART_MARKER_ENV: &str = "REMEDIATION_RESTART_AT";

/// What to do with an action type that has no registered handler.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnknownActionPolicy {
    /// Record a successful "not implemented" result and continue.
    #[default]
    Acknowledge,
    /// Treat the action as failed, halting the sequence.
    Reject,
}

#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn apply(
        &self,
        resource_id: &str,
        action: &RemediationAction,
    ) -> Result<serde_json::Value, ServiceError>;
}

pub struct UpdateConfigHandler {
    controller: Arc<dyn ResourceController>,
}

impl UpdateConfigHandler {
    pub fn new(controller: Arc<dyn ResourceController>) -> Self {
        Self { controller }
    }
}

#[async_trait]
impl ActionHandler for UpdateConfigHandler {
    async fn apply(
        &self,
        resource_id: &str,
        action: &RemediationAction,
    ) -> Result<serde_json::Value, ServiceError> {
        let delta = config_delta(action)?;
        let updated = self.controller.update_config(resource_id, &delta).await?;
        Ok(json!({ "memory_mb": updated.memory_mb, "timeout_secs": updated.timeout_secs }))
    }
}

pub struct RestartHandler {
    controller: Arc<dyn ResourceController>,
}

impl RestartHandler {
    pub fn new(controller: Arc<dyn ResourceController>) -> Self {
        Self { controller }
    }
}

#[async_trait]
impl ActionHandler for RestartHandler {
    async fn apply(
        &self,
        resource_id: &str,
        _action: &RemediationAction,
    ) -> Result<serde_json::Value, ServiceError> {
        let stamp = Utc::now().to_rfc3339();
        let delta = ConfigDelta {
            environment: BTreeMap::from([(RESTART_MARKER_ENV.to_string(), stamp.clone())]),
            ..ConfigDelta::default()
        };
        self.controller.update_config(resource_id, &delta).await?;
        Ok(json!({ "restarted_at": stamp }))
    }
}

fn config_delta(action: &RemediationAction) -> Result<ConfigDelta, ServiceError> {
    let number = |key: &str| -> Result<Option<u32>, ServiceError> {
        match action.parameters.get(key) {
            None => Ok(None),
            Some(value) => value
                .as_u64()
                .and_then(|v| u32::try_from(v).ok())
                .filter(|v| *v > 0)
                .map(Some)
                .ok_or_else(|| ServiceError::Rejected(format!("{key} must be a positive integer"))),
        }
    };

    let environment = match action.parameters.get("environment") {
        None => BTreeMap::new(),
        Some(value) => serde_json::from_value(value.clone())
            .map_err(|e| ServiceError::Rejected(format!("environment: {e}")))?,
    };

    let delta = ConfigDelta {
        memory_mb: number("memory_mb")?,
        timeout_secs: number("timeout_secs")?,
        environment,
    };
    if delta.is_empty() {
        return Err(ServiceError::Rejected(
            "update_config carries no configuration changes".into(),
        ));
    }
    Ok(delta)
}

/// Runs a plan's actions one at a time in ascending `order`.
pub struct ExecutionSequencer {
    handlers: BTreeMap<ActionType, Arc<dyn ActionHandler>>,
    audit: Arc<dyn AuditSink>,
    unknown: UnknownActionPolicy,
}

impl ExecutionSequencer {
    pub fn new(audit: Arc<dyn AuditSink>, unknown: UnknownActionPolicy) -> Self {
        Self {
            handlers: BTreeMap::new(),
            audit,
            unknown,
        }
    }

    /// Sequencer with the `update_config` and `restart_service` handlers.
    pub fn with_builtin_handlers(
        controller: Arc<dyn ResourceController>,
        audit: Arc<dyn AuditSink>,
        unknown: UnknownActionPolicy,
    ) -> Self {
        Self::new(audit, unknown)
            .handler(
                ActionType::UpdateConfig,
                Arc::new(UpdateConfigHandler::new(controller.clone())),
            )
            .handler(ActionType::RestartService, Arc::new(RestartHandler::new(controller)))
    }

    pub fn handler(mut self, action_type: ActionType, handler: Arc<dyn ActionHandler>) -> Self {
        self.handlers.insert(action_type, handler);
        self
    }

    /// Returns one result per attempted action. A plan that needs approval
    /// yields no results and no handler runs; the first failure ends the
    /// sequence.
    pub async fn execute(&self, resource_id: &str, plan: &RemediationPlan) -> Vec<ExecutionResult> {
        if plan.approval_required() {
            tracing::info!(incident_id = %plan.incident_id, "plan awaits approval; nothing executed");
            return Vec::new();
        }

        let mut results = Vec::new();
        for action in plan.ordered_actions() {
            tracing::info!(
                incident_id = %plan.incident_id,
                order = action.order,
                action = %action.action_type,
                "executing action"
            );
            let result = self.run_action(resource_id, action).await;

            record(
                self.audit.as_ref(),
                AuditEntry::new(
                    &plan.incident_id,
                    "action_executed",
                    if result.success {
                        AuditResult::Success
                    } else {
                        AuditResult::Failure
                    },
                    json!({
                        "order": result.order,
                        "type": result.action_type,
                        "description": action.description,
                        "output": result.output,
                        "error": result.error,
                    }),
                ),
            )
            .await;

            let failed = !result.success;
            results.push(result);
            if failed {
                tracing::warn!(
                    incident_id = %plan.incident_id,
                    order = action.order,
                    "action failed; remaining actions skipped"
                );
                break;
            }
        }
        results
    }

    async fn run_action(&self, resource_id: &str, action: &RemediationAction) -> ExecutionResult {
        let outcome = match self.handlers.get(&action.action_type) {
            Some(handler) => handler.apply(resource_id, action).await.map_err(|e| e.to_string()),
            None => match self.unknown {
                UnknownActionPolicy::Acknowledge => Ok(json!({
                    "status": "not_implemented",
                    "type": action.action_type,
                })),
                UnknownActionPolicy::Reject => Err(format!(
                    "no handler registered for action type {}",
                    action.action_type
                )),
            },
        };

        let (success, output, error) = match outcome {
            Ok(output) => (true, Some(output), None),
            Err(error) => (false, None, Some(error)),
        };
        ExecutionResult {
            order: action.order,
            action_type: action.action_type,
            success,
            timestamp: Utc::now(),
            output,
            error,
        }
    }
}
