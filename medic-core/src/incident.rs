use chrono::{DateTime, Utc};
use medic_effects::{Effect, Effectful};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::ResponderError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
}

impl Severity {
    /// Lenient parse used at the intake boundary; unknown values map to `High`.
    pub fn parse_lenient(value: &str) -> Self {
        match value.to_lowercase().as_str() {
            "critical" => Severity::Critical,
            "medium" => Severity::Medium,
            "low" => Severity::Low,
            _ => Severity::High,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentStatus {
    Open,
    Investigating,
    Remediating,
    Resolved,
    Failed,
}

impl IncidentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IncidentStatus::Open => "open",
            IncidentStatus::Investigating => "investigating",
            IncidentStatus::Remediating => "remediating",
            IncidentStatus::Resolved => "resolved",
            IncidentStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Some(match value {
            "open" => IncidentStatus::Open,
            "investigating" => IncidentStatus::Investigating,
            "remediating" => IncidentStatus::Remediating,
            "resolved" => IncidentStatus::Resolved,
            "failed" => IncidentStatus::Failed,
            _ => return None,
        })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, IncidentStatus::Resolved | IncidentStatus::Failed)
    }

    /// Forward-only lifecycle: open -> investigating -> remediating ->
    /// resolved|failed. Any non-terminal state may fail. A failed incident
    /// is re-investigated by opening a new one, never by rewinding.
    pub fn can_transition_to(&self, next: IncidentStatus) -> bool {
        use IncidentStatus::*;
        match (self, next) {
            (Open, Investigating) => true,
            (Investigating, Remediating) => true,
            (Remediating, Resolved) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for IncidentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Incident {
    pub id: String,
    pub severity: Severity,
    /// Identifier of the serverless function the incident is about. May be
    /// empty when the trigger could not name one.
    pub resource_id: String,
    pub description: String,
    pub status: IncidentStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Incident {
    pub fn new(
        severity: Severity,
        resource_id: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self::with_id(
            uuid::Uuid::new_v4().to_string(),
            severity,
            resource_id,
            description,
        )
    }

    pub fn with_id(
        id: impl Into<String>,
        severity: Severity,
        resource_id: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            severity,
            resource_id: resource_id.into(),
            description: description.into(),
            status: IncidentStatus::Open,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn transition(&mut self, next: IncidentStatus) -> Result<(), ResponderError> {
        if !self.status.can_transition_to(next) {
            return Err(ResponderError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MetricPoint {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

/// Read-only snapshot of one metric over a bounded window, oldest first.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricSeries {
    pub name: String,
    pub points: Vec<MetricPoint>,
}

impl MetricSeries {
    pub fn new(name: impl Into<String>, points: Vec<MetricPoint>) -> Self {
        Self {
            name: name.into(),
            points,
        }
    }

    /// Series with evenly spaced points one minute apart, ending now.
    pub fn from_values(name: impl Into<String>, values: &[f64]) -> Self {
        let end = Utc::now();
        let len = values.len() as i64;
        let points = values
            .iter()
            .enumerate()
            .map(|(i, value)| MetricPoint {
                timestamp: end - chrono::Duration::minutes(len - 1 - i as i64),
                value: *value,
            })
            .collect();
        Self::new(name, points)
    }

    pub fn values(&self) -> Vec<f64> {
        self.points.iter().map(|p| p.value).collect()
    }

    pub fn sum(&self) -> f64 {
        self.points.iter().map(|p| p.value).sum()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DiagnosisResult {
    pub root_cause: String,
    /// In `[0, 1]`.
    pub confidence: f64,
    pub affected_components: Vec<String>,
    pub reasoning: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    UpdateConfig,
    RestartService,
    ScaleResources,
    Rollback,
    Custom,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::UpdateConfig => "update_config",
            ActionType::RestartService => "restart_service",
            ActionType::ScaleResources => "scale_resources",
            ActionType::Rollback => "rollback",
            ActionType::Custom => "custom",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Some(match value {
            "update_config" => ActionType::UpdateConfig,
            "restart_service" => ActionType::RestartService,
            "scale_resources" => ActionType::ScaleResources,
            "rollback" => ActionType::Rollback,
            "custom" => ActionType::Custom,
            _ => return None,
        })
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Every built-in action type is reversed by re-applying the prior
/// configuration.
impl Effectful for ActionType {
    fn effect(&self) -> Effect {
        Effect::Mutate
    }
}

pub type ActionParameters = BTreeMap<String, serde_json::Value>;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RemediationAction {
    #[serde(rename = "type")]
    pub action_type: ActionType,
    pub description: String,
    #[serde(default)]
    pub parameters: ActionParameters,
    pub order: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback: Option<Vec<RemediationAction>>,
}

impl RemediationAction {
    pub fn new(action_type: ActionType, order: u32, description: impl Into<String>) -> Self {
        Self {
            action_type,
            description: description.into(),
            parameters: ActionParameters::new(),
            order,
            rollback: None,
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn param_f64(&self, key: &str) -> Option<f64> {
        self.parameters.get(key).and_then(serde_json::Value::as_f64)
    }
}

impl Effectful for RemediationAction {
    fn effect(&self) -> Effect {
        self.action_type.effect()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SafetyCheckKind {
    RateLimit,
    ResourceLimit,
    DependencyCheck,
    RollbackAvailable,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SafetyCheck {
    pub kind: SafetyCheckKind,
    pub passed: bool,
    pub details: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RemediationPlan {
    pub incident_id: String,
    pub actions: Vec<RemediationAction>,
    approval_required: bool,
    pub safety_checks: Vec<SafetyCheck>,
    pub narrative: String,
}

impl RemediationPlan {
    /// `approval_required` is derived from the checks and cannot be set
    /// independently of them.
    pub fn new(
        incident_id: impl Into<String>,
        actions: Vec<RemediationAction>,
        safety_checks: Vec<SafetyCheck>,
        narrative: impl Into<String>,
    ) -> Self {
        let approval_required = safety_checks.iter().any(|check| !check.passed);
        Self {
            incident_id: incident_id.into(),
            actions,
            approval_required,
            safety_checks,
            narrative: narrative.into(),
        }
    }

    pub fn approval_required(&self) -> bool {
        self.approval_required
    }

    /// Actions in ascending `order`; ties keep their planned position.
    pub fn ordered_actions(&self) -> Vec<&RemediationAction> {
        let mut actions: Vec<&RemediationAction> = self.actions.iter().collect();
        actions.sort_by_key(|action| action.order);
        actions
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub order: u32,
    pub action_type: ActionType,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VerificationCheck {
    pub name: String,
    pub passed: bool,
    pub details: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub success: bool,
    pub metrics_improved: bool,
    pub checks: Vec<VerificationCheck>,
}

impl VerificationResult {
    /// `success` is the AND of every present check; an empty list passes.
    pub fn from_checks(checks: Vec<VerificationCheck>, metrics_improved: bool) -> Self {
        Self {
            success: checks.iter().all(|check| check.passed),
            metrics_improved,
            checks,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditResult {
    Success,
    Failure,
    /// Waiting on an external collaborator (e.g. human approval).
    Pending,
}

impl AuditResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditResult::Success => "success",
            AuditResult::Failure => "failure",
            AuditResult::Pending => "pending",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Some(match value {
            "success" => AuditResult::Success,
            "failure" => AuditResult::Failure,
            "pending" => AuditResult::Pending,
            _ => return None,
        })
    }
}

pub const SYSTEM_ACTOR: &str = "lambda-medic";

/// Append-only record of one orchestration step.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Option<i64>,
    pub incident_id: String,
    pub timestamp: DateTime<Utc>,
    pub action: String,
    pub actor: String,
    pub details: serde_json::Value,
    pub result: AuditResult,
}

impl AuditEntry {
    pub fn new(
        incident_id: impl Into<String>,
        action: impl Into<String>,
        result: AuditResult,
        details: serde_json::Value,
    ) -> Self {
        Self {
            id: None,
            incident_id: incident_id.into(),
            timestamp: Utc::now(),
            action: action.into(),
            actor: SYSTEM_ACTOR.into(),
            details,
            result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(passed: bool) -> SafetyCheck {
        SafetyCheck {
            kind: SafetyCheckKind::RateLimit,
            passed,
            details: String::new(),
        }
    }

    #[test]
    fn lifecycle_moves_forward_only() {
        let mut incident = Incident::new(Severity::High, "fn", "timeouts");
        incident.transition(IncidentStatus::Investigating).expect("investigate");
        assert!(incident.transition(IncidentStatus::Open).is_err());
        incident.transition(IncidentStatus::Remediating).expect("remediate");
        incident.transition(IncidentStatus::Resolved).expect("resolve");
        assert_eq!(incident.status, IncidentStatus::Resolved);
    }

    #[test]
    fn terminal_incidents_are_immutable() {
        let mut incident = Incident::new(Severity::Low, "fn", "x");
        incident.transition(IncidentStatus::Failed).expect("fail");
        let err = incident.transition(IncidentStatus::Failed).unwrap_err();
        assert!(matches!(
            err,
            ResponderError::InvalidTransition {
                from: IncidentStatus::Failed,
                to: IncidentStatus::Failed
            }
        ));
    }

    #[test]
    fn approval_required_iff_any_check_fails() {
        let plan = RemediationPlan::new("inc", vec![], vec![check(true), check(true)], "");
        assert!(!plan.approval_required());

        let plan = RemediationPlan::new("inc", vec![], vec![check(true), check(false)], "");
        assert!(plan.approval_required());
    }

    #[test]
    fn verification_success_is_and_of_checks() {
        let checks = vec![
            VerificationCheck {
                name: "a".into(),
                passed: true,
                details: String::new(),
            },
            VerificationCheck {
                name: "b".into(),
                passed: false,
                details: String::new(),
            },
        ];
        assert!(!VerificationResult::from_checks(checks, false).success);
        assert!(VerificationResult::from_checks(vec![], false).success);
    }

    #[test]
    fn action_serializes_type_field() {
        let action = RemediationAction::new(ActionType::UpdateConfig, 1, "raise memory")
            .with_param("memory_mb", 512);
        let json = serde_json::to_value(&action).expect("json");
        assert_eq!(json["type"], "update_config");
        assert_eq!(json["parameters"]["memory_mb"], 512);
        assert!(json.get("rollback").is_none());
    }

    #[test]
    fn ordered_actions_sorts_by_order() {
        let plan = RemediationPlan::new(
            "inc",
            vec![
                RemediationAction::new(ActionType::RestartService, 2, "restart"),
                RemediationAction::new(ActionType::UpdateConfig, 1, "config"),
            ],
            vec![],
            "",
        );
        let orders: Vec<u32> = plan.ordered_actions().iter().map(|a| a.order).collect();
        assert_eq!(orders, vec![1, 2]);
    }
}
