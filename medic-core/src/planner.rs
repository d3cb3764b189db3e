use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::classifier::classify_remediation;
use crate::error::{Phase, ResponderError};
use crate::incident::{ActionParameters, ActionType, DiagnosisResult, Incident, RemediationAction, RemediationPlan};
use crate::ports::{ReasoningRequest, ReasoningService};
use crate::safety::SafetyGate;
use crate::tool_loop::Turn;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanningMode {
    /// Prose narrative interpreted by the keyword classifier.
    #[default]
    Keyword,
    /// JSON plan requested from the service; prose replies fall back to the
    /// keyword classifier.
    Structured,
}

const PREAMBLE: &str = "You are an SRE proposing the smallest safe remediation for a \
misconfigured AWS Lambda function.";

const STRUCTURED_SCHEMA: &str = r#"Return JSON only.
Schema: {"narrative":"string","actions":[{"type":"update_config|restart_service|scale_resources|rollback|custom","description":"string","parameters":{},"order":1}]}
Use parameters memory_mb and timeout_secs for update_config."#;

#[derive(Debug, Deserialize)]
struct StructuredPlan {
    #[serde(default)]
    narrative: String,
    actions: Vec<StructuredAction>,
}

#[derive(Debug, Deserialize)]
struct StructuredAction {
    #[serde(rename = "type")]
    action_type: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    parameters: ActionParameters,
    order: u32,
}

pub struct RemediationPlanner {
    reasoning: Arc<dyn ReasoningService>,
    gate: SafetyGate,
    mode: PlanningMode,
    temperature: f64,
    max_tokens: u64,
}

impl RemediationPlanner {
    pub fn new(reasoning: Arc<dyn ReasoningService>, gate: SafetyGate, mode: PlanningMode) -> Self {
        Self {
            reasoning,
            gate,
            mode,
            temperature: 0.2,
            max_tokens: 1024,
        }
    }

    pub fn with_sampling(mut self, temperature: f64, max_tokens: u64) -> Self {
        self.temperature = temperature;
        self.max_tokens = max_tokens;
        self
    }

    /// One request to the reasoning service (never the tool loop), then a
    /// deterministic derivation of actions and safety checks.
    pub async fn plan(
        &self,
        incident: &Incident,
        diagnosis: &DiagnosisResult,
    ) -> Result<RemediationPlan, ResponderError> {
        let mut prompt = format!(
            "Function: {}\nIncident: {}\nRoot cause: {}\nReasoning:\n{}\n\n\
             Describe the remediation steps.",
            incident.resource_id, incident.description, diagnosis.root_cause, diagnosis.reasoning
        );
        if self.mode == PlanningMode::Structured {
            prompt.push('\n');
            prompt.push_str(STRUCTURED_SCHEMA);
        }

        let request = ReasoningRequest {
            preamble: Some(PREAMBLE.into()),
            conversation: vec![Turn::user_text(prompt)],
            tools: Vec::new(),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        };
        let response = self
            .reasoning
            .respond(&request)
            .await
            .map_err(|source| ResponderError::TransientIo {
                phase: Phase::Plan,
                source,
            })?;
        let raw = response.text.unwrap_or_default();

        let (narrative, actions) = derive_actions(&raw, self.mode)?;
        let checks = self.gate.evaluate(&actions);
        Ok(RemediationPlan::new(&incident.id, actions, checks, narrative))
    }
}

/// Turns the service's reply into actions according to `mode`.
pub fn derive_actions(
    raw: &str,
    mode: PlanningMode,
) -> Result<(String, Vec<RemediationAction>), ResponderError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ResponderError::ParseFailure(
            "empty remediation narrative".into(),
        ));
    }

    if mode == PlanningMode::Structured {
        if let Some(json) = json_body(trimmed) {
            return parse_structured(json);
        }
        tracing::debug!("structured plan requested but reply is prose; using keyword classifier");
    }
    Ok((trimmed.to_string(), classify_remediation(trimmed)))
}

/// The JSON object in a reply, unwrapping a ```json fence if present.
fn json_body(text: &str) -> Option<&str> {
    let unfenced = text
        .strip_prefix("```json")
        .or_else(|| text.strip_prefix("```"))
        .and_then(|rest| rest.trim_end().strip_suffix("```"))
        .map(str::trim)
        .unwrap_or(text);
    unfenced.starts_with('{').then_some(unfenced)
}

fn parse_structured(json: &str) -> Result<(String, Vec<RemediationAction>), ResponderError> {
    let plan: StructuredPlan = serde_json::from_str(json)
        .map_err(|e| ResponderError::ParseFailure(format!("invalid plan json: {e}")))?;
    if plan.actions.is_empty() {
        return Err(ResponderError::ParseFailure("plan has no actions".into()));
    }

    let actions = plan
        .actions
        .into_iter()
        .map(|a| {
            let action_type = ActionType::parse(&a.action_type).ok_or_else(|| {
                ResponderError::ParseFailure(format!("unknown action type '{}'", a.action_type))
            })?;
            Ok(RemediationAction {
                action_type,
                description: a.description,
                parameters: a.parameters,
                order: a.order,
                rollback: None,
            })
        })
        .collect::<Result<Vec<_>, ResponderError>>()?;
    Ok((plan.narrative, actions))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ServiceError;
    use crate::incident::{SafetyCheckKind, Severity};
    use crate::ports::ReasoningResponse;
    use async_trait::async_trait;
    use chrono::Utc;

    struct Echo;

    /// Replies with the incident line of the prompt, mimicking a model that
    /// restates the problem as its remediation.
    #[async_trait]
    impl ReasoningService for Echo {
        async fn respond(
            &self,
            request: &ReasoningRequest,
        ) -> Result<ReasoningResponse, ServiceError> {
            let prompt = request.conversation[0].text().unwrap_or_default();
            let incident_line = prompt
                .lines()
                .find(|l| l.starts_with("Incident:"))
                .unwrap_or_default();
            Ok(ReasoningResponse::text(incident_line))
        }
    }

    struct Fixed(&'static str);

    #[async_trait]
    impl ReasoningService for Fixed {
        async fn respond(&self, _: &ReasoningRequest) -> Result<ReasoningResponse, ServiceError> {
            Ok(ReasoningResponse::text(self.0))
        }
    }

    fn diagnosis() -> DiagnosisResult {
        DiagnosisResult {
            root_cause: "misconfigured".into(),
            confidence: 0.85,
            affected_components: vec!["fn".into()],
            reasoning: "see metrics".into(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn timeout_and_memory_incident_plans_single_update_config() {
        let planner = RemediationPlanner::new(
            Arc::new(Echo),
            SafetyGate::default(),
            PlanningMode::Keyword,
        );
        let incident = Incident::new(
            Severity::High,
            "orders-fn",
            "Invocations hit the timeout; memory looks undersized",
        );

        let plan = planner.plan(&incident, &diagnosis()).await.expect("plan");

        assert_eq!(plan.actions.len(), 1);
        let action = &plan.actions[0];
        assert_eq!(action.action_type, ActionType::UpdateConfig);
        assert_eq!(action.order, 1);
        assert_eq!(action.param_f64("memory_mb"), Some(512.0));
        assert_eq!(action.param_f64("timeout_secs"), Some(30.0));
        assert!(!plan
            .actions
            .iter()
            .any(|a| a.action_type == ActionType::RestartService));
        assert!(!plan.approval_required());
        assert_eq!(plan.safety_checks.len(), 3);
        assert_eq!(plan.incident_id, incident.id);
    }

    #[tokio::test]
    async fn empty_reply_is_parse_failure() {
        let planner =
            RemediationPlanner::new(Arc::new(Fixed("  ")), SafetyGate::default(), PlanningMode::Keyword);
        let incident = Incident::new(Severity::Low, "fn", "x");
        let err = planner.plan(&incident, &diagnosis()).await.unwrap_err();
        assert!(matches!(err, ResponderError::ParseFailure(_)));
    }

    #[test]
    fn structured_reply_is_used_verbatim() {
        let raw = r#"```json
{"narrative":"scale up","actions":[{"type":"scale_resources","description":"more concurrency","parameters":{"reserved_concurrency":50},"order":1}]}
```"#;
        let (narrative, actions) = derive_actions(raw, PlanningMode::Structured).expect("derive");
        assert_eq!(narrative, "scale up");
        assert_eq!(actions[0].action_type, ActionType::ScaleResources);
        assert_eq!(actions[0].param_f64("reserved_concurrency"), Some(50.0));
    }

    #[test]
    fn invalid_structured_reply_is_parse_failure() {
        let raw = r#"{"actions":[{"type":"delete_function","order":1}]}"#;
        let err = derive_actions(raw, PlanningMode::Structured).unwrap_err();
        assert!(err.to_string().contains("delete_function"));

        let err = derive_actions("{not json", PlanningMode::Structured).unwrap_err();
        assert!(matches!(err, ResponderError::ParseFailure(_)));
    }

    #[test]
    fn structured_mode_falls_back_to_keywords_for_prose() {
        let (_, actions) =
            derive_actions("Redeploy the function.", PlanningMode::Structured).expect("derive");
        assert_eq!(actions[0].action_type, ActionType::RestartService);
    }

    #[tokio::test]
    async fn oversized_structured_plan_requires_approval() {
        let reply = r#"{"narrative":"max it","actions":[{"type":"update_config","parameters":{"memory_mb":65536},"order":1}]}"#;
        let planner = RemediationPlanner::new(
            Arc::new(Fixed(reply)),
            SafetyGate::default(),
            PlanningMode::Structured,
        );
        let incident = Incident::new(Severity::High, "fn", "oom");
        let plan = planner.plan(&incident, &diagnosis()).await.expect("plan");

        assert!(plan.approval_required());
        let failed: Vec<SafetyCheckKind> = plan
            .safety_checks
            .iter()
            .filter(|c| !c.passed)
            .map(|c| c.kind)
            .collect();
        assert_eq!(failed, vec![SafetyCheckKind::ResourceLimit]);
    }
}
