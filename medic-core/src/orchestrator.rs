//! Drives one incident through Investigate, Diagnose, Plan, Execute and
//! Verify, recording each transition in the audit trail.

use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;

use crate::audit_log::record;
use crate::config::ResponderConfig;
use crate::diagnosis::{DiagnosisInput, DiagnosisRequester};
use crate::error::{Phase, ResponderError};
use crate::executor::ExecutionSequencer;
use crate::incident::{
    AuditEntry, AuditResult, DiagnosisResult, ExecutionResult, Incident, IncidentStatus,
    RemediationPlan, VerificationResult,
};
use crate::lease::ResourceLeases;
use crate::planner::RemediationPlanner;
use crate::ports::Services;
use crate::safety::SafetyGate;
use crate::telemetry::{analyze_anomalies, collect_snapshot, AnomalyReport};
use crate::tools::ToolRegistry;
use crate::verifier::Verifier;

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    Resolved,
    Failed { phase: Phase, reason: String },
    /// The plan failed a safety check; an external approval workflow owns
    /// the incident from here.
    AwaitingApproval,
}

#[derive(Clone, Debug, Serialize)]
pub struct IncidentReport {
    pub incident: Incident,
    pub outcome: Outcome,
    pub anomalies: BTreeMap<String, AnomalyReport>,
    pub diagnosis: Option<DiagnosisResult>,
    pub plan: Option<RemediationPlan>,
    pub executions: Vec<ExecutionResult>,
    pub verification: Option<VerificationResult>,
}

impl IncidentReport {
    fn new(incident: Incident) -> Self {
        Self {
            incident,
            outcome: Outcome::AwaitingApproval,
            anomalies: BTreeMap::new(),
            diagnosis: None,
            plan: None,
            executions: Vec::new(),
            verification: None,
        }
    }
}

pub struct Orchestrator {
    services: Services,
    config: ResponderConfig,
    tools: Option<ToolRegistry>,
    diagnosis: DiagnosisRequester,
    planner: RemediationPlanner,
    sequencer: ExecutionSequencer,
    verifier: Verifier,
    leases: ResourceLeases,
}

impl Orchestrator {
    pub fn new(services: Services, config: ResponderConfig) -> Self {
        let pipeline = &config.pipeline;
        let tools = pipeline.tool_loop.then(|| {
            ToolRegistry::with_builtin_tools(
                services.telemetry.clone(),
                services.controller.clone(),
            )
        });
        let diagnosis = DiagnosisRequester::new(services.reasoning.clone(), pipeline.diagnosis());
        let planner = RemediationPlanner::new(
            services.reasoning.clone(),
            SafetyGate::new(config.safety.clone()),
            pipeline.planning_mode,
        )
        .with_sampling(pipeline.diagnosis_temperature, pipeline.max_tokens);
        let sequencer = ExecutionSequencer::with_builtin_handlers(
            services.controller.clone(),
            services.audit.clone(),
            config.unknown_actions,
        );
        let verifier = Verifier::new(
            services.telemetry.clone(),
            services.controller.clone(),
            config.verify.clone(),
        );

        Self {
            services,
            config,
            tools,
            diagnosis,
            planner,
            sequencer,
            verifier,
            leases: ResourceLeases::default(),
        }
    }

    /// Shares execution leases with other orchestrators working the same
    /// fleet.
    pub fn with_leases(mut self, leases: ResourceLeases) -> Self {
        self.leases = leases;
        self
    }

    pub fn config(&self) -> &ResponderConfig {
        &self.config
    }

    /// Records a new incident and runs the full pipeline for it.
    ///
    /// Phase failures end in [`Outcome::Failed`] after the incident is marked
    /// failed and audited. `Err` is reserved for incidents that cannot be
    /// opened (an id already in the store) and failures to persist state.
    pub async fn handle(&self, incident: Incident) -> Result<IncidentReport, ResponderError> {
        self.open(&incident).await?;
        self.run(incident).await
    }

    /// Stores a new `open` incident and audits its receipt. An id that is
    /// already stored is rejected with [`StoreError::AlreadyExists`], whatever
    /// state that incident is in.
    ///
    /// [`StoreError::AlreadyExists`]: crate::error::StoreError::AlreadyExists
    pub async fn open(&self, incident: &Incident) -> Result<(), ResponderError> {
        ensure_open(incident)?;
        self.services.store.save(incident).await?;
        self.audit(
            incident,
            "incident_received",
            AuditResult::Success,
            json!({
                "severity": incident.severity,
                "resource_id": incident.resource_id,
                "description": incident.description,
            }),
        )
        .await;
        Ok(())
    }

    /// Drives an already stored `open` incident through the pipeline.
    pub async fn run(&self, mut incident: Incident) -> Result<IncidentReport, ResponderError> {
        ensure_open(&incident)?;
        self.advance(&mut incident, IncidentStatus::Investigating).await?;
        let mut report = IncidentReport::new(incident.clone());

        match self.run_phases(&mut incident, &mut report).await {
            Ok(outcome) => report.outcome = outcome,
            Err(err @ (ResponderError::Store(_) | ResponderError::InvalidTransition { .. })) => {
                return Err(err)
            }
            Err(err) => {
                report.outcome = self.fail(&mut incident, &err).await?;
            }
        }
        report.incident = incident;
        Ok(report)
    }

    /// Re-drives every incident the store reports as `open`, from the stored
    /// record. An incident that cannot be persisted is logged and skipped.
    pub async fn process_open(&self) -> Result<Vec<IncidentReport>, ResponderError> {
        let open = self.services.store.list_open().await?;
        tracing::info!(count = open.len(), "processing open incidents");

        let mut reports = Vec::with_capacity(open.len());
        for incident in open {
            let id = incident.id.clone();
            match self.run(incident).await {
                Ok(report) => reports.push(report),
                Err(err) => tracing::error!(incident_id = %id, error = %err, "incident not processed"),
            }
        }
        Ok(reports)
    }

    async fn run_phases(
        &self,
        incident: &mut Incident,
        report: &mut IncidentReport,
    ) -> Result<Outcome, ResponderError> {
        let pipeline = &self.config.pipeline;

        // Investigate
        self.audit(
            incident,
            "investigation_started",
            AuditResult::Success,
            json!({ "lookback_minutes": pipeline.lookback_minutes }),
        )
        .await;
        let snapshot = collect_snapshot(
            self.services.telemetry.as_ref(),
            &incident.resource_id,
            &pipeline.investigation_window(),
        )
        .await;
        self.audit(
            incident,
            "telemetry_collected",
            if snapshot.failures.is_empty() {
                AuditResult::Success
            } else {
                AuditResult::Failure
            },
            json!({
                "metrics": snapshot.metrics.iter().map(|m| &m.name).collect::<Vec<_>>(),
                "log_lines": snapshot.logs.len(),
                "failures": snapshot.failures,
            }),
        )
        .await;

        report.anomalies = snapshot
            .metrics
            .iter()
            .map(|series| {
                (
                    series.name.clone(),
                    analyze_anomalies(series, pipeline.z_threshold),
                )
            })
            .collect();
        let flagged: Vec<&String> = report
            .anomalies
            .iter()
            .filter(|(_, r)| r.has_anomaly)
            .map(|(name, _)| name)
            .collect();
        self.audit(
            incident,
            "anomalies_detected",
            AuditResult::Success,
            json!({ "z_threshold": pipeline.z_threshold, "flagged": flagged, "reports": report.anomalies }),
        )
        .await;

        // Diagnose
        let diagnosis = self
            .diagnosis
            .diagnose(
                &DiagnosisInput {
                    resource_id: &incident.resource_id,
                    description: &incident.description,
                    metrics: &snapshot.metrics,
                    logs: &snapshot.logs,
                },
                self.tools.as_ref(),
            )
            .await?;
        if let Some(tool_loop) = diagnosis.tool_loop.as_ref().filter(|t| t.exhausted) {
            tracing::warn!(incident_id = %incident.id, iterations = tool_loop.iterations, "tool loop budget exhausted");
            self.audit(
                incident,
                "iterations_exhausted",
                AuditResult::Success,
                json!({
                    "iterations": tool_loop.iterations,
                    "tool_calls": tool_loop.tool_calls,
                }),
            )
            .await;
        }
        self.audit(
            incident,
            "diagnosis_completed",
            AuditResult::Success,
            json!({
                "root_cause": diagnosis.result.root_cause,
                "confidence": diagnosis.result.confidence,
                "tool_calls": diagnosis.tool_loop.as_ref().map_or(0, |t| t.tool_calls),
            }),
        )
        .await;
        let diagnosis = diagnosis.result;
        report.diagnosis = Some(diagnosis.clone());

        // Plan
        let plan = self.planner.plan(incident, &diagnosis).await?;
        self.audit(
            incident,
            "plan_created",
            AuditResult::Success,
            json!({
                "actions": plan.actions,
                "safety_checks": plan.safety_checks,
                "approval_required": plan.approval_required(),
            }),
        )
        .await;
        report.plan = Some(plan.clone());

        if plan.approval_required() {
            let failed: Vec<_> = plan.safety_checks.iter().filter(|c| !c.passed).collect();
            tracing::info!(incident_id = %incident.id, "plan requires approval");
            self.audit(
                incident,
                "approval_required",
                AuditResult::Pending,
                json!({ "failed_checks": failed }),
            )
            .await;
            self.services
                .store
                .update_status(
                    &incident.id,
                    incident.status,
                    Some(json!({ "awaiting_approval": true })),
                )
                .await?;
            return Ok(Outcome::AwaitingApproval);
        }

        // Execute
        self.advance(incident, IncidentStatus::Remediating).await?;
        let executions = {
            let _lease = self.leases.acquire(&incident.resource_id).await;
            self.sequencer.execute(&incident.resource_id, &plan).await
        };
        report.executions = executions.clone();
        let failure = executions.iter().find(|r| !r.success);
        self.audit(
            incident,
            "execution_completed",
            if failure.is_none() {
                AuditResult::Success
            } else {
                AuditResult::Failure
            },
            json!({ "attempted": executions.len(), "planned": plan.actions.len() }),
        )
        .await;
        if let Some(failed) = failure {
            return Err(ResponderError::ExecutionFailed {
                order: failed.order,
                action_type: failed.action_type.to_string(),
                message: failed.error.clone().unwrap_or_default(),
            });
        }

        // Verify
        let verification = self.verifier.verify(incident).await;
        self.audit(
            incident,
            "verification_completed",
            if verification.success {
                AuditResult::Success
            } else {
                AuditResult::Failure
            },
            json!(verification),
        )
        .await;
        report.verification = Some(verification.clone());
        if !verification.success {
            let failed = verification
                .checks
                .iter()
                .filter(|c| !c.passed)
                .map(|c| format!("{}: {}", c.name, c.details))
                .collect::<Vec<_>>()
                .join("; ");
            return Err(ResponderError::VerificationFailed(failed));
        }

        self.advance(incident, IncidentStatus::Resolved).await?;
        self.audit(
            incident,
            "incident_resolved",
            AuditResult::Success,
            json!({ "metrics_improved": verification.metrics_improved }),
        )
        .await;
        tracing::info!(incident_id = %incident.id, "incident resolved");
        Ok(Outcome::Resolved)
    }

    async fn advance(
        &self,
        incident: &mut Incident,
        next: IncidentStatus,
    ) -> Result<(), ResponderError> {
        incident.transition(next)?;
        self.services
            .store
            .update_status(&incident.id, next, None)
            .await?;
        tracing::info!(incident_id = %incident.id, status = %next, "incident status changed");
        Ok(())
    }

    async fn fail(
        &self,
        incident: &mut Incident,
        err: &ResponderError,
    ) -> Result<Outcome, ResponderError> {
        let phase = err.phase();
        let reason = err.to_string();
        tracing::error!(incident_id = %incident.id, %phase, error = %reason, "incident failed");

        incident.transition(IncidentStatus::Failed)?;
        let details = json!({ "phase": phase, "error": reason });
        self.services
            .store
            .update_status(&incident.id, IncidentStatus::Failed, Some(details.clone()))
            .await?;
        self.audit(incident, "incident_failed", AuditResult::Failure, details)
            .await;
        Ok(Outcome::Failed { phase, reason })
    }

    async fn audit(
        &self,
        incident: &Incident,
        action: &str,
        result: AuditResult,
        details: serde_json::Value,
    ) {
        record(
            self.services.audit.as_ref(),
            AuditEntry::new(&incident.id, action, result, details),
        )
        .await;
    }
}

fn ensure_open(incident: &Incident) -> Result<(), ResponderError> {
    if incident.status != IncidentStatus::Open {
        return Err(ResponderError::InvalidTransition {
            from: incident.status,
            to: IncidentStatus::Investigating,
        });
    }
    Ok(())
}
