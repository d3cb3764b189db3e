use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use medic_core::audit_log::SqliteAuditLog;
use medic_core::incident::{AuditEntry, Incident, Severity};
use medic_core::ports::IncidentStore;
use medic_core::{Orchestrator, ResponderError, StoreError};
use serde_json::json;
use std::sync::Arc;
use trigger_registry::{parse_generic, validate_trigger_v1, IncidentTriggerV1, INCIDENT_SCHEMA_V1};

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub store: Arc<dyn IncidentStore>,
    pub audit: SqliteAuditLog,
}

pub trait TriggerAdapter: Send + Sync + 'static {
    fn parse(&self, payload: &serde_json::Value) -> Result<IncidentTriggerV1, String>;
}

pub struct GenericAdapter;

/// CloudWatch alarm notification as delivered through SNS.
pub struct CloudWatchAlarmAdapter;

impl TriggerAdapter for GenericAdapter {
    fn parse(&self, payload: &serde_json::Value) -> Result<IncidentTriggerV1, String> {
        parse_generic(payload)
    }
}

impl TriggerAdapter for CloudWatchAlarmAdapter {
    fn parse(&self, payload: &serde_json::Value) -> Result<IncidentTriggerV1, String> {
        let alarm_name = payload
            .get("AlarmName")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| "cloudwatch payload missing AlarmName".to_string())?;
        let reason = payload
            .get("NewStateReason")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default();

        let resource_id = payload
            .pointer("/Trigger/Dimensions")
            .and_then(serde_json::Value::as_array)
            .and_then(|dims| {
                dims.iter().find(|d| {
                    d.get("name").and_then(serde_json::Value::as_str) == Some("FunctionName")
                })
            })
            .and_then(|d| d.get("value"))
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default()
            .to_string();

        let description = if reason.is_empty() {
            alarm_name.to_string()
        } else {
            format!("{alarm_name}: {reason}")
        };

        let trigger = IncidentTriggerV1 {
            schema: INCIDENT_SCHEMA_V1.into(),
            id: None,
            description,
            severity: "high".into(),
            resource_id,
            source: "cloudwatch".into(),
        };
        validate_trigger_v1(&trigger)?;
        Ok(trigger)
    }
}

pub fn webhook_router(state: AppState) -> Router {
    Router::new()
        .route("/webhook/incident", post(handle_incident))
        .route("/webhook/cloudwatch", post(handle_cloudwatch))
        .route("/incidents", get(list_incidents))
        .route("/incidents/:id/audit", get(incident_audit))
        .with_state(state)
}

async fn handle_incident(
    State(state): State<AppState>,
    Json(payload): Json<serde_json::Value>,
) -> (StatusCode, Json<serde_json::Value>) {
    accept(&state, GenericAdapter.parse(&payload)).await
}

async fn handle_cloudwatch(
    State(state): State<AppState>,
    Json(payload): Json<serde_json::Value>,
) -> (StatusCode, Json<serde_json::Value>) {
    accept(&state, CloudWatchAlarmAdapter.parse(&payload)).await
}

pub fn incident_from_trigger(trigger: IncidentTriggerV1) -> Incident {
    let severity = Severity::parse_lenient(&trigger.severity);
    match trigger.id {
        Some(id) => Incident::with_id(id, severity, trigger.resource_id, trigger.description),
        None => Incident::new(severity, trigger.resource_id, trigger.description),
    }
}

/// Opens an incident for a valid trigger and drives it in the background.
/// A trigger reusing the id of a stored incident is a conflict.
async fn accept(
    state: &AppState,
    trigger: Result<IncidentTriggerV1, String>,
) -> (StatusCode, Json<serde_json::Value>) {
    let trigger = match trigger {
        Ok(trigger) => trigger,
        Err(err) => {
            tracing::warn!(error = %err, "rejected trigger");
            return (StatusCode::BAD_REQUEST, Json(json!({ "error": err })));
        }
    };

    let source = trigger.source.clone();
    let incident = incident_from_trigger(trigger);
    let incident_id = incident.id.clone();

    match state.orchestrator.open(&incident).await {
        Ok(()) => {}
        Err(ResponderError::Store(StoreError::AlreadyExists(id))) => {
            tracing::warn!(incident_id = %id, "duplicate incident id");
            return (
                StatusCode::CONFLICT,
                Json(json!({ "error": format!("incident {id} already exists") })),
            );
        }
        Err(err) => {
            tracing::error!(%incident_id, error = %err, "incident could not be opened");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": err.to_string() })),
            );
        }
    }
    tracing::info!(%incident_id, %source, resource_id = %incident.resource_id, "incident accepted");

    let orchestrator = state.orchestrator.clone();
    tokio::spawn(async move {
        let id = incident.id.clone();
        match orchestrator.run(incident).await {
            Ok(report) => tracing::info!(incident_id = %id, outcome = ?report.outcome, "incident finished"),
            Err(err) => tracing::error!(incident_id = %id, error = %err, "incident could not be processed"),
        }
    });

    (
        StatusCode::ACCEPTED,
        Json(json!({ "incident_id": incident_id })),
    )
}

async fn list_incidents(
    State(state): State<AppState>,
) -> Result<Json<Vec<Incident>>, (StatusCode, String)> {
    state
        .store
        .list_open()
        .await
        .map(Json)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

async fn incident_audit(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<AuditEntry>>, (StatusCode, String)> {
    let internal = |e: medic_core::StoreError| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
    if state.store.get(&id).await.map_err(internal)?.is_none() {
        return Err((StatusCode::NOT_FOUND, format!("incident {id} not found")));
    }
    state.audit.entries_for_incident(&id).map(Json).map_err(internal)
}
