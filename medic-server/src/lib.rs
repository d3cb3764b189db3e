pub mod sim;
pub mod webhook;

use medic_core::audit_log::SqliteAuditLog;
use medic_core::llm::reasoning_from_config;
use medic_core::ports::ReasoningService;
use medic_core::store::SqliteIncidentStore;
use medic_core::{Orchestrator, ResponderConfig, Services, StoreError};
use std::sync::Arc;

use crate::sim::{CannedReasoning, SimulatedFunction};
use crate::webhook::AppState;

/// The configured LLM when its API key is present, otherwise the canned
/// local responder.
pub fn reasoning_service(config: &ResponderConfig) -> Arc<dyn ReasoningService> {
    if !config.llm.api_key_present() {
        tracing::info!(env = %config.llm.api_key_env, "no API key; using canned reasoning");
        return Arc::new(CannedReasoning);
    }
    match reasoning_from_config(&config.llm) {
        Ok(service) => {
            tracing::info!(provider = %config.llm.provider, model = %config.llm.model, "using LLM reasoning");
            service
        }
        Err(err) => {
            tracing::warn!(error = %err, "LLM unavailable; using canned reasoning");
            Arc::new(CannedReasoning)
        }
    }
}

/// Wires the SQLite stores and the simulated function into an orchestrator.
pub fn app_state(
    config: ResponderConfig,
    reasoning: Arc<dyn ReasoningService>,
) -> Result<AppState, StoreError> {
    let audit = SqliteAuditLog::open(&config.database_path)?;
    let store = Arc::new(SqliteIncidentStore::open(&config.database_path)?);
    let function = Arc::new(SimulatedFunction::default());

    let services = Services {
        telemetry: function.clone(),
        reasoning,
        controller: function,
        audit: Arc::new(audit.clone()),
        store: store.clone(),
    };
    Ok(AppState {
        orchestrator: Arc::new(Orchestrator::new(services, config)),
        store,
        audit,
    })
}
