pub mod audit_log;
pub mod classifier;
pub mod config;
pub mod diagnosis;
pub mod error;
pub mod executor;
pub mod incident;
pub mod lease;
pub mod llm;
pub mod memory;
pub mod orchestrator;
pub mod planner;
pub mod ports;
pub mod safety;
pub mod store;
pub mod telemetry;
pub mod tool_loop;
pub mod tools;
pub mod verifier;

pub use config::ResponderConfig;
pub use error::{ResponderError, ServiceError, StoreError};
pub use incident::{Incident, IncidentStatus, Severity};
pub use orchestrator::{IncidentReport, Orchestrator, Outcome};
pub use ports::Services;
