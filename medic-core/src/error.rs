//! Error taxonomy for the responder.
//!
//! Collaborator calls fail with [`ServiceError`]; persistence with
//! [`StoreError`]. The pipeline wraps both into [`ResponderError`], whose
//! variants decide whether a phase degrades or the incident fails.

use crate::incident::IncidentStatus;

/// Failure of a call to an external collaborator (telemetry, reasoning
/// service, resource controller, audit sink).
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ServiceError {
    #[error("service unavailable: {0}")]
    Unavailable(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    /// The collaborator answered but refused the request.
    #[error("request rejected: {0}")]
    Rejected(String),
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("incident not found: {0}")]
    NotFound(String),

    #[error("incident {0} already exists")]
    AlreadyExists(String),

    #[error("incident {id} is {status} and can no longer change")]
    Immutable { id: String, status: IncidentStatus },
}

/// Pipeline phase an error surfaced in. Recorded in the audit trail.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Intake,
    Investigate,
    Diagnose,
    Plan,
    Execute,
    Verify,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Intake => "intake",
            Phase::Investigate => "investigate",
            Phase::Diagnose => "diagnose",
            Phase::Plan => "plan",
            Phase::Execute => "execute",
            Phase::Verify => "verify",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ResponderError {
    /// A collaborator call failed in a phase that cannot degrade.
    #[error("{phase} phase I/O failure: {source}")]
    TransientIo {
        phase: Phase,
        #[source]
        source: ServiceError,
    },

    #[error("diagnosis failed: {0}")]
    DiagnosisFailed(#[source] ServiceError),

    /// The reasoning service's plan could not be interpreted.
    #[error("could not parse remediation plan: {0}")]
    ParseFailure(String),

    #[error("action {order} ({action_type}) failed: {message}")]
    ExecutionFailed {
        order: u32,
        action_type: String,
        message: String,
    },

    #[error("verification failed: {0}")]
    VerificationFailed(String),

    #[error("invalid status transition {from} -> {to}")]
    InvalidTransition {
        from: IncidentStatus,
        to: IncidentStatus,
    },

    #[error("incident not found: {0}")]
    IncidentNotFound(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ResponderError {
    pub fn phase(&self) -> Phase {
        match self {
            ResponderError::TransientIo { phase, .. } => *phase,
            ResponderError::DiagnosisFailed(_) => Phase::Diagnose,
            ResponderError::ParseFailure(_) => Phase::Plan,
            ResponderError::ExecutionFailed { .. } => Phase::Execute,
            ResponderError::VerificationFailed(_) => Phase::Verify,
            ResponderError::InvalidTransition { .. }
            | ResponderError::IncidentNotFound(_)
            | ResponderError::Store(_) => Phase::Intake,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_phase_and_cause() {
        let err = ResponderError::TransientIo {
            phase: Phase::Execute,
            source: ServiceError::Timeout("update_config".into()),
        };
        assert_eq!(
            err.to_string(),
            "execute phase I/O failure: request timed out: update_config"
        );
        assert_eq!(err.phase(), Phase::Execute);
    }

    #[test]
    fn phase_follows_variant() {
        assert_eq!(
            ResponderError::ParseFailure("empty".into()).phase(),
            Phase::Plan
        );
        assert_eq!(
            ResponderError::DiagnosisFailed(ServiceError::Unavailable("llm".into())).phase(),
            Phase::Diagnose
        );
    }
}
