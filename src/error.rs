//! Error taxonomy
//!
//! Every failure the control plane can surface, classified by kind so
//! callers can decide whether to recover, abort the request, or abort
//! the process.

use thiserror::Error;

/// Crate-wide error type.
///
/// Budget, approval, signature, safety, configuration, and validation
/// errors surface to the caller. Store errors are recovered locally where
/// the pipeline allows it. Provider and execution errors fail the request
/// but never the process.
#[derive(Debug, Error)]
pub enum AgencyError {
    /// Missing or invalid environment, credential, or registry entry.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Invalid caller input (empty agent name, negative amount, bad range).
    #[error("validation error: {0}")]
    Validation(String),

    /// Monthly cap or per-request debit cap breach.
    #[error("budget exceeded for {agent}: requested ${requested:.2}, spent ${spent:.2} of ${limit:.2}")]
    BudgetExceeded {
        agent: String,
        requested: f64,
        spent: f64,
        limit: f64,
    },

    /// The approval capability returned a non-approved status.
    #[error("approval denied for {service}: {status}")]
    ApprovalDenied { service: String, status: String },

    /// Audit or receipt signature failed verification.
    #[error("signature verification failed for {context}")]
    Signature { context: String },

    /// The safety gate rejected a task or response.
    #[error("blocked by safety gate: {0}")]
    SafetyBlocked(String),

    /// An LLM, sandbox, or benchmark capability failed.
    #[error("provider error ({capability}): {message}")]
    Provider { capability: String, message: String },

    /// Memory or trajectory persistence is unreachable.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// An agent tool raised unexpectedly.
    #[error("execution error: {0}")]
    Execution(String),

    /// Sandbox validation, rubric gate, or benchmark gate failed.
    #[error("evolution error: {0}")]
    Evolution(String),
}

impl AgencyError {
    /// Stable machine-readable kind, used in error envelopes and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            AgencyError::Configuration(_) => "configuration",
            AgencyError::Validation(_) => "validation",
            AgencyError::BudgetExceeded { .. } => "budget_exceeded",
            AgencyError::ApprovalDenied { .. } => "approval_denied",
            AgencyError::Signature { .. } => "signature",
            AgencyError::SafetyBlocked(_) => "safety_blocked",
            AgencyError::Provider { .. } => "provider",
            AgencyError::StoreUnavailable(_) => "store_unavailable",
            AgencyError::Execution(_) => "execution",
            AgencyError::Evolution(_) => "evolution",
        }
    }

    pub fn provider(capability: impl Into<String>, message: impl Into<String>) -> Self {
        AgencyError::Provider {
            capability: capability.into(),
            message: message.into(),
        }
    }
}

pub type AgencyResult<T> = std::result::Result<T, AgencyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds_are_stable() {
        let err = AgencyError::BudgetExceeded {
            agent: "email".into(),
            requested: 30.0,
            spent: 180.0,
            limit: 200.0,
        };
        assert_eq!(err.kind(), "budget_exceeded");
        assert!(err.to_string().contains("$30.00"));

        assert_eq!(AgencyError::SafetyBlocked("x".into()).kind(), "safety_blocked");
        assert_eq!(
            AgencyError::provider("llm", "timeout").kind(),
            "provider"
        );
    }
}
