//! Mutate-then-confirm over an eventually consistent registry.

pub mod orchestrator;
pub mod poller;
pub mod predicates;

use crate::services::registry::RegistryError;
use service_core::error::AppError;
use thiserror::Error;

pub use orchestrator::MutationOrchestrator;
pub use poller::{ConfirmationPoller, PollOutcome, PollPolicy};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("{operation} for '{identifier}' not confirmed after {attempts} attempts")]
    Timeout {
        operation: &'static str,
        identifier: String,
        attempts: u32,
    },

    #[error("{operation} for '{identifier}' cancelled")]
    Cancelled {
        operation: &'static str,
        identifier: String,
    },
}

impl ReconcileError {
    /// Label for the reconcile outcome metric.
    pub fn outcome_label(&self) -> &'static str {
        match self {
            ReconcileError::Registry(_) => "query_failed",
            ReconcileError::Timeout { .. } => "timeout",
            ReconcileError::Cancelled { .. } => "cancelled",
        }
    }
}

impl From<ReconcileError> for AppError {
    fn from(err: ReconcileError) -> Self {
        match err {
            ReconcileError::Registry(inner) => inner.into(),
            ReconcileError::Timeout { .. } => AppError::GatewayTimeout(err.to_string()),
            ReconcileError::Cancelled { .. } => AppError::ServiceUnavailable(Some(err.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use service_core::axum::http::StatusCode;

    #[test]
    fn test_timeout_and_cancel_map_to_distinct_statuses() {
        let timeout = ReconcileError::Timeout {
            operation: "create_device",
            identifier: "dev-1".to_string(),
            attempts: 50,
        };
        let cancelled = ReconcileError::Cancelled {
            operation: "delete_device",
            identifier: "dev-1".to_string(),
        };

        assert_eq!(timeout.outcome_label(), "timeout");
        assert_eq!(AppError::from(timeout).status_code(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            AppError::from(cancelled).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            AppError::from(ReconcileError::from(RegistryError::already_exists("device", "d")))
                .status_code(),
            StatusCode::CONFLICT
        );
    }
}
