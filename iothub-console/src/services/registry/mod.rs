//! Registry and provisioning client seams.
//!
//! The console talks to the device registry and the provisioning service only
//! through these traits. Both are stateless remote-call facades, shared across
//! requests behind an `Arc`.

pub mod memory;

use crate::models::{Attestation, Device, Enrollment, EnrollmentKind, Module, Twin};
use async_trait::async_trait;
use service_core::error::AppError;
use thiserror::Error;

pub use memory::{InMemoryProvisioning, InMemoryRegistry};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("{resource} '{id}' not found")]
    NotFound { resource: &'static str, id: String },

    #[error("{resource} '{id}' already exists")]
    AlreadyExists { resource: &'static str, id: String },

    #[error("enrollment '{id}' uses unsupported attestation '{kind}'")]
    UnsupportedAttestation { id: String, kind: String },

    #[error("{operation} for '{id}' failed transiently: {message}")]
    Transient {
        operation: &'static str,
        id: String,
        message: String,
    },

    #[error("{operation} for '{id}' failed: {message}")]
    Upstream {
        operation: &'static str,
        id: String,
        message: String,
    },
}

impl RegistryError {
    pub fn not_found(resource: &'static str, id: impl Into<String>) -> Self {
        RegistryError::NotFound {
            resource,
            id: id.into(),
        }
    }

    pub fn already_exists(resource: &'static str, id: impl Into<String>) -> Self {
        RegistryError::AlreadyExists {
            resource,
            id: id.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, RegistryError::NotFound { .. })
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, RegistryError::Transient { .. })
    }
}

impl From<RegistryError> for AppError {
    fn from(err: RegistryError) -> Self {
        let message = err.to_string();
        match err {
            RegistryError::NotFound { .. } => AppError::NotFound(anyhow::anyhow!(message)),
            RegistryError::AlreadyExists { .. } => AppError::Conflict(anyhow::anyhow!(message)),
            RegistryError::UnsupportedAttestation { .. } => {
                AppError::Unprocessable(anyhow::anyhow!(message))
            }
            RegistryError::Transient { .. } => AppError::ServiceUnavailable(Some(message)),
            RegistryError::Upstream { .. } => AppError::BadGateway(message),
        }
    }
}

/// Device query against the hub's query index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceQuery {
    All,
    ById(String),
}

impl DeviceQuery {
    /// Query language text sent to the hub.
    pub fn to_sql(&self) -> String {
        match self {
            DeviceQuery::All => "SELECT * FROM devices".to_string(),
            DeviceQuery::ById(id) => format!(
                "SELECT * FROM devices WHERE deviceId = '{}'",
                id.replace('\'', "''")
            ),
        }
    }

    pub fn matches(&self, device_id: &str) -> bool {
        match self {
            DeviceQuery::All => true,
            DeviceQuery::ById(id) => id == device_id,
        }
    }
}

/// One page of a paged query. `continuation` is `None` on the last page.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub continuation: Option<String>,
}

impl<T> Page<T> {
    pub fn last(items: Vec<T>) -> Self {
        Self {
            items,
            continuation: None,
        }
    }
}

#[async_trait]
pub trait RegistryClient: Send + Sync {
    /// Host name of the hub, e.g. `myhub.azure-devices.net`.
    fn host_name(&self) -> &str;

    async fn create_device(&self, device: &Device) -> Result<Device, RegistryError>;

    async fn get_device(&self, device_id: &str) -> Result<Device, RegistryError>;

    async fn delete_device(&self, device_id: &str) -> Result<(), RegistryError>;

    /// Run a device query through the (eventually consistent) query index.
    async fn query_devices(
        &self,
        query: &DeviceQuery,
        continuation: Option<String>,
    ) -> Result<Page<Twin>, RegistryError>;

    async fn get_twin(
        &self,
        device_id: &str,
        module_id: Option<&str>,
    ) -> Result<Twin, RegistryError>;

    async fn list_modules(&self, device_id: &str) -> Result<Vec<Module>, RegistryError>;

    async fn health_check(&self) -> Result<(), RegistryError>;
}

#[async_trait]
pub trait ProvisioningClient: Send + Sync {
    async fn create_individual_enrollment(
        &self,
        enrollment: &Enrollment,
    ) -> Result<Enrollment, RegistryError>;

    async fn create_group_enrollment(
        &self,
        enrollment: &Enrollment,
    ) -> Result<Enrollment, RegistryError>;

    async fn delete_individual_enrollment(&self, registration_id: &str)
        -> Result<(), RegistryError>;

    async fn delete_group_enrollment(&self, group_id: &str) -> Result<(), RegistryError>;

    async fn query_individual_enrollments(
        &self,
        continuation: Option<String>,
    ) -> Result<Page<Enrollment>, RegistryError>;

    async fn query_group_enrollments(
        &self,
        continuation: Option<String>,
    ) -> Result<Page<Enrollment>, RegistryError>;

    async fn get_enrollment(
        &self,
        registration_id: &str,
        kind: EnrollmentKind,
    ) -> Result<Enrollment, RegistryError>;

    async fn get_attestation(
        &self,
        registration_id: &str,
        kind: EnrollmentKind,
    ) -> Result<Attestation, RegistryError>;

    async fn health_check(&self) -> Result<(), RegistryError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_query_escapes_quotes() {
        assert_eq!(DeviceQuery::All.to_sql(), "SELECT * FROM devices");
        assert_eq!(
            DeviceQuery::ById("o'brien".to_string()).to_sql(),
            "SELECT * FROM devices WHERE deviceId = 'o''brien'"
        );
    }

    #[test]
    fn test_http_status_mapping() {
        use service_core::axum::http::StatusCode;

        let cases = [
            (RegistryError::not_found("twin", "d"), StatusCode::NOT_FOUND),
            (RegistryError::already_exists("device", "d"), StatusCode::CONFLICT),
            (
                RegistryError::UnsupportedAttestation {
                    id: "d".to_string(),
                    kind: "x509".to_string(),
                },
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
            (
                RegistryError::Transient {
                    operation: "query_devices",
                    id: "d".to_string(),
                    message: "throttled".to_string(),
                },
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                RegistryError::Upstream {
                    operation: "get_device",
                    id: "d".to_string(),
                    message: "401".to_string(),
                },
                StatusCode::BAD_GATEWAY,
            ),
        ];

        for (err, status) in cases {
            assert_eq!(AppError::from(err).status_code(), status);
        }
    }

    #[test]
    fn test_error_messages_name_resource() {
        let err = RegistryError::not_found("twin", "dev-1");
        assert_eq!(err.to_string(), "twin 'dev-1' not found");
        assert!(err.is_not_found());
        assert!(!err.is_transient());
    }
}
