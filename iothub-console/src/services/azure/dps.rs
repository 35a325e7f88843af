//! Device Provisioning Service REST client.
//!
//! Individual enrollments and enrollment groups share one wire shape apart
//! from the id field, so both map onto the domain [`Enrollment`].

use super::{
    continuation_of, read_json, send, ClientBuildError, Endpoint, SasTokenProvider, Target,
    CONTINUATION_HEADER, MAX_ITEM_COUNT_HEADER,
};
use crate::models::{
    Attestation, DeviceCapabilities, Enrollment, EnrollmentKind, ProvisioningStatus,
    SymmetricKeyPair,
};
use crate::services::registry::{Page, ProvisioningClient, RegistryError};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;

const API_VERSION: &str = "2021-10-01";
const ENROLLMENT_QUERY: &str = "SELECT * FROM enrollments";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireSymmetricKey {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    primary_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    secondary_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireAttestation {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    symmetric_key: Option<WireSymmetricKey>,
}

impl From<WireAttestation> for Attestation {
    fn from(wire: WireAttestation) -> Self {
        let keys = wire.symmetric_key.map(|k| SymmetricKeyPair {
            primary_key: k.primary_key.unwrap_or_default(),
            secondary_key: k.secondary_key.unwrap_or_default(),
        });
        Attestation::from_type_name(&wire.kind, keys)
    }
}

impl From<&Attestation> for WireAttestation {
    fn from(attestation: &Attestation) -> Self {
        let symmetric_key = match attestation {
            Attestation::SymmetricKey(keys) => Some(WireSymmetricKey {
                primary_key: Some(keys.primary_key.clone()).filter(|k| !k.is_empty()),
                secondary_key: Some(keys.secondary_key.clone()).filter(|k| !k.is_empty()),
            }),
            _ => None,
        };
        Self {
            kind: attestation.type_name().to_string(),
            symmetric_key,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireEnrollment {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    registration_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    enrollment_group_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    device_id: Option<String>,
    attestation: WireAttestation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    capabilities: Option<DeviceCapabilities>,
    #[serde(default)]
    provisioning_status: ProvisioningStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    etag: Option<String>,
}

impl WireEnrollment {
    fn from_domain(enrollment: &Enrollment) -> Self {
        let (registration_id, enrollment_group_id) = match enrollment.kind {
            EnrollmentKind::Individual => (Some(enrollment.registration_id.clone()), None),
            EnrollmentKind::Group => (None, Some(enrollment.registration_id.clone())),
        };
        Self {
            registration_id,
            enrollment_group_id,
            device_id: enrollment.device_id.clone(),
            attestation: WireAttestation::from(&enrollment.attestation),
            capabilities: enrollment.capabilities,
            provisioning_status: enrollment.provisioning_status,
            etag: enrollment.etag.clone(),
        }
    }

    fn into_domain(self, kind: EnrollmentKind) -> Enrollment {
        let registration_id = match kind {
            EnrollmentKind::Individual => self.registration_id,
            EnrollmentKind::Group => self.enrollment_group_id,
        }
        .unwrap_or_default();
        Enrollment {
            registration_id,
            kind,
            device_id: self.device_id,
            provisioning_status: self.provisioning_status,
            capabilities: self.capabilities,
            attestation: self.attestation.into(),
            etag: self.etag,
        }
    }
}

fn collection(kind: EnrollmentKind) -> &'static str {
    match kind {
        EnrollmentKind::Individual => "enrollments",
        EnrollmentKind::Group => "enrollmentGroups",
    }
}

#[derive(Clone)]
pub struct DpsClient {
    client: Client,
    sas: SasTokenProvider,
    endpoint: Endpoint,
    page_size: u32,
}

impl DpsClient {
    pub fn new(
        sas: SasTokenProvider,
        timeout: Duration,
        page_size: u32,
    ) -> Result<Self, ClientBuildError> {
        let client = Client::builder().timeout(timeout).build()?;
        let endpoint = Endpoint::new(sas.host_name(), API_VERSION)?;
        Ok(Self {
            client,
            sas,
            endpoint,
            page_size,
        })
    }

    async fn create(&self, enrollment: &Enrollment) -> Result<Enrollment, RegistryError> {
        let kind = enrollment.kind;
        let target = Target {
            operation: "create_enrollment",
            resource: kind.resource(),
            id: &enrollment.registration_id,
        };
        let request = self
            .client
            .put(
                self.endpoint
                    .url(&[collection(kind), enrollment.registration_id.as_str()]),
            )
            .json(&WireEnrollment::from_domain(enrollment));
        let response = send(&self.sas, request, target).await?;
        let created: WireEnrollment = read_json(response, target).await?;
        Ok(created.into_domain(kind))
    }

    async fn delete(&self, id: &str, kind: EnrollmentKind) -> Result<(), RegistryError> {
        let target = Target {
            operation: "delete_enrollment",
            resource: kind.resource(),
            id,
        };
        let request = self
            .client
            .delete(self.endpoint.url(&[collection(kind), id]))
            .header(reqwest::header::IF_MATCH, "*");
        send(&self.sas, request, target).await?;
        Ok(())
    }

    async fn query(
        &self,
        kind: EnrollmentKind,
        continuation: Option<String>,
        page_size: u32,
    ) -> Result<Page<Enrollment>, RegistryError> {
        let target = Target {
            operation: "query_enrollments",
            resource: kind.resource(),
            id: "*",
        };
        let mut request = self
            .client
            .post(self.endpoint.url(&[collection(kind), "query"]))
            .header(MAX_ITEM_COUNT_HEADER, page_size)
            .json(&json!({ "query": ENROLLMENT_QUERY }));
        if let Some(token) = continuation {
            request = request.header(CONTINUATION_HEADER, token);
        }

        let response = send(&self.sas, request, target).await?;
        let continuation = continuation_of(&response);
        let items: Vec<WireEnrollment> = read_json(response, target).await?;
        Ok(Page {
            items: items.into_iter().map(|w| w.into_domain(kind)).collect(),
            continuation,
        })
    }
}

#[async_trait]
impl ProvisioningClient for DpsClient {
    async fn create_individual_enrollment(
        &self,
        enrollment: &Enrollment,
    ) -> Result<Enrollment, RegistryError> {
        self.create(enrollment).await
    }

    async fn create_group_enrollment(
        &self,
        enrollment: &Enrollment,
    ) -> Result<Enrollment, RegistryError> {
        self.create(enrollment).await
    }

    async fn delete_individual_enrollment(
        &self,
        registration_id: &str,
    ) -> Result<(), RegistryError> {
        self.delete(registration_id, EnrollmentKind::Individual)
            .await
    }

    async fn delete_group_enrollment(&self, group_id: &str) -> Result<(), RegistryError> {
        self.delete(group_id, EnrollmentKind::Group).await
    }

    async fn query_individual_enrollments(
        &self,
        continuation: Option<String>,
    ) -> Result<Page<Enrollment>, RegistryError> {
        self.query(EnrollmentKind::Individual, continuation, self.page_size)
            .await
    }

    async fn query_group_enrollments(
        &self,
        continuation: Option<String>,
    ) -> Result<Page<Enrollment>, RegistryError> {
        self.query(EnrollmentKind::Group, continuation, self.page_size)
            .await
    }

    async fn get_enrollment(
        &self,
        registration_id: &str,
        kind: EnrollmentKind,
    ) -> Result<Enrollment, RegistryError> {
        let target = Target {
            operation: "get_enrollment",
            resource: kind.resource(),
            id: registration_id,
        };
        let request = self
            .client
            .get(self.endpoint.url(&[collection(kind), registration_id]));
        let response = send(&self.sas, request, target).await?;
        let wire: WireEnrollment = read_json(response, target).await?;
        Ok(wire.into_domain(kind))
    }

    async fn get_attestation(
        &self,
        registration_id: &str,
        kind: EnrollmentKind,
    ) -> Result<Attestation, RegistryError> {
        let target = Target {
            operation: "get_attestation",
            resource: kind.resource(),
            id: registration_id,
        };
        let request = self.client.post(self.endpoint.url(&[
            collection(kind),
            registration_id,
            "attestationmechanism",
        ]));
        let response = send(&self.sas, request, target).await?;
        let wire: WireAttestation = read_json(response, target).await?;
        Ok(wire.into())
    }

    async fn health_check(&self) -> Result<(), RegistryError> {
        self.query(EnrollmentKind::Individual, None, 1).await?;
        Ok(())
    }
}
