//! Enrollment views built from the individual and group query streams.

use crate::models::{Attestation, Enrollment, EnrollmentKind, SymmetricKeyPair};
use crate::services::registry::{Page, ProvisioningClient, RegistryError};
use serde::Serialize;

/// Row of the enrollment list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnrollmentSummary {
    pub registration_id: String,
    pub is_group: bool,
}

/// Detail view of one enrollment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnrollmentDetails {
    pub registration_id: String,
    pub status: String,
    pub is_group: bool,
    pub is_edge: bool,
}

impl From<&Enrollment> for EnrollmentDetails {
    fn from(enrollment: &Enrollment) -> Self {
        Self {
            registration_id: enrollment.registration_id.clone(),
            status: enrollment.provisioning_status.to_string(),
            is_group: enrollment.kind.is_group(),
            is_edge: enrollment.is_edge(),
        }
    }
}

async fn drain<F, Fut>(mut next_page: F) -> Result<Vec<Enrollment>, RegistryError>
where
    F: FnMut(Option<String>) -> Fut,
    Fut: std::future::Future<Output = Result<Page<Enrollment>, RegistryError>>,
{
    let mut items = Vec::new();
    let mut continuation = None;
    loop {
        let page = next_page(continuation).await?;
        items.extend(page.items);
        match page.continuation {
            Some(token) => continuation = Some(token),
            None => return Ok(items),
        }
    }
}

/// Every enrollment of both kinds, individual first, in discovery order.
/// Each stream is read to the end before the two are combined.
pub async fn collect_enrollments(
    provisioning: &dyn ProvisioningClient,
) -> Result<Vec<Enrollment>, RegistryError> {
    let mut enrollments =
        drain(|continuation| provisioning.query_individual_enrollments(continuation)).await?;
    let groups = drain(|continuation| provisioning.query_group_enrollments(continuation)).await?;
    enrollments.extend(groups);
    Ok(enrollments)
}

/// Symmetric-key enrollments of both kinds sorted by registration id.
/// Other attestation kinds are left out of the list.
pub async fn list_enrollments(
    provisioning: &dyn ProvisioningClient,
) -> Result<Vec<EnrollmentSummary>, RegistryError> {
    let mut summaries: Vec<EnrollmentSummary> = collect_enrollments(provisioning)
        .await?
        .into_iter()
        .filter(|enrollment| {
            let supported = enrollment.attestation.is_symmetric_key();
            if !supported {
                tracing::debug!(
                    registration_id = %enrollment.registration_id,
                    attestation = enrollment.attestation.type_name(),
                    "Skipping enrollment with unsupported attestation"
                );
            }
            supported
        })
        .map(|enrollment| EnrollmentSummary {
            registration_id: enrollment.registration_id,
            is_group: enrollment.kind.is_group(),
        })
        .collect();

    // Stable: equal ids keep discovery order.
    summaries.sort_by(|a, b| a.registration_id.cmp(&b.registration_id));
    Ok(summaries)
}

pub async fn get_enrollment(
    provisioning: &dyn ProvisioningClient,
    registration_id: &str,
    kind: EnrollmentKind,
) -> Result<EnrollmentDetails, RegistryError> {
    let enrollment = provisioning.get_enrollment(registration_id, kind).await?;
    Ok(EnrollmentDetails::from(&enrollment))
}

/// Symmetric keys of an enrollment. Any other attestation is an error.
pub async fn get_attestation(
    provisioning: &dyn ProvisioningClient,
    registration_id: &str,
    kind: EnrollmentKind,
) -> Result<SymmetricKeyPair, RegistryError> {
    match provisioning.get_attestation(registration_id, kind).await? {
        Attestation::SymmetricKey(keys) => Ok(keys),
        other => Err(RegistryError::UnsupportedAttestation {
            id: registration_id.to_string(),
            kind: other.type_name().to_string(),
        }),
    }
}
