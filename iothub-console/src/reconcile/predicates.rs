//! Observations of registry state, one per entity kind.

use crate::assembly::enrollments::collect_enrollments;
use crate::models::EnrollmentKind;
use crate::services::registry::{
    DeviceQuery, ProvisioningClient, RegistryClient, RegistryError,
};

async fn device_in_query_index(
    registry: &dyn RegistryClient,
    device_id: &str,
) -> Result<bool, RegistryError> {
    let query = DeviceQuery::ById(device_id.to_string());
    let mut continuation = None;
    loop {
        let page = registry.query_devices(&query, continuation).await?;
        if page.items.iter().any(|twin| twin.device_id == device_id) {
            return Ok(true);
        }
        match page.continuation {
            Some(token) => continuation = Some(token),
            None => return Ok(false),
        }
    }
}

/// The device query lists `device_id`.
pub async fn device_listed(
    registry: &dyn RegistryClient,
    device_id: &str,
) -> Result<bool, RegistryError> {
    device_in_query_index(registry, device_id).await
}

/// Lookup by id reports NotFound and the device query no longer lists it.
pub async fn device_absent(
    registry: &dyn RegistryClient,
    device_id: &str,
) -> Result<bool, RegistryError> {
    match registry.get_device(device_id).await {
        Ok(_) => return Ok(false),
        Err(err) if err.is_not_found() => {}
        Err(err) => return Err(err),
    }
    Ok(!device_in_query_index(registry, device_id).await?)
}

/// The merged enrollment list, read fresh, contains `(registration_id, kind)`.
pub async fn enrollment_listed(
    provisioning: &dyn ProvisioningClient,
    registration_id: &str,
    kind: EnrollmentKind,
) -> Result<bool, RegistryError> {
    Ok(collect_enrollments(provisioning)
        .await?
        .iter()
        .any(|enrollment| enrollment.matches(registration_id, kind)))
}
