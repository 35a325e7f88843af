//! Device views assembled from the device record and its twin.

use crate::models::{AuthenticationKind, ConnectionState, DeviceStatus, Twin, TwinProperties};
use crate::services::registry::{DeviceQuery, RegistryClient, RegistryError};
use futures::future::try_join_all;
use serde::Serialize;

/// Device record joined with its twin.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceInfo {
    pub device_id: String,
    pub status: DeviceStatus,
    pub connection_state: ConnectionState,
    pub authentication_type: AuthenticationKind,
    pub is_edge: bool,
    pub model_id: Option<String>,
    /// Empty unless the device authenticates with symmetric keys.
    pub primary_key: Option<String>,
    pub connection_string: Option<String>,
    pub tags: Option<serde_json::Value>,
    pub properties: TwinProperties,
}

/// Row of the device list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceSummary {
    pub device_id: String,
    pub status: Option<DeviceStatus>,
    pub connection_state: Option<ConnectionState>,
    pub is_edge: bool,
    pub model_id: Option<String>,
}

impl From<&Twin> for DeviceSummary {
    fn from(twin: &Twin) -> Self {
        Self {
            device_id: twin.device_id.clone(),
            status: twin.status,
            connection_state: twin.connection_state,
            is_edge: twin.is_edge(),
            model_id: twin.model_id().map(str::to_string),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModuleSummary {
    pub module_id: String,
    pub device_id: String,
    pub connection_state: ConnectionState,
    pub model_id: Option<String>,
}

/// Device connection string for a symmetric-key device.
pub fn device_connection_string(host_name: &str, device_id: &str, key: &str) -> String {
    format!(
        "HostName={};DeviceId={};SharedAccessKey={}",
        host_name, device_id, key
    )
}

/// Both the device and its twin must exist. A missing one is reported as
/// `NotFound` naming "device" or "twin"; there is no partial result.
pub async fn device_info(
    registry: &dyn RegistryClient,
    device_id: &str,
) -> Result<DeviceInfo, RegistryError> {
    let device = registry.get_device(device_id).await?;
    let twin = registry.get_twin(device_id, None).await?;

    let primary_key = device.primary_key().map(str::to_string);
    let connection_string = primary_key
        .as_deref()
        .map(|key| device_connection_string(registry.host_name(), device_id, key));

    Ok(DeviceInfo {
        device_id: device.device_id.clone(),
        status: device.status,
        connection_state: device.connection_state,
        authentication_type: device.authentication.kind,
        is_edge: twin.is_edge(),
        model_id: twin.model_id().map(str::to_string),
        primary_key,
        connection_string,
        tags: twin.tags,
        properties: twin.properties,
    })
}

/// Every device in the hub, in query order.
pub async fn list_devices(
    registry: &dyn RegistryClient,
) -> Result<Vec<DeviceSummary>, RegistryError> {
    let mut devices = Vec::new();
    let mut continuation = None;
    loop {
        let page = registry.query_devices(&DeviceQuery::All, continuation).await?;
        devices.extend(page.items.iter().map(DeviceSummary::from));
        match page.continuation {
            Some(token) => continuation = Some(token),
            None => return Ok(devices),
        }
    }
}

/// Modules of a device. The model id comes from each module twin; a module
/// whose twin is missing is listed without one.
pub async fn list_modules(
    registry: &dyn RegistryClient,
    device_id: &str,
) -> Result<Vec<ModuleSummary>, RegistryError> {
    let modules = registry.list_modules(device_id).await?;

    try_join_all(modules.into_iter().map(|module| async move {
        let model_id = match registry.get_twin(device_id, Some(&module.module_id)).await {
            Ok(twin) => twin.model_id().map(str::to_string),
            Err(err) if err.is_not_found() => None,
            Err(err) => return Err(err),
        };
        Ok(ModuleSummary {
            module_id: module.module_id,
            device_id: module.device_id,
            connection_state: module.connection_state,
            model_id,
        })
    }))
    .await
}
