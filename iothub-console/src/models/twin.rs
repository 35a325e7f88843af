use super::device::{AuthenticationKind, ConnectionState, DeviceCapabilities, DeviceStatus};
use serde::{Deserialize, Serialize};

/// Device or module twin. The console only reads twins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Twin {
    pub device_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<DeviceStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_state: Option<ConnectionState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authentication_type: Option<AuthenticationKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<DeviceCapabilities>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<serde_json::Value>,
    #[serde(default)]
    pub properties: TwinProperties,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TwinProperties {
    #[serde(default)]
    pub desired: serde_json::Value,
    #[serde(default)]
    pub reported: serde_json::Value,
}

impl Twin {
    pub fn is_edge(&self) -> bool {
        self.capabilities.map(|c| c.iot_edge).unwrap_or(false)
    }

    /// Model id with empty strings treated as absent.
    pub fn model_id(&self) -> Option<&str> {
        self.model_id.as_deref().filter(|m| !m.is_empty())
    }
}
