use super::device::ConnectionState;
use serde::{Deserialize, Serialize};

/// Module identity on a device. Removed along with its parent device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Module {
    pub module_id: String,
    pub device_id: String,
    #[serde(default)]
    pub connection_state: ConnectionState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
}
