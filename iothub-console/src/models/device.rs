use serde::{Deserialize, Serialize};
use std::fmt;

/// Device identity record as held by the hub registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub device_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(default)]
    pub connection_state: ConnectionState,
    #[serde(default)]
    pub status: DeviceStatus,
    #[serde(default)]
    pub authentication: AuthenticationMechanism,
    #[serde(default)]
    pub capabilities: DeviceCapabilities,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
}

impl Device {
    /// Template for a new device that lets the hub generate its symmetric keys.
    pub fn with_symmetric_key(device_id: impl Into<String>, is_edge: bool) -> Self {
        Self {
            device_id: device_id.into(),
            etag: None,
            connection_state: ConnectionState::Disconnected,
            status: DeviceStatus::Enabled,
            authentication: AuthenticationMechanism {
                kind: AuthenticationKind::Sas,
                symmetric_key: Some(SymmetricKey::default()),
                x509_thumbprint: None,
            },
            capabilities: DeviceCapabilities { iot_edge: is_edge },
            model_id: None,
        }
    }

    /// Primary key, only for symmetric-key devices.
    pub fn primary_key(&self) -> Option<&str> {
        if self.authentication.kind != AuthenticationKind::Sas {
            return None;
        }
        self.authentication
            .symmetric_key
            .as_ref()
            .and_then(|k| k.primary_key.as_deref())
            .filter(|k| !k.is_empty())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Connected,
    #[default]
    Disconnected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Connected => write!(f, "Connected"),
            ConnectionState::Disconnected => write!(f, "Disconnected"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    #[default]
    Enabled,
    Disabled,
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceStatus::Enabled => write!(f, "enabled"),
            DeviceStatus::Disabled => write!(f, "disabled"),
        }
    }
}

/// How a device authenticates. `SelfSigned` is X.509 with registered thumbprints.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AuthenticationKind {
    #[default]
    Sas,
    SelfSigned,
    CertificateAuthority,
    None,
}

impl fmt::Display for AuthenticationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AuthenticationKind::Sas => "sas",
            AuthenticationKind::SelfSigned => "selfSigned",
            AuthenticationKind::CertificateAuthority => "certificateAuthority",
            AuthenticationKind::None => "none",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticationMechanism {
    #[serde(rename = "type", default)]
    pub kind: AuthenticationKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symmetric_key: Option<SymmetricKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x509_thumbprint: Option<X509Thumbprint>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SymmetricKey {
    #[serde(default)]
    pub primary_key: Option<String>,
    #[serde(default)]
    pub secondary_key: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct X509Thumbprint {
    #[serde(default)]
    pub primary_thumbprint: Option<String>,
    #[serde(default)]
    pub secondary_thumbprint: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceCapabilities {
    #[serde(default)]
    pub iot_edge: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_deserialize_registry_payload() {
        let device: Device = serde_json::from_value(json!({
            "deviceId": "sensor-01",
            "etag": "AAAA",
            "connectionState": "Connected",
            "status": "disabled",
            "authentication": {
                "type": "sas",
                "symmetricKey": { "primaryKey": "cHJpbWFyeQ==", "secondaryKey": "c2Vjb25kYXJ5" },
                "x509Thumbprint": { "primaryThumbprint": null, "secondaryThumbprint": null }
            },
            "capabilities": { "iotEdge": true },
            "cloudToDeviceMessageCount": 0
        }))
        .unwrap();

        assert_eq!(device.device_id, "sensor-01");
        assert_eq!(device.connection_state, ConnectionState::Connected);
        assert_eq!(device.status, DeviceStatus::Disabled);
        assert!(device.capabilities.iot_edge);
        assert_eq!(device.primary_key(), Some("cHJpbWFyeQ=="));
    }

    #[test]
    fn test_primary_key_hidden_for_x509() {
        let mut device = Device::with_symmetric_key("cam-7", false);
        device.authentication = AuthenticationMechanism {
            kind: AuthenticationKind::SelfSigned,
            symmetric_key: Some(SymmetricKey {
                primary_key: Some("ignored".to_string()),
                secondary_key: None,
            }),
            x509_thumbprint: Some(X509Thumbprint::default()),
        };

        assert_eq!(device.primary_key(), None);
    }

    #[test]
    fn test_template_serializes_auth_type() {
        let value = serde_json::to_value(Device::with_symmetric_key("gw", true)).unwrap();
        assert_eq!(value["authentication"]["type"], "sas");
        assert_eq!(value["capabilities"]["iotEdge"], true);
    }
}
