use super::device::DeviceCapabilities;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnrollmentKind {
    Individual,
    Group,
}

impl EnrollmentKind {
    pub fn from_is_group(is_group: bool) -> Self {
        if is_group {
            EnrollmentKind::Group
        } else {
            EnrollmentKind::Individual
        }
    }

    pub fn is_group(self) -> bool {
        self == EnrollmentKind::Group
    }

    /// Resource name used in errors and logs.
    pub fn resource(self) -> &'static str {
        match self {
            EnrollmentKind::Individual => "individual enrollment",
            EnrollmentKind::Group => "enrollment group",
        }
    }
}

impl fmt::Display for EnrollmentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnrollmentKind::Individual => write!(f, "individual"),
            EnrollmentKind::Group => write!(f, "group"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProvisioningStatus {
    #[default]
    Enabled,
    Disabled,
}

impl fmt::Display for ProvisioningStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProvisioningStatus::Enabled => write!(f, "enabled"),
            ProvisioningStatus::Disabled => write!(f, "disabled"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymmetricKeyPair {
    pub primary_key: String,
    pub secondary_key: String,
}

impl SymmetricKeyPair {
    pub fn is_empty(&self) -> bool {
        self.primary_key.is_empty() && self.secondary_key.is_empty()
    }
}

/// Attestation mechanism, classified once where the provisioning payload is parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attestation {
    SymmetricKey(SymmetricKeyPair),
    X509,
    Unsupported(String),
}

impl Attestation {
    /// Classify by the provisioning service's `type` discriminator.
    pub fn from_type_name(name: &str, keys: Option<SymmetricKeyPair>) -> Self {
        match name {
            "symmetricKey" => Attestation::SymmetricKey(keys.unwrap_or_default()),
            "x509" => Attestation::X509,
            other => Attestation::Unsupported(other.to_string()),
        }
    }

    pub fn type_name(&self) -> &str {
        match self {
            Attestation::SymmetricKey(_) => "symmetricKey",
            Attestation::X509 => "x509",
            Attestation::Unsupported(name) => name,
        }
    }

    pub fn is_symmetric_key(&self) -> bool {
        matches!(self, Attestation::SymmetricKey(_))
    }
}

/// Individual enrollment or enrollment group. For groups `registration_id`
/// holds the enrollment group id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Enrollment {
    pub registration_id: String,
    pub kind: EnrollmentKind,
    pub device_id: Option<String>,
    pub provisioning_status: ProvisioningStatus,
    pub capabilities: Option<DeviceCapabilities>,
    pub attestation: Attestation,
    pub etag: Option<String>,
}

impl Enrollment {
    /// Template for a symmetric-key enrollment whose keys the service generates.
    /// Individual enrollments register under a device id equal to the registration id.
    pub fn with_symmetric_key(
        registration_id: impl Into<String>,
        kind: EnrollmentKind,
        is_edge: bool,
    ) -> Self {
        let registration_id = registration_id.into();
        let device_id = match kind {
            EnrollmentKind::Individual => Some(registration_id.clone()),
            EnrollmentKind::Group => None,
        };

        Self {
            registration_id,
            kind,
            device_id,
            provisioning_status: ProvisioningStatus::Enabled,
            capabilities: is_edge.then_some(DeviceCapabilities { iot_edge: true }),
            attestation: Attestation::SymmetricKey(SymmetricKeyPair::default()),
            etag: None,
        }
    }

    pub fn is_edge(&self) -> bool {
        self.capabilities.map(|c| c.iot_edge).unwrap_or(false)
    }

    pub fn matches(&self, registration_id: &str, kind: EnrollmentKind) -> bool {
        self.kind == kind && self.registration_id == registration_id
    }
}
