pub mod device;
pub mod enrollment;
pub mod module;
pub mod twin;

pub use device::{
    AuthenticationKind, AuthenticationMechanism, ConnectionState, Device, DeviceCapabilities,
    DeviceStatus, SymmetricKey, X509Thumbprint,
};
pub use enrollment::{
    Attestation, Enrollment, EnrollmentKind, ProvisioningStatus, SymmetricKeyPair,
};
pub use module::Module;
pub use twin::{Twin, TwinProperties};
