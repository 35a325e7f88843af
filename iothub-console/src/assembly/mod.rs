//! Read-side views composed from several registry calls.

pub mod device_info;
pub mod enrollments;

pub use device_info::{
    device_info, list_devices, list_modules, DeviceInfo, DeviceSummary, ModuleSummary,
};
pub use enrollments::{
    get_attestation, get_enrollment, list_enrollments, EnrollmentDetails, EnrollmentSummary,
};
