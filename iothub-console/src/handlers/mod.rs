pub mod devices;
pub mod enrollments;
pub mod health;
pub mod hub;

pub use devices::{create_device, delete_device, get_device, list_devices, list_modules};
pub use enrollments::{
    create_enrollment, delete_enrollment, get_attestation, get_enrollment, list_enrollments,
};
pub use health::{health_check, metrics_endpoint, readiness_check};
pub use hub::hub_info;

use validator::ValidationError;

/// Characters accepted in device ids and registration ids besides ASCII
/// letters and digits.
const ID_SYMBOLS: &str = "-.%_*?!(),:=@$'";

pub(crate) fn validate_registry_id(id: &str) -> Result<(), ValidationError> {
    if id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || ID_SYMBOLS.contains(c))
    {
        Ok(())
    } else {
        Err(ValidationError::new("invalid_id_characters"))
    }
}
