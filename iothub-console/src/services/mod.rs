pub mod azure;
pub mod metrics;
pub mod registry;

pub use azure::{DpsClient, IotHubClient};
pub use metrics::{get_metrics, init_metrics};
pub use registry::{
    InMemoryProvisioning, InMemoryRegistry, ProvisioningClient, RegistryClient, RegistryError,
};
