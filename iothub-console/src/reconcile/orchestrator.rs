//! Mutating registry calls that return only once the change is observable.

use super::{predicates, ConfirmationPoller, PollPolicy, ReconcileError};
use crate::models::{Device, Enrollment, EnrollmentKind};
use crate::services::registry::{ProvisioningClient, RegistryClient, RegistryError};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Wraps each create/delete with a confirmation poll so that a successful
/// return means a following read already reflects the change.
#[derive(Clone)]
pub struct MutationOrchestrator {
    registry: Arc<dyn RegistryClient>,
    provisioning: Arc<dyn ProvisioningClient>,
    poller: ConfirmationPoller,
}

impl MutationOrchestrator {
    pub fn new(
        registry: Arc<dyn RegistryClient>,
        provisioning: Arc<dyn ProvisioningClient>,
        policy: PollPolicy,
    ) -> Self {
        Self {
            registry,
            provisioning,
            poller: ConfirmationPoller::new(policy),
        }
    }

    pub fn poller(&self) -> &ConfirmationPoller {
        &self.poller
    }

    /// Create a symmetric-key device and wait until the device query lists it.
    pub async fn create_device(
        &self,
        device_id: &str,
        is_edge: bool,
        cancel: &CancellationToken,
    ) -> Result<Device, ReconcileError> {
        match self.registry.get_device(device_id).await {
            Ok(_) => {
                warn!(device_id = %device_id, "Device already exists");
                return Err(RegistryError::already_exists("device", device_id).into());
            }
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err.into()),
        }

        let device = self
            .registry
            .create_device(&Device::with_symmetric_key(device_id, is_edge))
            .await?;
        info!(device_id = %device_id, is_edge, "Device created, awaiting confirmation");

        let registry = self.registry.as_ref();
        self.poller
            .confirm("create_device", device_id, cancel, || {
                predicates::device_listed(registry, device_id)
            })
            .await?;

        Ok(device)
    }

    /// Delete a device and wait until it is gone from lookups and queries.
    pub async fn delete_device(
        &self,
        device_id: &str,
        cancel: &CancellationToken,
    ) -> Result<(), ReconcileError> {
        self.registry.delete_device(device_id).await?;
        info!(device_id = %device_id, "Device deleted, awaiting confirmation");

        let registry = self.registry.as_ref();
        self.poller
            .confirm("delete_device", device_id, cancel, || {
                predicates::device_absent(registry, device_id)
            })
            .await?;

        Ok(())
    }

    /// Create a symmetric-key enrollment and wait until the merged enrollment
    /// list contains it.
    pub async fn create_enrollment(
        &self,
        registration_id: &str,
        kind: EnrollmentKind,
        is_edge: bool,
        cancel: &CancellationToken,
    ) -> Result<Enrollment, ReconcileError> {
        match self.provisioning.get_enrollment(registration_id, kind).await {
            Ok(_) => {
                warn!(
                    registration_id = %registration_id,
                    kind = %kind,
                    "Enrollment already exists"
                );
                return Err(
                    RegistryError::already_exists(kind.resource(), registration_id).into(),
                );
            }
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err.into()),
        }

        let template = Enrollment::with_symmetric_key(registration_id, kind, is_edge);
        let enrollment = match kind {
            EnrollmentKind::Individual => {
                self.provisioning
                    .create_individual_enrollment(&template)
                    .await?
            }
            EnrollmentKind::Group => self.provisioning.create_group_enrollment(&template).await?,
        };
        info!(
            registration_id = %registration_id,
            kind = %kind,
            is_edge,
            "Enrollment created, awaiting confirmation"
        );

        let provisioning = self.provisioning.as_ref();
        self.poller
            .confirm("create_enrollment", registration_id, cancel, || {
                predicates::enrollment_listed(provisioning, registration_id, kind)
            })
            .await?;

        Ok(enrollment)
    }

    /// Delete the enrollment of the given kind and wait until the merged
    /// list, rebuilt on every attempt, no longer contains it.
    pub async fn delete_enrollment(
        &self,
        registration_id: &str,
        kind: EnrollmentKind,
        cancel: &CancellationToken,
    ) -> Result<(), ReconcileError> {
        match kind {
            EnrollmentKind::Individual => {
                self.provisioning
                    .delete_individual_enrollment(registration_id)
                    .await?
            }
            EnrollmentKind::Group => {
                self.provisioning
                    .delete_group_enrollment(registration_id)
                    .await?
            }
        }
        info!(
            registration_id = %registration_id,
            kind = %kind,
            "Enrollment deleted, awaiting confirmation"
        );

        let provisioning = self.provisioning.as_ref();
        self.poller
            .confirm("delete_enrollment", registration_id, cancel, || async move {
                let listed =
                    predicates::enrollment_listed(provisioning, registration_id, kind).await?;
                Ok::<_, RegistryError>(!listed)
            })
            .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembly::enrollments::list_enrollments;
    use crate::services::registry::{DeviceQuery, InMemoryProvisioning, InMemoryRegistry};
    use std::time::Duration;

    struct Fixture {
        registry: Arc<InMemoryRegistry>,
        provisioning: Arc<InMemoryProvisioning>,
        orchestrator: MutationOrchestrator,
    }

    fn fixture(index_lag: u32) -> Fixture {
        let registry = Arc::new(InMemoryRegistry::new("hub.local", index_lag));
        let provisioning = Arc::new(InMemoryProvisioning::new(index_lag));
        let orchestrator = MutationOrchestrator::new(
            registry.clone(),
            provisioning.clone(),
            PollPolicy::fixed(Duration::from_millis(1), 20),
        );
        Fixture {
            registry,
            provisioning,
            orchestrator,
        }
    }

    #[tokio::test]
    async fn test_create_device_is_visible_to_immediate_query() {
        let f = fixture(3);
        let cancel = CancellationToken::new();

        f.orchestrator
            .create_device("dev-1", true, &cancel)
            .await
            .unwrap();

        assert!(f.registry.get_device("dev-1").await.is_ok());
        let page = f
            .registry
            .query_devices(&DeviceQuery::All, None)
            .await
            .unwrap();
        assert_eq!(page.items.len(), 1);
        assert!(page.items[0].is_edge());
        // One lookup-by-query per stale read plus the confirming one.
        assert_eq!(f.registry.query_count(), 5);
    }

    #[tokio::test]
    async fn test_second_create_is_a_conflict() {
        let f = fixture(1);
        let cancel = CancellationToken::new();

        f.orchestrator
            .create_device("dev-1", false, &cancel)
            .await
            .unwrap();
        let err = f
            .orchestrator
            .create_device("dev-1", false, &cancel)
            .await
            .unwrap_err();

        assert_eq!(
            err,
            ReconcileError::Registry(RegistryError::already_exists("device", "dev-1"))
        );
    }

    #[tokio::test]
    async fn test_delete_device_then_lookup_is_not_found() {
        let f = fixture(2);
        let cancel = CancellationToken::new();
        f.orchestrator
            .create_device("dev-1", false, &cancel)
            .await
            .unwrap();

        f.orchestrator.delete_device("dev-1", &cancel).await.unwrap();

        assert!(f.registry.get_device("dev-1").await.unwrap_err().is_not_found());
        let page = f
            .registry
            .query_devices(&DeviceQuery::ById("dev-1".to_string()), None)
            .await
            .unwrap();
        assert!(page.items.is_empty());
    }

    #[tokio::test]
    async fn test_delete_missing_device_does_not_poll() {
        let f = fixture(0);
        let err = f
            .orchestrator
            .delete_device("ghost", &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(
            err,
            ReconcileError::Registry(RegistryError::not_found("device", "ghost"))
        );
        assert_eq!(f.registry.query_count(), 0);
    }

    #[tokio::test]
    async fn test_confirmation_fault_is_surfaced() {
        let f = fixture(0);
        f.registry.fail_next_queries(1);

        let err = f
            .orchestrator
            .create_device("dev-1", false, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ReconcileError::Registry(RegistryError::Transient { .. })
        ));
    }

    #[tokio::test]
    async fn test_create_times_out_when_index_never_catches_up() {
        let registry = Arc::new(InMemoryRegistry::new("hub.local", 100));
        let provisioning = Arc::new(InMemoryProvisioning::new(0));
        let orchestrator = MutationOrchestrator::new(
            registry,
            provisioning,
            PollPolicy::fixed(Duration::from_millis(1), 5),
        );

        let err = orchestrator
            .create_device("slow", false, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, ReconcileError::Timeout { attempts: 5, .. }));
    }

    #[tokio::test]
    async fn test_enrollment_round_trip_through_merged_list() {
        let f = fixture(2);
        let cancel = CancellationToken::new();

        f.orchestrator
            .create_enrollment("edge-group", EnrollmentKind::Group, true, &cancel)
            .await
            .unwrap();
        f.orchestrator
            .create_enrollment("edge-group", EnrollmentKind::Individual, false, &cancel)
            .await
            .unwrap();

        let list = list_enrollments(f.provisioning.as_ref()).await.unwrap();
        assert_eq!(list.len(), 2);

        f.orchestrator
            .delete_enrollment("edge-group", EnrollmentKind::Group, &cancel)
            .await
            .unwrap();

        let list = list_enrollments(f.provisioning.as_ref()).await.unwrap();
        assert_eq!(list.len(), 1);
        assert!(!list[0].is_group);
    }

    #[tokio::test]
    async fn test_duplicate_enrollment_is_a_conflict() {
        let f = fixture(0);
        let cancel = CancellationToken::new();
        f.orchestrator
            .create_enrollment("reg-1", EnrollmentKind::Individual, false, &cancel)
            .await
            .unwrap();

        let err = f
            .orchestrator
            .create_enrollment("reg-1", EnrollmentKind::Individual, false, &cancel)
            .await
            .unwrap_err();

        assert_eq!(
            err,
            ReconcileError::Registry(RegistryError::already_exists(
                "individual enrollment",
                "reg-1"
            ))
        );
    }
}
