//! In-memory registry and provisioning backends.
//!
//! Point lookups read the primary store and are always current. Queries read
//! a separate index that only catches up after a configurable number of stale
//! reads, which is how the hosted services behave right after a write.

use super::{DeviceQuery, Page, ProvisioningClient, RegistryClient, RegistryError};
use crate::models::{
    Attestation, AuthenticationKind, Device, Enrollment, EnrollmentKind, Module, SymmetricKey,
    SymmetricKeyPair, Twin, TwinProperties,
};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use rand::RngCore;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

const DEFAULT_PAGE_SIZE: usize = 100;
const MAX_OPEN_SNAPSHOTS: usize = 64;

fn generate_key() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    STANDARD.encode(bytes)
}

fn twin_key(twin: &Twin) -> &str {
    &twin.device_id
}

fn enrollment_key(enrollment: &Enrollment) -> &str {
    &enrollment.registration_id
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn invalid_continuation(operation: &'static str, token: &str) -> RegistryError {
    RegistryError::Upstream {
        operation,
        id: token.to_string(),
        message: "invalid continuation token".to_string(),
    }
}

/// Continuation tokens are `<snapshot>:<offset>`.
fn parse_continuation(token: &str, operation: &'static str) -> Result<(u64, usize), RegistryError> {
    let (snapshot, offset) = token
        .split_once(':')
        .ok_or_else(|| invalid_continuation(operation, token))?;
    match (snapshot.parse(), offset.parse()) {
        (Ok(snapshot), Ok(offset)) => Ok((snapshot, offset)),
        _ => Err(invalid_continuation(operation, token)),
    }
}

/// Write to a query index that becomes visible after `remaining_reads` stale reads.
#[derive(Debug)]
struct Pending<T> {
    change: IndexChange<T>,
    remaining_reads: u32,
}

#[derive(Debug)]
enum IndexChange<T> {
    Upsert(T),
    Remove(String),
}

/// Ordered query index with delayed visibility of writes.
///
/// A query sees the index as it was at its first page: later pages of the
/// same query read a pinned snapshot, so writes landing mid-listing cannot
/// shift offsets.
#[derive(Debug)]
struct LaggingIndex<T> {
    visible: Vec<T>,
    pending: Vec<Pending<T>>,
    key: fn(&T) -> &str,
    snapshots: BTreeMap<u64, Vec<T>>,
    next_snapshot: u64,
}

impl<T: Clone> LaggingIndex<T> {
    fn new(key: fn(&T) -> &str) -> Self {
        Self {
            visible: Vec::new(),
            pending: Vec::new(),
            key,
            snapshots: BTreeMap::new(),
            next_snapshot: 0,
        }
    }

    fn seed(&mut self, item: T) {
        self.apply(IndexChange::Upsert(item));
    }

    fn stage(&mut self, change: IndexChange<T>, lag: u32) {
        self.pending.push(Pending {
            change,
            remaining_reads: lag,
        });
    }

    fn apply(&mut self, change: IndexChange<T>) {
        let key = self.key;
        match change {
            IndexChange::Upsert(item) => {
                match self.visible.iter_mut().find(|v| key(v) == key(&item)) {
                    Some(existing) => *existing = item,
                    None => self.visible.push(item),
                }
            }
            IndexChange::Remove(id) => self.visible.retain(|v| key(v) != id),
        }
    }

    /// Due writes land, the rest age by one query.
    fn advance(&mut self) {
        let (due, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending)
            .into_iter()
            .partition(|p| p.remaining_reads == 0);
        for pending in due {
            self.apply(pending.change);
        }
        self.pending = waiting
            .into_iter()
            .map(|mut p| {
                p.remaining_reads -= 1;
                p
            })
            .collect();
    }

    fn open_snapshot(&mut self) -> u64 {
        self.advance();
        let id = self.next_snapshot;
        self.next_snapshot += 1;
        self.snapshots.insert(id, self.visible.clone());
        // Abandoned listings never reach their last page.
        while self.snapshots.len() > MAX_OPEN_SNAPSHOTS {
            self.snapshots.pop_first();
        }
        id
    }

    /// One page of the rows matching `filter`. A first page starts a new
    /// query; a continuation page reads the snapshot its token names.
    fn page(
        &mut self,
        continuation: Option<String>,
        page_size: usize,
        operation: &'static str,
        filter: impl Fn(&T) -> bool,
    ) -> Result<Page<T>, RegistryError> {
        let (snapshot, offset) = match &continuation {
            None => (self.open_snapshot(), 0),
            Some(token) => parse_continuation(token, operation)?,
        };
        let rows: Vec<T> = self
            .snapshots
            .get(&snapshot)
            .ok_or_else(|| invalid_continuation(operation, continuation.as_deref().unwrap_or("")))?
            .iter()
            .filter(|row| filter(*row))
            .cloned()
            .collect();

        let end = (offset + page_size).min(rows.len());
        let items = rows.get(offset..end).map(<[T]>::to_vec).unwrap_or_default();
        let continuation = if end < rows.len() {
            Some(format!("{}:{}", snapshot, end))
        } else {
            self.snapshots.remove(&snapshot);
            None
        };
        Ok(Page {
            items,
            continuation,
        })
    }
}

struct DeviceRecord {
    device: Device,
    twin: Option<Twin>,
    modules: Vec<(Module, Twin)>,
}

struct RegistryState {
    devices: BTreeMap<String, DeviceRecord>,
    index: LaggingIndex<Twin>,
}

fn twin_for(device: &Device) -> Twin {
    Twin {
        device_id: device.device_id.clone(),
        module_id: None,
        etag: device.etag.clone(),
        model_id: device.model_id.clone(),
        status: Some(device.status),
        connection_state: Some(device.connection_state),
        authentication_type: Some(device.authentication.kind),
        capabilities: Some(device.capabilities),
        tags: None,
        properties: TwinProperties {
            desired: serde_json::json!({}),
            reported: serde_json::json!({}),
        },
        version: Some(1),
    }
}

/// In-memory device registry.
pub struct InMemoryRegistry {
    host_name: String,
    page_size: usize,
    index_lag: u32,
    state: Mutex<RegistryState>,
    query_count: AtomicU64,
    failing_queries: AtomicU32,
}

impl InMemoryRegistry {
    /// `index_lag` is the number of queries that still miss a write.
    pub fn new(host_name: impl Into<String>, index_lag: u32) -> Self {
        Self {
            host_name: host_name.into(),
            page_size: DEFAULT_PAGE_SIZE,
            index_lag,
            state: Mutex::new(RegistryState {
                devices: BTreeMap::new(),
                index: LaggingIndex::new(twin_key),
            }),
            query_count: AtomicU64::new(0),
            failing_queries: AtomicU32::new(0),
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Add a device that is already consistent everywhere. `twin` of `None`
    /// leaves the device without a twin record.
    pub fn insert_device(&self, device: Device, twin: Option<Twin>) {
        let mut state = lock(&self.state);
        if let Some(twin) = &twin {
            state.index.seed(twin.clone());
        }
        state.devices.insert(
            device.device_id.clone(),
            DeviceRecord {
                device,
                twin,
                modules: Vec::new(),
            },
        );
    }

    pub fn insert_module(&self, module: Module, model_id: Option<String>) {
        let mut state = lock(&self.state);
        if let Some(record) = state.devices.get_mut(&module.device_id) {
            let mut twin = twin_for(&record.device);
            twin.module_id = Some(module.module_id.clone());
            twin.model_id = model_id;
            twin.capabilities = None;
            twin.connection_state = Some(module.connection_state);
            record.modules.push((module, twin));
        }
    }

    /// Make the next `count` queries fail with a transient error.
    pub fn fail_next_queries(&self, count: u32) {
        self.failing_queries.store(count, Ordering::SeqCst);
    }

    pub fn query_count(&self) -> u64 {
        self.query_count.load(Ordering::SeqCst)
    }

    fn take_failure(&self) -> bool {
        self.failing_queries
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl RegistryClient for InMemoryRegistry {
    fn host_name(&self) -> &str {
        &self.host_name
    }

    async fn create_device(&self, device: &Device) -> Result<Device, RegistryError> {
        let mut state = lock(&self.state);
        if state.devices.contains_key(&device.device_id) {
            return Err(RegistryError::already_exists("device", &device.device_id));
        }

        let mut created = device.clone();
        created.etag = Some(random_etag());
        if created.authentication.kind == AuthenticationKind::Sas {
            let keys = created
                .authentication
                .symmetric_key
                .get_or_insert_with(SymmetricKey::default);
            keys.primary_key.get_or_insert_with(generate_key);
            keys.secondary_key.get_or_insert_with(generate_key);
        }

        let twin = twin_for(&created);
        state
            .index
            .stage(IndexChange::Upsert(twin.clone()), self.index_lag);
        state.devices.insert(
            created.device_id.clone(),
            DeviceRecord {
                device: created.clone(),
                twin: Some(twin),
                modules: Vec::new(),
            },
        );

        tracing::debug!(device_id = %created.device_id, "[MEMORY] Device created");
        Ok(created)
    }

    async fn get_device(&self, device_id: &str) -> Result<Device, RegistryError> {
        lock(&self.state)
            .devices
            .get(device_id)
            .map(|r| r.device.clone())
            .ok_or_else(|| RegistryError::not_found("device", device_id))
    }

    async fn delete_device(&self, device_id: &str) -> Result<(), RegistryError> {
        let mut state = lock(&self.state);
        if state.devices.remove(device_id).is_none() {
            return Err(RegistryError::not_found("device", device_id));
        }
        state
            .index
            .stage(IndexChange::Remove(device_id.to_string()), self.index_lag);

        tracing::debug!(device_id = %device_id, "[MEMORY] Device deleted");
        Ok(())
    }

    async fn query_devices(
        &self,
        query: &DeviceQuery,
        continuation: Option<String>,
    ) -> Result<Page<Twin>, RegistryError> {
        self.query_count.fetch_add(1, Ordering::SeqCst);
        if self.take_failure() {
            return Err(RegistryError::Transient {
                operation: "query_devices",
                id: query.to_sql(),
                message: "injected failure".to_string(),
            });
        }

        lock(&self.state).index.page(
            continuation,
            self.page_size,
            "query_devices",
            |twin| query.matches(&twin.device_id),
        )
    }

    async fn get_twin(
        &self,
        device_id: &str,
        module_id: Option<&str>,
    ) -> Result<Twin, RegistryError> {
        let state = lock(&self.state);
        let record = state.devices.get(device_id);
        let twin = match module_id {
            None => record.and_then(|r| r.twin.clone()),
            Some(module_id) => record.and_then(|r| {
                r.modules
                    .iter()
                    .find(|(m, _)| m.module_id == module_id)
                    .map(|(_, t)| t.clone())
            }),
        };

        twin.ok_or_else(|| match module_id {
            None => RegistryError::not_found("twin", device_id),
            Some(module_id) => RegistryError::not_found("twin", format!("{device_id}/{module_id}")),
        })
    }

    async fn list_modules(&self, device_id: &str) -> Result<Vec<Module>, RegistryError> {
        lock(&self.state)
            .devices
            .get(device_id)
            .map(|r| r.modules.iter().map(|(m, _)| m.clone()).collect())
            .ok_or_else(|| RegistryError::not_found("device", device_id))
    }

    async fn health_check(&self) -> Result<(), RegistryError> {
        Ok(())
    }
}

fn random_etag() -> String {
    let mut bytes = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut bytes);
    STANDARD.encode(bytes)
}

struct ProvisioningState {
    individual: BTreeMap<String, Enrollment>,
    groups: BTreeMap<String, Enrollment>,
    individual_index: LaggingIndex<Enrollment>,
    group_index: LaggingIndex<Enrollment>,
}

impl ProvisioningState {
    fn store(&mut self, kind: EnrollmentKind) -> &mut BTreeMap<String, Enrollment> {
        match kind {
            EnrollmentKind::Individual => &mut self.individual,
            EnrollmentKind::Group => &mut self.groups,
        }
    }

    fn index(&mut self, kind: EnrollmentKind) -> &mut LaggingIndex<Enrollment> {
        match kind {
            EnrollmentKind::Individual => &mut self.individual_index,
            EnrollmentKind::Group => &mut self.group_index,
        }
    }
}

/// In-memory provisioning service with separate individual and group stores.
pub struct InMemoryProvisioning {
    page_size: usize,
    index_lag: u32,
    state: Mutex<ProvisioningState>,
    query_count: AtomicU64,
}

impl InMemoryProvisioning {
    pub fn new(index_lag: u32) -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            index_lag,
            state: Mutex::new(ProvisioningState {
                individual: BTreeMap::new(),
                groups: BTreeMap::new(),
                individual_index: LaggingIndex::new(enrollment_key),
                group_index: LaggingIndex::new(enrollment_key),
            }),
            query_count: AtomicU64::new(0),
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Add an enrollment that is already visible to queries.
    pub fn insert_enrollment(&self, enrollment: Enrollment) {
        let mut state = lock(&self.state);
        state.index(enrollment.kind).seed(enrollment.clone());
        state
            .store(enrollment.kind)
            .insert(enrollment.registration_id.clone(), enrollment);
    }

    pub fn query_count(&self) -> u64 {
        self.query_count.load(Ordering::SeqCst)
    }

    fn create(
        &self,
        enrollment: &Enrollment,
        kind: EnrollmentKind,
    ) -> Result<Enrollment, RegistryError> {
        let mut state = lock(&self.state);
        if state.store(kind).contains_key(&enrollment.registration_id) {
            return Err(RegistryError::already_exists(
                kind.resource(),
                &enrollment.registration_id,
            ));
        }

        let mut created = enrollment.clone();
        created.kind = kind;
        created.etag = Some(random_etag());
        if let Attestation::SymmetricKey(keys) = &mut created.attestation {
            if keys.is_empty() {
                *keys = SymmetricKeyPair {
                    primary_key: generate_key(),
                    secondary_key: generate_key(),
                };
            }
        }

        state
            .index(kind)
            .stage(IndexChange::Upsert(created.clone()), self.index_lag);
        state
            .store(kind)
            .insert(created.registration_id.clone(), created.clone());

        tracing::debug!(
            registration_id = %created.registration_id,
            kind = %kind,
            "[MEMORY] Enrollment created"
        );
        Ok(created)
    }

    fn delete(&self, registration_id: &str, kind: EnrollmentKind) -> Result<(), RegistryError> {
        let mut state = lock(&self.state);
        if state.store(kind).remove(registration_id).is_none() {
            return Err(RegistryError::not_found(kind.resource(), registration_id));
        }
        state.index(kind).stage(
            IndexChange::Remove(registration_id.to_string()),
            self.index_lag,
        );
        Ok(())
    }

    fn query(
        &self,
        kind: EnrollmentKind,
        continuation: Option<String>,
    ) -> Result<Page<Enrollment>, RegistryError> {
        self.query_count.fetch_add(1, Ordering::SeqCst);
        lock(&self.state)
            .index(kind)
            .page(continuation, self.page_size, "query_enrollments", |_| true)
    }

    fn lookup(
        &self,
        registration_id: &str,
        kind: EnrollmentKind,
    ) -> Result<Enrollment, RegistryError> {
        lock(&self.state)
            .store(kind)
            .get(registration_id)
            .cloned()
            .ok_or_else(|| RegistryError::not_found(kind.resource(), registration_id))
    }
}

#[async_trait]
impl ProvisioningClient for InMemoryProvisioning {
    async fn create_individual_enrollment(
        &self,
        enrollment: &Enrollment,
    ) -> Result<Enrollment, RegistryError> {
        self.create(enrollment, EnrollmentKind::Individual)
    }

    async fn create_group_enrollment(
        &self,
        enrollment: &Enrollment,
    ) -> Result<Enrollment, RegistryError> {
        self.create(enrollment, EnrollmentKind::Group)
    }

    async fn delete_individual_enrollment(
        &self,
        registration_id: &str,
    ) -> Result<(), RegistryError> {
        self.delete(registration_id, EnrollmentKind::Individual)
    }

    async fn delete_group_enrollment(&self, group_id: &str) -> Result<(), RegistryError> {
        self.delete(group_id, EnrollmentKind::Group)
    }

    async fn query_individual_enrollments(
        &self,
        continuation: Option<String>,
    ) -> Result<Page<Enrollment>, RegistryError> {
        self.query(EnrollmentKind::Individual, continuation)
    }

    async fn query_group_enrollments(
        &self,
        continuation: Option<String>,
    ) -> Result<Page<Enrollment>, RegistryError> {
        self.query(EnrollmentKind::Group, continuation)
    }

    async fn get_enrollment(
        &self,
        registration_id: &str,
        kind: EnrollmentKind,
    ) -> Result<Enrollment, RegistryError> {
        self.lookup(registration_id, kind)
    }

    async fn get_attestation(
        &self,
        registration_id: &str,
        kind: EnrollmentKind,
    ) -> Result<Attestation, RegistryError> {
        self.lookup(registration_id, kind).map(|e| e.attestation)
    }

    async fn health_check(&self) -> Result<(), RegistryError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_query_index_lags_behind_writes() {
        let registry = InMemoryRegistry::new("hub.local", 2);
        registry
            .create_device(&Device::with_symmetric_key("dev-1", false))
            .await
            .unwrap();

        // Point lookups are immediately consistent.
        assert!(registry.get_device("dev-1").await.is_ok());

        let query = DeviceQuery::ById("dev-1".to_string());
        for _ in 0..2 {
            let page = registry.query_devices(&query, None).await.unwrap();
            assert!(page.items.is_empty());
        }
        let page = registry.query_devices(&query, None).await.unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(registry.query_count(), 3);
    }

    #[tokio::test]
    async fn test_create_generates_keys_and_rejects_duplicates() {
        let registry = InMemoryRegistry::new("hub.local", 0);
        let device = registry
            .create_device(&Device::with_symmetric_key("dev-1", true))
            .await
            .unwrap();
        assert!(device.primary_key().is_some());

        let err = registry
            .create_device(&Device::with_symmetric_key("dev-1", true))
            .await
            .unwrap_err();
        assert_eq!(err, RegistryError::already_exists("device", "dev-1"));
    }

    #[tokio::test]
    async fn test_query_pages_with_continuation() {
        let registry = InMemoryRegistry::new("hub.local", 0).with_page_size(2);
        for id in ["a", "b", "c"] {
            let device = Device::with_symmetric_key(id, false);
            let twin = twin_for(&device);
            registry.insert_device(device, Some(twin));
        }

        let first = registry.query_devices(&DeviceQuery::All, None).await.unwrap();
        assert_eq!(first.items.len(), 2);
        let second = registry
            .query_devices(&DeviceQuery::All, first.continuation)
            .await
            .unwrap();
        assert_eq!(second.items.len(), 1);
        assert_eq!(second.continuation, None);
    }

    #[tokio::test]
    async fn test_write_landing_mid_listing_does_not_shift_pages() {
        let registry = InMemoryRegistry::new("hub.local", 0).with_page_size(2);
        for id in ["b", "c", "d"] {
            let device = Device::with_symmetric_key(id, false);
            let twin = twin_for(&device);
            registry.insert_device(device, Some(twin));
        }
        registry
            .create_device(&Device::with_symmetric_key("e", false))
            .await
            .unwrap();

        let first = registry.query_devices(&DeviceQuery::All, None).await.unwrap();
        // The delete lands on the first page of a concurrent listing.
        registry.delete_device("b").await.unwrap();
        let other = registry.query_devices(&DeviceQuery::All, None).await.unwrap();
        assert_eq!(other.items[0].device_id, "c");

        let mut ids: Vec<String> = first.items.into_iter().map(|t| t.device_id).collect();
        let mut continuation = first.continuation;
        while let Some(token) = continuation {
            let page = registry
                .query_devices(&DeviceQuery::All, Some(token))
                .await
                .unwrap();
            ids.extend(page.items.into_iter().map(|t| t.device_id));
            continuation = page.continuation;
        }

        assert_eq!(ids, vec!["b", "c", "d", "e"]);
    }

    #[tokio::test]
    async fn test_unknown_continuation_is_rejected() {
        let registry = InMemoryRegistry::new("hub.local", 0);
        for token in ["7", "99:0", "x:y"] {
            let err = registry
                .query_devices(&DeviceQuery::All, Some(token.to_string()))
                .await
                .unwrap_err();
            assert!(matches!(err, RegistryError::Upstream { .. }));
        }
    }

    #[tokio::test]
    async fn test_injected_failures_are_transient() {
        let registry = InMemoryRegistry::new("hub.local", 0);
        registry.fail_next_queries(1);

        let err = registry
            .query_devices(&DeviceQuery::All, None)
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert!(registry.query_devices(&DeviceQuery::All, None).await.is_ok());
    }

    #[tokio::test]
    async fn test_enrollment_kinds_are_separate() {
        let provisioning = InMemoryProvisioning::new(0);
        provisioning
            .create_group_enrollment(&Enrollment::with_symmetric_key(
                "shared",
                EnrollmentKind::Group,
                false,
            ))
            .await
            .unwrap();

        let err = provisioning
            .get_enrollment("shared", EnrollmentKind::Individual)
            .await
            .unwrap_err();
        assert!(err.is_not_found());

        let attestation = provisioning
            .get_attestation("shared", EnrollmentKind::Group)
            .await
            .unwrap();
        match attestation {
            Attestation::SymmetricKey(keys) => assert!(!keys.primary_key.is_empty()),
            other => panic!("unexpected attestation {:?}", other),
        }
    }
}
