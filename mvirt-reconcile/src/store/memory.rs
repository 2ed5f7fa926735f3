//! In-process object store.
//!
//! Behaves like the real backend where the engine cares: it fills in server-owned
//! fields, enforces identity uniqueness and optimistic concurrency, and reports missing
//! objects as `NotFound`. Snapshots can be loaded from and saved to JSON files.

use std::collections::{BTreeMap, HashMap};
use std::io::ErrorKind;
use std::net::Ipv4Addr;
use std::path::Path;

use anyhow::{Context, Result as AnyResult};
use async_trait::async_trait;
use chrono::Utc;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use super::error::{Result, StoreError};
use super::ObjectStore;
use crate::model::{labels_match, Kind, Labels, ManagedObject, ObjectKey, ObjectRef, Payload, VmStatus};

#[derive(Default)]
struct State {
    objects: BTreeMap<ObjectRef, ManagedObject>,
    next_version: u64,
    next_address: u32,
    fail_next: Option<StoreError>,
    failing_kinds: HashMap<Kind, StoreError>,
}

impl State {
    fn next_version(&mut self) -> u64 {
        self.next_version += 1;
        self.next_version
    }

    /// Consume an injected failure for this request, if any.
    fn injected_failure(&mut self, kind: Kind) -> Option<StoreError> {
        if let Some(err) = self.fail_next.take() {
            return Some(err);
        }
        self.failing_kinds.get(&kind).cloned()
    }

    fn assign_nic_addresses(&mut self, object: &mut ManagedObject) {
        let namespace = object.meta.namespace.clone();
        let Payload::Nic(nic) = &mut object.payload else {
            return;
        };

        self.next_address += 1;
        let n = self.next_address;

        if nic.mac_address.is_none() {
            nic.mac_address = Some(format!("02:00:00:00:{:02x}:{:02x}", (n >> 8) & 0xff, n & 0xff));
        }

        if nic.ipv4_address.is_none() {
            let network = ObjectRef::new(Kind::Network, ObjectKey::new(namespace, &nic.network_id));
            let base = self.objects.get(&network).and_then(|obj| match &obj.payload {
                Payload::Network(net) => net
                    .ipv4_subnet
                    .as_deref()
                    .and_then(|s| s.split('/').next())
                    .and_then(|addr| addr.parse::<Ipv4Addr>().ok()),
                _ => None,
            });
            if let Some(base) = base {
                let addr = Ipv4Addr::from(u32::from(base).wrapping_add(n + 1));
                nic.ipv4_address = Some(addr.to_string());
            }
        }
    }
}

/// ObjectStore backed by an in-memory map.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store holding `objects` exactly as given.
    pub fn with_objects(objects: impl IntoIterator<Item = ManagedObject>) -> Self {
        let mut state = State::default();
        for object in objects {
            if let Some(version) = object.meta.resource_version {
                state.next_version = state.next_version.max(version);
            }
            state.objects.insert(object.object_ref(), object);
        }
        Self {
            state: Mutex::new(state),
        }
    }

    /// Load a JSON snapshot. A missing file yields an empty store.
    pub async fn load(path: impl AsRef<Path>) -> AnyResult<Self> {
        let path = path.as_ref();
        let data = match fs::read_to_string(path).await {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("Snapshot {} does not exist, starting empty", path.display());
                return Ok(Self::new());
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to read snapshot {}", path.display()))
            }
        };
        let objects: Vec<ManagedObject> = serde_json::from_str(&data)
            .with_context(|| format!("Failed to parse snapshot {}", path.display()))?;
        Ok(Self::with_objects(objects))
    }

    /// Write all objects as a JSON snapshot.
    pub async fn save(&self, path: impl AsRef<Path>) -> AnyResult<()> {
        let path = path.as_ref();
        let objects = self.snapshot().await;
        let data = serde_json::to_string_pretty(&objects)?;
        fs::write(path, data)
            .await
            .with_context(|| format!("Failed to write snapshot {}", path.display()))?;
        Ok(())
    }

    /// All objects, ordered by identity.
    pub async fn snapshot(&self) -> Vec<ManagedObject> {
        let state = self.state.lock().await;
        state.objects.values().cloned().collect()
    }

    /// Make the next request, whatever it is, fail with `err`.
    pub async fn fail_next_request(&self, err: StoreError) {
        self.state.lock().await.fail_next = Some(err);
    }

    /// Make every request touching `kind` fail with `err`.
    pub async fn fail_kind(&self, kind: Kind, err: StoreError) {
        self.state.lock().await.failing_kinds.insert(kind, err);
    }

    pub async fn clear_failures(&self) {
        let mut state = self.state.lock().await;
        state.fail_next = None;
        state.failing_kinds.clear();
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get(&self, kind: Kind, key: &ObjectKey) -> Result<ManagedObject> {
        let mut state = self.state.lock().await;
        if let Some(err) = state.injected_failure(kind) {
            return Err(err);
        }
        let object_ref = ObjectRef::new(kind, key.clone());
        state
            .objects
            .get(&object_ref)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(object_ref.to_string()))
    }

    async fn list(
        &self,
        kind: Kind,
        namespace: &str,
        selector: &Labels,
    ) -> Result<Vec<ManagedObject>> {
        let mut state = self.state.lock().await;
        if let Some(err) = state.injected_failure(kind) {
            return Err(err);
        }
        Ok(state
            .objects
            .values()
            .filter(|obj| obj.kind() == kind && obj.meta.namespace == namespace)
            .filter(|obj| labels_match(&obj.meta.labels, selector))
            .cloned()
            .collect())
    }

    async fn create(&self, mut object: ManagedObject) -> Result<ManagedObject> {
        let mut state = self.state.lock().await;
        if let Some(err) = state.injected_failure(object.kind()) {
            return Err(err);
        }

        let object_ref = object.object_ref();
        if state.objects.contains_key(&object_ref) {
            return Err(StoreError::AlreadyExists(object_ref.to_string()));
        }

        object.meta.uid = Some(Uuid::new_v4().to_string());
        object.meta.resource_version = Some(state.next_version());
        object.meta.created_at = Some(Utc::now());
        if let Payload::Vm(vm) = &mut object.payload {
            vm.status = Some(VmStatus {
                phase: "pending".to_string(),
                node_id: None,
            });
        }
        state.assign_nic_addresses(&mut object);

        debug!("Created {}", object_ref);
        state.objects.insert(object_ref, object.clone());
        Ok(object)
    }

    async fn update(&self, mut object: ManagedObject) -> Result<ManagedObject> {
        let mut state = self.state.lock().await;
        if let Some(err) = state.injected_failure(object.kind()) {
            return Err(err);
        }

        let object_ref = object.object_ref();
        let existing = state
            .objects
            .get(&object_ref)
            .ok_or_else(|| StoreError::NotFound(object_ref.to_string()))?;

        let current = existing.meta.resource_version.unwrap_or_default();
        if let Some(expected) = object.meta.resource_version {
            if expected != current {
                return Err(StoreError::VersionMismatch {
                    expected,
                    actual: current,
                });
            }
        }

        object.meta.uid = existing.meta.uid.clone();
        object.meta.created_at = existing.meta.created_at;
        object.meta.resource_version = Some(state.next_version());

        debug!("Updated {}", object_ref);
        state.objects.insert(object_ref, object.clone());
        Ok(object)
    }

    async fn delete(&self, kind: Kind, key: &ObjectKey) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(err) = state.injected_failure(kind) {
            return Err(err);
        }
        let object_ref = ObjectRef::new(kind, key.clone());
        match state.objects.remove(&object_ref) {
            Some(_) => {
                debug!("Deleted {}", object_ref);
                Ok(())
            }
            None => Err(StoreError::NotFound(object_ref.to_string())),
        }
    }
}
