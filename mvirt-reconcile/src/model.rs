//! Managed-object model.
//!
//! Every object the engine touches is a [`ManagedObject`]: metadata carrying its identity
//! plus a typed [`Payload`]. The [`Kind`] tag is derived from the payload variant, so the
//! two can never disagree.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Label carrying the name of the stack an object belongs to.
pub const STACK_LABEL: &str = "mvirt.io/stack";

/// Label marking objects created by this engine.
pub const MANAGED_BY_LABEL: &str = "mvirt.io/managed-by";

/// Value of [`MANAGED_BY_LABEL`] for objects we own.
pub const MANAGED_BY: &str = "mvirt-reconcile";

pub type Labels = BTreeMap<String, String>;

/// Type tag of a managed object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Kind {
    Volume,
    Vm,
    Network,
    Nic,
}

impl Kind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Kind::Volume => "volume",
            Kind::Vm => "vm",
            Kind::Network => "network",
            Kind::Nic => "nic",
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stable identity of an object within a kind: namespace, then name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Fully qualified reference to an object.
///
/// Ordering is namespace, then name, then kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectRef {
    pub kind: Kind,
    pub key: ObjectKey,
}

impl ObjectRef {
    pub fn new(kind: Kind, key: ObjectKey) -> Self {
        Self { kind, key }
    }
}

impl Ord for ObjectRef {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.key
            .cmp(&other.key)
            .then_with(|| self.kind.cmp(&other.kind))
    }
}

impl PartialOrd for ObjectRef {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.key)
    }
}

/// Object metadata. `uid`, `resource_version` and `created_at` are populated by the
/// store and never take part in comparisons.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub labels: Labels,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl ObjectMeta {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_labels(mut self, labels: Labels) -> Self {
        self.labels = labels;
        self
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(&self.namespace, &self.name)
    }

    fn adopt_server_fields(&mut self, deployed: &ObjectMeta) {
        self.uid = deployed.uid.clone();
        self.resource_version = deployed.resource_version;
        self.created_at = deployed.created_at;
    }
}

/// A block volume. Capacity cannot change once provisioned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeSpec {
    pub size_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_id: Option<String>,
}

/// Requested power state of a VM.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmDesiredState {
    #[default]
    Running,
    Stopped,
}

/// Runtime state reported by the hypervisor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmStatus {
    pub phase: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmSpec {
    pub cpu_cores: u32,
    pub memory_mb: u64,
    pub template_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_id: Option<String>,
    #[serde(default)]
    pub nic_ids: Vec<String>,
    #[serde(default)]
    pub desired_state: VmDesiredState,
    /// Server-owned.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<VmStatus>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv4_subnet: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv6_prefix: Option<String>,
    #[serde(default)]
    pub dns_servers: Vec<String>,
    #[serde(default)]
    pub is_public: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NicSpec {
    pub network_id: String,
    #[serde(default)]
    pub routed_ipv4_prefixes: Vec<String>,
    /// Assigned by the store when left unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac_address: Option<String>,
    /// Assigned by the store when left unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv4_address: Option<String>,
}

/// Kind-specific content of an object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Payload {
    Volume(VolumeSpec),
    Vm(VmSpec),
    Network(NetworkSpec),
    Nic(NicSpec),
}

impl Payload {
    pub fn kind(&self) -> Kind {
        match self {
            Payload::Volume(_) => Kind::Volume,
            Payload::Vm(_) => Kind::Vm,
            Payload::Network(_) => Kind::Network,
            Payload::Nic(_) => Kind::Nic,
        }
    }

    /// Compare only the fields a manager controls.
    ///
    /// Volume capacity is immutable after provisioning, so two volumes always compare
    /// equal here and only presence drives their reconciliation.
    pub fn controlled_eq(&self, other: &Payload) -> bool {
        match (self, other) {
            (Payload::Volume(_), Payload::Volume(_)) => true,
            (Payload::Vm(a), Payload::Vm(b)) => {
                a.cpu_cores == b.cpu_cores
                    && a.memory_mb == b.memory_mb
                    && a.template_id == b.template_id
                    && a.volume_id == b.volume_id
                    && a.nic_ids == b.nic_ids
                    && a.desired_state == b.desired_state
            }
            (Payload::Network(a), Payload::Network(b)) => a == b,
            (Payload::Nic(a), Payload::Nic(b)) => {
                a.network_id == b.network_id && a.routed_ipv4_prefixes == b.routed_ipv4_prefixes
            }
            _ => false,
        }
    }

    /// Copy server-owned fields from the deployed payload into this (desired) one.
    fn adopt_server_fields(&mut self, deployed: &Payload) {
        match (self, deployed) {
            (Payload::Vm(desired), Payload::Vm(deployed)) => {
                desired.status = deployed.status.clone();
            }
            (Payload::Nic(desired), Payload::Nic(deployed)) => {
                if desired.mac_address.is_none() {
                    desired.mac_address = deployed.mac_address.clone();
                }
                if desired.ipv4_address.is_none() {
                    desired.ipv4_address = deployed.ipv4_address.clone();
                }
            }
            _ => {}
        }
    }
}

/// An object under management, either desired or observed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagedObject {
    pub meta: ObjectMeta,
    pub payload: Payload,
}

impl ManagedObject {
    pub fn new(meta: ObjectMeta, payload: Payload) -> Self {
        Self { meta, payload }
    }

    pub fn kind(&self) -> Kind {
        self.payload.kind()
    }

    pub fn key(&self) -> ObjectKey {
        self.meta.key()
    }

    pub fn object_ref(&self) -> ObjectRef {
        ObjectRef::new(self.kind(), self.key())
    }

    /// Build the object to send in an update: this desired object with the server-owned
    /// fields of `deployed` carried over.
    pub fn merged_over(&self, deployed: &ManagedObject) -> ManagedObject {
        let mut merged = self.clone();
        merged.meta.adopt_server_fields(&deployed.meta);
        merged.payload.adopt_server_fields(&deployed.payload);
        merged
    }
}

/// Labels stamped on every object owned by a stack.
pub fn owner_labels(stack_name: &str) -> Labels {
    let mut labels = Labels::new();
    labels.insert(STACK_LABEL.to_string(), stack_name.to_string());
    labels.insert(MANAGED_BY_LABEL.to_string(), MANAGED_BY.to_string());
    labels
}

/// True if every selector entry is present in `labels`.
pub fn labels_match(labels: &Labels, selector: &Labels) -> bool {
    selector
        .iter()
        .all(|(k, v)| labels.get(k).is_some_and(|actual| actual == v))
}
