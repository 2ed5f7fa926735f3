//! mvirt-reconcile: declarative reconciliation of mvirt stacks.
//!
//! A [`Reconciler`] asks each [`ResourceManager`] for the objects a stack needs and the
//! objects that exist, diffs them with per-kind comparators and applies the resulting
//! creates, updates and deletes through an [`ObjectStore`].

pub mod comparator;
pub mod diff;
pub mod error;
pub mod manager;
pub mod model;
pub mod reconciler;
pub mod spec;
pub mod store;

pub use comparator::{Comparator, ComparatorMap, ComparatorRegistry};
pub use diff::{diff, ActionKind, ReconcileAction};
pub use error::{ConfigError, InvalidSpec, ReconcileError};
pub use manager::{NetworkManager, OwnershipScope, ResourceManager, StorageManager, WorkloadManager};
pub use model::{Kind, ManagedObject, ObjectKey, ObjectMeta, ObjectRef, Payload};
pub use reconciler::{
    CancelHandle, CancelToken, Concurrency, Failure, ManagerReport, ManagerState, Outcome,
    PassStatus, Reconciler,
};
pub use spec::{Stack, StackSpec};
pub use store::{MemoryStore, ObjectStore, StoreError};
