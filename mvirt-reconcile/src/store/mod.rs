//! ObjectStore abstraction over the backing system.
//!
//! Managers read through this trait and the reconciler writes through it. Objects are
//! addressed by kind, namespace and name.

pub mod error;
pub mod memory;

use async_trait::async_trait;

use crate::model::{Kind, Labels, ManagedObject, ObjectKey};

pub use error::{Result, StoreError};
pub use memory::MemoryStore;

/// Capability-typed access to the backing store.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Get a single object. Missing objects yield [`StoreError::NotFound`].
    async fn get(&self, kind: Kind, key: &ObjectKey) -> Result<ManagedObject>;

    /// List objects of a kind in a namespace whose labels match `selector`.
    async fn list(&self, kind: Kind, namespace: &str, selector: &Labels)
        -> Result<Vec<ManagedObject>>;

    /// Create an object, returning it with server-populated fields set.
    async fn create(&self, object: ManagedObject) -> Result<ManagedObject>;

    /// Replace an existing object.
    async fn update(&self, object: ManagedObject) -> Result<ManagedObject>;

    /// Delete an object.
    async fn delete(&self, kind: Kind, key: &ObjectKey) -> Result<()>;
}
