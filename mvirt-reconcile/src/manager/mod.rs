//! Resource managers for the different object categories.
//!
//! Each manager computes the desired objects of its category from the stack spec and
//! reads the deployed ones back from the store. Managers never write to the store;
//! the reconciler applies the diff.

pub mod network;
pub mod storage;
pub mod workload;

use async_trait::async_trait;

use crate::comparator::ComparatorMap;
use crate::error::Result;
use crate::model::{labels_match, owner_labels, Kind, Labels, ManagedObject};
use crate::spec::Stack;

pub use network::NetworkManager;
pub use storage::StorageManager;
pub use workload::WorkloadManager;

/// The set of objects a manager claims for a stack. Nothing outside it is ever
/// updated or deleted.
#[derive(Debug, Clone, PartialEq)]
pub struct OwnershipScope {
    pub namespace: String,
    pub kinds: Vec<Kind>,
    pub selector: Labels,
}

impl OwnershipScope {
    pub fn new(namespace: impl Into<String>, kinds: Vec<Kind>, selector: Labels) -> Self {
        Self {
            namespace: namespace.into(),
            kinds,
            selector,
        }
    }

    /// Scope covering `kinds` owned by `stack`.
    pub fn for_stack(stack: &Stack, kinds: &[Kind]) -> Self {
        Self::new(&stack.namespace, kinds.to_vec(), owner_labels(&stack.name))
    }

    pub fn contains(&self, object: &ManagedObject) -> bool {
        object.meta.namespace == self.namespace
            && self.kinds.contains(&object.kind())
            && labels_match(&object.meta.labels, &self.selector)
    }
}

/// Trait for resource managers.
#[async_trait]
pub trait ResourceManager: Send + Sync {
    /// Stable name used in logs and error reports.
    fn name(&self) -> &'static str;

    /// Kinds this manager produces.
    fn kinds(&self) -> &'static [Kind];

    /// Objects the manager owns for `stack`.
    fn scope(&self, stack: &Stack) -> OwnershipScope {
        OwnershipScope::for_stack(stack, self.kinds())
    }

    /// Objects that should exist. Empty, not an error, when the category is disabled.
    fn required_objects(&self, stack: &Stack) -> Result<Vec<ManagedObject>>;

    /// Objects that currently exist. Missing objects are simply absent from the result.
    async fn deployed_objects(&self, stack: &Stack) -> Result<Vec<ManagedObject>>;

    /// Comparator overrides. Empty means the registry defaults apply.
    fn custom_comparators(&self) -> ComparatorMap {
        ComparatorMap::new()
    }
}
