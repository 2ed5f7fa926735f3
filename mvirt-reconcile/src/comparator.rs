//! Per-kind equality functions deciding whether a deployed object is already correct.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::ConfigError;
use crate::model::{Kind, ManagedObject};

/// Returns true when `deployed` already matches `desired`.
pub type Comparator = Arc<dyn Fn(&ManagedObject, &ManagedObject) -> bool + Send + Sync>;

/// Overrides supplied by a manager. An empty map means the defaults apply everywhere.
pub type ComparatorMap = HashMap<Kind, Comparator>;

/// Labels plus the manager-controlled payload fields.
pub fn default_comparator(_kind: Kind) -> Comparator {
    Arc::new(|desired: &ManagedObject, deployed: &ManagedObject| {
        desired.meta.labels == deployed.meta.labels
            && desired.payload.controlled_eq(&deployed.payload)
    })
}

/// Default comparators for every kind a registered manager produces.
///
/// Populated while managers are registered and read-only afterwards.
#[derive(Clone, Default)]
pub struct ComparatorRegistry {
    defaults: HashMap<Kind, Comparator>,
}

impl ComparatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the default comparator for `kind`. Registering twice is a no-op.
    pub fn register(&mut self, kind: Kind) {
        self.defaults
            .entry(kind)
            .or_insert_with(|| default_comparator(kind));
    }

    pub fn is_registered(&self, kind: Kind) -> bool {
        self.defaults.contains_key(&kind)
    }

    /// Pick the comparator for `kind`: the custom one if present, else the default.
    pub fn resolve<'a>(
        &'a self,
        kind: Kind,
        custom: &'a ComparatorMap,
    ) -> Result<&'a Comparator, ConfigError> {
        if let Some(cmp) = custom.get(&kind) {
            return Ok(cmp);
        }
        self.defaults
            .get(&kind)
            .ok_or(ConfigError::UnregisteredKind(kind))
    }
}
