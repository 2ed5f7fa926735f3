//! Storage manager - one persistent volume per stack when persistence is enabled.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::ResourceManager;
use crate::error::Result;
use crate::model::{owner_labels, Kind, ManagedObject, ObjectMeta, Payload, VolumeSpec};
use crate::spec::Stack;
use crate::store::ObjectStore;

/// Manages the stack's data volume.
pub struct StorageManager {
    store: Arc<dyn ObjectStore>,
}

impl StorageManager {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    /// The volume shares the stack's identity.
    async fn get_deployed_volume(&self, stack: &Stack) -> crate::store::Result<ManagedObject> {
        self.store.get(Kind::Volume, &stack.key()).await
    }
}

#[async_trait]
impl ResourceManager for StorageManager {
    fn name(&self) -> &'static str {
        "storage"
    }

    fn kinds(&self) -> &'static [Kind] {
        &[Kind::Volume]
    }

    fn required_objects(&self, stack: &Stack) -> Result<Vec<ManagedObject>> {
        let storage = &stack.spec.storage;
        if !storage.persistent {
            debug!("Persistence disabled for stack {}", stack.name);
            return Ok(vec![]);
        }

        let volume = ManagedObject::new(
            ObjectMeta::new(&stack.namespace, &stack.name).with_labels(owner_labels(&stack.name)),
            Payload::Volume(VolumeSpec {
                size_bytes: storage.size_bytes()?,
                template_id: storage.template_id.clone(),
            }),
        );
        Ok(vec![volume])
    }

    async fn deployed_objects(&self, stack: &Stack) -> Result<Vec<ManagedObject>> {
        match self.get_deployed_volume(stack).await {
            Ok(volume) => Ok(vec![volume]),
            Err(e) if e.is_not_found() => {
                debug!("No volume deployed for stack {}", stack.name);
                Ok(vec![])
            }
            Err(e) => Err(e.into()),
        }
    }
}
