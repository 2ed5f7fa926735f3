//! Workload manager - the stack's VM replicas.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::ResourceManager;
use crate::comparator::{Comparator, ComparatorMap};
use crate::error::Result;
use crate::model::{
    owner_labels, Kind, ManagedObject, ObjectMeta, Payload, VmDesiredState, VmSpec,
};
use crate::spec::Stack;
use crate::store::ObjectStore;

/// Name of the `index`th replica of a stack. NICs share it.
pub fn replica_name(stack: &str, index: u32) -> String {
    format!("{}-{}", stack, index)
}

/// Manages one VM per replica.
pub struct WorkloadManager {
    store: Arc<dyn ObjectStore>,
}

impl WorkloadManager {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }
}

/// VMs only pick up their boot template when created, so a template change on a running
/// replica is not worth an update.
fn vm_comparator() -> Comparator {
    Arc::new(|desired: &ManagedObject, deployed: &ManagedObject| {
        if desired.meta.labels != deployed.meta.labels {
            return false;
        }
        match (&desired.payload, &deployed.payload) {
            (Payload::Vm(a), Payload::Vm(b)) => {
                a.cpu_cores == b.cpu_cores
                    && a.memory_mb == b.memory_mb
                    && a.volume_id == b.volume_id
                    && a.nic_ids == b.nic_ids
                    && a.desired_state == b.desired_state
            }
            _ => false,
        }
    })
}

#[async_trait]
impl ResourceManager for WorkloadManager {
    fn name(&self) -> &'static str {
        "workload"
    }

    fn kinds(&self) -> &'static [Kind] {
        &[Kind::Vm]
    }

    fn required_objects(&self, stack: &Stack) -> Result<Vec<ManagedObject>> {
        let workload = &stack.spec.workload;
        let desired_state = if workload.stopped {
            VmDesiredState::Stopped
        } else {
            VmDesiredState::Running
        };

        let vms = (0..workload.replicas)
            .map(|i| {
                let name = replica_name(&stack.name, i);
                // A volume attaches to a single VM, the first replica.
                let volume_id = (stack.spec.storage.persistent && i == 0).then(|| stack.name.clone());
                let nic_ids = if stack.spec.networking.expose {
                    vec![name.clone()]
                } else {
                    vec![]
                };
                ManagedObject::new(
                    ObjectMeta::new(&stack.namespace, name).with_labels(owner_labels(&stack.name)),
                    Payload::Vm(VmSpec {
                        cpu_cores: workload.cpu_cores,
                        memory_mb: workload.memory_mb,
                        template_id: workload.template_id.clone(),
                        volume_id,
                        nic_ids,
                        desired_state,
                        status: None,
                    }),
                )
            })
            .collect();
        Ok(vms)
    }

    async fn deployed_objects(&self, stack: &Stack) -> Result<Vec<ManagedObject>> {
        let vms = self
            .store
            .list(Kind::Vm, &stack.namespace, &owner_labels(&stack.name))
            .await?;
        debug!("Found {} deployed VMs for stack {}", vms.len(), stack.name);
        Ok(vms)
    }

    fn custom_comparators(&self) -> ComparatorMap {
        let mut comparators = ComparatorMap::new();
        comparators.insert(Kind::Vm, vm_comparator());
        comparators
    }
}
