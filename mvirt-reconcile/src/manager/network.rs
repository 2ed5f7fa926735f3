//! Network manager - the stack's network and one NIC per VM replica.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::workload::replica_name;
use super::ResourceManager;
use crate::comparator::{Comparator, ComparatorMap};
use crate::error::Result;
use crate::model::{
    owner_labels, Kind, ManagedObject, NetworkSpec, NicSpec, ObjectMeta, Payload,
};
use crate::spec::Stack;
use crate::store::ObjectStore;

/// Manages networking for exposed stacks.
pub struct NetworkManager {
    store: Arc<dyn ObjectStore>,
}

impl NetworkManager {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }
}

/// DNS server order is not significant to the network daemon.
fn network_comparator() -> Comparator {
    Arc::new(|desired: &ManagedObject, deployed: &ManagedObject| {
        if desired.meta.labels != deployed.meta.labels {
            return false;
        }
        match (&desired.payload, &deployed.payload) {
            (Payload::Network(a), Payload::Network(b)) => {
                let mut a_dns = a.dns_servers.clone();
                let mut b_dns = b.dns_servers.clone();
                a_dns.sort();
                b_dns.sort();
                a.ipv4_subnet == b.ipv4_subnet
                    && a.ipv6_prefix == b.ipv6_prefix
                    && a.is_public == b.is_public
                    && a_dns == b_dns
            }
            _ => false,
        }
    })
}

#[async_trait]
impl ResourceManager for NetworkManager {
    fn name(&self) -> &'static str {
        "network"
    }

    fn kinds(&self) -> &'static [Kind] {
        &[Kind::Network, Kind::Nic]
    }

    fn required_objects(&self, stack: &Stack) -> Result<Vec<ManagedObject>> {
        let networking = &stack.spec.networking;
        if !networking.expose {
            debug!("Networking disabled for stack {}", stack.name);
            return Ok(vec![]);
        }

        let labels = owner_labels(&stack.name);
        let mut objects = vec![ManagedObject::new(
            ObjectMeta::new(&stack.namespace, &stack.name).with_labels(labels.clone()),
            Payload::Network(NetworkSpec {
                ipv4_subnet: networking.ipv4_subnet.clone(),
                ipv6_prefix: networking.ipv6_prefix.clone(),
                dns_servers: networking.dns_servers.clone(),
                is_public: networking.is_public,
            }),
        )];

        for i in 0..stack.spec.workload.replicas {
            objects.push(ManagedObject::new(
                ObjectMeta::new(&stack.namespace, replica_name(&stack.name, i))
                    .with_labels(labels.clone()),
                Payload::Nic(NicSpec {
                    network_id: stack.name.clone(),
                    routed_ipv4_prefixes: networking.routed_ipv4_prefixes.clone(),
                    mac_address: None,
                    ipv4_address: None,
                }),
            ));
        }
        Ok(objects)
    }

    async fn deployed_objects(&self, stack: &Stack) -> Result<Vec<ManagedObject>> {
        let selector = owner_labels(&stack.name);
        let mut objects = self
            .store
            .list(Kind::Network, &stack.namespace, &selector)
            .await?;
        objects.extend(
            self.store
                .list(Kind::Nic, &stack.namespace, &selector)
                .await?,
        );
        Ok(objects)
    }

    fn custom_comparators(&self) -> ComparatorMap {
        let mut comparators = ComparatorMap::new();
        comparators.insert(Kind::Network, network_comparator());
        comparators
    }
}
