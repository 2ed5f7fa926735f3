//! Diff engine - turns desired and deployed object sets into an ordered action list.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;
use tracing::debug;

use crate::comparator::{ComparatorMap, ComparatorRegistry};
use crate::error::ConfigError;
use crate::manager::OwnershipScope;
use crate::model::{ManagedObject, ObjectRef};

/// Kind of change an action applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Create,
    Update,
    Delete,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionKind::Create => write!(f, "create"),
            ActionKind::Update => write!(f, "update"),
            ActionKind::Delete => write!(f, "delete"),
        }
    }
}

/// A single step towards the desired state.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ReconcileAction {
    Create(ManagedObject),
    /// `object` is the desired object with the deployed server-owned fields merged in.
    Update {
        target: ObjectRef,
        object: ManagedObject,
    },
    Delete(ObjectRef),
}

impl ReconcileAction {
    pub fn kind(&self) -> ActionKind {
        match self {
            ReconcileAction::Create(_) => ActionKind::Create,
            ReconcileAction::Update { .. } => ActionKind::Update,
            ReconcileAction::Delete(_) => ActionKind::Delete,
        }
    }

    pub fn object_ref(&self) -> ObjectRef {
        match self {
            ReconcileAction::Create(object) => object.object_ref(),
            ReconcileAction::Update { target, .. } => target.clone(),
            ReconcileAction::Delete(target) => target.clone(),
        }
    }
}

impl fmt::Display for ReconcileAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind(), self.object_ref())
    }
}

fn index<'a>(
    set: &'static str,
    objects: &'a [ManagedObject],
) -> Result<BTreeMap<ObjectRef, &'a ManagedObject>, ConfigError> {
    let mut index = BTreeMap::new();
    for object in objects {
        if index.insert(object.object_ref(), object).is_some() {
            return Err(ConfigError::DuplicateIdentity {
                set,
                object: object.object_ref(),
            });
        }
    }
    Ok(index)
}

/// Compute the actions converging `deployed` to `desired`.
///
/// Deployed objects outside `scope` are invisible to the diff, so they are never updated
/// or deleted. Creates come first, then updates, then deletes; each bucket is ordered by
/// namespace and name.
pub fn diff(
    desired: &[ManagedObject],
    deployed: &[ManagedObject],
    registry: &ComparatorRegistry,
    custom: &ComparatorMap,
    scope: &OwnershipScope,
) -> Result<Vec<ReconcileAction>, ConfigError> {
    let desired = index("desired", desired)?;
    let deployed = index("deployed", deployed)?;

    for (object_ref, object) in &desired {
        if !registry.is_registered(object_ref.kind) {
            return Err(ConfigError::UnregisteredKind(object_ref.kind));
        }
        if !scope.contains(object) {
            return Err(ConfigError::OutOfScope {
                object: object_ref.clone(),
                namespace: scope.namespace.clone(),
            });
        }
    }

    let mut creates = Vec::new();
    let mut updates = Vec::new();
    let mut deletes = Vec::new();

    for (object_ref, want) in &desired {
        match deployed.get(object_ref) {
            None => creates.push(ReconcileAction::Create((*want).clone())),
            Some(have) if !scope.contains(have) => {
                // Someone else's object holds this identity; the create will be rejected.
                debug!("{} exists outside our scope, leaving it alone", object_ref);
                creates.push(ReconcileAction::Create((*want).clone()));
            }
            Some(have) => {
                let cmp = registry.resolve(object_ref.kind, custom)?;
                if cmp(*want, *have) {
                    debug!("{} is up to date", object_ref);
                } else {
                    updates.push(ReconcileAction::Update {
                        target: object_ref.clone(),
                        object: want.merged_over(*have),
                    });
                }
            }
        }
    }

    for (object_ref, have) in &deployed {
        if desired.contains_key(object_ref) {
            continue;
        }
        if scope.contains(have) {
            deletes.push(ReconcileAction::Delete(object_ref.clone()));
        } else {
            debug!("Ignoring {} outside our scope", object_ref);
        }
    }

    creates.extend(updates);
    creates.extend(deletes);
    Ok(creates)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::comparator::Comparator;
    use crate::model::{
        owner_labels, Kind, ObjectKey, ObjectMeta, Payload, VmDesiredState, VmSpec, VolumeSpec,
    };

    fn scope() -> OwnershipScope {
        OwnershipScope::new("prod", vec![Kind::Volume, Kind::Vm], owner_labels("web"))
    }

    fn registry() -> ComparatorRegistry {
        let mut registry = ComparatorRegistry::new();
        registry.register(Kind::Volume);
        registry.register(Kind::Vm);
        registry
    }

    fn volume(name: &str, size_bytes: u64) -> ManagedObject {
        ManagedObject::new(
            ObjectMeta::new("prod", name).with_labels(owner_labels("web")),
            Payload::Volume(VolumeSpec {
                size_bytes,
                template_id: None,
            }),
        )
    }

    fn vm(name: &str, cpu_cores: u32) -> ManagedObject {
        ManagedObject::new(
            ObjectMeta::new("prod", name).with_labels(owner_labels("web")),
            Payload::Vm(VmSpec {
                cpu_cores,
                memory_mb: 1024,
                template_id: "debian-13".into(),
                volume_id: None,
                nic_ids: vec![],
                desired_state: VmDesiredState::Running,
                status: None,
            }),
        )
    }

    fn run(desired: &[ManagedObject], deployed: &[ManagedObject]) -> Vec<ReconcileAction> {
        diff(desired, deployed, &registry(), &ComparatorMap::new(), &scope()).unwrap()
    }

    #[test]
    fn test_empty_desired_deletes_everything() {
        let actions = run(&[], &[volume("a", 10)]);
        assert_eq!(
            actions,
            vec![ReconcileAction::Delete(ObjectRef::new(
                Kind::Volume,
                ObjectKey::new("prod", "a")
            ))]
        );
    }

    #[test]
    fn test_empty_deployed_creates_everything() {
        let actions = run(&[volume("a", 10)], &[]);
        assert_eq!(actions, vec![ReconcileAction::Create(volume("a", 10))]);
    }

    #[test]
    fn test_identical_sets_are_noop() {
        let set = vec![volume("a", 10), vm("web-0", 2)];
        assert!(run(&set, &set).is_empty());
    }

    #[test]
    fn test_volume_capacity_change_is_not_actionable() {
        assert!(run(&[volume("a", 20)], &[volume("a", 10)]).is_empty());
    }

    #[test]
    fn test_update_carries_server_fields() {
        let mut deployed = vm("web-0", 1);
        deployed.meta.uid = Some("uid-1".into());
        deployed.meta.resource_version = Some(4);

        let actions = run(&[vm("web-0", 2)], &[deployed]);
        assert_eq!(actions.len(), 1);
        match &actions[0] {
            ReconcileAction::Update { target, object } => {
                assert_eq!(target.key.name, "web-0");
                assert_eq!(object.meta.uid.as_deref(), Some("uid-1"));
                assert_eq!(object.meta.resource_version, Some(4));
            }
            other => panic!("expected update, got {}", other),
        }
    }

    #[test]
    fn test_actions_are_bucketed_and_sorted() {
        let desired = vec![vm("web-1", 2), volume("c", 1), vm("web-0", 4), volume("b", 1)];
        let deployed = vec![vm("web-0", 2), volume("z", 1), volume("y", 1)];
        let actions: Vec<String> = run(&desired, &deployed)
            .iter()
            .map(|a| a.to_string())
            .collect();
        assert_eq!(
            actions,
            vec![
                "create volume prod/b",
                "create volume prod/c",
                "create vm prod/web-1",
                "update vm prod/web-0",
                "delete volume prod/y",
                "delete volume prod/z",
            ]
        );
    }

    #[test]
    fn test_diff_is_deterministic() {
        let desired = vec![vm("web-1", 2), volume("a", 1)];
        let deployed = vec![vm("web-1", 1), volume("b", 1)];
        assert_eq!(run(&desired, &deployed), run(&desired, &deployed));
    }

    #[test]
    fn test_unowned_objects_are_never_deleted() {
        let mut foreign = volume("shared", 10);
        foreign.meta.labels = owner_labels("other-stack");
        let mut elsewhere = volume("remote", 10);
        elsewhere.meta.namespace = "staging".into();

        assert!(run(&[], &[foreign, elsewhere]).is_empty());
    }

    #[test]
    fn test_custom_comparator_is_preferred() {
        let mut custom = ComparatorMap::new();
        let strict: Comparator =
            Arc::new(|a: &ManagedObject, b: &ManagedObject| a.payload == b.payload);
        custom.insert(Kind::Volume, strict);

        let actions = diff(
            &[volume("a", 20)],
            &[volume("a", 10)],
            &registry(),
            &custom,
            &scope(),
        )
        .unwrap();
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].kind(), ActionKind::Update);
    }

    #[test]
    fn test_duplicate_identity_is_config_error() {
        let err = diff(
            &[volume("a", 1), volume("a", 2)],
            &[],
            &registry(),
            &ComparatorMap::new(),
            &scope(),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::DuplicateIdentity { set: "desired", .. }
        ));
    }

    #[test]
    fn test_unregistered_kind_is_config_error() {
        let err = diff(
            &[volume("a", 1)],
            &[],
            &ComparatorRegistry::new(),
            &ComparatorMap::new(),
            &scope(),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::UnregisteredKind(Kind::Volume)));
    }
}
