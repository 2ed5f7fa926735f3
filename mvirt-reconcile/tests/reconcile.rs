//! End-to-end reconciliation passes against the in-memory store.

use std::sync::Arc;

use async_trait::async_trait;

use mvirt_reconcile::error::Result;
use mvirt_reconcile::model::{owner_labels, Labels, VmDesiredState, VmSpec, VolumeSpec};
use mvirt_reconcile::reconciler::ManagerState;
use mvirt_reconcile::store::Result as StoreResult;
use mvirt_reconcile::{
    ActionKind, CancelHandle, CancelToken, Concurrency, ConfigError, Kind, ManagedObject,
    MemoryStore, ObjectKey, ObjectMeta, ObjectStore, PassStatus, Payload, ReconcileAction,
    ReconcileError, Reconciler, ResourceManager, Stack, StackSpec, StoreError, StorageManager,
    WorkloadManager,
};

fn stack(persistent: bool, expose: bool, replicas: u32) -> Stack {
    let mut spec = StackSpec::default();
    spec.storage.persistent = persistent;
    spec.storage.volume_size = "10Gi".to_string();
    spec.networking.expose = expose;
    spec.networking.ipv4_subnet = Some("10.0.0.0/24".to_string());
    spec.workload.replicas = replicas;
    Stack::new("prod", "web", spec)
}

fn reconciler(store: &Arc<MemoryStore>) -> Reconciler {
    Reconciler::with_default_managers(store.clone()).build()
}

async fn names(store: &MemoryStore, kind: Kind) -> Vec<String> {
    store
        .snapshot()
        .await
        .into_iter()
        .filter(|o| o.kind() == kind)
        .map(|o| o.meta.name)
        .collect()
}

#[tokio::test]
async fn test_bootstrap_creates_everything() {
    let store = Arc::new(MemoryStore::new());
    let outcome = reconciler(&store)
        .reconcile(&stack(true, true, 2), &CancelToken::never())
        .await;

    assert!(outcome.is_success(), "{:?}", outcome.failures);
    assert_eq!(outcome.attempted, 6);
    assert_eq!(outcome.applied, 6);
    assert_eq!(names(&store, Kind::Volume).await, vec!["web"]);
    assert_eq!(names(&store, Kind::Network).await, vec!["web"]);
    assert_eq!(names(&store, Kind::Nic).await, vec!["web-0", "web-1"]);
    assert_eq!(names(&store, Kind::Vm).await, vec!["web-0", "web-1"]);
}

#[tokio::test]
async fn test_second_pass_is_noop() {
    let store = Arc::new(MemoryStore::new());
    let reconciler = reconciler(&store);
    let stack = stack(true, true, 3);

    reconciler.reconcile(&stack, &CancelToken::never()).await;
    let outcome = reconciler.reconcile(&stack, &CancelToken::never()).await;

    assert!(outcome.is_success());
    assert_eq!(outcome.attempted, 0);
    for plan in reconciler.plan(&stack).await {
        assert!(plan.actions.unwrap().is_empty(), "{} not converged", plan.manager);
    }
}

#[tokio::test]
async fn test_disabling_persistence_deletes_volume() {
    let store = Arc::new(MemoryStore::new());
    let reconciler = reconciler(&store);
    reconciler
        .reconcile(&stack(true, false, 1), &CancelToken::never())
        .await;

    let outcome = reconciler
        .reconcile(&stack(false, false, 1), &CancelToken::never())
        .await;

    assert!(outcome.is_success());
    assert!(names(&store, Kind::Volume).await.is_empty());
    // the VM loses its volume attachment
    assert_eq!(outcome.report("storage").unwrap().applied, 1);
    assert_eq!(outcome.report("workload").unwrap().applied, 1);
}

#[tokio::test]
async fn test_scale_down_removes_replicas() {
    let store = Arc::new(MemoryStore::new());
    let reconciler = reconciler(&store);
    reconciler
        .reconcile(&stack(false, true, 3), &CancelToken::never())
        .await;

    let plans = reconciler.plan(&stack(false, true, 1)).await;
    let actions: Vec<String> = plans
        .into_iter()
        .flat_map(|p| p.actions.unwrap())
        .map(|a| a.to_string())
        .collect();
    assert_eq!(
        actions,
        vec![
            "delete nic prod/web-1",
            "delete nic prod/web-2",
            "delete vm prod/web-1",
            "delete vm prod/web-2",
        ]
    );
}

#[tokio::test]
async fn test_storage_backend_failure_is_isolated() {
    let store = Arc::new(MemoryStore::new());
    store
        .fail_kind(Kind::Volume, StoreError::Internal("mock 500".into()))
        .await;

    let outcome = reconciler(&store)
        .reconcile(&stack(true, true, 1), &CancelToken::never())
        .await;

    assert_eq!(outcome.status, PassStatus::Completed);
    assert_eq!(outcome.failures.len(), 1);
    let failure = &outcome.failures[0];
    assert_eq!(failure.manager, "storage");
    assert!(matches!(failure.error, ReconcileError::Backend(_)));
    assert!(failure.error.to_string().contains("mock 500"));

    assert_eq!(outcome.report("storage").unwrap().state, ManagerState::Failed);
    assert_eq!(outcome.report("network").unwrap().state, ManagerState::Converged);
    assert_eq!(outcome.report("workload").unwrap().state, ManagerState::Converged);
    assert_eq!(outcome.applied, 3);

    // the next pass picks up what failed
    store.clear_failures().await;
    let outcome = reconciler(&store)
        .reconcile(&stack(true, true, 1), &CancelToken::never())
        .await;
    assert!(outcome.is_success());
    assert_eq!(outcome.applied, 1);
    assert_eq!(names(&store, Kind::Volume).await, vec!["web"]);
}

#[tokio::test]
async fn test_parallel_pass_merges_in_registration_order() {
    let store = Arc::new(MemoryStore::new());
    store
        .fail_kind(Kind::Volume, StoreError::Unavailable("zfs offline".into()))
        .await;

    let reconciler = Reconciler::with_default_managers(store.clone())
        .concurrency(Concurrency::Parallel)
        .build();
    let outcome = reconciler
        .reconcile(&stack(true, true, 2), &CancelToken::never())
        .await;

    let order: Vec<_> = outcome.managers.iter().map(|r| r.manager).collect();
    assert_eq!(order, vec!["storage", "network", "workload"]);
    assert_eq!(outcome.failures.len(), 1);
    assert!(outcome.failures[0].error.to_string().contains("zfs offline"));
    assert_eq!(outcome.applied, 5);
}

#[tokio::test]
async fn test_rejected_action_does_not_halt_batch() {
    // Another stack already owns an object named web-1.
    let foreign = ManagedObject::new(
        ObjectMeta::new("prod", "web-1").with_labels(owner_labels("other")),
        Payload::Vm(VmSpec {
            cpu_cores: 8,
            memory_mb: 8192,
            template_id: "debian-13".into(),
            volume_id: None,
            nic_ids: vec![],
            desired_state: VmDesiredState::Running,
            status: None,
        }),
    );
    let store = Arc::new(MemoryStore::with_objects([foreign.clone()]));

    let outcome = reconciler(&store)
        .reconcile(&stack(false, false, 3), &CancelToken::never())
        .await;

    assert_eq!(outcome.attempted, 3);
    assert_eq!(outcome.applied, 2);
    assert_eq!(outcome.failures.len(), 1);
    let failure = &outcome.failures[0];
    assert_eq!(failure.manager, "workload");
    assert_eq!(failure.action, Some(ActionKind::Create));
    assert_eq!(failure.object.as_ref().unwrap().key.name, "web-1");

    let untouched = store
        .get(Kind::Vm, &ObjectKey::new("prod", "web-1"))
        .await
        .unwrap();
    assert_eq!(untouched, foreign);
}

#[tokio::test]
async fn test_unowned_objects_survive_teardown() {
    let mut foreign = ManagedObject::new(
        ObjectMeta::new("prod", "scratch").with_labels(owner_labels("other")),
        Payload::Volume(VolumeSpec {
            size_bytes: 1 << 30,
            template_id: None,
        }),
    );
    foreign.meta.resource_version = Some(1);
    let store = Arc::new(MemoryStore::with_objects([foreign]));

    let outcome = reconciler(&store)
        .reconcile(&stack(false, false, 0), &CancelToken::never())
        .await;

    assert!(outcome.is_success());
    assert_eq!(outcome.attempted, 0);
    assert_eq!(names(&store, Kind::Volume).await, vec!["scratch"]);
}

#[tokio::test]
async fn test_custom_comparator_suppresses_template_drift() {
    let store = Arc::new(MemoryStore::new());
    let reconciler = reconciler(&store);
    let mut stack = stack(false, false, 1);
    reconciler.reconcile(&stack, &CancelToken::never()).await;

    stack.spec.workload.template_id = "ubuntu-24.04".into();
    let outcome = reconciler.reconcile(&stack, &CancelToken::never()).await;
    assert_eq!(outcome.attempted, 0);

    stack.spec.workload.memory_mb = 2048;
    let outcome = reconciler.reconcile(&stack, &CancelToken::never()).await;
    assert_eq!(outcome.applied, 1);

    let vm = store
        .get(Kind::Vm, &ObjectKey::new("prod", "web-0"))
        .await
        .unwrap();
    match vm.payload {
        Payload::Vm(spec) => {
            assert_eq!(spec.memory_mb, 2048);
            // server-owned status survives the update
            assert!(spec.status.is_some());
        }
        other => panic!("expected vm, got {:?}", other),
    }
}

#[tokio::test]
async fn test_invalid_volume_size_fails_only_storage() {
    let store = Arc::new(MemoryStore::new());
    let mut stack = stack(true, true, 1);
    stack.spec.storage.volume_size = "10GB".into();

    let outcome = reconciler(&store)
        .reconcile(&stack, &CancelToken::never())
        .await;

    assert_eq!(outcome.status, PassStatus::Completed);
    assert!(!outcome.is_success());
    assert_eq!(outcome.failures.len(), 1);
    assert_eq!(outcome.failures[0].manager, "storage");
    assert!(matches!(
        outcome.failures[0].error,
        ReconcileError::InvalidSpec(_)
    ));
    assert_eq!(outcome.report("storage").unwrap().state, ManagerState::Failed);
    assert_eq!(outcome.report("network").unwrap().state, ManagerState::Converged);
    assert_eq!(outcome.report("workload").unwrap().state, ManagerState::Converged);
    assert_eq!(outcome.applied, 3);
    assert!(names(&store, Kind::Volume).await.is_empty());
    assert_eq!(names(&store, Kind::Network).await, vec!["web"]);
    assert_eq!(names(&store, Kind::Vm).await, vec!["web-0"]);
}

/// Produces volumes without declaring the kind.
struct UndeclaredKindManager;

#[async_trait]
impl ResourceManager for UndeclaredKindManager {
    fn name(&self) -> &'static str {
        "undeclared"
    }

    fn kinds(&self) -> &'static [Kind] {
        &[]
    }

    fn required_objects(&self, stack: &Stack) -> Result<Vec<ManagedObject>> {
        Ok(vec![ManagedObject::new(
            ObjectMeta::new(&stack.namespace, "orphan").with_labels(owner_labels(&stack.name)),
            Payload::Volume(VolumeSpec {
                size_bytes: 1,
                template_id: None,
            }),
        )])
    }

    async fn deployed_objects(&self, _stack: &Stack) -> Result<Vec<ManagedObject>> {
        Ok(vec![])
    }
}

#[tokio::test]
async fn test_unregistered_kind_is_configuration_error() {
    let store = Arc::new(MemoryStore::new());
    let reconciler = Reconciler::builder(store.clone())
        .manager(UndeclaredKindManager)
        .manager(WorkloadManager::new(store.clone()))
        .build();

    let outcome = reconciler
        .reconcile(&stack(false, false, 1), &CancelToken::never())
        .await;

    assert_eq!(outcome.status, PassStatus::Aborted);
    assert!(matches!(
        outcome.failures[0].error,
        ReconcileError::Config(ConfigError::UnregisteredKind(Kind::Volume))
    ));
    assert_eq!(outcome.report("workload").unwrap().state, ManagerState::Skipped);
}

/// Fires the cancel signal while the pass is underway.
struct CancellingManager {
    handle: CancelHandle,
}

#[async_trait]
impl ResourceManager for CancellingManager {
    fn name(&self) -> &'static str {
        "canceller"
    }

    fn kinds(&self) -> &'static [Kind] {
        &[]
    }

    fn required_objects(&self, _stack: &Stack) -> Result<Vec<ManagedObject>> {
        Ok(vec![])
    }

    async fn deployed_objects(&self, _stack: &Stack) -> Result<Vec<ManagedObject>> {
        self.handle.cancel();
        Ok(vec![])
    }
}

#[tokio::test]
async fn test_cancellation_stops_remaining_managers() {
    let store = Arc::new(MemoryStore::new());
    let (handle, cancel) = CancelToken::pair();
    let reconciler = Reconciler::builder(store.clone())
        .manager(StorageManager::new(store.clone()))
        .manager(CancellingManager { handle })
        .manager(WorkloadManager::new(store.clone()))
        .build();

    let outcome = reconciler.reconcile(&stack(true, false, 2), &cancel).await;

    assert_eq!(outcome.status, PassStatus::Cancelled);
    assert_eq!(outcome.applied, 1);
    assert_eq!(outcome.report("storage").unwrap().state, ManagerState::Converged);
    assert_eq!(outcome.report("workload").unwrap().state, ManagerState::Skipped);
    assert_eq!(names(&store, Kind::Volume).await, vec!["web"]);
    assert!(names(&store, Kind::Vm).await.is_empty());
}

/// Delegates to a memory store and fires the cancel signal after the first create.
struct CancelAfterCreate {
    inner: Arc<MemoryStore>,
    handle: CancelHandle,
}

#[async_trait]
impl ObjectStore for CancelAfterCreate {
    async fn get(&self, kind: Kind, key: &ObjectKey) -> StoreResult<ManagedObject> {
        self.inner.get(kind, key).await
    }

    async fn list(
        &self,
        kind: Kind,
        namespace: &str,
        selector: &Labels,
    ) -> StoreResult<Vec<ManagedObject>> {
        self.inner.list(kind, namespace, selector).await
    }

    async fn create(&self, object: ManagedObject) -> StoreResult<ManagedObject> {
        let created = self.inner.create(object).await;
        self.handle.cancel();
        created
    }

    async fn update(&self, object: ManagedObject) -> StoreResult<ManagedObject> {
        self.inner.update(object).await
    }

    async fn delete(&self, kind: Kind, key: &ObjectKey) -> StoreResult<()> {
        self.inner.delete(kind, key).await
    }
}

#[tokio::test]
async fn test_cancellation_mid_batch_starts_no_further_action() {
    let memory = Arc::new(MemoryStore::new());
    let (handle, cancel) = CancelToken::pair();
    let store: Arc<dyn ObjectStore> = Arc::new(CancelAfterCreate {
        inner: memory.clone(),
        handle,
    });
    let reconciler = Reconciler::builder(store.clone())
        .manager(WorkloadManager::new(store))
        .build();

    let outcome = reconciler.reconcile(&stack(false, false, 3), &cancel).await;

    assert_eq!(outcome.status, PassStatus::Cancelled);
    assert_eq!(outcome.attempted, 1);
    assert_eq!(outcome.applied, 1);
    let report = outcome.report("workload").unwrap();
    assert_eq!(report.state, ManagerState::Cancelled);
    assert_eq!(report.planned, 3);
    assert_eq!(names(&memory, Kind::Vm).await, vec!["web-0"]);
}

#[tokio::test]
async fn test_cancelled_before_start_applies_nothing() {
    let store = Arc::new(MemoryStore::new());
    let (handle, cancel) = CancelToken::pair();
    handle.cancel();

    let outcome = reconciler(&store)
        .reconcile(&stack(true, true, 1), &cancel)
        .await;

    assert_eq!(outcome.status, PassStatus::Cancelled);
    assert_eq!(outcome.attempted, 0);
    assert!(outcome
        .managers
        .iter()
        .all(|r| r.state == ManagerState::Skipped));
}

#[tokio::test]
async fn test_plan_reports_creates_first() {
    let store = Arc::new(MemoryStore::new());
    let plans = reconciler(&store).plan(&stack(true, false, 1)).await;

    let storage = plans.iter().find(|p| p.manager == "storage").unwrap();
    match storage.actions.as_ref().unwrap().as_slice() {
        [ReconcileAction::Create(volume)] => assert_eq!(volume.kind(), Kind::Volume),
        other => panic!("unexpected plan {:?}", other),
    }
}
