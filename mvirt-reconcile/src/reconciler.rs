//! Reconciliation orchestrator.
//!
//! Drives every registered manager through required -> deployed -> diff -> apply and
//! folds the results into a single [`Outcome`]. A failing manager only loses its own
//! contribution; configuration errors abort the pass.

use std::fmt;
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::comparator::ComparatorRegistry;
use crate::diff::{diff, ActionKind, ReconcileAction};
use crate::error::ReconcileError;
use crate::manager::{NetworkManager, ResourceManager, StorageManager, WorkloadManager};
use crate::model::ObjectRef;
use crate::spec::Stack;
use crate::store::{self, ObjectStore};

/// How managers are driven within a pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Concurrency {
    /// One manager after the other, in registration order.
    #[default]
    Sequential,
    /// All managers at once. Results are still merged in registration order.
    Parallel,
}

/// Handle used to cancel a running pass.
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

/// Cancellation signal observed by a pass. In-flight store calls are allowed to finish;
/// nothing new is started once it fires.
#[derive(Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    pub fn pair() -> (CancelHandle, CancelToken) {
        let (tx, rx) = watch::channel(false);
        (CancelHandle { tx }, CancelToken { rx })
    }

    /// A token that never fires.
    pub fn never() -> CancelToken {
        CancelToken::pair().1
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }
}

/// Overall result of a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassStatus {
    /// Every manager ran. Individual failures may still be recorded.
    Completed,
    /// Stopped early by the cancel signal.
    Cancelled,
    /// Stopped by a configuration error.
    Aborted,
}

/// What happened to a single manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    Converged,
    Failed,
    Cancelled,
    /// Never started because the pass was cancelled or aborted first.
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerReport {
    pub manager: &'static str,
    pub state: ManagerState,
    pub planned: usize,
    pub applied: usize,
}

/// A recorded error with enough context to retry the failed unit.
#[derive(Debug, Clone)]
pub struct Failure {
    pub manager: &'static str,
    pub object: Option<ObjectRef>,
    pub action: Option<ActionKind>,
    pub error: ReconcileError,
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.manager, self.error)
    }
}

/// Aggregated result of one reconciliation pass.
#[derive(Debug, Clone)]
pub struct Outcome {
    pub status: PassStatus,
    pub attempted: usize,
    pub applied: usize,
    pub managers: Vec<ManagerReport>,
    pub failures: Vec<Failure>,
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        self.status == PassStatus::Completed && self.failures.is_empty()
    }

    pub fn report(&self, manager: &str) -> Option<&ManagerReport> {
        self.managers.iter().find(|r| r.manager == manager)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?}: {}/{} actions applied, {} failures",
            self.status,
            self.applied,
            self.attempted,
            self.failures.len()
        )
    }
}

/// Actions one manager wants to take, or why it could not tell.
pub struct ManagerPlan {
    pub manager: &'static str,
    pub actions: Result<Vec<ReconcileAction>, ReconcileError>,
}

struct ManagerRun {
    report: ManagerReport,
    attempted: usize,
    failures: Vec<Failure>,
    fatal: bool,
}

impl ManagerRun {
    fn new(manager: &'static str, state: ManagerState) -> Self {
        Self {
            report: ManagerReport {
                manager,
                state,
                planned: 0,
                applied: 0,
            },
            attempted: 0,
            failures: vec![],
            fatal: false,
        }
    }

    fn failed(manager: &'static str, error: ReconcileError) -> Self {
        let mut run = Self::new(manager, ManagerState::Failed);
        run.fatal = error.is_fatal();
        run.failures.push(Failure {
            manager,
            object: None,
            action: None,
            error,
        });
        run
    }
}

/// Builder registering managers and their kinds.
pub struct ReconcilerBuilder {
    store: Arc<dyn ObjectStore>,
    managers: Vec<Box<dyn ResourceManager>>,
    registry: ComparatorRegistry,
    concurrency: Concurrency,
}

impl ReconcilerBuilder {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self {
            store,
            managers: vec![],
            registry: ComparatorRegistry::new(),
            concurrency: Concurrency::default(),
        }
    }

    /// Register a manager. Its kinds get default comparators.
    pub fn manager(mut self, manager: impl ResourceManager + 'static) -> Self {
        for kind in manager.kinds() {
            self.registry.register(*kind);
        }
        self.managers.push(Box::new(manager));
        self
    }

    pub fn concurrency(mut self, concurrency: Concurrency) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn build(self) -> Reconciler {
        Reconciler {
            store: self.store,
            managers: self.managers,
            registry: Arc::new(self.registry),
            concurrency: self.concurrency,
        }
    }
}

/// Converges a stack's deployed objects to its desired state.
pub struct Reconciler {
    store: Arc<dyn ObjectStore>,
    managers: Vec<Box<dyn ResourceManager>>,
    registry: Arc<ComparatorRegistry>,
    concurrency: Concurrency,
}

impl Reconciler {
    pub fn builder(store: Arc<dyn ObjectStore>) -> ReconcilerBuilder {
        ReconcilerBuilder::new(store)
    }

    /// Storage, network and workload managers, in that order.
    pub fn with_default_managers(store: Arc<dyn ObjectStore>) -> ReconcilerBuilder {
        ReconcilerBuilder::new(Arc::clone(&store))
            .manager(StorageManager::new(Arc::clone(&store)))
            .manager(NetworkManager::new(Arc::clone(&store)))
            .manager(WorkloadManager::new(store))
    }

    pub fn manager_names(&self) -> Vec<&'static str> {
        self.managers.iter().map(|m| m.name()).collect()
    }

    /// Compute every manager's actions without applying them.
    pub async fn plan(&self, stack: &Stack) -> Vec<ManagerPlan> {
        let mut plans = Vec::with_capacity(self.managers.len());
        for manager in &self.managers {
            plans.push(ManagerPlan {
                manager: manager.name(),
                actions: self.plan_manager(manager.as_ref(), stack).await,
            });
        }
        plans
    }

    /// Run one reconciliation pass for `stack`.
    pub async fn reconcile(&self, stack: &Stack, cancel: &CancelToken) -> Outcome {
        info!(
            "Reconciling stack {}/{} with {} managers",
            stack.namespace,
            stack.name,
            self.managers.len()
        );

        let runs = match self.concurrency {
            Concurrency::Sequential => self.run_sequential(stack, cancel).await,
            Concurrency::Parallel => {
                join_all(
                    self.managers
                        .iter()
                        .map(|m| self.run_manager(m.as_ref(), stack, cancel)),
                )
                .await
            }
        };

        let outcome = self.merge(runs, cancel);
        if outcome.is_success() {
            info!("Stack {}/{}: {}", stack.namespace, stack.name, outcome);
        } else {
            warn!("Stack {}/{}: {}", stack.namespace, stack.name, outcome);
        }
        outcome
    }

    async fn run_sequential(&self, stack: &Stack, cancel: &CancelToken) -> Vec<ManagerRun> {
        let mut runs = Vec::with_capacity(self.managers.len());
        let mut halted = false;
        for manager in &self.managers {
            if halted {
                runs.push(ManagerRun::new(manager.name(), ManagerState::Skipped));
                continue;
            }
            let run = self.run_manager(manager.as_ref(), stack, cancel).await;
            halted = run.fatal || cancel.is_cancelled();
            runs.push(run);
        }
        runs
    }

    async fn plan_manager(
        &self,
        manager: &dyn ResourceManager,
        stack: &Stack,
    ) -> Result<Vec<ReconcileAction>, ReconcileError> {
        let desired = manager.required_objects(stack)?;
        let deployed = manager.deployed_objects(stack).await?;
        let actions = diff(
            &desired,
            &deployed,
            &self.registry,
            &manager.custom_comparators(),
            &manager.scope(stack),
        )?;
        Ok(actions)
    }

    async fn run_manager(
        &self,
        manager: &dyn ResourceManager,
        stack: &Stack,
        cancel: &CancelToken,
    ) -> ManagerRun {
        let name = manager.name();
        if cancel.is_cancelled() {
            debug!("Skipping {} manager, pass cancelled", name);
            return ManagerRun::new(name, ManagerState::Skipped);
        }

        let actions = match self.plan_manager(manager, stack).await {
            Ok(actions) => actions,
            Err(e) => {
                error!("{} manager failed for stack {}: {}", name, stack.name, e);
                return ManagerRun::failed(name, e);
            }
        };

        info!("{} manager: {} actions planned", name, actions.len());
        let mut run = ManagerRun::new(name, ManagerState::Converged);
        run.report.planned = actions.len();

        for action in actions {
            if cancel.is_cancelled() {
                info!("{} manager cancelled before {}", name, action);
                run.report.state = ManagerState::Cancelled;
                break;
            }

            run.attempted += 1;
            match self.execute(&action).await {
                Ok(()) => {
                    info!("Applied {}", action);
                    run.report.applied += 1;
                }
                Err(e) => {
                    error!("Failed to {}: {}", action, e);
                    run.report.state = ManagerState::Failed;
                    run.failures.push(Failure {
                        manager: name,
                        object: Some(action.object_ref()),
                        action: Some(action.kind()),
                        error: ReconcileError::Action {
                            action: action.kind(),
                            object: action.object_ref(),
                            source: e,
                        },
                    });
                }
            }
        }

        run
    }

    async fn execute(&self, action: &ReconcileAction) -> store::Result<()> {
        match action {
            ReconcileAction::Create(object) => self.store.create(object.clone()).await.map(|_| ()),
            ReconcileAction::Update { object, .. } => {
                self.store.update(object.clone()).await.map(|_| ())
            }
            ReconcileAction::Delete(target) => {
                match self.store.delete(target.kind, &target.key).await {
                    // Already gone is what we wanted.
                    Err(e) if e.is_not_found() => Ok(()),
                    other => other,
                }
            }
        }
    }

    fn merge(&self, runs: Vec<ManagerRun>, cancel: &CancelToken) -> Outcome {
        let mut outcome = Outcome {
            status: PassStatus::Completed,
            attempted: 0,
            applied: 0,
            managers: Vec::with_capacity(runs.len()),
            failures: vec![],
        };

        let mut aborted = false;
        for run in runs {
            aborted |= run.fatal;
            outcome.attempted += run.attempted;
            outcome.applied += run.report.applied;
            outcome.failures.extend(run.failures);
            outcome.managers.push(run.report);
        }

        if aborted {
            outcome.status = PassStatus::Aborted;
        } else if cancel.is_cancelled() {
            outcome.status = PassStatus::Cancelled;
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_token() {
        let (handle, token) = CancelToken::pair();
        let copy = token.clone();
        assert!(!token.is_cancelled());
        handle.cancel();
        assert!(token.is_cancelled());
        assert!(copy.is_cancelled());
        assert!(!CancelToken::never().is_cancelled());
    }

    #[test]
    fn test_failure_display_includes_context() {
        use crate::model::{Kind, ObjectKey};
        use crate::store::StoreError;

        let object = ObjectRef::new(Kind::Vm, ObjectKey::new("prod", "web-0"));
        let failure = Failure {
            manager: "workload",
            object: Some(object.clone()),
            action: Some(ActionKind::Create),
            error: ReconcileError::Action {
                action: ActionKind::Create,
                object,
                source: StoreError::Forbidden("quota".into()),
            },
        };
        assert_eq!(
            failure.to_string(),
            "[workload] create vm prod/web-0 failed: forbidden: quota"
        );
    }
}
