//! The dependency manager: couples [`crate::graph::DependencyGraph`] edge
//! state to task status and emits lifecycle events as tasks move through
//! the state graph.

use std::collections::{BTreeMap, HashSet};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{NotFoundError, ValidationError};
use crate::graph::{AddEdgeError, CycleError, DependencyGraph};
use crate::identifier::Identifier;
use crate::types::{DependencyType, EdgeStatus, Metadata, TaskStatus};

/// The event names this component emits (§4.3).
pub mod event_kind {
    pub const DEPENDENCY_ADDED: &str = "dependency_added";
    pub const DEPENDENCY_REMOVED: &str = "dependency_removed";
    pub const DEPENDENCY_SATISFIED: &str = "dependency_satisfied";
    pub const DEPENDENCY_FAILED: &str = "dependency_failed";
    pub const TASK_BLOCKED: &str = "task_blocked";
    pub const TASK_UNBLOCKED: &str = "task_unblocked";
    pub const ALL_DEPENDENCIES_SATISFIED: &str = "all_dependencies_satisfied";
    pub const BLOCKING_TASKS_CHANGED: &str = "blocking_tasks_changed";
}

/// A single lifecycle notification raised by the dependency manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyEvent {
    pub kind: &'static str,
    pub task_id: Identifier,
    /// For edge-derived events, the other end of the edge.
    pub related_task_id: Option<Identifier>,
}

impl DependencyEvent {
    fn new(kind: &'static str, task_id: Identifier) -> Self {
        Self {
            kind,
            task_id,
            related_task_id: None,
        }
    }

    fn with_related(kind: &'static str, task_id: Identifier, related: Identifier) -> Self {
        Self {
            kind,
            task_id,
            related_task_id: Some(related),
        }
    }
}

/// Capability satisfied by anything that wants to observe dependency
/// events. Modeled as a single-method capability rather than a class
/// hierarchy, so loggers, forwarders, and aggregators are just distinct
/// implementations of the same trait.
pub trait DependencyEventHandler: Send + Sync {
    fn handle(&self, event: &DependencyEvent);
}

/// Wraps a plain closure as a [`DependencyEventHandler`].
pub struct FnHandler<F>(pub F);

impl<F> DependencyEventHandler for FnHandler<F>
where
    F: Fn(&DependencyEvent) + Send + Sync,
{
    fn handle(&self, event: &DependencyEvent) {
        (self.0)(event)
    }
}

const _: () = {
    fn _assert_object_safe(_: &dyn DependencyEventHandler) {}
};

/// Dependency manager: owns no graph state of its own beyond the task
/// status map, delegating edge bookkeeping to [`DependencyGraph`].
pub struct DependencyManager {
    graph: DependencyGraph,
    statuses: RwLock<BTreeMap<Identifier, TaskStatus>>,
    handlers: RwLock<Vec<Arc<dyn DependencyEventHandler>>>,
}

impl Default for DependencyManager {
    fn default() -> Self {
        Self::new()
    }
}

impl DependencyManager {
    pub fn new() -> Self {
        Self {
            graph: DependencyGraph::new(),
            statuses: RwLock::new(BTreeMap::new()),
            handlers: RwLock::new(Vec::new()),
        }
    }

    pub fn subscribe(&self, handler: Arc<dyn DependencyEventHandler>) {
        self.handlers.write().push(handler);
    }

    /// Register a task at `Pending` status if it isn't already tracked.
    pub fn add_task(&self, id: Identifier) {
        self.graph.add_task(id);
        self.statuses.write().entry(id).or_insert(TaskStatus::Pending);
    }

    pub fn status_of(&self, id: Identifier) -> Option<TaskStatus> {
        self.statuses.read().get(&id).copied()
    }

    pub fn add_dependency(
        &self,
        dependency_id: Identifier,
        dependent_id: Identifier,
        edge_type: DependencyType,
        metadata: Metadata,
    ) -> Result<(), AddEdgeError> {
        self.graph
            .add_edge(dependency_id, dependent_id, edge_type, metadata)?;
        self.statuses
            .write()
            .entry(dependency_id)
            .or_insert(TaskStatus::Pending);
        self.statuses
            .write()
            .entry(dependent_id)
            .or_insert(TaskStatus::Pending);

        // The dependency may already be past `Pending` (e.g. the caller is
        // assembling a graph from tasks that finished in a different order);
        // reflect that onto the fresh edge immediately rather than leaving
        // it at `Pending` until the next status transition touches it.
        let dependency_status = self.statuses.read().get(&dependency_id).copied();
        if let Some(derived) = dependency_status.and_then(EdgeStatus::from_source_task_status) {
            self.graph
                .update_edge_status(dependency_id, dependent_id, derived);
        }

        self.emit(DependencyEvent::with_related(
            event_kind::DEPENDENCY_ADDED,
            dependent_id,
            dependency_id,
        ));

        if self.graph.is_blocked(dependent_id) {
            self.emit(DependencyEvent::with_related(
                event_kind::TASK_BLOCKED,
                dependent_id,
                dependency_id,
            ));
        }

        Ok(())
    }

    pub fn remove_dependency(&self, dependency_id: Identifier, dependent_id: Identifier) -> bool {
        let existed = self.graph.remove_edge(dependency_id, dependent_id);
        if existed {
            self.emit(DependencyEvent::with_related(
                event_kind::DEPENDENCY_REMOVED,
                dependent_id,
                dependency_id,
            ));
        }
        existed
    }

    /// Update a task's status, propagate the derived edge-status to every
    /// outgoing edge, and emit events for every dependent this unblocks.
    ///
    /// Returns the set of tasks that transitioned from blocked to ready as
    /// a direct result of this call (§8 property 7).
    pub fn update_task_status(
        &self,
        task_id: Identifier,
        new_status: TaskStatus,
    ) -> Result<HashSet<Identifier>, ValidationError> {
        {
            let mut statuses = self.statuses.write();
            let current = statuses.get(&task_id).copied().unwrap_or(TaskStatus::Pending);
            if current != new_status && !current.can_transition_to(new_status) {
                return Err(ValidationError::Other {
                    message: format!("invalid task status transition {current} -> {new_status}"),
                });
            }
            statuses.insert(task_id, new_status);
        }

        let derived_edge_status = match EdgeStatus::from_source_task_status(new_status) {
            Some(s) => s,
            None => return Ok(HashSet::new()),
        };

        let satisfied_or_failed_kind = match new_status {
            TaskStatus::Completed => Some(event_kind::DEPENDENCY_SATISFIED),
            TaskStatus::Failed => Some(event_kind::DEPENDENCY_FAILED),
            _ => None,
        };

        let dependents = self.graph.get_dependents(task_id);
        let mut newly_unblocked = HashSet::new();

        for dependent in dependents {
            let was_blocked = self.graph.is_blocked(dependent);
            self.graph
                .update_edge_status(task_id, dependent, derived_edge_status);

            if let Some(kind) = satisfied_or_failed_kind {
                self.emit(DependencyEvent::with_related(kind, dependent, task_id));
            }

            let still_blocked = self.graph.is_blocked(dependent);
            if was_blocked && !still_blocked {
                newly_unblocked.insert(dependent);
                self.emit(DependencyEvent::with_related(
                    event_kind::TASK_UNBLOCKED,
                    dependent,
                    task_id,
                ));
                self.emit(DependencyEvent::new(
                    event_kind::ALL_DEPENDENCIES_SATISFIED,
                    dependent,
                ));
            } else if was_blocked && still_blocked {
                // One of several blockers resolved, but others remain: the
                // dependent's blocking set changed without a full unblock.
                self.emit(DependencyEvent::with_related(
                    event_kind::BLOCKING_TASKS_CHANGED,
                    dependent,
                    task_id,
                ));
            }
        }

        Ok(newly_unblocked)
    }

    pub fn get_ready_tasks(&self) -> Vec<Identifier> {
        self.graph
            .ready_tasks()
            .into_iter()
            .filter(|id| {
                self.statuses
                    .read()
                    .get(id)
                    .map(|s| *s == TaskStatus::Pending)
                    .unwrap_or(false)
            })
            .collect()
    }

    /// The next `limit` eligible tasks, ordered by ascending dependency
    /// depth then by identifier.
    pub fn get_next_available_tasks(&self, limit: usize) -> Vec<Identifier> {
        let mut ready = self.get_ready_tasks();
        ready.sort_by_key(|id| (self.graph.dependency_depth(*id), *id));
        ready.truncate(limit);
        ready
    }

    /// Whether a task may be marked completed: it must exist, be
    /// in-progress, and not itself be blocked.
    pub fn can_complete_task(&self, task_id: Identifier) -> Result<bool, NotFoundError> {
        let status = self
            .statuses
            .read()
            .get(&task_id)
            .copied()
            .ok_or(NotFoundError::new("task", task_id))?;
        Ok(status == TaskStatus::InProgress && !self.graph.is_blocked(task_id))
    }

    pub fn topological_order(&self) -> Result<Vec<Identifier>, CycleError> {
        self.graph.topological_order()
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    fn emit(&self, event: DependencyEvent) {
        for handler in self.handlers.read().iter() {
            let handler = handler.clone();
            let event = event.clone();
            // A handler that panics must not suppress delivery to the rest.
            let _ = catch_unwind(AssertUnwindSafe(|| handler.handle(&event)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Metadata;
    use std::sync::Mutex;

    fn id() -> Identifier {
        Identifier::generate(None).unwrap()
    }

    struct Recorder(Mutex<Vec<DependencyEvent>>);

    impl Recorder {
        fn new() -> Arc<Self> {
            Arc::new(Self(Mutex::new(Vec::new())))
        }

        fn events(&self) -> Vec<DependencyEvent> {
            self.0.lock().unwrap().clone()
        }
    }

    impl DependencyEventHandler for Recorder {
        fn handle(&self, event: &DependencyEvent) {
            self.0.lock().unwrap().push(event.clone());
        }
    }

    #[test]
    fn linear_dependency_satisfaction_s1() {
        let mgr = DependencyManager::new();
        let (t1, t2, t3) = (id(), id(), id());
        mgr.add_task(t1);
        mgr.add_task(t2);
        mgr.add_task(t3);
        mgr.add_dependency(t1, t2, DependencyType::Blocks, Metadata::new())
            .unwrap();
        mgr.add_dependency(t2, t3, DependencyType::Blocks, Metadata::new())
            .unwrap();

        assert_eq!(
            mgr.get_ready_tasks().into_iter().collect::<HashSet<_>>(),
            HashSet::from([t1])
        );

        let recorder = Recorder::new();
        mgr.subscribe(recorder.clone());

        mgr.update_task_status(t1, TaskStatus::InProgress).unwrap();
        let unblocked = mgr
            .update_task_status(t1, TaskStatus::Completed)
            .unwrap();
        assert_eq!(unblocked, HashSet::from([t2]));
        assert_eq!(
            mgr.get_ready_tasks().into_iter().collect::<HashSet<_>>(),
            HashSet::from([t2])
        );

        let kinds: Vec<_> = recorder.events().iter().map(|e| e.kind).collect();
        assert!(kinds.contains(&event_kind::TASK_UNBLOCKED));
        assert!(kinds.contains(&event_kind::ALL_DEPENDENCIES_SATISFIED));
        let unblocked_pos = kinds.iter().position(|k| *k == event_kind::TASK_UNBLOCKED).unwrap();
        let satisfied_pos = kinds
            .iter()
            .position(|k| *k == event_kind::ALL_DEPENDENCIES_SATISFIED)
            .unwrap();
        assert!(unblocked_pos < satisfied_pos);

        mgr.update_task_status(t2, TaskStatus::InProgress).unwrap();
        mgr.update_task_status(t2, TaskStatus::Completed).unwrap();
        assert_eq!(
            mgr.get_ready_tasks().into_iter().collect::<HashSet<_>>(),
            HashSet::from([t3])
        );
    }

    #[test]
    fn failed_source_blocks_dependents_and_emits_failed_event() {
        let mgr = DependencyManager::new();
        let (t1, t2) = (id(), id());
        mgr.add_task(t1);
        mgr.add_task(t2);
        mgr.add_dependency(t1, t2, DependencyType::Blocks, Metadata::new())
            .unwrap();

        let recorder = Recorder::new();
        mgr.subscribe(recorder.clone());

        mgr.update_task_status(t1, TaskStatus::InProgress).unwrap();
        let unblocked = mgr.update_task_status(t1, TaskStatus::Failed).unwrap();
        assert!(unblocked.is_empty());
        assert!(mgr.graph().is_blocked(t2));
        assert!(
            recorder
                .events()
                .iter()
                .any(|e| e.kind == event_kind::DEPENDENCY_FAILED)
        );
    }

    #[test]
    fn cancelled_source_unblocks_dependent() {
        let mgr = DependencyManager::new();
        let (t1, t2) = (id(), id());
        mgr.add_task(t1);
        mgr.add_task(t2);
        mgr.add_dependency(t1, t2, DependencyType::Blocks, Metadata::new())
            .unwrap();

        let unblocked = mgr.update_task_status(t1, TaskStatus::Cancelled).unwrap();
        assert_eq!(unblocked, HashSet::from([t2]));
    }

    #[test]
    fn new_edge_blocking_a_pending_task_emits_task_blocked() {
        let mgr = DependencyManager::new();
        let (t1, t2) = (id(), id());
        mgr.add_task(t1);
        mgr.add_task(t2);

        let recorder = Recorder::new();
        mgr.subscribe(recorder.clone());
        mgr.add_dependency(t1, t2, DependencyType::Blocks, Metadata::new())
            .unwrap();

        let blocked = recorder
            .events()
            .into_iter()
            .find(|e| e.kind == event_kind::TASK_BLOCKED)
            .expect("TASK_BLOCKED was emitted");
        assert_eq!(blocked.task_id, t2);
        assert_eq!(blocked.related_task_id, Some(t1));
        assert!(mgr.graph().is_blocked(t2));
    }

    #[test]
    fn dependency_on_an_already_completed_task_starts_satisfied_and_unblocked() {
        let mgr = DependencyManager::new();
        let (t1, t2) = (id(), id());
        mgr.add_task(t1);
        mgr.update_task_status(t1, TaskStatus::InProgress).unwrap();
        mgr.update_task_status(t1, TaskStatus::Completed).unwrap();

        mgr.add_task(t2);
        mgr.add_dependency(t1, t2, DependencyType::Blocks, Metadata::new())
            .unwrap();

        assert!(!mgr.graph().is_blocked(t2));
        assert_eq!(
            mgr.graph().get_edge(t1, t2).unwrap().status,
            EdgeStatus::Satisfied
        );
        assert_eq!(mgr.get_ready_tasks(), vec![t2]);
    }

    #[test]
    fn dependency_on_an_already_failed_task_starts_failed_and_blocks() {
        let mgr = DependencyManager::new();
        let (t1, t2) = (id(), id());
        mgr.add_task(t1);
        mgr.update_task_status(t1, TaskStatus::InProgress).unwrap();
        mgr.update_task_status(t1, TaskStatus::Failed).unwrap();

        mgr.add_task(t2);
        mgr.add_dependency(t1, t2, DependencyType::Blocks, Metadata::new())
            .unwrap();

        assert!(mgr.graph().is_blocked(t2));
        assert_eq!(
            mgr.graph().get_edge(t1, t2).unwrap().status,
            EdgeStatus::Failed
        );
    }

    #[test]
    fn resolving_one_of_two_blockers_emits_blocking_tasks_changed_not_unblocked() {
        let mgr = DependencyManager::new();
        let (t1, t2, t3) = (id(), id(), id());
        mgr.add_task(t1);
        mgr.add_task(t2);
        mgr.add_task(t3);
        mgr.add_dependency(t1, t3, DependencyType::Blocks, Metadata::new())
            .unwrap();
        mgr.add_dependency(t2, t3, DependencyType::Blocks, Metadata::new())
            .unwrap();

        let recorder = Recorder::new();
        mgr.subscribe(recorder.clone());

        mgr.update_task_status(t1, TaskStatus::InProgress).unwrap();
        let unblocked = mgr.update_task_status(t1, TaskStatus::Completed).unwrap();

        assert!(unblocked.is_empty());
        assert!(mgr.graph().is_blocked(t3));
        let kinds: Vec<_> = recorder.events().iter().map(|e| e.kind).collect();
        assert!(kinds.contains(&event_kind::BLOCKING_TASKS_CHANGED));
        assert!(!kinds.contains(&event_kind::TASK_UNBLOCKED));
    }

    #[test]
    fn panicking_handler_does_not_suppress_other_handlers() {
        let mgr = DependencyManager::new();
        let (t1, t2) = (id(), id());
        mgr.add_task(t1);
        mgr.add_task(t2);
        mgr.add_dependency(t1, t2, DependencyType::Blocks, Metadata::new())
            .unwrap();

        struct Panicker;
        impl DependencyEventHandler for Panicker {
            fn handle(&self, _event: &DependencyEvent) {
                panic!("boom");
            }
        }

        let recorder = Recorder::new();
        mgr.subscribe(Arc::new(Panicker));
        mgr.subscribe(recorder.clone());

        mgr.update_task_status(t1, TaskStatus::InProgress).unwrap();
        mgr.update_task_status(t1, TaskStatus::Completed).unwrap();

        assert!(!recorder.events().is_empty());
    }

    #[test]
    fn get_next_available_tasks_orders_by_depth_then_id() {
        let mgr = DependencyManager::new();
        let (t1, t2, t3) = (id(), id(), id());
        mgr.add_task(t1);
        mgr.add_task(t2);
        mgr.add_task(t3);
        mgr.add_dependency(t1, t2, DependencyType::Blocks, Metadata::new())
            .unwrap();

        let next = mgr.get_next_available_tasks(10);
        // t1 and t3 are both depth 0 and ready; t2 is blocked.
        assert!(next.contains(&t1));
        assert!(next.contains(&t3));
        assert!(!next.contains(&t2));
    }

    #[test]
    fn can_complete_task_requires_in_progress_and_unblocked() {
        let mgr = DependencyManager::new();
        let t1 = id();
        mgr.add_task(t1);
        assert!(!mgr.can_complete_task(t1).unwrap());
        mgr.update_task_status(t1, TaskStatus::InProgress).unwrap();
        assert!(mgr.can_complete_task(t1).unwrap());
    }

    #[test]
    fn invalid_transition_is_rejected() {
        let mgr = DependencyManager::new();
        let t1 = id();
        mgr.add_task(t1);
        let err = mgr.update_task_status(t1, TaskStatus::Completed).unwrap_err();
        assert!(matches!(err, ValidationError::Other { .. }));
    }
}
