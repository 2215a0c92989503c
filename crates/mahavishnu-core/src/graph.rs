//! The dependency graph: tasks as nodes, typed edges between them, cycle
//! prevention, and topological ordering.
//!
//! Only edges of a "blocking kind" (`blocks`, `requires`) participate in
//! cycle detection and in `is_blocked`/topological ordering; `related` and
//! `subtask` edges are tracked for bookkeeping but never constrain order.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use parking_lot::RwLock;

use crate::identifier::Identifier;
use crate::types::{DependencyEdge, DependencyType, EdgeStatus};

/// Raised when an edge insertion would create a cycle among blocking edges.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
#[error("adding edge {from} -> {to} would create a cycle: {}", path.iter().map(Identifier::to_string).collect::<Vec<_>>().join(" -> "))]
pub struct CycleError {
    pub from: Identifier,
    pub to: Identifier,
    /// Witness path from `to` back to `from`, inclusive of both endpoints.
    pub path: Vec<Identifier>,
}

/// Raised by `add_edge` when the ordered pair `(from, to)` already has an edge.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
#[error("dependency edge {from} -> {to} already exists")]
pub struct DuplicateEdgeError {
    pub from: Identifier,
    pub to: Identifier,
}

#[derive(Default)]
struct Inner {
    tasks: HashSet<Identifier>,
    /// Keyed by the ordered pair (dependency_id, dependent_id).
    edges: HashMap<(Identifier, Identifier), DependencyEdge>,
    /// dependency_id -> set of dependent_ids (outgoing, "depended upon by").
    dependents: HashMap<Identifier, BTreeSet<Identifier>>,
    /// dependent_id -> set of dependency_ids (incoming, "depends on").
    dependencies: HashMap<Identifier, BTreeSet<Identifier>>,
}

/// A directed graph of tasks and typed dependency edges between them.
///
/// All mutations take the single internal reader-writer lock exclusively;
/// reads (`is_blocked`, `ready_tasks`, ...) may run concurrently with each
/// other. This mirrors §5's "single reader-writer discipline" requirement.
#[derive(Default)]
pub struct DependencyGraph {
    inner: RwLock<Inner>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task node. Idempotent: adding the same id twice is a no-op.
    pub fn add_task(&self, id: Identifier) {
        let mut inner = self.inner.write();
        inner.tasks.insert(id);
        inner.dependents.entry(id).or_default();
        inner.dependencies.entry(id).or_default();
    }

    /// Add a directed edge `from` (the dependency) -> `to` (the dependent).
    ///
    /// Fails with [`DuplicateEdgeError`] if the ordered pair already has an
    /// edge of any type, and with [`CycleError`] if the edge is of a
    /// blocking kind and would create a cycle among blocking edges. On
    /// either failure the graph is left exactly as it was before the call.
    pub fn add_edge(
        &self,
        from: Identifier,
        to: Identifier,
        edge_type: DependencyType,
        metadata: crate::types::Metadata,
    ) -> Result<(), AddEdgeError> {
        let mut inner = self.inner.write();

        if inner.edges.contains_key(&(from, to)) {
            return Err(AddEdgeError::Duplicate(DuplicateEdgeError { from, to }));
        }

        inner.tasks.insert(from);
        inner.tasks.insert(to);
        inner.dependents.entry(from).or_default().insert(to);
        inner.dependencies.entry(to).or_default().insert(from);

        if edge_type.is_blocking_kind() {
            if let Some(path) = find_blocking_path(&inner, to, from) {
                // Roll back: the cycle check ran after the adjacency was
                // already recorded, so discard it before returning.
                inner.dependents.get_mut(&from).unwrap().remove(&to);
                inner.dependencies.get_mut(&to).unwrap().remove(&from);
                let mut full_path = vec![from];
                full_path.extend(path);
                return Err(AddEdgeError::Cycle(CycleError {
                    from,
                    to,
                    path: full_path,
                }));
            }
        }

        inner.edges.insert(
            (from, to),
            DependencyEdge {
                dependency_id: from,
                dependent_id: to,
                dependency_type: edge_type,
                status: EdgeStatus::Pending,
                metadata,
            },
        );

        Ok(())
    }

    /// Remove the edge `from -> to`. Returns whether it existed.
    pub fn remove_edge(&self, from: Identifier, to: Identifier) -> bool {
        let mut inner = self.inner.write();
        if inner.edges.remove(&(from, to)).is_none() {
            return false;
        }
        if let Some(set) = inner.dependents.get_mut(&from) {
            set.remove(&to);
        }
        if let Some(set) = inner.dependencies.get_mut(&to) {
            set.remove(&from);
        }
        true
    }

    /// Remove a task and every edge incident to it. Returns the set of
    /// other task-ids that had an edge to or from the removed task.
    pub fn remove_task(&self, id: Identifier) -> HashSet<Identifier> {
        let mut inner = self.inner.write();
        let mut affected = HashSet::new();

        let dependents: Vec<Identifier> = inner
            .dependents
            .get(&id)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default();
        let dependencies: Vec<Identifier> = inner
            .dependencies
            .get(&id)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default();

        for dep in &dependents {
            inner.edges.remove(&(id, *dep));
            if let Some(set) = inner.dependencies.get_mut(dep) {
                set.remove(&id);
            }
            affected.insert(*dep);
        }
        for dep in &dependencies {
            inner.edges.remove(&(*dep, id));
            if let Some(set) = inner.dependents.get_mut(dep) {
                set.remove(&id);
            }
            affected.insert(*dep);
        }

        inner.tasks.remove(&id);
        inner.dependents.remove(&id);
        inner.dependencies.remove(&id);

        affected
    }

    /// Kahn's algorithm over blocking edges, ties broken by ascending id.
    pub fn topological_order(&self) -> Result<Vec<Identifier>, CycleError> {
        let inner = self.inner.read();
        let blocking = blocking_adjacency(&inner);

        let mut in_degree: HashMap<Identifier, usize> =
            inner.tasks.iter().map(|id| (*id, 0usize)).collect();
        for dependents in blocking.values() {
            for d in dependents {
                *in_degree.entry(*d).or_insert(0) += 1;
            }
        }

        let mut ready: BTreeSet<Identifier> = in_degree
            .iter()
            .filter(|(_, deg)| **deg == 0)
            .map(|(id, _)| *id)
            .collect();

        let mut order = Vec::with_capacity(inner.tasks.len());
        while let Some(&next) = ready.iter().next() {
            ready.remove(&next);
            order.push(next);
            if let Some(dependents) = blocking.get(&next) {
                for &d in dependents {
                    let deg = in_degree.get_mut(&d).unwrap();
                    *deg -= 1;
                    if *deg == 0 {
                        ready.insert(d);
                    }
                }
            }
        }

        if order.len() != inner.tasks.len() {
            // Some cycle remains among nodes never reduced to in-degree 0.
            let stuck = inner
                .tasks
                .iter()
                .find(|id| !order.contains(id))
                .copied()
                .unwrap();
            let path = find_blocking_path(&inner, stuck, stuck).unwrap_or_default();
            return Err(CycleError {
                from: stuck,
                to: stuck,
                path,
            });
        }

        Ok(order)
    }

    /// True iff some incoming edge has edge-status in {pending, failed}.
    pub fn is_blocked(&self, id: Identifier) -> bool {
        let inner = self.inner.read();
        inner
            .dependencies
            .get(&id)
            .map(|deps| {
                deps.iter().any(|dep| {
                    inner
                        .edges
                        .get(&(*dep, id))
                        .map(|e| e.status.blocks_dependent())
                        .unwrap_or(false)
                })
            })
            .unwrap_or(false)
    }

    /// The set of dependency ids currently blocking `id`.
    pub fn blocking_tasks(&self, id: Identifier) -> Vec<Identifier> {
        let inner = self.inner.read();
        inner
            .dependencies
            .get(&id)
            .map(|deps| {
                deps.iter()
                    .filter(|dep| {
                        inner
                            .edges
                            .get(&(**dep, id))
                            .map(|e| e.status.blocks_dependent())
                            .unwrap_or(false)
                    })
                    .copied()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// All tasks that are not blocked.
    pub fn ready_tasks(&self) -> Vec<Identifier> {
        let inner = self.inner.read();
        inner
            .tasks
            .iter()
            .filter(|id| !Self::is_blocked_locked(&inner, **id))
            .copied()
            .collect()
    }

    /// All tasks that are blocked.
    pub fn blocked_tasks(&self) -> Vec<Identifier> {
        let inner = self.inner.read();
        inner
            .tasks
            .iter()
            .filter(|id| Self::is_blocked_locked(&inner, **id))
            .copied()
            .collect()
    }

    fn is_blocked_locked(inner: &Inner, id: Identifier) -> bool {
        inner
            .dependencies
            .get(&id)
            .map(|deps| {
                deps.iter().any(|dep| {
                    inner
                        .edges
                        .get(&(*dep, id))
                        .map(|e| e.status.blocks_dependent())
                        .unwrap_or(false)
                })
            })
            .unwrap_or(false)
    }

    /// Every task reachable by following incoming (dependency) edges from `id`.
    pub fn transitive_dependencies(&self, id: Identifier) -> HashSet<Identifier> {
        let inner = self.inner.read();
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([id]);
        while let Some(current) = queue.pop_front() {
            if let Some(deps) = inner.dependencies.get(&current) {
                for &dep in deps {
                    if seen.insert(dep) {
                        queue.push_back(dep);
                    }
                }
            }
        }
        seen
    }

    /// Every task reachable by following outgoing (dependent) edges from `id`.
    pub fn transitive_dependents(&self, id: Identifier) -> HashSet<Identifier> {
        let inner = self.inner.read();
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([id]);
        while let Some(current) = queue.pop_front() {
            if let Some(dependents) = inner.dependents.get(&current) {
                for &dep in dependents {
                    if seen.insert(dep) {
                        queue.push_back(dep);
                    }
                }
            }
        }
        seen
    }

    /// Length of the longest chain of incoming (blocking) edges into `id`.
    pub fn dependency_depth(&self, id: Identifier) -> usize {
        let inner = self.inner.read();
        let blocking = blocking_adjacency_reversed(&inner);
        let mut memo = HashMap::new();
        depth_dfs(id, &blocking, &mut memo, &mut HashSet::new())
    }

    /// Direct dependencies of `id` (ids this task depends on).
    pub fn get_dependencies(&self, id: Identifier) -> Vec<Identifier> {
        let inner = self.inner.read();
        inner
            .dependencies
            .get(&id)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Direct dependents of `id` (ids that depend on this task).
    pub fn get_dependents(&self, id: Identifier) -> Vec<Identifier> {
        let inner = self.inner.read();
        inner
            .dependents
            .get(&id)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn get_edge(&self, from: Identifier, to: Identifier) -> Option<DependencyEdge> {
        self.inner.read().edges.get(&(from, to)).cloned()
    }

    /// Overwrite the status of an existing edge. Used by the dependency
    /// manager when a source task's status changes.
    pub fn update_edge_status(&self, from: Identifier, to: Identifier, status: EdgeStatus) {
        if let Some(edge) = self.inner.write().edges.get_mut(&(from, to)) {
            edge.status = status;
        }
    }

    pub fn has_task(&self, id: Identifier) -> bool {
        self.inner.read().tasks.contains(&id)
    }

    pub fn task_count(&self) -> usize {
        self.inner.read().tasks.len()
    }
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum AddEdgeError {
    #[error(transparent)]
    Duplicate(#[from] DuplicateEdgeError),
    #[error(transparent)]
    Cycle(#[from] CycleError),
}

fn blocking_adjacency(inner: &Inner) -> HashMap<Identifier, BTreeSet<Identifier>> {
    let mut adj: HashMap<Identifier, BTreeSet<Identifier>> = HashMap::new();
    for id in &inner.tasks {
        adj.entry(*id).or_default();
    }
    for ((from, to), edge) in &inner.edges {
        if edge.dependency_type.is_blocking_kind() {
            adj.entry(*from).or_default().insert(*to);
        }
    }
    adj
}

fn blocking_adjacency_reversed(inner: &Inner) -> HashMap<Identifier, BTreeSet<Identifier>> {
    let mut adj: HashMap<Identifier, BTreeSet<Identifier>> = HashMap::new();
    for id in &inner.tasks {
        adj.entry(*id).or_default();
    }
    for ((from, to), edge) in &inner.edges {
        if edge.dependency_type.is_blocking_kind() {
            adj.entry(*to).or_default().insert(*from);
        }
    }
    adj
}

fn depth_dfs(
    id: Identifier,
    reversed_blocking: &HashMap<Identifier, BTreeSet<Identifier>>,
    memo: &mut HashMap<Identifier, usize>,
    visiting: &mut HashSet<Identifier>,
) -> usize {
    if let Some(&d) = memo.get(&id) {
        return d;
    }
    if !visiting.insert(id) {
        // Defensive: a cycle should never reach here in practice since
        // add_edge prevents blocking cycles, but don't infinite-loop.
        return 0;
    }
    let depth = reversed_blocking
        .get(&id)
        .map(|deps| {
            deps.iter()
                .map(|&dep| 1 + depth_dfs(dep, reversed_blocking, memo, visiting))
                .max()
                .unwrap_or(0)
        })
        .unwrap_or(0);
    visiting.remove(&id);
    memo.insert(id, depth);
    depth
}

/// DFS from `start` along outgoing blocking edges, looking for `target`.
/// Returns the path `start -> ... -> target` (inclusive) if found.
fn find_blocking_path(
    inner: &Inner,
    start: Identifier,
    target: Identifier,
) -> Option<Vec<Identifier>> {
    let adj = blocking_adjacency(inner);
    let mut stack = vec![(start, vec![start])];
    let mut visited = HashSet::new();
    while let Some((node, path)) = stack.pop() {
        if node == target {
            return Some(path);
        }
        if !visited.insert(node) {
            continue;
        }
        if let Some(next) = adj.get(&node) {
            for &n in next {
                let mut extended = path.clone();
                extended.push(n);
                stack.push((n, extended));
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Metadata;

    fn id(n: u64) -> Identifier {
        Identifier::generate(None).unwrap_or_else(|_| panic!("generation failed for {n}"))
    }

    #[test]
    fn add_task_is_idempotent() {
        let g = DependencyGraph::new();
        let t = id(1);
        g.add_task(t);
        g.add_task(t);
        assert_eq!(g.task_count(), 1);
    }

    #[test]
    fn add_edge_rejects_duplicates() {
        let g = DependencyGraph::new();
        let (a, b) = (id(1), id(2));
        g.add_edge(a, b, DependencyType::Blocks, Metadata::new())
            .unwrap();
        let err = g
            .add_edge(a, b, DependencyType::Related, Metadata::new())
            .unwrap_err();
        assert!(matches!(err, AddEdgeError::Duplicate(_)));
    }

    #[test]
    fn add_edge_rejects_cycles_and_rolls_back() {
        let g = DependencyGraph::new();
        let (t1, t2, t3) = (id(1), id(2), id(3));
        g.add_edge(t1, t2, DependencyType::Blocks, Metadata::new())
            .unwrap();
        g.add_edge(t2, t3, DependencyType::Blocks, Metadata::new())
            .unwrap();

        let err = g
            .add_edge(t3, t1, DependencyType::Blocks, Metadata::new())
            .unwrap_err();
        let cycle = match err {
            AddEdgeError::Cycle(c) => c,
            other => panic!("expected cycle error, got {other:?}"),
        };
        assert!(cycle.path.contains(&t1));
        assert!(cycle.path.contains(&t2));
        assert!(cycle.path.contains(&t3));

        // S2: graph state is unchanged after rejection.
        assert!(g.get_dependencies(t1).is_empty());
        assert!(g.get_edge(t3, t1).is_none());
    }

    #[test]
    fn non_blocking_edges_do_not_trigger_cycle_detection() {
        let g = DependencyGraph::new();
        let (a, b) = (id(1), id(2));
        g.add_edge(a, b, DependencyType::Related, Metadata::new())
            .unwrap();
        // A related-back-edge does not form a blocking cycle.
        g.add_edge(b, a, DependencyType::Related, Metadata::new())
            .unwrap();
    }

    #[test]
    fn remove_edge_reports_existence() {
        let g = DependencyGraph::new();
        let (a, b) = (id(1), id(2));
        assert!(!g.remove_edge(a, b));
        g.add_edge(a, b, DependencyType::Blocks, Metadata::new())
            .unwrap();
        assert!(g.remove_edge(a, b));
        assert!(!g.remove_edge(a, b));
    }

    #[test]
    fn remove_task_detaches_incident_edges() {
        let g = DependencyGraph::new();
        let (t1, t2, t3) = (id(1), id(2), id(3));
        g.add_edge(t1, t2, DependencyType::Blocks, Metadata::new())
            .unwrap();
        g.add_edge(t2, t3, DependencyType::Blocks, Metadata::new())
            .unwrap();

        let affected = g.remove_task(t2);
        assert_eq!(affected, HashSet::from([t1, t3]));
        assert!(g.get_edge(t1, t2).is_none());
        assert!(g.get_edge(t2, t3).is_none());
        assert!(!g.has_task(t2));
    }

    #[test]
    fn topological_order_respects_edge_direction() {
        let g = DependencyGraph::new();
        let (t1, t2, t3) = (id(1), id(2), id(3));
        g.add_edge(t1, t2, DependencyType::Blocks, Metadata::new())
            .unwrap();
        g.add_edge(t2, t3, DependencyType::Blocks, Metadata::new())
            .unwrap();

        let order = g.topological_order().unwrap();
        let pos = |t: Identifier| order.iter().position(|&x| x == t).unwrap();
        assert!(pos(t1) < pos(t2));
        assert!(pos(t2) < pos(t3));
    }

    #[test]
    fn is_blocked_true_only_for_pending_or_failed_incoming_edges() {
        let g = DependencyGraph::new();
        let (t1, t2) = (id(1), id(2));
        g.add_edge(t1, t2, DependencyType::Blocks, Metadata::new())
            .unwrap();
        assert!(g.is_blocked(t2));

        g.update_edge_status(t1, t2, EdgeStatus::Satisfied);
        assert!(!g.is_blocked(t2));

        g.update_edge_status(t1, t2, EdgeStatus::Failed);
        assert!(g.is_blocked(t2));

        g.update_edge_status(t1, t2, EdgeStatus::Cancelled);
        assert!(!g.is_blocked(t2));
    }

    #[test]
    fn ready_and_blocked_tasks_partition_the_graph() {
        let g = DependencyGraph::new();
        let (t1, t2, t3) = (id(1), id(2), id(3));
        g.add_edge(t1, t2, DependencyType::Blocks, Metadata::new())
            .unwrap();
        g.add_task(t3);

        let ready: HashSet<_> = g.ready_tasks().into_iter().collect();
        let blocked: HashSet<_> = g.blocked_tasks().into_iter().collect();
        assert_eq!(ready, HashSet::from([t1, t3]));
        assert_eq!(blocked, HashSet::from([t2]));
    }

    #[test]
    fn transitive_dependencies_and_dependents() {
        let g = DependencyGraph::new();
        let (t1, t2, t3) = (id(1), id(2), id(3));
        g.add_edge(t1, t2, DependencyType::Blocks, Metadata::new())
            .unwrap();
        g.add_edge(t2, t3, DependencyType::Blocks, Metadata::new())
            .unwrap();

        assert_eq!(g.transitive_dependencies(t3), HashSet::from([t1, t2]));
        assert_eq!(g.transitive_dependents(t1), HashSet::from([t2, t3]));
    }

    #[test]
    fn dependency_depth_counts_longest_chain() {
        let g = DependencyGraph::new();
        let (t1, t2, t3) = (id(1), id(2), id(3));
        g.add_edge(t1, t2, DependencyType::Blocks, Metadata::new())
            .unwrap();
        g.add_edge(t2, t3, DependencyType::Blocks, Metadata::new())
            .unwrap();

        assert_eq!(g.dependency_depth(t1), 0);
        assert_eq!(g.dependency_depth(t2), 1);
        assert_eq!(g.dependency_depth(t3), 2);
    }
}
