//! The pool/worker registry: tracks pools, the workers they own, and
//! current task assignments (§4.6).
//!
//! Concurrency follows §5's "one mutex per pool plus a global mutex for
//! pool creation/deletion; worker operations take only the owning pool's
//! mutex": the outer [`parking_lot::RwLock`] is held briefly (write, for
//! insert/remove; read, for lookup) while every worker mutation locks
//! only the [`PoolEntry`] it targets.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tracing::warn;

use crate::identifier::Identifier;
use crate::types::{Pool, PoolState, Worker, WorkerStatus};

/// The event names this component emits (§4.6).
pub mod event_kind {
    pub const POOL_SPAWNED: &str = "pool_spawned";
    pub const POOL_SCALED: &str = "pool_scaled";
    pub const POOL_STATUS_CHANGED: &str = "pool_status_changed";
    pub const POOL_CLOSED: &str = "pool_closed";
    pub const WORKER_ADDED: &str = "worker_added";
    pub const WORKER_REMOVED: &str = "worker_removed";
    pub const WORKER_STATUS_CHANGED: &str = "worker_status_changed";
    pub const TASK_ASSIGNED: &str = "task_assigned";
    pub const TASK_COMPLETED: &str = "task_completed";
}

/// A single lifecycle notification raised by the pool/worker registry.
#[derive(Debug, Clone)]
pub struct RegistryEvent {
    pub kind: &'static str,
    pub pool_id: String,
    pub worker_id: Option<String>,
    pub payload: serde_json::Value,
}

/// Capability satisfied by anything that wants to observe registry
/// events, mirroring [`crate::manager::DependencyEventHandler`].
pub trait RegistryEventHandler: Send + Sync {
    fn handle(&self, event: &RegistryEvent);
}

/// Errors raised by pool/worker registry operations.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("pool {pool_id} not found")]
    PoolNotFound { pool_id: String },

    #[error("worker {worker_id} not found in pool {pool_id}")]
    WorkerNotFound { pool_id: String, worker_id: String },

    #[error("pool {pool_id} already exists")]
    DuplicatePool { pool_id: String },

    #[error("worker {worker_id} already exists in pool {pool_id}")]
    DuplicateWorker { pool_id: String, worker_id: String },

    #[error("pool {pool_id} is {state} and rejects new workers")]
    PoolNotAcceptingWorkers { pool_id: String, state: PoolState },
}

struct PoolEntry {
    pool: Pool,
    workers: HashMap<String, Worker>,
}

/// A point-in-time view of one pool's health, returned by [`PoolRegistry::pool_status`].
#[derive(Debug, Clone)]
pub struct PoolStatusSnapshot {
    pub pool: Pool,
    pub worker_counts: HashMap<WorkerStatus, usize>,
}

/// Tracks pools, their workers, and current task assignments.
pub struct PoolRegistry {
    pools: RwLock<HashMap<String, Arc<Mutex<PoolEntry>>>>,
    handlers: RwLock<Vec<Arc<dyn RegistryEventHandler>>>,
}

impl Default for PoolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PoolRegistry {
    pub fn new() -> Self {
        Self {
            pools: RwLock::new(HashMap::new()),
            handlers: RwLock::new(Vec::new()),
        }
    }

    pub fn subscribe(&self, handler: Arc<dyn RegistryEventHandler>) {
        self.handlers.write().push(handler);
    }

    fn entry(&self, pool_id: &str) -> Result<Arc<Mutex<PoolEntry>>, RegistryError> {
        self.pools
            .read()
            .get(pool_id)
            .cloned()
            .ok_or_else(|| RegistryError::PoolNotFound {
                pool_id: pool_id.to_string(),
            })
    }

    /// Register a new pool. Fails with [`RegistryError::DuplicatePool`] if
    /// `pool_id` is already registered.
    pub fn register_pool(
        &self,
        pool_id: impl Into<String>,
        pool_type: impl Into<String>,
        min_workers: u32,
        max_workers: u32,
    ) -> Result<Pool, RegistryError> {
        let pool_id = pool_id.into();
        let mut pools = self.pools.write();
        if pools.contains_key(&pool_id) {
            return Err(RegistryError::DuplicatePool { pool_id });
        }

        let pool = Pool {
            pool_id: pool_id.clone(),
            pool_type: pool_type.into(),
            worker_count: 0,
            min_workers,
            max_workers,
            state: PoolState::Initializing,
            completed_tasks: 0,
            average_duration_secs: 0.0,
        };
        pools.insert(
            pool_id.clone(),
            Arc::new(Mutex::new(PoolEntry {
                pool: pool.clone(),
                workers: HashMap::new(),
            })),
        );
        drop(pools);

        self.emit(RegistryEvent {
            kind: event_kind::POOL_SPAWNED,
            pool_id,
            worker_id: None,
            payload: serde_json::json!({ "pool_type": pool.pool_type }),
        });
        Ok(pool)
    }

    /// Update min/max bounds and the current worker count. Requests
    /// outside `[min, max]` are clamped and logged rather than rejected
    /// (§4.6).
    pub fn scale_pool(
        &self,
        pool_id: &str,
        min_workers: u32,
        max_workers: u32,
        requested_worker_count: u32,
    ) -> Result<Pool, RegistryError> {
        let entry = self.entry(pool_id)?;
        let mut guard = entry.lock();

        let clamped = requested_worker_count.clamp(min_workers, max_workers);
        if clamped != requested_worker_count {
            warn!(
                pool_id,
                requested = requested_worker_count,
                clamped,
                min_workers,
                max_workers,
                "scale request clamped to pool bounds"
            );
        }

        let previous_state = guard.pool.state;
        guard.pool.min_workers = min_workers;
        guard.pool.max_workers = max_workers;
        guard.pool.worker_count = clamped;
        guard.pool.state = PoolState::Scaling;
        let pool = guard.pool.clone();
        drop(guard);

        self.emit(RegistryEvent {
            kind: event_kind::POOL_SCALED,
            pool_id: pool_id.to_string(),
            worker_id: None,
            payload: serde_json::json!({
                "min_workers": min_workers,
                "max_workers": max_workers,
                "worker_count": clamped,
            }),
        });
        self.emit_pool_status_change(pool_id, previous_state, pool.state);
        Ok(pool)
    }

    /// Explicitly close a pool. No automatic teardown ever happens (§3).
    pub fn close_pool(&self, pool_id: &str) -> Result<(), RegistryError> {
        let entry = self.entry(pool_id)?;
        let previous_state = {
            let mut guard = entry.lock();
            let previous_state = guard.pool.state;
            guard.pool.state = PoolState::Stopped;
            previous_state
        };
        self.emit(RegistryEvent {
            kind: event_kind::POOL_CLOSED,
            pool_id: pool_id.to_string(),
            worker_id: None,
            payload: serde_json::json!({}),
        });
        self.emit_pool_status_change(pool_id, previous_state, PoolState::Stopped);
        Ok(())
    }

    /// Add a worker to a pool. A pool in `stopped` or `error` state
    /// rejects new workers (§4.6 invariant).
    pub fn add_worker(
        &self,
        pool_id: &str,
        worker_id: impl Into<String>,
    ) -> Result<Worker, RegistryError> {
        let worker_id = worker_id.into();
        let entry = self.entry(pool_id)?;
        let mut guard = entry.lock();

        if matches!(guard.pool.state, PoolState::Stopped | PoolState::Error) {
            return Err(RegistryError::PoolNotAcceptingWorkers {
                pool_id: pool_id.to_string(),
                state: guard.pool.state,
            });
        }
        if guard.workers.contains_key(&worker_id) {
            return Err(RegistryError::DuplicateWorker {
                pool_id: pool_id.to_string(),
                worker_id,
            });
        }

        let worker = Worker {
            worker_id: worker_id.clone(),
            pool_id: pool_id.to_string(),
            status: WorkerStatus::Initializing,
            current_task_id: None,
            tasks_completed: 0,
            last_transition_at: Utc::now(),
        };
        guard.workers.insert(worker_id.clone(), worker.clone());
        guard.pool.worker_count = guard.workers.len() as u32;
        let previous_state = guard.pool.state;
        if guard.pool.state == PoolState::Initializing {
            guard.pool.state = PoolState::Running;
        }
        let new_state = guard.pool.state;
        drop(guard);

        self.emit(RegistryEvent {
            kind: event_kind::WORKER_ADDED,
            pool_id: pool_id.to_string(),
            worker_id: Some(worker_id),
            payload: serde_json::json!({}),
        });
        self.emit_pool_status_change(pool_id, previous_state, new_state);
        Ok(worker)
    }

    /// Remove a worker permanently. Worker-to-pool ownership is exclusive
    /// and immutable: there is no "reassign" operation, only remove-then-add.
    pub fn remove_worker(&self, pool_id: &str, worker_id: &str) -> Result<bool, RegistryError> {
        let entry = self.entry(pool_id)?;
        let existed = {
            let mut guard = entry.lock();
            let existed = guard.workers.remove(worker_id).is_some();
            guard.pool.worker_count = guard.workers.len() as u32;
            existed
        };
        if existed {
            self.emit(RegistryEvent {
                kind: event_kind::WORKER_REMOVED,
                pool_id: pool_id.to_string(),
                worker_id: Some(worker_id.to_string()),
                payload: serde_json::json!({}),
            });
        }
        Ok(existed)
    }

    /// Update a worker's status, emitting `WORKER_STATUS_CHANGED` with
    /// both the previous and next status.
    pub fn update_worker_status(
        &self,
        pool_id: &str,
        worker_id: &str,
        new_status: WorkerStatus,
    ) -> Result<WorkerStatus, RegistryError> {
        let entry = self.entry(pool_id)?;
        let previous = {
            let mut guard = entry.lock();
            let worker = guard.workers.get_mut(worker_id).ok_or_else(|| {
                RegistryError::WorkerNotFound {
                    pool_id: pool_id.to_string(),
                    worker_id: worker_id.to_string(),
                }
            })?;
            let previous = worker.status;
            worker.status = new_status;
            worker.last_transition_at = Utc::now();
            if new_status != WorkerStatus::Busy {
                worker.current_task_id = None;
            }
            previous
        };

        self.emit(RegistryEvent {
            kind: event_kind::WORKER_STATUS_CHANGED,
            pool_id: pool_id.to_string(),
            worker_id: Some(worker_id.to_string()),
            payload: serde_json::json!({
                "previous_status": previous.to_string(),
                "next_status": new_status.to_string(),
            }),
        });
        Ok(previous)
    }

    /// Assign a task to a worker, marking it busy.
    pub fn assign_task(
        &self,
        pool_id: &str,
        worker_id: &str,
        task_id: Identifier,
    ) -> Result<(), RegistryError> {
        let entry = self.entry(pool_id)?;
        {
            let mut guard = entry.lock();
            let worker = guard.workers.get_mut(worker_id).ok_or_else(|| {
                RegistryError::WorkerNotFound {
                    pool_id: pool_id.to_string(),
                    worker_id: worker_id.to_string(),
                }
            })?;
            worker.status = WorkerStatus::Busy;
            worker.current_task_id = Some(task_id);
            worker.last_transition_at = Utc::now();
        }
        self.emit(RegistryEvent {
            kind: event_kind::TASK_ASSIGNED,
            pool_id: pool_id.to_string(),
            worker_id: Some(worker_id.to_string()),
            payload: serde_json::json!({ "task_id": task_id.to_string() }),
        });
        Ok(())
    }

    /// Mark the worker's current task complete, rolling the duration
    /// into the pool's running average.
    pub fn complete_task(
        &self,
        pool_id: &str,
        worker_id: &str,
        duration_secs: f64,
    ) -> Result<(), RegistryError> {
        let entry = self.entry(pool_id)?;
        let task_id = {
            let mut guard = entry.lock();
            let worker = guard.workers.get_mut(worker_id).ok_or_else(|| {
                RegistryError::WorkerNotFound {
                    pool_id: pool_id.to_string(),
                    worker_id: worker_id.to_string(),
                }
            })?;
            let task_id = worker.current_task_id.take();
            worker.status = WorkerStatus::Idle;
            worker.tasks_completed += 1;
            worker.last_transition_at = Utc::now();

            let completed_before = guard.pool.completed_tasks;
            let total = completed_before + 1;
            guard.pool.average_duration_secs =
                (guard.pool.average_duration_secs * completed_before as f64 + duration_secs) / total as f64;
            guard.pool.completed_tasks = total;
            task_id
        };
        self.emit(RegistryEvent {
            kind: event_kind::TASK_COMPLETED,
            pool_id: pool_id.to_string(),
            worker_id: Some(worker_id.to_string()),
            payload: serde_json::json!({ "task_id": task_id.map(|t| t.to_string()) }),
        });
        Ok(())
    }

    pub fn pool_status(&self, pool_id: &str) -> Result<PoolStatusSnapshot, RegistryError> {
        let entry = self.entry(pool_id)?;
        let guard = entry.lock();
        let mut worker_counts: HashMap<WorkerStatus, usize> = HashMap::new();
        for worker in guard.workers.values() {
            *worker_counts.entry(worker.status).or_default() += 1;
        }
        Ok(PoolStatusSnapshot {
            pool: guard.pool.clone(),
            worker_counts,
        })
    }

    pub fn worker_status(&self, pool_id: &str, worker_id: &str) -> Option<Worker> {
        self.pools.read().get(pool_id)?.lock().workers.get(worker_id).cloned()
    }

    pub fn list_pools(&self) -> Vec<Pool> {
        self.pools.read().values().map(|e| e.lock().pool.clone()).collect()
    }

    /// Emit `POOL_STATUS_CHANGED` iff the pool's lifecycle state actually
    /// moved, carrying both ends of the transition the way
    /// `WORKER_STATUS_CHANGED` does for workers.
    fn emit_pool_status_change(&self, pool_id: &str, previous: PoolState, next: PoolState) {
        if previous == next {
            return;
        }
        self.emit(RegistryEvent {
            kind: event_kind::POOL_STATUS_CHANGED,
            pool_id: pool_id.to_string(),
            worker_id: None,
            payload: serde_json::json!({
                "previous_state": previous.to_string(),
                "next_state": next.to_string(),
            }),
        });
    }

    fn emit(&self, event: RegistryEvent) {
        for handler in self.handlers.read().iter() {
            let handler = handler.clone();
            let event = event.clone();
            let _ = catch_unwind(AssertUnwindSafe(|| handler.handle(&event)));
        }
    }
}
