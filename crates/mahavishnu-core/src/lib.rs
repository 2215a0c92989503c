//! Concurrent control plane for multi-pool task orchestration: dependency
//! graphs, dead-letter retry, task ordering, and pool/worker lifecycle
//! events, fanned out through an in-process event bus.

pub mod bus;
pub mod config;
pub mod dlq;
pub mod error;
pub mod graph;
pub mod identifier;
pub mod manager;
pub mod ordering;
pub mod registry;
pub mod sign;
pub mod types;

pub use bus::{EventBus, Subscription};
pub use config::Config;
pub use dlq::{DeadLetterQueue, DlqError, RetryExecutor, RetryOutcome};
pub use error::MahavishnuError;
pub use graph::{CycleError, DependencyGraph};
pub use identifier::{Identifier, IdentifierError};
pub use manager::{DependencyEvent, DependencyManager};
pub use ordering::{OrderingResult, TaskOrderingEngine};
pub use registry::{PoolRegistry, RegistryError, RegistryEvent};
pub use sign::{NullSignVerify, SignVerify};
pub use types::{
    Channel, DependencyEdge, DependencyType, Event, FailedTask, Pool, PoolState, Priority,
    RetryPolicy, Task, TaskStatus, Worker, WorkerStatus,
};
