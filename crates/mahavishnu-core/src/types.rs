//! Shared data model: tasks, dependency edges, pools, workers, and events.
//!
//! These types are owned by whichever component the data model assigns
//! them to (§3 Ownership) and are passed by value or by identifier across
//! component boundaries — nothing here holds a pointer into another
//! component's state.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::identifier::Identifier;

macro_rules! wire_enum {
    ($name:ident { $($variant:ident => $wire:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let s = match self {
                    $(Self::$variant => $wire),+
                };
                f.write_str(s)
            }
        }

        impl FromStr for $name {
            type Err = ParseEnumError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($wire => Ok(Self::$variant),)+
                    other => Err(ParseEnumError {
                        type_name: stringify!($name),
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid {type_name} value: {value:?}")]
pub struct ParseEnumError {
    type_name: &'static str,
    value: String,
}

wire_enum!(Priority {
    Critical => "critical",
    High => "high",
    Medium => "medium",
    Low => "low",
});

wire_enum!(TaskStatus {
    Pending => "pending",
    InProgress => "in_progress",
    Completed => "completed",
    Failed => "failed",
    Cancelled => "cancelled",
});

impl TaskStatus {
    /// Whether `self -> to` is a legal transition per §3's state graph.
    pub fn can_transition_to(self, to: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, to),
            (Pending, InProgress)
                | (Pending, Cancelled)
                | (InProgress, Completed)
                | (InProgress, Failed)
                | (InProgress, Cancelled)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Cancelled)
    }
}

wire_enum!(DependencyType {
    Blocks => "blocks",
    Requires => "requires",
    Related => "related",
    Subtask => "subtask",
});

impl DependencyType {
    /// Whether this edge type participates in cycle detection and blocking.
    pub fn is_blocking_kind(self) -> bool {
        matches!(self, DependencyType::Blocks | DependencyType::Requires)
    }
}

wire_enum!(EdgeStatus {
    Pending => "pending",
    Satisfied => "satisfied",
    Failed => "failed",
    Cancelled => "cancelled",
});

impl EdgeStatus {
    /// Only pending and failed edge-states block the dependent (§3).
    pub fn blocks_dependent(self) -> bool {
        matches!(self, EdgeStatus::Pending | EdgeStatus::Failed)
    }

    /// Edge-status derived from the status the source (dependency) task just entered.
    pub fn from_source_task_status(status: TaskStatus) -> Option<EdgeStatus> {
        match status {
            TaskStatus::Completed => Some(EdgeStatus::Satisfied),
            TaskStatus::Failed => Some(EdgeStatus::Failed),
            TaskStatus::Cancelled => Some(EdgeStatus::Cancelled),
            _ => None,
        }
    }
}

wire_enum!(RetryPolicy {
    Never => "never",
    Linear => "linear",
    Exponential => "exponential",
    Immediate => "immediate",
});

wire_enum!(ErrorCategory {
    Transient => "transient",
    Network => "network",
    Resource => "resource",
    Permission => "permission",
    Validation => "validation",
    Permanent => "permanent",
});

wire_enum!(QueueStatus {
    Pending => "pending",
    Retrying => "retrying",
    Completed => "completed",
    Exhausted => "exhausted",
    Archived => "archived",
});

wire_enum!(PoolState {
    Initializing => "initializing",
    Running => "running",
    Scaling => "scaling",
    Stopped => "stopped",
    Error => "error",
});

wire_enum!(WorkerStatus {
    Initializing => "initializing",
    Idle => "idle",
    Busy => "busy",
    Error => "error",
    Stopping => "stopping",
});

wire_enum!(OrderingStrategy {
    DeadlineFirst => "deadline_first",
    PriorityFirst => "priority_first",
    DependencyAware => "dependency_aware",
    BlockerAware => "blocker_aware",
    Balanced => "balanced",
});

wire_enum!(Urgency {
    Critical => "critical",
    Urgent => "urgent",
    Normal => "normal",
    Low => "low",
});

impl Urgency {
    /// Ordering used by `should_start_now`'s "urgency >= urgent" test (§4.4):
    /// critical counts as at least as urgent as urgent.
    pub fn at_least_urgent(self) -> bool {
        matches!(self, Urgency::Critical | Urgency::Urgent)
    }
}

pub type Metadata = HashMap<String, serde_json::Value>;

/// A unit of work tracked by the dependency manager and the ordering engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Identifier,
    pub title: String,
    pub repository: Option<String>,
    pub priority: Priority,
    pub status: TaskStatus,
    pub deadline: Option<DateTime<Utc>>,
    pub estimated_duration_secs: Option<u64>,
    pub tags: Vec<String>,
    pub metadata: Metadata,
}

impl Task {
    pub fn new(id: Identifier, title: impl Into<String>, priority: Priority) -> Self {
        Self {
            id,
            title: title.into(),
            repository: None,
            priority,
            status: TaskStatus::Pending,
            deadline: None,
            estimated_duration_secs: None,
            tags: Vec::new(),
            metadata: Metadata::new(),
        }
    }
}

/// A directed dependency edge between two tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencyEdge {
    pub dependency_id: Identifier,
    pub dependent_id: Identifier,
    pub dependency_type: DependencyType,
    pub status: EdgeStatus,
    pub metadata: Metadata,
}

/// A task that has fallen into the dead-letter queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedTask {
    pub task_id: Identifier,
    pub payload: serde_json::Value,
    pub repositories: Vec<String>,
    pub last_error: String,
    pub first_failed_at: DateTime<Utc>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub retry_policy: RetryPolicy,
    pub error_category: ErrorCategory,
    pub queue_status: QueueStatus,
    pub total_attempts: u32,
}

/// A logical grouping of workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pool {
    pub pool_id: String,
    pub pool_type: String,
    pub worker_count: u32,
    pub min_workers: u32,
    pub max_workers: u32,
    pub state: PoolState,
    pub completed_tasks: u64,
    pub average_duration_secs: f64,
}

/// A single worker, owned exclusively by one pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    pub worker_id: String,
    pub pool_id: String,
    pub status: WorkerStatus,
    pub current_task_id: Option<Identifier>,
    pub tasks_completed: u64,
    pub last_transition_at: DateTime<Utc>,
}

/// An immutable lifecycle notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_type: String,
    pub channel: Channel,
    pub payload: serde_json::Value,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
}

/// The channel an event is published on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Channel {
    Global,
    Pool { pool_id: String },
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::Global => f.write_str("global"),
            Channel::Pool { pool_id } => write!(f, "pool:{pool_id}"),
        }
    }
}

/// Event-name catalogue (§6); exact wire strings.
pub mod event_names {
    pub const POOL_SPAWNED: &str = "pool.spawned";
    pub const POOL_SCALED: &str = "pool.scaled";
    pub const POOL_STATUS_CHANGED: &str = "pool.status_changed";
    pub const POOL_CLOSED: &str = "pool.closed";
    pub const WORKER_ADDED: &str = "worker.added";
    pub const WORKER_REMOVED: &str = "worker.removed";
    pub const WORKER_STATUS_CHANGED: &str = "worker.status_changed";
    pub const TASK_ASSIGNED: &str = "task.assigned";
    pub const TASK_COMPLETED: &str = "task.completed";
    pub const SUBSCRIPTION_LAGGED: &str = "subscription.lagged";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_status_display_and_parse_roundtrip() {
        for s in [
            TaskStatus::Pending,
            TaskStatus::InProgress,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Cancelled,
        ] {
            let wire = s.to_string();
            assert_eq!(wire.parse::<TaskStatus>().unwrap(), s);
        }
    }

    #[test]
    fn task_status_transition_graph_matches_spec() {
        use TaskStatus::*;
        assert!(Pending.can_transition_to(InProgress));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(InProgress.can_transition_to(Completed));
        assert!(InProgress.can_transition_to(Failed));
        assert!(InProgress.can_transition_to(Cancelled));
        assert!(!Completed.can_transition_to(Pending));
        assert!(!Cancelled.can_transition_to(InProgress));
        assert!(!Failed.can_transition_to(InProgress));
    }

    #[test]
    fn failed_to_pending_is_only_via_dlq_retry_not_direct_transition() {
        // The state graph itself has no Failed -> Pending edge; that
        // transition is mediated exclusively by the DLQ's retry path,
        // which resubmits a fresh task rather than calling can_transition_to.
        assert!(!TaskStatus::Failed.can_transition_to(TaskStatus::Pending));
    }

    #[test]
    fn terminal_statuses_are_identified() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Failed.is_terminal());
        assert!(!TaskStatus::Pending.is_terminal());
    }

    #[test]
    fn edge_status_from_source_task_status() {
        assert_eq!(
            EdgeStatus::from_source_task_status(TaskStatus::Completed),
            Some(EdgeStatus::Satisfied)
        );
        assert_eq!(
            EdgeStatus::from_source_task_status(TaskStatus::Failed),
            Some(EdgeStatus::Failed)
        );
        assert_eq!(
            EdgeStatus::from_source_task_status(TaskStatus::Cancelled),
            Some(EdgeStatus::Cancelled)
        );
        assert_eq!(
            EdgeStatus::from_source_task_status(TaskStatus::Pending),
            None
        );
    }

    #[test]
    fn only_pending_and_failed_edges_block() {
        assert!(EdgeStatus::Pending.blocks_dependent());
        assert!(EdgeStatus::Failed.blocks_dependent());
        assert!(!EdgeStatus::Satisfied.blocks_dependent());
        assert!(!EdgeStatus::Cancelled.blocks_dependent());
    }

    #[test]
    fn channel_display() {
        assert_eq!(Channel::Global.to_string(), "global");
        assert_eq!(
            Channel::Pool {
                pool_id: "p1".to_string()
            }
            .to_string(),
            "pool:p1"
        );
    }

    #[test]
    fn parse_enum_error_is_descriptive() {
        let err = "bogus".parse::<Priority>().unwrap_err();
        assert!(err.to_string().contains("Priority"));
        assert!(err.to_string().contains("bogus"));
    }
}
