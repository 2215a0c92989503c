//! Cross-component scenarios from spec §8: a dependency chain feeding the
//! ordering engine, a pool/worker lifecycle publishing to the event bus, and
//! a DLQ retry cycle, exercised together the way the gateway would drive them.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Utc;
use mahavishnu_core::dlq::RetryExecutor;
use mahavishnu_core::ordering::{OrderingThresholds, TaskOrderingEngine, TaskView};
use mahavishnu_core::types::{
    Channel, DependencyType, ErrorCategory, Metadata, Priority, QueueStatus, RetryPolicy,
    TaskStatus, WorkerStatus,
};
use mahavishnu_core::{DeadLetterQueue, DependencyManager, EventBus, Identifier, PoolRegistry};

fn id() -> Identifier {
    Identifier::generate(None).unwrap()
}

/// S1 end-to-end: a linear chain unblocks in order, and the ordering
/// engine's dependency-aware strategy agrees with the manager's view of
/// what's ready.
#[test]
fn linear_chain_unblocks_and_orders_consistently() {
    let manager = DependencyManager::new();
    let (t1, t2, t3) = (id(), id(), id());
    manager.add_task(t1);
    manager.add_task(t2);
    manager.add_task(t3);
    manager
        .add_dependency(t1, t2, DependencyType::Blocks, Metadata::new())
        .unwrap();
    manager
        .add_dependency(t2, t3, DependencyType::Blocks, Metadata::new())
        .unwrap();

    assert_eq!(manager.get_ready_tasks(), vec![t1]);

    let engine = TaskOrderingEngine::default();
    let views = vec![
        TaskView {
            id: t1,
            priority: Priority::Medium,
            deadline: None,
            estimated_duration_secs: None,
            blocker_probability: None,
        },
        TaskView {
            id: t2,
            priority: Priority::Medium,
            deadline: None,
            estimated_duration_secs: None,
            blocker_probability: None,
        },
        TaskView {
            id: t3,
            priority: Priority::Medium,
            deadline: None,
            estimated_duration_secs: None,
            blocker_probability: None,
        },
    ];
    let result = engine.order_tasks(
        &views,
        manager.graph(),
        mahavishnu_core::types::OrderingStrategy::DependencyAware,
        Utc::now(),
    );
    let order: Vec<_> = result.recommendations.iter().map(|r| r.task_id).collect();
    assert_eq!(order, vec![t1, t2, t3]);

    manager.update_task_status(t1, TaskStatus::InProgress).unwrap();
    let unblocked = manager.update_task_status(t1, TaskStatus::Completed).unwrap();
    assert_eq!(unblocked, std::collections::HashSet::from([t2]));
    assert_eq!(manager.get_ready_tasks(), vec![t2]);
}

/// A pool/worker lifecycle publishes events onto both its own channel and
/// the global channel, and a subscriber attached before the work starts
/// observes the whole sequence in order.
#[tokio::test]
async fn pool_lifecycle_publishes_ordered_events_to_bus() {
    let registry = Arc::new(PoolRegistry::new());
    let bus = Arc::new(EventBus::new(64));

    {
        let bus = Arc::clone(&bus);
        registry.subscribe(Arc::new(BusForwarder { bus }));
    }

    let global = bus.subscribe(Channel::Global);
    let pool_chan = bus.subscribe(Channel::Pool { pool_id: "p1".to_string() });

    registry.register_pool("p1", "agent", 1, 3).unwrap();
    registry.add_worker("p1", "w1").unwrap();
    let task = id();
    registry.assign_task("p1", "w1", task).unwrap();
    registry.complete_task("p1", "w1", 12.5).unwrap();

    let mut pool_events = Vec::new();
    for _ in 0..4 {
        pool_events.push(pool_chan.recv().await.event_type);
    }
    assert_eq!(
        pool_events,
        vec!["pool_spawned", "worker_added", "task_assigned", "task_completed"]
    );

    let mut global_events = Vec::new();
    for _ in 0..4 {
        global_events.push(global.recv().await.event_type);
    }
    assert_eq!(global_events, pool_events);
}

struct BusForwarder {
    bus: Arc<EventBus>,
}

impl mahavishnu_core::registry::RegistryEventHandler for BusForwarder {
    fn handle(&self, event: &mahavishnu_core::registry::RegistryEvent) {
        self.bus.publish(
            event.kind,
            Channel::Pool { pool_id: event.pool_id.clone() },
            event.payload.clone(),
        );
    }
}

/// S3/S5-adjacent: a task that keeps failing exhausts its retries under
/// the background processor, while the registry reflects the worker
/// going back to idle between attempts.
#[tokio::test(start_paused = true)]
async fn dlq_processor_exhausts_after_repeated_failures() {
    let dlq = Arc::new(DeadLetterQueue::new(10));
    let task_id = id();
    dlq.enqueue(
        task_id,
        serde_json::json!({"title": "flaky"}),
        vec!["repo-a".to_string()],
        "connection reset",
        ErrorCategory::Network,
        RetryPolicy::Immediate,
        2,
    )
    .unwrap();

    struct AlwaysFails;
    #[async_trait::async_trait]
    impl RetryExecutor for AlwaysFails {
        async fn retry(&self, _task: &mahavishnu_core::types::FailedTask) -> Result<(), String> {
            Err("still broken".to_string())
        }
    }

    dlq.start_retry_processor(Arc::new(AlwaysFails), StdDuration::from_millis(10));

    for _ in 0..3 {
        tokio::time::advance(StdDuration::from_millis(15)).await;
        tokio::task::yield_now().await;
    }

    let record = dlq.get(task_id).unwrap();
    assert_eq!(record.queue_status, QueueStatus::Exhausted);
    assert_eq!(record.retry_count, 2);
    dlq.stop_retry_processor().await;
}

/// The ordering engine's thresholds are configurable and independently
/// affect urgency labeling, matching the `ordering.*` config keys.
#[test]
fn custom_thresholds_change_urgency_classification() {
    let engine = TaskOrderingEngine::new(
        Default::default(),
        OrderingThresholds {
            urgent_deadline_days: 10,
            approaching_deadline_days: 20,
            parallelism_factor: 0.6,
        },
    );
    let graph = mahavishnu_core::DependencyGraph::new();
    let t = id();
    graph.add_task(t);
    let now = Utc::now();
    let views = vec![TaskView {
        id: t,
        priority: Priority::Low,
        deadline: Some(now + chrono::Duration::days(5)),
        estimated_duration_secs: None,
        blocker_probability: None,
    }];
    let result = engine.order_tasks(
        &views,
        &graph,
        mahavishnu_core::types::OrderingStrategy::Balanced,
        now,
    );
    // 5 days is within the widened 10-day "urgent" window.
    assert_eq!(result.recommendations[0].urgency, mahavishnu_core::types::Urgency::Urgent);
}

/// Worker state transitions clear the current task id once it stops
/// being busy, matching the registry's invariant.
#[test]
fn worker_status_change_clears_current_task_when_not_busy() {
    let registry = PoolRegistry::new();
    registry.register_pool("p1", "agent", 1, 2).unwrap();
    registry.add_worker("p1", "w1").unwrap();
    registry.assign_task("p1", "w1", id()).unwrap();
    assert!(registry.worker_status("p1", "w1").unwrap().current_task_id.is_some());

    registry
        .update_worker_status("p1", "w1", WorkerStatus::Error)
        .unwrap();
    assert!(registry.worker_status("p1", "w1").unwrap().current_task_id.is_none());
}
