//! The dead-letter queue: a bounded buffer of failed tasks, their retry
//! schedule, and the background processor that resubmits them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::identifier::Identifier;
use crate::types::{ErrorCategory, FailedTask, QueueStatus, RetryPolicy};

/// Errors raised by dead-letter queue operations.
#[derive(Debug, thiserror::Error, PartialEq, Eq, Clone)]
pub enum DlqError {
    #[error("dead-letter queue is at capacity: {current}/{limit}")]
    CapacityExceeded { current: usize, limit: usize },

    #[error("no dead-lettered task found with id {0}")]
    NotFound(Identifier),

    #[error("task {0} has exhausted its retries and cannot be retried again")]
    Exhausted(Identifier),

    #[error("task {0} is already being retried")]
    AlreadyRetrying(Identifier),
}

/// A capability for persisting dead-letter records to durable storage.
/// The in-process queue below is authoritative; an implementor of this
/// trait is an advisory projection (a write-behind log, a metrics sink)
/// and is never consulted to answer a query. The default is a no-op, so
/// the queue works standalone with no persistence configured.
pub trait DlqPersistence: Send + Sync {
    fn on_enqueued(&self, _task: &FailedTask) {}
    fn on_retried(&self, _task_id: Identifier, _attempt: u32) {}
    fn on_archived(&self, _task_id: Identifier) {}
}

/// The no-op default used when no persistence projection is configured.
pub struct NoopPersistence;
impl DlqPersistence for NoopPersistence {}

/// A summary of the retry outcome, reported back to the caller driving
/// the retry processor (production code hands this to the pool registry
/// / task submission path; tests hand it to a recorder).
#[derive(Debug, Clone)]
pub enum RetryOutcome {
    Resubmitted(Identifier),
    Succeeded(Identifier),
    FailedAgain { task_id: Identifier, error: String },
}

/// A capability for actually attempting a retry of a dead-lettered task.
/// Kept separate from the queue itself so the queue has no notion of
/// "how work is executed" — it only tracks schedule and history.
#[async_trait::async_trait]
pub trait RetryExecutor: Send + Sync {
    async fn retry(&self, task: &FailedTask) -> Result<(), String>;
}

const _: () = {
    fn _assert_persistence_object_safe(_: &dyn DlqPersistence) {}
};

struct Inner {
    records: HashMap<Identifier, FailedTask>,
    max_size: usize,
}

/// Lifetime counters, incremented but never reset, used to answer
/// "how many tasks has this queue ever seen" without replaying history.
#[derive(Default)]
struct LifetimeCounters {
    enqueued: std::sync::atomic::AtomicU64,
    retried_success: std::sync::atomic::AtomicU64,
    retried_failed: std::sync::atomic::AtomicU64,
    exhausted: std::sync::atomic::AtomicU64,
    manually_retried: std::sync::atomic::AtomicU64,
    archived: std::sync::atomic::AtomicU64,
}

/// The dead-letter queue itself.
pub struct DeadLetterQueue {
    inner: RwLock<Inner>,
    persistence: Arc<dyn DlqPersistence>,
    processor_running: Arc<AtomicBool>,
    processor_handle: RwLock<Option<JoinHandle<()>>>,
    processor_shutdown: Arc<tokio::sync::Notify>,
    lifetime: LifetimeCounters,
}

impl DeadLetterQueue {
    pub fn new(max_size: usize) -> Self {
        Self::with_persistence(max_size, Arc::new(NoopPersistence))
    }

    pub fn with_persistence(max_size: usize, persistence: Arc<dyn DlqPersistence>) -> Self {
        Self {
            inner: RwLock::new(Inner {
                records: HashMap::new(),
                max_size,
            }),
            persistence,
            processor_running: Arc::new(AtomicBool::new(false)),
            processor_handle: RwLock::new(None),
            processor_shutdown: Arc::new(tokio::sync::Notify::new()),
            lifetime: LifetimeCounters::default(),
        }
    }

    /// Enqueue a newly-failed task. Rejects once the queue is at capacity
    /// rather than evicting the oldest record — a full DLQ signals that an
    /// operator needs to intervene, not that history should silently drop.
    pub fn enqueue(
        &self,
        task_id: Identifier,
        payload: serde_json::Value,
        repositories: Vec<String>,
        error: impl Into<String>,
        error_category: ErrorCategory,
        retry_policy: RetryPolicy,
        max_retries: u32,
    ) -> Result<(), DlqError> {
        let mut inner = self.inner.write();
        if inner.records.len() >= inner.max_size && !inner.records.contains_key(&task_id) {
            return Err(DlqError::CapacityExceeded {
                current: inner.records.len(),
                limit: inner.max_size,
            });
        }

        let now = Utc::now();
        let next_retry_at = next_retry_time(retry_policy, 0, now);
        let record = FailedTask {
            task_id,
            payload,
            repositories,
            last_error: error.into(),
            first_failed_at: now,
            next_retry_at,
            retry_count: 0,
            max_retries,
            retry_policy,
            error_category,
            queue_status: if retry_policy == RetryPolicy::Never {
                QueueStatus::Exhausted
            } else {
                QueueStatus::Pending
            },
            total_attempts: 1,
        };
        self.persistence.on_enqueued(&record);
        inner.records.insert(task_id, record);
        self.lifetime.enqueued.fetch_add(1, AtomicOrdering::Relaxed);
        Ok(())
    }

    pub fn get(&self, task_id: Identifier) -> Option<FailedTask> {
        self.inner.read().records.get(&task_id).cloned()
    }

    pub fn list(&self) -> Vec<FailedTask> {
        let mut records: Vec<_> = self.inner.read().records.values().cloned().collect();
        records.sort_by_key(|r| r.first_failed_at);
        records
    }

    /// Select every record due for retry and claim it by transitioning its
    /// status to `retrying` before releasing the lock (§4.5 step 3). This is
    /// the gate that keeps a record from ever reaching the callback twice
    /// concurrently: once claimed, its status is no longer `pending`, so
    /// neither another processor tick nor a concurrent manual `retry()` can
    /// select it again until this dispatch records an outcome.
    fn claim_due(&self, now: DateTime<Utc>) -> Vec<FailedTask> {
        let mut inner = self.inner.write();
        let mut claimed = Vec::new();
        for record in inner.records.values_mut() {
            if record.queue_status == QueueStatus::Pending
                && record.retry_count < record.max_retries
                && record.next_retry_at.map(|t| t <= now).unwrap_or(false)
            {
                record.queue_status = QueueStatus::Retrying;
                claimed.push(record.clone());
            }
        }
        claimed
    }

    pub fn archive(&self, task_id: Identifier) -> Result<(), DlqError> {
        let mut inner = self.inner.write();
        let record = inner
            .records
            .get_mut(&task_id)
            .ok_or(DlqError::NotFound(task_id))?;
        record.queue_status = QueueStatus::Archived;
        self.persistence.on_archived(task_id);
        self.lifetime.archived.fetch_add(1, AtomicOrdering::Relaxed);
        Ok(())
    }

    /// Synchronously invoke `executor` for a single dead-lettered task,
    /// outside of the background processor's schedule. On success the
    /// record is dropped and `manually_retried` is counted; on failure
    /// the retry count and next-retry instant advance exactly as they
    /// would under the background processor.
    pub async fn retry(
        &self,
        task_id: Identifier,
        executor: Arc<dyn RetryExecutor>,
    ) -> Result<RetryOutcome, DlqError> {
        let record = {
            let mut inner = self.inner.write();
            let record = inner
                .records
                .get_mut(&task_id)
                .ok_or(DlqError::NotFound(task_id))?;
            match record.queue_status {
                QueueStatus::Exhausted | QueueStatus::Archived => {
                    return Err(DlqError::Exhausted(task_id));
                }
                QueueStatus::Retrying => {
                    // Already claimed by the background processor (or
                    // another manual retry); refuse to dispatch twice.
                    return Err(DlqError::AlreadyRetrying(task_id));
                }
                QueueStatus::Pending | QueueStatus::Completed => {
                    record.queue_status = QueueStatus::Retrying;
                    record.clone()
                }
            }
        };

        let outcome = executor.retry(&record).await;
        self.lifetime.manually_retried.fetch_add(1, AtomicOrdering::Relaxed);
        match outcome {
            Ok(()) => {
                self.inner.write().records.remove(&task_id);
                self.persistence.on_retried(task_id, record.retry_count + 1);
                Ok(RetryOutcome::Succeeded(task_id))
            }
            Err(message) => {
                let mut inner = self.inner.write();
                let rec = inner
                    .records
                    .get_mut(&task_id)
                    .ok_or(DlqError::NotFound(task_id))?;
                rec.total_attempts += 1;
                rec.last_error = message.clone();
                rec.retry_count += 1;
                if rec.retry_count >= rec.max_retries {
                    rec.queue_status = QueueStatus::Exhausted;
                    rec.next_retry_at = None;
                    drop(inner);
                    self.lifetime.exhausted.fetch_add(1, AtomicOrdering::Relaxed);
                } else {
                    // Restore to pending so the background processor (or a
                    // later manual retry) can claim it again once due.
                    rec.queue_status = QueueStatus::Pending;
                    rec.next_retry_at =
                        next_retry_time(rec.retry_policy, rec.retry_count, Utc::now());
                }
                Ok(RetryOutcome::FailedAgain { task_id, error: message })
            }
        }
    }

    pub fn clear_all(&self) -> usize {
        let mut inner = self.inner.write();
        let count = inner.records.len();
        inner.records.clear();
        count
    }

    /// Record the outcome of one retry attempt against `task_id`,
    /// advancing its schedule or marking it exhausted/completed.
    pub fn record_attempt(
        &self,
        task_id: Identifier,
        outcome: &Result<(), String>,
    ) -> Result<QueueStatus, DlqError> {
        let mut inner = self.inner.write();
        let record = inner
            .records
            .get_mut(&task_id)
            .ok_or(DlqError::NotFound(task_id))?;

        if record.queue_status == QueueStatus::Exhausted
            || record.queue_status == QueueStatus::Archived
        {
            return Err(DlqError::Exhausted(task_id));
        }

        record.total_attempts += 1;
        let exhausted;
        match outcome {
            Ok(()) => {
                record.queue_status = QueueStatus::Completed;
                record.next_retry_at = None;
                exhausted = false;
                self.lifetime.retried_success.fetch_add(1, AtomicOrdering::Relaxed);
            }
            Err(message) => {
                record.last_error = message.clone();
                record.retry_count += 1;
                self.lifetime.retried_failed.fetch_add(1, AtomicOrdering::Relaxed);
                if record.retry_count >= record.max_retries {
                    record.queue_status = QueueStatus::Exhausted;
                    record.next_retry_at = None;
                    exhausted = true;
                } else {
                    // Restore to pending so the next processor tick (or a
                    // manual retry) can claim it again once due.
                    record.queue_status = QueueStatus::Pending;
                    record.next_retry_at =
                        next_retry_time(record.retry_policy, record.retry_count, Utc::now());
                    exhausted = false;
                }
            }
        }
        let status = record.queue_status;
        drop(inner);
        if exhausted {
            self.lifetime.exhausted.fetch_add(1, AtomicOrdering::Relaxed);
        }
        Ok(status)
    }

    /// Point-in-time statistics used by the operator-facing status views.
    pub fn statistics(&self) -> DlqStatistics {
        let inner = self.inner.read();
        let mut status_breakdown: HashMap<QueueStatus, usize> = HashMap::new();
        let mut error_category_breakdown: HashMap<ErrorCategory, usize> = HashMap::new();
        let mut policy_breakdown: HashMap<RetryPolicy, usize> = HashMap::new();

        for record in inner.records.values() {
            *status_breakdown.entry(record.queue_status).or_default() += 1;
            *error_category_breakdown
                .entry(record.error_category)
                .or_default() += 1;
            *policy_breakdown.entry(record.retry_policy).or_default() += 1;
        }

        let size = inner.records.len();
        let utilization_percent = if inner.max_size == 0 {
            0.0
        } else {
            round2(size as f64 / inner.max_size as f64 * 100.0)
        };

        DlqStatistics {
            size,
            max_size: inner.max_size,
            status_breakdown,
            error_category_breakdown,
            policy_breakdown,
            utilization_percent,
            processor_running: self.processor_running.load(AtomicOrdering::Relaxed),
            lifetime_enqueued: self.lifetime.enqueued.load(AtomicOrdering::Relaxed),
            lifetime_retried_success: self.lifetime.retried_success.load(AtomicOrdering::Relaxed),
            lifetime_retried_failed: self.lifetime.retried_failed.load(AtomicOrdering::Relaxed),
            lifetime_exhausted: self.lifetime.exhausted.load(AtomicOrdering::Relaxed),
            lifetime_manually_retried: self.lifetime.manually_retried.load(AtomicOrdering::Relaxed),
            lifetime_archived: self.lifetime.archived.load(AtomicOrdering::Relaxed),
        }
    }

    /// Spawn the background retry loop: wake every `interval`, collect the
    /// records due for retry, release the lock, then dispatch each one to
    /// `executor` outside the lock so a slow or hanging retry can't stall
    /// enqueue/list/statistics callers. One record's dispatch failure never
    /// aborts the loop; it's logged and the loop continues on schedule.
    pub fn start_retry_processor(
        self: &Arc<Self>,
        executor: Arc<dyn RetryExecutor>,
        interval: StdDuration,
    ) {
        if self.processor_running.swap(true, AtomicOrdering::SeqCst) {
            return;
        }
        let queue = Arc::clone(self);
        let running = Arc::clone(&self.processor_running);
        let shutdown = Arc::clone(&self.processor_shutdown);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                // A shutdown request only ever interrupts this wait, never
                // the retry loop below: once the tick fires and there's due
                // work, it runs to completion regardless of `running`.
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.notified() => break,
                }
                if !running.load(AtomicOrdering::SeqCst) {
                    break;
                }
                let due = queue.claim_due(Utc::now());
                if due.is_empty() {
                    continue;
                }
                debug!(count = due.len(), "retrying dead-lettered tasks");
                for record in due {
                    let outcome = executor.retry(&record).await;
                    match queue.record_attempt(record.task_id, &outcome) {
                        Ok(QueueStatus::Completed) => {
                            info!(task_id = %record.task_id, "dead-lettered task retried successfully");
                        }
                        Ok(QueueStatus::Exhausted) => {
                            warn!(task_id = %record.task_id, "dead-lettered task exhausted its retries");
                        }
                        Ok(_) => {
                            queue.persistence.on_retried(record.task_id, record.retry_count + 1);
                        }
                        Err(e) => {
                            error!(task_id = %record.task_id, error = %e, "failed to record retry attempt");
                        }
                    }
                }
            }
        });
        *self.processor_handle.write() = Some(handle);
    }

    /// Stop the background processor. This cancels only the ticker's
    /// sleep: a retry already in flight when this is called is allowed to
    /// finish and record its outcome before the handle resolves, so a
    /// slow `executor.retry` never gets its result discarded mid-flight.
    pub async fn stop_retry_processor(&self) {
        self.processor_running.store(false, AtomicOrdering::SeqCst);
        self.processor_shutdown.notify_one();
        let handle = self.processor_handle.write().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

impl Drop for DeadLetterQueue {
    fn drop(&mut self) {
        // The background task holds its own `Arc` clone of `self`, so this
        // only runs once that task has already exited on its own; abort is
        // just a non-blocking way to drop a handle that has already
        // finished (Drop can't await it).
        self.processor_running.store(false, AtomicOrdering::SeqCst);
        if let Some(handle) = self.processor_handle.write().take() {
            handle.abort();
        }
    }
}

/// Snapshot of dead-letter queue health for operator-facing status views.
#[derive(Debug, Clone)]
pub struct DlqStatistics {
    pub size: usize,
    pub max_size: usize,
    pub status_breakdown: HashMap<QueueStatus, usize>,
    pub error_category_breakdown: HashMap<ErrorCategory, usize>,
    pub policy_breakdown: HashMap<RetryPolicy, usize>,
    pub utilization_percent: f64,
    pub processor_running: bool,
    pub lifetime_enqueued: u64,
    pub lifetime_retried_success: u64,
    pub lifetime_retried_failed: u64,
    pub lifetime_exhausted: u64,
    pub lifetime_manually_retried: u64,
    pub lifetime_archived: u64,
}

fn next_retry_time(policy: RetryPolicy, attempt: u32, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match policy {
        RetryPolicy::Never => None,
        RetryPolicy::Immediate => Some(from),
        RetryPolicy::Linear => Some(from + Duration::minutes(5 * (attempt as i64 + 1))),
        RetryPolicy::Exponential => {
            let minutes = 2i64.saturating_pow(attempt).min(60);
            Some(from + Duration::minutes(minutes))
        }
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn id() -> Identifier {
        Identifier::generate(None).unwrap()
    }

    #[test]
    fn enqueue_rejects_past_capacity() {
        let queue = DeadLetterQueue::new(1);
        queue
            .enqueue(
                id(),
                serde_json::json!({}),
                vec![],
                "boom",
                ErrorCategory::Transient,
                RetryPolicy::Exponential,
                3,
            )
            .unwrap();
        let result = queue.enqueue(
            id(),
            serde_json::json!({}),
            vec![],
            "boom again",
            ErrorCategory::Transient,
            RetryPolicy::Exponential,
            3,
        );
        assert!(matches!(result, Err(DlqError::CapacityExceeded { .. })));
    }

    #[test]
    fn never_policy_is_enqueued_already_exhausted() {
        let queue = DeadLetterQueue::new(10);
        let task_id = id();
        queue
            .enqueue(
                task_id,
                serde_json::json!({}),
                vec![],
                "permanent failure",
                ErrorCategory::Permanent,
                RetryPolicy::Never,
                0,
            )
            .unwrap();
        let record = queue.get(task_id).unwrap();
        assert_eq!(record.queue_status, QueueStatus::Exhausted);
    }

    #[test]
    fn successful_retry_marks_completed() {
        let queue = DeadLetterQueue::new(10);
        let task_id = id();
        queue
            .enqueue(
                task_id,
                serde_json::json!({}),
                vec![],
                "boom",
                ErrorCategory::Transient,
                RetryPolicy::Exponential,
                3,
            )
            .unwrap();
        let status = queue.record_attempt(task_id, &Ok(())).unwrap();
        assert_eq!(status, QueueStatus::Completed);
    }

    #[test]
    fn exhausting_retries_sets_exhausted_status() {
        let queue = DeadLetterQueue::new(10);
        let task_id = id();
        queue
            .enqueue(
                task_id,
                serde_json::json!({}),
                vec![],
                "boom",
                ErrorCategory::Transient,
                RetryPolicy::Linear,
                2,
            )
            .unwrap();
        queue
            .record_attempt(task_id, &Err("still broken".to_string()))
            .unwrap();
        let status = queue
            .record_attempt(task_id, &Err("still broken".to_string()))
            .unwrap();
        assert_eq!(status, QueueStatus::Exhausted);
        assert!(matches!(
            queue.record_attempt(task_id, &Err("again".to_string())),
            Err(DlqError::Exhausted(_))
        ));
    }

    #[test]
    fn exponential_backoff_caps_at_sixty_minutes() {
        let now = Utc::now();
        let schedule = next_retry_time(RetryPolicy::Exponential, 10, now).unwrap();
        let delta = (schedule - now).num_minutes();
        assert_eq!(delta, 60);
    }

    #[test]
    fn linear_backoff_grows_by_five_minutes_per_attempt() {
        let now = Utc::now();
        let first = next_retry_time(RetryPolicy::Linear, 0, now).unwrap();
        let second = next_retry_time(RetryPolicy::Linear, 1, now).unwrap();
        assert_eq!((first - now).num_minutes(), 5);
        assert_eq!((second - now).num_minutes(), 10);
    }

    #[test]
    fn statistics_report_utilization_and_breakdowns() {
        let queue = DeadLetterQueue::new(4);
        queue
            .enqueue(
                id(),
                serde_json::json!({}),
                vec![],
                "boom",
                ErrorCategory::Network,
                RetryPolicy::Exponential,
                3,
            )
            .unwrap();
        let stats = queue.statistics();
        assert_eq!(stats.size, 1);
        assert_eq!(stats.utilization_percent, 25.0);
        assert_eq!(stats.error_category_breakdown[&ErrorCategory::Network], 1);
    }

    struct CountingExecutor {
        attempts: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl RetryExecutor for CountingExecutor {
        async fn retry(&self, _task: &FailedTask) -> Result<(), String> {
            self.attempts.fetch_add(1, AtomicOrdering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retry_processor_resubmits_due_tasks_and_can_be_stopped() {
        let queue = Arc::new(DeadLetterQueue::new(10));
        let task_id = id();
        queue
            .enqueue(
                task_id,
                serde_json::json!({}),
                vec![],
                "boom",
                ErrorCategory::Transient,
                RetryPolicy::Immediate,
                3,
            )
            .unwrap();

        let attempts = Arc::new(AtomicUsize::new(0));
        let executor = Arc::new(CountingExecutor {
            attempts: Arc::clone(&attempts),
        });
        queue.start_retry_processor(executor, StdDuration::from_millis(10));

        tokio::time::advance(StdDuration::from_millis(15)).await;
        tokio::task::yield_now().await;

        assert_eq!(attempts.load(AtomicOrdering::SeqCst), 1);
        assert_eq!(queue.get(task_id).unwrap().queue_status, QueueStatus::Completed);

        queue.stop_retry_processor().await;
    }

    struct SlowExecutor {
        started: Arc<AtomicUsize>,
        finished: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl RetryExecutor for SlowExecutor {
        async fn retry(&self, _task: &FailedTask) -> Result<(), String> {
            self.started.fetch_add(1, AtomicOrdering::SeqCst);
            tokio::time::sleep(StdDuration::from_millis(30)).await;
            self.finished.fetch_add(1, AtomicOrdering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn stop_retry_processor_waits_for_an_in_flight_retry_to_finish() {
        let queue = Arc::new(DeadLetterQueue::new(10));
        let task_id = id();
        queue
            .enqueue(
                task_id,
                serde_json::json!({}),
                vec![],
                "boom",
                ErrorCategory::Transient,
                RetryPolicy::Immediate,
                3,
            )
            .unwrap();

        let started = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicUsize::new(0));
        let executor = Arc::new(SlowExecutor {
            started: Arc::clone(&started),
            finished: Arc::clone(&finished),
        });
        queue.start_retry_processor(executor, StdDuration::from_millis(5));

        // Real-time wait (this test doesn't pause the clock) until the
        // background processor has entered the slow retry call.
        for _ in 0..200 {
            if started.load(AtomicOrdering::SeqCst) > 0 {
                break;
            }
            tokio::time::sleep(StdDuration::from_millis(2)).await;
        }
        assert_eq!(started.load(AtomicOrdering::SeqCst), 1);

        // Stop while the retry is still sleeping: a naive `abort()` would
        // cancel it here, before `finished` is ever incremented.
        queue.stop_retry_processor().await;

        assert_eq!(finished.load(AtomicOrdering::SeqCst), 1);
    }

    struct FailingExecutor;
    #[async_trait::async_trait]
    impl RetryExecutor for FailingExecutor {
        async fn retry(&self, _task: &FailedTask) -> Result<(), String> {
            Err("nope".to_string())
        }
    }

    #[tokio::test]
    async fn manual_retry_drops_record_on_success_and_counts_it() {
        let queue = DeadLetterQueue::new(4);
        let task_id = id();
        queue
            .enqueue(task_id, serde_json::json!({}), vec![], "boom", ErrorCategory::Transient, RetryPolicy::Linear, 3)
            .unwrap();

        let executor = Arc::new(CountingExecutor {
            attempts: Arc::new(AtomicUsize::new(0)),
        });
        let outcome = queue.retry(task_id, executor).await.unwrap();
        assert!(matches!(outcome, RetryOutcome::Succeeded(_)));
        assert!(queue.get(task_id).is_none());
        assert_eq!(queue.statistics().lifetime_manually_retried, 1);
    }

    #[tokio::test]
    async fn manual_retry_advances_retry_count_on_failure() {
        let queue = DeadLetterQueue::new(4);
        let task_id = id();
        queue
            .enqueue(task_id, serde_json::json!({}), vec![], "boom", ErrorCategory::Transient, RetryPolicy::Linear, 3)
            .unwrap();

        let outcome = queue.retry(task_id, Arc::new(FailingExecutor)).await.unwrap();
        assert!(matches!(outcome, RetryOutcome::FailedAgain { .. }));
        let record = queue.get(task_id).unwrap();
        assert_eq!(record.retry_count, 1);
        assert_eq!(record.queue_status, QueueStatus::Pending);
    }

    #[tokio::test]
    async fn a_record_already_being_retried_cannot_be_dispatched_again() {
        let queue = Arc::new(DeadLetterQueue::new(4));
        let task_id = id();
        queue
            .enqueue(task_id, serde_json::json!({}), vec![], "boom", ErrorCategory::Transient, RetryPolicy::Immediate, 3)
            .unwrap();

        // Claim it the way the background processor would, without yet
        // recording an outcome — the record is now `retrying`.
        let claimed = queue.claim_due(Utc::now());
        assert_eq!(claimed.len(), 1);
        assert_eq!(queue.get(task_id).unwrap().queue_status, QueueStatus::Retrying);

        let err = queue
            .retry(task_id, Arc::new(FailingExecutor))
            .await
            .unwrap_err();
        assert!(matches!(err, DlqError::AlreadyRetrying(_)));

        // A second claim pass must not pick it up again either.
        assert!(queue.claim_due(Utc::now()).is_empty());
    }

    #[test]
    fn lifetime_counters_track_enqueue_and_archive() {
        let queue = DeadLetterQueue::new(4);
        let task_id = id();
        queue
            .enqueue(task_id, serde_json::json!({}), vec![], "boom", ErrorCategory::Transient, RetryPolicy::Never, 3)
            .unwrap();
        queue.archive(task_id).unwrap();
        let stats = queue.statistics();
        assert_eq!(stats.lifetime_enqueued, 1);
        assert_eq!(stats.lifetime_archived, 1);
        assert!(!stats.processor_running);
    }
}
