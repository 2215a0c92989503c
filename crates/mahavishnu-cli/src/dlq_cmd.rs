//! `mahavishnu dlq simulate`: replay a scripted sequence of task failures
//! through a real [`DeadLetterQueue`], manually retrying each one until it
//! either completes or exhausts, and report the resulting statistics.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use mahavishnu_core::dlq::{DlqStatistics, RetryExecutor, RetryOutcome};
use mahavishnu_core::types::{ErrorCategory, FailedTask};
use mahavishnu_core::{DeadLetterQueue, Identifier};
use serde::Deserialize;

/// Top-level structure of a `dlq-scenario.toml` file.
#[derive(Debug, Deserialize)]
pub struct DlqScenarioToml {
    #[serde(default = "default_max_size")]
    pub max_size: usize,
    #[serde(default)]
    pub failures: Vec<FailureToml>,
}

fn default_max_size() -> usize {
    1_000
}

#[derive(Debug, Deserialize)]
pub struct FailureToml {
    pub task: String,
    pub error: String,
    #[serde(default = "default_error_category")]
    pub error_category: String,
    #[serde(default = "default_retry_policy")]
    pub retry_policy: String,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// The 1-based attempt number on which the scripted executor starts
    /// succeeding. `0` means it never succeeds.
    #[serde(default)]
    pub succeeds_on_attempt: u32,
}

fn default_error_category() -> String {
    "transient".to_string()
}

fn default_retry_policy() -> String {
    "exponential".to_string()
}

fn default_max_retries() -> u32 {
    3
}

/// Replays every configured retry attempt immediately rather than on a
/// delay; suitable for a one-shot CLI simulation rather than the
/// background processor's real schedule.
struct ScriptedExecutor {
    attempts: AtomicU32,
    succeeds_on_attempt: u32,
}

#[async_trait::async_trait]
impl RetryExecutor for ScriptedExecutor {
    async fn retry(&self, _task: &FailedTask) -> Result<(), String> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if self.succeeds_on_attempt != 0 && attempt >= self.succeeds_on_attempt {
            Ok(())
        } else {
            Err(format!("attempt {attempt} still failing"))
        }
    }
}

pub fn parse_dlq_scenario(content: &str) -> Result<DlqScenarioToml> {
    toml::from_str(content).context("invalid dlq scenario file")
}

/// Per-task outcome after the simulation converges.
#[derive(Debug)]
pub struct SimulatedOutcome {
    pub task: String,
    pub final_status: mahavishnu_core::types::QueueStatus,
    pub attempts: u32,
}

/// Enqueue every configured failure and manually retry each one (bounded
/// by its own `max_retries`) until it completes or is exhausted.
pub async fn simulate(scenario: &DlqScenarioToml) -> Result<(Vec<SimulatedOutcome>, DlqStatistics)> {
    let queue = Arc::new(DeadLetterQueue::new(scenario.max_size));
    let mut task_ids: HashMap<Identifier, String> = HashMap::new();

    for failure in &scenario.failures {
        let error_category: ErrorCategory = failure
            .error_category
            .parse()
            .with_context(|| format!("invalid error_category on task {}", failure.task))?;
        let retry_policy: mahavishnu_core::types::RetryPolicy = failure
            .retry_policy
            .parse()
            .with_context(|| format!("invalid retry_policy on task {}", failure.task))?;

        let id = Identifier::generate(None).context("generating task identifier")?;
        queue
            .enqueue(
                id,
                serde_json::json!({ "task": failure.task }),
                vec![],
                failure.error.clone(),
                error_category,
                retry_policy,
                failure.max_retries,
            )
            .with_context(|| format!("enqueueing {}", failure.task))?;
        task_ids.insert(id, failure.task.clone());
    }

    let mut outcomes = Vec::new();
    for failure in &scenario.failures {
        let id = *task_ids
            .iter()
            .find(|(_, name)| *name == &failure.task)
            .map(|(id, _)| id)
            .expect("just inserted");

        let executor = Arc::new(ScriptedExecutor {
            attempts: AtomicU32::new(0),
            succeeds_on_attempt: failure.succeeds_on_attempt,
        });

        loop {
            let Some(record) = queue.get(id) else { break };
            if record.queue_status == mahavishnu_core::types::QueueStatus::Completed
                || record.queue_status == mahavishnu_core::types::QueueStatus::Exhausted
            {
                break;
            }
            match queue.retry(id, Arc::clone(&executor) as Arc<dyn RetryExecutor>).await? {
                RetryOutcome::Succeeded(_) => break,
                RetryOutcome::FailedAgain { .. } => continue,
                RetryOutcome::Resubmitted(_) => continue,
            }
        }

        let attempts = executor.attempts.load(Ordering::SeqCst);
        let final_status = queue
            .get(id)
            .map(|r| r.queue_status)
            .unwrap_or(mahavishnu_core::types::QueueStatus::Completed);
        outcomes.push(SimulatedOutcome {
            task: failure.task.clone(),
            final_status,
            attempts,
        });
    }

    let stats = queue.statistics();
    Ok((outcomes, stats))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn task_that_eventually_succeeds_completes_and_drops() {
        let scenario = parse_dlq_scenario(
            r#"
[[failures]]
task = "flaky-download"
error = "connection reset"
error_category = "network"
retry_policy = "immediate"
max_retries = 5
succeeds_on_attempt = 3
"#,
        )
        .unwrap();
        let (outcomes, stats) = simulate(&scenario).await.unwrap();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].attempts, 3);
        assert_eq!(stats.lifetime_manually_retried, 3);
        assert_eq!(stats.size, 0);
    }

    #[tokio::test]
    async fn task_that_never_succeeds_exhausts() {
        let scenario = parse_dlq_scenario(
            r#"
[[failures]]
task = "always-broken"
error = "permanent failure"
retry_policy = "immediate"
max_retries = 2
succeeds_on_attempt = 0
"#,
        )
        .unwrap();
        let (outcomes, stats) = simulate(&scenario).await.unwrap();
        assert_eq!(outcomes[0].final_status, mahavishnu_core::types::QueueStatus::Exhausted);
        assert_eq!(stats.lifetime_exhausted, 1);
    }
}
