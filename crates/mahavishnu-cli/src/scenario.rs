//! TOML format for describing a local demonstration run: a set of tasks
//! with dependencies and pools with workers, parsed and validated before
//! being handed to the dependency manager, pool registry, and ordering
//! engine.
//!
//! These types map directly to the on-disk `scenario.toml` format and are
//! deserialized via `serde` + the `toml` crate, the same way the control
//! plane's own config tables are.

use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Top-level structure of a `scenario.toml` file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScenarioToml {
    pub scenario: ScenarioMeta,
    #[serde(default)]
    pub pools: Vec<PoolToml>,
    #[serde(default)]
    pub tasks: Vec<TaskToml>,
}

/// Scenario-level metadata in `[scenario]`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScenarioMeta {
    pub name: String,
    /// One of the `ordering_strategy` wire names: `deadline_first`,
    /// `priority_first`, `dependency_aware`, `blocker_aware`, `balanced`.
    #[serde(default = "default_strategy")]
    pub strategy: String,
}

fn default_strategy() -> String {
    "balanced".to_string()
}

/// A single `[[pools]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PoolToml {
    pub id: String,
    #[serde(default = "default_pool_type")]
    pub pool_type: String,
    #[serde(default = "default_min_workers")]
    pub min_workers: u32,
    pub max_workers: u32,
    /// Worker ids to pre-populate the pool with.
    #[serde(default)]
    pub workers: Vec<String>,
}

fn default_pool_type() -> String {
    "agent".to_string()
}

fn default_min_workers() -> u32 {
    1
}

/// A single `[[tasks]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskToml {
    /// Unique task name within the scenario, used as an identifier in
    /// `depends_on` and in output.
    pub name: String,
    #[serde(default = "default_priority")]
    pub priority: String,
    /// Names of tasks this task depends on (must complete first).
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Edge kind for every entry in `depends_on`: `blocks`, `requires`,
    /// `related`, or `subtask`. Defaults to `blocks`.
    #[serde(default = "default_dependency_type")]
    pub dependency_type: String,
    /// Pool this task is assigned to when the scenario is run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_duration_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline_in_days: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocker_probability: Option<f64>,
}

fn default_priority() -> String {
    "medium".to_string()
}

fn default_dependency_type() -> String {
    "blocks".to_string()
}

/// Errors raised while parsing and validating a scenario file.
#[derive(Debug, Error)]
pub enum ScenarioParseError {
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("duplicate task name: {0:?}")]
    DuplicateTaskName(String),

    #[error("duplicate pool id: {0:?}")]
    DuplicatePoolId(String),

    #[error("task {task:?} depends on unknown task {dependency:?}")]
    UnknownDependency { task: String, dependency: String },

    #[error("task {task:?} is assigned to unknown pool {pool:?}")]
    UnknownPool { task: String, pool: String },

    #[error("invalid priority {value:?} on task {task:?}")]
    InvalidPriority { task: String, value: String },

    #[error("invalid dependency_type {value:?} on task {task:?}")]
    InvalidDependencyType { task: String, value: String },

    #[error("pool {pool:?} has min_workers ({min}) greater than max_workers ({max})")]
    InvalidPoolBounds { pool: String, min: u32, max: u32 },

    #[error("dependency cycle detected involving tasks: {0}")]
    CycleDetected(String),

    #[error("scenario must contain at least one task")]
    NoTasks,
}

/// Parse and validate a `scenario.toml` string.
pub fn parse_scenario_toml(content: &str) -> Result<ScenarioToml, ScenarioParseError> {
    let scenario: ScenarioToml = toml::from_str(content)?;
    validate(&scenario)?;
    Ok(scenario)
}

fn validate(scenario: &ScenarioToml) -> Result<(), ScenarioParseError> {
    if scenario.tasks.is_empty() {
        return Err(ScenarioParseError::NoTasks);
    }

    let mut pool_ids = HashSet::new();
    for pool in &scenario.pools {
        if !pool_ids.insert(pool.id.as_str()) {
            return Err(ScenarioParseError::DuplicatePoolId(pool.id.clone()));
        }
        if pool.min_workers > pool.max_workers {
            return Err(ScenarioParseError::InvalidPoolBounds {
                pool: pool.id.clone(),
                min: pool.min_workers,
                max: pool.max_workers,
            });
        }
    }

    let mut task_names = HashSet::new();
    for task in &scenario.tasks {
        if !task_names.insert(task.name.as_str()) {
            return Err(ScenarioParseError::DuplicateTaskName(task.name.clone()));
        }
    }

    for task in &scenario.tasks {
        if task.priority.parse::<mahavishnu_core::Priority>().is_err() {
            return Err(ScenarioParseError::InvalidPriority {
                task: task.name.clone(),
                value: task.priority.clone(),
            });
        }
        if task
            .dependency_type
            .parse::<mahavishnu_core::DependencyType>()
            .is_err()
        {
            return Err(ScenarioParseError::InvalidDependencyType {
                task: task.name.clone(),
                value: task.dependency_type.clone(),
            });
        }
        if let Some(pool) = &task.pool {
            if !pool_ids.contains(pool.as_str()) {
                return Err(ScenarioParseError::UnknownPool {
                    task: task.name.clone(),
                    pool: pool.clone(),
                });
            }
        }
        for dep in &task.depends_on {
            if !task_names.contains(dep.as_str()) {
                return Err(ScenarioParseError::UnknownDependency {
                    task: task.name.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }

    check_for_cycles(scenario)?;
    Ok(())
}

/// Detect dependency cycles among `blocks`/`requires` edges using Kahn's
/// algorithm, mirroring the runtime dependency graph's own restriction to
/// blocking-kind edges.
fn check_for_cycles(scenario: &ScenarioToml) -> Result<(), ScenarioParseError> {
    let names: Vec<&str> = scenario.tasks.iter().map(|t| t.name.as_str()).collect();
    let index: HashMap<&str, usize> = names.iter().enumerate().map(|(i, n)| (*n, i)).collect();

    let n = names.len();
    let mut in_degree = vec![0usize; n];
    let mut adj: Vec<Vec<usize>> = vec![vec![]; n];

    for task in &scenario.tasks {
        let is_blocking = matches!(task.dependency_type.as_str(), "blocks" | "requires");
        if !is_blocking {
            continue;
        }
        let to = index[task.name.as_str()];
        for dep in &task.depends_on {
            let from = index[dep.as_str()];
            adj[from].push(to);
            in_degree[to] += 1;
        }
    }

    let mut queue: VecDeque<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
    let mut sorted_count = 0;
    while let Some(node) = queue.pop_front() {
        sorted_count += 1;
        for &next in &adj[node] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                queue.push_back(next);
            }
        }
    }

    if sorted_count != n {
        let cycle_tasks: Vec<&str> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, deg)| **deg > 0)
            .map(|(i, _)| names[i])
            .collect();
        return Err(ScenarioParseError::CycleDetected(cycle_tasks.join(", ")));
    }
    Ok(())
}
