//! `mahavishnu plan validate` and `mahavishnu plan run`: load a scenario
//! file, wire it into a [`DependencyManager`] / [`PoolRegistry`] /
//! [`TaskOrderingEngine`] triple exactly as the gateway would, and either
//! report on it or drive a local simulated execution to completion.

use std::collections::{HashMap, HashSet};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Duration, Utc};
use mahavishnu_core::ordering::{OrderingResult, TaskOrderingEngine, TaskView};
use mahavishnu_core::types::{DependencyType, OrderingStrategy, Priority, TaskStatus};
use mahavishnu_core::{DependencyManager, Identifier, PoolRegistry};

use crate::scenario::{ScenarioToml, TaskToml};

/// A scenario wired up into live control-plane objects, with the
/// name <-> identifier mapping needed to report on it in human terms.
pub struct ResolvedScenario {
    pub manager: DependencyManager,
    pub registry: PoolRegistry,
    pub strategy: OrderingStrategy,
    pub id_by_name: HashMap<String, Identifier>,
    pub name_by_id: HashMap<Identifier, String>,
    pub pool_by_task: HashMap<Identifier, String>,
    pub workers_by_pool: HashMap<String, Vec<String>>,
    pub views: Vec<TaskView>,
}

/// Load, parse, and wire a scenario file at `path` into runtime objects.
pub fn load_and_resolve(path: &std::path::Path, now: DateTime<Utc>) -> Result<ResolvedScenario> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read scenario file at {}", path.display()))?;
    let scenario = crate::scenario::parse_scenario_toml(&content)
        .with_context(|| format!("scenario file {} is invalid", path.display()))?;
    resolve(&scenario, now)
}

pub fn resolve(scenario: &ScenarioToml, now: DateTime<Utc>) -> Result<ResolvedScenario> {
    let manager = DependencyManager::new();
    let registry = PoolRegistry::new();
    let mut workers_by_pool = HashMap::new();

    for pool in &scenario.pools {
        registry
            .register_pool(pool.id.clone(), pool.pool_type.clone(), pool.min_workers, pool.max_workers)
            .with_context(|| format!("registering pool {}", pool.id))?;
        for worker in &pool.workers {
            registry
                .add_worker(&pool.id, worker.clone())
                .with_context(|| format!("adding worker {worker} to pool {}", pool.id))?;
        }
        workers_by_pool.insert(pool.id.clone(), pool.workers.clone());
    }

    let mut id_by_name = HashMap::new();
    let mut name_by_id = HashMap::new();
    for task in &scenario.tasks {
        let id = Identifier::generate(None).context("generating task identifier")?;
        manager.add_task(id);
        id_by_name.insert(task.name.clone(), id);
        name_by_id.insert(id, task.name.clone());
    }

    let mut pool_by_task = HashMap::new();
    let mut views = Vec::with_capacity(scenario.tasks.len());
    for task in &scenario.tasks {
        let id = id_by_name[&task.name];
        if let Some(pool) = &task.pool {
            pool_by_task.insert(id, pool.clone());
        }
        for dep in &task.depends_on {
            let dep_id = id_by_name[dep];
            let edge_type: DependencyType = task.dependency_type.parse().expect("validated");
            manager
                .add_dependency(dep_id, id, edge_type, mahavishnu_core::types::Metadata::new())
                .with_context(|| format!("adding dependency {dep} -> {}", task.name))?;
        }
        views.push(task_view(task, id, now));
    }

    let strategy: OrderingStrategy = scenario.scenario.strategy.parse().with_context(|| {
        format!(
            "scenario strategy {:?} is not a recognized ordering strategy",
            scenario.scenario.strategy
        )
    })?;

    Ok(ResolvedScenario {
        manager,
        registry,
        strategy,
        id_by_name,
        name_by_id,
        pool_by_task,
        workers_by_pool,
        views,
    })
}

fn task_view(task: &TaskToml, id: Identifier, now: DateTime<Utc>) -> TaskView {
    TaskView {
        id,
        priority: task.priority.parse::<Priority>().expect("validated"),
        deadline: task.deadline_in_days.map(|days| now + Duration::days(days)),
        estimated_duration_secs: task.estimated_duration_secs,
        blocker_probability: task.blocker_probability,
    }
}

/// A human-readable validation report: topological order, pool summary,
/// and the initial ordering recommendation.
pub fn validate_report(resolved: &ResolvedScenario, now: DateTime<Utc>) -> Result<String> {
    let mut out = String::new();
    let topo = resolved
        .manager
        .topological_order()
        .context("scenario's runtime dependency graph contains a cycle")?;

    out.push_str(&format!(
        "{} tasks, {} pools\n",
        resolved.name_by_id.len(),
        resolved.registry.list_pools().len()
    ));
    out.push_str("topological order:\n");
    for id in &topo {
        out.push_str(&format!("  - {}\n", resolved.name_by_id[id]));
    }

    for pool in resolved.registry.list_pools() {
        out.push_str(&format!(
            "pool {}: {} workers ({}..{}), state={}\n",
            pool.pool_id, pool.worker_count, pool.min_workers, pool.max_workers, pool.state
        ));
    }

    let engine = TaskOrderingEngine::default();
    let ordering = engine.order_tasks(&resolved.views, resolved.manager.graph(), resolved.strategy, now);
    out.push_str(&format!(
        "ready now: {}, blocked: {}, estimated completion: {:.1}s\n",
        ordering.ready_count, ordering.blocked_count, ordering.estimated_completion_secs
    ));
    if !ordering.critical_path.is_empty() {
        let names: Vec<_> = ordering
            .critical_path
            .iter()
            .map(|id| resolved.name_by_id[id].as_str())
            .collect();
        out.push_str(&format!("critical path: {}\n", names.join(" -> ")));
    }

    Ok(out)
}

/// One step of the simulated run: a task completed, in what order, and
/// on which worker (if any).
#[derive(Debug, Clone)]
pub struct RunStep {
    pub task_name: String,
    pub worker: Option<(String, String)>,
}

/// The full trace of a simulated run plus the ordering snapshot taken
/// before the first task started.
pub struct RunReport {
    pub steps: Vec<RunStep>,
    pub initial_ordering: OrderingResult,
}

/// Drive the scenario to completion locally: repeatedly pick the
/// highest-ranked ready task, assign it to a free worker in its pool (if
/// any), and mark it complete, until nothing remains ready.
pub fn run(resolved: &ResolvedScenario, now: DateTime<Utc>) -> Result<RunReport> {
    let engine = TaskOrderingEngine::default();
    let initial_ordering = engine.order_tasks(&resolved.views, resolved.manager.graph(), resolved.strategy, now);

    let views_by_id: HashMap<Identifier, &TaskView> = resolved.views.iter().map(|v| (v.id, v)).collect();
    let mut busy: HashSet<(String, String)> = HashSet::new();

    let mut steps = Vec::new();
    let total = resolved.name_by_id.len();
    let mut guard = 0usize;

    loop {
        let ready = resolved.manager.get_ready_tasks();
        if ready.is_empty() {
            break;
        }
        guard += 1;
        if guard > total + 1 {
            bail!("simulated run made no progress; scenario may have an undetected deadlock");
        }

        let ready_views: Vec<TaskView> = ready
            .iter()
            .filter_map(|id| views_by_id.get(id).cloned().cloned())
            .collect();
        let ordering = engine.order_tasks(&ready_views, resolved.manager.graph(), resolved.strategy, now);
        let next = ordering
            .recommendations
            .first()
            .context("ordering produced no recommendation for a ready task")?
            .task_id;

        resolved.manager.update_task_status(next, TaskStatus::InProgress)?;

        let worker = assign_free_worker(resolved, next, &mut busy)?;

        resolved.manager.update_task_status(next, TaskStatus::Completed)?;
        if let Some((pool_id, worker_id)) = &worker {
            resolved.registry.complete_task(pool_id, worker_id, 0.0)?;
            busy.remove(&(pool_id.clone(), worker_id.clone()));
        }

        steps.push(RunStep {
            task_name: resolved.name_by_id[&next].clone(),
            worker,
        });
    }

    if steps.len() != total {
        bail!(
            "simulated run completed {} of {total} tasks; the rest stayed blocked",
            steps.len()
        );
    }

    Ok(RunReport { steps, initial_ordering })
}

fn assign_free_worker(
    resolved: &ResolvedScenario,
    task_id: Identifier,
    busy: &mut HashSet<(String, String)>,
) -> Result<Option<(String, String)>> {
    let Some(pool_id) = resolved.pool_by_task.get(&task_id) else {
        return Ok(None);
    };
    let Some(worker_ids) = resolved.workers_by_pool.get(pool_id) else {
        return Ok(None);
    };
    let free = worker_ids
        .iter()
        .find(|w| !busy.contains(&(pool_id.clone(), (*w).clone())));
    let Some(worker_id) = free else {
        return Ok(None);
    };
    resolved.registry.assign_task(pool_id, worker_id, task_id)?;
    busy.insert((pool_id.clone(), worker_id.clone()));
    Ok(Some((pool_id.clone(), worker_id.clone())))
}
