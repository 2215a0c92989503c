//! The task ordering engine: scores and ranks a collection of tasks under
//! a selectable strategy, using the dependency graph plus optional
//! external predictions (blocker probability, estimated duration).

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::graph::DependencyGraph;
use crate::identifier::Identifier;
use crate::types::{OrderingStrategy, Priority, Urgency};

/// Per-factor base weights before a strategy's multipliers are applied.
/// Sum to 1.0; mirrors the original ordering engine's defaults.
#[derive(Debug, Clone, Copy)]
pub struct FactorWeights {
    pub deadline: f64,
    pub priority: f64,
    pub dependencies: f64,
    pub blocker: f64,
    pub duration: f64,
}

impl Default for FactorWeights {
    fn default() -> Self {
        Self {
            deadline: 0.25,
            priority: 0.25,
            dependencies: 0.20,
            blocker: 0.15,
            duration: 0.15,
        }
    }
}

/// Tunable deadline thresholds (also exposed as config keys
/// `ordering.urgent_deadline_days` / `ordering.approaching_deadline_days`).
#[derive(Debug, Clone, Copy)]
pub struct OrderingThresholds {
    pub urgent_deadline_days: i64,
    pub approaching_deadline_days: i64,
    pub parallelism_factor: f64,
}

impl Default for OrderingThresholds {
    fn default() -> Self {
        Self {
            urgent_deadline_days: 3,
            approaching_deadline_days: 7,
            parallelism_factor: 0.6,
        }
    }
}

/// One task's inputs to the scoring pipeline.
#[derive(Debug, Clone)]
pub struct TaskView {
    pub id: Identifier,
    pub priority: Priority,
    pub deadline: Option<DateTime<Utc>>,
    pub estimated_duration_secs: Option<u64>,
    pub blocker_probability: Option<f64>,
}

/// A single task's place in the produced ordering.
#[derive(Debug, Clone)]
pub struct Recommendation {
    pub task_id: Identifier,
    pub position: usize,
    pub score: f64,
    pub factors: HashMap<&'static str, f64>,
    pub rationale: String,
    pub blocking_task_ids: Vec<Identifier>,
    pub urgency: Urgency,
    pub should_start_now: bool,
}

/// The full result of one ordering pass.
#[derive(Debug, Clone)]
pub struct OrderingResult {
    pub recommendations: Vec<Recommendation>,
    pub critical_path: Vec<Identifier>,
    pub blocked_count: usize,
    pub ready_count: usize,
    pub estimated_completion_secs: f64,
}

/// Scores and ranks tasks. Stateless apart from the weight/threshold
/// configuration; the dependency graph and per-task views are passed in
/// on every call.
pub struct TaskOrderingEngine {
    pub weights: FactorWeights,
    pub thresholds: OrderingThresholds,
}

impl Default for TaskOrderingEngine {
    fn default() -> Self {
        Self {
            weights: FactorWeights::default(),
            thresholds: OrderingThresholds::default(),
        }
    }
}

impl TaskOrderingEngine {
    pub fn new(weights: FactorWeights, thresholds: OrderingThresholds) -> Self {
        Self { weights, thresholds }
    }

    pub fn order_tasks(
        &self,
        tasks: &[TaskView],
        graph: &DependencyGraph,
        strategy: OrderingStrategy,
        now: DateTime<Utc>,
    ) -> OrderingResult {
        let strategy_weights = self.apply_strategy(strategy);

        let mut scored: HashMap<Identifier, (f64, HashMap<&'static str, f64>)> = HashMap::new();
        for task in tasks {
            let factors = self.factor_scores(task, graph, now);
            let mut weighted_sum = 0.0;
            let mut weight_total = 0.0;
            for (name, value) in &factors {
                let weight = strategy_weights.weight_for(name);
                weighted_sum += weight * value;
                weight_total += weight;
            }
            let score = if weight_total > 0.0 {
                weighted_sum / weight_total
            } else {
                0.0
            };
            scored.insert(task.id, (score, factors));
        }

        let ordered_ids = match strategy {
            OrderingStrategy::DependencyAware => self.dependency_aware_order(tasks, graph, &scored),
            _ => {
                let mut ids: Vec<Identifier> = tasks.iter().map(|t| t.id).collect();
                ids.sort_by(|a, b| {
                    scored[b]
                        .0
                        .partial_cmp(&scored[a].0)
                        .unwrap_or(std::cmp::Ordering::Equal)
                });
                ids
            }
        };

        let mut recommendations = Vec::with_capacity(ordered_ids.len());
        for (position, task_id) in ordered_ids.iter().enumerate() {
            let task = tasks.iter().find(|t| t.id == *task_id).expect("ordered id came from tasks");
            let (score, factors) = scored.remove(task_id).unwrap_or((0.0, HashMap::new()));
            let blocking = graph.blocking_tasks(*task_id);
            let urgency = self.urgency_for(task, score, now);
            let should_start_now =
                !graph.is_blocked(*task_id) && position < 3 && urgency.at_least_urgent();

            recommendations.push(Recommendation {
                task_id: *task_id,
                position,
                score,
                rationale: rationale_for(task, &factors, urgency),
                factors,
                blocking_task_ids: blocking,
                urgency,
                should_start_now,
            });
        }

        let blocked_count = tasks.iter().filter(|t| graph.is_blocked(t.id)).count();
        let ready_count = tasks.len() - blocked_count;
        let critical_path = self.critical_path(tasks, graph);
        let estimated_completion_secs = tasks
            .iter()
            .filter_map(|t| t.estimated_duration_secs)
            .sum::<u64>() as f64
            * self.thresholds.parallelism_factor;

        OrderingResult {
            recommendations,
            critical_path,
            blocked_count,
            ready_count,
            estimated_completion_secs,
        }
    }

    fn factor_scores(
        &self,
        task: &TaskView,
        graph: &DependencyGraph,
        now: DateTime<Utc>,
    ) -> HashMap<&'static str, f64> {
        let mut factors = HashMap::new();

        if let Some(deadline) = task.deadline {
            factors.insert("deadline", self.score_deadline(deadline, now));
        }

        factors.insert("priority", score_priority(task.priority));

        let blocker_count = graph.blocking_tasks(task.id).len();
        factors.insert("dependencies", score_dependencies(blocker_count));

        if let Some(p) = task.blocker_probability {
            factors.insert("blocker", (1.0 - p).clamp(0.0, 1.0));
        }

        if let Some(secs) = task.estimated_duration_secs {
            factors.insert("duration", score_duration(secs));
        }

        factors
    }

    fn score_deadline(&self, deadline: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
        let days_until = (deadline - now).num_seconds() as f64 / 86_400.0;
        if days_until < 0.0 {
            1.0
        } else if days_until <= self.thresholds.urgent_deadline_days as f64 {
            0.9
        } else if days_until <= self.thresholds.approaching_deadline_days as f64 {
            0.7
        } else {
            let decay = 0.5 - (days_until - self.thresholds.approaching_deadline_days as f64) * 0.02;
            decay.max(0.1)
        }
    }

    fn apply_strategy(&self, strategy: OrderingStrategy) -> StrategyWeights {
        let base = self.weights;
        match strategy {
            OrderingStrategy::Balanced => StrategyWeights::uniform(base),
            OrderingStrategy::DeadlineFirst => StrategyWeights {
                deadline: base.deadline * 2.0,
                priority: base.priority * 0.5,
                dependencies: base.dependencies * 0.4,
                blocker: base.blocker * 0.3,
                duration: base.duration * 0.3,
            },
            OrderingStrategy::PriorityFirst => StrategyWeights {
                deadline: base.deadline * 0.5,
                priority: base.priority * 2.0,
                dependencies: base.dependencies * 0.4,
                blocker: base.blocker * 0.3,
                duration: base.duration * 0.3,
            },
            OrderingStrategy::DependencyAware => StrategyWeights {
                deadline: base.deadline * 0.4,
                priority: base.priority * 0.4,
                dependencies: base.dependencies * 2.0,
                blocker: base.blocker * 0.5,
                duration: base.duration * 0.3,
            },
            OrderingStrategy::BlockerAware => StrategyWeights {
                deadline: base.deadline * 0.4,
                priority: base.priority * 0.4,
                dependencies: base.dependencies * 0.5,
                blocker: base.blocker * 2.0,
                duration: base.duration * 0.3,
            },
        }
    }

    fn urgency_for(&self, task: &TaskView, score: f64, now: DateTime<Utc>) -> Urgency {
        if let Some(deadline) = task.deadline {
            if deadline < now {
                return Urgency::Critical;
            }
            let days_until = (deadline - now).num_seconds() as f64 / 86_400.0;
            if days_until <= self.thresholds.urgent_deadline_days as f64 {
                return Urgency::Urgent;
            }
        }
        if task.priority == Priority::Critical {
            return Urgency::Urgent;
        }
        if task.priority == Priority::High && score > 0.7 {
            return Urgency::Urgent;
        }
        if score > 0.8 {
            Urgency::Urgent
        } else if score > 0.6 {
            Urgency::Normal
        } else {
            Urgency::Low
        }
    }

    /// Topological order over `tasks`, tie-broken by descending composite
    /// score among whichever tasks are currently free of an unresolved
    /// predecessor: a Kahn's pass restricted to the given subset, with the
    /// score (not insertion order) picking which of several eligible tasks
    /// goes next. Any task caught in a cycle (the full graph fails to
    /// topologically sort) is appended in input order instead.
    fn dependency_aware_order(
        &self,
        tasks: &[TaskView],
        graph: &DependencyGraph,
        scored: &HashMap<Identifier, (f64, HashMap<&'static str, f64>)>,
    ) -> Vec<Identifier> {
        let task_ids: std::collections::HashSet<Identifier> = tasks.iter().map(|t| t.id).collect();

        if graph.topological_order().is_err() {
            return tasks.iter().map(|t| t.id).collect();
        }

        let mut dependents: HashMap<Identifier, Vec<Identifier>> = HashMap::new();
        let mut in_degree: HashMap<Identifier, usize> = HashMap::new();
        for &id in &task_ids {
            let deps_in_subset: Vec<Identifier> = graph
                .get_dependencies(id)
                .into_iter()
                .filter(|d| task_ids.contains(d))
                .collect();
            in_degree.insert(id, deps_in_subset.len());
            for dep in deps_in_subset {
                dependents.entry(dep).or_default().push(id);
            }
        }

        let mut order = Vec::with_capacity(task_ids.len());
        loop {
            let mut ready: Vec<Identifier> = in_degree
                .iter()
                .filter(|(_, &deg)| deg == 0)
                .map(|(&id, _)| id)
                .collect();
            if ready.is_empty() {
                break;
            }
            ready.sort_by(|a, b| {
                scored[b]
                    .0
                    .partial_cmp(&scored[a].0)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.cmp(b))
            });
            let next = ready[0];
            in_degree.remove(&next);
            order.push(next);
            if let Some(deps) = dependents.get(&next) {
                for &d in deps {
                    if let Some(deg) = in_degree.get_mut(&d) {
                        *deg -= 1;
                    }
                }
            }
        }

        order
    }

    /// Longest-duration chain through the dependency graph ending at a
    /// sink task (one with no blocking dependents), via memoized DFS.
    fn critical_path(&self, tasks: &[TaskView], graph: &DependencyGraph) -> Vec<Identifier> {
        let durations: HashMap<Identifier, u64> = tasks
            .iter()
            .map(|t| (t.id, t.estimated_duration_secs.unwrap_or(0)))
            .collect();

        let mut memo: HashMap<Identifier, (u64, Vec<Identifier>)> = HashMap::new();
        let mut best: Option<(u64, Vec<Identifier>)> = None;

        for task in tasks {
            // A sink: nothing depends on it.
            if !graph.get_dependents(task.id).is_empty() {
                continue;
            }
            let chain = longest_chain(task.id, graph, &durations, &mut memo);
            if best.as_ref().map(|(d, _)| chain.0 > *d).unwrap_or(true) {
                best = Some(chain);
            }
        }

        best.map(|(_, path)| path).unwrap_or_default()
    }
}

fn longest_chain(
    id: Identifier,
    graph: &DependencyGraph,
    durations: &HashMap<Identifier, u64>,
    memo: &mut HashMap<Identifier, (u64, Vec<Identifier>)>,
) -> (u64, Vec<Identifier>) {
    if let Some(cached) = memo.get(&id) {
        return cached.clone();
    }
    let own_duration = *durations.get(&id).unwrap_or(&0);
    let deps = graph.get_dependencies(id);

    let mut best_dep: Option<(u64, Vec<Identifier>)> = None;
    for dep in deps {
        let candidate = longest_chain(dep, graph, durations, memo);
        if best_dep.as_ref().map(|(d, _)| candidate.0 > *d).unwrap_or(true) {
            best_dep = Some(candidate);
        }
    }

    let result = match best_dep {
        Some((dep_total, mut dep_path)) => {
            dep_path.push(id);
            (dep_total + own_duration, dep_path)
        }
        None => (own_duration, vec![id]),
    };

    memo.insert(id, result.clone());
    result
}

#[derive(Debug, Clone, Copy)]
struct StrategyWeights {
    deadline: f64,
    priority: f64,
    dependencies: f64,
    blocker: f64,
    duration: f64,
}

impl StrategyWeights {
    fn uniform(base: FactorWeights) -> Self {
        Self {
            deadline: base.deadline,
            priority: base.priority,
            dependencies: base.dependencies,
            blocker: base.blocker,
            duration: base.duration,
        }
    }

    fn weight_for(&self, factor: &str) -> f64 {
        match factor {
            "deadline" => self.deadline,
            "priority" => self.priority,
            "dependencies" => self.dependencies,
            "blocker" => self.blocker,
            "duration" => self.duration,
            _ => 0.0,
        }
    }
}

fn score_priority(priority: Priority) -> f64 {
    match priority {
        Priority::Critical => 1.0,
        Priority::High => 0.75,
        Priority::Medium => 0.5,
        Priority::Low => 0.25,
    }
}

fn score_dependencies(blocker_count: usize) -> f64 {
    match blocker_count {
        0 => 1.0,
        1 => 0.7,
        2 => 0.4,
        n => (0.4 - (n as f64 - 2.0) * 0.1).max(0.1),
    }
}

fn score_duration(secs: u64) -> f64 {
    let hours = secs as f64 / 3600.0;
    if hours <= 2.0 {
        1.0
    } else if hours <= 4.0 {
        0.8
    } else if hours <= 8.0 {
        0.6
    } else if hours <= 16.0 {
        0.4
    } else {
        0.2
    }
}

fn rationale_for(task: &TaskView, factors: &HashMap<&'static str, f64>, urgency: Urgency) -> String {
    let mut parts = vec![format!("priority={}", task.priority)];
    if let Some(d) = factors.get("deadline") {
        parts.push(format!("deadline_score={d:.2}"));
    }
    parts.push(format!("urgency={urgency}"));
    parts.join(", ")
}
