//! Deterministic task assignment.
//!
//! Given a requesting agent, the engine filters the pool down to eligible
//! tasks (pending, all hard dependencies completed, no live lease) and
//! ranks them with a fixed tiebreak ladder: priority ordinal, capability
//! match, dependency depth, sibling order, task id. When an AI classifier
//! is wired in it may re-rank the eligible set; classifier failures fall
//! back to the deterministic ranking without surfacing to the caller, and
//! the fallback path never suspends.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde_json::json;

use crate::contracts::TaskClassifier;
use crate::error::{MarcusError, Result};
use crate::events::EventBus;
use crate::lease::LeaseManager;
use crate::models::{event_types, Agent, Event, Task, TaskStatus};
use crate::persistence::{collections, ProjectStore};
use crate::resilience::CircuitBreaker;
use crate::task_pool::TaskPool;

/// Picks the next task for a requesting agent. Cheap to clone.
#[derive(Clone)]
pub struct AssignmentEngine {
    tasks: TaskPool,
    leases: LeaseManager,
    bus: EventBus,
    store: ProjectStore,
    classifier: Option<Arc<dyn TaskClassifier>>,
    classifier_breaker: Arc<CircuitBreaker>,
}

struct Candidate {
    task: Task,
    priority: u32,
    capability: f64,
    depth: usize,
}

impl AssignmentEngine {
    pub fn new(
        tasks: TaskPool,
        leases: LeaseManager,
        bus: EventBus,
        store: ProjectStore,
        classifier: Option<Arc<dyn TaskClassifier>>,
        classifier_breaker: Arc<CircuitBreaker>,
    ) -> Self {
        Self {
            tasks,
            leases,
            bus,
            store,
            classifier,
            classifier_breaker,
        }
    }

    /// Select, assign and lease the best eligible task for `agent`.
    ///
    /// Returns `Ok(None)` when no task is eligible. A lease conflict from a
    /// concurrent grant is retried once; a second conflict publishes
    /// `AssignmentFailed` and also returns `Ok(None)`.
    pub async fn find_next_task(&self, agent: &Agent) -> Result<Option<Task>> {
        if let Some(held) = self.leases.live_lease_for_agent(&agent.agent_id).await {
            return Err(MarcusError::business_logic(format!(
                "Agent '{}' already holds a live lease on task '{}'",
                agent.agent_id, held.task_id
            ))
            .with_agent(agent.agent_id.clone())
            .with_task(held.task_id));
        }

        for attempt in 0..2 {
            let Some(selected) = self.select(agent).await else {
                return Ok(None);
            };
            let task_id = selected.task_id.clone();

            // Claim the pending slot under the pool's write lock; a racer
            // that got there first just sends us back to selection.
            let claim = self
                .tasks
                .update(&task_id, |task| {
                    if task.status != TaskStatus::Pending {
                        return Err(MarcusError::lease_conflict(task.task_id.clone()));
                    }
                    task.status = TaskStatus::Assigned;
                    task.assigned_agent_id = Some(agent.agent_id.clone());
                    Ok(task.clone())
                })
                .await;
            if claim.is_err() {
                continue;
            }

            match self.leases.grant(&task_id, &agent.agent_id, None).await {
                Ok(lease) => {
                    let task = self
                        .tasks
                        .update(&task_id, |task| {
                            task.lease_id = Some(lease.lease_id.clone());
                            Ok(task.clone())
                        })
                        .await?;
                    self.store
                        .save_best_effort(collections::TASKS, &task.task_id, &task)
                        .await;
                    self.store
                        .save_best_effort(
                            collections::ASSIGNMENTS,
                            &lease.lease_id,
                            &json!({
                                "task_id": task.task_id,
                                "agent_id": agent.agent_id,
                                "assigned_at": lease.granted_at,
                                "lease_expiry": lease.expires_at,
                                "status": "active",
                            }),
                        )
                        .await;
                    self.bus
                        .publish(Event::new(
                            event_types::TASK_ASSIGNED,
                            self.store.project_id(),
                            json!({
                                "task_id": task.task_id,
                                "agent_id": agent.agent_id,
                                "lease_id": lease.lease_id,
                            }),
                        ))
                        .await;
                    return Ok(Some(task));
                }
                Err(err) if err.is_lease_conflict() => {
                    self.revert_claim(&task_id).await;
                    if attempt == 1 {
                        break;
                    }
                }
                Err(err) => {
                    self.revert_claim(&task_id).await;
                    return Err(err);
                }
            }
        }

        self.bus
            .publish(Event::new(
                event_types::ASSIGNMENT_FAILED,
                self.store.project_id(),
                json!({
                    "agent_id": agent.agent_id,
                    "reason": "lease conflict persisted after retry",
                }),
            ))
            .await;
        Ok(None)
    }

    /// The task `find_next_task` would pick, without assigning it.
    ///
    /// With no classifier configured this is a pure function of pool and
    /// lease state, so repeated calls against identical state agree.
    pub async fn peek_next_task(&self, agent: &Agent) -> Option<Task> {
        self.select(agent).await
    }

    async fn select(&self, agent: &Agent) -> Option<Task> {
        let snapshot = self.tasks.all().await;
        let completed: HashSet<&str> = snapshot
            .iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .map(|t| t.task_id.as_str())
            .collect();

        let mut candidates = Vec::new();
        for task in &snapshot {
            if task.status != TaskStatus::Pending {
                continue;
            }
            if !task.blocking_dependencies().all(|d| completed.contains(d)) {
                continue;
            }
            if self.leases.live_lease_for_task(&task.task_id).await.is_some() {
                continue;
            }
            candidates.push(task.clone());
        }
        if candidates.is_empty() {
            return None;
        }

        let depths = dependency_depths(&snapshot);
        let capability_set = agent.capability_set();
        let mut scored: Vec<Candidate> = candidates
            .into_iter()
            .map(|task| {
                let keywords = task.keyword_set();
                let overlap = keywords.intersection(&capability_set).count();
                Candidate {
                    priority: task.priority.ordinal(),
                    capability: overlap as f64 / keywords.len().max(1) as f64,
                    depth: depths.get(task.task_id.as_str()).copied().unwrap_or(0),
                    task,
                }
            })
            .collect();
        scored.sort_by(rank);

        if self.classifier.is_some() {
            if let Some(task) = self.classifier_pick(&scored, agent).await {
                return Some(task);
            }
        }
        scored.into_iter().next().map(|c| c.task)
    }

    /// Ask the classifier to re-rank the deterministic ordering.
    ///
    /// Any failure (including an open breaker) abandons rescoring for this
    /// request; callers cannot tell which path produced the result.
    async fn classifier_pick(&self, ranked: &[Candidate], agent: &Agent) -> Option<Task> {
        let classifier = self.classifier.as_ref()?;
        let mut best: Option<(f64, usize)> = None;
        for (index, candidate) in ranked.iter().enumerate() {
            let task = &candidate.task;
            let outcome = self
                .classifier_breaker
                .call(|| {
                    let classifier = Arc::clone(classifier);
                    async move { classifier.classify(task, agent).await }
                })
                .await;
            match outcome {
                Ok(score) => {
                    // Deterministic rank breaks score ties via the index
                    let better = match best {
                        None => true,
                        Some((best_score, _)) => score.score > best_score,
                    };
                    if better {
                        best = Some((score.score, index));
                    }
                }
                Err(err) => {
                    tracing::debug!(
                        agent_id = %agent.agent_id,
                        error = %err,
                        "Classifier unavailable; using deterministic ranking"
                    );
                    return None;
                }
            }
        }
        best.map(|(_, index)| ranked[index].task.clone())
    }

    async fn revert_claim(&self, task_id: &str) {
        let result = self
            .tasks
            .update(task_id, |task| {
                if task.status == TaskStatus::Assigned {
                    task.status = TaskStatus::Pending;
                    task.assigned_agent_id = None;
                }
                Ok(())
            })
            .await;
        if let Err(err) = result {
            tracing::warn!(task_id, error = %err, "Failed to revert provisional assignment");
        }
    }
}

/// Best-first ordering over scored candidates
fn rank(a: &Candidate, b: &Candidate) -> Ordering {
    b.priority
        .cmp(&a.priority)
        .then_with(|| {
            b.capability
                .partial_cmp(&a.capability)
                .unwrap_or(Ordering::Equal)
        })
        .then_with(|| a.depth.cmp(&b.depth))
        .then_with(|| sibling_order(a, b))
        .then_with(|| a.task.task_id.cmp(&b.task.task_id))
}

/// Sibling ordinal tiebreak, only meaningful under a shared parent
fn sibling_order(a: &Candidate, b: &Candidate) -> Ordering {
    match (&a.task.parent_task_id, &b.task.parent_task_id) {
        (Some(pa), Some(pb)) if pa == pb => a
            .task
            .sibling_order
            .unwrap_or(i32::MAX)
            .cmp(&b.task.sibling_order.unwrap_or(i32::MAX)),
        _ => Ordering::Equal,
    }
}

/// Distance of each task from a dependency root (a task with no
/// dependencies). Tasks closer to a root rank earlier on ties.
fn dependency_depths(tasks: &[Task]) -> HashMap<&str, usize> {
    let by_id: HashMap<&str, &Task> = tasks.iter().map(|t| (t.task_id.as_str(), t)).collect();
    let mut depths: HashMap<&str, usize> = HashMap::new();

    fn depth_of<'a>(
        id: &'a str,
        by_id: &HashMap<&'a str, &'a Task>,
        depths: &mut HashMap<&'a str, usize>,
        visiting: &mut HashSet<&'a str>,
    ) -> usize {
        if let Some(d) = depths.get(id) {
            return *d;
        }
        if !visiting.insert(id) {
            // Cycle guard; repaired graphs are acyclic but inputs may not be
            return 0;
        }
        let task = match by_id.get(id) {
            Some(task) => *task,
            None => {
                visiting.remove(id);
                return 0;
            }
        };
        let depth = task
            .dependencies
            .iter()
            .filter(|d| by_id.contains_key(d.as_str()))
            .map(|d| depth_of(d.as_str(), by_id, depths, visiting) + 1)
            .min()
            .unwrap_or(0);
        visiting.remove(id);
        depths.insert(id, depth);
        depth
    }

    for task in tasks {
        let mut visiting = HashSet::new();
        depth_of(task.task_id.as_str(), &by_id, &mut depths, &mut visiting);
    }
    depths
}
