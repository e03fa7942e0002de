//! Per-project state and the LRU context cache.
//!
//! A [`ProjectContext`] owns everything project-scoped: the task pool, the
//! agent registry, the lease manager, the event bus and the assignment
//! engine. The [`ProjectContextManager`] multiplexes contexts behind a
//! bounded most-recently-used cache and exposes exactly zero or one of
//! them as the active project; switching replaces the active project and
//! never destroys cached or persisted state.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::{Mutex, RwLock};

use crate::assignment::AssignmentEngine;
use crate::contracts::{KanbanSink, KanbanSubscriber, TaskClassifier};
use crate::error::{MarcusError, Result};
use crate::events::{EventBus, WILDCARD_TOPIC};
use crate::lease::LeaseManager;
use crate::models::{event_types, Agent, AgentStatus, Event, Lease, NewTask, Task, TaskStatus};
use crate::persistence::{collections, Persistence, ProjectStore};
use crate::resilience::{CircuitBreaker, RetryPolicy};
use crate::task_pool::TaskPool;
use crate::validator;

/// Default number of resident project contexts
pub const DEFAULT_CACHE_CAPACITY: usize = 10;

/// Tunables shared by every context the manager creates
#[derive(Debug, Clone)]
pub struct ContextConfig {
    pub capacity: usize,
    pub lease_ttl: Duration,
    pub reclaim_interval: StdDuration,
    pub event_history: usize,
    pub persist_events: bool,
    pub breaker_failure_threshold: u32,
    pub breaker_recovery_timeout: StdDuration,
    pub retry: RetryPolicy,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CACHE_CAPACITY,
            lease_ttl: Duration::seconds(crate::lease::DEFAULT_TTL_SECONDS),
            reclaim_interval: StdDuration::from_secs(
                crate::lease::DEFAULT_RECLAIM_INTERVAL_SECONDS,
            ),
            event_history: crate::events::DEFAULT_HISTORY_SIZE,
            persist_events: true,
            breaker_failure_threshold: CircuitBreaker::DEFAULT_FAILURE_THRESHOLD,
            breaker_recovery_timeout: CircuitBreaker::DEFAULT_RECOVERY_TIMEOUT,
            retry: RetryPolicy::default(),
        }
    }
}

/// Registry of worker agents known to one project. Cheap to clone.
///
/// Agents are referenced, not owned: the same worker may be registered in
/// several projects.
#[derive(Clone, Default)]
pub struct AgentRegistry {
    inner: Arc<RwLock<HashMap<String, Agent>>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or refresh an agent profile
    pub async fn register(&self, agent: Agent) -> Agent {
        let mut agents = self.inner.write().await;
        let entry = agents
            .entry(agent.agent_id.clone())
            .and_modify(|existing| {
                existing.name = agent.name.clone();
                existing.role = agent.role;
                existing.capabilities = agent.capabilities.clone();
                existing.status = AgentStatus::Idle;
                existing.last_heartbeat = Utc::now();
            })
            .or_insert(agent);
        entry.clone()
    }

    pub async fn get(&self, agent_id: &str) -> Option<Agent> {
        self.inner.read().await.get(agent_id).cloned()
    }

    pub async fn list(&self) -> Vec<Agent> {
        self.inner.read().await.values().cloned().collect()
    }

    /// Refresh the heartbeat; any tool call from the agent counts
    pub async fn heartbeat(&self, agent_id: &str) {
        if let Some(agent) = self.inner.write().await.get_mut(agent_id) {
            agent.last_heartbeat = Utc::now();
            if agent.status == AgentStatus::Offline {
                agent.status = AgentStatus::Idle;
            }
        }
    }

    /// Record what the agent is working on (or that it is idle again)
    pub async fn set_working(&self, agent_id: &str, task_id: Option<String>) {
        if let Some(agent) = self.inner.write().await.get_mut(agent_id) {
            agent.status = if task_id.is_some() {
                AgentStatus::Working
            } else {
                AgentStatus::Idle
            };
            agent.current_task_id = task_id;
        }
    }

    pub async fn active_count(&self) -> usize {
        self.inner
            .read()
            .await
            .values()
            .filter(|a| a.status != AgentStatus::Offline)
            .count()
    }

    pub async fn restore(&self, agents: Vec<Agent>) {
        let mut map = self.inner.write().await;
        *map = agents.into_iter().map(|a| (a.agent_id.clone(), a)).collect();
    }
}

/// Serialized ephemeral state of a project, written to the
/// `project_snapshots` collection on switch and close and read back on
/// rehydration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectState {
    pub project_id: String,
    pub project_name: String,
    pub saved_at: DateTime<Utc>,
    pub trigger: String,
    pub total_tasks: usize,
    pub completed_tasks: usize,
    pub active_agents: usize,
    pub tasks: Vec<Task>,
    pub agents: Vec<Agent>,
    pub leases: Vec<Lease>,
}

/// Summary returned by the project-status tool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectStatus {
    pub project_id: String,
    pub project_name: String,
    pub total_tasks: usize,
    pub pending: usize,
    pub assigned: usize,
    pub in_progress: usize,
    pub blocked: usize,
    pub completed: usize,
    pub failed: usize,
    pub completion_rate: f64,
    pub blockers: usize,
    pub active_agents: usize,
}

/// All state owned by one project.
pub struct ProjectContext {
    project_id: String,
    project_name: String,
    tasks: TaskPool,
    agents: AgentRegistry,
    leases: LeaseManager,
    bus: EventBus,
    assignment: AssignmentEngine,
    store: ProjectStore,
    created_at: DateTime<Utc>,
    last_accessed: std::sync::Mutex<DateTime<Utc>>,
    is_connected: AtomicBool,
    reclaim_handle: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl std::fmt::Debug for ProjectContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProjectContext")
            .field("project_id", &self.project_id)
            .field("project_name", &self.project_name)
            .finish_non_exhaustive()
    }
}

impl ProjectContext {
    #[allow(clippy::too_many_arguments)]
    async fn build(
        project_id: &str,
        project_name: &str,
        config: &ContextConfig,
        persistence: Option<Arc<dyn Persistence>>,
        classifier: Option<Arc<dyn TaskClassifier>>,
        classifier_breaker: Arc<CircuitBreaker>,
        kanban: Option<(Arc<dyn KanbanSink>, Arc<CircuitBreaker>)>,
    ) -> Arc<Self> {
        let bus = match (&persistence, config.persist_events) {
            (Some(p), true) => EventBus::with_persistence(config.event_history, Arc::clone(p)),
            _ => EventBus::new(config.event_history),
        };
        let store = ProjectStore::new(project_id, persistence);
        let tasks = TaskPool::new();
        let leases = LeaseManager::new(
            tasks.clone(),
            bus.clone(),
            store.clone(),
            config.lease_ttl,
            config.reclaim_interval,
        );
        let assignment = AssignmentEngine::new(
            tasks.clone(),
            leases.clone(),
            bus.clone(),
            store.clone(),
            classifier,
            classifier_breaker,
        );

        let context = Arc::new(Self {
            project_id: project_id.to_string(),
            project_name: project_name.to_string(),
            tasks,
            agents: AgentRegistry::new(),
            leases: leases.clone(),
            bus: bus.clone(),
            assignment,
            store,
            created_at: Utc::now(),
            last_accessed: std::sync::Mutex::new(Utc::now()),
            is_connected: AtomicBool::new(true),
            reclaim_handle: std::sync::Mutex::new(None),
        });

        if let Some((sink, breaker)) = kanban {
            let subscriber = KanbanSubscriber::new(sink, config.retry.clone(), breaker);
            bus.subscribe(WILDCARD_TOPIC, Arc::new(subscriber)).await;
        }

        *context.reclaim_handle.lock().unwrap() = Some(leases.spawn_reclaim_loop());
        context
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn project_name(&self) -> &str {
        &self.project_name
    }

    pub fn tasks(&self) -> &TaskPool {
        &self.tasks
    }

    pub fn agents(&self) -> &AgentRegistry {
        &self.agents
    }

    pub fn leases(&self) -> &LeaseManager {
        &self.leases
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn assignment(&self) -> &AssignmentEngine {
        &self.assignment
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn is_connected(&self) -> bool {
        self.is_connected.load(Ordering::Relaxed)
    }

    pub fn touch(&self) {
        *self.last_accessed.lock().unwrap() = Utc::now();
    }

    pub fn last_accessed(&self) -> DateTime<Utc> {
        *self.last_accessed.lock().unwrap()
    }

    /// Accept a task-graph submission: repair it, merge it into the pool,
    /// persist the tasks and publish `TaskCreated` for each new one.
    ///
    /// Returns the number of tasks added and the repair warnings.
    pub async fn submit_tasks(&self, new_tasks: Vec<NewTask>) -> Result<(usize, Vec<String>)> {
        let now = Utc::now();
        let existing = self.tasks.all().await;
        let existing_ids: std::collections::HashSet<String> =
            existing.iter().map(|t| t.task_id.clone()).collect();

        let mut combined = existing;
        let mut added_ids = Vec::new();
        for new_task in new_tasks {
            if existing_ids.contains(&new_task.task_id) {
                return Err(MarcusError::business_logic(format!(
                    "Task '{}' already exists in this project",
                    new_task.task_id
                ))
                .with_project(self.project_id.clone())
                .with_task(new_task.task_id));
            }
            added_ids.push(new_task.task_id.clone());
            combined.push(new_task.into_task(now));
        }

        let warnings = validator::validate_and_fix(&mut combined);
        for warning in &warnings {
            tracing::warn!(project_id = %self.project_id, "{warning}");
        }

        self.tasks.replace_all(combined.clone()).await;
        for task in &combined {
            self.store
                .save_best_effort(collections::TASKS, &task.task_id, task)
                .await;
        }
        for task_id in &added_ids {
            self.bus
                .publish(Event::new(
                    event_types::TASK_CREATED,
                    &self.project_id,
                    json!({ "task_id": task_id }),
                ))
                .await;
        }
        Ok((added_ids.len(), warnings))
    }

    /// Apply a reported status change to a task, keeping leases, events
    /// and the durable copy in step.
    ///
    /// Completion and failure terminate the task's live lease when one
    /// exists; blocking and starting publish their lifecycle events.
    pub async fn update_task_status(&self, task_id: &str, status: TaskStatus) -> Result<Task> {
        match status {
            TaskStatus::Completed => {
                if let Some(lease) = self.leases.live_lease_for_task(task_id).await {
                    self.leases.complete(&lease.lease_id).await?;
                    let task = self.tasks.get(task_id).await.ok_or_else(|| {
                        MarcusError::business_logic(format!("Task '{task_id}' not found"))
                    })?;
                    self.release_worker(&task).await;
                    return Ok(task);
                }
                let task = self.tasks.transition(task_id, TaskStatus::Completed).await?;
                self.store
                    .save_best_effort(collections::TASKS, task_id, &task)
                    .await;
                self.release_worker(&task).await;
                self.bus
                    .publish(Event::new(
                        event_types::TASK_COMPLETED,
                        &self.project_id,
                        json!({ "task_id": task_id, "agent_id": task.assigned_agent_id }),
                    ))
                    .await;
                Ok(task)
            }
            TaskStatus::Failed => {
                if let Some(lease) = self.leases.live_lease_for_task(task_id).await {
                    self.leases.expire(&lease.lease_id).await?;
                }
                let task = self.tasks.transition(task_id, TaskStatus::Failed).await?;
                self.store
                    .save_best_effort(collections::TASKS, task_id, &task)
                    .await;
                self.release_worker(&task).await;
                Ok(task)
            }
            TaskStatus::InProgress | TaskStatus::Blocked => {
                let task = self.tasks.transition(task_id, status).await?;
                self.store
                    .save_best_effort(collections::TASKS, task_id, &task)
                    .await;
                let event_type = if status == TaskStatus::InProgress {
                    event_types::TASK_STARTED
                } else {
                    event_types::TASK_BLOCKED
                };
                self.bus
                    .publish(Event::new(
                        event_type,
                        &self.project_id,
                        json!({ "task_id": task_id, "agent_id": task.assigned_agent_id }),
                    ))
                    .await;
                Ok(task)
            }
            other => Err(MarcusError::business_logic(format!(
                "Progress reports cannot move a task to '{other}'"
            ))
            .with_task(task_id.to_string())),
        }
    }

    async fn release_worker(&self, task: &Task) {
        if let Some(agent_id) = &task.assigned_agent_id {
            self.agents.set_working(agent_id, None).await;
        }
    }

    /// Status roll-up for the project-status tool
    pub async fn status_summary(&self) -> ProjectStatus {
        let counts = self.tasks.counts_by_status().await;
        let count = |s: TaskStatus| counts.get(&s).copied().unwrap_or(0);
        let total = counts.values().sum::<usize>();
        let completed = count(TaskStatus::Completed);
        ProjectStatus {
            project_id: self.project_id.clone(),
            project_name: self.project_name.clone(),
            total_tasks: total,
            pending: count(TaskStatus::Pending),
            assigned: count(TaskStatus::Assigned),
            in_progress: count(TaskStatus::InProgress),
            blocked: count(TaskStatus::Blocked),
            completed,
            failed: count(TaskStatus::Failed),
            completion_rate: if total == 0 {
                0.0
            } else {
                completed as f64 / total as f64
            },
            blockers: count(TaskStatus::Blocked),
            active_agents: self.agents.active_count().await,
        }
    }

    /// Capture the current ephemeral state as a snapshot value
    pub async fn snapshot(&self, trigger: &str) -> ProjectState {
        let tasks = self.tasks.all().await;
        let completed_tasks = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .count();
        ProjectState {
            project_id: self.project_id.clone(),
            project_name: self.project_name.clone(),
            saved_at: Utc::now(),
            trigger: trigger.to_string(),
            total_tasks: tasks.len(),
            completed_tasks,
            active_agents: self.agents.active_count().await,
            tasks,
            agents: self.agents.list().await,
            leases: self.leases.all().await,
        }
    }

    /// Persist the snapshot; failures are logged, not fatal, because the
    /// in-memory context remains authoritative while resident.
    pub async fn save_state(&self, trigger: &str) {
        let state = self.snapshot(trigger).await;
        self.store
            .save_best_effort(collections::PROJECT_SNAPSHOTS, "state", &state)
            .await;
    }

    async fn restore_from(&self, state: ProjectState) {
        self.tasks.replace_all(state.tasks).await;
        self.agents.restore(state.agents).await;
        self.leases.restore(state.leases).await;
    }

    /// Cleanly shut the context down: stop the reclaim loop, flush the
    /// snapshot, drop subscribers and mark the context disconnected.
    pub async fn close(&self) {
        self.save_state("close").await;
        self.discard().await;
        tracing::info!(project_id = %self.project_id, "Project context closed");
    }

    /// Tear down without flushing; used for a context that lost a creation
    /// race and must not clobber the winner's snapshot.
    async fn discard(&self) {
        if let Some(handle) = self.reclaim_handle.lock().unwrap().take() {
            handle.abort();
        }
        self.bus.clear_subscribers().await;
        self.is_connected.store(false, Ordering::Relaxed);
    }
}

/// Entry returned by `list_projects`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectInfo {
    pub project_id: String,
    pub project_name: String,
    pub resident: bool,
    pub active: bool,
}

/// How `create_project` resolves name collisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CreateMode {
    #[default]
    NewProject,
    /// Switch to an existing project matching by name, else create
    Auto,
    /// Only switch; fail when no project matches
    SelectProject,
}

struct ManagerState {
    contexts: HashMap<String, Arc<ProjectContext>>,
    /// Least-recent first
    order: Vec<String>,
    active: Option<String>,
}

/// Multiplexes project contexts behind an LRU cache with one active
/// project at a time.
pub struct ProjectContextManager {
    state: Mutex<ManagerState>,
    config: ContextConfig,
    persistence: Option<Arc<dyn Persistence>>,
    classifier: Option<Arc<dyn TaskClassifier>>,
    classifier_breaker: Arc<CircuitBreaker>,
    kanban: Option<Arc<dyn KanbanSink>>,
    kanban_breaker: Arc<CircuitBreaker>,
}

impl ProjectContextManager {
    pub fn new(config: ContextConfig, persistence: Option<Arc<dyn Persistence>>) -> Self {
        let classifier_breaker = Arc::new(CircuitBreaker::new(
            "classifier",
            config.breaker_failure_threshold,
            config.breaker_recovery_timeout,
        ));
        let kanban_breaker = Arc::new(CircuitBreaker::new(
            "kanban",
            config.breaker_failure_threshold,
            config.breaker_recovery_timeout,
        ));
        Self {
            state: Mutex::new(ManagerState {
                contexts: HashMap::new(),
                order: Vec::new(),
                active: None,
            }),
            config,
            persistence,
            classifier: None,
            classifier_breaker,
            kanban: None,
            kanban_breaker,
        }
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn TaskClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn with_kanban(mut self, sink: Arc<dyn KanbanSink>) -> Self {
        self.kanban = Some(sink);
        self
    }

    pub fn capacity(&self) -> usize {
        self.config.capacity
    }

    /// Number of resident contexts (bounded by the capacity)
    pub async fn resident_count(&self) -> usize {
        self.state.lock().await.contexts.len()
    }

    /// Fetch a context, promoting it in the LRU order; absent projects are
    /// rehydrated from persistence or created fresh.
    pub async fn get_or_create(&self, project_id: &str) -> Result<Arc<ProjectContext>> {
        self.get_or_create_named(project_id, project_id).await
    }

    /// `get_or_create` with an explicit display name for fresh projects
    pub async fn get_or_create_named(
        &self,
        project_id: &str,
        project_name: &str,
    ) -> Result<Arc<ProjectContext>> {
        // Fast path under the cache lock; no suspension points while held.
        {
            let mut state = self.state.lock().await;
            if let Some(context) = state.contexts.get(project_id).cloned() {
                promote(&mut state.order, project_id);
                context.touch();
                return Ok(context);
            }
        }

        // Slow path: rehydrate outside the lock.
        let saved = self.load_state(project_id).await?;
        let name = saved
            .as_ref()
            .map(|s| s.project_name.clone())
            .unwrap_or_else(|| project_name.to_string());
        let context = ProjectContext::build(
            project_id,
            &name,
            &self.config,
            self.persistence.clone(),
            self.classifier.clone(),
            Arc::clone(&self.classifier_breaker),
            self.kanban
                .as_ref()
                .map(|sink| (Arc::clone(sink), Arc::clone(&self.kanban_breaker))),
        )
        .await;
        if let Some(state) = saved {
            context.restore_from(state).await;
        }

        let (context, loser, evicted) = {
            let mut state = self.state.lock().await;
            if let Some(existing) = state.contexts.get(project_id).cloned() {
                // Lost the creation race; keep the winner and discard ours.
                promote(&mut state.order, project_id);
                existing.touch();
                (existing, Some(context), vec![])
            } else {
                state.contexts.insert(project_id.to_string(), Arc::clone(&context));
                state.order.push(project_id.to_string());
                let evicted = evict_over_capacity(&mut state, self.config.capacity);
                (context, None, evicted)
            }
        };

        if let Some(loser) = loser {
            loser.discard().await;
        }
        for victim in evicted {
            victim.close().await;
        }
        Ok(context)
    }

    /// Make `project_id` the active project.
    ///
    /// The outgoing project's ephemeral state is flushed first; the switch
    /// replaces the active pointer without destroying cached state.
    pub async fn switch(&self, project_id: &str) -> Result<Arc<ProjectContext>> {
        let previous = self.current().await;
        if let Some(prev) = &previous {
            if prev.project_id() != project_id {
                prev.save_state("switch").await;
            }
        }

        let context = self.get_or_create(project_id).await?;
        {
            let mut state = self.state.lock().await;
            state.active = Some(project_id.to_string());
        }
        context
            .bus()
            .publish(Event::new(
                event_types::PROJECT_STATE_CHANGED,
                project_id,
                json!({
                    "active_project_id": project_id,
                    "previous_project_id": previous.map(|p| p.project_id().to_string()),
                }),
            ))
            .await;
        tracing::info!(project_id, "Switched active project");
        Ok(context)
    }

    /// The active context, if any
    pub async fn current(&self) -> Option<Arc<ProjectContext>> {
        let state = self.state.lock().await;
        let active = state.active.as_ref()?;
        state.contexts.get(active).cloned()
    }

    /// The active context, or the business-rule error every tool surfaces
    /// when nothing is active
    pub async fn active(&self) -> Result<Arc<ProjectContext>> {
        self.current().await.ok_or_else(MarcusError::no_active_project)
    }

    /// Known projects: resident contexts merged with persisted snapshots
    pub async fn list_projects(&self) -> Result<Vec<ProjectInfo>> {
        let (resident, active) = {
            let state = self.state.lock().await;
            (
                state
                    .contexts
                    .values()
                    .map(|c| (c.project_id().to_string(), c.project_name().to_string()))
                    .collect::<Vec<_>>(),
                state.active.clone(),
            )
        };

        let mut infos: HashMap<String, ProjectInfo> = resident
            .into_iter()
            .map(|(id, name)| {
                (
                    id.clone(),
                    ProjectInfo {
                        active: active.as_deref() == Some(id.as_str()),
                        project_id: id,
                        project_name: name,
                        resident: true,
                    },
                )
            })
            .collect();

        if let Some(persistence) = &self.persistence {
            let rows = persistence
                .query(
                    collections::PROJECT_SNAPSHOTS,
                    &|_| true,
                    crate::persistence::MAX_QUERY_LIMIT,
                    0,
                )
                .await?;
            for row in rows {
                let Some(id) = row.get("project_id").and_then(|v| v.as_str()) else {
                    continue;
                };
                let name = row
                    .get("project_name")
                    .and_then(|v| v.as_str())
                    .unwrap_or(id)
                    .to_string();
                infos.entry(id.to_string()).or_insert(ProjectInfo {
                    active: active.as_deref() == Some(id),
                    project_id: id.to_string(),
                    project_name: name,
                    resident: false,
                });
            }
        }

        let mut list: Vec<ProjectInfo> = infos.into_values().collect();
        list.sort_by(|a, b| a.project_id.cmp(&b.project_id));
        Ok(list)
    }

    /// Create a project (or, in `Auto`/`SelectProject` modes, resolve an
    /// existing one by name) and make it active. Returns the context and
    /// whether it was newly created.
    pub async fn create_project(
        &self,
        name: &str,
        mode: CreateMode,
        explicit_id: Option<String>,
    ) -> Result<(Arc<ProjectContext>, bool)> {
        if mode != CreateMode::NewProject {
            let existing = self
                .list_projects()
                .await?
                .into_iter()
                .find(|p| p.project_name == name);
            match (existing, mode) {
                (Some(info), _) => {
                    let context = self.switch(&info.project_id).await?;
                    return Ok((context, false));
                }
                (None, CreateMode::SelectProject) => {
                    return Err(MarcusError::business_logic(format!(
                        "No project named '{name}' exists"
                    )));
                }
                (None, _) => {}
            }
        }

        let project_id = explicit_id.unwrap_or_else(|| {
            let slug = slugify(name);
            let unique = uuid::Uuid::new_v4().simple().to_string();
            format!("{slug}-{}", &unique[..8])
        });
        let context = self.get_or_create_named(&project_id, name).await?;
        context.save_state("create").await;
        let context = self.switch(&project_id).await?;
        Ok((context, true))
    }

    async fn load_state(&self, project_id: &str) -> Result<Option<ProjectState>> {
        let Some(persistence) = &self.persistence else {
            return Ok(None);
        };
        let key = format!("{project_id}:state");
        let Some(value) = persistence
            .retrieve(collections::PROJECT_SNAPSHOTS, &key)
            .await?
        else {
            return Ok(None);
        };
        let state: ProjectState = serde_json::from_value(value).map_err(|e| {
            MarcusError::storage_corrupt(format!(
                "Snapshot for project '{project_id}' failed to deserialize: {e}"
            ))
        })?;
        Ok(Some(state))
    }
}

fn promote(order: &mut Vec<String>, project_id: &str) {
    if let Some(pos) = order.iter().position(|id| id == project_id) {
        let id = order.remove(pos);
        order.push(id);
    }
}

/// Evict least-recent contexts beyond `capacity`, never the active one
fn evict_over_capacity(state: &mut ManagerState, capacity: usize) -> Vec<Arc<ProjectContext>> {
    let mut evicted = Vec::new();
    let mut scanned = 0;
    while state.order.len() > capacity && scanned < state.order.len() {
        let victim_id = state.order.remove(0);
        scanned += 1;
        if state.active.as_deref() == Some(victim_id.as_str()) {
            state.order.push(victim_id);
            continue;
        }
        if let Some(context) = state.contexts.remove(&victim_id) {
            evicted.push(context);
        }
    }
    evicted
}

/// Lowercase hyphenated identifier from a display name
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut last_was_dash = true;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
            last_was_dash = false;
        } else if !last_was_dash {
            slug.push('-');
            last_was_dash = true;
        }
    }
    let slug = slug.trim_end_matches('-').to_string();
    if slug.is_empty() {
        "project".to_string()
    } else {
        slug
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{stamp_stored_at, stored_at_of, QueryFilter};
    use async_trait::async_trait;
    use serde_json::Value;

    /// Minimal in-memory store for manager tests; the real backends live in
    /// the persistence crate.
    #[derive(Default)]
    struct TestStore {
        data: std::sync::Mutex<HashMap<String, std::collections::BTreeMap<String, Value>>>,
    }

    #[async_trait]
    impl Persistence for TestStore {
        async fn store(&self, collection: &str, key: &str, value: Value) -> Result<()> {
            let value = stamp_stored_at(value, Utc::now());
            self.data
                .lock()
                .unwrap()
                .entry(collection.to_string())
                .or_default()
                .insert(key.to_string(), value);
            Ok(())
        }

        async fn retrieve(&self, collection: &str, key: &str) -> Result<Option<Value>> {
            Ok(self
                .data
                .lock()
                .unwrap()
                .get(collection)
                .and_then(|c| c.get(key))
                .cloned())
        }

        async fn query(
            &self,
            collection: &str,
            filter: QueryFilter<'_>,
            limit: usize,
            offset: usize,
        ) -> Result<Vec<Value>> {
            let data = self.data.lock().unwrap();
            Ok(data
                .get(collection)
                .map(|c| {
                    c.values()
                        .filter(|v| filter(v))
                        .skip(offset)
                        .take(crate::persistence::effective_limit(limit))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default())
        }

        async fn delete(&self, collection: &str, key: &str) -> Result<()> {
            if let Some(c) = self.data.lock().unwrap().get_mut(collection) {
                c.remove(key);
            }
            Ok(())
        }

        async fn clear_old(&self, collection: &str, older_than: DateTime<Utc>) -> Result<u64> {
            let mut data = self.data.lock().unwrap();
            let Some(c) = data.get_mut(collection) else {
                return Ok(0);
            };
            let before = c.len();
            c.retain(|_, v| stored_at_of(v).map(|t| t >= older_than).unwrap_or(true));
            Ok((before - c.len()) as u64)
        }

        async fn health_check(&self) -> Result<()> {
            Ok(())
        }
    }

    fn manager(capacity: usize) -> ProjectContextManager {
        let config = ContextConfig {
            capacity,
            persist_events: false,
            ..ContextConfig::default()
        };
        ProjectContextManager::new(config, None)
    }

    fn persistent_manager(capacity: usize) -> (ProjectContextManager, Arc<TestStore>) {
        let store = Arc::new(TestStore::default());
        let config = ContextConfig {
            capacity,
            persist_events: false,
            ..ContextConfig::default()
        };
        let manager =
            ProjectContextManager::new(config, Some(store.clone() as Arc<dyn Persistence>));
        (manager, store)
    }

    #[tokio::test]
    async fn no_active_project_is_an_error() {
        let manager = manager(4);
        let err = manager.active().await.unwrap_err();
        assert!(err.is_no_active_project());
    }

    #[tokio::test]
    async fn switch_sets_exactly_one_active_project() {
        let manager = manager(4);
        manager.switch("p1").await.unwrap();
        assert_eq!(manager.current().await.unwrap().project_id(), "p1");

        manager.switch("p2").await.unwrap();
        assert_eq!(manager.current().await.unwrap().project_id(), "p2");

        // Switching replaced, not added
        let active: Vec<_> = manager
            .list_projects()
            .await
            .unwrap()
            .into_iter()
            .filter(|p| p.active)
            .collect();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].project_id, "p2");
    }

    #[tokio::test]
    async fn lru_bound_holds_and_eviction_spares_the_active_project() {
        let manager = manager(2);
        manager.switch("p1").await.unwrap();
        manager.get_or_create("p2").await.unwrap();
        assert_eq!(manager.resident_count().await, 2);

        manager.get_or_create("p3").await.unwrap();
        assert_eq!(manager.resident_count().await, 2);

        // p1 is active so p2 (least recent non-active) was evicted
        let residents: Vec<String> = manager
            .list_projects()
            .await
            .unwrap()
            .into_iter()
            .filter(|p| p.resident)
            .map(|p| p.project_id)
            .collect();
        assert!(residents.contains(&"p1".to_string()));
        assert!(residents.contains(&"p3".to_string()));
    }

    #[tokio::test]
    async fn access_promotes_in_lru_order() {
        let manager = manager(2);
        manager.get_or_create("p1").await.unwrap();
        manager.get_or_create("p2").await.unwrap();
        // Touch p1 so p2 becomes the eviction candidate
        manager.get_or_create("p1").await.unwrap();
        manager.get_or_create("p3").await.unwrap();

        let residents: Vec<String> = manager
            .list_projects()
            .await
            .unwrap()
            .into_iter()
            .filter(|p| p.resident)
            .map(|p| p.project_id)
            .collect();
        assert!(residents.contains(&"p1".to_string()));
        assert!(residents.contains(&"p3".to_string()));
        assert!(!residents.contains(&"p2".to_string()));
    }

    #[tokio::test]
    async fn switch_isolation_between_projects() {
        let manager = manager(4);

        let p1 = manager.switch("p1").await.unwrap();
        p1.submit_tasks(vec![
            NewTask::new("a", "A"),
            NewTask::new("b", "B"),
            NewTask::new("c", "C"),
        ])
        .await
        .unwrap();

        // Complete one task in p1 through a lease
        let agent = Agent::new("w1", "w1", crate::models::AgentRole::Agent);
        let task = p1.assignment().find_next_task(&agent).await.unwrap().unwrap();
        let lease_id = task.lease_id.clone().unwrap();
        p1.leases().complete(&lease_id).await.unwrap();

        let p2 = manager.switch("p2").await.unwrap();
        p2.submit_tasks(vec![
            NewTask::new("x", "X"),
            NewTask::new("y", "Y"),
            NewTask::new("z", "Z"),
        ])
        .await
        .unwrap();

        let status = p2.status_summary().await;
        assert_eq!(status.total_tasks, 3);
        assert_eq!(status.completed, 0);
        assert_eq!(status.assigned, 0);

        let p1_again = manager.switch("p1").await.unwrap();
        let status = p1_again.status_summary().await;
        assert_eq!(status.total_tasks, 3);
        assert_eq!(status.completed, 1);
    }

    #[tokio::test]
    async fn eviction_is_not_destructive_with_persistence() {
        let (manager, _store) = persistent_manager(1);

        let p1 = manager.get_or_create("p1").await.unwrap();
        p1.submit_tasks(vec![NewTask::new("a", "A")]).await.unwrap();
        p1.save_state("test").await;

        // p2 evicts p1 (nothing is active)
        manager.get_or_create("p2").await.unwrap();
        assert_eq!(manager.resident_count().await, 1);

        // Re-access rehydrates p1 from its snapshot
        let p1_again = manager.get_or_create("p1").await.unwrap();
        assert_eq!(p1_again.tasks().len().await, 1);
        assert!(p1_again.tasks().get("a").await.is_some());
    }

    #[tokio::test]
    async fn create_project_auto_mode_switches_on_name_match() {
        let (manager, _store) = persistent_manager(4);

        let (first, created) = manager
            .create_project("Web App", CreateMode::NewProject, None)
            .await
            .unwrap();
        assert!(created);
        let first_id = first.project_id().to_string();
        assert!(first_id.starts_with("web-app-"));

        let (second, created) = manager
            .create_project("Web App", CreateMode::Auto, None)
            .await
            .unwrap();
        assert!(!created);
        assert_eq!(second.project_id(), first_id);

        let (third, created) = manager
            .create_project("Other App", CreateMode::Auto, None)
            .await
            .unwrap();
        assert!(created);
        assert_ne!(third.project_id(), first_id);
    }

    #[tokio::test]
    async fn select_project_mode_requires_a_match() {
        let (manager, _store) = persistent_manager(4);
        let err = manager
            .create_project("Ghost", CreateMode::SelectProject, None)
            .await
            .unwrap_err();
        assert!(err.message.contains("No project named"));
    }

    #[test]
    fn slugify_produces_identifiers() {
        assert_eq!(slugify("Web App"), "web-app");
        assert_eq!(slugify("  My  Project!! "), "my-project");
        assert_eq!(slugify("???"), "project");
    }
}
