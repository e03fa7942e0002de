use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Canonical event type names emitted by the coordination engine.
///
/// Subscribers (Kanban sink, history consumer) match on these strings;
/// `events::EventBus::subscribe` also accepts the universal topic `"*"`.
pub mod event_types {
    pub const TASK_CREATED: &str = "TaskCreated";
    pub const TASK_ASSIGNED: &str = "TaskAssigned";
    pub const TASK_STARTED: &str = "TaskStarted";
    pub const TASK_COMPLETED: &str = "TaskCompleted";
    pub const TASK_BLOCKED: &str = "TaskBlocked";
    pub const LEASE_EXPIRED: &str = "LeaseExpired";
    pub const LEASE_RECLAIMED: &str = "LeaseReclaimed";
    pub const AGENT_REGISTERED: &str = "AgentRegistered";
    pub const PROJECT_STATE_CHANGED: &str = "ProjectStateChanged";
    pub const ASSIGNMENT_FAILED: &str = "AssignmentFailed";
}

/// A unit of work in a project's task graph.
///
/// Tasks are identified by a stable string id, carry an ordered dependency
/// list (duplicates tolerated), and move through a validated lifecycle.
/// Subtasks produced by decomposition live in the same flat pool with a
/// `parent_task_id` link and are scheduled like any other task; the sibling
/// `order` only acts as an assignment tiebreaker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    /// Stable identifier, unique within a project
    pub task_id: String,
    /// Brief task title
    pub name: String,
    /// Detailed requirements
    pub description: String,
    /// Current lifecycle status
    pub status: TaskStatus,
    /// Scheduling priority
    pub priority: Priority,
    /// Label tokens; `documentation`, `final` and `verification` are
    /// semantically significant, and any token containing `README` marks
    /// a final task
    #[serde(default)]
    pub labels: Vec<String>,
    /// Ordered list of task ids this task depends on
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Estimated effort in hours
    #[serde(default)]
    pub estimated_hours: f64,
    /// Agent currently (or last) assigned
    pub assigned_agent_id: Option<String>,
    /// Lease currently held on this task
    pub lease_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,

    // Subtask extensions; defaulted for plain tasks
    /// Parent task when this entry is a decomposed subtask
    #[serde(default)]
    pub parent_task_id: Option<String>,
    /// Stable ordinal among siblings of the same parent
    #[serde(default)]
    pub sibling_order: Option<i32>,
    /// Parallel to `dependencies`; missing entries default to hard
    #[serde(default)]
    pub dependency_types: Vec<DependencyType>,
    /// Capability tokens this subtask provides to later siblings
    #[serde(default)]
    pub provides: Vec<String>,
    /// Capability tokens this subtask requires from earlier siblings
    #[serde(default)]
    pub requires: Vec<String>,
    /// Paths produced while working the task
    #[serde(default)]
    pub file_artifacts: Vec<String>,
}

/// Task lifecycle states.
///
/// The scheduler only hands out `Pending` tasks whose dependencies are all
/// `Completed`. Lease reclamation moves `Assigned`/`InProgress` tasks back
/// to `Pending`. `Completed` is terminal; `Failed` may be re-queued.
#[derive(Debug, Clone, Copy, Hash, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Assigned,
    InProgress,
    Blocked,
    Completed,
    Failed,
}

impl TaskStatus {
    /// Check whether a transition to `next` is allowed
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        match (self, next) {
            (current, new) if current == new => false,
            (Pending, Assigned) => true,
            // Pending again means the lease was reclaimed
            (Assigned, InProgress | Blocked | Completed | Failed | Pending) => true,
            (InProgress, Blocked | Completed | Failed | Pending) => true,
            (Blocked, InProgress | Pending | Failed) => true,
            (Failed, Pending) => true,
            (Completed, _) => false,
            _ => false,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Assigned => "assigned",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = crate::error::MarcusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "assigned" => Ok(TaskStatus::Assigned),
            "in_progress" => Ok(TaskStatus::InProgress),
            "blocked" => Ok(TaskStatus::Blocked),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(crate::error::MarcusError::business_logic(format!(
                "Unknown task status '{other}'"
            ))),
        }
    }
}

/// Scheduling priority, ordinal for the assignment score
#[derive(Debug, Clone, Copy, Hash, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Urgent,
    High,
    Normal,
    Low,
}

impl Priority {
    /// Ordinal weight used as the first assignment tiebreak
    pub fn ordinal(self) -> u32 {
        match self {
            Priority::Urgent => 10,
            Priority::High => 3,
            Priority::Normal => 1,
            Priority::Low => 0,
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

/// Dependency strength for subtask edges. Soft edges order work but do not
/// block eligibility.
#[derive(Debug, Clone, Copy, Hash, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DependencyType {
    Hard,
    Soft,
}

impl Default for DependencyType {
    fn default() -> Self {
        DependencyType::Hard
    }
}

impl Task {
    /// Labels that exclude a task from the implementation partition
    const NON_IMPLEMENTATION_LABELS: [&'static str; 3] =
        ["documentation", "final", "verification"];

    /// Whether this task counts as implementation work for final-task closure
    pub fn is_implementation_task(&self) -> bool {
        !self
            .labels
            .iter()
            .any(|l| Self::NON_IMPLEMENTATION_LABELS.contains(&l.as_str()))
    }

    /// Whether this task represents end-of-project work that must run last
    pub fn is_final_task(&self) -> bool {
        self.labels
            .iter()
            .any(|l| l == "final" || l == "verification" || l.contains("README"))
            || self.name.contains("README")
    }

    /// Strength of the dependency edge at `index`; absent entries are hard
    pub fn dependency_type(&self, index: usize) -> DependencyType {
        self.dependency_types
            .get(index)
            .copied()
            .unwrap_or_default()
    }

    /// Dependency ids that block eligibility (hard edges only)
    pub fn blocking_dependencies(&self) -> impl Iterator<Item = &str> {
        self.dependencies
            .iter()
            .enumerate()
            .filter(|(i, _)| self.dependency_type(*i) == DependencyType::Hard)
            .map(|(_, d)| d.as_str())
    }

    /// Keywords used for capability matching: the union of labels and
    /// normalized tokens from the name and description.
    pub fn keyword_set(&self) -> BTreeSet<String> {
        let mut keywords: BTreeSet<String> =
            self.labels.iter().map(|l| l.to_lowercase()).collect();
        for text in [&self.name, &self.description] {
            for token in normalize_tokens(text) {
                keywords.insert(token);
            }
        }
        keywords
    }
}

/// Lowercase alphanumeric tokens of length >= 3 from free text
pub fn normalize_tokens(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() >= 3)
        .map(|t| t.to_lowercase())
}

/// Data transfer object for task submissions from the producer.
///
/// The validator repairs the dependency structure before tasks enter the
/// pool, so producer output is accepted with minimal checks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewTask {
    pub task_id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub estimated_hours: f64,
    #[serde(default)]
    pub parent_task_id: Option<String>,
    #[serde(default)]
    pub sibling_order: Option<i32>,
    #[serde(default)]
    pub dependency_types: Vec<DependencyType>,
    #[serde(default)]
    pub provides: Vec<String>,
    #[serde(default)]
    pub requires: Vec<String>,
}

impl NewTask {
    /// Minimal constructor used throughout the tests
    pub fn new(task_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            name: name.into(),
            description: String::new(),
            priority: Priority::Normal,
            labels: vec![],
            dependencies: vec![],
            estimated_hours: 0.0,
            parent_task_id: None,
            sibling_order: None,
            dependency_types: vec![],
            provides: vec![],
            requires: vec![],
        }
    }

    pub fn with_dependencies(mut self, deps: &[&str]) -> Self {
        self.dependencies = deps.iter().map(|d| d.to_string()).collect();
        self
    }

    pub fn with_labels(mut self, labels: &[&str]) -> Self {
        self.labels = labels.iter().map(|l| l.to_string()).collect();
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Materialize the pending task with creation timestamps
    pub fn into_task(self, now: DateTime<Utc>) -> Task {
        Task {
            task_id: self.task_id,
            name: self.name,
            description: self.description,
            status: TaskStatus::Pending,
            priority: self.priority,
            labels: self.labels,
            dependencies: self.dependencies,
            estimated_hours: self.estimated_hours,
            assigned_agent_id: None,
            lease_id: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
            parent_task_id: self.parent_task_id,
            sibling_order: self.sibling_order,
            dependency_types: self.dependency_types,
            provides: self.provides,
            requires: self.requires,
            file_artifacts: vec![],
        }
    }
}

/// Role under which a client session operates. The role gates the tool set.
#[derive(Debug, Clone, Copy, Hash, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Observer,
    Developer,
    Agent,
    Admin,
}

impl std::fmt::Display for AgentRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AgentRole::Observer => "observer",
            AgentRole::Developer => "developer",
            AgentRole::Agent => "agent",
            AgentRole::Admin => "admin",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for AgentRole {
    type Err = crate::error::MarcusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "observer" => Ok(AgentRole::Observer),
            "developer" => Ok(AgentRole::Developer),
            "agent" => Ok(AgentRole::Agent),
            "admin" => Ok(AgentRole::Admin),
            other => Err(crate::error::MarcusError::business_logic(format!(
                "Unknown role '{other}'"
            ))),
        }
    }
}

/// Worker agent availability
#[derive(Debug, Clone, Copy, Hash, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Idle,
    Working,
    Offline,
}

/// A registered worker agent.
///
/// Capability tokens are matched case-insensitively against task keywords.
/// An agent holds at most one live lease at a time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Agent {
    pub agent_id: String,
    pub name: String,
    pub role: AgentRole,
    #[serde(default)]
    pub capabilities: Vec<String>,
    pub status: AgentStatus,
    pub current_task_id: Option<String>,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

impl Agent {
    pub fn new(agent_id: impl Into<String>, name: impl Into<String>, role: AgentRole) -> Self {
        let now = Utc::now();
        Self {
            agent_id: agent_id.into(),
            name: name.into(),
            role,
            capabilities: vec![],
            status: AgentStatus::Idle,
            current_task_id: None,
            registered_at: now,
            last_heartbeat: now,
        }
    }

    pub fn with_capabilities(mut self, capabilities: &[&str]) -> Self {
        self.capabilities = capabilities.iter().map(|c| c.to_string()).collect();
        self
    }

    /// Lowercased capability set used by the assignment score
    pub fn capability_set(&self) -> BTreeSet<String> {
        self.capabilities.iter().map(|c| c.to_lowercase()).collect()
    }
}

/// Lease lifecycle states.
///
/// `Active` and `Renewed` are the live states; `Completed`, `Expired` and
/// `Reclaimed` are terminal. For a given task at most one lease is live.
#[derive(Debug, Clone, Copy, Hash, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LeaseStatus {
    Active,
    Renewed,
    Completed,
    Expired,
    Reclaimed,
}

impl LeaseStatus {
    pub fn is_live(self) -> bool {
        matches!(self, LeaseStatus::Active | LeaseStatus::Renewed)
    }

    /// Check whether a transition to `next` is allowed
    pub fn can_transition_to(self, next: LeaseStatus) -> bool {
        use LeaseStatus::*;
        match (self, next) {
            (Active, Renewed | Completed | Expired | Reclaimed) => true,
            (Renewed, Renewed | Completed | Expired | Reclaimed) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for LeaseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LeaseStatus::Active => "active",
            LeaseStatus::Renewed => "renewed",
            LeaseStatus::Completed => "completed",
            LeaseStatus::Expired => "expired",
            LeaseStatus::Reclaimed => "reclaimed",
        };
        write!(f, "{s}")
    }
}

/// Time-bounded exclusive permission for one agent to work on one task
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Lease {
    pub lease_id: String,
    pub task_id: String,
    pub agent_id: String,
    pub granted_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub renewal_count: u32,
    pub status: LeaseStatus,
}

impl Lease {
    pub fn is_live(&self) -> bool {
        self.status.is_live()
    }

    pub fn is_past_expiry(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

/// Severity of a logged decision's consequences
#[derive(Debug, Clone, Copy, Hash, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Impact {
    Low,
    Medium,
    Major,
    Critical,
}

/// An append-only record of a decision an agent made while working a task
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Decision {
    pub decision_id: String,
    pub task_id: String,
    pub agent_id: String,
    pub timestamp: DateTime<Utc>,
    pub what: String,
    pub why: String,
    pub impact: Impact,
    #[serde(default)]
    pub affected_tasks: Vec<String>,
    /// Clamped to [0, 1]
    pub confidence: f64,
}

impl Decision {
    /// Build a decision with a fresh id; confidence is clamped to [0, 1]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        task_id: impl Into<String>,
        agent_id: impl Into<String>,
        what: impl Into<String>,
        why: impl Into<String>,
        impact: Impact,
        affected_tasks: Vec<String>,
        confidence: f64,
    ) -> Self {
        Self {
            decision_id: uuid::Uuid::new_v4().to_string(),
            task_id: task_id.into(),
            agent_id: agent_id.into(),
            timestamp: Utc::now(),
            what: what.into(),
            why: why.into(),
            impact,
            affected_tasks,
            confidence: confidence.clamp(0.0, 1.0),
        }
    }
}

/// Append-only metadata about a file an agent produced
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ArtifactMeta {
    pub artifact_id: String,
    pub task_id: String,
    pub agent_id: String,
    pub timestamp: DateTime<Utc>,
    pub artifact_type: String,
    pub filename: String,
    pub relative_path: String,
    pub absolute_path: String,
    pub description: String,
    pub file_size_bytes: u64,
    pub sha256_hash: String,
}

/// An immutable event published on a project's bus.
///
/// Timestamps are timezone-aware UTC; legacy naive timestamps read from
/// storage are interpreted as UTC.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub source: String,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl Event {
    /// Stamp identity and timestamp on a new event
    pub fn new(
        event_type: impl Into<String>,
        source: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            event_type: event_type.into(),
            source: source.into(),
            data,
            metadata: serde_json::Value::Null,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str, name: &str) -> Task {
        NewTask::new(id, name).into_task(Utc::now())
    }

    #[test]
    fn task_status_transitions() {
        use TaskStatus::*;

        assert!(Pending.can_transition_to(Assigned));
        assert!(!Pending.can_transition_to(Completed));
        assert!(!Pending.can_transition_to(Pending));

        assert!(Assigned.can_transition_to(InProgress));
        assert!(Assigned.can_transition_to(Pending)); // reclaim
        assert!(Assigned.can_transition_to(Completed));

        assert!(InProgress.can_transition_to(Blocked));
        assert!(InProgress.can_transition_to(Completed));
        assert!(InProgress.can_transition_to(Pending)); // reclaim

        assert!(Blocked.can_transition_to(InProgress));
        assert!(Failed.can_transition_to(Pending));

        // Completed is terminal
        for next in [Pending, Assigned, InProgress, Blocked, Failed] {
            assert!(!Completed.can_transition_to(next));
        }
    }

    #[test]
    fn lease_status_transitions() {
        use LeaseStatus::*;

        assert!(Active.can_transition_to(Renewed));
        assert!(Active.can_transition_to(Completed));
        assert!(Active.can_transition_to(Reclaimed));
        assert!(Renewed.can_transition_to(Renewed));
        assert!(Renewed.can_transition_to(Expired));

        for terminal in [Completed, Expired, Reclaimed] {
            for next in [Active, Renewed, Completed, Expired, Reclaimed] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn priority_ordinals() {
        assert_eq!(Priority::Urgent.ordinal(), 10);
        assert_eq!(Priority::High.ordinal(), 3);
        assert_eq!(Priority::Normal.ordinal(), 1);
        assert_eq!(Priority::Low.ordinal(), 0);
    }

    #[test]
    fn final_task_detection() {
        let mut t = task("t1", "Write docs");
        assert!(!t.is_final_task());
        assert!(t.is_implementation_task());

        t.labels = vec!["final".to_string()];
        assert!(t.is_final_task());
        assert!(!t.is_implementation_task());

        let readme = task("t2", "README update");
        assert!(readme.is_final_task());
        // Name-only README tasks stay in the implementation partition
        assert!(readme.is_implementation_task());

        let mut labeled = task("t3", "Wrap up");
        labeled.labels = vec!["update-README".to_string()];
        assert!(labeled.is_final_task());
    }

    #[test]
    fn keyword_set_unions_labels_and_tokens() {
        let mut t = task("t1", "Build REST API");
        t.description = "HTTP endpoints in Python".to_string();
        t.labels = vec!["backend".to_string()];

        let keywords = t.keyword_set();
        assert!(keywords.contains("backend"));
        assert!(keywords.contains("rest"));
        assert!(keywords.contains("api"));
        assert!(keywords.contains("python"));
        assert!(keywords.contains("http"));
        // Short tokens are dropped
        assert!(!keywords.contains("in"));
    }

    #[test]
    fn soft_dependencies_do_not_block() {
        let mut t = task("t1", "Subtask");
        t.dependencies = vec!["a".to_string(), "b".to_string()];
        t.dependency_types = vec![DependencyType::Hard, DependencyType::Soft];

        let blocking: Vec<&str> = t.blocking_dependencies().collect();
        assert_eq!(blocking, vec!["a"]);

        // Missing type entries default to hard
        t.dependency_types.clear();
        let blocking: Vec<&str> = t.blocking_dependencies().collect();
        assert_eq!(blocking, vec!["a", "b"]);
    }

    #[test]
    fn decision_clamps_confidence() {
        let d = Decision::new("t1", "a1", "chose sqlite", "simpler", Impact::Low, vec![], 1.7);
        assert_eq!(d.confidence, 1.0);
        let d = Decision::new("t1", "a1", "chose sqlite", "simpler", Impact::Low, vec![], -0.2);
        assert_eq!(d.confidence, 0.0);
    }

    #[test]
    fn event_stamps_identity() {
        let e = Event::new(event_types::TASK_CREATED, "test", serde_json::json!({"task_id": "t1"}));
        assert!(!e.event_id.is_empty());
        assert_eq!(e.event_type, "TaskCreated");
    }
}
