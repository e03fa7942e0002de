//! Fluent builders for domain entities used across the test suites.

use chrono::{Duration, Utc};
use marcus_core::models::{
    Agent, AgentRole, AgentStatus, Lease, LeaseStatus, Priority, Task, TaskStatus,
};

/// Builder for [`Task`] fixtures.
///
/// Defaults to a pending, normal-priority task with no dependencies.
pub struct TaskBuilder {
    task: Task,
}

impl TaskBuilder {
    pub fn new(task_id: impl Into<String>) -> Self {
        let task_id = task_id.into();
        let now = Utc::now();
        Self {
            task: Task {
                name: format!("Task {task_id}"),
                task_id,
                description: String::new(),
                status: TaskStatus::Pending,
                priority: Priority::Normal,
                labels: vec![],
                dependencies: vec![],
                estimated_hours: 1.0,
                assigned_agent_id: None,
                lease_id: None,
                created_at: now,
                updated_at: now,
                completed_at: None,
                parent_task_id: None,
                sibling_order: None,
                dependency_types: vec![],
                provides: vec![],
                requires: vec![],
                file_artifacts: vec![],
            },
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.task.name = name.into();
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.task.description = description.into();
        self
    }

    pub fn status(mut self, status: TaskStatus) -> Self {
        self.task.status = status;
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.task.priority = priority;
        self
    }

    pub fn labels(mut self, labels: &[&str]) -> Self {
        self.task.labels = labels.iter().map(|l| l.to_string()).collect();
        self
    }

    pub fn dependencies(mut self, deps: &[&str]) -> Self {
        self.task.dependencies = deps.iter().map(|d| d.to_string()).collect();
        self
    }

    pub fn subtask_of(mut self, parent: impl Into<String>, order: i32) -> Self {
        self.task.parent_task_id = Some(parent.into());
        self.task.sibling_order = Some(order);
        self
    }

    pub fn assigned_to(mut self, agent_id: impl Into<String>) -> Self {
        self.task.status = TaskStatus::Assigned;
        self.task.assigned_agent_id = Some(agent_id.into());
        self
    }

    pub fn build(self) -> Task {
        self.task
    }
}

/// Builder for [`Agent`] fixtures, defaulting to an idle worker agent.
pub struct AgentBuilder {
    agent: Agent,
}

impl AgentBuilder {
    pub fn new(agent_id: impl Into<String>) -> Self {
        let agent_id = agent_id.into();
        Self {
            agent: Agent::new(agent_id.clone(), agent_id, AgentRole::Agent),
        }
    }

    pub fn role(mut self, role: AgentRole) -> Self {
        self.agent.role = role;
        self
    }

    pub fn capabilities(mut self, capabilities: &[&str]) -> Self {
        self.agent.capabilities = capabilities.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn status(mut self, status: AgentStatus) -> Self {
        self.agent.status = status;
        self
    }

    pub fn build(self) -> Agent {
        self.agent
    }
}

/// Builder for [`Lease`] fixtures, defaulting to a live one-hour lease.
pub struct LeaseBuilder {
    lease: Lease,
}

impl LeaseBuilder {
    pub fn new(task_id: impl Into<String>, agent_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            lease: Lease {
                lease_id: format!("lease-{}", uuid_suffix()),
                task_id: task_id.into(),
                agent_id: agent_id.into(),
                granted_at: now,
                expires_at: now + Duration::hours(1),
                renewal_count: 0,
                status: LeaseStatus::Active,
            },
        }
    }

    pub fn status(mut self, status: LeaseStatus) -> Self {
        self.lease.status = status;
        self
    }

    pub fn expired(mut self) -> Self {
        self.lease.expires_at = Utc::now() - Duration::seconds(1);
        self
    }

    pub fn build(self) -> Lease {
        self.lease
    }
}

fn uuid_suffix() -> String {
    // Nanosecond timestamp is unique enough for fixture ids
    format!("{:x}", Utc::now().timestamp_nanos_opt().unwrap_or(0))
}
