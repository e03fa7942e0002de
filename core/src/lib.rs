//! Marcus Coordination Core
//!
//! This crate provides the coordination engine for the Marcus multi-agent
//! server: the domain models, the task-graph validator, the assignment
//! engine, the lease manager, the event bus and the project context cache,
//! together with the persistence trait and the resilience strategies that
//! wrap external collaborators. The outer crates (persistence backends,
//! tool protocol, server binary) depend on the types and traits defined
//! here.
//!
//! # Architecture
//!
//! - [`models`] - Domain entities (Task, Agent, Lease, Decision, Event)
//! - [`error`] - The tagged error envelope and result alias
//! - [`persistence`] - The collection-store trait and its helpers
//! - [`validator`] - Task-graph auto-repair and strict validation
//! - [`events`] - In-process pub/sub with handler isolation
//! - [`task_pool`] - The per-project task collection
//! - [`lease`] - Time-bounded lease grant/renew/expire/reclaim
//! - [`assignment`] - Deterministic task selection for agents
//! - [`context`] - Project contexts and the LRU context manager
//! - [`resilience`] - Retry, circuit breaker and fallback combinators
//! - [`contracts`] - Traits for the external collaborators
//!
//! # Example
//!
//! ```rust
//! use marcus_core::context::{ContextConfig, ProjectContextManager};
//! use marcus_core::models::{Agent, AgentRole, NewTask};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> marcus_core::Result<()> {
//! let manager = ProjectContextManager::new(ContextConfig::default(), None);
//! let project = manager.switch("demo").await?;
//! project
//!     .submit_tasks(vec![NewTask::new("t1", "Design the API")])
//!     .await?;
//!
//! let worker = Agent::new("worker-1", "Worker", AgentRole::Agent);
//! let task = project.assignment().find_next_task(&worker).await?;
//! assert!(task.is_some());
//! # Ok(())
//! # }
//! ```

pub mod assignment;
pub mod context;
pub mod contracts;
pub mod error;
pub mod events;
pub mod lease;
pub mod models;
pub mod persistence;
pub mod resilience;
pub mod task_pool;
pub mod validator;

// Re-export the types most callers need at the crate root
pub use assignment::AssignmentEngine;
pub use context::{
    AgentRegistry, ContextConfig, CreateMode, ProjectContext, ProjectContextManager, ProjectInfo,
    ProjectState, ProjectStatus,
};
pub use contracts::{
    ClassifierScore, KanbanSink, KanbanSubscriber, NullKanban, ProducerOptions, TaskClassifier,
    TaskProducer,
};
pub use error::{ErrorCode, ErrorContext, ErrorKind, MarcusError, Result};
pub use events::{EventBus, EventHandler, FnHandler, SubscriptionId};
pub use lease::LeaseManager;
pub use models::{
    event_types, Agent, AgentRole, AgentStatus, ArtifactMeta, Decision, DependencyType, Event,
    Impact, Lease, LeaseStatus, NewTask, Priority, Task, TaskStatus,
};
pub use persistence::{Persistence, ProjectStore, MAX_QUERY_LIMIT};
pub use resilience::{CircuitBreaker, CircuitState, RetryPolicy};
pub use task_pool::TaskPool;

/// Current version of the core crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Current crate name
pub const CRATE_NAME: &str = env!("CARGO_PKG_NAME");
