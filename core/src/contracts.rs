//! Contracts for external collaborators.
//!
//! The project generator, the AI task classifier, the Kanban sync sink and
//! the history consumer live outside this crate; the engine only depends
//! on the traits here. Default no-op implementations keep the server fully
//! functional when no collaborator is configured.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::events::EventHandler;
use crate::models::{Agent, Event, NewTask, Task};
use crate::resilience::{CircuitBreaker, RetryPolicy};

/// Options forwarded to the natural-language project generator
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProducerOptions {
    /// Upper bound on generated tasks
    pub max_tasks: Option<usize>,
    /// Free-form generation mode hint
    pub mode: Option<String>,
}

/// Produces a task list from a project description.
///
/// Returned dependencies should reference ids within the same list; the
/// validator repairs stragglers, but producers are expected to try.
#[async_trait]
pub trait TaskProducer: Send + Sync {
    async fn generate(&self, description: &str, options: &ProducerOptions) -> Result<Vec<NewTask>>;
}

/// Score returned by the AI classifier for a (task, agent) pair
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierScore {
    pub score: f64,
    pub reasoning: String,
}

/// AI-assisted task/agent fit scoring.
///
/// Calls are suspension points wrapped in a circuit breaker by the
/// assignment engine; timeouts and failures are recoverable and degrade to
/// the deterministic score without surfacing to callers.
#[async_trait]
pub trait TaskClassifier: Send + Sync {
    async fn classify(&self, task: &Task, agent: &Agent) -> Result<ClassifierScore>;
}

/// Downstream Kanban board synchronization.
///
/// `apply` must be idempotent: the bus offers no at-least-once guarantee
/// and retries may redeliver an event the sink already processed.
#[async_trait]
pub trait KanbanSink: Send + Sync {
    async fn apply(&self, event: &Event) -> Result<()>;

    fn provider(&self) -> &str {
        "none"
    }
}

/// Sink used when no Kanban provider is configured
pub struct NullKanban;

#[async_trait]
impl KanbanSink for NullKanban {
    async fn apply(&self, _event: &Event) -> Result<()> {
        Ok(())
    }
}

/// Event-bus subscriber that forwards events to a Kanban sink behind the
/// standard resilience stack (retry inside a circuit breaker).
pub struct KanbanSubscriber {
    sink: Arc<dyn KanbanSink>,
    retry: RetryPolicy,
    breaker: Arc<CircuitBreaker>,
}

impl KanbanSubscriber {
    pub fn new(sink: Arc<dyn KanbanSink>, retry: RetryPolicy, breaker: Arc<CircuitBreaker>) -> Self {
        Self {
            sink,
            retry,
            breaker,
        }
    }
}

#[async_trait]
impl EventHandler for KanbanSubscriber {
    async fn handle(&self, event: &Event) -> Result<()> {
        let retry = self.retry.clone();
        let sink = Arc::clone(&self.sink);
        self.breaker
            .call(|| async move {
                retry
                    .run(|| {
                        let sink = Arc::clone(&sink);
                        async move { sink.apply(event).await }
                    })
                    .await
            })
            .await
    }
}
