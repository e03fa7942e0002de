//! Canned task producer double.

use async_trait::async_trait;
use parking_lot::Mutex;

use marcus_core::contracts::{ProducerOptions, TaskProducer};
use marcus_core::error::Result;
use marcus_core::models::NewTask;

/// Producer that returns a fixed task list regardless of the description.
pub struct StaticProducer {
    tasks: Mutex<Vec<NewTask>>,
}

impl StaticProducer {
    pub fn new(tasks: Vec<NewTask>) -> Self {
        Self {
            tasks: Mutex::new(tasks),
        }
    }

    /// A three-task plan with one deliberately broken dependency, to
    /// exercise the validator on ingestion.
    pub fn sample_plan() -> Self {
        Self::new(vec![
            NewTask::new("design", "Design the feature"),
            NewTask::new("build", "Build the feature").with_dependencies(&["design", "missing"]),
            NewTask::new("docs", "README update").with_labels(&["final"]),
        ])
    }
}

#[async_trait]
impl TaskProducer for StaticProducer {
    async fn generate(
        &self,
        _description: &str,
        options: &ProducerOptions,
    ) -> Result<Vec<NewTask>> {
        let mut tasks = self.tasks.lock().clone();
        if let Some(max) = options.max_tasks {
            tasks.truncate(max);
        }
        Ok(tasks)
    }
}
