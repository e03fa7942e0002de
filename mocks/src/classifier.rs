//! Scripted classifier double.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use marcus_core::contracts::{ClassifierScore, TaskClassifier};
use marcus_core::error::{MarcusError, Result};
use marcus_core::models::{Agent, Task};

enum Step {
    Score(f64),
    Fail,
}

/// Classifier that replays a script of scores and failures.
///
/// When the script is exhausted it keeps returning the last configured
/// behavior (or a neutral 0.5 score when no script was given).
pub struct ScriptedClassifier {
    script: Mutex<VecDeque<Step>>,
    last: Mutex<Option<f64>>,
    calls: AtomicUsize,
}

impl ScriptedClassifier {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            last: Mutex::new(None),
            calls: AtomicUsize::new(0),
        }
    }

    /// Queue a successful classification with the given score
    pub fn then_score(self, score: f64) -> Self {
        self.script.lock().push_back(Step::Score(score));
        self
    }

    /// Queue `n` consecutive failures
    pub fn then_fail(self, n: usize) -> Self {
        for _ in 0..n {
            self.script.lock().push_back(Step::Fail);
        }
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Default for ScriptedClassifier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskClassifier for ScriptedClassifier {
    async fn classify(&self, task: &Task, _agent: &Agent) -> Result<ClassifierScore> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let step = self.script.lock().pop_front();
        match step {
            Some(Step::Score(score)) => {
                *self.last.lock() = Some(score);
                Ok(ClassifierScore {
                    score,
                    reasoning: format!("scripted score for '{}'", task.task_id),
                })
            }
            Some(Step::Fail) => Err(MarcusError::integration("scripted classifier failure")),
            None => {
                let score = self.last.lock().unwrap_or(0.5);
                Ok(ClassifierScore {
                    score,
                    reasoning: "default score".to_string(),
                })
            }
        }
    }
}
