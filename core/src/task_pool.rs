//! The per-project task collection.
//!
//! The pool is the single mutation surface for task state: the validator,
//! the assignment engine and the lease manager all go through it, and every
//! mutation happens under the pool's write lock so per-task status
//! transitions stay linearizable.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::RwLock;

use crate::error::{MarcusError, Result};
use crate::models::{Task, TaskStatus};

#[derive(Default)]
struct PoolState {
    tasks: HashMap<String, Task>,
    order: Vec<String>,
}

/// Indexed task collection with stable insertion order. Cheap to clone.
#[derive(Clone, Default)]
pub struct TaskPool {
    inner: Arc<RwLock<PoolState>>,
}

impl TaskPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new task; fails if the id is already present
    pub async fn insert(&self, task: Task) -> Result<()> {
        let mut state = self.inner.write().await;
        if state.tasks.contains_key(&task.task_id) {
            return Err(MarcusError::business_logic(format!(
                "Task '{}' already exists in the pool",
                task.task_id
            ))
            .with_task(task.task_id));
        }
        state.order.push(task.task_id.clone());
        state.tasks.insert(task.task_id.clone(), task);
        Ok(())
    }

    /// Insert or replace, keeping the original position for replacements
    pub async fn upsert(&self, task: Task) {
        let mut state = self.inner.write().await;
        if !state.tasks.contains_key(&task.task_id) {
            state.order.push(task.task_id.clone());
        }
        state.tasks.insert(task.task_id.clone(), task);
    }

    pub async fn get(&self, task_id: &str) -> Option<Task> {
        self.inner.read().await.tasks.get(task_id).cloned()
    }

    /// Snapshot of every task in insertion order
    pub async fn all(&self) -> Vec<Task> {
        let state = self.inner.read().await;
        state
            .order
            .iter()
            .filter_map(|id| state.tasks.get(id).cloned())
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.tasks.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.tasks.is_empty()
    }

    /// Apply a closure to one task under the write lock
    pub async fn update<R>(
        &self,
        task_id: &str,
        f: impl FnOnce(&mut Task) -> Result<R>,
    ) -> Result<R> {
        let mut state = self.inner.write().await;
        let task = state.tasks.get_mut(task_id).ok_or_else(|| {
            MarcusError::business_logic(format!("Task '{task_id}' not found"))
                .with_task(task_id.to_string())
        })?;
        let result = f(task)?;
        task.updated_at = Utc::now();
        Ok(result)
    }

    /// Validated status transition; returns the updated task
    pub async fn transition(&self, task_id: &str, next: TaskStatus) -> Result<Task> {
        self.update(task_id, |task| {
            if !task.status.can_transition_to(next) {
                return Err(MarcusError::business_logic(format!(
                    "Task '{}' cannot move from {} to {next}",
                    task.task_id, task.status
                ))
                .with_task(task.task_id.clone()));
            }
            task.status = next;
            if next == TaskStatus::Completed {
                task.completed_at = Some(Utc::now());
            }
            Ok(task.clone())
        })
        .await
    }

    /// Replace the whole pool, e.g. after validator repair or rehydration
    pub async fn replace_all(&self, tasks: Vec<Task>) {
        let mut state = self.inner.write().await;
        state.order = tasks.iter().map(|t| t.task_id.clone()).collect();
        state.tasks = tasks.into_iter().map(|t| (t.task_id.clone(), t)).collect();
    }

    /// Task ids of every completed task
    pub async fn completed_ids(&self) -> std::collections::HashSet<String> {
        let state = self.inner.read().await;
        state
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Completed)
            .map(|t| t.task_id.clone())
            .collect()
    }

    /// Status histogram for project summaries
    pub async fn counts_by_status(&self) -> HashMap<TaskStatus, usize> {
        let state = self.inner.read().await;
        let mut counts = HashMap::new();
        for task in state.tasks.values() {
            *counts.entry(task.status).or_insert(0) += 1;
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewTask;

    fn task(id: &str) -> Task {
        NewTask::new(id, format!("Task {id}")).into_task(Utc::now())
    }

    #[tokio::test]
    async fn insert_rejects_duplicates() {
        let pool = TaskPool::new();
        pool.insert(task("t1")).await.unwrap();
        assert!(pool.insert(task("t1")).await.is_err());
        assert_eq!(pool.len().await, 1);
    }

    #[tokio::test]
    async fn all_preserves_insertion_order() {
        let pool = TaskPool::new();
        for id in ["b", "a", "c"] {
            pool.insert(task(id)).await.unwrap();
        }
        let ids: Vec<String> = pool.all().await.into_iter().map(|t| t.task_id).collect();
        assert_eq!(ids, vec!["b", "a", "c"]);
    }

    #[tokio::test]
    async fn transition_validates_the_state_machine() {
        let pool = TaskPool::new();
        pool.insert(task("t1")).await.unwrap();

        pool.transition("t1", TaskStatus::Assigned).await.unwrap();
        let t = pool.transition("t1", TaskStatus::Completed).await.unwrap();
        assert!(t.completed_at.is_some());

        // Completed is terminal
        assert!(pool.transition("t1", TaskStatus::Pending).await.is_err());
    }

    #[tokio::test]
    async fn update_missing_task_is_an_error() {
        let pool = TaskPool::new();
        let err = pool
            .update("ghost", |_| Ok(()))
            .await
            .unwrap_err();
        assert!(err.message.contains("not found"));
    }

    #[tokio::test]
    async fn counts_by_status_reflects_transitions() {
        let pool = TaskPool::new();
        pool.insert(task("t1")).await.unwrap();
        pool.insert(task("t2")).await.unwrap();
        pool.transition("t1", TaskStatus::Assigned).await.unwrap();

        let counts = pool.counts_by_status().await;
        assert_eq!(counts.get(&TaskStatus::Pending), Some(&1));
        assert_eq!(counts.get(&TaskStatus::Assigned), Some(&1));
    }
}
