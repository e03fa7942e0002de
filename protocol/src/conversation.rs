//! Append-only conversation log.
//!
//! Every tool request and response is appended as one JSON line. The file
//! is the authoritative mapping from a project to the task ids discussed
//! within it, consumed by the post-project analyzer; a bounded in-memory
//! tail backs the conversation excerpts in `get_task_context`.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use marcus_core::error::{MarcusError, Result};
use marcus_core::persistence::{collections, Persistence};

/// In-memory tail size for conversation excerpts
const RECENT_CAPACITY: usize = 1000;

/// Message flow direction relative to the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Request,
    Response,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConversationMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_type: Option<String>,
}

/// One structured line of the conversation log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationEntry {
    pub timestamp: DateTime<Utc>,
    pub direction: Direction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    pub content: Value,
    #[serde(default)]
    pub metadata: ConversationMetadata,
}

struct LogInner {
    path: Option<PathBuf>,
    file: Mutex<Option<tokio::fs::File>>,
    recent: std::sync::Mutex<VecDeque<ConversationEntry>>,
    index: Option<Arc<dyn Persistence>>,
}

/// JSONL conversation logger. Cheap to clone.
#[derive(Clone)]
pub struct ConversationLog {
    inner: Arc<LogInner>,
}

impl ConversationLog {
    /// A log that keeps only the in-memory tail (tests, ephemeral runs)
    pub fn in_memory() -> Self {
        Self::build(None, None)
    }

    /// A log that appends to `path` and maintains the project → task-id
    /// index in the `conversation_index` collection
    pub fn new(path: impl Into<PathBuf>, index: Option<Arc<dyn Persistence>>) -> Self {
        Self::build(Some(path.into()), index)
    }

    fn build(path: Option<PathBuf>, index: Option<Arc<dyn Persistence>>) -> Self {
        Self {
            inner: Arc::new(LogInner {
                path,
                file: Mutex::new(None),
                recent: std::sync::Mutex::new(VecDeque::with_capacity(RECENT_CAPACITY)),
                index,
            }),
        }
    }

    /// Append one entry; file write failures are surfaced, index updates
    /// are best-effort.
    pub async fn append(&self, entry: ConversationEntry) -> Result<()> {
        {
            let mut recent = self.inner.recent.lock().unwrap();
            if recent.len() >= RECENT_CAPACITY {
                recent.pop_front();
            }
            recent.push_back(entry.clone());
        }

        if self.inner.path.is_some() {
            let line = serde_json::to_string(&entry).map_err(|e| {
                MarcusError::storage(format!("Failed to serialize conversation entry: {e}"))
            })?;
            let mut guard = self.inner.file.lock().await;
            if guard.is_none() {
                let path = self.inner.path.as_ref().unwrap();
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent).await.map_err(|e| {
                        MarcusError::storage_unavailable(format!(
                            "Failed to create log directory {}: {e}",
                            parent.display()
                        ))
                    })?;
                }
                let file = tokio::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .await
                    .map_err(|e| {
                        MarcusError::storage_unavailable(format!(
                            "Failed to open conversation log {}: {e}",
                            path.display()
                        ))
                    })?;
                *guard = Some(file);
            }
            let file = guard.as_mut().unwrap();
            file.write_all(line.as_bytes()).await.map_err(|e| {
                MarcusError::storage_unavailable(format!("Failed to append conversation log: {e}"))
            })?;
            file.write_all(b"\n").await.map_err(|e| {
                MarcusError::storage_unavailable(format!("Failed to append conversation log: {e}"))
            })?;
        }

        self.update_index(&entry).await;
        Ok(())
    }

    /// Recent entries touching one task of one project, oldest first.
    ///
    /// Task ids are only unique within a project, so the tail is scoped by
    /// both fields.
    pub fn recent_for_task(
        &self,
        project_id: &str,
        task_id: &str,
        limit: usize,
    ) -> Vec<ConversationEntry> {
        let recent = self.inner.recent.lock().unwrap();
        let matching: Vec<ConversationEntry> = recent
            .iter()
            .filter(|e| {
                e.metadata.project_id.as_deref() == Some(project_id)
                    && e.metadata.task_id.as_deref() == Some(task_id)
            })
            .cloned()
            .collect();
        let skip = matching.len().saturating_sub(limit);
        matching.into_iter().skip(skip).collect()
    }

    /// Maintain the project → task-ids index entry for this project
    async fn update_index(&self, entry: &ConversationEntry) {
        let (Some(index), Some(project_id), Some(task_id)) = (
            &self.inner.index,
            &entry.metadata.project_id,
            &entry.metadata.task_id,
        ) else {
            return;
        };

        let current = match index
            .retrieve(collections::CONVERSATION_INDEX, project_id)
            .await
        {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!(project_id, error = %err, "Conversation index read failed");
                return;
            }
        };

        let mut task_ids: Vec<String> = current
            .as_ref()
            .and_then(|v| v.get("task_ids"))
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default();
        if task_ids.iter().any(|t| t == task_id) {
            return;
        }
        task_ids.push(task_id.clone());

        let record = serde_json::json!({
            "project_id": project_id,
            "task_ids": task_ids,
        });
        if let Err(err) = index
            .store(collections::CONVERSATION_INDEX, project_id, record)
            .await
        {
            tracing::warn!(project_id, error = %err, "Conversation index write failed");
        }
    }
}
