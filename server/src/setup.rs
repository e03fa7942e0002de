//! Application wiring: persistence backend, context manager, dispatcher.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use marcus_core::context::ProjectContextManager;
use marcus_core::contracts::NullKanban;
use marcus_core::persistence::Persistence;
use persistence::{FilePersistence, MemoryPersistence, SqlitePersistence};
use protocol::{ConversationLog, ToolDispatcher};

use crate::config::{BackendKind, Config, KanbanProvider};

/// Build the configured persistence backend.
///
/// A corrupt relational store surfaces as a fatal storage error, which the
/// binary maps to exit code 3.
pub async fn build_persistence(config: &Config) -> Result<Arc<dyn Persistence>> {
    let backend: Arc<dyn Persistence> = match config.persistence.backend {
        BackendKind::Relational => {
            let path = config.persistence_path();
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create data directory {}", parent.display())
                })?;
            }
            let path = path
                .to_str()
                .context("Persistence path is not valid UTF-8")?
                .to_string();
            info!(path = %path, "Opening relational persistence");
            Arc::new(
                SqlitePersistence::open(&path, config.persistence.pool_size)
                    .await
                    .map_err(anyhow::Error::new)?,
            )
        }
        BackendKind::File => {
            let path = config.persistence_path();
            info!(path = %path.display(), "Opening file-tree persistence");
            Arc::new(FilePersistence::new(path).await.map_err(anyhow::Error::new)?)
        }
        BackendKind::Memory => {
            info!("Using in-memory persistence; state will not survive restarts");
            Arc::new(MemoryPersistence::new())
        }
    };

    backend.health_check().await.map_err(anyhow::Error::new)?;
    Ok(backend)
}

/// Assemble the context manager and the tool dispatcher.
pub async fn initialize_app(config: &Config) -> Result<Arc<ToolDispatcher>> {
    let store = build_persistence(config).await?;

    let mut manager = ProjectContextManager::new(config.context_config(), Some(store.clone()));
    match config.kanban.provider {
        KanbanProvider::None => {}
        provider => {
            // Provider clients are external collaborators; without one
            // wired in, events are accepted and dropped.
            warn!(
                ?provider,
                "Kanban provider configured but no client is bundled; using a null sink"
            );
            manager = manager.with_kanban(Arc::new(NullKanban));
        }
    }
    if config.classifier.enabled {
        warn!("classifier.enabled is set but no classifier collaborator is wired; assignment stays deterministic");
    }

    let conversation = ConversationLog::new(config.conversation_log_path(), Some(store.clone()));
    let dispatcher = ToolDispatcher::new(Arc::new(manager), Some(store), conversation);
    Ok(Arc::new(dispatcher))
}
