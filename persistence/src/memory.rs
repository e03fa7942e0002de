//! In-memory backend, primarily for tests and ephemeral deployments.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::RwLock;

use marcus_core::error::Result;
use marcus_core::persistence::{
    effective_limit, stamp_stored_at, stored_at_of, validate_collection_name, Persistence,
    QueryFilter,
};

type Collection = BTreeMap<String, Value>;

/// HashMap-backed store with one lock per collection, mirroring the
/// many-readers-or-one-writer discipline of the durable backends.
#[derive(Default)]
pub struct MemoryPersistence {
    collections: RwLock<HashMap<String, Arc<RwLock<Collection>>>>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    async fn collection(&self, name: &str) -> Result<Arc<RwLock<Collection>>> {
        validate_collection_name(name)?;
        {
            let collections = self.collections.read().await;
            if let Some(collection) = collections.get(name) {
                return Ok(Arc::clone(collection));
            }
        }
        let mut collections = self.collections.write().await;
        Ok(Arc::clone(
            collections.entry(name.to_string()).or_default(),
        ))
    }
}

#[async_trait]
impl Persistence for MemoryPersistence {
    async fn store(&self, collection: &str, key: &str, value: Value) -> Result<()> {
        let collection = self.collection(collection).await?;
        let mut entries = collection.write().await;
        entries.insert(key.to_string(), stamp_stored_at(value, Utc::now()));
        Ok(())
    }

    async fn retrieve(&self, collection: &str, key: &str) -> Result<Option<Value>> {
        let collection = self.collection(collection).await?;
        let entries = collection.read().await;
        Ok(entries.get(key).cloned())
    }

    async fn query(
        &self,
        collection: &str,
        filter: QueryFilter<'_>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Value>> {
        let collection = self.collection(collection).await?;
        let entries = collection.read().await;
        Ok(entries
            .values()
            .filter(|v| filter(v))
            .skip(offset)
            .take(effective_limit(limit))
            .cloned()
            .collect())
    }

    async fn delete(&self, collection: &str, key: &str) -> Result<()> {
        let collection = self.collection(collection).await?;
        let mut entries = collection.write().await;
        entries.remove(key);
        Ok(())
    }

    async fn clear_old(&self, collection: &str, older_than: DateTime<Utc>) -> Result<u64> {
        let collection = self.collection(collection).await?;
        let mut entries = collection.write().await;
        let before = entries.len();
        entries.retain(|_, v| stored_at_of(v).map(|t| t >= older_than).unwrap_or(true));
        Ok((before - entries.len()) as u64)
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}
