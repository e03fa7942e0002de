//! SQLite backend.
//!
//! One table per collection (`key`, `value` JSON, `stored_at`), created on
//! first use, with expression indexes over the hot JSON fields of the core
//! collections. WAL journaling plus a dedicated single-connection writer
//! pool and an N-connection reader pool give many-readers-or-one-writer
//! concurrency; opening a fresh connection per query is deliberately
//! impossible through this type.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tokio::sync::RwLock;

use marcus_core::error::{MarcusError, Result};
use marcus_core::persistence::{
    collections, effective_limit, stamp_stored_at, validate_collection_name, Persistence,
    QueryFilter,
};

use crate::common::sqlx_error_to_marcus_error;

/// Default reader-pool size
pub const DEFAULT_READER_POOL_SIZE: u32 = 4;

/// SQLite implementation of the collection store.
pub struct SqlitePersistence {
    writer: SqlitePool,
    readers: Option<SqlitePool>,
    ensured: RwLock<HashSet<String>>,
}

impl SqlitePersistence {
    /// Open (creating if needed) a database file with WAL journaling, a
    /// single writer connection and `reader_pool_size` readers.
    pub async fn open(path: &str, reader_pool_size: u32) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(5))
            .foreign_keys(true);

        let writer = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options.clone())
            .await
            .map_err(sqlx_error_to_marcus_error)?;
        let readers = SqlitePoolOptions::new()
            .max_connections(reader_pool_size.max(1))
            .connect_with(options)
            .await
            .map_err(sqlx_error_to_marcus_error)?;

        let store = Self {
            writer,
            readers: Some(readers),
            ensured: RwLock::new(HashSet::new()),
        };
        store.prepare_core_collections().await?;
        Ok(store)
    }

    /// Private in-memory database; reads share the single writer
    /// connection because each SQLite `:memory:` connection is its own
    /// database.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(":memory:")
            .journal_mode(SqliteJournalMode::Memory)
            .foreign_keys(true);
        let writer = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(sqlx_error_to_marcus_error)?;

        let store = Self {
            writer,
            readers: None,
            ensured: RwLock::new(HashSet::new()),
        };
        store.prepare_core_collections().await?;
        Ok(store)
    }

    fn read_pool(&self) -> &SqlitePool {
        self.readers.as_ref().unwrap_or(&self.writer)
    }

    /// Create the tables for the collections the engine always uses, so
    /// fresh databases carry the full schema up front.
    async fn prepare_core_collections(&self) -> Result<()> {
        for name in collections::ALL {
            self.ensure_collection(name).await?;
        }
        Ok(())
    }

    async fn ensure_collection(&self, name: &str) -> Result<()> {
        validate_collection_name(name)?;
        {
            let ensured = self.ensured.read().await;
            if ensured.contains(name) {
                return Ok(());
            }
        }

        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS \"{name}\" (\
             key TEXT PRIMARY KEY, \
             value TEXT NOT NULL, \
             stored_at TEXT NOT NULL)"
        ))
        .execute(&self.writer)
        .await
        .map_err(sqlx_error_to_marcus_error)?;

        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS idx_{name}_stored_at ON \"{name}\"(stored_at)"
        ))
        .execute(&self.writer)
        .await
        .map_err(sqlx_error_to_marcus_error)?;

        for field in indexed_json_fields(name) {
            sqlx::query(&format!(
                "CREATE INDEX IF NOT EXISTS idx_{name}_{field} \
                 ON \"{name}\"(json_extract(value, '$.{field}'))"
            ))
            .execute(&self.writer)
            .await
            .map_err(sqlx_error_to_marcus_error)?;
        }

        self.ensured.write().await.insert(name.to_string());
        Ok(())
    }
}

/// JSON fields worth an expression index, per collection
fn indexed_json_fields(collection: &str) -> &'static [&'static str] {
    match collection {
        collections::TASKS => &["project_id", "status", "assigned_agent_id"],
        collections::ASSIGNMENTS => &["project_id", "agent_id", "status"],
        collections::EVENTS => &["project_id", "event_type", "timestamp"],
        collections::LEASES => &["project_id", "status"],
        collections::DECISIONS
        | collections::ARTIFACTS
        | collections::PROJECT_SNAPSHOTS
        | collections::ANALYSIS_RESULTS
        | collections::CONVERSATION_INDEX => &["project_id"],
        _ => &[],
    }
}

#[async_trait]
impl Persistence for SqlitePersistence {
    async fn store(&self, collection: &str, key: &str, value: Value) -> Result<()> {
        self.ensure_collection(collection).await?;
        let now = Utc::now();
        let value = stamp_stored_at(value, now);
        let serialized = serde_json::to_string(&value)
            .map_err(|e| MarcusError::storage(format!("Failed to serialize value: {e}")))?;

        sqlx::query(&format!(
            "INSERT INTO \"{collection}\" (key, value, stored_at) VALUES (?1, ?2, ?3) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, stored_at = excluded.stored_at"
        ))
        .bind(key)
        .bind(serialized)
        .bind(now.to_rfc3339_opts(SecondsFormat::Micros, true))
        .execute(&self.writer)
        .await
        .map_err(sqlx_error_to_marcus_error)?;
        Ok(())
    }

    async fn retrieve(&self, collection: &str, key: &str) -> Result<Option<Value>> {
        self.ensure_collection(collection).await?;
        let row = sqlx::query(&format!(
            "SELECT value FROM \"{collection}\" WHERE key = ?1"
        ))
        .bind(key)
        .fetch_optional(self.read_pool())
        .await
        .map_err(sqlx_error_to_marcus_error)?;

        match row {
            Some(row) => {
                let raw: String = row.get("value");
                let value = serde_json::from_str(&raw).map_err(|e| {
                    MarcusError::storage_corrupt(format!(
                        "Stored value under '{collection}/{key}' is not valid JSON: {e}"
                    ))
                })?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    async fn query(
        &self,
        collection: &str,
        filter: QueryFilter<'_>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Value>> {
        self.ensure_collection(collection).await?;
        let rows = sqlx::query(&format!(
            "SELECT value FROM \"{collection}\" ORDER BY key"
        ))
        .fetch_all(self.read_pool())
        .await
        .map_err(sqlx_error_to_marcus_error)?;

        let take = effective_limit(limit);
        let mut matched = 0usize;
        let mut results = Vec::new();
        for row in rows {
            let raw: String = row.get("value");
            let value: Value = serde_json::from_str(&raw).map_err(|e| {
                MarcusError::storage_corrupt(format!(
                    "Stored value in '{collection}' is not valid JSON: {e}"
                ))
            })?;
            if !filter(&value) {
                continue;
            }
            matched += 1;
            if matched <= offset {
                continue;
            }
            if results.len() < take {
                results.push(value);
            } else {
                break;
            }
        }
        Ok(results)
    }

    async fn delete(&self, collection: &str, key: &str) -> Result<()> {
        self.ensure_collection(collection).await?;
        sqlx::query(&format!("DELETE FROM \"{collection}\" WHERE key = ?1"))
            .bind(key)
            .execute(&self.writer)
            .await
            .map_err(sqlx_error_to_marcus_error)?;
        Ok(())
    }

    async fn clear_old(&self, collection: &str, older_than: DateTime<Utc>) -> Result<u64> {
        self.ensure_collection(collection).await?;
        let result = sqlx::query(&format!(
            "DELETE FROM \"{collection}\" WHERE stored_at < ?1"
        ))
        .bind(older_than.to_rfc3339_opts(SecondsFormat::Micros, true))
        .execute(&self.writer)
        .await
        .map_err(sqlx_error_to_marcus_error)?;
        Ok(result.rows_affected())
    }

    async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .fetch_one(self.read_pool())
            .await
            .map_err(sqlx_error_to_marcus_error)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn upsert_replaces_existing_values() {
        let store = SqlitePersistence::in_memory().await.unwrap();
        store.store("tasks", "t1", json!({"rev": 1})).await.unwrap();
        store.store("tasks", "t1", json!({"rev": 2})).await.unwrap();

        let value = store.retrieve("tasks", "t1").await.unwrap().unwrap();
        assert_eq!(value["rev"], 2);

        let all = store.query("tasks", &|_| true, 100, 0).await.unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn query_scans_in_key_order() {
        let store = SqlitePersistence::in_memory().await.unwrap();
        for key in ["c", "a", "b"] {
            store
                .store("decisions", key, json!({"key": key}))
                .await
                .unwrap();
        }
        let values = store.query("decisions", &|_| true, 10, 0).await.unwrap();
        let keys: Vec<&str> = values.iter().map(|v| v["key"].as_str().unwrap()).collect();
        assert_eq!(keys, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn dynamic_collections_are_created_on_demand() {
        let store = SqlitePersistence::in_memory().await.unwrap();
        store
            .store("scratch_space", "k", json!({"ok": true}))
            .await
            .unwrap();
        assert!(store.retrieve("scratch_space", "k").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn collection_names_are_validated_before_sql() {
        let store = SqlitePersistence::in_memory().await.unwrap();
        let err = store
            .store("tasks\"; DROP TABLE tasks; --", "k", json!({}))
            .await
            .unwrap_err();
        assert!(err.message.contains("Invalid collection name"));
    }
}
