//! File-tree backend.
//!
//! Each collection is a directory and each entry a JSON file written with
//! the write-then-rename pattern, so readers never observe a torn value.
//! Keys are encoded to stay filesystem-safe.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::RwLock;

use marcus_core::error::{MarcusError, Result};
use marcus_core::persistence::{
    effective_limit, stamp_stored_at, stored_at_of, validate_collection_name, Persistence,
    QueryFilter,
};

/// JSON-file-per-entry store rooted at a data directory.
pub struct FilePersistence {
    root: PathBuf,
    // One lock per collection: many readers or one writer
    locks: RwLock<HashMap<String, Arc<RwLock<()>>>>,
}

impl FilePersistence {
    /// Open (creating if needed) a store rooted at `root`
    pub async fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| storage_error(&root, "create data directory", e))?;
        Ok(Self {
            root,
            locks: RwLock::new(HashMap::new()),
        })
    }

    async fn collection_lock(&self, name: &str) -> Result<Arc<RwLock<()>>> {
        validate_collection_name(name)?;
        {
            let locks = self.locks.read().await;
            if let Some(lock) = locks.get(name) {
                return Ok(Arc::clone(lock));
            }
        }
        let mut locks = self.locks.write().await;
        Ok(Arc::clone(locks.entry(name.to_string()).or_default()))
    }

    fn collection_dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    fn entry_path(&self, collection: &str, key: &str) -> PathBuf {
        self.collection_dir(collection)
            .join(format!("{}.json", encode_key(key)))
    }

    async fn read_entry(&self, path: &Path) -> Result<Option<Value>> {
        match tokio::fs::read(path).await {
            Ok(bytes) => {
                let value = serde_json::from_slice(&bytes).map_err(|e| {
                    MarcusError::storage_corrupt(format!(
                        "Entry {} is not valid JSON: {e}",
                        path.display()
                    ))
                })?;
                Ok(Some(value))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(storage_error(path, "read entry", e)),
        }
    }
}

#[async_trait]
impl Persistence for FilePersistence {
    async fn store(&self, collection: &str, key: &str, value: Value) -> Result<()> {
        let lock = self.collection_lock(collection).await?;
        let _guard = lock.write().await;

        let dir = self.collection_dir(collection);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| storage_error(&dir, "create collection directory", e))?;

        let value = stamp_stored_at(value, Utc::now());
        let bytes = serde_json::to_vec_pretty(&value)
            .map_err(|e| MarcusError::storage(format!("Failed to serialize value: {e}")))?;

        // Write to a sibling temp file, then rename into place atomically.
        let path = self.entry_path(collection, key);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|e| storage_error(&tmp, "write entry", e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| storage_error(&path, "rename entry into place", e))?;
        Ok(())
    }

    async fn retrieve(&self, collection: &str, key: &str) -> Result<Option<Value>> {
        let lock = self.collection_lock(collection).await?;
        let _guard = lock.read().await;
        self.read_entry(&self.entry_path(collection, key)).await
    }

    async fn query(
        &self,
        collection: &str,
        filter: QueryFilter<'_>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Value>> {
        let lock = self.collection_lock(collection).await?;
        let _guard = lock.read().await;

        let dir = self.collection_dir(collection);
        let mut reader = match tokio::fs::read_dir(&dir).await {
            Ok(reader) => reader,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(storage_error(&dir, "list collection", e)),
        };

        // Scan in key order for a stable pagination contract
        let mut paths = Vec::new();
        while let Some(entry) = reader
            .next_entry()
            .await
            .map_err(|e| storage_error(&dir, "list collection", e))?
        {
            let path = entry.path();
            if path.extension().map(|e| e == "json").unwrap_or(false) {
                paths.push(path);
            }
        }
        paths.sort();

        let mut matched = 0usize;
        let mut results = Vec::new();
        let take = effective_limit(limit);
        for path in paths {
            let Some(value) = self.read_entry(&path).await? else {
                continue;
            };
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
        let lock = self.collection_lock(collection).await?;
        let _guard = lock.write().await;

        let path = self.entry_path(collection, key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(storage_error(&path, "delete entry", e)),
        }
    }

    async fn clear_old(&self, collection: &str, older_than: DateTime<Utc>) -> Result<u64> {
        let lock = self.collection_lock(collection).await?;
        let _guard = lock.write().await;

        let dir = self.collection_dir(collection);
        let mut reader = match tokio::fs::read_dir(&dir).await {
            Ok(reader) => reader,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(storage_error(&dir, "list collection", e)),
        };

        let mut removed = 0u64;
        while let Some(entry) = reader
            .next_entry()
            .await
            .map_err(|e| storage_error(&dir, "list collection", e))?
        {
            let path = entry.path();
            if !path.extension().map(|e| e == "json").unwrap_or(false) {
                continue;
            }
            let Some(value) = self.read_entry(&path).await? else {
                continue;
            };
            let expired = stored_at_of(&value).map(|t| t < older_than).unwrap_or(false);
            if expired {
                tokio::fs::remove_file(&path)
                    .await
                    .map_err(|e| storage_error(&path, "delete entry", e))?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn health_check(&self) -> Result<()> {
        tokio::fs::metadata(&self.root)
            .await
            .map_err(|e| storage_error(&self.root, "stat data directory", e))?;
        Ok(())
    }
}

/// Percent-encode characters that are unsafe in file names
fn encode_key(key: &str) -> String {
    let mut encoded = String::with_capacity(key.len());
    for c in key.chars() {
        if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
            encoded.push(c);
        } else {
            for byte in c.to_string().as_bytes() {
                encoded.push_str(&format!("%{byte:02X}"));
            }
        }
    }
    encoded
}

fn storage_error(path: &Path, action: &str, err: std::io::Error) -> MarcusError {
    MarcusError::storage_unavailable(format!("Failed to {action} at {}: {err}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn round_trip_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilePersistence::new(dir.path()).await.unwrap();

        store
            .store("tasks", "proj:t1", json!({"name": "one"}))
            .await
            .unwrap();
        let value = store.retrieve("tasks", "proj:t1").await.unwrap().unwrap();
        assert_eq!(value["name"], "one");

        store.delete("tasks", "proj:t1").await.unwrap();
        assert!(store.retrieve("tasks", "proj:t1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn no_temp_files_survive_a_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilePersistence::new(dir.path()).await.unwrap();
        for i in 0..10 {
            store
                .store("events", &format!("e{i}"), json!({"n": i}))
                .await
                .unwrap();
        }

        let mut names = Vec::new();
        let mut reader = tokio::fs::read_dir(dir.path().join("events")).await.unwrap();
        while let Some(entry) = reader.next_entry().await.unwrap() {
            names.push(entry.file_name().to_string_lossy().to_string());
        }
        assert_eq!(names.len(), 10);
        assert!(names.iter().all(|n| n.ends_with(".json")));
    }

    #[test]
    fn key_encoding_is_collision_free_for_scoped_keys() {
        assert_eq!(encode_key("p1:t1"), "p1%3At1");
        assert_ne!(encode_key("a:b"), encode_key("a%3Ab"));
    }
}
