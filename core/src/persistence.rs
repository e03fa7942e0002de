use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::{MarcusError, Result};

/// Hard ceiling on the number of items a single query may return.
///
/// `query` clamps the caller's limit to this value before applying the
/// offset; callers paginating past the cap see truncated reads.
pub const MAX_QUERY_LIMIT: usize = 10_000;

/// Field stamped into every stored value with the UTC write time
pub const STORED_AT_FIELD: &str = "_stored_at";

/// Collection names used by the coordination engine
pub mod collections {
    pub const TASKS: &str = "tasks";
    pub const ASSIGNMENTS: &str = "assignments";
    pub const LEASES: &str = "leases";
    pub const DECISIONS: &str = "decisions";
    pub const ARTIFACTS: &str = "artifacts";
    pub const EVENTS: &str = "events";
    pub const PROJECT_SNAPSHOTS: &str = "project_snapshots";
    pub const ANALYSIS_RESULTS: &str = "analysis_results";
    pub const CONVERSATION_INDEX: &str = "conversation_index";

    pub const ALL: &[&str] = &[
        TASKS,
        ASSIGNMENTS,
        LEASES,
        DECISIONS,
        ARTIFACTS,
        EVENTS,
        PROJECT_SNAPSHOTS,
        ANALYSIS_RESULTS,
        CONVERSATION_INDEX,
    ];
}

/// Predicate applied to stored values during a query scan
pub type QueryFilter<'a> = &'a (dyn Fn(&Value) -> bool + Send + Sync);

/// Typed collection store shared by every backend.
///
/// Implementations must be safe under concurrent access with a
/// many-readers-or-one-writer discipline per collection. Absent keys are a
/// sentinel (`Ok(None)`), never an error; `storage_unavailable` errors are
/// retryable, `storage_corrupt` errors are fatal.
#[async_trait]
pub trait Persistence: Send + Sync {
    /// Upsert a value under `collection`/`key`, stamping `_stored_at`
    async fn store(&self, collection: &str, key: &str, value: Value) -> Result<()>;

    /// Fetch a value; `Ok(None)` when the key is absent
    async fn retrieve(&self, collection: &str, key: &str) -> Result<Option<Value>>;

    /// Scan the collection in key order, keep values matching `filter`,
    /// then apply `offset` and return at most `min(limit, MAX_QUERY_LIMIT)`
    /// items.
    async fn query(
        &self,
        collection: &str,
        filter: QueryFilter<'_>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Value>>;

    /// Remove a key; removing an absent key is not an error
    async fn delete(&self, collection: &str, key: &str) -> Result<()>;

    /// Remove entries whose `_stored_at` precedes `older_than`; returns the
    /// number removed
    async fn clear_old(&self, collection: &str, older_than: DateTime<Utc>) -> Result<u64>;

    /// Verify the backend is reachable
    async fn health_check(&self) -> Result<()>;
}

/// Reject collection names that are not plain identifiers.
///
/// Backends interpolate collection names into table names and directory
/// paths, so the character set is restricted up front.
pub fn validate_collection_name(collection: &str) -> Result<()> {
    let valid = !collection.is_empty()
        && collection.len() <= 64
        && collection
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(MarcusError::business_logic(format!(
            "Invalid collection name '{collection}': expected lowercase identifier"
        )))
    }
}

/// Stamp `_stored_at` into an object value; non-object values are wrapped
/// under a `"value"` field first so the stamp always applies.
pub fn stamp_stored_at(value: Value, now: DateTime<Utc>) -> Value {
    let mut object = match value {
        Value::Object(map) => map,
        other => {
            let mut map = serde_json::Map::new();
            map.insert("value".to_string(), other);
            map
        }
    };
    object.insert(
        STORED_AT_FIELD.to_string(),
        Value::String(now.to_rfc3339()),
    );
    Value::Object(object)
}

/// Read the `_stored_at` stamp back out of a stored value.
///
/// Naive timestamps from legacy data are interpreted as UTC.
pub fn stored_at_of(value: &Value) -> Option<DateTime<Utc>> {
    let raw = value.get(STORED_AT_FIELD)?.as_str()?;
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    // Legacy naive format, read as UTC
    chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Clamp a caller-supplied limit to the hard ceiling
pub fn effective_limit(limit: usize) -> usize {
    limit.min(MAX_QUERY_LIMIT)
}

/// Project-scoped writer over the shared store.
///
/// Keys are prefixed with the project id so collections stay global while
/// rows remain attributable, and every stored value carries a `project_id`
/// field for validation by downstream consumers.
#[derive(Clone)]
pub struct ProjectStore {
    project_id: String,
    backend: Option<std::sync::Arc<dyn Persistence>>,
}

impl ProjectStore {
    pub fn new(
        project_id: impl Into<String>,
        backend: Option<std::sync::Arc<dyn Persistence>>,
    ) -> Self {
        Self {
            project_id: project_id.into(),
            backend,
        }
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn backend(&self) -> Option<&std::sync::Arc<dyn Persistence>> {
        self.backend.as_ref()
    }

    pub fn scoped_key(&self, id: &str) -> String {
        format!("{}:{id}", self.project_id)
    }

    fn tag(&self, value: &mut Value) {
        if let Value::Object(map) = value {
            map.insert(
                "project_id".to_string(),
                Value::String(self.project_id.clone()),
            );
        }
    }

    /// Persist a record, surfacing failures to the caller
    pub async fn save<T: serde::Serialize>(
        &self,
        collection: &str,
        id: &str,
        record: &T,
    ) -> Result<()> {
        let Some(backend) = &self.backend else {
            return Ok(());
        };
        let mut value = serde_json::to_value(record)
            .map_err(|e| MarcusError::storage(format!("Failed to serialize record: {e}")))?;
        self.tag(&mut value);
        backend.store(collection, &self.scoped_key(id), value).await
    }

    /// Persist a record as a best-effort side write, logging failures.
    ///
    /// Used on the hot path where the in-memory state is already correct
    /// and the durable copy trails behind.
    pub async fn save_best_effort<T: serde::Serialize>(
        &self,
        collection: &str,
        id: &str,
        record: &T,
    ) {
        if let Err(err) = self.save(collection, id, record).await {
            tracing::warn!(
                collection,
                key = %self.scoped_key(id),
                error = %err,
                "Deferred persistence write failed"
            );
        }
    }

    /// Fetch a record stored under this project's scope
    pub async fn load(&self, collection: &str, id: &str) -> Result<Option<Value>> {
        let Some(backend) = &self.backend else {
            return Ok(None);
        };
        backend.retrieve(collection, &self.scoped_key(id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn collection_names_are_validated() {
        for name in collections::ALL {
            assert!(validate_collection_name(name).is_ok(), "{name}");
        }
        assert!(validate_collection_name("").is_err());
        assert!(validate_collection_name("Tasks").is_err());
        assert!(validate_collection_name("tasks; DROP TABLE").is_err());
        assert!(validate_collection_name("tasks-2").is_err());
    }

    #[test]
    fn stamping_preserves_fields() {
        let now = Utc::now();
        let stamped = stamp_stored_at(json!({"name": "t1"}), now);
        assert_eq!(stamped["name"], "t1");
        assert_eq!(stored_at_of(&stamped), Some(now));
    }

    #[test]
    fn stamping_wraps_scalars() {
        let now = Utc::now();
        let stamped = stamp_stored_at(json!(42), now);
        assert_eq!(stamped["value"], 42);
        assert!(stamped.get(STORED_AT_FIELD).is_some());
    }

    #[test]
    fn naive_stamps_read_as_utc() {
        let value = json!({ STORED_AT_FIELD: "2024-03-01T12:00:00" });
        let parsed = stored_at_of(&value).expect("naive timestamp should parse");
        assert_eq!(parsed.to_rfc3339(), "2024-03-01T12:00:00+00:00");
    }

    #[test]
    fn limits_are_capped() {
        assert_eq!(effective_limit(10), 10);
        assert_eq!(effective_limit(20_000), MAX_QUERY_LIMIT);
    }
}
