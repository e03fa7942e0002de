//! Persistence backends for the Marcus coordination server.
//!
//! Three interchangeable implementations of the
//! [`marcus_core::persistence::Persistence`] collection store:
//!
//! - [`SqlitePersistence`] - embedded relational backend (WAL journaling,
//!   JSON values, one writer connection plus a reader pool)
//! - [`FilePersistence`] - JSON file per entry with atomic
//!   write-then-rename
//! - [`MemoryPersistence`] - in-memory store for tests
//!
//! # Usage
//!
//! ```rust,no_run
//! use marcus_core::persistence::Persistence;
//! use persistence::SqlitePersistence;
//!
//! # #[tokio::main]
//! # async fn main() -> marcus_core::Result<()> {
//! let store = SqlitePersistence::open("/var/lib/marcus/marcus.sqlite", 4).await?;
//! store.health_check().await?;
//! # Ok(())
//! # }
//! ```

mod common;
mod file;
mod memory;
mod sqlite;

pub use file::FilePersistence;
pub use memory::MemoryPersistence;
pub use sqlite::{SqlitePersistence, DEFAULT_READER_POOL_SIZE};

// Re-export the trait and helpers callers need alongside a backend
pub use marcus_core::persistence::{collections, Persistence, QueryFilter, MAX_QUERY_LIMIT};
