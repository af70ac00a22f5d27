//! Durable local key/value storage for client-side state.
//!
//! ```text
//! ┌───────────────┐   get/set(key)   ┌────────────────────┐
//! │ MutationQueue │ ───────────────► │ dyn LocalStore     │
//! └───────────────┘                  │  ├─ RocksLocalStore │  (RocksDB, on disk)
//!                                    │  └─ MemoryLocalStore│  (tests, ephemeral)
//!                                    └────────────────────┘
//! ```
//!
//! Writes are synchronous: when `set` returns `Ok`, the value is visible to a
//! fresh store opened on the same path.

pub mod memory;
pub mod rocks;

pub use memory::MemoryLocalStore;
pub use rocks::{LocalStoreConfig, RocksLocalStore};

/// Local storage errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(String),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

impl From<rocksdb::Error> for StorageError {
    fn from(e: rocksdb::Error) -> Self {
        StorageError::Database(e.to_string())
    }
}

/// A synchronous byte-oriented key/value store.
pub trait LocalStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;
    fn set(&self, key: &str, value: &[u8]) -> Result<(), StorageError>;
}
