//! Persistence gateways for file content.
//!
//! ```text
//! ┌─────────────┐  load_content (first open)  ┌────────────────────┐
//! │   Router    │ ──────────────────────────► │ PersistenceGateway │
//! │             │ ◄────────────────────────── │                    │
//! │             │  save_content (close flush) │  MemoryStore       │
//! └─────────────┘ ──────────────────────────► │  RocksStore        │
//!                                             └────────────────────┘
//! ```
//!
//! The session engine never retries: a gateway error goes straight back to
//! whoever triggered the load or save.

pub mod memory;
pub mod rocks;

use async_trait::async_trait;
use thiserror::Error;

use crate::session::FileId;

pub use memory::MemoryStore;
pub use rocks::{FileMetadata, RocksStore, StoreConfig};

/// Durable load/save of file content.
#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    /// Current persisted content. A file that was never saved reads as "".
    async fn load_content(&self, id: FileId) -> Result<String, PersistenceError>;

    async fn save_content(&self, id: FileId, content: &str) -> Result<(), PersistenceError>;
}

/// Persistence errors.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("database error: {0}")]
    Database(String),
    #[error("corrupt record for file {id}: {reason}")]
    Corrupt { id: FileId, reason: String },
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

impl From<rocksdb::Error> for PersistenceError {
    fn from(e: rocksdb::Error) -> Self {
        PersistenceError::Database(e.to_string())
    }
}
