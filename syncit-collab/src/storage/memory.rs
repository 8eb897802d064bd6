//! In-process persistence gateway.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{PersistenceError, PersistenceGateway};
use crate::session::FileId;

/// Keeps file content in a map. Counts every load and save so callers can
/// check how often the engine reached persistence.
#[derive(Default)]
pub struct MemoryStore {
    files: RwLock<HashMap<FileId, String>>,
    loads: AtomicU64,
    saves: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_files<I, S>(files: I) -> Self
    where
        I: IntoIterator<Item = (FileId, S)>,
        S: Into<String>,
    {
        Self {
            files: RwLock::new(files.into_iter().map(|(id, s)| (id, s.into())).collect()),
            ..Self::default()
        }
    }

    /// Set content directly, bypassing the save counter.
    pub async fn insert(&self, id: FileId, content: impl Into<String>) {
        self.files.write().await.insert(id, content.into());
    }

    pub async fn get(&self, id: FileId) -> Option<String> {
        self.files.read().await.get(&id).cloned()
    }

    pub fn load_count(&self) -> u64 {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn save_count(&self) -> u64 {
        self.saves.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PersistenceGateway for MemoryStore {
    async fn load_content(&self, id: FileId) -> Result<String, PersistenceError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(self.get(id).await.unwrap_or_default())
    }

    async fn save_content(&self, id: FileId, content: &str) -> Result<(), PersistenceError> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        self.files.write().await.insert(id, content.to_string());
        Ok(())
    }
}
