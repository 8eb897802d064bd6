//! RocksDB-backed persistence gateway.
//!
//! Column families:
//! - `content`  — file text (LZ4 compressed, keyed by file id)
//! - `metadata` — bincode [`FileMetadata`] (version, sizes, timestamps)
//!
//! A save writes both column families in one atomic `WriteBatch`.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use async_trait::async_trait;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};

use super::{PersistenceError, PersistenceGateway};
use crate::session::FileId;

const CF_CONTENT: &str = "content";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_CONTENT, CF_METADATA];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// fsync on every save (default: true; a flush on close is the only copy)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 256)
    pub max_open_files: i32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("syncit_data"),
            block_cache_size: 64 * 1024 * 1024,
            sync_writes: true,
            max_open_files: 256,
        }
    }
}

impl StoreConfig {
    /// Small caches, no fsync.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 4 * 1024 * 1024,
            sync_writes: false,
            max_open_files: 64,
        }
    }
}

/// Bookkeeping stored next to each file's content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub file_id: FileId,
    /// Number of saves so far
    pub version: u64,
    /// Uncompressed content size in bytes
    pub content_size: u64,
    /// Compressed content size in bytes
    pub compressed_size: u64,
    /// Seconds since epoch
    pub created_at: u64,
    /// Seconds since epoch
    pub updated_at: u64,
}

impl FileMetadata {
    fn new(file_id: FileId) -> Self {
        let now = unix_now();
        Self {
            file_id,
            version: 0,
            content_size: 0,
            compressed_size: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, PersistenceError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| PersistenceError::Serialization(e.to_string()))
    }

    fn decode(id: FileId, bytes: &[u8]) -> Result<Self, PersistenceError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| PersistenceError::Corrupt {
                id,
                reason: e.to_string(),
            })?;
        Ok(meta)
    }
}

/// Durable file store.
pub struct RocksStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl RocksStore {
    /// Open the store, creating the database and column families if missing.
    pub fn open(config: StoreConfig) -> Result<Self, PersistenceError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let cache = Cache::new_lru_cache(config.block_cache_size);
        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &cache)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        log::info!("Opened file store at {}", config.path.display());
        Ok(Self { db, config })
    }

    fn cf_options(name: &str, cache: &Cache) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        block_opts.set_block_cache(cache);
        block_opts.set_bloom_filter(10.0, false);
        opts.set_block_based_table_factory(&block_opts);

        match name {
            // Values are already LZ4 framed by us
            CF_CONTENT => opts.set_compression_type(DBCompressionType::None),
            _ => opts.set_compression_type(DBCompressionType::Lz4),
        }

        opts
    }

    /// Load the raw content of a file, `None` if never saved.
    pub fn read(&self, id: FileId) -> Result<Option<String>, PersistenceError> {
        let cf = self.cf(CF_CONTENT)?;
        let Some(compressed) = self.db.get_cf(cf, Self::key(id))? else {
            return Ok(None);
        };

        let bytes = lz4_flex::decompress_size_prepended(&compressed).map_err(|e| {
            PersistenceError::Corrupt {
                id,
                reason: e.to_string(),
            }
        })?;
        let text = String::from_utf8(bytes).map_err(|e| PersistenceError::Corrupt {
            id,
            reason: e.to_string(),
        })?;
        Ok(Some(text))
    }

    /// Write content and bumped metadata atomically.
    pub fn write(&self, id: FileId, content: &str) -> Result<FileMetadata, PersistenceError> {
        let cf_content = self.cf(CF_CONTENT)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let compressed = lz4_flex::compress_prepend_size(content.as_bytes());

        let mut meta = self
            .load_metadata(id)?
            .unwrap_or_else(|| FileMetadata::new(id));
        meta.version += 1;
        meta.content_size = content.len() as u64;
        meta.compressed_size = compressed.len() as u64;
        meta.updated_at = unix_now();

        let key = Self::key(id);
        let mut batch = WriteBatch::default();
        batch.put_cf(cf_content, key, &compressed);
        batch.put_cf(cf_meta, key, meta.encode()?);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;

        Ok(meta)
    }

    pub fn load_metadata(&self, id: FileId) -> Result<Option<FileMetadata>, PersistenceError> {
        let cf = self.cf(CF_METADATA)?;
        self.db
            .get_cf(cf, Self::key(id))?
            .map(|bytes| FileMetadata::decode(id, &bytes))
            .transpose()
    }

    /// Every file id with saved content.
    pub fn list_files(&self) -> Result<Vec<FileId>, PersistenceError> {
        let cf = self.cf(CF_METADATA)?;
        let mut ids = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            if let Ok(raw) = <[u8; 8]>::try_from(&key[..]) {
                ids.push(FileId(i64::from_be_bytes(raw)));
            }
        }
        Ok(ids)
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), PersistenceError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, PersistenceError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| PersistenceError::Database(format!("Column family '{name}' not found")))
    }

    fn key(id: FileId) -> [u8; 8] {
        id.0.to_be_bytes()
    }
}

#[async_trait]
impl PersistenceGateway for RocksStore {
    async fn load_content(&self, id: FileId) -> Result<String, PersistenceError> {
        Ok(self.read(id)?.unwrap_or_default())
    }

    async fn save_content(&self, id: FileId, content: &str) -> Result<(), PersistenceError> {
        let meta = self.write(id, content)?;
        log::debug!(
            "Saved file {id} v{} ({} → {} bytes)",
            meta.version,
            meta.content_size,
            meta.compressed_size
        );
        Ok(())
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
