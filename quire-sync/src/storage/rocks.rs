//! RocksDB-backed snapshot store.
//!
//! Column families:
//! - `documents`: document text at its last snapshot (LZ4 compressed)
//! - `metadata`: version, sizes and timestamps (bincode)
//!
//! Both are keyed by [`FileKey::storage_key`] and written together in one
//! `WriteBatch`, so a reader never sees content from one snapshot with
//! the version of another.
//!
//! Reference: Kleppmann, DDIA, Chapter 3 (LSM Trees, SSTables)

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::SystemTime;

use super::{Snapshot, SnapshotStore, StoreError};
use crate::directory::FileKey;

const CF_DOCUMENTS: &str = "documents";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_DOCUMENTS, CF_METADATA];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync every snapshot write (default: true)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("quire_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: true,
            max_open_files: 512,
        }
    }
}

impl StoreConfig {
    /// Small caches, no fsync.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
        }
    }
}

/// Bookkeeping stored next to each snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub key: FileKey,
    /// Version of the stored content
    pub version: u64,
    /// Uncompressed size in bytes
    pub snapshot_size: u64,
    pub compressed_size: u64,
    /// Number of snapshots written for this document
    pub snapshot_count: u64,
    /// Seconds since epoch
    pub created_at: u64,
    pub updated_at: u64,
}

impl DocumentMetadata {
    fn new(key: FileKey) -> Self {
        let now = now_secs();
        Self {
            key,
            version: 0,
            snapshot_size: 0,
            compressed_size: 0,
            snapshot_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        Ok(meta)
    }
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

/// RocksDB-backed document store.
pub struct DocumentStore {
    /// Single-threaded handle; callers reach it from blocking workers.
    db: Mutex<DBWithThreadMode<SingleThreaded>>,
    config: StoreConfig,
}

impl DocumentStore {
    /// Open (or create) the store at the configured path.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(&config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;
        log::info!("Opened document store at {}", config.path.display());

        Ok(Self {
            db: Mutex::new(db),
            config,
        })
    }

    fn cf_options(config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);

        // Values are already LZ4-compressed by us.
        opts.set_compression_type(DBCompressionType::None);
        opts.optimize_for_point_lookup(config.block_cache_size as u64);
        opts
    }

    fn with_db<T>(
        &self,
        f: impl FnOnce(&DBWithThreadMode<SingleThreaded>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let db = self
            .db
            .lock()
            .map_err(|e| StoreError::DatabaseError(format!("store lock poisoned: {e}")))?;
        f(&db)
    }

    /// Write a snapshot and its metadata atomically.
    pub fn put_snapshot(&self, key: &FileKey, snapshot: &Snapshot) -> Result<DocumentMetadata, StoreError> {
        let storage_key = key.storage_key();
        let compressed = lz4_flex::compress_prepend_size(snapshot.content.as_bytes());

        self.with_db(|db| {
            let cf_docs = cf(db, CF_DOCUMENTS)?;
            let cf_meta = cf(db, CF_METADATA)?;

            let mut meta = match db.get_cf(cf_meta, &storage_key)? {
                Some(bytes) => DocumentMetadata::decode(&bytes)?,
                None => DocumentMetadata::new(key.clone()),
            };
            meta.version = snapshot.version;
            meta.snapshot_size = snapshot.content.len() as u64;
            meta.compressed_size = compressed.len() as u64;
            meta.snapshot_count += 1;
            meta.updated_at = now_secs();

            let mut batch = WriteBatch::default();
            batch.put_cf(cf_docs, &storage_key, &compressed);
            batch.put_cf(cf_meta, &storage_key, meta.encode()?);

            let mut write_opts = WriteOptions::default();
            write_opts.set_sync(self.config.sync_writes);
            db.write_opt(batch, &write_opts)?;
            Ok(meta)
        })
    }

    pub fn get_snapshot(&self, key: &FileKey) -> Result<Option<Snapshot>, StoreError> {
        let storage_key = key.storage_key();
        self.with_db(|db| {
            let cf_docs = cf(db, CF_DOCUMENTS)?;
            let cf_meta = cf(db, CF_METADATA)?;

            let (compressed, meta) = match (
                db.get_cf(cf_docs, &storage_key)?,
                db.get_cf(cf_meta, &storage_key)?,
            ) {
                (Some(c), Some(m)) => (c, DocumentMetadata::decode(&m)?),
                _ => return Ok(None),
            };

            let bytes = lz4_flex::decompress_size_prepended(&compressed)
                .map_err(|e| StoreError::CompressionError(e.to_string()))?;
            let content = String::from_utf8(bytes)
                .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
            Ok(Some(Snapshot {
                content,
                version: meta.version,
            }))
        })
    }

    pub fn load_metadata(&self, key: &FileKey) -> Result<Option<DocumentMetadata>, StoreError> {
        let storage_key = key.storage_key();
        self.with_db(|db| {
            let cf_meta = cf(db, CF_METADATA)?;
            db.get_cf(cf_meta, &storage_key)?
                .map(|bytes| DocumentMetadata::decode(&bytes))
                .transpose()
        })
    }
}

impl SnapshotStore for DocumentStore {
    fn save_snapshot(&self, key: &FileKey, snapshot: &Snapshot) -> Result<(), StoreError> {
        let meta = self.put_snapshot(key, snapshot)?;
        log::debug!(
            "Snapshot {key} v{}: {} → {} bytes",
            meta.version,
            meta.snapshot_size,
            meta.compressed_size
        );
        Ok(())
    }

    fn load_snapshot(&self, key: &FileKey) -> Result<Option<Snapshot>, StoreError> {
        self.get_snapshot(key)
    }
}

fn cf<'a>(
    db: &'a DBWithThreadMode<SingleThreaded>,
    name: &str,
) -> Result<&'a rocksdb::ColumnFamily, StoreError> {
    db.cf_handle(name)
        .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' not found")))
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp() -> (tempfile::TempDir, DocumentStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = DocumentStore::open(StoreConfig::for_testing(dir.path())).unwrap();
        (dir, store)
    }

    #[test]
    fn test_snapshot_save_load() {
        let (_dir, store) = open_temp();
        let key = FileKey::new("alice", "notes", "todo.md");
        let snapshot = Snapshot {
            content: "- write tests\n- ship it\n".repeat(50),
            version: 12,
        };

        store.save_snapshot(&key, &snapshot).unwrap();
        assert_eq!(store.load_snapshot(&key).unwrap(), Some(snapshot.clone()));

        let meta = store.load_metadata(&key).unwrap().unwrap();
        assert_eq!(meta.version, 12);
        assert_eq!(meta.snapshot_size, snapshot.content.len() as u64);
        assert!(meta.compressed_size < meta.snapshot_size);
    }

    #[test]
    fn test_missing_document() {
        let (_dir, store) = open_temp();
        let key = FileKey::new("alice", "notes", "nope.md");
        assert_eq!(store.load_snapshot(&key).unwrap(), None);
        assert_eq!(store.load_metadata(&key).unwrap(), None);
    }

    #[test]
    fn test_overwrite_counts_snapshots() {
        let (_dir, store) = open_temp();
        let key = FileKey::new("alice", "notes", "a.md");
        for version in 1..=3 {
            let snapshot = Snapshot { content: format!("v{version}"), version };
            store.save_snapshot(&key, &snapshot).unwrap();
        }
        let meta = store.load_metadata(&key).unwrap().unwrap();
        assert_eq!(meta.snapshot_count, 3);
        assert_eq!(store.load_snapshot(&key).unwrap().unwrap().content, "v3");
    }

    #[test]
    fn test_reopen_keeps_data() {
        let dir = tempfile::tempdir().unwrap();
        let key = FileKey::new("alice", "p", "persist.txt");
        {
            let store = DocumentStore::open(StoreConfig::for_testing(dir.path())).unwrap();
            store.save_snapshot(&key, &Snapshot { content: "kept".into(), version: 9 }).unwrap();
        }
        let store = DocumentStore::open(StoreConfig::for_testing(dir.path())).unwrap();
        let loaded = store.load_snapshot(&key).unwrap().unwrap();
        assert_eq!(loaded.content, "kept");
        assert_eq!(loaded.version, 9);
    }
}
