//! RocksDB-backed local store.
//!
//! One default column family; every queue snapshot is a single `put` under a
//! fixed key, so a write is atomic with respect to readers. With
//! `sync_writes` the WAL is fsynced before `set` returns.

use rocksdb::{BlockBasedOptions, DBCompressionType, Options, WriteOptions, DB};
use std::path::{Path, PathBuf};

use super::{LocalStore, StorageError};

/// Local store configuration.
#[derive(Debug, Clone)]
pub struct LocalStoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// fsync the WAL on every write (default: true)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 64)
    pub max_open_files: i32,
    /// Write buffer size (default: 4MB)
    pub write_buffer_size: usize,
}

impl Default for LocalStoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("pilgrim_local"),
            sync_writes: true,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

impl LocalStoreConfig {
    /// Config rooted at `path` with default tuning.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }
}

pub struct RocksLocalStore {
    db: DB,
    write_opts: WriteOptions,
    config: LocalStoreConfig,
}

impl RocksLocalStore {
    /// Open (or create) the store at the configured path.
    pub fn open(config: LocalStoreConfig) -> Result<Self, StorageError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_max_open_files(config.max_open_files);
        opts.set_keep_log_file_num(2);
        opts.set_write_buffer_size(config.write_buffer_size);
        opts.set_compression_type(DBCompressionType::Lz4);

        let mut block_opts = BlockBasedOptions::default();
        block_opts.set_bloom_filter(10.0, false);
        opts.set_block_based_table_factory(&block_opts);

        let db = DB::open(&opts, &config.path)?;

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(config.sync_writes);

        log::debug!("Opened local store at {}", config.path.display());
        Ok(Self { db, write_opts, config })
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Flush memtables to disk.
    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }
}

impl LocalStore for RocksLocalStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.db.get(key.as_bytes())?)
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        self.db.put_opt(key.as_bytes(), value, &self.write_opts)?;
        Ok(())
    }
}
