//! RocksDB storage backend.
//!
//! All operations are synchronous blocking I/O, which is exactly what the
//! strictly-serial event loop wants: a commit either completes before the
//! next event or the process dies knowing the batch never landed.

use crate::metrics;
use forgeline_chain::{KvStore, StorageError, WriteBatch, WriteOp};
use rocksdb::{Options, DB};
use std::path::Path;
use std::time::Instant;

/// Configuration for the RocksDB backend.
#[derive(Debug, Clone)]
pub struct RocksDbConfig {
    /// Maximum number of background jobs.
    pub max_background_jobs: i32,
    /// Write buffer size in bytes.
    pub write_buffer_size: usize,
    /// Block cache size in bytes (`None` to disable).
    pub block_cache_size: Option<usize>,
    /// Bloom filter bits per key (0 to disable).
    pub bloom_filter_bits: f64,
    /// Number of log files to keep.
    pub keep_log_file_num: usize,
}

impl Default for RocksDbConfig {
    fn default() -> Self {
        Self {
            max_background_jobs: 4,
            write_buffer_size: 64 * 1024 * 1024,
            block_cache_size: Some(256 * 1024 * 1024),
            bloom_filter_bits: 10.0,
            keep_log_file_num: 10,
        }
    }
}

/// RocksDB-backed [`KvStore`].
///
/// The chain's key layout is prefix-based, so a single column family with
/// prefix iteration covers it. LZ4 compression and a bloom filter keep the
/// point lookups (accounts, blocks by id) cheap.
pub struct RocksDbStore {
    db: DB,
}

impl RocksDbStore {
    /// Open or create the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        Self::open_with_config(path, RocksDbConfig::default())
    }

    /// Open with custom configuration.
    pub fn open_with_config(
        path: impl AsRef<Path>,
        config: RocksDbConfig,
    ) -> Result<Self, StorageError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_max_background_jobs(config.max_background_jobs);
        opts.set_write_buffer_size(config.write_buffer_size);
        opts.set_keep_log_file_num(config.keep_log_file_num);
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);

        let mut block_opts = rocksdb::BlockBasedOptions::default();
        if let Some(cache_size) = config.block_cache_size {
            let cache = rocksdb::Cache::new_lru_cache(cache_size);
            block_opts.set_block_cache(&cache);
        }
        if config.bloom_filter_bits > 0.0 {
            block_opts.set_bloom_filter(config.bloom_filter_bits, false);
        }
        opts.set_block_based_table_factory(&block_opts);

        let db = DB::open(&opts, path).map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(Self { db })
    }
}

impl KvStore for RocksDbStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        let start = Instant::now();
        let result = self
            .db
            .get(key)
            .map_err(|e| StorageError::Backend(e.to_string()));
        metrics::record_storage_read(start.elapsed().as_secs_f64());
        result
    }

    fn iter_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError> {
        let start = Instant::now();
        let iter = self.db.iterator(rocksdb::IteratorMode::From(
            prefix,
            rocksdb::Direction::Forward,
        ));
        let mut entries = Vec::new();
        for item in iter {
            let (key, value) = item.map_err(|e| StorageError::Backend(e.to_string()))?;
            if !key.starts_with(prefix) {
                break;
            }
            entries.push((key.to_vec(), value.to_vec()));
        }
        metrics::record_storage_read(start.elapsed().as_secs_f64());
        Ok(entries)
    }

    fn write(&self, batch: WriteBatch) -> Result<(), StorageError> {
        let start = Instant::now();
        let mut rocks_batch = rocksdb::WriteBatch::default();
        for op in batch.into_ops() {
            match op {
                WriteOp::Put { key, value } => rocks_batch.put(key, value),
                WriteOp::Delete { key } => rocks_batch.delete(key),
            }
        }
        // Sync writes: a block commit must be durable before the tip moves.
        let mut write_opts = rocksdb::WriteOptions::default();
        write_opts.set_sync(true);
        let result = self
            .db
            .write_opt(rocks_batch, &write_opts)
            .map_err(|e| StorageError::Backend(e.to_string()));
        metrics::record_storage_write(start.elapsed().as_secs_f64());
        result
    }
}
