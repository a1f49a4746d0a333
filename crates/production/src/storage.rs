//! # RocksDB Storage
//!
//! Content-addressed checkpoint storage backed by RocksDB.
//!
//! All operations are synchronous blocking I/O. Callers in async contexts
//! should use `spawn_blocking` if needed to avoid blocking the runtime.

use crate::metrics;
use cpos_types::{ContentStore, Hash, StoreError};
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, Options, WriteBatch, DB};
use std::path::Path;
use std::time::Instant;

const CF_CONTENT: &str = "content";
const CF_META: &str = "meta";
const ROOT_KEY: &[u8] = b"peer:root";

/// RocksDB-based content store.
///
/// Values live in the `content` column family keyed by their hash. The root
/// hash naming the latest peer checkpoint lives in `meta`.
pub struct RocksDbStore {
    db: DB,
}

impl std::fmt::Debug for RocksDbStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RocksDbStore")
            .field("path", &self.db.path())
            .finish()
    }
}

impl RocksDbStore {
    /// Open or create a database at the given path with default settings.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        Self::open_with_config(path, RocksDbConfig::default())
    }

    pub fn open_with_config<P: AsRef<Path>>(
        path: P,
        config: RocksDbConfig,
    ) -> Result<Self, StoreError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        opts.set_max_background_jobs(config.max_background_jobs);
        if config.bytes_per_sync > 0 {
            opts.set_bytes_per_sync(config.bytes_per_sync as u64);
        }
        opts.set_keep_log_file_num(config.keep_log_file_num);
        opts.set_max_write_buffer_number(config.max_write_buffer_number);
        opts.set_write_buffer_size(config.write_buffer_size);
        opts.set_compression_type(config.compression.to_rocksdb());

        let mut block_opts = rocksdb::BlockBasedOptions::default();
        if let Some(cache_size) = config.block_cache_size {
            let cache = rocksdb::Cache::new_lru_cache(cache_size);
            block_opts.set_block_cache(&cache);
        }
        if config.bloom_filter_bits > 0.0 {
            block_opts.set_bloom_filter(config.bloom_filter_bits, false);
        }
        opts.set_block_based_table_factory(&block_opts);

        let cf_descriptors = [CF_CONTENT, CF_META]
            .into_iter()
            .map(|name| ColumnFamilyDescriptor::new(name, Options::default()));

        let db = DB::open_cf_descriptors(&opts, path, cf_descriptors).map_err(backend)?;
        Ok(Self { db })
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Backend(format!("column family {} not found", name)))
    }

    /// Number of stored content entries. Walks the whole column family.
    pub fn content_count(&self) -> Result<usize, StoreError> {
        let cf = self.cf(CF_CONTENT)?;
        let mut count = 0;
        for item in self.db.iterator_cf(cf, rocksdb::IteratorMode::Start) {
            item.map_err(backend)?;
            count += 1;
        }
        Ok(count)
    }
}

impl ContentStore for RocksDbStore {
    fn put_raw(&self, hash: Hash, bytes: Vec<u8>) -> Result<(), StoreError> {
        let start = Instant::now();
        let cf = self.cf(CF_CONTENT)?;
        // Content-addressed: an existing entry already holds these bytes.
        if self.db.get_pinned_cf(cf, hash.as_bytes()).map_err(backend)?.is_none() {
            self.db.put_cf(cf, hash.as_bytes(), bytes).map_err(backend)?;
        }
        metrics::record_rocksdb_write(start.elapsed().as_secs_f64());
        Ok(())
    }

    fn get_raw(&self, hash: &Hash) -> Result<Option<Vec<u8>>, StoreError> {
        let start = Instant::now();
        let cf = self.cf(CF_CONTENT)?;
        let result = self.db.get_cf(cf, hash.as_bytes()).map_err(backend);
        metrics::record_rocksdb_read(start.elapsed().as_secs_f64());
        result
    }

    fn root_hash(&self) -> Result<Option<Hash>, StoreError> {
        let cf = self.cf(CF_META)?;
        match self.db.get_cf(cf, ROOT_KEY).map_err(backend)? {
            None => Ok(None),
            Some(bytes) => {
                let bytes: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
                    StoreError::Backend(format!("root hash has {} bytes", bytes.len()))
                })?;
                Ok(Some(Hash::from_hash_bytes(bytes)))
            }
        }
    }

    fn set_root_hash(&self, hash: Hash) -> Result<(), StoreError> {
        let start = Instant::now();
        let cf = self.cf(CF_META)?;
        let mut batch = WriteBatch::default();
        batch.put_cf(cf, ROOT_KEY, hash.as_bytes());
        self.db.write(batch).map_err(backend)?;
        metrics::record_rocksdb_write(start.elapsed().as_secs_f64());
        Ok(())
    }
}

fn backend(e: rocksdb::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

/// Compression type for RocksDB.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionType {
    None,
    #[default]
    Lz4,
}

impl CompressionType {
    fn to_rocksdb(self) -> rocksdb::DBCompressionType {
        match self {
            CompressionType::None => rocksdb::DBCompressionType::None,
            CompressionType::Lz4 => rocksdb::DBCompressionType::Lz4,
        }
    }
}

/// Configuration for RocksDB storage.
#[derive(Debug, Clone)]
pub struct RocksDbConfig {
    pub max_background_jobs: i32,
    /// Write buffer size in bytes
    pub write_buffer_size: usize,
    pub max_write_buffer_number: i32,
    /// Block cache size in bytes (None to disable)
    pub block_cache_size: Option<usize>,
    pub compression: CompressionType,
    /// Bloom filter bits per key (0 to disable)
    pub bloom_filter_bits: f64,
    /// Bytes per sync (0 to disable)
    pub bytes_per_sync: usize,
    pub keep_log_file_num: usize,
}

impl Default for RocksDbConfig {
    fn default() -> Self {
        Self {
            max_background_jobs: 2,
            write_buffer_size: 64 * 1024 * 1024, // 64MB
            max_write_buffer_number: 3,
            block_cache_size: Some(128 * 1024 * 1024), // 128MB
            compression: CompressionType::Lz4,
            bloom_filter_bits: 10.0,
            bytes_per_sync: 1024 * 1024, // 1MB
            keep_log_file_num: 10,
        }
    }
}
