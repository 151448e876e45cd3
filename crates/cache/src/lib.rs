//! Compile result cache for kiln
//!
//! Successful compiles are stored under a key derived from their inputs
//! (see [`HashKeyGenerator`]). The store keeps a bounded in-memory layer in
//! front of inspectable JSON records on disk, and bounds itself with an
//! age sweep and a least-recently-accessed pressure sweep.

pub mod cleanup;
pub mod config;
pub mod entry;
pub mod errors;
pub mod eviction;
pub mod keys;
pub mod stats;
pub mod storage;
pub mod store;

pub use config::{default_cache_dir, CacheConfig};
pub use entry::{CacheEntry, CacheMetadataRecord, CachedCompile, EntryInfo, RECORD_VERSION};
pub use errors::{CacheError, RecoveryHint, Result, SerializationOp};
pub use eviction::EvictionReport;
pub use keys::{hash_bytes, hash_file, HashKeyGenerator, FALLBACK_KEY_PREFIX, MISSING_FILE_PREFIX};
pub use stats::CacheStatistics;
pub use storage::{DiskStorage, ScanOutcome};
pub use store::CacheStore;
