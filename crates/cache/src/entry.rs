//! Cache records

use chrono::{DateTime, Utc};
use kiln_core::CompileResult;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Version written into every durable record
pub const RECORD_VERSION: u32 = 1;

/// Fixed per-entry overhead added to the size estimate
const ENTRY_OVERHEAD_BYTES: u64 = 256;

/// What a cache hit hands back
#[derive(Debug, Clone, PartialEq)]
pub struct CachedCompile {
    pub result: Arc<CompileResult>,
    pub files: Vec<PathBuf>,
}

/// One stored compile, as persisted under `entries/`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub version: u32,
    pub key: String,
    pub result: Arc<CompileResult>,
    pub files: Vec<PathBuf>,
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    pub access_count: u64,
    pub size_bytes: u64,
}

impl CacheEntry {
    pub fn new(key: impl Into<String>, result: Arc<CompileResult>, files: Vec<PathBuf>) -> Self {
        let now = Utc::now();
        let mut entry = Self {
            version: RECORD_VERSION,
            key: key.into(),
            result,
            files,
            created_at: now,
            last_accessed: now,
            access_count: 0,
            size_bytes: 0,
        };
        entry.size_bytes = entry.estimate_size();
        entry
    }

    /// Rough footprint: serialized result plus artifact paths plus overhead
    pub fn estimate_size(&self) -> u64 {
        let result_bytes = serde_json::to_vec(self.result.as_ref())
            .map(|v| v.len() as u64)
            .unwrap_or(0);
        let file_bytes: u64 = self
            .files
            .iter()
            .map(|f| f.as_os_str().len() as u64)
            .sum();
        result_bytes + file_bytes + self.key.len() as u64 + ENTRY_OVERHEAD_BYTES
    }

    pub fn info(&self) -> EntryInfo {
        EntryInfo {
            created_at: self.created_at,
            last_accessed: self.last_accessed,
            access_count: self.access_count,
            size_bytes: self.size_bytes,
        }
    }

    pub fn to_cached(&self) -> CachedCompile {
        CachedCompile {
            result: Arc::clone(&self.result),
            files: self.files.clone(),
        }
    }

    /// Rebuild a record from index metadata and a hot value
    pub(crate) fn from_parts(key: &str, info: &EntryInfo, cached: &CachedCompile) -> Self {
        Self {
            version: RECORD_VERSION,
            key: key.to_string(),
            result: Arc::clone(&cached.result),
            files: cached.files.clone(),
            created_at: info.created_at,
            last_accessed: info.last_accessed,
            access_count: info.access_count,
            size_bytes: info.size_bytes,
        }
    }
}

/// Per-key metadata kept in the index for every stored entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryInfo {
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    pub access_count: u64,
    pub size_bytes: u64,
}

impl EntryInfo {
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.created_at).to_std().unwrap_or_default()
    }

    pub fn is_expired(&self, max_age: Duration, now: DateTime<Utc>) -> bool {
        self.age(now) > max_age
    }

    pub(crate) fn touch(&mut self, now: DateTime<Utc>) {
        self.last_accessed = now;
        self.access_count += 1;
    }
}

/// Aggregate record persisted as `metadata.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheMetadataRecord {
    pub version: u32,
    pub entry_count: usize,
    pub total_bytes: u64,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub evictions: u64,
    pub updated_at: DateTime<Utc>,
}
