//! Two-layer compile result cache
//!
//! A bounded in-memory LRU sits in front of the file-backed records. The
//! index of every stored key (with its access metadata) lives behind one
//! mutex; aggregate counters are atomics so [`CacheStore::stats`] never
//! waits on it. Hits only touch the index; the refreshed access metadata
//! reaches disk on the next sweep, flush or shutdown.

use crate::cleanup;
use crate::config::CacheConfig;
use crate::entry::{CacheEntry, CacheMetadataRecord, CachedCompile, EntryInfo, RECORD_VERSION};
use crate::errors::{RecoveryHint, Result};
use crate::eviction::{self, EvictionReport, PRESSURE_FRACTION};
use crate::keys::HashKeyGenerator;
use crate::stats::{CacheCounters, CacheStatistics};
use crate::storage::DiskStorage;
use chrono::Utc;
use kiln_core::CompileResult;
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Handle to a cache. Clones share the same store.
#[derive(Clone)]
pub struct CacheStore {
    inner: Arc<StoreInner>,
}

pub(crate) struct StoreInner {
    config: CacheConfig,
    storage: DiskStorage,
    state: Mutex<StoreState>,
    counters: CacheCounters,
    cleanup_in_progress: AtomicBool,
    cleanup_handle: Mutex<Option<JoinHandle<()>>>,
}

struct StoreState {
    index: HashMap<String, EntryInfo>,
    memory: LruCache<String, CachedCompile>,
    total_bytes: u64,
    /// Keys whose access metadata is newer in the index than on disk
    dirty: HashSet<String>,
}

impl std::fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStore")
            .field("base_dir", &self.inner.config.base_dir)
            .field("entries", &self.len())
            .finish()
    }
}

impl CacheStore {
    /// Open the store rooted at `config.base_dir`.
    ///
    /// Loads every durable record into the index. Records that fail to
    /// parse, or that are already past `max_age`, are deleted here.
    pub fn open(config: CacheConfig) -> Result<Self> {
        config.validate()?;
        let storage = DiskStorage::open(&config.base_dir)?;
        let counters = CacheCounters::default();

        if let Some(previous) = storage.read_metadata() {
            counters.hits.store(previous.hits, Ordering::Relaxed);
            counters.misses.store(previous.misses, Ordering::Relaxed);
            counters.evictions.store(previous.evictions, Ordering::Relaxed);
        }

        let scan = storage.scan()?;
        for path in &scan.corrupted {
            match storage.remove_path(path) {
                Ok(_) => {
                    counters.corrupted.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => tracing::warn!(error = %e, "Failed to remove corrupted cache record"),
            }
        }
        if !scan.corrupted.is_empty() {
            tracing::warn!(count = scan.corrupted.len(), "Removed corrupted cache records");
        }

        let now = Utc::now();
        let mut index = HashMap::with_capacity(scan.entries.len());
        let mut total_bytes = 0u64;
        for entry in scan.entries {
            let info = entry.info();
            if info.is_expired(config.max_age, now) {
                if let Err(e) = storage.remove(&entry.key) {
                    tracing::warn!(key = %entry.key, error = %e, "Failed to remove expired cache record");
                }
                counters.expirations.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            total_bytes += info.size_bytes;
            index.insert(entry.key, info);
        }
        counters.set_usage(index.len(), total_bytes);

        let capacity = NonZeroUsize::new(config.memory_entries).unwrap_or(NonZeroUsize::MIN);
        let inner = Arc::new(StoreInner {
            state: Mutex::new(StoreState {
                index,
                memory: LruCache::new(capacity),
                total_bytes,
                dirty: HashSet::new(),
            }),
            config,
            storage,
            counters,
            cleanup_in_progress: AtomicBool::new(false),
            cleanup_handle: Mutex::new(None),
        });

        tracing::debug!(
            base_dir = %inner.config.base_dir.display(),
            entries = inner.counters.entries.load(Ordering::Relaxed),
            bytes = total_bytes,
            "Opened compile cache"
        );

        {
            // limits may have shrunk since the records were written
            let mut state = inner.state.lock();
            let report = inner.enforce_maxima_locked(&mut state);
            if report.enforced > 0 {
                inner
                    .counters
                    .evictions
                    .fetch_add(report.enforced as u64, Ordering::Relaxed);
            }
            inner.sync_usage(&state);
        }
        inner.persist_metadata();

        Ok(Self { inner })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// True when an unexpired entry exists for `key`.
    ///
    /// An expired entry is removed as a side effect.
    pub fn is_valid(&self, key: &str) -> bool {
        if HashKeyGenerator::is_fallback_key(key) {
            return false;
        }
        let mut state = self.inner.state.lock();
        let Some(info) = state.index.get(key).copied() else {
            return false;
        };
        if info.is_expired(self.inner.config.max_age, Utc::now()) {
            self.inner.remove_locked(&mut state, key);
            self.inner.counters.expirations.fetch_add(1, Ordering::Relaxed);
            self.inner.sync_usage(&state);
            return false;
        }
        true
    }

    /// Look up `key`.
    ///
    /// A hit refreshes the entry's access time and count. Expired or
    /// unreadable entries are removed and reported as a miss.
    pub fn get(&self, key: &str) -> Option<CachedCompile> {
        if HashKeyGenerator::is_fallback_key(key) {
            self.inner.counters.record_miss();
            return None;
        }
        let inner = &self.inner;
        let mut state = inner.state.lock();
        let now = Utc::now();

        let Some(mut info) = state.index.get(key).copied() else {
            inner.counters.record_miss();
            return None;
        };

        if info.is_expired(inner.config.max_age, now) {
            tracing::debug!(key, "Cache entry expired");
            inner.remove_locked(&mut state, key);
            inner.counters.expirations.fetch_add(1, Ordering::Relaxed);
            inner.counters.record_miss();
            inner.sync_usage(&state);
            return None;
        }

        let cached = match state.memory.get(key) {
            Some(cached) => cached.clone(),
            None => match inner.storage.read(key) {
                Ok(Some(entry)) => {
                    let cached = entry.to_cached();
                    state.memory.put(key.to_string(), cached.clone());
                    cached
                }
                Ok(None) => {
                    tracing::debug!(key, "Cache record vanished from disk");
                    inner.remove_locked(&mut state, key);
                    inner.counters.record_miss();
                    inner.sync_usage(&state);
                    return None;
                }
                Err(e) => {
                    inner.counters.record_miss();
                    match e.recovery_hint() {
                        RecoveryHint::Retry { after } => {
                            // transient; the record is left for a later lookup
                            tracing::debug!(key, error = %e, retry_after_ms = after.as_millis() as u64, "Cache read failed, keeping record");
                            inner.counters.record_error();
                            return None;
                        }
                        RecoveryHint::CheckPermissions { path } => {
                            tracing::warn!(key, path = %path.display(), error = %e, "Cache record is not readable, removing it");
                            inner.counters.record_error();
                        }
                        _ if e.is_corruption() => {
                            tracing::warn!(key, error = %e, "Removing corrupted cache record");
                            inner.counters.corrupted.fetch_add(1, Ordering::Relaxed);
                        }
                        _ => {
                            tracing::warn!(key, error = %e, "Cache read failed, removing record");
                            inner.counters.record_error();
                        }
                    }
                    inner.remove_locked(&mut state, key);
                    inner.sync_usage(&state);
                    return None;
                }
            },
        };

        info.touch(now);
        state.index.insert(key.to_string(), info);
        state.dirty.insert(key.to_string());

        inner.counters.record_hit();
        Some(cached)
    }

    /// Store a successful compile under `key`.
    ///
    /// Crossing the high-water mark schedules a pressure sweep; the hard
    /// maxima are enforced before this returns.
    pub fn put(&self, key: &str, result: Arc<CompileResult>, files: Vec<PathBuf>) -> Result<()> {
        if HashKeyGenerator::is_fallback_key(key) {
            tracing::debug!(key, "Not caching result under fallback key");
            return Ok(());
        }
        let entry = CacheEntry::new(key, result, files);
        let inner = &self.inner;

        let needs_sweep = {
            let mut state = inner.state.lock();
            if let Err(e) = inner.storage.write(&entry) {
                inner.counters.record_error();
                return Err(e);
            }
            if let Some(previous) = state.index.insert(entry.key.clone(), entry.info()) {
                state.total_bytes = state.total_bytes.saturating_sub(previous.size_bytes);
            }
            state.total_bytes += entry.size_bytes;
            state.dirty.remove(&entry.key);
            state.memory.put(entry.key.clone(), entry.to_cached());
            inner.counters.writes.fetch_add(1, Ordering::Relaxed);

            let enforced = inner.enforce_maxima_locked(&mut state);
            if enforced.total() > 0 {
                inner.counters.evictions.fetch_add(enforced.total() as u64, Ordering::Relaxed);
            }
            inner.sync_usage(&state);
            inner.above_high_water(&state)
        };

        tracing::trace!(key, size = entry.size_bytes, "Cached compile result");
        inner.persist_metadata();

        if needs_sweep {
            self.schedule_pressure_sweep();
        }
        Ok(())
    }

    /// Remove `key`, returning whether it was present
    pub fn invalidate(&self, key: &str) -> bool {
        let mut state = self.inner.state.lock();
        let removed = self.inner.remove_locked(&mut state, key).is_some();
        if removed {
            self.inner.counters.invalidations.fetch_add(1, Ordering::Relaxed);
            self.inner.sync_usage(&state);
        }
        removed
    }

    /// Remove every entry from both layers
    pub fn clear(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            self.inner.storage.clear()?;
            state.index.clear();
            state.memory.clear();
            state.dirty.clear();
            state.total_bytes = 0;
            self.inner.sync_usage(&state);
        }
        tracing::info!(base_dir = %self.inner.config.base_dir.display(), "Cleared compile cache");
        self.inner.persist_metadata();
        Ok(())
    }

    pub fn stats(&self) -> CacheStatistics {
        CacheStatistics::snapshot(
            &self.inner.counters,
            self.inner.config.max_entries,
            self.inner.config.max_bytes,
        )
    }

    /// Age sweep: remove every entry older than `max_age`
    pub fn cleanup_expired(&self) -> usize {
        self.inner.cleanup_expired()
    }

    /// Pressure sweep: run the 25% passes when above the high-water mark,
    /// then evict until both maxima hold
    pub fn enforce_limits(&self) -> EvictionReport {
        self.inner.enforce_limits()
    }

    /// Stored keys, sorted
    pub fn keys(&self) -> Vec<String> {
        let state = self.inner.state.lock();
        let mut keys: Vec<String> = state.index.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn entry_info(&self, key: &str) -> Option<EntryInfo> {
        self.inner.state.lock().index.get(key).copied()
    }

    pub fn len(&self) -> usize {
        self.inner.counters.entries.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Start the periodic age sweep. Requires a tokio runtime; calling it
    /// again replaces the running task.
    pub fn start_background_cleanup(&self) {
        let period = self.inner.config.cleanup_interval;
        if period.is_zero() {
            return;
        }
        let handle = cleanup::spawn_age_sweep(Arc::downgrade(&self.inner), period);
        if let Some(previous) = self.inner.cleanup_handle.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Write access metadata refreshed by hits back to the durable records.
    /// Returns how many records were rewritten.
    pub fn flush(&self) -> usize {
        let mut state = self.inner.state.lock();
        self.inner.flush_access_locked(&mut state)
    }

    /// Stop background work and flush access metadata and the metadata record
    pub fn shutdown(&self) {
        if let Some(handle) = self.inner.cleanup_handle.lock().take() {
            handle.abort();
        }
        self.flush();
        self.inner.persist_metadata();
    }

    fn schedule_pressure_sweep(&self) {
        if self.inner.cleanup_in_progress.swap(true, Ordering::AcqRel) {
            return;
        }
        let inner = Arc::clone(&self.inner);
        let sweep = move || {
            let report = inner.enforce_limits();
            inner.cleanup_in_progress.store(false, Ordering::Release);
            report
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(sweep);
            }
            Err(_) => {
                sweep();
            }
        }
    }
}

impl StoreInner {
    pub(crate) fn cleanup_expired(&self) -> usize {
        let removed = {
            let mut state = self.state.lock();
            let expired = eviction::expired_keys(&state.index, self.config.max_age, Utc::now());
            for key in &expired {
                self.remove_locked(&mut state, key);
            }
            self.flush_access_locked(&mut state);
            self.sync_usage(&state);
            expired.len()
        };
        if removed > 0 {
            self.counters
                .expirations
                .fetch_add(removed as u64, Ordering::Relaxed);
            self.persist_metadata();
        }
        removed
    }

    fn enforce_limits(&self) -> EvictionReport {
        let report = {
            let mut state = self.state.lock();
            let mut report = EvictionReport::default();

            if self.above_high_water(&state) {
                let victims = eviction::least_recently_accessed(&state.index, PRESSURE_FRACTION);
                report.first_pass = victims.len();
                report.bytes_freed += self.remove_all_locked(&mut state, &victims);

                if self.above_target(&state) {
                    let victims =
                        eviction::least_recently_accessed(&state.index, PRESSURE_FRACTION);
                    report.second_pass = victims.len();
                    report.bytes_freed += self.remove_all_locked(&mut state, &victims);
                }
            }

            let enforced = self.enforce_maxima_locked(&mut state);
            report.enforced = enforced.enforced;
            report.bytes_freed += enforced.bytes_freed;
            self.sync_usage(&state);
            report
        };

        if !report.is_empty() {
            self.counters
                .evictions
                .fetch_add(report.total() as u64, Ordering::Relaxed);
            tracing::info!(
                first_pass = report.first_pass,
                second_pass = report.second_pass,
                enforced = report.enforced,
                bytes_freed = report.bytes_freed,
                "Evicted cache entries under pressure"
            );
            self.persist_metadata();
        }
        report
    }

    /// Evict least recently accessed entries until both maxima hold
    fn enforce_maxima_locked(&self, state: &mut StoreState) -> EvictionReport {
        let mut report = EvictionReport::default();
        if !self.above_maxima(state) {
            return report;
        }
        for key in eviction::by_recency(&state.index) {
            if !self.above_maxima(state) {
                break;
            }
            if let Some(info) = self.remove_locked(state, &key) {
                report.enforced += 1;
                report.bytes_freed += info.size_bytes;
            }
        }
        report
    }

    fn remove_all_locked(&self, state: &mut StoreState, keys: &[String]) -> u64 {
        keys.iter()
            .filter_map(|key| self.remove_locked(state, key))
            .map(|info| info.size_bytes)
            .sum()
    }

    fn remove_locked(&self, state: &mut StoreState, key: &str) -> Option<EntryInfo> {
        let info = state.index.remove(key)?;
        state.memory.pop(key);
        state.dirty.remove(key);
        state.total_bytes = state.total_bytes.saturating_sub(info.size_bytes);
        if let Err(e) = self.storage.remove(key) {
            tracing::warn!(key, error = %e, "Failed to delete cache record");
            self.counters.record_error();
        }
        Some(info)
    }

    fn flush_access_locked(&self, state: &mut StoreState) -> usize {
        let dirty: Vec<String> = state.dirty.drain().collect();
        let mut flushed = 0;
        for key in dirty {
            let Some(info) = state.index.get(&key).copied() else {
                continue;
            };
            let cached = match state.memory.peek(&key) {
                Some(cached) => cached.clone(),
                None => match self.storage.read(&key) {
                    Ok(Some(entry)) => entry.to_cached(),
                    Ok(None) => continue,
                    Err(e) => {
                        tracing::debug!(key = %key, error = %e, "Skipping access metadata flush");
                        continue;
                    }
                },
            };
            match self
                .storage
                .write(&CacheEntry::from_parts(&key, &info, &cached))
            {
                Ok(()) => flushed += 1,
                Err(e) => {
                    tracing::debug!(key = %key, error = %e, "Failed to persist access metadata");
                    self.counters.record_error();
                }
            }
        }
        if flushed > 0 {
            tracing::trace!(records = flushed, "Flushed cache access metadata");
        }
        flushed
    }

    fn above_maxima(&self, state: &StoreState) -> bool {
        state.index.len() > self.config.max_entries || state.total_bytes > self.config.max_bytes
    }

    fn above_high_water(&self, state: &StoreState) -> bool {
        state.index.len() >= self.config.high_water_entries()
            || state.total_bytes >= self.config.high_water_bytes()
    }

    fn above_target(&self, state: &StoreState) -> bool {
        state.index.len() > self.config.target_entries()
            || state.total_bytes > self.config.target_bytes()
    }

    fn sync_usage(&self, state: &StoreState) {
        self.counters.set_usage(state.index.len(), state.total_bytes);
    }

    fn persist_metadata(&self) {
        let record = CacheMetadataRecord {
            version: RECORD_VERSION,
            entry_count: self.counters.entries.load(Ordering::Relaxed),
            total_bytes: self.counters.bytes.load(Ordering::Relaxed),
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            hit_rate: self.counters.hit_rate(),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            updated_at: Utc::now(),
        };
        if let Err(e) = self.storage.write_metadata(&record) {
            tracing::debug!(error = %e, "Failed to write cache metadata");
        }
    }
}

impl Drop for StoreInner {
    fn drop(&mut self) {
        if let Some(handle) = self.cleanup_handle.get_mut().take() {
            handle.abort();
        }
        let mut state = self.state.lock();
        self.flush_access_locked(&mut state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::ProcessResult;
    use std::time::Duration;
    use tempfile::TempDir;

    fn result(output: &str) -> Arc<CompileResult> {
        Arc::new(CompileResult::from_process(
            &ProcessResult::succeeded(output),
            Duration::from_millis(5),
            0,
            vec![],
        ))
    }

    fn store(dir: &TempDir) -> CacheStore {
        CacheStore::open(CacheConfig::with_base_dir(dir.path())).unwrap()
    }

    #[test]
    fn put_then_get_round_trips() {
        let dir = TempDir::new().unwrap();
        let cache = store(&dir);
        let stored = result("built");

        cache
            .put("abc123", Arc::clone(&stored), vec![PathBuf::from("out/app")])
            .unwrap();
        let hit = cache.get("abc123").unwrap();
        assert_eq!(hit.result, stored);
        assert_eq!(hit.files, vec![PathBuf::from("out/app")]);
        assert!(cache.is_valid("abc123"));

        let stats = cache.stats();
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.writes, 1);
    }

    #[test]
    fn repeated_gets_only_touch_access_metadata() {
        let dir = TempDir::new().unwrap();
        let cache = store(&dir);
        cache.put("k1", result("x"), vec![]).unwrap();
        let before = cache.entry_info("k1").unwrap();

        let first = cache.get("k1").unwrap();
        let second = cache.get("k1").unwrap();
        assert_eq!(first, second);

        let after = cache.entry_info("k1").unwrap();
        assert_eq!(after.access_count, before.access_count + 2);
        assert_eq!(after.created_at, before.created_at);
        assert_eq!(after.size_bytes, before.size_bytes);
        assert!(after.last_accessed >= before.last_accessed);
    }

    #[test]
    fn misses_are_counted_not_errors() {
        let dir = TempDir::new().unwrap();
        let cache = store(&dir);
        assert!(cache.get("nothing").is_none());
        assert!(!cache.is_valid("nothing"));
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn expired_entries_are_removed_on_lookup() {
        let dir = TempDir::new().unwrap();
        let config = CacheConfig::with_base_dir(dir.path()).max_age(Duration::from_millis(50));
        let cache = CacheStore::open(config).unwrap();

        cache.put("old1", result("x"), vec![]).unwrap();
        assert!(cache.is_valid("old1"));
        std::thread::sleep(Duration::from_millis(120));

        assert!(!cache.is_valid("old1"));
        assert!(cache.get("old1").is_none());
        assert_eq!(cache.len(), 0);
        assert_eq!(cache.stats().expirations, 1);
        assert!(!dir.path().join("entries/ol/old1.json").exists());
    }

    #[test]
    fn age_sweep_removes_only_expired_entries() {
        let dir = TempDir::new().unwrap();
        let config = CacheConfig::with_base_dir(dir.path()).max_age(Duration::from_millis(80));
        let cache = CacheStore::open(config).unwrap();

        cache.put("aa1", result("x"), vec![]).unwrap();
        std::thread::sleep(Duration::from_millis(120));
        cache.put("bb2", result("y"), vec![]).unwrap();

        assert_eq!(cache.cleanup_expired(), 1);
        assert_eq!(cache.keys(), vec!["bb2"]);
    }

    #[test]
    fn records_survive_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let cache = store(&dir);
            cache.put("persist", result("kept"), vec![]).unwrap();
            assert!(cache.get("persist").is_some());
            cache.shutdown();
        }

        let cache = store(&dir);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.stats().hits, 1);
        let hit = cache.get("persist").unwrap();
        assert_eq!(hit.result.counters.stdout_bytes, 4);
        assert!(dir.path().join("metadata.json").exists());
    }

    #[test]
    fn corrupted_records_are_deleted_at_open() {
        let dir = TempDir::new().unwrap();
        {
            let cache = store(&dir);
            cache.put("good", result("ok"), vec![]).unwrap();
        }
        let shard = dir.path().join("entries/zz");
        std::fs::create_dir_all(&shard).unwrap();
        std::fs::write(shard.join("zzbad.json"), b"\0\0garbage").unwrap();

        let cache = store(&dir);
        assert_eq!(cache.keys(), vec!["good"]);
        assert_eq!(cache.stats().corrupted_removed, 1);
        assert!(!shard.join("zzbad.json").exists());
    }

    #[test]
    fn corrupted_record_on_read_is_a_miss() {
        let dir = TempDir::new().unwrap();
        let config = CacheConfig::with_base_dir(dir.path()).memory_entries(1);
        let cache = CacheStore::open(config).unwrap();
        cache.put("k1x", result("a"), vec![]).unwrap();
        // push k1x out of the memory layer
        cache.put("k2x", result("b"), vec![]).unwrap();
        std::fs::write(dir.path().join("entries/k1/k1x.json"), b"{").unwrap();

        assert!(cache.get("k1x").is_none());
        assert!(!cache.is_valid("k1x"));
        assert_eq!(cache.stats().corrupted_removed, 1);
    }

    #[test]
    fn transient_read_failure_keeps_the_record() {
        let dir = TempDir::new().unwrap();
        let config = CacheConfig::with_base_dir(dir.path()).memory_entries(1);
        let cache = CacheStore::open(config).unwrap();
        cache.put("k1x", result("a"), vec![]).unwrap();
        cache.put("k2x", result("b"), vec![]).unwrap();
        let record = dir.path().join("entries/k1/k1x.json");
        let saved = std::fs::read(&record).unwrap();
        // reading a directory fails with an error that is neither missing nor corrupt
        std::fs::remove_file(&record).unwrap();
        std::fs::create_dir(&record).unwrap();

        assert!(cache.get("k1x").is_none());
        assert!(cache.entry_info("k1x").is_some());
        let stats = cache.stats();
        assert_eq!(stats.errors, 1);
        assert_eq!(stats.corrupted_removed, 0);

        std::fs::remove_dir(&record).unwrap();
        std::fs::write(&record, saved).unwrap();
        assert!(cache.get("k1x").is_some());
    }

    #[test]
    fn hits_reach_disk_on_flush() {
        let dir = TempDir::new().unwrap();
        let cache = store(&dir);
        cache.put("k1x", result("a"), vec![]).unwrap();
        let record = dir.path().join("entries/k1/k1x.json");
        let access_count_on_disk = || {
            let value: serde_json::Value =
                serde_json::from_slice(&std::fs::read(&record).unwrap()).unwrap();
            value["access_count"].as_u64().unwrap()
        };
        let stored = access_count_on_disk();

        cache.get("k1x").unwrap();
        cache.get("k1x").unwrap();
        assert_eq!(access_count_on_disk(), stored);

        assert_eq!(cache.flush(), 1);
        assert_eq!(access_count_on_disk(), stored + 2);
        assert_eq!(cache.flush(), 0);
    }

    #[test]
    fn fallback_keys_are_never_stored() {
        let dir = TempDir::new().unwrap();
        let cache = store(&dir);
        let key = HashKeyGenerator::unique_fallback_key();

        cache.put(&key, result("x"), vec![]).unwrap();
        assert!(cache.is_empty());
        assert!(cache.get(&key).is_none());
    }

    #[test]
    fn invalidate_and_clear() {
        let dir = TempDir::new().unwrap();
        let cache = store(&dir);
        cache.put("aa", result("1"), vec![]).unwrap();
        cache.put("bb", result("2"), vec![]).unwrap();

        assert!(cache.invalidate("aa"));
        assert!(!cache.invalidate("aa"));
        assert_eq!(cache.keys(), vec!["bb"]);

        cache.clear().unwrap();
        assert!(cache.is_empty());
        assert_eq!(cache.stats().total_bytes, 0);
        assert!(cache.get("bb").is_none());
    }

    #[test]
    fn pressure_keeps_usage_within_maxima() {
        let dir = TempDir::new().unwrap();
        let config = CacheConfig::with_base_dir(dir.path()).max_entries(20);
        let cache = CacheStore::open(config).unwrap();

        for i in 0..60 {
            cache
                .put(&format!("key{i:03}"), result("payload"), vec![])
                .unwrap();
            assert!(cache.len() <= 20, "entry limit exceeded at insert {i}");
        }
        cache.enforce_limits();
        assert!(cache.len() <= 20);
        assert!(cache.stats().evictions >= 40);
        // the newest entry always survives
        assert!(cache.is_valid("key059"));
    }

    #[test]
    fn pressure_sweep_prefers_least_recently_accessed() {
        let dir = TempDir::new().unwrap();
        let config = CacheConfig::with_base_dir(dir.path()).max_entries(100);
        let cache = CacheStore::open(config).unwrap();
        for i in 0..85 {
            cache.put(&format!("e{i:03}"), result("v"), vec![]).unwrap();
        }
        std::thread::sleep(Duration::from_millis(5));
        // e000 becomes the most recently accessed
        assert!(cache.get("e000").is_some());
        for i in 85..90 {
            cache.put(&format!("e{i:03}"), result("v"), vec![]).unwrap();
        }

        // the put that reached the high-water mark swept inline
        assert!(cache.len() <= 75);
        assert!(cache.is_valid("e000"));
        assert!(!cache.is_valid("e001"));
    }

    #[test]
    fn byte_limit_is_enforced() {
        let dir = TempDir::new().unwrap();
        let one = CacheEntry::new("probe", result("p"), vec![]).size_bytes;
        let config = CacheConfig::with_base_dir(dir.path()).max_bytes(one * 3);
        let cache = CacheStore::open(config).unwrap();

        for i in 0..10 {
            cache.put(&format!("b{i:02}"), result("p"), vec![]).unwrap();
            assert!(cache.stats().total_bytes <= one * 3);
        }
    }

    #[tokio::test]
    async fn background_sweep_runs_on_interval() {
        let dir = TempDir::new().unwrap();
        let config = CacheConfig::with_base_dir(dir.path())
            .max_age(Duration::from_millis(20))
            .cleanup_interval(Duration::from_millis(30));
        let cache = CacheStore::open(config).unwrap();
        cache.put("sweepme", result("x"), vec![]).unwrap();
        cache.start_background_cleanup();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(cache.entry_info("sweepme"), None);
        cache.shutdown();
    }
}
