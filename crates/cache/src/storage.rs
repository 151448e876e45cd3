//! Durable layer of the cache
//!
//! ```text
//! <base_dir>/entries/<k[0..2]>/<key>.json   one CacheEntry per key
//! <base_dir>/metadata.json                  aggregate CacheMetadataRecord
//! ```
//!
//! Every write goes through a temp file in the destination directory and is
//! renamed into place, so a crash never leaves a half-written record behind.

use crate::entry::{CacheEntry, CacheMetadataRecord, RECORD_VERSION};
use crate::errors::{CacheError, RecoveryHint, Result, SerializationOp};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

const ENTRIES_DIR: &str = "entries";
const METADATA_FILE: &str = "metadata.json";
const RECORD_EXTENSION: &str = "json";

/// Result of scanning the durable layer
#[derive(Debug, Default)]
pub struct ScanOutcome {
    pub entries: Vec<CacheEntry>,
    /// Record files that could not be read or parsed
    pub corrupted: Vec<PathBuf>,
}

/// File-backed record store
#[derive(Debug, Clone)]
pub struct DiskStorage {
    root: PathBuf,
}

impl DiskStorage {
    /// Open (creating if needed) the layout under `root`
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let entries = root.join(ENTRIES_DIR);
        fs::create_dir_all(&entries)
            .map_err(|e| CacheError::io(&entries, "create cache directory", e))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn entries_dir(&self) -> PathBuf {
        self.root.join(ENTRIES_DIR)
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.root.join(METADATA_FILE)
    }

    /// Sharded location of the record for `key`
    pub fn entry_path(&self, key: &str) -> Result<PathBuf> {
        validate_key(key)?;
        let shard = &key[..2.min(key.len())];
        Ok(self
            .entries_dir()
            .join(shard)
            .join(format!("{key}.{RECORD_EXTENSION}")))
    }

    /// Read the record for `key`. A missing record is `Ok(None)`.
    pub fn read(&self, key: &str) -> Result<Option<CacheEntry>> {
        let path = self.entry_path(key)?;
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(CacheError::io(&path, "read cache record", e)),
        };
        let entry = decode_entry(key, &bytes)?;
        if entry.key != key {
            return Err(CacheError::corruption(
                key,
                format!("record stored under '{key}' claims key '{}'", entry.key),
            ));
        }
        Ok(Some(entry))
    }

    pub fn write(&self, entry: &CacheEntry) -> Result<()> {
        let path = self.entry_path(&entry.key)?;
        let bytes = serde_json::to_vec(entry).map_err(|e| CacheError::Serialization {
            key: entry.key.clone(),
            operation: SerializationOp::Serialize,
            source: e,
            recovery_hint: RecoveryHint::Ignore,
        })?;
        write_atomic(&path, &bytes)
    }

    /// Delete the record for `key`, returning whether one existed
    pub fn remove(&self, key: &str) -> Result<bool> {
        let path = self.entry_path(key)?;
        remove_file(&path)
    }

    /// Delete a record file by path (used for corrupted files)
    pub fn remove_path(&self, path: &Path) -> Result<bool> {
        remove_file(path)
    }

    /// Load every record, separating out the ones that fail to parse
    pub fn scan(&self) -> Result<ScanOutcome> {
        let mut outcome = ScanOutcome::default();
        let entries_dir = self.entries_dir();
        let shards = match fs::read_dir(&entries_dir) {
            Ok(shards) => shards,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(outcome),
            Err(e) => return Err(CacheError::io(&entries_dir, "scan cache directory", e)),
        };

        for shard in shards.flatten() {
            let shard_path = shard.path();
            if !shard_path.is_dir() {
                continue;
            }
            let files = match fs::read_dir(&shard_path) {
                Ok(files) => files,
                Err(e) => {
                    tracing::warn!(path = %shard_path.display(), error = %e, "Failed to read cache shard");
                    continue;
                }
            };
            for file in files.flatten() {
                let path = file.path();
                if path.extension().and_then(|s| s.to_str()) != Some(RECORD_EXTENSION) {
                    continue;
                }
                match load_record(&path) {
                    Ok(entry) => outcome.entries.push(entry),
                    Err(e) => {
                        tracing::debug!(path = %path.display(), error = %e, "Corrupted cache record");
                        outcome.corrupted.push(path);
                    }
                }
            }
        }

        Ok(outcome)
    }

    pub fn write_metadata(&self, record: &CacheMetadataRecord) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(record).map_err(|e| CacheError::Serialization {
            key: METADATA_FILE.to_string(),
            operation: SerializationOp::Serialize,
            source: e,
            recovery_hint: RecoveryHint::Ignore,
        })?;
        write_atomic(&self.metadata_path(), &bytes)
    }

    pub fn read_metadata(&self) -> Option<CacheMetadataRecord> {
        let bytes = fs::read(self.metadata_path()).ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    /// Remove every record and the metadata file
    pub fn clear(&self) -> Result<()> {
        let entries_dir = self.entries_dir();
        match fs::remove_dir_all(&entries_dir) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(CacheError::io(&entries_dir, "clear cache directory", e)),
        }
        remove_file(&self.metadata_path())?;
        fs::create_dir_all(&entries_dir)
            .map_err(|e| CacheError::io(&entries_dir, "create cache directory", e))
    }
}

fn validate_key(key: &str) -> Result<()> {
    let valid = key.len() >= 2
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(CacheError::InvalidKey {
            key: key.to_string(),
            reason: "keys must be at least two characters of [A-Za-z0-9_-]".to_string(),
            recovery_hint: RecoveryHint::Ignore,
        })
    }
}

fn decode_entry(key: &str, bytes: &[u8]) -> Result<CacheEntry> {
    let entry: CacheEntry =
        serde_json::from_slice(bytes).map_err(|e| CacheError::Serialization {
            key: key.to_string(),
            operation: SerializationOp::Deserialize,
            source: e,
            recovery_hint: RecoveryHint::ClearAndRetry,
        })?;
    if entry.version != RECORD_VERSION {
        return Err(CacheError::corruption(
            key,
            format!("unsupported record version {}", entry.version),
        ));
    }
    Ok(entry)
}

fn load_record(path: &Path) -> Result<CacheEntry> {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_string();
    let bytes = fs::read(path).map_err(|e| CacheError::io(path, "read cache record", e))?;
    let entry = decode_entry(&stem, &bytes)?;
    if entry.key != stem {
        return Err(CacheError::corruption(stem, "record key does not match file name"));
    }
    Ok(entry)
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir).map_err(|e| CacheError::io(dir, "create cache shard", e))?;

    let mut temp = tempfile::NamedTempFile::new_in(dir)
        .map_err(|e| CacheError::io(dir, "create temp file", e))?;
    temp.write_all(bytes)
        .map_err(|e| CacheError::io(temp.path(), "write temp file", e))?;
    temp.persist(path)
        .map_err(|e| CacheError::io(path, "persist cache record", e.error))?;
    Ok(())
}

fn remove_file(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(CacheError::io(path, "remove cache record", e)),
    }
}
