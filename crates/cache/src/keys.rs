//! Deterministic cache key derivation
//!
//! A key is the SHA-256 over, in order: the content hash of every source
//! file (caller order), the compiler command, its arguments (caller order),
//! the optimization level, the debug and warnings flags, and the environment
//! variables sorted by name. Each component is tagged and length-prefixed so
//! that different inputs cannot concatenate to the same byte stream.

use crate::errors::{CacheError, RecoveryHint, Result};
use kiln_core::{CompileTask, CompilerConfig};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Prefix of the sentinel used in place of an unreadable file's hash
pub const MISSING_FILE_PREFIX: &str = "missing:";

/// Prefix of keys that are guaranteed to miss
pub const FALLBACK_KEY_PREFIX: &str = "uncached-";

static FALLBACK_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Derives cache keys from compile inputs
#[derive(Debug, Default, Clone)]
pub struct HashKeyGenerator;

impl HashKeyGenerator {
    pub fn new() -> Self {
        Self
    }

    /// Key for `task`, never failing.
    ///
    /// When derivation fails a unique fallback key is returned, forcing a
    /// cache miss instead of risking a false hit.
    pub fn generate(&self, task: &CompileTask) -> String {
        match self.try_generate(task) {
            Ok(key) => key,
            Err(e) => {
                tracing::warn!(task_id = %task.id, error = %e, "Cache key derivation failed, using unique key");
                Self::unique_fallback_key()
            }
        }
    }

    /// Key for `task`, reporting why derivation failed
    pub fn try_generate(&self, task: &CompileTask) -> Result<String> {
        let file_hashes = task
            .sources
            .iter()
            .map(|path| self.source_fingerprint(path))
            .collect::<Result<Vec<_>>>()?;

        Ok(self.key_from_parts(&file_hashes, &task.compiler, &task.env))
    }

    /// Combine already-computed file hashes with the compiler inputs
    pub fn key_from_parts(
        &self,
        file_hashes: &[String],
        compiler: &CompilerConfig,
        env: &HashMap<String, String>,
    ) -> String {
        let mut hasher = Sha256::new();

        write_count(&mut hasher, b"files", file_hashes.len());
        for hash in file_hashes {
            write_field(&mut hasher, b"file", hash.as_bytes());
        }

        write_field(&mut hasher, b"command", compiler.command.as_bytes());

        write_count(&mut hasher, b"args", compiler.args.len());
        for arg in &compiler.args {
            write_field(&mut hasher, b"arg", arg.as_bytes());
        }

        write_field(
            &mut hasher,
            b"opt",
            compiler.optimization.to_string().as_bytes(),
        );
        write_field(&mut hasher, b"debug", &[u8::from(compiler.debug)]);
        write_field(&mut hasher, b"warnings", &[u8::from(compiler.warnings)]);

        let sorted: BTreeMap<&String, &String> = env.iter().collect();
        write_count(&mut hasher, b"env", sorted.len());
        for (name, value) in sorted {
            write_field(&mut hasher, b"env-name", name.as_bytes());
            write_field(&mut hasher, b"env-value", value.as_bytes());
        }

        hex::encode(hasher.finalize())
    }

    /// Content hash of a source file, or the missing sentinel when unreadable
    fn source_fingerprint(&self, path: &Path) -> Result<String> {
        let source = path.to_str().ok_or_else(|| CacheError::InvalidKey {
            key: path.to_string_lossy().into_owned(),
            reason: "source path is not valid UTF-8".to_string(),
            recovery_hint: RecoveryHint::Ignore,
        })?;

        match hash_file(path) {
            Ok(hash) => Ok(hash),
            Err(e) => {
                tracing::debug!(path = source, error = %e, "Source unreadable, hashing sentinel");
                Ok(format!("{MISSING_FILE_PREFIX}{source}"))
            }
        }
    }

    /// A key unique to this call
    pub fn unique_fallback_key() -> String {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let n = FALLBACK_COUNTER.fetch_add(1, Ordering::Relaxed);
        format!("{FALLBACK_KEY_PREFIX}{nanos}-{n}-{}", uuid::Uuid::new_v4().simple())
    }

    pub fn is_fallback_key(key: &str) -> bool {
        key.starts_with(FALLBACK_KEY_PREFIX)
    }
}

fn write_field(hasher: &mut Sha256, tag: &[u8], bytes: &[u8]) {
    hasher.update(tag);
    hasher.update((bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}

fn write_count(hasher: &mut Sha256, tag: &[u8], count: usize) {
    hasher.update(tag);
    hasher.update((count as u64).to_le_bytes());
}

/// Streaming SHA-256 of a file's contents, hex encoded
pub fn hash_file(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];

    loop {
        let bytes_read = file.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// SHA-256 of a byte slice, hex encoded
pub fn hash_bytes(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Paths of `task`'s sources whose contents could not be read
pub fn unreadable_sources(task: &CompileTask) -> Vec<PathBuf> {
    task.sources
        .iter()
        .filter(|p| std::fs::File::open(p).is_err())
        .cloned()
        .collect()
}
