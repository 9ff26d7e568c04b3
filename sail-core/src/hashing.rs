//! Memoized file content hashing with on-disk persistence.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::UNIX_EPOCH;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const HASH_CACHE_VERSION: u32 = 1;
const READ_BUF_SIZE: usize = 64 * 1024;

/// A memoized content hash with its invalidation key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileHash {
    pub mtime_ns: u128,
    pub size: u64,
    pub content_hash: String,
}

#[derive(Serialize, Deserialize)]
struct PersistedHashes {
    version: u32,
    entries: Vec<(PathBuf, bool, FileHash)>,
}

/// Capability interface for hash caches that can be written to disk.
pub trait PersistableHashCache {
    fn persist(&self) -> Result<()>;
}

/// Content-hashes files with in-memory memoization and cross-run persistence.
///
/// `(mtime, size)` acts as the invalidation key: when both match the memoized
/// record, the stored hash is returned without reading the file. Hashing of
/// distinct paths is safe concurrently; a per-path lock prevents duplicate
/// work on the same path.
pub struct FileHashCache {
    entries: DashMap<(PathBuf, bool), FileHash>,
    in_flight: DashMap<(PathBuf, bool), Arc<Mutex<()>>>,
    persist_path: Option<PathBuf>,
    dirty: AtomicBool,
}

impl FileHashCache {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            in_flight: DashMap::new(),
            persist_path: None,
            dirty: AtomicBool::new(false),
        }
    }

    /// Creates a cache backed by `path`, loading any previously persisted
    /// entries. A stale or unreadable memo file is treated as empty.
    pub fn with_persistence(path: PathBuf) -> Self {
        let cache = Self {
            entries: DashMap::new(),
            in_flight: DashMap::new(),
            persist_path: Some(path),
            dirty: AtomicBool::new(false),
        };
        cache.load_persisted();
        cache
    }

    fn load_persisted(&self) {
        let Some(path) = &self.persist_path else {
            return;
        };
        let Ok(compressed) = std::fs::read(path) else {
            return;
        };
        let Ok(raw) = zstd::decode_all(&compressed[..]) else {
            tracing::debug!(path = %path.display(), "discarding unreadable file hash memo");
            return;
        };
        let Ok(persisted) = bincode::deserialize::<PersistedHashes>(&raw) else {
            tracing::debug!(path = %path.display(), "discarding incompatible file hash memo");
            return;
        };
        if persisted.version != HASH_CACHE_VERSION {
            return;
        }
        for (file, text, hash) in persisted.entries {
            self.entries.insert((file, text), hash);
        }
    }

    /// Content hash of `path`, byte-exact.
    pub fn hash(&self, path: &Path) -> Result<String> {
        self.hash_with_mode(path, false)
    }

    /// Content hash of `path`. In text mode carriage returns are stripped
    /// before hashing so line endings do not affect the result.
    pub fn hash_with_mode(&self, path: &Path, text: bool) -> Result<String> {
        let key = (path.to_path_buf(), text);
        let (mtime_ns, size) = stat(path)?;

        if let Some(entry) = self.entries.get(&key) {
            if entry.mtime_ns == mtime_ns && entry.size == size {
                return Ok(entry.content_hash.clone());
            }
        }

        let guard = self
            .in_flight
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone();
        let _held = guard.lock().map_err(|_| {
            Error::internal(format!("poisoned hash lock for {}", path.display()))
        })?;

        // Another thread may have hashed the file while we waited.
        if let Some(entry) = self.entries.get(&key) {
            if entry.mtime_ns == mtime_ns && entry.size == size {
                return Ok(entry.content_hash.clone());
            }
        }

        let content_hash = if text {
            hash_file_text(path)?
        } else {
            hash_file_bytes(path)?
        };
        self.entries.insert(
            key,
            FileHash {
                mtime_ns,
                size,
                content_hash: content_hash.clone(),
            },
        );
        self.dirty.store(true, Ordering::Release);
        Ok(content_hash)
    }

    pub fn clear(&self) {
        self.entries.clear();
        self.dirty.store(true, Ordering::Release);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for FileHashCache {
    fn default() -> Self {
        Self::new()
    }
}

impl PersistableHashCache for FileHashCache {
    /// Writes the memo to disk, atomically. A no-op when nothing changed or
    /// no persistence path was configured.
    fn persist(&self) -> Result<()> {
        let Some(path) = &self.persist_path else {
            return Ok(());
        };
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(());
        }

        let persisted = PersistedHashes {
            version: HASH_CACHE_VERSION,
            entries: self
                .entries
                .iter()
                .map(|entry| {
                    let (file, text) = entry.key().clone();
                    (file, text, entry.value().clone())
                })
                .collect(),
        };

        let raw = bincode::serialize(&persisted)
            .map_err(|e| Error::internal(format!("failed to serialize hash memo: {}", e)))?;
        let compressed = zstd::encode_all(&raw[..], 3)
            .map_err(|e| Error::io(path, e))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
        }
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, compressed).map_err(|e| Error::io(&tmp, e))?;
        std::fs::rename(&tmp, path).map_err(|e| Error::io(path, e))?;
        Ok(())
    }
}

fn stat(path: &Path) -> Result<(u128, u64)> {
    let metadata = std::fs::metadata(path).map_err(|e| Error::io(path, e))?;
    let mtime_ns = metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    Ok((mtime_ns, metadata.len()))
}

fn hash_file_bytes(path: &Path) -> Result<String> {
    let mut file = File::open(path).map_err(|e| Error::io(path, e))?;
    let mut hasher = blake3::Hasher::new();
    let mut buf = vec![0u8; READ_BUF_SIZE];
    loop {
        let read = file.read(&mut buf).map_err(|e| Error::io(path, e))?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(hasher.finalize().to_hex().to_string())
}

fn hash_file_text(path: &Path) -> Result<String> {
    let bytes = std::fs::read(path).map_err(|e| Error::io(path, e))?;
    let mut hasher = blake3::Hasher::new();
    for chunk in bytes.split(|b| *b == b'\r') {
        hasher.update(chunk);
    }
    Ok(hasher.finalize().to_hex().to_string())
}

/// Content hash of an in-memory byte slice, using the same function as file
/// hashing.
pub fn hash_bytes(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_memoized_hash_stable() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.txt");
        fs::write(&file, "hello").unwrap();

        let cache = FileHashCache::new();
        let first = cache.hash(&file).unwrap();
        let second = cache.hash(&file).unwrap();
        assert_eq!(first, second);
        assert_eq!(first, hash_bytes(b"hello"));
    }

    #[test]
    fn test_rehash_on_content_change() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.txt");
        fs::write(&file, "hello").unwrap();

        let cache = FileHashCache::new();
        let first = cache.hash(&file).unwrap();
        fs::write(&file, "goodbye").unwrap();
        let second = cache.hash(&file).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn test_text_mode_ignores_line_endings() {
        let dir = tempfile::tempdir().unwrap();
        let unix = dir.path().join("unix.txt");
        let dos = dir.path().join("dos.txt");
        fs::write(&unix, "a\nb\n").unwrap();
        fs::write(&dos, "a\r\nb\r\n").unwrap();

        let cache = FileHashCache::new();
        assert_eq!(
            cache.hash_with_mode(&unix, true).unwrap(),
            cache.hash_with_mode(&dos, true).unwrap()
        );
        assert_ne!(cache.hash(&unix).unwrap(), cache.hash(&dos).unwrap());
    }

    #[test]
    fn test_persist_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.txt");
        fs::write(&file, "persist me").unwrap();
        let memo = dir.path().join("memo.bin");

        let cache = FileHashCache::with_persistence(memo.clone());
        let hash = cache.hash(&file).unwrap();
        cache.persist().unwrap();

        let reloaded = FileHashCache::with_persistence(memo);
        assert_eq!(reloaded.len(), 1);
        assert_eq!(reloaded.hash(&file).unwrap(), hash);
    }

    #[test]
    fn test_missing_file_is_filesystem_error() {
        let cache = FileHashCache::new();
        let err = cache.hash(Path::new("/definitely/not/here.txt")).unwrap_err();
        assert!(err.is_retryable());
    }
}
