//! Content-addressed shared cache store.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::hashing::hash_bytes;

pub const STORE_LAYOUT_VERSION: &str = "v1";
pub const MANIFEST_VERSION: u32 = 1;
const MANIFEST_FILE: &str = "manifest.json";

/// One output file produced by a task, relative to its package directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputFile {
    pub rel_path: PathBuf,
    pub hash: String,
    pub mode: u32,
}

/// `manifest.json` of a cache entry. Its presence is the commit point: a
/// valid entry has a manifest and every listed output on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheManifest {
    pub version: u32,
    pub cache_key: String,
    pub outputs: Vec<ManifestEntry>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestEntry {
    pub rel_path: String,
    pub hash: String,
    pub mode: u32,
}

/// Store behavior toggles, normally read from the environment once during
/// context construction.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub root: PathBuf,
    /// Lookups allowed, stores suppressed (`SAIL_SKIP_CACHE_WRITE=1`).
    pub skip_writes: bool,
    /// Re-hash every listed output during lookup (`SAIL_CACHE_VERIFY=1`).
    pub verify_on_lookup: bool,
    /// Restore by hardlink when possible, falling back to copy.
    pub use_hardlinks: bool,
}

impl StoreOptions {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            skip_writes: false,
            verify_on_lookup: false,
            use_hardlinks: false,
        }
    }

    /// Applies the `SAIL_*` environment contract on top of the default cache
    /// location `<workspace root>/.sail-cache`.
    pub fn from_env(workspace_root: &Path) -> Self {
        let root = std::env::var_os("SAIL_CACHE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| workspace_root.join(".sail-cache"));
        Self {
            root,
            skip_writes: env_flag("SAIL_SKIP_CACHE_WRITE"),
            verify_on_lookup: env_flag("SAIL_CACHE_VERIFY"),
            use_hardlinks: false,
        }
    }
}

fn env_flag(name: &str) -> bool {
    std::env::var(name).map(|v| v == "1").unwrap_or(false)
}

#[derive(Debug, Default)]
pub struct StoreStats {
    hits: AtomicU64,
    misses: AtomicU64,
    stores: AtomicU64,
    corrupted: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub stores: u64,
    pub corrupted: u64,
}

/// On-disk content-addressed store of task output trees.
///
/// Layout: `<root>/v1/entries/<cacheKey>/{manifest.json, <outputs...>}`.
/// Writers stage a full entry in a private directory under `v1/staging` and
/// rename it into place, so readers observe either a complete entry or none.
pub struct SharedCacheStore {
    entries_dir: PathBuf,
    staging_dir: PathBuf,
    options: StoreOptions,
    stats: StoreStats,
    staging_seq: AtomicU64,
}

impl SharedCacheStore {
    /// Opens (creating if needed) the store below `options.root`.
    pub fn new(options: StoreOptions) -> Result<Self> {
        let versioned = options.root.join(STORE_LAYOUT_VERSION);
        let entries_dir = versioned.join("entries");
        let staging_dir = versioned.join("staging");
        std::fs::create_dir_all(&entries_dir).map_err(|e| Error::io(&entries_dir, e))?;
        std::fs::create_dir_all(&staging_dir).map_err(|e| Error::io(&staging_dir, e))?;
        Ok(Self {
            entries_dir,
            staging_dir,
            options,
            stats: StoreStats::default(),
            staging_seq: AtomicU64::new(0),
        })
    }

    fn entry_dir(&self, cache_key: &str) -> PathBuf {
        self.entries_dir.join(cache_key)
    }

    /// Checks whether a valid entry exists for `cache_key`.
    ///
    /// A directory without a manifest, a malformed manifest, a missing output,
    /// or (in verify mode) a hash mismatch all count as corruption: the entry
    /// is swept and the lookup reports a miss.
    pub fn lookup(&self, cache_key: &str) -> Result<Option<CacheManifest>> {
        let dir = self.entry_dir(cache_key);
        if !dir.is_dir() {
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        }

        match self.validate_entry(cache_key, &dir) {
            Ok(manifest) => {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                Ok(Some(manifest))
            }
            Err(reason) => {
                tracing::warn!(cache_key, %reason, "sweeping corrupt cache entry");
                let _ = std::fs::remove_dir_all(&dir);
                self.stats.corrupted.fetch_add(1, Ordering::Relaxed);
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    fn validate_entry(&self, cache_key: &str, dir: &Path) -> std::result::Result<CacheManifest, String> {
        let manifest_path = dir.join(MANIFEST_FILE);
        let raw = std::fs::read_to_string(&manifest_path)
            .map_err(|_| "missing manifest".to_string())?;
        let manifest: CacheManifest =
            serde_json::from_str(&raw).map_err(|e| format!("malformed manifest: {}", e))?;
        if manifest.version != MANIFEST_VERSION {
            return Err(format!("manifest version {}", manifest.version));
        }
        if manifest.cache_key != cache_key {
            return Err("manifest cache key mismatch".to_string());
        }
        for output in &manifest.outputs {
            let path = dir.join(&output.rel_path);
            if !path.is_file() {
                return Err(format!("missing output {}", output.rel_path));
            }
            if self.options.verify_on_lookup {
                let bytes = std::fs::read(&path)
                    .map_err(|_| format!("unreadable output {}", output.rel_path))?;
                if hash_bytes(&bytes) != output.hash {
                    return Err(format!("hash mismatch on {}", output.rel_path));
                }
            }
        }
        Ok(manifest)
    }

    /// Stores `outputs`, read from below `source_dir`, under `cache_key`.
    ///
    /// The full entry is staged in a per-writer directory and renamed into
    /// place; with concurrent writers of the same key the last one wins and
    /// no reader can observe a partially-mixed entry. A no-op when writes are
    /// suppressed.
    pub fn store(&self, cache_key: &str, source_dir: &Path, outputs: &[OutputFile]) -> Result<()> {
        if self.options.skip_writes {
            return Ok(());
        }

        let stage = self.staging_dir.join(format!(
            "{}-{}-{}",
            cache_key,
            std::process::id(),
            self.staging_seq.fetch_add(1, Ordering::Relaxed)
        ));
        std::fs::create_dir_all(&stage).map_err(|e| Error::io(&stage, e))?;

        let result = self.stage_entry(cache_key, source_dir, outputs, &stage);
        if result.is_err() {
            let _ = std::fs::remove_dir_all(&stage);
            return result;
        }

        let dir = self.entry_dir(cache_key);
        if dir.exists() {
            let _ = std::fs::remove_dir_all(&dir);
        }
        match std::fs::rename(&stage, &dir) {
            Ok(()) => {
                self.stats.stores.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(_) if dir.is_dir() => {
                // A concurrent writer committed the same key first.
                let _ = std::fs::remove_dir_all(&stage);
                Ok(())
            }
            Err(e) => {
                let _ = std::fs::remove_dir_all(&stage);
                Err(Error::io(&dir, e))
            }
        }
    }

    fn stage_entry(
        &self,
        cache_key: &str,
        source_dir: &Path,
        outputs: &[OutputFile],
        stage: &Path,
    ) -> Result<()> {
        let mut entries = Vec::with_capacity(outputs.len());
        for output in outputs {
            let src = source_dir.join(&output.rel_path);
            let dst = stage.join(&output.rel_path);
            if let Some(parent) = dst.parent() {
                std::fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
            }
            std::fs::copy(&src, &dst).map_err(|e| Error::io(&src, e))?;
            entries.push(ManifestEntry {
                rel_path: output.rel_path.to_string_lossy().replace('\\', "/"),
                hash: output.hash.clone(),
                mode: output.mode,
            });
        }

        // The manifest is written last: its presence is the commit point.
        let manifest = CacheManifest {
            version: MANIFEST_VERSION,
            cache_key: cache_key.to_string(),
            outputs: entries,
            created_at: iso8601_now(),
        };
        let raw = serde_json::to_vec_pretty(&manifest)
            .map_err(|e| Error::internal(format!("failed to serialize manifest: {}", e)))?;
        let manifest_path = stage.join(MANIFEST_FILE);
        std::fs::write(&manifest_path, raw).map_err(|e| Error::io(&manifest_path, e))?;
        Ok(())
    }

    /// Materializes the entry's outputs into `dest_dir`. Each file is placed
    /// atomically: written (or hardlinked) to a temporary sibling, synced,
    /// then renamed, so the working tree never holds partial files.
    ///
    /// # Errors
    ///
    /// Returns a `Validation` error when no valid entry exists.
    pub fn restore(&self, cache_key: &str, dest_dir: &Path) -> Result<CacheManifest> {
        let dir = self.entry_dir(cache_key);
        let manifest = self.validate_entry(cache_key, &dir).map_err(|reason| {
            self.stats.corrupted.fetch_add(1, Ordering::Relaxed);
            let _ = std::fs::remove_dir_all(&dir);
            Error::CorruptCacheEntry {
                cache_key: cache_key.to_string(),
                reason,
            }
        })?;

        for output in &manifest.outputs {
            let src = dir.join(&output.rel_path);
            let dst = dest_dir.join(&output.rel_path);
            if let Some(parent) = dst.parent() {
                std::fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
            }
            let tmp = dst.with_extension("sail-restore-tmp");
            let _ = std::fs::remove_file(&tmp);

            let mut linked = false;
            if self.options.use_hardlinks {
                linked = std::fs::hard_link(&src, &tmp).is_ok();
            }
            if !linked {
                std::fs::copy(&src, &tmp).map_err(|e| Error::io(&src, e))?;
                let file = std::fs::File::open(&tmp).map_err(|e| Error::io(&tmp, e))?;
                file.sync_all().map_err(|e| Error::io(&tmp, e))?;
                set_mode(&tmp, output.mode)?;
            }
            std::fs::rename(&tmp, &dst).map_err(|e| Error::io(&dst, e))?;
        }
        Ok(manifest)
    }

    pub fn statistics(&self) -> StoreStatsSnapshot {
        StoreStatsSnapshot {
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            stores: self.stats.stores.load(Ordering::Relaxed),
            corrupted: self.stats.corrupted.load(Ordering::Relaxed),
        }
    }

    pub fn options(&self) -> &StoreOptions {
        &self.options
    }
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    if mode == 0 {
        return Ok(());
    }
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .map_err(|e| Error::io(path, e))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

/// Reads a file's permission bits, for manifest entries.
pub fn file_mode(path: &Path) -> u32 {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::metadata(path)
            .map(|m| m.permissions().mode() & 0o7777)
            .unwrap_or(0o644)
    }
    #[cfg(not(unix))]
    {
        let _ = path;
        0o644
    }
}

/// UTC timestamp in ISO 8601 form, without external time crates.
fn iso8601_now() -> String {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let days = secs / 86_400;
    let (year, month, day) = civil_from_days(days as i64);
    let rem = secs % 86_400;
    format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}Z",
        year,
        month,
        day,
        rem / 3600,
        (rem % 3600) / 60,
        rem % 60
    )
}

// Howard Hinnant's days-from-civil inverse.
fn civil_from_days(z: i64) -> (i64, u32, u32) {
    let z = z + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = z - era * 146_097;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let y = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let m = if mp < 10 { (mp + 3) as u32 } else { (mp - 9) as u32 };
    (if m <= 2 { y + 1 } else { y }, m, d)
}
