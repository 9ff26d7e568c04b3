//! Deterministic cache key construction.

use std::collections::BTreeMap;

use crate::error::{Error, Result};

/// Inputs to a task's cache key.
///
/// The digest is independent of timestamps, absolute paths, and iteration
/// order: paths are package-relative, maps are ordered, and upstream keys are
/// sorted before hashing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKey {
    /// Whitespace-normalized command line.
    pub command: String,
    pub tool_version: Option<String>,
    /// Package-relative input path to content hash.
    pub input_hashes: BTreeMap<String, String>,
    /// Cache keys of upstream tasks, sorted.
    pub upstream_keys: Vec<String>,
    pub lockfile_hash: String,
    /// Declared environment variables; `None` marks a declared-but-unset
    /// variable, which is distinct from an empty value.
    pub env: BTreeMap<String, Option<String>>,
}

impl CacheKey {
    pub fn builder() -> CacheKeyBuilder {
        CacheKeyBuilder::default()
    }

    /// Hex-encoded blake3 digest over the canonical encoding.
    pub fn digest(&self) -> String {
        let mut hasher = blake3::Hasher::new();

        feed(&mut hasher, b"cmd", self.command.as_bytes());
        match &self.tool_version {
            Some(version) => feed(&mut hasher, b"tool", version.as_bytes()),
            None => feed(&mut hasher, b"tool", b""),
        }

        hasher.update(b"inputs");
        hasher.update(&(self.input_hashes.len() as u64).to_le_bytes());
        for (path, hash) in &self.input_hashes {
            feed(&mut hasher, b"path", path.as_bytes());
            feed(&mut hasher, b"hash", hash.as_bytes());
        }

        hasher.update(b"upstream");
        hasher.update(&(self.upstream_keys.len() as u64).to_le_bytes());
        for key in &self.upstream_keys {
            feed(&mut hasher, b"key", key.as_bytes());
        }

        feed(&mut hasher, b"lock", self.lockfile_hash.as_bytes());

        hasher.update(b"env");
        hasher.update(&(self.env.len() as u64).to_le_bytes());
        for (name, value) in &self.env {
            feed(&mut hasher, b"name", name.as_bytes());
            match value {
                Some(value) => feed(&mut hasher, b"set", value.as_bytes()),
                None => feed(&mut hasher, b"unset", b""),
            }
        }

        hasher.finalize().to_hex().to_string()
    }

    /// A group task's key is a stable hash of its children's keys.
    pub fn group_digest(child_keys: &[String]) -> String {
        let mut sorted: Vec<&String> = child_keys.iter().collect();
        sorted.sort();
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"group");
        hasher.update(&(sorted.len() as u64).to_le_bytes());
        for key in sorted {
            feed(&mut hasher, b"child", key.as_bytes());
        }
        hasher.finalize().to_hex().to_string()
    }
}

fn feed(hasher: &mut blake3::Hasher, tag: &[u8], bytes: &[u8]) {
    hasher.update(tag);
    hasher.update(&(bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}

/// Collapses runs of whitespace so formatting differences in a command do not
/// invalidate the cache.
pub fn normalize_command(command: &str) -> String {
    command.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[derive(Debug, Default)]
pub struct CacheKeyBuilder {
    command: Option<String>,
    tool_version: Option<String>,
    input_hashes: BTreeMap<String, String>,
    upstream_keys: Vec<String>,
    lockfile_hash: Option<String>,
    env: BTreeMap<String, Option<String>>,
}

impl CacheKeyBuilder {
    pub fn command(mut self, command: impl AsRef<str>) -> Self {
        self.command = Some(normalize_command(command.as_ref()));
        self
    }

    pub fn tool_version(mut self, version: impl Into<String>) -> Self {
        self.tool_version = Some(version.into());
        self
    }

    pub fn input(mut self, relative_path: impl Into<String>, hash: impl Into<String>) -> Self {
        self.input_hashes.insert(relative_path.into(), hash.into());
        self
    }

    pub fn upstream_key(mut self, key: impl Into<String>) -> Self {
        self.upstream_keys.push(key.into());
        self
    }

    pub fn lockfile_hash(mut self, hash: impl Into<String>) -> Self {
        self.lockfile_hash = Some(hash.into());
        self
    }

    pub fn env_var(mut self, name: impl Into<String>, value: Option<String>) -> Self {
        self.env.insert(name.into(), value);
        self
    }

    /// # Errors
    ///
    /// Returns an `Internal` error when a required field is missing; callers
    /// always set the command and lockfile hash.
    pub fn build(mut self) -> Result<CacheKey> {
        self.upstream_keys.sort();
        Ok(CacheKey {
            command: self
                .command
                .ok_or_else(|| Error::internal("cache key requires a command"))?,
            tool_version: self.tool_version,
            input_hashes: self.input_hashes,
            upstream_keys: self.upstream_keys,
            lockfile_hash: self
                .lockfile_hash
                .ok_or_else(|| Error::internal("cache key requires a lockfile hash"))?,
            env: self.env,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> CacheKeyBuilder {
        CacheKey::builder().command("tsc --build").lockfile_hash("lock")
    }

    #[test]
    fn test_digest_deterministic() {
        let a = base()
            .input("src/a.ts", "h1")
            .input("src/b.ts", "h2")
            .upstream_key("u2")
            .upstream_key("u1")
            .build()
            .unwrap();
        let b = base()
            .input("src/b.ts", "h2")
            .input("src/a.ts", "h1")
            .upstream_key("u1")
            .upstream_key("u2")
            .build()
            .unwrap();
        assert_eq!(a.digest(), b.digest());
    }

    #[test]
    fn test_digest_sensitive_to_inputs() {
        let a = base().input("src/a.ts", "h1").build().unwrap();
        let b = base().input("src/a.ts", "h2").build().unwrap();
        assert_ne!(a.digest(), b.digest());
    }

    #[test]
    fn test_unset_env_distinct_from_empty() {
        let unset = base().env_var("NODE_ENV", None).build().unwrap();
        let empty = base()
            .env_var("NODE_ENV", Some(String::new()))
            .build()
            .unwrap();
        assert_ne!(unset.digest(), empty.digest());
    }

    #[test]
    fn test_command_normalization() {
        let a = base().build().unwrap();
        let b = CacheKey::builder()
            .command("tsc   --build")
            .lockfile_hash("lock")
            .build()
            .unwrap();
        assert_eq!(a.digest(), b.digest());
    }

    #[test]
    fn test_group_digest_order_independent() {
        let a = CacheKey::group_digest(&["k1".to_string(), "k2".to_string()]);
        let b = CacheKey::group_digest(&["k2".to_string(), "k1".to_string()]);
        assert_eq!(a, b);
        assert_ne!(a, CacheKey::group_digest(&["k1".to_string()]));
    }
}
