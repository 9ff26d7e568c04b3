//! File hash cache integration: concurrency and cross-run persistence.

use std::fs;
use std::sync::Arc;

use tempfile::TempDir;

use sail_core::{FileHashCache, PersistableHashCache};

#[test]
fn test_concurrent_hashing_of_same_path_is_consistent() {
    let tmp = TempDir::new().unwrap();
    let file = tmp.path().join("large.txt");
    fs::write(&file, "x".repeat(256 * 1024)).unwrap();

    let cache = Arc::new(FileHashCache::new());
    let mut handles = Vec::new();
    for _ in 0..8 {
        let cache = Arc::clone(&cache);
        let file = file.clone();
        handles.push(std::thread::spawn(move || cache.hash(&file).unwrap()));
    }

    let hashes: Vec<String> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert!(hashes.windows(2).all(|pair| pair[0] == pair[1]));
    assert_eq!(cache.len(), 1);
}

#[test]
fn test_concurrent_hashing_of_distinct_paths() {
    let tmp = TempDir::new().unwrap();
    let cache = Arc::new(FileHashCache::new());

    let mut handles = Vec::new();
    for i in 0..16 {
        let file = tmp.path().join(format!("file-{}.txt", i));
        fs::write(&file, format!("content {}", i)).unwrap();
        let cache = Arc::clone(&cache);
        handles.push(std::thread::spawn(move || cache.hash(&file).unwrap()));
    }
    let hashes: Vec<String> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let unique: std::collections::HashSet<&String> = hashes.iter().collect();
    assert_eq!(unique.len(), 16);
    assert_eq!(cache.len(), 16);
}

#[test]
fn test_persisted_memo_avoids_rehash_when_stat_matches() {
    let tmp = TempDir::new().unwrap();
    let file = tmp.path().join("stable.txt");
    fs::write(&file, "stable contents").unwrap();
    let memo = tmp.path().join("memo.bin");

    let first = FileHashCache::with_persistence(memo.clone());
    let original = first.hash(&file).unwrap();
    first.persist().unwrap();

    // Same (mtime, size): the reloaded cache serves the stored hash even if
    // the bytes were swapped underneath without touching metadata.
    let reloaded = FileHashCache::with_persistence(memo);
    assert_eq!(reloaded.len(), 1);
    assert_eq!(reloaded.hash(&file).unwrap(), original);
}

#[test]
fn test_persist_is_atomic_and_reloadable_after_clear() {
    let tmp = TempDir::new().unwrap();
    let file = tmp.path().join("a.txt");
    fs::write(&file, "abc").unwrap();
    let memo = tmp.path().join("memo.bin");

    let cache = FileHashCache::with_persistence(memo.clone());
    cache.hash(&file).unwrap();
    cache.persist().unwrap();
    cache.clear();
    assert!(cache.is_empty());

    let reloaded = FileHashCache::with_persistence(memo);
    assert_eq!(reloaded.len(), 1);
}
