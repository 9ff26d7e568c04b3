//! Worker pool integration against a shell stand-in for the protocol.

use std::collections::BTreeMap;
use std::path::PathBuf;

use sail_core::{WorkerPool, WorkerPoolConfig, WorkerRequest};

/// A minimal protocol peer: answers every request line with a fixed
/// well-formed response.
fn echo_worker_config() -> WorkerPoolConfig {
    let script = r#"while read line; do printf '{"exitCode":0,"stdout":"ok","stderr":"","durationMs":1,"rssBytes":0}\n'; done"#;
    let mut config = WorkerPoolConfig::new(
        PathBuf::from("sh"),
        vec!["-c".to_string(), script.to_string()],
    );
    config.size = 2;
    config
}

fn request() -> WorkerRequest {
    WorkerRequest {
        command: "true".to_string(),
        args: Vec::new(),
        cwd: std::env::temp_dir(),
        env: BTreeMap::new(),
    }
}

#[test]
fn test_submit_roundtrips_through_a_pooled_worker() {
    let pool = WorkerPool::new(echo_worker_config());
    let response = pool.submit(&request()).unwrap();
    assert_eq!(response.exit_code, 0);
    assert_eq!(response.stdout, "ok");
    pool.shutdown();
}

#[test]
fn test_workers_are_reused_and_recycled() {
    let mut config = echo_worker_config();
    config.size = 1;
    config.max_tasks_per_worker = 2;
    let pool = WorkerPool::new(config);

    // Five requests through a single slot: the worker is recycled after
    // every second request and replaced transparently.
    for _ in 0..5 {
        let response = pool.submit(&request()).unwrap();
        assert_eq!(response.exit_code, 0);
    }
    pool.shutdown();
}

#[test]
fn test_ipc_failure_is_a_retryable_worker_error() {
    // A worker that exits immediately closes its pipe before responding.
    let mut config = WorkerPoolConfig::new(
        PathBuf::from("sh"),
        vec!["-c".to_string(), "exit 0".to_string()],
    );
    config.size = 1;
    let pool = WorkerPool::new(config);

    let error = pool.submit(&request()).unwrap_err();
    assert!(error.is_retryable());
    assert!(error.to_string().contains("Worker"), "{}", error);
    pool.shutdown();
}

#[test]
fn test_shutdown_rejects_new_work() {
    let pool = WorkerPool::new(echo_worker_config());
    pool.shutdown();
    assert!(pool.submit(&request()).is_err());
}
