//! Reusable subprocess worker pool with a stdio JSON-lines protocol.

use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Read, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::{Condvar, Mutex};
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// One request over the worker protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerRequest {
    pub command: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerResponse {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    /// Worker resident set size after handling the request; zero where the
    /// platform offers no cheap probe.
    pub rss_bytes: u64,
}

/// Worker pool sizing and recycling limits.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Program spawned for each worker; it must speak the protocol on stdio.
    /// The CLI passes its own executable with the `worker` subcommand.
    pub program: PathBuf,
    pub args: Vec<String>,
    pub size: usize,
    /// Recycle a worker after this many requests.
    pub max_tasks_per_worker: u32,
    /// Recycle a worker when its reported RSS exceeds this many bytes.
    pub max_rss_bytes: u64,
}

impl WorkerPoolConfig {
    pub fn new(program: PathBuf, args: Vec<String>) -> Self {
        Self {
            program,
            args,
            size: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            max_tasks_per_worker: 64,
            max_rss_bytes: 2 * 1024 * 1024 * 1024,
        }
    }
}

struct WorkerProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    tasks_done: u32,
}

impl WorkerProcess {
    fn spawn(config: &WorkerPoolConfig) -> Result<Self> {
        let mut child = Command::new(&config.program)
            .args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| Error::Worker {
                message: format!("failed to spawn {}: {}", config.program.display(), e),
            })?;
        let stdin = child.stdin.take().ok_or_else(|| Error::Worker {
            message: "worker stdin unavailable".to_string(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| Error::Worker {
            message: "worker stdout unavailable".to_string(),
        })?;
        Ok(Self {
            child,
            stdin,
            stdout: BufReader::new(stdout),
            tasks_done: 0,
        })
    }

    fn roundtrip(&mut self, request: &WorkerRequest) -> Result<WorkerResponse> {
        let mut line = serde_json::to_string(request).map_err(|e| Error::Worker {
            message: format!("failed to encode request: {}", e),
        })?;
        line.push('\n');
        self.stdin
            .write_all(line.as_bytes())
            .and_then(|()| self.stdin.flush())
            .map_err(|e| Error::Worker {
                message: format!("failed to write request: {}", e),
            })?;

        let mut response_line = String::new();
        let read = self
            .stdout
            .read_line(&mut response_line)
            .map_err(|e| Error::Worker {
                message: format!("failed to read response: {}", e),
            })?;
        if read == 0 {
            return Err(Error::Worker {
                message: "worker closed its pipe".to_string(),
            });
        }
        let response: WorkerResponse =
            serde_json::from_str(response_line.trim()).map_err(|e| Error::Worker {
                message: format!("malformed worker response: {}", e),
            })?;
        self.tasks_done += 1;
        Ok(response)
    }

    fn kill(mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

struct PoolState {
    idle: Vec<WorkerProcess>,
    spawned: usize,
    shutdown: bool,
}

/// A pool of long-lived worker processes for expensive tools.
///
/// Workers are checked out per request and recycled once they have handled
/// `max_tasks_per_worker` requests or report an RSS over the limit. IPC
/// failures surface as retryable `Worker` errors; the caller falls back to a
/// direct spawn.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    state: Mutex<PoolState>,
    available: Condvar,
}

impl WorkerPool {
    pub fn new(config: WorkerPoolConfig) -> Self {
        Self {
            config,
            state: Mutex::new(PoolState {
                idle: Vec::new(),
                spawned: 0,
                shutdown: false,
            }),
            available: Condvar::new(),
        }
    }

    /// Executes one request on a pooled worker, blocking until a worker is
    /// available.
    pub fn submit(&self, request: &WorkerRequest) -> Result<WorkerResponse> {
        let mut worker = self.checkout()?;
        match worker.roundtrip(request) {
            Ok(response) => {
                self.check_in(worker, &response);
                Ok(response)
            }
            Err(error) => {
                self.discard(worker);
                Err(error)
            }
        }
    }

    fn checkout(&self) -> Result<WorkerProcess> {
        let mut state = self.state.lock().unwrap();
        loop {
            if state.shutdown {
                return Err(Error::Worker {
                    message: "worker pool is shut down".to_string(),
                });
            }
            if let Some(worker) = state.idle.pop() {
                return Ok(worker);
            }
            if state.spawned < self.config.size {
                state.spawned += 1;
                drop(state);
                return match WorkerProcess::spawn(&self.config) {
                    Ok(worker) => Ok(worker),
                    Err(error) => {
                        self.state.lock().unwrap().spawned -= 1;
                        self.available.notify_one();
                        Err(error)
                    }
                };
            }
            state = self.available.wait(state).unwrap();
        }
    }

    fn check_in(&self, worker: WorkerProcess, response: &WorkerResponse) {
        let recycle = worker.tasks_done >= self.config.max_tasks_per_worker
            || (response.rss_bytes > 0 && response.rss_bytes >= self.config.max_rss_bytes);
        let mut state = self.state.lock().unwrap();
        if recycle || state.shutdown {
            state.spawned -= 1;
            drop(state);
            worker.kill();
        } else {
            state.idle.push(worker);
            drop(state);
        }
        self.available.notify_one();
    }

    fn discard(&self, worker: WorkerProcess) {
        {
            let mut state = self.state.lock().unwrap();
            state.spawned -= 1;
        }
        worker.kill();
        self.available.notify_one();
    }

    pub fn shutdown(&self) {
        let workers = {
            let mut state = self.state.lock().unwrap();
            state.shutdown = true;
            state.spawned -= state.idle.len();
            std::mem::take(&mut state.idle)
        };
        for worker in workers {
            worker.kill();
        }
        self.available.notify_all();
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Child side of the protocol: reads requests from `input`, executes them,
/// writes responses to `output`. Returns when the parent closes the pipe.
pub fn serve<R: Read, W: Write>(input: R, mut output: W) -> std::io::Result<()> {
    let reader = BufReader::new(input);
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<WorkerRequest>(&line) {
            Ok(request) => handle_request(&request),
            Err(e) => WorkerResponse {
                exit_code: -1,
                stdout: String::new(),
                stderr: format!("malformed request: {}", e),
                duration_ms: 0,
                rss_bytes: current_rss_bytes(),
            },
        };
        let mut encoded = serde_json::to_string(&response)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        encoded.push('\n');
        output.write_all(encoded.as_bytes())?;
        output.flush()?;
    }
    Ok(())
}

fn handle_request(request: &WorkerRequest) -> WorkerResponse {
    let started = Instant::now();
    let output = Command::new(&request.command)
        .args(&request.args)
        .current_dir(&request.cwd)
        .env_clear()
        .envs(&request.env)
        .stdin(Stdio::null())
        .output();
    let duration_ms = started.elapsed().as_millis() as u64;

    match output {
        Ok(output) => WorkerResponse {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            duration_ms,
            rss_bytes: current_rss_bytes(),
        },
        Err(e) => WorkerResponse {
            exit_code: -1,
            stdout: String::new(),
            stderr: format!("failed to spawn {}: {}", request.command, e),
            duration_ms,
            rss_bytes: current_rss_bytes(),
        },
    }
}

/// Resident set size of this process, best effort.
pub fn current_rss_bytes() -> u64 {
    #[cfg(target_os = "linux")]
    {
        let Ok(statm) = std::fs::read_to_string("/proc/self/statm") else {
            return 0;
        };
        let rss_pages: u64 = statm
            .split_whitespace()
            .nth(1)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        rss_pages * 4096
    }
    #[cfg(not(target_os = "linux"))]
    {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serve_roundtrip_over_buffers() {
        let request = WorkerRequest {
            command: "sh".to_string(),
            args: vec!["-c".to_string(), "echo hello".to_string()],
            cwd: std::env::temp_dir(),
            env: std::env::vars().collect(),
        };
        let mut input = serde_json::to_string(&request).unwrap();
        input.push('\n');

        let mut out = Vec::new();
        serve(input.as_bytes(), &mut out).unwrap();

        let response: WorkerResponse =
            serde_json::from_str(String::from_utf8(out).unwrap().trim()).unwrap();
        assert_eq!(response.exit_code, 0);
        assert_eq!(response.stdout.trim(), "hello");
    }

    #[test]
    fn test_serve_reports_malformed_requests() {
        let mut out = Vec::new();
        serve("not json\n".as_bytes(), &mut out).unwrap();
        let response: WorkerResponse =
            serde_json::from_str(String::from_utf8(out).unwrap().trim()).unwrap();
        assert_eq!(response.exit_code, -1);
        assert!(response.stderr.contains("malformed request"));
    }
}
