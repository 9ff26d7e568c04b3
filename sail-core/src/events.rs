//! Structured build event stream.

use crate::refs::TaskId;
use crate::task::TaskState;

/// Final disposition of a build, ordered `Failed > Success > UpToDate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildStatus {
    UpToDate,
    Success,
    Failed,
}

impl BuildStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            BuildStatus::UpToDate => "up to date",
            BuildStatus::Success => "success",
            BuildStatus::Failed => "failed",
        }
    }
}

/// Events emitted by the executor. A reporter subscribes; the engine itself
/// renders nothing.
#[derive(Debug, Clone)]
pub enum BuildEvent {
    BuildStarted {
        total_tasks: usize,
        up_to_date: usize,
    },
    TaskStarted {
        id: TaskId,
    },
    TaskFinished {
        id: TaskId,
        state: TaskState,
        duration_ms: u64,
    },
    BuildFinished {
        status: BuildStatus,
        elapsed_ms: u64,
    },
}

/// Receives build events. Implementations must tolerate concurrent emission
/// from executor workers.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &BuildEvent);
}

/// Discards every event.
#[derive(Debug, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: &BuildEvent) {}
}

/// Buffers events for inspection; used by tests.
#[derive(Debug, Default)]
pub struct CollectingSink {
    events: std::sync::Mutex<Vec<BuildEvent>>,
}

impl CollectingSink {
    pub fn take(&self) -> Vec<BuildEvent> {
        std::mem::take(&mut *self.events.lock().unwrap())
    }
}

impl EventSink for CollectingSink {
    fn emit(&self, event: &BuildEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}
