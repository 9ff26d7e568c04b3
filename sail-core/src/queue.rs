//! Bounded-concurrency priority scheduler.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crate::build_graph::{Priority, TaskIndex};
use crate::error::Error;
use crate::refs::TaskId;

/// A scheduled unit: index into the task arena plus its priority. Ordering is
/// by priority descending, ties broken by task id ascending so dequeue order
/// is deterministic.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub index: TaskIndex,
    pub priority: Priority,
    pub id: TaskId,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.id == other.id
    }
}

impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.id.cmp(&self.id))
    }
}

struct QueueState {
    heap: BinaryHeap<QueueEntry>,
    active: usize,
    shutdown: bool,
}

struct QueueInner {
    state: Mutex<QueueState>,
    work_cond: Condvar,
    idle_cond: Condvar,
    job: Box<dyn Fn(QueueEntry) + Send + Sync>,
    error_handler: Mutex<Option<Box<dyn Fn(Error) + Send + Sync>>>,
}

/// A fixed pool of workers draining a priority-ordered ready set.
///
/// `push` is non-blocking; the executor controls readiness, so only tasks
/// whose predecessors are settled ever enter the heap. A panic inside a job
/// is caught and escalated to the registered error handler.
pub struct PriorityTaskQueue {
    inner: Arc<QueueInner>,
    workers: Vec<JoinHandle<()>>,
}

impl PriorityTaskQueue {
    pub fn new(concurrency: usize, job: Box<dyn Fn(QueueEntry) + Send + Sync>) -> Self {
        let inner = Arc::new(QueueInner {
            state: Mutex::new(QueueState {
                heap: BinaryHeap::new(),
                active: 0,
                shutdown: false,
            }),
            work_cond: Condvar::new(),
            idle_cond: Condvar::new(),
            job,
            error_handler: Mutex::new(None),
        });

        let workers = (0..concurrency.max(1))
            .map(|i| {
                let inner = Arc::clone(&inner);
                std::thread::Builder::new()
                    .name(format!("sail-exec-{}", i))
                    .spawn(move || worker_loop(inner))
                    .expect("spawn queue worker")
            })
            .collect();

        Self { inner, workers }
    }

    /// Registers the handler invoked when a job panics.
    pub fn on_error(&self, handler: Box<dyn Fn(Error) + Send + Sync>) {
        *self.inner.error_handler.lock().unwrap() = Some(handler);
    }

    /// Enqueues a ready task. Non-blocking.
    pub fn push(&self, entry: QueueEntry) {
        let mut state = self.inner.state.lock().unwrap();
        if state.shutdown {
            return;
        }
        state.heap.push(entry);
        drop(state);
        self.inner.work_cond.notify_one();
    }

    /// Stops dispatching: drains and returns every not-yet-started entry.
    /// In-flight jobs run to completion.
    pub fn abort(&self) -> Vec<QueueEntry> {
        let mut state = self.inner.state.lock().unwrap();
        let drained: Vec<QueueEntry> = std::mem::take(&mut state.heap).into_vec();
        if state.active == 0 {
            self.inner.idle_cond.notify_all();
        }
        drained
    }

    /// Blocks until the heap is empty and every worker is idle.
    pub fn wait_idle(&self) {
        let mut state = self.inner.state.lock().unwrap();
        while !(state.heap.is_empty() && state.active == 0) {
            state = self.inner.idle_cond.wait(state).unwrap();
        }
    }

    /// Signals shutdown and joins the workers.
    pub fn shutdown(mut self) {
        {
            let mut state = self.inner.state.lock().unwrap();
            state.shutdown = true;
        }
        self.inner.work_cond.notify_all();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_loop(inner: Arc<QueueInner>) {
    loop {
        let entry = {
            let mut state = inner.state.lock().unwrap();
            loop {
                if let Some(entry) = state.heap.pop() {
                    state.active += 1;
                    break entry;
                }
                if state.shutdown {
                    return;
                }
                state = inner.work_cond.wait(state).unwrap();
            }
        };

        let result = catch_unwind(AssertUnwindSafe(|| (inner.job)(entry.clone())));
        if let Err(panic) = result {
            let message = panic
                .downcast_ref::<String>()
                .cloned()
                .or_else(|| panic.downcast_ref::<&str>().map(|s| s.to_string()))
                .unwrap_or_else(|| "task worker panicked".to_string());
            let handler = inner.error_handler.lock().unwrap();
            if let Some(handler) = handler.as_ref() {
                handler(Error::Internal {
                    message: format!("task {}: {}", entry.id, message),
                });
            }
        }

        let mut state = inner.state.lock().unwrap();
        state.active -= 1;
        if state.heap.is_empty() && state.active == 0 {
            inner.idle_cond.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use std::sync::Mutex as StdMutex;

    fn entry(index: TaskIndex, level: u32, id: &str) -> QueueEntry {
        QueueEntry {
            index,
            priority: Priority {
                level,
                dependents: 0,
                weight: 0,
            },
            id: TaskId::new(id, "build"),
        }
    }

    #[test]
    fn test_priority_order_with_id_tiebreak() {
        let order = Arc::new(StdMutex::new(Vec::new()));
        let seen = Arc::clone(&order);
        // Single worker so dequeue order is observable.
        let queue = PriorityTaskQueue::new(
            1,
            Box::new(move |entry: QueueEntry| {
                seen.lock().unwrap().push(entry.id.to_string());
                std::thread::sleep(std::time::Duration::from_millis(5));
            }),
        );

        // Stall the worker with a first entry so the rest queue up.
        queue.push(entry(0, 9, "zz"));
        std::thread::sleep(std::time::Duration::from_millis(2));
        queue.push(entry(1, 1, "low"));
        queue.push(entry(2, 5, "beta"));
        queue.push(entry(3, 5, "alpha"));
        queue.wait_idle();
        queue.shutdown();

        let order = order.lock().unwrap();
        assert_eq!(
            order.as_slice(),
            &[
                "zz#build".to_string(),
                "alpha#build".to_string(),
                "beta#build".to_string(),
                "low#build".to_string()
            ]
        );
    }

    #[test]
    fn test_abort_drains_pending() {
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ran);
        let queue = PriorityTaskQueue::new(
            1,
            Box::new(move |_| {
                counter.fetch_add(1, AtomicOrdering::SeqCst);
                std::thread::sleep(std::time::Duration::from_millis(20));
            }),
        );

        queue.push(entry(0, 1, "a"));
        std::thread::sleep(std::time::Duration::from_millis(5));
        queue.push(entry(1, 1, "b"));
        queue.push(entry(2, 1, "c"));
        let drained = queue.abort();
        queue.wait_idle();
        queue.shutdown();

        assert_eq!(drained.len(), 2);
        assert_eq!(ran.load(AtomicOrdering::SeqCst), 1);
    }

    #[test]
    fn test_panic_escalates_to_error_handler() {
        let errors = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&errors);
        let queue = PriorityTaskQueue::new(
            2,
            Box::new(|entry: QueueEntry| {
                if entry.index == 0 {
                    panic!("boom");
                }
            }),
        );
        queue.on_error(Box::new(move |error| {
            sink.lock().unwrap().push(error.to_string());
        }));

        queue.push(entry(0, 1, "bad"));
        queue.push(entry(1, 1, "good"));
        queue.wait_idle();
        queue.shutdown();

        let errors = errors.lock().unwrap();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("boom"));
    }
}
