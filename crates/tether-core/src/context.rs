//! Execution contexts: where caller-facing callbacks run.
//!
//! The engine never runs user callbacks on the event thread. Each request
//! names an [`ExecutionContext`] and every callback for that request is handed
//! to it as a [`Job`]. Contexts must be FIFO so that the per-request callback
//! order (headers, progress, completion) is preserved.
//!
//! - [`SerialQueue`] runs jobs on its own dedicated thread.
//! - [`default_context`] is a process-wide `SerialQueue` used when a request
//!   does not name a context.
//! - [`ManualQueue`] only runs jobs when drained; it also implements
//!   [`EventThread`], which makes it a deterministic scheduler for tests.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Sender, unbounded};
use parking_lot::Mutex;

use crate::error::{CoreError, Result};
use crate::event_thread::{EventThread, Job};
use crate::logging::targets;

/// A place callbacks can be handed off to.
///
/// `execute` must not run the job synchronously on the caller's stack when
/// the caller is the event thread; it queues the job and returns.
pub trait ExecutionContext: Send + Sync {
    /// Queue a job for execution.
    fn execute(&self, job: Job);
}

/// A FIFO queue served by one dedicated thread.
pub struct SerialQueue {
    label: String,
    sender: Mutex<Option<Sender<Job>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl SerialQueue {
    /// Spawn a queue whose thread carries `label` as its name.
    pub fn with_name(label: impl Into<String>) -> Result<Self> {
        let label = label.into();
        let (sender, receiver) = unbounded::<Job>();

        let handle = thread::Builder::new()
            .name(label.clone())
            .spawn(move || {
                for job in receiver {
                    if std::panic::catch_unwind(std::panic::AssertUnwindSafe(job)).is_err() {
                        tracing::error!(target: targets::CONTEXT, "callback panicked");
                    }
                }
            })
            .map_err(|e| CoreError::Spawn(e.to_string()))?;

        Ok(Self {
            label,
            sender: Mutex::new(Some(sender)),
            handle: Mutex::new(Some(handle)),
        })
    }

    /// The queue's label.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Stop accepting jobs and wait for the queued ones to finish.
    pub fn shutdown(&self) {
        self.sender.lock().take();
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

impl ExecutionContext for SerialQueue {
    fn execute(&self, job: Job) {
        let sent = match self.sender.lock().as_ref() {
            Some(sender) => sender.send(job).is_ok(),
            None => false,
        };
        if !sent {
            tracing::warn!(target: targets::CONTEXT, queue = %self.label, "queue is shut down, dropping callback");
        }
    }
}

impl Drop for SerialQueue {
    fn drop(&mut self) {
        self.sender.lock().take();
    }
}

impl std::fmt::Debug for SerialQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialQueue").field("label", &self.label).finish()
    }
}

static DEFAULT_CONTEXT: OnceLock<Arc<dyn ExecutionContext>> = OnceLock::new();

/// The process-wide callback queue.
pub fn default_context() -> Arc<dyn ExecutionContext> {
    DEFAULT_CONTEXT
        .get_or_init(|| match SerialQueue::with_name("tether-callbacks") {
            Ok(queue) => Arc::new(queue),
            Err(err) => {
                // Without a thread of our own, fall back to a detached thread per job.
                tracing::error!(target: targets::CONTEXT, error = %err, "failed to spawn callback queue");
                Arc::new(DetachedContext)
            }
        })
        .clone()
}

struct DetachedContext;

impl ExecutionContext for DetachedContext {
    fn execute(&self, job: Job) {
        let _ = thread::Builder::new().spawn(job);
    }
}

/// A queue that runs jobs only when explicitly drained.
///
/// Usable both as an [`ExecutionContext`] and as an [`EventThread`], so a test
/// can step the engine and its callbacks one job at a time on its own thread.
#[derive(Default)]
pub struct ManualQueue {
    jobs: Mutex<VecDeque<Job>>,
    stopped: AtomicBool,
}

impl ManualQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of queued jobs.
    pub fn len(&self) -> usize {
        self.jobs.lock().len()
    }

    /// Whether no jobs are queued.
    pub fn is_empty(&self) -> bool {
        self.jobs.lock().is_empty()
    }

    /// Run the oldest queued job. Returns `false` if there was none.
    pub fn run_one(&self) -> bool {
        // Pop before running so the job may post more work.
        let job = self.jobs.lock().pop_front();
        match job {
            Some(job) => {
                job();
                true
            }
            None => false,
        }
    }

    /// Run jobs until the queue is empty, including jobs posted meanwhile.
    /// Returns how many ran.
    pub fn run_until_idle(&self) -> usize {
        let mut count = 0;
        while self.run_one() {
            count += 1;
        }
        count
    }

    /// Refuse further jobs, as a dead event thread would.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }
}

impl ExecutionContext for ManualQueue {
    fn execute(&self, job: Job) {
        self.jobs.lock().push_back(job);
    }
}

impl EventThread for ManualQueue {
    fn post(&self, job: Job) -> bool {
        if self.stopped.load(Ordering::Acquire) {
            return false;
        }
        self.jobs.lock().push_back(job);
        true
    }

    fn is_alive(&self) -> bool {
        !self.stopped.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for ManualQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManualQueue").field("queued", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicI32;
    use std::time::Duration;

    #[test]
    fn test_serial_queue_runs_in_order_off_thread() {
        let queue = SerialQueue::with_name("test-queue").unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let caller = thread::current().id();

        for i in 0..5 {
            let seen = seen.clone();
            queue.execute(Box::new(move || {
                assert_ne!(thread::current().id(), caller);
                seen.lock().push(i);
            }));
        }

        queue.shutdown();
        assert_eq!(*seen.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_serial_queue_drops_after_shutdown() {
        let queue = SerialQueue::with_name("closed-queue").unwrap();
        queue.shutdown();

        let counter = Arc::new(AtomicI32::new(0));
        let c = counter.clone();
        queue.execute(Box::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        thread::sleep(Duration::from_millis(20));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_manual_queue_runs_only_when_drained() {
        let queue = Arc::new(ManualQueue::new());
        let counter = Arc::new(AtomicI32::new(0));

        let c = counter.clone();
        let q = queue.clone();
        assert!(queue.post(Box::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
            let c = c.clone();
            q.execute(Box::new(move || {
                c.fetch_add(10, Ordering::SeqCst);
            }));
        })));

        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert_eq!(queue.run_until_idle(), 2);
        assert_eq!(counter.load(Ordering::SeqCst), 11);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_manual_queue_stop() {
        let queue = ManualQueue::new();
        queue.stop();
        assert!(!queue.is_alive());
        assert!(!queue.post(Box::new(|| {})));
    }

    #[test]
    fn test_default_context_is_shared() {
        let a = default_context();
        let b = default_context();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
