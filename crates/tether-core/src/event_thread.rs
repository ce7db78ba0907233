//! The cooperative event thread shared by every in-flight operation.
//!
//! An event thread is a single long-lived thread that runs posted jobs one at
//! a time, in the order they were posted. The HTTP engine performs all
//! transport setup, transport event delivery and state-machine stepping on
//! it, so per-request state never needs its own lock.
//!
//! The engine only needs two capabilities from the thread, captured by the
//! [`EventThread`] trait: "run this callable on the thread" and "is the thread
//! alive". The default implementation is [`CooperativeThread`]; hosts that
//! already own a suitable thread can supply it through a [`ThreadProvider`]
//! installed with [`install_thread_provider`] before the first request.
//!
//! # Example
//!
//! ```no_run
//! use tether_core::event_thread::{shared_event_thread, EventThread};
//!
//! let thread = shared_event_thread();
//! thread.post(Box::new(|| println!("running on the event thread")));
//! assert!(thread.is_alive());
//! ```

use std::sync::Arc;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use parking_lot::{Condvar, Mutex};

use crate::error::{CoreError, Result};
use crate::logging::targets;

/// A unit of work posted to an event thread or execution context.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// The capability the engine needs from an event thread.
///
/// Implementations must run posted jobs sequentially, in posting order, on a
/// single thread for as long as they report themselves alive.
pub trait EventThread: Send + Sync {
    /// Queue a job to run on the thread.
    ///
    /// Returns `false` if the thread no longer accepts work; the job is
    /// dropped in that case.
    fn post(&self, job: Job) -> bool;

    /// Whether the thread is still processing jobs.
    fn is_alive(&self) -> bool;
}

/// Supplies a long-lived event thread owned by the host application.
pub trait ThreadProvider: Send + Sync {
    /// Return the thread the engine should use for the process lifetime.
    fn event_thread(&self) -> Arc<dyn EventThread>;
}

/// Configuration for a [`CooperativeThread`].
#[derive(Debug, Clone)]
pub struct EventThreadConfig {
    /// Name given to the OS thread.
    pub name: String,
    /// Stack size in bytes. `None` uses the platform default.
    pub stack_size: Option<usize>,
}

impl Default for EventThreadConfig {
    fn default() -> Self {
        Self {
            name: "tether-event".to_string(),
            stack_size: None,
        }
    }
}

impl EventThreadConfig {
    /// Create a configuration with the given thread name.
    pub fn with_name(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

enum Message {
    Run(Job),
    Shutdown,
}

struct ThreadState {
    running: AtomicBool,
    pending: AtomicUsize,
    thread_id: OnceLock<ThreadId>,
    shutdown_condvar: Condvar,
    shutdown_mutex: Mutex<()>,
}

impl ThreadState {
    fn new() -> Self {
        Self {
            running: AtomicBool::new(true),
            pending: AtomicUsize::new(0),
            thread_id: OnceLock::new(),
            shutdown_condvar: Condvar::new(),
            shutdown_mutex: Mutex::new(()),
        }
    }

    fn signal_shutdown(&self) {
        let _guard = self.shutdown_mutex.lock();
        self.shutdown_condvar.notify_all();
    }
}

/// The default event thread: one dedicated OS thread draining a FIFO queue.
///
/// Jobs run to completion one after another; a job that needs to wait for
/// something must instead arrange for another job to be posted later.
pub struct CooperativeThread {
    sender: Sender<Message>,
    handle: Mutex<Option<JoinHandle<()>>>,
    state: Arc<ThreadState>,
}

impl CooperativeThread {
    /// Spawn a thread with the default configuration.
    pub fn spawn() -> Result<Self> {
        Self::with_config(EventThreadConfig::default())
    }

    /// Spawn a thread with a custom configuration.
    pub fn with_config(config: EventThreadConfig) -> Result<Self> {
        let (sender, receiver) = unbounded();
        let state = Arc::new(ThreadState::new());
        let thread_state = state.clone();

        let mut builder = thread::Builder::new().name(config.name.clone());
        if let Some(stack_size) = config.stack_size {
            builder = builder.stack_size(stack_size);
        }

        let handle = builder
            .spawn(move || {
                let _ = thread_state.thread_id.set(thread::current().id());
                event_loop(receiver, &thread_state);
                thread_state.running.store(false, Ordering::Release);
                thread_state.signal_shutdown();
            })
            .map_err(|e| CoreError::Spawn(e.to_string()))?;

        tracing::debug!(target: targets::EVENT_THREAD, name = %config.name, "event thread started");

        Ok(Self {
            sender,
            handle: Mutex::new(Some(handle)),
            state,
        })
    }

    /// Number of jobs posted but not yet run.
    pub fn pending_jobs(&self) -> usize {
        self.state.pending.load(Ordering::Acquire)
    }

    /// Whether the caller is running on this event thread.
    pub fn is_current(&self) -> bool {
        self.state.thread_id.get() == Some(&thread::current().id())
    }

    /// Stop accepting jobs; already queued jobs still run.
    ///
    /// The shared thread returned by [`shared_event_thread`] is never stopped
    /// implicitly. This is for threads created explicitly, mostly in tests.
    pub fn stop(&self) {
        self.state.running.store(false, Ordering::Release);
        let _ = self.sender.send(Message::Shutdown);
    }

    /// Wait for the thread to exit. Call [`stop`](Self::stop) first.
    pub fn join(&self) -> bool {
        match self.handle.lock().take() {
            Some(handle) => handle.join().is_ok(),
            None => false,
        }
    }

    /// Wait up to `timeout` for the thread to exit.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        if !self.is_alive() {
            return true;
        }
        let mut guard = self.state.shutdown_mutex.lock();
        let result = self.state.shutdown_condvar.wait_for(&mut guard, timeout);
        !result.timed_out() || !self.is_alive()
    }
}

impl EventThread for CooperativeThread {
    fn post(&self, job: Job) -> bool {
        if !self.is_alive() {
            return false;
        }
        self.state.pending.fetch_add(1, Ordering::AcqRel);
        if self.sender.send(Message::Run(job)).is_err() {
            self.state.pending.fetch_sub(1, Ordering::AcqRel);
            return false;
        }
        true
    }

    fn is_alive(&self) -> bool {
        self.state.running.load(Ordering::Acquire)
    }
}

impl Drop for CooperativeThread {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for CooperativeThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CooperativeThread")
            .field("alive", &self.is_alive())
            .field("pending_jobs", &self.pending_jobs())
            .finish()
    }
}

fn event_loop(receiver: Receiver<Message>, state: &ThreadState) {
    loop {
        match receiver.recv_timeout(Duration::from_millis(250)) {
            Ok(Message::Run(job)) => {
                run_job(job);
                state.pending.fetch_sub(1, Ordering::AcqRel);
            }
            Ok(Message::Shutdown) => {
                while let Ok(message) = receiver.try_recv() {
                    if let Message::Run(job) = message {
                        run_job(job);
                        state.pending.fetch_sub(1, Ordering::AcqRel);
                    }
                }
                break;
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    tracing::debug!(target: targets::EVENT_THREAD, "event thread exiting");
}

/// Run a job, keeping the thread alive if it panics.
fn run_job(job: Job) {
    if std::panic::catch_unwind(std::panic::AssertUnwindSafe(job)).is_err() {
        tracing::error!(target: targets::EVENT_THREAD, "job panicked on the event thread");
    }
}

static PROVIDER: OnceLock<Arc<dyn ThreadProvider>> = OnceLock::new();
static SHARED: OnceLock<Arc<dyn EventThread>> = OnceLock::new();

/// Install the host's thread provider.
///
/// Must be called before the first call to [`shared_event_thread`]; once the
/// shared thread exists, or a provider was already installed, this fails.
pub fn install_thread_provider(provider: Arc<dyn ThreadProvider>) -> Result<()> {
    if SHARED.get().is_some() {
        return Err(CoreError::ProviderAlreadyInstalled);
    }
    PROVIDER
        .set(provider)
        .map_err(|_| CoreError::ProviderAlreadyInstalled)
}

/// The process-wide event thread, created on first use.
///
/// Uses the installed [`ThreadProvider`] if there is one, otherwise spawns a
/// [`CooperativeThread`] that lives for the rest of the process.
pub fn shared_event_thread() -> Arc<dyn EventThread> {
    SHARED
        .get_or_init(|| {
            if let Some(provider) = PROVIDER.get() {
                tracing::debug!(target: targets::EVENT_THREAD, "using host-provided event thread");
                return provider.event_thread();
            }
            match CooperativeThread::spawn() {
                Ok(thread) => Arc::new(thread),
                Err(err) => {
                    tracing::error!(target: targets::EVENT_THREAD, error = %err, "failed to spawn event thread");
                    Arc::new(StoppedThread)
                }
            }
        })
        .clone()
}

/// Stand-in used when the OS refuses to spawn the shared thread.
struct StoppedThread;

impl EventThread for StoppedThread {
    fn post(&self, _job: Job) -> bool {
        false
    }

    fn is_alive(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicI32;

    #[test]
    fn test_jobs_run_in_order() {
        let thread = CooperativeThread::spawn().unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..10 {
            let order = order.clone();
            assert!(thread.post(Box::new(move || order.lock().push(i))));
        }

        thread.stop();
        thread.join();
        assert_eq!(*order.lock(), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_jobs_share_one_thread() {
        let thread = CooperativeThread::spawn().unwrap();
        let ids = Arc::new(Mutex::new(Vec::new()));

        for _ in 0..5 {
            let ids = ids.clone();
            thread.post(Box::new(move || ids.lock().push(thread::current().id())));
        }

        thread.stop();
        thread.join();
        let ids = ids.lock();
        assert_eq!(ids.len(), 5);
        assert!(ids.iter().all(|id| *id == ids[0]));
        assert_ne!(ids[0], thread::current().id());
    }

    #[test]
    fn test_post_after_stop_is_rejected() {
        let thread = CooperativeThread::spawn().unwrap();
        thread.stop();
        assert!(!thread.is_alive());
        assert!(!thread.post(Box::new(|| {})));
        thread.join();
    }

    #[test]
    fn test_panicking_job_does_not_kill_thread() {
        let thread = CooperativeThread::spawn().unwrap();
        let counter = Arc::new(AtomicI32::new(0));

        thread.post(Box::new(|| panic!("boom")));
        let c = counter.clone();
        thread.post(Box::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));

        thread.stop();
        thread.join();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_wait_timeout() {
        let thread = CooperativeThread::with_config(EventThreadConfig::with_name("wait-test")).unwrap();
        assert!(!thread.wait_timeout(Duration::from_millis(50)));
        thread.stop();
        assert!(thread.wait_timeout(Duration::from_millis(1000)));
    }

    #[test]
    fn test_shared_thread_is_singleton() {
        let a = shared_event_thread();
        let b = shared_event_thread();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(a.is_alive());
        assert!(matches!(
            install_thread_provider(Arc::new(TestProvider)),
            Err(CoreError::ProviderAlreadyInstalled)
        ));
    }

    struct TestProvider;

    impl ThreadProvider for TestProvider {
        fn event_thread(&self) -> Arc<dyn EventThread> {
            Arc::new(StoppedThread)
        }
    }
}
