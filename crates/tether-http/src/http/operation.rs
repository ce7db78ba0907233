//! Operations: one request's lifecycle.
//!
//! An operation moves through
//!
//! ```text
//! Ready ──start──▶ Executing ◀──▶ Suspended
//!   │                  │              │
//!   └──cancel──▶ Cancelled ◀──────────┤
//!                      │              │
//!                      └──▶ Finished ◀┘
//! ```
//!
//! `Finished` and `Cancelled` are terminal. Every transition goes through
//! [`OperationShared::transition`]. The engine that drives an executing
//! operation lives on the event thread; this handle only flips atomic flags
//! and posts jobs there.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tether_core::logging::targets;
use tether_core::{EventThread, ExecutionContext};

use super::engine;
use super::request::{CompletionHandler, RequestDescriptor};
use super::response::{Response, ResponseAssembler};
use crate::error::{Error, NetworkError, Result};
use crate::transport::Transport;

/// Unique identifier for an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OperationId(u64);

impl OperationId {
    fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for OperationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "op#{}", self.0)
    }
}

/// Lifecycle state of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OperationState {
    /// Created, not started.
    Ready = 0,
    /// A connection is open.
    Executing = 1,
    /// Waiting for a challenge decision.
    Suspended = 2,
    /// Completed, successfully or not.
    Finished = 3,
    /// Cancelled.
    Cancelled = 4,
}

impl OperationState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Ready,
            1 => Self::Executing,
            2 => Self::Suspended,
            3 => Self::Finished,
            _ => Self::Cancelled,
        }
    }

    /// Whether no further transitions are possible.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Cancelled)
    }

    fn can_become(self, next: Self) -> bool {
        use OperationState::*;
        matches!(
            (self, next),
            (Ready, Executing)
                | (Ready, Cancelled)
                | (Ready, Finished)
                | (Executing, Suspended)
                | (Suspended, Executing)
                | (Executing | Suspended, Finished | Cancelled)
        )
    }
}

/// State shared between the handle, the engine and challenge decisions.
pub(crate) struct OperationShared {
    pub(crate) id: OperationId,
    state: AtomicU8,
    cancel_requested: AtomicBool,
    force_completion: AtomicBool,
    pub(crate) request: Arc<RequestDescriptor>,
    pub(crate) thread: Arc<dyn EventThread>,
    pub(crate) context: Arc<dyn ExecutionContext>,
    pub(crate) transport: Arc<dyn Transport>,
    completion: Mutex<Option<CompletionHandler>>,
    done: Mutex<bool>,
    done_signal: Condvar,
}

impl OperationShared {
    pub(crate) fn state(&self) -> OperationState {
        OperationState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Move to `next` if the lifecycle allows it.
    pub(crate) fn transition(&self, next: OperationState) -> bool {
        let result = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                OperationState::from_u8(current)
                    .can_become(next)
                    .then_some(next as u8)
            });
        match result {
            Ok(previous) => {
                tracing::debug!(
                    target: targets::OPERATION,
                    operation = %self.id,
                    from = ?OperationState::from_u8(previous),
                    to = ?next,
                    "state transition"
                );
                true
            }
            Err(current) => {
                tracing::trace!(
                    target: targets::OPERATION,
                    operation = %self.id,
                    from = ?OperationState::from_u8(current),
                    to = ?next,
                    "transition refused"
                );
                false
            }
        }
    }

    pub(crate) fn cancel_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::Acquire)
    }

    /// Enter a terminal state and hand `response` to the completion handler.
    ///
    /// Cancelled operations deliver only when the request (or
    /// `cancel_with_completion`) asked for it. Returns `false` if the
    /// operation had already ended.
    pub(crate) fn finish(&self, terminal: OperationState, response: Response) -> bool {
        debug_assert!(terminal.is_terminal());
        if !self.transition(terminal) {
            return false;
        }

        let deliver = terminal == OperationState::Finished
            || self.request.cancel_causes_completion()
            || self.force_completion.load(Ordering::Acquire);
        let completion = self.completion.lock().take();
        match completion {
            Some(completion) if deliver => {
                self.context.execute(Box::new(move || completion(response)));
            }
            _ => {
                tracing::debug!(target: targets::OPERATION, operation = %self.id, "completion suppressed");
            }
        }

        *self.done.lock() = true;
        self.done_signal.notify_all();
        true
    }

    fn detached_response(&self, error: Option<NetworkError>, cancelled: bool) -> Response {
        ResponseAssembler::detached(error, cancelled, self.request.user_info().cloned())
    }
}

/// A handle to one request's execution.
///
/// Cloning the handle does not clone the operation.
#[derive(Clone)]
pub struct Operation {
    shared: Arc<OperationShared>,
}

impl Operation {
    pub(crate) fn new(
        request: Arc<RequestDescriptor>,
        completion: CompletionHandler,
        thread: Arc<dyn EventThread>,
        context: Arc<dyn ExecutionContext>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            shared: Arc::new(OperationShared {
                id: OperationId::next(),
                state: AtomicU8::new(OperationState::Ready as u8),
                cancel_requested: AtomicBool::new(false),
                force_completion: AtomicBool::new(false),
                request,
                thread,
                context,
                transport,
                completion: Mutex::new(Some(completion)),
                done: Mutex::new(false),
                done_signal: Condvar::new(),
            }),
        }
    }

    pub(crate) fn from_shared(shared: Arc<OperationShared>) -> Self {
        Self { shared }
    }

    /// The operation's identifier.
    pub fn id(&self) -> OperationId {
        self.shared.id
    }

    /// The frozen request.
    pub fn request(&self) -> &RequestDescriptor {
        &self.shared.request
    }

    /// Current state.
    pub fn state(&self) -> OperationState {
        self.shared.state()
    }

    /// Whether the operation has started and not ended (including suspended).
    pub fn is_executing(&self) -> bool {
        matches!(
            self.state(),
            OperationState::Executing | OperationState::Suspended
        )
    }

    /// Whether the operation has ended, by finishing or by cancellation.
    pub fn is_finished(&self) -> bool {
        self.state().is_terminal()
    }

    /// Whether the operation was cancelled, or cancellation is pending.
    ///
    /// Once the operation has ended this reflects how it ended: a cancel that
    /// lost the race against the last step does not count.
    pub fn is_cancelled(&self) -> bool {
        match self.state() {
            OperationState::Cancelled => true,
            OperationState::Finished => false,
            _ => self.shared.cancel_requested(),
        }
    }

    /// Start the operation.
    ///
    /// Fails if the URL is not an absolute http/https URL, if a header or the
    /// method was invalid, or if the operation was already started. Every
    /// other failure is delivered through the completion handler.
    pub fn start(&self) -> Result<()> {
        let state = self.state();
        if state != OperationState::Ready {
            return Err(Error::InvalidState(format!(
                "{} cannot start from {state:?}",
                self.shared.id
            )));
        }
        let (method, url) = self.shared.request.validate()?;
        if !self.shared.transition(OperationState::Executing) {
            return Err(Error::InvalidState(format!(
                "{} cannot start from {:?}",
                self.shared.id,
                self.state()
            )));
        }

        tracing::debug!(target: targets::OPERATION, operation = %self.shared.id, %method, %url, "starting");
        let shared = self.shared.clone();
        let posted = self.shared.thread.post(Box::new(move || {
            engine::launch(shared, method, url);
        }));
        if !posted {
            tracing::warn!(target: targets::OPERATION, operation = %self.shared.id, "event thread refused the operation");
            let response = self
                .shared
                .detached_response(Some(NetworkError::EventThreadUnavailable), false);
            self.shared.finish(OperationState::Finished, response);
        }
        Ok(())
    }

    /// Cancel the operation.
    ///
    /// Safe from any thread. A cancelled response is delivered unless the
    /// request turned `cancel_causes_completion` off. Does nothing once the
    /// operation has ended.
    pub fn cancel(&self) {
        self.cancel_inner();
    }

    /// Cancel the operation and always deliver the cancelled response.
    pub fn cancel_with_completion(&self) {
        self.shared.force_completion.store(true, Ordering::Release);
        self.cancel_inner();
    }

    fn cancel_inner(&self) {
        if self.state().is_terminal() {
            return;
        }
        self.shared.cancel_requested.store(true, Ordering::Release);

        if self.state() == OperationState::Ready {
            let response = self.shared.detached_response(None, true);
            if self.shared.finish(OperationState::Cancelled, response) {
                return;
            }
        }

        let id = self.shared.id;
        if !self.shared.thread.post(Box::new(move || engine::cancel(id))) {
            let response = self.shared.detached_response(None, true);
            self.shared.finish(OperationState::Cancelled, response);
        }
    }

    /// Block until the operation ends. Completion callbacks may still be
    /// queued on the execution context when this returns.
    pub fn wait(&self) {
        let mut done = self.shared.done.lock();
        while !*done {
            self.shared.done_signal.wait(&mut done);
        }
    }

    /// Block until the operation ends or `timeout` passes. Returns whether it
    /// ended.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut done = self.shared.done.lock();
        while !*done {
            if self
                .shared
                .done_signal
                .wait_until(&mut done, deadline)
                .timed_out()
            {
                return *done;
            }
        }
        true
    }
}

impl std::fmt::Debug for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Operation")
            .field("id", &self.shared.id)
            .field("state", &self.state())
            .field("url", &self.shared.request.url())
            .finish()
    }
}
