//! Core runtime pieces for Tether.
//!
//! This crate provides the threading foundation the HTTP engine runs on:
//!
//! - **Event Thread**: one cooperative thread, shared by every in-flight
//!   request, that runs transport setup, event delivery and state-machine
//!   stepping ([`event_thread`])
//! - **Thread Provider**: an injection seam letting the host application
//!   supply that thread instead
//! - **Execution Contexts**: FIFO queues where user callbacks are delivered
//!   ([`context`])
//! - **Logging**: `tracing` targets and span names ([`logging`])
//!
//! # Example
//!
//! ```no_run
//! use tether_core::{default_context, shared_event_thread, EventThread, ExecutionContext};
//!
//! let thread = shared_event_thread();
//! let callbacks = default_context();
//!
//! thread.post(Box::new(move || {
//!     // Runs on the event thread; hand the result to the callback queue.
//!     callbacks.execute(Box::new(|| println!("delivered")));
//! }));
//! ```

pub mod context;
mod error;
pub mod event_thread;
pub mod logging;

pub use context::{ExecutionContext, ManualQueue, SerialQueue, default_context};
pub use error::{CoreError, Result};
pub use event_thread::{
    CooperativeThread, EventThread, EventThreadConfig, Job, ThreadProvider,
    install_thread_provider, shared_event_thread,
};
