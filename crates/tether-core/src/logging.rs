//! Logging conventions for Tether.
//!
//! Tether uses the `tracing` crate for instrumentation and never installs a
//! subscriber itself. To see logs, install one in your application:
//!
//! ```ignore
//! tracing_subscriber::fmt()
//!     .with_env_filter("tether_http::operation=debug,tether_core=info")
//!     .init();
//! ```
//!
//! All events are emitted with one of the explicit targets below so that
//! subsystems can be filtered independently.

/// Span names used throughout Tether.
pub mod span_names {
    /// One engine step (a transport event or control message) for an operation.
    pub const ENGINE_STEP: &str = "tether::engine_step";
    /// The lifetime of a single transport connection.
    pub const CONNECTION: &str = "tether::connection";
}

/// Target names for log filtering.
pub mod targets {
    /// Event thread lifecycle and job execution.
    pub const EVENT_THREAD: &str = "tether_core::event_thread";
    /// Callback queues.
    pub const CONTEXT: &str = "tether_core::context";
    /// Operation state machine.
    pub const OPERATION: &str = "tether_http::operation";
    /// Transport connections.
    pub const TRANSPORT: &str = "tether_http::transport";
    /// Challenge decisions.
    pub const CHALLENGE: &str = "tether_http::challenge";
    /// Response assembly and file persistence.
    pub const RESPONSE: &str = "tether_http::response";
}
