//! Error types for the core crate.

/// Errors raised by the event thread and execution contexts.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoreError {
    /// A thread provider was installed after the shared event thread already
    /// existed, or twice.
    #[error("a thread provider is already installed or the shared event thread already exists")]
    ProviderAlreadyInstalled,
    /// The OS refused to spawn a thread.
    #[error("failed to spawn thread: {0}")]
    Spawn(String),
}

/// A specialized Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
