//! Asynchronous HTTP operations for Tether.
//!
//! This crate runs HTTP requests as cancellable, observable operations:
//!
//! - **Operations**: a [`Request`] becomes an [`Operation`] with a small
//!   lifecycle (ready, executing, suspended, finished, cancelled) that can be
//!   cancelled from any thread ([`http`])
//! - **Challenges**: authentication and untrusted-certificate challenges
//!   suspend the operation until an [`Authorizer`] or [`SslTrust`] answers
//! - **Responses**: status, headers and a body kept in memory or in a
//!   temporary file that can be moved into place
//! - **Forms**: URL-encoded and streamed multipart bodies ([`FormPost`])
//! - **Transports**: the socket layer behind a trait, with a `reqwest`
//!   implementation by default ([`transport`])
//!
//! Transport work and state-machine steps run on one shared event thread
//! from `tether_core`. User callbacks run on the request's execution context,
//! a serial queue by default.
//!
//! # Example
//!
//! ```no_run
//! use tether_http::{FormPost, Request};
//!
//! let mut form = FormPost::new();
//! form.set_value("name", "Ada").set_file("avatar", "avatar.png");
//!
//! let operation = Request::post("https://example.com/profile")
//!     .form(form)
//!     .on_upload_progress(|p| println!("sent {}", p.bytes_transferred))
//!     .start(|response| match response.error() {
//!         Some(err) => eprintln!("upload failed: {err}"),
//!         None => println!("uploaded: {}", response.status()),
//!     })?;
//!
//! // Safe from any thread.
//! operation.cancel();
//! # Ok::<(), tether_http::Error>(())
//! ```
//!
//! # Logging
//!
//! Events are emitted through `tracing` under the targets in
//! [`tether_core::logging::targets`]; no subscriber is installed.

mod error;
pub mod http;
pub mod tls;
pub mod transport;

pub use error::{Error, HttpError, NetworkError, Result};

// Re-export commonly used types at the crate root
pub use self::http::{
    Authorizer, CachePolicy, ChallengeDecision, FormPost, HttpMethod, Operation, OperationId,
    OperationState, RedirectPolicy, Request, RequestBody, Response, SslTrust, TransferProgress,
};
pub use tls::{Certificate, TlsConfig, TlsVersion};
