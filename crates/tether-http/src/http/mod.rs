//! Asynchronous HTTP operations.
//!
//! A [`Request`] describes what to send. Turning it into an [`Operation`]
//! freezes the description; starting the operation hands it to the event
//! thread, which drives the transport and reports back through handlers on
//! the request's execution context.
//!
//! # Example
//!
//! ```no_run
//! use tether_http::http::Request;
//!
//! let operation = Request::get("https://example.com/data.json")
//!     .header("Accept", "application/json")
//!     .on_download_progress(|p| println!("{:?}%", p.percent()))
//!     .start(|response| {
//!         if let Some(err) = response.error() {
//!             eprintln!("failed: {err}");
//!         } else {
//!             println!("{}", response.response_string());
//!         }
//!     })?;
//! operation.wait();
//! # Ok::<(), tether_http::Error>(())
//! ```
//!
//! # Challenges
//!
//! Authentication and certificate-trust challenges suspend the operation
//! until the handler answers through an [`Authorizer`] or an [`SslTrust`].
//! The answer may come later and from any thread:
//!
//! ```no_run
//! use tether_http::http::Request;
//!
//! let operation = Request::get("https://intranet.example.com/")
//!     .on_auth_challenge(|auth| {
//!         auth.continue_with("user", "secret");
//!     })
//!     .start(|response| println!("{}", response.status()))?;
//! # Ok::<(), tether_http::Error>(())
//! ```

mod challenge;
pub(crate) mod engine;
mod form;
mod operation;
mod redirect;
mod request;
mod response;

pub use challenge::{Authorizer, ChallengeDecision, SslTrust};
pub use form::{EncodedForm, FormPost, guess_content_type, percent_escape};
pub use operation::{Operation, OperationId, OperationState};
pub use redirect::RedirectPolicy;
pub(crate) use redirect::is_followable;
pub use request::{
    AuthHandler, BodyStreamHandler, CachePolicy, CompletionHandler, DEFAULT_MAX_REDIRECTS,
    DEFAULT_TIMEOUT, HeadersHandler, HttpMethod, ProgressHandler, Request, RequestBody,
    RequestDescriptor, TrustHandler,
};
pub use response::{Response, TransferProgress, UserInfo};
