//! The transport contract.
//!
//! A [`Transport`] performs the socket, TLS and HTTP work for one attempt of
//! a request and reports what happens as [`TransportEvent`]s through an
//! [`EventSink`]. The sink posts every event onto the operation's event
//! thread, stamped with the connection's generation. Once an operation
//! replaces or cancels a connection, late events from it are discarded there.
//!
//! The engine drives the [`Connection`] it gets back from [`Transport::open`]:
//! it answers a second auth challenge with
//! [`continue_without_credentials`](Connection::continue_without_credentials),
//! answers a redirect it will not follow with
//! [`deliver_redirect`](Connection::deliver_redirect),
//! answers [`TransportEvent::BodyStreamNeeded`] with
//! [`supply_body`](Connection::supply_body), and calls
//! [`cancel`](Connection::cancel) when it is done with the connection.
//!
//! [`ReqwestTransport`] is the default implementation.

mod reqwest_transport;

use std::io::Read;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, Method};
use tether_core::EventThread;
use url::Url;

use crate::error::NetworkError;
use crate::http::OperationId;

pub use reqwest_transport::{ReqwestTransport, ReqwestTransportBuilder, TransportConfig, runtime};

/// Something the transport observed on a connection.
#[derive(Debug)]
pub enum TransportEvent {
    /// The server answered with a redirect to `location`.
    ///
    /// Only emitted for 301, 302, 303, 307 and 308 when the request asked for
    /// redirects to be reported. The connection waits for `deliver_redirect`
    /// or `cancel`.
    Redirect {
        /// The 3xx status.
        status: u16,
        /// The `Location` header, unresolved.
        location: String,
        /// Headers of the redirect response.
        headers: HeaderMap,
    },
    /// The server requires authentication.
    ///
    /// The connection waits for `continue_without_credentials` or `cancel`.
    AuthChallenge {
        /// Host under challenge.
        host: String,
        /// The realm from `WWW-Authenticate`, if any.
        realm: Option<String>,
        /// The challenge status, normally 401.
        status: u16,
        /// Headers of the challenge response.
        headers: HeaderMap,
    },
    /// The server's certificate was not trusted. The connection is over.
    TrustChallenge {
        /// Host whose certificate was rejected.
        host: String,
        /// What the TLS layer reported.
        reason: String,
    },
    /// The final response head arrived.
    Headers {
        /// Status code.
        status: u16,
        /// Response headers.
        headers: HeaderMap,
        /// Body length announced by the server.
        expected_length: Option<u64>,
    },
    /// A chunk of the response body.
    Data(Bytes),
    /// Request body bytes sent so far.
    UploadProgress {
        /// Bytes sent.
        sent: u64,
        /// Total body length, if known.
        total: Option<u64>,
    },
    /// The transport needs a (fresh) request body; answer with `supply_body`.
    BodyStreamNeeded,
    /// The response completed.
    Finished,
    /// The attempt failed.
    Failed(NetworkError),
}

/// A request body as handed to a transport.
pub enum TransportBody {
    /// No body.
    Empty,
    /// An in-memory body.
    Bytes(Bytes),
    /// A body read incrementally.
    Reader {
        /// Source of the body bytes.
        reader: Box<dyn Read + Send>,
        /// Total length, if known.
        length: Option<u64>,
    },
    /// The body exists but is produced on demand: the transport must emit
    /// [`TransportEvent::BodyStreamNeeded`] and wait for `supply_body`.
    Deferred {
        /// Total length, if known.
        length: Option<u64>,
    },
}

impl TransportBody {
    /// The body length, when known.
    pub fn length(&self) -> Option<u64> {
        match self {
            TransportBody::Empty => Some(0),
            TransportBody::Bytes(bytes) => Some(bytes.len() as u64),
            TransportBody::Reader { length, .. } | TransportBody::Deferred { length } => *length,
        }
    }

    /// Whether there is no body.
    pub fn is_empty(&self) -> bool {
        matches!(self, TransportBody::Empty)
    }
}

impl std::fmt::Debug for TransportBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportBody::Empty => f.write_str("Empty"),
            TransportBody::Bytes(bytes) => f.debug_tuple("Bytes").field(&bytes.len()).finish(),
            TransportBody::Reader { length, .. } => {
                f.debug_struct("Reader").field("length", length).finish()
            }
            TransportBody::Deferred { length } => {
                f.debug_struct("Deferred").field("length", length).finish()
            }
        }
    }
}

/// One attempt of a request, fully resolved by the engine.
#[derive(Debug)]
pub struct TransportRequest {
    /// Request method.
    pub method: Method,
    /// Absolute http/https URL.
    pub url: Url,
    /// Headers to send, including `Authorization` and cache directives.
    pub headers: HeaderMap,
    /// Body to send.
    pub body: TransportBody,
    /// Request timeout.
    pub timeout: Duration,
    /// Whether to store and send cookies.
    pub cookies: bool,
    /// Whether HTTP pipelining was requested.
    pub pipelining: bool,
    /// Report 3xx responses as [`TransportEvent::Redirect`] instead of as
    /// final responses.
    pub report_redirects: bool,
    /// Skip certificate verification; set after the caller trusted the host.
    pub accept_invalid_certs: bool,
}

/// A live attempt, owned by the engine.
pub trait Connection: Send {
    /// Deliver the response that raised an auth challenge as the final response.
    fn continue_without_credentials(&mut self);

    /// Deliver a reported redirect response as the final response.
    fn deliver_redirect(&mut self);

    /// Answer [`TransportEvent::BodyStreamNeeded`].
    fn supply_body(&mut self, body: TransportBody);

    /// Abort the attempt. No further events are delivered for it.
    fn cancel(&mut self);
}

/// Opens connections.
pub trait Transport: Send + Sync {
    /// Start one attempt of `request`, reporting through `events`.
    fn open(&self, request: TransportRequest, events: EventSink) -> Box<dyn Connection>;
}

static DEFAULT_TRANSPORT: OnceLock<Arc<ReqwestTransport>> = OnceLock::new();

/// The process-wide [`ReqwestTransport`] used by requests that do not name
/// their own transport.
pub fn default_transport() -> Arc<dyn Transport> {
    DEFAULT_TRANSPORT
        .get_or_init(|| Arc::new(ReqwestTransport::new()))
        .clone()
}

/// Posts transport events onto an operation's event thread.
#[derive(Clone)]
pub struct EventSink {
    operation: OperationId,
    generation: u64,
    thread: Arc<dyn EventThread>,
}

impl EventSink {
    pub(crate) fn new(operation: OperationId, generation: u64, thread: Arc<dyn EventThread>) -> Self {
        Self {
            operation,
            generation,
            thread,
        }
    }

    /// The operation this sink reports to.
    pub fn operation(&self) -> OperationId {
        self.operation
    }

    /// The connection generation stamped on every event.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Post an event. Returns `false` if the event thread refused it, in
    /// which case the operation ends with
    /// [`NetworkError::EventThreadUnavailable`].
    pub fn send(&self, event: TransportEvent) -> bool {
        let operation = self.operation;
        let generation = self.generation;
        let posted = self.thread.post(Box::new(move || {
            crate::http::engine::deliver(operation, generation, event);
        }));
        if !posted {
            crate::http::engine::abandon(operation);
        }
        posted
    }
}

impl std::fmt::Debug for EventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSink")
            .field("operation", &self.operation)
            .field("generation", &self.generation)
            .finish()
    }
}
