//! A scripted transport and a manual event loop for stepping operations.

#![allow(dead_code)]

use std::io::Read;
use std::sync::Arc;

use http::{HeaderMap, Method};
use parking_lot::Mutex;
use tether_core::ManualQueue;
use tether_http::Request;
use tether_http::Response;
use tether_http::transport::{Connection, EventSink, Transport, TransportBody, TransportEvent, TransportRequest};
use url::Url;

/// What the engine asked of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionCall {
    ContinueWithoutCredentials,
    DeliverRedirect,
    SupplyBody(Vec<u8>),
    Cancel,
}

/// The request body as the transport saw it.
#[derive(Debug)]
pub struct SentBody {
    pub data: Vec<u8>,
    empty: bool,
    length: Option<u64>,
}

impl SentBody {
    pub fn is_empty(&self) -> bool {
        self.empty
    }

    pub fn length(&self) -> Option<u64> {
        self.length
    }
}

/// What the engine handed to `Transport::open`, with the body read out.
#[derive(Debug)]
pub struct SentRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: SentBody,
    pub report_redirects: bool,
    pub accept_invalid_certs: bool,
}

impl From<TransportRequest> for SentRequest {
    fn from(request: TransportRequest) -> Self {
        let body = SentBody {
            empty: request.body.is_empty(),
            length: request.body.length(),
            data: read_body(request.body),
        };
        Self {
            method: request.method,
            url: request.url,
            headers: request.headers,
            body,
            report_redirects: request.report_redirects,
            accept_invalid_certs: request.accept_invalid_certs,
        }
    }
}

/// One connection opened by the engine.
pub struct Opened {
    pub request: SentRequest,
    pub sink: EventSink,
    pub calls: Arc<Mutex<Vec<ConnectionCall>>>,
}

impl Opened {
    pub fn send(&self, event: TransportEvent) {
        assert!(self.sink.send(event), "event thread refused an event");
    }

    pub fn calls(&self) -> Vec<ConnectionCall> {
        self.calls.lock().clone()
    }

    pub fn header(&self, name: &str) -> Option<String> {
        self.request
            .headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    }
}

struct ScriptedConnection {
    calls: Arc<Mutex<Vec<ConnectionCall>>>,
}

impl Connection for ScriptedConnection {
    fn continue_without_credentials(&mut self) {
        self.calls.lock().push(ConnectionCall::ContinueWithoutCredentials);
    }

    fn deliver_redirect(&mut self) {
        self.calls.lock().push(ConnectionCall::DeliverRedirect);
    }

    fn supply_body(&mut self, body: TransportBody) {
        self.calls.lock().push(ConnectionCall::SupplyBody(read_body(body)));
    }

    fn cancel(&mut self) {
        self.calls.lock().push(ConnectionCall::Cancel);
    }
}

/// Records every connection instead of touching the network.
#[derive(Default)]
pub struct ScriptedTransport {
    opened: Mutex<Vec<Arc<Opened>>>,
}

impl ScriptedTransport {
    pub fn opened(&self) -> usize {
        self.opened.lock().len()
    }

    /// The `index`th connection, oldest first.
    pub fn connection(&self, index: usize) -> Arc<Opened> {
        self.opened.lock()[index].clone()
    }

    pub fn last(&self) -> Arc<Opened> {
        self.opened
            .lock()
            .last()
            .cloned()
            .expect("no connection opened")
    }
}

impl Transport for ScriptedTransport {
    fn open(&self, request: TransportRequest, events: EventSink) -> Box<dyn Connection> {
        let calls = Arc::new(Mutex::new(Vec::new()));
        self.opened.lock().push(Arc::new(Opened {
            request: request.into(),
            sink: events,
            calls: calls.clone(),
        }));
        Box::new(ScriptedConnection { calls })
    }
}

pub fn read_body(body: TransportBody) -> Vec<u8> {
    match body {
        TransportBody::Empty | TransportBody::Deferred { .. } => Vec::new(),
        TransportBody::Bytes(bytes) => bytes.to_vec(),
        TransportBody::Reader { mut reader, .. } => {
            let mut data = Vec::new();
            reader.read_to_end(&mut data).expect("read body");
            data
        }
    }
}

/// A queue serving as both event thread and callback context, a scripted
/// transport, and the responses delivered so far.
pub struct Harness {
    pub queue: Arc<ManualQueue>,
    pub transport: Arc<ScriptedTransport>,
    responses: Arc<Mutex<Vec<Response>>>,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            queue: Arc::new(ManualQueue::new()),
            transport: Arc::new(ScriptedTransport::default()),
            responses: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Route `request` through this harness.
    pub fn wire(&self, request: Request) -> Request {
        request
            .event_thread(self.queue.clone())
            .execution_context(self.queue.clone())
            .transport(self.transport.clone())
    }

    pub fn operation(&self, request: Request) -> tether_http::Operation {
        let responses = self.responses.clone();
        self.wire(request)
            .operation(move |response| responses.lock().push(response))
    }

    /// Start `request` and run until the first connection is open.
    pub fn start(&self, request: Request) -> tether_http::Operation {
        let operation = self.operation(request);
        operation.start().expect("start");
        self.run();
        operation
    }

    pub fn run(&self) -> usize {
        self.queue.run_until_idle()
    }

    pub fn responses(&self) -> usize {
        self.responses.lock().len()
    }

    /// Take the only delivered response.
    pub fn response(&self) -> Response {
        let mut responses = self.responses.lock();
        assert_eq!(responses.len(), 1, "expected exactly one response");
        responses.remove(0)
    }
}
