//! The default transport, built on `reqwest` and the shared tokio runtime.
//!
//! Redirects are never followed inside `reqwest`: the client is built with
//! [`Policy::none`](reqwest::redirect::Policy::none) and 3xx responses are
//! reported to the engine, which applies the request's redirect policy.

use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use http::header::{CONTENT_LENGTH, LOCATION, WWW_AUTHENTICATE};
use http::{HeaderValue, StatusCode};
use parking_lot::Mutex;
use tether_core::logging::{span_names, targets};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tracing::Instrument;

use super::{Connection, EventSink, Transport, TransportBody, TransportEvent, TransportRequest};
use crate::error::NetworkError;
use crate::http::is_followable;
use crate::tls::{self, Certificate, TlsConfig};

const UPLOAD_CHUNK_SIZE: usize = 16 * 1024;

/// Tokio runtime shared by every connection of the default transport.
pub mod runtime {
    use std::sync::OnceLock;
    use tokio::runtime::Runtime;

    use crate::error::NetworkError;

    static RUNTIME: OnceLock<Result<Runtime, String>> = OnceLock::new();

    /// Get the runtime, creating it on first use.
    pub fn init() -> Result<&'static Runtime, NetworkError> {
        RUNTIME
            .get_or_init(|| {
                tokio::runtime::Builder::new_multi_thread()
                    .worker_threads(2)
                    .thread_name("tether-io")
                    .enable_all()
                    .build()
                    .map_err(|e| e.to_string())
            })
            .as_ref()
            .map_err(|e| NetworkError::Request(format!("failed to create tokio runtime: {e}")))
    }

    /// Spawn a future on the runtime.
    pub fn spawn<F>(future: F) -> Result<tokio::task::JoinHandle<F::Output>, NetworkError>
    where
        F: std::future::Future + Send + 'static,
        F::Output: Send + 'static,
    {
        Ok(init()?.spawn(future))
    }
}

/// Settings shared by every client the transport builds.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Connection establishment timeout.
    pub connect_timeout: Duration,
    /// Default `User-Agent`; a request's own override wins.
    pub user_agent: String,
    /// How long idle pooled connections are kept.
    pub pool_idle_timeout: Option<Duration>,
    /// Trust-store settings.
    pub tls: TlsConfig,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            user_agent: format!("tether-http/{}", env!("CARGO_PKG_VERSION")),
            pool_idle_timeout: Some(Duration::from_secs(90)),
            tls: TlsConfig::default(),
        }
    }
}

/// Builder for [`ReqwestTransport`].
#[derive(Debug, Default)]
pub struct ReqwestTransportBuilder {
    config: TransportConfig,
}

impl ReqwestTransportBuilder {
    /// Set the connect timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Set the default user agent.
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.config.user_agent = user_agent.into();
        self
    }

    /// Set the idle timeout for pooled connections. `None` keeps them forever.
    pub fn pool_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.pool_idle_timeout = timeout;
        self
    }

    /// Replace the TLS settings.
    pub fn tls(mut self, tls: TlsConfig) -> Self {
        self.config.tls = tls;
        self
    }

    /// Trust an additional root certificate.
    pub fn add_root_certificate(mut self, cert: Certificate) -> Self {
        self.config.tls.root_certificates.push(cert);
        self
    }

    /// Build the transport.
    pub fn build(self) -> ReqwestTransport {
        ReqwestTransport::with_config(self.config)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct ClientKey {
    cookies: bool,
    accept_invalid_certs: bool,
}

/// [`Transport`] backed by `reqwest`.
///
/// Keeps one client per combination of cookie handling and certificate
/// trust. Cookie-enabled clients share one cookie jar.
pub struct ReqwestTransport {
    config: TransportConfig,
    cookie_jar: Arc<reqwest::cookie::Jar>,
    clients: Mutex<HashMap<ClientKey, reqwest::Client>>,
}

impl ReqwestTransport {
    /// Create a transport with default settings.
    pub fn new() -> Self {
        Self::with_config(TransportConfig::default())
    }

    /// Create a builder.
    pub fn builder() -> ReqwestTransportBuilder {
        ReqwestTransportBuilder::default()
    }

    /// Create a transport from a configuration.
    pub fn with_config(config: TransportConfig) -> Self {
        Self {
            config,
            cookie_jar: Arc::new(reqwest::cookie::Jar::default()),
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// The transport's configuration.
    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    fn client(&self, key: ClientKey) -> Result<reqwest::Client, NetworkError> {
        let mut clients = self.clients.lock();
        if let Some(client) = clients.get(&key) {
            return Ok(client.clone());
        }

        let mut builder = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(self.config.connect_timeout)
            .user_agent(self.config.user_agent.clone())
            .pool_idle_timeout(self.config.pool_idle_timeout)
            .http1_only();
        if key.cookies {
            builder = builder.cookie_provider(self.cookie_jar.clone());
        }
        builder = self.config.tls.apply(builder);
        if key.accept_invalid_certs {
            builder = builder.danger_accept_invalid_certs(true);
        }

        let client = builder.build().map_err(NetworkError::from)?;
        tracing::debug!(target: targets::TRANSPORT, ?key, "built HTTP client");
        clients.insert(key, client.clone());
        Ok(client)
    }
}

impl Default for ReqwestTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ReqwestTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReqwestTransport")
            .field("config", &self.config)
            .field("clients", &self.clients.lock().len())
            .finish()
    }
}

impl Transport for ReqwestTransport {
    fn open(&self, request: TransportRequest, events: EventSink) -> Box<dyn Connection> {
        let (control, control_rx) = mpsc::unbounded_channel();
        let key = ClientKey {
            cookies: request.cookies,
            accept_invalid_certs: request.accept_invalid_certs,
        };
        if request.pipelining {
            tracing::trace!(target: targets::TRANSPORT, "pipelining requested; connections are pooled instead");
        }

        let span = tracing::debug_span!(
            span_names::CONNECTION,
            operation = %events.operation(),
            generation = events.generation(),
            method = %request.method,
            url = %request.url,
        );
        let task = self.client(key).and_then(|client| {
            runtime::spawn(run(client, request, events.clone(), control_rx).instrument(span))
        });
        let task = match task {
            Ok(task) => Some(task),
            Err(err) => {
                events.send(TransportEvent::Failed(err));
                None
            }
        };

        Box::new(ReqwestConnection { control, task })
    }
}

enum Control {
    Deliver,
    Body(TransportBody),
}

struct ReqwestConnection {
    control: mpsc::UnboundedSender<Control>,
    task: Option<JoinHandle<()>>,
}

impl Connection for ReqwestConnection {
    fn continue_without_credentials(&mut self) {
        let _ = self.control.send(Control::Deliver);
    }

    fn deliver_redirect(&mut self) {
        let _ = self.control.send(Control::Deliver);
    }

    fn supply_body(&mut self, body: TransportBody) {
        let _ = self.control.send(Control::Body(body));
    }

    fn cancel(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for ReqwestConnection {
    fn drop(&mut self) {
        self.cancel();
    }
}

async fn run(
    client: reqwest::Client,
    request: TransportRequest,
    events: EventSink,
    mut control: mpsc::UnboundedReceiver<Control>,
) {
    let TransportRequest {
        method,
        url,
        mut headers,
        body,
        timeout,
        report_redirects,
        ..
    } = request;
    let host = url.host_str().unwrap_or_default().to_string();

    let body = match body {
        TransportBody::Deferred { .. } => {
            events.send(TransportEvent::BodyStreamNeeded);
            match control.recv().await {
                Some(Control::Body(TransportBody::Deferred { .. })) => {
                    events.send(TransportEvent::Failed(NetworkError::BodyStream(
                        "a deferred body was supplied for a deferred body".to_string(),
                    )));
                    return;
                }
                Some(Control::Body(body)) => body,
                Some(Control::Deliver) | None => return,
            }
        }
        body => body,
    };

    let mut uploaded_in_memory = None;
    let reqwest_body = match body {
        TransportBody::Empty | TransportBody::Deferred { .. } => None,
        TransportBody::Bytes(bytes) => {
            uploaded_in_memory = Some(bytes.len() as u64);
            Some(reqwest::Body::from(bytes))
        }
        TransportBody::Reader { reader, length } => {
            if let Some(length) = length
                && !headers.contains_key(CONTENT_LENGTH)
            {
                headers.insert(CONTENT_LENGTH, HeaderValue::from(length));
            }
            Some(counted_body(reader, length, events.clone()))
        }
    };

    tracing::debug!(target: targets::TRANSPORT, %method, %url, "sending request");
    let mut builder = client
        .request(method, url)
        .headers(headers)
        .timeout(timeout);
    if let Some(body) = reqwest_body {
        builder = builder.body(body);
    }

    let response = match builder.send().await {
        Ok(response) => response,
        Err(err) => {
            events.send(failure_event(&host, err));
            return;
        }
    };

    if let Some(sent) = uploaded_in_memory.filter(|sent| *sent > 0) {
        events.send(TransportEvent::UploadProgress {
            sent,
            total: Some(sent),
        });
    }

    let status = response.status();
    if report_redirects
        && is_followable(status.as_u16())
        && let Some(location) = response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
    {
        events.send(TransportEvent::Redirect {
            status: status.as_u16(),
            location: location.to_string(),
            headers: response.headers().clone(),
        });
        match control.recv().await {
            Some(Control::Deliver) => {}
            Some(Control::Body(_)) | None => return,
        }
    }

    if status == StatusCode::UNAUTHORIZED
        && let Some(challenge) = response.headers().get(WWW_AUTHENTICATE)
    {
        events.send(TransportEvent::AuthChallenge {
            host: host.clone(),
            realm: challenge.to_str().ok().and_then(parse_realm),
            status: status.as_u16(),
            headers: response.headers().clone(),
        });
        match control.recv().await {
            Some(Control::Deliver) => {}
            Some(Control::Body(_)) | None => return,
        }
    }

    events.send(TransportEvent::Headers {
        status: status.as_u16(),
        headers: response.headers().clone(),
        expected_length: response.content_length(),
    });

    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(bytes) => {
                tracing::trace!(target: targets::TRANSPORT, len = bytes.len(), "received chunk");
                if !events.send(TransportEvent::Data(bytes)) {
                    return;
                }
            }
            Err(err) => {
                events.send(TransportEvent::Failed(err.into()));
                return;
            }
        }
    }
    events.send(TransportEvent::Finished);
}

fn failure_event(host: &str, err: reqwest::Error) -> TransportEvent {
    match tls::untrusted_certificate_reason(&err) {
        Some(reason) => TransportEvent::TrustChallenge {
            host: host.to_string(),
            reason,
        },
        None => TransportEvent::Failed(err.into()),
    }
}

/// Stream a reader into a request body, reporting upload progress per chunk.
fn counted_body(
    mut reader: Box<dyn Read + Send>,
    total: Option<u64>,
    events: EventSink,
) -> reqwest::Body {
    let (tx, rx) = mpsc::channel::<std::io::Result<Bytes>>(4);
    tokio::task::spawn_blocking(move || {
        let mut buf = vec![0u8; UPLOAD_CHUNK_SIZE];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.blocking_send(Ok(Bytes::copy_from_slice(&buf[..n]))).is_err() {
                        break;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    let _ = tx.blocking_send(Err(e));
                    break;
                }
            }
        }
    });

    let mut sent = 0u64;
    let stream = ReceiverStream::new(rx).map(move |chunk| {
        if let Ok(bytes) = &chunk {
            sent += bytes.len() as u64;
            events.send(TransportEvent::UploadProgress { sent, total });
        }
        chunk
    });
    reqwest::Body::wrap_stream(stream)
}

/// Extract the realm from a `WWW-Authenticate` value.
fn parse_realm(challenge: &str) -> Option<String> {
    let start = challenge.to_ascii_lowercase().find("realm=")? + "realm=".len();
    let rest = &challenge[start..];
    let realm = match rest.strip_prefix('"') {
        Some(quoted) => quoted.split('"').next()?,
        None => rest.split([',', ' ']).next()?,
    };
    Some(realm.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_realm() {
        assert_eq!(
            parse_realm(r#"Basic realm="Secure Area""#).as_deref(),
            Some("Secure Area")
        );
        assert_eq!(
            parse_realm("Digest Realm=files, nonce=\"abc\"").as_deref(),
            Some("files")
        );
        assert_eq!(parse_realm("Bearer"), None);
    }

    #[test]
    fn test_builder_config() {
        let transport = ReqwestTransport::builder()
            .connect_timeout(Duration::from_secs(5))
            .user_agent("TestAgent/1.0")
            .pool_idle_timeout(None)
            .build();
        assert_eq!(transport.config().connect_timeout, Duration::from_secs(5));
        assert_eq!(transport.config().user_agent, "TestAgent/1.0");
        assert!(transport.config().pool_idle_timeout.is_none());
    }

    #[test]
    fn test_clients_are_cached_per_key() {
        let transport = ReqwestTransport::new();
        let plain = ClientKey {
            cookies: true,
            accept_invalid_certs: false,
        };
        let trusting = ClientKey {
            cookies: true,
            accept_invalid_certs: true,
        };
        transport.client(plain).unwrap();
        transport.client(plain).unwrap();
        transport.client(trusting).unwrap();
        assert_eq!(transport.clients.lock().len(), 2);
    }

    #[test]
    fn test_runtime_is_shared() {
        let a = runtime::init().unwrap() as *const _;
        let b = runtime::init().unwrap() as *const _;
        assert_eq!(a, b);
    }
}
