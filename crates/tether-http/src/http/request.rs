//! Request description and builder.
//!
//! A [`Request`] is mutable while it is being configured. Turning it into an
//! [`Operation`] freezes it into a [`RequestDescriptor`] that the operation
//! owns for its whole life.

use std::any::Any;
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use encoding_rs::Encoding;
use http::header::{AUTHORIZATION, CACHE_CONTROL, HeaderName, HeaderValue, PRAGMA};
use http::{HeaderMap, Method};
use parking_lot::Mutex;
use tether_core::{EventThread, ExecutionContext, default_context, shared_event_thread};
use url::Url;

use super::challenge::{Authorizer, ChallengeDecision, SslTrust};
use super::form::{FormPost, guess_content_type};
use super::operation::Operation;
use super::redirect::RedirectPolicy;
use super::response::{Response, TransferProgress, UserInfo};
use crate::error::{Error, NetworkError, Result};
use crate::transport::{Transport, TransportBody, default_transport};

/// Default request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(20);

/// Default limit on followed redirects.
pub const DEFAULT_MAX_REDIRECTS: u32 = 10;

/// Called once with the final response.
pub type CompletionHandler = Box<dyn FnOnce(Response) + Send + 'static>;
/// Called when the server asks for credentials.
pub type AuthHandler = Arc<dyn Fn(Authorizer) + Send + Sync>;
/// Called when the server's certificate is not trusted.
pub type TrustHandler = Arc<dyn Fn(SslTrust) + Send + Sync>;
/// Called once when the final response headers arrive.
pub type HeadersHandler = Arc<dyn Fn(&Response, &Operation) + Send + Sync>;
/// Called as the upload or download advances.
pub type ProgressHandler = Arc<dyn Fn(TransferProgress) + Send + Sync>;
/// Re-creates a single-use body stream when it must be sent again.
///
/// Runs on the event thread and must not block.
pub type BodyStreamHandler = Arc<dyn Fn() -> Option<Box<dyn Read + Send>> + Send + Sync>;

/// HTTP request methods.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum HttpMethod {
    /// HTTP GET method.
    Get,
    /// HTTP POST method.
    Post,
    /// HTTP PUT method.
    Put,
    /// HTTP DELETE method.
    Delete,
    /// HTTP PATCH method.
    Patch,
    /// HTTP HEAD method.
    Head,
    /// HTTP OPTIONS method.
    Options,
    /// Any other method token, such as `PROPFIND`.
    Custom(String),
}

impl HttpMethod {
    /// The method token.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
            Self::Patch => "PATCH",
            Self::Head => "HEAD",
            Self::Options => "OPTIONS",
            Self::Custom(token) => token,
        }
    }

    pub(crate) fn to_method(&self) -> Result<Method> {
        match self {
            Self::Get => Ok(Method::GET),
            Self::Post => Ok(Method::POST),
            Self::Put => Ok(Method::PUT),
            Self::Delete => Ok(Method::DELETE),
            Self::Patch => Ok(Method::PATCH),
            Self::Head => Ok(Method::HEAD),
            Self::Options => Ok(Method::OPTIONS),
            Self::Custom(token) => Method::from_bytes(token.as_bytes())
                .map_err(|_| Error::InvalidMethod(token.clone())),
        }
    }
}

impl From<&str> for HttpMethod {
    fn from(token: &str) -> Self {
        match token {
            "GET" => Self::Get,
            "POST" => Self::Post,
            "PUT" => Self::Put,
            "DELETE" => Self::Delete,
            "PATCH" => Self::Patch,
            "HEAD" => Self::Head,
            "OPTIONS" => Self::Options,
            other => Self::Custom(other.to_string()),
        }
    }
}

impl std::fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cache behaviour, sent to the server as request directives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CachePolicy {
    /// Let the protocol decide.
    #[default]
    UseProtocolCachePolicy,
    /// Ask every cache on the path to revalidate.
    ReloadIgnoringCache,
    /// Accept stale cached data if available.
    ReturnCacheDataElseLoad,
    /// Only accept cached data.
    ReturnCacheDataDontLoad,
}

impl CachePolicy {
    fn apply(self, headers: &mut HeaderMap) {
        let directive = match self {
            CachePolicy::UseProtocolCachePolicy => return,
            CachePolicy::ReloadIgnoringCache => {
                headers.insert(PRAGMA, HeaderValue::from_static("no-cache"));
                "no-cache"
            }
            CachePolicy::ReturnCacheDataElseLoad => "max-stale",
            CachePolicy::ReturnCacheDataDontLoad => "only-if-cached",
        };
        if !headers.contains_key(CACHE_CONTROL) {
            headers.insert(CACHE_CONTROL, HeaderValue::from_static(directive));
        }
    }
}

/// The body of a request.
#[derive(Debug, Clone, Default)]
pub enum RequestBody {
    /// No body.
    #[default]
    Empty,
    /// An in-memory body.
    Bytes {
        /// Body bytes.
        data: Bytes,
        /// `Content-Type` to send.
        content_type: Option<String>,
    },
    /// A single-use stream; see [`Request::body_stream`].
    Stream {
        /// `Content-Type` to send.
        content_type: Option<String>,
        /// Total length, if known.
        length: Option<u64>,
    },
    /// A file read from disk when the request is sent.
    File {
        /// Path of the file.
        path: PathBuf,
        /// `Content-Type` to send.
        content_type: Option<String>,
    },
    /// A form, URL-encoded or multipart.
    Form(FormPost),
}

#[derive(Clone, Default)]
pub(crate) struct Handlers {
    pub(crate) auth: Option<AuthHandler>,
    pub(crate) trust: Option<TrustHandler>,
    pub(crate) headers: Option<HeadersHandler>,
    pub(crate) upload_progress: Option<ProgressHandler>,
    pub(crate) download_progress: Option<ProgressHandler>,
    pub(crate) body_stream: Option<BodyStreamHandler>,
}

/// A frozen request, owned by its operation.
pub struct RequestDescriptor {
    method: HttpMethod,
    url: String,
    query: Vec<(String, String)>,
    headers: HeaderMap,
    body: RequestBody,
    initial_stream: Mutex<Option<Box<dyn Read + Send>>>,
    timeout: Duration,
    cache_policy: CachePolicy,
    redirect_policy: RedirectPolicy,
    max_redirects: u32,
    pipelining: bool,
    cookies: bool,
    save_to_file: bool,
    cancel_causes_completion: bool,
    user_agent: Option<String>,
    encoding: &'static Encoding,
    user_info: Option<UserInfo>,
    pub(crate) handlers: Handlers,
    invalid: Option<Error>,
}

impl RequestDescriptor {
    /// The request method.
    pub fn method(&self) -> &HttpMethod {
        &self.method
    }

    /// The URL as given.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Request headers as configured.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// The request body.
    pub fn body(&self) -> &RequestBody {
        &self.body
    }

    /// Request timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Cache policy.
    pub fn cache_policy(&self) -> CachePolicy {
        self.cache_policy
    }

    /// Redirect policy.
    pub fn redirect_policy(&self) -> RedirectPolicy {
        self.redirect_policy
    }

    /// Maximum number of redirects followed.
    pub fn max_redirects(&self) -> u32 {
        self.max_redirects
    }

    /// Whether pipelining was requested.
    pub fn pipelining(&self) -> bool {
        self.pipelining
    }

    /// Whether cookies are stored and sent.
    pub fn cookies(&self) -> bool {
        self.cookies
    }

    /// Whether the body is saved to a temporary file.
    pub fn save_to_file(&self) -> bool {
        self.save_to_file
    }

    /// Whether cancelling still delivers a (cancelled) response.
    pub fn cancel_causes_completion(&self) -> bool {
        self.cancel_causes_completion
    }

    /// User agent override.
    pub fn user_agent(&self) -> Option<&str> {
        self.user_agent.as_deref()
    }

    /// Fallback text encoding for responses without a charset.
    pub fn encoding(&self) -> &'static Encoding {
        self.encoding
    }

    /// Opaque user data.
    pub fn user_info(&self) -> Option<&UserInfo> {
        self.user_info.as_ref()
    }

    /// Validate the method and URL. The URL must be absolute http or https.
    pub(crate) fn validate(&self) -> Result<(Method, Url)> {
        if let Some(err) = &self.invalid {
            return Err(err.clone());
        }
        let method = self.method.to_method()?;
        let mut url = Url::parse(&self.url)?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(Error::InvalidUrl(format!(
                "unsupported scheme {:?} in {}",
                url.scheme(),
                self.url
            )));
        }
        if url.host_str().is_none_or(str::is_empty) {
            return Err(Error::InvalidUrl(format!("missing host in {}", self.url)));
        }
        if !self.query.is_empty() {
            url.query_pairs_mut().extend_pairs(&self.query);
        }
        Ok((method, url))
    }

    /// Headers for the first attempt: configured headers plus user agent
    /// and cache directives.
    pub(crate) fn initial_headers(&self) -> HeaderMap {
        let mut headers = self.headers.clone();
        if let Some(agent) = &self.user_agent
            && let Ok(value) = HeaderValue::from_str(agent)
        {
            headers.insert(http::header::USER_AGENT, value);
        }
        self.cache_policy.apply(&mut headers);
        headers
    }

    /// The body for a new attempt, with its content type.
    ///
    /// Stream bodies are deferred until the transport asks for them.
    pub(crate) fn transport_body(
        &self,
    ) -> std::result::Result<(Option<String>, TransportBody), NetworkError> {
        match &self.body {
            RequestBody::Empty => Ok((None, TransportBody::Empty)),
            RequestBody::Bytes { data, content_type } => {
                Ok((content_type.clone(), TransportBody::Bytes(data.clone())))
            }
            RequestBody::Stream {
                content_type,
                length,
            } => Ok((
                content_type.clone(),
                TransportBody::Deferred { length: *length },
            )),
            RequestBody::File { path, content_type } => {
                let file = std::fs::File::open(path)
                    .map_err(|e| NetworkError::BodyStream(format!("{}: {e}", path.display())))?;
                let length = file.metadata().ok().map(|m| m.len());
                Ok((
                    content_type.clone(),
                    TransportBody::Reader {
                        reader: Box::new(file),
                        length,
                    },
                ))
            }
            RequestBody::Form(form) => {
                let encoded = form.encode()?;
                Ok((Some(encoded.content_type), encoded.body))
            }
        }
    }

    /// A readable body for [`TransportEvent::BodyStreamNeeded`].
    ///
    /// The configured stream is used once; after that the body stream
    /// handler must re-create it.
    ///
    /// [`TransportEvent::BodyStreamNeeded`]: crate::transport::TransportEvent::BodyStreamNeeded
    pub(crate) fn stream_body(&self) -> std::result::Result<TransportBody, NetworkError> {
        let RequestBody::Stream { length, .. } = &self.body else {
            return self.transport_body().map(|(_, body)| body);
        };
        if let Some(reader) = self.initial_stream.lock().take() {
            return Ok(TransportBody::Reader {
                reader,
                length: *length,
            });
        }
        let reader = self
            .handlers
            .body_stream
            .as_ref()
            .and_then(|create| create())
            .ok_or_else(|| {
                NetworkError::BodyStream(
                    "the body stream was already consumed and cannot be re-created".to_string(),
                )
            })?;
        Ok(TransportBody::Reader {
            reader,
            length: *length,
        })
    }
}

impl std::fmt::Debug for RequestDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestDescriptor")
            .field("method", &self.method)
            .field("url", &self.url)
            .field("headers", &self.headers)
            .field("body", &self.body)
            .field("timeout", &self.timeout)
            .field("redirect_policy", &self.redirect_policy)
            .field("save_to_file", &self.save_to_file)
            .finish_non_exhaustive()
    }
}

/// Builder for an HTTP operation.
///
/// ```ignore
/// let operation = Request::get("https://example.com/data.json")
///     .header("Accept", "application/json")
///     .timeout(Duration::from_secs(5))
///     .on_download_progress(|p| println!("{:?}", p.fraction()))
///     .start(|response| println!("{}", response.response_string()))?;
/// ```
pub struct Request {
    descriptor: RequestDescriptor,
    event_thread: Option<Arc<dyn EventThread>>,
    context: Option<Arc<dyn ExecutionContext>>,
    transport: Option<Arc<dyn Transport>>,
}

impl Request {
    /// Create a request with the given method.
    pub fn new(method: impl Into<HttpMethod>, url: impl Into<String>) -> Self {
        Self {
            descriptor: RequestDescriptor {
                method: method.into(),
                url: url.into(),
                query: Vec::new(),
                headers: HeaderMap::new(),
                body: RequestBody::Empty,
                initial_stream: Mutex::new(None),
                timeout: DEFAULT_TIMEOUT,
                cache_policy: CachePolicy::default(),
                redirect_policy: RedirectPolicy::default(),
                max_redirects: DEFAULT_MAX_REDIRECTS,
                pipelining: false,
                cookies: true,
                save_to_file: false,
                cancel_causes_completion: true,
                user_agent: None,
                encoding: encoding_rs::UTF_8,
                user_info: None,
                handlers: Handlers::default(),
                invalid: None,
            },
            event_thread: None,
            context: None,
            transport: None,
        }
    }

    /// A GET request.
    pub fn get(url: impl Into<String>) -> Self {
        Self::new(HttpMethod::Get, url)
    }

    /// A POST request.
    pub fn post(url: impl Into<String>) -> Self {
        Self::new(HttpMethod::Post, url)
    }

    /// A request with any method token, such as `DELETE` or `PROPFIND`.
    pub fn custom(method: impl AsRef<str>, url: impl Into<String>) -> Self {
        Self::new(HttpMethod::from(method.as_ref()), url)
    }

    fn record(&mut self, err: Error) {
        if self.descriptor.invalid.is_none() {
            self.descriptor.invalid = Some(err);
        }
    }

    /// Set a header, replacing any previous value for the same name.
    ///
    /// An invalid name or value is reported when the operation starts.
    pub fn header(mut self, name: impl AsRef<str>, value: impl AsRef<str>) -> Self {
        match (
            HeaderName::from_bytes(name.as_ref().as_bytes()),
            HeaderValue::from_str(value.as_ref()),
        ) {
            (Ok(name), Ok(value)) => {
                self.descriptor.headers.insert(name, value);
            }
            (Err(e), _) => self.record(e.into()),
            (_, Err(e)) => self.record(e.into()),
        }
        self
    }

    /// Set several headers, replacing previous values.
    pub fn headers(mut self, headers: HeaderMap) -> Self {
        let mut current: Option<HeaderName> = None;
        for (name, value) in headers {
            match name {
                Some(name) => {
                    self.descriptor.headers.insert(name.clone(), value);
                    current = Some(name);
                }
                // Further values of the same name.
                None => {
                    if let Some(name) = &current {
                        self.descriptor.headers.append(name.clone(), value);
                    }
                }
            }
        }
        self
    }

    /// Append a query parameter to the URL.
    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.descriptor.query.push((key.into(), value.into()));
        self
    }

    /// Send `Authorization: Basic` with these credentials up front.
    pub fn try_basic_auth(mut self, username: &str, password: &str) -> Self {
        let token = STANDARD.encode(format!("{username}:{password}"));
        match HeaderValue::from_str(&format!("Basic {token}")) {
            Ok(value) => {
                self.descriptor.headers.insert(AUTHORIZATION, value);
            }
            Err(e) => self.record(e.into()),
        }
        self
    }

    /// Send an in-memory body.
    pub fn body_bytes(mut self, data: impl Into<Bytes>, content_type: Option<&str>) -> Self {
        self.descriptor.body = RequestBody::Bytes {
            data: data.into(),
            content_type: content_type.map(str::to_string),
        };
        self
    }

    /// Send a body read from `reader`.
    ///
    /// The reader is consumed by the first attempt. If the body has to be sent
    /// again (a redirect that keeps the body, an auth retry) it is re-created
    /// with the handler from [`on_body_stream`](Self::on_body_stream).
    pub fn body_stream(
        mut self,
        reader: impl Read + Send + 'static,
        content_type: Option<&str>,
        length: Option<u64>,
    ) -> Self {
        self.descriptor.body = RequestBody::Stream {
            content_type: content_type.map(str::to_string),
            length,
        };
        *self.descriptor.initial_stream.get_mut() = Some(Box::new(reader));
        self
    }

    /// Send the contents of a file, optionally with a `Content-Type`
    /// guessed from its extension.
    pub fn body_file(mut self, path: impl Into<PathBuf>, guess_content_type_from_path: bool) -> Self {
        let path = path.into();
        let content_type = guess_content_type_from_path.then(|| guess_content_type(&path));
        self.descriptor.body = RequestBody::File { path, content_type };
        self
    }

    /// Send a form.
    pub fn form(mut self, form: FormPost) -> Self {
        self.descriptor.body = RequestBody::Form(form);
        self
    }

    /// Set the request timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.descriptor.timeout = timeout;
        self
    }

    /// Set the cache policy.
    pub fn cache_policy(mut self, policy: CachePolicy) -> Self {
        self.descriptor.cache_policy = policy;
        self
    }

    /// Set the redirect policy.
    pub fn redirect_policy(mut self, policy: RedirectPolicy) -> Self {
        self.descriptor.redirect_policy = policy;
        self
    }

    /// Limit the number of redirects followed.
    pub fn max_redirects(mut self, max: u32) -> Self {
        self.descriptor.max_redirects = max;
        self
    }

    /// Request HTTP pipelining.
    pub fn pipelining(mut self, enabled: bool) -> Self {
        self.descriptor.pipelining = enabled;
        self
    }

    /// Store and send cookies (on by default).
    pub fn cookies(mut self, enabled: bool) -> Self {
        self.descriptor.cookies = enabled;
        self
    }

    /// Save the response body to a temporary file instead of memory.
    pub fn save_to_file(mut self, enabled: bool) -> Self {
        self.descriptor.save_to_file = enabled;
        self
    }

    /// Whether cancelling delivers a cancelled response (on by default).
    pub fn cancel_causes_completion(mut self, enabled: bool) -> Self {
        self.descriptor.cancel_causes_completion = enabled;
        self
    }

    /// Override the user agent.
    pub fn user_agent(mut self, agent: impl Into<String>) -> Self {
        self.descriptor.user_agent = Some(agent.into());
        self
    }

    /// Text encoding for responses that do not declare a charset.
    pub fn encoding(mut self, encoding: &'static Encoding) -> Self {
        self.descriptor.encoding = encoding;
        self
    }

    /// Attach opaque data, returned on the response.
    pub fn user_info<T: Any + Send + Sync>(mut self, info: T) -> Self {
        self.descriptor.user_info = Some(Arc::new(info));
        self
    }

    /// Handle authentication challenges.
    pub fn on_auth_challenge<F>(mut self, handler: F) -> Self
    where
        F: Fn(Authorizer) + Send + Sync + 'static,
    {
        self.descriptor.handlers.auth = Some(Arc::new(handler));
        self
    }

    /// Handle untrusted server certificates.
    pub fn on_trust_challenge<F>(mut self, handler: F) -> Self
    where
        F: Fn(SslTrust) + Send + Sync + 'static,
    {
        self.descriptor.handlers.trust = Some(Arc::new(handler));
        self
    }

    /// Handle both kinds of challenge with one handler.
    ///
    /// Replaces any handler set with [`on_auth_challenge`](Self::on_auth_challenge)
    /// or [`on_trust_challenge`](Self::on_trust_challenge).
    pub fn on_challenge<F>(mut self, handler: F) -> Self
    where
        F: Fn(ChallengeDecision) + Send + Sync + 'static,
    {
        let handler = Arc::new(handler);
        let auth = handler.clone();
        self.descriptor.handlers.auth = Some(Arc::new(move |a: Authorizer| auth(a.into())));
        self.descriptor.handlers.trust = Some(Arc::new(move |t: SslTrust| handler(t.into())));
        self
    }

    /// Observe the final response headers before the body arrives.
    pub fn on_headers<F>(mut self, handler: F) -> Self
    where
        F: Fn(&Response, &Operation) + Send + Sync + 'static,
    {
        self.descriptor.handlers.headers = Some(Arc::new(handler));
        self
    }

    /// Observe upload progress.
    pub fn on_upload_progress<F>(mut self, handler: F) -> Self
    where
        F: Fn(TransferProgress) + Send + Sync + 'static,
    {
        self.descriptor.handlers.upload_progress = Some(Arc::new(handler));
        self
    }

    /// Observe download progress.
    pub fn on_download_progress<F>(mut self, handler: F) -> Self
    where
        F: Fn(TransferProgress) + Send + Sync + 'static,
    {
        self.descriptor.handlers.download_progress = Some(Arc::new(handler));
        self
    }

    /// Re-create a stream body when it must be sent again.
    pub fn on_body_stream<F>(mut self, handler: F) -> Self
    where
        F: Fn() -> Option<Box<dyn Read + Send>> + Send + Sync + 'static,
    {
        self.descriptor.handlers.body_stream = Some(Arc::new(handler));
        self
    }

    /// Run callbacks on `context` instead of the shared callback queue.
    pub fn execution_context(mut self, context: Arc<dyn ExecutionContext>) -> Self {
        self.context = Some(context);
        self
    }

    /// Run the operation on `thread` instead of the shared event thread.
    pub fn event_thread(mut self, thread: Arc<dyn EventThread>) -> Self {
        self.event_thread = Some(thread);
        self
    }

    /// Use `transport` instead of the default one.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Freeze the request into an operation that has not started yet.
    pub fn operation<F>(self, completion: F) -> Operation
    where
        F: FnOnce(Response) + Send + 'static,
    {
        Operation::new(
            Arc::new(self.descriptor),
            Box::new(completion),
            self.event_thread.unwrap_or_else(shared_event_thread),
            self.context.unwrap_or_else(default_context),
            self.transport.unwrap_or_else(default_transport),
        )
    }

    /// Freeze the request and start it.
    pub fn start<F>(self, completion: F) -> Result<Operation>
    where
        F: FnOnce(Response) + Send + 'static,
    {
        let operation = self.operation(completion);
        operation.start()?;
        Ok(operation)
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("descriptor", &self.descriptor)
            .finish_non_exhaustive()
    }
}
