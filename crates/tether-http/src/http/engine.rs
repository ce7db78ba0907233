//! The per-operation state machine driven on the event thread.
//!
//! Every job that touches an executing operation (launch, transport events,
//! challenge resolutions, cancellation) runs on the operation's event thread
//! and goes through [`with_engine`], which takes the operation's [`Engine`]
//! out of the registry for the duration of the step. Cancellation is checked
//! at the start of every step.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, LazyLock};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use http::header::{AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, HeaderValue};
use http::{HeaderMap, Method};
use parking_lot::Mutex;
use tether_core::logging::{span_names, targets};
use url::Url;

use super::challenge::{Authorizer, Resolution, SslTrust};
use super::operation::{Operation, OperationId, OperationShared, OperationState};
use super::redirect::{RedirectAction, next_hop};
use super::response::{ResponseAssembler, TransferProgress};
use crate::error::NetworkError;
use crate::transport::{Connection, EventSink, TransportBody, TransportEvent, TransportRequest};

static REGISTRY: LazyLock<Mutex<HashMap<OperationId, Engine>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

enum Flow {
    Continue,
    Done,
}

/// Suppresses progress reports that would go backwards.
#[derive(Debug, Default)]
struct ProgressTracker {
    last: Option<TransferProgress>,
}

impl ProgressTracker {
    fn advance(&mut self, bytes: u64, total: Option<u64>) -> Option<TransferProgress> {
        let next = TransferProgress {
            bytes_transferred: bytes,
            total_bytes: total,
        };
        if let Some(last) = self.last {
            if next == last || bytes < last.bytes_transferred {
                return None;
            }
            if let (Some(prev), Some(now)) = (last.fraction(), next.fraction())
                && now < prev
            {
                return None;
            }
        }
        self.last = Some(next);
        Some(next)
    }
}

struct Engine {
    shared: Arc<OperationShared>,
    connection: Option<Box<dyn Connection>>,
    generation: u64,
    method: Method,
    url: Url,
    headers: HeaderMap,
    keep_body: bool,
    assembler: Option<ResponseAssembler>,
    redirects: u32,
    credentials_sent: bool,
    trusted_hosts: HashSet<String>,
    challenge: u64,
    challenge_host: Option<String>,
    headers_delivered: bool,
    expected_length: Option<u64>,
    upload: ProgressTracker,
    download: ProgressTracker,
}

/// Run one step for `id`. The engine is reinserted unless the step ended it.
fn with_engine(id: OperationId, step: impl FnOnce(&mut Engine) -> Flow) {
    let Some(mut engine) = REGISTRY.lock().remove(&id) else {
        tracing::trace!(target: targets::OPERATION, operation = %id, "no engine; step ignored");
        return;
    };
    let span = tracing::debug_span!(span_names::ENGINE_STEP, operation = %id);
    let _guard = span.enter();

    let flow = if engine.shared.cancel_requested() {
        engine.finish_cancelled()
    } else {
        step(&mut engine)
    };
    if let Flow::Continue = flow {
        REGISTRY.lock().insert(id, engine);
    }
}

/// Begin executing an operation that was just moved to `Executing`.
pub(crate) fn launch(shared: Arc<OperationShared>, method: Method, url: Url) {
    let request = shared.request.clone();
    if shared.cancel_requested() {
        let response = ResponseAssembler::detached(None, true, request.user_info().cloned());
        shared.finish(OperationState::Cancelled, response);
        return;
    }

    let assembler = match ResponseAssembler::new(
        request.save_to_file(),
        request.encoding(),
        request.user_info().cloned(),
    ) {
        Ok(assembler) => assembler,
        Err(err) => {
            tracing::warn!(target: targets::OPERATION, operation = %shared.id, error = %err, "could not create response sink");
            let response = ResponseAssembler::detached(Some(err), false, request.user_info().cloned());
            shared.finish(OperationState::Finished, response);
            return;
        }
    };
    if request.pipelining() {
        tracing::debug!(target: targets::OPERATION, operation = %shared.id, "pipelining requested; HTTP/1.1 connections are reused instead");
    }

    let id = shared.id;
    let mut engine = Engine {
        shared,
        connection: None,
        generation: 0,
        method,
        url,
        headers: request.initial_headers(),
        keep_body: true,
        assembler: Some(assembler),
        redirects: 0,
        credentials_sent: false,
        trusted_hosts: HashSet::new(),
        challenge: 0,
        challenge_host: None,
        headers_delivered: false,
        expected_length: None,
        upload: ProgressTracker::default(),
        download: ProgressTracker::default(),
    };
    if let Flow::Continue = engine.reopen() {
        REGISTRY.lock().insert(id, engine);
    }
}

/// Handle a transport event stamped with `generation`.
pub(crate) fn deliver(id: OperationId, generation: u64, event: TransportEvent) {
    with_engine(id, |engine| {
        if generation != engine.generation {
            tracing::debug!(
                target: targets::OPERATION,
                operation = %id,
                generation,
                current = engine.generation,
                "stale transport event discarded"
            );
            return Flow::Continue;
        }
        engine.handle(event)
    });
}

/// Apply a challenge decision.
pub(crate) fn resolve(id: OperationId, challenge: u64, resolution: Resolution) {
    let mut found = false;
    with_engine(id, |engine| {
        found = true;
        engine.resolve(challenge, resolution)
    });
    if !found {
        tracing::warn!(target: targets::CHALLENGE, operation = %id, "resolution for an ended operation rejected");
    }
}

/// End an operation whose event thread refused one of its transport events.
pub(crate) fn abandon(id: OperationId) {
    let Some(mut engine) = REGISTRY.lock().remove(&id) else {
        return;
    };
    tracing::warn!(target: targets::OPERATION, operation = %id, "event thread refused a transport event");
    if engine.shared.cancel_requested() {
        engine.finish_cancelled();
    } else {
        engine.fail(NetworkError::EventThreadUnavailable);
    }
}

/// Observe a cancellation request. The cancel flag itself is checked by
/// [`with_engine`].
pub(crate) fn cancel(id: OperationId) {
    with_engine(id, |_| Flow::Continue);
}

impl Engine {
    fn handle(&mut self, event: TransportEvent) -> Flow {
        match event {
            TransportEvent::Redirect {
                status, location, ..
            } => self.on_redirect(status, &location),
            TransportEvent::AuthChallenge {
                host,
                realm,
                status,
                ..
            } => self.on_auth_challenge(host, realm, status),
            TransportEvent::TrustChallenge { host, reason } => self.on_trust_challenge(host, reason),
            TransportEvent::Headers {
                status,
                headers,
                expected_length,
            } => self.on_headers(status, headers, expected_length),
            TransportEvent::Data(chunk) => self.on_data(chunk),
            TransportEvent::UploadProgress { sent, total } => {
                if let Some(progress) = self.upload.advance(sent, total)
                    && let Some(handler) = self.shared.request.handlers.upload_progress.clone()
                {
                    self.shared.context.execute(Box::new(move || handler(progress)));
                }
                Flow::Continue
            }
            TransportEvent::BodyStreamNeeded => self.on_body_stream_needed(),
            TransportEvent::Finished => self.finish(),
            TransportEvent::Failed(err) => self.fail(err),
        }
    }

    fn on_redirect(&mut self, status: u16, location: &str) -> Flow {
        let request = self.shared.request.clone();
        let action = match next_hop(
            request.redirect_policy(),
            status,
            &self.method,
            &self.url,
            location,
        ) {
            Ok(action) => action,
            Err(err) => return self.fail(err),
        };

        match action {
            RedirectAction::Stop => {
                tracing::debug!(target: targets::OPERATION, operation = %self.shared.id, status, "redirect not followed; delivering it");
                if let Some(connection) = self.connection.as_mut() {
                    connection.deliver_redirect();
                }
                Flow::Continue
            }
            RedirectAction::Follow {
                method,
                url,
                keep_body,
            } => {
                self.redirects += 1;
                if self.redirects > request.max_redirects() {
                    return self.fail(NetworkError::TooManyRedirects);
                }
                if url.origin() != self.url.origin() {
                    self.headers.remove(AUTHORIZATION);
                }
                if !keep_body {
                    self.keep_body = false;
                    self.headers.remove(CONTENT_TYPE);
                    self.headers.remove(CONTENT_LENGTH);
                }
                tracing::debug!(
                    target: targets::OPERATION,
                    operation = %self.shared.id,
                    status,
                    from = %self.url,
                    to = %url,
                    %method,
                    "following redirect"
                );
                self.method = method;
                self.url = url;
                self.credentials_sent = false;
                self.reopen()
            }
        }
    }

    fn on_auth_challenge(&mut self, host: String, realm: Option<String>, status: u16) -> Flow {
        if self.credentials_sent {
            tracing::debug!(target: targets::CHALLENGE, operation = %self.shared.id, status, "credentials rejected; delivering challenge response");
            if let Some(connection) = self.connection.as_mut() {
                connection.continue_without_credentials();
            }
            return Flow::Continue;
        }
        let Some(handler) = self.shared.request.handlers.auth.clone() else {
            return self.fail(NetworkError::AuthorizationRequired { host });
        };

        self.suspend(&host);
        let authorizer = Authorizer::new(&self.shared, self.challenge, host, realm);
        self.shared.context.execute(Box::new(move || handler(authorizer)));
        Flow::Continue
    }

    fn on_trust_challenge(&mut self, host: String, reason: String) -> Flow {
        if self.trusted_hosts.contains(&host) {
            return self.fail(NetworkError::Tls(reason));
        }
        let Some(handler) = self.shared.request.handlers.trust.clone() else {
            tracing::debug!(target: targets::CHALLENGE, operation = %self.shared.id, %host, %reason, "no trust handler; not trusting");
            return self.fail(NetworkError::UntrustedCertificate { host });
        };

        self.suspend(&host);
        let trust = SslTrust::new(&self.shared, self.challenge, host, reason);
        self.shared.context.execute(Box::new(move || handler(trust)));
        Flow::Continue
    }

    fn on_headers(&mut self, status: u16, headers: HeaderMap, expected_length: Option<u64>) -> Flow {
        let Some(assembler) = self.assembler.as_mut() else {
            return Flow::Continue;
        };
        assembler.set_head(status, headers);
        self.expected_length = expected_length;

        if !self.headers_delivered
            && let Some(handler) = self.shared.request.handlers.headers.clone()
        {
            self.headers_delivered = true;
            let response = assembler.partial();
            let operation = Operation::from_shared(self.shared.clone());
            self.shared
                .context
                .execute(Box::new(move || handler(&response, &operation)));
        }
        Flow::Continue
    }

    fn on_data(&mut self, chunk: Bytes) -> Flow {
        let Some(assembler) = self.assembler.as_mut() else {
            return Flow::Continue;
        };
        if let Err(err) = assembler.append(&chunk) {
            return self.fail(err);
        }
        let received = assembler.received();
        if let Some(progress) = self.download.advance(received, self.expected_length)
            && let Some(handler) = self.shared.request.handlers.download_progress.clone()
        {
            self.shared.context.execute(Box::new(move || handler(progress)));
        }
        Flow::Continue
    }

    fn on_body_stream_needed(&mut self) -> Flow {
        let body = if self.keep_body {
            match self.shared.request.stream_body() {
                Ok(body) => body,
                Err(err) => return self.fail(err),
            }
        } else {
            TransportBody::Empty
        };
        if let Some(connection) = self.connection.as_mut() {
            connection.supply_body(body);
        }
        Flow::Continue
    }

    fn resolve(&mut self, challenge: u64, resolution: Resolution) -> Flow {
        if challenge != self.challenge || self.shared.state() != OperationState::Suspended {
            tracing::warn!(
                target: targets::CHALLENGE,
                operation = %self.shared.id,
                challenge,
                current = self.challenge,
                state = ?self.shared.state(),
                "superseded resolution rejected"
            );
            return Flow::Continue;
        }
        let host = self.challenge_host.take().unwrap_or_default();

        match resolution {
            Resolution::Credentials { username, password } => {
                let token = STANDARD.encode(format!("{username}:{password}"));
                match HeaderValue::from_str(&format!("Basic {token}")) {
                    Ok(value) => {
                        self.headers.insert(AUTHORIZATION, value);
                    }
                    Err(err) => return self.fail(NetworkError::Request(err.to_string())),
                }
                self.credentials_sent = true;
                self.resume()
            }
            Resolution::CancelAuthorization => {
                self.fail(NetworkError::AuthorizationCancelled { host })
            }
            Resolution::Trust => {
                self.trusted_hosts.insert(host);
                self.resume()
            }
            Resolution::DontTrust => self.fail(NetworkError::UntrustedCertificate { host }),
        }
    }

    /// Close the connection and wait for a decision.
    fn suspend(&mut self, host: &str) {
        self.release();
        self.generation += 1;
        self.challenge += 1;
        self.challenge_host = Some(host.to_string());
        self.shared.transition(OperationState::Suspended);
    }

    fn resume(&mut self) -> Flow {
        if !self.shared.transition(OperationState::Executing) {
            return Flow::Done;
        }
        self.reopen()
    }

    fn reopen(&mut self) -> Flow {
        match self.open() {
            Ok(()) => Flow::Continue,
            Err(err) => self.fail(err),
        }
    }

    /// Open a new connection for the current method and URL. Events from
    /// earlier connections are discarded from here on.
    fn open(&mut self) -> Result<(), NetworkError> {
        self.release();
        self.generation += 1;
        if let Some(assembler) = self.assembler.as_mut() {
            assembler.reset()?;
            assembler.set_url(self.url.clone());
        }

        let request = self.shared.request.clone();
        let mut headers = self.headers.clone();
        let body = if self.keep_body {
            let (content_type, body) = request.transport_body()?;
            if let Some(content_type) = content_type
                && !headers.contains_key(CONTENT_TYPE)
                && let Ok(value) = HeaderValue::from_str(&content_type)
            {
                headers.insert(CONTENT_TYPE, value);
            }
            body
        } else {
            TransportBody::Empty
        };

        let accept_invalid_certs = self
            .url
            .host_str()
            .is_some_and(|host| self.trusted_hosts.contains(host));
        let transport_request = TransportRequest {
            method: self.method.clone(),
            url: self.url.clone(),
            headers,
            body,
            timeout: request.timeout(),
            cookies: request.cookies(),
            pipelining: request.pipelining(),
            report_redirects: request.redirect_policy().follows(),
            accept_invalid_certs,
        };
        tracing::debug!(
            target: targets::OPERATION,
            operation = %self.shared.id,
            generation = self.generation,
            method = %transport_request.method,
            url = %transport_request.url,
            "opening connection"
        );
        let sink = EventSink::new(self.shared.id, self.generation, self.shared.thread.clone());
        self.connection = Some(self.shared.transport.open(transport_request, sink));
        Ok(())
    }

    fn release(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            connection.cancel();
        }
    }

    fn finish(&mut self) -> Flow {
        self.release();
        if let Some(assembler) = self.assembler.take() {
            let response = assembler.finish();
            tracing::debug!(target: targets::OPERATION, operation = %self.shared.id, status = response.status(), "finished");
            self.shared.finish(OperationState::Finished, response);
        }
        Flow::Done
    }

    fn fail(&mut self, err: NetworkError) -> Flow {
        self.release();
        tracing::debug!(target: targets::OPERATION, operation = %self.shared.id, error = %err, "failed");
        let response = match self.assembler.take() {
            Some(assembler) => assembler.fail(err),
            None => ResponseAssembler::detached(
                Some(err),
                false,
                self.shared.request.user_info().cloned(),
            ),
        };
        self.shared.finish(OperationState::Finished, response);
        Flow::Done
    }

    fn finish_cancelled(&mut self) -> Flow {
        self.release();
        tracing::debug!(target: targets::OPERATION, operation = %self.shared.id, "cancelled");
        let response = match self.assembler.take() {
            Some(assembler) => assembler.cancel(),
            None => {
                ResponseAssembler::detached(None, true, self.shared.request.user_info().cloned())
            }
        };
        self.shared.finish(OperationState::Cancelled, response);
        Flow::Done
    }
}
