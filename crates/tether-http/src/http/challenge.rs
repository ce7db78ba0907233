//! Challenge decisions.
//!
//! When the server asks for credentials, or presents a certificate that is
//! not trusted, the operation suspends and hands a decision object to the
//! request's handler. The handler may answer at once or keep the object and
//! answer later, from any thread.
//!
//! A decision resolves exactly once. The first resolving call wins; calls
//! after it, on the same handle or a clone, do nothing and return `false`.
//! Dropping every handle without answering resolves the decision with its
//! default (cancel the authorization, or do not trust).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use tether_core::EventThread;
use tether_core::logging::targets;

use super::engine;
use super::operation::{OperationId, OperationShared};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Resolution {
    Credentials { username: String, password: String },
    CancelAuthorization,
    Trust,
    DontTrust,
}

struct DecisionCore {
    host: String,
    operation: OperationId,
    shared: Weak<OperationShared>,
    challenge: u64,
    resolved: AtomicBool,
    thread: Arc<dyn EventThread>,
    default: Resolution,
}

impl DecisionCore {
    fn resolve(&self, resolution: Resolution) -> bool {
        if self.resolved.swap(true, Ordering::AcqRel) {
            tracing::debug!(
                target: targets::CHALLENGE,
                operation = %self.operation,
                "challenge already resolved; ignoring"
            );
            return false;
        }

        match self.shared.upgrade() {
            Some(shared) if !shared.state().is_terminal() => {}
            _ => {
                tracing::warn!(
                    target: targets::CHALLENGE,
                    operation = %self.operation,
                    ?resolution,
                    "operation already ended; resolution rejected"
                );
                return false;
            }
        }

        tracing::debug!(
            target: targets::CHALLENGE,
            operation = %self.operation,
            challenge = self.challenge,
            host = %self.host,
            ?resolution,
            "challenge resolved"
        );
        let operation = self.operation;
        let challenge = self.challenge;
        let posted = self.thread.post(Box::new(move || {
            engine::resolve(operation, challenge, resolution);
        }));
        if !posted {
            tracing::warn!(
                target: targets::CHALLENGE,
                operation = %self.operation,
                "event thread stopped; resolution dropped"
            );
        }
        posted
    }
}

impl Drop for DecisionCore {
    fn drop(&mut self) {
        if !self.resolved.load(Ordering::Acquire) {
            tracing::debug!(
                target: targets::CHALLENGE,
                operation = %self.operation,
                "challenge dropped unanswered; applying default"
            );
            self.resolve(self.default.clone());
        }
    }
}

/// An authentication challenge.
#[derive(Clone)]
pub struct Authorizer {
    core: Arc<DecisionCore>,
    realm: Option<String>,
}

impl Authorizer {
    pub(crate) fn new(
        shared: &Arc<OperationShared>,
        challenge: u64,
        host: String,
        realm: Option<String>,
    ) -> Self {
        Self {
            core: Arc::new(DecisionCore {
                host,
                operation: shared.id,
                shared: Arc::downgrade(shared),
                challenge,
                resolved: AtomicBool::new(false),
                thread: shared.thread.clone(),
                default: Resolution::CancelAuthorization,
            }),
            realm,
        }
    }

    /// Host that asked for credentials.
    pub fn host(&self) -> &str {
        &self.core.host
    }

    /// Realm from the challenge, if the server sent one.
    pub fn realm(&self) -> Option<&str> {
        self.realm.as_deref()
    }

    /// Retry the request once with these credentials (HTTP Basic).
    ///
    /// If the server challenges again, the challenge response is delivered
    /// as the final response.
    pub fn continue_with(&self, username: &str, password: &str) -> bool {
        self.core.resolve(Resolution::Credentials {
            username: username.to_string(),
            password: password.to_string(),
        })
    }

    /// Give up; the operation fails with an authorization-cancelled error.
    pub fn cancel(&self) -> bool {
        self.core.resolve(Resolution::CancelAuthorization)
    }

    /// Whether an answer was given.
    pub fn is_resolved(&self) -> bool {
        self.core.resolved.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for Authorizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authorizer")
            .field("host", &self.core.host)
            .field("realm", &self.realm)
            .field("resolved", &self.is_resolved())
            .finish()
    }
}

/// An untrusted-certificate challenge.
#[derive(Clone)]
pub struct SslTrust {
    core: Arc<DecisionCore>,
    reason: String,
}

impl SslTrust {
    pub(crate) fn new(
        shared: &Arc<OperationShared>,
        challenge: u64,
        host: String,
        reason: String,
    ) -> Self {
        Self {
            core: Arc::new(DecisionCore {
                host,
                operation: shared.id,
                shared: Arc::downgrade(shared),
                challenge,
                resolved: AtomicBool::new(false),
                thread: shared.thread.clone(),
                default: Resolution::DontTrust,
            }),
            reason,
        }
    }

    /// Host whose certificate was rejected.
    pub fn host(&self) -> &str {
        &self.core.host
    }

    /// What the TLS layer reported.
    pub fn reason(&self) -> &str {
        &self.reason
    }

    /// Trust the host for the rest of this operation and reload.
    pub fn trust(&self) -> bool {
        self.core.resolve(Resolution::Trust)
    }

    /// Refuse; the operation fails with an untrusted-certificate error.
    pub fn dont_trust(&self) -> bool {
        self.core.resolve(Resolution::DontTrust)
    }

    /// Whether an answer was given.
    pub fn is_resolved(&self) -> bool {
        self.core.resolved.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for SslTrust {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SslTrust")
            .field("host", &self.core.host)
            .field("reason", &self.reason)
            .field("resolved", &self.is_resolved())
            .finish()
    }
}

/// Either kind of challenge, for code that handles both.
#[derive(Debug, Clone)]
pub enum ChallengeDecision {
    /// Credentials are required.
    Authorizer(Authorizer),
    /// A certificate needs a trust decision.
    SslTrust(SslTrust),
}

impl ChallengeDecision {
    /// Host under challenge.
    pub fn host(&self) -> &str {
        match self {
            ChallengeDecision::Authorizer(a) => a.host(),
            ChallengeDecision::SslTrust(t) => t.host(),
        }
    }

    /// Whether an answer was given.
    pub fn is_resolved(&self) -> bool {
        match self {
            ChallengeDecision::Authorizer(a) => a.is_resolved(),
            ChallengeDecision::SslTrust(t) => t.is_resolved(),
        }
    }

    /// Answer with the default: cancel the authorization, or do not trust.
    pub fn decline(&self) -> bool {
        match self {
            ChallengeDecision::Authorizer(a) => a.cancel(),
            ChallengeDecision::SslTrust(t) => t.dont_trust(),
        }
    }
}

impl From<Authorizer> for ChallengeDecision {
    fn from(a: Authorizer) -> Self {
        ChallengeDecision::Authorizer(a)
    }
}

impl From<SslTrust> for ChallengeDecision {
    fn from(t: SslTrust) -> Self {
        ChallengeDecision::SslTrust(t)
    }
}
