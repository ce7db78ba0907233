//! Redirect policy.
//!
//! The transport never follows redirects on its own. It reports each
//! followable 3xx response carrying a `Location` and the engine asks
//! [`next_hop`] what to do with it.

use http::Method;
use url::Url;

use crate::error::NetworkError;

/// How 3xx responses are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RedirectPolicy {
    /// Follow redirects the way browsers do: 301, 302 and 303 turn the
    /// request into a `GET` without a body.
    #[default]
    Transparent,
    /// Follow redirects with RFC 2616 semantics: only 303 changes the method;
    /// 301 and 302 repeat the original method and body.
    Rfc2616,
    /// Never follow. A 3xx response is the final response.
    Disabled,
}

impl RedirectPolicy {
    /// Whether redirects are followed at all.
    pub fn follows(self) -> bool {
        self != RedirectPolicy::Disabled
    }
}

/// Whether `status` is a redirect that some policy follows.
pub(crate) fn is_followable(status: u16) -> bool {
    matches!(status, 301 | 302 | 303 | 307 | 308)
}

/// What to do with a redirect response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum RedirectAction {
    /// Deliver the redirect response itself.
    Stop,
    /// Issue a new request.
    Follow {
        method: Method,
        url: Url,
        keep_body: bool,
    },
}

/// Decide the next request after a `status` response pointing at `location`.
pub(crate) fn next_hop(
    policy: RedirectPolicy,
    status: u16,
    method: &Method,
    current: &Url,
    location: &str,
) -> Result<RedirectAction, NetworkError> {
    if !policy.follows() {
        return Ok(RedirectAction::Stop);
    }

    let (method, keep_body) = match status {
        303 => (Method::GET, false),
        301 | 302 if policy == RedirectPolicy::Transparent => (Method::GET, false),
        301 | 302 | 307 | 308 => (method.clone(), true),
        _ => return Ok(RedirectAction::Stop),
    };

    let url = current
        .join(location)
        .map_err(|e| NetworkError::Request(format!("invalid redirect location {location:?}: {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(NetworkError::Request(format!(
            "refusing to redirect to {}",
            url.scheme()
        )));
    }

    Ok(RedirectAction::Follow {
        method,
        url,
        keep_body,
    })
}
