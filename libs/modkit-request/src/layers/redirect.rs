//! Redirect policy applied by the transport leaf.
//!
//! The policy is rebuilt for every round trip from the request's
//! [`RedirectConfig`], so per-request tuning through `client_funcs` takes
//! effect without touching the shared transport.
//!
//! Defaults:
//! - only same-origin hops (scheme, host and port) are followed
//! - `Authorization`, `Cookie` and `Proxy-Authorization` are dropped once the
//!   chain leaves the original origin
//! - HTTPS → HTTP hops are refused
//! - at most 10 hops

use crate::body::RequestBody;
use crate::config::RedirectConfig;
use http::{Request, Uri, header};
use tower_http::follow_redirect::policy::{Action, Attempt, Policy};

const SENSITIVE_HEADERS: &[header::HeaderName] = &[
    header::AUTHORIZATION,
    header::COOKIE,
    header::PROXY_AUTHORIZATION,
];

/// Outcome of evaluating one redirect hop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Follow { cross_origin: bool },
    TooMany,
    Downgrade,
    CrossOrigin,
}

/// Redirect policy honouring a [`RedirectConfig`].
#[derive(Debug, Clone)]
pub struct RedirectPolicy {
    config: RedirectConfig,
    hops: usize,
    left_origin: bool,
}

impl RedirectPolicy {
    #[must_use]
    pub fn new(config: RedirectConfig) -> Self {
        Self {
            config,
            hops: 0,
            left_origin: false,
        }
    }

    fn decide(&self, hops: usize, from: &Uri, to: &Uri) -> Verdict {
        if hops > self.config.max_redirects {
            return Verdict::TooMany;
        }
        if !self.config.allow_https_downgrade && is_downgrade(from, to) {
            return Verdict::Downgrade;
        }
        let same_origin = is_same_origin(from, to);
        let allowed = to
            .host()
            .is_some_and(|h| self.config.allowed_redirect_hosts.contains(h));
        if self.config.same_origin_only && !same_origin && !allowed {
            return Verdict::CrossOrigin;
        }
        Verdict::Follow {
            cross_origin: !same_origin,
        }
    }
}

// Scheme-less URIs count as https so comparisons fail closed.
fn scheme_of(uri: &Uri) -> &str {
    uri.scheme_str().unwrap_or("https")
}

fn port_of(uri: &Uri) -> u16 {
    uri.port_u16().unwrap_or(match scheme_of(uri) {
        "http" => 80,
        "https" => 443,
        _ => 0,
    })
}

fn is_same_origin(a: &Uri, b: &Uri) -> bool {
    scheme_of(a) == scheme_of(b) && a.host() == b.host() && port_of(a) == port_of(b)
}

fn is_downgrade(from: &Uri, to: &Uri) -> bool {
    scheme_of(from) == "https" && scheme_of(to) == "http"
}

impl<E> Policy<RequestBody, E> for RedirectPolicy {
    fn redirect(&mut self, attempt: &Attempt<'_>) -> Result<Action, E> {
        self.hops += 1;
        let (from, to) = (attempt.previous(), attempt.location());

        match self.decide(self.hops, from, to) {
            Verdict::Follow { cross_origin } => {
                if cross_origin {
                    self.left_origin = true;
                }
                tracing::trace!(%from, %to, hop = self.hops, "following redirect");
                Ok(Action::Follow)
            }
            Verdict::TooMany => {
                tracing::debug!(max = self.config.max_redirects, %to, "redirect limit reached");
                Ok(Action::Stop)
            }
            Verdict::Downgrade => {
                tracing::warn!(%from, %to, "blocked HTTPS to HTTP redirect");
                Ok(Action::Stop)
            }
            Verdict::CrossOrigin => {
                tracing::warn!(%from, %to, "blocked cross-origin redirect");
                Ok(Action::Stop)
            }
        }
    }

    fn on_request(&mut self, request: &mut Request<RequestBody>) {
        if !(self.left_origin && self.config.strip_sensitive_headers) {
            return;
        }
        let headers = request.headers_mut();
        for name in SENSITIVE_HEADERS {
            if headers.remove(name).is_some() {
                tracing::debug!(header = %name, "dropped credential header after leaving origin");
            }
        }
    }

    // One-shot bodies cannot be replayed; 307/308 hops then return the 3xx as-is.
    fn clone_body(&self, body: &RequestBody) -> Option<RequestBody> {
        body.try_clone()
    }
}
