//! Debug dump of request/response exchanges.
//!
//! [`dump`] emits one `tracing` event per exchange under the
//! `modkit_request::dump` target, after the inner handler returns. Filters
//! decide which exchanges are dumped: an exchange is dumped only when every
//! filter accepts it.
//!
//! ```ignore
//! let resp = dispatcher
//!     .new_request()
//!     .dump([ignore_path_prefix("/health"), ignore_status(StatusCode::NOT_MODIFIED)])
//!     .get("http://svc/items")
//!     .await;
//! ```

use crate::handler::{Middleware, from_fn};
use http::{Method, StatusCode};
use regex::Regex;
use std::sync::Arc;
use std::time::Instant;

/// Target of the dump events.
pub const DUMP_TARGET: &str = "modkit_request::dump";

/// What a filter sees of one exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpInfo {
    pub method: Method,
    /// `None` when no response was received
    pub status: Option<StatusCode>,
    pub path: String,
    pub host: String,
}

/// Returns whether the exchange should be dumped.
pub type DumpFilter = Arc<dyn Fn(&DumpInfo) -> bool + Send + Sync>;

/// Log every exchange accepted by all `filters`.
pub fn dump(filters: impl IntoIterator<Item = DumpFilter>) -> Middleware {
    let filters: Arc<[DumpFilter]> = filters.into_iter().collect();
    from_fn(move |transport, req, next| {
        let filters = Arc::clone(&filters);
        let method = req.method.clone();
        let url = req.url.to_string();
        let path = req.url.path().to_owned();
        let host = req.host().to_owned();
        let request_headers = req.headers.clone();
        async move {
            let started = Instant::now();
            let result = next(transport, req).await;
            let info = DumpInfo {
                method,
                status: result.as_ref().ok().map(http::Response::status),
                path,
                host,
            };
            if filters.iter().all(|accept| accept(&info)) {
                let elapsed_ms = started.elapsed().as_millis();
                match &result {
                    Ok(resp) => tracing::debug!(
                        target: DUMP_TARGET,
                        method = %info.method,
                        %url,
                        status = resp.status().as_u16(),
                        elapsed_ms,
                        request_headers = ?request_headers,
                        response_headers = ?resp.headers(),
                        "http exchange"
                    ),
                    Err(err) => tracing::debug!(
                        target: DUMP_TARGET,
                        method = %info.method,
                        %url,
                        elapsed_ms,
                        request_headers = ?request_headers,
                        error = %err,
                        "http exchange failed"
                    ),
                }
            }
            result
        }
    })
}

fn filter(f: impl Fn(&DumpInfo) -> bool + Send + Sync + 'static) -> DumpFilter {
    Arc::new(f)
}

/// Dump only requests with `method`.
#[must_use]
pub fn accept_method(method: Method) -> DumpFilter {
    filter(move |info| info.method == method)
}

/// Skip requests with `method`.
#[must_use]
pub fn ignore_method(method: Method) -> DumpFilter {
    filter(move |info| info.method != method)
}

/// Dump only responses with `status`.
#[must_use]
pub fn accept_status(status: StatusCode) -> DumpFilter {
    filter(move |info| info.status == Some(status))
}

/// Skip responses with `status`.
#[must_use]
pub fn ignore_status(status: StatusCode) -> DumpFilter {
    filter(move |info| info.status != Some(status))
}

enum Pattern {
    Exact(String),
    Prefix(String),
    Suffix(String),
    Contains(String),
    Regex(Regex),
}

impl Pattern {
    fn matches(&self, value: &str) -> bool {
        match self {
            Pattern::Exact(p) => value == p,
            Pattern::Prefix(p) => value.starts_with(p.as_str()),
            Pattern::Suffix(p) => value.ends_with(p.as_str()),
            Pattern::Contains(p) => value.contains(p.as_str()),
            Pattern::Regex(re) => re.is_match(value),
        }
    }
}

#[derive(Clone, Copy)]
enum Part {
    Path,
    Host,
}

fn on(part: Part, pattern: Pattern, accept: bool) -> DumpFilter {
    filter(move |info| {
        let value = match part {
            Part::Path => info.path.as_str(),
            Part::Host => info.host.as_str(),
        };
        pattern.matches(value) == accept
    })
}

#[must_use]
pub fn accept_path(path: impl Into<String>) -> DumpFilter {
    on(Part::Path, Pattern::Exact(path.into()), true)
}

#[must_use]
pub fn ignore_path(path: impl Into<String>) -> DumpFilter {
    on(Part::Path, Pattern::Exact(path.into()), false)
}

#[must_use]
pub fn accept_path_prefix(prefix: impl Into<String>) -> DumpFilter {
    on(Part::Path, Pattern::Prefix(prefix.into()), true)
}

#[must_use]
pub fn ignore_path_prefix(prefix: impl Into<String>) -> DumpFilter {
    on(Part::Path, Pattern::Prefix(prefix.into()), false)
}

#[must_use]
pub fn accept_path_suffix(suffix: impl Into<String>) -> DumpFilter {
    on(Part::Path, Pattern::Suffix(suffix.into()), true)
}

#[must_use]
pub fn ignore_path_suffix(suffix: impl Into<String>) -> DumpFilter {
    on(Part::Path, Pattern::Suffix(suffix.into()), false)
}

#[must_use]
pub fn accept_path_contains(needle: impl Into<String>) -> DumpFilter {
    on(Part::Path, Pattern::Contains(needle.into()), true)
}

#[must_use]
pub fn ignore_path_contains(needle: impl Into<String>) -> DumpFilter {
    on(Part::Path, Pattern::Contains(needle.into()), false)
}

/// # Errors
/// Returns the regex compilation error.
pub fn accept_path_regex(pattern: &str) -> Result<DumpFilter, regex::Error> {
    Ok(on(Part::Path, Pattern::Regex(Regex::new(pattern)?), true))
}

/// # Errors
/// Returns the regex compilation error.
pub fn ignore_path_regex(pattern: &str) -> Result<DumpFilter, regex::Error> {
    Ok(on(Part::Path, Pattern::Regex(Regex::new(pattern)?), false))
}

#[must_use]
pub fn accept_host(host: impl Into<String>) -> DumpFilter {
    on(Part::Host, Pattern::Exact(host.into()), true)
}

#[must_use]
pub fn ignore_host(host: impl Into<String>) -> DumpFilter {
    on(Part::Host, Pattern::Exact(host.into()), false)
}

#[must_use]
pub fn accept_host_prefix(prefix: impl Into<String>) -> DumpFilter {
    on(Part::Host, Pattern::Prefix(prefix.into()), true)
}

#[must_use]
pub fn ignore_host_prefix(prefix: impl Into<String>) -> DumpFilter {
    on(Part::Host, Pattern::Prefix(prefix.into()), false)
}

#[must_use]
pub fn accept_host_suffix(suffix: impl Into<String>) -> DumpFilter {
    on(Part::Host, Pattern::Suffix(suffix.into()), true)
}

#[must_use]
pub fn ignore_host_suffix(suffix: impl Into<String>) -> DumpFilter {
    on(Part::Host, Pattern::Suffix(suffix.into()), false)
}

#[must_use]
pub fn accept_host_contains(needle: impl Into<String>) -> DumpFilter {
    on(Part::Host, Pattern::Contains(needle.into()), true)
}

#[must_use]
pub fn ignore_host_contains(needle: impl Into<String>) -> DumpFilter {
    on(Part::Host, Pattern::Contains(needle.into()), false)
}

/// # Errors
/// Returns the regex compilation error.
pub fn accept_host_regex(pattern: &str) -> Result<DumpFilter, regex::Error> {
    Ok(on(Part::Host, Pattern::Regex(Regex::new(pattern)?), true))
}

/// # Errors
/// Returns the regex compilation error.
pub fn ignore_host_regex(pattern: &str) -> Result<DumpFilter, regex::Error> {
    Ok(on(Part::Host, Pattern::Regex(Regex::new(pattern)?), false))
}
