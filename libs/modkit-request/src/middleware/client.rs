use crate::config::RedirectConfig;
use crate::context::{ContextKey, OptionMutator, get_options};
use crate::handler::{Middleware, from_fn};
use crate::transport::{HttpTransport, RoundTripper};
use std::sync::Arc;
use std::time::Duration;

/// Mutation of the per-request transport handle.
pub type ClientFn = OptionMutator<HttpTransport>;

/// Client tuning carried on the request context.
///
/// The materialized value starts from the transport handle the pipeline is
/// running with.
pub static CLIENT_OPTIONS: ContextKey<HttpTransport> = ContextKey::new("modkit_request.client");

/// Wrap a closure as a [`ClientFn`].
pub fn client_fn<F>(f: F) -> ClientFn
where
    F: Fn(&mut HttpTransport) + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Apply `funcs` to this request's transport handle.
///
/// The dispatcher hands each send its own copy of the handle, so changes
/// never reach the shared transport or other requests.
pub fn client_funcs(funcs: impl IntoIterator<Item = ClientFn>) -> Middleware {
    let funcs: Arc<[ClientFn]> = funcs.into_iter().collect();
    from_fn(move |mut transport, req, next| {
        for f in funcs.iter() {
            f(&mut transport);
        }
        next(transport, req)
    })
}

/// Round-trip timeout for this request.
#[must_use]
pub fn timeout(timeout: Duration) -> ClientFn {
    client_fn(move |t| t.timeout = Some(timeout))
}

/// Wait for the response without a deadline.
#[must_use]
pub fn no_timeout() -> ClientFn {
    client_fn(|t| t.timeout = None)
}

/// Redirect rules for this request.
#[must_use]
pub fn redirect(config: RedirectConfig) -> ClientFn {
    client_fn(move |t| t.redirect = config.clone())
}

/// Return 3xx responses as they are.
#[must_use]
pub fn no_redirects() -> ClientFn {
    redirect(RedirectConfig::disabled())
}

/// Send this request through `round_tripper` instead.
pub fn round_tripper(round_tripper: Arc<dyn RoundTripper>) -> ClientFn {
    client_fn(move |t| t.round_tripper = Arc::clone(&round_tripper))
}

/// Apply [`CLIENT_OPTIONS`] from the request context.
#[must_use]
pub fn prepare_client_middleware() -> Middleware {
    from_fn(|transport: HttpTransport, req, next| {
        let tuned = get_options(&CLIENT_OPTIONS, &req, || transport.clone()).unwrap_or(transport);
        next(tuned, req)
    })
}
