//! Handler and middleware primitives.
//!
//! A [`Handler`] takes the per-request transport handle and the outgoing
//! request and eventually yields a response. A [`Middleware`] wraps a handler
//! into another handler. [`compose`] nests middlewares so the first one listed
//! is the outermost:
//!
//! ```text
//! compose([m1, m2, m3])(h)  ==  m1(m2(m3(h)))
//! trace: m1-before, m2-before, m3-before, h, m3-after, m2-after, m1-after
//! ```

use crate::error::HttpError;
use crate::outgoing::OutgoingRequest;
use crate::response::ResponseBody;
use crate::transport::HttpTransport;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Result of running a handler.
pub type HandlerResult = Result<http::Response<ResponseBody>, HttpError>;

/// Boxed future returned by handlers.
pub type HandlerFuture = Pin<Box<dyn Future<Output = HandlerResult> + Send>>;

/// An operation turning a request into a response.
pub type Handler = Arc<dyn Fn(HttpTransport, OutgoingRequest) -> HandlerFuture + Send + Sync>;

/// Wraps a handler, returning a new handler.
pub type Middleware = Arc<dyn Fn(Handler) -> Handler + Send + Sync>;

/// Synchronous request mutation used by [`request_funcs`].
pub type RequestFn = Arc<dyn Fn(&mut OutgoingRequest) -> Result<(), HttpError> + Send + Sync>;

/// Build a [`Handler`] from an async closure.
pub fn handler_fn<F, Fut>(f: F) -> Handler
where
    F: Fn(HttpTransport, OutgoingRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(move |transport: HttpTransport, req: OutgoingRequest| {
        Box::pin(f(transport, req)) as HandlerFuture
    })
}

/// Build a [`Middleware`] from a closure that receives the inner handler.
///
/// The closure may run code before and after `next`, or return without
/// calling it at all.
///
/// ```ignore
/// let logging = from_fn(|transport, req, next| async move {
///     tracing::info!(url = %req.url, "sending");
///     let result = next(transport, req).await;
///     tracing::info!(ok = result.is_ok(), "done");
///     result
/// });
/// ```
pub fn from_fn<F, Fut>(f: F) -> Middleware
where
    F: Fn(HttpTransport, OutgoingRequest, Handler) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    let f = Arc::new(f);
    Arc::new(move |next: Handler| {
        let f = Arc::clone(&f);
        let wrapped: Handler = Arc::new(move |transport: HttpTransport, req: OutgoingRequest| {
            Box::pin(f(transport, req, Arc::clone(&next))) as HandlerFuture
        });
        wrapped
    })
}

/// Middleware that applies a synchronous mutation before calling `next`.
///
/// A mutation error short-circuits the chain.
pub fn map_request<F>(f: F) -> Middleware
where
    F: Fn(&mut OutgoingRequest) -> Result<(), HttpError> + Send + Sync + 'static,
{
    from_fn(move |transport, mut req, next| {
        let applied = f(&mut req);
        async move {
            applied?;
            next(transport, req).await
        }
    })
}

/// Middleware applying each function in order to the outgoing request.
pub fn request_funcs(funcs: impl IntoIterator<Item = RequestFn>) -> Middleware {
    let funcs: Arc<[RequestFn]> = funcs.into_iter().collect();
    map_request(move |req| funcs.iter().try_for_each(|f| f(req)))
}

/// Middleware that returns its handler unchanged.
#[must_use]
pub fn identity() -> Middleware {
    Arc::new(|next: Handler| next)
}

/// Nest `middlewares` so the first one is outermost.
pub fn compose(middlewares: impl IntoIterator<Item = Middleware>) -> Middleware {
    let middlewares: Arc<[Middleware]> = middlewares.into_iter().collect();
    Arc::new(move |handler: Handler| {
        middlewares
            .iter()
            .rev()
            .fold(handler, |inner, middleware| middleware(inner))
    })
}
