//! The transport leaf.
//!
//! [`HttpTransport`] is a cheap handle: cloning it copies the tuning fields and
//! shares the underlying [`RoundTripper`]. The dispatcher hands every pipeline
//! its own clone, so middlewares may change `timeout`, `redirect` or even the
//! round tripper for one request only.
//!
//! Per round trip the handle wraps its round tripper in a tower stack
//! (outer to inner):
//!
//! ```text
//! Timeout → RequestDefaults → Decompression → FollowRedirect → RoundTripper
//! ```

use crate::body::RequestBody;
use crate::builder::TransportBuilder;
use crate::config::{DEFAULT_TIMEOUT, DEFAULT_USER_AGENT, RedirectConfig};
use crate::error::{BoxError, HttpError};
use crate::handler::{Handler, HandlerResult, handler_fn};
use crate::layers::{RedirectPolicy, RequestDefaultsLayer};
use crate::outgoing::OutgoingRequest;
use crate::response::ResponseBody;
use futures_util::future::BoxFuture;
use http::{HeaderValue, Request, Response};
use http_body_util::BodyExt;
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tower::timeout::TimeoutLayer;
use tower::{Service, ServiceBuilder, ServiceExt};
use tower_http::decompression::{DecompressionBody, DecompressionLayer};
use tower_http::follow_redirect::FollowRedirectLayer;

/// Performs one HTTP exchange on the wire.
pub trait RoundTripper: Send + Sync + 'static {
    fn round_trip(&self, req: Request<RequestBody>) -> BoxFuture<'static, HandlerResult>;
}

/// Round tripper backed by a pooled hyper client over rustls.
#[derive(Clone)]
pub struct HyperRoundTripper {
    client: Client<HttpsConnector<HttpConnector>, RequestBody>,
}

impl HyperRoundTripper {
    pub(crate) fn new(client: Client<HttpsConnector<HttpConnector>, RequestBody>) -> Self {
        Self { client }
    }
}

impl RoundTripper for HyperRoundTripper {
    fn round_trip(&self, req: Request<RequestBody>) -> BoxFuture<'static, HandlerResult> {
        let pending = self.client.request(req);
        Box::pin(async move {
            let resp = pending.await?;
            Ok(resp.map(|body| body.map_err(Into::into).boxed()))
        })
    }
}

impl fmt::Debug for HyperRoundTripper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HyperRoundTripper").finish_non_exhaustive()
    }
}

struct FnRoundTripper<F>(F);

impl<F, Fut> RoundTripper for FnRoundTripper<F>
where
    F: Fn(Request<RequestBody>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn round_trip(&self, req: Request<RequestBody>) -> BoxFuture<'static, HandlerResult> {
        Box::pin((self.0)(req))
    }
}

/// Round tripper from an async closure; handy for stubbing the network.
pub fn round_tripper_fn<F, Fut>(f: F) -> Arc<dyn RoundTripper>
where
    F: Fn(Request<RequestBody>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(FnRoundTripper(f))
}

/// Adapts a shared round tripper to a tower service.
#[derive(Clone)]
struct RoundTripService(Arc<dyn RoundTripper>);

impl Service<Request<RequestBody>> for RoundTripService {
    type Response = Response<ResponseBody>;
    type Error = HttpError;
    type Future = BoxFuture<'static, HandlerResult>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<RequestBody>) -> Self::Future {
        self.0.round_trip(req)
    }
}

/// Transport handle seen by every handler.
#[derive(Clone)]
pub struct HttpTransport {
    /// Wire-level exchange
    pub round_tripper: Arc<dyn RoundTripper>,
    /// Timeout of one round trip, redirects included; `None` waits forever
    pub timeout: Option<Duration>,
    /// Redirect following rules
    pub redirect: RedirectConfig,
    /// `User-Agent` applied when the request has none
    pub user_agent: Option<HeaderValue>,
    /// Advertise and undo gzip/br/deflate content encodings
    pub decompress: bool,
}

impl HttpTransport {
    /// Hyper-backed transport with default settings (30 second timeout).
    ///
    /// # Errors
    /// Returns `HttpError::Tls` if the TLS stack cannot be initialised.
    pub fn new() -> Result<Self, HttpError> {
        TransportBuilder::new().build()
    }

    #[must_use]
    pub fn builder() -> TransportBuilder {
        TransportBuilder::new()
    }

    /// Default-configured handle around a custom round tripper.
    #[must_use]
    pub fn from_round_tripper(round_tripper: Arc<dyn RoundTripper>) -> Self {
        Self {
            round_tripper,
            timeout: Some(DEFAULT_TIMEOUT),
            redirect: RedirectConfig::default(),
            user_agent: Some(HeaderValue::from_static(DEFAULT_USER_AGENT)),
            decompress: true,
        }
    }

    #[cfg(test)]
    pub(crate) fn unreachable() -> Self {
        Self::from_round_tripper(round_tripper_fn(|_| async {
            Err(HttpError::transport("no network in unit tests"))
        }))
    }

    /// Send `req`, honouring the request context's cancellation.
    ///
    /// # Errors
    /// `HttpError::Cancelled` when the context is cancelled first,
    /// `HttpError::Timeout` when the round trip outlives `timeout`, otherwise
    /// whatever the round tripper reports.
    pub async fn round_trip(&self, req: OutgoingRequest) -> HandlerResult {
        let ctx = req.context.clone();
        if ctx.is_cancelled() {
            return Err(HttpError::Cancelled);
        }

        let method = req.method.clone();
        let url = req.url.to_string();
        let started = Instant::now();
        tracing::trace!(%method, %url, "round trip started");

        let http_req = req.into_http()?;
        let result = tokio::select! {
            biased;
            () = ctx.cancelled() => Err(HttpError::Cancelled),
            result = self.exchange(http_req) => result,
        };

        match &result {
            Ok(resp) => tracing::trace!(
                %method,
                %url,
                status = resp.status().as_u16(),
                elapsed_ms = started.elapsed().as_millis(),
                "round trip finished"
            ),
            Err(err) => tracing::trace!(%method, %url, error = %err, "round trip failed"),
        }
        result
    }

    async fn exchange(&self, req: Request<RequestBody>) -> HandlerResult {
        let decompress = self.decompress;
        let service = ServiceBuilder::new()
            .layer(RequestDefaultsLayer::new(self.user_agent.clone()))
            .layer(
                DecompressionLayer::new()
                    .gzip(decompress)
                    .br(decompress)
                    .deflate(decompress),
            )
            .layer(FollowRedirectLayer::with_policy(RedirectPolicy::new(
                self.redirect.clone(),
            )))
            .service(RoundTripService(Arc::clone(&self.round_tripper)))
            .map_response(map_decompression_response);

        match self.timeout {
            Some(timeout) => ServiceBuilder::new()
                .layer(TimeoutLayer::new(timeout))
                .service(service)
                .oneshot(req)
                .await
                .map_err(|e| map_tower_error(e, timeout)),
            None => service.oneshot(req).await,
        }
    }
}

impl fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpTransport")
            .field("timeout", &self.timeout)
            .field("redirect", &self.redirect)
            .field("user_agent", &self.user_agent)
            .field("decompress", &self.decompress)
            .finish_non_exhaustive()
    }
}

/// The innermost handler of every pipeline.
#[must_use]
pub fn round_trip_handler() -> Handler {
    handler_fn(|transport: HttpTransport, req| async move { transport.round_trip(req).await })
}

fn map_tower_error(err: BoxError, timeout: Duration) -> HttpError {
    if err.is::<tower::timeout::error::Elapsed>() {
        return HttpError::Timeout(timeout);
    }
    HttpError::from_boxed(err)
}

fn map_decompression_response(
    response: Response<DecompressionBody<ResponseBody>>,
) -> Response<ResponseBody> {
    response.map(|body| body.map_err(Into::into).boxed())
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::context::RequestContext;
    use crate::outgoing::parse_url;
    use bytes::Bytes;
    use http::{Method, StatusCode, header};
    use http_body_util::Full;
    use parking_lot::Mutex;

    fn reply(status: u16, location: Option<&str>) -> HandlerResult {
        let mut builder = Response::builder().status(status);
        if let Some(location) = location {
            builder = builder.header(header::LOCATION, location);
        }
        Ok(builder
            .body(Full::new(Bytes::from_static(b"done")).map_err(Into::into).boxed())
            .unwrap())
    }

    fn get(url: &str) -> OutgoingRequest {
        OutgoingRequest::new(Method::GET, parse_url(url).unwrap(), RequestContext::background())
    }

    #[tokio::test]
    async fn test_timeout_is_reported() {
        let mut transport = HttpTransport::from_round_tripper(round_tripper_fn(|_| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            reply(200, None)
        }));
        transport.timeout = Some(Duration::from_millis(20));

        let err = transport.round_trip(get("http://svc/")).await.unwrap_err();
        assert!(matches!(err, HttpError::Timeout(d) if d == Duration::from_millis(20)));
    }

    #[tokio::test]
    async fn test_cancellation_wins_over_slow_round_trip() {
        let transport = HttpTransport::from_round_tripper(round_tripper_fn(|_| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            reply(200, None)
        }));
        let ctx = RequestContext::background();
        let req = OutgoingRequest::new(Method::GET, parse_url("http://svc/").unwrap(), ctx.clone());

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            ctx.cancel();
        });
        let err = transport.round_trip(req).await.unwrap_err();
        canceller.await.unwrap();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_round_tripper_sees_default_headers() {
        let seen = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&seen);
        let transport = HttpTransport::from_round_tripper(round_tripper_fn(move |req| {
            *sink.lock() = Some(req.headers().clone());
            async { reply(200, None) }
        }));

        transport.round_trip(get("http://svc/")).await.unwrap();

        let headers = seen.lock().take().unwrap();
        assert_eq!(headers[header::USER_AGENT], DEFAULT_USER_AGENT);
        assert!(headers[header::ACCEPT_ENCODING].to_str().unwrap().contains("gzip"));
    }

    #[tokio::test]
    async fn test_same_origin_redirect_followed() {
        let transport = HttpTransport::from_round_tripper(round_tripper_fn(|req| async move {
            if req.uri().path() == "/old" {
                reply(302, Some("/new"))
            } else {
                reply(200, None)
            }
        }));

        let resp = transport.round_trip(get("http://svc/old")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_cross_origin_redirect_blocked_by_default() {
        let transport = HttpTransport::from_round_tripper(round_tripper_fn(|_| async {
            reply(302, Some("http://elsewhere/"))
        }));

        let resp = transport.round_trip(get("http://svc/")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::FOUND);
    }

    #[tokio::test]
    async fn test_pre_cancelled_context_never_reaches_round_tripper() {
        let transport = HttpTransport::unreachable();
        let ctx = RequestContext::background();
        ctx.cancel();
        let req = OutgoingRequest::new(Method::GET, parse_url("http://svc/").unwrap(), ctx);

        assert!(matches!(
            transport.round_trip(req).await,
            Err(HttpError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn test_leaf_handler_decodes_gzip_body() {
        use flate2::Compression;
        use flate2::write::GzEncoder;
        use std::io::Write;

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"compressed payload").unwrap();
        let encoded = Bytes::from(encoder.finish().unwrap());

        let transport = HttpTransport::from_round_tripper(round_tripper_fn(move |_| {
            let encoded = encoded.clone();
            async move {
                Ok(Response::builder()
                    .header(header::CONTENT_ENCODING, "gzip")
                    .body(Full::new(encoded).map_err(Into::into).boxed())
                    .unwrap())
            }
        }));

        let resp = round_trip_handler()(transport, get("http://svc/")).await.unwrap();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body.as_ref(), b"compressed payload");
    }
}
