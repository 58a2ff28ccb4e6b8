use crate::body::{BodyFactory, OneShotBody};
use crate::context::RequestContext;
use crate::dispatcher::Shared;
use crate::error::HttpError;
use crate::handler::{HandlerResult, Middleware, RequestFn, request_funcs};
use crate::middleware::body::{self as body_mw, BodyOptions, BytesFactory};
use crate::middleware::client::{self as client_mw, ClientFn};
use crate::middleware::dump::{DumpFilter, dump};
use crate::middleware::multipart::{MultipartField, MultipartOptions, multipart};
use crate::middleware::{cookie as cookie_mw, header as header_mw, query as query_mw, url as url_mw};
use crate::outgoing::{OutgoingRequest, parse_url};
use crate::response::Response;
use cookie::Cookie;
use http::Method;
use http::header::{HeaderName, HeaderValue, USER_AGENT};
use serde::Serialize;
use std::time::Duration;

/// Per-request pipeline builder
///
/// Created by [`Dispatcher::new_request`](crate::Dispatcher::new_request).
/// Every helper appends one middleware; nothing runs until a `send*` method
/// is awaited, and each send composes a fresh pipeline from the dispatcher
/// middlewares followed by this builder's, so one builder can send many
/// times.
///
/// Middlewares run in the order they were added. Helpers that validate input
/// (header names and values, boundaries) report failures when the request is
/// sent.
///
/// # Example
///
/// ```ignore
/// let mut resp = dispatcher
///     .new_request()
///     .base_url("https://api.example.com")
///     .path_param("id", "42")
///     .bearer_auth(token)
///     .json(NewComment { text: "hi".into() })
///     .post("/users/{id}/comments")
///     .await;
///
/// let created: Option<Comment> = resp.json().await?;
/// resp.close().await?;
/// ```
#[derive(Clone)]
#[must_use = "RequestBuilder does nothing until a send method is awaited"]
pub struct RequestBuilder {
    dispatcher: Shared,
    middlewares: Vec<Middleware>,
}

impl RequestBuilder {
    pub(crate) fn new(dispatcher: Shared) -> Self {
        Self {
            dispatcher,
            middlewares: Vec::new(),
        }
    }

    /// Append a middleware.
    pub fn use_middleware(mut self, middleware: Middleware) -> Self {
        self.middlewares.push(middleware);
        self
    }

    /// Append several middlewares, in order.
    pub fn use_middlewares(mut self, middlewares: impl IntoIterator<Item = Middleware>) -> Self {
        self.middlewares.extend(middlewares);
        self
    }

    /// Append plain request mutations.
    pub fn use_funcs(self, funcs: impl IntoIterator<Item = RequestFn>) -> Self {
        self.use_middleware(request_funcs(funcs))
    }

    /// Number of request-level middlewares.
    #[must_use]
    pub fn middleware_count(&self) -> usize {
        self.middlewares.len()
    }

    // Headers

    /// Replace every value of `name`.
    pub fn header<N, V>(self, name: N, value: V) -> Self
    where
        N: TryInto<HeaderName>,
        N::Error: Into<HttpError>,
        V: TryInto<HeaderValue>,
        V::Error: Into<HttpError>,
    {
        self.use_middleware(header_mw::set_header(name, value))
    }

    /// Append a value to `name`.
    pub fn add_header<N, V>(self, name: N, value: V) -> Self
    where
        N: TryInto<HeaderName>,
        N::Error: Into<HttpError>,
        V: TryInto<HeaderValue>,
        V::Error: Into<HttpError>,
    {
        self.use_middleware(header_mw::add_header(name, value))
    }

    /// Set several headers, each replacing earlier values of its name.
    pub fn headers<I, N, V>(self, headers: I) -> Self
    where
        I: IntoIterator<Item = (N, V)>,
        N: TryInto<HeaderName>,
        N::Error: Into<HttpError>,
        V: TryInto<HeaderValue>,
        V::Error: Into<HttpError>,
    {
        let setters: Vec<Middleware> = headers
            .into_iter()
            .map(|(name, value)| header_mw::set_header(name, value))
            .collect();
        self.use_middlewares(setters)
    }

    pub fn remove_header<N>(self, name: N) -> Self
    where
        N: TryInto<HeaderName>,
        N::Error: Into<HttpError>,
    {
        self.use_middleware(header_mw::del_header(name))
    }

    pub fn user_agent<V>(self, value: V) -> Self
    where
        V: TryInto<HeaderValue>,
        V::Error: Into<HttpError>,
    {
        self.header(USER_AGENT, value)
    }

    pub fn bearer_auth(self, token: impl AsRef<str>) -> Self {
        self.use_middleware(header_mw::bearer_auth(token))
    }

    pub fn basic_auth(self, user: impl AsRef<str>, password: Option<&str>) -> Self {
        self.use_middleware(header_mw::basic_auth(user, password))
    }

    // Query, cookies, URL

    /// Replace the query values of `key`.
    pub fn query(self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.use_middleware(query_mw::query_funcs([query_mw::set_query(key, value)]))
    }

    /// Append query pairs; repeated keys keep every value.
    pub fn queries<K, V>(self, pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        let adds: Vec<query_mw::QueryFn> = pairs
            .into_iter()
            .map(|(k, v)| query_mw::add_query(k, v))
            .collect();
        self.use_middleware(query_mw::query_funcs(adds))
    }

    pub fn cookie(self, cookie: Cookie<'static>) -> Self {
        self.use_middleware(cookie_mw::add_cookies([cookie]))
    }

    pub fn cookies(self, cookies: impl IntoIterator<Item = Cookie<'static>>) -> Self {
        self.use_middleware(cookie_mw::add_cookies(cookies))
    }

    /// Drop every cookie added so far.
    pub fn delete_cookies(self) -> Self {
        self.use_middleware(cookie_mw::delete_all_cookies())
    }

    /// Take scheme, host and port from `base`, prefixing its path.
    pub fn base_url(self, base: impl Into<String>) -> Self {
        self.use_middleware(url_mw::url_funcs([url_mw::base_url(base)]))
    }

    /// Substitute `{name}` in the URL path.
    pub fn path_param(self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.use_middleware(url_mw::url_funcs([url_mw::path_param(name, value)]))
    }

    pub fn path_params<K, V>(self, params: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.use_middleware(url_mw::url_funcs([url_mw::path_params(params)]))
    }

    // Transport tuning

    pub fn timeout(self, timeout: Duration) -> Self {
        self.client_funcs([client_mw::timeout(timeout)])
    }

    pub fn no_redirects(self) -> Self {
        self.client_funcs([client_mw::no_redirects()])
    }

    /// Tune this request's copy of the transport handle.
    pub fn client_funcs(self, funcs: impl IntoIterator<Item = ClientFn>) -> Self {
        self.use_middleware(client_mw::client_funcs(funcs))
    }

    // Bodies

    /// One-shot body; only the first send carries it.
    pub fn body(self, reader: impl Into<OneShotBody>, opts: BodyOptions) -> Self {
        self.use_middleware(body_mw::body(Some(reader.into()), opts))
    }

    /// Replayable body read from `factory` on every attempt.
    pub fn body_get(self, factory: BodyFactory, opts: BodyOptions) -> Self {
        self.use_middleware(body_mw::body_get(Some(factory), opts))
    }

    /// Body materialized by `factory` once per send.
    pub fn body_bytes(self, factory: BytesFactory, opts: BodyOptions) -> Self {
        self.use_middleware(body_mw::body_get_bytes(factory, opts))
    }

    pub fn json<T>(self, value: T) -> Self
    where
        T: Serialize + Send + Sync + 'static,
    {
        self.use_middleware(body_mw::json(value))
    }

    /// Already-encoded JSON.
    pub fn json_raw(self, payload: impl Into<bytes::Bytes>) -> Self {
        self.use_middleware(body_mw::json_raw(payload))
    }

    pub fn xml<T>(self, value: T) -> Self
    where
        T: Serialize + Send + Sync + 'static,
    {
        self.use_middleware(body_mw::xml(value))
    }

    pub fn form<T>(self, value: T) -> Self
    where
        T: Serialize + Send + Sync + 'static,
    {
        self.use_middleware(body_mw::form(value))
    }

    pub fn multipart(self, fields: impl IntoIterator<Item = MultipartField>, opts: MultipartOptions) -> Self {
        self.use_middleware(multipart(fields, opts))
    }

    /// Log the exchange when every filter accepts it.
    pub fn dump(self, filters: impl IntoIterator<Item = DumpFilter>) -> Self {
        self.use_middleware(dump(filters))
    }

    // Sending

    /// Run a caller-built request through the pipeline.
    ///
    /// # Errors
    /// Returns whatever the pipeline returns.
    pub async fn execute(&self, req: OutgoingRequest) -> HandlerResult {
        self.dispatcher
            .dispatch(req, self.middlewares.iter().cloned())
            .await
    }

    /// Send with a background context.
    pub async fn send(&self, method: Method, url: &str) -> Response {
        self.send_ctx(None, method, url).await
    }

    /// Send with `ctx` (a background context when `None`).
    ///
    /// A URL that does not parse yields an error response without running any
    /// middleware.
    pub async fn send_ctx(&self, ctx: Option<RequestContext>, method: Method, url: &str) -> Response {
        let url = match parse_url(url) {
            Ok(url) => url,
            Err(err) => {
                tracing::trace!(%method, error = %err, "request rejected before dispatch");
                return Response::from_error(err);
            }
        };
        let req = OutgoingRequest::new(method, url, ctx.unwrap_or_default());
        Response::from_result(self.execute(req).await)
    }

    pub async fn get(&self, url: &str) -> Response {
        self.send(Method::GET, url).await
    }

    pub async fn head(&self, url: &str) -> Response {
        self.send(Method::HEAD, url).await
    }

    pub async fn post(&self, url: &str) -> Response {
        self.send(Method::POST, url).await
    }

    pub async fn put(&self, url: &str) -> Response {
        self.send(Method::PUT, url).await
    }

    pub async fn patch(&self, url: &str) -> Response {
        self.send(Method::PATCH, url).await
    }

    pub async fn delete(&self, url: &str) -> Response {
        self.send(Method::DELETE, url).await
    }

    pub async fn options(&self, url: &str) -> Response {
        self.send(Method::OPTIONS, url).await
    }

    pub async fn trace(&self, url: &str) -> Response {
        self.send(Method::TRACE, url).await
    }

    pub async fn get_ctx(&self, ctx: Option<RequestContext>, url: &str) -> Response {
        self.send_ctx(ctx, Method::GET, url).await
    }

    pub async fn head_ctx(&self, ctx: Option<RequestContext>, url: &str) -> Response {
        self.send_ctx(ctx, Method::HEAD, url).await
    }

    pub async fn post_ctx(&self, ctx: Option<RequestContext>, url: &str) -> Response {
        self.send_ctx(ctx, Method::POST, url).await
    }

    pub async fn put_ctx(&self, ctx: Option<RequestContext>, url: &str) -> Response {
        self.send_ctx(ctx, Method::PUT, url).await
    }

    pub async fn patch_ctx(&self, ctx: Option<RequestContext>, url: &str) -> Response {
        self.send_ctx(ctx, Method::PATCH, url).await
    }

    pub async fn delete_ctx(&self, ctx: Option<RequestContext>, url: &str) -> Response {
        self.send_ctx(ctx, Method::DELETE, url).await
    }

    pub async fn options_ctx(&self, ctx: Option<RequestContext>, url: &str) -> Response {
        self.send_ctx(ctx, Method::OPTIONS, url).await
    }

    pub async fn trace_ctx(&self, ctx: Option<RequestContext>, url: &str) -> Response {
        self.send_ctx(ctx, Method::TRACE, url).await
    }
}

impl std::fmt::Debug for RequestBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestBuilder")
            .field("middlewares", &self.middlewares.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::dispatcher::Dispatcher;
    use crate::handler::from_fn;
    use crate::transport::{HttpTransport, round_tripper_fn};
    use bytes::Bytes;
    use http::HeaderMap;
    use http_body_util::{BodyExt, Full};
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[derive(Default, Clone)]
    struct Seen {
        method: Option<Method>,
        uri: String,
        headers: HeaderMap,
    }

    fn capturing_dispatcher() -> (Dispatcher, Arc<Mutex<Seen>>) {
        let seen: Arc<Mutex<Seen>> = Arc::default();
        let sink = Arc::clone(&seen);
        let transport = HttpTransport::from_round_tripper(round_tripper_fn(move |req| {
            *sink.lock() = Seen {
                method: Some(req.method().clone()),
                uri: req.uri().to_string(),
                headers: req.headers().clone(),
            };
            async {
                Ok(http::Response::new(
                    Full::new(Bytes::from_static(b"OK")).map_err(Into::into).boxed(),
                ))
            }
        }));
        (Dispatcher::with_transport(transport), seen)
    }

    fn counter(count: &Arc<Mutex<usize>>) -> Middleware {
        let count = Arc::clone(count);
        from_fn(move |transport, req, next| {
            *count.lock() += 1;
            next(transport, req)
        })
    }

    #[tokio::test]
    async fn test_invalid_url_never_enters_pipeline() {
        let (dispatcher, _) = capturing_dispatcher();
        let calls = Arc::new(Mutex::new(0));
        dispatcher.use_middleware(counter(&calls));
        let builder = dispatcher.new_request().use_middleware(counter(&calls));

        let mut resp = builder.get("ftp://files/report").await;
        assert!(matches!(resp.error(), Some(HttpError::InvalidRequest { .. })));
        assert_eq!(*calls.lock(), 0);
        assert!(resp.close().await.is_err());
        assert!(resp.close().await.is_err());
    }

    #[tokio::test]
    async fn test_repeated_sends_compose_fresh() {
        let (dispatcher, _) = capturing_dispatcher();
        let calls = Arc::new(Mutex::new(0));
        let builder = dispatcher.new_request().use_middleware(counter(&calls));

        for _ in 0..3 {
            let mut resp = builder.get("http://svc/ok").await;
            assert_eq!(resp.text().await, "OK");
        }
        assert_eq!(*calls.lock(), 3);
    }

    #[tokio::test]
    async fn test_clone_copies_middlewares_only() {
        let (dispatcher, _) = capturing_dispatcher();
        let base = dispatcher.new_request().header("x-a", "1");
        let forked = base.clone().header("x-b", "2");
        assert_eq!(base.middleware_count(), 1);
        assert_eq!(forked.middleware_count(), 2);
    }

    #[tokio::test]
    async fn test_helpers_shape_the_request() {
        let (dispatcher, seen) = capturing_dispatcher();
        let resp = dispatcher
            .new_request()
            .base_url("https://api.example.com/v1")
            .path_params([("user", "42"), ("post", "7")])
            .queries([("tag", "a"), ("tag", "b")])
            .query("page", "2")
            .header("X-Trace", "t-1")
            .add_header("accept", "text/plain")
            .add_header("accept", "application/json")
            .user_agent("tests/1.0")
            .cookie(Cookie::new("session", "s1"))
            .bearer_auth("secret")
            .patch("/users/{user}/posts/{post}")
            .await;
        assert!(resp.error().is_none());

        let seen = seen.lock().clone();
        assert_eq!(seen.method, Some(Method::PATCH));
        assert_eq!(
            seen.uri,
            "https://api.example.com/v1/users/42/posts/7?page=2&tag=a&tag=b"
        );
        assert_eq!(seen.headers["x-trace"], "t-1");
        assert_eq!(seen.headers.get_all("accept").iter().count(), 2);
        assert_eq!(seen.headers[USER_AGENT], "tests/1.0");
        assert_eq!(seen.headers["cookie"], "session=s1");
        assert_eq!(seen.headers["authorization"], "Bearer secret");
    }

    #[tokio::test]
    async fn test_method_shortcuts() {
        let (dispatcher, seen) = capturing_dispatcher();
        let builder = dispatcher.new_request();
        let ctx = RequestContext::background();

        builder.head("http://svc/").await;
        assert_eq!(seen.lock().method, Some(Method::HEAD));
        builder.delete_ctx(Some(ctx.clone()), "http://svc/").await;
        assert_eq!(seen.lock().method, Some(Method::DELETE));
        builder.options_ctx(None, "http://svc/").await;
        assert_eq!(seen.lock().method, Some(Method::OPTIONS));
        builder.trace_ctx(Some(ctx), "http://svc/").await;
        assert_eq!(seen.lock().method, Some(Method::TRACE));
    }

    #[tokio::test]
    async fn test_cancelled_context_surfaces_on_response() {
        let (dispatcher, seen) = capturing_dispatcher();
        let ctx = RequestContext::background();
        ctx.cancel();

        let mut resp = dispatcher.new_request().get_ctx(Some(ctx), "http://svc/").await;
        assert!(resp.error().is_some_and(HttpError::is_cancelled));
        assert!(seen.lock().method.is_none());
        assert_eq!(resp.text().await, "");
    }
}
