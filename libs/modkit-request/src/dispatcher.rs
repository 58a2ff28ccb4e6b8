use crate::error::HttpError;
use crate::handler::{HandlerResult, Middleware, compose};
use crate::middleware::prepare_tail;
use crate::outgoing::OutgoingRequest;
use crate::request::RequestBuilder;
use crate::transport::{HttpTransport, round_trip_handler};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

struct State {
    transport: HttpTransport,
    middlewares: Vec<Middleware>,
}

/// State shared between a dispatcher and the request builders it produced.
#[derive(Clone)]
pub(crate) struct Shared(Arc<Mutex<State>>);

impl Shared {
    fn new(transport: HttpTransport, middlewares: Vec<Middleware>) -> Self {
        Self(Arc::new(Mutex::new(State {
            transport,
            middlewares,
        })))
    }

    pub(crate) async fn dispatch(
        &self,
        req: OutgoingRequest,
        extra: impl IntoIterator<Item = Middleware>,
    ) -> HandlerResult {
        let (transport, prefix) = {
            let state = self.0.lock();
            (state.transport.clone(), state.middlewares.clone())
        };
        let mut middlewares = prefix;
        let prefix_len = middlewares.len();
        middlewares.extend(extra);
        let request_len = middlewares.len() - prefix_len;
        middlewares.extend(prepare_tail());

        tracing::trace!(
            method = %req.method,
            url = %req.url,
            prefix_len,
            request_len,
            "dispatching request"
        );
        let handler = compose(middlewares)(round_trip_handler());
        handler(transport, req).await
    }
}

/// Owns the shared transport and the middlewares every request runs through.
///
/// All methods take `&self` and are safe to call from any thread; a send
/// snapshots the transport and middleware list under the lock, so later
/// changes only affect later sends.
///
/// `clone()` forks: the copy gets its own middleware list and its own
/// transport handle (sharing the connection pool), and changes made to one
/// side are not seen by the other. To share one dispatcher, wrap it in an
/// `Arc`; request builders keep referring to the dispatcher that made them.
///
/// ```ignore
/// let dispatcher = Dispatcher::new()?;
/// dispatcher.use_middleware(set_header("x-client", "billing"));
///
/// let mut resp = dispatcher.new_request().get("http://127.0.0.1:8080/ok").await;
/// assert_eq!(resp.text().await, "OK");
/// resp.close().await?;
/// ```
pub struct Dispatcher {
    shared: Shared,
}

impl Dispatcher {
    /// Dispatcher over a default transport (30 second timeout).
    ///
    /// # Errors
    /// Returns `HttpError::Tls` if the TLS stack cannot be initialised.
    pub fn new() -> Result<Self, HttpError> {
        Ok(Self::with_transport(HttpTransport::new()?))
    }

    #[must_use]
    pub fn with_transport(transport: HttpTransport) -> Self {
        Self {
            shared: Shared::new(transport, Vec::new()),
        }
    }

    /// Append `middleware` to the list every request runs through.
    pub fn use_middleware(&self, middleware: Middleware) {
        self.shared.0.lock().middlewares.push(middleware);
    }

    /// Append several middlewares, in order.
    pub fn use_middlewares(&self, middlewares: impl IntoIterator<Item = Middleware>) {
        self.shared.0.lock().middlewares.extend(middlewares);
    }

    /// Replace the transport; `None` leaves it unchanged.
    pub fn set_transport(&self, transport: Option<HttpTransport>) {
        if let Some(transport) = transport {
            self.shared.0.lock().transport = transport;
        }
    }

    /// Copy of the current transport handle.
    #[must_use]
    pub fn transport(&self) -> HttpTransport {
        self.shared.0.lock().transport.clone()
    }

    /// Number of dispatcher-level middlewares.
    #[must_use]
    pub fn middleware_count(&self) -> usize {
        self.shared.0.lock().middlewares.len()
    }

    /// Start a request bound to this dispatcher.
    #[must_use]
    pub fn new_request(&self) -> RequestBuilder {
        RequestBuilder::new(self.shared.clone())
    }

    /// Run `req` through the dispatcher middlewares, then `extra`, then the
    /// transport.
    ///
    /// The pipeline gets its own copy of the transport handle. Nothing is
    /// retried or reclassified here.
    ///
    /// # Errors
    /// Returns whatever the pipeline returns.
    pub async fn dispatch(
        &self,
        req: OutgoingRequest,
        extra: impl IntoIterator<Item = Middleware>,
    ) -> HandlerResult {
        self.shared.dispatch(req, extra).await
    }
}

impl Clone for Dispatcher {
    fn clone(&self) -> Self {
        let state = self.shared.0.lock();
        Self {
            shared: Shared::new(state.transport.clone(), state.middlewares.clone()),
        }
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.0.lock();
        f.debug_struct("Dispatcher")
            .field("transport", &state.transport)
            .field("middlewares", &state.middlewares.len())
            .finish()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::context::RequestContext;
    use crate::handler::from_fn;
    use crate::middleware::{client_funcs, set_header};
    use crate::outgoing::parse_url;
    use crate::transport::round_tripper_fn;
    use bytes::Bytes;
    use http::{HeaderMap, Method};
    use http_body_util::{BodyExt, Full};
    use std::time::Duration;

    type Trace = Arc<Mutex<Vec<String>>>;

    fn recording_transport(trace: &Trace) -> HttpTransport {
        let trace = Arc::clone(trace);
        HttpTransport::from_round_tripper(round_tripper_fn(move |_| {
            trace.lock().push("transport".to_owned());
            async {
                Ok(http::Response::new(
                    Full::new(Bytes::from_static(b"OK")).map_err(Into::into).boxed(),
                ))
            }
        }))
    }

    fn tag(trace: &Trace, name: &'static str) -> Middleware {
        let trace = Arc::clone(trace);
        from_fn(move |transport, req, next| {
            trace.lock().push(format!("{name}-before"));
            let trace = Arc::clone(&trace);
            async move {
                let result = next(transport, req).await;
                trace.lock().push(format!("{name}-after"));
                result
            }
        })
    }

    fn get(url: &str) -> OutgoingRequest {
        OutgoingRequest::new(Method::GET, parse_url(url).unwrap(), RequestContext::background())
    }

    #[tokio::test]
    async fn test_prefix_runs_before_extra() {
        let trace = Trace::default();
        let dispatcher = Dispatcher::with_transport(recording_transport(&trace));
        dispatcher.use_middleware(tag(&trace, "d1"));
        dispatcher.use_middlewares([tag(&trace, "d2")]);

        dispatcher
            .dispatch(get("http://svc/"), [tag(&trace, "r1")])
            .await
            .unwrap();

        assert_eq!(
            trace.lock().as_slice(),
            [
                "d1-before", "d2-before", "r1-before", "transport", "r1-after", "d2-after",
                "d1-after"
            ]
        );
    }

    #[tokio::test]
    async fn test_clone_forks_middlewares() {
        let trace = Trace::default();
        let original = Dispatcher::with_transport(recording_transport(&trace));
        original.use_middleware(tag(&trace, "shared"));

        let fork = original.clone();
        fork.use_middleware(tag(&trace, "fork-only"));
        assert_eq!(original.middleware_count(), 1);
        assert_eq!(fork.middleware_count(), 2);

        original.dispatch(get("http://svc/"), []).await.unwrap();
        assert!(!trace.lock().iter().any(|t| t.starts_with("fork-only")));
    }

    #[tokio::test]
    async fn test_set_transport_ignores_none() {
        let trace = Trace::default();
        let dispatcher = Dispatcher::with_transport(recording_transport(&trace));
        dispatcher.set_transport(None);
        dispatcher.dispatch(get("http://svc/"), []).await.unwrap();
        assert_eq!(trace.lock().as_slice(), ["transport"]);

        let mut replacement = recording_transport(&trace);
        replacement.timeout = Some(Duration::from_secs(7));
        dispatcher.set_transport(Some(replacement));
        assert_eq!(dispatcher.transport().timeout, Some(Duration::from_secs(7)));
    }

    #[tokio::test]
    async fn test_request_tuning_does_not_touch_shared_transport() {
        let trace = Trace::default();
        let dispatcher = Dispatcher::with_transport(recording_transport(&trace));
        let before = dispatcher.transport().timeout;

        dispatcher
            .dispatch(
                get("http://svc/"),
                [client_funcs([crate::middleware::client::timeout(Duration::from_millis(1))])],
            )
            .await
            .unwrap();
        assert_eq!(dispatcher.transport().timeout, before);
    }

    #[tokio::test]
    async fn test_builders_see_later_dispatcher_middlewares() {
        let seen: Arc<Mutex<HeaderMap>> = Arc::default();
        let sink = Arc::clone(&seen);
        let dispatcher = Dispatcher::with_transport(HttpTransport::from_round_tripper(
            round_tripper_fn(move |req| {
                *sink.lock() = req.headers().clone();
                async {
                    Ok(http::Response::new(
                        Full::new(Bytes::new()).map_err(Into::into).boxed(),
                    ))
                }
            }),
        ));
        let builder = dispatcher.new_request();
        dispatcher.use_middleware(set_header("x-added-later", "yes"));

        let resp = builder.get("http://svc/").await;
        assert!(resp.error().is_none());
        assert_eq!(seen.lock()["x-added-later"], "yes");
    }
}
