use crate::body::RequestBody;
use http::header::{CONTENT_LENGTH, USER_AGENT};
use http::{HeaderValue, Request};
use http_body::Body;
use std::task::{Context, Poll};
use tower::{Layer, Service};

/// Fills in headers the caller left unset: `User-Agent` from the transport
/// handle and `Content-Length` from the body's exact size.
#[derive(Clone, Debug, Default)]
pub struct RequestDefaultsLayer {
    user_agent: Option<HeaderValue>,
}

impl RequestDefaultsLayer {
    #[must_use]
    pub fn new(user_agent: Option<HeaderValue>) -> Self {
        Self { user_agent }
    }
}

impl<S> Layer<S> for RequestDefaultsLayer {
    type Service = RequestDefaults<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RequestDefaults {
            inner,
            user_agent: self.user_agent.clone(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct RequestDefaults<S> {
    inner: S,
    user_agent: Option<HeaderValue>,
}

impl<S> Service<Request<RequestBody>> for RequestDefaults<S>
where
    S: Service<Request<RequestBody>>,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = S::Future;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<RequestBody>) -> Self::Future {
        let exact = (!req.body().is_empty())
            .then(|| req.body().size_hint().exact())
            .flatten();
        let headers = req.headers_mut();
        if let Some(ua) = &self.user_agent
            && !headers.contains_key(USER_AGENT)
        {
            headers.insert(USER_AGENT, ua.clone());
        }
        if let Some(len) = exact
            && !headers.contains_key(CONTENT_LENGTH)
        {
            headers.insert(CONTENT_LENGTH, HeaderValue::from(len));
        }
        self.inner.call(req)
    }
}
