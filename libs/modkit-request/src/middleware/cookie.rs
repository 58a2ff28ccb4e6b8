use crate::context::{ContextKey, OptionMutator, get_options};
use crate::handler::{Middleware, map_request};
use cookie::Cookie;
use http::header::COOKIE;
use std::sync::Arc;

/// Cookies carried on the request context.
pub static COOKIE_OPTIONS: ContextKey<Vec<Cookie<'static>>> =
    ContextKey::new("modkit_request.cookies");

/// Append `cookies` to the request's `Cookie` header.
pub fn add_cookies(cookies: impl IntoIterator<Item = Cookie<'static>>) -> Middleware {
    let cookies: Arc<[Cookie<'static>]> = cookies.into_iter().collect();
    map_request(move |req| cookies.iter().try_for_each(|c| req.add_cookie(c)))
}

/// Drop every cookie from the request.
#[must_use]
pub fn delete_all_cookies() -> Middleware {
    map_request(|req| {
        req.headers.remove(COOKIE);
        Ok(())
    })
}

/// Option adding `cookie` when the cookie options are applied.
pub fn cookie_option(cookie: Cookie<'static>) -> OptionMutator<Vec<Cookie<'static>>> {
    Arc::new(move |cookies: &mut Vec<Cookie<'static>>| cookies.push(cookie.clone()))
}

/// Apply [`COOKIE_OPTIONS`] from the request context.
///
/// The `Cookie` header is rebuilt: request cookies first, then option cookies;
/// an option cookie replaces a request cookie of the same name.
#[must_use]
pub fn prepare_cookie_middleware() -> Middleware {
    map_request(|req| {
        let Some(options) = get_options(&COOKIE_OPTIONS, req, Vec::new) else {
            return Ok(());
        };
        let mut merged = req.cookies();
        merged.retain(|existing| options.iter().all(|c| c.name() != existing.name()));
        merged.extend(options);

        req.headers.remove(COOKIE);
        merged.iter().try_for_each(|c| req.add_cookie(c))
    })
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::context::{RequestContext, with_options};
    use crate::error::HttpError;
    use crate::handler::{HandlerResult, compose, handler_fn};
    use crate::outgoing::{OutgoingRequest, parse_url};
    use crate::transport::HttpTransport;
    use bytes::Bytes;
    use http::{HeaderValue, Method};
    use http_body_util::{BodyExt, Full};
    use parking_lot::Mutex;

    fn ok() -> HandlerResult {
        Ok(http::Response::new(
            Full::new(Bytes::new()).map_err(Into::into).boxed(),
        ))
    }

    async fn cookie_header(
        middlewares: Vec<Middleware>,
        ctx: RequestContext,
    ) -> Result<Option<String>, HttpError> {
        let seen: Arc<Mutex<Option<String>>> = Arc::default();
        let sink = Arc::clone(&seen);
        let capture = handler_fn(move |_, req: OutgoingRequest| {
            *sink.lock() = req
                .headers
                .get(COOKIE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_owned);
            async { ok() }
        });
        let mut req = OutgoingRequest::new(Method::GET, parse_url("http://svc/").unwrap(), ctx);
        req.headers
            .insert(COOKIE, HeaderValue::from_static("session=old; theme=dark"));

        compose(middlewares)(capture)(HttpTransport::unreachable(), req).await?;
        let header = seen.lock().clone();
        Ok(header)
    }

    #[tokio::test]
    async fn test_add_and_delete() {
        let header = cookie_header(
            vec![add_cookies([Cookie::new("lang", "en")])],
            RequestContext::background(),
        )
        .await
        .unwrap();
        assert_eq!(header.as_deref(), Some("session=old; theme=dark; lang=en"));

        let header = cookie_header(
            vec![delete_all_cookies(), add_cookies([Cookie::new("only", "1")])],
            RequestContext::background(),
        )
        .await
        .unwrap();
        assert_eq!(header.as_deref(), Some("only=1"));
    }

    #[tokio::test]
    async fn test_context_cookies_override_by_name() {
        let ctx = with_options(
            &COOKIE_OPTIONS,
            None,
            [cookie_option(Cookie::new("session", "new"))],
        );
        let header = cookie_header(vec![prepare_cookie_middleware()], ctx)
            .await
            .unwrap();
        assert_eq!(header.as_deref(), Some("theme=dark; session=new"));
    }
}
