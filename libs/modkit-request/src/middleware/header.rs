use crate::context::{ContextKey, OptionMutator, get_options};
use crate::error::HttpError;
use crate::handler::{Middleware, map_request};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use http::header::{AUTHORIZATION, HeaderMap, HeaderName, HeaderValue};
use std::sync::Arc;

/// Header options carried on the request context.
///
/// Every name present in the materialized map replaces the request's values
/// for that name.
pub static HEADER_OPTIONS: ContextKey<HeaderMap> = ContextKey::new("modkit_request.headers");

/// Mutation of the outgoing header map.
pub type HeaderFn = Arc<dyn Fn(&mut HeaderMap) -> Result<(), HttpError> + Send + Sync>;

/// Validate a header name/value pair.
///
/// # Errors
/// Returns `HttpError::InvalidHeaderName` or `HttpError::InvalidHeaderValue`.
pub fn header_pair<N, V>(name: N, value: V) -> Result<(HeaderName, HeaderValue), HttpError>
where
    N: TryInto<HeaderName>,
    N::Error: Into<HttpError>,
    V: TryInto<HeaderValue>,
    V::Error: Into<HttpError>,
{
    let name = name.try_into().map_err(Into::<HttpError>::into)?;
    let value = value.try_into().map_err(Into::<HttpError>::into)?;
    Ok((name, value))
}

/// Apply `funcs` in order to the request headers.
pub fn header_funcs(funcs: impl IntoIterator<Item = HeaderFn>) -> Middleware {
    let funcs: Arc<[HeaderFn]> = funcs.into_iter().collect();
    map_request(move |req| funcs.iter().try_for_each(|f| f(&mut req.headers)))
}

// Validation errors are deferred to send time.
fn validated<F>(pair: Result<(HeaderName, HeaderValue), HttpError>, apply: F) -> Middleware
where
    F: Fn(&mut HeaderMap, HeaderName, HeaderValue) + Send + Sync + 'static,
{
    map_request(move |req| {
        let (name, value) = pair.clone()?;
        apply(&mut req.headers, name, value);
        Ok(())
    })
}

/// Replace every value of `name` with `value`.
pub fn set_header<N, V>(name: N, value: V) -> Middleware
where
    N: TryInto<HeaderName>,
    N::Error: Into<HttpError>,
    V: TryInto<HeaderValue>,
    V::Error: Into<HttpError>,
{
    validated(header_pair(name, value), |headers, name, value| {
        headers.insert(name, value);
    })
}

/// Append `value` to the values of `name`.
pub fn add_header<N, V>(name: N, value: V) -> Middleware
where
    N: TryInto<HeaderName>,
    N::Error: Into<HttpError>,
    V: TryInto<HeaderValue>,
    V::Error: Into<HttpError>,
{
    validated(header_pair(name, value), |headers, name, value| {
        headers.append(name, value);
    })
}

/// Remove every value of `name`.
pub fn del_header<N>(name: N) -> Middleware
where
    N: TryInto<HeaderName>,
    N::Error: Into<HttpError>,
{
    let name: Result<HeaderName, HttpError> = name.try_into().map_err(Into::into);
    map_request(move |req| {
        let name = name.clone()?;
        req.headers.remove(&name);
        Ok(())
    })
}

/// `Authorization: Bearer <token>`, marked sensitive.
pub fn bearer_auth(token: impl AsRef<str>) -> Middleware {
    let value = HeaderValue::try_from(format!("Bearer {}", token.as_ref())).map(|mut v| {
        v.set_sensitive(true);
        v
    });
    validated(
        value.map(|v| (AUTHORIZATION, v)).map_err(Into::into),
        |headers, name, value| {
            headers.insert(name, value);
        },
    )
}

/// `Authorization: Basic <base64(user:password)>`, marked sensitive.
pub fn basic_auth(user: impl AsRef<str>, password: Option<&str>) -> Middleware {
    let credentials = format!("{}:{}", user.as_ref(), password.unwrap_or_default());
    let value = HeaderValue::try_from(format!("Basic {}", STANDARD.encode(credentials))).map(
        |mut v| {
            v.set_sensitive(true);
            v
        },
    );
    validated(
        value.map(|v| (AUTHORIZATION, v)).map_err(Into::into),
        |headers, name, value| {
            headers.insert(name, value);
        },
    )
}

/// Option setting `name` to `value` when the header options are applied.
///
/// # Errors
/// Returns an error for an invalid name or value.
pub fn header_option<N, V>(name: N, value: V) -> Result<OptionMutator<HeaderMap>, HttpError>
where
    N: TryInto<HeaderName>,
    N::Error: Into<HttpError>,
    V: TryInto<HeaderValue>,
    V::Error: Into<HttpError>,
{
    let (name, value) = header_pair(name, value)?;
    Ok(Arc::new(move |headers: &mut HeaderMap| {
        headers.append(name.clone(), value.clone());
    }))
}

/// Apply [`HEADER_OPTIONS`] from the request context.
#[must_use]
pub fn prepare_header_middleware() -> Middleware {
    map_request(|req| {
        let Some(options) = get_options(&HEADER_OPTIONS, req, HeaderMap::new) else {
            return Ok(());
        };
        for name in options.keys() {
            req.headers.remove(name);
        }
        for (name, value) in &options {
            req.headers.append(name.clone(), value.clone());
        }
        Ok(())
    })
}
