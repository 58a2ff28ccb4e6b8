use crate::body::{BodyFactory, BodyReader, RequestBody};
use crate::context::RequestContext;
use crate::error::{HttpError, InvalidUriKind};
use cookie::Cookie;
use http::header::{self, HeaderMap, HeaderValue};
use http::{Method, Uri, Version};
use std::fmt;
use url::Url;

/// Base used to resolve request paths given without scheme and host.
pub(crate) const RELATIVE_BASE: &str = "http://localhost";

/// Request message as seen by middlewares.
///
/// Every field is public; middlewares mutate it in place before handing it to
/// the next handler. At the leaf it is converted into an `http::Request`.
pub struct OutgoingRequest {
    /// Request method
    pub method: Method,
    /// Fully parsed target URL
    pub url: Url,
    /// Header multi-map; names are case-insensitive
    pub headers: HeaderMap,
    /// One-shot body, consumed by the transport
    pub body: Option<BodyReader>,
    /// Replayable body; takes precedence over `body`
    pub get_body: Option<BodyFactory>,
    /// Declared body length
    pub content_length: Option<u64>,
    /// Cancellation and option bags
    pub context: RequestContext,
    /// Protocol version (HTTP/1.1 unless changed)
    pub version: Version,
}

impl OutgoingRequest {
    /// Minimal request: no headers, no body, HTTP/1.1.
    #[must_use]
    pub fn new(method: Method, url: Url, context: RequestContext) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: None,
            get_body: None,
            content_length: None,
            context,
            version: Version::HTTP_11,
        }
    }

    /// Attach a one-shot body.
    pub fn set_body(&mut self, reader: BodyReader, len: Option<u64>) {
        self.body = Some(reader);
        self.content_length = len;
    }

    /// Attach a replayable body. The one-shot slot is cleared.
    pub fn set_body_factory(&mut self, factory: BodyFactory, len: Option<u64>) {
        self.get_body = Some(factory);
        self.body = None;
        self.content_length = len;
    }

    /// Whether any body is attached.
    #[must_use]
    pub fn has_body(&self) -> bool {
        self.body.is_some() || self.get_body.is_some()
    }

    /// Append `name=value` to the `Cookie` header.
    ///
    /// # Errors
    /// Returns `HttpError::InvalidHeaderValue` when the pair cannot be a header value.
    pub fn add_cookie(&mut self, cookie: &Cookie<'_>) -> Result<(), HttpError> {
        let pair = format!("{}={}", cookie.name(), cookie.value());
        let joined = match self.headers.get(header::COOKIE).map(HeaderValue::to_str) {
            Some(Ok(existing)) if !existing.is_empty() => format!("{existing}; {pair}"),
            _ => pair,
        };
        self.headers
            .insert(header::COOKIE, HeaderValue::try_from(joined)?);
        Ok(())
    }

    /// Cookies currently carried by the `Cookie` header.
    #[must_use]
    pub fn cookies(&self) -> Vec<Cookie<'static>> {
        self.headers
            .get_all(header::COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(Cookie::split_parse)
            .filter_map(Result::ok)
            .map(Cookie::into_owned)
            .collect()
    }

    /// Target host, empty when the URL has none.
    #[must_use]
    pub fn host(&self) -> &str {
        self.url.host_str().unwrap_or("")
    }

    /// Convert into a transport request, consuming the body slot.
    ///
    /// # Errors
    /// Returns `HttpError::InvalidRequest` when the URL is not a valid URI, or
    /// a build error when the method/version combination is rejected.
    pub fn into_http(self) -> Result<http::Request<RequestBody>, HttpError> {
        let uri: Uri = self
            .url
            .as_str()
            .parse()
            .map_err(|e: http::uri::InvalidUri| HttpError::InvalidRequest {
                url: self.url.to_string(),
                kind: InvalidUriKind::ParseError,
                reason: e.to_string(),
            })?;

        let body = match (self.get_body, self.body) {
            (Some(factory), _) => RequestBody::from_factory(factory, self.content_length),
            (None, Some(reader)) => RequestBody::from_reader(reader, self.content_length),
            (None, None) => RequestBody::empty(),
        };

        let mut request = http::Request::builder()
            .method(self.method)
            .uri(uri)
            .version(self.version)
            .body(body)?;
        *request.headers_mut() = self.headers;
        request.extensions_mut().insert(self.context);
        Ok(request)
    }
}

impl fmt::Debug for OutgoingRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutgoingRequest")
            .field("method", &self.method)
            .field("url", &self.url.as_str())
            .field("headers", &self.headers)
            .field("body", &self.body.is_some())
            .field("get_body", &self.get_body.is_some())
            .field("content_length", &self.content_length)
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

/// Parse a caller-supplied URL.
///
/// Strings starting with `/` resolve against `http://localhost`; strings that
/// do not start with a scheme get `http://` prepended.
pub(crate) fn parse_url(raw: &str) -> Result<Url, HttpError> {
    let invalid = |kind: InvalidUriKind, reason: String| HttpError::InvalidRequest {
        url: raw.to_owned(),
        kind,
        reason,
    };

    let trimmed = raw.trim();
    let candidate = if trimmed.starts_with('/') {
        format!("{RELATIVE_BASE}{trimmed}")
    } else if has_scheme(trimmed) {
        trimmed.to_owned()
    } else {
        format!("http://{trimmed}")
    };

    let url = Url::parse(&candidate).map_err(|e| invalid(InvalidUriKind::ParseError, e.to_string()))?;
    match url.scheme() {
        "http" | "https" => {}
        other => {
            return Err(invalid(
                InvalidUriKind::UnsupportedScheme,
                format!("scheme '{other}' is not http or https"),
            ));
        }
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err(invalid(
            InvalidUriKind::MissingAuthority,
            "URL has no host".to_owned(),
        ));
    }
    Ok(url)
}

/// `true` when `raw` opens with `scheme://`. A `://` later in the path or
/// query does not count.
fn has_scheme(raw: &str) -> bool {
    let Some((scheme, _)) = raw.split_once("://") else {
        return false;
    };
    let mut chars = scheme.chars();
    chars.next().is_some_and(|c| c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
}
