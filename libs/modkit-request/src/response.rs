use crate::body::BodyReader;
use crate::error::{BoxError, HttpError, ResponseError};
use crate::handler::HandlerResult;
use bytes::{Bytes, BytesMut};
use cookie::Cookie;
use http::response::Parts;
use http::{HeaderMap, StatusCode, header};
use http_body_util::BodyExt;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use std::fmt;
use std::io::{self, BufReader};
use std::path::Path;
use std::sync::{Arc, LazyLock};
use tokio::io::AsyncWriteExt;
use tokio_util::io::{StreamReader, SyncIoBridge};

type DecodeReader = BufReader<SyncIoBridge<BodyReader>>;

/// Type-erased response body (raw or transparently decompressed).
pub type ResponseBody = http_body_util::combinators::BoxBody<Bytes, BoxError>;

/// Upper bound on bytes discarded by [`Response::close`] before giving up on
/// connection reuse.
const DRAIN_LIMIT: usize = 1024 * 1024;

/// Pre-allocation cap taken from an untrusted `Content-Length`.
const PREALLOC_LIMIT: usize = 4 * 1024 * 1024;

static EMPTY_HEADERS: LazyLock<HeaderMap> = LazyLock::new(HeaderMap::new);

/// Outcome of one send.
///
/// A `Response` is produced for every send, including sends that failed before
/// reaching the network, so callers can always [`close`](Response::close) it.
/// [`error`](Response::error) is the single source of truth for failure; body
/// helpers return empty values once an error is recorded.
///
/// ```ignore
/// let mut resp = dispatcher.new_request().get("http://svc/ok").await;
/// if let Some(err) = resp.error() {
///     tracing::warn!(error = %err, "call failed");
/// }
/// let text = resp.text().await;
/// resp.close().await?;
/// ```
pub struct Response {
    head: Option<Parts>,
    body: Option<ResponseBody>,
    error: Option<HttpError>,
    buffer: Option<Bytes>,
    pending: Bytes,
}

impl Response {
    /// Wrap a pipeline outcome.
    ///
    /// A [`ResponseError`] keeps its status and headers available.
    #[must_use]
    pub fn from_result(result: HandlerResult) -> Self {
        match result {
            Ok(resp) => {
                let (head, body) = resp.into_parts();
                Self {
                    head: Some(head),
                    body: Some(body),
                    ..Self::empty()
                }
            }
            Err(err) => {
                let head = match &err {
                    HttpError::Response(rejected) => Some(head_from(rejected)),
                    _ => None,
                };
                Self {
                    head,
                    error: Some(err),
                    ..Self::empty()
                }
            }
        }
    }

    /// Error-only response.
    #[must_use]
    pub fn from_error(err: HttpError) -> Self {
        Self::from_result(Err(err))
    }

    fn empty() -> Self {
        Self {
            head: None,
            body: None,
            error: None,
            buffer: None,
            pending: Bytes::new(),
        }
    }

    /// Captured error, if any.
    #[must_use]
    pub fn error(&self) -> Option<&HttpError> {
        self.error.as_ref()
    }

    /// Consume the wrapper, keeping only its error.
    #[must_use]
    pub fn into_error(self) -> Option<HttpError> {
        self.error
    }

    /// Status code, when a response head was received.
    #[must_use]
    pub fn status(&self) -> Option<StatusCode> {
        self.head.as_ref().map(|h| h.status)
    }

    /// Response headers; empty when no head was received.
    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        self.head.as_ref().map_or(&EMPTY_HEADERS, |h| &h.headers)
    }

    /// Cookies set by the server; unparsable `Set-Cookie` values are skipped.
    #[must_use]
    pub fn cookies(&self) -> Vec<Cookie<'static>> {
        self.headers()
            .get_all(header::SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .filter_map(|v| Cookie::parse(v.to_owned()).ok())
            .collect()
    }

    /// Raw response head (status, version, headers, extensions).
    #[must_use]
    pub fn raw_response(&self) -> Option<&Parts> {
        self.head.as_ref()
    }

    /// Next chunk of the body stream; `Ok(None)` at the end.
    ///
    /// # Errors
    /// Returns the captured error, or the stream error that ended the body. A
    /// stream error is recorded and the body is dropped.
    pub async fn chunk(&mut self) -> Result<Option<Bytes>, HttpError> {
        if let Some(err) = &self.error {
            return Err(err.clone());
        }
        if !self.pending.is_empty() {
            return Ok(Some(std::mem::take(&mut self.pending)));
        }
        let Some(body) = self.body.as_mut() else {
            return Ok(None);
        };
        loop {
            match body.frame().await {
                Some(Ok(frame)) => {
                    if let Ok(data) = frame.into_data()
                        && !data.is_empty()
                    {
                        return Ok(Some(data));
                    }
                }
                Some(Err(err)) => {
                    let err = HttpError::from_boxed(err);
                    tracing::debug!(error = %err, "response body stream failed");
                    self.body = None;
                    self.error = Some(err.clone());
                    return Err(err);
                }
                None => {
                    self.body = None;
                    return Ok(None);
                }
            }
        }
    }

    /// Read from the body stream into `buf`; `Ok(0)` at the end.
    ///
    /// # Errors
    /// Same as [`chunk`](Response::chunk).
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, HttpError> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.pending.is_empty() {
            match self.chunk().await? {
                Some(data) => self.pending = data,
                None => return Ok(0),
            }
        }
        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending.split_to(n));
        Ok(n)
    }

    async fn fill_buffer(&mut self) -> Result<Bytes, HttpError> {
        if let Some(buffered) = &self.buffer {
            return Ok(buffered.clone());
        }
        if let Some(err) = &self.error {
            return Err(err.clone());
        }
        let hint = self
            .headers()
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(0)
            .min(PREALLOC_LIMIT);
        let mut collected = BytesMut::with_capacity(hint);
        while let Some(data) = self.chunk().await? {
            collected.extend_from_slice(&data);
        }
        let bytes = collected.freeze();
        self.buffer = Some(bytes.clone());
        Ok(bytes)
    }

    /// Whole body, buffered on first call; empty when an error is recorded.
    pub async fn bytes(&mut self) -> Bytes {
        self.fill_buffer().await.unwrap_or_default()
    }

    /// Whole body as text (lossy UTF-8); empty when an error is recorded.
    pub async fn text(&mut self) -> String {
        String::from_utf8_lossy(&self.bytes().await).into_owned()
    }

    /// Decode the body as JSON. An empty body yields `Ok(None)`.
    ///
    /// Buffered content is decoded from memory; otherwise the body is decoded
    /// as it streams in and is not buffered.
    ///
    /// # Errors
    /// Returns the captured error, a stream error, or `HttpError::Json`.
    pub async fn json<T>(&mut self) -> Result<Option<T>, HttpError>
    where
        T: DeserializeOwned + Send + 'static,
    {
        if let Some(bytes) = self.buffered()? {
            if bytes.iter().all(u8::is_ascii_whitespace) {
                return Ok(None);
            }
            return Ok(Some(serde_json::from_slice(&bytes)?));
        }
        let Some(first) = self.first_content().await? else {
            return Ok(None);
        };
        self.decode_streaming(first, |reader| Ok(serde_json::from_reader(reader)?))
            .await
            .map(Some)
    }

    /// Decode the body as XML. An empty body yields `Ok(None)`.
    ///
    /// Same buffering rules as [`json`](Response::json).
    ///
    /// # Errors
    /// Returns the captured error, a stream error, or `HttpError::Xml`.
    pub async fn xml<T>(&mut self) -> Result<Option<T>, HttpError>
    where
        T: DeserializeOwned + Send + 'static,
    {
        if let Some(bytes) = self.buffered()? {
            if bytes.iter().all(u8::is_ascii_whitespace) {
                return Ok(None);
            }
            return quick_xml::de::from_reader(bytes.as_ref())
                .map(Some)
                .map_err(|e| HttpError::Xml(Arc::new(e)));
        }
        let Some(first) = self.first_content().await? else {
            return Ok(None);
        };
        self.decode_streaming(first, |reader| {
            quick_xml::de::from_reader(reader).map_err(|e| HttpError::Xml(Arc::new(e)))
        })
        .await
        .map(Some)
    }

    fn buffered(&self) -> Result<Option<Bytes>, HttpError> {
        match (&self.buffer, &self.error) {
            (Some(bytes), _) => Ok(Some(bytes.clone())),
            (None, Some(err)) => Err(err.clone()),
            (None, None) => Ok(None),
        }
    }

    /// First chunk holding something other than whitespace; `None` when the
    /// body ends first.
    async fn first_content(&mut self) -> Result<Option<Bytes>, HttpError> {
        while let Some(data) = self.chunk().await? {
            if !data.iter().all(u8::is_ascii_whitespace) {
                return Ok(Some(data));
            }
        }
        Ok(None)
    }

    /// Run a blocking decoder over `first` followed by the rest of the body.
    ///
    /// The body is consumed. A stream failure is recorded and wins over the
    /// decoder's own error.
    async fn decode_streaming<T, F>(&mut self, first: Bytes, decode: F) -> Result<T, HttpError>
    where
        T: Send + 'static,
        F: FnOnce(DecodeReader) -> Result<T, HttpError> + Send + 'static,
    {
        use futures_util::StreamExt;

        let failure: Arc<Mutex<Option<HttpError>>> = Arc::default();
        let sink = Arc::clone(&failure);
        let rest = futures_util::stream::iter(self.body.take())
            .flat_map(|body| body.into_data_stream())
            .map(move |item| {
                item.map_err(|err| {
                    let err = HttpError::from_boxed(err);
                    let io_err = io::Error::other(err.to_string());
                    *sink.lock() = Some(err);
                    io_err
                })
            });
        let stream = futures_util::stream::once(std::future::ready(Ok(first))).chain(rest);
        let reader: BodyReader = Box::pin(StreamReader::new(stream));
        let bridge = SyncIoBridge::new(reader);

        let decoded = tokio::task::spawn_blocking(move || decode(BufReader::new(bridge)))
            .await
            .map_err(|e| HttpError::pipeline(format!("decode task failed: {e}")))?;

        if let Some(err) = failure.lock().take() {
            tracing::debug!(error = %err, "response body stream failed while decoding");
            self.error = Some(err.clone());
            return Err(err);
        }
        decoded
    }

    /// Write the body to `path`, streaming unless it is already buffered.
    ///
    /// # Errors
    /// Returns the captured error, a stream error, or `HttpError::Io`.
    pub async fn save_to_file(&mut self, path: impl AsRef<Path>) -> Result<(), HttpError> {
        if let Some(err) = &self.error {
            return Err(err.clone());
        }
        let mut file = tokio::fs::File::create(path.as_ref()).await?;
        if let Some(buffered) = &self.buffer {
            file.write_all(buffered).await?;
        } else {
            while let Some(data) = self.chunk().await? {
                file.write_all(&data).await?;
            }
        }
        file.flush().await?;
        Ok(())
    }

    /// Drop the buffered body; later reads return what is left of the stream.
    pub fn clear_internal_buffer(&mut self) {
        self.buffer = None;
    }

    /// Drain and release the body.
    ///
    /// Safe to call any number of times and on error-only responses; each call
    /// returns the same error.
    ///
    /// # Errors
    /// Returns the captured error, or the stream error hit while draining.
    pub async fn close(&mut self) -> Result<(), HttpError> {
        self.pending = Bytes::new();
        if let Some(mut body) = self.body.take()
            && self.error.is_none()
        {
            let mut drained = 0usize;
            while let Some(frame) = body.frame().await {
                match frame {
                    Ok(frame) => {
                        drained += frame.data_ref().map_or(0, Bytes::len);
                        if drained > DRAIN_LIMIT {
                            tracing::trace!(drained, "response body too large to drain");
                            break;
                        }
                    }
                    Err(err) => {
                        let err = HttpError::from_boxed(err);
                        tracing::debug!(error = %err, "response body failed while draining");
                        self.error = Some(err);
                        break;
                    }
                }
            }
        }
        match &self.error {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

fn head_from(rejected: &ResponseError) -> Parts {
    let (mut head, ()) = http::Response::new(()).into_parts();
    head.status = rejected.status;
    head.headers = rejected.headers.clone();
    head
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status())
            .field("error", &self.error)
            .field("body", &self.body.is_some())
            .field("buffered", &self.buffer.as_ref().map(Bytes::len))
            .finish()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use http_body::Frame;
    use http_body_util::{Full, StreamBody};
    use serde::Deserialize;
    use std::time::Duration;

    fn ok_response(status: u16, body: &'static str) -> Response {
        let resp = http::Response::builder()
            .status(status)
            .header(header::SET_COOKIE, "session=abc; Path=/")
            .body(Full::new(Bytes::from_static(body.as_bytes())).map_err(Into::into).boxed())
            .unwrap();
        Response::from_result(Ok(resp))
    }

    fn failing_response() -> Response {
        let frames: Vec<Result<Frame<Bytes>, BoxError>> = vec![
            Ok(Frame::data(Bytes::from_static(b"partial"))),
            Err(Box::new(HttpError::Timeout(Duration::from_millis(5)))),
        ];
        let body = StreamBody::new(futures_util::stream::iter(frames)).boxed();
        Response::from_result(Ok(http::Response::new(body)))
    }

    #[tokio::test]
    async fn test_text_is_buffered_once() {
        let mut resp = ok_response(200, "OK");
        assert_eq!(resp.status(), Some(StatusCode::OK));
        assert_eq!(resp.text().await, "OK");
        assert_eq!(resp.text().await, "OK");
        assert!(resp.close().await.is_ok());
    }

    #[tokio::test]
    async fn test_error_only_response_is_safe() {
        let mut resp = Response::from_error(HttpError::Cancelled);
        assert!(resp.status().is_none());
        assert!(resp.headers().is_empty());
        assert!(resp.raw_response().is_none());
        assert!(resp.bytes().await.is_empty());
        assert_eq!(resp.text().await, "");
        assert!(resp.json::<serde_json::Value>().await.is_err());

        let first = resp.close().await.unwrap_err();
        let second = resp.close().await.unwrap_err();
        assert_eq!(first.to_string(), second.to_string());
    }

    #[tokio::test]
    async fn test_close_is_idempotent_on_success() {
        let mut resp = ok_response(200, "body");
        assert!(resp.close().await.is_ok());
        assert!(resp.close().await.is_ok());
        assert!(resp.bytes().await.is_empty());
    }

    #[tokio::test]
    async fn test_mid_stream_failure_is_captured() {
        let mut resp = failing_response();
        assert!(resp.bytes().await.is_empty());
        assert!(resp.error().is_some_and(HttpError::is_timeout));
        assert!(resp.close().await.unwrap_err().is_timeout());
    }

    #[tokio::test]
    async fn test_read_in_small_pieces() {
        let mut resp = ok_response(200, "abcdef");
        let mut buf = [0u8; 4];
        let mut out = Vec::new();
        loop {
            let n = resp.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        assert_eq!(out, b"abcdef");
    }

    #[tokio::test]
    async fn test_json_and_empty_body() {
        #[derive(Deserialize, PartialEq, Debug)]
        struct Item {
            id: u32,
        }

        let mut resp = ok_response(200, r#"{"id":7}"#);
        assert_eq!(resp.json::<Item>().await.unwrap(), Some(Item { id: 7 }));

        let mut empty = ok_response(204, "");
        assert_eq!(empty.json::<Item>().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_large_json_is_decoded_without_buffering() {
        let items: Vec<u32> = (0..50_000).collect();
        let encoded = serde_json::to_vec(&items).unwrap();
        let frames: Vec<Result<Frame<Bytes>, BoxError>> = encoded
            .chunks(4096)
            .map(|c| Ok(Frame::data(Bytes::copy_from_slice(c))))
            .collect();
        let body = StreamBody::new(futures_util::stream::iter(frames)).boxed();
        let mut resp = Response::from_result(Ok(http::Response::new(body)));

        let decoded: Vec<u32> = resp.json().await.unwrap().unwrap();
        assert_eq!(decoded, items);
        assert!(resp.buffer.is_none());
        assert!(resp.body.is_none());
        assert!(resp.close().await.is_ok());
    }

    #[tokio::test]
    async fn test_streaming_decode_reports_stream_failure() {
        let frames: Vec<Result<Frame<Bytes>, BoxError>> = vec![
            Ok(Frame::data(Bytes::from_static(b"  "))),
            Ok(Frame::data(Bytes::from_static(br#"{"id":"#))),
            Err(Box::new(HttpError::Timeout(Duration::from_millis(5)))),
        ];
        let body = StreamBody::new(futures_util::stream::iter(frames)).boxed();
        let mut resp = Response::from_result(Ok(http::Response::new(body)));

        let err = resp.json::<serde_json::Value>().await.unwrap_err();
        assert!(err.is_timeout(), "{err:?}");
        assert!(resp.error().is_some_and(HttpError::is_timeout));
    }

    #[tokio::test]
    async fn test_buffered_body_is_decoded_from_memory() {
        let mut resp = ok_response(200, r#"{"id":3}"#);
        assert_eq!(resp.bytes().await.len(), 8);
        let first: serde_json::Value = resp.json().await.unwrap().unwrap();
        let second: serde_json::Value = resp.json().await.unwrap().unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_xml_decoding() {
        #[derive(Deserialize, PartialEq, Debug)]
        struct Note {
            to: String,
        }

        let mut resp = ok_response(200, "<note><to>Tove</to></note>");
        let note = resp.xml::<Note>().await.unwrap().unwrap();
        assert_eq!(note.to, "Tove");
    }

    #[tokio::test]
    async fn test_cookies_parsed_from_set_cookie() {
        let resp = ok_response(200, "");
        let cookies = resp.cookies();
        assert_eq!(cookies.len(), 1);
        assert_eq!(cookies[0].name(), "session");
        assert_eq!(cookies[0].value(), "abc");
    }

    #[tokio::test]
    async fn test_rejected_response_keeps_head() {
        let mut headers = HeaderMap::new();
        headers.insert("x-reason", "quota".parse().unwrap());
        let err = HttpError::Response(ResponseError {
            status: StatusCode::TOO_MANY_REQUESTS,
            headers,
            source: Box::new(HttpError::pipeline("rejected by middleware")),
        });

        let resp = Response::from_error(err);
        assert_eq!(resp.status(), Some(StatusCode::TOO_MANY_REQUESTS));
        assert_eq!(resp.headers()["x-reason"], "quota");
        assert!(resp.error().is_some());
    }

    #[tokio::test]
    async fn test_save_to_file_and_clear_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.txt");

        let mut resp = ok_response(200, "saved contents");
        assert_eq!(resp.bytes().await.len(), 14);
        resp.save_to_file(&path).await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "saved contents");

        resp.clear_internal_buffer();
        assert!(resp.bytes().await.is_empty());
    }
}
