//! Streaming `multipart/form-data` bodies.
//!
//! The envelope is never held in memory as a whole. A spawned producer task
//! writes the parts into a bounded pipe whose read end becomes the request
//! body, so the transport uploads while the producer is still reading field
//! sources. A field that fails mid-stream is reported twice: as an I/O error
//! on the pipe (which aborts the upload) and through a single-slot
//! back-channel that the middleware checks once the inner handler returns.
//!
//! Wire layout follows RFC 2046 §5.1.1:
//!
//! ```text
//! --<boundary>\r\n
//! Content-Disposition: form-data; name="description"\r\n
//! \r\n
//! hi\r\n
//! --<boundary>\r\n
//! Content-Disposition: form-data; name="file"; filename="f.txt"\r\n
//! Content-Type: text/plain\r\n
//! \r\n
//! hello world\r\n
//! --<boundary>--\r\n
//! ```

use crate::body::{BodyFactory, BodyReader, body_factory};
use crate::error::HttpError;
use crate::handler::{Middleware, from_fn};
use crate::pool;
use bytes::{BufMut, Bytes, BytesMut};
use http::HeaderValue;
use http::header::CONTENT_TYPE;
use parking_lot::Mutex;
use rand::Rng;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::StreamReader;

/// Bytes read from a file source before its part header is written.
const PROBE_LEN: usize = 512;

const CHUNK_LEN: usize = 32 * 1024;

/// Chunks buffered in the pipe before the producer waits for the transport.
const PIPE_DEPTH: usize = 4;

const MAX_BOUNDARY_LEN: usize = 70;

pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_secs(1);

const OCTET_STREAM: &str = "application/octet-stream";
const PLAIN_TEXT: &str = "text/plain; charset=utf-8";

/// Upload progress of one field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressUpdate {
    pub field: String,
    pub filename: Option<String>,
    /// Payload bytes of this field written so far
    pub written: u64,
    /// Declared size, if any
    pub size: Option<u64>,
}

/// Progress callback.
pub type ProgressFn = Arc<dyn Fn(&ProgressUpdate) + Send + Sync>;

enum Source {
    Values(Vec<String>),
    Reader(BodyFactory),
}

/// One field of a multipart form.
pub struct MultipartField {
    name: String,
    filename: Option<String>,
    content_type: Option<String>,
    source: Source,
    size: Option<u64>,
    progress_interval: Duration,
    on_progress: Option<ProgressFn>,
}

impl MultipartField {
    fn new(name: impl Into<String>, source: Source) -> Self {
        Self {
            name: name.into(),
            filename: None,
            content_type: None,
            source,
            size: None,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
            on_progress: None,
        }
    }

    /// Single text value.
    pub fn text(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(name, Source::Values(vec![value.into()]))
    }

    /// Several text values; each becomes its own part, in order.
    pub fn values<I, V>(name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<String>,
    {
        Self::new(
            name,
            Source::Values(values.into_iter().map(Into::into).collect()),
        )
    }

    /// File part whose content is read from `factory` while uploading.
    pub fn file(name: impl Into<String>, filename: impl Into<String>, factory: BodyFactory) -> Self {
        let mut field = Self::new(name, Source::Reader(factory));
        field.filename = Some(filename.into());
        field
    }

    /// Declared payload size, used for progress reporting.
    #[must_use]
    pub fn size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    /// Content type of a file part; inferred from its content when unset.
    #[must_use]
    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// Report progress at most once per `interval`, and once more when the
    /// part has been fully written.
    #[must_use]
    pub fn on_progress<F>(mut self, interval: Duration, callback: F) -> Self
    where
        F: Fn(&ProgressUpdate) + Send + Sync + 'static,
    {
        self.progress_interval = interval;
        self.on_progress = Some(Arc::new(callback));
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    fn progress(&self) -> Option<Progress> {
        let callback = Arc::clone(self.on_progress.as_ref()?);
        Some(Progress {
            update: ProgressUpdate {
                field: self.name.clone(),
                filename: self.filename.clone(),
                written: 0,
                size: self.size,
            },
            interval: self.progress_interval,
            last_report: Instant::now(),
            reported: false,
            callback,
        })
    }
}

impl fmt::Debug for MultipartField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let source = match &self.source {
            Source::Values(values) => format!("{} value(s)", values.len()),
            Source::Reader(_) => "reader".to_owned(),
        };
        f.debug_struct("MultipartField")
            .field("name", &self.name)
            .field("filename", &self.filename)
            .field("content_type", &self.content_type)
            .field("source", &source)
            .field("size", &self.size)
            .field("progress_interval", &self.progress_interval)
            .field("on_progress", &self.on_progress.is_some())
            .finish()
    }
}

struct Progress {
    update: ProgressUpdate,
    interval: Duration,
    last_report: Instant,
    /// Whether the current `written` count has been handed to the callback.
    reported: bool,
    callback: ProgressFn,
}

impl Progress {
    fn advance(&mut self, written: u64) {
        self.update.written += written;
        self.reported = false;
        let complete = self.update.size == Some(self.update.written);
        if complete || self.last_report.elapsed() >= self.interval {
            self.report();
        }
    }

    /// Final report for a finished part, unless the last one already covered it.
    fn complete(&mut self) {
        if !self.reported {
            self.report();
        }
    }

    fn report(&mut self) {
        (self.callback)(&self.update);
        self.last_report = Instant::now();
        self.reported = true;
    }
}

/// Multipart middleware options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MultipartOptions {
    /// Boundary to use instead of a random one
    pub boundary: Option<String>,
}

impl MultipartOptions {
    #[must_use]
    pub fn boundary(mut self, boundary: impl Into<String>) -> Self {
        self.boundary = Some(boundary.into());
        self
    }
}

/// Check `boundary` against the RFC 2046 `bchars` grammar.
///
/// # Errors
/// Returns `HttpError::InvalidBoundary` for an empty or over-long boundary,
/// a disallowed character, or a trailing space.
pub fn validate_boundary(boundary: &str) -> Result<(), HttpError> {
    let valid_char = |c: char| c.is_ascii_alphanumeric() || "'()+_,-./:=? ".contains(c);
    let valid = (1..=MAX_BOUNDARY_LEN).contains(&boundary.len())
        && boundary.chars().all(valid_char)
        && !boundary.ends_with(' ');
    if valid {
        Ok(())
    } else {
        Err(HttpError::InvalidBoundary(boundary.to_owned()))
    }
}

fn random_boundary() -> String {
    let mut raw = [0u8; 30];
    rand::rng().fill(&mut raw);
    hex::encode(raw)
}

/// Stream `fields` as a `multipart/form-data` body.
///
/// A field source failing while the body is produced fails the send with
/// `HttpError::MultipartProducer`, joined with whatever the inner handler
/// reported. The body can be streamed only once, so it is not replayed by
/// redirects.
pub fn multipart(fields: impl IntoIterator<Item = MultipartField>, opts: MultipartOptions) -> Middleware {
    let fields: Arc<[MultipartField]> = fields.into_iter().collect();
    from_fn(move |transport, mut req, next| {
        let fields = Arc::clone(&fields);
        let boundary = opts.boundary.clone();
        async move {
            let boundary = match boundary {
                Some(boundary) => {
                    validate_boundary(&boundary)?;
                    boundary
                }
                None => random_boundary(),
            };
            req.headers.insert(
                CONTENT_TYPE,
                HeaderValue::try_from(format!("multipart/form-data; boundary={boundary}"))?,
            );

            let (pipe, read_end) = mpsc::channel(PIPE_DEPTH);
            let reader: BodyReader = Box::pin(StreamReader::new(ReceiverStream::new(read_end)));
            let slot = Mutex::new(Some(reader));
            req.set_body_factory(
                body_factory(move || {
                    slot.lock()
                        .take()
                        .ok_or_else(|| HttpError::body_factory("multipart body can only be streamed once"))
                }),
                None,
            );

            let (errors, mut back_channel) = mpsc::channel(1);
            tokio::spawn(produce(fields, PartWriter::new(pipe, boundary), errors));

            let result = next(transport, req).await;
            match (back_channel.try_recv(), result) {
                (Ok(producer_err), Ok(_)) => Err(producer_err),
                (Ok(producer_err), Err(err)) => Err(HttpError::Joined(vec![producer_err, err])),
                (Err(_), result) => result,
            }
        }
    })
}

async fn produce(fields: Arc<[MultipartField]>, mut writer: PartWriter, errors: mpsc::Sender<HttpError>) {
    for field in fields.iter() {
        match writer.write_field(field).await {
            Ok(()) => {}
            Err(Abort::Gone) => {
                tracing::trace!(field = %field.name, "multipart consumer went away");
                return;
            }
            Err(Abort::Field(err)) => {
                tracing::debug!(field = %field.name, error = %err, "multipart field failed");
                let message = err.to_string();
                let reported = HttpError::MultipartProducer {
                    field: field.name.clone(),
                    source: Box::new(err),
                };
                if errors.try_send(reported).is_err() {
                    tracing::trace!(field = %field.name, "multipart back-channel closed");
                }
                writer.fail(io::Error::other(message)).await;
                return;
            }
        }
    }
    if writer.finish().await.is_err() {
        tracing::trace!("multipart consumer went away before the closing boundary");
    }
}

#[derive(Debug)]
enum Abort {
    /// The read end of the pipe was dropped.
    Gone,
    Field(HttpError),
}

impl From<io::Error> for Abort {
    fn from(err: io::Error) -> Self {
        Abort::Field(err.into())
    }
}

struct PartWriter {
    pipe: mpsc::Sender<io::Result<Bytes>>,
    boundary: String,
    started: bool,
}

impl PartWriter {
    fn new(pipe: mpsc::Sender<io::Result<Bytes>>, boundary: String) -> Self {
        Self {
            pipe,
            boundary,
            started: false,
        }
    }

    async fn send(&self, data: Bytes) -> Result<(), Abort> {
        self.pipe.send(Ok(data)).await.map_err(|_| Abort::Gone)
    }

    async fn begin_part(
        &mut self,
        name: &str,
        filename: Option<&str>,
        content_type: Option<&str>,
    ) -> Result<(), Abort> {
        let mut head = pool::get();
        if self.started {
            head.put_slice(b"\r\n");
        }
        self.started = true;
        head.put_slice(b"--");
        head.put_slice(self.boundary.as_bytes());
        head.put_slice(b"\r\nContent-Disposition: form-data; name=\"");
        head.put_slice(escape_quotes(name).as_bytes());
        head.put_slice(b"\"");
        if let Some(filename) = filename {
            head.put_slice(b"; filename=\"");
            head.put_slice(escape_quotes(filename).as_bytes());
            head.put_slice(b"\"");
        }
        head.put_slice(b"\r\n");
        if let Some(content_type) = content_type {
            head.put_slice(b"Content-Type: ");
            head.put_slice(content_type.as_bytes());
            head.put_slice(b"\r\n");
        }
        head.put_slice(b"\r\n");
        self.send(Bytes::copy_from_slice(&head)).await
    }

    async fn write_field(&mut self, field: &MultipartField) -> Result<(), Abort> {
        match &field.source {
            Source::Values(values) => {
                for value in values {
                    self.begin_part(&field.name, None, None).await?;
                    self.send(Bytes::from(value.clone())).await?;
                }
                Ok(())
            }
            Source::Reader(factory) => {
                let reader = factory().map_err(Abort::Field)?;
                self.write_reader(field, reader).await
            }
        }
    }

    async fn write_reader(&mut self, field: &MultipartField, mut reader: BodyReader) -> Result<(), Abort> {
        let mut buf = BytesMut::with_capacity(CHUNK_LEN);
        while buf.len() < PROBE_LEN {
            if reader.read_buf(&mut buf).await? == 0 {
                break;
            }
        }
        let content_type = field.content_type.clone().unwrap_or_else(|| {
            detect_content_type(&buf[..buf.len().min(PROBE_LEN)], field.filename.as_deref())
        });
        self.begin_part(&field.name, field.filename.as_deref(), Some(&content_type))
            .await?;

        let mut progress = field.progress();
        loop {
            if buf.is_empty() && reader.read_buf(&mut buf).await? == 0 {
                if let Some(progress) = progress.as_mut() {
                    progress.complete();
                }
                return Ok(());
            }
            let chunk = buf.split().freeze();
            let written = chunk.len() as u64;
            self.send(chunk).await?;
            if let Some(progress) = progress.as_mut() {
                progress.advance(written);
            }
            buf.reserve(CHUNK_LEN);
        }
    }

    async fn finish(&mut self) -> Result<(), Abort> {
        let lead = if self.started { "\r\n" } else { "" };
        let tail = format!("{lead}--{}--\r\n", self.boundary);
        self.send(Bytes::from(tail)).await
    }

    async fn fail(&self, err: io::Error) {
        if self.pipe.send(Err(err)).await.is_err() {
            tracing::trace!("multipart consumer went away before the failure was delivered");
        }
    }
}

fn escape_quotes(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Content type from the first bytes of a part, refined by the file name
/// when the content alone only says "text" or "binary".
fn detect_content_type(probe: &[u8], filename: Option<&str>) -> String {
    let sniffed = sniff(probe);
    if (sniffed == OCTET_STREAM || sniffed == PLAIN_TEXT)
        && let Some(guess) = filename.and_then(|f| mime_guess::from_path(f).first_raw())
    {
        return guess.to_owned();
    }
    sniffed.to_owned()
}

fn sniff(probe: &[u8]) -> &'static str {
    const SIGNATURES: &[(&[u8], &str)] = &[
        (b"\x89PNG\r\n\x1a\n", "image/png"),
        (b"\xff\xd8\xff", "image/jpeg"),
        (b"GIF87a", "image/gif"),
        (b"GIF89a", "image/gif"),
        (b"%PDF-", "application/pdf"),
        (b"PK\x03\x04", "application/zip"),
        (b"\x1f\x8b\x08", "application/x-gzip"),
    ];
    if let Some(content_type) = SIGNATURES
        .iter()
        .find(|(magic, _)| probe.starts_with(magic))
        .map(|(_, content_type)| *content_type)
    {
        return content_type;
    }
    let head = probe.trim_ascii_start();
    if head.starts_with(b"<?xml") {
        return "text/xml; charset=utf-8";
    }
    let binary = probe
        .iter()
        .any(|b| matches!(b, 0x00..=0x08 | 0x0B | 0x0E..=0x1A | 0x1C..=0x1F));
    if binary { OCTET_STREAM } else { PLAIN_TEXT }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::body::bytes_reader;
    use crate::context::RequestContext;
    use crate::handler::{HandlerResult, handler_fn};
    use crate::outgoing::{OutgoingRequest, parse_url};
    use crate::transport::HttpTransport;
    use http::Method;
    use http_body_util::{BodyExt, Full};

    fn ok() -> HandlerResult {
        Ok(http::Response::new(
            Full::new(Bytes::new()).map_err(Into::into).boxed(),
        ))
    }

    fn text_file(content: &'static str) -> BodyFactory {
        body_factory(move || Ok(bytes_reader(Bytes::from_static(content.as_bytes()))))
    }

    fn failing_file() -> BodyFactory {
        body_factory(|| {
            let chunks: Vec<io::Result<Bytes>> = vec![
                Ok(Bytes::from_static(b"partial")),
                Err(io::Error::other("disk gone")),
            ];
            Ok(Box::pin(StreamReader::new(futures_util::stream::iter(chunks))))
        })
    }

    #[derive(Default)]
    struct Upload {
        content_type: String,
        body: String,
    }

    async fn upload(middleware: Middleware) -> (HandlerResult, Upload) {
        let seen: Arc<Mutex<Upload>> = Arc::default();
        let sink = Arc::clone(&seen);
        let capture = handler_fn(move |_, req: OutgoingRequest| {
            let sink = Arc::clone(&sink);
            async move {
                let content_type = req
                    .headers
                    .get(CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_owned();
                let mut body = Vec::new();
                if let Some(factory) = &req.get_body {
                    factory()?.read_to_end(&mut body).await?;
                }
                *sink.lock() = Upload {
                    content_type,
                    body: String::from_utf8_lossy(&body).into_owned(),
                };
                ok()
            }
        });
        let req = OutgoingRequest::new(
            Method::POST,
            parse_url("http://svc/upload").unwrap(),
            RequestContext::background(),
        );
        let result = middleware(capture)(HttpTransport::unreachable(), req).await;
        let upload = std::mem::take(&mut *seen.lock());
        (result, upload)
    }

    #[tokio::test]
    async fn test_envelope_layout() {
        let fields = [
            MultipartField::text("description", "hi"),
            MultipartField::file("file", "f.txt", text_file("hello world")),
        ];
        let (result, upload) = upload(multipart(
            fields,
            MultipartOptions::default().boundary("test-boundary"),
        ))
        .await;

        result.unwrap();
        assert_eq!(upload.content_type, "multipart/form-data; boundary=test-boundary");
        assert_eq!(
            upload.body,
            "--test-boundary\r\n\
             Content-Disposition: form-data; name=\"description\"\r\n\r\n\
             hi\r\n\
             --test-boundary\r\n\
             Content-Disposition: form-data; name=\"file\"; filename=\"f.txt\"\r\n\
             Content-Type: text/plain\r\n\r\n\
             hello world\r\n\
             --test-boundary--\r\n"
        );
    }

    #[tokio::test]
    async fn test_random_boundary_and_value_order() {
        let fields = [MultipartField::values("tag", ["a", "b", "c"])];
        let (result, upload) = upload(multipart(fields, MultipartOptions::default())).await;
        result.unwrap();

        let boundary = upload
            .content_type
            .strip_prefix("multipart/form-data; boundary=")
            .unwrap();
        assert_eq!(boundary.len(), 60);
        assert!(upload.body.starts_with(&format!("--{boundary}\r\n")));
        let a = upload.body.find("\r\n\r\na").unwrap();
        let b = upload.body.find("\r\n\r\nb").unwrap();
        let c = upload.body.find("\r\n\r\nc").unwrap();
        assert!(a < b && b < c);
    }

    #[tokio::test]
    async fn test_invalid_boundary_fails_send() {
        let (result, _) = upload(multipart(
            [MultipartField::text("a", "b")],
            MultipartOptions::default().boundary("bad\"boundary"),
        ))
        .await;
        assert!(matches!(result, Err(HttpError::InvalidBoundary(_))));
    }

    #[tokio::test]
    async fn test_reader_failure_reaches_caller() {
        let fields = [
            MultipartField::text("description", "hi"),
            MultipartField::file("file", "f.bin", failing_file()),
        ];
        let (result, _) = upload(multipart(fields, MultipartOptions::default())).await;

        let Err(HttpError::Joined(errors)) = result else {
            panic!("expected a joined error");
        };
        assert!(matches!(
            &errors[0],
            HttpError::MultipartProducer { field, .. } if field == "file"
        ));
        assert!(matches!(errors[1], HttpError::Io(_)));
    }

    #[tokio::test]
    async fn test_factory_failure_reaches_caller_even_if_handler_succeeds() {
        let failing = body_factory(|| Err(HttpError::body_factory("no such file")));
        let middleware = multipart(
            [MultipartField::file("file", "missing.txt", failing)],
            MultipartOptions::default(),
        );
        let req = OutgoingRequest::new(
            Method::POST,
            parse_url("http://svc/upload").unwrap(),
            RequestContext::background(),
        );

        // The handler never reads the body, so give the producer a moment to run.
        let chain = middleware(handler_fn(|_, _| async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            ok()
        }));
        let err = chain(HttpTransport::unreachable(), req).await.unwrap_err();
        assert!(matches!(err, HttpError::MultipartProducer { .. }));
    }

    #[tokio::test]
    async fn test_progress_reported_at_declared_size() {
        let updates: Arc<Mutex<Vec<ProgressUpdate>>> = Arc::default();
        let sink = Arc::clone(&updates);
        let field = MultipartField::file("file", "f.txt", text_file("hello world"))
            .size(11)
            .on_progress(Duration::from_secs(3600), move |u| sink.lock().push(u.clone()));
        let (result, _) = upload(multipart([field], MultipartOptions::default())).await;
        result.unwrap();

        let updates = updates.lock();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].written, 11);
        assert_eq!(updates[0].size, Some(11));
        assert_eq!(updates[0].filename.as_deref(), Some("f.txt"));
    }

    #[tokio::test]
    async fn test_progress_completes_without_declared_size() {
        let updates: Arc<Mutex<Vec<ProgressUpdate>>> = Arc::default();
        let sink = Arc::clone(&updates);
        let field = MultipartField::file("file", "f.txt", text_file("hello world"))
            .on_progress(Duration::from_secs(3600), move |u| sink.lock().push(u.clone()));
        let (result, _) = upload(multipart([field], MultipartOptions::default())).await;
        result.unwrap();

        let updates = updates.lock();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].written, 11);
        assert_eq!(updates[0].size, None);
    }

    #[test]
    fn test_boundary_validation() {
        assert!(validate_boundary("simple-boundary").is_ok());
        assert!(validate_boundary("with space'()+_,-./:=?inside").is_ok());
        assert!(validate_boundary("").is_err());
        assert!(validate_boundary("trailing ").is_err());
        assert!(validate_boundary(&"x".repeat(71)).is_err());
        assert!(validate_boundary("semi;colon").is_err());
    }

    #[test]
    fn test_content_type_detection() {
        assert_eq!(detect_content_type(b"\x89PNG\r\n\x1a\nrest", Some("a.bin")), "image/png");
        assert_eq!(detect_content_type(b"plain words", Some("notes.csv")), "text/csv");
        assert_eq!(detect_content_type(b"plain words", None), PLAIN_TEXT);
        assert_eq!(detect_content_type(b"\x00\x01\x02", None), OCTET_STREAM);
        assert_eq!(escape_quotes(r#"a"b\c"#), r#"a\"b\\c"#);
    }
}
