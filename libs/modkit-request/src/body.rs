//! Request body representations.
//!
//! Outgoing bodies come in two shapes: a one-shot [`BodyReader`] consumed once,
//! and a [`BodyFactory`] producing a fresh reader on every call. Only the latter
//! can be replayed (redirects, user retry middlewares).

use crate::error::{BoxError, HttpError};
use bytes::Bytes;
use futures_util::TryStreamExt;
use http_body::{Body, Frame, SizeHint};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, StreamBody};
use std::fmt;
use std::io::Cursor;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::AsyncRead;
use tokio_util::io::ReaderStream;

/// One-shot readable request payload.
pub type BodyReader = Pin<Box<dyn AsyncRead + Send>>;

/// Produces a fresh, independent [`BodyReader`] on each call.
pub type BodyFactory = Arc<dyn Fn() -> Result<BodyReader, HttpError> + Send + Sync>;

/// Wrap a closure as a [`BodyFactory`].
pub fn body_factory<F>(f: F) -> BodyFactory
where
    F: Fn() -> Result<BodyReader, HttpError> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Reader over an in-memory buffer.
#[must_use]
pub fn bytes_reader(bytes: Bytes) -> BodyReader {
    Box::pin(Cursor::new(bytes))
}

/// Factory yielding readers over the same buffer; `Bytes` clones share storage.
#[must_use]
pub fn bytes_factory(bytes: Bytes) -> BodyFactory {
    Arc::new(move || Ok(bytes_reader(bytes.clone())))
}

/// A one-shot body together with its length when known up front.
pub struct OneShotBody {
    pub(crate) reader: BodyReader,
    pub(crate) len: Option<u64>,
}

impl OneShotBody {
    /// Body of unknown length.
    pub fn new(reader: impl AsyncRead + Send + 'static) -> Self {
        Self {
            reader: Box::pin(reader),
            len: None,
        }
    }

    /// Body whose length is known; it becomes the request's `Content-Length`.
    pub fn with_len(reader: impl AsyncRead + Send + 'static, len: u64) -> Self {
        Self {
            reader: Box::pin(reader),
            len: Some(len),
        }
    }

    /// Length hint, if any.
    #[must_use]
    pub fn len_hint(&self) -> Option<u64> {
        self.len
    }
}

impl fmt::Debug for OneShotBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OneShotBody").field("len", &self.len).finish_non_exhaustive()
    }
}

impl From<Bytes> for OneShotBody {
    fn from(bytes: Bytes) -> Self {
        let len = bytes.len() as u64;
        Self {
            reader: bytes_reader(bytes),
            len: Some(len),
        }
    }
}

impl From<Vec<u8>> for OneShotBody {
    fn from(v: Vec<u8>) -> Self {
        Bytes::from(v).into()
    }
}

impl From<String> for OneShotBody {
    fn from(s: String) -> Self {
        Bytes::from(s).into()
    }
}

impl From<&'static str> for OneShotBody {
    fn from(s: &'static str) -> Self {
        Bytes::from_static(s.as_bytes()).into()
    }
}

fn reader_body(reader: BodyReader) -> UnsyncBoxBody<Bytes, BoxError> {
    let frames = ReaderStream::new(reader)
        .map_ok(Frame::data)
        .map_err(BoxError::from);
    StreamBody::new(frames).boxed_unsync()
}

enum Kind {
    Empty,
    Streaming(UnsyncBoxBody<Bytes, BoxError>),
    Deferred(BodyFactory),
}

/// Body handed to the transport.
///
/// A factory-backed body opens its reader on first poll and can be re-created
/// with [`RequestBody::try_clone`]; a reader-backed body cannot.
pub struct RequestBody {
    kind: Kind,
    len: Option<u64>,
    factory: Option<BodyFactory>,
}

impl RequestBody {
    /// Body with no payload.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            kind: Kind::Empty,
            len: Some(0),
            factory: None,
        }
    }

    /// Single-use body streaming from `reader`.
    #[must_use]
    pub fn from_reader(reader: BodyReader, len: Option<u64>) -> Self {
        Self {
            kind: Kind::Streaming(reader_body(reader)),
            len,
            factory: None,
        }
    }

    /// Replayable body; `factory` is not called until the body is polled.
    #[must_use]
    pub fn from_factory(factory: BodyFactory, len: Option<u64>) -> Self {
        Self {
            kind: Kind::Deferred(Arc::clone(&factory)),
            len,
            factory: Some(factory),
        }
    }

    /// Fresh copy of a factory-backed body; `None` for one-shot bodies.
    #[must_use]
    pub fn try_clone(&self) -> Option<Self> {
        match (&self.kind, &self.factory) {
            (Kind::Empty, _) => Some(Self::empty()),
            (_, Some(factory)) => Some(Self::from_factory(Arc::clone(factory), self.len)),
            (_, None) => None,
        }
    }

    /// Declared length of the payload, if known.
    #[must_use]
    pub fn content_length(&self) -> Option<u64> {
        self.len
    }

    /// Whether the body carries no payload at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        matches!(self.kind, Kind::Empty)
    }
}

impl Default for RequestBody {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for RequestBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            Kind::Empty => "empty",
            Kind::Streaming(_) => "streaming",
            Kind::Deferred(_) => "deferred",
        };
        f.debug_struct("RequestBody")
            .field("kind", &kind)
            .field("len", &self.len)
            .field("replayable", &self.factory.is_some())
            .finish()
    }
}

impl Body for RequestBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        loop {
            let opened = match &mut this.kind {
                Kind::Empty => return Poll::Ready(None),
                Kind::Streaming(body) => return Pin::new(body).poll_frame(cx),
                Kind::Deferred(factory) => factory(),
            };
            match opened {
                Ok(reader) => this.kind = Kind::Streaming(reader_body(reader)),
                Err(err) => {
                    this.kind = Kind::Empty;
                    return Poll::Ready(Some(Err(Box::new(err))));
                }
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        match &self.kind {
            Kind::Empty => true,
            Kind::Streaming(body) => body.is_end_stream(),
            Kind::Deferred(_) => self.len == Some(0),
        }
    }

    fn size_hint(&self) -> SizeHint {
        match (&self.kind, self.len) {
            (Kind::Empty, _) => SizeHint::with_exact(0),
            (_, Some(len)) => SizeHint::with_exact(len),
            (Kind::Streaming(body), None) => body.size_hint(),
            (Kind::Deferred(_), None) => SizeHint::default(),
        }
    }
}
