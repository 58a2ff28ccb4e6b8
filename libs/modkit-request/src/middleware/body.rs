//! Body middlewares.
//!
//! [`body`] attaches a one-shot reader. Everything else funnels through a
//! [`BodyFactory`] so the payload can be replayed by redirects and retry
//! middlewares: [`body_get`] takes a caller factory, [`body_get_bytes`]
//! materializes bytes once per send and replays them, and the encoders
//! ([`json`], [`xml`], [`form`]) build on [`body_get_bytes`].

use crate::body::{BodyFactory, OneShotBody, bytes_factory};
use crate::error::HttpError;
use crate::handler::{Middleware, identity, map_request};
use crate::outgoing::OutgoingRequest;
use crate::pool;
use bytes::{BufMut, Bytes};
use http::HeaderValue;
use http::header::CONTENT_TYPE;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;

pub const JSON_CONTENT_TYPE: &str = "application/json";
pub const XML_CONTENT_TYPE: &str = "application/xml";
pub const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

/// Produces the whole payload in memory; invoked once per send.
pub type BytesFactory = Arc<dyn Fn() -> Result<Bytes, HttpError> + Send + Sync>;

/// Options shared by the body middlewares.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BodyOptions {
    /// `Content-Type` to set alongside the body
    pub content_type: Option<String>,
}

impl BodyOptions {
    #[must_use]
    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    fn apply(&self, req: &mut OutgoingRequest) -> Result<(), HttpError> {
        if let Some(content_type) = &self.content_type {
            req.headers
                .insert(CONTENT_TYPE, HeaderValue::try_from(content_type.as_str())?);
        }
        Ok(())
    }
}

/// Attach a one-shot body.
///
/// The reader is consumed by the first send; later sends through the same
/// builder go out without a body. `None` is a no-op.
pub fn body(reader: Option<OneShotBody>, opts: BodyOptions) -> Middleware {
    let Some(reader) = reader else {
        return identity();
    };
    let slot = Mutex::new(Some(reader));
    map_request(move |req| {
        if let Some(OneShotBody { reader, len }) = slot.lock().take() {
            req.set_body(reader, len);
            opts.apply(req)?;
        }
        Ok(())
    })
}

/// Attach a replayable body. The factory is not invoked here. `None` is a no-op.
pub fn body_get(factory: Option<BodyFactory>, opts: BodyOptions) -> Middleware {
    let Some(factory) = factory else {
        return identity();
    };
    map_request(move |req| {
        req.set_body_factory(Arc::clone(&factory), None);
        opts.apply(req)
    })
}

/// Materialize the payload when the request enters the pipeline and attach a
/// factory replaying it, with `Content-Length` set.
///
/// An error from `factory` aborts the send.
pub fn body_get_bytes(factory: BytesFactory, opts: BodyOptions) -> Middleware {
    map_request(move |req| {
        let payload = factory()?;
        let len = payload.len() as u64;
        req.set_body_factory(bytes_factory(payload), Some(len));
        opts.apply(req)
    })
}

/// Payload given either pre-encoded or as a value to encode.
enum Payload<T> {
    Raw(Bytes),
    Value(T),
}

fn encoded<T, E>(payload: Payload<T>, content_type: &str, encode: E) -> Middleware
where
    T: Send + Sync + 'static,
    E: Fn(&T) -> Result<Bytes, HttpError> + Send + Sync + 'static,
{
    let opts = BodyOptions::default().content_type(content_type);
    let factory: BytesFactory = match payload {
        Payload::Raw(bytes) => Arc::new(move || Ok(bytes.clone())),
        Payload::Value(value) => Arc::new(move || encode(&value)),
    };
    body_get_bytes(factory, opts)
}

fn encode_json<T: Serialize>(value: &T) -> Result<Bytes, HttpError> {
    let mut buf = pool::get();
    serde_json::to_writer((&mut *buf).writer(), value)?;
    Ok(Bytes::copy_from_slice(&buf))
}

fn encode_xml<T: Serialize>(value: &T) -> Result<Bytes, HttpError> {
    let mut buf = pool::get();
    quick_xml::se::to_writer(&mut *buf, value).map_err(|e| HttpError::Xml(Arc::new(e)))?;
    Ok(Bytes::copy_from_slice(&buf))
}

fn encode_form<T: Serialize>(value: &T) -> Result<Bytes, HttpError> {
    Ok(Bytes::from(serde_urlencoded::to_string(value)?))
}

/// JSON-encode `value` as the body (`application/json`).
pub fn json<T>(value: T) -> Middleware
where
    T: Serialize + Send + Sync + 'static,
{
    encoded(Payload::Value(value), JSON_CONTENT_TYPE, encode_json::<T>)
}

/// Send already-encoded JSON as is.
pub fn json_raw(payload: impl Into<Bytes>) -> Middleware {
    encoded::<(), _>(Payload::Raw(payload.into()), JSON_CONTENT_TYPE, encode_json)
}

/// XML-encode `value` as the body (`application/xml`).
pub fn xml<T>(value: T) -> Middleware
where
    T: Serialize + Send + Sync + 'static,
{
    encoded(Payload::Value(value), XML_CONTENT_TYPE, encode_xml::<T>)
}

/// Send an already-encoded XML document as is.
pub fn xml_raw(payload: impl Into<Bytes>) -> Middleware {
    encoded::<(), _>(Payload::Raw(payload.into()), XML_CONTENT_TYPE, encode_xml)
}

/// URL-encode `value` as the body (`application/x-www-form-urlencoded`).
///
/// `value` is anything `serde_urlencoded` accepts: a struct, a map, or a
/// sequence of pairs (repeated keys are kept).
pub fn form<T>(value: T) -> Middleware
where
    T: Serialize + Send + Sync + 'static,
{
    encoded(Payload::Value(value), FORM_CONTENT_TYPE, encode_form::<T>)
}

/// Send an already-encoded form as is.
pub fn form_raw(payload: impl Into<Bytes>) -> Middleware {
    encoded::<(), _>(Payload::Raw(payload.into()), FORM_CONTENT_TYPE, encode_form)
}
