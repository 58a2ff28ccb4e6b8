#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![warn(warnings)]

//! Composable HTTP request pipeline for `ModKit`
//!
//! A [`Dispatcher`] owns a shared [`HttpTransport`] and a list of
//! middlewares; a [`RequestBuilder`] adds request-scoped middlewares and sends.
//! Every send composes a fresh pipeline:
//!
//! ```text
//! dispatcher middlewares → request middlewares → option bags → transport
//! ```
//!
//! - A [`Middleware`] wraps a [`Handler`]; the first one added runs outermost
//! - Bodies are either one-shot readers or replayable factories; the JSON, XML,
//!   form and bytes helpers always produce factories
//! - Multipart bodies stream from a producer task and report field failures
//!   back to the caller
//! - Options can travel on the [`RequestContext`] under typed keys and are
//!   applied right before the transport
//! - A [`Response`] is returned for every send, failures included, and can
//!   always be closed
//!
//! The transport is hyper over rustls, with per-request timeouts, a
//! same-origin redirect policy and transparent gzip/br/deflate decoding.
//!
//! # Example
//!
//! ```ignore
//! use modkit_request::{Dispatcher, middleware::set_header};
//! use std::time::Duration;
//!
//! let dispatcher = Dispatcher::new()?;
//! dispatcher.use_middleware(set_header("x-client", "billing"));
//!
//! let mut resp = dispatcher
//!     .new_request()
//!     .timeout(Duration::from_secs(5))
//!     .json(serde_json::json!({"name": "John", "value": 123}))
//!     .post("http://127.0.0.1:8080/items")
//!     .await;
//!
//! if let Some(err) = resp.error() {
//!     tracing::warn!(error = %err, "create failed");
//! }
//! let created: Option<Item> = resp.json().await?;
//! resp.close().await?;
//! ```

mod body;
mod builder;
mod config;
mod context;
mod dispatcher;
mod error;
mod handler;
mod layers;
pub mod middleware;
mod outgoing;
pub mod pool;
mod request;
mod response;
mod tls;
mod transport;

pub use body::{BodyFactory, BodyReader, OneShotBody, RequestBody, body_factory, bytes_factory, bytes_reader};
pub use builder::TransportBuilder;
pub use config::{
    DEFAULT_TIMEOUT, DEFAULT_USER_AGENT, RedirectConfig, TlsRootConfig, TransportConfig,
};
pub use context::{ContextKey, OptionMutator, RequestContext, get_options, option_fn, with_options};
pub use dispatcher::Dispatcher;
pub use error::{BoxError, HttpError, InvalidUriKind, ResponseError, SharedError};
pub use handler::{
    Handler, HandlerFuture, HandlerResult, Middleware, RequestFn, compose, from_fn, handler_fn,
    identity, map_request, request_funcs,
};
pub use layers::RedirectPolicy;
pub use outgoing::OutgoingRequest;
pub use request::RequestBuilder;
pub use response::{Response, ResponseBody};
pub use transport::{HttpTransport, HyperRoundTripper, RoundTripper, round_trip_handler, round_tripper_fn};

// Re-export for downstream middlewares and tests
pub use http::{HeaderMap, HeaderValue, Method, StatusCode};
pub use tokio_util::sync::CancellationToken;
