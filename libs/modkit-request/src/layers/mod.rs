//! Tower layers wrapped around every transport round trip
//!
//! - [`RequestDefaultsLayer`] - fills in `User-Agent` and `Content-Length`
//! - [`RedirectPolicy`] - redirect policy driven by [`RedirectConfig`](crate::RedirectConfig)

mod defaults;
mod redirect;

pub(crate) use defaults::RequestDefaultsLayer;
pub use redirect::RedirectPolicy;
