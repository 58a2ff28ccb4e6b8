//! Bridge between context-level option bags and the pipeline.
//!
//! [`with_options_middleware`] moves options set on a dispatcher or builder
//! into the request context. The `prepare_*` middlewares of each family read
//! them back with [`get_options`](crate::get_options) and apply them right
//! before the transport leaf; [`prepare_tail`] lists them in the order the
//! dispatcher installs them.

use super::client::prepare_client_middleware;
use super::cookie::prepare_cookie_middleware;
use super::header::prepare_header_middleware;
use super::url::prepare_url_middleware;
use crate::context::{ContextKey, OptionMutator, with_options};
use crate::handler::{Middleware, identity, map_request};

/// Middleware appending `mutators` to the request context under `key`.
///
/// An empty list yields a pass-through.
pub fn with_options_middleware<T>(
    key: &ContextKey<T>,
    mutators: impl IntoIterator<Item = OptionMutator<T>>,
) -> Middleware
where
    T: 'static,
{
    let mutators: Vec<OptionMutator<T>> = mutators.into_iter().collect();
    if mutators.is_empty() {
        return identity();
    }
    let key = *key;
    map_request(move |req| {
        req.context = with_options(&key, Some(&req.context), mutators.iter().cloned());
        Ok(())
    })
}

/// The `prepare_*` middlewares of every built-in option family.
#[must_use]
pub fn prepare_tail() -> Vec<Middleware> {
    vec![
        prepare_url_middleware(),
        prepare_header_middleware(),
        prepare_cookie_middleware(),
        prepare_client_middleware(),
    ]
}
