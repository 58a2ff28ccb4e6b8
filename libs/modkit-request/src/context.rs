//! Request context and the typed option bags it carries.
//!
//! A [`RequestContext`] travels with every [`OutgoingRequest`] through the
//! pipeline. Besides cancellation it holds, per option family, an ordered list
//! of mutators keyed by a typed [`ContextKey`]. Lists are append-only: adding
//! options always produces a new context and never touches the list stored in
//! an earlier one.
//!
//! ```ignore
//! let ctx = with_options(&HEADER_OPTIONS, None, [header_option("x-tenant", "acme")?]);
//! let resp = dispatcher.new_request().get_ctx(Some(ctx), "http://svc/items").await;
//! ```

use crate::outgoing::OutgoingRequest;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// A single option mutator of family `T`.
pub type OptionMutator<T> = Arc<dyn Fn(&mut T) + Send + Sync>;

/// Wrap a closure as an [`OptionMutator`].
pub fn option_fn<T, F>(f: F) -> OptionMutator<T>
where
    F: Fn(&mut T) + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Typed key of one option family.
///
/// The key is identified by its option type together with its name, so two
/// families may share an option type as long as their names differ.
pub struct ContextKey<T> {
    name: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T> ContextKey<T> {
    /// Declare a key.
    #[must_use]
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _marker: PhantomData,
        }
    }

    /// Key name, for diagnostics.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }
}

impl<T: 'static> ContextKey<T> {
    fn slot(&self) -> Slot {
        (TypeId::of::<T>(), self.name)
    }
}

impl<T> Clone for ContextKey<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for ContextKey<T> {}

impl<T> fmt::Debug for ContextKey<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextKey").field("name", &self.name).finish()
    }
}

type Slot = (TypeId, &'static str);

/// Per-request carrier of cancellation and option bags.
///
/// Cloning is cheap; clones share the cancellation token and the stored option
/// lists.
#[derive(Clone, Default)]
pub struct RequestContext {
    cancel: CancellationToken,
    values: Arc<HashMap<Slot, Arc<dyn Any + Send + Sync>>>,
}

impl RequestContext {
    /// Fresh context with no options and a token nobody else holds.
    #[must_use]
    pub fn background() -> Self {
        Self::default()
    }

    /// Context cancelled together with `token`.
    #[must_use]
    pub fn with_cancellation(token: CancellationToken) -> Self {
        Self {
            cancel: token,
            values: Arc::default(),
        }
    }

    /// Derive a context whose cancellation is a child of this one.
    ///
    /// Cancelling the child does not cancel the parent. Options are shared.
    #[must_use]
    pub fn child(&self) -> Self {
        Self {
            cancel: self.cancel.child_token(),
            values: Arc::clone(&self.values),
        }
    }

    /// Cancel every in-flight request using this context.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether the context has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the context is cancelled.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }

    /// The underlying cancellation token.
    #[must_use]
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    fn mutators<T: 'static>(&self, key: &ContextKey<T>) -> Option<&Vec<OptionMutator<T>>> {
        self.values
            .get(&key.slot())
            .and_then(|value| value.downcast_ref::<Vec<OptionMutator<T>>>())
    }

    /// Number of mutators stored under `key`.
    #[must_use]
    pub fn option_count<T: 'static>(&self, key: &ContextKey<T>) -> usize {
        self.mutators(key).map_or(0, Vec::len)
    }
}

impl fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<&str> = self.values.keys().map(|(_, name)| *name).collect();
        keys.sort_unstable();
        f.debug_struct("RequestContext")
            .field("cancelled", &self.cancel.is_cancelled())
            .field("options", &keys)
            .finish()
    }
}

/// Append `mutators` to the list stored under `key`, returning a new context.
///
/// `ctx` is left untouched; `None` starts from a background context.
pub fn with_options<T, I>(key: &ContextKey<T>, ctx: Option<&RequestContext>, mutators: I) -> RequestContext
where
    T: 'static,
    I: IntoIterator<Item = OptionMutator<T>>,
{
    let base = ctx.cloned().unwrap_or_default();
    let mut list: Vec<OptionMutator<T>> = base.mutators(key).cloned().unwrap_or_default();
    list.extend(mutators);

    let mut values = (*base.values).clone();
    values.insert(key.slot(), Arc::new(list));

    RequestContext {
        cancel: base.cancel,
        values: Arc::new(values),
    }
}

/// Materialize the options stored under `key` on the request's context.
///
/// Returns `None` when nothing was ever stored under the key. Otherwise a
/// fresh value from `defaults` has every mutator applied in insertion order;
/// the result is private to the caller.
pub fn get_options<T, D>(key: &ContextKey<T>, req: &OutgoingRequest, defaults: D) -> Option<T>
where
    T: 'static,
    D: FnOnce() -> T,
{
    let mutators = req.context.mutators(key)?;
    let mut options = defaults();
    for mutator in mutators {
        mutator(&mut options);
    }
    Some(options)
}
