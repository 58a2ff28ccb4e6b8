//! URL rewriting: base URL, `{name}` path parameters, query parameters.
//!
//! Path parameter values are percent-encoded before substitution, so a value
//! like `a/b` stays a single path segment. Placeholders with no value stay in
//! the URL in their percent-encoded form (`%7Bname%7D`).

use crate::context::{ContextKey, OptionMutator, get_options};
use crate::error::HttpError;
use crate::handler::{Middleware, map_request};
use crate::outgoing::parse_url;
use std::sync::Arc;
use url::Url;

/// URL rewrites accumulated before being applied to a request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UrlOptions {
    /// Replaces scheme, host and port; its path is prefixed to the request path
    pub base_url: Option<String>,
    /// `{name}` substitutions, applied in order
    pub path_params: Vec<(String, String)>,
    /// Query parameters; a key listed here replaces the request's values for it
    pub query_params: Vec<(String, String)>,
}

impl UrlOptions {
    /// Rewrite `url` in place.
    ///
    /// # Errors
    /// Returns `HttpError::InvalidRequest` when the base URL does not parse.
    pub fn apply(&self, url: &mut Url) -> Result<(), HttpError> {
        if let Some(base) = &self.base_url {
            *url = rebase(&parse_url(base)?, url);
        }
        if !self.path_params.is_empty() {
            let path = substitute(url.path(), &self.path_params);
            url.set_path(&path);
        }
        if !self.query_params.is_empty() {
            let kept: Vec<(String, String)> = url
                .query_pairs()
                .filter(|(k, _)| self.query_params.iter().all(|(key, _)| key != k))
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect();
            let mut pairs = url.query_pairs_mut();
            pairs.clear();
            pairs.extend_pairs(kept.iter().chain(&self.query_params));
        }
        Ok(())
    }
}

fn rebase(base: &Url, url: &Url) -> Url {
    let prefix = match base.path() {
        "/" => "",
        p => p.trim_end_matches('/'),
    };
    let mut rebased = base.clone();
    rebased.set_path(&format!("{prefix}{}", url.path()));
    rebased.set_query(url.query().or(base.query()));
    rebased.set_fragment(url.fragment());
    rebased
}

fn substitute(path: &str, params: &[(String, String)]) -> String {
    params.iter().fold(path.to_owned(), |acc, (name, value)| {
        let encoded = urlencoding::encode(value);
        acc.replace(&format!("{{{name}}}"), &encoded)
            .replace(&format!("%7B{name}%7D"), &encoded)
    })
}

/// URL options carried on the request context.
pub static URL_OPTIONS: ContextKey<UrlOptions> = ContextKey::new("modkit_request.url");

/// Apply URL option mutators to the request URL directly.
pub fn url_funcs(funcs: impl IntoIterator<Item = OptionMutator<UrlOptions>>) -> Middleware {
    let funcs: Arc<[OptionMutator<UrlOptions>]> = funcs.into_iter().collect();
    map_request(move |req| {
        let mut options = UrlOptions::default();
        for f in funcs.iter() {
            f(&mut options);
        }
        options.apply(&mut req.url)
    })
}

/// Option setting the base URL.
pub fn base_url(base: impl Into<String>) -> OptionMutator<UrlOptions> {
    let base = base.into();
    Arc::new(move |o: &mut UrlOptions| o.base_url = Some(base.clone()))
}

/// Option substituting `{name}` with `value`.
pub fn path_param(name: impl Into<String>, value: impl Into<String>) -> OptionMutator<UrlOptions> {
    let pair = (name.into(), value.into());
    Arc::new(move |o: &mut UrlOptions| o.path_params.push(pair.clone()))
}

/// Option substituting several placeholders.
pub fn path_params<K, V>(params: impl IntoIterator<Item = (K, V)>) -> OptionMutator<UrlOptions>
where
    K: Into<String>,
    V: Into<String>,
{
    let pairs: Vec<(String, String)> = params
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect();
    Arc::new(move |o: &mut UrlOptions| o.path_params.extend(pairs.iter().cloned()))
}

/// Option adding a query parameter.
pub fn query_param(key: impl Into<String>, value: impl Into<String>) -> OptionMutator<UrlOptions> {
    let pair = (key.into(), value.into());
    Arc::new(move |o: &mut UrlOptions| o.query_params.push(pair.clone()))
}

/// Apply [`URL_OPTIONS`] from the request context.
#[must_use]
pub fn prepare_url_middleware() -> Middleware {
    map_request(|req| match get_options(&URL_OPTIONS, req, UrlOptions::default) {
        Some(options) => options.apply(&mut req.url),
        None => Ok(()),
    })
}
