use crate::handler::{Middleware, map_request};
use std::collections::BTreeMap;
use std::sync::Arc;
use url::{Url, form_urlencoded};

/// Decoded query string as a multi-map.
///
/// Keys encode in sorted order; values of one key keep their order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryValues(BTreeMap<String, Vec<String>>);

impl QueryValues {
    /// Decode the query of `url`.
    #[must_use]
    pub fn from_url(url: &Url) -> Self {
        let mut values = Self::default();
        for (k, v) in url.query_pairs() {
            values.add(k, v);
        }
        values
    }

    /// First value of `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|v| v.first()).map(String::as_str)
    }

    /// Every value of `key`.
    #[must_use]
    pub fn get_all(&self, key: &str) -> &[String] {
        self.0.get(key).map_or(&[][..], Vec::as_slice)
    }

    /// Replace the values of `key`.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), vec![value.into()]);
    }

    /// Append a value to `key`.
    pub fn add(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.entry(key.into()).or_default().push(value.into());
    }

    /// Remove `key`.
    pub fn del(&mut self, key: &str) {
        self.0.remove(key);
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// `application/x-www-form-urlencoded` encoding.
    #[must_use]
    pub fn encode(&self) -> String {
        let mut serializer = form_urlencoded::Serializer::new(String::new());
        for (key, values) in &self.0 {
            for value in values {
                serializer.append_pair(key, value);
            }
        }
        serializer.finish()
    }

    /// Write these values back as the query of `url`.
    pub fn apply_to(&self, url: &mut Url) {
        if self.is_empty() {
            url.set_query(None);
        } else {
            url.set_query(Some(&self.encode()));
        }
    }
}

/// Mutation of the decoded query.
pub type QueryFn = Arc<dyn Fn(&mut QueryValues) + Send + Sync>;

/// Decode the request query, apply `funcs` in order, re-encode.
pub fn query_funcs(funcs: impl IntoIterator<Item = QueryFn>) -> Middleware {
    let funcs: Arc<[QueryFn]> = funcs.into_iter().collect();
    map_request(move |req| {
        let mut values = QueryValues::from_url(&req.url);
        for f in funcs.iter() {
            f(&mut values);
        }
        values.apply_to(&mut req.url);
        Ok(())
    })
}

/// [`QueryFn`] replacing the values of `key`.
pub fn set_query(key: impl Into<String>, value: impl Into<String>) -> QueryFn {
    let (key, value) = (key.into(), value.into());
    Arc::new(move |q: &mut QueryValues| q.set(key.clone(), value.clone()))
}

/// [`QueryFn`] appending a value to `key`.
pub fn add_query(key: impl Into<String>, value: impl Into<String>) -> QueryFn {
    let (key, value) = (key.into(), value.into());
    Arc::new(move |q: &mut QueryValues| q.add(key.clone(), value.clone()))
}

/// [`QueryFn`] removing `key`.
pub fn del_query(key: impl Into<String>) -> QueryFn {
    let key = key.into();
    Arc::new(move |q: &mut QueryValues| q.del(&key))
}
