use std::collections::HashSet;
use std::time::Duration;

/// Default User-Agent string for outgoing requests
pub const DEFAULT_USER_AGENT: &str = concat!("modkit-request/", env!("CARGO_PKG_VERSION"));

/// Default end-to-end timeout of a freshly constructed transport
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration for redirect behavior
///
/// Controls how the transport handles 3xx redirect responses.
///
/// ## Security Features
///
/// - **Same-origin enforcement**: By default, only follows redirects to the same host
/// - **Header stripping**: Removes `Authorization`, `Cookie` on cross-origin redirects
/// - **Downgrade protection**: Blocks HTTPS → HTTP redirects
/// - **Host allow-list**: Configurable list of trusted redirect targets
///
/// ## Example
///
/// ```rust,ignore
/// use modkit_request::{RedirectConfig, middleware::client_fn};
///
/// // Follow cross-origin redirects for this request only
/// let resp = dispatcher
///     .new_request()
///     .client_funcs([client_fn(|t| t.redirect = RedirectConfig::permissive())])
///     .get("http://example.com/moved")
///     .await;
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirectConfig {
    /// Maximum number of redirects to follow (default: 10)
    ///
    /// Set to `0` to disable redirect following entirely.
    pub max_redirects: usize,

    /// Only allow same-origin redirects (default: true)
    ///
    /// When `true`, redirects to different hosts are blocked unless the target
    /// host is in `allowed_redirect_hosts`.
    pub same_origin_only: bool,

    /// Hosts that are allowed as redirect targets even when `same_origin_only` is true
    ///
    /// Entries are hostnames only, without scheme or port.
    pub allowed_redirect_hosts: HashSet<String>,

    /// Strip sensitive headers on cross-origin redirects (default: true)
    ///
    /// Removes `Authorization`, `Cookie` and `Proxy-Authorization`.
    pub strip_sensitive_headers: bool,

    /// Allow HTTPS → HTTP downgrades (default: false)
    pub allow_https_downgrade: bool,
}

impl Default for RedirectConfig {
    fn default() -> Self {
        Self {
            max_redirects: 10,
            same_origin_only: true,
            allowed_redirect_hosts: HashSet::new(),
            strip_sensitive_headers: true,
            allow_https_downgrade: false,
        }
    }
}

impl RedirectConfig {
    /// Allow all redirects, still stripping credentials on cross-origin hops
    ///
    /// HTTPS → HTTP downgrades stay blocked.
    #[must_use]
    pub fn permissive() -> Self {
        Self {
            same_origin_only: false,
            ..Default::default()
        }
    }

    /// Disable redirect following; 3xx responses are returned as-is
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            max_redirects: 0,
            ..Default::default()
        }
    }

    /// Permissive policy that also allows downgrades (local mock servers only)
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            same_origin_only: false,
            allow_https_downgrade: true,
            ..Default::default()
        }
    }
}

/// TLS root certificate configuration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[non_exhaustive]
pub enum TlsRootConfig {
    /// Use Mozilla's root certificates (webpki-roots, no OS dependency)
    #[default]
    WebPki,
    /// Use OS native root certificate store
    Native,
}

/// Configuration of a transport handle built by
/// [`TransportBuilder`](crate::TransportBuilder)
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// End-to-end timeout of one round trip, redirects included (default: 30 seconds)
    ///
    /// `None` disables the timeout.
    pub timeout: Option<Duration>,

    /// Redirect policy (default: same-origin only with header stripping)
    pub redirect: RedirectConfig,

    /// TLS root certificate strategy (default: `WebPki`)
    pub tls_roots: TlsRootConfig,

    /// User-Agent applied when a request does not set one
    pub user_agent: String,

    /// Transparently decompress gzip/br/deflate responses (default: true)
    pub decompress: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            timeout: Some(DEFAULT_TIMEOUT),
            redirect: RedirectConfig::default(),
            tls_roots: TlsRootConfig::default(),
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            decompress: true,
        }
    }
}

impl TransportConfig {
    /// Short timeout and no redirects, for health probes and internal calls
    #[must_use]
    pub fn minimal() -> Self {
        Self {
            timeout: Some(Duration::from_secs(10)),
            redirect: RedirectConfig::disabled(),
            ..Default::default()
        }
    }

    /// No timeout, for long-lived streaming responses
    ///
    /// Cancellation is expected to come from the request context instead.
    #[must_use]
    pub fn streaming() -> Self {
        Self {
            timeout: None,
            ..Default::default()
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn test_transport_config_default() {
        let config = TransportConfig::default();
        assert_eq!(config.timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.user_agent, DEFAULT_USER_AGENT);
        assert_eq!(config.tls_roots, TlsRootConfig::WebPki);
        assert_eq!(config.redirect, RedirectConfig::default());
        assert!(config.decompress);
    }

    #[test]
    fn test_transport_config_minimal() {
        let config = TransportConfig::minimal();
        assert_eq!(config.timeout, Some(Duration::from_secs(10)));
        assert_eq!(config.redirect.max_redirects, 0);
    }

    #[test]
    fn test_transport_config_streaming() {
        let config = TransportConfig::streaming();
        assert!(config.timeout.is_none());
    }

    #[test]
    fn test_default_user_agent_format() {
        assert!(DEFAULT_USER_AGENT.starts_with("modkit-request/"));
    }

    #[test]
    fn test_redirect_config_presets() {
        let default = RedirectConfig::default();
        assert_eq!(default.max_redirects, 10);
        assert!(default.same_origin_only);
        assert!(default.strip_sensitive_headers);
        assert!(!default.allow_https_downgrade);

        let permissive = RedirectConfig::permissive();
        assert!(!permissive.same_origin_only);
        assert!(!permissive.allow_https_downgrade);

        assert_eq!(RedirectConfig::disabled().max_redirects, 0);

        let testing = RedirectConfig::for_testing();
        assert!(testing.allow_https_downgrade);
        assert!(testing.strip_sensitive_headers);
    }
}
