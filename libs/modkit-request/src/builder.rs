use crate::body::RequestBody;
use crate::config::{RedirectConfig, TlsRootConfig, TransportConfig};
use crate::error::HttpError;
use crate::tls;
use crate::transport::{HttpTransport, HyperRoundTripper, RoundTripper};
use http::HeaderValue;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioTimer};
use std::sync::Arc;
use std::time::Duration;

/// Builder for an [`HttpTransport`].
///
/// ```ignore
/// let transport = HttpTransport::builder()
///     .timeout(Duration::from_secs(5))
///     .user_agent("billing-sync/1.4")
///     .build()?;
/// let dispatcher = Dispatcher::with_transport(transport);
/// ```
pub struct TransportBuilder {
    config: TransportConfig,
    round_tripper: Option<Arc<dyn RoundTripper>>,
}

impl TransportBuilder {
    /// Create a new builder with default configuration
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(TransportConfig::default())
    }

    /// Create a builder with a specific configuration
    #[must_use]
    pub fn with_config(config: TransportConfig) -> Self {
        Self {
            config,
            round_tripper: None,
        }
    }

    /// Set the round-trip timeout
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = Some(timeout);
        self
    }

    /// Wait for responses indefinitely
    #[must_use]
    pub fn no_timeout(mut self) -> Self {
        self.config.timeout = None;
        self
    }

    /// Set the redirect policy
    #[must_use]
    pub fn redirect(mut self, config: RedirectConfig) -> Self {
        self.config.redirect = config;
        self
    }

    /// Set the TLS root certificate strategy
    #[must_use]
    pub fn tls_roots(mut self, roots: TlsRootConfig) -> Self {
        self.config.tls_roots = roots;
        self
    }

    /// Set the default user agent; an empty string disables it
    #[must_use]
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.config.user_agent = user_agent.into();
        self
    }

    /// Toggle transparent response decompression
    #[must_use]
    pub fn decompress(mut self, enabled: bool) -> Self {
        self.config.decompress = enabled;
        self
    }

    /// Use `round_tripper` instead of building a hyper client
    ///
    /// TLS settings are ignored in that case.
    #[must_use]
    pub fn round_tripper(mut self, round_tripper: Arc<dyn RoundTripper>) -> Self {
        self.round_tripper = Some(round_tripper);
        self
    }

    /// Build the transport handle
    ///
    /// # Errors
    /// Returns `HttpError::InvalidHeaderValue` for an unusable user agent and
    /// `HttpError::Tls` when the TLS stack cannot be initialised.
    pub fn build(self) -> Result<HttpTransport, HttpError> {
        let user_agent = if self.config.user_agent.is_empty() {
            None
        } else {
            Some(HeaderValue::try_from(self.config.user_agent.as_str())?)
        };

        let round_tripper = match self.round_tripper {
            Some(custom) => custom,
            None => {
                let https = tls::https_connector(self.config.tls_roots)?;
                let mut client_builder = Client::builder(TokioExecutor::new());
                // pool_timer drives idle connection eviction
                client_builder.pool_timer(TokioTimer::new()).http2_only(false);
                let client = client_builder.build::<_, RequestBody>(https);
                Arc::new(HyperRoundTripper::new(client))
            }
        };

        tracing::debug!(
            timeout = ?self.config.timeout,
            max_redirects = self.config.redirect.max_redirects,
            decompress = self.config.decompress,
            "transport built"
        );

        Ok(HttpTransport {
            round_tripper,
            timeout: self.config.timeout,
            redirect: self.config.redirect,
            user_agent,
            decompress: self.config.decompress,
        })
    }
}

impl Default for TransportBuilder {
    fn default() -> Self {
        Self::new()
    }
}
