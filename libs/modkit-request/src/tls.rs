//! HTTPS connector construction.
//!
//! Native root certificates are loaded from the OS store once per process;
//! later transports reuse the cached set.

use crate::config::TlsRootConfig;
use crate::error::HttpError;
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use rustls_pki_types::CertificateDer;
use std::sync::{Arc, OnceLock};

static NATIVE_ROOTS: OnceLock<Vec<CertificateDer<'static>>> = OnceLock::new();

#[cfg(test)]
static NATIVE_LOADS: std::sync::atomic::AtomicUsize = std::sync::atomic::AtomicUsize::new(0);

fn load_native_roots() -> Vec<CertificateDer<'static>> {
    #[cfg(test)]
    NATIVE_LOADS.fetch_add(1, std::sync::atomic::Ordering::SeqCst);

    let loaded = rustls_native_certs::load_native_certs();
    for err in &loaded.errors {
        tracing::warn!(error = %err, "failed to load a native root certificate");
    }
    if loaded.certs.is_empty() {
        tracing::warn!("OS certificate store returned no root certificates");
    } else {
        tracing::debug!(count = loaded.certs.len(), "loaded native root certificates");
    }
    loaded.certs
}

/// Cached native roots; empty when the OS store has none.
pub fn native_roots() -> &'static [CertificateDer<'static>] {
    NATIVE_ROOTS.get_or_init(load_native_roots).as_slice()
}

/// Process-wide crypto provider if one is installed, otherwise a private aws-lc-rs one.
///
/// Never installs a global default.
pub fn crypto_provider() -> Arc<rustls::crypto::CryptoProvider> {
    rustls::crypto::CryptoProvider::get_default()
        .cloned()
        .unwrap_or_else(|| Arc::new(rustls::crypto::aws_lc_rs::default_provider()))
}

fn native_client_config() -> Result<rustls::ClientConfig, HttpError> {
    let certs = native_roots();
    if certs.is_empty() {
        return Err(HttpError::tls(
            "no native root CA certificates found in OS certificate store",
        ));
    }

    let mut store = rustls::RootCertStore::empty();
    let (added, ignored) = store.add_parsable_certificates(certs.iter().cloned());
    if ignored > 0 {
        tracing::warn!(added, ignored, "some native root certificates could not be parsed");
    }
    if added == 0 {
        return Err(HttpError::tls(format!(
            "none of the {} native root certificates could be parsed",
            certs.len()
        )));
    }

    let config = rustls::ClientConfig::builder_with_provider(crypto_provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| HttpError::Tls(Arc::new(e)))?
        .with_root_certificates(store)
        .with_no_client_auth();
    Ok(config)
}

/// Build a connector speaking both `http://` and `https://` (h2 or http/1.1 via ALPN).
///
/// # Errors
///
/// Returns `HttpError::Tls` when the selected root store cannot be initialised.
pub fn https_connector(roots: TlsRootConfig) -> Result<HttpsConnector<HttpConnector>, HttpError> {
    let connector = match roots {
        TlsRootConfig::WebPki => hyper_rustls::HttpsConnectorBuilder::new()
            .with_provider_and_webpki_roots(crypto_provider())
            .map_err(|e| HttpError::Tls(Arc::new(e)))?
            .https_or_http()
            .enable_all_versions()
            .build(),
        TlsRootConfig::Native => hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(native_client_config()?)
            .https_or_http()
            .enable_all_versions()
            .build(),
    };
    Ok(connector)
}
