#![cfg_attr(docsrs, feature(doc_cfg))]
#![doc = include_str!("../README.md")]
#![warn(missing_docs)]

use rustls::client::WantsClientCert;
use rustls::pki_types::CertificateDer;
use rustls::{ClientConfig, ConfigBuilder, WantsVerifier};
use std::sync::Arc;

mod cache;
mod client;
mod error;
mod fetcher;
pub mod pem;
mod transport;
mod verification;

pub use cache::CertificateCache;
pub use client::PinnedHttpClient;
pub use error::{FetchError, HandshakeError, HttpClientError, TransportError};
pub use fetcher::{CertificateSource, TlsCertificateFetcher, HTTPS_PORT};
pub use transport::{pinned_tls_config, ReqwestTransport, Transport, TransportConfig};
pub use verification::{PeerVerification, PinnedVerifier, Verifier};

/// Fixtures and test suites for the fetcher, cache and client.
#[cfg(test)]
mod tests;

/// Extension trait to configure [`ClientConfig`]s that only trust pinned certificates.
pub trait BuilderPinningExt {
    /// Configures the `ClientConfig` with a [`PinnedVerifier`] for `pinned`.
    ///
    /// ```rust
    /// use rustls::ClientConfig;
    /// use rustls_pinned_client::BuilderPinningExt;
    /// # let pinned = rustls::pki_types::CertificateDer::from(vec![0x30, 0x00]);
    /// let provider = std::sync::Arc::new(rustls::crypto::ring::default_provider());
    /// let config = ClientConfig::builder_with_provider(provider)
    ///     .with_safe_default_protocol_versions()?
    ///     .with_pinned_certificates(vec![pinned])?
    ///     .with_no_client_auth();
    /// # Ok::<(), rustls::Error>(())
    /// ```
    ///
    /// # Errors
    ///
    /// Fails if `pinned` is empty.
    fn with_pinned_certificates(
        self,
        pinned: Vec<CertificateDer<'static>>,
    ) -> Result<ConfigBuilder<ClientConfig, WantsClientCert>, rustls::Error>;
}

impl BuilderPinningExt for ConfigBuilder<ClientConfig, WantsVerifier> {
    fn with_pinned_certificates(
        self,
        pinned: Vec<CertificateDer<'static>>,
    ) -> Result<ConfigBuilder<ClientConfig, WantsClientCert>, rustls::Error> {
        let provider = self.crypto_provider().clone();
        let verifier = PinnedVerifier::new(pinned, provider)?;
        Ok(self
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(verifier)))
    }
}

pub(crate) fn default_provider() -> Arc<rustls::crypto::CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}
