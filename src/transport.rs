use crate::error::TransportError;
use crate::verification::{PeerVerification, Verifier};
use crate::{default_provider, pem, BuilderPinningExt};
use http::{Request, Response};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::CertificateDer;
use rustls::ClientConfig;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

const MAX_REDIRECTS: usize = 10;

/// How a single request is to be sent.
///
/// A fresh value is built for every request, so requests to different domains
/// never share a trust anchor.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransportConfig {
    /// The PEM file whose certificates are the only ones trusted.
    pub trust_anchor: PathBuf,
    /// Whether the peer certificate is verified at all.
    pub verify_peer: bool,
    /// Whether redirects are followed.
    pub follow_redirects: bool,
}

impl TransportConfig {
    /// A configuration that verifies the peer against `trust_anchor` and follows redirects.
    pub fn pinned(trust_anchor: impl Into<PathBuf>) -> Self {
        Self {
            trust_anchor: trust_anchor.into(),
            verify_peer: true,
            follow_redirects: true,
        }
    }
}

/// Sends HTTP requests. This is the seam where any HTTP client can be plugged in.
pub trait Transport: Send + Sync {
    /// Sends `request`, trusting what `config` says to trust, and returns the response.
    fn send(
        &self,
        request: Request<Vec<u8>>,
        config: &TransportConfig,
    ) -> Result<Response<Vec<u8>>, TransportError>;
}

impl<T: Transport + ?Sized> Transport for Arc<T> {
    fn send(
        &self,
        request: Request<Vec<u8>>,
        config: &TransportConfig,
    ) -> Result<Response<Vec<u8>>, TransportError> {
        (**self).send(request, config)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ClientKey {
    pinned: Vec<CertificateDer<'static>>,
    verify_peer: bool,
    follow_redirects: bool,
}

/// A [`Transport`] backed by a blocking `reqwest` client using rustls.
///
/// The anchor file is re-read for every request. Clients are reused for as long
/// as the file's certificates stay the same. Built clients are kept for the life
/// of the transport, one per distinct anchor and flag combination.
#[derive(Debug)]
pub struct ReqwestTransport {
    provider: Arc<CryptoProvider>,
    clients: Mutex<HashMap<ClientKey, reqwest::blocking::Client>>,
}

impl Default for ReqwestTransport {
    fn default() -> Self {
        Self::with_provider(default_provider())
    }
}

impl ReqwestTransport {
    /// Creates a transport using rustls' `ring` provider.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a transport using the given [`CryptoProvider`].
    pub fn with_provider(provider: Arc<CryptoProvider>) -> Self {
        Self {
            provider,
            clients: Mutex::new(HashMap::new()),
        }
    }

    fn client_for(
        &self,
        config: &TransportConfig,
    ) -> Result<reqwest::blocking::Client, TransportError> {
        let key = ClientKey {
            pinned: pem::load_certificates(&config.trust_anchor).map_err(TransportError::new)?,
            verify_peer: config.verify_peer,
            follow_redirects: config.follow_redirects,
        };

        let mut clients = self.clients.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(client) = clients.get(&key) {
            return Ok(client.clone());
        }

        let tls = if key.verify_peer {
            pinned_config(key.pinned.clone(), Arc::clone(&self.provider))?
        } else {
            log::warn!("peer verification is disabled for {}", config.trust_anchor.display());
            let verifier = Verifier::new(PeerVerification::AcceptAny, Arc::clone(&self.provider));
            ClientConfig::builder_with_provider(Arc::clone(&self.provider))
                .with_safe_default_protocol_versions()
                .map_err(TransportError::new)?
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(verifier))
                .with_no_client_auth()
        };

        let redirect = if key.follow_redirects {
            reqwest::redirect::Policy::limited(MAX_REDIRECTS)
        } else {
            reqwest::redirect::Policy::none()
        };

        let client = reqwest::blocking::Client::builder()
            .use_preconfigured_tls(tls)
            .redirect(redirect)
            .build()
            .map_err(TransportError::new)?;

        log::debug!("built HTTP client pinned to {}", config.trust_anchor.display());
        clients.insert(key, client.clone());
        Ok(client)
    }
}

impl Transport for ReqwestTransport {
    fn send(
        &self,
        request: Request<Vec<u8>>,
        config: &TransportConfig,
    ) -> Result<Response<Vec<u8>>, TransportError> {
        let client = self.client_for(config)?;
        let request =
            reqwest::blocking::Request::try_from(request).map_err(TransportError::new)?;
        let response = client.execute(request).map_err(TransportError::new)?;

        let status = response.status();
        let version = response.version();
        let headers = response.headers().clone();
        let body = response.bytes().map_err(TransportError::new)?;

        let mut out = Response::new(body.to_vec());
        *out.status_mut() = status;
        *out.version_mut() = version;
        *out.headers_mut() = headers;
        Ok(out)
    }
}

/// Convenience for a `rustls` client configuration trusting only the certificates in a PEM file.
pub fn pinned_tls_config(
    trust_anchor: &Path,
    provider: Arc<CryptoProvider>,
) -> Result<ClientConfig, TransportError> {
    let pinned = pem::load_certificates(trust_anchor).map_err(TransportError::new)?;
    pinned_config(pinned, provider)
}

fn pinned_config(
    pinned: Vec<CertificateDer<'static>>,
    provider: Arc<CryptoProvider>,
) -> Result<ClientConfig, TransportError> {
    Ok(ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .and_then(|builder| builder.with_pinned_certificates(pinned))
        .map_err(TransportError::new)?
        .with_no_client_auth())
}
