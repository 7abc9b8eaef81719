//! Server certificate verifiers for the two kinds of connections this crate makes:
//! the harvesting handshake ([`Verifier`]) and pinned requests ([`PinnedVerifier`]).

use once_cell::sync::OnceCell;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::pki_types;
use rustls::{
    crypto::CryptoProvider, CertificateError, DigitallySignedStruct, Error as TlsError, OtherError,
    SignatureScheme,
};
use std::sync::Arc;

/// How the harvesting handshake treats the certificate the server presents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PeerVerification {
    /// Verify the server against the system's root store, plus any extra roots.
    #[default]
    Platform,
    /// Accept any certificate. Handshake signatures are still checked.
    ///
    /// This is the mode for pinning self-signed hosts.
    AcceptAny,
}

/// The verifier used while harvesting a certificate.
#[derive(Debug)]
pub struct Verifier {
    mode: PeerVerification,

    // Only built in `Platform` mode, on first use, so that accept-any
    // harvesting never touches the system store.
    inner: OnceCell<Arc<WebPkiServerVerifier>>,

    // Extra trust anchors to add to the verifier above and beyond those provided by the
    // platform via rustls-native-certs.
    extra_roots: Vec<pki_types::CertificateDer<'static>>,

    provider: Arc<CryptoProvider>,
}

impl Verifier {
    /// Creates a verifier in the given mode.
    pub fn new(mode: PeerVerification, provider: Arc<CryptoProvider>) -> Self {
        Self::new_with_extra_roots(mode, Vec::new(), provider)
    }

    /// Creates a verifier whose platform roots are augmented by `roots`.
    pub fn new_with_extra_roots(
        mode: PeerVerification,
        roots: impl IntoIterator<Item = pki_types::CertificateDer<'static>>,
        provider: Arc<CryptoProvider>,
    ) -> Self {
        Self {
            mode,
            inner: OnceCell::new(),
            extra_roots: roots.into_iter().collect(),
            provider,
        }
    }

    /// The mode this verifier was built with.
    pub fn mode(&self) -> PeerVerification {
        self.mode
    }

    fn get_or_init_verifier(&self) -> Result<&Arc<WebPkiServerVerifier>, TlsError> {
        self.inner.get_or_try_init(|| self.init_verifier())
    }

    // Load CA root certificates present on system, fallback to WebPKI roots if none are found
    fn init_verifier(&self) -> Result<Arc<WebPkiServerVerifier>, TlsError> {
        let mut root_store = rustls::RootCertStore::empty();

        if !self.extra_roots.is_empty() {
            let (added, ignored) =
                root_store.add_parsable_certificates(self.extra_roots.iter().cloned());
            if ignored != 0 {
                log::warn!("{ignored} extra CA certificates were ignored due to errors");
            }
            log::debug!("Loaded {added} extra CA certificates in addition to system roots");
        }

        let result = rustls_native_certs::load_native_certs();
        let (added, ignored) = root_store.add_parsable_certificates(result.certs);
        if ignored != 0 {
            log::warn!("Some CA root certificates were ignored due to errors");
        }

        for error in result.errors {
            log::warn!("Error loading CA root certificate: {error}");
        }

        if added == 0 {
            log::warn!("No CA certificates were loaded from the system, using bundled roots");
            root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        } else {
            log::debug!("Loaded {added} CA certificates from the system");
        }

        WebPkiServerVerifier::builder_with_provider(root_store.into(), Arc::clone(&self.provider))
            .build()
            .map_err(|e| TlsError::Other(OtherError(Arc::new(e))))
    }
}

impl ServerCertVerifier for Verifier {
    fn verify_server_cert(
        &self,
        end_entity: &pki_types::CertificateDer<'_>,
        intermediates: &[pki_types::CertificateDer<'_>],
        server_name: &pki_types::ServerName,
        ocsp_response: &[u8],
        now: pki_types::UnixTime,
    ) -> Result<ServerCertVerified, TlsError> {
        log_server_cert(end_entity);

        match self.mode {
            PeerVerification::AcceptAny => Ok(ServerCertVerified::assertion()),
            PeerVerification::Platform => self
                .get_or_init_verifier()?
                .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
                // This only contains information from the system or other public
                // bits of the TLS handshake, so it can't leak anything.
                .map_err(|e| {
                    log::error!("failed to verify TLS certificate: {}", e);
                    e
                }),
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &pki_types::CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &pki_types::CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// A verifier that trusts only the certificates of one pinned file.
///
/// A server passes if its end-entity certificate is byte-for-byte one of the pinned
/// certificates. Otherwise the pinned certificates are used as WebPKI trust anchors,
/// which covers a cache file that holds a CA rather than a leaf.
#[derive(Debug)]
pub struct PinnedVerifier {
    pinned: Vec<pki_types::CertificateDer<'static>>,
    chain: Option<Arc<WebPkiServerVerifier>>,
    provider: Arc<CryptoProvider>,
}

impl PinnedVerifier {
    /// Builds a verifier pinned to `pinned`.
    ///
    /// # Errors
    ///
    /// Fails if `pinned` is empty.
    pub fn new(
        pinned: Vec<pki_types::CertificateDer<'static>>,
        provider: Arc<CryptoProvider>,
    ) -> Result<Self, TlsError> {
        if pinned.is_empty() {
            return Err(TlsError::General(
                "no pinned certificates were provided".to_owned(),
            ));
        }

        let mut root_store = rustls::RootCertStore::empty();
        let (added, ignored) = root_store.add_parsable_certificates(pinned.iter().cloned());
        if ignored != 0 {
            log::warn!("{ignored} pinned certificates cannot be used as trust anchors");
        }

        let chain = if added == 0 {
            None
        } else {
            let verifier =
                WebPkiServerVerifier::builder_with_provider(root_store.into(), Arc::clone(&provider))
                    .build()
                    .map_err(|e| TlsError::Other(OtherError(Arc::new(e))))?;
            Some(verifier)
        };

        Ok(Self {
            pinned,
            chain,
            provider,
        })
    }

    fn is_pinned(&self, end_entity: &pki_types::CertificateDer<'_>) -> bool {
        self.pinned
            .iter()
            .any(|pinned| pinned.as_ref() == end_entity.as_ref())
    }
}

impl ServerCertVerifier for PinnedVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &pki_types::CertificateDer<'_>,
        intermediates: &[pki_types::CertificateDer<'_>],
        server_name: &pki_types::ServerName,
        ocsp_response: &[u8],
        now: pki_types::UnixTime,
    ) -> Result<ServerCertVerified, TlsError> {
        log_server_cert(end_entity);

        if self.is_pinned(end_entity) {
            return Ok(ServerCertVerified::assertion());
        }

        let result = match &self.chain {
            Some(chain) => {
                chain.verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
            }
            None => Err(TlsError::InvalidCertificate(CertificateError::UnknownIssuer)),
        };

        result.map_err(|e| {
            log::error!("server certificate for {server_name:?} does not match the pin: {e}");
            e
        })
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &pki_types::CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &pki_types::CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

// Log the certificate we are verifying so that we can try and find what may be wrong with it
// if we need to debug a user's situation.
pub(crate) fn log_server_cert(_end_entity: &pki_types::CertificateDer<'_>) {
    #[cfg(feature = "cert-logging")]
    {
        use base64::Engine;
        log::debug!(
            "verifying certificate: {}",
            base64::engine::general_purpose::STANDARD.encode(_end_entity.as_ref())
        );
    }
}
