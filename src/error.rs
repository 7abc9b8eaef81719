use rustls::pki_types::InvalidDnsNameError;
use std::error::Error as StdError;
use std::fmt;
use std::io;
use std::path::PathBuf;

/// Why a harvesting handshake did not produce a certificate.
#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    /// The domain is neither a valid DNS name nor an IP address.
    #[error("invalid server name: {0}")]
    InvalidServerName(#[from] InvalidDnsNameError),

    /// Name resolution succeeded but returned no addresses.
    #[error("no addresses found")]
    Unresolved,

    /// DNS, connect, timeout or socket failure. TLS alerts received while
    /// driving the handshake also surface here.
    #[error(transparent)]
    Io(#[from] io::Error),

    /// The local TLS configuration or connection could not be set up.
    #[error(transparent)]
    Tls(#[from] rustls::Error),

    /// The handshake completed but the server presented no certificate.
    #[error("handshake completed without a peer certificate")]
    NoPeerCertificate,

    /// The certificate could not be converted to PEM.
    #[error("peer certificate could not be encoded as PEM")]
    Encoding,
}

/// Errors produced while harvesting or persisting a certificate.
///
/// Every variant names the domain or path it concerns.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// The TLS handshake or certificate extraction failed.
    #[error("failed to retrieve certificate for {domain}: {source}")]
    CertificateRetrieval {
        /// The domain the handshake was made with.
        domain: String,
        /// Why no certificate was obtained.
        #[source]
        source: HandshakeError,
    },

    /// The cache directory could not be created.
    #[error("failed to create directory {}: {source}", dir.display())]
    DirectoryCreation {
        /// The directory that could not be created.
        dir: PathBuf,
        /// The underlying filesystem error.
        #[source]
        source: io::Error,
    },

    /// The certificate file could not be written.
    #[error("failed to write certificate to {}: {source}", path.display())]
    FileWrite {
        /// The certificate file.
        path: PathBuf,
        /// The underlying filesystem error.
        #[source]
        source: io::Error,
    },

    /// The certificate file was not observable right after being written.
    #[error("certificate file {} does not exist after writing", path.display())]
    FileVerification {
        /// The certificate file.
        path: PathBuf,
    },
}

impl FetchError {
    pub(crate) fn retrieval(domain: &str, source: impl Into<HandshakeError>) -> Self {
        FetchError::CertificateRetrieval {
            domain: domain.to_owned(),
            source: source.into(),
        }
    }
}

/// A failure reported by a [`Transport`](crate::Transport).
///
/// The original error is kept and can be recovered with [`TransportError::get_ref`]
/// or [`TransportError::into_inner`].
#[derive(Debug)]
pub struct TransportError(Box<dyn StdError + Send + Sync + 'static>);

impl TransportError {
    /// Wraps any error raised by a transport.
    pub fn new(error: impl Into<Box<dyn StdError + Send + Sync + 'static>>) -> Self {
        Self(error.into())
    }

    /// Returns the wrapped error.
    pub fn get_ref(&self) -> &(dyn StdError + Send + Sync + 'static) {
        &*self.0
    }

    /// Consumes the wrapper, returning the original error.
    pub fn into_inner(self) -> Box<dyn StdError + Send + Sync + 'static> {
        self.0
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl StdError for TransportError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(&*self.0)
    }
}

/// The error returned by [`PinnedHttpClient`](crate::PinnedHttpClient).
///
/// Nothing is retried before this error is returned, callers decide whether a
/// request is worth repeating.
#[derive(Debug, thiserror::Error)]
pub enum HttpClientError {
    /// The request has no usable target host.
    #[error("invalid request target {uri:?}: {reason}")]
    InvalidRequest {
        /// The offending request target.
        uri: String,
        /// What is wrong with it.
        reason: &'static str,
    },

    /// The domain's certificate could not be pinned.
    #[error("error fetching SSL certificate for domain {domain}: {source}")]
    Certificate {
        /// The request's domain.
        domain: String,
        /// The fetch or persistence failure.
        #[source]
        source: FetchError,
    },

    /// The transport failed to deliver the request.
    #[error("request to {domain} failed: {source}")]
    Transport {
        /// The request's domain.
        domain: String,
        /// The transport's failure, holding its original error.
        #[source]
        source: TransportError,
    },
}
