use crate::error::{FetchError, HandshakeError};
use crate::verification::{PeerVerification, Verifier};
use crate::{default_provider, pem};
use once_cell::sync::OnceCell;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName};
use rustls::{ClientConfig, ClientConnection};
use std::fs;
use std::io::{self, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// The port certificates are harvested from unless configured otherwise.
pub const HTTPS_PORT: u16 = 443;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Something that can produce the PEM certificate of a domain.
///
/// [`TlsCertificateFetcher`] is the real implementation. [`PinnedHttpClient`]
/// only depends on this trait, so tests and callers can supply their own.
///
/// [`PinnedHttpClient`]: crate::PinnedHttpClient
pub trait CertificateSource: Send + Sync {
    /// Returns the PEM certificate of `domain`, also writing it to `target` when given.
    ///
    /// Implementations must create missing parent directories of `target`.
    fn fetch(&self, domain: &str, target: Option<&Path>) -> Result<String, FetchError>;
}

/// Harvests a server's leaf certificate with a bare TLS handshake.
///
/// No application data is sent. The connection is closed as soon as the
/// handshake completes, and nothing is retried.
#[derive(Debug, Clone)]
pub struct TlsCertificateFetcher {
    port: u16,
    connect_timeout: Duration,
    peer_verification: PeerVerification,
    extra_roots: Vec<CertificateDer<'static>>,
    provider: Arc<CryptoProvider>,
    config: OnceCell<Arc<ClientConfig>>,
}

impl Default for TlsCertificateFetcher {
    fn default() -> Self {
        Self {
            port: HTTPS_PORT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            peer_verification: PeerVerification::default(),
            extra_roots: Vec::new(),
            provider: default_provider(),
            config: OnceCell::new(),
        }
    }
}

impl TlsCertificateFetcher {
    /// Creates a fetcher for port 443 that verifies servers against the platform roots.
    pub fn new() -> Self {
        Self::default()
    }

    /// Chainable setter for the port handshakes are made against.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Chainable setter for the timeout applied to connecting and to each handshake read or write.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Chainable setter for how the harvested certificate is verified during the handshake.
    pub fn with_peer_verification(mut self, mode: PeerVerification) -> Self {
        self.peer_verification = mode;
        self.config = OnceCell::new();
        self
    }

    /// Chainable setter for extra trust anchors used in [`PeerVerification::Platform`] mode.
    pub fn with_extra_roots(
        mut self,
        roots: impl IntoIterator<Item = CertificateDer<'static>>,
    ) -> Self {
        self.extra_roots = roots.into_iter().collect();
        self.config = OnceCell::new();
        self
    }

    /// Chainable setter for the [`CryptoProvider`] used by the handshake.
    pub fn with_provider(mut self, provider: Arc<CryptoProvider>) -> Self {
        self.provider = provider;
        self.config = OnceCell::new();
        self
    }

    /// Harvests the leaf certificate of `domain` and returns it as PEM.
    ///
    /// When `target` is given the PEM is also written there, creating parent
    /// directories as needed. The caller is expected to only ask for a write when
    /// the file is absent; an existing file is replaced.
    pub fn get_certificate(
        &self,
        domain: &str,
        target: Option<&Path>,
    ) -> Result<String, FetchError> {
        let der = self
            .harvest(domain)
            .map_err(|e| {
                log::error!("failed to harvest certificate from {domain}:{}: {e}", self.port);
                FetchError::retrieval(domain, e)
            })?;

        let pem = pem::encode_certificate(der.as_ref())
            .ok_or_else(|| FetchError::retrieval(domain, HandshakeError::Encoding))?;

        if let Some(path) = target {
            persist(path, &pem)?;
            log::debug!("pinned certificate for {domain} at {}", path.display());
        }

        Ok(pem)
    }

    fn client_config(&self) -> Result<Arc<ClientConfig>, rustls::Error> {
        self.config
            .get_or_try_init(|| {
                let verifier = Verifier::new_with_extra_roots(
                    self.peer_verification,
                    self.extra_roots.iter().cloned(),
                    Arc::clone(&self.provider),
                );
                let config = ClientConfig::builder_with_provider(Arc::clone(&self.provider))
                    .with_safe_default_protocol_versions()?
                    .dangerous()
                    .with_custom_certificate_verifier(Arc::new(verifier))
                    .with_no_client_auth();
                Ok::<_, rustls::Error>(Arc::new(config))
            })
            .map(Arc::clone)
    }

    fn harvest(&self, domain: &str) -> Result<CertificateDer<'static>, HandshakeError> {
        let host = strip_brackets(domain);
        let server_name = ServerName::try_from(host.to_owned())?;
        let mut conn = ClientConnection::new(self.client_config()?, server_name)?;
        let mut sock = self.connect(host)?;

        log::debug!("harvesting certificate from {host}:{}", self.port);
        while conn.is_handshaking() {
            conn.complete_io(&mut sock)?;
        }

        let end_entity = conn
            .peer_certificates()
            .and_then(|certs| certs.first())
            .map(|cert| cert.clone().into_owned())
            .ok_or(HandshakeError::NoPeerCertificate)?;

        // Be polite, but the certificate is already in hand.
        conn.send_close_notify();
        while conn.wants_write() {
            if conn.write_tls(&mut sock).is_err() {
                break;
            }
        }
        let _ = sock.flush();

        Ok(end_entity)
    }

    fn connect(&self, host: &str) -> Result<TcpStream, HandshakeError> {
        let mut last_err = None;
        for addr in (host, self.port).to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, self.connect_timeout) {
                Ok(sock) => {
                    sock.set_read_timeout(Some(self.connect_timeout))?;
                    sock.set_write_timeout(Some(self.connect_timeout))?;
                    return Ok(sock);
                }
                Err(e) => {
                    log::debug!("failed to connect to {addr}: {e}");
                    last_err = Some(e);
                }
            }
        }

        Err(last_err.map_or(HandshakeError::Unresolved, HandshakeError::Io))
    }
}

impl CertificateSource for TlsCertificateFetcher {
    fn fetch(&self, domain: &str, target: Option<&Path>) -> Result<String, FetchError> {
        self.get_certificate(domain, target)
    }
}

impl<T: CertificateSource + ?Sized> CertificateSource for Arc<T> {
    fn fetch(&self, domain: &str, target: Option<&Path>) -> Result<String, FetchError> {
        (**self).fetch(domain, target)
    }
}

fn strip_brackets(domain: &str) -> &str {
    domain
        .strip_prefix('[')
        .and_then(|d| d.strip_suffix(']'))
        .unwrap_or(domain)
}

/// Writes `pem` to `path` through a temporary file in the same directory, so the
/// path only ever holds a complete certificate.
fn persist(path: &Path, pem: &str) -> Result<(), FetchError> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    create_dir(dir)?;

    let write_err = |source: io::Error| FetchError::FileWrite {
        path: path.to_path_buf(),
        source,
    };

    let mut tmp = tempfile::Builder::new()
        .prefix(".pinned-")
        .suffix(".tmp")
        .tempfile_in(dir)
        .map_err(write_err)?;
    tmp.write_all(pem.as_bytes()).map_err(write_err)?;
    tmp.as_file().sync_all().map_err(write_err)?;
    tmp.persist(path).map_err(|e| write_err(e.error))?;

    if !path.exists() {
        return Err(FetchError::FileVerification {
            path: path.to_path_buf(),
        });
    }

    Ok(())
}

fn create_dir(dir: &Path) -> Result<(), FetchError> {
    match fs::create_dir_all(dir) {
        Ok(()) => Ok(()),
        // Lost a race with another creator.
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists && dir.is_dir() => Ok(()),
        Err(source) => Err(FetchError::DirectoryCreation {
            dir: dir.to_path_buf(),
            source,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::strip_brackets;

    #[test]
    fn brackets_are_stripped_from_ipv6_literals() {
        assert_eq!(strip_brackets("[::1]"), "::1");
        assert_eq!(strip_brackets("example.com"), "example.com");
        assert_eq!(strip_brackets("[broken"), "[broken");
    }
}
