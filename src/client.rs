use crate::cache::CertificateCache;
use crate::error::HttpClientError;
use crate::fetcher::{CertificateSource, TlsCertificateFetcher};
use crate::transport::{ReqwestTransport, Transport, TransportConfig};
use http::{Request, Response, Uri};
use std::fmt;
use std::path::{Path, PathBuf};

/// An HTTP client that pins each domain's certificate on first use.
///
/// Every [`send`](PinnedHttpClient::send) makes sure the target domain's certificate
/// is cached, fetching it if needed, then sends the request trusting only that
/// certificate. The client is `Send + Sync` and can be shared between threads.
pub struct PinnedHttpClient {
    cache: CertificateCache,
    fetcher: Box<dyn CertificateSource>,
    transport: Box<dyn Transport>,
    verify_peer: bool,
    follow_redirects: bool,
}

impl fmt::Debug for PinnedHttpClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PinnedHttpClient")
            .field("cache", &self.cache)
            .field("verify_peer", &self.verify_peer)
            .field("follow_redirects", &self.follow_redirects)
            .finish_non_exhaustive()
    }
}

impl PinnedHttpClient {
    /// Creates a client caching certificates under `cache_root`, harvesting them
    /// with [`TlsCertificateFetcher`] and sending with [`ReqwestTransport`].
    pub fn new(cache_root: impl Into<PathBuf>) -> Self {
        Self {
            cache: CertificateCache::new(cache_root),
            fetcher: Box::new(TlsCertificateFetcher::default()),
            transport: Box::new(ReqwestTransport::default()),
            verify_peer: true,
            follow_redirects: true,
        }
    }

    /// Chainable setter for the source of certificates that are not cached yet.
    pub fn with_fetcher(mut self, fetcher: impl CertificateSource + 'static) -> Self {
        self.fetcher = Box::new(fetcher);
        self
    }

    /// Chainable setter for the transport requests are sent with.
    pub fn with_transport(mut self, transport: impl Transport + 'static) -> Self {
        self.transport = Box::new(transport);
        self
    }

    /// Chainable setter for peer verification of sent requests. On by default.
    pub fn with_verify_peer(mut self, verify_peer: bool) -> Self {
        self.verify_peer = verify_peer;
        self
    }

    /// Chainable setter for following redirects. On by default.
    pub fn with_follow_redirects(mut self, follow_redirects: bool) -> Self {
        self.follow_redirects = follow_redirects;
        self
    }

    /// The certificate cache backing this client.
    pub fn cache(&self) -> &CertificateCache {
        &self.cache
    }

    /// Sends `request` to its target host, trusting only that host's pinned certificate.
    ///
    /// The response is returned exactly as the transport produced it.
    pub fn send(&self, request: Request<Vec<u8>>) -> Result<Response<Vec<u8>>, HttpClientError> {
        let domain = request_domain(request.uri())?;
        let cert_path = self.ensure_normalized(&domain)?;

        let config = TransportConfig {
            trust_anchor: cert_path,
            verify_peer: self.verify_peer,
            follow_redirects: self.follow_redirects,
        };

        log::debug!(
            "sending {} {} pinned to {}",
            request.method(),
            request.uri(),
            config.trust_anchor.display()
        );
        self.transport.send(request, &config).map_err(|source| {
            log::error!("request to {domain} failed: {source}");
            HttpClientError::Transport { domain, source }
        })
    }

    /// Makes sure `domain` has a pinned certificate and returns the path of its file.
    ///
    /// `domain` is normalized the same way a request's host is, so pre-warming
    /// `EXAMPLE.com` or `[::1]` pins the file later requests to those hosts use.
    pub fn ensure_certificate(&self, domain: &str) -> Result<PathBuf, HttpClientError> {
        let domain = normalize_domain(domain).map_err(|reason| HttpClientError::InvalidRequest {
            uri: domain.to_owned(),
            reason,
        })?;
        self.ensure_normalized(&domain)
    }

    fn ensure_normalized(&self, domain: &str) -> Result<PathBuf, HttpClientError> {
        self.cache
            .ensure(domain, self.fetcher.as_ref())
            .map_err(|source| HttpClientError::Certificate {
                domain: domain.to_owned(),
                source,
            })
    }
}

/// Extracts the cache key of a request target from its host.
fn request_domain(uri: &Uri) -> Result<String, HttpClientError> {
    let invalid = |reason| HttpClientError::InvalidRequest {
        uri: uri.to_string(),
        reason,
    };

    let host = uri.host().ok_or_else(|| invalid("no host"))?;
    normalize_domain(host).map_err(invalid)
}

/// The cache key of a host: lowercased, without IPv6 brackets.
fn normalize_domain(host: &str) -> Result<String, &'static str> {
    let domain = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host)
        .to_ascii_lowercase();

    check_domain(&domain)?;
    Ok(domain)
}

// The domain becomes a file name under the cache root and must not leave it.
fn check_domain(domain: &str) -> Result<(), &'static str> {
    if domain.is_empty() {
        return Err("empty host");
    }
    if domain.contains(['/', '\\', '\0']) {
        return Err("host contains a path separator");
    }
    if Path::new(domain)
        .components()
        .any(|c| !matches!(c, std::path::Component::Normal(_)))
    {
        return Err("host is not a plain name");
    }
    Ok(())
}
