use crate::error::FetchError;
use crate::fetcher::CertificateSource;
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

/// A directory of pinned certificates, one `<domain>.pem` file per domain.
///
/// A file's existence is the only cache-hit signal. Files are never rewritten or
/// removed by this crate unless [`CertificateCache::invalidate`] is called.
#[derive(Debug)]
pub struct CertificateCache {
    root: PathBuf,
    // One lock per domain, created on first use, so that concurrent first requests
    // for a domain share a single handshake. Entries are never removed; the map
    // grows with the number of distinct domains seen.
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl CertificateCache {
    /// Creates a cache rooted at `root`. The directory is created lazily.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// The cache root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The path `domain`'s certificate is cached at.
    pub fn path_for(&self, domain: &str) -> PathBuf {
        self.root.join(format!("{domain}.pem"))
    }

    /// Whether a certificate for `domain` is present.
    pub fn is_cached(&self, domain: &str) -> bool {
        self.path_for(domain).exists()
    }

    /// Makes sure `domain` has a cached certificate, fetching it from `source` if
    /// it is missing, and returns its path.
    pub fn ensure(
        &self,
        domain: &str,
        source: &dyn CertificateSource,
    ) -> Result<PathBuf, FetchError> {
        let path = self.path_for(domain);

        let lock = self.lock_for(domain);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        if path.exists() {
            log::debug!("certificate for {domain} already cached at {}", path.display());
            return Ok(path);
        }

        log::debug!("no cached certificate for {domain}, fetching");
        source.fetch(domain, Some(&path))?;
        Ok(path)
    }

    /// Removes the cached certificate of `domain`, so the next request pins afresh.
    ///
    /// Returns whether a file was removed.
    pub fn invalidate(&self, domain: &str) -> io::Result<bool> {
        let lock = self.lock_for(domain);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        match fs::remove_file(self.path_for(domain)) {
            Ok(()) => {
                log::debug!("invalidated cached certificate for {domain}");
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn lock_for(&self, domain: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(domain.to_owned()).or_default())
    }
}
