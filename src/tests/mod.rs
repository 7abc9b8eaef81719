use crate::error::{FetchError, HandshakeError, TransportError};
use crate::fetcher::CertificateSource;
use crate::transport::{Transport, TransportConfig};
use http::{Request, Response};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::{ServerConfig, ServerConnection};
use std::fs;
use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;


/// The body every [`TestServer`] answers HTTP requests with.
pub(crate) const RESPONSE_BODY: &[u8] = b"hello";

const RESPONSE: &[u8] = b"HTTP/1.1 200 OK\r\n\
    content-length: 5\r\n\
    x-served-by: pinned-test-server\r\n\
    connection: close\r\n\
    \r\n\
    hello";

/// A self-signed certificate for `localhost` and `127.0.0.1`, with its key.
pub(crate) struct TestCert {
    pub der: CertificateDer<'static>,
    pub key: PrivatePkcs8KeyDer<'static>,
}

impl TestCert {
    pub fn generate() -> Self {
        let rcgen::CertifiedKey { cert, key_pair } =
            rcgen::generate_simple_self_signed(vec!["localhost".to_owned(), "127.0.0.1".to_owned()])
                .expect("certificate generation should succeed");
        Self {
            der: cert.der().clone(),
            key: PrivatePkcs8KeyDer::from(key_pair.serialize_der()),
        }
    }

    pub fn pem(&self) -> String {
        crate::pem::encode_certificate(self.der.as_ref()).unwrap()
    }
}

/// A TLS server on `127.0.0.1` that completes handshakes and answers any HTTP
/// request with a fixed response. Connections are served one at a time.
pub(crate) struct TestServer {
    pub port: u16,
    pub cert: CertificateDer<'static>,
    connections: Arc<AtomicUsize>,
}

impl TestServer {
    pub fn start() -> Self {
        let TestCert { der, key } = TestCert::generate();
        let config = ServerConfig::builder_with_provider(crate::default_provider())
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_no_client_auth()
            .with_single_cert(vec![der.clone()], PrivateKeyDer::Pkcs8(key))
            .unwrap();
        let config = Arc::new(config);

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let connections = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&connections);
        thread::spawn(move || {
            for sock in listener.incoming() {
                let Ok(sock) = sock else { continue };
                counter.fetch_add(1, Ordering::SeqCst);
                // Harvesting clients hang up right after the handshake.
                let _ = serve(Arc::clone(&config), sock);
            }
        });

        Self {
            port,
            cert: der,
            connections,
        }
    }

    /// Number of TCP connections accepted so far.
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

fn serve(config: Arc<ServerConfig>, mut sock: TcpStream) -> io::Result<()> {
    sock.set_read_timeout(Some(Duration::from_secs(5)))?;
    let mut conn =
        ServerConnection::new(config).map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
    while conn.is_handshaking() {
        conn.complete_io(&mut sock)?;
    }

    let mut tls = rustls::Stream::new(&mut conn, &mut sock);
    let mut request = Vec::new();
    let mut buf = [0u8; 1024];
    while !request.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = tls.read(&mut buf)?;
        if n == 0 {
            return Ok(());
        }
        request.extend_from_slice(&buf[..n]);
    }

    tls.write_all(RESPONSE)?;
    tls.conn.send_close_notify();
    tls.flush()
}

/// Returns a port on `127.0.0.1` that nothing listens on.
pub(crate) fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// A [`CertificateSource`] that writes a fixed PEM and counts how often it was asked.
pub(crate) struct CountingSource {
    pem: String,
    delay: Duration,
    calls: AtomicUsize,
}

impl CountingSource {
    pub fn new(pem: impl Into<String>) -> Self {
        Self {
            pem: pem.into(),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    /// Makes every fetch take `delay`, widening the window for racing callers.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl CertificateSource for CountingSource {
    fn fetch(&self, _domain: &str, target: Option<&Path>) -> Result<String, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        thread::sleep(self.delay);
        if let Some(path) = target {
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, &self.pem).unwrap();
        }
        Ok(self.pem.clone())
    }
}

/// A [`CertificateSource`] whose handshakes always fail.
pub(crate) struct FailingSource;

impl CertificateSource for FailingSource {
    fn fetch(&self, domain: &str, _target: Option<&Path>) -> Result<String, FetchError> {
        Err(FetchError::CertificateRetrieval {
            domain: domain.to_owned(),
            source: HandshakeError::Unresolved,
        })
    }
}

/// A [`Transport`] that records every configuration it is handed.
pub(crate) struct RecordingTransport {
    respond: fn() -> Result<Response<Vec<u8>>, TransportError>,
    sent: Mutex<Vec<(String, TransportConfig)>>,
}

impl RecordingTransport {
    pub fn responding(respond: fn() -> Result<Response<Vec<u8>>, TransportError>) -> Self {
        Self {
            respond,
            sent: Mutex::new(Vec::new()),
        }
    }

    /// `(uri, config)` of every request sent so far.
    pub fn sent(&self) -> Vec<(String, TransportConfig)> {
        self.sent.lock().unwrap().clone()
    }
}

impl Transport for RecordingTransport {
    fn send(
        &self,
        request: Request<Vec<u8>>,
        config: &TransportConfig,
    ) -> Result<Response<Vec<u8>>, TransportError> {
        self.sent
            .lock()
            .unwrap()
            .push((request.uri().to_string(), config.clone()));
        (self.respond)()
    }
}

pub(crate) fn get(uri: &str) -> Request<Vec<u8>> {
    Request::get(uri).body(Vec::new()).unwrap()
}
