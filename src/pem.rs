//! PEM encoding of harvested certificates and loading of cached ones.

use rustls::pki_types::pem::PemObject;
use rustls::pki_types::CertificateDer;
use std::io;
use std::path::Path;

const CERTIFICATE_TAG: &str = "CERTIFICATE";

/// Encodes a DER certificate as a single PEM block, with a trailing newline.
///
/// Returns `None` for an empty certificate.
pub fn encode_certificate(der: &[u8]) -> Option<String> {
    if der.is_empty() {
        return None;
    }

    let block = ::pem::Pem::new(CERTIFICATE_TAG, der.to_vec());
    Some(::pem::encode_config(
        &block,
        ::pem::EncodeConfig::new().set_line_ending(::pem::LineEnding::LF),
    ))
}

/// Reads every certificate in a PEM file.
pub fn load_certificates(path: &Path) -> io::Result<Vec<CertificateDer<'static>>> {
    CertificateDer::pem_file_iter(path)
        .and_then(|certs| certs.collect::<Result<Vec<_>, _>>())
        .map_err(|e| match e {
            rustls::pki_types::pem::Error::Io(e) => e,
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        })
}
