//! TLS configuration for the default transport, and certificate-failure
//! detection.
//!
//! Certificate *validation* is left to `rustls`. This module only decides
//! which roots are trusted and recognizes, from an error chain, that a
//! handshake failed because the peer's certificate was rejected. That is the
//! point where the engine raises an SSL trust challenge instead of failing.
//!
//! ```ignore
//! use tether_http::tls::{Certificate, TlsConfig};
//! use tether_http::transport::ReqwestTransport;
//!
//! let ca = Certificate::from_pem_file("/path/to/ca.crt")?;
//! let transport = ReqwestTransport::builder()
//!     .tls(TlsConfig::new().add_root_certificate(ca))
//!     .build();
//! ```

use std::error::Error as StdError;
use std::io::{BufReader, Cursor};
use std::path::Path;

use rustls_pki_types::CertificateDer;

use crate::error::NetworkError;

/// Minimum TLS protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TlsVersion {
    /// TLS 1.2 (default minimum).
    #[default]
    Tls1_2,
    /// TLS 1.3.
    Tls1_3,
}

impl TlsVersion {
    pub(crate) fn to_reqwest_version(self) -> reqwest::tls::Version {
        match self {
            TlsVersion::Tls1_2 => reqwest::tls::Version::TLS_1_2,
            TlsVersion::Tls1_3 => reqwest::tls::Version::TLS_1_3,
        }
    }
}

/// One or more X.509 certificates to add to the trust store.
#[derive(Clone)]
pub struct Certificate {
    der_certs: Vec<CertificateDer<'static>>,
}

impl std::fmt::Debug for Certificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Certificate")
            .field("cert_count", &self.der_certs.len())
            .finish()
    }
}

impl Certificate {
    /// Load certificates from PEM-encoded bytes. A chain or bundle is accepted.
    pub fn from_pem(pem_data: impl AsRef<[u8]>) -> Result<Self, NetworkError> {
        let mut reader = BufReader::new(Cursor::new(pem_data.as_ref()));
        let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut reader)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| NetworkError::Tls(format!("Failed to parse PEM certificate: {}", e)))?;

        if certs.is_empty() {
            return Err(NetworkError::Tls(
                "No certificates found in PEM data".to_string(),
            ));
        }

        Ok(Self { der_certs: certs })
    }

    /// Load certificates from a PEM-encoded file.
    pub fn from_pem_file(path: impl AsRef<Path>) -> Result<Self, NetworkError> {
        let pem_data = std::fs::read(path.as_ref()).map_err(|e| {
            NetworkError::Tls(format!(
                "Failed to read certificate file '{}': {}",
                path.as_ref().display(),
                e
            ))
        })?;
        Self::from_pem(pem_data)
    }

    /// Wrap one DER-encoded certificate.
    pub fn from_der(der_data: impl Into<Vec<u8>>) -> Self {
        Self {
            der_certs: vec![CertificateDer::from(der_data.into())],
        }
    }

    /// Number of certificates held.
    pub fn len(&self) -> usize {
        self.der_certs.len()
    }

    /// Whether no certificates are held.
    pub fn is_empty(&self) -> bool {
        self.der_certs.is_empty()
    }

    pub(crate) fn to_reqwest_certificates(&self) -> Vec<reqwest::Certificate> {
        self.der_certs
            .iter()
            .filter_map(|cert| reqwest::Certificate::from_der(cert.as_ref()).ok())
            .collect()
    }
}

/// Trust-store settings applied to every client the transport builds.
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    /// Additional root certificates to trust.
    pub root_certificates: Vec<Certificate>,
    /// Trust only `root_certificates`, not the built-in roots.
    pub use_only_custom_roots: bool,
    /// Minimum TLS version.
    pub min_version: TlsVersion,
}

impl TlsConfig {
    /// Create a configuration that trusts the built-in roots.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a root certificate.
    pub fn add_root_certificate(mut self, cert: Certificate) -> Self {
        self.root_certificates.push(cert);
        self
    }

    /// Trust only the added roots.
    pub fn use_only_custom_roots(mut self) -> Self {
        self.use_only_custom_roots = true;
        self
    }

    /// Set the minimum protocol version.
    pub fn min_version(mut self, version: TlsVersion) -> Self {
        self.min_version = version;
        self
    }

    pub(crate) fn apply(&self, mut builder: reqwest::ClientBuilder) -> reqwest::ClientBuilder {
        builder = builder
            .use_rustls_tls()
            .min_tls_version(self.min_version.to_reqwest_version());
        if self.use_only_custom_roots {
            builder = builder.tls_built_in_root_certs(false);
        }
        for cert in self
            .root_certificates
            .iter()
            .flat_map(Certificate::to_reqwest_certificates)
        {
            builder = builder.add_root_certificate(cert);
        }
        builder
    }
}

/// If `err` failed because the server's certificate was rejected, describe why.
///
/// Walks the source chain looking for a `rustls` certificate error, including
/// one wrapped in an `io::Error` by the TLS stream. Falls back to the message
/// text because hyper does not always preserve the typed source.
pub fn untrusted_certificate_reason(err: &(dyn StdError + 'static)) -> Option<String> {
    let mut current: Option<&(dyn StdError + 'static)> = Some(err);
    while let Some(e) = current {
        if let Some(reason) = rustls_certificate_reason(e) {
            return Some(reason);
        }
        if let Some(io) = e.downcast_ref::<std::io::Error>()
            && let Some(inner) = io.get_ref()
            && let Some(reason) = rustls_certificate_reason(inner)
        {
            return Some(reason);
        }
        current = e.source();
    }

    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(e) = source {
        message.push_str(": ");
        message.push_str(&e.to_string());
        source = e.source();
    }
    let lower = message.to_ascii_lowercase();
    const MARKERS: &[&str] = &[
        "invalid peer certificate",
        "unknownissuer",
        "certificate verify failed",
        "self signed certificate",
    ];
    MARKERS
        .iter()
        .any(|m| lower.contains(m))
        .then_some(message)
}

fn rustls_certificate_reason(err: &(dyn StdError + 'static)) -> Option<String> {
    match err.downcast_ref::<rustls::Error>()? {
        rustls::Error::InvalidCertificate(reason) => Some(format!("{reason:?}")),
        rustls::Error::NoCertificatesPresented => Some("no certificate presented".to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_PEM: &str = r#"-----BEGIN CERTIFICATE-----
MIIBkTCB+wIJAKHBfpegE3jEMA0GCSqGSIb3DQEBCwUAMBExDzANBgNVBAMMBnRl
c3RjYTAeFw0yMzAxMDEwMDAwMDBaFw0yNDAxMDEwMDAwMDBaMBExDzANBgNVBAMM
BnRlc3RjYTBcMA0GCSqGSIb3DQEBAQUAA0sAMEgCQQC7o96HtiK7onnPevKSE2LL
oSXwnmfYwZPV2bvfGS18lK8F+DL+42IjT3ucMXnLBhzNCLNKE8yCVK6LPlsvpNlX
AgMBAAGjUzBRMB0GA1UdDgQWBBQgHGHqPcVi1N4CG7IxDJaFMvP6XTAfBgNVHSME
GDAWgBQgHGHqPcVi1N4CG7IxDJaFMvP6XTAPBgNVHRMBAf8EBTADAQH/MA0GCSqG
SIb3DQEBCwUAA0EAGLJHfg9dS/T39L6VQLJeZcpH7mY8vKaM9dM/Zn3HMhfc0Yjv
3hxMPmPGjjpQ9JKaLI0Rq7n5oEUP+xluoAAfrQ==
-----END CERTIFICATE-----"#;

    #[test]
    fn test_certificate_from_pem() {
        let cert = Certificate::from_pem(TEST_PEM).unwrap();
        assert_eq!(cert.len(), 1);
    }

    #[test]
    fn test_certificate_from_pem_without_certs_fails() {
        assert!(matches!(
            Certificate::from_pem("not a certificate"),
            Err(NetworkError::Tls(_))
        ));
    }

    #[test]
    fn test_tls_config_builder() {
        let config = TlsConfig::new()
            .add_root_certificate(Certificate::from_pem(TEST_PEM).unwrap())
            .min_version(TlsVersion::Tls1_3);
        assert_eq!(config.root_certificates.len(), 1);
        assert_eq!(config.min_version, TlsVersion::Tls1_3);
        assert!(!config.use_only_custom_roots);
    }

    #[test]
    fn test_detects_rustls_certificate_error_inside_io_error() {
        let tls = rustls::Error::InvalidCertificate(rustls::CertificateError::UnknownIssuer);
        let io = std::io::Error::new(std::io::ErrorKind::InvalidData, tls);
        let reason = untrusted_certificate_reason(&io).unwrap();
        assert!(reason.contains("UnknownIssuer"));
    }

    #[test]
    fn test_detects_certificate_error_from_message() {
        let io = std::io::Error::other("invalid peer certificate: UnknownIssuer");
        assert!(untrusted_certificate_reason(&io).is_some());
    }

    #[test]
    fn test_ignores_unrelated_errors() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "connection refused");
        assert!(untrusted_certificate_reason(&io).is_none());
    }
}
