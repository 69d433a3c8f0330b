// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::TlsError;

/// The node's certificate chain and private key, shared by the server and the outbound client.
#[derive(Clone)]
pub struct Certificate {
    certificate_pem: String,
    private_key_pem: String,
    fingerprint: String,
}

impl Certificate {
    /// Parses both PEM blocks up front so that a bad certificate fails at startup.
    pub fn from_pem(
        certificate_pem: impl Into<String>,
        private_key_pem: impl Into<String>,
    ) -> Result<Self, TlsError> {
        let certificate_pem = certificate_pem.into();
        let private_key_pem = private_key_pem.into();

        let chain = load_certs_from_pem(certificate_pem.as_bytes())?;
        load_private_key_from_pem(private_key_pem.as_bytes())?;
        let fingerprint = chain
            .first()
            .map(|leaf| fingerprint(leaf.as_ref()))
            .ok_or(TlsError::NoCertificates)?;

        Ok(Certificate {
            certificate_pem,
            private_key_pem,
            fingerprint,
        })
    }

    pub fn certificate_pem(&self) -> &str {
        &self.certificate_pem
    }

    pub fn private_key_pem(&self) -> &str {
        &self.private_key_pem
    }

    /// Lowercase hex SHA-256 of the leaf certificate.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn certificate_chain(&self) -> Result<Vec<CertificateDer<'static>>, TlsError> {
        load_certs_from_pem(self.certificate_pem.as_bytes())
    }

    pub fn private_key(&self) -> Result<PrivateKeyDer<'static>, TlsError> {
        load_private_key_from_pem(self.private_key_pem.as_bytes())
    }
}

impl fmt::Debug for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Certificate")
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

pub trait CertificateProvider: Send + Sync {
    fn certificate(&self) -> Result<Certificate, TlsError>;
}

/// Reads the certificate and key from PEM files each time one is requested.
#[derive(Debug, Clone)]
pub struct FileCertificateProvider {
    certificate_file: PathBuf,
    private_key_file: PathBuf,
}

impl FileCertificateProvider {
    pub fn new(
        certificate_file: impl Into<PathBuf>,
        private_key_file: impl Into<PathBuf>,
    ) -> Self {
        FileCertificateProvider {
            certificate_file: certificate_file.into(),
            private_key_file: private_key_file.into(),
        }
    }
}

impl CertificateProvider for FileCertificateProvider {
    fn certificate(&self) -> Result<Certificate, TlsError> {
        let certificate_pem = read_pem_file(&self.certificate_file)?;
        let private_key_pem = read_pem_file(&self.private_key_file)?;
        Certificate::from_pem(certificate_pem, private_key_pem)
    }
}

fn read_pem_file(path: &Path) -> Result<String, TlsError> {
    std::fs::read_to_string(path).map_err(|source| TlsError::Read {
        path: path.display().to_string(),
        source,
    })
}

pub fn fingerprint(der: &[u8]) -> String {
    Sha256::digest(der)
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

pub fn load_certs_from_pem(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let mut cursor = std::io::Cursor::new(pem);
    let certs = rustls_pemfile::certs(&mut cursor).collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificates);
    }
    Ok(certs)
}

pub fn load_private_key_from_pem(pem: &[u8]) -> Result<PrivateKeyDer<'static>, TlsError> {
    let mut cursor = std::io::Cursor::new(pem);
    rustls_pemfile::private_key(&mut cursor)?.ok_or(TlsError::NoPrivateKey)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn self_signed() -> (String, String) {
        let rcgen::CertifiedKey { cert, key_pair } =
            rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        (cert.pem(), key_pair.serialize_pem())
    }

    #[test]
    fn test_from_pem_computes_leaf_fingerprint() {
        let (cert_pem, key_pem) = self_signed();
        let certificate = Certificate::from_pem(cert_pem.clone(), key_pem).unwrap();

        let leaf = load_certs_from_pem(cert_pem.as_bytes()).unwrap().remove(0);
        assert_eq!(certificate.fingerprint(), fingerprint(leaf.as_ref()));
        assert_eq!(certificate.fingerprint().len(), 64);
        assert!(certificate
            .fingerprint()
            .chars()
            .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_from_pem_rejects_missing_parts() {
        let (cert_pem, key_pem) = self_signed();
        assert!(matches!(
            Certificate::from_pem("not a certificate", key_pem),
            Err(TlsError::NoCertificates)
        ));
        assert!(matches!(
            Certificate::from_pem(cert_pem, ""),
            Err(TlsError::NoPrivateKey)
        ));
    }

    #[test]
    fn test_debug_hides_private_key() {
        let (cert_pem, key_pem) = self_signed();
        let certificate = Certificate::from_pem(cert_pem, key_pem.clone()).unwrap();
        assert!(!format!("{certificate:?}").contains(&key_pem));
    }

    #[test]
    fn test_file_provider_reads_pem_files() {
        let (cert_pem, key_pem) = self_signed();
        let mut cert_file = tempfile::NamedTempFile::new().unwrap();
        cert_file.write_all(cert_pem.as_bytes()).unwrap();
        let mut key_file = tempfile::NamedTempFile::new().unwrap();
        key_file.write_all(key_pem.as_bytes()).unwrap();

        let provider = FileCertificateProvider::new(cert_file.path(), key_file.path());
        let certificate = provider.certificate().unwrap();
        assert_eq!(certificate.certificate_pem(), cert_pem);
    }

    #[test]
    fn test_file_provider_reports_missing_file() {
        let provider =
            FileCertificateProvider::new("/nonexistent/cert.pem", "/nonexistent/key.pem");
        match provider.certificate() {
            Err(TlsError::Read { path, .. }) => assert_eq!(path, "/nonexistent/cert.pem"),
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
