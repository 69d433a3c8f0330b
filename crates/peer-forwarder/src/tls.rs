// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! rustls configuration for both ends of a peer connection.
//!
//! Peers trust each other in one of three ways:
//! - chain verification against the certificates in the node's own PEM,
//! - fingerprint only, where the peer's leaf must match our own leaf's SHA-256,
//! - no verification at all (client side, `ssl_insecure_disable_verification`).

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::server::WebPkiClientVerifier;
use rustls::{DigitallySignedStruct, DistinguishedName, RootCertStore, SignatureScheme};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::certificate::{fingerprint, Certificate};
use crate::config::PeerForwarderConfiguration;
use crate::error::TlsError;

pub fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn root_store(certificate: &Certificate) -> Result<RootCertStore, TlsError> {
    let mut roots = RootCertStore::empty();
    for cert in certificate.certificate_chain()? {
        roots.add(cert)?;
    }
    Ok(roots)
}

/// Server side TLS. With `mutual_tls` every client must present a certificate, checked
/// either by chain or by fingerprint.
pub fn server_tls_config(
    certificate: &Certificate,
    mutual_tls: bool,
    fingerprint_verification_only: bool,
) -> Result<Arc<rustls::ServerConfig>, TlsError> {
    let provider = crypto_provider();
    let builder = rustls::ServerConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()?;

    let builder = if !mutual_tls {
        builder.with_no_client_auth()
    } else if fingerprint_verification_only {
        debug!("Peer forwarder server verifying client certificates by fingerprint only");
        builder.with_client_cert_verifier(Arc::new(FingerprintClientVerifier {
            fingerprint: certificate.fingerprint().to_string(),
            provider: Arc::clone(&provider),
        }))
    } else {
        let roots = Arc::new(root_store(certificate)?);
        let verifier = WebPkiClientVerifier::builder_with_provider(roots, provider).build()?;
        builder.with_client_cert_verifier(verifier)
    };

    let config =
        builder.with_single_cert(certificate.certificate_chain()?, certificate.private_key()?)?;
    Ok(Arc::new(config))
}

/// Client side TLS matching the server configuration of the peers.
pub fn client_tls_config(
    certificate: &Certificate,
    mutual_tls: bool,
    fingerprint_verification_only: bool,
    insecure_disable_verification: bool,
) -> Result<rustls::ClientConfig, TlsError> {
    let provider = crypto_provider();
    let builder = rustls::ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()?;

    let builder = if insecure_disable_verification {
        warn!("Peer forwarder client is not verifying peer certificates");
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(FingerprintServerVerifier {
                fingerprint: None,
                provider,
            }))
    } else if fingerprint_verification_only {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(FingerprintServerVerifier {
                fingerprint: Some(certificate.fingerprint().to_string()),
                provider,
            }))
    } else {
        builder.with_root_certificates(root_store(certificate)?)
    };

    let config = if mutual_tls {
        builder
            .with_client_auth_cert(certificate.certificate_chain()?, certificate.private_key()?)?
    } else {
        builder.with_no_client_auth()
    };
    Ok(config)
}

/// Builds the HTTP client used to forward batches to peers.
pub fn build_peer_client(
    config: &PeerForwarderConfiguration,
    certificate: Option<&Certificate>,
) -> Result<reqwest::Client, TlsError> {
    let builder = reqwest::Client::builder()
        .timeout(config.client_timeout())
        .pool_idle_timeout(Duration::from_secs(90));

    let builder = if config.ssl {
        let certificate = certificate.ok_or(TlsError::NoCertificates)?;
        builder.use_preconfigured_tls(client_tls_config(
            certificate,
            config.is_mutual_tls(),
            config.ssl_fingerprint_verification_only,
            config.ssl_insecure_disable_verification,
        )?)
    } else {
        builder
    };
    Ok(builder.build()?)
}

fn check_fingerprint(
    expected: &str,
    end_entity: &CertificateDer<'_>,
) -> Result<(), rustls::Error> {
    let actual = fingerprint(end_entity.as_ref());
    if actual == expected {
        Ok(())
    } else {
        Err(rustls::Error::General(format!(
            "Certificate fingerprint {actual} does not match the expected fingerprint"
        )))
    }
}

/// Accepts a server whose leaf certificate has the expected fingerprint. With no expected
/// fingerprint every certificate is accepted.
#[derive(Debug)]
struct FingerprintServerVerifier {
    fingerprint: Option<String>,
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for FingerprintServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        if let Some(expected) = &self.fingerprint {
            check_fingerprint(expected, end_entity)?;
        }
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
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

#[derive(Debug)]
struct FingerprintClientVerifier {
    fingerprint: String,
    provider: Arc<CryptoProvider>,
}

impl ClientCertVerifier for FingerprintClientVerifier {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        check_fingerprint(&self.fingerprint, end_entity)?;
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
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
