//! rustls configuration builders

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::pem::{load_certs, load_private_key};
use crate::{ensure_crypto_provider, CertError};

/// Server-side TLS material
#[derive(Debug, Clone)]
pub struct TlsSettings {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    /// When set, peers must present a certificate signed by this CA
    pub client_ca_path: Option<PathBuf>,
}

impl TlsSettings {
    pub fn new(cert_path: impl Into<PathBuf>, key_path: impl Into<PathBuf>) -> Self {
        Self {
            cert_path: cert_path.into(),
            key_path: key_path.into(),
            client_ca_path: None,
        }
    }

    /// Require client certificates signed by the CA in `path`
    pub fn with_client_ca(mut self, path: impl Into<PathBuf>) -> Self {
        self.client_ca_path = Some(path.into());
        self
    }

    /// Build a rustls server configuration
    pub fn server_config(&self) -> Result<ServerConfig, CertError> {
        ensure_crypto_provider();

        let certs = load_certs(&self.cert_path)?;
        let key = load_private_key(&self.key_path)?;

        let builder = ServerConfig::builder();
        let config = match &self.client_ca_path {
            Some(ca_path) => {
                let roots = load_roots(ca_path)?;
                let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
                    .build()
                    .map_err(|e| CertError::ClientVerifier(e.to_string()))?;
                builder
                    .with_client_cert_verifier(verifier)
                    .with_single_cert(certs, key)?
            }
            None => builder.with_no_client_auth().with_single_cert(certs, key)?,
        };

        Ok(config)
    }
}

/// Client-side TLS settings used by agents and end-user clients
#[derive(Debug, Clone, Default)]
pub struct ClientTlsSettings {
    /// Trust this CA instead of the public web roots
    pub ca_cert_path: Option<PathBuf>,
    /// Present this certificate/key pair to servers that require it
    pub client_cert: Option<(PathBuf, PathBuf)>,
    /// Skip server certificate verification (INSECURE, development only)
    pub insecure_skip_verify: bool,
}

impl ClientTlsSettings {
    pub fn with_ca_cert(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_cert_path = Some(path.into());
        self
    }

    pub fn with_client_cert(
        mut self,
        cert_path: impl Into<PathBuf>,
        key_path: impl Into<PathBuf>,
    ) -> Self {
        self.client_cert = Some((cert_path.into(), key_path.into()));
        self
    }

    /// Disable server certificate verification (INSECURE)
    pub fn with_insecure_skip_verify(mut self) -> Self {
        self.insecure_skip_verify = true;
        self
    }

    /// Build a rustls client configuration
    pub fn client_config(&self) -> Result<ClientConfig, CertError> {
        ensure_crypto_provider();

        let builder = if self.insecure_skip_verify {
            tracing::warn!("TLS server certificate verification is DISABLED");
            ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(SkipVerification::new())
        } else {
            let roots = match &self.ca_cert_path {
                Some(path) => load_roots(path)?,
                None => {
                    let mut roots = RootCertStore::empty();
                    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
                    roots
                }
            };
            ClientConfig::builder().with_root_certificates(roots)
        };

        let config = match &self.client_cert {
            Some((cert_path, key_path)) => {
                let certs = load_certs(cert_path)?;
                let key = load_private_key(key_path)?;
                builder.with_client_auth_cert(certs, key)?
            }
            None => builder.with_no_client_auth(),
        };

        Ok(config)
    }
}

fn load_roots(path: &Path) -> Result<RootCertStore, CertError> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots.add(cert)?;
    }
    Ok(roots)
}

// Certificate verifier that skips verification (INSECURE)
#[derive(Debug)]
struct SkipVerification;

impl SkipVerification {
    fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

impl ServerCertVerifier for SkipVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
            SignatureScheme::ED448,
        ]
    }
}
