//! TLS material for EdgeTurn listeners and dialers
//!
//! Certificates are issued elsewhere and consumed here as PEM files. This
//! crate turns them into rustls server and client configurations, and can
//! mint a self-signed certificate for development and tests.

pub mod pem;
pub mod self_signed;
pub mod tls;

pub use pem::{load_certs, load_private_key};
pub use self_signed::{generate_self_signed_cert, SelfSignedCertificate};
pub use tls::{ClientTlsSettings, TlsSettings};

use thiserror::Error;

/// Certificate and TLS configuration errors
#[derive(Debug, Error)]
pub enum CertError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("No certificates found in {0}")]
    NoCertificates(String),

    #[error("No private key found in {0}")]
    NoPrivateKey(String),

    #[error("Invalid TLS configuration: {0}")]
    Tls(#[from] rustls::Error),

    #[error("Invalid client CA: {0}")]
    ClientVerifier(String),

    #[error("Certificate generation failed: {0}")]
    Generation(String),
}

static CRYPTO_PROVIDER_INIT: std::sync::Once = std::sync::Once::new();

/// Install the ring crypto provider as the process default (once)
pub fn ensure_crypto_provider() {
    CRYPTO_PROVIDER_INIT.call_once(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            tracing::debug!("Rustls crypto provider already installed");
        }
    });
}
