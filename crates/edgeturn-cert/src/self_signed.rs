//! Self-signed certificate generation for development and testing
//!
//! **Do not use in production.** Relays facing real agents should be given
//! certificates issued by the site's CA.

use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, SerialNumber};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::path::{Path, PathBuf};

use crate::CertError;

/// A self-signed certificate with its private key
pub struct SelfSignedCertificate {
    /// Certificate in DER format
    pub cert_der: CertificateDer<'static>,

    /// Private key in DER format
    pub key_der: PrivateKeyDer<'static>,

    /// Certificate in PEM format
    pub pem_cert: String,

    /// Private key in PEM format
    pub pem_key: String,
}

impl std::fmt::Debug for SelfSignedCertificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SelfSignedCertificate")
            .field("pem_cert", &self.pem_cert)
            .finish_non_exhaustive()
    }
}

impl SelfSignedCertificate {
    /// Save certificate and key to PEM files
    pub fn save_to_files(&self, cert_path: &Path, key_path: &Path) -> std::io::Result<()> {
        std::fs::write(cert_path, &self.pem_cert)?;
        std::fs::write(key_path, &self.pem_key)?;
        Ok(())
    }

    /// Save as `cert.pem` and `key.pem` inside `dir`
    pub fn save_to_dir(&self, dir: &Path) -> std::io::Result<(PathBuf, PathBuf)> {
        std::fs::create_dir_all(dir)?;
        let cert_path = dir.join("cert.pem");
        let key_path = dir.join("key.pem");
        self.save_to_files(&cert_path, &key_path)?;
        Ok((cert_path, key_path))
    }
}

/// Generate a self-signed certificate valid for `names`.
///
/// Names that parse as IP addresses become IP SANs, everything else a DNS
/// SAN. An empty list defaults to `localhost` and `127.0.0.1`.
pub fn generate_self_signed_cert(names: &[&str]) -> Result<SelfSignedCertificate, CertError> {
    let names: Vec<String> = if names.is_empty() {
        vec!["localhost".to_string(), "127.0.0.1".to_string()]
    } else {
        names.iter().map(|n| n.to_string()).collect()
    };

    let mut params =
        CertificateParams::new(names).map_err(|e| CertError::Generation(e.to_string()))?;

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "EdgeTurn Development Certificate");
    dn.push(DnType::OrganizationName, "EdgeTurn Dev");
    params.distinguished_name = dn;

    params.serial_number = Some(SerialNumber::from(rand::random::<u64>()));

    let key_pair = KeyPair::generate().map_err(|e| CertError::Generation(e.to_string()))?;
    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| CertError::Generation(e.to_string()))?;

    let key_der = PrivateKeyDer::try_from(key_pair.serialize_der())
        .map_err(|e| CertError::Generation(e.to_string()))?;

    Ok(SelfSignedCertificate {
        cert_der: cert.der().clone(),
        key_der,
        pem_cert: cert.pem(),
        pem_key: key_pair.serialize_pem(),
    })
}
