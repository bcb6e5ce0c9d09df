//! PEM file loading

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use crate::CertError;

fn open(path: &Path) -> Result<BufReader<File>, CertError> {
    let file = File::open(path).map_err(|source| CertError::Io {
        path: path.display().to_string(),
        source,
    })?;
    Ok(BufReader::new(file))
}

/// Load every certificate in a PEM file
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, CertError> {
    let mut reader = open(path)?;

    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| CertError::Io {
            path: path.display().to_string(),
            source,
        })?;

    if certs.is_empty() {
        return Err(CertError::NoCertificates(path.display().to_string()));
    }
    Ok(certs)
}

/// Load the first private key (PKCS#8, PKCS#1 or SEC1) in a PEM file
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, CertError> {
    let mut reader = open(path)?;

    rustls_pemfile::private_key(&mut reader)
        .map_err(|source| CertError::Io {
            path: path.display().to_string(),
            source,
        })?
        .ok_or_else(|| CertError::NoPrivateKey(path.display().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generate_self_signed_cert;

    #[test]
    fn test_load_generated_pem() {
        let dir = tempfile::tempdir().unwrap();
        let cert = generate_self_signed_cert(&["localhost"]).unwrap();
        let (cert_path, key_path) = cert.save_to_dir(dir.path()).unwrap();

        assert_eq!(load_certs(&cert_path).unwrap().len(), 1);
        assert!(load_private_key(&key_path).is_ok());
    }

    #[test]
    fn test_missing_file() {
        let err = load_certs(Path::new("/nonexistent/cert.pem")).unwrap_err();
        assert!(matches!(err, CertError::Io { .. }));
    }

    #[test]
    fn test_file_without_pem_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.pem");
        std::fs::write(&path, "not a certificate\n").unwrap();

        assert!(matches!(
            load_certs(&path),
            Err(CertError::NoCertificates(_))
        ));
        assert!(matches!(
            load_private_key(&path),
            Err(CertError::NoPrivateKey(_))
        ));
    }
}
