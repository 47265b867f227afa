//! TLS setup for STARTTLS upgrades

use std::fs;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use thiserror::Error;
use tokio_rustls::TlsAcceptor;
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::rustls::pki_types::CertificateDer;

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("could not open {path}: {source}")]
    Open {
        path: String,
        source: std::io::Error,
    },
    #[error("could not parse certificate: {0}")]
    ParseCert(std::io::Error),
    #[error("no certificates found in {0}")]
    NoCerts(String),
    #[error("could not parse private key: {0}")]
    ParseKey(std::io::Error),
    #[error("no private key found in {0}")]
    NoKey(String),
    #[error("invalid TLS configuration: {0}")]
    Config(#[from] tokio_rustls::rustls::Error),
}

fn open(path: &Path) -> Result<BufReader<fs::File>, TlsError> {
    fs::File::open(path)
        .map(BufReader::new)
        .map_err(|source| TlsError::Open {
            path: path.display().to_string(),
            source,
        })
}

/// Load a TLS acceptor from PEM certificate chain and key files
pub fn load_tls_acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor, TlsError> {
    let mut cert_reader = open(cert_path)?;
    let certs: Vec<CertificateDer> = rustls_pemfile::certs(&mut cert_reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(TlsError::ParseCert)?;

    if certs.is_empty() {
        return Err(TlsError::NoCerts(cert_path.display().to_string()));
    }

    let mut key_reader = open(key_path)?;
    let private_key = rustls_pemfile::private_key(&mut key_reader)
        .map_err(TlsError::ParseKey)?
        .ok_or_else(|| TlsError::NoKey(key_path.display().to_string()))?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, private_key)?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file() {
        let dir = TempDir::new().unwrap();
        let result = load_tls_acceptor(&dir.path().join("cert.pem"), &dir.path().join("key.pem"));
        assert!(matches!(result, Err(TlsError::Open { .. })));
    }

    #[test]
    fn test_empty_certificate_file() {
        let dir = TempDir::new().unwrap();
        let cert = dir.path().join("cert.pem");
        let key = dir.path().join("key.pem");
        fs::write(&cert, "").unwrap();
        fs::write(&key, "").unwrap();

        let result = load_tls_acceptor(&cert, &key);
        assert!(matches!(result, Err(TlsError::NoCerts(_))));
    }
}
