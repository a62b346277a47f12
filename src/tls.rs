use rustls::ServerConfig;
use thiserror::Error;

use crate::config::TlsConfig;

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("no certificates found in {0}")]
    NoCertificates(String),
    #[error("no private key found in {0}")]
    NoPrivateKey(String),
    #[error("certificate and key are not usable together: {0}")]
    Rejected(#[from] rustls::Error),
}

/// PEM contents of a certificate chain and key that rustls accepted.
pub struct TlsMaterial {
    pub cert_pem: Vec<u8>,
    pub key_pem: Vec<u8>,
}

fn read(path: &str) -> Result<Vec<u8>, TlsError> {
    std::fs::read(path).map_err(|source| TlsError::Io {
        path: path.to_string(),
        source,
    })
}

/// Reads the configured PEM files once and checks them with rustls, so a
/// broken setup is caught before the listener starts.
pub fn load_tls_material(config: &TlsConfig) -> Result<TlsMaterial, TlsError> {
    let cert_pem = read(&config.cert_path)?;
    let key_pem = read(&config.key_path)?;

    let certs = rustls_pemfile::certs(&mut cert_pem.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| TlsError::Io {
            path: config.cert_path.clone(),
            source,
        })?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificates(config.cert_path.clone()));
    }

    let key = rustls_pemfile::private_key(&mut key_pem.as_slice())
        .map_err(|source| TlsError::Io {
            path: config.key_path.clone(),
            source,
        })?
        .ok_or_else(|| TlsError::NoPrivateKey(config.key_path.clone()))?;

    ServerConfig::builder().with_no_client_auth().with_single_cert(certs, key)?;

    Ok(TlsMaterial { cert_pem, key_pem })
}
