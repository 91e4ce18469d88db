//! Certificate loading for STARTTLS.
//!
//! Reads a PEM certificate chain and private key and turns them into a
//! `TlsAcceptor` shared by every session. Any failure here is fatal at
//! startup.

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;
use tracing::debug;

/// Build a TLS acceptor from PEM files. `cert` and `key` may name the same
/// file.
pub fn load_acceptor(cert: &Path, key: &Path) -> Result<TlsAcceptor, TlsError> {
    let certs = load_certs(cert)?;
    let key = load_key(key)?;

    debug!(chain_len = certs.len(), "Loaded certificate chain");

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(certs, key)?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let file = File::open(path).map_err(|e| TlsError::Read(path.to_path_buf(), e))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::Read(path.to_path_buf(), e))?;

    if certs.is_empty() {
        return Err(TlsError::NoCertificates(path.to_path_buf()));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let file = File::open(path).map_err(|e| TlsError::Read(path.to_path_buf(), e))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| TlsError::Read(path.to_path_buf(), e))?
        .ok_or_else(|| TlsError::NoPrivateKey(path.to_path_buf()))
}

/// Certificate loading errors
#[derive(Debug)]
pub enum TlsError {
    Read(PathBuf, std::io::Error),
    NoCertificates(PathBuf),
    NoPrivateKey(PathBuf),
    Rustls(rustls::Error),
}

impl From<rustls::Error> for TlsError {
    fn from(e: rustls::Error) -> Self {
        TlsError::Rustls(e)
    }
}

impl std::fmt::Display for TlsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TlsError::Read(path, e) => {
                write!(f, "Failed to read '{}': {}", path.display(), e)
            }
            TlsError::NoCertificates(path) => {
                write!(f, "No certificate found in '{}'", path.display())
            }
            TlsError::NoPrivateKey(path) => {
                write!(f, "No private key found in '{}'", path.display())
            }
            TlsError::Rustls(e) => write!(f, "Invalid certificate material: {}", e),
        }
    }
}

impl std::error::Error for TlsError {}

/// Path to a PEM file under `tests/fixtures`.
#[cfg(test)]
pub(crate) fn fixture(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name)
}
