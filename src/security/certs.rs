//! Identity certificate material.
//!
//! Each daemon carries two identities: the network (cluster) certificate
//! shared by all listeners, and the per-server certificate used for
//! intra-cluster client authentication. Both are PEM files under the var
//! directory, generated on first start when missing.

use rcgen::{CertificateParams, DnType, KeyPair};
use rustls::{Certificate as TlsCertificate, PrivateKey};
use sha2::{Digest, Sha256};
use std::io::Cursor;
use std::path::Path;
use thiserror::Error;
use x509_parser::prelude::{FromDer, X509Certificate};

#[derive(Debug, Error)]
pub enum CertificateError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("certificate chain is empty")]
    EmptyChain,
    #[error("invalid certificate PEM")]
    InvalidCertPem,
    #[error("unsupported or missing private key material")]
    MissingPrivateKey,
    #[error("certificate generation failed: {0}")]
    Generate(String),
    #[error("x509 parse error: {0}")]
    X509Parse(String),
}

/// SHA-256 fingerprint of a DER certificate, lowercase hex.
pub fn fingerprint_der(der: &[u8]) -> String {
    hex::encode(Sha256::digest(der))
}

/// Decodes the first certificate out of a PEM bundle into DER.
pub fn cert_der_from_pem(pem: &str) -> Result<Vec<u8>, CertificateError> {
    let mut reader = Cursor::new(pem.as_bytes());
    let certs =
        rustls_pemfile::certs(&mut reader).map_err(|_| CertificateError::InvalidCertPem)?;
    certs
        .into_iter()
        .next()
        .ok_or(CertificateError::InvalidCertPem)
}

/// A loaded identity: certificate chain, private key and cached fingerprint.
#[derive(Clone)]
pub struct CertInfo {
    chain: Vec<TlsCertificate>,
    key: PrivateKey,
    fingerprint: String,
}

impl std::fmt::Debug for CertInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertInfo")
            .field("fingerprint", &self.fingerprint)
            .finish()
    }
}

impl CertInfo {
    pub fn from_material(
        chain: Vec<TlsCertificate>,
        key: PrivateKey,
    ) -> Result<Self, CertificateError> {
        let leaf = chain.first().ok_or(CertificateError::EmptyChain)?;
        let fingerprint = fingerprint_der(&leaf.0);
        Ok(Self {
            chain,
            key,
            fingerprint,
        })
    }

    /// Loads `<dir>/<basename>.crt` + `.key`, generating a fresh self-signed
    /// pair when either file is missing.
    pub fn load_or_generate(
        dir: &Path,
        basename: &str,
        common_name: &str,
    ) -> Result<Self, CertificateError> {
        let cert_path = dir.join(format!("{basename}.crt"));
        let key_path = dir.join(format!("{basename}.key"));
        if !cert_path.exists() || !key_path.exists() {
            let (cert_pem, key_pem) = generate_self_signed(common_name)?;
            std::fs::write(&cert_path, &cert_pem)?;
            write_private(&key_path, &key_pem)?;
        }
        Self::load(&cert_path, &key_path)
    }

    pub fn load(cert_path: &Path, key_path: &Path) -> Result<Self, CertificateError> {
        let cert_pem = std::fs::read(cert_path)?;
        let mut reader = Cursor::new(&cert_pem);
        let chain: Vec<TlsCertificate> = rustls_pemfile::certs(&mut reader)
            .map_err(|_| CertificateError::InvalidCertPem)?
            .into_iter()
            .map(TlsCertificate)
            .collect();

        let key_pem = std::fs::read(key_path)?;
        let key = parse_private_key(&key_pem)?;
        Self::from_material(chain, key)
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn chain(&self) -> &[TlsCertificate] {
        &self.chain
    }

    pub fn leaf_der(&self) -> &[u8] {
        &self.chain[0].0
    }

    pub fn private_key(&self) -> &PrivateKey {
        &self.key
    }

    /// Seconds until the leaf certificate expires, None when unparsable.
    /// Used by the renewal task to decide whether to regenerate.
    pub fn seconds_until_expiry(&self) -> Option<i64> {
        let (_, parsed) = X509Certificate::from_der(self.leaf_der()).ok()?;
        let not_after = parsed.validity().not_after.timestamp();
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .ok()?
            .as_secs() as i64;
        Some(not_after - now)
    }
}

fn parse_private_key(pem: &[u8]) -> Result<PrivateKey, CertificateError> {
    let mut reader = Cursor::new(pem);
    if let Ok(keys) = rustls_pemfile::pkcs8_private_keys(&mut reader) {
        if let Some(key) = keys.into_iter().next() {
            return Ok(PrivateKey(key));
        }
    }
    let mut reader = Cursor::new(pem);
    if let Ok(keys) = rustls_pemfile::rsa_private_keys(&mut reader) {
        if let Some(key) = keys.into_iter().next() {
            return Ok(PrivateKey(key));
        }
    }
    let mut reader = Cursor::new(pem);
    if let Ok(keys) = rustls_pemfile::ec_private_keys(&mut reader) {
        if let Some(key) = keys.into_iter().next() {
            return Ok(PrivateKey(key));
        }
    }
    Err(CertificateError::MissingPrivateKey)
}

fn generate_self_signed(common_name: &str) -> Result<(String, String), CertificateError> {
    let mut params = CertificateParams::new(vec![common_name.to_string()])
        .map_err(|err| CertificateError::Generate(err.to_string()))?;
    params
        .distinguished_name
        .push(DnType::CommonName, common_name);
    let key = KeyPair::generate().map_err(|err| CertificateError::Generate(err.to_string()))?;
    let cert = params
        .self_signed(&key)
        .map_err(|err| CertificateError::Generate(err.to_string()))?;
    Ok((cert.pem(), key.serialize_pem()))
}

fn write_private(path: &Path, contents: &str) -> Result<(), CertificateError> {
    use std::os::unix::fs::OpenOptionsExt;
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true).mode(0o600);
    let mut file = options.open(path)?;
    std::io::Write::write_all(&mut file, contents.as_bytes())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn generates_identity_once_and_reloads() {
        let dir = TempDir::new().unwrap();
        let first = CertInfo::load_or_generate(dir.path(), "cluster", "node1").unwrap();
        let second = CertInfo::load_or_generate(dir.path(), "cluster", "node1").unwrap();
        assert_eq!(first.fingerprint(), second.fingerprint());
        assert_eq!(first.fingerprint().len(), 64);
    }

    #[test]
    fn distinct_identities_have_distinct_fingerprints() {
        let dir = TempDir::new().unwrap();
        let network = CertInfo::load_or_generate(dir.path(), "cluster", "node1").unwrap();
        let server = CertInfo::load_or_generate(dir.path(), "server", "node1").unwrap();
        assert_ne!(network.fingerprint(), server.fingerprint());
    }

    #[test]
    fn expiry_is_in_the_future_for_fresh_certs() {
        let dir = TempDir::new().unwrap();
        let cert = CertInfo::load_or_generate(dir.path(), "cluster", "node1").unwrap();
        let remaining = cert.seconds_until_expiry().unwrap();
        assert!(remaining > 0);
    }
}
