//! TLS configuration for listeners and intra-cluster dialing.
//!
//! Listeners request a client certificate but never fail the handshake over
//! it; trust is decided at the admission layer by fingerprint. When an
//! operator installs a CA bundle, each presented client chain is additionally
//! verified against it after the handshake and the result is stamped onto
//! the request, so the `core.trust_ca_certificates` switch can admit
//! CA-signed keys that are not individually pinned. Outbound cluster
//! connections pin the expected peer certificate fingerprint instead of
//! using web PKI.

use crate::security::certs::{fingerprint_der, CertInfo};
use rustls::client::{ServerCertVerified, ServerCertVerifier};
use rustls::server::{AllowAnyAuthenticatedClient, ClientCertVerified, ClientCertVerifier};
use rustls::{
    Certificate, ClientConfig, DistinguishedName, Error as TlsError, RootCertStore, ServerConfig,
    ServerName,
};
use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;

/// Accepts any client certificate (or none); identity is established later
/// by matching fingerprints against the trust cache.
struct AcceptAnyClient {
    subjects: Vec<DistinguishedName>,
}

impl ClientCertVerifier for AcceptAnyClient {
    fn offer_client_auth(&self) -> bool {
        true
    }

    fn client_auth_mandatory(&self) -> bool {
        false
    }

    fn client_auth_root_subjects(&self) -> &[DistinguishedName] {
        &self.subjects
    }

    fn verify_client_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _now: SystemTime,
    ) -> Result<ClientCertVerified, TlsError> {
        Ok(ClientCertVerified::assertion())
    }
}

/// Operator-installed CA roots. Client chains are checked against these
/// after the handshake; the outcome travels with the request so admission
/// can honour the trust-CA switch.
pub struct TrustedCaBundle {
    verifier: AllowAnyAuthenticatedClient,
}

impl std::fmt::Debug for TrustedCaBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrustedCaBundle").finish()
    }
}

impl TrustedCaBundle {
    /// Loads the PEM bundle at `path`. A missing file means no bundle is
    /// installed; a present but unparsable one is a configuration error.
    pub fn load(path: &Path) -> Result<Option<Self>, super::NetError> {
        if !path.exists() {
            return Ok(None);
        }
        let pem = std::fs::read(path)?;
        let mut reader = std::io::Cursor::new(&pem);
        let raw = rustls_pemfile::certs(&mut reader)
            .map_err(|_| super::NetError::InvalidCaBundle(path.display().to_string()))?;
        let mut roots = RootCertStore::empty();
        let (added, _skipped) = roots.add_parsable_certificates(&raw);
        if added == 0 {
            return Err(super::NetError::InvalidCaBundle(path.display().to_string()));
        }
        Ok(Some(Self {
            verifier: AllowAnyAuthenticatedClient::new(roots),
        }))
    }

    /// Whether the presented DER chain verifies against the installed roots.
    pub fn verifies(&self, chain: &[Vec<u8>]) -> bool {
        let Some((end_entity, intermediates)) = chain.split_first() else {
            return false;
        };
        let end_entity = Certificate(end_entity.clone());
        let intermediates: Vec<Certificate> =
            intermediates.iter().cloned().map(Certificate).collect();
        self.verifier
            .verify_client_cert(&end_entity, &intermediates, SystemTime::now())
            .is_ok()
    }
}

/// Accepts exactly the pinned certificate; with no pin, any certificate is
/// accepted (first-contact handshakes).
struct PinnedServerVerifier {
    expected_fingerprint: Option<String>,
}

impl ServerCertVerifier for PinnedServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> Result<ServerCertVerified, TlsError> {
        if let Some(expected) = &self.expected_fingerprint {
            let observed = fingerprint_der(&end_entity.0);
            if &observed != expected {
                return Err(TlsError::General(format!(
                    "server certificate fingerprint mismatch (expected {expected}, got {observed})"
                )));
            }
        }
        Ok(ServerCertVerified::assertion())
    }
}

pub fn server_config(cert: &CertInfo) -> Result<Arc<ServerConfig>, TlsError> {
    let verifier = Arc::new(AcceptAnyClient {
        subjects: Vec::new(),
    });
    let config = ServerConfig::builder()
        .with_safe_defaults()
        .with_client_cert_verifier(verifier)
        .with_single_cert(cert.chain().to_vec(), cert.private_key().clone())?;
    Ok(Arc::new(config))
}

pub fn client_config(
    cert: &CertInfo,
    expected_fingerprint: Option<String>,
) -> Result<Arc<ClientConfig>, TlsError> {
    let config = ClientConfig::builder()
        .with_safe_defaults()
        .with_custom_certificate_verifier(Arc::new(PinnedServerVerifier {
            expected_fingerprint,
        }))
        .with_client_auth_cert(cert.chain().to_vec(), cert.private_key().clone())?;
    Ok(Arc::new(config))
}
