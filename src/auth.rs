//! Request authentication.
//!
//! Classifies every inbound request as cluster-peer, unix-peer, OIDC,
//! TLS-client or untrusted. This validates identity only; authorization
//! happens later in the admission pipeline.

use crate::api::request::{RemoteAddr, RequestInfo};
use crate::daemon::Daemon;
use crate::security::cache::{CertKind, TrustEntry, TrustSnapshot};
use crate::security::certs::fingerprint_der;
use crate::security::oidc;
use std::collections::{BTreeSet, HashMap};
use thiserror::Error;

/// How a trusted request was authenticated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Cluster,
    Unix,
    Oidc,
    Tls,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Cluster => "cluster",
            Protocol::Unix => "unix",
            Protocol::Oidc => "oidc",
            Protocol::Tls => "tls",
        }
    }
}

/// Access granted to an authenticated request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserAccess {
    pub admin: bool,
    pub projects: BTreeSet<String>,
}

impl UserAccess {
    pub fn admin() -> Self {
        Self {
            admin: true,
            projects: BTreeSet::new(),
        }
    }

    pub fn restricted(projects: impl IntoIterator<Item = String>) -> Self {
        Self {
            admin: false,
            projects: projects.into_iter().collect(),
        }
    }
}

/// Identity and access attached to a request once admitted.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub username: String,
    pub protocol: Protocol,
    pub access: UserAccess,
    pub forwarded_address: Option<String>,
    pub forwarded_username: Option<String>,
    pub forwarded_protocol: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    Trusted { username: String, protocol: Protocol },
    Untrusted,
}

#[derive(Debug, Error)]
pub enum AuthFailure {
    #[error(transparent)]
    Oidc(#[from] oidc::AuthError),
    #[error("{0}")]
    Refused(String),
}

/// Header a cluster member sets when broadcasting a notification to peers.
pub const CLUSTER_NOTIFY_USER_AGENT: &str = "burrow-cluster-notifier";

fn is_cluster_notification(request: &RequestInfo) -> bool {
    request.header("user-agent") == Some(CLUSTER_NOTIFY_USER_AGENT)
}

/// Tests one peer certificate against a trust set. `extra_fingerprint`
/// extends the set (the network certificate for server-trust checks). When
/// `trust_ca` is on, a chain already verified against the installed CA
/// bundle during the handshake is accepted as well.
fn check_trust_state(
    der: &[u8],
    trusted: Option<&HashMap<String, TrustEntry>>,
    extra_fingerprint: Option<&str>,
    trust_ca: bool,
    ca_verified: bool,
) -> Option<String> {
    let fingerprint = fingerprint_der(der);
    if trust_ca && ca_verified {
        return Some(fingerprint);
    }
    if extra_fingerprint == Some(fingerprint.as_str()) {
        return Some(fingerprint);
    }
    if let Some(entries) = trusted {
        if entries.contains_key(&fingerprint) {
            return Some(fingerprint);
        }
    }
    None
}

fn username_for_uid(uid: u32) -> String {
    match nix::unistd::User::from_uid(nix::unistd::Uid::from_raw(uid)) {
        Ok(Some(user)) => user.name,
        _ => format!("uid={uid}"),
    }
}

/// Classifies a request. Order matters and is load-bearing: cluster peers
/// first, then local unix callers, then the refusal cases, then OIDC, then
/// metrics- and client-trust TLS matching.
pub fn authenticate(daemon: &Daemon, request: &RequestInfo) -> Result<AuthOutcome, AuthFailure> {
    let trust = daemon.client_certs.snapshot();
    let network_fingerprint = daemon.network_cert().map(|cert| cert.fingerprint().to_string());

    // Intra-cluster traffic authenticated by the server trust set.
    if !request.peer_certs.is_empty() {
        for der in &request.peer_certs {
            if let Some(fingerprint) = check_trust_state(
                der,
                trust.kind(CertKind::Server),
                network_fingerprint.as_deref(),
                false,
                false,
            ) {
                return Ok(AuthOutcome::Trusted {
                    username: fingerprint,
                    protocol: Protocol::Cluster,
                });
            }
        }
    }

    // Local unix socket queries.
    if let RemoteAddr::Unix { uid, .. } = &request.remote {
        if !request.tls {
            return Ok(AuthOutcome::Trusted {
                username: username_for_uid(*uid),
                protocol: Protocol::Unix,
            });
        }
    }

    // Guest API connections never reach the main API.
    if request.remote == RemoteAddr::Guest {
        return Err(AuthFailure::Refused(
            "Main API query can't come from the guest API socket".to_string(),
        ));
    }

    // A peer claiming to be a cluster notification must have matched above.
    if is_cluster_notification(request) {
        return Err(AuthFailure::Refused(
            "Cluster notification isn't using trusted server certificate".to_string(),
        ));
    }

    if !request.tls {
        return Err(AuthFailure::Refused(
            "Bad/missing TLS on network query".to_string(),
        ));
    }

    if let Some(verifier) = daemon.oidc_verifier() {
        let authorization = request.header("authorization");
        if verifier.is_request(authorization) {
            let username = verifier.auth(authorization)?;
            return Ok(AuthOutcome::Trusted {
                username,
                protocol: Protocol::Oidc,
            });
        }
    }

    let trust_ca = daemon.global_config_snapshot().trust_ca_certificates();

    // Metrics trust set applies only on the metrics endpoint.
    if request.path == "/1.0/metrics" {
        for der in &request.peer_certs {
            if let Some(fingerprint) = check_trust_state(
                der,
                trust.kind(CertKind::Metrics),
                None,
                trust_ca,
                request.ca_verified,
            ) {
                return Ok(AuthOutcome::Trusted {
                    username: fingerprint,
                    protocol: Protocol::Tls,
                });
            }
        }
    }

    for der in &request.peer_certs {
        if let Some(fingerprint) = check_trust_state(
            der,
            trust.kind(CertKind::Client),
            None,
            trust_ca,
            request.ca_verified,
        ) {
            return Ok(AuthOutcome::Trusted {
                username: fingerprint,
                protocol: Protocol::Tls,
            });
        }
    }

    Ok(AuthOutcome::Untrusted)
}

/// Computes the access record for a trusted request. Cluster peers and unix
/// peers are admins; TLS clients are admins unless the trust store carries a
/// project restriction for their key.
pub fn user_access(trust: &TrustSnapshot, protocol: Protocol, username: &str) -> UserAccess {
    match protocol {
        Protocol::Cluster | Protocol::Unix | Protocol::Oidc => UserAccess::admin(),
        Protocol::Tls => match trust.projects(username) {
            Some(projects) => UserAccess::restricted(projects.iter().cloned()),
            None => UserAccess::admin(),
        },
    }
}
