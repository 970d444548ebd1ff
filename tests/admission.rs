//! Admission pipeline behaviour: setup gate, authentication classes,
//! untrusted allowances, OIDC challenges and the shutdown gate.

mod common;

use burrow::auth::{self, AuthOutcome, Protocol};
use burrow::config::OidcConfig;
use burrow::db::DbCertificate;
use burrow::security::certs::CertInfo;
use common::{bare_daemon, dispatch, RequestBuilder};
use tempfile::TempDir;

#[test]
fn setup_gate_returns_503_then_admits() {
    let dir = TempDir::new().unwrap();
    let daemon = bare_daemon(&dir);

    let request = RequestBuilder::new("GET", "/1.0").build();
    let response = dispatch(&daemon, &request);
    assert_eq!(response.status, 503);
    assert_eq!(response.error_message(), "Daemon setup in progress");

    daemon.setup.open();
    let response = dispatch(&daemon, &request);
    assert_eq!(response.status, 200);
    assert_eq!(response.body["metadata"]["auth"], "untrusted");
}

#[test]
fn unix_internal_requests_bypass_setup_gate() {
    let dir = TempDir::new().unwrap();
    let daemon = bare_daemon(&dir);
    assert!(!daemon.setup.is_open());

    let request = RequestBuilder::new("GET", "/internal/ready")
        .over_unix()
        .build();
    let response = dispatch(&daemon, &request);
    assert_eq!(response.status, 200);
    assert_eq!(response.body["metadata"]["ready"], false);
}

#[test]
fn unix_public_requests_wait_behind_setup_gate() {
    let dir = TempDir::new().unwrap();
    let daemon = bare_daemon(&dir);
    let request = RequestBuilder::new("GET", "/1.0").over_unix().build();
    assert_eq!(dispatch(&daemon, &request).status, 503);
}

#[test]
fn untrusted_allowed_without_claimed_authentication() {
    let dir = TempDir::new().unwrap();
    let daemon = bare_daemon(&dir);
    daemon.setup.open();

    // No client certificate, no claimed authentication: the allow-untrusted
    // action runs.
    let request = RequestBuilder::new("GET", "/1.0").build();
    assert_eq!(dispatch(&daemon, &request).status, 200);

    // A client claiming it authenticated is rejected instead.
    let request = RequestBuilder::new("GET", "/1.0")
        .header("X-Burrow-Authenticated", "1")
        .build();
    assert_eq!(dispatch(&daemon, &request).status, 403);
}

#[test]
fn untrusted_clients_cannot_reach_protected_endpoints() {
    let dir = TempDir::new().unwrap();
    let daemon = bare_daemon(&dir);
    daemon.setup.open();

    let request = RequestBuilder::new("GET", "/1.0/operations").build();
    assert_eq!(dispatch(&daemon, &request).status, 403);
}

#[test]
fn oidc_error_returns_401_with_challenge_headers() {
    let dir = TempDir::new().unwrap();
    let daemon = bare_daemon(&dir);
    daemon.setup.open();
    daemon.setup_oidc(Some(OidcConfig {
        issuer: "https://issuer.example".into(),
        client_id: "burrow".into(),
        audience: None,
    }));

    let request = RequestBuilder::new("GET", "/1.0/operations")
        .header("Authorization", "Bearer not-a-valid-token")
        .build();
    let response = dispatch(&daemon, &request);
    assert_eq!(response.status, 401);
    let challenge = response.header("WWW-Authenticate").expect("challenge set");
    assert!(challenge.starts_with("Bearer"));
    assert_eq!(
        response.header("X-Burrow-OIDC-Issuer"),
        Some("https://issuer.example")
    );
}

#[test]
fn guest_socket_is_refused_on_main_api() {
    let dir = TempDir::new().unwrap();
    let daemon = bare_daemon(&dir);
    daemon.setup.open();

    let request = RequestBuilder::new("GET", "/1.0/operations")
        .over_guest()
        .build();
    assert_eq!(dispatch(&daemon, &request).status, 403);
}

#[test]
fn internal_version_rejects_remote_tls_callers() {
    let dir = TempDir::new().unwrap();
    let daemon = bare_daemon(&dir);
    daemon.setup.open();

    // Even a trusted TLS client may not reach internal endpoints.
    let cert = CertInfo::load_or_generate(dir.path(), "client", "client").unwrap();
    let pem = std::fs::read_to_string(dir.path().join("client.crt")).unwrap();
    let row = DbCertificate {
        fingerprint: cert.fingerprint().to_string(),
        kind: "client".into(),
        name: "remote".into(),
        pem,
        restricted: false,
        projects: Vec::new(),
    };
    daemon.client_certs.replace_from_rows(&[row]);

    let request = RequestBuilder::new("GET", "/internal/ready")
        .peer_cert(cert.leaf_der().to_vec())
        .build();
    assert_eq!(dispatch(&daemon, &request).status, 403);
}

#[test]
fn shutdown_gate_blocks_mutations_but_allows_gets() {
    let dir = TempDir::new().unwrap();
    let daemon = bare_daemon(&dir);
    daemon.setup.open();
    daemon.shutdown.cancel();

    // Non-GET on a non-allow-listed path: refused while draining.
    let request = RequestBuilder::new("POST", "/1.0/metrics").over_unix().build();
    let response = dispatch(&daemon, &request);
    assert_eq!(response.status, 503);
    assert_eq!(response.error_message(), "Shutting down");

    // GETs and the operations subtree stay serviceable.
    let request = RequestBuilder::new("GET", "/1.0/operations").over_unix().build();
    assert_eq!(dispatch(&daemon, &request).status, 200);
    let request = RequestBuilder::new("GET", "/1.0").over_unix().build();
    assert_eq!(dispatch(&daemon, &request).status, 200);
}

#[test]
fn unknown_method_is_404_missing_handler_is_501() {
    let dir = TempDir::new().unwrap();
    let daemon = bare_daemon(&dir);
    daemon.setup.open();

    let request = RequestBuilder::new("DELETE", "/1.0/events").over_unix().build();
    let response = dispatch(&daemon, &request);
    assert_eq!(response.status, 404);
    assert!(response.error_message().contains("not found"));
}

#[test]
fn tls_client_restrictions_follow_the_trust_store() {
    let dir = TempDir::new().unwrap();
    let daemon = bare_daemon(&dir);
    daemon.setup.open();

    let restricted = CertInfo::load_or_generate(dir.path(), "restricted", "r").unwrap();
    let unrestricted = CertInfo::load_or_generate(dir.path(), "unrestricted", "u").unwrap();
    let row = |basename: &str, cert: &CertInfo, restricted: bool, projects: Vec<String>| {
        DbCertificate {
            fingerprint: cert.fingerprint().to_string(),
            kind: "client".into(),
            name: basename.into(),
            pem: std::fs::read_to_string(dir.path().join(format!("{basename}.crt"))).unwrap(),
            restricted,
            projects,
        }
    };
    daemon.client_certs.replace_from_rows(&[
        row("restricted", &restricted, true, vec!["web".into()]),
        row("unrestricted", &unrestricted, false, Vec::new()),
    ]);

    let snapshot = daemon.client_certs.snapshot();

    let outcome = auth::authenticate(
        &daemon,
        &RequestBuilder::new("GET", "/1.0")
            .peer_cert(restricted.leaf_der().to_vec())
            .build(),
    )
    .unwrap();
    let AuthOutcome::Trusted { username, protocol } = outcome else {
        panic!("restricted client should authenticate");
    };
    assert_eq!(protocol, Protocol::Tls);
    let access = auth::user_access(&snapshot, protocol, &username);
    assert!(!access.admin);
    assert_eq!(
        access.projects.into_iter().collect::<Vec<_>>(),
        vec!["web".to_string()]
    );

    let outcome = auth::authenticate(
        &daemon,
        &RequestBuilder::new("GET", "/1.0")
            .peer_cert(unrestricted.leaf_der().to_vec())
            .build(),
    )
    .unwrap();
    let AuthOutcome::Trusted { username, protocol } = outcome else {
        panic!("unrestricted client should authenticate");
    };
    let access = auth::user_access(&snapshot, protocol, &username);
    assert!(access.admin);
}

#[test]
fn server_trust_wins_over_client_trust() {
    let dir = TempDir::new().unwrap();
    let daemon = bare_daemon(&dir);
    daemon.setup.open();

    // The same key in both sets must classify as a cluster peer.
    let cert = CertInfo::load_or_generate(dir.path(), "peer", "peer").unwrap();
    let pem = std::fs::read_to_string(dir.path().join("peer.crt")).unwrap();
    let row = |kind: &str| DbCertificate {
        fingerprint: cert.fingerprint().to_string(),
        kind: kind.into(),
        name: "peer".into(),
        pem: pem.clone(),
        restricted: false,
        projects: Vec::new(),
    };
    // Same fingerprint cannot repeat in one table; exercise via cache rows.
    daemon.client_certs.replace_from_rows(&[row("server")]);

    let outcome = auth::authenticate(
        &daemon,
        &RequestBuilder::new("GET", "/1.0")
            .peer_cert(cert.leaf_der().to_vec())
            .build(),
    )
    .unwrap();
    assert!(matches!(
        outcome,
        AuthOutcome::Trusted {
            protocol: Protocol::Cluster,
            ..
        }
    ));
}

#[test]
fn trust_ca_switch_admits_handshake_verified_clients() {
    use burrow::config::GlobalConfig;
    use std::collections::HashMap;

    let dir = TempDir::new().unwrap();
    let daemon = bare_daemon(&dir);
    daemon.setup.open();

    // CA-signed but unpinned: the fingerprint is in no trust set; only the
    // handshake-verified marker speaks for it.
    let cert = CertInfo::load_or_generate(dir.path(), "unpinned", "u").unwrap();
    let request = RequestBuilder::new("GET", "/1.0/operations")
        .peer_cert(cert.leaf_der().to_vec())
        .ca_verified()
        .build();

    // Switch off: still untrusted.
    assert_eq!(dispatch(&daemon, &request).status, 403);

    let mut values = HashMap::new();
    values.insert("core.trust_ca_certificates".to_string(), "true".to_string());
    daemon.set_global_config(GlobalConfig::from_values(values), String::new());
    assert_eq!(dispatch(&daemon, &request).status, 200);

    // The switch never rescues a chain the handshake did not verify.
    let unverified = RequestBuilder::new("GET", "/1.0/operations")
        .peer_cert(cert.leaf_der().to_vec())
        .build();
    assert_eq!(dispatch(&daemon, &unverified).status, 403);
}

#[test]
fn missing_tls_on_network_query_is_untrusted() {
    let dir = TempDir::new().unwrap();
    let daemon = bare_daemon(&dir);
    daemon.setup.open();

    let request = RequestBuilder::new("GET", "/1.0/operations").cleartext().build();
    assert_eq!(dispatch(&daemon, &request).status, 403);
}
