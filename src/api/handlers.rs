//! Core endpoint table: API roots, events, operations, metrics and the
//! internal cluster surface. Resource handlers beyond what the daemon core
//! itself needs live elsewhere.

use super::request::RequestInfo;
use super::response::Response;
use super::router::Router;
use super::{ApiEndpoint, ApiEndpointAction, API_VERSION, INTERNAL_VERSION};
use crate::auth::RequestContext;
use crate::cluster::heartbeat;
use crate::daemon::{Daemon, ShutdownSignal};
use crate::db::{DbCertificate, API_EXTENSIONS};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

/// Access handler that admits any authenticated client.
fn allow_authenticated(
    _daemon: &Arc<Daemon>,
    _request: &RequestInfo,
    _ctx: Option<&RequestContext>,
) -> Response {
    Response::EmptySync
}

fn api_root(
    _daemon: &Arc<Daemon>,
    _request: &RequestInfo,
    _ctx: Option<&RequestContext>,
) -> Response {
    Response::sync(vec![format!("/{API_VERSION}")])
}

fn v1_root(
    daemon: &Arc<Daemon>,
    _request: &RequestInfo,
    ctx: Option<&RequestContext>,
) -> Response {
    let mut metadata = json!({
        "api_status": "stable",
        "api_version": API_VERSION,
        "api_extensions": API_EXTENSIONS,
        "auth": if ctx.is_some() { "trusted" } else { "untrusted" },
    });
    if let Some(ctx) = ctx {
        metadata["auth_method"] = json!(ctx.protocol.as_str());
        metadata["environment"] = json!({
            "server": "burrow",
            "server_name": daemon.server_name(),
            "server_clustered": daemon.gateway()
                .and_then(|gateway| gateway.local_address())
                .is_some(),
        });
    }
    Response::Sync(metadata)
}

fn events(
    _daemon: &Arc<Daemon>,
    _request: &RequestInfo,
    _ctx: Option<&RequestContext>,
) -> Response {
    // Long-poll event streaming is handled by the events subsystem; the
    // core only guarantees the endpoint stays reachable during shutdown.
    Response::sync(Vec::<serde_json::Value>::new())
}

fn operations_list(
    daemon: &Arc<Daemon>,
    _request: &RequestInfo,
    _ctx: Option<&RequestContext>,
) -> Response {
    let urls: Vec<String> = daemon
        .operations
        .list()
        .into_iter()
        .map(|op| format!("/{API_VERSION}/operations/{}", op.id))
        .collect();
    Response::sync(urls)
}

fn operation_get(
    daemon: &Arc<Daemon>,
    request: &RequestInfo,
    _ctx: Option<&RequestContext>,
) -> Response {
    let segments = request.path_segments();
    let id = segments
        .last()
        .and_then(|raw| raw.parse::<u64>().ok());
    match id.and_then(|id| daemon.operations.get(id)) {
        Some(op) => Response::sync(json!({
            "id": op.id,
            "description": op.description,
            "status": "Running",
        })),
        None => Response::not_found("Operation not found"),
    }
}

fn metrics(
    daemon: &Arc<Daemon>,
    _request: &RequestInfo,
    _ctx: Option<&RequestContext>,
) -> Response {
    let body = daemon.metrics.lock().render_text().into_bytes();
    Response::Manual {
        status: 200,
        content_type: "text/plain; version=0.0.4",
        body,
    }
}

fn internal_ready(
    daemon: &Arc<Daemon>,
    _request: &RequestInfo,
    _ctx: Option<&RequestContext>,
) -> Response {
    Response::sync(json!({ "ready": daemon.ready.is_open() }))
}

fn internal_shutdown(
    daemon: &Arc<Daemon>,
    _request: &RequestInfo,
    _ctx: Option<&RequestContext>,
) -> Response {
    daemon.request_shutdown(ShutdownSignal::PowerFailure);
    Response::EmptySync
}

fn internal_heartbeat(
    daemon: &Arc<Daemon>,
    request: &RequestInfo,
    _ctx: Option<&RequestContext>,
) -> Response {
    heartbeat::handle(daemon, request)
}

#[derive(Deserialize)]
struct ClusterAcceptRequest {
    name: String,
    address: String,
    certificate: String,
}

/// Initial cluster handshake: the joining member presents its server
/// certificate over trusted TLS; we add it to the server trust set and hand
/// back our cluster identity.
fn internal_cluster_accept(
    daemon: &Arc<Daemon>,
    request: &RequestInfo,
    _ctx: Option<&RequestContext>,
) -> Response {
    let accept: ClusterAcceptRequest = match serde_json::from_slice(&request.body) {
        Ok(accept) => accept,
        Err(err) => return Response::bad_request(format!("Invalid join request: {err}")),
    };
    let Some(cluster) = daemon.db.cluster() else {
        return Response::unavailable("Cluster database not ready");
    };
    let der = match crate::security::certs::cert_der_from_pem(&accept.certificate) {
        Ok(der) => der,
        Err(err) => return Response::bad_request(format!("Invalid certificate: {err}")),
    };
    let row = DbCertificate {
        fingerprint: crate::security::certs::fingerprint_der(&der),
        kind: "server".to_string(),
        name: accept.name.clone(),
        pem: accept.certificate.clone(),
        restricted: false,
        projects: Vec::new(),
    };
    {
        let _membership = daemon.cluster_membership_lock.write();
        if let Err(err) = cluster.add_certificate(&row) {
            return Response::internal_error(format!("Recording member certificate: {err}"));
        }
    }
    daemon.update_certificate_cache();
    log::info!(
        "event=cluster_accept member={} address={}",
        accept.name,
        accept.address
    );
    Response::sync(json!({
        "cluster_certificate_fingerprint": daemon
            .network_cert()
            .map(|cert| cert.fingerprint().to_string()),
    }))
}

fn internal_cluster_upgraded(
    daemon: &Arc<Daemon>,
    _request: &RequestInfo,
    _ctx: Option<&RequestContext>,
) -> Response {
    match daemon.gateway() {
        Some(gateway) => {
            gateway.notify_upgrade();
            Response::EmptySync
        }
        None => Response::unavailable("Cluster gateway not ready"),
    }
}

/// Builds the router with every endpoint the daemon core serves.
pub fn router() -> Router {
    let mut router = Router::new();

    router.register(
        "",
        ApiEndpoint {
            name: "api_root",
            path: "",
            get: Some(ApiEndpointAction::untrusted(api_root)),
            ..Default::default()
        },
    );

    router.register(
        API_VERSION,
        ApiEndpoint {
            name: "server",
            path: "",
            get: Some(ApiEndpointAction::untrusted(v1_root)),
            ..Default::default()
        },
    );

    router.register(
        API_VERSION,
        ApiEndpoint {
            name: "events",
            path: "events",
            get: Some(ApiEndpointAction::with_access(events, allow_authenticated)),
            ..Default::default()
        },
    );

    router.register(
        API_VERSION,
        ApiEndpoint {
            name: "operations",
            path: "operations",
            get: Some(ApiEndpointAction::with_access(
                operations_list,
                allow_authenticated,
            )),
            ..Default::default()
        },
    );

    router.register(
        API_VERSION,
        ApiEndpoint {
            name: "operation",
            path: "operations/{id}",
            get: Some(ApiEndpointAction::with_access(
                operation_get,
                allow_authenticated,
            )),
            ..Default::default()
        },
    );

    router.register(
        API_VERSION,
        ApiEndpoint {
            name: "metrics",
            path: "metrics",
            get: Some(ApiEndpointAction::with_access(metrics, allow_authenticated)),
            ..Default::default()
        },
    );

    router.register(
        INTERNAL_VERSION,
        ApiEndpoint {
            name: "internal_ready",
            path: "ready",
            get: Some(ApiEndpointAction::with_access(
                internal_ready,
                allow_authenticated,
            )),
            ..Default::default()
        },
    );

    router.register(
        INTERNAL_VERSION,
        ApiEndpoint {
            name: "internal_shutdown",
            path: "shutdown",
            put: Some(ApiEndpointAction::new(internal_shutdown)),
            ..Default::default()
        },
    );

    router.register(
        INTERNAL_VERSION,
        ApiEndpoint {
            name: "internal_heartbeat",
            path: "heartbeat",
            post: Some(ApiEndpointAction::with_access(
                internal_heartbeat,
                allow_authenticated,
            )),
            ..Default::default()
        },
    );

    router.register(
        INTERNAL_VERSION,
        ApiEndpoint {
            name: "internal_cluster_accept",
            path: "cluster/accept",
            post: Some(ApiEndpointAction::new(internal_cluster_accept)),
            ..Default::default()
        },
    );

    router.register(
        INTERNAL_VERSION,
        ApiEndpoint {
            name: "internal_cluster_upgraded",
            path: "cluster/upgraded",
            post: Some(ApiEndpointAction::with_access(
                internal_cluster_upgraded,
                allow_authenticated,
            )),
            ..Default::default()
        },
    );

    router
}
