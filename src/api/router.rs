//! Endpoint registration and the request-admission pipeline.
//!
//! Ordering inside `dispatch` is load-bearing: setup gate, then
//! authentication, then the internal-version gate, then authorization, then
//! the shutdown gate, then the handler. Tests drive the pipeline directly
//! against byte buffers.

use super::request::RequestInfo;
use super::response::{smart_error, Response};
use super::{ApiEndpoint, ApiEndpointAction, INTERNAL_VERSION};
use crate::auth::{self, AuthFailure, AuthOutcome, Protocol, RequestContext};
use crate::daemon::Daemon;
use log::{debug, error, warn};
use std::io::Write;
use std::sync::Arc;

pub const FORWARDED_ADDRESS_HEADER: &str = "X-Burrow-Forwarded-Address";
pub const FORWARDED_USERNAME_HEADER: &str = "X-Burrow-Forwarded-Username";
pub const FORWARDED_PROTOCOL_HEADER: &str = "X-Burrow-Forwarded-Protocol";
/// Set by clients that believe they authenticated; its presence disables the
/// untrusted-allowed fast path.
pub const AUTHENTICATED_HEADER: &str = "X-Burrow-Authenticated";

struct Route {
    version: &'static str,
    path: &'static str,
    segments: Vec<&'static str>,
    endpoint: ApiEndpoint,
    canonical: bool,
}

fn build_uri(version: &str, path: &str) -> String {
    if path.is_empty() {
        format!("/{version}")
    } else if version.is_empty() {
        format!("/{path}")
    } else {
        format!("/{version}/{path}")
    }
}

fn split_static(uri: &'static str) -> Vec<&'static str> {
    uri.split('/').filter(|s| !s.is_empty()).collect()
}

#[derive(Default)]
pub struct Router {
    routes: Vec<Route>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an endpoint under `/<version>/<path>` plus its aliases.
    pub fn register(&mut self, version: &'static str, endpoint: ApiEndpoint) {
        let mut segments: Vec<&'static str> = Vec::new();
        if !version.is_empty() {
            segments.push(version);
        }
        segments.extend(split_static(endpoint.path));
        self.routes.push(Route {
            version,
            path: endpoint.path,
            segments,
            endpoint,
            canonical: true,
        });
        for alias in endpoint.aliases {
            let mut segments: Vec<&'static str> = Vec::new();
            if !version.is_empty() {
                segments.push(version);
            }
            segments.extend(split_static(alias));
            self.routes.push(Route {
                version,
                path: alias,
                segments,
                endpoint,
                canonical: false,
            });
        }
    }

    /// Reverse lookup by canonical endpoint name.
    pub fn url_for(&self, name: &str) -> Option<String> {
        self.routes
            .iter()
            .find(|route| route.canonical && route.endpoint.name == name)
            .map(|route| build_uri(route.version, route.path))
    }

    fn resolve(&self, path: &str) -> Option<&Route> {
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        self.routes.iter().find(|route| {
            route.segments.len() == segments.len()
                && route
                    .segments
                    .iter()
                    .zip(&segments)
                    .all(|(pattern, actual)| {
                        pattern.starts_with('{') && pattern.ends_with('}') || pattern == actual
                    })
        })
    }

    /// Runs the admission pipeline and writes the response.
    pub fn dispatch(&self, daemon: &Arc<Daemon>, request: &RequestInfo, out: &mut dyn Write) {
        let Some(route) = self.resolve(&request.path) else {
            respond(Response::not_found("not found"), out, &[]);
            return;
        };
        let is_internal = route.version == INTERNAL_VERSION;

        // Public requests wait behind the setup gate; local internal calls
        // (and only those) are admitted during early startup.
        if !(request.remote.is_unix() && is_internal) && !daemon.setup.is_open() {
            respond(
                Response::unavailable("Daemon setup in progress"),
                out,
                &[],
            );
            return;
        }

        let outcome = match auth::authenticate(daemon, request) {
            Ok(outcome) => outcome,
            Err(AuthFailure::Oidc(err)) => {
                let headers = daemon.oidc_challenge_headers();
                respond(Response::unauthorized(err.to_string()), out, &headers);
                return;
            }
            Err(AuthFailure::Refused(reason)) => {
                warn!(
                    "event=api_auth_refused remote={} reason={reason}",
                    request.remote.tag()
                );
                AuthOutcome::Untrusted
            }
        };
        let (trusted, username, protocol) = match outcome {
            AuthOutcome::Trusted { username, protocol } => (true, username, Some(protocol)),
            AuthOutcome::Untrusted => (false, String::new(), None),
        };

        // Internal endpoints accept local and cluster callers only, with one
        // exception: the initial cluster accept handshake over trusted TLS.
        if is_internal && !matches!(protocol, Some(Protocol::Unix) | Some(Protocol::Cluster)) {
            let accept_handshake =
                trusted && route.path == "cluster/accept" && protocol == Some(Protocol::Tls);
            if !accept_handshake {
                warn!(
                    "event=api_reject_internal remote={} path={}",
                    request.remote.tag(),
                    request.path
                );
                respond(Response::forbidden(""), out, &[]);
                return;
            }
        }

        let action = route.endpoint.action(&request.method);
        let untrusted_ok = action.map(|a| a.allow_untrusted).unwrap_or(false);

        let mut ctx: Option<RequestContext> = None;
        if trusted {
            let protocol = protocol.unwrap_or(Protocol::Tls);
            debug!(
                "event=api_request method={} path={} remote={} protocol={} user={}",
                request.method,
                request.path,
                request.remote.tag(),
                protocol.as_str(),
                username
            );
            let access = auth::user_access(&daemon.client_certs.snapshot(), protocol, &username);
            let forwarded = |name: &str| {
                (protocol == Protocol::Cluster)
                    .then(|| request.header(name).map(str::to_string))
                    .flatten()
            };
            ctx = Some(RequestContext {
                forwarded_address: forwarded(FORWARDED_ADDRESS_HEADER),
                forwarded_username: forwarded(FORWARDED_USERNAME_HEADER),
                forwarded_protocol: forwarded(FORWARDED_PROTOCOL_HEADER),
                username,
                protocol,
                access,
            });
        } else if untrusted_ok && request.header(AUTHENTICATED_HEADER).is_none() {
            debug!(
                "event=api_request_untrusted method={} path={} remote={}",
                request.method,
                request.path,
                request.remote.tag()
            );
        } else {
            let headers = daemon.oidc_challenge_headers();
            warn!(
                "event=api_reject_untrusted remote={} path={}",
                request.remote.tag(),
                request.path
            );
            respond(Response::forbidden(""), out, &headers);
            return;
        }

        // Full body dump for mutating JSON requests when debugging.
        if daemon.debug_mode() && request.method != "GET" && request.is_json() {
            debug!(
                "event=api_request_body method={} path={} body={}",
                request.method,
                request.path,
                String::from_utf8_lossy(&request.body)
            );
        }

        if daemon.shutdown.is_cancelled() && !allowed_during_shutdown(route, request) {
            respond(Response::unavailable("Shutting down"), out, &[]);
            return;
        }

        let response = match action {
            None => Response::not_found(format!("Method {:?} not found", request.method)),
            Some(action) => run_action(daemon, action, request, ctx.as_ref()),
        };
        respond(response, out, &[]);
    }
}

/// Endpoints that stay serviceable while draining: internal calls, the API
/// roots, events, operations and their children, and any GET.
fn allowed_during_shutdown(route: &Route, request: &RequestInfo) -> bool {
    if route.version == INTERNAL_VERSION {
        return true;
    }
    if route.path.is_empty()
        || route.path == "events"
        || route.path == "operations"
        || route.path.starts_with("operations/")
    {
        return true;
    }
    request.method == "GET"
}

fn run_action(
    daemon: &Arc<Daemon>,
    action: ApiEndpointAction,
    request: &RequestInfo,
    ctx: Option<&RequestContext>,
) -> Response {
    let Some(handler) = action.handler else {
        return Response::not_implemented();
    };
    if let Some(access_handler) = action.access_handler {
        let gate = access_handler(daemon, request, ctx);
        if gate != Response::EmptySync {
            return gate;
        }
    } else if !action.allow_untrusted {
        let admin = ctx.map(|c| c.access.admin).unwrap_or(false);
        if !admin {
            return Response::forbidden("");
        }
    }
    handler(daemon, request, ctx)
}

fn respond(response: Response, out: &mut dyn Write, headers: &[(String, String)]) {
    if let Err(err) = response.render(out, headers) {
        let fallback = smart_error(&err);
        if let Err(write_err) = fallback.render(out, &[]) {
            error!(
                "event=api_response_write_failed error={err} fallback_error={write_err}"
            );
        }
    }
}
