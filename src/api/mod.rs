//! API endpoint model and admission machinery.

pub mod handlers;
pub mod request;
pub mod response;
pub mod router;

use crate::auth::RequestContext;
use crate::daemon::Daemon;
use request::RequestInfo;
use response::Response;
use std::sync::Arc;

/// Public API version prefix.
pub const API_VERSION: &str = "1.0";
/// Internal, cluster-only API version prefix.
pub const INTERNAL_VERSION: &str = "internal";

pub type Handler = fn(&Arc<Daemon>, &RequestInfo, Option<&RequestContext>) -> Response;

/// One HTTP method's behaviour on an endpoint.
#[derive(Clone, Copy, Default)]
pub struct ApiEndpointAction {
    pub handler: Option<Handler>,
    /// Custom access check; returning anything but `EmptySync` short-circuits
    /// the pipeline. When absent, admin privileges are required unless
    /// `allow_untrusted` is set.
    pub access_handler: Option<Handler>,
    pub allow_untrusted: bool,
}

impl ApiEndpointAction {
    pub fn new(handler: Handler) -> Self {
        Self {
            handler: Some(handler),
            access_handler: None,
            allow_untrusted: false,
        }
    }

    pub fn untrusted(handler: Handler) -> Self {
        Self {
            handler: Some(handler),
            access_handler: None,
            allow_untrusted: true,
        }
    }

    pub fn with_access(handler: Handler, access_handler: Handler) -> Self {
        Self {
            handler: Some(handler),
            access_handler: Some(access_handler),
            allow_untrusted: false,
        }
    }
}

/// A URL in the API: `/<version>/<path>` plus optional aliases, with at most
/// one action per HTTP method.
#[derive(Clone, Copy, Default)]
pub struct ApiEndpoint {
    pub name: &'static str,
    pub path: &'static str,
    pub aliases: &'static [&'static str],
    pub get: Option<ApiEndpointAction>,
    pub head: Option<ApiEndpointAction>,
    pub put: Option<ApiEndpointAction>,
    pub post: Option<ApiEndpointAction>,
    pub delete: Option<ApiEndpointAction>,
    pub patch: Option<ApiEndpointAction>,
}

impl ApiEndpoint {
    /// Action registered for an HTTP method; None yields 404 downstream.
    pub fn action(&self, method: &str) -> Option<ApiEndpointAction> {
        match method {
            "GET" => self.get,
            "HEAD" => self.head,
            "PUT" => self.put,
            "POST" => self.post,
            "DELETE" => self.delete,
            "PATCH" => self.patch,
            _ => None,
        }
    }
}
