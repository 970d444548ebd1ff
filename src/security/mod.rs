//! Certificate identity, trust cache and OIDC surfaces.

pub mod cache;
pub mod certs;
pub mod oidc;

pub use cache::{CertCache, CertKind};
pub use certs::{fingerprint_der, CertInfo, CertificateError};
