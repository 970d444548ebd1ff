//! OIDC verification surface.
//!
//! Token validation itself is delegated to an injectable validator (the
//! library doing issuer discovery and JWKS checks lives outside the core);
//! this module owns bearer detection, the challenge headers written on 401,
//! and the error type the admission pipeline keys on.

use crate::config::OidcConfig;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("OIDC authentication failed: {message}")]
pub struct AuthError {
    pub message: String,
}

impl AuthError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Validates a bearer token and returns the subject it belongs to.
pub trait TokenValidator: Send + Sync {
    fn validate(&self, token: &str) -> Result<String, AuthError>;
}

/// Default validator: refuses everything. Real deployments install the
/// library-backed validator at startup.
struct RejectAll;

impl TokenValidator for RejectAll {
    fn validate(&self, _token: &str) -> Result<String, AuthError> {
        Err(AuthError::new("no token validator configured"))
    }
}

pub struct Verifier {
    config: OidcConfig,
    validator: Box<dyn TokenValidator>,
}

impl Verifier {
    pub fn new(config: OidcConfig) -> Self {
        Self {
            config,
            validator: Box::new(RejectAll),
        }
    }

    pub fn with_validator(config: OidcConfig, validator: Box<dyn TokenValidator>) -> Self {
        Self { config, validator }
    }

    /// Whether the request claims OIDC authentication.
    pub fn is_request(&self, authorization: Option<&str>) -> bool {
        matches!(authorization, Some(value) if value.starts_with("Bearer "))
    }

    pub fn auth(&self, authorization: Option<&str>) -> Result<String, AuthError> {
        let header = authorization.ok_or_else(|| AuthError::new("missing bearer token"))?;
        let token = header
            .strip_prefix("Bearer ")
            .ok_or_else(|| AuthError::new("malformed authorization header"))?;
        if token.is_empty() {
            return Err(AuthError::new("empty bearer token"));
        }
        self.validator.validate(token)
    }

    /// Headers a client needs to start the OIDC flow; written on every 401
    /// and 403 whenever a verifier is configured.
    pub fn challenge_headers(&self) -> Vec<(String, String)> {
        let mut headers = vec![(
            "WWW-Authenticate".to_string(),
            format!("Bearer realm=\"burrow\", issuer=\"{}\"", self.config.issuer),
        )];
        headers.push((
            "X-Burrow-OIDC-Issuer".to_string(),
            self.config.issuer.clone(),
        ));
        headers.push((
            "X-Burrow-OIDC-ClientID".to_string(),
            self.config.client_id.clone(),
        ));
        if let Some(audience) = &self.config.audience {
            headers.push(("X-Burrow-OIDC-Audience".to_string(), audience.clone()));
        }
        headers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verifier() -> Verifier {
        Verifier::new(OidcConfig {
            issuer: "https://issuer.example".into(),
            client_id: "burrow".into(),
            audience: None,
        })
    }

    #[test]
    fn bearer_detection() {
        let v = verifier();
        assert!(v.is_request(Some("Bearer abc")));
        assert!(!v.is_request(Some("Basic abc")));
        assert!(!v.is_request(None));
    }

    #[test]
    fn default_validator_rejects() {
        let v = verifier();
        assert!(v.auth(Some("Bearer sometoken")).is_err());
        assert!(v.auth(Some("Bearer ")).is_err());
    }

    #[test]
    fn custom_validator_accepts() {
        struct Accept;
        impl TokenValidator for Accept {
            fn validate(&self, token: &str) -> Result<String, AuthError> {
                if token == "good" {
                    Ok("alice".into())
                } else {
                    Err(AuthError::new("bad token"))
                }
            }
        }
        let v = Verifier::with_validator(
            OidcConfig {
                issuer: "https://issuer.example".into(),
                client_id: "burrow".into(),
                audience: Some("aud".into()),
            },
            Box::new(Accept),
        );
        assert_eq!(v.auth(Some("Bearer good")).unwrap(), "alice");
        assert!(v.auth(Some("Bearer bad")).is_err());
        let headers = v.challenge_headers();
        assert!(headers.iter().any(|(name, _)| name == "WWW-Authenticate"));
        assert!(headers.iter().any(|(name, _)| name == "X-Burrow-OIDC-Audience"));
    }
}
