//! Temporary credentials and the identity-federation seam.
//!
//! - `Credential`: short-lived access key triple handed to the broker.
//! - `IdentityProvider`: two-step identity then credential exchange.
//! - `cognito`: HTTP client for an unauthenticated identity pool.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;

/// Cognito Identity HTTP client.
pub mod cognito;

pub use cognito::CognitoIdentityClient;

/// Temporary credentials returned by the identity service.
///
/// Secret parts are wrapped in [`SecretString`] so `Debug` output and logs
/// never contain them.
#[derive(Clone, Debug)]
pub struct Credential {
    pub access_key_id: String,
    pub secret_key: SecretString,
    pub session_token: SecretString,
    /// Expiry reported by the identity service, when present.
    pub expiration: Option<DateTime<Utc>>,
}

impl Credential {
    pub fn new(
        access_key_id: impl Into<String>,
        secret_key: impl Into<String>,
        session_token: impl Into<String>,
    ) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_key: SecretString::new(secret_key.into()),
            session_token: SecretString::new(session_token.into()),
            expiration: None,
        }
    }

    pub fn with_expiration(mut self, expiration: DateTime<Utc>) -> Self {
        self.expiration = Some(expiration);
        self
    }

    /// Empty construction-time placeholder. Never usable for signing.
    pub fn placeholder() -> Self {
        Self::new(String::new(), String::new(), String::new())
    }

    /// Returns `true` when every part of the triple is non-empty.
    pub fn is_complete(&self) -> bool {
        !self.access_key_id.is_empty()
            && !self.secret_key.expose_secret().is_empty()
            && !self.session_token.expose_secret().is_empty()
    }

    /// Returns `true` when an expiry is known and is not after `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expiration.is_some_and(|expiration| expiration <= now)
    }
}

/// Identity-federation collaborator.
///
/// Implementations perform the two round trips used to obtain a
/// [`Credential`]: resolve an identity id, then exchange it for credentials.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Resolves a (possibly cached) identity id for the configured pool.
    async fn get_id(&self) -> Result<String, IdentityError>;

    /// Exchanges an identity id for temporary credentials.
    async fn get_credentials_for_identity(
        &self,
        identity_id: &str,
    ) -> Result<Credential, IdentityError>;
}

/// Errors produced while obtaining an identity or its credentials.
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("identity request failed: {0}")]
    Transport(reqwest::Error),

    #[error("identity http status {status}: {body}")]
    HttpStatus { status: StatusCode, body: String },

    /// Error envelope returned by the identity service.
    #[error("identity service error {kind}: {message}")]
    Service { kind: String, message: String },

    #[error("identity response missing {0}")]
    MissingField(&'static str),

    #[error("identity service returned incomplete credentials")]
    IncompleteCredential,

    #[error("failed to parse identity response: {0}")]
    Parse(String),
}

impl IdentityError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(err) => err.is_timeout() || err.is_connect(),
            Self::HttpStatus { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            Self::Service { kind, .. } => {
                kind.ends_with("TooManyRequestsException")
                    || kind.ends_with("InternalErrorException")
            }
            Self::MissingField(_) | Self::IncompleteCredential | Self::Parse(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};

    use super::*;

    #[test]
    fn placeholder_is_never_complete() {
        assert!(!Credential::placeholder().is_complete());
        assert!(!Credential::new("AKIA", "", "token").is_complete());
        assert!(Credential::new("AKIA", "secret", "token").is_complete());
    }

    #[test]
    fn debug_output_redacts_secrets() {
        let credential = Credential::new("AKIAEXAMPLE", "very-secret", "session-token-value");
        let debug = format!("{credential:?}");
        assert!(debug.contains("AKIAEXAMPLE"));
        assert!(!debug.contains("very-secret"));
        assert!(!debug.contains("session-token-value"));
    }

    #[test]
    fn expiry_check_uses_reported_expiration() {
        let expires = Utc.with_ymd_and_hms(2030, 1, 1, 12, 0, 0).unwrap();
        let credential = Credential::new("a", "b", "c").with_expiration(expires);
        assert!(!credential.is_expired_at(expires - Duration::seconds(1)));
        assert!(credential.is_expired_at(expires));
        assert!(!Credential::new("a", "b", "c").is_expired_at(expires));
    }

    #[test]
    fn throttling_service_errors_are_retryable() {
        let throttled = IdentityError::Service {
            kind: "TooManyRequestsException".to_string(),
            message: "slow down".to_string(),
        };
        let rejected = IdentityError::Service {
            kind: "NotAuthorizedException".to_string(),
            message: "unauthenticated access is not supported".to_string(),
        };
        assert!(throttled.is_retryable());
        assert!(!rejected.is_retryable());
        assert!(!IdentityError::IncompleteCredential.is_retryable());
    }
}
