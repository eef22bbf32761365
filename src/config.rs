//! Session configuration sourced from environment variables.

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

/// Reconnect backoff ceiling used when none is configured.
pub const DEFAULT_MAX_RECONNECT: Duration = Duration::from_millis(8000);

pub const ENV_REGION: &str = "IOT_SESSION_REGION";
pub const ENV_IDENTITY_POOL_ID: &str = "IOT_SESSION_IDENTITY_POOL_ID";
pub const ENV_ENDPOINT: &str = "IOT_SESSION_ENDPOINT";
pub const ENV_CLIENT_ID: &str = "IOT_SESSION_CLIENT_ID";
pub const ENV_MAX_RECONNECT_MS: &str = "IOT_SESSION_MAX_RECONNECT_MS";

/// Read-only settings loaded once at startup.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionConfig {
    /// Region hosting both the identity pool and the device gateway.
    pub region: String,
    /// Identity pool that allows unauthenticated identities.
    pub identity_pool_id: String,
    /// Device gateway host, eg `abc123-ats.iot.us-east-1.amazonaws.com`.
    pub endpoint: String,
    /// MQTT client id presented to the broker.
    pub client_id: String,
    /// Upper bound for the broker's reconnect backoff.
    pub max_reconnect: Duration,
}

impl SessionConfig {
    /// Builds a configuration with a generated client id and default
    /// reconnect ceiling.
    pub fn new(
        region: impl Into<String>,
        identity_pool_id: impl Into<String>,
        endpoint: impl Into<String>,
    ) -> Self {
        Self {
            region: region.into(),
            identity_pool_id: identity_pool_id.into(),
            endpoint: endpoint.into(),
            client_id: generate_client_id(),
            max_reconnect: DEFAULT_MAX_RECONNECT,
        }
    }

    /// Overrides the generated client id.
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    /// Overrides the reconnect backoff ceiling.
    pub fn with_max_reconnect(mut self, max_reconnect: Duration) -> Self {
        self.max_reconnect = max_reconnect;
        self
    }

    /// Loads the configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &'static str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
                .ok_or(ConfigError::Missing(key))
        };

        let region = required(ENV_REGION)?;
        let identity_pool_id = required(ENV_IDENTITY_POOL_ID)?;
        let endpoint = required(ENV_ENDPOINT)?;

        if !identity_pool_id.starts_with(&format!("{region}:")) {
            return Err(ConfigError::Invalid {
                key: ENV_IDENTITY_POOL_ID,
                reason: format!("pool id must be prefixed with the region `{region}:`"),
            });
        }

        let client_id = lookup(ENV_CLIENT_ID)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(generate_client_id);

        let max_reconnect = match lookup(ENV_MAX_RECONNECT_MS) {
            Some(raw) => {
                let millis = raw
                    .trim()
                    .parse::<u64>()
                    .ok()
                    .filter(|value| *value > 0)
                    .ok_or_else(|| ConfigError::Invalid {
                        key: ENV_MAX_RECONNECT_MS,
                        reason: format!("expected a positive integer, got `{raw}`"),
                    })?;
                Duration::from_millis(millis)
            }
            None => DEFAULT_MAX_RECONNECT,
        };

        Ok(Self {
            region,
            identity_pool_id,
            endpoint,
            client_id,
            max_reconnect,
        })
    }
}

/// Errors raised while loading [`SessionConfig`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),

    #[error("invalid setting {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

fn generate_client_id() -> String {
    format!("session-{}", Uuid::new_v4().simple())
}
