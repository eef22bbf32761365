use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::identity::{Credential, IdentityError, IdentityProvider};
use crate::retry::{retry_async, RetryPolicy};

const ERROR_BODY_SNIPPET_LEN: usize = 220;
const AMZ_JSON_CONTENT_TYPE: &str = "application/x-amz-json-1.1";
const TARGET_PREFIX: &str = "AWSCognitoIdentityService";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CognitoDefaults;

impl CognitoDefaults {
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
    pub const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(5);
}

#[derive(Clone, Debug)]
pub struct CognitoClientOptions {
    pub connect_timeout: Duration,
    pub attempt_timeout: Duration,
    /// Defaults to a single attempt; identity failures surface immediately.
    pub retry_policy: RetryPolicy,
}

impl Default for CognitoClientOptions {
    fn default() -> Self {
        Self {
            connect_timeout: CognitoDefaults::CONNECT_TIMEOUT,
            attempt_timeout: CognitoDefaults::ATTEMPT_TIMEOUT,
            retry_policy: RetryPolicy::single_attempt(),
        }
    }
}

/// Client for an identity pool that allows unauthenticated identities.
///
/// The resolved identity id is cached so later credential refreshes reuse
/// the same identity.
pub struct CognitoIdentityClient {
    http: Client,
    region: String,
    identity_pool_id: String,
    endpoint_override: Option<String>,
    attempt_timeout: Duration,
    retry_policy: RetryPolicy,
    identity_id: Mutex<Option<String>>,
}

impl CognitoIdentityClient {
    pub fn new(
        region: impl Into<String>,
        identity_pool_id: impl Into<String>,
    ) -> Result<Self, IdentityError> {
        Self::with_options(region, identity_pool_id, CognitoClientOptions::default())
    }

    pub fn with_options(
        region: impl Into<String>,
        identity_pool_id: impl Into<String>,
        options: CognitoClientOptions,
    ) -> Result<Self, IdentityError> {
        let http = Client::builder()
            .connect_timeout(options.connect_timeout)
            .build()
            .map_err(IdentityError::Transport)?;

        Ok(Self {
            http,
            region: region.into(),
            identity_pool_id: identity_pool_id.into(),
            endpoint_override: None,
            attempt_timeout: options.attempt_timeout,
            retry_policy: options.retry_policy,
            identity_id: Mutex::new(None),
        })
    }

    /// Sets an explicit service endpoint, eg a local mock.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        let endpoint = endpoint.into();
        self.endpoint_override = Some(endpoint.trim_end().to_string());
        self
    }

    /// Returns the identity id resolved by a previous [`IdentityProvider::get_id`].
    pub fn cached_identity_id(&self) -> Option<String> {
        self.identity_id
            .lock()
            .ok()
            .and_then(|cached| cached.clone())
    }

    fn endpoint(&self) -> String {
        match self.endpoint_override.as_deref() {
            Some(endpoint) => endpoint.to_string(),
            None => format!("https://cognito-identity.{}.amazonaws.com/", self.region),
        }
    }

    async fn call<Req, Resp>(&self, action: &str, request: &Req) -> Result<Resp, IdentityError>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let endpoint = self.endpoint();
        let target = format!("{TARGET_PREFIX}.{action}");

        retry_async(
            &self.retry_policy,
            |attempt| {
                debug!(event = "identity_request", action, attempt);
                self.send_attempt(&endpoint, &target, request)
            },
            IdentityError::is_retryable,
        )
        .await
    }

    async fn send_attempt<Req, Resp>(
        &self,
        endpoint: &str,
        target: &str,
        request: &Req,
    ) -> Result<Resp, IdentityError>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let body = serde_json::to_vec(request).map_err(|err| IdentityError::Parse(err.to_string()))?;
        let response = self
            .http
            .post(endpoint)
            .timeout(self.attempt_timeout)
            .header(reqwest::header::CONTENT_TYPE, AMZ_JSON_CONTENT_TYPE)
            .header("x-amz-target", target)
            .body(body)
            .send()
            .await
            .map_err(IdentityError::Transport)?;
        let status = response.status();
        let body = response.text().await.map_err(IdentityError::Transport)?;

        if !status.is_success() {
            return Err(parse_error_response(status, &body));
        }

        serde_json::from_str(&body).map_err(|err| {
            IdentityError::Parse(format!("{err}; body={}", summarize_error_body(&body)))
        })
    }
}

#[async_trait]
impl IdentityProvider for CognitoIdentityClient {
    async fn get_id(&self) -> Result<String, IdentityError> {
        if let Some(identity_id) = self.cached_identity_id() {
            return Ok(identity_id);
        }

        let response: GetIdResponse = self
            .call(
                "GetId",
                &GetIdRequest {
                    identity_pool_id: &self.identity_pool_id,
                },
            )
            .await?;
        let identity_id = response
            .identity_id
            .filter(|id| !id.is_empty())
            .ok_or(IdentityError::MissingField("IdentityId"))?;

        info!(event = "identity_retrieved", identity_id = %identity_id);
        if let Ok(mut cached) = self.identity_id.lock() {
            *cached = Some(identity_id.clone());
        }
        Ok(identity_id)
    }

    async fn get_credentials_for_identity(
        &self,
        identity_id: &str,
    ) -> Result<Credential, IdentityError> {
        let response: GetCredentialsResponse = self
            .call(
                "GetCredentialsForIdentity",
                &GetCredentialsRequest { identity_id },
            )
            .await?;
        let credentials = response
            .credentials
            .ok_or(IdentityError::MissingField("Credentials"))?;
        credentials.into_credential()
    }
}

#[derive(Serialize)]
struct GetIdRequest<'a> {
    #[serde(rename = "IdentityPoolId")]
    identity_pool_id: &'a str,
}

#[derive(Deserialize)]
struct GetIdResponse {
    #[serde(rename = "IdentityId", default)]
    identity_id: Option<String>,
}

#[derive(Serialize)]
struct GetCredentialsRequest<'a> {
    #[serde(rename = "IdentityId")]
    identity_id: &'a str,
}

#[derive(Deserialize)]
struct GetCredentialsResponse {
    #[serde(rename = "Credentials", default)]
    credentials: Option<WireCredentials>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct WireCredentials {
    #[serde(default)]
    access_key_id: String,
    #[serde(default)]
    secret_key: String,
    #[serde(default)]
    session_token: String,
    /// Epoch seconds.
    #[serde(default)]
    expiration: Option<f64>,
}

impl WireCredentials {
    fn into_credential(self) -> Result<Credential, IdentityError> {
        let mut credential = Credential::new(self.access_key_id, self.secret_key, self.session_token);
        if !credential.is_complete() {
            return Err(IdentityError::IncompleteCredential);
        }
        if let Some(expiration) = self
            .expiration
            .and_then(|secs| DateTime::from_timestamp(secs as i64, 0))
        {
            credential = credential.with_expiration(expiration);
        }
        Ok(credential)
    }
}

#[derive(Deserialize)]
struct ServiceErrorEnvelope {
    #[serde(rename = "__type")]
    kind: String,
    #[serde(alias = "Message", default)]
    message: String,
}

fn parse_error_response(status: reqwest::StatusCode, body: &str) -> IdentityError {
    match serde_json::from_str::<ServiceErrorEnvelope>(body) {
        Ok(envelope) => {
            // Some responses qualify the type, eg `com.amazonaws...#NotAuthorizedException`.
            let kind = envelope
                .kind
                .rsplit('#')
                .next()
                .unwrap_or_default()
                .to_string();
            IdentityError::Service {
                kind,
                message: envelope.message,
            }
        }
        Err(_) => IdentityError::HttpStatus {
            status,
            body: summarize_error_body(body),
        },
    }
}

fn summarize_error_body(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.chars().count() <= ERROR_BODY_SNIPPET_LEN {
        return trimmed.to_string();
    }
    let snippet: String = trimmed.chars().take(ERROR_BODY_SNIPPET_LEN).collect();
    format!("{snippet}...")
}
