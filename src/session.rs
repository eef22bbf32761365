//! Session manager tying identity, broker connection, and observer together.
//!
//! `SessionManager` obtains temporary credentials, opens one broker
//! connection with them, keeps at most one subscribed topic, and maps broker
//! events into typed [`SessionEvent`]s while invoking the registered
//! observer for decoded messages.

use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::broker::{
    BrokerClient, BrokerConfig, BrokerConnector, BrokerError, BrokerEvent, BrokerProtocol,
};
use crate::config::SessionConfig;
use crate::identity::{Credential, IdentityError, IdentityProvider};

/// Message decoded from the broker.
#[derive(Clone, Debug, PartialEq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Value,
}

/// Chat-style message published on the current topic.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutboundMessage {
    pub from: String,
    pub message: String,
}

/// Lifecycle of a [`SessionManager`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SessionState {
    Uninitialized,
    AwaitingCredentials,
    AwaitingConnection,
    Connected,
    /// The broker event stream ended.
    Disconnected,
    /// The last initialization attempt failed.
    Errored,
}

/// Event returned by [`SessionManager::recv`].
#[derive(Clone, Debug, PartialEq)]
pub enum SessionEvent {
    Connected,
    Reconnecting,
    /// Decoded message; the observer has already been invoked.
    Message(InboundMessage),
    /// Payload could not be decoded and was dropped.
    Dropped { topic: String },
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Identity(#[from] IdentityError),

    #[error("broker connection error: {0}")]
    Connection(#[from] BrokerError),

    #[error("malformed payload on topic {topic}: {source}")]
    Parse {
        topic: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid session state: {0}")]
    InvalidState(&'static str),

    #[error("failed to encode outbound message: {0}")]
    Encode(serde_json::Error),
}

/// MQTT strings carry a two-byte length prefix.
const MAX_TOPIC_BYTES: usize = u16::MAX as usize;

type Observer = Box<dyn FnMut(&Value) + Send>;
type ErrorReporter = Arc<dyn Fn(&SessionError) + Send + Sync>;

/// Owns the credential lifecycle and the single broker connection.
pub struct SessionManager {
    config: SessionConfig,
    identity: Arc<dyn IdentityProvider>,
    connector: Arc<dyn BrokerConnector>,
    state: SessionState,
    credential: Option<Credential>,
    broker: Option<Box<dyn BrokerClient>>,
    events: Option<mpsc::UnboundedReceiver<BrokerEvent>>,
    current_topic: Option<String>,
    observer: Option<Observer>,
    error_reporter: Option<ErrorReporter>,
    parse_errors: u64,
}

impl SessionManager {
    pub fn new(
        config: SessionConfig,
        identity: Arc<dyn IdentityProvider>,
        connector: Arc<dyn BrokerConnector>,
    ) -> Self {
        Self {
            config,
            identity,
            connector,
            state: SessionState::Uninitialized,
            credential: None,
            broker: None,
            events: None,
            current_topic: None,
            observer: None,
            error_reporter: None,
            parse_errors: 0,
        }
    }

    /// Registers the callback invoked with every decoded payload.
    pub fn with_observer<F>(mut self, observer: F) -> Self
    where
        F: FnMut(&Value) + Send + 'static,
    {
        self.observer = Some(Box::new(observer));
        self
    }

    /// Registers a callback that receives every reported error.
    pub fn with_error_reporter<F>(mut self, reporter: F) -> Self
    where
        F: Fn(&SessionError) + Send + Sync + 'static,
    {
        self.error_reporter = Some(Arc::new(reporter));
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn current_topic(&self) -> Option<&str> {
        self.current_topic.as_deref()
    }

    pub fn client_id(&self) -> &str {
        &self.config.client_id
    }

    pub fn region(&self) -> &str {
        &self.config.region
    }

    /// Number of inbound payloads dropped because they were not valid JSON.
    pub fn parse_errors(&self) -> u64 {
        self.parse_errors
    }

    pub fn credential_expiration(&self) -> Option<DateTime<Utc>> {
        self.credential.as_ref().and_then(|credential| credential.expiration)
    }

    /// Obtains credentials and opens the broker connection.
    ///
    /// Errors are reported once through the error reporter and returned; no
    /// retry is attempted.
    pub async fn initialize(&mut self) -> Result<(), SessionError> {
        if self.broker.is_some() {
            return Err(SessionError::InvalidState("session is already initialized"));
        }

        self.state = SessionState::AwaitingCredentials;
        let credential = match fetch_credential(self.identity.clone()).await {
            Ok(credential) => credential,
            Err(err) => return Err(self.fail(err.into())),
        };

        self.state = SessionState::AwaitingConnection;
        if let Err(err) = self.open_broker_connection(&credential) {
            return Err(self.fail(err));
        }
        self.credential = Some(credential);
        Ok(())
    }

    /// Resolves an identity and exchanges it for temporary credentials.
    pub async fn connect_to_identity_provider(&self) -> Result<Credential, IdentityError> {
        fetch_credential(self.identity.clone()).await
    }

    /// Constructs the broker connection and pushes `credential` to it.
    ///
    /// The connection is always constructed with placeholder credentials; the
    /// real ones follow through an explicit update.
    pub fn open_broker_connection(&mut self, credential: &Credential) -> Result<(), SessionError> {
        if self.broker.is_some() {
            return Err(SessionError::InvalidState("broker connection already open"));
        }

        let config = BrokerConfig {
            region: self.config.region.clone(),
            client_id: self.config.client_id.clone(),
            protocol: BrokerProtocol::SecureWebSocket,
            max_reconnect: self.config.max_reconnect,
            credential: Credential::placeholder(),
        };
        let connection = self.connector.construct(config)?;
        connection.client.update_credentials(credential.clone())?;

        info!(event = "broker_opened", client_id = %self.config.client_id);
        self.broker = Some(connection.client);
        self.events = Some(connection.events);
        Ok(())
    }

    /// Re-runs the identity exchange and pushes the new credentials to the
    /// broker. Takes effect on the broker's next connect.
    pub async fn refresh_credentials(&mut self) -> Result<(), SessionError> {
        if self.broker.is_none() {
            return Err(SessionError::InvalidState("no broker connection"));
        }
        let credential = match fetch_credential(self.identity.clone()).await {
            Ok(credential) => credential,
            Err(err) => {
                let err = SessionError::from(err);
                self.report(&err);
                return Err(err);
            }
        };
        if let Some(broker) = self.broker.as_ref() {
            broker.update_credentials(credential.clone())?;
        }
        self.credential = Some(credential);
        Ok(())
    }

    /// Receives the next broker event and applies it to the session.
    ///
    /// Returns `None` once the broker connection has ended.
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        let next = match self.events.as_mut() {
            Some(events) => events.recv().await,
            None => return None,
        };
        let Some(event) = next else {
            self.events = None;
            self.state = SessionState::Disconnected;
            return None;
        };
        Some(self.apply_event(event))
    }

    fn apply_event(&mut self, event: BrokerEvent) -> SessionEvent {
        match event {
            BrokerEvent::Connected => {
                self.on_connected();
                SessionEvent::Connected
            }
            BrokerEvent::Reconnecting => {
                self.on_reconnecting();
                SessionEvent::Reconnecting
            }
            BrokerEvent::Message { topic, payload } => match self.on_message(&topic, &payload) {
                Some(message) => SessionEvent::Message(message),
                None => SessionEvent::Dropped { topic },
            },
        }
    }

    pub fn on_connected(&mut self) {
        info!(event = "session_connected", client_id = %self.config.client_id);
        self.state = SessionState::Connected;
    }

    pub fn on_reconnecting(&mut self) {
        // Credentials are not refreshed here; the broker reuses the last pushed ones.
        info!(event = "session_reconnecting", client_id = %self.config.client_id);
    }

    /// Decodes a raw payload and hands it to the observer.
    ///
    /// Malformed payloads are counted, reported, and dropped.
    pub fn on_message(&mut self, topic: &str, raw: &[u8]) -> Option<InboundMessage> {
        let payload: Value = match serde_json::from_slice(raw) {
            Ok(payload) => payload,
            Err(source) => {
                self.parse_errors += 1;
                warn!(
                    event = "message_dropped",
                    topic,
                    error = %source,
                    parse_errors = self.parse_errors
                );
                self.report(&SessionError::Parse {
                    topic: topic.to_string(),
                    source,
                });
                return None;
            }
        };

        debug!(event = "message_received", topic, payload = %payload);
        if let Some(observer) = self.observer.as_mut() {
            observer(&payload);
        }
        Some(InboundMessage {
            topic: topic.to_string(),
            payload,
        })
    }

    /// Switches the single active subscription to `topic`.
    ///
    /// The previous topic is unsubscribed before the new one is subscribed.
    pub fn set_topic(&mut self, topic: &str) -> Result<(), SessionError> {
        validate_topic(topic)?;
        if self.broker.is_none() {
            return Err(SessionError::InvalidState("no broker connection"));
        }

        info!(event = "subscribed", topic);
        self.end_subscription();
        self.current_topic = Some(topic.to_string());
        match self.broker.as_ref() {
            Some(broker) => broker.subscribe(topic)?,
            None => return Err(SessionError::InvalidState("no broker connection")),
        }
        Ok(())
    }

    /// Unsubscribes the current topic, if any, and clears it.
    ///
    /// Unsubscribe failures are logged and otherwise ignored.
    pub fn end_subscription(&mut self) {
        if let (Some(topic), Some(broker)) = (self.current_topic.as_deref(), self.broker.as_ref()) {
            if let Err(err) = broker.unsubscribe(topic) {
                warn!(event = "unsubscribe_failed", topic, error = %err);
            }
        }
        self.current_topic = None;
    }

    /// Publishes `{from, message}` as JSON on the current topic.
    ///
    /// Wildcard filters such as `room/#` can be subscribed but not published to.
    pub fn publish(&mut self, from: &str, message: &str) -> Result<(), SessionError> {
        let Some(topic) = self.current_topic.as_deref() else {
            return Err(SessionError::InvalidState("no topic is set"));
        };
        if topic.contains(['+', '#']) {
            return Err(SessionError::InvalidState(
                "cannot publish to a wildcard topic filter",
            ));
        }
        let Some(broker) = self.broker.as_ref() else {
            return Err(SessionError::InvalidState("no broker connection"));
        };

        let payload = serde_json::to_vec(&OutboundMessage {
            from: from.to_string(),
            message: message.to_string(),
        })
        .map_err(SessionError::Encode)?;
        debug!(event = "publishing", topic, bytes = payload.len());
        broker.publish(topic, Bytes::from(payload))?;
        Ok(())
    }

    /// Clears the subscription and asks the broker to disconnect.
    pub fn close(&mut self) -> Result<(), SessionError> {
        self.end_subscription();
        match self.broker.as_ref() {
            Some(broker) => {
                broker.disconnect()?;
                Ok(())
            }
            None => Err(SessionError::InvalidState("no broker connection")),
        }
    }

    fn fail(&mut self, err: SessionError) -> SessionError {
        self.state = SessionState::Errored;
        self.report(&err);
        err
    }

    fn report(&self, err: &SessionError) {
        if let Some(reporter) = self.error_reporter.as_ref() {
            reporter(err);
        }
    }
}

/// Rejects topics the broker connection could never encode.
fn validate_topic(topic: &str) -> Result<(), SessionError> {
    if topic.is_empty() {
        return Err(SessionError::InvalidState("topic must not be empty"));
    }
    if topic.len() > MAX_TOPIC_BYTES {
        return Err(SessionError::InvalidState("topic exceeds 65535 bytes"));
    }
    if topic.contains('\0') {
        return Err(SessionError::InvalidState("topic must not contain NUL"));
    }
    Ok(())
}

async fn fetch_credential(identity: Arc<dyn IdentityProvider>) -> Result<Credential, IdentityError> {
    let identity_id = identity.get_id().await.map_err(|err| {
        warn!(event = "identity_retrieval_failed", error = %err);
        err
    })?;
    debug!(event = "identity_resolved", identity_id = %identity_id);

    let credential = identity
        .get_credentials_for_identity(&identity_id)
        .await
        .map_err(|err| {
            warn!(event = "credential_retrieval_failed", error = %err);
            err
        })?;
    if !credential.is_complete() {
        return Err(IdentityError::IncompleteCredential);
    }

    info!(
        event = "credentials_retrieved",
        access_key_id = %credential.access_key_id,
        expires_at = ?credential.expiration
    );
    Ok(credential)
}
