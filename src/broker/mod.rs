//! Message-broker seam and the MQTT-over-WebSocket implementation.
//!
//! - `client`: websocket worker with offline queue and reconnect handling.
//! - `packet`: MQTT client packets exchanged with the device gateway.
//! - `presign`: signed websocket URL built from temporary credentials.

use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::http::header::InvalidHeaderValue;
use tokio_tungstenite::tungstenite::Error as WsError;

use crate::identity::Credential;

/// Websocket connector and command handle.
pub mod client;
/// MQTT packet codec.
pub mod packet;
/// Signed websocket URL construction.
pub mod presign;

pub use client::IotWebSocketConnector;

/// Transport used to reach the broker.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BrokerProtocol {
    /// MQTT framed inside a TLS websocket.
    SecureWebSocket,
}

/// Construction-time broker settings.
///
/// `credential` is expected to be [`Credential::placeholder`]; real values are
/// pushed afterwards through [`BrokerClient::update_credentials`].
#[derive(Clone, Debug)]
pub struct BrokerConfig {
    pub region: String,
    pub client_id: String,
    pub protocol: BrokerProtocol,
    /// Ceiling for the reconnect backoff.
    pub max_reconnect: Duration,
    pub credential: Credential,
}

/// Lifecycle and traffic notifications produced by a broker connection.
#[derive(Clone, Debug, PartialEq)]
pub enum BrokerEvent {
    Connected,
    Reconnecting,
    Message { topic: String, payload: Bytes },
}

/// Command handle for an open broker connection.
///
/// Calls only enqueue work; delivery happens on the connection's own task.
pub trait BrokerClient: Send {
    /// Replaces the credentials used for the next (re)connect.
    fn update_credentials(&self, credential: Credential) -> Result<(), BrokerError>;

    fn subscribe(&self, topic: &str) -> Result<(), BrokerError>;

    fn unsubscribe(&self, topic: &str) -> Result<(), BrokerError>;

    fn publish(&self, topic: &str, payload: Bytes) -> Result<(), BrokerError>;

    /// Requests a graceful disconnect; no reconnect follows.
    fn disconnect(&self) -> Result<(), BrokerError>;
}

/// Client handle paired with the event stream of the same connection.
///
/// The event receiver exists from construction, so nothing emitted before
/// the caller starts polling is lost.
pub struct BrokerConnection {
    pub client: Box<dyn BrokerClient>,
    pub events: mpsc::UnboundedReceiver<BrokerEvent>,
}

/// Factory for broker connections.
pub trait BrokerConnector: Send + Sync {
    fn construct(&self, config: BrokerConfig) -> Result<BrokerConnection, BrokerError>;
}

/// Errors produced by broker transport and protocol handling.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] WsError),

    #[error("mqtt packet error: {0}")]
    Packet(#[from] packet::PacketError),

    #[error("cannot sign broker url: {0}")]
    Presign(#[from] presign::PresignError),

    #[error("invalid websocket header: {0}")]
    InvalidHeader(#[from] InvalidHeaderValue),

    #[error("broker command queue is closed")]
    CommandQueueClosed,

    #[error("broker protocol error: {0}")]
    Protocol(String),
}
