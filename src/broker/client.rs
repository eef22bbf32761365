//! Device-gateway websocket connector and outbound command handle.
//!
//! Each connection is owned by a background worker that signs the websocket
//! URL, speaks MQTT over it, and reconnects with capped backoff while keeping
//! subscriptions and an offline publish queue in memory.

use std::collections::{BTreeSet, VecDeque};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::broker::packet::{self, BrokerPacket, ClientPacket};
use crate::broker::presign::presign_url;
use crate::broker::{
    BrokerClient, BrokerConfig, BrokerConnection, BrokerConnector, BrokerError, BrokerEvent,
};
use crate::identity::Credential;
use crate::retry::{with_timeout, RetryPolicy};

const MQTT_SUBPROTOCOL: &str = "mqtt";
const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(60);
const DEFAULT_CONNACK_TIMEOUT: Duration = Duration::from_secs(10);
/// Oldest queued publishes are dropped beyond this many.
const MAX_OFFLINE_QUEUE: usize = 1024;

type BrokerSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connector for the MQTT-over-websocket device gateway.
#[derive(Clone, Debug)]
pub struct IotWebSocketConnector {
    scheme: String,
    host: String,
    keep_alive: Duration,
    connack_timeout: Duration,
}

impl IotWebSocketConnector {
    /// Creates a connector for a gateway host such as
    /// `abc123-ats.iot.us-east-1.amazonaws.com`.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            scheme: "wss".to_string(),
            host: endpoint.into().trim().to_string(),
            keep_alive: DEFAULT_KEEP_ALIVE,
            connack_timeout: DEFAULT_CONNACK_TIMEOUT,
        }
    }

    /// Replaces scheme and host from a full URL, eg `ws://127.0.0.1:9001`.
    pub fn with_endpoint_url(mut self, url: &str) -> Self {
        let url = url.trim();
        let host = match url.split_once("://") {
            Some((scheme, rest)) => {
                self.scheme = scheme.to_string();
                rest
            }
            None => url,
        };
        self.host = host.trim_end_matches('/').to_string();
        self
    }

    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn with_connack_timeout(mut self, timeout: Duration) -> Self {
        self.connack_timeout = timeout;
        self
    }
}

impl BrokerConnector for IotWebSocketConnector {
    fn construct(&self, config: BrokerConfig) -> Result<BrokerConnection, BrokerError> {
        if config.client_id.is_empty() {
            return Err(BrokerError::Protocol("client id must not be empty".to_string()));
        }
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            BrokerError::Protocol("broker connections require a tokio runtime".to_string())
        })?;

        debug!(
            event = "broker_construct",
            client_id = %config.client_id,
            protocol = ?config.protocol
        );

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let settings = WorkerSettings {
            scheme: self.scheme.clone(),
            host: self.host.clone(),
            region: config.region,
            client_id: config.client_id,
            keep_alive: self.keep_alive,
            connack_timeout: self.connack_timeout,
            backoff: RetryPolicy::reconnect(config.max_reconnect),
        };

        runtime.spawn(broker_connection_worker(
            settings,
            config.credential,
            command_rx,
            event_tx,
        ));

        Ok(BrokerConnection {
            client: Box::new(IotBrokerClient { tx: command_tx }),
            events: event_rx,
        })
    }
}

#[derive(Debug)]
enum BrokerCommand {
    UpdateCredentials(Credential),
    Subscribe(String),
    Unsubscribe(String),
    Publish { topic: String, payload: Bytes },
    Disconnect,
}

/// Cloneable command handle for a websocket broker connection.
#[derive(Clone, Debug)]
pub struct IotBrokerClient {
    tx: mpsc::UnboundedSender<BrokerCommand>,
}

impl IotBrokerClient {
    fn send(&self, command: BrokerCommand) -> Result<(), BrokerError> {
        self.tx
            .send(command)
            .map_err(|_| BrokerError::CommandQueueClosed)
    }
}

impl BrokerClient for IotBrokerClient {
    fn update_credentials(&self, credential: Credential) -> Result<(), BrokerError> {
        self.send(BrokerCommand::UpdateCredentials(credential))
    }

    fn subscribe(&self, topic: &str) -> Result<(), BrokerError> {
        self.send(BrokerCommand::Subscribe(topic.to_string()))
    }

    fn unsubscribe(&self, topic: &str) -> Result<(), BrokerError> {
        self.send(BrokerCommand::Unsubscribe(topic.to_string()))
    }

    fn publish(&self, topic: &str, payload: Bytes) -> Result<(), BrokerError> {
        self.send(BrokerCommand::Publish {
            topic: topic.to_string(),
            payload,
        })
    }

    fn disconnect(&self) -> Result<(), BrokerError> {
        self.send(BrokerCommand::Disconnect)
    }
}

struct WorkerSettings {
    scheme: String,
    host: String,
    region: String,
    client_id: String,
    keep_alive: Duration,
    connack_timeout: Duration,
    backoff: RetryPolicy,
}

/// Connection state that survives reconnects.
struct WorkerState {
    credential: Credential,
    subscriptions: BTreeSet<String>,
    pending: VecDeque<(String, Bytes)>,
    last_packet_id: u16,
}

impl WorkerState {
    fn new(credential: Credential) -> Self {
        Self {
            credential,
            subscriptions: BTreeSet::new(),
            pending: VecDeque::new(),
            last_packet_id: 0,
        }
    }

    fn next_packet_id(&mut self) -> u16 {
        // Zero is not a valid packet identifier.
        self.last_packet_id = self.last_packet_id.wrapping_add(1).max(1);
        self.last_packet_id
    }

    fn queue_publish(&mut self, topic: String, payload: Bytes) {
        if self.pending.len() >= MAX_OFFLINE_QUEUE {
            self.pending.pop_front();
            warn!(event = "broker_offline_queue_full", capacity = MAX_OFFLINE_QUEUE);
        }
        self.pending.push_back((topic, payload));
    }

    /// Applies a command while no socket is open. Returns `false` once the
    /// connection should shut down.
    fn apply_offline(&mut self, command: BrokerCommand) -> bool {
        match command {
            BrokerCommand::UpdateCredentials(credential) => self.credential = credential,
            BrokerCommand::Subscribe(topic) => {
                self.subscriptions.insert(topic);
            }
            BrokerCommand::Unsubscribe(topic) => {
                self.subscriptions.remove(&topic);
            }
            BrokerCommand::Publish { topic, payload } => self.queue_publish(topic, payload),
            BrokerCommand::Disconnect => return false,
        }
        true
    }
}

enum SessionOutcome {
    GracefulShutdown,
    Reconnect,
}

async fn broker_connection_worker(
    settings: WorkerSettings,
    credential: Credential,
    mut commands: mpsc::UnboundedReceiver<BrokerCommand>,
    events: mpsc::UnboundedSender<BrokerEvent>,
) {
    let mut state = WorkerState::new(credential);
    let mut attempt = 0usize;

    loop {
        if !state.credential.is_complete() {
            debug!(event = "broker_waiting_for_credentials");
            match commands.recv().await {
                Some(command) => {
                    if state.apply_offline(command) {
                        continue;
                    }
                    break;
                }
                None => break,
            }
        }

        match run_connected_session(&settings, &mut state, &mut commands, &events).await {
            Ok(SessionOutcome::GracefulShutdown) => {
                info!(event = "broker_disconnected", client_id = %settings.client_id);
                break;
            }
            Ok(SessionOutcome::Reconnect) => attempt = 0,
            Err(err) => warn!(event = "broker_connect_failed", error = %err),
        }

        if commands.is_closed() {
            break;
        }

        attempt += 1;
        let delay = settings.backoff.delay_for_attempt(attempt);
        info!(
            event = "broker_reconnecting",
            attempt,
            delay_ms = delay.as_millis() as u64
        );
        let _ = events.send(BrokerEvent::Reconnecting);

        if !collect_commands_during_delay(delay, &mut commands, &mut state).await {
            break;
        }
    }
}

async fn run_connected_session(
    settings: &WorkerSettings,
    state: &mut WorkerState,
    commands: &mut mpsc::UnboundedReceiver<BrokerCommand>,
    events: &mpsc::UnboundedSender<BrokerEvent>,
) -> Result<SessionOutcome, BrokerError> {
    let url = presign_url(
        &settings.scheme,
        &settings.host,
        &settings.region,
        &state.credential,
        Utc::now(),
    )?;
    let mut request = url.into_client_request()?;
    request.headers_mut().insert(
        "sec-websocket-protocol",
        HeaderValue::from_static(MQTT_SUBPROTOCOL),
    );

    let (mut socket, _) = connect_async(request).await?;

    let keep_alive_secs = u16::try_from(settings.keep_alive.as_secs()).unwrap_or(u16::MAX);
    send_packet(
        &mut socket,
        &ClientPacket::Connect {
            client_id: settings.client_id.clone(),
            keep_alive_secs,
        },
    )
    .await?;

    let mut inbound = BytesMut::new();
    let first = with_timeout(
        settings.connack_timeout,
        recv_packet_before_connack(&mut socket, &mut inbound),
    )
    .await
    .map_err(|_| BrokerError::Protocol("timed out waiting for connack".to_string()))??;

    match first {
        BrokerPacket::ConnAck { return_code: 0, .. } => {}
        BrokerPacket::ConnAck { return_code, .. } => {
            return Err(BrokerError::Protocol(format!(
                "connection refused with return code {return_code}"
            )));
        }
        other => {
            return Err(BrokerError::Protocol(format!(
                "expected connack as first packet, got {other:?}"
            )));
        }
    }

    info!(event = "broker_connected", client_id = %settings.client_id);
    let _ = events.send(BrokerEvent::Connected);

    let topics: Vec<String> = state.subscriptions.iter().cloned().collect();
    for topic in topics {
        let packet_id = state.next_packet_id();
        let packet = ClientPacket::Subscribe {
            packet_id,
            topic: topic.clone(),
        };
        match send_packet(&mut socket, &packet).await {
            Ok(()) => {}
            Err(BrokerError::Packet(err)) => {
                warn!(event = "broker_subscription_dropped", error = %err);
                state.subscriptions.remove(&topic);
            }
            Err(_) => return Ok(SessionOutcome::Reconnect),
        }
    }

    while let Some((topic, payload)) = state.pending.pop_front() {
        let packet = ClientPacket::Publish {
            topic: topic.clone(),
            payload: payload.clone(),
        };
        match send_packet(&mut socket, &packet).await {
            Ok(()) => {}
            Err(BrokerError::Packet(err)) => {
                warn!(event = "broker_queued_publish_dropped", error = %err);
            }
            Err(_) => {
                state.pending.push_front((topic, payload));
                return Ok(SessionOutcome::Reconnect);
            }
        }
    }

    let mut keep_alive =
        tokio::time::interval_at(Instant::now() + settings.keep_alive, settings.keep_alive);
    let mut awaiting_ping_response = false;

    loop {
        tokio::select! {
            maybe_command = commands.recv() => {
                let packet = match maybe_command {
                    Some(BrokerCommand::UpdateCredentials(credential)) => {
                        // Takes effect on the next connect.
                        state.credential = credential;
                        continue;
                    }
                    Some(BrokerCommand::Subscribe(topic)) => {
                        state.subscriptions.insert(topic.clone());
                        ClientPacket::Subscribe { packet_id: state.next_packet_id(), topic }
                    }
                    Some(BrokerCommand::Unsubscribe(topic)) => {
                        state.subscriptions.remove(&topic);
                        ClientPacket::Unsubscribe { packet_id: state.next_packet_id(), topic }
                    }
                    Some(BrokerCommand::Publish { topic, payload }) => {
                        ClientPacket::Publish { topic, payload }
                    }
                    Some(BrokerCommand::Disconnect) | None => {
                        let _ = send_packet(&mut socket, &ClientPacket::Disconnect).await;
                        let _ = socket.close(None).await;
                        return Ok(SessionOutcome::GracefulShutdown);
                    }
                };
                match send_packet(&mut socket, &packet).await {
                    Ok(()) => debug!(event = "broker_packet_sent", packet = packet_kind(&packet)),
                    Err(BrokerError::Packet(err)) => {
                        warn!(event = "broker_packet_rejected", error = %err);
                        if let ClientPacket::Subscribe { topic, .. } = &packet {
                            state.subscriptions.remove(topic);
                        }
                    }
                    Err(_) => {
                        if let ClientPacket::Publish { topic, payload } = packet {
                            state.queue_publish(topic, payload);
                        }
                        return Ok(SessionOutcome::Reconnect);
                    }
                }
            }
            maybe_frame = socket.next() => {
                match maybe_frame {
                    Some(Ok(Message::Binary(data))) => {
                        inbound.extend_from_slice(&data);
                        loop {
                            match packet::decode(&mut inbound) {
                                Ok(Some(BrokerPacket::PingResp)) => awaiting_ping_response = false,
                                Ok(Some(packet)) => {
                                    if handle_broker_packet(&mut socket, events, packet).await.is_err() {
                                        return Ok(SessionOutcome::Reconnect);
                                    }
                                }
                                Ok(None) => break,
                                Err(err) => {
                                    warn!(event = "broker_frame_invalid", error = %err);
                                    return Ok(SessionOutcome::Reconnect);
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            return Ok(SessionOutcome::Reconnect);
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) => return Ok(SessionOutcome::Reconnect),
                    Some(Ok(_)) => return Ok(SessionOutcome::Reconnect),
                    Some(Err(_)) => return Ok(SessionOutcome::Reconnect),
                    None => return Ok(SessionOutcome::Reconnect),
                }
            }
            _ = keep_alive.tick() => {
                if awaiting_ping_response {
                    warn!(event = "broker_keep_alive_expired", client_id = %settings.client_id);
                    return Ok(SessionOutcome::Reconnect);
                }
                if send_packet(&mut socket, &ClientPacket::PingReq).await.is_err() {
                    return Ok(SessionOutcome::Reconnect);
                }
                awaiting_ping_response = true;
            }
        }
    }
}

async fn handle_broker_packet(
    socket: &mut BrokerSocket,
    events: &mpsc::UnboundedSender<BrokerEvent>,
    packet: BrokerPacket,
) -> Result<(), BrokerError> {
    match packet {
        BrokerPacket::Publish {
            topic,
            payload,
            packet_id,
        } => {
            debug!(event = "broker_message", topic = %topic, bytes = payload.len());
            let _ = events.send(BrokerEvent::Message { topic, payload });
            if let Some(packet_id) = packet_id {
                send_packet(socket, &ClientPacket::PubAck { packet_id }).await?;
            }
        }
        BrokerPacket::SubAck {
            packet_id,
            return_codes,
        } => {
            if return_codes.iter().any(|code| *code == 0x80) {
                warn!(event = "broker_subscribe_rejected", packet_id);
            } else {
                debug!(event = "broker_subscribed", packet_id);
            }
        }
        BrokerPacket::UnsubAck { packet_id } => debug!(event = "broker_unsubscribed", packet_id),
        BrokerPacket::PingResp => {}
        BrokerPacket::ConnAck { .. } => warn!(event = "broker_unexpected_connack"),
    }
    Ok(())
}

async fn recv_packet_before_connack(
    socket: &mut BrokerSocket,
    inbound: &mut BytesMut,
) -> Result<BrokerPacket, BrokerError> {
    loop {
        if let Some(packet) = packet::decode(inbound)? {
            return Ok(packet);
        }
        match socket.next().await {
            Some(Ok(Message::Binary(data))) => inbound.extend_from_slice(&data),
            Some(Ok(Message::Ping(payload))) => {
                socket.send(Message::Pong(payload)).await?;
            }
            Some(Ok(Message::Pong(_))) => {}
            Some(Ok(Message::Close(_))) => {
                return Err(BrokerError::Protocol(
                    "socket closed before connack".to_string(),
                ));
            }
            Some(Ok(_)) => {
                return Err(BrokerError::Protocol(
                    "received non-binary frame before connack".to_string(),
                ));
            }
            Some(Err(err)) => return Err(BrokerError::WebSocket(err)),
            None => {
                return Err(BrokerError::Protocol(
                    "socket ended before connack".to_string(),
                ));
            }
        }
    }
}

async fn send_packet(socket: &mut BrokerSocket, packet: &ClientPacket) -> Result<(), BrokerError> {
    let frame = packet.encode()?;
    socket.send(Message::Binary(frame.to_vec())).await?;
    Ok(())
}

fn packet_kind(packet: &ClientPacket) -> &'static str {
    match packet {
        ClientPacket::Connect { .. } => "connect",
        ClientPacket::Subscribe { .. } => "subscribe",
        ClientPacket::Unsubscribe { .. } => "unsubscribe",
        ClientPacket::Publish { .. } => "publish",
        ClientPacket::PubAck { .. } => "puback",
        ClientPacket::PingReq => "pingreq",
        ClientPacket::Disconnect => "disconnect",
    }
}

async fn collect_commands_during_delay(
    delay: Duration,
    commands: &mut mpsc::UnboundedReceiver<BrokerCommand>,
    state: &mut WorkerState,
) -> bool {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);

    loop {
        tokio::select! {
            _ = &mut sleep => return true,
            maybe_command = commands.recv() => {
                match maybe_command {
                    Some(command) => {
                        if !state.apply_offline(command) {
                            return false;
                        }
                    }
                    None => return false,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use secrecy::ExposeSecret;
    use tokio::sync::mpsc;

    use super::*;
    use crate::broker::BrokerProtocol;

    fn config() -> BrokerConfig {
        BrokerConfig {
            region: "us-east-1".to_string(),
            client_id: "client-1".to_string(),
            protocol: BrokerProtocol::SecureWebSocket,
            max_reconnect: Duration::from_millis(8000),
            credential: Credential::placeholder(),
        }
    }

    #[test]
    fn endpoint_url_override_replaces_scheme_and_host() {
        let connector = IotWebSocketConnector::new("abc-ats.iot.us-east-1.amazonaws.com")
            .with_endpoint_url(" ws://127.0.0.1:9001/ ");
        assert_eq!(connector.scheme, "ws");
        assert_eq!(connector.host, "127.0.0.1:9001");
    }

    #[test]
    fn default_connector_uses_secure_websocket() {
        let connector = IotWebSocketConnector::new("abc-ats.iot.us-east-1.amazonaws.com");
        assert_eq!(connector.scheme, "wss");
        assert_eq!(connector.host, "abc-ats.iot.us-east-1.amazonaws.com");
    }

    #[test]
    fn construct_without_runtime_is_an_error() {
        let connector = IotWebSocketConnector::new("h.example");
        assert!(matches!(
            connector.construct(config()),
            Err(BrokerError::Protocol(_))
        ));
    }

    #[test]
    fn construct_rejects_empty_client_id() {
        let connector = IotWebSocketConnector::new("h.example");
        let mut config = config();
        config.client_id.clear();
        assert!(connector.construct(config).is_err());
    }

    #[test]
    fn packet_ids_skip_zero_on_wrap() {
        let mut state = WorkerState::new(Credential::placeholder());
        state.last_packet_id = u16::MAX - 1;
        assert_eq!(state.next_packet_id(), u16::MAX);
        assert_eq!(state.next_packet_id(), 1);
    }

    #[test]
    fn offline_commands_update_state() {
        let mut state = WorkerState::new(Credential::placeholder());
        assert!(state.apply_offline(BrokerCommand::Subscribe("a".to_string())));
        assert!(state.apply_offline(BrokerCommand::Subscribe("b".to_string())));
        assert!(state.apply_offline(BrokerCommand::Unsubscribe("a".to_string())));
        assert!(state.apply_offline(BrokerCommand::Publish {
            topic: "b".to_string(),
            payload: Bytes::from_static(b"{}"),
        }));
        assert!(state.apply_offline(BrokerCommand::UpdateCredentials(Credential::new(
            "AKIA", "secret", "token"
        ))));

        assert_eq!(state.subscriptions.iter().collect::<Vec<_>>(), vec!["b"]);
        assert_eq!(state.pending.len(), 1);
        assert!(state.credential.is_complete());
        assert_eq!(state.credential.secret_key.expose_secret(), "secret");
        assert!(!state.apply_offline(BrokerCommand::Disconnect));
    }

    #[test]
    fn offline_queue_drops_oldest_when_full() {
        let mut state = WorkerState::new(Credential::placeholder());
        for index in 0..=MAX_OFFLINE_QUEUE {
            state.queue_publish(format!("t{index}"), Bytes::new());
        }
        assert_eq!(state.pending.len(), MAX_OFFLINE_QUEUE);
        assert_eq!(state.pending.front().map(|(topic, _)| topic.as_str()), Some("t1"));
    }

    #[tokio::test(start_paused = true)]
    async fn delay_collects_commands_until_disconnect() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut state = WorkerState::new(Credential::placeholder());

        tx.send(BrokerCommand::Subscribe("room".to_string())).expect("send");
        assert!(collect_commands_during_delay(Duration::from_millis(50), &mut rx, &mut state).await);
        assert!(state.subscriptions.contains("room"));

        tx.send(BrokerCommand::Disconnect).expect("send");
        assert!(!collect_commands_during_delay(Duration::from_secs(5), &mut rx, &mut state).await);
    }

    #[tokio::test]
    async fn waits_for_credentials_and_stops_on_disconnect() {
        let connector = IotWebSocketConnector::new("127.0.0.1:9");
        let connection = connector.construct(config()).expect("construct");
        let mut events = connection.events;

        connection.client.subscribe("room").expect("subscribe");
        connection.client.disconnect().expect("disconnect");

        // Placeholder credentials never trigger a connect attempt, so the
        // worker exits without emitting any event.
        let next = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("worker should stop");
        assert_eq!(next, None);
    }
}
