//! MQTT-over-websocket mock broker helpers shared by the broker tests.
#![allow(dead_code)]

use std::net::SocketAddr;

use axum::extract::ws::{Message, WebSocket};
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::oneshot;

pub const CONNECT: u8 = 0x10;
pub const SUBSCRIBE: u8 = 0x82;
pub const UNSUBSCRIBE: u8 = 0xa2;
pub const PUBLISH_QOS0: u8 = 0x30;
pub const PINGREQ: u8 = 0xc0;
pub const DISCONNECT: u8 = 0xe0;

pub const CONNACK_ACCEPTED: [u8; 4] = [0x20, 0x02, 0x00, 0x00];
pub const PINGRESP: [u8; 2] = [0xd0, 0x00];

pub fn suback(packet_id_hi: u8, packet_id_lo: u8) -> Vec<u8> {
    vec![0x90, 0x03, packet_id_hi, packet_id_lo, 0x00]
}

/// Reads one binary websocket message holding exactly one MQTT packet.
pub async fn recv_frame(socket: &mut WebSocket) -> Result<(u8, Vec<u8>), String> {
    loop {
        match socket.next().await {
            Some(Ok(Message::Binary(data))) => return split_packet(&data),
            Some(Ok(Message::Ping(payload))) => {
                socket
                    .send(Message::Pong(payload))
                    .await
                    .map_err(|err| format!("failed to send pong: {err}"))?;
            }
            Some(Ok(Message::Pong(_))) => {}
            Some(Ok(Message::Close(_))) => {
                return Err("websocket closed before expected packet".to_string());
            }
            Some(Ok(_)) => return Err("received unexpected non-binary websocket frame".to_string()),
            Some(Err(err)) => return Err(format!("websocket receive error: {err}")),
            None => return Err("websocket stream ended unexpectedly".to_string()),
        }
    }
}

pub async fn send_frame(socket: &mut WebSocket, frame: Vec<u8>) -> Result<(), String> {
    socket
        .send(Message::Binary(frame))
        .await
        .map_err(|err| format!("failed to send broker packet: {err}"))
}

pub fn split_packet(data: &[u8]) -> Result<(u8, Vec<u8>), String> {
    let (&first, rest) = data.split_first().ok_or("empty mqtt frame")?;
    let mut remaining = 0usize;
    let mut multiplier = 1usize;
    let mut consumed = 0usize;
    loop {
        let byte = *rest.get(consumed).ok_or("truncated remaining length")?;
        consumed += 1;
        remaining += usize::from(byte & 0x7f) * multiplier;
        if byte & 0x80 == 0 {
            break;
        }
        multiplier *= 128;
    }
    let body = &rest[consumed..];
    if body.len() != remaining {
        return Err(format!(
            "remaining length {remaining} does not match body of {} bytes",
            body.len()
        ));
    }
    Ok((first, body.to_vec()))
}

pub fn read_string(data: &[u8]) -> Result<(String, &[u8]), String> {
    if data.len() < 2 {
        return Err("truncated string length".to_string());
    }
    let len = usize::from(u16::from_be_bytes([data[0], data[1]]));
    let end = 2 + len;
    let raw = data.get(2..end).ok_or("truncated string")?;
    let value = String::from_utf8(raw.to_vec()).map_err(|err| err.to_string())?;
    Ok((value, &data[end..]))
}

pub fn parse_connect_client_id(body: &[u8]) -> Result<String, String> {
    let (protocol, rest) = read_string(body)?;
    if protocol != "MQTT" || rest.len() < 4 || rest[0] != 4 {
        return Err("CONNECT is not MQTT 3.1.1".to_string());
    }
    // level, flags, keep-alive
    let (client_id, _) = read_string(&rest[4..])?;
    Ok(client_id)
}

pub fn publish_frame(topic: &str, payload: &[u8]) -> Vec<u8> {
    let remaining = 2 + topic.len() + payload.len();
    assert!(remaining < 128, "mock publish must fit a one-byte length");
    let mut frame = vec![0x30, remaining as u8];
    frame.extend_from_slice(&(topic.len() as u16).to_be_bytes());
    frame.extend_from_slice(topic.as_bytes());
    frame.extend_from_slice(payload);
    frame
}

pub async fn spawn_server(
    app: Router,
) -> (SocketAddr, oneshot::Sender<()>, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock server listener");
    let addr = listener
        .local_addr()
        .expect("read mock server listener address");
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
            .expect("mock server should run");
    });
    (addr, shutdown_tx, task)
}
