//! MQTT 3.1.1 client packets used on the broker websocket.
//!
//! Only what a QoS 0 publish/subscribe client needs is covered. Inbound
//! QoS 1 publishes are decoded so they can be acknowledged.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

const PROTOCOL_NAME: &[u8] = b"MQTT";
const PROTOCOL_LEVEL: u8 = 4;
const CONNECT_FLAG_CLEAN_SESSION: u8 = 0x02;
const MAX_REMAINING_LENGTH: usize = 268_435_455;
/// Upper bound accepted for inbound packets; the gateway caps payloads well below this.
pub const MAX_INBOUND_PACKET: usize = 256 * 1024;

const CONNECT: u8 = 1;
const CONNACK: u8 = 2;
const PUBLISH: u8 = 3;
const PUBACK: u8 = 4;
const SUBSCRIBE: u8 = 8;
const SUBACK: u8 = 9;
const UNSUBSCRIBE: u8 = 10;
const UNSUBACK: u8 = 11;
const PINGREQ: u8 = 12;
const PINGRESP: u8 = 13;
const DISCONNECT: u8 = 14;

/// Packets sent by the client.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClientPacket {
    Connect { client_id: String, keep_alive_secs: u16 },
    Subscribe { packet_id: u16, topic: String },
    Unsubscribe { packet_id: u16, topic: String },
    Publish { topic: String, payload: Bytes },
    PubAck { packet_id: u16 },
    PingReq,
    Disconnect,
}

/// Packets received from the broker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BrokerPacket {
    ConnAck { session_present: bool, return_code: u8 },
    Publish {
        topic: String,
        payload: Bytes,
        /// Set for QoS 1 deliveries, which must be acknowledged.
        packet_id: Option<u16>,
    },
    SubAck { packet_id: u16, return_codes: Vec<u8> },
    UnsubAck { packet_id: u16 },
    PingResp,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("topic must not be empty")]
    EmptyTopic,

    #[error("string of {0} bytes exceeds the 65535 byte limit")]
    StringTooLong(usize),

    #[error("packet of {0} bytes exceeds the remaining-length limit")]
    PacketTooLarge(usize),

    #[error("malformed remaining length")]
    MalformedLength,

    #[error("unexpected packet type {0}")]
    UnexpectedType(u8),

    #[error("malformed {0} packet")]
    Malformed(&'static str),

    #[error("unsupported qos {0}")]
    UnsupportedQos(u8),
}

impl ClientPacket {
    /// Encodes the packet as one complete MQTT frame.
    pub fn encode(&self) -> Result<Bytes, PacketError> {
        let mut body = BytesMut::new();
        let first_byte = match self {
            Self::Connect {
                client_id,
                keep_alive_secs,
            } => {
                put_bytes(&mut body, PROTOCOL_NAME)?;
                body.put_u8(PROTOCOL_LEVEL);
                body.put_u8(CONNECT_FLAG_CLEAN_SESSION);
                body.put_u16(*keep_alive_secs);
                put_bytes(&mut body, client_id.as_bytes())?;
                CONNECT << 4
            }
            Self::Subscribe { packet_id, topic } => {
                body.put_u16(*packet_id);
                put_topic(&mut body, topic)?;
                // Requested QoS 0.
                body.put_u8(0);
                (SUBSCRIBE << 4) | 0x02
            }
            Self::Unsubscribe { packet_id, topic } => {
                body.put_u16(*packet_id);
                put_topic(&mut body, topic)?;
                (UNSUBSCRIBE << 4) | 0x02
            }
            Self::Publish { topic, payload } => {
                put_topic(&mut body, topic)?;
                body.put_slice(payload);
                PUBLISH << 4
            }
            Self::PubAck { packet_id } => {
                body.put_u16(*packet_id);
                PUBACK << 4
            }
            Self::PingReq => PINGREQ << 4,
            Self::Disconnect => DISCONNECT << 4,
        };

        let mut frame = BytesMut::with_capacity(body.len() + 5);
        frame.put_u8(first_byte);
        put_remaining_length(&mut frame, body.len())?;
        frame.extend_from_slice(&body);
        Ok(frame.freeze())
    }
}

/// Decodes one packet from the front of `buf`.
///
/// Returns `Ok(None)` while the frame is incomplete; consumed bytes are only
/// removed once a whole packet is available.
pub fn decode(buf: &mut BytesMut) -> Result<Option<BrokerPacket>, PacketError> {
    let Some((remaining, header_len)) = peek_remaining_length(buf)? else {
        return Ok(None);
    };
    if remaining > MAX_INBOUND_PACKET {
        return Err(PacketError::PacketTooLarge(remaining));
    }
    if buf.len() < header_len + remaining {
        return Ok(None);
    }

    let first_byte = buf[0];
    buf.advance(header_len);
    let mut body = buf.split_to(remaining).freeze();

    let packet = match first_byte >> 4 {
        CONNACK => {
            if body.len() != 2 {
                return Err(PacketError::Malformed("connack"));
            }
            BrokerPacket::ConnAck {
                session_present: body[0] & 0x01 == 0x01,
                return_code: body[1],
            }
        }
        PUBLISH => {
            let qos = (first_byte >> 1) & 0x03;
            let topic = take_string(&mut body, "publish")?;
            let packet_id = match qos {
                0 => None,
                1 => {
                    if body.len() < 2 {
                        return Err(PacketError::Malformed("publish"));
                    }
                    Some(body.get_u16())
                }
                other => return Err(PacketError::UnsupportedQos(other)),
            };
            BrokerPacket::Publish {
                topic,
                payload: body,
                packet_id,
            }
        }
        SUBACK => {
            if body.len() < 3 {
                return Err(PacketError::Malformed("suback"));
            }
            let packet_id = body.get_u16();
            BrokerPacket::SubAck {
                packet_id,
                return_codes: body.to_vec(),
            }
        }
        UNSUBACK => {
            if body.len() != 2 {
                return Err(PacketError::Malformed("unsuback"));
            }
            BrokerPacket::UnsubAck {
                packet_id: body.get_u16(),
            }
        }
        PINGRESP => BrokerPacket::PingResp,
        other => return Err(PacketError::UnexpectedType(other)),
    };

    Ok(Some(packet))
}

fn peek_remaining_length(buf: &[u8]) -> Result<Option<(usize, usize)>, PacketError> {
    let mut value = 0usize;
    let mut multiplier = 1usize;
    for (index, byte) in buf.iter().skip(1).take(4).enumerate() {
        value += usize::from(byte & 0x7F) * multiplier;
        if byte & 0x80 == 0 {
            return Ok(Some((value, index + 2)));
        }
        multiplier *= 128;
    }
    if buf.len() >= 5 {
        return Err(PacketError::MalformedLength);
    }
    Ok(None)
}

fn put_remaining_length(buf: &mut BytesMut, len: usize) -> Result<(), PacketError> {
    if len > MAX_REMAINING_LENGTH {
        return Err(PacketError::PacketTooLarge(len));
    }
    let mut remaining = len;
    loop {
        let mut byte = (remaining % 128) as u8;
        remaining /= 128;
        if remaining > 0 {
            byte |= 0x80;
        }
        buf.put_u8(byte);
        if remaining == 0 {
            return Ok(());
        }
    }
}

fn put_topic(buf: &mut BytesMut, topic: &str) -> Result<(), PacketError> {
    if topic.is_empty() {
        return Err(PacketError::EmptyTopic);
    }
    put_bytes(buf, topic.as_bytes())
}

fn put_bytes(buf: &mut BytesMut, value: &[u8]) -> Result<(), PacketError> {
    let len = u16::try_from(value.len()).map_err(|_| PacketError::StringTooLong(value.len()))?;
    buf.put_u16(len);
    buf.put_slice(value);
    Ok(())
}

fn take_string(body: &mut Bytes, packet: &'static str) -> Result<String, PacketError> {
    if body.len() < 2 {
        return Err(PacketError::Malformed(packet));
    }
    let len = usize::from(body.get_u16());
    if body.len() < len {
        return Err(PacketError::Malformed(packet));
    }
    let raw = body.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|_| PacketError::Malformed(packet))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_frame_matches_mqtt_311_layout() {
        let frame = ClientPacket::Connect {
            client_id: "abc".to_string(),
            keep_alive_secs: 60,
        }
        .encode()
        .expect("encode");
        assert_eq!(
            frame.as_ref(),
            &[
                0x10, 15, 0x00, 0x04, b'M', b'Q', b'T', b'T', 0x04, 0x02, 0x00, 60, 0x00, 0x03,
                b'a', b'b', b'c'
            ]
        );
    }

    #[test]
    fn subscribe_sets_reserved_flags_and_qos_zero() {
        let frame = ClientPacket::Subscribe {
            packet_id: 7,
            topic: "room1".to_string(),
        }
        .encode()
        .expect("encode");
        assert_eq!(frame[0], 0x82);
        assert_eq!(frame[1] as usize, frame.len() - 2);
        assert_eq!(&frame[2..4], &[0x00, 0x07]);
        assert_eq!(*frame.last().expect("qos byte"), 0x00);
    }

    #[test]
    fn publish_payload_follows_topic() {
        let frame = ClientPacket::Publish {
            topic: "t".to_string(),
            payload: Bytes::from_static(b"{}"),
        }
        .encode()
        .expect("encode");
        assert_eq!(frame.as_ref(), &[0x30, 5, 0x00, 0x01, b't', b'{', b'}']);
    }

    #[test]
    fn empty_topic_is_rejected() {
        let err = ClientPacket::Publish {
            topic: String::new(),
            payload: Bytes::new(),
        }
        .encode()
        .expect_err("empty topic");
        assert_eq!(err, PacketError::EmptyTopic);
    }

    #[test]
    fn large_payload_uses_multi_byte_remaining_length() {
        let payload = Bytes::from(vec![b'x'; 300]);
        let frame = ClientPacket::Publish {
            topic: "t".to_string(),
            payload,
        }
        .encode()
        .expect("encode");
        // 3 bytes of topic + 300 payload = 303 = 0xAF 0x02
        assert_eq!(&frame[1..3], &[0xAF, 0x02]);
        assert_eq!(frame.len(), 1 + 2 + 303);
    }

    #[test]
    fn decodes_connack() {
        let mut buf = BytesMut::from(&[0x20, 0x02, 0x00, 0x00][..]);
        let packet = decode(&mut buf).expect("decode").expect("complete");
        assert_eq!(
            packet,
            BrokerPacket::ConnAck {
                session_present: false,
                return_code: 0
            }
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_frames_stay_buffered_until_complete() {
        let frame = [0x30, 0x0A, 0x00, 0x01, b't', b'{', b'"', b'x', b'"', b':', b'1', b'}'];
        let mut buf = BytesMut::from(&frame[..6]);
        assert_eq!(decode(&mut buf).expect("decode"), None);
        assert_eq!(buf.len(), 6);

        buf.extend_from_slice(&frame[6..]);
        let packet = decode(&mut buf).expect("decode").expect("complete");
        assert_eq!(
            packet,
            BrokerPacket::Publish {
                topic: "t".to_string(),
                payload: Bytes::from_static(br#"{"x":1}"#),
                packet_id: None,
            }
        );
    }

    #[test]
    fn decodes_back_to_back_packets() {
        let mut buf = BytesMut::from(&[0xD0, 0x00, 0xB0, 0x02, 0x00, 0x09][..]);
        assert_eq!(
            decode(&mut buf).expect("decode"),
            Some(BrokerPacket::PingResp)
        );
        assert_eq!(
            decode(&mut buf).expect("decode"),
            Some(BrokerPacket::UnsubAck { packet_id: 9 })
        );
        assert_eq!(decode(&mut buf).expect("decode"), None);
    }

    #[test]
    fn qos1_publish_carries_packet_id() {
        let mut buf = BytesMut::from(&[0x32, 0x06, 0x00, 0x01, b'a', 0x00, 0x2A, b'1'][..]);
        let packet = decode(&mut buf).expect("decode").expect("complete");
        assert_eq!(
            packet,
            BrokerPacket::Publish {
                topic: "a".to_string(),
                payload: Bytes::from_static(b"1"),
                packet_id: Some(42),
            }
        );
    }

    #[test]
    fn oversized_length_prefix_is_malformed() {
        let mut buf = BytesMut::from(&[0x30, 0xFF, 0xFF, 0xFF, 0xFF, 0x01][..]);
        assert_eq!(decode(&mut buf), Err(PacketError::MalformedLength));
    }

    #[test]
    fn inbound_packets_beyond_limit_are_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u8(0x30);
        put_remaining_length(&mut buf, MAX_INBOUND_PACKET + 1).expect("length");
        assert_eq!(
            decode(&mut buf),
            Err(PacketError::PacketTooLarge(MAX_INBOUND_PACKET + 1))
        );
    }

    #[test]
    fn client_only_packet_types_are_unexpected_inbound() {
        let mut buf = BytesMut::from(&[0xC0, 0x00][..]);
        assert_eq!(decode(&mut buf), Err(PacketError::UnexpectedType(PINGREQ)));
    }
}
