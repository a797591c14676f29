//! MQTT Packet Decoder
//!
//! Incremental decoder over a byte buffer: returns `Ok(None)` until a whole
//! packet is buffered, then the packet plus the number of bytes consumed.
//! Topic and payload fields are copied into pool-backed slices owned by the
//! decoded packet.

use bytes::Bytes;

use super::{read_binary, read_string, read_u16, FixedHeader, DEFAULT_MAX_PACKET_SIZE};
use crate::buffer_pool::PoolBuf;
use crate::protocol::{
    ConnAck, Connect, DecodeError, Packet, PubAck, PubComp, PubRec, PubRel, Publish, QoS, SubAck,
    Subscribe, UnsubAck, Unsubscribe, Will,
};

/// MQTT Packet Decoder
pub struct Decoder {
    /// Maximum accepted remaining length
    max_packet_size: usize,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
        }
    }

    pub fn with_max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = size;
        self
    }

    /// Decode one packet from the front of `buf`.
    ///
    /// Returns `Ok(Some((packet, bytes_consumed)))` for a complete packet,
    /// `Ok(None)` when more bytes are needed.
    pub fn decode(&self, buf: &[u8]) -> Result<Option<(Packet, usize)>, DecodeError> {
        let (header, header_len) = match FixedHeader::decode(buf)? {
            Some(h) => h,
            None => return Ok(None),
        };

        if header.remaining_length as usize > self.max_packet_size {
            return Err(DecodeError::PacketTooLarge);
        }

        let total_len = header_len + header.remaining_length as usize;
        if buf.len() < total_len {
            return Ok(None);
        }

        let body = &buf[header_len..total_len];

        // Inside a fully buffered packet, running out of body bytes means
        // the declared remaining length lied, not that more data is coming
        let packet = match decode_body(&header, body) {
            Ok(packet) => packet,
            Err(DecodeError::InsufficientData) => {
                return Err(DecodeError::MalformedPacket(
                    "body shorter than declared remaining length",
                ))
            }
            Err(e) => return Err(e),
        };

        Ok(Some((packet, total_len)))
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

fn decode_body(header: &FixedHeader, body: &[u8]) -> Result<Packet, DecodeError> {
    match header.packet_type {
        1 => decode_connect(header, body),
        2 => decode_connack(header, body),
        3 => decode_publish(header, body),
        4 => Ok(Packet::PubAck(PubAck {
            message_id: decode_ack_body(header, body, 0)?,
        })),
        5 => Ok(Packet::PubRec(PubRec {
            message_id: decode_ack_body(header, body, 0)?,
        })),
        6 => Ok(Packet::PubRel(PubRel {
            message_id: decode_ack_body(header, body, 0x02)?,
        })),
        7 => Ok(Packet::PubComp(PubComp {
            message_id: decode_ack_body(header, body, 0)?,
        })),
        8 => decode_subscribe(header, body),
        9 => decode_suback(header, body),
        10 => decode_unsubscribe(header, body),
        11 => Ok(Packet::UnsubAck(UnsubAck {
            message_id: decode_ack_body(header, body, 0)?,
        })),
        12 => decode_empty(header, Packet::PingReq),
        13 => decode_empty(header, Packet::PingResp),
        14 => decode_empty(header, Packet::Disconnect),
        t => Err(DecodeError::UnknownPacketType(t)),
    }
}

/// PUBACK, PUBREC, PUBREL, PUBCOMP and UNSUBACK all carry exactly a
/// two-byte message identifier.
fn decode_ack_body(header: &FixedHeader, body: &[u8], flags: u8) -> Result<u16, DecodeError> {
    if header.flags() != flags {
        return Err(DecodeError::InvalidFlags);
    }
    if header.remaining_length != 2 {
        return Err(DecodeError::MalformedPacket("ack body must be 2 bytes"));
    }
    read_u16(body)
}

fn decode_empty(header: &FixedHeader, packet: Packet) -> Result<Packet, DecodeError> {
    if header.flags() != 0 {
        return Err(DecodeError::InvalidFlags);
    }
    if header.remaining_length != 0 {
        return Err(DecodeError::MalformedPacket("packet has no body"));
    }
    Ok(packet)
}

fn decode_connect(header: &FixedHeader, body: &[u8]) -> Result<Packet, DecodeError> {
    if header.flags() != 0 {
        return Err(DecodeError::InvalidFlags);
    }

    let mut pos = 0;

    let (protocol_name, len) = read_string(&body[pos..])?;
    let protocol_name = protocol_name.to_string();
    pos += len;

    if pos >= body.len() {
        return Err(DecodeError::InsufficientData);
    }
    let protocol_level = body[pos];
    pos += 1;

    if pos >= body.len() {
        return Err(DecodeError::InsufficientData);
    }
    let connect_flags = body[pos];
    pos += 1;

    // Reserved bit must be 0
    if connect_flags & 0x01 != 0 {
        return Err(DecodeError::InvalidFlags);
    }

    let clean_session = connect_flags & 0x02 != 0;
    let will_flag = connect_flags & 0x04 != 0;
    let will_qos = (connect_flags >> 3) & 0x03;
    let will_retain = connect_flags & 0x20 != 0;
    let password_flag = connect_flags & 0x40 != 0;
    let username_flag = connect_flags & 0x80 != 0;

    if !will_flag && (will_qos != 0 || will_retain) {
        return Err(DecodeError::InvalidFlags);
    }

    let keep_alive = read_u16(&body[pos..])?;
    pos += 2;

    let (client_id, len) = read_string(&body[pos..])?;
    let client_id = client_id.to_string();
    pos += len;

    let will = if will_flag {
        let (topic, len) = read_string(&body[pos..])?;
        let topic = topic.to_string();
        pos += len;
        let (payload, len) = read_binary(&body[pos..])?;
        let payload = Bytes::copy_from_slice(payload);
        pos += len;
        Some(Will {
            topic,
            payload,
            qos: QoS::from_u8(will_qos).ok_or(DecodeError::InvalidQoS(will_qos))?,
            retain: will_retain,
        })
    } else {
        None
    };

    let username = if username_flag {
        let (s, len) = read_string(&body[pos..])?;
        pos += len;
        Some(s.to_string())
    } else {
        None
    };

    let password = if password_flag {
        let (data, _) = read_binary(&body[pos..])?;
        Some(Bytes::copy_from_slice(data))
    } else {
        None
    };

    Ok(Packet::Connect(Box::new(Connect {
        protocol_name,
        protocol_level,
        client_id,
        clean_session,
        keep_alive,
        will,
        username,
        password,
    })))
}

fn decode_connack(header: &FixedHeader, body: &[u8]) -> Result<Packet, DecodeError> {
    if header.flags() != 0 {
        return Err(DecodeError::InvalidFlags);
    }
    if header.remaining_length != 2 {
        return Err(DecodeError::MalformedPacket("CONNACK body must be 2 bytes"));
    }

    // Only bit 0 of the acknowledge flags is meaningful
    if body[0] & 0xFE != 0 {
        return Err(DecodeError::InvalidFlags);
    }

    Ok(Packet::ConnAck(ConnAck {
        session_present: body[0] & 0x01 != 0,
        return_code: body[1],
    }))
}

fn decode_publish(header: &FixedHeader, body: &[u8]) -> Result<Packet, DecodeError> {
    let qos = QoS::from_u8(header.qos).ok_or(DecodeError::InvalidQoS(header.qos))?;

    // [MQTT-3.3.1-2] DUP must be 0 for QoS 0
    if qos == QoS::AtMostOnce && header.dup {
        return Err(DecodeError::MalformedPacket("DUP must be 0 for QoS 0"));
    }

    let mut pos = 0;

    let (topic_bytes, len) = read_binary(&body[pos..])?;
    let topic = PoolBuf::copy_from_slice(topic_bytes);
    pos += len;

    let message_id = if qos != QoS::AtMostOnce {
        let id = read_u16(&body[pos..])?;
        if id == 0 {
            return Err(DecodeError::MalformedPacket("message id cannot be 0"));
        }
        pos += 2;
        Some(id)
    } else {
        None
    };

    // Payload length is implicit: everything after topic and identifier
    let payload = PoolBuf::copy_from_slice(&body[pos..]);

    Ok(Packet::Publish(Publish {
        dup: header.dup,
        qos,
        retain: header.retain,
        topic,
        message_id,
        payload,
    }))
}

fn decode_subscribe(header: &FixedHeader, body: &[u8]) -> Result<Packet, DecodeError> {
    // SUBSCRIBE must have flags 0010
    if header.flags() != 0x02 {
        return Err(DecodeError::InvalidFlags);
    }

    let message_id = read_u16(body)?;
    let mut pos = 2;

    let mut topics = Vec::new();
    while pos < body.len() {
        let (filter, len) = read_string(&body[pos..])?;
        let filter = filter.to_string();
        pos += len;

        if pos >= body.len() {
            return Err(DecodeError::InsufficientData);
        }
        let qos_byte = body[pos];
        pos += 1;

        let qos = QoS::from_u8(qos_byte).ok_or(DecodeError::InvalidQoS(qos_byte))?;
        topics.push((filter, qos));
    }

    if topics.is_empty() {
        return Err(DecodeError::MalformedPacket(
            "SUBSCRIBE must carry at least one filter",
        ));
    }

    Ok(Packet::Subscribe(Subscribe { message_id, topics }))
}

fn decode_suback(header: &FixedHeader, body: &[u8]) -> Result<Packet, DecodeError> {
    if header.flags() != 0 {
        return Err(DecodeError::InvalidFlags);
    }
    if header.remaining_length < 3 {
        return Err(DecodeError::MalformedPacket(
            "SUBACK must carry at least one grant",
        ));
    }

    let message_id = read_u16(body)?;
    let granted_qos = body[2..].to_vec();

    for &code in &granted_qos {
        if code > 2 && code != crate::protocol::SUBACK_FAILURE {
            return Err(DecodeError::MalformedPacket("invalid SUBACK grant"));
        }
    }

    Ok(Packet::SubAck(SubAck {
        message_id,
        granted_qos,
    }))
}

fn decode_unsubscribe(header: &FixedHeader, body: &[u8]) -> Result<Packet, DecodeError> {
    // UNSUBSCRIBE must have flags 0010
    if header.flags() != 0x02 {
        return Err(DecodeError::InvalidFlags);
    }

    let message_id = read_u16(body)?;
    let mut pos = 2;

    let mut filters = Vec::new();
    while pos < body.len() {
        let (filter, len) = read_string(&body[pos..])?;
        filters.push(filter.to_string());
        pos += len;
    }

    if filters.is_empty() {
        return Err(DecodeError::MalformedPacket(
            "UNSUBSCRIBE must carry at least one filter",
        ));
    }

    Ok(Packet::Unsubscribe(Unsubscribe {
        message_id,
        filters,
    }))
}
