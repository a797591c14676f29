//! MQTT Packet Encoder
//!
//! Every encoder computes the remaining length from the body it is about to
//! write, then emits the fixed header followed by that body.

use bytes::{BufMut, BytesMut};

use super::{write_binary, write_string, FixedHeader};
use crate::protocol::{
    ConnAck, Connect, EncodeError, Packet, Publish, QoS, SubAck, Subscribe, Unsubscribe,
};

/// MQTT Packet Encoder
#[derive(Default)]
pub struct Encoder;

impl Encoder {
    pub fn new() -> Self {
        Self
    }

    /// Encode a packet to the buffer
    pub fn encode(&self, packet: &Packet, buf: &mut BytesMut) -> Result<(), EncodeError> {
        match packet {
            Packet::Connect(p) => encode_connect(p, buf),
            Packet::ConnAck(p) => encode_connack(p, buf),
            Packet::Publish(p) => encode_publish(p, buf),
            Packet::PubAck(p) => encode_ack(4, 0, p.message_id, buf),
            Packet::PubRec(p) => encode_ack(5, 0, p.message_id, buf),
            // PUBREL carries QoS 1 in its fixed header
            Packet::PubRel(p) => encode_ack(6, 1, p.message_id, buf),
            Packet::PubComp(p) => encode_ack(7, 0, p.message_id, buf),
            Packet::Subscribe(p) => encode_subscribe(p, buf),
            Packet::SubAck(p) => encode_suback(p, buf),
            Packet::Unsubscribe(p) => encode_unsubscribe(p, buf),
            Packet::UnsubAck(p) => encode_ack(11, 0, p.message_id, buf),
            Packet::PingReq => encode_empty(12, buf),
            Packet::PingResp => encode_empty(13, buf),
            Packet::Disconnect => encode_empty(14, buf),
        }
    }
}

fn header(packet_type: u8, qos: u8, remaining_length: usize) -> FixedHeader {
    FixedHeader {
        packet_type,
        dup: false,
        qos,
        retain: false,
        remaining_length: remaining_length as u32,
    }
}

fn encode_ack(
    packet_type: u8,
    qos: u8,
    message_id: u16,
    buf: &mut BytesMut,
) -> Result<(), EncodeError> {
    header(packet_type, qos, 2).encode(buf)?;
    buf.put_u16(message_id);
    Ok(())
}

fn encode_empty(packet_type: u8, buf: &mut BytesMut) -> Result<(), EncodeError> {
    header(packet_type, 0, 0).encode(buf)
}

fn encode_connect(packet: &Connect, buf: &mut BytesMut) -> Result<(), EncodeError> {
    let mut remaining_length = 2 + packet.protocol_name.len() // protocol name
        + 1 // protocol level
        + 1 // connect flags
        + 2 // keep alive
        + 2 + packet.client_id.len();

    if let Some(ref will) = packet.will {
        remaining_length += 2 + will.topic.len();
        remaining_length += 2 + will.payload.len();
    }
    if let Some(ref username) = packet.username {
        remaining_length += 2 + username.len();
    }
    if let Some(ref password) = packet.password {
        remaining_length += 2 + password.len();
    }

    header(1, 0, remaining_length).encode(buf)?;

    write_string(buf, &packet.protocol_name)?;
    buf.put_u8(packet.protocol_level);

    let mut connect_flags: u8 = 0;
    if packet.clean_session {
        connect_flags |= 0x02;
    }
    if let Some(ref will) = packet.will {
        connect_flags |= 0x04;
        connect_flags |= (will.qos as u8) << 3;
        if will.retain {
            connect_flags |= 0x20;
        }
    }
    if packet.password.is_some() {
        connect_flags |= 0x40;
    }
    if packet.username.is_some() {
        connect_flags |= 0x80;
    }
    buf.put_u8(connect_flags);

    buf.put_u16(packet.keep_alive);
    write_string(buf, &packet.client_id)?;

    if let Some(ref will) = packet.will {
        write_string(buf, &will.topic)?;
        write_binary(buf, &will.payload)?;
    }
    if let Some(ref username) = packet.username {
        write_string(buf, username)?;
    }
    if let Some(ref password) = packet.password {
        write_binary(buf, password)?;
    }

    Ok(())
}

fn encode_connack(packet: &ConnAck, buf: &mut BytesMut) -> Result<(), EncodeError> {
    header(2, 0, 2).encode(buf)?;
    buf.put_u8(packet.session_present as u8);
    buf.put_u8(packet.return_code);
    Ok(())
}

fn encode_publish(packet: &Publish, buf: &mut BytesMut) -> Result<(), EncodeError> {
    let mut remaining_length = 2 + packet.topic.len() + packet.payload.len();
    if packet.qos != QoS::AtMostOnce {
        remaining_length += 2;
    }

    let fh = FixedHeader {
        packet_type: 3,
        dup: packet.dup,
        qos: packet.qos as u8,
        retain: packet.retain,
        remaining_length: remaining_length as u32,
    };
    fh.encode(buf)?;

    write_binary(buf, &packet.topic)?;
    if packet.qos != QoS::AtMostOnce {
        buf.put_u16(packet.message_id.unwrap_or(0));
    }
    buf.put_slice(&packet.payload);

    Ok(())
}

fn encode_subscribe(packet: &Subscribe, buf: &mut BytesMut) -> Result<(), EncodeError> {
    let mut remaining_length = 2;
    for (filter, _) in &packet.topics {
        remaining_length += 2 + filter.len() + 1;
    }

    // SUBSCRIBE carries QoS 1 in its fixed header
    header(8, 1, remaining_length).encode(buf)?;

    buf.put_u16(packet.message_id);
    for (filter, qos) in &packet.topics {
        write_string(buf, filter)?;
        buf.put_u8(*qos as u8);
    }

    Ok(())
}

fn encode_suback(packet: &SubAck, buf: &mut BytesMut) -> Result<(), EncodeError> {
    header(9, 0, 2 + packet.granted_qos.len()).encode(buf)?;
    buf.put_u16(packet.message_id);
    buf.put_slice(&packet.granted_qos);
    Ok(())
}

fn encode_unsubscribe(packet: &Unsubscribe, buf: &mut BytesMut) -> Result<(), EncodeError> {
    let mut remaining_length = 2;
    for filter in &packet.filters {
        remaining_length += 2 + filter.len();
    }

    // UNSUBSCRIBE carries QoS 1 in its fixed header
    header(10, 1, remaining_length).encode(buf)?;

    buf.put_u16(packet.message_id);
    for filter in &packet.filters {
        write_string(buf, filter)?;
    }

    Ok(())
}
