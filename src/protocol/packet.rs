//! MQTT Packet Definitions
//!
//! One tagged variant per v3.1.1 control packet type. Topic names and
//! payloads are pool-backed byte slices; the packet owns them and they
//! return to the pool when the packet is dropped.

use bytes::Bytes;

use super::QoS;
use crate::buffer_pool::PoolBuf;

/// MQTT Control Packet
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(clippy::large_enum_variant)]
pub enum Packet {
    Connect(Box<Connect>),
    ConnAck(ConnAck),
    Publish(Publish),
    PubAck(PubAck),
    PubRec(PubRec),
    PubRel(PubRel),
    PubComp(PubComp),
    Subscribe(Subscribe),
    SubAck(SubAck),
    Unsubscribe(Unsubscribe),
    UnsubAck(UnsubAck),
    PingReq,
    PingResp,
    Disconnect,
}

impl Packet {
    /// Get packet type as u8 (wire values 1 through 14)
    pub fn packet_type(&self) -> u8 {
        match self {
            Packet::Connect(_) => 1,
            Packet::ConnAck(_) => 2,
            Packet::Publish(_) => 3,
            Packet::PubAck(_) => 4,
            Packet::PubRec(_) => 5,
            Packet::PubRel(_) => 6,
            Packet::PubComp(_) => 7,
            Packet::Subscribe(_) => 8,
            Packet::SubAck(_) => 9,
            Packet::Unsubscribe(_) => 10,
            Packet::UnsubAck(_) => 11,
            Packet::PingReq => 12,
            Packet::PingResp => 13,
            Packet::Disconnect => 14,
        }
    }

    /// QoS and message identifier of this packet, zero where absent
    pub fn details(&self) -> Details {
        match self {
            Packet::Publish(p) => Details {
                qos: p.qos as u8,
                message_id: p.message_id.unwrap_or(0),
            },
            Packet::PubAck(p) => Details::with_id(p.message_id),
            Packet::PubRec(p) => Details::with_id(p.message_id),
            Packet::PubRel(p) => Details {
                qos: 1,
                message_id: p.message_id,
            },
            Packet::PubComp(p) => Details::with_id(p.message_id),
            Packet::Subscribe(p) => Details {
                qos: 1,
                message_id: p.message_id,
            },
            Packet::SubAck(p) => Details::with_id(p.message_id),
            Packet::Unsubscribe(p) => Details {
                qos: 1,
                message_id: p.message_id,
            },
            Packet::UnsubAck(p) => Details::with_id(p.message_id),
            _ => Details::default(),
        }
    }
}

/// QoS and message identifier extracted from a packet
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Details {
    pub qos: u8,
    pub message_id: u16,
}

impl Details {
    fn with_id(message_id: u16) -> Self {
        Self { qos: 0, message_id }
    }
}

/// CONNECT packet (client -> server)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    /// Protocol name, "MQTT" for v3.1.1
    pub protocol_name: String,
    /// Protocol level, 4 for v3.1.1
    pub protocol_level: u8,
    /// Client identifier
    pub client_id: String,
    /// Clean session flag
    pub clean_session: bool,
    /// Keep alive interval in seconds
    pub keep_alive: u16,
    /// Will message (optional)
    pub will: Option<Will>,
    /// Username (optional)
    pub username: Option<String>,
    /// Password (optional)
    pub password: Option<Bytes>,
}

impl Default for Connect {
    fn default() -> Self {
        Self {
            protocol_name: "MQTT".to_string(),
            protocol_level: 4,
            client_id: String::new(),
            clean_session: true,
            keep_alive: 60,
            will: None,
            username: None,
            password: None,
        }
    }
}

/// Will message configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Will {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

/// CONNACK packet (server -> client)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnAck {
    /// Session present flag
    pub session_present: bool,
    /// Return code, 0 accepted, 1 through 5 refused
    pub return_code: u8,
}

/// PUBLISH packet (bidirectional)
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Publish {
    /// Duplicate delivery flag
    pub dup: bool,
    /// Quality of service
    pub qos: QoS,
    /// Retain flag
    pub retain: bool,
    /// Topic name bytes (pooled)
    pub topic: PoolBuf,
    /// Message identifier, present only for QoS > 0
    pub message_id: Option<u16>,
    /// Payload bytes (pooled)
    pub payload: PoolBuf,
}

/// PUBACK packet (QoS 1 terminal ack)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PubAck {
    pub message_id: u16,
}

/// PUBREC packet (QoS 2 step 1)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PubRec {
    pub message_id: u16,
}

/// PUBREL packet (QoS 2 step 2, wire QoS 1)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PubRel {
    pub message_id: u16,
}

/// PUBCOMP packet (QoS 2 terminal ack)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PubComp {
    pub message_id: u16,
}

/// SUBSCRIBE packet (client -> server, wire QoS 1)
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Subscribe {
    /// Message identifier, stamped by the outbound writer
    pub message_id: u16,
    /// Topic filters with their requested QoS, in request order
    pub topics: Vec<(String, QoS)>,
}

/// SUBACK packet (server -> client)
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SubAck {
    pub message_id: u16,
    /// One grant per requested filter, in order; 0, 1, 2 or 0x80 for failure
    pub granted_qos: Vec<u8>,
}

/// UNSUBSCRIBE packet (client -> server, wire QoS 1)
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Unsubscribe {
    pub message_id: u16,
    pub filters: Vec<String>,
}

/// UNSUBACK packet (server -> client)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnsubAck {
    pub message_id: u16,
}
