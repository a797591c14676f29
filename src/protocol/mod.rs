//! MQTT v3.1.1 protocol types
//!
//! Packet definitions, quality-of-service levels, CONNACK return codes and
//! the error types surfaced by the codec and the session engine.

mod error;
mod packet;

pub use error::{ClientError, DecodeError, EncodeError};
pub use packet::{
    ConnAck, Connect, Details, Packet, PubAck, PubComp, PubRec, PubRel, Publish, SubAck, Subscribe,
    UnsubAck, Unsubscribe, Will,
};

/// Quality of service levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
pub enum QoS {
    /// At most once delivery (fire and forget)
    #[default]
    AtMostOnce = 0,
    /// At least once delivery (acknowledged)
    AtLeastOnce = 1,
    /// Exactly once delivery (assured)
    ExactlyOnce = 2,
}

impl QoS {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(QoS::AtMostOnce),
            1 => Some(QoS::AtLeastOnce),
            2 => Some(QoS::ExactlyOnce),
            _ => None,
        }
    }
}

/// SUBACK grant byte indicating the broker rejected the subscription
pub const SUBACK_FAILURE: u8 = 0x80;

/// CONNACK return codes (v3.1.1, table 3.1)
pub const CONNACK_ACCEPTED: u8 = 0x00;
pub const CONNACK_REFUSED_PROTOCOL_VERSION: u8 = 0x01;
pub const CONNACK_REFUSED_ID_REJECTED: u8 = 0x02;
pub const CONNACK_REFUSED_SERVER_UNAVAILABLE: u8 = 0x03;
pub const CONNACK_REFUSED_BAD_CREDENTIALS: u8 = 0x04;
pub const CONNACK_REFUSED_NOT_AUTHORIZED: u8 = 0x05;

/// Map a CONNACK return code to the error a CONNECT collaborator should
/// propagate. `None` means the connection was accepted.
pub fn connack_error(code: u8) -> Option<ClientError> {
    match code {
        CONNACK_ACCEPTED => None,
        _ => Some(ClientError::ConnectRefused(code)),
    }
}

/// Human-readable description of a CONNACK return code
pub fn connack_return_code_description(code: u8) -> &'static str {
    match code {
        CONNACK_ACCEPTED => "connection accepted",
        CONNACK_REFUSED_PROTOCOL_VERSION => "unacceptable protocol version",
        CONNACK_REFUSED_ID_REJECTED => "identifier rejected",
        CONNACK_REFUSED_SERVER_UNAVAILABLE => "server unavailable",
        CONNACK_REFUSED_BAD_CREDENTIALS => "bad user name or password",
        CONNACK_REFUSED_NOT_AUTHORIZED => "not authorized",
        _ => "unknown return code",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer_pool::PoolBuf;

    #[test]
    fn test_qos_from_u8() {
        assert_eq!(QoS::from_u8(0), Some(QoS::AtMostOnce));
        assert_eq!(QoS::from_u8(1), Some(QoS::AtLeastOnce));
        assert_eq!(QoS::from_u8(2), Some(QoS::ExactlyOnce));
        assert_eq!(QoS::from_u8(3), None);
    }

    #[test]
    fn test_connack_error_mapping() {
        assert!(connack_error(CONNACK_ACCEPTED).is_none());
        for code in 1..=5u8 {
            assert!(matches!(
                connack_error(code),
                Some(ClientError::ConnectRefused(c)) if c == code
            ));
        }
    }

    #[test]
    fn test_packet_details() {
        let publish = Packet::Publish(Publish {
            qos: QoS::AtLeastOnce,
            topic: PoolBuf::from("t"),
            message_id: Some(9),
            ..Default::default()
        });
        assert_eq!(publish.details(), Details { qos: 1, message_id: 9 });
        assert_eq!(publish.packet_type(), 3);

        // PUBREL carries QoS 1 per its wire header
        let pubrel = Packet::PubRel(PubRel { message_id: 4 });
        assert_eq!(pubrel.details(), Details { qos: 1, message_id: 4 });

        assert_eq!(Packet::PingReq.details(), Details::default());
        assert_eq!(Packet::Disconnect.packet_type(), 14);
    }
}
