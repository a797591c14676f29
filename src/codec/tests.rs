//! MQTT Codec Tests
//!
//! Round-trip and wire-layout tests for all v3.1.1 packet types, based on
//! MQTT specification sections 2 and 3.

use bytes::{Bytes, BytesMut};
use pretty_assertions::assert_eq;

use crate::buffer_pool::PoolBuf;
use crate::codec::{read_variable_int, write_variable_int, Decoder, Encoder, FixedHeader};
use crate::protocol::{
    ConnAck, Connect, DecodeError, Packet, PubAck, PubComp, PubRec, PubRel, Publish, QoS, SubAck,
    Subscribe, UnsubAck, Unsubscribe, Will, SUBACK_FAILURE,
};

fn encode_packet(packet: &Packet) -> BytesMut {
    let encoder = Encoder::new();
    let mut buf = BytesMut::new();
    encoder.encode(packet, &mut buf).unwrap();
    buf
}

fn decode_packet(buf: &[u8]) -> Result<Packet, DecodeError> {
    let decoder = Decoder::new();
    match decoder.decode(buf)? {
        Some((packet, consumed)) => {
            assert_eq!(consumed, buf.len(), "decoder must consume whole packet");
            Ok(packet)
        }
        None => Err(DecodeError::InsufficientData),
    }
}

fn round_trip(packet: Packet) {
    let encoded = encode_packet(&packet);
    let decoded = decode_packet(&encoded).unwrap();
    assert_eq!(packet, decoded);
}

// ============================================================================
// Remaining-length varint (MQTT-2.2.3)
// ============================================================================

#[test]
fn test_variable_int_boundaries() {
    // Each boundary of the 1..4 byte encodings
    for (value, expect_len) in [
        (0u32, 1usize),
        (127, 1),
        (128, 2),
        (16_383, 2),
        (16_384, 3),
        (2_097_151, 3),
        (2_097_152, 4),
        (268_435_455, 4),
    ] {
        let mut buf = BytesMut::new();
        let written = write_variable_int(&mut buf, value).unwrap();
        assert_eq!(written, expect_len, "value {}", value);
        let (decoded, consumed) = read_variable_int(&buf).unwrap();
        assert_eq!(decoded, value);
        assert_eq!(consumed, expect_len);
    }
}

#[test]
fn test_variable_int_known_encoding() {
    let mut buf = BytesMut::new();
    write_variable_int(&mut buf, 321).unwrap();
    assert_eq!(&buf[..], &[0xC1, 0x02]);
}

#[test]
fn test_variable_int_unterminated() {
    // Continuation bit set on all four bytes
    let result = read_variable_int(&[0x80, 0x80, 0x80, 0x80, 0x01]);
    assert_eq!(result, Err(DecodeError::MalformedVarint));
}

#[test]
fn test_variable_int_too_large_to_encode() {
    let mut buf = BytesMut::new();
    assert!(write_variable_int(&mut buf, 268_435_456).is_err());
}

// ============================================================================
// Fixed header (MQTT-2.2)
// ============================================================================

#[test]
fn test_fixed_header_bit_layout() {
    // PUBLISH, dup=true, qos=2, retain=true packs to 0b0011_1101
    let fh = FixedHeader {
        packet_type: 3,
        dup: true,
        qos: 2,
        retain: true,
        remaining_length: 0,
    };
    let mut buf = BytesMut::new();
    fh.encode(&mut buf).unwrap();
    assert_eq!(buf[0], 0x3D);
}

#[test]
fn test_fixed_header_round_trip() {
    let fh = FixedHeader {
        packet_type: 8,
        dup: false,
        qos: 1,
        retain: false,
        remaining_length: 2_000_000,
    };
    let mut buf = BytesMut::new();
    fh.encode(&mut buf).unwrap();
    let (decoded, consumed) = FixedHeader::decode(&buf).unwrap().unwrap();
    assert_eq!(decoded, fh);
    assert_eq!(consumed, buf.len());
}

#[test]
fn test_fixed_header_rejects_type_zero_and_fifteen() {
    assert_eq!(
        FixedHeader::decode(&[0x00, 0x00]),
        Err(DecodeError::UnknownPacketType(0))
    );
    assert_eq!(
        FixedHeader::decode(&[0xF0, 0x00]),
        Err(DecodeError::UnknownPacketType(15))
    );
}

#[test]
fn test_fixed_header_incomplete_varint() {
    // Header not yet complete, not an error
    assert_eq!(FixedHeader::decode(&[0x30, 0x80]), Ok(None));
}

// ============================================================================
// CONNECT / CONNACK (MQTT-3.1, MQTT-3.2)
// ============================================================================

#[test]
fn test_connect_minimal() {
    round_trip(Packet::Connect(Box::new(Connect {
        client_id: "c1".to_string(),
        ..Default::default()
    })));
}

#[test]
fn test_connect_full() {
    round_trip(Packet::Connect(Box::new(Connect {
        protocol_name: "MQTT".to_string(),
        protocol_level: 4,
        client_id: "test-client-123".to_string(),
        clean_session: false,
        keep_alive: 300,
        will: Some(Will {
            topic: "last/will/topic".to_string(),
            payload: Bytes::from_static(b"goodbye"),
            qos: QoS::AtLeastOnce,
            retain: true,
        }),
        username: Some("user".to_string()),
        password: Some(Bytes::from_static(b"password")),
    })));
}

#[test]
fn test_connack() {
    for code in 0..=5u8 {
        round_trip(Packet::ConnAck(ConnAck {
            session_present: code == 0,
            return_code: code,
        }));
    }
}

#[test]
fn test_connack_wire_layout() {
    let encoded = encode_packet(&Packet::ConnAck(ConnAck {
        session_present: true,
        return_code: 4,
    }));
    assert_eq!(&encoded[..], &[0x20, 0x02, 0x01, 0x04]);
}

// ============================================================================
// PUBLISH (MQTT-3.3)
// ============================================================================

#[test]
fn test_publish_qos0() {
    round_trip(Packet::Publish(Publish {
        topic: PoolBuf::from("sensors/temp"),
        payload: PoolBuf::from("21.5"),
        ..Default::default()
    }));
}

#[test]
fn test_publish_qos1_with_id() {
    round_trip(Packet::Publish(Publish {
        dup: true,
        qos: QoS::AtLeastOnce,
        retain: true,
        topic: PoolBuf::from("a/b"),
        message_id: Some(42),
        payload: PoolBuf::from("x"),
    }));
}

#[test]
fn test_publish_qos2_empty_payload() {
    round_trip(Packet::Publish(Publish {
        qos: QoS::ExactlyOnce,
        topic: PoolBuf::from("a"),
        message_id: Some(65535),
        payload: PoolBuf::empty(),
        ..Default::default()
    }));
}

#[test]
fn test_publish_wire_layout() {
    // topic "a/b", qos 1, id 10, payload "hi"
    let encoded = encode_packet(&Packet::Publish(Publish {
        qos: QoS::AtLeastOnce,
        topic: PoolBuf::from("a/b"),
        message_id: Some(10),
        payload: PoolBuf::from("hi"),
        ..Default::default()
    }));
    assert_eq!(
        &encoded[..],
        &[0x32, 0x09, 0x00, 0x03, b'a', b'/', b'b', 0x00, 0x0A, b'h', b'i']
    );
}

#[test]
fn test_publish_payload_length_is_implicit() {
    // A large payload exercises the bypass path of the slice pool too
    let payload = vec![0xAB; 4096];
    let packet = Packet::Publish(Publish {
        qos: QoS::AtLeastOnce,
        topic: PoolBuf::from("big"),
        message_id: Some(7),
        payload: PoolBuf::copy_from_slice(&payload),
        ..Default::default()
    });
    let encoded = encode_packet(&packet);
    match decode_packet(&encoded).unwrap() {
        Packet::Publish(p) => assert_eq!(&p.payload[..], &payload[..]),
        other => panic!("expected PUBLISH, got {:?}", other),
    }
}

#[test]
fn test_publish_rejects_dup_on_qos0() {
    // 0x38: PUBLISH with dup set and qos 0
    let result = decode_packet(&[0x38, 0x05, 0x00, 0x01, b'a', b'h', b'i']);
    assert!(matches!(result, Err(DecodeError::MalformedPacket(_))));
}

#[test]
fn test_publish_rejects_zero_message_id() {
    let result = decode_packet(&[0x32, 0x05, 0x00, 0x01, b'a', 0x00, 0x00]);
    assert!(matches!(result, Err(DecodeError::MalformedPacket(_))));
}

// ============================================================================
// Acks (MQTT-3.4 through MQTT-3.7, MQTT-3.11)
// ============================================================================

#[test]
fn test_ack_round_trips() {
    round_trip(Packet::PubAck(PubAck { message_id: 1 }));
    round_trip(Packet::PubRec(PubRec { message_id: 2 }));
    round_trip(Packet::PubRel(PubRel { message_id: 3 }));
    round_trip(Packet::PubComp(PubComp { message_id: 4 }));
    round_trip(Packet::UnsubAck(UnsubAck { message_id: 5 }));
}

#[test]
fn test_pubrel_wire_qos_is_one() {
    let encoded = encode_packet(&Packet::PubRel(PubRel { message_id: 9 }));
    assert_eq!(&encoded[..], &[0x62, 0x02, 0x00, 0x09]);
}

#[test]
fn test_pubrel_rejects_wrong_flags() {
    assert_eq!(
        decode_packet(&[0x60, 0x02, 0x00, 0x09]),
        Err(DecodeError::InvalidFlags)
    );
}

#[test]
fn test_puback_rejects_wrong_length() {
    // PUBACK body is exactly 2 bytes
    let result = decode_packet(&[0x40, 0x03, 0x00, 0x01, 0x00]);
    assert!(matches!(result, Err(DecodeError::MalformedPacket(_))));
}

// ============================================================================
// SUBSCRIBE / SUBACK / UNSUBSCRIBE (MQTT-3.8 through MQTT-3.10)
// ============================================================================

#[test]
fn test_subscribe_round_trip() {
    round_trip(Packet::Subscribe(Subscribe {
        message_id: 5,
        topics: vec![
            ("a".to_string(), QoS::AtMostOnce),
            ("b/+".to_string(), QoS::AtLeastOnce),
            ("c/#".to_string(), QoS::ExactlyOnce),
        ],
    }));
}

#[test]
fn test_subscribe_wire_qos_is_one() {
    let encoded = encode_packet(&Packet::Subscribe(Subscribe {
        message_id: 1,
        topics: vec![("t".to_string(), QoS::AtMostOnce)],
    }));
    assert_eq!(encoded[0], 0x82);
}

#[test]
fn test_subscribe_rejects_empty() {
    // Valid header, message id, no filters
    assert!(matches!(
        decode_packet(&[0x82, 0x02, 0x00, 0x01]),
        Err(DecodeError::MalformedPacket(_))
    ));
}

#[test]
fn test_suback_round_trip_with_failure_grant() {
    round_trip(Packet::SubAck(SubAck {
        message_id: 5,
        granted_qos: vec![0, 1, SUBACK_FAILURE],
    }));
}

#[test]
fn test_suback_rejects_invalid_grant() {
    let result = decode_packet(&[0x90, 0x03, 0x00, 0x05, 0x03]);
    assert!(matches!(result, Err(DecodeError::MalformedPacket(_))));
}

#[test]
fn test_unsubscribe_round_trip() {
    round_trip(Packet::Unsubscribe(Unsubscribe {
        message_id: 77,
        filters: vec!["a/b".to_string(), "c/#".to_string()],
    }));
}

// ============================================================================
// PINGREQ / PINGRESP / DISCONNECT (MQTT-3.12 through MQTT-3.14)
// ============================================================================

#[test]
fn test_empty_packets() {
    round_trip(Packet::PingReq);
    round_trip(Packet::PingResp);
    round_trip(Packet::Disconnect);

    assert_eq!(&encode_packet(&Packet::PingReq)[..], &[0xC0, 0x00]);
    assert_eq!(&encode_packet(&Packet::PingResp)[..], &[0xD0, 0x00]);
    assert_eq!(&encode_packet(&Packet::Disconnect)[..], &[0xE0, 0x00]);
}

#[test]
fn test_empty_packet_rejects_body() {
    let result = decode_packet(&[0xD0, 0x01, 0x00]);
    assert!(matches!(result, Err(DecodeError::MalformedPacket(_))));
}

// ============================================================================
// Incremental decoding
// ============================================================================

#[test]
fn test_decode_incomplete_returns_none() {
    let decoder = Decoder::new();
    let full = encode_packet(&Packet::Publish(Publish {
        topic: PoolBuf::from("a/b"),
        payload: PoolBuf::from("payload"),
        ..Default::default()
    }));

    for cut in 0..full.len() {
        assert_eq!(
            decoder.decode(&full[..cut]).unwrap().map(|(_, n)| n),
            None,
            "prefix of {} bytes must be incomplete",
            cut
        );
    }
    assert!(decoder.decode(&full).unwrap().is_some());
}

#[test]
fn test_decode_leaves_trailing_bytes() {
    let decoder = Decoder::new();
    let mut buf = encode_packet(&Packet::PingResp);
    let first_len = buf.len();
    buf.extend_from_slice(&encode_packet(&Packet::PubAck(PubAck { message_id: 3 })));

    let (packet, consumed) = decoder.decode(&buf).unwrap().unwrap();
    assert_eq!(packet, Packet::PingResp);
    assert_eq!(consumed, first_len);

    let (packet, _) = decoder.decode(&buf[consumed..]).unwrap().unwrap();
    assert_eq!(packet, Packet::PubAck(PubAck { message_id: 3 }));
}

#[test]
fn test_decode_respects_max_packet_size() {
    let decoder = Decoder::new().with_max_packet_size(16);
    let packet = Packet::Publish(Publish {
        topic: PoolBuf::from("t"),
        payload: PoolBuf::copy_from_slice(&[0u8; 64]),
        ..Default::default()
    });
    let encoded = encode_packet(&packet);
    assert_eq!(decoder.decode(&encoded), Err(DecodeError::PacketTooLarge));
}
