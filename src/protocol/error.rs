//! Protocol and session error types

use std::fmt;
use std::sync::Arc;

/// Errors that can occur during packet decoding
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Not enough data in buffer
    InsufficientData,
    /// Message type outside `[1, 14]`
    UnknownPacketType(u8),
    /// Remaining-length varint did not terminate within 4 bytes
    MalformedVarint,
    /// Invalid QoS value
    InvalidQoS(u8),
    /// Invalid fixed-header flags for the packet type
    InvalidFlags,
    /// Invalid UTF-8 string
    InvalidUtf8,
    /// Body disagrees with the packet type's layout
    MalformedPacket(&'static str),
    /// Remaining length exceeds the configured maximum
    PacketTooLarge,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InsufficientData => write!(f, "insufficient data in buffer"),
            Self::UnknownPacketType(t) => write!(f, "unknown packet type: {}", t),
            Self::MalformedVarint => write!(f, "malformed remaining-length varint"),
            Self::InvalidQoS(q) => write!(f, "invalid QoS value: {}", q),
            Self::InvalidFlags => write!(f, "invalid packet flags"),
            Self::InvalidUtf8 => write!(f, "invalid UTF-8 string"),
            Self::MalformedPacket(msg) => write!(f, "malformed packet: {}", msg),
            Self::PacketTooLarge => write!(f, "packet too large"),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Errors that can occur during packet encoding
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    /// Remaining length exceeds the protocol maximum
    PacketTooLarge,
    /// String or binary field exceeds 65535 bytes
    StringTooLong,
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PacketTooLarge => write!(f, "packet too large"),
            Self::StringTooLong => write!(f, "string too long"),
        }
    }
}

impl std::error::Error for EncodeError {}

/// Errors surfaced by the session engine and transport dialer.
///
/// Cloneable so a single failure can be handed to every waiting token;
/// transport causes are shared through an `Arc`.
#[derive(Debug, Clone)]
pub enum ClientError {
    /// Read or write failure on the connection; terminal for the session
    Transport(Arc<std::io::Error>),
    /// Decoder rejection; terminal for the session
    Decode(DecodeError),
    /// Encoder rejection for an outgoing packet
    Encode(EncodeError),
    /// No PINGRESP within the ping timeout of a PINGREQ
    KeepaliveTimeout,
    /// CONNACK carried a non-zero return code
    ConnectRefused(u8),
    /// The 16-bit identifier space is exhausted
    NoIdsAvailable,
    /// Unsupported transport URI scheme
    UnknownProtocol(String),
    /// Peer violated the protocol in a way the engine cannot recover from
    Protocol(&'static str),
    /// The engine has stopped; no further operations are admitted
    Stopped,
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(e) => write!(f, "transport error: {}", e),
            Self::Decode(e) => write!(f, "decode error: {}", e),
            Self::Encode(e) => write!(f, "encode error: {}", e),
            Self::KeepaliveTimeout => write!(f, "pingresp not received, disconnecting"),
            Self::ConnectRefused(code) => write!(
                f,
                "connection refused: {}",
                super::connack_return_code_description(*code)
            ),
            Self::NoIdsAvailable => write!(f, "no message identifiers available"),
            Self::UnknownProtocol(scheme) => write!(f, "unknown protocol: {}", scheme),
            Self::Protocol(msg) => write!(f, "protocol violation: {}", msg),
            Self::Stopped => write!(f, "session engine stopped"),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<std::io::Error> for ClientError {
    fn from(e: std::io::Error) -> Self {
        ClientError::Transport(Arc::new(e))
    }
}

impl From<DecodeError> for ClientError {
    fn from(e: DecodeError) -> Self {
        ClientError::Decode(e)
    }
}

impl From<EncodeError> for ClientError {
    fn from(e: EncodeError) -> Self {
        ClientError::Encode(e)
    }
}
