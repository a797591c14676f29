//! VibeMQ Client - MQTT v3.1.1 client session engine
//!
//! The core of an MQTT 3.1.1 client: a wire codec for the 14 control packet
//! types, a four-activity session engine (inbound reader, outbound writer,
//! protocol logic, keepalive) coordinated through bounded queues and a shared
//! stop signal, and a wildcard topic router that dispatches incoming PUBLISH
//! messages to user callbacks.
//!
//! Connection establishment (CONNECT/CONNACK negotiation) and reconnection
//! policy are left to the caller; the engine drives an already-negotiated
//! byte-stream transport.

pub mod buffer_pool;
pub mod codec;
pub mod ids;
pub mod message;
pub mod protocol;
pub mod router;
pub mod session;
pub mod token;
pub mod transport;

pub use message::{Message, MessageHandler};
pub use protocol::{ClientError, Packet, QoS};
pub use router::Router;
pub use session::{ConnectionLostHandler, Engine, Handle, Options};
pub use token::{DisconnectToken, PublishToken, SubscribeToken, Token, UnsubscribeToken};
pub use transport::open_connection;
