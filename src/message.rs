//! Message view handed to subscription callbacks
//!
//! Wraps a routed PUBLISH packet. Cloning shares the underlying packet, so
//! concurrent dispatch hands the same buffers to every callback; the
//! pooled buffers return to the pool when the last clone drops.

use std::borrow::Cow;
use std::sync::Arc;

use crate::protocol::{Publish, QoS};
use crate::session::Handle;

/// Callback invoked for PUBLISH messages matching a route
pub type MessageHandler = Arc<dyn Fn(&Handle, Message) + Send + Sync>;

/// An incoming PUBLISH as seen by a subscription callback
#[derive(Clone)]
pub struct Message {
    publish: Arc<Publish>,
}

impl Message {
    pub(crate) fn new(publish: Arc<Publish>) -> Self {
        Self { publish }
    }

    /// Topic the message was published on
    pub fn topic(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.publish.topic)
    }

    /// Raw topic bytes
    pub fn topic_bytes(&self) -> &[u8] {
        &self.publish.topic
    }

    /// Message payload
    pub fn payload(&self) -> &[u8] {
        &self.publish.payload
    }

    pub fn qos(&self) -> QoS {
        self.publish.qos
    }

    pub fn retained(&self) -> bool {
        self.publish.retain
    }

    pub fn duplicate(&self) -> bool {
        self.publish.dup
    }

    /// Message identifier, 0 for QoS 0 messages
    pub fn message_id(&self) -> u16 {
        self.publish.message_id.unwrap_or(0)
    }
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("topic", &self.topic())
            .field("qos", &self.qos())
            .field("retained", &self.retained())
            .field("message_id", &self.message_id())
            .field("payload_len", &self.payload().len())
            .finish()
    }
}
