//! Broker message types.

use std::collections::HashMap;

use bytes::Bytes;

use crate::types::{Destination, SendOptions};

/// The payload of a [`Message`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum MessageBody {
    /// No payload.
    #[default]
    Empty,
    /// A UTF-8 text payload.
    Text(String),
    /// An opaque binary payload.
    Bytes(Bytes),
}

impl MessageBody {
    /// Returns the body length in bytes.
    pub fn len(&self) -> usize {
        match self {
            Self::Empty => 0,
            Self::Text(text) => text.len(),
            Self::Bytes(bytes) => bytes.len(),
        }
    }

    /// Returns `true` if the body carries no data.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A message sent to or received from a broker destination.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    /// Broker-assigned id, set on delivery.
    pub message_id: Option<String>,

    /// The payload.
    pub body: MessageBody,

    /// An id used to correlate requests and replies.
    pub correlation_id: Option<String>,

    /// Where replies to this message should be sent.
    pub reply_to: Option<Destination>,

    /// Application-defined type tag.
    pub message_type: Option<String>,

    /// String properties, usable in selectors.
    pub properties: HashMap<String, String>,

    /// Delivery attributes the message was sent with, set on delivery.
    pub delivery: Option<SendOptions>,
}

impl Message {
    /// Creates a message with an empty body.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a text message.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            body: MessageBody::Text(text.into()),
            ..Self::default()
        }
    }

    /// Creates a binary message.
    pub fn bytes(bytes: impl Into<Bytes>) -> Self {
        Self {
            body: MessageBody::Bytes(bytes.into()),
            ..Self::default()
        }
    }

    /// Sets the correlation id.
    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Sets the reply-to destination.
    #[must_use]
    pub fn with_reply_to(mut self, reply_to: Destination) -> Self {
        self.reply_to = Some(reply_to);
        self
    }

    /// Sets the type tag.
    #[must_use]
    pub fn with_type(mut self, message_type: impl Into<String>) -> Self {
        self.message_type = Some(message_type.into());
        self
    }

    /// Sets a string property.
    #[must_use]
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Returns the body as text, if it is a text body.
    pub fn text_body(&self) -> Option<&str> {
        match &self.body {
            MessageBody::Text(text) => Some(text),
            _ => None,
        }
    }

    /// Returns the correlation id, if set.
    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    /// Returns a property value.
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }
}
