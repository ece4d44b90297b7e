//! Core broker client types.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How messages consumed through a session are acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcknowledgementMode {
    /// Messages are acknowledged as soon as they are delivered.
    #[default]
    AutoAcknowledge,
    /// The application acknowledges messages explicitly.
    ClientAcknowledge,
    /// Lazy acknowledgement, duplicates are tolerated.
    DupsOkAcknowledge,
    /// Acknowledgement happens on transaction commit.
    Transactional,
    /// Each message is acknowledged individually.
    IndividualAcknowledge,
}

impl fmt::Display for AcknowledgementMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AutoAcknowledge => write!(f, "auto_acknowledge"),
            Self::ClientAcknowledge => write!(f, "client_acknowledge"),
            Self::DupsOkAcknowledge => write!(f, "dups_ok_acknowledge"),
            Self::Transactional => write!(f, "transactional"),
            Self::IndividualAcknowledge => write!(f, "individual_acknowledge"),
        }
    }
}

/// Whether a sent message survives a broker restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    /// The broker stores the message durably.
    #[default]
    Persistent,
    /// The message may be lost if the broker fails.
    NonPersistent,
}

/// Per-send delivery attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendOptions {
    /// Delivery mode for the message.
    pub delivery_mode: DeliveryMode,
    /// Priority from 0 (lowest) to 9 (highest).
    pub priority: u8,
    /// How long the message stays deliverable, `None` for forever.
    pub time_to_live: Option<Duration>,
}

impl SendOptions {
    /// Highest priority a broker accepts.
    pub const MAX_PRIORITY: u8 = 9;
    /// Priority used when none is given.
    pub const DEFAULT_PRIORITY: u8 = 4;

    /// Creates options with the broker defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Options for a non-persistent message.
    #[must_use]
    pub fn non_persistent() -> Self {
        Self::default().with_delivery_mode(DeliveryMode::NonPersistent)
    }

    /// Sets the delivery mode.
    #[must_use]
    pub fn with_delivery_mode(mut self, delivery_mode: DeliveryMode) -> Self {
        self.delivery_mode = delivery_mode;
        self
    }

    /// Sets the priority, clamped to [`Self::MAX_PRIORITY`].
    #[must_use]
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority.min(Self::MAX_PRIORITY);
        self
    }

    /// Sets the time-to-live.
    #[must_use]
    pub fn with_time_to_live(mut self, time_to_live: Duration) -> Self {
        self.time_to_live = Some(time_to_live);
        self
    }
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            delivery_mode: DeliveryMode::Persistent,
            priority: Self::DEFAULT_PRIORITY,
            time_to_live: None,
        }
    }
}

/// The kind of a [`Destination`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DestinationKind {
    /// Point-to-point queue, each message goes to one consumer.
    Queue,
    /// Publish-subscribe topic, each message goes to every subscriber.
    Topic,
    /// Connection-scoped queue created on demand, typically used for replies.
    TemporaryQueue,
}

/// A named queue or topic on the broker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Destination {
    kind: DestinationKind,
    name: String,
}

impl Destination {
    /// Creates a destination of the given kind.
    pub fn new(kind: DestinationKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }

    /// A queue destination.
    pub fn queue(name: impl Into<String>) -> Self {
        Self::new(DestinationKind::Queue, name)
    }

    /// A topic destination.
    pub fn topic(name: impl Into<String>) -> Self {
        Self::new(DestinationKind::Topic, name)
    }

    /// A temporary queue destination. Only broker clients create these.
    pub fn temporary(name: impl Into<String>) -> Self {
        Self::new(DestinationKind::TemporaryQueue, name)
    }

    /// The destination kind.
    pub fn kind(&self) -> DestinationKind {
        self.kind
    }

    /// The destination name without the kind prefix.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns `true` for temporary queues.
    pub fn is_temporary(&self) -> bool {
        self.kind == DestinationKind::TemporaryQueue
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            DestinationKind::Queue => write!(f, "queue://{}", self.name),
            DestinationKind::Topic => write!(f, "topic://{}", self.name),
            DestinationKind::TemporaryQueue => write!(f, "temp-queue://{}", self.name),
        }
    }
}

/// Username and password presented when connecting.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    /// The user name.
    pub username: String,
    /// The password.
    pub password: String,
}

impl Credentials {
    /// Creates a credential pair.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}
