//! Core broker client traits.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::BrokerResult;
use crate::message::Message;
use crate::signal::ConnectionSignal;
use crate::types::{AcknowledgementMode, Credentials, Destination, SendOptions};

/// Callback invoked for every message delivered to a consumer.
///
/// Broker clients call it from their own delivery context, so it must not
/// block for long.
pub type MessageListener = Arc<dyn Fn(Message) + Send + Sync>;

/// Opens connections to a broker.
#[async_trait]
pub trait BrokerConnector: Send + Sync + fmt::Debug {
    /// Opens a new, not yet started, connection to `uri`.
    async fn connect(
        &self,
        uri: &str,
        credentials: Option<&Credentials>,
    ) -> BrokerResult<Arc<dyn BrokerConnection>>;
}

/// A live connection to a broker.
#[async_trait]
pub trait BrokerConnection: Send + Sync + fmt::Debug {
    /// Starts message delivery on the connection.
    async fn start(&self) -> BrokerResult<()>;

    /// Pauses message delivery without closing.
    async fn stop(&self) -> BrokerResult<()>;

    /// Closes the connection and everything created from it.
    async fn close(&self) -> BrokerResult<()>;

    /// Returns `true` once [`start`](Self::start) has completed.
    fn is_started(&self) -> bool;

    /// Creates a session with the given acknowledgement mode.
    async fn create_session(
        &self,
        mode: AcknowledgementMode,
    ) -> BrokerResult<Arc<dyn BrokerSession>>;

    /// Subscribes to interruption, resumption and exception signals.
    fn subscribe(&self) -> broadcast::Receiver<ConnectionSignal>;
}

/// A single-threaded context for producing and consuming messages.
#[async_trait]
pub trait BrokerSession: Send + Sync + fmt::Debug {
    /// The acknowledgement mode the session was created with.
    fn acknowledgement_mode(&self) -> AcknowledgementMode;

    /// Creates a producer, optionally bound to a default destination.
    async fn create_producer(
        &self,
        destination: Option<&Destination>,
    ) -> BrokerResult<Arc<dyn BrokerProducer>>;

    /// Creates a consumer delivering to `listener`, filtered by an optional selector.
    async fn create_consumer(
        &self,
        destination: &Destination,
        selector: Option<&str>,
        listener: MessageListener,
    ) -> BrokerResult<Arc<dyn BrokerConsumer>>;

    /// Creates a temporary queue that lives as long as the connection.
    async fn create_temporary_queue(&self) -> BrokerResult<Destination>;

    /// Deletes a temporary queue created by this session.
    async fn delete_temporary_queue(&self, destination: &Destination) -> BrokerResult<()>;

    /// Closes the session and its producers and consumers.
    async fn close(&self) -> BrokerResult<()>;
}

/// Sends messages.
#[async_trait]
pub trait BrokerProducer: Send + Sync + fmt::Debug {
    /// Sends `message` to `destination`, or to the producer's default
    /// destination when `None`.
    async fn send(
        &self,
        destination: Option<&Destination>,
        message: Message,
        options: &SendOptions,
    ) -> BrokerResult<()>;

    /// Closes the producer.
    async fn close(&self) -> BrokerResult<()>;
}

/// Receives messages through the listener it was created with.
#[async_trait]
pub trait BrokerConsumer: Send + Sync + fmt::Debug {
    /// Stops delivery and closes the consumer.
    async fn close(&self) -> BrokerResult<()>;
}
