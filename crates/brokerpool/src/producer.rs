//! Producers that survive connection loss.
//!
//! A [`ReconnectingProducer`] holds one session and one broker producer on
//! the connection it is bound to. When that connection is interrupted the
//! producer drops both and binds again, either to the same connection once it
//! resumes or, when created against a pool, to another live connection.
//! Sends made in between wait for the new binding up to
//! [`ProducerOptions::ready_timeout`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use brokerpool_traits::{
    BrokerConsumer, BrokerError, BrokerProducer, Destination, Message, MessageListener,
    SendOptions,
};
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::binding::{Binder, Binding, BindingFactory, BindingState};
use crate::connection::PooledConnection;
use crate::correlator::RequestReplyCorrelator;
use crate::error::{PoolError, PoolResult};
use crate::session::Session;
use crate::settings::PoolSettings;
use crate::source::ConnectionSource;

/// Per-producer defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct ProducerOptions {
    /// Options used by `send`, `send_to` and `request`.
    pub send_options: SendOptions,
    /// How long a send waits for the producer to (re)bind.
    pub ready_timeout: Duration,
}

impl Default for ProducerOptions {
    fn default() -> Self {
        Self {
            send_options: SendOptions::default(),
            ready_timeout: Duration::from_secs(10),
        }
    }
}

impl ProducerOptions {
    /// Takes the readiness timeout from pool settings.
    pub fn from_settings(settings: &PoolSettings) -> Self {
        Self {
            ready_timeout: settings.producer_ready_timeout,
            ..Self::default()
        }
    }

    /// Sets the default send options.
    #[must_use]
    pub fn with_send_options(mut self, send_options: SendOptions) -> Self {
        self.send_options = send_options;
        self
    }

    /// Sets how long sends wait for a binding.
    #[must_use]
    pub fn with_ready_timeout(mut self, ready_timeout: Duration) -> Self {
        self.ready_timeout = ready_timeout;
        self
    }
}

struct ReplyChannel {
    destination: Destination,
    consumer: Arc<dyn BrokerConsumer>,
}

pub(crate) struct ProducerBinding {
    connection: Arc<PooledConnection>,
    session: Arc<Session>,
    producer: Arc<dyn BrokerProducer>,
    correlator: Arc<RequestReplyCorrelator>,
    replies: OnceCell<ReplyChannel>,
}

impl ProducerBinding {
    /// The temporary queue replies arrive on, created on first use.
    async fn reply_destination(&self) -> PoolResult<Destination> {
        let channel = self
            .replies
            .get_or_try_init(|| async {
                let destination = self.session.temporary_queue().await?;
                let correlator = Arc::clone(&self.correlator);
                let listener: MessageListener = Arc::new(move |reply: Message| {
                    correlator.dispatch(reply);
                });
                let consumer = self
                    .session
                    .create_consumer(&destination, None, listener)
                    .await?;
                trace!(session_id = self.session.id(), %destination, "Reply consumer ready");
                Ok::<_, PoolError>(ReplyChannel {
                    destination,
                    consumer,
                })
            })
            .await?;
        Ok(channel.destination.clone())
    }
}

#[async_trait]
impl Binding for ProducerBinding {
    fn connection(&self) -> &Arc<PooledConnection> {
        &self.connection
    }

    async fn release(&self, discard: bool) {
        if let Some(replies) = self.replies.get() {
            if let Err(e) = replies.consumer.close().await {
                debug!(error = %e, "Failed to close reply consumer");
            }
        }
        if let Err(e) = self.producer.close().await {
            debug!(session_id = self.session.id(), error = %e, "Failed to close producer");
        }
        let session = Arc::clone(&self.session);
        let released = if discard {
            self.connection.discard_session(session).await
        } else {
            self.connection.release_session(session).await
        };
        if let Err(e) = released {
            debug!(connection_id = self.connection.id(), error = %e, "Failed to release producer session");
        }
    }
}

struct ProducerFactory {
    destination: Option<Destination>,
    correlator: Arc<RequestReplyCorrelator>,
}

#[async_trait]
impl BindingFactory for ProducerFactory {
    type Binding = ProducerBinding;

    async fn bind(&self, connection: Arc<PooledConnection>) -> PoolResult<ProducerBinding> {
        let session = connection
            .create_session(connection.acknowledgement_mode())
            .await?;
        let producer = match session.create_producer(self.destination.as_ref()).await {
            Ok(producer) => producer,
            Err(e) => {
                if let Err(discard_error) = connection.discard_session(session).await {
                    debug!(error = %discard_error, "Failed to discard session");
                }
                return Err(e);
            }
        };
        let binding = ProducerBinding {
            connection,
            session,
            producer,
            correlator: Arc::clone(&self.correlator),
            replies: OnceCell::new(),
        };
        if self.correlator.is_active() {
            if let Err(e) = binding.reply_destination().await {
                binding.release(true).await;
                return Err(e);
            }
        }
        Ok(binding)
    }
}

/// A producer that rebinds itself after connection loss and supports
/// request-reply over a temporary queue.
///
/// Where it rebinds depends on its source. A producer created from a
/// [`ConnectionPool`](crate::ConnectionPool) does not wait for the lost
/// connection: it binds to whatever
/// [`get_connection`](crate::ConnectionPool::get_connection) hands out next,
/// or to the first connection the pool reports as resumed or available. A
/// producer created from a single [`PooledConnection`](crate::PooledConnection)
/// waits for that connection to resume, and stays unbound for good once it is
/// destroyed.
///
/// # Examples
///
/// ```rust,no_run
/// # use std::time::Duration;
/// # use brokerpool::{ConnectionPool, ProducerOptions, ReconnectingProducer};
/// # use brokerpool_traits::{Destination, Message};
/// # async fn run(pool: ConnectionPool) -> brokerpool::PoolResult<()> {
/// let producer = ReconnectingProducer::new(
///     &pool,
///     Some(Destination::queue("orders")),
///     ProducerOptions::from_settings(pool.settings()),
/// )
/// .await;
///
/// producer.send(Message::text("created")).await?;
/// let reply = producer
///     .request(Message::text("status?"), Duration::from_secs(5))
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct ReconnectingProducer {
    binder: Arc<Binder<ProducerFactory>>,
    destination: Option<Destination>,
    correlator: Arc<RequestReplyCorrelator>,
    options: ProducerOptions,
    task: JoinHandle<()>,
}

impl ReconnectingProducer {
    /// Creates a producer and binds it if the source has a connection.
    ///
    /// Never fails: without a connection the producer starts uninitialized
    /// and binds as soon as one becomes available.
    pub async fn new(
        source: impl Into<ConnectionSource>,
        destination: Option<Destination>,
        options: ProducerOptions,
    ) -> Self {
        let correlator = Arc::new(RequestReplyCorrelator::new());
        let factory = ProducerFactory {
            destination: destination.clone(),
            correlator: Arc::clone(&correlator),
        };
        let (binder, task) = Binder::start("producer", factory, source.into()).await;
        debug!(producer_id = binder.id(), destination = ?destination, "Producer created");
        Self {
            binder,
            destination,
            correlator,
            options,
            task,
        }
    }

    /// Process-unique producer id.
    pub fn id(&self) -> u64 {
        self.binder.id()
    }

    /// The default destination, if any.
    pub fn destination(&self) -> Option<&Destination> {
        self.destination.as_ref()
    }

    /// The producer's options.
    pub fn options(&self) -> &ProducerOptions {
        &self.options
    }

    /// Current binding state.
    pub fn state(&self) -> BindingState {
        self.binder.state()
    }

    /// Returns `true` while bound to a connection.
    pub fn is_ready(&self) -> bool {
        self.state() == BindingState::Initialized
    }

    /// Id of the connection currently bound to.
    pub fn connection_id(&self) -> Option<u64> {
        self.binder.connection_id()
    }

    /// Waits up to `timeout` for the producer to be bound.
    pub async fn wait_ready(&self, timeout: Duration) -> PoolResult<()> {
        self.binder.wait_ready(timeout).await.map(|_| ())
    }

    /// The correlator used by [`request`](Self::request).
    pub fn correlator(&self) -> &RequestReplyCorrelator {
        &self.correlator
    }

    /// Sends to the default destination with the default options.
    pub async fn send(&self, message: Message) -> PoolResult<()> {
        self.send_with(None, message, &self.options.send_options)
            .await
    }

    /// Sends to `destination` with the default options.
    pub async fn send_to(&self, destination: &Destination, message: Message) -> PoolResult<()> {
        self.send_with(Some(destination), message, &self.options.send_options)
            .await
    }

    /// Sends with explicit options. `None` means the default destination.
    pub async fn send_with(
        &self,
        destination: Option<&Destination>,
        message: Message,
        options: &SendOptions,
    ) -> PoolResult<()> {
        self.ensure_destination(destination)?;
        let binding = self.binder.wait_ready(self.options.ready_timeout).await?;
        binding.producer.send(destination, message, options).await?;
        Ok(())
    }

    /// Sends `message` to the default destination and waits up to `timeout`
    /// for the reply.
    pub async fn request(&self, message: Message, timeout: Duration) -> PoolResult<Message> {
        self.request_with(None, message, &self.options.send_options, timeout)
            .await
    }

    /// Sends a request and waits for the reply carrying its correlation id.
    ///
    /// The message gets a fresh correlation id and this producer's reply
    /// queue as reply-to; anything already set there is overwritten. The
    /// whole call, including waiting for a binding, is bounded by `timeout`.
    pub async fn request_with(
        &self,
        destination: Option<&Destination>,
        message: Message,
        options: &SendOptions,
        timeout: Duration,
    ) -> PoolResult<Message> {
        self.ensure_destination(destination)?;
        let deadline = Instant::now() + timeout;
        self.correlator.activate();

        let binding = self.binder.wait_ready(timeout).await?;
        let reply_to = binding.reply_destination().await?;
        let correlation_id = Uuid::new_v4().to_string();
        let message = message
            .with_correlation_id(correlation_id.clone())
            .with_reply_to(reply_to);

        let waiter = self.correlator.register(correlation_id.clone())?;
        if let Err(e) = binding.producer.send(destination, message, options).await {
            self.correlator.cancel(&correlation_id);
            return Err(e.into());
        }
        trace!(producer_id = self.id(), %correlation_id, "Request sent");

        let remaining = deadline.saturating_duration_since(Instant::now());
        self.correlator.wait(waiter, remaining).await
    }

    /// Closes the producer and returns its session. Idempotent.
    pub async fn close(&self) {
        self.binder.close().await;
        self.task.abort();
    }

    fn ensure_destination(&self, destination: Option<&Destination>) -> PoolResult<()> {
        if destination.is_none() && self.destination.is_none() {
            return Err(BrokerError::InvalidDestination(
                "producer has no default destination".to_string(),
            )
            .into());
        }
        Ok(())
    }
}

impl Drop for ReconnectingProducer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use brokerpool_traits::DeliveryMode;

    #[test]
    fn test_options_from_settings() {
        let settings = PoolSettings {
            producer_ready_timeout: Duration::from_millis(250),
            ..PoolSettings::default()
        };
        let options = ProducerOptions::from_settings(&settings)
            .with_send_options(SendOptions::non_persistent().with_priority(7));
        assert_eq!(options.ready_timeout, Duration::from_millis(250));
        assert_eq!(options.send_options.delivery_mode, DeliveryMode::NonPersistent);
        assert_eq!(options.send_options.priority, 7);
    }
}
