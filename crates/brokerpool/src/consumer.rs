//! Consumers that survive connection loss.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use brokerpool_traits::{
    BrokerConsumer, BrokerProducer, Destination, Message, MessageListener, SendOptions,
};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::binding::{Binder, Binding, BindingFactory, BindingState};
use crate::connection::PooledConnection;
use crate::error::PoolResult;
use crate::session::Session;
use crate::source::ConnectionSource;

/// Produces the reply to a request.
///
/// Returning `None` sends nothing. Plain closures returning
/// `Option<Message>` implement this trait.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    /// Handles one request.
    async fn handle(&self, request: Message) -> Option<Message>;
}

#[async_trait]
impl<F> RequestHandler for F
where
    F: Fn(Message) -> Option<Message> + Send + Sync + 'static,
{
    async fn handle(&self, request: Message) -> Option<Message> {
        self(request)
    }
}

/// What a consumer does with its messages.
#[derive(Clone)]
pub enum ConsumerMode {
    /// Hand every message to the listener.
    Listener(MessageListener),
    /// Answer every message on its reply-to destination.
    Responder(Arc<dyn RequestHandler>),
}

impl fmt::Debug for ConsumerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Listener(_) => f.write_str("Listener"),
            Self::Responder(_) => f.write_str("Responder"),
        }
    }
}

pub(crate) struct ConsumerBinding {
    connection: Arc<PooledConnection>,
    session: Arc<Session>,
    consumer: Arc<dyn BrokerConsumer>,
    replies: Option<Arc<dyn BrokerProducer>>,
}

#[async_trait]
impl Binding for ConsumerBinding {
    fn connection(&self) -> &Arc<PooledConnection> {
        &self.connection
    }

    async fn release(&self, discard: bool) {
        if let Err(e) = self.consumer.close().await {
            debug!(session_id = self.session.id(), error = %e, "Failed to close consumer");
        }
        if let Some(replies) = &self.replies {
            if let Err(e) = replies.close().await {
                debug!(session_id = self.session.id(), error = %e, "Failed to close reply producer");
            }
        }
        let session = Arc::clone(&self.session);
        let released = if discard {
            self.connection.discard_session(session).await
        } else {
            self.connection.release_session(session).await
        };
        if let Err(e) = released {
            debug!(connection_id = self.connection.id(), error = %e, "Failed to release consumer session");
        }
    }
}

struct ConsumerFactory {
    destination: Destination,
    selector: Option<String>,
    mode: ConsumerMode,
    runtime: Handle,
}

impl ConsumerFactory {
    async fn open(
        &self,
        session: &Session,
    ) -> PoolResult<(Arc<dyn BrokerConsumer>, Option<Arc<dyn BrokerProducer>>)> {
        let (listener, replies) = match &self.mode {
            ConsumerMode::Listener(listener) => (Arc::clone(listener), None),
            ConsumerMode::Responder(handler) => {
                let replies = session.create_producer(None).await?;
                let listener = responder(
                    Arc::clone(handler),
                    Arc::clone(&replies),
                    self.runtime.clone(),
                );
                (listener, Some(replies))
            }
        };
        let consumer = session
            .create_consumer(&self.destination, self.selector.as_deref(), listener)
            .await?;
        Ok((consumer, replies))
    }
}

#[async_trait]
impl BindingFactory for ConsumerFactory {
    type Binding = ConsumerBinding;

    async fn bind(&self, connection: Arc<PooledConnection>) -> PoolResult<ConsumerBinding> {
        let session = connection
            .create_session(connection.acknowledgement_mode())
            .await?;
        match self.open(&session).await {
            Ok((consumer, replies)) => Ok(ConsumerBinding {
                connection,
                session,
                consumer,
                replies,
            }),
            Err(e) => {
                // Closing the session closes whatever was opened on it.
                if let Err(discard_error) = connection.discard_session(session).await {
                    debug!(error = %discard_error, "Failed to discard session");
                }
                Err(e)
            }
        }
    }
}

fn responder(
    handler: Arc<dyn RequestHandler>,
    replies: Arc<dyn BrokerProducer>,
    runtime: Handle,
) -> MessageListener {
    Arc::new(move |request: Message| {
        let handler = Arc::clone(&handler);
        let replies = Arc::clone(&replies);
        runtime.spawn(async move {
            answer(handler.as_ref(), replies.as_ref(), request).await;
        });
    })
}

async fn answer(handler: &dyn RequestHandler, replies: &dyn BrokerProducer, request: Message) {
    let reply_to = request.reply_to.clone();
    let correlation_id = request.correlation_id.clone();
    let Some(mut reply) = handler.handle(request).await else {
        return;
    };
    let Some(reply_to) = reply_to else {
        trace!("Request has no reply-to, dropping reply");
        return;
    };
    reply.correlation_id = correlation_id;
    if let Err(e) = replies
        .send(Some(&reply_to), reply, &SendOptions::non_persistent())
        .await
    {
        warn!(destination = %reply_to, error = %e, "Failed to send reply");
    }
}

/// A consumer that rebinds itself after connection loss.
///
/// Messages published while the consumer is unbound are not buffered on its
/// behalf; whether they reach it later depends on the destination (queues
/// keep them, topics do not).
///
/// Like [`ReconnectingProducer`](crate::ReconnectingProducer), a pool-sourced
/// consumer rebinds to the next connection the pool hands out rather than
/// to the one it lost.
#[derive(Debug)]
pub struct ReconnectingConsumer {
    binder: Arc<Binder<ConsumerFactory>>,
    destination: Destination,
    selector: Option<String>,
    task: JoinHandle<()>,
}

impl ReconnectingConsumer {
    /// Creates a consumer and binds it if the source has a connection.
    pub async fn new(
        source: impl Into<ConnectionSource>,
        destination: Destination,
        selector: Option<String>,
        mode: ConsumerMode,
    ) -> Self {
        let factory = ConsumerFactory {
            destination: destination.clone(),
            selector: selector.clone(),
            mode,
            runtime: Handle::current(),
        };
        let (binder, task) = Binder::start("consumer", factory, source.into()).await;
        debug!(consumer_id = binder.id(), %destination, ?selector, "Consumer created");
        Self {
            binder,
            destination,
            selector,
            task,
        }
    }

    /// Creates a consumer handing every message to `listener`.
    pub async fn listen<L>(
        source: impl Into<ConnectionSource>,
        destination: Destination,
        selector: Option<String>,
        listener: L,
    ) -> Self
    where
        L: Fn(Message) + Send + Sync + 'static,
    {
        Self::new(
            source,
            destination,
            selector,
            ConsumerMode::Listener(Arc::new(listener)),
        )
        .await
    }

    /// Creates a consumer answering requests with `handler`.
    pub async fn respond<H>(
        source: impl Into<ConnectionSource>,
        destination: Destination,
        selector: Option<String>,
        handler: H,
    ) -> Self
    where
        H: RequestHandler,
    {
        Self::new(
            source,
            destination,
            selector,
            ConsumerMode::Responder(Arc::new(handler)),
        )
        .await
    }

    /// Process-unique consumer id.
    pub fn id(&self) -> u64 {
        self.binder.id()
    }

    /// The destination consumed from.
    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    /// The selector, if any.
    pub fn selector(&self) -> Option<&str> {
        self.selector.as_deref()
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

    /// Waits up to `timeout` for the consumer to be bound.
    pub async fn wait_ready(&self, timeout: Duration) -> PoolResult<()> {
        self.binder.wait_ready(timeout).await.map(|_| ())
    }

    /// Closes the consumer and returns its session. Idempotent.
    pub async fn close(&self) {
        self.binder.close().await;
        self.task.abort();
    }
}

impl Drop for ReconnectingConsumer {
    fn drop(&mut self) {
        self.task.abort();
    }
}
