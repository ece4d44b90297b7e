//! In-memory sessions, producers and consumers.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use brokerpool_traits::{
    AcknowledgementMode, BrokerConsumer, BrokerError, BrokerProducer, BrokerResult, BrokerSession,
    Destination, Message, MessageListener, SendOptions,
};
use parking_lot::Mutex;

use crate::broker::{ConsumerEntry, MemoryBroker};
use crate::connection::ConnectionFlags;
use crate::selector::Selector;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug)]
pub(crate) struct MemorySession {
    id: u64,
    connection_id: u64,
    mode: AcknowledgementMode,
    broker: MemoryBroker,
    connection: Arc<ConnectionFlags>,
    closed: Arc<AtomicBool>,
    producers: Mutex<Vec<Arc<MemoryProducer>>>,
    consumers: Mutex<Vec<Arc<MemoryConsumer>>>,
}

impl MemorySession {
    pub(crate) fn new(
        connection_id: u64,
        mode: AcknowledgementMode,
        broker: MemoryBroker,
        connection: Arc<ConnectionFlags>,
    ) -> Self {
        broker.session_opened();
        Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            connection_id,
            mode,
            broker,
            connection,
            closed: Arc::new(AtomicBool::new(false)),
            producers: Mutex::new(Vec::new()),
            consumers: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> BrokerResult<()> {
        if self.is_closed() {
            return Err(BrokerError::Closed(format!("session {}", self.id)));
        }
        self.connection.ensure_usable()
    }

    pub(crate) fn close_now(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for producer in self.producers.lock().drain(..) {
            producer.close_now();
        }
        for consumer in self.consumers.lock().drain(..) {
            consumer.close_now();
        }
        self.broker.session_closed();
    }
}

#[async_trait]
impl BrokerSession for MemorySession {
    fn acknowledgement_mode(&self) -> AcknowledgementMode {
        self.mode
    }

    async fn create_producer(
        &self,
        destination: Option<&Destination>,
    ) -> BrokerResult<Arc<dyn BrokerProducer>> {
        self.ensure_open()?;
        let producer = Arc::new(MemoryProducer {
            default_destination: destination.cloned(),
            broker: self.broker.clone(),
            connection: self.connection.clone(),
            session_closed: self.closed.clone(),
            closed: AtomicBool::new(false),
        });
        self.broker.producer_opened();
        self.producers.lock().push(producer.clone());
        Ok(producer)
    }

    async fn create_consumer(
        &self,
        destination: &Destination,
        selector: Option<&str>,
        listener: MessageListener,
    ) -> BrokerResult<Arc<dyn BrokerConsumer>> {
        self.ensure_open()?;
        let selector = match selector {
            Some(expression) => Selector::parse(expression)?,
            None => None,
        };
        let id = self.broker.next_consumer_id();
        self.broker.add_consumer(
            destination,
            ConsumerEntry {
                id,
                connection: self.connection.clone(),
                selector,
                listener,
            },
        )?;
        let consumer = Arc::new(MemoryConsumer {
            id,
            destination: destination.clone(),
            broker: self.broker.clone(),
            closed: AtomicBool::new(false),
        });
        self.consumers.lock().push(consumer.clone());
        Ok(consumer)
    }

    async fn create_temporary_queue(&self) -> BrokerResult<Destination> {
        self.ensure_open()?;
        Ok(self.broker.create_temporary_queue(self.connection_id))
    }

    async fn delete_temporary_queue(&self, destination: &Destination) -> BrokerResult<()> {
        self.broker.delete_temporary_queue(destination)
    }

    async fn close(&self) -> BrokerResult<()> {
        self.close_now();
        Ok(())
    }
}

#[derive(Debug)]
pub(crate) struct MemoryProducer {
    default_destination: Option<Destination>,
    broker: MemoryBroker,
    connection: Arc<ConnectionFlags>,
    session_closed: Arc<AtomicBool>,
    closed: AtomicBool,
}

impl MemoryProducer {
    fn close_now(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.broker.producer_closed();
        }
    }
}

#[async_trait]
impl BrokerProducer for MemoryProducer {
    async fn send(
        &self,
        destination: Option<&Destination>,
        message: Message,
        options: &SendOptions,
    ) -> BrokerResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BrokerError::Closed("producer".into()));
        }
        if self.session_closed.load(Ordering::Acquire) {
            return Err(BrokerError::Closed("session".into()));
        }
        self.connection.ensure_usable()?;
        let destination = destination
            .or(self.default_destination.as_ref())
            .ok_or_else(|| {
                BrokerError::InvalidDestination("producer has no default destination".into())
            })?;
        self.broker.deliver(destination, message, options)
    }

    async fn close(&self) -> BrokerResult<()> {
        self.close_now();
        Ok(())
    }
}

#[derive(Debug)]
pub(crate) struct MemoryConsumer {
    id: u64,
    destination: Destination,
    broker: MemoryBroker,
    closed: AtomicBool,
}

impl MemoryConsumer {
    fn close_now(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.broker.remove_consumer(&self.destination, self.id);
        }
    }
}

#[async_trait]
impl BrokerConsumer for MemoryConsumer {
    async fn close(&self) -> BrokerResult<()> {
        self.close_now();
        Ok(())
    }
}
