//! Destination bookkeeping and message routing.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use brokerpool_traits::{
    BrokerError, BrokerResult, Destination, DestinationKind, Message, MessageListener, SendOptions,
};
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::trace;

use crate::connection::ConnectionFlags;
use crate::selector::Selector;

/// An in-process broker shared by every connection a [`MemoryConnector`] opens.
///
/// [`MemoryConnector`]: crate::MemoryConnector
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

#[derive(Debug, Default)]
struct BrokerInner {
    destinations: DashMap<Destination, Arc<Mutex<DestinationState>>>,
    next_message_id: AtomicU64,
    next_consumer_id: AtomicU64,
    next_temporary_id: AtomicU64,
    counters: Counters,
}

#[derive(Debug, Default)]
struct Counters {
    sessions_opened: AtomicU64,
    sessions_closed: AtomicU64,
    producers_opened: AtomicU64,
    producers_closed: AtomicU64,
    consumers_opened: AtomicU64,
    consumers_closed: AtomicU64,
    messages_sent: AtomicU64,
}

/// A snapshot of broker-wide object counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BrokerStats {
    /// Sessions created.
    pub sessions_opened: u64,
    /// Sessions closed.
    pub sessions_closed: u64,
    /// Producers created.
    pub producers_opened: u64,
    /// Producers closed.
    pub producers_closed: u64,
    /// Consumers created.
    pub consumers_opened: u64,
    /// Consumers closed.
    pub consumers_closed: u64,
    /// Messages accepted for delivery.
    pub messages_sent: u64,
}

#[derive(Debug, Default)]
struct DestinationState {
    consumers: Vec<ConsumerEntry>,
    backlog: VecDeque<PendingMessage>,
    cursor: usize,
    owner: Option<u64>,
}

pub(crate) struct ConsumerEntry {
    pub(crate) id: u64,
    pub(crate) connection: Arc<ConnectionFlags>,
    pub(crate) selector: Option<Selector>,
    pub(crate) listener: MessageListener,
}

impl fmt::Debug for ConsumerEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerEntry")
            .field("id", &self.id)
            .field("selector", &self.selector)
            .finish_non_exhaustive()
    }
}

impl ConsumerEntry {
    fn accepts(&self, message: &Message) -> bool {
        self.connection.is_deliverable()
            && self
                .selector
                .as_ref()
                .is_none_or(|selector| selector.matches(message))
    }
}

#[derive(Debug)]
struct PendingMessage {
    message: Message,
    expires_at: Option<Instant>,
}

impl DestinationState {
    fn next_consumer(&mut self, message: &Message) -> Option<MessageListener> {
        let count = self.consumers.len();
        for offset in 0..count {
            let index = (self.cursor + offset) % count;
            if self.consumers[index].accepts(message) {
                self.cursor = (index + 1) % count;
                return Some(self.consumers[index].listener.clone());
            }
        }
        None
    }

    fn drain_ready(&mut self) -> Vec<(MessageListener, Message)> {
        let now = Instant::now();
        let mut ready = Vec::new();
        let mut remaining = VecDeque::with_capacity(self.backlog.len());
        while let Some(pending) = self.backlog.pop_front() {
            if pending.expires_at.is_some_and(|at| at <= now) {
                continue;
            }
            match self.next_consumer(&pending.message) {
                Some(listener) => ready.push((listener, pending.message)),
                None => remaining.push_back(pending),
            }
        }
        self.backlog = remaining;
        ready
    }
}

impl MemoryBroker {
    /// Creates an empty broker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of messages waiting on a queue for a consumer.
    pub fn pending(&self, destination: &Destination) -> usize {
        self.existing(destination)
            .map_or(0, |state| state.lock().backlog.len())
    }

    /// Number of consumers attached to a destination.
    pub fn consumer_count(&self, destination: &Destination) -> usize {
        self.existing(destination)
            .map_or(0, |state| state.lock().consumers.len())
    }

    /// Returns `true` if the destination currently exists.
    pub fn destination_exists(&self, destination: &Destination) -> bool {
        self.inner.destinations.contains_key(destination)
    }

    /// Returns a snapshot of the object counters.
    pub fn stats(&self) -> BrokerStats {
        let c = &self.inner.counters;
        BrokerStats {
            sessions_opened: c.sessions_opened.load(Ordering::Relaxed),
            sessions_closed: c.sessions_closed.load(Ordering::Relaxed),
            producers_opened: c.producers_opened.load(Ordering::Relaxed),
            producers_closed: c.producers_closed.load(Ordering::Relaxed),
            consumers_opened: c.consumers_opened.load(Ordering::Relaxed),
            consumers_closed: c.consumers_closed.load(Ordering::Relaxed),
            messages_sent: c.messages_sent.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn session_opened(&self) {
        self.inner
            .counters
            .sessions_opened
            .fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn session_closed(&self) {
        self.inner
            .counters
            .sessions_closed
            .fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn producer_opened(&self) {
        self.inner
            .counters
            .producers_opened
            .fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn producer_closed(&self) {
        self.inner
            .counters
            .producers_closed
            .fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn next_consumer_id(&self) -> u64 {
        self.inner.next_consumer_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn existing(&self, destination: &Destination) -> Option<Arc<Mutex<DestinationState>>> {
        self.inner
            .destinations
            .get(destination)
            .map(|entry| entry.value().clone())
    }

    // Queues and topics spring into existence on first use; temporary queues
    // must have been created explicitly.
    fn resolve(&self, destination: &Destination) -> BrokerResult<Arc<Mutex<DestinationState>>> {
        if destination.is_temporary() {
            return self.existing(destination).ok_or_else(|| {
                BrokerError::InvalidDestination(format!("{destination} does not exist"))
            });
        }
        Ok(self
            .inner
            .destinations
            .entry(destination.clone())
            .or_default()
            .value()
            .clone())
    }

    pub(crate) fn create_temporary_queue(&self, owner: u64) -> Destination {
        let sequence = self.inner.next_temporary_id.fetch_add(1, Ordering::Relaxed) + 1;
        let destination = Destination::temporary(format!("ID:memory-{owner}:{sequence}"));
        let state = DestinationState {
            owner: Some(owner),
            ..DestinationState::default()
        };
        self.inner
            .destinations
            .insert(destination.clone(), Arc::new(Mutex::new(state)));
        trace!(%destination, owner, "created temporary queue");
        destination
    }

    pub(crate) fn delete_temporary_queue(&self, destination: &Destination) -> BrokerResult<()> {
        if !destination.is_temporary() {
            return Err(BrokerError::InvalidDestination(format!(
                "{destination} is not a temporary queue"
            )));
        }
        if self.inner.destinations.remove(destination).is_some() {
            trace!(%destination, "deleted temporary queue");
        }
        Ok(())
    }

    /// Deletes every temporary queue owned by a closing connection.
    pub(crate) fn remove_owned(&self, owner: u64) {
        self.inner
            .destinations
            .retain(|_, state| state.lock().owner != Some(owner));
    }

    pub(crate) fn add_consumer(
        &self,
        destination: &Destination,
        entry: ConsumerEntry,
    ) -> BrokerResult<()> {
        let state = self.resolve(destination)?;
        state.lock().consumers.push(entry);
        self.inner
            .counters
            .consumers_opened
            .fetch_add(1, Ordering::Relaxed);
        if destination.kind() != DestinationKind::Topic {
            let ready = state.lock().drain_ready();
            Self::dispatch(ready);
        }
        Ok(())
    }

    pub(crate) fn remove_consumer(&self, destination: &Destination, id: u64) {
        if let Some(state) = self.existing(destination) {
            let mut state = state.lock();
            state.consumers.retain(|entry| entry.id != id);
            state.cursor = 0;
        }
        self.inner
            .counters
            .consumers_closed
            .fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn deliver(
        &self,
        destination: &Destination,
        mut message: Message,
        options: &SendOptions,
    ) -> BrokerResult<()> {
        let state = self.resolve(destination)?;
        let sequence = self.inner.next_message_id.fetch_add(1, Ordering::Relaxed) + 1;
        message.message_id = Some(format!("ID:memory:{sequence}"));
        message.delivery = Some(*options);
        self.inner
            .counters
            .messages_sent
            .fetch_add(1, Ordering::Relaxed);

        let targets: Vec<MessageListener> = {
            let mut state = state.lock();
            if destination.kind() == DestinationKind::Topic {
                state
                    .consumers
                    .iter()
                    .filter(|entry| entry.accepts(&message))
                    .map(|entry| entry.listener.clone())
                    .collect()
            } else if let Some(listener) = state.next_consumer(&message) {
                vec![listener]
            } else {
                trace!(%destination, "no consumer ready, buffering message");
                state.backlog.push_back(PendingMessage {
                    expires_at: options.time_to_live.map(|ttl| Instant::now() + ttl),
                    message,
                });
                return Ok(());
            }
        };

        // Listeners run with no broker lock held.
        for listener in targets {
            listener(message.clone());
        }
        Ok(())
    }

    /// Hands buffered queue messages to consumers that became ready.
    pub(crate) fn flush(&self) {
        let states: Vec<_> = self
            .inner
            .destinations
            .iter()
            .filter(|entry| entry.key().kind() != DestinationKind::Topic)
            .map(|entry| entry.value().clone())
            .collect();
        for state in states {
            let ready = state.lock().drain_ready();
            Self::dispatch(ready);
        }
    }

    fn dispatch(ready: Vec<(MessageListener, Message)>) {
        for (listener, message) in ready {
            listener(message);
        }
    }
}
