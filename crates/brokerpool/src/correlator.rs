//! Request-reply correlation.
//!
//! ```text
//! request() ──register(id)──► waiters[id] = oneshot
//!     │                                   ▲
//!     └─send(msg, reply_to)──► broker ──► reply consumer ──dispatch(msg)
//!                                         (removes waiters[id], completes)
//! ```
//!
//! A correlation id leaves the table exactly once: either the matching reply
//! removes it, or the timed-out waiter does. Replies for ids that are not in
//! the table (late, duplicate or foreign) are dropped.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use brokerpool_traits::Message;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::error::{PoolError, PoolResult};

/// Matches inbound replies to blocked requests by correlation id.
#[derive(Default)]
pub struct RequestReplyCorrelator {
    waiters: Mutex<HashMap<String, oneshot::Sender<Message>>>,
    active: AtomicBool,
}

/// A registered request, redeemed with [`RequestReplyCorrelator::wait`].
#[derive(Debug)]
pub struct ResponseWaiter {
    correlation_id: String,
    receiver: oneshot::Receiver<Message>,
}

impl ResponseWaiter {
    /// The correlation id the waiter is registered under.
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }
}

// Drops the table entry if the waiting future is cancelled.
struct Deregister<'a> {
    correlator: &'a RequestReplyCorrelator,
    correlation_id: &'a str,
}

impl Drop for Deregister<'_> {
    fn drop(&mut self) {
        self.correlator.waiters.lock().remove(self.correlation_id);
    }
}

impl RequestReplyCorrelator {
    /// Creates an empty, inactive correlator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the correlator as in use, so reply channels are (re)created on
    /// every binding from now on.
    pub fn activate(&self) {
        self.active.store(true, Ordering::Release);
    }

    /// Returns `true` once a synchronous request has been made.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Registers a waiter for `correlation_id`.
    pub fn register(&self, correlation_id: impl Into<String>) -> PoolResult<ResponseWaiter> {
        let correlation_id = correlation_id.into();
        let mut waiters = self.waiters.lock();
        if waiters.contains_key(&correlation_id) {
            return Err(PoolError::DuplicateCorrelationId(correlation_id));
        }
        let (sender, receiver) = oneshot::channel();
        waiters.insert(correlation_id.clone(), sender);
        trace!(%correlation_id, "Registered response waiter");
        Ok(ResponseWaiter {
            correlation_id,
            receiver,
        })
    }

    /// Routes a reply to its waiter. Returns `false` if nobody was waiting.
    pub fn dispatch(&self, message: Message) -> bool {
        let Some(correlation_id) = message.correlation_id.clone() else {
            debug!("Discarding reply without correlation id");
            return false;
        };
        // Completing under the lock means a waiter that finds its entry gone
        // can rely on the value already being in its channel.
        let mut waiters = self.waiters.lock();
        match waiters.remove(&correlation_id) {
            Some(sender) => {
                let _ = sender.send(message);
                true
            }
            None => {
                debug!(%correlation_id, "Discarding reply with unknown correlation id");
                false
            }
        }
    }

    /// Abandons a waiter. Returns `true` if it was still pending.
    pub fn cancel(&self, correlation_id: &str) -> bool {
        self.waiters.lock().remove(correlation_id).is_some()
    }

    /// Number of requests waiting for a reply.
    pub fn pending(&self) -> usize {
        self.waiters.lock().len()
    }

    /// Waits up to `timeout` for the reply to `waiter`.
    pub async fn wait(&self, waiter: ResponseWaiter, timeout: Duration) -> PoolResult<Message> {
        let ResponseWaiter {
            correlation_id,
            mut receiver,
        } = waiter;
        let _deregister = Deregister {
            correlator: self,
            correlation_id: &correlation_id,
        };
        let timed_out = || PoolError::ResponseTimeout {
            correlation_id: correlation_id.clone(),
            timeout,
        };

        let outcome = tokio::time::timeout(timeout, &mut receiver).await;
        match outcome {
            Ok(Ok(message)) => Ok(message),
            // Cancelled through `cancel`.
            Ok(Err(_)) => Err(timed_out()),
            Err(_) => {
                if self.waiters.lock().remove(&correlation_id).is_some() {
                    debug!(%correlation_id, ?timeout, "Request timed out");
                    Err(timed_out())
                } else {
                    // The reply won the race against the deadline.
                    receiver.try_recv().map_err(|_| timed_out())
                }
            }
        }
    }
}

impl fmt::Debug for RequestReplyCorrelator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestReplyCorrelator")
            .field("pending", &self.pending())
            .field("active", &self.is_active())
            .finish()
    }
}
