//! # brokerpool-memory
//!
//! An in-process message broker implementing the `brokerpool-traits`
//! contract. Queues deliver each message to one consumer in round-robin
//! order and buffer messages nobody can take yet; topics fan out to every
//! subscriber. Temporary queues belong to the connection that created them.
//!
//! Connections expose fault injection hooks ([`MemoryConnection::interrupt`],
//! [`MemoryConnection::resume`], [`MemoryConnection::raise_exception`]) and the
//! connector can mark endpoints unreachable or require credentials, which is
//! what the pool's recovery paths are tested against.
//!
//! ```rust,ignore
//! let broker = MemoryBroker::new();
//! let connector = MemoryConnector::new(broker.clone());
//! let connection = connector.connect("memory://a", None).await?;
//! ```

#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    clippy::all
)]
#![deny(unsafe_code)]
#![allow(
    clippy::module_name_repetitions,
    clippy::missing_errors_doc,
    clippy::must_use_candidate
)]

mod broker;
mod connection;
mod connector;
mod selector;
mod session;

pub use broker::{BrokerStats, MemoryBroker};
pub use connection::MemoryConnection;
pub use connector::MemoryConnector;
