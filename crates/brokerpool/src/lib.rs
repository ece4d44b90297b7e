//! # brokerpool
//!
//! Resilient client-side pooling on top of any broker client implementing
//! `brokerpool-traits`.
//!
//! ## Architecture
//!
//! ```text
//! ConnectionPool ──owns──► PooledConnection ──owns──► SessionPool ──► Session
//!       │                        │
//!       │ endpoints              │ ConnectionSignal (interrupted/resumed/exception)
//!       ▼                        ▼
//! EndpointRegistry         EventEmitter ──► ConnectionEvent ──► ReconnectingProducer
//!                                                            └─► ReconnectingConsumer
//! ```
//!
//! - [`ConnectionPool`] keeps a target number of connections up. A recovery
//!   loop replaces missing ones using endpoints from the
//!   [`EndpointRegistry`]; a cleanup loop destroys interrupted ones.
//! - [`PooledConnection`] wraps one broker connection with a bounded,
//!   optionally growing [`SessionPool`] and turns broker signals into
//!   [`ConnectionEvent`]s.
//! - [`ReconnectingProducer`] and [`ReconnectingConsumer`] follow those events
//!   and recreate their session and broker objects after connection loss.
//! - [`RequestReplyCorrelator`] backs [`ReconnectingProducer::request`]: it
//!   matches replies arriving on the producer's temporary queue to waiting
//!   requests by correlation id.
//! - [`PoolHost`] owns one application-wide pool with an explicit start/stop
//!   lifecycle.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use brokerpool::{ConnectionPool, PoolSettings, ProducerOptions, ReconnectingProducer};
//! use brokerpool_traits::{BrokerConnector, Destination, Message};
//!
//! # async fn run(connector: Arc<dyn BrokerConnector>) -> brokerpool::PoolResult<()> {
//! let settings = PoolSettings::builder()
//!     .connection_count(2)
//!     .endpoint("tcp://broker-a:61616")
//!     .endpoint("tcp://broker-b:61616")
//!     .build()?;
//!
//! let pool = ConnectionPool::new(settings, connector)?;
//! pool.start_and_wait(Duration::from_secs(5)).await?;
//!
//! let producer = ReconnectingProducer::new(
//!     &pool,
//!     Some(Destination::queue("orders")),
//!     ProducerOptions::from_settings(pool.settings()),
//! )
//! .await;
//! producer.send(Message::text("hello")).await?;
//!
//! producer.close().await;
//! pool.stop().await;
//! # Ok(())
//! # }
//! ```

#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    clippy::all
)]
#![deny(unsafe_code)]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![allow(
    clippy::module_name_repetitions,
    clippy::missing_errors_doc,
    clippy::must_use_candidate
)]

mod binding;
mod connection;
mod consumer;
mod correlator;
mod endpoint;
mod error;
mod event;
mod host;
mod multi_consumer;
mod pool;
mod producer;
mod registry;
mod session;
mod session_pool;
mod settings;
mod source;

pub use binding::BindingState;
pub use connection::{ConnectionState, PooledConnection};
pub use consumer::{ConsumerMode, ReconnectingConsumer, RequestHandler};
pub use correlator::{RequestReplyCorrelator, ResponseWaiter};
pub use endpoint::Endpoint;
pub use error::{PoolError, PoolResult};
pub use event::{ConnectionEvent, EventEmitter};
pub use host::PoolHost;
pub use multi_consumer::MultiConsumer;
pub use pool::{ConnectionPool, PoolStats, PoolStatus};
pub use producer::{ProducerOptions, ReconnectingProducer};
pub use registry::{
    EndpointRegistry, EndpointStrategies, FailoverRegistry, RegistryFactory, RoundRobinRegistry,
};
pub use session::Session;
pub use session_pool::{SessionPool, SessionPoolConfig};
pub use settings::{PoolSettings, PoolSettingsBuilder};
pub use source::ConnectionSource;
