//! # brokerpool-traits
//!
//! The broker client contract consumed by `brokerpool`. This crate defines the
//! narrow black-box interface a message broker client has to provide so that
//! connections, sessions, producers and consumers can be pooled and repaired
//! on top of it.
//!
//! ## Overview
//!
//! This crate defines:
//! - **Traits**: [`BrokerConnector`], [`BrokerConnection`], [`BrokerSession`],
//!   [`BrokerProducer`], [`BrokerConsumer`]
//! - **Types**: [`Message`], [`Destination`], [`AcknowledgementMode`],
//!   [`DeliveryMode`], [`SendOptions`], [`Credentials`], [`ConnectionSignal`]
//! - **Errors**: [`BrokerError`], [`BrokerResult`]
//!
//! ## Usage
//!
//! Broker clients implement the traits with `async_trait`:
//!
//! ```rust,ignore
//! use brokerpool_traits::{BrokerConnector, BrokerConnection, BrokerResult, Credentials};
//! use async_trait::async_trait;
//!
//! #[derive(Debug)]
//! struct MyConnector { /* ... */ }
//!
//! #[async_trait]
//! impl BrokerConnector for MyConnector {
//!     async fn connect(
//!         &self,
//!         uri: &str,
//!         credentials: Option<&Credentials>,
//!     ) -> BrokerResult<Arc<dyn BrokerConnection>> { /* ... */ }
//! }
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

mod error;
mod message;
mod signal;
mod traits;
mod types;

pub use error::{BrokerError, BrokerResult};
pub use message::{Message, MessageBody};
pub use signal::ConnectionSignal;
pub use traits::{
    BrokerConnection, BrokerConnector, BrokerConsumer, BrokerProducer, BrokerSession,
    MessageListener,
};
pub use types::{
    AcknowledgementMode, Credentials, DeliveryMode, Destination, DestinationKind, SendOptions,
};
