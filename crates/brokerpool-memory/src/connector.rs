//! Connection factory for the in-memory broker.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use brokerpool_traits::{BrokerConnection, BrokerConnector, BrokerError, BrokerResult, Credentials};
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::broker::MemoryBroker;
use crate::connection::MemoryConnection;

/// Opens [`MemoryConnection`]s to a shared [`MemoryBroker`].
///
/// Any URI is accepted unless it has been marked unreachable. Clones share
/// state, so a test can keep one handle while the pool owns another.
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    broker: MemoryBroker,
    state: Arc<ConnectorState>,
}

#[derive(Debug, Default)]
struct ConnectorState {
    unreachable: RwLock<HashSet<String>>,
    required_credentials: RwLock<Option<Credentials>>,
    connect_delay: RwLock<Option<Duration>>,
    connections: Mutex<Vec<Arc<MemoryConnection>>>,
    attempts: AtomicU64,
}

impl MemoryConnector {
    /// Creates a connector for `broker`.
    pub fn new(broker: MemoryBroker) -> Self {
        Self {
            broker,
            state: Arc::new(ConnectorState::default()),
        }
    }

    /// The broker connections are opened against.
    pub fn broker(&self) -> &MemoryBroker {
        &self.broker
    }

    /// Makes connection attempts to `uri` fail (or succeed again).
    pub fn set_unreachable(&self, uri: &str, unreachable: bool) {
        let mut set = self.state.unreachable.write();
        if unreachable {
            set.insert(uri.to_string());
        } else {
            set.remove(uri);
        }
    }

    /// Rejects connection attempts that do not present these credentials.
    pub fn require_credentials(&self, credentials: Credentials) {
        *self.state.required_credentials.write() = Some(credentials);
    }

    /// Delays every connection attempt.
    pub fn set_connect_delay(&self, delay: Option<Duration>) {
        *self.state.connect_delay.write() = delay;
    }

    /// Number of connection attempts made so far, including failed ones.
    pub fn attempts(&self) -> u64 {
        self.state.attempts.load(Ordering::Relaxed)
    }

    /// Connections opened through this connector that are not closed.
    pub fn connections(&self) -> Vec<Arc<MemoryConnection>> {
        self.state
            .connections
            .lock()
            .iter()
            .filter(|connection| !connection.is_closed())
            .cloned()
            .collect()
    }

    /// Open connections to a specific endpoint.
    pub fn connections_to(&self, uri: &str) -> Vec<Arc<MemoryConnection>> {
        self.connections()
            .into_iter()
            .filter(|connection| connection.uri() == uri)
            .collect()
    }
}

#[async_trait]
impl BrokerConnector for MemoryConnector {
    async fn connect(
        &self,
        uri: &str,
        credentials: Option<&Credentials>,
    ) -> BrokerResult<Arc<dyn BrokerConnection>> {
        self.state.attempts.fetch_add(1, Ordering::Relaxed);

        let delay = *self.state.connect_delay.read();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.state.unreachable.read().contains(uri) {
            return Err(BrokerError::ConnectionFailed(format!("{uri} is unreachable")));
        }

        let required = self.state.required_credentials.read().clone();
        if let Some(required) = required {
            if credentials != Some(&required) {
                return Err(BrokerError::AuthenticationFailed(format!(
                    "invalid credentials for {uri}"
                )));
            }
        }

        let connection = Arc::new(MemoryConnection::new(uri, self.broker.clone()));
        debug!(connection_id = connection.id(), uri, "memory connection opened");
        self.state.connections.lock().push(connection.clone());
        Ok(connection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use brokerpool_traits::{
        AcknowledgementMode, BrokerProducer, BrokerSession, ConnectionSignal, Destination,
        Message, MessageListener, SendOptions,
    };
    use pretty_assertions::assert_eq;

    fn collector() -> (Arc<Mutex<Vec<Message>>>, MessageListener) {
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        (received, Arc::new(move |message: Message| sink.lock().push(message)))
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_fails() {
        let connector = MemoryConnector::new(MemoryBroker::new());
        connector.set_unreachable("memory://down", true);

        let result = connector.connect("memory://down", None).await;
        assert!(matches!(result, Err(BrokerError::ConnectionFailed(_))));
        assert!(connector.connect("memory://up", None).await.is_ok());
        assert_eq!(connector.attempts(), 2);
    }

    #[tokio::test]
    async fn test_credentials_are_checked() {
        let connector = MemoryConnector::new(MemoryBroker::new());
        connector.require_credentials(Credentials::new("app", "secret"));

        let wrong = Credentials::new("app", "nope");
        assert!(matches!(
            connector.connect("memory://a", Some(&wrong)).await,
            Err(BrokerError::AuthenticationFailed(_))
        ));
        let right = Credentials::new("app", "secret");
        assert!(connector.connect("memory://a", Some(&right)).await.is_ok());
    }

    #[tokio::test]
    async fn test_queue_buffers_until_consumer_connection_starts() {
        let broker = MemoryBroker::new();
        let connector = MemoryConnector::new(broker.clone());
        let queue = Destination::queue("work");

        let connection = connector.connect("memory://a", None).await.unwrap();
        let session = connection
            .create_session(AcknowledgementMode::AutoAcknowledge)
            .await
            .unwrap();
        let (received, listener) = collector();
        let _consumer = session.create_consumer(&queue, None, listener).await.unwrap();

        let producer = session.create_producer(Some(&queue)).await.unwrap();
        producer
            .send(None, Message::text("one"), &SendOptions::default())
            .await
            .unwrap();
        assert_eq!(broker.pending(&queue), 1);
        assert!(received.lock().is_empty());

        connection.start().await.unwrap();
        assert_eq!(broker.pending(&queue), 0);
        assert_eq!(received.lock()[0].text_body(), Some("one"));
    }

    #[tokio::test]
    async fn test_queue_round_robins_consumers() {
        let broker = MemoryBroker::new();
        let connector = MemoryConnector::new(broker.clone());
        let queue = Destination::queue("work");
        let connection = connector.connect("memory://a", None).await.unwrap();
        connection.start().await.unwrap();
        let session = connection
            .create_session(AcknowledgementMode::AutoAcknowledge)
            .await
            .unwrap();

        let (first, listener) = collector();
        let _c1 = session.create_consumer(&queue, None, listener).await.unwrap();
        let (second, listener) = collector();
        let _c2 = session.create_consumer(&queue, None, listener).await.unwrap();

        let producer = session.create_producer(None).await.unwrap();
        for i in 0..4 {
            producer
                .send(Some(&queue), Message::text(i.to_string()), &SendOptions::default())
                .await
                .unwrap();
        }
        assert_eq!(first.lock().len(), 2);
        assert_eq!(second.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_topic_fans_out_and_selector_filters() {
        let broker = MemoryBroker::new();
        let connector = MemoryConnector::new(broker.clone());
        let topic = Destination::topic("prices");
        let connection = connector.connect("memory://a", None).await.unwrap();
        connection.start().await.unwrap();
        let session = connection
            .create_session(AcknowledgementMode::AutoAcknowledge)
            .await
            .unwrap();

        let (all, listener) = collector();
        let _c1 = session.create_consumer(&topic, None, listener).await.unwrap();
        let (eu, listener) = collector();
        let _c2 = session
            .create_consumer(&topic, Some("region = 'eu'"), listener)
            .await
            .unwrap();

        let producer = session.create_producer(Some(&topic)).await.unwrap();
        producer
            .send(None, Message::text("a").with_property("region", "eu"), &SendOptions::default())
            .await
            .unwrap();
        producer
            .send(None, Message::text("b").with_property("region", "us"), &SendOptions::default())
            .await
            .unwrap();

        assert_eq!(all.lock().len(), 2);
        assert_eq!(eu.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_interrupted_connection_refuses_sends_until_resumed() {
        let connector = MemoryConnector::new(MemoryBroker::new());
        let queue = Destination::queue("work");
        let connection = connector.connect("memory://a", None).await.unwrap();
        connection.start().await.unwrap();
        let session = connection
            .create_session(AcknowledgementMode::AutoAcknowledge)
            .await
            .unwrap();
        let producer = session.create_producer(Some(&queue)).await.unwrap();
        let mut signals = connection.subscribe();

        let memory = connector.connections().remove(0);
        memory.interrupt();
        assert_eq!(
            signals.recv().await.unwrap(),
            ConnectionSignal::Interrupted
        );
        let result = producer
            .send(None, Message::text("x"), &SendOptions::default())
            .await;
        assert!(matches!(result, Err(BrokerError::ConnectionLost(_))));

        memory.resume();
        assert_eq!(
            signals.recv().await.unwrap(),
            ConnectionSignal::Resumed
        );
        assert!(
            producer
                .send(None, Message::text("x"), &SendOptions::default())
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn test_close_cascades_and_removes_temporary_queues() {
        let broker = MemoryBroker::new();
        let connector = MemoryConnector::new(broker.clone());
        let connection = connector.connect("memory://a", None).await.unwrap();
        let session = connection
            .create_session(AcknowledgementMode::AutoAcknowledge)
            .await
            .unwrap();
        let _producer = session.create_producer(None).await.unwrap();
        let temp = session.create_temporary_queue().await.unwrap();
        assert!(broker.destination_exists(&temp));

        connection.close().await.unwrap();
        assert!(!broker.destination_exists(&temp));
        assert!(connector.connections().is_empty());

        let stats = broker.stats();
        assert_eq!(stats.sessions_closed, 1);
        assert_eq!(stats.producers_closed, 1);
        assert!(matches!(
            session.create_producer(None).await,
            Err(BrokerError::Closed(_))
        ));
    }

    #[tokio::test]
    async fn test_close_delay_holds_teardown() {
        let connector = MemoryConnector::new(MemoryBroker::new());
        let connection = connector.connect("memory://a", None).await.unwrap();
        let memory = connector.connections().remove(0);
        memory.set_close_delay(Some(Duration::from_millis(100)));

        let closing = tokio::spawn(async move { connection.close().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!memory.is_closed());

        closing.await.unwrap().unwrap();
        assert!(memory.is_closed());
    }
}
