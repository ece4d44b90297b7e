//! Connection pool lifecycle, selection and self-repair against the
//! in-memory broker.

mod common;

use std::time::Duration;

use brokerpool::{
    BindingState, ConnectionEvent, Endpoint, EndpointStrategies, PoolError, PoolSettings,
    ProducerOptions, ReconnectingProducer,
};
use brokerpool_traits::{AcknowledgementMode, Destination, Message};
use pretty_assertions::assert_eq;

use common::{PATIENCE, eventually, fast_settings, memory, only_connection, pool};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_pool_reaches_target_connection_count() {
    let (_, connector) = memory();
    let pool = pool(
        &connector,
        fast_settings(&["memory://a", "memory://b"], 4).build().unwrap(),
    );

    pool.start_and_wait(PATIENCE).await.unwrap();
    eventually("four connections", || pool.active_count() == 4).await;

    assert!(pool.is_running());
    assert_eq!(connector.connections_to("memory://a").len(), 2);
    assert_eq!(connector.connections_to("memory://b").len(), 2);

    let status = pool.status();
    assert_eq!(status.up, 4);
    assert_eq!(status.down(), 0);
    let mut per_endpoint = status.endpoints.clone();
    per_endpoint.sort();
    assert_eq!(
        per_endpoint,
        vec![("memory://a".to_string(), 2), ("memory://b".to_string(), 2)]
    );

    for connection in pool.connections() {
        assert!(connection.is_up());
        assert_eq!(connection.session_pool().idle_count(), 2);
    }
    pool.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_get_connection_rotates_over_live_connections() {
    let (_, connector) = memory();
    let pool = pool(&connector, fast_settings(&["memory://a"], 3).build().unwrap());
    pool.start_and_wait(PATIENCE).await.unwrap();
    eventually("three connections", || pool.active_count() == 3).await;

    let ids: Vec<u64> = (0..6).map(|_| pool.get_connection().unwrap().id()).collect();
    let mut first_round = ids[..3].to_vec();
    first_round.sort_unstable();
    first_round.dedup();
    assert_eq!(first_round.len(), 3);
    assert_eq!(&ids[..3], &ids[3..]);
    pool.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_invalidated_endpoint_is_not_used() {
    let (_, connector) = memory();
    let pool = pool(
        &connector,
        fast_settings(&["memory://a", "memory://b"], 3).build().unwrap(),
    );
    pool.invalidate_endpoint(&Endpoint::new("memory://b"));

    pool.start_and_wait(PATIENCE).await.unwrap();
    eventually("three connections", || pool.active_count() == 3).await;

    assert!(connector.connections_to("memory://b").is_empty());
    assert_eq!(connector.connections_to("memory://a").len(), 3);
    assert_eq!(pool.registry().invalid(), vec![Endpoint::new("memory://b")]);
    pool.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failover_strategy_uses_primary_only() {
    let (_, connector) = memory();
    let settings = fast_settings(&["memory://primary", "memory://backup"], 2)
        .endpoint_strategy(EndpointStrategies::FAILOVER)
        .build()
        .unwrap();
    let pool = pool(&connector, settings);
    pool.start_and_wait(PATIENCE).await.unwrap();
    eventually("two connections", || pool.active_count() == 2).await;
    assert_eq!(connector.connections_to("memory://primary").len(), 2);

    // Losing the primary moves replacements to the backup.
    pool.invalidate_endpoint(&Endpoint::new("memory://primary"));
    for connection in connector.connections_to("memory://primary") {
        connection.interrupt();
    }
    eventually("two backup connections", || {
        connector.connections_to("memory://backup").len() == 2 && pool.active_count() == 2
    })
    .await;
    pool.stop().await;
}

#[tokio::test]
async fn test_unknown_strategy_is_rejected() {
    let (_, connector) = memory();
    let settings = fast_settings(&["memory://a"], 1)
        .endpoint_strategy("random")
        .build()
        .unwrap();
    let result = brokerpool::ConnectionPool::new(settings, std::sync::Arc::new(connector));
    assert!(matches!(result, Err(PoolError::Configuration(_))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_start_and_wait_times_out_and_stops() {
    let (_, connector) = memory();
    connector.set_unreachable("memory://a", true);
    let pool = pool(&connector, fast_settings(&["memory://a"], 1).build().unwrap());

    let timeout = Duration::from_millis(100);
    assert_eq!(
        pool.start_and_wait(timeout).await,
        Err(PoolError::StartupTimeout { timeout })
    );
    assert!(!pool.is_running());
    assert!(pool.stats().connection_failures >= 1);
    assert!(matches!(pool.start(), Err(PoolError::Closed(_))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_recovery_retries_until_endpoint_is_reachable() {
    let (_, connector) = memory();
    connector.set_unreachable("memory://a", true);
    let pool = pool(&connector, fast_settings(&["memory://a"], 2).build().unwrap());
    pool.start().unwrap();

    eventually("repeated failures", || pool.stats().connection_failures >= 3).await;
    assert_eq!(pool.active_count(), 0);
    assert!(matches!(
        pool.get_connection_timeout(Duration::from_millis(20)).await,
        Err(PoolError::Timeout { .. })
    ));
    // Failed attempts never invalidate an endpoint.
    assert!(pool.registry().invalid().is_empty());

    connector.set_unreachable("memory://a", false);
    let connection = pool.get_connection_timeout(PATIENCE).await.unwrap();
    assert!(connection.is_up());
    eventually("two connections", || pool.active_count() == 2).await;
    pool.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_interrupted_connection_is_cleaned_up_and_replaced() {
    let (_, connector) = memory();
    let pool = pool(&connector, fast_settings(&["memory://a"], 2).build().unwrap());
    pool.start_and_wait(PATIENCE).await.unwrap();
    eventually("two connections", || pool.active_count() == 2).await;
    let before: Vec<u64> = pool.connections().iter().map(|c| c.id()).collect();

    let victim = connector.connections().remove(0);
    victim.interrupt();

    eventually("cleanup", || pool.stats().connections_destroyed == 1).await;
    eventually("replacement", || pool.active_count() == 2).await;
    assert!(victim.is_closed());
    assert_eq!(connector.connections().len(), 2);

    let after: Vec<u64> = pool.connections().iter().map(|c| c.id()).collect();
    let survivors = after.iter().filter(|id| before.contains(id)).count();
    assert_eq!(survivors, 1);
    assert_eq!(pool.stats().interruptions, 1);
    pool.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_resumed_connection_returns_before_cleanup() {
    let (_, connector) = memory();
    let settings = fast_settings(&["memory://a"], 1)
        .recovery_interval(Duration::from_secs(60))
        .cleanup_interval(Duration::from_secs(60))
        .build()
        .unwrap();
    let pool = pool(&connector, settings);
    pool.start_and_wait(PATIENCE).await.unwrap();
    let id = pool.get_connection().unwrap().id();
    let memory = only_connection(&connector);

    memory.interrupt();
    eventually("removal", || {
        pool.active_count() == 0 && pool.status().awaiting_cleanup == 1
    })
    .await;
    assert_eq!(pool.get_connection().unwrap_err(), PoolError::NoConnectionsAvailable);

    memory.resume();
    eventually("return", || pool.active_count() == 1).await;
    assert_eq!(pool.status().awaiting_cleanup, 0);
    assert_eq!(pool.get_connection().unwrap().id(), id);

    pool.cleanup_now().await;
    assert!(!memory.is_closed());
    assert_eq!(pool.stats().connections_destroyed, 0);
    pool.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_connection_resumed_during_cleanup_is_kept() {
    let (broker, connector) = memory();
    let settings = fast_settings(&["memory://a", "memory://b"], 2)
        .recovery_interval(Duration::from_secs(60))
        .cleanup_interval(Duration::from_secs(60))
        .build()
        .unwrap();
    let pool = pool(&connector, settings);
    pool.start_and_wait(PATIENCE).await.unwrap();
    eventually("two connections", || pool.active_count() == 2).await;

    let queue = Destination::queue("jobs");
    let producer = ReconnectingProducer::new(
        &pool,
        Some(queue.clone()),
        ProducerOptions::default().with_ready_timeout(Duration::from_secs(2)),
    )
    .await;
    assert!(producer.is_ready());

    let a = connector.connections_to("memory://a").remove(0);
    let b = connector.connections_to("memory://b").remove(0);
    a.set_close_delay(Some(Duration::from_millis(300)));

    a.interrupt();
    eventually("a queued", || pool.status().awaiting_cleanup == 1).await;
    b.interrupt();
    eventually("b queued", || {
        pool.active_count() == 0 && pool.status().awaiting_cleanup == 2
    })
    .await;
    eventually("producer unbound", || {
        producer.state() == BindingState::Uninitialized
    })
    .await;

    // Tearing down a is slow, so b resumes while the pass is still busy.
    let cleanup = tokio::spawn({
        let pool = pool.clone();
        async move { pool.cleanup_now().await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    b.resume();
    eventually("b returned", || pool.active_count() == 1).await;
    eventually("producer rebound", || producer.is_ready()).await;
    cleanup.await.unwrap();

    assert!(a.is_closed());
    assert!(!b.is_closed());
    assert_eq!(pool.active_count(), 1);
    assert_eq!(pool.status().awaiting_cleanup, 0);
    assert_eq!(pool.stats().connections_destroyed, 1);

    let live = pool.get_connection().unwrap();
    assert!(live.is_up());
    assert_eq!(producer.connection_id(), Some(live.id()));
    producer.send(Message::text("after cleanup")).await.unwrap();
    assert_eq!(broker.pending(&queue), 1);

    producer.close().await;
    pool.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cleanup_announces_destroyed_connections() {
    let (_, connector) = memory();
    let settings = fast_settings(&["memory://a"], 1)
        .recovery_interval(Duration::from_secs(60))
        .cleanup_interval(Duration::from_secs(60))
        .build()
        .unwrap();
    let pool = pool(&connector, settings);
    pool.start_and_wait(PATIENCE).await.unwrap();
    let id = pool.get_connection().unwrap().id();
    let mut events = pool.subscribe();

    only_connection(&connector).interrupt();
    eventually("queued", || pool.status().awaiting_cleanup == 1).await;
    pool.cleanup_now().await;

    let destroyed = tokio::time::timeout(PATIENCE, async {
        loop {
            if let ConnectionEvent::Destroyed(connection) = events.recv().await.unwrap() {
                return connection;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(destroyed.id(), id);
    assert!(destroyed.is_destroyed());
    assert_eq!(pool.status().awaiting_cleanup, 0);
    pool.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_exception_removes_connection() {
    let (_, connector) = memory();
    let settings = fast_settings(&["memory://a"], 1)
        .recovery_interval(Duration::from_secs(60))
        .build()
        .unwrap();
    let pool = pool(&connector, settings);
    pool.start_and_wait(PATIENCE).await.unwrap();
    let mut events = pool.subscribe();

    only_connection(&connector)
        .raise_exception(brokerpool_traits::BrokerError::ConnectionLost("reset".into()));

    let event = tokio::time::timeout(PATIENCE, async {
        loop {
            let event = events.recv().await.unwrap();
            if event.is_failure() {
                return event;
            }
        }
    })
    .await
    .unwrap();
    assert!(matches!(event, ConnectionEvent::Exception { .. }));
    eventually("cleanup", || pool.stats().connections_destroyed == 1).await;
    assert_eq!(pool.active_count(), 0);
    pool.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_new_connection_is_announced() {
    let (_, connector) = memory();
    let pool = pool(&connector, fast_settings(&["memory://a"], 1).build().unwrap());
    let mut events = pool.subscribe();
    pool.start().unwrap();

    let resumed = tokio::time::timeout(PATIENCE, events.recv())
        .await
        .unwrap()
        .unwrap();
    let available = tokio::time::timeout(PATIENCE, events.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(resumed, ConnectionEvent::Resumed(_)));
    assert!(matches!(available, ConnectionEvent::Available(_)));
    assert_eq!(resumed.connection_id(), available.connection_id());
    pool.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stop_destroys_connections_and_borrowed_sessions() {
    let (broker, connector) = memory();
    let pool = pool(&connector, fast_settings(&["memory://a"], 2).build().unwrap());
    pool.start_and_wait(PATIENCE).await.unwrap();
    eventually("two connections", || pool.active_count() == 2).await;

    let connection = pool.get_connection().unwrap();
    let session = connection
        .create_session(AcknowledgementMode::AutoAcknowledge)
        .await
        .unwrap();

    pool.stop().await;
    assert!(!pool.is_running());
    assert!(connection.is_destroyed());
    assert!(session.is_destroyed());
    assert!(matches!(
        session.create_producer(None).await,
        Err(PoolError::SessionClosed { .. })
    ));
    assert!(connector.connections().is_empty());
    assert_eq!(pool.get_connection().unwrap_err(), PoolError::NoConnectionsAvailable);

    let stats = broker.stats();
    assert_eq!(stats.sessions_opened, stats.sessions_closed);

    pool.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stats_serialize() {
    let (_, connector) = memory();
    let pool = pool(&connector, fast_settings(&["memory://a"], 1).build().unwrap());
    pool.start_and_wait(PATIENCE).await.unwrap();

    let stats = serde_json::to_value(pool.stats()).unwrap();
    assert_eq!(stats["connection_attempts"], 1);
    assert_eq!(stats["connection_failures"], 0);
    let status = serde_json::to_value(pool.status()).unwrap();
    assert_eq!(status["up"], 1);
    pool.stop().await;
}

#[test]
fn test_settings_require_endpoints() {
    assert!(matches!(
        PoolSettings::builder().build(),
        Err(PoolError::Configuration(_))
    ));
}
