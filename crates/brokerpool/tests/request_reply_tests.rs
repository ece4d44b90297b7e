//! Request-reply through reconnecting producers and responder consumers.

mod common;

use std::time::Duration;

use brokerpool::{
    Endpoint, PoolError, PooledConnection, ProducerOptions, ReconnectingConsumer,
    ReconnectingProducer, RequestHandler, SessionPoolConfig,
};
use brokerpool_traits::{Destination, Message};
use futures::future::join_all;
use pretty_assertions::assert_eq;

use common::{PATIENCE, eventually, fast_settings, memory, only_connection, pool};

fn echo(request: Message) -> Option<Message> {
    let body = request.text_body().unwrap_or_default().to_string();
    Some(Message::text(format!("echo: {body}")))
}

struct Uppercase;

#[async_trait::async_trait]
impl RequestHandler for Uppercase {
    async fn handle(&self, request: Message) -> Option<Message> {
        tokio::task::yield_now().await;
        request
            .text_body()
            .map(|body| Message::text(body.to_uppercase()))
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_request_receives_matching_reply() {
    let (_, connector) = memory();
    let pool = pool(&connector, fast_settings(&["memory://a"], 1).build().unwrap());
    pool.start_and_wait(PATIENCE).await.unwrap();

    let service = Destination::queue("echo");
    let responder = ReconnectingConsumer::respond(&pool, service.clone(), None, echo).await;
    let producer =
        ReconnectingProducer::new(&pool, Some(service), ProducerOptions::default()).await;

    let reply = producer
        .request(Message::text("hi"), Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(reply.text_body(), Some("echo: hi"));
    assert!(reply.correlation_id().is_some());
    assert!(producer.correlator().is_active());
    assert_eq!(producer.correlator().pending(), 0);

    responder.close().await;
    producer.close().await;
    pool.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_requests_are_correlated() {
    let (_, connector) = memory();
    let pool = pool(&connector, fast_settings(&["memory://a"], 1).build().unwrap());
    pool.start_and_wait(PATIENCE).await.unwrap();

    let service = Destination::queue("upper");
    let _responder = ReconnectingConsumer::respond(&pool, service.clone(), None, Uppercase).await;
    let producer =
        ReconnectingProducer::new(&pool, Some(service), ProducerOptions::default()).await;

    let replies = join_all((0..16).map(|i| {
        producer.request(Message::text(format!("req-{i}")), Duration::from_secs(2))
    }))
    .await;
    for (i, reply) in replies.into_iter().enumerate() {
        assert_eq!(
            reply.unwrap().text_body().map(str::to_string),
            Some(format!("REQ-{i}"))
        );
    }
    assert_eq!(producer.correlator().pending(), 0);
    pool.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_request_without_responder_times_out() {
    let (broker, connector) = memory();
    let pool = pool(&connector, fast_settings(&["memory://a"], 1).build().unwrap());
    pool.start_and_wait(PATIENCE).await.unwrap();

    let void = Destination::queue("void");
    let producer =
        ReconnectingProducer::new(&pool, Some(void.clone()), ProducerOptions::default()).await;

    let result = producer
        .request(Message::text("anyone?"), Duration::from_millis(100))
        .await;
    assert!(matches!(result, Err(PoolError::ResponseTimeout { .. })));
    assert!(result.unwrap_err().is_timeout());
    assert_eq!(producer.correlator().pending(), 0);

    // The request itself went out with a reply-to queue.
    assert_eq!(broker.pending(&void), 1);
    pool.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_responder_ignores_requests_without_reply_to() {
    let (broker, connector) = memory();
    let pool = pool(&connector, fast_settings(&["memory://a"], 1).build().unwrap());
    pool.start_and_wait(PATIENCE).await.unwrap();

    let service = Destination::queue("echo");
    let _responder = ReconnectingConsumer::respond(&pool, service.clone(), None, echo).await;
    let producer =
        ReconnectingProducer::new(&pool, Some(service), ProducerOptions::default()).await;

    let sent_before = broker.stats().messages_sent;
    producer.send(Message::text("fire and forget")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(broker.stats().messages_sent, sent_before + 1);
    pool.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_requests_work_again_after_resume() {
    let (_, connector) = memory();
    let connection = PooledConnection::open(
        &connector,
        Endpoint::new("memory://a"),
        SessionPoolConfig {
            min_sessions: 2,
            max_sessions: 8,
            ..SessionPoolConfig::default()
        },
    )
    .await
    .unwrap();

    let service = Destination::queue("echo");
    let responder = ReconnectingConsumer::respond(connection.clone(), service.clone(), None, echo).await;
    let producer = ReconnectingProducer::new(
        connection.clone(),
        Some(service),
        ProducerOptions::default(),
    )
    .await;
    let reply = producer
        .request(Message::text("before"), Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(reply.text_body(), Some("echo: before"));

    let memory = only_connection(&connector);
    memory.interrupt();
    eventually("unbound", || !producer.is_ready() && !responder.is_ready()).await;
    memory.resume();
    eventually("rebound", || producer.is_ready() && responder.is_ready()).await;

    let reply = producer
        .request(Message::text("after"), Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(reply.text_body(), Some("echo: after"));
}
