//! Broker pool demo
//!
//! Runs a two-endpoint pool over the in-memory broker, answers requests with
//! a responder consumer, then knocks a connection over and shows the producer
//! carrying on after the pool repairs itself.
//!
//! Settings come from `BROKERPOOL_SETTINGS` (a JSON file) when set; logging is
//! controlled with `RUST_LOG`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use brokerpool::{
    ConnectionPool, PoolSettings, ProducerOptions, ReconnectingConsumer, ReconnectingProducer,
};
use brokerpool_memory::{MemoryBroker, MemoryConnector};
use brokerpool_traits::{Destination, Message};
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEFAULT_SETTINGS: &str = r#"{
    "connection_count": 2,
    "min_sessions_per_connection": 2,
    "max_sessions_per_connection": 8,
    "endpoints": [
        { "uri": "memory://east" },
        { "uri": "memory://west" }
    ],
    "recovery_interval": { "secs": 0, "nanos": 200000000 },
    "cleanup_interval": { "secs": 0, "nanos": 200000000 },
    "status_interval": { "secs": 1, "nanos": 0 }
}"#;

fn load_settings() -> anyhow::Result<PoolSettings> {
    let raw = match std::env::var("BROKERPOOL_SETTINGS") {
        Ok(path) => std::fs::read_to_string(&path)
            .with_context(|| format!("reading settings from {path}"))?,
        Err(_) => DEFAULT_SETTINGS.to_string(),
    };
    let settings: PoolSettings = serde_json::from_str(&raw).context("parsing pool settings")?;
    settings.validate()?;
    Ok(settings)
}

fn answer(request: Message) -> Option<Message> {
    let name = request.text_body().unwrap_or("stranger");
    Some(Message::text(format!("hello, {name}")))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings = load_settings()?;
    let broker = MemoryBroker::new();
    let connector = MemoryConnector::new(broker.clone());
    let pool = ConnectionPool::new(settings, Arc::new(connector.clone()))?;
    pool.start_and_wait(Duration::from_secs(5)).await?;

    let service = Destination::queue("greetings");
    let responder = ReconnectingConsumer::respond(&pool, service.clone(), None, answer).await;
    let producer = ReconnectingProducer::new(
        &pool,
        Some(service),
        ProducerOptions::from_settings(pool.settings()),
    )
    .await;

    let reply = producer
        .request(Message::text("world"), Duration::from_secs(2))
        .await?;
    info!(reply = ?reply.text_body(), "First request answered");

    if let Some(victim) = connector.connections().first() {
        info!(uri = victim.uri(), "Interrupting a connection");
        victim.interrupt();
    }
    tokio::time::sleep(Duration::from_millis(600)).await;
    info!(status = %pool.status(), "Pool after repair");

    let reply = producer
        .request(Message::text("again"), Duration::from_secs(2))
        .await?;
    info!(reply = ?reply.text_body(), "Request after failover answered");

    let stats = serde_json::to_string(&pool.stats())?;
    info!(%stats, broker = ?broker.stats(), "Shutting down");

    producer.close().await;
    responder.close().await;
    pool.stop().await;
    Ok(())
}
