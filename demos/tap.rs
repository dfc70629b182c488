//! Connects both transports against a local monitor and prints every
//! record the pipeline broadcasts.
//!
//! Usage: `cargo run --example tap [broker-host]`

use std::sync::Arc;

use shotrelay::{
    ingest_channel, BrokerConfig, BrokerListener, ConnectionManager, Pipeline, PubSubConfig,
    PubSubListener, Settings, ShotStore,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let broker_host = std::env::args().nth(1).unwrap_or_else(|| "localhost".into());

    let store = Arc::new(ShotStore::new());
    let connections = Arc::new(ConnectionManager::new());
    let (_observer, mut records) = connections.subscribe(64);

    let (tx, rx) = ingest_channel(64);
    let orchestrator = Pipeline::new(store, connections).spawn(rx);

    let mut broker = BrokerListener::new(
        BrokerConfig {
            host: broker_host,
            ..BrokerConfig::default()
        },
        tx.clone(),
    );
    if let Err(e) = broker.start().await {
        eprintln!("broker unavailable, continuing with pub/sub only: {e}");
    }

    let mut pubsub = PubSubListener::new(PubSubConfig::default(), &Settings::empty(), tx);
    pubsub.start().await;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            record = records.recv() => match record {
                Some(record) => println!("{}", serde_json::to_string_pretty(&*record)?),
                None => break,
            },
        }
    }

    broker.stop().await;
    pubsub.stop().await;
    orchestrator.abort();
    Ok(())
}
