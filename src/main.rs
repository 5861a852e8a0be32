//! fanoutd - HTTP fan-out proxy daemon
//!
//! Wires the subsystems together and serves:
//! - the dispatch path under `/fanout/{name}`
//! - the definition-cache peer protocol under `/_groupcache/`
//! - the admin surface under `/admin/`

use clap::Parser;
use fanout::config::{Args, Config};
use fanout::server::{self, AppState};
use fanout::store::FanoutStore;
use fanout::{Dispatcher, FanoutCache, PostgresStore, TransportCache};
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Config::from_args(Args::parse());
    log::info!("Starting fanoutd {}", fanout::VERSION);
    log::info!(
        "Peers: {}",
        if config.peers.is_empty() {
            "none (single node)".to_string()
        } else {
            config.peers.join(", ")
        }
    );

    let store: Arc<dyn FanoutStore> =
        Arc::new(PostgresStore::connect(&config.postgres_connection).await?);
    let transports = Arc::new(TransportCache::new(config.transport.clone()));
    let fanouts = Arc::new(FanoutCache::new(
        &config.self_url(),
        &config.peers,
        store.clone(),
        transports.clone(),
        config.cache.clone(),
    ));
    let dispatcher = Arc::new(Dispatcher::new(
        fanouts.clone(),
        transports,
        config.dispatch.clone(),
    ));

    let app = server::router(
        AppState {
            dispatcher,
            fanouts,
            store,
        },
        config.max_body_bytes,
    );

    let listener = tokio::net::TcpListener::bind(&config.listen).await?;
    log::info!("Starting server at {}...", config.listen);
    axum::serve(listener, app).await?;
    Ok(())
}
