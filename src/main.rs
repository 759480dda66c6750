//! RouteSight - network observation daemon.
//!
//! Registered targets are probed continuously (ICMP ping, MTR/traceroute
//! with GeoIP enrichment, optional SSH/HTTP/iperf3 throughput); samples are
//! persisted to SQLite and served over an authenticated JSON API.

mod config;
mod db;
mod geoip;
mod logging;
mod monitor;
mod probe;
mod web;

use config::ServerConfig;
use db::{Store, Target, PROBE_MODE_ICMP};
use monitor::Monitor;
use web::Server;

use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let log_buffer = logging::LogBuffer::new(logging::DEFAULT_CAPACITY);

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(logging::RingLayer::new(log_buffer.clone()))
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("routesight=info".parse()?),
        )
        .init();

    let cfg = ServerConfig::load();
    tracing::info!("starting RouteSight on port {}...", cfg.http_port);
    tracing::info!("using database at {}", cfg.db_path);

    let store = Arc::new(Store::new(&cfg.db_path)?);
    tracing::info!("database initialized successfully");

    seed_default_target(&store);

    let geo = geoip::init_provider(&cfg).await;

    let monitor = Monitor::new(store.clone(), geo);
    monitor.start();

    let server = Server::new(cfg, store, monitor.clone(), log_buffer);
    tokio::select! {
        result = server.start() => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
            monitor.stop();
        }
    }

    Ok(())
}

fn seed_default_target(store: &Store) {
    match store.get_targets(false) {
        Ok(existing) if existing.is_empty() => {
            tracing::info!("seeding default target: Cloudflare DNS");
            let mut target = Target {
                name: "Cloudflare DNS".to_string(),
                address: "1.1.1.1".to_string(),
                description: "Anycast DNS resolver".to_string(),
                probe_type: PROBE_MODE_ICMP.to_string(),
                ..Default::default()
            };
            if let Err(e) = store.create_target(&mut target) {
                tracing::warn!("failed to seed default target: {}", e);
            }
        }
        Ok(_) => {}
        Err(e) => tracing::warn!("failed to check existing targets: {}", e),
    }
}
