//! Connects with the token from `FLEET_ACCESS_TOKEN`, logs every event the
//! backend pushes and pings periodically.
//!
//! ```sh
//! RUST_LOG=info FLEET_ACCESS_TOKEN=... cargo run --example monitor -- conv-123
//! ```

use fleet_connector_rs::auth::EnvTokenStore;
use fleet_connector_rs::config::ConnectionConfig;
use fleet_connector_rs::types::{ConnectOptions, ConnectionEvent, EventKind};
use fleet_connector_rs::ConnectionManager;
use log::*;
use std::sync::Arc;
use tokio::time::{interval, Duration};

const PING_EVERY: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = ConnectionConfig::from_env()?;
    info!(
        "Monitoring {}:{} (secure: {})",
        config.endpoint.host, config.endpoint.port, config.endpoint.secure
    );
    let manager = ConnectionManager::new(config, Arc::new(EnvTokenStore));

    for kind in EventKind::ALL {
        manager.on(kind, |event: &ConnectionEvent| {
            info!("[{}] {}", event.kind(), event.payload());
        });
    }

    manager.connect(ConnectOptions::default()).await?;

    if let Some(conversation) = std::env::args().nth(1) {
        if manager.join_conversation(&conversation) {
            info!("Joined conversation {}", conversation);
        }
    }

    let mut ticker = interval(PING_EVERY);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if !manager.ping() {
                    warn!("Ping skipped, status {:?}", manager.status());
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
        }
    }

    manager.disconnect();
    Ok(())
}
