// tests/common.rs
use fleet_connector_rs::config::{ConnectionConfig, TransportKind};
use std::sync::Once;

static INIT: Once = Once::new();

// Loads .env (if any) and installs the test logger once per test binary.
pub fn setup() {
    INIT.call_once(|| {
        if dotenv::from_path(".env").is_err() {
            let _ = dotenv::from_path("../.env");
        }
        env_logger::builder().is_test(true).try_init().ok();
    });
}

/// Config pointing at a local test server with a single transport and no
/// built-in reconnection.
#[allow(dead_code)]
pub fn local_config(port: u16, transports: Vec<TransportKind>) -> ConnectionConfig {
    let mut config = ConnectionConfig::for_host("127.0.0.1", port);
    config.transports = transports;
    config.reconnection.enabled = false;
    config
}
