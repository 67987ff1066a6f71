//! Connection configuration and lifecycle policy.
//!
//! All timing constants used by the manager and the transports live here so
//! apps can tune them. The defaults match what the mobile apps ship with.

use crate::error::{ConnectorError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_CLIENT_TYPE: &str = "mobile";
pub const SOCKET_IO_PATH: &str = "/socket.io/";
/// Engine.IO protocol revision spoken by the backend.
pub const ENGINE_IO_VERSION: &str = "4";

const DEFAULT_RECONNECT_ATTEMPTS: u32 = 5;
const DEFAULT_RECONNECT_DELAY_MS: u64 = 1_000;
const DEFAULT_RECONNECT_DELAY_MAX_MS: u64 = 5_000;
const DEFAULT_RANDOMIZATION_FACTOR: f64 = 0.5;
const DEFAULT_ATTEMPT_TIMEOUT_SECS: u64 = 10;
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 15;
const DEFAULT_RECONNECT_COOLDOWN_SECS: u64 = 2;
const DEFAULT_POOR_LATENCY_MS: u64 = 1_000;

pub const HOST_ENV: &str = "FLEET_SOCKET_HOST";
pub const DEV_HOST_ENV: &str = "FLEET_DEV_HOST";
pub const PORT_ENV: &str = "FLEET_SOCKET_PORT";
pub const SECURE_ENV: &str = "FLEET_SOCKET_SECURE";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Websocket,
    Polling,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Websocket => "websocket",
            TransportKind::Polling => "polling",
        }
    }
}

/// Where the backend's Socket.IO server lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub secure: bool,
    pub path: String,
}

impl Endpoint {
    /// Picks the configured host when present, otherwise the local
    /// development host, otherwise `localhost`. The port is the same on every
    /// platform.
    pub fn resolve(configured_host: Option<&str>, dev_host: Option<&str>, port: u16) -> Self {
        fn usable(host: Option<&str>) -> Option<&str> {
            host.map(str::trim).filter(|h| !h.is_empty())
        }
        let host = usable(configured_host)
            .or_else(|| usable(dev_host))
            .unwrap_or(DEFAULT_HOST)
            .to_string();
        Self {
            host,
            port,
            secure: false,
            path: SOCKET_IO_PATH.to_string(),
        }
    }

    /// Full Engine.IO URL for the given transport kind.
    pub fn transport_url(&self, kind: TransportKind) -> Result<Url> {
        let scheme = match (kind, self.secure) {
            (TransportKind::Websocket, false) => "ws",
            (TransportKind::Websocket, true) => "wss",
            (TransportKind::Polling, false) => "http",
            (TransportKind::Polling, true) => "https",
        };
        let mut url = Url::parse(&format!(
            "{}://{}:{}{}",
            scheme, self.host, self.port, self.path
        ))?;
        url.query_pairs_mut()
            .append_pair("EIO", ENGINE_IO_VERSION)
            .append_pair("transport", kind.as_str());
        Ok(url)
    }
}

impl Default for Endpoint {
    fn default() -> Self {
        Self::resolve(None, None, DEFAULT_PORT)
    }
}

/// Built-in reconnection of a transport after it drops unexpectedly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectionPolicy {
    pub enabled: bool,
    pub max_attempts: u32,
    pub delay: Duration,
    pub delay_max: Duration,
    /// Relative jitter applied to each delay, in `[0, 1]`.
    pub randomization_factor: f64,
}

impl ReconnectionPolicy {
    /// Delay before reconnect attempt `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.backoff_with(attempt, rand::random::<f64>())
    }

    /// Same as [`backoff`](Self::backoff) with the random draw supplied, so
    /// the schedule can be checked deterministically.
    pub fn backoff_with(&self, attempt: u32, draw: f64) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let base = self.delay.as_millis() as f64 * f64::from(1u32 << exponent);
        let max = self.delay_max.as_millis() as f64;
        let mut ms = base.min(max);

        let jitter = self.randomization_factor.clamp(0.0, 1.0);
        if jitter > 0.0 {
            let draw = draw.clamp(0.0, 1.0);
            let deviation = (draw * jitter * ms).floor();
            // Low draws shorten the delay, high draws lengthen it.
            if draw < 0.5 {
                ms -= deviation;
            } else {
                ms += deviation;
            }
        }
        Duration::from_millis(ms.clamp(0.0, max) as u64)
    }
}

impl Default for ReconnectionPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: DEFAULT_RECONNECT_ATTEMPTS,
            delay: Duration::from_millis(DEFAULT_RECONNECT_DELAY_MS),
            delay_max: Duration::from_millis(DEFAULT_RECONNECT_DELAY_MAX_MS),
            randomization_factor: DEFAULT_RANDOMIZATION_FACTOR,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub endpoint: Endpoint,
    /// Tag sent as `clientType` in the auth payload.
    pub client_type: String,
    /// Transports tried in order on every attempt.
    pub transports: Vec<TransportKind>,
    pub reconnection: ReconnectionPolicy,
    /// Bound on a single transport handshake.
    pub attempt_timeout: Duration,
    /// Bound on `connect()` waiting for the first connect signal.
    pub connect_timeout: Duration,
    /// Minimum spacing between a disconnect and the next handshake.
    pub reconnect_cooldown: Duration,
    /// Round trips slower than this are reported as poor quality.
    pub poor_latency_threshold: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            endpoint: Endpoint::default(),
            client_type: DEFAULT_CLIENT_TYPE.to_string(),
            transports: vec![TransportKind::Websocket, TransportKind::Polling],
            reconnection: ReconnectionPolicy::default(),
            attempt_timeout: Duration::from_secs(DEFAULT_ATTEMPT_TIMEOUT_SECS),
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            reconnect_cooldown: Duration::from_secs(DEFAULT_RECONNECT_COOLDOWN_SECS),
            poor_latency_threshold: Duration::from_millis(DEFAULT_POOR_LATENCY_MS),
        }
    }
}

impl ConnectionConfig {
    /// Builds a config for an explicit host and port, keeping default policy.
    pub fn for_host(host: &str, port: u16) -> Self {
        Self {
            endpoint: Endpoint::resolve(Some(host), None, port),
            ..Self::default()
        }
    }

    /// Reads the endpoint from `FLEET_SOCKET_HOST` / `FLEET_DEV_HOST` /
    /// `FLEET_SOCKET_PORT` / `FLEET_SOCKET_SECURE`; everything else keeps its
    /// default.
    pub fn from_env() -> Result<Self> {
        let configured = std::env::var(HOST_ENV).ok();
        let dev_host = std::env::var(DEV_HOST_ENV).ok();
        let port = match std::env::var(PORT_ENV) {
            Ok(raw) => raw.trim().parse::<u16>().map_err(|e| {
                ConnectorError::Config(format!("{} must be a port number: {}", PORT_ENV, e))
            })?,
            Err(_) => DEFAULT_PORT,
        };
        let secure = match std::env::var(SECURE_ENV) {
            Ok(raw) => raw.trim().parse::<bool>().map_err(|e| {
                ConnectorError::Config(format!("{} must be true or false: {}", SECURE_ENV, e))
            })?,
            Err(_) => false,
        };

        let mut endpoint = Endpoint::resolve(configured.as_deref(), dev_host.as_deref(), port);
        endpoint.secure = secure;

        let config = Self {
            endpoint,
            ..Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.transports.is_empty() {
            return Err(ConnectorError::Config(
                "at least one transport must be enabled".to_string(),
            ));
        }
        if self.reconnection.delay > self.reconnection.delay_max {
            return Err(ConnectorError::Config(format!(
                "reconnection delay {:?} exceeds max delay {:?}",
                self.reconnection.delay, self.reconnection.delay_max
            )));
        }
        if self.connect_timeout.is_zero() || self.attempt_timeout.is_zero() {
            return Err(ConnectorError::Config("timeouts must be non-zero".to_string()));
        }
        Ok(())
    }
}
