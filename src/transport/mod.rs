//! Transport seam between the connection manager and the network.
//!
//! A [`Connector`] opens one transport per call and hands back a
//! [`TransportHandle`]: a command sender for outbound frames plus a stream of
//! [`TransportEvent`]s. The production connector ([`SocketIoConnector`])
//! speaks Socket.IO v4 over a WebSocket, falling back to HTTP long-polling,
//! and reconnects on its own after unexpected drops.

mod driver;
mod polling;
mod session;
mod websocket;

#[cfg(test)]
pub(crate) mod mock;

use crate::config::{Endpoint, ReconnectionPolicy, TransportKind};
use serde_json::Value;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub use driver::SocketIoConnector;

/// Disconnect reasons reported in [`TransportEvent::Disconnect`].
pub mod reason {
    pub const SERVER_DISCONNECT: &str = "io server disconnect";
    pub const CLIENT_DISCONNECT: &str = "io client disconnect";
    pub const TRANSPORT_CLOSE: &str = "transport close";
    pub const TRANSPORT_ERROR: &str = "transport error";
    pub const PING_TIMEOUT: &str = "ping timeout";
}

/// What a transport reports back to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Socket.IO handshake completed; `sid` is the socket id.
    Connect { sid: String },
    /// The initial handshake failed.
    ConnectError(String),
    Disconnect { reason: String },
    ReconnectAttempt(u32),
    /// Reconnected after the given number of attempts.
    Reconnect(u32),
    ReconnectFailed,
    /// Server-pushed event with its payload.
    Event { name: String, data: Value },
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportCommand {
    Emit { name: String, data: Value },
    Close,
}

/// Everything a connector needs to open a transport.
#[derive(Debug, Clone)]
pub struct TransportOptions {
    pub endpoint: Endpoint,
    pub transports: Vec<TransportKind>,
    pub reconnection: ReconnectionPolicy,
    pub attempt_timeout: Duration,
    /// Socket.IO `auth` payload sent with the CONNECT packet.
    pub auth: Value,
}

pub trait Connector: Send + Sync + 'static {
    /// Starts opening a transport. Progress is reported through the
    /// returned handle's events; must be called inside a tokio runtime.
    fn open(&self, options: TransportOptions) -> TransportHandle;
}

/// Outbound half of a transport. Dropping it stops the transport.
#[derive(Debug)]
pub struct TransportLink {
    commands: mpsc::UnboundedSender<TransportCommand>,
    driver: Option<JoinHandle<()>>,
}

impl TransportLink {
    /// Queues an event for the server. Returns `false` if the transport is
    /// already gone.
    pub fn emit(&self, name: &str, data: Value) -> bool {
        self.commands
            .send(TransportCommand::Emit {
                name: name.to_string(),
                data,
            })
            .is_ok()
    }

    /// Asks the transport to close gracefully and lets it finish on its own.
    pub fn close(mut self) {
        let _ = self.commands.send(TransportCommand::Close);
        self.driver.take();
    }
}

impl Drop for TransportLink {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.take() {
            driver.abort();
        }
    }
}

#[derive(Debug)]
pub struct TransportHandle {
    link: TransportLink,
    events: mpsc::UnboundedReceiver<TransportEvent>,
}

impl TransportHandle {
    pub fn new(
        commands: mpsc::UnboundedSender<TransportCommand>,
        events: mpsc::UnboundedReceiver<TransportEvent>,
        driver: Option<JoinHandle<()>>,
    ) -> Self {
        Self {
            link: TransportLink { commands, driver },
            events,
        }
    }

    pub async fn next_event(&mut self) -> Option<TransportEvent> {
        self.events.recv().await
    }

    pub fn into_parts(self) -> (TransportLink, mpsc::UnboundedReceiver<TransportEvent>) {
        (self.link, self.events)
    }
}
