use crate::error::ConnectorError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

// --- Wire event names ---

/// Events pushed by the backend.
pub mod server_events {
    pub const NOTIFICATION_NEW: &str = "notification:new";
    pub const ORDER_STATUS_UPDATED: &str = "order:status:updated";
    pub const ORDER_LOCATION_UPDATED: &str = "order:location:updated";
    pub const ORDER_DRIVER_ASSIGNED: &str = "order:driver:assigned";
    pub const CHAT_MESSAGE_NEW: &str = "chat:message:new";
    pub const CHAT_MESSAGE_SENT: &str = "chat:message:sent";
    pub const PONG: &str = "pong";
}

/// Events emitted by the app.
pub mod client_events {
    pub const JOIN_CONVERSATION: &str = "chat:join-conversation";
    pub const LEAVE_CONVERSATION: &str = "chat:leave-conversation";
    pub const SEND_MESSAGE: &str = "chat:send-message";
    pub const PING: &str = "ping";
}

// --- Application events ---

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    Connected,
    Disconnected,
    Reconnected,
    ConnectionQuality,
    Notification,
    OrderStatusUpdated,
    OrderLocationUpdated,
    OrderDriverAssigned,
    ChatMessageReceived,
    ChatMessageSent,
}

impl EventKind {
    pub const ALL: [EventKind; 10] = [
        EventKind::Connected,
        EventKind::Disconnected,
        EventKind::Reconnected,
        EventKind::ConnectionQuality,
        EventKind::Notification,
        EventKind::OrderStatusUpdated,
        EventKind::OrderLocationUpdated,
        EventKind::OrderDriverAssigned,
        EventKind::ChatMessageReceived,
        EventKind::ChatMessageSent,
    ];

    /// Name used by listeners that subscribe by string.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Connected => "connected",
            EventKind::Disconnected => "disconnected",
            EventKind::Reconnected => "reconnected",
            EventKind::ConnectionQuality => "connection-quality",
            EventKind::Notification => "notification",
            EventKind::OrderStatusUpdated => "order-status-updated",
            EventKind::OrderLocationUpdated => "order-location-updated",
            EventKind::OrderDriverAssigned => "order-driver-assigned",
            EventKind::ChatMessageReceived => "chat-message-received",
            EventKind::ChatMessageSent => "chat-message-sent",
        }
    }

    /// Maps a server push to the application event it is re-published as.
    pub fn from_server_event(name: &str) -> Option<Self> {
        match name {
            server_events::NOTIFICATION_NEW => Some(EventKind::Notification),
            server_events::ORDER_STATUS_UPDATED => Some(EventKind::OrderStatusUpdated),
            server_events::ORDER_LOCATION_UPDATED => Some(EventKind::OrderLocationUpdated),
            server_events::ORDER_DRIVER_ASSIGNED => Some(EventKind::OrderDriverAssigned),
            server_events::CHAT_MESSAGE_NEW => Some(EventKind::ChatMessageReceived),
            server_events::CHAT_MESSAGE_SENT => Some(EventKind::ChatMessageSent),
            _ => None,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = ConnectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| ConnectorError::UnknownEvent(s.to_string()))
    }
}

/// An event delivered to application listeners.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    Connected {
        socket_id: String,
        timestamp: DateTime<Utc>,
    },
    Disconnected {
        reason: String,
        timestamp: DateTime<Utc>,
    },
    Reconnected {
        attempts: u32,
        timestamp: DateTime<Utc>,
    },
    ConnectionQuality(ConnectionStats),
    Notification(Value),
    OrderStatusUpdated(Value),
    OrderLocationUpdated(Value),
    OrderDriverAssigned(Value),
    ChatMessageReceived(Value),
    ChatMessageSent(Value),
}

impl ConnectionEvent {
    /// Wraps a server push payload, unmodified, in its event variant.
    /// Lifecycle kinds are not server pushes and yield `None`.
    pub fn from_server(kind: EventKind, data: Value) -> Option<Self> {
        Some(match kind {
            EventKind::Notification => ConnectionEvent::Notification(data),
            EventKind::OrderStatusUpdated => ConnectionEvent::OrderStatusUpdated(data),
            EventKind::OrderLocationUpdated => ConnectionEvent::OrderLocationUpdated(data),
            EventKind::OrderDriverAssigned => ConnectionEvent::OrderDriverAssigned(data),
            EventKind::ChatMessageReceived => ConnectionEvent::ChatMessageReceived(data),
            EventKind::ChatMessageSent => ConnectionEvent::ChatMessageSent(data),
            EventKind::Connected
            | EventKind::Disconnected
            | EventKind::Reconnected
            | EventKind::ConnectionQuality => return None,
        })
    }

    pub fn kind(&self) -> EventKind {
        match self {
            ConnectionEvent::Connected { .. } => EventKind::Connected,
            ConnectionEvent::Disconnected { .. } => EventKind::Disconnected,
            ConnectionEvent::Reconnected { .. } => EventKind::Reconnected,
            ConnectionEvent::ConnectionQuality(_) => EventKind::ConnectionQuality,
            ConnectionEvent::Notification(_) => EventKind::Notification,
            ConnectionEvent::OrderStatusUpdated(_) => EventKind::OrderStatusUpdated,
            ConnectionEvent::OrderLocationUpdated(_) => EventKind::OrderLocationUpdated,
            ConnectionEvent::OrderDriverAssigned(_) => EventKind::OrderDriverAssigned,
            ConnectionEvent::ChatMessageReceived(_) => EventKind::ChatMessageReceived,
            ConnectionEvent::ChatMessageSent(_) => EventKind::ChatMessageSent,
        }
    }

    /// JSON view of the event payload, for listeners that forward events
    /// somewhere untyped (e.g. a JS bridge).
    pub fn payload(&self) -> Value {
        match self {
            ConnectionEvent::Connected {
                socket_id,
                timestamp,
            } => serde_json::json!({ "socketId": socket_id, "timestamp": timestamp.to_rfc3339() }),
            ConnectionEvent::Disconnected { reason, timestamp } => {
                serde_json::json!({ "reason": reason, "timestamp": timestamp.to_rfc3339() })
            }
            ConnectionEvent::Reconnected {
                attempts,
                timestamp,
            } => serde_json::json!({ "attempts": attempts, "timestamp": timestamp.to_rfc3339() }),
            ConnectionEvent::ConnectionQuality(stats) => {
                serde_json::to_value(stats).unwrap_or(Value::Null)
            }
            ConnectionEvent::Notification(data)
            | ConnectionEvent::OrderStatusUpdated(data)
            | ConnectionEvent::OrderLocationUpdated(data)
            | ConnectionEvent::OrderDriverAssigned(data)
            | ConnectionEvent::ChatMessageReceived(data)
            | ConnectionEvent::ChatMessageSent(data) => data.clone(),
        }
    }
}

// --- Connection status ---

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionQuality {
    Good,
    Poor,
    Disconnected,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStats {
    pub last_ping: Option<DateTime<Utc>>,
    pub latency_ms: Option<u64>,
    pub reconnect_count: u32,
    pub quality: ConnectionQuality,
}

impl ConnectionStats {
    /// Records a measured round trip and re-derives the quality label.
    pub fn record_latency(&mut self, latency: Duration, poor_threshold: Duration) {
        self.latency_ms = Some(latency.as_millis() as u64);
        self.quality = if latency > poor_threshold {
            ConnectionQuality::Poor
        } else {
            ConnectionQuality::Good
        };
    }
}

impl Default for ConnectionStats {
    fn default() -> Self {
        Self {
            last_ping: None,
            latency_ms: None,
            reconnect_count: 0,
            quality: ConnectionQuality::Disconnected,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatusReport {
    pub status: ConnectionStatus,
    pub socket_id: Option<String>,
    pub stats: ConnectionStats,
}

// --- Request structs ---

/// Per-call options for `connect`.
#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    /// Extra fields merged into the auth payload (after `token` and
    /// `clientType`).
    pub auth: Map<String, Value>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub content: String,
    #[serde(rename = "type", default = "default_message_type")]
    pub message_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Value>,
    /// Any other fields the app wants to forward untouched.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_message_type() -> String {
    "text".to_string()
}

impl ChatMessage {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            message_type: default_message_type(),
            client_message_id: None,
            attachments: Vec::new(),
            extra: Map::new(),
        }
    }
}
