//! Engine.IO v4 packet codec (text framing only).

use crate::error::{ConnectorError, Result};
use serde::Deserialize;
use std::time::Duration;

/// Separator between packets in a polling payload.
pub const RECORD_SEPARATOR: &str = "\u{1e}";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnginePacketType {
    Open,
    Close,
    Ping,
    Pong,
    Message,
    Upgrade,
    Noop,
}

impl EnginePacketType {
    fn as_char(self) -> char {
        match self {
            EnginePacketType::Open => '0',
            EnginePacketType::Close => '1',
            EnginePacketType::Ping => '2',
            EnginePacketType::Pong => '3',
            EnginePacketType::Message => '4',
            EnginePacketType::Upgrade => '5',
            EnginePacketType::Noop => '6',
        }
    }

    fn from_char(c: char) -> Result<Self> {
        Ok(match c {
            '0' => EnginePacketType::Open,
            '1' => EnginePacketType::Close,
            '2' => EnginePacketType::Ping,
            '3' => EnginePacketType::Pong,
            '4' => EnginePacketType::Message,
            '5' => EnginePacketType::Upgrade,
            '6' => EnginePacketType::Noop,
            'b' => {
                return Err(ConnectorError::Protocol(
                    "binary engine.io packets are not supported".to_string(),
                ))
            }
            other => {
                return Err(ConnectorError::Protocol(format!(
                    "unknown engine.io packet type '{}'",
                    other
                )))
            }
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnginePacket {
    pub kind: EnginePacketType,
    pub data: String,
}

impl EnginePacket {
    pub fn new(kind: EnginePacketType, data: impl Into<String>) -> Self {
        Self {
            kind,
            data: data.into(),
        }
    }

    pub fn message(data: impl Into<String>) -> Self {
        Self::new(EnginePacketType::Message, data)
    }

    pub fn pong() -> Self {
        Self::new(EnginePacketType::Pong, "")
    }

    pub fn close() -> Self {
        Self::new(EnginePacketType::Close, "")
    }

    pub fn encode(&self) -> String {
        let mut out = String::with_capacity(self.data.len() + 1);
        out.push(self.kind.as_char());
        out.push_str(&self.data);
        out
    }

    pub fn decode(raw: &str) -> Result<Self> {
        let mut chars = raw.chars();
        let first = chars
            .next()
            .ok_or_else(|| ConnectorError::Protocol("empty engine.io packet".to_string()))?;
        let kind = EnginePacketType::from_char(first)?;
        Ok(Self {
            kind,
            data: chars.as_str().to_string(),
        })
    }
}

/// Joins packets into a single polling request body.
pub fn encode_payload(packets: &[EnginePacket]) -> String {
    packets
        .iter()
        .map(EnginePacket::encode)
        .collect::<Vec<_>>()
        .join(RECORD_SEPARATOR)
}

/// Splits a polling response body into packets.
pub fn decode_payload(body: &str) -> Result<Vec<EnginePacket>> {
    body.split(RECORD_SEPARATOR)
        .filter(|chunk| !chunk.is_empty())
        .map(EnginePacket::decode)
        .collect()
}

/// Data carried by the server's open packet.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenHandshake {
    pub sid: String,
    #[serde(default)]
    pub upgrades: Vec<String>,
    pub ping_interval: u64,
    pub ping_timeout: u64,
    #[serde(default)]
    pub max_payload: Option<u64>,
}

impl OpenHandshake {
    pub fn from_packet(packet: &EnginePacket) -> Result<Self> {
        if packet.kind != EnginePacketType::Open {
            return Err(ConnectorError::Protocol(format!(
                "expected engine.io open packet, got {:?}",
                packet.kind
            )));
        }
        Ok(serde_json::from_str(&packet.data)?)
    }

    /// How long the client waits for a server ping before declaring the
    /// connection dead.
    pub fn ping_deadline(&self) -> Duration {
        Duration::from_millis(self.ping_interval + self.ping_timeout)
    }
}
