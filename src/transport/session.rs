//! An open engine.io session, independent of the underlying transport.

use super::polling::PollingWriter;
use super::websocket::WsWriter;
use crate::config::TransportKind;
use crate::error::{ConnectorError, Result};
use crate::protocol::socketio::connect_error_reason;
use crate::protocol::{EnginePacket, EnginePacketType, OpenHandshake, SocketPacket};
use log::*;
use serde_json::Value;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Capacity of the inbound packet queue fed by a session's reader task.
pub(crate) const INBOUND_QUEUE: usize = 64;

pub(crate) enum SessionWriter {
    Websocket(WsWriter),
    Polling(PollingWriter),
}

pub(crate) struct Session {
    pub kind: TransportKind,
    pub open: OpenHandshake,
    incoming: mpsc::Receiver<Result<EnginePacket>>,
    writer: SessionWriter,
    reader: JoinHandle<()>,
}

impl Session {
    pub(crate) fn new(
        kind: TransportKind,
        open: OpenHandshake,
        incoming: mpsc::Receiver<Result<EnginePacket>>,
        writer: SessionWriter,
        reader: JoinHandle<()>,
    ) -> Self {
        Self {
            kind,
            open,
            incoming,
            writer,
            reader,
        }
    }

    pub fn ping_deadline(&self) -> Duration {
        self.open.ping_deadline()
    }

    /// Next packet from the server; `None` once the reader has stopped.
    pub async fn recv(&mut self) -> Option<Result<EnginePacket>> {
        self.incoming.recv().await
    }

    pub async fn send(&mut self, packet: EnginePacket) -> Result<()> {
        match &mut self.writer {
            SessionWriter::Websocket(writer) => writer.send(packet).await,
            SessionWriter::Polling(writer) => writer.send(packet).await,
        }
    }

    /// Sends packets in order; polling sessions batch them into one request.
    pub async fn send_all(&mut self, packets: Vec<EnginePacket>) -> Result<()> {
        match &mut self.writer {
            SessionWriter::Websocket(writer) => {
                for packet in packets {
                    writer.send(packet).await?;
                }
                Ok(())
            }
            SessionWriter::Polling(writer) => writer.send_all(&packets).await,
        }
    }

    pub async fn emit(&mut self, name: &str, data: Value) -> Result<()> {
        let encoded = SocketPacket::event(name, data).encode()?;
        self.send(EnginePacket::message(encoded)).await
    }

    /// Best-effort graceful close: tells the server we are leaving and stops
    /// the reader.
    pub async fn close(&mut self) {
        let disconnect = SocketPacket::Disconnect {
            namespace: crate::protocol::socketio::DEFAULT_NAMESPACE.to_string(),
        };
        let mut farewell = Vec::with_capacity(2);
        if let Ok(encoded) = disconnect.encode() {
            farewell.push(EnginePacket::message(encoded));
        }
        farewell.push(EnginePacket::close());
        if let Err(e) = self.send_all(farewell).await {
            debug!("Close packets not delivered: {}", e);
        }
        if let SessionWriter::Websocket(writer) = &mut self.writer {
            writer.shutdown().await;
        }
        self.reader.abort();
    }

    /// Performs the Socket.IO CONNECT exchange on a fresh engine session and
    /// returns the socket id assigned by the server.
    pub async fn handshake(&mut self, auth: &Value) -> Result<String> {
        let connect = SocketPacket::connect(auth.clone()).encode()?;
        self.send(EnginePacket::message(connect)).await?;

        loop {
            let packet = match self.recv().await {
                Some(packet) => packet?,
                None => {
                    return Err(ConnectorError::ConnectionFailed(
                        super::reason::TRANSPORT_CLOSE.to_string(),
                    ))
                }
            };
            match packet.kind {
                EnginePacketType::Ping => self.send(EnginePacket::pong()).await?,
                EnginePacketType::Message => match SocketPacket::decode(&packet.data)? {
                    SocketPacket::Connect { data, .. } => {
                        let sid = data
                            .as_ref()
                            .and_then(|d| d.get("sid"))
                            .and_then(Value::as_str)
                            .ok_or_else(|| {
                                ConnectorError::Protocol(
                                    "connect ack without socket id".to_string(),
                                )
                            })?;
                        return Ok(sid.to_string());
                    }
                    SocketPacket::ConnectError { data, .. } => {
                        return Err(ConnectorError::ConnectionFailed(connect_error_reason(
                            &data,
                        )));
                    }
                    other => debug!("Ignoring packet before connect ack: {:?}", other),
                },
                EnginePacketType::Close => {
                    return Err(ConnectorError::ConnectionFailed(
                        super::reason::TRANSPORT_CLOSE.to_string(),
                    ))
                }
                _ => trace!("Ignoring engine.io {:?} during handshake", packet.kind),
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.reader.abort();
    }
}
