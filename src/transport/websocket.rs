use super::session::{Session, SessionWriter, INBOUND_QUEUE};
use crate::config::TransportKind;
use crate::error::{ConnectorError, Result};
use crate::protocol::{EnginePacket, OpenHandshake};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::*;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async, tungstenite::protocol::Message, MaybeTlsStream, WebSocketStream,
};
use url::Url;

// Type alias for the WebSocket stream
type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub(crate) struct WsWriter {
    sink: SplitSink<WsStream, Message>,
}

impl WsWriter {
    pub async fn send(&mut self, packet: EnginePacket) -> Result<()> {
        let text = packet.encode();
        trace!("Sending WS frame: {}", text);
        self.sink.send(Message::Text(text)).await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) {
        if let Err(e) = self.sink.send(Message::Close(None)).await {
            debug!("WebSocket close frame not sent: {}", e);
        }
    }
}

/// Opens a WebSocket and completes the engine.io open exchange.
pub(crate) async fn open(url: &Url) -> Result<Session> {
    info!("Connecting to WebSocket: {}", url);
    let (ws_stream, response) = connect_async(url.as_str())
        .await
        .map_err(|e| ConnectorError::WebsocketError(format!("WebSocket connection failed: {}", e)))?;
    debug!("WebSocket upgrade response: {:?}", response.status());

    let (sink, mut read) = ws_stream.split();
    let open = read_open_packet(&mut read).await?;
    info!(
        "Engine.IO session {} open over websocket (ping interval {}ms)",
        open.sid, open.ping_interval
    );

    let (tx, rx) = mpsc::channel(INBOUND_QUEUE);
    let reader = tokio::spawn(read_loop(read, tx));

    Ok(Session::new(
        TransportKind::Websocket,
        open,
        rx,
        SessionWriter::Websocket(WsWriter { sink }),
        reader,
    ))
}

async fn read_open_packet(read: &mut SplitStream<WsStream>) -> Result<OpenHandshake> {
    loop {
        match read.next().await {
            Some(Ok(Message::Text(text))) => {
                return OpenHandshake::from_packet(&EnginePacket::decode(&text)?);
            }
            Some(Ok(Message::Close(frame))) => {
                return Err(ConnectorError::ConnectionFailed(format!(
                    "server closed before open packet: {:?}",
                    frame
                )))
            }
            Some(Ok(Message::Binary(_))) => {
                return Err(ConnectorError::Protocol(
                    "binary frame before open packet".to_string(),
                ))
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(e.into()),
            None => {
                return Err(ConnectorError::ConnectionFailed(
                    "stream ended before open packet".to_string(),
                ))
            }
        }
    }
}

/// Forwards decoded engine.io packets until the socket closes or the owning
/// session goes away.
async fn read_loop(mut read: SplitStream<WsStream>, tx: mpsc::Sender<Result<EnginePacket>>) {
    loop {
        let item = match read.next().await {
            Some(Ok(Message::Text(text))) => {
                trace!("Received WS Text: {}", text);
                EnginePacket::decode(&text)
            }
            Some(Ok(Message::Binary(bin))) => {
                trace!("Ignoring WS Binary frame ({} bytes)", bin.len());
                continue;
            }
            // tungstenite queues the pong reply itself.
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => {
                continue
            }
            Some(Ok(Message::Close(close_frame))) => {
                warn!("Received WS Close frame: {:?}", close_frame);
                break;
            }
            Some(Err(e)) => {
                error!("WebSocket read error: {}", e);
                let _ = tx.send(Err(e.into())).await;
                break;
            }
            None => {
                info!("WebSocket stream ended (read None).");
                break;
            }
        };
        if tx.send(item).await.is_err() {
            break;
        }
    }
    debug!("WebSocket reader task finished.");
}
