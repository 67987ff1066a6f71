//! HTTP long-polling fallback for networks that block WebSocket upgrades.

use super::session::{Session, SessionWriter, INBOUND_QUEUE};
use crate::config::TransportKind;
use crate::error::{ConnectorError, Result};
use crate::protocol::engineio::{
    decode_payload, encode_payload, EnginePacket, EnginePacketType, OpenHandshake,
};
use log::*;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client as HttpClient;
use tokio::sync::mpsc;
use url::Url;

const TEXT_CONTENT_TYPE: &str = "text/plain;charset=UTF-8";

pub(crate) struct PollingWriter {
    http: HttpClient,
    url: Url,
}

impl PollingWriter {
    pub async fn send(&mut self, packet: EnginePacket) -> Result<()> {
        self.send_all(std::slice::from_ref(&packet)).await
    }

    /// Posts all packets in one request body.
    pub async fn send_all(&mut self, packets: &[EnginePacket]) -> Result<()> {
        trace!("POST {} packet(s)", packets.len());
        self.http
            .post(self.url.clone())
            .header(CONTENT_TYPE, TEXT_CONTENT_TYPE)
            .body(encode_payload(packets))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// Opens a polling session: the first GET returns the open packet, later
/// GETs carry the session id and block until the server has data.
pub(crate) async fn open(http: &HttpClient, url: &Url) -> Result<Session> {
    info!("Opening polling session: {}", url);
    let packets = fetch(http, url).await?;
    let mut packets = packets.into_iter();
    let first = packets.next().ok_or_else(|| {
        ConnectorError::Protocol("empty polling handshake response".to_string())
    })?;
    let open = OpenHandshake::from_packet(&first)?;
    info!(
        "Engine.IO session {} open over polling (ping interval {}ms)",
        open.sid, open.ping_interval
    );

    let mut session_url = url.clone();
    session_url.query_pairs_mut().append_pair("sid", &open.sid);

    let (tx, rx) = mpsc::channel(INBOUND_QUEUE);
    for packet in packets {
        // Anything bundled after the open packet is delivered first.
        if tx.send(Ok(packet)).await.is_err() {
            break;
        }
    }
    let reader = tokio::spawn(poll_loop(http.clone(), session_url.clone(), tx));

    Ok(Session::new(
        TransportKind::Polling,
        open,
        rx,
        SessionWriter::Polling(PollingWriter {
            http: http.clone(),
            url: session_url,
        }),
        reader,
    ))
}

async fn fetch(http: &HttpClient, url: &Url) -> Result<Vec<EnginePacket>> {
    let body = http
        .get(url.clone())
        .send()
        .await?
        .error_for_status()?
        .text()
        .await?;
    decode_payload(&body)
}

async fn poll_loop(http: HttpClient, url: Url, tx: mpsc::Sender<Result<EnginePacket>>) {
    loop {
        match fetch(&http, &url).await {
            Ok(packets) => {
                for packet in packets {
                    let closing = packet.kind == EnginePacketType::Close;
                    if tx.send(Ok(packet)).await.is_err() || closing {
                        debug!("Polling reader task finished.");
                        return;
                    }
                }
            }
            Err(e) => {
                error!("Polling request failed: {}", e);
                let _ = tx.send(Err(e)).await;
                return;
            }
        }
    }
}
