use super::reason;
use super::session::Session;
use super::{
    polling, websocket, Connector, TransportCommand, TransportEvent, TransportHandle,
    TransportOptions,
};
use crate::config::TransportKind;
use crate::error::{ConnectorError, Result};
use crate::protocol::socketio::{event_payload, DEFAULT_NAMESPACE};
use crate::protocol::{EnginePacket, EnginePacketType, SocketPacket};
use log::*;
use reqwest::Client as HttpClient;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time::{sleep, timeout, Instant};

/// Opens Socket.IO transports against the backend.
#[derive(Debug, Clone, Default)]
pub struct SocketIoConnector {
    http: HttpClient,
}

impl SocketIoConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_http_client(http: HttpClient) -> Self {
        Self { http }
    }
}

impl Connector for SocketIoConnector {
    fn open(&self, options: TransportOptions) -> TransportHandle {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (evt_tx, evt_rx) = mpsc::unbounded_channel();
        let driver = tokio::spawn(run(options, self.http.clone(), cmd_rx, evt_tx));
        TransportHandle::new(cmd_tx, evt_rx, Some(driver))
    }
}

/// How a live session ended.
enum SessionEnd {
    ClosedByClient,
    Lost(&'static str),
}

fn notify(events: &UnboundedSender<TransportEvent>, event: TransportEvent) {
    if events.send(event).is_err() {
        trace!("Transport owner gone, event dropped");
    }
}

/// Drives one transport for its whole life: initial handshake, live
/// traffic, and built-in reconnection after unexpected drops.
async fn run(
    options: TransportOptions,
    http: HttpClient,
    mut commands: UnboundedReceiver<TransportCommand>,
    events: UnboundedSender<TransportEvent>,
) {
    let (mut session, sid) = match establish(&options, &http).await {
        Ok(established) => established,
        Err(e) => {
            warn!("[Transport] Initial connection failed: {}", e);
            notify(&events, TransportEvent::ConnectError(failure_reason(e)));
            return;
        }
    };
    notify(&events, TransportEvent::Connect { sid });

    loop {
        match pump(&mut session, &mut commands, &events).await {
            SessionEnd::ClosedByClient => break,
            SessionEnd::Lost(why) => {
                drop(session);
                notify(
                    &events,
                    TransportEvent::Disconnect {
                        reason: why.to_string(),
                    },
                );
                if why == reason::SERVER_DISCONNECT || !options.reconnection.enabled {
                    info!("[Transport] Not reconnecting after '{}'", why);
                    break;
                }
                match reconnect(&options, &http, &mut commands, &events).await {
                    Some(next) => session = next,
                    None => break,
                }
            }
        }
    }
    info!("[Transport] Task finished.");
}

fn failure_reason(e: ConnectorError) -> String {
    match e {
        ConnectorError::ConnectionFailed(reason) => reason,
        other => other.to_string(),
    }
}

/// One connection attempt: every configured transport in order, all within
/// the per-attempt timeout.
async fn establish(options: &TransportOptions, http: &HttpClient) -> Result<(Session, String)> {
    let attempt = async {
        let mut last_error =
            ConnectorError::Config("no transports configured".to_string());
        for kind in &options.transports {
            match open_kind(*kind, options, http).await {
                Ok(established) => return Ok(established),
                Err(e) => {
                    warn!("[Transport] {} transport failed: {}", kind.as_str(), e);
                    last_error = e;
                }
            }
        }
        Err(last_error)
    };
    match timeout(options.attempt_timeout, attempt).await {
        Ok(result) => result,
        Err(_) => Err(ConnectorError::ConnectionFailed("timeout".to_string())),
    }
}

async fn open_kind(
    kind: TransportKind,
    options: &TransportOptions,
    http: &HttpClient,
) -> Result<(Session, String)> {
    let url = options.endpoint.transport_url(kind)?;
    let mut session = match kind {
        TransportKind::Websocket => websocket::open(&url).await?,
        TransportKind::Polling => polling::open(http, &url).await?,
    };
    let sid = session.handshake(&options.auth).await?;
    info!(
        "[Transport] Socket {} connected over {}",
        sid,
        session.kind.as_str()
    );
    Ok((session, sid))
}

/// Moves traffic between the session and the owner until the session ends.
async fn pump(
    session: &mut Session,
    commands: &mut UnboundedReceiver<TransportCommand>,
    events: &UnboundedSender<TransportEvent>,
) -> SessionEnd {
    let ping_deadline = session.ping_deadline();
    let deadline = sleep(ping_deadline);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            incoming = session.recv() => match incoming {
                Some(Ok(packet)) => match packet.kind {
                    EnginePacketType::Ping => {
                        deadline.as_mut().reset(Instant::now() + ping_deadline);
                        if let Err(e) = session.send(EnginePacket::pong()).await {
                            error!("[Transport] Failed to answer ping: {}", e);
                            return SessionEnd::Lost(reason::TRANSPORT_ERROR);
                        }
                    }
                    EnginePacketType::Message => match SocketPacket::decode(&packet.data) {
                        Ok(SocketPacket::Event { namespace, name, .. }) if namespace != DEFAULT_NAMESPACE => {
                            debug!("[Transport] Dropping '{}' from namespace {}", name, namespace);
                        }
                        Ok(SocketPacket::Event { name, args, .. }) => {
                            notify(events, TransportEvent::Event { name, data: event_payload(args) });
                        }
                        Ok(SocketPacket::Disconnect { namespace }) if namespace != DEFAULT_NAMESPACE => {
                            debug!("[Transport] Ignoring disconnect of namespace {}", namespace);
                        }
                        Ok(SocketPacket::Disconnect { .. }) => {
                            return SessionEnd::Lost(reason::SERVER_DISCONNECT);
                        }
                        Ok(other) => debug!("[Transport] Ignoring packet {:?}", other),
                        Err(e) => warn!("[Transport] Dropping undecodable packet: {}", e),
                    },
                    EnginePacketType::Close => return SessionEnd::Lost(reason::TRANSPORT_CLOSE),
                    other => trace!("[Transport] Ignoring engine.io {:?}", other),
                },
                Some(Err(e)) => {
                    warn!("[Transport] Read failed: {}", e);
                    return SessionEnd::Lost(reason::TRANSPORT_ERROR);
                }
                None => return SessionEnd::Lost(reason::TRANSPORT_CLOSE),
            },
            command = commands.recv() => match command {
                Some(TransportCommand::Emit { name, data }) => {
                    if let Err(e) = session.emit(&name, data).await {
                        error!("[Transport] Failed to emit '{}': {}", name, e);
                        return SessionEnd::Lost(reason::TRANSPORT_ERROR);
                    }
                }
                Some(TransportCommand::Close) | None => {
                    info!("[Transport] Closing ({})", reason::CLIENT_DISCONNECT);
                    session.close().await;
                    return SessionEnd::ClosedByClient;
                }
            },
            _ = &mut deadline => {
                warn!("[Transport] No ping from server within {:?}", ping_deadline);
                return SessionEnd::Lost(reason::PING_TIMEOUT);
            }
        }
    }
}

/// Built-in reconnection with randomized exponential backoff. Returns the new
/// session, or `None` when attempts are exhausted or the owner closed us.
async fn reconnect(
    options: &TransportOptions,
    http: &HttpClient,
    commands: &mut UnboundedReceiver<TransportCommand>,
    events: &UnboundedSender<TransportEvent>,
) -> Option<Session> {
    let policy = &options.reconnection;
    for attempt in 1..=policy.max_attempts {
        let delay = policy.backoff(attempt);
        notify(events, TransportEvent::ReconnectAttempt(attempt));
        warn!(
            "[Transport] Reconnect attempt {}/{} in {:?}",
            attempt, policy.max_attempts, delay
        );

        let wait = sleep(delay);
        tokio::pin!(wait);
        loop {
            tokio::select! {
                _ = &mut wait => break,
                command = commands.recv() => match command {
                    Some(TransportCommand::Emit { name, .. }) => {
                        debug!("[Transport] Dropping '{}' while reconnecting", name);
                    }
                    Some(TransportCommand::Close) | None => return None,
                },
            }
        }

        match establish(options, http).await {
            Ok((session, sid)) => {
                info!("[Transport] Reconnected after {} attempt(s)", attempt);
                notify(events, TransportEvent::Reconnect(attempt));
                notify(events, TransportEvent::Connect { sid });
                return Some(session);
            }
            Err(e) => warn!("[Transport] Reconnect attempt {} failed: {}", attempt, e),
        }
    }
    error!(
        "[Transport] Max reconnect attempts ({}) reached. Giving up.",
        policy.max_attempts
    );
    notify(events, TransportEvent::ReconnectFailed);
    None
}
