use super::registry::{ListenerRegistry, Subscription};
use crate::auth::{build_auth_payload, get_timestamp_ms, TokenStore};
use crate::config::ConnectionConfig;
use crate::error::{ConnectFailure, ConnectorError, Result};
use crate::transport::{
    Connector, SocketIoConnector, TransportEvent, TransportHandle, TransportLink,
    TransportOptions,
};
use crate::types::{
    client_events, server_events, ChatMessage, ConnectOptions, ConnectionEvent,
    ConnectionQuality, ConnectionStats, ConnectionStatus, ConnectionStatusReport, EventKind,
};
use chrono::Utc;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use log::*;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::{sleep, timeout, Instant};

type AttemptResult = std::result::Result<(), ConnectFailure>;
type SharedAttempt = Shared<BoxFuture<'static, AttemptResult>>;

/// A connect attempt in flight. Every caller of `connect` awaits `outcome`.
struct PendingConnect {
    id: u64,
    outcome: SharedAttempt,
    task: AbortHandle,
}

/// A transport that completed its handshake at least once.
struct ActiveTransport {
    id: u64,
    socket_id: String,
    link: TransportLink,
    dispatcher: JoinHandle<()>,
}

impl ActiveTransport {
    /// Stops event delivery first, then closes the transport.
    fn teardown(self) {
        self.dispatcher.abort();
        self.link.close();
    }
}

enum ConnectionState {
    /// `stale` holds a transport that dropped and is running its own
    /// reconnection; a new `connect` tears it down first.
    Disconnected { stale: Option<ActiveTransport> },
    Connecting(PendingConnect),
    Connected(ActiveTransport),
}

#[derive(Default)]
struct StatsTracker {
    stats: ConnectionStats,
    ping_sent_at: Option<Instant>,
}

struct Inner {
    config: ConnectionConfig,
    connector: Arc<dyn Connector>,
    tokens: Arc<dyn TokenStore>,
    state: Mutex<ConnectionState>,
    stats: Mutex<StatsTracker>,
    listeners: ListenerRegistry,
    last_disconnect: Mutex<Option<Instant>>,
    next_id: AtomicU64,
}

/// Owns the app's single real-time connection to the backend.
///
/// Construct one at startup and clone it wherever it is needed; clones share
/// the same connection. Inbound server pushes are re-published as
/// [`ConnectionEvent`]s to listeners registered with [`on`](Self::on).
///
/// ```no_run
/// use fleet_connector_rs::auth::EnvTokenStore;
/// use fleet_connector_rs::config::ConnectionConfig;
/// use fleet_connector_rs::socket::ConnectionManager;
/// use fleet_connector_rs::types::{ConnectOptions, ConnectionEvent, EventKind};
/// use std::sync::Arc;
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let manager = ConnectionManager::new(ConnectionConfig::from_env()?, Arc::new(EnvTokenStore));
///     manager.on(EventKind::OrderStatusUpdated, |event: &ConnectionEvent| {
///         println!("order update: {}", event.payload());
///     });
///     manager.connect(ConnectOptions::default()).await?;
///     manager.join_conversation("conv-1");
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    /// Creates a manager that talks to the backend through the production
    /// Socket.IO connector. No connection is made until [`connect`](Self::connect).
    pub fn new(config: ConnectionConfig, tokens: Arc<dyn TokenStore>) -> Self {
        Self::with_connector(config, tokens, Arc::new(SocketIoConnector::new()))
    }

    /// Creates a manager with a custom [`Connector`], e.g. one sharing a
    /// preconfigured HTTP client or an in-memory transport.
    pub fn with_connector(
        config: ConnectionConfig,
        tokens: Arc<dyn TokenStore>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                connector,
                tokens,
                state: Mutex::new(ConnectionState::Disconnected { stale: None }),
                stats: Mutex::new(StatsTracker::default()),
                listeners: ListenerRegistry::new(),
                last_disconnect: Mutex::new(None),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// The configuration this manager was built with.
    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    // --- Lifecycle ---

    /// Connects if not already connected.
    ///
    /// Concurrent calls share one attempt and all observe its outcome. A call
    /// made shortly after a disconnect waits out the reconnect cooldown
    /// before the handshake starts.
    pub async fn connect(&self, options: ConnectOptions) -> Result<()> {
        let outcome = {
            let mut state = self.inner.state.lock();
            match &*state {
                ConnectionState::Connected(active) => {
                    debug!("Already connected (socket {})", active.socket_id);
                    return Ok(());
                }
                ConnectionState::Connecting(pending) => {
                    debug!("Joining in-flight connect #{}", pending.id);
                    pending.outcome.clone()
                }
                ConnectionState::Disconnected { .. } => {
                    let previous = std::mem::replace(
                        &mut *state,
                        ConnectionState::Disconnected { stale: None },
                    );
                    if let ConnectionState::Disconnected { stale: Some(stale) } = previous {
                        info!("Tearing down stale transport #{}", stale.id);
                        stale.teardown();
                    }

                    let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
                    let task = tokio::spawn(Arc::clone(&self.inner).run_attempt(id, options));
                    let abort = task.abort_handle();
                    let outcome = task
                        .map(|joined| {
                            joined.unwrap_or_else(|e| {
                                Err(ConnectFailure::Failed(if e.is_cancelled() {
                                    "connection attempt cancelled".to_string()
                                } else {
                                    format!("connection attempt panicked: {}", e)
                                }))
                            })
                        })
                        .boxed()
                        .shared();
                    *state = ConnectionState::Connecting(PendingConnect {
                        id,
                        outcome: outcome.clone(),
                        task: abort,
                    });
                    outcome
                }
            }
        };
        outcome.await.map_err(ConnectorError::from)
    }

    /// Tears down the transport, returns to `Disconnected` and removes every
    /// registered listener. Safe to call at any time.
    pub fn disconnect(&self) {
        let previous = std::mem::replace(
            &mut *self.inner.state.lock(),
            ConnectionState::Disconnected { stale: None },
        );
        let tore_down = match previous {
            ConnectionState::Connected(active)
            | ConnectionState::Disconnected {
                stale: Some(active),
            } => {
                info!("Disconnecting socket {}", active.socket_id);
                active.teardown();
                true
            }
            ConnectionState::Connecting(pending) => {
                info!("Cancelling in-flight connect #{}", pending.id);
                pending.task.abort();
                true
            }
            ConnectionState::Disconnected { stale: None } => {
                debug!("Disconnect requested while already disconnected");
                false
            }
        };
        if tore_down {
            *self.inner.last_disconnect.lock() = Some(Instant::now());
        }
        {
            let mut tracker = self.inner.stats.lock();
            tracker.stats.quality = ConnectionQuality::Disconnected;
            tracker.ping_sent_at = None;
        }
        self.inner.listeners.clear();
    }

    // --- Listeners ---

    /// Registers `callback` for every event of `kind`.
    ///
    /// Listeners of the same kind run in registration order. A panicking
    /// listener is logged and skipped. Keep the returned [`Subscription`] to
    /// remove the listener with [`off`](Self::off); `disconnect` removes all
    /// of them.
    pub fn on<F>(&self, kind: EventKind, callback: F) -> Subscription
    where
        F: Fn(&ConnectionEvent) + Send + Sync + 'static,
    {
        self.inner.listeners.subscribe(kind, Arc::new(callback))
    }

    /// Same as [`on`](Self::on) with the string event name (`"connected"`,
    /// `"order-status-updated"`, ...).
    pub fn on_named<F>(&self, name: &str, callback: F) -> Result<Subscription>
    where
        F: Fn(&ConnectionEvent) + Send + Sync + 'static,
    {
        let kind: EventKind = name.parse()?;
        Ok(self.on(kind, callback))
    }

    /// Removes exactly the listener behind `subscription`.
    pub fn off(&self, subscription: &Subscription) -> bool {
        self.inner.listeners.unsubscribe(subscription)
    }

    // --- Sending ---

    /// Fire-and-forget chat message. Returns `false` without touching the
    /// network when not connected.
    pub fn send_chat_message(&self, conversation_id: &str, message: ChatMessage) -> bool {
        let mut payload = match serde_json::to_value(&message) {
            Ok(Value::Object(map)) => map,
            Ok(other) => {
                error!("Chat message serialized to non-object: {}", other);
                return false;
            }
            Err(e) => {
                error!("Failed to serialize chat message: {}", e);
                return false;
            }
        };
        payload.insert("conversationId".to_string(), json!(conversation_id));
        payload
            .entry("clientMessageId".to_string())
            .or_insert_with(|| json!(uuid::Uuid::new_v4().to_string()));
        payload.insert("source".to_string(), json!(self.inner.config.client_type));
        payload.insert("timestamp".to_string(), json!(Utc::now().to_rfc3339()));

        self.emit_if_connected(client_events::SEND_MESSAGE, Value::Object(payload))
    }

    /// Subscribes this socket to a conversation's chat messages. Returns
    /// `false` when not connected.
    pub fn join_conversation(&self, conversation_id: &str) -> bool {
        self.emit_if_connected(
            client_events::JOIN_CONVERSATION,
            json!({ "conversationId": conversation_id }),
        )
    }

    /// Stops receiving a conversation's chat messages. Returns `false` when
    /// not connected.
    pub fn leave_conversation(&self, conversation_id: &str) -> bool {
        self.emit_if_connected(
            client_events::LEAVE_CONVERSATION,
            json!({ "conversationId": conversation_id }),
        )
    }

    /// Sends a liveness probe. The server's `pong` updates the stats and is
    /// re-published as `connection-quality`.
    pub fn ping(&self) -> bool {
        let state = self.inner.state.lock();
        let ConnectionState::Connected(active) = &*state else {
            debug!("Ping skipped: not connected");
            return false;
        };
        {
            let mut tracker = self.inner.stats.lock();
            tracker.ping_sent_at = Some(Instant::now());
            tracker.stats.last_ping = Some(Utc::now());
        }
        active.link.emit(
            client_events::PING,
            json!({ "timestamp": get_timestamp_ms() }),
        )
    }

    fn emit_if_connected(&self, event: &str, data: Value) -> bool {
        let state = self.inner.state.lock();
        match &*state {
            ConnectionState::Connected(active) => {
                let sent = active.link.emit(event, data);
                if !sent {
                    warn!("Transport gone, '{}' not sent", event);
                }
                sent
            }
            _ => {
                warn!("Cannot send '{}': socket not connected", event);
                false
            }
        }
    }

    // --- Status ---

    /// Current lifecycle state.
    pub fn status(&self) -> ConnectionStatus {
        match &*self.inner.state.lock() {
            ConnectionState::Disconnected { .. } => ConnectionStatus::Disconnected,
            ConnectionState::Connecting(_) => ConnectionStatus::Connecting,
            ConnectionState::Connected(_) => ConnectionStatus::Connected,
        }
    }

    /// Shorthand for `status() == ConnectionStatus::Connected`.
    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    /// Snapshot of latency, quality and reconnect count.
    pub fn stats(&self) -> ConnectionStats {
        self.inner.stats.lock().stats.clone()
    }

    /// Status, socket id (when connected) and stats in one report.
    pub fn connection_status(&self) -> ConnectionStatusReport {
        let (status, socket_id) = match &*self.inner.state.lock() {
            ConnectionState::Disconnected { .. } => (ConnectionStatus::Disconnected, None),
            ConnectionState::Connecting(_) => (ConnectionStatus::Connecting, None),
            ConnectionState::Connected(active) => {
                (ConnectionStatus::Connected, Some(active.socket_id.clone()))
            }
        };
        ConnectionStatusReport {
            status,
            socket_id,
            stats: self.stats(),
        }
    }
}

impl Inner {
    fn cooldown_remaining(&self) -> Duration {
        match *self.last_disconnect.lock() {
            Some(at) => self.config.reconnect_cooldown.saturating_sub(at.elapsed()),
            None => Duration::ZERO,
        }
    }

    async fn run_attempt(self: Arc<Self>, id: u64, options: ConnectOptions) -> AttemptResult {
        let wait = self.cooldown_remaining();
        if !wait.is_zero() {
            info!("Recent disconnect, delaying connect #{} by {:?}", id, wait);
            sleep(wait).await;
        }

        let token = match self.tokens.access_token().await {
            Ok(Some(token)) => token,
            Ok(None) => {
                error!("No access token available, cannot connect");
                self.abandon_attempt(id);
                return Err(ConnectFailure::AuthenticationMissing);
            }
            Err(e) => {
                error!("Failed to read access token: {}", e);
                self.abandon_attempt(id);
                return Err(ConnectFailure::AuthenticationMissing);
            }
        };

        let transport_options = TransportOptions {
            endpoint: self.config.endpoint.clone(),
            transports: self.config.transports.clone(),
            reconnection: self.config.reconnection.clone(),
            attempt_timeout: self.config.attempt_timeout,
            auth: build_auth_payload(&token, &self.config.client_type, &options.auth),
        };
        info!(
            "Connect #{}: opening transport to {}:{}",
            id, self.config.endpoint.host, self.config.endpoint.port
        );
        let mut handle = self.connector.open(transport_options);

        let limit = self.config.connect_timeout;
        match timeout(limit, wait_for_handshake(&mut handle)).await {
            Ok(Ok(socket_id)) => self.install(id, socket_id, handle),
            Ok(Err(reason)) => {
                warn!("Connect #{} failed: {}", id, reason);
                drop(handle);
                self.abandon_attempt(id);
                Err(ConnectFailure::Failed(reason))
            }
            Err(_) => {
                warn!("Connect #{} timed out after {:?}", id, limit);
                drop(handle);
                self.abandon_attempt(id);
                Err(ConnectFailure::Timeout(limit))
            }
        }
    }

    fn abandon_attempt(&self, id: u64) {
        let mut state = self.state.lock();
        if matches!(&*state, ConnectionState::Connecting(p) if p.id == id) {
            *state = ConnectionState::Disconnected { stale: None };
        }
    }

    /// Promotes a handshaken transport to the active one and starts event
    /// delivery. Fails if the attempt was superseded meanwhile.
    fn install(self: &Arc<Self>, id: u64, socket_id: String, handle: TransportHandle) -> AttemptResult {
        let (link, events) = handle.into_parts();
        {
            let mut state = self.state.lock();
            let outcome = match &*state {
                ConnectionState::Connecting(p) if p.id == id => p.outcome.clone(),
                _ => {
                    warn!("Connect #{} superseded, closing its transport", id);
                    link.close();
                    return Err(ConnectFailure::Failed(
                        "connection attempt superseded".to_string(),
                    ));
                }
            };
            let dispatcher = tokio::spawn(dispatch_loop(
                Arc::downgrade(self),
                id,
                outcome,
                events,
            ));
            *state = ConnectionState::Connected(ActiveTransport {
                id,
                socket_id: socket_id.clone(),
                link,
                dispatcher,
            });
        }
        self.stats.lock().stats.quality = ConnectionQuality::Good;
        info!("Connected with socket id {}", socket_id);
        self.listeners.dispatch(&ConnectionEvent::Connected {
            socket_id,
            timestamp: Utc::now(),
        });
        Ok(())
    }

    fn handle_transport_event(&self, id: u64, event: TransportEvent) {
        match event {
            TransportEvent::Connect { sid } => {
                let restored = {
                    let mut state = self.state.lock();
                    match std::mem::replace(
                        &mut *state,
                        ConnectionState::Disconnected { stale: None },
                    ) {
                        ConnectionState::Disconnected {
                            stale: Some(mut active),
                        }
                        | ConnectionState::Connected(mut active)
                            if active.id == id =>
                        {
                            active.socket_id = sid.clone();
                            *state = ConnectionState::Connected(active);
                            true
                        }
                        other => {
                            *state = other;
                            false
                        }
                    }
                };
                if !restored {
                    debug!("Ignoring connect from superseded transport #{}", id);
                    return;
                }
                self.stats.lock().stats.quality = ConnectionQuality::Good;
                self.listeners.dispatch(&ConnectionEvent::Connected {
                    socket_id: sid,
                    timestamp: Utc::now(),
                });
            }
            TransportEvent::Disconnect { reason } => {
                {
                    let mut state = self.state.lock();
                    match std::mem::replace(
                        &mut *state,
                        ConnectionState::Disconnected { stale: None },
                    ) {
                        // Keep the transport: it may reconnect on its own.
                        ConnectionState::Connected(active) if active.id == id => {
                            *state = ConnectionState::Disconnected {
                                stale: Some(active),
                            };
                        }
                        other => *state = other,
                    }
                }
                *self.last_disconnect.lock() = Some(Instant::now());
                {
                    let mut tracker = self.stats.lock();
                    tracker.stats.quality = ConnectionQuality::Disconnected;
                    tracker.ping_sent_at = None;
                }
                warn!("Socket disconnected: {}", reason);
                self.listeners.dispatch(&ConnectionEvent::Disconnected {
                    reason,
                    timestamp: Utc::now(),
                });
            }
            TransportEvent::ReconnectAttempt(attempt) => {
                info!("Transport reconnect attempt {}", attempt);
            }
            TransportEvent::Reconnect(attempts) => {
                self.stats.lock().stats.reconnect_count += 1;
                info!("Transport reconnected after {} attempt(s)", attempts);
                self.listeners.dispatch(&ConnectionEvent::Reconnected {
                    attempts,
                    timestamp: Utc::now(),
                });
            }
            TransportEvent::ReconnectFailed => {
                error!("Transport gave up reconnecting");
                let mut state = self.state.lock();
                if matches!(&*state, ConnectionState::Disconnected { stale: Some(a) } if a.id == id)
                {
                    // The driver has already exited; just release the handle.
                    *state = ConnectionState::Disconnected { stale: None };
                }
            }
            TransportEvent::ConnectError(reason) => {
                warn!("Unexpected connect error on live transport: {}", reason);
            }
            TransportEvent::Event { name, data } => {
                if name == server_events::PONG {
                    self.record_pong(&data);
                    return;
                }
                match EventKind::from_server_event(&name)
                    .and_then(|kind| ConnectionEvent::from_server(kind, data))
                {
                    Some(event) => {
                        trace!("Server event '{}' -> '{}'", name, event.kind());
                        self.listeners.dispatch(&event);
                    }
                    None => debug!("Unhandled server event '{}'", name),
                }
            }
        }
    }

    fn record_pong(&self, data: &Value) {
        let snapshot = {
            let mut tracker = self.stats.lock();
            let latency = match tracker.ping_sent_at.take() {
                Some(sent) => sent.elapsed(),
                None => match data.get("latency").and_then(Value::as_u64) {
                    Some(ms) => Duration::from_millis(ms),
                    None => {
                        debug!("Pong without a pending ping, ignoring");
                        return;
                    }
                },
            };
            tracker
                .stats
                .record_latency(latency, self.config.poor_latency_threshold);
            tracker.stats.clone()
        };
        debug!(
            "Latency {:?}ms, quality {:?}",
            snapshot.latency_ms, snapshot.quality
        );
        self.listeners
            .dispatch(&ConnectionEvent::ConnectionQuality(snapshot));
    }
}

async fn wait_for_handshake(handle: &mut TransportHandle) -> std::result::Result<String, String> {
    loop {
        match handle.next_event().await {
            Some(TransportEvent::Connect { sid }) => return Ok(sid),
            Some(TransportEvent::ConnectError(reason)) => return Err(reason),
            Some(other) => debug!("Ignoring {:?} before handshake", other),
            None => return Err("transport closed before handshake".to_string()),
        }
    }
}

/// Delivers transport events for transport `id` until its stream ends.
///
/// Nothing is delivered until the connect attempt that installed the
/// transport has resolved, so listeners never see server pushes ahead of
/// `connect()` returning. If the attempt failed, the events are dropped.
async fn dispatch_loop(
    inner: Weak<Inner>,
    id: u64,
    outcome: SharedAttempt,
    mut events: UnboundedReceiver<TransportEvent>,
) {
    if let Err(failure) = outcome.await {
        debug!("Connect #{} failed ({:?}), dropping its events", id, failure);
        return;
    }
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.handle_transport_event(id, event);
    }
    debug!("Event dispatcher for transport #{} finished", id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::MemoryTokenStore;
    use crate::transport::mock::{MockConnector, Script};
    use crate::transport::TransportCommand;
    use futures_util::future::join_all;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::mpsc;

    fn manager_with(script: Script, token: Option<&str>) -> (ConnectionManager, MockConnector) {
        let connector = MockConnector::new(script);
        let tokens = Arc::new(MemoryTokenStore::new(token.map(str::to_string)));
        let manager = ConnectionManager::with_connector(
            ConnectionConfig::default(),
            tokens,
            Arc::new(connector.clone()),
        );
        (manager, connector)
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..1_000 {
            if condition() {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("condition not reached");
    }

    fn forward(manager: &ConnectionManager, kind: EventKind) -> mpsc::UnboundedReceiver<ConnectionEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        manager.on(kind, move |event: &ConnectionEvent| {
            let _ = tx.send(event.clone());
        });
        rx
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_connects_share_one_transport() {
        let (manager, connector) = manager_with(Script::Silent, Some("tok"));

        let callers = (0..5).map(|_| {
            let manager = manager.clone();
            tokio::spawn(async move { manager.connect(ConnectOptions::default()).await })
        });
        let joined = tokio::spawn(join_all(callers));

        wait_until(|| connector.opened() == 1).await;
        assert_eq!(manager.status(), ConnectionStatus::Connecting);
        connector.with_last(|peer| {
            peer.push(TransportEvent::Connect {
                sid: "sock-A".to_string(),
            })
        });

        for result in joined.await.unwrap() {
            assert!(result.unwrap().is_ok());
        }
        assert_eq!(connector.opened(), 1);
        assert_eq!(
            manager.connection_status().socket_id.as_deref(),
            Some("sock-A")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_when_connected_is_a_no_op() {
        let (manager, connector) = manager_with(Script::Accept, Some("tok"));
        manager.connect(ConnectOptions::default()).await.unwrap();
        manager.connect(ConnectOptions::default()).await.unwrap();
        assert_eq!(connector.opened(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_after_disconnect_waits_for_cooldown() {
        let (manager, connector) = manager_with(Script::Accept, Some("tok"));
        manager.connect(ConnectOptions::default()).await.unwrap();
        manager.disconnect();

        let started = Instant::now();
        manager.connect(ConnectOptions::default()).await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(2));
        assert_eq!(connector.opened(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_only_waits_for_the_remainder() {
        let (manager, _connector) = manager_with(Script::Accept, Some("tok"));
        manager.connect(ConnectOptions::default()).await.unwrap();
        manager.disconnect();
        tokio::time::advance(Duration::from_millis(1_500)).await;

        let started = Instant::now();
        manager.connect(ConnectOptions::default()).await.unwrap();
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(500));
        assert!(waited < Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connected_listener_called_once_with_socket_id() {
        let (manager, _connector) = manager_with(Script::Accept, Some("tok"));
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(Mutex::new(None));
        {
            let calls = Arc::clone(&calls);
            let seen = Arc::clone(&seen);
            manager.on(EventKind::Connected, move |event: &ConnectionEvent| {
                calls.fetch_add(1, Ordering::SeqCst);
                *seen.lock() = Some(event.clone());
            });
        }

        manager.connect(ConnectOptions::default()).await.unwrap();
        manager.connect(ConnectOptions::default()).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        match seen.lock().clone() {
            Some(ConnectionEvent::Connected { socket_id, .. }) => assert_eq!(socket_id, "sock-1"),
            other => panic!("unexpected event {:?}", other),
        }
        let payload = seen.lock().as_ref().map(ConnectionEvent::payload).unwrap();
        assert_eq!(payload["socketId"], "sock-1");
        assert!(payload["timestamp"].is_string());
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_guard_when_disconnected() {
        let (manager, connector) = manager_with(Script::Accept, Some("tok"));
        assert!(!manager.send_chat_message("conv-1", ChatMessage::text("hi")));
        assert!(!manager.join_conversation("conv-1"));
        assert!(!manager.leave_conversation("conv-1"));
        assert!(!manager.ping());
        assert_eq!(connector.opened(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_chat_message_emits_one_frame() {
        let (manager, connector) = manager_with(Script::Accept, Some("tok"));
        manager.connect(ConnectOptions::default()).await.unwrap();

        assert!(manager.send_chat_message("conv-1", ChatMessage::text("Arriving in 5")));

        let commands = connector.with_last(|peer| peer.drain_commands());
        assert_eq!(commands.len(), 1);
        match &commands[0] {
            TransportCommand::Emit { name, data } => {
                assert_eq!(name, "chat:send-message");
                assert_eq!(data["conversationId"], "conv-1");
                assert_eq!(data["content"], "Arriving in 5");
                assert_eq!(data["type"], "text");
                assert_eq!(data["source"], "mobile");
                assert!(data["timestamp"].is_string());
                assert!(data["clientMessageId"].is_string());
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_and_leave_conversation() {
        let (manager, connector) = manager_with(Script::Accept, Some("tok"));
        manager.connect(ConnectOptions::default()).await.unwrap();

        assert!(manager.join_conversation("conv-9"));
        assert!(manager.leave_conversation("conv-9"));

        let commands = connector.with_last(|peer| peer.drain_commands());
        assert_eq!(
            commands,
            vec![
                TransportCommand::Emit {
                    name: "chat:join-conversation".to_string(),
                    data: json!({ "conversationId": "conv-9" }),
                },
                TransportCommand::Emit {
                    name: "chat:leave-conversation".to_string(),
                    data: json!({ "conversationId": "conv-9" }),
                },
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_pong_marks_quality_poor() {
        let (manager, connector) = manager_with(Script::Accept, Some("tok"));
        let mut quality = forward(&manager, EventKind::ConnectionQuality);
        manager.connect(ConnectOptions::default()).await.unwrap();

        assert!(manager.ping());
        tokio::time::advance(Duration::from_millis(1_200)).await;
        connector.with_last(|peer| {
            peer.push(TransportEvent::Event {
                name: "pong".to_string(),
                data: json!({}),
            })
        });

        match quality.recv().await {
            Some(ConnectionEvent::ConnectionQuality(stats)) => {
                assert_eq!(stats.quality, ConnectionQuality::Poor);
                assert!(stats.latency_ms.unwrap() >= 1_200);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(manager.stats().quality, ConnectionQuality::Poor);
        assert!(manager.stats().last_ping.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fast_pong_marks_quality_good() {
        let (manager, connector) = manager_with(Script::Accept, Some("tok"));
        let mut quality = forward(&manager, EventKind::ConnectionQuality);
        manager.connect(ConnectOptions::default()).await.unwrap();

        assert!(manager.ping());
        let ping = connector.with_last(|peer| peer.drain_commands());
        assert!(matches!(&ping[0], TransportCommand::Emit { name, .. } if name == "ping"));

        tokio::time::advance(Duration::from_millis(200)).await;
        connector.with_last(|peer| {
            peer.push(TransportEvent::Event {
                name: "pong".to_string(),
                data: json!({}),
            })
        });

        assert!(quality.recv().await.is_some());
        assert_eq!(manager.stats().quality, ConnectionQuality::Good);
    }

    #[tokio::test(start_paused = true)]
    async fn test_off_removes_only_that_listener() {
        let (manager, connector) = manager_with(Script::Accept, Some("tok"));
        let removed_calls = Arc::new(AtomicUsize::new(0));
        let removed = {
            let removed_calls = Arc::clone(&removed_calls);
            manager.on(EventKind::Notification, move |_event: &ConnectionEvent| {
                removed_calls.fetch_add(1, Ordering::SeqCst);
            })
        };
        let mut kept = forward(&manager, EventKind::Notification);
        manager.connect(ConnectOptions::default()).await.unwrap();

        assert!(manager.off(&removed));
        connector.with_last(|peer| {
            peer.push(TransportEvent::Event {
                name: "notification:new".to_string(),
                data: json!({ "title": "Order delivered" }),
            })
        });

        match kept.recv().await {
            Some(ConnectionEvent::Notification(data)) => {
                assert_eq!(data, json!({ "title": "Order delivered" }))
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(removed_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_on_named_accepts_application_names_only() {
        let (manager, _connector) = manager_with(Script::Accept, Some("tok"));
        let sub = manager
            .on_named("order-driver-assigned", |_event: &ConnectionEvent| {})
            .unwrap();
        assert_eq!(sub.kind(), EventKind::OrderDriverAssigned);
        assert!(matches!(
            manager.on_named("order:driver:assigned", |_event: &ConnectionEvent| {}),
            Err(ConnectorError::UnknownEvent(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_pushes_are_translated() {
        let (manager, connector) = manager_with(Script::Accept, Some("tok"));
        let mut status = forward(&manager, EventKind::OrderStatusUpdated);
        let mut chat = forward(&manager, EventKind::ChatMessageReceived);
        manager.connect(ConnectOptions::default()).await.unwrap();

        connector.with_last(|peer| {
            peer.push(TransportEvent::Event {
                name: "order:status:updated".to_string(),
                data: json!({ "orderId": "o-1", "status": "in_transit" }),
            });
            peer.push(TransportEvent::Event {
                name: "chat:message:new".to_string(),
                data: json!({ "id": "m-1", "content": "hello" }),
            });
            peer.push(TransportEvent::Event {
                name: "something:else".to_string(),
                data: json!(null),
            });
        });

        assert_eq!(
            status.recv().await,
            Some(ConnectionEvent::OrderStatusUpdated(
                json!({ "orderId": "o-1", "status": "in_transit" })
            ))
        );
        assert_eq!(
            chat.recv().await,
            Some(ConnectionEvent::ChatMessageReceived(
                json!({ "id": "m-1", "content": "hello" })
            ))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_token_fails_before_transport() {
        let (manager, connector) = manager_with(Script::Accept, None);
        let err = manager.connect(ConnectOptions::default()).await.unwrap_err();
        assert!(matches!(err, ConnectorError::AuthenticationMissing));
        assert_eq!(connector.opened(), 0);
        assert_eq!(manager.status(), ConnectionStatus::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_timeout() {
        let (manager, connector) = manager_with(Script::Silent, Some("tok"));
        let started = Instant::now();
        let err = manager.connect(ConnectOptions::default()).await.unwrap_err();

        assert!(matches!(err, ConnectorError::ConnectionTimeout(d) if d == Duration::from_secs(15)));
        assert!(started.elapsed() >= Duration::from_secs(15));
        assert_eq!(connector.opened(), 1);
        assert_eq!(
            manager.connection_status().status,
            ConnectionStatus::Disconnected
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_error_surfaces_reason() {
        let (manager, connector) = manager_with(Script::Reject, Some("tok"));
        let err = manager.connect(ConnectOptions::default()).await.unwrap_err();
        assert!(matches!(err, ConnectorError::ConnectionFailed(ref r) if r == "Authentication error"));
        assert_eq!(manager.status(), ConnectionStatus::Disconnected);

        // A later attempt is a fresh one.
        connector.set_script(Script::Accept);
        manager.connect(ConnectOptions::default()).await.unwrap();
        assert_eq!(connector.opened(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_payload_carries_token_and_overrides() {
        let (manager, connector) = manager_with(Script::Accept, Some("secret-token"));
        let mut options = ConnectOptions::default();
        options.auth.insert("role".to_string(), json!("driver"));
        manager.connect(options).await.unwrap();

        let auth = connector.with_last(|peer| peer.options.auth.clone());
        assert_eq!(
            auth,
            json!({ "token": "secret-token", "clientType": "mobile", "role": "driver" })
        );
        let transports = connector.with_last(|peer| peer.options.transports.clone());
        assert_eq!(transports.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_closes_transport_and_clears_listeners() {
        let (manager, connector) = manager_with(Script::Accept, Some("tok"));
        manager.on(EventKind::Notification, |_event: &ConnectionEvent| {});
        manager.connect(ConnectOptions::default()).await.unwrap();

        manager.disconnect();
        assert_eq!(manager.status(), ConnectionStatus::Disconnected);
        assert_eq!(manager.inner.listeners.listener_count(EventKind::Notification), 0);
        assert_eq!(manager.stats().quality, ConnectionQuality::Disconnected);
        let commands = connector.with_last(|peer| peer.drain_commands());
        assert_eq!(commands, vec![TransportCommand::Close]);

        // Second call is harmless.
        manager.disconnect();
        assert_eq!(manager.status(), ConnectionStatus::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_cancels_in_flight_connect() {
        let (manager, connector) = manager_with(Script::Silent, Some("tok"));
        let pending = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.connect(ConnectOptions::default()).await })
        };
        wait_until(|| connector.opened() == 1).await;

        manager.disconnect();
        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, ConnectorError::ConnectionFailed(_)));
        assert_eq!(manager.status(), ConnectionStatus::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_drop_and_recovery_events() {
        let (manager, connector) = manager_with(Script::Accept, Some("tok"));
        let mut disconnected = forward(&manager, EventKind::Disconnected);
        let mut reconnected = forward(&manager, EventKind::Reconnected);
        let mut connected = forward(&manager, EventKind::Connected);
        manager.connect(ConnectOptions::default()).await.unwrap();
        assert!(connected.recv().await.is_some());

        connector.with_last(|peer| {
            peer.push(TransportEvent::Disconnect {
                reason: "transport close".to_string(),
            })
        });
        match disconnected.recv().await {
            Some(ConnectionEvent::Disconnected { reason, .. }) => assert_eq!(reason, "transport close"),
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(manager.status(), ConnectionStatus::Disconnected);
        assert_eq!(manager.stats().quality, ConnectionQuality::Disconnected);
        assert!(!manager.join_conversation("conv-1"));

        connector.with_last(|peer| {
            peer.push(TransportEvent::ReconnectAttempt(1));
            peer.push(TransportEvent::Reconnect(2));
            peer.push(TransportEvent::Connect {
                sid: "sock-9".to_string(),
            });
        });
        match reconnected.recv().await {
            Some(ConnectionEvent::Reconnected { attempts, .. }) => assert_eq!(attempts, 2),
            other => panic!("unexpected event {:?}", other),
        }
        assert!(connected.recv().await.is_some());
        assert!(manager.is_connected());
        assert_eq!(manager.stats().reconnect_count, 1);
        assert_eq!(
            manager.connection_status().socket_id.as_deref(),
            Some("sock-9")
        );
        assert_eq!(connector.opened(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_replaces_stale_transport() {
        let (manager, connector) = manager_with(Script::Accept, Some("tok"));
        let mut disconnected = forward(&manager, EventKind::Disconnected);
        manager.connect(ConnectOptions::default()).await.unwrap();

        connector.with_last(|peer| {
            peer.push(TransportEvent::Disconnect {
                reason: "ping timeout".to_string(),
            })
        });
        assert!(disconnected.recv().await.is_some());

        let started = Instant::now();
        manager.connect(ConnectOptions::default()).await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(2));
        assert_eq!(connector.opened(), 2);
        assert!(manager.is_connected());
        assert_eq!(
            manager.connection_status().socket_id.as_deref(),
            Some("sock-2")
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_server_push_waits_for_connect_to_resolve() {
        let (manager, connector) = manager_with(Script::Silent, Some("tok"));
        let order = Arc::new(Mutex::new(Vec::new()));
        {
            let order = Arc::clone(&order);
            manager.on(EventKind::Connected, move |_event: &ConnectionEvent| {
                // A slow listener keeps the connect attempt busy.
                std::thread::sleep(Duration::from_millis(200));
                order.lock().push("connected");
            });
        }
        {
            let order = Arc::clone(&order);
            manager.on(EventKind::Notification, move |_event: &ConnectionEvent| {
                order.lock().push("notification");
            });
        }
        let mut notifications = forward(&manager, EventKind::Notification);

        let pending = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.connect(ConnectOptions::default()).await })
        };
        for _ in 0..500 {
            if connector.opened() == 1 {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(connector.opened(), 1);

        connector.with_last(|peer| {
            peer.push(TransportEvent::Connect {
                sid: "sock-fast".to_string(),
            });
            peer.push(TransportEvent::Event {
                name: "notification:new".to_string(),
                data: json!({ "title": "New order" }),
            });
        });

        pending.await.unwrap().unwrap();
        let delivered = timeout(Duration::from_secs(5), notifications.recv())
            .await
            .unwrap();
        assert!(delivered.is_some());
        assert_eq!(*order.lock(), vec!["connected", "notification"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_failed_releases_stale_transport() {
        let (manager, connector) = manager_with(Script::Accept, Some("tok"));
        let mut disconnected = forward(&manager, EventKind::Disconnected);
        manager.connect(ConnectOptions::default()).await.unwrap();

        connector.with_last(|peer| {
            peer.push(TransportEvent::Disconnect {
                reason: "transport close".to_string(),
            });
            peer.push(TransportEvent::ReconnectAttempt(1));
            peer.push(TransportEvent::ReconnectFailed);
        });
        assert!(disconnected.recv().await.is_some());
        wait_until(|| {
            matches!(
                &*manager.inner.state.lock(),
                ConnectionState::Disconnected { stale: None }
            )
        })
        .await;

        // The released transport can no longer bring the manager back.
        connector.with_last(|peer| {
            peer.push(TransportEvent::Connect {
                sid: "sock-late".to_string(),
            })
        });
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        assert!(!manager.is_connected());
        assert_eq!(manager.stats().reconnect_count, 0);
    }
}
