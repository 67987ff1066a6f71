//! In-memory connector used by the manager tests.

use super::{Connector, TransportCommand, TransportEvent, TransportHandle, TransportOptions};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;

/// The test's end of a transport opened by [`MockConnector`].
pub(crate) struct MockPeer {
    pub options: TransportOptions,
    pub events: mpsc::UnboundedSender<TransportEvent>,
    pub commands: mpsc::UnboundedReceiver<TransportCommand>,
}

impl MockPeer {
    pub fn push(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    pub fn drain_commands(&mut self) -> Vec<TransportCommand> {
        let mut out = Vec::new();
        while let Ok(command) = self.commands.try_recv() {
            out.push(command);
        }
        out
    }
}

/// What a freshly opened transport does on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Script {
    /// Reports `Connect` immediately with a numbered socket id.
    Accept,
    /// Reports `ConnectError` immediately.
    Reject,
    /// Stays silent until the test pushes events.
    Silent,
}

#[derive(Clone)]
pub(crate) struct MockConnector {
    script: Arc<Mutex<Script>>,
    peers: Arc<Mutex<Vec<MockPeer>>>,
}

impl MockConnector {
    pub fn new(script: Script) -> Self {
        Self {
            script: Arc::new(Mutex::new(script)),
            peers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn set_script(&self, script: Script) {
        *self.script.lock() = script;
    }

    pub fn opened(&self) -> usize {
        self.peers.lock().len()
    }

    /// Runs `f` against the most recently opened transport.
    pub fn with_last<R>(&self, f: impl FnOnce(&mut MockPeer) -> R) -> R {
        let mut peers = self.peers.lock();
        let peer = peers.last_mut().expect("no transport opened yet");
        f(peer)
    }
}

impl Connector for MockConnector {
    fn open(&self, options: TransportOptions) -> TransportHandle {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (evt_tx, evt_rx) = mpsc::unbounded_channel();
        let mut peers = self.peers.lock();
        match *self.script.lock() {
            Script::Accept => {
                let _ = evt_tx.send(TransportEvent::Connect {
                    sid: format!("sock-{}", peers.len() + 1),
                });
            }
            Script::Reject => {
                let _ = evt_tx.send(TransportEvent::ConnectError(
                    "Authentication error".to_string(),
                ));
            }
            Script::Silent => {}
        }
        peers.push(MockPeer {
            options,
            events: evt_tx,
            commands: cmd_rx,
        });
        TransportHandle::new(cmd_tx, evt_rx, None)
    }
}
