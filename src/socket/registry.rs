use crate::types::{ConnectionEvent, EventKind};
use log::*;
use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub type Listener = Arc<dyn Fn(&ConnectionEvent) + Send + Sync + 'static>;

/// Handle returned by `on`; pass it to `off` to remove exactly that listener.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Subscription {
    kind: EventKind,
    id: u64,
}

impl Subscription {
    pub fn kind(&self) -> EventKind {
        self.kind
    }
}

#[derive(Default)]
pub struct ListenerRegistry {
    next_id: AtomicU64,
    listeners: Mutex<HashMap<EventKind, Vec<(u64, Listener)>>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, kind: EventKind, listener: Listener) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .lock()
            .entry(kind)
            .or_default()
            .push((id, listener));
        Subscription { kind, id }
    }

    /// Returns `false` if the subscription was already gone.
    pub fn unsubscribe(&self, subscription: &Subscription) -> bool {
        let mut listeners = self.listeners.lock();
        let Some(entries) = listeners.get_mut(&subscription.kind) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|(id, _)| *id != subscription.id);
        let removed = entries.len() != before;
        if entries.is_empty() {
            listeners.remove(&subscription.kind);
        }
        removed
    }

    pub fn clear(&self) {
        self.listeners.lock().clear();
    }

    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.listeners.lock().get(&kind).map_or(0, Vec::len)
    }

    /// Calls every listener for the event's kind in subscription order and
    /// returns how many ran without panicking. A panicking listener is logged
    /// and skipped.
    pub fn dispatch(&self, event: &ConnectionEvent) -> usize {
        let kind = event.kind();
        // Snapshot so listeners can subscribe or unsubscribe while running.
        let snapshot: Vec<Listener> = match self.listeners.lock().get(&kind) {
            Some(entries) => entries.iter().map(|(_, l)| Arc::clone(l)).collect(),
            None => {
                trace!("No listeners for '{}'", kind);
                return 0;
            }
        };

        let mut delivered = 0;
        for listener in snapshot {
            match catch_unwind(AssertUnwindSafe(|| listener(event))) {
                Ok(()) => delivered += 1,
                Err(panic) => error!(
                    "Listener for '{}' panicked: {}",
                    kind,
                    panic_message(panic.as_ref())
                ),
            }
        }
        delivered
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
