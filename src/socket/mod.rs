//! The connection manager and its listener registry.

mod manager;
mod registry;

pub use manager::ConnectionManager;
pub use registry::{Listener, ListenerRegistry, Subscription};
