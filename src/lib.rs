pub mod auth;
pub mod config;
pub mod error;
pub mod protocol;
pub mod socket;
pub mod transport;
pub mod types;
pub use error::{ConnectorError, Result};
pub use socket::ConnectionManager;
