use std::time::Duration;
use thiserror::Error;
use url::ParseError;

pub type Result<T, E = ConnectorError> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum ConnectorError {
    /// No access token could be read from the credential store. The caller
    /// has to re-authenticate before connecting again.
    #[error("Authentication Error: no access token available")]
    AuthenticationMissing,

    #[error("Connection Failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection Timeout: no handshake within {0:?}")]
    ConnectionTimeout(Duration),

    #[error("Unknown Event: '{0}' is not an application event name")]
    UnknownEvent(String),

    #[error("Protocol Error: {0}")]
    Protocol(String),

    #[error("WebSocket Error: {0}")]
    WebsocketError(String),

    #[error("Configuration Error: {0}")]
    Config(String),

    #[error("HTTP Request Error: {0}")]
    ReqwestError(#[from] reqwest::Error),

    #[error("JSON Serialization/Deserialization Error: {0}")]
    SerdeError(#[from] serde_json::Error),

    #[error("URL Parsing Error: {0}")]
    UrlParseError(#[from] ParseError),
}

impl From<tokio_tungstenite::tungstenite::Error> for ConnectorError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        ConnectorError::WebsocketError(e.to_string())
    }
}

/// Outcome of a failed connection attempt as observed by every caller that
/// joined it. Kept `Clone` so a single attempt can be shared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ConnectFailure {
    AuthenticationMissing,
    Failed(String),
    Timeout(Duration),
}

impl From<ConnectFailure> for ConnectorError {
    fn from(failure: ConnectFailure) -> Self {
        match failure {
            ConnectFailure::AuthenticationMissing => ConnectorError::AuthenticationMissing,
            ConnectFailure::Failed(reason) => ConnectorError::ConnectionFailed(reason),
            ConnectFailure::Timeout(after) => ConnectorError::ConnectionTimeout(after),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_failure_maps_to_public_error() {
        let err: ConnectorError = ConnectFailure::Failed("xhr poll error".to_string()).into();
        assert!(matches!(err, ConnectorError::ConnectionFailed(ref r) if r == "xhr poll error"));

        let err: ConnectorError = ConnectFailure::Timeout(Duration::from_secs(15)).into();
        assert_eq!(err.to_string(), "Connection Timeout: no handshake within 15s");

        let err: ConnectorError = ConnectFailure::AuthenticationMissing.into();
        assert!(matches!(err, ConnectorError::AuthenticationMissing));
    }
}
