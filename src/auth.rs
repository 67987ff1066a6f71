use crate::error::Result;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use serde_json::{Map, Value};

/// Environment variable read by [`EnvTokenStore`].
pub const ACCESS_TOKEN_ENV: &str = "FLEET_ACCESS_TOKEN";

/// Gets the current UTC timestamp in milliseconds since the Unix epoch.
pub fn get_timestamp_ms() -> u64 {
    Utc::now().timestamp_millis() as u64
}

/// Source of the bearer token presented when the socket connects.
///
/// The connector only reads tokens; issuing and refreshing them belongs to
/// whatever secure storage the host app uses. Returning `Ok(None)` means the
/// user is signed out.
#[async_trait]
pub trait TokenStore: Send + Sync + 'static {
    async fn access_token(&self) -> Result<Option<String>>;
}

/// In-memory token store, handy for tests and for apps that already hold the
/// token after login.
#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    token: RwLock<Option<String>>,
}

impl MemoryTokenStore {
    pub fn new(token: Option<String>) -> Self {
        Self {
            token: RwLock::new(token),
        }
    }

    pub fn set(&self, token: Option<String>) {
        *self.token.write() = token;
    }
}

#[async_trait]
impl TokenStore for MemoryTokenStore {
    async fn access_token(&self) -> Result<Option<String>> {
        Ok(self.token.read().clone())
    }
}

/// Reads the token from [`ACCESS_TOKEN_ENV`] on every call.
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvTokenStore;

#[async_trait]
impl TokenStore for EnvTokenStore {
    async fn access_token(&self) -> Result<Option<String>> {
        Ok(std::env::var(ACCESS_TOKEN_ENV)
            .ok()
            .filter(|token| !token.trim().is_empty()))
    }
}

/// Builds the Socket.IO `auth` payload: `{ token, clientType, ...overrides }`.
///
/// Overrides are applied last, so a caller can replace `clientType` if needed.
pub fn build_auth_payload(token: &str, client_type: &str, overrides: &Map<String, Value>) -> Value {
    let mut payload = Map::new();
    payload.insert("token".to_string(), Value::String(token.to_string()));
    payload.insert(
        "clientType".to_string(),
        Value::String(client_type.to_string()),
    );
    for (key, value) in overrides {
        payload.insert(key.clone(), value.clone());
    }
    Value::Object(payload)
}
