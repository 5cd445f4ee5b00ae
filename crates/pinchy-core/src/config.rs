//! Client configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{
    protocol::{ClientIdentity, ConnectAuth, ConnectParams, PROTOCOL_VERSION},
    traits::{SettingsError, SettingsStore},
};

/// Settings key holding the gateway URL.
pub const SETTINGS_GATEWAY_URL: &str = "gatewayUrl";
/// Settings key holding the gateway auth token.
pub const SETTINGS_GATEWAY_TOKEN: &str = "gatewayToken";

/// Gateway client configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientConfig {
    /// Gateway WebSocket URL, e.g. `ws://127.0.0.1:18789`.
    pub url: String,
    /// Auth token, sent as `?token=` and in the handshake.
    pub token: String,
    /// Consecutive reconnect attempts before giving up.
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Per-call deadline, including the handshake call.
    pub request_timeout_ms: u64,
    pub client_id: String,
    pub client_version: Option<String>,
    pub platform: String,
    pub mode: String,
    pub role: String,
    pub scopes: Vec<String>,
    pub min_protocol: u32,
    pub max_protocol: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            token: String::new(),
            max_retries: 10,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            request_timeout_ms: 30_000,
            client_id: "pinchy-desktop".to_string(),
            client_version: Some(env!("CARGO_PKG_VERSION").to_string()),
            platform: std::env::consts::OS.to_string(),
            mode: "operator".to_string(),
            role: "operator".to_string(),
            scopes: vec!["operator.read".to_string(), "operator.write".to_string()],
            min_protocol: PROTOCOL_VERSION,
            max_protocol: PROTOCOL_VERSION,
        }
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Gateway URL is not set")]
    MissingUrl,
    #[error("Gateway token is not set")]
    MissingToken,
    #[error("Invalid protocol range: {min}..={max}")]
    ProtocolRange { min: u32, max: u32 },
    #[error("Settings error: {0}")]
    Settings(#[from] SettingsError),
}

impl ClientConfig {
    /// Create a config for a gateway URL and token, everything else default.
    #[must_use]
    pub fn new(url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: token.into(),
            ..Self::default()
        }
    }

    /// Load URL and token from the settings store.
    ///
    /// # Errors
    /// Returns error if the store cannot be read.
    pub async fn from_settings(store: &dyn SettingsStore) -> Result<Self, ConfigError> {
        let url = store.get(SETTINGS_GATEWAY_URL).await?;
        let token = store.get(SETTINGS_GATEWAY_TOKEN).await?;
        Ok(Self::new(
            url.as_ref().and_then(|v| v.as_str()).unwrap_or_default(),
            token.as_ref().and_then(|v| v.as_str()).unwrap_or_default(),
        ))
    }

    /// Persist URL and token to the settings store.
    ///
    /// # Errors
    /// Returns error if the store cannot be written.
    pub async fn save_to(&self, store: &dyn SettingsStore) -> Result<(), ConfigError> {
        store
            .set(SETTINGS_GATEWAY_URL, self.url.clone().into())
            .await?;
        store
            .set(SETTINGS_GATEWAY_TOKEN, self.token.clone().into())
            .await?;
        Ok(())
    }

    /// Check the config can be used to connect.
    ///
    /// # Errors
    /// Returns error if the URL or token is empty or the protocol range is inverted.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.url.trim().is_empty() {
            return Err(ConfigError::MissingUrl);
        }
        if self.token.trim().is_empty() {
            return Err(ConfigError::MissingToken);
        }
        if self.min_protocol > self.max_protocol {
            return Err(ConfigError::ProtocolRange {
                min: self.min_protocol,
                max: self.max_protocol,
            });
        }
        Ok(())
    }

    #[must_use]
    pub const fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    #[must_use]
    pub const fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Parameters for the `connect` handshake call.
    #[must_use]
    pub fn connect_params(&self) -> ConnectParams {
        ConnectParams {
            role: self.role.clone(),
            scopes: self.scopes.clone(),
            auth: ConnectAuth {
                token: self.token.clone(),
            },
            client: ClientIdentity {
                id: self.client_id.clone(),
                version: self.client_version.clone(),
                platform: self.platform.clone(),
                mode: self.mode.clone(),
            },
            min_protocol: self.min_protocol,
            max_protocol: self.max_protocol,
        }
    }
}
