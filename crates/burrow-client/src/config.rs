//! Client configuration

use crate::RelayClientError;
use burrow_proto::{CONTROL_PATH, DEFAULT_REQUEST_TIMEOUT};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Delay between reconnect attempts
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Tunnel client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayClientConfig {
    /// Relay control URL, e.g. `wss://relay.example.com` or `ws://localhost:8765/tunnel`
    pub server_url: String,
    /// Base URL of the local service requests are replayed against
    pub local_url: String,
    /// Subdomain to ask for instead of a random one
    pub subdomain: Option<String>,
    #[serde(with = "duration_secs")]
    pub reconnect_delay: Duration,
    #[serde(with = "duration_secs")]
    pub upstream_timeout: Duration,
}

/// Helper module for serializing Duration as seconds
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

impl Default for RelayClientConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://localhost:8765".to_string(),
            local_url: "http://localhost:3000".to_string(),
            subdomain: None,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            upstream_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

impl RelayClientConfig {
    pub fn builder() -> RelayClientConfigBuilder {
        RelayClientConfigBuilder::default()
    }

    /// Full control channel URL, including the endpoint path and the
    /// requested subdomain
    pub fn control_url(&self) -> String {
        let base = self.server_url.trim_end_matches('/');
        let mut url = if base.ends_with(CONTROL_PATH) {
            base.to_string()
        } else {
            format!("{}{}", base, CONTROL_PATH)
        };

        if let Some(subdomain) = &self.subdomain {
            url.push_str("?subdomain=");
            url.push_str(subdomain);
        }
        url
    }
}

/// Builder for RelayClientConfig
#[derive(Default)]
pub struct RelayClientConfigBuilder {
    config: RelayClientConfig,
}

impl RelayClientConfigBuilder {
    pub fn server_url(mut self, url: impl Into<String>) -> Self {
        self.config.server_url = url.into();
        self
    }

    pub fn local_url(mut self, url: impl Into<String>) -> Self {
        self.config.local_url = url.into();
        self
    }

    pub fn subdomain(mut self, subdomain: Option<String>) -> Self {
        self.config.subdomain = subdomain;
        self
    }

    pub fn reconnect_delay(mut self, delay: Duration) -> Self {
        self.config.reconnect_delay = delay;
        self
    }

    pub fn upstream_timeout(mut self, timeout: Duration) -> Self {
        self.config.upstream_timeout = timeout;
        self
    }

    pub fn build(self) -> Result<RelayClientConfig, RelayClientError> {
        let config = self.config;

        if !(config.server_url.starts_with("ws://") || config.server_url.starts_with("wss://")) {
            return Err(RelayClientError::Config(format!(
                "server URL must start with ws:// or wss://, got '{}'",
                config.server_url
            )));
        }
        if !(config.local_url.starts_with("http://") || config.local_url.starts_with("https://"))
        {
            return Err(RelayClientError::Config(format!(
                "local URL must start with http:// or https://, got '{}'",
                config.local_url
            )));
        }
        if let Some(subdomain) = &config.subdomain {
            let valid = !subdomain.is_empty()
                && subdomain
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
            if !valid {
                return Err(RelayClientError::Config(format!(
                    "invalid subdomain '{}' (lowercase letters, digits and hyphens only)",
                    subdomain
                )));
            }
        }

        Ok(config)
    }
}
