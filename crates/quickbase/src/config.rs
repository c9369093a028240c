//! Client configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::QuickbaseError;

// Validation constants
const MIN_TIMEOUT_SECS: u64 = 1;
const MAX_TIMEOUT_SECS: u64 = 3600;
const MAX_CHANNEL_CAPACITY: usize = 4096;

/// Configuration for [`QuickbaseClient`](crate::QuickbaseClient).
///
/// Every field has a default, so a config file or environment only needs
/// to name the values it changes.
///
/// ```rust
/// use quickbase::ClientConfig;
///
/// let config = ClientConfig::builder()
///     .request_timeout_secs(60)
///     .stall_timeout_secs(10)
///     .build()
///     .unwrap();
/// assert_eq!(config.record_channel_capacity, 1);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Timeout for establishing a TCP/TLS connection.
    pub connect_timeout_secs: u64,

    /// Timeout for a whole non-streaming API call, body included.
    ///
    /// Streaming calls are not bound by this; they use the idle read and
    /// stall deadlines instead so that large result sets can take as long
    /// as they need while data keeps flowing.
    pub request_timeout_secs: u64,

    /// Longest wait for the next XML token while streaming a response.
    pub idle_read_timeout_secs: u64,

    /// Longest wait for a consumer to accept the next streamed record before
    /// the producer gives up and releases the response body.
    pub stall_timeout_secs: u64,

    /// Records buffered between the decoder task and the consumer.
    pub record_channel_capacity: usize,

    /// `User-Agent` header sent with every request.
    pub user_agent: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
            request_timeout_secs: 30,
            idle_read_timeout_secs: 60,
            stall_timeout_secs: 300,
            record_channel_capacity: 1,
            user_agent: concat!("quickbase-rs/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl ClientConfig {
    /// Start a builder from the defaults.
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder {
            config: Self::default(),
        }
    }

    /// Check that every value is within its accepted range.
    pub fn validate(&self) -> Result<(), QuickbaseError> {
        for (name, secs) in [
            ("connect_timeout_secs", self.connect_timeout_secs),
            ("request_timeout_secs", self.request_timeout_secs),
            ("idle_read_timeout_secs", self.idle_read_timeout_secs),
            ("stall_timeout_secs", self.stall_timeout_secs),
        ] {
            if !(MIN_TIMEOUT_SECS..=MAX_TIMEOUT_SECS).contains(&secs) {
                return Err(QuickbaseError::Config(format!(
                    "{name} must be between {MIN_TIMEOUT_SECS} and {MAX_TIMEOUT_SECS} seconds, got {secs}"
                )));
            }
        }

        if self.record_channel_capacity == 0 || self.record_channel_capacity > MAX_CHANNEL_CAPACITY {
            return Err(QuickbaseError::Config(format!(
                "record_channel_capacity must be between 1 and {MAX_CHANNEL_CAPACITY}, got {}",
                self.record_channel_capacity
            )));
        }

        if self.user_agent.trim().is_empty() {
            return Err(QuickbaseError::Config("user_agent must not be empty".to_string()));
        }

        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn idle_read_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_read_timeout_secs)
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_secs(self.stall_timeout_secs)
    }
}

/// Builder for [`ClientConfig`].
#[derive(Debug, Clone)]
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    pub fn connect_timeout_secs(mut self, secs: u64) -> Self {
        self.config.connect_timeout_secs = secs;
        self
    }

    pub fn request_timeout_secs(mut self, secs: u64) -> Self {
        self.config.request_timeout_secs = secs;
        self
    }

    pub fn idle_read_timeout_secs(mut self, secs: u64) -> Self {
        self.config.idle_read_timeout_secs = secs;
        self
    }

    pub fn stall_timeout_secs(mut self, secs: u64) -> Self {
        self.config.stall_timeout_secs = secs;
        self
    }

    pub fn record_channel_capacity(mut self, capacity: usize) -> Self {
        self.config.record_channel_capacity = capacity;
        self
    }

    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.config.user_agent = user_agent.into();
        self
    }

    /// Validate and return the configuration.
    pub fn build(self) -> Result<ClientConfig, QuickbaseError> {
        self.config.validate()?;
        Ok(self.config)
    }
}
