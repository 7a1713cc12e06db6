use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::dispatch::RemovalPolicy;
use crate::error::LinkError;

pub const DEFAULT_ENDPOINT: &str = "ws://localhost:34444/ws";
pub const DEFAULT_CLIENT_ID: &str = "dreamcreator";
pub const CLIENT_ID_QUERY_KEY: &str = "id";

pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis().min(u64::MAX as u128) as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

/// Exponential backoff between reconnect attempts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    #[serde(with = "duration_ms", rename = "base_delay_ms")]
    pub base_delay: Duration,
    #[serde(with = "duration_ms", rename = "max_delay_ms")]
    pub max_delay: Duration,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    /// `min(base * 2^attempts, max)`.
    pub fn delay_for(&self, attempts: u32) -> Duration {
        match 2u32.checked_pow(attempts) {
            Some(factor) => self.base_delay.saturating_mul(factor).min(self.max_delay),
            None => self.max_delay,
        }
    }

    pub fn allows(&self, attempts: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempts < max)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    pub endpoint: String,
    pub client_id: String,
    #[serde(with = "duration_ms", rename = "connect_timeout_ms")]
    pub connect_timeout: Duration,
    #[serde(with = "duration_ms", rename = "heartbeat_interval_ms")]
    pub heartbeat_interval: Duration,
    pub reconnect: ReconnectPolicy,
    pub ensure_retries: u32,
    #[serde(with = "duration_ms", rename = "ensure_backoff_step_ms")]
    pub ensure_backoff_step: Duration,
    pub removal_policy: RemovalPolicy,
    pub max_frame_bytes: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            client_id: DEFAULT_CLIENT_ID.to_string(),
            connect_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(25),
            reconnect: ReconnectPolicy::default(),
            ensure_retries: 3,
            ensure_backoff_step: Duration::from_secs(1),
            removal_policy: RemovalPolicy::default(),
            max_frame_bytes: dc_core::DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

impl LinkConfig {
    pub fn validate(&self) -> Result<(), LinkError> {
        self.socket_url()?;
        if self.client_id.trim().is_empty() {
            return Err(LinkError::InvalidConfig("client id is empty".to_string()));
        }
        if self.connect_timeout.is_zero() || self.heartbeat_interval.is_zero() {
            return Err(LinkError::InvalidConfig(
                "connect timeout and heartbeat interval must be positive".to_string(),
            ));
        }
        if self.reconnect.base_delay.is_zero()
            || self.reconnect.max_delay < self.reconnect.base_delay
        {
            return Err(LinkError::InvalidConfig(format!(
                "reconnect delays out of range: base {:?}, max {:?}",
                self.reconnect.base_delay, self.reconnect.max_delay
            )));
        }
        Ok(())
    }

    /// Endpoint with the client id appended as `?id=<client-id>`.
    pub fn socket_url(&self) -> Result<Url, LinkError> {
        let mut url = Url::parse(&self.endpoint)
            .map_err(|err| LinkError::InvalidConfig(format!("endpoint {}: {err}", self.endpoint)))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(LinkError::InvalidConfig(format!(
                "endpoint must use ws or wss: {}",
                self.endpoint
            )));
        }
        url.query_pairs_mut()
            .append_pair(CLIENT_ID_QUERY_KEY, &self.client_id);
        Ok(url)
    }
}
