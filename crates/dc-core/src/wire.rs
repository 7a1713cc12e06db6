use chrono::Utc;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

pub const SYSTEM_NAMESPACE: &str = "system";
/// Inbound keep-alive pushed by the backend. Never forwarded to listeners.
pub const HEARTBEAT_EVENT: &str = "heartbeat";
/// Outbound keep-alive sent by the client on its heartbeat tick.
pub const PONG_EVENT: &str = "pong";

/// One message on the event channel, in either direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub namespace: String,
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    pub fn new(namespace: impl Into<String>, event: impl Into<String>, data: Value) -> Self {
        Self {
            namespace: namespace.into(),
            event: event.into(),
            data,
        }
    }

    pub fn with_payload<T: Serialize>(
        namespace: impl Into<String>,
        event: impl Into<String>,
        payload: &T,
    ) -> Result<Self, FrameError> {
        let data =
            serde_json::to_value(payload).map_err(|err| FrameError::Encode(err.to_string()))?;
        Ok(Self::new(namespace, event, data))
    }

    /// Outbound keep-alive frame stamped with the current wall clock.
    pub fn pong() -> Self {
        Self::new(
            SYSTEM_NAMESPACE,
            PONG_EVENT,
            serde_json::json!({ "timestamp": Utc::now().timestamp_millis() }),
        )
    }

    pub fn is_heartbeat(&self) -> bool {
        self.namespace == SYSTEM_NAMESPACE && self.event == HEARTBEAT_EVENT
    }

    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, FrameError> {
        T::deserialize(&self.data).map_err(|err| FrameError::Decode(err.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame exceeds max size: {size} > {max}")]
    OversizedFrame { size: usize, max: usize },
    #[error("frame encode failed: {0}")]
    Encode(String),
    #[error("frame decode failed: {0}")]
    Decode(String),
}

pub fn encode_frame(envelope: &Envelope, max_frame_bytes: usize) -> Result<String, FrameError> {
    let encoded =
        serde_json::to_string(envelope).map_err(|err| FrameError::Encode(err.to_string()))?;
    if encoded.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: encoded.len(),
            max: max_frame_bytes,
        });
    }
    Ok(encoded)
}

pub fn decode_frame(text: &str, max_frame_bytes: usize) -> Result<Envelope, FrameError> {
    let raw = text.trim_end_matches(['\n', '\r']);
    if raw.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: raw.len(),
            max: max_frame_bytes,
        });
    }
    serde_json::from_str(raw).map_err(|err| FrameError::Decode(err.to_string()))
}
