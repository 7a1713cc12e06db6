use std::time::Duration;

use dc_core::{FrameError, RpcFailure};
use thiserror::Error;

/// Errors surfaced by the link runtime. `Clone` so a single connect outcome
/// can be handed to every caller that awaited the same attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("connect timed out after {0:?}")]
    Timeout(Duration),
    #[error("not connected")]
    NotConnected,
    #[error("connection closed")]
    Closed,
    #[error("encode failed: {0}")]
    Encode(String),
    #[error("{0}")]
    Rpc(String),
    #[error("save failed: {0}")]
    Save(String),
}

impl LinkError {
    /// Socket-level failures that the reconnect loop retries on its own.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            LinkError::Connect(_)
                | LinkError::Timeout(_)
                | LinkError::NotConnected
                | LinkError::Closed
        )
    }
}

impl From<FrameError> for LinkError {
    fn from(err: FrameError) -> Self {
        LinkError::Encode(err.to_string())
    }
}

impl From<RpcFailure> for LinkError {
    fn from(err: RpcFailure) -> Self {
        LinkError::Rpc(err.to_string())
    }
}
