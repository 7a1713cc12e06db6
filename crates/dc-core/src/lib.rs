//! Wire contracts shared by the event-channel client and its tools.

pub mod events;
pub mod rpc;
pub mod wire;

pub use events::{
    AnalysisEvent, CookieSync, CookieSyncStatus, DownloadEvent, DtProgress, DtSignal,
    EventDecodeError, StageEvent, SubtitleChat, SubtitleEvent, SubtitleProgress, TaskStage,
};
pub use rpc::{RpcFailure, RpcResponse};
pub use wire::{decode_frame, encode_frame, Envelope, FrameError, DEFAULT_MAX_FRAME_BYTES};
