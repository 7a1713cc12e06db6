//! Client runtime for the desktop backend's event channel: one WebSocket
//! with heartbeat and reconnect, namespace fan-out, a task progress mirror
//! and debounced autosave.

pub mod autosave;
pub mod bus;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod notify;
pub mod registry;
pub mod rpc;

pub use autosave::{AutosaveConfig, AutosaveHooks, AutosaveManager, SaveStatus};
pub use bus::{CallbackBus, SubscriptionId};
pub use config::{LinkConfig, ReconnectPolicy};
pub use connection::{ConnectionManager, ConnectionStatus, ReconnectState, NORMAL_CLOSURE};
pub use dispatch::{Dispatcher, FrameOutcome, Listener, ListenerId, RemovalPolicy};
pub use error::LinkError;
pub use notify::{report_failure, Notice, NoticeLevel, Notifier, TracingNotifier};
pub use registry::{StageBoard, StageState, Subscription, SubscriptionKind, TaskEntry, TaskRegistry};
