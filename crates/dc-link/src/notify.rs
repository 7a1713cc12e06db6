use std::fmt;

use tracing::{error, info, warn};

use crate::error::LinkError;

/// Message shown to the user when an explicit action could not reach the
/// backend.
pub const CONNECTION_FAILED: &str = "connection failed";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Info,
    Success,
    Warning,
    Error,
}

impl fmt::Display for NoticeLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            NoticeLevel::Info => "info",
            NoticeLevel::Success => "success",
            NoticeLevel::Warning => "warning",
            NoticeLevel::Error => "error",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub level: NoticeLevel,
    pub message: String,
}

impl Notice {
    pub fn new(level: NoticeLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(NoticeLevel::Error, message)
    }
}

/// Presentation capability handed to code that needs to tell the user
/// something.
pub trait Notifier: Send + Sync {
    fn notify(&self, notice: Notice);
}

/// Writes notices to the log. Used when no UI is attached.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, notice: Notice) {
        match notice.level {
            NoticeLevel::Info | NoticeLevel::Success => {
                info!(event = "notice", level = %notice.level, message = %notice.message)
            }
            NoticeLevel::Warning => {
                warn!(event = "notice", level = %notice.level, message = %notice.message)
            }
            NoticeLevel::Error => {
                error!(event = "notice", level = %notice.level, message = %notice.message)
            }
        }
    }
}

/// Text shown to the user for a failed foreground action. Transport errors
/// collapse to a generic message; backend messages pass through verbatim.
pub fn failure_message(err: &LinkError) -> String {
    if err.is_transport() {
        return CONNECTION_FAILED.to_string();
    }
    match err {
        LinkError::Rpc(message) | LinkError::Save(message) => message.clone(),
        other => other.to_string(),
    }
}

pub fn report_failure(notifier: &dyn Notifier, err: &LinkError) {
    notifier.notify(Notice::error(failure_message(err)));
}
