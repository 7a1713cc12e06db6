use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::wire::Envelope;

pub const DOWNTASKS_NAMESPACE: &str = "downtasks";
pub const SUBTITLES_NAMESPACE: &str = "subtitles";

pub const DOWNTASKS_PROGRESS: &str = "response_downtasks_progress";
pub const DOWNTASKS_SIGNAL: &str = "response_downtasks_signal";
pub const DOWNTASKS_INSTALLING: &str = "response_downtasks_installing";
pub const DOWNTASKS_COOKIE_SYNC: &str = "response_downtasks_cookie_sync";
pub const DOWNTASKS_STAGE: &str = "response_downtasks_stage";
pub const DOWNTASKS_ANALYSIS: &str = "response_downtasks_analysis";

pub const SUBTITLE_PROGRESS: &str = "response_subtitle_progress";
pub const SUBTITLE_CHAT: &str = "response_subtitle_chat";

/// Ids with this prefix belong to the dependency installer, not to user tasks.
pub const DEPENDENCY_ID_PREFIX: &str = "dep-";
const DEPENDENCY_TYPES: [&str; 3] = ["yt-dlp", "ffmpeg", "deno"];

pub fn is_dependency_id(id: &str) -> bool {
    id.starts_with(DEPENDENCY_ID_PREFIX)
}

pub fn is_dependency_type(kind: &str) -> bool {
    DEPENDENCY_TYPES
        .iter()
        .any(|candidate| candidate.eq_ignore_ascii_case(kind))
}

/// Go marshals nil slices and maps as `null`; treat that like a missing key.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TaskStage {
    Initializing,
    Downloading,
    Translating,
    Embedding,
    Completed,
    Failed,
    Cancelled,
    Installing,
    Installed,
    Updating,
    Updated,
    Preparing,
    InstallFailed,
    InstallCompleted,
    InstallCancelled,
    Extracting,
    Validating,
    Cleaning,
    Other(String),
}

impl TaskStage {
    pub fn as_str(&self) -> &str {
        match self {
            TaskStage::Initializing => "initializing",
            TaskStage::Downloading => "downloading",
            TaskStage::Translating => "translating",
            TaskStage::Embedding => "embedding",
            TaskStage::Completed => "completed",
            TaskStage::Failed => "failed",
            TaskStage::Cancelled => "cancelled",
            TaskStage::Installing => "installing",
            TaskStage::Installed => "installed",
            TaskStage::Updating => "updating",
            TaskStage::Updated => "updated",
            TaskStage::Preparing => "preparing",
            TaskStage::InstallFailed => "installFailed",
            TaskStage::InstallCompleted => "installCompleted",
            TaskStage::InstallCancelled => "installCancelled",
            TaskStage::Extracting => "extracting",
            TaskStage::Validating => "validating",
            TaskStage::Cleaning => "cleaning",
            TaskStage::Other(raw) => raw.as_str(),
        }
    }

    /// Completed, failed and cancelled tasks expect no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStage::Completed | TaskStage::Failed | TaskStage::Cancelled
        )
    }
}

impl From<String> for TaskStage {
    fn from(value: String) -> Self {
        match value.as_str() {
            "initializing" => TaskStage::Initializing,
            "downloading" => TaskStage::Downloading,
            "translating" => TaskStage::Translating,
            "embedding" => TaskStage::Embedding,
            "completed" => TaskStage::Completed,
            "failed" => TaskStage::Failed,
            "cancelled" => TaskStage::Cancelled,
            "installing" => TaskStage::Installing,
            "installed" => TaskStage::Installed,
            "updating" => TaskStage::Updating,
            "updated" => TaskStage::Updated,
            "preparing" => TaskStage::Preparing,
            "installFailed" => TaskStage::InstallFailed,
            "installCompleted" => TaskStage::InstallCompleted,
            "installCancelled" => TaskStage::InstallCancelled,
            "extracting" => TaskStage::Extracting,
            "validating" => TaskStage::Validating,
            "cleaning" => TaskStage::Cleaning,
            _ => TaskStage::Other(value),
        }
    }
}

impl From<TaskStage> for String {
    fn from(value: TaskStage) -> Self {
        match value {
            TaskStage::Other(raw) => raw,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for TaskStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-task progress update. Unknown fields are kept in `extra` so merging
/// into the registry never loses data the backend added later.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DtProgress {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub task_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<TaskStage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage_info: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percentage: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub downloaded: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_size: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_time: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl DtProgress {
    pub fn is_terminal(&self) -> bool {
        self.stage.as_ref().is_some_and(TaskStage::is_terminal)
    }

    /// Installing payloads opt into a list refresh with `"refresh": true`.
    pub fn requests_refresh(&self) -> bool {
        self.extra.get("refresh").and_then(Value::as_bool) == Some(true)
    }

    pub fn is_dependency(&self) -> bool {
        is_dependency_id(&self.id)
            || self.task_type.as_deref().is_some_and(is_dependency_type)
    }
}

/// Ephemeral hint that list views should reload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DtSignal {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub task_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<TaskStage>,
    #[serde(default)]
    pub refresh: bool,
}

impl DtSignal {
    pub fn is_dependency(&self) -> bool {
        is_dependency_id(&self.id)
            || self.task_type.as_deref().is_some_and(is_dependency_type)
    }

    /// True when generic list views should reload for this signal.
    pub fn wants_refresh(&self) -> bool {
        self.refresh && !self.is_dependency()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageEvent {
    #[serde(default)]
    pub id: String,
    pub kind: String,
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lang: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percent: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CookieSyncStatus {
    Started,
    Success,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CookieSync {
    #[serde(default, deserialize_with = "null_as_default")]
    pub sync_from: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub browsers: Vec<String>,
    pub status: CookieSyncStatus,
    #[serde(default, deserialize_with = "null_as_default")]
    pub done: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub timestamp: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisEvent {
    #[serde(default)]
    pub id: String,
    pub step: String,
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Progress of a subtitle conversion or translation job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubtitleProgress {
    pub id: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub task_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_lang: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_lang: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_segments: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed_segments: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_segments: Option<u64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl SubtitleProgress {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status.as_deref(),
            Some("completed" | "failed" | "error" | "cancelled")
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubtitleChat {
    #[serde(default)]
    pub id: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EventDecodeError {
    #[error("unknown event {event} in namespace {namespace}")]
    UnknownEvent { namespace: String, event: String },
    #[error("invalid payload for {event}: {message}")]
    InvalidPayload { event: String, message: String },
    #[error("{event} payload is missing a task id")]
    MissingTaskId { event: String },
}

fn payload<T: serde::de::DeserializeOwned>(envelope: &Envelope) -> Result<T, EventDecodeError> {
    envelope
        .payload()
        .map_err(|err| EventDecodeError::InvalidPayload {
            event: envelope.event.clone(),
            message: err.to_string(),
        })
}

fn unknown(envelope: &Envelope) -> EventDecodeError {
    EventDecodeError::UnknownEvent {
        namespace: envelope.namespace.clone(),
        event: envelope.event.clone(),
    }
}

/// Closed set of events pushed on the `downtasks` namespace.
#[derive(Debug, Clone, PartialEq)]
pub enum DownloadEvent {
    Progress(DtProgress),
    Signal(DtSignal),
    Installing(DtProgress),
    CookieSync(CookieSync),
    Stage(StageEvent),
    Analysis(AnalysisEvent),
}

impl DownloadEvent {
    pub fn from_envelope(envelope: &Envelope) -> Result<Self, EventDecodeError> {
        match envelope.event.as_str() {
            DOWNTASKS_PROGRESS => {
                let progress: DtProgress = payload(envelope)?;
                if progress.id.is_empty() {
                    return Err(EventDecodeError::MissingTaskId {
                        event: envelope.event.clone(),
                    });
                }
                Ok(DownloadEvent::Progress(progress))
            }
            DOWNTASKS_SIGNAL => Ok(DownloadEvent::Signal(payload(envelope)?)),
            DOWNTASKS_INSTALLING => Ok(DownloadEvent::Installing(payload(envelope)?)),
            DOWNTASKS_COOKIE_SYNC => Ok(DownloadEvent::CookieSync(payload(envelope)?)),
            DOWNTASKS_STAGE => Ok(DownloadEvent::Stage(payload(envelope)?)),
            DOWNTASKS_ANALYSIS => Ok(DownloadEvent::Analysis(payload(envelope)?)),
            _ => Err(unknown(envelope)),
        }
    }
}

/// Closed set of events pushed on the `subtitles` namespace.
#[derive(Debug, Clone, PartialEq)]
pub enum SubtitleEvent {
    Progress(SubtitleProgress),
    Chat(SubtitleChat),
}

impl SubtitleEvent {
    pub fn from_envelope(envelope: &Envelope) -> Result<Self, EventDecodeError> {
        match envelope.event.as_str() {
            SUBTITLE_PROGRESS => {
                let progress: SubtitleProgress = payload(envelope)?;
                if progress.id.is_empty() {
                    return Err(EventDecodeError::MissingTaskId {
                        event: envelope.event.clone(),
                    });
                }
                Ok(SubtitleEvent::Progress(progress))
            }
            SUBTITLE_CHAT => Ok(SubtitleEvent::Chat(payload(envelope)?)),
            _ => Err(unknown(envelope)),
        }
    }
}
