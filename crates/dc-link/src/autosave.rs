use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use futures_util::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, warn};

use crate::config::duration_ms;
use crate::error::LinkError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveStatus {
    Idle,
    Pending,
    Saving,
    Saved,
    Error,
}

impl SaveStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SaveStatus::Idle => "idle",
            SaveStatus::Pending => "pending",
            SaveStatus::Saving => "saving",
            SaveStatus::Saved => "saved",
            SaveStatus::Error => "error",
        }
    }

    fn to_u8(self) -> u8 {
        match self {
            SaveStatus::Idle => 0,
            SaveStatus::Pending => 1,
            SaveStatus::Saving => 2,
            SaveStatus::Saved => 3,
            SaveStatus::Error => 4,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => SaveStatus::Pending,
            2 => SaveStatus::Saving,
            3 => SaveStatus::Saved,
            4 => SaveStatus::Error,
            _ => SaveStatus::Idle,
        }
    }
}

impl fmt::Display for SaveStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutosaveConfig {
    /// Quiet period after the latest edit before it is flushed.
    #[serde(with = "duration_ms", rename = "debounce_ms")]
    pub debounce: Duration,
    /// Upper bound between the first queued edit and its flush.
    #[serde(with = "duration_ms", rename = "max_wait_ms")]
    pub max_wait: Duration,
    #[serde(with = "duration_ms", rename = "saved_display_ms")]
    pub saved_display: Duration,
    #[serde(with = "duration_ms", rename = "error_display_ms")]
    pub error_display: Duration,
}

impl Default for AutosaveConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_secs(1),
            max_wait: Duration::from_secs(5),
            saved_display: Duration::from_secs(3),
            error_display: Duration::from_secs(5),
        }
    }
}

pub type SaveFn<D, R> =
    Arc<dyn Fn(D, String) -> BoxFuture<'static, Result<R, LinkError>> + Send + Sync>;
pub type ErrorHook = Arc<dyn Fn(&LinkError) + Send + Sync>;
pub type StatusHook = Arc<dyn Fn(SaveStatus) + Send + Sync>;

#[derive(Clone, Default)]
pub struct AutosaveHooks {
    pub on_error: Option<ErrorHook>,
    pub on_status_change: Option<StatusHook>,
}

impl AutosaveHooks {
    pub fn on_error<F>(mut self, hook: F) -> Self
    where
        F: Fn(&LinkError) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(hook));
        self
    }

    pub fn on_status_change<F>(mut self, hook: F) -> Self
    where
        F: Fn(SaveStatus) + Send + Sync + 'static,
    {
        self.on_status_change = Some(Arc::new(hook));
        self
    }
}

struct Snapshot {
    status: AtomicU8,
    pending: AtomicBool,
    last_save_ms: AtomicI64,
}

enum Command<D, R> {
    Save {
        data: D,
        kind: String,
    },
    SaveNow {
        data: D,
        kind: String,
        reply: oneshot::Sender<Result<R, LinkError>>,
    },
    Destroy,
}

/// Coalesces edits into saves. One pending slot per manager: a newer edit
/// replaces the unsent one regardless of its type.
pub struct AutosaveManager<D, R> {
    commands: mpsc::UnboundedSender<Command<D, R>>,
    snapshot: Arc<Snapshot>,
    task: JoinHandle<()>,
}

impl<D, R> AutosaveManager<D, R>
where
    D: Send + 'static,
    R: Send + 'static,
{
    /// Starts the manager on the current tokio runtime.
    pub fn spawn<F, Fut>(config: AutosaveConfig, on_save: F, hooks: AutosaveHooks) -> Self
    where
        F: Fn(D, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, LinkError>> + Send + 'static,
    {
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let snapshot = Arc::new(Snapshot {
            status: AtomicU8::new(SaveStatus::Idle.to_u8()),
            pending: AtomicBool::new(false),
            last_save_ms: AtomicI64::new(0),
        });
        let save: SaveFn<D, R> = Arc::new(move |data, kind| on_save(data, kind).boxed());
        let actor = Actor {
            config,
            on_save: save,
            hooks,
            snapshot: Arc::clone(&snapshot),
            pending: None,
            debounce_at: None,
            max_wait_at: None,
            reset_at: None,
        };
        let task = tokio::spawn(actor.run(commands_rx));
        Self {
            commands,
            snapshot,
            task,
        }
    }

    /// Queues an edit for a debounced save. Failures are reported through
    /// the error hook and the status, never to this caller.
    pub fn save(&self, data: D, kind: impl Into<String>) -> Result<(), LinkError> {
        self.commands
            .send(Command::Save {
                data,
                kind: kind.into(),
            })
            .map_err(|_| destroyed())
    }

    /// Saves immediately, after any flush already in flight, and returns the
    /// backend result. Drops the pending edit.
    pub async fn save_now(&self, data: D, kind: impl Into<String>) -> Result<R, LinkError> {
        let (reply, result) = oneshot::channel();
        self.commands
            .send(Command::SaveNow {
                data,
                kind: kind.into(),
                reply,
            })
            .map_err(|_| destroyed())?;
        result.await.map_err(|_| destroyed())?
    }

    pub fn status(&self) -> SaveStatus {
        SaveStatus::from_u8(self.snapshot.status.load(Ordering::Acquire))
    }

    pub fn has_pending_changes(&self) -> bool {
        self.snapshot.pending.load(Ordering::Acquire)
    }

    pub fn last_save_time(&self) -> Option<DateTime<Utc>> {
        match self.snapshot.last_save_ms.load(Ordering::Acquire) {
            0 => None,
            millis => Utc.timestamp_millis_opt(millis).single(),
        }
    }

    /// Discards the pending edit and stops the manager.
    pub fn destroy(&self) {
        if self.commands.send(Command::Destroy).is_err() {
            debug!(event = "autosave_already_destroyed");
        }
    }

    pub fn is_destroyed(&self) -> bool {
        self.task.is_finished()
    }
}

fn destroyed() -> LinkError {
    LinkError::Save("autosave manager destroyed".to_string())
}

struct Actor<D, R> {
    config: AutosaveConfig,
    on_save: SaveFn<D, R>,
    hooks: AutosaveHooks,
    snapshot: Arc<Snapshot>,
    pending: Option<(D, String)>,
    debounce_at: Option<Instant>,
    max_wait_at: Option<Instant>,
    reset_at: Option<Instant>,
}

impl<D, R> Actor<D, R>
where
    D: Send + 'static,
    R: Send + 'static,
{
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command<D, R>>) {
        loop {
            let flush_at = match (self.debounce_at, self.max_wait_at) {
                (Some(debounce), Some(max_wait)) => Some(debounce.min(max_wait)),
                (debounce, max_wait) => debounce.or(max_wait),
            };
            let now = Instant::now();
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Save { data, kind }) => self.queue(data, kind),
                    Some(Command::SaveNow { data, kind, reply }) => {
                        self.clear_pending();
                        let result = self.execute(data, kind).await;
                        if reply.send(result).is_err() {
                            debug!(event = "save_now_caller_gone");
                        }
                    }
                    Some(Command::Destroy) | None => break,
                },
                _ = sleep_until(flush_at.unwrap_or(now)), if flush_at.is_some() => {
                    self.flush_pending().await;
                }
                _ = sleep_until(self.reset_at.unwrap_or(now)), if self.reset_at.is_some() => {
                    self.reset_at = None;
                    if self.pending.is_none()
                        && matches!(self.status(), SaveStatus::Saved | SaveStatus::Error)
                    {
                        self.set_status(SaveStatus::Idle);
                    }
                }
            }
        }
        self.clear_pending();
        self.reset_at = None;
        self.set_status(SaveStatus::Idle);
    }

    fn status(&self) -> SaveStatus {
        SaveStatus::from_u8(self.snapshot.status.load(Ordering::Acquire))
    }

    fn set_status(&self, status: SaveStatus) {
        let previous = self.snapshot.status.swap(status.to_u8(), Ordering::AcqRel);
        if previous == status.to_u8() {
            return;
        }
        if let Some(hook) = &self.hooks.on_status_change {
            hook(status);
        }
    }

    fn queue(&mut self, data: D, kind: String) {
        if let Some((_, previous)) = &self.pending {
            debug!(event = "autosave_edit_replaced", previous = %previous, kind = %kind);
        }
        self.pending = Some((data, kind));
        self.snapshot.pending.store(true, Ordering::Release);
        let now = Instant::now();
        self.debounce_at = Some(now + self.config.debounce);
        if self.max_wait_at.is_none() {
            self.max_wait_at = Some(now + self.config.max_wait);
        }
        self.reset_at = None;
        self.set_status(SaveStatus::Pending);
    }

    fn clear_pending(&mut self) {
        self.pending = None;
        self.debounce_at = None;
        self.max_wait_at = None;
        self.snapshot.pending.store(false, Ordering::Release);
    }

    async fn flush_pending(&mut self) {
        let pending = self.pending.take();
        self.clear_pending();
        let Some((data, kind)) = pending else {
            return;
        };
        // Errors already went to the hook; background saves stop here.
        let _ = self.execute(data, kind).await;
    }

    async fn execute(&mut self, data: D, kind: String) -> Result<R, LinkError> {
        self.reset_at = None;
        self.set_status(SaveStatus::Saving);
        let result = (self.on_save)(data, kind.clone()).await;
        match &result {
            Ok(_) => {
                self.snapshot
                    .last_save_ms
                    .store(Utc::now().timestamp_millis(), Ordering::Release);
                self.set_status(SaveStatus::Saved);
                self.reset_at = Some(Instant::now() + self.config.saved_display);
            }
            Err(err) => {
                warn!(event = "autosave_failed", kind = %kind, error = %err);
                if let Some(hook) = &self.hooks.on_error {
                    hook(err);
                }
                self.set_status(SaveStatus::Error);
                self.reset_at = Some(Instant::now() + self.config.error_display);
            }
        }
        result
    }
}
