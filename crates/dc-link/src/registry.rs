use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use dc_core::events::{DOWNTASKS_NAMESPACE, SUBTITLES_NAMESPACE};
use dc_core::{
    AnalysisEvent, CookieSync, DownloadEvent, DtProgress, DtSignal, Envelope, StageEvent,
    SubtitleChat, SubtitleEvent, SubtitleProgress, TaskStage,
};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::bus::{CallbackBus, SubscriptionId};
use crate::dispatch::{Dispatcher, ListenerId};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageState {
    #[default]
    Idle,
    Working,
    Done,
    Error,
}

/// Per-task view of the pipeline slots a download goes through.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StageBoard {
    pub video: StageState,
    pub subtitle: StageState,
    pub merge: StageState,
    pub finalize: StageState,
}

impl StageBoard {
    /// Returns false when the event's kind is not one of the board slots.
    pub fn apply(&mut self, event: &StageEvent) -> bool {
        let slot = match event.kind.as_str() {
            "video" => &mut self.video,
            "subtitle" => &mut self.subtitle,
            "merge" => &mut self.merge,
            "finalize" => &mut self.finalize,
            _ => return false,
        };
        *slot = match event.action.as_str() {
            "complete" => StageState::Done,
            "error" => StageState::Error,
            _ => StageState::Working,
        };
        true
    }
}

/// Last known state of one task: progress fields shallow-merged in arrival
/// order, plus the stage board once a stage event was seen.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskEntry {
    pub fields: Map<String, Value>,
    pub stages: Option<StageBoard>,
}

impl TaskEntry {
    pub fn stage(&self) -> Option<TaskStage> {
        self.fields
            .get("stage")
            .and_then(Value::as_str)
            .map(|stage| TaskStage::from(stage.to_string()))
    }

    pub fn is_terminal(&self) -> bool {
        self.stage().as_ref().is_some_and(TaskStage::is_terminal)
    }

    pub fn progress(&self) -> Option<DtProgress> {
        serde_json::from_value(Value::Object(self.fields.clone())).ok()
    }

    fn merge(&mut self, update: Map<String, Value>) {
        for (key, value) in update {
            self.fields.insert(key, value);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionKind {
    Progress,
    Signal,
    Refresh,
    Stage,
    Installing,
    CookieSync,
    Analysis,
    SubtitleProgress,
    SubtitleChat,
}

/// Handle returned by every `on_*` registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subscription {
    pub kind: SubscriptionKind,
    id: SubscriptionId,
}

struct Buses {
    progress: CallbackBus<DtProgress>,
    signal: CallbackBus<DtSignal>,
    refresh: CallbackBus<DtSignal>,
    stage: CallbackBus<StageEvent>,
    installing: CallbackBus<DtProgress>,
    cookie_sync: CallbackBus<CookieSync>,
    analysis: CallbackBus<AnalysisEvent>,
    subtitle_progress: CallbackBus<SubtitleProgress>,
    subtitle_chat: CallbackBus<SubtitleChat>,
}

struct Attachment {
    dispatcher: Dispatcher,
    listeners: Vec<ListenerId>,
}

struct Inner {
    buses: Buses,
    tasks: Mutex<HashMap<String, TaskEntry>>,
    subtitles: Mutex<HashMap<String, SubtitleProgress>>,
    attachment: Mutex<Option<Attachment>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Client-side mirror of task progress pushed over the event channel.
#[derive(Clone)]
pub struct TaskRegistry {
    inner: Arc<Inner>,
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

macro_rules! subscribe_fn {
    ($name:ident, $bus:ident, $kind:ident, $payload:ty) => {
        pub fn $name<F>(&self, callback: F) -> Subscription
        where
            F: Fn(&$payload) + Send + Sync + 'static,
        {
            Subscription {
                kind: SubscriptionKind::$kind,
                id: self.inner.buses.$bus.subscribe(callback),
            }
        }
    };
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                buses: Buses {
                    progress: CallbackBus::new("progress"),
                    signal: CallbackBus::new("signal"),
                    refresh: CallbackBus::new("refresh"),
                    stage: CallbackBus::new("stage"),
                    installing: CallbackBus::new("installing"),
                    cookie_sync: CallbackBus::new("cookie_sync"),
                    analysis: CallbackBus::new("analysis"),
                    subtitle_progress: CallbackBus::new("subtitle_progress"),
                    subtitle_chat: CallbackBus::new("subtitle_chat"),
                },
                tasks: Mutex::new(HashMap::new()),
                subtitles: Mutex::new(HashMap::new()),
                attachment: Mutex::new(None),
            }),
        }
    }

    /// Attaches to the dispatcher's `downtasks` and `subtitles` namespaces.
    /// Returns false if already attached.
    pub fn init(&self, dispatcher: &Dispatcher) -> bool {
        let mut attachment = lock(&self.inner.attachment);
        if attachment.is_some() {
            return false;
        }
        let listeners = [DOWNTASKS_NAMESPACE, SUBTITLES_NAMESPACE]
            .into_iter()
            .map(|namespace| {
                let registry = Arc::downgrade(&self.inner);
                dispatcher.on(namespace, move |envelope| route(&registry, envelope))
            })
            .collect();
        *attachment = Some(Attachment {
            dispatcher: dispatcher.clone(),
            listeners,
        });
        true
    }

    /// Detaches from the dispatcher. Returns false if not attached.
    pub fn cleanup(&self) -> bool {
        let Some(attachment) = lock(&self.inner.attachment).take() else {
            return false;
        };
        for id in attachment.listeners {
            attachment.dispatcher.unsubscribe(id);
        }
        true
    }

    pub fn is_attached(&self) -> bool {
        lock(&self.inner.attachment).is_some()
    }

    subscribe_fn!(on_progress, progress, Progress, DtProgress);
    subscribe_fn!(on_signal, signal, Signal, DtSignal);
    subscribe_fn!(on_stage, stage, Stage, StageEvent);
    subscribe_fn!(on_installing, installing, Installing, DtProgress);
    subscribe_fn!(on_cookie_sync, cookie_sync, CookieSync, CookieSync);
    subscribe_fn!(on_analysis, analysis, Analysis, AnalysisEvent);
    subscribe_fn!(on_subtitle_progress, subtitle_progress, SubtitleProgress, SubtitleProgress);
    subscribe_fn!(on_subtitle_chat, subtitle_chat, SubtitleChat, SubtitleChat);

    /// Signals that ask list views to reload. Dependency-installer signals
    /// are never delivered here.
    pub fn on_refresh<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&DtSignal) + Send + Sync + 'static,
    {
        Subscription {
            kind: SubscriptionKind::Refresh,
            id: self.inner.buses.refresh.subscribe(callback),
        }
    }

    pub fn unregister(&self, subscription: &Subscription) -> bool {
        let buses = &self.inner.buses;
        let id = subscription.id;
        match subscription.kind {
            SubscriptionKind::Progress => buses.progress.unsubscribe(id),
            SubscriptionKind::Signal => buses.signal.unsubscribe(id),
            SubscriptionKind::Refresh => buses.refresh.unsubscribe(id),
            SubscriptionKind::Stage => buses.stage.unsubscribe(id),
            SubscriptionKind::Installing => buses.installing.unsubscribe(id),
            SubscriptionKind::CookieSync => buses.cookie_sync.unsubscribe(id),
            SubscriptionKind::Analysis => buses.analysis.unsubscribe(id),
            SubscriptionKind::SubtitleProgress => buses.subtitle_progress.unsubscribe(id),
            SubscriptionKind::SubtitleChat => buses.subtitle_chat.unsubscribe(id),
        }
    }

    pub fn handle_envelope(&self, envelope: &Envelope) {
        self.inner.handle_envelope(envelope);
    }

    pub fn handle_download_event(&self, event: DownloadEvent) {
        self.inner.handle_download_event(event);
    }

    pub fn handle_progress(&self, progress: DtProgress) {
        self.inner.handle_progress(progress);
    }

    pub fn handle_signal(&self, signal: DtSignal) {
        self.inner.handle_signal(signal);
    }

    pub fn handle_stage(&self, event: StageEvent) {
        self.inner.handle_stage(event);
    }

    pub fn handle_installing(&self, progress: DtProgress) {
        self.inner.handle_installing(progress);
    }

    pub fn handle_cookie_sync(&self, sync: CookieSync) {
        self.inner.buses.cookie_sync.emit(&sync);
    }

    pub fn handle_analysis(&self, event: AnalysisEvent) {
        self.inner.buses.analysis.emit(&event);
    }

    pub fn handle_subtitle_event(&self, event: SubtitleEvent) {
        self.inner.handle_subtitle_event(event);
    }

    pub fn task(&self, id: &str) -> Option<TaskEntry> {
        lock(&self.inner.tasks).get(id).cloned()
    }

    pub fn stage_board(&self, id: &str) -> Option<StageBoard> {
        lock(&self.inner.tasks).get(id).and_then(|entry| entry.stages)
    }

    pub fn task_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = lock(&self.inner.tasks).keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Drops a task after the backend confirmed its deletion.
    pub fn remove_task(&self, id: &str) -> Option<TaskEntry> {
        lock(&self.inner.tasks).remove(id)
    }

    pub fn subtitle_progress(&self, id: &str) -> Option<SubtitleProgress> {
        lock(&self.inner.subtitles).get(id).cloned()
    }
}

fn route(registry: &Weak<Inner>, envelope: &Envelope) {
    if let Some(inner) = registry.upgrade() {
        inner.handle_envelope(envelope);
    }
}

impl Inner {
    fn handle_envelope(&self, envelope: &Envelope) {
        match envelope.namespace.as_str() {
            DOWNTASKS_NAMESPACE => match DownloadEvent::from_envelope(envelope) {
                Ok(DownloadEvent::Progress(progress)) => match &envelope.data {
                    Value::Object(raw) => self.record_progress(progress, raw.clone()),
                    _ => self.handle_progress(progress),
                },
                Ok(event) => self.handle_download_event(event),
                Err(err) => warn!(event = "download_event_invalid", error = %err),
            },
            SUBTITLES_NAMESPACE => match SubtitleEvent::from_envelope(envelope) {
                Ok(event) => self.handle_subtitle_event(event),
                Err(err) => warn!(event = "subtitle_event_invalid", error = %err),
            },
            other => debug!(event = "registry_namespace_ignored", namespace = other),
        }
    }

    fn handle_download_event(&self, event: DownloadEvent) {
        match event {
            DownloadEvent::Progress(progress) => self.handle_progress(progress),
            DownloadEvent::Signal(signal) => self.handle_signal(signal),
            DownloadEvent::Installing(progress) => self.handle_installing(progress),
            DownloadEvent::CookieSync(sync) => {
                self.buses.cookie_sync.emit(&sync);
            }
            DownloadEvent::Stage(stage) => self.handle_stage(stage),
            DownloadEvent::Analysis(analysis) => {
                self.buses.analysis.emit(&analysis);
            }
        }
    }

    /// Typed updates carry no explicit nulls, so they can only add or
    /// overwrite fields.
    fn handle_progress(&self, progress: DtProgress) {
        let update = match serde_json::to_value(&progress) {
            Ok(Value::Object(update)) => update,
            Ok(_) => return,
            Err(err) => {
                warn!(event = "progress_encode_failed", task_id = %progress.id, error = %err);
                return;
            }
        };
        self.record_progress(progress, update);
    }

    /// Shallow-merges `update` over the stored entry. A `null` in a raw
    /// payload overwrites the previous value.
    fn record_progress(&self, progress: DtProgress, update: Map<String, Value>) {
        if progress.id.is_empty() {
            debug!(event = "progress_without_id");
            return;
        }
        {
            let mut tasks = lock(&self.tasks);
            let entry = tasks.entry(progress.id.clone()).or_default();
            if entry.is_terminal() {
                debug!(event = "progress_after_terminal", task_id = %progress.id);
            }
            entry.merge(update);
        }
        self.buses.progress.emit(&progress);
    }

    fn handle_signal(&self, signal: DtSignal) {
        self.buses.signal.emit(&signal);
        if signal.wants_refresh() {
            self.buses.refresh.emit(&signal);
        }
    }

    fn handle_installing(&self, progress: DtProgress) {
        self.buses.installing.emit(&progress);
        if progress.requests_refresh() && !progress.is_dependency() {
            self.handle_signal(DtSignal {
                id: progress.id.clone(),
                task_type: progress.task_type.clone(),
                stage: progress.stage.clone(),
                refresh: true,
            });
        }
    }

    fn handle_stage(&self, event: StageEvent) {
        if !event.id.is_empty() {
            let mut tasks = lock(&self.tasks);
            let entry = tasks.entry(event.id.clone()).or_default();
            entry
                .stages
                .get_or_insert_with(StageBoard::default)
                .apply(&event);
        }
        self.buses.stage.emit(&event);
    }

    fn handle_subtitle_event(&self, event: SubtitleEvent) {
        match event {
            SubtitleEvent::Progress(progress) => {
                lock(&self.subtitles).insert(progress.id.clone(), progress.clone());
                self.buses.subtitle_progress.emit(&progress);
            }
            SubtitleEvent::Chat(chat) => {
                self.buses.subtitle_chat.emit(&chat);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dc_core::events::{
        DOWNTASKS_COOKIE_SYNC, DOWNTASKS_INSTALLING, DOWNTASKS_PROGRESS, DOWNTASKS_SIGNAL,
        DOWNTASKS_STAGE, SUBTITLE_PROGRESS,
    };
    use serde_json::json;

    fn frame(namespace: &str, event: &str, data: Value) -> String {
        serde_json::to_string(&Envelope::new(namespace, event, data)).expect("frame")
    }

    fn counter<T>() -> (Arc<Mutex<Vec<T>>>, impl Fn(&T) + Send + Sync + 'static)
    where
        T: Clone + Send + 'static,
    {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (seen, move |value: &T| {
            sink.lock().expect("lock").push(value.clone())
        })
    }

    #[test]
    fn progress_is_merged_not_replaced() {
        let registry = TaskRegistry::new();
        let dispatcher = Dispatcher::default();
        registry.init(&dispatcher);

        for data in [json!({"id": "t1", "a": 1}), json!({"id": "t1", "b": 2})] {
            dispatcher.handle_frame(&frame(DOWNTASKS_NAMESPACE, DOWNTASKS_PROGRESS, data));
        }

        let entry = registry.task("t1").expect("entry");
        assert_eq!(Value::Object(entry.fields), json!({"id": "t1", "a": 1, "b": 2}));

        assert!(registry.remove_task("t1").is_some());
        assert!(registry.task("t1").is_none());
        assert!(registry.task_ids().is_empty());
    }

    #[test]
    fn explicit_null_clears_a_stale_field() {
        let registry = TaskRegistry::new();
        let dispatcher = Dispatcher::default();
        registry.init(&dispatcher);

        for data in [
            json!({"id": "t1", "stage": "failed", "error": "timeout", "stageInfo": "retry 3"}),
            json!({"id": "t1", "stage": "downloading", "error": null, "stageInfo": null}),
        ] {
            dispatcher.handle_frame(&frame(DOWNTASKS_NAMESPACE, DOWNTASKS_PROGRESS, data));
        }

        let entry = registry.task("t1").expect("entry");
        assert_eq!(entry.fields.get("error"), Some(&Value::Null));
        assert_eq!(entry.fields.get("stageInfo"), Some(&Value::Null));
        let progress = entry.progress().expect("typed view");
        assert_eq!(progress.error, None);
        assert_eq!(progress.stage, Some(TaskStage::Downloading));
    }

    #[test]
    fn cookie_sync_with_null_browsers_reaches_subscribers() {
        let registry = TaskRegistry::new();
        let (syncs, on_cookie_sync) = counter::<CookieSync>();
        registry.on_cookie_sync(on_cookie_sync);

        registry.handle_envelope(&Envelope::new(
            DOWNTASKS_NAMESPACE,
            DOWNTASKS_COOKIE_SYNC,
            json!({
                "sync_from": "dreamcreator",
                "browsers": null,
                "status": "failed",
                "done": true,
                "error": "no browsers",
                "timestamp": 1
            }),
        ));

        let syncs = syncs.lock().expect("lock");
        assert_eq!(syncs.len(), 1);
        assert!(syncs[0].browsers.is_empty());
        assert_eq!(syncs[0].error.as_deref(), Some("no browsers"));
    }

    #[test]
    fn progress_after_terminal_is_still_merged() {
        let registry = TaskRegistry::new();
        registry.handle_progress(
            serde_json::from_value(json!({
                "id": "t1",
                "stage": "completed",
                "percentage": 100.0
            }))
            .expect("progress"),
        );
        assert!(registry.task("t1").expect("entry").is_terminal());

        registry.handle_progress(
            serde_json::from_value(json!({
                "id": "t1",
                "stage": "downloading",
                "speed": "1MB/s"
            }))
            .expect("progress"),
        );
        let entry = registry.task("t1").expect("entry");
        assert_eq!(entry.stage(), Some(TaskStage::Downloading));
        assert_eq!(entry.fields.get("percentage"), Some(&json!(100.0)));
        assert_eq!(entry.fields.get("speed"), Some(&json!("1MB/s")));
    }

    #[test]
    fn refresh_skips_dependency_signals() {
        let registry = TaskRegistry::new();
        let dispatcher = Dispatcher::default();
        registry.init(&dispatcher);
        let (refreshed, on_refresh) = counter::<DtSignal>();
        let (signals, on_signal) = counter::<DtSignal>();
        registry.on_refresh(on_refresh);
        registry.on_signal(on_signal);

        for id in ["dep-123", "task-7"] {
            let data = json!({"id": id, "refresh": true});
            dispatcher.handle_frame(&frame(DOWNTASKS_NAMESPACE, DOWNTASKS_SIGNAL, data));
        }

        let refreshed = refreshed.lock().expect("lock");
        assert_eq!(refreshed.len(), 1);
        assert_eq!(refreshed[0].id, "task-7");
        assert_eq!(signals.lock().expect("lock").len(), 2);
    }

    #[test]
    fn installing_forwards_refresh_for_tasks_only() {
        let registry = TaskRegistry::new();
        let (installing, on_installing) = counter::<DtProgress>();
        let (refreshed, on_refresh) = counter::<DtSignal>();
        registry.on_installing(on_installing);
        registry.on_refresh(on_refresh);

        for data in [
            json!({"id": "dep-ffmpeg", "stage": "installing", "refresh": true}),
            json!({"id": "x1", "type": "yt-dlp", "stage": "installed", "refresh": true}),
            json!({"id": "task-3", "stage": "installing"}),
            json!({"id": "task-3", "stage": "installCompleted", "refresh": true}),
        ] {
            registry.handle_envelope(&Envelope::new(
                DOWNTASKS_NAMESPACE,
                DOWNTASKS_INSTALLING,
                data,
            ));
        }

        assert_eq!(installing.lock().expect("lock").len(), 4);
        let refreshed = refreshed.lock().expect("lock");
        assert_eq!(refreshed.len(), 1);
        assert_eq!(refreshed[0].stage, Some(TaskStage::InstallCompleted));
    }

    #[test]
    fn stage_events_drive_the_board() {
        let registry = TaskRegistry::new();
        let (stages, on_stage) = counter::<StageEvent>();
        registry.on_stage(on_stage);

        let events = [
            ("video", "start"),
            ("video", "complete"),
            ("merge", "error"),
            ("thumbnail", "start"),
        ];
        for (kind, action) in events {
            registry.handle_envelope(&Envelope::new(
                DOWNTASKS_NAMESPACE,
                DOWNTASKS_STAGE,
                json!({"id": "t9", "kind": kind, "action": action}),
            ));
        }

        let board = registry.stage_board("t9").expect("board");
        assert_eq!(board.video, StageState::Done);
        assert_eq!(board.merge, StageState::Error);
        assert_eq!(board.subtitle, StageState::Idle);
        assert_eq!(board.finalize, StageState::Idle);
        assert_eq!(stages.lock().expect("lock").len(), 4);
    }

    #[test]
    fn subtitle_progress_replaces_previous_value() {
        let registry = TaskRegistry::new();
        let dispatcher = Dispatcher::default();
        registry.init(&dispatcher);

        for data in [
            json!({"id": "s1", "progress": 10.0, "provider": "openai"}),
            json!({"id": "s1", "progress": 55.0}),
        ] {
            dispatcher.handle_frame(&frame(SUBTITLES_NAMESPACE, SUBTITLE_PROGRESS, data));
        }

        let latest = registry.subtitle_progress("s1").expect("subtitle");
        assert_eq!(latest.progress, Some(55.0));
        assert_eq!(latest.provider, None);
    }

    #[test]
    fn init_and_cleanup_are_idempotent() {
        let registry = TaskRegistry::new();
        let dispatcher = Dispatcher::default();
        let (seen, on_progress) = counter::<DtProgress>();
        registry.on_progress(on_progress);

        assert!(registry.init(&dispatcher));
        assert!(!registry.init(&dispatcher));
        assert_eq!(dispatcher.listener_count(DOWNTASKS_NAMESPACE), 1);

        let data = json!({"id": "t1"});
        dispatcher.handle_frame(&frame(DOWNTASKS_NAMESPACE, DOWNTASKS_PROGRESS, data));
        assert_eq!(seen.lock().expect("lock").len(), 1);

        assert!(registry.cleanup());
        assert!(!registry.cleanup());
        assert_eq!(dispatcher.listener_count(DOWNTASKS_NAMESPACE), 0);
        assert!(registry.init(&dispatcher));
    }

    #[test]
    fn unregister_during_dispatch_is_safe() {
        let registry = TaskRegistry::new();
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let handle = registry.clone();
        let own = Arc::clone(&slot);
        let subscription = registry.on_progress(move |_| {
            if let Some(subscription) = own.lock().expect("lock").take() {
                handle.unregister(&subscription);
            }
        });
        *slot.lock().expect("lock") = Some(subscription);

        registry.handle_progress(DtProgress {
            id: "t1".into(),
            ..DtProgress::default()
        });
        assert!(!registry.unregister(&subscription));
    }

    #[test]
    fn invalid_payloads_are_dropped() {
        let registry = TaskRegistry::new();
        let (seen, on_progress) = counter::<DtProgress>();
        registry.on_progress(on_progress);
        for data in [json!({"percentage": 5}), json!("oops")] {
            registry.handle_envelope(&Envelope::new(DOWNTASKS_NAMESPACE, DOWNTASKS_PROGRESS, data));
        }
        assert!(seen.lock().expect("lock").is_empty());
        assert!(registry.task_ids().is_empty());
    }
}
