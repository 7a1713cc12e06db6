use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard};

use dc_core::{decode_frame, Envelope, FrameError, DEFAULT_MAX_FRAME_BYTES};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::bus::SubscriptionId;

pub type Listener = Arc<dyn Fn(&Envelope) + Send + Sync>;
pub type ListenerId = SubscriptionId;

/// What `remove_listener` does when one callback was registered more than
/// once on the same namespace.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemovalPolicy {
    /// Remove the earliest registration only.
    #[default]
    FirstMatch,
    AllMatches,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameOutcome {
    Delivered { namespace: String, listeners: usize },
    Heartbeat,
    Unrouted(String),
    Malformed(FrameError),
}

struct Inner {
    policy: RemovalPolicy,
    max_frame_bytes: usize,
    listeners: Mutex<HashMap<String, Vec<(ListenerId, Listener)>>>,
}

/// Routes inbound envelopes to the listeners registered for their namespace.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new(RemovalPolicy::default(), DEFAULT_MAX_FRAME_BYTES)
    }
}

fn same_listener(a: &Listener, b: &Listener) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

impl Dispatcher {
    pub fn new(policy: RemovalPolicy, max_frame_bytes: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                policy,
                max_frame_bytes,
                listeners: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn removal_policy(&self) -> RemovalPolicy {
        self.inner.policy
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Vec<(ListenerId, Listener)>>> {
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add_listener(&self, namespace: &str, listener: Listener) -> ListenerId {
        let id = SubscriptionId::next();
        self.lock()
            .entry(namespace.to_string())
            .or_default()
            .push((id, listener));
        id
    }

    pub fn on<F>(&self, namespace: &str, callback: F) -> ListenerId
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        self.add_listener(namespace, Arc::new(callback))
    }

    /// Removes registrations of `listener` by identity according to the
    /// configured policy. Returns how many were removed.
    pub fn remove_listener(&self, namespace: &str, listener: &Listener) -> usize {
        let mut listeners = self.lock();
        let Some(entries) = listeners.get_mut(namespace) else {
            return 0;
        };
        let removed = match self.inner.policy {
            RemovalPolicy::FirstMatch => {
                match entries
                    .iter()
                    .position(|(_, candidate)| same_listener(candidate, listener))
                {
                    Some(index) => {
                        entries.remove(index);
                        1
                    }
                    None => 0,
                }
            }
            RemovalPolicy::AllMatches => {
                let before = entries.len();
                entries.retain(|(_, candidate)| !same_listener(candidate, listener));
                before - entries.len()
            }
        };
        if entries.is_empty() {
            listeners.remove(namespace);
        }
        removed
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = self.lock();
        let mut found = None;
        for (namespace, entries) in listeners.iter_mut() {
            if let Some(index) = entries.iter().position(|(entry_id, _)| *entry_id == id) {
                entries.remove(index);
                found = Some((namespace.clone(), entries.is_empty()));
                break;
            }
        }
        match found {
            Some((namespace, emptied)) => {
                if emptied {
                    listeners.remove(&namespace);
                }
                true
            }
            None => false,
        }
    }

    pub fn listener_count(&self, namespace: &str) -> usize {
        self.lock().get(namespace).map_or(0, Vec::len)
    }

    /// Invokes the namespace's listeners in registration order, each isolated
    /// from the others' panics. Returns how many completed.
    pub fn dispatch(&self, envelope: &Envelope) -> usize {
        let snapshot: Vec<Listener> = match self.lock().get(&envelope.namespace) {
            Some(entries) => entries
                .iter()
                .map(|(_, listener)| Arc::clone(listener))
                .collect(),
            None => return 0,
        };
        let mut delivered = 0;
        for listener in snapshot {
            match catch_unwind(AssertUnwindSafe(|| listener(envelope))) {
                Ok(()) => delivered += 1,
                Err(_) => warn!(
                    event = "listener_panicked",
                    namespace = %envelope.namespace,
                    ws_event = %envelope.event
                ),
            }
        }
        delivered
    }

    pub fn handle_frame(&self, text: &str) -> FrameOutcome {
        let envelope = match decode_frame(text, self.inner.max_frame_bytes) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(event = "frame_dropped", error = %err);
                return FrameOutcome::Malformed(err);
            }
        };
        if envelope.is_heartbeat() {
            return FrameOutcome::Heartbeat;
        }
        if self.listener_count(&envelope.namespace) == 0 {
            debug!(
                event = "frame_unrouted",
                namespace = %envelope.namespace,
                ws_event = %envelope.event
            );
            return FrameOutcome::Unrouted(envelope.namespace);
        }
        let listeners = self.dispatch(&envelope);
        FrameOutcome::Delivered {
            namespace: envelope.namespace,
            listeners,
        }
    }
}
