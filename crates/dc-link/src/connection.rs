use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use dc_core::{encode_frame, Envelope};
use futures_util::future::{BoxFuture, FutureExt, Shared};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, timeout, Instant, MissedTickBehavior};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::LinkConfig;
use crate::dispatch::Dispatcher;
use crate::error::LinkError;

pub const NORMAL_CLOSURE: u16 = 1000;
const NO_STATUS_RECEIVED: u16 = 1005;
const ABNORMAL_CLOSURE: u16 = 1006;
const NORMAL_CLOSURE_REASON: &str = "Normal closure";
const CLOSE_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Closing,
    Unknown,
}

impl ConnectionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Closing => "closing",
            ConnectionStatus::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Backoff bookkeeping read under one lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectState {
    pub attempts: u32,
    pub last_delay: Option<Duration>,
    pub scheduled: bool,
}

type ConnectFuture = Shared<BoxFuture<'static, Result<(), LinkError>>>;

struct ConnState {
    phase: ConnectionStatus,
    outbound: Option<mpsc::UnboundedSender<Message>>,
    /// Bumped on every successful open and on disconnect. Tasks tied to an
    /// older value are stale and must not touch shared state.
    generation: u64,
    epoch: u64,
    reconnect_attempts: u32,
    last_reconnect_delay: Option<Duration>,
    connection_lost: bool,
    shutdown: bool,
    pending: Option<ConnectFuture>,
    reconnect_timer: Option<JoinHandle<()>>,
    heartbeat: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
}

struct Inner {
    config: LinkConfig,
    url: Url,
    dispatcher: Dispatcher,
    state: Mutex<ConnState>,
    status_tx: watch::Sender<ConnectionStatus>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, ConnState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_phase(&self, state: &mut ConnState, phase: ConnectionStatus) {
        state.phase = phase;
        self.status_tx.send_replace(phase);
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let state = self
            .state
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for handle in [state.reconnect_timer.take(), state.heartbeat.take()]
            .into_iter()
            .flatten()
        {
            handle.abort();
        }
    }
}

/// Owns the single event-channel socket: connect, heartbeat, reconnect and
/// framing. Cheap to clone; clones share one connection.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(config: LinkConfig) -> Result<Self, LinkError> {
        let dispatcher = Dispatcher::new(config.removal_policy, config.max_frame_bytes);
        Self::with_dispatcher(config, dispatcher)
    }

    pub fn with_dispatcher(config: LinkConfig, dispatcher: Dispatcher) -> Result<Self, LinkError> {
        config.validate()?;
        let url = config.socket_url()?;
        let (status_tx, _) = watch::channel(ConnectionStatus::Disconnected);
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                url,
                dispatcher,
                state: Mutex::new(ConnState {
                    phase: ConnectionStatus::Disconnected,
                    outbound: None,
                    generation: 0,
                    epoch: 0,
                    reconnect_attempts: 0,
                    last_reconnect_delay: None,
                    connection_lost: false,
                    shutdown: false,
                    pending: None,
                    reconnect_timer: None,
                    heartbeat: None,
                    writer: None,
                }),
                status_tx,
            }),
        })
    }

    pub fn config(&self) -> &LinkConfig {
        &self.inner.config
    }

    pub fn url(&self) -> &Url {
        &self.inner.url
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    /// Opens the socket unless it is already open or opening. Concurrent
    /// callers share one attempt and observe the same outcome.
    pub async fn connect(&self) -> Result<(), LinkError> {
        let attempt = {
            let mut state = self.inner.lock();
            state.shutdown = false;
            connect_attempt(&self.inner, &mut state)
        };
        match attempt {
            Some(attempt) => attempt.await,
            None => Ok(()),
        }
    }

    /// Kicks off the first connect in the background. Failures fall through
    /// to reconnect scheduling.
    pub fn start_auto_reconnect(&self) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            if let Err(err) = manager.connect().await {
                warn!(event = "initial_connect_failed", error = %err);
            }
        })
    }

    /// Up to `retries + 1` connect attempts with a linear pause between them.
    pub async fn ensure_connected(&self, retries: u32) -> bool {
        let step = self.inner.config.ensure_backoff_step;
        for attempt in 0..=retries {
            if self.is_connected() {
                return true;
            }
            match self.connect().await {
                Ok(()) if self.is_connected() => return true,
                Ok(()) => {}
                Err(err) => debug!(event = "ensure_connect_failed", attempt, error = %err),
            }
            if attempt < retries {
                sleep(step.saturating_mul(attempt + 1)).await;
            }
        }
        self.is_connected()
    }

    pub async fn send<T: Serialize>(
        &self,
        namespace: &str,
        event: &str,
        data: &T,
    ) -> Result<(), LinkError> {
        let envelope = Envelope::with_payload(namespace, event, data)?;
        let text = encode_frame(&envelope, self.inner.config.max_frame_bytes)?;
        if !self.ensure_connected(self.inner.config.ensure_retries).await {
            return Err(LinkError::NotConnected);
        }
        let state = self.inner.lock();
        match (&state.outbound, state.phase) {
            (Some(outbound), ConnectionStatus::Connected) => outbound
                .send(Message::Text(text))
                .map_err(|_| LinkError::Closed),
            _ => Err(LinkError::NotConnected),
        }
    }

    /// Stops timers and closes with the normal-closure code so no reconnect
    /// follows.
    pub async fn disconnect(&self) {
        let writer = {
            let mut state = self.inner.lock();
            state.shutdown = true;
            state.generation += 1;
            state.pending = None;
            if let Some(timer) = state.reconnect_timer.take() {
                timer.abort();
            }
            if let Some(heartbeat) = state.heartbeat.take() {
                heartbeat.abort();
            }
            let writer = state.writer.take();
            match state.outbound.take() {
                Some(outbound) => {
                    let close = Message::Close(Some(CloseFrame {
                        code: CloseCode::Normal,
                        reason: NORMAL_CLOSURE_REASON.into(),
                    }));
                    if outbound.send(close).is_err() {
                        debug!(event = "close_frame_dropped");
                    }
                    self.inner.set_phase(&mut state, ConnectionStatus::Closing);
                }
                None => self.inner.set_phase(&mut state, ConnectionStatus::Disconnected),
            }
            writer
        };
        if let Some(writer) = writer {
            if timeout(CLOSE_GRACE, writer).await.is_err() {
                debug!(event = "close_grace_elapsed");
            }
            let mut state = self.inner.lock();
            if state.phase == ConnectionStatus::Closing {
                self.inner
                    .set_phase(&mut state, ConnectionStatus::Disconnected);
            }
        }
        info!(event = "ws_disconnected", url = %self.inner.url);
    }

    pub fn is_connected(&self) -> bool {
        self.connection_status() == ConnectionStatus::Connected
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        let state = self.inner.lock();
        match state.phase {
            ConnectionStatus::Connected
                if state
                    .outbound
                    .as_ref()
                    .map_or(true, mpsc::UnboundedSender::is_closed) =>
            {
                ConnectionStatus::Unknown
            }
            phase => phase,
        }
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status_tx.subscribe()
    }

    /// Number of successful opens so far. A change means the transport was
    /// replaced and consumers should reload their state.
    pub fn epoch(&self) -> u64 {
        self.inner.lock().epoch
    }

    pub fn connection_lost(&self) -> bool {
        self.inner.lock().connection_lost
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.lock().reconnect_attempts
    }

    pub fn reconnect_state(&self) -> ReconnectState {
        let state = self.inner.lock();
        ReconnectState {
            attempts: state.reconnect_attempts,
            last_delay: state.last_reconnect_delay,
            scheduled: state
                .reconnect_timer
                .as_ref()
                .is_some_and(|timer| !timer.is_finished()),
        }
    }
}

fn connect_attempt(inner: &Arc<Inner>, state: &mut ConnState) -> Option<ConnectFuture> {
    let open = state.phase == ConnectionStatus::Connected
        && state
            .outbound
            .as_ref()
            .is_some_and(|outbound| !outbound.is_closed());
    if open {
        return None;
    }
    if let Some(pending) = &state.pending {
        return Some(pending.clone());
    }
    inner.set_phase(state, ConnectionStatus::Connecting);
    let generation = state.generation;
    let task = tokio::spawn(open_socket(Arc::clone(inner), generation));
    let attempt = async move {
        match task.await {
            Ok(result) => result,
            Err(err) => Err(LinkError::Connect(err.to_string())),
        }
    }
    .boxed()
    .shared();
    state.pending = Some(attempt.clone());
    Some(attempt)
}

async fn open_socket(inner: Arc<Inner>, generation: u64) -> Result<(), LinkError> {
    let limit = inner.config.connect_timeout;
    let stream = match timeout(limit, connect_async(inner.url.as_str())).await {
        Ok(Ok((stream, _response))) => stream,
        Ok(Err(err)) => {
            let err = LinkError::Connect(err.to_string());
            return Err(fail_open(&inner, generation, err));
        }
        Err(_) => return Err(fail_open(&inner, generation, LinkError::Timeout(limit))),
    };
    let (mut sink, source) = stream.split();
    let (outbound, outbound_rx) = mpsc::unbounded_channel();

    let accepted = {
        let mut state = inner.lock();
        if state.shutdown || state.generation != generation {
            None
        } else {
            state.pending = None;
            state.generation += 1;
            state.epoch += 1;
            state.outbound = Some(outbound);
            state.reconnect_attempts = 0;
            state.connection_lost = false;
            if let Some(timer) = state.reconnect_timer.take() {
                timer.abort();
            }
            if let Some(heartbeat) = state.heartbeat.take() {
                heartbeat.abort();
            }
            inner.set_phase(&mut state, ConnectionStatus::Connected);
            state.heartbeat = Some(spawn_heartbeat(
                Arc::downgrade(&inner),
                state.generation,
                inner.config.heartbeat_interval,
            ));
            Some((state.generation, state.epoch))
        }
    };

    let Some((connection, epoch)) = accepted else {
        debug!(event = "ws_open_superseded", url = %inner.url);
        let close = Message::Close(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: NORMAL_CLOSURE_REASON.into(),
        }));
        let _ = sink.send(close).await;
        return Err(LinkError::Closed);
    };

    let writer = tokio::spawn(write_loop(sink, outbound_rx));
    {
        let mut state = inner.lock();
        if state.generation == connection {
            state.writer = Some(writer);
        }
    }
    tokio::spawn(read_loop(Arc::downgrade(&inner), source, connection));
    info!(event = "ws_connected", url = %inner.url, epoch);
    Ok(())
}

fn fail_open(inner: &Arc<Inner>, generation: u64, err: LinkError) -> LinkError {
    let mut state = inner.lock();
    if state.generation == generation && !state.shutdown {
        state.pending = None;
        state.connection_lost = true;
        inner.set_phase(&mut state, ConnectionStatus::Disconnected);
        warn!(event = "ws_connect_failed", url = %inner.url, error = %err);
        schedule_reconnect(inner, &mut state);
    } else if state.generation == generation {
        state.pending = None;
    }
    err
}

async fn write_loop<S>(mut sink: S, mut outbound: mpsc::UnboundedReceiver<Message>)
where
    S: Sink<Message> + Unpin,
    S::Error: fmt::Display,
{
    while let Some(message) = outbound.recv().await {
        let closing = matches!(message, Message::Close(_));
        if let Err(err) = sink.send(message).await {
            warn!(event = "ws_send_failed", error = %err);
            break;
        }
        if closing {
            break;
        }
    }
}

async fn read_loop<S, E>(inner: Weak<Inner>, mut source: S, connection: u64)
where
    S: Stream<Item = Result<Message, E>> + Unpin,
    E: fmt::Display,
{
    let code = loop {
        let text = match source.next().await {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(_) => {
                    warn!(event = "frame_not_utf8");
                    continue;
                }
            },
            Some(Ok(Message::Close(frame))) => {
                break frame.map_or(NO_STATUS_RECEIVED, |frame| u16::from(frame.code));
            }
            Some(Ok(_)) => continue,
            Some(Err(err)) => {
                warn!(event = "ws_read_failed", error = %err);
                break ABNORMAL_CLOSURE;
            }
            None => break ABNORMAL_CLOSURE,
        };
        let Some(inner) = inner.upgrade() else {
            return;
        };
        if inner.lock().generation != connection {
            continue;
        }
        inner.dispatcher.handle_frame(&text);
    };
    if let Some(inner) = inner.upgrade() {
        on_closed(&inner, connection, code);
    }
}

fn on_closed(inner: &Arc<Inner>, connection: u64, code: u16) {
    let mut state = inner.lock();
    if state.generation != connection {
        debug!(event = "ws_stale_close", code);
        return;
    }
    state.outbound = None;
    state.writer = None;
    state.connection_lost = true;
    if let Some(heartbeat) = state.heartbeat.take() {
        heartbeat.abort();
    }
    inner.set_phase(&mut state, ConnectionStatus::Disconnected);
    if code == NORMAL_CLOSURE {
        info!(event = "ws_closed", code);
        return;
    }
    warn!(event = "ws_connection_lost", code);
    schedule_reconnect(inner, &mut state);
}

fn schedule_reconnect(inner: &Arc<Inner>, state: &mut ConnState) {
    if state.shutdown {
        return;
    }
    if state
        .reconnect_timer
        .as_ref()
        .is_some_and(|timer| !timer.is_finished())
    {
        return;
    }
    let policy = &inner.config.reconnect;
    if !policy.allows(state.reconnect_attempts) {
        warn!(
            event = "reconnect_exhausted",
            attempts = state.reconnect_attempts
        );
        return;
    }
    let delay = policy.delay_for(state.reconnect_attempts);
    state.last_reconnect_delay = Some(delay);
    info!(
        event = "reconnect_scheduled",
        attempt = state.reconnect_attempts + 1,
        delay_ms = delay.as_millis() as u64
    );
    state.reconnect_timer = Some(tokio::spawn(reconnect_after(Arc::downgrade(inner), delay)));
}

async fn reconnect_after(inner: Weak<Inner>, delay: Duration) {
    sleep(delay).await;
    let attempt = {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        let mut state = inner.lock();
        state.reconnect_timer = None;
        if state.shutdown || state.phase == ConnectionStatus::Connected {
            return;
        }
        state.reconnect_attempts += 1;
        connect_attempt(&inner, &mut state)
    };
    if let Some(attempt) = attempt {
        if let Err(err) = attempt.await {
            debug!(event = "reconnect_failed", error = %err);
        }
    }
}

fn spawn_heartbeat(inner: Weak<Inner>, connection: u64, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let Some(inner) = inner.upgrade() else {
                break;
            };
            if !send_heartbeat(&inner, connection) {
                break;
            }
        }
    })
}

/// Returns false once the connection the ticker belongs to is gone.
fn send_heartbeat(inner: &Inner, connection: u64) -> bool {
    let state = inner.lock();
    if state.generation != connection || state.phase != ConnectionStatus::Connected {
        return false;
    }
    let Some(outbound) = state.outbound.as_ref() else {
        return false;
    };
    match encode_frame(&Envelope::pong(), inner.config.max_frame_bytes) {
        Ok(text) => {
            if outbound.send(Message::Text(text)).is_err() {
                warn!(event = "heartbeat_failed", error = "writer closed");
            }
        }
        Err(err) => warn!(event = "heartbeat_failed", error = %err),
    }
    true
}
