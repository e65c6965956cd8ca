//! Stateful server-push client for portal notifications.
//!
//! [`StreamClient`] owns at most one transport connection and at most one
//! pending reconnect timer. Transport signals drive a small state machine;
//! failures go through [`ReconnectPolicy`] and surface only as state changes
//! and `on_error` callbacks, never as returned errors.

use std::collections::VecDeque;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use reqwest::header::InvalidHeaderValue;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::config::{PortalConfig, PortalDefaults};
use crate::stream::proto::{decode_notification, NotificationEvent, StreamEventName};
use crate::stream::reconnect::{ReconnectDecision, ReconnectPolicy};
use crate::stream::transport::{
    EventTransport, SignalSink, SseTransport, TransportHandle, TransportSignal,
};

/// Connection lifecycle state of a [`StreamClient`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Errored,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Errored => "errored",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Value passed to `on_error` subscribers.
///
/// Network and protocol failures are reported identically.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Error)]
#[error("connection error")]
pub struct ConnectionError;

/// Everything a subscriber can observe, in delivery order.
#[derive(Clone, Debug, PartialEq)]
pub enum StreamEvent {
    StateChanged(ConnectionState),
    Notification(NotificationEvent),
    Error(ConnectionError),
}

pub type NotificationCallback = Arc<dyn Fn(&NotificationEvent) + Send + Sync>;
pub type StateChangeCallback = Arc<dyn Fn(ConnectionState) + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(&ConnectionError) + Send + Sync>;

/// Callbacks installed at construction time.
///
/// They run before any subscriber added later with
/// [`StreamClient::on_notification`] and friends.
#[derive(Clone, Default)]
pub struct StreamHandlers {
    on_notification: Option<NotificationCallback>,
    on_state_change: Option<StateChangeCallback>,
    on_error: Option<ErrorCallback>,
}

impl StreamHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_notification(mut self, f: impl Fn(&NotificationEvent) + Send + Sync + 'static) -> Self {
        self.on_notification = Some(Arc::new(f));
        self
    }

    pub fn on_state_change(mut self, f: impl Fn(ConnectionState) + Send + Sync + 'static) -> Self {
        self.on_state_change = Some(Arc::new(f));
        self
    }

    pub fn on_error(mut self, f: impl Fn(&ConnectionError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }
}

impl fmt::Debug for StreamHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamHandlers")
            .field("on_notification", &self.on_notification.is_some())
            .field("on_state_change", &self.on_state_change.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

/// Construction options for [`StreamClient`].
#[derive(Clone, Debug)]
pub struct StreamClientOptions {
    /// Route transport errors through the reconnect policy.
    pub auto_reconnect: bool,
    /// Base interval of the linear reconnect backoff.
    pub reconnect_interval: Duration,
    /// Reconnect attempts allowed before giving up.
    pub max_reconnect_attempts: u32,
    pub handlers: StreamHandlers,
}

impl Default for StreamClientOptions {
    fn default() -> Self {
        Self {
            auto_reconnect: true,
            reconnect_interval: PortalDefaults::RECONNECT_INTERVAL,
            max_reconnect_attempts: PortalDefaults::MAX_RECONNECT_ATTEMPTS,
            handlers: StreamHandlers::default(),
        }
    }
}

impl StreamClientOptions {
    pub fn from_config(config: &PortalConfig) -> Self {
        Self {
            reconnect_interval: config.reconnect_interval,
            max_reconnect_attempts: config.max_reconnect_attempts,
            ..Self::default()
        }
    }

    pub fn with_auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    pub fn with_reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval = interval;
        self
    }

    pub fn with_handlers(mut self, handlers: StreamHandlers) -> Self {
        self.handlers = handlers;
        self
    }

    fn policy(&self) -> ReconnectPolicy {
        ReconnectPolicy::new(self.reconnect_interval, self.max_reconnect_attempts)
    }
}

/// Errors raised while building a stream client.
#[derive(Debug, Error)]
pub enum StreamClientError {
    #[error("http client error: {0}")]
    Http(reqwest::Error),

    #[error("invalid session cookie header: {0}")]
    InvalidCookieHeader(#[from] InvalidHeaderValue),
}

/// Token returned by the subscribe methods, used to unsubscribe.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct SubscriptionId(u64);

/// Server-push notification client.
///
/// Cloning is cheap; clones share the same connection and state. Connection
/// attempts and reconnect timers are spawned on the ambient tokio runtime.
#[derive(Clone)]
pub struct StreamClient {
    shared: Arc<Shared>,
}

impl StreamClient {
    /// Creates a client for `<config.api_base_url>/stream` over SSE.
    pub fn new(
        config: &PortalConfig,
        options: StreamClientOptions,
    ) -> Result<Self, StreamClientError> {
        let transport = SseTransport::new(config)?;
        Ok(Self::with_transport(
            config.stream_endpoint(),
            Arc::new(transport),
            options,
        ))
    }

    /// Creates a client with options derived from `config`.
    pub fn from_config(config: &PortalConfig) -> Result<Self, StreamClientError> {
        Self::new(config, StreamClientOptions::from_config(config))
    }

    /// Creates a client over an arbitrary transport.
    pub fn with_transport(
        endpoint: impl Into<String>,
        transport: Arc<dyn EventTransport>,
        options: StreamClientOptions,
    ) -> Self {
        let listeners = Listeners::default();
        let handlers = &options.handlers;
        if let Some(f) = handlers.on_notification.clone() {
            listeners.add(Listener::Notification(f));
        }
        if let Some(f) = handlers.on_state_change.clone() {
            listeners.add(Listener::StateChange(f));
        }
        if let Some(f) = handlers.on_error.clone() {
            listeners.add(Listener::Error(f));
        }

        Self {
            shared: Arc::new(Shared {
                endpoint: endpoint.into(),
                transport,
                policy: options.policy(),
                auto_reconnect: options.auto_reconnect,
                inner: Mutex::new(Inner::default()),
                listeners,
            }),
        }
    }

    /// Opens a new connection, closing any existing one first.
    ///
    /// Returns immediately; progress is reported through state changes.
    pub fn connect(&self) {
        self.shared.connect();
    }

    /// Cancels any pending reconnect, closes the connection, and resets the
    /// attempt counter. Safe to call in any state.
    pub fn disconnect(&self) {
        self.shared.disconnect();
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Consecutive failed attempts since the last successful connection.
    pub fn reconnect_attempts(&self) -> u32 {
        self.shared.lock().attempts
    }

    pub fn has_pending_reconnect(&self) -> bool {
        self.shared.lock().reconnect.is_some()
    }

    pub fn endpoint(&self) -> &str {
        &self.shared.endpoint
    }

    pub fn on_notification(
        &self,
        f: impl Fn(&NotificationEvent) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.shared.listeners.add(Listener::Notification(Arc::new(f)))
    }

    pub fn on_state_change(
        &self,
        f: impl Fn(ConnectionState) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.shared.listeners.add(Listener::StateChange(Arc::new(f)))
    }

    pub fn on_error(&self, f: impl Fn(&ConnectionError) + Send + Sync + 'static) -> SubscriptionId {
        self.shared.listeners.add(Listener::Error(Arc::new(f)))
    }

    /// Returns a receiver fed with every subsequent [`StreamEvent`].
    ///
    /// The subscription is dropped once the receiver is dropped.
    pub fn events(&self) -> mpsc::UnboundedReceiver<StreamEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared.listeners.add(Listener::Channel(tx));
        rx
    }

    /// Removes a subscriber. Returns `false` if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.shared.listeners.remove(id)
    }
}

impl fmt::Debug for StreamClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.shared.lock();
        f.debug_struct("StreamClient")
            .field("endpoint", &self.shared.endpoint)
            .field("state", &inner.state)
            .field("attempts", &inner.attempts)
            .field("pending_reconnect", &inner.reconnect.is_some())
            .finish()
    }
}

struct Shared {
    endpoint: String,
    transport: Arc<dyn EventTransport>,
    policy: ReconnectPolicy,
    auto_reconnect: bool,
    inner: Mutex<Inner>,
    listeners: Listeners,
}

#[derive(Default)]
struct Inner {
    state: ConnectionState,
    attempts: u32,
    /// Identifies the current transport; signals tagged with any other
    /// generation are stale.
    generation: u64,
    connection: Option<TransportHandle>,
    reconnect: Option<PendingReconnect>,
    next_timer_id: u64,
    outbox: VecDeque<StreamEvent>,
    draining: bool,
}

struct PendingReconnect {
    id: u64,
    task: JoinHandle<()>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn connect(self: &Arc<Self>) {
        {
            let mut inner = self.lock();
            cancel_reconnect(&mut inner);
            self.open_connection(&mut inner);
        }
        self.drain();
    }

    fn disconnect(&self) {
        {
            let mut inner = self.lock();
            cancel_reconnect(&mut inner);
            close_connection(&mut inner);
            inner.attempts = 0;
            if transition(&mut inner, ConnectionState::Disconnected) {
                info!(event = "stream_disconnect", endpoint = %self.endpoint);
            }
        }
        self.drain();
    }

    fn open_connection(self: &Arc<Self>, inner: &mut Inner) {
        close_connection(inner);
        inner.generation += 1;
        let generation = inner.generation;
        // The sink blocks on this lock, so no signal is seen before the
        // Connecting transition below.
        match self.transport.open(&self.endpoint, self.sink(generation)) {
            Ok(handle) => {
                transition(inner, ConnectionState::Connecting);
                info!(
                    event = "stream_connect",
                    endpoint = %self.endpoint,
                    attempt = inner.attempts
                );
                inner.connection = Some(handle);
            }
            Err(err) => {
                error!(event = "stream_connect_unavailable", endpoint = %self.endpoint, error = %err);
                inner.outbox.push_back(StreamEvent::Error(ConnectionError));
                give_up(inner);
            }
        }
    }

    fn sink(self: &Arc<Self>, generation: u64) -> SignalSink {
        let shared = Arc::downgrade(self);
        Arc::new(move |signal| {
            if let Some(shared) = shared.upgrade() {
                shared.handle_signal(generation, signal);
            }
        })
    }

    fn handle_signal(self: &Arc<Self>, generation: u64, signal: TransportSignal) {
        {
            let mut inner = self.lock();
            if inner.generation != generation {
                trace!(event = "stream_signal_stale", generation, ?signal);
                return;
            }
            match signal {
                TransportSignal::Opened => mark_connected(&mut inner),
                TransportSignal::Errored => self.handle_transport_error(&mut inner),
                TransportSignal::Message { name, data } => handle_message(&mut inner, &name, &data),
            }
        }
        self.drain();
    }

    fn handle_transport_error(self: &Arc<Self>, inner: &mut Inner) {
        close_connection(inner);
        transition(inner, ConnectionState::Errored);
        inner.outbox.push_back(StreamEvent::Error(ConnectionError));

        if !self.auto_reconnect {
            warn!(event = "stream_error", endpoint = %self.endpoint, auto_reconnect = false);
            return;
        }

        inner.attempts = inner.attempts.saturating_add(1);
        match self.policy.next_delay(inner.attempts) {
            ReconnectDecision::Retry(delay) => self.schedule_reconnect(inner, delay),
            ReconnectDecision::GiveUp => {
                warn!(
                    event = "stream_reconnect_exhausted",
                    endpoint = %self.endpoint,
                    max_attempts = self.policy.max_attempts
                );
                give_up(inner);
            }
        }
    }

    fn schedule_reconnect(self: &Arc<Self>, inner: &mut Inner, delay: Duration) {
        cancel_reconnect(inner);

        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(err) => {
                error!(event = "stream_reconnect_unavailable", error = %err);
                give_up(inner);
                return;
            }
        };

        inner.next_timer_id += 1;
        let id = inner.next_timer_id;
        let shared = Arc::downgrade(self);
        let task = runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(shared) = shared.upgrade() {
                shared.fire_reconnect(id);
            }
        });

        warn!(
            event = "stream_reconnect_scheduled",
            endpoint = %self.endpoint,
            attempt = inner.attempts,
            delay_ms = delay.as_millis() as u64
        );
        inner.reconnect = Some(PendingReconnect { id, task });
    }

    fn fire_reconnect(self: &Arc<Self>, id: u64) {
        {
            let mut inner = self.lock();
            if inner.reconnect.as_ref().map(|pending| pending.id) != Some(id) {
                return;
            }
            // The timer task is the caller; drop its handle without aborting.
            inner.reconnect = None;
            self.open_connection(&mut inner);
        }
        self.drain();
    }

    /// Delivers queued events outside the state lock.
    ///
    /// Only one caller drains at a time; re-entrant calls from subscribers
    /// just enqueue, which keeps delivery in state-transition order.
    fn drain(&self) {
        {
            let mut inner = self.lock();
            if inner.draining {
                return;
            }
            inner.draining = true;
        }
        loop {
            let next = {
                let mut inner = self.lock();
                match inner.outbox.pop_front() {
                    Some(event) => event,
                    None => {
                        inner.draining = false;
                        return;
                    }
                }
            };
            self.listeners.dispatch(&next);
        }
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap_or_else(PoisonError::into_inner);
        cancel_reconnect(inner);
        close_connection(inner);
    }
}

fn transition(inner: &mut Inner, next: ConnectionState) -> bool {
    if inner.state == next {
        return false;
    }
    debug!(event = "stream_state_change", from = %inner.state, to = %next);
    inner.state = next;
    inner.outbox.push_back(StreamEvent::StateChanged(next));
    true
}

fn mark_connected(inner: &mut Inner) {
    inner.attempts = 0;
    if transition(inner, ConnectionState::Connected) {
        info!(event = "stream_connected");
    }
}

fn handle_message(inner: &mut Inner, name: &str, data: &str) {
    match StreamEventName::parse(name) {
        StreamEventName::Connected => mark_connected(inner),
        StreamEventName::Notification => match decode_notification(data) {
            Ok(notification) => {
                debug!(
                    event = "notification_received",
                    id = %notification.id,
                    category = %notification.category
                );
                inner.outbox.push_back(StreamEvent::Notification(notification));
            }
            Err(err) => {
                warn!(event = "notification_payload_rejected", error = %err);
            }
        },
        StreamEventName::Heartbeat => trace!(event = "stream_heartbeat"),
        StreamEventName::Other(name) => debug!(event = "stream_event_ignored", name = %name),
    }
}

fn give_up(inner: &mut Inner) {
    cancel_reconnect(inner);
    close_connection(inner);
    inner.attempts = 0;
    transition(inner, ConnectionState::Disconnected);
}

fn cancel_reconnect(inner: &mut Inner) {
    if let Some(pending) = inner.reconnect.take() {
        pending.task.abort();
        debug!(event = "stream_reconnect_cancelled", timer = pending.id);
    }
}

fn close_connection(inner: &mut Inner) {
    if let Some(mut connection) = inner.connection.take() {
        connection.close();
    }
    inner.generation += 1;
}

#[derive(Clone)]
enum Listener {
    Notification(NotificationCallback),
    StateChange(StateChangeCallback),
    Error(ErrorCallback),
    Channel(mpsc::UnboundedSender<StreamEvent>),
}

impl Listener {
    /// Returns `false` once the listener can never receive again.
    fn deliver(&self, event: &StreamEvent) -> bool {
        match (self, event) {
            (Self::Notification(f), StreamEvent::Notification(notification)) => f(notification),
            (Self::StateChange(f), StreamEvent::StateChanged(state)) => f(*state),
            (Self::Error(f), StreamEvent::Error(error)) => f(error),
            (Self::Channel(tx), event) => return tx.send(event.clone()).is_ok(),
            _ => {}
        }
        true
    }
}

#[derive(Default)]
struct Listeners {
    next_id: AtomicU64,
    entries: Mutex<Vec<(SubscriptionId, Listener)>>,
}

impl Listeners {
    fn entries(&self) -> MutexGuard<'_, Vec<(SubscriptionId, Listener)>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn add(&self, listener: Listener) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries().push((id, listener));
        id
    }

    fn remove(&self, id: SubscriptionId) -> bool {
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|(entry, _)| *entry != id);
        entries.len() != before
    }

    fn dispatch(&self, event: &StreamEvent) {
        let snapshot = self.entries().clone();
        let mut closed = Vec::new();
        for (id, listener) in snapshot {
            match catch_unwind(AssertUnwindSafe(|| listener.deliver(event))) {
                Ok(true) => {}
                Ok(false) => closed.push(id),
                Err(_) => warn!(event = "subscriber_panicked", subscription = id.0),
            }
        }
        if !closed.is_empty() {
            self.entries().retain(|(id, _)| !closed.contains(id));
        }
    }
}
