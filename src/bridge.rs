//! Applies stream events and read-state changes to the portal query cache.
//!
//! The cache itself belongs to the UI layer; the bridge only needs the two
//! operations of [`QueryCache`]. Three sources mutate the unread counter:
//! pushed notifications, mark-as-read actions, and the periodic poll. Each
//! mutation is a single `set_value` call, so a cache that applies updaters
//! atomically stays consistent under concurrent use.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::api::{ApiError, NotificationsApiClient};
use crate::config::PortalDefaults;
use crate::stream::client::{
    ConnectionState, NotificationCallback, StateChangeCallback, StreamClient, SubscriptionId,
};
use crate::stream::proto::NotificationEvent;

/// Cache key of the paginated notification list.
pub const NOTIFICATIONS_KEY: &str = "notifications";
/// Cache key of the unread counter (a JSON number).
pub const UNREAD_COUNT_KEY: &str = "notifications/unread-count";

/// Key/value cache owned outside this crate.
pub trait QueryCache: Send + Sync {
    /// Marks `key` stale so its owner refetches it.
    fn invalidate(&self, key: &str);

    /// Replaces the value at `key` with `updater(current)`.
    ///
    /// Implementations should run the updater atomically with respect to
    /// other updates of the same key.
    fn set_value(&self, key: &str, updater: &dyn Fn(Option<&Value>) -> Value);
}

/// One entry of [`InMemoryCache`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CacheEntry {
    pub value: Option<Value>,
    pub stale: bool,
    pub invalidations: u64,
}

/// Mutex-guarded [`QueryCache`] for headless consumers and tests.
#[derive(Debug, Default)]
pub struct InMemoryCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a freshly fetched value and clears the stale flag.
    pub fn insert(&self, key: &str, value: Value) {
        let mut entries = self.entries();
        let entry = entries.entry(key.to_string()).or_default();
        entry.value = Some(value);
        entry.stale = false;
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.entries().get(key).and_then(|entry| entry.value.clone())
    }

    pub fn entry(&self, key: &str) -> Option<CacheEntry> {
        self.entries().get(key).cloned()
    }

    pub fn is_stale(&self, key: &str) -> bool {
        self.entries().get(key).is_some_and(|entry| entry.stale)
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, CacheEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl QueryCache for InMemoryCache {
    fn invalidate(&self, key: &str) {
        let mut entries = self.entries();
        let entry = entries.entry(key.to_string()).or_default();
        entry.stale = true;
        entry.invalidations += 1;
    }

    fn set_value(&self, key: &str, updater: &dyn Fn(Option<&Value>) -> Value) {
        let mut entries = self.entries();
        let entry = entries.entry(key.to_string()).or_default();
        entry.value = Some(updater(entry.value.as_ref()));
    }
}

/// Reads an unread counter value; absent or malformed counts as zero.
pub fn unread_count_of(value: Option<&Value>) -> u64 {
    value.and_then(Value::as_u64).unwrap_or(0)
}

/// Turns stream events into cache effects.
#[derive(Clone)]
pub struct NotificationCacheBridge {
    cache: Arc<dyn QueryCache>,
    on_notification: Option<NotificationCallback>,
    on_state_change: Option<StateChangeCallback>,
}

impl NotificationCacheBridge {
    pub fn new(cache: Arc<dyn QueryCache>) -> Self {
        Self {
            cache,
            on_notification: None,
            on_state_change: None,
        }
    }

    /// Forwards every pushed notification after the cache is updated.
    pub fn with_notification_callback(
        mut self,
        f: impl Fn(&NotificationEvent) + Send + Sync + 'static,
    ) -> Self {
        self.on_notification = Some(Arc::new(f));
        self
    }

    /// Forwards connection state changes.
    pub fn with_state_callback(mut self, f: impl Fn(ConnectionState) + Send + Sync + 'static) -> Self {
        self.on_state_change = Some(Arc::new(f));
        self
    }

    /// Counts the notification as unread, marks the list stale, and forwards
    /// the event.
    ///
    /// Redelivered events are counted again; there is no dedup store.
    pub fn apply_notification(&self, event: &NotificationEvent) {
        self.cache.set_value(UNREAD_COUNT_KEY, &|current| {
            Value::from(unread_count_of(current).saturating_add(1))
        });
        self.cache.invalidate(NOTIFICATIONS_KEY);
        debug!(event = "notification_cached", id = %event.id);

        if let Some(f) = self.on_notification.as_ref() {
            f(event);
        }
    }

    /// Forwards a state change. The cache is left untouched.
    pub fn apply_state_change(&self, state: ConnectionState) {
        if let Some(f) = self.on_state_change.as_ref() {
            f(state);
        }
    }

    /// Subscribes the bridge to `client`.
    ///
    /// The subscription lasts until the returned attachment is dropped.
    pub fn attach(&self, client: &StreamClient) -> BridgeAttachment {
        let on_notification = {
            let bridge = self.clone();
            client.on_notification(move |event| bridge.apply_notification(event))
        };
        let on_state_change = {
            let bridge = self.clone();
            client.on_state_change(move |state| bridge.apply_state_change(state))
        };

        BridgeAttachment {
            client: client.clone(),
            subscriptions: vec![on_notification, on_state_change],
        }
    }

    /// Marks one notification read.
    ///
    /// The counter is decremented before the request; if the request fails
    /// the counter is invalidated so the next fetch restores the truth. The
    /// list is invalidated either way.
    pub async fn mark_read(
        &self,
        api: &NotificationsApiClient,
        notification_id: &str,
    ) -> Result<(), ApiError> {
        self.cache.set_value(UNREAD_COUNT_KEY, &|current| {
            Value::from(unread_count_of(current).saturating_sub(1))
        });

        let result = api.mark_read(notification_id).await;
        self.settle_read_update(&result);
        result
    }

    /// Marks every notification read, optimistically zeroing the counter.
    pub async fn mark_all_read(&self, api: &NotificationsApiClient) -> Result<(), ApiError> {
        self.cache.set_value(UNREAD_COUNT_KEY, &|_| Value::from(0u64));

        let result = api.mark_all_read().await;
        self.settle_read_update(&result);
        result
    }

    /// Overwrites the counter with the server's unread count.
    pub async fn refresh_unread_count(&self, api: &NotificationsApiClient) -> Result<u64, ApiError> {
        let count = api.unread_count().await?;
        self.cache.set_value(UNREAD_COUNT_KEY, &|_| Value::from(count));
        Ok(count)
    }

    /// Refreshes the counter every `interval`, starting immediately.
    ///
    /// Failed polls are logged and the next tick tries again. A zero
    /// interval falls back to [`PortalDefaults::UNREAD_POLL_INTERVAL`].
    pub fn spawn_unread_poller(&self, api: NotificationsApiClient, interval: Duration) -> UnreadPoller {
        let interval = if interval.is_zero() {
            warn!(
                event = "unread_poll_interval_invalid",
                fallback_ms = PortalDefaults::UNREAD_POLL_INTERVAL.as_millis() as u64
            );
            PortalDefaults::UNREAD_POLL_INTERVAL
        } else {
            interval
        };
        let bridge = self.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match bridge.refresh_unread_count(&api).await {
                    Ok(count) => debug!(event = "unread_poll", count),
                    Err(err) => warn!(event = "unread_poll_failed", error = %err),
                }
            }
        });
        UnreadPoller { task }
    }

    fn settle_read_update(&self, result: &Result<(), ApiError>) {
        if let Err(err) = result {
            warn!(event = "mark_read_failed", error = %err);
            self.cache.invalidate(UNREAD_COUNT_KEY);
        }
        self.cache.invalidate(NOTIFICATIONS_KEY);
    }
}

impl fmt::Debug for NotificationCacheBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotificationCacheBridge")
            .field("on_notification", &self.on_notification.is_some())
            .field("on_state_change", &self.on_state_change.is_some())
            .finish()
    }
}

/// Live subscription of a bridge to a stream client.
#[derive(Debug)]
pub struct BridgeAttachment {
    client: StreamClient,
    subscriptions: Vec<SubscriptionId>,
}

impl BridgeAttachment {
    pub fn detach(self) {}
}

impl Drop for BridgeAttachment {
    fn drop(&mut self) {
        for id in self.subscriptions.drain(..) {
            self.client.unsubscribe(id);
        }
    }
}

/// Background unread-count refresh; stops when dropped.
#[derive(Debug)]
pub struct UnreadPoller {
    task: JoinHandle<()>,
}

impl UnreadPoller {
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    pub fn stop(self) {}
}

impl Drop for UnreadPoller {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::thread;

    use serde_json::{json, Value};

    use crate::api::NotificationsApiClient;
    use crate::config::PortalConfig;
    use crate::retry::RetryPolicy;
    use crate::stream::client::{ConnectionState, StreamClient, StreamClientOptions};
    use crate::stream::proto::decode_notification;
    use crate::stream::testing::{notification_payload, MockTransport};
    use crate::stream::transport::{EventTransport, TransportSignal};

    use super::*;

    fn bridge_with_cache() -> (Arc<InMemoryCache>, NotificationCacheBridge) {
        let cache = Arc::new(InMemoryCache::new());
        let shared: Arc<dyn QueryCache> = cache.clone();
        (cache, NotificationCacheBridge::new(shared))
    }

    fn connected_client(transport: &Arc<MockTransport>) -> StreamClient {
        let dyn_transport: Arc<dyn EventTransport> = transport.clone();
        let client = StreamClient::with_transport(
            "http://portal.test/api/stream",
            dyn_transport,
            StreamClientOptions::default(),
        );
        client.connect();
        transport.latest().emit(TransportSignal::Opened);
        client
    }

    fn push(transport: &Arc<MockTransport>, payload: &str) {
        transport.latest().emit(TransportSignal::Message {
            name: "notification".to_string(),
            data: payload.to_string(),
        });
    }

    #[test]
    fn pushed_notification_bumps_counter_and_invalidates_list() {
        let (cache, bridge) = bridge_with_cache();
        let forwarded = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&forwarded);
        let bridge = bridge.with_notification_callback(move |event| {
            sink.lock().unwrap().push(event.clone());
        });
        cache.insert(UNREAD_COUNT_KEY, json!(4));
        cache.insert(NOTIFICATIONS_KEY, json!([]));

        let transport = MockTransport::new();
        let client = connected_client(&transport);
        let _attachment = bridge.attach(&client);
        let payload = r#"{"id":"n1","category":"x","title":"t","body":"b","isRead":false,"createdAt":"2026-03-01T09:30:00Z"}"#;
        push(&transport, payload);

        assert_eq!(cache.get(UNREAD_COUNT_KEY), Some(json!(5)));
        assert!(cache.is_stale(NOTIFICATIONS_KEY));
        assert_eq!(cache.entry(NOTIFICATIONS_KEY).unwrap().invalidations, 1);
        assert_eq!(
            *forwarded.lock().unwrap(),
            vec![decode_notification(payload).unwrap()]
        );
    }

    #[test]
    fn absent_counter_starts_from_zero() {
        let (cache, bridge) = bridge_with_cache();
        let event = decode_notification(&notification_payload("n1")).unwrap();

        bridge.apply_notification(&event);
        bridge.apply_notification(&event);

        assert_eq!(cache.get(UNREAD_COUNT_KEY), Some(json!(2)));
    }

    #[test]
    fn malformed_push_touches_nothing() {
        let (cache, bridge) = bridge_with_cache();
        let transport = MockTransport::new();
        let client = connected_client(&transport);
        let _attachment = bridge.attach(&client);

        push(&transport, "not json");

        assert!(cache.entry(UNREAD_COUNT_KEY).is_none());
        assert!(cache.entry(NOTIFICATIONS_KEY).is_none());
    }

    #[test]
    fn state_changes_are_forwarded_without_cache_mutation() {
        let (cache, bridge) = bridge_with_cache();
        let states = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&states);
        let bridge = bridge.with_state_callback(move |state| sink.lock().unwrap().push(state));

        let transport = MockTransport::new();
        let dyn_transport: Arc<dyn EventTransport> = transport.clone();
        let client = StreamClient::with_transport(
            "http://portal.test/api/stream",
            dyn_transport,
            StreamClientOptions::default(),
        );
        let _attachment = bridge.attach(&client);
        client.connect();
        transport.latest().emit(TransportSignal::Opened);
        client.disconnect();

        assert_eq!(
            *states.lock().unwrap(),
            vec![
                ConnectionState::Connecting,
                ConnectionState::Connected,
                ConnectionState::Disconnected,
            ]
        );
        assert!(cache.entry(UNREAD_COUNT_KEY).is_none());
        assert!(cache.entry(NOTIFICATIONS_KEY).is_none());
    }

    #[test]
    fn detached_bridge_stops_applying_events() {
        let (cache, bridge) = bridge_with_cache();
        let transport = MockTransport::new();
        let client = connected_client(&transport);

        let attachment = bridge.attach(&client);
        push(&transport, &notification_payload("n1"));
        attachment.detach();
        push(&transport, &notification_payload("n2"));

        assert_eq!(cache.get(UNREAD_COUNT_KEY), Some(json!(1)));
    }

    #[test]
    fn duplicate_delivery_is_counted_twice() {
        let (cache, bridge) = bridge_with_cache();
        let transport = MockTransport::new();
        let client = connected_client(&transport);
        let _attachment = bridge.attach(&client);

        push(&transport, &notification_payload("n1"));
        push(&transport, &notification_payload("n1"));

        assert_eq!(cache.get(UNREAD_COUNT_KEY), Some(json!(2)));
    }

    #[test]
    fn concurrent_increments_are_not_lost() {
        let (cache, bridge) = bridge_with_cache();
        let event = decode_notification(&notification_payload("n1")).unwrap();

        let workers: Vec<_> = (0..8)
            .map(|_| {
                let bridge = bridge.clone();
                let event = event.clone();
                thread::spawn(move || {
                    for _ in 0..250 {
                        bridge.apply_notification(&event);
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        assert_eq!(cache.get(UNREAD_COUNT_KEY), Some(json!(2000)));
        assert_eq!(cache.entry(NOTIFICATIONS_KEY).unwrap().invalidations, 2000);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_poll_interval_keeps_the_poller_alive() {
        let (_cache, bridge) = bridge_with_cache();
        let config = PortalConfig::new("http://127.0.0.1:9/api").unwrap();
        let api = NotificationsApiClient::with_retry_policy(&config, RetryPolicy::none()).unwrap();

        let poller = bridge.spawn_unread_poller(api, Duration::ZERO);
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        assert!(poller.is_running());
        poller.stop();
    }

    #[test]
    fn unread_count_reader_tolerates_garbage() {
        assert_eq!(unread_count_of(None), 0);
        assert_eq!(unread_count_of(Some(&json!("three"))), 0);
        assert_eq!(unread_count_of(Some(&Value::from(3u64))), 3);
    }
}
