//! In-process publish-subscribe with handler isolation.
//!
//! Each project context owns one bus. Delivery is sequential and
//! cooperative: the subscriber list is snapshotted before iteration so
//! handlers may subscribe or unsubscribe during delivery, and a failing
//! handler is isolated from the rest. History is a bounded ring; when
//! persistence is attached, published events are also written to the
//! `events` collection as the durable record.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, Mutex, RwLock};

use crate::error::{MarcusError, Result};
use crate::models::Event;
use crate::persistence::{collections, Persistence};

/// Default capacity of the in-memory event ring buffer
pub const DEFAULT_HISTORY_SIZE: usize = 1000;

/// Handler failures per event type within the window that trigger the
/// error-spike signal
pub const DEFAULT_ERROR_SPIKE_THRESHOLD: usize = 10;

/// Sliding window for the error-spike signal, in seconds
const ERROR_SPIKE_WINDOW_SECS: i64 = 300;

/// Topic that receives every event regardless of type
pub const WILDCARD_TOPIC: &str = "*";

/// A subscriber callback. Handlers are treated as untrusted for timing and
/// failure behavior: errors are caught, logged and counted, never retried.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &Event) -> Result<()>;
}

/// Adapter so plain async closures can subscribe
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Event) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<()>> + Send,
{
    async fn handle(&self, event: &Event) -> Result<()> {
        (self.0)(event.clone()).await
    }
}

/// Token returned by `subscribe`, used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

struct Subscriber {
    id: u64,
    handler: Arc<dyn EventHandler>,
}

#[derive(Default)]
struct ErrorTracker {
    total: u64,
    recent: VecDeque<DateTime<Utc>>,
}

struct BusInner {
    history_size: usize,
    spike_threshold: usize,
    subscribers: RwLock<HashMap<String, Vec<Subscriber>>>,
    next_subscriber_id: AtomicU64,
    history: Mutex<VecDeque<Event>>,
    handler_errors: Mutex<HashMap<String, ErrorTracker>>,
    persistence: Option<Arc<dyn Persistence>>,
    watch: broadcast::Sender<Event>,
}

/// The per-project event bus. Cheap to clone.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new(history_size: usize) -> Self {
        Self::build(history_size, None)
    }

    /// A bus that also writes published events to the `events` collection
    pub fn with_persistence(history_size: usize, persistence: Arc<dyn Persistence>) -> Self {
        Self::build(history_size, Some(persistence))
    }

    fn build(history_size: usize, persistence: Option<Arc<dyn Persistence>>) -> Self {
        let history_size = history_size.max(1);
        let (watch, _) = broadcast::channel(history_size.max(16));
        Self {
            inner: Arc::new(BusInner {
                history_size,
                spike_threshold: DEFAULT_ERROR_SPIKE_THRESHOLD,
                subscribers: RwLock::new(HashMap::new()),
                next_subscriber_id: AtomicU64::new(1),
                history: Mutex::new(VecDeque::with_capacity(history_size)),
                handler_errors: Mutex::new(HashMap::new()),
                persistence,
                watch,
            }),
        }
    }

    /// Register a handler for an event type, or for every event with the
    /// `"*"` topic
    pub async fn subscribe(
        &self,
        event_type: &str,
        handler: Arc<dyn EventHandler>,
    ) -> SubscriptionId {
        let id = self.inner.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        let mut subscribers = self.inner.subscribers.write().await;
        subscribers
            .entry(event_type.to_string())
            .or_default()
            .push(Subscriber { id, handler });
        SubscriptionId(id)
    }

    /// Remove a previously registered handler; returns whether it existed
    pub async fn unsubscribe(&self, event_type: &str, subscription: SubscriptionId) -> bool {
        let mut subscribers = self.inner.subscribers.write().await;
        if let Some(list) = subscribers.get_mut(event_type) {
            let before = list.len();
            list.retain(|s| s.id != subscription.0);
            return list.len() < before;
        }
        false
    }

    /// Publish an event: record history, persist when enabled, and deliver
    /// to each subscriber of the event's type plus the wildcard topic.
    ///
    /// Delivery order is the subscription order for a given topic; a
    /// handler error never short-circuits the remaining handlers.
    pub async fn publish(&self, event: Event) -> Event {
        self.record_history(&event).await;
        self.persist(&event).await;
        let _ = self.inner.watch.send(event.clone());

        // Snapshot before iterating so handlers can (un)subscribe freely
        // and no lock is held across a handler await.
        let handlers: Vec<Arc<dyn EventHandler>> = {
            let subscribers = self.inner.subscribers.read().await;
            let mut snapshot = Vec::new();
            if let Some(list) = subscribers.get(&event.event_type) {
                snapshot.extend(list.iter().map(|s| Arc::clone(&s.handler)));
            }
            if let Some(list) = subscribers.get(WILDCARD_TOPIC) {
                snapshot.extend(list.iter().map(|s| Arc::clone(&s.handler)));
            }
            snapshot
        };

        for handler in handlers {
            if let Err(err) = handler.handle(&event).await {
                self.record_handler_error(&event.event_type, &err).await;
            }
        }
        event
    }

    /// Schedule delivery and return immediately
    pub fn publish_nowait(&self, event: Event) {
        let bus = self.clone();
        tokio::spawn(async move {
            bus.publish(event).await;
        });
    }

    /// Wait for the next event matching `predicate`, up to `timeout`.
    ///
    /// A coordination primitive for tests; only events published after the
    /// call are observed.
    pub async fn wait_for_event<P>(&self, predicate: P, timeout: Duration) -> Result<Event>
    where
        P: Fn(&Event) -> bool,
    {
        let mut rx = self.inner.watch.subscribe();
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Err(MarcusError::timeout("wait_for_event"));
            }
            match tokio::time::timeout(remaining, rx.recv()).await {
                Ok(Ok(event)) => {
                    if predicate(&event) {
                        return Ok(event);
                    }
                }
                Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
                Ok(Err(broadcast::error::RecvError::Closed)) => {
                    return Err(MarcusError::transient("event stream closed"))
                }
                Err(_) => return Err(MarcusError::timeout("wait_for_event")),
            }
        }
    }

    /// Snapshot of the bounded event history, oldest first
    pub async fn history(&self) -> Vec<Event> {
        self.inner.history.lock().await.iter().cloned().collect()
    }

    /// Monotonic handler-error counter for an event type
    pub async fn handler_error_count(&self, event_type: &str) -> u64 {
        self.inner
            .handler_errors
            .lock()
            .await
            .get(event_type)
            .map(|t| t.total)
            .unwrap_or(0)
    }

    /// Drop every subscriber; used when a project context closes
    pub async fn clear_subscribers(&self) {
        self.inner.subscribers.write().await.clear();
    }

    async fn record_history(&self, event: &Event) {
        let mut history = self.inner.history.lock().await;
        // The ring drops the oldest entry under pressure; persistence is
        // the durable record.
        if history.len() >= self.inner.history_size {
            history.pop_front();
        }
        history.push_back(event.clone());
    }

    async fn persist(&self, event: &Event) {
        let Some(persistence) = &self.inner.persistence else {
            return;
        };
        let mut value = match serde_json::to_value(event) {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!(error = %err, event_type = %event.event_type, "Failed to serialize event");
                return;
            }
        };
        // Core emitters use the owning project id as the event source; the
        // stored row carries it under project_id for downstream filtering.
        if let serde_json::Value::Object(map) = &mut value {
            map.insert(
                "project_id".to_string(),
                serde_json::Value::String(event.source.clone()),
            );
        }
        if let Err(err) = persistence
            .store(collections::EVENTS, &event.event_id, value)
            .await
        {
            // Subscribers and the ring already observed the event; the
            // durable write is best-effort.
            tracing::warn!(error = %err, event_type = %event.event_type, "Failed to persist event");
        }
    }

    async fn record_handler_error(&self, event_type: &str, err: &MarcusError) {
        let now = Utc::now();
        let mut trackers = self.inner.handler_errors.lock().await;
        let tracker = trackers.entry(event_type.to_string()).or_default();
        tracker.total += 1;
        tracker.recent.push_back(now);
        while let Some(front) = tracker.recent.front() {
            if now - *front > chrono::Duration::seconds(ERROR_SPIKE_WINDOW_SECS) {
                tracker.recent.pop_front();
            } else {
                break;
            }
        }
        tracing::warn!(
            event_type,
            error = %err,
            total = tracker.total,
            "Event handler failed"
        );
        if tracker.recent.len() >= self.inner.spike_threshold {
            tracing::error!(
                severity = "critical",
                event_type,
                failures_in_window = tracker.recent.len(),
                "Event handler error spike detected"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::event_types;
    use serde_json::json;
    use std::sync::Mutex as StdMutex;

    struct Recorder {
        seen: Arc<StdMutex<Vec<String>>>,
        tag: String,
    }

    #[async_trait]
    impl EventHandler for Recorder {
        async fn handle(&self, event: &Event) -> Result<()> {
            self.seen
                .lock()
                .unwrap()
                .push(format!("{}:{}", self.tag, event.data["n"]));
            Ok(())
        }
    }

    struct AlwaysFails;

    #[async_trait]
    impl EventHandler for AlwaysFails {
        async fn handle(&self, _event: &Event) -> Result<()> {
            Err(MarcusError::integration("sink offline"))
        }
    }

    fn event(n: i64) -> Event {
        Event::new(event_types::TASK_CREATED, "test", json!({ "n": n }))
    }

    #[tokio::test]
    async fn delivery_is_fifo_per_subscriber() {
        let bus = EventBus::new(16);
        let seen = Arc::new(StdMutex::new(Vec::new()));
        bus.subscribe(
            event_types::TASK_CREATED,
            Arc::new(Recorder { seen: seen.clone(), tag: "a".into() }),
        )
        .await;

        for n in 0..5 {
            bus.publish(event(n)).await;
        }

        let seen = seen.lock().unwrap();
        assert_eq!(*seen, vec!["a:0", "a:1", "a:2", "a:3", "a:4"]);
    }

    #[tokio::test]
    async fn failing_handler_does_not_short_circuit_the_rest() {
        let bus = EventBus::new(16);
        let seen = Arc::new(StdMutex::new(Vec::new()));
        bus.subscribe(event_types::TASK_CREATED, Arc::new(AlwaysFails)).await;
        bus.subscribe(
            event_types::TASK_CREATED,
            Arc::new(Recorder { seen: seen.clone(), tag: "b".into() }),
        )
        .await;

        bus.publish(event(1)).await;

        assert_eq!(*seen.lock().unwrap(), vec!["b:1"]);
        assert_eq!(bus.handler_error_count(event_types::TASK_CREATED).await, 1);
    }

    #[tokio::test]
    async fn wildcard_subscribers_see_every_type() {
        let bus = EventBus::new(16);
        let seen = Arc::new(StdMutex::new(Vec::new()));
        bus.subscribe(
            WILDCARD_TOPIC,
            Arc::new(Recorder { seen: seen.clone(), tag: "w".into() }),
        )
        .await;

        bus.publish(Event::new(event_types::TASK_CREATED, "test", json!({"n": 1})))
            .await;
        bus.publish(Event::new(event_types::LEASE_EXPIRED, "test", json!({"n": 2})))
            .await;

        assert_eq!(*seen.lock().unwrap(), vec!["w:1", "w:2"]);
    }

    #[tokio::test]
    async fn history_ring_evicts_oldest() {
        let bus = EventBus::new(3);
        for n in 0..5 {
            bus.publish(event(n)).await;
        }
        let history = bus.history().await;
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].data["n"], 2);
        assert_eq!(history[2].data["n"], 4);
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let bus = EventBus::new(16);
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sub = bus
            .subscribe(
                event_types::TASK_CREATED,
                Arc::new(Recorder { seen: seen.clone(), tag: "a".into() }),
            )
            .await;

        bus.publish(event(1)).await;
        assert!(bus.unsubscribe(event_types::TASK_CREATED, sub).await);
        bus.publish(event(2)).await;

        assert_eq!(*seen.lock().unwrap(), vec!["a:1"]);
    }

    #[tokio::test]
    async fn wait_for_event_observes_future_publishes() {
        let bus = EventBus::new(16);
        let waiter = {
            let bus = bus.clone();
            tokio::spawn(async move {
                bus.wait_for_event(|e| e.data["n"] == 7, Duration::from_secs(2)).await
            })
        };
        tokio::task::yield_now().await;
        bus.publish(event(3)).await;
        bus.publish(event(7)).await;

        let found = waiter.await.unwrap().expect("event should arrive");
        assert_eq!(found.data["n"], 7);
    }

    #[tokio::test]
    async fn wait_for_event_times_out() {
        let bus = EventBus::new(16);
        let err = bus
            .wait_for_event(|_| true, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert_eq!(err.code, crate::error::ErrorCode::Timeout);
    }

    #[tokio::test]
    async fn publish_nowait_eventually_delivers() {
        let bus = EventBus::new(16);
        bus.publish_nowait(event(9));
        let found = bus
            .wait_for_event(|e| e.data["n"] == 9, Duration::from_secs(2))
            .await;
        // The spawned publish raced our wait; accept either path but the
        // event must land in history.
        if found.is_err() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        let history = bus.history().await;
        assert!(history.iter().any(|e| e.data["n"] == 9));
    }
}
