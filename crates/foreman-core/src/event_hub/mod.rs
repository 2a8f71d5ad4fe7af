//! Event Hub (§4.D).
//!
//! A process-wide, per-`project_id` publish/subscribe component. Unlike the
//! teacher's `async-stream`-based harness event streams (one subprocess, one
//! consumer), the hub fans a single publish out to an arbitrary number of
//! subscribers with independent bounded buffers, so a slow subscriber can
//! never block another or the publisher.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

/// Discriminated event envelope. `payload` is pre-serialized so publishers
/// don't need a `Clone` bound on arbitrary domain types.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: &'static str,
    pub payload: Value,
}

impl Event {
    pub fn new(event_type: &'static str, payload: impl Serialize) -> Self {
        Self {
            event_type,
            payload: serde_json::to_value(payload).unwrap_or(Value::Null),
        }
    }

    fn run_id(&self) -> Option<Uuid> {
        self.payload
            .get("run_id")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok())
    }

    fn is_log_event(&self) -> bool {
        self.event_type == "agent:log"
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SubscribeError {
    #[error("subscription limit ({limit}) reached for this user")]
    TooManySubscriptions { limit: usize },
}

/// What a subscriber wants delivered: all `agent:log` events, or only those
/// for a specific set of run ids. Non-log events are always delivered.
#[derive(Debug, Clone)]
pub enum LogSubscription {
    All,
    RunIds(Vec<Uuid>),
}

impl LogSubscription {
    fn wants(&self, run_id: Option<Uuid>) -> bool {
        match (self, run_id) {
            (LogSubscription::All, _) => true,
            (LogSubscription::RunIds(ids), Some(id)) => ids.contains(&id),
            (LogSubscription::RunIds(_), None) => false,
        }
    }
}

struct Subscriber {
    user_id: Uuid,
    log_subscriptions: LogSubscription,
    tx: mpsc::Sender<Event>,
}

struct ProjectTopic {
    subscribers: HashMap<Uuid, Subscriber>,
}

impl ProjectTopic {
    fn new() -> Self {
        Self { subscribers: HashMap::new() }
    }

    fn user_connection_count(&self, user_id: Uuid) -> usize {
        self.subscribers.values().filter(|s| s.user_id == user_id).count()
    }
}

/// The process-wide hub. Cloning it is cheap — it's a handle around shared
/// topic state.
#[derive(Clone)]
pub struct EventHub {
    topics: Arc<Mutex<HashMap<Uuid, ProjectTopic>>>,
    channel_buffer: usize,
    max_connections_per_user: usize,
    heartbeat_interval: Duration,
}

impl EventHub {
    pub fn new(
        channel_buffer: usize,
        max_connections_per_user: usize,
        heartbeat_interval: Duration,
    ) -> Self {
        Self {
            topics: Arc::new(Mutex::new(HashMap::new())),
            channel_buffer,
            max_connections_per_user,
            heartbeat_interval,
        }
    }

    /// `Subscribe(projectID, userID, logSubscriptions)`. Spawns a heartbeat
    /// ticker bound to the returned channel's lifetime.
    pub async fn subscribe(
        &self,
        project_id: Uuid,
        user_id: Uuid,
        log_subscriptions: LogSubscription,
    ) -> Result<(Uuid, mpsc::Receiver<Event>), SubscribeError> {
        let mut topics = self.topics.lock().await;
        let topic = topics.entry(project_id).or_insert_with(ProjectTopic::new);

        if topic.user_connection_count(user_id) >= self.max_connections_per_user {
            return Err(SubscribeError::TooManySubscriptions {
                limit: self.max_connections_per_user,
            });
        }

        let (tx, rx) = mpsc::channel(self.channel_buffer);
        let connection_id = Uuid::new_v4();
        topic.subscribers.insert(
            connection_id,
            Subscriber { user_id, log_subscriptions, tx: tx.clone() },
        );
        drop(topics);

        self.spawn_heartbeat(tx);

        tracing::info!(project_id = %project_id, user_id = %user_id, connection_id = %connection_id, "subscriber connected");
        Ok((connection_id, rx))
    }

    /// `cancel()` for a subscription: removes it from the topic so further
    /// publishes don't attempt delivery. The receiver may also simply be
    /// dropped; publish already tolerates a dead channel.
    pub async fn unsubscribe(&self, project_id: Uuid, connection_id: Uuid) {
        let mut topics = self.topics.lock().await;
        if let Some(topic) = topics.get_mut(&project_id) {
            topic.subscribers.remove(&connection_id);
        }
    }

    /// Publish `event` to every subscriber of `project_id`. Never blocks:
    /// a full buffer drops the oldest non-log event first; `agent:log`
    /// events themselves are dropped outright on a full buffer rather than
    /// evicting state events, and are filtered per-subscriber by
    /// `log_subscriptions`.
    pub async fn publish(&self, project_id: Uuid, event: Event) {
        let topics = self.topics.lock().await;
        let Some(topic) = topics.get(&project_id) else { return };

        let run_id = event.run_id();
        for subscriber in topic.subscribers.values() {
            if event.is_log_event() && !subscriber.log_subscriptions.wants(run_id) {
                continue;
            }
            deliver(&subscriber.tx, event.clone());
        }
    }

    fn spawn_heartbeat(&self, tx: mpsc::Sender<Event>) {
        let interval = self.heartbeat_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let event = Event::new("heartbeat", HeartbeatPayload { time: Utc::now() });
                if tx.try_send(event).is_err() {
                    // Either the buffer is full (next tick will try again) or
                    // the receiver is gone, in which case this loop should stop.
                    if tx.is_closed() {
                        break;
                    }
                }
            }
        });
    }
}

#[derive(Serialize)]
struct HeartbeatPayload {
    time: DateTime<Utc>,
}

/// Best-effort, non-blocking delivery with the drop-oldest-non-log policy.
/// `agent:log` is dropped outright on backpressure; everything else evicts
/// the subscriber's single oldest buffered event and retries once.
fn deliver(tx: &mpsc::Sender<Event>, event: Event) {
    if event.is_log_event() {
        if let Err(mpsc::error::TrySendError::Full(_)) = tx.try_send(event) {
            tracing::debug!("dropping agent:log event: subscriber buffer full");
        }
        return;
    }

    match tx.try_send(event) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(event)) => {
            // The channel has no "pop oldest" primitive; approximate the
            // policy by draining one buffered item (best-effort — if the
            // consumer races us and drains first, the resend still lands).
            let _ = tx.try_recv();
            if tx.try_send(event).is_err() {
                tracing::debug!("dropping event after eviction attempt: subscriber still full");
            }
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribe_and_publish_delivers_event() {
        let hub = EventHub::new(100, 5, Duration::from_secs(30));
        let project_id = Uuid::new_v4();
        let user_id = Uuid::new_v4();

        let (_conn, mut rx) = hub.subscribe(project_id, user_id, LogSubscription::All).await.unwrap();

        hub.publish(
            project_id,
            Event::new("task:status_changed", serde_json::json!({"task_id": Uuid::new_v4()})),
        )
        .await;

        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type, "task:status_changed");
    }

    #[tokio::test]
    async fn publish_to_unknown_project_is_a_noop() {
        let hub = EventHub::new(100, 5, Duration::from_secs(30));
        hub.publish(Uuid::new_v4(), Event::new("heartbeat", serde_json::json!({}))).await;
    }

    #[tokio::test]
    async fn per_user_subscription_cap_is_enforced() {
        let hub = EventHub::new(100, 2, Duration::from_secs(30));
        let project_id = Uuid::new_v4();
        let user_id = Uuid::new_v4();

        hub.subscribe(project_id, user_id, LogSubscription::All).await.unwrap();
        hub.subscribe(project_id, user_id, LogSubscription::All).await.unwrap();

        let err = hub.subscribe(project_id, user_id, LogSubscription::All).await.unwrap_err();
        assert!(matches!(err, SubscribeError::TooManySubscriptions { limit: 2 }));
    }

    #[tokio::test]
    async fn different_users_do_not_share_the_cap() {
        let hub = EventHub::new(100, 1, Duration::from_secs(30));
        let project_id = Uuid::new_v4();

        hub.subscribe(project_id, Uuid::new_v4(), LogSubscription::All).await.unwrap();
        hub.subscribe(project_id, Uuid::new_v4(), LogSubscription::All).await.unwrap();
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let hub = EventHub::new(100, 5, Duration::from_secs(30));
        let project_id = Uuid::new_v4();
        let user_id = Uuid::new_v4();

        let (conn, mut rx) = hub.subscribe(project_id, user_id, LogSubscription::All).await.unwrap();
        hub.unsubscribe(project_id, conn).await;

        hub.publish(project_id, Event::new("heartbeat", serde_json::json!({}))).await;

        let result = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn log_subscription_filters_by_run_id() {
        let hub = EventHub::new(100, 5, Duration::from_secs(30));
        let project_id = Uuid::new_v4();
        let user_id = Uuid::new_v4();
        let watched_run = Uuid::new_v4();
        let other_run = Uuid::new_v4();

        let (_conn, mut rx) = hub
            .subscribe(project_id, user_id, LogSubscription::RunIds(vec![watched_run]))
            .await
            .unwrap();

        hub.publish(
            project_id,
            Event::new("agent:log", serde_json::json!({"run_id": other_run, "line": "nope"})),
        )
        .await;
        hub.publish(
            project_id,
            Event::new("agent:log", serde_json::json!({"run_id": watched_run, "line": "yes"})),
        )
        .await;

        let event = tokio::time::timeout(Duration::from_millis(200), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.payload["line"], "yes");
    }

    #[tokio::test]
    async fn full_buffer_drops_log_events_without_blocking() {
        let hub = EventHub::new(1, 5, Duration::from_secs(30));
        let project_id = Uuid::new_v4();
        let user_id = Uuid::new_v4();

        let (_conn, rx) = hub.subscribe(project_id, user_id, LogSubscription::All).await.unwrap();
        // Fill the single-slot buffer with the heartbeat-free log events.
        for i in 0..5 {
            hub.publish(
                project_id,
                Event::new("agent:log", serde_json::json!({"run_id": Uuid::new_v4(), "line": i})),
            )
            .await;
        }
        drop(rx);
    }
}
