//! Real-time notification bridge: one live connection per process, publishing
//! terminal state transitions to subscribers that match on event name plus a
//! partial-payload predicate.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{mpsc, watch};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

struct Subscription {
    id: SubscriptionId,
    event_name: String,
    predicate: serde_json::Value,
    sender: mpsc::UnboundedSender<serde_json::Value>,
}

/// The live transport session. Subscriptions live only as long as the
/// connection; nothing is persisted or replayed.
pub struct LiveConnection {
    subscriptions: Mutex<Vec<Subscription>>,
    next_id: AtomicU64,
}

impl LiveConnection {
    fn new() -> Self {
        Self {
            subscriptions: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a listener for `event_name`. The predicate is a JSON object
    /// that must be a subset of the published payload for delivery to fire.
    pub fn subscribe(
        &self,
        event_name: &str,
        predicate: serde_json::Value,
        sender: mpsc::UnboundedSender<serde_json::Value>,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscriptions.lock().unwrap().push(Subscription {
            id,
            event_name: event_name.to_string(),
            predicate,
            sender,
        });
        id
    }

    /// Remove exactly the listener registered under `id`.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.subscriptions.lock().unwrap().retain(|s| s.id != id);
    }

    /// Deliver `payload` once to every matching subscription. Closed
    /// receivers are pruned.
    pub fn publish(&self, event_name: &str, payload: &serde_json::Value) {
        let mut subscriptions = self.subscriptions.lock().unwrap();
        subscriptions.retain(|s| {
            if s.event_name != event_name || !subset_match(&s.predicate, payload) {
                return true;
            }
            s.sender.send(payload.clone()).is_ok()
        });
    }
}

/// True when every field of `predicate` appears, recursively, in `payload`.
fn subset_match(predicate: &serde_json::Value, payload: &serde_json::Value) -> bool {
    match predicate {
        serde_json::Value::Object(fields) => fields.iter().all(|(key, expected)| {
            payload
                .get(key)
                .map(|actual| subset_match(expected, actual))
                .unwrap_or(false)
        }),
        other => other == payload,
    }
}

/// Process-wide bridge holding at most one live connection. Early subscribers
/// await an explicit ready signal instead of polling.
pub struct NotificationBridge {
    connection: watch::Sender<Option<std::sync::Arc<LiveConnection>>>,
}

impl Default for NotificationBridge {
    fn default() -> Self {
        Self::new()
    }
}

impl NotificationBridge {
    pub fn new() -> Self {
        let (connection, _) = watch::channel(None);
        Self { connection }
    }

    /// Establish the live connection, or return the existing one.
    pub fn connect(&self) -> std::sync::Arc<LiveConnection> {
        let existing = self.connection.borrow().clone();
        if let Some(connection) = existing {
            return connection;
        }
        let connection = std::sync::Arc::new(LiveConnection::new());
        // send_replace stores the value even with no receiver subscribed.
        self.connection.send_replace(Some(connection.clone()));
        connection
    }

    /// Drop the live connection. Events published during the gap are lost;
    /// there is no replay log.
    pub fn disconnect(&self) {
        self.connection.send_replace(None);
    }

    /// Resolve the live connection, waiting for the ready signal if the
    /// transport has not been established yet.
    pub async fn connection(&self) -> std::sync::Arc<LiveConnection> {
        let mut rx = self.connection.subscribe();
        loop {
            if let Some(connection) = rx.borrow_and_update().clone() {
                return connection;
            }
            // The sender lives in self, so this cannot fail while the bridge
            // is alive.
            if rx.changed().await.is_err() {
                unreachable!("Notification bridge dropped while awaited");
            }
        }
    }

    /// Publish to the current connection, if any. With no live connection the
    /// event is dropped.
    pub fn publish(&self, event_name: &str, payload: serde_json::Value) {
        match self.connection.borrow().as_ref() {
            Some(connection) => connection.publish(event_name, &payload),
            None => debug!(event = event_name, "No live connection, dropping event"),
        }
    }
}

/// Build the notification envelope: `{<id field>, task, status}`.
pub fn envelope(id_field: &str, id: &str, task: &str, status: &str) -> serde_json::Value {
    let mut map = serde_json::Map::new();
    map.insert(
        id_field.to_string(),
        serde_json::Value::String(id.to_string()),
    );
    map.insert(
        "task".to_string(),
        serde_json::Value::String(task.to_string()),
    );
    map.insert(
        "status".to_string(),
        serde_json::Value::String(status.to_string()),
    );
    serde_json::Value::Object(map)
}

pub const STATUS_FINISHED: &str = "FINISHED";
pub const STATUS_ERRORED: &str = "ERRORED";
