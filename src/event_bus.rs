use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};

const CHANNEL_CAPACITY: usize = 64;

/// Wire envelope for a single published event: `{event, data, projectId}`.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub event: String,
    pub data: serde_json::Value,
    pub project_id: String,
}

/// Formats an event using the SSE wire shape from §6.6:
/// `event: <name>\ndata: <json>\n\n`.
pub fn format_sse_frame(event: &Event) -> String {
    format!(
        "event: {}\ndata: {}\n\n",
        event.event,
        serde_json::to_string(&event.data).unwrap_or_else(|_| "null".to_string())
    )
}

/// One-way interface the pipeline depends on, decoupling it from any
/// concrete transport (SSE, a test recorder, ...). The pipeline never
/// constructs an `EventBus` directly — it's handed an `Arc<dyn
/// EventPublisher>`.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, project_id: &str, event_name: &str, data: serde_json::Value);
}

/// Per-project subscriber set with push semantics and drop-on-backpressure.
pub struct EventBus {
    subscribers: Mutex<HashMap<String, Vec<mpsc::Sender<Event>>>>,
}

impl EventBus {
    pub fn new() -> Arc<EventBus> {
        Arc::new(EventBus {
            subscribers: Mutex::new(HashMap::new()),
        })
    }

    /// Returns a receiver that observes every subsequent publish for
    /// `project_id`. Subscribing never replays history.
    pub async fn subscribe(&self, project_id: &str) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let mut subs = self.subscribers.lock().await;
        subs.entry(project_id.to_string()).or_default().push(tx);
        rx
    }

    /// Fans an event out to every live subscriber for `project_id`. A
    /// subscriber whose buffer is full (`try_send` fails) is dropped from
    /// the set rather than blocking the publisher.
    pub async fn publish_event(&self, project_id: &str, event_name: &str, data: serde_json::Value) {
        let event = Event {
            event: event_name.to_string(),
            data,
            project_id: project_id.to_string(),
        };
        let mut subs = self.subscribers.lock().await;
        if let Some(senders) = subs.get_mut(project_id) {
            senders.retain(|tx| tx.try_send(event.clone()).is_ok());
        }
    }

    pub async fn subscriber_count(&self, project_id: &str) -> usize {
        self.subscribers
            .lock()
            .await
            .get(project_id)
            .map(|s| s.len())
            .unwrap_or(0)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        EventBus {
            subscribers: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl EventPublisher for EventBus {
    async fn publish(&self, project_id: &str, event_name: &str, data: serde_json::Value) {
        self.publish_event(project_id, event_name, data).await;
    }
}

/// Test/ops double that records every published event in order instead of
/// fanning out over channels — used where a caller wants a total-order
/// audit trail rather than a live subscription.
pub struct RecordingEventPublisher {
    events: Mutex<Vec<Event>>,
}

impl RecordingEventPublisher {
    pub fn new() -> Self {
        RecordingEventPublisher {
            events: Mutex::new(Vec::new()),
        }
    }

    pub async fn events(&self) -> Vec<Event> {
        self.events.lock().await.clone()
    }
}

impl Default for RecordingEventPublisher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventPublisher for RecordingEventPublisher {
    async fn publish(&self, project_id: &str, event_name: &str, data: serde_json::Value) {
        self.events.lock().await.push(Event {
            event: event_name.to_string(),
            data,
            project_id: project_id.to_string(),
        });
    }
}
