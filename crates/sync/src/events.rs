//! Notifications emitted by the sync engine.

use serde::Serialize;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncKind {
    Full,
    Incremental,
    Resolution,
}

/// `sync:started`, `sync:completed` and `sync:error`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event")]
pub enum SyncEvent {
    #[serde(rename = "sync:started")]
    Started {
        #[serde(rename = "type")]
        kind: SyncKind,
    },
    #[serde(rename = "sync:completed", rename_all = "camelCase")]
    Completed { conflicts: usize, auto_resolved: usize },
    #[serde(rename = "sync:error")]
    Error { error: String },
}

impl SyncEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Started { .. } => "sync:started",
            Self::Completed { .. } => "sync:completed",
            Self::Error { .. } => "sync:error",
        }
    }
}

/// Where the engine publishes events. Publishing never fails the sync.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: SyncEvent);
}

/// Reports events through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn publish(&self, event: SyncEvent) {
        match &event {
            SyncEvent::Started { kind } => tracing::debug!(event = event.name(), ?kind),
            SyncEvent::Completed {
                conflicts,
                auto_resolved,
            } => tracing::info!(event = event.name(), conflicts, auto_resolved),
            SyncEvent::Error { error } => tracing::warn!(event = event.name(), %error),
        }
    }
}

/// Forwards events to any number of subscribers.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: broadcast::Sender<SyncEvent>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.tx.subscribe()
    }
}

impl EventSink for ChannelSink {
    fn publish(&self, event: SyncEvent) {
        // No subscribers is not an error.
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_wire_names() {
        let started = serde_json::to_value(SyncEvent::Started {
            kind: SyncKind::Incremental,
        })
        .unwrap();
        assert_eq!(started, serde_json::json!({"event": "sync:started", "type": "incremental"}));

        let done = serde_json::to_value(SyncEvent::Completed {
            conflicts: 3,
            auto_resolved: 2,
        })
        .unwrap();
        assert_eq!(
            done,
            serde_json::json!({"event": "sync:completed", "conflicts": 3, "autoResolved": 2})
        );
    }

    #[test]
    fn channel_sink_fans_out() {
        let sink = ChannelSink::new(8);
        let mut a = sink.subscribe();
        let mut b = sink.subscribe();
        sink.publish(SyncEvent::Error {
            error: "offline".into(),
        });
        assert_eq!(a.try_recv().unwrap().name(), "sync:error");
        assert_eq!(b.try_recv().unwrap().name(), "sync:error");
    }

    #[test]
    fn publishing_without_subscribers_is_silent() {
        ChannelSink::new(1).publish(SyncEvent::Started {
            kind: SyncKind::Full,
        });
        TracingSink.publish(SyncEvent::Started {
            kind: SyncKind::Full,
        });
    }
}
