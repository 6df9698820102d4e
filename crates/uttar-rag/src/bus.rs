//! Process-wide keyed pub/sub for ingestion progress and generation
//! cancellation.
//!
//! Keys are document ids (progress) or session ids (cancellation). Polling
//! reads the last published state (last-writer-wins); subscribing yields
//! every event published after the subscription, in publish order for that
//! key. There is no ordering across keys. Entries expire after 24 hours.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Event payload carried on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BusEvent {
    /// Ingestion progress for a document.
    Progress {
        progress: i64,
        stage: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// A stop was requested for a streaming generation.
    Cancel,
}

struct Entry {
    latest: BusEvent,
    updated_at: DateTime<Utc>,
    sender: broadcast::Sender<BusEvent>,
}

const SUBSCRIBER_BUFFER: usize = 64;
const ENTRY_TTL_HOURS: i64 = 24;

/// Keyed last-writer-wins state plus broadcast fan-out.
pub struct ProgressBus {
    entries: DashMap<Uuid, Entry>,
}

impl Default for ProgressBus {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressBus {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Publish an event under `key`. Subscribers that lag beyond the buffer
    /// miss intermediate events but always observe the latest via `poll`.
    pub fn publish(&self, key: Uuid, event: BusEvent) {
        let mut entry = self.entries.entry(key).or_insert_with(|| {
            let (sender, _) = broadcast::channel(SUBSCRIBER_BUFFER);
            Entry {
                latest: event.clone(),
                updated_at: Utc::now(),
                sender,
            }
        });
        entry.latest = event.clone();
        entry.updated_at = Utc::now();
        // Send fails only when there are no live subscribers; polling still works.
        let _ = entry.sender.send(event);
    }

    /// Latest state for `key`, if any was published within the TTL.
    pub fn poll(&self, key: Uuid) -> Option<BusEvent> {
        self.entries.get(&key).map(|e| e.latest.clone())
    }

    /// Subscribe to events published after this call.
    pub fn subscribe(&self, key: Uuid) -> broadcast::Receiver<BusEvent> {
        let entry = self.entries.entry(key).or_insert_with(|| {
            let (sender, _) = broadcast::channel(SUBSCRIBER_BUFFER);
            Entry {
                latest: BusEvent::Progress {
                    progress: 0,
                    stage: "pending".into(),
                    error: None,
                },
                updated_at: Utc::now(),
                sender,
            }
        });
        entry.sender.subscribe()
    }

    /// Request cancellation for `key` (session id).
    pub fn request_cancel(&self, key: Uuid) {
        self.publish(key, BusEvent::Cancel);
    }

    /// True when a cancel was requested for `key`.
    pub fn is_cancelled(&self, key: Uuid) -> bool {
        matches!(self.poll(key), Some(BusEvent::Cancel))
    }

    /// Drop the state for `key` (e.g. when a new generation starts for a
    /// session, the previous cancel must not carry over).
    pub fn clear(&self, key: Uuid) {
        self.entries.remove(&key);
    }

    /// Remove entries older than 24 hours. Called from a periodic sweeper.
    pub fn sweep_expired(&self) -> usize {
        let cutoff = Utc::now() - Duration::hours(ENTRY_TTL_HOURS);
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.updated_at > cutoff);
        before - self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn progress(progress: i64, stage: &str) -> BusEvent {
        BusEvent::Progress {
            progress,
            stage: stage.into(),
            error: None,
        }
    }

    #[test]
    fn test_poll_returns_latest() {
        let bus = ProgressBus::new();
        let key = Uuid::new_v4();
        bus.publish(key, progress(10, "parsing"));
        bus.publish(key, progress(30, "chunking"));
        assert_eq!(bus.poll(key), Some(progress(30, "chunking")));
    }

    #[test]
    fn test_poll_unknown_key_is_none() {
        let bus = ProgressBus::new();
        assert_eq!(bus.poll(Uuid::new_v4()), None);
    }

    #[tokio::test]
    async fn test_subscribe_receives_in_publish_order() {
        let bus = ProgressBus::new();
        let key = Uuid::new_v4();
        let mut rx = bus.subscribe(key);
        bus.publish(key, progress(10, "parsing"));
        bus.publish(key, progress(30, "chunking"));
        assert_eq!(rx.recv().await.unwrap(), progress(10, "parsing"));
        assert_eq!(rx.recv().await.unwrap(), progress(30, "chunking"));
    }

    #[test]
    fn test_keys_are_independent() {
        let bus = ProgressBus::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        bus.publish(a, progress(50, "embedding"));
        assert_eq!(bus.poll(b), None);
        assert!(!bus.is_cancelled(b));
    }

    #[test]
    fn test_cancel_roundtrip() {
        let bus = ProgressBus::new();
        let key = Uuid::new_v4();
        assert!(!bus.is_cancelled(key));
        bus.request_cancel(key);
        assert!(bus.is_cancelled(key));
        bus.clear(key);
        assert!(!bus.is_cancelled(key));
    }

    #[test]
    fn test_sweep_keeps_fresh_entries() {
        let bus = ProgressBus::new();
        let key = Uuid::new_v4();
        bus.publish(key, progress(100, "completed"));
        assert_eq!(bus.sweep_expired(), 0);
        assert!(bus.poll(key).is_some());
    }
}
