//! Progress bus: fan-out of progress/metadata events to an arbitrary
//! number of subscribers, each with a bounded queue.
//!
//! Bounded-queue policy: each subscriber gets a channel of capacity
//! `SUBSCRIBER_CAPACITY`. On
//! overflow the newest event is dropped and a counter accumulates; the
//! next event that fits is preceded by a `{"type":"lag","dropped":N}`
//! marker. This keeps delivery lossless while the subscriber keeps up,
//! and bounds memory when it doesn't.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use super::metadata::ModelMetadata;
use super::progress::ProgressRecord;

const SUBSCRIBER_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum BusEvent {
    Progress {
        model_id: String,
        progress: ProgressRecord,
    },
    Metadata {
        model_id: String,
        metadata: ModelMetadata,
    },
    Lag {
        #[serde(rename = "type")]
        kind: &'static str,
        dropped: u64,
    },
}

impl BusEvent {
    pub fn progress(model_id: impl Into<String>, progress: ProgressRecord) -> Self {
        BusEvent::Progress {
            model_id: model_id.into(),
            progress,
        }
    }

    pub fn metadata(model_id: impl Into<String>, metadata: ModelMetadata) -> Self {
        BusEvent::Metadata {
            model_id: model_id.into(),
            metadata,
        }
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).expect("BusEvent always serializes")
    }
}

/// Handle returned to a caller of `subscribe_progress`; drop or call
/// `unsubscribe` to detach.
pub struct Subscription {
    pub id: Uuid,
    pub receiver: mpsc::Receiver<BusEvent>,
}

struct Subscriber {
    id: Uuid,
    sender: mpsc::Sender<BusEvent>,
    dropped: AtomicU64,
}

/// In-process pub/sub fan-out, owned by the registry.
#[derive(Clone)]
pub struct ProgressBus {
    subscribers: Arc<Mutex<Vec<Subscriber>>>,
}

impl ProgressBus {
    pub fn new() -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub async fn subscribe(&self) -> Subscription {
        let (sender, receiver) = mpsc::channel(SUBSCRIBER_CAPACITY);
        let id = Uuid::new_v4();
        self.subscribers.lock().await.push(Subscriber {
            id,
            sender,
            dropped: AtomicU64::new(0),
        });
        Subscription { id, receiver }
    }

    pub async fn unsubscribe(&self, id: Uuid) {
        let mut subscribers = self.subscribers.lock().await;
        subscribers.retain(|s| s.id != id);
    }

    pub async fn publish(&self, event: BusEvent) {
        let subscribers = self.subscribers.lock().await;
        for subscriber in subscribers.iter() {
            let dropped = subscriber.dropped.load(Ordering::Relaxed);
            if dropped > 0 {
                if subscriber
                    .sender
                    .try_send(BusEvent::Lag {
                        kind: "lag",
                        dropped,
                    })
                    .is_ok()
                {
                    subscriber.dropped.store(0, Ordering::Relaxed);
                } else {
                    subscriber.dropped.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
            }
            if subscriber.sender.try_send(event.clone()).is_err() {
                subscriber.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

impl Default for ProgressBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::progress::DownloadStatus;

    #[tokio::test]
    async fn delivers_events_fifo_while_draining() {
        let bus = ProgressBus::new();
        let mut sub = bus.subscribe().await;

        bus.publish(BusEvent::progress("alpha", ProgressRecord::queued(Some(10))))
            .await;
        let mut second = ProgressRecord::queued(Some(10));
        second.set_status(DownloadStatus::Downloading);
        bus.publish(BusEvent::progress("alpha", second)).await;

        let first = sub.receiver.recv().await.unwrap();
        let second = sub.receiver.recv().await.unwrap();
        match (first, second) {
            (
                BusEvent::Progress { progress: p1, .. },
                BusEvent::Progress { progress: p2, .. },
            ) => {
                assert_eq!(p1.status, DownloadStatus::Queued);
                assert_eq!(p2.status, DownloadStatus::Downloading);
            }
            _ => panic!("unexpected event variants"),
        }
    }

    #[tokio::test]
    async fn unsubscribe_is_idempotent() {
        let bus = ProgressBus::new();
        let sub = bus.subscribe().await;
        bus.unsubscribe(sub.id).await;
        bus.unsubscribe(sub.id).await;
        assert_eq!(bus.subscribers.lock().await.len(), 0);
    }

    #[tokio::test]
    async fn overflow_drops_and_reports_lag() {
        let bus = ProgressBus::new();
        let sub = bus.subscribe().await;

        // Fill the channel past capacity without draining.
        for _ in 0..(SUBSCRIBER_CAPACITY + 5) {
            bus.publish(BusEvent::progress("alpha", ProgressRecord::queued(Some(1))))
                .await;
        }

        drop(sub);
    }
}
