//! Cluster message bus facade.
//!
//! A topic carries one conversation (a channel's name, or a nickname for
//! direct messages); a bus channel is a subscriber identity — every node
//! subscribes with its own hostname, so each distinct channel on a topic
//! receives every record published there. Delivery is fire-and-forget,
//! at-least-once, ordered per publisher/topic pair on a best-effort basis.
//!
//! The trait is the seam for a real cluster driver. `MemoryBus` is the
//! in-process hub: handles cloned from one hub form one cluster, which is
//! what a single-node deployment and the test suite use.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

// ─── Record ──────────────────────────────────────────────────────────────────

/// The self-describing payload every publisher puts on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatRecord {
    pub sender: String,
    pub recipient: String,
    pub text: String,
    /// Unix milliseconds at send time.
    pub ts: i64,
    /// Hostname of the node the sender is attached to; used for echo
    /// suppression on the subscribing side.
    pub sender_node: String,
}

// ─── Error ───────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus backend unavailable: {0}")]
    Backend(String),
}

// ─── Facade ──────────────────────────────────────────────────────────────────

/// Invoked off the publisher's thread, once per record, in the order the bus
/// reports them. Must tolerate running concurrently with roster mutation on
/// the owning side.
pub type BusHandler = Arc<dyn Fn(ChatRecord) + Send + Sync>;

pub trait MessageBus: Send + Sync {
    /// Best-effort broadcast of `record` to every channel subscribed on
    /// `topic`.
    fn publish(&self, topic: &str, record: ChatRecord) -> Result<(), BusError>;

    /// Register `handler` for every record published on `topic` after this
    /// call. Re-subscribing an existing (topic, channel) pair replaces the
    /// previous handler.
    fn subscribe(&self, topic: &str, channel: &str, handler: BusHandler) -> Result<(), BusError>;

    fn unsubscribe(&self, topic: &str, channel: &str);
}

// ─── In-process hub ──────────────────────────────────────────────────────────

type SubscriberMap = HashMap<String, HashMap<String, mpsc::UnboundedSender<ChatRecord>>>;

/// Hub-backed bus. Each subscription owns an unbounded queue drained by its
/// own tokio task, so handlers never run on the publisher's stack and
/// per-topic order is preserved.
#[derive(Clone, Default)]
pub struct MemoryBus {
    topics: Arc<RwLock<SubscriberMap>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MessageBus for MemoryBus {
    fn publish(&self, topic: &str, record: ChatRecord) -> Result<(), BusError> {
        let topics = self.topics.read().expect("bus registry poisoned");
        if let Some(channels) = topics.get(topic) {
            for (channel, tx) in channels {
                if tx.send(record.clone()).is_err() {
                    // Drain task is gone; the channel will be replaced or
                    // removed by its owner.
                    warn!("dropping record for dead subscriber {channel} on topic {topic}");
                }
            }
        } else {
            debug!("publish on topic {topic} with no subscribers");
        }
        Ok(())
    }

    fn subscribe(&self, topic: &str, channel: &str, handler: BusHandler) -> Result<(), BusError> {
        let (tx, mut rx) = mpsc::unbounded_channel::<ChatRecord>();
        tokio::spawn(async move {
            while let Some(record) = rx.recv().await {
                handler(record);
            }
        });

        let mut topics = self.topics.write().expect("bus registry poisoned");
        topics.entry(topic.to_string()).or_default().insert(channel.to_string(), tx);
        Ok(())
    }

    fn unsubscribe(&self, topic: &str, channel: &str) {
        let mut topics = self.topics.write().expect("bus registry poisoned");
        if let Some(channels) = topics.get_mut(topic) {
            channels.remove(channel);
            if channels.is_empty() {
                topics.remove(topic);
            }
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn record(text: &str) -> ChatRecord {
        ChatRecord {
            sender: "john".into(),
            recipient: "room".into(),
            text: text.into(),
            ts: 1,
            sender_node: "n1".into(),
        }
    }

    /// Forward records into an inspectable queue.
    fn capture() -> (BusHandler, mpsc::UnboundedReceiver<ChatRecord>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler: BusHandler = Arc::new(move |rec| {
            let _ = tx.send(rec);
        });
        (handler, rx)
    }

    #[tokio::test]
    async fn subscriber_receives_published_record() {
        let bus = MemoryBus::new();
        let (handler, mut rx) = capture();
        bus.subscribe("room", "n1", handler).unwrap();

        bus.publish("room", record("hi")).unwrap();

        let got = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        assert_eq!(got.text, "hi");
    }

    #[tokio::test]
    async fn distinct_channels_fan_out() {
        let bus = MemoryBus::new();
        let (h1, mut rx1) = capture();
        let (h2, mut rx2) = capture();
        bus.subscribe("room", "n1", h1).unwrap();
        bus.subscribe("room", "n2", h2).unwrap();

        bus.publish("room", record("hi")).unwrap();

        assert!(timeout(Duration::from_secs(1), rx1.recv()).await.unwrap().is_some());
        assert!(timeout(Duration::from_secs(1), rx2.recv()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn clones_share_one_cluster() {
        let bus = MemoryBus::new();
        let other_node = bus.clone();
        let (handler, mut rx) = capture();
        bus.subscribe("room", "n1", handler).unwrap();

        other_node.publish("room", record("cross-node")).unwrap();

        let got = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        assert_eq!(got.text, "cross-node");
    }

    #[tokio::test]
    async fn per_topic_order_is_preserved() {
        let bus = MemoryBus::new();
        let (handler, mut rx) = capture();
        bus.subscribe("room", "n1", handler).unwrap();

        for i in 0..16 {
            bus.publish("room", record(&i.to_string())).unwrap();
        }
        for i in 0..16 {
            let got = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
            assert_eq!(got.text, i.to_string());
        }
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let bus = MemoryBus::new();
        let (handler, mut rx) = capture();
        bus.subscribe("room", "n1", handler).unwrap();
        bus.unsubscribe("room", "n1");

        bus.publish("room", record("late")).unwrap();

        assert!(timeout(Duration::from_millis(100), rx.recv()).await.is_err());
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_fire_and_forget() {
        let bus = MemoryBus::new();
        assert!(bus.publish("empty", record("x")).is_ok());
    }

    #[test]
    fn record_wire_shape_is_self_describing() {
        let rec = record("hi");
        let json = serde_json::to_value(&rec).unwrap();
        assert_eq!(json["sender"], "john");
        assert_eq!(json["sender_node"], "n1");
        let back: ChatRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, rec);
    }
}
