//! Sharded user handles.
//!
//! A user the realm hands out is either *attached* — its mind is the IRC
//! connection terminating on this node — or a *remote proxy* standing in for
//! a connection on some other node. Both shapes answer the same calls; only
//! delivery differs: an attached mind writes PRIVMSG frames to its
//! connection, a proxy drops the record because the real node learns of it
//! through its own bus subscription.

use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use log::{debug, warn};
use tokio::sync::mpsc;

use crate::bus::{ChatRecord, MessageBus};
use crate::db::{self, DocStore};
use crate::group::ShardedGroup;
use crate::realm::RealmError;

// ─── Connection handle ───────────────────────────────────────────────────────

/// The writable side of one client connection. The connection's writer task
/// owns the socket; everything else (command replies, bus deliveries) funnels
/// through this queue.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    tx: mpsc::UnboundedSender<String>,
    /// Local server identity, used as the host part of origin prefixes.
    pub hostname: String,
}

impl ClientHandle {
    pub fn new(tx: mpsc::UnboundedSender<String>, hostname: impl Into<String>) -> Self {
        Self { tx, hostname: hostname.into() }
    }

    /// Queue one wire frame (without line terminator) for the connection.
    pub fn send_line(&self, line: impl Into<String>) {
        if self.tx.send(line.into()).is_err() {
            debug!("write queue closed; dropping frame");
        }
    }
}

// ─── Sharded user ────────────────────────────────────────────────────────────

pub enum Mind {
    /// The connection lives on this node.
    Local(ClientHandle),
    /// The connection lives elsewhere; this handle only answers lookups.
    Remote,
}

pub struct ShardedUser {
    pub name: String,
    mind: Mind,
    store: DocStore,
    bus: Arc<dyn MessageBus>,
    joined: RwLock<HashSet<String>>,
}

impl std::fmt::Debug for ShardedUser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardedUser").field("name", &self.name).finish_non_exhaustive()
    }
}

impl ShardedUser {
    pub fn attached(
        name: impl Into<String>,
        client: ClientHandle,
        store: DocStore,
        bus: Arc<dyn MessageBus>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            mind: Mind::Local(client),
            store,
            bus,
            joined: RwLock::new(HashSet::new()),
        })
    }

    pub fn remote_proxy(
        name: impl Into<String>,
        store: DocStore,
        bus: Arc<dyn MessageBus>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            mind: Mind::Remote,
            store,
            bus,
            joined: RwLock::new(HashSet::new()),
        })
    }

    pub fn is_attached(&self) -> bool {
        matches!(self.mind, Mind::Local(_))
    }

    pub fn client(&self) -> Option<&ClientHandle> {
        match &self.mind {
            Mind::Local(client) => Some(client),
            Mind::Remote => None,
        }
    }

    /// Deliver one chat message to this user. `target` is the wire form of
    /// the recipient (`#room`, or a nickname for direct messages).
    pub fn receive(&self, sender: &str, target: &str, text: &str) {
        match &self.mind {
            Mind::Local(client) => {
                for line in text.lines() {
                    client.send_line(format!(
                        ":{sender}!{sender}@{host} PRIVMSG {target} :{line}",
                        host = client.hostname
                    ));
                }
            }
            // The owning node relays through its own subscription.
            Mind::Remote => {
                debug!("proxy for {} ignoring message from {sender} to {target}", self.name)
            }
        }
    }

    /// Publish a message into a group this node has a handle for, bumping
    /// the session heartbeat on the way out.
    pub async fn send_to_group(&self, group: &ShardedGroup, text: &str) -> Result<(), RealmError> {
        self.store.heartbeat_user_session(&self.name).await?;
        group.send(self.record(format!("#{}", group.name), text));
        Ok(())
    }

    /// Publish a direct message on the recipient's nickname topic.
    pub async fn send_to_user(&self, recipient: &str, text: &str) -> Result<(), RealmError> {
        self.store.heartbeat_user_session(&self.name).await?;
        let topic = recipient.to_lowercase();
        let record = self.record(topic.clone(), text);
        if let Err(e) = self.bus.publish(&topic, record) {
            // Lost message, kept session: direct chat is best-effort.
            warn!("publish to user topic {topic} failed: {e}");
        }
        Ok(())
    }

    pub async fn join(self: &Arc<Self>, group: &Arc<ShardedGroup>) -> Result<(), RealmError> {
        group.add(self).await?;
        self.joined.write().expect("joined set poisoned").insert(group.name.clone());
        Ok(())
    }

    pub async fn leave(
        self: &Arc<Self>,
        group: &Arc<ShardedGroup>,
        reason: Option<&str>,
    ) -> Result<(), RealmError> {
        group.remove(&self.name, reason).await?;
        self.joined.write().expect("joined set poisoned").remove(&group.name);
        Ok(())
    }

    /// Names of the groups this handle has joined locally.
    pub fn joined_groups(&self) -> Vec<String> {
        let mut names: Vec<String> =
            self.joined.read().expect("joined set poisoned").iter().cloned().collect();
        names.sort();
        names
    }

    fn record(&self, recipient: String, text: &str) -> ChatRecord {
        ChatRecord {
            sender: self.name.clone(),
            recipient,
            text: text.to_string(),
            ts: db::now_ms(),
            sender_node: self.store.node_id().to_string(),
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;
    use crate::db::tests::mem_pool;

    async fn fixture() -> (DocStore, Arc<dyn MessageBus>) {
        let store = DocStore::new(mem_pool().await, "testserver");
        (store, Arc::new(MemoryBus::new()))
    }

    #[tokio::test]
    async fn attached_mind_formats_one_frame_per_line() {
        let (store, bus) = fixture().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let user =
            ShardedUser::attached("jane", ClientHandle::new(tx, "testserver"), store, bus);

        user.receive("john", "#room", "hi\nthere");

        assert_eq!(rx.recv().await.unwrap(), ":john!john@testserver PRIVMSG #room :hi");
        assert_eq!(rx.recv().await.unwrap(), ":john!john@testserver PRIVMSG #room :there");
    }

    #[tokio::test]
    async fn remote_proxy_swallows_deliveries() {
        let (store, bus) = fixture().await;
        let proxy = ShardedUser::remote_proxy("jane", store, bus);
        assert!(!proxy.is_attached());
        assert!(proxy.client().is_none());
        // Nothing to observe beyond "does not panic": the proxy has no socket.
        proxy.receive("john", "jane", "hello");
    }

    #[tokio::test]
    async fn direct_send_publishes_on_recipient_topic_and_heartbeats() {
        let (store, bus) = fixture().await;
        let (handler_tx, mut handler_rx) = mpsc::unbounded_channel();
        let handler: crate::bus::BusHandler = Arc::new(move |rec| {
            let _ = handler_tx.send(rec);
        });
        bus.subscribe("jane", "other-node", handler).unwrap();

        let (tx, _rx) = mpsc::unbounded_channel();
        let user = ShardedUser::attached(
            "john",
            ClientHandle::new(tx, "testserver"),
            store.clone(),
            bus,
        );
        user.send_to_user("Jane", "psst").await.unwrap();

        let rec = handler_rx.recv().await.unwrap();
        assert_eq!(rec.sender, "john");
        assert_eq!(rec.recipient, "jane");
        assert_eq!(rec.sender_node, "testserver");

        let session = store.lookup_user_session("john").await.unwrap().unwrap();
        assert!(session.active);
    }
}
