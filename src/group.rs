//! Sharded group: the per-channel hub on one node.
//!
//! A handle exists on a node only while someone local cares about the
//! channel. It owns the local roster, relays records arriving from the bus
//! to every attached member, publishes locally produced messages, and keeps
//! the store's membership heartbeats current.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use log::warn;

use crate::bus::{BusHandler, ChatRecord, MessageBus};
use crate::db::{DbError, DocStore};
use crate::realm::RealmError;
use crate::user::ShardedUser;

pub struct ShardedGroup {
    pub name: String,
    store: DocStore,
    bus: Arc<dyn MessageBus>,
    roster: RwLock<HashMap<String, Arc<ShardedUser>>>,
}

impl std::fmt::Debug for ShardedGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardedGroup").field("name", &self.name).finish_non_exhaustive()
    }
}

impl ShardedGroup {
    /// Resolve-or-create the group row, then subscribe this node to the
    /// channel's topic. The subscription holds only a weak reference, so a
    /// handle the realm has dropped stops relaying.
    pub async fn open(
        name: &str,
        owner: &str,
        store: DocStore,
        bus: Arc<dyn MessageBus>,
    ) -> Result<Arc<Self>, RealmError> {
        let name = name.to_lowercase();
        if store.lookup_group(&name).await?.is_none() {
            match store.create_group(&name, owner, "public").await {
                Ok(()) => {}
                // Raced another node creating the same row.
                Err(DbError::Duplicate { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }

        let group = Arc::new(Self {
            name: name.clone(),
            store: store.clone(),
            bus: Arc::clone(&bus),
            roster: RwLock::new(HashMap::new()),
        });

        let weak = Arc::downgrade(&group);
        let handler: BusHandler = Arc::new(move |record| {
            if let Some(group) = weak.upgrade() {
                group.receive(&record);
            }
        });
        bus.subscribe(&name, store.node_id(), handler)?;

        Ok(group)
    }

    /// Admit a locally attached user into the roster.
    pub async fn add(&self, user: &Arc<ShardedUser>) -> Result<(), RealmError> {
        {
            let mut roster = self.roster.write().expect("roster poisoned");
            if roster.contains_key(&user.name) {
                return Err(RealmError::AlreadyInGroup {
                    user: user.name.clone(),
                    group: self.name.clone(),
                });
            }
            roster.insert(user.name.clone(), Arc::clone(user));
        }
        self.store.heartbeat_user_in_group(&self.name, &user.name).await?;
        Ok(())
    }

    /// Remove a member from the roster and reap its heartbeat entry.
    pub async fn remove(&self, user: &str, reason: Option<&str>) -> Result<(), RealmError> {
        let removed = self.roster.write().expect("roster poisoned").remove(user);
        if removed.is_none() {
            return Err(RealmError::NotInGroup {
                user: user.to_string(),
                group: self.name.clone(),
            });
        }
        log::debug!(
            "{} left #{} ({})",
            user,
            self.name,
            reason.unwrap_or("leaving")
        );
        self.store.remove_user_from_group(&self.name, user).await?;
        Ok(())
    }

    /// Publish a record on this channel's topic. Failures are logged; local
    /// deliveries on other nodes are unaffected and the caller's session
    /// stays up.
    pub fn send(&self, record: ChatRecord) {
        if let Err(e) = self.bus.publish(&self.name, record) {
            warn!("publish on topic {} failed, message lost: {e}", self.name);
        }
    }

    /// Bus-side callback: relay one record to every locally attached member,
    /// suppressing the echo to the original sender when it was published
    /// from this node.
    pub fn receive(&self, record: &ChatRecord) {
        let members: Vec<Arc<ShardedUser>> = {
            let roster = self.roster.read().expect("roster poisoned");
            roster.values().cloned().collect()
        };

        let target = format!("#{}", self.name);
        let local_echo = record.sender_node == self.store.node_id();
        for member in members {
            if local_echo && member.name == record.sender {
                continue;
            }
            member.receive(&record.sender, &target, &record.text);
        }
    }

    /// Snapshot of the local roster's nicks, sorted for stable replies.
    pub fn iterusers(&self) -> Vec<String> {
        let mut names: Vec<String> =
            self.roster.read().expect("roster poisoned").keys().cloned().collect();
        names.sort();
        names
    }

    pub fn is_empty(&self) -> bool {
        self.roster.read().expect("roster poisoned").is_empty()
    }

    /// Write one meta field through to the store.
    pub async fn set_meta(&self, field: &str, value: &str) -> Result<(), RealmError> {
        self.store.set_group_meta(&self.name, field, value).await?;
        Ok(())
    }

    /// Drop this node's topic subscription (roster emptied or node shutdown).
    pub fn unsubscribe(&self) {
        self.bus.unsubscribe(&self.name, self.store.node_id());
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;
    use crate::db::tests::mem_pool;
    use crate::user::ClientHandle;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    fn node(node_id: &str, pool: sqlx::SqlitePool) -> DocStore {
        DocStore::new(pool, node_id)
    }

    fn attached(
        name: &str,
        store: &DocStore,
        bus: &MemoryBus,
        host: &str,
    ) -> (Arc<ShardedUser>, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let user = ShardedUser::attached(
            name,
            ClientHandle::new(tx, host),
            store.clone(),
            Arc::new(bus.clone()),
        );
        (user, rx)
    }

    #[tokio::test]
    async fn open_creates_the_row_once() {
        let pool = mem_pool().await;
        let bus = MemoryBus::new();
        let store = node("n1", pool.clone());

        let group =
            ShardedGroup::open("Room", "john", store.clone(), Arc::new(bus.clone())).await.unwrap();
        assert_eq!(group.name, "room");
        assert!(store.lookup_group("room").await.unwrap().is_some());

        // A second node opening the same channel reuses the row.
        let store2 = node("n2", pool);
        let group2 =
            ShardedGroup::open("room", "jane", store2, Arc::new(bus.clone())).await.unwrap();
        assert!(group2.is_empty());
    }

    #[tokio::test]
    async fn add_is_duplicate_safe_and_heartbeats() {
        let pool = mem_pool().await;
        let bus = MemoryBus::new();
        let store = node("n1", pool);
        let group =
            ShardedGroup::open("room", "john", store.clone(), Arc::new(bus.clone())).await.unwrap();

        let (john, _rx) = attached("john", &store, &bus, "n1");
        group.add(&john).await.unwrap();
        assert_eq!(group.iterusers(), vec!["john"]);
        assert!(store.group_heartbeats("room").await.unwrap().contains_key("john"));

        let err = group.add(&john).await.unwrap_err();
        assert!(matches!(err, RealmError::AlreadyInGroup { .. }));
    }

    #[tokio::test]
    async fn remove_reaps_heartbeat_and_rejects_strangers() {
        let pool = mem_pool().await;
        let bus = MemoryBus::new();
        let store = node("n1", pool);
        let group =
            ShardedGroup::open("room", "john", store.clone(), Arc::new(bus.clone())).await.unwrap();

        let (john, _rx) = attached("john", &store, &bus, "n1");
        group.add(&john).await.unwrap();
        group.remove("john", Some("bye")).await.unwrap();
        assert!(group.is_empty());
        assert!(!store.group_heartbeats("room").await.unwrap().contains_key("john"));

        let err = group.remove("john", None).await.unwrap_err();
        assert!(matches!(err, RealmError::NotInGroup { .. }));
    }

    #[tokio::test]
    async fn cross_node_delivery_suppresses_sender_echo() {
        let pool = mem_pool().await;
        let bus = MemoryBus::new();
        let store1 = node("n1", pool.clone());
        let store2 = node("n2", pool);

        let g1 =
            ShardedGroup::open("room", "john", store1.clone(), Arc::new(bus.clone())).await.unwrap();
        let g2 =
            ShardedGroup::open("room", "jane", store2.clone(), Arc::new(bus.clone())).await.unwrap();

        let (john, mut john_rx) = attached("john", &store1, &bus, "testserver");
        let (jane, mut jane_rx) = attached("jane", &store2, &bus, "testserver");
        g1.add(&john).await.unwrap();
        g2.add(&jane).await.unwrap();

        john.send_to_group(&g1, "hi").await.unwrap();

        let frame = timeout(Duration::from_secs(1), jane_rx.recv()).await.unwrap().unwrap();
        assert_eq!(frame, ":john!john@testserver PRIVMSG #room :hi");
        // Echo back to the sender is suppressed.
        assert!(timeout(Duration::from_millis(100), john_rx.recv()).await.is_err());
    }

    #[tokio::test]
    async fn same_node_bystander_still_receives() {
        let pool = mem_pool().await;
        let bus = MemoryBus::new();
        let store = node("n1", pool);
        let group =
            ShardedGroup::open("room", "john", store.clone(), Arc::new(bus.clone())).await.unwrap();

        let (john, mut john_rx) = attached("john", &store, &bus, "n1");
        let (jane, mut jane_rx) = attached("jane", &store, &bus, "n1");
        group.add(&john).await.unwrap();
        group.add(&jane).await.unwrap();

        john.send_to_group(&group, "hi").await.unwrap();

        assert!(timeout(Duration::from_secs(1), jane_rx.recv()).await.unwrap().is_some());
        assert!(timeout(Duration::from_millis(100), john_rx.recv()).await.is_err());
    }

    #[tokio::test]
    async fn dropped_handle_stops_relaying() {
        let pool = mem_pool().await;
        let bus = MemoryBus::new();
        let store = node("n1", pool);
        let group =
            ShardedGroup::open("room", "john", store.clone(), Arc::new(bus.clone())).await.unwrap();

        let (jane, mut jane_rx) = attached("jane", &store, &bus, "n1");
        group.add(&jane).await.unwrap();
        group.unsubscribe();
        drop(group);

        let other = bus.clone();
        other
            .publish(
                "room",
                ChatRecord {
                    sender: "john".into(),
                    recipient: "#room".into(),
                    text: "anyone?".into(),
                    ts: 1,
                    sender_node: "n2".into(),
                },
            )
            .unwrap();

        assert!(timeout(Duration::from_millis(100), jane_rx.recv()).await.is_err());
        drop(jane);
    }
}
