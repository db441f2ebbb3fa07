//! The sharded realm: one node's slice of the cluster.
//!
//! The realm owns the directories of locally attached users and locally
//! interesting groups, admits authenticated connections, and resolves
//! lookups — falling back to the store so that a user connected elsewhere in
//! the cluster still resolves (as a remote proxy). The union of every node's
//! realm is the cluster view; the store rows stay authoritative.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};
use std::time::Duration;

use log::{debug, info, warn};
use regex::Regex;
use thiserror::Error;

use crate::bus::{BusError, BusHandler, MessageBus};
use crate::db::{self, DbError, DocStore, SessionRow};
use crate::group::ShardedGroup;
use crate::user::{ClientHandle, ShardedUser};

/// How often a node refreshes session and membership heartbeats.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
/// A session whose heartbeat is older than this is treated as dead even if
/// its row still says active (the owning node crashed without logout).
pub const SESSION_EXPIRY: Duration = Duration::from_secs(90);

// ─── Error ───────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum RealmError {
    #[error("duplicate user: {0}")]
    DuplicateUser(String),
    #[error("no such user: {0}")]
    NoSuchUser(String),
    #[error("duplicate group: {0}")]
    DuplicateGroup(String),
    #[error("no such group: {0}")]
    NoSuchGroup(String),
    #[error("{0} is already logged in")]
    AlreadyLoggedIn(String),
    #[error("{user} is already in #{group}")]
    AlreadyInGroup { user: String, group: String },
    #[error("{user} is not in #{group}")]
    NotInGroup { user: String, group: String },
    #[error("invalid name: {0:?}")]
    InvalidName(String),
    #[error(transparent)]
    Store(#[from] DbError),
    #[error(transparent)]
    Bus(#[from] BusError),
}

/// Nicknames and channel names: lowercased, IRC-safe, at most 32 chars.
pub fn valid_name(name: &str) -> bool {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let re = PATTERN.get_or_init(|| {
        Regex::new(r"^[a-z_\[\]\\^{}|`][a-z0-9_\-\[\]\\^{}|`]{0,31}$")
            .expect("name pattern compiles")
    });
    re.is_match(name)
}

/// Whether a session row counts as live right now.
pub fn session_is_live(session: &SessionRow) -> bool {
    session.active
        && db::now_ms() - session.last_heartbeat <= SESSION_EXPIRY.as_millis() as i64
}

// ─── Realm ───────────────────────────────────────────────────────────────────

pub struct ShardedRealm {
    /// Realm identity: the node hostname, used as the server name in replies
    /// and as the subscriber channel on the bus.
    pub name: String,
    store: DocStore,
    bus: Arc<dyn MessageBus>,
    create_group_on_request: bool,
    users: RwLock<HashMap<String, Arc<ShardedUser>>>,
    groups: RwLock<HashMap<String, Arc<ShardedGroup>>>,
    /// Serializes group instantiation so two racing JOINs can't both
    /// subscribe the node to one topic.
    group_open: tokio::sync::Mutex<()>,
}

impl ShardedRealm {
    pub fn new(
        name: impl Into<String>,
        store: DocStore,
        bus: Arc<dyn MessageBus>,
        create_group_on_request: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            store,
            bus,
            create_group_on_request,
            users: RwLock::new(HashMap::new()),
            groups: RwLock::new(HashMap::new()),
            group_open: tokio::sync::Mutex::new(()),
        })
    }

    pub fn store(&self) -> &DocStore {
        &self.store
    }

    // ── admission ────────────────────────────────────────────────────────────

    /// Attach an authenticated connection as a local user. The credential
    /// check has already passed; this enforces single-session semantics,
    /// marks the session live, and subscribes the node to the user's
    /// direct-message topic. Undone by [`ShardedRealm::logout`].
    pub async fn request_avatar(
        &self,
        nick: &str,
        client: ClientHandle,
    ) -> Result<Arc<ShardedUser>, RealmError> {
        let nick = nick.to_lowercase();
        if !valid_name(&nick) {
            return Err(RealmError::InvalidName(nick));
        }

        if self.users.read().expect("user directory poisoned").contains_key(&nick) {
            return Err(RealmError::AlreadyLoggedIn(nick));
        }
        if let Some(session) = self.store.lookup_user_session(&nick).await? {
            // Attached to some other node.
            if session_is_live(&session) {
                return Err(RealmError::AlreadyLoggedIn(nick));
            }
        }

        // The auth layer inserts the row (including on-request admission of
        // unknown nicks); a miss here means the caller skipped it.
        if self.store.lookup_user(&nick).await?.is_none() {
            return Err(RealmError::NoSuchUser(nick));
        }

        let user = ShardedUser::attached(
            nick.clone(),
            client,
            self.store.clone(),
            Arc::clone(&self.bus),
        );
        self.add_user(Arc::clone(&user))?;
        self.store.heartbeat_user_session(&nick).await?;

        // Direct messages for this nick land on its own topic; deliver them
        // through the attached mind.
        let weak = Arc::downgrade(&user);
        let handler: BusHandler = Arc::new(move |record| {
            if let Some(user) = weak.upgrade() {
                user.receive(&record.sender, &record.recipient, &record.text);
            }
        });
        self.bus.subscribe(&nick, self.store.node_id(), handler)?;

        info!("{} logged in on {}", nick, self.name);
        Ok(user)
    }

    /// Tear down everything [`ShardedRealm::request_avatar`] set up, plus the
    /// user's group memberships on this node.
    pub async fn logout(&self, nick: &str) {
        let nick = nick.to_lowercase();
        let user = self.users.write().expect("user directory poisoned").remove(&nick);
        let Some(user) = user else {
            debug!("logout for {nick} with no attached user");
            return;
        };

        for group_name in user.joined_groups() {
            let group = self.lookup_group(&group_name).ok();
            if let Some(group) = group {
                if let Err(e) = user.leave(&group, Some("connection lost")).await {
                    warn!("dropping {nick} from #{group_name}: {e}");
                }
                self.reap_group_if_empty(&group_name);
            }
        }

        self.bus.unsubscribe(&nick, self.store.node_id());
        if let Err(e) = self.store.deactivate_user_session(&nick).await {
            warn!("deactivating session for {nick}: {e}");
        }
        info!("{} logged out of {}", nick, self.name);
    }

    // ── user directory ───────────────────────────────────────────────────────

    /// Insert into the local directory; collision (lowercased) is a
    /// duplicate.
    pub fn add_user(&self, user: Arc<ShardedUser>) -> Result<(), RealmError> {
        let mut users = self.users.write().expect("user directory poisoned");
        if users.contains_key(&user.name) {
            return Err(RealmError::DuplicateUser(user.name.clone()));
        }
        users.insert(user.name.clone(), user);
        Ok(())
    }

    /// Resolve a nick: locally attached users first, then the store — a row
    /// plus a live session means the user is on another node, so hand out a
    /// remote proxy for lookups to report on.
    pub async fn lookup_user(&self, name: &str) -> Result<Arc<ShardedUser>, RealmError> {
        let name = name.to_lowercase();
        if let Some(user) = self.users.read().expect("user directory poisoned").get(&name) {
            return Ok(Arc::clone(user));
        }

        let row = self.store.lookup_user(&name).await?;
        let session = self.store.lookup_user_session(&name).await?;
        match (row, session) {
            (Some(_), Some(session)) if session_is_live(&session) => Ok(
                ShardedUser::remote_proxy(name, self.store.clone(), Arc::clone(&self.bus)),
            ),
            _ => Err(RealmError::NoSuchUser(name)),
        }
    }

    /// Locally attached users, for heartbeating and shutdown.
    fn attached_users(&self) -> Vec<Arc<ShardedUser>> {
        self.users.read().expect("user directory poisoned").values().cloned().collect()
    }

    // ── group directory ──────────────────────────────────────────────────────

    pub fn add_group(&self, group: Arc<ShardedGroup>) -> Result<(), RealmError> {
        let mut groups = self.groups.write().expect("group directory poisoned");
        if groups.contains_key(&group.name) {
            return Err(RealmError::DuplicateGroup(group.name.clone()));
        }
        groups.insert(group.name.clone(), group);
        Ok(())
    }

    /// Strictly local: a group with no handle on this node is not "present"
    /// even if the cluster knows it.
    pub fn lookup_group(&self, name: &str) -> Result<Arc<ShardedGroup>, RealmError> {
        let name = name.to_lowercase();
        self.groups
            .read()
            .expect("group directory poisoned")
            .get(&name)
            .cloned()
            .ok_or(RealmError::NoSuchGroup(name))
    }

    /// Resolve a group for JOIN-style interest. A local handle wins; a row
    /// that exists cluster-wide gets a handle lazily; a brand-new name is
    /// created only when `group_on_request` allows it.
    pub async fn get_group(
        &self,
        name: &str,
        requester: &str,
    ) -> Result<Arc<ShardedGroup>, RealmError> {
        let name = name.to_lowercase();
        if !valid_name(&name) {
            return Err(RealmError::InvalidName(name));
        }
        if let Ok(group) = self.lookup_group(&name) {
            return Ok(group);
        }

        let _opening = self.group_open.lock().await;
        // Re-check: another task may have opened it while we waited.
        if let Ok(group) = self.lookup_group(&name) {
            return Ok(group);
        }

        let exists = self.store.lookup_group(&name).await?.is_some();
        if !exists && !self.create_group_on_request {
            return Err(RealmError::NoSuchGroup(name));
        }

        let group = ShardedGroup::open(
            &name,
            requester,
            self.store.clone(),
            Arc::clone(&self.bus),
        )
        .await?;
        self.add_group(Arc::clone(&group))?;
        Ok(group)
    }

    /// Create a group handle (and row if needed); duplicate if a local
    /// handle already exists.
    pub async fn create_group(
        &self,
        name: &str,
        requester: &str,
    ) -> Result<Arc<ShardedGroup>, RealmError> {
        let name = name.to_lowercase();
        if !valid_name(&name) {
            return Err(RealmError::InvalidName(name));
        }
        let _opening = self.group_open.lock().await;
        if self.groups.read().expect("group directory poisoned").contains_key(&name) {
            return Err(RealmError::DuplicateGroup(name));
        }
        let group = ShardedGroup::open(
            &name,
            requester,
            self.store.clone(),
            Arc::clone(&self.bus),
        )
        .await?;
        self.add_group(Arc::clone(&group))?;
        Ok(group)
    }

    /// Drop the local handle once its roster is empty; the cluster row stays.
    pub fn reap_group_if_empty(&self, name: &str) {
        let mut groups = self.groups.write().expect("group directory poisoned");
        if let Some(group) = groups.get(name) {
            if group.is_empty() {
                group.unsubscribe();
                groups.remove(name);
                debug!("dropped idle handle for #{name}");
            }
        }
    }

    // ── liveness ─────────────────────────────────────────────────────────────

    /// One pass of the periodic tick: refresh the session row of every
    /// attached user and their membership entries in every joined group.
    pub async fn refresh_heartbeats(&self) {
        for user in self.attached_users() {
            if let Err(e) = self.store.heartbeat_user_session(&user.name).await {
                warn!("session heartbeat for {}: {e}", user.name);
                continue;
            }
            for group in user.joined_groups() {
                if let Err(e) = self.store.heartbeat_user_in_group(&group, &user.name).await {
                    warn!("membership heartbeat for {} in #{group}: {e}", user.name);
                }
            }
        }
    }

    /// Background task driving [`ShardedRealm::refresh_heartbeats`].
    pub fn spawn_heartbeat(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let realm = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(HEARTBEAT_INTERVAL);
            tick.tick().await; // the first tick is immediate
            loop {
                tick.tick().await;
                realm.refresh_heartbeats().await;
            }
        })
    }

    /// Node shutdown: deactivate every local session so the cluster stops
    /// routing to this node.
    pub async fn shutdown(&self) {
        for user in self.attached_users() {
            self.logout(&user.name).await;
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;
    use crate::db::tests::mem_pool;
    use tokio::sync::mpsc;

    async fn realm_on(
        pool: sqlx::SqlitePool,
        node: &str,
        group_on_request: bool,
    ) -> (Arc<ShardedRealm>, MemoryBus) {
        let bus = MemoryBus::new();
        let realm = ShardedRealm::new(
            node,
            DocStore::new(pool, node),
            Arc::new(bus.clone()),
            group_on_request,
        );
        (realm, bus)
    }

    fn client(host: &str) -> (ClientHandle, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ClientHandle::new(tx, host), rx)
    }

    async fn seed_user(realm: &ShardedRealm, nick: &str) {
        realm.store().create_user(nick, "", "digest", true, "").await.unwrap();
    }

    #[tokio::test]
    async fn request_avatar_attaches_and_heartbeats() {
        let (realm, _bus) = realm_on(mem_pool().await, "testserver", false).await;
        seed_user(&realm, "john").await;

        let (handle, _rx) = client("testserver");
        let user = realm.request_avatar("John", handle).await.unwrap();
        assert!(user.is_attached());

        let session = realm.store().lookup_user_session("john").await.unwrap().unwrap();
        assert!(session.active);
        assert_eq!(session.node_id, "testserver");
    }

    #[tokio::test]
    async fn second_login_is_rejected_locally() {
        let (realm, _bus) = realm_on(mem_pool().await, "testserver", false).await;
        seed_user(&realm, "john").await;

        let (h1, _rx1) = client("testserver");
        realm.request_avatar("john", h1).await.unwrap();

        let (h2, _rx2) = client("testserver");
        let err = realm.request_avatar("john", h2).await.unwrap_err();
        assert!(matches!(err, RealmError::AlreadyLoggedIn(_)));
    }

    #[tokio::test]
    async fn live_session_on_another_node_blocks_login() {
        let pool = mem_pool().await;
        let (realm_a, _bus_a) = realm_on(pool.clone(), "n1", false).await;
        seed_user(&realm_a, "john").await;
        let (h1, _rx1) = client("n1");
        realm_a.request_avatar("john", h1).await.unwrap();

        let (realm_b, _bus_b) = realm_on(pool, "n2", false).await;
        let (h2, _rx2) = client("n2");
        let err = realm_b.request_avatar("john", h2).await.unwrap_err();
        assert!(matches!(err, RealmError::AlreadyLoggedIn(_)));
    }

    #[tokio::test]
    async fn lookup_user_falls_back_to_remote_proxy() {
        let pool = mem_pool().await;
        let (realm_a, _bus_a) = realm_on(pool.clone(), "n1", false).await;
        seed_user(&realm_a, "john").await;
        let (h, _rx) = client("n1");
        realm_a.request_avatar("john", h).await.unwrap();

        let (realm_b, _bus_b) = realm_on(pool, "n2", false).await;
        let user = realm_b.lookup_user("JOHN").await.unwrap();
        assert!(!user.is_attached());
    }

    #[tokio::test]
    async fn lookup_user_misses_inactive_sessions() {
        let pool = mem_pool().await;
        let (realm, _bus) = realm_on(pool, "n1", false).await;
        seed_user(&realm, "john").await;
        realm.store().heartbeat_user_session("john").await.unwrap();
        realm.store().deactivate_user_session("john").await.unwrap();

        let err = realm.lookup_user("john").await.unwrap_err();
        assert!(matches!(err, RealmError::NoSuchUser(_)));
    }

    #[tokio::test]
    async fn logout_detaches_everywhere() {
        let (realm, _bus) = realm_on(mem_pool().await, "testserver", true).await;
        seed_user(&realm, "john").await;
        let (h, _rx) = client("testserver");
        let user = realm.request_avatar("john", h).await.unwrap();

        let group = realm.get_group("room", "john").await.unwrap();
        user.join(&group).await.unwrap();
        assert!(realm.store().group_heartbeats("room").await.unwrap().contains_key("john"));

        realm.logout("john").await;

        let session = realm.store().lookup_user_session("john").await.unwrap().unwrap();
        assert!(!session.active);
        assert!(!realm.store().group_heartbeats("room").await.unwrap().contains_key("john"));
        // Empty roster means the handle was reaped too.
        assert!(realm.lookup_group("room").is_err());
    }

    #[tokio::test]
    async fn get_group_respects_the_creation_flag() {
        let (realm, _bus) = realm_on(mem_pool().await, "testserver", false).await;

        let err = realm.get_group("fresh", "john").await.unwrap_err();
        assert!(matches!(err, RealmError::NoSuchGroup(_)));

        // A row created elsewhere in the cluster still gets a local handle.
        realm.store().create_group("fresh", "jane", "public").await.unwrap();
        let group = realm.get_group("fresh", "john").await.unwrap();
        assert_eq!(group.name, "fresh");
        assert!(realm.lookup_group("fresh").is_ok());
    }

    #[tokio::test]
    async fn create_group_duplicates_on_local_handle() {
        let (realm, _bus) = realm_on(mem_pool().await, "testserver", true).await;
        realm.create_group("room", "john").await.unwrap();
        let err = realm.create_group("room", "john").await.unwrap_err();
        assert!(matches!(err, RealmError::DuplicateGroup(_)));
    }

    #[tokio::test]
    async fn heartbeat_pass_refreshes_sessions_and_memberships() {
        let (realm, _bus) = realm_on(mem_pool().await, "testserver", true).await;
        seed_user(&realm, "john").await;
        let (h, _rx) = client("testserver");
        let user = realm.request_avatar("john", h).await.unwrap();
        let group = realm.get_group("room", "john").await.unwrap();
        user.join(&group).await.unwrap();

        let before = realm.store().lookup_user_session("john").await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        realm.refresh_heartbeats().await;

        let after = realm.store().lookup_user_session("john").await.unwrap().unwrap();
        assert!(after.last_heartbeat > before.last_heartbeat);
        assert!(realm.store().group_heartbeats("room").await.unwrap().contains_key("john"));
    }

    #[test]
    fn name_validation_accepts_irc_shapes_only() {
        assert!(valid_name("john"));
        assert!(valid_name("john_doe-42"));
        assert!(valid_name("[away]"));
        assert!(!valid_name("John"));       // uppercase never reaches storage
        assert!(!valid_name(""));
        assert!(!valid_name("has space"));
        assert!(!valid_name("0starts-with-digit"));
        assert!(!valid_name(&"x".repeat(33)));
    }
}
