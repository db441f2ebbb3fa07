//! shardirc — a horizontally shardable IRC chat server.
//!
//! Any client may connect to any node, join any channel, and talk to peers
//! whose connections terminate elsewhere. A shared document store holds the
//! authoritative user directory, group directory, and liveness; a cluster
//! pub/sub bus carries chat records between nodes. Each node runs a sharded
//! realm reconciling its local users and groups against that state, and an
//! RFC 2812 adapter translating client commands into realm operations.

pub mod auth;
pub mod bus;
pub mod config;
pub mod conn;
pub mod db;
pub mod group;
pub mod irc;
pub mod realm;
pub mod server;
pub mod user;

pub use auth::Authenticator;
pub use bus::{ChatRecord, MemoryBus, MessageBus};
pub use config::Config;
pub use db::DocStore;
pub use group::ShardedGroup;
pub use realm::{RealmError, ShardedRealm};
pub use server::{Node, ServerInfo};
pub use user::{ClientHandle, ShardedUser};
