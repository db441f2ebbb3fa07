//! Node bootstrap, the TCP listener, and process lifecycle.

use std::sync::Arc;

use log::info;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use tokio::net::TcpListener;

use crate::auth::Authenticator;
use crate::bus::MessageBus;
use crate::config::Config;
use crate::conn;
use crate::db::{self, DbError, DocStore};
use crate::realm::ShardedRealm;

/// Identity strings baked into the registration burst.
#[derive(Debug, Clone)]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
    pub created: String,
}

/// Everything one node shares across its connections: the resolved config
/// plus the store facade, bus facade, realm, and credential checker.
pub struct Node {
    pub config: Config,
    pub store: DocStore,
    pub bus: Arc<dyn MessageBus>,
    pub realm: Arc<ShardedRealm>,
    pub auth: Authenticator,
    pub info: ServerInfo,
}

impl Node {
    /// Wire a node over an already-connected pool: bootstrap the collections
    /// and build the per-process dependency set.
    pub async fn bootstrap(
        config: Config,
        pool: SqlitePool,
        bus: Arc<dyn MessageBus>,
    ) -> Result<Arc<Self>, DbError> {
        db::run_migrations(&pool).await?;

        let store = DocStore::new(pool, &config.hostname);
        let realm = ShardedRealm::new(
            &config.hostname,
            store.clone(),
            Arc::clone(&bus),
            config.group_on_request,
        );
        let auth = Authenticator::new(store.clone(), config.user_on_request);
        let info = ServerInfo {
            name: config.hostname.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            created: chrono::Utc::now().to_rfc2822(),
        };

        Ok(Arc::new(Self { config, store, bus, realm, auth, info }))
    }

    /// Connect the configured database and bootstrap. An unreachable store
    /// here is fatal to the process.
    pub async fn connect(config: Config, bus: Arc<dyn MessageBus>) -> Result<Arc<Self>, DbError> {
        let pool = SqlitePoolOptions::new().connect(&config.db_url()).await?;
        Self::bootstrap(config, pool, bus).await
    }

    /// Deactivate every local session so the cluster stops routing here.
    pub async fn shutdown(&self) {
        self.realm.shutdown().await;
    }
}

/// Accept loop: one task per client connection.
pub async fn run(node: Arc<Node>, listener: TcpListener) -> std::io::Result<()> {
    loop {
        let (stream, addr) = listener.accept().await?;
        info!("accepted connection from {addr}");
        tokio::spawn(conn::handle_connection(Arc::clone(&node), stream));
    }
}

/// Bind the configured port, start the heartbeat task, and serve.
pub async fn serve(node: Arc<Node>) -> std::io::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", node.config.port)).await?;
    info!("{} listening on {}", node.info.name, listener.local_addr()?);
    node.realm.spawn_heartbeat();
    run(node, listener).await
}

// ─── Tests ────────────────────────────────────────────────────────────────────
