//! Document-store facade.
//!
//! Four collections back the cluster: `users` (directory), `user_sessions`
//! (liveness), `groups` (channel directory), and `group_states` (per-group
//! membership heartbeats). Every node of a cluster points at the same
//! database; the rows here are the authoritative view that the per-node
//! realm reconciles against.

use std::collections::HashMap;

use sqlx::{Row, SqlitePool};
use thiserror::Error;

// ─── Error ───────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum DbError {
    #[error("duplicate {kind}: {name}")]
    Duplicate { kind: &'static str, name: String },
    #[error("no such {kind}: {name}")]
    NotFound { kind: &'static str, name: String },
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("corrupt {column} column for {name}: {source}")]
    BadJson {
        column: &'static str,
        name: String,
        source: serde_json::Error,
    },
}

// ─── Schema ──────────────────────────────────────────────────────────────────

/// Create the four collections if they don't already exist. Safe to run on
/// every startup.
pub async fn run_migrations(pool: &SqlitePool) -> Result<(), DbError> {
    sqlx::query(
        r#"
        PRAGMA journal_mode=WAL;

        CREATE TABLE IF NOT EXISTS users (
            nickname        TEXT PRIMARY KEY,
            email           TEXT NOT NULL DEFAULT '',
            password        TEXT NOT NULL,
            registered      INTEGER NOT NULL DEFAULT 0,
            permissions     TEXT NOT NULL DEFAULT ''
        );

        CREATE TABLE IF NOT EXISTS user_sessions (
            nickname        TEXT PRIMARY KEY,
            last_heartbeat  INTEGER NOT NULL,
            active          INTEGER NOT NULL DEFAULT 0,
            node_id         TEXT NOT NULL DEFAULT ''
        );

        CREATE TABLE IF NOT EXISTS groups (
            name            TEXT PRIMARY KEY,
            owner           TEXT NOT NULL DEFAULT '',
            type            TEXT NOT NULL DEFAULT 'public',
            meta            TEXT NOT NULL DEFAULT '{"topic": ""}',
            created_at      INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS group_states (
            name            TEXT PRIMARY KEY,
            user_heartbeats TEXT NOT NULL DEFAULT '{}'
        );
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

// ─── Row types ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct UserRow {
    pub nickname: String,
    pub email: String,
    pub password: String,
    pub registered: bool,
    pub permissions: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SessionRow {
    pub nickname: String,
    /// Unix milliseconds.
    pub last_heartbeat: i64,
    pub active: bool,
    pub node_id: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct GroupRow {
    pub name: String,
    pub owner: String,
    #[sqlx(rename = "type")]
    pub kind: String,
    /// JSON object; `topic` is the only key the server itself writes.
    pub meta: String,
    pub created_at: i64,
}

impl GroupRow {
    /// The `topic` entry of the meta document, empty if unset or corrupt.
    pub fn topic(&self) -> String {
        serde_json::from_str::<serde_json::Value>(&self.meta)
            .ok()
            .and_then(|m| m.get("topic").and_then(|t| t.as_str().map(String::from)))
            .unwrap_or_default()
    }
}

/// Current unix time in milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// ─── Facade ──────────────────────────────────────────────────────────────────

/// Typed CRUD over the shared collections, bound to one node's identity.
/// Cheap to clone; clones share the connection pool.
#[derive(Debug, Clone)]
pub struct DocStore {
    pool: SqlitePool,
    node_id: String,
}

impl DocStore {
    pub fn new(pool: SqlitePool, node_id: impl Into<String>) -> Self {
        Self { pool, node_id: node_id.into() }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    // ── users ────────────────────────────────────────────────────────────────

    /// Insert a user row. Names are stored lowercased; a primary-key clash
    /// reports `Duplicate`.
    pub async fn create_user(
        &self,
        name: &str,
        email: &str,
        password: &str,
        registered: bool,
        permissions: &str,
    ) -> Result<(), DbError> {
        let name = name.to_lowercase();
        let res = sqlx::query(
            "INSERT INTO users (nickname, email, password, registered, permissions)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&name)
        .bind(email)
        .bind(password)
        .bind(registered)
        .bind(permissions)
        .execute(&self.pool)
        .await;

        match res {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(DbError::Duplicate { kind: "user", name })
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn lookup_user(&self, name: &str) -> Result<Option<UserRow>, DbError> {
        let row = sqlx::query_as::<_, UserRow>("SELECT * FROM users WHERE nickname = ?")
            .bind(name.to_lowercase())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    // ── user sessions ────────────────────────────────────────────────────────

    pub async fn lookup_user_session(&self, name: &str) -> Result<Option<SessionRow>, DbError> {
        let row =
            sqlx::query_as::<_, SessionRow>("SELECT * FROM user_sessions WHERE nickname = ?")
                .bind(name.to_lowercase())
                .fetch_optional(&self.pool)
                .await?;
        Ok(row)
    }

    /// Upsert the session row with a fresh timestamp, `active`, and this
    /// node's identity.
    pub async fn heartbeat_user_session(&self, name: &str) -> Result<(), DbError> {
        sqlx::query(
            "INSERT INTO user_sessions (nickname, last_heartbeat, active, node_id)
             VALUES (?, ?, 1, ?)
             ON CONFLICT(nickname) DO UPDATE SET
                 last_heartbeat = excluded.last_heartbeat,
                 active = 1,
                 node_id = excluded.node_id",
        )
        .bind(name.to_lowercase())
        .bind(now_ms())
        .bind(&self.node_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn deactivate_user_session(&self, name: &str) -> Result<(), DbError> {
        sqlx::query("UPDATE user_sessions SET active = 0 WHERE nickname = ?")
            .bind(name.to_lowercase())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ── groups ───────────────────────────────────────────────────────────────

    /// Insert a group row seeded with an empty topic. A name clash reports
    /// `Duplicate`.
    pub async fn create_group(&self, name: &str, owner: &str, kind: &str) -> Result<(), DbError> {
        let name = name.to_lowercase();
        let res = sqlx::query(
            r#"INSERT INTO groups (name, owner, type, meta, created_at)
               VALUES (?, ?, ?, '{"topic": ""}', ?)"#,
        )
        .bind(&name)
        .bind(owner)
        .bind(kind)
        .bind(now_ms())
        .execute(&self.pool)
        .await;

        match res {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(DbError::Duplicate { kind: "group", name })
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn lookup_group(&self, name: &str) -> Result<Option<GroupRow>, DbError> {
        let row = sqlx::query_as::<_, GroupRow>("SELECT * FROM groups WHERE name = ?")
            .bind(name.to_lowercase())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    pub async fn list_groups(&self) -> Result<Vec<GroupRow>, DbError> {
        let rows = sqlx::query_as::<_, GroupRow>("SELECT * FROM groups ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    /// Write one key of the group's meta document through to the store.
    pub async fn set_group_meta(&self, name: &str, field: &str, value: &str) -> Result<(), DbError> {
        let name = name.to_lowercase();
        let row = self
            .lookup_group(&name)
            .await?
            .ok_or_else(|| DbError::NotFound { kind: "group", name: name.clone() })?;

        let mut meta: serde_json::Value = serde_json::from_str(&row.meta)
            .map_err(|e| DbError::BadJson { column: "meta", name: name.clone(), source: e })?;
        meta[field] = serde_json::Value::String(value.to_string());

        sqlx::query("UPDATE groups SET meta = ? WHERE name = ?")
            .bind(meta.to_string())
            .bind(&name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ── group membership heartbeats ──────────────────────────────────────────

    /// The nickname → unix-millisecond map for one group; empty when no row
    /// exists yet.
    pub async fn group_heartbeats(&self, group: &str) -> Result<HashMap<String, i64>, DbError> {
        let group = group.to_lowercase();
        let row = sqlx::query("SELECT user_heartbeats FROM group_states WHERE name = ?")
            .bind(&group)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            None => Ok(HashMap::new()),
            Some(row) => {
                let raw: String = row.get("user_heartbeats");
                serde_json::from_str(&raw).map_err(|e| DbError::BadJson {
                    column: "user_heartbeats",
                    name: group,
                    source: e,
                })
            }
        }
    }

    /// Upsert one member's heartbeat entry in the group's state row.
    pub async fn heartbeat_user_in_group(&self, group: &str, user: &str) -> Result<(), DbError> {
        let mut beats = self.group_heartbeats(group).await?;
        beats.insert(user.to_lowercase(), now_ms());
        self.write_heartbeats(group, &beats).await
    }

    /// Drop one member's heartbeat entry (part, logout, or reap).
    pub async fn remove_user_from_group(&self, group: &str, user: &str) -> Result<(), DbError> {
        let mut beats = self.group_heartbeats(group).await?;
        beats.remove(&user.to_lowercase());
        self.write_heartbeats(group, &beats).await
    }

    /// Names of every group whose heartbeat map contains the nick.
    pub async fn list_groups_for_user(&self, user: &str) -> Result<Vec<String>, DbError> {
        let user = user.to_lowercase();
        let rows = sqlx::query("SELECT name, user_heartbeats FROM group_states ORDER BY name")
            .fetch_all(&self.pool)
            .await?;

        let mut names = Vec::new();
        for row in rows {
            let raw: String = row.get("user_heartbeats");
            let beats: HashMap<String, i64> = match serde_json::from_str(&raw) {
                Ok(beats) => beats,
                Err(_) => continue,
            };
            if beats.contains_key(&user) {
                names.push(row.get("name"));
            }
        }
        Ok(names)
    }

    async fn write_heartbeats(
        &self,
        group: &str,
        beats: &HashMap<String, i64>,
    ) -> Result<(), DbError> {
        let raw = serde_json::to_string(beats).expect("string/i64 map always serializes");
        sqlx::query(
            "INSERT INTO group_states (name, user_heartbeats) VALUES (?, ?)
             ON CONFLICT(name) DO UPDATE SET user_heartbeats = excluded.user_heartbeats",
        )
        .bind(group.to_lowercase())
        .bind(raw)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
