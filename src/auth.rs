//! Credential checking against the stored user directory.
//!
//! `users.password` holds an opaque SHA-256 hex digest; the checker never
//! sees or stores a cleartext password beyond the comparison. When
//! `user_on_request` is on, a login for an unknown nick registers it on the
//! spot with the offered password.

use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::db::{DbError, DocStore};
use crate::realm::valid_name;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("bad credentials for {0}")]
    BadCredentials(String),
    #[error(transparent)]
    Store(#[from] DbError),
}

#[derive(Debug, Clone)]
pub struct Authenticator {
    store: DocStore,
    user_on_request: bool,
}

impl Authenticator {
    pub fn new(store: DocStore, user_on_request: bool) -> Self {
        Self { store, user_on_request }
    }

    /// The opaque form a password takes in the store.
    pub fn digest(password: &str) -> String {
        hex::encode(Sha256::digest(password.as_bytes()))
    }

    /// Verify a login. Unknown nicks are admitted (and their row created)
    /// only when `user_on_request` is on; everything else that isn't an
    /// exact digest match is a bad-credentials failure.
    pub async fn check(&self, nick: &str, password: &str) -> Result<(), AuthError> {
        let nick = nick.to_lowercase();
        match self.store.lookup_user(&nick).await? {
            Some(row) if row.password == Self::digest(password) => Ok(()),
            Some(_) => Err(AuthError::BadCredentials(nick)),
            None if self.user_on_request && valid_name(&nick) => {
                match self.store.create_user(&nick, "", &Self::digest(password), false, "").await {
                    Ok(()) => Ok(()),
                    // Raced another connection registering the same nick;
                    // fall back to comparing against what won.
                    Err(DbError::Duplicate { .. }) => match self.store.lookup_user(&nick).await? {
                        Some(row) if row.password == Self::digest(password) => Ok(()),
                        _ => Err(AuthError::BadCredentials(nick)),
                    },
                    Err(e) => Err(e.into()),
                }
            }
            None => Err(AuthError::BadCredentials(nick)),
        }
    }

    /// Seed a registered account (bootstrap and tests).
    pub async fn register(
        &self,
        nick: &str,
        email: &str,
        password: &str,
    ) -> Result<(), AuthError> {
        self.store
            .create_user(nick, email, &Self::digest(password), true, "")
            .await?;
        Ok(())
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tests::mem_pool;

    async fn auth(user_on_request: bool) -> Authenticator {
        let store = DocStore::new(mem_pool().await, "testserver");
        Authenticator::new(store, user_on_request)
    }

    #[tokio::test]
    async fn registered_user_logs_in_with_its_password() {
        let auth = auth(false).await;
        auth.register("john", "john@example.com", "pw").await.unwrap();

        auth.check("john", "pw").await.unwrap();
        auth.check("JOHN", "pw").await.unwrap();
    }

    #[tokio::test]
    async fn wrong_password_is_rejected() {
        let auth = auth(false).await;
        auth.register("john", "", "pw").await.unwrap();

        let err = auth.check("john", "bad_password").await.unwrap_err();
        assert!(matches!(err, AuthError::BadCredentials(_)));
    }

    #[tokio::test]
    async fn unknown_nick_is_rejected_when_admission_is_off() {
        let auth = auth(false).await;
        let err = auth.check("ghost", "pw").await.unwrap_err();
        assert!(matches!(err, AuthError::BadCredentials(_)));
    }

    #[tokio::test]
    async fn unknown_nick_is_registered_on_request() {
        let auth = auth(true).await;
        auth.check("newcomer", "pw").await.unwrap();

        // The row exists now, so only the original password works.
        auth.check("newcomer", "pw").await.unwrap();
        let err = auth.check("newcomer", "other").await.unwrap_err();
        assert!(matches!(err, AuthError::BadCredentials(_)));
    }

    #[tokio::test]
    async fn on_request_admission_still_validates_the_name() {
        let auth = auth(true).await;
        let err = auth.check("bad name", "pw").await.unwrap_err();
        assert!(matches!(err, AuthError::BadCredentials(_)));
    }

    #[test]
    fn digests_are_stable_hex() {
        assert_eq!(Authenticator::digest("pw").len(), 64);
        assert_eq!(Authenticator::digest("pw"), Authenticator::digest("pw"));
        assert_ne!(Authenticator::digest("pw"), Authenticator::digest("pw2"));
    }
}
