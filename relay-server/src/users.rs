//! The account table and the peripheral, "straightforward" API around it
//! (§4.J): authentication, self-serve registration, password/config
//! mutation, and the admin-only shutdown verbs.

use crate::error::ProtocolError;
use argon2::password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use protocol::MAX_USER_CONFIG_BYTES;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// One account row (§3 `User`). `password_hash` is a PHC-formatted argon2
/// string, never plaintext.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub username: String,
    pub password_hash: String,
    #[serde(default)]
    pub config: String,
    #[serde(default)]
    pub admin: bool,
    #[serde(rename = "selfServeOrigin", default, skip_serializing_if = "Option::is_none")]
    pub self_serve_origin: Option<String>,
}

fn hash_password(password: &str) -> String {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .expect("argon2 hashing never fails for valid inputs")
        .to_string()
}

fn verify_password(hash: &str, password: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(hash) else { return false };
    Argon2::default().verify_password(password.as_bytes(), &parsed).is_ok()
}

/// Username rule from §3: ASCII alphanumeric, not starting with a digit, 3-16 chars.
pub fn validate_username(username: &str) -> Result<(), ProtocolError> {
    let len_ok = (3..=16).contains(&username.len());
    let ascii_alnum = !username.is_empty() && username.chars().all(|c| c.is_ascii_alphanumeric());
    let not_digit_first = username.chars().next().map(|c| !c.is_ascii_digit()).unwrap_or(false);
    if len_ok && ascii_alnum && not_digit_first {
        Ok(())
    } else {
        Err(ProtocolError::InvalidUsername(username.to_string()))
    }
}

/// Read-mostly account table, copy-on-write on admin mutations (§5): reads
/// take a shared guard, mutations a brief exclusive one, both confined to the
/// owning task.
pub struct UserStore {
    users: RwLock<HashMap<String, User>>,
}

impl UserStore {
    pub fn new(users: HashMap<String, User>) -> Self {
        Self { users: RwLock::new(users) }
    }

    pub async fn snapshot(&self) -> HashMap<String, User> {
        self.users.read().await.clone()
    }

    async fn authenticated(&self, username: &str, password: &str) -> Result<(), ProtocolError> {
        let users = self.users.read().await;
        let user = users.get(username).ok_or(ProtocolError::BadCredentials)?;
        if verify_password(&user.password_hash, password) {
            Ok(())
        } else {
            Err(ProtocolError::BadCredentials)
        }
    }

    pub async fn authenticate(&self, username: &str, password: &str) -> Result<(), ProtocolError> {
        self.authenticated(username, password).await
    }

    /// Per the resolved Open Question (§9): stops on first validation failure,
    /// no partial mutation.
    pub async fn self_serve_create(&self, username: &str, password: &str, config: String) -> Result<(), ProtocolError> {
        validate_username(username)?;
        if config.len() > MAX_USER_CONFIG_BYTES {
            return Err(ProtocolError::ConfigTooLarge);
        }
        let mut users = self.users.write().await;
        if users.contains_key(username) {
            return Err(ProtocolError::UsernameTaken(username.to_string()));
        }
        users.insert(
            username.to_string(),
            User {
                username: username.to_string(),
                password_hash: hash_password(password),
                config,
                admin: false,
                self_serve_origin: None,
            },
        );
        Ok(())
    }

    pub async fn change_password(&self, username: &str, old_password: &str, new_password: &str) -> Result<(), ProtocolError> {
        self.authenticated(username, old_password).await?;
        let mut users = self.users.write().await;
        let user = users.get_mut(username).ok_or(ProtocolError::BadCredentials)?;
        user.password_hash = hash_password(new_password);
        Ok(())
    }

    pub async fn get_config(&self, username: &str, password: &str) -> Result<String, ProtocolError> {
        self.authenticated(username, password).await?;
        let users = self.users.read().await;
        Ok(users.get(username).ok_or(ProtocolError::BadCredentials)?.config.clone())
    }

    pub async fn set_config(&self, username: &str, password: &str, config: String) -> Result<(), ProtocolError> {
        self.authenticated(username, password).await?;
        if config.len() > MAX_USER_CONFIG_BYTES {
            return Err(ProtocolError::ConfigTooLarge);
        }
        let mut users = self.users.write().await;
        users.get_mut(username).ok_or(ProtocolError::BadCredentials)?.config = config;
        Ok(())
    }

    /// Checked by both shutdown verbs; actually driving the snapshot save and
    /// process exit is `server.rs`'s job (§4.J only names the contract).
    pub async fn require_admin(&self, username: &str, password: &str) -> Result<(), ProtocolError> {
        self.authenticated(username, password).await?;
        let users = self.users.read().await;
        if users.get(username).map(|u| u.admin).unwrap_or(false) {
            Ok(())
        } else {
            Err(ProtocolError::NotAuthorized)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with(username: &str, password: &str, admin: bool) -> UserStore {
        let mut users = HashMap::new();
        users.insert(
            username.to_string(),
            User {
                username: username.to_string(),
                password_hash: hash_password(password),
                config: String::new(),
                admin,
                self_serve_origin: None,
            },
        );
        UserStore::new(users)
    }

    #[tokio::test]
    async fn authenticate_rejects_wrong_password() {
        let store = store_with("alice", "correct horse", false);
        assert!(store.authenticate("alice", "correct horse").await.is_ok());
        assert!(matches!(store.authenticate("alice", "wrong").await, Err(ProtocolError::BadCredentials)));
    }

    #[tokio::test]
    async fn self_serve_create_rejects_taken_usernames() {
        let store = store_with("alice", "pw", false);
        let err = store.self_serve_create("alice", "pw2", String::new()).await.unwrap_err();
        assert!(matches!(err, ProtocolError::UsernameTaken(_)));
    }

    #[tokio::test]
    async fn self_serve_create_rejects_invalid_username_before_any_mutation() {
        let store = store_with("alice", "pw", false);
        let err = store.self_serve_create("1abc", "pw", String::new()).await.unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidUsername(_)));
        assert!(store.snapshot().await.get("1abc").is_none());
    }

    #[tokio::test]
    async fn oversize_config_is_rejected() {
        let store = store_with("alice", "pw", false);
        let huge = "x".repeat(MAX_USER_CONFIG_BYTES + 1);
        let err = store.set_config("alice", "pw", huge).await.unwrap_err();
        assert!(matches!(err, ProtocolError::ConfigTooLarge));
    }

    #[tokio::test]
    async fn require_admin_rejects_non_admin_accounts() {
        let store = store_with("alice", "pw", false);
        assert!(matches!(store.require_admin("alice", "pw").await, Err(ProtocolError::NotAuthorized)));
    }

    #[tokio::test]
    async fn require_admin_accepts_admin_accounts() {
        let store = store_with("root", "pw", true);
        assert!(store.require_admin("root", "pw").await.is_ok());
    }
}
