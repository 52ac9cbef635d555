use crate::password::{verify_password, PasswordError, PasswordPolicy};
use once_cell::sync::OnceCell;
use piedpiper_storage::{
    Collection, KvStore, KvStoreExt, ReadTxnExt, StoreError, WriteTxnExt,
};
use piedpiper_types::{ErrorKind, ObjectId, User};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

pub const MAX_USERNAME_LEN: usize = 128;

const DUMMY_PASSWORD: &str = "piedpiper-unknown-user";

#[derive(Debug, Error)]
pub enum UserError {
    #[error("username {0:?} is already taken")]
    UsernameTaken(String),
    #[error("user {0:?} not found")]
    NotFound(String),
    #[error("invalid user request: {0}")]
    Invalid(&'static str),
    #[error(transparent)]
    Password(#[from] PasswordError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl UserError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            UserError::UsernameTaken(_) => ErrorKind::Conflict,
            UserError::NotFound(_) => ErrorKind::NotFound,
            UserError::Invalid(_) => ErrorKind::Invalid,
            UserError::Password(_) | UserError::Store(_) => ErrorKind::Internal,
        }
    }
}

/// User records keyed by username, including each user's owner index.
pub struct UserDirectory {
    store: Arc<dyn KvStore>,
    passwords: PasswordPolicy,
    /// Hash checked for unknown usernames, built with the current policy on first use.
    dummy_hash: OnceCell<String>,
    verifications: AtomicU64,
}

impl UserDirectory {
    pub fn new(store: Arc<dyn KvStore>, passwords: PasswordPolicy) -> Self {
        Self {
            store,
            passwords,
            dummy_hash: OnceCell::new(),
            verifications: AtomicU64::new(0),
        }
    }

    /// Registers a new user with an empty owner index.
    pub fn create_user(&self, username: &str, password: &str) -> Result<User, UserError> {
        if username.is_empty() {
            return Err(UserError::Invalid("username must not be empty"));
        }
        if username.len() > MAX_USERNAME_LEN {
            return Err(UserError::Invalid("username is too long"));
        }
        if password.is_empty() {
            return Err(UserError::Invalid("password must not be empty"));
        }

        // Hashing is slow; keep it out of the write transaction.
        let user = User::new(username, self.passwords.hash(password, username)?);

        self.store.with_write(|tx| {
            if tx.get(Collection::Users, username.as_bytes())?.is_some() {
                return Err(UserError::UsernameTaken(username.to_string()));
            }
            tx.put_json(Collection::Users, username.as_bytes(), &user)?;
            Ok(())
        })?;

        info!("User {} created", username);
        Ok(user)
    }

    pub fn get_user(&self, username: &str) -> Result<Option<User>, UserError> {
        let user = self
            .store
            .with_read(|tx| tx.get_json::<User>(Collection::Users, username.as_bytes()))?;
        debug!("Lookup of user {}: found={}", username, user.is_some());
        Ok(user)
    }

    /// Returns the user only if `password` matches the stored hash.
    ///
    /// Unknown usernames still pay for one Argon2 verification against a dummy hash, so
    /// response time does not reveal whether an account exists.
    pub fn check_credentials(
        &self,
        username: &str,
        password: &str,
    ) -> Result<Option<User>, UserError> {
        let Some(user) = self.get_user(username)? else {
            let dummy = self
                .dummy_hash
                .get_or_try_init(|| self.passwords.hash(DUMMY_PASSWORD, ""))?;
            self.verify(password, username, dummy)?;
            return Ok(None);
        };
        if self.verify(password, username, &user.password_hash)? {
            Ok(Some(user))
        } else {
            Ok(None)
        }
    }

    fn verify(&self, password: &str, username: &str, hash: &str) -> Result<bool, UserError> {
        self.verifications.fetch_add(1, Ordering::Relaxed);
        Ok(verify_password(password, username, hash)?)
    }

    /// Adds `id` to the user's owner index. Appending an id that is already present is a
    /// no-op.
    pub fn append_object_id(&self, username: &str, id: ObjectId) -> Result<(), UserError> {
        self.modify(username, |user| {
            user.push_object_id(id);
        })
    }

    /// Overwrites the owner index. Used by reconciliation.
    pub fn replace_object_ids(&self, username: &str, ids: Vec<ObjectId>) -> Result<(), UserError> {
        self.modify(username, |user| {
            user.object_ids = ids.clone();
        })
    }

    /// Every registered user, ordered by username.
    pub fn list_users(&self) -> Result<Vec<User>, UserError> {
        self.store
            .scan(Collection::Users)?
            .into_iter()
            .map(|(_, raw)| serde_json::from_slice(&raw).map_err(|e| UserError::Store(e.into())))
            .collect()
    }

    fn modify(&self, username: &str, mut apply: impl FnMut(&mut User)) -> Result<(), UserError> {
        self.store.with_write(|tx| {
            let mut user: User = tx
                .get_json(Collection::Users, username.as_bytes())?
                .ok_or_else(|| UserError::NotFound(username.to_string()))?;
            apply(&mut user);
            tx.put_json(Collection::Users, username.as_bytes(), &user)?;
            Ok(())
        })
    }
}
