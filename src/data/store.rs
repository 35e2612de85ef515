//! The process-wide store for access records and authenticated sessions.
//!
//! Records persist through a small key-value backend trait; the default
//! backend is redb with JSON rows. A DashMap cache fronts the backend so
//! hot lookups (every authorized command) never touch disk. Authenticated
//! sessions are in-memory only and keyed by `(server, fullhost)`.

use std::collections::HashMap;
use std::sync::Mutex;

use dashmap::DashMap;
use redb::{Database, ReadableTable, TableDefinition};
use thiserror::Error;

use super::access::UserAccess;

const USERS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("user_access");

/// Store errors, including typed authentication failures.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("username and password are required")]
    MissingUsernameOrPassword,
    #[error("user {0:?} is not registered")]
    UserNotFound(String),
    #[error("bad password")]
    BadPassword,
    #[error("host {0:?} does not match any mask for that user")]
    BadHost(String),
    #[error("storage backend error: {0}")]
    Backend(String),
    #[error("record serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("password hashing failed: {0}")]
    Hash(#[from] bcrypt::BcryptError),
}

/// Provider of the store, injected into the bot so the core is testable
/// without touching disk. Called once per bot lifetime with the configured
/// storage path.
pub type StoreProvider =
    Box<dyn Fn(&str) -> Result<Store, StoreError> + Send + Sync + 'static>;

/// Minimal key-value surface the store needs from its backend.
pub trait KvBackend: Send + Sync {
    /// Fetch a value.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;
    /// Insert or replace a value.
    fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError>;
    /// Remove a value; reports whether it existed.
    fn remove(&self, key: &str) -> Result<bool, StoreError>;
}

/// redb-backed persistence, one table of JSON rows keyed by username.
pub struct RedbBackend {
    db: Database,
}

impl RedbBackend {
    /// Open or create the database at `path`.
    pub fn open(path: &str) -> Result<Self, StoreError> {
        let db = Database::create(path).map_err(|e| StoreError::Backend(e.to_string()))?;
        // Open the table once so first reads don't race table creation.
        let wtx = db
            .begin_write()
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        wtx.open_table(USERS_TABLE)
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        wtx.commit().map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(RedbBackend { db })
    }
}

impl KvBackend for RedbBackend {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let rtx = self
            .db
            .begin_read()
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        let table = rtx
            .open_table(USERS_TABLE)
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        let value = table
            .get(key)
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(value.map(|v| v.value().to_vec()))
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let wtx = self
            .db
            .begin_write()
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        {
            let mut table = wtx
                .open_table(USERS_TABLE)
                .map_err(|e| StoreError::Backend(e.to_string()))?;
            table
                .insert(key, value)
                .map_err(|e| StoreError::Backend(e.to_string()))?;
        }
        wtx.commit().map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<bool, StoreError> {
        let wtx = self
            .db
            .begin_write()
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        let existed;
        {
            let mut table = wtx
                .open_table(USERS_TABLE)
                .map_err(|e| StoreError::Backend(e.to_string()))?;
            existed = table
                .remove(key)
                .map_err(|e| StoreError::Backend(e.to_string()))?
                .is_some();
        }
        wtx.commit().map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(existed)
    }
}

/// In-memory backend for tests and store-less deployments.
#[derive(Default)]
pub struct MemBackend {
    map: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemBackend {
    /// An empty in-memory backend.
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvBackend for MemBackend {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self
            .map
            .lock()
            .expect("mem backend lock")
            .get(key)
            .cloned())
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.map
            .lock()
            .expect("mem backend lock")
            .insert(key.to_owned(), value.to_vec());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self
            .map
            .lock()
            .expect("mem backend lock")
            .remove(key)
            .is_some())
    }
}

/// The record store.
pub struct Store {
    backend: Box<dyn KvBackend>,
    cache: DashMap<String, UserAccess>,
    authed: DashMap<(String, String), String>,
}

impl Store {
    /// A store over the given backend.
    pub fn new(backend: Box<dyn KvBackend>) -> Self {
        Store {
            backend,
            cache: DashMap::new(),
            authed: DashMap::new(),
        }
    }

    /// A store over a fresh in-memory backend.
    pub fn in_memory() -> Self {
        Self::new(Box::new(MemBackend::new()))
    }

    /// A store over redb at `path`.
    pub fn open(path: &str) -> Result<Self, StoreError> {
        Ok(Self::new(Box::new(RedbBackend::open(path)?)))
    }

    /// Insert or replace a user record.
    pub fn add_user(&self, user: UserAccess) -> Result<(), StoreError> {
        self.backend.put(&user.username, &user.to_bytes()?)?;
        self.cache.insert(user.username.clone(), user);
        Ok(())
    }

    /// Remove a user record and log out any of their sessions.
    pub fn remove_user(&self, username: &str) -> Result<bool, StoreError> {
        let existed = self.backend.remove(username)?;
        self.cache.remove(username);
        self.authed.retain(|_, v| v.as_str() != username);
        Ok(existed)
    }

    /// Fetch a user record by username.
    pub fn fetch_user(&self, username: &str) -> Result<Option<UserAccess>, StoreError> {
        if let Some(user) = self.cache.get(username) {
            return Ok(Some(user.clone()));
        }
        match self.backend.get(username)? {
            Some(bytes) => {
                let user = UserAccess::from_bytes(&bytes)?;
                self.cache.insert(username.to_owned(), user.clone());
                Ok(Some(user))
            }
            None => Ok(None),
        }
    }

    /// Authenticate `fullhost` on `server` as `username`.
    ///
    /// The record must exist, the password must verify, and the fullhost
    /// must satisfy one of the record's masks. On success the session is
    /// remembered until [`Store::logout`].
    pub fn auth_user(
        &self,
        server: &str,
        fullhost: &str,
        username: &str,
        password: &str,
    ) -> Result<UserAccess, StoreError> {
        let user = self
            .fetch_user(username)?
            .ok_or_else(|| StoreError::UserNotFound(username.to_owned()))?;
        if !user.verify_password(password) {
            return Err(StoreError::BadPassword);
        }
        if !user.is_match(fullhost) {
            return Err(StoreError::BadHost(fullhost.to_owned()));
        }
        self.authed
            .insert((server.to_owned(), fullhost.to_owned()), username.to_owned());
        Ok(user)
    }

    /// The record authenticated for `fullhost` on `server`, if any.
    pub fn authed_user(&self, server: &str, fullhost: &str) -> Option<UserAccess> {
        let username = self
            .authed
            .get(&(server.to_owned(), fullhost.to_owned()))?
            .clone();
        self.fetch_user(&username).ok().flatten()
    }

    /// Drop the session for `fullhost` on `server`.
    pub fn logout(&self, server: &str, fullhost: &str) {
        self.authed
            .remove(&(server.to_owned(), fullhost.to_owned()));
    }

    /// Drop every session held by `username` on `server`.
    pub fn logout_by_username(&self, server: &str, username: &str) {
        self.authed
            .retain(|(srv, _), name| !(srv.as_str() == server && name.as_str() == username));
    }
}
