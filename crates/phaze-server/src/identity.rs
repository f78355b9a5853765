//! Client credential lookup.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use phaze_common::helpers::parse_hex_key;
use phaze_common::{Error, Result};
use serde::Deserialize;
use zeroize::Zeroizing;

/// Shared secret for one identity.
#[derive(Clone)]
pub struct CredentialRecord {
    pub secret: Zeroizing<[u8; 32]>,
}

impl fmt::Debug for CredentialRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CredentialRecord(..)")
    }
}

/// Source of client credentials. Consulted only while authenticating a
/// handshake; results are not retained.
pub trait IdentityStore: Send + Sync {
    fn lookup(&self, username: &str) -> Option<CredentialRecord>;
}

#[derive(Deserialize)]
struct UsersFile {
    users: Vec<UserEntry>,
}

#[derive(Deserialize)]
struct UserEntry {
    username: String,
    secret: String,
}

/// In-memory identity store, usually loaded from a JSON users file:
///
/// ```json
/// { "users": [ { "username": "alice", "secret": "<64 hex chars>" } ] }
/// ```
#[derive(Default)]
pub struct StaticIdentityStore {
    users: HashMap<String, CredentialRecord>,
}

impl StaticIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, username: impl Into<String>, secret: [u8; 32]) {
        self.users.insert(
            username.into(),
            CredentialRecord {
                secret: Zeroizing::new(secret),
            },
        );
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let parsed: UsersFile = serde_json::from_str(json).map_err(Error::serialization)?;

        let mut store = Self::new();
        for entry in parsed.users {
            if entry.username.is_empty() || entry.username.len() > u8::MAX as usize {
                return Err(Error::config(format!(
                    "username must be 1-255 bytes, got {}",
                    entry.username.len()
                )));
            }
            let secret = Zeroizing::new(entry.secret);
            let key = parse_hex_key(&secret)
                .map_err(|e| Error::config(format!("user {}: {e}", entry.username)))?;
            if store.users.contains_key(&entry.username) {
                return Err(Error::config(format!(
                    "duplicate user {}",
                    entry.username
                )));
            }
            store.insert(entry.username, key);
        }
        Ok(store)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents = Zeroizing::new(std::fs::read_to_string(path)?);
        Self::from_json(&contents)
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

impl IdentityStore for StaticIdentityStore {
    fn lookup(&self, username: &str) -> Option<CredentialRecord> {
        self.users.get(username).cloned()
    }
}
