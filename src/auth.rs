//! Credential verification for OPEN requests

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

use crate::nonce::constant_time_eq;

/// Decides whether a user may expose a port.
///
/// Called once per OPEN; implementations must not have side effects the
/// coordinator can observe.
pub trait AuthVerifier: Send + Sync {
    fn verify(&self, username: &str, password: &str, port: u16) -> bool;
}

/// Rejects every request
#[derive(Debug, Default, Clone, Copy)]
pub struct DenyAll;

impl AuthVerifier for DenyAll {
    fn verify(&self, _username: &str, _password: &str, _port: u16) -> bool {
        false
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Failed to read credentials file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid credentials file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Duplicate user in credentials: {0}")]
    DuplicateUser(String),
}

#[derive(Debug, Deserialize)]
struct CredentialsFile {
    users: Vec<UserEntry>,
}

#[derive(Debug, Clone, Deserialize)]
struct UserEntry {
    username: String,
    password: String,
    /// Ports this user may expose; empty means any
    #[serde(default)]
    ports: Vec<u16>,
}

/// Static user table loaded from JSON:
///
/// ```json
/// { "users": [ { "username": "alice", "password": "pw", "ports": [8080] } ] }
/// ```
#[derive(Debug, Default)]
pub struct CredentialStore {
    users: HashMap<String, UserEntry>,
}

impl CredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, AuthError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, AuthError> {
        let file: CredentialsFile = serde_json::from_str(raw)?;
        let mut store = Self::new();
        for entry in file.users {
            if store.users.contains_key(&entry.username) {
                return Err(AuthError::DuplicateUser(entry.username));
            }
            store.users.insert(entry.username.clone(), entry);
        }
        Ok(store)
    }

    /// Add or replace a user. An empty `ports` list allows any port.
    pub fn insert(&mut self, username: &str, password: &str, ports: Vec<u16>) {
        self.users.insert(
            username.to_string(),
            UserEntry {
                username: username.to_string(),
                password: password.to_string(),
                ports,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

impl AuthVerifier for CredentialStore {
    fn verify(&self, username: &str, password: &str, port: u16) -> bool {
        let Some(user) = self.users.get(username) else {
            return false;
        };
        if !constant_time_eq(user.password.as_bytes(), password.as_bytes()) {
            return false;
        }
        user.ports.is_empty() || user.ports.contains(&port)
    }
}
