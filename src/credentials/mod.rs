//! Per-configuration credential store.
//!
//! Every named API configuration owns one flat record of string keys to string
//! values (`AccessToken`, `RefreshToken`, `Expiry`, ...). The record is loaded
//! once at startup, mutated in memory by the auth flows, and written back with
//! an explicit [`AuthState::save`].
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │       AuthState                          │
//! │  - in-memory key/value record            │
//! │  - get / set / delete / clear / save     │
//! └─────────────────────────────────────────┘
//!          ↓ save              ↑ load
//! ┌─────────────────────────────────────────┐
//! │       StateBackend                       │
//! │  - SqliteStateStore (durable, optional   │
//! │    AES-256-GCM encryption at rest)       │
//! │  - MemoryStateStore (tests)              │
//! └─────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use api_cli::credentials::{AuthState, SqliteStateStore};
//! use std::sync::Arc;
//!
//! # fn main() -> anyhow::Result<()> {
//! let backend = Arc::new(SqliteStateStore::new("auth.db", None)?);
//! let mut state = AuthState::load("github", backend)?;
//! state.set("AccessToken", "gho_123");
//! state.save()?;
//! assert_eq!(state.get("AccessToken"), "gho_123");
//! # Ok(())
//! # }
//! ```

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

mod encryption;
mod storage;

pub use encryption::{key_from_env, ENCRYPTION_KEY_ENV};
pub use storage::SqliteStateStore;

/// Durable home for credential records.
///
/// `save` must be atomic: either every key of the record is written or an
/// error is returned and nothing is assumed persisted.
pub trait StateBackend: Send + Sync {
    /// Loads the record for `name`. A configuration with no saved state
    /// yields an empty map.
    fn load(&self, name: &str) -> Result<HashMap<String, String>>;

    /// Replaces the stored record for `name` with `values`.
    fn save(&self, name: &str, values: &HashMap<String, String>) -> Result<()>;
}

/// In-process backend. State survives only as long as the value itself.
#[derive(Default)]
pub struct MemoryStateStore {
    records: Mutex<HashMap<String, HashMap<String, String>>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the last saved record for `name`.
    pub fn snapshot(&self, name: &str) -> HashMap<String, String> {
        self.records
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .unwrap_or_default()
    }
}

impl StateBackend for MemoryStateStore {
    fn load(&self, name: &str) -> Result<HashMap<String, String>> {
        Ok(self.snapshot(name))
    }

    fn save(&self, name: &str, values: &HashMap<String, String>) -> Result<()> {
        self.records
            .lock()
            .unwrap()
            .insert(name.to_string(), values.clone());
        Ok(())
    }
}

/// Authentication state of one named configuration.
///
/// The in-memory map is the source of truth between saves. Other processes
/// only observe changes after [`AuthState::save`] succeeds.
pub struct AuthState {
    name: String,
    values: HashMap<String, String>,
    backend: Arc<dyn StateBackend>,
}

/// Credential store shared between an authenticator and its token cache.
///
/// The lock is never held across an `.await`.
pub type SharedAuthState = Arc<Mutex<AuthState>>;

impl AuthState {
    /// Loads the saved record for `name` from `backend`.
    pub fn load(name: &str, backend: Arc<dyn StateBackend>) -> Result<Self> {
        let values = backend
            .load(name)
            .with_context(|| format!("Failed to load credentials for '{}'", display_name(name)))?;
        tracing::debug!(config = %display_name(name), keys = values.len(), "Credential store loaded");
        Ok(Self {
            name: name.to_string(),
            values,
            backend,
        })
    }

    /// Wraps this state for sharing with authenticators.
    pub fn into_shared(self) -> SharedAuthState {
        Arc::new(Mutex::new(self))
    }

    /// Name of the configuration this state belongs to (empty for the default).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the value for `key`, or `""` when absent.
    pub fn get(&self, key: &str) -> &str {
        self.values.get(key).map(String::as_str).unwrap_or("")
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        self.values.insert(key.to_string(), value.into());
    }

    pub fn delete(&mut self, key: &str) {
        self.values.remove(key);
    }

    /// Drops every key.
    pub fn clear(&mut self) {
        self.values.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Writes the full record through the backend.
    ///
    /// A failure here means the login may need to be repeated in a later
    /// invocation; the in-memory values are left untouched.
    pub fn save(&self) -> Result<()> {
        self.backend
            .save(&self.name, &self.values)
            .with_context(|| format!("Failed to save credentials for '{}'", display_name(&self.name)))?;
        tracing::debug!(config = %display_name(&self.name), keys = self.values.len(), "Credential store saved");
        Ok(())
    }
}

fn display_name(name: &str) -> &str {
    if name.is_empty() {
        "default"
    } else {
        name
    }
}
