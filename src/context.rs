//! Per-invocation application context.
//!
//! Built once in `main` in dependency order (configuration, credential store,
//! HTTP transport) and passed explicitly to every command.

use crate::auth::{self, Authenticator};
use crate::config::{self, ApiConfig};
use crate::credentials::{key_from_env, AuthState, SharedAuthState, SqliteStateStore};
use anyhow::{Context, Result};
use reqwest::Client;
use std::sync::Arc;

const DEFAULT_USER_AGENT: &str = concat!("api-cli/", env!("CARGO_PKG_VERSION"));

pub struct AppContext {
    /// `-c` argument; `None` selects the default configuration
    pub config_name: Option<String>,
    pub config: ApiConfig,
    pub state: SharedAuthState,
    pub http: Client,
}

impl AppContext {
    /// Loads the named configuration and its credential store from the
    /// configuration directory.
    pub fn load(config_name: Option<String>) -> Result<Self> {
        let dir = config::config_dir()?;
        let config = config::load_config_from(&dir, config_name.as_deref())?;

        let db_path = config::state_db_path(&dir);
        let backend = SqliteStateStore::new(&db_path, key_from_env()?)
            .with_context(|| format!("Failed to open credential store {}", db_path.display()))?;
        let state = AuthState::load(config_name.as_deref().unwrap_or_default(), Arc::new(backend))?
            .into_shared();

        let http = build_http_client(&config)?;
        Ok(Self::new(config_name, config, state, http))
    }

    pub fn new(config_name: Option<String>, config: ApiConfig, state: SharedAuthState, http: Client) -> Self {
        Self {
            config_name: config_name.filter(|n| !n.is_empty()),
            config,
            state,
            http,
        }
    }

    /// How the user invokes this configuration, for hints in messages.
    pub fn command_name(&self) -> String {
        match &self.config_name {
            None => "api".to_string(),
            Some(name) => format!("api -c {}", name),
        }
    }

    /// Authenticator for the configured scheme.
    pub fn authenticator(&self) -> Result<Box<dyn Authenticator>> {
        auth::new_authenticator(
            &self.config,
            self.state.clone(),
            self.http.clone(),
            &self.command_name(),
        )
    }
}

/// HTTP transport carrying the configured user agent.
pub fn build_http_client(config: &ApiConfig) -> Result<Client> {
    let user_agent = if config.user_agent.is_empty() {
        DEFAULT_USER_AGENT
    } else {
        config.user_agent.as_str()
    };
    Client::builder()
        .user_agent(user_agent)
        .build()
        .context("Failed to build HTTP client")
}
