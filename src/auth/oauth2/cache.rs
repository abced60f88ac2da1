//! Shared token cache.
//!
//! Concurrent callers share one current token. When it is missing or expired
//! the first caller mints a replacement while the others wait on the same
//! lock, so exactly one mint happens per expiry. Fresh tokens are persisted to
//! the credential store before being handed out; a failed save is an error
//! even though the fresh token stays cached for this process.

use super::endpoint::TokenEndpoint;
use super::token::Token;
use crate::auth::AuthError;
use crate::credentials::SharedAuthState;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// Produces a new token when the cached one is no longer valid.
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// `stale` is the token being replaced, if any.
    async fn mint(&self, stale: Option<&Token>) -> Result<Token>;
}

/// Redeems the stale token's refresh token.
pub struct RefreshTokenSource {
    endpoint: Arc<TokenEndpoint>,
    command: String,
}

impl RefreshTokenSource {
    pub fn new(endpoint: Arc<TokenEndpoint>, command: &str) -> Self {
        Self {
            endpoint,
            command: command.to_string(),
        }
    }
}

#[async_trait]
impl TokenSource for RefreshTokenSource {
    async fn mint(&self, stale: Option<&Token>) -> Result<Token> {
        let refresh_token = stale
            .map(|t| t.refresh_token.as_str())
            .filter(|rt| !rt.is_empty())
            .ok_or_else(|| AuthError::Unauthenticated {
                command: self.command.clone(),
            })?;
        self.endpoint.refresh(refresh_token).await
    }
}

/// Requests a new client credentials token.
pub struct ClientCredentialsSource {
    endpoint: Arc<TokenEndpoint>,
    scopes: Vec<String>,
}

impl ClientCredentialsSource {
    pub fn new(endpoint: Arc<TokenEndpoint>, scopes: Vec<String>) -> Self {
        Self { endpoint, scopes }
    }
}

#[async_trait]
impl TokenSource for ClientCredentialsSource {
    async fn mint(&self, _stale: Option<&Token>) -> Result<Token> {
        self.endpoint.client_credentials(&self.scopes).await
    }
}

/// Current token plus the source that replaces it.
pub struct TokenCache {
    current: Mutex<Option<Token>>,
    source: Arc<dyn TokenSource>,
    state: SharedAuthState,
}

impl TokenCache {
    pub fn new(token: Option<Token>, source: Arc<dyn TokenSource>, state: SharedAuthState) -> Self {
        Self {
            current: Mutex::new(token),
            source,
            state,
        }
    }

    /// Returns a valid token, minting and persisting one if needed.
    ///
    /// When minting fails the stale token stays cached and nothing is
    /// persisted. When saving fails the fresh token is cached but the error
    /// is returned.
    pub async fn token(&self) -> Result<Token> {
        let mut current = self.current.lock().await;
        if let Some(token) = current.as_ref().filter(|t| t.is_valid()) {
            return Ok(token.clone());
        }

        debug!("Cached token missing or expired, minting a new one");
        let fresh = self.source.mint(current.as_ref()).await?;
        *current = Some(fresh.clone());

        persist(&self.state, &fresh).context("Failed to persist refreshed token")?;
        Ok(fresh)
    }
}

/// Writes `token` into the shared state and saves it.
pub(crate) fn persist(state: &SharedAuthState, token: &Token) -> Result<()> {
    let mut state = state.lock().unwrap();
    token.store(&mut state);
    state.save()
}
