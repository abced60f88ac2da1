//! OAuth 2.0 client for the authorization code (with optional PKCE), client
//! credentials and resource owner password grants.
//!
//! A stored token is loaded at construction. Requests go through a
//! [`TokenCache`] that refreshes the token (or re-requests it, for client
//! credentials) when it expires.

mod cache;
mod endpoint;
mod pkce;
mod token;

pub use cache::{ClientCredentialsSource, RefreshTokenSource, TokenCache, TokenSource};
pub use endpoint::{AuthStyle, TokenEndpoint};
pub use pkce::{generate_verifier, s256_challenge};
pub use token::{
    Token, ACCESS_TOKEN_KEY, EXPIRY_DELTA_SECS, EXPIRY_KEY, PKCE_VERIFIER_KEY, REFRESH_TOKEN_KEY,
    TOKEN_TYPE_KEY,
};

use super::{send, AuthError, Authenticator};
use crate::config::OAuth2Config;
use crate::credentials::SharedAuthState;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderValue, AUTHORIZATION};
use reqwest::{Client, Request, Response};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info};
use url::Url;

const DEFAULT_STATE: &str = "state";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantType {
    AuthorizationCode,
    ClientCredentials,
    PasswordCredentials,
}

impl FromStr for GrantType {
    type Err = AuthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "AuthorizationCode" => Ok(GrantType::AuthorizationCode),
            "ClientCredentials" => Ok(GrantType::ClientCredentials),
            "PasswordCredentials" => Ok(GrantType::PasswordCredentials),
            other => Err(AuthError::Config(format!("unknown OAuth2 grant type: {}", other))),
        }
    }
}

/// Code and granted scopes extracted from the `auth CODE` argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationResponse {
    pub code: String,
    /// Present only when a full redirect URL carrying `scope` was given
    pub scopes: Option<String>,
    pub state: Option<String>,
}

impl AuthorizationResponse {
    /// Accepts either a bare code or the full redirect URL the provider
    /// sent the browser to.
    pub fn parse(arg: &str) -> Result<Self> {
        let url = match Url::parse(arg) {
            Ok(url) if url.query().is_some() => url,
            _ => {
                return Ok(Self {
                    code: arg.to_string(),
                    scopes: None,
                    state: None,
                })
            }
        };

        let mut code = None;
        let mut scopes = None;
        let mut state = None;
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "code" => code = Some(value.into_owned()),
                "scope" => scopes = Some(value.into_owned()),
                "state" => state = Some(value.into_owned()),
                "error" => return Err(anyhow!("authorization failed: {}", value)),
                _ => {}
            }
        }
        let code = code
            .filter(|c| !c.is_empty())
            .ok_or_else(|| anyhow!("no code parameter in redirect URL"))?;
        Ok(Self {
            code,
            scopes: scopes.filter(|s| !s.is_empty()),
            state,
        })
    }
}

/// OAuth 2.0 authenticator and login flows.
pub struct OAuth2Client {
    http: Client,
    config: OAuth2Config,
    grant_type: GrantType,
    endpoint: Arc<TokenEndpoint>,
    state: SharedAuthState,
    /// `None` until a token has been loaded or obtained
    cache: Option<TokenCache>,
    command: String,
}

impl OAuth2Client {
    /// Resolves the configuration and loads any stored token.
    ///
    /// Unknown grant types and auth styles are rejected here, before any
    /// network call.
    ///
    /// # Arguments
    /// * `config` - The `[oauth2]` section; environment references are resolved here
    /// * `state` - Credential record shared with the rest of the invocation
    /// * `http` - Client used for token endpoint calls and signed requests
    /// * `command` - Command prefix quoted in "not logged in" errors
    ///
    /// # Returns
    /// A client whose token cache is primed from `state` when a token is stored
    pub fn new(config: &OAuth2Config, state: SharedAuthState, http: Client, command: &str) -> Result<Self> {
        let config = config.resolved()?;
        let grant_type = config.grant_type.parse::<GrantType>()?;
        let endpoint = Arc::new(TokenEndpoint::new(&config, http.clone())?);

        let mut client = Self {
            http,
            config,
            grant_type,
            endpoint,
            state,
            cache: None,
            command: command.to_string(),
        };

        let stored = Token::load(&client.state.lock().unwrap());
        if let Some(token) = stored {
            debug!(valid = token.is_valid(), "Loaded stored OAuth2 token");
            client.cache = Some(client.new_cache(token));
        }
        Ok(client)
    }

    pub fn grant_type(&self) -> GrantType {
        self.grant_type
    }

    /// `state` value sent with the authorization URL.
    pub fn expected_state(&self) -> &str {
        if self.config.state.is_empty() {
            DEFAULT_STATE
        } else {
            &self.config.state
        }
    }

    /// Whether a valid token is available, refreshing it if needed.
    ///
    /// A failed refresh drops the cache so the caller can start a new login.
    pub async fn has_current_token(&mut self) -> bool {
        let result = match &self.cache {
            None => return false,
            Some(cache) => cache.token().await,
        };
        match result {
            Ok(token) if token.is_valid() => true,
            Ok(_) => {
                self.cache = None;
                false
            }
            Err(e) => {
                debug!(error = %format!("{:#}", e), "Stored OAuth2 token could not be refreshed");
                self.cache = None;
                false
            }
        }
    }

    /// Builds the provider authorization URL.
    ///
    /// With PKCE enabled a new verifier is generated and saved first, so the
    /// exchange in a later invocation can prove possession.
    pub fn auth_code_url(&self) -> Result<String> {
        let mut url = Url::parse(&self.config.auth_url)
            .with_context(|| format!("invalid oauth2.auth_url: {}", self.config.auth_url))?;

        let challenge = if self.config.use_pkce {
            let verifier = generate_verifier();
            let challenge = s256_challenge(&verifier);
            let mut state = self.state.lock().unwrap();
            state.set(PKCE_VERIFIER_KEY, verifier);
            state.save()?;
            Some(challenge)
        } else {
            None
        };

        {
            let mut query = url.query_pairs_mut();
            query.append_pair("response_type", "code");
            query.append_pair("client_id", &self.config.client_id);
            if !self.config.redirect_url.is_empty() {
                query.append_pair("redirect_uri", &self.config.redirect_url);
            }
            if !self.config.scopes.is_empty() {
                query.append_pair("scope", &self.config.scopes.join(" "));
            }
            query.append_pair("state", self.expected_state());
            query.extend_pairs(self.config.auth_url_params.iter());
            if let Some(challenge) = &challenge {
                query.append_pair("code_challenge", challenge);
                query.append_pair("code_challenge_method", pkce::CHALLENGE_METHOD);
            }
        }
        Ok(url.to_string())
    }

    /// Exchanges an authorization code and persists the token.
    pub async fn exchange_code(&mut self, code: &str) -> Result<()> {
        let verifier = if self.config.use_pkce {
            let state = self.state.lock().unwrap();
            let verifier = state.get(PKCE_VERIFIER_KEY).to_string();
            if verifier.is_empty() {
                return Err(anyhow!(
                    "no PKCE verifier stored: run {} auth without a code first",
                    self.command
                ));
            }
            Some(verifier)
        } else {
            None
        };

        let token = self
            .endpoint
            .exchange_code(code, &self.config.redirect_url, verifier.as_deref())
            .await?;
        self.install(token)
    }

    /// Obtains a token with the client credentials grant.
    pub async fn login_client_credentials(&mut self) -> Result<()> {
        let token = self.endpoint.client_credentials(&self.config.scopes).await?;
        self.install(token)
    }

    /// Obtains a token with the resource owner password grant.
    pub async fn login_password(&mut self) -> Result<()> {
        let token = self
            .endpoint
            .password(&self.config.username, &self.config.password, &self.config.scopes)
            .await?;
        self.install(token)
    }

    /// Drops the cached token and every stored key, then saves.
    pub fn reset_auth(&mut self) -> Result<()> {
        self.cache = None;
        let mut state = self.state.lock().unwrap();
        state.clear();
        state.save()?;
        debug!("OAuth2 state cleared");
        Ok(())
    }

    fn install(&mut self, token: Token) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap();
            token.store(&mut state);
            state.delete(PKCE_VERIFIER_KEY);
            state.save()?;
        }
        info!(grant = ?self.grant_type, "OAuth2 token stored");
        self.cache = Some(self.new_cache(token));
        Ok(())
    }

    fn new_cache(&self, token: Token) -> TokenCache {
        let source: Arc<dyn TokenSource> = match self.grant_type {
            GrantType::ClientCredentials => Arc::new(ClientCredentialsSource::new(
                self.endpoint.clone(),
                self.config.scopes.clone(),
            )),
            _ => Arc::new(RefreshTokenSource::new(self.endpoint.clone(), &self.command)),
        };
        TokenCache::new(Some(token), source, self.state.clone())
    }
}

#[async_trait]
impl Authenticator for OAuth2Client {
    async fn execute(&self, mut request: Request) -> Result<Response> {
        let cache = self.cache.as_ref().ok_or_else(|| AuthError::Unauthenticated {
            command: self.command.clone(),
        })?;
        let token = cache.token().await?;

        let mut value = HeaderValue::from_str(&token.authorization_value())
            .context("access token is not a valid header value")?;
        value.set_sensitive(true);
        request.headers_mut().insert(AUTHORIZATION, value);
        send(&self.http, request).await
    }
}
