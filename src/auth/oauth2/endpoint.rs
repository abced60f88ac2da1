//! OAuth 2.0 token endpoint client.
//!
//! Handles every grant this crate performs against the provider's token URL:
//! authorization code exchange, client credentials, resource owner password
//! and refresh.

use super::token::Token;
use crate::auth::{send, AuthError};
use crate::config::OAuth2Config;
use anyhow::{anyhow, Context, Result};
use chrono::{Duration, Utc};
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::Client;
use serde::{Deserialize, Deserializer};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::OnceLock;

/// How client credentials are presented to the token endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStyle {
    /// Try `InHeader` first, then `InParams`, and remember what worked
    AutoDetect,
    /// `client_id` and `client_secret` in the form body
    InParams,
    /// HTTP basic authentication
    InHeader,
}

impl FromStr for AuthStyle {
    type Err = AuthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "AutoDetect" => Ok(AuthStyle::AutoDetect),
            "InParams" => Ok(AuthStyle::InParams),
            "InHeader" => Ok(AuthStyle::InHeader),
            other => Err(AuthError::Config(format!("unknown OAuth2 auth style: {}", other))),
        }
    }
}

/// OAuth token response (standard OAuth 2.0)
#[derive(Deserialize, Debug)]
struct TokenResponse {
    #[serde(default)]
    access_token: String,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default, deserialize_with = "deserialize_expires_in")]
    expires_in: Option<i64>,
}

// Some providers send expires_in as a string, and form-encoded bodies
// always do.
fn deserialize_expires_in<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumberOrString {
        Number(i64),
        String(String),
    }

    match Option::<NumberOrString>::deserialize(deserializer)? {
        None => Ok(None),
        Some(NumberOrString::Number(n)) => Ok(Some(n)),
        Some(NumberOrString::String(s)) if s.is_empty() => Ok(None),
        Some(NumberOrString::String(s)) => s
            .parse()
            .map(Some)
            .map_err(|_| serde::de::Error::custom(format!("invalid expires_in: {}", s))),
    }
}

impl TokenResponse {
    fn parse(content_type: &str, body: &str) -> Result<Self> {
        if content_type.starts_with("application/x-www-form-urlencoded")
            || content_type.starts_with("text/plain")
        {
            serde_urlencoded::from_str(body).context("Failed to parse form-encoded token response")
        } else {
            serde_json::from_str(body).context("Failed to parse token response")
        }
    }

    fn into_token(self) -> Result<Token> {
        if self.access_token.is_empty() {
            return Err(anyhow!("server response missing access_token"));
        }
        let expiry = match self.expires_in.filter(|secs| *secs != 0) {
            None => None,
            Some(secs) => Some(
                Duration::try_seconds(secs)
                    .and_then(|lifetime| Utc::now().checked_add_signed(lifetime))
                    .ok_or_else(|| anyhow!("server response has out-of-range expires_in: {}", secs))?,
            ),
        };
        Ok(Token {
            access_token: self.access_token,
            token_type: self.token_type.unwrap_or_default(),
            refresh_token: self.refresh_token.unwrap_or_default(),
            expiry,
        })
    }
}

/// Token URL plus the client credentials used to call it.
pub struct TokenEndpoint {
    http: Client,
    token_url: String,
    client_id: String,
    client_secret: String,
    auth_style: AuthStyle,
    detected_style: OnceLock<AuthStyle>,
    /// Sent with code exchange and client credentials requests
    extra_params: BTreeMap<String, String>,
    /// Replaces the provider's token type on every minted token
    token_type: String,
}

impl TokenEndpoint {
    /// Builds the endpoint from an already resolved configuration.
    ///
    /// # Arguments
    /// * `config` - Resolved `[oauth2]` section supplying token URL, client
    ///   credentials, auth style and extra token parameters
    /// * `http` - Client shared with the rest of the invocation
    ///
    /// # Returns
    /// The endpoint, or a config error for an unknown auth style
    pub fn new(config: &OAuth2Config, http: Client) -> Result<Self> {
        let auth_style = config.auth_style.parse::<AuthStyle>()?;
        Ok(Self {
            http,
            token_url: config.token_url.clone(),
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            auth_style,
            detected_style: OnceLock::new(),
            extra_params: config.token_url_params.clone(),
            token_type: config.token_type.clone(),
        })
    }

    /// Exchanges an authorization code, sending the PKCE verifier when given.
    ///
    /// # Arguments
    /// * `code` - Code taken from the authorization redirect
    /// * `redirect_url` - Sent as `redirect_uri` when non-empty
    /// * `verifier` - PKCE code verifier generated with the authorization URL
    ///
    /// # Returns
    /// The minted token, or [`AuthError::Provider`] on a non-2xx response
    pub async fn exchange_code(
        &self,
        code: &str,
        redirect_url: &str,
        verifier: Option<&str>,
    ) -> Result<Token> {
        let mut params = form(&[("grant_type", "authorization_code"), ("code", code)]);
        if !redirect_url.is_empty() {
            params.push(("redirect_uri".to_string(), redirect_url.to_string()));
        }
        if let Some(verifier) = verifier {
            params.push(("code_verifier".to_string(), verifier.to_string()));
        }
        self.extend_extra(&mut params);
        self.retrieve(params).await
    }

    /// Mints a token for the client itself.
    ///
    /// # Arguments
    /// * `scopes` - Requested scopes, sent space-separated when non-empty
    ///
    /// # Returns
    /// The minted token
    pub async fn client_credentials(&self, scopes: &[String]) -> Result<Token> {
        let mut params = form(&[("grant_type", "client_credentials")]);
        push_scopes(&mut params, scopes);
        self.extend_extra(&mut params);
        self.retrieve(params).await
    }

    /// Resource owner password grant.
    ///
    /// # Arguments
    /// * `username` - Resource owner name
    /// * `password` - Resource owner password
    /// * `scopes` - Requested scopes
    ///
    /// # Returns
    /// The minted token
    pub async fn password(&self, username: &str, password: &str, scopes: &[String]) -> Result<Token> {
        let mut params = form(&[
            ("grant_type", "password"),
            ("username", username),
            ("password", password),
        ]);
        push_scopes(&mut params, scopes);
        self.retrieve(params).await
    }

    /// Redeems a refresh token. The old refresh token is kept when the
    /// provider does not rotate it.
    ///
    /// # Arguments
    /// * `refresh_token` - Refresh token from the stale token
    ///
    /// # Returns
    /// The replacement token
    pub async fn refresh(&self, refresh_token: &str) -> Result<Token> {
        let params = form(&[("grant_type", "refresh_token"), ("refresh_token", refresh_token)]);
        let mut token = self.retrieve(params).await?;
        if token.refresh_token.is_empty() {
            token.refresh_token = refresh_token.to_string();
        }
        Ok(token)
    }

    fn extend_extra(&self, params: &mut Vec<(String, String)>) {
        params.extend(
            self.extra_params
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
    }

    async fn retrieve(&self, params: Vec<(String, String)>) -> Result<Token> {
        let style = match self.auth_style {
            AuthStyle::AutoDetect => self.detected_style.get().copied(),
            fixed => Some(fixed),
        };

        let mut token = match style {
            Some(style) => self.post(&params, style).await?,
            None => match self.post(&params, AuthStyle::InHeader).await {
                Ok(token) => {
                    let _ = self.detected_style.set(AuthStyle::InHeader);
                    token
                }
                Err(e) if matches!(e.downcast_ref::<AuthError>(), Some(AuthError::Provider { .. })) => {
                    tracing::debug!(error = %e, "Token endpoint rejected header credentials, retrying in params");
                    let token = self.post(&params, AuthStyle::InParams).await?;
                    let _ = self.detected_style.set(AuthStyle::InParams);
                    token
                }
                Err(e) => return Err(e),
            },
        };

        token.token_type = self.token_type.clone();
        Ok(token)
    }

    async fn post(&self, params: &[(String, String)], style: AuthStyle) -> Result<Token> {
        let mut builder = self
            .http
            .post(&self.token_url)
            .header(ACCEPT, "application/json");

        let mut body = params.to_vec();
        if style == AuthStyle::InHeader {
            builder = builder.basic_auth(form_escape(&self.client_id), Some(form_escape(&self.client_secret)));
        } else {
            body.push(("client_id".to_string(), self.client_id.clone()));
            if !self.client_secret.is_empty() {
                body.push(("client_secret".to_string(), self.client_secret.clone()));
            }
        }

        tracing::debug!(url = %self.token_url, ?style, "Requesting token");

        let request = builder
            .form(&body)
            .build()
            .with_context(|| format!("invalid token_url: {}", self.token_url))?;
        let response = send(&self.http, request).await?;

        let status = response.status();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let text = response.text().await.context("Failed to read token response")?;

        if !status.is_success() {
            return Err(AuthError::Provider {
                status: status.as_u16(),
                body: text,
            }
            .into());
        }

        let parsed = TokenResponse::parse(&content_type, &text)?;
        tracing::debug!(
            "Token request successful, has_refresh_token={}, expires_in={:?}",
            parsed.refresh_token.is_some(),
            parsed.expires_in
        );
        parsed.into_token()
    }
}

fn form(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn push_scopes(params: &mut Vec<(String, String)>, scopes: &[String]) {
    if !scopes.is_empty() {
        params.push(("scope".to_string(), scopes.join(" ")));
    }
}

// RFC 6749 section 2.3.1: credentials are form-encoded before basic auth
fn form_escape(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
}
