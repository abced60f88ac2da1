//! Stateless authenticators: each decorates the request with credentials
//! resolved once from the configuration.

use super::{send, AuthError, Authenticator};
use crate::config::{secret, BasicAuthConfig, BearerAuthConfig};
use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION};
use reqwest::{Client, Request, Response};
use std::collections::BTreeMap;

/// Sends requests unchanged.
pub struct PlainClient {
    http: Client,
}

impl PlainClient {
    pub fn new(http: Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl Authenticator for PlainClient {
    async fn execute(&self, request: Request) -> Result<Response> {
        send(&self.http, request).await
    }
}

/// HTTP basic authentication.
pub struct BasicAuthClient {
    http: Client,
    authorization: HeaderValue,
}

impl BasicAuthClient {
    pub fn new(config: Option<&BasicAuthConfig>, http: Client) -> Result<Self> {
        let config =
            config.ok_or_else(|| AuthError::Config("basic_auth not configured".to_string()))?;
        let username = secret::resolve_field("basic_auth.username", &config.username)?;
        let password = secret::resolve_field("basic_auth.password", &config.password)?;

        let encoded = BASE64.encode(format!("{}:{}", username, password));
        let mut authorization = HeaderValue::from_str(&format!("Basic {}", encoded))
            .context("basic_auth credentials are not a valid header value")?;
        authorization.set_sensitive(true);

        Ok(Self { http, authorization })
    }
}

#[async_trait]
impl Authenticator for BasicAuthClient {
    async fn execute(&self, mut request: Request) -> Result<Response> {
        request
            .headers_mut()
            .insert(AUTHORIZATION, self.authorization.clone());
        send(&self.http, request).await
    }
}

/// Static bearer (or custom prefix) token.
pub struct BearerAuthClient {
    http: Client,
    authorization: HeaderValue,
}

impl BearerAuthClient {
    pub fn new(config: Option<&BearerAuthConfig>, http: Client) -> Result<Self> {
        let config =
            config.ok_or_else(|| AuthError::Config("bearer_auth not configured".to_string()))?;
        let token = secret::resolve_field("bearer_auth.token", &config.token)?;

        let value = if config.no_prefix {
            token
        } else if config.prefix.is_empty() {
            format!("Bearer {}", token)
        } else {
            format!("{} {}", config.prefix, token)
        };
        let mut authorization = HeaderValue::from_str(&value)
            .context("bearer_auth token is not a valid header value")?;
        authorization.set_sensitive(true);

        Ok(Self { http, authorization })
    }
}

#[async_trait]
impl Authenticator for BearerAuthClient {
    async fn execute(&self, mut request: Request) -> Result<Response> {
        request
            .headers_mut()
            .insert(AUTHORIZATION, self.authorization.clone());
        send(&self.http, request).await
    }
}

/// Fixed query parameters (API keys and the like).
pub struct QueryAuthClient {
    http: Client,
    params: BTreeMap<String, String>,
}

impl QueryAuthClient {
    pub fn new(config: Option<&BTreeMap<String, String>>, http: Client) -> Result<Self> {
        let config =
            config.ok_or_else(|| AuthError::Config("query_auth not configured".to_string()))?;
        let params = secret::resolve_map("query_auth", config)?;
        Ok(Self { http, params })
    }
}

#[async_trait]
impl Authenticator for QueryAuthClient {
    async fn execute(&self, mut request: Request) -> Result<Response> {
        if self.params.is_empty() {
            return send(&self.http, request).await;
        }
        let url = request.url_mut();
        // Configured parameters replace any of the same name
        let kept: Vec<(String, String)> = url
            .query_pairs()
            .filter(|(k, _)| !self.params.contains_key(k.as_ref()))
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        {
            let mut pairs = url.query_pairs_mut();
            pairs.clear();
            pairs.extend_pairs(kept);
            pairs.extend_pairs(self.params.iter());
        }
        send(&self.http, request).await
    }
}

/// Fixed request headers.
pub struct HeaderAuthClient {
    http: Client,
    headers: HeaderMap,
}

impl HeaderAuthClient {
    pub fn new(config: Option<&BTreeMap<String, String>>, http: Client) -> Result<Self> {
        let config =
            config.ok_or_else(|| AuthError::Config("header_auth not configured".to_string()))?;
        let resolved = secret::resolve_map("header_auth", config)?;

        let mut headers = HeaderMap::with_capacity(resolved.len());
        for (name, value) in resolved {
            let header_name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| AuthError::Config(format!("header_auth: invalid header name {}", name)))?;
            let mut header_value = HeaderValue::from_str(&value).map_err(|_| {
                AuthError::Config(format!("header_auth: invalid value for header {}", name))
            })?;
            header_value.set_sensitive(true);
            headers.insert(header_name, header_value);
        }

        Ok(Self { http, headers })
    }
}

#[async_trait]
impl Authenticator for HeaderAuthClient {
    async fn execute(&self, mut request: Request) -> Result<Response> {
        for (name, value) in &self.headers {
            request.headers_mut().insert(name.clone(), value.clone());
        }
        send(&self.http, request).await
    }
}
