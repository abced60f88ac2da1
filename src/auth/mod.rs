//! Request authenticators.
//!
//! Every configured auth scheme produces an [`Authenticator`]: an object that
//! decorates an outgoing request with credentials and sends it. OAuth schemes
//! additionally expose their interactive flows to the `auth` subcommand.

pub mod oauth1;
pub mod oauth2;
mod simple;

use crate::config::ApiConfig;
use crate::credentials::SharedAuthState;
use anyhow::Result;
use async_trait::async_trait;
use reqwest::{Client, Request, Response};

pub use oauth1::OAuth1Client;
pub use oauth2::OAuth2Client;
pub use simple::{BasicAuthClient, BearerAuthClient, HeaderAuthClient, PlainClient, QueryAuthClient};

/// Decorates and forwards outgoing HTTP requests.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Attaches credentials to `request` and performs the transport call.
    async fn execute(&self, request: Request) -> Result<Response>;
}

/// Authentication errors
#[derive(Debug, PartialEq, Clone)]
pub enum AuthError {
    /// Missing or invalid configuration (unknown scheme, grant type, auth style)
    Config(String),
    /// A request was made before any successful login
    Unauthenticated { command: String },
    /// A token or authorization endpoint answered with a non-2xx status
    Provider { status: u16, body: String },
    /// OAuth 1.0 verification without a current request token
    NoRequestToken,
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthError::Config(msg) => write!(f, "{}", msg),
            AuthError::Unauthenticated { command } => {
                write!(f, "not logged in: try {} auth", command)
            }
            AuthError::Provider { status, body } => {
                write!(f, "provider returned status {}: {}", status, body)
            }
            AuthError::NoRequestToken => write!(
                f,
                "no current request token (request tokens expire after 5 minutes): run auth without a code to start over"
            ),
        }
    }
}

impl std::error::Error for AuthError {}

/// Builds the authenticator for the configured scheme.
///
/// # Arguments
/// * `config` - Loaded API configuration
/// * `state` - Credential store of the same configuration
/// * `http` - Transport shared by every authenticator
/// * `command` - How the user invokes this binary (used in login hints)
pub fn new_authenticator(
    config: &ApiConfig,
    state: SharedAuthState,
    http: Client,
    command: &str,
) -> Result<Box<dyn Authenticator>> {
    let authenticator: Box<dyn Authenticator> = match config.auth.as_str() {
        "" | "none" => Box::new(PlainClient::new(http)),
        "basic" => Box::new(BasicAuthClient::new(config.basic_auth.as_ref(), http)?),
        "bearer" => Box::new(BearerAuthClient::new(config.bearer_auth.as_ref(), http)?),
        "query" => Box::new(QueryAuthClient::new(config.query_auth.as_ref(), http)?),
        "header" => Box::new(HeaderAuthClient::new(config.header_auth.as_ref(), http)?),
        "oauth1" => {
            let oauth1 = config
                .oauth1
                .as_ref()
                .ok_or_else(|| AuthError::Config("oauth1 not configured".to_string()))?;
            Box::new(OAuth1Client::new(oauth1, state, http, command)?)
        }
        "oauth2" => {
            let oauth2 = config
                .oauth2
                .as_ref()
                .ok_or_else(|| AuthError::Config("oauth2 not configured".to_string()))?;
            Box::new(OAuth2Client::new(oauth2, state, http, command)?)
        }
        other => {
            return Err(AuthError::Config(format!("unknown authorization type: {}", other)).into())
        }
    };
    tracing::debug!(scheme = %config.auth, "Authenticator constructed");
    Ok(authenticator)
}

/// Sends `request` after turning transport failures into readable errors.
pub(crate) async fn send(http: &Client, request: Request) -> Result<Response> {
    use anyhow::Context;
    let method = request.method().clone();
    let url = request.url().clone();
    http.execute(request)
        .await
        .with_context(|| format!("{} {} failed", method, redact_query(&url)))
}

/// URL without its query string, for logs and error messages.
pub(crate) fn redact_query(url: &url::Url) -> String {
    let mut shown = url.clone();
    shown.set_query(None);
    shown.to_string()
}
