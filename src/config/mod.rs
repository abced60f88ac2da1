pub mod secret;

use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Overrides the configuration directory.
pub const CONFIG_DIR_ENV: &str = "API_CLI_CONFIG_DIR";

/// Overrides the credential database path.
pub const STATE_DB_ENV: &str = "API_CLI_STATE_DB";

/// Complete configuration of one named API
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// Auth scheme: "", "basic", "bearer", "query", "header", "oauth1", "oauth2"
    #[serde(default)]
    pub auth: String,
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub docs_url: String,
    #[serde(default = "default_content_type")]
    pub default_content_type: String,
    #[serde(default)]
    pub user_agent: String,

    #[serde(default)]
    pub basic_auth: Option<BasicAuthConfig>,
    #[serde(default)]
    pub bearer_auth: Option<BearerAuthConfig>,
    /// Query parameters added to every request
    #[serde(default)]
    pub query_auth: Option<BTreeMap<String, String>>,
    /// Headers added to every request
    #[serde(default)]
    pub header_auth: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub oauth1: Option<OAuth1Config>,
    #[serde(default)]
    pub oauth2: Option<OAuth2Config>,
}

fn default_content_type() -> String {
    "application/json".to_string()
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            auth: String::new(),
            base_url: String::new(),
            docs_url: String::new(),
            default_content_type: default_content_type(),
            user_agent: String::new(),
            basic_auth: None,
            bearer_auth: None,
            query_auth: None,
            header_auth: None,
            oauth1: None,
            oauth2: None,
        }
    }
}

/// HTTP basic auth credentials
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BasicAuthConfig {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

/// Static bearer token
#[derive(Debug, Clone, Deserialize)]
pub struct BearerAuthConfig {
    /// Authorization scheme word, "Bearer" when blank
    #[serde(default = "default_bearer_prefix")]
    pub prefix: String,
    #[serde(default)]
    pub token: String,
    /// Send the token as the whole Authorization value
    #[serde(default)]
    pub no_prefix: bool,
}

fn default_bearer_prefix() -> String {
    "Bearer".to_string()
}

/// OAuth 1.0a consumer and service provider settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct OAuth1Config {
    pub consumer_key: String,
    pub consumer_secret: String,

    pub request_token_url: String,
    pub authorize_token_url: String,
    pub access_token_url: String,
    /// Access token lifetime in seconds; unset or 0 means it never expires
    pub access_duration_secs: Option<u64>,

    /// "HMAC-SHA1" (default) or "PLAINTEXT"
    pub signature_method: String,
    /// Method for token requests, "GET" when blank
    pub http_method: String,
    pub body_hash: bool,
    pub ignore_timestamp: bool,
    /// Send protocol parameters in the query string instead of the header
    pub sign_query_params: bool,
    pub additional_params: BTreeMap<String, String>,
    pub additional_authorization_url_params: BTreeMap<String, String>,
    /// Authorization URL with `{request_token}` style placeholders
    pub authorize_token_url_template: String,
}

impl OAuth1Config {
    /// Returns a copy with every secret placeholder resolved.
    pub fn resolved(&self) -> Result<Self> {
        use secret::{resolve_field as f, resolve_map};
        Ok(Self {
            consumer_key: f("oauth1.consumer_key", &self.consumer_key)?,
            consumer_secret: f("oauth1.consumer_secret", &self.consumer_secret)?,
            request_token_url: f("oauth1.request_token_url", &self.request_token_url)?,
            authorize_token_url: f("oauth1.authorize_token_url", &self.authorize_token_url)?,
            access_token_url: f("oauth1.access_token_url", &self.access_token_url)?,
            access_duration_secs: self.access_duration_secs,
            signature_method: f("oauth1.signature_method", &self.signature_method)?,
            http_method: f("oauth1.http_method", &self.http_method)?,
            body_hash: self.body_hash,
            ignore_timestamp: self.ignore_timestamp,
            sign_query_params: self.sign_query_params,
            additional_params: resolve_map("oauth1.additional_params", &self.additional_params)?,
            additional_authorization_url_params: resolve_map(
                "oauth1.additional_authorization_url_params",
                &self.additional_authorization_url_params,
            )?,
            authorize_token_url_template: f(
                "oauth1.authorize_token_url_template",
                &self.authorize_token_url_template,
            )?,
        })
    }
}

/// OAuth 2.0 client settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct OAuth2Config {
    /// "AuthorizationCode" (default), "ClientCredentials", "PasswordCredentials"
    pub grant_type: String,

    // Used by all grant types
    pub client_id: String,
    pub client_secret: String,
    pub scopes: Vec<String>,
    pub token_url: String,
    pub token_url_params: BTreeMap<String, String>,
    /// "AutoDetect" (default), "InParams", "InHeader"
    pub auth_style: String,
    /// Overrides the token type returned by the provider; blank means "Bearer"
    pub token_type: String,

    // Used by AuthorizationCode
    pub use_pkce: bool,
    pub redirect_url: String,
    pub auth_url: String,
    pub auth_url_params: BTreeMap<String, String>,
    /// Defaults to "state"
    pub state: String,

    // Used by PasswordCredentials
    pub username: String,
    pub password: String,
}

impl OAuth2Config {
    /// Returns a copy with every secret placeholder resolved.
    pub fn resolved(&self) -> Result<Self> {
        use secret::{resolve_field as f, resolve_list, resolve_map};
        Ok(Self {
            grant_type: f("oauth2.grant_type", &self.grant_type)?,
            client_id: f("oauth2.client_id", &self.client_id)?,
            client_secret: f("oauth2.client_secret", &self.client_secret)?,
            scopes: resolve_list("oauth2.scopes", &self.scopes)?,
            token_url: f("oauth2.token_url", &self.token_url)?,
            token_url_params: resolve_map("oauth2.token_url_params", &self.token_url_params)?,
            auth_style: f("oauth2.auth_style", &self.auth_style)?,
            token_type: f("oauth2.token_type", &self.token_type)?,
            use_pkce: self.use_pkce,
            redirect_url: f("oauth2.redirect_url", &self.redirect_url)?,
            auth_url: f("oauth2.auth_url", &self.auth_url)?,
            auth_url_params: resolve_map("oauth2.auth_url_params", &self.auth_url_params)?,
            state: f("oauth2.state", &self.state)?,
            username: f("oauth2.username", &self.username)?,
            password: f("oauth2.password", &self.password)?,
        })
    }
}

/// Directory holding `<name>.toml` files and the credential database.
pub fn config_dir() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var(CONFIG_DIR_ENV) {
        if !dir.is_empty() {
            return Ok(PathBuf::from(dir));
        }
    }
    dirs::config_dir()
        .map(|d| d.join("api-cli"))
        .ok_or_else(|| anyhow!("Could not determine a configuration directory; set {}", CONFIG_DIR_ENV))
}

/// Path of the credential database for configurations in `dir`.
pub fn state_db_path(dir: &Path) -> PathBuf {
    match std::env::var(STATE_DB_ENV) {
        Ok(path) if !path.is_empty() => PathBuf::from(path),
        _ => dir.join("auth.db"),
    }
}

/// Path of the config file for `name` (`default.toml` when unnamed).
pub fn config_path(dir: &Path, name: Option<&str>) -> Result<PathBuf> {
    let name = match name {
        Some(n) if !n.is_empty() => n,
        _ => return Ok(dir.join("default.toml")),
    };
    if name.contains(['/', '\\']) || name.starts_with('.') {
        bail!("invalid configuration name: {}", name);
    }
    Ok(dir.join(format!("{}.toml", name)))
}

/// Loads the configuration `name` from `dir`.
///
/// A missing default configuration is not an error; a missing named one is.
pub fn load_config_from(dir: &Path, name: Option<&str>) -> Result<ApiConfig> {
    let path = config_path(dir, name)?;
    let contents = match std::fs::read_to_string(&path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound && name.map_or(true, str::is_empty) => {
            tracing::debug!(path = %path.display(), "No default config, using empty configuration");
            return Ok(ApiConfig::default());
        }
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to read config {}", path.display()));
        }
    };
    let config: ApiConfig = toml::from_str(&contents)
        .with_context(|| format!("Failed to parse config {}", path.display()))?;
    tracing::debug!(path = %path.display(), auth = %config.auth, "Configuration loaded");
    Ok(config)
}
