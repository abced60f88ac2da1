//! OAuth 1.0a login state machine.
//!
//! ```text
//! logged out ──request_access──▶ request token pending ──verify_access──▶ logged in
//!      ▲                                  │ (5 minutes)                       │
//!      └────────────── reset_auth ────────┴───────────────────────────────────┘
//! ```
//!
//! Request and access tokens are stored with the time they were issued so a
//! later invocation can decide whether they are still usable.

mod signer;

pub use signer::{Consumer, SignatureMethod, TokenPair};

use super::{send, AuthError, Authenticator};
use crate::config::OAuth1Config;
use crate::credentials::{AuthState, SharedAuthState};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use reqwest::{Client, Request, Response};
use tracing::{debug, info};

/// How long a request token stays usable for verification.
pub const REQUEST_TOKEN_LIFETIME_SECS: i64 = 300;

/// Out-of-band callback: the provider shows the verifier to the user.
const OOB_CALLBACK: &str = "oob";

pub const ACCESS_TOKEN_KEY: &str = "AccessToken";
pub const ACCESS_TOKEN_SECRET_KEY: &str = "AccessTokenSecret";
pub const ACCESS_TOKEN_DATE_KEY: &str = "AccessTokenDate";
pub const REQUEST_TOKEN_KEY: &str = "RequestToken";
pub const REQUEST_TOKEN_SECRET_KEY: &str = "RequestTokenSecret";
pub const REQUEST_TOKEN_DATE_KEY: &str = "RequestTokenDate";

/// A token together with the time it was issued.
#[derive(Debug, Clone, PartialEq)]
struct IssuedToken {
    pair: TokenPair,
    issued_at: DateTime<Utc>,
}

impl IssuedToken {
    /// Reads the token stored under the given keys; absent or undated
    /// tokens yield `None`.
    fn load(state: &AuthState, token_key: &str, secret_key: &str, date_key: &str) -> Option<Self> {
        let token = state.get(token_key);
        if token.is_empty() {
            return None;
        }
        let issued_at = DateTime::parse_from_rfc3339(state.get(date_key))
            .ok()?
            .with_timezone(&Utc);
        Some(Self {
            pair: TokenPair::new(token, state.get(secret_key)),
            issued_at,
        })
    }

    fn store(&self, state: &mut AuthState, token_key: &str, secret_key: &str, date_key: &str) {
        state.set(token_key, self.pair.token.as_str());
        state.set(secret_key, self.pair.secret.as_str());
        state.set(
            date_key,
            self.issued_at.to_rfc3339_opts(SecondsFormat::Secs, true),
        );
    }

    fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.issued_at
    }
}

fn delete_keys(state: &mut AuthState, keys: &[&str]) {
    for key in keys {
        state.delete(key);
    }
}

/// OAuth 1.0a authenticator and login flow.
pub struct OAuth1Client {
    http: Client,
    consumer: Consumer,
    state: SharedAuthState,
    /// Access token lifetime; `None` never expires
    access_duration: Option<Duration>,
    /// Provider authorization URL with `{placeholder}` keys
    url_template: String,
    authorize_token_url: String,
    consumer_key: String,
    request_token: Option<IssuedToken>,
    /// Set only while the access token is usable for signing
    access_token: Option<IssuedToken>,
    command: String,
}

impl OAuth1Client {
    /// Resolves the configuration and loads any stored tokens.
    ///
    /// An access token that has outlived its duration is ignored.
    pub fn new(config: &OAuth1Config, state: SharedAuthState, http: Client, command: &str) -> Result<Self> {
        let config = config.resolved()?;
        let consumer = Consumer::new(&config, http.clone())?;
        let access_duration = match config.access_duration_secs.filter(|secs| *secs > 0) {
            None => None,
            Some(secs) => Some(
                i64::try_from(secs)
                    .ok()
                    .and_then(Duration::try_seconds)
                    .ok_or_else(|| {
                        AuthError::Config(format!("oauth1.access_duration_secs out of range: {}", secs))
                    })?,
            ),
        };

        let (request_token, access_token) = {
            let state = state.lock().unwrap();
            (
                IssuedToken::load(
                    &state,
                    REQUEST_TOKEN_KEY,
                    REQUEST_TOKEN_SECRET_KEY,
                    REQUEST_TOKEN_DATE_KEY,
                ),
                IssuedToken::load(
                    &state,
                    ACCESS_TOKEN_KEY,
                    ACCESS_TOKEN_SECRET_KEY,
                    ACCESS_TOKEN_DATE_KEY,
                ),
            )
        };

        let mut client = Self {
            http,
            consumer,
            state,
            access_duration,
            url_template: config.authorize_token_url_template,
            authorize_token_url: config.authorize_token_url,
            consumer_key: config.consumer_key,
            request_token,
            access_token,
            command: command.to_string(),
        };
        if !client.is_logged_in() {
            client.access_token = None;
        }
        Ok(client)
    }

    /// Whether a stored access token exists and is within its duration.
    pub fn is_logged_in(&self) -> bool {
        match &self.access_token {
            None => false,
            Some(token) => match self.access_duration {
                None => true,
                Some(duration) => token.age(Utc::now()) <= duration,
            },
        }
    }

    /// Starts a login: obtains a fresh request token, discards any access
    /// token and returns the URL the user must visit.
    pub async fn request_access(&mut self) -> Result<String> {
        let (pair, provider_url) = self.consumer.request_token(OOB_CALLBACK).await?;
        let issued = IssuedToken {
            pair,
            issued_at: Utc::now(),
        };

        let url = if self.url_template.is_empty() {
            provider_url
        } else {
            self.render_authorization_url(&issued.pair)
        };

        {
            let mut state = self.state.lock().unwrap();
            delete_keys(
                &mut state,
                &[ACCESS_TOKEN_KEY, ACCESS_TOKEN_SECRET_KEY, ACCESS_TOKEN_DATE_KEY],
            );
            issued.store(
                &mut state,
                REQUEST_TOKEN_KEY,
                REQUEST_TOKEN_SECRET_KEY,
                REQUEST_TOKEN_DATE_KEY,
            );
            state.save()?;
        }
        self.access_token = None;
        self.request_token = Some(issued);

        info!("OAuth1 request token issued");
        Ok(url)
    }

    /// Completes a login with the verification code shown by the provider.
    ///
    /// Fails with [`AuthError::NoRequestToken`] before any network call when
    /// no request token was issued in the last five minutes.
    pub async fn verify_access(&mut self, code: &str) -> Result<()> {
        let request_token = match &self.request_token {
            Some(token)
                if token.age(Utc::now()) <= Duration::seconds(REQUEST_TOKEN_LIFETIME_SECS) =>
            {
                token.pair.clone()
            }
            _ => return Err(AuthError::NoRequestToken.into()),
        };

        let pair = self.consumer.access_token(&request_token, code).await?;
        let issued = IssuedToken {
            pair,
            issued_at: Utc::now(),
        };

        {
            let mut state = self.state.lock().unwrap();
            issued.store(
                &mut state,
                ACCESS_TOKEN_KEY,
                ACCESS_TOKEN_SECRET_KEY,
                ACCESS_TOKEN_DATE_KEY,
            );
            delete_keys(
                &mut state,
                &[REQUEST_TOKEN_KEY, REQUEST_TOKEN_SECRET_KEY, REQUEST_TOKEN_DATE_KEY],
            );
            state.save()?;
        }
        self.request_token = None;
        self.access_token = Some(issued);

        info!("OAuth1 access token stored");
        Ok(())
    }

    /// Forgets every token and persists the empty state.
    pub fn reset_auth(&mut self) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap();
            delete_keys(
                &mut state,
                &[
                    ACCESS_TOKEN_KEY,
                    ACCESS_TOKEN_SECRET_KEY,
                    ACCESS_TOKEN_DATE_KEY,
                    REQUEST_TOKEN_KEY,
                    REQUEST_TOKEN_SECRET_KEY,
                    REQUEST_TOKEN_DATE_KEY,
                ],
            );
            state.save()?;
        }
        self.request_token = None;
        self.access_token = None;
        debug!("OAuth1 tokens cleared");
        Ok(())
    }

    fn render_authorization_url(&self, request_token: &TokenPair) -> String {
        render_template(
            &self.url_template,
            &[
                ("request_token", request_token.token.as_str()),
                ("request_token_secret", request_token.secret.as_str()),
                ("consumer_key", self.consumer_key.as_str()),
                ("authorize_token_url", self.authorize_token_url.as_str()),
            ],
        )
    }
}

/// Replaces every `{key}` in `template` with its value. Unknown placeholders
/// are left as they are.
pub fn render_template(template: &str, values: &[(&str, &str)]) -> String {
    values.iter().fold(template.to_string(), |acc, (key, value)| {
        acc.replace(&format!("{{{}}}", key), value)
    })
}

#[async_trait]
impl Authenticator for OAuth1Client {
    async fn execute(&self, mut request: Request) -> Result<Response> {
        let token = self
            .access_token
            .as_ref()
            .ok_or_else(|| AuthError::Unauthenticated {
                command: self.command.clone(),
            })?;
        self.consumer.sign(&mut request, &token.pair)?;
        send(&self.http, request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::MemoryStateStore;
    use std::sync::Arc;

    fn shared_state(pairs: &[(&str, &str)]) -> (Arc<MemoryStateStore>, SharedAuthState) {
        let backend = Arc::new(MemoryStateStore::new());
        let mut state = AuthState::load("twitter", backend.clone()).unwrap();
        for (k, v) in pairs {
            state.set(k, *v);
        }
        (backend, state.into_shared())
    }

    fn ago(secs: i64) -> String {
        (Utc::now() - Duration::seconds(secs)).to_rfc3339_opts(SecondsFormat::Secs, true)
    }

    fn config(duration: Option<u64>) -> OAuth1Config {
        OAuth1Config {
            consumer_key: "ck".to_string(),
            consumer_secret: "cs".to_string(),
            request_token_url: "https://provider.example/request".to_string(),
            authorize_token_url: "https://provider.example/authorize".to_string(),
            access_token_url: "https://provider.example/access".to_string(),
            access_duration_secs: duration,
            ..Default::default()
        }
    }

    fn client(config: &OAuth1Config, state: SharedAuthState) -> OAuth1Client {
        OAuth1Client::new(config, state, Client::new(), "api -c twitter").unwrap()
    }

    #[test]
    fn test_logged_out_without_token() {
        let (_, state) = shared_state(&[]);
        assert!(!client(&config(None), state).is_logged_in());
    }

    #[test]
    fn test_out_of_range_access_duration_is_config_error() {
        for secs in [u64::MAX, i64::MAX as u64, 10_000_000_000_000_000] {
            let (_, state) = shared_state(&[]);
            let err = OAuth1Client::new(&config(Some(secs)), state, Client::new(), "api").err().expect("expected config error");
            assert_eq!(
                err.downcast_ref::<AuthError>(),
                Some(&AuthError::Config(format!("oauth1.access_duration_secs out of range: {}", secs)))
            );
        }

        // A century is fine
        let (_, state) = shared_state(&[]);
        assert!(OAuth1Client::new(&config(Some(100 * 365 * 24 * 3600)), state, Client::new(), "api").is_ok());
    }

    #[test]
    fn test_old_token_without_duration_never_expires() {
        let issued = ago(10 * 365 * 24 * 3600);
        let (_, state) = shared_state(&[
            (ACCESS_TOKEN_KEY, "at"),
            (ACCESS_TOKEN_SECRET_KEY, "ats"),
            (ACCESS_TOKEN_DATE_KEY, issued.as_str()),
        ]);
        assert!(client(&config(None), state.clone()).is_logged_in());
        assert!(client(&config(Some(0)), state).is_logged_in());
    }

    #[test]
    fn test_access_token_expires_after_duration() {
        let issued = ago(7200);
        let (_, state) = shared_state(&[
            (ACCESS_TOKEN_KEY, "at"),
            (ACCESS_TOKEN_SECRET_KEY, "ats"),
            (ACCESS_TOKEN_DATE_KEY, issued.as_str()),
        ]);
        assert!(!client(&config(Some(3600)), state.clone()).is_logged_in());
        assert!(client(&config(Some(86400)), state).is_logged_in());
    }

    #[test]
    fn test_undated_token_is_ignored() {
        let (_, state) = shared_state(&[(ACCESS_TOKEN_KEY, "at"), (ACCESS_TOKEN_DATE_KEY, "garbage")]);
        assert!(!client(&config(None), state).is_logged_in());
    }

    #[tokio::test]
    async fn test_verify_without_request_token() {
        let (_, state) = shared_state(&[]);
        let mut c = client(&config(None), state);

        let err = c.verify_access("1234").await.unwrap_err();
        assert_eq!(err.downcast_ref::<AuthError>(), Some(&AuthError::NoRequestToken));
    }

    #[tokio::test]
    async fn test_verify_with_expired_request_token() {
        let issued = ago(REQUEST_TOKEN_LIFETIME_SECS + 60);
        let (_, state) = shared_state(&[
            (REQUEST_TOKEN_KEY, "rt"),
            (REQUEST_TOKEN_SECRET_KEY, "rts"),
            (REQUEST_TOKEN_DATE_KEY, issued.as_str()),
        ]);
        let mut c = client(&config(None), state);

        let err = c.verify_access("1234").await.unwrap_err();
        assert_eq!(err.downcast_ref::<AuthError>(), Some(&AuthError::NoRequestToken));
    }

    #[test]
    fn test_reset_clears_and_saves() {
        let issued = ago(10);
        let (backend, state) = shared_state(&[
            (ACCESS_TOKEN_KEY, "at"),
            (ACCESS_TOKEN_SECRET_KEY, "ats"),
            (ACCESS_TOKEN_DATE_KEY, issued.as_str()),
            (REQUEST_TOKEN_KEY, "rt"),
        ]);
        let mut c = client(&config(None), state);
        assert!(c.is_logged_in());

        c.reset_auth().unwrap();

        assert!(!c.is_logged_in());
        assert!(backend.snapshot("twitter").is_empty());
    }

    #[tokio::test]
    async fn test_execute_requires_login() {
        let (_, state) = shared_state(&[]);
        let c = client(&config(None), state);
        let request = Request::new(reqwest::Method::GET, "https://provider.example/me".parse().unwrap());

        let err = c.execute(request).await.unwrap_err();
        assert_eq!(
            err.downcast_ref::<AuthError>(),
            Some(&AuthError::Unauthenticated {
                command: "api -c twitter".to_string()
            })
        );
    }

    #[test]
    fn test_render_template() {
        let rendered = render_template(
            "{authorize_token_url}?token={request_token}&key={consumer_key}&x={unknown}",
            &[
                ("request_token", "rt"),
                ("consumer_key", "ck"),
                ("authorize_token_url", "https://p.example/auth"),
            ],
        );
        assert_eq!(rendered, "https://p.example/auth?token=rt&key=ck&x={unknown}");
    }

    #[test]
    fn test_unknown_signature_method_is_config_error() {
        let (_, state) = shared_state(&[]);
        let mut cfg = config(None);
        cfg.signature_method = "RSA-SHA1".to_string();

        let err = OAuth1Client::new(&cfg, state, Client::new(), "api").err().unwrap();
        assert!(matches!(err.downcast_ref::<AuthError>(), Some(AuthError::Config(_))));
    }
}
