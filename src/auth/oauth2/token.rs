use crate::credentials::AuthState;
use chrono::{DateTime, Datelike, Duration, SecondsFormat, Utc};

pub const ACCESS_TOKEN_KEY: &str = "AccessToken";
pub const REFRESH_TOKEN_KEY: &str = "RefreshToken";
pub const TOKEN_TYPE_KEY: &str = "TokenType";
pub const EXPIRY_KEY: &str = "Expiry";
pub const PKCE_VERIFIER_KEY: &str = "PKCEVerifier";

/// A token is treated as expired this long before its actual expiry.
pub const EXPIRY_DELTA_SECS: i64 = 10;

/// OAuth 2.0 token as persisted in the credential store.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Token {
    pub access_token: String,
    /// As returned by the provider or overridden in config; blank means Bearer
    pub token_type: String,
    pub refresh_token: String,
    /// `None` never expires
    pub expiry: Option<DateTime<Utc>>,
}

impl Token {
    /// Non-empty and not within [`EXPIRY_DELTA_SECS`] of expiring.
    pub fn is_valid(&self) -> bool {
        self.is_valid_at(Utc::now())
    }

    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        if self.access_token.is_empty() {
            return false;
        }
        match self.expiry {
            None => true,
            Some(expiry) => now < expiry - Duration::seconds(EXPIRY_DELTA_SECS),
        }
    }

    /// Scheme word for the Authorization header.
    pub fn header_type(&self) -> &str {
        let t = self.token_type.as_str();
        if t.is_empty() || t.eq_ignore_ascii_case("bearer") {
            "Bearer"
        } else if t.eq_ignore_ascii_case("mac") {
            "MAC"
        } else if t.eq_ignore_ascii_case("basic") {
            "Basic"
        } else {
            t
        }
    }

    pub fn authorization_value(&self) -> String {
        format!("{} {}", self.header_type(), self.access_token)
    }

    /// Reads the token fields from `state`; `None` when no access token is stored.
    pub fn load(state: &AuthState) -> Option<Self> {
        let access_token = state.get(ACCESS_TOKEN_KEY);
        if access_token.is_empty() {
            return None;
        }
        Some(Self {
            access_token: access_token.to_string(),
            token_type: state.get(TOKEN_TYPE_KEY).to_string(),
            refresh_token: state.get(REFRESH_TOKEN_KEY).to_string(),
            expiry: parse_expiry(state.get(EXPIRY_KEY)),
        })
    }

    /// Writes the token fields into `state` without saving.
    pub fn store(&self, state: &mut AuthState) {
        state.set(ACCESS_TOKEN_KEY, self.access_token.as_str());
        state.set(TOKEN_TYPE_KEY, self.token_type.as_str());
        state.set(REFRESH_TOKEN_KEY, self.refresh_token.as_str());
        state.set(
            EXPIRY_KEY,
            self.expiry
                .map(|e| e.to_rfc3339_opts(SecondsFormat::Secs, true))
                .unwrap_or_default(),
        );
    }
}

// Blank, unparsable and year-1 ("zero time") values mean no expiry
fn parse_expiry(value: &str) -> Option<DateTime<Utc>> {
    let parsed = DateTime::parse_from_rfc3339(value).ok()?.with_timezone(&Utc);
    if parsed.year() <= 1 {
        None
    } else {
        Some(parsed)
    }
}
