//! OAuth 1.0a consumer (RFC 5849).
//!
//! Covers the three-legged token dance (temporary credentials, resource
//! owner authorization, token credentials). Signatures are computed by
//! `oauth1-request`; this module adds the provider quirks it does not cover
//! (body hash, parameters in the query, no timestamp).

use crate::auth::{redact_query, send, AuthError};
use crate::config::OAuth1Config;
use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use oauth1_request::signature_method::hmac_sha1::HmacSha1Sign;
use oauth1_request::signature_method::plaintext::PlaintextSign;
use oauth1_request::signature_method::{
    self as oauth_signature, HmacSha1, Plaintext, Sign, SignatureMethod as _,
};
use oauth1_request::{Builder, Credentials, ParameterList};
use reqwest::header::{HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, Method, Request};
use sha1::{Digest, Sha1};
use std::collections::{BTreeMap, HashMap};
use std::fmt::Display;
use std::num::NonZeroU64;
use std::str::FromStr;
use tracing::debug;
use url::Url;

const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

/// Token and shared secret, used for both request and access tokens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenPair {
    pub token: String,
    pub secret: String,
}

impl TokenPair {
    pub fn new(token: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            secret: secret.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureMethod {
    HmacSha1,
    Plaintext,
}

impl SignatureMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignatureMethod::HmacSha1 => "HMAC-SHA1",
            SignatureMethod::Plaintext => "PLAINTEXT",
        }
    }
}

impl FromStr for SignatureMethod {
    type Err = AuthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "HMAC-SHA1" => Ok(SignatureMethod::HmacSha1),
            "PLAINTEXT" => Ok(SignatureMethod::Plaintext),
            other => Err(AuthError::Config(format!(
                "unsupported oauth1 signature method: {}",
                other
            ))),
        }
    }
}


/// `oauth1-request` signature method that follows the configured algorithm
/// and optionally leaves out `oauth_timestamp`.
#[derive(Debug, Clone, Copy)]
struct ProviderSignature {
    method: SignatureMethod,
    timestamp: bool,
}

enum ProviderSign {
    HmacSha1(HmacSha1Sign),
    Plaintext(PlaintextSign),
}

struct StampedSign {
    inner: ProviderSign,
    timestamp: bool,
}

impl oauth_signature::SignatureMethod for ProviderSignature {
    type Sign = StampedSign;

    fn sign_with(self, client_secret: &str, token_secret: Option<&str>) -> StampedSign {
        let inner = match self.method {
            SignatureMethod::HmacSha1 => {
                ProviderSign::HmacSha1(HmacSha1::new().sign_with(client_secret, token_secret))
            }
            SignatureMethod::Plaintext => {
                ProviderSign::Plaintext(Plaintext::new().sign_with(client_secret, token_secret))
            }
        };
        StampedSign {
            inner,
            timestamp: self.timestamp,
        }
    }
}

impl Sign for StampedSign {
    type Signature = String;

    fn get_signature_method_name(&self) -> &'static str {
        match &self.inner {
            ProviderSign::HmacSha1(s) => s.get_signature_method_name(),
            ProviderSign::Plaintext(s) => s.get_signature_method_name(),
        }
    }

    fn request_method(&mut self, method: &str) {
        match &mut self.inner {
            ProviderSign::HmacSha1(s) => s.request_method(method),
            ProviderSign::Plaintext(s) => s.request_method(method),
        }
    }

    fn uri<T: Display>(&mut self, uri: T) {
        match &mut self.inner {
            ProviderSign::HmacSha1(s) => s.uri(uri),
            ProviderSign::Plaintext(s) => s.uri(uri),
        }
    }

    fn parameter<V: Display>(&mut self, key: &str, value: V) {
        match &mut self.inner {
            ProviderSign::HmacSha1(s) => s.parameter(key, value),
            ProviderSign::Plaintext(s) => s.parameter(key, value),
        }
    }

    fn delimiter(&mut self) {
        match &mut self.inner {
            ProviderSign::HmacSha1(s) => s.delimiter(),
            ProviderSign::Plaintext(s) => s.delimiter(),
        }
    }

    // Header-ready: percent-encoded
    fn end(self) -> String {
        match self.inner {
            ProviderSign::HmacSha1(s) => s.end().to_string(),
            ProviderSign::Plaintext(s) => percent_encode(&s.end()),
        }
    }

    fn use_timestamp(&self) -> bool {
        self.timestamp
    }
}

/// Per-call protocol values. `nonce` and `timestamp` are generated when
/// left unset.
#[derive(Debug, Default)]
struct Call<'a> {
    token: Option<&'a TokenPair>,
    callback: Option<&'a str>,
    verifier: Option<&'a str>,
    body_hash: Option<String>,
    nonce: Option<&'a str>,
    timestamp: Option<NonZeroU64>,
}

/// Consumer credentials plus the provider's endpoints.
pub struct Consumer {
    http: Client,
    consumer_key: String,
    consumer_secret: String,
    signature: ProviderSignature,
    token_method: Method,
    request_token_url: String,
    authorize_token_url: String,
    access_token_url: String,
    body_hash: bool,
    sign_query_params: bool,
    additional_params: BTreeMap<String, String>,
    additional_authorization_url_params: BTreeMap<String, String>,
}

impl Consumer {
    /// Builds a consumer from an already resolved configuration.
    ///
    /// # Arguments
    /// * `config` - OAuth1 section with placeholders resolved
    /// * `http` - Transport for the token endpoints
    ///
    /// # Returns
    /// `AuthError::Config` for an unknown signature method or token
    /// request method.
    pub fn new(config: &OAuth1Config, http: Client) -> Result<Self> {
        let method = config.signature_method.parse::<SignatureMethod>()?;
        let token_method = match config.http_method.to_ascii_uppercase().as_str() {
            "" | "GET" => Method::GET,
            "POST" => Method::POST,
            other => {
                return Err(AuthError::Config(format!(
                    "unsupported oauth1 http_method: {}",
                    other
                ))
                .into())
            }
        };

        Ok(Self {
            http,
            consumer_key: config.consumer_key.clone(),
            consumer_secret: config.consumer_secret.clone(),
            signature: ProviderSignature {
                method,
                timestamp: !config.ignore_timestamp,
            },
            token_method,
            request_token_url: config.request_token_url.clone(),
            authorize_token_url: config.authorize_token_url.clone(),
            access_token_url: config.access_token_url.clone(),
            body_hash: config.body_hash,
            sign_query_params: config.sign_query_params,
            additional_params: config.additional_params.clone(),
            additional_authorization_url_params: config.additional_authorization_url_params.clone(),
        })
    }

    /// Obtains temporary credentials and the URL the user must visit.
    ///
    /// # Arguments
    /// * `callback` - `oauth_callback` value (`oob` for out-of-band)
    ///
    /// # Returns
    /// The request token and the provider's authorization URL for it.
    pub async fn request_token(&self, callback: &str) -> Result<(TokenPair, String)> {
        let call = Call {
            callback: Some(callback),
            ..Default::default()
        };
        let values = self
            .token_request(&self.request_token_url, call)
            .await
            .context("request token failed")?;
        let token = token_pair_from(&values)?;
        let url = self.authorization_url(&token)?;
        Ok((token, url))
    }

    /// Authorization URL for `request_token` built from the configured endpoint.
    pub fn authorization_url(&self, request_token: &TokenPair) -> Result<String> {
        let mut url = Url::parse(&self.authorize_token_url)
            .with_context(|| format!("invalid authorize_token_url: {}", self.authorize_token_url))?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("oauth_token", &request_token.token);
            query.extend_pairs(self.additional_authorization_url_params.iter());
        }
        Ok(url.to_string())
    }

    /// Trades an authorized request token and verifier for an access token.
    ///
    /// # Arguments
    /// * `request_token` - Token returned by [`Consumer::request_token`]
    /// * `verifier` - Code the provider showed the user
    ///
    /// # Returns
    /// The access token, or `AuthError::Provider` when the provider rejects
    /// the exchange.
    pub async fn access_token(&self, request_token: &TokenPair, verifier: &str) -> Result<TokenPair> {
        let call = Call {
            token: Some(request_token),
            verifier: Some(verifier),
            ..Default::default()
        };
        let values = self
            .token_request(&self.access_token_url, call)
            .await
            .context("access token failed")?;
        token_pair_from(&values)
    }

    /// Signs `request` in place with the access token.
    ///
    /// Query parameters and a form-encoded body are covered by the
    /// signature. Other bodies get an `oauth_body_hash` when configured.
    pub fn sign(&self, request: &mut Request, token: &TokenPair) -> Result<()> {
        let is_form = request
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map_or(false, |ct| ct.starts_with(FORM_CONTENT_TYPE));
        let body = request.body().and_then(|b| b.as_bytes());

        let mut call = Call {
            token: Some(token),
            ..Default::default()
        };
        let mut params = query_pairs(request.url());
        match (is_form, body) {
            (true, Some(bytes)) => {
                params.extend(
                    url::form_urlencoded::parse(bytes).map(|(k, v)| (k.into_owned(), v.into_owned())),
                );
            }
            (false, body) if self.body_hash => {
                call.body_hash = Some(BASE64.encode(Sha1::digest(body.unwrap_or_default())));
            }
            _ => {}
        }

        let method = request.method().as_str().to_string();
        let header = self.authorization(&method, request.url(), &params, &call);
        self.attach(request, header)
    }

    async fn token_request(&self, endpoint: &str, call: Call<'_>) -> Result<HashMap<String, String>> {
        let mut url = Url::parse(endpoint).with_context(|| format!("invalid token URL: {}", endpoint))?;

        let mut params = query_pairs(&url);
        params.extend(
            self.additional_params
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        let header = self.authorization(self.token_method.as_str(), &url, &params, &call);

        let mut request = if self.token_method == Method::GET {
            if !self.additional_params.is_empty() {
                url.query_pairs_mut().extend_pairs(self.additional_params.iter());
            }
            Request::new(Method::GET, url)
        } else {
            let body = serde_urlencoded::to_string(&self.additional_params)
                .context("failed to encode additional_params")?;
            let mut req = Request::new(Method::POST, url);
            req.headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static(FORM_CONTENT_TYPE));
            *req.body_mut() = Some(body.into());
            req
        };
        self.attach(&mut request, header)?;

        debug!(url = %redact_query(request.url()), "OAuth1 token request");
        let response = send(&self.http, request).await?;
        let status = response.status();
        let body = response.text().await.context("failed to read token response")?;
        if !status.is_success() {
            return Err(AuthError::Provider {
                status: status.as_u16(),
                body,
            }
            .into());
        }

        serde_urlencoded::from_str(&body).context("failed to parse token response")
    }

    /// `Authorization` header value signing `params`, which must already
    /// include the URL's query parameters.
    fn authorization(&self, method: &str, url: &Url, params: &[(String, String)], call: &Call<'_>) -> String {
        // Keys go into the base string unencoded by the signer
        let mut signed: Vec<(String, String)> = params
            .iter()
            .map(|(k, v)| (percent_encode(&percent_encode(k)), v.clone()))
            .collect();
        if let Some(hash) = &call.body_hash {
            signed.push(("oauth_body_hash".to_string(), hash.clone()));
        }
        let signed: ParameterList<String, String> = ParameterList::new(signed);

        let client = Credentials::new(self.consumer_key.as_str(), self.consumer_secret.as_str());
        let mut builder = Builder::new(client, self.signature);
        builder
            .token(call.token.map(|t| Credentials::new(t.token.as_str(), t.secret.as_str())))
            .callback(call.callback)
            .verifier(call.verifier)
            .nonce(call.nonce)
            .timestamp(call.timestamp)
            .version(true);

        let header = builder.authorize(method, base_string_uri(url), &signed);
        match &call.body_hash {
            Some(hash) => format!("{},oauth_body_hash=\"{}\"", header, percent_encode(hash)),
            None => header,
        }
    }

    /// Puts the protocol parameters into the header or the query.
    fn attach(&self, request: &mut Request, header: String) -> Result<()> {
        if self.sign_query_params {
            let params = header_params(&header);
            request.url_mut().query_pairs_mut().extend_pairs(params);
        } else {
            let value = HeaderValue::from_str(&header)
                .context("OAuth parameters are not a valid header value")?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }
        Ok(())
    }
}

fn token_pair_from(values: &HashMap<String, String>) -> Result<TokenPair> {
    let token = values
        .get("oauth_token")
        .filter(|t| !t.is_empty())
        .ok_or_else(|| anyhow!("oauth_token missing from server response"))?;
    let secret = values
        .get("oauth_token_secret")
        .ok_or_else(|| anyhow!("oauth_token_secret missing from server response"))?;
    Ok(TokenPair::new(token.clone(), secret.clone()))
}

fn query_pairs(url: &Url) -> Vec<(String, String)> {
    url.query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect()
}

/// Decoded `key="value"` fields of an `OAuth ...` header.
fn header_params(header: &str) -> Vec<(String, String)> {
    header
        .trim_start_matches("OAuth ")
        .split(',')
        .filter_map(|field| {
            let (key, value) = field.split_once('=')?;
            let value = urlencoding::decode(value.trim().trim_matches('"')).ok()?;
            Some((key.trim().to_string(), value.into_owned()))
        })
        .collect()
}

/// RFC 3986 percent-encoding of everything outside the unreserved set.
fn percent_encode(s: &str) -> String {
    urlencoding::encode(s).into_owned()
}

/// Scheme, host, non-default port and path; no query or fragment.
fn base_string_uri(url: &Url) -> String {
    let scheme = url.scheme().to_ascii_lowercase();
    let host = url.host_str().unwrap_or_default().to_ascii_lowercase();
    match url.port() {
        Some(port) => format!("{}://{}:{}{}", scheme, host, port, url.path()),
        None => format!("{}://{}{}", scheme, host, url.path()),
    }
}
