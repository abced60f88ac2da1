// Integration tests for the OAuth 2.0 flows, token cache and request plumbing

use api_cli::auth::oauth2::{s256_challenge, Token, ACCESS_TOKEN_KEY, PKCE_VERIFIER_KEY, REFRESH_TOKEN_KEY};
use api_cli::auth::{AuthError, Authenticator, OAuth2Client};
use api_cli::cli::{execute_paged, execute_request, run_auth};
use api_cli::config::{ApiConfig, OAuth2Config};
use api_cli::context::{build_http_client, AppContext};
use api_cli::credentials::{AuthState, SqliteStateStore, StateBackend};
use anyhow::bail;
use chrono::{Duration, Utc};
use mockito::{Matcher, Server};
use reqwest::{Method, Request};
use std::collections::HashMap;
use std::sync::Arc;
use tempfile::TempDir;

const CONFIG_NAME: &str = "svc";

fn oauth2_config(server_url: &str, grant_type: &str) -> ApiConfig {
    ApiConfig {
        auth: "oauth2".to_string(),
        base_url: format!("{}/api/", server_url),
        oauth2: Some(OAuth2Config {
            grant_type: grant_type.to_string(),
            client_id: "cid".to_string(),
            client_secret: "secret".to_string(),
            scopes: vec!["read".to_string()],
            auth_url: format!("{}/authorize", server_url),
            token_url: format!("{}/token", server_url),
            redirect_url: "http://localhost:8000/callback".to_string(),
            auth_style: "InParams".to_string(),
            use_pkce: true,
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn backend(dir: &TempDir) -> Arc<SqliteStateStore> {
    Arc::new(SqliteStateStore::new(dir.path().join("auth.db"), None).unwrap())
}

/// Fresh context over the same database, like a new process invocation.
fn context(dir: &TempDir, config: &ApiConfig) -> AppContext {
    let state = AuthState::load(CONFIG_NAME, backend(dir)).unwrap().into_shared();
    let http = build_http_client(config).unwrap();
    AppContext::new(Some(CONFIG_NAME.to_string()), config.clone(), state, http)
}

fn stored(dir: &TempDir) -> HashMap<String, String> {
    backend(dir).load(CONFIG_NAME).unwrap()
}

fn seed(dir: &TempDir, token: &Token) {
    let mut state = AuthState::load(CONFIG_NAME, backend(dir)).unwrap();
    token.store(&mut state);
    state.save().unwrap();
}

fn oauth2_client(ctx: &AppContext) -> OAuth2Client {
    OAuth2Client::new(
        ctx.config.oauth2.as_ref().unwrap(),
        ctx.state.clone(),
        ctx.http.clone(),
        &ctx.command_name(),
    )
    .unwrap()
}

/// Reads through to the database but refuses every save.
struct ReadOnlyStore(Arc<SqliteStateStore>);

impl StateBackend for ReadOnlyStore {
    fn load(&self, name: &str) -> anyhow::Result<HashMap<String, String>> {
        self.0.load(name)
    }

    fn save(&self, _name: &str, _values: &HashMap<String, String>) -> anyhow::Result<()> {
        bail!("database is read-only")
    }
}

fn output(buf: Vec<u8>) -> String {
    String::from_utf8(buf).unwrap()
}

/// Authorization URL, then code exchange in a later invocation, then an
/// authenticated request in a third.
#[tokio::test]
async fn test_authorization_code_with_pkce_across_invocations() {
    let dir = TempDir::new().unwrap();
    let mut server = Server::new_async().await;
    let config = oauth2_config(&server.url(), "AuthorizationCode");

    // Invocation 1: build the authorization URL
    let ctx = context(&dir, &config);
    let url = url::Url::parse(&oauth2_client(&ctx).auth_code_url().unwrap()).unwrap();
    let query: HashMap<String, String> = url.query_pairs().into_owned().collect();
    let verifier = stored(&dir)[PKCE_VERIFIER_KEY].clone();
    assert_eq!(query["code_challenge"], s256_challenge(&verifier));
    assert_eq!(query["state"], "state");

    // Invocation 2: exchange the code from the pasted redirect URL
    let token_mock = server
        .mock("POST", "/token")
        .match_body(Matcher::AllOf(vec![
            Matcher::UrlEncoded("grant_type".into(), "authorization_code".into()),
            Matcher::UrlEncoded("code".into(), "the-code".into()),
            Matcher::UrlEncoded("code_verifier".into(), verifier.clone()),
        ]))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"access_token":"at-1","token_type":"bearer","refresh_token":"rt-1","expires_in":3600}"#)
        .expect(1)
        .create_async()
        .await;

    let ctx = context(&dir, &config);
    let mut out = Vec::new();
    run_auth(
        &ctx,
        false,
        Some("http://localhost:8000/callback?code=the-code&state=state&scope=read"),
        &mut out,
    )
    .await
    .unwrap();

    let printed = output(out);
    assert!(printed.contains("Scopes: read"));
    assert!(printed.ends_with("success\n"));
    token_mock.assert_async().await;

    let record = stored(&dir);
    assert_eq!(record[ACCESS_TOKEN_KEY], "at-1");
    assert_eq!(record[REFRESH_TOKEN_KEY], "rt-1");
    assert!(!record.contains_key(PKCE_VERIFIER_KEY));

    // Invocation 3: the stored token authenticates requests
    let api_mock = server
        .mock("GET", "/api/me")
        .match_header("authorization", "Bearer at-1")
        .with_status(200)
        .with_body(r#"{"id":42}"#)
        .create_async()
        .await;

    let ctx = context(&dir, &config);
    let mut body = Vec::new();
    execute_request(&ctx, Method::GET, "me", None, &mut body).await.unwrap();

    assert_eq!(output(body), r#"{"id":42}"#);
    api_mock.assert_async().await;
}

#[tokio::test]
async fn test_state_mismatch_is_rejected_before_exchange() {
    let dir = TempDir::new().unwrap();
    let mut server = Server::new_async().await;
    let config = oauth2_config(&server.url(), "");
    let token_mock = server.mock("POST", "/token").expect(0).create_async().await;

    let ctx = context(&dir, &config);
    let err = run_auth(
        &ctx,
        false,
        Some("http://localhost:8000/callback?code=c&state=forged"),
        &mut Vec::new(),
    )
    .await
    .unwrap_err();

    assert!(err.to_string().contains("state mismatch"));
    token_mock.assert_async().await;
}

/// Concurrent requests with an expired token refresh exactly once and the
/// new token is persisted.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_expired_token_refreshed_once() {
    let dir = TempDir::new().unwrap();
    let mut server = Server::new_async().await;
    let config = oauth2_config(&server.url(), "AuthorizationCode");
    seed(
        &dir,
        &Token {
            access_token: "stale".to_string(),
            token_type: String::new(),
            refresh_token: "rt-1".to_string(),
            expiry: Some(Utc::now() - Duration::seconds(30)),
        },
    );

    let refresh_mock = server
        .mock("POST", "/token")
        .match_body(Matcher::AllOf(vec![
            Matcher::UrlEncoded("grant_type".into(), "refresh_token".into()),
            Matcher::UrlEncoded("refresh_token".into(), "rt-1".into()),
        ]))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"access_token":"fresh","expires_in":3600}"#)
        .expect(1)
        .create_async()
        .await;
    let api_mock = server
        .mock("GET", "/api/items")
        .match_header("authorization", "Bearer fresh")
        .with_status(200)
        .expect(5)
        .create_async()
        .await;

    let ctx = context(&dir, &config);
    let client = Arc::new(oauth2_client(&ctx));
    let url = format!("{}/api/items", server.url());

    let handles: Vec<_> = (0..5)
        .map(|_| {
            let client = client.clone();
            let url = url.clone();
            tokio::spawn(async move {
                let request = Request::new(Method::GET, url.parse().unwrap());
                client.execute(request).await.unwrap().status()
            })
        })
        .collect();
    for status in futures::future::join_all(handles).await {
        assert_eq!(status.unwrap(), 200);
    }

    refresh_mock.assert_async().await;
    api_mock.assert_async().await;

    let record = stored(&dir);
    assert_eq!(record[ACCESS_TOKEN_KEY], "fresh");
    // Provider did not rotate the refresh token
    assert_eq!(record[REFRESH_TOKEN_KEY], "rt-1");
}

#[tokio::test]
async fn test_refresh_that_cannot_be_saved_is_an_error() {
    let dir = TempDir::new().unwrap();
    let mut server = Server::new_async().await;
    let config = oauth2_config(&server.url(), "AuthorizationCode");
    seed(
        &dir,
        &Token {
            access_token: "stale".to_string(),
            token_type: String::new(),
            refresh_token: "rt-1".to_string(),
            expiry: Some(Utc::now() - Duration::seconds(30)),
        },
    );
    let refresh_mock = server
        .mock("POST", "/token")
        .match_body(Matcher::UrlEncoded("grant_type".into(), "refresh_token".into()))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"access_token":"fresh","expires_in":3600}"#)
        .expect(1)
        .create_async()
        .await;
    let api_mock = server
        .mock("GET", "/api/items")
        .match_header("authorization", "Bearer fresh")
        .expect(1)
        .create_async()
        .await;

    let state = AuthState::load(CONFIG_NAME, Arc::new(ReadOnlyStore(backend(&dir))))
        .unwrap()
        .into_shared();
    let client = OAuth2Client::new(
        config.oauth2.as_ref().unwrap(),
        state,
        build_http_client(&config).unwrap(),
        "api -c svc",
    )
    .unwrap();
    let url = format!("{}/api/items", server.url());

    let err = client
        .execute(Request::new(Method::GET, url.parse().unwrap()))
        .await
        .unwrap_err();
    let chain = format!("{:#}", err);
    assert!(chain.contains("Failed to persist refreshed token"), "{}", chain);
    assert!(chain.contains("database is read-only"), "{}", chain);
    assert_eq!(stored(&dir)[ACCESS_TOKEN_KEY], "stale");

    // The refreshed token stays in memory for this process
    let response = client
        .execute(Request::new(Method::GET, url.parse().unwrap()))
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    refresh_mock.assert_async().await;
    api_mock.assert_async().await;
}

#[tokio::test]
async fn test_out_of_range_expires_in_stores_nothing() {
    let dir = TempDir::new().unwrap();
    let mut server = Server::new_async().await;
    let config = oauth2_config(&server.url(), "ClientCredentials");
    let _token_mock = server
        .mock("POST", "/token")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"access_token":"cc","expires_in":9223372036854775807}"#)
        .create_async()
        .await;

    let err = run_auth(&context(&dir, &config), false, None, &mut Vec::new())
        .await
        .unwrap_err();

    assert!(format!("{:#}", err).contains("out-of-range expires_in"));
    assert!(stored(&dir).is_empty());
}

/// Each page goes through the same client: the first refresh yields a
/// token that is already inside the expiry window, so the second page
/// refreshes again and the third reuses that token.
#[tokio::test]
async fn test_paged_get_refreshes_between_pages() {
    let dir = TempDir::new().unwrap();
    let mut server = Server::new_async().await;
    let config = oauth2_config(&server.url(), "AuthorizationCode");
    seed(
        &dir,
        &Token {
            access_token: "stale".to_string(),
            token_type: String::new(),
            refresh_token: "rt-1".to_string(),
            expiry: Some(Utc::now() - Duration::seconds(30)),
        },
    );

    let first_refresh = server
        .mock("POST", "/token")
        .match_body(Matcher::UrlEncoded("refresh_token".into(), "rt-1".into()))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"access_token":"at-1","expires_in":1,"refresh_token":"rt-2"}"#)
        .expect(1)
        .create_async()
        .await;
    let second_refresh = server
        .mock("POST", "/token")
        .match_body(Matcher::UrlEncoded("refresh_token".into(), "rt-2".into()))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"access_token":"at-2","expires_in":3600}"#)
        .expect(1)
        .create_async()
        .await;

    let page1 = server
        .mock("GET", "/api/items")
        .match_header("authorization", "Bearer at-1")
        .with_header("link", r#"</api/items?page=2>; rel="next", </api/items?page=3>; rel="last""#)
        .with_body("[1]")
        .expect(1)
        .create_async()
        .await;
    let page2 = server
        .mock("GET", "/api/items?page=2")
        .match_header("authorization", "Bearer at-2")
        .with_header("link", &format!(r#"<{}/api/items?page=3>; rel="next""#, server.url()))
        .with_body("[2]")
        .expect(1)
        .create_async()
        .await;
    let page3 = server
        .mock("GET", "/api/items?page=3")
        .match_header("authorization", "Bearer at-2")
        .with_body("[3]")
        .expect(1)
        .create_async()
        .await;

    let mut out = Vec::new();
    execute_paged(&context(&dir, &config), "items", 0, &mut out)
        .await
        .unwrap();

    assert_eq!(output(out), "[[1],[2],[3]]\n");
    for mock in [first_refresh, second_refresh, page1, page2, page3] {
        mock.assert_async().await;
    }
    let record = stored(&dir);
    assert_eq!(record[ACCESS_TOKEN_KEY], "at-2");
    assert_eq!(record[REFRESH_TOKEN_KEY], "rt-2");
}

#[tokio::test]
async fn test_paged_get_stops_at_max() {
    let dir = TempDir::new().unwrap();
    let mut server = Server::new_async().await;
    let config = ApiConfig {
        base_url: format!("{}/", server.url()),
        ..Default::default()
    };
    let page1 = server
        .mock("GET", "/list")
        .with_header("link", r#"</list?p=2>; rel="next""#)
        .with_body(r#"{"n":1}"#)
        .create_async()
        .await;
    let page2 = server
        .mock("GET", "/list?p=2")
        .with_header("link", r#"</list?p=3>; rel="next""#)
        .with_body(r#"{"n":2}"#)
        .create_async()
        .await;
    let page3 = server.mock("GET", "/list?p=3").expect(0).create_async().await;

    let mut out = Vec::new();
    execute_paged(&context(&dir, &config), "list", 2, &mut out)
        .await
        .unwrap();

    assert_eq!(output(out), "[{\"n\":1},{\"n\":2}]\n");
    page1.assert_async().await;
    page2.assert_async().await;
    page3.assert_async().await;
}

#[tokio::test]
async fn test_failed_refresh_leaves_store_untouched() {
    let dir = TempDir::new().unwrap();
    let mut server = Server::new_async().await;
    let config = oauth2_config(&server.url(), "AuthorizationCode");
    seed(
        &dir,
        &Token {
            access_token: "stale".to_string(),
            token_type: String::new(),
            refresh_token: "revoked".to_string(),
            expiry: Some(Utc::now() - Duration::seconds(30)),
        },
    );
    let _refresh_mock = server
        .mock("POST", "/token")
        .with_status(400)
        .with_body(r#"{"error":"invalid_grant"}"#)
        .create_async()
        .await;

    let ctx = context(&dir, &config);
    let client = oauth2_client(&ctx);
    let request = Request::new(Method::GET, format!("{}/api/items", server.url()).parse().unwrap());
    let err = client.execute(request).await.unwrap_err();

    assert!(matches!(
        err.downcast_ref::<AuthError>(),
        Some(AuthError::Provider { status: 400, .. })
    ));
    assert_eq!(stored(&dir)[ACCESS_TOKEN_KEY], "stale");
}

#[tokio::test]
async fn test_client_credentials_login_then_current() {
    let dir = TempDir::new().unwrap();
    let mut server = Server::new_async().await;
    let config = oauth2_config(&server.url(), "ClientCredentials");
    let token_mock = server
        .mock("POST", "/token")
        .match_body(Matcher::AllOf(vec![
            Matcher::UrlEncoded("grant_type".into(), "client_credentials".into()),
            Matcher::UrlEncoded("scope".into(), "read".into()),
        ]))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"access_token":"cc","expires_in":3600}"#)
        .expect(2)
        .create_async()
        .await;

    let mut out = Vec::new();
    run_auth(&context(&dir, &config), false, None, &mut out).await.unwrap();
    assert_eq!(output(out), "success\n");

    let mut out = Vec::new();
    run_auth(&context(&dir, &config), false, None, &mut out).await.unwrap();
    assert_eq!(output(out), "access token is current\n");

    // --reset forces a new token
    let mut out = Vec::new();
    run_auth(&context(&dir, &config), true, None, &mut out).await.unwrap();
    assert_eq!(output(out), "success\n");

    token_mock.assert_async().await;
}

#[tokio::test]
async fn test_password_grant() {
    let dir = TempDir::new().unwrap();
    let mut server = Server::new_async().await;
    let mut config = oauth2_config(&server.url(), "PasswordCredentials");
    if let Some(oauth2) = config.oauth2.as_mut() {
        oauth2.username = "alice".to_string();
        oauth2.password = "hunter2".to_string();
        oauth2.token_type = "token".to_string();
    }
    let token_mock = server
        .mock("POST", "/token")
        .match_body(Matcher::AllOf(vec![
            Matcher::UrlEncoded("grant_type".into(), "password".into()),
            Matcher::UrlEncoded("username".into(), "alice".into()),
            Matcher::UrlEncoded("password".into(), "hunter2".into()),
        ]))
        .with_status(200)
        .with_header("content-type", "application/x-www-form-urlencoded")
        .with_body("access_token=pw-token&token_type=bearer")
        .create_async()
        .await;
    let api_mock = server
        .mock("GET", "/api/me")
        .match_header("authorization", "token pw-token")
        .create_async()
        .await;

    run_auth(&context(&dir, &config), false, None, &mut Vec::new())
        .await
        .unwrap();
    execute_request(&context(&dir, &config), Method::GET, "me", None, &mut Vec::new())
        .await
        .unwrap();

    token_mock.assert_async().await;
    api_mock.assert_async().await;
}

#[tokio::test]
async fn test_unknown_grant_type_fails_before_network() {
    let dir = TempDir::new().unwrap();
    let mut server = Server::new_async().await;
    let config = oauth2_config(&server.url(), "Foo");
    let token_mock = server.mock("POST", "/token").expect(0).create_async().await;

    let err = run_auth(&context(&dir, &config), false, None, &mut Vec::new())
        .await
        .unwrap_err();

    assert_eq!(
        err.downcast_ref::<AuthError>(),
        Some(&AuthError::Config("unknown OAuth2 grant type: Foo".to_string()))
    );
    token_mock.assert_async().await;
}

#[tokio::test]
async fn test_request_without_login_is_unauthenticated() {
    let dir = TempDir::new().unwrap();
    let mut server = Server::new_async().await;
    let config = oauth2_config(&server.url(), "ClientCredentials");
    let api_mock = server.mock("GET", "/api/me").expect(0).create_async().await;

    let err = execute_request(&context(&dir, &config), Method::GET, "me", None, &mut Vec::new())
        .await
        .unwrap_err();

    assert_eq!(err.to_string(), "not logged in: try api -c svc auth");
    api_mock.assert_async().await;
}

#[tokio::test]
async fn test_non_success_response_is_an_error() {
    let dir = TempDir::new().unwrap();
    let mut server = Server::new_async().await;
    let config = ApiConfig {
        base_url: format!("{}/", server.url()),
        ..Default::default()
    };
    let _mock = server
        .mock("GET", "/missing")
        .with_status(404)
        .with_body("not here")
        .create_async()
        .await;

    let mut body = Vec::new();
    let err = execute_request(&context(&dir, &config), Method::GET, "missing", None, &mut body)
        .await
        .unwrap_err();

    assert_eq!(err.to_string(), "HTTP error 404 Not Found");
    assert!(body.is_empty());
}

#[tokio::test]
async fn test_post_sends_body_with_default_content_type() {
    let dir = TempDir::new().unwrap();
    let mut server = Server::new_async().await;
    let config = ApiConfig {
        base_url: format!("{}/v1/", server.url()),
        user_agent: "integration-test/1.0".to_string(),
        ..Default::default()
    };
    let mock = server
        .mock("POST", "/v1/items")
        .match_header("content-type", "application/json")
        .match_header("accept", "application/json")
        .match_header("user-agent", "integration-test/1.0")
        .match_body(r#"{"name":"widget"}"#)
        .with_status(201)
        .with_body(r#"{"id":1}"#)
        .create_async()
        .await;

    let mut body = Vec::new();
    execute_request(
        &context(&dir, &config),
        Method::POST,
        "items",
        Some(br#"{"name":"widget"}"#.to_vec()),
        &mut body,
    )
    .await
    .unwrap();

    assert_eq!(output(body), r#"{"id":1}"#);
    mock.assert_async().await;
}
