//! OAuth2 engine integration tests using wiremock
//!
//! Verifies the token endpoint interactions of `OAuth2Engine`:
//!
//! - The `code_verifier` posted during the code exchange matches the
//!   `code_challenge` of the authorize URL.
//! - Client credentials authenticate with HTTP basic auth when a secret is
//!   configured and complete without a redirect.
//! - An expired token with a refresh token is renewed by `begin`.
//! - Token endpoint error bodies surface as `SmartError::OAuth`.

mod common;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration, Utc};
use url::Url;
use wiremock::matchers::{body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use smartfhir::auth::pkce;
use smartfhir::auth::{
    AuthSettings, AuthorizeRequest, AuthorizeStep, CredentialStore, MemoryStore, OAuth2Config,
    OAuth2Engine, OAuthEngine, OAuthToken, StrategyKind,
};
use smartfhir::SmartError;

const STORE_KEY: &str = "http://fhir.test/|app";
const REDIRECT: &str = "http://127.0.0.1:9/callback";

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn settings(server: &MockServer) -> AuthSettings {
    AuthSettings::new()
        .with("client_id", "app")
        .with("authorize_uri", format!("{}/authorize", server.uri()))
        .with("token_uri", format!("{}/token", server.uri()))
        .with("redirect", REDIRECT)
}

fn engine(kind: StrategyKind, settings: AuthSettings, store: Arc<MemoryStore>) -> OAuth2Engine {
    let config = OAuth2Config::from_settings(kind, &settings, STORE_KEY).expect("valid config");
    OAuth2Engine::new(reqwest::Client::new(), config, store)
}

fn request() -> AuthorizeRequest {
    AuthorizeRequest {
        scope: "user/*.* openid profile".to_string(),
        audience: Some("http://fhir.test/".to_string()),
        embedded: false,
    }
}

async fn posted_form(server: &MockServer) -> HashMap<String, String> {
    let requests = server.received_requests().await.expect("recording enabled");
    let last = requests
        .iter()
        .rev()
        .find(|r| r.url.path() == "/token")
        .expect("token request");
    url::form_urlencoded::parse(&last.body).into_owned().collect()
}

// ---------------------------------------------------------------------------
// Code grant
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_code_exchange_sends_matching_verifier() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("grant_type=authorization_code"))
        .and(body_string_contains("code=auth-code-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(common::token_body("access-1")))
        .expect(1)
        .mount(&server)
        .await;

    let store = Arc::new(MemoryStore::new());
    let engine = engine(StrategyKind::CodeGrant, settings(&server), store.clone());

    let AuthorizeStep::AwaitRedirect(authorize_url) = engine.begin(&request()).await.unwrap() else {
        panic!("code grant must await a redirect");
    };
    let state = common::query_param(&authorize_url, "state").expect("state");
    let challenge = common::query_param(&authorize_url, "code_challenge").expect("challenge");

    let redirect = Url::parse(&format!("{REDIRECT}?code=auth-code-1&state={state}")).unwrap();
    let params = engine.handle_redirect(&redirect).await.expect("exchange");
    assert_eq!(params["access_token"], "access-1");

    let form = posted_form(&server).await;
    assert_eq!(form["client_id"], "app");
    assert_eq!(form["redirect_uri"], REDIRECT);
    assert_eq!(pkce::challenge_for(&form["code_verifier"]), challenge);

    let stored = store.load(STORE_KEY).unwrap().expect("token persisted");
    assert_eq!(stored.access_token, "access-1");
    assert_eq!(stored.refresh_token.as_deref(), Some("refresh-1"));
    assert_eq!(engine.access_token().await.as_deref(), Some("access-1"));
}

#[tokio::test]
async fn test_expired_token_is_refreshed_without_redirect() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("grant_type=refresh_token"))
        .and(body_string_contains("refresh_token=old-refresh"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": "access-2",
            "token_type": "Bearer",
            "expires_in": 3600
        })))
        .expect(1)
        .mount(&server)
        .await;

    let store = Arc::new(MemoryStore::new());
    store
        .save(
            STORE_KEY,
            &OAuthToken {
                expires_at: Some(Utc::now() - Duration::seconds(60)),
                refresh_token: Some("old-refresh".to_string()),
                ..OAuthToken::bearer("access-old")
            },
        )
        .unwrap();
    let engine = engine(StrategyKind::CodeGrant, settings(&server), store.clone());
    assert!(!engine.has_unexpired_token().await);

    let step = engine.begin(&request()).await.expect("begin");
    let AuthorizeStep::Completed(params) = step else {
        panic!("refresh must complete without a redirect");
    };
    assert_eq!(params["access_token"], "access-2");

    // The refresh token survives a response that omits it
    let stored = store.load(STORE_KEY).unwrap().expect("token persisted");
    assert_eq!(stored.refresh_token.as_deref(), Some("old-refresh"));
    assert!(engine.has_unexpired_token().await);
}

#[tokio::test]
async fn test_failed_refresh_falls_back_to_redirect_flow() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
            "error": "invalid_grant"
        })))
        .mount(&server)
        .await;

    let store = Arc::new(MemoryStore::new());
    store
        .save(
            STORE_KEY,
            &OAuthToken {
                expires_at: Some(Utc::now() - Duration::seconds(60)),
                refresh_token: Some("revoked".to_string()),
                ..OAuthToken::bearer("access-old")
            },
        )
        .unwrap();
    let engine = engine(StrategyKind::CodeGrant, settings(&server), store);

    let step = engine.begin(&request()).await.expect("begin");
    assert!(matches!(step, AuthorizeStep::AwaitRedirect(_)));
}

#[tokio::test]
async fn test_token_error_body_is_reported() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
            "error": "invalid_grant",
            "error_description": "code expired"
        })))
        .mount(&server)
        .await;

    let engine = engine(StrategyKind::CodeGrant, settings(&server), Arc::new(MemoryStore::new()));
    let AuthorizeStep::AwaitRedirect(authorize_url) = engine.begin(&request()).await.unwrap() else {
        panic!("code grant must await a redirect");
    };
    let state = common::query_param(&authorize_url, "state").unwrap();
    let redirect = Url::parse(&format!("{REDIRECT}?code=stale&state={state}")).unwrap();

    let err = engine.handle_redirect(&redirect).await.expect_err("exchange fails");
    match err.downcast_ref::<SmartError>() {
        Some(SmartError::OAuth(message)) => {
            assert!(message.contains("invalid_grant: code expired"), "{message}");
        }
        other => panic!("expected OAuth error, got {other:?}"),
    }
    assert!(engine.access_token().await.is_none());
}

// ---------------------------------------------------------------------------
// Client credentials
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_client_credentials_uses_basic_auth_and_completes() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .and(header("authorization", "Basic YXBwOnNlY3JldA=="))
        .and(body_string_contains("grant_type=client_credentials"))
        .respond_with(ResponseTemplate::new(200).set_body_json(common::token_body("system-1")))
        .expect(1)
        .mount(&server)
        .await;

    let settings = AuthSettings::new()
        .with("client_id", "app")
        .with("client_secret", "secret")
        .with("token_uri", format!("{}/token", server.uri()));
    let store = Arc::new(MemoryStore::new());
    let engine = engine(StrategyKind::ClientCredentials, settings, store.clone());

    let step = engine.begin(&request()).await.expect("begin");
    let AuthorizeStep::Completed(params) = step else {
        panic!("client credentials must complete directly");
    };
    assert_eq!(params["access_token"], "system-1");

    let form = posted_form(&server).await;
    assert_eq!(form["scope"], "user/*.* openid profile");
    assert!(store.load(STORE_KEY).unwrap().is_some());
}

#[tokio::test]
async fn test_client_credentials_without_token_uri_is_rejected() {
    let settings = AuthSettings::new().with("client_id", "app");
    let err = OAuth2Config::from_settings(StrategyKind::ClientCredentials, &settings, STORE_KEY)
        .expect_err("token_uri is required");
    assert!(matches!(
        err.downcast_ref::<SmartError>(),
        Some(SmartError::NoAuthorizationMethod(_))
    ));
}
