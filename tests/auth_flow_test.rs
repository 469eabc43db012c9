//! End-to-end authorization tests against a wiremock FHIR server
//!
//! The mock server publishes a capability statement whose SMART endpoints
//! point back at itself, so the coordinator runs discovery, strategy
//! selection, the OAuth2 exchange, and signed requests over real HTTP.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use url::Url;
use wiremock::matchers::{body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use smartfhir::auth::{
    AuthCoordinator, AuthOutcome, AuthParameters, AuthSettings, GranularityPolicy, LoginPresenter,
    MemoryStore, PatientSelector, PresentationContext, StrategyKind,
};
use smartfhir::gateway::{RequestGateway, RequestSigner};
use smartfhir::SmartError;

const REDIRECT: &str = "http://127.0.0.1:9/callback";

// ---------------------------------------------------------------------------
// Test doubles
// ---------------------------------------------------------------------------

/// Records the authorize URL and, when `auto_redirect` is set, answers with a
/// redirect carrying `code` and the URL's `state`.
#[derive(Default)]
struct RecordingPresenter {
    auto_redirect: bool,
    seen: Mutex<Option<Url>>,
}

impl RecordingPresenter {
    fn auto() -> Self {
        Self {
            auto_redirect: true,
            ..Self::default()
        }
    }

    fn seen(&self) -> Option<Url> {
        self.seen.lock().unwrap().clone()
    }
}

fn redirect_with_code(authorize_url: &Url, code: &str) -> Url {
    let state = common::query_param(authorize_url, "state").expect("state");
    Url::parse(&format!("{REDIRECT}?code={code}&state={state}")).unwrap()
}

#[async_trait::async_trait]
impl LoginPresenter for RecordingPresenter {
    async fn present_login(
        &self,
        authorize_url: &Url,
        _embedded: bool,
        _context: Option<&PresentationContext>,
    ) -> smartfhir::Result<Option<Url>> {
        *self.seen.lock().unwrap() = Some(authorize_url.clone());
        if self.auto_redirect {
            Ok(Some(redirect_with_code(authorize_url, "code-1")))
        } else {
            Ok(None)
        }
    }
}

/// Reads a fixed patient through the gateway it is handed.
struct ReadingSelector {
    patient_id: String,
}

#[async_trait::async_trait]
impl PatientSelector for ReadingSelector {
    async fn select_patient(
        &self,
        gateway: RequestGateway,
        _parameters: &AuthParameters,
    ) -> smartfhir::Result<Option<Value>> {
        Ok(Some(gateway.read("Patient", &self.patient_id).await?))
    }
}

async fn mount_smart_server(server: &MockServer, with_token: bool) {
    let token_uri = format!("{}/token", server.uri());
    Mock::given(method("GET"))
        .and(path("/fhir/metadata"))
        .respond_with(ResponseTemplate::new(200).set_body_json(common::smart_capability(
            &format!("{}/authorize", server.uri()),
            with_token.then_some(token_uri.as_str()),
        )))
        .mount(server)
        .await;
}

fn settings() -> AuthSettings {
    AuthSettings::new()
        .with("client_id", "app")
        .with("redirect", REDIRECT)
}

// ---------------------------------------------------------------------------
// Code grant
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_code_grant_authorizes_and_signs_requests() {
    let server = MockServer::start().await;
    mount_smart_server(&server, true).await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("code=code-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(common::token_body("access-1")))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/fhir/Patient/p1"))
        .and(header("authorization", "Bearer access-1"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(common::patient("p1", "Ann", "Lee", "1970-02-03")),
        )
        .expect(1)
        .mount(&server)
        .await;

    let presenter = Arc::new(RecordingPresenter::auto());
    let coordinator = Arc::new(
        AuthCoordinator::new(common::capability_store(&server), settings())
            .with_credential_store(Arc::new(MemoryStore::new()))
            .with_presenter(presenter.clone()),
    );

    let outcome = coordinator
        .authorize(GranularityPolicy::TokenOnly, None)
        .await
        .expect("authorize");
    let params = outcome.parameters().expect("authorized");
    assert_eq!(params["access_token"], "access-1");
    assert_eq!(coordinator.strategy_kind(), Some(StrategyKind::CodeGrant));

    let authorize_url = presenter.seen().expect("login presented");
    assert_eq!(authorize_url.path(), "/authorize");
    assert_eq!(
        common::query_param(&authorize_url, "aud").as_deref(),
        Some(format!("{}/fhir/", server.uri()).as_str())
    );
    assert_eq!(
        common::query_param(&authorize_url, "code_challenge_method").as_deref(),
        Some("S256")
    );

    let signer: Arc<dyn RequestSigner> = coordinator.clone();
    let gateway = common::unsigned_gateway(&server).with_signer(signer);
    let patient = gateway.read("Patient", "p1").await.expect("signed read");
    assert_eq!(patient["id"], "p1");
}

#[tokio::test]
async fn test_stored_token_is_reused_without_new_flow() {
    let server = MockServer::start().await;
    mount_smart_server(&server, true).await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(common::token_body("access-1")))
        .expect(1)
        .mount(&server)
        .await;

    let coordinator = AuthCoordinator::new(common::capability_store(&server), settings())
        .with_credential_store(Arc::new(MemoryStore::new()))
        .with_presenter(Arc::new(RecordingPresenter::auto()));

    let first = coordinator
        .authorize(GranularityPolicy::TokenOnly, None)
        .await
        .unwrap();
    assert!(first.is_authorized());

    let second = coordinator
        .authorize(GranularityPolicy::TokenOnly, None)
        .await
        .unwrap();
    assert_eq!(second, AuthOutcome::Authorized(AuthParameters::new()));
    assert_eq!(
        coordinator.authorization_header().await.as_deref(),
        Some("Bearer access-1")
    );
}

#[tokio::test]
async fn test_external_redirect_completes_pending_session() {
    let server = MockServer::start().await;
    mount_smart_server(&server, true).await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("code=external"))
        .respond_with(ResponseTemplate::new(200).set_body_json(common::token_body("access-ext")))
        .mount(&server)
        .await;

    let presenter = Arc::new(RecordingPresenter::default());
    let coordinator = Arc::new(
        AuthCoordinator::new(common::capability_store(&server), settings())
            .with_credential_store(Arc::new(MemoryStore::new()))
            .with_presenter(presenter.clone()),
    );

    let pending = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            coordinator
                .authorize(GranularityPolicy::LaunchContext, None)
                .await
        })
    };

    let authorize_url = loop {
        if let Some(url) = presenter.seen() {
            break url;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    };
    assert!(common::query_param(&authorize_url, "scope")
        .unwrap()
        .starts_with("launch "));

    assert!(
        coordinator
            .handle_redirect(&redirect_with_code(&authorize_url, "external"))
            .await
    );

    let outcome = pending.await.unwrap().expect("authorize");
    assert_eq!(outcome.parameters().unwrap()["access_token"], "access-ext");
}

// ---------------------------------------------------------------------------
// Client credentials and native selection
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_native_selection_reads_patient_with_new_token() {
    let server = MockServer::start().await;
    mount_smart_server(&server, true).await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("grant_type=client_credentials"))
        .respond_with(ResponseTemplate::new(200).set_body_json(common::token_body("system-1")))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/fhir/Patient/p7"))
        .and(header("authorization", "Bearer system-1"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(common::patient("p7", "Bo", "Ng", "1990-01-01")),
        )
        .expect(1)
        .mount(&server)
        .await;

    let settings = settings().with("authorize_type", "client_credentials");
    let coordinator = AuthCoordinator::new(common::capability_store(&server), settings)
        .with_credential_store(Arc::new(MemoryStore::new()))
        .with_selector(Arc::new(ReadingSelector {
            patient_id: "p7".to_string(),
        }));

    let outcome = coordinator
        .authorize(GranularityPolicy::PatientSelectNative, None)
        .await
        .expect("authorize");
    let params = outcome.parameters().expect("authorized");
    assert_eq!(params["access_token"], "system-1");
    assert_eq!(params["patient"], "p7");
    assert_eq!(params["patient_resource"]["resourceType"], "Patient");
}

#[tokio::test]
async fn test_native_selection_without_selector_is_config_error() {
    let server = MockServer::start().await;
    mount_smart_server(&server, true).await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(common::token_body("system-1")))
        .mount(&server)
        .await;

    let settings = settings().with("authorize_type", "client_credentials");
    let coordinator = AuthCoordinator::new(common::capability_store(&server), settings)
        .with_credential_store(Arc::new(MemoryStore::new()));

    let err = coordinator
        .authorize(GranularityPolicy::PatientSelectNative, None)
        .await
        .expect_err("selector required");
    assert!(matches!(
        err.downcast_ref::<SmartError>(),
        Some(SmartError::Config(_))
    ));
}

// ---------------------------------------------------------------------------
// Open servers and discovery failures
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_open_server_authorizes_without_credentials() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/fhir/metadata"))
        .respond_with(ResponseTemplate::new(200).set_body_json(common::open_capability()))
        .mount(&server)
        .await;

    let coordinator = AuthCoordinator::new(common::capability_store(&server), AuthSettings::new());
    assert_eq!(coordinator.ready().await.unwrap(), StrategyKind::None);

    let outcome = coordinator
        .authorize(GranularityPolicy::TokenOnly, None)
        .await
        .unwrap();
    assert_eq!(outcome, AuthOutcome::Authorized(AuthParameters::new()));
    assert!(coordinator.authorization_header().await.is_none());
    coordinator.reset().await.expect("reset without engine");
}

#[tokio::test]
async fn test_ready_retries_after_capability_failure() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/fhir/metadata"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    mount_smart_server(&server, false).await;

    let coordinator = AuthCoordinator::new(common::capability_store(&server), settings());

    let err = coordinator.ready().await.expect_err("discovery fails");
    assert!(matches!(
        err.downcast_ref::<SmartError>(),
        Some(SmartError::CapabilityFetch(_))
    ));
    assert_eq!(coordinator.strategy_kind(), None);

    assert_eq!(coordinator.ready().await.unwrap(), StrategyKind::ImplicitGrant);
}
