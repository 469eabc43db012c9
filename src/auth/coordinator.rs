//! Authorization coordination
//!
//! [`AuthCoordinator`] owns the authorization strategy for one FHIR server.
//! It derives the strategy from the capability document (or explicit
//! settings), keeps at most one authorization session in flight, routes
//! external redirects to the engine, and optionally runs native patient
//! selection before reporting an [`AuthOutcome`].
//!
//! # Sessions
//!
//! Every call to [`AuthCoordinator::authorize`] opens a session with a fresh
//! id. Opening a session completes the previous one with
//! [`AuthOutcome::Aborted`]. Each asynchronous step re-checks the id before
//! acting, and completion takes the session's sender out of the shared
//! state, so a session resolves exactly once and results for superseded
//! sessions are dropped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use serde_json::Value;
use tokio::sync::{oneshot, Mutex, OnceCell};
use url::Url;

use crate::capability::CapabilityStore;
use crate::error::{Result, SmartError};
use crate::gateway::{BearerToken, RequestSigner, Unsigned};

use super::engine::{AuthParameters, AuthorizeRequest, AuthorizeStep, SharedEngine};
use super::oauth2::{OAuth2Config, OAuth2Engine};
use super::presenter::{LoginPresenter, PatientSelector, PresentationContext};
use super::settings::{derive_strategy, effective_scope, AuthSettings, GranularityPolicy, StrategyKind};
use super::token_store::{CredentialStore, MemoryStore};

/// How an authorization session ended.
#[derive(Debug, Clone, PartialEq)]
pub enum AuthOutcome {
    /// The flow succeeded. Parameters may be empty (open server, reused
    /// credential) and carry `patient`/`patient_resource` after native
    /// selection.
    Authorized(AuthParameters),

    /// The session was superseded, aborted, or the user declined.
    Aborted,
}

impl AuthOutcome {
    pub fn is_authorized(&self) -> bool {
        matches!(self, AuthOutcome::Authorized(_))
    }

    pub fn parameters(&self) -> Option<&AuthParameters> {
        match self {
            AuthOutcome::Authorized(params) => Some(params),
            AuthOutcome::Aborted => None,
        }
    }
}

/// The resolved strategy. Fixed once installed.
#[derive(Debug, Clone)]
struct Strategy {
    kind: StrategyKind,
    engine: Option<SharedEngine>,
}

struct Session {
    id: u64,
    policy: GranularityPolicy,
    tx: oneshot::Sender<Result<AuthOutcome>>,
}

/// Builds the engine for `kind`.
///
/// Returns `Ok(None)` for [`StrategyKind::None`].
///
/// # Errors
///
/// Returns [`SmartError::NoAuthorizationMethod`] when `settings` lack a URI
/// the grant type requires.
pub fn build_engine(
    kind: StrategyKind,
    settings: &AuthSettings,
    http: reqwest::Client,
    store: Arc<dyn CredentialStore>,
    store_key: &str,
) -> Result<Option<SharedEngine>> {
    if kind == StrategyKind::None {
        return Ok(None);
    }
    let config = OAuth2Config::from_settings(kind, settings, store_key)?;
    tracing::debug!(%kind, client_id = %config.client_id, "OAuth2 engine built");
    Ok(Some(Arc::new(OAuth2Engine::new(http, config, store))))
}

/// Coordinates authorization against one server.
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use smartfhir::auth::{AuthCoordinator, AuthOutcome, AuthSettings, GranularityPolicy};
/// use smartfhir::capability::CapabilityStore;
/// use smartfhir::gateway::{RequestGateway, Unsigned};
///
/// # async fn example() -> smartfhir::error::Result<()> {
/// let base = url::Url::parse("https://fhir.example.com/r4/")?;
/// let gateway = RequestGateway::new(reqwest::Client::new(), base, Arc::new(Unsigned));
/// let coordinator = AuthCoordinator::new(
///     Arc::new(CapabilityStore::new(gateway)),
///     AuthSettings::new().with("client_id", "my_app"),
/// );
///
/// match coordinator.authorize(GranularityPolicy::TokenOnly, None).await? {
///     AuthOutcome::Authorized(params) => println!("authorized: {params:?}"),
///     AuthOutcome::Aborted => println!("aborted"),
/// }
/// # Ok(())
/// # }
/// ```
pub struct AuthCoordinator {
    capabilities: Arc<CapabilityStore>,
    settings: AuthSettings,
    http: reqwest::Client,
    store: Arc<dyn CredentialStore>,
    strategy: OnceCell<Strategy>,
    session: Mutex<Option<Session>>,
    next_session_id: AtomicU64,
    presenter: Option<Arc<dyn LoginPresenter>>,
    selector: Option<Arc<dyn PatientSelector>>,
    context: StdMutex<Option<PresentationContext>>,
}

impl std::fmt::Debug for AuthCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthCoordinator")
            .field("base_url", &self.capabilities.gateway().base_url().as_str())
            .field("strategy", &self.strategy.get().map(|s| s.kind))
            .field("has_presenter", &self.presenter.is_some())
            .field("has_selector", &self.selector.is_some())
            .finish()
    }
}

impl AuthCoordinator {
    /// Creates a coordinator with an in-memory credential store and no
    /// collaborators.
    pub fn new(capabilities: Arc<CapabilityStore>, settings: AuthSettings) -> Self {
        Self {
            capabilities,
            settings,
            http: reqwest::Client::new(),
            store: Arc::new(MemoryStore::new()),
            strategy: OnceCell::new(),
            session: Mutex::new(None),
            next_session_id: AtomicU64::new(0),
            presenter: None,
            selector: None,
            context: StdMutex::new(None),
        }
    }

    pub fn with_http(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }

    pub fn with_credential_store(mut self, store: Arc<dyn CredentialStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_presenter(mut self, presenter: Arc<dyn LoginPresenter>) -> Self {
        self.presenter = Some(presenter);
        self
    }

    pub fn with_selector(mut self, selector: Arc<dyn PatientSelector>) -> Self {
        self.selector = Some(selector);
        self
    }

    /// Installs a strategy up front, bypassing capability discovery.
    pub fn with_strategy(mut self, kind: StrategyKind, engine: Option<SharedEngine>) -> Self {
        self.strategy = OnceCell::new_with(Some(Strategy { kind, engine }));
        self
    }

    pub fn settings(&self) -> &AuthSettings {
        &self.settings
    }

    pub fn capabilities(&self) -> &Arc<CapabilityStore> {
        &self.capabilities
    }

    /// The installed strategy kind, if `ready` has succeeded.
    pub fn strategy_kind(&self) -> Option<StrategyKind> {
        self.strategy.get().map(|s| s.kind)
    }

    fn engine(&self) -> Option<SharedEngine> {
        self.strategy.get().and_then(|s| s.engine.clone())
    }

    /// Key under which this server's tokens are stored.
    fn store_key(&self) -> String {
        let base = self.capabilities.gateway().base_url();
        match self.settings.client_id() {
            Some(client_id) => format!("{}|{}", base, client_id),
            None => base.to_string(),
        }
    }

    fn audience(&self) -> String {
        self.settings
            .audience()
            .map(str::to_string)
            .unwrap_or_else(|| self.capabilities.gateway().base_url().to_string())
    }

    // -----------------------------------------------------------------------
    // Readiness
    // -----------------------------------------------------------------------

    /// Resolves the strategy, fetching the capability document if needed.
    ///
    /// Returns immediately once a strategy is installed. A failed attempt
    /// installs nothing, so the next call retries.
    pub async fn ready(&self) -> Result<StrategyKind> {
        let strategy = self
            .strategy
            .get_or_try_init(|| self.resolve_strategy())
            .await?;
        Ok(strategy.kind)
    }

    async fn resolve_strategy(&self) -> Result<Strategy> {
        let endpoints = self.capabilities.security_endpoints().await?;
        let kind = derive_strategy(&endpoints, &self.settings)?;
        let merged = self.settings.merged_with(&endpoints);
        let engine = build_engine(kind, &merged, self.http.clone(), self.store.clone(), &self.store_key())?;
        tracing::info!(%kind, "authorization strategy resolved");
        Ok(Strategy { kind, engine })
    }

    // -----------------------------------------------------------------------
    // Sessions
    // -----------------------------------------------------------------------

    async fn start_session(&self, policy: GranularityPolicy) -> (u64, oneshot::Receiver<Result<AuthOutcome>>) {
        let id = self.next_session_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = oneshot::channel();
        let previous = self.session.lock().await.replace(Session { id, policy, tx });
        if let Some(previous) = previous {
            tracing::debug!(superseded = previous.id, session = id, "authorization superseded");
            let _ = previous.tx.send(Ok(AuthOutcome::Aborted));
        }
        (id, rx)
    }

    async fn is_current(&self, id: u64) -> bool {
        self.session.lock().await.as_ref().is_some_and(|s| s.id == id)
    }

    /// Completes session `id`. A no-op when `id` is no longer current.
    async fn complete(&self, id: u64, result: Result<AuthOutcome>) {
        let mut guard = self.session.lock().await;
        match guard.take() {
            Some(session) if session.id == id => {
                tracing::debug!(session = id, ok = result.is_ok(), "authorization session completed");
                let _ = session.tx.send(result);
            }
            other => {
                *guard = other;
                tracing::debug!(session = id, "discarding result of superseded session");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Operations
    // -----------------------------------------------------------------------

    /// Runs one authorization session.
    ///
    /// Resolves when the session completes: directly (open server, reused
    /// credential, client credentials), after a redirect delivered through
    /// the presenter or [`handle_redirect`](Self::handle_redirect), or with
    /// [`AuthOutcome::Aborted`] when superseded or aborted.
    ///
    /// # Errors
    ///
    /// Surfaces `ready` failures (including
    /// [`SmartError::NoAuthorizationMethod`]) and engine errors unchanged.
    pub async fn authorize(
        &self,
        policy: GranularityPolicy,
        context: Option<PresentationContext>,
    ) -> Result<AuthOutcome> {
        let (id, mut rx) = self.start_session(policy).await;
        *self.context.lock().unwrap_or_else(PoisonError::into_inner) = context.clone();

        // Completion may arrive while the presenter is still waiting; the
        // drive future (and any listener it holds) is dropped then.
        let driven = tokio::select! {
            outcome = &mut rx => return outcome.unwrap_or(Ok(AuthOutcome::Aborted)),
            driven = self.drive(id, policy, context) => driven,
        };

        match driven {
            Ok(Some(outcome)) => self.complete(id, Ok(outcome)).await,
            Ok(None) => {}
            Err(e) => self.complete(id, Err(e)).await,
        }

        rx.await.unwrap_or(Ok(AuthOutcome::Aborted))
    }

    /// Drives a session until it completes (`Some`) or waits on a redirect
    /// (`None`).
    async fn drive(
        &self,
        id: u64,
        policy: GranularityPolicy,
        context: Option<PresentationContext>,
    ) -> Result<Option<AuthOutcome>> {
        let scope = effective_scope(self.settings.scope(), policy);

        let kind = self.ready().await?;
        if !self.is_current(id).await {
            return Ok(None);
        }

        let Some(engine) = self.engine() else {
            tracing::debug!(%kind, "no engine; authorization not required");
            return Ok(Some(AuthOutcome::Authorized(AuthParameters::new())));
        };

        if engine.has_unexpired_token().await {
            if policy == GranularityPolicy::PatientSelectWeb {
                tracing::debug!("discarding stored credential for web patient selection");
                engine.forget_tokens().await?;
            } else {
                tracing::info!("reusing stored credential");
                return self.finish(id, policy, AuthParameters::new()).await.map(Some);
            }
        }

        let request = AuthorizeRequest {
            scope,
            audience: Some(self.audience()),
            embedded: self.settings.embedded(),
        };

        match engine.begin(&request).await? {
            AuthorizeStep::Completed(params) => self.finish(id, policy, params).await.map(Some),
            AuthorizeStep::AwaitRedirect(url) => {
                if !self.is_current(id).await {
                    return Ok(None);
                }
                if self.settings.verbose() {
                    tracing::info!(%url, "authorize URL");
                }
                let Some(presenter) = self.presenter.as_ref() else {
                    tracing::info!(%url, "awaiting authorization redirect");
                    return Ok(None);
                };
                if let Some(redirect) = presenter
                    .present_login(&url, request.embedded, context.as_ref())
                    .await?
                {
                    self.redirect_for(id, &redirect).await;
                }
                Ok(None)
            }
        }
    }

    /// Applies post-authorization steps for `policy`.
    async fn finish(&self, id: u64, policy: GranularityPolicy, params: AuthParameters) -> Result<AuthOutcome> {
        if policy != GranularityPolicy::PatientSelectNative {
            return Ok(AuthOutcome::Authorized(params));
        }

        let selector = self.selector.as_ref().ok_or_else(|| {
            SmartError::Config("native patient selection requires a patient selector".to_string())
        })?;

        let token = match params.get("access_token").and_then(Value::as_str) {
            Some(token) => Some(token.to_string()),
            None => match self.engine() {
                Some(engine) => engine.access_token().await,
                None => None,
            },
        };
        let signer: Arc<dyn RequestSigner> = match token {
            Some(token) => Arc::new(BearerToken(token)),
            None => Arc::new(Unsigned),
        };
        let gateway = self.capabilities.gateway().with_signer(signer);

        let chosen = selector.select_patient(gateway, &params).await?;
        if !self.is_current(id).await {
            return Ok(AuthOutcome::Aborted);
        }

        match chosen {
            None => {
                tracing::info!("patient selection declined");
                Ok(AuthOutcome::Aborted)
            }
            Some(patient) => {
                let mut params = params;
                if let Some(patient_id) = patient.get("id").and_then(Value::as_str) {
                    tracing::info!(patient = patient_id, "patient selected");
                    params.insert("patient".to_string(), Value::String(patient_id.to_string()));
                }
                params.insert("patient_resource".to_string(), patient);
                Ok(AuthOutcome::Authorized(params))
            }
        }
    }

    /// Feeds an external redirect to the active session.
    ///
    /// Returns `false` when there is no strategy, no engine, or no active
    /// session; `true` once the redirect has been handed to the engine.
    /// The session completes with the engine's result.
    pub async fn handle_redirect(&self, redirect: &Url) -> bool {
        let Some(id) = self.session.lock().await.as_ref().map(|s| s.id) else {
            return false;
        };
        self.redirect_for(id, redirect).await
    }

    async fn redirect_for(&self, id: u64, redirect: &Url) -> bool {
        let Some(engine) = self.engine() else {
            return false;
        };
        let policy = match self.session.lock().await.as_ref() {
            Some(session) if session.id == id => session.policy,
            _ => return false,
        };

        let result = match engine.handle_redirect(redirect).await {
            Ok(params) => self.finish(id, policy, params).await,
            Err(e) => {
                tracing::warn!(error = %e, "authorization redirect failed");
                Err(e)
            }
        };
        self.complete(id, result).await;
        true
    }

    /// Completes the active session with [`AuthOutcome::Aborted`]. Stored
    /// credentials are kept.
    pub async fn abort(&self) {
        if let Some(session) = self.session.lock().await.take() {
            tracing::info!(session = session.id, "authorization aborted");
            let _ = session.tx.send(Ok(AuthOutcome::Aborted));
        }
    }

    /// Aborts, forgets stored credentials, and drops the presentation context.
    ///
    /// # Errors
    ///
    /// Returns [`SmartError::NotReady`] when no strategy is installed yet,
    /// since the credential key depends on it.
    pub async fn reset(&self) -> Result<()> {
        if self.strategy.get().is_none() {
            return Err(SmartError::NotReady("call ready() before reset()".to_string()).into());
        }
        self.abort().await;
        if let Some(engine) = self.engine() {
            engine.forget_tokens().await?;
        }
        *self.context.lock().unwrap_or_else(PoisonError::into_inner) = None;
        tracing::info!("authorization state reset");
        Ok(())
    }

    /// The presentation context of the latest `authorize` call.
    pub fn presentation_context(&self) -> Option<PresentationContext> {
        self.context.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[async_trait::async_trait]
impl RequestSigner for AuthCoordinator {
    async fn authorization_header(&self) -> Option<String> {
        let token = self.engine()?.access_token().await?;
        Some(format!("Bearer {token}"))
    }
}
