//! reqwest-based OAuth2 engine
//!
//! [`OAuth2Engine`] implements [`OAuthEngine`] for the three grant types a
//! SMART on FHIR server may advertise:
//!
//! - **Code grant**: authorization code flow with PKCE (RFC 7636). `begin`
//!   returns the authorize URL; `handle_redirect` validates `state` and
//!   exchanges the `code` at the token endpoint. An expired token with a
//!   refresh token is renewed instead of starting a new browser flow.
//! - **Implicit grant**: `begin` returns the authorize URL with
//!   `response_type=token`; `handle_redirect` reads the token from the
//!   redirect fragment.
//! - **Client credentials**: `begin` posts directly to the token endpoint and
//!   completes without user interaction.
//!
//! Tokens are persisted through a [`CredentialStore`].

use std::collections::HashMap;
use std::sync::Arc;

use reqwest::header::ACCEPT;
use tokio::sync::Mutex;
use url::Url;

use crate::error::{Result, SmartError};

use super::engine::{AuthParameters, AuthorizeRequest, AuthorizeStep, OAuthEngine};
use super::pkce;
use super::settings::{AuthSettings, StrategyKind};
use super::token_store::{CredentialStore, OAuthToken};

// ---------------------------------------------------------------------------
// OAuth2Config
// ---------------------------------------------------------------------------

/// Validated configuration for one engine.
#[derive(Debug, Clone)]
pub struct OAuth2Config {
    pub kind: StrategyKind,
    pub client_id: String,
    pub client_secret: Option<String>,
    pub authorize_uri: Option<Url>,
    pub token_uri: Option<Url>,
    pub redirect_uri: Option<String>,
    /// Key under which tokens are persisted.
    pub store_key: String,
}

impl OAuth2Config {
    /// Builds a configuration for `kind` from merged settings.
    ///
    /// # Errors
    ///
    /// Returns [`SmartError::NoAuthorizationMethod`] when `kind` is
    /// [`StrategyKind::None`] or a URI the grant type requires is missing,
    /// and [`SmartError::Config`] when `client_id` or `redirect` is missing
    /// or a URI does not parse.
    pub fn from_settings(kind: StrategyKind, settings: &AuthSettings, store_key: &str) -> Result<Self> {
        let needs_authorize = matches!(kind, StrategyKind::CodeGrant | StrategyKind::ImplicitGrant);
        let needs_token = matches!(kind, StrategyKind::CodeGrant | StrategyKind::ClientCredentials);

        if kind == StrategyKind::None {
            return Err(SmartError::NoAuthorizationMethod(
                "strategy 'none' does not use an OAuth2 engine".to_string(),
            )
            .into());
        }
        if needs_authorize && settings.authorize_uri().is_none() {
            return Err(SmartError::NoAuthorizationMethod(format!(
                "{kind} requires an authorize_uri"
            ))
            .into());
        }
        if needs_token && settings.token_uri().is_none() {
            return Err(
                SmartError::NoAuthorizationMethod(format!("{kind} requires a token_uri")).into(),
            );
        }

        let client_id = settings
            .client_id()
            .ok_or_else(|| SmartError::Config("client_id is required for OAuth2".to_string()))?
            .to_string();

        let redirect_uri = settings.redirect().map(str::to_string);
        if needs_authorize && redirect_uri.is_none() {
            return Err(SmartError::Config(format!("{kind} requires a redirect URI")).into());
        }

        Ok(Self {
            kind,
            client_id,
            client_secret: settings.client_secret().map(str::to_string),
            authorize_uri: parse_optional_url(settings.authorize_uri(), "authorize_uri")?,
            token_uri: parse_optional_url(settings.token_uri(), "token_uri")?,
            redirect_uri,
            store_key: store_key.to_string(),
        })
    }
}

fn parse_optional_url(value: Option<&str>, key: &str) -> Result<Option<Url>> {
    value
        .map(|v| Url::parse(v).map_err(|e| SmartError::Config(format!("invalid {key} '{v}': {e}")).into()))
        .transpose()
}

// ---------------------------------------------------------------------------
// Token endpoint response (raw deserialization)
// ---------------------------------------------------------------------------

#[derive(Debug, serde::Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "bearer")]
    token_type: String,
    #[serde(default)]
    expires_in: Option<u64>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    scope: Option<String>,
    #[serde(flatten)]
    extra: serde_json::Map<String, serde_json::Value>,
}

fn bearer() -> String {
    "Bearer".to_string()
}

impl TokenResponse {
    fn into_oauth_token(self) -> OAuthToken {
        OAuthToken {
            access_token: self.access_token,
            token_type: self.token_type,
            expires_at: self.expires_in.map(expires_at_from_now),
            refresh_token: self.refresh_token,
            scope: self.scope,
            extra: self.extra,
        }
    }
}

fn expires_at_from_now(secs: u64) -> chrono::DateTime<chrono::Utc> {
    chrono::Utc::now() + chrono::Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX / 1000))
}

/// Error body defined by RFC 6749 section 5.2.
#[derive(Debug, serde::Deserialize)]
struct TokenErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

// ---------------------------------------------------------------------------
// OAuth2Engine
// ---------------------------------------------------------------------------

/// State bound to the authorize URL handed out by `begin`.
#[derive(Debug, Clone)]
struct PendingAuthorization {
    state: String,
    code_verifier: Option<String>,
    redirect_uri: String,
}

/// OAuth2 client for one server.
#[derive(Debug)]
pub struct OAuth2Engine {
    http: reqwest::Client,
    config: OAuth2Config,
    store: Arc<dyn CredentialStore>,
    pending: Mutex<Option<PendingAuthorization>>,
}

impl OAuth2Engine {
    pub fn new(http: reqwest::Client, config: OAuth2Config, store: Arc<dyn CredentialStore>) -> Self {
        Self {
            http,
            config,
            store,
            pending: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &OAuth2Config {
        &self.config
    }

    /// Builds the authorize URL with all required query parameters.
    fn build_authorization_url(
        &self,
        request: &AuthorizeRequest,
        pending: &PendingAuthorization,
        code_challenge: Option<&str>,
    ) -> Result<Url> {
        let mut url = self
            .config
            .authorize_uri
            .clone()
            .ok_or_else(|| SmartError::NoAuthorizationMethod("authorize_uri missing".to_string()))?;

        let response_type = match self.config.kind {
            StrategyKind::ImplicitGrant => "token",
            _ => "code",
        };

        {
            let mut query = url.query_pairs_mut();
            query.append_pair("response_type", response_type);
            query.append_pair("client_id", &self.config.client_id);
            query.append_pair("redirect_uri", &pending.redirect_uri);
            query.append_pair("scope", &request.scope);
            query.append_pair("state", &pending.state);
            if let Some(ref aud) = request.audience {
                query.append_pair("aud", aud);
            }
            if let Some(challenge) = code_challenge {
                query.append_pair("code_challenge", challenge);
                query.append_pair("code_challenge_method", "S256");
            }
        }

        Ok(url)
    }

    async fn begin_redirect_flow(&self, request: &AuthorizeRequest) -> Result<AuthorizeStep> {
        let redirect_uri = self
            .config
            .redirect_uri
            .clone()
            .ok_or_else(|| SmartError::Config("redirect URI missing".to_string()))?;

        let challenge = (self.config.kind == StrategyKind::CodeGrant).then(pkce::generate);
        let pending = PendingAuthorization {
            state: pkce::generate_state(),
            code_verifier: challenge.as_ref().map(|c| c.verifier.clone()),
            redirect_uri,
        };

        let url = self.build_authorization_url(
            request,
            &pending,
            challenge.as_ref().map(|c| c.challenge.as_str()),
        )?;

        *self.pending.lock().await = Some(pending);
        tracing::info!(kind = %self.config.kind, "authorization flow started");
        Ok(AuthorizeStep::AwaitRedirect(url))
    }

    /// Tries to renew an expired token. Returns `None` when there is nothing
    /// to refresh or the refresh failed.
    async fn try_refresh(&self) -> Option<OAuthToken> {
        let stored = self.store.load(&self.config.store_key).ok().flatten()?;
        if !stored.is_expired() {
            return None;
        }
        let refresh_token = stored.refresh_token.clone()?;

        let params = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token.as_str()),
            ("client_id", self.config.client_id.as_str()),
        ];
        match self.post_token(&params).await {
            Ok(mut token) => {
                if token.refresh_token.is_none() {
                    token.refresh_token = Some(refresh_token);
                }
                tracing::info!("access token refreshed");
                Some(token)
            }
            Err(e) => {
                tracing::warn!(error = %e, "token refresh failed; starting a new authorization");
                None
            }
        }
    }

    /// POSTs a form to the token endpoint and parses the token response.
    async fn post_token(&self, params: &[(&str, &str)]) -> Result<OAuthToken> {
        let token_uri = self
            .config
            .token_uri
            .clone()
            .ok_or_else(|| SmartError::NoAuthorizationMethod("token_uri missing".to_string()))?;

        let mut request = self
            .http
            .post(token_uri)
            .header(ACCEPT, "application/json")
            .form(params);
        if let Some(ref secret) = self.config.client_secret {
            request = request.basic_auth(&self.config.client_id, Some(secret));
        }

        let resp = request
            .send()
            .await
            .map_err(|e| SmartError::OAuth(format!("token request failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let detail = match serde_json::from_str::<TokenErrorResponse>(&body) {
                Ok(err) => match err.error_description {
                    Some(description) => format!("{}: {}", err.error, description),
                    None => err.error,
                },
                Err(_) => body,
            };
            return Err(SmartError::OAuth(format!("token endpoint returned {status}: {detail}")).into());
        }

        let raw: TokenResponse = resp
            .json()
            .await
            .map_err(|e| SmartError::OAuth(format!("failed to parse token response: {e}")))?;

        Ok(raw.into_oauth_token())
    }

    async fn exchange_code(&self, code: &str, pending: &PendingAuthorization) -> Result<OAuthToken> {
        let mut params = vec![
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", pending.redirect_uri.as_str()),
            ("client_id", self.config.client_id.as_str()),
        ];
        if let Some(ref verifier) = pending.code_verifier {
            params.push(("code_verifier", verifier.as_str()));
        }
        self.post_token(&params).await
    }

    fn save(&self, token: &OAuthToken) -> Result<AuthParameters> {
        self.store.save(&self.config.store_key, token)?;
        Ok(token.to_parameters())
    }

    fn stored_token(&self) -> Option<OAuthToken> {
        match self.store.load(&self.config.store_key) {
            Ok(token) => token,
            Err(e) => {
                tracing::warn!(error = %e, "failed to load stored token");
                None
            }
        }
    }
}

#[async_trait::async_trait]
impl OAuthEngine for OAuth2Engine {
    fn kind(&self) -> StrategyKind {
        self.config.kind
    }

    async fn begin(&self, request: &AuthorizeRequest) -> Result<AuthorizeStep> {
        match self.config.kind {
            StrategyKind::ClientCredentials => {
                let params = [
                    ("grant_type", "client_credentials"),
                    ("scope", request.scope.as_str()),
                    ("client_id", self.config.client_id.as_str()),
                ];
                let token = self.post_token(&params).await?;
                tracing::info!("client credentials token acquired");
                Ok(AuthorizeStep::Completed(self.save(&token)?))
            }
            StrategyKind::CodeGrant => {
                if let Some(token) = self.try_refresh().await {
                    return Ok(AuthorizeStep::Completed(self.save(&token)?));
                }
                self.begin_redirect_flow(request).await
            }
            StrategyKind::ImplicitGrant => self.begin_redirect_flow(request).await,
            StrategyKind::None => Err(SmartError::NoAuthorizationMethod(
                "strategy 'none' cannot authorize".to_string(),
            )
            .into()),
        }
    }

    async fn handle_redirect(&self, redirect: &Url) -> Result<AuthParameters> {
        let params = redirect_parameters(redirect);

        // A redirect whose state does not match leaves the pending flow intact.
        let pending = {
            let mut slot = self.pending.lock().await;
            let expected = slot
                .as_ref()
                .map(|p| p.state.as_str())
                .ok_or_else(|| SmartError::OAuth("no authorization in progress".to_string()))?;
            if params.get("state").map(String::as_str) != Some(expected) {
                return Err(SmartError::OAuth("state mismatch in OAuth redirect".to_string()).into());
            }
            slot.take()
                .ok_or_else(|| SmartError::OAuth("no authorization in progress".to_string()))?
        };

        if let Some(error) = params.get("error") {
            let detail = params
                .get("error_description")
                .map(|d| format!("{error}: {d}"))
                .unwrap_or_else(|| error.clone());
            return Err(SmartError::OAuth(format!("authorization denied: {detail}")).into());
        }

        let token = match self.config.kind {
            StrategyKind::ImplicitGrant => token_from_redirect(params)?,
            _ => {
                let code = params.get("code").ok_or_else(|| {
                    SmartError::OAuth("authorization code missing from redirect".to_string())
                })?;
                self.exchange_code(code, &pending).await?
            }
        };

        tracing::info!(kind = %self.config.kind, "authorization completed");
        self.save(&token)
    }

    async fn has_unexpired_token(&self) -> bool {
        self.stored_token().is_some_and(|t| !t.is_expired())
    }

    async fn access_token(&self) -> Option<String> {
        self.stored_token()
            .filter(|t| !t.is_expired())
            .map(|t| t.access_token)
    }

    async fn forget_tokens(&self) -> Result<()> {
        *self.pending.lock().await = None;
        self.store.delete(&self.config.store_key)
    }
}

// ---------------------------------------------------------------------------
// Utility functions
// ---------------------------------------------------------------------------

/// Collects query and fragment parameters of a redirect URL. Fragment values
/// win over query values with the same name.
fn redirect_parameters(url: &Url) -> HashMap<String, String> {
    let mut params: HashMap<String, String> = url.query_pairs().into_owned().collect();
    if let Some(fragment) = url.fragment() {
        params.extend(url::form_urlencoded::parse(fragment.as_bytes()).into_owned());
    }
    params
}

/// Builds a token from implicit-grant redirect parameters.
fn token_from_redirect(mut params: HashMap<String, String>) -> Result<OAuthToken> {
    let access_token = params
        .remove("access_token")
        .ok_or_else(|| SmartError::OAuth("access_token missing from redirect".to_string()))?;
    params.remove("state");

    let token_type = params.remove("token_type").unwrap_or_else(bearer);
    let expires_at = params
        .remove("expires_in")
        .and_then(|v| v.parse::<u64>().ok())
        .map(expires_at_from_now);
    let scope = params.remove("scope");

    Ok(OAuthToken {
        access_token,
        token_type,
        expires_at,
        refresh_token: None,
        scope,
        extra: params
            .into_iter()
            .map(|(k, v)| (k, serde_json::Value::String(v)))
            .collect(),
    })
}
