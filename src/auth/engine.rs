//! The OAuth2 engine seam
//!
//! The coordinator does not speak OAuth2 itself. It drives an
//! [`OAuthEngine`], which owns token acquisition, refresh, and storage for
//! one server. [`super::oauth2::OAuth2Engine`] is the shipped
//! implementation; tests substitute their own.

use std::sync::Arc;

use url::Url;

use crate::error::Result;

use super::settings::StrategyKind;

/// Parameters produced by a completed flow: the token response fields plus
/// any launch context or selection results.
pub type AuthParameters = serde_json::Map<String, serde_json::Value>;

/// Everything the engine needs to begin one authorization flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizeRequest {
    /// Space-separated scope, already adjusted for the granularity policy.
    pub scope: String,

    /// Sent as the `aud` parameter: the FHIR server the token is for.
    pub audience: Option<String>,

    /// Whether the login surface should be embedded in the host application.
    pub embedded: bool,
}

/// The first step of a flow.
#[derive(Debug, Clone, PartialEq)]
pub enum AuthorizeStep {
    /// The flow finished without user interaction (e.g. client credentials).
    Completed(AuthParameters),

    /// The user must visit this URL; completion arrives through a redirect.
    AwaitRedirect(Url),
}

/// A generic OAuth2 client for one server.
#[async_trait::async_trait]
pub trait OAuthEngine: Send + Sync + std::fmt::Debug {
    /// The grant type this engine runs.
    fn kind(&self) -> StrategyKind;

    /// Begins a flow.
    async fn begin(&self, request: &AuthorizeRequest) -> Result<AuthorizeStep>;

    /// Completes a flow from the redirect URL the authorization server sent
    /// the user agent to.
    async fn handle_redirect(&self, redirect: &Url) -> Result<AuthParameters>;

    /// Whether a stored, unexpired access token exists.
    async fn has_unexpired_token(&self) -> bool;

    /// The current access token, if any and unexpired.
    async fn access_token(&self) -> Option<String>;

    /// Discards stored credentials and any pending flow state.
    async fn forget_tokens(&self) -> Result<()>;
}

/// Shared handle to an engine.
pub type SharedEngine = Arc<dyn OAuthEngine>;
