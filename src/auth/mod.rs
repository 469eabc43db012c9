//! SMART on FHIR authorization
//!
//! # Architecture
//!
//! ```text
//! AuthCoordinator
//!   -> CapabilityStore::security_endpoints()   (discovery)
//!   -> settings::derive_strategy()            (pure)
//!   -> coordinator::build_engine()            (OAuth2Engine or nothing)
//!   -> OAuthEngine::begin()
//!        Completed(params)                     client credentials, refresh
//!        AwaitRedirect(url) -> LoginPresenter -> handle_redirect()
//!   -> PatientSelector                         (native selection only)
//! ```
//!
//! Tokens are persisted by a [`token_store::CredentialStore`]; the
//! coordinator doubles as the [`crate::gateway::RequestSigner`] for
//! authenticated requests.

pub mod coordinator;
pub mod engine;
pub mod oauth2;
pub mod pkce;
pub mod presenter;
pub mod settings;
pub mod token_store;

pub use coordinator::{build_engine, AuthCoordinator, AuthOutcome};
pub use engine::{AuthParameters, AuthorizeRequest, AuthorizeStep, OAuthEngine, SharedEngine};
pub use oauth2::{OAuth2Config, OAuth2Engine};
pub use presenter::{
    BrowserLoginPresenter, ConsolePatientSelector, LoginPresenter, PatientSelector,
    PresentationContext,
};
pub use settings::{derive_strategy, effective_scope, AuthSettings, GranularityPolicy, StrategyKind};
pub use token_store::{CredentialStore, KeyringStore, MemoryStore, OAuthToken};
