/*!
Command handlers for the CLI

This module provides command handlers invoked by the CLI entrypoint:

- `capability` - Fetch and summarize the capability statement
- `authorize`  - Run an authorization flow
- `patients`   - List patients in a sorted, sectioned view
- `get`        - Signed GET of an arbitrary resource path
- `reset`      - Forget stored credentials

Every handler builds a [`ClientContext`] from the loaded configuration.
*/

use std::sync::Arc;

use crate::auth::presenter::{BrowserLoginPresenter, ConsolePatientSelector};
use crate::auth::{AuthCoordinator, AuthOutcome, GranularityPolicy, StrategyKind};
use crate::capability::CapabilityStore;
use crate::config::Config;
use crate::error::{Result, SmartError};
use crate::gateway::{RequestGateway, RequestSigner, Unsigned};

pub mod authorize;
pub mod capability;
pub mod get;
pub mod patients;
pub mod reset;

/// The library components wired together for one server.
pub struct ClientContext {
    pub config: Config,
    pub capabilities: Arc<CapabilityStore>,
    pub coordinator: Arc<AuthCoordinator>,
}

impl ClientContext {
    /// Builds the gateway, capability store, and coordinator for `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if the base URL is invalid or the HTTP client cannot
    /// be built.
    pub fn from_config(config: Config) -> Result<Self> {
        let http = config.http_client()?;
        let gateway = RequestGateway::new(http.clone(), config.base_url()?, Arc::new(Unsigned));
        let capabilities = Arc::new(CapabilityStore::new(gateway));

        let settings = config.auth_settings();
        let presenter = BrowserLoginPresenter::from_settings(&settings);
        let presenter = if config.auth.open_browser {
            presenter
        } else {
            presenter.without_browser()
        };
        let selector = ConsolePatientSelector::new(config.patient_order()?, config.patients.page_size);

        let coordinator = AuthCoordinator::new(capabilities.clone(), settings)
            .with_http(http)
            .with_credential_store(config.credential_store())
            .with_presenter(Arc::new(presenter))
            .with_selector(Arc::new(selector));

        Ok(Self {
            config,
            capabilities,
            coordinator: Arc::new(coordinator),
        })
    }

    /// A gateway signed with the coordinator's current credential.
    pub fn signed_gateway(&self) -> RequestGateway {
        let signer: Arc<dyn RequestSigner> = self.coordinator.clone();
        self.capabilities.gateway().with_signer(signer)
    }

    /// Authorizes with [`GranularityPolicy::TokenOnly`] unless the server is
    /// open or a credential is already held.
    pub async fn ensure_authorized(&self) -> Result<()> {
        let kind = self.coordinator.ready().await?;
        if kind == StrategyKind::None || self.coordinator.authorization_header().await.is_some() {
            return Ok(());
        }

        tracing::info!(%kind, "no stored credential; authorizing");
        match self
            .coordinator
            .authorize(GranularityPolicy::TokenOnly, None)
            .await?
        {
            AuthOutcome::Authorized(_) => Ok(()),
            AuthOutcome::Aborted => {
                Err(SmartError::OAuth("authorization was aborted".to_string()).into())
            }
        }
    }
}
