//! Configuration management for smartfhir
//!
//! This module handles loading, parsing, validating, and managing
//! configuration from files, environment variables, and CLI overrides.

use crate::auth::settings::{parse_authorize_type, AuthSettings};
use crate::auth::token_store::{CredentialStore, KeyringStore, MemoryStore};
use crate::error::{Result, SmartError};
use crate::patients::PatientListOrder;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// Main configuration structure for smartfhir
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// FHIR server connection settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Authorization settings
    #[serde(default)]
    pub auth: AuthConfig,

    /// Patient listing settings
    #[serde(default)]
    pub patients: PatientsConfig,
}

/// FHIR server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Base URL of the FHIR REST endpoint
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Per-request timeout (seconds)
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
}

fn default_base_url() -> String {
    "http://localhost:8080/fhir/".to_string()
}

fn default_timeout() -> u64 {
    30
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            timeout_seconds: default_timeout(),
        }
    }
}

/// Where OAuth tokens are kept between runs
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum CredentialStoreKind {
    /// Tokens live only for the current process
    Memory,
    /// Tokens are stored in the OS keyring
    #[default]
    Keyring,
}

/// Authorization configuration
///
/// Endpoint URIs discovered from the server's capability statement take
/// precedence over the ones configured here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub client_id: Option<String>,

    #[serde(default)]
    pub client_secret: Option<String>,

    /// Redirect URI registered with the authorization server
    #[serde(default)]
    pub redirect: Option<String>,

    #[serde(default)]
    pub redirect_uris: Vec<String>,

    /// Base scope; granularity prefixes are added per authorization
    #[serde(default)]
    pub scope: Option<String>,

    #[serde(default)]
    pub authorize_uri: Option<String>,

    #[serde(default)]
    pub token_uri: Option<String>,

    #[serde(default)]
    pub registration_uri: Option<String>,

    /// Explicit grant type: none, implicit, authorization_code, client_credentials
    #[serde(default)]
    pub authorize_type: Option<String>,

    #[serde(default)]
    pub title: Option<String>,

    #[serde(default)]
    pub verbose: bool,

    /// Prefer an embedded login surface over the system browser
    #[serde(default)]
    pub embedded: bool,

    /// `aud` parameter; defaults to the server base URL
    #[serde(default)]
    pub audience: Option<String>,

    #[serde(default)]
    pub credential_store: CredentialStoreKind,

    /// Loopback port used when no redirect URI is configured
    #[serde(default = "default_redirect_port")]
    pub redirect_port: u16,

    /// Launch the system browser for interactive logins
    #[serde(default = "default_open_browser")]
    pub open_browser: bool,
}

fn default_redirect_port() -> u16 {
    8765
}

fn default_open_browser() -> bool {
    true
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            client_id: None,
            client_secret: None,
            redirect: None,
            redirect_uris: Vec::new(),
            scope: None,
            authorize_uri: None,
            token_uri: None,
            registration_uri: None,
            authorize_type: None,
            title: None,
            verbose: false,
            embedded: false,
            audience: None,
            credential_store: CredentialStoreKind::default(),
            redirect_port: default_redirect_port(),
            open_browser: default_open_browser(),
        }
    }
}

/// Patient listing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatientsConfig {
    /// Page size sent as `_count`
    #[serde(default = "default_page_size")]
    pub page_size: u32,

    /// Sort order: given, family, birthdate
    #[serde(default = "default_order")]
    pub order: String,
}

fn default_page_size() -> u32 {
    50
}

fn default_order() -> String {
    "family".to_string()
}

impl Default for PatientsConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            order: default_order(),
        }
    }
}

impl Config {
    /// Load configuration from file with environment and CLI overrides
    ///
    /// # Arguments
    ///
    /// * `path` - Path to configuration file
    /// * `cli` - CLI arguments for overrides
    ///
    /// # Errors
    ///
    /// Returns error if file cannot be read or parsed
    pub fn load(path: &str, cli: &crate::cli::Cli) -> Result<Self> {
        let mut config = if Path::new(path).exists() {
            Self::from_file(path)?
        } else {
            tracing::warn!("Config file not found at {}, using defaults", path);
            Self::default()
        };

        config.apply_env_vars();
        config.apply_cli_overrides(cli);

        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| SmartError::Config(format!("Failed to read config file: {}", e)))?;
        serde_yaml::from_str(&contents)
            .map_err(|e| SmartError::Config(format!("Failed to parse config: {}", e)).into())
    }

    fn apply_env_vars(&mut self) {
        if let Ok(base_url) = std::env::var("SMARTFHIR_BASE_URL") {
            self.server.base_url = base_url;
        }

        if let Ok(timeout) = std::env::var("SMARTFHIR_TIMEOUT_SECONDS") {
            if let Ok(value) = timeout.parse() {
                self.server.timeout_seconds = value;
            } else {
                tracing::warn!("Invalid SMARTFHIR_TIMEOUT_SECONDS: {}", timeout);
            }
        }

        if let Ok(client_id) = std::env::var("SMARTFHIR_CLIENT_ID") {
            self.auth.client_id = Some(client_id);
        }

        if let Ok(client_secret) = std::env::var("SMARTFHIR_CLIENT_SECRET") {
            self.auth.client_secret = Some(client_secret);
        }

        if let Ok(scope) = std::env::var("SMARTFHIR_SCOPE") {
            self.auth.scope = Some(scope);
        }

        if let Ok(authorize_type) = std::env::var("SMARTFHIR_AUTHORIZE_TYPE") {
            self.auth.authorize_type = Some(authorize_type);
        }

        if let Ok(store) = std::env::var("SMARTFHIR_CREDENTIAL_STORE") {
            self.auth.credential_store = match store.to_lowercase().as_str() {
                "memory" => CredentialStoreKind::Memory,
                "keyring" => CredentialStoreKind::Keyring,
                _ => {
                    tracing::warn!("Invalid SMARTFHIR_CREDENTIAL_STORE: {}", store);
                    self.auth.credential_store
                }
            };
        }

        if let Ok(port) = std::env::var("SMARTFHIR_REDIRECT_PORT") {
            if let Ok(value) = port.parse() {
                self.auth.redirect_port = value;
            } else {
                tracing::warn!("Invalid SMARTFHIR_REDIRECT_PORT: {}", port);
            }
        }

        if let Ok(page_size) = std::env::var("SMARTFHIR_PAGE_SIZE") {
            if let Ok(value) = page_size.parse() {
                self.patients.page_size = value;
            } else {
                tracing::warn!("Invalid SMARTFHIR_PAGE_SIZE: {}", page_size);
            }
        }

        if let Ok(order) = std::env::var("SMARTFHIR_PATIENT_ORDER") {
            self.patients.order = order;
        }
    }

    fn apply_cli_overrides(&mut self, cli: &crate::cli::Cli) {
        if let Some(ref base_url) = cli.base_url {
            self.server.base_url = base_url.clone();
        }
        if let Some(ref client_id) = cli.client_id {
            self.auth.client_id = Some(client_id.clone());
        }
        if cli.verbose {
            self.auth.verbose = true;
            tracing::debug!("Verbose mode enabled");
        }
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns error if any validation check fails
    pub fn validate(&self) -> Result<()> {
        let base_url = self.base_url()?;
        if !matches!(base_url.scheme(), "http" | "https") {
            return Err(SmartError::Config(format!(
                "server.base_url must be http or https, got {}",
                base_url.scheme()
            ))
            .into());
        }

        if self.server.timeout_seconds == 0 {
            return Err(SmartError::Config(
                "server.timeout_seconds must be greater than 0".to_string(),
            )
            .into());
        }

        for (key, value) in [
            ("auth.authorize_uri", &self.auth.authorize_uri),
            ("auth.token_uri", &self.auth.token_uri),
            ("auth.registration_uri", &self.auth.registration_uri),
        ] {
            if let Some(uri) = value {
                Url::parse(uri)
                    .map_err(|e| SmartError::Config(format!("Invalid {}: {}", key, e)))?;
            }
        }

        if let Some(ref authorize_type) = self.auth.authorize_type {
            parse_authorize_type(authorize_type)
                .map_err(|e| SmartError::Config(format!("Invalid auth.authorize_type: {}", e)))?;
        }

        if self.auth.redirect_port == 0 {
            return Err(
                SmartError::Config("auth.redirect_port must be greater than 0".to_string()).into(),
            );
        }

        if self.patients.page_size == 0 || self.patients.page_size > 1000 {
            return Err(SmartError::Config(
                "patients.page_size must be between 1 and 1000".to_string(),
            )
            .into());
        }

        self.patient_order()?;

        Ok(())
    }

    /// The server base URL.
    pub fn base_url(&self) -> Result<Url> {
        Url::parse(&self.server.base_url).map_err(|e| {
            SmartError::Config(format!("Invalid server.base_url '{}': {}", self.server.base_url, e))
                .into()
        })
    }

    pub fn patient_order(&self) -> Result<PatientListOrder> {
        Ok(self.patients.order.parse()?)
    }

    /// HTTP client with the configured timeout.
    pub fn http_client(&self) -> Result<reqwest::Client> {
        reqwest::Client::builder()
            .timeout(Duration::from_secs(self.server.timeout_seconds))
            .user_agent(concat!("smartfhir/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| SmartError::Config(format!("Failed to build HTTP client: {}", e)).into())
    }

    pub fn credential_store(&self) -> Arc<dyn CredentialStore> {
        match self.auth.credential_store {
            CredentialStoreKind::Memory => Arc::new(MemoryStore::new()),
            CredentialStoreKind::Keyring => Arc::new(KeyringStore),
        }
    }

    /// Authorization settings for the coordinator.
    ///
    /// Without a configured redirect, the loopback URI
    /// `http://127.0.0.1:{redirect_port}/callback` is used.
    pub fn auth_settings(&self) -> AuthSettings {
        let auth = &self.auth;
        let mut settings = AuthSettings::new();

        let strings = [
            ("client_id", &auth.client_id),
            ("client_secret", &auth.client_secret),
            ("redirect", &auth.redirect),
            ("scope", &auth.scope),
            ("authorize_uri", &auth.authorize_uri),
            ("token_uri", &auth.token_uri),
            ("registration_uri", &auth.registration_uri),
            ("authorize_type", &auth.authorize_type),
            ("title", &auth.title),
            ("audience", &auth.audience),
        ];
        for (key, value) in strings {
            if let Some(value) = value {
                settings.set(key, value.as_str());
            }
        }

        if !auth.redirect_uris.is_empty() {
            settings.set("redirect_uris", auth.redirect_uris.clone());
        }
        if settings.redirect().is_none() {
            settings.set(
                "redirect",
                format!("http://127.0.0.1:{}/callback", auth.redirect_port),
            );
        }
        settings.set("verbose", auth.verbose);
        settings.set("embedded", auth.embedded);
        settings
    }
}
