//! Server capability resolution
//!
//! The server describes its REST surface and security configuration in a
//! CapabilityStatement (historically "Conformance") served at
//! `{base}/metadata`. [`CapabilityStore`] fetches that document lazily, at
//! most once per store instance, and extracts from it:
//!
//! - the OAuth endpoint URIs advertised in the security block
//!   ([`SecurityEndpoints`])
//! - the named operation catalogue
//!
//! Only a single REST entry is consulted: the first one whose `mode` is
//! `server`, falling back to the first entry. Security blocks of several
//! entries are never merged.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;

use crate::error::{Result, SmartError};
use crate::gateway::RequestGateway;

/// Well-known path of the capability document, relative to the base URL.
pub const METADATA_PATH: &str = "metadata";

/// Extension URL carrying nested SMART OAuth endpoint extensions.
const SMART_OAUTH_URIS: &str = "http://fhir-registry.smarthealthit.org/StructureDefinition/oauth-uris";

// ---------------------------------------------------------------------------
// Capability document model
// ---------------------------------------------------------------------------

/// A FHIR CapabilityStatement, limited to the parts this client consumes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilityStatement {
    /// `CapabilityStatement` or, for older servers, `Conformance`
    #[serde(default)]
    pub resource_type: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fhir_version: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub format: Vec<String>,

    #[serde(default)]
    pub rest: Vec<CapabilityRest>,
}

/// One `rest` entry of the capability document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilityRest {
    /// `server` or `client`
    #[serde(default)]
    pub mode: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security: Option<RestSecurity>,

    #[serde(default)]
    pub resource: Vec<ResourceCapability>,

    #[serde(default)]
    pub operation: Vec<OperationRef>,
}

/// The security block of a REST entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestSecurity {
    #[serde(default)]
    pub service: Vec<CodeableConcept>,

    #[serde(default)]
    pub extension: Vec<Extension>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CodeableConcept {
    #[serde(default)]
    pub coding: Vec<Coding>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Coding {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

/// A (possibly nested) FHIR extension.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Extension {
    pub url: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_uri: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_url: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extension: Vec<Extension>,
}

impl Extension {
    fn value(&self) -> Option<&str> {
        self.value_uri.as_deref().or(self.value_url.as_deref())
    }
}

/// Declared capabilities for one resource type.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceCapability {
    #[serde(rename = "type")]
    pub resource_type: String,

    #[serde(default)]
    pub interaction: Vec<Interaction>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Interaction {
    pub code: String,
}

/// A named operation declared by the server.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct OperationRef {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub definition: Option<Reference>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Reference {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
}

impl CapabilityStatement {
    /// Returns the REST entry this client consults.
    pub fn best_rest(&self) -> Option<&CapabilityRest> {
        self.rest
            .iter()
            .find(|r| r.mode == "server")
            .or_else(|| self.rest.first())
    }

    /// Extracts OAuth endpoints from the best REST entry's security block.
    pub fn security_endpoints(&self) -> SecurityEndpoints {
        self.best_rest()
            .and_then(|rest| rest.security.as_ref())
            .map(SecurityEndpoints::from_security)
            .unwrap_or_default()
    }

    /// Returns the operation catalogue of the best REST entry keyed by name.
    pub fn operations(&self) -> HashMap<String, OperationRef> {
        self.best_rest()
            .map(|rest| {
                rest.operation
                    .iter()
                    .map(|op| (op.name.clone(), op.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Looks up the declared capabilities of `resource_type`.
    pub fn resource_capability(&self, resource_type: &str) -> Option<&ResourceCapability> {
        self.best_rest()?
            .resource
            .iter()
            .find(|r| r.resource_type == resource_type)
    }
}

// ---------------------------------------------------------------------------
// Security endpoints
// ---------------------------------------------------------------------------

/// OAuth endpoint URIs advertised by the server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityEndpoints {
    pub authorize_uri: Option<String>,
    pub token_uri: Option<String>,
    pub registration_uri: Option<String>,
}

impl SecurityEndpoints {
    /// Extracts endpoint URIs from a security block.
    ///
    /// Two layouts are understood: flat extensions whose URL ends in
    /// `#authorize`, `#token`, or `#register`, and the SMART `oauth-uris`
    /// extension with nested `authorize`, `token`, and `register` entries.
    pub fn from_security(security: &RestSecurity) -> Self {
        let mut endpoints = Self::default();

        for ext in &security.extension {
            if ext.url == SMART_OAUTH_URIS {
                for nested in &ext.extension {
                    endpoints.assign(&nested.url, nested.value());
                }
            } else if let Some((_, key)) = ext.url.rsplit_once('#') {
                endpoints.assign(key, ext.value());
            }
        }

        endpoints
    }

    fn assign(&mut self, key: &str, value: Option<&str>) {
        let Some(value) = value else { return };
        let slot = match key {
            "authorize" => &mut self.authorize_uri,
            "token" => &mut self.token_uri,
            "register" => &mut self.registration_uri,
            _ => return,
        };
        *slot = Some(value.to_string());
    }
}

// ---------------------------------------------------------------------------
// CapabilityStore
// ---------------------------------------------------------------------------

/// Fetches the capability document once and memoizes it.
///
/// Concurrent callers share one in-flight fetch. A failed fetch leaves the
/// cache empty so the next call retries.
#[derive(Debug)]
pub struct CapabilityStore {
    gateway: RequestGateway,
    cached: OnceCell<Arc<CapabilityStatement>>,
}

impl CapabilityStore {
    /// Creates a store fetching through `gateway`.
    ///
    /// The gateway is normally unsigned; servers publish their capability
    /// document without authorization.
    pub fn new(gateway: RequestGateway) -> Self {
        Self {
            gateway,
            cached: OnceCell::new(),
        }
    }

    /// The gateway used for capability fetches.
    pub fn gateway(&self) -> &RequestGateway {
        &self.gateway
    }

    /// Returns the capability document, fetching it on first use.
    ///
    /// # Errors
    ///
    /// Returns [`SmartError::CapabilityFetch`] wrapping the transport, HTTP
    /// status, or parse failure.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use std::sync::Arc;
    /// use smartfhir::capability::CapabilityStore;
    /// use smartfhir::gateway::{RequestGateway, Unsigned};
    ///
    /// # tokio_test::block_on(async {
    /// let base = url::Url::parse("https://fhir.example.org/r4/").unwrap();
    /// let store = CapabilityStore::new(RequestGateway::new(
    ///     reqwest::Client::new(),
    ///     base,
    ///     Arc::new(Unsigned),
    /// ));
    /// let statement = store.get_capability().await.unwrap();
    /// println!("FHIR {}", statement.fhir_version.as_deref().unwrap_or("?"));
    /// # });
    /// ```
    pub async fn get_capability(&self) -> Result<Arc<CapabilityStatement>> {
        let statement = self
            .cached
            .get_or_try_init(|| async {
                tracing::debug!(base = %self.gateway.base_url(), "fetching capability document");
                let statement = self.fetch().await.map_err(SmartError::capability_fetch)?;
                tracing::info!(
                    rest_entries = statement.rest.len(),
                    fhir_version = statement.fhir_version.as_deref().unwrap_or("unknown"),
                    "capability document loaded"
                );
                Ok::<_, SmartError>(Arc::new(statement))
            })
            .await?;
        Ok(Arc::clone(statement))
    }

    /// Returns the cached document without fetching.
    pub fn cached(&self) -> Option<Arc<CapabilityStatement>> {
        self.cached.get().cloned()
    }

    /// Security endpoints of the best REST entry.
    pub async fn security_endpoints(&self) -> Result<SecurityEndpoints> {
        Ok(self.get_capability().await?.security_endpoints())
    }

    /// Named operations of the best REST entry.
    pub async fn operations(&self) -> Result<HashMap<String, OperationRef>> {
        Ok(self.get_capability().await?.operations())
    }

    /// Returns whether the server declares `interaction` for `resource_type`.
    pub async fn supports_interaction(&self, resource_type: &str, interaction: &str) -> Result<bool> {
        let statement = self.get_capability().await?;
        Ok(statement
            .resource_capability(resource_type)
            .map(|r| r.interaction.iter().any(|i| i.code == interaction))
            .unwrap_or(false))
    }

    async fn fetch(&self) -> Result<CapabilityStatement> {
        let body = self.gateway.get(METADATA_PATH).await?.into_body()?;
        let raw = body.to_string();
        serde_json::from_value(body).map_err(|e| {
            SmartError::BodyParse {
                raw_body: raw,
                message: e.to_string(),
            }
            .into()
        })
    }
}
