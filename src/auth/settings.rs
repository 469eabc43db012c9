//! Authorization settings, strategy kinds, and granularity policy
//!
//! [`AuthSettings`] is the string-keyed settings map supplied by the caller
//! and merged with endpoints discovered from the capability document.
//! [`derive_strategy`] is a pure function from `(endpoints, settings)` to a
//! [`StrategyKind`]; nothing here performs I/O.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::capability::SecurityEndpoints;
use crate::error::{Result, SmartError};

/// Scope requested when the settings do not name one.
pub const DEFAULT_SCOPE: &str = "user/*.* openid profile";

/// The OAuth2 grant type (or none) used against a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    /// The server is open; requests go unsigned.
    None,
    ImplicitGrant,
    CodeGrant,
    ClientCredentials,
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StrategyKind::None => "none",
            StrategyKind::ImplicitGrant => "implicit",
            StrategyKind::CodeGrant => "authorization_code",
            StrategyKind::ClientCredentials => "client_credentials",
        };
        f.write_str(name)
    }
}

/// How much context the authorization flow must obtain beyond a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GranularityPolicy {
    /// A bare access token.
    #[default]
    TokenOnly,
    /// Request a launch context (`launch` scope).
    LaunchContext,
    /// Let the authorization server's login page pick a patient.
    PatientSelectWeb,
    /// Pick a patient locally after obtaining a plain token.
    PatientSelectNative,
}

impl GranularityPolicy {
    /// Scope token prepended to the base scope for this policy.
    pub fn scope_prefix(self) -> Option<&'static str> {
        match self {
            GranularityPolicy::LaunchContext => Some("launch"),
            GranularityPolicy::PatientSelectWeb => Some("launch/patient"),
            GranularityPolicy::TokenOnly | GranularityPolicy::PatientSelectNative => None,
        }
    }
}

impl std::str::FromStr for GranularityPolicy {
    type Err = SmartError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "token" | "token_only" => Ok(GranularityPolicy::TokenOnly),
            "launch" | "launch_context" => Ok(GranularityPolicy::LaunchContext),
            "patient_web" | "patient_select_web" => Ok(GranularityPolicy::PatientSelectWeb),
            "patient_native" | "patient_select_native" => {
                Ok(GranularityPolicy::PatientSelectNative)
            }
            other => Err(SmartError::Config(format!("unknown granularity '{other}'"))),
        }
    }
}

// ---------------------------------------------------------------------------
// AuthSettings
// ---------------------------------------------------------------------------

/// String-keyed authorization settings.
///
/// Recognized keys: `client_id`, `client_secret`, `redirect`,
/// `redirect_uris`, `scope`, `authorize_uri`, `token_uri`,
/// `registration_uri`, `authorize_type`, `title`, `verbose`, `embedded`,
/// and `audience`. Unknown keys are carried along untouched.
///
/// # Examples
///
/// ```
/// use smartfhir::auth::settings::AuthSettings;
///
/// let settings = AuthSettings::new()
///     .with("client_id", "my_app")
///     .with("redirect", "smartapp://callback");
/// assert_eq!(settings.client_id(), Some("my_app"));
/// assert_eq!(settings.redirect(), Some("smartapp://callback"));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AuthSettings(Map<String, Value>);

impl AuthSettings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.set(key, value);
        self
    }

    pub fn set(&mut self, key: &str, value: impl Into<Value>) {
        self.0.insert(key.to_string(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Returns a non-empty string value.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0
            .get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }

    fn get_bool(&self, key: &str) -> bool {
        match self.0.get(key) {
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) => matches!(s.as_str(), "true" | "1" | "yes"),
            _ => false,
        }
    }

    pub fn client_id(&self) -> Option<&str> {
        self.get_str("client_id")
    }

    pub fn client_secret(&self) -> Option<&str> {
        self.get_str("client_secret")
    }

    /// The redirect URI: `redirect`, else the first of `redirect_uris`.
    pub fn redirect(&self) -> Option<&str> {
        self.get_str("redirect").or_else(|| {
            self.0
                .get("redirect_uris")
                .and_then(Value::as_array)
                .and_then(|uris| uris.first())
                .and_then(Value::as_str)
        })
    }

    /// The configured base scope, or [`DEFAULT_SCOPE`].
    pub fn scope(&self) -> &str {
        self.get_str("scope").unwrap_or(DEFAULT_SCOPE)
    }

    pub fn authorize_uri(&self) -> Option<&str> {
        self.get_str("authorize_uri")
    }

    pub fn token_uri(&self) -> Option<&str> {
        self.get_str("token_uri")
    }

    pub fn registration_uri(&self) -> Option<&str> {
        self.get_str("registration_uri")
    }

    pub fn authorize_type(&self) -> Option<&str> {
        self.get_str("authorize_type")
    }

    pub fn title(&self) -> Option<&str> {
        self.get_str("title")
    }

    pub fn audience(&self) -> Option<&str> {
        self.get_str("audience")
    }

    pub fn verbose(&self) -> bool {
        self.get_bool("verbose")
    }

    /// Whether the login surface should be embedded rather than an external
    /// browser.
    pub fn embedded(&self) -> bool {
        self.get_bool("embedded")
    }

    /// Returns a copy with discovered endpoints applied.
    ///
    /// Discovered URIs replace caller-supplied ones; the server's capability
    /// document is authoritative for its own endpoints.
    pub fn merged_with(&self, endpoints: &SecurityEndpoints) -> Self {
        let mut merged = self.clone();
        if let Some(ref uri) = endpoints.authorize_uri {
            merged.set("authorize_uri", uri.as_str());
        }
        if let Some(ref uri) = endpoints.token_uri {
            merged.set("token_uri", uri.as_str());
        }
        if let Some(ref uri) = endpoints.registration_uri {
            merged.set("registration_uri", uri.as_str());
        }
        merged
    }
}

impl From<Map<String, Value>> for AuthSettings {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

// ---------------------------------------------------------------------------
// Strategy derivation
// ---------------------------------------------------------------------------

/// Parses an explicit `authorize_type` setting.
pub fn parse_authorize_type(value: &str) -> Result<StrategyKind> {
    match value {
        "none" => Ok(StrategyKind::None),
        "implicit" | "implicit_grant" => Ok(StrategyKind::ImplicitGrant),
        "authorization_code" | "code" | "code_grant" => Ok(StrategyKind::CodeGrant),
        "client_credentials" => Ok(StrategyKind::ClientCredentials),
        other => Err(SmartError::NoAuthorizationMethod(format!(
            "unsupported authorize_type '{other}'"
        ))
        .into()),
    }
}

/// Derives the strategy kind from discovered endpoints and settings.
///
/// An explicit `authorize_type` is honored verbatim. Otherwise a token URI
/// means [`StrategyKind::CodeGrant`], an authorize URI alone means
/// [`StrategyKind::ImplicitGrant`], and neither means [`StrategyKind::None`].
///
/// # Examples
///
/// ```
/// use smartfhir::auth::settings::{derive_strategy, AuthSettings, StrategyKind};
/// use smartfhir::capability::SecurityEndpoints;
///
/// let settings = AuthSettings::new().with("authorize_uri", "https://a/auth");
/// let kind = derive_strategy(&SecurityEndpoints::default(), &settings).unwrap();
/// assert_eq!(kind, StrategyKind::ImplicitGrant);
/// ```
pub fn derive_strategy(endpoints: &SecurityEndpoints, settings: &AuthSettings) -> Result<StrategyKind> {
    let merged = settings.merged_with(endpoints);

    if let Some(explicit) = merged.authorize_type() {
        return parse_authorize_type(explicit);
    }

    let kind = match (merged.authorize_uri(), merged.token_uri()) {
        (_, Some(_)) => StrategyKind::CodeGrant,
        (Some(_), None) => StrategyKind::ImplicitGrant,
        (None, None) => StrategyKind::None,
    };
    Ok(kind)
}

/// Computes the scope requested for `policy` on top of `base`.
///
/// # Examples
///
/// ```
/// use smartfhir::auth::settings::{effective_scope, GranularityPolicy, DEFAULT_SCOPE};
///
/// assert_eq!(
///     effective_scope(DEFAULT_SCOPE, GranularityPolicy::PatientSelectWeb),
///     "launch/patient user/*.* openid profile"
/// );
/// ```
pub fn effective_scope(base: &str, policy: GranularityPolicy) -> String {
    match policy.scope_prefix() {
        Some(prefix) => format!("{prefix} {base}"),
        None => base.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoints(authorize: Option<&str>, token: Option<&str>) -> SecurityEndpoints {
        SecurityEndpoints {
            authorize_uri: authorize.map(str::to_string),
            token_uri: token.map(str::to_string),
            registration_uri: None,
        }
    }

    #[test]
    fn test_both_uris_in_settings_derive_code_grant() {
        let settings = AuthSettings::new()
            .with("authorize_uri", "https://a/auth")
            .with("token_uri", "https://a/token");
        let kind = derive_strategy(&SecurityEndpoints::default(), &settings).unwrap();
        assert_eq!(kind, StrategyKind::CodeGrant);
    }

    #[test]
    fn test_authorize_only_derives_implicit() {
        let kind = derive_strategy(&endpoints(Some("https://a/auth"), None), &AuthSettings::new())
            .unwrap();
        assert_eq!(kind, StrategyKind::ImplicitGrant);
    }

    #[test]
    fn test_neither_uri_derives_none() {
        let kind = derive_strategy(&SecurityEndpoints::default(), &AuthSettings::new()).unwrap();
        assert_eq!(kind, StrategyKind::None);
    }

    #[test]
    fn test_explicit_type_is_honored_verbatim() {
        let settings = AuthSettings::new().with("authorize_type", "client_credentials");
        let kind = derive_strategy(
            &endpoints(Some("https://a/auth"), Some("https://a/token")),
            &settings,
        )
        .unwrap();
        assert_eq!(kind, StrategyKind::ClientCredentials);
    }

    #[test]
    fn test_explicit_implicit_overrides_token_uri() {
        let settings = AuthSettings::new().with("authorize_type", "implicit");
        let kind = derive_strategy(&endpoints(None, Some("https://a/token")), &settings).unwrap();
        assert_eq!(kind, StrategyKind::ImplicitGrant);
    }

    #[test]
    fn test_unknown_explicit_type_is_no_authorization_method() {
        let settings = AuthSettings::new().with("authorize_type", "saml");
        let err = derive_strategy(&SecurityEndpoints::default(), &settings).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SmartError>(),
            Some(SmartError::NoAuthorizationMethod(_))
        ));
    }

    #[test]
    fn test_discovered_endpoints_override_settings() {
        let settings = AuthSettings::new().with("authorize_uri", "https://old/auth");
        let merged = settings.merged_with(&endpoints(Some("https://new/auth"), None));
        assert_eq!(merged.authorize_uri(), Some("https://new/auth"));
        assert_eq!(merged.token_uri(), None);
    }

    #[test]
    fn test_merge_keeps_settings_when_nothing_discovered() {
        let settings = AuthSettings::new().with("token_uri", "https://a/token");
        let merged = settings.merged_with(&SecurityEndpoints::default());
        assert_eq!(merged, settings);
    }

    #[test]
    fn test_effective_scope_per_policy() {
        assert_eq!(effective_scope(DEFAULT_SCOPE, GranularityPolicy::TokenOnly), DEFAULT_SCOPE);
        assert_eq!(
            effective_scope(DEFAULT_SCOPE, GranularityPolicy::LaunchContext),
            "launch user/*.* openid profile"
        );
        assert_eq!(
            effective_scope(DEFAULT_SCOPE, GranularityPolicy::PatientSelectWeb),
            "launch/patient user/*.* openid profile"
        );
        assert_eq!(
            effective_scope(DEFAULT_SCOPE, GranularityPolicy::PatientSelectNative),
            DEFAULT_SCOPE
        );
    }

    #[test]
    fn test_settings_scope_defaults() {
        assert_eq!(AuthSettings::new().scope(), DEFAULT_SCOPE);
        assert_eq!(AuthSettings::new().with("scope", "patient/*.read").scope(), "patient/*.read");
        assert_eq!(AuthSettings::new().with("scope", "").scope(), DEFAULT_SCOPE);
    }

    #[test]
    fn test_redirect_falls_back_to_redirect_uris() {
        let settings = AuthSettings::new().with(
            "redirect_uris",
            serde_json::json!(["app://one", "app://two"]),
        );
        assert_eq!(settings.redirect(), Some("app://one"));
    }

    #[test]
    fn test_bool_settings_accept_strings() {
        let settings = AuthSettings::new().with("verbose", "true").with("embedded", true);
        assert!(settings.verbose());
        assert!(settings.embedded());
        assert!(!AuthSettings::new().verbose());
    }

    #[test]
    fn test_granularity_from_str() {
        assert_eq!(
            "patient-select-native".parse::<GranularityPolicy>().unwrap(),
            GranularityPolicy::PatientSelectNative
        );
        assert_eq!("launch".parse::<GranularityPolicy>().unwrap(), GranularityPolicy::LaunchContext);
        assert!("bogus".parse::<GranularityPolicy>().is_err());
    }
}
