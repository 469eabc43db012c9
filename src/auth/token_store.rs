//! OAuth token persistence
//!
//! [`CredentialStore`] abstracts where tokens live between runs.
//! [`KeyringStore`] uses the operating system's native credential store
//! (Keychain on macOS, Secret Service on Linux, Windows Credential Manager
//! on Windows); [`MemoryStore`] keeps tokens for the life of the process.
//!
//! Tokens are serialized to JSON before storage and deserialized on load.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SmartError};

// ---------------------------------------------------------------------------
// OAuthToken
// ---------------------------------------------------------------------------

/// A complete OAuth2 token response.
///
/// `expires_at` is computed from the server's `expires_in` seconds so expiry
/// can be checked without a server round-trip. Any additional token response
/// fields, such as SMART launch context (`patient`, `encounter`,
/// `id_token`), are preserved in `extra`.
///
/// # Examples
///
/// ```
/// use smartfhir::auth::token_store::OAuthToken;
///
/// let token = OAuthToken::bearer("my_access_token");
///
/// // A token with no expiry is never considered expired.
/// assert!(!token.is_expired());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OAuthToken {
    pub access_token: String,

    #[serde(default = "default_token_type")]
    pub token_type: String,

    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "chrono::serde::ts_seconds_option"
    )]
    pub expires_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,

    /// Space-separated scopes granted by the authorization server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,

    /// Remaining token response parameters.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

impl OAuthToken {
    /// Creates a non-expiring bearer token with no extra parameters.
    pub fn bearer(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            token_type: default_token_type(),
            expires_at: None,
            refresh_token: None,
            scope: None,
            extra: serde_json::Map::new(),
        }
    }

    /// Returns `true` when the token is expired or expires within 60 seconds.
    ///
    /// Tokens with no `expires_at` are considered perpetually valid.
    pub fn is_expired(&self) -> bool {
        match self.expires_at {
            None => false,
            Some(expires_at) => Utc::now() >= expires_at - chrono::Duration::seconds(60),
        }
    }

    /// Flattens the token into the parameter map reported to callers.
    pub fn to_parameters(&self) -> serde_json::Map<String, serde_json::Value> {
        let mut params = self.extra.clone();
        params.insert("access_token".into(), self.access_token.clone().into());
        params.insert("token_type".into(), self.token_type.clone().into());
        if let Some(ref scope) = self.scope {
            params.insert("scope".into(), scope.clone().into());
        }
        if let Some(expires_at) = self.expires_at {
            let remaining = (expires_at - Utc::now()).num_seconds().max(0);
            params.insert("expires_in".into(), remaining.into());
        }
        params
    }
}

// ---------------------------------------------------------------------------
// CredentialStore
// ---------------------------------------------------------------------------

/// Persistence for tokens keyed by a server identifier.
pub trait CredentialStore: Send + Sync + std::fmt::Debug {
    /// Returns `Ok(None)` when nothing has been stored under `key`.
    fn load(&self, key: &str) -> Result<Option<OAuthToken>>;

    fn save(&self, key: &str, token: &OAuthToken) -> Result<()>;

    /// Deleting a missing entry is a no-op.
    fn delete(&self, key: &str) -> Result<()>;
}

/// Stateless accessor for the OS native keyring.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeyringStore;

impl KeyringStore {
    /// Builds the keyring service name for `key`.
    fn service_name(key: &str) -> String {
        format!("smartfhir-{}", key)
    }

    fn entry(key: &str) -> Result<keyring::Entry> {
        keyring::Entry::new(&Self::service_name(key), key).map_err(|e| SmartError::Keyring(e).into())
    }
}

impl CredentialStore for KeyringStore {
    fn load(&self, key: &str) -> Result<Option<OAuthToken>> {
        match Self::entry(key)?.get_password() {
            Ok(json_str) => Ok(Some(serde_json::from_str(&json_str)?)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(SmartError::Keyring(e).into()),
        }
    }

    fn save(&self, key: &str, token: &OAuthToken) -> Result<()> {
        let json_str = serde_json::to_string(token)?;
        Self::entry(key)?
            .set_password(&json_str)
            .map_err(SmartError::Keyring)?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        match Self::entry(key)?.delete_password() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(SmartError::Keyring(e).into()),
        }
    }
}

/// In-process token store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tokens: Mutex<HashMap<String, OAuthToken>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CredentialStore for MemoryStore {
    fn load(&self, key: &str) -> Result<Option<OAuthToken>> {
        let tokens = self.tokens.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(tokens.get(key).cloned())
    }

    fn save(&self, key: &str, token: &OAuthToken) -> Result<()> {
        let mut tokens = self.tokens.lock().unwrap_or_else(PoisonError::into_inner);
        tokens.insert(key.to_string(), token.clone());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        let mut tokens = self.tokens.lock().unwrap_or_else(PoisonError::into_inner);
        tokens.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn token_expiring_in(seconds: i64) -> OAuthToken {
        OAuthToken {
            expires_at: Some(Utc::now() + Duration::seconds(seconds)),
            ..OAuthToken::bearer("tok")
        }
    }

    #[test]
    fn test_oauth_token_is_expired_when_past_expiry() {
        assert!(token_expiring_in(-1).is_expired());
    }

    #[test]
    fn test_oauth_token_is_expired_within_buffer_window() {
        // 30 seconds in the future is still within the 60-second buffer.
        assert!(token_expiring_in(30).is_expired());
    }

    #[test]
    fn test_oauth_token_not_expired_when_future_expiry() {
        assert!(!token_expiring_in(3600).is_expired());
    }

    #[test]
    fn test_token_keeps_launch_context_in_extra() {
        let json = r#"{
            "access_token": "abc",
            "token_type": "Bearer",
            "scope": "launch/patient user/*.*",
            "patient": "123",
            "need_patient_banner": true
        }"#;
        let token: OAuthToken = serde_json::from_str(json).unwrap();
        assert_eq!(token.extra["patient"], "123");

        let params = token.to_parameters();
        assert_eq!(params["access_token"], "abc");
        assert_eq!(params["patient"], "123");
        assert_eq!(params["scope"], "launch/patient user/*.*");
    }

    #[test]
    fn test_token_roundtrip_through_json_keeps_expiry() {
        let original = OAuthToken {
            expires_at: Some(DateTime::from_timestamp(1_800_000_000, 0).expect("valid timestamp")),
            refresh_token: Some("refresh_xyz".to_string()),
            ..OAuthToken::bearer("access_abc")
        };
        let json = serde_json::to_string(&original).expect("serialize");
        let restored: OAuthToken = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(restored, original);
    }

    #[test]
    fn test_memory_store_save_load_delete() {
        let store = MemoryStore::new();
        assert!(store.load("srv").unwrap().is_none());

        store.save("srv", &OAuthToken::bearer("a")).unwrap();
        assert_eq!(store.load("srv").unwrap().unwrap().access_token, "a");

        store.delete("srv").unwrap();
        store.delete("srv").unwrap();
        assert!(store.load("srv").unwrap().is_none());
    }

    #[test]
    fn test_service_name_has_prefix() {
        assert_eq!(KeyringStore::service_name("fhir.example.com"), "smartfhir-fhir.example.com");
    }

    #[test]
    #[ignore = "requires system keyring"]
    fn test_keyring_roundtrip() {
        let store = KeyringStore;
        let key = "smartfhir_keyring_roundtrip_test";
        store.save(key, &token_expiring_in(3600)).expect("save");
        assert!(store.load(key).expect("load").is_some());
        store.delete(key).expect("delete");
        assert!(store.load(key).expect("load after delete").is_none());
    }
}
