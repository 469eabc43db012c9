//! Error types for smartfhir
//!
//! This module defines the error taxonomy shared by capability resolution,
//! authorization coordination, the request gateway, and patient listing,
//! using `thiserror` for ergonomic error handling.
//!
//! Aborted authorization attempts are deliberately *not* errors; they are
//! reported as [`crate::auth::AuthOutcome::Aborted`] so callers can tell
//! "cancelled" apart from "failed".

use thiserror::Error;

/// Main error type for smartfhir operations
#[derive(Error, Debug)]
pub enum SmartError {
    /// Connection, DNS, TLS, or timeout failure before any response arrived
    #[error("Transport error: {0}")]
    Transport(String),

    /// A response arrived but could not be read as an HTTP response
    #[error("Non-HTTP response: {0}")]
    NonHttpResponse(String),

    /// The server answered with a status code of 400 or above
    #[error("HTTP {status}: {reason}")]
    HttpStatus {
        /// Numeric HTTP status
        status: u16,
        /// Human-readable reason, enriched with OperationOutcome diagnostics
        reason: String,
    },

    /// The response body was not valid JSON
    #[error("Failed to parse response body: {message}")]
    BodyParse {
        /// The raw body as received
        raw_body: String,
        /// Parser error message
        message: String,
    },

    /// No usable authorization strategy could be derived
    #[error("No authorization method available: {0}")]
    NoAuthorizationMethod(String),

    /// An operation was invoked before the coordinator became ready
    #[error("Not ready: {0}")]
    NotReady(String),

    /// The requested operation or HTTP method is not supported
    #[error("Operation not supported: {0}")]
    OperationNotSupported(String),

    /// Fetching the server capability document failed
    #[error("Capability fetch failed: {0}")]
    CapabilityFetch(#[source] Box<SmartError>),

    /// Errors reported by the OAuth2 engine (token endpoint, redirect, state)
    #[error("OAuth error: {0}")]
    OAuth(String),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Keyring/credential storage errors
    #[error("Keyring error: {0}")]
    Keyring(#[from] keyring::Error),
}

impl SmartError {
    /// Wraps an arbitrary error into a [`SmartError::CapabilityFetch`].
    ///
    /// Errors that already are a [`SmartError`] are kept as the inner detail;
    /// anything else is treated as a transport failure.
    pub fn capability_fetch(err: anyhow::Error) -> Self {
        match err.downcast::<SmartError>() {
            Ok(inner) => SmartError::CapabilityFetch(Box::new(inner)),
            Err(other) => SmartError::CapabilityFetch(Box::new(SmartError::Transport(
                other.to_string(),
            ))),
        }
    }

    /// Returns the HTTP status carried by this error, looking through a
    /// capability fetch wrapper.
    pub fn http_status(&self) -> Option<u16> {
        match self {
            SmartError::HttpStatus { status, .. } => Some(*status),
            SmartError::CapabilityFetch(inner) => inner.http_status(),
            _ => None,
        }
    }
}

/// Result type alias for smartfhir operations
///
/// Uses `anyhow::Error` so call sites can attach context; match on the
/// taxonomy with `err.downcast_ref::<SmartError>()`.
pub type Result<T> = anyhow::Result<T>;
