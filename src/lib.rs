//! smartfhir - SMART on FHIR client library
//!
//! This library discovers a FHIR server's authorization requirements,
//! authorizes against it with OAuth2, signs REST requests with the resulting
//! credential, and pages through patient search results in a sorted,
//! sectioned list.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//!
//! - `gateway`: Base-URL relative REST calls and response classification
//! - `capability`: Lazy, cached capability statement and endpoint extraction
//! - `auth`: Strategy selection, OAuth2 flows, credential storage, and the
//!   authorization coordinator
//! - `patients`: Patient model, sort orders, search cursor, and the
//!   sectioned patient list
//! - `config`: Configuration management and validation
//! - `error`: Error types and result aliases
//! - `cli`: Command-line interface definition
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use smartfhir::auth::{AuthCoordinator, AuthSettings, GranularityPolicy};
//! use smartfhir::capability::CapabilityStore;
//! use smartfhir::gateway::{RequestGateway, Unsigned};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let base = url::Url::parse("https://fhir.example.org/r4/")?;
//!     let gateway = RequestGateway::new(reqwest::Client::new(), base, Arc::new(Unsigned));
//!     let capabilities = Arc::new(CapabilityStore::new(gateway));
//!
//!     let settings = AuthSettings::new().with("client_id", "my-app");
//!     let coordinator = AuthCoordinator::new(capabilities, settings);
//!     let outcome = coordinator.authorize(GranularityPolicy::TokenOnly, None).await?;
//!     println!("authorized: {}", outcome.is_authorized());
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod capability;
pub mod cli;
pub mod commands;
pub mod config;
pub mod error;
pub mod gateway;
pub mod patients;

// Re-export commonly used types
pub use auth::{AuthCoordinator, AuthOutcome, GranularityPolicy, StrategyKind};
pub use capability::CapabilityStore;
pub use config::Config;
pub use error::{Result, SmartError};
pub use gateway::RequestGateway;
pub use patients::{PatientList, PatientListOrder};
