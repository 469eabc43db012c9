//! Command-line interface definition for smartfhir
//!
//! This module defines the CLI structure using clap's derive API,
//! providing commands for capability discovery, authorization, and
//! resource access.

use clap::{Parser, Subcommand};

/// smartfhir - SMART on FHIR command-line client
///
/// Discovers a FHIR server's authorization requirements, authorizes against
/// it, and issues signed REST requests.
#[derive(Parser, Debug, Clone)]
#[command(name = "smartfhir")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, env = "SMARTFHIR_CONFIG", default_value = "config/config.yaml")]
    pub config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// FHIR server base URL (overrides config and SMARTFHIR_BASE_URL)
    #[arg(long)]
    pub base_url: Option<String>,

    /// OAuth2 client id (overrides config)
    #[arg(long)]
    pub client_id: Option<String>,

    /// Command to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for smartfhir
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Fetch and summarize the server's capability statement
    Capability {
        /// Print the raw capability statement as JSON
        #[arg(long)]
        json: bool,
    },

    /// Authorize against the server
    Authorize {
        /// Context to obtain: token, launch, patient-web, patient-native
        #[arg(short, long, default_value = "token")]
        granularity: String,
    },

    /// List patients in a sorted, sectioned view
    Patients {
        /// Sort order: given, family, birthdate (defaults to config)
        #[arg(short, long)]
        order: Option<String>,

        /// Page size sent as `_count` (defaults to config)
        #[arg(long)]
        page_size: Option<u32>,

        /// Number of pages to fetch
        #[arg(long, default_value_t = 1)]
        pages: usize,

        /// Print patients as JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// GET a resource path relative to the base URL
    Get {
        /// Resource path, e.g. `Patient/123` or `Observation?patient=123`
        path: String,
    },

    /// Forget stored credentials for the configured server
    Reset,
}

impl Cli {
    /// Parse command line arguments
    ///
    /// # Returns
    ///
    /// Returns the parsed CLI structure
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

impl Default for Cli {
    fn default() -> Self {
        Self {
            config: Some("config/config.yaml".to_string()),
            verbose: false,
            base_url: None,
            client_id: None,
            command: Commands::Capability { json: false },
        }
    }
}
