//! smartfhir - SMART on FHIR command-line client
//!
#![doc = "Main entry point for the smartfhir client."]

use anyhow::Result;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use smartfhir::cli::{Cli, Commands};
use smartfhir::commands::{self, ClientContext};
use smartfhir::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let cli = Cli::parse_args();

    init_tracing(cli.verbose);

    // Load configuration
    let config_path = cli.config.as_deref().unwrap_or("config/config.yaml");
    let config = Config::load(config_path, &cli)?;

    // Validate configuration
    config.validate()?;

    let ctx = ClientContext::from_config(config)?;
    tracing::debug!(base_url = %ctx.capabilities.gateway().base_url(), "client ready");

    match cli.command {
        Commands::Capability { json } => {
            tracing::info!("Fetching capability statement");
            commands::capability::show_capability(&ctx, json).await
        }
        Commands::Authorize { granularity } => {
            commands::authorize::run_authorize(&ctx, &granularity).await
        }
        Commands::Patients {
            order,
            page_size,
            pages,
            json,
        } => {
            if let Some(o) = &order {
                tracing::debug!("Using order override: {}", o);
            }
            let args = commands::patients::PatientsArgs {
                order,
                page_size,
                pages,
                json,
            };
            commands::patients::list_patients(&ctx, args).await
        }
        Commands::Get { path } => {
            tracing::info!("GET {}", path);
            commands::get::get_resource(&ctx, &path).await
        }
        Commands::Reset => commands::reset::reset_credentials(&ctx).await,
    }
}

/// Initialize tracing subscriber
fn init_tracing(verbose: bool) {
    let default = if verbose { "smartfhir=debug" } else { "smartfhir=info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
