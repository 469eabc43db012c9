//! `capability` command: summarize the server's capability statement

use colored::Colorize;
use prettytable::{row, Table};

use crate::auth::derive_strategy;
use crate::capability::CapabilityStatement;
use crate::error::{Result, SmartError};

use super::ClientContext;

/// Fetches the capability statement and prints a summary (or raw JSON).
pub async fn show_capability(ctx: &ClientContext, json: bool) -> Result<()> {
    let statement = ctx.capabilities.get_capability().await?;

    if json {
        let rendered =
            serde_json::to_string_pretty(&*statement).map_err(SmartError::Serialization)?;
        println!("{}", rendered);
        return Ok(());
    }

    print_summary(ctx, &statement)
}

fn print_summary(ctx: &ClientContext, statement: &CapabilityStatement) -> Result<()> {
    let endpoints = statement.security_endpoints();
    let strategy = derive_strategy(&endpoints, ctx.coordinator.settings())?;

    println!(
        "\n{} {}",
        "Server:".bold(),
        ctx.capabilities.gateway().base_url()
    );
    println!(
        "{} {}",
        "FHIR version:".bold(),
        statement.fhir_version.as_deref().unwrap_or("unknown")
    );
    println!("{} {}", "Authorization:".bold(), strategy.to_string().cyan());

    let mut security = Table::new();
    security.add_row(row!["Endpoint", "URI"]);
    security.add_row(row!["authorize", endpoints.authorize_uri.as_deref().unwrap_or("-")]);
    security.add_row(row!["token", endpoints.token_uri.as_deref().unwrap_or("-")]);
    security.add_row(row!["register", endpoints.registration_uri.as_deref().unwrap_or("-")]);
    println!();
    security.printstd();

    if let Some(rest) = statement.best_rest() {
        if !rest.resource.is_empty() {
            let mut resources = Table::new();
            resources.add_row(row!["Resource", "Interactions"]);
            for resource in &rest.resource {
                let interactions = resource
                    .interaction
                    .iter()
                    .map(|i| i.code.as_str())
                    .collect::<Vec<_>>()
                    .join(", ");
                resources.add_row(row![resource.resource_type, interactions]);
            }
            println!();
            resources.printstd();
        }
    }

    let mut operations: Vec<_> = statement.operations().into_values().collect();
    if !operations.is_empty() {
        operations.sort_by(|a, b| a.name.cmp(&b.name));
        let mut table = Table::new();
        table.add_row(row!["Operation", "Definition"]);
        for op in operations {
            let definition = op
                .definition
                .and_then(|d| d.reference)
                .unwrap_or_else(|| "-".to_string());
            table.add_row(row![format!("${}", op.name), definition]);
        }
        println!();
        table.printstd();
    }

    println!();
    Ok(())
}
