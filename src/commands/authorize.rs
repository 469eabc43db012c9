//! `authorize` command: run one authorization flow

use colored::Colorize;
use prettytable::{row, Table};
use serde_json::Value;

use crate::auth::{AuthOutcome, AuthParameters, GranularityPolicy};
use crate::error::Result;

use super::ClientContext;

/// Runs an authorization flow for `granularity` and prints the outcome.
pub async fn run_authorize(ctx: &ClientContext, granularity: &str) -> Result<()> {
    let policy: GranularityPolicy = granularity.parse()?;
    let kind = ctx.coordinator.ready().await?;
    tracing::info!(%kind, ?policy, "starting authorization");

    match ctx.coordinator.authorize(policy, None).await? {
        AuthOutcome::Authorized(params) => {
            println!("{}", "Authorization succeeded".green().bold());
            if params.is_empty() {
                println!("Using stored credential (or server requires none).");
            } else {
                print_parameters(&params);
            }
        }
        AuthOutcome::Aborted => {
            println!("{}", "Authorization aborted".yellow());
        }
    }
    Ok(())
}

fn print_parameters(params: &AuthParameters) {
    let mut table = Table::new();
    table.add_row(row!["Parameter", "Value"]);
    let mut keys: Vec<_> = params.keys().collect();
    keys.sort();
    for key in keys {
        table.add_row(row![key, display_value(key, &params[key])]);
    }
    table.printstd();
}

/// Renders a parameter for display, masking credentials and summarizing
/// embedded resources.
fn display_value(key: &str, value: &Value) -> String {
    match (key, value) {
        ("access_token" | "refresh_token" | "id_token", Value::String(s)) => mask(s),
        ("patient_resource", Value::Object(o)) => format!(
            "{}/{}",
            o.get("resourceType").and_then(Value::as_str).unwrap_or("?"),
            o.get("id").and_then(Value::as_str).unwrap_or("?")
        ),
        (_, Value::String(s)) => s.clone(),
        (_, other) => other.to_string(),
    }
}

fn mask(secret: &str) -> String {
    let visible: String = secret.chars().take(6).collect();
    if secret.chars().count() > 6 {
        format!("{visible}…")
    } else {
        "******".to_string()
    }
}
