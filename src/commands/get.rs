//! `get` command: signed GET of a resource path

use colored::Colorize;

use crate::error::{Result, SmartError};

use super::ClientContext;

pub async fn get_resource(ctx: &ClientContext, path: &str) -> Result<()> {
    ctx.ensure_authorized().await?;

    let response = ctx.signed_gateway().get(path).await?;
    tracing::debug!(status = response.status, "resource fetched");

    match response.body {
        Some(body) => {
            let rendered =
                serde_json::to_string_pretty(&body).map_err(SmartError::Serialization)?;
            println!("{}", rendered);
        }
        None => println!("{}", format!("{} (no content)", response.status).dimmed()),
    }
    Ok(())
}
