//! `reset` command: forget stored credentials

use colored::Colorize;

use crate::error::Result;

use super::ClientContext;

pub async fn reset_credentials(ctx: &ClientContext) -> Result<()> {
    ctx.coordinator.ready().await?;
    ctx.coordinator.reset().await?;
    println!(
        "{} {}",
        "Credentials cleared for".green(),
        ctx.capabilities.gateway().base_url()
    );
    Ok(())
}
