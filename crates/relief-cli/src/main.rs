//! Relief CLI - inspect and maintain the local worksite sync state
//!
//! Shows what is waiting to upload, which changes stalled, and how far each
//! incident has been pulled. Stalled changes can be released for retry and
//! incident caches reset.

mod cli;
mod commands;
mod error;
#[cfg(test)]
mod tests;

use clap::Parser;

use crate::cli::{Cli, Commands};
use crate::commands::changes::{run_changes, run_retry, run_stalled};
use crate::commands::common::{load_settings, resolve_config_path, resolve_db_path};
use crate::commands::incidents::{run_params, run_reset, run_stats};
use crate::commands::pending::run_pending;
use crate::commands::settings::run_settings;
use crate::commands::worksites::run_worksites;
use crate::error::CliError;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    dotenvy::dotenv().ok();

    let mut filter = tracing_subscriber::EnvFilter::from_default_env();
    if let Ok(directive) = "relief=info".parse() {
        filter = filter.add_directive(directive);
    }
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let db_path = resolve_db_path(cli.db_path)?;
    let settings = load_settings(resolve_config_path(cli.config).as_deref())?;

    match cli.command {
        Commands::Pending { limit, json } => run_pending(limit, json, &settings, &db_path).await?,
        Commands::Changes { worksite_id, json } => {
            run_changes(worksite_id, json, &settings, &db_path).await?;
        }
        Commands::Stalled { json } => run_stalled(json, &settings, &db_path).await?,
        Commands::Retry { change_id } => run_retry(change_id, &db_path).await?,
        Commands::Worksites {
            incident_id,
            limit,
            offset,
            json,
        } => run_worksites(incident_id, limit, offset, json, &db_path).await?,
        Commands::Params { incident_id, json } => run_params(incident_id, json, &db_path).await?,
        Commands::Stats { incident_id, json } => {
            run_stats(incident_id, json, &settings, &db_path).await?;
        }
        Commands::Reset { incident_id } => run_reset(incident_id, &db_path).await?,
        Commands::Settings => run_settings(&settings)?,
    }

    Ok(())
}
