use std::path::Path;

use relief_core::util::now_millis;
use relief_core::SyncSettings;

use crate::commands::common::{
    format_parameters_lines, format_stats_lines, open_database, parameters_to_item,
    stats_to_item, ParametersItem, StatsItem,
};
use crate::error::CliError;

pub async fn run_params(
    incident_id: Option<i64>,
    as_json: bool,
    db_path: &Path,
) -> Result<(), CliError> {
    let db = open_database(db_path).await?;
    let parameters = match incident_id {
        Some(incident_id) => db.get_sync_parameters(incident_id).await?.into_iter().collect(),
        None => db.list_sync_parameters().await?,
    };
    let items = parameters
        .iter()
        .map(parameters_to_item)
        .collect::<Vec<ParametersItem>>();

    if as_json {
        println!("{}", serde_json::to_string_pretty(&items)?);
        return Ok(());
    }

    if items.is_empty() {
        println!("No incident has been pulled yet.");
        return Ok(());
    }

    for line in format_parameters_lines(&items) {
        println!("{line}");
    }
    Ok(())
}

pub async fn run_stats(
    incident_id: Option<i64>,
    as_json: bool,
    settings: &SyncSettings,
    db_path: &Path,
) -> Result<(), CliError> {
    let db = open_database(db_path).await?;
    let stats = match incident_id {
        Some(incident_id) => db.get_sync_stats(incident_id).await?.into_iter().collect(),
        None => db.list_sync_stats().await?,
    };
    let now = now_millis();
    let items = stats
        .iter()
        .map(|stats| stats_to_item(stats, settings, now))
        .collect::<Vec<StatsItem>>();

    if as_json {
        println!("{}", serde_json::to_string_pretty(&items)?);
        return Ok(());
    }

    if items.is_empty() {
        println!("No incident statistics recorded.");
        return Ok(());
    }

    for line in format_stats_lines(&items) {
        println!("{line}");
    }
    Ok(())
}

pub async fn run_reset(incident_id: i64, db_path: &Path) -> Result<(), CliError> {
    let db = open_database(db_path).await?;
    let reset = db.reset_incident(incident_id).await?;
    println!(
        "Removed {} worksites of incident {incident_id}",
        reset.deleted_worksites
    );
    if reset.retained_worksites > 0 {
        println!(
            "Kept {} worksites with unsynced changes",
            reset.retained_worksites
        );
    }
    Ok(())
}
