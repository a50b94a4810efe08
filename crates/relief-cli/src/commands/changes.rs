use std::path::Path;

use relief_core::{SyncSettings, WorksiteId};

use crate::commands::common::{change_to_item, format_change_lines, open_database, ChangeItem};
use crate::error::CliError;

pub async fn run_changes(
    worksite_id: i64,
    as_json: bool,
    settings: &SyncSettings,
    db_path: &Path,
) -> Result<(), CliError> {
    let db = open_database(db_path).await?;
    let worksite_id = WorksiteId(worksite_id);
    if db.get_worksite_root(worksite_id).await?.is_none() {
        return Err(CliError::WorksiteNotFound(worksite_id.as_i64()));
    }

    let items = db
        .get_ordered_changes(worksite_id)
        .await?
        .iter()
        .map(|change| change_to_item(change, settings.max_sync_tries))
        .collect::<Vec<ChangeItem>>();
    print_changes(&items, as_json, "No changes recorded for this worksite.")
}

pub async fn run_stalled(
    as_json: bool,
    settings: &SyncSettings,
    db_path: &Path,
) -> Result<(), CliError> {
    let db = open_database(db_path).await?;
    let items = db
        .stalled_changes(settings.max_sync_tries)
        .await?
        .iter()
        .map(|change| change_to_item(change, settings.max_sync_tries))
        .collect::<Vec<ChangeItem>>();
    print_changes(&items, as_json, "No stalled changes.")
}

pub async fn run_retry(change_id: i64, db_path: &Path) -> Result<(), CliError> {
    let db = open_database(db_path).await?;
    if !db.reset_change_attempts(change_id).await? {
        return Err(CliError::ChangeNotRetryable(change_id));
    }
    println!("Change {change_id} will sync on the next pass");
    Ok(())
}

fn print_changes(items: &[ChangeItem], as_json: bool, empty_message: &str) -> Result<(), CliError> {
    if as_json {
        println!("{}", serde_json::to_string_pretty(items)?);
        return Ok(());
    }

    if items.is_empty() {
        println!("{empty_message}");
        return Ok(());
    }

    for line in format_change_lines(items) {
        println!("{line}");
    }
    Ok(())
}
