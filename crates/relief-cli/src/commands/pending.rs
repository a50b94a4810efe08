use std::path::Path;

use relief_core::SyncSettings;

use crate::commands::common::{
    format_pending_lines, open_database, pending_worksite_to_item, PendingWorksiteItem,
};
use crate::error::CliError;

pub async fn run_pending(
    limit: usize,
    as_json: bool,
    settings: &SyncSettings,
    db_path: &Path,
) -> Result<(), CliError> {
    let db = open_database(db_path).await?;
    let pending = db
        .worksites_pending_sync(limit, settings.max_sync_tries)
        .await?;
    let items = pending
        .iter()
        .map(|worksite| pending_worksite_to_item(worksite, settings))
        .collect::<Vec<PendingWorksiteItem>>();

    if as_json {
        println!("{}", serde_json::to_string_pretty(&items)?);
        return Ok(());
    }

    if items.is_empty() {
        println!("Nothing waiting to sync.");
        return Ok(());
    }

    for line in format_pending_lines(&items) {
        println!("{line}");
    }
    Ok(())
}
