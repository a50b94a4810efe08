use std::path::Path;

use crate::commands::common::{format_worksite_lines, open_database, worksite_to_item, WorksiteItem};
use crate::error::CliError;

pub async fn run_worksites(
    incident_id: i64,
    limit: usize,
    offset: usize,
    as_json: bool,
    db_path: &Path,
) -> Result<(), CliError> {
    let db = open_database(db_path).await?;
    let summaries = db
        .list_worksite_summaries(incident_id, limit, offset)
        .await?;
    let items = summaries
        .iter()
        .map(worksite_to_item)
        .collect::<Vec<WorksiteItem>>();

    if as_json {
        println!("{}", serde_json::to_string_pretty(&items)?);
        return Ok(());
    }

    let total = db.count_incident_worksites(incident_id).await?;
    for line in format_worksite_lines(&items) {
        println!("{line}");
    }
    println!("{} of {total} worksites", items.len());
    Ok(())
}
