use std::env;
use std::path::{Path, PathBuf};

use relief_core::models::{
    backoff_millis, IncidentDataSyncParameters, IncidentDataSyncStats, LocalChange,
    PendingWorksite, SyncTimeMarker, WorksiteSummary,
};
use relief_core::services::DatabaseService;
use relief_core::util::{format_millis, normalize_text_option};
use relief_core::SyncSettings;
use serde::Serialize;

use crate::error::CliError;

pub fn resolve_db_path(cli_db_path: Option<PathBuf>) -> Result<PathBuf, CliError> {
    cli_db_path
        .or_else(|| env::var_os("RELIEF_DB_PATH").map(PathBuf::from))
        .or_else(default_db_path)
        .ok_or_else(|| {
            CliError::Config("Failed to resolve a data directory; pass --db-path".to_string())
        })
}

pub fn default_db_path() -> Option<PathBuf> {
    dirs::data_dir().map(|dir| dir.join("relief").join("relief.db"))
}

pub fn resolve_config_path(cli_config: Option<PathBuf>) -> Option<PathBuf> {
    cli_config
        .or_else(|| env::var_os("RELIEF_CONFIG").map(PathBuf::from))
        .or_else(|| dirs::config_dir().map(|dir| dir.join("relief").join("sync-settings.json")))
}

pub fn load_settings(path: Option<&Path>) -> Result<SyncSettings, CliError> {
    match path {
        Some(path) => Ok(SyncSettings::load_from_path(path)?),
        None => Ok(SyncSettings::default()),
    }
}

pub async fn open_database(path: &Path) -> Result<DatabaseService, CliError> {
    Ok(DatabaseService::open_path(path.to_path_buf()).await?)
}

#[derive(Debug, Serialize)]
pub struct PendingWorksiteItem {
    pub worksite_id: i64,
    pub network_id: i64,
    pub case_number: String,
    pub pending_changes: i64,
    pub oldest_change_at: String,
    pub sync_attempt: i32,
    /// When automatic retries resume, `-` when not backing off
    pub retry_after: String,
}

pub fn pending_worksite_to_item(
    worksite: &PendingWorksite,
    settings: &SyncSettings,
) -> PendingWorksiteItem {
    let delay = backoff_millis(settings.retry_delay_ms(), worksite.sync_attempt);
    let retry_after = if delay > 0 {
        worksite.last_attempt_at.saturating_add(delay)
    } else {
        0
    };
    PendingWorksiteItem {
        worksite_id: worksite.worksite_id.as_i64(),
        network_id: worksite.network_id,
        case_number: display_case_number(&worksite.case_number),
        pending_changes: worksite.pending_changes,
        oldest_change_at: format_millis(worksite.oldest_change_at),
        sync_attempt: worksite.sync_attempt,
        retry_after: format_millis(retry_after),
    }
}

pub fn format_pending_lines(items: &[PendingWorksiteItem]) -> Vec<String> {
    items
        .iter()
        .map(|item| {
            format!(
                "{:>6}  {:<10}  {} change(s)  since {}  attempts {}  retry after {}",
                item.worksite_id,
                item.case_number,
                item.pending_changes,
                item.oldest_change_at,
                item.sync_attempt,
                item.retry_after
            )
        })
        .collect()
}

#[derive(Debug, Serialize)]
pub struct ChangeItem {
    pub id: i64,
    pub worksite_id: i64,
    pub sync_uuid: String,
    pub created_at: String,
    pub save_attempt: i32,
    pub status: String,
    pub last_error: Option<String>,
}

pub fn change_status(change: &LocalChange, max_sync_tries: i32) -> String {
    if change.is_stalled(max_sync_tries) {
        "stalled".to_string()
    } else {
        change.archive_action.to_string()
    }
}

pub fn change_to_item(change: &LocalChange, max_sync_tries: i32) -> ChangeItem {
    ChangeItem {
        id: change.id,
        worksite_id: change.worksite_id.as_i64(),
        sync_uuid: change.sync_uuid.clone(),
        created_at: format_millis(change.created_at),
        save_attempt: change.save_attempt,
        status: change_status(change, max_sync_tries),
        last_error: normalize_text_option(change.last_error.clone()),
    }
}

pub fn format_change_lines(items: &[ChangeItem]) -> Vec<String> {
    items
        .iter()
        .map(|item| {
            format!(
                "{:>6}  worksite {:<6}  {:<16}  attempts {}  {}  {}",
                item.id,
                item.worksite_id,
                item.status,
                item.save_attempt,
                item.created_at,
                item.last_error.as_deref().unwrap_or("-")
            )
        })
        .collect()
}

#[derive(Debug, Serialize)]
pub struct WorksiteItem {
    pub id: i64,
    pub network_id: i64,
    pub case_number: String,
    pub name: String,
    pub address: String,
    pub key_work_type: Option<String>,
    pub status: Option<String>,
    pub is_local_modified: bool,
}

pub fn worksite_to_item(summary: &WorksiteSummary) -> WorksiteItem {
    WorksiteItem {
        id: summary.id.as_i64(),
        network_id: summary.network_id,
        case_number: display_case_number(&summary.case_number),
        name: summary.name.clone(),
        address: summary.address.clone(),
        key_work_type: normalize_text_option(summary.key_work_type.clone()),
        status: normalize_text_option(summary.key_work_type_status.clone()),
        is_local_modified: summary.is_local_modified,
    }
}

pub fn format_worksite_lines(items: &[WorksiteItem]) -> Vec<String> {
    items
        .iter()
        .map(|item| {
            format!(
                "{:>6}  {:<10}  {:<24}  {:<16}  {}{}",
                item.id,
                item.case_number,
                item.name,
                item.key_work_type.as_deref().unwrap_or("-"),
                item.address,
                if item.is_local_modified { "  *" } else { "" }
            )
        })
        .collect()
}

#[derive(Debug, Serialize)]
pub struct ParametersItem {
    pub incident_id: i64,
    pub core_before: String,
    pub core_after: String,
    pub additional_before: String,
    pub additional_after: String,
    pub bounded_region: Option<String>,
    pub bounded_synced_at: String,
}

fn format_before(marker: &SyncTimeMarker) -> String {
    if !marker.has_synced() {
        "unsynced".to_string()
    } else if marker.is_backfilled() {
        "complete".to_string()
    } else {
        format_millis(marker.before)
    }
}

pub fn parameters_to_item(parameters: &IncidentDataSyncParameters) -> ParametersItem {
    ParametersItem {
        incident_id: parameters.incident_id,
        core_before: format_before(&parameters.core),
        core_after: format_millis(parameters.core.after),
        additional_before: format_before(&parameters.additional),
        additional_after: format_millis(parameters.additional.after),
        bounded_region: parameters.bounded_region.map(|region| {
            format!(
                "{:.5},{:.5} r={}mi",
                region.latitude, region.longitude, region.radius_miles
            )
        }),
        bounded_synced_at: format_millis(parameters.bounded_synced_at),
    }
}

pub fn format_parameters_lines(items: &[ParametersItem]) -> Vec<String> {
    items
        .iter()
        .map(|item| {
            format!(
                "incident {}  core [{} .. {}]  additional [{} .. {}]  region {}",
                item.incident_id,
                item.core_before,
                item.core_after,
                item.additional_before,
                item.additional_after,
                item.bounded_region.as_deref().unwrap_or("-")
            )
        })
        .collect()
}

#[derive(Debug, Serialize)]
pub struct StatsItem {
    pub incident_id: i64,
    pub data_count: i64,
    pub paged_count: i64,
    pub sync_start: String,
    pub successful_sync: String,
    pub attempted_sync: String,
    pub attempted_counter: i32,
    pub is_outdated: bool,
}

pub fn stats_to_item(stats: &IncidentDataSyncStats, settings: &SyncSettings, now: i64) -> StatsItem {
    StatsItem {
        incident_id: stats.incident_id,
        data_count: stats.data_count,
        paged_count: stats.paged_count,
        sync_start: format_millis(stats.sync_start),
        successful_sync: format_millis(stats.successful_sync.unwrap_or(0)),
        attempted_sync: format_millis(stats.attempted_sync.unwrap_or(0)),
        attempted_counter: stats.attempted_counter,
        is_outdated: stats.is_data_version_outdated(
            settings.data_build_version,
            now,
            settings.stats_max_age_ms(),
        ),
    }
}

pub fn format_stats_lines(items: &[StatsItem]) -> Vec<String> {
    items
        .iter()
        .map(|item| {
            format!(
                "incident {}  {}/{} paged  last success {}  failures {}{}",
                item.incident_id,
                item.paged_count,
                item.data_count,
                item.successful_sync,
                item.attempted_counter,
                if item.is_outdated { "  (outdated)" } else { "" }
            )
        })
        .collect()
}

fn display_case_number(case_number: &str) -> String {
    normalize_text_option(Some(case_number.to_string())).unwrap_or_else(|| "(new)".to_string())
}
