//! Sync engine configuration.
//!
//! `SyncSettings` carries the tunables of the sync engine: retry limits,
//! paging, passive sync intervals, data freshness, and bounded region
//! caching. Every field has a default so partial JSON files are accepted.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Number of upload attempts before a change stops syncing automatically
pub const MAX_SYNC_TRIES: i32 = 3;

const DAY_SECS: u64 = 24 * 60 * 60;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct SyncSettings {
    /// Failed uploads tolerated before a change is stalled
    pub max_sync_tries: i32,
    /// Worksites requested per network page
    pub page_size: u32,
    /// Minimum time between passive pulls of the same incident
    pub passive_sync_interval_secs: u64,
    /// Base delay of the exponential retry backoff
    pub retry_delay_secs: u64,
    /// Age after which cached incident stats are re-queried
    pub stats_max_age_secs: u64,
    /// Stats written by builds older than this are outdated
    pub data_build_version: i64,
    /// Build version recorded into new stats
    pub app_build_version: i64,
    pub is_bounded_sync_enabled: bool,
    pub bounded_region_radius_miles: f64,
    /// Age after which a cached bounded region is pulled again
    pub bounded_region_max_age_secs: u64,
    /// Cells per side of the grid used for nearest-worksite scans
    pub bounded_grid_divisions: u32,
    /// Timeout applied to each network call
    pub network_timeout_secs: u64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            max_sync_tries: MAX_SYNC_TRIES,
            page_size: 200,
            passive_sync_interval_secs: 30 * 60,
            retry_delay_secs: 3 * 60,
            stats_max_age_secs: 7 * DAY_SECS,
            data_build_version: 1,
            app_build_version: 1,
            is_bounded_sync_enabled: true,
            bounded_region_radius_miles: 15.0,
            bounded_region_max_age_secs: 30 * 60,
            bounded_grid_divisions: 8,
            network_timeout_secs: 30,
        }
    }
}

impl SyncSettings {
    /// Load settings from a JSON file, using defaults when it does not exist.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!("No sync settings at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        parse_sync_settings(&raw)
    }

    pub const fn network_timeout(&self) -> Duration {
        Duration::from_secs(self.network_timeout_secs)
    }

    pub fn passive_sync_interval_ms(&self) -> i64 {
        secs_to_millis(self.passive_sync_interval_secs)
    }

    pub fn retry_delay_ms(&self) -> i64 {
        secs_to_millis(self.retry_delay_secs)
    }

    pub fn stats_max_age_ms(&self) -> i64 {
        secs_to_millis(self.stats_max_age_secs)
    }

    pub fn bounded_region_max_age_ms(&self) -> i64 {
        secs_to_millis(self.bounded_region_max_age_secs)
    }

    fn validate(self) -> Result<Self> {
        if self.max_sync_tries < 1 {
            return Err(Error::InvalidInput(
                "max_sync_tries must be at least 1".to_string(),
            ));
        }
        if self.page_size == 0 {
            return Err(Error::InvalidInput("page_size must be at least 1".to_string()));
        }
        if self.bounded_region_radius_miles.is_nan() || self.bounded_region_radius_miles <= 0.0 {
            return Err(Error::InvalidInput(
                "bounded_region_radius_miles must be positive".to_string(),
            ));
        }
        if self.bounded_grid_divisions == 0 {
            return Err(Error::InvalidInput(
                "bounded_grid_divisions must be at least 1".to_string(),
            ));
        }
        Ok(self)
    }
}

/// Parse and validate settings from a JSON payload.
pub fn parse_sync_settings(payload: &str) -> Result<SyncSettings> {
    let settings: SyncSettings = serde_json::from_str(payload)
        .map_err(|error| Error::InvalidInput(format!("invalid sync settings JSON: {error}")))?;
    settings.validate()
}

fn secs_to_millis(secs: u64) -> i64 {
    i64::try_from(secs.saturating_mul(1000)).unwrap_or(i64::MAX)
}
