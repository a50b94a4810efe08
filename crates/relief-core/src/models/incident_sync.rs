//! Per-incident sync bookkeeping models

use serde::{Deserialize, Serialize};

use super::geo::{BoundingBox, LatLng};

/// Largest exponent applied to retry delays
const MAX_BACKOFF_EXPONENT: i32 = 6;

/// Exponential backoff in milliseconds after `attempts` consecutive failures.
///
/// Zero attempts means no backoff.
pub fn backoff_millis(retry_delay_ms: i64, attempts: i32) -> i64 {
    if attempts <= 0 {
        return 0;
    }
    let exponent = (attempts - 1).clamp(0, MAX_BACKOFF_EXPONENT);
    retry_delay_ms.saturating_mul(1_i64 << exponent)
}

/// A time window of pulled data.
///
/// Records updated in `[before, after]` are cached locally. Pulling older
/// pages moves `before` backward; pulling deltas moves `after` forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncTimeMarker {
    pub before: i64,
    pub after: i64,
}

impl SyncTimeMarker {
    /// `before` of a window that has not pulled anything yet
    pub const UNSYNCED_BEFORE: i64 = i64::MAX;

    /// Window of an incident that has never synced
    pub const UNSYNCED: Self = Self {
        before: Self::UNSYNCED_BEFORE,
        after: 0,
    };

    /// Whether any page was pulled into this window
    #[must_use]
    pub const fn has_synced(&self) -> bool {
        self.before != Self::UNSYNCED_BEFORE
    }

    /// Whether the full history has been pulled, leaving only deltas
    #[must_use]
    pub const fn is_backfilled(&self) -> bool {
        self.before <= 0
    }
}

impl Default for SyncTimeMarker {
    fn default() -> Self {
        Self::UNSYNCED
    }
}

/// Geographic cache scope around a point
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundedRegion {
    pub latitude: f64,
    pub longitude: f64,
    pub radius_miles: f64,
}

impl BoundedRegion {
    #[must_use]
    pub const fn center(&self) -> LatLng {
        LatLng {
            latitude: self.latitude,
            longitude: self.longitude,
        }
    }

    /// Box enclosing the region
    #[must_use]
    pub fn bounding_box(&self) -> BoundingBox {
        BoundingBox::around(self.center(), self.radius_miles)
    }
}

/// Cursor state for pulling one incident's worksites.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncidentDataSyncParameters {
    pub incident_id: i64,
    /// Window of short (list/map) field data
    pub core: SyncTimeMarker,
    /// Window of full field data (form data, notes, files)
    pub additional: SyncTimeMarker,
    pub bounded_region: Option<BoundedRegion>,
    pub bounded_synced_at: i64,
}

impl IncidentDataSyncParameters {
    /// Parameters of an incident that has never synced
    #[must_use]
    pub const fn new(incident_id: i64) -> Self {
        Self {
            incident_id,
            core: SyncTimeMarker::UNSYNCED,
            additional: SyncTimeMarker::UNSYNCED,
            bounded_region: None,
            bounded_synced_at: 0,
        }
    }

    /// Whether a bounded region cached within `max_age_ms` of `now` still
    /// covers `region`.
    #[must_use]
    pub fn is_bounded_region_cached(&self, region: &BoundedRegion, now: i64, max_age_ms: i64) -> bool {
        self.bounded_synced_at > 0
            && now.saturating_sub(self.bounded_synced_at) <= max_age_ms
            && self.bounded_region.is_some_and(|cached| {
                cached.radius_miles >= region.radius_miles
                    && cached.center().distance_miles(region.center())
                        <= cached.radius_miles - region.radius_miles
            })
    }
}

/// Progress statistics for pulling one incident.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncidentDataSyncStats {
    pub incident_id: i64,
    /// Unix ms when the current pull cycle started
    pub sync_start: i64,
    /// Number of worksites the server reports for the incident
    pub data_count: i64,
    pub paged_count: i64,
    pub successful_sync: Option<i64>,
    pub attempted_sync: Option<i64>,
    /// Consecutive failed attempts
    pub attempted_counter: i32,
    pub app_build_version_code: i64,
}

impl IncidentDataSyncStats {
    #[must_use]
    pub const fn new(incident_id: i64, sync_start: i64, data_count: i64, app_build_version_code: i64) -> Self {
        Self {
            incident_id,
            sync_start,
            data_count,
            paged_count: 0,
            successful_sync: None,
            attempted_sync: None,
            attempted_counter: 0,
            app_build_version_code,
        }
    }

    /// Whether the cached stats were written by a build with an older data
    /// format or are older than `max_age_ms`.
    #[must_use]
    pub const fn is_data_version_outdated(
        &self,
        data_build_version: i64,
        now: i64,
        max_age_ms: i64,
    ) -> bool {
        self.app_build_version_code < data_build_version
            || now.saturating_sub(self.sync_start) > max_age_ms
    }

    #[must_use]
    pub const fn is_paging_complete(&self) -> bool {
        self.paged_count >= self.data_count
    }

    /// Whether a background pull is due.
    ///
    /// After failures the retry delay backs off exponentially; after a
    /// success the next passive pull waits `passive_interval_ms`.
    #[must_use]
    pub fn should_sync_passively(
        &self,
        now: i64,
        passive_interval_ms: i64,
        retry_delay_ms: i64,
    ) -> bool {
        if self.attempted_counter > 0 {
            let last_attempt = self.attempted_sync.unwrap_or(0);
            return now.saturating_sub(last_attempt)
                >= backoff_millis(retry_delay_ms, self.attempted_counter);
        }
        self.successful_sync
            .map_or(true, |last| now.saturating_sub(last) >= passive_interval_ms)
    }

    /// Stats after a successful pull at `now`
    #[must_use]
    pub fn with_success(&self, now: i64, paged_count: i64) -> Self {
        Self {
            paged_count,
            successful_sync: Some(now),
            attempted_sync: Some(now),
            attempted_counter: 0,
            ..self.clone()
        }
    }

    /// Stats after a failed pull at `now`
    #[must_use]
    pub fn with_failure(&self, now: i64) -> Self {
        Self {
            attempted_sync: Some(now),
            attempted_counter: self.attempted_counter.saturating_add(1),
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINUTE: i64 = 60_000;

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        assert_eq!(backoff_millis(1000, 0), 0);
        assert_eq!(backoff_millis(1000, 1), 1000);
        assert_eq!(backoff_millis(1000, 2), 2000);
        assert_eq!(backoff_millis(1000, 3), 4000);
        assert_eq!(backoff_millis(1000, 50), backoff_millis(1000, 7));
    }

    #[test]
    fn test_unsynced_marker() {
        let marker = SyncTimeMarker::default();
        assert!(!marker.has_synced());
        assert!(!marker.is_backfilled());

        let backfilled = SyncTimeMarker { before: 0, after: 10 };
        assert!(backfilled.has_synced());
        assert!(backfilled.is_backfilled());
    }

    #[test]
    fn test_never_synced_stats_sync_passively() {
        let stats = IncidentDataSyncStats::new(1, 0, 10, 1);
        assert!(stats.should_sync_passively(5, 30 * MINUTE, 3 * MINUTE));
    }

    #[test]
    fn test_recent_success_skips_passive_sync() {
        let now = 100 * MINUTE;
        let stats = IncidentDataSyncStats::new(1, 0, 10, 1).with_success(now - MINUTE, 10);
        assert!(!stats.should_sync_passively(now, 30 * MINUTE, 3 * MINUTE));
        assert!(stats.should_sync_passively(now + 30 * MINUTE, 30 * MINUTE, 3 * MINUTE));
    }

    #[test]
    fn test_failures_back_off() {
        let start = 100 * MINUTE;
        let stats = IncidentDataSyncStats::new(1, 0, 10, 1)
            .with_failure(start)
            .with_failure(start);
        assert_eq!(stats.attempted_counter, 2);
        assert!(!stats.should_sync_passively(start + 5 * MINUTE, 30 * MINUTE, 3 * MINUTE));
        assert!(stats.should_sync_passively(start + 6 * MINUTE, 30 * MINUTE, 3 * MINUTE));
    }

    #[test]
    fn test_data_version_outdated() {
        let stats = IncidentDataSyncStats::new(1, 1_000, 10, 5);
        assert!(stats.is_data_version_outdated(6, 1_000, MINUTE));
        assert!(!stats.is_data_version_outdated(5, 1_000, MINUTE));
        assert!(stats.is_data_version_outdated(5, 1_000 + 2 * MINUTE, MINUTE));
    }

    #[test]
    fn test_bounded_region_cached_when_contained() {
        let mut parameters = IncidentDataSyncParameters::new(1);
        let region = BoundedRegion {
            latitude: 30.0,
            longitude: -90.0,
            radius_miles: 5.0,
        };
        assert!(!parameters.is_bounded_region_cached(&region, 20, MINUTE));

        parameters.bounded_region = Some(BoundedRegion {
            radius_miles: 20.0,
            ..region
        });
        parameters.bounded_synced_at = 10;
        assert!(parameters.is_bounded_region_cached(&region, 20, MINUTE));

        let far = BoundedRegion {
            latitude: 35.0,
            ..region
        };
        assert!(!parameters.is_bounded_region_cached(&far, 20, MINUTE));
    }

    #[test]
    fn test_bounded_region_cache_expires() {
        let region = BoundedRegion {
            latitude: 30.0,
            longitude: -90.0,
            radius_miles: 5.0,
        };
        let parameters = IncidentDataSyncParameters {
            bounded_region: Some(region),
            bounded_synced_at: 1_000,
            ..IncidentDataSyncParameters::new(1)
        };
        assert!(parameters.is_bounded_region_cached(&region, 1_000 + MINUTE, MINUTE));
        assert!(!parameters.is_bounded_region_cached(&region, 1_001 + MINUTE, MINUTE));
    }
}
