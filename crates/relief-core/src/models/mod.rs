//! Data models for Relief

mod geo;
mod incident;
mod incident_sync;
mod local_change;
mod lookup;
mod worksite;

pub use geo::{BoundingBox, LatLng};
pub use incident::{Incident, IncidentFieldSet, IncidentFormField};
pub use incident_sync::{
    backoff_millis, BoundedRegion, IncidentDataSyncParameters, IncidentDataSyncStats,
    SyncTimeMarker,
};
pub use local_change::{
    ChangeArchiveAction, LocalChange, PendingWorksite, SavedLocalChange, SavedWorksiteChange,
    CHANGE_MODEL_VERSION,
};
pub use lookup::{
    IncidentRef, ListModel, ListObjectLookup, ListRef, OrganizationRef, UserRef, WorksiteRef,
};
pub use worksite::{
    note_display_order, FormDataValue, LocalWorksite, NetworkFile, WorkType, WorkTypeRequest,
    Worksite, WorksiteFlag, WorksiteId, WorksiteLocalModifiedAt, WorksiteNote, WorksiteRoot,
    WorksiteSummary, UNSYNCED_NETWORK_ID,
};
