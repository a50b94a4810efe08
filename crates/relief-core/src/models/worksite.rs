//! Worksite model

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Network id of a record the server has not assigned an id to yet.
pub const UNSYNCED_NETWORK_ID: i64 = -1;

/// Local identifier of a worksite, assigned by the local store.
///
/// Stable for the lifetime of the local record. `WorksiteId(0)` denotes a
/// worksite that has not been saved locally yet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WorksiteId(pub i64);

impl WorksiteId {
    /// Id of a worksite that was never written to the local store
    pub const UNSAVED: Self = Self(0);

    /// Get the raw integer value
    #[must_use]
    pub const fn as_i64(self) -> i64 {
        self.0
    }

    /// Whether the worksite exists in the local store
    #[must_use]
    pub const fn is_saved(self) -> bool {
        self.0 > 0
    }
}

impl fmt::Display for WorksiteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for WorksiteId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

/// Sync bookkeeping for one local worksite.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorksiteRoot {
    pub id: WorksiteId,
    pub network_id: i64,
    pub incident_id: i64,
    pub is_local_modified: bool,
    /// Unix ms of the last local edit (or last network write)
    pub local_modified_at: i64,
    /// Unix ms of the last write sourced from the server
    pub synced_at: i64,
    pub sync_attempt: i32,
    /// Non-empty only for worksites created offline and not yet matched
    pub local_global_uuid: String,
}

impl WorksiteRoot {
    /// Whether the server knows this worksite
    #[must_use]
    pub const fn has_network_id(&self) -> bool {
        self.network_id > 0
    }
}

/// The local modification stamp read before a guarded network update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorksiteLocalModifiedAt {
    pub id: WorksiteId,
    pub network_id: i64,
    pub local_modified_at: i64,
    pub is_local_modified: bool,
}

/// A unit of work at a worksite with its own claim/status lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkType {
    #[serde(default)]
    pub id: i64,
    #[serde(default = "unsynced_network_id")]
    pub network_id: i64,
    #[serde(default)]
    pub created_at: Option<i64>,
    /// Organization that claimed this work type
    #[serde(default)]
    pub org_claim: Option<i64>,
    #[serde(default)]
    pub next_recur_at: Option<i64>,
    #[serde(default)]
    pub phase: Option<i32>,
    #[serde(default)]
    pub recur: Option<String>,
    pub status: String,
    pub work_type: String,
}

impl WorkType {
    /// Create an unsynced work type
    pub fn new(work_type: impl Into<String>, status: impl Into<String>) -> Self {
        Self {
            id: 0,
            network_id: UNSYNCED_NETWORK_ID,
            created_at: None,
            org_claim: None,
            next_recur_at: None,
            phase: None,
            recur: None,
            status: status.into(),
            work_type: work_type.into(),
        }
    }

    #[must_use]
    pub const fn is_claimed(&self) -> bool {
        self.org_claim.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorksiteFlag {
    #[serde(default)]
    pub id: i64,
    #[serde(default = "unsynced_network_id")]
    pub network_id: i64,
    #[serde(default)]
    pub action: Option<String>,
    pub created_at: i64,
    #[serde(default)]
    pub is_high_priority: bool,
    #[serde(default)]
    pub notes: String,
    /// Natural key within a worksite
    pub reason: String,
    #[serde(default)]
    pub requested_action: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorksiteNote {
    #[serde(default)]
    pub id: i64,
    #[serde(default = "unsynced_network_id")]
    pub network_id: i64,
    pub created_at: i64,
    #[serde(default)]
    pub is_survivor: bool,
    pub note: String,
}

impl WorksiteNote {
    /// Create a local-only note
    pub fn new(note: impl Into<String>, created_at: i64) -> Self {
        Self {
            id: 0,
            network_id: UNSYNCED_NETWORK_ID,
            created_at,
            is_survivor: false,
            note: note.into(),
        }
    }

    #[must_use]
    pub const fn is_local_only(&self) -> bool {
        self.network_id < 0
    }
}

/// Display order for notes, newest first.
///
/// Local-only notes sort before every synced note. Synced notes sort by
/// network id descending. Remaining ties break by creation time descending.
pub fn note_display_order(a: &WorksiteNote, b: &WorksiteNote) -> Ordering {
    match (a.is_local_only(), b.is_local_only()) {
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (true, true) => b.created_at.cmp(&a.created_at),
        (false, false) => b
            .network_id
            .cmp(&a.network_id)
            .then_with(|| b.created_at.cmp(&a.created_at)),
    }
}

/// A single form field value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormDataValue {
    #[serde(default)]
    pub is_boolean: bool,
    #[serde(default)]
    pub value_string: String,
    #[serde(default)]
    pub value_bool: bool,
}

impl FormDataValue {
    pub fn text(value: impl Into<String>) -> Self {
        Self {
            is_boolean: false,
            value_string: value.into(),
            value_bool: false,
        }
    }

    pub const fn boolean(value: bool) -> Self {
        Self {
            is_boolean: true,
            value_string: String::new(),
            value_bool: value,
        }
    }
}

/// Request from one organization to transfer a claimed work type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkTypeRequest {
    #[serde(default)]
    pub id: i64,
    #[serde(default = "unsynced_network_id")]
    pub network_id: i64,
    pub work_type: String,
    #[serde(default)]
    pub reason: String,
    pub by_org: i64,
    pub to_org: i64,
    pub created_at: i64,
    #[serde(default)]
    pub approved_at: Option<i64>,
    #[serde(default)]
    pub rejected_at: Option<i64>,
    #[serde(default)]
    pub approved_rejected_reason: String,
}

/// File metadata known to the server and associated with a worksite
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkFile {
    pub network_id: i64,
    pub created_at: i64,
    pub file_id: i64,
    #[serde(default)]
    pub file_type: String,
    #[serde(default)]
    pub full_url: Option<String>,
    #[serde(default)]
    pub large_thumbnail_url: Option<String>,
    #[serde(default)]
    pub mime_content_type: String,
    #[serde(default)]
    pub small_thumbnail_url: Option<String>,
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    pub url: String,
}

/// A disaster-relief case: core fields plus child collections.
///
/// The same shape serves as a server snapshot (ids are network ids, local ids
/// are zero) and as the locally edited state captured in the change log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Worksite {
    #[serde(default)]
    pub id: WorksiteId,
    #[serde(default = "unsynced_network_id")]
    pub network_id: i64,
    pub incident_id: i64,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub auto_contact_frequency: String,
    #[serde(default)]
    pub case_number: String,
    #[serde(default)]
    pub city: String,
    #[serde(default)]
    pub county: String,
    #[serde(default)]
    pub created_at: Option<i64>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub favorite_id: Option<i64>,
    #[serde(default)]
    pub is_assigned_to_org_member: bool,
    /// Denormalized work type used for map and list rendering
    #[serde(default)]
    pub key_work_type: Option<WorkType>,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub phone1: String,
    #[serde(default)]
    pub phone2: Option<String>,
    #[serde(default)]
    pub plus_code: Option<String>,
    #[serde(default)]
    pub postal_code: String,
    #[serde(default)]
    pub reported_by: Option<i64>,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub svi: Option<f64>,
    #[serde(default)]
    pub updated_at: Option<i64>,
    #[serde(default)]
    pub what3words: Option<String>,
    #[serde(default)]
    pub work_types: Vec<WorkType>,
    #[serde(default)]
    pub flags: Vec<WorksiteFlag>,
    #[serde(default)]
    pub notes: Vec<WorksiteNote>,
    #[serde(default)]
    pub form_data: BTreeMap<String, FormDataValue>,
    #[serde(default)]
    pub work_type_requests: Vec<WorkTypeRequest>,
    #[serde(default)]
    pub files: Vec<NetworkFile>,
}

impl Worksite {
    /// Create an empty, unsaved worksite in an incident
    #[must_use]
    pub fn new(incident_id: i64, latitude: f64, longitude: f64) -> Self {
        Self {
            id: WorksiteId::UNSAVED,
            network_id: UNSYNCED_NETWORK_ID,
            incident_id,
            address: String::new(),
            auto_contact_frequency: String::new(),
            case_number: String::new(),
            city: String::new(),
            county: String::new(),
            created_at: None,
            email: None,
            favorite_id: None,
            is_assigned_to_org_member: false,
            key_work_type: None,
            latitude,
            longitude,
            name: String::new(),
            phone1: String::new(),
            phone2: None,
            plus_code: None,
            postal_code: String::new(),
            reported_by: None,
            state: String::new(),
            svi: None,
            updated_at: None,
            what3words: None,
            work_types: Vec::new(),
            flags: Vec::new(),
            notes: Vec::new(),
            form_data: BTreeMap::new(),
            work_type_requests: Vec::new(),
            files: Vec::new(),
        }
    }

    /// Whether the server knows this worksite
    #[must_use]
    pub const fn has_network_id(&self) -> bool {
        self.network_id > 0
    }

    /// Notes sorted for display
    #[must_use]
    pub fn sorted_notes(&self) -> Vec<WorksiteNote> {
        let mut notes = self.notes.clone();
        notes.sort_by(note_display_order);
        notes
    }

    /// Whether any child row has not been assigned a network id yet
    #[must_use]
    pub fn has_unsynced_children(&self) -> bool {
        self.work_types.iter().any(|work_type| work_type.network_id < 0)
            || self.flags.iter().any(|flag| flag.network_id < 0)
            || self.notes.iter().any(WorksiteNote::is_local_only)
    }
}

/// A worksite together with its sync bookkeeping, as read from the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalWorksite {
    pub root: WorksiteRoot,
    pub worksite: Worksite,
}

/// Compact row used for lists and map markers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorksiteSummary {
    pub id: WorksiteId,
    pub network_id: i64,
    pub incident_id: i64,
    pub case_number: String,
    pub name: String,
    pub address: String,
    pub latitude: f64,
    pub longitude: f64,
    pub key_work_type: Option<String>,
    pub key_work_type_status: Option<String>,
    pub is_local_modified: bool,
}

const fn unsynced_network_id() -> i64 {
    UNSYNCED_NETWORK_ID
}
