//! Incident model

use serde::{Deserialize, Serialize};

/// Field set requested when pulling incidents.
///
/// `Short` keeps bulk listings small; `Full` includes the form field
/// definitions needed to edit worksites.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentFieldSet {
    Short,
    Full,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncidentFormField {
    pub field_key: String,
    #[serde(default)]
    pub parent_key: Option<String>,
    #[serde(default)]
    pub html_type: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub list_order: i32,
    #[serde(default)]
    pub is_required: bool,
}

/// A disaster event grouping worksites
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Incident {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub short_name: String,
    #[serde(default)]
    pub start_at: i64,
    #[serde(default)]
    pub is_archived: bool,
    /// Present only when pulled with [`IncidentFieldSet::Full`]
    #[serde(default)]
    pub form_fields: Vec<IncidentFormField>,
}
