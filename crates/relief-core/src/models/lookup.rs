//! Typed lookups for objects referenced by user lists

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Kind of object a list entry references
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListModel {
    Incident,
    List,
    Organization,
    User,
    Worksite,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncidentRef {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListRef {
    pub id: i64,
    pub name: String,
    pub model: ListModel,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrganizationRef {
    pub id: i64,
    pub name: String,
    /// Organizations whose claims this organization may act on
    #[serde(default)]
    pub affiliate_ids: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRef {
    pub id: i64,
    pub first_name: String,
    pub last_name: String,
    pub organization_id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorksiteRef {
    pub network_id: i64,
    pub case_number: String,
    pub name: String,
}

/// Objects resolved for one list model, keyed by network id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "model", content = "objects", rename_all = "snake_case")]
pub enum ListObjectLookup {
    Incident(HashMap<i64, IncidentRef>),
    List(HashMap<i64, ListRef>),
    Organization(HashMap<i64, OrganizationRef>),
    User(HashMap<i64, UserRef>),
    Worksite(HashMap<i64, WorksiteRef>),
}

impl ListObjectLookup {
    /// Empty lookup for a model kind
    #[must_use]
    pub fn empty(model: ListModel) -> Self {
        match model {
            ListModel::Incident => Self::Incident(HashMap::new()),
            ListModel::List => Self::List(HashMap::new()),
            ListModel::Organization => Self::Organization(HashMap::new()),
            ListModel::User => Self::User(HashMap::new()),
            ListModel::Worksite => Self::Worksite(HashMap::new()),
        }
    }

    #[must_use]
    pub const fn model(&self) -> ListModel {
        match self {
            Self::Incident(_) => ListModel::Incident,
            Self::List(_) => ListModel::List,
            Self::Organization(_) => ListModel::Organization,
            Self::User(_) => ListModel::User,
            Self::Worksite(_) => ListModel::Worksite,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Incident(objects) => objects.len(),
            Self::List(objects) => objects.len(),
            Self::Organization(objects) => objects.len(),
            Self::User(objects) => objects.len(),
            Self::Worksite(objects) => objects.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Display name for a referenced object
    #[must_use]
    pub fn display_name(&self, id: i64) -> Option<String> {
        match self {
            Self::Incident(objects) => objects.get(&id).map(|o| o.name.clone()),
            Self::List(objects) => objects.get(&id).map(|o| o.name.clone()),
            Self::Organization(objects) => objects.get(&id).map(|o| o.name.clone()),
            Self::User(objects) => objects
                .get(&id)
                .map(|o| format!("{} {}", o.first_name, o.last_name).trim().to_string()),
            Self::Worksite(objects) => objects.get(&id).map(|o| {
                if o.name.is_empty() {
                    o.case_number.clone()
                } else {
                    format!("{} {}", o.case_number, o.name)
                }
            }),
        }
    }

    /// Affiliates of an organization, including the organization itself
    #[must_use]
    pub fn organization_affiliates(&self, organization_id: i64) -> Vec<i64> {
        let Self::Organization(objects) = self else {
            return Vec::new();
        };
        let mut ids = vec![organization_id];
        if let Some(organization) = objects.get(&organization_id) {
            ids.extend(
                organization
                    .affiliate_ids
                    .iter()
                    .copied()
                    .filter(|id| *id != organization_id),
            );
        }
        ids
    }
}
