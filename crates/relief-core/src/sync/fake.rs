//! In-memory network fakes for sync engine tests.
//!
//! Built for unit tests and, with the `test-util` feature, for integration
//! tests and downstream crates driving the engine without a server.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use crate::models::{
    BoundingBox, Incident, IncidentFieldSet, LatLng, ListModel, ListObjectLookup, Worksite,
};

use super::network::{
    AccountData, AccountDataSource, ChangeOutcome, ChangeResult, ChangeSyncRequest,
    ChangeSyncResult, ConnectivityMonitor, NetworkError, SyncIdMapping, WorksiteNetwork,
    WorksitePageQuery,
};

#[derive(Default)]
struct ServerState {
    worksites: BTreeMap<i64, Worksite>,
    incidents: HashMap<i64, Incident>,
    next_id: i64,
    clock: i64,
    request_error: Option<NetworkError>,
    fetch_error: Option<NetworkError>,
    change_failures: HashMap<i64, NetworkError>,
    requests: Vec<ChangeSyncRequest>,
    page_queries: Vec<WorksitePageQuery>,
}

impl ServerState {
    fn allocate_id(&mut self) -> i64 {
        self.next_id += 1;
        1_000 + self.next_id
    }

    fn tick(&mut self) -> i64 {
        self.clock += 1;
        10_000 + self.clock
    }
}

/// Server that replays change snapshots into its own worksite table
#[derive(Default)]
pub struct FakeNetwork {
    state: Mutex<ServerState>,
}

impl FakeNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store a worksite as if another client created it; returns its network id
    pub fn insert_worksite(&self, mut worksite: Worksite) -> i64 {
        let mut state = self.state();
        if worksite.network_id <= 0 {
            worksite.network_id = state.allocate_id();
        }
        if worksite.updated_at.is_none() {
            worksite.updated_at = Some(state.tick());
        }
        let network_id = worksite.network_id;
        state.worksites.insert(network_id, worksite);
        network_id
    }

    /// Apply an edit made by another organization
    pub fn edit_worksite(&self, network_id: i64, edit: impl FnOnce(&mut Worksite)) {
        let mut state = self.state();
        let updated_at = state.tick();
        if let Some(worksite) = state.worksites.get_mut(&network_id) {
            edit(worksite);
            worksite.updated_at = Some(updated_at);
        }
    }

    pub fn insert_incident(&self, incident: Incident) {
        self.state()
            .incidents
            .insert(incident.id, incident);
    }

    pub fn server_worksite(&self, network_id: i64) -> Option<Worksite> {
        self.state().worksites.get(&network_id).cloned()
    }

    /// Fail every change submission with `error`
    pub fn fail_requests(&self, error: Option<NetworkError>) {
        self.state().request_error = error;
    }

    /// Fail every request with [`NetworkError::NoConnection`] while offline
    pub fn set_offline(&self, offline: bool) {
        let error = offline.then_some(NetworkError::NoConnection);
        let mut state = self.state();
        state.request_error.clone_from(&error);
        state.fetch_error = error;
    }

    /// Fail every worksite read with `error`
    pub fn fail_fetches(&self, error: Option<NetworkError>) {
        self.state().fetch_error = error;
    }

    /// Reject one change with `error`
    pub fn fail_change(&self, change_id: i64, error: NetworkError) {
        self.state()
            .change_failures
            .insert(change_id, error);
    }

    pub fn requests(&self) -> Vec<ChangeSyncRequest> {
        self.state().requests.clone()
    }

    pub fn page_queries(&self) -> Vec<WorksitePageQuery> {
        self.state().page_queries.clone()
    }

    fn check_fetch(&self) -> Result<(), NetworkError> {
        match &self.state().fetch_error {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }
}

fn updated_at(worksite: &Worksite) -> i64 {
    worksite.updated_at.unwrap_or(0)
}

/// Give every unsynced child of `worksite` a network id, recording the mapping
fn assign_child_ids(state: &mut ServerState, worksite: &mut Worksite, mapping: &mut SyncIdMapping) {
    for work_type in &mut worksite.work_types {
        if work_type.network_id <= 0 {
            work_type.network_id = state.allocate_id();
            mapping.work_type_ids.insert(work_type.id, work_type.network_id);
        }
        work_type.id = 0;
    }
    for flag in &mut worksite.flags {
        if flag.network_id <= 0 {
            flag.network_id = state.allocate_id();
            mapping.flag_ids.insert(flag.id, flag.network_id);
        }
        flag.id = 0;
    }
    for note in &mut worksite.notes {
        if note.network_id <= 0 {
            note.network_id = state.allocate_id();
            mapping.note_ids.insert(note.id, note.network_id);
        }
        note.id = 0;
    }
    for request in &mut worksite.work_type_requests {
        if request.network_id <= 0 {
            request.network_id = state.allocate_id();
            mapping
                .work_type_request_ids
                .insert(request.id, request.network_id);
        }
        request.id = 0;
    }
    if let Some(key) = worksite.key_work_type.as_mut() {
        if let Some(matching) = worksite
            .work_types
            .iter()
            .find(|work_type| work_type.work_type == key.work_type)
        {
            *key = matching.clone();
        }
    }
}

#[async_trait]
impl WorksiteNetwork for FakeNetwork {
    async fn get_incident(
        &self,
        incident_id: i64,
        fields: IncidentFieldSet,
    ) -> Result<Incident, NetworkError> {
        let state = self.state();
        let mut incident = state
            .incidents
            .get(&incident_id)
            .cloned()
            .ok_or_else(|| NetworkError::Status {
                code: 404,
                message: format!("incident {incident_id}"),
            })?;
        if fields == IncidentFieldSet::Short {
            incident.form_fields.clear();
        }
        Ok(incident)
    }

    async fn count_worksites(
        &self,
        incident_id: i64,
        updated_after: i64,
    ) -> Result<i64, NetworkError> {
        self.check_fetch()?;
        let state = self.state();
        let count = state
            .worksites
            .values()
            .filter(|worksite| worksite.incident_id == incident_id)
            .filter(|worksite| updated_at(worksite) >= updated_after)
            .count();
        Ok(i64::try_from(count).unwrap_or(i64::MAX))
    }

    async fn get_worksite(&self, network_id: i64) -> Result<Option<Worksite>, NetworkError> {
        self.check_fetch()?;
        Ok(self.server_worksite(network_id))
    }

    async fn get_worksites_page(
        &self,
        query: &WorksitePageQuery,
    ) -> Result<Vec<Worksite>, NetworkError> {
        self.check_fetch()?;
        let mut state = self.state();
        state.page_queries.push(query.clone());

        let mut worksites: Vec<Worksite> = state
            .worksites
            .values()
            .filter(|worksite| worksite.incident_id == query.incident_id)
            .filter(|worksite| query.includes(updated_at(worksite), worksite.network_id))
            .cloned()
            .collect();
        worksites.sort_by_key(|worksite| (updated_at(worksite), worksite.network_id));
        if query.is_backward() {
            worksites.reverse();
        }
        worksites.truncate(query.limit as usize);
        Ok(worksites)
    }

    async fn get_worksites_in_bounds(
        &self,
        incident_id: i64,
        bounds: &BoundingBox,
    ) -> Result<Vec<Worksite>, NetworkError> {
        self.check_fetch()?;
        let state = self.state();
        Ok(state
            .worksites
            .values()
            .filter(|worksite| worksite.incident_id == incident_id)
            .filter(|worksite| bounds.contains(LatLng::new(worksite.latitude, worksite.longitude)))
            .cloned()
            .collect())
    }

    async fn sync_worksite_changes(
        &self,
        request: &ChangeSyncRequest,
    ) -> Result<ChangeSyncResult, NetworkError> {
        let mut state = self.state();
        state.requests.push(request.clone());
        if let Some(error) = state.request_error.clone() {
            return Err(error);
        }

        let mut result = ChangeSyncResult::default();
        let mut network_id = request.worksite_network_id;
        for change in &request.changes {
            if let Some(error) = state.change_failures.get(&change.id).cloned() {
                result.change_results.push(ChangeResult {
                    change_id: change.id,
                    outcome: ChangeOutcome::Failed(error),
                });
                continue;
            }
            let Ok(saved) = change.decode() else {
                result.change_results.push(ChangeResult {
                    change_id: change.id,
                    outcome: ChangeOutcome::Failed(NetworkError::Decode(
                        "unreadable change".to_string(),
                    )),
                });
                continue;
            };

            if network_id <= 0 {
                network_id = state.allocate_id();
                result.id_mapping.worksite_network_id = Some(network_id);
            }

            let mut worksite = saved.change;
            worksite.id = crate::models::WorksiteId::UNSAVED;
            worksite.network_id = network_id;
            if let Some(existing) = state.worksites.get(&network_id) {
                if worksite.case_number.is_empty() {
                    worksite.case_number.clone_from(&existing.case_number);
                }
            } else if worksite.case_number.is_empty() {
                worksite.case_number = format!("V{network_id}");
            }
            let mut mapping = std::mem::take(&mut result.id_mapping);
            assign_child_ids(&mut state, &mut worksite, &mut mapping);
            result.id_mapping = mapping;
            worksite.updated_at = Some(state.tick());
            state.worksites.insert(network_id, worksite);

            result.change_results.push(ChangeResult {
                change_id: change.id,
                outcome: ChangeOutcome::Synced,
            });
        }
        Ok(result)
    }

    async fn lookup_list_objects(
        &self,
        model: ListModel,
        _ids: &[i64],
    ) -> Result<ListObjectLookup, NetworkError> {
        Ok(ListObjectLookup::empty(model))
    }
}

/// Connectivity switch
pub struct FakeConnectivity(AtomicBool);

impl FakeConnectivity {
    pub const fn online() -> Self {
        Self(AtomicBool::new(true))
    }

    pub fn set_online(&self, online: bool) {
        self.0.store(online, Ordering::SeqCst);
    }
}

impl ConnectivityMonitor for FakeConnectivity {
    fn is_online(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Account holder with a swappable account
pub struct FakeAccount(Mutex<Option<AccountData>>);

impl FakeAccount {
    pub fn signed_in() -> Self {
        Self(Mutex::new(Some(AccountData {
            user_id: 1,
            organization_id: 5,
            organization_name: "Relief Org".to_string(),
            token_expiry: i64::MAX,
            affiliate_organization_ids: vec![5, 6],
        })))
    }

    pub fn set(&self, account: Option<AccountData>) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = account;
    }
}

#[async_trait]
impl AccountDataSource for FakeAccount {
    async fn account(&self) -> Option<AccountData> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}
