/*
 * Copyright (C) 2024 The Direct CSI Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! Volume scheduler: filters candidate drives for a create request, picks
//! one, and records the binding. Allocation and volume creation happen in
//! one conflict-retried cycle; losing the race re-runs the whole pipeline
//! against fresh state.

use crate::directcsi::apis::convert::STORAGE_VERSION;
use crate::directcsi::apis::v1beta2::{AccessTier, DirectCsiDrive, DirectCsiVolume, DriveStatus};
use crate::directcsi::apis::{
    is_condition_true, set_condition, ConditionStatus, FINALIZER_DRIVE_IN_USE,
    FINALIZER_PUBLISHED_AT_PREFIX, FINALIZER_VOLUME_PROTECTION, REASON_NOT_IN_USE,
    VOLUME_CONDITION_PUBLISHED, VOLUME_CONDITION_READY, VOLUME_CONDITION_STAGED,
};
use crate::directcsi::client::{ObjectStore, VOLUMES_PREFIX};
use crate::directcsi::csi::types::{
    CreateVolumeRequest, CreateVolumeResponse, CsiError, DeleteVolumeRequest, Topology,
    TopologyRequirement, Volume, PARAMETER_ACCESS_TIER,
};
use crate::directcsi::listener::{Listener, ListenerContext};
use crate::directcsi::logger::{log_info, log_warn};
use crate::directcsi::util::error::{is_conflict_error, is_not_found_error, new_error};

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashSet;
use std::error::Error;

type DynError = Box<dyn Error + Send + Sync>;

const COMPONENT: &str = "controller";
const SCHEDULE_RETRY_BUDGET: usize = 5;
const INSUFFICIENT_CAPACITY_MARKER: &str = "no longer has enough free capacity";

pub struct ControllerServer {
    store: ObjectStore,
}

impl ControllerServer {
    pub fn new(store: ObjectStore) -> Self {
        Self { store }
    }

    pub async fn create_volume(
        &self,
        request: &CreateVolumeRequest,
    ) -> Result<CreateVolumeResponse, CsiError> {
        if request.name.is_empty() {
            return Err(CsiError::invalid_argument("volume name missing in request"));
        }
        let required = request
            .capacity_range
            .as_ref()
            .and_then(|range| range.required_bytes)
            .filter(|bytes| *bytes > 0)
            .ok_or_else(|| {
                CsiError::invalid_argument("requiredBytes missing or zero in request")
            })?;
        let fs_type = request
            .volume_capabilities
            .first()
            .and_then(|capability| capability.mount.as_ref())
            .and_then(|mount| mount.fs_type.clone())
            .unwrap_or_default();
        let tiers = request
            .parameters
            .get(PARAMETER_ACCESS_TIER)
            .map(|value| parse_access_tiers(value))
            .transpose()?;

        // Repeated CreateVolume for the same id is idempotent.
        match self.store.get_volume(&request.name) {
            Ok(existing) => {
                if existing.status.total_capacity == required {
                    return Ok(volume_response(&existing));
                }
                return Err(CsiError::invalid_argument(format!(
                    "Volume {} already exists with capacity {}",
                    request.name, existing.status.total_capacity
                )));
            }
            Err(e) if is_not_found_error(e.as_ref()) => {}
            Err(e) => return Err(CsiError::from_store(e)),
        }

        for _ in 0..SCHEDULE_RETRY_BUDGET {
            let drives = self
                .store
                .list_drives()
                .map_err(|e| CsiError::internal(e.to_string()))?;

            let candidates = filter_by_format(drives);
            if candidates.is_empty() {
                return Err(CsiError::failed_precondition(
                    "No added drives found. Use 'drives format' to add drives",
                ));
            }
            let candidates = filter_by_capacity(required, candidates);
            if candidates.is_empty() {
                return Err(CsiError::out_of_range(format!(
                    "No drive has {} bytes free for volume {}",
                    required, request.name
                )));
            }
            let candidates = filter_by_filesystem(&fs_type, candidates);
            if candidates.is_empty() {
                return Err(CsiError::invalid_argument(format!(
                    "No drive matches the requested filesystem '{}'",
                    fs_type
                )));
            }
            let candidates = match &tiers {
                Some(tiers) => filter_by_access_tier(tiers, candidates),
                None => candidates,
            };
            if candidates.is_empty() {
                return Err(CsiError::resource_exhausted(
                    "No drive matches the requested access tiers",
                ));
            }

            let selected =
                select_by_topology(request.accessibility_requirements.as_ref(), candidates)
                    .ok_or_else(|| {
                        CsiError::resource_exhausted("Cannot satisfy the topology constraint")
                    })?;

            match self.bind(&selected, &request.name, required).await {
                Ok(volume) => {
                    log_info(
                        COMPONENT,
                        "Scheduled volume",
                        &[
                            ("volume", request.name.as_str()),
                            ("drive", selected.metadata.name.as_str()),
                        ],
                    );
                    return Ok(volume_response(&volume));
                }
                Err(e)
                    if is_conflict_error(e.as_ref())
                        || e.to_string().contains(INSUFFICIENT_CAPACITY_MARKER) =>
                {
                    log_warn(
                        COMPONENT,
                        "Scheduling race lost; re-running the filter pipeline",
                        &[("volume", request.name.as_str())],
                    );
                    continue;
                }
                Err(e) => return Err(CsiError::internal(e.to_string())),
            }
        }

        Err(CsiError::resource_exhausted(format!(
            "Could not schedule volume {} within the retry budget",
            request.name
        )))
    }

    /// Increments the drive allocation and creates the bound volume.
    async fn bind(
        &self,
        selected: &DirectCsiDrive,
        volume_id: &str,
        required: i64,
    ) -> Result<DirectCsiVolume, DynError> {
        let drive_name = selected.metadata.name.clone();
        let updated = self
            .store
            .update_drive(&drive_name, |drive| {
                if drive.status.free_capacity < required {
                    return Err(new_error(format!(
                        "Drive {} {}",
                        drive.metadata.name, INSUFFICIENT_CAPACITY_MARKER
                    )));
                }
                drive.status.allocated_capacity += required;
                drive.status.free_capacity =
                    drive.status.total_capacity - drive.status.allocated_capacity;
                drive.status.drive_status = DriveStatus::InUse;
                drive.metadata.add_finalizer(FINALIZER_DRIVE_IN_USE);
                Ok(())
            })
            .await?;

        let mut volume = DirectCsiVolume::new(volume_id);
        volume.metadata.add_finalizer(FINALIZER_VOLUME_PROTECTION);
        volume.status.drive = updated.metadata.name.clone();
        volume.status.node_name = updated.status.node_name.clone();
        volume.status.total_capacity = required;
        for condition in [
            VOLUME_CONDITION_STAGED,
            VOLUME_CONDITION_PUBLISHED,
            VOLUME_CONDITION_READY,
        ] {
            set_condition(
                &mut volume.status.conditions,
                condition,
                ConditionStatus::False,
                REASON_NOT_IN_USE,
                "",
            );
        }

        match self.store.create_volume(volume) {
            Ok(volume) => Ok(volume),
            Err(e) if is_conflict_error(e.as_ref()) => {
                // Lost a duplicate-create race: give the capacity back and
                // hand out the winner's binding.
                self.release_allocation(&drive_name, volume_id, required)
                    .await?;
                self.store.get_volume(volume_id)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn delete_volume(&self, request: &DeleteVolumeRequest) -> Result<(), CsiError> {
        if request.volume_id.is_empty() {
            return Err(CsiError::invalid_argument("volume ID missing in request"));
        }

        let volume = match self.store.get_volume(&request.volume_id) {
            Ok(volume) => volume,
            Err(e) if is_not_found_error(e.as_ref()) => return Ok(()),
            Err(e) => return Err(CsiError::from_store(e)),
        };

        if is_condition_true(&volume.status.conditions, VOLUME_CONDITION_STAGED) {
            return Err(CsiError::failed_precondition(format!(
                "Volume {} is still staged at {}",
                request.volume_id, volume.status.staging_path
            )));
        }
        if volume
            .metadata
            .finalizers
            .iter()
            .any(|f| f.starts_with(FINALIZER_PUBLISHED_AT_PREFIX))
        {
            return Err(CsiError::failed_precondition(format!(
                "Volume {} is still published",
                request.volume_id
            )));
        }

        if !volume.status.drive.is_empty() {
            self.release_allocation(
                &volume.status.drive,
                &request.volume_id,
                volume.status.total_capacity,
            )
            .await
            .map_err(|e| CsiError::internal(e.to_string()))?;
        }

        self.store
            .update_volume(&request.volume_id, |volume| {
                volume.status.drive.clear();
                volume.metadata.remove_finalizer(FINALIZER_VOLUME_PROTECTION);
                Ok(())
            })
            .await
            .map_err(CsiError::from_store)?;
        self.store
            .delete_volume(&request.volume_id)
            .await
            .map_err(CsiError::from_store)?;

        log_info(COMPONENT, "Deleted volume", &[("volume", &request.volume_id)]);
        Ok(())
    }

    /// Returns a volume's bytes to its drive. When the last bound volume
    /// goes, the drive leaves `InUse`.
    async fn release_allocation(
        &self,
        drive_name: &str,
        volume_id: &str,
        bytes: i64,
    ) -> Result<(), DynError> {
        let others_bound = self
            .store
            .list_volumes()?
            .iter()
            .any(|v| v.status.drive == drive_name && v.metadata.name != volume_id);

        self.store
            .update_drive(drive_name, |drive| {
                drive.status.allocated_capacity =
                    (drive.status.allocated_capacity - bytes).max(0);
                drive.status.free_capacity =
                    drive.status.total_capacity - drive.status.allocated_capacity;
                if !others_bound {
                    drive.metadata.remove_finalizer(FINALIZER_DRIVE_IN_USE);
                    if drive.status.drive_status == DriveStatus::InUse {
                        drive.status.drive_status = DriveStatus::Ready;
                    }
                }
                Ok(())
            })
            .await?;
        Ok(())
    }
}

fn volume_response(volume: &DirectCsiVolume) -> CreateVolumeResponse {
    CreateVolumeResponse {
        volume: Volume {
            volume_id: volume.metadata.name.clone(),
            capacity_bytes: volume.status.total_capacity,
            volume_context: std::collections::HashMap::from([(
                "RequiredBytes".to_string(),
                volume.status.total_capacity.to_string(),
            )]),
            accessible_topology: Vec::new(),
        },
    }
}

// ----- filter pipeline -----

/// Format gate: only drives that finished format and mount are candidates.
pub fn filter_by_format(drives: Vec<DirectCsiDrive>) -> Vec<DirectCsiDrive> {
    drives
        .into_iter()
        .filter(|drive| drive.is_schedulable())
        .collect()
}

/// Capacity gate on the requested bytes; a limit is not a hard filter.
pub fn filter_by_capacity(required: i64, drives: Vec<DirectCsiDrive>) -> Vec<DirectCsiDrive> {
    drives
        .into_iter()
        .filter(|drive| drive.status.free_capacity >= required)
        .collect()
}

/// Filesystem gate; an empty request passes everything.
pub fn filter_by_filesystem(fs_type: &str, drives: Vec<DirectCsiDrive>) -> Vec<DirectCsiDrive> {
    if fs_type.is_empty() {
        return drives;
    }
    drives
        .into_iter()
        .filter(|drive| drive.status.filesystem == fs_type)
        .collect()
}

/// Access-tier gate; callers expand `*` before this runs.
pub fn filter_by_access_tier(
    tiers: &HashSet<AccessTier>,
    drives: Vec<DirectCsiDrive>,
) -> Vec<DirectCsiDrive> {
    drives
        .into_iter()
        .filter(|drive| tiers.contains(&drive.status.access_tier))
        .collect()
}

/// Parses the access-tier parameter: a comma list of tier names, where `*`
/// means every known tier.
pub fn parse_access_tiers(value: &str) -> Result<HashSet<AccessTier>, CsiError> {
    let mut tiers = HashSet::new();
    for token in value.split(',') {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }
        if token == "*" {
            tiers.extend(AccessTier::all());
            continue;
        }
        match AccessTier::parse(token) {
            Some(tier) => {
                tiers.insert(tier);
            }
            None => {
                return Err(CsiError::invalid_argument(format!(
                    "Unknown access tier '{}'",
                    token
                )))
            }
        }
    }
    if tiers.is_empty() {
        return Err(CsiError::invalid_argument(
            "Empty access tier selection in request",
        ));
    }
    Ok(tiers)
}

/// Sorts candidates by free capacity descending (name ascending on ties),
/// then walks preferred and requisite topologies for the first drive whose
/// segments are a superset of the requested ones.
pub fn select_by_topology(
    requirement: Option<&TopologyRequirement>,
    mut drives: Vec<DirectCsiDrive>,
) -> Option<DirectCsiDrive> {
    drives.sort_by(|a, b| {
        b.status
            .free_capacity
            .cmp(&a.status.free_capacity)
            .then_with(|| a.metadata.name.cmp(&b.metadata.name))
    });

    let (preferred, requisite) = match requirement {
        Some(requirement) => (requirement.preferred.clone(), requirement.requisite.clone()),
        None => (Vec::new(), Vec::new()),
    };

    if preferred.is_empty() && requisite.is_empty() {
        return drives.into_iter().next();
    }
    for topology in preferred.iter().chain(requisite.iter()) {
        if let Some(drive) = drives
            .iter()
            .find(|drive| matches_segments(topology, drive))
        {
            return Some(drive.clone());
        }
    }
    None
}

fn matches_segments(topology: &Topology, drive: &DirectCsiDrive) -> bool {
    topology
        .segments
        .iter()
        .all(|(key, value)| drive.status.topology.get(key) == Some(value))
}

// ----- cleanup listener -----

/// Safety net behind `DeleteVolume`: volumes marked for deletion whose
/// stage and publish tokens are gone get their drive capacity released and
/// their protection finalizer removed, even if the RPC died mid-flight.
pub struct VolumeCleanupListener {
    store: ObjectStore,
    controller: ControllerServer,
}

impl VolumeCleanupListener {
    pub fn new(store: ObjectStore) -> Self {
        Self {
            store,
            controller: ControllerServer::new(store),
        }
    }

    async fn cleanup(&self, volume: DirectCsiVolume) -> Result<(), DynError> {
        if volume.metadata.deletion_timestamp.is_none() {
            return Ok(());
        }
        if is_condition_true(&volume.status.conditions, VOLUME_CONDITION_STAGED) {
            return Ok(());
        }
        if volume
            .metadata
            .finalizers
            .iter()
            .any(|f| f.starts_with(FINALIZER_PUBLISHED_AT_PREFIX))
        {
            return Ok(());
        }

        let name = volume.metadata.name.clone();
        if !volume.status.drive.is_empty() {
            self.controller
                .release_allocation(&volume.status.drive, &name, volume.status.total_capacity)
                .await?;
        }
        self.store
            .update_volume(&name, |volume| {
                volume.status.drive.clear();
                volume.metadata.remove_finalizer(FINALIZER_VOLUME_PROTECTION);
                Ok(())
            })
            .await?;
        log_info(COMPONENT, "Reaped terminating volume", &[("volume", &name)]);
        Ok(())
    }
}

#[async_trait]
impl Listener for VolumeCleanupListener {
    fn name(&self) -> &'static str {
        "volume-cleanup"
    }

    fn watch_prefix(&self) -> &'static str {
        VOLUMES_PREFIX
    }

    fn list(&self) -> Result<Vec<(String, Value)>, DynError> {
        let mut listing = Vec::new();
        for value in self.store.list_volumes_at(STORAGE_VERSION)? {
            let name = value["metadata"]["name"]
                .as_str()
                .unwrap_or_default()
                .to_string();
            listing.push((name, value));
        }
        Ok(listing)
    }

    async fn add(&self, _ctx: &ListenerContext, _key: &str, new: Value) -> Result<(), DynError> {
        self.cleanup(crate::directcsi::apis::convert::volume_to_storage(new)?)
            .await
    }

    async fn update(
        &self,
        _ctx: &ListenerContext,
        _key: &str,
        _old: Value,
        new: Value,
    ) -> Result<(), DynError> {
        self.cleanup(crate::directcsi::apis::convert::volume_to_storage(new)?)
            .await
    }

    async fn delete(
        &self,
        _ctx: &ListenerContext,
        _key: &str,
        _old: Option<Value>,
    ) -> Result<(), DynError> {
        Ok(())
    }
}
