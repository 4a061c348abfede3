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

//! Schema conversion between stored wire versions.
//!
//! Objects may be persisted at any historical version; readers always see the
//! version they asked for. Conversion composes bidirectional per-hop
//! functions (v1alpha1 <-> v1beta1 <-> v1beta2). Each hop is pure: it maps
//! old field shapes into new ones, fills defaults for fields the older
//! version could not express, and drops fields the target cannot carry.

use crate::directcsi::apis::{
    self, v1alpha1, v1beta1, v1beta2, Condition, ConditionStatus, KIND_DRIVE, KIND_VOLUME,
    REASON_ADDED, REASON_NOT_ADDED,
};
use crate::directcsi::util::error::{new_error, with_context};
use serde_json::Value;
use std::error::Error;

type DynError = Box<dyn Error + Send + Sync>;

pub const VERSION_ORDER: [&str; 3] = [
    v1alpha1::API_VERSION,
    v1beta1::API_VERSION,
    v1beta2::API_VERSION,
];

pub const STORAGE_VERSION: &str = v1beta2::API_VERSION;

fn version_index(api_version: &str) -> Result<usize, DynError> {
    VERSION_ORDER
        .iter()
        .position(|v| *v == api_version)
        .ok_or_else(|| new_error(format!("Unknown API version '{}'", api_version)))
}

fn api_version_of(value: &Value) -> Result<String, DynError> {
    value
        .get("apiVersion")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| new_error("Object is missing apiVersion"))
}

fn kind_of(value: &Value) -> Result<String, DynError> {
    value
        .get("kind")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| new_error("Object is missing kind"))
}

/// Converts any stored object (drive or volume) to the requested version.
/// The pipeline is the identity when source and target match.
pub fn convert(value: Value, target_version: &str) -> Result<Value, DynError> {
    match kind_of(&value)?.as_str() {
        KIND_DRIVE => convert_drive(value, target_version),
        KIND_VOLUME => convert_volume(value, target_version),
        other => Err(new_error(format!("Unknown object kind '{}'", other))),
    }
}

pub fn convert_drive(value: Value, target_version: &str) -> Result<Value, DynError> {
    let source = api_version_of(&value)?;
    let mut index = version_index(&source)?;
    let target = version_index(target_version)?;
    let mut current = value;

    while index < target {
        current = drive_hop_up(current, index)?;
        index += 1;
    }
    while index > target {
        current = drive_hop_down(current, index)?;
        index -= 1;
    }
    Ok(current)
}

pub fn convert_volume(value: Value, target_version: &str) -> Result<Value, DynError> {
    let source = api_version_of(&value)?;
    let mut index = version_index(&source)?;
    let target = version_index(target_version)?;
    let mut current = value;

    while index < target {
        current = volume_hop_up(current, index)?;
        index += 1;
    }
    while index > target {
        current = volume_hop_down(current, index)?;
        index -= 1;
    }
    Ok(current)
}

/// Parses a stored drive at any version into the storage version.
pub fn drive_to_storage(value: Value) -> Result<v1beta2::DirectCsiDrive, DynError> {
    let converted = convert_drive(value, STORAGE_VERSION)?;
    serde_json::from_value(converted)
        .map_err(|e| with_context(e, "Failed to decode drive at storage version"))
}

/// Parses a stored volume at any version into the storage version.
pub fn volume_to_storage(value: Value) -> Result<v1beta2::DirectCsiVolume, DynError> {
    let converted = convert_volume(value, STORAGE_VERSION)?;
    serde_json::from_value(converted)
        .map_err(|e| with_context(e, "Failed to decode volume at storage version"))
}

fn drive_hop_up(value: Value, from_index: usize) -> Result<Value, DynError> {
    match from_index {
        0 => {
            let old: v1alpha1::DirectCsiDrive = serde_json::from_value(value)
                .map_err(|e| with_context(e, "Failed to decode v1alpha1 drive"))?;
            let new = drive_alpha_to_beta1(old);
            serde_json::to_value(new).map_err(|e| with_context(e, "Failed to encode v1beta1 drive"))
        }
        1 => {
            let old: v1beta1::DirectCsiDrive = serde_json::from_value(value)
                .map_err(|e| with_context(e, "Failed to decode v1beta1 drive"))?;
            let new = drive_beta1_to_beta2(old);
            serde_json::to_value(new).map_err(|e| with_context(e, "Failed to encode v1beta2 drive"))
        }
        _ => Err(new_error("No upgrade hop beyond the storage version")),
    }
}

fn drive_hop_down(value: Value, from_index: usize) -> Result<Value, DynError> {
    match from_index {
        2 => {
            let old: v1beta2::DirectCsiDrive = serde_json::from_value(value)
                .map_err(|e| with_context(e, "Failed to decode v1beta2 drive"))?;
            let new = drive_beta2_to_beta1(old);
            serde_json::to_value(new).map_err(|e| with_context(e, "Failed to encode v1beta1 drive"))
        }
        1 => {
            let old: v1beta1::DirectCsiDrive = serde_json::from_value(value)
                .map_err(|e| with_context(e, "Failed to decode v1beta1 drive"))?;
            let new = drive_beta1_to_alpha(old);
            serde_json::to_value(new)
                .map_err(|e| with_context(e, "Failed to encode v1alpha1 drive"))
        }
        _ => Err(new_error("No downgrade hop below the oldest version")),
    }
}

fn drive_alpha_to_beta1(old: v1alpha1::DirectCsiDrive) -> v1beta1::DirectCsiDrive {
    let drive_status = match old.drive_status {
        v1alpha1::DriveStatus::Online => v1beta1::DriveStatus::InUse,
        v1alpha1::DriveStatus::Unformatted => v1beta1::DriveStatus::Available,
        v1alpha1::DriveStatus::Offline | v1alpha1::DriveStatus::Other => {
            v1beta1::DriveStatus::Unavailable
        }
    };

    let formatted = !old.filesystem.is_empty();
    let mounted = !old.mountpoint.is_empty();
    let mut conditions = Vec::new();
    push_seed_condition(&mut conditions, apis::DRIVE_CONDITION_OWNED, false, "");
    push_seed_condition(
        &mut conditions,
        apis::DRIVE_CONDITION_MOUNTED,
        mounted,
        &old.mountpoint,
    );
    push_seed_condition(
        &mut conditions,
        apis::DRIVE_CONDITION_FORMATTED,
        formatted,
        &old.filesystem,
    );
    push_seed_condition(&mut conditions, apis::DRIVE_CONDITION_INITIALIZED, true, "");

    v1beta1::DirectCsiDrive {
        api_version: v1beta1::API_VERSION.to_string(),
        kind: KIND_DRIVE.to_string(),
        metadata: old.metadata,
        spec: v1beta1::DirectCsiDriveSpec {
            requested_format: None,
        },
        status: v1beta1::DirectCsiDriveStatus {
            node_name: old.owner_node,
            path: old.path,
            root_partition: old.root_partition,
            partition_num: old.partition_num,
            filesystem: old.filesystem,
            mountpoint: old.mountpoint,
            mount_options: old.mount_options,
            model_number: old.model_number,
            serial_number: old.serial_number,
            total_capacity: old.total_capacity,
            free_capacity: old.free_capacity,
            logical_block_size: old.block_size,
            drive_status,
            conditions,
        },
        extra: old.extra,
    }
}

fn drive_beta1_to_alpha(old: v1beta1::DirectCsiDrive) -> v1alpha1::DirectCsiDrive {
    let drive_status = match old.status.drive_status {
        v1beta1::DriveStatus::Available => v1alpha1::DriveStatus::Unformatted,
        v1beta1::DriveStatus::Ready | v1beta1::DriveStatus::InUse => v1alpha1::DriveStatus::Online,
        v1beta1::DriveStatus::Unavailable
        | v1beta1::DriveStatus::Released
        | v1beta1::DriveStatus::Terminating => v1alpha1::DriveStatus::Offline,
    };

    v1alpha1::DirectCsiDrive {
        api_version: v1alpha1::API_VERSION.to_string(),
        kind: KIND_DRIVE.to_string(),
        metadata: old.metadata,
        model_number: old.status.model_number,
        serial_number: old.status.serial_number,
        owner_node: old.status.node_name,
        total_capacity: old.status.total_capacity,
        free_capacity: old.status.free_capacity,
        block_size: old.status.logical_block_size,
        path: old.status.path,
        root_partition: old.status.root_partition,
        partition_num: old.status.partition_num,
        filesystem: old.status.filesystem,
        mountpoint: old.status.mountpoint,
        mount_options: old.status.mount_options,
        drive_status,
        extra: old.extra,
    }
}

fn drive_beta1_to_beta2(old: v1beta1::DirectCsiDrive) -> v1beta2::DirectCsiDrive {
    // The older version carried free capacity only; the allocation counter is
    // derived once here and becomes authoritative from then on.
    let allocated = (old.status.total_capacity - old.status.free_capacity).max(0);
    let mut topology = std::collections::HashMap::new();
    if !old.status.node_name.is_empty() {
        topology.insert(
            v1beta2::TOPOLOGY_NODE.to_string(),
            old.status.node_name.clone(),
        );
    }

    v1beta2::DirectCsiDrive {
        api_version: v1beta2::API_VERSION.to_string(),
        kind: KIND_DRIVE.to_string(),
        metadata: old.metadata,
        spec: old.spec,
        status: v1beta2::DirectCsiDriveStatus {
            node_name: old.status.node_name,
            path: old.status.path,
            root_partition: old.status.root_partition,
            partition_num: old.status.partition_num,
            filesystem: old.status.filesystem,
            mountpoint: old.status.mountpoint,
            mount_options: old.status.mount_options,
            model_number: old.status.model_number,
            serial_number: old.status.serial_number,
            wwid: String::new(),
            total_capacity: old.status.total_capacity,
            free_capacity: old.status.free_capacity,
            allocated_capacity: allocated,
            logical_block_size: old.status.logical_block_size,
            physical_block_size: old.status.logical_block_size,
            drive_status: old.status.drive_status,
            access_tier: v1beta2::AccessTier::Unknown,
            topology,
            conditions: old.status.conditions,
        },
        extra: old.extra,
    }
}

fn drive_beta2_to_beta1(old: v1beta2::DirectCsiDrive) -> v1beta1::DirectCsiDrive {
    // Free capacity is derived from the allocation counter on the way down so
    // both fields always tell the same story to older clients.
    let free = (old.status.total_capacity - old.status.allocated_capacity).max(0);

    v1beta1::DirectCsiDrive {
        api_version: v1beta1::API_VERSION.to_string(),
        kind: KIND_DRIVE.to_string(),
        metadata: old.metadata,
        spec: old.spec,
        status: v1beta1::DirectCsiDriveStatus {
            node_name: old.status.node_name,
            path: old.status.path,
            root_partition: old.status.root_partition,
            partition_num: old.status.partition_num,
            filesystem: old.status.filesystem,
            mountpoint: old.status.mountpoint,
            mount_options: old.status.mount_options,
            model_number: old.status.model_number,
            serial_number: old.status.serial_number,
            total_capacity: old.status.total_capacity,
            free_capacity: free,
            logical_block_size: old.status.logical_block_size,
            drive_status: old.status.drive_status,
            conditions: old.status.conditions,
        },
        extra: old.extra,
    }
}

fn volume_hop_up(value: Value, from_index: usize) -> Result<Value, DynError> {
    match from_index {
        0 => {
            let old: v1alpha1::DirectCsiVolume = serde_json::from_value(value)
                .map_err(|e| with_context(e, "Failed to decode v1alpha1 volume"))?;
            let new = volume_alpha_to_beta1(old);
            serde_json::to_value(new)
                .map_err(|e| with_context(e, "Failed to encode v1beta1 volume"))
        }
        1 => {
            let old: v1beta1::DirectCsiVolume = serde_json::from_value(value)
                .map_err(|e| with_context(e, "Failed to decode v1beta1 volume"))?;
            let new = volume_beta1_to_beta2(old);
            serde_json::to_value(new)
                .map_err(|e| with_context(e, "Failed to encode v1beta2 volume"))
        }
        _ => Err(new_error("No upgrade hop beyond the storage version")),
    }
}

fn volume_hop_down(value: Value, from_index: usize) -> Result<Value, DynError> {
    match from_index {
        2 => {
            let old: v1beta2::DirectCsiVolume = serde_json::from_value(value)
                .map_err(|e| with_context(e, "Failed to decode v1beta2 volume"))?;
            let new = volume_beta2_to_beta1(old);
            serde_json::to_value(new)
                .map_err(|e| with_context(e, "Failed to encode v1beta1 volume"))
        }
        1 => {
            let old: v1beta1::DirectCsiVolume = serde_json::from_value(value)
                .map_err(|e| with_context(e, "Failed to decode v1beta1 volume"))?;
            let new = volume_beta1_to_alpha(old);
            serde_json::to_value(new)
                .map_err(|e| with_context(e, "Failed to encode v1alpha1 volume"))
        }
        _ => Err(new_error("No downgrade hop below the oldest version")),
    }
}

fn volume_alpha_to_beta1(old: v1alpha1::DirectCsiVolume) -> v1beta1::DirectCsiVolume {
    let staged = matches!(
        old.volume_status,
        v1alpha1::VolumeStatus::Staged | v1alpha1::VolumeStatus::Published
    );
    let published = matches!(old.volume_status, v1alpha1::VolumeStatus::Published);

    let mut conditions = Vec::new();
    push_seed_condition(&mut conditions, apis::VOLUME_CONDITION_STAGED, staged, "");
    push_seed_condition(
        &mut conditions,
        apis::VOLUME_CONDITION_PUBLISHED,
        published,
        "",
    );
    push_seed_condition(&mut conditions, apis::VOLUME_CONDITION_READY, staged, "");

    v1beta1::DirectCsiVolume {
        api_version: v1beta1::API_VERSION.to_string(),
        kind: KIND_VOLUME.to_string(),
        metadata: old.metadata,
        status: v1beta1::DirectCsiVolumeStatus {
            drive: old.owner_drive,
            node_name: old.owner_node,
            host_path: old.source_path,
            staging_path: String::new(),
            total_capacity: old.total_capacity,
            conditions,
        },
        extra: old.extra,
    }
}

fn volume_beta1_to_alpha(old: v1beta1::DirectCsiVolume) -> v1alpha1::DirectCsiVolume {
    let volume_status = if apis::is_condition_true(
        &old.status.conditions,
        apis::VOLUME_CONDITION_PUBLISHED,
    ) {
        v1alpha1::VolumeStatus::Published
    } else if apis::is_condition_true(&old.status.conditions, apis::VOLUME_CONDITION_STAGED) {
        v1alpha1::VolumeStatus::Staged
    } else {
        v1alpha1::VolumeStatus::New
    };

    v1alpha1::DirectCsiVolume {
        api_version: v1alpha1::API_VERSION.to_string(),
        kind: KIND_VOLUME.to_string(),
        metadata: old.metadata,
        owner_drive: old.status.drive,
        owner_node: old.status.node_name,
        source_path: old.status.host_path,
        total_capacity: old.status.total_capacity,
        volume_status,
        extra: old.extra,
    }
}

fn volume_beta1_to_beta2(old: v1beta1::DirectCsiVolume) -> v1beta2::DirectCsiVolume {
    v1beta2::DirectCsiVolume {
        api_version: v1beta2::API_VERSION.to_string(),
        kind: KIND_VOLUME.to_string(),
        metadata: old.metadata,
        status: v1beta2::DirectCsiVolumeStatus {
            drive: old.status.drive,
            node_name: old.status.node_name,
            host_path: old.status.host_path,
            staging_path: old.status.staging_path,
            total_capacity: old.status.total_capacity,
            used_capacity: 0,
            conditions: old.status.conditions,
        },
        extra: old.extra,
    }
}

fn volume_beta2_to_beta1(old: v1beta2::DirectCsiVolume) -> v1beta1::DirectCsiVolume {
    v1beta1::DirectCsiVolume {
        api_version: v1beta1::API_VERSION.to_string(),
        kind: KIND_VOLUME.to_string(),
        metadata: old.metadata,
        status: v1beta1::DirectCsiVolumeStatus {
            drive: old.status.drive,
            node_name: old.status.node_name,
            host_path: old.status.host_path,
            staging_path: old.status.staging_path,
            total_capacity: old.status.total_capacity,
            conditions: old.status.conditions,
        },
        extra: old.extra,
    }
}

// Hops must stay pure, so seeded conditions get a fixed epoch timestamp
// instead of the wall clock.
fn push_seed_condition(conditions: &mut Vec<Condition>, condition_type: &str, on: bool, message: &str) {
    conditions.push(Condition {
        condition_type: condition_type.to_string(),
        status: ConditionStatus::from(on),
        reason: if on { REASON_ADDED } else { REASON_NOT_ADDED }.to_string(),
        message: message.to_string(),
        last_transition_time: chrono::DateTime::<chrono::Utc>::UNIX_EPOCH,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn alpha_drive() -> Value {
        json!({
            "apiVersion": v1alpha1::API_VERSION,
            "kind": KIND_DRIVE,
            "metadata": {"name": "drive-1"},
            "ownerNode": "node-1",
            "totalCapacity": 1000,
            "freeCapacity": 400,
            "blockSize": 512,
            "path": "/dev/sda",
            "filesystem": "xfs",
            "mountpoint": "/var/lib/direct-csi/mnt/drive-1",
            "driveStatus": "online",
            "vendorHint": "seagate",
        })
    }

    #[test]
    fn upgrades_alpha_drive_to_storage_version() {
        let drive = drive_to_storage(alpha_drive()).expect("convert");
        assert_eq!(drive.api_version, v1beta2::API_VERSION);
        assert_eq!(drive.status.node_name, "node-1");
        assert_eq!(drive.status.drive_status, v1beta2::DriveStatus::InUse);
        assert_eq!(drive.status.allocated_capacity, 600);
        assert_eq!(drive.status.physical_block_size, 512);
        assert_eq!(drive.status.access_tier, v1beta2::AccessTier::Unknown);
        assert_eq!(
            drive.status.topology.get(v1beta2::TOPOLOGY_NODE),
            Some(&"node-1".to_string())
        );
        // Unknown fields ride along through every hop.
        assert_eq!(drive.extra.get("vendorHint"), Some(&json!("seagate")));
    }

    #[test]
    fn conversion_is_identity_when_versions_match() {
        let original = alpha_drive();
        let converted = convert_drive(original.clone(), v1alpha1::API_VERSION).expect("convert");
        assert_eq!(converted, original);
    }

    #[test]
    fn hop_composition_matches_direct_conversion() {
        let via_beta1 = convert_drive(
            convert_drive(alpha_drive(), v1beta1::API_VERSION).expect("first hop"),
            v1beta2::API_VERSION,
        )
        .expect("second hop");
        let direct = convert_drive(alpha_drive(), v1beta2::API_VERSION).expect("direct");
        assert_eq!(via_beta1, direct);
    }

    #[test]
    fn downgrade_derives_free_capacity_from_allocation() {
        let mut drive = v1beta2::DirectCsiDrive::new("drive-2");
        drive.status.total_capacity = 100;
        drive.status.allocated_capacity = 30;
        drive.status.free_capacity = 999; // stale by design; allocation wins
        let value = serde_json::to_value(&drive).expect("encode");

        let downgraded = convert_drive(value, v1beta1::API_VERSION).expect("downgrade");
        assert_eq!(downgraded["status"]["freeCapacity"], 70);
    }

    #[test]
    fn volume_round_trips_through_all_versions() {
        let raw = json!({
            "apiVersion": v1alpha1::API_VERSION,
            "kind": KIND_VOLUME,
            "metadata": {"name": "v-1"},
            "ownerDrive": "drive-1",
            "ownerNode": "node-1",
            "sourcePath": "/var/lib/direct-csi/mnt/drive-1/v-1",
            "totalCapacity": 512,
            "volumeStatus": "published",
        });

        let upgraded = volume_to_storage(raw).expect("upgrade");
        assert_eq!(upgraded.status.drive, "drive-1");
        assert!(apis::is_condition_true(
            &upgraded.status.conditions,
            apis::VOLUME_CONDITION_PUBLISHED
        ));

        let downgraded = convert_volume(
            serde_json::to_value(&upgraded).expect("encode"),
            v1alpha1::API_VERSION,
        )
        .expect("downgrade");
        assert_eq!(downgraded["volumeStatus"], "published");
        assert_eq!(downgraded["sourcePath"], "/var/lib/direct-csi/mnt/drive-1/v-1");
    }

    #[test]
    fn unknown_version_is_rejected() {
        let raw = json!({
            "apiVersion": "direct.csi.min.io/v9",
            "kind": KIND_DRIVE,
            "metadata": {"name": "x"},
        });
        assert!(convert_drive(raw, v1beta2::API_VERSION).is_err());
    }
}
