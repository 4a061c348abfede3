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

//! Turns probed block devices into stored `Drive` objects for this node.
//! Runs at startup and records exactly what the kernel reported; the drive
//! controller later moves drives through format and mount.

use crate::directcsi::apis::v1beta2::{AccessTier, DirectCsiDrive, DriveStatus};
use crate::directcsi::apis::{
    set_condition, ConditionStatus, DRIVE_CONDITION_FORMATTED, DRIVE_CONDITION_INITIALIZED,
    DRIVE_CONDITION_MOUNTED, DRIVE_CONDITION_OWNED, REASON_ADDED, REASON_INITIALIZED,
    REASON_NOT_ADDED,
};
use crate::directcsi::client::ObjectStore;
use crate::directcsi::logger::{log_info, log_warn};
use crate::directcsi::node::DriverIdentity;
use crate::directcsi::sys::{loopback, BlockProbe, Device};
use crate::directcsi::util::error::is_not_found_error;
use crate::directcsi::Config;

use sha2::{Digest, Sha256};
use std::error::Error;

type DynError = Box<dyn Error + Send + Sync>;

const COMPONENT: &str = "drive-discovery";

/// Deterministic drive identity from (node, device path).
pub fn make_drive_name(node_id: &str, path: &str) -> String {
    let seed = format!("{}-{}", node_id, path);
    format!("{:x}", Sha256::digest(seed.as_bytes()))
}

/// A mountpoint outside the driver-owned tree means something else claimed
/// the drive; it must never be scheduled.
pub fn is_mounted_outside(mount_points: &[String]) -> bool {
    let driver_root = Config::MountRoot
        .get_path()
        .parent()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "/var/lib/direct-csi".to_string());
    mount_points
        .iter()
        .any(|point| !point.starts_with(&driver_root))
}

/// Builds the stored object for a freshly probed device.
pub fn device_to_drive(identity: &DriverIdentity, device: &Device) -> DirectCsiDrive {
    let unavailable = is_mounted_outside(&device.mount_points) || !device.error.is_empty();
    let mut drive = DirectCsiDrive::new(make_drive_name(&identity.node_id, &device.path));
    drive
        .metadata
        .add_finalizer(crate::directcsi::apis::FINALIZER_DRIVE_CLEANUP);

    drive.status.node_name = identity.node_id.clone();
    drive.status.path = device.path.clone();
    drive.status.root_partition = device.name.clone();
    drive.status.partition_num = device.partition;
    drive.status.filesystem = device.filesystem.clone();
    drive.status.mountpoint = device.first_mount_point.clone();
    drive.status.mount_options = device.first_mount_options.clone();
    drive.status.model_number = device.model.clone();
    drive.status.serial_number = device.serial.clone();
    drive.status.wwid = device.wwid.clone();
    drive.status.total_capacity = device.total_capacity as i64;
    drive.status.free_capacity = device.free_capacity as i64;
    // Unmounted devices report no free capacity; only a mounted filesystem
    // tells us how much of the drive is really in use.
    drive.status.allocated_capacity = if device.first_mount_point.is_empty() {
        0
    } else {
        (device.total_capacity as i64 - device.free_capacity as i64).max(0)
    };
    drive.status.logical_block_size = device.logical_block_size as i64;
    drive.status.physical_block_size = device.physical_block_size as i64;
    drive.status.access_tier = AccessTier::Unknown;
    drive.status.topology = identity.topology();
    drive.status.drive_status = if unavailable {
        DriveStatus::Unavailable
    } else {
        DriveStatus::Available
    };

    let conditions = &mut drive.status.conditions;
    set_condition(
        conditions,
        DRIVE_CONDITION_OWNED,
        ConditionStatus::False,
        REASON_NOT_ADDED,
        "",
    );
    set_condition(
        conditions,
        DRIVE_CONDITION_MOUNTED,
        ConditionStatus::from(!device.first_mount_point.is_empty()),
        REASON_NOT_ADDED,
        &device.first_mount_point,
    );
    set_condition(
        conditions,
        DRIVE_CONDITION_FORMATTED,
        ConditionStatus::from(!device.filesystem.is_empty()),
        REASON_NOT_ADDED,
        &device.filesystem,
    );
    set_condition(
        conditions,
        DRIVE_CONDITION_INITIALIZED,
        ConditionStatus::from(device.error.is_empty()),
        REASON_INITIALIZED,
        &device.error,
    );

    drive
}

/// Startup discovery pass for one node.
pub struct DriveDiscovery {
    store: ObjectStore,
    probe: BlockProbe,
    identity: DriverIdentity,
    loopback_only: bool,
}

impl DriveDiscovery {
    pub fn new(
        store: ObjectStore,
        probe: BlockProbe,
        identity: DriverIdentity,
        loopback_only: bool,
    ) -> Self {
        Self {
            store,
            probe,
            identity,
            loopback_only,
        }
    }

    /// Probes local block devices and reconciles the stored drives for this
    /// node: new devices are created, known ones refreshed in place.
    pub async fn sync_drives(&self) -> Result<usize, DynError> {
        if self.loopback_only {
            loopback::flush_reservations()?;
            loopback::reserve_devices(loopback::LOOPBACK_DEVICE_COUNT)?;
        }

        let devices = self.probe.probe(self.loopback_only)?;
        let mut synced = 0usize;

        for device in &devices {
            let discovered = device_to_drive(&self.identity, device);
            let name = discovered.metadata.name.clone();

            match self.store.get_drive(&name) {
                Ok(_) => {
                    self.store
                        .update_drive(&name, |drive| {
                            refresh_discovered_fields(drive, &discovered);
                            Ok(())
                        })
                        .await?;
                    synced += 1;
                }
                Err(e) if is_not_found_error(e.as_ref()) => {
                    self.store.create_drive(discovered)?;
                    log_info(
                        COMPONENT,
                        "Discovered new drive",
                        &[("drive", &name), ("path", &device.path)],
                    );
                    synced += 1;
                }
                Err(e) => {
                    log_warn(
                        COMPONENT,
                        "Failed to read stored drive",
                        &[("drive", &name), ("error", &e.to_string())],
                    );
                }
            }
        }

        Ok(synced)
    }
}

/// Copies hardware-derived facts from a fresh probe onto a stored drive
/// without disturbing the lifecycle the controller drives.
fn refresh_discovered_fields(drive: &mut DirectCsiDrive, discovered: &DirectCsiDrive) {
    drive.status.path = discovered.status.path.clone();
    drive.status.root_partition = discovered.status.root_partition.clone();
    drive.status.partition_num = discovered.status.partition_num;
    drive.status.model_number = discovered.status.model_number.clone();
    drive.status.serial_number = discovered.status.serial_number.clone();
    drive.status.wwid = discovered.status.wwid.clone();
    drive.status.total_capacity = discovered.status.total_capacity;
    drive.status.logical_block_size = discovered.status.logical_block_size;
    drive.status.physical_block_size = discovered.status.physical_block_size;
    drive.status.topology = discovered.status.topology.clone();

    // A drive claimed by something outside our tree is unusable no matter
    // what state it was in before.
    if discovered.status.drive_status == DriveStatus::Unavailable
        && matches!(
            drive.status.drive_status,
            DriveStatus::Available | DriveStatus::Ready
        )
    {
        drive.status.drive_status = DriveStatus::Unavailable;
    }

    // Re-arm a drive that was unavailable but is now clean.
    if discovered.status.drive_status == DriveStatus::Available
        && drive.status.drive_status == DriveStatus::Unavailable
    {
        drive.status.drive_status = DriveStatus::Available;
    }

    let initialized = discovered
        .status
        .conditions
        .iter()
        .find(|c| c.condition_type == DRIVE_CONDITION_INITIALIZED)
        .map(|c| (c.status, c.message.clone()))
        .unwrap_or((ConditionStatus::True, String::new()));
    set_condition(
        &mut drive.status.conditions,
        DRIVE_CONDITION_INITIALIZED,
        initialized.0,
        REASON_INITIALIZED,
        &initialized.1,
    );
    if drive.status.filesystem.is_empty() {
        drive.status.filesystem = discovered.status.filesystem.clone();
        set_condition(
            &mut drive.status.conditions,
            DRIVE_CONDITION_FORMATTED,
            ConditionStatus::from(!drive.status.filesystem.is_empty()),
            REASON_ADDED,
            &drive.status.filesystem,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directcsi::test_support::{EnvGuard, TestEnv};

    fn identity() -> DriverIdentity {
        DriverIdentity {
            node_id: "node-1".into(),
            rack: "default".into(),
            zone: "default".into(),
            region: "default".into(),
        }
    }

    fn probed_device(name: &str) -> Device {
        Device {
            name: name.to_string(),
            path: format!("/dev/{}", name),
            total_capacity: 100 << 30,
            free_capacity: 100 << 30,
            logical_block_size: 512,
            physical_block_size: 4096,
            ..Default::default()
        }
    }

    #[test]
    fn drive_names_are_stable_hashes_of_node_and_path() {
        let a = make_drive_name("node-1", "/dev/sda");
        let b = make_drive_name("node-1", "/dev/sda");
        let c = make_drive_name("node-2", "/dev/sda");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn outside_mountpoints_make_a_drive_unavailable() {
        let _lock = crate::directcsi::test_support::keyspace_lock()
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        let _guard = EnvGuard::set("DIRECT_CSI_MOUNT_ROOT", "/var/lib/direct-csi/mnt");
        let mut device = probed_device("sda");
        device.mount_points = vec!["/home".to_string()];
        device.first_mount_point = "/home".to_string();

        let drive = device_to_drive(&identity(), &device);
        assert_eq!(drive.status.drive_status, DriveStatus::Unavailable);
    }

    #[test]
    fn clean_device_is_available_with_seeded_conditions() {
        let _lock = crate::directcsi::test_support::keyspace_lock()
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        let _guard = EnvGuard::set("DIRECT_CSI_MOUNT_ROOT", "/var/lib/direct-csi/mnt");
        let drive = device_to_drive(&identity(), &probed_device("sdb"));
        assert_eq!(drive.status.drive_status, DriveStatus::Available);
        assert_eq!(drive.status.allocated_capacity, 0);
        assert_eq!(drive.status.conditions.len(), 4);
        assert!(crate::directcsi::apis::is_condition_true(
            &drive.status.conditions,
            DRIVE_CONDITION_INITIALIZED
        ));
    }

    #[test]
    fn probe_errors_flow_into_the_initialized_condition() {
        let _lock = crate::directcsi::test_support::keyspace_lock()
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        let _guard = EnvGuard::set("DIRECT_CSI_MOUNT_ROOT", "/var/lib/direct-csi/mnt");
        let mut device = probed_device("sdc");
        device.error = "ioctl failed".to_string();
        let drive = device_to_drive(&identity(), &device);
        assert_eq!(drive.status.drive_status, DriveStatus::Unavailable);
        let initialized = drive
            .status
            .conditions
            .iter()
            .find(|c| c.condition_type == DRIVE_CONDITION_INITIALIZED)
            .expect("condition");
        assert_eq!(initialized.status, ConditionStatus::False);
        assert_eq!(initialized.message, "ioctl failed");
    }

    #[tokio::test]
    async fn refresh_preserves_lifecycle_state() {
        let _env = TestEnv::new();
        let store = ObjectStore::with_partition("discovery-refresh");
        let device = probed_device("sda");
        let mut stored = device_to_drive(&identity(), &device);
        stored.status.drive_status = DriveStatus::Ready;
        stored.status.filesystem = "xfs".into();
        let name = stored.metadata.name.clone();
        store.create_drive(stored).expect("create");

        let discovered = device_to_drive(&identity(), &device);
        store
            .update_drive(&name, |drive| {
                refresh_discovered_fields(drive, &discovered);
                Ok(())
            })
            .await
            .expect("refresh");

        let drive = store.get_drive(&name).expect("get");
        assert_eq!(drive.status.drive_status, DriveStatus::Ready);
        assert_eq!(drive.status.filesystem, "xfs");
    }
}
