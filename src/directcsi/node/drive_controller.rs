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

//! Per-node drive reconciler. Watches `Drive` objects owned by this node
//! and walks them through format and mount toward `Ready`. Each transition
//! writes its result back before the next one runs, so a partially executed
//! reconcile completes on the following event.

use crate::directcsi::apis::convert::{self, STORAGE_VERSION};
use crate::directcsi::apis::v1beta2::{DirectCsiDrive, DriveStatus};
use crate::directcsi::apis::{
    set_condition, ConditionStatus, DRIVE_CONDITION_FORMATTED, DRIVE_CONDITION_INITIALIZED,
    DRIVE_CONDITION_MOUNTED, DRIVE_CONDITION_OWNED, FINALIZER_DRIVE_IN_USE, REASON_ADDED,
    REASON_REJECTED,
};
use crate::directcsi::client::{ObjectStore, DRIVES_PREFIX};
use crate::directcsi::listener::{Listener, ListenerContext};
use crate::directcsi::logger::{log_info, log_warn};
use crate::directcsi::sys::fs::{DeviceOps, MOUNT_OPT_PRJQUOTA};

use async_trait::async_trait;
use serde_json::Value;
use std::error::Error;
use std::path::{Path, PathBuf};
use std::sync::Arc;

type DynError = Box<dyn Error + Send + Sync>;

const COMPONENT: &str = "node-drive-controller";

pub struct DriveListener {
    store: ObjectStore,
    node_id: String,
    device_ops: Arc<dyn DeviceOps>,
}

impl DriveListener {
    pub fn new(store: ObjectStore, node_id: impl Into<String>, device_ops: Arc<dyn DeviceOps>) -> Self {
        Self {
            store,
            node_id: node_id.into(),
            device_ops,
        }
    }

    /// One reconcile step. State is re-read through the store before every
    /// mutation, so replaying any prefix of events converges to the same
    /// drive.
    pub async fn reconcile(&self, drive: DirectCsiDrive) -> Result<(), DynError> {
        if drive.status.node_name != self.node_id {
            return Ok(());
        }
        let name = drive.metadata.name.clone();

        if drive.metadata.deletion_timestamp.is_some() {
            return self.reconcile_release(&name, &drive).await;
        }

        let requested = drive.spec.requested_format.clone();
        let requested_fs = requested
            .as_ref()
            .map(|r| r.filesystem.clone())
            .unwrap_or_default();
        let mounted = !drive.status.mountpoint.is_empty();
        let formatted = !drive.status.filesystem.is_empty();

        if !requested_fs.is_empty() {
            // A drive with bound volumes is never reformatted, forced or not.
            if drive.metadata.has_finalizer(FINALIZER_DRIVE_IN_USE)
                || drive.status.drive_status == DriveStatus::InUse
            {
                return self
                    .reject_format(&name, "Cannot format a drive with bound volumes")
                    .await;
            }

            let force = requested.as_ref().map(|r| r.force).unwrap_or(false);
            if mounted {
                if !force {
                    return self
                        .reject_format(
                            &name,
                            "Cannot format a mounted drive. Set 'force: true' to override",
                        )
                        .await;
                }
                self.device_ops
                    .unmount(Path::new(&drive.status.mountpoint))?;
                self.store
                    .update_drive(&name, |drive| {
                        drive.status.mountpoint.clear();
                        drive.status.mount_options.clear();
                        set_condition(
                            &mut drive.status.conditions,
                            DRIVE_CONDITION_MOUNTED,
                            ConditionStatus::False,
                            REASON_ADDED,
                            "",
                        );
                        Ok(())
                    })
                    .await?;
                // The write above re-triggers reconciliation for the format.
                return Ok(());
            }

            if formatted && !force {
                return self
                    .reject_format(&name, "Drive already has a filesystem")
                    .await;
            }

            self.device_ops
                .format(Path::new(&drive.status.path), &requested_fs, force)?;
            log_info(
                COMPONENT,
                "Formatted drive",
                &[("drive", name.as_str()), ("filesystem", &requested_fs)],
            );
            self.store
                .update_drive(&name, |drive| {
                    drive.status.filesystem = requested_fs.clone();
                    drive.status.mountpoint.clear();
                    drive.status.mount_options.clear();
                    set_condition(
                        &mut drive.status.conditions,
                        DRIVE_CONDITION_FORMATTED,
                        ConditionStatus::True,
                        REASON_ADDED,
                        &requested_fs,
                    );
                    if let Some(requested) = drive.spec.requested_format.as_mut() {
                        requested.filesystem.clear();
                    }
                    Ok(())
                })
                .await?;
            return Ok(());
        }

        if !mounted {
            // Only drives with an outstanding admin request are mounted;
            // discovery alone never sets one.
            let Some(requested) = requested else {
                return Ok(());
            };
            if !formatted {
                return Ok(());
            }

            let mountpoint = if requested.mountpoint.is_empty() {
                drive.default_mountpoint()
            } else {
                PathBuf::from(&requested.mountpoint)
            };
            self.device_ops.mount(
                Path::new(&drive.status.path),
                &mountpoint,
                &drive.status.filesystem,
                &requested.mount_options,
            )?;
            let (total, free) = self.device_ops.capacity(&mountpoint)?;
            log_info(
                COMPONENT,
                "Mounted drive",
                &[
                    ("drive", name.as_str()),
                    ("mountpoint", &mountpoint.display().to_string()),
                ],
            );

            self.store
                .update_drive(&name, |drive| {
                    drive.status.mountpoint = mountpoint.display().to_string();
                    let mut options = vec![MOUNT_OPT_PRJQUOTA.to_string()];
                    for option in &requested.mount_options {
                        if option != MOUNT_OPT_PRJQUOTA && !option.is_empty() {
                            options.push(option.clone());
                        }
                    }
                    drive.status.mount_options = options;
                    drive.status.total_capacity = total as i64;
                    if !drive.metadata.has_finalizer(FINALIZER_DRIVE_IN_USE) {
                        // No bound volumes: the filesystem is the only
                        // consumer, so re-seed the allocation counter.
                        drive.status.allocated_capacity =
                            (total as i64 - free as i64).max(0);
                    }
                    drive.status.free_capacity =
                        (total as i64 - drive.status.allocated_capacity).min(free as i64);
                    drive.spec.requested_format = None;
                    set_condition(
                        &mut drive.status.conditions,
                        DRIVE_CONDITION_MOUNTED,
                        ConditionStatus::True,
                        REASON_ADDED,
                        &drive.status.mountpoint,
                    );
                    set_condition(
                        &mut drive.status.conditions,
                        DRIVE_CONDITION_OWNED,
                        ConditionStatus::True,
                        REASON_ADDED,
                        "",
                    );
                    if drive.status.drive_status == DriveStatus::Available
                        && !drive.status.filesystem.is_empty()
                        && crate::directcsi::apis::is_condition_true(
                            &drive.status.conditions,
                            DRIVE_CONDITION_INITIALIZED,
                        )
                    {
                        drive.status.drive_status = DriveStatus::Ready;
                    }
                    Ok(())
                })
                .await?;
            return Ok(());
        }

        // Steady state: keep free capacity fresh. Unchanged values skip the
        // write so reconciliation settles instead of looping.
        let (_, free) = self
            .device_ops
            .capacity(Path::new(&drive.status.mountpoint))?;
        let fresh = (drive.status.total_capacity - drive.status.allocated_capacity)
            .min(free as i64)
            .max(0);
        if fresh != drive.status.free_capacity {
            self.store
                .update_drive(&name, |drive| {
                    drive.status.free_capacity = fresh;
                    Ok(())
                })
                .await?;
        }
        Ok(())
    }

    /// Release path: wait for bound volumes to drain, then unmount and let
    /// the finalizer removal erase the object.
    async fn reconcile_release(&self, name: &str, drive: &DirectCsiDrive) -> Result<(), DynError> {
        if drive.metadata.has_finalizer(FINALIZER_DRIVE_IN_USE) {
            log_info(
                COMPONENT,
                "Drive is terminating but still has bound volumes",
                &[("drive", name)],
            );
            return Ok(());
        }

        if !drive.status.mountpoint.is_empty() {
            self.device_ops
                .unmount(Path::new(&drive.status.mountpoint))?;
        }
        self.store
            .update_drive(name, |drive| {
                drive.status.drive_status = DriveStatus::Terminating;
                drive.status.mountpoint.clear();
                drive.status.mount_options.clear();
                drive
                    .metadata
                    .remove_finalizer(crate::directcsi::apis::FINALIZER_DRIVE_CLEANUP);
                Ok(())
            })
            .await?;
        log_info(COMPONENT, "Released drive", &[("drive", name)]);
        Ok(())
    }

    async fn reject_format(&self, name: &str, message: &str) -> Result<(), DynError> {
        log_warn(COMPONENT, message, &[("drive", name)]);
        self.store
            .update_drive(name, |drive| {
                let formatted = !drive.status.filesystem.is_empty();
                set_condition(
                    &mut drive.status.conditions,
                    DRIVE_CONDITION_FORMATTED,
                    ConditionStatus::from(formatted),
                    REASON_REJECTED,
                    message,
                );
                drive.spec.requested_format = None;
                Ok(())
            })
            .await?;
        // Terminal: the request is cleared, nothing to retry.
        Ok(())
    }
}

#[async_trait]
impl Listener for DriveListener {
    fn name(&self) -> &'static str {
        COMPONENT
    }

    fn watch_prefix(&self) -> &'static str {
        DRIVES_PREFIX
    }

    fn list(&self) -> Result<Vec<(String, Value)>, DynError> {
        let mut listing = Vec::new();
        for value in self.store.list_drives_at(STORAGE_VERSION)? {
            let name = value["metadata"]["name"]
                .as_str()
                .unwrap_or_default()
                .to_string();
            listing.push((name, value));
        }
        Ok(listing)
    }

    async fn add(&self, _ctx: &ListenerContext, _key: &str, new: Value) -> Result<(), DynError> {
        self.reconcile(convert::drive_to_storage(new)?).await
    }

    async fn update(
        &self,
        _ctx: &ListenerContext,
        _key: &str,
        _old: Value,
        new: Value,
    ) -> Result<(), DynError> {
        self.reconcile(convert::drive_to_storage(new)?).await
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directcsi::apis::v1beta2::RequestedFormat;
    use crate::directcsi::apis::{is_condition_true, FINALIZER_DRIVE_IN_USE};
    use crate::directcsi::test_support::{FakeDeviceOps, TestEnv};

    const GIB: i64 = 1 << 30;

    fn new_drive(store: &ObjectStore, name: &str, requested: Option<RequestedFormat>) -> DirectCsiDrive {
        let mut drive = DirectCsiDrive::new(name);
        drive.status.node_name = "node-1".into();
        drive.status.path = format!("/dev/{}", name);
        drive.status.total_capacity = 100 * GIB;
        drive.status.free_capacity = 100 * GIB;
        drive.spec.requested_format = requested;
        set_condition(
            &mut drive.status.conditions,
            DRIVE_CONDITION_INITIALIZED,
            ConditionStatus::True,
            REASON_ADDED,
            "",
        );
        store.create_drive(drive.clone()).expect("create drive");
        drive
    }

    fn listener(partition: &'static str, ops: Arc<FakeDeviceOps>) -> DriveListener {
        DriveListener::new(ObjectStore::with_partition(partition), "node-1", ops)
    }

    /// Drives reconciliation until the object stops changing, mimicking the
    /// engine redelivering update events after each write.
    async fn settle(listener: &DriveListener, store: &ObjectStore, name: &str) -> DirectCsiDrive {
        for _ in 0..6 {
            let drive = store.get_drive(name).expect("get drive");
            listener.reconcile(drive).await.expect("reconcile");
        }
        store.get_drive(name).expect("get drive")
    }

    #[tokio::test]
    async fn formats_and_mounts_a_new_drive() {
        let _env = TestEnv::new();
        let store = ObjectStore::with_partition("dc-format");
        let ops = Arc::new(FakeDeviceOps::new(100 * GIB as u64));
        let listener = listener("dc-format", Arc::clone(&ops));

        let drive = new_drive(
            &store,
            "sda",
            Some(RequestedFormat {
                filesystem: "xfs".into(),
                ..Default::default()
            }),
        );

        let settled = settle(&listener, &store, &drive.metadata.name).await;
        assert_eq!(settled.status.drive_status, DriveStatus::Ready);
        assert_eq!(settled.status.filesystem, "xfs");
        assert!(settled.spec.requested_format.is_none());
        assert_eq!(
            settled.status.mountpoint,
            settled.default_mountpoint().display().to_string()
        );
        assert!(settled
            .status
            .mount_options
            .contains(&MOUNT_OPT_PRJQUOTA.to_string()));
        assert!(is_condition_true(
            &settled.status.conditions,
            DRIVE_CONDITION_FORMATTED
        ));
        assert!(is_condition_true(
            &settled.status.conditions,
            DRIVE_CONDITION_MOUNTED
        ));
        assert_eq!(ops.count_calls("format"), 1);
        assert_eq!(ops.count_calls("mount"), 1);
    }

    #[tokio::test]
    async fn reconcile_is_idempotent_after_settling() {
        let _env = TestEnv::new();
        let store = ObjectStore::with_partition("dc-idem");
        let ops = Arc::new(FakeDeviceOps::new(100 * GIB as u64));
        let listener = listener("dc-idem", Arc::clone(&ops));

        let drive = new_drive(
            &store,
            "sda",
            Some(RequestedFormat {
                filesystem: "xfs".into(),
                ..Default::default()
            }),
        );
        let settled = settle(&listener, &store, &drive.metadata.name).await;
        let calls_before = ops.calls().len();
        let resettled = settle(&listener, &store, &drive.metadata.name).await;

        assert_eq!(ops.count_calls("format"), 1);
        assert_eq!(ops.count_calls("mount"), 1);
        assert_eq!(ops.calls().len(), calls_before);
        assert_eq!(
            settled.metadata.resource_version,
            resettled.metadata.resource_version
        );
    }

    #[tokio::test]
    async fn refuses_to_format_an_already_formatted_drive_without_force() {
        let _env = TestEnv::new();
        let store = ObjectStore::with_partition("dc-noforce");
        let ops = Arc::new(FakeDeviceOps::new(100 * GIB as u64));
        let listener = listener("dc-noforce", Arc::clone(&ops));

        let mut drive = DirectCsiDrive::new("sdb");
        drive.status.node_name = "node-1".into();
        drive.status.path = "/dev/sdb".into();
        drive.status.filesystem = "ext4".into();
        drive.spec.requested_format = Some(RequestedFormat {
            filesystem: "xfs".into(),
            ..Default::default()
        });
        store.create_drive(drive).expect("create");

        let settled = settle(&listener, &store, "sdb").await;
        assert_eq!(settled.status.filesystem, "ext4");
        assert!(settled.spec.requested_format.is_none());
        assert_eq!(ops.count_calls("format"), 0);
        let formatted = settled
            .status
            .conditions
            .iter()
            .find(|c| c.condition_type == DRIVE_CONDITION_FORMATTED)
            .expect("condition");
        assert_eq!(formatted.reason, REASON_REJECTED);
    }

    #[tokio::test]
    async fn force_format_of_a_mounted_drive_unmounts_first() {
        let _env = TestEnv::new();
        let store = ObjectStore::with_partition("dc-force");
        let ops = Arc::new(FakeDeviceOps::new(100 * GIB as u64));
        let listener = listener("dc-force", Arc::clone(&ops));

        let mut drive = DirectCsiDrive::new("sdc");
        drive.status.node_name = "node-1".into();
        drive.status.path = "/dev/sdc".into();
        drive.status.filesystem = "ext4".into();
        drive.status.mountpoint = "/var/lib/direct-csi/mnt/sdc".into();
        set_condition(
            &mut drive.status.conditions,
            DRIVE_CONDITION_INITIALIZED,
            ConditionStatus::True,
            REASON_ADDED,
            "",
        );
        drive.spec.requested_format = Some(RequestedFormat {
            filesystem: "xfs".into(),
            force: true,
            ..Default::default()
        });
        store.create_drive(drive).expect("create");

        let settled = settle(&listener, &store, "sdc").await;
        assert_eq!(ops.count_calls("unmount"), 1);
        assert_eq!(ops.count_calls("format"), 1);
        assert_eq!(settled.status.filesystem, "xfs");
        assert_eq!(settled.status.drive_status, DriveStatus::Ready);
    }

    #[tokio::test]
    async fn never_formats_a_drive_with_bound_volumes() {
        let _env = TestEnv::new();
        let store = ObjectStore::with_partition("dc-inuse");
        let ops = Arc::new(FakeDeviceOps::new(100 * GIB as u64));
        let listener = listener("dc-inuse", Arc::clone(&ops));

        let mut drive = DirectCsiDrive::new("sdd");
        drive.status.node_name = "node-1".into();
        drive.status.path = "/dev/sdd".into();
        drive.status.filesystem = "xfs".into();
        drive.status.drive_status = DriveStatus::InUse;
        drive.metadata.add_finalizer(FINALIZER_DRIVE_IN_USE);
        drive.spec.requested_format = Some(RequestedFormat {
            filesystem: "xfs".into(),
            force: true,
            ..Default::default()
        });
        store.create_drive(drive).expect("create");

        let settled = settle(&listener, &store, "sdd").await;
        assert_eq!(ops.count_calls("format"), 0);
        assert_eq!(ops.count_calls("unmount"), 0);
        assert!(settled.spec.requested_format.is_none());
    }

    #[tokio::test]
    async fn release_waits_for_volumes_then_unmounts() {
        let _env = TestEnv::new();
        let store = ObjectStore::with_partition("dc-release");
        let ops = Arc::new(FakeDeviceOps::new(100 * GIB as u64));
        let listener = listener("dc-release", Arc::clone(&ops));

        let mut drive = DirectCsiDrive::new("sde");
        drive.status.node_name = "node-1".into();
        drive.status.path = "/dev/sde".into();
        drive.status.filesystem = "xfs".into();
        drive.status.mountpoint = "/var/lib/direct-csi/mnt/sde".into();
        drive
            .metadata
            .add_finalizer(crate::directcsi::apis::FINALIZER_DRIVE_CLEANUP);
        drive.metadata.add_finalizer(FINALIZER_DRIVE_IN_USE);
        store.create_drive(drive).expect("create");
        store.delete_drive("sde").await.expect("mark deletion");

        // Volumes still bound: nothing happens.
        let drive = store.get_drive("sde").expect("get");
        listener.reconcile(drive).await.expect("reconcile");
        assert_eq!(ops.count_calls("unmount"), 0);

        // Volume drained: next reconcile unmounts and erases the drive.
        store
            .update_drive("sde", |drive| {
                drive.metadata.remove_finalizer(FINALIZER_DRIVE_IN_USE);
                Ok(())
            })
            .await
            .expect("drain");
        let drive = store.get_drive("sde").expect("get again");
        listener.reconcile(drive).await.expect("reconcile release");
        assert_eq!(ops.count_calls("unmount"), 1);
        assert!(store.get_drive("sde").is_err());
    }
}
