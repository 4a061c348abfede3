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

//! Node service: staging and publishing volumes on this node. Staging
//! bind-mounts a project-quota subdirectory of the drive; publishing binds
//! the staged path into the pod target under a per-target lock.

use crate::directcsi::apis::{
    is_condition_true, set_condition, ConditionStatus, FINALIZER_PUBLISHED_AT_PREFIX,
    REASON_IN_USE, REASON_NOT_IN_USE, VOLUME_CONDITION_PUBLISHED, VOLUME_CONDITION_READY,
    VOLUME_CONDITION_STAGED,
};
use crate::directcsi::client::ObjectStore;
use crate::directcsi::csi::types::{
    CsiError, NodeGetInfoResponse, NodeGetVolumeStatsRequest, NodeGetVolumeStatsResponse,
    NodePublishVolumeRequest, NodeStageVolumeRequest, NodeUnpublishVolumeRequest,
    NodeUnstageVolumeRequest, Topology, VolumeUsage,
};
use crate::directcsi::logger::{log_debug, log_info};
use crate::directcsi::node::DriverIdentity;
use crate::directcsi::sys::fs::DeviceOps;
use crate::directcsi::util::error::is_not_found_error;

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

const COMPONENT: &str = "node-server";

/// Bounded acquire for the per-target publish lock. The value trades off
/// against the CSI sidecar's own retry budget and is deployment-specific.
const PUBLISH_LOCK_TIMEOUT: Duration = Duration::from_secs(60);
const PUBLISH_LOCK_POLL: Duration = Duration::from_secs(2);

pub struct NodeServer {
    identity: DriverIdentity,
    store: ObjectStore,
    device_ops: Arc<dyn DeviceOps>,
    // Process-wide path -> mutex map; the critical section only spans the
    // mount-table check and the mount itself.
    publish_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl NodeServer {
    pub fn new(identity: DriverIdentity, store: ObjectStore, device_ops: Arc<dyn DeviceOps>) -> Self {
        Self {
            identity,
            store,
            device_ops,
            publish_locks: Mutex::new(HashMap::new()),
        }
    }

    pub async fn stage_volume(&self, request: &NodeStageVolumeRequest) -> Result<(), CsiError> {
        let volume_id = require(&request.volume_id, "volume ID missing in request")?;
        let staging_path = require(
            &request.staging_target_path,
            "stagingTargetPath missing in request",
        )?;

        let volume = self
            .store
            .get_volume(volume_id)
            .map_err(CsiError::from_store)?;

        // Already staged there: nothing to do, no second mount syscall.
        if volume.status.staging_path == staging_path {
            return Ok(());
        }

        let drive = self
            .store
            .get_drive(&volume.status.drive)
            .map_err(CsiError::from_store)?;
        if drive.status.mountpoint.is_empty() {
            return Err(CsiError::failed_precondition(format!(
                "Drive {} backing volume {} is not mounted",
                drive.metadata.name, volume_id
            )));
        }

        let host_path = Path::new(&drive.status.mountpoint).join(volume_id);
        std::fs::create_dir_all(&host_path).map_err(|e| {
            CsiError::internal(format!(
                "Failed to create volume directory '{}': {}",
                host_path.display(),
                e
            ))
        })?;

        self.device_ops
            .bind_mount(&host_path, Path::new(staging_path), false)
            .map_err(|e| CsiError::internal(format!("Failed to stage volume: {}", e)))?;
        self.device_ops
            .set_quota(
                Path::new(&drive.status.mountpoint),
                &host_path,
                volume_id,
                volume.status.total_capacity.max(0) as u64,
            )
            .map_err(|e| CsiError::internal(format!("Failed to set volume quota: {}", e)))?;

        let staging = staging_path.to_string();
        let host = host_path.display().to_string();
        self.store
            .update_volume(volume_id, |volume| {
                volume.status.staging_path = staging.clone();
                volume.status.host_path = host.clone();
                set_condition(
                    &mut volume.status.conditions,
                    VOLUME_CONDITION_STAGED,
                    ConditionStatus::True,
                    REASON_IN_USE,
                    &staging,
                );
                set_condition(
                    &mut volume.status.conditions,
                    VOLUME_CONDITION_READY,
                    ConditionStatus::True,
                    REASON_IN_USE,
                    "",
                );
                Ok(())
            })
            .await
            .map_err(CsiError::from_store)?;

        log_info(
            COMPONENT,
            "Staged volume",
            &[("volume", volume_id), ("stagingPath", staging_path)],
        );
        Ok(())
    }

    pub async fn unstage_volume(&self, request: &NodeUnstageVolumeRequest) -> Result<(), CsiError> {
        let volume_id = require(&request.volume_id, "volume ID missing in request")?;
        let staging_path = require(
            &request.staging_target_path,
            "stagingTargetPath missing in request",
        )?;

        let volume = match self.store.get_volume(volume_id) {
            Ok(volume) => volume,
            // The object is gone; unstage is idempotent.
            Err(e) if is_not_found_error(e.as_ref()) => return Ok(()),
            Err(e) => return Err(CsiError::from_store(e)),
        };
        if volume.status.staging_path.is_empty() {
            return Ok(());
        }

        self.device_ops
            .unmount(Path::new(staging_path))
            .map_err(|e| CsiError::internal(format!("Failed to unstage volume: {}", e)))?;

        self.store
            .update_volume(volume_id, |volume| {
                volume.status.staging_path.clear();
                volume.status.host_path.clear();
                set_condition(
                    &mut volume.status.conditions,
                    VOLUME_CONDITION_STAGED,
                    ConditionStatus::False,
                    REASON_NOT_IN_USE,
                    "",
                );
                set_condition(
                    &mut volume.status.conditions,
                    VOLUME_CONDITION_READY,
                    ConditionStatus::False,
                    REASON_NOT_IN_USE,
                    "",
                );
                Ok(())
            })
            .await
            .map_err(CsiError::from_store)?;

        log_info(COMPONENT, "Unstaged volume", &[("volume", volume_id)]);
        Ok(())
    }

    pub async fn publish_volume(&self, request: &NodePublishVolumeRequest) -> Result<(), CsiError> {
        let volume_id = require(&request.volume_id, "volume ID missing in request")?;
        let target_path = require(&request.target_path, "targetPath missing in request")?;

        let volume = self
            .store
            .get_volume(volume_id)
            .map_err(CsiError::from_store)?;
        if !is_condition_true(&volume.status.conditions, VOLUME_CONDITION_STAGED) {
            return Err(CsiError::failed_precondition(format!(
                "Volume {} is not staged",
                volume_id
            )));
        }
        let staging_path = if request.staging_target_path.is_empty() {
            volume.status.staging_path.clone()
        } else {
            request.staging_target_path.clone()
        };

        let _guard = self.acquire_publish_lock(target_path).await?;

        // Under the lock: a concurrent publish either already mounted the
        // target (we skip) or is still waiting behind us.
        self.device_ops
            .bind_mount(
                Path::new(&staging_path),
                Path::new(target_path),
                request.readonly,
            )
            .map_err(|e| CsiError::internal(format!("Failed to publish volume: {}", e)))?;

        let finalizer = publish_finalizer(target_path);
        self.store
            .update_volume(volume_id, |volume| {
                volume.metadata.add_finalizer(finalizer.clone());
                set_condition(
                    &mut volume.status.conditions,
                    VOLUME_CONDITION_PUBLISHED,
                    ConditionStatus::True,
                    REASON_IN_USE,
                    "",
                );
                Ok(())
            })
            .await
            .map_err(CsiError::from_store)?;

        log_info(
            COMPONENT,
            "Published volume",
            &[("volume", volume_id), ("targetPath", target_path)],
        );
        Ok(())
    }

    pub async fn unpublish_volume(
        &self,
        request: &NodeUnpublishVolumeRequest,
    ) -> Result<(), CsiError> {
        let volume_id = require(&request.volume_id, "volume ID missing in request")?;
        let target_path = require(&request.target_path, "targetPath missing in request")?;

        let _guard = self.acquire_publish_lock(target_path).await?;

        self.device_ops
            .unmount(Path::new(target_path))
            .map_err(|e| CsiError::internal(format!("Failed to unpublish volume: {}", e)))?;

        match self.store.get_volume(volume_id) {
            Ok(_) => {
                let finalizer = publish_finalizer(target_path);
                self.store
                    .update_volume(volume_id, |volume| {
                        volume.metadata.remove_finalizer(&finalizer);
                        let still_published = volume
                            .metadata
                            .finalizers
                            .iter()
                            .any(|f| f.starts_with(FINALIZER_PUBLISHED_AT_PREFIX));
                        if !still_published {
                            set_condition(
                                &mut volume.status.conditions,
                                VOLUME_CONDITION_PUBLISHED,
                                ConditionStatus::False,
                                REASON_NOT_IN_USE,
                                "",
                            );
                        }
                        Ok(())
                    })
                    .await
                    .map_err(CsiError::from_store)?;
            }
            Err(e) if is_not_found_error(e.as_ref()) => {}
            Err(e) => return Err(CsiError::from_store(e)),
        }

        log_info(
            COMPONENT,
            "Unpublished volume",
            &[("volume", volume_id), ("targetPath", target_path)],
        );
        Ok(())
    }

    pub async fn volume_stats(
        &self,
        request: &NodeGetVolumeStatsRequest,
    ) -> Result<NodeGetVolumeStatsResponse, CsiError> {
        let volume_id = require(&request.volume_id, "volume ID missing in request")?;
        let volume = self
            .store
            .get_volume(volume_id)
            .map_err(CsiError::from_store)?;
        let drive = self
            .store
            .get_drive(&volume.status.drive)
            .map_err(CsiError::from_store)?;

        let (used, total) = self
            .device_ops
            .quota_stats(Path::new(&drive.status.mountpoint), volume_id)
            .map_err(|e| CsiError::internal(format!("Failed to read volume quota: {}", e)))?;

        Ok(NodeGetVolumeStatsResponse {
            usage: vec![VolumeUsage {
                used: used as i64,
                total: total as i64,
                available: total.saturating_sub(used) as i64,
                unit: "BYTES".to_string(),
            }],
        })
    }

    pub fn node_info(&self) -> NodeGetInfoResponse {
        NodeGetInfoResponse {
            node_id: self.identity.node_id.clone(),
            accessible_topology: Topology {
                segments: self.identity.topology(),
            },
        }
    }

    async fn acquire_publish_lock(
        &self,
        target_path: &str,
    ) -> Result<tokio::sync::OwnedMutexGuard<()>, CsiError> {
        let lock = {
            let mut locks = self.publish_locks.lock().expect("publish lock map poisoned");
            Arc::clone(locks.entry(target_path.to_string()).or_default())
        };

        let deadline = Instant::now() + PUBLISH_LOCK_TIMEOUT;
        loop {
            if let Ok(guard) = Arc::clone(&lock).try_lock_owned() {
                return Ok(guard);
            }
            if Instant::now() >= deadline {
                // Retriable from the caller's perspective.
                return Err(CsiError::internal(format!(
                    "Timed out acquiring publish lock for {}",
                    target_path
                )));
            }
            log_debug(
                COMPONENT,
                "Waiting for publish lock",
                &[("targetPath", target_path)],
            );
            tokio::time::sleep(PUBLISH_LOCK_POLL).await;
        }
    }
}

fn publish_finalizer(target_path: &str) -> String {
    format!("{}{}", FINALIZER_PUBLISHED_AT_PREFIX, target_path)
}

fn require<'a>(value: &'a str, message: &str) -> Result<&'a str, CsiError> {
    if value.is_empty() {
        Err(CsiError::invalid_argument(message))
    } else {
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directcsi::apis::v1beta2::{DirectCsiDrive, DirectCsiVolume, DriveStatus};
    use crate::directcsi::apis::FINALIZER_VOLUME_PROTECTION;
    use crate::directcsi::csi::types::Code;
    use crate::directcsi::test_support::{FakeDeviceOps, TestEnv};

    const GIB: i64 = 1 << 30;

    fn identity() -> DriverIdentity {
        DriverIdentity {
            node_id: "node-1".into(),
            rack: "default".into(),
            zone: "default".into(),
            region: "default".into(),
        }
    }

    fn seed(partition: &'static str, mount_root: &str) -> (ObjectStore, Arc<FakeDeviceOps>, NodeServer) {
        let store = ObjectStore::with_partition(partition);
        let ops = Arc::new(FakeDeviceOps::new(100 * GIB as u64));

        let mut drive = DirectCsiDrive::new("drive-a");
        drive.status.node_name = "node-1".into();
        drive.status.mountpoint = mount_root.to_string();
        drive.status.filesystem = "xfs".into();
        drive.status.drive_status = DriveStatus::InUse;
        drive.status.total_capacity = 100 * GIB;
        store.create_drive(drive).expect("create drive");

        let mut volume = DirectCsiVolume::new("v-1");
        volume.metadata.add_finalizer(FINALIZER_VOLUME_PROTECTION);
        volume.status.drive = "drive-a".into();
        volume.status.node_name = "node-1".into();
        volume.status.total_capacity = 10 * GIB;
        store.create_volume(volume).expect("create volume");

        let server = NodeServer::new(identity(), store, Arc::clone(&ops) as Arc<dyn DeviceOps>);
        (store, ops, server)
    }

    fn stage_request(env: &TestEnv) -> NodeStageVolumeRequest {
        NodeStageVolumeRequest {
            volume_id: "v-1".into(),
            staging_target_path: env.root().join("staging/v-1").display().to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn stage_then_restage_is_idempotent() {
        let env = TestEnv::new();
        let mount_root = env.root().join("mnt/drive-a");
        std::fs::create_dir_all(&mount_root).expect("mount root");
        let (store, ops, server) =
            seed("ns-stage", &mount_root.display().to_string());
        let request = stage_request(&env);

        server.stage_volume(&request).await.expect("stage");
        assert_eq!(ops.count_calls("bind"), 1);
        assert_eq!(ops.count_calls("quota"), 1);

        let volume = store.get_volume("v-1").expect("volume");
        assert_eq!(volume.status.staging_path, request.staging_target_path);
        assert!(is_condition_true(
            &volume.status.conditions,
            VOLUME_CONDITION_STAGED
        ));
        assert!(volume.status.host_path.ends_with("/v-1"));

        // Second call with the same arguments: no second mount syscall.
        server.stage_volume(&request).await.expect("re-stage");
        assert_eq!(ops.count_calls("bind"), 1);
    }

    #[tokio::test]
    async fn unstage_of_missing_volume_succeeds() {
        let env = TestEnv::new();
        let mount_root = env.root().join("mnt/drive-a");
        std::fs::create_dir_all(&mount_root).expect("mount root");
        let (store, _ops, server) =
            seed("ns-unstage", &mount_root.display().to_string());

        store
            .update_volume("v-1", |volume| {
                volume.metadata.remove_finalizer(FINALIZER_VOLUME_PROTECTION);
                Ok(())
            })
            .await
            .expect("drop finalizer");
        store.delete_volume("v-1").await.expect("delete volume");

        let request = NodeUnstageVolumeRequest {
            volume_id: "v-1".into(),
            staging_target_path: "/staging/v-1".into(),
        };
        server.unstage_volume(&request).await.expect("unstage");
    }

    #[tokio::test]
    async fn publish_requires_a_staged_volume() {
        let env = TestEnv::new();
        let mount_root = env.root().join("mnt/drive-a");
        std::fs::create_dir_all(&mount_root).expect("mount root");
        let (_store, _ops, server) =
            seed("ns-unstaged-publish", &mount_root.display().to_string());

        let request = NodePublishVolumeRequest {
            volume_id: "v-1".into(),
            target_path: "/pods/p1/volumes/v-1".into(),
            ..Default::default()
        };
        let err = server.publish_volume(&request).await.unwrap_err();
        assert_eq!(err.code, Code::FailedPrecondition);
    }

    #[tokio::test]
    async fn concurrent_publishes_mount_exactly_once() {
        let env = TestEnv::new();
        let mount_root = env.root().join("mnt/drive-a");
        std::fs::create_dir_all(&mount_root).expect("mount root");
        let (store, ops, server) =
            seed("ns-contention", &mount_root.display().to_string());
        server.stage_volume(&stage_request(&env)).await.expect("stage");

        let server = Arc::new(server);
        let request = NodePublishVolumeRequest {
            volume_id: "v-1".into(),
            target_path: env.root().join("pods/p1/v-1").display().to_string(),
            ..Default::default()
        };

        let a = tokio::spawn({
            let server = Arc::clone(&server);
            let request = request.clone();
            async move { server.publish_volume(&request).await }
        });
        let b = tokio::spawn({
            let server = Arc::clone(&server);
            let request = request.clone();
            async move { server.publish_volume(&request).await }
        });
        a.await.expect("join a").expect("publish a");
        b.await.expect("join b").expect("publish b");

        // One bind for staging, exactly one for the shared target.
        assert_eq!(ops.count_calls("bind"), 2);

        let volume = store.get_volume("v-1").expect("volume");
        assert!(is_condition_true(
            &volume.status.conditions,
            VOLUME_CONDITION_PUBLISHED
        ));
        assert!(volume
            .metadata
            .finalizers
            .iter()
            .any(|f| f.starts_with(FINALIZER_PUBLISHED_AT_PREFIX)));
    }

    #[tokio::test]
    async fn unpublish_clears_the_target_token() {
        let env = TestEnv::new();
        let mount_root = env.root().join("mnt/drive-a");
        std::fs::create_dir_all(&mount_root).expect("mount root");
        let (store, ops, server) =
            seed("ns-unpublish", &mount_root.display().to_string());
        server.stage_volume(&stage_request(&env)).await.expect("stage");

        let target = env.root().join("pods/p1/v-1").display().to_string();
        let publish = NodePublishVolumeRequest {
            volume_id: "v-1".into(),
            target_path: target.clone(),
            ..Default::default()
        };
        server.publish_volume(&publish).await.expect("publish");

        let unpublish = NodeUnpublishVolumeRequest {
            volume_id: "v-1".into(),
            target_path: target.clone(),
        };
        server.unpublish_volume(&unpublish).await.expect("unpublish");
        assert_eq!(ops.count_calls("unmount"), 1);

        let volume = store.get_volume("v-1").expect("volume");
        assert!(!is_condition_true(
            &volume.status.conditions,
            VOLUME_CONDITION_PUBLISHED
        ));
        assert!(!volume
            .metadata
            .finalizers
            .iter()
            .any(|f| f.starts_with(FINALIZER_PUBLISHED_AT_PREFIX)));
    }

    #[tokio::test]
    async fn volume_stats_report_quota_usage() {
        let env = TestEnv::new();
        let mount_root = env.root().join("mnt/drive-a");
        std::fs::create_dir_all(&mount_root).expect("mount root");
        let (_store, _ops, server) = seed("ns-stats", &mount_root.display().to_string());

        let response = server
            .volume_stats(&NodeGetVolumeStatsRequest {
                volume_id: "v-1".into(),
                volume_path: String::new(),
            })
            .await
            .expect("stats");
        assert_eq!(response.usage.len(), 1);
        assert_eq!(response.usage[0].unit, "BYTES");
        assert_eq!(
            response.usage[0].total,
            response.usage[0].used + response.usage[0].available
        );
    }

    #[tokio::test]
    async fn missing_volume_id_is_invalid_argument() {
        let env = TestEnv::new();
        let mount_root = env.root().join("mnt/drive-a");
        std::fs::create_dir_all(&mount_root).expect("mount root");
        let (_store, _ops, server) = seed("ns-validate", &mount_root.display().to_string());

        let err = server
            .stage_volume(&NodeStageVolumeRequest::default())
            .await
            .unwrap_err();
        assert_eq!(err.code, Code::InvalidArgument);
    }
}
