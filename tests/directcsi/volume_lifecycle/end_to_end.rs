use direct_csi::directcsi::apis::v1beta2::{AccessTier, DirectCsiDrive, DriveStatus};
use direct_csi::directcsi::apis::{
    is_condition_true, FINALIZER_DRIVE_IN_USE, VOLUME_CONDITION_PUBLISHED, VOLUME_CONDITION_STAGED,
};
use direct_csi::directcsi::client::ObjectStore;
use direct_csi::directcsi::controller::ControllerServer;
use direct_csi::directcsi::csi::types::{
    CapacityRange, Code, CreateVolumeRequest, DeleteVolumeRequest, MountVolumeCapability,
    NodePublishVolumeRequest, NodeStageVolumeRequest, NodeUnpublishVolumeRequest,
    NodeUnstageVolumeRequest, VolumeCapability,
};
use direct_csi::directcsi::node::server::NodeServer;
use direct_csi::directcsi::node::DriverIdentity;
use direct_csi::directcsi::test_support::{FakeDeviceOps, TestEnv};
use std::sync::Arc;

const GIB: i64 = 1 << 30;

fn create_request(name: &str, gib: i64) -> CreateVolumeRequest {
    CreateVolumeRequest {
        name: name.to_string(),
        capacity_range: Some(CapacityRange {
            required_bytes: Some(gib * GIB),
            limit_bytes: None,
        }),
        volume_capabilities: vec![VolumeCapability {
            access_mode: None,
            mount: Some(MountVolumeCapability {
                fs_type: Some("xfs".into()),
                mount_flags: Vec::new(),
            }),
        }],
        parameters: Default::default(),
        accessibility_requirements: None,
    }
}

struct Harness {
    env: TestEnv,
    store: ObjectStore,
    ops: Arc<FakeDeviceOps>,
    controller: ControllerServer,
    node: NodeServer,
}

fn harness(partition: &'static str) -> Harness {
    let env = TestEnv::new();
    let store = ObjectStore::with_partition(partition);
    let ops = Arc::new(FakeDeviceOps::new(100 * GIB as u64));

    let mountpoint = env.root().join("mnt/drive-a");
    std::fs::create_dir_all(&mountpoint).expect("mountpoint");

    let mut drive = DirectCsiDrive::new("drive-a");
    drive.status.node_name = "node-1".into();
    drive.status.filesystem = "xfs".into();
    drive.status.mountpoint = mountpoint.display().to_string();
    drive.status.drive_status = DriveStatus::Ready;
    drive.status.total_capacity = 100 * GIB;
    drive.status.free_capacity = 100 * GIB;
    drive.status.access_tier = AccessTier::Hot;
    store.create_drive(drive).expect("create drive");

    let identity = DriverIdentity {
        node_id: "node-1".into(),
        rack: "default".into(),
        zone: "default".into(),
        region: "default".into(),
    };
    Harness {
        env,
        store,
        ops: Arc::clone(&ops),
        controller: ControllerServer::new(store),
        node: NodeServer::new(identity, store, ops),
    }
}

// The full lifecycle: schedule, stage, publish, then the inverse, with the
// drive's allocation rising and falling accordingly.
#[tokio::test]
async fn volume_lifecycle_from_create_to_delete() {
    let h = harness("it-lifecycle");

    let response = h
        .controller
        .create_volume(&create_request("pvc-1", 10))
        .await
        .expect("create volume");
    assert_eq!(response.volume.capacity_bytes, 10 * GIB);

    // Bound volume implies a live, schedulable drive carrying the bytes.
    let drive = h.store.get_drive("drive-a").expect("drive");
    assert_eq!(drive.status.drive_status, DriveStatus::InUse);
    assert_eq!(drive.status.allocated_capacity, 10 * GIB);
    assert!(drive.metadata.has_finalizer(FINALIZER_DRIVE_IN_USE));

    let staging = h.env.root().join("staging/pvc-1").display().to_string();
    h.node
        .stage_volume(&NodeStageVolumeRequest {
            volume_id: "pvc-1".into(),
            staging_target_path: staging.clone(),
            ..Default::default()
        })
        .await
        .expect("stage");
    assert_eq!(h.ops.count_calls("quota"), 1);

    // Deleting while staged is refused.
    let err = h
        .controller
        .delete_volume(&DeleteVolumeRequest {
            volume_id: "pvc-1".into(),
        })
        .await
        .unwrap_err();
    assert_eq!(err.code, Code::FailedPrecondition);

    let target = h.env.root().join("pods/p1/pvc-1").display().to_string();
    h.node
        .publish_volume(&NodePublishVolumeRequest {
            volume_id: "pvc-1".into(),
            target_path: target.clone(),
            ..Default::default()
        })
        .await
        .expect("publish");

    let volume = h.store.get_volume("pvc-1").expect("volume");
    assert!(is_condition_true(
        &volume.status.conditions,
        VOLUME_CONDITION_STAGED
    ));
    assert!(is_condition_true(
        &volume.status.conditions,
        VOLUME_CONDITION_PUBLISHED
    ));

    h.node
        .unpublish_volume(&NodeUnpublishVolumeRequest {
            volume_id: "pvc-1".into(),
            target_path: target,
        })
        .await
        .expect("unpublish");
    h.node
        .unstage_volume(&NodeUnstageVolumeRequest {
            volume_id: "pvc-1".into(),
            staging_target_path: staging,
        })
        .await
        .expect("unstage");

    h.controller
        .delete_volume(&DeleteVolumeRequest {
            volume_id: "pvc-1".into(),
        })
        .await
        .expect("delete");

    assert!(h.store.get_volume("pvc-1").is_err());
    let drive = h.store.get_drive("drive-a").expect("drive after delete");
    assert_eq!(drive.status.allocated_capacity, 0);
    assert_eq!(drive.status.drive_status, DriveStatus::Ready);
    assert!(!drive.metadata.has_finalizer(FINALIZER_DRIVE_IN_USE));
}

// The allocation counter never exceeds the drive size, and requests beyond
// the remaining free space are rejected with OutOfRange.
#[tokio::test]
async fn allocations_never_exceed_drive_capacity() {
    let h = harness("it-capacity");

    for (name, gib) in [("pvc-1", 40), ("pvc-2", 40)] {
        h.controller
            .create_volume(&create_request(name, gib))
            .await
            .expect("create");
    }

    let err = h
        .controller
        .create_volume(&create_request("pvc-3", 40))
        .await
        .unwrap_err();
    assert_eq!(err.code, Code::OutOfRange);

    let drive = h.store.get_drive("drive-a").expect("drive");
    let bound: i64 = h
        .store
        .list_volumes()
        .expect("volumes")
        .iter()
        .filter(|volume| volume.status.drive == "drive-a")
        .map(|volume| volume.status.total_capacity)
        .sum();
    assert_eq!(bound, 80 * GIB);
    assert!(bound <= drive.status.total_capacity);
    assert_eq!(drive.status.free_capacity, 20 * GIB);
}

// Every bound volume points at exactly one live drive.
#[tokio::test]
async fn bound_volumes_reference_live_drives() {
    let h = harness("it-binding");

    for name in ["pvc-1", "pvc-2", "pvc-3"] {
        h.controller
            .create_volume(&create_request(name, 5))
            .await
            .expect("create");
    }

    let drives = h.store.list_drives().expect("drives");
    for volume in h.store.list_volumes().expect("volumes") {
        let bound: Vec<_> = drives
            .iter()
            .filter(|drive| drive.metadata.name == volume.status.drive)
            .collect();
        assert_eq!(bound.len(), 1, "volume {} binding", volume.metadata.name);
        assert!(matches!(
            bound[0].status.drive_status,
            DriveStatus::Ready | DriveStatus::InUse
        ));
    }
}
