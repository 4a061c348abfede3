use direct_csi::directcsi::apis::convert::STORAGE_VERSION;
use direct_csi::directcsi::apis::v1alpha1;
use direct_csi::directcsi::client::ObjectStore;
use direct_csi::directcsi::test_support::TestEnv;
use direct_csi::directcsi::util::Keyspace;

// A drive persisted at the oldest version is upgraded in place on the
// migration pass, keeps its fields, and is not rewritten again afterwards.
#[tokio::test]
async fn upgrade_preserves_fields_without_spurious_rewrites() {
    let _env = TestEnv::new();
    let store = ObjectStore::with_partition("it-migration");
    let keyspace = Keyspace::new("it-migration");

    let alpha = serde_json::json!({
        "apiVersion": v1alpha1::API_VERSION,
        "kind": "DirectCSIDrive",
        "metadata": {"name": "legacy"},
        "ownerNode": "node-1",
        "modelNumber": "WDC WD40EFRX",
        "serialNumber": "WD-1234",
        "totalCapacity": 4_000_000_000_000i64,
        "freeCapacity": 3_000_000_000_000i64,
        "blockSize": 512,
        "path": "/dev/sdb",
        "filesystem": "xfs",
        "mountpoint": "/var/lib/direct-csi/mnt/legacy",
        "driveStatus": "online",
    });
    keyspace
        .put("/drives/legacy", &alpha.to_string())
        .expect("seed legacy drive");

    let (migrated, skipped) = store.migrate_stored_objects().expect("first pass");
    assert_eq!((migrated, skipped), (1, 0));

    let drive = store.get_drive("legacy").expect("read upgraded drive");
    assert_eq!(drive.api_version, STORAGE_VERSION);
    assert_eq!(drive.status.node_name, "node-1");
    assert_eq!(drive.status.model_number, "WDC WD40EFRX");
    assert_eq!(drive.status.serial_number, "WD-1234");
    assert_eq!(drive.status.filesystem, "xfs");
    assert_eq!(drive.status.allocated_capacity, 1_000_000_000_000i64);
    assert_eq!(drive.metadata.resource_version.as_deref(), Some("2"));

    // Nothing left at an old version: the second pass rewrites nothing and
    // the resource version stays where the upgrade put it.
    let (migrated, skipped) = store.migrate_stored_objects().expect("second pass");
    assert_eq!((migrated, skipped), (0, 0));
    let drive = store.get_drive("legacy").expect("read again");
    assert_eq!(drive.metadata.resource_version.as_deref(), Some("2"));
}

// Reading at an old version downgrades on the fly without touching storage.
#[tokio::test]
async fn reads_at_historical_versions_are_converted_not_rewritten() {
    let _env = TestEnv::new();
    let store = ObjectStore::with_partition("it-downgrade");

    let mut drive = direct_csi::directcsi::apis::v1beta2::DirectCsiDrive::new("modern");
    drive.status.node_name = "node-2".into();
    drive.status.total_capacity = 100;
    drive.status.allocated_capacity = 25;
    store.create_drive(drive).expect("create");

    let listed = store
        .list_drives_at(v1alpha1::API_VERSION)
        .expect("list at v1alpha1");
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0]["apiVersion"], v1alpha1::API_VERSION);
    assert_eq!(listed[0]["ownerNode"], "node-2");
    assert_eq!(listed[0]["freeCapacity"], 75);

    let stored = store.get_drive("modern").expect("storage read");
    assert_eq!(stored.metadata.resource_version.as_deref(), Some("1"));
}
