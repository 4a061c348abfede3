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

//! Typed client over the object keyspace. Writes use optimistic concurrency
//! with a bounded, jittered retry budget; reads are transparently converted
//! to the requested schema version.

use crate::directcsi::apis::convert::{self, STORAGE_VERSION};
use crate::directcsi::apis::v1beta2::{DirectCsiDrive, DirectCsiVolume};
use crate::directcsi::logger::{log_info, log_warn};
use crate::directcsi::util::error::{is_conflict_error, new_error, with_context};
use crate::directcsi::util::{Keyspace, KeyspaceWatchStream};

use rand::Rng;
use serde_json::Value;
use std::error::Error;
use std::time::Duration;

type DynError = Box<dyn Error + Send + Sync>;

const COMPONENT: &str = "object-store";

pub const DRIVES_PREFIX: &str = "/drives";
pub const VOLUMES_PREFIX: &str = "/volumes";
const STORED_VERSIONS_KEY: &str = "/meta/storedversions";

const UPDATE_RETRY_BUDGET: usize = 5;
const UPDATE_RETRY_BASE: Duration = Duration::from_millis(100);
const UPDATE_RETRY_JITTER_MS: u64 = 50;

/// Handle to the stored custom objects. Constructed once at startup and
/// passed to every component that talks to the store.
#[derive(Clone, Copy)]
pub struct ObjectStore {
    keyspace: Keyspace,
}

impl Default for ObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectStore {
    pub fn new() -> Self {
        Self {
            keyspace: Keyspace::new("objects"),
        }
    }

    pub fn with_partition(partition: &'static str) -> Self {
        Self {
            keyspace: Keyspace::new(partition),
        }
    }

    fn drive_key(name: &str) -> String {
        format!("{}/{}", DRIVES_PREFIX, name)
    }

    fn volume_key(name: &str) -> String {
        format!("{}/{}", VOLUMES_PREFIX, name)
    }

    // ----- drives -----

    pub fn create_drive(&self, mut drive: DirectCsiDrive) -> Result<DirectCsiDrive, DynError> {
        drive.metadata.resource_version = None;
        let name = drive.metadata.name.clone();
        let payload = serde_json::to_string(&drive)
            .map_err(|e| with_context(e, format!("Failed to encode drive '{}'", name)))?;
        let revision = self.keyspace.swap(&Self::drive_key(&name), 0, &payload)?;
        drive.metadata.resource_version = Some(revision.to_string());
        Ok(drive)
    }

    pub fn get_drive(&self, name: &str) -> Result<DirectCsiDrive, DynError> {
        let (value, revision) = self.keyspace.get(&Self::drive_key(name))?;
        decode_drive(&value, revision)
    }

    pub fn list_drives(&self) -> Result<Vec<DirectCsiDrive>, DynError> {
        let mut drives = Vec::new();
        for (key, value, revision) in self.keyspace.list(DRIVES_PREFIX)? {
            match decode_drive(&value, revision) {
                Ok(drive) => drives.push(drive),
                Err(e) => log_warn(
                    COMPONENT,
                    "Skipping undecodable drive",
                    &[("key", &key), ("error", &e.to_string())],
                ),
            }
        }
        Ok(drives)
    }

    /// Lists drives converted to an explicitly requested schema version.
    pub fn list_drives_at(&self, api_version: &str) -> Result<Vec<Value>, DynError> {
        let mut out = Vec::new();
        for (key, value, revision) in self.keyspace.list(DRIVES_PREFIX)? {
            let raw: Value = serde_json::from_str(&value)
                .map_err(|e| with_context(e, format!("Failed to parse stored object '{}'", key)))?;
            let mut converted = convert::convert_drive(raw, api_version)?;
            set_resource_version(&mut converted, revision);
            out.push(converted);
        }
        Ok(out)
    }

    /// Re-reads and reapplies `mutate` until the write lands or the retry
    /// budget is exhausted. Removing the last finalizer of a terminating
    /// object deletes it instead of writing it back.
    pub async fn update_drive<F>(&self, name: &str, mutate: F) -> Result<DirectCsiDrive, DynError>
    where
        F: Fn(&mut DirectCsiDrive) -> Result<(), DynError>,
    {
        let key = Self::drive_key(name);
        retry_on_conflict(&key, || {
            let mut drive = self.get_drive(name)?;
            mutate(&mut drive)?;
            self.write_back_drive(drive)
        })
        .await
    }

    fn write_back_drive(&self, mut drive: DirectCsiDrive) -> Result<DirectCsiDrive, DynError> {
        let name = drive.metadata.name.clone();
        let key = Self::drive_key(&name);
        let expected = parse_resource_version(&drive.metadata.resource_version, &name)?;

        if drive.metadata.deletion_timestamp.is_some() && drive.metadata.finalizers.is_empty() {
            self.keyspace.delete(&key)?;
            return Ok(drive);
        }

        drive.metadata.resource_version = None;
        let payload = serde_json::to_string(&drive)
            .map_err(|e| with_context(e, format!("Failed to encode drive '{}'", name)))?;
        let revision = self.keyspace.swap(&key, expected, &payload)?;
        drive.metadata.resource_version = Some(revision.to_string());
        Ok(drive)
    }

    /// Requests deletion. With finalizers present the object is only marked;
    /// it disappears once the last finalizer is removed.
    pub async fn delete_drive(&self, name: &str) -> Result<(), DynError> {
        let key = Self::drive_key(name);
        retry_on_conflict(&key, || {
            let mut drive = self.get_drive(name)?;
            if drive.metadata.finalizers.is_empty() {
                self.keyspace.delete(&key)?;
                return Ok(());
            }
            if drive.metadata.deletion_timestamp.is_none() {
                drive.metadata.deletion_timestamp = Some(chrono::Utc::now());
                drive.status.drive_status =
                    crate::directcsi::apis::v1beta2::DriveStatus::Terminating;
                self.write_back_drive(drive)?;
            }
            Ok(())
        })
        .await
    }

    pub fn watch_drives(&self, since: Option<u64>) -> KeyspaceWatchStream {
        self.keyspace.watch(DRIVES_PREFIX, since)
    }

    // ----- volumes -----

    pub fn create_volume(&self, mut volume: DirectCsiVolume) -> Result<DirectCsiVolume, DynError> {
        volume.metadata.resource_version = None;
        let name = volume.metadata.name.clone();
        let payload = serde_json::to_string(&volume)
            .map_err(|e| with_context(e, format!("Failed to encode volume '{}'", name)))?;
        let revision = self.keyspace.swap(&Self::volume_key(&name), 0, &payload)?;
        volume.metadata.resource_version = Some(revision.to_string());
        Ok(volume)
    }

    pub fn get_volume(&self, name: &str) -> Result<DirectCsiVolume, DynError> {
        let (value, revision) = self.keyspace.get(&Self::volume_key(name))?;
        decode_volume(&value, revision)
    }

    pub fn list_volumes(&self) -> Result<Vec<DirectCsiVolume>, DynError> {
        let mut volumes = Vec::new();
        for (key, value, revision) in self.keyspace.list(VOLUMES_PREFIX)? {
            match decode_volume(&value, revision) {
                Ok(volume) => volumes.push(volume),
                Err(e) => log_warn(
                    COMPONENT,
                    "Skipping undecodable volume",
                    &[("key", &key), ("error", &e.to_string())],
                ),
            }
        }
        Ok(volumes)
    }

    pub fn list_volumes_at(&self, api_version: &str) -> Result<Vec<Value>, DynError> {
        let mut out = Vec::new();
        for (key, value, revision) in self.keyspace.list(VOLUMES_PREFIX)? {
            let raw: Value = serde_json::from_str(&value)
                .map_err(|e| with_context(e, format!("Failed to parse stored object '{}'", key)))?;
            let mut converted = convert::convert_volume(raw, api_version)?;
            set_resource_version(&mut converted, revision);
            out.push(converted);
        }
        Ok(out)
    }

    pub async fn update_volume<F>(&self, name: &str, mutate: F) -> Result<DirectCsiVolume, DynError>
    where
        F: Fn(&mut DirectCsiVolume) -> Result<(), DynError>,
    {
        let key = Self::volume_key(name);
        retry_on_conflict(&key, || {
            let mut volume = self.get_volume(name)?;
            mutate(&mut volume)?;
            self.write_back_volume(volume)
        })
        .await
    }

    fn write_back_volume(&self, mut volume: DirectCsiVolume) -> Result<DirectCsiVolume, DynError> {
        let name = volume.metadata.name.clone();
        let key = Self::volume_key(&name);
        let expected = parse_resource_version(&volume.metadata.resource_version, &name)?;

        if volume.metadata.deletion_timestamp.is_some() && volume.metadata.finalizers.is_empty() {
            self.keyspace.delete(&key)?;
            return Ok(volume);
        }

        volume.metadata.resource_version = None;
        let payload = serde_json::to_string(&volume)
            .map_err(|e| with_context(e, format!("Failed to encode volume '{}'", name)))?;
        let revision = self.keyspace.swap(&key, expected, &payload)?;
        volume.metadata.resource_version = Some(revision.to_string());
        Ok(volume)
    }

    pub async fn delete_volume(&self, name: &str) -> Result<(), DynError> {
        let key = Self::volume_key(name);
        retry_on_conflict(&key, || {
            let mut volume = self.get_volume(name)?;
            if volume.metadata.finalizers.is_empty() {
                self.keyspace.delete(&key)?;
                return Ok(());
            }
            if volume.metadata.deletion_timestamp.is_none() {
                volume.metadata.deletion_timestamp = Some(chrono::Utc::now());
                self.write_back_volume(volume)?;
            }
            Ok(())
        })
        .await
    }

    pub fn watch_volumes(&self, since: Option<u64>) -> KeyspaceWatchStream {
        self.keyspace.watch(VOLUMES_PREFIX, since)
    }

    // ----- storage-version migration -----

    /// Rewrites every stored object into the storage version and records the
    /// served version list. Individual failures are logged and skipped; the
    /// pass runs again after the next leader election.
    pub fn migrate_stored_objects(&self) -> Result<(usize, usize), DynError> {
        let mut migrated = 0usize;
        let mut skipped = 0usize;

        for prefix in [DRIVES_PREFIX, VOLUMES_PREFIX] {
            for (key, value, revision) in self.keyspace.list(prefix)? {
                match migrate_value(&value) {
                    Ok(Some(rewritten)) => {
                        match self.keyspace.swap(&key, revision, &rewritten) {
                            Ok(_) => migrated += 1,
                            Err(e) => {
                                skipped += 1;
                                log_warn(
                                    COMPONENT,
                                    "Failed to rewrite object at storage version",
                                    &[("key", &key), ("error", &e.to_string())],
                                );
                            }
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        skipped += 1;
                        log_warn(
                            COMPONENT,
                            "Failed to convert stored object",
                            &[("key", &key), ("error", &e.to_string())],
                        );
                    }
                }
            }
        }

        self.keyspace
            .put(STORED_VERSIONS_KEY, &format!("[\"{}\"]", STORAGE_VERSION))?;
        log_info(
            COMPONENT,
            "Storage-version migration finished",
            &[
                ("migrated", &migrated.to_string()),
                ("skipped", &skipped.to_string()),
            ],
        );
        Ok((migrated, skipped))
    }
}

/// Converts a stored payload to the storage version; `None` when it is
/// already stored there and needs no rewrite.
fn migrate_value(value: &str) -> Result<Option<String>, DynError> {
    let raw: Value = serde_json::from_str(value)
        .map_err(|e| with_context(e, "Failed to parse stored object"))?;
    let api_version = raw
        .get("apiVersion")
        .and_then(Value::as_str)
        .unwrap_or_default();
    if api_version == STORAGE_VERSION {
        return Ok(None);
    }
    let converted = convert::convert(raw, STORAGE_VERSION)?;
    Ok(Some(serde_json::to_string(&converted).map_err(|e| {
        with_context(e, "Failed to encode migrated object")
    })?))
}

fn decode_drive(value: &str, revision: u64) -> Result<DirectCsiDrive, DynError> {
    let raw: Value = serde_json::from_str(value)
        .map_err(|e| with_context(e, "Failed to parse stored drive"))?;
    let mut drive = convert::drive_to_storage(raw)?;
    drive.metadata.resource_version = Some(revision.to_string());
    Ok(drive)
}

fn decode_volume(value: &str, revision: u64) -> Result<DirectCsiVolume, DynError> {
    let raw: Value = serde_json::from_str(value)
        .map_err(|e| with_context(e, "Failed to parse stored volume"))?;
    let mut volume = convert::volume_to_storage(raw)?;
    volume.metadata.resource_version = Some(revision.to_string());
    Ok(volume)
}

fn set_resource_version(value: &mut Value, revision: u64) {
    if let Some(metadata) = value.get_mut("metadata") {
        if let Some(object) = metadata.as_object_mut() {
            object.insert(
                "resourceVersion".to_string(),
                Value::String(revision.to_string()),
            );
        }
    }
}

fn parse_resource_version(
    resource_version: &Option<String>,
    name: &str,
) -> Result<u64, DynError> {
    let raw = resource_version
        .as_deref()
        .ok_or_else(|| new_error(format!("Object '{}' has no resource version", name)))?;
    raw.parse()
        .map_err(|e| with_context(e, format!("Invalid resource version on '{}'", name)))
}

async fn retry_on_conflict<T, F>(key: &str, mut attempt_fn: F) -> Result<T, DynError>
where
    F: FnMut() -> Result<T, DynError>,
{
    let mut delay = UPDATE_RETRY_BASE;
    for attempt in 1..=UPDATE_RETRY_BUDGET {
        match attempt_fn() {
            Ok(result) => return Ok(result),
            Err(e) if is_conflict_error(e.as_ref()) => {
                if attempt == UPDATE_RETRY_BUDGET {
                    return Err(with_context(
                        e,
                        format!("Update of '{}' did not land within the retry budget", key),
                    ));
                }
                let jitter = rand::thread_rng().gen_range(0..=UPDATE_RETRY_JITTER_MS);
                tokio::time::sleep(delay + Duration::from_millis(jitter)).await;
                delay *= 2;
            }
            Err(e) => return Err(e),
        }
    }
    unreachable!("retry loop returns before exhausting the budget")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directcsi::apis::v1alpha1;
    use crate::directcsi::apis::v1beta2::DriveStatus;
    use crate::directcsi::apis::FINALIZER_VOLUME_PROTECTION;
    use crate::directcsi::test_support::TestEnv;
    use crate::directcsi::util::error::is_not_found_error;

    fn sample_drive(name: &str) -> DirectCsiDrive {
        let mut drive = DirectCsiDrive::new(name);
        drive.status.node_name = "node-1".into();
        drive.status.total_capacity = 1 << 30;
        drive.status.free_capacity = 1 << 30;
        drive
    }

    #[tokio::test]
    async fn create_get_update_delete_drive() {
        let _env = TestEnv::new();
        let store = ObjectStore::with_partition("client-crud");

        let created = store.create_drive(sample_drive("d1")).expect("create");
        assert_eq!(created.metadata.resource_version.as_deref(), Some("1"));

        let updated = store
            .update_drive("d1", |drive| {
                drive.status.drive_status = DriveStatus::Ready;
                Ok(())
            })
            .await
            .expect("update");
        assert_eq!(updated.status.drive_status, DriveStatus::Ready);
        assert_eq!(updated.metadata.resource_version.as_deref(), Some("2"));

        store.delete_drive("d1").await.expect("delete");
        let err = store.get_drive("d1").unwrap_err();
        assert!(is_not_found_error(err.as_ref()));
    }

    #[tokio::test]
    async fn create_twice_conflicts() {
        let _env = TestEnv::new();
        let store = ObjectStore::with_partition("client-dup");
        store.create_drive(sample_drive("d1")).expect("create");
        let err = store.create_drive(sample_drive("d1")).unwrap_err();
        assert!(is_conflict_error(err.as_ref()));
    }

    #[tokio::test]
    async fn update_reapplies_mutator_after_conflict() {
        let _env = TestEnv::new();
        let store = ObjectStore::with_partition("client-retry");
        store.create_drive(sample_drive("d1")).expect("create");

        // A competing writer bumps the revision between our read and write on
        // the first attempt only.
        let raced = std::sync::atomic::AtomicBool::new(false);
        let result = store
            .update_drive("d1", |drive| {
                if !raced.swap(true, std::sync::atomic::Ordering::SeqCst) {
                    let competing = Keyspace::new("client-retry");
                    let (value, revision) = competing.get("/drives/d1")?;
                    competing.swap("/drives/d1", revision, &value)?;
                }
                drive.status.allocated_capacity += 10;
                Ok(())
            })
            .await
            .expect("update should retry through the conflict");
        assert_eq!(result.status.allocated_capacity, 10);
    }

    #[tokio::test]
    async fn delete_waits_for_finalizers() {
        let _env = TestEnv::new();
        let store = ObjectStore::with_partition("client-finalizer");
        let mut volume = DirectCsiVolume::new("v1");
        volume.metadata.add_finalizer(FINALIZER_VOLUME_PROTECTION);
        store.create_volume(volume).expect("create");

        store.delete_volume("v1").await.expect("mark");
        let marked = store.get_volume("v1").expect("still present");
        assert!(marked.metadata.deletion_timestamp.is_some());

        store
            .update_volume("v1", |volume| {
                volume.metadata.remove_finalizer(FINALIZER_VOLUME_PROTECTION);
                Ok(())
            })
            .await
            .expect("drain finalizer");
        let err = store.get_volume("v1").unwrap_err();
        assert!(is_not_found_error(err.as_ref()));
    }

    #[tokio::test]
    async fn listing_converts_historical_versions() {
        let _env = TestEnv::new();
        let store = ObjectStore::with_partition("client-versions");

        // Persist an object at the oldest version, bypassing the typed API.
        let alpha = serde_json::json!({
            "apiVersion": v1alpha1::API_VERSION,
            "kind": "DirectCSIDrive",
            "metadata": {"name": "old"},
            "ownerNode": "node-9",
            "totalCapacity": 100,
            "freeCapacity": 60,
            "driveStatus": "new",
        });
        Keyspace::new("client-versions")
            .put("/drives/old", &alpha.to_string())
            .expect("seed");

        let drives = store.list_drives().expect("list");
        assert_eq!(drives.len(), 1);
        assert_eq!(drives[0].status.node_name, "node-9");
        assert_eq!(drives[0].status.allocated_capacity, 40);

        let downgraded = store
            .list_drives_at(v1alpha1::API_VERSION)
            .expect("list at alpha");
        assert_eq!(downgraded[0]["ownerNode"], "node-9");
        assert_eq!(downgraded[0]["metadata"]["resourceVersion"], "1");
    }

    #[tokio::test]
    async fn migration_rewrites_old_objects_once() {
        let _env = TestEnv::new();
        let store = ObjectStore::with_partition("client-migrate");

        let alpha = serde_json::json!({
            "apiVersion": v1alpha1::API_VERSION,
            "kind": "DirectCSIDrive",
            "metadata": {"name": "old"},
            "ownerNode": "node-1",
            "totalCapacity": 100,
            "freeCapacity": 100,
            "driveStatus": "new",
        });
        Keyspace::new("client-migrate")
            .put("/drives/old", &alpha.to_string())
            .expect("seed");

        let (migrated, skipped) = store.migrate_stored_objects().expect("migrate");
        assert_eq!((migrated, skipped), (1, 0));

        let (value, _) = Keyspace::new("client-migrate")
            .get("/drives/old")
            .expect("read back");
        assert!(value.contains(STORAGE_VERSION));

        // Second pass finds everything current and rewrites nothing.
        let (migrated, skipped) = store.migrate_stored_objects().expect("migrate again");
        assert_eq!((migrated, skipped), (0, 0));
    }
}
