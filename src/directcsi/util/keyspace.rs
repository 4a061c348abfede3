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

//! File-backed object store with per-key revisions, compare-and-swap writes,
//! TTL leases and prefix watches. Every stored custom object and the leader
//! lease live here; the informer consumes the watch stream.

use crate::directcsi::util::error::{
    new_error, with_context, CONFLICT_MARKER, NOT_FOUND_MARKER,
};
use crate::directcsi::Config;

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::error::Error;
use std::fs::{self, File, OpenOptions};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::broadcast;

const OBJECT_FILE_NAME: &str = "_object_";
const REVISION_FILE_NAME: &str = "_revision_";
const EXPIRY_FILE_NAME: &str = "_expiry_";
const MAX_KEY_DEPTH: usize = 8;
const MAX_KEY_LENGTH: usize = 256;
const WATCH_HISTORY_LIMIT: usize = 512;
const WATCH_CHANNEL_CAPACITY: usize = 128;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum KeyspaceEventType {
    Added,
    Modified,
    Deleted,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeyspaceEvent {
    #[serde(rename = "type")]
    pub event_type: KeyspaceEventType,
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(rename = "resourceVersion")]
    pub resource_version: u64,
}

impl KeyspaceEvent {
    fn matches_prefix(&self, prefix: &str) -> bool {
        if prefix == "/" {
            true
        } else {
            self.key.starts_with(prefix)
        }
    }
}

struct PartitionWatch {
    sender: broadcast::Sender<KeyspaceEvent>,
    history: RwLock<VecDeque<KeyspaceEvent>>,
    version: AtomicU64,
}

impl PartitionWatch {
    fn new() -> Self {
        let (sender, _) = broadcast::channel(WATCH_CHANNEL_CAPACITY);
        Self {
            sender,
            history: RwLock::new(VecDeque::new()),
            version: AtomicU64::new(0),
        }
    }

    fn next_version(&self) -> u64 {
        self.version.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn record(&self, event: KeyspaceEvent) {
        {
            let mut history = self
                .history
                .write()
                .expect("keyspace watch history lock poisoned");
            history.push_back(event.clone());
            if history.len() > WATCH_HISTORY_LIMIT {
                history.pop_front();
            }
        }
        let _ = self.sender.send(event);
    }

    fn snapshot_since(&self, since: u64) -> VecDeque<KeyspaceEvent> {
        let history = self
            .history
            .read()
            .expect("keyspace watch history lock poisoned");
        history
            .iter()
            .filter(|event| event.resource_version > since)
            .cloned()
            .collect()
    }
}

fn watch_registry() -> &'static Mutex<HashMap<&'static str, Arc<PartitionWatch>>> {
    static REGISTRY: OnceLock<Mutex<HashMap<&'static str, Arc<PartitionWatch>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

fn get_partition_watch(partition: &'static str) -> Arc<PartitionWatch> {
    let mut guard = watch_registry()
        .lock()
        .expect("keyspace watch registry lock poisoned");
    guard
        .entry(partition)
        .or_insert_with(|| Arc::new(PartitionWatch::new()))
        .clone()
}

fn publish_partition_event(
    partition: &'static str,
    key: String,
    value: Option<String>,
    event_type: KeyspaceEventType,
) {
    let watch = get_partition_watch(partition);
    let resource_version = watch.next_version();
    watch.record(KeyspaceEvent {
        event_type,
        key,
        value,
        resource_version,
    });
}

/// Stream of keyspace events under a prefix, replaying retained history
/// newer than `since` before switching to live delivery.
pub struct KeyspaceWatchStream {
    prefix: String,
    receiver: broadcast::Receiver<KeyspaceEvent>,
    partition: Arc<PartitionWatch>,
    backlog: VecDeque<KeyspaceEvent>,
    last_version: u64,
}

impl KeyspaceWatchStream {
    fn new(partition: Arc<PartitionWatch>, prefix: String, since: u64) -> Self {
        let receiver = partition.sender.subscribe();
        let mut stream = Self {
            prefix,
            receiver,
            partition,
            backlog: VecDeque::new(),
            last_version: since,
        };
        stream.refill_backlog();
        stream
    }

    fn refill_backlog(&mut self) {
        for event in self.partition.snapshot_since(self.last_version) {
            if event.matches_prefix(&self.prefix) {
                self.backlog.push_back(event);
            }
        }
    }

    pub async fn next(&mut self) -> Option<KeyspaceEvent> {
        if let Some(event) = self.backlog.pop_front() {
            self.last_version = event.resource_version;
            return Some(event);
        }

        loop {
            match self.receiver.recv().await {
                Ok(event) => {
                    if event.resource_version <= self.last_version {
                        continue;
                    }
                    self.last_version = event.resource_version;
                    if event.matches_prefix(&self.prefix) {
                        return Some(event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    self.refill_backlog();
                    if let Some(event) = self.backlog.pop_front() {
                        self.last_version = event.resource_version;
                        return Some(event);
                    }
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// A file-based lock guarding all keyspace mutations. Readers take the
/// shared guard, writers the exclusive one.
struct FileLock {
    file: File,
}

impl FileLock {
    fn new(shared: bool) -> std::io::Result<Self> {
        let lockfile_path = Config::LockFile.get_path();
        if let Some(parent) = lockfile_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(lockfile_path)?;
        if shared {
            file.lock_shared()?;
        } else {
            file.lock_exclusive()?;
        }
        Ok(Self { file })
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

#[derive(Clone, Copy)]
pub struct Keyspace {
    partition: &'static str,
}

impl Keyspace {
    pub const fn new(partition: &'static str) -> Keyspace {
        Keyspace { partition }
    }

    /// Returns a stream of events under `prefix`, starting after an optional
    /// resource version.
    pub fn watch(&self, prefix: &str, since: Option<u64>) -> KeyspaceWatchStream {
        let normalized = normalize_watch_prefix(prefix);
        let partition = get_partition_watch(self.partition);
        KeyspaceWatchStream::new(partition, normalized, since.unwrap_or(0))
    }

    /// Stores a value, creating or replacing it, and returns the new revision.
    pub fn put(&self, key: &str, value: &str) -> Result<u64, Box<dyn Error + Send + Sync>> {
        let key_path = resolve_path(self.partition, key)?;
        let _lock = FileLock::new(false)
            .map_err(|e| with_context(e, "Failed to acquire exclusive keyspace lock"))?;

        let existed = key_path.join(OBJECT_FILE_NAME).exists();
        let revision = read_revision(&key_path)? + 1;
        write_object(&key_path, value, revision)?;
        publish_partition_event(
            self.partition,
            key.to_string(),
            Some(value.to_string()),
            if existed {
                KeyspaceEventType::Modified
            } else {
                KeyspaceEventType::Added
            },
        );
        Ok(revision)
    }

    /// Replaces a value only when the stored revision still matches
    /// `expected_revision`; the primitive behind optimistic concurrency.
    /// `expected_revision == 0` demands that the key does not exist yet.
    pub fn swap(
        &self,
        key: &str,
        expected_revision: u64,
        value: &str,
    ) -> Result<u64, Box<dyn Error + Send + Sync>> {
        let key_path = resolve_path(self.partition, key)?;
        let _lock = FileLock::new(false)
            .map_err(|e| with_context(e, "Failed to acquire exclusive keyspace lock"))?;

        let existed = key_path.join(OBJECT_FILE_NAME).exists();
        let current = if existed { read_revision(&key_path)? } else { 0 };
        if current != expected_revision {
            return Err(new_error(format!(
                "{} for '{}': expected revision {}, found {}",
                CONFLICT_MARKER, key, expected_revision, current
            )));
        }

        let revision = current + 1;
        write_object(&key_path, value, revision)?;
        publish_partition_event(
            self.partition,
            key.to_string(),
            Some(value.to_string()),
            if existed {
                KeyspaceEventType::Modified
            } else {
                KeyspaceEventType::Added
            },
        );
        Ok(revision)
    }

    /// Retrieves the value and revision stored under `key`.
    pub fn get(&self, key: &str) -> Result<(String, u64), Box<dyn Error + Send + Sync>> {
        let key_path = resolve_path(self.partition, key)?;
        let _lock = FileLock::new(true)
            .map_err(|e| with_context(e, "Failed to acquire shared keyspace lock"))?;

        let value = read_object(&key_path)?
            .ok_or_else(|| new_error(format!("{}: '{}'", NOT_FOUND_MARKER, key)))?;
        let revision = read_revision(&key_path)?;
        Ok((value, revision))
    }

    /// Lists every `(key, value, revision)` stored under `prefix`, sorted by key.
    pub fn list(
        &self,
        prefix: &str,
    ) -> Result<Vec<(String, String, u64)>, Box<dyn Error + Send + Sync>> {
        let base_path = resolve_path(self.partition, prefix)?;
        let _lock = FileLock::new(true)
            .map_err(|e| with_context(e, "Failed to acquire shared keyspace lock"))?;

        let mut entries = Vec::new();
        if base_path.exists() {
            collect_entries(self.partition, &base_path, &mut entries)?;
        }
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(entries)
    }

    /// Deletes the value stored under `key`. Missing keys are an error so
    /// callers can distinguish double deletes.
    pub fn delete(&self, key: &str) -> Result<(), Box<dyn Error + Send + Sync>> {
        let key_path = resolve_path(self.partition, key)?;
        let _lock = FileLock::new(false)
            .map_err(|e| with_context(e, "Failed to acquire exclusive keyspace lock"))?;

        if !key_path.join(OBJECT_FILE_NAME).exists() {
            return Err(new_error(format!("{}: '{}'", NOT_FOUND_MARKER, key)));
        }
        for name in [OBJECT_FILE_NAME, REVISION_FILE_NAME, EXPIRY_FILE_NAME] {
            let file = key_path.join(name);
            if let Err(e) = fs::remove_file(&file) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    return Err(with_context(
                        e,
                        format!("Failed to remove '{}'", file.display()),
                    ));
                }
            }
        }
        cleanup_empty_dirs(self.partition, &key_path);
        publish_partition_event(
            self.partition,
            key.to_string(),
            None,
            KeyspaceEventType::Deleted,
        );
        Ok(())
    }

    /// Attempts to take or retake a lease. Returns true when `identity`
    /// holds the lease afterwards.
    pub fn acquire_lease(
        &self,
        key: &str,
        identity: &str,
        ttl: Duration,
    ) -> Result<bool, Box<dyn Error + Send + Sync>> {
        let key_path = resolve_path(self.partition, key)?;
        let _lock = FileLock::new(false)
            .map_err(|e| with_context(e, "Failed to acquire exclusive keyspace lock"))?;

        if let Some(holder) = read_object(&key_path)? {
            let expired = match read_expiry(&key_path)? {
                Some(expiry) => SystemTime::now() >= expiry,
                None => true,
            };
            if holder != identity && !expired {
                return Ok(false);
            }
        }

        let revision = read_revision(&key_path)? + 1;
        write_object(&key_path, identity, revision)?;
        write_expiry(&key_path, SystemTime::now() + ttl)?;
        Ok(true)
    }

    /// Extends a lease held by `identity`. Fails when the lease was lost.
    pub fn renew_lease(
        &self,
        key: &str,
        identity: &str,
        ttl: Duration,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        let key_path = resolve_path(self.partition, key)?;
        let _lock = FileLock::new(false)
            .map_err(|e| with_context(e, "Failed to acquire exclusive keyspace lock"))?;

        match read_object(&key_path)? {
            Some(holder) if holder == identity => {
                write_expiry(&key_path, SystemTime::now() + ttl)?;
                Ok(())
            }
            Some(holder) => Err(new_error(format!(
                "Lease '{}' is held by '{}'",
                key, holder
            ))),
            None => Err(new_error(format!("{}: lease '{}'", NOT_FOUND_MARKER, key))),
        }
    }

    /// Releases a lease if `identity` still holds it.
    pub fn release_lease(
        &self,
        key: &str,
        identity: &str,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        let key_path = resolve_path(self.partition, key)?;
        let _lock = FileLock::new(false)
            .map_err(|e| with_context(e, "Failed to acquire exclusive keyspace lock"))?;

        if let Some(holder) = read_object(&key_path)? {
            if holder == identity {
                for name in [OBJECT_FILE_NAME, REVISION_FILE_NAME, EXPIRY_FILE_NAME] {
                    let _ = fs::remove_file(key_path.join(name));
                }
                cleanup_empty_dirs(self.partition, &key_path);
            }
        }
        Ok(())
    }
}

fn collect_entries(
    partition: &str,
    dir: &Path,
    out: &mut Vec<(String, String, u64)>,
) -> Result<(), Box<dyn Error + Send + Sync>> {
    if let Some(value) = read_object(dir)? {
        let revision = read_revision(dir)?;
        out.push((resolve_key(partition, dir)?, value, revision));
    }
    for entry in fs::read_dir(dir)
        .map_err(|e| with_context(e, format!("Failed to read directory '{}'", dir.display())))?
    {
        let entry = entry.map_err(|e| {
            with_context(e, format!("Failed to iterate directory '{}'", dir.display()))
        })?;
        let path = entry.path();
        if path.is_dir() {
            collect_entries(partition, &path, out)?;
        } else if path.extension().map(|e| e == "tmp").unwrap_or(false) {
            // Leftover from an interrupted write; safe to drop under the lock.
            let _ = fs::remove_file(&path);
        }
    }
    Ok(())
}

fn normalize_watch_prefix(prefix: &str) -> String {
    if prefix.is_empty() || prefix == "/" {
        "/".to_string()
    } else if prefix.starts_with('/') {
        prefix.to_string()
    } else {
        format!("/{}", prefix)
    }
}

/// Resolves a key path into a full path within the partition root.
fn resolve_path(partition: &str, key: &str) -> Result<PathBuf, Box<dyn Error + Send + Sync>> {
    if key.is_empty() {
        return Err(new_error("Key path is empty"));
    }
    if key.len() > MAX_KEY_LENGTH {
        return Err(new_error(format!(
            "Key path \"{}\" exceeds max length of {} characters",
            key, MAX_KEY_LENGTH
        )));
    }
    if !is_valid_key_path(key) {
        return Err(new_error(format!(
            "Key path \"{}\" must start with '/' and contain only alphanumeric segments",
            key
        )));
    }
    if key != "/" {
        let depth = key.split('/').filter(|segment| !segment.is_empty()).count();
        if depth > MAX_KEY_DEPTH {
            return Err(new_error(format!(
                "Key path \"{}\" exceeds max depth of {} segments",
                key, MAX_KEY_DEPTH
            )));
        }
    }

    let partition_root = Config::Keyspace.get_path().join(partition);
    fs::create_dir_all(&partition_root).map_err(|e| {
        with_context(
            e,
            format!(
                "Failed to prepare keyspace partition '{}'",
                partition_root.display()
            ),
        )
    })?;

    if key == "/" {
        Ok(partition_root)
    } else {
        Ok(partition_root.join(&key[1..]))
    }
}

fn is_valid_key_path(key: &str) -> bool {
    if !key.starts_with('/') {
        return false;
    }
    if key == "/" {
        return true;
    }
    key.split('/').skip(1).all(|segment| {
        !segment.is_empty()
            && segment
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
    })
}

fn resolve_key(partition: &str, path: &Path) -> Result<String, Box<dyn Error + Send + Sync>> {
    path.strip_prefix(Config::Keyspace.get_path().join(partition))
        .map(|key| format!("/{}", key.to_string_lossy()))
        .map_err(|_| {
            new_error(format!(
                "Path {} is not part of keyspace partition {}",
                path.display(),
                partition
            ))
        })
}

fn write_object(
    key_path: &Path,
    value: &str,
    revision: u64,
) -> Result<(), Box<dyn Error + Send + Sync>> {
    fs::create_dir_all(key_path).map_err(|e| {
        with_context(
            e,
            format!("Failed to create directories for '{}'", key_path.display()),
        )
    })?;
    persist_atomically(&key_path.join(OBJECT_FILE_NAME), value.as_bytes())?;
    persist_atomically(
        &key_path.join(REVISION_FILE_NAME),
        revision.to_string().as_bytes(),
    )?;
    Ok(())
}

fn read_object(key_path: &Path) -> Result<Option<String>, Box<dyn Error + Send + Sync>> {
    let object_file = key_path.join(OBJECT_FILE_NAME);
    if !object_file.exists() {
        return Ok(None);
    }
    let mut contents = String::new();
    File::open(&object_file)
        .map_err(|e| {
            with_context(
                e,
                format!("Failed to open object file '{}'", object_file.display()),
            )
        })?
        .read_to_string(&mut contents)
        .map_err(|e| {
            with_context(
                e,
                format!("Failed to read object file '{}'", object_file.display()),
            )
        })?;
    Ok(Some(contents))
}

fn read_revision(key_path: &Path) -> Result<u64, Box<dyn Error + Send + Sync>> {
    let revision_file = key_path.join(REVISION_FILE_NAME);
    if !revision_file.exists() {
        return Ok(0);
    }
    let contents = fs::read_to_string(&revision_file).map_err(|e| {
        with_context(
            e,
            format!("Failed to read revision file '{}'", revision_file.display()),
        )
    })?;
    contents.trim().parse().map_err(|e| {
        with_context(
            e,
            format!("Invalid revision in '{}'", revision_file.display()),
        )
    })
}

fn write_expiry(key_path: &Path, expiry: SystemTime) -> Result<(), Box<dyn Error + Send + Sync>> {
    let secs = expiry
        .duration_since(UNIX_EPOCH)
        .map_err(|e| with_context(e, "Expiry precedes UNIX_EPOCH"))?
        .as_secs();
    persist_atomically(&key_path.join(EXPIRY_FILE_NAME), secs.to_string().as_bytes())
}

fn read_expiry(key_path: &Path) -> Result<Option<SystemTime>, Box<dyn Error + Send + Sync>> {
    let expiry_file = key_path.join(EXPIRY_FILE_NAME);
    if !expiry_file.exists() {
        return Ok(None);
    }
    let contents = fs::read_to_string(&expiry_file).map_err(|e| {
        with_context(
            e,
            format!("Failed to read expiry file '{}'", expiry_file.display()),
        )
    })?;
    let secs: u64 = contents.trim().parse().map_err(|e| {
        with_context(e, format!("Invalid expiry in '{}'", expiry_file.display()))
    })?;
    Ok(Some(UNIX_EPOCH + Duration::from_secs(secs)))
}

fn cleanup_empty_dirs(partition: &str, key_path: &Path) {
    let data_root = Config::Keyspace.get_path().join(partition);
    let mut dir = key_path.to_path_buf();
    while dir != data_root && dir.starts_with(&data_root) {
        match fs::remove_dir(&dir) {
            Ok(_) => match dir.parent() {
                Some(parent) => dir = parent.to_path_buf(),
                None => break,
            },
            Err(_) => break,
        }
    }
}

fn persist_atomically(target: &Path, data: &[u8]) -> Result<(), Box<dyn Error + Send + Sync>> {
    use std::io::Write;

    let parent = target.parent().ok_or_else(|| {
        new_error(format!(
            "Target '{}' does not have a parent directory",
            target.display()
        ))
    })?;
    fs::create_dir_all(parent).map_err(|e| {
        with_context(
            e,
            format!("Failed to create parent directory '{}'", parent.display()),
        )
    })?;

    let tmpfile_path = target.with_extension("tmp");
    let mut tmpfile = File::create(&tmpfile_path).map_err(|e| {
        with_context(
            e,
            format!(
                "Failed to create temporary file '{}'",
                tmpfile_path.display()
            ),
        )
    })?;
    if let Err(e) = tmpfile.write_all(data).and_then(|_| tmpfile.sync_all()) {
        let _ = fs::remove_file(&tmpfile_path);
        return Err(with_context(
            e,
            format!("Failed to write temporary file '{}'", tmpfile_path.display()),
        ));
    }
    drop(tmpfile);

    if let Err(e) = fs::rename(&tmpfile_path, target) {
        let _ = fs::remove_file(&tmpfile_path);
        return Err(with_context(
            e,
            format!("Failed to replace file '{}'", target.display()),
        ));
    }

    if let Ok(dir_file) = File::open(parent) {
        let _ = dir_file.sync_all();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directcsi::test_support::TestEnv;
    use crate::directcsi::util::error::{is_conflict_error, is_not_found_error};

    #[test]
    fn put_get_delete_round_trip() {
        let _env = TestEnv::new();
        let ks = Keyspace::new("ks-roundtrip");
        let rev = ks.put("/drives/abc", "{\"a\":1}").expect("put");
        assert_eq!(rev, 1);
        let (value, revision) = ks.get("/drives/abc").expect("get");
        assert_eq!(value, "{\"a\":1}");
        assert_eq!(revision, 1);
        ks.delete("/drives/abc").expect("delete");
        let err = ks.get("/drives/abc").unwrap_err();
        assert!(is_not_found_error(err.as_ref()));
    }

    #[test]
    fn swap_detects_stale_revision() {
        let _env = TestEnv::new();
        let ks = Keyspace::new("ks-swap");
        let rev = ks.put("/volumes/v1", "one").expect("put");
        let rev = ks.swap("/volumes/v1", rev, "two").expect("swap");
        assert_eq!(rev, 2);

        let err = ks.swap("/volumes/v1", 1, "stale").unwrap_err();
        assert!(is_conflict_error(err.as_ref()));
        let (value, _) = ks.get("/volumes/v1").expect("get");
        assert_eq!(value, "two");
    }

    #[test]
    fn swap_with_zero_revision_creates_once() {
        let _env = TestEnv::new();
        let ks = Keyspace::new("ks-create");
        ks.swap("/volumes/new", 0, "created").expect("create");
        let err = ks.swap("/volumes/new", 0, "again").unwrap_err();
        assert!(is_conflict_error(err.as_ref()));
    }

    #[test]
    fn list_returns_sorted_entries_under_prefix() {
        let _env = TestEnv::new();
        let ks = Keyspace::new("ks-list");
        ks.put("/drives/b", "B").expect("put b");
        ks.put("/drives/a", "A").expect("put a");
        ks.put("/volumes/x", "X").expect("put x");

        let drives = ks.list("/drives").expect("list");
        let keys: Vec<_> = drives.iter().map(|(k, _, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["/drives/a", "/drives/b"]);
    }

    #[test]
    fn rejects_traversal_and_invalid_keys() {
        let _env = TestEnv::new();
        let ks = Keyspace::new("ks-invalid");
        assert!(ks.put("drives/a", "x").is_err());
        assert!(ks.put("/drives/../etc", "x").is_err());
        assert!(ks.put("/drives/a b", "x").is_err());
    }

    #[test]
    fn lease_acquire_renew_and_steal_after_expiry() {
        let _env = TestEnv::new();
        let ks = Keyspace::new("ks-lease");
        let ttl = Duration::from_secs(60);
        assert!(ks.acquire_lease("/leases/ctl", "alpha", ttl).expect("acquire"));
        assert!(!ks.acquire_lease("/leases/ctl", "beta", ttl).expect("contend"));
        ks.renew_lease("/leases/ctl", "alpha", ttl).expect("renew");
        assert!(ks.renew_lease("/leases/ctl", "beta", ttl).is_err());

        // Zero TTL lease is immediately reclaimable.
        assert!(ks
            .acquire_lease("/leases/ctl", "alpha", Duration::ZERO)
            .expect("re-acquire"));
        assert!(ks.acquire_lease("/leases/ctl", "beta", ttl).expect("steal"));
        assert!(ks.renew_lease("/leases/ctl", "alpha", ttl).is_err());
    }

    #[tokio::test]
    async fn watch_delivers_typed_events_in_order() {
        let _env = TestEnv::new();
        let ks = Keyspace::new("ks-watch");
        let mut stream = ks.watch("/drives", None);

        ks.put("/drives/d1", "one").expect("put");
        ks.put("/drives/d1", "two").expect("modify");
        ks.delete("/drives/d1").expect("delete");

        let added = stream.next().await.expect("added");
        assert_eq!(added.event_type, KeyspaceEventType::Added);
        assert_eq!(added.value.as_deref(), Some("one"));
        let modified = stream.next().await.expect("modified");
        assert_eq!(modified.event_type, KeyspaceEventType::Modified);
        let deleted = stream.next().await.expect("deleted");
        assert_eq!(deleted.event_type, KeyspaceEventType::Deleted);
        assert!(added.resource_version < modified.resource_version);
        assert!(modified.resource_version < deleted.resource_version);
    }

    #[tokio::test]
    async fn watch_resumes_from_resource_version() {
        let _env = TestEnv::new();
        let ks = Keyspace::new("ks-resume");
        ks.put("/drives/d1", "one").expect("put");
        let mut first = ks.watch("/drives", None);
        let seen = first.next().await.expect("event");

        ks.put("/drives/d2", "two").expect("put2");
        let mut resumed = ks.watch("/drives", Some(seen.resource_version));
        let event = resumed.next().await.expect("resumed event");
        assert_eq!(event.key, "/drives/d2");
    }
}
