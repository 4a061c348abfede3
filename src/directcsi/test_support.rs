#![allow(dead_code)]

use std::env;
use std::fs;
use std::path::PathBuf;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Mutex, MutexGuard, OnceLock,
};

/// Global mutex used by tests that repoint the keyspace environment so they
/// do not interfere with each other when running in parallel.
pub fn keyspace_lock() -> &'static Mutex<()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
}

fn target_dir() -> PathBuf {
    if let Ok(dir) = env::var("CARGO_TARGET_DIR") {
        PathBuf::from(dir)
    } else {
        env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join("target")
    }
}

/// Returns a unique directory under `target/test-output/<component>/`.
pub fn test_output_dir(component: &str) -> PathBuf {
    static COUNTER: OnceLock<AtomicU64> = OnceLock::new();
    let counter = COUNTER.get_or_init(|| AtomicU64::new(0));
    let mut path = target_dir();
    path.push("test-output");
    path.push(component);
    path.push(format!(
        "pid{}-{}",
        std::process::id(),
        counter.fetch_add(1, Ordering::Relaxed)
    ));
    fs::create_dir_all(&path).expect("create test output directory");
    path
}

pub struct EnvGuard {
    key: &'static str,
    previous: Option<String>,
}

impl EnvGuard {
    pub fn set(key: &'static str, value: &str) -> Self {
        let previous = env::var(key).ok();
        env::set_var(key, value);
        Self { key, previous }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        match self.previous.take() {
            Some(prev) => env::set_var(self.key, prev),
            None => env::remove_var(self.key),
        }
    }
}

/// Points the keyspace at a fresh directory for the lifetime of the guard and
/// serializes keyspace-touching tests behind the global lock.
pub struct TestEnv {
    _lock: MutexGuard<'static, ()>,
    _keyspace: EnvGuard,
    _lock_file: EnvGuard,
    root: PathBuf,
}

impl TestEnv {
    pub fn new() -> Self {
        let guard = keyspace_lock()
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let root = test_output_dir("keyspace");
        let keyspace_dir = root.join("keyspace");
        let lock_file = root.join("keyspace.lock");
        fs::create_dir_all(&keyspace_dir).expect("keyspace dir");
        fs::File::create(&lock_file).expect("lock file");

        let keyspace = EnvGuard::set("DIRECT_CSI_KEYSPACE", &keyspace_dir.to_string_lossy());
        let lock = EnvGuard::set("DIRECT_CSI_LOCK_FILE", &lock_file.to_string_lossy());

        Self {
            _lock: guard,
            _keyspace: keyspace,
            _lock_file: lock,
            root,
        }
    }

    pub fn root(&self) -> &PathBuf {
        &self.root
    }
}

impl Default for TestEnv {
    fn default() -> Self {
        Self::new()
    }
}

/// Recording stand-in for the mount/format/quota seam. Mount state is kept
/// in memory so idempotency is observable without root privileges.
pub struct FakeDeviceOps {
    pub calls: Mutex<Vec<String>>,
    pub mounted: Mutex<Vec<String>>,
    pub free_bytes: std::sync::atomic::AtomicU64,
    pub total_bytes: std::sync::atomic::AtomicU64,
}

impl FakeDeviceOps {
    pub fn new(total_bytes: u64) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            mounted: Mutex::new(Vec::new()),
            free_bytes: std::sync::atomic::AtomicU64::new(total_bytes),
            total_bytes: std::sync::atomic::AtomicU64::new(total_bytes),
        }
    }

    fn record(&self, call: String) {
        self.calls.lock().expect("fake call log").push(call);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("fake call log").clone()
    }

    pub fn count_calls(&self, prefix: &str) -> usize {
        self.calls()
            .iter()
            .filter(|call| call.starts_with(prefix))
            .count()
    }

    pub fn is_mounted(&self, path: &std::path::Path) -> bool {
        self.mounted
            .lock()
            .expect("fake mount table")
            .iter()
            .any(|m| m == &path.display().to_string())
    }
}

type DynError = Box<dyn std::error::Error + Send + Sync>;

impl crate::directcsi::sys::fs::DeviceOps for FakeDeviceOps {
    fn format(
        &self,
        device: &std::path::Path,
        fs_type: &str,
        force: bool,
    ) -> Result<(), DynError> {
        self.record(format!("format {} {} force={}", device.display(), fs_type, force));
        Ok(())
    }

    fn mount(
        &self,
        device: &std::path::Path,
        mountpoint: &std::path::Path,
        fs_type: &str,
        _options: &[String],
    ) -> Result<(), DynError> {
        if self.is_mounted(mountpoint) {
            return Ok(());
        }
        self.record(format!(
            "mount {} {} {}",
            device.display(),
            mountpoint.display(),
            fs_type
        ));
        self.mounted
            .lock()
            .expect("fake mount table")
            .push(mountpoint.display().to_string());
        Ok(())
    }

    fn bind_mount(
        &self,
        source: &std::path::Path,
        target: &std::path::Path,
        read_only: bool,
    ) -> Result<(), DynError> {
        if self.is_mounted(target) {
            return Ok(());
        }
        self.record(format!(
            "bind {} {} ro={}",
            source.display(),
            target.display(),
            read_only
        ));
        self.mounted
            .lock()
            .expect("fake mount table")
            .push(target.display().to_string());
        Ok(())
    }

    fn unmount(&self, path: &std::path::Path) -> Result<(), DynError> {
        self.record(format!("unmount {}", path.display()));
        self.mounted
            .lock()
            .expect("fake mount table")
            .retain(|m| m != &path.display().to_string());
        Ok(())
    }

    fn capacity(&self, _path: &std::path::Path) -> Result<(u64, u64), DynError> {
        Ok((
            self.total_bytes.load(Ordering::Relaxed),
            self.free_bytes.load(Ordering::Relaxed),
        ))
    }

    fn set_quota(
        &self,
        _mountpoint: &std::path::Path,
        volume_path: &std::path::Path,
        volume_id: &str,
        bytes: u64,
    ) -> Result<(), DynError> {
        self.record(format!(
            "quota {} {} {}",
            volume_path.display(),
            volume_id,
            bytes
        ));
        Ok(())
    }

    fn quota_stats(
        &self,
        _mountpoint: &std::path::Path,
        volume_id: &str,
    ) -> Result<(u64, u64), DynError> {
        self.record(format!("quota-stats {}", volume_id));
        Ok((0, self.total_bytes.load(Ordering::Relaxed)))
    }
}
