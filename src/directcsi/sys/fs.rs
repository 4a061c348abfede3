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

//! Format, mount and quota operations. Mount state is shared with the
//! kernel, so every mutation is idempotent: mounting a mounted target and
//! unmounting an unmounted path both succeed.

use crate::directcsi::sys::{probe_filesystem, xfs};
use crate::directcsi::util::error::{new_error, with_context};

use nix::errno::Errno;
use nix::mount::{umount2, MntFlags, MsFlags};
use std::error::Error;
use std::fs;
use std::path::Path;
use std::process::{Command, Stdio};

type DynError = Box<dyn Error + Send + Sync>;

/// Mount option every driver-owned filesystem carries.
pub const MOUNT_OPT_PRJQUOTA: &str = "prjquota";

const XFS_MAXPCT: u32 = 50;

/// Seam between volume/drive reconciliation and the kernel. The production
/// implementation shells out to mkfs/xfs_quota and issues mount syscalls;
/// tests substitute a recording fake.
pub trait DeviceOps: Send + Sync {
    /// Makes a filesystem on the device. Refuses a non-empty device unless
    /// `force` is set. Project quotas are always enabled.
    fn format(&self, device: &Path, fs_type: &str, force: bool) -> Result<(), DynError>;

    /// Mounts `device` on `mountpoint`. Succeeds without a syscall when the
    /// target is already a mount.
    fn mount(
        &self,
        device: &Path,
        mountpoint: &Path,
        fs_type: &str,
        options: &[String],
    ) -> Result<(), DynError>;

    /// Bind-mounts `source` onto `target`, optionally read-only. Succeeds
    /// without a syscall when the target is already a mount.
    fn bind_mount(&self, source: &Path, target: &Path, read_only: bool) -> Result<(), DynError>;

    /// Unmounts `path`; not-mounted is success.
    fn unmount(&self, path: &Path) -> Result<(), DynError>;

    /// Returns `(total, free)` bytes of the filesystem at `path`.
    fn capacity(&self, path: &Path) -> Result<(u64, u64), DynError>;

    /// Maps the volume to an XFS project and sets hard and soft limits to
    /// the requested size.
    fn set_quota(
        &self,
        mountpoint: &Path,
        volume_path: &Path,
        volume_id: &str,
        bytes: u64,
    ) -> Result<(), DynError>;

    /// Returns `(used, total)` bytes for the volume's project quota.
    fn quota_stats(&self, mountpoint: &Path, volume_id: &str) -> Result<(u64, u64), DynError>;
}

/// The real thing.
pub struct SysDeviceOps;

impl DeviceOps for SysDeviceOps {
    fn format(&self, device: &Path, fs_type: &str, force: bool) -> Result<(), DynError> {
        format_device(device, fs_type, force)
    }

    fn mount(
        &self,
        device: &Path,
        mountpoint: &Path,
        fs_type: &str,
        options: &[String],
    ) -> Result<(), DynError> {
        mount_device(device, mountpoint, fs_type, options)
    }

    fn bind_mount(&self, source: &Path, target: &Path, read_only: bool) -> Result<(), DynError> {
        bind_mount(source, target, read_only)
    }

    fn unmount(&self, path: &Path) -> Result<(), DynError> {
        unmount(path)
    }

    fn capacity(&self, path: &Path) -> Result<(u64, u64), DynError> {
        statfs_capacity(path)
    }

    fn set_quota(
        &self,
        mountpoint: &Path,
        volume_path: &Path,
        volume_id: &str,
        bytes: u64,
    ) -> Result<(), DynError> {
        xfs::set_project_quota(mountpoint, volume_path, volume_id, bytes)
    }

    fn quota_stats(&self, mountpoint: &Path, volume_id: &str) -> Result<(u64, u64), DynError> {
        xfs::project_quota_stats(mountpoint, volume_id)
    }
}

pub fn format_device(device: &Path, fs_type: &str, force: bool) -> Result<(), DynError> {
    if fs_type != "xfs" {
        return Err(new_error(format!(
            "Unsupported filesystem '{}' requested for {}",
            fs_type,
            device.display()
        )));
    }

    if !force {
        let existing = probe_filesystem(device)?;
        if !existing.is_empty() {
            return Err(new_error(format!(
                "Device {} already has a {} filesystem. Set 'force' to overwrite it",
                device.display(),
                existing
            )));
        }
    }

    let mut command = Command::new("mkfs.xfs");
    if force {
        command.arg("-f");
    }
    let output = command
        .args(["-i", &format!("maxpct={}", XFS_MAXPCT)])
        .args(["-m", "reflink=0"])
        .arg(device)
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .output()
        .map_err(|e| {
            with_context(e, format!("Failed to invoke mkfs.xfs for {}", device.display()))
        })?;

    if output.status.success() {
        Ok(())
    } else {
        Err(new_error(format!(
            "mkfs.xfs failed for {}: {}",
            device.display(),
            String::from_utf8_lossy(&output.stderr)
        )))
    }
}

pub fn mount_device(
    device: &Path,
    mountpoint: &Path,
    fs_type: &str,
    options: &[String],
) -> Result<(), DynError> {
    fs::create_dir_all(mountpoint).map_err(|e| {
        with_context(
            e,
            format!("Failed to create mountpoint '{}'", mountpoint.display()),
        )
    })?;

    if is_mounted(mountpoint) {
        return Ok(());
    }

    let data = join_mount_options(options);
    nix::mount::mount(
        Some(device),
        mountpoint,
        Some(fs_type),
        MsFlags::empty(),
        Some(data.as_str()),
    )
    .map_err(|e| {
        with_context(
            e,
            format!(
                "Failed to mount {} on {}",
                device.display(),
                mountpoint.display()
            ),
        )
    })
}

pub fn bind_mount(source: &Path, target: &Path, read_only: bool) -> Result<(), DynError> {
    fs::create_dir_all(target).map_err(|e| {
        with_context(
            e,
            format!("Failed to create bind target '{}'", target.display()),
        )
    })?;

    if is_mounted(target) {
        return Ok(());
    }

    let mut flags = MsFlags::MS_BIND;
    if read_only {
        flags |= MsFlags::MS_RDONLY;
    }
    nix::mount::mount(
        Some(source),
        target,
        None::<&str>,
        flags,
        Some(MOUNT_OPT_PRJQUOTA),
    )
    .map_err(|e| {
        with_context(
            e,
            format!(
                "Failed to bind {} onto {}",
                source.display(),
                target.display()
            ),
        )
    })
}

pub fn unmount(path: &Path) -> Result<(), DynError> {
    match umount2(path, MntFlags::MNT_DETACH) {
        Ok(()) => Ok(()),
        Err(Errno::EINVAL) | Err(Errno::ENOENT) => Ok(()),
        Err(e) => Err(with_context(
            e,
            format!("Failed to unmount {}", path.display()),
        )),
    }
}

/// Checks the process mount table for `path`.
pub fn is_mounted(path: &Path) -> bool {
    let target = path.to_string_lossy();
    match fs::read_to_string("/proc/self/mounts") {
        Ok(contents) => contents.lines().any(|line| {
            line.split_whitespace()
                .nth(1)
                .map(|mountpoint| mountpoint == target)
                .unwrap_or(false)
        }),
        Err(_) => false,
    }
}

pub fn statfs_capacity(path: &Path) -> Result<(u64, u64), DynError> {
    let stat = nix::sys::statfs::statfs(path)
        .map_err(|e| with_context(e, format!("Failed to statfs '{}'", path.display())))?;
    let block_size = stat.block_size() as u64;
    let total = stat.blocks() as u64 * block_size;
    let free = stat.blocks_available() as u64 * block_size;
    Ok((total, free))
}

pub fn free_capacity(path: &Path) -> Result<u64, DynError> {
    statfs_capacity(path).map(|(_, free)| free)
}

fn join_mount_options(options: &[String]) -> String {
    let mut joined: Vec<&str> = vec![MOUNT_OPT_PRJQUOTA];
    for option in options {
        if option != MOUNT_OPT_PRJQUOTA && !option.is_empty() {
            joined.push(option);
        }
    }
    joined.join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mount_options_always_carry_prjquota_once() {
        assert_eq!(join_mount_options(&[]), "prjquota");
        assert_eq!(
            join_mount_options(&["noatime".into(), "prjquota".into()]),
            "prjquota,noatime"
        );
    }

    #[test]
    fn unsupported_filesystem_is_rejected() {
        let err = format_device(Path::new("/dev/null"), "ext4", false).unwrap_err();
        assert!(err.to_string().contains("Unsupported filesystem"));
    }

    #[test]
    fn unmount_of_unmounted_path_succeeds() {
        let dir = crate::directcsi::test_support::test_output_dir("fs-unmount");
        unmount(&dir).expect("not-mounted unmount is success");
    }

    #[test]
    fn statfs_reports_nonzero_capacity_for_tmp() {
        let (total, free) = statfs_capacity(Path::new("/tmp")).expect("statfs");
        assert!(total > 0);
        assert!(free <= total);
    }
}
