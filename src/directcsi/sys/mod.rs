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

//! Read-only probe over the kernel's block-device views: the sysfs tree,
//! the init mount table and the device nodes. Safe to run while user I/O is
//! in flight; nothing here writes to a disk.

pub mod fs;
pub mod loopback;
pub mod xfs;

use crate::directcsi::logger::log_debug;
use crate::directcsi::util::error::{new_error, with_context};
use crate::directcsi::Config;

use std::collections::HashMap;
use std::error::Error;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

type DynError = Box<dyn Error + Send + Sync>;

const COMPONENT: &str = "block-probe";

nix::ioctl_read_bad!(blk_ssz_get, libc::BLKSSZGET, libc::c_int);
nix::ioctl_read_bad!(blk_pbsz_get, libc::BLKPBSZGET, libc::c_uint);

/// Everything the probe learned about one block device.
#[derive(Debug, Clone, Default)]
pub struct Device {
    pub name: String,
    pub major: u32,
    pub minor: u32,
    /// Canonical device node managed by the driver.
    pub path: String,
    pub size: u64,
    pub partition: i32,
    pub removable: bool,
    pub read_only: bool,
    pub uuid: String,
    pub wwid: String,
    pub model: String,
    pub serial: String,
    pub vendor: String,
    pub dm_name: String,
    pub dm_uuid: String,
    pub md_uuid: String,
    pub virtual_device: bool,
    pub parent: String,
    pub master: String,
    pub filesystem: String,
    pub logical_block_size: u64,
    pub physical_block_size: u64,
    pub total_capacity: u64,
    pub free_capacity: u64,
    pub mount_points: Vec<String>,
    pub first_mount_point: String,
    pub first_mount_options: Vec<String>,
    /// Probe failure for this device only; other devices keep going.
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Uevent {
    pub major: u32,
    pub minor: u32,
    pub devname: String,
    pub devtype: String,
}

/// Probe rooted at the standard kernel views; roots are injectable so tests
/// can run against fixture trees.
#[derive(Debug, Clone)]
pub struct BlockProbe {
    sys_root: PathBuf,
    dev_root: PathBuf,
    mountinfo_path: PathBuf,
}

impl Default for BlockProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockProbe {
    pub fn new() -> Self {
        Self {
            sys_root: PathBuf::from("/sys"),
            dev_root: PathBuf::from("/dev"),
            mountinfo_path: PathBuf::from("/proc/1/mountinfo"),
        }
    }

    pub fn with_roots(
        sys_root: impl Into<PathBuf>,
        dev_root: impl Into<PathBuf>,
        mountinfo_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            sys_root: sys_root.into(),
            dev_root: dev_root.into(),
            mountinfo_path: mountinfo_path.into(),
        }
    }

    /// Enumerates block devices. In loopback-only mode exactly the reserved
    /// loop devices are returned; otherwise `loop*` entries are skipped.
    pub fn probe(&self, loopback_only: bool) -> Result<Vec<Device>, DynError> {
        let attached_loops = if loopback_only {
            let names = loopback::attached_device_names()?;
            if names.is_empty() {
                return Err(new_error("No loop devices attached"));
            }
            names
        } else {
            Vec::new()
        };

        let mut names = self.read_class_block()?;
        names.sort();

        let mut devices = Vec::new();
        for name in names {
            if name.starts_with("loop") {
                if !loopback_only || !attached_loops.contains(&name) {
                    continue;
                }
            } else if loopback_only {
                continue;
            }

            match self.probe_device(&name) {
                Ok(Some(device)) => devices.push(device),
                Ok(None) => {}
                Err(e) => log_debug(
                    COMPONENT,
                    "Skipping block entry",
                    &[("name", &name), ("error", &e.to_string())],
                ),
            }
        }

        self.link_partitions_and_slaves(&mut devices)?;
        self.attach_mount_info(&mut devices)?;
        Ok(devices)
    }

    fn probe_device(&self, name: &str) -> Result<Option<Device>, DynError> {
        let uevent_path = self.class_block(name).join("uevent");
        let uevent = match std::fs::read_to_string(&uevent_path) {
            Ok(content) => parse_uevent(&content)?,
            Err(e) => {
                return Err(with_context(
                    e,
                    format!("Failed to read '{}'", uevent_path.display()),
                ))
            }
        };

        let mut device = Device {
            name: name.to_string(),
            major: uevent.major,
            minor: uevent.minor,
            path: self.dev_root.join(&uevent.devname).display().to_string(),
            ..Default::default()
        };

        // Required attributes are fatal for this device only.
        match self.read_scalars(&mut device) {
            Ok(()) => {}
            Err(e) => {
                device.error = e.to_string();
                return Ok(Some(device));
            }
        }
        device.total_capacity = device.size;

        // Geometry needs the device node; without one (fixture trees,
        // detached devices) the sysfs-derived size stands in.
        if uevent.devtype == "disk"
            && device.partition == 0
            && self.dev_root.join(&uevent.devname).exists()
        {
            if let Err(e) = self.probe_block_geometry(&mut device) {
                device.error = e.to_string();
            }
        }

        Ok(Some(device))
    }

    fn read_scalars(&self, device: &mut Device) -> Result<(), DynError> {
        let name = device.name.clone();
        device.size = self
            .read_required(&name, "size")?
            .parse::<u64>()
            .map_err(|e| with_context(e, format!("Invalid size for '{}'", name)))?
            .saturating_mul(512);
        device.partition = match self.read_optional(&name, "partition")? {
            s if s.is_empty() => 0,
            s => s
                .parse()
                .map_err(|e| with_context(e, format!("Invalid partition for '{}'", name)))?,
        };
        device.removable = is_sys_flag_set(&self.read_optional(&name, "removable")?);
        device.read_only = is_sys_flag_set(&self.read_optional(&name, "ro")?);
        device.uuid = self.read_optional(&name, "uuid")?;
        device.wwid = self.read_optional(&name, "wwid")?;
        device.model = self.read_optional(&name, "device/model")?;
        device.serial = self.read_optional(&name, "device/serial")?;
        device.vendor = self.read_optional(&name, "device/vendor")?;
        device.dm_name = self.read_optional(&name, "dm/name")?;
        device.dm_uuid = self.read_optional(&name, "dm/uuid")?;
        device.md_uuid = self.read_optional(&name, "md/uuid")?;
        device.virtual_device = self.is_virtual(&name);
        Ok(())
    }

    /// Block sizes come from the block layer; capacity from seeking the node.
    /// A canonical device node is kept under the driver's device root.
    fn probe_block_geometry(&self, device: &mut Device) -> Result<(), DynError> {
        let canonical = Config::DevRoot.get_path().join(&device.name);
        make_block_file(&canonical, device.major, device.minor)?;
        device.path = canonical.display().to_string();

        let (logical, physical) = get_block_sizes(&canonical)?;
        device.logical_block_size = logical;
        device.physical_block_size = physical;
        device.total_capacity = get_total_capacity(&canonical)?;
        device.filesystem = probe_filesystem(&canonical)?;
        Ok(())
    }

    fn link_partitions_and_slaves(&self, devices: &mut [Device]) -> Result<(), DynError> {
        let disk_names = self.read_sys_block()?;
        let mut parent_of: HashMap<String, String> = HashMap::new();
        let mut master_of: HashMap<String, String> = HashMap::new();

        for disk in &disk_names {
            for entry in read_dir_names(&self.sys_root.join("block").join(disk), false)? {
                if entry.starts_with(disk.as_str()) && entry != *disk {
                    parent_of.insert(entry, disk.clone());
                }
            }
            for slave in read_dir_names(
                &self.sys_root.join("block").join(disk).join("slaves"),
                false,
            )? {
                master_of.insert(slave, disk.clone());
            }
        }

        for device in devices.iter_mut() {
            if let Some(parent) = parent_of.get(&device.name) {
                device.parent = parent.clone();
            }
            if let Some(master) = master_of.get(&device.name) {
                device.master = master.clone();
            }
        }
        Ok(())
    }

    fn attach_mount_info(&self, devices: &mut [Device]) -> Result<(), DynError> {
        let file = File::open(&self.mountinfo_path).map_err(|e| {
            with_context(
                e,
                format!("Failed to open '{}'", self.mountinfo_path.display()),
            )
        })?;
        let mounts = parse_mountinfo(BufReader::new(file))?;

        for device in devices.iter_mut() {
            let key = format!("{}:{}", device.major, device.minor);
            if let Some(entries) = mounts.get(&key) {
                device.mount_points = entries.iter().map(|e| e.mount_point.clone()).collect();
                if let Some(entry) = entries.first() {
                    device.first_mount_point = entry.mount_point.clone();
                    device.first_mount_options = entry.options.clone();
                    if device.filesystem.is_empty() {
                        device.filesystem = entry.fs_type.clone();
                    }
                    if let Ok(free) = fs::free_capacity(Path::new(&entry.mount_point)) {
                        device.free_capacity = free;
                    }
                }
            }
        }
        Ok(())
    }

    fn class_block(&self, name: &str) -> PathBuf {
        self.sys_root.join("class/block").join(name)
    }

    fn read_class_block(&self) -> Result<Vec<String>, DynError> {
        read_dir_names(&self.sys_root.join("class/block"), true)
    }

    fn read_sys_block(&self) -> Result<Vec<String>, DynError> {
        read_dir_names(&self.sys_root.join("block"), true)
    }

    fn read_required(&self, name: &str, attribute: &str) -> Result<String, DynError> {
        read_first_line(&self.class_block(name).join(attribute), true)
    }

    fn read_optional(&self, name: &str, attribute: &str) -> Result<String, DynError> {
        read_first_line(&self.class_block(name).join(attribute), false)
    }

    fn is_virtual(&self, name: &str) -> bool {
        std::fs::canonicalize(self.class_block(name))
            .map(|resolved| resolved.starts_with(self.sys_root.join("devices/virtual/block")))
            .unwrap_or(false)
    }
}

/// Parses a kernel uevent record. Only `MAJOR`, `MINOR`, `DEVNAME` and
/// `DEVTYPE` are understood; any other key rejects the record.
pub fn parse_uevent(content: &str) -> Result<Uevent, DynError> {
    let mut major = None;
    let mut minor = None;
    let mut devname = None;
    let mut devtype = None;

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (key, value) = line
            .split_once('=')
            .ok_or_else(|| new_error(format!("uevent line '{}' is not KEY=VALUE", line)))?;
        match key {
            "MAJOR" => major = Some(value.to_string()),
            "MINOR" => minor = Some(value.to_string()),
            "DEVNAME" => devname = Some(value.to_string()),
            "DEVTYPE" => devtype = Some(value.to_string()),
            other => {
                return Err(new_error(format!(
                    "uevent record with unsupported key '{}'",
                    other
                )))
            }
        }
    }

    let parse_num = |value: Option<String>, what: &str| -> Result<u32, DynError> {
        value
            .ok_or_else(|| new_error(format!("uevent record is missing {}", what)))?
            .parse()
            .map_err(|e| with_context(e, format!("Invalid {} in uevent record", what)))
    };

    Ok(Uevent {
        major: parse_num(major, "MAJOR")?,
        minor: parse_num(minor, "MINOR")?,
        devname: devname.ok_or_else(|| new_error("uevent record is missing DEVNAME"))?,
        devtype: devtype.unwrap_or_default(),
    })
}

/// One mount-table entry for a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub mount_point: String,
    pub options: Vec<String>,
    pub fs_type: String,
}

/// Parses `/proc/<pid>/mountinfo` into a map keyed by `major:minor`, keeping
/// mountpoints in file order alongside their option lists.
pub fn parse_mountinfo<R: BufRead>(
    reader: R,
) -> Result<HashMap<String, Vec<MountEntry>>, DynError> {
    let mut mounts: HashMap<String, Vec<MountEntry>> = HashMap::new();
    for line in reader.lines() {
        let line = line.map_err(|e| with_context(e, "Failed to read mount table"))?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let tokens: Vec<&str> = trimmed.split_whitespace().collect();
        if tokens.len() < 6 {
            return Err(new_error(format!("Unknown mountinfo format '{}'", trimmed)));
        }
        // The filesystem type follows the optional-field terminator.
        let fs_type = tokens
            .iter()
            .position(|t| *t == "-")
            .and_then(|i| tokens.get(i + 1))
            .map(|t| t.to_string())
            .unwrap_or_default();
        mounts
            .entry(tokens[2].to_string())
            .or_default()
            .push(MountEntry {
                mount_point: tokens[4].to_string(),
                options: tokens[5].split(',').map(str::to_string).collect(),
                fs_type,
            });
    }
    Ok(mounts)
}

/// Identifies a filesystem from its superblock magic. Unknown or blank
/// devices return an empty string.
pub fn probe_filesystem(path: &Path) -> Result<String, DynError> {
    use std::io::Read;

    let mut file = File::open(path)
        .map_err(|e| with_context(e, format!("Failed to open device '{}'", path.display())))?;
    let mut header = [0u8; 4096];
    let read = file
        .read(&mut header)
        .map_err(|e| with_context(e, format!("Failed to read superblock of '{}'", path.display())))?;

    if read >= 4 && &header[0..4] == b"XFSB" {
        return Ok("xfs".to_string());
    }
    if read >= 1082 && header[1080] == 0x53 && header[1081] == 0xEF {
        return Ok("ext4".to_string());
    }
    Ok(String::new())
}

fn is_sys_flag_set(value: &str) -> bool {
    !value.is_empty() && value != "0"
}

fn read_first_line(path: &Path, error_if_not_exist: bool) -> Result<String, DynError> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound && !error_if_not_exist => {
            return Ok(String::new())
        }
        Err(e) => return Err(with_context(e, format!("Failed to open '{}'", path.display()))),
    };
    let mut line = String::new();
    BufReader::new(file)
        .read_line(&mut line)
        .map_err(|e| with_context(e, format!("Failed to read '{}'", path.display())))?;
    Ok(line.trim().to_string())
}

fn read_dir_names(path: &Path, error_if_not_exist: bool) -> Result<Vec<String>, DynError> {
    let entries = match std::fs::read_dir(path) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound && !error_if_not_exist => {
            return Ok(Vec::new())
        }
        Err(e) => return Err(with_context(e, format!("Failed to open '{}'", path.display()))),
    };
    let mut names = Vec::new();
    for entry in entries {
        let entry =
            entry.map_err(|e| with_context(e, format!("Failed to list '{}'", path.display())))?;
        names.push(entry.file_name().to_string_lossy().into_owned());
    }
    Ok(names)
}

/// Creates (or re-creates) the canonical block node for a device.
pub fn make_block_file(path: &Path, major: u32, minor: u32) -> Result<(), DynError> {
    use nix::sys::stat::{makedev, mknod, Mode, SFlag};

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            with_context(
                e,
                format!("Failed to create device root '{}'", parent.display()),
            )
        })?;
    }

    let dev = makedev(u64::from(major), u64::from(minor));
    match mknod(path, SFlag::S_IFBLK, Mode::from_bits_truncate(0o644), dev) {
        Ok(()) => Ok(()),
        Err(nix::errno::Errno::EEXIST) => Ok(()),
        Err(e) => Err(with_context(
            e,
            format!("Failed to create device node '{}'", path.display()),
        )),
    }
}

fn get_block_sizes(path: &Path) -> Result<(u64, u64), DynError> {
    let file = OpenOptions::new()
        .read(true)
        .open(path)
        .map_err(|e| with_context(e, format!("Failed to open device '{}'", path.display())))?;
    let fd = file.as_raw_fd();

    let mut logical: libc::c_int = 0;
    unsafe { blk_ssz_get(fd, &mut logical) }.map_err(|e| {
        with_context(
            e,
            format!("Failed to read logical block size of '{}'", path.display()),
        )
    })?;
    let mut physical: libc::c_uint = 0;
    unsafe { blk_pbsz_get(fd, &mut physical) }.map_err(|e| {
        with_context(
            e,
            format!("Failed to read physical block size of '{}'", path.display()),
        )
    })?;
    Ok((logical as u64, physical as u64))
}

fn get_total_capacity(path: &Path) -> Result<u64, DynError> {
    let mut file = OpenOptions::new()
        .read(true)
        .open(path)
        .map_err(|e| with_context(e, format!("Failed to open device '{}'", path.display())))?;
    let size = file
        .seek(SeekFrom::End(0))
        .map_err(|e| with_context(e, format!("Failed to size device '{}'", path.display())))?;
    Ok(size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directcsi::test_support::test_output_dir;
    use std::io::Cursor;

    #[test]
    fn parses_well_formed_uevent() {
        let uevent = parse_uevent("MAJOR=8\nMINOR=0\nDEVNAME=sda\nDEVTYPE=disk\n").expect("parse");
        assert_eq!(
            uevent,
            Uevent {
                major: 8,
                minor: 0,
                devname: "sda".into(),
                devtype: "disk".into(),
            }
        );
    }

    #[test]
    fn rejects_uevent_with_unknown_keys() {
        let err =
            parse_uevent("MAJOR=8\nMINOR=1\nDEVNAME=sda1\nDEVTYPE=partition\nPARTN=1\n")
                .unwrap_err();
        assert!(err.to_string().contains("PARTN"));
    }

    #[test]
    fn rejects_uevent_without_key_value_shape() {
        assert!(parse_uevent("MAJOR 8").is_err());
        assert!(parse_uevent("MAJOR=x\nMINOR=0\nDEVNAME=sda\n").is_err());
    }

    #[test]
    fn parses_mountinfo_lines() {
        let data = "\
22 1 8:1 / / rw,relatime shared:1 - ext4 /dev/sda1 rw
89 22 8:16 / /var/lib/direct-csi/mnt/abc rw,noatime,prjquota shared:40 - xfs /dev/sdb rw
90 22 8:16 / /other/mount rw shared:41 - xfs /dev/sdb rw
";
        let mounts = parse_mountinfo(Cursor::new(data)).expect("parse");
        let sdb = mounts.get("8:16").expect("sdb entries");
        assert_eq!(sdb.len(), 2);
        assert_eq!(sdb[0].mount_point, "/var/lib/direct-csi/mnt/abc");
        assert!(sdb[0].options.contains(&"prjquota".to_string()));
        assert_eq!(sdb[0].fs_type, "xfs");
        assert_eq!(sdb[1].mount_point, "/other/mount");
    }

    #[test]
    fn rejects_short_mountinfo_lines() {
        assert!(parse_mountinfo(Cursor::new("22 1 8:1 /\n")).is_err());
    }

    fn write_fixture(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).expect("fixture dirs");
        std::fs::write(path, content).expect("fixture file");
    }

    #[test]
    fn probe_assembles_devices_from_fixture_tree() {
        let root = test_output_dir("block-probe");
        let sys = root.join("sys");
        let dev = root.join("dev");
        let mountinfo = root.join("mountinfo");

        write_fixture(
            &sys,
            "class/block/vda/uevent",
            "MAJOR=253\nMINOR=0\nDEVNAME=vda\nDEVTYPE=disk\n",
        );
        write_fixture(&sys, "class/block/vda/size", "2097152\n");
        write_fixture(&sys, "class/block/vda/removable", "0\n");
        write_fixture(&sys, "class/block/vda/ro", "0\n");
        write_fixture(&sys, "class/block/vda/device/model", "QEMU DISK\n");

        write_fixture(
            &sys,
            "class/block/vda1/uevent",
            "MAJOR=253\nMINOR=1\nDEVNAME=vda1\nDEVTYPE=partition\n",
        );
        write_fixture(&sys, "class/block/vda1/size", "1048576\n");
        write_fixture(&sys, "class/block/vda1/partition", "1\n");

        write_fixture(&sys, "block/vda/size", "2097152\n");
        std::fs::create_dir_all(sys.join("block/vda/vda1")).expect("partition subdir");
        std::fs::create_dir_all(sys.join("block/vda/slaves")).expect("slaves dir");

        std::fs::write(
            &mountinfo,
            "22 1 253:1 / /var/lib/direct-csi/mnt/x rw,prjquota shared:1 - xfs /dev/vda1 rw\n",
        )
        .expect("mountinfo");

        let probe = BlockProbe::with_roots(&sys, &dev, &mountinfo);
        let devices = probe.probe(false).expect("probe");
        assert_eq!(devices.len(), 2);

        let vda = devices.iter().find(|d| d.name == "vda").expect("vda");
        assert_eq!(vda.size, 2097152 * 512);
        assert_eq!(vda.model, "QEMU DISK");
        assert_eq!(vda.partition, 0);

        let vda1 = devices.iter().find(|d| d.name == "vda1").expect("vda1");
        assert_eq!(vda1.partition, 1);
        assert_eq!(vda1.parent, "vda");
        assert_eq!(vda1.first_mount_point, "/var/lib/direct-csi/mnt/x");
        assert!(vda1
            .first_mount_options
            .contains(&"prjquota".to_string()));
    }

    #[test]
    fn device_with_missing_required_attribute_keeps_error_local() {
        let root = test_output_dir("block-probe-partial");
        let sys = root.join("sys");
        let dev = root.join("dev");
        let mountinfo = root.join("mountinfo");

        // sdb lacks its required size attribute; sda is complete.
        write_fixture(
            &sys,
            "class/block/sda/uevent",
            "MAJOR=8\nMINOR=0\nDEVNAME=sda\nDEVTYPE=disk\n",
        );
        write_fixture(&sys, "class/block/sda/size", "1024\n");
        write_fixture(
            &sys,
            "class/block/sdb/uevent",
            "MAJOR=8\nMINOR=16\nDEVNAME=sdb\nDEVTYPE=disk\n",
        );
        std::fs::create_dir_all(sys.join("block")).expect("block dir");
        std::fs::write(&mountinfo, "").expect("mountinfo");

        let probe = BlockProbe::with_roots(&sys, &dev, &mountinfo);
        let devices = probe.probe(false).expect("probe");
        assert_eq!(devices.len(), 2);
        let sdb = devices.iter().find(|d| d.name == "sdb").expect("sdb");
        assert!(!sdb.error.is_empty());
        let sda = devices.iter().find(|d| d.name == "sda").expect("sda");
        assert!(sda.error.is_empty());
    }

    #[test]
    fn loop_devices_are_skipped_outside_loopback_mode() {
        let root = test_output_dir("block-probe-loop");
        let sys = root.join("sys");
        let dev = root.join("dev");
        let mountinfo = root.join("mountinfo");

        write_fixture(
            &sys,
            "class/block/loop0/uevent",
            "MAJOR=7\nMINOR=0\nDEVNAME=loop0\nDEVTYPE=disk\n",
        );
        write_fixture(&sys, "class/block/loop0/size", "1024\n");
        std::fs::create_dir_all(sys.join("block")).expect("block dir");
        std::fs::write(&mountinfo, "").expect("mountinfo");

        let probe = BlockProbe::with_roots(&sys, &dev, &mountinfo);
        let devices = probe.probe(false).expect("probe");
        assert!(devices.is_empty());
    }
}
