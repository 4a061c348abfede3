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

//! Loopback-only mode for development clusters without spare disks: a fixed
//! count of file-backed loop devices is reserved and discovery sees only
//! those.

use crate::directcsi::logger::log_info;
use crate::directcsi::util::error::{new_error, with_context};
use crate::directcsi::Config;

use std::error::Error;
use std::fs::{self, OpenOptions};
use std::path::PathBuf;
use std::process::{Command, Stdio};

type DynError = Box<dyn Error + Send + Sync>;

const COMPONENT: &str = "loopback";

/// Number of loop devices reserved in loopback-only mode.
pub const LOOPBACK_DEVICE_COUNT: usize = 4;
const LOOPBACK_FILE_SIZE: u64 = 1 << 30;

fn backing_root() -> PathBuf {
    Config::Keyspace
        .get_path()
        .parent()
        .map(|p| p.to_path_buf())
        .unwrap_or_else(|| PathBuf::from("/var/lib/direct-csi"))
        .join("loop")
}

/// Detaches every loop device backed by our reservation files.
pub fn flush_reservations() -> Result<(), DynError> {
    let root = backing_root();
    if !root.exists() {
        return Ok(());
    }
    for entry in fs::read_dir(&root)
        .map_err(|e| with_context(e, format!("Failed to list '{}'", root.display())))?
    {
        let entry = entry.map_err(|e| with_context(e, "Failed to iterate loop backing files"))?;
        let path = entry.path();
        let output = Command::new("losetup")
            .arg("-j")
            .arg(&path)
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .output()
            .map_err(|e| with_context(e, "Failed to invoke losetup -j"))?;
        for line in String::from_utf8_lossy(&output.stdout).lines() {
            if let Some(device) = line.split(':').next() {
                let _ = Command::new("losetup")
                    .arg("-d")
                    .arg(device.trim())
                    .status();
            }
        }
    }
    Ok(())
}

/// Attaches the fixed count of file-backed loop devices.
pub fn reserve_devices(count: usize) -> Result<Vec<String>, DynError> {
    let root = backing_root();
    fs::create_dir_all(&root)
        .map_err(|e| with_context(e, format!("Failed to create '{}'", root.display())))?;

    let mut devices = Vec::with_capacity(count);
    for index in 0..count {
        let backing = root.join(format!("loop-{}.img", index));
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&backing)
            .map_err(|e| {
                with_context(
                    e,
                    format!("Failed to create backing file '{}'", backing.display()),
                )
            })?;
        file.set_len(LOOPBACK_FILE_SIZE).map_err(|e| {
            with_context(
                e,
                format!("Failed to size backing file '{}'", backing.display()),
            )
        })?;

        let output = Command::new("losetup")
            .arg("-f")
            .arg("--show")
            .arg(&backing)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .map_err(|e| with_context(e, "Failed to invoke losetup"))?;
        if !output.status.success() {
            return Err(new_error(format!(
                "losetup failed for '{}': {}",
                backing.display(),
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        let device = String::from_utf8_lossy(&output.stdout).trim().to_string();
        log_info(
            COMPONENT,
            "Reserved loop device",
            &[("device", &device), ("backing", &backing.display().to_string())],
        );
        devices.push(device);
    }
    Ok(devices)
}

/// Names (`loopN`) of loop devices currently backed by our reservation files.
pub fn attached_device_names() -> Result<Vec<String>, DynError> {
    let root = backing_root();
    if !root.exists() {
        return Ok(Vec::new());
    }
    let output = Command::new("losetup")
        .arg("-a")
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .output()
        .map_err(|e| with_context(e, "Failed to invoke losetup -a"))?;

    let root_str = root.display().to_string();
    let mut names = Vec::new();
    for line in String::from_utf8_lossy(&output.stdout).lines() {
        if !line.contains(&root_str) {
            continue;
        }
        if let Some(device) = line.split(':').next() {
            if let Some(name) = device.trim().strip_prefix("/dev/") {
                names.push(name.to_string());
            }
        }
    }
    Ok(names)
}
