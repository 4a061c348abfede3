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

//! XFS project quotas. Each volume maps to a numeric project id derived
//! from its id; the project's hard and soft block limits equal the
//! provisioned size.

use crate::directcsi::util::error::{new_error, with_context};

use sha2::{Digest, Sha256};
use std::error::Error;
use std::path::Path;
use std::process::{Command, Stdio};

type DynError = Box<dyn Error + Send + Sync>;

/// Derives the XFS project id for a volume. Deterministic, non-zero, and
/// within the signed 32-bit range xfs_quota accepts.
pub fn project_id(volume_id: &str) -> u32 {
    let digest = Sha256::digest(volume_id.as_bytes());
    let raw = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]) & 0x7fff_ffff;
    raw.max(1)
}

pub fn set_project_quota(
    mountpoint: &Path,
    volume_path: &Path,
    volume_id: &str,
    bytes: u64,
) -> Result<(), DynError> {
    let id = project_id(volume_id);
    run_xfs_quota(
        mountpoint,
        &format!("project -s -p {} {}", volume_path.display(), id),
    )?;
    run_xfs_quota(
        mountpoint,
        &format!("limit -p bsoft={} bhard={} {}", bytes, bytes, id),
    )?;
    Ok(())
}

pub fn project_quota_stats(mountpoint: &Path, volume_id: &str) -> Result<(u64, u64), DynError> {
    let id = project_id(volume_id);
    let report = run_xfs_quota(mountpoint, &format!("quota -p -N -b {}", id))?;
    parse_quota_report(&report).ok_or_else(|| {
        new_error(format!(
            "Unparseable quota report for project {} on {}",
            id,
            mountpoint.display()
        ))
    })
}

/// Parses `xfs_quota quota -N -b` output: the block columns are kibibytes
/// (used, soft, hard), returned here as `(used, hard)` in bytes.
pub fn parse_quota_report(report: &str) -> Option<(u64, u64)> {
    let line = report.lines().find(|line| !line.trim().is_empty())?;
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 4 {
        return None;
    }
    let used_kib: u64 = fields[1].parse().ok()?;
    let hard_kib: u64 = fields[3].parse().ok()?;
    Some((used_kib * 1024, hard_kib * 1024))
}

fn run_xfs_quota(mountpoint: &Path, subcommand: &str) -> Result<String, DynError> {
    let output = Command::new("xfs_quota")
        .arg("-x")
        .arg("-c")
        .arg(subcommand)
        .arg(mountpoint)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .map_err(|e| {
            with_context(
                e,
                format!("Failed to invoke xfs_quota on {}", mountpoint.display()),
            )
        })?;

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    } else {
        Err(new_error(format!(
            "xfs_quota '{}' failed on {}: {}",
            subcommand,
            mountpoint.display(),
            String::from_utf8_lossy(&output.stderr)
        )))
    }
}
