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

use crate::directcsi::apis::v1beta2::{DirectCsiDrive, DriveStatus, RequestedFormat};
use crate::directcsi::cli::args::{DriveFilterArgs, DriveFormatArgs};
use crate::directcsi::cli::{matches_glob_filters, render_table};
use crate::directcsi::client::ObjectStore;
use crate::directcsi::util::error::new_error;

use std::error::Error;
use std::path::Path;

type DynError = Box<dyn Error + Send + Sync>;

fn drive_display_name(drive: &DirectCsiDrive) -> String {
    Path::new(&drive.status.path)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| drive.status.path.clone())
}

fn status_display(status: DriveStatus) -> &'static str {
    match status {
        DriveStatus::Available => "Available",
        DriveStatus::Unavailable => "Unavailable",
        DriveStatus::Ready => "Ready",
        DriveStatus::InUse => "InUse",
        DriveStatus::Released => "Released",
        DriveStatus::Terminating => "Terminating",
    }
}

fn humanize_bytes(bytes: i64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes.max(0) as f64;
    let mut unit = 0usize;
    while value >= 1024.0 && unit + 1 < UNITS.len() {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.1} {}", value, UNITS[unit])
}

pub fn filter_drives(drives: Vec<DirectCsiDrive>, filters: &DriveFilterArgs) -> Vec<DirectCsiDrive> {
    drives
        .into_iter()
        .filter(|drive| {
            matches_glob_filters(&filters.nodes, &drive.status.node_name)
                && matches_glob_filters(&filters.drives, &drive_display_name(drive))
                && matches_glob_filters(&filters.status, status_display(drive.status.drive_status))
                && matches_glob_filters(
                    &filters.access_tier,
                    &format!("{:?}", drive.status.access_tier).to_lowercase(),
                )
        })
        .collect()
}

pub fn list_drives(store: &ObjectStore, filters: &DriveFilterArgs) -> Result<String, DynError> {
    let drives = filter_drives(store.list_drives()?, filters);
    let rows: Vec<Vec<String>> = drives
        .iter()
        .map(|drive| {
            vec![
                drive_display_name(drive),
                drive.status.node_name.clone(),
                humanize_bytes(drive.status.total_capacity),
                humanize_bytes(drive.status.free_capacity),
                drive.status.filesystem.clone(),
                drive.status.mountpoint.clone(),
                format!("{:?}", drive.status.access_tier),
                status_display(drive.status.drive_status).to_string(),
            ]
        })
        .collect();

    Ok(render_table(
        &[
            "DRIVE", "NODE", "CAPACITY", "FREE", "FS", "MOUNTPOINT", "TIER", "STATUS",
        ],
        &rows,
    ))
}

/// Requests an XFS format of every matching drive by recording the wish on
/// the object; the owning node reconciles it.
pub async fn format_drives(
    store: &ObjectStore,
    args: &DriveFormatArgs,
) -> Result<Vec<String>, DynError> {
    let drives = filter_drives(store.list_drives()?, &args.filters);
    if drives.is_empty() {
        return Err(new_error("No drives matched the given filters"));
    }

    let mut formatted = Vec::new();
    for drive in drives {
        let name = drive.metadata.name.clone();
        match drive.status.drive_status {
            DriveStatus::InUse => {
                return Err(new_error(format!(
                    "Drive {} has bound volumes and cannot be formatted",
                    drive_display_name(&drive)
                )));
            }
            DriveStatus::Unavailable | DriveStatus::Terminating => continue,
            _ => {}
        }

        let force = args.force;
        store
            .update_drive(&name, |drive| {
                drive.spec.requested_format = Some(RequestedFormat {
                    filesystem: "xfs".to_string(),
                    force,
                    ..Default::default()
                });
                Ok(())
            })
            .await?;
        formatted.push(drive_display_name(&drive));
    }
    Ok(formatted)
}
