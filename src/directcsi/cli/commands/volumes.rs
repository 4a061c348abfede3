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

use crate::directcsi::apis::v1beta2::DirectCsiVolume;
use crate::directcsi::apis::{
    is_condition_true, VOLUME_CONDITION_PUBLISHED, VOLUME_CONDITION_STAGED,
};
use crate::directcsi::cli::args::VolumeFilterArgs;
use crate::directcsi::cli::{matches_glob_filters, render_table};
use crate::directcsi::client::ObjectStore;

use std::error::Error;

type DynError = Box<dyn Error + Send + Sync>;

fn volume_status_display(volume: &DirectCsiVolume) -> &'static str {
    if is_condition_true(&volume.status.conditions, VOLUME_CONDITION_PUBLISHED) {
        "published"
    } else if is_condition_true(&volume.status.conditions, VOLUME_CONDITION_STAGED) {
        "staged"
    } else {
        "pending"
    }
}

pub fn filter_volumes(
    volumes: Vec<DirectCsiVolume>,
    filters: &VolumeFilterArgs,
) -> Vec<DirectCsiVolume> {
    volumes
        .into_iter()
        .filter(|volume| {
            matches_glob_filters(&filters.nodes, &volume.status.node_name)
                && matches_glob_filters(&filters.drives, &volume.status.drive)
                && matches_glob_filters(&filters.status, volume_status_display(volume))
        })
        .collect()
}

pub fn list_volumes(store: &ObjectStore, filters: &VolumeFilterArgs) -> Result<String, DynError> {
    let volumes = filter_volumes(store.list_volumes()?, filters);
    let rows: Vec<Vec<String>> = volumes
        .iter()
        .map(|volume| {
            vec![
                volume.metadata.name.clone(),
                volume.status.node_name.clone(),
                volume.status.drive.clone(),
                volume.status.total_capacity.to_string(),
                volume.status.staging_path.clone(),
                volume_status_display(volume).to_string(),
            ]
        })
        .collect();

    Ok(render_table(
        &["VOLUME", "NODE", "DRIVE", "CAPACITY", "STAGING", "STATUS"],
        &rows,
    ))
}
