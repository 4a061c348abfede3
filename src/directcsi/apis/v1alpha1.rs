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

//! First wire version. Drives and volumes were flat objects without a
//! spec/status split; drive state was a coarse four-value string.

use crate::directcsi::apis::ObjectMeta;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const API_VERSION: &str = "direct.csi.min.io/v1alpha1";

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DriveStatus {
    Online,
    Offline,
    #[serde(rename = "new")]
    Unformatted,
    #[default]
    Other,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum VolumeStatus {
    #[default]
    New,
    Staged,
    Published,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectCsiDrive {
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub model_number: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub serial_number: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub owner_node: String,
    #[serde(default)]
    pub total_capacity: i64,
    #[serde(default)]
    pub free_capacity: i64,
    #[serde(default)]
    pub block_size: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub root_partition: String,
    #[serde(default)]
    pub partition_num: i32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub filesystem: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub mountpoint: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mount_options: Vec<String>,
    #[serde(default)]
    pub drive_status: DriveStatus,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectCsiVolume {
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub owner_drive: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub owner_node: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub source_path: String,
    #[serde(default)]
    pub total_capacity: i64,
    #[serde(default)]
    pub volume_status: VolumeStatus,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}
