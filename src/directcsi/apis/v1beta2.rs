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

//! Storage version. Adds physical block size, allocated capacity, access
//! tiers and topology segments to drives; used capacity to volumes.

use crate::directcsi::apis::{Condition, ObjectMeta, KIND_DRIVE, KIND_VOLUME};
use crate::directcsi::Config;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::PathBuf;

pub const API_VERSION: &str = "direct.csi.min.io/v1beta2";

pub const TOPOLOGY_NODE: &str = "direct.csi.min.io/node";
pub const TOPOLOGY_RACK: &str = "direct.csi.min.io/rack";
pub const TOPOLOGY_ZONE: &str = "direct.csi.min.io/zone";
pub const TOPOLOGY_REGION: &str = "direct.csi.min.io/region";

pub use crate::directcsi::apis::v1beta1::{DirectCsiDriveSpec, DriveStatus, RequestedFormat};

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum AccessTier {
    Hot,
    Warm,
    Cold,
    #[default]
    Unknown,
}

impl AccessTier {
    pub fn parse(value: &str) -> Option<AccessTier> {
        match value.to_ascii_lowercase().as_str() {
            "hot" => Some(AccessTier::Hot),
            "warm" => Some(AccessTier::Warm),
            "cold" => Some(AccessTier::Cold),
            "unknown" => Some(AccessTier::Unknown),
            _ => None,
        }
    }

    pub fn all() -> [AccessTier; 4] {
        [
            AccessTier::Hot,
            AccessTier::Warm,
            AccessTier::Cold,
            AccessTier::Unknown,
        ]
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectCsiDriveStatus {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub node_name: String,
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
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub model_number: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub serial_number: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub wwid: String,
    #[serde(default)]
    pub total_capacity: i64,
    #[serde(default)]
    pub free_capacity: i64,
    #[serde(default)]
    pub allocated_capacity: i64,
    #[serde(default)]
    pub logical_block_size: i64,
    #[serde(default)]
    pub physical_block_size: i64,
    #[serde(default)]
    pub drive_status: DriveStatus,
    #[serde(default)]
    pub access_tier: AccessTier,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub topology: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectCsiDrive {
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: DirectCsiDriveSpec,
    #[serde(default)]
    pub status: DirectCsiDriveStatus,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl DirectCsiDrive {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            kind: KIND_DRIVE.to_string(),
            metadata: ObjectMeta::named(name),
            ..Default::default()
        }
    }

    /// Default mountpoint for this drive under the driver-owned root.
    pub fn default_mountpoint(&self) -> PathBuf {
        Config::MountRoot.get_path().join(&self.metadata.name)
    }

    pub fn is_schedulable(&self) -> bool {
        matches!(
            self.status.drive_status,
            DriveStatus::Ready | DriveStatus::InUse
        )
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectCsiVolumeStatus {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub drive: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub node_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub host_path: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub staging_path: String,
    #[serde(default)]
    pub total_capacity: i64,
    #[serde(default)]
    pub used_capacity: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectCsiVolume {
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub status: DirectCsiVolumeStatus,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl DirectCsiVolume {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            kind: KIND_VOLUME.to_string(),
            metadata: ObjectMeta::named(name),
            ..Default::default()
        }
    }
}
