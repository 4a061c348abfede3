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

//! CSI service request/response shapes and the canonical error codes the
//! services speak. Transport framing lives elsewhere; these types carry the
//! semantics.

use crate::directcsi::util::error::is_not_found_error;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::error::Error;
use std::fmt;

type DynError = Box<dyn Error + Send + Sync>;

/// Volume parameter selecting the drive access tiers a volume may land on.
pub const PARAMETER_ACCESS_TIER: &str = "direct.csi.min.io/access-tier";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Code {
    InvalidArgument,
    NotFound,
    FailedPrecondition,
    OutOfRange,
    ResourceExhausted,
    Internal,
}

impl Code {
    pub fn as_str(self) -> &'static str {
        match self {
            Code::InvalidArgument => "InvalidArgument",
            Code::NotFound => "NotFound",
            Code::FailedPrecondition => "FailedPrecondition",
            Code::OutOfRange => "OutOfRange",
            Code::ResourceExhausted => "ResourceExhausted",
            Code::Internal => "Internal",
        }
    }
}

/// Unified error for CSI operations; maps one-to-one onto canonical codes.
#[derive(Debug)]
pub struct CsiError {
    pub code: Code,
    pub message: String,
}

impl CsiError {
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(Code::InvalidArgument, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(Code::NotFound, message)
    }

    pub fn failed_precondition(message: impl Into<String>) -> Self {
        Self::new(Code::FailedPrecondition, message)
    }

    pub fn out_of_range(message: impl Into<String>) -> Self {
        Self::new(Code::OutOfRange, message)
    }

    pub fn resource_exhausted(message: impl Into<String>) -> Self {
        Self::new(Code::ResourceExhausted, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(Code::Internal, message)
    }

    /// Maps a store error: missing objects become `NotFound`, everything
    /// else is internal.
    pub fn from_store(err: DynError) -> Self {
        if is_not_found_error(err.as_ref()) {
            Self::not_found(err.to_string())
        } else {
            Self::internal(err.to_string())
        }
    }
}

impl fmt::Display for CsiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code.as_str(), self.message)
    }
}

impl Error for CsiError {}

// ----- identity -----

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetPluginInfoResponse {
    pub name: String,
    #[serde(rename = "vendorVersion")]
    pub vendor_version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeResponse {
    pub ready: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginCapabilitiesResponse {
    pub capabilities: Vec<String>,
}

// ----- shared -----

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CapacityRange {
    #[serde(rename = "requiredBytes", skip_serializing_if = "Option::is_none")]
    pub required_bytes: Option<i64>,
    #[serde(rename = "limitBytes", skip_serializing_if = "Option::is_none")]
    pub limit_bytes: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MountVolumeCapability {
    #[serde(rename = "fsType", skip_serializing_if = "Option::is_none")]
    pub fs_type: Option<String>,
    #[serde(rename = "mountFlags", default, skip_serializing_if = "Vec::is_empty")]
    pub mount_flags: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub enum AccessMode {
    #[serde(rename = "SINGLE_NODE_WRITER")]
    #[default]
    SingleNodeWriter,
    #[serde(rename = "SINGLE_NODE_READER_ONLY")]
    SingleNodeReaderOnly,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct VolumeCapability {
    #[serde(rename = "accessMode", skip_serializing_if = "Option::is_none")]
    pub access_mode: Option<AccessMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mount: Option<MountVolumeCapability>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Topology {
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub segments: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TopologyRequirement {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requisite: Vec<Topology>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub preferred: Vec<Topology>,
}

// ----- controller -----

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CreateVolumeRequest {
    pub name: String,
    #[serde(rename = "capacityRange", skip_serializing_if = "Option::is_none")]
    pub capacity_range: Option<CapacityRange>,
    #[serde(
        rename = "volumeCapabilities",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub volume_capabilities: Vec<VolumeCapability>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub parameters: HashMap<String, String>,
    #[serde(
        rename = "accessibilityRequirements",
        skip_serializing_if = "Option::is_none"
    )]
    pub accessibility_requirements: Option<TopologyRequirement>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Volume {
    #[serde(rename = "volumeId")]
    pub volume_id: String,
    #[serde(rename = "capacityBytes")]
    pub capacity_bytes: i64,
    #[serde(
        rename = "volumeContext",
        default,
        skip_serializing_if = "HashMap::is_empty"
    )]
    pub volume_context: HashMap<String, String>,
    #[serde(
        rename = "accessibleTopology",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub accessible_topology: Vec<Topology>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateVolumeResponse {
    pub volume: Volume,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DeleteVolumeRequest {
    #[serde(rename = "volumeId")]
    pub volume_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerCapabilitiesResponse {
    pub capabilities: Vec<String>,
}

// ----- node -----

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NodeStageVolumeRequest {
    #[serde(rename = "volumeId")]
    pub volume_id: String,
    #[serde(rename = "stagingTargetPath")]
    pub staging_target_path: String,
    #[serde(
        rename = "volumeContext",
        default,
        skip_serializing_if = "HashMap::is_empty"
    )]
    pub volume_context: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NodeUnstageVolumeRequest {
    #[serde(rename = "volumeId")]
    pub volume_id: String,
    #[serde(rename = "stagingTargetPath")]
    pub staging_target_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NodePublishVolumeRequest {
    #[serde(rename = "volumeId")]
    pub volume_id: String,
    #[serde(rename = "stagingTargetPath", default)]
    pub staging_target_path: String,
    #[serde(rename = "targetPath")]
    pub target_path: String,
    #[serde(default)]
    pub readonly: bool,
    #[serde(rename = "volumeCapability", skip_serializing_if = "Option::is_none")]
    pub volume_capability: Option<VolumeCapability>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NodeUnpublishVolumeRequest {
    #[serde(rename = "volumeId")]
    pub volume_id: String,
    #[serde(rename = "targetPath")]
    pub target_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NodeGetVolumeStatsRequest {
    #[serde(rename = "volumeId")]
    pub volume_id: String,
    #[serde(rename = "volumePath", default)]
    pub volume_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeUsage {
    pub used: i64,
    pub total: i64,
    pub available: i64,
    pub unit: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeGetVolumeStatsResponse {
    pub usage: Vec<VolumeUsage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeCapabilitiesResponse {
    pub capabilities: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeGetInfoResponse {
    #[serde(rename = "nodeId")]
    pub node_id: String,
    #[serde(rename = "accessibleTopology")]
    pub accessible_topology: Topology,
}
