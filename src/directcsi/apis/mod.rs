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

//! Wire types for the `direct.csi.min.io` custom objects across all served
//! versions, plus the shared metadata and condition machinery.

pub mod convert;
pub mod v1alpha1;
pub mod v1beta1;
pub mod v1beta2;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const GROUP: &str = "direct.csi.min.io";
pub const KIND_DRIVE: &str = "DirectCSIDrive";
pub const KIND_VOLUME: &str = "DirectCSIVolume";

/// Finalizer blocking volume deletion while the volume is staged.
pub const FINALIZER_VOLUME_PROTECTION: &str = "direct.csi.min.io/volume-protection";
/// Per-publish-target finalizer prefix; the target path is appended.
pub const FINALIZER_PUBLISHED_AT_PREFIX: &str = "direct.csi.min.io/published-at/";
/// Finalizer blocking drive release while volumes are bound to it.
pub const FINALIZER_DRIVE_IN_USE: &str = "direct.csi.min.io/drive-in-use";
/// Finalizer held by the node controller until the drive is unmounted.
pub const FINALIZER_DRIVE_CLEANUP: &str = "direct.csi.min.io/drive-cleanup";

pub const DRIVE_CONDITION_OWNED: &str = "Owned";
pub const DRIVE_CONDITION_MOUNTED: &str = "Mounted";
pub const DRIVE_CONDITION_FORMATTED: &str = "Formatted";
pub const DRIVE_CONDITION_INITIALIZED: &str = "Initialized";

pub const VOLUME_CONDITION_STAGED: &str = "Staged";
pub const VOLUME_CONDITION_PUBLISHED: &str = "Published";
pub const VOLUME_CONDITION_READY: &str = "Ready";

pub const REASON_NOT_ADDED: &str = "NotAdded";
pub const REASON_ADDED: &str = "Added";
pub const REASON_INITIALIZED: &str = "Initialized";
pub const REASON_IN_USE: &str = "InUse";
pub const REASON_NOT_IN_USE: &str = "NotInUse";
pub const REASON_REJECTED: &str = "Rejected";

/// Minimal representation of object metadata carried by every stored object.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub finalizers: Vec<String>,
}

impl ObjectMeta {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            creation_timestamp: Some(Utc::now()),
            ..Default::default()
        }
    }

    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.finalizers.iter().any(|f| f == finalizer)
    }

    pub fn add_finalizer(&mut self, finalizer: impl Into<String>) {
        let finalizer = finalizer.into();
        if !self.has_finalizer(&finalizer) {
            self.finalizers.push(finalizer);
        }
    }

    pub fn remove_finalizer(&mut self, finalizer: &str) {
        self.finalizers.retain(|f| f != finalizer);
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum ConditionStatus {
    True,
    #[default]
    False,
    Unknown,
}

impl From<bool> for ConditionStatus {
    fn from(value: bool) -> Self {
        if value {
            ConditionStatus::True
        } else {
            ConditionStatus::False
        }
    }
}

/// Ordered object condition with a transition timestamp.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub condition_type: String,
    pub status: ConditionStatus,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    pub fn new(
        condition_type: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            condition_type: condition_type.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Utc::now(),
        }
    }
}

/// Updates (or appends) the condition of the given type. The transition
/// timestamp moves only when the status actually changes.
pub fn set_condition(
    conditions: &mut Vec<Condition>,
    condition_type: &str,
    status: ConditionStatus,
    reason: &str,
    message: &str,
) {
    for condition in conditions.iter_mut() {
        if condition.condition_type == condition_type {
            if condition.status != status {
                condition.status = status;
                condition.last_transition_time = Utc::now();
            }
            condition.reason = reason.to_string();
            condition.message = message.to_string();
            return;
        }
    }
    conditions.push(Condition::new(condition_type, status, reason, message));
}

pub fn is_condition_true(conditions: &[Condition], condition_type: &str) -> bool {
    conditions
        .iter()
        .any(|c| c.condition_type == condition_type && c.status == ConditionStatus::True)
}
