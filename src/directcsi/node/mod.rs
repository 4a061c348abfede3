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

pub mod discovery;
pub mod drive_controller;
pub mod server;

use crate::directcsi::apis::v1beta2::{
    TOPOLOGY_NODE, TOPOLOGY_RACK, TOPOLOGY_REGION, TOPOLOGY_ZONE,
};
use std::collections::HashMap;

/// Where this driver instance runs. Seeds drive identity hashes and the
/// topology segments attached to every drive discovered here.
#[derive(Debug, Clone)]
pub struct DriverIdentity {
    pub node_id: String,
    pub rack: String,
    pub zone: String,
    pub region: String,
}

impl DriverIdentity {
    pub fn topology(&self) -> HashMap<String, String> {
        HashMap::from([
            (TOPOLOGY_NODE.to_string(), self.node_id.clone()),
            (TOPOLOGY_RACK.to_string(), self.rack.clone()),
            (TOPOLOGY_ZONE.to_string(), self.zone.clone()),
            (TOPOLOGY_REGION.to_string(), self.region.clone()),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topology_covers_all_failure_domains() {
        let identity = DriverIdentity {
            node_id: "node-1".into(),
            rack: "r1".into(),
            zone: "z1".into(),
            region: "us-east".into(),
        };
        let topology = identity.topology();
        assert_eq!(topology.get(TOPOLOGY_NODE), Some(&"node-1".to_string()));
        assert_eq!(topology.get(TOPOLOGY_RACK), Some(&"r1".to_string()));
        assert_eq!(topology.get(TOPOLOGY_ZONE), Some(&"z1".to_string()));
        assert_eq!(topology.get(TOPOLOGY_REGION), Some(&"us-east".to_string()));
    }
}
