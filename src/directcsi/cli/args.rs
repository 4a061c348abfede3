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

use clap::{Args, Parser, Subcommand};

/// CSI driver for provisioning volumes from JBOD(s) directly.
#[derive(Parser)]
#[command(name = env!("CARGO_PKG_NAME"))]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = env!("CARGO_PKG_DESCRIPTION"))]
pub struct DirectCsi {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the driver: drive reconciliation plus the CSI endpoint
    Server(ServerArgs),

    /// Prepare the local store and manifests for this driver
    Install(InstallArgs),

    /// Inspect and format drives
    Drives(DrivesArgs),

    /// Inspect volumes
    Volumes(VolumesArgs),
}

#[derive(Args)]
pub struct ServerArgs {
    /// Identity of the node this driver instance runs on
    #[arg(long = "node-id", short = 'n')]
    pub node_id: String,

    /// Endpoint at which the CSI services listen
    #[arg(long, short = 'e', default_value = "unix:///csi/csi.sock")]
    pub endpoint: String,

    /// Identity of the rack in which this driver is running
    #[arg(long, default_value = "default")]
    pub rack: String,

    /// Identity of the zone in which this driver is running
    #[arg(long, default_value = "default")]
    pub zone: String,

    /// Identity of the region in which this driver is running
    #[arg(long, default_value = "default")]
    pub region: String,

    /// Number of reconciliation workers
    #[arg(long, default_value_t = 40)]
    pub threads: usize,

    /// Use a fixed set of file-backed loop devices instead of real drives
    #[arg(long = "loopback-only", default_value_t = false)]
    pub loopback_only: bool,

    /// Emit logs as JSON instead of key=value text
    #[arg(long = "log-json", default_value_t = false)]
    pub log_json: bool,
}

#[derive(Args)]
pub struct InstallArgs {}

#[derive(Args)]
pub struct DrivesArgs {
    #[command(subcommand)]
    pub command: DriveCommands,
}

#[derive(Subcommand)]
pub enum DriveCommands {
    /// List drives known to the driver
    List(DriveFilterArgs),

    /// Request an XFS format (and mount) of matching drives
    Format(DriveFormatArgs),
}

#[derive(Args, Default)]
pub struct DriveFilterArgs {
    /// Glob list of node names ('*' means any)
    #[arg(long, value_delimiter = ',')]
    pub nodes: Vec<String>,

    /// Glob list of drive names, e.g. 'sd*'
    #[arg(long, value_delimiter = ',')]
    pub drives: Vec<String>,

    /// Glob list of drive statuses, e.g. 'Ready'
    #[arg(long, value_delimiter = ',')]
    pub status: Vec<String>,

    /// Glob list of access tiers, e.g. 'hot'
    #[arg(long = "access-tier", value_delimiter = ',')]
    pub access_tier: Vec<String>,
}

#[derive(Args)]
pub struct DriveFormatArgs {
    #[command(flatten)]
    pub filters: DriveFilterArgs,

    /// Overwrite an existing filesystem
    #[arg(long, default_value_t = false)]
    pub force: bool,
}

#[derive(Args)]
pub struct VolumesArgs {
    #[command(subcommand)]
    pub command: VolumeCommands,
}

#[derive(Subcommand)]
pub enum VolumeCommands {
    /// List volumes known to the driver
    List(VolumeFilterArgs),
}

#[derive(Args, Default)]
pub struct VolumeFilterArgs {
    /// Glob list of node names ('*' means any)
    #[arg(long, value_delimiter = ',')]
    pub nodes: Vec<String>,

    /// Glob list of drive names the volumes are bound to
    #[arg(long, value_delimiter = ',')]
    pub drives: Vec<String>,

    /// Glob list of volume statuses, e.g. 'staged'
    #[arg(long, value_delimiter = ',')]
    pub status: Vec<String>,
}
