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

use clap::Parser;
use direct_csi::directcsi::cli::args::{
    Commands, DirectCsi, DriveCommands, ServerArgs, VolumeCommands,
};
use direct_csi::directcsi::cli::commands::{drives, install, volumes};
use direct_csi::directcsi::client::ObjectStore;
use direct_csi::directcsi::controller::{ControllerServer, VolumeCleanupListener};
use direct_csi::directcsi::csi::{self, CsiServices};
use direct_csi::directcsi::listener::Controller;
use direct_csi::directcsi::logger::{log_info, set_log_format, LogFormat};
use direct_csi::directcsi::node::discovery::DriveDiscovery;
use direct_csi::directcsi::node::drive_controller::DriveListener;
use direct_csi::directcsi::node::server::NodeServer;
use direct_csi::directcsi::node::DriverIdentity;
use direct_csi::directcsi::sys::fs::{DeviceOps, SysDeviceOps};
use direct_csi::directcsi::sys::BlockProbe;
use direct_csi::directcsi::util::error::with_context;
use direct_csi::directcsi::util::Keyspace;
use direct_csi::directcsi::Config;

use std::error::Error;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

type DynError = Box<dyn Error + Send + Sync>;

const COMPONENT: &str = "main";

#[tokio::main]
async fn main() {
    let cli = DirectCsi::parse();
    if let Err(error) = run(cli).await {
        eprintln!("Error: {}", error);
        std::process::exit(1);
    }
}

async fn run(cli: DirectCsi) -> Result<(), DynError> {
    match cli.command {
        Commands::Server(args) => run_server(args).await,
        Commands::Install(_) => {
            let store = ObjectStore::new();
            install::install(&store)?;
            println!("direct-csi installed");
            Ok(())
        }
        Commands::Drives(args) => {
            let store = ObjectStore::new();
            match args.command {
                DriveCommands::List(filters) => {
                    print!("{}", drives::list_drives(&store, &filters)?);
                    Ok(())
                }
                DriveCommands::Format(format_args) => {
                    for drive in drives::format_drives(&store, &format_args).await? {
                        println!("Requested format of drive {}", drive);
                    }
                    Ok(())
                }
            }
        }
        Commands::Volumes(args) => {
            let store = ObjectStore::new();
            match args.command {
                VolumeCommands::List(filters) => {
                    print!("{}", volumes::list_volumes(&store, &filters)?);
                    Ok(())
                }
            }
        }
    }
}

async fn run_server(args: ServerArgs) -> Result<(), DynError> {
    if args.log_json {
        set_log_format(LogFormat::Json);
    }
    for config in [
        Config::Keyspace,
        Config::LockFile,
        Config::MountRoot,
        Config::DevRoot,
    ] {
        config.verify()?;
    }

    let store = ObjectStore::new();
    let identity = DriverIdentity {
        node_id: args.node_id.clone(),
        rack: args.rack.clone(),
        zone: args.zone.clone(),
        region: args.region.clone(),
    };
    let device_ops: Arc<dyn DeviceOps> = Arc::new(SysDeviceOps);

    let discovery = DriveDiscovery::new(
        store,
        BlockProbe::new(),
        identity.clone(),
        args.loopback_only,
    );
    let synced = discovery
        .sync_drives()
        .await
        .map_err(|e| with_context(e, "Drive discovery failed"))?;
    log_info(
        COMPONENT,
        "Drive discovery finished",
        &[
            ("node", &args.node_id),
            ("drives", &synced.to_string()),
        ],
    );

    let hostname = nix::unistd::gethostname()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|_| args.node_id.clone());

    let mut controller = Controller::new(hostname, "direct-csi-controller", args.threads);
    controller.add_listener(Arc::new(DriveListener::new(
        store,
        args.node_id.clone(),
        Arc::clone(&device_ops),
    )));
    controller.add_listener(Arc::new(VolumeCleanupListener::new(store)));
    controller.set_startup_hook(move || store.migrate_stored_objects().map(|_| ()));

    let cancellation = CancellationToken::new();
    {
        let cancellation = cancellation.clone();
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            log_info(COMPONENT, "Shutdown signal received", &[]);
            cancellation.cancel();
        });
    }

    let services = Arc::new(CsiServices {
        controller: Arc::new(ControllerServer::new(store)),
        node: Arc::new(NodeServer::new(identity, store, device_ops)),
    });
    let endpoint = args.endpoint.clone();
    let endpoint_cancellation = cancellation.clone();
    let mut endpoint_task = tokio::spawn(async move {
        csi::serve(&endpoint, services, endpoint_cancellation).await
    });

    // The engine is fatal on leadership loss; the endpoint is fatal on bind
    // or accept errors. Either way the process exits and restarts clean.
    let result = tokio::select! {
        engine = controller.run(Keyspace::new("leases"), cancellation.clone()) => engine,
        endpoint = &mut endpoint_task => endpoint
            .map_err(|e| with_context(e, "CSI endpoint task panicked"))?,
    };

    cancellation.cancel();
    endpoint_task.abort();
    result
}
