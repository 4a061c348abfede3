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

//! Endpoint plumbing for the CSI services on a Unix-domain socket. The
//! service semantics live in `ControllerServer` and `NodeServer`; this layer
//! only routes requests and maps `CsiError` codes onto responses.

use crate::directcsi::controller::ControllerServer;
use crate::directcsi::csi::types::*;
use crate::directcsi::logger::log_info;
use crate::directcsi::node::server::NodeServer;
use crate::directcsi::util::error::with_context;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde::Serialize;
use std::error::Error;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

type DynError = Box<dyn Error + Send + Sync>;

const COMPONENT: &str = "csi-endpoint";

pub const DEFAULT_ENDPOINT: &str = "unix:///csi/csi.sock";
pub const DRIVER_NAME: &str = "direct.csi.min.io";

pub struct CsiServices {
    pub controller: Arc<ControllerServer>,
    pub node: Arc<NodeServer>,
}

#[derive(Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
}

struct CsiFailure(CsiError);

impl From<CsiError> for CsiFailure {
    fn from(error: CsiError) -> Self {
        Self(error)
    }
}

impl IntoResponse for CsiFailure {
    fn into_response(self) -> Response {
        let status = match self.0.code {
            Code::InvalidArgument | Code::OutOfRange | Code::FailedPrecondition => {
                StatusCode::BAD_REQUEST
            }
            Code::NotFound => StatusCode::NOT_FOUND,
            Code::ResourceExhausted => StatusCode::TOO_MANY_REQUESTS,
            Code::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = ErrorBody {
            code: self.0.code.as_str(),
            message: self.0.message,
        };
        (status, Json(body)).into_response()
    }
}

pub fn router(services: Arc<CsiServices>) -> Router {
    Router::new()
        .route("/identity/get-plugin-info", post(get_plugin_info))
        .route("/identity/probe", post(probe))
        .route(
            "/identity/get-plugin-capabilities",
            post(get_plugin_capabilities),
        )
        .route("/controller/create-volume", post(create_volume))
        .route("/controller/delete-volume", post(delete_volume))
        .route("/controller/get-capabilities", post(controller_capabilities))
        .route("/node/stage-volume", post(stage_volume))
        .route("/node/unstage-volume", post(unstage_volume))
        .route("/node/publish-volume", post(publish_volume))
        .route("/node/unpublish-volume", post(unpublish_volume))
        .route("/node/get-volume-stats", post(volume_stats))
        .route("/node/get-capabilities", post(node_capabilities))
        .route("/node/get-info", post(node_info))
        .with_state(services)
}

/// Serves the router on the given endpoint (`unix://<path>`), removing a
/// stale socket from a previous run first.
pub async fn serve(
    endpoint: &str,
    services: Arc<CsiServices>,
    cancellation: CancellationToken,
) -> Result<(), DynError> {
    let socket_path = endpoint
        .strip_prefix("unix://")
        .unwrap_or(endpoint)
        .to_string();
    if let Some(parent) = Path::new(&socket_path).parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            with_context(
                e,
                format!("Failed to create socket directory '{}'", parent.display()),
            )
        })?;
    }
    if Path::new(&socket_path).exists() {
        std::fs::remove_file(&socket_path)
            .map_err(|e| with_context(e, format!("Failed to remove stale socket '{}'", socket_path)))?;
    }

    let listener = tokio::net::UnixListener::bind(&socket_path)
        .map_err(|e| with_context(e, format!("Failed to bind CSI socket '{}'", socket_path)))?;
    log_info(
        COMPONENT,
        "Serving CSI services",
        &[("endpoint", &socket_path)],
    );

    axum::serve(listener, router(services))
        .with_graceful_shutdown(async move { cancellation.cancelled().await })
        .await
        .map_err(|e| with_context(e, "CSI endpoint failed"))?;
    Ok(())
}

// ----- identity -----

async fn get_plugin_info() -> Json<GetPluginInfoResponse> {
    Json(GetPluginInfoResponse {
        name: DRIVER_NAME.to_string(),
        vendor_version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn probe() -> Json<ProbeResponse> {
    Json(ProbeResponse { ready: true })
}

async fn get_plugin_capabilities() -> Json<PluginCapabilitiesResponse> {
    Json(PluginCapabilitiesResponse {
        capabilities: vec![
            "CONTROLLER_SERVICE".to_string(),
            "VOLUME_ACCESSIBILITY_CONSTRAINTS".to_string(),
        ],
    })
}

// ----- controller -----

async fn create_volume(
    State(services): State<Arc<CsiServices>>,
    Json(request): Json<CreateVolumeRequest>,
) -> Result<Json<CreateVolumeResponse>, CsiFailure> {
    Ok(Json(services.controller.create_volume(&request).await?))
}

async fn delete_volume(
    State(services): State<Arc<CsiServices>>,
    Json(request): Json<DeleteVolumeRequest>,
) -> Result<Json<serde_json::Value>, CsiFailure> {
    services.controller.delete_volume(&request).await?;
    Ok(Json(serde_json::json!({})))
}

async fn controller_capabilities() -> Json<ControllerCapabilitiesResponse> {
    Json(ControllerCapabilitiesResponse {
        capabilities: vec!["CREATE_DELETE_VOLUME".to_string()],
    })
}

// ----- node -----

async fn stage_volume(
    State(services): State<Arc<CsiServices>>,
    Json(request): Json<NodeStageVolumeRequest>,
) -> Result<Json<serde_json::Value>, CsiFailure> {
    services.node.stage_volume(&request).await?;
    Ok(Json(serde_json::json!({})))
}

async fn unstage_volume(
    State(services): State<Arc<CsiServices>>,
    Json(request): Json<NodeUnstageVolumeRequest>,
) -> Result<Json<serde_json::Value>, CsiFailure> {
    services.node.unstage_volume(&request).await?;
    Ok(Json(serde_json::json!({})))
}

async fn publish_volume(
    State(services): State<Arc<CsiServices>>,
    Json(request): Json<NodePublishVolumeRequest>,
) -> Result<Json<serde_json::Value>, CsiFailure> {
    services.node.publish_volume(&request).await?;
    Ok(Json(serde_json::json!({})))
}

async fn unpublish_volume(
    State(services): State<Arc<CsiServices>>,
    Json(request): Json<NodeUnpublishVolumeRequest>,
) -> Result<Json<serde_json::Value>, CsiFailure> {
    services.node.unpublish_volume(&request).await?;
    Ok(Json(serde_json::json!({})))
}

async fn volume_stats(
    State(services): State<Arc<CsiServices>>,
    Json(request): Json<NodeGetVolumeStatsRequest>,
) -> Result<Json<NodeGetVolumeStatsResponse>, CsiFailure> {
    Ok(Json(services.node.volume_stats(&request).await?))
}

async fn node_capabilities() -> Json<NodeCapabilitiesResponse> {
    Json(NodeCapabilitiesResponse {
        capabilities: vec!["STAGE_UNSTAGE_VOLUME".to_string(), "GET_VOLUME_STATS".to_string()],
    })
}

async fn node_info(State(services): State<Arc<CsiServices>>) -> Json<NodeGetInfoResponse> {
    Json(services.node.node_info())
}
