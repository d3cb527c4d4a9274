//! `/v1/daemon`: node-local verbs.

use std::collections::HashMap;
use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use cairn_cluster::adopt_primary;
use cairn_types::{ControlAction, NodeId};
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::daemon::Daemon;
use crate::error::{ServerError, ServerResult};
use crate::transport::{CALLER_ID_HEADER, ClusterStatePush};

/// `GET /v1/daemon?what=...` — node-local introspection.
pub async fn get_what(
    State(daemon): State<Arc<Daemon>>,
    Query(params): Query<HashMap<String, String>>,
) -> ServerResult<Json<Value>> {
    let what = params.get("what").map(String::as_str).unwrap_or("snode");
    match what {
        "snode" => Ok(Json(json!(daemon.snode))),
        "smap" => Ok(Json(json!(*daemon.smap.get()))),
        "rmd" => Ok(Json(json!(*daemon.rmd.get()))),
        "bmd" => Ok(Json(json!(*daemon.bmd.get()))),
        "status" => {
            let mut status = json!({
                "id": daemon.snode.id,
                "role": daemon.snode.role,
                "smap_version": daemon.smap.get().version,
                "primary": daemon.is_primary(),
            });
            if let Some(coordinator) = &daemon.coordinator {
                status["rebalance"] = json!(coordinator.status());
            }
            Ok(Json(status))
        }
        "stats" => Ok(Json(json!({
            "id": daemon.snode.id,
            "smap_version": daemon.smap.get().version,
            "reb_id": daemon.rmd.get().rebalance_id(),
        }))),
        "sysinfo" => Ok(Json(json!({
            "hostname": daemon.snode.public_net.hostname,
            "cpus": std::thread::available_parallelism().map(usize::from).unwrap_or(1),
        }))),
        "mountpaths" => Ok(Json(json!([daemon.cfg.node.meta_dir]))),
        other => Err(ServerError::BadRequest(format!("unknown what={other}"))),
    }
}

/// `PUT /v1/daemon` — node-level actions (set-config, shutdown).
pub async fn put_action(
    State(daemon): State<Arc<Daemon>>,
    Json(action): Json<ControlAction>,
) -> ServerResult<Json<Value>> {
    match action {
        ControlAction::SetConfig { name, value } => {
            // Config is file-driven; runtime overrides only land in the log
            // until a reload knob exists.
            info!(name = %name, value = %value, "set-config received");
            Ok(Json(json!({ "applied": name })))
        }
        ControlAction::Shutdown => {
            daemon.trigger_shutdown();
            Ok(Json(json!({ "shutdown": true })))
        }
        other => Err(ServerError::BadRequest(format!(
            "action {} is cluster-level",
            other.name()
        ))),
    }
}

/// `POST /v1/daemon/user-register` — the primary pushes cluster state to a
/// candidate before registering it.
pub async fn receive_cluster_state(
    State(daemon): State<Arc<Daemon>>,
    Json(push): Json<ClusterStatePush>,
) -> ServerResult<Json<Value>> {
    let smap_version = push.smap.version;
    match daemon.smap.install(push.smap).await {
        Ok(_) => {}
        Err(err) if err.is_no_change() => {}
        Err(err) => return Err(ServerError::Meta(err)),
    }
    match daemon.bmd.install(push.bmd).await {
        Ok(_) => {}
        Err(err) if err.is_no_change() => {}
        Err(err) => return Err(ServerError::Meta(err)),
    }
    info!(smap_version, "cluster state received");
    Ok(Json(json!({ "smap_version": smap_version })))
}

/// `PUT /v1/daemon/proxy/{id}?prepare=true|false` — handover phases.
pub async fn handover_phase(
    State(daemon): State<Arc<Daemon>>,
    Path(id): Path<NodeId>,
    Query(params): Query<HashMap<String, String>>,
) -> ServerResult<Json<Value>> {
    let prepare = params
        .get("prepare")
        .map(|v| v == "true")
        .ok_or_else(|| ServerError::BadRequest("missing prepare parameter".to_string()))?;

    if prepare {
        // Phase 1 changes nothing; just confirm we could follow the switch.
        let smap = daemon.smap.get();
        if smap.version > 0 && !smap.proxies.contains_key(&id) {
            return Err(ServerError::BadRequest(format!(
                "proxy {id} not in local map v{}",
                smap.version
            )));
        }
        return Ok(Json(json!({ "prepared": id })));
    }

    match &daemon.controller {
        Some(controller) => controller.handover_commit_received(&id).await?,
        None => adopt_primary(&daemon.smap, &id).await?,
    }
    Ok(Json(json!({ "primary": id })))
}

/// `DELETE /v1/daemon/{id}` — self-initiated removal. The caller-id header
/// must name the node itself; anything else is refused.
pub async fn rm_self(
    State(daemon): State<Arc<Daemon>>,
    Path(id): Path<NodeId>,
    headers: HeaderMap,
) -> ServerResult<Json<Value>> {
    let caller = headers
        .get(CALLER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if caller != id.as_str() {
        return Err(ServerError::BadRequest(format!(
            "caller-id {caller:?} does not match {id}"
        )));
    }
    if id != daemon.snode.id {
        return Err(ServerError::NotFound(format!("daemon {id}")));
    }

    warn!(node = %id, "leaving the cluster");
    daemon.trigger_shutdown();
    Ok(Json(json!({ "removed": id })))
}
