//! `/v1/cluster`: the administrator-facing surface.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::response::{IntoResponse, Response};
use cairn_cluster::{ClusterError, Controller, JoinResponse};
use cairn_meta::NodeRegMeta;
use cairn_metasync::{SyncBatch, SyncNote, SyncPair, SyncTransport};
use cairn_rebalance::StatusProbe;
use cairn_types::{ControlAction, NodeId, Snode};
use serde_json::{Value, json};
use tracing::{error, info};

use crate::daemon::Daemon;
use crate::error::{ServerError, ServerResult};

fn controller(daemon: &Daemon) -> ServerResult<&Arc<Controller>> {
    daemon
        .controller
        .as_ref()
        .ok_or(ServerError::WrongRole("cluster control"))
}

/// `GET /v1/cluster?what=...` — read-only aggregation.
pub async fn get_what(
    State(daemon): State<Arc<Daemon>>,
    Query(params): Query<HashMap<String, String>>,
) -> ServerResult<Json<Value>> {
    let what = params.get("what").map(String::as_str).unwrap_or("status");
    let smap = daemon.smap.get();

    match what {
        "target-ips" => {
            let ips: Vec<String> = smap
                .targets
                .values()
                .map(|t| t.public_net.hostname.clone())
                .collect();
            Ok(Json(json!(ips)))
        }
        "xaction" => Ok(Json(json!(daemon.notifs.snapshot()))),
        "remote-ais" => Ok(Json(json!({}))),
        "stats" | "sysinfo" | "status" | "mountpaths" => {
            Ok(Json(aggregate(&daemon, what).await))
        }
        other => Err(ServerError::BadRequest(format!("unknown what={other}"))),
    }
}

/// Fans one `?what=` query out to all targets, bounded like any broadcast.
async fn aggregate(daemon: &Arc<Daemon>, what: &str) -> Value {
    let smap = daemon.smap.get();
    let acc: Arc<Mutex<serde_json::Map<String, Value>>> = Arc::default();

    let daemon2 = Arc::clone(daemon);
    let what = what.to_string();
    let acc2 = Arc::clone(&acc);
    let failed = cairn_transport::bcast(
        smap.targets.values().cloned().collect::<Vec<Snode>>(),
        daemon.cfg.broadcast.max_parallel,
        move |peer: Snode| {
            let daemon = Arc::clone(&daemon2);
            let what = what.clone();
            let acc = Arc::clone(&acc2);
            async move {
                match daemon.transport.daemon_what(&peer, &what).await {
                    Some(body) => {
                        if let Ok(mut acc) = acc.lock() {
                            acc.insert(peer.id.to_string(), body);
                        }
                        true
                    }
                    None => false,
                }
            }
        },
    )
    .await;

    let mut out = acc.lock().map(|acc| acc.clone()).unwrap_or_default();
    if failed > 0 {
        out.insert("unreachable".to_string(), json!(failed));
    }
    Value::Object(out)
}

/// `POST /v1/cluster/user-register` — administrator-initiated join.
pub async fn user_register(
    State(daemon): State<Arc<Daemon>>,
    Json(meta): Json<NodeRegMeta>,
) -> ServerResult<Json<JoinResponse>> {
    let controller = controller(&daemon)?;
    controller.ensure_primary()?;
    let resp = controller.user_register(meta, false).await?;
    Ok(Json(resp))
}

/// `POST /v1/cluster/autoreg` — node self-registration.
pub async fn autoreg(
    State(daemon): State<Arc<Daemon>>,
    Json(meta): Json<NodeRegMeta>,
) -> ServerResult<Json<JoinResponse>> {
    let controller = controller(&daemon)?;
    controller.ensure_primary()?;
    let resp = controller.join(meta, false).await?;
    Ok(Json(resp))
}

/// `POST /v1/cluster/keepalive`.
pub async fn keepalive(
    State(daemon): State<Arc<Daemon>>,
    Json(meta): Json<NodeRegMeta>,
) -> ServerResult<Json<Value>> {
    let controller = controller(&daemon)?;
    controller.ensure_primary()?;
    let version = controller.keepalive(&meta).await?;
    Ok(Json(json!({ "smap_version": version })))
}

/// `PUT /v1/cluster/proxy/{id}` — switch the primary.
pub async fn set_primary(
    State(daemon): State<Arc<Daemon>>,
    Path(id): Path<NodeId>,
) -> ServerResult<Json<Value>> {
    run_set_primary(&daemon, &id).await.map(Json)
}

/// `PUT /v1/cluster` — the tagged action document.
pub async fn put_action(
    State(daemon): State<Arc<Daemon>>,
    Json(action): Json<ControlAction>,
) -> Response {
    match dispatch(&daemon, action).await {
        Ok(json) => Json(json).into_response(),
        Err(err) => err.into_response(),
    }
}

async fn dispatch(daemon: &Arc<Daemon>, action: ControlAction) -> ServerResult<Value> {
    let controller = controller(daemon)?;

    // Mutating verbs belong to the primary; relay when we are not it.
    if let Err(ClusterError::NotPrimary { primary, url }) = controller.ensure_primary() {
        let smap = daemon.smap.get();
        if let Some(primary_node) = smap.get_node(&primary).cloned() {
            info!(action = action.name(), primary = %primary, "forwarding to primary");
            return match daemon.transport.forward_action(&primary_node, &action).await {
                Ok((status, body)) if status < 400 => Ok(body),
                Ok((status, body)) => Err(ServerError::BadRequest(format!(
                    "primary answered {status}: {body}"
                ))),
                Err(reason) => Err(ServerError::Cluster(ClusterError::Transport {
                    node: primary,
                    reason,
                })),
            };
        }
        return Err(ServerError::Cluster(ClusterError::NotPrimary { primary, url }));
    }

    match action {
        ControlAction::SetConfig { ref name, ref value } => {
            info!(name = %name, value = %value, "set-config");
            broadcast_daemon_action(daemon, &action).await;
            Ok(json!({ "applied": name }))
        }
        ControlAction::Shutdown => {
            broadcast_daemon_action(daemon, &action).await;
            daemon.trigger_shutdown();
            Ok(json!({ "shutdown": true }))
        }
        ControlAction::XactStart(args) if args.kind == "rebalance" => {
            let reb_id = controller.force_rebalance().await?;
            Ok(json!({ "reb_id": reb_id }))
        }
        ControlAction::XactStop(args) if args.kind == "rebalance" => {
            let reb_id = daemon.rmd.get().rebalance_id();
            let smap = daemon.smap.get();
            for target in smap.targets.values() {
                let _ = daemon.transport.push_abort(target, reb_id).await;
            }
            Ok(json!({ "aborted": reb_id }))
        }
        ControlAction::XactStart(args) | ControlAction::XactStop(args) => Err(
            ServerError::BadRequest(format!("unknown xaction kind {:?}", args.kind)),
        ),
        ControlAction::SendOwnershipTbl { daemon_id } => {
            send_ownership_tbl(daemon, &daemon_id).await?;
            Ok(json!({ "sent": daemon_id }))
        }
        ControlAction::StartMaintenance(args) => {
            let reb_id = controller.start_maintenance(&args).await?;
            Ok(json!({ "reb_id": reb_id }))
        }
        ControlAction::StopMaintenance(args) => {
            let reb_id = controller.stop_maintenance(&args).await?;
            Ok(json!({ "reb_id": reb_id }))
        }
        ControlAction::Decommission(args) => {
            let reb_id = controller.decommission(&args).await?;
            Ok(json!({ "reb_id": reb_id }))
        }
        ControlAction::ShutdownNode(args) => {
            let reb_id = controller.shutdown_node(&args).await?;
            Ok(json!({ "reb_id": reb_id }))
        }
        ControlAction::SetPrimary { daemon_id } => {
            run_set_primary(daemon, &daemon_id).await
        }
    }
}

async fn run_set_primary(daemon: &Arc<Daemon>, new_id: &NodeId) -> ServerResult<Value> {
    let controller = controller(daemon)?;
    controller.ensure_primary()?;

    match controller.set_primary(new_id).await {
        Ok(()) => Ok(json!({ "primary": new_id })),
        Err(err) if err.is_fatal() => {
            // The cluster has no consistent primary anymore; going down is
            // the only honest move.
            error!(%err, "handover commit failed on the new primary");
            daemon.trigger_shutdown();
            Err(err.into())
        }
        Err(err) => Err(err.into()),
    }
}

async fn broadcast_daemon_action(daemon: &Arc<Daemon>, action: &ControlAction) {
    let smap = daemon.smap.get();
    let peers = smap.all_nodes_except(&daemon.snode.id);
    for peer in peers {
        if let Err(err) = daemon.transport.daemon_action(&peer, action).await {
            tracing::warn!(node = %peer.id, err, "daemon action undelivered");
        }
    }
}

async fn send_ownership_tbl(daemon: &Arc<Daemon>, dest: &NodeId) -> ServerResult<()> {
    let smap = daemon.smap.get();
    let peer = smap
        .get_node(dest)
        .cloned()
        .ok_or_else(|| ServerError::Cluster(ClusterError::NodeNotFound(dest.clone())))?;

    let pair = SyncPair::of(&*smap, SyncNote::about("send-ownership-tbl", dest.clone()))?;
    let batch = SyncBatch {
        uuid: smap.uuid,
        sender: daemon.snode.id.clone(),
        pairs: vec![pair],
    };
    daemon.transport.send(&peer, &batch).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use cairn_types::NodeId;

    // `Path<NodeId>` deserializes from a plain string segment because the
    // newtype is serde-transparent.
    #[test]
    fn test_node_id_path_segment() {
        let id: NodeId = serde_json::from_value(serde_json::json!("p2")).unwrap();
        assert_eq!(id, NodeId::from("p2"));
    }
}
