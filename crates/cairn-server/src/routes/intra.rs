//! Intra-cluster plane: health, metasync deliveries, rebalance exchange.

use std::collections::HashMap;
use std::sync::Arc;

use axum::Json;
use axum::extract::{Query, State};
use cairn_cluster::NotifMsg;
use cairn_metasync::SyncBatch;
use serde_json::{Value, json};
use tracing::debug;

use crate::daemon::Daemon;
use crate::error::{ServerError, ServerResult};
use crate::transport::{AbortPush, ObjHandoff, StagePush};

/// `GET /v1/health` — liveness; with `reb-status=true` a target answers
/// with its current round status.
pub async fn health(
    State(daemon): State<Arc<Daemon>>,
    Query(params): Query<HashMap<String, String>>,
) -> Json<Value> {
    let want_reb = params.get("reb-status").is_some_and(|v| v == "true");
    if want_reb {
        if let Some(coordinator) = &daemon.coordinator {
            return Json(json!(coordinator.status()));
        }
    }
    Json(json!({
        "id": daemon.snode.id,
        "smap_version": daemon.smap.get().version,
        "ok": true,
    }))
}

/// `POST /v1/metasync` — a revision batch from the primary.
pub async fn metasync(
    State(daemon): State<Arc<Daemon>>,
    Json(batch): Json<SyncBatch>,
) -> ServerResult<Json<Value>> {
    let applied = daemon.receiver.apply(&batch).await?;
    daemon.keepalive.heard_from(&batch.sender);
    Ok(Json(json!({ "applied": applied })))
}

/// `POST /v1/reb/stage` — a peer pushed "I reached stage X".
pub async fn reb_stage(
    State(daemon): State<Arc<Daemon>>,
    Json(push): Json<StagePush>,
) -> ServerResult<Json<Value>> {
    let coordinator = daemon
        .coordinator
        .as_ref()
        .ok_or(ServerError::WrongRole("rebalance"))?;
    coordinator.observe_status(&push.from, &push.status).await;
    Ok(Json(json!({})))
}

/// `POST /v1/reb/abort` — round abort propagation.
pub async fn reb_abort(
    State(daemon): State<Arc<Daemon>>,
    Json(push): Json<AbortPush>,
) -> ServerResult<Json<Value>> {
    let coordinator = daemon
        .coordinator
        .as_ref()
        .ok_or(ServerError::WrongRole("rebalance"))?;
    coordinator.on_abort(push.reb_id);
    Ok(Json(json!({})))
}

/// `POST /v1/reb/ack` — the new owner committed an object we sent.
pub async fn reb_ack(
    State(daemon): State<Arc<Daemon>>,
    Json(ack): Json<ObjHandoff>,
) -> ServerResult<Json<Value>> {
    let coordinator = daemon
        .coordinator
        .as_ref()
        .ok_or(ServerError::WrongRole("rebalance"))?;
    coordinator.ack(&ack.from, &ack.obj);
    Ok(Json(json!({})))
}

/// `POST /v1/reb/recv` — an object handed to us during a round. Commit is
/// the storage engine's concern; once it lands, the sender gets its ack.
pub async fn reb_recv(
    State(daemon): State<Arc<Daemon>>,
    Json(handoff): Json<ObjHandoff>,
) -> ServerResult<Json<Value>> {
    if daemon.coordinator.is_none() {
        return Err(ServerError::WrongRole("rebalance"));
    }
    debug!(obj = %handoff.obj, from = %handoff.from, "object received");

    let smap = daemon.smap.get();
    let Some(sender) = smap.get_node(&handoff.from).cloned() else {
        return Err(ServerError::NotFound(format!("sender {}", handoff.from)));
    };
    let transport = Arc::clone(&daemon.transport);
    let obj = handoff.obj.clone();
    tokio::spawn(async move {
        if let Err(err) = transport.push_ack(&sender, &obj).await {
            debug!(err, "ack undelivered; sender will learn via status");
        }
    });
    Ok(Json(json!({ "committed": handoff.obj })))
}

/// `POST /v1/ic/notify` — completion report for a watched activity.
pub async fn ic_notify(
    State(daemon): State<Arc<Daemon>>,
    Json(msg): Json<NotifMsg>,
) -> ServerResult<Json<Value>> {
    if daemon.controller.is_none() {
        return Err(ServerError::WrongRole("notifications"));
    }
    let fired = daemon.notifs.on_status(&msg);
    Ok(Json(json!({ "fired": fired })))
}
