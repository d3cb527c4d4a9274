//! HTTP surface of a Cairn node.

use std::sync::Arc;

use axum::Router;
use axum::http::StatusCode;
use axum::routing::{delete, get, post, put};

use crate::daemon::Daemon;

pub mod cluster;
pub mod intra;
pub mod node;

/// Builds the full router; the same surface is served on every plane.
pub fn router(daemon: Arc<Daemon>) -> Router {
    Router::new()
        // Cluster API (any proxy; mutating verbs reach the primary)
        .route("/v1/cluster", get(cluster::get_what).put(cluster::put_action))
        .route("/v1/cluster/user-register", post(cluster::user_register))
        .route("/v1/cluster/keepalive", post(cluster::keepalive))
        .route("/v1/cluster/autoreg", post(cluster::autoreg))
        .route("/v1/cluster/proxy/{id}", put(cluster::set_primary))
        // Daemon API (node-local)
        .route("/v1/daemon", get(node::get_what).put(node::put_action))
        .route("/v1/daemon/user-register", post(node::receive_cluster_state))
        .route("/v1/daemon/proxy/{id}", put(node::handover_phase))
        .route("/v1/daemon/{id}", delete(node::rm_self))
        // Intra-cluster plane
        .route("/v1/health", get(intra::health))
        .route("/v1/metasync", post(intra::metasync))
        .route("/v1/reb/stage", post(intra::reb_stage))
        .route("/v1/reb/abort", post(intra::reb_abort))
        .route("/v1/reb/ack", post(intra::reb_ack))
        .route("/v1/reb/recv", post(intra::reb_recv))
        .route("/v1/ic/notify", post(intra::ic_notify))
        .fallback(|| async { (StatusCode::NOT_FOUND, "not found") })
        .with_state(daemon)
}
