//! Outbound HTTP: one client implementing every seam the lower crates
//! consume, plus the no-op data plane used until a storage engine is wired.

use std::time::Duration;

use async_trait::async_trait;
use cairn_cluster::{ClusterError, NodeClient, NotifMsg};
use cairn_meta::{Bmd, NodeRegMeta, Smap};
use cairn_metasync::{SyncBatch, SyncError, SyncTransport};
use cairn_rebalance::{Mover, RebError, SendOutcome, StatusProbe};
use cairn_types::{NodeId, RebStatus, Snode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

/// Caller-identity header checked by `DELETE /v1/daemon/{id}`.
pub const CALLER_ID_HEADER: &str = "x-caller-id";

/// Body of a stage push.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagePush {
    pub from: NodeId,
    pub status: RebStatus,
}

/// Body of an abort push.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbortPush {
    pub reb_id: u64,
}

/// Body of an object handoff and of its ack.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjHandoff {
    pub from: NodeId,
    pub obj: String,
}

/// State handed to a candidate during `user-register`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterStatePush {
    pub smap: Smap,
    pub bmd: Bmd,
}

/// reqwest-backed implementation of the intra-cluster seams.
pub struct HttpTransport {
    self_id: NodeId,
    http: reqwest::Client,
}

impl HttpTransport {
    pub fn new(self_id: NodeId, rpc_timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(rpc_timeout)
            .build()
            .unwrap_or_default();
        Self { self_id, http }
    }

    fn control(peer: &Snode, path: &str) -> String {
        format!("{}{path}", peer.control_net.url())
    }

    async fn post_json<B: Serialize>(
        &self,
        peer: &Snode,
        path: &str,
        body: &B,
    ) -> Result<reqwest::Response, String> {
        let resp = self
            .http
            .post(Self::control(peer, path))
            .json(body)
            .send()
            .await
            .map_err(|err| err.to_string())?;
        if resp.status().is_success() {
            Ok(resp)
        } else {
            Err(format!("{} answered {}", peer.id, resp.status()))
        }
    }

    /// Periodic keepalive against the primary.
    pub async fn keepalive(&self, primary: &Snode, meta: &NodeRegMeta) -> Result<u16, String> {
        let resp = self
            .http
            .post(Self::control(primary, "/v1/cluster/keepalive"))
            .json(meta)
            .send()
            .await
            .map_err(|err| err.to_string())?;
        Ok(resp.status().as_u16())
    }

    /// Self-registration against a proxy named by its URL.
    pub async fn join(&self, join_url: &str, meta: &NodeRegMeta) -> Result<(), String> {
        let resp = self
            .http
            .post(format!("{join_url}/v1/cluster/autoreg"))
            .json(meta)
            .send()
            .await
            .map_err(|err| err.to_string())?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(format!("join answered {}", resp.status()))
        }
    }

    /// Round-completion report to an information-council proxy.
    pub async fn notify_ic(&self, proxy: &Snode, msg: &NotifMsg) -> Result<(), String> {
        self.post_json(proxy, "/v1/ic/notify", msg).await.map(|_| ())
    }

    /// Read-only `?what=` aggregation against one node.
    pub async fn daemon_what(&self, peer: &Snode, what: &str) -> Option<serde_json::Value> {
        let url = format!("{}/v1/daemon?what={what}", peer.control_net.url());
        match self.http.get(url).send().await {
            Ok(resp) if resp.status().is_success() => resp.json().await.ok(),
            _ => None,
        }
    }

    /// Node-level action delivery (set-config, shutdown).
    pub async fn daemon_action(
        &self,
        peer: &Snode,
        action: &cairn_types::ControlAction,
    ) -> Result<(), String> {
        let resp = self
            .http
            .put(Self::control(peer, "/v1/daemon"))
            .json(action)
            .send()
            .await
            .map_err(|err| err.to_string())?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(format!("{} answered {}", peer.id, resp.status()))
        }
    }

    /// Relays a mutating cluster action to the primary on behalf of a
    /// client that hit a non-primary proxy.
    pub async fn forward_action(
        &self,
        primary: &Snode,
        action: &cairn_types::ControlAction,
    ) -> Result<(u16, serde_json::Value), String> {
        let resp = self
            .http
            .put(Self::control(primary, "/v1/cluster"))
            .json(action)
            .send()
            .await
            .map_err(|err| err.to_string())?;
        let status = resp.status().as_u16();
        let body = resp.json().await.unwrap_or_else(|_| json!({}));
        Ok((status, body))
    }

    /// Commit ack back to the sender of an object.
    pub async fn push_ack(&self, sender: &Snode, obj: &str) -> Result<(), String> {
        let body = ObjHandoff {
            from: self.self_id.clone(),
            obj: obj.to_string(),
        };
        self.post_json(sender, "/v1/reb/ack", &body).await.map(|_| ())
    }
}

#[async_trait]
impl SyncTransport for HttpTransport {
    async fn send(&self, peer: &Snode, batch: &SyncBatch) -> Result<(), SyncError> {
        self.post_json(peer, "/v1/metasync", batch)
            .await
            .map(|_| ())
            .map_err(|reason| SyncError::Transport {
                peer: peer.id.to_string(),
                reason,
            })
    }
}

#[async_trait]
impl StatusProbe for HttpTransport {
    async fn reb_status(&self, peer: &Snode) -> Result<RebStatus, RebError> {
        let url = format!("{}/v1/health?reb-status=true", peer.control_net.url());
        let resp = self.http.get(url).send().await.map_err(|err| RebError::Transport {
            peer: peer.id.to_string(),
            reason: err.to_string(),
        })?;
        resp.json().await.map_err(|err| RebError::Transport {
            peer: peer.id.to_string(),
            reason: err.to_string(),
        })
    }

    async fn push_stage(&self, peer: &Snode, status: &RebStatus) -> Result<(), RebError> {
        let body = StagePush {
            from: self.self_id.clone(),
            status: status.clone(),
        };
        self.post_json(peer, "/v1/reb/stage", &body)
            .await
            .map(|_| ())
            .map_err(|reason| RebError::Transport {
                peer: peer.id.to_string(),
                reason,
            })
    }

    async fn push_abort(&self, peer: &Snode, reb_id: u64) -> Result<(), RebError> {
        self.post_json(peer, "/v1/reb/abort", &AbortPush { reb_id })
            .await
            .map(|_| ())
            .map_err(|reason| RebError::Transport {
                peer: peer.id.to_string(),
                reason,
            })
    }
}

#[async_trait]
impl NodeClient for HttpTransport {
    async fn probe(&self, node: &Snode) -> bool {
        let url = format!("{}/v1/health", node.control_net.url());
        match self.http.get(url).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(err) => {
                debug!(node = %node.id, %err, "probe failed");
                false
            }
        }
    }

    async fn register_to(
        &self,
        candidate: &Snode,
        smap: &Smap,
        bmd: &Bmd,
    ) -> Result<(), ClusterError> {
        let body = ClusterStatePush {
            smap: smap.clone(),
            bmd: bmd.clone(),
        };
        self.post_json(candidate, "/v1/daemon/user-register", &body)
            .await
            .map(|_| ())
            .map_err(|reason| ClusterError::Transport {
                node: candidate.id.clone(),
                reason,
            })
    }

    async fn rm_self(&self, node: &Snode) -> Result<(), ClusterError> {
        let url = format!("{}/v1/daemon/{}", node.control_net.url(), node.id);
        let resp = self
            .http
            .delete(url)
            .header(CALLER_ID_HEADER, node.id.as_str())
            .send()
            .await
            .map_err(|err| ClusterError::Transport {
                node: node.id.clone(),
                reason: err.to_string(),
            })?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(ClusterError::Transport {
                node: node.id.clone(),
                reason: format!("rm-self answered {}", resp.status()),
            })
        }
    }

    async fn handover(
        &self,
        node: &Snode,
        new_primary: &NodeId,
        prepare: bool,
    ) -> Result<(), ClusterError> {
        let url = format!(
            "{}/v1/daemon/proxy/{new_primary}?prepare={prepare}",
            node.control_net.url()
        );
        let resp = self
            .http
            .put(url)
            .json(&json!({}))
            .send()
            .await
            .map_err(|err| ClusterError::Transport {
                node: node.id.clone(),
                reason: err.to_string(),
            })?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(ClusterError::Transport {
                node: node.id.clone(),
                reason: format!("handover answered {}", resp.status()),
            })
        }
    }
}

/// Data-plane seam: hands the object name to the new owner and lets the
/// owner ack once committed. Streaming the bytes belongs to the storage
/// engine behind this interface.
pub struct HttpMover {
    self_id: NodeId,
    http: reqwest::Client,
}

impl HttpMover {
    pub fn new(self_id: NodeId, rpc_timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(rpc_timeout)
            .build()
            .unwrap_or_default();
        Self { self_id, http }
    }
}

#[async_trait]
impl Mover for HttpMover {
    async fn send(&self, to: &Snode, obj: &str) -> Result<SendOutcome, RebError> {
        let body = ObjHandoff {
            from: self.self_id.clone(),
            obj: obj.to_string(),
        };
        let url = format!("{}/v1/reb/recv", to.data_net.url());
        let resp = self
            .http
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(|err| RebError::Transport {
                peer: to.id.to_string(),
                reason: err.to_string(),
            })?;

        match resp.status() {
            status if status.is_success() => Ok(SendOutcome::Sent),
            reqwest::StatusCode::NOT_FOUND => Ok(SendOutcome::NotFound),
            status => Err(RebError::Transport {
                peer: to.id.to_string(),
                reason: format!("recv answered {status}"),
            }),
        }
    }
}
