//! Notification listeners and the xaction registry.
//!
//! Long-lived cluster activities (a rebalance round, a maintenance-driven
//! removal) register a listener on the primary. The listener's callback
//! fires exactly once, on the first terminal status it observes; follow-up
//! actions such as the final removal of a decommissioned node hang off that
//! callback.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use cairn_types::NodeId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Terminal (or progress) report of a long-lived activity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifMsg {
    /// Listener ID, e.g. `reb-7`.
    pub id: String,
    /// Reporting node.
    pub node: NodeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err: Option<String>,
    #[serde(default)]
    pub aborted: bool,
    /// Terminal reports retire the listener; non-terminal ones only log.
    #[serde(default = "default_true")]
    pub finished: bool,
}

fn default_true() -> bool {
    true
}

/// Snapshot of a registered activity, served by `?what=xaction`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct XactSnapshot {
    pub id: String,
    pub kind: String,
    pub start_time: DateTime<Utc>,
}

type NotifCallback = Box<dyn Fn(&NotifMsg) + Send + Sync>;

/// One long-lived activity being watched.
pub struct NotifListener {
    pub id: String,
    pub kind: String,
    /// The information-council proxies that mirror this listener.
    pub owners: Vec<NodeId>,
    start_time: DateTime<Utc>,
    fired: AtomicBool,
    callback: Option<NotifCallback>,
}

impl NotifListener {
    pub fn new(id: impl Into<String>, kind: impl Into<String>, owners: Vec<NodeId>) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            owners,
            start_time: Utc::now(),
            fired: AtomicBool::new(false),
            callback: None,
        }
    }

    /// Attaches the once-only completion callback.
    pub fn with_callback(mut self, cb: impl Fn(&NotifMsg) + Send + Sync + 'static) -> Self {
        self.callback = Some(Box::new(cb));
        self
    }

    fn snapshot(&self) -> XactSnapshot {
        XactSnapshot {
            id: self.id.clone(),
            kind: self.kind.clone(),
            start_time: self.start_time,
        }
    }
}

/// Listener registry; one per proxy, populated on the primary and mirrored
/// on the rest of the information council.
#[derive(Default)]
pub struct NotifRegistry {
    listeners: Mutex<HashMap<String, Arc<NotifListener>>>,
}

impl NotifRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, listener: NotifListener) -> Arc<NotifListener> {
        let listener = Arc::new(listener);
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.insert(listener.id.clone(), Arc::clone(&listener));
        }
        info!(id = %listener.id, kind = %listener.kind, "notif: listener registered");
        listener
    }

    /// Delivers a status report. Returns `true` when this report retired the
    /// listener (first terminal status); the callback fires at most once no
    /// matter how many terminal reports race in.
    pub fn on_status(&self, msg: &NotifMsg) -> bool {
        let listener = self
            .listeners
            .lock()
            .ok()
            .and_then(|listeners| listeners.get(&msg.id).cloned());
        let Some(listener) = listener else {
            debug!(id = %msg.id, "notif: no listener for status");
            return false;
        };

        if !msg.finished {
            debug!(id = %msg.id, node = %msg.node, "notif: progress");
            return false;
        }
        if listener.fired.swap(true, Ordering::SeqCst) {
            return false;
        }

        info!(
            id = %msg.id,
            node = %msg.node,
            aborted = msg.aborted,
            err = msg.err.as_deref().unwrap_or(""),
            "notif: terminal status"
        );
        if let Some(cb) = &listener.callback {
            cb(msg);
        }
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.remove(&msg.id);
        }
        true
    }

    /// Active (unfinished) activities.
    pub fn snapshot(&self) -> Vec<XactSnapshot> {
        self.listeners
            .lock()
            .map(|listeners| listeners.values().map(|l| l.snapshot()).collect())
            .unwrap_or_default()
    }
}
