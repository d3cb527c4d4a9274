//! Per-peer liveness bookkeeping.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use cairn_types::NodeId;
use tracing::warn;

/// Single funnel for keepalive heartbeats.
///
/// Every inbound keepalive and every request-path error lands here, so that
/// "when did we last hear from X" has one answer per node. The tracker only
/// reports; eviction decisions stay with the membership controller.
pub struct KeepaliveTracker {
    window: Duration,
    max_missed: u32,
    heard: Mutex<HashMap<NodeId, Instant>>,
}

impl KeepaliveTracker {
    pub fn new(window: Duration, max_missed: u32) -> Self {
        Self {
            window,
            max_missed: max_missed.max(1),
            heard: Mutex::new(HashMap::new()),
        }
    }

    /// Records a heartbeat (or any successful exchange) from `id`.
    pub fn heard_from(&self, id: &NodeId) {
        if let Ok(mut heard) = self.heard.lock() {
            heard.insert(id.clone(), Instant::now());
        }
    }

    /// Records a request-path error against `id`. Errors do not refresh the
    /// liveness timestamp; a peer that only ever errors goes suspect.
    pub fn on_err(&self, id: &NodeId, err: &str) {
        warn!(node = %id, error = err, "keepalive: request error");
    }

    /// Time since the last heartbeat, if any was ever recorded.
    pub fn since_heard(&self, id: &NodeId) -> Option<Duration> {
        self.heard
            .lock()
            .ok()
            .and_then(|heard| heard.get(id).map(Instant::elapsed))
    }

    /// Forgets a node, e.g. after it leaves the map.
    pub fn forget(&self, id: &NodeId) {
        if let Ok(mut heard) = self.heard.lock() {
            heard.remove(id);
        }
    }

    /// Nodes whose last heartbeat is older than `max_missed` windows.
    /// Nodes never heard from are not reported; they are still joining.
    pub fn suspects(&self) -> Vec<NodeId> {
        let cutoff = self.window * self.max_missed;
        let Ok(heard) = self.heard.lock() else {
            return Vec::new();
        };
        heard
            .iter()
            .filter(|(_, at)| at.elapsed() > cutoff)
            .map(|(id, _)| id.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heard_from_refreshes() {
        let tracker = KeepaliveTracker::new(Duration::from_millis(50), 3);
        let t1 = NodeId::from("t1");

        assert!(tracker.since_heard(&t1).is_none());
        tracker.heard_from(&t1);
        assert!(tracker.since_heard(&t1).unwrap() < Duration::from_millis(50));
    }

    #[test]
    fn test_suspects_after_missed_windows() {
        let tracker = KeepaliveTracker::new(Duration::from_millis(1), 2);
        let t1 = NodeId::from("t1");
        tracker.heard_from(&t1);

        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(tracker.suspects(), vec![t1]);
    }

    #[test]
    fn test_forget() {
        let tracker = KeepaliveTracker::new(Duration::from_millis(1), 1);
        let t1 = NodeId::from("t1");
        tracker.heard_from(&t1);
        tracker.forget(&t1);

        std::thread::sleep(Duration::from_millis(5));
        assert!(tracker.suspects().is_empty());
    }
}
