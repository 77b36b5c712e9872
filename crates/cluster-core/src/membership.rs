//! Membership tracker: which peers were heard from recently.
//!
//! There is no join/leave handshake. A peer exists from the first message we
//! receive from it and is forgotten lazily, the next time someone asks for the
//! live count, once it has been silent for longer than the heartbeat timeout.

use crate::node_id::NodeId;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

pub struct MembershipTracker {
    local: NodeId,
    timeout: Duration,
    last_seen: Mutex<HashMap<NodeId, Instant>>,
}

impl MembershipTracker {
    pub fn new(local: NodeId, timeout: Duration) -> Self {
        Self {
            local,
            timeout,
            last_seen: Mutex::new(HashMap::new()),
        }
    }

    /// Record traffic from `node`. Returns `true` if the node was not known.
    pub fn touch(&self, node: NodeId) -> bool {
        if node == self.local {
            return false;
        }
        self.last_seen
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(node, Instant::now())
            .is_none()
    }

    /// Forget peers that have been silent for longer than the timeout.
    /// Returns the evicted peers.
    pub fn prune(&self) -> Vec<NodeId> {
        let now = Instant::now();
        let mut last_seen = self.last_seen.lock().unwrap_or_else(|e| e.into_inner());
        let down: Vec<NodeId> = last_seen
            .iter()
            .filter(|(_, seen)| now.duration_since(**seen) > self.timeout)
            .map(|(id, _)| *id)
            .collect();
        for id in &down {
            debug!("node {} seems down", id);
            last_seen.remove(id);
        }
        down
    }

    /// Number of known peers, without pruning.
    pub fn len(&self) -> usize {
        self.last_seen.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, node: &NodeId) -> bool {
        self.last_seen
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(node)
    }
}
