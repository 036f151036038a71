//! Replica fan-out across nodes.
//!
//! Given a key, an externally supplied locator orders the candidate nodes;
//! the dispatcher delivers the operation to the primary and to each replica
//! in that order. This is redundancy fan-out, not failover: a successful
//! attempt does not cut the walk short. What counts as overall success is a
//! policy choice, so it is configuration rather than a hard-coded rule.

use crate::config::{ClientConfiguration, DisposeGuard};
use crate::error::ConfigError;
use crate::node::{CacheNode, NodeCallbacks};
use crate::request::CacheRequest;
use log::debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Orders candidate node indices for a key. Hash/ring placement lives
/// outside this crate; whatever supplies the ordering plugs in here.
pub trait NodeLocator: Send + Sync {
    fn locate(&self, key: &[u8], node_count: usize) -> Vec<usize>;
}

/// Key-independent ordering: node 0 is always primary. A stand-in for
/// environments where placement is decided elsewhere.
#[derive(Debug, Clone, Copy, Default)]
pub struct SequentialLocator;

impl NodeLocator for SequentialLocator {
    fn locate(&self, _key: &[u8], node_count: usize) -> Vec<usize> {
        (0..node_count).collect()
    }
}

/// Success criterion for a fanned-out operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaPolicy {
    /// The first (primary) attempt must be accepted.
    PrimaryAccepted,
    /// More than half of the attempted candidates must accept.
    MajorityAccepted,
    /// Every attempted candidate must accept.
    AllAccepted,
}

impl ReplicaPolicy {
    fn satisfied(&self, accepted: usize, attempted: usize, primary_accepted: bool) -> bool {
        if attempted == 0 {
            return false;
        }
        match self {
            ReplicaPolicy::PrimaryAccepted => primary_accepted,
            ReplicaPolicy::MajorityAccepted => accepted * 2 > attempted,
            ReplicaPolicy::AllAccepted => accepted == attempted,
        }
    }
}

/// Owns every node pool for the client's lifetime and fans operations out
/// to `replicas + 1` candidates, clamped to the number of configured nodes.
pub struct ReplicaDispatcher {
    nodes: Vec<Arc<dyn CacheNode>>,
    locator: Arc<dyn NodeLocator>,
    replicas: usize,
    policy: ReplicaPolicy,
    send_timeout: Duration,
    disposed: AtomicBool,
    dispose_guard: DisposeGuard,
}

impl ReplicaDispatcher {
    pub fn new(
        config: &ClientConfiguration,
        events: NodeCallbacks,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let nodes = config
            .endpoints
            .iter()
            .map(|endpoint| (config.node_factory)(*endpoint, config, events.clone()))
            .collect();
        Ok(Self {
            nodes,
            locator: config.locator.clone(),
            replicas: config.replicas,
            policy: config.replica_policy,
            send_timeout: config.send_timeout,
            disposed: AtomicBool::new(false),
            dispose_guard: config.dispose_guard.clone(),
        })
    }

    /// Delivers one logical operation. `make_request` is invoked once per
    /// candidate so every attempt carries its own independently wired
    /// completion; outstanding replica attempts must never share a
    /// single-fire slot.
    pub fn dispatch<F>(&self, key: &[u8], mut make_request: F) -> bool
    where
        F: FnMut() -> Arc<dyn CacheRequest>,
    {
        if self.disposed.load(Ordering::SeqCst) {
            return false;
        }
        let wanted = (self.replicas + 1).min(self.nodes.len());
        let candidates = self.locator.locate(key, self.nodes.len());

        let mut attempted = 0;
        let mut accepted = 0;
        let mut primary_accepted = false;
        for (position, index) in candidates.into_iter().take(wanted).enumerate() {
            let Some(node) = self.nodes.get(index) else {
                debug!("event=locator_out_of_range index={index}");
                continue;
            };
            attempted += 1;
            if node.try_send(make_request(), self.send_timeout) {
                accepted += 1;
                if position == 0 {
                    primary_accepted = true;
                }
            }
        }
        self.policy.satisfied(accepted, attempted, primary_accepted)
    }

    pub fn nodes(&self) -> &[Arc<dyn CacheNode>] {
        &self.nodes
    }

    /// Releases every node pool and trips the client-wide dispose guard so
    /// in-flight reconnects stand down. Idempotent.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.dispose_guard.trip();
        for node in &self.nodes {
            node.dispose();
        }
    }
}

impl Drop for ReplicaDispatcher {
    fn drop(&mut self) {
        self.dispose();
    }
}
