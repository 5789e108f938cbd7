//! Cluster membership oracle interface.
//!
//! Membership is supplied by an external service; the runtime only ever
//! consumes point-in-time snapshots. Snapshot ordering is normalised by the
//! planner so every node derives the same assignment from the same set.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// One eventing node as reported by the membership oracle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClusterMember {
    /// Opaque identity that survives address changes.
    pub node_uuid: String,
    /// `host:port` the node's eventing service listens on.
    pub host_port: String,
}

/// Read-only view of cluster membership.
#[async_trait]
pub trait MembershipOracle: Send + Sync + 'static {
    /// Current set of eventing nodes.
    async fn eventing_nodes(&self) -> anyhow::Result<Vec<ClusterMember>>;

    /// Current set of KV node addresses.
    async fn kv_nodes(&self) -> anyhow::Result<Vec<String>>;

    /// Identity of the node this process runs on.
    async fn current_node(&self) -> anyhow::Result<ClusterMember>;

    /// Whether the given node is still alive. Both the address and the UUID
    /// must match; a recycled address with a new UUID counts as dead.
    async fn is_alive(&self, host_port: &str, node_uuid: &str) -> bool;
}
