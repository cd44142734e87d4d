//! Cluster Membership
//!
//! Tracks the controller nodes forming the cluster and picks gossip peers.

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;

use super::NodeId;
use crate::config::NetStateConfig;

/// Node status in the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeStatus {
    /// Node is known but has not been heard from
    Joining,
    /// Node is reachable
    Active,
    /// Node is unreachable
    Offline,
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeStatus::Joining => write!(f, "JOINING"),
            NodeStatus::Active => write!(f, "ACTIVE"),
            NodeStatus::Offline => write!(f, "OFFLINE"),
        }
    }
}

/// State of a single controller node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeState {
    /// Unique node identifier
    pub id: NodeId,
    /// Node address (host:port)
    pub address: String,
    /// Current status
    pub status: NodeStatus,
    /// When the node was added to the membership
    pub joined_at: chrono::DateTime<chrono::Utc>,
}

impl NodeState {
    /// Create a new node state
    pub fn new(id: NodeId, address: String) -> Self {
        Self {
            id,
            address,
            status: NodeStatus::Joining,
            joined_at: chrono::Utc::now(),
        }
    }
}

/// Cluster membership tracker
pub struct ClusterMembership {
    /// This node's ID
    node_id: NodeId,
    /// All known nodes (including self)
    nodes: RwLock<HashMap<NodeId, NodeState>>,
}

impl ClusterMembership {
    /// Create a new membership containing only the local node
    pub fn new(node_id: NodeId, address: String) -> Self {
        let mut nodes = HashMap::new();
        let mut self_node = NodeState::new(node_id.clone(), address);
        self_node.status = NodeStatus::Active;
        nodes.insert(node_id.clone(), self_node);

        Self {
            node_id,
            nodes: RwLock::new(nodes),
        }
    }

    /// Build the membership from the node and peer configuration
    pub fn from_config(config: &NetStateConfig) -> Self {
        let mut nodes = HashMap::new();
        let local = NodeId::new(config.node.id.clone());
        let mut self_node = NodeState::new(local.clone(), config.advertise_address().to_string());
        self_node.status = NodeStatus::Active;
        nodes.insert(local.clone(), self_node);

        for peer in &config.cluster.peers {
            let id = NodeId::new(peer.id.clone());
            nodes.insert(id.clone(), NodeState::new(id, peer.address.clone()));
        }

        Self {
            node_id: local,
            nodes: RwLock::new(nodes),
        }
    }

    /// Get this node's ID
    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Add a peer node
    pub async fn add_peer(&self, id: NodeId, address: String) {
        let mut nodes = self.nodes.write().await;
        nodes
            .entry(id.clone())
            .or_insert_with(|| NodeState::new(id, address));
    }

    /// Remove a peer node
    pub async fn remove_peer(&self, id: &NodeId) -> Option<NodeState> {
        if id == &self.node_id {
            return None;
        }
        self.nodes.write().await.remove(id)
    }

    /// Get a node's state
    pub async fn get_node(&self, id: &NodeId) -> Option<NodeState> {
        self.nodes.read().await.get(id).cloned()
    }

    /// Resolve a node's cluster address
    pub async fn address_of(&self, id: &NodeId) -> Option<String> {
        self.nodes.read().await.get(id).map(|n| n.address.clone())
    }

    /// Update a node's status
    pub async fn set_status(&self, id: &NodeId, status: NodeStatus) {
        let mut nodes = self.nodes.write().await;
        if let Some(node) = nodes.get_mut(id) {
            if node.status != status {
                tracing::debug!("Node {} status {} -> {}", id, node.status, status);
                node.status = status;
            }
        }
    }

    /// Get all peer nodes (excluding self)
    pub async fn peers(&self) -> Vec<NodeState> {
        let nodes = self.nodes.read().await;
        let mut peers: Vec<NodeState> = nodes
            .values()
            .filter(|n| n.id != self.node_id)
            .cloned()
            .collect();
        peers.sort_by(|a, b| a.id.cmp(&b.id));
        peers
    }

    /// Pick one peer uniformly at random, never the local node
    pub async fn random_peer(&self) -> Option<NodeId> {
        let nodes = self.nodes.read().await;
        let candidates: Vec<&NodeId> = nodes.keys().filter(|id| **id != self.node_id).collect();
        candidates
            .choose(&mut rand::thread_rng())
            .map(|id| (*id).clone())
    }

    /// Get all nodes, including self
    pub async fn all_nodes(&self) -> Vec<NodeState> {
        self.nodes.read().await.values().cloned().collect()
    }

    /// Get the cluster size (total nodes)
    pub async fn size(&self) -> usize {
        self.nodes.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cluster_membership() {
        let cluster = ClusterMembership::new(NodeId::from("node-1"), "localhost:7654".to_string());

        cluster.add_peer(NodeId::from("node-2"), "localhost:7655".to_string()).await;
        cluster.add_peer(NodeId::from("node-3"), "localhost:7656".to_string()).await;

        assert_eq!(cluster.size().await, 3);
        assert_eq!(cluster.peers().await.len(), 2);
        assert_eq!(
            cluster.address_of(&NodeId::from("node-3")).await.as_deref(),
            Some("localhost:7656")
        );

        // the local node can never be removed
        assert!(cluster.remove_peer(&NodeId::from("node-1")).await.is_none());
        assert!(cluster.remove_peer(&NodeId::from("node-3")).await.is_some());
        assert_eq!(cluster.size().await, 2);
    }

    #[tokio::test]
    async fn test_random_peer_excludes_self() {
        let cluster = ClusterMembership::new(NodeId::from("node-1"), "localhost:7654".to_string());
        assert!(cluster.random_peer().await.is_none());

        cluster.add_peer(NodeId::from("node-2"), "localhost:7655".to_string()).await;
        for _ in 0..20 {
            assert_eq!(cluster.random_peer().await, Some(NodeId::from("node-2")));
        }
    }

    #[tokio::test]
    async fn test_status_updates() {
        let cluster = ClusterMembership::new(NodeId::from("node-1"), "localhost:7654".to_string());
        let peer = NodeId::from("node-2");
        cluster.add_peer(peer.clone(), "localhost:7655".to_string()).await;
        assert_eq!(cluster.get_node(&peer).await.unwrap().status, NodeStatus::Joining);

        cluster.set_status(&peer, NodeStatus::Offline).await;
        assert_eq!(cluster.get_node(&peer).await.unwrap().status, NodeStatus::Offline);
    }
}
