//! Cluster Communicator
//!
//! Point-to-point and broadcast messaging between controller nodes.

use async_trait::async_trait;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;

use super::client::NetworkClient;
use super::protocol::ClusterMessage;
use crate::cluster::{ClusterMembership, NodeId};
use crate::error::{Error, Result};

/// Messaging primitive used by the stores
#[async_trait]
pub trait ClusterCommunicator: Send + Sync {
    /// The node messages are sent from
    fn local_node(&self) -> &NodeId;

    /// Send a message to a single node
    async fn unicast(&self, message: ClusterMessage, to: &NodeId) -> Result<()>;

    /// Send a message to every other node. Per-peer failures are logged;
    /// the call only fails when the message cannot be sent at all.
    async fn broadcast(&self, message: ClusterMessage) -> Result<()>;
}

/// TCP implementation resolving node ids through the cluster membership
pub struct TcpCommunicator {
    local: NodeId,
    membership: Arc<ClusterMembership>,
    client: NetworkClient,
}

impl TcpCommunicator {
    pub fn new(membership: Arc<ClusterMembership>, connect_timeout: Duration) -> Self {
        Self {
            local: membership.node_id().clone(),
            membership,
            client: NetworkClient::new(connect_timeout, connect_timeout * 5),
        }
    }

    /// Drop pooled connections
    pub async fn close(&self) {
        self.client.close_all().await;
    }
}

#[async_trait]
impl ClusterCommunicator for TcpCommunicator {
    fn local_node(&self) -> &NodeId {
        &self.local
    }

    async fn unicast(&self, message: ClusterMessage, to: &NodeId) -> Result<()> {
        let address = self
            .membership
            .address_of(to)
            .await
            .ok_or_else(|| Error::NodeNotFound(to.to_string()))?;
        self.client.send(&address, &message).await
    }

    async fn broadcast(&self, message: ClusterMessage) -> Result<()> {
        let peers = self.membership.peers().await;
        let sends = peers.iter().map(|peer| self.client.send(&peer.address, &message));
        for (peer, result) in peers.iter().zip(join_all(sends).await) {
            if let Err(e) = result {
                tracing::debug!("Failed to send {} to {}: {}", message.subject, peer.id, e);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::subjects;

    #[tokio::test]
    async fn test_unicast_to_unknown_node() {
        let membership = Arc::new(ClusterMembership::new(
            NodeId::from("node-1"),
            "127.0.0.1:0".into(),
        ));
        let comm = TcpCommunicator::new(membership, Duration::from_millis(100));
        let msg = ClusterMessage::new(NodeId::from("node-1"), subjects::LINK_UPDATE, &0u8).unwrap();

        assert!(matches!(
            comm.unicast(msg, &NodeId::from("node-9")).await,
            Err(Error::NodeNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_broadcast_reaches_live_peers_despite_failures() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let live = listener.local_addr().unwrap().to_string();
        let closed = {
            let unused = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            unused.local_addr().unwrap().to_string()
        };

        let membership = Arc::new(ClusterMembership::new(NodeId::from("node-1"), "127.0.0.1:0".into()));
        membership.add_peer(NodeId::from("node-2"), closed).await;
        membership.add_peer(NodeId::from("node-3"), live).await;
        let comm = TcpCommunicator::new(membership, Duration::from_millis(200));

        let msg = ClusterMessage::new(NodeId::from("node-1"), subjects::LINK_REMOVED, &7u32).unwrap();
        comm.broadcast(msg).await.unwrap();

        let (mut stream, _) = listener.accept().await.unwrap();
        let received = crate::network::read_message(&mut stream).await.unwrap();
        assert_eq!(received.subject, subjects::LINK_REMOVED);
        assert_eq!(received.decode::<u32>().unwrap(), 7);
        comm.close().await;
    }
}
