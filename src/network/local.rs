//! In-process Transport
//!
//! [`LocalHub`] connects several nodes living in the same process. Sent
//! messages are queued on the hub and delivered only when the owner pulls
//! them, which makes delivery order, loss and duplication fully
//! controllable by simulations and tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::communicator::ClusterCommunicator;
use super::protocol::ClusterMessage;
use crate::cluster::NodeId;
use crate::error::{Error, Result};

/// A message waiting for delivery
#[derive(Debug, Clone)]
pub struct Envelope {
    /// Destination node
    pub to: NodeId,
    /// The message itself
    pub message: ClusterMessage,
}

/// Shared message queue for in-process nodes
#[derive(Default)]
pub struct LocalHub {
    nodes: Mutex<Vec<NodeId>>,
    queue: Mutex<VecDeque<Envelope>>,
    dropping: AtomicBool,
    unreachable: Mutex<HashSet<NodeId>>,
}

impl LocalHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a node and return its communicator
    pub fn communicator(self: &Arc<Self>, node: NodeId) -> Arc<LocalCommunicator> {
        {
            let mut nodes = self.nodes.lock();
            if !nodes.contains(&node) {
                nodes.push(node.clone());
            }
        }
        Arc::new(LocalCommunicator {
            local: node,
            hub: Arc::clone(self),
        })
    }

    /// Silently discard every message sent while enabled
    pub fn set_dropping(&self, dropping: bool) {
        self.dropping.store(dropping, Ordering::SeqCst);
    }

    /// Make unicasts to a node fail with a transport error
    pub fn set_unreachable(&self, node: &NodeId, unreachable: bool) {
        let mut set = self.unreachable.lock();
        if unreachable {
            set.insert(node.clone());
        } else {
            set.remove(node);
        }
    }

    /// Pop the oldest queued message
    pub fn take(&self) -> Option<Envelope> {
        self.queue.lock().pop_front()
    }

    /// Remove and return every queued message
    pub fn drain(&self) -> Vec<Envelope> {
        self.queue.lock().drain(..).collect()
    }

    /// Discard every queued message
    pub fn clear(&self) {
        self.queue.lock().clear();
    }

    /// Number of queued messages
    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    fn enqueue(&self, to: NodeId, message: ClusterMessage) {
        if self.dropping.load(Ordering::SeqCst) {
            tracing::trace!("Dropping {} to {}", message.subject, to);
            return;
        }
        self.queue.lock().push_back(Envelope { to, message });
    }
}

/// Communicator of one node attached to a [`LocalHub`]
pub struct LocalCommunicator {
    local: NodeId,
    hub: Arc<LocalHub>,
}

#[async_trait]
impl ClusterCommunicator for LocalCommunicator {
    fn local_node(&self) -> &NodeId {
        &self.local
    }

    async fn unicast(&self, message: ClusterMessage, to: &NodeId) -> Result<()> {
        if self.hub.unreachable.lock().contains(to) {
            return Err(Error::ConnectionFailed {
                address: to.to_string(),
                reason: "unreachable".into(),
            });
        }
        if !self.hub.nodes.lock().contains(to) {
            return Err(Error::NodeNotFound(to.to_string()));
        }
        self.hub.enqueue(to.clone(), message);
        Ok(())
    }

    async fn broadcast(&self, message: ClusterMessage) -> Result<()> {
        let peers: Vec<NodeId> = self
            .hub
            .nodes
            .lock()
            .iter()
            .filter(|n| **n != self.local)
            .cloned()
            .collect();
        for peer in peers {
            self.hub.enqueue(peer, message.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::subjects;

    fn msg(from: &str) -> ClusterMessage {
        ClusterMessage::new(NodeId::from(from), subjects::LINK_UPDATE, &1u8).unwrap()
    }

    #[tokio::test]
    async fn test_broadcast_excludes_sender() {
        let hub = LocalHub::new();
        let c1 = hub.communicator(NodeId::from("node-1"));
        hub.communicator(NodeId::from("node-2"));
        hub.communicator(NodeId::from("node-3"));

        c1.broadcast(msg("node-1")).await.unwrap();
        let targets: Vec<NodeId> = hub.drain().into_iter().map(|e| e.to).collect();
        assert_eq!(targets, vec![NodeId::from("node-2"), NodeId::from("node-3")]);
    }

    #[tokio::test]
    async fn test_dropping_and_unreachable() {
        let hub = LocalHub::new();
        let c1 = hub.communicator(NodeId::from("node-1"));
        let n2 = NodeId::from("node-2");
        hub.communicator(n2.clone());

        hub.set_dropping(true);
        c1.unicast(msg("node-1"), &n2).await.unwrap();
        assert_eq!(hub.pending(), 0);
        hub.set_dropping(false);

        hub.set_unreachable(&n2, true);
        assert!(c1.unicast(msg("node-1"), &n2).await.is_err());
        hub.set_unreachable(&n2, false);

        c1.unicast(msg("node-1"), &n2).await.unwrap();
        assert_eq!(hub.take().map(|e| e.to), Some(n2));
        assert!(c1.unicast(msg("node-1"), &NodeId::from("node-9")).await.is_err());
    }
}
