//! In-process cluster harness for tests
//!
//! Builds N nodes on one [`LocalHub`] sharing a [`MastershipTable`].
//! Messages stay queued until [`TestCluster::deliver`] pumps them through
//! each destination node's dispatcher, so tests control loss and ordering.

use std::sync::Arc;

use crate::cluster::{ClusterMembership, DeviceClockService, DeviceId, MastershipService, MastershipTable, NodeId};
use crate::network::{Envelope, LocalCommunicator, LocalHub, MessageDispatcher};
use crate::store::MastershipRouter;

pub struct TestNode {
    pub id: NodeId,
    pub communicator: Arc<LocalCommunicator>,
    pub membership: Arc<ClusterMembership>,
    pub mastership: Arc<dyn MastershipService>,
    pub clock: Arc<DeviceClockService>,
    pub dispatcher: Arc<MessageDispatcher>,
}

impl TestNode {
    pub fn router(&self) -> MastershipRouter {
        MastershipRouter::new(self.communicator.clone(), Arc::clone(&self.mastership))
    }
}

pub struct TestCluster {
    pub hub: Arc<LocalHub>,
    pub mastership: Arc<MastershipTable>,
    pub nodes: Vec<TestNode>,
}

impl TestCluster {
    /// Nodes are named `node-1` .. `node-N`
    pub async fn new(size: usize) -> Self {
        let hub = LocalHub::new();
        let mastership = MastershipTable::new();
        let ids: Vec<NodeId> = (1..=size).map(|i| NodeId::new(format!("node-{}", i))).collect();

        let mut nodes = Vec::with_capacity(size);
        for id in &ids {
            let membership = Arc::new(ClusterMembership::new(id.clone(), String::new()));
            for peer in ids.iter().filter(|peer| *peer != id) {
                membership.add_peer(peer.clone(), String::new()).await;
            }
            let view = mastership.view(id.clone());
            nodes.push(TestNode {
                id: id.clone(),
                communicator: hub.communicator(id.clone()),
                membership,
                clock: Arc::new(DeviceClockService::new(Arc::clone(&view))),
                mastership: view,
                dispatcher: MessageDispatcher::new(),
            });
        }

        Self {
            hub,
            mastership,
            nodes,
        }
    }

    pub fn node(&self, index: usize) -> &TestNode {
        &self.nodes[index]
    }

    /// Make the node at `index` master of `device`, returning the new term
    pub fn set_master(&self, device: &str, index: usize) -> u64 {
        self.mastership
            .set_master(&DeviceId::from(device), &self.nodes[index].id)
    }

    pub fn clear_master(&self, device: &str) {
        self.mastership.clear_master(&DeviceId::from(device));
    }

    /// Deliver queued messages, including the ones sent while delivering,
    /// until the hub is empty. Returns the number delivered.
    pub async fn deliver(&self) -> usize {
        let mut delivered = 0;
        while let Some(envelope) = self.hub.take() {
            self.deliver_one(envelope).await;
            delivered += 1;
        }
        delivered
    }

    /// Discard every queued message
    pub fn drop_pending(&self) -> usize {
        self.hub.drain().len()
    }

    async fn deliver_one(&self, envelope: Envelope) {
        match self.nodes.iter().find(|n| n.id == envelope.to) {
            Some(node) => node.dispatcher.dispatch(envelope.message).await,
            None => tracing::debug!("No test node {}", envelope.to),
        }
    }
}
