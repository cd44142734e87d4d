//! Controller Node
//!
//! Wires one controller from its configuration: TCP transport, inbound
//! dispatcher, mastership view and clock, the link store selected by
//! `link.backend`, the group store and the link anti-entropy task.

use parking_lot::Mutex;
use std::fmt::Debug;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::cluster::{ClusterMembership, DeviceClockService, MastershipService, MastershipTable, NodeId};
use crate::config::{LinkConfig, NetStateConfig};
use crate::error::Result;
use crate::network::{ClusterCommunicator, ClusterMessage, MessageDispatcher, NetworkServer, TcpCommunicator};
use crate::store::group::{DistributedGroupStore, GroupPolicy, SharedGroupMaps};
use crate::store::link::{EcLinkStore, GossipLinkStore, LinkBackend, LinkStore};
use crate::store::{AntiEntropy, AntiEntropyScheduler, MastershipRouter, StoreDelegate};

/// Delegate that reports store events in the log
pub struct LoggingDelegate {
    store: &'static str,
}

impl LoggingDelegate {
    pub fn new(store: &'static str) -> Arc<Self> {
        Arc::new(Self { store })
    }
}

impl<E: Debug + Send> StoreDelegate<E> for LoggingDelegate {
    fn notify(&self, event: E) {
        tracing::info!("{} event: {:?}", self.store, event);
    }
}

/// The concrete link backend, for registration and anti-entropy
enum LinkHandle {
    Gossip(Arc<GossipLinkStore>),
    EventuallyConsistent(Arc<EcLinkStore>),
}

impl LinkHandle {
    fn build(
        config: &LinkConfig,
        router: MastershipRouter,
        clock: Arc<DeviceClockService>,
        membership: Arc<ClusterMembership>,
    ) -> Self {
        match config.backend {
            LinkBackend::Gossip => {
                LinkHandle::Gossip(GossipLinkStore::new(router, clock, membership, config.discovery_mode))
            }
            LinkBackend::EventuallyConsistent => LinkHandle::EventuallyConsistent(EcLinkStore::new(
                router,
                clock,
                membership,
                config.discovery_mode,
            )),
        }
    }

    fn store(&self) -> Arc<dyn LinkStore> {
        match self {
            LinkHandle::Gossip(store) => Arc::clone(store) as Arc<dyn LinkStore>,
            LinkHandle::EventuallyConsistent(store) => Arc::clone(store) as Arc<dyn LinkStore>,
        }
    }

    fn anti_entropy(&self) -> Arc<dyn AntiEntropy> {
        match self {
            LinkHandle::Gossip(store) => Arc::clone(store) as Arc<dyn AntiEntropy>,
            LinkHandle::EventuallyConsistent(store) => store.anti_entropy(),
        }
    }

    fn register(&self, dispatcher: &MessageDispatcher) {
        match self {
            LinkHandle::Gossip(store) => store.register(dispatcher),
            LinkHandle::EventuallyConsistent(store) => store.register(dispatcher),
        }
    }

    fn unregister(&self, dispatcher: &MessageDispatcher) {
        match self {
            LinkHandle::Gossip(store) => store.unregister(dispatcher),
            LinkHandle::EventuallyConsistent(store) => store.unregister(dispatcher),
        }
    }
}

/// A running controller node
pub struct ControllerNode {
    config: NetStateConfig,
    membership: Arc<ClusterMembership>,
    mastership: Arc<MastershipTable>,
    communicator: Arc<TcpCommunicator>,
    dispatcher: Arc<MessageDispatcher>,
    server: Arc<NetworkServer>,
    inbound: Mutex<Option<mpsc::Receiver<ClusterMessage>>>,
    links: LinkHandle,
    groups: Arc<DistributedGroupStore>,
    scheduler: Mutex<Option<AntiEntropyScheduler>>,
    server_task: Mutex<Option<JoinHandle<()>>>,
}

impl ControllerNode {
    /// Build a node from configuration. Nothing runs until [`ControllerNode::start`].
    pub fn new(config: NetStateConfig) -> Self {
        Self::with_group_maps(config, SharedGroupMaps::in_memory())
    }

    /// Build a node whose group store uses the given shared maps
    pub fn with_group_maps(config: NetStateConfig, group_maps: SharedGroupMaps) -> Self {
        let local = NodeId::new(config.node.id.clone());
        let membership = Arc::new(ClusterMembership::from_config(&config));
        let mastership = MastershipTable::from_entries(&config.mastership);
        let view: Arc<dyn MastershipService> = mastership.view(local);
        let communicator = Arc::new(TcpCommunicator::new(Arc::clone(&membership), config.connect_timeout()));
        let clock = Arc::new(DeviceClockService::new(Arc::clone(&view)));

        let router = || {
            MastershipRouter::new(
                Arc::clone(&communicator) as Arc<dyn ClusterCommunicator>,
                Arc::clone(&view),
            )
        };
        let links = LinkHandle::build(&config.link, router(), clock, Arc::clone(&membership));
        let groups = DistributedGroupStore::new(router(), group_maps, GroupPolicy::from(&config.group));

        let (inbound_tx, inbound_rx) = mpsc::channel(config.cluster.inbound_queue_size.max(1));
        let server = Arc::new(NetworkServer::new(config.node.bind_address.clone(), inbound_tx));

        Self {
            config,
            membership,
            mastership,
            communicator,
            dispatcher: MessageDispatcher::new(),
            server,
            inbound: Mutex::new(Some(inbound_rx)),
            links,
            groups,
            scheduler: Mutex::new(None),
            server_task: Mutex::new(None),
        }
    }

    pub fn node_id(&self) -> &NodeId {
        self.membership.node_id()
    }

    pub fn membership(&self) -> &Arc<ClusterMembership> {
        &self.membership
    }

    /// Device mastership as seen by this process
    pub fn mastership(&self) -> &Arc<MastershipTable> {
        &self.mastership
    }

    pub fn link_store(&self) -> Arc<dyn LinkStore> {
        self.links.store()
    }

    pub fn group_store(&self) -> &Arc<DistributedGroupStore> {
        &self.groups
    }

    /// Bind the transport, start message handling and anti-entropy
    pub async fn start(&self) -> Result<()> {
        let listener = self.server.bind().await?;
        let server = Arc::clone(&self.server);
        *self.server_task.lock() = Some(tokio::spawn(async move {
            if let Err(e) = server.serve(listener).await {
                tracing::error!("Network server error: {}", e);
            }
        }));

        self.links.register(&self.dispatcher);
        self.groups.register(&self.dispatcher);
        if let Some(inbound) = self.inbound.lock().take() {
            self.dispatcher.start(
                inbound,
                self.config.cluster.message_handler_threads,
                self.config.cluster.inbound_queue_size,
            );
        }

        *self.scheduler.lock() = Some(AntiEntropyScheduler::start(
            self.links.anti_entropy(),
            self.config.anti_entropy_initial_delay(),
            self.config.anti_entropy_period(),
        ));

        tracing::info!(
            "Node {} started: {:?} link store, {} peers",
            self.node_id(),
            self.config.link.backend,
            self.config.cluster.peers.len()
        );
        Ok(())
    }

    /// Orderly shutdown: stop anti-entropy, detach the stores, drain the
    /// dispatcher, then close the transport
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down node {}", self.node_id());

        let scheduler = self.scheduler.lock().take();
        if let Some(scheduler) = scheduler {
            scheduler.stop().await;
        }

        self.links.unregister(&self.dispatcher);
        self.groups.unregister(&self.dispatcher);
        self.links.store().shutdown().await;
        self.groups.shutdown();

        self.dispatcher.shutdown().await;
        self.server.stop();
        let server_task = self.server_task.lock().take();
        if let Some(task) = server_task {
            if let Err(e) = task.await {
                tracing::warn!("Network server task failed: {}", e);
            }
        }
        self.communicator.close().await;

        tracing::info!("Node {} stopped", self.node_id());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::DeviceId;
    use crate::store::link::{ConnectPoint, LinkDescription, LinkEventType, LinkType, ProviderId};

    fn config(backend: &str) -> NetStateConfig {
        NetStateConfig::from_str(&format!(
            r#"
[node]
id = "node-1"
bind_address = "127.0.0.1:0"

[[mastership]]
device = "of:2"
master = "node-1"

[link]
backend = "{}"
"#,
            backend
        ))
        .unwrap()
    }

    #[tokio::test]
    async fn test_start_write_and_shutdown() {
        for backend in ["gossip", "eventually-consistent"] {
            let node = ControllerNode::new(config(backend));
            node.start().await.unwrap();

            let description = LinkDescription::new(
                ConnectPoint::new("of:1", 1),
                ConnectPoint::new("of:2", 1),
                LinkType::Direct,
            );
            let event = node
                .link_store()
                .create_or_update_link(&ProviderId::new("lldp", "core"), description)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(event.event_type, LinkEventType::LinkAdded);
            assert!(node.mastership().master(&DeviceId::from("of:2")).is_some());

            node.shutdown().await;
            assert_eq!(node.link_store().link_count(), 0);
        }
    }

    #[tokio::test]
    async fn test_logging_delegate_accepts_events() {
        let node = ControllerNode::new(config("gossip"));
        node.link_store().set_delegate(LoggingDelegate::new("link"));
        node.group_store().set_delegate(LoggingDelegate::new("group"));
        assert_eq!(node.node_id(), &NodeId::from("node-1"));
        assert!(node.membership().peers().await.is_empty());
    }
}
