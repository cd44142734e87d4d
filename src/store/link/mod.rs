//! Link Store
//!
//! Infrastructure links between devices, merged from several provider
//! feeds. Two interchangeable backends implement [`LinkStore`]:
//! [`GossipLinkStore`] replicates description fragments by peer-to-peer
//! gossip with anti-entropy, [`EcLinkStore`] delegates replication to an
//! [`EventuallyConsistentMap`](crate::store::primitives::EventuallyConsistentMap).
//!
//! Writes for a link are applied by the master of its destination device;
//! other nodes forward them there.

pub mod cache;
pub mod ec;
pub mod gossip;
pub mod merge;
pub mod messages;


pub use cache::LinkCache;
pub use ec::EcLinkStore;
pub use gossip::GossipLinkStore;
pub use merge::DescriptionMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::cluster::DeviceId;
use crate::error::Result;
use crate::store::StoreDelegate;

/// Annotation marking a link as durable
pub const DURABLE: &str = "durable";

/// Port number on a device
pub type PortNumber = u64;

/// Free-form key/value annotations
pub type Annotations = BTreeMap<String, String>;

/// A port on a device
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ConnectPoint {
    pub device: DeviceId,
    pub port: PortNumber,
}

impl ConnectPoint {
    pub fn new(device: impl Into<String>, port: PortNumber) -> Self {
        Self {
            device: DeviceId::new(device),
            port,
        }
    }
}

impl fmt::Display for ConnectPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.device, self.port)
    }
}

/// Identity of a link: its two endpoints
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LinkKey {
    pub src: ConnectPoint,
    pub dst: ConnectPoint,
}

impl LinkKey {
    pub fn new(src: ConnectPoint, dst: ConnectPoint) -> Self {
        Self { src, dst }
    }
}

impl fmt::Display for LinkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.src, self.dst)
    }
}

/// How a link was discovered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LinkType {
    /// Direct adjacency between two ports
    Direct,
    /// Adjacency inferred across an unmanaged segment
    Indirect,
    /// Configured optical or tunnel links
    Optical,
    Tunnel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LinkState {
    Active,
    Inactive,
}

/// Whether links start usable or require prior expectation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscoveryMode {
    /// Discovered links are active immediately
    #[default]
    Permissive,
    /// Only links described as expected become active
    Strict,
}

/// Replication substrate behind the link store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LinkBackend {
    #[default]
    Gossip,
    EventuallyConsistent,
}

/// Source of link information
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProviderId {
    pub scheme: String,
    pub id: String,
    /// Ancillary providers only contribute annotations
    pub ancillary: bool,
}

impl ProviderId {
    pub fn new(scheme: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            scheme: scheme.into(),
            id: id.into(),
            ancillary: false,
        }
    }

    pub fn ancillary(scheme: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            ancillary: true,
            ..Self::new(scheme, id)
        }
    }

    pub fn is_ancillary(&self) -> bool {
        self.ancillary
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.scheme, self.id)
    }
}

/// A provider's declaration of one link
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkDescription {
    pub src: ConnectPoint,
    pub dst: ConnectPoint,
    pub link_type: LinkType,
    /// Whether the link is expected to exist (matters in strict mode)
    pub is_expected: bool,
    pub annotations: Annotations,
}

impl LinkDescription {
    pub fn new(src: ConnectPoint, dst: ConnectPoint, link_type: LinkType) -> Self {
        Self {
            src,
            dst,
            link_type,
            is_expected: false,
            annotations: Annotations::new(),
        }
    }

    pub fn expected(mut self, is_expected: bool) -> Self {
        self.is_expected = is_expected;
        self
    }

    pub fn annotate(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }

    pub fn key(&self) -> LinkKey {
        LinkKey::new(self.src.clone(), self.dst.clone())
    }
}

/// Merged, cached view of a link
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    /// Provider whose description supplied the base fields
    pub provider: ProviderId,
    pub src: ConnectPoint,
    pub dst: ConnectPoint,
    pub link_type: LinkType,
    pub state: LinkState,
    pub is_durable: bool,
    pub is_expected: bool,
    pub annotations: Annotations,
}

impl Link {
    pub fn key(&self) -> LinkKey {
        LinkKey::new(self.src.clone(), self.dst.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEventType {
    LinkAdded,
    LinkUpdated,
    LinkRemoved,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkEvent {
    pub event_type: LinkEventType,
    pub link: Link,
}

impl LinkEvent {
    pub fn new(event_type: LinkEventType, link: Link) -> Self {
        Self { event_type, link }
    }
}

/// Link store contract shared by both backends.
///
/// Mutations return the event they caused on this node (stale or no-op
/// input yields `Ok(None)`). A mutation forwarded to another node's master
/// also returns `Ok(None)`; its effect arrives later through the delegate.
#[async_trait]
pub trait LinkStore: Send + Sync {
    /// Merge a provider's description of a link
    async fn create_or_update_link(
        &self,
        provider: &ProviderId,
        description: LinkDescription,
    ) -> Result<Option<LinkEvent>>;

    /// Remove a link everywhere
    async fn remove_link(&self, src: &ConnectPoint, dst: &ConnectPoint) -> Result<Option<LinkEvent>>;

    /// Deactivate a durable or expected link, remove any other
    async fn remove_or_down_link(&self, src: &ConnectPoint, dst: &ConnectPoint) -> Result<Option<LinkEvent>>;

    fn link(&self, src: &ConnectPoint, dst: &ConnectPoint) -> Option<Link>;

    fn links(&self) -> Vec<Link>;

    fn link_count(&self) -> usize;

    fn egress_links(&self, src: &ConnectPoint) -> Vec<Link>;

    fn ingress_links(&self, dst: &ConnectPoint) -> Vec<Link>;

    fn device_egress_links(&self, device: &DeviceId) -> Vec<Link>;

    fn device_ingress_links(&self, device: &DeviceId) -> Vec<Link>;

    fn discovery_mode(&self) -> DiscoveryMode;

    /// Switch discovery mode, discarding derived state so links are
    /// rediscovered under the new policy
    fn set_discovery_mode(&self, mode: DiscoveryMode);

    fn set_delegate(&self, delegate: Arc<dyn StoreDelegate<LinkEvent>>);

    /// Clear all replicated and derived state
    async fn shutdown(&self);
}
