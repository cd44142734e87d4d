//! Link replication payloads

use serde::{Deserialize, Serialize};

use super::{LinkDescription, LinkKey, ProviderId};
use crate::cluster::NodeId;
use crate::store::timestamp::{Timestamp, Timestamped};

/// One provider's merged description of a link
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InternalLinkEvent {
    pub provider: ProviderId,
    pub description: Timestamped<LinkDescription>,
}

/// Removal of a link, carrying its tombstone timestamp
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InternalLinkRemovedEvent {
    pub key: LinkKey,
    pub timestamp: Timestamp,
}

/// Untimestamped description forwarded to the destination device's master
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkInjectedEvent {
    pub provider: ProviderId,
    pub description: LinkDescription,
}

/// Identity of one provider's fragment of a link
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LinkFragmentId {
    pub key: LinkKey,
    pub provider: ProviderId,
}

/// Anti-entropy digest: fragment timestamps plus tombstones
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkAntiEntropyAdvertisement {
    pub sender: NodeId,
    pub fragments: Vec<(LinkFragmentId, Timestamp)>,
    pub tombstones: Vec<(LinkKey, Timestamp)>,
}
