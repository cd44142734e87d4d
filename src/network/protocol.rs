//! Cluster Wire Protocol
//!
//! Every message exchanged between controllers is a [`ClusterMessage`]
//! envelope: the sender, a subject used to route it to a handler, and a
//! bincode-encoded payload whose type is fixed by the subject.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::cluster::NodeId;
use crate::error::Result;

/// Message subjects used by the stores
pub mod subjects {
    /// Merged per-provider link fragment
    pub const LINK_UPDATE: &str = "link-update";
    /// Link removal with its tombstone timestamp
    pub const LINK_REMOVED: &str = "link-removed";
    /// Link anti-entropy digest
    pub const LINK_ANTI_ENTROPY_ADVERTISEMENT: &str = "link-anti-entropy-advertisement";
    /// Link description forwarded to the destination device's master
    pub const LINK_INJECTED: &str = "link-injected";
    /// Group operation forwarded to the device's master
    pub const GROUP_REMOTE_OP_REQUEST: &str = "group-remote-op-request";
    /// Group bucket failover notification, published to all nodes
    pub const GROUP_FAILOVER: &str = "group-failover";

    /// Subject carrying updates of an eventually consistent map
    pub fn ec_map_update(map: &str) -> String {
        format!("ecmap-{}-update", map)
    }

    /// Subject carrying anti-entropy digests of an eventually consistent map
    pub fn ec_map_anti_entropy(map: &str) -> String {
        format!("ecmap-{}-anti-entropy", map)
    }
}

/// Envelope for every cluster message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterMessage {
    /// Node that sent the message
    pub sender: NodeId,
    /// Routing subject
    pub subject: String,
    /// Encoded subject-specific payload
    pub payload: Vec<u8>,
}

impl ClusterMessage {
    /// Build a message by encoding the payload
    pub fn new<T: Serialize>(sender: NodeId, subject: impl Into<String>, payload: &T) -> Result<Self> {
        Ok(Self {
            sender,
            subject: subject.into(),
            payload: bincode::serialize(payload)?,
        })
    }

    /// Decode the payload
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(bincode::deserialize(&self.payload)?)
    }

    /// Serialize the envelope to bytes
    pub fn serialize(&self) -> std::result::Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize the envelope from bytes
    pub fn deserialize(bytes: &[u8]) -> std::result::Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

/// Frame header for length-prefixed messages
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    /// Message length
    pub length: u32,
    /// Message checksum
    pub checksum: u32,
}

impl FrameHeader {
    /// Header size in bytes
    pub const SIZE: usize = 8;

    /// Create a new frame header
    pub fn new(data: &[u8]) -> Self {
        Self {
            length: data.len() as u32,
            checksum: crc32fast::hash(data),
        }
    }

    /// Serialize header to bytes
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..4].copy_from_slice(&self.length.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.checksum.to_le_bytes());
        bytes
    }

    /// Deserialize header from bytes
    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        let [l0, l1, l2, l3, c0, c1, c2, c3] = *bytes;
        Self {
            length: u32::from_le_bytes([l0, l1, l2, l3]),
            checksum: u32::from_le_bytes([c0, c1, c2, c3]),
        }
    }
}
