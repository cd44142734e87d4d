//! NetState - Replicated Network State Stores
//!
//! The replicated state layer of a multi-node network controller. Every
//! controller observes the network through its own provider feeds; the
//! stores in this crate merge those observations and keep them consistent
//! across the cluster.
//!
//! # Architecture
//!
//! - **Link store**: per-provider link descriptions merged by logical
//!   timestamp, replicated by gossip with periodic anti-entropy (or by an
//!   eventually consistent map), with tombstones so deletes win over stale
//!   re-creation.
//! - **Group store**: forwarding groups kept in a strongly consistent map,
//!   written only by the owning device's master and reconciled against the
//!   groups each device reports.
//!
//! Writes for a device are applied by its master. Other nodes forward them
//! through the [`MastershipRouter`](store::MastershipRouter).

pub mod cluster;
pub mod config;
pub mod error;
pub mod network;
pub mod node;
pub mod store;

#[cfg(test)]
mod testing;

pub use config::NetStateConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::cluster::{DeviceId, NodeId};
    pub use crate::config::NetStateConfig;
    pub use crate::error::{Error, Result};
    pub use crate::node::ControllerNode;
    pub use crate::store::group::{DistributedGroupStore, GroupDescription, GroupEvent};
    pub use crate::store::link::{LinkDescription, LinkEvent, LinkStore, ProviderId};
}
