//! Group store messages
//!
//! Operations forwarded to a device's master on
//! [`GROUP_REMOTE_OP_REQUEST`](crate::network::subjects::GROUP_REMOTE_OP_REQUEST),
//! and failover notices published on
//! [`GROUP_FAILOVER`](crate::network::subjects::GROUP_FAILOVER).

use serde::{Deserialize, Serialize};

use super::{Group, GroupBucket, GroupDescription, GroupKey, UpdateType};
use crate::cluster::DeviceId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupStoreMessage {
    Add {
        description: GroupDescription,
    },
    Update {
        device: DeviceId,
        app_cookie: GroupKey,
        update_type: UpdateType,
        buckets: Vec<GroupBucket>,
        new_app_cookie: Option<GroupKey>,
    },
    Delete {
        device: DeviceId,
        app_cookie: GroupKey,
    },
    Failover {
        device: DeviceId,
        group: Group,
    },
}

impl GroupStoreMessage {
    pub fn device(&self) -> &DeviceId {
        match self {
            GroupStoreMessage::Add { description } => &description.device,
            GroupStoreMessage::Update { device, .. }
            | GroupStoreMessage::Delete { device, .. }
            | GroupStoreMessage::Failover { device, .. } => device,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            GroupStoreMessage::Add { .. } => "group add",
            GroupStoreMessage::Update { .. } => "group update",
            GroupStoreMessage::Delete { .. } => "group delete",
            GroupStoreMessage::Failover { .. } => "group failover",
        }
    }
}
