//! Group Store
//!
//! Forwarding groups installed on devices. The source of truth is a
//! [`ConsistentMap`](crate::store::primitives::ConsistentMap) shared by the
//! cluster; writes for a device are applied by its master and every node
//! derives the same lifecycle events from the map's change stream.
//!
//! Lifecycle of an entry:
//!
//! ```text
//! WAITING_AUDIT_COMPLETE -> PENDING_ADD -> ADDED <-> PENDING_UPDATE
//! any state -> PENDING_DELETE -> (removed)
//! missing on device -> PENDING_ADD_RETRY
//! ```

pub mod audit;
pub mod messages;
pub mod store;

#[cfg(test)]
mod tests;

pub use store::{DistributedGroupStore, SharedGroupMaps};

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::cluster::DeviceId;
use crate::config::GroupConfig;
use crate::store::link::PortNumber;

/// Numeric group identifier, unique per device
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GroupId(pub u32);

impl GroupId {
    /// Placeholder id of requests queued until the device's first audit
    pub const UNALLOCATED: GroupId = GroupId(0xffff_ffff);
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

/// Application cookie identifying a group within a device
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GroupKey(pub String);

impl GroupKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for GroupKey {
    fn from(key: &str) -> Self {
        Self(key.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GroupType {
    All,
    Select,
    Indirect,
    Failover,
}

/// One action bucket of a group
///
/// Two buckets are equal when they would forward the same way: type,
/// treatment and liveness watches. Weight and statistics are not part of
/// the identity; [`GroupBucket::has_same_parameters`] compares the weight.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupBucket {
    pub bucket_type: GroupType,
    pub treatment: Vec<String>,
    pub weight: u16,
    pub watch_port: Option<PortNumber>,
    pub watch_group: Option<GroupId>,
    pub packets: u64,
    pub bytes: u64,
}

impl GroupBucket {
    pub fn new(bucket_type: GroupType, treatment: Vec<String>) -> Self {
        Self {
            bucket_type,
            treatment,
            weight: 1,
            watch_port: None,
            watch_group: None,
            packets: 0,
            bytes: 0,
        }
    }

    pub fn with_weight(mut self, weight: u16) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_watch(mut self, port: Option<PortNumber>, group: Option<GroupId>) -> Self {
        self.watch_port = port;
        self.watch_group = group;
        self
    }

    pub fn has_same_parameters(&self, other: &GroupBucket) -> bool {
        self.weight == other.weight && self.watch_port == other.watch_port && self.watch_group == other.watch_group
    }
}

impl PartialEq for GroupBucket {
    fn eq(&self, other: &Self) -> bool {
        self.bucket_type == other.bucket_type
            && self.treatment == other.treatment
            && self.watch_port == other.watch_port
            && self.watch_group == other.watch_group
    }
}

impl Eq for GroupBucket {}

/// Whether two bucket lists are identical, parameters included
pub(crate) fn same_buckets(a: &[GroupBucket], b: &[GroupBucket]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x == y && x.has_same_parameters(y))
}

/// What an application asks to install on a device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupDescription {
    pub device: DeviceId,
    pub group_type: GroupType,
    pub buckets: Vec<GroupBucket>,
    pub app_cookie: GroupKey,
    pub given_group_id: Option<GroupId>,
    pub app_id: String,
}

impl GroupDescription {
    pub fn new(
        device: impl Into<String>,
        group_type: GroupType,
        buckets: Vec<GroupBucket>,
        app_cookie: impl Into<String>,
        app_id: impl Into<String>,
    ) -> Self {
        Self {
            device: DeviceId::new(device),
            group_type,
            buckets,
            app_cookie: GroupKey::new(app_cookie),
            given_group_id: None,
            app_id: app_id.into(),
        }
    }

    pub fn with_group_id(mut self, id: GroupId) -> Self {
        self.given_group_id = Some(id);
        self
    }

    pub fn key(&self) -> GroupStoreKey {
        GroupStoreKey::new(self.device.clone(), self.app_cookie.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GroupState {
    WaitingAuditComplete,
    PendingAdd,
    Added,
    PendingUpdate,
    PendingDelete,
    PendingAddRetry,
}

/// A group entry: a description with its allocated id, lifecycle state and
/// the latest statistics reported by the device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub id: GroupId,
    pub description: GroupDescription,
    pub state: GroupState,
    pub life: u64,
    pub packets: u64,
    pub bytes: u64,
    pub reference_count: u64,
    /// Audit rounds observed in a row with no references
    pub age: u32,
    /// Set when the entry last reached ADDED from an add request
    pub first_time: bool,
}

impl Group {
    pub fn new(id: GroupId, description: GroupDescription) -> Self {
        Self {
            id,
            description,
            state: GroupState::PendingAdd,
            life: 0,
            packets: 0,
            bytes: 0,
            reference_count: 0,
            age: 0,
            first_time: false,
        }
    }

    pub fn device(&self) -> &DeviceId {
        &self.description.device
    }

    pub fn group_type(&self) -> GroupType {
        self.description.group_type
    }

    pub fn buckets(&self) -> &[GroupBucket] {
        &self.description.buckets
    }

    pub fn app_cookie(&self) -> &GroupKey {
        &self.description.app_cookie
    }

    pub fn key(&self) -> GroupStoreKey {
        self.description.key()
    }

    /// Whether the device holds the same group: same id, type and buckets
    pub fn matches(&self, other: &Group) -> bool {
        self.device() == other.device()
            && self.id == other.id
            && self.group_type() == other.group_type()
            && self.buckets() == other.buckets()
    }

    pub fn set_reference_count(&mut self, reference_count: u64) {
        self.reference_count = reference_count;
        if reference_count == 0 {
            self.age = self.age.saturating_add(1);
        } else {
            self.age = 0;
        }
    }
}

impl fmt::Display for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} ({}, {:?})",
            self.device(),
            self.id,
            self.app_cookie(),
            self.state
        )
    }
}

/// Primary key of the group store
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GroupStoreKey {
    pub device: DeviceId,
    pub app_cookie: GroupKey,
}

impl GroupStoreKey {
    pub fn new(device: DeviceId, app_cookie: GroupKey) -> Self {
        Self { device, app_cookie }
    }
}

impl fmt::Display for GroupStoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.device, self.app_cookie)
    }
}

/// How an update combines new buckets with the existing ones
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateType {
    /// Replace the bucket list
    Set,
    /// Merge into the bucket list
    Add,
    /// Drop matching buckets
    Remove,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupEventType {
    GroupAddRequested,
    GroupAdded,
    GroupAddFailed,
    GroupUpdateRequested,
    GroupUpdated,
    GroupUpdateFailed,
    GroupRemoveRequested,
    GroupRemoved,
    GroupRemoveFailed,
    GroupBucketFailover,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupEvent {
    pub event_type: GroupEventType,
    pub group: Group,
}

impl GroupEvent {
    pub fn new(event_type: GroupEventType, group: Group) -> Self {
        Self { event_type, group }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupOperationType {
    Add,
    Modify,
    Delete,
}

/// Error reported by a device for a group operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupMsgErrorCode {
    GroupExists,
    InvalidGroup,
    UnknownGroup,
    OutOfGroups,
    OutOfBuckets,
    Other,
}

/// A southbound group operation, as reported back on failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupOperation {
    pub op_type: GroupOperationType,
    pub group_id: GroupId,
    pub group_type: GroupType,
    pub buckets: Vec<GroupBucket>,
    pub failure_code: Option<GroupMsgErrorCode>,
}

/// Runtime-adjustable audit policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupPolicy {
    pub garbage_collect: bool,
    pub gc_thresh: u32,
    pub allow_extraneous_groups: bool,
}

impl From<&GroupConfig> for GroupPolicy {
    fn from(config: &GroupConfig) -> Self {
        Self {
            garbage_collect: config.garbage_collect,
            gc_thresh: config.gc_thresh,
            allow_extraneous_groups: config.allow_extraneous_groups,
        }
    }
}

impl Default for GroupPolicy {
    fn default() -> Self {
        Self::from(&GroupConfig::default())
    }
}
