//! Distributed Group Store
//!
//! Group entries live in a cluster-wide [`ConsistentMap`] keyed by
//! `(device, app cookie)`. Only the device's master mutates a device's
//! entries; other nodes forward their requests to it. Every node keeps a
//! local id index fed by the map's listener and raises ADDED, UPDATED and
//! REMOVED from the same change stream, so all nodes report the same
//! lifecycle. Request and failure events are raised by the master only.
//!
//! Work for one device is serialized by a striped device lock. Methods
//! suffixed `_locked` expect the caller to hold it.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{MutexGuard, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use super::messages::GroupStoreMessage;
use super::{
    same_buckets, Group, GroupBucket, GroupDescription, GroupEvent, GroupEventType, GroupId, GroupKey,
    GroupMsgErrorCode, GroupOperation, GroupOperationType, GroupPolicy, GroupState, GroupStoreKey, GroupType,
    UpdateType,
};
use crate::cluster::DeviceId;
use crate::error::{Error, Result};
use crate::network::{subjects, ClusterMessage, MessageDispatcher, MessageHandler};
use crate::store::primitives::{
    ConsistentMap, InMemoryConsistentMap, ListenerId, MapEvent, MapEventListener, MapEventType, StripedLock,
};
use crate::store::router::{MastershipRouter, Route};
use crate::store::{DelegateSlot, StoreDelegate};

/// Cluster-wide state of the group store
///
/// Every node's store must be built from clones of the same value.
#[derive(Clone)]
pub struct SharedGroupMaps {
    /// Live entries by `(device, app cookie)`
    pub entries: Arc<dyn ConsistentMap<GroupStoreKey, Group>>,
    /// Requests queued until their device's first audit completes
    pub pending: Arc<dyn ConsistentMap<GroupStoreKey, Group>>,
    /// Group id generator
    pub id_generator: Arc<AtomicU32>,
}

impl SharedGroupMaps {
    pub fn in_memory() -> Self {
        Self {
            entries: InMemoryConsistentMap::new("group-store-keymap"),
            pending: InMemoryConsistentMap::new("pending-group-keymap"),
            id_generator: Arc::new(AtomicU32::new(0)),
        }
    }
}

impl Default for SharedGroupMaps {
    fn default() -> Self {
        Self::in_memory()
    }
}

/// Id index and delegate, fed by the entry map's listener
struct GroupView {
    by_id: DashMap<DeviceId, HashMap<GroupId, GroupKey>>,
    delegate: DelegateSlot<GroupEvent>,
}

impl GroupView {
    fn index(&self, group: &Group) {
        self.by_id
            .entry(group.device().clone())
            .or_default()
            .insert(group.id, group.app_cookie().clone());
    }

    /// Drop the id of a removed entry unless another key took it over
    fn unindex(&self, group: &Group) -> bool {
        let unindexed = match self.by_id.get_mut(group.device()) {
            Some(mut ids) => match ids.get(&group.id) {
                Some(cookie) if cookie != group.app_cookie() => false,
                _ => {
                    ids.remove(&group.id);
                    true
                }
            },
            None => true,
        };
        self.by_id.remove_if(group.device(), |_, ids| ids.is_empty());
        unindexed
    }

    fn key_for(&self, device: &DeviceId, id: GroupId) -> Option<GroupStoreKey> {
        let ids = self.by_id.get(device)?;
        let cookie = ids.get(&id)?.clone();
        Some(GroupStoreKey::new(device.clone(), cookie))
    }
}

impl MapEventListener<GroupStoreKey, Group> for GroupView {
    fn event(&self, event: &MapEvent<GroupStoreKey, Group>) {
        match event.event_type {
            MapEventType::Insert | MapEventType::Update => {
                let Some(new) = &event.new_value else {
                    return;
                };
                let group = &new.value;
                self.index(group);
                if group.state != GroupState::Added {
                    return;
                }
                let was_added = event
                    .old_value
                    .as_ref()
                    .is_some_and(|old| old.value.state == GroupState::Added);
                if was_added {
                    return;
                }
                let event_type = if group.first_time {
                    GroupEventType::GroupAdded
                } else {
                    GroupEventType::GroupUpdated
                };
                tracing::debug!("Group {} reached ADDED, raising {:?}", group, event_type);
                self.delegate.notify(GroupEvent::new(event_type, group.clone()));
            }
            MapEventType::Remove => {
                let Some(old) = &event.old_value else {
                    return;
                };
                if self.unindex(&old.value) {
                    self.delegate
                        .notify(GroupEvent::new(GroupEventType::GroupRemoved, old.value.clone()));
                } else {
                    tracing::trace!("Group {} was re-keyed, not reporting removal", old.value);
                }
            }
        }
    }
}

pub struct DistributedGroupStore {
    router: MastershipRouter,
    maps: SharedGroupMaps,
    view: Arc<GroupView>,
    listener: ListenerId,
    extraneous: DashMap<DeviceId, HashMap<GroupId, Group>>,
    audited: DashMap<DeviceId, bool>,
    policy: RwLock<GroupPolicy>,
    locks: StripedLock,
}

impl DistributedGroupStore {
    pub fn new(router: MastershipRouter, maps: SharedGroupMaps, policy: GroupPolicy) -> Arc<Self> {
        let view = Arc::new(GroupView {
            by_id: DashMap::new(),
            delegate: DelegateSlot::default(),
        });
        let listener = maps
            .entries
            .add_listener(Arc::clone(&view) as Arc<dyn MapEventListener<GroupStoreKey, Group>>);
        for (_, entry) in maps.entries.entries() {
            view.index(&entry.value);
        }

        Arc::new(Self {
            router,
            maps,
            view,
            listener,
            extraneous: DashMap::new(),
            audited: DashMap::new(),
            policy: RwLock::new(policy),
            locks: StripedLock::default(),
        })
    }

    pub fn register(self: &Arc<Self>, dispatcher: &MessageDispatcher) {
        let handler = Arc::clone(self) as Arc<dyn MessageHandler>;
        dispatcher.register(subjects::GROUP_REMOTE_OP_REQUEST, Arc::clone(&handler));
        dispatcher.register(subjects::GROUP_FAILOVER, handler);
    }

    pub fn unregister(&self, dispatcher: &MessageDispatcher) {
        dispatcher.unregister(subjects::GROUP_REMOTE_OP_REQUEST);
        dispatcher.unregister(subjects::GROUP_FAILOVER);
    }

    pub fn set_delegate(&self, delegate: Arc<dyn StoreDelegate<GroupEvent>>) {
        self.view.delegate.set(delegate);
    }

    pub fn unset_delegate(&self) {
        self.view.delegate.unset();
    }

    pub fn policy(&self) -> GroupPolicy {
        *self.policy.read()
    }

    pub fn set_policy(&self, policy: GroupPolicy) {
        tracing::info!(
            "Group policy: garbage_collect={} gc_thresh={} allow_extraneous_groups={}",
            policy.garbage_collect,
            policy.gc_thresh,
            policy.allow_extraneous_groups
        );
        *self.policy.write() = policy;
    }

    // Queries

    pub fn group_by_key(&self, device: &DeviceId, app_cookie: &GroupKey) -> Option<Group> {
        self.maps
            .entries
            .get(&GroupStoreKey::new(device.clone(), app_cookie.clone()))
            .map(|entry| entry.value)
    }

    pub fn group_by_id(&self, device: &DeviceId, id: GroupId) -> Option<Group> {
        let key = self.view.key_for(device, id)?;
        self.maps.entries.get(&key).map(|entry| entry.value)
    }

    /// Groups of a device; empty while the device has no master
    pub fn groups(&self, device: &DeviceId) -> Vec<Group> {
        if self.router.mastership().master_for(device).is_none() {
            tracing::debug!("No master for {}, returning no groups", device);
            return Vec::new();
        }
        self.stored_groups(device)
    }

    pub fn group_count(&self, device: &DeviceId) -> usize {
        self.stored_groups(device).len()
    }

    /// Requests still waiting for the device's first audit
    pub fn pending_groups(&self, device: &DeviceId) -> Vec<Group> {
        self.maps
            .pending
            .values()
            .into_iter()
            .filter(|group| group.device() == device)
            .collect()
    }

    pub fn extraneous_groups(&self, device: &DeviceId) -> Vec<Group> {
        self.extraneous
            .get(device)
            .map(|groups| groups.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn device_initial_audit_status(&self, device: &DeviceId) -> bool {
        self.audited.get(device).is_some_and(|audited| *audited)
    }

    pub(super) fn stored_groups(&self, device: &DeviceId) -> Vec<Group> {
        self.maps
            .entries
            .values()
            .into_iter()
            .filter(|group| group.device() == device)
            .collect()
    }

    fn extraneous_group(&self, device: &DeviceId, id: GroupId) -> Option<Group> {
        self.extraneous.get(device)?.get(&id).cloned()
    }

    pub(super) fn lock_device(&self, device: &DeviceId) -> MutexGuard<'_, ()> {
        self.locks.lock(device)
    }

    pub(super) fn put_entry(&self, group: Group) {
        self.maps.entries.put(group.key(), group);
    }

    pub(super) fn notify(&self, event: GroupEvent) {
        self.view.delegate.notify(event);
    }

    // Application requests

    /// Create a group. Requests for devices mastered elsewhere are
    /// forwarded to the master.
    pub async fn store_group_description(&self, description: GroupDescription) -> Result<()> {
        if let Some(existing) = self.group_by_key(&description.device, &description.app_cookie) {
            tracing::info!(
                "Group already exists with key {} on {} with id {}",
                description.app_cookie,
                description.device,
                existing.id
            );
            return Ok(());
        }

        let device = description.device.clone();
        match self.router.route_or_fail(&device, "group add")? {
            Route::Local => {
                let _guard = self.locks.lock(&device);
                self.store_locked(description);
                Ok(())
            }
            Route::Remote(master) => {
                let message = GroupStoreMessage::Add { description };
                self.router
                    .forward(&device, &master, subjects::GROUP_REMOTE_OP_REQUEST, &message)
                    .await
            }
            Route::NoMaster => Err(Error::NoMaster(device.to_string())),
        }
    }

    /// Change a group's buckets, optionally moving it to a new cookie
    pub async fn update_group_description(
        &self,
        device: &DeviceId,
        app_cookie: &GroupKey,
        update_type: UpdateType,
        buckets: Vec<GroupBucket>,
        new_app_cookie: Option<GroupKey>,
    ) -> Result<()> {
        match self.router.route_or_fail(device, "group update")? {
            Route::Local => {
                let _guard = self.locks.lock(device);
                self.update_locked(device, app_cookie, update_type, buckets, new_app_cookie);
                Ok(())
            }
            Route::Remote(master) => {
                let message = GroupStoreMessage::Update {
                    device: device.clone(),
                    app_cookie: app_cookie.clone(),
                    update_type,
                    buckets,
                    new_app_cookie,
                };
                self.router
                    .forward(device, &master, subjects::GROUP_REMOTE_OP_REQUEST, &message)
                    .await
            }
            Route::NoMaster => Err(Error::NoMaster(device.to_string())),
        }
    }

    pub async fn delete_group_description(&self, device: &DeviceId, app_cookie: &GroupKey) -> Result<()> {
        match self.router.route_or_fail(device, "group delete")? {
            Route::Local => {
                let _guard = self.locks.lock(device);
                self.delete_locked(device, app_cookie);
                Ok(())
            }
            Route::Remote(master) => {
                let message = GroupStoreMessage::Delete {
                    device: device.clone(),
                    app_cookie: app_cookie.clone(),
                };
                self.router
                    .forward(device, &master, subjects::GROUP_REMOTE_OP_REQUEST, &message)
                    .await
            }
            Route::NoMaster => Err(Error::NoMaster(device.to_string())),
        }
    }

    pub(super) fn store_locked(&self, description: GroupDescription) {
        let key = description.key();
        if self.maps.entries.contains_key(&key) {
            tracing::debug!("Group {} already stored", key);
            return;
        }
        if !self.device_initial_audit_status(&description.device) {
            tracing::debug!(
                "Device {} not audited yet, queueing group {}",
                description.device,
                description.app_cookie
            );
            let mut group = Group::new(GroupId::UNALLOCATED, description);
            group.state = GroupState::WaitingAuditComplete;
            self.maps.pending.put(key, group);
            return;
        }
        self.create_locked(description);
    }

    fn create_locked(&self, description: GroupDescription) {
        let device = description.device.clone();
        let adoptable = match description.given_group_id {
            Some(id) => self.extraneous_group(&device, id),
            None => self
                .extraneous_groups(&device)
                .into_iter()
                .find(|group| group.buckets() == description.buckets.as_slice()),
        };
        if let Some(found) = adoptable {
            self.adopt_extraneous_locked(description, found);
            return;
        }

        let id = match description.given_group_id {
            Some(id) => {
                if let Some(existing) = self.group_by_id(&device, id) {
                    tracing::warn!(
                        "Group id {} on {} is already used by {}, rejecting {}",
                        id,
                        device,
                        existing.app_cookie(),
                        description.app_cookie
                    );
                    return;
                }
                id
            }
            None => self.allocate_group_id(&device),
        };

        let group = Group::new(id, description);
        tracing::debug!("Storing group {}", group);
        self.maps.entries.put(group.key(), group.clone());
        self.notify(GroupEvent::new(GroupEventType::GroupAddRequested, group));
    }

    /// Take over a group found on the device instead of installing a new one
    fn adopt_extraneous_locked(&self, description: GroupDescription, found: Group) {
        let group = Group::new(found.id, description);
        if group.buckets() == found.buckets() {
            tracing::debug!("Reusing extraneous group {} for {}", found.id, group.app_cookie());
            self.maps.entries.put(group.key(), group);
            self.add_or_update_locked(&found);
            self.remove_extraneous_group_entry(&found);
        } else {
            let mut group = group;
            group.state = GroupState::PendingUpdate;
            tracing::debug!(
                "Reusing extraneous group {} for {} with new buckets",
                found.id,
                group.app_cookie()
            );
            self.maps.entries.put(group.key(), group.clone());
            self.remove_extraneous_group_entry(&found);
            self.notify(GroupEvent::new(GroupEventType::GroupUpdateRequested, group));
        }
    }

    /// Next free id, skipping ids known on the device
    fn allocate_group_id(&self, device: &DeviceId) -> GroupId {
        loop {
            let id = GroupId(self.maps.id_generator.fetch_add(1, Ordering::SeqCst).wrapping_add(1));
            if id == GroupId::UNALLOCATED
                || self.view.key_for(device, id).is_some()
                || self.extraneous_group(device, id).is_some()
            {
                tracing::trace!("Group id {} in use on {}, probing", id, device);
                continue;
            }
            return id;
        }
    }

    fn update_locked(
        &self,
        device: &DeviceId,
        app_cookie: &GroupKey,
        update_type: UpdateType,
        buckets: Vec<GroupBucket>,
        new_app_cookie: Option<GroupKey>,
    ) {
        let Some(old) = self.group_by_key(device, app_cookie) else {
            tracing::warn!("Update of unknown group {} on {}", app_cookie, device);
            return;
        };
        let Some(buckets) = updated_buckets(old.buckets(), update_type, buckets) else {
            tracing::warn!("Update of group {} changes no bucket", old);
            return;
        };

        let description = GroupDescription {
            buckets,
            app_cookie: new_app_cookie.unwrap_or_else(|| app_cookie.clone()),
            ..old.description.clone()
        };
        let mut group = Group::new(old.id, description);
        group.life = old.life;
        group.packets = old.packets;
        group.bytes = old.bytes;
        group.state = GroupState::PendingUpdate;

        let old_key = old.key();
        let new_key = group.key();
        self.maps.entries.put(new_key.clone(), group.clone());
        if new_key != old_key {
            tracing::debug!("Group {} moved from {} to {}", group.id, old_key, new_key);
            self.maps.entries.remove(&old_key);
        }
        self.notify(GroupEvent::new(GroupEventType::GroupUpdateRequested, group));
    }

    pub(super) fn delete_locked(&self, device: &DeviceId, app_cookie: &GroupKey) {
        let Some(mut group) = self.group_by_key(device, app_cookie) else {
            tracing::warn!("Delete of unknown group {} on {}", app_cookie, device);
            return;
        };
        group.state = GroupState::PendingDelete;
        self.maps.entries.put(group.key(), group.clone());
        self.notify(GroupEvent::new(GroupEventType::GroupRemoveRequested, group));
    }

    // Southbound reports

    /// Refresh an entry from the device's view of it
    pub fn add_or_update_group_entry(&self, group: &Group) {
        let _guard = self.locks.lock(group.device());
        self.add_or_update_locked(group);
    }

    pub(super) fn add_or_update_locked(&self, reported: &Group) {
        let Some(mut existing) = self.group_by_id(reported.device(), reported.id) else {
            tracing::warn!("Group {} reported by the device is not stored", reported);
            return;
        };

        for bucket in existing.description.buckets.iter_mut() {
            if let Some(stats) = reported.buckets().iter().find(|b| *b == bucket) {
                bucket.packets = stats.packets;
                bucket.bytes = stats.bytes;
            }
        }
        existing.life = reported.life;
        existing.packets = reported.packets;
        existing.bytes = reported.bytes;
        existing.set_reference_count(reported.reference_count);

        match existing.state {
            GroupState::PendingAdd | GroupState::PendingAddRetry => {
                existing.state = GroupState::Added;
                existing.first_time = true;
            }
            GroupState::PendingDelete => {
                tracing::trace!("Group {} is being deleted, refreshing statistics only", existing);
            }
            _ => {
                existing.state = GroupState::Added;
                existing.first_time = false;
            }
        }
        self.maps.entries.put(existing.key(), existing);
    }

    pub fn remove_group_entry(&self, group: &Group) {
        let _guard = self.locks.lock(group.device());
        self.remove_group_entry_locked(group);
    }

    pub(super) fn remove_group_entry_locked(&self, group: &Group) {
        match self.view.key_for(group.device(), group.id) {
            Some(key) => {
                self.maps.entries.remove(&key);
            }
            None => tracing::warn!("Removal of unknown group {}", group),
        }
    }

    /// Drop every entry of a device
    pub fn purge_group_entry(&self, device: &DeviceId) {
        let _guard = self.locks.lock(device);
        let keys: Vec<GroupStoreKey> = self
            .maps
            .entries
            .entries()
            .into_iter()
            .map(|(key, _)| key)
            .filter(|key| &key.device == device)
            .collect();
        tracing::debug!("Purging {} groups of {}", keys.len(), device);
        for key in keys {
            self.maps.entries.remove(&key);
        }
    }

    pub fn purge_group_entries(&self) {
        let mut devices: Vec<DeviceId> = self
            .maps
            .entries
            .entries()
            .into_iter()
            .map(|(key, _)| key.device)
            .collect();
        devices.sort();
        devices.dedup();
        for device in devices {
            self.purge_group_entry(&device);
        }
    }

    /// Record the outcome of a device's first audit. Completion releases
    /// the requests queued for the device.
    pub fn device_initial_audit_completed(&self, device: &DeviceId, completed: bool) {
        let _guard = self.locks.lock(device);
        self.audit_completed_locked(device, completed);
    }

    pub(super) fn audit_completed_locked(&self, device: &DeviceId, completed: bool) {
        if !completed {
            if self.audited.remove_if(device, |_, audited| *audited).is_some() {
                tracing::debug!("Initial audit of {} reset", device);
            }
            return;
        }

        tracing::debug!("Initial audit of {} completed", device);
        self.audited.insert(device.clone(), true);
        let queued: Vec<(GroupStoreKey, Group)> = self
            .maps
            .pending
            .entries()
            .into_iter()
            .filter(|(key, _)| &key.device == device)
            .map(|(key, entry)| (key, entry.value))
            .collect();
        for (key, group) in queued {
            tracing::debug!("Releasing queued group {}", key);
            self.store_locked(group.description);
            self.maps.pending.remove(&key);
        }
    }

    /// Handle a device's rejection of a group operation
    pub fn group_operation_failed(&self, device: &DeviceId, operation: &GroupOperation) {
        let _guard = self.locks.lock(device);
        let Some(existing) = self.group_by_id(device, operation.group_id) else {
            tracing::warn!(
                "{:?} of group {} on {} failed, but the group is not stored",
                operation.op_type,
                operation.group_id,
                device
            );
            return;
        };

        if operation.failure_code == Some(GroupMsgErrorCode::GroupExists) {
            if existing.buckets() != operation.buckets.as_slice() {
                tracing::warn!("Group {} exists on the device with other buckets", existing);
            } else if matches!(existing.state, GroupState::PendingAdd | GroupState::PendingAddRetry) {
                tracing::debug!("Group {} already on the device, treating add as done", existing);
                self.add_or_update_locked(&existing);
                return;
            } else {
                tracing::warn!("Group {} exists on the device while {:?}", existing, existing.state);
            }
        }

        tracing::warn!(
            "{:?} of group {} failed with {:?}",
            operation.op_type,
            existing,
            operation.failure_code
        );
        match operation.op_type {
            GroupOperationType::Add => {
                if existing.state == GroupState::PendingAdd {
                    self.notify(GroupEvent::new(GroupEventType::GroupAddFailed, existing.clone()));
                    self.maps.entries.remove(&existing.key());
                }
            }
            GroupOperationType::Modify => self.notify(GroupEvent::new(GroupEventType::GroupUpdateFailed, existing)),
            GroupOperationType::Delete => self.notify(GroupEvent::new(GroupEventType::GroupRemoveFailed, existing)),
        }
    }

    pub fn add_or_update_extraneous_group_entry(&self, group: Group) {
        tracing::trace!("Group {} is on {} but not in the store", group.id, group.device());
        self.extraneous
            .entry(group.device().clone())
            .or_default()
            .insert(group.id, group);
    }

    pub fn remove_extraneous_group_entry(&self, group: &Group) {
        if let Some(mut groups) = self.extraneous.get_mut(group.device()) {
            groups.remove(&group.id);
        }
    }

    /// Publish bucket failovers to every node
    pub async fn notify_of_failovers(&self, groups: Vec<Group>) {
        for group in groups {
            if group.group_type() != GroupType::Failover {
                continue;
            }
            self.apply_failover(&group);
            let message = GroupStoreMessage::Failover {
                device: group.device().clone(),
                group,
            };
            self.broadcast(subjects::GROUP_FAILOVER, &message).await;
        }
    }

    fn apply_failover(&self, group: &Group) {
        match self.group_by_key(group.device(), group.app_cookie()) {
            Some(local) => self.notify(GroupEvent::new(GroupEventType::GroupBucketFailover, local)),
            None => tracing::debug!("Failover of unknown group {}", group),
        }
    }

    async fn broadcast<T: Serialize + Sync>(&self, subject: &str, payload: &T) {
        let result = match ClusterMessage::new(self.router.local_node().clone(), subject, payload) {
            Ok(message) => self.router.communicator().broadcast(message).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            tracing::warn!("Failed to broadcast {}: {}", subject, e);
        }
    }

    fn apply_forwarded(&self, message: GroupStoreMessage) {
        let device = message.device().clone();
        let _guard = self.locks.lock(&device);
        match message {
            GroupStoreMessage::Add { description } => self.store_locked(description),
            GroupStoreMessage::Update {
                device,
                app_cookie,
                update_type,
                buckets,
                new_app_cookie,
            } => self.update_locked(&device, &app_cookie, update_type, buckets, new_app_cookie),
            GroupStoreMessage::Delete { device, app_cookie } => self.delete_locked(&device, &app_cookie),
            GroupStoreMessage::Failover { group, .. } => self.apply_failover(&group),
        }
    }

    /// Detach from the shared maps and drop local state
    pub fn shutdown(&self) {
        self.maps.entries.remove_listener(self.listener);
        self.view.by_id.clear();
        self.view.delegate.unset();
        self.extraneous.clear();
        self.audited.clear();
        tracing::info!("Group store stopped");
    }
}

#[async_trait]
impl MessageHandler for DistributedGroupStore {
    async fn handle(&self, message: ClusterMessage) -> Result<()> {
        let operation: GroupStoreMessage = message.decode()?;
        tracing::trace!("Received {} from {}", operation.kind(), message.sender);
        if let GroupStoreMessage::Failover { group, .. } = &operation {
            self.apply_failover(group);
            return Ok(());
        }
        if self.router.accepts_forwarded(operation.device(), &message.sender) {
            self.apply_forwarded(operation);
        }
        Ok(())
    }
}

/// Bucket list after an update, or `None` when nothing changes
pub(crate) fn updated_buckets(
    old: &[GroupBucket],
    update_type: UpdateType,
    buckets: Vec<GroupBucket>,
) -> Option<Vec<GroupBucket>> {
    match update_type {
        UpdateType::Set => (!same_buckets(old, &buckets)).then_some(buckets),
        UpdateType::Add => {
            let mut changed = !buckets.iter().all(|bucket| old.contains(bucket));
            let mut merged = Vec::with_capacity(old.len() + buckets.len());
            for bucket in old {
                match buckets.iter().find(|b| *b == bucket) {
                    Some(replacement) => changed |= !bucket.has_same_parameters(replacement),
                    None => merged.push(bucket.clone()),
                }
            }
            merged.extend(buckets);
            changed.then_some(merged)
        }
        UpdateType::Remove => {
            let kept: Vec<GroupBucket> = old.iter().filter(|b| !buckets.contains(b)).cloned().collect();
            (kept.len() != old.len()).then_some(kept)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bucket(port: u32) -> GroupBucket {
        GroupBucket::new(GroupType::Select, vec![format!("output:{}", port)])
    }

    #[test]
    fn test_add_merges_and_detects_changes() {
        let old = vec![bucket(1), bucket(2)];

        assert_eq!(updated_buckets(&old, UpdateType::Add, vec![bucket(2)]), None);
        assert_eq!(
            updated_buckets(&old, UpdateType::Add, vec![bucket(3)]),
            Some(vec![bucket(1), bucket(2), bucket(3)])
        );

        let reweighted = updated_buckets(&old, UpdateType::Add, vec![bucket(2).with_weight(4)]).unwrap();
        assert_eq!(reweighted, vec![bucket(1), bucket(2)]);
        assert_eq!(reweighted[1].weight, 4);
    }

    #[test]
    fn test_remove_and_set() {
        let old = vec![bucket(1), bucket(2)];
        assert_eq!(updated_buckets(&old, UpdateType::Remove, vec![bucket(3)]), None);
        assert_eq!(
            updated_buckets(&old, UpdateType::Remove, vec![bucket(1)]),
            Some(vec![bucket(2)])
        );

        assert_eq!(updated_buckets(&old, UpdateType::Set, old.clone()), None);
        assert_eq!(
            updated_buckets(&old, UpdateType::Set, vec![bucket(3)]),
            Some(vec![bucket(3)])
        );
    }
}
