//! Group audit
//!
//! Reconciles the store with the groups a device reports. Groups present
//! on both sides are refreshed, groups only on the device become
//! extraneous (or are asked to be removed), and groups only in the store
//! are requested again. The first audit of a device releases the requests
//! queued for it.

use std::collections::HashMap;

use super::store::DistributedGroupStore;
use super::{Group, GroupEvent, GroupEventType, GroupKey, GroupState};
use crate::cluster::DeviceId;

impl DistributedGroupStore {
    /// Audit a device against the groups it reports
    pub async fn push_group_metrics(&self, device: &DeviceId, reported: Vec<Group>) {
        let collected = {
            let _guard = self.lock_device(device);
            self.audit_locked(device, reported)
        };

        for app_cookie in collected {
            tracing::debug!("Garbage collecting group {} on {}", app_cookie, device);
            if let Err(e) = self.delete_group_description(device, &app_cookie).await {
                tracing::warn!("Failed to garbage collect group {} on {}: {}", app_cookie, device, e);
            }
        }
    }

    /// Returns the cookies of the groups to garbage collect
    fn audit_locked(&self, device: &DeviceId, reported: Vec<Group>) -> Vec<GroupKey> {
        let initially_audited = self.device_initial_audit_status(device);
        let policy = self.policy();

        let mut southbound = reported;
        let mut stored = self.stored_groups(device);
        let mut extraneous_stale: HashMap<_, _> = self
            .extraneous_groups(device)
            .into_iter()
            .map(|group| (group.id, group))
            .collect();
        tracing::trace!(
            "Auditing {}: {} reported, {} stored, {} extraneous",
            device,
            southbound.len(),
            stored.len(),
            extraneous_stale.len()
        );

        let mut collected = Vec::new();
        if policy.garbage_collect {
            stored.retain(|group| {
                let unused = group.state != GroupState::PendingDelete
                    && group.reference_count == 0
                    && group.age >= policy.gc_thresh;
                if unused {
                    southbound.retain(|reported| !reported.matches(group));
                    collected.push(group.app_cookie().clone());
                }
                !unused
            });
        }

        southbound.retain(|reported| match stored.iter().position(|group| group.matches(reported)) {
            Some(index) => {
                stored.swap_remove(index);
                tracing::trace!("Group {} is on both sides for {}", reported.id, device);
                self.add_or_update_locked(reported);
                false
            }
            None => true,
        });

        for reported in southbound {
            if let Some(existing) = self.group_by_id(device, reported.id) {
                // Likely an update in flight, the device reported stale buckets
                match stored.iter().position(|group| group.key() == existing.key()) {
                    Some(index) => {
                        stored.swap_remove(index);
                    }
                    None => tracing::warn!(
                        "Group {} on {} is indexed by id but missing by key",
                        existing.id,
                        device
                    ),
                }
                continue;
            }

            tracing::debug!("Extraneous group {} on {}", reported.id, device);
            extraneous_stale.remove(&reported.id);
            if policy.allow_extraneous_groups {
                self.add_or_update_extraneous_group_entry(reported);
            } else {
                self.notify(GroupEvent::new(GroupEventType::GroupRemoveRequested, reported));
            }
        }

        for group in stored {
            self.group_missing_locked(group);
        }

        for group in extraneous_stale.into_values() {
            tracing::debug!("Extraneous group {} left {}", group.id, device);
            self.remove_extraneous_group_entry(&group);
        }

        if !initially_audited {
            tracing::info!("Initial group audit of {} completed", device);
            self.audit_completed_locked(device, true);
        }
        collected
    }

    fn group_missing_locked(&self, mut group: Group) {
        match group.state {
            GroupState::PendingDelete => {
                tracing::debug!("Deletion of group {} confirmed by the device", group);
                self.remove_group_entry_locked(&group);
            }
            GroupState::Added | GroupState::PendingAdd | GroupState::PendingAddRetry | GroupState::PendingUpdate => {
                tracing::debug!("Group {} is missing on the device, requesting it again", group);
                group.state = GroupState::PendingAddRetry;
                self.put_entry(group.clone());
                self.notify(GroupEvent::new(GroupEventType::GroupAddRequested, group));
            }
            GroupState::WaitingAuditComplete => {
                tracing::debug!("Group {} has not been installed", group);
            }
        }
    }
}
