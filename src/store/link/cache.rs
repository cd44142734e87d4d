//! Merged link cache with endpoint indices

use dashmap::DashMap;
use std::collections::HashSet;

use super::merge::monotonic_type;
use super::{ConnectPoint, DescriptionMap, DiscoveryMode, Link, LinkEvent, LinkEventType, LinkKey, LinkState};
use crate::cluster::DeviceId;

/// Local cache of composed links, indexed by source and destination device
#[derive(Default)]
pub struct LinkCache {
    links: DashMap<LinkKey, Link>,
    src_index: DashMap<DeviceId, HashSet<LinkKey>>,
    dst_index: DashMap<DeviceId, HashSet<LinkKey>>,
}

impl LinkCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Recompose a link from its descriptions and report what changed.
    ///
    /// An empty description map removes the cached link. An existing link
    /// yields UPDATED whenever the recomposed link differs from the cached
    /// one; a cached DIRECT type is kept over a later INDIRECT report.
    pub fn refresh(&self, key: &LinkKey, descriptions: &DescriptionMap, mode: DiscoveryMode) -> Option<LinkEvent> {
        let Some(mut link) = descriptions.compose(mode) else {
            return self.remove(key);
        };

        let previous = self.links.get(key).map(|l| l.value().clone());
        match previous {
            None => {
                self.insert(key, link.clone());
                Some(LinkEvent::new(LinkEventType::LinkAdded, link))
            }
            Some(old) => {
                link.link_type = monotonic_type(old.link_type, link.link_type);
                if old == link {
                    return None;
                }
                self.links.insert(key.clone(), link.clone());
                Some(LinkEvent::new(LinkEventType::LinkUpdated, link))
            }
        }
    }

    pub fn remove(&self, key: &LinkKey) -> Option<LinkEvent> {
        let (_, link) = self.links.remove(key)?;
        Self::unindex(&self.src_index, &key.src.device, key);
        Self::unindex(&self.dst_index, &key.dst.device, key);
        Some(LinkEvent::new(LinkEventType::LinkRemoved, link))
    }

    /// Mark a cached link inactive; `None` if absent or already inactive
    pub fn deactivate(&self, key: &LinkKey) -> Option<LinkEvent> {
        let mut link = self.links.get_mut(key)?;
        if link.state == LinkState::Inactive {
            return None;
        }
        link.state = LinkState::Inactive;
        Some(LinkEvent::new(LinkEventType::LinkUpdated, link.value().clone()))
    }

    pub fn get(&self, key: &LinkKey) -> Option<Link> {
        self.links.get(key).map(|l| l.value().clone())
    }

    pub fn contains(&self, key: &LinkKey) -> bool {
        self.links.contains_key(key)
    }

    pub fn links(&self) -> Vec<Link> {
        self.links.iter().map(|l| l.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub fn device_egress(&self, device: &DeviceId) -> Vec<Link> {
        self.indexed(&self.src_index, device)
    }

    pub fn device_ingress(&self, device: &DeviceId) -> Vec<Link> {
        self.indexed(&self.dst_index, device)
    }

    pub fn egress(&self, src: &ConnectPoint) -> Vec<Link> {
        self.device_egress(&src.device)
            .into_iter()
            .filter(|l| &l.src == src)
            .collect()
    }

    pub fn ingress(&self, dst: &ConnectPoint) -> Vec<Link> {
        self.device_ingress(&dst.device)
            .into_iter()
            .filter(|l| &l.dst == dst)
            .collect()
    }

    pub fn clear(&self) {
        self.links.clear();
        self.src_index.clear();
        self.dst_index.clear();
    }

    fn insert(&self, key: &LinkKey, link: Link) {
        self.links.insert(key.clone(), link);
        self.src_index
            .entry(key.src.device.clone())
            .or_default()
            .insert(key.clone());
        self.dst_index
            .entry(key.dst.device.clone())
            .or_default()
            .insert(key.clone());
    }

    fn indexed(&self, index: &DashMap<DeviceId, HashSet<LinkKey>>, device: &DeviceId) -> Vec<Link> {
        let keys: Vec<LinkKey> = match index.get(device) {
            Some(keys) => keys.iter().cloned().collect(),
            None => return Vec::new(),
        };
        keys.iter().filter_map(|k| self.get(k)).collect()
    }

    fn unindex(index: &DashMap<DeviceId, HashSet<LinkKey>>, device: &DeviceId, key: &LinkKey) {
        index.remove_if_mut(device, |_, keys| {
            keys.remove(key);
            keys.is_empty()
        });
    }
}
