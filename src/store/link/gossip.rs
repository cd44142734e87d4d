//! Gossip Link Store
//!
//! Each node keeps per-provider link descriptions and a tombstone set.
//! Writes are applied on the destination device's master, which timestamps
//! them with its device clock and broadcasts the merged fragment. Peers
//! merge inbound fragments and rebroadcast them when they changed anything,
//! and a periodic anti-entropy advertisement exchange repairs lost updates.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use super::messages::{
    InternalLinkEvent, InternalLinkRemovedEvent, LinkAntiEntropyAdvertisement, LinkFragmentId, LinkInjectedEvent,
};
use super::{
    ConnectPoint, DescriptionMap, DiscoveryMode, Link, LinkCache, LinkDescription, LinkEvent, LinkKey, LinkStore,
    ProviderId,
};
use crate::cluster::{ClusterMembership, DeviceClockService, DeviceId, NodeId};
use crate::error::{Error, Result};
use crate::network::{subjects, ClusterMessage, MessageDispatcher, MessageHandler};
use crate::store::router::{MastershipRouter, Route};
use crate::store::scheduler::AntiEntropy;
use crate::store::timestamp::{Timestamp, Timestamped};
use crate::store::{DelegateSlot, StoreDelegate};

type SharedDescriptions = Arc<Mutex<DescriptionMap>>;

/// Link store replicated by peer-to-peer gossip
pub struct GossipLinkStore {
    /// Per-key description maps; each mutex is the key's critical section
    descriptions: DashMap<LinkKey, SharedDescriptions>,
    /// Time of the latest removal of each key
    tombstones: DashMap<LinkKey, Timestamp>,
    cache: LinkCache,
    router: MastershipRouter,
    clock: Arc<DeviceClockService>,
    membership: Arc<ClusterMembership>,
    delegate: DelegateSlot<LinkEvent>,
    mode: RwLock<DiscoveryMode>,
}

impl GossipLinkStore {
    pub fn new(
        router: MastershipRouter,
        clock: Arc<DeviceClockService>,
        membership: Arc<ClusterMembership>,
        mode: DiscoveryMode,
    ) -> Arc<Self> {
        Arc::new(Self {
            descriptions: DashMap::new(),
            tombstones: DashMap::new(),
            cache: LinkCache::new(),
            router,
            clock,
            membership,
            delegate: DelegateSlot::default(),
            mode: RwLock::new(mode),
        })
    }

    /// Register the store's message handlers. Advertisements run on the
    /// dispatcher's background worker.
    pub fn register(self: &Arc<Self>, dispatcher: &MessageDispatcher) {
        let handler = Arc::clone(self) as Arc<dyn MessageHandler>;
        dispatcher.register(subjects::LINK_UPDATE, Arc::clone(&handler));
        dispatcher.register(subjects::LINK_REMOVED, Arc::clone(&handler));
        dispatcher.register(subjects::LINK_INJECTED, Arc::clone(&handler));
        dispatcher.register_background(subjects::LINK_ANTI_ENTROPY_ADVERTISEMENT, handler);
    }

    pub fn unregister(&self, dispatcher: &MessageDispatcher) {
        dispatcher.unregister(subjects::LINK_UPDATE);
        dispatcher.unregister(subjects::LINK_REMOVED);
        dispatcher.unregister(subjects::LINK_INJECTED);
        dispatcher.unregister(subjects::LINK_ANTI_ENTROPY_ADVERTISEMENT);
    }

    /// Timestamp of the key's latest removal, if any
    pub fn tombstone(&self, src: &ConnectPoint, dst: &ConnectPoint) -> Option<Timestamp> {
        self.tombstones
            .get(&LinkKey::new(src.clone(), dst.clone()))
            .map(|t| *t.value())
    }

    /// Snapshot of every fragment timestamp and tombstone held here
    pub fn advertisement(&self) -> LinkAntiEntropyAdvertisement {
        let mut fragments = Vec::new();
        for (key, descriptions) in self.snapshot() {
            let descriptions = descriptions.lock();
            for (provider, description) in descriptions.iter() {
                let id = LinkFragmentId {
                    key: key.clone(),
                    provider: provider.clone(),
                };
                fragments.push((id, description.timestamp()));
            }
        }

        LinkAntiEntropyAdvertisement {
            sender: self.router.local_node().clone(),
            fragments,
            tombstones: self
                .tombstones
                .iter()
                .map(|t| (t.key().clone(), *t.value()))
                .collect(),
        }
    }

    /// Send this node's advertisement to a peer
    pub async fn send_advertisement(&self, peer: &NodeId) -> Result<()> {
        let advertisement = self.advertisement();
        self.unicast(peer, subjects::LINK_ANTI_ENTROPY_ADVERTISEMENT, &advertisement)
            .await
    }

    fn snapshot(&self) -> Vec<(LinkKey, SharedDescriptions)> {
        self.descriptions
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect()
    }

    fn descriptions_for(&self, key: &LinkKey) -> SharedDescriptions {
        if let Some(existing) = self.descriptions.get(key) {
            return Arc::clone(existing.value());
        }
        let entry = self.descriptions.entry(key.clone()).or_default();
        Arc::clone(entry.value())
    }

    /// Keep the newest removal time per key
    fn record_tombstone(&self, key: &LinkKey, timestamp: Timestamp) {
        self.tombstones
            .entry(key.clone())
            .and_modify(|t| {
                if timestamp.is_newer_than(t) {
                    *t = timestamp;
                }
            })
            .or_insert(timestamp);
    }

    /// Merge a timestamped description under the key's lock.
    ///
    /// Returns the resulting event and the provider's merged fragment.
    fn update_internal(
        &self,
        provider: &ProviderId,
        description: Timestamped<LinkDescription>,
    ) -> Option<(LinkEvent, Timestamped<LinkDescription>)> {
        let key = description.value().key();
        let shared = self.descriptions_for(&key);
        let mut descriptions = shared.lock();

        // a removed link comes back only with a newer description
        let removed = self.tombstones.get(&key).map(|t| *t.value());
        if let Some(removed) = removed {
            if !description.is_newer_than(&removed) {
                tracing::trace!("Link {} was already removed at {}, ignoring", key, removed);
                return None;
            }
            self.tombstones.remove(&key);
        }

        if !descriptions.merge(provider, description) {
            return None;
        }
        let event = self.cache.refresh(&key, &descriptions, self.discovery_mode())?;
        let merged = descriptions.get(provider)?.clone();
        Some((event, merged))
    }

    /// Apply a removal under the key's lock.
    ///
    /// Accepted only when newer than the primary description; an unknown key
    /// just records the tombstone.
    fn remove_internal(&self, key: &LinkKey, timestamp: Timestamp) -> Option<LinkEvent> {
        let shared = self.descriptions_for(key);
        let mut descriptions = shared.lock();

        if descriptions.is_empty() {
            self.record_tombstone(key, timestamp);
            return None;
        }
        if let Some(primary) = descriptions.primary() {
            if !timestamp.is_newer_than(&primary.timestamp()) {
                tracing::trace!("Outdated removal of {} at {}, ignoring", key, timestamp);
                return None;
            }
        }

        self.record_tombstone(key, timestamp);
        descriptions.clear();
        self.cache.remove(key)
    }

    /// Timestamp and apply a write on the destination device's master
    async fn apply_local_update(
        &self,
        provider: &ProviderId,
        description: LinkDescription,
    ) -> Result<Option<LinkEvent>> {
        let device = description.dst.device.clone();
        let timestamp = match self.clock.timestamp(&device) {
            Ok(timestamp) => timestamp,
            Err(e) => {
                tracing::debug!("Dropping update of link {}: {}", description.key(), e);
                return Ok(None);
            }
        };

        let Some((event, merged)) = self.update_internal(provider, Timestamped::new(description, timestamp)) else {
            return Ok(None);
        };

        tracing::debug!(
            "Notifying peers of link update {} from {}",
            event.link.key(),
            provider
        );
        let fragment = InternalLinkEvent {
            provider: provider.clone(),
            description: merged,
        };
        self.broadcast(subjects::LINK_UPDATE, &fragment).await;
        Ok(Some(event))
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

    async fn unicast<T: Serialize + Sync>(&self, peer: &NodeId, subject: &str, payload: &T) -> Result<()> {
        let message = ClusterMessage::new(self.router.local_node().clone(), subject, payload)?;
        self.router.communicator().unicast(message, peer).await
    }

    async fn handle_update(&self, event: InternalLinkEvent) {
        if let Some((link_event, merged)) = self.update_internal(&event.provider, event.description) {
            self.delegate.notify(link_event);
            let fragment = InternalLinkEvent {
                provider: event.provider,
                description: merged,
            };
            self.broadcast(subjects::LINK_UPDATE, &fragment).await;
        }
    }

    async fn handle_removed(&self, event: InternalLinkRemovedEvent) {
        if let Some(link_event) = self.remove_internal(&event.key, event.timestamp) {
            self.delegate.notify(link_event);
            self.broadcast(subjects::LINK_REMOVED, &event).await;
        }
    }

    async fn handle_injected(&self, sender: &NodeId, injected: LinkInjectedEvent) {
        let device = &injected.description.dst.device;
        if !self.clock.is_timestamp_available(device) {
            tracing::warn!("Not ready to accept update, dropping {}", injected.description.key());
            return;
        }
        if !self.router.accepts_forwarded(device, sender) {
            return;
        }
        match self
            .apply_local_update(&injected.provider, injected.description)
            .await
        {
            Ok(event) => self.delegate.notify_if_some(event),
            Err(e) => tracing::warn!("Failed to apply injected link from {}: {}", sender, e),
        }
    }

    async fn handle_advertisement(&self, advertisement: LinkAntiEntropyAdvertisement) -> Result<()> {
        let sender = advertisement.sender;
        let remote_fragments: HashMap<LinkFragmentId, Timestamp> = advertisement.fragments.into_iter().collect();
        let remote_tombstones: HashMap<LinkKey, Timestamp> = advertisement.tombstones.into_iter().collect();

        let mut newer_here = Vec::new();
        let mut known = HashSet::new();
        let mut local_outdated = false;

        for (key, descriptions) in self.snapshot() {
            let descriptions = descriptions.lock();
            for (provider, description) in descriptions.iter() {
                let id = LinkFragmentId {
                    key: key.clone(),
                    provider: provider.clone(),
                };
                let remote_live = remote_fragments.get(&id).copied();
                match remote_live.or_else(|| remote_tombstones.get(&key).copied()) {
                    Some(remote) if !description.is_newer_than(&remote) => {
                        if remote_live.is_some_and(|live| live.is_newer_than(&description.timestamp())) {
                            local_outdated = true;
                        }
                    }
                    _ => newer_here.push(InternalLinkEvent {
                        provider: provider.clone(),
                        description: description.clone(),
                    }),
                }
                known.insert(id);
            }
        }

        // fragments only the peer holds, unless a local removal dominates them
        for (id, remote) in &remote_fragments {
            if known.contains(id) {
                continue;
            }
            let removed = self.tombstones.get(&id.key).map(|t| *t.value());
            if removed.map_or(true, |removed| remote.is_newer_than(&removed)) {
                local_outdated = true;
            }
        }

        for event in newer_here {
            if let Err(e) = self.unicast(&sender, subjects::LINK_UPDATE, &event).await {
                tracing::debug!("Failed to push link fragment to {}: {}", sender, e);
            }
        }

        for (key, removed) in remote_tombstones {
            // stale removals are ignored by remove_internal
            self.delegate.notify_if_some(self.remove_internal(&key, removed));
        }

        if local_outdated {
            tracing::trace!("Links outdated relative to {}, sending advertisement back", sender);
            if let Err(e) = self.send_advertisement(&sender).await {
                tracing::debug!("Failed to send advertisement back to {}: {}", sender, e);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl LinkStore for GossipLinkStore {
    async fn create_or_update_link(
        &self,
        provider: &ProviderId,
        description: LinkDescription,
    ) -> Result<Option<LinkEvent>> {
        let device = description.dst.device.clone();
        match self.router.route_or_fail(&device, "link update")? {
            Route::Local => self.apply_local_update(provider, description).await,
            Route::Remote(master) => {
                let injected = LinkInjectedEvent {
                    provider: provider.clone(),
                    description,
                };
                self.router
                    .forward(&device, &master, subjects::LINK_INJECTED, &injected)
                    .await?;
                Ok(None)
            }
            Route::NoMaster => Err(Error::NoMaster(device.to_string())),
        }
    }

    async fn remove_link(&self, src: &ConnectPoint, dst: &ConnectPoint) -> Result<Option<LinkEvent>> {
        let key = LinkKey::new(src.clone(), dst.clone());
        let timestamp = match self.clock.timestamp(&dst.device) {
            Ok(timestamp) => timestamp,
            Err(_) => {
                // happens while mastership handoff is in progress
                tracing::debug!("Failed to remove link {}, not the master", key);
                return Ok(None);
            }
        };

        let event = self.remove_internal(&key, timestamp);
        if event.is_some() {
            tracing::debug!("Notifying peers of link removal {}", key);
            self.broadcast(subjects::LINK_REMOVED, &InternalLinkRemovedEvent { key, timestamp })
                .await;
        }
        Ok(event)
    }

    async fn remove_or_down_link(&self, src: &ConnectPoint, dst: &ConnectPoint) -> Result<Option<LinkEvent>> {
        let key = LinkKey::new(src.clone(), dst.clone());
        let Some(link) = self.cache.get(&key) else {
            return Ok(None);
        };
        if link.is_durable || link.is_expected {
            // deactivation stays local to this node's cache
            let shared = self.descriptions_for(&key);
            let _guard = shared.lock();
            return Ok(self.cache.deactivate(&key));
        }
        self.remove_link(src, dst).await
    }

    fn link(&self, src: &ConnectPoint, dst: &ConnectPoint) -> Option<Link> {
        self.cache.get(&LinkKey::new(src.clone(), dst.clone()))
    }

    fn links(&self) -> Vec<Link> {
        self.cache.links()
    }

    fn link_count(&self) -> usize {
        self.cache.len()
    }

    fn egress_links(&self, src: &ConnectPoint) -> Vec<Link> {
        self.cache.egress(src)
    }

    fn ingress_links(&self, dst: &ConnectPoint) -> Vec<Link> {
        self.cache.ingress(dst)
    }

    fn device_egress_links(&self, device: &DeviceId) -> Vec<Link> {
        self.cache.device_egress(device)
    }

    fn device_ingress_links(&self, device: &DeviceId) -> Vec<Link> {
        self.cache.device_ingress(device)
    }

    fn discovery_mode(&self) -> DiscoveryMode {
        *self.mode.read()
    }

    fn set_discovery_mode(&self, mode: DiscoveryMode) {
        *self.mode.write() = mode;
        for (_, descriptions) in self.snapshot() {
            descriptions.lock().clear();
        }
        self.cache.clear();
        tracing::info!("Link discovery mode set to {:?}, cached links cleared", mode);
    }

    fn set_delegate(&self, delegate: Arc<dyn StoreDelegate<LinkEvent>>) {
        self.delegate.set(delegate);
    }

    async fn shutdown(&self) {
        self.descriptions.clear();
        self.tombstones.clear();
        self.cache.clear();
        tracing::info!("Gossip link store stopped");
    }
}

#[async_trait]
impl MessageHandler for GossipLinkStore {
    async fn handle(&self, message: ClusterMessage) -> Result<()> {
        tracing::trace!("Received {} from {}", message.subject, message.sender);
        match message.subject.as_str() {
            subjects::LINK_UPDATE => self.handle_update(message.decode()?).await,
            subjects::LINK_REMOVED => self.handle_removed(message.decode()?).await,
            subjects::LINK_INJECTED => {
                let injected: LinkInjectedEvent = message.decode()?;
                self.handle_injected(&message.sender, injected).await;
            }
            subjects::LINK_ANTI_ENTROPY_ADVERTISEMENT => {
                return self.handle_advertisement(message.decode()?).await;
            }
            other => tracing::debug!("Unexpected subject {} for link store", other),
        }
        Ok(())
    }
}

#[async_trait]
impl AntiEntropy for GossipLinkStore {
    fn name(&self) -> &str {
        "gossip-link-store"
    }

    async fn anti_entropy_tick(&self) -> Result<()> {
        match self.membership.random_peer().await {
            Some(peer) => self.send_advertisement(&peer).await,
            None => {
                tracing::trace!("No other peers in the cluster");
                Ok(())
            }
        }
    }
}
