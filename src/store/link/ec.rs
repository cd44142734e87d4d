//! Eventually-consistent-map Link Store
//!
//! Same contract as the gossip store, with replication delegated to an
//! [`EventuallyConsistentMap`] of whole description maps. The destination
//! device's master is the only writer of a key, so the map's
//! last-writer-wins rule never discards a merge.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::Arc;

use super::messages::LinkInjectedEvent;
use super::{
    ConnectPoint, DescriptionMap, DiscoveryMode, Link, LinkCache, LinkDescription, LinkEvent, LinkKey, LinkStore,
    ProviderId,
};
use crate::cluster::{ClusterMembership, DeviceClockService, DeviceId, NodeId};
use crate::error::{Error, Result};
use crate::network::{subjects, ClusterMessage, MessageDispatcher, MessageHandler};
use crate::store::primitives::{EcMapEvent, EcMapListener, EventuallyConsistentMap, StripedLock};
use crate::store::router::{MastershipRouter, Route};
use crate::store::scheduler::AntiEntropy;
use crate::store::timestamp::Timestamped;
use crate::store::{DelegateSlot, StoreDelegate};

pub(super) const MAP_NAME: &str = "link-descriptions";

/// Cache and policy shared by the store and its map listener
struct LinkView {
    cache: LinkCache,
    mode: RwLock<DiscoveryMode>,
    delegate: DelegateSlot<LinkEvent>,
    locks: StripedLock,
}

impl LinkView {
    fn mode(&self) -> DiscoveryMode {
        *self.mode.read()
    }
}

impl EcMapListener<LinkKey, DescriptionMap> for LinkView {
    fn event(&self, map: &EventuallyConsistentMap<LinkKey, DescriptionMap>, event: EcMapEvent<LinkKey, DescriptionMap>) {
        let key = event.key();
        // Refresh from the map, not the payload: a newer change of the key
        // may already be applied by another worker
        let link_event = {
            let _guard = self.locks.lock(key);
            match map.get(key) {
                Some(descriptions) => self.cache.refresh(key, &descriptions, self.mode()),
                None => self.cache.remove(key),
            }
        };
        self.delegate.notify_if_some(link_event);
    }
}

/// Link store backed by an eventually consistent map
pub struct EcLinkStore {
    map: Arc<EventuallyConsistentMap<LinkKey, DescriptionMap>>,
    view: Arc<LinkView>,
    router: MastershipRouter,
    clock: Arc<DeviceClockService>,
}

impl EcLinkStore {
    pub fn new(
        router: MastershipRouter,
        clock: Arc<DeviceClockService>,
        membership: Arc<ClusterMembership>,
        mode: DiscoveryMode,
    ) -> Arc<Self> {
        let map = EventuallyConsistentMap::new(MAP_NAME, Arc::clone(router.communicator()), membership);
        let view = Arc::new(LinkView {
            cache: LinkCache::new(),
            mode: RwLock::new(mode),
            delegate: DelegateSlot::default(),
            locks: StripedLock::default(),
        });
        map.add_listener(Arc::clone(&view) as Arc<dyn EcMapListener<LinkKey, DescriptionMap>>);

        Arc::new(Self {
            map,
            view,
            router,
            clock,
        })
    }

    pub fn register(self: &Arc<Self>, dispatcher: &MessageDispatcher) {
        self.map.register(dispatcher);
        dispatcher.register(subjects::LINK_INJECTED, Arc::clone(self) as Arc<dyn MessageHandler>);
    }

    pub fn unregister(&self, dispatcher: &MessageDispatcher) {
        self.map.unregister(dispatcher);
        dispatcher.unregister(subjects::LINK_INJECTED);
    }

    /// The map's repair round, for the anti-entropy scheduler
    pub fn anti_entropy(&self) -> Arc<dyn AntiEntropy> {
        Arc::clone(&self.map) as Arc<dyn AntiEntropy>
    }

    async fn apply_local_update(
        &self,
        provider: &ProviderId,
        description: LinkDescription,
    ) -> Result<Option<LinkEvent>> {
        let key = description.key();
        let timestamp = match self.clock.timestamp(&description.dst.device) {
            Ok(timestamp) => timestamp,
            Err(e) => {
                tracing::debug!("Dropping update of link {}: {}", key, e);
                return Ok(None);
            }
        };

        let (event, update) = {
            let _guard = self.view.locks.lock(&key);
            if let Some(removed) = self.map.tombstone(&key) {
                if !timestamp.is_newer_than(&removed) {
                    tracing::trace!("Link {} was already removed at {}, ignoring", key, removed);
                    return Ok(None);
                }
            }

            let mut descriptions = self.map.get(&key).unwrap_or_default();
            if !descriptions.merge(provider, Timestamped::new(description, timestamp)) {
                return Ok(None);
            }
            let Some(update) = self.map.put(key.clone(), descriptions.clone(), timestamp) else {
                return Ok(None);
            };
            (self.view.cache.refresh(&key, &descriptions, self.view.mode()), update)
        };

        self.map.broadcast(vec![update]).await;
        Ok(event)
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
            Ok(event) => self.view.delegate.notify_if_some(event),
            Err(e) => tracing::warn!("Failed to apply injected link from {}: {}", sender, e),
        }
    }
}

#[async_trait]
impl LinkStore for EcLinkStore {
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
                tracing::debug!("Failed to remove link {}, not the master", key);
                return Ok(None);
            }
        };

        let (event, update) = {
            let _guard = self.view.locks.lock(&key);
            let Some(update) = self.map.remove(&key, timestamp) else {
                return Ok(None);
            };
            (self.view.cache.remove(&key), update)
        };
        self.map.broadcast(vec![update]).await;
        Ok(event)
    }

    async fn remove_or_down_link(&self, src: &ConnectPoint, dst: &ConnectPoint) -> Result<Option<LinkEvent>> {
        let key = LinkKey::new(src.clone(), dst.clone());
        let Some(link) = self.view.cache.get(&key) else {
            return Ok(None);
        };
        if link.is_durable || link.is_expected {
            let _guard = self.view.locks.lock(&key);
            return Ok(self.view.cache.deactivate(&key));
        }
        self.remove_link(src, dst).await
    }

    fn link(&self, src: &ConnectPoint, dst: &ConnectPoint) -> Option<Link> {
        self.view.cache.get(&LinkKey::new(src.clone(), dst.clone()))
    }

    fn links(&self) -> Vec<Link> {
        self.view.cache.links()
    }

    fn link_count(&self) -> usize {
        self.view.cache.len()
    }

    fn egress_links(&self, src: &ConnectPoint) -> Vec<Link> {
        self.view.cache.egress(src)
    }

    fn ingress_links(&self, dst: &ConnectPoint) -> Vec<Link> {
        self.view.cache.ingress(dst)
    }

    fn device_egress_links(&self, device: &DeviceId) -> Vec<Link> {
        self.view.cache.device_egress(device)
    }

    fn device_ingress_links(&self, device: &DeviceId) -> Vec<Link> {
        self.view.cache.device_ingress(device)
    }

    fn discovery_mode(&self) -> DiscoveryMode {
        self.view.mode()
    }

    fn set_discovery_mode(&self, mode: DiscoveryMode) {
        *self.view.mode.write() = mode;
        self.map.clear_local();
        self.view.cache.clear();
        tracing::info!("Link discovery mode set to {:?}, cached links cleared", mode);
    }

    fn set_delegate(&self, delegate: Arc<dyn StoreDelegate<LinkEvent>>) {
        self.view.delegate.set(delegate);
    }

    async fn shutdown(&self) {
        self.map.clear();
        self.view.cache.clear();
        tracing::info!("Eventually consistent link store stopped");
    }
}

#[async_trait]
impl MessageHandler for EcLinkStore {
    async fn handle(&self, message: ClusterMessage) -> Result<()> {
        if message.subject == subjects::LINK_INJECTED {
            let injected: LinkInjectedEvent = message.decode()?;
            self.handle_injected(&message.sender, injected).await;
        }
        Ok(())
    }
}
