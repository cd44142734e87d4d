//! Eventually Consistent Map
//!
//! Last-writer-wins replicated map. Every write carries a [`Timestamp`];
//! a write is applied only when strictly newer than what the replica holds
//! for the key, removals leave tombstones, and local writes are broadcast
//! to peers. A periodic digest exchange repairs lost updates.
//!
//! Listeners are notified only for changes received from peers; local
//! writers compute their own consequences from the return value.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use crate::cluster::{ClusterMembership, NodeId};
use crate::error::Result;
use crate::network::{subjects, ClusterCommunicator, ClusterMessage, MessageDispatcher, MessageHandler};
use crate::store::scheduler::AntiEntropy;
use crate::store::timestamp::Timestamp;

/// A replicated write: a value, or a tombstone when `value` is `None`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MapUpdate<K, V> {
    pub key: K,
    pub value: Option<V>,
    pub timestamp: Timestamp,
}

/// Change applied from a peer
#[derive(Debug, Clone)]
pub enum EcMapEvent<K, V> {
    Put { key: K, value: V },
    Remove { key: K },
}

impl<K, V> EcMapEvent<K, V> {
    pub fn key(&self) -> &K {
        match self {
            EcMapEvent::Put { key, .. } | EcMapEvent::Remove { key } => key,
        }
    }
}

/// Observer of changes received from peers.
///
/// Listeners on different workers may observe the changes of one key out
/// of order. A listener deriving state from the map reads the key's
/// current value from `map` under its own per-key lock.
pub trait EcMapListener<K, V>: Send + Sync {
    fn event(&self, map: &EventuallyConsistentMap<K, V>, event: EcMapEvent<K, V>);
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Digest<K> {
    sender: NodeId,
    entries: Vec<(K, Timestamp, bool)>,
}

#[derive(Debug, Clone)]
struct Entry<V> {
    value: Option<V>,
    timestamp: Timestamp,
}

pub struct EventuallyConsistentMap<K, V> {
    name: String,
    items: DashMap<K, Entry<V>>,
    communicator: Arc<dyn ClusterCommunicator>,
    membership: Arc<ClusterMembership>,
    listeners: RwLock<Vec<Arc<dyn EcMapListener<K, V>>>>,
    update_subject: String,
    anti_entropy_subject: String,
}

impl<K, V> EventuallyConsistentMap<K, V>
where
    K: Clone + Eq + Hash + Serialize + DeserializeOwned + Send + Sync + 'static,
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(
        name: impl Into<String>,
        communicator: Arc<dyn ClusterCommunicator>,
        membership: Arc<ClusterMembership>,
    ) -> Arc<Self> {
        let name = name.into();
        Arc::new(Self {
            update_subject: subjects::ec_map_update(&name),
            anti_entropy_subject: subjects::ec_map_anti_entropy(&name),
            name,
            items: DashMap::new(),
            communicator,
            membership,
            listeners: RwLock::new(Vec::new()),
        })
    }

    /// Register the map's message handlers
    pub fn register(self: &Arc<Self>, dispatcher: &MessageDispatcher) {
        dispatcher.register(self.update_subject.clone(), Arc::clone(self) as Arc<dyn MessageHandler>);
        dispatcher.register_background(
            self.anti_entropy_subject.clone(),
            Arc::clone(self) as Arc<dyn MessageHandler>,
        );
    }

    pub fn unregister(&self, dispatcher: &MessageDispatcher) {
        dispatcher.unregister(&self.update_subject);
        dispatcher.unregister(&self.anti_entropy_subject);
    }

    pub fn add_listener(&self, listener: Arc<dyn EcMapListener<K, V>>) {
        self.listeners.write().push(listener);
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.items.get(key).and_then(|e| e.value.clone())
    }

    /// Timestamp of the latest write or tombstone for the key
    pub fn timestamp(&self, key: &K) -> Option<Timestamp> {
        self.items.get(key).map(|e| e.timestamp)
    }

    /// Timestamp of the key's tombstone, if it is currently removed
    pub fn tombstone(&self, key: &K) -> Option<Timestamp> {
        self.items
            .get(key)
            .filter(|e| e.value.is_none())
            .map(|e| e.timestamp)
    }

    pub fn entries(&self) -> Vec<(K, V)> {
        self.items
            .iter()
            .filter_map(|e| e.value().value.clone().map(|v| (e.key().clone(), v)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.items.iter().filter(|e| e.value().value.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Apply a local write. Returns the update to broadcast when applied.
    pub fn put(&self, key: K, value: V, timestamp: Timestamp) -> Option<MapUpdate<K, V>> {
        let update = MapUpdate {
            key,
            value: Some(value),
            timestamp,
        };
        self.apply(&update).then_some(update)
    }

    /// Apply a local removal. Returns the update to broadcast when applied.
    pub fn remove(&self, key: &K, timestamp: Timestamp) -> Option<MapUpdate<K, V>> {
        let update = MapUpdate {
            key: key.clone(),
            value: None,
            timestamp,
        };
        self.apply(&update).then_some(update)
    }

    /// Drop live entries of this replica, keeping tombstones
    pub fn clear_local(&self) {
        self.items.retain(|_, e| e.value.is_none());
    }

    /// Drop everything, tombstones included
    pub fn clear(&self) {
        self.items.clear();
    }

    /// Send applied local writes to every peer
    pub async fn broadcast(&self, updates: Vec<MapUpdate<K, V>>) {
        if updates.is_empty() {
            return;
        }
        let local = self.communicator.local_node().clone();
        let result = match ClusterMessage::new(local, self.update_subject.clone(), &updates) {
            Ok(message) => self.communicator.broadcast(message).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            tracing::warn!("Failed to broadcast {} updates of {}: {}", updates.len(), self.name, e);
        }
    }

    fn apply(&self, update: &MapUpdate<K, V>) -> bool {
        match self.items.entry(update.key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(mut existing) => {
                if !update.timestamp.is_newer_than(&existing.get().timestamp) {
                    return false;
                }
                existing.insert(Entry {
                    value: update.value.clone(),
                    timestamp: update.timestamp,
                });
                true
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Entry {
                    value: update.value.clone(),
                    timestamp: update.timestamp,
                });
                true
            }
        }
    }

    fn apply_remote(&self, updates: Vec<MapUpdate<K, V>>) {
        let mut events = Vec::new();
        for update in updates {
            if self.apply(&update) {
                events.push(match update.value {
                    Some(value) => EcMapEvent::Put {
                        key: update.key,
                        value,
                    },
                    None => EcMapEvent::Remove { key: update.key },
                });
            }
        }

        let listeners: Vec<_> = self.listeners.read().iter().cloned().collect();
        for event in events {
            for listener in &listeners {
                listener.event(self, event.clone());
            }
        }
    }

    fn digest(&self) -> Digest<K> {
        Digest {
            sender: self.communicator.local_node().clone(),
            entries: self
                .items
                .iter()
                .map(|e| (e.key().clone(), e.value().timestamp, e.value().value.is_none()))
                .collect(),
        }
    }

    /// Send this replica's digest to one peer
    pub async fn send_digest(&self, peer: &NodeId) -> Result<()> {
        let local = self.communicator.local_node().clone();
        let message = ClusterMessage::new(local, self.anti_entropy_subject.clone(), &self.digest())?;
        self.communicator.unicast(message, peer).await
    }

    async fn handle_digest(&self, digest: Digest<K>) -> Result<()> {
        let remote: HashMap<K, Timestamp> = digest
            .entries
            .into_iter()
            .map(|(k, ts, _)| (k, ts))
            .collect();

        let mut newer_here = Vec::new();
        let mut local_outdated = false;
        for item in self.items.iter() {
            let entry = item.value();
            match remote.get(item.key()) {
                Some(theirs) if !entry.timestamp.is_newer_than(theirs) => {
                    if theirs.is_newer_than(&entry.timestamp) {
                        local_outdated = true;
                    }
                }
                _ => newer_here.push(MapUpdate {
                    key: item.key().clone(),
                    value: entry.value.clone(),
                    timestamp: entry.timestamp,
                }),
            }
        }
        if remote.keys().any(|k| !self.items.contains_key(k)) {
            local_outdated = true;
        }

        if !newer_here.is_empty() {
            tracing::trace!("{}: pushing {} entries to {}", self.name, newer_here.len(), digest.sender);
            let local = self.communicator.local_node().clone();
            let message = ClusterMessage::new(local, self.update_subject.clone(), &newer_here)?;
            self.communicator.unicast(message, &digest.sender).await?;
        }
        if local_outdated {
            self.send_digest(&digest.sender).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl<K, V> MessageHandler for EventuallyConsistentMap<K, V>
where
    K: Clone + Eq + Hash + Serialize + DeserializeOwned + Send + Sync + 'static,
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn handle(&self, message: ClusterMessage) -> Result<()> {
        if message.subject == self.update_subject {
            let updates: Vec<MapUpdate<K, V>> = message.decode()?;
            self.apply_remote(updates);
            Ok(())
        } else if message.subject == self.anti_entropy_subject {
            let digest: Digest<K> = message.decode()?;
            self.handle_digest(digest).await
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl<K, V> AntiEntropy for EventuallyConsistentMap<K, V>
where
    K: Clone + Eq + Hash + Serialize + DeserializeOwned + Send + Sync + 'static,
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn anti_entropy_tick(&self) -> Result<()> {
        match self.membership.random_peer().await {
            Some(peer) => self.send_digest(&peer).await,
            None => {
                tracing::trace!("{}: no other peers in the cluster", self.name);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::LocalHub;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<String>>);

    impl EcMapListener<String, u32> for Recorder {
        fn event(&self, _map: &EventuallyConsistentMap<String, u32>, event: EcMapEvent<String, u32>) {
            let line = match event {
                EcMapEvent::Put { key, value } => format!("put {}={}", key, value),
                EcMapEvent::Remove { key } => format!("remove {}", key),
            };
            self.0.lock().push(line);
        }
    }

    fn replica(hub: &Arc<LocalHub>, id: &str, peer: &str) -> Arc<EventuallyConsistentMap<String, u32>> {
        let membership = Arc::new(ClusterMembership::new(NodeId::from(id), String::new()));
        futures::executor::block_on(membership.add_peer(NodeId::from(peer), String::new()));
        EventuallyConsistentMap::new("test", hub.communicator(NodeId::from(id)), membership)
    }

    async fn deliver(hub: &LocalHub, replicas: &[(&str, &Arc<EventuallyConsistentMap<String, u32>>)]) {
        while let Some(envelope) = hub.take() {
            for (id, map) in replicas {
                if envelope.to.as_str() == *id {
                    map.handle(envelope.message.clone()).await.unwrap();
                }
            }
        }
    }

    #[test]
    fn test_last_writer_wins() {
        let hub = LocalHub::new();
        let map = replica(&hub, "node-1", "node-2");
        let key = "k".to_string();

        assert!(map.put(key.clone(), 1, Timestamp::new(1, 2)).is_some());
        assert!(map.put(key.clone(), 2, Timestamp::new(1, 1)).is_none());
        assert!(map.put(key.clone(), 3, Timestamp::new(1, 2)).is_none());
        assert_eq!(map.get(&key), Some(1));

        assert!(map.remove(&key, Timestamp::new(1, 3)).is_some());
        assert_eq!(map.tombstone(&key), Some(Timestamp::new(1, 3)));
        assert!(map.put(key.clone(), 4, Timestamp::new(1, 2)).is_none());
        assert!(map.put(key.clone(), 5, Timestamp::new(2, 0)).is_some());
        assert_eq!(map.tombstone(&key), None);
        assert_eq!(map.len(), 1);
    }

    #[tokio::test]
    async fn test_broadcast_notifies_remote_listeners() {
        let hub = LocalHub::new();
        let a = replica(&hub, "node-1", "node-2");
        let b = replica(&hub, "node-2", "node-1");
        let recorder = Arc::new(Recorder::default());
        b.add_listener(recorder.clone());

        let update = a.put("x".into(), 7, Timestamp::new(1, 1)).unwrap();
        a.broadcast(vec![update]).await;
        deliver(&hub, &[("node-1", &a), ("node-2", &b)]).await;

        assert_eq!(b.get(&"x".to_string()), Some(7));
        assert_eq!(*recorder.0.lock(), vec!["put x=7".to_string()]);
    }

    #[tokio::test]
    async fn test_anti_entropy_repairs_lost_updates() {
        let hub = LocalHub::new();
        let a = replica(&hub, "node-1", "node-2");
        let b = replica(&hub, "node-2", "node-1");

        // nothing is broadcast: both replicas diverge
        a.put("only-a".into(), 1, Timestamp::new(1, 1));
        a.put("gone".into(), 9, Timestamp::new(1, 1));
        b.put("gone".into(), 9, Timestamp::new(1, 1));
        b.remove(&"gone".to_string(), Timestamp::new(1, 5));
        b.put("only-b".into(), 2, Timestamp::new(1, 1));

        a.anti_entropy_tick().await.unwrap();
        deliver(&hub, &[("node-1", &a), ("node-2", &b)]).await;

        for map in [&a, &b] {
            assert_eq!(map.get(&"only-a".to_string()), Some(1));
            assert_eq!(map.get(&"only-b".to_string()), Some(2));
            assert_eq!(map.get(&"gone".to_string()), None);
        }
    }
}
