//! Consistent Map
//!
//! Strongly consistent key/value map with versioned values and change
//! listeners. [`InMemoryConsistentMap`] is a linearizable in-process
//! implementation; every node sharing the same `Arc` observes the same
//! state and receives every change event.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// A value and the map version it was written at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned<V> {
    pub value: V,
    pub version: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapEventType {
    Insert,
    Update,
    Remove,
}

/// A change applied to the map
#[derive(Debug, Clone)]
pub struct MapEvent<K, V> {
    pub event_type: MapEventType,
    pub key: K,
    pub new_value: Option<Versioned<V>>,
    pub old_value: Option<Versioned<V>>,
}

/// Receives every change applied to a map
pub trait MapEventListener<K, V>: Send + Sync {
    fn event(&self, event: &MapEvent<K, V>);
}

/// Handle returned by listener registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Strongly consistent map contract
pub trait ConsistentMap<K, V>: Send + Sync {
    fn get(&self, key: &K) -> Option<Versioned<V>>;

    /// Store a value, returning the previous one
    fn put(&self, key: K, value: V) -> Option<Versioned<V>>;

    /// Remove a key, returning the removed value
    fn remove(&self, key: &K) -> Option<Versioned<V>>;

    fn contains_key(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    fn entries(&self) -> Vec<(K, Versioned<V>)>;

    fn values(&self) -> Vec<V> {
        self.entries().into_iter().map(|(_, v)| v.value).collect()
    }

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn add_listener(&self, listener: Arc<dyn MapEventListener<K, V>>) -> ListenerId;

    fn remove_listener(&self, id: ListenerId);
}

pub struct InMemoryConsistentMap<K, V> {
    name: String,
    entries: RwLock<HashMap<K, Versioned<V>>>,
    version: AtomicU64,
    listeners: RwLock<Vec<(ListenerId, Arc<dyn MapEventListener<K, V>>)>>,
    next_listener: AtomicU64,
    // Serializes mutation + notification so listeners see changes in order
    write_order: Mutex<()>,
}

impl<K, V> InMemoryConsistentMap<K, V>
where
    K: Clone + Eq + Hash + Send + Sync,
    V: Clone + Send + Sync,
{
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            entries: RwLock::new(HashMap::new()),
            version: AtomicU64::new(0),
            listeners: RwLock::new(Vec::new()),
            next_listener: AtomicU64::new(1),
            write_order: Mutex::new(()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn notify(&self, event: MapEvent<K, V>) {
        let listeners: Vec<_> = self.listeners.read().iter().map(|(_, l)| Arc::clone(l)).collect();
        for listener in listeners {
            listener.event(&event);
        }
    }
}

impl<K, V> ConsistentMap<K, V> for InMemoryConsistentMap<K, V>
where
    K: Clone + Eq + Hash + Send + Sync,
    V: Clone + Send + Sync,
{
    fn get(&self, key: &K) -> Option<Versioned<V>> {
        self.entries.read().get(key).cloned()
    }

    fn put(&self, key: K, value: V) -> Option<Versioned<V>> {
        let _order = self.write_order.lock();
        let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        let new_value = Versioned { value, version };
        let old_value = self.entries.write().insert(key.clone(), new_value.clone());

        let event_type = if old_value.is_some() {
            MapEventType::Update
        } else {
            MapEventType::Insert
        };
        self.notify(MapEvent {
            event_type,
            key,
            new_value: Some(new_value),
            old_value: old_value.clone(),
        });
        old_value
    }

    fn remove(&self, key: &K) -> Option<Versioned<V>> {
        let _order = self.write_order.lock();
        let old_value = self.entries.write().remove(key);
        if let Some(ref old) = old_value {
            self.notify(MapEvent {
                event_type: MapEventType::Remove,
                key: key.clone(),
                new_value: None,
                old_value: Some(old.clone()),
            });
        }
        old_value
    }

    fn entries(&self) -> Vec<(K, Versioned<V>)> {
        self.entries
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    fn len(&self) -> usize {
        self.entries.read().len()
    }

    fn add_listener(&self, listener: Arc<dyn MapEventListener<K, V>>) -> ListenerId {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::SeqCst));
        self.listeners.write().push((id, listener));
        id
    }

    fn remove_listener(&self, id: ListenerId) {
        self.listeners.write().retain(|(l, _)| *l != id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<(MapEventType, String)>>);

    impl MapEventListener<String, u32> for Recorder {
        fn event(&self, event: &MapEvent<String, u32>) {
            self.0.lock().push((event.event_type, event.key.clone()));
        }
    }

    #[test]
    fn test_versions_and_events() {
        let map = InMemoryConsistentMap::<String, u32>::new("test");
        let recorder = Arc::new(Recorder::default());
        let id = map.add_listener(recorder.clone());

        assert!(map.put("a".into(), 1).is_none());
        let old = map.put("a".into(), 2).unwrap();
        assert_eq!(old.value, 1);
        assert!(map.get(&"a".to_string()).unwrap().version > old.version);
        assert_eq!(map.remove(&"a".to_string()).unwrap().value, 2);
        assert!(map.remove(&"a".to_string()).is_none());

        assert_eq!(
            *recorder.0.lock(),
            vec![
                (MapEventType::Insert, "a".to_string()),
                (MapEventType::Update, "a".to_string()),
                (MapEventType::Remove, "a".to_string()),
            ]
        );

        map.remove_listener(id);
        map.put("b".into(), 1);
        assert_eq!(recorder.0.lock().len(), 3);
        assert_eq!(map.len(), 1);
    }
}
