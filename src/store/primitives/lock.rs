//! Striped key locks
//!
//! Serializes work per key without one global lock: keys hash onto a fixed
//! set of mutexes, so unrelated keys rarely contend.

use parking_lot::{Mutex, MutexGuard};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

const DEFAULT_STRIPES: usize = 64;

pub struct StripedLock {
    stripes: Vec<Mutex<()>>,
}

impl StripedLock {
    pub fn new(stripes: usize) -> Self {
        Self {
            stripes: (0..stripes.max(1)).map(|_| Mutex::new(())).collect(),
        }
    }

    /// Lock the stripe owning `key`. Not re-entrant.
    pub fn lock<K: Hash + ?Sized>(&self, key: &K) -> MutexGuard<'_, ()> {
        self.stripes[self.index(key)].lock()
    }

    fn index<K: Hash + ?Sized>(&self, key: &K) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() as usize) % self.stripes.len()
    }
}

impl Default for StripedLock {
    fn default() -> Self {
        Self::new(DEFAULT_STRIPES)
    }
}
