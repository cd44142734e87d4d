//! Replicated Stores
//!
//! The link store (gossip or eventually-consistent-map backed) and the
//! mastership-routed group store, plus the pieces they share.

pub mod group;
pub mod link;
pub mod primitives;
pub mod router;
pub mod scheduler;
pub mod timestamp;

pub use router::{MastershipRouter, Route};
pub use scheduler::{AntiEntropy, AntiEntropyScheduler};
pub use timestamp::{Timestamp, Timestamped};

use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Receiver of store events (topology or forwarding subsystem)
pub trait StoreDelegate<E>: Send + Sync {
    fn notify(&self, event: E);
}

impl<E: Send> StoreDelegate<E> for mpsc::UnboundedSender<E> {
    fn notify(&self, event: E) {
        if self.send(event).is_err() {
            tracing::trace!("Store delegate receiver dropped");
        }
    }
}

/// Optional delegate slot shared by a store and its listeners
pub struct DelegateSlot<E> {
    delegate: RwLock<Option<Arc<dyn StoreDelegate<E>>>>,
}

impl<E> Default for DelegateSlot<E> {
    fn default() -> Self {
        Self {
            delegate: RwLock::new(None),
        }
    }
}

impl<E> DelegateSlot<E> {
    pub fn set(&self, delegate: Arc<dyn StoreDelegate<E>>) {
        *self.delegate.write() = Some(delegate);
    }

    pub fn unset(&self) {
        *self.delegate.write() = None;
    }

    pub fn notify(&self, event: E) {
        let delegate = self.delegate.read().clone();
        if let Some(delegate) = delegate {
            delegate.notify(event);
        }
    }

    pub fn notify_if_some(&self, event: Option<E>) {
        if let Some(event) = event {
            self.notify(event);
        }
    }
}
