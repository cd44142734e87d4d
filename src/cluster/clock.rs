//! Device Clock Service
//!
//! Issues mastership-based logical timestamps. A timestamp is the device's
//! mastership term followed by a per-device sequence number, so a new master
//! always outranks everything issued by the previous one.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::{DeviceId, MastershipService};
use crate::error::{Error, Result};
use crate::store::timestamp::Timestamp;

/// Per-device logical clock, usable only on the device's master
pub struct DeviceClockService {
    mastership: Arc<dyn MastershipService>,
    sequences: DashMap<DeviceId, AtomicU64>,
}

impl DeviceClockService {
    /// Create a clock bound to a node's mastership view
    pub fn new(mastership: Arc<dyn MastershipService>) -> Self {
        Self {
            mastership,
            sequences: DashMap::new(),
        }
    }

    /// Issue the next timestamp for a device.
    ///
    /// Fails with [`Error::TimestampUnavailable`] when the local node is not
    /// the device's master, e.g. while mastership is being handed off.
    pub fn timestamp(&self, device: &DeviceId) -> Result<Timestamp> {
        if !self.mastership.is_local_master(device) {
            return Err(Error::TimestampUnavailable(device.to_string()));
        }
        let term = self
            .mastership
            .term_for(device)
            .ok_or_else(|| Error::TimestampUnavailable(device.to_string()))?;

        let sequence = self
            .sequences
            .entry(device.clone())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::SeqCst)
            + 1;

        Ok(Timestamp::new(term, sequence))
    }

    /// Whether a timestamp can currently be issued for the device
    pub fn is_timestamp_available(&self, device: &DeviceId) -> bool {
        self.mastership.is_local_master(device) && self.mastership.term_for(device).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{MastershipTable, NodeId};

    #[test]
    fn test_timestamps_increase_within_term() {
        let table = MastershipTable::new();
        let device = DeviceId::from("of:1");
        table.set_master(&device, &NodeId::from("node-1"));

        let clock = DeviceClockService::new(table.view(NodeId::from("node-1")));
        let t1 = clock.timestamp(&device).unwrap();
        let t2 = clock.timestamp(&device).unwrap();
        assert!(t2 > t1);
        assert_eq!(t1.term, 1);
    }

    #[test]
    fn test_new_term_dominates() {
        let table = MastershipTable::new();
        let device = DeviceId::from("of:1");
        table.set_master(&device, &NodeId::from("node-1"));

        let clock1 = DeviceClockService::new(table.view(NodeId::from("node-1")));
        let clock2 = DeviceClockService::new(table.view(NodeId::from("node-2")));
        for _ in 0..10 {
            clock1.timestamp(&device).unwrap();
        }
        let old = clock1.timestamp(&device).unwrap();

        table.set_master(&device, &NodeId::from("node-2"));
        let new = clock2.timestamp(&device).unwrap();
        assert!(new > old);
    }

    #[test]
    fn test_unavailable_when_not_master() {
        let table = MastershipTable::new();
        let device = DeviceId::from("of:1");
        let clock = DeviceClockService::new(table.view(NodeId::from("node-1")));

        assert!(!clock.is_timestamp_available(&device));
        assert!(matches!(
            clock.timestamp(&device),
            Err(Error::TimestampUnavailable(_))
        ));

        table.set_master(&device, &NodeId::from("node-2"));
        assert!(clock.timestamp(&device).is_err());
    }
}
