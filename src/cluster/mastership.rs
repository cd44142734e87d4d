//! Device Mastership
//!
//! Answers "who masters device X now". The election algorithm itself is out
//! of scope; [`MastershipTable`] is an in-memory assignment that can be
//! populated from configuration, by an external elector or by tests, and is
//! shared by every in-process node that observes it.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use super::{DeviceId, NodeId};
use crate::config::MastershipEntry;

/// Role of the local node for a device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MastershipRole {
    /// Local node is the device's master
    Master,
    /// Another node masters the device
    Standby,
    /// No master is known for the device
    None,
}

/// Per-node view of device mastership
pub trait MastershipService: Send + Sync {
    /// The node this view belongs to
    fn local_node(&self) -> &NodeId;

    /// Current master of a device, if any
    fn master_for(&self, device: &DeviceId) -> Option<NodeId>;

    /// Current mastership term of a device, if any master is known
    fn term_for(&self, device: &DeviceId) -> Option<u64>;

    /// Role of the local node for a device
    fn local_role(&self, device: &DeviceId) -> MastershipRole {
        match self.master_for(device) {
            Some(master) if &master == self.local_node() => MastershipRole::Master,
            Some(_) => MastershipRole::Standby,
            None => MastershipRole::None,
        }
    }

    /// Whether the local node masters the device
    fn is_local_master(&self, device: &DeviceId) -> bool {
        self.local_role(device) == MastershipRole::Master
    }
}

#[derive(Debug, Clone)]
struct Assignment {
    master: Option<NodeId>,
    term: u64,
}

/// In-memory device -> (master, term) table
#[derive(Default)]
pub struct MastershipTable {
    assignments: RwLock<HashMap<DeviceId, Assignment>>,
}

impl MastershipTable {
    /// Create an empty table
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Create a table from static configuration entries
    pub fn from_entries(entries: &[MastershipEntry]) -> Arc<Self> {
        let table = Self::default();
        {
            let mut assignments = table.assignments.write();
            for entry in entries {
                assignments.insert(
                    DeviceId::new(entry.device.clone()),
                    Assignment {
                        master: Some(NodeId::new(entry.master.clone())),
                        term: entry.term,
                    },
                );
            }
        }
        Arc::new(table)
    }

    /// Hand a device over to a new master, starting a new term.
    /// Returns the new term.
    pub fn set_master(&self, device: &DeviceId, master: &NodeId) -> u64 {
        let mut assignments = self.assignments.write();
        let entry = assignments.entry(device.clone()).or_insert(Assignment {
            master: None,
            term: 0,
        });
        entry.term += 1;
        entry.master = Some(master.clone());
        tracing::debug!("Device {} mastered by {} (term {})", device, master, entry.term);
        entry.term
    }

    /// Relinquish mastership of a device (mid-handoff)
    pub fn clear_master(&self, device: &DeviceId) {
        if let Some(entry) = self.assignments.write().get_mut(device) {
            entry.master = None;
            tracing::debug!("Device {} has no master", device);
        }
    }

    /// Current master of a device
    pub fn master(&self, device: &DeviceId) -> Option<NodeId> {
        self.assignments
            .read()
            .get(device)
            .and_then(|a| a.master.clone())
    }

    /// Current term of a device, if mastered
    pub fn term(&self, device: &DeviceId) -> Option<u64> {
        self.assignments
            .read()
            .get(device)
            .filter(|a| a.master.is_some())
            .map(|a| a.term)
    }

    /// Devices known to the table and their masters
    pub fn assignments(&self) -> Vec<(DeviceId, Option<NodeId>, u64)> {
        let mut all: Vec<_> = self
            .assignments
            .read()
            .iter()
            .map(|(d, a)| (d.clone(), a.master.clone(), a.term))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    /// A view of this table from the perspective of one node
    pub fn view(self: &Arc<Self>, local: NodeId) -> Arc<dyn MastershipService> {
        Arc::new(MastershipView {
            local,
            table: Arc::clone(self),
        })
    }
}

struct MastershipView {
    local: NodeId,
    table: Arc<MastershipTable>,
}

impl MastershipService for MastershipView {
    fn local_node(&self) -> &NodeId {
        &self.local
    }

    fn master_for(&self, device: &DeviceId) -> Option<NodeId> {
        self.table.master(device)
    }

    fn term_for(&self, device: &DeviceId) -> Option<u64> {
        self.table.term(device)
    }
}
