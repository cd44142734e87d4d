//! Mastership-routed Write Router
//!
//! Decides whether a write for a device is applied locally or forwarded to
//! the device's master. Forwarding is fire-and-forget: a transport failure
//! is logged and reported, never retried here.

use serde::Serialize;
use std::sync::Arc;

use crate::cluster::{DeviceId, MastershipService, NodeId};
use crate::error::{Error, Result};
use crate::network::{ClusterCommunicator, ClusterMessage};

/// Where a write for a device must be applied
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// The local node masters the device
    Local,
    /// Another node masters the device
    Remote(NodeId),
    /// Nobody masters the device right now
    NoMaster,
}

pub struct MastershipRouter {
    communicator: Arc<dyn ClusterCommunicator>,
    mastership: Arc<dyn MastershipService>,
}

impl MastershipRouter {
    pub fn new(communicator: Arc<dyn ClusterCommunicator>, mastership: Arc<dyn MastershipService>) -> Self {
        Self {
            communicator,
            mastership,
        }
    }

    pub fn local_node(&self) -> &NodeId {
        self.communicator.local_node()
    }

    pub fn mastership(&self) -> &Arc<dyn MastershipService> {
        &self.mastership
    }

    pub fn communicator(&self) -> &Arc<dyn ClusterCommunicator> {
        &self.communicator
    }

    pub fn route(&self, device: &DeviceId) -> Route {
        match self.mastership.master_for(device) {
            Some(master) if &master == self.communicator.local_node() => Route::Local,
            Some(master) => Route::Remote(master),
            None => Route::NoMaster,
        }
    }

    /// Resolve the route, turning "no master" into an error
    pub fn route_or_fail(&self, device: &DeviceId, operation: &str) -> Result<Route> {
        match self.route(device) {
            Route::NoMaster => {
                tracing::warn!("No master for device {}, dropping {}", device, operation);
                Err(Error::NoMaster(device.to_string()))
            }
            route => Ok(route),
        }
    }

    /// Forward an operation to the device's master
    pub async fn forward<T: Serialize + Sync>(
        &self,
        device: &DeviceId,
        master: &NodeId,
        subject: &str,
        payload: &T,
    ) -> Result<()> {
        let message = ClusterMessage::new(self.local_node().clone(), subject, payload)?;
        match self.communicator.unicast(message, master).await {
            Ok(()) => {
                tracing::debug!("Forwarded {} for device {} to master {}", subject, device, master);
                Ok(())
            }
            Err(e) => {
                tracing::warn!(
                    "Failed to forward {} for device {} to master {}: {}",
                    subject,
                    device,
                    master,
                    e
                );
                Err(e)
            }
        }
    }

    /// Whether a forwarded operation may be applied here: only when the
    /// local node is (by now) the device's master
    pub fn accepts_forwarded(&self, device: &DeviceId, sender: &NodeId) -> bool {
        if self.mastership.is_local_master(device) {
            return true;
        }
        tracing::warn!(
            "Ignoring request from {} for device {}: this node is not its master",
            sender,
            device
        );
        false
    }
}
