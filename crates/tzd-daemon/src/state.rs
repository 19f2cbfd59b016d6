//! Shared daemon state.
//!
//! Owns the process-wide tables: the devices opened at start-up and which
//! client connection is bound to which device. Every listener and command
//! processor reaches them through one [`SharedContext`].

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use tracing::{debug, info};
use tzd_core::DeviceId;

use crate::connection::{ConnectionId, SharedConnection};
use crate::device::Device;

/// Shared daemon state.
pub type SharedContext = Arc<DaemonContext>;

/// Daemon-wide state.
pub struct DaemonContext {
    devices: BTreeMap<DeviceId, Arc<dyn Device>>,
    bindings: Mutex<HashMap<ConnectionId, DeviceId>>,
    shutdown: Arc<AtomicBool>,
    started_at: Instant,
}

impl DaemonContext {
    /// Creates the context over the devices opened at start-up.
    #[must_use]
    pub fn new(devices: impl IntoIterator<Item = Arc<dyn Device>>) -> Self {
        Self {
            devices: devices
                .into_iter()
                .map(|device| (device.id(), device))
                .collect(),
            bindings: Mutex::new(HashMap::new()),
            shutdown: Arc::new(AtomicBool::new(false)),
            started_at: Instant::now(),
        }
    }

    fn bindings(&self) -> MutexGuard<'_, HashMap<ConnectionId, DeviceId>> {
        self.bindings.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Looks up a device by id.
    #[must_use]
    pub fn device(&self, id: DeviceId) -> Option<Arc<dyn Device>> {
        self.devices.get(&id).cloned()
    }

    /// Device the connection is bound to.
    #[must_use]
    pub fn device_for(&self, connection: ConnectionId) -> Option<Arc<dyn Device>> {
        let id = *self.bindings().get(&connection)?;
        self.device(id)
    }

    /// Whether the connection is bound to any device.
    #[must_use]
    pub fn is_bound(&self, connection: ConnectionId) -> bool {
        self.bindings().contains_key(&connection)
    }

    /// Binds a connection to a device.
    ///
    /// Returns `false` if the connection is already bound.
    pub fn bind(&self, connection: ConnectionId, device: DeviceId) -> bool {
        let mut bindings = self.bindings();
        if bindings.contains_key(&connection) {
            return false;
        }
        bindings.insert(connection, device);
        true
    }

    /// Removes a binding, returning the device it pointed at.
    pub fn unbind(&self, connection: ConnectionId) -> Option<Arc<dyn Device>> {
        let id = self.bindings().remove(&connection)?;
        self.device(id)
    }

    /// Number of bound connections.
    #[must_use]
    pub fn bound_connections(&self) -> usize {
        self.bindings().len()
    }

    /// Releases everything a departing connection holds.
    ///
    /// If the connection was bound to a device, the device closes every
    /// session the connection owns.
    pub fn drop_connection(&self, connection: &SharedConnection) {
        if let Some(device) = self.unbind(connection.id()) {
            debug!(connection = %connection.id(), device_id = %device.id(), "closing device for dropped connection");
            device.close(connection);
        }
    }

    /// Shutdown flag observed by every loop.
    #[must_use]
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Whether shutdown has been requested.
    #[must_use]
    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Requests shutdown.
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// Shuts every device down.
    pub fn shutdown_devices(&self) {
        self.bindings().clear();
        for device in self.devices.values() {
            device.shutdown();
        }
        info!(uptime_secs = self.uptime_secs(), "all devices stopped");
    }

    /// Seconds since the context was created.
    #[must_use]
    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
