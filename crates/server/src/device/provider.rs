//! Device registry keyed by bus id
//!
//! The provider owns every exportable device and enforces exclusive attach:
//! [`DeviceProvider::attach`] hands out an [`Attachment`] guard and the device
//! stays unavailable until the guard is dropped.

use super::{ImportError, UsbIpDevice};
use parking_lot::Mutex;
use protocol::ExportedDevice;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

struct Entry {
    device: Arc<dyn UsbIpDevice>,
    attached: bool,
}

/// Registry of exportable devices
#[derive(Default)]
pub struct DeviceProvider {
    devices: Mutex<BTreeMap<String, Entry>>,
}

impl DeviceProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Add a device under its bus id, replacing any previous registration
    pub fn register(&self, device: Arc<dyn UsbIpDevice>) {
        let bus_id = device.bus_id().to_string();
        let entry = Entry {
            device,
            attached: false,
        };
        if self.devices.lock().insert(bus_id.clone(), entry).is_some() {
            debug!("Replaced device registration for {}", bus_id);
        }
        info!("Registered device {}", bus_id);
    }

    /// Remove a device; an outstanding [`Attachment`] keeps its handle alive
    pub fn unregister(&self, bus_id: &str) -> Option<Arc<dyn UsbIpDevice>> {
        let removed = self.devices.lock().remove(bus_id).map(|e| e.device);
        if removed.is_some() {
            info!("Unregistered device {}", bus_id);
        }
        removed
    }

    pub fn get(&self, bus_id: &str) -> Option<Arc<dyn UsbIpDevice>> {
        self.devices
            .lock()
            .get(bus_id)
            .map(|e| Arc::clone(&e.device))
    }

    /// Device advertised in OP_REP_DEVLIST: the first by bus id order
    ///
    /// Attach state does not hide a device from the list; importing an
    /// attached device is refused instead.
    pub fn exported(&self) -> Option<ExportedDevice> {
        let devices = self.devices.lock();
        devices.values().next().map(|e| {
            ExportedDevice::new(e.device.descriptor().clone(), e.device.interfaces())
        })
    }

    /// Claim exclusive use of the device at `bus_id`
    pub fn attach(self: &Arc<Self>, bus_id: &str) -> Result<Attachment, ImportError> {
        let device = {
            let mut devices = self.devices.lock();
            let entry = devices
                .get_mut(bus_id)
                .ok_or_else(|| ImportError::UnknownBusId(bus_id.to_string()))?;
            if entry.attached {
                return Err(ImportError::DeviceAlreadyAttached(bus_id.to_string()));
            }
            entry.attached = true;
            Arc::clone(&entry.device)
        };

        debug!("Attached device {}", bus_id);
        Ok(Attachment {
            provider: Arc::clone(self),
            bus_id: bus_id.to_string(),
            device,
        })
    }

    pub fn is_attached(&self, bus_id: &str) -> bool {
        self.devices
            .lock()
            .get(bus_id)
            .is_some_and(|e| e.attached)
    }

    pub fn bus_ids(&self) -> Vec<String> {
        self.devices.lock().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.devices.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.lock().is_empty()
    }

    fn release(&self, bus_id: &str, device: &Arc<dyn UsbIpDevice>) {
        let mut devices = self.devices.lock();
        // a re-registered device under the same bus id is a different attach slot
        if let Some(entry) = devices.get_mut(bus_id)
            && Arc::ptr_eq(&entry.device, device)
        {
            entry.attached = false;
            debug!("Released device {}", bus_id);
        }
    }
}

/// Exclusive claim on a device; releases the device when dropped
pub struct Attachment {
    provider: Arc<DeviceProvider>,
    bus_id: String,
    device: Arc<dyn UsbIpDevice>,
}

impl Attachment {
    pub fn device(&self) -> &Arc<dyn UsbIpDevice> {
        &self.device
    }

    pub fn bus_id(&self) -> &str {
        &self.bus_id
    }
}

impl std::fmt::Debug for Attachment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Attachment")
            .field("bus_id", &self.bus_id)
            .finish()
    }
}

impl Drop for Attachment {
    fn drop(&mut self) {
        self.provider.release(&self.bus_id, &self.device);
    }
}
