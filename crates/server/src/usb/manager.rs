//! Host device enumeration
//!
//! Scans the libusb device list once, applies the configured `VID:PID`
//! filters and registers the surviving devices with a [`DeviceProvider`].

use crate::device::DeviceProvider;
use crate::usb::device::{HostDevice, bus_id_of};
use rusb::{Context, Device, UsbContext};
use std::sync::Arc;
use tracing::{debug, info, warn};

const LINUX_FOUNDATION_VID: u16 = 0x1d6b;
const HUB_CLASS: u8 = 0x09;

/// Summary of a host device, as printed by `--list-devices`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostDeviceInfo {
    pub bus_id: String,
    pub vendor_id: u16,
    pub product_id: u16,
    pub class: u8,
    pub allowed: bool,
}

impl std::fmt::Display for HostDeviceInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:<12} {:04x}:{:04x} class {:#04x}{}",
            self.bus_id,
            self.vendor_id,
            self.product_id,
            self.class,
            if self.allowed { "" } else { " (filtered)" }
        )
    }
}

/// Selects exportable host devices
pub struct HostEnumerator {
    context: Context,
    filters: Vec<String>,
}

impl HostEnumerator {
    pub fn new(filters: Vec<String>) -> Result<Self, rusb::Error> {
        Ok(Self {
            context: Context::new()?,
            filters,
        })
    }

    /// Every non-root-hub device on the host, with its filter verdict
    pub fn list(&self) -> Result<Vec<HostDeviceInfo>, rusb::Error> {
        let mut infos = Vec::new();
        for device in self.context.devices()?.iter() {
            let desc = match device.device_descriptor() {
                Ok(desc) => desc,
                Err(e) => {
                    debug!("Skipping device without descriptor: {}", e);
                    continue;
                }
            };
            if is_root_hub(desc.vendor_id(), desc.class_code()) {
                continue;
            }
            infos.push(HostDeviceInfo {
                bus_id: bus_id_of(&device),
                vendor_id: desc.vendor_id(),
                product_id: desc.product_id(),
                class: desc.class_code(),
                allowed: check_filter(desc.vendor_id(), desc.product_id(), &self.filters),
            });
        }
        infos.sort_by(|a, b| a.bus_id.cmp(&b.bus_id));
        Ok(infos)
    }

    /// Register every allowed device with `provider`; returns how many were added
    pub fn register_all(&self, provider: &DeviceProvider) -> Result<usize, rusb::Error> {
        let mut registered = 0;
        for device in self.context.devices()?.iter() {
            if !self.is_device_allowed(&device) {
                continue;
            }
            match HostDevice::new(device) {
                Ok(host) => {
                    provider.register(host);
                    registered += 1;
                }
                Err(e) => warn!("Failed to prepare host device: {}", e),
            }
        }

        info!("Registered {} host devices", registered);
        Ok(registered)
    }

    fn is_device_allowed(&self, device: &Device<Context>) -> bool {
        let Ok(desc) = device.device_descriptor() else {
            return false;
        };

        // Root hubs can't be shared via USB/IP
        if is_root_hub(desc.vendor_id(), desc.class_code()) {
            debug!(
                "Skipping root hub: bus={}, addr={}",
                device.bus_number(),
                device.address()
            );
            return false;
        }

        let allowed = check_filter(desc.vendor_id(), desc.product_id(), &self.filters);
        if !allowed {
            debug!(
                "Device ignored by filter: bus={}, addr={}, vid={:#x}, pid={:#x}",
                device.bus_number(),
                device.address(),
                desc.vendor_id(),
                desc.product_id()
            );
        }
        allowed
    }
}

fn is_root_hub(vendor_id: u16, class: u8) -> bool {
    vendor_id == LINUX_FOUNDATION_VID && class == HUB_CLASS
}

/// Check a VID/PID pair against `0xVID:0xPID` filters (`*` matches any)
///
/// An empty filter list allows every device.
pub fn check_filter(vid: u16, pid: u16, filters: &[String]) -> bool {
    if filters.is_empty() {
        return true;
    }

    filters.iter().any(|filter| {
        let Some((filter_vid, filter_pid)) = filter.split_once(':') else {
            return false;
        };
        matches_id(filter_vid, vid) && matches_id(filter_pid, pid)
    })
}

fn matches_id(pattern: &str, id: u16) -> bool {
    pattern == "*"
        || u16::from_str_radix(pattern.trim_start_matches("0x"), 16).is_ok_and(|v| v == id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_logic() {
        let filters = vec!["0x1234:0x5678".to_string(), "0xabcd:*".to_string()];

        assert!(check_filter(0x1234, 0x5678, &filters));
        assert!(check_filter(0xABCD, 0x1111, &filters));
        assert!(check_filter(0xABCD, 0x9999, &filters));

        assert!(!check_filter(0x1234, 0x9999, &filters)); // Wrong PID
        assert!(!check_filter(0x9999, 0x5678, &filters)); // Wrong VID
        assert!(!check_filter(0x0000, 0x0000, &filters));

        // Empty filters = allow all
        assert!(check_filter(0x1234, 0x5678, &[]));
    }

    #[test]
    fn test_malformed_filter_matches_nothing() {
        let filters = vec!["0x1234".to_string()];
        assert!(!check_filter(0x1234, 0x5678, &filters));
    }

    #[test]
    fn test_root_hub_detection() {
        assert!(is_root_hub(0x1d6b, 0x09));
        assert!(!is_root_hub(0x1d6b, 0xff));
        assert!(!is_root_hub(0x046d, 0x09));
    }

    #[test]
    fn test_device_info_display() {
        let info = HostDeviceInfo {
            bus_id: "1-2".to_string(),
            vendor_id: 0x046d,
            product_id: 0xc52b,
            class: 0,
            allowed: false,
        };
        let line = info.to_string();
        assert!(line.contains("046d:c52b"));
        assert!(line.ends_with("(filtered)"));
    }
}
