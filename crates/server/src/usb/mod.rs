//! Host USB backend
//!
//! Exports physical devices through libusb (`rusb`):
//! - `manager`: enumeration and `VID:PID` filtering
//! - `device`: the [`HostDevice`] backend, one executor thread per device
//! - `transfers`: control, bulk and interrupt execution and errno mapping

pub mod device;
pub mod manager;
pub mod transfers;

pub use device::HostDevice;
pub use manager::{HostDeviceInfo, HostEnumerator, check_filter};
