//! usbip-bridge server
//!
//! Exports local USB devices over TCP using the USB/IP protocol, so a remote
//! Linux host can attach them with `usbip attach` (`vhci_hcd`).
//!
//! - [`device`]: device trait, registry with exclusive attach, transfer executor
//! - [`network`]: session state machine, connections and the `mio` reactor
//! - [`usb`]: libusb backend for physical devices
//! - [`config`]: TOML configuration
//! - [`testing`]: synthetic device for tests

pub mod config;
pub mod device;
pub mod network;
pub mod testing;
pub mod usb;

pub use config::ServerConfig;
pub use device::{Attachment, DeviceError, DeviceProvider, ImportError, UsbIpDevice};
pub use network::{ReactorConfig, ReactorHandle, ReactorStats};
