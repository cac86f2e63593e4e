//! Device abstraction
//!
//! A device exported over USB/IP is anything implementing [`UsbIpDevice`]:
//! it describes itself for OP_REP_DEVLIST / OP_REP_IMPORT and executes URBs
//! asynchronously, reporting completions through a [`CompletionSender`].
//!
//! Backends:
//! - [`crate::usb::HostDevice`]: a physical device driven through libusb
//! - [`crate::testing::MockDevice`]: deterministic test double
//!
//! Both run their transfers on [`TransferExecutor`] lanes, one worker thread
//! per endpoint.

pub mod executor;
pub mod provider;

pub use executor::{Cancellation, TransferExecutor, UrbHandler};
pub use provider::{Attachment, DeviceProvider};

use common::errno;
use common::{CompletionSender, SessionId, UnlinkOutcome, UrbRequest, UrbToken};
use protocol::{DeviceDescriptor, InterfaceDescriptor};
use thiserror::Error;

/// Capability set of an exportable USB device
pub trait UsbIpDevice: Send + Sync {
    /// Descriptor sent in OP_REP_DEVLIST and OP_REP_IMPORT
    fn descriptor(&self) -> &DeviceDescriptor;

    /// Interfaces of the active configuration, at most four are exported
    fn interfaces(&self) -> &[InterfaceDescriptor];

    /// Start a transfer and return immediately
    ///
    /// Exactly one completion is sent through `completions` unless the URB is
    /// cancelled by [`UsbIpDevice::unlink_urb`] first.
    fn submit_urb(
        &self,
        urb: UrbRequest,
        completions: CompletionSender,
    ) -> Result<UrbToken, DeviceError>;

    /// Request cancellation of the URB `seq_num` submitted by `session`
    fn unlink_urb(&self, session: SessionId, seq_num: u32) -> UnlinkOutcome;

    /// Bus id clients use in OP_REQ_IMPORT
    fn bus_id(&self) -> &str {
        &self.descriptor().bus_id
    }
}

/// Device backend errors
#[derive(Debug, Error)]
pub enum DeviceError {
    /// The worker thread is gone; no more URBs are accepted
    #[error("Device executor stopped")]
    Stopped,

    /// A URB with this sequence number is already queued or running
    #[error("URB {0} already in flight")]
    DuplicateUrb(u32),

    #[error("USB error: {0}")]
    Usb(#[from] rusb::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl DeviceError {
    /// URB status reported when a submission is refused
    pub fn urb_status(&self) -> i32 {
        match self {
            Self::Stopped => errno::status(errno::ESHUTDOWN),
            Self::DuplicateUrb(_) => errno::status(errno::EBUSY),
            Self::Usb(e) => crate::usb::transfers::map_rusb_error(*e),
            Self::Io(_) => errno::status(errno::EIO),
        }
    }
}

/// Errors answered with OP_REP_IMPORT(ERROR)
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ImportError {
    #[error("Unknown bus id: {0}")]
    UnknownBusId(String),

    #[error("Device {0} is already attached")]
    DeviceAlreadyAttached(String),
}
