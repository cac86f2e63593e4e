//! USB transfer execution
//!
//! This module executes URBs (control, bulk, interrupt) against a libusb
//! handle using rusb. It runs on the executor lane of the URB's endpoint and
//! maps rusb errors to the negative errno values USB/IP carries in URB status.
//!
//! IN transfers on bulk and interrupt endpoints complete only when the device
//! sends data, fails, or the URB is unlinked. libusb is polled in short slices
//! so an unlink can end the wait.

use byteorder::{ByteOrder, LittleEndian};
use common::errno;
use crate::device::Cancellation;
use common::{UrbCompletion, UrbRequest};
use rusb::{Context, DeviceHandle, TransferType};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

/// Default timeout for control and OUT transfers (5 seconds)
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Slice of a bulk/interrupt IN wait between unlink checks
const IN_POLL_INTERVAL: Duration = Duration::from_millis(250);

const REQ_CLEAR_FEATURE: u8 = 0x01;
const REQ_SET_CONFIGURATION: u8 = 0x09;
const REQ_SET_INTERFACE: u8 = 0x0B;
const FEATURE_ENDPOINT_HALT: u16 = 0x00;

/// Decoded 8-byte control setup packet (fields are little-endian on the bus)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetupPacket {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl SetupPacket {
    pub fn parse(raw: &[u8; 8]) -> Self {
        Self {
            request_type: raw[0],
            request: raw[1],
            value: LittleEndian::read_u16(&raw[2..4]),
            index: LittleEndian::read_u16(&raw[4..6]),
            length: LittleEndian::read_u16(&raw[6..8]),
        }
    }

    /// Bit 7 of bmRequestType: device to host
    pub fn is_in(&self) -> bool {
        self.request_type & 0x80 != 0
    }

    fn is_standard(&self) -> bool {
        self.request_type & 0x60 == 0
    }

    fn recipient(&self) -> u8 {
        self.request_type & 0x1F
    }

    /// Standard requests that change state libusb tracks
    ///
    /// These must go through the dedicated libusb calls instead of being
    /// passed through as raw control transfers.
    pub fn standard_request(&self) -> Option<StandardRequest> {
        if !self.is_standard() || self.is_in() {
            return None;
        }

        match (self.recipient(), self.request) {
            (0x00, REQ_SET_CONFIGURATION) => {
                Some(StandardRequest::SetConfiguration(self.value as u8))
            }
            (0x01, REQ_SET_INTERFACE) => Some(StandardRequest::SetInterface {
                interface: self.index as u8,
                alt_setting: self.value as u8,
            }),
            (0x02, REQ_CLEAR_FEATURE) if self.value == FEATURE_ENDPOINT_HALT => {
                Some(StandardRequest::ClearHalt(self.index as u8))
            }
            _ => None,
        }
    }
}

/// Standard control request handled through libusb state calls
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StandardRequest {
    SetConfiguration(u8),
    SetInterface { interface: u8, alt_setting: u8 },
    /// CLEAR_FEATURE(ENDPOINT_HALT) on an endpoint address
    ClearHalt(u8),
}

/// Transfer type of every endpoint in the active configuration, keyed by address
pub type EndpointMap = HashMap<u8, TransferType>;

/// Execute one URB and build its completion
///
/// `transfer_type` is the endpoint's type in the active configuration;
/// unknown endpoints are treated as bulk.
pub fn execute_urb(
    handle: &DeviceHandle<Context>,
    transfer_type: Option<TransferType>,
    urb: &UrbRequest,
    cancel: &Cancellation,
) -> UrbCompletion {
    if urb.is_isochronous() {
        debug!("Rejecting isochronous URB {}", urb.seq_num);
        return UrbCompletion::failed(urb.seq_num, errno::status(errno::EINVAL));
    }

    if urb.is_control() {
        return execute_control_transfer(handle, urb);
    }

    let address = urb.endpoint_address();
    match transfer_type {
        Some(TransferType::Interrupt) => execute_interrupt_transfer(handle, address, urb, cancel),
        Some(TransferType::Bulk) | None => execute_bulk_transfer(handle, address, urb, cancel),
        Some(other) => {
            warn!("Unsupported transfer type {:?} on {:#04x}", other, address);
            UrbCompletion::failed(urb.seq_num, errno::status(errno::EINVAL))
        }
    }
}

/// Execute a control transfer on endpoint 0
fn execute_control_transfer(handle: &DeviceHandle<Context>, urb: &UrbRequest) -> UrbCompletion {
    let setup = SetupPacket::parse(&urb.setup);
    debug!(
        "Control transfer: request_type={:#x}, request={:#x}, value={:#x}, index={:#x}, length={}",
        setup.request_type, setup.request, setup.value, setup.index, setup.length
    );

    let result = if setup.is_in() {
        let len = usize::from(setup.length).min(urb.transfer_buffer_length as usize);
        let mut buffer = vec![0u8; len];
        handle
            .read_control(
                setup.request_type,
                setup.request,
                setup.value,
                setup.index,
                &mut buffer,
                DEFAULT_TIMEOUT,
            )
            .map(|n| {
                buffer.truncate(n);
                UrbCompletion::with_data(urb.seq_num, buffer)
            })
    } else {
        handle
            .write_control(
                setup.request_type,
                setup.request,
                setup.value,
                setup.index,
                &urb.data,
                DEFAULT_TIMEOUT,
            )
            .map(|n| UrbCompletion::written(urb.seq_num, n as u32))
    };

    result.unwrap_or_else(|e| {
        warn!("Control transfer failed: {}", e);
        UrbCompletion::failed(urb.seq_num, map_rusb_error(e))
    })
}

/// Execute a bulk transfer
fn execute_bulk_transfer(
    handle: &DeviceHandle<Context>,
    endpoint: u8,
    urb: &UrbRequest,
    cancel: &Cancellation,
) -> UrbCompletion {
    debug!(
        "Bulk transfer: endpoint={:#x}, length={}",
        endpoint, urb.transfer_buffer_length
    );

    if endpoint & 0x80 != 0 {
        let mut buffer = vec![0u8; urb.transfer_buffer_length as usize];
        let result = read_until_data(cancel, |slice| handle.read_bulk(endpoint, &mut buffer, slice));
        match result {
            Ok(len) => {
                buffer.truncate(len);
                UrbCompletion::with_data(urb.seq_num, buffer)
            }
            Err(e) => {
                warn!("Bulk IN failed on {:#x}: {}", endpoint, e);
                UrbCompletion::failed(urb.seq_num, map_rusb_error(e))
            }
        }
    } else {
        match handle.write_bulk(endpoint, &urb.data, DEFAULT_TIMEOUT) {
            Ok(len) => UrbCompletion::written(urb.seq_num, len as u32),
            Err(e) => {
                warn!("Bulk OUT failed on {:#x}: {}", endpoint, e);
                UrbCompletion::failed(urb.seq_num, map_rusb_error(e))
            }
        }
    }
}

/// Execute an interrupt transfer
fn execute_interrupt_transfer(
    handle: &DeviceHandle<Context>,
    endpoint: u8,
    urb: &UrbRequest,
    cancel: &Cancellation,
) -> UrbCompletion {
    debug!(
        "Interrupt transfer: endpoint={:#x}, length={}",
        endpoint, urb.transfer_buffer_length
    );

    if endpoint & 0x80 != 0 {
        let mut buffer = vec![0u8; urb.transfer_buffer_length as usize];
        let result = read_until_data(cancel, |slice| {
            handle.read_interrupt(endpoint, &mut buffer, slice)
        });
        match result {
            Ok(len) => {
                buffer.truncate(len);
                UrbCompletion::with_data(urb.seq_num, buffer)
            }
            Err(e) => {
                warn!("Interrupt IN failed on {:#x}: {}", endpoint, e);
                UrbCompletion::failed(urb.seq_num, map_rusb_error(e))
            }
        }
    } else {
        match handle.write_interrupt(endpoint, &urb.data, DEFAULT_TIMEOUT) {
            Ok(len) => UrbCompletion::written(urb.seq_num, len as u32),
            Err(e) => {
                warn!("Interrupt OUT failed on {:#x}: {}", endpoint, e);
                UrbCompletion::failed(urb.seq_num, map_rusb_error(e))
            }
        }
    }
}

/// Repeat an IN read until the device answers or the URB is unlinked
///
/// A slice that times out moved no data (rusb reports partial data as
/// success). An unlinked URB ends with `Interrupted`, reported as
/// `-ECONNRESET` like a URB the kernel unlinked.
fn read_until_data<F>(cancel: &Cancellation, mut read: F) -> Result<usize, rusb::Error>
where
    F: FnMut(Duration) -> Result<usize, rusb::Error>,
{
    loop {
        match read(IN_POLL_INTERVAL) {
            Err(rusb::Error::Timeout) if cancel.is_cancelled() => {
                debug!("IN transfer unlinked while waiting for data");
                return Err(rusb::Error::Interrupted);
            }
            Err(rusb::Error::Timeout) => continue,
            other => return other,
        }
    }
}

/// Map rusb::Error to a negative errno URB status
pub fn map_rusb_error(err: rusb::Error) -> i32 {
    let code = match err {
        rusb::Error::Timeout => errno::ETIMEDOUT,
        rusb::Error::Pipe => errno::EPIPE,
        rusb::Error::NoDevice => errno::ENODEV,
        rusb::Error::NotFound => errno::ENOENT,
        rusb::Error::Busy => errno::EBUSY,
        rusb::Error::Overflow => errno::EOVERFLOW,
        rusb::Error::Io => errno::EIO,
        rusb::Error::InvalidParam => errno::EINVAL,
        rusb::Error::Access => errno::EACCES,
        rusb::Error::Interrupted => errno::ECONNRESET,
        _ => errno::EPROTO,
    };
    errno::status(code)
}
