//! Test utilities for usbip-bridge
//!
//! Provides descriptor builders, URB builders and timeout helpers shared by
//! the test suites of every crate.
//!
//! # Example
//!
//! ```
//! use common::test_utils::mock_descriptor;
//!
//! let descriptor = mock_descriptor("1-1", 1, 2);
//! assert_eq!(descriptor.device_id(), 0x0001_0002);
//! ```

use protocol::{
    CmdSubmit, DeviceDescriptor, DeviceSpeed, Direction, InterfaceDescriptor, XferHeader,
};
use std::future::Future;
use std::time::{Duration, Instant};

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Descriptor of a full-speed vendor-specific device at `bus_id`
pub fn mock_descriptor(bus_id: &str, bus_num: u32, dev_num: u32) -> DeviceDescriptor {
    DeviceDescriptor {
        path: format!("/sys/devices/platform/mock/usb{}/{}", bus_num, bus_id),
        bus_id: bus_id.to_string(),
        bus_num,
        dev_num,
        speed: DeviceSpeed::Full,
        vendor_id: 0x1234,
        product_id: 0x5678,
        device_bcd: 0x0100,
        device_class: 0x00,
        device_subclass: 0x00,
        device_protocol: 0x00,
        configuration_value: 1,
        configuration_num: 1,
        interface_num: 1,
    }
}

/// A single vendor-specific interface
pub fn mock_interfaces() -> Vec<InterfaceDescriptor> {
    vec![InterfaceDescriptor::new(0xFF, 0x00, 0x00)]
}

/// Bulk OUT submission carrying `data`
pub fn out_submit(seq_num: u32, device_id: u32, endpoint: u32, data: Vec<u8>) -> CmdSubmit {
    let header = XferHeader::new(seq_num, device_id, Direction::Out, endpoint);
    CmdSubmit::new(header, data.len() as u32, [0; 8], data)
}

/// Bulk IN submission requesting `length` bytes
pub fn in_submit(seq_num: u32, device_id: u32, endpoint: u32, length: u32) -> CmdSubmit {
    let header = XferHeader::new(seq_num, device_id, Direction::In, endpoint);
    CmdSubmit::new(header, length, [0; 8], Vec::new())
}

/// Control IN submission on endpoint 0 with the given setup packet
pub fn control_in_submit(seq_num: u32, device_id: u32, setup: [u8; 8]) -> CmdSubmit {
    let length = u16::from_le_bytes([setup[6], setup[7]]);
    let header = XferHeader::new(seq_num, device_id, Direction::In, 0);
    CmdSubmit::new(header, u32::from(length), setup, Vec::new())
}

/// Create a control transfer setup packet (little-endian fields)
pub fn setup_packet(request_type: u8, request: u8, value: u16, index: u16, length: u16) -> [u8; 8] {
    let value = value.to_le_bytes();
    let index = index.to_le_bytes();
    let length = length.to_le_bytes();
    [
        request_type,
        request,
        value[0],
        value[1],
        index[0],
        index[1],
        length[0],
        length[1],
    ]
}

/// Run a future with a timeout
///
/// # Example
/// ```no_run
/// use common::test_utils::{with_timeout, DEFAULT_TEST_TIMEOUT};
///
/// #[tokio::test]
/// async fn test_with_timeout() {
///     let result = with_timeout(DEFAULT_TEST_TIMEOUT, async { 42 }).await.unwrap();
///     assert_eq!(result, 42);
/// }
/// ```
pub async fn with_timeout<T, F>(duration: Duration, future: F) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| TimeoutError { duration })
}

/// Poll `condition` from a blocking context until it holds or `duration` passes
pub fn wait_until(duration: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + duration;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

/// Error returned when a test times out
#[derive(Debug)]
pub struct TimeoutError {
    /// The timeout duration that was exceeded
    pub duration: Duration,
}

impl std::fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Test timed out after {:?}", self.duration)
    }
}

impl std::error::Error for TimeoutError {}
