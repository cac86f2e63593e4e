//! Test doubles
//!
//! [`MockDevice`] implements [`UsbIpDevice`] with deterministic completions
//! so sessions and the reactor can be exercised without hardware. It runs on
//! a real [`TransferExecutor`], so queueing, ordering and unlink races behave
//! as they do for host devices.

use crate::device::{Cancellation, DeviceError, TransferExecutor, UrbHandler, UsbIpDevice};
use crate::usb::transfers::SetupPacket;
use common::test_utils::{mock_descriptor, mock_interfaces};
use common::errno;
use common::{CompletionSender, SessionId, UnlinkOutcome, UrbCompletion, UrbRequest, UrbToken};
use parking_lot::{Condvar, Mutex};
use protocol::{DeviceDescriptor, Direction, InterfaceDescriptor};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// How a [`MockDevice`] completes URBs
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum MockBehavior {
    #[default]
    /// OUT data is buffered per endpoint number and returned by IN transfers
    /// on the same endpoint number. An IN transfer with nothing buffered waits
    /// for data until it is unlinked, then completes with `-ECONNRESET`.
    /// Control reads return descriptors
    Echo,
    /// Every IN transfer returns this payload (truncated to the requested length)
    FixedIn(Vec<u8>),
    /// Every transfer fails with this URB status
    Fail(i32),
}

#[derive(Default)]
struct MockState {
    behavior: Mutex<MockBehavior>,
    held: Mutex<bool>,
    gate: Condvar,
    started: AtomicUsize,
    completed: AtomicUsize,
    submitted: Mutex<Vec<UrbRequest>>,
    echo: Mutex<HashMap<u32, VecDeque<u8>>>,
    echo_ready: Condvar,
}

impl MockState {
    fn wait_gate(&self) {
        let mut held = self.held.lock();
        while *held {
            self.gate.wait(&mut held);
        }
    }

    fn set_held(&self, value: bool) {
        *self.held.lock() = value;
        self.gate.notify_all();
    }
}

struct MockHandler {
    state: Arc<MockState>,
    descriptor: DeviceDescriptor,
}

impl UrbHandler for MockHandler {
    fn handle(&self, urb: &UrbRequest, cancel: &Cancellation) -> UrbCompletion {
        self.state.submitted.lock().push(urb.clone());
        self.state.started.fetch_add(1, Ordering::SeqCst);
        self.state.wait_gate();

        let behavior = self.state.behavior.lock().clone();
        let completion = match behavior {
            MockBehavior::Fail(status) => UrbCompletion::failed(urb.seq_num, status),
            MockBehavior::FixedIn(payload) => match urb.direction {
                Direction::In => {
                    let len = payload.len().min(urb.transfer_buffer_length as usize);
                    UrbCompletion::with_data(urb.seq_num, payload[..len].to_vec())
                }
                Direction::Out => UrbCompletion::written(urb.seq_num, urb.data.len() as u32),
            },
            MockBehavior::Echo if urb.is_control() => self.control(urb),
            MockBehavior::Echo => self.echo(urb, cancel),
        };

        self.state.completed.fetch_add(1, Ordering::SeqCst);
        completion
    }
}

impl MockHandler {
    fn control(&self, urb: &UrbRequest) -> UrbCompletion {
        let setup = SetupPacket::parse(&urb.setup);
        if !setup.is_in() {
            return UrbCompletion::written(urb.seq_num, urb.data.len() as u32);
        }

        let requested = usize::from(setup.length).min(urb.transfer_buffer_length as usize);
        let mut data = match (setup.request, setup.value >> 8) {
            // GET_DESCRIPTOR(DEVICE)
            (0x06, 0x01) => device_descriptor_bytes(&self.descriptor),
            _ => vec![0; requested],
        };
        data.truncate(requested);
        UrbCompletion::with_data(urb.seq_num, data)
    }

    fn echo(&self, urb: &UrbRequest, cancel: &Cancellation) -> UrbCompletion {
        let mut echo = self.state.echo.lock();
        if urb.direction == Direction::Out {
            echo.entry(urb.endpoint)
                .or_default()
                .extend(urb.data.iter().copied());
            self.state.echo_ready.notify_all();
            return UrbCompletion::written(urb.seq_num, urb.data.len() as u32);
        }

        loop {
            let buffer = echo.entry(urb.endpoint).or_default();
            if !buffer.is_empty() || urb.transfer_buffer_length == 0 {
                let len = buffer.len().min(urb.transfer_buffer_length as usize);
                return UrbCompletion::with_data(urb.seq_num, buffer.drain(..len).collect());
            }
            if cancel.is_cancelled() {
                return UrbCompletion::failed(urb.seq_num, errno::status(errno::ECONNRESET));
            }
            // cancellation is not signalled on the condvar
            self.state
                .echo_ready
                .wait_for(&mut echo, Duration::from_millis(5));
        }
    }
}

/// Standard 18-byte USB device descriptor matching `descriptor`
fn device_descriptor_bytes(descriptor: &DeviceDescriptor) -> Vec<u8> {
    let vid = descriptor.vendor_id.to_le_bytes();
    let pid = descriptor.product_id.to_le_bytes();
    let bcd = descriptor.device_bcd.to_le_bytes();
    vec![
        0x12,
        0x01,
        0x00,
        0x02,
        descriptor.device_class,
        descriptor.device_subclass,
        descriptor.device_protocol,
        0x40,
        vid[0],
        vid[1],
        pid[0],
        pid[1],
        bcd[0],
        bcd[1],
        0x00,
        0x00,
        0x00,
        descriptor.configuration_num,
    ]
}

/// Synthetic USB device for tests
pub struct MockDevice {
    descriptor: DeviceDescriptor,
    interfaces: Vec<InterfaceDescriptor>,
    state: Arc<MockState>,
    executor: TransferExecutor,
}

impl MockDevice {
    /// Echo device with a vendor-specific interface
    pub fn new(bus_id: &str, bus_num: u32, dev_num: u32) -> Result<Arc<Self>, DeviceError> {
        Self::with_descriptor(mock_descriptor(bus_id, bus_num, dev_num), mock_interfaces())
    }

    pub fn with_descriptor(
        descriptor: DeviceDescriptor,
        interfaces: Vec<InterfaceDescriptor>,
    ) -> Result<Arc<Self>, DeviceError> {
        let state = Arc::new(MockState::default());
        let handler = MockHandler {
            state: Arc::clone(&state),
            descriptor: descriptor.clone(),
        };
        let executor = TransferExecutor::spawn(&descriptor.bus_id, handler)?;
        Ok(Arc::new(Self {
            descriptor,
            interfaces,
            state,
            executor,
        }))
    }

    pub fn set_behavior(&self, behavior: MockBehavior) {
        *self.state.behavior.lock() = behavior;
    }

    /// Block transfers once they start running, until [`MockDevice::release`]
    pub fn hold(&self) {
        self.state.set_held(true);
    }

    pub fn release(&self) {
        self.state.set_held(false);
    }

    /// URBs that reached the worker (running or finished)
    pub fn started(&self) -> usize {
        self.state.started.load(Ordering::SeqCst)
    }

    pub fn completed(&self) -> usize {
        self.state.completed.load(Ordering::SeqCst)
    }

    /// URBs that reached the worker, in execution order
    pub fn submitted(&self) -> Vec<UrbRequest> {
        self.state.submitted.lock().clone()
    }

    pub fn in_flight(&self) -> usize {
        self.executor.in_flight()
    }
}

impl UsbIpDevice for MockDevice {
    fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    fn interfaces(&self) -> &[InterfaceDescriptor] {
        &self.interfaces
    }

    fn submit_urb(
        &self,
        urb: UrbRequest,
        completions: CompletionSender,
    ) -> Result<UrbToken, DeviceError> {
        self.executor.submit(urb, completions)
    }

    fn unlink_urb(&self, session: SessionId, seq_num: u32) -> UnlinkOutcome {
        self.executor.unlink(session, seq_num)
    }
}

impl Drop for MockDevice {
    fn drop(&mut self) {
        // a held transfer would block the executor join
        self.state.set_held(false);
    }
}
