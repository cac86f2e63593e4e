//! Host USB device backend
//!
//! [`HostDevice`] exports a libusb device. Descriptors are read once when the
//! device is registered; the device itself is opened lazily by the first
//! URB, where kernel drivers are detached and every interface of the active
//! configuration is claimed. Every endpoint lane shares the opened handle.

use crate::device::{Cancellation, DeviceError, TransferExecutor, UrbHandler, UsbIpDevice};
use crate::usb::transfers::{
    EndpointMap, SetupPacket, StandardRequest, execute_urb, map_rusb_error,
};
use common::{CompletionSender, SessionId, UnlinkOutcome, UrbCompletion, UrbRequest, UrbToken};
use protocol::{DeviceDescriptor, DeviceSpeed, InterfaceDescriptor, MAX_INTERFACES};
use parking_lot::Mutex;
use rusb::{Context, Device, DeviceHandle};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A physical USB device exported through libusb
pub struct HostDevice {
    descriptor: DeviceDescriptor,
    interfaces: Vec<InterfaceDescriptor>,
    executor: TransferExecutor,
}

impl HostDevice {
    /// Read descriptors and start the device's transfer executor
    pub fn new(device: Device<Context>) -> Result<Arc<Self>, DeviceError> {
        let (descriptor, interfaces) = read_descriptors(&device)?;
        let runner = HostTransfers::new(device, descriptor.bus_id.clone());
        let executor = TransferExecutor::spawn(&descriptor.bus_id, runner)?;

        debug!(
            "Host device {} ({:04x}:{:04x}) ready",
            descriptor.bus_id, descriptor.vendor_id, descriptor.product_id
        );
        Ok(Arc::new(Self {
            descriptor,
            interfaces,
            executor,
        }))
    }
}

impl UsbIpDevice for HostDevice {
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

/// Bus id in sysfs form: `<bus>-<port>[.<port>...]`
pub fn bus_id_of(device: &Device<Context>) -> String {
    let ports = device.port_numbers().unwrap_or_default();
    format_bus_id(device.bus_number(), &ports)
}

fn format_bus_id(bus: u8, ports: &[u8]) -> String {
    if ports.is_empty() {
        return format!("{}-0", bus);
    }
    let ports: Vec<String> = ports.iter().map(|p| p.to_string()).collect();
    format!("{}-{}", bus, ports.join("."))
}

fn read_descriptors(
    device: &Device<Context>,
) -> Result<(DeviceDescriptor, Vec<InterfaceDescriptor>), DeviceError> {
    let desc = device.device_descriptor()?;
    let bus_id = bus_id_of(device);

    let (configuration_value, interfaces) = match device.active_config_descriptor() {
        Ok(config) => {
            let interfaces = config
                .interfaces()
                .filter_map(|iface| iface.descriptors().next())
                .map(|alt| {
                    InterfaceDescriptor::new(alt.class_code(), alt.sub_class_code(), alt.protocol_code())
                })
                .collect::<Vec<_>>();
            (config.number(), interfaces)
        }
        Err(e) => {
            // unconfigured devices report no active configuration
            debug!("No active configuration on {}: {}", bus_id, e);
            (0, Vec::new())
        }
    };

    if interfaces.len() > MAX_INTERFACES {
        debug!(
            "{} has {} interfaces, only {} are listed",
            bus_id,
            interfaces.len(),
            MAX_INTERFACES
        );
    }

    let descriptor = DeviceDescriptor {
        path: format!("/sys/bus/usb/devices/{}", bus_id),
        bus_num: u32::from(device.bus_number()),
        dev_num: u32::from(device.address()),
        speed: map_device_speed(device.speed()),
        vendor_id: desc.vendor_id(),
        product_id: desc.product_id(),
        device_bcd: version_to_bcd(desc.device_version()),
        device_class: desc.class_code(),
        device_subclass: desc.sub_class_code(),
        device_protocol: desc.protocol_code(),
        configuration_value,
        configuration_num: desc.num_configurations(),
        interface_num: interfaces.len() as u8,
        bus_id,
    };
    Ok((descriptor, interfaces))
}

/// Map rusb device speed to the USB/IP speed field
fn map_device_speed(speed: rusb::Speed) -> DeviceSpeed {
    match speed {
        rusb::Speed::Low => DeviceSpeed::Low,
        rusb::Speed::Full => DeviceSpeed::Full,
        rusb::Speed::High => DeviceSpeed::High,
        rusb::Speed::Super => DeviceSpeed::Super,
        rusb::Speed::SuperPlus => DeviceSpeed::SuperPlus,
        _ => DeviceSpeed::Unknown,
    }
}

/// Re-encode a decoded bcdDevice
fn version_to_bcd(version: rusb::Version) -> u16 {
    let major = u16::from(version.major());
    ((major / 10) << 12)
        | ((major % 10) << 8)
        | (u16::from(version.minor() & 0x0F) << 4)
        | u16::from(version.sub_minor() & 0x0F)
}

/// Shared by the executor lanes; owns the libusb handle
struct HostTransfers {
    device: Device<Context>,
    bus_id: String,
    state: Mutex<HostState>,
}

#[derive(Default)]
struct HostState {
    handle: Option<Arc<DeviceHandle<Context>>>,
    claimed: Vec<u8>,
    endpoints: EndpointMap,
}

impl HostTransfers {
    fn new(device: Device<Context>, bus_id: String) -> Self {
        Self {
            device,
            bus_id,
            state: Mutex::new(HostState::default()),
        }
    }

    /// Open the device and claim every interface of the active configuration
    fn open(&self, state: &mut HostState) -> Result<Arc<DeviceHandle<Context>>, rusb::Error> {
        if let Some(handle) = &state.handle {
            return Ok(Arc::clone(handle));
        }

        let handle = self.device.open().inspect_err(|e| {
            warn!("Failed to open device {}: {}", self.bus_id, e);
        })?;
        if let Err(e) = self.claim_all(&handle, state) {
            Self::release_all(&handle, state);
            return Err(e);
        }

        info!(
            "Opened device {} ({} interfaces claimed)",
            self.bus_id,
            state.claimed.len()
        );
        let handle = Arc::new(handle);
        state.handle = Some(Arc::clone(&handle));
        Ok(handle)
    }

    fn claim_all(
        &self,
        handle: &DeviceHandle<Context>,
        state: &mut HostState,
    ) -> Result<(), rusb::Error> {
        let config = self.device.active_config_descriptor()?;
        state.endpoints.clear();

        for interface in config.interfaces() {
            let number = interface.number();

            match handle.kernel_driver_active(number) {
                Ok(true) => {
                    debug!("Detaching kernel driver from interface {}", number);
                    if let Err(e) = handle.detach_kernel_driver(number) {
                        warn!("Failed to detach kernel driver from interface {}: {}", number, e);
                    }
                }
                Ok(false) => {}
                Err(e) => debug!("Could not check kernel driver on interface {}: {}", number, e),
            }

            handle.claim_interface(number).inspect_err(|e| {
                warn!("Failed to claim interface {}: {}", number, e);
            })?;
            state.claimed.push(number);

            for alt in interface.descriptors() {
                for endpoint in alt.endpoint_descriptors() {
                    state
                        .endpoints
                        .entry(endpoint.address())
                        .or_insert(endpoint.transfer_type());
                }
            }
        }
        Ok(())
    }

    /// Release claimed interfaces and give them back to the kernel
    fn release_all(handle: &DeviceHandle<Context>, state: &mut HostState) {
        for interface in state.claimed.drain(..) {
            if let Err(e) = handle.release_interface(interface) {
                warn!("Failed to release interface {}: {}", interface, e);
            }
            if let Err(e) = handle.attach_kernel_driver(interface) {
                debug!(
                    "Could not reattach kernel driver to interface {}: {}",
                    interface, e
                );
            }
        }
    }

    fn apply_standard_request(
        &self,
        handle: &DeviceHandle<Context>,
        state: &mut HostState,
        request: StandardRequest,
    ) -> Result<(), rusb::Error> {
        debug!("{}: {:?}", self.bus_id, request);
        match request {
            StandardRequest::SetConfiguration(value) => {
                if handle.active_configuration() == Ok(value) {
                    return Ok(());
                }
                Self::release_all(handle, state);
                handle.set_active_configuration(value)?;
                self.claim_all(handle, state)
            }
            StandardRequest::SetInterface {
                interface,
                alt_setting,
            } => handle.set_alternate_setting(interface, alt_setting),
            StandardRequest::ClearHalt(endpoint) => handle.clear_halt(endpoint),
        }
    }
}

impl UrbHandler for HostTransfers {
    fn handle(&self, urb: &UrbRequest, cancel: &Cancellation) -> UrbCompletion {
        let standard = if urb.is_control() {
            SetupPacket::parse(&urb.setup).standard_request()
        } else {
            None
        };

        // held only for open and libusb state changes, never for a data transfer
        let mut state = self.state.lock();
        let handle = match self.open(&mut state) {
            Ok(handle) => handle,
            Err(e) => return UrbCompletion::failed(urb.seq_num, map_rusb_error(e)),
        };

        if let Some(request) = standard {
            return match self.apply_standard_request(&handle, &mut state, request) {
                Ok(()) => UrbCompletion::written(urb.seq_num, 0),
                Err(e) => {
                    warn!("{}: {:?} failed: {}", self.bus_id, request, e);
                    UrbCompletion::failed(urb.seq_num, map_rusb_error(e))
                }
            };
        }

        let transfer_type = state.endpoints.get(&urb.endpoint_address()).copied();
        drop(state);
        execute_urb(&handle, transfer_type, urb, cancel)
    }
}

impl Drop for HostTransfers {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if let Some(handle) = state.handle.take() {
            Self::release_all(&handle, state);
            debug!("Closed device {}", self.bus_id);
        }
    }
}
