//! USB/IP type definitions
//!
//! Field layouts follow the Linux kernel's `usbip_common.h` and the userspace
//! `usbip_network.h`. Every multi-byte integer is big-endian on the wire.

use crate::error::{ProtocolError, Result};
use bytes::{Buf, BufMut};

/// Size of `path` in a device descriptor
pub const PATH_SIZE: usize = 256;

/// Size of `bus_id` in a device descriptor and OP_REQ_IMPORT
pub const BUS_ID_SIZE: usize = 32;

/// Encoded size of [`DeviceDescriptor`]
pub const DEVICE_DESCRIPTOR_SIZE: usize = PATH_SIZE + BUS_ID_SIZE + 3 * 4 + 3 * 2 + 6;

/// Encoded size of [`InterfaceDescriptor`]
pub const INTERFACE_DESCRIPTOR_SIZE: usize = 4;

/// Interface slots in an OP_REP_DEVLIST entry
pub const MAX_INTERFACES: usize = 4;

/// Encoded size of [`IsoPacketDescriptor`]
pub const ISO_PACKET_DESCRIPTOR_SIZE: usize = 16;

/// Operation status: request field / successful reply
pub const OP_STATUS_OK: u32 = 0;

/// Operation status: failed reply
pub const OP_STATUS_ERROR: u32 = 1;

/// USB device speed, numbered as the kernel's `enum usb_device_speed`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u32)]
pub enum DeviceSpeed {
    #[default]
    Unknown = 0,
    /// 1.5 Mbps (USB 1.0)
    Low = 1,
    /// 12 Mbps (USB 1.1)
    Full = 2,
    /// 480 Mbps (USB 2.0)
    High = 3,
    /// Wireless USB
    Wireless = 4,
    /// 5 Gbps (USB 3.0)
    Super = 5,
    /// 10 Gbps (USB 3.1)
    SuperPlus = 6,
}

impl DeviceSpeed {
    pub fn from_u32(value: u32) -> Result<Self> {
        Ok(match value {
            0 => Self::Unknown,
            1 => Self::Low,
            2 => Self::Full,
            3 => Self::High,
            4 => Self::Wireless,
            5 => Self::Super,
            6 => Self::SuperPlus,
            other => return Err(ProtocolError::InvalidSpeed(other)),
        })
    }
}

/// Transfer direction of a URB
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Direction {
    /// Host to device (USBIP_DIR_OUT)
    Out = 0,
    /// Device to host (USBIP_DIR_IN)
    In = 1,
}

impl Direction {
    pub fn from_u32(value: u32) -> Result<Self> {
        match value {
            0 => Ok(Self::Out),
            1 => Ok(Self::In),
            other => Err(ProtocolError::InvalidDirection(other)),
        }
    }
}

/// Exported device descriptor (`struct usbip_usb_device`, 312 bytes)
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DeviceDescriptor {
    /// sysfs-like path of the device on the exporting host
    pub path: String,
    /// Bus id clients use in OP_REQ_IMPORT
    pub bus_id: String,
    pub bus_num: u32,
    pub dev_num: u32,
    pub speed: DeviceSpeed,
    pub vendor_id: u16,
    pub product_id: u16,
    /// bcdDevice
    pub device_bcd: u16,
    pub device_class: u8,
    pub device_subclass: u8,
    pub device_protocol: u8,
    /// bConfigurationValue of the active configuration
    pub configuration_value: u8,
    /// bNumConfigurations
    pub configuration_num: u8,
    /// bNumInterfaces of the active configuration
    pub interface_num: u8,
}

impl DeviceDescriptor {
    /// Device id used in transfer headers: `bus_num << 16 | dev_num`
    pub fn device_id(&self) -> u32 {
        (self.bus_num << 16) | (self.dev_num & 0xFFFF)
    }

    pub(crate) fn write_to<B: BufMut>(&self, buf: &mut B) {
        put_fixed_str(buf, &self.path, PATH_SIZE);
        put_fixed_str(buf, &self.bus_id, BUS_ID_SIZE);
        buf.put_u32(self.bus_num);
        buf.put_u32(self.dev_num);
        buf.put_u32(self.speed as u32);
        buf.put_u16(self.vendor_id);
        buf.put_u16(self.product_id);
        buf.put_u16(self.device_bcd);
        buf.put_u8(self.device_class);
        buf.put_u8(self.device_subclass);
        buf.put_u8(self.device_protocol);
        buf.put_u8(self.configuration_value);
        buf.put_u8(self.configuration_num);
        buf.put_u8(self.interface_num);
    }

    /// Caller guarantees `buf` holds at least [`DEVICE_DESCRIPTOR_SIZE`] bytes
    pub(crate) fn read_from<B: Buf>(buf: &mut B) -> Result<Self> {
        let path = get_fixed_str(buf, PATH_SIZE);
        let bus_id = get_fixed_str(buf, BUS_ID_SIZE);
        let bus_num = buf.get_u32();
        let dev_num = buf.get_u32();
        let speed = DeviceSpeed::from_u32(buf.get_u32())?;
        Ok(Self {
            path,
            bus_id,
            bus_num,
            dev_num,
            speed,
            vendor_id: buf.get_u16(),
            product_id: buf.get_u16(),
            device_bcd: buf.get_u16(),
            device_class: buf.get_u8(),
            device_subclass: buf.get_u8(),
            device_protocol: buf.get_u8(),
            configuration_value: buf.get_u8(),
            configuration_num: buf.get_u8(),
            interface_num: buf.get_u8(),
        })
    }
}

/// Interface entry of OP_REP_DEVLIST (`struct usbip_usb_interface`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InterfaceDescriptor {
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
}

impl InterfaceDescriptor {
    pub fn new(class: u8, subclass: u8, protocol: u8) -> Self {
        Self {
            class,
            subclass,
            protocol,
        }
    }

    pub(crate) fn write_to<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(self.class);
        buf.put_u8(self.subclass);
        buf.put_u8(self.protocol);
        buf.put_u8(0);
    }

    pub(crate) fn read_from<B: Buf>(buf: &mut B) -> Self {
        let iface = Self {
            class: buf.get_u8(),
            subclass: buf.get_u8(),
            protocol: buf.get_u8(),
        };
        buf.advance(1);
        iface
    }
}

/// Common transfer-stage header (`struct usbip_header_basic`)
///
/// The command word is implied by the message variant carrying the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XferHeader {
    pub seq_num: u32,
    pub device_id: u32,
    pub direction: Direction,
    pub endpoint: u32,
}

impl XferHeader {
    pub fn new(seq_num: u32, device_id: u32, direction: Direction, endpoint: u32) -> Self {
        Self {
            seq_num,
            device_id,
            direction,
            endpoint,
        }
    }

    pub(crate) fn write_to<B: BufMut>(&self, buf: &mut B, command: u32) {
        buf.put_u32(command);
        buf.put_u32(self.seq_num);
        buf.put_u32(self.device_id);
        buf.put_u32(self.direction as u32);
        buf.put_u32(self.endpoint);
    }

    /// Reads the four fields following the command word
    pub(crate) fn read_from<B: Buf>(buf: &mut B) -> Result<Self> {
        let seq_num = buf.get_u32();
        let device_id = buf.get_u32();
        let direction = Direction::from_u32(buf.get_u32())?;
        let endpoint = buf.get_u32();
        Ok(Self {
            seq_num,
            device_id,
            direction,
            endpoint,
        })
    }
}

/// Isochronous packet descriptor (`struct usbip_iso_packet_descriptor`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IsoPacketDescriptor {
    pub offset: u32,
    pub length: u32,
    pub actual_length: u32,
    pub status: u32,
}

impl IsoPacketDescriptor {
    pub(crate) fn write_to<B: BufMut>(&self, buf: &mut B) {
        buf.put_u32(self.offset);
        buf.put_u32(self.length);
        buf.put_u32(self.actual_length);
        buf.put_u32(self.status);
    }

    pub(crate) fn read_from<B: Buf>(buf: &mut B) -> Self {
        Self {
            offset: buf.get_u32(),
            length: buf.get_u32(),
            actual_length: buf.get_u32(),
            status: buf.get_u32(),
        }
    }
}

/// True when `number_of_packets` announces an isochronous transfer.
///
/// The kernel documentation says non-iso URBs carry 0xFFFFFFFF here, the
/// kernel itself sends 0; both mean "no descriptors follow".
pub fn is_isochronous(number_of_packets: u32) -> bool {
    number_of_packets != 0 && number_of_packets != u32::MAX
}

/// Write `s` NUL-padded into a fixed field, keeping the final byte NUL
pub(crate) fn put_fixed_str<B: BufMut>(buf: &mut B, s: &str, size: usize) {
    let bytes = s.as_bytes();
    let len = bytes.len().min(size - 1);
    buf.put_slice(&bytes[..len]);
    buf.put_bytes(0, size - len);
}

pub(crate) fn get_fixed_str<B: Buf>(buf: &mut B, size: usize) -> String {
    let mut raw = vec![0u8; size];
    buf.copy_to_slice(&mut raw);
    let end = raw.iter().position(|&b| b == 0).unwrap_or(size);
    String::from_utf8_lossy(&raw[..end]).into_owned()
}
