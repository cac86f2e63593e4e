//! USB/IP message definitions
//!
//! One variant per message shape of the operation stage (device list and
//! import) and the transfer stage (URB submit and unlink).

use crate::types::{
    DeviceDescriptor, Direction, InterfaceDescriptor, IsoPacketDescriptor, MAX_INTERFACES,
    OP_STATUS_ERROR, OP_STATUS_OK, XferHeader,
};

/// Operation code: retrieve the list of exported devices
pub const OP_REQ_DEVLIST: u16 = 0x8005;
/// Operation code: reply with the list of exported devices
pub const OP_REP_DEVLIST: u16 = 0x0005;
/// Operation code: import (attach) a remote device
pub const OP_REQ_IMPORT: u16 = 0x8003;
/// Operation code: reply to an import
pub const OP_REP_IMPORT: u16 = 0x0003;

/// Transfer command: submit a URB
pub const USBIP_CMD_SUBMIT: u32 = 0x0000_0001;
/// Transfer command: unlink a URB
pub const USBIP_CMD_UNLINK: u32 = 0x0000_0002;
/// Transfer reply: URB completion
pub const USBIP_RET_SUBMIT: u32 = 0x0000_0003;
/// Transfer reply: unlink result
pub const USBIP_RET_UNLINK: u32 = 0x0000_0004;

/// Any USB/IP message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    ReqDevlist(ReqDevlist),
    RepDevlist(RepDevlist),
    ReqImport(ReqImport),
    RepImport(RepImport),
    CmdSubmit(CmdSubmit),
    RetSubmit(RetSubmit),
    CmdUnlink(CmdUnlink),
    RetUnlink(RetUnlink),
}

impl Message {
    /// Protocol name of the message, for logging
    pub fn name(&self) -> &'static str {
        match self {
            Self::ReqDevlist(_) => "OP_REQ_DEVLIST",
            Self::RepDevlist(_) => "OP_REP_DEVLIST",
            Self::ReqImport(_) => "OP_REQ_IMPORT",
            Self::RepImport(_) => "OP_REP_IMPORT",
            Self::CmdSubmit(_) => "CMD_SUBMIT",
            Self::RetSubmit(_) => "RET_SUBMIT",
            Self::CmdUnlink(_) => "CMD_UNLINK",
            Self::RetUnlink(_) => "RET_UNLINK",
        }
    }

    /// Sequence number of transfer-stage messages
    pub fn seq_num(&self) -> Option<u32> {
        match self {
            Self::CmdSubmit(m) => Some(m.header.seq_num),
            Self::RetSubmit(m) => Some(m.header.seq_num),
            Self::CmdUnlink(m) => Some(m.header.seq_num),
            Self::RetUnlink(m) => Some(m.header.seq_num),
            _ => None,
        }
    }

    /// True for messages of the operation (negotiation) stage
    pub fn is_operation(&self) -> bool {
        matches!(
            self,
            Self::ReqDevlist(_) | Self::RepDevlist(_) | Self::ReqImport(_) | Self::RepImport(_)
        )
    }
}

/// OP_REQ_DEVLIST: header only
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReqDevlist {
    pub status: u32,
}

/// Device entry of OP_REP_DEVLIST
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExportedDevice {
    pub descriptor: DeviceDescriptor,
    pub interfaces: [InterfaceDescriptor; MAX_INTERFACES],
}

impl ExportedDevice {
    /// Build an entry from a descriptor and up to four interfaces; unused
    /// interface slots stay zeroed and extra interfaces are dropped.
    pub fn new(descriptor: DeviceDescriptor, interfaces: &[InterfaceDescriptor]) -> Self {
        let mut slots = [InterfaceDescriptor::default(); MAX_INTERFACES];
        for (slot, iface) in slots.iter_mut().zip(interfaces) {
            *slot = *iface;
        }
        Self {
            descriptor,
            interfaces: slots,
        }
    }
}

/// OP_REP_DEVLIST: at most one exported device per reply
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RepDevlist {
    pub status: u32,
    pub device: Option<ExportedDevice>,
}

impl RepDevlist {
    pub fn exported_count(&self) -> u32 {
        u32::from(self.device.is_some())
    }
}

/// OP_REQ_IMPORT
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReqImport {
    pub status: u32,
    pub bus_id: String,
}

impl ReqImport {
    pub fn new(bus_id: impl Into<String>) -> Self {
        Self {
            status: OP_STATUS_OK,
            bus_id: bus_id.into(),
        }
    }
}

/// OP_REP_IMPORT; the descriptor is zeroed when `status` is an error
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RepImport {
    pub status: u32,
    pub descriptor: DeviceDescriptor,
}

impl RepImport {
    pub fn ok(descriptor: DeviceDescriptor) -> Self {
        Self {
            status: OP_STATUS_OK,
            descriptor,
        }
    }

    pub fn error() -> Self {
        Self {
            status: OP_STATUS_ERROR,
            descriptor: DeviceDescriptor::default(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == OP_STATUS_OK
    }
}

/// USBIP_CMD_SUBMIT
///
/// `data` is present only for OUT transfers and then holds exactly
/// `transfer_buffer_length` bytes. IN transfers carry the requested length
/// and an empty `data`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CmdSubmit {
    pub header: XferHeader,
    pub transfer_flags: u32,
    pub transfer_buffer_length: u32,
    pub start_frame: u32,
    pub number_of_packets: u32,
    pub interval: u32,
    /// Raw 8-byte control setup packet, zero for non-control endpoints
    pub setup: [u8; 8],
    pub data: Vec<u8>,
    pub iso_packets: Vec<IsoPacketDescriptor>,
}

impl CmdSubmit {
    /// Bulk/interrupt/control submission without isochronous packets
    pub fn new(
        header: XferHeader,
        transfer_buffer_length: u32,
        setup: [u8; 8],
        data: Vec<u8>,
    ) -> Self {
        Self {
            header,
            transfer_flags: 0,
            transfer_buffer_length,
            start_frame: 0,
            number_of_packets: 0,
            interval: 0,
            setup,
            data,
            iso_packets: Vec::new(),
        }
    }
}

/// USBIP_RET_SUBMIT
///
/// `data` is present only for IN transfers and then holds exactly
/// `actual_length` bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetSubmit {
    pub header: XferHeader,
    /// URB status: 0 on success, negative Linux errno on failure
    pub status: i32,
    pub actual_length: u32,
    pub start_frame: u32,
    pub number_of_packets: u32,
    pub error_count: u32,
    pub data: Vec<u8>,
    pub iso_packets: Vec<IsoPacketDescriptor>,
}

impl RetSubmit {
    /// Completion carrying `data` for IN transfers; OUT completions report
    /// `actual_length` without payload.
    pub fn completed(header: XferHeader, status: i32, actual_length: u32, data: Vec<u8>) -> Self {
        let (actual_length, data) = match header.direction {
            Direction::In => (data.len() as u32, data),
            Direction::Out => (actual_length, Vec::new()),
        };
        Self {
            header,
            status,
            actual_length,
            start_frame: 0,
            number_of_packets: 0,
            error_count: 0,
            data,
            iso_packets: Vec::new(),
        }
    }

    /// Failed completion with no data
    pub fn failed(header: XferHeader, status: i32) -> Self {
        Self::completed(header, status, 0, Vec::new())
    }
}

/// USBIP_CMD_UNLINK
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CmdUnlink {
    pub header: XferHeader,
    /// Sequence number of the CMD_SUBMIT to cancel
    pub unlink_seqnum: u32,
}

/// USBIP_RET_UNLINK
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetUnlink {
    pub header: XferHeader,
    pub status: i32,
}
