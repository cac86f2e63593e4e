//! URB types shared by the session layer and device backends
//!
//! A [`UrbRequest`] is the device-facing view of a CMD_SUBMIT; an
//! [`UrbCompletion`] is what a backend reports when the transfer finishes.

use crate::errno;
use protocol::{CmdSubmit, Direction, IsoPacketDescriptor, is_isochronous};

/// Correlation token returned by a backend when it accepts a submission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UrbToken(pub u32);

/// A submitted URB as handed to a device backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrbRequest {
    pub seq_num: u32,
    pub direction: Direction,
    /// Endpoint number without the direction bit
    pub endpoint: u32,
    pub transfer_flags: u32,
    /// Requested length; for OUT this equals `data.len()`
    pub transfer_buffer_length: u32,
    pub setup: [u8; 8],
    /// OUT payload, empty for IN
    pub data: Vec<u8>,
    pub start_frame: u32,
    pub number_of_packets: u32,
    pub interval: u32,
    pub iso_packets: Vec<IsoPacketDescriptor>,
}

impl UrbRequest {
    /// Endpoint address as seen by libusb (bit 7 set for IN)
    pub fn endpoint_address(&self) -> u8 {
        let number = (self.endpoint & 0x0F) as u8;
        match self.direction {
            Direction::In => number | 0x80,
            Direction::Out => number,
        }
    }

    /// Endpoint 0 carries control transfers
    pub fn is_control(&self) -> bool {
        self.endpoint == 0
    }

    pub fn is_isochronous(&self) -> bool {
        is_isochronous(self.number_of_packets)
    }
}

impl From<CmdSubmit> for UrbRequest {
    fn from(cmd: CmdSubmit) -> Self {
        Self {
            seq_num: cmd.header.seq_num,
            direction: cmd.header.direction,
            endpoint: cmd.header.endpoint,
            transfer_flags: cmd.transfer_flags,
            transfer_buffer_length: cmd.transfer_buffer_length,
            setup: cmd.setup,
            data: cmd.data,
            start_frame: cmd.start_frame,
            number_of_packets: cmd.number_of_packets,
            interval: cmd.interval,
            iso_packets: cmd.iso_packets,
        }
    }
}

/// Result of a finished URB
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrbCompletion {
    pub seq_num: u32,
    /// 0 on success, negative errno otherwise (see [`crate::errno`])
    pub status: i32,
    /// Bytes transferred; for IN completions this is `data.len()`
    pub actual_length: u32,
    /// IN payload, empty for OUT
    pub data: Vec<u8>,
    pub start_frame: u32,
    pub error_count: u32,
}

impl UrbCompletion {
    /// Successful IN transfer returning `data`
    pub fn with_data(seq_num: u32, data: Vec<u8>) -> Self {
        Self {
            seq_num,
            status: 0,
            actual_length: data.len() as u32,
            data,
            start_frame: 0,
            error_count: 0,
        }
    }

    /// Successful OUT transfer that moved `actual_length` bytes
    pub fn written(seq_num: u32, actual_length: u32) -> Self {
        Self {
            seq_num,
            status: 0,
            actual_length,
            data: Vec::new(),
            start_frame: 0,
            error_count: 0,
        }
    }

    /// Failed transfer with a negative errno status
    pub fn failed(seq_num: u32, status: i32) -> Self {
        Self {
            seq_num,
            status,
            actual_length: 0,
            data: Vec::new(),
            start_frame: 0,
            error_count: 0,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == 0
    }
}

/// Backend answer to an unlink request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnlinkOutcome {
    /// The URB had not started and will never complete
    Cancelled,
    /// The URB already ran or is running; its completion is or will be delivered
    AlreadyCompleted,
    /// No URB with that sequence number is known
    NotFound,
}

impl UnlinkOutcome {
    /// Status field of the RET_UNLINK answering this outcome
    pub fn ret_unlink_status(self) -> i32 {
        match self {
            Self::Cancelled => errno::status(errno::ECONNRESET),
            Self::AlreadyCompleted => 0,
            Self::NotFound => errno::status(errno::ENOENT),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::XferHeader;

    #[test]
    fn test_from_cmd_submit() {
        let header = XferHeader::new(42, 0x0001_0002, Direction::Out, 2);
        let cmd = CmdSubmit::new(header, 3, [0; 8], vec![1, 2, 3]);
        let urb = UrbRequest::from(cmd);
        assert_eq!(urb.seq_num, 42);
        assert_eq!(urb.endpoint_address(), 0x02);
        assert_eq!(urb.data, vec![1, 2, 3]);
        assert!(!urb.is_control());
        assert!(!urb.is_isochronous());
    }

    #[test]
    fn test_in_endpoint_address() {
        let header = XferHeader::new(1, 0, Direction::In, 1);
        let urb = UrbRequest::from(CmdSubmit::new(header, 64, [0; 8], Vec::new()));
        assert_eq!(urb.endpoint_address(), 0x81);
    }

    #[test]
    fn test_completion_constructors() {
        let c = UrbCompletion::with_data(5, vec![9; 10]);
        assert_eq!(c.actual_length, 10);
        assert!(c.is_success());

        let c = UrbCompletion::failed(6, errno::status(errno::EPIPE));
        assert_eq!(c.status, -32);
        assert!(!c.is_success());
    }

    #[test]
    fn test_unlink_status_codes() {
        assert_eq!(UnlinkOutcome::Cancelled.ret_unlink_status(), -104);
        assert_eq!(UnlinkOutcome::AlreadyCompleted.ret_unlink_status(), 0);
        assert_eq!(UnlinkOutcome::NotFound.ret_unlink_status(), -2);
    }
}
