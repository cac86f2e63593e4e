//! USB/IP wire protocol
//!
//! Message definitions and a big-endian codec for USB/IP 1.1.1, covering the
//! operation stage (device list, import) and the transfer stage (URB submit
//! and unlink). Decoding is incremental so it can be driven straight from a
//! non-blocking socket buffer.
//!
//! # Example
//!
//! ```
//! use protocol::{Decoded, Direction, Message, CmdSubmit, XferHeader, decode, encode};
//!
//! let header = XferHeader::new(1, 0x0001_0002, Direction::Out, 2);
//! let msg = Message::CmdSubmit(CmdSubmit::new(header, 3, [0; 8], vec![1, 2, 3]));
//!
//! let bytes = encode(&msg).unwrap();
//! assert_eq!(bytes.len(), 48 + 3);
//!
//! match decode(&bytes).unwrap() {
//!     Decoded::Complete { message, consumed } => {
//!         assert_eq!(consumed, bytes.len());
//!         assert_eq!(message, msg);
//!     }
//!     Decoded::NeedMoreBytes => unreachable!(),
//! }
//! ```

pub mod codec;
pub mod error;
pub mod messages;
pub mod types;
pub mod version;

pub use codec::{
    Decoded, MAX_ISO_PACKETS, MAX_MESSAGE_SIZE, MAX_TRANSFER_BUFFER_LENGTH, OP_HEADER_SIZE,
    XFER_HEADER_SIZE, decode, encode, encode_into, encoded_len, read_message, write_message,
};

#[cfg(feature = "async")]
pub use codec::{read_message_async, write_message_async};
pub use error::{ProtocolError, Result};
pub use messages::{
    CmdSubmit, CmdUnlink, ExportedDevice, Message, OP_REP_DEVLIST, OP_REP_IMPORT, OP_REQ_DEVLIST,
    OP_REQ_IMPORT, RepDevlist, RepImport, ReqDevlist, ReqImport, RetSubmit, RetUnlink,
    USBIP_CMD_SUBMIT, USBIP_CMD_UNLINK, USBIP_RET_SUBMIT, USBIP_RET_UNLINK,
};
pub use types::{
    BUS_ID_SIZE, DEVICE_DESCRIPTOR_SIZE, DeviceDescriptor, DeviceSpeed, Direction,
    INTERFACE_DESCRIPTOR_SIZE, ISO_PACKET_DESCRIPTOR_SIZE, InterfaceDescriptor,
    IsoPacketDescriptor, MAX_INTERFACES, OP_STATUS_ERROR, OP_STATUS_OK, PATH_SIZE, XferHeader,
    is_isochronous,
};
pub use version::{USBIP_VERSION, is_supported};
