//! USB/IP wire encoding and incremental decoding
//!
//! # Frame Format
//!
//! Operation-stage messages start with an 8-byte header:
//! ```text
//! [version: u16 = 0x0111][code: u16][status: u32][body...]
//! ```
//! Transfer-stage messages start with a 48-byte header:
//! ```text
//! [command: u32][seq_num: u32][device_id: u32][direction: u32][endpoint: u32][28 bytes][payload...]
//! ```
//! The first two bytes tell the two apart: the protocol version for an
//! operation, zero for a transfer command (all commands fit in the low byte).
//!
//! [`decode`] works on whatever bytes have been buffered so far and reports
//! [`Decoded::NeedMoreBytes`] until a full message is available, so callers
//! can feed it from non-blocking sockets in arbitrary chunks.

use crate::error::{ProtocolError, Result};
use crate::messages::{
    CmdSubmit, CmdUnlink, ExportedDevice, Message, OP_REP_DEVLIST, OP_REP_IMPORT, OP_REQ_DEVLIST,
    OP_REQ_IMPORT, RepDevlist, RepImport, ReqDevlist, ReqImport, RetSubmit, RetUnlink,
    USBIP_CMD_SUBMIT, USBIP_CMD_UNLINK, USBIP_RET_SUBMIT, USBIP_RET_UNLINK,
};
use crate::types::{
    BUS_ID_SIZE, DEVICE_DESCRIPTOR_SIZE, DeviceDescriptor, Direction, INTERFACE_DESCRIPTOR_SIZE,
    ISO_PACKET_DESCRIPTOR_SIZE, InterfaceDescriptor, IsoPacketDescriptor, MAX_INTERFACES,
    XferHeader, get_fixed_str, is_isochronous, put_fixed_str,
};
use crate::version::{USBIP_VERSION, is_supported};
use bytes::{Buf, BufMut, BytesMut};
use std::io::{Read, Write};

#[cfg(feature = "async")]
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Size of the operation-stage header
pub const OP_HEADER_SIZE: usize = 8;

/// Size of the fixed header of every transfer-stage message
pub const XFER_HEADER_SIZE: usize = 48;

/// Largest transfer buffer the codec will frame (16 MiB)
pub const MAX_TRANSFER_BUFFER_LENGTH: u32 = 16 * 1024 * 1024;

/// Largest isochronous packet count the codec will frame
pub const MAX_ISO_PACKETS: u32 = 1024;

/// Size of the largest message [`decode`] can produce
pub const MAX_MESSAGE_SIZE: usize = XFER_HEADER_SIZE
    + MAX_TRANSFER_BUFFER_LENGTH as usize
    + MAX_ISO_PACKETS as usize * ISO_PACKET_DESCRIPTOR_SIZE;

const REP_DEVLIST_HEADER_SIZE: usize = OP_HEADER_SIZE + 4;
const DEVLIST_ENTRY_SIZE: usize = DEVICE_DESCRIPTOR_SIZE + MAX_INTERFACES * INTERFACE_DESCRIPTOR_SIZE;

/// Outcome of a decode attempt over the buffered bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// A full message was decoded from the first `consumed` bytes
    Complete { message: Message, consumed: usize },
    /// The buffer holds a valid prefix; read more and retry
    NeedMoreBytes,
}

/// Decode one message from the front of `buf`
///
/// Returns [`Decoded::NeedMoreBytes`] for any valid prefix and an error as
/// soon as the buffered bytes can not start a valid message.
///
/// # Example
/// ```
/// use protocol::{Decoded, Message, ReqDevlist, decode, encode};
///
/// let bytes = encode(&Message::ReqDevlist(ReqDevlist::default())).unwrap();
/// assert_eq!(decode(&bytes[..5]).unwrap(), Decoded::NeedMoreBytes);
///
/// let Decoded::Complete { message, consumed } = decode(&bytes).unwrap() else {
///     panic!("expected a complete message");
/// };
/// assert_eq!(consumed, 8);
/// assert!(matches!(message, Message::ReqDevlist(_)));
/// ```
pub fn decode(buf: &[u8]) -> Result<Decoded> {
    if buf.len() < 2 {
        return Ok(Decoded::NeedMoreBytes);
    }

    let lead = u16::from_be_bytes([buf[0], buf[1]]);
    if is_supported(lead) {
        decode_operation(buf)
    } else if lead == 0 {
        decode_transfer(buf)
    } else {
        Err(ProtocolError::UnsupportedVersion(lead))
    }
}

fn complete(message: Message, consumed: usize) -> Result<Decoded> {
    Ok(Decoded::Complete { message, consumed })
}

fn decode_operation(buf: &[u8]) -> Result<Decoded> {
    if buf.len() < OP_HEADER_SIZE {
        return Ok(Decoded::NeedMoreBytes);
    }

    let mut cur = &buf[2..];
    let code = cur.get_u16();
    let status = cur.get_u32();

    match code {
        OP_REQ_DEVLIST => complete(Message::ReqDevlist(ReqDevlist { status }), OP_HEADER_SIZE),

        OP_REQ_IMPORT => {
            let total = OP_HEADER_SIZE + BUS_ID_SIZE;
            if buf.len() < total {
                return Ok(Decoded::NeedMoreBytes);
            }
            let bus_id = get_fixed_str(&mut cur, BUS_ID_SIZE);
            complete(Message::ReqImport(ReqImport { status, bus_id }), total)
        }

        OP_REP_DEVLIST => {
            if buf.len() < REP_DEVLIST_HEADER_SIZE {
                return Ok(Decoded::NeedMoreBytes);
            }
            let exported_count = cur.get_u32();
            let device = match exported_count {
                0 => None,
                1 => {
                    if buf.len() < REP_DEVLIST_HEADER_SIZE + DEVLIST_ENTRY_SIZE {
                        return Ok(Decoded::NeedMoreBytes);
                    }
                    let descriptor = DeviceDescriptor::read_from(&mut cur)?;
                    let mut interfaces = [InterfaceDescriptor::default(); MAX_INTERFACES];
                    for iface in interfaces.iter_mut() {
                        *iface = InterfaceDescriptor::read_from(&mut cur);
                    }
                    Some(ExportedDevice {
                        descriptor,
                        interfaces,
                    })
                }
                n => return Err(ProtocolError::TooManyDevices(n)),
            };
            let consumed = REP_DEVLIST_HEADER_SIZE
                + if device.is_some() {
                    DEVLIST_ENTRY_SIZE
                } else {
                    0
                };
            complete(Message::RepDevlist(RepDevlist { status, device }), consumed)
        }

        OP_REP_IMPORT => {
            let total = OP_HEADER_SIZE + DEVICE_DESCRIPTOR_SIZE;
            if buf.len() < total {
                return Ok(Decoded::NeedMoreBytes);
            }
            let descriptor = DeviceDescriptor::read_from(&mut cur)?;
            complete(Message::RepImport(RepImport { status, descriptor }), total)
        }

        other => Err(ProtocolError::UnknownOpCode(other)),
    }
}

fn decode_transfer(buf: &[u8]) -> Result<Decoded> {
    if buf.len() < 4 {
        return Ok(Decoded::NeedMoreBytes);
    }

    let mut cur = buf;
    let command = cur.get_u32();
    if !(USBIP_CMD_SUBMIT..=USBIP_RET_UNLINK).contains(&command) {
        return Err(ProtocolError::UnknownCommand(command));
    }
    if buf.len() < XFER_HEADER_SIZE {
        return Ok(Decoded::NeedMoreBytes);
    }

    let header = XferHeader::read_from(&mut cur)?;

    match command {
        USBIP_CMD_SUBMIT => {
            let transfer_flags = cur.get_u32();
            let transfer_buffer_length = cur.get_u32();
            let start_frame = cur.get_u32();
            let number_of_packets = cur.get_u32();
            let interval = cur.get_u32();
            let mut setup = [0u8; 8];
            cur.copy_to_slice(&mut setup);

            check_transfer_length(transfer_buffer_length)?;
            let iso_count = iso_packet_count(number_of_packets)?;
            let data_len = match header.direction {
                Direction::Out => transfer_buffer_length as usize,
                Direction::In => 0,
            };
            let total = XFER_HEADER_SIZE + data_len + iso_count * ISO_PACKET_DESCRIPTOR_SIZE;
            if buf.len() < total {
                return Ok(Decoded::NeedMoreBytes);
            }

            let data = cur[..data_len].to_vec();
            cur.advance(data_len);
            let iso_packets = read_iso_packets(&mut cur, iso_count);

            complete(
                Message::CmdSubmit(CmdSubmit {
                    header,
                    transfer_flags,
                    transfer_buffer_length,
                    start_frame,
                    number_of_packets,
                    interval,
                    setup,
                    data,
                    iso_packets,
                }),
                total,
            )
        }

        USBIP_RET_SUBMIT => {
            let status = cur.get_i32();
            let actual_length = cur.get_u32();
            let start_frame = cur.get_u32();
            let number_of_packets = cur.get_u32();
            let error_count = cur.get_u32();
            cur.advance(8);

            check_transfer_length(actual_length)?;
            let iso_count = iso_packet_count(number_of_packets)?;
            let data_len = match header.direction {
                Direction::In => actual_length as usize,
                Direction::Out => 0,
            };
            let total = XFER_HEADER_SIZE + data_len + iso_count * ISO_PACKET_DESCRIPTOR_SIZE;
            if buf.len() < total {
                return Ok(Decoded::NeedMoreBytes);
            }

            let data = cur[..data_len].to_vec();
            cur.advance(data_len);
            let iso_packets = read_iso_packets(&mut cur, iso_count);

            complete(
                Message::RetSubmit(RetSubmit {
                    header,
                    status,
                    actual_length,
                    start_frame,
                    number_of_packets,
                    error_count,
                    data,
                    iso_packets,
                }),
                total,
            )
        }

        USBIP_CMD_UNLINK => {
            let unlink_seqnum = cur.get_u32();
            complete(
                Message::CmdUnlink(CmdUnlink {
                    header,
                    unlink_seqnum,
                }),
                XFER_HEADER_SIZE,
            )
        }

        _ => {
            let status = cur.get_i32();
            complete(
                Message::RetUnlink(RetUnlink { header, status }),
                XFER_HEADER_SIZE,
            )
        }
    }
}

fn check_transfer_length(length: u32) -> Result<()> {
    if length > MAX_TRANSFER_BUFFER_LENGTH {
        return Err(ProtocolError::TransferTooLarge {
            length,
            max: MAX_TRANSFER_BUFFER_LENGTH,
        });
    }
    Ok(())
}

fn iso_packet_count(number_of_packets: u32) -> Result<usize> {
    if !is_isochronous(number_of_packets) {
        return Ok(0);
    }
    if number_of_packets > MAX_ISO_PACKETS {
        return Err(ProtocolError::TooManyIsoPackets {
            count: number_of_packets,
            max: MAX_ISO_PACKETS,
        });
    }
    Ok(number_of_packets as usize)
}

fn read_iso_packets<B: Buf>(buf: &mut B, count: usize) -> Vec<IsoPacketDescriptor> {
    (0..count)
        .map(|_| IsoPacketDescriptor::read_from(buf))
        .collect()
}

/// Number of bytes [`encode`] produces for `message`
pub fn encoded_len(message: &Message) -> usize {
    match message {
        Message::ReqDevlist(_) => OP_HEADER_SIZE,
        Message::RepDevlist(rep) => {
            REP_DEVLIST_HEADER_SIZE
                + if rep.device.is_some() {
                    DEVLIST_ENTRY_SIZE
                } else {
                    0
                }
        }
        Message::ReqImport(_) => OP_HEADER_SIZE + BUS_ID_SIZE,
        Message::RepImport(_) => OP_HEADER_SIZE + DEVICE_DESCRIPTOR_SIZE,
        Message::CmdSubmit(cmd) => {
            XFER_HEADER_SIZE + cmd.data.len() + cmd.iso_packets.len() * ISO_PACKET_DESCRIPTOR_SIZE
        }
        Message::RetSubmit(ret) => {
            XFER_HEADER_SIZE + ret.data.len() + ret.iso_packets.len() * ISO_PACKET_DESCRIPTOR_SIZE
        }
        Message::CmdUnlink(_) | Message::RetUnlink(_) => XFER_HEADER_SIZE,
    }
}

/// Encode a message to a new byte vector
///
/// # Example
/// ```
/// use protocol::{Message, ReqImport, encode};
///
/// let bytes = encode(&Message::ReqImport(ReqImport::new("1-1"))).unwrap();
/// assert_eq!(bytes.len(), 40);
/// assert_eq!(&bytes[..4], &[0x01, 0x11, 0x80, 0x03]);
/// ```
pub fn encode(message: &Message) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(encoded_len(message));
    encode_into(message, &mut buf)?;
    Ok(buf)
}

/// Encode a message, appending it to `buf`
///
/// Length fields are checked against the payload before anything is
/// written, so `buf` is untouched on error.
pub fn encode_into<B: BufMut>(message: &Message, buf: &mut B) -> Result<()> {
    validate(message)?;

    match message {
        Message::ReqDevlist(req) => put_op_header(buf, OP_REQ_DEVLIST, req.status),
        Message::RepDevlist(rep) => {
            put_op_header(buf, OP_REP_DEVLIST, rep.status);
            buf.put_u32(rep.exported_count());
            if let Some(device) = &rep.device {
                device.descriptor.write_to(buf);
                for iface in &device.interfaces {
                    iface.write_to(buf);
                }
            }
        }
        Message::ReqImport(req) => {
            put_op_header(buf, OP_REQ_IMPORT, req.status);
            put_fixed_str(buf, &req.bus_id, BUS_ID_SIZE);
        }
        Message::RepImport(rep) => {
            put_op_header(buf, OP_REP_IMPORT, rep.status);
            rep.descriptor.write_to(buf);
        }
        Message::CmdSubmit(cmd) => {
            cmd.header.write_to(buf, USBIP_CMD_SUBMIT);
            buf.put_u32(cmd.transfer_flags);
            buf.put_u32(cmd.transfer_buffer_length);
            buf.put_u32(cmd.start_frame);
            buf.put_u32(cmd.number_of_packets);
            buf.put_u32(cmd.interval);
            buf.put_slice(&cmd.setup);
            buf.put_slice(&cmd.data);
            for packet in &cmd.iso_packets {
                packet.write_to(buf);
            }
        }
        Message::RetSubmit(ret) => {
            ret.header.write_to(buf, USBIP_RET_SUBMIT);
            buf.put_i32(ret.status);
            buf.put_u32(ret.actual_length);
            buf.put_u32(ret.start_frame);
            buf.put_u32(ret.number_of_packets);
            buf.put_u32(ret.error_count);
            buf.put_bytes(0, 8);
            buf.put_slice(&ret.data);
            for packet in &ret.iso_packets {
                packet.write_to(buf);
            }
        }
        Message::CmdUnlink(cmd) => {
            cmd.header.write_to(buf, USBIP_CMD_UNLINK);
            buf.put_u32(cmd.unlink_seqnum);
            buf.put_bytes(0, 24);
        }
        Message::RetUnlink(ret) => {
            ret.header.write_to(buf, USBIP_RET_UNLINK);
            buf.put_i32(ret.status);
            buf.put_bytes(0, 24);
        }
    }

    Ok(())
}

fn put_op_header<B: BufMut>(buf: &mut B, code: u16, status: u32) {
    buf.put_u16(USBIP_VERSION);
    buf.put_u16(code);
    buf.put_u32(status);
}

/// Reject messages the decoder would read back differently
fn validate(message: &Message) -> Result<()> {
    match message {
        Message::CmdSubmit(cmd) => {
            check_transfer_length(cmd.transfer_buffer_length)?;
            let expected = match cmd.header.direction {
                Direction::Out => cmd.transfer_buffer_length as usize,
                Direction::In => 0,
            };
            check_payload("transfer_buffer_length", expected, cmd.data.len())?;
            let iso_count = iso_packet_count(cmd.number_of_packets)?;
            check_payload("number_of_packets", iso_count, cmd.iso_packets.len())
        }
        Message::RetSubmit(ret) => {
            check_transfer_length(ret.actual_length)?;
            let expected = match ret.header.direction {
                Direction::In => ret.actual_length as usize,
                Direction::Out => 0,
            };
            check_payload("actual_length", expected, ret.data.len())?;
            let iso_count = iso_packet_count(ret.number_of_packets)?;
            check_payload("number_of_packets", iso_count, ret.iso_packets.len())
        }
        _ => Ok(()),
    }
}

fn check_payload(field: &'static str, declared: usize, actual: usize) -> Result<()> {
    if declared != actual {
        return Err(ProtocolError::PayloadMismatch {
            field,
            declared,
            actual,
        });
    }
    Ok(())
}

/// Write one encoded message to a blocking writer
pub fn write_message<W: Write>(writer: &mut W, message: &Message) -> Result<()> {
    let bytes = encode(message)?;
    writer.write_all(&bytes)?;
    Ok(())
}

/// Read one message from a blocking reader
///
/// `buf` carries bytes across calls: anything read past the end of the
/// returned message stays buffered for the next call.
///
/// # Example
/// ```
/// use bytes::BytesMut;
/// use protocol::{Message, ReqImport, read_message, write_message};
/// use std::io::Cursor;
///
/// let mut wire = Vec::new();
/// write_message(&mut wire, &Message::ReqImport(ReqImport::new("1-1"))).unwrap();
///
/// let mut buf = BytesMut::new();
/// let decoded = read_message(&mut Cursor::new(wire), &mut buf).unwrap();
/// assert!(matches!(decoded, Message::ReqImport(req) if req.bus_id == "1-1"));
/// ```
pub fn read_message<R: Read>(reader: &mut R, buf: &mut BytesMut) -> Result<Message> {
    let mut chunk = [0u8; 4096];
    loop {
        if let Decoded::Complete { message, consumed } = decode(&buf[..])? {
            buf.advance(consumed);
            return Ok(message);
        }
        let n = reader.read(&mut chunk)?;
        if n == 0 {
            return Err(ProtocolError::ConnectionClosed {
                buffered: buf.len(),
            });
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// Async: write one encoded message
#[cfg(feature = "async")]
pub async fn write_message_async<W>(writer: &mut W, message: &Message) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let bytes = encode(message)?;
    writer.write_all(&bytes).await?;
    Ok(())
}

/// Async: read one message, keeping surplus bytes in `buf`
#[cfg(feature = "async")]
pub async fn read_message_async<R>(reader: &mut R, buf: &mut BytesMut) -> Result<Message>
where
    R: AsyncRead + Unpin,
{
    loop {
        if let Decoded::Complete { message, consumed } = decode(&buf[..])? {
            buf.advance(consumed);
            return Ok(message);
        }
        if reader.read_buf(buf).await? == 0 {
            return Err(ProtocolError::ConnectionClosed {
                buffered: buf.len(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DeviceSpeed, OP_STATUS_ERROR};
    use std::io::Cursor;

    fn descriptor() -> DeviceDescriptor {
        DeviceDescriptor {
            path: "/sys/bus/usb/devices/1-1".to_string(),
            bus_id: "1-1".to_string(),
            bus_num: 1,
            dev_num: 2,
            speed: DeviceSpeed::Full,
            vendor_id: 0x1234,
            product_id: 0x5678,
            device_bcd: 0x0200,
            device_class: 0,
            device_subclass: 0,
            device_protocol: 0,
            configuration_value: 1,
            configuration_num: 1,
            interface_num: 1,
        }
    }

    fn roundtrip(message: Message) {
        let bytes = encode(&message).unwrap();
        assert_eq!(bytes.len(), encoded_len(&message));
        match decode(&bytes).unwrap() {
            Decoded::Complete {
                message: decoded,
                consumed,
            } => {
                assert_eq!(consumed, bytes.len());
                assert_eq!(decoded, message);
            }
            Decoded::NeedMoreBytes => panic!("complete encoding decoded as partial"),
        }
    }

    #[test]
    fn test_req_devlist_layout() {
        let bytes = encode(&Message::ReqDevlist(ReqDevlist::default())).unwrap();
        assert_eq!(bytes, vec![0x01, 0x11, 0x80, 0x05, 0, 0, 0, 0]);
    }

    #[test]
    fn test_rep_devlist_sizes() {
        let empty = Message::RepDevlist(RepDevlist::default());
        assert_eq!(encode(&empty).unwrap().len(), 12);

        let one = Message::RepDevlist(RepDevlist {
            status: 0,
            device: Some(ExportedDevice::new(
                descriptor(),
                &[InterfaceDescriptor::new(0x03, 0x01, 0x01)],
            )),
        });
        let bytes = encode(&one).unwrap();
        assert_eq!(bytes.len(), 12 + 312 + 16);
        assert_eq!(&bytes[8..12], &[0, 0, 0, 1]);
        // first interface right after the descriptor
        assert_eq!(&bytes[324..328], &[0x03, 0x01, 0x01, 0x00]);
    }

    #[test]
    fn test_operation_roundtrips() {
        roundtrip(Message::ReqDevlist(ReqDevlist::default()));
        roundtrip(Message::RepDevlist(RepDevlist::default()));
        roundtrip(Message::RepDevlist(RepDevlist {
            status: 0,
            device: Some(ExportedDevice::new(descriptor(), &[])),
        }));
        roundtrip(Message::ReqImport(ReqImport::new("1-1.4")));
        roundtrip(Message::RepImport(RepImport::ok(descriptor())));
        roundtrip(Message::RepImport(RepImport {
            status: OP_STATUS_ERROR,
            descriptor: DeviceDescriptor::default(),
        }));
    }

    #[test]
    fn test_cmd_submit_out_carries_payload() {
        let header = XferHeader::new(5, 0x10002, Direction::Out, 2);
        let msg = Message::CmdSubmit(CmdSubmit::new(header, 4, [0; 8], vec![1, 2, 3, 4]));
        let bytes = encode(&msg).unwrap();
        assert_eq!(bytes.len(), 52);
        assert_eq!(&bytes[48..], &[1, 2, 3, 4]);
        roundtrip(msg);
    }

    #[test]
    fn test_cmd_submit_in_has_no_payload() {
        let header = XferHeader::new(6, 0x10002, Direction::In, 0);
        let setup = [0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x12, 0x00];
        let msg = Message::CmdSubmit(CmdSubmit::new(header, 18, setup, Vec::new()));
        let bytes = encode(&msg).unwrap();
        assert_eq!(bytes.len(), XFER_HEADER_SIZE);
        assert_eq!(&bytes[40..48], &setup);
        roundtrip(msg);
    }

    #[test]
    fn test_iso_descriptors_follow_payload() {
        let header = XferHeader::new(8, 1, Direction::Out, 3);
        let mut cmd = CmdSubmit::new(header, 2, [0; 8], vec![0xAA, 0xBB]);
        cmd.number_of_packets = 2;
        cmd.iso_packets = vec![
            IsoPacketDescriptor {
                offset: 0,
                length: 1,
                actual_length: 0,
                status: 0,
            },
            IsoPacketDescriptor {
                offset: 1,
                length: 1,
                actual_length: 0,
                status: 0,
            },
        ];
        let msg = Message::CmdSubmit(cmd);
        let bytes = encode(&msg).unwrap();
        assert_eq!(bytes.len(), 48 + 2 + 32);
        roundtrip(msg);
    }

    #[test]
    fn test_unlink_roundtrips() {
        let header = XferHeader::new(9, 1, Direction::Out, 0);
        roundtrip(Message::CmdUnlink(CmdUnlink {
            header,
            unlink_seqnum: 7,
        }));
        roundtrip(Message::RetUnlink(RetUnlink {
            header,
            status: -104,
        }));
    }

    #[test]
    fn test_ret_submit_negative_status() {
        let header = XferHeader::new(3, 1, Direction::In, 1);
        let msg = Message::RetSubmit(RetSubmit::failed(header, -32));
        let bytes = encode(&msg).unwrap();
        assert_eq!(&bytes[20..24], &[0xFF, 0xFF, 0xFF, 0xE0]);
        roundtrip(msg);
    }

    #[test]
    fn test_partial_header_needs_more() {
        let bytes = encode(&Message::ReqImport(ReqImport::new("1-1"))).unwrap();
        for len in 0..bytes.len() {
            assert_eq!(decode(&bytes[..len]).unwrap(), Decoded::NeedMoreBytes);
        }
    }

    #[test]
    fn test_partial_payload_needs_more() {
        let header = XferHeader::new(1, 1, Direction::Out, 1);
        let msg = Message::CmdSubmit(CmdSubmit::new(header, 100, [0; 8], vec![7; 100]));
        let bytes = encode(&msg).unwrap();
        assert_eq!(decode(&bytes[..48]).unwrap(), Decoded::NeedMoreBytes);
        assert_eq!(decode(&bytes[..147]).unwrap(), Decoded::NeedMoreBytes);
        assert!(matches!(
            decode(&bytes).unwrap(),
            Decoded::Complete { consumed: 148, .. }
        ));
    }

    #[test]
    fn test_decode_leaves_trailing_bytes() {
        let mut bytes = encode(&Message::ReqDevlist(ReqDevlist::default())).unwrap();
        bytes.extend_from_slice(&[0x01, 0x11]);
        let Decoded::Complete { consumed, .. } = decode(&bytes).unwrap() else {
            panic!("expected complete message");
        };
        assert_eq!(consumed, 8);
    }

    #[test]
    fn test_unsupported_version() {
        let result = decode(&[0x01, 0x06, 0x80, 0x05, 0, 0, 0, 0]);
        assert!(matches!(
            result,
            Err(ProtocolError::UnsupportedVersion(0x0106))
        ));
    }

    #[test]
    fn test_unknown_op_code() {
        let result = decode(&[0x01, 0x11, 0x80, 0x99, 0, 0, 0, 0]);
        assert!(matches!(result, Err(ProtocolError::UnknownOpCode(0x8099))));
    }

    #[test]
    fn test_unknown_command_detected_early() {
        let result = decode(&[0x00, 0x00, 0x00, 0x07]);
        assert!(matches!(result, Err(ProtocolError::UnknownCommand(7))));
    }

    #[test]
    fn test_invalid_direction() {
        let header = XferHeader::new(1, 1, Direction::In, 1);
        let mut bytes = encode(&Message::CmdUnlink(CmdUnlink {
            header,
            unlink_seqnum: 0,
        }))
        .unwrap();
        bytes[15] = 2;
        assert!(matches!(
            decode(&bytes),
            Err(ProtocolError::InvalidDirection(2))
        ));
    }

    #[test]
    fn test_oversized_transfer_rejected_from_header() {
        let header = XferHeader::new(1, 1, Direction::Out, 1);
        let mut bytes = encode(&Message::CmdSubmit(CmdSubmit::new(
            header,
            0,
            [0; 8],
            Vec::new(),
        )))
        .unwrap();
        bytes[24..28].copy_from_slice(&u32::MAX.to_be_bytes());
        let err = decode(&bytes).unwrap_err();
        assert!(err.is_malformed());
        assert!(matches!(err, ProtocolError::TransferTooLarge { .. }));
    }

    #[test]
    fn test_too_many_devices() {
        let mut bytes = encode(&Message::RepDevlist(RepDevlist::default())).unwrap();
        bytes[8..12].copy_from_slice(&2u32.to_be_bytes());
        assert!(matches!(
            decode(&bytes),
            Err(ProtocolError::TooManyDevices(2))
        ));
    }

    #[test]
    fn test_encode_rejects_length_mismatch() {
        let header = XferHeader::new(1, 1, Direction::Out, 1);
        let msg = Message::CmdSubmit(CmdSubmit::new(header, 8, [0; 8], vec![1, 2]));
        let mut buf = Vec::new();
        let err = encode_into(&msg, &mut buf).unwrap_err();
        assert!(matches!(err, ProtocolError::PayloadMismatch { .. }));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_non_iso_marker_carries_no_descriptors() {
        let header = XferHeader::new(2, 1, Direction::In, 1);
        let mut cmd = CmdSubmit::new(header, 64, [0; 8], Vec::new());
        cmd.number_of_packets = 0xFFFF_FFFF;
        roundtrip(Message::CmdSubmit(cmd));
    }

    #[test]
    fn test_read_message_across_calls() {
        let mut wire = Vec::new();
        write_message(&mut wire, &Message::ReqDevlist(ReqDevlist::default())).unwrap();
        write_message(&mut wire, &Message::ReqImport(ReqImport::new("2-1"))).unwrap();

        let mut cursor = Cursor::new(wire);
        let mut buf = BytesMut::new();
        assert!(matches!(
            read_message(&mut cursor, &mut buf).unwrap(),
            Message::ReqDevlist(_)
        ));
        assert!(matches!(
            read_message(&mut cursor, &mut buf).unwrap(),
            Message::ReqImport(_)
        ));
        assert!(matches!(
            read_message(&mut cursor, &mut buf),
            Err(ProtocolError::ConnectionClosed { buffered: 0 })
        ));
    }
}
