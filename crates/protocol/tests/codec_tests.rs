//! Codec integration tests
//!
//! Covers:
//! - Roundtrips for every message shape, including empty and maximum payloads
//! - Incremental decoding with arbitrary chunk boundaries
//! - Rejection of malformed byte streams
//!
//! Run with: `cargo test -p protocol`

use bytes::BytesMut;
use proptest::prelude::*;
use protocol::{
    CmdSubmit, CmdUnlink, Decoded, DeviceDescriptor, DeviceSpeed, Direction, ExportedDevice,
    InterfaceDescriptor, IsoPacketDescriptor, MAX_TRANSFER_BUFFER_LENGTH, Message, ProtocolError,
    RepDevlist, RepImport, ReqDevlist, ReqImport, RetSubmit, RetUnlink, XferHeader, decode, encode,
};

// ============================================================================
// Test Utilities
// ============================================================================

fn decode_complete(bytes: &[u8]) -> (Message, usize) {
    match decode(bytes).expect("decode failed") {
        Decoded::Complete { message, consumed } => (message, consumed),
        Decoded::NeedMoreBytes => panic!("expected a complete message"),
    }
}

/// Feed `bytes` through an accumulating buffer `chunk` bytes at a time,
/// collecting every message that completes along the way
fn decode_chunked(bytes: &[u8], chunk: usize) -> Vec<Message> {
    let mut buf = BytesMut::new();
    let mut out = Vec::new();
    for piece in bytes.chunks(chunk) {
        buf.extend_from_slice(piece);
        while let Decoded::Complete { message, consumed } = decode(&buf[..]).unwrap() {
            let _ = buf.split_to(consumed);
            out.push(message);
        }
    }
    assert!(buf.is_empty(), "{} bytes left undecoded", buf.len());
    out
}

fn speed_strategy() -> impl Strategy<Value = DeviceSpeed> {
    prop_oneof![
        Just(DeviceSpeed::Unknown),
        Just(DeviceSpeed::Low),
        Just(DeviceSpeed::Full),
        Just(DeviceSpeed::High),
        Just(DeviceSpeed::Super),
        Just(DeviceSpeed::SuperPlus),
    ]
}

fn direction_strategy() -> impl Strategy<Value = Direction> {
    prop_oneof![Just(Direction::Out), Just(Direction::In)]
}

fn descriptor_strategy() -> impl Strategy<Value = DeviceDescriptor> {
    (
        "/sys/bus/usb/devices/[0-9a-z.-]{1,40}",
        "[1-9]-[1-9](\\.[1-9]){0,4}",
        any::<u16>(),
        any::<u16>(),
        speed_strategy(),
        any::<(u16, u16, u16)>(),
        any::<(u8, u8, u8, u8, u8, u8)>(),
    )
        .prop_map(
            |(path, bus_id, bus_num, dev_num, speed, ids, class_bytes)| DeviceDescriptor {
                path,
                bus_id,
                bus_num: u32::from(bus_num),
                dev_num: u32::from(dev_num),
                speed,
                vendor_id: ids.0,
                product_id: ids.1,
                device_bcd: ids.2,
                device_class: class_bytes.0,
                device_subclass: class_bytes.1,
                device_protocol: class_bytes.2,
                configuration_value: class_bytes.3,
                configuration_num: class_bytes.4,
                interface_num: class_bytes.5,
            },
        )
}

fn header_strategy() -> impl Strategy<Value = XferHeader> {
    (any::<u32>(), any::<u32>(), direction_strategy(), 0u32..16)
        .prop_map(|(seq, dev, dir, ep)| XferHeader::new(seq, dev, dir, ep))
}

fn iso_strategy() -> impl Strategy<Value = Vec<IsoPacketDescriptor>> {
    prop::collection::vec(
        any::<(u32, u32, u32, u32)>().prop_map(|(offset, length, actual_length, status)| {
            IsoPacketDescriptor {
                offset,
                length,
                actual_length,
                status,
            }
        }),
        0..8,
    )
}

fn cmd_submit_strategy() -> impl Strategy<Value = Message> {
    (
        header_strategy(),
        prop::collection::vec(any::<u8>(), 0..2048),
        0u32..4096,
        any::<[u8; 8]>(),
        iso_strategy(),
        any::<(u32, u32, u32)>(),
    )
        .prop_map(|(header, payload, in_length, setup, iso, extra)| {
            let (length, data) = match header.direction {
                Direction::Out => (payload.len() as u32, payload),
                Direction::In => (in_length, Vec::new()),
            };
            let mut cmd = CmdSubmit::new(header, length, setup, data);
            cmd.transfer_flags = extra.0;
            cmd.start_frame = extra.1;
            cmd.interval = extra.2;
            cmd.number_of_packets = iso.len() as u32;
            cmd.iso_packets = iso;
            Message::CmdSubmit(cmd)
        })
}

fn ret_submit_strategy() -> impl Strategy<Value = Message> {
    (
        header_strategy(),
        prop::collection::vec(any::<u8>(), 0..2048),
        any::<i32>(),
        0u32..4096,
        iso_strategy(),
    )
        .prop_map(|(header, data, status, out_length, iso)| {
            let mut ret = RetSubmit::completed(header, status, out_length, data);
            ret.number_of_packets = iso.len() as u32;
            ret.error_count = iso.iter().filter(|p| p.status != 0).count() as u32;
            ret.iso_packets = iso;
            Message::RetSubmit(ret)
        })
}

fn message_strategy() -> impl Strategy<Value = Message> {
    prop_oneof![
        any::<u32>().prop_map(|status| Message::ReqDevlist(ReqDevlist { status })),
        Just(Message::RepDevlist(RepDevlist::default())),
        (
            descriptor_strategy(),
            prop::collection::vec(any::<(u8, u8, u8)>(), 0..5)
        )
            .prop_map(|(descriptor, ifaces)| {
                let ifaces: Vec<_> = ifaces
                    .into_iter()
                    .map(|(c, s, p)| InterfaceDescriptor::new(c, s, p))
                    .collect();
                Message::RepDevlist(RepDevlist {
                    status: 0,
                    device: Some(ExportedDevice::new(descriptor, &ifaces)),
                })
            }),
        "[1-9]-[1-9](\\.[1-9]){0,4}".prop_map(|bus_id| Message::ReqImport(ReqImport::new(bus_id))),
        descriptor_strategy().prop_map(|d| Message::RepImport(RepImport::ok(d))),
        Just(Message::RepImport(RepImport::error())),
        cmd_submit_strategy(),
        ret_submit_strategy(),
        (header_strategy(), any::<u32>()).prop_map(|(header, unlink_seqnum)| {
            Message::CmdUnlink(CmdUnlink {
                header,
                unlink_seqnum,
            })
        }),
        (header_strategy(), any::<i32>())
            .prop_map(|(header, status)| Message::RetUnlink(RetUnlink { header, status })),
    ]
}

// ============================================================================
// Property Tests
// ============================================================================

proptest! {
    #[test]
    fn prop_roundtrip(msg in message_strategy()) {
        let bytes = encode(&msg).unwrap();
        let (decoded, consumed) = decode_complete(&bytes);
        prop_assert_eq!(consumed, bytes.len());
        prop_assert_eq!(decoded, msg);
    }

    #[test]
    fn prop_every_strict_prefix_needs_more(msg in message_strategy()) {
        let bytes = encode(&msg).unwrap();
        for len in 0..bytes.len() {
            prop_assert_eq!(decode(&bytes[..len]).unwrap(), Decoded::NeedMoreBytes);
        }
    }

    #[test]
    fn prop_chunked_matches_whole(
        msgs in prop::collection::vec(message_strategy(), 1..6),
        chunk in 1usize..700,
    ) {
        let mut stream = Vec::new();
        for msg in &msgs {
            stream.extend(encode(msg).unwrap());
        }
        prop_assert_eq!(decode_chunked(&stream, chunk), msgs);
    }
}

// ============================================================================
// Boundary Payloads
// ============================================================================

#[test]
fn test_zero_length_out_submit() {
    let msg = Message::CmdSubmit(CmdSubmit::new(
        XferHeader::new(1, 0x0001_0002, Direction::Out, 1),
        0,
        [0; 8],
        Vec::new(),
    ));
    let bytes = encode(&msg).unwrap();
    assert_eq!(bytes.len(), 48);
    assert_eq!(decode_complete(&bytes).0, msg);
}

#[test]
fn test_maximum_out_submit() {
    let len = MAX_TRANSFER_BUFFER_LENGTH as usize;
    let msg = Message::CmdSubmit(CmdSubmit::new(
        XferHeader::new(2, 0x0001_0002, Direction::Out, 2),
        MAX_TRANSFER_BUFFER_LENGTH,
        [0; 8],
        vec![0x42; len],
    ));
    let bytes = encode(&msg).unwrap();
    assert_eq!(bytes.len(), 48 + len);
    assert_eq!(decode(&bytes[..bytes.len() - 1]).unwrap(), Decoded::NeedMoreBytes);

    let (decoded, consumed) = decode_complete(&bytes);
    assert_eq!(consumed, bytes.len());
    assert_eq!(decoded, msg);
}

#[test]
fn test_maximum_in_submit_has_no_payload() {
    let msg = Message::CmdSubmit(CmdSubmit::new(
        XferHeader::new(3, 0x0001_0002, Direction::In, 1),
        MAX_TRANSFER_BUFFER_LENGTH,
        [0; 8],
        Vec::new(),
    ));
    assert_eq!(encode(&msg).unwrap().len(), 48);
}

#[test]
fn test_byte_at_a_time_devlist_then_submit() {
    let devlist = Message::RepDevlist(RepDevlist {
        status: 0,
        device: Some(ExportedDevice::new(
            DeviceDescriptor {
                bus_id: "3-1.2".to_string(),
                bus_num: 3,
                dev_num: 9,
                speed: DeviceSpeed::High,
                ..Default::default()
            },
            &[InterfaceDescriptor::new(0x03, 0x00, 0x00)],
        )),
    });
    let submit = Message::CmdSubmit(CmdSubmit::new(
        XferHeader::new(1, 0x0003_0009, Direction::Out, 1),
        5,
        [0; 8],
        b"hello".to_vec(),
    ));

    let mut stream = encode(&devlist).unwrap();
    stream.extend(encode(&submit).unwrap());

    assert_eq!(decode_chunked(&stream, 1), vec![devlist, submit]);
}

// ============================================================================
// Malformed Input
// ============================================================================

#[test]
fn test_wrong_version_is_malformed() {
    let err = decode(&[0x01, 0x00, 0x80, 0x05, 0, 0, 0, 0]).unwrap_err();
    assert!(err.is_malformed());
    assert!(matches!(err, ProtocolError::UnsupportedVersion(0x0100)));
}

#[test]
fn test_garbage_is_malformed() {
    let err = decode(b"GET / HTTP/1.1\r\n").unwrap_err();
    assert!(err.is_malformed());
}

#[test]
fn test_unknown_command_is_malformed() {
    let mut bytes = vec![0u8; 48];
    bytes[3] = 9;
    let err = decode(&bytes).unwrap_err();
    assert!(matches!(err, ProtocolError::UnknownCommand(9)));
}

#[test]
fn test_invalid_speed_in_rep_import() {
    let mut bytes = encode(&Message::RepImport(RepImport::ok(DeviceDescriptor::default()))).unwrap();
    // speed lives after path, bus_id, bus_num, dev_num
    let speed_offset = 8 + 256 + 32 + 8;
    bytes[speed_offset + 3] = 0x42;
    let err = decode(&bytes).unwrap_err();
    assert!(matches!(err, ProtocolError::InvalidSpeed(0x42)));
}

#[test]
fn test_too_many_iso_packets() {
    let mut bytes = encode(&Message::CmdSubmit(CmdSubmit::new(
        XferHeader::new(1, 1, Direction::In, 1),
        0,
        [0; 8],
        Vec::new(),
    )))
    .unwrap();
    bytes[32..36].copy_from_slice(&5000u32.to_be_bytes());
    assert!(matches!(
        decode(&bytes),
        Err(ProtocolError::TooManyIsoPackets { count: 5000, .. })
    ));
}

#[test]
fn test_oversized_ret_submit() {
    let mut bytes = encode(&Message::RetSubmit(RetSubmit::failed(
        XferHeader::new(1, 1, Direction::In, 1),
        0,
    )))
    .unwrap();
    bytes[24..28].copy_from_slice(&(MAX_TRANSFER_BUFFER_LENGTH + 1).to_be_bytes());
    assert!(matches!(
        decode(&bytes),
        Err(ProtocolError::TransferTooLarge { .. })
    ));
}

// ============================================================================
// Stream Helpers
// ============================================================================

#[tokio::test]
async fn test_async_stream_roundtrip() {
    use protocol::{read_message_async, write_message_async};

    let (mut client, mut server) = tokio::io::duplex(64);
    let msgs = vec![
        Message::ReqImport(ReqImport::new("1-4")),
        Message::CmdSubmit(CmdSubmit::new(
            XferHeader::new(11, 0x0001_0004, Direction::Out, 3),
            300,
            [0; 8],
            vec![0x11; 300],
        )),
    ];

    let expected = msgs.clone();
    let writer = tokio::spawn(async move {
        for msg in &msgs {
            write_message_async(&mut client, msg).await.unwrap();
        }
    });

    let mut buf = BytesMut::new();
    for msg in expected {
        assert_eq!(read_message_async(&mut server, &mut buf).await.unwrap(), msg);
    }
    writer.await.unwrap();
}
