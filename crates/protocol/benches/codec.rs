//! Benchmarks for the USB/IP codec
//!
//! Measures encoding/decoding cost for:
//! - Operation-stage messages (devlist, import)
//! - Bulk transfers of growing size
//! - Decoding a message delivered in small chunks

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use protocol::{
    CmdSubmit, Decoded, DeviceDescriptor, DeviceSpeed, Direction, ExportedDevice,
    InterfaceDescriptor, Message, RepDevlist, RetSubmit, XferHeader, decode, encode,
};

fn sample_descriptor() -> DeviceDescriptor {
    DeviceDescriptor {
        path: "/sys/devices/pci0000:00/0000:00:14.0/usb1/1-2".to_string(),
        bus_id: "1-2".to_string(),
        bus_num: 1,
        dev_num: 3,
        speed: DeviceSpeed::High,
        vendor_id: 0x0781,
        product_id: 0x5567,
        device_bcd: 0x0100,
        device_class: 0,
        device_subclass: 0,
        device_protocol: 0,
        configuration_value: 1,
        configuration_num: 1,
        interface_num: 1,
    }
}

fn benchmark_operations(c: &mut Criterion) {
    let mut group = c.benchmark_group("operations");

    let devlist = Message::RepDevlist(RepDevlist {
        status: 0,
        device: Some(ExportedDevice::new(
            sample_descriptor(),
            &[InterfaceDescriptor::new(0x08, 0x06, 0x50)],
        )),
    });

    group.bench_function("encode_rep_devlist", |b| {
        b.iter(|| encode(black_box(&devlist)))
    });

    let bytes = encode(&devlist).unwrap();
    group.bench_function("decode_rep_devlist", |b| {
        b.iter(|| decode(black_box(&bytes)))
    });

    group.finish();
}

fn benchmark_bulk_transfers(c: &mut Criterion) {
    let mut group = c.benchmark_group("bulk_transfers");

    for size in [64usize, 512, 4096, 65536] {
        group.throughput(Throughput::Bytes(size as u64));

        let out = Message::CmdSubmit(CmdSubmit::new(
            XferHeader::new(1, 0x0001_0003, Direction::Out, 2),
            size as u32,
            [0; 8],
            vec![0xAB; size],
        ));
        let out_bytes = encode(&out).unwrap();

        group.bench_with_input(BenchmarkId::new("encode_cmd_submit", size), &out, |b, m| {
            b.iter(|| encode(black_box(m)))
        });
        group.bench_with_input(
            BenchmarkId::new("decode_cmd_submit", size),
            &out_bytes,
            |b, bytes| b.iter(|| decode(black_box(bytes))),
        );

        let ret = Message::RetSubmit(RetSubmit::completed(
            XferHeader::new(1, 0x0001_0003, Direction::In, 1),
            0,
            size as u32,
            vec![0xCD; size],
        ));
        group.bench_with_input(BenchmarkId::new("encode_ret_submit", size), &ret, |b, m| {
            b.iter(|| encode(black_box(m)))
        });
    }

    group.finish();
}

fn benchmark_chunked_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("chunked_decode");

    let msg = Message::CmdSubmit(CmdSubmit::new(
        XferHeader::new(7, 0x0001_0003, Direction::Out, 2),
        16384,
        [0; 8],
        vec![0x5A; 16384],
    ));
    let bytes = encode(&msg).unwrap();

    for chunk in [512usize, 1536] {
        group.bench_with_input(BenchmarkId::new("chunk", chunk), &chunk, |b, &chunk| {
            b.iter(|| {
                let mut end = 0;
                loop {
                    end = (end + chunk).min(bytes.len());
                    if let Decoded::Complete { consumed, .. } = decode(&bytes[..end]).unwrap() {
                        break consumed;
                    }
                }
            })
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    benchmark_operations,
    benchmark_bulk_transfers,
    benchmark_chunked_decode
);
criterion_main!(benches);
