use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use rudp_core::buffer::{BufferPool, OversizePool};
use rudp_core::channel::ChannelKind;
use rudp_core::config::TransportConfig;
use rudp_core::connection::Connection;
use rudp_core::packet::Packet;

fn addr(port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
}

/// Benchmark bare packet construction: the per-send allocation-free path.
fn bench_packet_construction(c: &mut Criterion) {
    let pool = BufferPool::new(1432);
    let payload = vec![0xABu8; 1200];

    let mut group = c.benchmark_group("packet");
    group.throughput(Throughput::Bytes(1200));
    group.bench_function("new_data_append_payload", |b| {
        b.iter(|| {
            let mut pkt = Packet::new_data(&pool, ChannelKind::Reliable as u8, 1);
            pkt.append_payload(black_box(payload.as_slice())).unwrap();
            pkt.return_to_pool(&pool);
        });
    });
    group.finish();
}

/// Benchmark a full send → receive → ack round trip on the reliable
/// channel, feeding the ack back so pending-packet state doesn't grow
/// across iterations.
fn bench_reliable_send_receive(c: &mut Criterion) {
    let pool = BufferPool::new(1432);
    let oversize = OversizePool::new(1432);
    let payload = vec![0xABu8; 1200];

    let mut group = c.benchmark_group("reliable_channel");
    group.throughput(Throughput::Elements(1));
    group.bench_function("send_then_receive", |b| {
        let mut sender = Connection::new_accepted(addr(29200), TransportConfig::default());
        let mut receiver = Connection::new_accepted(addr(29201), TransportConfig::default());
        b.iter(|| {
            let mut pkt = Packet::new_data(&pool, ChannelKind::Reliable as u8, 7);
            pkt.append_payload(black_box(payload.as_slice())).unwrap();
            let mut outgoing = Vec::new();
            sender.send(ChannelKind::Reliable as u8, &pool, &oversize, pkt, &mut outgoing).unwrap();

            let mut reply = Vec::new();
            let mut deliverable = Vec::new();
            for wire in outgoing {
                let buf = wire.into_buffer();
                receiver.receive(&pool, &oversize, buf, &mut reply, &mut deliverable);
            }
            for delivered in deliverable {
                black_box(delivered.size());
                delivered.return_to_pool(&pool);
            }

            let mut ignore_out = Vec::new();
            let mut ignore_deliver = Vec::new();
            for ack in reply {
                let buf = ack.into_buffer();
                sender.receive(&pool, &oversize, buf, &mut ignore_out, &mut ignore_deliver);
            }
        });
    });
    group.finish();
}

/// Benchmark a 10KB payload through the fragmenting channel: fragmentation
/// on send, reassembly on receive, per-fragment acks fed back.
fn bench_fragment_round_trip(c: &mut Criterion) {
    let pool = BufferPool::new(1432);
    let oversize = OversizePool::new(1432);
    let payload = vec![0xCDu8; 10 * 1024];

    let mut group = c.benchmark_group("fragment_channel");
    group.throughput(Throughput::Bytes(10 * 1024));
    group.bench_function("send_then_receive_10kb", |b| {
        let mut sender = Connection::new_accepted(addr(29210), TransportConfig::default());
        let mut receiver = Connection::new_accepted(addr(29211), TransportConfig::default());
        b.iter(|| {
            let mut pkt = Packet::new_data(&pool, ChannelKind::Fragmented as u8, 9);
            pkt.append_payload(black_box(payload.as_slice())).unwrap();
            let mut outgoing = Vec::new();
            sender.send(ChannelKind::Fragmented as u8, &pool, &oversize, pkt, &mut outgoing).unwrap();

            let mut reply = Vec::new();
            let mut deliverable = Vec::new();
            for wire in outgoing {
                let buf = wire.into_buffer();
                receiver.receive(&pool, &oversize, buf, &mut reply, &mut deliverable);
            }
            for delivered in deliverable {
                black_box(delivered.size());
                delivered.return_to_pool(&pool);
            }

            let mut ignore_out = Vec::new();
            let mut ignore_deliver = Vec::new();
            for ack in reply {
                let buf = ack.into_buffer();
                sender.receive(&pool, &oversize, buf, &mut ignore_out, &mut ignore_deliver);
            }
        });
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_packet_construction,
    bench_reliable_send_receive,
    bench_fragment_round_trip
);
criterion_main!(benches);
