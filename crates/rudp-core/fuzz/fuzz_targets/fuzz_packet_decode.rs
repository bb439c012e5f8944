#![no_main]

use libfuzzer_sys::fuzz_target;
use rudp_core::buffer::BufferPool;
use rudp_core::packet::Packet;

/// Fuzz the inbound-datagram decode pipeline.
///
/// Exercises `Packet::from_received` plus every header-field accessor and
/// the read-only `PacketView` conversion. None of these may panic on
/// arbitrary bytes arriving off the wire.
fuzz_target!(|data: &[u8]| {
    let pool = BufferPool::new(1432);
    let mut buf = pool.get();
    let n = data.len().min(buf.capacity());
    if buf.write_bytes(&data[..n]).is_err() {
        return;
    }

    let pkt = Packet::from_received(buf);
    let _ = pkt.header_type();
    let _ = pkt.channel_id();
    let _ = pkt.read_seq();
    let _ = pkt.read_frag();
    let _ = pkt.read_ack_bitmask();
    let _ = pkt.read_request_id();
    let _ = pkt.app_packet_id();
    let _ = pkt.payload_from(0);

    let view = pkt.into_view();
    let _ = view.header_type();
    let _ = view.app_packet_id();
    let _ = view.payload_from(0);
});
