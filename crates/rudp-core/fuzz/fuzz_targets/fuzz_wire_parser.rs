#![no_main]

use libfuzzer_sys::fuzz_target;
use rudp_core::buffer::BufferPool;
use rudp_core::packet::{decode_varint_from_slice, HeaderType, Packet};

/// Fuzz the wire parser across every header type, not just whatever byte
/// happens to land first in `data`.
///
/// The slice-level varint decoder and the full `Packet::from_received`
/// pipeline must never panic, regardless of which header byte (valid or
/// not) prefixes the datagram.
fuzz_target!(|data: &[u8]| {
    let _ = decode_varint_from_slice(data);

    let headers = [
        HeaderType::Connect,
        HeaderType::ConnectApproved,
        HeaderType::Data,
        HeaderType::Acknowledgement,
        HeaderType::Ping,
        HeaderType::Pong,
        HeaderType::Disconnect,
    ];
    let pool = BufferPool::new(1432);
    for header in headers {
        let mut framed = Vec::with_capacity(data.len() + 1);
        framed.push(header as u8);
        framed.extend_from_slice(data);

        let mut buf = pool.get();
        let n = framed.len().min(buf.capacity());
        if buf.write_bytes(&framed[..n]).is_err() {
            continue;
        }
        let pkt = Packet::from_received(buf);
        let _ = pkt.channel_id();
        let _ = pkt.read_seq();
        let _ = pkt.read_frag();
        let _ = pkt.read_ack_bitmask();
        let _ = pkt.read_request_id();
        let _ = pkt.app_packet_id();
    }
});
