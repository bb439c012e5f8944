#![no_main]

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use libfuzzer_sys::fuzz_target;
use rudp_core::buffer::{BufferPool, OversizePool};
use rudp_core::config::TransportConfig;
use rudp_core::connection::Connection;
use rudp_core::packet::HeaderType;

fn addr() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9000)
}

/// Fuzz `Connection::receive` across every header byte, for both a
/// `Connecting` and an already-`Connected` connection. This exercises the
/// channel-level receive/ack paths (not just header parsing), which must
/// never panic on malformed or adversarial datagrams.
fuzz_target!(|data: &[u8]| {
    if data.is_empty() {
        return;
    }
    let pool = BufferPool::new(1432);
    let oversize = OversizePool::new(1432);

    for connected in [false, true] {
        let mut conn = if connected {
            Connection::new_accepted(addr(), TransportConfig::default())
        } else {
            Connection::new_outgoing(addr(), TransportConfig::default())
        };

        for header in 0u8..8 {
            let mut framed = vec![header];
            framed.extend_from_slice(data);

            let mut buf = pool.get();
            let n = framed.len().min(buf.capacity());
            if buf.write_bytes(&framed[..n]).is_err() {
                continue;
            }
            let mut outgoing = Vec::new();
            let mut deliverable = Vec::new();
            let _ = conn.receive(&pool, &oversize, buf, &mut outgoing, &mut deliverable);
            for pkt in outgoing {
                pkt.return_to_pool(&pool);
            }
            for pkt in deliverable {
                pkt.return_to_pool(&pool);
            }
        }
    }
    let _ = HeaderType::from_byte(data[0]);
});
