//! End-to-end client/server scenarios, driven over real loopback UDP
//! sockets rather than the in-process test harness used by `node.rs`'s own
//! unit tests.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rudp_core::buffer::BufferPool;
use rudp_core::channel::ChannelKind;
use rudp_core::config::TransportConfig;
use rudp_core::connection::ConnectionState;
use rudp_core::node::{Client, Server};
use rudp_core::packet::Packet;
use rudp_core::socket::{SocketConfig, UdpSocketImpl};

fn bind_ephemeral() -> Arc<UdpSocketImpl> {
    Arc::new(UdpSocketImpl::ephemeral(SocketConfig::default()).expect("bind ephemeral UDP socket"))
}

/// Poll `condition`, ticking both endpoints on every iteration so
/// retransmission, connect-retry and ping timers keep advancing while we
/// wait — neither `Client` nor `Server` ticks itself.
fn pump_until(client: &Client, server: &Server, mut condition: impl FnMut() -> bool, timeout: Duration) -> bool {
    let start = Instant::now();
    loop {
        client.tick();
        server.tick();
        if condition() {
            return true;
        }
        if start.elapsed() >= timeout {
            return condition();
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}

/// A client sends one small payload over the ordered reliable channel
/// and the server's registered handler sees the exact bytes.
#[test]
fn hello_world_over_reliable_channel() {
    let server_sock = bind_ephemeral();
    let server_addr = server_sock.local_addr().unwrap();
    let client_sock = bind_ephemeral();

    let server = Server::start(server_sock, TransportConfig::default());
    let received: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
    let got = received.clone();
    server.register_handler(1, move |view, _from| {
        let payload: Vec<u8> = (0..b"Hello world!".len()).map(|i| view.byte(i)).collect();
        got.lock().unwrap().push(payload);
    });

    let client = Client::connect(client_sock, server_addr, TransportConfig::default());
    assert!(pump_until(&client, &server, || client.state() == ConnectionState::Connected, Duration::from_secs(2)));

    let pool = BufferPool::new(1432);
    let mut pkt = Packet::new_data(&pool, ChannelKind::Reliable as u8, 1);
    pkt.append_payload(b"Hello world!").unwrap();
    client.send(ChannelKind::Reliable as u8, pkt).unwrap();

    assert!(pump_until(
        &client,
        &server,
        || received.lock().unwrap().iter().any(|p| p.as_slice() == b"Hello world!"),
        Duration::from_secs(2),
    ));

    client.shutdown();
    server.stop();
}

/// Every reliably-sent packet in a batch still arrives exactly once
/// when 30% of datagrams are dropped in transit.
#[test]
fn reliable_delivery_survives_thirty_percent_loss() {
    let cfg = TransportConfig { packet_loss: 0.3, ..TransportConfig::default() };

    let server_sock = bind_ephemeral();
    let server_addr = server_sock.local_addr().unwrap();
    let client_sock = bind_ephemeral();

    let server = Server::start(server_sock, cfg.clone());
    let received: Arc<Mutex<Vec<u16>>> = Arc::new(Mutex::new(Vec::new()));
    let got = received.clone();
    server.register_handler(2, move |view, _from| {
        if let Ok(id) = view.app_packet_id() {
            got.lock().unwrap().push(id);
        }
    });

    let client = Client::connect(client_sock, server_addr, cfg.clone());
    assert!(pump_until(&client, &server, || client.state() == ConnectionState::Connected, Duration::from_secs(3)));

    const N: u16 = 40;
    let pool = BufferPool::new(cfg.max_size);
    for i in 0..N {
        let mut pkt = Packet::new_data(&pool, ChannelKind::Reliable as u8, i);
        pkt.append_payload(&i.to_le_bytes()).unwrap();
        client.send(ChannelKind::Reliable as u8, pkt).unwrap();
    }

    assert!(pump_until(
        &client,
        &server,
        || received.lock().unwrap().len() as u16 >= N,
        Duration::from_secs(15),
    ));

    let mut ids = received.lock().unwrap().clone();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), N as usize, "every packet must arrive exactly once despite 30% loss");
    assert_eq!(ids, (0..N).collect::<Vec<_>>(), "reliable-ordered delivery must preserve send order");

    client.shutdown();
    server.stop();
}

/// A 10KB payload is fragmented on send and reassembles byte-exact on
/// the far side.
#[test]
fn fragmented_payload_reassembles_byte_exact() {
    let server_sock = bind_ephemeral();
    let server_addr = server_sock.local_addr().unwrap();
    let client_sock = bind_ephemeral();

    let payload: Vec<u8> = (0..10 * 1024usize).map(|i| (i % 256) as u8).collect();
    let expected_len = payload.len();

    let server = Server::start(server_sock, TransportConfig::default());
    let received: Arc<Mutex<Option<Vec<u8>>>> = Arc::new(Mutex::new(None));
    let got = received.clone();
    server.register_handler(3, move |view, _from| {
        let bytes: Vec<u8> = (0..expected_len).map(|i| view.byte(i)).collect();
        *got.lock().unwrap() = Some(bytes);
    });

    let client = Client::connect(client_sock, server_addr, TransportConfig::default());
    assert!(pump_until(&client, &server, || client.state() == ConnectionState::Connected, Duration::from_secs(2)));

    let pool = BufferPool::new(1432);
    let mut pkt = Packet::new_data(&pool, ChannelKind::Fragmented as u8, 3);
    pkt.append_payload(&payload).unwrap();
    client.send(ChannelKind::Fragmented as u8, pkt).unwrap();

    assert!(pump_until(&client, &server, || received.lock().unwrap().is_some(), Duration::from_secs(5)));
    assert_eq!(received.lock().unwrap().as_deref(), Some(payload.as_slice()));

    client.shutdown();
    server.stop();
}

/// Once the peer stops answering pings entirely, a connected client
/// times out instead of hanging forever.
#[test]
fn connection_times_out_once_pongs_stop_arriving() {
    let cfg = TransportConfig {
        ping_period: Duration::from_millis(20),
        timeout: Duration::from_millis(200),
        connect_retry_delay: Duration::from_millis(20),
        ..TransportConfig::default()
    };

    let server_sock = bind_ephemeral();
    let server_addr = server_sock.local_addr().unwrap();
    let client_sock = bind_ephemeral();

    let server = Server::start(server_sock, cfg.clone());
    let client = Client::connect(client_sock, server_addr, cfg.clone());
    assert!(pump_until(&client, &server, || client.state() == ConnectionState::Connected, Duration::from_secs(2)));

    // Sever the path entirely: stop the server so no pong ever answers a ping.
    server.stop();

    let timed_out = pump_until(
        &client,
        &server,
        || client.state() == ConnectionState::Disconnected,
        Duration::from_secs(3),
    );
    assert!(timed_out, "client must time out once pongs stop arriving, not hang indefinitely");

    client.shutdown();
}
