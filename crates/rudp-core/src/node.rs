//! Node, Client, Server: socket ownership, receive loop,
//! pending-dispatch/action queues drained on `tick()`, connection map.
//!
//! Grounded on the same two-thread model the design notes call for: a
//! dedicated receive thread does stateless parsing plus channel-level
//! receive work and only ever *enqueues*; the application thread drains
//! both queues from `tick()`. Retransmission, the ping timer, and the
//! client connect-retry loop are all polled from `tick()` too — the
//! "single-threaded timer wheel polled by the application thread" option
//! the design notes offer as an alternative to a dedicated timer pool.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, error, warn};

use crate::buffer::{BufferPool, OversizePool};
use crate::channel::SendOutcome;
use crate::config::TransportConfig;
use crate::connection::{Connection, ConnectionEvent, ConnectionState, ConnectTick};
use crate::error::{DisconnectCause, SendError};
use crate::packet::{HeaderType, Packet, PacketView};
use crate::socket::DatagramSocket;

/// Registered callback for one application packet id.
pub type PacketHandler = Box<dyn Fn(&PacketView, SocketAddr) + Send + Sync>;

/// Terminal event surfaced to the application from `tick()`.
#[derive(Debug, Clone)]
pub enum NodeEvent {
    Connected { remote: SocketAddr },
    Disconnected { remote: SocketAddr, cause: DisconnectCause },
    /// Server-side: a new endpoint completed the handshake.
    ClientConnected { remote: SocketAddr },
}

struct PendingDatagram {
    packet: Packet,
    sender: SocketAddr,
}

fn pick_latency(cfg: &TransportConfig) -> Duration {
    if cfg.max_latency > cfg.min_latency {
        let min_ns = cfg.min_latency.as_nanos() as u64;
        let max_ns = cfg.max_latency.as_nanos() as u64;
        let ns = rand::thread_rng().gen_range(min_ns..=max_ns);
        Duration::from_nanos(ns)
    } else {
        cfg.min_latency
    }
}

/// Shared node engine. A [`Client`] wraps one with exactly one connection;
/// a [`Server`] wraps one with many. Always held behind an `Arc` since the
/// receive thread and the application thread share it.
pub struct Node {
    socket: Arc<dyn DatagramSocket>,
    pool: Arc<BufferPool>,
    oversize: Arc<OversizePool>,
    cfg: TransportConfig,

    connections: Mutex<HashMap<SocketAddr, Mutex<Connection>>>,
    handlers: Mutex<HashMap<u16, PacketHandler>>,
    pending_dispatch: Mutex<VecDeque<PendingDatagram>>,
    pending_actions: Mutex<VecDeque<NodeEvent>>,

    shutdown_flag: AtomicBool,
    receive_thread: Mutex<Option<JoinHandle<()>>>,
}

impl Node {
    pub fn new(socket: Arc<dyn DatagramSocket>, cfg: TransportConfig) -> Arc<Node> {
        let cfg = cfg.validated();
        Arc::new(Node {
            pool: Arc::new(BufferPool::new(cfg.max_size)),
            oversize: Arc::new(OversizePool::new(cfg.max_size)),
            socket,
            connections: Mutex::new(HashMap::new()),
            handlers: Mutex::new(HashMap::new()),
            pending_dispatch: Mutex::new(VecDeque::new()),
            pending_actions: Mutex::new(VecDeque::new()),
            shutdown_flag: AtomicBool::new(false),
            receive_thread: Mutex::new(None),
            cfg,
        })
    }

    pub fn register_handler(&self, app_id: u16, handler: impl Fn(&PacketView, SocketAddr) + Send + Sync + 'static) {
        self.handlers.lock().unwrap().insert(app_id, Box::new(handler));
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn connection_state(&self, remote: SocketAddr) -> Option<ConnectionState> {
        self.connections.lock().unwrap().get(&remote).map(|c| c.lock().unwrap().state())
    }

    pub fn connected_remotes(&self) -> Vec<SocketAddr> {
        self.connections
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, c)| c.lock().unwrap().state() == ConnectionState::Connected)
            .map(|(&addr, _)| addr)
            .collect()
    }

    /// Client-side: begin the connect handshake. Creates the `Connecting`
    /// connection and sends the first `Connect` immediately; retries are
    /// driven by `tick()`.
    pub fn connect_to(&self, remote: SocketAddr) {
        let conn = Connection::new_outgoing(remote, self.cfg.clone());
        self.connections.lock().unwrap().insert(remote, Mutex::new(conn));
        let pkt = Packet::new_control(&self.pool, HeaderType::Connect);
        self.transmit(pkt, remote);
    }

    pub fn send(&self, remote: SocketAddr, slot: u8, packet: Packet) -> Result<SendOutcome, SendError> {
        let conns = self.connections.lock().unwrap();
        let Some(conn_mutex) = conns.get(&remote) else {
            packet.return_to_pool(&self.pool);
            return Err(SendError::NotConnected { state: ConnectionState::Disconnected });
        };
        let mut conn = conn_mutex.lock().unwrap();
        let mut outgoing = Vec::new();
        let result = conn.send(slot, &self.pool, &self.oversize, packet, &mut outgoing);
        drop(conn);
        drop(conns);
        for pkt in outgoing {
            self.transmit(pkt, remote);
        }
        result
    }

    /// Best-effort local disconnect: send `Disconnect`, drop the
    /// connection without awaiting any reply.
    pub fn disconnect(&self, remote: SocketAddr) {
        let maybe_pkt = {
            let mut conns = self.connections.lock().unwrap();
            conns
                .remove(&remote)
                .and_then(|conn_mutex| conn_mutex.into_inner().unwrap().disconnect_local(&self.pool))
        };
        if let Some(pkt) = maybe_pkt {
            self.transmit(pkt, remote);
        }
    }

    pub fn spawn_receive_thread(self: &Arc<Self>) {
        let node = Arc::clone(self);
        let handle = std::thread::spawn(move || node.receive_loop());
        *self.receive_thread.lock().unwrap() = Some(handle);
    }

    pub fn shutdown(&self) {
        self.shutdown_flag.store(true, Ordering::Relaxed);
        if let Some(handle) = self.receive_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    /// Drains the pending-dispatch and pending-action queues and drives
    /// every connection's ping, connect-retry, and retransmit timers
    /// forward one step. Returns the terminal events observed this tick.
    pub fn tick(&self) -> Vec<NodeEvent> {
        self.drive_connection_timers();
        self.dispatch_ready_packets();
        self.pending_actions.lock().unwrap().drain(..).collect()
    }

    fn drive_connection_timers(&self) {
        let conns = self.connections.lock().unwrap();
        let mut to_remove = Vec::new();
        for (&addr, conn_mutex) in conns.iter() {
            let mut conn = conn_mutex.lock().unwrap();
            let mut outgoing = Vec::new();

            if let Some(ping) = conn.tick_ping(&self.pool) {
                outgoing.push(ping);
            }

            match conn.tick_connect(&self.pool) {
                ConnectTick::Resend(pkt) => outgoing.push(pkt),
                ConnectTick::TimedOut => {
                    self.pending_actions
                        .lock()
                        .unwrap()
                        .push_back(NodeEvent::Disconnected { remote: addr, cause: DisconnectCause::Timeout });
                    to_remove.push(addr);
                }
                ConnectTick::Idle => {}
            }

            if conn.retransmit_tick(&self.pool, &self.oversize, &mut outgoing) {
                conn.force_timeout();
                self.pending_actions
                    .lock()
                    .unwrap()
                    .push_back(NodeEvent::Disconnected { remote: addr, cause: DisconnectCause::Timeout });
                to_remove.push(addr);
            } else if let Some(ConnectionEvent::Disconnected { cause }) = conn.check_timeout() {
                self.pending_actions.lock().unwrap().push_back(NodeEvent::Disconnected { remote: addr, cause });
                to_remove.push(addr);
            }

            drop(conn);
            for pkt in outgoing {
                self.transmit(pkt, addr);
            }
        }
        drop(conns);
        if !to_remove.is_empty() {
            let mut conns = self.connections.lock().unwrap();
            for addr in to_remove {
                conns.remove(&addr);
            }
        }
    }

    fn dispatch_ready_packets(&self) {
        let drained: Vec<PendingDatagram> = self.pending_dispatch.lock().unwrap().drain(..).collect();
        let handlers = self.handlers.lock().unwrap();
        for entry in drained {
            let app_id = entry.packet.app_packet_id().unwrap_or(0);
            let sender = entry.sender;
            let view = entry.packet.into_view();
            match handlers.get(&app_id) {
                Some(handler) => handler(&view, sender),
                None => debug!(app_id, %sender, "no handler registered for application packet id, dropping"),
            }
            view.into_packet().return_to_pool(&self.pool);
        }
    }

    fn transmit(&self, packet: Packet, to: SocketAddr) {
        let bytes = packet.buffer().written().to_vec();
        if let Err(e) = self.socket.send_to(&bytes, to) {
            warn!(error = %e, remote = %to, "send_to failed");
        }
        packet.return_to_pool(&self.pool);
    }

    fn receive_loop(self: Arc<Self>) {
        let mut scratch = vec![0u8; self.cfg.max_size];
        while !self.shutdown_flag.load(Ordering::Relaxed) {
            match self.socket.recv_from(&mut scratch) {
                Ok((n, from)) => self.accept_datagram(&scratch[..n], from),
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                    ) =>
                {
                    continue
                }
                // A reset datagram (ICMP port-unreachable echoed back by the
                // OS) is benign for a connectionless socket; keep looping.
                Err(e) if e.kind() == io::ErrorKind::ConnectionReset => continue,
                Err(e) => {
                    error!(error = %e, "receive socket error, ending receive loop");
                    break;
                }
            }
        }
    }

    fn accept_datagram(self: &Arc<Self>, data: &[u8], from: SocketAddr) {
        if self.cfg.packet_loss > 0.0 && rand::thread_rng().gen_bool(self.cfg.packet_loss) {
            return;
        }
        if self.cfg.max_latency > Duration::ZERO {
            // Copy now: `scratch` in `receive_loop` is reused by the very
            // next `recv_from`, so the delayed dispatch can't borrow it.
            let owned = data.to_vec();
            let delay = pick_latency(&self.cfg);
            let node = Arc::clone(self);
            std::thread::spawn(move || {
                std::thread::sleep(delay);
                node.handle_datagram_bytes(&owned, from);
            });
        } else {
            self.handle_datagram_bytes(data, from);
        }
    }

    fn handle_datagram_bytes(&self, data: &[u8], from: SocketAddr) {
        if data.is_empty() {
            return;
        }
        match HeaderType::from_byte(data[0]) {
            Some(HeaderType::Connect) => self.handle_connect(from),
            Some(_) => {
                let mut buf = self.pool.get();
                if buf.write_bytes(data).is_err() {
                    warn!(len = data.len(), max = self.cfg.max_size, "datagram exceeds MaxSize, dropping");
                    self.pool.return_buffer(buf);
                    return;
                }
                self.dispatch_to_connection(buf, from);
            }
            None => warn!(header_byte = data[0], %from, "dropping datagram with unrecognized header byte"),
        }
    }

    fn handle_connect(&self, from: SocketAddr) {
        let mut conns = self.connections.lock().unwrap();
        if conns.contains_key(&from) {
            // The peer's prior ConnectApproved may have been lost; resend
            // it rather than disturbing the existing connection.
            drop(conns);
            self.transmit(Packet::new_control(&self.pool, HeaderType::ConnectApproved), from);
            return;
        }
        if let Some(max) = self.cfg.max_clients {
            if conns.len() >= max {
                debug!(%from, "connect rejected: server at capacity");
                return;
            }
        }
        conns.insert(from, Mutex::new(Connection::new_accepted(from, self.cfg.clone())));
        drop(conns);
        self.transmit(Packet::new_control(&self.pool, HeaderType::ConnectApproved), from);
        self.pending_actions.lock().unwrap().push_back(NodeEvent::ClientConnected { remote: from });
    }

    fn dispatch_to_connection(&self, buf: crate::buffer::Buffer, from: SocketAddr) {
        let conns = self.connections.lock().unwrap();
        let Some(conn_mutex) = conns.get(&from) else {
            warn!(%from, "datagram from unrecognized endpoint, dropping");
            self.pool.return_buffer(buf);
            return;
        };
        let mut conn = conn_mutex.lock().unwrap();
        let mut outgoing = Vec::new();
        let mut deliverable = Vec::new();
        let event = conn.receive(&self.pool, &self.oversize, buf, &mut outgoing, &mut deliverable);
        drop(conn);
        let should_remove = matches!(event, Some(ConnectionEvent::Disconnected { .. }));
        drop(conns);

        for pkt in outgoing {
            self.transmit(pkt, from);
        }
        for pkt in deliverable {
            self.pending_dispatch.lock().unwrap().push_back(PendingDatagram { packet: pkt, sender: from });
        }
        match event {
            Some(ConnectionEvent::Connected) => {
                self.pending_actions.lock().unwrap().push_back(NodeEvent::Connected { remote: from })
            }
            Some(ConnectionEvent::Disconnected { cause }) => {
                self.pending_actions.lock().unwrap().push_back(NodeEvent::Disconnected { remote: from, cause })
            }
            None => {}
        }
        if should_remove {
            self.connections.lock().unwrap().remove(&from);
        }
    }
}

/// Exactly one connection.
pub struct Client {
    node: Arc<Node>,
    remote: SocketAddr,
}

impl Client {
    pub fn connect(socket: Arc<dyn DatagramSocket>, remote: SocketAddr, cfg: TransportConfig) -> Client {
        let node = Node::new(socket, cfg);
        node.spawn_receive_thread();
        node.connect_to(remote);
        Client { node, remote }
    }

    pub fn register_handler(&self, app_id: u16, handler: impl Fn(&PacketView, SocketAddr) + Send + Sync + 'static) {
        self.node.register_handler(app_id, handler);
    }

    pub fn send(&self, slot: u8, packet: Packet) -> Result<SendOutcome, SendError> {
        self.node.send(self.remote, slot, packet)
    }

    pub fn state(&self) -> ConnectionState {
        self.node.connection_state(self.remote).unwrap_or(ConnectionState::Disconnected)
    }

    pub fn disconnect(&self) {
        self.node.disconnect(self.remote);
    }

    pub fn tick(&self) -> Vec<NodeEvent> {
        self.node.tick()
    }

    pub fn shutdown(&self) {
        self.node.shutdown();
    }
}

/// Keyed connection map, one per accepted endpoint.
pub struct Server {
    node: Arc<Node>,
}

impl Server {
    pub fn start(socket: Arc<dyn DatagramSocket>, cfg: TransportConfig) -> Server {
        let node = Node::new(socket, cfg);
        node.spawn_receive_thread();
        Server { node }
    }

    pub fn register_handler(&self, app_id: u16, handler: impl Fn(&PacketView, SocketAddr) + Send + Sync + 'static) {
        self.node.register_handler(app_id, handler);
    }

    pub fn send(&self, remote: SocketAddr, slot: u8, packet: Packet) -> Result<SendOutcome, SendError> {
        self.node.send(remote, slot, packet)
    }

    /// Iterate connected endpoints and send a clone of `payload` to each,
    /// so no single `Packet` is consumed by more than one connection's
    /// send path.
    pub fn broadcast(&self, slot: u8, payload: Packet) {
        for remote in self.node.connected_remotes() {
            let _ = self.node.send(remote, slot, payload.clone());
        }
        payload.return_to_pool(&self.node.pool);
    }

    pub fn connected_remotes(&self) -> Vec<SocketAddr> {
        self.node.connected_remotes()
    }

    pub fn tick(&self) -> Vec<NodeEvent> {
        self.node.tick()
    }

    pub fn stop(&self) {
        for remote in self.node.connected_remotes() {
            self.node.disconnect(remote);
        }
        self.node.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelKind;
    use crate::socket::test_support::LoopbackSocket;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::Mutex as StdMutex;
    use std::time::Instant;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    fn wait_until(mut f: impl FnMut() -> bool, timeout: Duration) -> bool {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if f() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        f()
    }

    /// Hello world over a reliable channel.
    #[test]
    fn hello_world_round_trip() {
        let client_addr = addr(29100);
        let server_addr = addr(29101);
        let (client_sock, server_sock) = LoopbackSocket::pair(client_addr, server_addr);

        let received: Arc<StdMutex<Vec<Vec<u8>>>> = Arc::new(StdMutex::new(Vec::new()));
        let server = Server::start(server_sock, TransportConfig::default());
        let got = received.clone();
        server.register_handler(1, move |view, _from| {
            let payload: Vec<u8> = (0..b"Hello world!".len()).map(|i| view.byte(i)).collect();
            got.lock().unwrap().push(payload);
        });

        let client = Client::connect(client_sock, server_addr, TransportConfig::default());

        wait_until(|| client.state() == ConnectionState::Connected, Duration::from_secs(2));
        assert_eq!(client.state(), ConnectionState::Connected);

        let pool = BufferPool::new(1432);
        let mut pkt = Packet::new_data(&pool, ChannelKind::Reliable as u8, 1);
        pkt.append_payload(b"Hello world!").unwrap();
        client.send(ChannelKind::Reliable as u8, pkt).unwrap();

        let delivered = wait_until(
            || received.lock().unwrap().iter().any(|p| p == b"Hello world!"),
            Duration::from_secs(2),
        );
        assert!(delivered, "server handler never observed the payload");

        client.shutdown();
        server.stop();
    }

    #[test]
    fn disconnect_is_observed_by_the_peer() {
        let client_addr = addr(29110);
        let server_addr = addr(29111);
        let (client_sock, server_sock) = LoopbackSocket::pair(client_addr, server_addr);

        let server = Server::start(server_sock, TransportConfig::default());
        let client = Client::connect(client_sock, server_addr, TransportConfig::default());

        wait_until(|| client.state() == ConnectionState::Connected, Duration::from_secs(2));
        client.disconnect();

        let server_saw_disconnect = wait_until(
            || server.tick().iter().any(|e| matches!(e, NodeEvent::Disconnected { cause: DisconnectCause::PeerDisconnected, .. })),
            Duration::from_secs(2),
        );
        assert!(server_saw_disconnect);

        client.shutdown();
        server.stop();
    }
}
