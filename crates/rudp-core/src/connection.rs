//! Per-endpoint state machine: channel slot array, connect handshake,
//! ping/pong liveness and RTT tracking, header-byte dispatch.
//!
//! Grounded on `strata-transport`'s `Session`/`RttTracker` pair in the
//! superseded `session.rs`, restructured around a three-state machine
//! (Disconnected/Connecting/Connected) in place of the source's five-state
//! session lifecycle, and reusing [`crate::stats::Ewma`] for SRTT/RTTVAR
//! smoothing instead of the source's hand-rolled RFC 6298 update.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tracing::warn;

use crate::buffer::{Buffer, BufferPool, OversizePool};
use crate::channel::{
    Channel, ChannelKind, RecvEnv, ReliableFragmentChannel, ReliablePacketChannel, SendEnv,
    SendOutcome, SequencedChannel, UnreliableChannel, RESERVED_SLOTS,
};
use crate::config::TransportConfig;
use crate::error::{DisconnectCause, SendError};
use crate::packet::{HeaderType, Packet};
use crate::stats::{ChannelStats, Ewma};

/// Total channel slots: 0..15 reserved for built-ins, 16..255 for
/// user-registered custom channels.
const SLOT_COUNT: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Terminal events a `Connection` surfaces to its owning `Node`.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    Connected,
    Disconnected { cause: DisconnectCause },
}

/// Result of driving the client-side connect retry loop forward one tick.
pub enum ConnectTick {
    /// Not yet time to retry, or not in `Connecting`.
    Idle,
    /// Resend this `Connect` packet.
    Resend(Packet),
    /// Exhausted `connect_max_attempts`; the connection is now `Disconnected`.
    TimedOut,
}

struct ChannelSlot {
    channel: Box<dyn Channel>,
}

fn install_builtin_channels(channels: &mut [Option<ChannelSlot>]) {
    channels[ChannelKind::Unreliable as usize] = Some(ChannelSlot { channel: Box::new(UnreliableChannel::new()) });
    channels[ChannelKind::Sequenced as usize] = Some(ChannelSlot { channel: Box::new(SequencedChannel::new()) });
    channels[ChannelKind::ReliableUnordered as usize] =
        Some(ChannelSlot { channel: Box::new(ReliablePacketChannel::new(false)) });
    channels[ChannelKind::Reliable as usize] =
        Some(ChannelSlot { channel: Box::new(ReliablePacketChannel::new(true)) });
    channels[ChannelKind::FragmentedUnordered as usize] =
        Some(ChannelSlot { channel: Box::new(ReliableFragmentChannel::new(false)) });
    channels[ChannelKind::Fragmented as usize] =
        Some(ChannelSlot { channel: Box::new(ReliableFragmentChannel::new(true)) });
}

/// Per-endpoint connection state: the channel array plus handshake and
/// liveness bookkeeping. Owned by the node's connection table; never holds
/// a back-reference to it (see the ownership note in `channel/mod.rs`).
pub struct Connection {
    remote: SocketAddr,
    state: ConnectionState,
    channels: Vec<Option<ChannelSlot>>,
    cfg: TransportConfig,

    connect_attempts: u32,
    last_connect_attempt: Instant,

    next_ping_id: u32,
    last_sent_ping_id: Option<u32>,
    last_ping_sent_at: Instant,
    last_accepted_pong_id: Option<u32>,
    last_pong_at: Instant,

    smoothed_rtt: Ewma,
    rtt_deviation: Ewma,
}

impl Connection {
    fn new(remote: SocketAddr, cfg: TransportConfig, state: ConnectionState) -> Self {
        let mut channels: Vec<Option<ChannelSlot>> = (0..SLOT_COUNT).map(|_| None).collect();
        install_builtin_channels(&mut channels);
        let now = Instant::now();
        let smoothed_rtt = Ewma::new(cfg.rtt_alpha);
        let rtt_deviation = Ewma::new(cfg.rtt_beta);
        Connection {
            remote,
            state,
            channels,
            connect_attempts: 1,
            last_connect_attempt: now,
            next_ping_id: 0,
            last_sent_ping_id: None,
            last_ping_sent_at: now,
            last_accepted_pong_id: None,
            last_pong_at: now,
            smoothed_rtt,
            rtt_deviation,
            cfg,
        }
    }

    /// Client-initiated connection: starts in `Connecting`, the caller is
    /// responsible for sending the first `Connect` datagram.
    pub fn new_outgoing(remote: SocketAddr, cfg: TransportConfig) -> Self {
        Connection::new(remote, cfg, ConnectionState::Connecting)
    }

    /// Server-accepted connection: the handshake is already satisfied by
    /// virtue of the inbound `Connect` that triggered its creation.
    pub fn new_accepted(remote: SocketAddr, cfg: TransportConfig) -> Self {
        Connection::new(remote, cfg, ConnectionState::Connected)
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn smoothed_rtt(&self) -> Duration {
        Duration::from_secs_f64(self.smoothed_rtt.value().max(0.0))
    }

    pub fn rtt_deviation(&self) -> Duration {
        Duration::from_secs_f64(self.rtt_deviation.value().max(0.0))
    }

    pub fn channel_stats(&self, slot: u8) -> Option<&ChannelStats> {
        self.channels.get(slot as usize)?.as_ref().map(|s| s.channel.stats())
    }

    /// Install a custom channel into `slot`. Fails if `slot` is reserved
    /// (< [`RESERVED_SLOTS`]) or already occupied.
    pub fn install_channel(&mut self, slot: u8, channel: Box<dyn Channel>) -> Result<(), SendError> {
        if slot < RESERVED_SLOTS {
            return Err(SendError::ChannelSlotUnavailable { slot });
        }
        let idx = slot as usize;
        if self.channels[idx].is_some() {
            return Err(SendError::ChannelSlotUnavailable { slot });
        }
        self.channels[idx] = Some(ChannelSlot { channel });
        Ok(())
    }

    /// Route a send through the channel at `slot`. Fails without consuming
    /// any pool resources beyond returning `packet` if not `Connected` or
    /// the slot is empty.
    pub fn send(
        &mut self,
        slot: u8,
        pool: &BufferPool,
        oversize: &OversizePool,
        packet: Packet,
        outgoing: &mut Vec<Packet>,
    ) -> Result<SendOutcome, SendError> {
        if self.state != ConnectionState::Connected {
            packet.return_to_pool(pool);
            return Err(SendError::NotConnected { state: self.state });
        }
        let Some(channel_slot) = self.channels.get_mut(slot as usize).and_then(|s| s.as_mut()) else {
            packet.return_to_pool(pool);
            return Err(SendError::ChannelSlotUnavailable { slot });
        };
        let mut env = SendEnv {
            pool,
            oversize,
            cfg: &self.cfg,
            channel_id: slot,
            smoothed_rtt: Duration::from_secs_f64(self.smoothed_rtt.value().max(0.0)),
            outgoing,
        };
        channel_slot.channel.send(&mut env, packet)
    }

    /// Header-byte dispatch for an inbound datagram already addressed to
    /// this connection, minus `Connect` which only the node can route since
    /// it may create a brand new connection.
    pub fn receive(
        &mut self,
        pool: &BufferPool,
        oversize: &OversizePool,
        buf: Buffer,
        outgoing: &mut Vec<Packet>,
        deliverable: &mut Vec<Packet>,
    ) -> Option<ConnectionEvent> {
        let pkt = Packet::from_received(buf);
        let Some(header) = pkt.header_type() else {
            warn!("dropping datagram with unrecognized header byte");
            pkt.return_to_pool(pool);
            return None;
        };

        match header {
            HeaderType::Data | HeaderType::Acknowledgement => {
                let Ok(channel_id) = pkt.channel_id() else {
                    pkt.return_to_pool(pool);
                    return None;
                };
                let view = pkt.into_view();
                let Some(slot) = self.channels.get_mut(channel_id as usize).and_then(|s| s.as_mut()) else {
                    warn!(channel_id, "datagram for unknown or uninstalled channel slot, dropping");
                    return None;
                };
                let mut env = RecvEnv {
                    pool,
                    oversize,
                    cfg: &self.cfg,
                    channel_id,
                    smoothed_rtt: Duration::from_secs_f64(self.smoothed_rtt.value().max(0.0)),
                    outgoing,
                    deliverable,
                };
                if header == HeaderType::Data {
                    slot.channel.receive(&mut env, view);
                } else {
                    slot.channel.receive_ack(&mut env, view);
                }
                None
            }
            HeaderType::Ping => {
                let request_id = pkt.read_request_id().unwrap_or(0);
                pkt.return_to_pool(pool);
                outgoing.push(Packet::new_ping_pong(pool, HeaderType::Pong, request_id));
                None
            }
            HeaderType::Pong => {
                let request_id = pkt.read_request_id().unwrap_or(0);
                pkt.return_to_pool(pool);
                self.accept_pong(request_id);
                None
            }
            HeaderType::Disconnect => {
                pkt.return_to_pool(pool);
                if self.state == ConnectionState::Disconnected {
                    None
                } else {
                    self.state = ConnectionState::Disconnected;
                    Some(ConnectionEvent::Disconnected { cause: DisconnectCause::PeerDisconnected })
                }
            }
            HeaderType::ConnectApproved => {
                pkt.return_to_pool(pool);
                if self.state == ConnectionState::Connecting {
                    self.state = ConnectionState::Connected;
                    self.last_pong_at = Instant::now();
                    Some(ConnectionEvent::Connected)
                } else {
                    None
                }
            }
            HeaderType::Connect => {
                // A duplicate Connect on an already-established connection
                // just means our prior ConnectApproved was lost; the node
                // is responsible for resending it. A brand new endpoint's
                // Connect never reaches here (no Connection exists yet).
                pkt.return_to_pool(pool);
                None
            }
        }
    }

    /// Pong with `request_id` greater than the last accepted one updates
    /// liveness and the RTT estimate; the correction term recovers the
    /// true send time for a pong answering an older, already-superseded
    /// ping (skipped or reordered pongs).
    fn accept_pong(&mut self, request_id: u32) {
        if let Some(last_accepted) = self.last_accepted_pong_id {
            if request_id <= last_accepted {
                return;
            }
        }
        let Some(last_sent) = self.last_sent_ping_id else { return };
        let skipped = last_sent.wrapping_sub(request_id);
        let raw_rtt = self.last_ping_sent_at.elapsed() + self.cfg.ping_period * skipped;

        self.last_accepted_pong_id = Some(request_id);
        self.last_pong_at = Instant::now();

        let raw = raw_rtt.as_secs_f64();
        let prior_srtt = self.smoothed_rtt.value();
        self.smoothed_rtt.update(raw);
        self.rtt_deviation.update((raw - prior_srtt).abs());
    }

    /// Send a new ping if `ping_period` has elapsed since the last one.
    pub fn tick_ping(&mut self, pool: &BufferPool) -> Option<Packet> {
        if self.state != ConnectionState::Connected {
            return None;
        }
        if self.last_ping_sent_at.elapsed() < self.cfg.ping_period {
            return None;
        }
        let id = self.next_ping_id;
        self.next_ping_id = self.next_ping_id.wrapping_add(1);
        self.last_sent_ping_id = Some(id);
        self.last_ping_sent_at = Instant::now();
        Some(Packet::new_ping_pong(pool, HeaderType::Ping, id))
    }

    /// Drive the client-side connect retry loop.
    pub fn tick_connect(&mut self, pool: &BufferPool) -> ConnectTick {
        if self.state != ConnectionState::Connecting {
            return ConnectTick::Idle;
        }
        if self.last_connect_attempt.elapsed() < self.cfg.connect_retry_delay {
            return ConnectTick::Idle;
        }
        if self.connect_attempts >= self.cfg.connect_max_attempts {
            self.state = ConnectionState::Disconnected;
            return ConnectTick::TimedOut;
        }
        self.connect_attempts += 1;
        self.last_connect_attempt = Instant::now();
        ConnectTick::Resend(Packet::new_control(pool, HeaderType::Connect))
    }

    /// Liveness timeout: no pong (or `ConnectApproved`) observed within
    /// `cfg.timeout`.
    pub fn check_timeout(&mut self) -> Option<ConnectionEvent> {
        if self.state == ConnectionState::Connected && self.last_pong_at.elapsed() > self.cfg.timeout {
            self.state = ConnectionState::Disconnected;
            return Some(ConnectionEvent::Disconnected { cause: DisconnectCause::Timeout });
        }
        None
    }

    /// Drive every channel's retransmit timers forward one tick. Returns
    /// `true` if any channel reported a packet lost past
    /// `max_resend_attempts`, which the caller should treat as a timeout.
    pub fn retransmit_tick(&mut self, pool: &BufferPool, oversize: &OversizePool, outgoing: &mut Vec<Packet>) -> bool {
        let smoothed_rtt = self.smoothed_rtt();
        let mut any_lost = false;
        for (idx, slot) in self.channels.iter_mut().enumerate() {
            let Some(slot) = slot else { continue };
            let mut env =
                SendEnv { pool, oversize, cfg: &self.cfg, channel_id: idx as u8, smoothed_rtt, outgoing };
            let outcome = slot.channel.retransmit_tick(&mut env);
            any_lost |= outcome.packet_lost;
        }
        any_lost
    }

    pub fn force_timeout(&mut self) -> ConnectionEvent {
        self.state = ConnectionState::Disconnected;
        ConnectionEvent::Disconnected { cause: DisconnectCause::Timeout }
    }

    /// Local disconnect: best-effort `Disconnect` datagram, no reply awaited.
    pub fn disconnect_local(&mut self, pool: &BufferPool) -> Option<Packet> {
        if self.state == ConnectionState::Disconnected {
            return None;
        }
        self.state = ConnectionState::Disconnected;
        Some(Packet::new_control(pool, HeaderType::Disconnect))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn addr() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9000)
    }

    #[test]
    fn connect_approved_transitions_to_connected() {
        let pool = BufferPool::new(1432);
        let oversize = OversizePool::new(1432);
        let mut conn = Connection::new_outgoing(addr(), TransportConfig::default());
        assert_eq!(conn.state(), ConnectionState::Connecting);

        let approved = Packet::new_control(&pool, HeaderType::ConnectApproved);
        let raw = approved.into_buffer();
        let mut outgoing = Vec::new();
        let mut deliverable = Vec::new();
        let event = conn.receive(&pool, &oversize, raw, &mut outgoing, &mut deliverable);
        assert!(matches!(event, Some(ConnectionEvent::Connected)));
        assert_eq!(conn.state(), ConnectionState::Connected);
    }

    #[test]
    fn send_before_connected_is_rejected_and_returns_packet() {
        let pool = BufferPool::new(1432);
        let oversize = OversizePool::new(1432);
        let mut conn = Connection::new_outgoing(addr(), TransportConfig::default());
        let pkt = Packet::new_data(&pool, 0, 1);
        let mut outgoing = Vec::new();
        let before = pool.allocation_count();
        let result = conn.send(0, &pool, &oversize, pkt, &mut outgoing);
        assert!(matches!(result, Err(SendError::NotConnected { state: ConnectionState::Connecting })));
        // no new allocation: the packet's buffer went back to the pool, not leaked.
        assert_eq!(pool.allocation_count(), before);
    }

    #[test]
    fn installing_into_reserved_or_occupied_slot_fails() {
        let mut conn = Connection::new_accepted(addr(), TransportConfig::default());
        assert!(conn.install_channel(3, Box::new(UnreliableChannel::new())).is_err());
        assert!(conn.install_channel(16, Box::new(UnreliableChannel::new())).is_ok());
        assert!(conn.install_channel(16, Box::new(UnreliableChannel::new())).is_err());
    }

    #[test]
    fn pong_updates_smoothed_rtt_toward_raw_sample() {
        let mut conn = Connection::new_accepted(addr(), TransportConfig::default());
        conn.last_ping_sent_at = Instant::now() - Duration::from_millis(50);
        conn.next_ping_id = 1;
        conn.last_sent_ping_id = Some(0);

        conn.accept_pong(0);
        let rtt = conn.smoothed_rtt();
        assert!(rtt >= Duration::from_millis(40) && rtt <= Duration::from_millis(80), "got {rtt:?}");

        // A stale (already-accepted) pong id must not perturb the estimate.
        let before = conn.smoothed_rtt();
        conn.accept_pong(0);
        assert_eq!(conn.smoothed_rtt(), before);
    }

    #[test]
    fn timeout_fires_after_configured_duration_without_a_pong() {
        let cfg = TransportConfig { timeout: Duration::from_millis(1), ..TransportConfig::default() };
        let mut conn = Connection::new_accepted(addr(), cfg);
        conn.last_pong_at = Instant::now() - Duration::from_millis(10);
        let event = conn.check_timeout();
        assert!(matches!(event, Some(ConnectionEvent::Disconnected { cause: DisconnectCause::Timeout })));
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn connect_retry_exhausts_after_max_attempts() {
        let cfg = TransportConfig {
            connect_max_attempts: 2,
            connect_retry_delay: Duration::from_millis(0),
            ..TransportConfig::default()
        };
        let pool = BufferPool::new(1432);
        let mut conn = Connection::new_outgoing(addr(), cfg);

        match conn.tick_connect(&pool) {
            ConnectTick::Resend(pkt) => pkt.return_to_pool(&pool),
            _ => panic!("expected a resend on the second attempt"),
        }
        match conn.tick_connect(&pool) {
            ConnectTick::TimedOut => {}
            _ => panic!("expected TimedOut once connect_max_attempts is reached"),
        }
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }
}
