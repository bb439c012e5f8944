//! Enumerated configuration, matching the external-interfaces table.

use std::time::Duration;

/// Ethernet MTU (1500) minus a 20-byte IP header minus an 8-byte UDP
/// header, the same default every rudp implementation in the wild uses.
pub const DEFAULT_MAX_SIZE: usize = 1432;

/// Smallest `MaxSize` the config accepts (safe across typical VPN/tunnel
/// overhead).
pub const MIN_MAX_SIZE: usize = 508;

/// Largest `MaxSize` the config accepts; a UDP datagram cannot exceed this.
pub const MAX_MAX_SIZE: usize = 65535;

/// A buffer larger than this is dropped rather than pooled, so a few
/// oversize allocations can't permanently inflate the pool.
pub const POOL_EVICTION_THRESHOLD: usize = 64 * 1024;

/// Fragment payloads may not exceed this count per outer sequence
/// (fragment numbers use 15 bits plus a last-fragment flag bit).
pub const MAX_FRAGMENTS: usize = 1 << 15;

#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Maximum datagram payload size, including header.
    pub max_size: usize,
    /// Simulated packet loss probability, `[0, 1]`. Test-only.
    pub packet_loss: f64,
    /// Simulated minimum added latency. Test-only.
    pub min_latency: Duration,
    /// Simulated maximum added latency. Test-only.
    pub max_latency: Duration,
    /// Ping period.
    pub ping_period: Duration,
    /// Liveness timeout; no valid pong within this window disconnects.
    pub timeout: Duration,
    /// RTT smoothing factor.
    pub rtt_alpha: f64,
    /// RTT deviation smoothing factor.
    pub rtt_beta: f64,
    /// Floor on the retransmit delay.
    pub min_resend_delay: Duration,
    /// Attempts before a pending packet is declared lost.
    pub max_resend_attempts: u32,
    /// Multiplier applied to the backoff after each attempt.
    pub backoff_factor: f64,
    /// Connection attempts before a client gives up and times out.
    pub connect_max_attempts: u32,
    /// Spacing between connection attempts.
    pub connect_retry_delay: Duration,
    /// Maximum concurrently-connected peers on a server; `None` = unbounded.
    pub max_clients: Option<usize>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            max_size: DEFAULT_MAX_SIZE,
            packet_loss: 0.0,
            min_latency: Duration::ZERO,
            max_latency: Duration::ZERO,
            ping_period: Duration::from_millis(1000),
            timeout: Duration::from_millis(10_000),
            rtt_alpha: 0.125,
            rtt_beta: 0.25,
            min_resend_delay: Duration::from_millis(1),
            max_resend_attempts: 15,
            backoff_factor: 1.2,
            connect_max_attempts: 10,
            connect_retry_delay: Duration::from_millis(500),
            max_clients: None,
        }
    }
}

impl TransportConfig {
    /// Clamp `max_size` into `[MIN_MAX_SIZE, MAX_MAX_SIZE]`.
    pub fn validated(mut self) -> Self {
        self.max_size = self.max_size.clamp(MIN_MAX_SIZE, MAX_MAX_SIZE);
        if self.max_latency < self.min_latency {
            self.max_latency = self.min_latency;
        }
        self.packet_loss = self.packet_loss.clamp(0.0, 1.0);
        self
    }

    /// Usable payload bytes once the largest header (fragment header,
    /// 6 bytes) is accounted for.
    pub fn max_fragment_payload(&self) -> usize {
        self.max_size.saturating_sub(crate::packet::FRAGMENT_HEADER_LEN)
    }
}
