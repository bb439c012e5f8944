//! One in-flight reliable packet or fragment awaiting acknowledgement.
//!
//! Grounded on `strata-transport`'s `RetransmitTracker` (sender-side retry
//! bookkeeping) and `RttTracker` (smoothed-RTT-driven timing), reshaped
//! into a per-packet object with its own retransmit timer, attempt
//! counter and backoff multiplier rather than a NACK-range retry budget.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::buffer::BufferPool;
use crate::config::TransportConfig;
use crate::packet::Packet;

struct PendingData {
    packet: Option<Packet>,
    attempts: u32,
    backoff: f64,
    deadline: Instant,
}

/// Outcome of an acknowledgement racing (or not) against a timer fire.
#[derive(Debug, PartialEq, Eq)]
pub enum AckOutcome {
    /// This call retired the packet; it was returned to the pool.
    Cancelled,
    /// Someone else (an earlier ack, or a timeout past max attempts)
    /// already retired it. Returns silently, per the thread-safety contract.
    AlreadyResolved,
}

/// Outcome of a retransmit timer firing.
pub enum TimeoutOutcome {
    /// Resend this cloned packet; the pending entry's deadline and attempt
    /// count have been advanced.
    Retransmit { packet: Packet, next_deadline: Instant },
    /// Exceeded `max_resend_attempts`; the channel must report the packet
    /// lost, which signals the connection to time out. The original
    /// packet has been returned to the pool.
    Lost,
    /// Already acked (or already declared lost) by a racing call.
    AlreadyResolved,
}

/// A reliable packet or fragment awaiting ack, with its own retransmit
/// deadline, attempt counter and backoff multiplier.
///
/// Acknowledge and timer-fire may race; both acquire this struct's
/// internal lock, and the loser observes `packet: None` and returns
/// `AlreadyResolved` without touching the pool a second time.
pub struct PendingPacket {
    data: Mutex<PendingData>,
    pub channel_id: u8,
}

impl PendingPacket {
    /// `initial_delay` should be `max(MinResendDelay, 2 * smoothed_rtt)`,
    /// per the reliable-channel send path.
    pub fn new(packet: Packet, channel_id: u8, initial_delay: Duration) -> Arc<PendingPacket> {
        Arc::new(PendingPacket {
            data: Mutex::new(PendingData {
                packet: Some(packet),
                attempts: 1,
                backoff: 1.0,
                deadline: Instant::now() + initial_delay,
            }),
            channel_id,
        })
    }

    /// Ack arrived: cancel the timer and return the packet to the pool.
    /// Idempotent — a second ack (sender-side idempotency, since acks
    /// themselves must be idempotent) is silently ignored.
    pub fn acknowledge(&self, pool: &BufferPool) -> AckOutcome {
        let mut d = self.data.lock().unwrap();
        match d.packet.take() {
            Some(p) => {
                p.return_to_pool(pool);
                AckOutcome::Cancelled
            }
            None => AckOutcome::AlreadyResolved,
        }
    }

    /// Retransmit timer fired: either hand back a clone to resend, or
    /// declare the packet lost once `max_resend_attempts` is exceeded.
    pub fn fire_timeout(
        &self,
        pool: &BufferPool,
        cfg: &TransportConfig,
        smoothed_rtt: Duration,
    ) -> TimeoutOutcome {
        let mut d = self.data.lock().unwrap();
        let packet = match d.packet.take() {
            Some(p) => p,
            None => return TimeoutOutcome::AlreadyResolved,
        };

        if d.attempts >= cfg.max_resend_attempts {
            packet.return_to_pool(pool);
            return TimeoutOutcome::Lost;
        }

        d.attempts += 1;
        d.backoff *= cfg.backoff_factor;
        let base = (2.0 * smoothed_rtt.as_secs_f64() * d.backoff).max(cfg.min_resend_delay.as_secs_f64());
        let delay = Duration::from_secs_f64(base);
        let next_deadline = Instant::now() + delay;
        d.deadline = next_deadline;

        let resend = packet.clone();
        d.packet = Some(packet);
        TimeoutOutcome::Retransmit { packet: resend, next_deadline }
    }

    pub fn deadline(&self) -> Instant {
        self.data.lock().unwrap().deadline
    }

    pub fn attempts(&self) -> u32 {
        self.data.lock().unwrap().attempts
    }

    pub fn is_resolved(&self) -> bool {
        self.data.lock().unwrap().packet.is_none()
    }
}
