//! Per-delivery-mode send/receive/ack pipelines.
//!
//! A `Channel` never touches the socket or the connection map directly —
//! it's handed a short-lived [`SendEnv`]/[`RecvEnv`] borrowing the pieces
//! it needs (the buffer pool, the config, the smoothed RTT, and output
//! sinks for outgoing datagrams and finished application packets) for the
//! duration of one call. This is the ownership-based stand-in the design
//! notes call for in place of the source's cyclic channel↔connection↔node
//! references: channels live inside the connection's slot array and never
//! hold a back-reference to it.

pub mod fragment;
pub mod reliable;
pub mod sequenced;
pub mod unreliable;

use std::time::Duration;

use crate::buffer::{BufferPool, OversizePool};
use crate::config::TransportConfig;
use crate::error::SendError;
use crate::packet::{Packet, PacketView};
use crate::stats::ChannelStats;

pub use fragment::ReliableFragmentChannel;
pub use reliable::ReliablePacketChannel;
pub use sequenced::SequencedChannel;
pub use unreliable::UnreliableChannel;

/// One of the six built-in delivery modes, occupying slots 0..5.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    Unreliable = 0,
    Sequenced = 1,
    ReliableUnordered = 2,
    Reliable = 3,
    FragmentedUnordered = 4,
    Fragmented = 5,
}

/// Slots 0..15 are reserved for built-ins (six in use, ten reserved for
/// future built-ins); custom channels occupy 16..255.
pub const RESERVED_SLOTS: u8 = 16;

pub struct SendOutcome {
    pub packets_emitted: usize,
    pub bytes_emitted: usize,
}

impl SendOutcome {
    pub const ZERO: SendOutcome = SendOutcome { packets_emitted: 0, bytes_emitted: 0 };
}

/// Everything a channel needs to process a `send()` call, borrowed for the
/// duration of that call only.
pub struct SendEnv<'a> {
    pub pool: &'a BufferPool,
    /// Bucketed oversize pool; only `ReliableFragmentChannel` reclaims the
    /// original oversize buffer into it after splitting into fragments.
    pub oversize: &'a OversizePool,
    pub cfg: &'a TransportConfig,
    pub channel_id: u8,
    pub smoothed_rtt: Duration,
    /// Framed datagrams ready for the connection to hand to `Node::send`.
    pub outgoing: &'a mut Vec<Packet>,
}

/// Everything a channel needs to process a `receive()`/`receive_ack()` call.
pub struct RecvEnv<'a> {
    pub pool: &'a BufferPool,
    /// Bucketed oversize pool, used only by `ReliableFragmentChannel` to
    /// back reassembled buffers that exceed `max_size`.
    pub oversize: &'a OversizePool,
    pub cfg: &'a TransportConfig,
    pub channel_id: u8,
    pub smoothed_rtt: Duration,
    /// Acks (or other reply datagrams) the channel wants sent back.
    pub outgoing: &'a mut Vec<Packet>,
    /// Application-ready packets, handed off to `Node::enqueue_pending`.
    pub deliverable: &'a mut Vec<Packet>,
}

/// Base contract shared by every delivery mode. The default-method bodies
/// wrap send/receive to update counters uniformly; most impls only need
/// to override the three core hooks.
pub trait Channel: std::fmt::Debug + Send {
    fn kind(&self) -> ChannelKind;
    fn stats(&self) -> &ChannelStats;
    fn stats_mut(&mut self) -> &mut ChannelStats;

    fn send(&mut self, env: &mut SendEnv<'_>, packet: Packet) -> Result<SendOutcome, SendError>;

    /// `datagram` has its read cursor already positioned past the fixed
    /// header fields this channel's kind defines.
    fn receive(&mut self, env: &mut RecvEnv<'_>, datagram: PacketView);

    /// Ack receipt on a channel kind that doesn't use acks is itself a
    /// protocol violation; the default impl logs and drops, matching
    /// `UnreliableChannel`/`SequencedChannel`.
    fn receive_ack(&mut self, _env: &mut RecvEnv<'_>, _datagram: PacketView) {
        tracing::warn!(kind = ?self.kind(), "received ack on a channel kind that does not use acks");
    }

    fn retransmit_tick(&mut self, _env: &mut SendEnv<'_>) -> RetransmitOutcome {
        RetransmitOutcome::default()
    }
}

/// Result of driving a channel's retransmit timers forward by one tick.
#[derive(Default)]
pub struct RetransmitOutcome {
    /// Set if any pending packet exceeded `max_resend_attempts` — signals
    /// the connection to time out.
    pub packet_lost: bool,
}
