//! Error taxonomy for the transport.
//!
//! Per the design, most failures are recovered locally (dropped, duplicate
//! or stale datagrams never surface to callers). The variants here cover
//! the cases that *do* need to propagate: sender-side limits and bounds
//! failures on buffer access.

use thiserror::Error;

/// Errors produced by buffer/packet read and write operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BufferError {
    /// A read or write would run past the end of the buffer.
    #[error("out-of-bounds access at offset {offset}, buffer size {size}")]
    OutOfBounds { offset: usize, size: usize },

    /// A write was attempted on a packet that has already been frozen
    /// (turned into a read-only view) or returned to the pool.
    #[error("write attempted on a frozen or returned packet")]
    WriteAfterFreeze,

    /// An access was attempted on a packet already returned to the pool.
    #[error("access attempted on a returned packet")]
    UseAfterReturn,

    /// A variable-length integer could not be decoded from the available
    /// bytes (either truncated or implausibly large).
    #[error("malformed variable-length integer")]
    MalformedVarInt,
}

/// Errors produced on the send path.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SendError {
    #[error(transparent)]
    Buffer(#[from] BufferError),

    /// Fragment count for the outer packet exceeded 2^15.
    #[error("payload requires {needed} fragments, exceeding the maximum of {max}")]
    TooManyFragments { needed: usize, max: usize },

    /// The send window is fully occupied by unacked sequences; the new
    /// send is rejected rather than evicting an outstanding entry.
    #[error("send window full: {outstanding} sequences outstanding, max {max}")]
    WindowFull { outstanding: usize, max: usize },

    /// A non-fragmenting channel was given a payload larger than the
    /// buffer's configured maximum size.
    #[error("payload of {len} bytes exceeds max packet size {max}")]
    PayloadTooLarge { len: usize, max: usize },

    /// The connection is not in the `Connected` state.
    #[error("connection is not connected (state: {state:?})")]
    NotConnected { state: crate::connection::ConnectionState },

    /// Attempted to install a custom channel into an occupied or
    /// reserved slot.
    #[error("channel slot {slot} is unavailable")]
    ChannelSlotUnavailable { slot: u8 },
}

/// Reasons a connection transitions to `Disconnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectCause {
    /// The peer sent an explicit `Disconnect` header.
    PeerDisconnected,
    /// The local side requested disconnection.
    LocalDisconnected,
    /// No liveness (pong / connect-approved) was observed in time.
    Timeout,
    /// The server was at capacity when a new `Connect` arrived.
    CapacityExceeded,
}
