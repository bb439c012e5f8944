//! # rudp-core
//!
//! A reliable-UDP transport: sliding-window sequencing, selective-ack and
//! per-fragment retransmission, packet fragmentation/reassembly, and a
//! connect/ping/disconnect handshake layered over a plain datagram socket.
//!
//! ## Crate structure
//!
//! - [`varint`] — QUIC-style variable-length integer codec
//! - [`sequence`] — wrap-aware 16-bit sequence number comparator
//! - [`buffer`] — pooled packet buffers (`BufferPool`, `OversizePool`)
//! - [`packet`] — wire header layout, `Packet`, read-only `PacketView`
//! - [`pending`] — exponential-backoff retransmission bookkeeping
//! - [`channel`] — the six built-in delivery modes plus the custom-channel seam
//! - [`connection`] — per-endpoint state machine, handshake, RTT tracking
//! - [`socket`] — the datagram-socket collaborator interface
//! - [`node`] — `Client`/`Server`, receive loop, tick-driven dispatch
//! - [`config`] — `TransportConfig`
//! - [`error`] — `SendError`, `BufferError`, `DisconnectCause`
//! - [`stats`] — per-channel counters and the shared EWMA smoother

pub mod buffer;
pub mod channel;
pub mod config;
pub mod connection;
pub mod error;
pub mod node;
pub mod packet;
pub mod pending;
pub mod sequence;
pub mod socket;
pub mod stats;
pub mod varint;
