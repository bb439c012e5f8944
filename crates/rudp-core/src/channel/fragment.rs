//! Split-into-fragments, reassemble-on-receipt, optional in-order delivery.
//!
//! Grounded on the same `strata-transport` `RetransmitTracker` shape as
//! [`super::reliable`], but each `(sequence, fragment_number)` pair gets its
//! own [`PendingPacket`] and its own individual ack — there is no bitmask
//! for fragment acks, per the wire format table.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::warn;

use super::{Channel, ChannelKind, RecvEnv, SendEnv, SendOutcome};
use crate::buffer::{Buffer, BufferPool, OversizePool};
use crate::config::{TransportConfig, MAX_FRAGMENTS};
use crate::error::SendError;
use crate::packet::{CHANNEL_ID_OFFSET, FRAGMENT_HEADER_LEN};
use crate::packet::{HeaderType, Packet, PacketView};
use crate::pending::{PendingPacket, TimeoutOutcome};
use crate::sequence::Seq;
use crate::stats::ChannelStats;

const WINDOW: usize = 1 << 16;

/// Same open-question decision as [`super::reliable`]: reject new sends
/// once `WINDOW` outer sequences are simultaneously in flight rather than
/// evict one.
const MAX_IN_FLIGHT: usize = WINDOW;

/// In-progress (or completed) reassembly of one outer sequence's fragments.
#[derive(Debug, Default)]
struct FragmentedPacket {
    fragments: HashMap<u16, Packet>,
    total_count: Option<u32>,
    last_fragment_number: Option<u16>,
    /// Set once every fragment has arrived. Kept around (rather than moved
    /// out) so a fragment arriving after reassembly is still recognized as
    /// a duplicate and acked again.
    reassembled: Option<Packet>,
}

enum FragmentOutcome {
    Duplicate,
    Pending,
    Reassembled,
}

impl FragmentedPacket {
    fn add_fragment(
        &mut self,
        frag_pkt: Packet,
        frag_number: u16,
        is_last: bool,
        oversize: &OversizePool,
        cfg: &TransportConfig,
        pool: &BufferPool,
    ) -> FragmentOutcome {
        if self.reassembled.is_some() || self.fragments.contains_key(&frag_number) {
            frag_pkt.return_to_pool(pool);
            return FragmentOutcome::Duplicate;
        }

        if is_last {
            self.total_count = Some(frag_number as u32 + 1);
            self.last_fragment_number = Some(frag_number);
        }
        self.fragments.insert(frag_number, frag_pkt);

        let Some(total) = self.total_count else {
            return FragmentOutcome::Pending;
        };
        if self.fragments.len() != total as usize {
            return FragmentOutcome::Pending;
        }

        self.reassemble(oversize, cfg.max_fragment_payload(), pool);
        FragmentOutcome::Reassembled
    }

    /// Every fragment has arrived: copy each payload into its slot of a
    /// freshly sized oversize buffer and return the constituent packets.
    fn reassemble(&mut self, oversize: &OversizePool, fragment_payload_size: usize, pool: &BufferPool) {
        let total = self.total_count.expect("checked by caller") as usize;
        let last_number = self.last_fragment_number.expect("checked by caller");
        let last_len = self.fragments[&last_number].payload_from(FRAGMENT_HEADER_LEN).len();
        let total_len = (total - 1) * fragment_payload_size + last_len;

        let mut raw = oversize.get(total_len.max(1));
        for i in 0..total as u16 {
            let frag = self.fragments.get(&i).expect("completeness already checked");
            let chunk = frag.payload_from(FRAGMENT_HEADER_LEN);
            let offset = i as usize * fragment_payload_size;
            raw[offset..offset + chunk.len()].copy_from_slice(chunk);
        }
        for (_, frag) in self.fragments.drain() {
            frag.return_to_pool(pool);
        }

        let buf = Buffer::from_raw(raw, total_len);
        self.reassembled = Some(Packet::from_reassembled(buf));
    }

    /// Return every constituent fragment still held by an incomplete
    /// reassembly evicted by a receive-window wraparound.
    fn discard(&mut self, pool: &BufferPool) {
        for (_, frag) in self.fragments.drain() {
            frag.return_to_pool(pool);
        }
    }
}

#[derive(Debug)]
pub struct ReliableFragmentChannel {
    stats: ChannelStats,
    ordered: bool,
    kind: ChannelKind,

    next_send_seq: Seq,
    pending: HashMap<(Seq, u16), Arc<PendingPacket>>,
    /// Remaining un-resolved fragment count per in-flight outer sequence;
    /// drives the `MAX_IN_FLIGHT` send-window check.
    in_flight_seqs: HashMap<Seq, u32>,

    recv_buffer: Vec<Option<FragmentedPacket>>,
    delivered: Vec<bool>,
    remote_seq: Option<Seq>,
    next_deliver_seq: Seq,
}

impl ReliableFragmentChannel {
    pub fn new(ordered: bool) -> Self {
        ReliableFragmentChannel {
            stats: ChannelStats::new(),
            ordered,
            kind: if ordered { ChannelKind::Fragmented } else { ChannelKind::FragmentedUnordered },
            next_send_seq: Seq::ZERO,
            pending: HashMap::new(),
            in_flight_seqs: HashMap::new(),
            recv_buffer: (0..WINDOW).map(|_| None).collect(),
            delivered: vec![false; WINDOW],
            remote_seq: None,
            next_deliver_seq: Seq::ZERO,
        }
    }

    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    fn release_in_flight_slot(&mut self, seq: Seq) {
        if let Some(remaining) = self.in_flight_seqs.get_mut(&seq) {
            *remaining = remaining.saturating_sub(1);
            if *remaining == 0 {
                self.in_flight_seqs.remove(&seq);
            }
        }
    }

    fn advance_ordered_delivery(&mut self, deliverable: &mut Vec<Packet>) {
        loop {
            let idx = self.next_deliver_seq.0 as usize;
            let ready = self.recv_buffer[idx].as_ref().and_then(|e| e.reassembled.clone());
            let Some(pkt) = ready else { break };
            if self.delivered[idx] {
                break;
            }
            deliverable.push(pkt);
            self.delivered[idx] = true;
            self.next_deliver_seq = self.next_deliver_seq.next();
        }
    }
}

impl Channel for ReliableFragmentChannel {
    fn kind(&self) -> ChannelKind {
        self.kind
    }

    fn stats(&self) -> &ChannelStats {
        &self.stats
    }

    fn stats_mut(&mut self) -> &mut ChannelStats {
        &mut self.stats
    }

    fn send(&mut self, env: &mut SendEnv<'_>, packet: Packet) -> Result<SendOutcome, SendError> {
        let fragment_payload_size = env.cfg.max_fragment_payload();
        let blob_len = packet.payload_from(CHANNEL_ID_OFFSET + 1).len();
        let total_fragments = blob_len.div_ceil(fragment_payload_size).max(1);

        if total_fragments > MAX_FRAGMENTS {
            packet.return_to_pool(env.pool);
            return Err(SendError::TooManyFragments { needed: total_fragments, max: MAX_FRAGMENTS });
        }
        if self.in_flight_seqs.len() >= MAX_IN_FLIGHT {
            warn!(channel = env.channel_id, "fragment send window fully in flight, rejecting new send");
            packet.return_to_pool(env.pool);
            return Err(SendError::WindowFull { outstanding: self.in_flight_seqs.len(), max: MAX_IN_FLIGHT });
        }

        let seq = self.next_send_seq.next();
        self.next_send_seq = seq;

        let blob: Vec<u8> = packet.payload_from(CHANNEL_ID_OFFSET + 1).to_vec();
        packet.return_to_pool(env.pool);

        self.in_flight_seqs.insert(seq, total_fragments as u32);
        let initial_delay = (env.smoothed_rtt * 2).max(env.cfg.min_resend_delay);

        let mut total_bytes = 0usize;
        for i in 0..total_fragments {
            let start = i * fragment_payload_size;
            let end = (start + fragment_payload_size).min(blob_len);
            let is_last = i == total_fragments - 1;

            let mut frag_pkt = Packet::new_fragment(env.pool, env.channel_id, seq, i as u16, is_last);
            frag_pkt.append_payload(&blob[start..end])?;

            let bytes = frag_pkt.size();
            let resend_copy = frag_pkt.clone();
            let pending = PendingPacket::new(frag_pkt, env.channel_id, initial_delay);
            self.pending.insert((seq, i as u16), pending);
            env.outgoing.push(resend_copy);
            total_bytes += bytes;
        }

        self.stats.record_sent(total_fragments as u64, total_bytes as u64);
        Ok(SendOutcome { packets_emitted: total_fragments, bytes_emitted: total_bytes })
    }

    fn receive(&mut self, env: &mut RecvEnv<'_>, datagram: PacketView) {
        self.stats.record_received(datagram.size() as u64);
        let pkt = datagram.into_packet();
        let (seq, frag_number, is_last) = match (pkt.read_seq(), pkt.read_frag()) {
            (Ok(s), Ok((f, l))) => (s, f, l),
            _ => {
                pkt.return_to_pool(env.pool);
                return;
            }
        };

        // Acks are per-fragment and must be idempotent, same as the packet
        // channel's ack: always (re-)send one, even for a duplicate.
        let mut ack = Packet::new_control(env.pool, HeaderType::Acknowledgement);
        ack.write_channel_id(env.channel_id).expect("fits");
        ack.write_seq(seq).expect("fits");
        ack.write_frag(frag_number, false).expect("fits");
        env.outgoing.push(ack);

        let idx = seq.0 as usize;
        let is_newest = match self.remote_seq {
            None => true,
            Some(last) => seq.greater_than(last),
        };
        if is_newest {
            if let Some(last) = self.remote_seq {
                let mut cursor = last.next();
                loop {
                    let ci = cursor.0 as usize;
                    if ci != idx {
                        if let Some(mut stale) = self.recv_buffer[ci].take() {
                            stale.discard(env.pool);
                        }
                        self.delivered[ci] = false;
                    }
                    if cursor == seq {
                        break;
                    }
                    cursor = cursor.next();
                }
            }
            self.remote_seq = Some(seq);
        }

        let outcome = {
            let entry = self.recv_buffer[idx].get_or_insert_with(FragmentedPacket::default);
            entry.add_fragment(pkt, frag_number, is_last, env.oversize, env.cfg, env.pool)
        };

        match outcome {
            FragmentOutcome::Duplicate => self.stats.duplicates += 1,
            FragmentOutcome::Pending => {}
            FragmentOutcome::Reassembled => {
                if self.ordered {
                    if seq == self.next_deliver_seq {
                        self.advance_ordered_delivery(env.deliverable);
                    }
                } else {
                    let pkt = self.recv_buffer[idx]
                        .as_ref()
                        .and_then(|e| e.reassembled.clone())
                        .expect("just reassembled");
                    env.deliverable.push(pkt);
                }
            }
        }
    }

    fn receive_ack(&mut self, env: &mut RecvEnv<'_>, datagram: PacketView) {
        let pkt = datagram.into_packet();
        let (Ok(seq), Ok((frag_number, _))) = (pkt.read_seq(), pkt.read_frag()) else { return };
        if let Some(p) = self.pending.remove(&(seq, frag_number)) {
            p.acknowledge(env.pool);
            self.release_in_flight_slot(seq);
        }
    }

    fn retransmit_tick(&mut self, env: &mut SendEnv<'_>) -> super::RetransmitOutcome {
        let mut outcome = super::RetransmitOutcome::default();
        let now = std::time::Instant::now();
        let mut to_remove = Vec::new();
        for (&key, pending) in self.pending.iter() {
            if pending.deadline() > now {
                continue;
            }
            match pending.fire_timeout(env.pool, env.cfg, env.smoothed_rtt) {
                TimeoutOutcome::Retransmit { packet, .. } => {
                    self.stats.retransmitted += 1;
                    env.outgoing.push(packet);
                }
                TimeoutOutcome::Lost => {
                    outcome.packet_lost = true;
                    to_remove.push(key);
                }
                TimeoutOutcome::AlreadyResolved => to_remove.push(key),
            }
        }
        for key in to_remove {
            self.pending.remove(&key);
            self.release_in_flight_slot(key.0);
        }
        outcome
    }
}
