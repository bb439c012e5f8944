//! Sequence number + discard-if-older, no ack traffic.

use super::{Channel, ChannelKind, RecvEnv, SendEnv, SendOutcome};
use crate::error::SendError;
use crate::packet::{Packet, PacketView, RELIABLE_HEADER_LEN};
use crate::sequence::Seq;
use crate::stats::ChannelStats;

#[derive(Debug)]
pub struct SequencedChannel {
    stats: ChannelStats,
    local_send_seq: Seq,
    last_accepted_remote_seq: Option<Seq>,
}

impl SequencedChannel {
    pub fn new() -> Self {
        SequencedChannel { stats: ChannelStats::new(), local_send_seq: Seq::ZERO, last_accepted_remote_seq: None }
    }
}

impl Default for SequencedChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl Channel for SequencedChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Sequenced
    }

    fn stats(&self) -> &ChannelStats {
        &self.stats
    }

    fn stats_mut(&mut self) -> &mut ChannelStats {
        &mut self.stats
    }

    fn send(&mut self, env: &mut SendEnv<'_>, packet: Packet) -> Result<SendOutcome, SendError> {
        self.local_send_seq = self.local_send_seq.next();
        let seq = self.local_send_seq;
        let framed = packet.reframe(env.pool, env.channel_id, |p| p.write_seq(seq))?;
        let bytes = framed.size();
        env.outgoing.push(framed);
        self.stats.record_sent(1, bytes as u64);
        Ok(SendOutcome { packets_emitted: 1, bytes_emitted: bytes })
    }

    fn receive(&mut self, _env: &mut RecvEnv<'_>, datagram: PacketView) {
        self.stats.record_received(datagram.size() as u64);
        let seq = {
            let pkt = datagram.clone().into_packet();
            pkt.read_seq().unwrap_or(Seq::ZERO)
        };
        let accept = match self.last_accepted_remote_seq {
            None => true,
            Some(last) => seq.greater_than(last),
        };
        if accept {
            self.last_accepted_remote_seq = Some(seq);
            let mut pkt = datagram.into_packet();
            pkt.seek_payload(RELIABLE_HEADER_LEN);
            _env.deliverable.push(pkt);
        } else {
            self.stats.out_of_order += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{BufferPool, OversizePool};
    use crate::config::TransportConfig;
    use std::time::Duration;

    fn env<'a>(
        pool: &'a BufferPool,
        oversize: &'a OversizePool,
        cfg: &'a TransportConfig,
        outgoing: &'a mut Vec<Packet>,
    ) -> SendEnv<'a> {
        SendEnv { pool, oversize, cfg, channel_id: 1, smoothed_rtt: Duration::from_millis(10), outgoing }
    }

    #[test]
    fn out_of_order_older_sequence_is_dropped() {
        let pool = BufferPool::new(1432);
        let oversize = OversizePool::new(1432);
        let cfg = TransportConfig::default();
        let mut outgoing = Vec::new();
        let mut sender = SequencedChannel::new();
        let mut receiver = SequencedChannel::new();

        let mut sent = Vec::new();
        for _ in 0..3 {
            let pkt = Packet::new_data(&pool, 1, 1);
            let mut e = env(&pool, &oversize, &cfg, &mut outgoing);
            sender.send(&mut e, pkt).unwrap();
        }
        sent.append(&mut outgoing);

        let mut deliverable = Vec::new();
        let mut out2 = Vec::new();
        // receive seq 2 first (index 1), then seq 1 (index 0) which is older.
        for idx in [1usize, 0usize] {
            let view = sent[idx].clone().into_view();
            let mut recv_env = RecvEnv {
                oversize: &oversize,
                pool: &pool,
                cfg: &cfg,
                channel_id: 1,
                smoothed_rtt: Duration::from_millis(10),
                outgoing: &mut out2,
                deliverable: &mut deliverable,
            };
            receiver.receive(&mut recv_env, view);
        }
        assert_eq!(deliverable.len(), 1, "the stale, older sequence must be dropped");
        assert_eq!(receiver.stats().out_of_order, 1);
    }
}
