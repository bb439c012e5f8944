//! Fire-and-forget pass-through.

use super::{Channel, ChannelKind, RecvEnv, SendEnv, SendOutcome};
use crate::error::SendError;
use crate::packet::{Packet, PacketView, CHANNEL_ID_OFFSET};
use crate::stats::ChannelStats;

#[derive(Debug, Default)]
pub struct UnreliableChannel {
    stats: ChannelStats,
}

impl UnreliableChannel {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Channel for UnreliableChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Unreliable
    }

    fn stats(&self) -> &ChannelStats {
        &self.stats
    }

    fn stats_mut(&mut self) -> &mut ChannelStats {
        &mut self.stats
    }

    fn send(&mut self, env: &mut SendEnv<'_>, packet: Packet) -> Result<SendOutcome, SendError> {
        let bytes = packet.size();
        env.outgoing.push(packet);
        self.stats.record_sent(1, bytes as u64);
        Ok(SendOutcome { packets_emitted: 1, bytes_emitted: bytes })
    }

    fn receive(&mut self, env: &mut RecvEnv<'_>, datagram: PacketView) {
        self.stats.record_received(datagram.size() as u64);
        let mut pkt = datagram.into_packet();
        pkt.seek_payload(CHANNEL_ID_OFFSET + 1);
        env.deliverable.push(pkt);
    }
}
