//! Typed view over a [`Buffer`](crate::buffer::Buffer): header byte,
//! optional channel id, and payload.
//!
//! Field offsets follow the wire format table exactly. A `Packet` is a
//! mutable, write-capable handle used on the send path and while composing
//! an application payload; [`PacketView`] is the read-only variant handed
//! to user handlers and to channel receive logic.

use bytes::Buf;

use crate::buffer::{Buffer, BufferPool};
use crate::error::BufferError;
use crate::sequence::Seq;
use crate::varint;

pub const HEADER_TYPE_OFFSET: usize = 0;
pub const HEADER_TYPE_LEN: usize = 1;
pub const CHANNEL_ID_OFFSET: usize = 1;
pub const SEQ_OFFSET: usize = 2;
pub const SEQ_LEN: usize = 2;
pub const FRAG_OFFSET: usize = 4;
pub const FRAG_LEN: usize = 2;
pub const ACK_BITMASK_OFFSET: usize = 4;
pub const ACK_BITMASK_LEN: usize = 4;
pub const REQUEST_ID_OFFSET: usize = 1;
pub const REQUEST_ID_LEN: usize = 4;

/// `Data` (unreliable / sequenced / reliable non-fragmented): header + channel id + seq.
pub const RELIABLE_HEADER_LEN: usize = SEQ_OFFSET + SEQ_LEN;
/// `Data` (reliable fragmented): header + channel id + seq + fragment number.
pub const FRAGMENT_HEADER_LEN: usize = FRAG_OFFSET + FRAG_LEN;
/// `Data` (unreliable / sequenced-without-seq not used; unreliable has no seq).
pub const UNRELIABLE_HEADER_LEN: usize = CHANNEL_ID_OFFSET + 1;
/// `Acknowledgement` (reliable packet): header + channel id + seq + bitmask.
pub const ACK_PACKET_HEADER_LEN: usize = ACK_BITMASK_OFFSET + ACK_BITMASK_LEN;
/// `Acknowledgement` (reliable fragment): header + channel id + seq + frag#.
pub const ACK_FRAGMENT_HEADER_LEN: usize = FRAG_OFFSET + FRAG_LEN;
/// `Ping` / `Pong`: header + 32-bit request id.
pub const PING_PONG_HEADER_LEN: usize = REQUEST_ID_OFFSET + REQUEST_ID_LEN;
/// `Connect` / `ConnectApproved` / `Disconnect`: header byte only.
pub const EMPTY_HEADER_LEN: usize = HEADER_TYPE_LEN;

/// Byte 0 of every packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum HeaderType {
    Connect = 0,
    ConnectApproved = 1,
    Data = 2,
    Acknowledgement = 3,
    Ping = 4,
    Pong = 5,
    Disconnect = 6,
}

impl HeaderType {
    pub fn from_byte(b: u8) -> Option<Self> {
        Some(match b {
            0 => HeaderType::Connect,
            1 => HeaderType::ConnectApproved,
            2 => HeaderType::Data,
            3 => HeaderType::Acknowledgement,
            4 => HeaderType::Ping,
            5 => HeaderType::Pong,
            6 => HeaderType::Disconnect,
            _ => return None,
        })
    }
}

/// A mutable packet: owns a [`Buffer`] and knows how to compose and read
/// the fixed header fields plus a length-prefixed payload encoding.
#[derive(Debug, Clone)]
pub struct Packet {
    buf: Buffer,
}

impl Packet {
    /// `get(headerType)`: writes just the header byte. Used for
    /// Connect/ConnectApproved/Disconnect and as the basis for Ping/Pong.
    pub fn new_control(pool: &BufferPool, header_type: HeaderType) -> Packet {
        let mut buf = pool.get();
        buf.write_bytes(&[header_type as u8]).expect("fresh buffer always has room for one byte");
        let mut pkt = Packet { buf };
        pkt.buf.set_read_pos(HEADER_TYPE_LEN);
        pkt
    }

    /// `get(delivery, id)`: writes `HeaderType::Data`, the channel id, and
    /// the 16-bit application packet id, in that contiguous order. A
    /// channel that also needs a sequence/fragment number between the
    /// channel id and the payload does *not* write into this buffer in
    /// place — see [`Packet::reframe`], which builds the actual wire
    /// packet by copying this packet's app-id-plus-payload region after
    /// its own header fields.
    pub fn new_data(pool: &BufferPool, channel_id: u8, app_packet_id: u16) -> Packet {
        let mut buf = pool.get();
        buf.write_bytes(&[HeaderType::Data as u8, channel_id]).expect("fits");
        buf.write_bytes(&app_packet_id.to_le_bytes()).expect("fits");
        let mut pkt = Packet { buf };
        pkt.buf.set_read_pos(CHANNEL_ID_OFFSET + 1);
        pkt
    }

    pub fn new_ping_pong(pool: &BufferPool, header_type: HeaderType, request_id: u32) -> Packet {
        debug_assert!(matches!(header_type, HeaderType::Ping | HeaderType::Pong));
        let mut buf = pool.get();
        buf.write_bytes(&[header_type as u8]).expect("fits");
        buf.write_bytes(&request_id.to_le_bytes()).expect("fits");
        Packet { buf }
    }

    /// `from(bytes, n)`: wrap received bytes, positioning the read cursor
    /// just past the header type byte (callers advance further once they
    /// know the header's full shape from the dispatch).
    pub fn from_received(mut buf: Buffer) -> Packet {
        buf.set_read_pos(HEADER_TYPE_LEN);
        Packet { buf }
    }

    /// Wraps a buffer holding an already-reassembled fragment payload
    /// (app packet id followed by user bytes, no wire header at all) with
    /// the read cursor at its start.
    pub fn from_reassembled(mut buf: Buffer) -> Packet {
        buf.set_read_pos(0);
        Packet { buf }
    }

    /// A lone `Data` header for one fragment: header byte, channel id,
    /// outer sequence, fragment number. No application packet id — that
    /// lives only in the reassembled blob's first two bytes.
    pub fn new_fragment(
        pool: &BufferPool,
        channel_id: u8,
        seq: Seq,
        frag_number: u16,
        last: bool,
    ) -> Packet {
        let mut pkt = Packet::new_control(pool, HeaderType::Data);
        pkt.write_channel_id(channel_id).expect("fits");
        pkt.write_seq(seq).expect("fits");
        pkt.write_frag(frag_number, last).expect("fits");
        pkt.buf.set_read_pos(FRAGMENT_HEADER_LEN);
        pkt
    }

    /// Builds the real wire packet for a channel that inserts fields (seq,
    /// fragment #) between the channel id and the payload: a fresh `Data`
    /// packet with `header_writer` laying down those fields, followed by
    /// this packet's app-id-plus-payload region copied verbatim. Consumes
    /// `self`, returning it to `pool` on every path (success or failure).
    pub fn reframe(
        self,
        pool: &BufferPool,
        channel_id: u8,
        header_writer: impl FnOnce(&mut Packet) -> Result<(), BufferError>,
    ) -> Result<Packet, BufferError> {
        let mut framed = Packet::new_control(pool, HeaderType::Data);
        let result = (|| {
            framed.write_channel_id(channel_id)?;
            header_writer(&mut framed)?;
            let header_len = framed.buf.size();
            framed.append_payload(self.payload_from(CHANNEL_ID_OFFSET + 1))?;
            framed.buf.set_read_pos(header_len);
            Ok(())
        })();
        self.return_to_pool(pool);
        match result {
            Ok(()) => Ok(framed),
            Err(e) => {
                framed.return_to_pool(pool);
                Err(e)
            }
        }
    }

    pub fn header_type(&self) -> Option<HeaderType> {
        HeaderType::from_byte(self.buf.byte_at(HEADER_TYPE_OFFSET).ok()?)
    }

    pub fn channel_id(&self) -> Result<u8, BufferError> {
        self.buf.byte_at(CHANNEL_ID_OFFSET)
    }

    pub fn write_channel_id(&mut self, id: u8) -> Result<(), BufferError> {
        self.buf.write_at(CHANNEL_ID_OFFSET, &[id])
    }

    pub fn write_seq(&mut self, seq: Seq) -> Result<(), BufferError> {
        self.buf.write_at(SEQ_OFFSET, &seq.0.to_le_bytes())
    }

    pub fn read_seq(&self) -> Result<Seq, BufferError> {
        let b = [self.buf.byte_at(SEQ_OFFSET)?, self.buf.byte_at(SEQ_OFFSET + 1)?];
        Ok(Seq(u16::from_le_bytes(b)))
    }

    /// `frag_number` must be `< 0x8000`; `last` sets bit 15.
    pub fn write_frag(&mut self, frag_number: u16, last: bool) -> Result<(), BufferError> {
        let v = frag_number | if last { 0x8000 } else { 0 };
        self.buf.write_at(FRAG_OFFSET, &v.to_le_bytes())
    }

    /// Returns `(fragment_number_without_flag, is_last)`.
    pub fn read_frag(&self) -> Result<(u16, bool), BufferError> {
        let b = [self.buf.byte_at(FRAG_OFFSET)?, self.buf.byte_at(FRAG_OFFSET + 1)?];
        let v = u16::from_le_bytes(b);
        Ok((v & 0x7fff, v & 0x8000 != 0))
    }

    pub fn write_ack_bitmask(&mut self, mask: u32) -> Result<(), BufferError> {
        self.buf.write_at(ACK_BITMASK_OFFSET, &mask.to_le_bytes())
    }

    pub fn read_ack_bitmask(&self) -> Result<u32, BufferError> {
        let mut b = [0u8; 4];
        for (i, slot) in b.iter_mut().enumerate() {
            *slot = self.buf.byte_at(ACK_BITMASK_OFFSET + i)?;
        }
        Ok(u32::from_le_bytes(b))
    }

    pub fn write_request_id(&mut self, id: u32) -> Result<(), BufferError> {
        self.buf.write_at(REQUEST_ID_OFFSET, &id.to_le_bytes())
    }

    pub fn read_request_id(&self) -> Result<u32, BufferError> {
        let mut b = [0u8; 4];
        for (i, slot) in b.iter_mut().enumerate() {
            *slot = self.buf.byte_at(REQUEST_ID_OFFSET + i)?;
        }
        Ok(u32::from_le_bytes(b))
    }

    /// Application packet id: the two bytes at the current read cursor,
    /// which every constructor positions at the start of the app-id +
    /// user-payload region.
    pub fn app_packet_id(&self) -> Result<u16, BufferError> {
        let off = self.buf.read_pos();
        let b = [self.buf.byte_at(off)?, self.buf.byte_at(off + 1)?];
        Ok(u16::from_le_bytes(b))
    }

    /// Set the read cursor to the start of the payload for a given header
    /// length (one of the `*_HEADER_LEN` constants).
    pub fn seek_payload(&mut self, header_len: usize) {
        self.buf.set_read_pos(header_len);
    }

    pub fn append_payload(&mut self, bytes: &[u8]) -> Result<(), BufferError> {
        self.buf.write_bytes(bytes)
    }

    pub fn payload_from(&self, header_len: usize) -> &[u8] {
        let written = self.buf.written();
        if header_len >= written.len() {
            &[]
        } else {
            &written[header_len..]
        }
    }

    pub fn size(&self) -> usize {
        self.buf.size()
    }

    pub fn capacity(&self) -> usize {
        self.buf.capacity()
    }

    pub fn into_buffer(self) -> Buffer {
        self.buf
    }

    pub fn buffer(&self) -> &Buffer {
        &self.buf
    }

    pub fn buffer_mut(&mut self) -> &mut Buffer {
        &mut self.buf
    }

    pub fn return_to_pool(self, pool: &BufferPool) {
        pool.return_buffer(self.buf);
    }

    /// Freeze into a read-only view.
    pub fn into_view(self) -> PacketView {
        PacketView { buf: self.buf }
    }

    // ─── Primitive payload writers (little-endian, appended at the
    // current write cursor) ──────────────────────────────────────────

    pub fn write_u8(&mut self, v: u8) -> Result<(), BufferError> {
        self.buf.write_bytes(&[v])
    }
    pub fn write_u16(&mut self, v: u16) -> Result<(), BufferError> {
        self.buf.write_bytes(&v.to_le_bytes())
    }
    pub fn write_u32(&mut self, v: u32) -> Result<(), BufferError> {
        self.buf.write_bytes(&v.to_le_bytes())
    }
    pub fn write_u64(&mut self, v: u64) -> Result<(), BufferError> {
        self.buf.write_bytes(&v.to_le_bytes())
    }
    pub fn write_i32(&mut self, v: i32) -> Result<(), BufferError> {
        self.buf.write_bytes(&v.to_le_bytes())
    }
    pub fn write_f32(&mut self, v: f32) -> Result<(), BufferError> {
        self.buf.write_bytes(&v.to_le_bytes())
    }
    pub fn write_f64(&mut self, v: f64) -> Result<(), BufferError> {
        self.buf.write_bytes(&v.to_le_bytes())
    }

    /// Length-prefixed (varint) array of elements written by `write_elem`.
    pub fn write_array<T>(
        &mut self,
        items: &[T],
        mut write_elem: impl FnMut(&mut Packet, &T) -> Result<(), BufferError>,
    ) -> Result<(), BufferError> {
        let mut len_buf = bytes::BytesMut::new();
        varint::encode(items.len() as u32, &mut len_buf);
        self.buf.write_bytes(&len_buf)?;
        for item in items {
            write_elem(self, item)?;
        }
        Ok(())
    }

    /// Length-prefixed (varint) UTF-8 string.
    pub fn write_string(&mut self, s: &str) -> Result<(), BufferError> {
        let bytes = s.as_bytes();
        let mut len_buf = bytes::BytesMut::new();
        varint::encode(bytes.len() as u32, &mut len_buf);
        self.buf.write_bytes(&len_buf)?;
        self.buf.write_bytes(bytes)
    }

    // ─── Primitive payload readers (mirror the writers, advancing the
    // read cursor) ────────────────────────────────────────────────────

    pub fn read_u8(&mut self) -> Result<u8, BufferError> {
        Ok(self.buf.read_bytes(1)?[0])
    }
    pub fn read_u16(&mut self) -> Result<u16, BufferError> {
        let b = self.buf.read_bytes(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }
    pub fn read_u32(&mut self) -> Result<u32, BufferError> {
        let b = self.buf.read_bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }
    pub fn read_u64(&mut self) -> Result<u64, BufferError> {
        let b = self.buf.read_bytes(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(u64::from_le_bytes(arr))
    }
    pub fn read_i32(&mut self) -> Result<i32, BufferError> {
        Ok(self.read_u32()? as i32)
    }
    pub fn read_f32(&mut self) -> Result<f32, BufferError> {
        let b = self.buf.read_bytes(4)?;
        Ok(f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }
    pub fn read_f64(&mut self) -> Result<f64, BufferError> {
        let b = self.buf.read_bytes(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(f64::from_le_bytes(arr))
    }

    fn read_varint_len(&mut self) -> Result<usize, BufferError> {
        // varint::decode wants a `Buf`; read one byte at a time off the
        // buffer's own cursor so we don't have to materialize a slice of
        // unknown length up front.
        let mut value: u32 = 0;
        for i in 0..5u32 {
            let byte = self.read_u8()?;
            value |= ((byte & 0x7f) as u32) << (7 * i);
            if byte & 0x80 == 0 {
                return Ok(value as usize);
            }
        }
        Err(BufferError::MalformedVarInt)
    }

    pub fn read_array<T>(
        &mut self,
        mut read_elem: impl FnMut(&mut Packet) -> Result<T, BufferError>,
    ) -> Result<Vec<T>, BufferError> {
        let len = self.read_varint_len()?;
        let mut out = Vec::with_capacity(len.min(1024));
        for _ in 0..len {
            out.push(read_elem(self)?);
        }
        Ok(out)
    }

    pub fn read_string(&mut self) -> Result<String, BufferError> {
        let len = self.read_varint_len()?;
        let bytes = self.buf.read_bytes(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| BufferError::MalformedVarInt)
    }
}

/// Read-only packet view handed to user handlers. Writes and pool-return
/// fail by construction (no such methods exist); re-access after the
/// underlying buffer has been returned fails with [`BufferError::UseAfterReturn`].
#[derive(Debug, Clone)]
pub struct PacketView {
    buf: Buffer,
}

impl PacketView {
    pub fn header_type(&self) -> Option<HeaderType> {
        HeaderType::from_byte(self.buf.byte_at(HEADER_TYPE_OFFSET).ok()?)
    }

    pub fn payload_from(&self, header_len: usize) -> &[u8] {
        let written = self.buf.written();
        if header_len >= written.len() {
            &[]
        } else {
            &written[header_len..]
        }
    }

    /// Byte accessor over the user payload, i.e. the bytes after the
    /// application packet id. Index 0 is the first such byte. Panics like
    /// a normal slice index on OOB.
    pub fn byte(&self, i: usize) -> u8 {
        self.payload_from(self.buf.read_pos() + 2)[i]
    }

    pub fn size(&self) -> usize {
        self.buf.size()
    }

    /// Application packet id: the two bytes at the current read cursor.
    /// Valid once the producing channel has called `seek_payload` to
    /// position the cursor at the app-id boundary.
    pub fn app_packet_id(&self) -> Result<u16, BufferError> {
        let off = self.buf.read_pos();
        let b = [self.buf.byte_at(off)?, self.buf.byte_at(off + 1)?];
        Ok(u16::from_le_bytes(b))
    }

    pub fn into_packet(self) -> Packet {
        Packet { buf: self.buf }
    }
}

/// Decode a 32-bit varint directly from a byte slice (used by fuzz targets
/// and tests exercising the wire parser without a `Packet`).
pub fn decode_varint_from_slice(mut data: &[u8]) -> Result<u32, BufferError> {
    varint::decode(&mut data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferPool;

    #[test]
    fn data_packet_roundtrips_payload() {
        let pool = BufferPool::new(1432);
        let mut pkt = Packet::new_data(&pool, 3, 42);
        pkt.write_u32(0xdeadbeef).unwrap();
        pkt.write_string("hi").unwrap();

        assert_eq!(pkt.channel_id().unwrap(), 3);
        assert_eq!(pkt.app_packet_id().unwrap(), 42);

        pkt.seek_payload(CHANNEL_ID_OFFSET + 1 + 2);
        assert_eq!(pkt.read_u32().unwrap(), 0xdeadbeef);
        assert_eq!(pkt.read_string().unwrap(), "hi");
    }

    #[test]
    fn seq_and_frag_fields_roundtrip() {
        let pool = BufferPool::new(1432);
        let mut pkt = Packet::new_data(&pool, 1, 0);
        pkt.write_seq(Seq(1234)).unwrap();
        pkt.write_frag(100, true).unwrap();
        assert_eq!(pkt.read_seq().unwrap(), Seq(1234));
        assert_eq!(pkt.read_frag().unwrap(), (100, true));
    }

    #[test]
    fn array_roundtrip_up_to_1024_elements() {
        let pool = BufferPool::new(64 * 1024);
        let mut pkt = Packet::new_data(&pool, 1, 0);
        let items: Vec<u32> = (0..1024).collect();
        pkt.write_array(&items, |p, v| p.write_u32(*v)).unwrap();

        pkt.seek_payload(CHANNEL_ID_OFFSET + 1 + 2);
        let read_back = pkt.read_array(|p| p.read_u32()).unwrap();
        assert_eq!(read_back, items);
    }

    #[test]
    fn out_of_bounds_read_fails() {
        let pool = BufferPool::new(1432);
        let mut pkt = Packet::new_data(&pool, 1, 0);
        pkt.seek_payload(CHANNEL_ID_OFFSET + 1 + 2);
        assert!(pkt.read_u32().is_err());
    }

    #[test]
    fn write_past_capacity_fails() {
        let pool = BufferPool::new(8);
        let mut pkt = Packet::new_data(&pool, 1, 0); // header already uses 4 bytes
        assert!(pkt.append_payload(&[0u8; 16]).is_err());
    }

    #[test]
    fn reframe_inserts_seq_ahead_of_app_id_and_payload() {
        let pool = BufferPool::new(1432);
        let mut pkt = Packet::new_data(&pool, 5, 42);
        pkt.write_u32(0xdeadbeef).unwrap();

        let mut framed = pkt.reframe(&pool, 5, |p| p.write_seq(Seq(7))).unwrap();
        assert_eq!(framed.channel_id().unwrap(), 5);
        assert_eq!(framed.read_seq().unwrap(), Seq(7));
        assert_eq!(framed.size(), RELIABLE_HEADER_LEN + 2 + 4);
        assert_eq!(framed.app_packet_id().unwrap(), 42);
        assert_eq!(framed.read_u16().unwrap(), 42); // consumes the app id
        assert_eq!(framed.read_u32().unwrap(), 0xdeadbeef);
    }
}
