//! Property-based tests for the wire-level primitives: varint encoding,
//! wrap-aware sequence comparison, and buffer/packet header roundtrips.

use proptest::prelude::*;

use rudp_core::buffer::BufferPool;
use rudp_core::packet::{HeaderType, Packet, HEADER_TYPE_LEN};
use rudp_core::sequence::{greater, Seq};
use rudp_core::varint;

// ─── Invariant 4: VarInt roundtrip ──────────────────────────────────────────

proptest! {
    #[test]
    fn varint_roundtrip(val: u32) {
        let mut buf = bytes::BytesMut::new();
        varint::encode(val, &mut buf);
        prop_assert_eq!(buf.len(), varint::encoded_len(val));
        let decoded = varint::decode(&mut &buf[..]).unwrap();
        prop_assert_eq!(decoded, val);
    }

    #[test]
    fn varint_byte_count_matches_schedule(val: u32) {
        let expected = match val {
            0..=127 => 1,
            128..=16383 => 2,
            16384..=2_097_151 => 3,
            2_097_152..=268_435_455 => 4,
            _ => 5,
        };
        prop_assert_eq!(varint::encoded_len(val), expected);
    }
}

// ─── Invariant 1: wrap-aware sequence comparator ────────────────────────────

proptest! {
    #[test]
    fn exactly_one_direction_is_greater(a: u16, b: u16) {
        if a != b {
            prop_assert_ne!(greater(a, b), greater(b, a));
        } else {
            prop_assert!(!greater(a, b));
        }
    }

    #[test]
    fn seq_ord_matches_greater(a: u16, b: u16) {
        let (sa, sb) = (Seq(a), Seq(b));
        if a == b {
            prop_assert_eq!(sa, sb);
        } else if greater(a, b) {
            prop_assert!(sa > sb);
        } else {
            prop_assert!(sa < sb);
        }
    }
}

// ─── Invariant 2: buffer primitive write/read roundtrip at fixed offsets ────

fn offset_strategy(buf_cap: usize, value_size: usize) -> impl Strategy<Value = usize> {
    prop_oneof![Just(0usize), Just(1usize), Just(buf_cap - value_size)]
}

proptest! {
    #[test]
    fn buffer_u8_roundtrip(v: u8, offset in offset_strategy(1432, 1)) {
        let pool = BufferPool::new(1432);
        let mut buf = pool.get();
        buf.write_at(offset, &[v]).unwrap();
        prop_assert_eq!(buf.byte_at(offset).unwrap(), v);
    }

    #[test]
    fn buffer_u16_roundtrip(v: u16, offset in offset_strategy(1432, 2)) {
        let pool = BufferPool::new(1432);
        let mut buf = pool.get();
        buf.write_at(offset, &v.to_le_bytes()).unwrap();
        let b0 = buf.byte_at(offset).unwrap();
        let b1 = buf.byte_at(offset + 1).unwrap();
        prop_assert_eq!(u16::from_le_bytes([b0, b1]), v);
    }

    #[test]
    fn buffer_u32_roundtrip(v: u32, offset in offset_strategy(1432, 4)) {
        let pool = BufferPool::new(1432);
        let mut buf = pool.get();
        buf.write_at(offset, &v.to_le_bytes()).unwrap();
        let bytes: Vec<u8> = (0..4).map(|i| buf.byte_at(offset + i).unwrap()).collect();
        prop_assert_eq!(u32::from_le_bytes(bytes.try_into().unwrap()), v);
    }

    #[test]
    fn buffer_u64_roundtrip(v: u64, offset in offset_strategy(1432, 8)) {
        let pool = BufferPool::new(1432);
        let mut buf = pool.get();
        buf.write_at(offset, &v.to_le_bytes()).unwrap();
        let bytes: Vec<u8> = (0..8).map(|i| buf.byte_at(offset + i).unwrap()).collect();
        prop_assert_eq!(u64::from_le_bytes(bytes.try_into().unwrap()), v);
    }
}

// ─── Invariant 3: length-prefixed array roundtrip, up to 1024 elements ──────

proptest! {
    #[test]
    fn packet_array_roundtrip(items in prop::collection::vec(any::<u32>(), 0..1024)) {
        let pool = BufferPool::new(1432 * 8);
        let mut pkt = Packet::new_control(&pool, HeaderType::Data);
        pkt.write_array(&items, |p, v| p.write_u32(*v)).unwrap();

        pkt.seek_payload(HEADER_TYPE_LEN);
        let decoded = pkt.read_array(|p| p.read_u32()).unwrap();
        prop_assert_eq!(decoded, items);
    }

    #[test]
    fn packet_string_roundtrip(s in "[ -~]{0,256}") {
        let pool = BufferPool::new(2048);
        let mut pkt = Packet::new_control(&pool, HeaderType::Data);
        pkt.write_string(&s).unwrap();

        pkt.seek_payload(HEADER_TYPE_LEN);
        let decoded = pkt.read_string().unwrap();
        prop_assert_eq!(decoded, s);
    }
}
