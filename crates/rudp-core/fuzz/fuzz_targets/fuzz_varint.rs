#![no_main]

use libfuzzer_sys::fuzz_target;
use rudp_core::varint;

/// Fuzz varint decode/encode roundtrip.
///
/// If decode succeeds, the re-encoded form must decode to the same value
/// using exactly the byte count `encoded_len` predicts.
fuzz_target!(|data: &[u8]| {
    if let Ok(value) = varint::decode(&mut &data[..]) {
        let mut buf = bytes::BytesMut::new();
        varint::encode(value, &mut buf);
        assert_eq!(buf.len(), varint::encoded_len(value));
        let decoded = varint::decode(&mut &buf[..]).expect("re-decode must succeed");
        assert_eq!(decoded, value);
    }
});
