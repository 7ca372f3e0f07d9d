//! Variable-length Integer Encoding (Varint)
//!
//! ## Varint Encoding
//! Each byte carries 7 bits of data and 1 continuation bit, so small numbers
//! (0-127) take a single byte and a full u64 takes at most 10.
//!
//! ## ZigZag Encoding (for signed integers)
//! Maps signed integers to unsigned so small negative numbers stay short:
//! 0 → 0, -1 → 1, 1 → 2, -2 → 3, 2 → 4, etc.
//!
//! ## Where Tracehouse uses it
//! Record payloads in the buffer log and in remote dispatch frames: schema ids,
//! time buckets, field counts, string lengths and INT/LONG field values.
//!
//! Decoding is checked: a truncated buffer or an over-long varint yields
//! [`Error::Decode`] instead of panicking, because the bytes may come from a
//! torn file or a remote peer.

use bytes::{Buf, BufMut};

use crate::{Error, Result};

/// Longest valid encoding of a u64.
const MAX_VARINT_LEN: usize = 10;

/// Encode a signed integer as a varint (ZigZag encoding)
pub fn encode_varint(buf: &mut impl BufMut, value: i64) {
    let unsigned = ((value << 1) ^ (value >> 63)) as u64;
    encode_varint_u64(buf, unsigned);
}

/// Encode an unsigned integer as a varint
pub fn encode_varint_u64(buf: &mut impl BufMut, mut value: u64) {
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;

        if value != 0 {
            byte |= 0x80;
        }

        buf.put_u8(byte);

        if value == 0 {
            break;
        }
    }
}

/// Decode a ZigZag varint to a signed integer
pub fn decode_varint(buf: &mut impl Buf) -> Result<i64> {
    let unsigned = decode_varint_u64(buf)?;

    let value = (unsigned >> 1) as i64;
    if (unsigned & 1) != 0 {
        Ok(!value)
    } else {
        Ok(value)
    }
}

/// Decode a varint to an unsigned integer
pub fn decode_varint_u64(buf: &mut impl Buf) -> Result<u64> {
    let mut value: u64 = 0;

    for i in 0..MAX_VARINT_LEN {
        if !buf.has_remaining() {
            return Err(Error::Decode("truncated varint".to_string()));
        }
        let byte = buf.get_u8();
        value |= ((byte & 0x7F) as u64) << (7 * i);

        if (byte & 0x80) == 0 {
            return Ok(value);
        }
    }

    Err(Error::Decode("varint too large".to_string()))
}

/// Number of bytes `value` occupies once varint-encoded.
pub fn varint_len_u64(mut value: u64) -> usize {
    let mut len = 1;
    while value >= 0x80 {
        value >>= 7;
        len += 1;
    }
    len
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn test_varint_small_negative() {
        let mut buf = BytesMut::new();
        encode_varint(&mut buf, -5);

        let mut cursor = buf.as_ref();
        assert_eq!(decode_varint(&mut cursor).unwrap(), -5);
        assert!(cursor.is_empty());
    }

    #[test]
    fn test_varint_extremes() {
        for val in [i64::MIN, i64::MAX, 0, -1, 1] {
            let mut buf = BytesMut::new();
            encode_varint(&mut buf, val);
            let mut cursor = buf.as_ref();
            let decoded = decode_varint(&mut cursor).unwrap();
            assert_eq!(decoded, val, "failed for value {val}");
        }
    }

    #[test]
    fn test_varint_u64_max_uses_ten_bytes() {
        let mut buf = BytesMut::new();
        encode_varint_u64(&mut buf, u64::MAX);
        assert_eq!(buf.len(), 10);
        assert_eq!(varint_len_u64(u64::MAX), 10);
    }

    #[test]
    fn test_varint_len_matches_encoding() {
        for val in [0u64, 127, 128, 16_383, 16_384, 1 << 35] {
            let mut buf = BytesMut::new();
            encode_varint_u64(&mut buf, val);
            assert_eq!(varint_len_u64(val), buf.len(), "failed for value {val}");
        }
    }

    #[test]
    fn test_truncated_varint_is_error() {
        // continuation bit set, then nothing
        let mut cursor: &[u8] = &[0x80];
        assert!(matches!(decode_varint_u64(&mut cursor), Err(Error::Decode(_))));

        let mut empty: &[u8] = &[];
        assert!(decode_varint(&mut empty).is_err());
    }

    #[test]
    fn test_overlong_varint_is_error() {
        let mut cursor: &[u8] = &[0xFF; 11];
        assert!(matches!(decode_varint_u64(&mut cursor), Err(Error::Decode(_))));
    }
}
