//! Wire framing: each message is preceded by its body length encoded as a
//! packed integer, low group first. The first byte carries six data bits, a
//! sign flag (bit 6) and a continuation flag (bit 7); every following byte
//! carries seven data bits plus a continuation flag. Lengths are 32-bit, so
//! a prefix never exceeds [`MAX_PREFIX_BYTES`].

use bytes::{BufMut, BytesMut};

use crate::service::{AppError, AppResult};

/// The widest possible length prefix.
pub const MAX_PREFIX_BYTES: usize = 5;

/// Encode a message length. Returns the prefix bytes and how many of them
/// are used; only the used bytes go on the wire.
pub fn encode_length(len: usize) -> ([u8; MAX_PREFIX_BYTES], usize) {
    debug_assert!(len > 0 && len <= i32::MAX as usize);
    let mut out = [0u8; MAX_PREFIX_BYTES];
    let mut used = 0;

    // first byte holds a sign bit (always clear here) and 6 data bits
    let mut value = len as u32;
    let mut byte = (value & 0x3F) as u8;
    value >>= 6;

    while value != 0 {
        out[used] = byte | 0x80;
        used += 1;
        byte = (value & 0x7F) as u8;
        value >>= 7;
    }
    out[used] = byte;
    (out, used + 1)
}

/// Decode a length prefix from the front of `buf`.
///
/// Returns `Ok(None)` while `buf` does not yet hold a complete prefix, and
/// `Ok(Some((length, consumed)))` once it does. A set sign flag, a value
/// needing more than 31 bits, or a decoded length of zero are protocol
/// errors.
pub fn decode_length(buf: &[u8]) -> AppResult<Option<(usize, usize)>> {
    let Some(&first) = buf.first() else {
        return Ok(None);
    };
    if first & 0x40 != 0 {
        return Err(AppError::MalformedProtocol(
            "received a message with a negative length".to_string(),
        ));
    }

    let mut value = (first & 0x3F) as u64;
    let mut bits = 6;
    let mut consumed = 1;
    let mut more = first & 0x80 != 0;

    while more {
        if bits > 31 {
            return Err(AppError::MalformedProtocol(
                "received a message with an invalid length".to_string(),
            ));
        }
        let Some(&byte) = buf.get(consumed) else {
            return Ok(None);
        };
        consumed += 1;
        value |= ((byte & 0x7F) as u64) << bits;
        bits += 7;
        more = byte & 0x80 != 0;
    }

    if value == 0 || value > i32::MAX as u64 {
        return Err(AppError::MalformedProtocol(
            "received a message with an invalid length".to_string(),
        ));
    }
    Ok(Some((value as usize, consumed)))
}

/// Reject a decoded length above the configured ceiling (0 = unlimited).
pub fn enforce_max_message_size(len: usize, max: usize) -> AppResult<()> {
    if max > 0 && len > max {
        return Err(AppError::MessageTooLarge(format!(
            "message of length {} exceeds the maximum of {} bytes",
            len, max
        )));
    }
    Ok(())
}

/// Frame a complete message: length prefix followed by the body. Used by
/// clients and tests; the reactor streams prefix and pooled body segments
/// separately.
pub fn frame_message(body: &[u8]) -> BytesMut {
    let (prefix, used) = encode_length(body.len());
    let mut framed = BytesMut::with_capacity(used + body.len());
    framed.put_slice(&prefix[..used]);
    framed.put_slice(body);
    framed
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(1, 1)]
    #[case(63, 1)]
    #[case(64, 2)]
    #[case(300, 2)]
    #[case((1 << 13) - 1, 2)]
    #[case(1 << 13, 3)]
    #[case((1 << 20) - 1, 3)]
    #[case(1 << 20, 4)]
    #[case((1 << 27) - 1, 4)]
    #[case(1 << 27, 5)]
    #[case(i32::MAX as usize, 5)]
    fn round_trip_across_prefix_widths(#[case] len: usize, #[case] width: usize) {
        let (prefix, used) = encode_length(len);
        assert_eq!(used, width);
        assert_eq!(decode_length(&prefix[..used]).unwrap(), Some((len, used)));
    }

    #[test]
    fn incomplete_prefixes_ask_for_more() {
        assert_eq!(decode_length(&[]).unwrap(), None);
        let (prefix, used) = encode_length(1 << 20);
        for cut in 0..used {
            assert_eq!(decode_length(&prefix[..cut]).unwrap(), None);
        }
    }

    #[test]
    fn trailing_bytes_are_left_alone() {
        let (prefix, used) = encode_length(300);
        let mut buf = prefix[..used].to_vec();
        buf.extend_from_slice(b"payload");
        assert_eq!(decode_length(&buf).unwrap(), Some((300, used)));
    }

    #[test]
    fn negative_length_is_a_protocol_error() {
        let err = decode_length(&[0x40]).unwrap_err();
        assert!(matches!(err, AppError::MalformedProtocol(_)));
    }

    #[test]
    fn zero_length_is_a_protocol_error() {
        assert!(decode_length(&[0x00]).is_err());
        // multi-byte encoding of zero
        assert!(decode_length(&[0x80, 0x80, 0x00]).is_err());
    }

    #[test]
    fn overlong_prefix_is_a_protocol_error() {
        assert!(decode_length(&[0x9F, 0xFF, 0xFF, 0xFF, 0xFF, 0x7F]).is_err());
    }

    #[test]
    fn oversized_length_is_a_protocol_error() {
        // 2^31 needs 32 bits: one past i32::MAX
        assert!(decode_length(&[0x80, 0x80, 0x80, 0x80, 0x20]).is_err());
    }

    #[test]
    fn max_message_size_is_enforced_at_decode_time() {
        assert!(enforce_max_message_size(100, 0).is_ok());
        assert!(enforce_max_message_size(100, 100).is_ok());
        assert!(matches!(
            enforce_max_message_size(101, 100),
            Err(AppError::MessageTooLarge(_))
        ));
    }

    #[test]
    fn frame_message_prepends_only_the_used_prefix_bytes() {
        let framed = frame_message(b"abc");
        assert_eq!(framed.as_ref(), &[0x03, b'a', b'b', b'c']);

        let body = vec![0u8; 300];
        let framed = frame_message(&body);
        let (len, consumed) = decode_length(&framed).unwrap().unwrap();
        assert_eq!(len, 300);
        assert_eq!(consumed, 2);
        assert_eq!(framed.len(), consumed + 300);
    }
}
