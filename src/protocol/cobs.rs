//! Consistent Overhead Byte Stuffing for the serial byte stream.
//!
//! Raw frames contain arbitrary bytes including zero; the UART stream uses a
//! single `0x00` octet as the frame delimiter. COBS removes every zero from
//! the frame body so the delimiter is unambiguous:
//!
//! ```text
//! raw:     11 22 00 33
//! encoded: 03 11 22 02 33        (+ 00 delimiter appended by the transport)
//! ```
//!
//! Each code byte counts the non-zero bytes that follow it plus one; a code
//! of `0xFF` means 254 literal bytes with no implied zero.

use thiserror::Error;

/// Longest run of literal bytes a single code byte can describe.
const MAX_GROUP: usize = 254;

/// Decoding failure for a COBS block.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CobsError {
    /// A zero byte appeared inside the encoded block.
    #[error("unexpected zero byte inside COBS block")]
    UnexpectedZero,
    /// A code byte pointed past the end of the block.
    #[error("truncated COBS block")]
    Truncated,
}

/// Encode `data` so the result contains no zero bytes.
///
/// The trailing frame delimiter is NOT appended here; the serial transport
/// owns the delimiter.
pub fn encode(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + data.len() / MAX_GROUP + 2);
    let mut code_idx = out.len();
    out.push(0);
    let mut code: u8 = 1;

    for &byte in data {
        if byte == 0 {
            out[code_idx] = code;
            code_idx = out.len();
            out.push(0);
            code = 1;
        } else {
            out.push(byte);
            code += 1;
            if code == 0xFF {
                out[code_idx] = code;
                code_idx = out.len();
                out.push(0);
                code = 1;
            }
        }
    }

    out[code_idx] = code;
    out
}

/// Decode a single COBS block (without its trailing delimiter).
pub fn decode(data: &[u8]) -> Result<Vec<u8>, CobsError> {
    let mut out = Vec::with_capacity(data.len());
    let mut i = 0;

    while i < data.len() {
        let code = data[i] as usize;
        if code == 0 {
            return Err(CobsError::UnexpectedZero);
        }
        i += 1;
        let group_end = i + code - 1;
        if group_end > data.len() {
            return Err(CobsError::Truncated);
        }
        for &byte in &data[i..group_end] {
            if byte == 0 {
                return Err(CobsError::UnexpectedZero);
            }
            out.push(byte);
        }
        i = group_end;
        // A full 0xFF group carries no implied zero; every other group
        // re-inserts the zero it replaced, except at end of block.
        if code != 0xFF && i < data.len() {
            out.push(0);
        }
    }

    Ok(out)
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_round_trips() {
        let encoded = encode(&[]);
        assert_eq!(encoded, vec![1]);
        assert_eq!(decode(&encoded).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn no_zero_bytes_in_output() {
        let data: Vec<u8> = (0u8..=255).collect();
        let encoded = encode(&data);
        assert!(!encoded.contains(&0));
    }

    #[test]
    fn single_zero_round_trips() {
        let encoded = encode(&[0]);
        assert_eq!(encoded, vec![1, 1]);
        assert_eq!(decode(&encoded).unwrap(), vec![0]);
    }

    #[test]
    fn wikipedia_vector() {
        // Classic reference vector: 11 22 00 33 -> 03 11 22 02 33
        let encoded = encode(&[0x11, 0x22, 0x00, 0x33]);
        assert_eq!(encoded, vec![0x03, 0x11, 0x22, 0x02, 0x33]);
        assert_eq!(decode(&encoded).unwrap(), vec![0x11, 0x22, 0x00, 0x33]);
    }

    #[test]
    fn long_run_without_zeros_uses_ff_groups() {
        let data = vec![0x42u8; 300];
        let encoded = encode(&data);
        assert_eq!(encoded[0], 0xFF);
        assert_eq!(decode(&encoded).unwrap(), data);
    }

    #[test]
    fn exactly_254_literals() {
        let data = vec![7u8; 254];
        let encoded = encode(&data);
        assert_eq!(decode(&encoded).unwrap(), data);
    }

    #[test]
    fn all_byte_values_round_trip() {
        let data: Vec<u8> = (0u8..=255).cycle().take(1024).collect();
        let encoded = encode(&data);
        assert_eq!(decode(&encoded).unwrap(), data);
    }

    #[test]
    fn zero_heavy_payload_round_trips() {
        let data = vec![0u8; 64];
        let encoded = encode(&data);
        assert!(!encoded.contains(&0));
        assert_eq!(decode(&encoded).unwrap(), data);
    }

    #[test]
    fn decode_rejects_embedded_zero() {
        assert_eq!(decode(&[0x02, 0x00]), Err(CobsError::UnexpectedZero));
        assert_eq!(decode(&[0x00]), Err(CobsError::UnexpectedZero));
    }

    #[test]
    fn decode_rejects_truncated_group() {
        // Code byte 5 promises four literals but only two follow.
        assert_eq!(decode(&[0x05, 0x11, 0x22]), Err(CobsError::Truncated));
    }
}
