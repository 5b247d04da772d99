//! Run-length compression for frame payloads.
//!
//! Optional on the wire: the sender sets the `CMD_FLAG_COMPRESSED` bit on the
//! command id only when [`should_compress`] holds and the encoded form is
//! strictly shorter than the original payload.
//!
//! Encoding scheme (escape byte `0xFF`):
//!
//! ```text
//! FF FF        literal 0xFF byte
//! FF nn bb     run of byte bb repeated nn+2 times (nn in 0..=254)
//! xx           any other byte, literal
//! ```
//!
//! Runs shorter than [`MIN_RUN`] are emitted literally; runs longer than
//! [`MAX_RUN`] are split.

use thiserror::Error;

/// Escape byte introducing a run or an escaped literal.
pub const ESCAPE: u8 = 0xFF;
/// Shortest run worth compressing.
pub const MIN_RUN: usize = 4;
/// Longest run a single escape triple can express.
pub const MAX_RUN: usize = 256;
/// Count byte marking an escaped literal `0xFF`.
const LITERAL_MARKER: u8 = 0xFF;

/// Decoding failure for a compressed payload.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RleError {
    /// The payload ended in the middle of an escape sequence.
    #[error("truncated RLE escape sequence")]
    TruncatedEscape,
}

/// True when the payload contains at least one run long enough to compress.
pub fn should_compress(payload: &[u8]) -> bool {
    let mut run = 1usize;
    for window in payload.windows(2) {
        if window[0] == window[1] {
            run += 1;
            if run >= MIN_RUN {
                return true;
            }
        } else {
            run = 1;
        }
    }
    false
}

/// Encode `payload`. The result may be longer than the input (escape-heavy
/// data); callers compare lengths before setting the compressed flag.
pub fn encode(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len());
    let mut i = 0;

    while i < payload.len() {
        let byte = payload[i];
        let mut run = 1;
        while i + run < payload.len() && payload[i + run] == byte && run < MAX_RUN {
            run += 1;
        }

        if run >= MIN_RUN {
            out.push(ESCAPE);
            out.push((run - 2) as u8);
            out.push(byte);
            i += run;
        } else {
            for _ in 0..run {
                if byte == ESCAPE {
                    out.push(ESCAPE);
                    out.push(LITERAL_MARKER);
                } else {
                    out.push(byte);
                }
            }
            i += run;
        }
    }

    out
}

/// Decode a compressed payload.
pub fn decode(payload: &[u8]) -> Result<Vec<u8>, RleError> {
    let mut out = Vec::with_capacity(payload.len() * 2);
    let mut i = 0;

    while i < payload.len() {
        let byte = payload[i];
        if byte != ESCAPE {
            out.push(byte);
            i += 1;
            continue;
        }

        let count = *payload.get(i + 1).ok_or(RleError::TruncatedEscape)?;
        if count == LITERAL_MARKER {
            out.push(ESCAPE);
            i += 2;
            continue;
        }

        let value = *payload.get(i + 2).ok_or(RleError::TruncatedEscape)?;
        out.extend(std::iter::repeat(value).take(count as usize + 2));
        i += 3;
    }

    Ok(out)
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_runs_stay_literal() {
        let data = b"abcabc".to_vec();
        assert!(!should_compress(&data));
        let encoded = encode(&data);
        assert_eq!(encoded, data);
        assert_eq!(decode(&encoded).unwrap(), data);
    }

    #[test]
    fn minimum_run_compresses() {
        let data = vec![9u8; 4];
        assert!(should_compress(&data));
        let encoded = encode(&data);
        assert_eq!(encoded, vec![ESCAPE, 2, 9]);
        assert_eq!(decode(&encoded).unwrap(), data);
    }

    #[test]
    fn maximum_run_single_triple() {
        let data = vec![1u8; MAX_RUN];
        let encoded = encode(&data);
        assert_eq!(encoded, vec![ESCAPE, 254, 1]);
        assert_eq!(decode(&encoded).unwrap(), data);
    }

    #[test]
    fn oversized_run_splits() {
        let data = vec![1u8; MAX_RUN + 5];
        let encoded = encode(&data);
        assert_eq!(decode(&encoded).unwrap(), data);
    }

    #[test]
    fn escape_byte_literals_round_trip() {
        let data = vec![ESCAPE, 0x01, ESCAPE];
        let encoded = encode(&data);
        assert_eq!(encoded, vec![ESCAPE, LITERAL_MARKER, 0x01, ESCAPE, LITERAL_MARKER]);
        assert_eq!(decode(&encoded).unwrap(), data);
    }

    #[test]
    fn escape_run_round_trips() {
        let data = vec![ESCAPE; 10];
        assert!(should_compress(&data));
        let encoded = encode(&data);
        assert_eq!(encoded, vec![ESCAPE, 8, ESCAPE]);
        assert_eq!(decode(&encoded).unwrap(), data);
    }

    #[test]
    fn mixed_payload_round_trips() {
        let mut data = Vec::new();
        data.extend_from_slice(b"hdr");
        data.extend(vec![0u8; 40]);
        data.push(ESCAPE);
        data.extend(vec![7u8; 3]);
        let encoded = encode(&data);
        assert!(encoded.len() < data.len());
        assert_eq!(decode(&encoded).unwrap(), data);
    }

    #[test]
    fn decode_rejects_truncated_escape() {
        assert_eq!(decode(&[ESCAPE]), Err(RleError::TruncatedEscape));
        assert_eq!(decode(&[ESCAPE, 3]), Err(RleError::TruncatedEscape));
    }

    #[test]
    fn empty_payload() {
        assert!(!should_compress(&[]));
        assert_eq!(encode(&[]), Vec::<u8>::new());
        assert_eq!(decode(&[]).unwrap(), Vec::<u8>::new());
    }
}
