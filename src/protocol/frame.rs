//! Frame building and parsing for the MCU serial link.
//!
//! Wire format before COBS encoding (all integers big-endian):
//!
//! ```text
//! [version: u8] [payload_len: u16] [command_id: u16] [payload…] [crc32: u32]
//! ```
//!
//! The CRC covers the header and payload. The raw frame is COBS-encoded and
//! terminated with a single zero octet by the serial transport. Parsing is
//! total: every input yields either `(command_id, payload)` or a typed
//! [`FrameError`]; no partial parses escape this module.

use thiserror::Error;

use super::{MAX_PAYLOAD_SIZE, PROTOCOL_VERSION, STATUS_CODE_MIN};

/// Header bytes covered by the CRC.
pub const HEADER_SIZE: usize = 5;
/// CRC trailer bytes.
pub const CRC_SIZE: usize = 4;
/// Shortest structurally valid frame (empty payload).
pub const MIN_FRAME_SIZE: usize = HEADER_SIZE + CRC_SIZE;

/// Frame codec failure.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    /// Payload exceeds [`MAX_PAYLOAD_SIZE`].
    #[error("payload too large ({len} bytes; max {MAX_PAYLOAD_SIZE})")]
    PayloadTooLarge { len: usize },
    /// Buffer shorter than the minimum frame.
    #[error("incomplete frame: {len} bytes is less than minimum {MIN_FRAME_SIZE}")]
    FrameTooShort { len: usize },
    /// Declared payload length disagrees with the buffer size.
    #[error("payload length field {declared} does not match frame body {actual}")]
    LengthMismatch { declared: usize, actual: usize },
    /// Stored CRC does not match the computed CRC.
    #[error("CRC mismatch: expected {expected:08X}, got {received:08X}")]
    CrcMismatch { expected: u32, received: u32 },
    /// Header version differs from [`PROTOCOL_VERSION`].
    #[error("invalid version: expected {PROTOCOL_VERSION}, got {got}")]
    VersionMismatch { got: u8 },
    /// Command id below [`STATUS_CODE_MIN`]; reserved and never valid.
    #[error("invalid command id {id} (reserved/below minimum {STATUS_CODE_MIN})")]
    CommandIdReserved { id: u16 },
}

/// Build a raw frame (header + payload + CRC) ready for COBS encoding.
pub fn build(command_id: u16, payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(FrameError::PayloadTooLarge { len: payload.len() });
    }

    let mut frame = Vec::with_capacity(MIN_FRAME_SIZE + payload.len());
    frame.push(PROTOCOL_VERSION);
    frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    frame.extend_from_slice(&command_id.to_be_bytes());
    frame.extend_from_slice(payload);

    let crc = crc32fast::hash(&frame);
    frame.extend_from_slice(&crc.to_be_bytes());
    Ok(frame)
}

/// Parse a decoded frame, validating size, CRC, version and id range.
pub fn parse(raw: &[u8]) -> Result<(u16, Vec<u8>), FrameError> {
    if raw.len() < MIN_FRAME_SIZE {
        return Err(FrameError::FrameTooShort { len: raw.len() });
    }

    // CRC first: a corrupted frame must not be interpreted structurally.
    let crc_start = raw.len() - CRC_SIZE;
    let body = &raw[..crc_start];
    let received = u32::from_be_bytes([
        raw[crc_start],
        raw[crc_start + 1],
        raw[crc_start + 2],
        raw[crc_start + 3],
    ]);
    let expected = crc32fast::hash(body);
    if received != expected {
        return Err(FrameError::CrcMismatch { expected, received });
    }

    let version = body[0];
    let declared = u16::from_be_bytes([body[1], body[2]]) as usize;
    let command_id = u16::from_be_bytes([body[3], body[4]]);
    let actual = body.len() - HEADER_SIZE;
    if declared != actual {
        return Err(FrameError::LengthMismatch { declared, actual });
    }

    if version != PROTOCOL_VERSION {
        return Err(FrameError::VersionMismatch { got: version });
    }

    // Reject noise frames (valid CRC, nonsense id) before they can reach the
    // dispatcher and flood the logs with link-not-synchronized warnings.
    if command_id < STATUS_CODE_MIN {
        return Err(FrameError::CommandIdReserved { id: command_id });
    }

    Ok((command_id, body[HEADER_SIZE..].to_vec()))
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Command;

    #[test]
    fn build_parse_round_trip() {
        let payload = b"hello mcu";
        let raw = build(Command::ConsoleWrite.value(), payload).unwrap();
        let (cmd, parsed) = parse(&raw).unwrap();
        assert_eq!(cmd, Command::ConsoleWrite.value());
        assert_eq!(parsed, payload);
    }

    #[test]
    fn empty_payload_round_trips() {
        let raw = build(Command::GetVersion.value(), b"").unwrap();
        assert_eq!(raw.len(), MIN_FRAME_SIZE);
        let (cmd, parsed) = parse(&raw).unwrap();
        assert_eq!(cmd, Command::GetVersion.value());
        assert!(parsed.is_empty());
    }

    #[test]
    fn max_payload_round_trips() {
        let payload = vec![0xA5u8; MAX_PAYLOAD_SIZE];
        let raw = build(Command::FileWrite.value(), &payload).unwrap();
        let (_, parsed) = parse(&raw).unwrap();
        assert_eq!(parsed, payload);
    }

    #[test]
    fn all_valid_ids_round_trip() {
        for id in [48u16, 64, 96, 175, 0x8051, u16::MAX] {
            let raw = build(id, b"x").unwrap();
            let (cmd, _) = parse(&raw).unwrap();
            assert_eq!(cmd, id);
        }
    }

    #[test]
    fn oversized_payload_rejected() {
        let payload = vec![0u8; MAX_PAYLOAD_SIZE + 1];
        assert_eq!(
            build(Command::FileWrite.value(), &payload),
            Err(FrameError::PayloadTooLarge { len: MAX_PAYLOAD_SIZE + 1 })
        );
    }

    #[test]
    fn short_buffer_rejected() {
        assert_eq!(parse(&[0u8; 4]), Err(FrameError::FrameTooShort { len: 4 }));
        assert_eq!(parse(&[]), Err(FrameError::FrameTooShort { len: 0 }));
    }

    #[test]
    fn corrupted_crc_rejected() {
        let mut raw = build(Command::GetVersion.value(), b"abc").unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0xFF;
        assert!(matches!(parse(&raw), Err(FrameError::CrcMismatch { .. })));
    }

    #[test]
    fn corrupted_payload_rejected() {
        let mut raw = build(Command::ConsoleWrite.value(), b"payload").unwrap();
        raw[HEADER_SIZE] ^= 0x01;
        assert!(matches!(parse(&raw), Err(FrameError::CrcMismatch { .. })));
    }

    #[test]
    fn wrong_version_rejected() {
        // Hand-assemble a frame with version 1 and a valid CRC.
        let mut frame = vec![1u8, 0, 0];
        frame.extend_from_slice(&Command::GetVersion.value().to_be_bytes());
        let crc = crc32fast::hash(&frame);
        frame.extend_from_slice(&crc.to_be_bytes());
        assert_eq!(parse(&frame), Err(FrameError::VersionMismatch { got: 1 }));
    }

    #[test]
    fn reserved_command_id_rejected() {
        let mut frame = vec![PROTOCOL_VERSION, 0, 0, 0, 0x10];
        let crc = crc32fast::hash(&frame);
        frame.extend_from_slice(&crc.to_be_bytes());
        assert_eq!(parse(&frame), Err(FrameError::CommandIdReserved { id: 0x10 }));
    }

    #[test]
    fn length_field_mismatch_rejected() {
        // Declare 2 payload bytes but carry 3.
        let mut frame = vec![PROTOCOL_VERSION, 0, 2];
        frame.extend_from_slice(&Command::ConsoleWrite.value().to_be_bytes());
        frame.extend_from_slice(b"abc");
        let crc = crc32fast::hash(&frame);
        frame.extend_from_slice(&crc.to_be_bytes());
        assert_eq!(
            parse(&frame),
            Err(FrameError::LengthMismatch { declared: 2, actual: 3 })
        );
    }

    #[test]
    fn cobs_wrapped_frame_survives_transport() {
        use crate::protocol::cobs;
        let raw = build(Command::DigitalWrite.value(), &[5, 1]).unwrap();
        let wire = cobs::encode(&raw);
        assert!(!wire.contains(&0));
        let decoded = cobs::decode(&wire).unwrap();
        let (cmd, payload) = parse(&decoded).unwrap();
        assert_eq!(cmd, Command::DigitalWrite.value());
        assert_eq!(payload, vec![5, 1]);
    }
}
