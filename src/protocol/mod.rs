//! Binary RPC protocol shared with the MCU firmware.
//!
//! The 16-bit command id space is partitioned into numeric ranges:
//!
//! | range    | purpose     |
//! |----------|-------------|
//! | 48–63    | status codes|
//! | 64–79    | system      |
//! | 80–95    | GPIO        |
//! | 96–111   | console     |
//! | 112–127  | datastore   |
//! | 128–143  | mailbox     |
//! | 144–159  | filesystem  |
//! | 160–175  | process     |
//!
//! Ids below 48 are reserved and rejected at the frame codec. The high bit
//! (`CMD_FLAG_COMPRESSED`) marks an RLE-compressed payload and is masked off
//! before any table lookup.

pub mod cobs;
pub mod frame;
pub mod rle;
pub mod topics;

/// Wire protocol version carried in every frame header.
pub const PROTOCOL_VERSION: u8 = 2;
/// Default UART baud rate.
pub const DEFAULT_BAUDRATE: u32 = 115_200;
/// Maximum frame payload in bytes.
pub const MAX_PAYLOAD_SIZE: usize = 64;
/// Frame delimiter octet on the COBS-encoded stream.
pub const FRAME_DELIMITER: u8 = 0x00;
/// Compressed-payload flag OR-ed onto the command id.
pub const CMD_FLAG_COMPRESSED: u16 = 0x8000;
/// Sentinel for "no such id" in 16-bit id fields.
pub const INVALID_ID_SENTINEL: u16 = 0xFFFF;
/// Exit code reported when a subprocess status is unknown.
pub const PROCESS_DEFAULT_EXIT_CODE: u8 = 255;
/// Default retry limit for tracked serial commands.
pub const DEFAULT_RETRY_LIMIT: u8 = 5;

/// Lowest valid command/status id; anything below is reserved.
pub const STATUS_CODE_MIN: u16 = 48;
/// Highest status code.
pub const STATUS_CODE_MAX: u16 = 63;

// Handshake wire constants.
pub const HANDSHAKE_NONCE_LENGTH: usize = 16;
pub const HANDSHAKE_TAG_LENGTH: usize = 16;
pub const HANDSHAKE_ACK_TIMEOUT_MIN_MS: u16 = 25;
pub const HANDSHAKE_ACK_TIMEOUT_MAX_MS: u16 = 60_000;
pub const HANDSHAKE_RESPONSE_TIMEOUT_MIN_MS: u32 = 100;
pub const HANDSHAKE_RESPONSE_TIMEOUT_MAX_MS: u32 = 180_000;
pub const HANDSHAKE_RETRY_LIMIT_MIN: u8 = 1;
pub const HANDSHAKE_RETRY_LIMIT_MAX: u8 = 8;

// MCU capability feature bits reported by CMD_GET_CAPABILITIES_RESP.
pub const CAPABILITY_WATCHDOG: u32 = 1;
pub const CAPABILITY_RLE: u32 = 2;
pub const CAPABILITY_DEBUG_FRAMES: u32 = 4;
pub const CAPABILITY_DEBUG_IO: u32 = 8;
pub const CAPABILITY_EEPROM: u32 = 16;
pub const CAPABILITY_DAC: u32 = 32;
pub const CAPABILITY_HW_SERIAL1: u32 = 64;
pub const CAPABILITY_FPU: u32 = 128;
pub const CAPABILITY_LOGIC_3V3: u32 = 256;
pub const CAPABILITY_BIG_BUFFER: u32 = 512;
pub const CAPABILITY_I2C: u32 = 1024;

// Status reason strings echoed to the MCU in status frame payloads.
pub const STATUS_REASON_COMMAND_VALIDATION_FAILED: &str = "command_validation_failed";
pub const STATUS_REASON_INVALID_PATH: &str = "invalid_path";
pub const STATUS_REASON_MAILBOX_INCOMING_OVERFLOW: &str = "mailbox_incoming_overflow";
pub const STATUS_REASON_PROCESS_KILL_MALFORMED: &str = "process_kill_malformed";
pub const STATUS_REASON_PROCESS_LIMIT_REACHED: &str = "process_limit_reached";
pub const STATUS_REASON_PROCESS_NOT_FOUND: &str = "process_not_found";
pub const STATUS_REASON_PROCESS_RUN_ASYNC_FAILED: &str = "process_run_async_failed";
pub const STATUS_REASON_PROCESS_RUN_INTERNAL_ERROR: &str = "process_run_internal_error";
pub const STATUS_REASON_READ_FAILED: &str = "read_failed";
pub const STATUS_REASON_REMOVE_FAILED: &str = "remove_failed";
pub const STATUS_REASON_WRITE_FAILED: &str = "write_failed";

/// Status codes emitted by either side of the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Status {
    /// Operation completed successfully.
    Ok = 48,
    /// Generic failure.
    Error = 49,
    /// Command not recognized.
    CmdUnknown = 50,
    /// Payload had invalid structure.
    Malformed = 51,
    /// Frame exceeded buffer size.
    Overflow = 52,
    /// CRC check failed.
    CrcMismatch = 53,
    /// Operation timed out.
    Timeout = 54,
    /// Command defined but not supported.
    NotImplemented = 55,
    /// Generic acknowledgement for fire-and-forget commands.
    Ack = 56,
}

impl Status {
    /// All defined status codes.
    pub const ALL: [Status; 9] = [
        Status::Ok,
        Status::Error,
        Status::CmdUnknown,
        Status::Malformed,
        Status::Overflow,
        Status::CrcMismatch,
        Status::Timeout,
        Status::NotImplemented,
        Status::Ack,
    ];

    /// Numeric wire value.
    pub fn value(self) -> u16 {
        self as u16
    }

    /// Symbolic name used in logs and MQTT status mirrors.
    pub fn name(self) -> &'static str {
        match self {
            Status::Ok => "OK",
            Status::Error => "ERROR",
            Status::CmdUnknown => "CMD_UNKNOWN",
            Status::Malformed => "MALFORMED",
            Status::Overflow => "OVERFLOW",
            Status::CrcMismatch => "CRC_MISMATCH",
            Status::Timeout => "TIMEOUT",
            Status::NotImplemented => "NOT_IMPLEMENTED",
            Status::Ack => "ACK",
        }
    }

    /// Map a wire value back to a status code.
    pub fn from_value(value: u16) -> Option<Status> {
        Status::ALL.into_iter().find(|s| s.value() == value)
    }

    /// Label for an arbitrary status value, falling back to hex.
    pub fn label(value: u16) -> String {
        match Status::from_value(value) {
            Some(status) => status.name().to_string(),
            None => format!("0x{value:02X}"),
        }
    }
}

/// True when `id` lies in the status code range.
pub fn is_status_id(id: u16) -> bool {
    (STATUS_CODE_MIN..=STATUS_CODE_MAX).contains(&id)
}

/// RPC commands exchanged between the daemon and the MCU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Command {
    GetVersion = 64,
    GetVersionResp = 65,
    GetFreeMemory = 66,
    GetFreeMemoryResp = 67,
    LinkSync = 68,
    LinkSyncResp = 69,
    LinkReset = 70,
    LinkResetResp = 71,
    GetCapabilities = 72,
    GetCapabilitiesResp = 73,
    SetBaudrate = 74,
    SetBaudrateResp = 75,
    Xoff = 78,
    Xon = 79,
    SetPinMode = 80,
    DigitalWrite = 81,
    AnalogWrite = 82,
    DigitalRead = 83,
    AnalogRead = 84,
    DigitalReadResp = 85,
    AnalogReadResp = 86,
    ConsoleWrite = 96,
    DatastorePut = 112,
    DatastoreGet = 113,
    DatastoreGetResp = 114,
    MailboxRead = 128,
    MailboxProcessed = 129,
    MailboxAvailable = 130,
    MailboxPush = 131,
    MailboxReadResp = 132,
    MailboxAvailableResp = 133,
    FileWrite = 144,
    FileRead = 145,
    FileRemove = 146,
    FileReadResp = 147,
    ProcessRun = 160,
    ProcessRunAsync = 161,
    ProcessPoll = 162,
    ProcessKill = 163,
    ProcessRunResp = 164,
    ProcessRunAsyncResp = 165,
    ProcessPollResp = 166,
}

impl Command {
    /// Numeric wire value.
    pub fn value(self) -> u16 {
        self as u16
    }

    /// Map a wire value back to a command, ignoring the compressed flag.
    pub fn from_value(value: u16) -> Option<Command> {
        use Command::*;
        let base = value & !CMD_FLAG_COMPRESSED;
        Some(match base {
            64 => GetVersion,
            65 => GetVersionResp,
            66 => GetFreeMemory,
            67 => GetFreeMemoryResp,
            68 => LinkSync,
            69 => LinkSyncResp,
            70 => LinkReset,
            71 => LinkResetResp,
            72 => GetCapabilities,
            73 => GetCapabilitiesResp,
            74 => SetBaudrate,
            75 => SetBaudrateResp,
            78 => Xoff,
            79 => Xon,
            80 => SetPinMode,
            81 => DigitalWrite,
            82 => AnalogWrite,
            83 => DigitalRead,
            84 => AnalogRead,
            85 => DigitalReadResp,
            86 => AnalogReadResp,
            96 => ConsoleWrite,
            112 => DatastorePut,
            113 => DatastoreGet,
            114 => DatastoreGetResp,
            128 => MailboxRead,
            129 => MailboxProcessed,
            130 => MailboxAvailable,
            131 => MailboxPush,
            132 => MailboxReadResp,
            133 => MailboxAvailableResp,
            144 => FileWrite,
            145 => FileRead,
            146 => FileRemove,
            147 => FileReadResp,
            160 => ProcessRun,
            161 => ProcessRunAsync,
            162 => ProcessPoll,
            163 => ProcessKill,
            164 => ProcessRunResp,
            165 => ProcessRunAsyncResp,
            166 => ProcessPollResp,
            _ => return None,
        })
    }
}

/// Human-readable name for any command or status id.
pub fn command_name(id: u16) -> String {
    if let Some(cmd) = Command::from_value(id) {
        return format!("{cmd:?}");
    }
    if let Some(status) = Status::from_value(id) {
        return status.name().to_string();
    }
    format!("UNKNOWN(0x{id:02X})")
}

/// Request ids completed by a bare `STATUS_ACK` with no dedicated response.
const ACK_ONLY_COMMANDS: [u16; 7] = [
    Command::SetPinMode as u16,
    Command::DigitalWrite as u16,
    Command::AnalogWrite as u16,
    Command::ConsoleWrite as u16,
    Command::DatastorePut as u16,
    Command::MailboxPush as u16,
    Command::FileWrite as u16,
];

/// Request ids answered directly with a response frame, no prior ACK.
const RESPONSE_ONLY_COMMANDS: [u16; 5] = [
    Command::GetVersion as u16,
    Command::GetFreeMemory as u16,
    Command::GetCapabilities as u16,
    Command::DigitalRead as u16,
    Command::AnalogRead as u16,
];

/// Request/response id pairs. The flag bit is masked off before lookup.
const REQUEST_RESPONSE_PAIRS: [(u16, u16); 15] = [
    (Command::GetVersion as u16, Command::GetVersionResp as u16),
    (Command::GetFreeMemory as u16, Command::GetFreeMemoryResp as u16),
    (Command::LinkSync as u16, Command::LinkSyncResp as u16),
    (Command::LinkReset as u16, Command::LinkResetResp as u16),
    (Command::GetCapabilities as u16, Command::GetCapabilitiesResp as u16),
    (Command::SetBaudrate as u16, Command::SetBaudrateResp as u16),
    (Command::DigitalRead as u16, Command::DigitalReadResp as u16),
    (Command::AnalogRead as u16, Command::AnalogReadResp as u16),
    (Command::DatastoreGet as u16, Command::DatastoreGetResp as u16),
    (Command::MailboxRead as u16, Command::MailboxReadResp as u16),
    (Command::MailboxAvailable as u16, Command::MailboxAvailableResp as u16),
    (Command::FileRead as u16, Command::FileReadResp as u16),
    (Command::ProcessRun as u16, Command::ProcessRunResp as u16),
    (Command::ProcessRunAsync as u16, Command::ProcessRunAsyncResp as u16),
    (Command::ProcessPoll as u16, Command::ProcessPollResp as u16),
];

/// True when `id` completes on ACK alone.
pub fn is_ack_only(id: u16) -> bool {
    ACK_ONLY_COMMANDS.contains(&(id & !CMD_FLAG_COMPRESSED))
}

/// True when `id` expects a response frame without a prior ACK.
pub fn is_response_only(id: u16) -> bool {
    RESPONSE_ONLY_COMMANDS.contains(&(id & !CMD_FLAG_COMPRESSED))
}

/// Response id a request expects, if any.
pub fn expected_response(id: u16) -> Option<u16> {
    let base = id & !CMD_FLAG_COMPRESSED;
    REQUEST_RESPONSE_PAIRS
        .iter()
        .find(|(req, _)| *req == base)
        .map(|(_, resp)| *resp)
}

/// Request id a response answers, if `id` is a response id.
pub fn response_to_request(id: u16) -> Option<u16> {
    let base = id & !CMD_FLAG_COMPRESSED;
    REQUEST_RESPONSE_PAIRS
        .iter()
        .find(|(_, resp)| *resp == base)
        .map(|(req, _)| *req)
}

/// True when the flow controller must track `id` (ACK and/or response).
pub fn is_tracked(id: u16) -> bool {
    expected_response(id).is_some() || is_ack_only(id)
}

/// UTF-8 status reason payload trimmed to the frame limit.
pub fn encode_status_reason(reason: &str) -> Vec<u8> {
    let mut payload = reason.as_bytes().to_vec();
    payload.truncate(MAX_PAYLOAD_SIZE);
    payload
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_values_fill_the_range() {
        assert_eq!(Status::Ok.value(), 48);
        assert_eq!(Status::Ack.value(), 56);
        for status in Status::ALL {
            assert!(is_status_id(status.value()));
        }
        assert!(!is_status_id(64));
        assert!(!is_status_id(47));
    }

    #[test]
    fn command_round_trips_through_value() {
        for cmd in [
            Command::GetVersion,
            Command::LinkSync,
            Command::DigitalWrite,
            Command::ConsoleWrite,
            Command::MailboxPush,
            Command::FileReadResp,
            Command::ProcessPollResp,
        ] {
            assert_eq!(Command::from_value(cmd.value()), Some(cmd));
        }
        assert_eq!(Command::from_value(0x0010), None);
        assert_eq!(Command::from_value(200), None);
    }

    #[test]
    fn compressed_flag_is_masked_for_lookup() {
        let flagged = Command::DigitalRead.value() | CMD_FLAG_COMPRESSED;
        assert_eq!(Command::from_value(flagged), Some(Command::DigitalRead));
        assert_eq!(expected_response(flagged), Some(Command::DigitalReadResp.value()));
        assert!(is_tracked(flagged));
    }

    #[test]
    fn ack_only_commands_have_no_response() {
        for id in ACK_ONLY_COMMANDS {
            assert!(is_ack_only(id));
            assert_eq!(expected_response(id), None);
            assert!(is_tracked(id));
        }
    }

    #[test]
    fn response_only_commands_expect_a_response() {
        for id in RESPONSE_ONLY_COMMANDS {
            assert!(is_response_only(id));
            assert!(expected_response(id).is_some());
        }
    }

    #[test]
    fn response_to_request_inverts_the_table() {
        for (req, resp) in REQUEST_RESPONSE_PAIRS {
            assert_eq!(expected_response(req), Some(resp));
            assert_eq!(response_to_request(resp), Some(req));
        }
        assert_eq!(response_to_request(Command::DigitalWrite.value()), None);
    }

    #[test]
    fn untracked_ids_pass_through() {
        assert!(!is_tracked(Command::Xon.value()));
        assert!(!is_tracked(Status::Ack.value()));
    }

    #[test]
    fn status_reason_is_trimmed_to_payload_limit() {
        let reason = "x".repeat(200);
        assert_eq!(encode_status_reason(&reason).len(), MAX_PAYLOAD_SIZE);
        assert_eq!(encode_status_reason("short"), b"short".to_vec());
    }

    #[test]
    fn command_name_covers_all_id_classes() {
        assert_eq!(command_name(Command::LinkSync.value()), "LinkSync");
        assert_eq!(command_name(Status::Timeout.value()), "TIMEOUT");
        assert_eq!(command_name(0x05), "UNKNOWN(0x05)");
    }
}
