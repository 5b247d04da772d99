//! UART transport: port lifecycle, COBS-delimited read loop, frame writes.
//!
//! The port is opened with exponential back-off. A dedicated reader thread
//! accumulates bytes until the zero delimiter, COBS-decodes and parses each
//! block, and hands decoded frames to the async side over a channel. Writes
//! go through [`SerialWriter`], which builds, encodes and flushes one frame
//! per call on the blocking pool.
//!
//! On EOF or a fatal I/O error the reader signals disconnection; the link
//! task tears down, notifies the service and re-enters the connect loop.

use std::io::Read;
use std::sync::{Arc, Mutex as StdMutex};
use std::thread;
use std::time::Duration;

use serialport::SerialPort;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::flow::{FrameSink, SinkFuture};
use crate::protocol::{cobs, frame, FRAME_DELIMITER};
use crate::services::BridgeService;
use crate::state::SharedState;

/// Initial reconnect delay after a failed open.
const CONNECT_BACKOFF_MIN: Duration = Duration::from_secs(1);
/// Cap for the reconnect delay.
const CONNECT_BACKOFF_MAX: Duration = Duration::from_secs(30);
/// Read timeout; bounds the reader thread's shutdown latency.
const READ_TIMEOUT: Duration = Duration::from_millis(250);
/// Reader buffer size; frames are at most ~80 bytes encoded.
const READ_CHUNK: usize = 256;

/// Events delivered from the reader thread to the link task.
#[derive(Debug)]
enum ReaderEvent {
    /// A parsed frame: `(command_id, payload, encoded_len)`.
    Frame(u16, Vec<u8>, usize),
    /// A block that failed COBS decoding.
    DecodeError,
    /// A block that failed frame parsing (CRC, version, length, id).
    FrameError(frame::FrameError),
    /// The port hit EOF or a fatal I/O error.
    Disconnected,
}

/// Frame writer over an open UART.
pub struct SerialWriter {
    port: Arc<StdMutex<Box<dyn SerialPort>>>,
    state: SharedState,
}

impl SerialWriter {
    fn new(port: Box<dyn SerialPort>, state: SharedState) -> Self {
        Self { port: Arc::new(StdMutex::new(port)), state }
    }

    async fn write_frame(&self, command_id: u16, payload: Vec<u8>) -> bool {
        let raw = match frame::build(command_id, &payload) {
            Ok(raw) => raw,
            Err(err) => {
                log::error!("Refusing to send invalid frame 0x{command_id:02X}: {err}");
                return false;
            }
        };
        let mut wire = cobs::encode(&raw);
        wire.push(FRAME_DELIMITER);
        let wire_len = wire.len();

        let port = Arc::clone(&self.port);
        let result = tokio::task::spawn_blocking(move || {
            let mut port = port.lock().expect("serial port lock poisoned");
            use std::io::Write;
            port.write_all(&wire).and_then(|()| port.flush())
        })
        .await;

        match result {
            Ok(Ok(())) => {
                let mut state = self.state.lock().expect("state lock poisoned");
                state.serial_throughput_stats.record_tx(wire_len);
                true
            }
            Ok(Err(err)) => {
                log::error!("Serial write failed for 0x{command_id:02X}: {err}");
                false
            }
            Err(err) => {
                log::error!("Serial write task failed: {err}");
                false
            }
        }
    }
}

impl FrameSink for SerialWriter {
    fn send_frame(&self, command_id: u16, payload: Vec<u8>) -> SinkFuture<'_> {
        Box::pin(self.write_frame(command_id, payload))
    }
}

fn spawn_reader_thread(
    mut port: Box<dyn SerialPort>,
    tx: mpsc::Sender<ReaderEvent>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        log::info!("Serial reader thread started");
        let mut pending = Vec::with_capacity(READ_CHUNK * 2);
        let mut buf = [0u8; READ_CHUNK];

        loop {
            match port.read(&mut buf) {
                Ok(0) => {
                    log::warn!("Serial port EOF");
                    let _ = tx.blocking_send(ReaderEvent::Disconnected);
                    break;
                }
                Ok(n) => {
                    pending.extend_from_slice(&buf[..n]);
                    let mut dispatch_failed = false;
                    while let Some(pos) =
                        pending.iter().position(|&b| b == FRAME_DELIMITER)
                    {
                        let block: Vec<u8> = pending.drain(..=pos).take(pos).collect();
                        if block.is_empty() {
                            continue;
                        }
                        let event = decode_block(&block);
                        if tx.blocking_send(event).is_err() {
                            dispatch_failed = true;
                            break;
                        }
                    }
                    if dispatch_failed {
                        break;
                    }
                }
                Err(err) if err.kind() == std::io::ErrorKind::TimedOut => {
                    if tx.is_closed() {
                        break;
                    }
                }
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => {}
                Err(err) => {
                    log::warn!("Serial read error: {err}");
                    let _ = tx.blocking_send(ReaderEvent::Disconnected);
                    break;
                }
            }
        }
        log::info!("Serial reader thread exiting");
    })
}

fn decode_block(block: &[u8]) -> ReaderEvent {
    let decoded = match cobs::decode(block) {
        Ok(decoded) => decoded,
        Err(err) => {
            log::warn!("Dropping undecodable serial block ({} bytes): {err}", block.len());
            return ReaderEvent::DecodeError;
        }
    };
    match frame::parse(&decoded) {
        // +1 for the delimiter the transport consumed.
        Ok((command_id, payload)) => ReaderEvent::Frame(command_id, payload, block.len() + 1),
        Err(err) => {
            log::warn!("Dropping invalid frame: {err}");
            ReaderEvent::FrameError(err)
        }
    }
}

fn open_port(path: &str, baud: u32) -> serialport::Result<Box<dyn SerialPort>> {
    serialport::new(path, baud).timeout(READ_TIMEOUT).open()
}

/// Serial link supervisor: connect with back-off, run one session, repeat.
pub async fn run_serial_link(service: Arc<BridgeService>, shutdown: CancellationToken) {
    let path = service.config.serial_port.clone();
    let baud = service.config.serial_baud;
    let mut backoff = CONNECT_BACKOFF_MIN;

    while !shutdown.is_cancelled() {
        let open_path = path.clone();
        let opened =
            tokio::task::spawn_blocking(move || open_port(&open_path, baud)).await;

        let port = match opened {
            Ok(Ok(port)) => port,
            Ok(Err(err)) => {
                log::warn!("Failed to open serial port {path}: {err}; retrying in {backoff:?}");
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    () = tokio::time::sleep(backoff) => {}
                }
                backoff = (backoff * 2).min(CONNECT_BACKOFF_MAX);
                continue;
            }
            Err(err) => {
                log::error!("Serial open task failed: {err}");
                break;
            }
        };

        log::info!("Serial port {path} open at {baud} baud");
        backoff = CONNECT_BACKOFF_MIN;

        let reader_port = match port.try_clone() {
            Ok(clone) => clone,
            Err(err) => {
                log::error!("Cannot clone serial port for reading: {err}");
                continue;
            }
        };

        let writer = Arc::new(SerialWriter::new(port, Arc::clone(&service.state)));
        service.flow.set_sender(Some(writer as Arc<dyn FrameSink>));

        let (tx, rx) = mpsc::channel(64);
        let reader = spawn_reader_thread(reader_port, tx);

        run_session(&service, rx, &shutdown).await;

        service.flow.set_sender(None);
        service.on_serial_disconnected().await;
        let _ = tokio::task::spawn_blocking(move || reader.join()).await;

        if service.has_fatal_handshake_failure() {
            log::error!("Fatal handshake failure; shutting down");
            shutdown.cancel();
            break;
        }
    }
    log::info!("Serial link task stopped");
}

/// Pump one connected session until disconnect or shutdown.
async fn run_session(
    service: &Arc<BridgeService>,
    mut rx: mpsc::Receiver<ReaderEvent>,
    shutdown: &CancellationToken,
) {
    // The handshake runs concurrently: it awaits responses that arrive
    // through this very receive loop.
    let connect_task = {
        let service = Arc::clone(service);
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            service.on_serial_connected().await;
            if service.has_fatal_handshake_failure() {
                log::error!("Fatal handshake failure; requesting daemon shutdown");
                shutdown.cancel();
            }
        })
    };

    loop {
        let event = tokio::select! {
            () = shutdown.cancelled() => break,
            event = rx.recv() => event,
        };
        let Some(event) = event else { break };

        match event {
            ReaderEvent::Frame(command_id, payload, encoded_len) => {
                {
                    let mut state = service.state.lock().expect("state lock poisoned");
                    state.serial_throughput_stats.record_rx(encoded_len);
                }
                service.handle_mcu_frame(command_id, payload).await;
            }
            ReaderEvent::DecodeError => {
                let mut state = service.state.lock().expect("state lock poisoned");
                state.serial_decode_errors += 1;
            }
            ReaderEvent::FrameError(err) => {
                let mut state = service.state.lock().expect("state lock poisoned");
                match err {
                    frame::FrameError::CrcMismatch { .. } => state.serial_crc_errors += 1,
                    _ => state.serial_decode_errors += 1,
                }
            }
            ReaderEvent::Disconnected => break,
        }
    }

    connect_task.abort();
    let _ = connect_task.await;
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Command;

    #[test]
    fn decode_block_round_trips_a_frame() {
        let raw = frame::build(Command::ConsoleWrite.value(), b"hi").unwrap();
        let wire = cobs::encode(&raw);
        match decode_block(&wire) {
            ReaderEvent::Frame(cmd, payload, encoded_len) => {
                assert_eq!(cmd, Command::ConsoleWrite.value());
                assert_eq!(payload, b"hi");
                assert_eq!(encoded_len, wire.len() + 1);
            }
            other => panic!("expected Frame, got {other:?}"),
        }
    }

    #[test]
    fn decode_block_reports_cobs_garbage() {
        // 0x05 promises four literals that never arrive.
        assert!(matches!(decode_block(&[0x05, 0x01]), ReaderEvent::DecodeError));
    }

    #[test]
    fn decode_block_reports_crc_mismatch() {
        let mut raw = frame::build(Command::ConsoleWrite.value(), b"hi").unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0xFF;
        let wire = cobs::encode(&raw);
        assert!(matches!(
            decode_block(&wire),
            ReaderEvent::FrameError(frame::FrameError::CrcMismatch { .. })
        ));
    }
}
