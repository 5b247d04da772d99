//! Runtime state owned by the bridge service.
//!
//! One [`RuntimeState`] instance is constructed from the validated
//! configuration and shared behind a mutex. Critical sections are short and
//! never span an await point; anything that blocks (disk spool, UART writes,
//! subprocess waits) happens outside the lock.
//!
//! All counters are monotonic and reset only by process restart.

pub mod queues;

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use serde_json::{json, Value};

use crate::config::Config;
use crate::mqtt::messages::InboundMessage;
use crate::mqtt::spool::SpoolSnapshot;
use crate::policy::{AllowedCommandPolicy, TopicAuthorization};
use crate::protocol::{self, Status};
use queues::BoundedByteDeque;

/// Shared handle to the runtime state.
pub type SharedState = Arc<Mutex<RuntimeState>>;

/// Seconds since the Unix epoch as a float.
pub fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Latency histogram bucket upper bounds in milliseconds.
pub const LATENCY_BUCKETS_MS: [f64; 9] =
    [5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0];

/// Capabilities reported by the MCU after synchronization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct McuCapabilities {
    pub protocol_version: u8,
    pub board_arch: u8,
    pub num_digital_pins: u8,
    pub num_analog_inputs: u8,
    pub features: u32,
}

impl McuCapabilities {
    /// True when the feature bitmask advertises `flag`.
    pub fn has_feature(&self, flag: u32) -> bool {
        self.features & flag != 0
    }
}

/// A pin read accepted by the flow controller and awaiting its response.
#[derive(Debug, Clone)]
pub struct PendingPinRequest {
    pub pin: u8,
    pub reply: Option<InboundMessage>,
}

/// Lifecycle of a managed subprocess.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessLifecycle {
    /// Process is running; pipes are open.
    Running,
    /// Process exited and its pipes are fully drained.
    Finished,
    /// Process was killed or exited; buffered output may remain.
    Zombie,
}

/// Registry entry for one asynchronous subprocess.
#[derive(Debug)]
pub struct ManagedProcess {
    /// User-facing 16-bit pid (distinct from the OS pid).
    pub pid: u16,
    /// Command string as received.
    pub command: String,
    /// OS pid, present while the process may still be signalled.
    pub os_pid: Option<u32>,
    pub stdout_buffer: Vec<u8>,
    pub stderr_buffer: Vec<u8>,
    pub exit_code: Option<i32>,
    pub lifecycle: ProcessLifecycle,
}

impl ManagedProcess {
    pub fn new(pid: u16, command: String, os_pid: Option<u32>) -> Self {
        Self {
            pid,
            command,
            os_pid,
            stdout_buffer: Vec::new(),
            stderr_buffer: Vec::new(),
            exit_code: None,
            lifecycle: ProcessLifecycle::Running,
        }
    }

    /// Append output chunks, keeping only the last `limit` bytes per stream.
    pub fn append_output(&mut self, stdout_chunk: &[u8], stderr_chunk: &[u8], limit: usize) {
        append_with_limit(&mut self.stdout_buffer, stdout_chunk, limit);
        append_with_limit(&mut self.stderr_buffer, stderr_chunk, limit);
    }

    /// Pop up to `budget` bytes, stdout first, then stderr.
    ///
    /// Returns `(stdout_chunk, stderr_chunk, stdout_truncated,
    /// stderr_truncated)`; the truncation flags report bytes left behind.
    pub fn pop_payload(&mut self, budget: usize) -> (Vec<u8>, Vec<u8>, bool, bool) {
        let stdout_len = self.stdout_buffer.len().min(budget);
        let stdout_chunk: Vec<u8> = self.stdout_buffer.drain(..stdout_len).collect();

        let remaining = budget - stdout_chunk.len();
        let stderr_len = self.stderr_buffer.len().min(remaining);
        let stderr_chunk: Vec<u8> = self.stderr_buffer.drain(..stderr_len).collect();

        (
            stdout_chunk,
            stderr_chunk,
            !self.stdout_buffer.is_empty(),
            !self.stderr_buffer.is_empty(),
        )
    }

    /// True when both output buffers are empty.
    pub fn is_drained(&self) -> bool {
        self.stdout_buffer.is_empty() && self.stderr_buffer.is_empty()
    }
}

fn append_with_limit(buffer: &mut Vec<u8>, chunk: &[u8], limit: usize) {
    if chunk.is_empty() {
        return;
    }
    buffer.extend_from_slice(chunk);
    if limit > 0 && buffer.len() > limit {
        let excess = buffer.len() - limit;
        buffer.drain(..excess);
    }
}

/// Byte/frame counters for the serial link.
#[derive(Debug, Default, Clone)]
pub struct SerialThroughputStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub frames_sent: u64,
    pub frames_received: u64,
    pub last_tx_unix: f64,
    pub last_rx_unix: f64,
}

impl SerialThroughputStats {
    pub fn record_tx(&mut self, nbytes: usize) {
        self.bytes_sent += nbytes as u64;
        self.frames_sent += 1;
        self.last_tx_unix = unix_now();
    }

    pub fn record_rx(&mut self, nbytes: usize) {
        self.bytes_received += nbytes as u64;
        self.frames_received += 1;
        self.last_rx_unix = unix_now();
    }

    pub fn as_json(&self) -> Value {
        json!({
            "bytes_sent": self.bytes_sent,
            "bytes_received": self.bytes_received,
            "frames_sent": self.frames_sent,
            "frames_received": self.frames_received,
            "last_tx_unix": self.last_tx_unix,
            "last_rx_unix": self.last_rx_unix,
        })
    }
}

/// Command round-trip latency histogram.
#[derive(Debug, Clone)]
pub struct SerialLatencyStats {
    bucket_counts: [u64; LATENCY_BUCKETS_MS.len()],
    pub overflow_count: u64,
    pub total_observations: u64,
    pub total_latency_ms: f64,
    pub min_latency_ms: f64,
    pub max_latency_ms: f64,
}

impl Default for SerialLatencyStats {
    fn default() -> Self {
        Self {
            bucket_counts: [0; LATENCY_BUCKETS_MS.len()],
            overflow_count: 0,
            total_observations: 0,
            total_latency_ms: 0.0,
            min_latency_ms: f64::INFINITY,
            max_latency_ms: 0.0,
        }
    }
}

impl SerialLatencyStats {
    pub fn record(&mut self, latency_ms: f64) {
        match LATENCY_BUCKETS_MS.iter().position(|&b| latency_ms <= b) {
            Some(idx) => self.bucket_counts[idx] += 1,
            None => self.overflow_count += 1,
        }
        self.total_observations += 1;
        self.total_latency_ms += latency_ms;
        self.min_latency_ms = self.min_latency_ms.min(latency_ms);
        self.max_latency_ms = self.max_latency_ms.max(latency_ms);
    }

    pub fn as_json(&self) -> Value {
        let avg = if self.total_observations > 0 {
            self.total_latency_ms / self.total_observations as f64
        } else {
            0.0
        };
        let buckets: serde_json::Map<String, Value> = LATENCY_BUCKETS_MS
            .iter()
            .zip(self.bucket_counts.iter())
            .map(|(bound, count)| (format!("le_{}ms", *bound as u64), json!(count)))
            .collect();
        json!({
            "buckets": buckets,
            "overflow": self.overflow_count,
            "count": self.total_observations,
            "sum_ms": self.total_latency_ms,
            "avg_ms": avg,
            "min_ms": if self.total_observations > 0 { self.min_latency_ms } else { 0.0 },
            "max_ms": self.max_latency_ms,
        })
    }
}

/// Flow controller event counters.
#[derive(Debug, Default, Clone)]
pub struct SerialFlowStats {
    pub commands_sent: u64,
    pub commands_acked: u64,
    pub retries: u64,
    pub failures: u64,
    pub last_event_unix: f64,
}

impl SerialFlowStats {
    pub fn as_json(&self) -> Value {
        json!({
            "commands_sent": self.commands_sent,
            "commands_acked": self.commands_acked,
            "retries": self.retries,
            "failures": self.failures,
            "last_event_unix": self.last_event_unix,
        })
    }
}

/// Aggregate mutable state owned by the bridge service.
#[derive(Debug, Default)]
pub struct RuntimeState {
    // Serial link
    pub serial_link_connected: bool,
    pub serial_decode_errors: u64,
    pub serial_crc_errors: u64,
    pub serial_ack_timeout_ms: u16,
    pub serial_response_timeout_ms: u32,
    pub serial_retry_limit: u8,
    pub serial_flow_stats: SerialFlowStats,
    pub serial_throughput_stats: SerialThroughputStats,
    pub serial_latency_stats: SerialLatencyStats,
    pub serial_pipeline_inflight: Option<Value>,
    pub serial_pipeline_last: Option<Value>,

    // MQTT pipeline
    pub mqtt_topic_prefix: String,
    pub mqtt_queue_limit: usize,
    pub mqtt_dropped_messages: u64,
    pub mqtt_drop_counts: HashMap<String, u64>,
    pub mqtt_spooled_messages: u64,
    pub mqtt_spooled_replayed: u64,
    pub mqtt_spool_errors: u64,
    pub mqtt_spool_degraded: bool,
    pub mqtt_spool_failure_reason: Option<String>,
    pub mqtt_spool_snapshot: SpoolSnapshot,

    // Console
    pub mcu_is_paused: bool,
    pub console_to_mcu_queue: BoundedByteDeque,
    pub console_queue_limit_bytes: usize,
    pub console_dropped_chunks: u64,
    pub console_truncated_chunks: u64,
    pub console_truncated_bytes: u64,
    pub console_dropped_bytes: u64,

    // Datastore
    pub datastore: HashMap<String, String>,

    // Mailbox
    pub mailbox_queue: BoundedByteDeque,
    pub mailbox_incoming_queue: BoundedByteDeque,
    pub mailbox_queue_limit: usize,
    pub mailbox_queue_bytes_limit: usize,
    pub mailbox_dropped_messages: u64,
    pub mailbox_truncated_messages: u64,
    pub mailbox_truncated_bytes: u64,
    pub mailbox_dropped_bytes: u64,
    pub mailbox_outgoing_overflow_events: u64,
    pub mailbox_incoming_dropped_messages: u64,
    pub mailbox_incoming_truncated_messages: u64,
    pub mailbox_incoming_truncated_bytes: u64,
    pub mailbox_incoming_dropped_bytes: u64,
    pub mailbox_incoming_overflow_events: u64,

    // Pins
    pub pending_digital_reads: VecDeque<PendingPinRequest>,
    pub pending_analog_reads: VecDeque<PendingPinRequest>,
    pub pending_pin_request_limit: usize,

    // Processes
    pub running_processes: HashMap<u16, ManagedProcess>,
    pub next_pid: u16,
    pub process_timeout: u64,
    pub process_output_limit: usize,
    pub process_max_concurrent: usize,

    // Files
    pub file_system_root: String,
    pub allow_non_tmp_paths: bool,
    pub file_write_max_bytes: usize,
    pub file_storage_quota_bytes: usize,
    pub file_storage_bytes_used: usize,
    pub file_write_limit_rejections: u64,
    pub file_storage_limit_rejections: u64,

    // Policy
    pub allowed_policy: AllowedCommandPolicy,
    pub topic_authorization: TopicAuthorization,

    // MCU identity
    pub mcu_version: Option<(u8, u8)>,
    pub mcu_capabilities: Option<McuCapabilities>,
    pub mcu_status_counters: HashMap<String, u64>,

    // Handshake / link
    pub link_is_synchronized: bool,
    pub link_handshake_nonce: Option<Vec<u8>>,
    pub link_expected_tag: Option<Vec<u8>>,
    pub link_nonce_counter: u64,
    pub link_last_nonce_counter: u64,
    pub handshake_attempts: u64,
    pub handshake_successes: u64,
    pub handshake_failures: u64,
    pub handshake_failure_streak: u32,
    pub handshake_backoff_until: Option<Instant>,
    pub handshake_rate_limit_until: Option<Instant>,
    pub last_handshake_error: Option<String>,
    pub last_handshake_unix: f64,
    pub handshake_last_started: Option<Instant>,
    pub handshake_last_duration: f64,
    pub handshake_fatal_count: u64,
    pub handshake_fatal_reason: Option<String>,
    pub handshake_fatal_detail: Option<String>,
    pub handshake_fatal_unix: f64,
}

impl RuntimeState {
    /// Build the state from a validated configuration.
    pub fn from_config(config: &Config) -> Self {
        let mut state = Self { next_pid: 1, ..Self::default() };
        state.configure(config);
        state
    }

    /// Apply configuration-derived limits and policies.
    pub fn configure(&mut self, config: &Config) {
        self.mqtt_topic_prefix = config.mqtt_topic.clone();
        self.mqtt_queue_limit = config.mqtt_queue_limit;
        self.console_queue_limit_bytes = config.console_queue_limit_bytes;
        self.mailbox_queue_limit = config.mailbox_queue_limit;
        self.mailbox_queue_bytes_limit = config.mailbox_queue_bytes_limit;
        self.pending_pin_request_limit = config.pending_pin_request_limit;
        self.process_timeout = config.process_timeout;
        self.process_output_limit = config.process_max_output_bytes;
        self.process_max_concurrent = config.process_max_concurrent;
        self.file_system_root = config.file_system_root.clone();
        self.allow_non_tmp_paths = config.allow_non_tmp_paths;
        self.file_write_max_bytes = config.file_write_max_bytes;
        self.file_storage_quota_bytes = config.file_storage_quota_bytes;
        self.allowed_policy = AllowedCommandPolicy::from_entries(&config.allowed_commands);
        self.topic_authorization = config.topic_authorization.clone();

        self.console_to_mcu_queue =
            BoundedByteDeque::new(None, Some(self.console_queue_limit_bytes));
        self.mailbox_queue = BoundedByteDeque::new(
            Some(self.mailbox_queue_limit),
            Some(self.mailbox_queue_bytes_limit),
        );
        self.mailbox_incoming_queue = BoundedByteDeque::new(
            Some(self.mailbox_queue_limit),
            Some(self.mailbox_queue_bytes_limit),
        );
        if self.next_pid == 0 {
            self.next_pid = 1;
        }
    }

    // ── Console queue ─────────────────────────────────────────────────────

    /// Queue a console chunk for later delivery to the MCU.
    pub fn enqueue_console_chunk(&mut self, chunk: &[u8]) {
        if chunk.is_empty() {
            return;
        }
        let evt = self.console_to_mcu_queue.append(chunk);
        if evt.truncated_bytes > 0 {
            log::warn!(
                "Console chunk truncated by {} byte(s) to respect limit.",
                evt.truncated_bytes
            );
            self.console_truncated_chunks += 1;
            self.console_truncated_bytes += evt.truncated_bytes as u64;
        }
        if evt.dropped_chunks > 0 {
            log::warn!(
                "Dropping oldest console chunk(s): {} item(s), {} bytes to respect limit.",
                evt.dropped_chunks,
                evt.dropped_bytes
            );
            self.console_dropped_chunks += evt.dropped_chunks as u64;
            self.console_dropped_bytes += evt.dropped_bytes as u64;
        }
        if !evt.accepted {
            log::error!("Console queue overflow; rejected chunk of {} bytes.", chunk.len());
            self.console_dropped_chunks += 1;
            self.console_dropped_bytes += chunk.len() as u64;
        }
    }

    /// Pop the oldest queued console chunk.
    pub fn pop_console_chunk(&mut self) -> Option<Vec<u8>> {
        self.console_to_mcu_queue.pop_front()
    }

    /// Requeue an unsent console chunk at the front.
    pub fn requeue_console_chunk_front(&mut self, chunk: &[u8]) {
        if chunk.is_empty() {
            return;
        }
        let evt = self.console_to_mcu_queue.append_front(chunk);
        if evt.truncated_bytes > 0 {
            self.console_truncated_chunks += 1;
            self.console_truncated_bytes += evt.truncated_bytes as u64;
        }
        if evt.dropped_chunks > 0 {
            self.console_dropped_chunks += evt.dropped_chunks as u64;
            self.console_dropped_bytes += evt.dropped_bytes as u64;
        }
    }

    // ── Mailbox queues ────────────────────────────────────────────────────

    /// Queue a Linux→MCU mailbox message. Returns false on rejection.
    pub fn enqueue_mailbox_message(&mut self, payload: &[u8]) -> bool {
        let evt = self.mailbox_queue.append(payload);
        if evt.truncated_bytes > 0 {
            log::warn!(
                "Mailbox message truncated by {} bytes to respect limit.",
                evt.truncated_bytes
            );
            self.mailbox_truncated_messages += 1;
            self.mailbox_truncated_bytes += evt.truncated_bytes as u64;
        }
        if evt.dropped_chunks > 0 {
            log::warn!(
                "Dropping oldest mailbox message(s): {} item(s), {} bytes to honor limits.",
                evt.dropped_chunks,
                evt.dropped_bytes
            );
            self.mailbox_dropped_messages += evt.dropped_chunks as u64;
            self.mailbox_dropped_bytes += evt.dropped_bytes as u64;
        }
        if !evt.accepted {
            log::error!("Mailbox queue overflow; rejecting message ({} bytes).", payload.len());
            self.mailbox_dropped_messages += 1;
            self.mailbox_dropped_bytes += payload.len() as u64;
            self.mailbox_outgoing_overflow_events += 1;
            return false;
        }
        true
    }

    /// Pop the oldest Linux→MCU mailbox message.
    pub fn pop_mailbox_message(&mut self) -> Option<Vec<u8>> {
        self.mailbox_queue.pop_front()
    }

    /// Requeue an undelivered mailbox message at the front.
    pub fn requeue_mailbox_message_front(&mut self, payload: &[u8]) {
        let evt = self.mailbox_queue.append_front(payload);
        if evt.dropped_chunks > 0 {
            self.mailbox_dropped_messages += evt.dropped_chunks as u64;
            self.mailbox_dropped_bytes += evt.dropped_bytes as u64;
        }
    }

    /// Queue an MCU→Linux mailbox message. Returns false on rejection.
    pub fn enqueue_mailbox_incoming(&mut self, payload: &[u8]) -> bool {
        let evt = self.mailbox_incoming_queue.append(payload);
        if evt.truncated_bytes > 0 {
            log::warn!(
                "Mailbox incoming message truncated by {} bytes to respect limit.",
                evt.truncated_bytes
            );
            self.mailbox_incoming_truncated_messages += 1;
            self.mailbox_incoming_truncated_bytes += evt.truncated_bytes as u64;
        }
        if evt.dropped_chunks > 0 {
            log::warn!(
                "Dropping oldest mailbox incoming message(s): {} item(s), {} bytes to honor limits.",
                evt.dropped_chunks,
                evt.dropped_bytes
            );
            self.mailbox_incoming_dropped_messages += evt.dropped_chunks as u64;
            self.mailbox_incoming_dropped_bytes += evt.dropped_bytes as u64;
        }
        if !evt.accepted {
            log::error!(
                "Mailbox incoming queue overflow; rejecting message ({} bytes).",
                payload.len()
            );
            self.mailbox_incoming_dropped_messages += 1;
            self.mailbox_incoming_dropped_bytes += payload.len() as u64;
            self.mailbox_incoming_overflow_events += 1;
            return false;
        }
        true
    }

    /// Pop the oldest MCU→Linux mailbox message.
    pub fn pop_mailbox_incoming(&mut self) -> Option<Vec<u8>> {
        self.mailbox_incoming_queue.pop_front()
    }

    // ── Counters ──────────────────────────────────────────────────────────

    /// Count a dropped MQTT publish by topic.
    pub fn record_mqtt_drop(&mut self, topic: &str) {
        self.mqtt_dropped_messages += 1;
        *self.mqtt_drop_counts.entry(topic.to_string()).or_insert(0) += 1;
    }

    /// Count an MCU status frame by symbolic name.
    pub fn record_mcu_status(&mut self, status: Status) {
        *self.mcu_status_counters.entry(status.name().to_string()).or_insert(0) += 1;
    }

    /// Flow controller metric hook ("sent", "ack", "retry", "failure").
    pub fn record_serial_flow_event(&mut self, event: &str) {
        match event {
            "sent" => self.serial_flow_stats.commands_sent += 1,
            "ack" => self.serial_flow_stats.commands_acked += 1,
            "retry" => self.serial_flow_stats.retries += 1,
            "failure" => self.serial_flow_stats.failures += 1,
            other => log::debug!("Unknown serial flow event '{other}'"),
        }
        self.serial_flow_stats.last_event_unix = unix_now();
    }

    /// Flow controller pipeline transition hook.
    pub fn record_serial_pipeline_event(&mut self, event: Value) {
        let kind = event.get("event").and_then(Value::as_str).unwrap_or("");
        match kind {
            "start" | "ack" => self.serial_pipeline_inflight = Some(event),
            _ => {
                self.serial_pipeline_inflight = None;
                self.serial_pipeline_last = Some(event);
            }
        }
    }

    // ── Handshake accounting ──────────────────────────────────────────────

    pub fn record_handshake_attempt(&mut self) {
        self.handshake_attempts += 1;
        self.handshake_last_started = Some(Instant::now());
    }

    pub fn record_handshake_success(&mut self) {
        self.handshake_successes += 1;
        self.handshake_failure_streak = 0;
        self.last_handshake_error = None;
        self.last_handshake_unix = unix_now();
        self.handshake_last_duration = self
            .handshake_last_started
            .map(|start| start.elapsed().as_secs_f64())
            .unwrap_or(0.0);
    }

    pub fn record_handshake_failure(&mut self, reason: &str) {
        self.handshake_failures += 1;
        self.handshake_failure_streak += 1;
        self.last_handshake_error = Some(reason.to_string());
        self.last_handshake_unix = unix_now();
        self.handshake_last_duration = self
            .handshake_last_started
            .map(|start| start.elapsed().as_secs_f64())
            .unwrap_or(0.0);
    }

    pub fn record_handshake_fatal(&mut self, reason: &str, detail: Option<&str>) {
        self.handshake_fatal_count += 1;
        self.handshake_fatal_reason = Some(reason.to_string());
        self.handshake_fatal_detail = detail.map(str::to_string);
        self.handshake_fatal_unix = unix_now();
    }

    /// Remaining handshake backoff in seconds.
    pub fn handshake_backoff_remaining(&self) -> f64 {
        self.handshake_backoff_until
            .map(|until| until.saturating_duration_since(Instant::now()).as_secs_f64())
            .unwrap_or(0.0)
    }

    // ── Snapshots ─────────────────────────────────────────────────────────

    /// Spool bookkeeping refresh after a spool operation.
    pub fn update_spool_snapshot(&mut self, snapshot: SpoolSnapshot) {
        self.mqtt_spool_degraded = snapshot.fallback_active;
        self.mqtt_spool_snapshot = snapshot;
    }

    /// Handshake-flavored bridge snapshot document.
    pub fn build_handshake_snapshot(&self) -> Value {
        json!({
            "synchronized": self.link_is_synchronized,
            "attempts": self.handshake_attempts,
            "successes": self.handshake_successes,
            "failures": self.handshake_failures,
            "failure_streak": self.handshake_failure_streak,
            "backoff_remaining_seconds": self.handshake_backoff_remaining(),
            "last_error": self.last_handshake_error,
            "last_unix": self.last_handshake_unix,
            "last_duration_seconds": self.handshake_last_duration,
            "fatal_count": self.handshake_fatal_count,
            "fatal_reason": self.handshake_fatal_reason,
            "fatal_detail": self.handshake_fatal_detail,
            "fatal_unix": self.handshake_fatal_unix,
            "nonce_counter": self.link_nonce_counter,
            "last_accepted_nonce_counter": self.link_last_nonce_counter,
        })
    }

    /// Summary-flavored bridge snapshot document.
    pub fn build_bridge_snapshot(&self) -> Value {
        json!({
            "serial": {
                "connected": self.serial_link_connected,
                "synchronized": self.link_is_synchronized,
                "decode_errors": self.serial_decode_errors,
                "crc_errors": self.serial_crc_errors,
                "ack_timeout_ms": self.serial_ack_timeout_ms,
                "response_timeout_ms": self.serial_response_timeout_ms,
                "retry_limit": self.serial_retry_limit,
                "flow": self.serial_flow_stats.as_json(),
                "throughput": self.serial_throughput_stats.as_json(),
                "latency": self.serial_latency_stats.as_json(),
                "pipeline_inflight": self.serial_pipeline_inflight,
                "pipeline_last": self.serial_pipeline_last,
            },
            "mqtt": {
                "queue_limit": self.mqtt_queue_limit,
                "dropped_messages": self.mqtt_dropped_messages,
                "drop_counts": self.mqtt_drop_counts,
                "spooled_messages": self.mqtt_spooled_messages,
                "spooled_replayed": self.mqtt_spooled_replayed,
                "spool_errors": self.mqtt_spool_errors,
                "spool": self.mqtt_spool_snapshot.as_json(),
            },
            "console": {
                "paused": self.mcu_is_paused,
                "queued_bytes": self.console_to_mcu_queue.bytes_used(),
                "dropped_chunks": self.console_dropped_chunks,
                "truncated_chunks": self.console_truncated_chunks,
            },
            "mailbox": {
                "outgoing_depth": self.mailbox_queue.len(),
                "incoming_depth": self.mailbox_incoming_queue.len(),
                "dropped": self.mailbox_dropped_messages,
                "incoming_dropped": self.mailbox_incoming_dropped_messages,
                "outgoing_overflow_events": self.mailbox_outgoing_overflow_events,
                "incoming_overflow_events": self.mailbox_incoming_overflow_events,
            },
            "pins": {
                "pending_digital": self.pending_digital_reads.len(),
                "pending_analog": self.pending_analog_reads.len(),
                "limit": self.pending_pin_request_limit,
            },
            "processes": {
                "running": self.running_processes.len(),
                "max_concurrent": self.process_max_concurrent,
            },
            "files": {
                "bytes_used": self.file_storage_bytes_used,
                "quota_bytes": self.file_storage_quota_bytes,
                "write_limit_rejections": self.file_write_limit_rejections,
                "quota_rejections": self.file_storage_limit_rejections,
            },
            "mcu": {
                "version": self.mcu_version.map(|(major, minor)| format!("{major}.{minor}")),
                "capabilities": self.mcu_capabilities.map(|caps| json!({
                    "protocol_version": caps.protocol_version,
                    "board_arch": caps.board_arch,
                    "num_digital_pins": caps.num_digital_pins,
                    "num_analog_inputs": caps.num_analog_inputs,
                    "features": caps.features,
                })),
                "status_counters": self.mcu_status_counters,
            },
            "handshake": self.build_handshake_snapshot(),
        })
    }

    /// Allocate the next free user-facing pid, skipping 0 and 0xFFFF.
    pub fn allocate_pid(&mut self) -> Option<u16> {
        for _ in 0..=u16::MAX {
            let candidate = self.next_pid;
            self.next_pid = self.next_pid.wrapping_add(1);
            if self.next_pid == protocol::INVALID_ID_SENTINEL {
                self.next_pid = 1;
            }
            if self.next_pid == 0 {
                self.next_pid = 1;
            }
            if candidate == 0 || candidate == protocol::INVALID_ID_SENTINEL {
                continue;
            }
            if !self.running_processes.contains_key(&candidate) {
                return Some(candidate);
            }
        }
        log::error!("No async process slots available; all PIDs in use");
        None
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        let mut config = Config::default();
        config.serial_shared_secret = "unit-test-secret".into();
        config.mailbox_queue_limit = 4;
        config.mailbox_queue_bytes_limit = 64;
        config.console_queue_limit_bytes = 32;
        config
    }

    #[test]
    fn configure_applies_queue_limits() {
        let state = RuntimeState::from_config(&test_config());
        assert_eq!(state.mailbox_queue_limit, 4);
        assert_eq!(state.console_to_mcu_queue.limit_bytes(), Some(32));
        assert_eq!(state.next_pid, 1);
    }

    #[test]
    fn console_queue_counters_track_drops() {
        let mut state = RuntimeState::from_config(&test_config());
        state.enqueue_console_chunk(&[1u8; 32]);
        state.enqueue_console_chunk(&[2u8; 32]);
        assert_eq!(state.console_dropped_chunks, 1);
        assert_eq!(state.console_dropped_bytes, 32);
        assert_eq!(state.pop_console_chunk().unwrap(), vec![2u8; 32]);
    }

    #[test]
    fn mailbox_rejection_counts_overflow_event() {
        let mut state = RuntimeState::from_config(&test_config());
        // A zero-capacity queue rejects instead of evicting.
        state.mailbox_queue = BoundedByteDeque::new(Some(0), Some(64));
        assert!(!state.enqueue_mailbox_message(b"hello"));
        assert_eq!(state.mailbox_outgoing_overflow_events, 1);
    }

    #[test]
    fn managed_process_output_keeps_tail() {
        let mut slot = ManagedProcess::new(1, "echo".into(), None);
        slot.append_output(b"0123456789", b"", 4);
        assert_eq!(slot.stdout_buffer, b"6789");
    }

    #[test]
    fn managed_process_pop_payload_budget() {
        let mut slot = ManagedProcess::new(1, "echo".into(), None);
        slot.append_output(b"outoutout", b"errerr", 1024);
        let (out, err, out_trunc, err_trunc) = slot.pop_payload(10);
        assert_eq!(out, b"outoutout");
        assert_eq!(err, b"e");
        assert!(!out_trunc);
        assert!(err_trunc);
        let (out2, err2, _, _) = slot.pop_payload(64);
        assert!(out2.is_empty());
        assert_eq!(err2, b"rrerr");
        assert!(slot.is_drained());
    }

    #[test]
    fn latency_histogram_buckets() {
        let mut stats = SerialLatencyStats::default();
        stats.record(3.0);
        stats.record(80.0);
        stats.record(9000.0);
        assert_eq!(stats.total_observations, 3);
        assert_eq!(stats.overflow_count, 1);
        let snapshot = stats.as_json();
        assert_eq!(snapshot["count"], 3);
        assert_eq!(snapshot["buckets"]["le_5ms"], 1);
        assert_eq!(snapshot["buckets"]["le_100ms"], 1);
    }

    #[test]
    fn handshake_counters_follow_lifecycle() {
        let mut state = RuntimeState::from_config(&test_config());
        state.record_handshake_attempt();
        state.record_handshake_failure("link_sync_timeout");
        assert_eq!(state.handshake_failure_streak, 1);
        state.record_handshake_attempt();
        state.record_handshake_success();
        assert_eq!(state.handshake_failure_streak, 0);
        assert_eq!(state.handshake_successes, 1);
        assert!(state.last_handshake_error.is_none());
    }

    #[test]
    fn pid_allocation_skips_sentinels_and_in_use() {
        let mut state = RuntimeState::from_config(&test_config());
        let first = state.allocate_pid().unwrap();
        assert_eq!(first, 1);
        state
            .running_processes
            .insert(2, ManagedProcess::new(2, "x".into(), None));
        assert_eq!(state.allocate_pid().unwrap(), 3);

        state.next_pid = protocol::INVALID_ID_SENTINEL;
        let pid = state.allocate_pid().unwrap();
        assert_ne!(pid, 0);
        assert_ne!(pid, protocol::INVALID_ID_SENTINEL);
    }

    #[test]
    fn drop_counters_accumulate_per_topic() {
        let mut state = RuntimeState::from_config(&test_config());
        state.record_mqtt_drop("br/console/out");
        state.record_mqtt_drop("br/console/out");
        state.record_mqtt_drop("br/system/status");
        assert_eq!(state.mqtt_dropped_messages, 3);
        assert_eq!(state.mqtt_drop_counts["br/console/out"], 2);
    }

    #[test]
    fn snapshots_render_without_panic() {
        let mut state = RuntimeState::from_config(&test_config());
        state.record_mcu_status(Status::Ok);
        state.mcu_version = Some((2, 3));
        let snapshot = state.build_bridge_snapshot();
        assert_eq!(snapshot["mcu"]["version"], "2.3");
        assert_eq!(snapshot["handshake"]["synchronized"], false);
    }

    #[test]
    fn capability_feature_flags() {
        let caps = McuCapabilities {
            protocol_version: 2,
            board_arch: 1,
            num_digital_pins: 20,
            num_analog_inputs: 6,
            features: protocol::CAPABILITY_RLE | protocol::CAPABILITY_WATCHDOG,
        };
        assert!(caps.has_feature(protocol::CAPABILITY_RLE));
        assert!(caps.has_feature(protocol::CAPABILITY_WATCHDOG));
        assert!(!caps.has_feature(protocol::CAPABILITY_I2C));
    }
}
