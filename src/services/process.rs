//! Managed subprocess execution.
//!
//! Commands arrive as strings, are tokenized with POSIX-like word splitting
//! and validated against the allow-list, then spawned directly (`execve`
//! semantics, no shell). A semaphore caps concurrency; user-facing pids come
//! from a monotonic 16-bit space with `0x0000`/`0xFFFF` reserved.
//!
//! Synchronous runs collect both streams until exit or `process_timeout`;
//! on timeout the whole process tree is killed (children discovered via
//! `/proc`). Asynchronous runs register in the process table; a monitor
//! task drains the pipes into bounded tail buffers that `PROCESS_POLL`
//! consumes in frame-sized batches.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::Result;
use tokio::io::AsyncReadExt;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use super::{BridgeContext, EXPIRY_SHELL};
use crate::mqtt::messages::QueuedPublish;
use crate::policy::{tokenize_shell_command, CommandValidationError};
use crate::protocol::{
    self, encode_status_reason, topics, Command, Status, MAX_PAYLOAD_SIZE,
    PROCESS_DEFAULT_EXIT_CODE,
};
use crate::state::{ManagedProcess, ProcessLifecycle};

/// Poll batches leave room for `status ‖ exit ‖ 2×len:u16` framing.
const POLL_BUDGET: usize = MAX_PAYLOAD_SIZE - 6;
/// Grace period between SIGTERM and SIGKILL on a tree kill.
const KILL_WAIT: Duration = Duration::from_millis(500);
/// Wait for a process to reap after a timeout kill.
const SYNC_KILL_WAIT: Duration = Duration::from_secs(2);

/// Outcome of a synchronous run.
pub struct SyncRunResult {
    pub status: u8,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: Option<i32>,
}

/// One poll batch drawn from a managed process.
pub struct PollBatch {
    pub status: u8,
    pub exit_code: u8,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    pub finished: bool,
}

pub struct ProcessComponent {
    ctx: BridgeContext,
    slots: Arc<Semaphore>,
    /// Concurrency permits held on behalf of registered processes; shared
    /// with the monitor tasks that release them.
    permits: Arc<StdMutex<HashMap<u16, OwnedSemaphorePermit>>>,
}

impl ProcessComponent {
    pub fn new(ctx: BridgeContext) -> Self {
        let limit = ctx.config.process_max_concurrent.max(1);
        Self {
            ctx,
            slots: Arc::new(Semaphore::new(limit)),
            permits: Arc::new(StdMutex::new(HashMap::new())),
        }
    }

    fn prepare_command(&self, payload: &[u8]) -> Result<(String, Vec<String>), CommandValidationError> {
        let command = String::from_utf8_lossy(payload).into_owned();
        let tokens = tokenize_shell_command(&command)?;
        let allowed = {
            let state = self.ctx.state.lock().expect("state lock poisoned");
            state.allowed_policy.is_allowed(&tokens[0])
        };
        if !allowed {
            return Err(CommandValidationError::NotAllowed(tokens[0].clone()));
        }
        Ok((command, tokens))
    }

    // ── MCU handlers ──────────────────────────────────────────────────────

    /// `CMD_PROCESS_RUN`: synchronous execution, response frame on exit.
    pub async fn handle_run(&self, payload: &[u8]) -> Result<bool> {
        let (command, tokens) = match self.prepare_command(payload) {
            Ok(prepared) => prepared,
            Err(CommandValidationError::NotAllowed(cmd)) => {
                log::warn!("Rejected sync command: '{cmd}' not allowed");
                self.ctx
                    .send_frame(
                        Status::Error.value(),
                        encode_status_reason(protocol::STATUS_REASON_COMMAND_VALIDATION_FAILED),
                    )
                    .await;
                return Ok(false);
            }
            Err(err) => {
                log::warn!("Malformed PROCESS_RUN payload: {err}");
                self.ctx
                    .send_frame(
                        Status::Malformed.value(),
                        encode_status_reason(protocol::STATUS_REASON_COMMAND_VALIDATION_FAILED),
                    )
                    .await;
                return Ok(false);
            }
        };

        let Ok(permit) = Arc::clone(&self.slots).try_acquire_owned() else {
            log::warn!(
                "Concurrent process limit reached ({}) for sync command",
                self.ctx.config.process_max_concurrent
            );
            self.ctx
                .send_frame(
                    Status::Error.value(),
                    encode_status_reason(protocol::STATUS_REASON_PROCESS_LIMIT_REACHED),
                )
                .await;
            return Ok(false);
        };

        let ctx = self.ctx.clone();
        let timeout = self.process_timeout();
        let output_limit = self.output_limit();
        tokio::spawn(async move {
            let _permit = permit;
            let result = run_sync_command(&tokens, timeout, output_limit).await;
            let response = build_run_response(&result);
            ctx.send_frame(Command::ProcessRunResp.value(), response).await;
            log::debug!(
                "Sent PROCESS_RUN_RESP status={} exit={:?} for '{command}'",
                result.status,
                result.exit_code
            );
        });
        Ok(true)
    }

    /// `CMD_PROCESS_RUN_ASYNC`: spawn, register, reply with the pid.
    pub async fn handle_run_async(&self, payload: &[u8]) -> Result<bool> {
        let (command, tokens) = match self.prepare_command(payload) {
            Ok(prepared) => prepared,
            Err(CommandValidationError::NotAllowed(cmd)) => {
                log::warn!("Rejected async command: '{cmd}' not allowed");
                self.ctx
                    .send_frame(
                        Status::Error.value(),
                        encode_status_reason(protocol::STATUS_REASON_COMMAND_VALIDATION_FAILED),
                    )
                    .await;
                self.publish_run_async_error(protocol::STATUS_REASON_COMMAND_VALIDATION_FAILED)
                    .await;
                return Ok(false);
            }
            Err(err) => {
                log::warn!("Malformed PROCESS_RUN_ASYNC payload: {err}");
                self.ctx
                    .send_frame(
                        Status::Malformed.value(),
                        encode_status_reason(protocol::STATUS_REASON_COMMAND_VALIDATION_FAILED),
                    )
                    .await;
                return Ok(false);
            }
        };

        match self.start_async(&command, &tokens).await {
            Some(pid) => {
                self.ctx
                    .send_frame(Command::ProcessRunAsyncResp.value(), pid.to_be_bytes().to_vec())
                    .await;
                let topic = topics::topic_path(
                    &self.ctx.config.mqtt_topic,
                    topics::Topic::Shell,
                    &["run_async", topics::SUFFIX_RESPONSE],
                );
                self.ctx
                    .enqueue_mqtt(QueuedPublish::new(topic, pid.to_string().into_bytes()), None)
                    .await;
                Ok(true)
            }
            None => {
                self.ctx
                    .send_frame(
                        Status::Error.value(),
                        encode_status_reason(protocol::STATUS_REASON_PROCESS_RUN_ASYNC_FAILED),
                    )
                    .await;
                self.publish_run_async_error(protocol::STATUS_REASON_PROCESS_RUN_ASYNC_FAILED)
                    .await;
                Ok(false)
            }
        }
    }

    /// `CMD_PROCESS_POLL` payload: `pid:u16`.
    pub async fn handle_poll(&self, payload: &[u8]) -> Result<bool> {
        if payload.len() < 2 {
            log::warn!("Invalid PROCESS_POLL payload ({} bytes)", payload.len());
            let error = PollBatch {
                status: Status::Malformed.value() as u8,
                exit_code: PROCESS_DEFAULT_EXIT_CODE,
                stdout: Vec::new(),
                stderr: Vec::new(),
                stdout_truncated: false,
                stderr_truncated: false,
                finished: false,
            };
            self.ctx
                .send_frame(Command::ProcessPollResp.value(), build_poll_response(&error))
                .await;
            return Ok(false);
        }
        let pid = u16::from_be_bytes([payload[0], payload[1]]);

        let batch = self.collect_output(pid);
        self.ctx
            .send_frame(Command::ProcessPollResp.value(), build_poll_response(&batch))
            .await;
        self.publish_poll_result(pid, &batch).await;
        if batch.finished {
            log::debug!("Sent final output for finished process PID {pid}");
        }
        Ok(true)
    }

    /// `CMD_PROCESS_KILL` payload: exactly `pid:u16`.
    pub async fn handle_kill(&self, payload: &[u8]) -> Result<bool> {
        if payload.len() != 2 {
            log::warn!(
                "Invalid PROCESS_KILL payload. Expected 2 bytes, got {}.",
                payload.len()
            );
            self.ctx
                .send_frame(
                    Status::Malformed.value(),
                    encode_status_reason(protocol::STATUS_REASON_PROCESS_KILL_MALFORMED),
                )
                .await;
            return Ok(false);
        }
        let pid = u16::from_be_bytes([payload[0], payload[1]]);

        if !self.kill_by_pid(pid).await {
            self.ctx
                .send_frame(
                    Status::Error.value(),
                    encode_status_reason(protocol::STATUS_REASON_PROCESS_NOT_FOUND),
                )
                .await;
            return Ok(true);
        }
        self.ctx.send_frame(Status::Ok.value(), Vec::new()).await;
        Ok(true)
    }

    // ── Execution engine (shared with the MQTT shell endpoints) ───────────

    /// Synchronous run honoring the timeout and output limit.
    pub async fn run_sync(&self, tokens: &[String]) -> SyncRunResult {
        run_sync_command(tokens, self.process_timeout(), self.output_limit()).await
    }

    /// Validate and tokenize an MQTT-supplied command.
    pub fn validate_command(&self, payload: &[u8]) -> Result<(String, Vec<String>), CommandValidationError> {
        self.prepare_command(payload)
    }

    /// Acquire a slot for a synchronous MQTT run.
    pub fn try_acquire_slot(&self) -> Option<OwnedSemaphorePermit> {
        Arc::clone(&self.slots).try_acquire_owned().ok()
    }

    /// Spawn an asynchronous process; returns its user-facing pid.
    pub async fn start_async(&self, command: &str, tokens: &[String]) -> Option<u16> {
        let Ok(permit) = Arc::clone(&self.slots).try_acquire_owned() else {
            log::warn!(
                "Concurrent process limit reached ({})",
                self.ctx.config.process_max_concurrent
            );
            return None;
        };

        let pid = {
            let mut state = self.ctx.state.lock().expect("state lock poisoned");
            state.allocate_pid()?
        };

        let mut child = match tokio::process::Command::new(&tokens[0])
            .args(&tokens[1..])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
        {
            Ok(child) => child,
            Err(err) => {
                log::warn!("Failed to start async process '{command}': {err}");
                return None;
            }
        };

        let os_pid = child.id();
        {
            let mut state = self.ctx.state.lock().expect("state lock poisoned");
            state
                .running_processes
                .insert(pid, ManagedProcess::new(pid, command.to_string(), os_pid));
        }
        self.permits.lock().expect("permit lock poisoned").insert(pid, permit);

        let ctx = self.ctx.clone();
        let output_limit = self.output_limit();
        let component_permits = self.permit_handle();
        tokio::spawn(async move {
            monitor_async_process(ctx, component_permits, pid, &mut child, output_limit).await;
        });

        log::info!("Started async process '{command}' with PID {pid}");
        Some(pid)
    }

    /// Draw one output batch; removes the entry once exited and drained.
    pub fn collect_output(&self, pid: u16) -> PollBatch {
        let mut state = self.ctx.state.lock().expect("state lock poisoned");
        let Some(slot) = state.running_processes.get_mut(&pid) else {
            log::debug!("PROCESS_POLL received for unknown PID {pid}");
            return PollBatch {
                status: Status::Error.value() as u8,
                exit_code: PROCESS_DEFAULT_EXIT_CODE,
                stdout: Vec::new(),
                stderr: Vec::new(),
                stdout_truncated: false,
                stderr_truncated: false,
                finished: false,
            };
        };

        let (stdout, stderr, stdout_truncated, stderr_truncated) = slot.pop_payload(POLL_BUDGET);
        let exit_code = slot
            .exit_code
            .map(|code| (code & 0xFF) as u8)
            .unwrap_or(PROCESS_DEFAULT_EXIT_CODE);
        let done = matches!(slot.lifecycle, ProcessLifecycle::Finished | ProcessLifecycle::Zombie);
        let finished = done && slot.is_drained();
        if finished {
            state.running_processes.remove(&pid);
            drop(state);
            self.release_permit(pid);
            log::info!("Async process {pid} finished with exit code {exit_code} (final poll)");
        }

        PollBatch {
            status: Status::Ok.value() as u8,
            exit_code,
            stdout,
            stderr,
            stdout_truncated,
            stderr_truncated,
            finished,
        }
    }

    /// Kill a registered process tree. Returns false for unknown pids.
    pub async fn kill_by_pid(&self, pid: u16) -> bool {
        let os_pid = {
            let state = self.ctx.state.lock().expect("state lock poisoned");
            match state.running_processes.get(&pid) {
                Some(slot) => slot.os_pid,
                None => {
                    log::warn!("Attempted to kill non-existent PID: {pid}");
                    return false;
                }
            }
        };

        if let Some(os_pid) = os_pid {
            let _ = tokio::task::spawn_blocking(move || kill_process_tree(os_pid)).await;
            log::info!("Killed process with PID {pid}");
        }

        let remove = {
            let mut state = self.ctx.state.lock().expect("state lock poisoned");
            if let Some(slot) = state.running_processes.get_mut(&pid) {
                slot.lifecycle = ProcessLifecycle::Zombie;
                slot.os_pid = None;
                if slot.exit_code.is_none() {
                    slot.exit_code = Some(i32::from(PROCESS_DEFAULT_EXIT_CODE));
                }
                // Undrained buffers stay for a final poll.
                if slot.is_drained() {
                    state.running_processes.remove(&pid);
                    true
                } else {
                    false
                }
            } else {
                false
            }
        };
        if remove {
            self.release_permit(pid);
        }
        true
    }

    /// Publish a poll batch as JSON on `sh/poll/<pid>/response`.
    pub async fn publish_poll_result(&self, pid: u16, batch: &PollBatch) {
        use base64::engine::general_purpose::STANDARD as BASE64;
        use base64::Engine;

        let pid_string = pid.to_string();
        let topic = topics::topic_path(
            &self.ctx.config.mqtt_topic,
            topics::Topic::Shell,
            &["poll", &pid_string, topics::SUFFIX_RESPONSE],
        );
        let payload = serde_json::json!({
            "status": batch.status,
            "exit_code": batch.exit_code,
            "stdout": String::from_utf8_lossy(&batch.stdout),
            "stderr": String::from_utf8_lossy(&batch.stderr),
            "stdout_base64": BASE64.encode(&batch.stdout),
            "stderr_base64": BASE64.encode(&batch.stderr),
            "stdout_truncated": batch.stdout_truncated,
            "stderr_truncated": batch.stderr_truncated,
            "finished": batch.finished,
        });
        let message = QueuedPublish::new(topic, serde_json::to_vec(&payload).unwrap_or_default())
            .with_content_type("application/json")
            .with_expiry(EXPIRY_SHELL)
            .with_user_property("bridge-process-pid", &pid_string);
        self.ctx.enqueue_mqtt(message, None).await;
    }

    async fn publish_run_async_error(&self, reason: &str) {
        let topic = topics::topic_path(
            &self.ctx.config.mqtt_topic,
            topics::Topic::Shell,
            &["run_async", topics::SUFFIX_ERROR],
        );
        let payload = serde_json::json!({ "status": "error", "reason": reason });
        let message = QueuedPublish::new(topic, serde_json::to_vec(&payload).unwrap_or_default())
            .with_content_type("application/json");
        self.ctx.enqueue_mqtt(message, None).await;
    }

    fn process_timeout(&self) -> Duration {
        let state = self.ctx.state.lock().expect("state lock poisoned");
        Duration::from_secs(state.process_timeout.max(1))
    }

    fn output_limit(&self) -> usize {
        let state = self.ctx.state.lock().expect("state lock poisoned");
        state.process_output_limit
    }

    fn permit_handle(&self) -> Arc<StdMutex<HashMap<u16, OwnedSemaphorePermit>>> {
        Arc::clone(&self.permits)
    }

    fn release_permit(&self, pid: u16) {
        self.permits.lock().expect("permit lock poisoned").remove(&pid);
    }
}

// ── Free helpers ──────────────────────────────────────────────────────────

async fn run_sync_command(
    tokens: &[String],
    timeout: Duration,
    output_limit: usize,
) -> SyncRunResult {
    let mut child = match tokio::process::Command::new(&tokens[0])
        .args(&tokens[1..])
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
    {
        Ok(child) => child,
        Err(err) => {
            return SyncRunResult {
                status: Status::Error.value() as u8,
                stdout: Vec::new(),
                stderr: err.to_string().into_bytes(),
                exit_code: None,
            }
        }
    };

    let os_pid = child.id();
    let mut stdout_pipe = child.stdout.take();
    let mut stderr_pipe = child.stderr.take();

    let stdout_fut = async {
        let mut buffer = Vec::new();
        if let Some(pipe) = stdout_pipe.as_mut() {
            let _ = pipe.read_to_end(&mut buffer).await;
        }
        buffer
    };
    let stderr_fut = async {
        let mut buffer = Vec::new();
        if let Some(pipe) = stderr_pipe.as_mut() {
            let _ = pipe.read_to_end(&mut buffer).await;
        }
        buffer
    };
    let wait_fut = async {
        match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(status)) => (false, status.code()),
            Ok(Err(err)) => {
                log::debug!("Failed to await sync process: {err}");
                (false, None)
            }
            Err(_) => {
                if let Some(os_pid) = os_pid {
                    let _ = tokio::task::spawn_blocking(move || kill_process_tree(os_pid)).await;
                }
                match tokio::time::timeout(SYNC_KILL_WAIT, child.wait()).await {
                    Ok(Ok(status)) => (true, status.code()),
                    _ => {
                        log::warn!("Synchronous process did not exit after kill");
                        (true, None)
                    }
                }
            }
        }
    };

    let (mut stdout, mut stderr, (timed_out, exit_code)) =
        tokio::join!(stdout_fut, stderr_fut, wait_fut);

    let stdout_truncated = trim_tail(&mut stdout, output_limit);
    let stderr_truncated = trim_tail(&mut stderr, output_limit);
    if stdout_truncated || stderr_truncated {
        log::warn!("Synchronous command output truncated to {output_limit} bytes");
    }

    SyncRunResult {
        status: if timed_out { Status::Timeout.value() as u8 } else { Status::Ok.value() as u8 },
        stdout,
        stderr,
        exit_code,
    }
}

/// Keep the last `limit` bytes; report whether anything was cut.
fn trim_tail(buffer: &mut Vec<u8>, limit: usize) -> bool {
    if limit == 0 || buffer.len() <= limit {
        return false;
    }
    let excess = buffer.len() - limit;
    buffer.drain(..excess);
    true
}

/// `status ‖ stdout_len:u16 ‖ stdout ‖ stderr_len:u16 ‖ stderr ‖ exit:u8`,
/// trimmed to the frame payload budget (stdout first).
fn build_run_response(result: &SyncRunResult) -> Vec<u8> {
    let budget = MAX_PAYLOAD_SIZE - 6;
    let stdout = &result.stdout[..result.stdout.len().min(budget)];
    let remaining = budget - stdout.len();
    let stderr = &result.stderr[..result.stderr.len().min(remaining)];

    let mut response = Vec::with_capacity(MAX_PAYLOAD_SIZE);
    response.push(result.status);
    response.extend_from_slice(&(stdout.len() as u16).to_be_bytes());
    response.extend_from_slice(stdout);
    response.extend_from_slice(&(stderr.len() as u16).to_be_bytes());
    response.extend_from_slice(stderr);
    response.push(
        result
            .exit_code
            .map(|code| (code & 0xFF) as u8)
            .unwrap_or(PROCESS_DEFAULT_EXIT_CODE),
    );
    response
}

/// `status ‖ exit:u8 ‖ stdout_len:u16 ‖ stdout ‖ stderr_len:u16 ‖ stderr`.
fn build_poll_response(batch: &PollBatch) -> Vec<u8> {
    let mut response = Vec::with_capacity(MAX_PAYLOAD_SIZE);
    response.push(batch.status);
    response.push(batch.exit_code);
    response.extend_from_slice(&(batch.stdout.len() as u16).to_be_bytes());
    response.extend_from_slice(&batch.stdout);
    response.extend_from_slice(&(batch.stderr.len() as u16).to_be_bytes());
    response.extend_from_slice(&batch.stderr);
    response
}

async fn monitor_async_process(
    ctx: BridgeContext,
    permits: Arc<StdMutex<HashMap<u16, OwnedSemaphorePermit>>>,
    pid: u16,
    child: &mut tokio::process::Child,
    output_limit: usize,
) {
    let mut stdout_pipe = child.stdout.take();
    let mut stderr_pipe = child.stderr.take();

    // Stream both pipes into the bounded slot buffers so polls observe
    // output while the process runs and the pipes never fill up.
    let stdout_ctx = ctx.clone();
    let stdout_task = async move {
        let Some(pipe) = stdout_pipe.as_mut() else { return };
        let mut chunk = [0u8; 1024];
        loop {
            match pipe.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let mut state = stdout_ctx.state.lock().expect("state lock poisoned");
                    if let Some(slot) = state.running_processes.get_mut(&pid) {
                        slot.append_output(&chunk[..n], &[], output_limit);
                    }
                }
            }
        }
    };
    let stderr_ctx = ctx.clone();
    let stderr_task = async move {
        let Some(pipe) = stderr_pipe.as_mut() else { return };
        let mut chunk = [0u8; 1024];
        loop {
            match pipe.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let mut state = stderr_ctx.state.lock().expect("state lock poisoned");
                    if let Some(slot) = state.running_processes.get_mut(&pid) {
                        slot.append_output(&[], &chunk[..n], output_limit);
                    }
                }
            }
        }
    };
    let wait_task = child.wait();

    let (_, _, wait_result) = tokio::join!(stdout_task, stderr_task, wait_task);
    let exit_code = wait_result
        .ok()
        .and_then(|status| status.code())
        .unwrap_or(i32::from(PROCESS_DEFAULT_EXIT_CODE));

    let release = {
        let mut state = ctx.state.lock().expect("state lock poisoned");
        match state.running_processes.get_mut(&pid) {
            Some(slot) => {
                slot.exit_code = Some(exit_code);
                slot.os_pid = None;
                if slot.lifecycle == ProcessLifecycle::Running {
                    slot.lifecycle = ProcessLifecycle::Finished;
                }
                if slot.is_drained() {
                    state.running_processes.remove(&pid);
                    true
                } else {
                    false
                }
            }
            // Killed and removed while we were draining.
            None => true,
        }
    };
    if release {
        permits.lock().expect("permit lock poisoned").remove(&pid);
        log::info!("Async process {pid} finished with exit code {exit_code}");
    }
}

/// Discover all descendants of `root` by walking `/proc/<pid>/stat` ppids.
fn find_descendants(root: u32) -> Vec<u32> {
    let mut children_of: HashMap<u32, Vec<u32>> = HashMap::new();
    let Ok(entries) = std::fs::read_dir("/proc") else { return Vec::new() };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(pid) = name.to_str().and_then(|s| s.parse::<u32>().ok()) else { continue };
        let Ok(stat) = std::fs::read_to_string(format!("/proc/{pid}/stat")) else { continue };
        // Format: pid (comm) state ppid ...; comm may contain spaces, so
        // parse after the closing parenthesis.
        let Some(rest) = stat.rsplit_once(')').map(|(_, rest)| rest) else { continue };
        let mut fields = rest.split_whitespace();
        let _state = fields.next();
        if let Some(ppid) = fields.next().and_then(|s| s.parse::<u32>().ok()) {
            children_of.entry(ppid).or_default().push(pid);
        }
    }

    let mut descendants = Vec::new();
    let mut queue = vec![root];
    while let Some(pid) = queue.pop() {
        if let Some(children) = children_of.get(&pid) {
            for &child in children {
                descendants.push(child);
                queue.push(child);
            }
        }
    }
    descendants
}

fn pid_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

/// SIGTERM the whole tree, wait briefly, SIGKILL the survivors.
pub(crate) fn kill_process_tree(root: u32) {
    let mut targets = find_descendants(root);
    targets.push(root);

    for &pid in &targets {
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }

    let deadline = std::time::Instant::now() + KILL_WAIT;
    while std::time::Instant::now() < deadline {
        if !targets.iter().any(|&pid| pid_alive(pid)) {
            return;
        }
        std::thread::sleep(Duration::from_millis(50));
    }

    for &pid in &targets {
        if pid_alive(pid) {
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGKILL);
            }
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
