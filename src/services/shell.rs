//! MQTT shell endpoints: `sh/{run, run_async, poll/<pid>, kill/<pid>}`.
//!
//! Mirrors the MCU process operations for MQTT clients. Synchronous runs
//! reply on `sh/response` with a JSON document carrying base64 output
//! buffers and truncation flags; poll and kill address processes started
//! through either transport.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use super::process::ProcessComponent;
use super::{BridgeContext, EXPIRY_SHELL};
use crate::mqtt::messages::{InboundMessage, QueuedPublish};
use crate::policy::CommandValidationError;
use crate::protocol::{topics, Status};

pub struct ShellComponent {
    ctx: BridgeContext,
    process: Arc<ProcessComponent>,
}

impl ShellComponent {
    pub fn new(ctx: BridgeContext, process: Arc<ProcessComponent>) -> Self {
        Self { ctx, process }
    }

    /// Route an `sh/…` topic.
    pub async fn handle_mqtt(
        &self,
        identifier: &str,
        remainder: &[String],
        payload: &[u8],
        inbound: &InboundMessage,
    ) {
        match identifier {
            "run" => self.handle_run(payload, inbound).await,
            "run_async" => self.handle_run_async(payload, inbound).await,
            "poll" => {
                let Some(pid) = parse_pid_segment(remainder.first()) else {
                    log::warn!("Shell poll without a valid pid segment");
                    return;
                };
                self.handle_poll(pid).await;
            }
            "kill" => {
                let Some(pid) = parse_pid_segment(remainder.first()) else {
                    log::warn!("Shell kill without a valid pid segment");
                    return;
                };
                self.handle_kill(pid).await;
            }
            other => log::debug!("Unknown shell action '{other}'"),
        }
    }

    async fn handle_run(&self, payload: &[u8], inbound: &InboundMessage) {
        let service = &self.ctx;
        let process = &self.process;

        let (command, tokens) = match process.validate_command(payload) {
            Ok(prepared) => prepared,
            Err(err) => {
                self.publish_run_error(&err, inbound).await;
                return;
            }
        };

        let Some(permit) = process.try_acquire_slot() else {
            log::warn!("Concurrent process limit reached for MQTT shell run");
            self.publish_error_response("process_limit_reached", Some(inbound)).await;
            return;
        };

        let result = {
            let _permit = permit;
            process.run_sync(&tokens).await
        };

        let response = serde_json::json!({
            "command": command,
            "status": result.status,
            "timed_out": result.status == Status::Timeout.value() as u8,
            "exit_code": result.exit_code,
            "stdout": String::from_utf8_lossy(&result.stdout),
            "stderr": String::from_utf8_lossy(&result.stderr),
            "stdout_base64": BASE64.encode(&result.stdout),
            "stderr_base64": BASE64.encode(&result.stderr),
        });
        let topic = topics::topic_path(
            &service.config.mqtt_topic,
            topics::Topic::Shell,
            &[topics::SUFFIX_RESPONSE],
        );
        let message =
            QueuedPublish::new(topic, serde_json::to_vec(&response).unwrap_or_default())
                .with_content_type("application/json")
                .with_expiry(EXPIRY_SHELL);
        service.enqueue_mqtt(message, Some(inbound)).await;
    }

    async fn handle_run_async(&self, payload: &[u8], inbound: &InboundMessage) {
        let process = &self.process;
        let (command, tokens) = match process.validate_command(payload) {
            Ok(prepared) => prepared,
            Err(err) => {
                self.publish_run_error(&err, inbound).await;
                return;
            }
        };

        match process.start_async(&command, &tokens).await {
            Some(pid) => {
                let topic = topics::topic_path(
                    &self.ctx.config.mqtt_topic,
                    topics::Topic::Shell,
                    &["run_async", topics::SUFFIX_RESPONSE],
                );
                let message = QueuedPublish::new(topic, pid.to_string().into_bytes())
                    .with_expiry(EXPIRY_SHELL)
                    .with_user_property("bridge-process-pid", &pid.to_string());
                self.ctx.enqueue_mqtt(message, Some(inbound)).await;
            }
            None => {
                self.publish_error_response("process_run_async_failed", Some(inbound)).await;
            }
        }
    }

    async fn handle_poll(&self, pid: u16) {
        let batch = self.process.collect_output(pid);
        self.process.publish_poll_result(pid, &batch).await;
    }

    async fn handle_kill(&self, pid: u16) {
        if !self.process.kill_by_pid(pid).await {
            self.publish_error_response("process_not_found", None).await;
        }
    }

    async fn publish_run_error(&self, err: &CommandValidationError, inbound: &InboundMessage) {
        log::warn!("Rejected MQTT shell command: {err}");
        self.publish_error_response("command_validation_failed", Some(inbound)).await;
    }

    async fn publish_error_response(&self, reason: &str, inbound: Option<&InboundMessage>) {
        let topic = topics::topic_path(
            &self.ctx.config.mqtt_topic,
            topics::Topic::Shell,
            &[topics::SUFFIX_RESPONSE],
        );
        let payload = serde_json::json!({ "status": "error", "reason": reason });
        let message = QueuedPublish::new(topic, serde_json::to_vec(&payload).unwrap_or_default())
            .with_content_type("application/json")
            .with_expiry(EXPIRY_SHELL)
            .with_user_property("bridge-error", reason);
        self.ctx.enqueue_mqtt(message, inbound).await;
    }
}

/// Parse a `<pid>` topic segment.
fn parse_pid_segment(segment: Option<&String>) -> Option<u16> {
    segment?.trim().parse().ok()
}
