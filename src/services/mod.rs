//! Bridge service: owns the runtime state and composes every component.
//!
//! [`BridgeService`] is the orchestration façade: the serial transport feeds
//! it MCU frames, the MQTT client feeds it inbound messages, and components
//! reach the outside world exclusively through [`BridgeContext`] — a cheap
//! clonable bundle of shared handles, so no component ever owns the service.

pub mod console;
pub mod datastore;
pub mod dispatcher;
pub mod file;
pub mod mailbox;
pub mod pin;
pub mod process;
pub mod shell;
pub mod system;

use std::sync::Arc;

use anyhow::Result;
use serde_json::json;

use crate::config::Config;
use crate::handshake::{HandshakeManager, LinkFsmState};
use crate::mqtt::messages::{InboundMessage, QueuedPublish};
use crate::mqtt::queue::PublishQueue;
use crate::mqtt::spool::MqttPublishSpool;
use crate::protocol::{self, rle, topics, Status, CMD_FLAG_COMPRESSED, MAX_PAYLOAD_SIZE};
use crate::serial::flow::SerialFlowController;
use crate::state::SharedState;

/// Message expiry for console output, seconds.
pub const EXPIRY_CONSOLE: u32 = 10;
/// Message expiry for pin values, seconds.
pub const EXPIRY_PIN: u32 = 10;
/// Message expiry for datastore values, seconds.
pub const EXPIRY_DATASTORE: u32 = 30;
/// Message expiry for shell responses, seconds.
pub const EXPIRY_SHELL: u32 = 30;
/// Message expiry for status and snapshot documents, seconds.
pub const EXPIRY_STATUS: u32 = 30;

/// Shared handles components use to reach the wire and the broker.
#[derive(Clone)]
pub struct BridgeContext {
    pub config: Arc<Config>,
    pub state: SharedState,
    pub flow: Arc<SerialFlowController>,
    pub publish_queue: Arc<PublishQueue>,
    pub spool: Arc<MqttPublishSpool>,
}

impl BridgeContext {
    /// Send a frame through the flow controller (tracked when required).
    pub async fn send_frame(&self, command_id: u16, payload: Vec<u8>) -> bool {
        self.flow.send(command_id, payload).await
    }

    /// Write a frame directly, bypassing tracking. Used for status frames.
    pub async fn raw_send(&self, command_id: u16, payload: Vec<u8>) -> bool {
        match self.flow.raw_sender() {
            Some(sender) => sender.send_frame(command_id, payload).await,
            None => {
                log::error!("Serial sender not registered; cannot emit frame 0x{command_id:02X}");
                false
            }
        }
    }

    /// Emit a status frame echoing `command_id` (big-endian) plus `extra`.
    pub async fn acknowledge_frame(&self, command_id: u16, status: Status, extra: &[u8]) {
        let mut payload = command_id.to_be_bytes().to_vec();
        if !extra.is_empty() {
            let remaining = MAX_PAYLOAD_SIZE - payload.len();
            payload.extend_from_slice(&extra[..extra.len().min(remaining)]);
        }
        self.raw_send(status.value(), payload).await;
    }

    /// Queue an MQTT publish, applying MQTT 5 reply plumbing and the
    /// saturation policy (drop oldest to the spool).
    pub async fn enqueue_mqtt(&self, message: QueuedPublish, reply: Option<&InboundMessage>) {
        let mut message = message;
        if let Some(inbound) = reply {
            if let Some(response_topic) = &inbound.response_topic {
                if !response_topic.is_empty() {
                    message.topic_name = response_topic.clone();
                }
            }
            if let Some(correlation) = &inbound.correlation_data {
                message.correlation_data = Some(correlation.to_vec());
            }
            message
                .user_properties
                .push(("bridge-request-topic".into(), inbound.topic.clone()));
        }

        if let Some(dropped) = self.publish_queue.push(message) {
            let drop_topic = dropped.topic_name.clone();
            {
                let mut state = self.state.lock().expect("state lock poisoned");
                state.record_mqtt_drop(&drop_topic);
            }
            self.stash_to_spool(dropped).await;
            log::warn!(
                "MQTT publish queue saturated ({}/{}); dropping oldest topic={drop_topic} to spool",
                self.publish_queue.len(),
                self.publish_queue.limit()
            );
        }
    }

    async fn stash_to_spool(&self, message: QueuedPublish) {
        let spool = Arc::clone(&self.spool);
        let stored = tokio::task::spawn_blocking(move || {
            spool.append(&message);
            spool.snapshot()
        })
        .await;

        let mut state = self.state.lock().expect("state lock poisoned");
        match stored {
            Ok(snapshot) => {
                state.mqtt_spooled_messages += 1;
                state.mqtt_spool_failure_reason = self.spool.failure_reason();
                state.update_spool_snapshot(snapshot);
            }
            Err(err) => {
                state.mqtt_spool_errors += 1;
                log::error!("Spool stash task failed: {err}");
            }
        }
    }

    /// Convenience publish with expiry and user properties.
    pub async fn publish(
        &self,
        topic: String,
        payload: Vec<u8>,
        expiry: Option<u32>,
        properties: &[(&str, &str)],
        reply: Option<&InboundMessage>,
    ) {
        let mut message = QueuedPublish::new(topic, payload).with_user_properties(properties);
        message.message_expiry_interval = expiry;
        self.enqueue_mqtt(message, reply).await;
    }
}

/// Service façade orchestrating MCU and MQTT interactions.
pub struct BridgeService {
    pub config: Arc<Config>,
    pub state: SharedState,
    pub flow: Arc<SerialFlowController>,
    pub publish_queue: Arc<PublishQueue>,
    pub spool: Arc<MqttPublishSpool>,
    pub handshake: Arc<HandshakeManager>,
    pub(crate) console: console::ConsoleComponent,
    pub(crate) datastore: datastore::DatastoreComponent,
    pub(crate) file: file::FileComponent,
    pub(crate) mailbox: mailbox::MailboxComponent,
    pub(crate) pin: pin::PinComponent,
    pub(crate) process: Arc<process::ProcessComponent>,
    pub(crate) shell: shell::ShellComponent,
    pub(crate) system: system::SystemComponent,
}

impl BridgeService {
    /// Assemble the service from its shared parts.
    pub fn new(
        config: Arc<Config>,
        state: SharedState,
        flow: Arc<SerialFlowController>,
        publish_queue: Arc<PublishQueue>,
        spool: Arc<MqttPublishSpool>,
    ) -> Result<Arc<Self>> {
        let timing = config.derive_serial_timing()?;
        {
            let mut guard = state.lock().expect("state lock poisoned");
            guard.serial_ack_timeout_ms = timing.ack_timeout_ms;
            guard.serial_response_timeout_ms = timing.response_timeout_ms;
            guard.serial_retry_limit = timing.retry_limit;
            guard.update_spool_snapshot(spool.snapshot());
        }

        // Flow controller observers feed the state counters.
        {
            let state = Arc::clone(&state);
            flow.set_metrics_callback(Some(Box::new(move |event| {
                let mut state = state.lock().expect("state lock poisoned");
                state.record_serial_flow_event(event);
            })));
        }
        {
            let state = Arc::clone(&state);
            flow.set_pipeline_observer(Some(Box::new(move |event| {
                let mut state = state.lock().expect("state lock poisoned");
                if let Some(latency_ms) = event.get("latency_ms").and_then(|v| v.as_f64()) {
                    state.serial_latency_stats.record(latency_ms);
                }
                state.record_serial_pipeline_event(event);
            })));
        }

        let ctx = BridgeContext {
            config: Arc::clone(&config),
            state: Arc::clone(&state),
            flow: Arc::clone(&flow),
            publish_queue: Arc::clone(&publish_queue),
            spool: Arc::clone(&spool),
        };

        let handshake = Arc::new(HandshakeManager::new(ctx.clone(), timing));
        let process = Arc::new(process::ProcessComponent::new(ctx.clone()));

        Ok(Arc::new(Self {
            console: console::ConsoleComponent::new(ctx.clone()),
            datastore: datastore::DatastoreComponent::new(ctx.clone()),
            file: file::FileComponent::new(ctx.clone()),
            mailbox: mailbox::MailboxComponent::new(ctx.clone()),
            pin: pin::PinComponent::new(ctx.clone()),
            shell: shell::ShellComponent::new(ctx.clone(), Arc::clone(&process)),
            system: system::SystemComponent::new(ctx.clone()),
            process,
            config,
            state,
            flow,
            publish_queue,
            spool,
            handshake,
        }))
    }

    /// Context handle for ad-hoc callers (tests, periodic tasks).
    pub fn context(&self) -> BridgeContext {
        BridgeContext {
            config: Arc::clone(&self.config),
            state: Arc::clone(&self.state),
            flow: Arc::clone(&self.flow),
            publish_queue: Arc::clone(&self.publish_queue),
            spool: Arc::clone(&self.spool),
        }
    }

    /// True once the handshake has completed on the current link.
    pub fn is_link_synchronized(&self) -> bool {
        self.state.lock().expect("state lock poisoned").link_is_synchronized
    }

    /// True when a fatal handshake failure has been recorded.
    pub fn has_fatal_handshake_failure(&self) -> bool {
        self.handshake.fatal_reason().is_some()
    }

    /// Entry point for every frame received from the MCU.
    pub async fn handle_mcu_frame(&self, command_id: u16, payload: Vec<u8>) {
        let (command_id, payload) = if command_id & CMD_FLAG_COMPRESSED != 0 {
            match rle::decode(&payload) {
                Ok(decoded) => (command_id & !CMD_FLAG_COMPRESSED, decoded),
                Err(err) => {
                    log::warn!(
                        "Dropping compressed frame 0x{command_id:02X} with invalid payload: {err}"
                    );
                    let mut state = self.state.lock().expect("state lock poisoned");
                    state.serial_decode_errors += 1;
                    return;
                }
            }
        } else {
            (command_id, payload)
        };

        self.flow.on_frame_received(command_id, &payload);
        dispatcher::dispatch_mcu_frame(self, command_id, &payload).await;
    }

    /// Entry point for every inbound MQTT message.
    pub async fn handle_mqtt_message(&self, inbound: &InboundMessage) {
        dispatcher::dispatch_mqtt_message(self, inbound).await;
    }

    /// Queue an MQTT publish through the context.
    pub async fn enqueue_mqtt(&self, message: QueuedPublish, reply: Option<&InboundMessage>) {
        self.context().enqueue_mqtt(message, reply).await;
    }

    /// Post-connection initialisation: synchronize, then warm the link.
    pub async fn on_serial_connected(self: &Arc<Self>) {
        {
            let mut state = self.state.lock().expect("state lock poisoned");
            state.serial_link_connected = true;
        }

        let handshake_ok = self.handshake.synchronize().await;
        if !handshake_ok {
            if self.has_fatal_handshake_failure() {
                return;
            }
            log::error!("Skipping post-connect initialisation because MCU link sync failed");
            return;
        }

        if !self.system.request_mcu_version().await {
            log::warn!("Failed to dispatch MCU version request after reconnect");
        }
        self.console.flush_queue().await;
    }

    /// Reset transient MCU tracking when the serial link drops.
    pub async fn on_serial_disconnected(&self) {
        let pending = {
            let mut state = self.state.lock().expect("state lock poisoned");
            state.serial_link_connected = false;
            let digital = state.pending_digital_reads.len();
            let analog = state.pending_analog_reads.len();
            state.pending_digital_reads.clear();
            state.pending_analog_reads.clear();
            // Never keep the console paused between links.
            state.mcu_is_paused = false;
            state.link_is_synchronized = false;
            (digital, analog)
        };
        if pending.0 + pending.1 > 0 {
            log::warn!(
                "Serial link lost; clearing {} pending request(s) (digital={} analog={})",
                pending.0 + pending.1,
                pending.0,
                pending.1
            );
        }

        self.flow.reset();
        self.handshake.clear_handshake_expectations();
    }

    /// Mirror an MCU status frame to `system/status`.
    pub async fn handle_status(&self, status: Status, payload: &[u8]) {
        {
            let mut state = self.state.lock().expect("state lock poisoned");
            state.record_mcu_status(status);
        }
        let text = String::from_utf8_lossy(payload).into_owned();
        if status == Status::Ack {
            log::debug!("MCU > {} {text}", status.name());
        } else {
            log::warn!("MCU > {} {text}", status.name());
        }

        let report = json!({
            "status": status.value(),
            "name": status.name(),
            "message": text,
        });
        let mut message = QueuedPublish::new(
            topics::system_status_topic(&self.config.mqtt_topic),
            serde_json::to_vec(&report).unwrap_or_default(),
        )
        .with_content_type("application/json")
        .with_expiry(EXPIRY_STATUS)
        .with_user_property("bridge-status", status.name());
        if !text.is_empty() {
            message = message.with_user_property("bridge-status-message", &text);
        }
        self.enqueue_mqtt(message, None).await;
    }

    /// Check the per-(topic, action) authorization table.
    pub fn is_topic_action_allowed(&self, topic: topics::Topic, action: &str) -> bool {
        if action.is_empty() {
            return true;
        }
        let state = self.state.lock().expect("state lock poisoned");
        state.topic_authorization.allows(topic, action)
    }

    /// Publish a `{status: forbidden}` document for a denied action.
    pub async fn reject_topic_action(
        &self,
        inbound: &InboundMessage,
        topic: topics::Topic,
        action: &str,
    ) {
        log::warn!(
            "Blocked MQTT action topic={} action={} (message topic={})",
            topic.as_str(),
            if action.is_empty() { "<missing>" } else { action },
            inbound.topic
        );
        let payload = json!({
            "status": "forbidden",
            "topic": topic.as_str(),
            "action": action,
        });
        let message = QueuedPublish::new(
            topics::system_status_topic(&self.config.mqtt_topic),
            serde_json::to_vec(&payload).unwrap_or_default(),
        )
        .with_content_type("application/json")
        .with_expiry(EXPIRY_STATUS)
        .with_user_property("bridge-error", "topic_forbidden");
        self.enqueue_mqtt(message, Some(inbound)).await;
    }

    /// Publish a bridge snapshot (`handshake` or `summary` flavor).
    pub async fn publish_bridge_snapshot(&self, flavor: &str, inbound: Option<&InboundMessage>) {
        let (snapshot, segments): (serde_json::Value, [&str; 3]) = {
            let state = self.state.lock().expect("state lock poisoned");
            if flavor == "handshake" {
                (state.build_handshake_snapshot(), ["bridge", "handshake", "value"])
            } else {
                (state.build_bridge_snapshot(), ["bridge", "summary", "value"])
            }
        };
        let topic = topics::topic_path(&self.config.mqtt_topic, topics::Topic::System, &segments);
        let message = QueuedPublish::new(topic, serde_json::to_vec(&snapshot).unwrap_or_default())
            .with_content_type("application/json")
            .with_expiry(EXPIRY_STATUS)
            .with_user_property("bridge-snapshot", flavor);
        self.enqueue_mqtt(message, inbound).await;
    }

    /// Handshake FSM state, for snapshots and diagnostics.
    pub fn link_fsm_state(&self) -> LinkFsmState {
        self.handshake.fsm_state()
    }
}

// Pre-sync frame firewall shared with the dispatcher.
pub(crate) fn is_frame_allowed_pre_sync(command_id: u16) -> bool {
    protocol::is_status_id(command_id)
        || command_id == protocol::Command::LinkSyncResp.value()
        || command_id == protocol::Command::LinkResetResp.value()
}
