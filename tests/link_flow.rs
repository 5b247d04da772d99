//! End-to-end tests driving the bridge service over an in-memory frame sink.
//!
//! The sink plays the UART: tests watch the frames the bridge emits and
//! inject MCU replies through `handle_mcu_frame`, exactly as the serial
//! transport would.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;

use mcubridge::handshake::LinkFsmState;
use mcubridge::protocol::{Command, Status};
use mcubridge::security;
use mcubridge::serial::flow::{FrameSink, SinkFuture};
use mcubridge::{
    BridgeService, Config, InboundMessage, MqttPublishSpool, PublishQueue, QueuedPublish,
    RuntimeState, SerialFlowController,
};

/// Records every frame the bridge writes to the "UART".
#[derive(Default)]
struct TestSink {
    frames: Mutex<Vec<(u16, Vec<u8>)>>,
}

impl TestSink {
    fn frames(&self) -> Vec<(u16, Vec<u8>)> {
        self.frames.lock().unwrap().clone()
    }

    async fn wait_for_frame(&self, index: usize) -> (u16, Vec<u8>) {
        for _ in 0..200 {
            {
                let frames = self.frames.lock().unwrap();
                if frames.len() > index {
                    return frames[index].clone();
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("frame {index} never appeared; got {:?}", self.frames());
    }
}

impl FrameSink for TestSink {
    fn send_frame(&self, command_id: u16, payload: Vec<u8>) -> SinkFuture<'_> {
        Box::pin(async move {
            self.frames.lock().unwrap().push((command_id, payload));
            true
        })
    }
}

struct TestBridge {
    service: Arc<BridgeService>,
    sink: Arc<TestSink>,
    _spool_dir: tempfile::TempDir,
}

const TEST_SECRET: &str = "bridge-test-secret";

fn test_config(spool_dir: &std::path::Path) -> Config {
    let mut config = Config::default();
    config.serial_shared_secret = TEST_SECRET.into();
    config.mqtt_tls = false;
    config.mqtt_spool_dir = spool_dir.to_string_lossy().into_owned();
    config.mqtt_queue_limit = 32;
    config.serial_retry_timeout = 0.1;
    config.serial_response_timeout = 0.4;
    config.serial_retry_attempts = 2;
    config.serial_handshake_min_interval = 0.0;
    config.process_timeout = 1;
    config.allowed_commands = vec!["sleep".into(), "echo".into()];
    config
}

fn build_bridge(tweak: impl FnOnce(&mut Config)) -> TestBridge {
    let spool_dir = tempfile::Builder::new()
        .prefix("mcubridge-test-")
        .tempdir_in("/tmp")
        .expect("tempdir under /tmp");

    let mut config = test_config(spool_dir.path());
    tweak(&mut config);
    config.validate().expect("test config must validate");
    let config = Arc::new(config);

    let state = Arc::new(Mutex::new(RuntimeState::from_config(&config)));
    let spool = Arc::new(MqttPublishSpool::open(&config.mqtt_spool_dir, config.mqtt_spool_limit));
    let queue = Arc::new(PublishQueue::new(config.mqtt_queue_limit));
    let timing = config.derive_serial_timing().expect("timing");
    let flow = Arc::new(SerialFlowController::new(
        timing.ack_timeout(),
        timing.response_timeout(),
        timing.retry_limit,
    ));

    let sink = Arc::new(TestSink::default());
    flow.set_sender(Some(sink.clone() as Arc<dyn FrameSink>));

    let service = BridgeService::new(config, state, flow, queue, spool).expect("service");
    TestBridge { service, sink, _spool_dir: spool_dir }
}

fn mark_synchronized(bridge: &TestBridge) {
    let mut state = bridge.service.state.lock().unwrap();
    state.link_is_synchronized = true;
}

fn ack_payload(command: Command) -> Vec<u8> {
    command.value().to_be_bytes().to_vec()
}

/// Pop queued publishes until one matches `topic`.
fn find_publish(bridge: &TestBridge, topic: &str) -> Option<QueuedPublish> {
    while let Some(message) = bridge.service.publish_queue.try_pop() {
        if message.topic_name == topic {
            return Some(message);
        }
    }
    None
}

// ── Scenario: digital write ───────────────────────────────────────────────

#[tokio::test]
async fn digital_write_emits_one_frame_and_completes_on_ack() {
    let bridge = build_bridge(|_| {});
    mark_synchronized(&bridge);

    let inbound = InboundMessage::new("br/d/5", Bytes::from_static(b"1"));
    let dispatch = {
        let service = Arc::clone(&bridge.service);
        tokio::spawn(async move { service.handle_mqtt_message(&inbound).await })
    };

    let (cmd, payload) = bridge.sink.wait_for_frame(0).await;
    assert_eq!(cmd, 0x51, "digital write command id");
    assert_eq!(payload, vec![0x05, 0x01]);

    bridge
        .service
        .handle_mcu_frame(Status::Ack.value(), ack_payload(Command::DigitalWrite))
        .await;
    dispatch.await.unwrap();

    // No further frames after the ACK.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(bridge.sink.frames().len(), 1);
}

// ── Scenario: analog read round-trip ──────────────────────────────────────

#[tokio::test]
async fn analog_read_round_trip_publishes_value() {
    let bridge = build_bridge(|_| {});
    mark_synchronized(&bridge);

    let inbound = InboundMessage::new("br/a/2/read", Bytes::new());
    let dispatch = {
        let service = Arc::clone(&bridge.service);
        tokio::spawn(async move { service.handle_mqtt_message(&inbound).await })
    };

    let (cmd, payload) = bridge.sink.wait_for_frame(0).await;
    assert_eq!(cmd, 0x54, "analog read command id");
    assert_eq!(payload, vec![0x02]);

    bridge
        .service
        .handle_mcu_frame(Command::AnalogReadResp.value(), vec![0x00, 0x7F])
        .await;
    dispatch.await.unwrap();

    let message = find_publish(&bridge, "br/a/2/value").expect("value publish");
    assert_eq!(message.payload, b"127");
    assert!(message
        .user_properties
        .iter()
        .any(|(k, v)| k == "bridge-pin" && v == "2"));

    // The pending request was consumed.
    let state = bridge.service.state.lock().unwrap();
    assert!(state.pending_analog_reads.is_empty());
}

// ── Scenario: pending pin overflow ────────────────────────────────────────

#[tokio::test]
async fn pin_read_overflow_answers_without_touching_the_mcu() {
    let bridge = build_bridge(|config| config.pending_pin_request_limit = 1);
    mark_synchronized(&bridge);

    {
        let mut state = bridge.service.state.lock().unwrap();
        state.pending_analog_reads.push_back(mcubridge::state::PendingPinRequest {
            pin: 9,
            reply: None,
        });
    }

    let inbound = InboundMessage::new("br/a/2/read", Bytes::new());
    bridge.service.handle_mqtt_message(&inbound).await;

    // Overflow reply appears without any serial frame.
    assert!(bridge.sink.frames().is_empty());
    let message = find_publish(&bridge, "br/a/2/value").expect("overflow publish");
    assert!(message.payload.is_empty());
    assert!(message
        .user_properties
        .iter()
        .any(|(k, v)| k == "bridge-error" && v == "pending-pin-overflow"));
}

// ── Scenario: MQTT saturation spills to the spool ─────────────────────────

#[tokio::test]
async fn saturated_queue_drops_oldest_to_spool_in_fifo_order() {
    let bridge = build_bridge(|config| config.mqtt_queue_limit = 4);

    for n in 0..6 {
        let message = QueuedPublish::new(format!("br/test/{n}"), vec![n as u8]);
        bridge.service.enqueue_mqtt(message, None).await;
    }

    assert_eq!(bridge.service.publish_queue.len(), 4);
    assert_eq!(bridge.service.spool.pending(), 2);

    // The two oldest messages went to the spool, FIFO preserved.
    assert_eq!(bridge.service.spool.pop_next().unwrap().topic_name, "br/test/0");
    assert_eq!(bridge.service.spool.pop_next().unwrap().topic_name, "br/test/1");

    let state = bridge.service.state.lock().unwrap();
    assert_eq!(state.mqtt_dropped_messages, 2);
    assert_eq!(state.mqtt_spooled_messages, 2);
}

// ── Scenario: forbidden topic action ──────────────────────────────────────

#[tokio::test]
async fn forbidden_action_publishes_status_document() {
    let bridge = build_bridge(|config| config.topic_authorization.shell_run = false);
    mark_synchronized(&bridge);

    let inbound = InboundMessage::new("br/sh/run", Bytes::from_static(b"echo hi"));
    bridge.service.handle_mqtt_message(&inbound).await;

    assert!(bridge.sink.frames().is_empty());
    let message = find_publish(&bridge, "br/system/status").expect("forbidden publish");
    let body: serde_json::Value = serde_json::from_slice(&message.payload).unwrap();
    assert_eq!(body["status"], "forbidden");
    assert_eq!(body["topic"], "sh");
    assert_eq!(body["action"], "run");
}

// ── Scenario: full handshake, then replay rejection ───────────────────────

async fn drive_handshake(bridge: &TestBridge) -> Vec<u8> {
    // LINK_RESET carries the timing window.
    let (cmd, payload) = bridge.sink.wait_for_frame(0).await;
    assert_eq!(cmd, Command::LinkReset.value());
    assert_eq!(payload.len(), 7);
    bridge
        .service
        .handle_mcu_frame(Status::Ack.value(), ack_payload(Command::LinkReset))
        .await;
    bridge
        .service
        .handle_mcu_frame(Command::LinkResetResp.value(), Vec::new())
        .await;

    // LINK_SYNC carries nonce ‖ tag; echo both back like the MCU does.
    let (cmd, sync_payload) = bridge.sink.wait_for_frame(1).await;
    assert_eq!(cmd, Command::LinkSync.value());
    assert_eq!(sync_payload.len(), 32);
    bridge
        .service
        .handle_mcu_frame(Status::Ack.value(), ack_payload(Command::LinkSync))
        .await;
    bridge
        .service
        .handle_mcu_frame(Command::LinkSyncResp.value(), sync_payload.clone())
        .await;
    sync_payload
}

#[tokio::test]
async fn handshake_succeeds_with_correct_secret() {
    let bridge = build_bridge(|_| {});

    let sync_task = {
        let service = Arc::clone(&bridge.service);
        tokio::spawn(async move { service.handshake.synchronize().await })
    };
    drive_handshake(&bridge).await;

    assert!(sync_task.await.unwrap(), "handshake should succeed");
    assert!(bridge.service.is_link_synchronized());
    assert_eq!(bridge.service.link_fsm_state(), LinkFsmState::Synchronized);

    let state = bridge.service.state.lock().unwrap();
    assert_eq!(state.handshake_successes, 1);
    assert_eq!(state.handshake_failure_streak, 0);
    assert!(state.link_last_nonce_counter > 0);
    // Expectations were wiped after use.
    assert!(state.link_handshake_nonce.is_none());
    assert!(state.link_expected_tag.is_none());
}

#[tokio::test]
async fn replayed_sync_resp_is_rejected_as_auth_mismatch() {
    let bridge = build_bridge(|_| {});

    let sync_task = {
        let service = Arc::clone(&bridge.service);
        tokio::spawn(async move { service.handshake.synchronize().await })
    };
    let first_resp = drive_handshake(&bridge).await;
    assert!(sync_task.await.unwrap());

    // A new attempt is pending with the replayed nonce as its expectation;
    // the counter was already accepted once, so this is a replay.
    {
        let mut state = bridge.service.state.lock().unwrap();
        state.link_is_synchronized = false;
        state.link_handshake_nonce = Some(first_resp[..16].to_vec());
        state.link_expected_tag = Some(first_resp[16..].to_vec());
    }

    bridge
        .service
        .handle_mcu_frame(Command::LinkSyncResp.value(), first_resp)
        .await;

    let state = bridge.service.state.lock().unwrap();
    assert_eq!(state.last_handshake_error.as_deref(), Some("sync_auth_mismatch"));
    assert_eq!(state.handshake_fatal_count, 1);
    assert!(!state.link_is_synchronized);
}

#[tokio::test]
async fn wrong_tag_is_immediately_fatal() {
    let bridge = build_bridge(|_| {});

    let (nonce, counter) = security::generate_nonce_with_counter(0);
    {
        let mut state = bridge.service.state.lock().unwrap();
        state.link_nonce_counter = counter;
        state.link_handshake_nonce = Some(nonce.to_vec());
        state.link_expected_tag =
            Some(security::compute_handshake_tag(TEST_SECRET.as_bytes(), &nonce).to_vec());
    }

    let mut forged = nonce.to_vec();
    forged.extend_from_slice(&security::compute_handshake_tag(b"wrong secret 99", &nonce));
    bridge
        .service
        .handle_mcu_frame(Command::LinkSyncResp.value(), forged)
        .await;

    let state = bridge.service.state.lock().unwrap();
    assert_eq!(state.last_handshake_error.as_deref(), Some("sync_auth_mismatch"));
    assert_eq!(state.handshake_fatal_count, 1);
    assert!(!state.link_is_synchronized);

    // The rejection acknowledged with a MALFORMED status frame.
    let frames = bridge.sink.frames();
    assert!(frames.iter().any(|(cmd, _)| *cmd == Status::Malformed.value()));
}

// ── Scenario: process timeout over MQTT shell ─────────────────────────────

#[tokio::test]
async fn shell_run_times_out_and_reports_timeout_status() {
    let bridge = build_bridge(|config| config.process_timeout = 1);
    mark_synchronized(&bridge);

    let started = std::time::Instant::now();
    let inbound = InboundMessage::new("br/sh/run", Bytes::from_static(b"sleep 10"));
    bridge.service.handle_mqtt_message(&inbound).await;
    let elapsed = started.elapsed();

    assert!(elapsed < Duration::from_secs(5), "kill must cut the run short, took {elapsed:?}");

    let message = find_publish(&bridge, "br/sh/response").expect("shell response");
    let body: serde_json::Value = serde_json::from_slice(&message.payload).unwrap();
    assert_eq!(body["status"], Status::Timeout.value() as u8 as u64);
    assert_eq!(body["timed_out"], true);
    assert_eq!(body["stderr"], "");
}

// ── Scenario: pre-sync firewall ───────────────────────────────────────────

#[tokio::test]
async fn pre_sync_frames_are_dropped_silently() {
    let bridge = build_bridge(|_| {});
    // Not synchronized: a console write from the MCU must be ignored.
    bridge
        .service
        .handle_mcu_frame(Command::ConsoleWrite.value(), b"boot noise".to_vec())
        .await;

    assert!(bridge.sink.frames().is_empty(), "no reply frames before sync");
    assert!(find_publish(&bridge, "br/console/out").is_none());
}

#[tokio::test]
async fn synced_console_write_is_published_and_acked() {
    let bridge = build_bridge(|_| {});
    mark_synchronized(&bridge);

    bridge
        .service
        .handle_mcu_frame(Command::ConsoleWrite.value(), b"hello".to_vec())
        .await;

    let message = find_publish(&bridge, "br/console/out").expect("console publish");
    assert_eq!(message.payload, b"hello");
    assert_eq!(message.message_expiry_interval, Some(10));

    // Implicit ACK echoing the command id.
    let frames = bridge.sink.frames();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].0, Status::Ack.value());
    assert_eq!(frames[0].1[..2], Command::ConsoleWrite.value().to_be_bytes());
}

// ── Scenario: datastore round-trip over MQTT ──────────────────────────────

#[tokio::test]
async fn datastore_put_then_get_serves_cached_value() {
    let bridge = build_bridge(|_| {});
    mark_synchronized(&bridge);

    let put = InboundMessage::new("br/datastore/put/color", Bytes::from_static(b"green"));
    bridge.service.handle_mqtt_message(&put).await;
    let echoed = find_publish(&bridge, "br/datastore/get/color").expect("put echo");
    assert_eq!(echoed.payload, b"green");

    let get = InboundMessage::new("br/datastore/get/color", Bytes::new());
    bridge.service.handle_mqtt_message(&get).await;
    let served = find_publish(&bridge, "br/datastore/get/color").expect("get reply");
    assert_eq!(served.payload, b"green");
    assert!(served
        .user_properties
        .iter()
        .any(|(k, v)| k == "bridge-datastore-key" && v == "color"));
}

#[tokio::test]
async fn datastore_get_miss_with_request_reports_error_property() {
    let bridge = build_bridge(|_| {});
    mark_synchronized(&bridge);

    let get = InboundMessage::new("br/datastore/get/missing/request", Bytes::new());
    bridge.service.handle_mqtt_message(&get).await;
    let reply = find_publish(&bridge, "br/datastore/get/missing").expect("miss reply");
    assert!(reply.payload.is_empty());
    assert!(reply
        .user_properties
        .iter()
        .any(|(k, v)| k == "bridge-error" && v == "datastore-miss"));
}

// ── Scenario: reply rewriting for MQTT 5 requests ─────────────────────────

#[tokio::test]
async fn reply_context_rewrites_topic_and_copies_correlation() {
    let bridge = build_bridge(|_| {});
    mark_synchronized(&bridge);

    let mut inbound =
        InboundMessage::new("br/datastore/get/color/request", Bytes::new());
    inbound.response_topic = Some("client/inbox".into());
    inbound.correlation_data = Some(Bytes::from_static(b"req-77"));
    bridge.service.handle_mqtt_message(&inbound).await;

    let reply = find_publish(&bridge, "client/inbox").expect("rewritten reply");
    assert_eq!(reply.correlation_data.as_deref(), Some(b"req-77".as_slice()));
    assert!(reply
        .user_properties
        .iter()
        .any(|(k, v)| k == "bridge-request-topic" && v == "br/datastore/get/color/request"));
}

// ── Scenario: link loss clears transient state ────────────────────────────

#[tokio::test]
async fn disconnect_clears_pending_reads_and_unpauses_console() {
    let bridge = build_bridge(|_| {});
    mark_synchronized(&bridge);
    {
        let mut state = bridge.service.state.lock().unwrap();
        state.mcu_is_paused = true;
        state.pending_digital_reads.push_back(mcubridge::state::PendingPinRequest {
            pin: 1,
            reply: None,
        });
        state.pending_analog_reads.push_back(mcubridge::state::PendingPinRequest {
            pin: 2,
            reply: None,
        });
    }

    bridge.service.on_serial_disconnected().await;

    let state = bridge.service.state.lock().unwrap();
    assert!(state.pending_digital_reads.is_empty());
    assert!(state.pending_analog_reads.is_empty());
    assert!(!state.mcu_is_paused);
    assert!(!state.link_is_synchronized);
    assert!(!state.serial_link_connected);
}
