//! Mutually-authenticated serial handshake.
//!
//! The link is unusable until synchronized. One attempt walks
//! `Unsynchronized → Resetting → Syncing → Confirming → Synchronized`:
//!
//! 1. `CMD_LINK_RESET` carries the timing window (legacy MCUs reject the
//!    payload; one retry with an empty payload).
//! 2. `CMD_LINK_SYNC` carries `nonce ‖ tag` where the nonce embeds a
//!    monotonic anti-replay counter and the tag is a truncated HMAC-SHA256
//!    under the HKDF-derived key.
//! 3. `CMD_LINK_SYNC_RESP` must echo the nonce with a valid tag and a
//!    counter strictly above the last accepted one.
//!
//! Authentication and length mismatches are immediately fatal; other
//! failures become fatal when the consecutive-failure streak reaches the
//! configured threshold. Nonce and tag buffers are wiped after use.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use serde_json::{json, Map, Value};
use tokio::sync::{oneshot, Notify};

use crate::config::SerialTiming;
use crate::protocol::{
    Command, Status, HANDSHAKE_NONCE_LENGTH, HANDSHAKE_TAG_LENGTH, MAX_PAYLOAD_SIZE,
};
use crate::security;
use crate::services::BridgeContext;
use crate::state::McuCapabilities;

/// Base delay for handshake retry back-off.
const HANDSHAKE_BACKOFF_BASE: Duration = Duration::from_secs(1);
/// Cap for handshake retry back-off.
const HANDSHAKE_BACKOFF_MAX: Duration = Duration::from_secs(60);
/// Payload bytes echoed back in MALFORMED acknowledgements.
const STATUS_PAYLOAD_WINDOW: usize = MAX_PAYLOAD_SIZE - 2;
/// Delay before the first capabilities request after sync.
const CAPABILITIES_DELAY: Duration = Duration::from_secs(2);
/// Capabilities request attempts.
const CAPABILITIES_ATTEMPTS: u32 = 5;

/// Failure reasons that are fatal on first occurrence.
const IMMEDIATE_FATAL_REASONS: [&str; 2] = ["sync_auth_mismatch", "sync_length_mismatch"];

/// Handshake FSM states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkFsmState {
    Unsynchronized,
    Resetting,
    Syncing,
    Confirming,
    Synchronized,
    Fault,
}

impl LinkFsmState {
    pub fn name(self) -> &'static str {
        match self {
            LinkFsmState::Unsynchronized => "unsynchronized",
            LinkFsmState::Resetting => "resetting",
            LinkFsmState::Syncing => "syncing",
            LinkFsmState::Confirming => "confirming",
            LinkFsmState::Synchronized => "synchronized",
            LinkFsmState::Fault => "fault",
        }
    }
}

/// FSM triggers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FsmTrigger {
    StartReset,
    StartSync,
    StartConfirm,
    Complete,
    Fail,
    Reset,
}

/// Transition table: `(from, trigger) → to`. Invalid triggers are ignored.
fn transition(from: LinkFsmState, trigger: FsmTrigger) -> Option<LinkFsmState> {
    use FsmTrigger::*;
    use LinkFsmState::*;
    Some(match (from, trigger) {
        (_, StartReset) => Resetting,
        (Resetting, StartSync) => Syncing,
        (Syncing, StartConfirm) => Confirming,
        (Syncing | Confirming, Complete) => Synchronized,
        (_, Fail) => Fault,
        (_, Reset) => Unsynchronized,
        _ => return None,
    })
}

/// Orchestrates the serial handshake and its telemetry.
pub struct HandshakeManager {
    ctx: BridgeContext,
    timing: SerialTiming,
    fatal_threshold: u32,
    reset_payload: Vec<u8>,
    fsm: StdMutex<LinkFsmState>,
    link_sync: Notify,
    capabilities_tx: StdMutex<Option<oneshot::Sender<Vec<u8>>>>,
}

impl HandshakeManager {
    pub fn new(ctx: BridgeContext, timing: SerialTiming) -> Self {
        let fatal_threshold = ctx.config.serial_handshake_fatal_failures.max(1);
        let reset_payload = timing.encode();
        Self {
            ctx,
            timing,
            fatal_threshold,
            reset_payload,
            fsm: StdMutex::new(LinkFsmState::Unsynchronized),
            link_sync: Notify::new(),
            capabilities_tx: StdMutex::new(None),
        }
    }

    /// Current FSM state.
    pub fn fsm_state(&self) -> LinkFsmState {
        *self.fsm.lock().expect("fsm lock poisoned")
    }

    /// Fatal failure reason recorded so far, if any.
    pub fn fatal_reason(&self) -> Option<String> {
        self.ctx.state.lock().expect("state lock poisoned").handshake_fatal_reason.clone()
    }

    fn apply(&self, trigger: FsmTrigger) {
        let (from, to) = {
            let mut fsm = self.fsm.lock().expect("fsm lock poisoned");
            let from = *fsm;
            let Some(to) = transition(from, trigger) else { return };
            *fsm = to;
            (from, to)
        };
        if from == to {
            return;
        }
        if to == LinkFsmState::Synchronized {
            let mut state = self.ctx.state.lock().expect("state lock poisoned");
            state.link_is_synchronized = true;
            drop(state);
            self.link_sync.notify_waiters();
        } else if from == LinkFsmState::Synchronized {
            let mut state = self.ctx.state.lock().expect("state lock poisoned");
            state.link_is_synchronized = false;
        }
    }

    /// Bring the link up, retrying with back-off until success, a fatal
    /// failure, or the attempt budget is spent. Returns true on sync.
    pub async fn synchronize(self: &Arc<Self>) -> bool {
        self.ctx.flow.reset();

        for attempt in 1..=self.fatal_threshold {
            // Honor any scheduled back-off before touching the wire.
            let wait = {
                let state = self.ctx.state.lock().expect("state lock poisoned");
                state.handshake_backoff_remaining()
            };
            if wait > 0.0 {
                tokio::time::sleep(Duration::from_secs_f64(wait)).await;
            }

            self.apply(FsmTrigger::Reset);
            if self.synchronize_attempt().await {
                return true;
            }
            self.apply(FsmTrigger::Fail);

            if self.fatal_reason().is_some() {
                return false;
            }
            if attempt < self.fatal_threshold {
                let backoff = HANDSHAKE_BACKOFF_BASE
                    .saturating_mul(1 << (attempt - 1).min(16))
                    .min(HANDSHAKE_BACKOFF_MAX);
                log::warn!("Handshake attempt {attempt} failed; retrying in {backoff:?}");
                tokio::time::sleep(backoff).await;
            }
        }
        false
    }

    async fn synchronize_attempt(self: &Arc<Self>) -> bool {
        {
            let mut state = self.ctx.state.lock().expect("state lock poisoned");
            state.record_handshake_attempt();
        }

        self.apply(FsmTrigger::StartReset);

        // Nonce with anti-replay counter; expectations stored for the
        // inbound validation path.
        let nonce = {
            let mut state = self.ctx.state.lock().expect("state lock poisoned");
            let (nonce, new_counter) =
                security::generate_nonce_with_counter(state.link_nonce_counter);
            state.link_nonce_counter = new_counter;
            state.link_handshake_nonce = Some(nonce.to_vec());
            let tag = security::compute_handshake_tag(
                self.ctx.config.serial_shared_secret.as_bytes(),
                &nonce,
            );
            state.link_expected_tag = Some(tag.to_vec());
            nonce
        };

        let mut reset_ok = self
            .ctx
            .send_frame(Command::LinkReset.value(), self.reset_payload.clone())
            .await;
        if !reset_ok && !self.reset_payload.is_empty() {
            // Older MCU builds reject the timing payload; retry bare once.
            log::warn!("LINK_RESET rejected; retrying without timing payload");
            reset_ok = self.ctx.send_frame(Command::LinkReset.value(), Vec::new()).await;
        }
        if !reset_ok {
            self.clear_handshake_expectations();
            self.handle_handshake_failure("link_reset_send_failed", None).await;
            return false;
        }

        self.apply(FsmTrigger::StartSync);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let tag = security::compute_handshake_tag(
            self.ctx.config.serial_shared_secret.as_bytes(),
            &nonce,
        );
        let mut sync_payload = Vec::with_capacity(nonce.len() + tag.len());
        sync_payload.extend_from_slice(&nonce);
        sync_payload.extend_from_slice(&tag);
        let sync_ok = self.ctx.send_frame(Command::LinkSync.value(), sync_payload).await;
        if !sync_ok {
            self.clear_handshake_expectations();
            self.handle_handshake_failure("link_sync_send_failed", None).await;
            return false;
        }

        // The response may already have arrived and faulted us.
        if self.fsm_state() == LinkFsmState::Fault {
            return false;
        }

        self.apply(FsmTrigger::StartConfirm);

        if !self.wait_for_link_sync_confirmation().await {
            if self.fsm_state() == LinkFsmState::Fault {
                return false;
            }
            let pending_matches = {
                let state = self.ctx.state.lock().expect("state lock poisoned");
                state.link_handshake_nonce.as_deref() == Some(nonce.as_slice())
            };
            self.clear_handshake_expectations();
            if pending_matches {
                self.handle_handshake_failure("link_sync_timeout", None).await;
            }
            return false;
        }

        if !matches!(self.fsm_state(), LinkFsmState::Synchronized | LinkFsmState::Fault) {
            self.apply(FsmTrigger::Complete);
        }
        self.fsm_state() == LinkFsmState::Synchronized
    }

    async fn wait_for_link_sync_confirmation(&self) -> bool {
        let timeout = self.timing.response_timeout().max(Duration::from_millis(500));
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.link_sync.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let state = self.ctx.state.lock().expect("state lock poisoned");
                if state.link_is_synchronized {
                    return true;
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            if tokio::time::timeout(remaining, notified).await.is_err() {
                let state = self.ctx.state.lock().expect("state lock poisoned");
                return state.link_is_synchronized;
            }
        }
    }

    /// Validate an inbound `CMD_LINK_SYNC_RESP`.
    pub async fn handle_link_sync_resp(self: &Arc<Self>, payload: &[u8]) -> bool {
        let expected_nonce = {
            let state = self.ctx.state.lock().expect("state lock poisoned");
            state.link_handshake_nonce.clone()
        };
        let Some(expected_nonce) = expected_nonce else {
            log::warn!("Unexpected LINK_SYNC_RESP without pending nonce");
            self.reject_sync_resp(payload, "unexpected_sync_resp", None, false).await;
            return false;
        };

        // Rate limit inbound responses.
        let min_interval = self.ctx.config.serial_handshake_min_interval;
        if min_interval > 0.0 {
            let now = Instant::now();
            let throttled = {
                let mut state = self.ctx.state.lock().expect("state lock poisoned");
                match state.handshake_rate_limit_until {
                    Some(until) if now < until => true,
                    _ => {
                        state.handshake_rate_limit_until =
                            Some(now + Duration::from_secs_f64(min_interval));
                        false
                    }
                }
            };
            if throttled {
                log::warn!("LINK_SYNC_RESP throttled due to rate limit");
                self.reject_sync_resp(payload, "sync_rate_limited", None, false).await;
                return false;
            }
        }

        let required_length = HANDSHAKE_NONCE_LENGTH + HANDSHAKE_TAG_LENGTH;
        if payload.len() != required_length {
            log::warn!(
                "LINK_SYNC_RESP malformed length (expected {required_length} got {})",
                payload.len()
            );
            self.reject_sync_resp(payload, "sync_length_mismatch", None, true).await;
            return false;
        }

        let nonce = &payload[..HANDSHAKE_NONCE_LENGTH];
        let tag = &payload[HANDSHAKE_NONCE_LENGTH..required_length];
        let secret = self.ctx.config.serial_shared_secret.as_bytes();

        let mut nonce_mismatch = nonce != expected_nonce.as_slice();
        let tag_mismatch = !security::verify_handshake_tag(secret, nonce, tag);

        let mut accepted_counter = None;
        if !nonce_mismatch {
            let last = {
                let state = self.ctx.state.lock().expect("state lock poisoned");
                state.link_last_nonce_counter
            };
            match security::validate_nonce_counter(nonce, last) {
                Some(counter) => accepted_counter = Some(counter),
                None => {
                    log::warn!("LINK_SYNC_RESP replay detected (nonce counter too low)");
                    nonce_mismatch = true;
                }
            }
        }

        if nonce_mismatch || tag_mismatch {
            log::warn!("LINK_SYNC_RESP auth mismatch (nonce={})", hex_string(nonce));
            self.reject_sync_resp(
                payload,
                "sync_auth_mismatch",
                Some("nonce_or_tag_mismatch"),
                true,
            )
            .await;
            return false;
        }

        {
            let mut state = self.ctx.state.lock().expect("state lock poisoned");
            if let Some(counter) = accepted_counter {
                state.link_last_nonce_counter = counter;
            }
        }

        self.apply(FsmTrigger::Complete);
        self.clear_handshake_expectations();
        self.handle_handshake_success().await;
        log::info!("MCU link synchronised (nonce={})", hex_string(nonce));

        let manager = Arc::clone(self);
        tokio::spawn(async move { manager.fetch_capabilities_with_delay().await });
        true
    }

    async fn reject_sync_resp(
        self: &Arc<Self>,
        payload: &[u8],
        reason: &str,
        detail: Option<&str>,
        clear: bool,
    ) {
        let echo = payload[..payload.len().min(STATUS_PAYLOAD_WINDOW)].to_vec();
        self.ctx
            .acknowledge_frame(Command::LinkSyncResp.value(), Status::Malformed, &echo)
            .await;
        if clear {
            self.clear_handshake_expectations();
        }
        self.handle_handshake_failure(reason, detail).await;
    }

    /// Record a reset acknowledgement from the MCU.
    pub fn handle_link_reset_resp(&self, payload: &[u8]) {
        log::info!("MCU link reset acknowledged (payload={})", hex_string(payload));
    }

    /// Record and publish a handshake failure; escalates to fatal per
    /// policy.
    pub async fn handle_handshake_failure(&self, reason: &str, detail: Option<&str>) {
        self.apply(FsmTrigger::Fail);

        let immediate = IMMEDIATE_FATAL_REASONS.contains(&reason);
        let (is_fatal, fatal_detail, extra) = {
            let mut state = self.ctx.state.lock().expect("state lock poisoned");
            state.record_handshake_failure(reason);

            let is_fatal = immediate || state.handshake_failure_streak >= self.fatal_threshold;
            let fatal_detail: Option<String> = if is_fatal && !immediate {
                Some(
                    detail
                        .map(str::to_string)
                        .unwrap_or_else(|| {
                            format!("failure_streak_exceeded_{}", self.fatal_threshold)
                        }),
                )
            } else {
                detail.map(str::to_string)
            };
            if is_fatal {
                state.record_handshake_fatal(reason, fatal_detail.as_deref());
                log::error!(
                    "Fatal serial handshake failure reason={reason} detail={}",
                    fatal_detail.as_deref().unwrap_or("")
                );
            }

            // Streak-based back-off; immediate-fatal reasons back off at once.
            let streak_threshold = if immediate { 1 } else { 3 };
            if state.handshake_failure_streak >= streak_threshold {
                let exponent = state.handshake_failure_streak - streak_threshold;
                let delay = HANDSHAKE_BACKOFF_BASE
                    .saturating_mul(1 << exponent.min(16))
                    .min(HANDSHAKE_BACKOFF_MAX);
                state.handshake_backoff_until = Some(Instant::now() + delay);
            }

            let mut extra = Map::new();
            extra.insert(
                "duration_seconds".into(),
                json!((state.handshake_last_duration * 1000.0).round() / 1000.0),
            );
            extra.insert("fatal".into(), json!(is_fatal));
            extra.insert("fatal_count".into(), json!(state.handshake_fatal_count));
            extra.insert("fatal_threshold".into(), json!(self.fatal_threshold));
            (is_fatal, fatal_detail, extra)
        };

        let detail_out = if is_fatal { fatal_detail.as_deref() } else { detail };
        self.publish_handshake_event("failure", Some(reason), detail_out, extra).await;
    }

    async fn handle_handshake_success(&self) {
        let duration = {
            let mut state = self.ctx.state.lock().expect("state lock poisoned");
            state.record_handshake_success();
            state.handshake_last_duration
        };
        let mut extra = Map::new();
        extra.insert("duration_seconds".into(), json!((duration * 1000.0).round() / 1000.0));
        self.publish_handshake_event("success", None, None, extra).await;
    }

    async fn publish_handshake_event(
        &self,
        event: &str,
        reason: Option<&str>,
        detail: Option<&str>,
        extra: Map<String, Value>,
    ) {
        let mut payload = {
            let state = self.ctx.state.lock().expect("state lock poisoned");
            json!({
                "event": event,
                "reason": reason,
                "detail": detail,
                "attempts": state.handshake_attempts,
                "successes": state.handshake_successes,
                "failures": state.handshake_failures,
                "failure_streak": state.handshake_failure_streak,
                "backoff_remaining_seconds": state.handshake_backoff_remaining(),
                "fatal_count": state.handshake_fatal_count,
                "fatal_reason": state.handshake_fatal_reason,
                "fatal_detail": state.handshake_fatal_detail,
                "fatal_unix": state.handshake_fatal_unix,
                "fsm_state": self.fsm_state().name(),
            })
        };
        if let Some(object) = payload.as_object_mut() {
            object.extend(extra);
        }

        let topic =
            crate::protocol::topics::handshake_topic(&self.ctx.config.mqtt_topic);
        let message = crate::mqtt::messages::QueuedPublish::new(
            topic,
            serde_json::to_vec(&payload).unwrap_or_default(),
        )
        .with_content_type("application/json")
        .with_user_property("bridge-event", "handshake");
        self.ctx.enqueue_mqtt(message, None).await;
    }

    /// Wipe the stored nonce and expected tag.
    pub fn clear_handshake_expectations(&self) {
        let mut state = self.ctx.state.lock().expect("state lock poisoned");
        if let Some(mut nonce) = state.link_handshake_nonce.take() {
            security::secure_zero(&mut nonce);
        }
        if let Some(mut tag) = state.link_expected_tag.take() {
            security::secure_zero(&mut tag);
        }
    }

    // ── Capabilities discovery ────────────────────────────────────────────

    async fn fetch_capabilities_with_delay(self: Arc<Self>) {
        tokio::time::sleep(CAPABILITIES_DELAY).await;
        self.fetch_capabilities().await;
    }

    async fn fetch_capabilities(&self) -> bool {
        let timeout = self.timing.response_timeout().max(Duration::from_secs(5));

        for attempt in 0..CAPABILITIES_ATTEMPTS {
            if attempt > 0 {
                // Incrementing waits between attempts.
                tokio::time::sleep(Duration::from_millis(500 + 500 * u64::from(attempt))).await;
            }

            let (tx, rx) = oneshot::channel();
            *self.capabilities_tx.lock().expect("capabilities lock poisoned") = Some(tx);

            if !self.ctx.send_frame(Command::GetCapabilities.value(), Vec::new()).await {
                self.capabilities_tx.lock().expect("capabilities lock poisoned").take();
                continue;
            }

            match tokio::time::timeout(timeout, rx).await {
                Ok(Ok(payload)) => {
                    self.parse_capabilities(&payload);
                    return true;
                }
                _ => {
                    self.capabilities_tx.lock().expect("capabilities lock poisoned").take();
                }
            }
        }
        false
    }

    /// Deliver a `CMD_GET_CAPABILITIES_RESP` payload to the pending fetch.
    pub fn handle_capabilities_resp(&self, payload: &[u8]) {
        if let Some(tx) = self.capabilities_tx.lock().expect("capabilities lock poisoned").take() {
            let _ = tx.send(payload.to_vec());
        }
    }

    fn parse_capabilities(&self, payload: &[u8]) {
        if payload.len() < 8 {
            log::warn!("Failed to unpack capabilities: {} byte(s)", payload.len());
            return;
        }
        let caps = McuCapabilities {
            protocol_version: payload[0],
            board_arch: payload[1],
            num_digital_pins: payload[2],
            num_analog_inputs: payload[3],
            features: u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]),
        };
        let mut state = self.ctx.state.lock().expect("state lock poisoned");
        state.mcu_capabilities = Some(caps);
        log::info!("MCU capabilities: {caps:?}");
    }
}

fn hex_string(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_table_happy_path() {
        use FsmTrigger::*;
        use LinkFsmState::*;
        let mut state = Unsynchronized;
        for (trigger, expected) in [
            (StartReset, Resetting),
            (StartSync, Syncing),
            (StartConfirm, Confirming),
            (Complete, Synchronized),
        ] {
            state = transition(state, trigger).unwrap();
            assert_eq!(state, expected);
        }
    }

    #[test]
    fn invalid_triggers_are_ignored() {
        use FsmTrigger::*;
        use LinkFsmState::*;
        assert_eq!(transition(Unsynchronized, StartSync), None);
        assert_eq!(transition(Unsynchronized, Complete), None);
        assert_eq!(transition(Resetting, StartConfirm), None);
        assert_eq!(transition(Synchronized, Complete), None);
    }

    #[test]
    fn fail_and_reset_work_from_any_state() {
        use FsmTrigger::*;
        use LinkFsmState::*;
        for state in [Unsynchronized, Resetting, Syncing, Confirming, Synchronized, Fault] {
            assert_eq!(transition(state, Fail), Some(Fault));
            assert_eq!(transition(state, Reset), Some(Unsynchronized));
            assert_eq!(transition(state, StartReset), Some(Resetting));
        }
    }

    #[test]
    fn immediate_fatal_reason_classification() {
        assert!(IMMEDIATE_FATAL_REASONS.contains(&"sync_auth_mismatch"));
        assert!(IMMEDIATE_FATAL_REASONS.contains(&"sync_length_mismatch"));
        assert!(!IMMEDIATE_FATAL_REASONS.contains(&"link_sync_timeout"));
    }

    #[test]
    fn sync_resp_length_requirement() {
        assert_eq!(HANDSHAKE_NONCE_LENGTH + HANDSHAKE_TAG_LENGTH, 32);
    }
}
