//! Configuration loading and validation.
//!
//! The daemon consumes a JSON config file plus `MCUBRIDGE_*` environment
//! overrides. Validation enforces the safety rules the rest of the code
//! relies on: shared-secret strength, flash-protection path confinement,
//! and cross-field queue/quota consistency. A config that fails validation
//! prevents the daemon from starting.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::policy::TopicAuthorization;
use crate::protocol::{
    self, DEFAULT_BAUDRATE, DEFAULT_RETRY_LIMIT, HANDSHAKE_ACK_TIMEOUT_MAX_MS,
    HANDSHAKE_ACK_TIMEOUT_MIN_MS, HANDSHAKE_RESPONSE_TIMEOUT_MAX_MS,
    HANDSHAKE_RESPONSE_TIMEOUT_MIN_MS, HANDSHAKE_RETRY_LIMIT_MAX, HANDSHAKE_RETRY_LIMIT_MIN,
};

/// Paths considered volatile (RAM-backed) on the target.
pub const VOLATILE_STORAGE_PATHS: [&str; 2] = ["/tmp", "/mnt"];

/// Minimum accepted shared-secret length in bytes.
pub const MIN_SERIAL_SHARED_SECRET_LEN: usize = 8;

/// Serial retry/response windows shared with the MCU during link reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SerialTiming {
    pub ack_timeout_ms: u16,
    pub response_timeout_ms: u32,
    pub retry_limit: u8,
}

impl SerialTiming {
    /// Ack window as a duration.
    pub fn ack_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(u64::from(self.ack_timeout_ms))
    }

    /// Response window as a duration.
    pub fn response_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(u64::from(self.response_timeout_ms))
    }

    /// Wire payload for `CMD_LINK_RESET`:
    /// `ack_timeout_ms:u16 ‖ retry_limit:u8 ‖ response_timeout_ms:u32`.
    pub fn encode(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(7);
        payload.extend_from_slice(&self.ack_timeout_ms.to_be_bytes());
        payload.push(self.retry_limit);
        payload.extend_from_slice(&self.response_timeout_ms.to_be_bytes());
        payload
    }
}

/// Strongly typed configuration for the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    // Serial link
    pub serial_port: String,
    pub serial_baud: u32,
    /// Shared secret authenticating the serial handshake. NOT serialized
    /// back out; configure via file or MCUBRIDGE_SERIAL_SECRET.
    #[serde(skip_serializing)]
    pub serial_shared_secret: String,
    /// Ack window in seconds.
    pub serial_retry_timeout: f64,
    /// Response window in seconds; clamped to at least twice the ack window.
    pub serial_response_timeout: f64,
    pub serial_retry_attempts: u8,
    /// Minimum gap between inbound handshake responses, seconds.
    pub serial_handshake_min_interval: f64,
    /// Consecutive failures before a handshake failure becomes fatal.
    pub serial_handshake_fatal_failures: u32,

    // MQTT broker
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_user: Option<String>,
    pub mqtt_pass: Option<String>,
    pub mqtt_tls: bool,
    pub mqtt_tls_insecure: bool,
    pub mqtt_cafile: Option<String>,
    pub mqtt_certfile: Option<String>,
    pub mqtt_keyfile: Option<String>,
    pub mqtt_topic: String,
    pub mqtt_queue_limit: usize,
    pub mqtt_spool_dir: String,
    pub mqtt_spool_limit: usize,
    pub reconnect_delay: u64,

    // Components
    pub allowed_commands: Vec<String>,
    pub topic_authorization: TopicAuthorization,
    pub file_system_root: String,
    pub allow_non_tmp_paths: bool,
    pub file_write_max_bytes: usize,
    pub file_storage_quota_bytes: usize,
    pub console_queue_limit_bytes: usize,
    pub mailbox_queue_limit: usize,
    pub mailbox_queue_bytes_limit: usize,
    pub pending_pin_request_limit: usize,
    pub process_timeout: u64,
    pub process_max_output_bytes: usize,
    pub process_max_concurrent: usize,

    // Periodic bridge snapshots (seconds; 0 disables)
    pub bridge_summary_interval: f64,
    pub bridge_handshake_interval: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            serial_port: "/dev/ttyATH0".into(),
            serial_baud: DEFAULT_BAUDRATE,
            serial_shared_secret: String::new(),
            serial_retry_timeout: 0.2,
            serial_response_timeout: 2.0,
            serial_retry_attempts: DEFAULT_RETRY_LIMIT,
            serial_handshake_min_interval: 1.0,
            serial_handshake_fatal_failures: 5,

            mqtt_host: "localhost".into(),
            mqtt_port: 8883,
            mqtt_user: None,
            mqtt_pass: None,
            mqtt_tls: true,
            mqtt_tls_insecure: false,
            mqtt_cafile: None,
            mqtt_certfile: None,
            mqtt_keyfile: None,
            mqtt_topic: protocol::topics::DEFAULT_TOPIC_PREFIX.into(),
            mqtt_queue_limit: 128,
            mqtt_spool_dir: "/tmp/mcubridge/spool".into(),
            mqtt_spool_limit: 512,
            reconnect_delay: 5,

            allowed_commands: Vec::new(),
            topic_authorization: TopicAuthorization::default(),
            file_system_root: "/tmp/mcubridge/files".into(),
            allow_non_tmp_paths: false,
            file_write_max_bytes: 4096,
            file_storage_quota_bytes: 262_144,
            console_queue_limit_bytes: 16_384,
            mailbox_queue_limit: 32,
            mailbox_queue_bytes_limit: 16_384,
            pending_pin_request_limit: 8,
            process_timeout: 30,
            process_max_output_bytes: 65_536,
            process_max_concurrent: 4,

            bridge_summary_interval: 0.0,
            bridge_handshake_interval: 0.0,
        }
    }
}

impl Config {
    /// Load from an optional file path, apply env overrides, validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let content = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config file {}", path.display()))?;
                serde_json::from_str(&content)
                    .with_context(|| format!("Failed to parse config file {}", path.display()))?
            }
            None => Self::default(),
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(port) = std::env::var("MCUBRIDGE_SERIAL_PORT") {
            self.serial_port = port;
        }
        if let Ok(secret) = std::env::var("MCUBRIDGE_SERIAL_SECRET") {
            self.serial_shared_secret = secret;
        }
        if let Ok(host) = std::env::var("MCUBRIDGE_MQTT_HOST") {
            self.mqtt_host = host;
        }
        if let Ok(port) = std::env::var("MCUBRIDGE_MQTT_PORT") {
            if let Ok(parsed) = port.parse() {
                self.mqtt_port = parsed;
            }
        }
        if let Ok(topic) = std::env::var("MCUBRIDGE_MQTT_TOPIC") {
            self.mqtt_topic = topic;
        }
        if let Ok(dir) = std::env::var("MCUBRIDGE_SPOOL_DIR") {
            self.mqtt_spool_dir = dir;
        }
        if let Ok(root) = std::env::var("MCUBRIDGE_FILE_ROOT") {
            self.file_system_root = root;
        }
    }

    /// Enforce the safety rules; clamps the response timeout upward.
    pub fn validate(&mut self) -> Result<()> {
        // Shared secret strength.
        let secret = self.serial_shared_secret.as_bytes();
        if secret.is_empty() {
            bail!("serial_shared_secret must be configured");
        }
        if secret.len() < MIN_SERIAL_SHARED_SECRET_LEN {
            bail!(
                "serial_shared_secret must be at least {} bytes",
                MIN_SERIAL_SHARED_SECRET_LEN
            );
        }
        if secret == b"changeme123" {
            bail!("serial_shared_secret placeholder is insecure");
        }
        let distinct: std::collections::HashSet<u8> = secret.iter().copied().collect();
        if distinct.len() < 4 {
            bail!("serial_shared_secret must contain at least four distinct bytes");
        }

        // Topic prefix: non-empty segmented path.
        let segments: Vec<&str> = self
            .mqtt_topic
            .split('/')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect();
        if segments.is_empty() {
            bail!("mqtt_topic must contain at least one segment");
        }
        self.mqtt_topic = segments.join("/");

        // Clamp the response window upward.
        self.serial_response_timeout =
            self.serial_response_timeout.max(self.serial_retry_timeout * 2.0);

        // Cross-field limits.
        if self.file_storage_quota_bytes < self.file_write_max_bytes {
            bail!("file_storage_quota_bytes must be greater than or equal to file_write_max_bytes");
        }
        if self.mailbox_queue_bytes_limit < self.mailbox_queue_limit {
            bail!("mailbox_queue_bytes_limit must be greater than or equal to mailbox_queue_limit");
        }

        // Flash protection: the spool must live in RAM-backed /tmp.
        self.mqtt_spool_dir = absolute_path(&self.mqtt_spool_dir);
        if !is_under(&self.mqtt_spool_dir, "/tmp") {
            bail!("FLASH PROTECTION: mqtt_spool_dir must resolve under /tmp");
        }

        self.file_system_root = absolute_path(&self.file_system_root);
        if !self.allow_non_tmp_paths {
            let volatile = VOLATILE_STORAGE_PATHS
                .iter()
                .any(|prefix| is_under(&self.file_system_root, prefix));
            if !volatile {
                bail!("FLASH PROTECTION: file_system_root must be in a volatile location");
            }
        }

        if !self.mqtt_tls {
            log::warn!(
                "MQTT TLS is disabled; MQTT credentials and payloads will be sent in plaintext."
            );
        } else if self.mqtt_tls_insecure {
            log::warn!(
                "MQTT TLS certificate verification is disabled (mqtt_tls_insecure); \
                 use only for known/self-hosted brokers."
            );
        } else if self.mqtt_cafile.is_none() {
            bail!("mqtt_cafile is required when mqtt_tls is enabled");
        }

        Ok(())
    }

    /// Derive the serial timing window, validated against protocol bounds.
    pub fn derive_serial_timing(&self) -> Result<SerialTiming> {
        let ack_ms = (self.serial_retry_timeout * 1000.0).round() as u64;
        let mut response_ms = (self.serial_response_timeout * 1000.0).round() as u64;
        response_ms = response_ms.max(ack_ms);
        let retry_limit = self.serial_retry_attempts;

        if !(u64::from(HANDSHAKE_ACK_TIMEOUT_MIN_MS)..=u64::from(HANDSHAKE_ACK_TIMEOUT_MAX_MS))
            .contains(&ack_ms)
        {
            bail!(
                "serial_retry_timeout {}ms outside protocol bounds {}..={}ms",
                ack_ms,
                HANDSHAKE_ACK_TIMEOUT_MIN_MS,
                HANDSHAKE_ACK_TIMEOUT_MAX_MS
            );
        }
        if !(u64::from(HANDSHAKE_RESPONSE_TIMEOUT_MIN_MS)
            ..=u64::from(HANDSHAKE_RESPONSE_TIMEOUT_MAX_MS))
            .contains(&response_ms)
        {
            bail!(
                "serial_response_timeout {}ms outside protocol bounds {}..={}ms",
                response_ms,
                HANDSHAKE_RESPONSE_TIMEOUT_MIN_MS,
                HANDSHAKE_RESPONSE_TIMEOUT_MAX_MS
            );
        }
        if !(HANDSHAKE_RETRY_LIMIT_MIN..=HANDSHAKE_RETRY_LIMIT_MAX).contains(&retry_limit) {
            bail!(
                "serial_retry_attempts {} outside protocol bounds {}..={}",
                retry_limit,
                HANDSHAKE_RETRY_LIMIT_MIN,
                HANDSHAKE_RETRY_LIMIT_MAX
            );
        }

        Ok(SerialTiming {
            ack_timeout_ms: ack_ms as u16,
            response_timeout_ms: response_ms as u32,
            retry_limit,
        })
    }
}

fn absolute_path(path: &str) -> String {
    let p = PathBuf::from(path.trim());
    let absolute = if p.is_absolute() {
        p
    } else {
        std::env::current_dir().map(|cwd| cwd.join(&p)).unwrap_or(p)
    };
    // Resolve symlinks when possible; the directory may not exist yet.
    std::fs::canonicalize(&absolute)
        .unwrap_or(absolute)
        .to_string_lossy()
        .into_owned()
}

fn is_under(path: &str, prefix: &str) -> bool {
    path == prefix || path.starts_with(&format!("{prefix}/"))
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        let mut config = Config::default();
        config.serial_shared_secret = "unit-test-secret".into();
        config.mqtt_tls = false;
        config
    }

    #[test]
    fn default_config_requires_secret() {
        let mut config = Config::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn valid_config_passes() {
        let mut config = valid_config();
        config.validate().unwrap();
        assert_eq!(config.mqtt_topic, "br");
    }

    #[test]
    fn short_secret_rejected() {
        let mut config = valid_config();
        config.serial_shared_secret = "short".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn placeholder_secret_rejected() {
        let mut config = valid_config();
        config.serial_shared_secret = "changeme123".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn low_entropy_secret_rejected() {
        let mut config = valid_config();
        config.serial_shared_secret = "aaaabbbb".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn response_timeout_clamped_upward() {
        let mut config = valid_config();
        config.serial_retry_timeout = 0.5;
        config.serial_response_timeout = 0.1;
        config.validate().unwrap();
        assert!((config.serial_response_timeout - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn quota_must_cover_single_write() {
        let mut config = valid_config();
        config.file_write_max_bytes = 1024;
        config.file_storage_quota_bytes = 512;
        assert!(config.validate().is_err());
    }

    #[test]
    fn mailbox_byte_limit_must_cover_item_limit() {
        let mut config = valid_config();
        config.mailbox_queue_limit = 100;
        config.mailbox_queue_bytes_limit = 50;
        assert!(config.validate().is_err());
    }

    #[test]
    fn spool_dir_outside_tmp_rejected() {
        let mut config = valid_config();
        config.mqtt_spool_dir = "/var/spool/mcubridge".into();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("FLASH PROTECTION"));
    }

    #[test]
    fn file_root_outside_tmp_rejected_without_override() {
        let mut config = valid_config();
        config.file_system_root = "/etc".into();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("FLASH PROTECTION"));

        let mut config = valid_config();
        config.file_system_root = "/etc".into();
        config.allow_non_tmp_paths = true;
        config.validate().unwrap();
    }

    #[test]
    fn topic_prefix_normalized() {
        let mut config = valid_config();
        config.mqtt_topic = "/site//dev/".into();
        config.validate().unwrap();
        assert_eq!(config.mqtt_topic, "site/dev");

        let mut config = valid_config();
        config.mqtt_topic = "///".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn tls_requires_cafile_unless_insecure() {
        let mut config = valid_config();
        config.mqtt_tls = true;
        assert!(config.validate().is_err());

        let mut config = valid_config();
        config.mqtt_tls = true;
        config.mqtt_tls_insecure = true;
        config.validate().unwrap();
    }

    #[test]
    fn serial_timing_derivation_and_bounds() {
        let mut config = valid_config();
        config.validate().unwrap();
        let timing = config.derive_serial_timing().unwrap();
        assert_eq!(timing.ack_timeout_ms, 200);
        assert_eq!(timing.response_timeout_ms, 2000);
        assert_eq!(timing.retry_limit, DEFAULT_RETRY_LIMIT);

        let mut config = valid_config();
        config.serial_retry_timeout = 0.001;
        config.validate().unwrap();
        assert!(config.derive_serial_timing().is_err());
    }

    #[test]
    fn timing_payload_layout() {
        let timing =
            SerialTiming { ack_timeout_ms: 0x0102, response_timeout_ms: 0x03040506, retry_limit: 7 };
        assert_eq!(timing.encode(), vec![0x01, 0x02, 7, 0x03, 0x04, 0x05, 0x06]);
    }

    #[test]
    fn config_file_round_trip() {
        let mut config = valid_config();
        config.validate().unwrap();
        let json = serde_json::to_string_pretty(&config).unwrap();
        // Secret is never serialized.
        assert!(!json.contains("unit-test-secret"));
        let reloaded: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(reloaded.mqtt_topic, config.mqtt_topic);
        assert!(reloaded.serial_shared_secret.is_empty());
    }
}
