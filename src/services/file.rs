//! File component: quota-tracked storage under a confined root.
//!
//! Path normalization rejects absolute paths, `..` components, backslashes
//! and anything resolving outside `file_system_root`. Writes append (the
//! 64-byte frame limit means large files arrive as chunk sequences) and are
//! gated by a per-write limit and a storage quota; reads stream back as
//! length-prefixed `CMD_FILE_READ_RESP` frames. Usage is seeded once by a
//! bounded-depth directory walk that skips symlinks.
//!
//! Writes that land outside volatile storage log a `FLASH WEAR WARNING`;
//! the config validator already refuses such roots at startup unless
//! explicitly overridden.

use std::path::{Component, Path, PathBuf};

use anyhow::Result;
use tokio::sync::Mutex;

use super::{BridgeContext, EXPIRY_SHELL};
use crate::config::VOLATILE_STORAGE_PATHS;
use crate::mqtt::messages::{InboundMessage, QueuedPublish};
use crate::protocol::{
    self, encode_status_reason, topics, Command, Status, MAX_PAYLOAD_SIZE,
};

/// Maximum depth for the quota seeding walk.
const QUOTA_SCAN_MAX_DEPTH: usize = 10;
/// systemd's private temp directories are not ours to count.
const SYSTEMD_PRIVATE_PREFIX: &str = "systemd-private";

/// File operation outcome: `(success, content, reason)`.
type FileOutcome = (bool, Option<Vec<u8>>, Option<String>);

pub struct FileComponent {
    ctx: BridgeContext,
    /// Serializes quota checks against writes and removals.
    storage_lock: Mutex<()>,
}

impl FileComponent {
    pub fn new(ctx: BridgeContext) -> Self {
        let component = Self { ctx, storage_lock: Mutex::new(()) };
        component.seed_usage();
        component
    }

    // ── MCU handlers ──────────────────────────────────────────────────────

    /// `CMD_FILE_WRITE` payload: `path_len:u8 ‖ path ‖ data`.
    pub async fn handle_write(&self, payload: &[u8]) -> Result<bool> {
        let Some((path, data)) = parse_path_payload(payload) else {
            log::warn!("Invalid file write payload ({} bytes)", payload.len());
            return Ok(false);
        };

        // Fail fast on blatant traversal before touching storage.
        if path.starts_with('/') || path.split('/').any(|part| part == "..") {
            log::warn!("Security: path traversal attempt blocked: {path}");
            self.ctx
                .send_frame(
                    Status::Error.value(),
                    encode_status_reason(protocol::STATUS_REASON_INVALID_PATH),
                )
                .await;
            return Ok(false);
        }

        let (success, _, reason) = self.perform_operation("write", &path, Some(&data)).await;
        if success {
            self.ctx.send_frame(Status::Ok.value(), Vec::new()).await;
            return Ok(true);
        }
        self.ctx
            .send_frame(
                Status::Error.value(),
                encode_status_reason(
                    reason.as_deref().unwrap_or(protocol::STATUS_REASON_WRITE_FAILED),
                ),
            )
            .await;
        Ok(false)
    }

    /// `CMD_FILE_READ`: stream the file back as `length:u16 ‖ chunk` frames.
    pub async fn handle_read(&self, payload: &[u8]) -> Result<bool> {
        let Some((path, _)) = parse_path_payload(payload) else {
            log::warn!("Invalid file read payload ({} bytes)", payload.len());
            return Ok(false);
        };

        let (success, content, reason) = self.perform_operation("read", &path, None).await;
        if !success {
            self.ctx
                .send_frame(
                    Status::Error.value(),
                    encode_status_reason(
                        reason.as_deref().unwrap_or(protocol::STATUS_REASON_READ_FAILED),
                    ),
                )
                .await;
            return Ok(false);
        }

        let data = content.unwrap_or_default();
        let max_chunk = MAX_PAYLOAD_SIZE - 2;

        if data.is_empty() {
            self.ctx
                .send_frame(Command::FileReadResp.value(), 0u16.to_be_bytes().to_vec())
                .await;
            return Ok(true);
        }

        for chunk in data.chunks(max_chunk) {
            let mut response = (chunk.len() as u16).to_be_bytes().to_vec();
            response.extend_from_slice(chunk);
            self.ctx.send_frame(Command::FileReadResp.value(), response).await;
        }
        Ok(true)
    }

    /// `CMD_FILE_REMOVE`.
    pub async fn handle_remove(&self, payload: &[u8]) -> Result<bool> {
        let Some((path, _)) = parse_path_payload(payload) else {
            log::warn!("Invalid file remove payload ({} bytes)", payload.len());
            return Ok(false);
        };

        let (success, _, reason) = self.perform_operation("remove", &path, None).await;
        if success {
            self.ctx.send_frame(Status::Ok.value(), Vec::new()).await;
            return Ok(true);
        }
        self.ctx
            .send_frame(
                Status::Error.value(),
                encode_status_reason(
                    reason.as_deref().unwrap_or(protocol::STATUS_REASON_REMOVE_FAILED),
                ),
            )
            .await;
        Ok(false)
    }

    // ── MQTT handler ──────────────────────────────────────────────────────

    /// MQTT `file/{read,write,remove}/<path>`.
    pub async fn handle_mqtt(
        &self,
        action: &str,
        path_parts: &[String],
        payload: &[u8],
        inbound: &InboundMessage,
    ) {
        let filename = path_parts.join("/");
        if filename.is_empty() {
            log::warn!("MQTT file action missing filename for {action}");
            return;
        }

        match action {
            "write" => {
                let (success, _, reason) =
                    self.perform_operation("write", &filename, Some(payload)).await;
                if !success {
                    log::error!(
                        "MQTT file write failed for {filename}: {}",
                        reason.as_deref().unwrap_or("unknown_reason")
                    );
                }
            }
            "read" => {
                let (success, content, reason) =
                    self.perform_operation("read", &filename, None).await;
                if !success {
                    log::error!(
                        "MQTT file read failed for {filename}: {}",
                        reason.as_deref().unwrap_or("unknown_reason")
                    );
                    return;
                }
                let mut segments: Vec<&str> = vec!["read", topics::SUFFIX_RESPONSE];
                let path_segments: Vec<&str> =
                    filename.split('/').filter(|s| !s.is_empty()).collect();
                segments.extend(path_segments);
                let topic = topics::topic_path(
                    &self.ctx.config.mqtt_topic,
                    topics::Topic::File,
                    &segments,
                );
                let message = QueuedPublish::new(topic, content.unwrap_or_default())
                    .with_expiry(EXPIRY_SHELL)
                    .with_user_property("bridge-file-path", &filename);
                self.ctx.enqueue_mqtt(message, Some(inbound)).await;
            }
            "remove" => {
                let (success, _, reason) =
                    self.perform_operation("remove", &filename, None).await;
                if !success {
                    log::error!(
                        "MQTT file remove failed for {filename}: {}",
                        reason.as_deref().unwrap_or("unknown_reason")
                    );
                }
            }
            other => log::debug!("Ignoring unknown file action '{other}'"),
        }
    }

    // ── Storage engine ────────────────────────────────────────────────────

    async fn perform_operation(
        &self,
        operation: &str,
        filename: &str,
        data: Option<&[u8]>,
    ) -> FileOutcome {
        let Some(safe_path) = self.safe_path(filename) else {
            log::warn!("File operation rejected due to unsafe path: {filename}");
            return (false, None, Some("unsafe_path".into()));
        };

        match operation {
            "write" => {
                let data = data.unwrap_or_default().to_vec();
                self.write_with_quota(safe_path, data).await
            }
            "read" => {
                let read =
                    tokio::task::spawn_blocking(move || std::fs::read(&safe_path)).await;
                match read {
                    Ok(Ok(content)) => {
                        log::info!("Read {} bytes from {filename}", content.len());
                        (true, Some(content), Some("ok".into()))
                    }
                    Ok(Err(err)) => {
                        log::error!("Failed to read file {filename}: {err}");
                        (false, None, Some(err.to_string()))
                    }
                    Err(err) => (false, None, Some(err.to_string())),
                }
            }
            "remove" => self.remove_with_tracking(safe_path).await,
            other => (false, None, Some(format!("unknown_operation_{other}"))),
        }
    }

    async fn write_with_quota(&self, path: PathBuf, data: Vec<u8>) -> FileOutcome {
        // Flash-wear advisory; the config validator is the hard gate.
        let volatile = VOLATILE_STORAGE_PATHS
            .iter()
            .any(|prefix| path.starts_with(prefix));
        if !volatile {
            log::warn!(
                "FLASH WEAR WARNING: Writing to non-volatile storage: {}. \
                 This may damage the device flash memory. Use /tmp or /mnt.",
                path.display()
            );
        }

        let payload_size = data.len();
        let _guard = self.storage_lock.lock().await;

        let (limit, quota, current_usage) = {
            let state = self.ctx.state.lock().expect("state lock poisoned");
            (
                state.file_write_max_bytes.max(1),
                state.file_storage_quota_bytes.max(state.file_write_max_bytes),
                state.file_storage_bytes_used,
            )
        };

        if payload_size > limit {
            let mut state = self.ctx.state.lock().expect("state lock poisoned");
            state.file_write_limit_rejections += 1;
            log::warn!(
                "Rejecting {payload_size}-byte file write to {}: exceeds per-write limit of {limit} byte(s).",
                path.display()
            );
            return (false, None, Some("write_limit_exceeded".into()));
        }

        // Writes append, so the projected usage grows by the full payload.
        let projected = current_usage + payload_size;
        if projected > quota {
            let mut state = self.ctx.state.lock().expect("state lock poisoned");
            state.file_storage_limit_rejections += 1;
            log::warn!(
                "Rejecting file write to {}: projected usage {projected} byte(s) exceeds quota of {quota} byte(s).",
                path.display()
            );
            return (false, None, Some("storage_quota_exceeded".into()));
        }

        let write_path = path.clone();
        let result = tokio::task::spawn_blocking(move || append_file(&write_path, &data)).await;
        match result {
            Ok(Ok(())) => {
                let mut state = self.ctx.state.lock().expect("state lock poisoned");
                state.file_storage_bytes_used = projected;
                log::info!("Wrote {payload_size} bytes to {}", path.display());
                (true, None, Some("ok".into()))
            }
            Ok(Err(err)) => {
                log::error!("Failed to write file {}: {err}", path.display());
                (false, None, Some(err.to_string()))
            }
            Err(err) => (false, None, Some(err.to_string())),
        }
    }

    async fn remove_with_tracking(&self, path: PathBuf) -> FileOutcome {
        let _guard = self.storage_lock.lock().await;
        let removed_bytes = existing_file_size(&path);

        let remove_path = path.clone();
        let result =
            tokio::task::spawn_blocking(move || std::fs::remove_file(&remove_path)).await;
        match result {
            Ok(Ok(())) => {
                let mut state = self.ctx.state.lock().expect("state lock poisoned");
                state.file_storage_bytes_used =
                    state.file_storage_bytes_used.saturating_sub(removed_bytes);
                log::info!("Removed file {}", path.display());
                (true, None, Some("ok".into()))
            }
            Ok(Err(err)) => {
                log::error!("Failed to remove file {}: {err}", path.display());
                (false, None, Some(err.to_string()))
            }
            Err(err) => (false, None, Some(err.to_string())),
        }
    }

    fn safe_path(&self, filename: &str) -> Option<PathBuf> {
        let base_dir = self.base_dir()?;
        let normalised = normalise_filename(filename)?;

        let candidate = base_dir.join(&normalised);
        // Resolve what exists; the file itself may not yet.
        let resolved_parent = candidate
            .parent()
            .and_then(|parent| parent.canonicalize().ok())
            .unwrap_or_else(|| base_dir.clone());
        let resolved_base = base_dir.canonicalize().unwrap_or(base_dir);
        if !resolved_parent.starts_with(&resolved_base) {
            log::warn!(
                "Path traversal blocked. filename='{filename}', resolved='{}', base='{}'",
                resolved_parent.display(),
                resolved_base.display()
            );
            return None;
        }
        Some(candidate)
    }

    fn base_dir(&self) -> Option<PathBuf> {
        let (root, allow_non_tmp) = {
            let state = self.ctx.state.lock().expect("state lock poisoned");
            (state.file_system_root.clone(), state.allow_non_tmp_paths)
        };
        let base = PathBuf::from(root);

        if !allow_non_tmp {
            let volatile = VOLATILE_STORAGE_PATHS
                .iter()
                .any(|prefix| base.starts_with(prefix));
            if !volatile {
                log::warn!(
                    "FLASH PROTECTION: Rejecting file_system_root outside /tmp: {}",
                    base.display()
                );
                return None;
            }
        }

        if let Err(err) = std::fs::create_dir_all(&base) {
            log::error!("Failed to create base directory for files {}: {err}", base.display());
            return None;
        }
        Some(base)
    }

    /// One-shot usage seeding at construction.
    fn seed_usage(&self) {
        let Some(base) = self.base_dir() else {
            let mut state = self.ctx.state.lock().expect("state lock poisoned");
            state.file_storage_bytes_used = 0;
            return;
        };
        let usage = scan_directory_size(&base, QUOTA_SCAN_MAX_DEPTH);
        let mut state = self.ctx.state.lock().expect("state lock poisoned");
        state.file_storage_bytes_used = usage;
    }
}

fn append_file(path: &Path, data: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    use std::io::Write;
    let mut file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(data)
}

fn existing_file_size(path: &Path) -> usize {
    std::fs::metadata(path).map(|meta| meta.len() as usize).unwrap_or(0)
}

/// Normalise an inbound filename to a safe relative path.
fn normalise_filename(filename: &str) -> Option<PathBuf> {
    let stripped = filename.replace('\\', "/");
    let stripped = stripped.trim();
    if stripped.is_empty() {
        return None;
    }

    let without_root = stripped.trim_start_matches('/');
    let mut cleaned = PathBuf::new();
    for component in Path::new(without_root).components() {
        match component {
            Component::Normal(part) => {
                let part_str = part.to_str()?;
                if part_str.contains('\0') {
                    return None;
                }
                cleaned.push(part_str);
            }
            Component::CurDir => {}
            _ => return None,
        }
    }

    if cleaned.as_os_str().is_empty() {
        return None;
    }
    Some(cleaned)
}

/// Iterative bounded-depth directory size scan; symlinks are skipped, as are
/// systemd's private temp directories at the /tmp root.
fn scan_directory_size(root: &Path, max_depth: usize) -> usize {
    let mut total = 0usize;
    let mut stack: Vec<(PathBuf, usize)> = vec![(root.to_path_buf(), 0)];

    while let Some((current, depth)) = stack.pop() {
        if depth > max_depth {
            continue;
        }
        let entries = match std::fs::read_dir(&current) {
            Ok(entries) => entries,
            Err(err) => {
                if err.kind() != std::io::ErrorKind::NotFound {
                    log::warn!("Unable to scan {} for quota tracking: {err}", current.display());
                }
                continue;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let Ok(file_type) = entry.file_type() else { continue };
            if file_type.is_symlink() {
                continue;
            }
            if current == Path::new("/tmp")
                && entry.file_name().to_string_lossy().starts_with(SYSTEMD_PRIVATE_PREFIX)
            {
                continue;
            }
            if file_type.is_dir() {
                stack.push((path, depth + 1));
            } else if file_type.is_file() {
                if let Ok(meta) = entry.metadata() {
                    total += meta.len() as usize;
                }
            }
        }
    }
    total
}

/// Parse `path_len:u8 ‖ path ‖ rest`.
fn parse_path_payload(payload: &[u8]) -> Option<(String, Vec<u8>)> {
    let path_len = *payload.first()? as usize;
    if path_len == 0 {
        return None;
    }
    let path = payload.get(1..1 + path_len)?;
    let path = std::str::from_utf8(path).ok()?;
    let rest = payload.get(1 + path_len..).unwrap_or_default();
    Some((path.to_string(), rest.to_vec()))
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_payload_parses_path_and_data() {
        let mut payload = vec![4u8];
        payload.extend_from_slice(b"a.tx");
        payload.extend_from_slice(b"hello");
        let (path, data) = parse_path_payload(&payload).unwrap();
        assert_eq!(path, "a.tx");
        assert_eq!(data, b"hello");
    }

    #[test]
    fn path_payload_rejects_bad_lengths() {
        assert!(parse_path_payload(&[]).is_none());
        assert!(parse_path_payload(&[0]).is_none());
        assert!(parse_path_payload(&[5, b'a']).is_none());
    }

    #[test]
    fn normalise_accepts_relative_paths() {
        assert_eq!(normalise_filename("logs/today.txt").unwrap(), PathBuf::from("logs/today.txt"));
        assert_eq!(normalise_filename("./a/./b").unwrap(), PathBuf::from("a/b"));
        // Absolute paths are re-rooted relative to the base.
        assert_eq!(normalise_filename("/abs/file").unwrap(), PathBuf::from("abs/file"));
    }

    #[test]
    fn normalise_rejects_traversal_and_garbage() {
        assert!(normalise_filename("../etc/passwd").is_none());
        assert!(normalise_filename("a/../../b").is_none());
        assert!(normalise_filename("").is_none());
        assert!(normalise_filename("   ").is_none());
        assert!(normalise_filename("a\\..\\b").is_none());
    }

    #[test]
    fn scan_counts_files_and_skips_symlinks() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.bin"), vec![0u8; 100]).unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/b.bin"), vec![0u8; 50]).unwrap();
        #[cfg(unix)]
        std::os::unix::fs::symlink(dir.path().join("a.bin"), dir.path().join("link.bin")).unwrap();

        assert_eq!(scan_directory_size(dir.path(), 10), 150);
    }

    #[test]
    fn scan_respects_depth_limit() {
        let dir = tempfile::tempdir().unwrap();
        let mut deep = dir.path().to_path_buf();
        for level in 0..4 {
            deep = deep.join(format!("d{level}"));
        }
        std::fs::create_dir_all(&deep).unwrap();
        std::fs::write(deep.join("deep.bin"), vec![0u8; 10]).unwrap();
        assert_eq!(scan_directory_size(dir.path(), 10), 10);
        assert_eq!(scan_directory_size(dir.path(), 2), 0);
    }
}
