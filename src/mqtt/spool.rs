//! Durable FIFO spool for MQTT publish envelopes.
//!
//! Two backends: a file-backed deque (one record per file under the spool
//! directory) and an in-memory deque fallback. File names are zero-padded
//! monotonic decimals so lexical order equals FIFO order; the starting index
//! leaves headroom for `append_front` on requeue. The spool degrades to
//! memory-only when the directory is not under `/tmp` (flash protection),
//! when initialization fails, or when any disk operation errors; the
//! degradation reason is retained and reactivation is retried with
//! exponential back-off.
//!
//! Safe to call from the blocking pool: all state sits behind an internal
//! mutex and every method is synchronous.

use std::collections::VecDeque;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde_json::{json, Value};

use super::messages::QueuedPublish;
use crate::state::unix_now;

/// Minimum delay before a disk reactivation attempt.
pub const SPOOL_BACKOFF_MIN: Duration = Duration::from_secs(5);
/// Maximum delay between disk reactivation attempts.
pub const SPOOL_BACKOFF_MAX: Duration = Duration::from_secs(300);

/// Observable spool counters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SpoolSnapshot {
    pub pending: usize,
    pub limit: usize,
    pub dropped_due_to_limit: u64,
    pub trim_events: u64,
    pub last_trim_unix: f64,
    pub corrupt_dropped: u64,
    pub fallback_active: bool,
}

impl SpoolSnapshot {
    pub fn as_json(&self) -> Value {
        json!({
            "pending": self.pending,
            "limit": self.limit,
            "dropped_due_to_limit": self.dropped_due_to_limit,
            "trim_events": self.trim_events,
            "last_trim_unix": self.last_trim_unix,
            "corrupt_dropped": self.corrupt_dropped,
            "fallback_active": if self.fallback_active { 1 } else { 0 },
        })
    }
}

/// Persistent deque of encoded records using numbered files.
///
/// O(1) append, append_front and pop_front; a single-pass min/max directory
/// scan recovers the head/tail indices without sorting (RAM-friendly on
/// low-memory targets).
#[derive(Debug)]
struct FileSpoolDeque {
    dir: PathBuf,
    head: i64,
    tail: i64,
}

/// Starting index chosen to leave headroom for append_front operations.
const INITIAL_INDEX: i64 = 1_000_000_000;

impl FileSpoolDeque {
    fn open(dir: &Path) -> io::Result<Self> {
        std::fs::create_dir_all(dir)?;

        let mut min_index: Option<i64> = None;
        let mut max_index: Option<i64> = None;
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(stem) = name.strip_suffix(".msg") else { continue };
            let Ok(index) = stem.parse::<i64>() else { continue };
            min_index = Some(min_index.map_or(index, |m| m.min(index)));
            max_index = Some(max_index.map_or(index, |m| m.max(index)));
        }

        let (head, tail) = match (min_index, max_index) {
            (Some(min), Some(max)) => (min, max),
            _ => (INITIAL_INDEX, INITIAL_INDEX - 1),
        };
        Ok(Self { dir: dir.to_path_buf(), head, tail })
    }

    fn file_path(&self, index: i64) -> PathBuf {
        self.dir.join(format!("{index:010}.msg"))
    }

    fn len(&self) -> usize {
        (self.tail - self.head + 1).max(0) as usize
    }

    fn append(&mut self, record: &[u8]) -> io::Result<()> {
        let path = self.file_path(self.tail + 1);
        std::fs::write(path, record)?;
        self.tail += 1;
        Ok(())
    }

    fn append_front(&mut self, record: &[u8]) -> io::Result<()> {
        let path = self.file_path(self.head - 1);
        std::fs::write(path, record)?;
        self.head -= 1;
        Ok(())
    }

    fn pop_front(&mut self) -> io::Result<Option<Vec<u8>>> {
        if self.len() == 0 {
            return Ok(None);
        }
        let path = self.file_path(self.head);
        let data = std::fs::read(&path);
        let _ = std::fs::remove_file(&path);
        self.head += 1;
        if self.len() == 0 {
            // Reset counters when empty to prevent unbounded index drift.
            self.head = INITIAL_INDEX;
            self.tail = INITIAL_INDEX - 1;
        }
        data.map(Some)
    }
}

#[derive(Debug, Default)]
struct SpoolInner {
    disk: Option<FileSpoolDeque>,
    memory: VecDeque<QueuedPublish>,
    fallback_active: bool,
    failure_reason: Option<String>,
    dropped_due_to_limit: u64,
    trim_events: u64,
    last_trim_unix: f64,
    corrupt_dropped: u64,
    reactivate_after: Option<Instant>,
    reactivate_attempts: u32,
}

/// Hybrid disk+memory FIFO that degrades to memory when disk I/O fails.
#[derive(Debug)]
pub struct MqttPublishSpool {
    directory: PathBuf,
    limit: usize,
    inner: Mutex<SpoolInner>,
}

impl MqttPublishSpool {
    /// Open the spool, refusing disk use outside `/tmp`.
    pub fn open(directory: &str, limit: usize) -> Self {
        let directory = PathBuf::from(directory);
        let mut inner = SpoolInner::default();

        let dir_str = directory.to_string_lossy();
        let is_tmp = dir_str == "/tmp" || dir_str.starts_with("/tmp/");
        if !is_tmp {
            log::warn!(
                "MQTT spool directory {} is not under /tmp; forcing memory-only mode",
                directory.display()
            );
            inner.fallback_active = true;
            inner.failure_reason = Some("non_tmp_directory".into());
        } else {
            match FileSpoolDeque::open(&directory) {
                Ok(disk) => inner.disk = Some(disk),
                Err(err) => {
                    log::warn!(
                        "Failed to initialize disk spool at {}; falling back to memory-only mode: {err}",
                        directory.display()
                    );
                    inner.fallback_active = true;
                    inner.failure_reason = Some("initialization_failed".into());
                }
            }
        }

        let spool = Self { directory, limit, inner: Mutex::new(inner) };
        if limit > 0 {
            let mut guard = spool.inner.lock().expect("spool lock poisoned");
            spool.trim_locked(&mut guard);
        }
        spool
    }

    /// Append an envelope at the tail.
    pub fn append(&self, message: &QueuedPublish) {
        let record = match message.to_record() {
            Ok(record) => record,
            Err(err) => {
                log::error!("Cannot encode spool record for {}: {err}", message.topic_name);
                return;
            }
        };

        let mut inner = self.inner.lock().expect("spool lock poisoned");
        if let Some(disk) = inner.disk.as_mut() {
            if let Err(err) = disk.append(&record) {
                self.handle_disk_error(&mut inner, err, "append");
                inner.memory.push_back(message.clone());
            }
        } else {
            inner.memory.push_back(message.clone());
        }

        if self.limit > 0 {
            self.trim_locked(&mut inner);
        }
    }

    /// Pop the oldest envelope, discarding corrupt records.
    pub fn pop_next(&self) -> Option<QueuedPublish> {
        let mut inner = self.inner.lock().expect("spool lock poisoned");
        loop {
            if inner.disk.is_some() {
                let popped = inner.disk.as_mut().and_then(|disk| match disk.pop_front() {
                    Ok(record) => record.map(Ok),
                    Err(err) => Some(Err(err)),
                });
                match popped {
                    Some(Ok(record)) => match QueuedPublish::from_record(&record) {
                        Ok(message) => return Some(message),
                        Err(err) => {
                            log::warn!("Dropping corrupt MQTT spool entry on disk: {err}");
                            inner.corrupt_dropped += 1;
                            continue;
                        }
                    },
                    Some(Err(err)) => {
                        self.handle_disk_error(&mut inner, err, "pop");
                        continue;
                    }
                    None => {}
                }
            }

            return inner.memory.pop_front();
        }
    }

    /// Put an envelope back at the head (failed publish).
    pub fn requeue(&self, message: &QueuedPublish) {
        let record = match message.to_record() {
            Ok(record) => record,
            Err(err) => {
                log::error!("Cannot encode spool record for {}: {err}", message.topic_name);
                return;
            }
        };

        let mut inner = self.inner.lock().expect("spool lock poisoned");
        if let Some(disk) = inner.disk.as_mut() {
            if let Err(err) = disk.append_front(&record) {
                self.handle_disk_error(&mut inner, err, "requeue");
                inner.memory.push_front(message.clone());
            }
        } else {
            inner.memory.push_front(message.clone());
        }
    }

    /// Number of spooled envelopes across both backends.
    pub fn pending(&self) -> usize {
        let inner = self.inner.lock().expect("spool lock poisoned");
        inner.memory.len() + inner.disk.as_ref().map_or(0, FileSpoolDeque::len)
    }

    /// True while serving memory-only.
    pub fn is_degraded(&self) -> bool {
        self.inner.lock().expect("spool lock poisoned").fallback_active
    }

    /// Degradation reason, if any.
    pub fn failure_reason(&self) -> Option<String> {
        self.inner.lock().expect("spool lock poisoned").failure_reason.clone()
    }

    /// Attempt to reopen the disk backend once the back-off elapsed.
    ///
    /// Returns true when disk service was restored.
    pub fn try_reactivate(&self) -> bool {
        let mut inner = self.inner.lock().expect("spool lock poisoned");
        if !inner.fallback_active {
            return false;
        }
        if inner.failure_reason.as_deref() == Some("non_tmp_directory") {
            // Configuration problem; retrying cannot help.
            return false;
        }
        if let Some(after) = inner.reactivate_after {
            if Instant::now() < after {
                return false;
            }
        }

        match FileSpoolDeque::open(&self.directory) {
            Ok(disk) => {
                log::info!("MQTT spool disk backend reactivated at {}", self.directory.display());
                inner.disk = Some(disk);
                inner.fallback_active = false;
                inner.failure_reason = None;
                inner.reactivate_after = None;
                inner.reactivate_attempts = 0;
                true
            }
            Err(err) => {
                inner.reactivate_attempts += 1;
                let backoff = SPOOL_BACKOFF_MIN
                    .saturating_mul(2u32.saturating_pow(inner.reactivate_attempts.min(16)))
                    .min(SPOOL_BACKOFF_MAX);
                inner.reactivate_after = Some(Instant::now() + backoff);
                log::debug!(
                    "MQTT spool reactivation failed (attempt {}): {err}; next try in {:?}",
                    inner.reactivate_attempts,
                    backoff
                );
                false
            }
        }
    }

    /// Current counters.
    pub fn snapshot(&self) -> SpoolSnapshot {
        let inner = self.inner.lock().expect("spool lock poisoned");
        SpoolSnapshot {
            pending: inner.memory.len() + inner.disk.as_ref().map_or(0, FileSpoolDeque::len),
            limit: self.limit,
            dropped_due_to_limit: inner.dropped_due_to_limit,
            trim_events: inner.trim_events,
            last_trim_unix: inner.last_trim_unix,
            corrupt_dropped: inner.corrupt_dropped,
            fallback_active: inner.fallback_active,
        }
    }

    fn handle_disk_error(&self, inner: &mut SpoolInner, err: io::Error, op: &str) {
        let reason = if err.raw_os_error() == Some(libc::ENOSPC) { "disk_full" } else { "io_error" };
        log::error!(
            "MQTT spool disk error during {op}: {err}. Switching to memory-only mode (reason={reason})."
        );
        inner.disk = None;
        inner.fallback_active = true;
        inner.failure_reason = Some(reason.into());
        inner.reactivate_after = Some(Instant::now() + SPOOL_BACKOFF_MIN);
    }

    fn trim_locked(&self, inner: &mut SpoolInner) {
        if self.limit == 0 {
            return;
        }

        let mut dropped = 0u64;
        loop {
            let pending = inner.memory.len() + inner.disk.as_ref().map_or(0, FileSpoolDeque::len);
            if pending <= self.limit {
                break;
            }

            if inner.disk.as_ref().is_some_and(|disk| disk.len() > 0) {
                match inner.disk.as_mut().expect("disk checked above").pop_front() {
                    Ok(_) => {
                        dropped += 1;
                        continue;
                    }
                    Err(err) => {
                        log::error!("Disk failure during trim: {err}");
                        inner.disk = None;
                        inner.fallback_active = true;
                        inner.failure_reason = Some("trim_failed".into());
                        inner.reactivate_after = Some(Instant::now() + SPOOL_BACKOFF_MIN);
                        continue;
                    }
                }
            }

            if inner.memory.pop_front().is_some() {
                dropped += 1;
            } else {
                break;
            }
        }

        if dropped > 0 {
            inner.dropped_due_to_limit += dropped;
            inner.trim_events += 1;
            inner.last_trim_unix = unix_now();
            log::warn!(
                "MQTT spool limit {} exceeded; dropped {dropped} oldest entry/entries",
                self.limit
            );
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn message(n: u32) -> QueuedPublish {
        QueuedPublish::new(format!("br/test/{n}"), n.to_be_bytes().to_vec())
    }

    // Spool directories must be under /tmp; tempfile honours TMPDIR, so pin
    // the parent explicitly.
    fn tmp_spool_dir() -> tempfile::TempDir {
        tempfile::Builder::new()
            .prefix("mcubridge-spool-")
            .tempdir_in("/tmp")
            .expect("tempdir under /tmp")
    }

    #[test]
    fn append_pop_round_trip() {
        let dir = tmp_spool_dir();
        let spool = MqttPublishSpool::open(dir.path().to_str().unwrap(), 100);
        assert!(!spool.is_degraded());

        let original = message(1);
        spool.append(&original);
        assert_eq!(spool.pending(), 1);
        assert_eq!(spool.pop_next().unwrap(), original);
        assert_eq!(spool.pending(), 0);
        assert!(spool.pop_next().is_none());
    }

    #[test]
    fn fifo_order_across_many_records() {
        let dir = tmp_spool_dir();
        let spool = MqttPublishSpool::open(dir.path().to_str().unwrap(), 100);
        for n in 0..10 {
            spool.append(&message(n));
        }
        for n in 0..10 {
            assert_eq!(spool.pop_next().unwrap(), message(n));
        }
    }

    #[test]
    fn requeue_goes_to_head() {
        let dir = tmp_spool_dir();
        let spool = MqttPublishSpool::open(dir.path().to_str().unwrap(), 100);
        spool.append(&message(1));
        spool.append(&message(2));
        let first = spool.pop_next().unwrap();
        spool.requeue(&first);
        assert_eq!(spool.pop_next().unwrap(), message(1));
        assert_eq!(spool.pop_next().unwrap(), message(2));
    }

    #[test]
    fn records_survive_reopen() {
        let dir = tmp_spool_dir();
        let path = dir.path().to_str().unwrap().to_string();
        {
            let spool = MqttPublishSpool::open(&path, 100);
            spool.append(&message(7));
            spool.append(&message(8));
        }
        let spool = MqttPublishSpool::open(&path, 100);
        assert_eq!(spool.pending(), 2);
        assert_eq!(spool.pop_next().unwrap(), message(7));
        assert_eq!(spool.pop_next().unwrap(), message(8));
    }

    #[test]
    fn non_tmp_directory_degrades_immediately() {
        let spool = MqttPublishSpool::open("/var/lib/mcubridge-test-spool", 10);
        assert!(spool.is_degraded());
        assert_eq!(spool.failure_reason().as_deref(), Some("non_tmp_directory"));

        // Memory backend still serves FIFO operations.
        spool.append(&message(1));
        spool.append(&message(2));
        assert_eq!(spool.pop_next().unwrap(), message(1));
        assert_eq!(spool.pop_next().unwrap(), message(2));
        // Reactivation never applies to a misconfigured directory.
        assert!(!spool.try_reactivate());
    }

    #[test]
    fn corrupt_records_are_discarded_and_counted() {
        let dir = tmp_spool_dir();
        let spool = MqttPublishSpool::open(dir.path().to_str().unwrap(), 100);
        spool.append(&message(1));
        // Inject garbage ahead of the valid record.
        std::fs::write(dir.path().join("0999999999.msg"), b"not a record").unwrap();
        drop(spool);

        let spool = MqttPublishSpool::open(dir.path().to_str().unwrap(), 100);
        assert_eq!(spool.pop_next().unwrap(), message(1));
        assert_eq!(spool.snapshot().corrupt_dropped, 1);
    }

    #[test]
    fn trim_drops_oldest_and_stamps_event() {
        let dir = tmp_spool_dir();
        let spool = MqttPublishSpool::open(dir.path().to_str().unwrap(), 3);
        for n in 0..5 {
            spool.append(&message(n));
        }
        let snapshot = spool.snapshot();
        assert_eq!(snapshot.pending, 3);
        assert_eq!(snapshot.dropped_due_to_limit, 2);
        assert!(snapshot.trim_events >= 1);
        assert!(snapshot.last_trim_unix > 0.0);
        // Oldest entries are the ones gone.
        assert_eq!(spool.pop_next().unwrap(), message(2));
    }

    #[test]
    fn snapshot_reports_limit_and_fallback() {
        let dir = tmp_spool_dir();
        let spool = MqttPublishSpool::open(dir.path().to_str().unwrap(), 42);
        let snapshot = spool.snapshot();
        assert_eq!(snapshot.limit, 42);
        assert!(!snapshot.fallback_active);
        assert_eq!(snapshot.as_json()["fallback_active"], 0);
    }

    #[test]
    fn file_names_are_zero_padded_for_lexical_order() {
        let dir = tmp_spool_dir();
        let spool = MqttPublishSpool::open(dir.path().to_str().unwrap(), 100);
        spool.append(&message(1));
        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["1000000000.msg".to_string()]);
    }
}
