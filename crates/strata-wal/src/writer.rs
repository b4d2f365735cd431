//! Single-segment WAL writer with configurable durability.
//!
//! All public operations serialize on one mutex. The periodic policy
//! runs a background thread that fsyncs on an interval or when nudged
//! by an append; it terminates when the writer closes.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::warn;

use strata_core::types::SequenceNumber;

use crate::record::{encode_record, WalEntry, WalError};
use crate::Result;

/// Durability vs throughput tradeoff for appends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPolicy {
    /// fsync inside every append before it returns.
    PerWrite,
    /// fsync once `sync_batch_size` bytes have accumulated.
    Batched,
    /// A background thread fsyncs every `sync_interval`, or sooner when
    /// nudged by an append.
    Periodic,
    /// Never fsync implicitly; the caller drives [`WalWriter::sync`].
    NoSync,
}

/// WAL tuning knobs.
#[derive(Debug, Clone)]
pub struct WalOptions {
    pub sync_policy: SyncPolicy,
    /// Byte threshold for [`SyncPolicy::Batched`].
    pub sync_batch_size: usize,
    /// Wakeup interval for [`SyncPolicy::Periodic`].
    pub sync_interval: Duration,
    /// Segment rotation threshold.
    pub max_file_size: u64,
}

impl Default for WalOptions {
    fn default() -> Self {
        Self {
            sync_policy: SyncPolicy::PerWrite,
            sync_batch_size: 1024 * 1024,
            sync_interval: Duration::from_millis(100),
            max_file_size: 64 * 1024 * 1024,
        }
    }
}

struct WriterState {
    file: Option<File>,
    bytes_since_sync: usize,
    closed: bool,
    sync_requested: bool,
}

struct Shared {
    state: Mutex<WriterState>,
    sync_cv: Condvar,
    file_size: AtomicU64,
}

impl Shared {
    /// fsync under the state lock; resets the batch counter on success.
    fn sync_locked(&self, state: &mut WriterState) -> Result<()> {
        if state.bytes_since_sync > 0 {
            if let Some(file) = &state.file {
                file.sync_data()?;
                state.bytes_since_sync = 0;
            }
        }
        Ok(())
    }
}

/// Appender for one log segment file.
pub struct WalWriter {
    path: PathBuf,
    options: WalOptions,
    shared: Arc<Shared>,
    sync_thread: Option<JoinHandle<()>>,
}

impl WalWriter {
    /// Opens (or creates) the segment for appending and starts the
    /// periodic sync worker when that policy is selected.
    pub fn open(path: impl Into<PathBuf>, options: WalOptions) -> Result<Self> {
        let path = path.into();
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(true)
            .open(&path)?;
        let file_size = file.metadata()?.len();

        let shared = Arc::new(Shared {
            state: Mutex::new(WriterState {
                file: Some(file),
                bytes_since_sync: 0,
                closed: false,
                sync_requested: false,
            }),
            sync_cv: Condvar::new(),
            file_size: AtomicU64::new(file_size),
        });

        let sync_thread = if options.sync_policy == SyncPolicy::Periodic {
            Some(Self::spawn_sync_thread(
                Arc::clone(&shared),
                options.sync_interval,
                path.clone(),
            ))
        } else {
            None
        };

        Ok(Self {
            path,
            options,
            shared,
            sync_thread,
        })
    }

    /// Appends one entry as a full record and applies the sync policy.
    pub fn append(&self, entry: &WalEntry) -> Result<()> {
        let record = encode_record(&entry.encode())?;

        let mut state = self.shared.state.lock();
        let file = state
            .file
            .as_mut()
            .ok_or_else(|| WalError::Io(std::io::Error::other("WAL writer is closed")))?;

        // write_all retries interrupted writes; any other short write
        // surfaces as an error.
        file.write_all(&record)?;
        self.shared
            .file_size
            .fetch_add(record.len() as u64, Ordering::Relaxed);
        state.bytes_since_sync += record.len();

        match self.options.sync_policy {
            SyncPolicy::PerWrite => self.shared.sync_locked(&mut state)?,
            SyncPolicy::Batched => {
                if state.bytes_since_sync >= self.options.sync_batch_size {
                    self.shared.sync_locked(&mut state)?;
                }
            }
            SyncPolicy::Periodic => {
                state.sync_requested = true;
                self.shared.sync_cv.notify_one();
            }
            SyncPolicy::NoSync => {}
        }
        Ok(())
    }

    pub fn append_put(&self, seq: SequenceNumber, key: &[u8], value: &[u8]) -> Result<()> {
        self.append(&WalEntry::put(
            seq,
            bytes::Bytes::copy_from_slice(key),
            bytes::Bytes::copy_from_slice(value),
        ))
    }

    pub fn append_delete(&self, seq: SequenceNumber, key: &[u8]) -> Result<()> {
        self.append(&WalEntry::delete(seq, bytes::Bytes::copy_from_slice(key)))
    }

    /// Forces an fsync of everything appended so far.
    pub fn sync(&self) -> Result<()> {
        let mut state = self.shared.state.lock();
        self.shared.sync_locked(&mut state)
    }

    /// Bytes written to this segment so far.
    pub fn file_size(&self) -> u64 {
        self.shared.file_size.load(Ordering::Relaxed)
    }

    /// True once the segment has reached the rotation threshold.
    pub fn should_rotate(&self) -> bool {
        self.file_size() >= self.options.max_file_size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stops the sync worker (if any), fsyncs, and closes the file.
    /// Idempotent.
    pub fn close(&mut self) -> Result<()> {
        {
            let mut state = self.shared.state.lock();
            if state.closed {
                return Ok(());
            }
            state.closed = true;
        }
        self.shared.sync_cv.notify_all();
        if let Some(handle) = self.sync_thread.take() {
            let _ = handle.join();
        }

        let mut state = self.shared.state.lock();
        let result = self.shared.sync_locked(&mut state);
        state.file = None;
        result
    }

    fn spawn_sync_thread(shared: Arc<Shared>, interval: Duration, path: PathBuf) -> JoinHandle<()> {
        std::thread::spawn(move || {
            let mut state = shared.state.lock();
            while !state.closed {
                shared.sync_cv.wait_for(&mut state, interval);
                if state.closed {
                    break;
                }
                if state.bytes_since_sync > 0 {
                    if let Err(err) = shared.sync_locked(&mut state) {
                        warn!(path = %path.display(), %err, "periodic WAL sync failed");
                    }
                }
                state.sync_requested = false;
            }
        })
    }
}

impl Drop for WalWriter {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!(path = %self.path.display(), %err, "error closing WAL writer");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::WalReader;
    use tempfile::TempDir;

    fn read_all(path: &Path) -> Vec<WalEntry> {
        let mut reader = WalReader::open(path).unwrap();
        let mut out = Vec::new();
        while let Some(entry) = reader.read_entry().unwrap() {
            out.push(entry);
        }
        out
    }

    #[test]
    fn append_and_read_back() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log.000001");

        let mut writer = WalWriter::open(&path, WalOptions::default()).unwrap();
        writer.append_put(1, b"k1", b"v1").unwrap();
        writer.append_put(2, b"k2", b"v2").unwrap();
        writer.append_delete(3, b"k1").unwrap();
        writer.close().unwrap();

        let entries = read_all(&path);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0], WalEntry::put(1, &b"k1"[..], &b"v1"[..]));
        assert_eq!(entries[1], WalEntry::put(2, &b"k2"[..], &b"v2"[..]));
        assert_eq!(entries[2], WalEntry::delete(3, &b"k1"[..]));
    }

    #[test]
    fn file_size_tracks_records() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log.000001");

        let writer = WalWriter::open(&path, WalOptions::default()).unwrap();
        assert_eq!(writer.file_size(), 0);
        writer.append_put(1, b"key", b"value").unwrap();
        let expected =
            (crate::record::HEADER_SIZE + WalEntry::put(1, &b"key"[..], &b"value"[..]).encode().len())
                as u64;
        assert_eq!(writer.file_size(), expected);
    }

    #[test]
    fn reopen_appends_at_end() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log.000001");

        {
            let mut writer = WalWriter::open(&path, WalOptions::default()).unwrap();
            writer.append_put(1, b"a", b"1").unwrap();
            writer.close().unwrap();
        }
        {
            let mut writer = WalWriter::open(&path, WalOptions::default()).unwrap();
            assert!(writer.file_size() > 0);
            writer.append_put(2, b"b", b"2").unwrap();
            writer.close().unwrap();
        }

        let entries = read_all(&path);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].sequence, 2);
    }

    #[test]
    fn all_sync_policies_persist() {
        let dir = TempDir::new().unwrap();

        let policies = [
            (SyncPolicy::PerWrite, "per_write"),
            (SyncPolicy::Batched, "batched"),
            (SyncPolicy::Periodic, "periodic"),
            (SyncPolicy::NoSync, "no_sync"),
        ];

        for (policy, name) in policies {
            let path = dir.path().join(format!("log-{name}"));
            let options = WalOptions {
                sync_policy: policy,
                sync_interval: Duration::from_millis(10),
                ..Default::default()
            };
            let mut writer = WalWriter::open(&path, options).unwrap();
            for i in 0..10u64 {
                writer.append_put(i, format!("key{i}").as_bytes(), b"v").unwrap();
            }
            writer.close().unwrap();

            assert_eq!(read_all(&path).len(), 10, "policy {name}");
        }
    }

    #[test]
    fn batched_policy_resets_counter() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log.000001");

        let options = WalOptions {
            sync_policy: SyncPolicy::Batched,
            sync_batch_size: 64,
            ..Default::default()
        };
        let mut writer = WalWriter::open(&path, options).unwrap();
        // Each record is well over the 64-byte batch, so every append
        // crosses the threshold and syncs.
        for i in 0..5u64 {
            writer
                .append_put(i, b"key-with-some-length", &vec![7u8; 100])
                .unwrap();
        }
        writer.close().unwrap();
        assert_eq!(read_all(&path).len(), 5);
    }

    #[test]
    fn periodic_worker_syncs_without_explicit_sync() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log.000001");

        let options = WalOptions {
            sync_policy: SyncPolicy::Periodic,
            sync_interval: Duration::from_millis(5),
            ..Default::default()
        };
        let writer = WalWriter::open(&path, options).unwrap();
        writer.append_put(1, b"k", b"v").unwrap();

        // Give the worker a few intervals to run.
        std::thread::sleep(Duration::from_millis(50));
        drop(writer);

        assert_eq!(read_all(&path).len(), 1);
    }

    #[test]
    fn should_rotate_at_threshold() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log.000001");

        let options = WalOptions {
            sync_policy: SyncPolicy::NoSync,
            max_file_size: 256,
            ..Default::default()
        };
        let mut writer = WalWriter::open(&path, options).unwrap();
        assert!(!writer.should_rotate());
        while !writer.should_rotate() {
            writer.append_put(1, b"key", &[0u8; 64]).unwrap();
        }
        assert!(writer.file_size() >= 256);
        writer.close().unwrap();
    }

    #[test]
    fn append_after_close_fails() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log.000001");

        let mut writer = WalWriter::open(&path, WalOptions::default()).unwrap();
        writer.close().unwrap();
        assert!(writer.append_put(1, b"k", b"v").is_err());

        // close is idempotent.
        writer.close().unwrap();
    }
}
