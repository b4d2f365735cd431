//! Directory of numbered log segments: rotation, recovery, retention.
//!
//! Segments live in `<db>/wal` and are named `log.NNNNNN` (six-digit
//! zero-padded decimal). Numbers are monotonic; gaps are allowed after
//! retention. Nothing else in the directory is recognized.

use std::path::{Path, PathBuf};
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, warn};

use strata_core::types::SequenceNumber;
use strata_memtable::MemTable;

use crate::reader::{RecoveryStats, WalReader};
use crate::record::{WalEntry, WalEntryKind, WalError};
use crate::writer::{WalOptions, WalWriter};
use crate::Result;

struct ManagerState {
    current_log_number: u64,
    writer: Option<WalWriter>,
}

pub struct WalManager {
    wal_dir: PathBuf,
    options: WalOptions,
    state: Mutex<ManagerState>,
}

impl WalManager {
    /// Opens the WAL under `<db_path>/wal`, creating the directory if
    /// needed, and starts a fresh segment numbered one past the highest
    /// existing segment.
    pub fn open(db_path: impl AsRef<Path>, options: WalOptions) -> Result<Self> {
        let wal_dir = db_path.as_ref().join("wal");
        std::fs::create_dir_all(&wal_dir)?;

        let existing = list_log_files(&wal_dir)?;
        let current_log_number = existing.last().copied().unwrap_or(0);

        let manager = Self {
            wal_dir,
            options,
            state: Mutex::new(ManagerState {
                current_log_number,
                writer: None,
            }),
        };
        manager.open_new_log(&mut manager.state.lock())?;
        Ok(manager)
    }

    /// Appends one entry, rotating first if the current segment is full.
    pub fn append(&self, entry: &WalEntry) -> Result<()> {
        let mut state = self.state.lock();

        let writer = state
            .writer
            .as_ref()
            .ok_or_else(|| WalError::Io(std::io::Error::other("WAL is closed")))?;
        if writer.should_rotate() {
            self.rotate_locked(&mut state)?;
        }

        state
            .writer
            .as_ref()
            .expect("writer present after rotation")
            .append(entry)
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

    /// Forces an fsync of the current segment.
    pub fn sync(&self) -> Result<()> {
        let state = self.state.lock();
        match &state.writer {
            Some(writer) => writer.sync(),
            None => Ok(()),
        }
    }

    /// Switches to a fresh segment regardless of size.
    pub fn rotate(&self) -> Result<()> {
        self.rotate_locked(&mut self.state.lock())
    }

    /// Replays every segment in ascending order into `memtable`.
    ///
    /// Corruption inside a segment ends that segment's replay — records
    /// before the corruption are kept, which is the expected outcome of
    /// a crash mid-append. Non-corruption I/O errors abort recovery.
    /// After recovery the caller should resume sequence allocation
    /// above `stats.max_sequence`.
    pub fn recover(&self, memtable: &MemTable) -> Result<RecoveryStats> {
        let _state = self.state.lock();
        let start = Instant::now();
        let mut stats = RecoveryStats::default();

        for log_number in list_log_files(&self.wal_dir)? {
            let path = self.log_path(log_number);
            let mut reader = match WalReader::open(&path) {
                Ok(reader) => reader,
                Err(err) => {
                    warn!(path = %path.display(), %err, "skipping unreadable WAL segment");
                    continue;
                }
            };

            loop {
                match reader.read_entry() {
                    Ok(Some(entry)) => {
                        stats.records_read += 1;
                        match entry.kind {
                            WalEntryKind::Put => {
                                memtable.put(entry.sequence, &entry.key, &entry.value);
                                stats.puts_recovered += 1;
                            }
                            WalEntryKind::Delete => {
                                memtable.delete(entry.sequence, &entry.key);
                                stats.deletes_recovered += 1;
                            }
                        }
                        stats.max_sequence = stats.max_sequence.max(entry.sequence);
                    }
                    Ok(None) => break,
                    Err(err) if err.is_corruption() => {
                        // Tail damage from a crash; everything before it
                        // is kept.
                        warn!(
                            path = %path.display(),
                            offset = reader.position(),
                            %err,
                            "corruption terminates segment replay"
                        );
                        break;
                    }
                    Err(err) => return Err(err),
                }
            }

            stats.bytes_read += reader.size();
        }

        stats.duration = start.elapsed();
        debug!(
            records = stats.records_read,
            max_sequence = stats.max_sequence,
            duration_us = stats.duration.as_micros() as u64,
            "WAL recovery complete"
        );
        Ok(stats)
    }

    /// Deletes every segment numbered strictly below
    /// `flushed_log_number`. Already-missing files are ignored.
    pub fn mark_flushed(&self, flushed_log_number: u64) -> Result<()> {
        let _state = self.state.lock();

        for log_number in list_log_files(&self.wal_dir)? {
            if log_number < flushed_log_number {
                let path = self.log_path(log_number);
                match std::fs::remove_file(&path) {
                    Ok(()) => debug!(path = %path.display(), "retired WAL segment"),
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                    Err(err) => return Err(err.into()),
                }
            }
        }
        Ok(())
    }

    pub fn current_log_number(&self) -> u64 {
        self.state.lock().current_log_number
    }

    /// Segment numbers currently on disk, ascending.
    pub fn log_numbers(&self) -> Result<Vec<u64>> {
        let _state = self.state.lock();
        list_log_files(&self.wal_dir)
    }

    /// Closes the current writer. Further appends fail.
    pub fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(mut writer) = state.writer.take() {
            writer.close()?;
        }
        Ok(())
    }

    pub fn wal_dir(&self) -> &Path {
        &self.wal_dir
    }

    fn log_path(&self, log_number: u64) -> PathBuf {
        self.wal_dir.join(format!("log.{log_number:06}"))
    }

    fn open_new_log(&self, state: &mut ManagerState) -> Result<()> {
        state.current_log_number += 1;
        let path = self.log_path(state.current_log_number);
        state.writer = Some(WalWriter::open(path, self.options.clone())?);
        Ok(())
    }

    fn rotate_locked(&self, state: &mut ManagerState) -> Result<()> {
        if let Some(mut writer) = state.writer.take() {
            writer.sync()?;
            writer.close()?;
        }
        self.open_new_log(state)
    }
}

impl Drop for WalManager {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!(%err, "error closing WAL manager");
        }
    }
}

/// Segment numbers found in `dir`, ascending. Only `log.NNNNNN` names
/// (exactly six decimal digits) are recognized.
fn list_log_files(dir: &Path) -> Result<Vec<u64>> {
    let mut numbers = Vec::new();
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(numbers),
        Err(err) => return Err(err.into()),
    };

    for entry in entries {
        let entry = entry?;
        if let Some(number) = parse_log_file_name(&entry.file_name().to_string_lossy()) {
            numbers.push(number);
        }
    }

    numbers.sort_unstable();
    Ok(numbers)
}

fn parse_log_file_name(name: &str) -> Option<u64> {
    let digits = name.strip_prefix("log.")?;
    if digits.len() != 6 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}
