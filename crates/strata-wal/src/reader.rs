//! Sequential WAL segment reader used by recovery.
//!
//! The whole segment is memory-mapped with sequential-access advice; a
//! zero-length file is valid and yields immediate EOF without a map.
//! Corruption at the tail is the normal signature of a crash, so the
//! reader reports it distinctly and the caller decides whether to treat
//! it as end-of-segment.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Duration;

use memmap2::{Advice, Mmap};

use strata_core::types::SequenceNumber;

use crate::record::{decode_record, WalEntry};
use crate::Result;

/// Counters accumulated while replaying segments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryStats {
    pub records_read: usize,
    pub bytes_read: usize,
    pub puts_recovered: usize,
    pub deletes_recovered: usize,
    pub max_sequence: SequenceNumber,
    pub duration: Duration,
}

pub struct WalReader {
    path: PathBuf,
    /// None for zero-length segments.
    mmap: Option<Mmap>,
    size: usize,
    pos: usize,
}

impl WalReader {
    /// Opens and maps a segment read-only.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = File::open(&path)?;
        let size = file.metadata()?.len() as usize;

        let mmap = if size == 0 {
            None
        } else {
            let mmap = unsafe { Mmap::map(&file)? };
            // Best effort; the read protocol does not depend on it.
            let _ = mmap.advise(Advice::Sequential);
            Some(mmap)
        };

        Ok(Self {
            path,
            mmap,
            size,
            pos: 0,
        })
    }

    /// Reads the next record's payload. `Ok(None)` at clean EOF.
    ///
    /// A record extending past the end of the file, a checksum
    /// mismatch, or a reserved record type all surface as corruption;
    /// the position does not advance past a bad record.
    pub fn read_record(&mut self) -> Result<Option<&[u8]>> {
        let Some(mmap) = &self.mmap else {
            return Ok(None);
        };
        if self.pos >= self.size {
            return Ok(None);
        }

        let (payload, consumed) = decode_record(&mmap[self.pos..])?;
        self.pos += consumed;
        Ok(Some(payload))
    }

    /// Reads and decodes the next entry. `Ok(None)` at clean EOF.
    pub fn read_entry(&mut self) -> Result<Option<WalEntry>> {
        match self.read_record()? {
            Some(payload) => Ok(Some(WalEntry::decode(payload)?)),
            None => Ok(None),
        }
    }

    /// Invokes `callback` for each entry until it returns false, EOF,
    /// or the first error.
    pub fn for_each(&mut self, mut callback: impl FnMut(&WalEntry) -> bool) -> Result<()> {
        while let Some(entry) = self.read_entry()? {
            if !callback(&entry) {
                break;
            }
        }
        Ok(())
    }

    /// Rewinds to the start of the segment.
    pub fn reset(&mut self) {
        self.pos = 0;
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn at_end(&self) -> bool {
        self.pos >= self.size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
