//! Streaming SSTable writer.
//!
//! Entries arrive in strictly increasing internal-key order (user key
//! ascending, sequence descending within a user key) and are packed
//! into prefix-compressed data blocks. Each flushed block is recorded
//! in the index; user keys feed the Bloom filter. `finish` writes the
//! index block, the Bloom filter, and the footer, then fsyncs.
//!
//! A writer dropped before `finish` abandons the file: the partial
//! output is closed and unlinked.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::debug;

use strata_core::types::{
    self, pack_sequence_and_type, SequenceNumber, ValueType, MAX_SEQUENCE,
};
use strata_core::coding;

use crate::block::{BlockBuilder, IndexBlockBuilder};
use crate::bloom::BloomFilterBuilder;
use crate::error::{Result, SSTableError};
use crate::format::{add_trailer, BlockHandle, BlockType, Footer, SSTableOptions};
use strata_memtable::MemTable;

/// Statistics describing a finished table.
#[derive(Debug, Clone, Default)]
pub struct SSTableWriteStats {
    /// Bytes of data blocks, trailers included.
    pub data_size: usize,
    /// Bytes of the index block, trailer included.
    pub index_size: usize,
    /// Bytes of the Bloom block (zero when disabled or empty).
    pub bloom_size: usize,
    /// Bytes of the footer as written.
    pub footer_size: usize,
    pub num_entries: usize,
    pub num_data_blocks: usize,
    /// Uncompressed user-key and value byte totals.
    pub raw_key_size: usize,
    pub raw_value_size: usize,
    pub min_seq: SequenceNumber,
    pub max_seq: SequenceNumber,
}

pub struct SSTableWriter {
    path: PathBuf,
    options: SSTableOptions,
    file: Option<File>,
    offset: u64,

    data_block: BlockBuilder,
    index_builder: IndexBlockBuilder,
    bloom_builder: BloomFilterBuilder,

    num_entries: usize,
    first_key: Vec<u8>,
    last_key: Vec<u8>,
    min_sequence: SequenceNumber,
    max_sequence: SequenceNumber,

    stats: SSTableWriteStats,
    finished: bool,
}

impl SSTableWriter {
    /// Creates the table file, truncating any existing file at `path`.
    pub fn create(path: impl Into<PathBuf>, options: SSTableOptions) -> Result<Self> {
        let path = path.into();
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;

        let data_block = BlockBuilder::new(options.restart_interval);
        let bloom_builder = BloomFilterBuilder::new(options.bloom_policy);

        Ok(Self {
            path,
            options,
            file: Some(file),
            offset: 0,
            data_block,
            index_builder: IndexBlockBuilder::new(),
            bloom_builder,
            num_entries: 0,
            first_key: Vec::new(),
            last_key: Vec::new(),
            min_sequence: MAX_SEQUENCE,
            max_sequence: 0,
            stats: SSTableWriteStats::default(),
            finished: false,
        })
    }

    /// Adds one entry. Internal keys must be strictly increasing.
    pub fn add(
        &mut self,
        user_key: &[u8],
        value: &[u8],
        seq: SequenceNumber,
        value_type: ValueType,
    ) -> Result<()> {
        if self.file.is_none() {
            return Err(SSTableError::Io(std::io::Error::other(
                "SSTable writer is closed",
            )));
        }

        let mut internal_key = Vec::with_capacity(user_key.len() + 8);
        internal_key.extend_from_slice(user_key);
        coding::put_fixed64(&mut internal_key, pack_sequence_and_type(seq, value_type));

        if self.num_entries > 0
            && types::compare_encoded(&internal_key, &self.last_key) != std::cmp::Ordering::Greater
        {
            return Err(SSTableError::KeysNotSorted(
                self.last_key.clone(),
                internal_key,
            ));
        }

        if self.num_entries == 0 {
            self.first_key = internal_key.clone();
        }
        self.last_key = internal_key.clone();
        self.min_sequence = self.min_sequence.min(seq);
        self.max_sequence = self.max_sequence.max(seq);

        self.data_block.add(&internal_key, value);
        self.num_entries += 1;

        // The filter indexes user keys, not internal keys, so a point
        // read can probe it before knowing any sequence number.
        if self.options.use_bloom_filter {
            self.bloom_builder.add_key(user_key);
        }

        self.stats.raw_key_size += user_key.len();
        self.stats.raw_value_size += value.len();

        if self.data_block.current_size_estimate() >= self.options.block_size {
            self.flush_data_block()?;
        }
        Ok(())
    }

    /// Finishes the table: trailing data block, index, Bloom filter,
    /// footer, fsync, close. Returns the write statistics.
    pub fn finish(mut self) -> Result<SSTableWriteStats> {
        if self.file.is_none() {
            return Err(SSTableError::Io(std::io::Error::other(
                "SSTable writer is closed",
            )));
        }

        if !self.data_block.is_empty() {
            self.flush_data_block()?;
        }

        let index_handle = self.write_index_block()?;
        let bloom_handle = self.write_bloom_filter()?;
        self.write_footer(index_handle, bloom_handle)?;

        let file = self.file.take().expect("file present");
        file.sync_all()?;
        drop(file);
        self.finished = true;

        let mut stats = std::mem::take(&mut self.stats);
        stats.num_entries = self.num_entries;
        stats.min_seq = self.min_sequence;
        stats.max_seq = self.max_sequence;

        debug!(
            path = %self.path.display(),
            entries = stats.num_entries,
            data_blocks = stats.num_data_blocks,
            bytes = self.offset,
            "sstable finished"
        );
        Ok(stats)
    }

    /// Closes and unlinks the partial file.
    pub fn abandon(&mut self) {
        if let Some(file) = self.file.take() {
            drop(file);
            let _ = std::fs::remove_file(&self.path);
        }
        self.finished = true;
    }

    /// Writes every entry of `memtable` in its natural (sorted) order
    /// into a new table at `path`.
    pub fn flush_memtable(
        path: impl Into<PathBuf>,
        memtable: &MemTable,
        options: SSTableOptions,
    ) -> Result<SSTableWriteStats> {
        let mut writer = Self::create(path, options)?;

        let mut iter = memtable.iter();
        iter.seek_to_first();
        while iter.valid() {
            writer.add(
                iter.user_key(),
                iter.value(),
                iter.sequence(),
                iter.value_type(),
            )?;
            iter.next();
        }
        writer.finish()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn num_entries(&self) -> usize {
        self.num_entries
    }

    fn flush_data_block(&mut self) -> Result<()> {
        if self.data_block.is_empty() {
            return Ok(());
        }

        let last_key = self.data_block.last_key().to_vec();
        let block = add_trailer(self.data_block.finish(), BlockType::Data);
        let handle = BlockHandle::new(self.offset, block.len() as u64);
        self.write_raw(&block)?;

        self.index_builder.add_entry(&last_key, handle);
        self.stats.data_size += block.len();
        self.stats.num_data_blocks += 1;
        self.data_block.reset();
        Ok(())
    }

    fn write_index_block(&mut self) -> Result<BlockHandle> {
        let block = add_trailer(self.index_builder.finish(), BlockType::Index);
        let handle = BlockHandle::new(self.offset, block.len() as u64);
        self.write_raw(&block)?;
        self.stats.index_size = block.len();
        Ok(handle)
    }

    fn write_bloom_filter(&mut self) -> Result<BlockHandle> {
        if !self.options.use_bloom_filter || self.bloom_builder.num_keys() == 0 {
            return Ok(BlockHandle::default());
        }

        let filter = self.bloom_builder.finish();
        let handle = BlockHandle::new(self.offset, filter.len() as u64);
        self.write_raw(&filter)?;
        self.stats.bloom_size = filter.len();
        Ok(handle)
    }

    fn write_footer(&mut self, index_handle: BlockHandle, bloom_handle: BlockHandle) -> Result<()> {
        let footer = Footer {
            index_handle,
            bloom_handle,
            num_entries: self.num_entries as u64,
            min_sequence: if self.num_entries == 0 { 0 } else { self.min_sequence },
            max_sequence: self.max_sequence,
            min_key: types::extract_user_key(&self.first_key).to_vec(),
            max_key: types::extract_user_key(&self.last_key).to_vec(),
        };

        let encoded = footer.encode();
        self.write_raw(&encoded)?;
        self.stats.footer_size = encoded.len();
        Ok(())
    }

    fn write_raw(&mut self, data: &[u8]) -> Result<()> {
        let file = self.file.as_mut().expect("file present");
        file.write_all(data)?;
        self.offset += data.len() as u64;
        Ok(())
    }
}

impl Drop for SSTableWriter {
    fn drop(&mut self) {
        if !self.finished {
            self.abandon();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::Block;
    use crate::bloom::BloomFilterReader;
    use crate::format::{verify_trailer, FOOTER_SIZE, SSTABLE_MAGIC};
    use bytes::Bytes;
    use strata_memtable::MemTableOptions;
    use tempfile::TempDir;

    fn read_footer(file_data: &[u8], footer_size: usize) -> Footer {
        Footer::decode(&file_data[file_data.len() - footer_size..]).unwrap()
    }

    #[test]
    fn empty_table_is_valid() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("empty.sst");

        let writer = SSTableWriter::create(&path, SSTableOptions::default()).unwrap();
        let stats = writer.finish().unwrap();
        assert_eq!(stats.num_entries, 0);
        assert_eq!(stats.num_data_blocks, 0);
        assert_eq!(stats.bloom_size, 0);

        let data = std::fs::read(&path).unwrap();
        let footer = read_footer(&data, stats.footer_size);
        assert_eq!(footer.num_entries, 0);
        assert_eq!(footer.min_sequence, 0);
        assert_eq!(footer.bloom_handle, BlockHandle::default());
        assert!(footer.min_key.is_empty());
    }

    #[test]
    fn footer_magic_at_file_tail() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t.sst");

        let mut writer = SSTableWriter::create(&path, SSTableOptions::default()).unwrap();
        writer.add(b"key", b"value", 1, ValueType::Value).unwrap();
        writer.finish().unwrap();

        let data = std::fs::read(&path).unwrap();
        let magic = strata_core::coding::decode_fixed64(&data[data.len() - 8..]);
        assert_eq!(magic, SSTABLE_MAGIC);
    }

    #[test]
    fn rejects_out_of_order_keys() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t.sst");

        let mut writer = SSTableWriter::create(&path, SSTableOptions::default()).unwrap();
        writer.add(b"b", b"1", 1, ValueType::Value).unwrap();
        let err = writer.add(b"a", b"2", 2, ValueType::Value).unwrap_err();
        assert!(matches!(err, SSTableError::KeysNotSorted(_, _)));
    }

    #[test]
    fn same_user_key_requires_descending_sequence() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t.sst");

        let mut writer = SSTableWriter::create(&path, SSTableOptions::default()).unwrap();
        writer.add(b"k", b"new", 9, ValueType::Value).unwrap();
        writer.add(b"k", b"old", 3, ValueType::Value).unwrap();

        // Ascending within the same user key violates the contract.
        let err = writer.add(b"k", b"bad", 7, ValueType::Value).unwrap_err();
        assert!(matches!(err, SSTableError::KeysNotSorted(_, _)));
    }

    #[test]
    fn thousand_entries_footer_and_blocks() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t.sst");

        let mut writer = SSTableWriter::create(&path, SSTableOptions::default()).unwrap();
        for i in 0..1000u64 {
            let key = format!("key{i:06}");
            let value = format!("value{i:06}");
            writer
                .add(key.as_bytes(), value.as_bytes(), i + 1, ValueType::Value)
                .unwrap();
        }
        let stats = writer.finish().unwrap();

        assert_eq!(stats.num_entries, 1000);
        assert_eq!(stats.min_seq, 1);
        assert_eq!(stats.max_seq, 1000);
        assert!(stats.num_data_blocks >= 2, "expected multiple 4 KiB blocks");
        assert!(stats.bloom_size > 0);

        let data = std::fs::read(&path).unwrap();
        let footer = read_footer(&data, stats.footer_size);
        assert_eq!(footer.num_entries, 1000);
        assert_eq!(footer.min_sequence, 1);
        assert_eq!(footer.max_sequence, 1000);
        assert_eq!(footer.min_key, b"key000000".to_vec());
        assert_eq!(footer.max_key, b"key000999".to_vec());

        // File accounting is exact.
        assert_eq!(
            data.len(),
            stats.data_size + stats.index_size + stats.bloom_size + stats.footer_size
        );
    }

    #[test]
    fn blocks_decode_to_exact_entry_sequence() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t.sst");

        let entries: Vec<(Vec<u8>, Vec<u8>, u64)> = (0..500u64)
            .map(|i| {
                (
                    format!("key{i:04}").into_bytes(),
                    format!("val{i:04}").into_bytes(),
                    i + 1,
                )
            })
            .collect();

        let mut writer = SSTableWriter::create(&path, SSTableOptions::default()).unwrap();
        for (key, value, seq) in &entries {
            writer.add(key, value, *seq, ValueType::Value).unwrap();
        }
        let stats = writer.finish().unwrap();

        let data = std::fs::read(&path).unwrap();
        let footer = read_footer(&data, stats.footer_size);

        // Walk the index block; collect every data-block handle.
        let index_contents = verify_trailer(
            &data[footer.index_handle.offset as usize
                ..(footer.index_handle.offset + footer.index_handle.size) as usize],
            BlockType::Index,
        )
        .unwrap();
        let index = Block::decode(Bytes::copy_from_slice(index_contents)).unwrap();

        let mut decoded = Vec::new();
        let mut index_iter = index.iter();
        let mut last_index_key: Vec<u8> = Vec::new();
        while let Some((index_key, handle_bytes)) = index_iter.try_next().unwrap() {
            let mut input = handle_bytes.as_slice();
            let handle = BlockHandle::decode(&mut input).unwrap();

            let contents = verify_trailer(
                &data[handle.offset as usize..(handle.offset + handle.size) as usize],
                BlockType::Data,
            )
            .unwrap();
            let block = Block::decode(Bytes::copy_from_slice(contents)).unwrap();
            let mut block_iter = block.iter();
            let mut block_last = Vec::new();
            while let Some((ikey, value)) = block_iter.try_next().unwrap() {
                block_last = ikey.clone();
                decoded.push((ikey, value));
            }
            // The index key is the block's last internal key.
            assert_eq!(index_key, block_last);
            last_index_key = index_key;
        }
        assert!(!last_index_key.is_empty());

        assert_eq!(decoded.len(), entries.len());
        for ((ikey, value), (key, expected_value, seq)) in decoded.iter().zip(entries.iter()) {
            assert_eq!(types::extract_user_key(ikey), key.as_slice());
            assert_eq!(types::extract_packed(ikey) >> 8, *seq);
            assert_eq!(value, expected_value);
        }
    }

    #[test]
    fn bloom_filter_covers_all_user_keys() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t.sst");

        let mut writer = SSTableWriter::create(&path, SSTableOptions::default()).unwrap();
        for i in 0..300u64 {
            writer
                .add(format!("user{i:04}").as_bytes(), b"v", i + 1, ValueType::Value)
                .unwrap();
        }
        let stats = writer.finish().unwrap();

        let data = std::fs::read(&path).unwrap();
        let footer = read_footer(&data, stats.footer_size);
        assert!(footer.bloom_handle.size > 0);

        let filter = &data[footer.bloom_handle.offset as usize
            ..(footer.bloom_handle.offset + footer.bloom_handle.size) as usize];
        let reader = BloomFilterReader::new(filter).unwrap();
        for i in 0..300u64 {
            assert!(reader.may_contain(format!("user{i:04}").as_bytes()));
        }
    }

    #[test]
    fn bloom_disabled_writes_zero_handle() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t.sst");

        let options = SSTableOptions {
            use_bloom_filter: false,
            ..Default::default()
        };
        let mut writer = SSTableWriter::create(&path, options).unwrap();
        writer.add(b"k", b"v", 1, ValueType::Value).unwrap();
        let stats = writer.finish().unwrap();
        assert_eq!(stats.bloom_size, 0);

        let data = std::fs::read(&path).unwrap();
        let footer = read_footer(&data, stats.footer_size);
        assert_eq!(footer.bloom_handle, BlockHandle::default());
    }

    #[test]
    fn tombstones_are_stored() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t.sst");

        let mut writer = SSTableWriter::create(&path, SSTableOptions::default()).unwrap();
        writer.add(b"key1", b"value1", 1, ValueType::Value).unwrap();
        writer.add(b"key2", b"", 2, ValueType::Deletion).unwrap();
        let stats = writer.finish().unwrap();
        assert_eq!(stats.num_entries, 2);

        let data = std::fs::read(&path).unwrap();
        let footer = read_footer(&data, stats.footer_size);

        let index_contents = verify_trailer(
            &data[footer.index_handle.offset as usize
                ..(footer.index_handle.offset + footer.index_handle.size) as usize],
            BlockType::Index,
        )
        .unwrap();
        let index = Block::decode(Bytes::copy_from_slice(index_contents)).unwrap();
        let (_, handle_bytes) = index.iter().try_next().unwrap().unwrap();
        let mut input = handle_bytes.as_slice();
        let handle = BlockHandle::decode(&mut input).unwrap();

        let contents = verify_trailer(
            &data[handle.offset as usize..(handle.offset + handle.size) as usize],
            BlockType::Data,
        )
        .unwrap();
        let block = Block::decode(Bytes::copy_from_slice(contents)).unwrap();
        let mut iter = block.iter();

        let (ikey, _) = iter.try_next().unwrap().unwrap();
        assert_eq!(types::extract_packed(&ikey) & 0xff, ValueType::Value as u64);
        let (ikey, value) = iter.try_next().unwrap().unwrap();
        assert_eq!(types::extract_packed(&ikey) & 0xff, ValueType::Deletion as u64);
        assert!(value.is_empty());
    }

    #[test]
    fn abandon_unlinks_partial_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("abandoned.sst");

        {
            let mut writer = SSTableWriter::create(&path, SSTableOptions::default()).unwrap();
            writer.add(b"k", b"v", 1, ValueType::Value).unwrap();
            writer.abandon();
        }
        assert!(!path.exists());
    }

    #[test]
    fn drop_without_finish_abandons() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("dropped.sst");

        {
            let mut writer = SSTableWriter::create(&path, SSTableOptions::default()).unwrap();
            writer.add(b"k", b"v", 1, ValueType::Value).unwrap();
        }
        assert!(!path.exists());
    }

    #[test]
    fn flush_memtable_writes_all_entries() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("flushed.sst");

        let memtable = MemTable::new(MemTableOptions::default());
        for i in 0..1000u64 {
            memtable.put(
                i + 1,
                format!("key{i:06}").as_bytes(),
                format!("value{i:06}").as_bytes(),
            );
        }

        let stats =
            SSTableWriter::flush_memtable(&path, &memtable, SSTableOptions::default()).unwrap();
        assert_eq!(stats.num_entries, 1000);
        assert_eq!(stats.min_seq, 1);
        assert_eq!(stats.max_seq, 1000);
        assert!(path.exists());

        let data = std::fs::read(&path).unwrap();
        let footer = read_footer(&data, stats.footer_size);
        assert_eq!(footer.num_entries, 1000);
        assert_eq!(footer.min_key, b"key000000".to_vec());
        assert_eq!(footer.max_key, b"key000999".to_vec());
    }

    #[test]
    fn flush_memtable_preserves_mvcc_versions() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("mvcc.sst");

        let memtable = MemTable::new(MemTableOptions::default());
        memtable.put(1, b"k", b"a");
        memtable.put(5, b"k", b"b");
        memtable.delete(9, b"k");

        let stats =
            SSTableWriter::flush_memtable(&path, &memtable, SSTableOptions::default()).unwrap();
        // All three versions survive the flush.
        assert_eq!(stats.num_entries, 3);
        assert_eq!(stats.min_seq, 1);
        assert_eq!(stats.max_seq, 9);
    }

    #[test]
    fn short_keys_yield_nominal_footer() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t.sst");

        let mut writer = SSTableWriter::create(&path, SSTableOptions::default()).unwrap();
        writer.add(b"a", b"1", 1, ValueType::Value).unwrap();
        writer.add(b"z", b"2", 2, ValueType::Value).unwrap();
        let stats = writer.finish().unwrap();
        assert_eq!(stats.footer_size, FOOTER_SIZE);
    }
}
