//! File-format constants, block handles, trailers, and the footer.

use strata_core::coding;
use strata_core::types::SequenceNumber;

use crate::error::{Result, SSTableError};

/// "SSTable1", little-endian, the final 8 bytes of every table file.
pub const SSTABLE_MAGIC: u64 = 0x5353_5461_626C_6531;

/// Nominal footer size. Footers pad up to this; oversized content
/// (large handles plus long min/max keys) grows past it, with the magic
/// always occupying the final 8 bytes.
pub const FOOTER_SIZE: usize = 64;

/// Block trailer: type byte plus CRC-32.
pub const BLOCK_TRAILER_SIZE: usize = 5;

pub const DEFAULT_BLOCK_SIZE: usize = 4096;
pub const DEFAULT_RESTART_INTERVAL: usize = 16;

/// Tags the contents of a trailered block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BlockType {
    Data = 0x00,
    Index = 0x01,
}

impl BlockType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0x00 => Some(BlockType::Data),
            0x01 => Some(BlockType::Index),
            _ => None,
        }
    }
}

/// Table-construction options.
#[derive(Debug, Clone)]
pub struct SSTableOptions {
    /// Flush threshold for data blocks.
    pub block_size: usize,
    /// Entries between forced full keys inside a data block.
    pub restart_interval: usize,
    /// Readers verify block trailers when set.
    pub verify_checksums: bool,
    pub use_bloom_filter: bool,
    pub bloom_policy: crate::bloom::BloomFilterPolicy,
}

impl Default for SSTableOptions {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            restart_interval: DEFAULT_RESTART_INTERVAL,
            verify_checksums: true,
            use_bloom_filter: true,
            bloom_policy: crate::bloom::BloomFilterPolicy::default(),
        }
    }
}

/// Names a block within the file: `offset(varint64) ‖ size(varint64)`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockHandle {
    pub offset: u64,
    pub size: u64,
}

impl BlockHandle {
    /// Upper bound on the encoded form (two maximal varint64s).
    pub const MAX_ENCODED_LENGTH: usize = 20;

    pub fn new(offset: u64, size: u64) -> Self {
        Self { offset, size }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::MAX_ENCODED_LENGTH);
        coding::put_varint64(&mut out, self.offset);
        coding::put_varint64(&mut out, self.size);
        out
    }

    /// Decodes from the front of `input`, advancing past the consumed
    /// bytes.
    pub fn decode(input: &mut &[u8]) -> Result<Self> {
        let offset = coding::get_varint64(input).ok_or(SSTableError::Incomplete)?;
        let size = coding::get_varint64(input).ok_or(SSTableError::Incomplete)?;
        Ok(Self { offset, size })
    }
}

/// Wraps finished block contents with `type ‖ crc32(contents ‖ type)`.
pub fn add_trailer(block_contents: &[u8], block_type: BlockType) -> Vec<u8> {
    let mut out = Vec::with_capacity(block_contents.len() + BLOCK_TRAILER_SIZE);
    out.extend_from_slice(block_contents);
    out.push(block_type as u8);

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&out);
    let crc = hasher.finalize();
    coding::put_fixed32(&mut out, crc);
    out
}

/// Checks a trailered block's type tag and checksum, returning the bare
/// contents on success.
pub fn verify_trailer(block: &[u8], expected: BlockType) -> Result<&[u8]> {
    if block.len() < BLOCK_TRAILER_SIZE {
        return Err(SSTableError::Incomplete);
    }
    let contents_len = block.len() - BLOCK_TRAILER_SIZE;
    let type_byte = block[contents_len];

    match BlockType::from_u8(type_byte) {
        Some(ty) if ty == expected => {}
        _ => {
            return Err(SSTableError::InvalidFormat(format!(
                "unexpected block type {type_byte:#04x}"
            )))
        }
    }

    let stored = coding::decode_fixed32(&block[contents_len + 1..]);
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&block[..contents_len + 1]);
    let computed = hasher.finalize();
    if stored != computed {
        return Err(SSTableError::CrcMismatch {
            expected: stored,
            actual: computed,
        });
    }

    Ok(&block[..contents_len])
}

/// Table metadata stored at the end of the file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Footer {
    pub index_handle: BlockHandle,
    /// Zero offset and size when the filter is disabled or empty.
    pub bloom_handle: BlockHandle,
    pub num_entries: u64,
    pub min_sequence: SequenceNumber,
    pub max_sequence: SequenceNumber,
    pub min_key: Vec<u8>,
    pub max_key: Vec<u8>,
}

impl Footer {
    /// Encodes the footer: length-prefixed handles, fixed metadata,
    /// length-prefixed keys, zero padding to the nominal size, magic.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(FOOTER_SIZE);

        let index_enc = self.index_handle.encode();
        coding::put_fixed32(&mut out, index_enc.len() as u32);
        out.extend_from_slice(&index_enc);

        let bloom_enc = self.bloom_handle.encode();
        coding::put_fixed32(&mut out, bloom_enc.len() as u32);
        out.extend_from_slice(&bloom_enc);

        coding::put_fixed64(&mut out, self.num_entries);
        coding::put_fixed64(&mut out, self.min_sequence);
        coding::put_fixed64(&mut out, self.max_sequence);

        coding::put_fixed32(&mut out, self.min_key.len() as u32);
        out.extend_from_slice(&self.min_key);
        coding::put_fixed32(&mut out, self.max_key.len() as u32);
        out.extend_from_slice(&self.max_key);

        while out.len() < FOOTER_SIZE - 8 {
            out.push(0);
        }
        coding::put_fixed64(&mut out, SSTABLE_MAGIC);
        out
    }

    /// Decodes a footer from `input`, which must span from the footer's
    /// first byte through the end of the file (the magic is checked at
    /// the very end of the slice).
    pub fn decode(input: &[u8]) -> Result<Self> {
        if input.len() < FOOTER_SIZE {
            return Err(SSTableError::Incomplete);
        }

        let magic = coding::decode_fixed64(&input[input.len() - 8..]);
        if magic != SSTABLE_MAGIC {
            return Err(SSTableError::InvalidFormat(format!(
                "bad table magic {magic:#018x}"
            )));
        }

        let mut cursor = input;
        let index_handle = Self::read_handle(&mut cursor)?;
        let bloom_handle = Self::read_handle(&mut cursor)?;

        if cursor.len() < 24 {
            return Err(SSTableError::Incomplete);
        }
        let num_entries = coding::decode_fixed64(cursor);
        let min_sequence = coding::decode_fixed64(&cursor[8..]);
        let max_sequence = coding::decode_fixed64(&cursor[16..]);
        cursor = &cursor[24..];

        let min_key = Self::read_key(&mut cursor)?;
        let max_key = Self::read_key(&mut cursor)?;

        Ok(Self {
            index_handle,
            bloom_handle,
            num_entries,
            min_sequence,
            max_sequence,
            min_key,
            max_key,
        })
    }

    fn read_handle(cursor: &mut &[u8]) -> Result<BlockHandle> {
        if cursor.len() < 4 {
            return Err(SSTableError::Incomplete);
        }
        let len = coding::decode_fixed32(cursor) as usize;
        *cursor = &cursor[4..];
        if cursor.len() < len {
            return Err(SSTableError::Incomplete);
        }
        let mut handle_bytes = &cursor[..len];
        let handle = BlockHandle::decode(&mut handle_bytes)?;
        *cursor = &cursor[len..];
        Ok(handle)
    }

    fn read_key(cursor: &mut &[u8]) -> Result<Vec<u8>> {
        if cursor.len() < 4 {
            return Err(SSTableError::Incomplete);
        }
        let len = coding::decode_fixed32(cursor) as usize;
        *cursor = &cursor[4..];
        if cursor.len() < len {
            return Err(SSTableError::Incomplete);
        }
        let key = cursor[..len].to_vec();
        *cursor = &cursor[len..];
        Ok(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_handle_roundtrip() {
        let handle = BlockHandle::new(12_345_678, 87_654_321);
        let encoded = handle.encode();
        assert!(encoded.len() <= BlockHandle::MAX_ENCODED_LENGTH);

        let mut input = encoded.as_slice();
        let decoded = BlockHandle::decode(&mut input).unwrap();
        assert_eq!(decoded, handle);
        assert!(input.is_empty());
    }

    #[test]
    fn block_handle_truncated() {
        let handle = BlockHandle::new(u64::MAX, u64::MAX);
        let encoded = handle.encode();
        let mut input = &encoded[..encoded.len() - 1];
        assert!(BlockHandle::decode(&mut input).is_err());
    }

    #[test]
    fn footer_roundtrip_is_nominal_size() {
        let footer = Footer {
            index_handle: BlockHandle::new(100_000, 5_000),
            bloom_handle: BlockHandle::new(105_000, 1_251),
            num_entries: 50_000,
            min_sequence: 1,
            max_sequence: 50_000,
            min_key: b"aaa".to_vec(),
            max_key: b"zzz".to_vec(),
        };

        let encoded = footer.encode();
        assert_eq!(encoded.len(), FOOTER_SIZE);

        let decoded = Footer::decode(&encoded).unwrap();
        assert_eq!(decoded, footer);
    }

    #[test]
    fn footer_with_long_keys_grows_past_nominal() {
        let footer = Footer {
            index_handle: BlockHandle::new(1 << 30, 4096),
            bloom_handle: BlockHandle::new((1 << 30) + 4096, 20_000),
            num_entries: 1_000_000,
            min_sequence: 1,
            max_sequence: 1_000_000,
            min_key: b"key000000".to_vec(),
            max_key: b"key999999".to_vec(),
        };

        let encoded = footer.encode();
        assert!(encoded.len() > FOOTER_SIZE);
        // Magic still terminates the footer.
        assert_eq!(coding::decode_fixed64(&encoded[encoded.len() - 8..]), SSTABLE_MAGIC);

        let decoded = Footer::decode(&encoded).unwrap();
        assert_eq!(decoded, footer);
    }

    #[test]
    fn footer_rejects_bad_magic() {
        let footer = Footer {
            index_handle: BlockHandle::new(100, 50),
            num_entries: 10,
            min_key: b"a".to_vec(),
            max_key: b"z".to_vec(),
            ..Default::default()
        };
        let mut encoded = footer.encode();
        let last = encoded.len() - 1;
        encoded[last] = 0x00;

        assert!(matches!(
            Footer::decode(&encoded).unwrap_err(),
            SSTableError::InvalidFormat(_)
        ));
    }

    #[test]
    fn footer_rejects_short_input() {
        assert!(matches!(
            Footer::decode(&[0u8; 10]).unwrap_err(),
            SSTableError::Incomplete
        ));
    }

    #[test]
    fn trailer_roundtrip() {
        let contents = b"some block contents";
        let wrapped = add_trailer(contents, BlockType::Data);
        assert_eq!(wrapped.len(), contents.len() + BLOCK_TRAILER_SIZE);

        let verified = verify_trailer(&wrapped, BlockType::Data).unwrap();
        assert_eq!(verified, contents);
    }

    #[test]
    fn trailer_rejects_wrong_type() {
        let wrapped = add_trailer(b"contents", BlockType::Data);
        assert!(verify_trailer(&wrapped, BlockType::Index).is_err());
    }

    #[test]
    fn trailer_rejects_corruption() {
        let mut wrapped = add_trailer(b"contents", BlockType::Index);
        wrapped[2] ^= 0x01;
        assert!(matches!(
            verify_trailer(&wrapped, BlockType::Index).unwrap_err(),
            SSTableError::CrcMismatch { .. }
        ));
    }

    #[test]
    fn trailer_rejects_truncation() {
        let wrapped = add_trailer(b"contents", BlockType::Data);
        assert!(matches!(
            verify_trailer(&wrapped[..3], BlockType::Data).unwrap_err(),
            SSTableError::Incomplete
        ));
    }
}
