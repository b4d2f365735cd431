//! Core key and value vocabulary.
//!
//! An *internal key* is a user key plus a sequence number and a value
//! type. Internal keys order by user key ascending, then sequence
//! descending, so that for one user key the newest entry is visited
//! first. The value type tags an entry as a regular value or a
//! tombstone and does not participate in the ordering.
//!
//! On disk an internal key is laid out as:
//!
//! ```text
//! user_key ‖ packed(8 bytes, little-endian)    packed = (seq << 8) | type
//! ```
//!
//! which puts the 7 meaningful sequence bytes in the upper positions and
//! the type tag in the lowest byte.

use std::cmp::Ordering;

use bytes::Bytes;

use crate::coding;

/// Monotonic 64-bit sequence number providing MVCC ordering.
pub type SequenceNumber = u64;

/// Sentinel "newest possible" sequence, used for snapshot lookup keys.
pub const MAX_SEQUENCE: SequenceNumber = u64::MAX;

/// Byte length of the packed sequence+type suffix of an encoded
/// internal key.
pub const PACKED_SUFFIX_LEN: usize = 8;

/// Distinguishes regular values from tombstones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ValueType {
    /// A regular key-value entry.
    Value = 0x01,
    /// A deletion marker; the associated value is always empty.
    Deletion = 0x02,
}

impl ValueType {
    /// Decodes a type tag, returning `None` for reserved values.
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0x01 => Some(ValueType::Value),
            0x02 => Some(ValueType::Deletion),
            _ => None,
        }
    }

    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

/// Packs a sequence number and value type into the 8-byte key suffix.
#[inline]
pub fn pack_sequence_and_type(seq: SequenceNumber, ty: ValueType) -> u64 {
    (seq << 8) | ty.to_u8() as u64
}

/// Splits a packed suffix back into (sequence, type).
///
/// Returns `None` if the type tag is reserved.
#[inline]
pub fn unpack_sequence_and_type(packed: u64) -> Option<(SequenceNumber, ValueType)> {
    let ty = ValueType::from_u8((packed & 0xff) as u8)?;
    Some((packed >> 8, ty))
}

/// A user key qualified by sequence number and value type.
///
/// This is the unit of ordering inside the memtable and SSTable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InternalKey {
    pub user_key: Bytes,
    pub sequence: SequenceNumber,
    pub value_type: ValueType,
}

impl InternalKey {
    pub fn new(user_key: impl Into<Bytes>, sequence: SequenceNumber, value_type: ValueType) -> Self {
        Self {
            user_key: user_key.into(),
            sequence,
            value_type,
        }
    }

    /// Encodes to the on-disk form `user_key ‖ packed(8 LE)`.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.user_key.len() + PACKED_SUFFIX_LEN);
        out.extend_from_slice(&self.user_key);
        coding::put_fixed64(&mut out, pack_sequence_and_type(self.sequence, self.value_type));
        out
    }

    /// Decodes an encoded internal key. Fails on short input or a
    /// reserved type tag.
    pub fn decode(encoded: &[u8]) -> Option<Self> {
        let user_len = encoded.len().checked_sub(PACKED_SUFFIX_LEN)?;
        let packed = coding::decode_fixed64(&encoded[user_len..]);
        let (sequence, value_type) = unpack_sequence_and_type(packed)?;
        Some(Self {
            user_key: Bytes::copy_from_slice(&encoded[..user_len]),
            sequence,
            value_type,
        })
    }
}

impl Ord for InternalKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.user_key
            .cmp(&other.user_key)
            // Sequence descending: the newer entry sorts first.
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

impl PartialOrd for InternalKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Returns the user-key portion of an encoded internal key.
#[inline]
pub fn extract_user_key(encoded: &[u8]) -> &[u8] {
    debug_assert!(encoded.len() >= PACKED_SUFFIX_LEN);
    &encoded[..encoded.len() - PACKED_SUFFIX_LEN]
}

/// Returns the packed sequence+type suffix of an encoded internal key.
#[inline]
pub fn extract_packed(encoded: &[u8]) -> u64 {
    debug_assert!(encoded.len() >= PACKED_SUFFIX_LEN);
    coding::decode_fixed64(&encoded[encoded.len() - PACKED_SUFFIX_LEN..])
}

/// Compares two encoded internal keys: user key ascending, sequence
/// descending. The type tag is ignored.
pub fn compare_encoded(a: &[u8], b: &[u8]) -> Ordering {
    let cmp = extract_user_key(a).cmp(extract_user_key(b));
    if cmp != Ordering::Equal {
        return cmp;
    }
    let seq_a = extract_packed(a) >> 8;
    let seq_b = extract_packed(b) >> 8;
    seq_b.cmp(&seq_a)
}

/// Outcome of a point lookup.
///
/// `Deleted` is distinct from `NotFound`: a tombstone in a newer
/// memtable must mask an older value further down the chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupResult {
    NotFound,
    Found(Bytes),
    Deleted,
}

impl LookupResult {
    /// True for `Found` and `Deleted`; the lookup chain stops at the
    /// first table that answers either way.
    pub fn is_conclusive(&self) -> bool {
        !matches!(self, LookupResult::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_type_roundtrip() {
        assert_eq!(ValueType::from_u8(0x01), Some(ValueType::Value));
        assert_eq!(ValueType::from_u8(0x02), Some(ValueType::Deletion));
        assert_eq!(ValueType::from_u8(0x00), None);
        assert_eq!(ValueType::from_u8(0x03), None);
    }

    #[test]
    fn pack_unpack() {
        let packed = pack_sequence_and_type(42, ValueType::Deletion);
        assert_eq!(packed, (42 << 8) | 0x02);
        assert_eq!(unpack_sequence_and_type(packed), Some((42, ValueType::Deletion)));

        // A reserved tag fails to unpack.
        assert_eq!(unpack_sequence_and_type(0x2a00), None);
    }

    #[test]
    fn internal_key_encode_decode() {
        let key = InternalKey::new(&b"user"[..], 7, ValueType::Value);
        let encoded = key.encode();
        assert_eq!(encoded.len(), 4 + PACKED_SUFFIX_LEN);
        assert_eq!(extract_user_key(&encoded), b"user");

        let decoded = InternalKey::decode(&encoded).unwrap();
        assert_eq!(decoded, key);
    }

    #[test]
    fn ordering_user_key_ascending() {
        let a = InternalKey::new(&b"a"[..], 5, ValueType::Value);
        let b = InternalKey::new(&b"b"[..], 1, ValueType::Value);
        assert!(a < b);
    }

    #[test]
    fn ordering_sequence_descending_within_key() {
        let newer = InternalKey::new(&b"k"[..], 10, ValueType::Value);
        let older = InternalKey::new(&b"k"[..], 3, ValueType::Value);
        assert!(newer < older);
    }

    #[test]
    fn compare_encoded_matches_struct_order() {
        let keys = [
            InternalKey::new(&b"a"[..], 9, ValueType::Value),
            InternalKey::new(&b"a"[..], 2, ValueType::Deletion),
            InternalKey::new(&b"ab"[..], 100, ValueType::Value),
            InternalKey::new(&b"b"[..], 1, ValueType::Value),
        ];
        for i in 0..keys.len() {
            for j in 0..keys.len() {
                let expected = keys[i].cmp(&keys[j]);
                let actual = compare_encoded(&keys[i].encode(), &keys[j].encode());
                assert_eq!(actual, expected, "{:?} vs {:?}", keys[i], keys[j]);
            }
        }
    }

    #[test]
    fn compare_encoded_ignores_type() {
        let put = InternalKey::new(&b"k"[..], 5, ValueType::Value).encode();
        let del = InternalKey::new(&b"k"[..], 5, ValueType::Deletion).encode();
        assert_eq!(compare_encoded(&put, &del), Ordering::Equal);
    }

    #[test]
    fn lookup_result_conclusive() {
        assert!(!LookupResult::NotFound.is_conclusive());
        assert!(LookupResult::Deleted.is_conclusive());
        assert!(LookupResult::Found(Bytes::from_static(b"v")).is_conclusive());
    }
}
