//! Subkey list parsing and construction (lf, lh, li, ri).
//!
//! Registry keys organize their children in sorted list cells. The writer
//! emits hash leaves (lh) and, above the leaf fanout, a two-level index
//! root (ri) over several leaves; the reader accepts all four kinds.

use crate::error::{RegistryError, Result};
use crate::utils::read_u32_le;

/// Maximum number of entries the writer packs into a single leaf before
/// splitting it under an index root. Sized so a full leaf (header plus
/// 8-byte entries) stays well within one bin.
pub const LEAF_FANOUT: usize = 1019;

/// Subkey list types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubkeyListType {
    /// Index leaf (li) - simple list of offsets.
    IndexLeaf,

    /// Fast leaf (lf) - list with 4-byte name hints.
    FastLeaf,

    /// Hash leaf (lh) - list with name hashes.
    HashLeaf,

    /// Index root (ri) - list of subkey list offsets.
    IndexRoot,
}

impl SubkeyListType {
    /// Parses a subkey list type from a 2-byte signature.
    pub fn from_signature(sig: &[u8; 2]) -> Result<Self> {
        match sig {
            b"li" => Ok(SubkeyListType::IndexLeaf),
            b"lf" => Ok(SubkeyListType::FastLeaf),
            b"lh" => Ok(SubkeyListType::HashLeaf),
            b"ri" => Ok(SubkeyListType::IndexRoot),
            _ => Err(RegistryError::InvalidSubkeyList { list_type: *sig }),
        }
    }
}

/// Subkey list entry (for lf/lh lists).
#[derive(Debug, Clone)]
pub struct SubkeyListEntry {
    /// Offset to the key node.
    pub key_offset: u32,

    /// Name hint (first 4 chars for lf, hash for lh).
    pub name_hint: u32,
}

/// Parsed subkey list.
#[derive(Debug, Clone)]
pub enum SubkeyList {
    /// Index leaf - simple list of offsets.
    IndexLeaf(Vec<u32>),

    /// Fast leaf or hash leaf - list with hints.
    LeafWithHints(Vec<SubkeyListEntry>),

    /// Index root - list of sublist offsets.
    IndexRoot(Vec<u32>),
}

impl SubkeyList {
    /// Parses a subkey list from cell data.
    ///
    /// # Arguments
    ///
    /// * `data` - Cell data (excluding size field).
    /// * `offset` - Offset of this cell for error reporting.
    pub fn parse(data: &[u8], offset: u32) -> Result<Self> {
        if data.len() < 4 {
            return Err(RegistryError::TruncatedData {
                offset,
                expected: 4,
                actual: data.len(),
            });
        }

        let sig = [data[0], data[1]];
        let list_type = SubkeyListType::from_signature(&sig)?;

        let count = u16::from_le_bytes([data[2], data[3]]) as usize;

        match list_type {
            SubkeyListType::IndexLeaf => {
                // li: signature (2) + count (2) + offsets (4 * count)
                let expected_size = 4 + (count * 4);
                if data.len() < expected_size {
                    return Err(RegistryError::TruncatedData {
                        offset,
                        expected: expected_size,
                        actual: data.len(),
                    });
                }

                let mut offsets = Vec::with_capacity(count);
                for i in 0..count {
                    offsets.push(read_u32_le(data, 4 + i * 4)?);
                }

                Ok(SubkeyList::IndexLeaf(offsets))
            }

            SubkeyListType::FastLeaf | SubkeyListType::HashLeaf => {
                // lf/lh: signature (2) + count (2) + entries (8 * count)
                // Each entry: offset (4) + hint (4)
                let expected_size = 4 + (count * 8);
                if data.len() < expected_size {
                    return Err(RegistryError::TruncatedData {
                        offset,
                        expected: expected_size,
                        actual: data.len(),
                    });
                }

                let mut entries = Vec::with_capacity(count);
                for i in 0..count {
                    let entry_pos = 4 + i * 8;
                    entries.push(SubkeyListEntry {
                        key_offset: read_u32_le(data, entry_pos)?,
                        name_hint: read_u32_le(data, entry_pos + 4)?,
                    });
                }

                Ok(SubkeyList::LeafWithHints(entries))
            }

            SubkeyListType::IndexRoot => {
                // ri: signature (2) + count (2) + offsets (4 * count)
                let expected_size = 4 + (count * 4);
                if data.len() < expected_size {
                    return Err(RegistryError::TruncatedData {
                        offset,
                        expected: expected_size,
                        actual: data.len(),
                    });
                }

                let mut offsets = Vec::with_capacity(count);
                for i in 0..count {
                    offsets.push(read_u32_le(data, 4 + i * 4)?);
                }

                Ok(SubkeyList::IndexRoot(offsets))
            }
        }
    }

    /// Returns an iterator over the offsets held directly by this list.
    ///
    /// For leaves these are key node offsets; for an index root they are
    /// sublist offsets.
    pub fn offsets_iter(&self) -> impl Iterator<Item = u32> + '_ {
        match self {
            SubkeyList::IndexLeaf(offsets) => {
                Box::new(offsets.iter().copied()) as Box<dyn Iterator<Item = u32> + '_>
            }
            SubkeyList::LeafWithHints(entries) => {
                Box::new(entries.iter().map(|e| e.key_offset))
            }
            SubkeyList::IndexRoot(offsets) => Box::new(offsets.iter().copied()),
        }
    }

    /// Returns the number of entries in this list.
    pub fn len(&self) -> usize {
        match self {
            SubkeyList::IndexLeaf(offsets) => offsets.len(),
            SubkeyList::LeafWithHints(entries) => entries.len(),
            SubkeyList::IndexRoot(offsets) => offsets.len(),
        }
    }

    /// Returns true if this list is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true if this is an index root (contains sublists).
    pub fn is_index_root(&self) -> bool {
        matches!(self, SubkeyList::IndexRoot(_))
    }
}

/// Computes the lh name hash: the uppercased characters folded with a
/// multiplier of 37, truncated to 32 bits.
///
/// Names differing only in case hash identically.
pub fn lh_hash(name: &str) -> u32 {
    let mut hash: u32 = 0;
    for c in name.chars().flat_map(char::to_uppercase) {
        hash = hash.wrapping_mul(37).wrapping_add(c as u32);
    }
    hash
}

/// Computes the lf name hint: the first four bytes of the name, zero-padded.
pub fn lf_hint(name: &str) -> u32 {
    let mut bytes = [0u8; 4];
    for (i, b) in name.bytes().take(4).enumerate() {
        bytes[i] = b;
    }
    u32::from_le_bytes(bytes)
}

/// Serializes an lh payload from `(key offset, name hash)` entries.
pub fn build_hash_leaf(entries: &[(u32, u32)]) -> Result<Vec<u8>> {
    if entries.len() > u16::MAX as usize {
        return Err(RegistryError::SanityLimit {
            what: "hash leaf entries",
            value: entries.len() as u64,
            max: u16::MAX as u64,
        });
    }

    let mut buf = Vec::with_capacity(4 + entries.len() * 8);
    buf.extend_from_slice(b"lh");
    buf.extend_from_slice(&(entries.len() as u16).to_le_bytes());
    for &(offset, hash) in entries {
        buf.extend_from_slice(&offset.to_le_bytes());
        buf.extend_from_slice(&hash.to_le_bytes());
    }
    Ok(buf)
}

/// Serializes an ri payload referencing `leaves` sublist cells.
pub fn build_index_root(leaves: &[u32]) -> Result<Vec<u8>> {
    if leaves.len() > u16::MAX as usize {
        return Err(RegistryError::SanityLimit {
            what: "index root entries",
            value: leaves.len() as u64,
            max: u16::MAX as u64,
        });
    }

    let mut buf = Vec::with_capacity(4 + leaves.len() * 4);
    buf.extend_from_slice(b"ri");
    buf.extend_from_slice(&(leaves.len() as u16).to_le_bytes());
    for &offset in leaves {
        buf.extend_from_slice(&offset.to_le_bytes());
    }
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subkey_list_type() {
        assert_eq!(
            SubkeyListType::from_signature(b"li").unwrap(),
            SubkeyListType::IndexLeaf
        );
        assert_eq!(
            SubkeyListType::from_signature(b"lf").unwrap(),
            SubkeyListType::FastLeaf
        );
        assert_eq!(
            SubkeyListType::from_signature(b"lh").unwrap(),
            SubkeyListType::HashLeaf
        );
        assert_eq!(
            SubkeyListType::from_signature(b"ri").unwrap(),
            SubkeyListType::IndexRoot
        );
    }

    #[test]
    fn test_invalid_signature() {
        let result = SubkeyListType::from_signature(b"XX");
        assert!(result.is_err());
    }

    #[test]
    fn test_lh_hash_case_insensitive() {
        assert_eq!(lh_hash("Software"), lh_hash("SOFTWARE"));
        assert_eq!(lh_hash("Software"), lh_hash("software"));
        assert_ne!(lh_hash("Software"), lh_hash("Hardware"));
    }

    #[test]
    fn test_lh_hash_known_values() {
        // h = h*37 + c over the uppercased name
        assert_eq!(lh_hash("A"), 65);
        assert_eq!(lh_hash("AB"), 65 * 37 + 66);
        assert_eq!(lh_hash(""), 0);
    }

    #[test]
    fn test_lf_hint_padding() {
        assert_eq!(lf_hint("AB"), u32::from_le_bytes([0x41, 0x42, 0, 0]));
        assert_eq!(
            lf_hint("Software"),
            u32::from_le_bytes([0x53, 0x6F, 0x66, 0x74])
        );
    }

    #[test]
    fn test_build_hash_leaf_round_trip() {
        let entries = [(0x100, lh_hash("Alpha")), (0x200, lh_hash("Beta"))];
        let payload = build_hash_leaf(&entries).unwrap();

        match SubkeyList::parse(&payload, 0).unwrap() {
            SubkeyList::LeafWithHints(parsed) => {
                assert_eq!(parsed.len(), 2);
                assert_eq!(parsed[0].key_offset, 0x100);
                assert_eq!(parsed[0].name_hint, lh_hash("Alpha"));
                assert_eq!(parsed[1].key_offset, 0x200);
            }
            other => panic!("expected leaf, got {:?}", other),
        }
    }

    #[test]
    fn test_build_index_root_round_trip() {
        let payload = build_index_root(&[0x1000, 0x2000, 0x3000]).unwrap();

        match SubkeyList::parse(&payload, 0).unwrap() {
            SubkeyList::IndexRoot(offsets) => {
                assert_eq!(offsets, vec![0x1000, 0x2000, 0x3000]);
            }
            other => panic!("expected index root, got {:?}", other),
        }
    }
}
