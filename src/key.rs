//! Registry key node (nk) parsing and construction.

use crate::cell::KeyNodeFlags;
use crate::error::{RegistryError, Result};
use crate::utils::{
    decode_name, encode_name, read_u16_le, read_u32_le, read_u64_le, write_u16_le, write_u32_le,
    write_u64_le, NO_CELL,
};

/// Minimum size of a key node structure in bytes.
pub const KEY_NODE_MIN_SIZE: usize = 76;

/// Offset of the key name in the key node structure.
const KEY_NAME_OFFSET: usize = 0x4C;

// Field offsets within the nk payload, used for in-place patches.
pub(crate) const NK_FLAGS: usize = 0x02;
pub(crate) const NK_TIMESTAMP: usize = 0x04;
pub(crate) const NK_PARENT: usize = 0x10;
pub(crate) const NK_SUBKEY_COUNT: usize = 0x14;
pub(crate) const NK_SUBKEY_LIST: usize = 0x1C;
pub(crate) const NK_VALUE_COUNT: usize = 0x24;
pub(crate) const NK_VALUE_LIST: usize = 0x28;
pub(crate) const NK_SECURITY: usize = 0x2C;
pub(crate) const NK_MAX_VALUE_NAME_LEN: usize = 0x3C;
pub(crate) const NK_MAX_VALUE_DATA_LEN: usize = 0x40;

/// Key node (nk) structure.
///
/// Represents a registry key with metadata including name, timestamps,
/// and references to subkeys and values.
#[derive(Debug, Clone)]
pub struct KeyNode {
    /// Flags for this key.
    pub flags: KeyNodeFlags,

    /// Last written timestamp (Windows FILETIME).
    pub last_written: u64,

    /// Access bits (unused).
    pub access_bits: u32,

    /// Offset to parent key node.
    pub parent_offset: u32,

    /// Number of subkeys.
    pub subkey_count: u32,

    /// Number of volatile subkeys.
    pub volatile_subkey_count: u32,

    /// Offset to subkey list.
    pub subkey_list_offset: u32,

    /// Offset to volatile subkey list.
    pub volatile_subkey_list_offset: u32,

    /// Number of values.
    pub value_count: u32,

    /// Offset to value list.
    pub value_list_offset: u32,

    /// Offset to security descriptor.
    pub security_offset: u32,

    /// Offset to class name.
    pub class_name_offset: u32,

    /// Maximum length of subkey name.
    pub max_subkey_name_len: u32,

    /// Maximum length of subkey class name.
    pub max_subkey_class_len: u32,

    /// Maximum length of value name.
    pub max_value_name_len: u32,

    /// Maximum length of value data.
    pub max_value_data_len: u32,

    /// Work variable (unused).
    pub work_var: u32,

    /// Length of key name.
    pub name_length: u16,

    /// Length of class name.
    pub class_name_length: u16,

    /// Key name.
    pub name: String,
}

impl KeyNode {
    /// Parses a key node from cell data.
    ///
    /// # Arguments
    ///
    /// * `data` - Cell data (excluding size field, starting with "nk" signature).
    /// * `offset` - Offset of this cell for error reporting.
    ///
    /// # Errors
    ///
    /// Returns an error if the data is malformed or truncated.
    pub fn parse(data: &[u8], offset: u32) -> Result<Self> {
        if data.len() < KEY_NODE_MIN_SIZE {
            return Err(RegistryError::TruncatedData {
                offset,
                expected: KEY_NODE_MIN_SIZE,
                actual: data.len(),
            });
        }

        // Verify signature
        if &data[0..2] != b"nk" {
            return Err(RegistryError::InvalidFormat(format!(
                "Expected 'nk' signature at offset {:#x}",
                offset
            )));
        }

        let flags = KeyNodeFlags::new(read_u16_le(data, NK_FLAGS)?);
        let last_written = read_u64_le(data, NK_TIMESTAMP)?;

        let access_bits = read_u32_le(data, 0x0C)?;
        let parent_offset = read_u32_le(data, NK_PARENT)?;
        let subkey_count = read_u32_le(data, NK_SUBKEY_COUNT)?;
        let volatile_subkey_count = read_u32_le(data, 0x18)?;
        let subkey_list_offset = read_u32_le(data, NK_SUBKEY_LIST)?;
        let volatile_subkey_list_offset = read_u32_le(data, 0x20)?;
        let value_count = read_u32_le(data, NK_VALUE_COUNT)?;
        let value_list_offset = read_u32_le(data, NK_VALUE_LIST)?;
        let security_offset = read_u32_le(data, NK_SECURITY)?;
        let class_name_offset = read_u32_le(data, 0x30)?;

        let max_subkey_name_len = read_u32_le(data, 0x34)?;
        let max_subkey_class_len = read_u32_le(data, 0x38)?;
        let max_value_name_len = read_u32_le(data, NK_MAX_VALUE_NAME_LEN)?;
        let max_value_data_len = read_u32_le(data, NK_MAX_VALUE_DATA_LEN)?;
        let work_var = read_u32_le(data, 0x44)?;

        let name_length = read_u16_le(data, 0x48)?;
        let class_name_length = read_u16_le(data, 0x4A)?;

        // Key name starts at offset 0x4C
        let name = if name_length > 0 {
            let name_end = KEY_NAME_OFFSET + name_length as usize;
            if name_end > data.len() {
                return Err(RegistryError::TruncatedData {
                    offset,
                    expected: name_end,
                    actual: data.len(),
                });
            }

            decode_name(
                &data[KEY_NAME_OFFSET..name_end],
                flags.is_compressed(),
                offset,
            )?
        } else {
            String::new()
        };

        Ok(KeyNode {
            flags,
            last_written,
            access_bits,
            parent_offset,
            subkey_count,
            volatile_subkey_count,
            subkey_list_offset,
            volatile_subkey_list_offset,
            value_count,
            value_list_offset,
            security_offset,
            class_name_offset,
            max_subkey_name_len,
            max_subkey_class_len,
            max_value_name_len,
            max_value_data_len,
            work_var,
            name_length,
            class_name_length,
            name,
        })
    }

    /// Serializes a fresh key node payload.
    ///
    /// The node starts with no subkeys, no values, and no class name. The
    /// name is stored compressed when it fits the ASCII subset, UTF-16LE
    /// otherwise, and `extra_flags` (e.g. `ROOT_KEY`) are OR-ed in.
    pub fn build(
        name: &str,
        parent_offset: u32,
        security_offset: u32,
        timestamp: u64,
        extra_flags: u16,
    ) -> Result<Vec<u8>> {
        let (name_bytes, compressed) = encode_name(name);
        if name_bytes.len() > u16::MAX as usize {
            return Err(RegistryError::InvalidArgument(format!(
                "Key name too long: {} bytes",
                name_bytes.len()
            )));
        }

        let mut flags = extra_flags;
        if compressed {
            flags |= KeyNodeFlags::COMP_NAME;
        }

        let mut buf = vec![0u8; KEY_NODE_MIN_SIZE + name_bytes.len()];
        buf[0..2].copy_from_slice(b"nk");
        write_u16_le(&mut buf, NK_FLAGS, flags)?;
        write_u64_le(&mut buf, NK_TIMESTAMP, timestamp)?;
        write_u32_le(&mut buf, NK_PARENT, parent_offset)?;
        write_u32_le(&mut buf, NK_SUBKEY_COUNT, 0)?;
        write_u32_le(&mut buf, 0x18, 0)?;
        write_u32_le(&mut buf, NK_SUBKEY_LIST, NO_CELL)?;
        write_u32_le(&mut buf, 0x20, NO_CELL)?;
        write_u32_le(&mut buf, NK_VALUE_COUNT, 0)?;
        write_u32_le(&mut buf, NK_VALUE_LIST, NO_CELL)?;
        write_u32_le(&mut buf, NK_SECURITY, security_offset)?;
        write_u32_le(&mut buf, 0x30, NO_CELL)?;
        write_u16_le(&mut buf, 0x48, name_bytes.len() as u16)?;
        buf[KEY_NAME_OFFSET..].copy_from_slice(&name_bytes);

        Ok(buf)
    }

    /// Returns true if this key has subkeys.
    pub fn has_subkeys(&self) -> bool {
        self.subkey_count > 0
    }

    /// Returns true if this key has values.
    pub fn has_values(&self) -> bool {
        self.value_count > 0
    }

    /// Returns true if this is the root key.
    pub fn is_root(&self) -> bool {
        self.flags.is_root()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_node_minimum_size() {
        let data = vec![0u8; 75];
        let result = KeyNode::parse(&data, 0);
        assert!(result.is_err());
    }

    #[test]
    fn test_key_node_invalid_signature() {
        let mut data = vec![0u8; 80];
        data[0..2].copy_from_slice(b"XX");
        let result = KeyNode::parse(&data, 0);
        assert!(result.is_err());
    }

    #[test]
    fn test_build_parse_round_trip() {
        let payload = KeyNode::build("MyApp", 0x20, NO_CELL, 12345, 0).unwrap();
        let node = KeyNode::parse(&payload, 0).unwrap();

        assert_eq!(node.name, "MyApp");
        assert!(node.flags.is_compressed());
        assert_eq!(node.parent_offset, 0x20);
        assert_eq!(node.last_written, 12345);
        assert_eq!(node.subkey_count, 0);
        assert_eq!(node.value_count, 0);
        assert_eq!(node.subkey_list_offset, NO_CELL);
        assert_eq!(node.value_list_offset, NO_CELL);
        assert_eq!(node.security_offset, NO_CELL);
    }

    #[test]
    fn test_build_utf16_name() {
        let payload = KeyNode::build("Größe", 0, NO_CELL, 0, 0).unwrap();
        let node = KeyNode::parse(&payload, 0).unwrap();

        assert!(!node.flags.is_compressed());
        assert_eq!(node.name, "Größe");
        assert_eq!(node.name_length, 10);
    }

    #[test]
    fn test_build_root_flags() {
        let payload = KeyNode::build(
            "",
            NO_CELL,
            NO_CELL,
            0,
            KeyNodeFlags::ROOT_KEY | KeyNodeFlags::NO_DELETE,
        )
        .unwrap();
        let node = KeyNode::parse(&payload, 0).unwrap();

        assert!(node.is_root());
        assert_eq!(node.name, "");
        assert_eq!(payload.len(), KEY_NODE_MIN_SIZE);
    }
}
