//! Registry value (vk) parsing, construction, and data encoding.

use crate::cell::{ValueType, VALUE_COMP_NAME, VALUE_DATA_INLINE};
use crate::error::{RegistryError, Result};
use crate::utils::{
    decode_name, encode_name, read_u16_le, read_u32_le, write_u16_le, write_u32_le,
};
use byteorder::{BigEndian, LittleEndian, ReadBytesExt};
use std::io::Cursor;

/// Minimum size of a value key structure in bytes.
pub const VALUE_KEY_MIN_SIZE: usize = 20;

/// Offset of the value name in the vk payload.
const VALUE_NAME_OFFSET: usize = 0x14;

// Field offsets within the vk payload, used for in-place patches.
pub(crate) const VK_DATA_LENGTH: usize = 0x04;
pub(crate) const VK_DATA_OFFSET: usize = 0x08;
pub(crate) const VK_TYPE: usize = 0x0C;

/// Value key (vk) structure.
///
/// Represents a registry value with its name, type, and data reference.
#[derive(Debug, Clone)]
pub struct ValueKey {
    /// Length of value name.
    pub name_length: u16,

    /// Length of value data.
    pub data_length: u32,

    /// Offset to value data (or the data itself when stored inline).
    pub data_offset: u32,

    /// Value data type.
    pub data_type: ValueType,

    /// Flags (0x0001 = name is ASCII).
    pub flags: u16,

    /// Whether the data lives in the data_offset field itself.
    pub inline: bool,

    /// Value name. Empty for the default (unnamed) value.
    pub name: String,
}

impl ValueKey {
    /// Parses a value key from cell data.
    ///
    /// # Arguments
    ///
    /// * `data` - Cell data (excluding size field, starting with "vk" signature).
    /// * `offset` - Offset of this cell for error reporting.
    ///
    /// # Errors
    ///
    /// Returns an error if the data is malformed or truncated.
    pub fn parse(data: &[u8], offset: u32) -> Result<Self> {
        if data.len() < VALUE_KEY_MIN_SIZE {
            return Err(RegistryError::TruncatedData {
                offset,
                expected: VALUE_KEY_MIN_SIZE,
                actual: data.len(),
            });
        }

        // Verify signature
        if &data[0..2] != b"vk" {
            return Err(RegistryError::InvalidFormat(format!(
                "Expected 'vk' signature at offset {:#x}",
                offset
            )));
        }

        let name_length = read_u16_le(data, 0x02)?;

        // High bit of the length field marks inline storage
        let data_length_raw = read_u32_le(data, VK_DATA_LENGTH)?;
        let inline = data_length_raw & VALUE_DATA_INLINE != 0;
        let data_length = data_length_raw & !VALUE_DATA_INLINE;

        let data_offset = read_u32_le(data, VK_DATA_OFFSET)?;
        let data_type = ValueType::from_u32(read_u32_le(data, VK_TYPE)?);
        let flags = read_u16_le(data, 0x10)?;

        // Spare field at 0x12 (2 bytes) - unused

        // Value name starts at offset 0x14
        let name = if name_length > 0 {
            let name_end = VALUE_NAME_OFFSET + name_length as usize;
            if name_end > data.len() {
                return Err(RegistryError::TruncatedData {
                    offset,
                    expected: name_end,
                    actual: data.len(),
                });
            }

            decode_name(
                &data[VALUE_NAME_OFFSET..name_end],
                flags & VALUE_COMP_NAME != 0,
                offset,
            )?
        } else {
            String::new()
        };

        Ok(ValueKey {
            name_length,
            data_length,
            data_offset,
            data_type,
            flags,
            inline,
            name,
        })
    }

    /// Serializes a vk payload.
    ///
    /// Payloads of four bytes or fewer are stored inline in the data-offset
    /// field with the high bit of the length set; larger payloads reference
    /// the cell at `data_offset`.
    pub fn build(name: &str, data_type: ValueType, data_length: u32, data_ref: u32) -> Result<Vec<u8>> {
        let (name_bytes, compressed) = encode_name(name);
        if name_bytes.len() > u16::MAX as usize {
            return Err(RegistryError::InvalidArgument(format!(
                "Value name too long: {} bytes",
                name_bytes.len()
            )));
        }

        let inline = data_length <= 4;
        let length_field = if inline {
            data_length | VALUE_DATA_INLINE
        } else {
            data_length
        };

        let mut buf = vec![0u8; VALUE_KEY_MIN_SIZE + name_bytes.len()];
        buf[0..2].copy_from_slice(b"vk");
        write_u16_le(&mut buf, 0x02, name_bytes.len() as u16)?;
        write_u32_le(&mut buf, VK_DATA_LENGTH, length_field)?;
        write_u32_le(&mut buf, VK_DATA_OFFSET, data_ref)?;
        write_u32_le(&mut buf, VK_TYPE, data_type.code())?;
        write_u16_le(&mut buf, 0x10, if compressed { VALUE_COMP_NAME } else { 0 })?;
        buf[VALUE_NAME_OFFSET..].copy_from_slice(&name_bytes);

        Ok(buf)
    }

    /// Returns true if the data is stored inline (in the data_offset field).
    pub fn is_inline_data(&self) -> bool {
        self.inline
    }

    /// Extracts inline data (when the inline bit is set).
    pub fn inline_data(&self) -> Vec<u8> {
        let bytes = self.data_offset.to_le_bytes();
        bytes[..(self.data_length as usize).min(4)].to_vec()
    }
}

/// Splits a MULTI_SZ payload into its strings.
///
/// Each string is a NUL-terminated run of UTF-16 code units; the list ends
/// with one extra NUL. Empty strings are legitimate elements, so the runs
/// are scanned unit by unit rather than split-and-filtered: only a NUL
/// that starts a run *and* sits in the final position is the terminator.
/// A missing terminator (seen in foreign hives) yields the trailing run
/// as a final string.
fn parse_multi_string(data: &[u8], offset: u32) -> Result<Vec<String>> {
    if data.len() % 2 != 0 {
        return Err(RegistryError::InvalidUtf16 { offset });
    }
    let units: Vec<u16> = data
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();

    let mut strings = Vec::new();
    let mut start = 0;
    for (i, &unit) in units.iter().enumerate() {
        if unit != 0 {
            continue;
        }
        if start == i && i == units.len() - 1 {
            // List terminator
            start = i + 1;
            break;
        }
        strings.push(crate::utils::read_utf16_string(
            &data[start * 2..i * 2],
            offset,
        )?);
        start = i + 1;
    }
    if start < units.len() {
        strings.push(crate::utils::read_utf16_string(&data[start * 2..], offset)?);
    }
    Ok(strings)
}

/// Packs up to four bytes of payload into the vk data-offset field.
pub fn pack_inline(data: &[u8]) -> u32 {
    let mut bytes = [0u8; 4];
    bytes[..data.len().min(4)].copy_from_slice(&data[..data.len().min(4)]);
    u32::from_le_bytes(bytes)
}

/// Parsed registry value data.
#[derive(Debug, Clone, PartialEq)]
pub enum ValueData {
    /// No data.
    None,

    /// String value.
    String(String),

    /// Expandable string value.
    ExpandString(String),

    /// Binary data.
    Binary(Vec<u8>),

    /// 32-bit integer.
    Dword(u32),

    /// 32-bit big-endian integer.
    DwordBigEndian(u32),

    /// Multiple strings.
    MultiString(Vec<String>),

    /// 64-bit integer.
    Qword(u64),

    /// Unknown or unsupported type.
    Unknown(Vec<u8>),
}

impl ValueData {
    /// Parses value data based on the value type.
    ///
    /// # Arguments
    ///
    /// * `data` - Raw value data bytes.
    /// * `value_type` - Type of the value.
    /// * `offset` - Offset for error reporting.
    pub fn parse(data: &[u8], value_type: ValueType, offset: u32) -> Result<Self> {
        if data.is_empty() {
            return Ok(ValueData::None);
        }

        match value_type {
            ValueType::None => Ok(ValueData::None),

            ValueType::String | ValueType::ExpandString => {
                let s = crate::utils::read_utf16_string(data, offset)?;
                if value_type == ValueType::String {
                    Ok(ValueData::String(s))
                } else {
                    Ok(ValueData::ExpandString(s))
                }
            }

            ValueType::Binary => Ok(ValueData::Binary(data.to_vec())),

            ValueType::Dword => {
                if data.len() < 4 {
                    return Err(RegistryError::TruncatedData {
                        offset,
                        expected: 4,
                        actual: data.len(),
                    });
                }
                let mut cursor = Cursor::new(data);
                let value = cursor.read_u32::<LittleEndian>()?;
                Ok(ValueData::Dword(value))
            }

            ValueType::DwordBigEndian => {
                if data.len() < 4 {
                    return Err(RegistryError::TruncatedData {
                        offset,
                        expected: 4,
                        actual: data.len(),
                    });
                }
                let mut cursor = Cursor::new(data);
                let value = cursor.read_u32::<BigEndian>()?;
                Ok(ValueData::DwordBigEndian(value))
            }

            ValueType::Qword => {
                if data.len() < 8 {
                    return Err(RegistryError::TruncatedData {
                        offset,
                        expected: 8,
                        actual: data.len(),
                    });
                }
                let mut cursor = Cursor::new(data);
                let value = cursor.read_u64::<LittleEndian>()?;
                Ok(ValueData::Qword(value))
            }

            ValueType::MultiString => Ok(ValueData::MultiString(parse_multi_string(data, offset)?)),

            // For other types, return raw binary data
            _ => Ok(ValueData::Unknown(data.to_vec())),
        }
    }

    /// Serializes this value into the §6 on-disk payload encoding.
    ///
    /// Strings become UTF-16LE with a NUL terminator; MULTI_SZ strings are
    /// each NUL-terminated with a final extra NUL closing the list.
    pub fn encode(&self) -> Vec<u8> {
        fn utf16_z(s: &str) -> impl Iterator<Item = u8> + '_ {
            s.encode_utf16()
                .chain(std::iter::once(0u16))
                .flat_map(|unit| unit.to_le_bytes())
        }

        match self {
            ValueData::None => Vec::new(),
            ValueData::String(s) | ValueData::ExpandString(s) => utf16_z(s).collect(),
            ValueData::Binary(b) | ValueData::Unknown(b) => b.clone(),
            ValueData::Dword(d) => d.to_le_bytes().to_vec(),
            ValueData::DwordBigEndian(d) => d.to_be_bytes().to_vec(),
            ValueData::Qword(q) => q.to_le_bytes().to_vec(),
            ValueData::MultiString(strings) => {
                let mut out: Vec<u8> = strings.iter().flat_map(|s| utf16_z(s)).collect();
                out.extend_from_slice(&0u16.to_le_bytes());
                out
            }
        }
    }

    /// Returns the on-disk value type matching this data.
    pub fn value_type(&self) -> ValueType {
        match self {
            ValueData::None => ValueType::None,
            ValueData::String(_) => ValueType::String,
            ValueData::ExpandString(_) => ValueType::ExpandString,
            ValueData::Binary(_) => ValueType::Binary,
            ValueData::Dword(_) => ValueType::Dword,
            ValueData::DwordBigEndian(_) => ValueType::DwordBigEndian,
            ValueData::MultiString(_) => ValueType::MultiString,
            ValueData::Qword(_) => ValueType::Qword,
            ValueData::Unknown(_) => ValueType::Unknown(0),
        }
    }

    /// Converts the value data to a string representation.
    pub fn to_display_string(&self) -> String {
        match self {
            ValueData::None => String::from("(none)"),
            ValueData::String(s) | ValueData::ExpandString(s) => s.clone(),
            ValueData::Binary(b) => format!("{:02X?}", b),
            ValueData::Dword(d) => format!("{} (0x{:08X})", d, d),
            ValueData::DwordBigEndian(d) => format!("{} (0x{:08X})", d, d),
            ValueData::Qword(q) => format!("{} (0x{:016X})", q, q),
            ValueData::MultiString(strings) => strings.join(", "),
            ValueData::Unknown(b) => format!("{:02X?}", b),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_key_minimum_size() {
        let data = vec![0u8; 19];
        let result = ValueKey::parse(&data, 0);
        assert!(result.is_err());
    }

    #[test]
    fn test_value_key_invalid_signature() {
        let mut data = vec![0u8; 24];
        data[0..2].copy_from_slice(b"XX");
        let result = ValueKey::parse(&data, 0);
        assert!(result.is_err());
    }

    #[test]
    fn test_build_inline_dword() {
        let payload = ValueKey::build("Timeout", ValueType::Dword, 4, pack_inline(&30u32.to_le_bytes())).unwrap();
        let vk = ValueKey::parse(&payload, 0).unwrap();

        assert!(vk.is_inline_data());
        assert_eq!(vk.name, "Timeout");
        assert_eq!(vk.data_length, 4);
        assert_eq!(vk.inline_data(), 30u32.to_le_bytes());
        assert_eq!(vk.data_type, ValueType::Dword);
    }

    #[test]
    fn test_build_external_reference() {
        let payload = ValueKey::build("Blob", ValueType::Binary, 100, 0x1240).unwrap();
        let vk = ValueKey::parse(&payload, 0).unwrap();

        assert!(!vk.is_inline_data());
        assert_eq!(vk.data_length, 100);
        assert_eq!(vk.data_offset, 0x1240);
    }

    #[test]
    fn test_encode_string_layout() {
        let encoded = ValueData::String("1.0".to_string()).encode();
        assert_eq!(encoded, b"1\x00.\x000\x00\x00\x00");
    }

    #[test]
    fn test_encode_multi_string_layout() {
        let encoded = ValueData::MultiString(vec![
            "A".to_string(),
            "B".to_string(),
            "C".to_string(),
        ])
        .encode();
        assert_eq!(
            encoded,
            [0x41, 0x00, 0x00, 0x00, 0x42, 0x00, 0x00, 0x00, 0x43, 0x00, 0x00, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn test_encode_parse_round_trip() {
        let samples = [
            ValueData::String("hello".to_string()),
            ValueData::ExpandString("%PATH%".to_string()),
            ValueData::Dword(30),
            ValueData::DwordBigEndian(0xDEADBEEF),
            ValueData::Qword(9_876_543_210),
            ValueData::Binary(vec![1, 2, 3, 4, 5]),
            ValueData::MultiString(vec!["x".to_string(), "y".to_string()]),
            ValueData::MultiString(vec!["".to_string()]),
        ];
        for sample in samples {
            let encoded = sample.encode();
            let decoded = ValueData::parse(&encoded, sample.value_type(), 0).unwrap();
            assert_eq!(decoded, sample);
        }
    }

    #[test]
    fn test_multi_string_preserves_empty_elements() {
        let sample = ValueData::MultiString(vec![
            "A".to_string(),
            "".to_string(),
            "B".to_string(),
        ]);
        let encoded = sample.encode();
        assert_eq!(
            encoded,
            [0x41, 0x00, 0x00, 0x00, 0x00, 0x00, 0x42, 0x00, 0x00, 0x00, 0x00, 0x00]
        );

        let decoded = ValueData::parse(&encoded, ValueType::MultiString, 0).unwrap();
        assert_eq!(decoded, sample);
    }

    #[test]
    fn test_multi_string_tolerates_missing_terminator() {
        // "A\0B\0" without the closing list NUL
        let data = [0x41, 0x00, 0x00, 0x00, 0x42, 0x00, 0x00, 0x00];
        match ValueData::parse(&data, ValueType::MultiString, 0).unwrap() {
            ValueData::MultiString(strings) => assert_eq!(strings, vec!["A", "B"]),
            other => panic!("expected multi string, got {:?}", other),
        }
    }
}
