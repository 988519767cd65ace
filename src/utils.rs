//! Utility functions for binary parsing, serialization, and string conversion.

use crate::error::{RegistryError, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use encoding_rs::UTF_16LE;
use std::cmp::Ordering;
use std::io::Cursor;

/// Offset where hive bins start (after base block)
pub const HBIN_START_OFFSET: u32 = 0x1000;

/// Size of a hive page; bins and arena growth are multiples of this.
pub const PAGE_SIZE: usize = 0x1000;

/// Sentinel cell reference meaning "no reference".
pub const NO_CELL: u32 = 0xFFFF_FFFF;

/// Seconds between 1601-01-01 (FILETIME epoch) and 1970-01-01 (Unix epoch).
const FILETIME_UNIX_DIFF: i64 = 11_644_473_600;

/// Reads an ASCII string from a byte slice, trimming null terminators.
///
/// Registry strings are often null-terminated, so we trim trailing nulls.
/// Uses lossy conversion to handle any invalid UTF-8 bytes gracefully.
pub fn read_ascii_string(data: &[u8]) -> String {
    String::from_utf8_lossy(data)
        .trim_end_matches('\0')
        .to_string()
}

/// Reads a UTF-16LE string from a byte slice, trimming null terminators.
///
/// Registry strings are typically null-terminated. This function decodes
/// UTF-16LE data and removes trailing null characters.
///
/// # Errors
///
/// Returns an error if the data length is not even (UTF-16 requires 2-byte units)
/// or if the UTF-16 decoding fails.
pub fn read_utf16_string(data: &[u8], offset: u32) -> Result<String> {
    if data.is_empty() {
        return Ok(String::new());
    }

    // UTF-16 requires even number of bytes
    if data.len() % 2 != 0 {
        return Err(RegistryError::InvalidUtf16 { offset });
    }

    let (decoded, _encoding, had_errors) = UTF_16LE.decode(data);

    if had_errors {
        return Err(RegistryError::InvalidUtf16 { offset });
    }

    // Trim null terminators (common in registry strings)
    Ok(decoded.trim_end_matches('\0').to_string())
}

/// Reads a u32 from a byte slice at the given offset.
pub fn read_u32_le(data: &[u8], offset: usize) -> Result<u32> {
    if offset + 4 > data.len() {
        return Err(RegistryError::TruncatedData {
            offset: offset as u32,
            expected: 4,
            actual: data.len().saturating_sub(offset),
        });
    }

    let mut cursor = Cursor::new(&data[offset..offset + 4]);
    Ok(cursor.read_u32::<LittleEndian>()?)
}

/// Reads a u16 from a byte slice at the given offset.
pub fn read_u16_le(data: &[u8], offset: usize) -> Result<u16> {
    if offset + 2 > data.len() {
        return Err(RegistryError::TruncatedData {
            offset: offset as u32,
            expected: 2,
            actual: data.len().saturating_sub(offset),
        });
    }

    let mut cursor = Cursor::new(&data[offset..offset + 2]);
    Ok(cursor.read_u16::<LittleEndian>()?)
}

/// Reads an i32 from a byte slice at the given offset.
pub fn read_i32_le(data: &[u8], offset: usize) -> Result<i32> {
    if offset + 4 > data.len() {
        return Err(RegistryError::TruncatedData {
            offset: offset as u32,
            expected: 4,
            actual: data.len().saturating_sub(offset),
        });
    }

    let mut cursor = Cursor::new(&data[offset..offset + 4]);
    Ok(cursor.read_i32::<LittleEndian>()?)
}

/// Reads a u64 from a byte slice at the given offset.
pub fn read_u64_le(data: &[u8], offset: usize) -> Result<u64> {
    if offset + 8 > data.len() {
        return Err(RegistryError::TruncatedData {
            offset: offset as u32,
            expected: 8,
            actual: data.len().saturating_sub(offset),
        });
    }

    let mut cursor = Cursor::new(&data[offset..offset + 8]);
    Ok(cursor.read_u64::<LittleEndian>()?)
}

/// Writes a u16 into a byte slice at the given offset.
pub fn write_u16_le(data: &mut [u8], offset: usize, value: u16) -> Result<()> {
    if offset + 2 > data.len() {
        return Err(RegistryError::TruncatedData {
            offset: offset as u32,
            expected: 2,
            actual: data.len().saturating_sub(offset),
        });
    }

    let mut cursor = Cursor::new(&mut data[offset..offset + 2]);
    cursor.write_u16::<LittleEndian>(value)?;
    Ok(())
}

/// Writes a u32 into a byte slice at the given offset.
pub fn write_u32_le(data: &mut [u8], offset: usize, value: u32) -> Result<()> {
    if offset + 4 > data.len() {
        return Err(RegistryError::TruncatedData {
            offset: offset as u32,
            expected: 4,
            actual: data.len().saturating_sub(offset),
        });
    }

    let mut cursor = Cursor::new(&mut data[offset..offset + 4]);
    cursor.write_u32::<LittleEndian>(value)?;
    Ok(())
}

/// Writes an i32 into a byte slice at the given offset.
pub fn write_i32_le(data: &mut [u8], offset: usize, value: i32) -> Result<()> {
    if offset + 4 > data.len() {
        return Err(RegistryError::TruncatedData {
            offset: offset as u32,
            expected: 4,
            actual: data.len().saturating_sub(offset),
        });
    }

    let mut cursor = Cursor::new(&mut data[offset..offset + 4]);
    cursor.write_i32::<LittleEndian>(value)?;
    Ok(())
}

/// Writes a u64 into a byte slice at the given offset.
pub fn write_u64_le(data: &mut [u8], offset: usize, value: u64) -> Result<()> {
    if offset + 8 > data.len() {
        return Err(RegistryError::TruncatedData {
            offset: offset as u32,
            expected: 8,
            actual: data.len().saturating_sub(offset),
        });
    }

    let mut cursor = Cursor::new(&mut data[offset..offset + 8]);
    cursor.write_u64::<LittleEndian>(value)?;
    Ok(())
}

/// Rounds a size up to the 8-byte cell alignment quantum.
#[inline]
pub fn align8(size: usize) -> usize {
    (size + 7) & !7
}

/// Calculates XOR checksum for the first 508 bytes of the base block.
pub fn calculate_checksum(data: &[u8]) -> u32 {
    let mut checksum: u32 = 0;

    // XOR all DWORDs except the checksum field itself (at offset 0x1FC)
    for i in (0..0x1FC).step_by(4) {
        if i + 4 <= data.len() {
            if let Ok(dword) = read_u32_le(data, i) {
                checksum ^= dword;
            }
        }
    }

    checksum
}

/// Returns the current wall-clock time as a Windows FILETIME.
///
/// FILETIME counts 100-nanosecond ticks since 1601-01-01 UTC.
pub fn filetime_now() -> u64 {
    let now = chrono::Utc::now();
    let secs = now.timestamp() + FILETIME_UNIX_DIFF;
    (secs as u64) * 10_000_000 + u64::from(now.timestamp_subsec_nanos()) / 100
}

/// Converts a Windows FILETIME to a `chrono` UTC timestamp.
pub fn filetime_to_datetime(filetime: u64) -> Option<chrono::DateTime<chrono::Utc>> {
    let seconds = (filetime / 10_000_000) as i64 - FILETIME_UNIX_DIFF;
    let nanos = ((filetime % 10_000_000) * 100) as u32;

    chrono::DateTime::from_timestamp(seconds, nanos)
}

/// Returns true if every character of `name` fits the compressed (Latin-1
/// subset) name encoding used by nk and vk cells.
pub fn name_is_compressible(name: &str) -> bool {
    name.chars().all(|c| ('\u{01}'..='\u{7E}').contains(&c))
}

/// Encodes a key or value name for storage.
///
/// Returns the encoded bytes and whether the compressed flag must be set on
/// the owning cell. ASCII-subset names are stored one byte per character;
/// anything else is stored as UTF-16LE.
pub fn encode_name(name: &str) -> (Vec<u8>, bool) {
    if name_is_compressible(name) {
        (name.bytes().collect(), true)
    } else {
        let encoded: Vec<u8> = name
            .encode_utf16()
            .flat_map(|unit| unit.to_le_bytes())
            .collect();
        (encoded, false)
    }
}

/// Decodes a stored key or value name.
pub fn decode_name(data: &[u8], compressed: bool, offset: u32) -> Result<String> {
    if compressed {
        Ok(read_ascii_string(data))
    } else {
        read_utf16_string(data, offset)
    }
}

/// Case-insensitive name ordering per Windows registry conventions.
///
/// Names compare by their uppercase forms; stored casing is preserved
/// elsewhere and never participates in ordering.
pub fn name_cmp(a: &str, b: &str) -> Ordering {
    let mut ai = a.chars().flat_map(char::to_uppercase);
    let mut bi = b.chars().flat_map(char::to_uppercase);
    loop {
        match (ai.next(), bi.next()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) => match x.cmp(&y) {
                Ordering::Equal => continue,
                other => return other,
            },
        }
    }
}

/// Returns true if two names are equal under case-insensitive comparison.
#[inline]
pub fn name_eq(a: &str, b: &str) -> bool {
    name_cmp(a, b) == Ordering::Equal
}

/// Converts a relative cell offset to an absolute hive offset.
///
/// Cell offsets in the registry are relative to the first hbin (at 0x1000).
/// This function adds 0x1000 to convert to an absolute offset.
///
/// # Errors
///
/// Returns `RegistryError::InvalidOffset` if the offset would overflow.
#[inline]
pub fn cell_offset_to_absolute(cell_offset: u32) -> Result<u32> {
    cell_offset
        .checked_add(HBIN_START_OFFSET)
        .ok_or_else(|| RegistryError::InvalidOffset {
            offset: cell_offset,
            hive_size: 0, // Not known at this point
        })
}

/// Converts an absolute hive offset to a relative cell offset.
///
/// # Errors
///
/// Returns `RegistryError::InvalidFormat` if the offset is before hbin start.
#[inline]
pub fn absolute_to_cell_offset(absolute_offset: u32) -> Result<u32> {
    if absolute_offset < HBIN_START_OFFSET {
        return Err(RegistryError::InvalidFormat(format!(
            "Absolute offset {:#x} is before hbin start",
            absolute_offset
        )));
    }
    Ok(absolute_offset - HBIN_START_OFFSET)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_ascii_string() {
        let data = b"Hello";
        assert_eq!(read_ascii_string(data), "Hello");

        // Should trim trailing nulls
        let data_with_null = b"Hello\0\0";
        assert_eq!(read_ascii_string(data_with_null), "Hello");
    }

    #[test]
    fn test_offset_conversion() {
        assert_eq!(cell_offset_to_absolute(0).unwrap(), 0x1000);
        assert_eq!(cell_offset_to_absolute(0x20).unwrap(), 0x1020);
        assert_eq!(cell_offset_to_absolute(0x1000).unwrap(), 0x2000);

        assert_eq!(absolute_to_cell_offset(0x1000).unwrap(), 0);
        assert_eq!(absolute_to_cell_offset(0x1020).unwrap(), 0x20);
        assert_eq!(absolute_to_cell_offset(0x2000).unwrap(), 0x1000);
    }

    #[test]
    fn test_offset_overflow() {
        let result = cell_offset_to_absolute(u32::MAX);
        assert!(result.is_err());

        let result = absolute_to_cell_offset(0xFFF);
        assert!(result.is_err());
    }

    #[test]
    fn test_read_write_u32_le() {
        let mut data = [0u8; 4];
        write_u32_le(&mut data, 0, 0x04030201).unwrap();
        assert_eq!(data, [0x01, 0x02, 0x03, 0x04]);
        assert_eq!(read_u32_le(&data, 0).unwrap(), 0x04030201);
    }

    #[test]
    fn test_write_bounds_checked() {
        let mut data = [0u8; 3];
        assert!(write_u32_le(&mut data, 0, 1).is_err());
        assert!(write_u16_le(&mut data, 2, 1).is_err());
    }

    #[test]
    fn test_align8() {
        assert_eq!(align8(0), 0);
        assert_eq!(align8(1), 8);
        assert_eq!(align8(8), 8);
        assert_eq!(align8(9), 16);
        assert_eq!(align8(80), 80);
    }

    #[test]
    fn test_name_encoding() {
        let (bytes, compressed) = encode_name("Software");
        assert!(compressed);
        assert_eq!(bytes, b"Software");

        let (bytes, compressed) = encode_name("Größe");
        assert!(!compressed);
        assert_eq!(bytes.len(), 10);
        assert_eq!(decode_name(&bytes, false, 0).unwrap(), "Größe");
    }

    #[test]
    fn test_name_cmp_case_insensitive() {
        assert_eq!(name_cmp("software", "SOFTWARE"), Ordering::Equal);
        assert_eq!(name_cmp("Alpha", "beta"), Ordering::Less);
        assert!(name_eq("MyApp", "myapp"));
        assert!(!name_eq("MyApp", "MyApp2"));
    }

    #[test]
    fn test_filetime_round_trip() {
        let ft = filetime_now();
        let dt = filetime_to_datetime(ft).unwrap();
        let now = chrono::Utc::now();
        assert!((now - dt).num_seconds().abs() < 5);
    }
}
