//! Registry hive base block (header) parsing and serialization.
//!
//! The base block is the first 4096 bytes (0x1000) of a registry hive file.
//! It contains metadata about the hive including version, timestamps, and
//! the root key cell offset. The writer mutates it in place to drive the
//! dual-sequence transaction protocol.

use crate::error::{RegistryError, Result};
use crate::utils::{
    calculate_checksum, filetime_now, filetime_to_datetime, read_u32_le, read_u64_le,
    read_utf16_string, write_u32_le, write_u64_le,
};
use std::fmt;

/// Size of the base block in bytes.
pub const BASE_BLOCK_SIZE: usize = 4096;

/// Expected signature for a valid registry hive ("regf").
pub const REGF_SIGNATURE: &[u8; 4] = b"regf";

/// Offset of the primary sequence number.
pub const PRIMARY_SEQ_OFFSET: usize = 0x04;

/// Offset of the secondary sequence number.
pub const SECONDARY_SEQ_OFFSET: usize = 0x08;

/// Offset of the last-written FILETIME.
pub const TIMESTAMP_OFFSET: usize = 0x0C;

/// Offset of the hive data length field.
pub const DATA_SIZE_OFFSET: usize = 0x28;

/// Offset of the file name field (64 UTF-16LE characters = 128 bytes).
const FILE_NAME_OFFSET: usize = 0x30;
const FILE_NAME_LENGTH: usize = 128;

/// Offset of the checksum field in the base block.
pub const CHECKSUM_OFFSET: usize = 0x1FC;

/// Registry hive base block header.
///
/// This structure represents the first 4KB of a registry hive file and contains
/// critical metadata about the hive.
#[derive(Debug, Clone)]
pub struct BaseBlock {
    /// Signature, should be "regf" (0x66676572).
    pub signature: [u8; 4],

    /// Primary sequence number.
    pub primary_sequence: u32,

    /// Secondary sequence number.
    pub secondary_sequence: u32,

    /// Last written timestamp (Windows FILETIME).
    pub last_written: u64,

    /// Major version of the hive format.
    pub major_version: u32,

    /// Minor version of the hive format.
    pub minor_version: u32,

    /// File type (0 = normal, 1 = transaction log).
    pub file_type: u32,

    /// File format (1 = direct memory load).
    pub file_format: u32,

    /// Offset to root key cell (relative to first hbin).
    pub root_cell_offset: u32,

    /// Length of hive data in bytes.
    pub hive_length: u32,

    /// Clustering factor (always 1).
    pub clustering_factor: u32,

    /// File name (embedded, 64 UTF-16LE characters).
    pub file_name: String,

    /// Checksum (XOR of first 508 bytes).
    pub checksum: u32,
}

impl BaseBlock {
    /// Parses a base block from raw bytes.
    ///
    /// # Arguments
    ///
    /// * `data` - Raw bytes of the base block (must be at least 4096 bytes).
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Data is too small
    /// - Signature is invalid
    /// - Checksum doesn't match
    /// - Version is unsupported
    ///
    /// A sequence mismatch (torn transaction) is NOT an error here; callers
    /// that require a clean hive check [`BaseBlock::is_consistent`].
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < BASE_BLOCK_SIZE {
            return Err(RegistryError::HiveTooSmall {
                size: data.len(),
                minimum: BASE_BLOCK_SIZE,
            });
        }

        // Read signature
        let mut signature = [0u8; 4];
        signature.copy_from_slice(&data[0..4]);

        if &signature != REGF_SIGNATURE {
            return Err(RegistryError::invalid_signature(REGF_SIGNATURE, &signature));
        }

        // Parse header fields
        let primary_sequence = read_u32_le(data, PRIMARY_SEQ_OFFSET)?;
        let secondary_sequence = read_u32_le(data, SECONDARY_SEQ_OFFSET)?;
        let last_written = read_u64_le(data, TIMESTAMP_OFFSET)?;

        let major_version = read_u32_le(data, 0x14)?;
        let minor_version = read_u32_le(data, 0x18)?;
        let file_type = read_u32_le(data, 0x1C)?;
        let file_format = read_u32_le(data, 0x20)?;
        let root_cell_offset = read_u32_le(data, 0x24)?;
        let hive_length = read_u32_le(data, DATA_SIZE_OFFSET)?;
        let clustering_factor = read_u32_le(data, 0x2C)?;

        let file_name_bytes = &data[FILE_NAME_OFFSET..FILE_NAME_OFFSET + FILE_NAME_LENGTH];
        let file_name = read_utf16_string(file_name_bytes, FILE_NAME_OFFSET as u32)?;

        let checksum = read_u32_le(data, CHECKSUM_OFFSET)?;

        // Verify checksum
        let calculated = calculate_checksum(data);
        if checksum != calculated {
            return Err(RegistryError::ChecksumMismatch {
                expected: checksum,
                calculated,
            });
        }

        // Verify version (support 1.3, 1.4, 1.5, 1.6)
        if major_version != 1 || minor_version < 3 || minor_version > 6 {
            return Err(RegistryError::UnsupportedVersion {
                major: major_version,
                minor: minor_version,
            });
        }

        Ok(BaseBlock {
            signature,
            primary_sequence,
            secondary_sequence,
            last_written,
            major_version,
            minor_version,
            file_type,
            file_format,
            root_cell_offset,
            hive_length,
            clustering_factor,
            file_name,
            checksum,
        })
    }

    /// Builds a fresh header for a new hive.
    ///
    /// Both sequence numbers start at 1 (clean state), the format is 1.5
    /// direct, and the timestamp is the current wall clock.
    pub fn new_empty(root_cell_offset: u32, hive_length: u32) -> Self {
        BaseBlock {
            signature: *REGF_SIGNATURE,
            primary_sequence: 1,
            secondary_sequence: 1,
            last_written: filetime_now(),
            major_version: 1,
            minor_version: 5,
            file_type: 0,
            file_format: 1,
            root_cell_offset,
            hive_length,
            clustering_factor: 1,
            file_name: String::new(),
            checksum: 0,
        }
    }

    /// Serializes this header into a 4 KiB base block, recomputing the
    /// checksum over the first 508 bytes.
    ///
    /// # Errors
    ///
    /// Returns `HiveTooSmall` if `buf` is shorter than the base block.
    pub fn serialize(&self, buf: &mut [u8]) -> Result<()> {
        if buf.len() < BASE_BLOCK_SIZE {
            return Err(RegistryError::HiveTooSmall {
                size: buf.len(),
                minimum: BASE_BLOCK_SIZE,
            });
        }

        buf[..BASE_BLOCK_SIZE].fill(0);
        buf[0..4].copy_from_slice(&self.signature);
        write_u32_le(buf, PRIMARY_SEQ_OFFSET, self.primary_sequence)?;
        write_u32_le(buf, SECONDARY_SEQ_OFFSET, self.secondary_sequence)?;
        write_u64_le(buf, TIMESTAMP_OFFSET, self.last_written)?;
        write_u32_le(buf, 0x14, self.major_version)?;
        write_u32_le(buf, 0x18, self.minor_version)?;
        write_u32_le(buf, 0x1C, self.file_type)?;
        write_u32_le(buf, 0x20, self.file_format)?;
        write_u32_le(buf, 0x24, self.root_cell_offset)?;
        write_u32_le(buf, DATA_SIZE_OFFSET, self.hive_length)?;
        write_u32_le(buf, 0x2C, self.clustering_factor)?;

        let mut name_units = self.file_name.encode_utf16().collect::<Vec<u16>>();
        name_units.truncate(FILE_NAME_LENGTH / 2);
        for (i, unit) in name_units.iter().enumerate() {
            buf[FILE_NAME_OFFSET + i * 2..FILE_NAME_OFFSET + i * 2 + 2]
                .copy_from_slice(&unit.to_le_bytes());
        }

        finalize_checksum(buf)
    }

    /// Returns true if the hive is in a consistent state.
    ///
    /// The hive is consistent when primary and secondary sequence numbers match.
    pub fn is_consistent(&self) -> bool {
        self.primary_sequence == self.secondary_sequence
    }

    /// Converts the last written timestamp to a human-readable format.
    pub fn last_written_datetime(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        filetime_to_datetime(self.last_written)
    }
}

impl fmt::Display for BaseBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Registry Hive Header:\n\
             - Version: {}.{}\n\
             - Root Cell Offset: {:#x}\n\
             - Hive Length: {} bytes\n\
             - Consistent: {}\n\
             - File Name: {}",
            self.major_version,
            self.minor_version,
            self.root_cell_offset,
            self.hive_length,
            self.is_consistent(),
            self.file_name
        )
    }
}

/// Recomputes and writes the header checksum over the first 508 bytes.
pub fn finalize_checksum(buf: &mut [u8]) -> Result<()> {
    let checksum = calculate_checksum(buf);
    write_u32_le(buf, CHECKSUM_OFFSET, checksum)
}

/// Opens a transaction on disk by bumping the primary sequence number.
///
/// Returns the new primary sequence. The checksum is refreshed so a torn
/// file still parses and surfaces as a sequence mismatch rather than a
/// checksum failure.
pub fn begin_transaction(buf: &mut [u8]) -> Result<u32> {
    let primary = read_u32_le(buf, PRIMARY_SEQ_OFFSET)?.wrapping_add(1);
    write_u32_le(buf, PRIMARY_SEQ_OFFSET, primary)?;
    finalize_checksum(buf)?;
    Ok(primary)
}

/// Closes the open transaction: secondary := primary, fresh timestamp,
/// updated data size, recomputed checksum.
pub fn commit_transaction(buf: &mut [u8], hive_length: u32) -> Result<()> {
    let primary = read_u32_le(buf, PRIMARY_SEQ_OFFSET)?;
    write_u32_le(buf, SECONDARY_SEQ_OFFSET, primary)?;
    write_u64_le(buf, TIMESTAMP_OFFSET, filetime_now())?;
    write_u32_le(buf, DATA_SIZE_OFFSET, hive_length)?;
    finalize_checksum(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_block_size() {
        assert_eq!(BASE_BLOCK_SIZE, 4096);
    }

    #[test]
    fn test_invalid_signature() {
        let mut data = vec![0u8; BASE_BLOCK_SIZE];
        data[0..4].copy_from_slice(b"XXXX");

        let result = BaseBlock::parse(&data);
        assert!(result.is_err());
        assert!(matches!(result.unwrap_err(), RegistryError::InvalidSignature { .. }));
    }

    #[test]
    fn test_too_small() {
        let data = vec![0u8; 100];
        let result = BaseBlock::parse(&data);
        assert!(result.is_err());
        assert!(matches!(result.unwrap_err(), RegistryError::HiveTooSmall { .. }));
    }

    #[test]
    fn test_serialize_parse_round_trip() {
        let mut buf = vec![0u8; BASE_BLOCK_SIZE];
        let block = BaseBlock::new_empty(0x20, 0x1000);
        block.serialize(&mut buf).unwrap();

        let parsed = BaseBlock::parse(&buf).unwrap();
        assert_eq!(parsed.primary_sequence, 1);
        assert_eq!(parsed.secondary_sequence, 1);
        assert_eq!(parsed.root_cell_offset, 0x20);
        assert_eq!(parsed.hive_length, 0x1000);
        assert_eq!(parsed.minor_version, 5);
        assert!(parsed.is_consistent());
    }

    #[test]
    fn test_transaction_sequence_protocol() {
        let mut buf = vec![0u8; BASE_BLOCK_SIZE];
        BaseBlock::new_empty(0x20, 0x1000).serialize(&mut buf).unwrap();

        let primary = begin_transaction(&mut buf).unwrap();
        assert_eq!(primary, 2);
        // Torn: sequences differ but the header still parses
        let torn = BaseBlock::parse(&buf).unwrap();
        assert!(!torn.is_consistent());
        assert_eq!(torn.primary_sequence, torn.secondary_sequence + 1);

        commit_transaction(&mut buf, 0x2000).unwrap();
        let parsed = BaseBlock::parse(&buf).unwrap();
        assert!(parsed.is_consistent());
        assert_eq!(parsed.primary_sequence, 2);
        assert_eq!(parsed.hive_length, 0x2000);
    }

    #[test]
    fn test_checksum_is_xor_of_preceding_dwords() {
        let mut buf = vec![0u8; BASE_BLOCK_SIZE];
        BaseBlock::new_empty(0x20, 0x1000).serialize(&mut buf).unwrap();

        let mut expected: u32 = 0;
        for i in (0..CHECKSUM_OFFSET).step_by(4) {
            expected ^= u32::from_le_bytes([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]]);
        }
        assert_eq!(read_u32_le(&buf, CHECKSUM_OFFSET).unwrap(), expected);
    }
}
