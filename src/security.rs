//! Security descriptor (sk) parsing and construction.
//!
//! Every key node references a security descriptor cell. Identical
//! descriptors are shared: sk cells are refcounted and linked into a
//! circular doubly-linked list through their flink/blink fields. The ring
//! pointers are plain cell offsets, never owning references.

use crate::error::{RegistryError, Result};
use crate::utils::{read_u16_le, read_u32_le, write_u32_le};

/// Minimum size of a security key structure (fixed fields, no descriptor).
pub const SECURITY_KEY_MIN_SIZE: usize = 20;

// Field offsets within the sk payload, used for in-place patches.
pub(crate) const SK_FLINK: usize = 0x04;
pub(crate) const SK_BLINK: usize = 0x08;
pub(crate) const SK_REFCOUNT: usize = 0x0C;

/// Security key (sk) structure.
#[derive(Debug, Clone)]
pub struct SecurityKey {
    /// Unused field after the signature.
    pub reserved: u16,

    /// Offset of the next sk cell in the ring.
    pub flink: u32,

    /// Offset of the previous sk cell in the ring.
    pub blink: u32,

    /// Number of key nodes referencing this descriptor.
    pub reference_count: u32,

    /// Length of the descriptor blob.
    pub descriptor_length: u32,

    /// Raw self-relative security descriptor.
    pub descriptor: Vec<u8>,
}

impl SecurityKey {
    /// Parses a security key from cell data.
    ///
    /// # Arguments
    ///
    /// * `data` - Cell data (excluding size field, starting with "sk" signature).
    /// * `offset` - Offset of this cell for error reporting.
    pub fn parse(data: &[u8], offset: u32) -> Result<Self> {
        if data.len() < SECURITY_KEY_MIN_SIZE {
            return Err(RegistryError::TruncatedData {
                offset,
                expected: SECURITY_KEY_MIN_SIZE,
                actual: data.len(),
            });
        }

        // Verify signature
        if &data[0..2] != b"sk" {
            return Err(RegistryError::InvalidFormat(format!(
                "Expected 'sk' signature at offset {:#x}",
                offset
            )));
        }

        let reserved = read_u16_le(data, 0x02)?;
        let flink = read_u32_le(data, SK_FLINK)?;
        let blink = read_u32_le(data, SK_BLINK)?;
        let reference_count = read_u32_le(data, SK_REFCOUNT)?;
        let descriptor_length = read_u32_le(data, 0x10)?;

        let descriptor_end = SECURITY_KEY_MIN_SIZE + descriptor_length as usize;
        if descriptor_end > data.len() {
            return Err(RegistryError::TruncatedData {
                offset,
                expected: descriptor_end,
                actual: data.len(),
            });
        }

        Ok(SecurityKey {
            reserved,
            flink,
            blink,
            reference_count,
            descriptor_length,
            descriptor: data[SECURITY_KEY_MIN_SIZE..descriptor_end].to_vec(),
        })
    }

    /// Serializes an sk payload.
    ///
    /// A new descriptor starts with a reference count of 1; its ring links
    /// point at itself until it is spliced next to another sk cell.
    pub fn build(descriptor: &[u8], self_offset: u32) -> Result<Vec<u8>> {
        if descriptor.len() > u32::MAX as usize {
            return Err(RegistryError::InvalidArgument(
                "Security descriptor too large".to_string(),
            ));
        }

        let mut buf = vec![0u8; SECURITY_KEY_MIN_SIZE + descriptor.len()];
        buf[0..2].copy_from_slice(b"sk");
        write_u32_le(&mut buf, SK_FLINK, self_offset)?;
        write_u32_le(&mut buf, SK_BLINK, self_offset)?;
        write_u32_le(&mut buf, SK_REFCOUNT, 1)?;
        write_u32_le(&mut buf, 0x10, descriptor.len() as u32)?;
        buf[SECURITY_KEY_MIN_SIZE..].copy_from_slice(descriptor);

        Ok(buf)
    }

    /// Total payload size this descriptor needs.
    pub fn payload_size(&self) -> usize {
        SECURITY_KEY_MIN_SIZE + self.descriptor.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_security_key_minimum_size() {
        let data = vec![0u8; 19];
        assert!(SecurityKey::parse(&data, 0).is_err());
    }

    #[test]
    fn test_security_key_invalid_signature() {
        let mut data = vec![0u8; 24];
        data[0..2].copy_from_slice(b"XX");
        assert!(SecurityKey::parse(&data, 0).is_err());
    }

    #[test]
    fn test_build_parse_round_trip() {
        let descriptor = [0xAA, 0xBB, 0xCC, 0xDD, 0xEE];
        let payload = SecurityKey::build(&descriptor, 0x80).unwrap();
        let sk = SecurityKey::parse(&payload, 0).unwrap();

        assert_eq!(sk.flink, 0x80);
        assert_eq!(sk.blink, 0x80);
        assert_eq!(sk.reference_count, 1);
        assert_eq!(sk.descriptor, descriptor);
        assert_eq!(sk.payload_size(), SECURITY_KEY_MIN_SIZE + 5);
    }

    #[test]
    fn test_truncated_descriptor_rejected() {
        let mut payload = SecurityKey::build(&[1, 2, 3, 4], 0).unwrap();
        payload.truncate(SECURITY_KEY_MIN_SIZE + 2);
        assert!(matches!(
            SecurityKey::parse(&payload, 0),
            Err(RegistryError::TruncatedData { .. })
        ));
    }
}
