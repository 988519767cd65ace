//! Big data block (db) parsing and construction.
//!
//! Registry values larger than 16,344 bytes are stored in big data blocks:
//! a header cell ("db") pointing at a blocklist cell whose u32 entries
//! reference the chunk cells holding the payload. All space for a big value
//! is reserved in a single growth so no slice is invalidated mid-write.

use crate::alloc::{cell_payload, cell_payload_mut, CellAllocator};
use crate::arena::Arena;
use crate::cell::{CellClass, CELL_HEADER_SIZE};
use crate::dirty::DirtyPages;
use crate::error::{RegistryError, Result};
use crate::hbin::HBIN_HEADER_SIZE;
use crate::utils::{align8, read_u16_le, read_u32_le};
use tracing::{debug, instrument};

/// Maximum payload stored in a single raw data cell; anything larger goes
/// through a db block.
pub const MAX_DIRECT_DATA_SIZE: u32 = 16344;

/// Payload bytes per big-data chunk cell.
pub const BIG_DATA_CHUNK_SIZE: usize = 16344;

/// Maximum chunk count a db header can carry (u16 count field).
pub const MAX_BIG_DATA_CHUNKS: usize = 65535;

/// Big data block header structure.
///
/// Format:
/// ```text
/// Offset  Size  Description
/// 0x00    2     Signature ("db")
/// 0x02    2     Number of segments
/// 0x04    4     Offset to segment list
/// ```
#[derive(Debug, Clone)]
pub struct BigDataBlock {
    /// Number of data segments
    pub segment_count: u16,

    /// Offset to the list of segment offsets
    pub segment_list_offset: u32,
}

impl BigDataBlock {
    /// Minimum size of a big data block header
    const MIN_SIZE: usize = 8;

    /// Parses a big data block header from cell data.
    ///
    /// # Arguments
    ///
    /// * `data` - Cell data (excluding size field, starting with "db" signature)
    /// * `offset` - Offset of this cell for error reporting
    ///
    /// # Errors
    ///
    /// Returns an error if the data is malformed or truncated.
    pub fn parse(data: &[u8], offset: u32) -> Result<Self> {
        if data.len() < Self::MIN_SIZE {
            return Err(RegistryError::TruncatedData {
                offset,
                expected: Self::MIN_SIZE,
                actual: data.len(),
            });
        }

        // Verify signature
        if &data[0..2] != b"db" {
            return Err(RegistryError::InvalidFormat(format!(
                "Expected 'db' signature at offset {:#x}, found {:?}",
                offset,
                &data[0..2]
            )));
        }

        let segment_count = read_u16_le(data, 0x02)?;
        let segment_list_offset = read_u32_le(data, 0x04)?;

        Ok(BigDataBlock {
            segment_count,
            segment_list_offset,
        })
    }

    /// Serializes a db payload.
    pub fn build(segment_count: u16, segment_list_offset: u32) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::MIN_SIZE);
        buf.extend_from_slice(b"db");
        buf.extend_from_slice(&segment_count.to_le_bytes());
        buf.extend_from_slice(&segment_list_offset.to_le_bytes());
        buf
    }
}

/// Writes `payload` as a big data block and returns the db cell offset.
///
/// Space for every chunk, the blocklist, and the header is reserved with a
/// single growth up front, then each cell is allocated and filled.
///
/// # Errors
///
/// Returns `InvalidArgument` for an empty payload or one needing more than
/// 65,535 chunks.
#[instrument(skip(alloc, arena, dirty, payload), fields(len = payload.len()))]
pub fn write_big_data(
    alloc: &mut CellAllocator,
    arena: &mut Arena,
    dirty: &mut DirtyPages,
    payload: &[u8],
) -> Result<u32> {
    if payload.is_empty() {
        return Err(RegistryError::InvalidArgument(
            "Big data payload may not be empty".to_string(),
        ));
    }

    let num_chunks = payload.len().div_ceil(BIG_DATA_CHUNK_SIZE);
    if num_chunks > MAX_BIG_DATA_CHUNKS {
        return Err(RegistryError::InvalidArgument(format!(
            "Payload of {} bytes needs {} chunks (maximum {})",
            payload.len(),
            num_chunks,
            MAX_BIG_DATA_CHUNKS
        )));
    }

    // Reserve-then-write: one growth covers every cell we are about to
    // allocate, so no allocation below can remap the arena.
    let mut total = 0usize;
    for chunk in payload.chunks(BIG_DATA_CHUNK_SIZE) {
        total += align8(CELL_HEADER_SIZE + chunk.len());
    }
    total += align8(CELL_HEADER_SIZE + num_chunks * 4);
    total += align8(CELL_HEADER_SIZE + BigDataBlock::MIN_SIZE);
    total += HBIN_HEADER_SIZE;
    alloc.reserve(arena, dirty, total)?;

    let mut chunk_refs = Vec::with_capacity(num_chunks);
    for chunk in payload.chunks(BIG_DATA_CHUNK_SIZE) {
        let cell = alloc.alloc(arena, dirty, CELL_HEADER_SIZE + chunk.len(), CellClass::Raw)?;
        cell_payload_mut(arena.bytes_mut(), cell)?[..chunk.len()].copy_from_slice(chunk);
        chunk_refs.push(cell);
    }

    let blocklist = alloc.alloc(
        arena,
        dirty,
        CELL_HEADER_SIZE + num_chunks * 4,
        CellClass::BlockList,
    )?;
    {
        let list = cell_payload_mut(arena.bytes_mut(), blocklist)?;
        for (i, &cell) in chunk_refs.iter().enumerate() {
            list[i * 4..i * 4 + 4].copy_from_slice(&cell.to_le_bytes());
        }
    }

    let header = alloc.alloc(
        arena,
        dirty,
        CELL_HEADER_SIZE + BigDataBlock::MIN_SIZE,
        CellClass::DataBlock,
    )?;
    let built = BigDataBlock::build(num_chunks as u16, blocklist);
    cell_payload_mut(arena.bytes_mut(), header)?[..built.len()].copy_from_slice(&built);

    debug!(chunks = num_chunks, header, "Wrote big data block");
    Ok(header)
}

/// Reads a big data block back into a contiguous buffer.
///
/// `expected_length` is the logical value length from the owning vk. A
/// blocklist or chunk shorter than the declared geometry is a hard
/// `Truncated` error, never a silent prefix.
pub fn read_big_data(data: &[u8], db_cell: u32, expected_length: u32) -> Result<Vec<u8>> {
    let header = BigDataBlock::parse(cell_payload(data, db_cell)?, db_cell)?;
    if header.segment_count == 0 {
        return Err(RegistryError::InvalidFormat(format!(
            "db cell {:#x} declares zero segments",
            db_cell
        )));
    }

    let needed = expected_length as usize;
    let capacity = header.segment_count as usize * BIG_DATA_CHUNK_SIZE;
    if needed > capacity {
        return Err(RegistryError::SanityLimit {
            what: "big data length",
            value: needed as u64,
            max: capacity as u64,
        });
    }

    let list = cell_payload(data, header.segment_list_offset)?;
    let expected_list = header.segment_count as usize * 4;
    if list.len() < expected_list {
        return Err(RegistryError::TruncatedData {
            offset: header.segment_list_offset,
            expected: expected_list,
            actual: list.len(),
        });
    }

    let mut chunk_refs = Vec::with_capacity(header.segment_count as usize);
    for i in 0..header.segment_count as usize {
        // Some writers set the high bit on segment references; mask it off.
        chunk_refs.push(read_u32_le(list, i * 4)? & 0x7FFF_FFFF);
    }

    let mut out = Vec::with_capacity(needed);
    for &chunk in &chunk_refs {
        let remaining = needed - out.len();
        if remaining == 0 {
            break;
        }
        let chunk_data = cell_payload(data, chunk)?;
        let take = remaining.min(BIG_DATA_CHUNK_SIZE).min(chunk_data.len());
        if take < remaining.min(BIG_DATA_CHUNK_SIZE) {
            return Err(RegistryError::TruncatedData {
                offset: chunk,
                expected: remaining.min(BIG_DATA_CHUNK_SIZE),
                actual: chunk_data.len(),
            });
        }
        out.extend_from_slice(&chunk_data[..take]);
    }

    if out.len() < needed {
        return Err(RegistryError::TruncatedData {
            offset: db_cell,
            expected: needed,
            actual: out.len(),
        });
    }

    Ok(out)
}

/// Frees a big data block: every chunk, the blocklist, then the header.
pub fn free_big_data(
    alloc: &mut CellAllocator,
    arena: &mut Arena,
    dirty: &mut DirtyPages,
    db_cell: u32,
) -> Result<()> {
    let header = BigDataBlock::parse(cell_payload(arena.bytes(), db_cell)?, db_cell)?;

    let list = cell_payload(arena.bytes(), header.segment_list_offset)?;
    let expected_list = header.segment_count as usize * 4;
    if list.len() < expected_list {
        return Err(RegistryError::TruncatedData {
            offset: header.segment_list_offset,
            expected: expected_list,
            actual: list.len(),
        });
    }

    let mut chunk_refs = Vec::with_capacity(header.segment_count as usize);
    for i in 0..header.segment_count as usize {
        chunk_refs.push(read_u32_le(list, i * 4)? & 0x7FFF_FFFF);
    }

    for chunk in chunk_refs {
        alloc.free(arena, dirty, chunk)?;
    }
    alloc.free(arena, dirty, header.segment_list_offset)?;
    alloc.free(arena, dirty, db_cell)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::BaseBlock;
    use crate::hbin::HbinHeader;
    use crate::utils::{filetime_now, write_i32_le, NO_CELL, PAGE_SIZE};

    fn fresh_arena() -> (tempfile::TempDir, Arena, CellAllocator, DirtyPages) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bigdata.hive");
        let mut arena = Arena::create(&path, 2 * PAGE_SIZE).unwrap();
        BaseBlock::new_empty(NO_CELL, PAGE_SIZE as u32)
            .serialize(arena.bytes_mut())
            .unwrap();
        HbinHeader::write(
            &mut arena.bytes_mut()[PAGE_SIZE..],
            0,
            PAGE_SIZE as u32,
            filetime_now(),
        )
        .unwrap();
        write_i32_le(
            arena.bytes_mut(),
            PAGE_SIZE + HBIN_HEADER_SIZE,
            (PAGE_SIZE - HBIN_HEADER_SIZE) as i32,
        )
        .unwrap();

        let alloc = CellAllocator::from_arena(&arena).unwrap();
        let dirty = DirtyPages::new(arena.len());
        (dir, arena, alloc, dirty)
    }

    #[test]
    fn test_bigdata_minimum_size() {
        let data = vec![0u8; 7];
        let result = BigDataBlock::parse(&data, 0);
        assert!(result.is_err());
    }

    #[test]
    fn test_bigdata_invalid_signature() {
        let mut data = vec![0u8; 8];
        data[0..2].copy_from_slice(b"XX");
        let result = BigDataBlock::parse(&data, 0);
        assert!(result.is_err());
    }

    #[test]
    fn test_bigdata_build_parse() {
        let payload = BigDataBlock::build(5, 0x20);
        let db = BigDataBlock::parse(&payload, 0).unwrap();
        assert_eq!(db.segment_count, 5);
        assert_eq!(db.segment_list_offset, 0x20);
    }

    #[test]
    fn test_write_read_round_trip_exact_chunk() {
        let (_dir, mut arena, mut alloc, mut dirty) = fresh_arena();

        // Exactly one chunk
        let payload: Vec<u8> = (0..BIG_DATA_CHUNK_SIZE).map(|i| (i % 251) as u8).collect();
        let db = write_big_data(&mut alloc, &mut arena, &mut dirty, &payload).unwrap();

        let header = BigDataBlock::parse(cell_payload(arena.bytes(), db).unwrap(), db).unwrap();
        assert_eq!(header.segment_count, 1);

        let back = read_big_data(arena.bytes(), db, payload.len() as u32).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn test_write_chunk_boundaries() {
        let (_dir, mut arena, mut alloc, mut dirty) = fresh_arena();

        // One byte past a chunk boundary needs a second chunk
        let payload = vec![0xA5u8; BIG_DATA_CHUNK_SIZE + 1];
        let db = write_big_data(&mut alloc, &mut arena, &mut dirty, &payload).unwrap();
        let header = BigDataBlock::parse(cell_payload(arena.bytes(), db).unwrap(), db).unwrap();
        assert_eq!(header.segment_count, 2);

        let back = read_big_data(arena.bytes(), db, payload.len() as u32).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn test_empty_payload_rejected() {
        let (_dir, mut arena, mut alloc, mut dirty) = fresh_arena();
        assert!(matches!(
            write_big_data(&mut alloc, &mut arena, &mut dirty, &[]),
            Err(RegistryError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_free_returns_space() {
        let (_dir, mut arena, mut alloc, mut dirty) = fresh_arena();

        let payload = vec![0x5Au8; 3 * BIG_DATA_CHUNK_SIZE];
        let before = alloc.free_bytes(arena.bytes());
        let db = write_big_data(&mut alloc, &mut arena, &mut dirty, &payload).unwrap();
        free_big_data(&mut alloc, &mut arena, &mut dirty, db).unwrap();

        // Everything allocated for the block is free again (the arena may
        // have grown, so free bytes can only have increased).
        assert!(alloc.free_bytes(arena.bytes()) >= before);
        assert!(cell_payload(arena.bytes(), db).is_err());
    }
}
