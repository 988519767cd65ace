//! Cell allocator over the hive bin arena.
//!
//! Free cells are kept in per-size-class buckets (power-of-two classes over
//! the 8-byte alignment quantum, plus one overflow class). Allocation pops
//! the smallest fitting cell and splits off any remainder; freeing flips the
//! size sign and coalesces with adjacent free cells within the same bin.
//! When no free cell fits, a fresh bin is appended to the arena.

use crate::arena::Arena;
use crate::cell::{CellClass, CELL_HEADER_SIZE, MIN_CELL_SIZE};
use crate::dirty::DirtyPages;
use crate::error::{RegistryError, Result};
use crate::hbin::{HbinCellIterator, HbinHeader, HBIN_HEADER_SIZE};
use crate::utils::{filetime_now, read_i32_le, write_i32_le, HBIN_START_OFFSET, PAGE_SIZE};
use tracing::{debug, instrument, trace};

/// Number of free-list size classes. Class `i` holds free cells whose total
/// size is in `[8 << i, 8 << (i + 1))`; the last class holds everything
/// larger.
const BUCKET_COUNT: usize = 10;

/// Returns the size class for a cell of `size` total bytes.
fn bucket_index(size: usize) -> usize {
    debug_assert!(size >= MIN_CELL_SIZE && size % 8 == 0);
    let class = (usize::BITS - 1 - (size / 8).leading_zeros()) as usize;
    class.min(BUCKET_COUNT - 1)
}

/// Reads the signed size header of the cell at relative offset `cell`.
pub fn cell_size_raw(data: &[u8], cell: u32) -> Result<i32> {
    let abs = cell as usize + HBIN_START_OFFSET as usize;
    read_i32_le(data, abs)
}

/// Returns the total size in bytes of the (allocated or free) cell at
/// relative offset `cell`, validating the alignment invariant.
pub fn cell_total_size(data: &[u8], cell: u32) -> Result<usize> {
    let raw = cell_size_raw(data, cell)?;
    let size = raw.unsigned_abs() as usize;
    if size < MIN_CELL_SIZE || size % 8 != 0 {
        return Err(RegistryError::invalid_cell_size(raw, cell));
    }
    Ok(size)
}

/// Returns the payload of the allocated cell at relative offset `cell`
/// (excluding the 4-byte size header).
pub fn cell_payload(data: &[u8], cell: u32) -> Result<&[u8]> {
    let raw = cell_size_raw(data, cell)?;
    if raw >= 0 {
        return Err(RegistryError::invalid_cell_size(raw, cell));
    }
    let size = raw.unsigned_abs() as usize;
    let abs = cell as usize + HBIN_START_OFFSET as usize;
    let end = abs + size;
    if end > data.len() {
        return Err(RegistryError::TruncatedData {
            offset: cell,
            expected: size,
            actual: data.len().saturating_sub(abs),
        });
    }
    Ok(&data[abs + CELL_HEADER_SIZE..end])
}

/// Mutable variant of [`cell_payload`].
///
/// The returned slice is live only until the next arena growth.
pub fn cell_payload_mut(data: &mut [u8], cell: u32) -> Result<&mut [u8]> {
    let raw = cell_size_raw(data, cell)?;
    if raw >= 0 {
        return Err(RegistryError::invalid_cell_size(raw, cell));
    }
    let size = raw.unsigned_abs() as usize;
    let abs = cell as usize + HBIN_START_OFFSET as usize;
    let end = abs + size;
    if end > data.len() {
        return Err(RegistryError::TruncatedData {
            offset: cell,
            expected: size,
            actual: data.len().saturating_sub(abs),
        });
    }
    Ok(&mut data[abs + CELL_HEADER_SIZE..end])
}

/// Segregated free-list allocator over the arena's bins.
///
/// The allocator holds only bookkeeping (free lists and the bin directory);
/// every operation takes the arena and dirty tracker it mutates.
#[derive(Debug, Default)]
pub struct CellAllocator {
    /// Free cell offsets, segregated by size class.
    buckets: [Vec<u32>; BUCKET_COUNT],

    /// `(relative offset, size)` of every bin, in file order.
    bins: Vec<(u32, u32)>,

    /// Running count of cells handed out.
    cells_allocated: u64,

    /// Running count of cells released.
    cells_freed: u64,
}

impl CellAllocator {
    /// Builds the allocator state by scanning every bin of an opened arena.
    ///
    /// # Errors
    ///
    /// Returns `Corrupt` if a bin or cell violates the format invariants.
    #[instrument(skip(arena))]
    pub fn from_arena(arena: &Arena) -> Result<Self> {
        let mut alloc = CellAllocator::default();
        let data = arena.bytes();

        let mut abs = HBIN_START_OFFSET as usize;
        while abs < data.len() {
            let rel = (abs - HBIN_START_OFFSET as usize) as u32;
            let header = HbinHeader::parse(&data[abs..], rel)?;

            let bin_size = header.size as usize;
            if bin_size < PAGE_SIZE || bin_size % PAGE_SIZE != 0 || abs + bin_size > data.len() {
                return Err(RegistryError::corrupt(format!(
                    "Bin at {:#x} declares invalid size {:#x}",
                    rel, bin_size
                )));
            }

            let area = &data[abs + HBIN_HEADER_SIZE..abs + bin_size];
            for cell in HbinCellIterator::new(area, rel + HBIN_HEADER_SIZE as u32) {
                let cell = cell?;
                if !cell.is_allocated {
                    alloc.push_free(cell.offset, cell.size as usize);
                }
            }

            alloc.bins.push((rel, header.size));
            abs += bin_size;
        }

        debug!(bins = alloc.bins.len(), "Allocator free lists built");
        Ok(alloc)
    }

    /// Allocates a cell of at least `total_bytes` (including the 4-byte
    /// header), rounded up to 8-byte alignment. The payload is zeroed.
    ///
    /// Returns the cell's offset relative to the data region. Any payload
    /// slice derived from it is live only until the next growth.
    pub fn alloc(
        &mut self,
        arena: &mut Arena,
        dirty: &mut DirtyPages,
        total_bytes: usize,
        class: CellClass,
    ) -> Result<u32> {
        let need = crate::utils::align8(total_bytes.max(MIN_CELL_SIZE));
        trace!(need, ?class, "alloc");

        let cell = match self.take_fit(arena.bytes(), need)? {
            Some(cell) => cell,
            None => {
                let pages = (need + HBIN_HEADER_SIZE).div_ceil(PAGE_SIZE);
                self.grow_by_pages(arena, dirty, pages)?;
                self.take_fit(arena.bytes(), need)?
                    .ok_or(RegistryError::OutOfSpace { requested: need })?
            }
        };

        let free_size = cell_total_size(arena.bytes(), cell)?;
        let data = arena.bytes_mut();
        let abs = cell as usize + HBIN_START_OFFSET as usize;

        // Split off the remainder when it can stand as a cell of its own.
        let take = if free_size - need >= MIN_CELL_SIZE {
            let rest = cell + need as u32;
            write_i32_le(data, rest as usize + HBIN_START_OFFSET as usize, (free_size - need) as i32)?;
            self.push_free(rest, free_size - need);
            need
        } else {
            free_size
        };

        write_i32_le(data, abs, -(take as i32))?;
        data[abs + CELL_HEADER_SIZE..abs + take].fill(0);
        dirty.add(abs, take);
        self.cells_allocated += 1;

        Ok(cell)
    }

    /// Releases the allocated cell at `cell`, coalescing with free
    /// neighbours within the same bin.
    ///
    /// # Errors
    ///
    /// Returns `InvalidFree` on double free or sign corruption.
    pub fn free(&mut self, arena: &mut Arena, dirty: &mut DirtyPages, cell: u32) -> Result<()> {
        let raw = cell_size_raw(arena.bytes(), cell)?;
        if raw >= 0 {
            return Err(RegistryError::InvalidFree { offset: cell });
        }
        let mut start = cell;
        let mut size = raw.unsigned_abs() as usize;
        if size < MIN_CELL_SIZE || size % 8 != 0 {
            return Err(RegistryError::InvalidFree { offset: cell });
        }

        let (bin_start, bin_size) = self.bin_containing(cell).ok_or_else(|| {
            RegistryError::corrupt(format!("Cell {:#x} belongs to no bin", cell))
        })?;
        let bin_end = bin_start + bin_size;

        // Coalesce forward, never across the bin boundary.
        let next = cell + size as u32;
        if next < bin_end {
            let next_raw = cell_size_raw(arena.bytes(), next)?;
            if next_raw > 0 {
                let next_size = next_raw as usize;
                self.remove_free(next, next_size)?;
                size += next_size;
            }
        }

        // Coalesce backward: walk the bin to find the immediate predecessor.
        let mut cur = bin_start + HBIN_HEADER_SIZE as u32;
        let mut prev: Option<(u32, i32)> = None;
        while cur < cell {
            let cur_raw = cell_size_raw(arena.bytes(), cur)?;
            let cur_size = cur_raw.unsigned_abs();
            if cur_size < MIN_CELL_SIZE as u32 || cur_size % 8 != 0 {
                return Err(RegistryError::corrupt(format!(
                    "Cell walk hit invalid size {} at {:#x}",
                    cur_raw, cur
                )));
            }
            prev = Some((cur, cur_raw));
            cur += cur_size;
        }
        if cur != cell {
            return Err(RegistryError::corrupt(format!(
                "Cell {:#x} is not on a cell boundary of its bin",
                cell
            )));
        }
        if let Some((prev_off, prev_raw)) = prev {
            if prev_raw > 0 {
                let prev_size = prev_raw as usize;
                self.remove_free(prev_off, prev_size)?;
                start = prev_off;
                size += prev_size;
            }
        }

        let abs = start as usize + HBIN_START_OFFSET as usize;
        write_i32_le(arena.bytes_mut(), abs, size as i32)?;
        dirty.add(abs, CELL_HEADER_SIZE);
        self.push_free(start, size);
        self.cells_freed += 1;

        trace!(cell, start, size, "freed");
        Ok(())
    }

    /// Appends a fresh bin of `pages` pages whose interior is one free cell.
    ///
    /// Returns the offset of that free cell.
    #[instrument(skip(self, arena, dirty))]
    pub fn grow_by_pages(
        &mut self,
        arena: &mut Arena,
        dirty: &mut DirtyPages,
        pages: usize,
    ) -> Result<u32> {
        let old_len = arena.grow_by_pages(pages)?;
        dirty.extend_to(arena.len());

        let bin_rel = (old_len - HBIN_START_OFFSET as usize) as u32;
        let bin_size = pages * PAGE_SIZE;
        let data = arena.bytes_mut();

        HbinHeader::write(&mut data[old_len..], bin_rel, bin_size as u32, filetime_now())?;

        let free_cell = bin_rel + HBIN_HEADER_SIZE as u32;
        let free_size = bin_size - HBIN_HEADER_SIZE;
        write_i32_le(data, old_len + HBIN_HEADER_SIZE, free_size as i32)?;

        dirty.add(old_len, bin_size);
        self.bins.push((bin_rel, bin_size as u32));
        self.push_free(free_cell, free_size);

        debug!(bin_rel, bin_size, "Appended bin");
        Ok(free_cell)
    }

    /// Ensures a single free cell of at least `total_bytes` exists, growing
    /// the arena in one call if necessary.
    ///
    /// Used by multi-cell writers (big data) to reserve all their space up
    /// front so no intermediate allocation triggers a remap.
    pub fn reserve(
        &mut self,
        arena: &mut Arena,
        dirty: &mut DirtyPages,
        total_bytes: usize,
    ) -> Result<()> {
        let need = crate::utils::align8(total_bytes.max(MIN_CELL_SIZE));
        if self.find_fit(arena.bytes(), need)?.is_some() {
            return Ok(());
        }
        let pages = (need + HBIN_HEADER_SIZE).div_ceil(PAGE_SIZE);
        self.grow_by_pages(arena, dirty, pages)?;
        Ok(())
    }

    /// Running totals of cells handed out and released.
    pub fn counters(&self) -> (u64, u64) {
        (self.cells_allocated, self.cells_freed)
    }

    /// Total free bytes currently tracked (diagnostics and tests).
    pub fn free_bytes(&self, data: &[u8]) -> usize {
        self.buckets
            .iter()
            .flatten()
            .filter_map(|&cell| cell_size_raw(data, cell).ok())
            .filter(|&raw| raw > 0)
            .map(|raw| raw as usize)
            .sum()
    }

    /// Returns the `(offset, size)` of the bin containing `cell`, if any.
    pub fn bin_containing(&self, cell: u32) -> Option<(u32, u32)> {
        let idx = self
            .bins
            .partition_point(|&(start, _)| start <= cell)
            .checked_sub(1)?;
        let (start, size) = self.bins[idx];
        (cell >= start + HBIN_HEADER_SIZE as u32 && cell < start + size).then_some((start, size))
    }

    /// Locates a fitting free cell without taking it.
    fn find_fit(&self, data: &[u8], need: usize) -> Result<Option<(usize, usize)>> {
        let start = bucket_index(need);

        // Within the request's own class sizes vary; first fit wins.
        for (pos, &cell) in self.buckets[start].iter().enumerate() {
            if self.free_cell_size(data, cell)? >= need {
                return Ok(Some((start, pos)));
            }
        }
        // Everything in a higher class is large enough by construction,
        // except the overflow class which must be checked.
        for bucket in start + 1..BUCKET_COUNT {
            if bucket == BUCKET_COUNT - 1 {
                for (pos, &cell) in self.buckets[bucket].iter().enumerate() {
                    if self.free_cell_size(data, cell)? >= need {
                        return Ok(Some((bucket, pos)));
                    }
                }
            } else if let Some(pos) = self.buckets[bucket].len().checked_sub(1) {
                return Ok(Some((bucket, pos)));
            }
        }
        Ok(None)
    }

    /// Pops a fitting free cell off its bucket.
    fn take_fit(&mut self, data: &[u8], need: usize) -> Result<Option<u32>> {
        match self.find_fit(data, need)? {
            Some((bucket, pos)) => Ok(Some(self.buckets[bucket].swap_remove(pos))),
            None => Ok(None),
        }
    }

    /// Reads and validates the size of a free-list entry.
    fn free_cell_size(&self, data: &[u8], cell: u32) -> Result<usize> {
        let raw = cell_size_raw(data, cell)?;
        if raw <= 0 {
            return Err(RegistryError::corrupt(format!(
                "Free list entry {:#x} has non-free size {}",
                cell, raw
            )));
        }
        Ok(raw as usize)
    }

    fn push_free(&mut self, cell: u32, size: usize) {
        self.buckets[bucket_index(size)].push(cell);
    }

    fn remove_free(&mut self, cell: u32, size: usize) -> Result<()> {
        let bucket = &mut self.buckets[bucket_index(size)];
        match bucket.iter().position(|&c| c == cell) {
            Some(pos) => {
                bucket.swap_remove(pos);
                Ok(())
            }
            None => Err(RegistryError::corrupt(format!(
                "Free cell {:#x} missing from its size class",
                cell
            ))),
        }
    }
}
