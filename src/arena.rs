//! Mutable, growable memory-mapped arena backing a hive file.
//!
//! The arena owns the file bytes: a 4 KiB header page followed by the data
//! region of 4 KiB-aligned bins. Growth extends the file in page multiples
//! and re-maps it; any byte slice taken before a growth is invalid after it.

use crate::error::{RegistryError, Result};
use crate::utils::PAGE_SIZE;
use memmap2::MmapMut;
use std::fs::{File, OpenOptions};
use std::path::Path;
use tracing::{debug, instrument};

/// Hard cap on the arena size: cell references are 32-bit offsets into the
/// data region, so the file can never exceed 4 GiB.
pub const MAX_ARENA_SIZE: u64 = 4 * 1024 * 1024 * 1024;

/// A read-write memory mapping over the hive file.
pub struct Arena {
    file: File,
    map: MmapMut,
}

impl Arena {
    /// Opens an existing hive file read-write and maps it.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened, is not a whole number
    /// of pages, or cannot be mapped.
    #[instrument(skip(path), fields(path = %path.as_ref().display()))]
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let len = file.metadata()?.len();

        if len == 0 || len % PAGE_SIZE as u64 != 0 {
            return Err(RegistryError::InvalidFormat(format!(
                "Hive size {:#x} is not a multiple of the {:#x}-byte page size",
                len, PAGE_SIZE
            )));
        }
        if len > MAX_ARENA_SIZE {
            return Err(RegistryError::InvalidFormat(format!(
                "Hive of {} bytes exceeds the 4 GiB cell offset space",
                len
            )));
        }

        // SAFETY: the mapping is private to this session; the single-writer
        // contract means no other code mutates the file while it is mapped,
        // and all access goes through bounds-checked slices.
        let map = unsafe { MmapMut::map_mut(&file)? };
        debug!(size = map.len(), "Memory mapped hive file read-write");

        Ok(Self { file, map })
    }

    /// Creates a new file of `initial_len` bytes (zero-filled) and maps it.
    pub fn create<P: AsRef<Path>>(path: P, initial_len: usize) -> Result<Self> {
        if initial_len == 0 || initial_len % PAGE_SIZE != 0 {
            return Err(RegistryError::InvalidArgument(format!(
                "Initial arena length {:#x} is not a page multiple",
                initial_len
            )));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.set_len(initial_len as u64)?;

        // SAFETY: same single-writer contract as `open`.
        let map = unsafe { MmapMut::map_mut(&file)? };
        Ok(Self { file, map })
    }

    /// Returns the current arena length in bytes.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Returns true if the arena is empty (never the case for a valid hive).
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Returns a view of the whole arena.
    ///
    /// The slice is invalidated by the next [`Arena::grow_by_pages`] call.
    pub fn bytes(&self) -> &[u8] {
        &self.map
    }

    /// Returns a mutable view of the whole arena.
    ///
    /// The slice is invalidated by the next [`Arena::grow_by_pages`] call.
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.map
    }

    /// Extends the file by `pages` 4 KiB pages and re-maps it.
    ///
    /// Returns the previous length, which is where the appended region
    /// begins. All outstanding byte slices are invalid after this call.
    ///
    /// # Errors
    ///
    /// Returns `OutOfSpace` if the 4 GiB offset space would be exhausted or
    /// the file cannot be extended.
    #[instrument(skip(self))]
    pub fn grow_by_pages(&mut self, pages: usize) -> Result<usize> {
        if pages == 0 {
            return Err(RegistryError::InvalidArgument(
                "Cannot grow arena by zero pages".to_string(),
            ));
        }

        let old_len = self.map.len();
        let grow_bytes = pages
            .checked_mul(PAGE_SIZE)
            .ok_or(RegistryError::OutOfSpace { requested: usize::MAX })?;
        let new_len = old_len as u64 + grow_bytes as u64;

        if new_len > MAX_ARENA_SIZE {
            return Err(RegistryError::OutOfSpace {
                requested: new_len as usize,
            });
        }

        self.file
            .set_len(new_len)
            .map_err(|_| RegistryError::OutOfSpace {
                requested: new_len as usize,
            })?;

        // SAFETY: the old mapping is replaced before any further access; no
        // view of it survives this function.
        self.map = unsafe { MmapMut::map_mut(&self.file)? };
        debug!(old_len, new_len, "Arena grown");

        Ok(old_len)
    }

    /// Persists a byte range to the backing file, retrying on EINTR.
    ///
    /// This is advisory; durability is guaranteed only by the transaction
    /// commit sequence.
    pub fn sync_range(&self, offset: usize, len: usize) -> Result<()> {
        if offset + len > self.map.len() {
            return Err(RegistryError::invalid_offset(offset as u32, self.map.len()));
        }
        loop {
            match self.map.flush_range(offset, len) {
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                other => return Ok(other?),
            }
        }
    }

    /// Persists the entire mapping to the backing file, retrying on EINTR.
    pub fn sync_all(&self) -> Result<()> {
        loop {
            match self.map.flush() {
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                other => return Ok(other?),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_grow() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("arena.hive");

        let mut arena = Arena::create(&path, 2 * PAGE_SIZE).unwrap();
        assert_eq!(arena.len(), 2 * PAGE_SIZE);

        let old_len = arena.grow_by_pages(3).unwrap();
        assert_eq!(old_len, 2 * PAGE_SIZE);
        assert_eq!(arena.len(), 5 * PAGE_SIZE);

        // New pages start zeroed
        assert!(arena.bytes()[old_len..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_growth_persists_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("arena.hive");

        let mut arena = Arena::create(&path, PAGE_SIZE).unwrap();
        arena.bytes_mut()[0..4].copy_from_slice(b"regf");
        arena.grow_by_pages(1).unwrap();
        assert_eq!(&arena.bytes()[0..4], b"regf");

        arena.sync_all().unwrap();
        drop(arena);

        let reopened = Arena::open(&path).unwrap();
        assert_eq!(reopened.len(), 2 * PAGE_SIZE);
        assert_eq!(&reopened.bytes()[0..4], b"regf");
    }

    #[test]
    fn test_open_rejects_partial_page() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ragged.hive");
        std::fs::write(&path, vec![0u8; PAGE_SIZE + 100]).unwrap();

        assert!(Arena::open(&path).is_err());
    }

    #[test]
    fn test_sync_range_bounds() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("arena.hive");
        let arena = Arena::create(&path, PAGE_SIZE).unwrap();

        assert!(arena.sync_range(0, PAGE_SIZE).is_ok());
        assert!(arena.sync_range(PAGE_SIZE, 1).is_err());
    }
}
