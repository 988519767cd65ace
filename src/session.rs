//! Write session over a single hive.
//!
//! A session wraps one arena, one allocator, one dirty tracker, and the
//! strategy parameters, and applies ordered plans of edits under the hive
//! format's dual-sequence transaction protocol: begin bumps the primary
//! sequence, commit sets the secondary equal, stamps the header, rewrites
//! the checksum, and syncs every dirty page.
//!
//! A write error mid-plan leaves the file torn (sequences unequal) and
//! poisons the session; every further operation returns `Corrupt`.

use crate::alloc::CellAllocator;
use crate::arena::Arena;
use crate::cell::{KeyNodeFlags, ValueType};
use crate::dirty::DirtyPages;
use crate::error::{RegistryError, Result};
use crate::hbin::HbinHeader;
use crate::header::{self, BaseBlock, BASE_BLOCK_SIZE};
use crate::key::KeyNode;
use crate::strategy::Strategy;
use crate::utils::{align8, filetime_now, write_i32_le, NO_CELL, PAGE_SIZE};
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info, instrument};

/// Cell offset of the root key in a freshly created hive.
pub const MINIMAL_ROOT_OFFSET: u32 = 0x20;

/// One edit in a plan. Ops are applied in order; later ops observe the
/// effects of earlier ones.
#[derive(Debug, Clone)]
pub enum Op {
    /// Create every missing segment of `path`. Idempotent.
    EnsureKey {
        /// Key path segments from the root, e.g. `["Software", "MyApp"]`.
        path: Vec<String>,
    },

    /// Delete the key at `path` and its entire subtree.
    DeleteKey {
        /// Key path segments from the root.
        path: Vec<String>,
    },

    /// Set (add or update) a value under the key at `path`, creating the
    /// key if needed.
    SetValue {
        /// Key path segments from the root.
        path: Vec<String>,
        /// Value name; empty for the default value.
        name: String,
        /// On-disk value type code.
        data_type: ValueType,
        /// Encoded payload bytes.
        data: Vec<u8>,
    },

    /// Delete a value under the key at `path`. Missing values (or a missing
    /// key) are treated as success.
    DeleteValue {
        /// Key path segments from the root.
        path: Vec<String>,
        /// Value name.
        name: String,
    },
}

/// An ordered batch of edits applied as one transaction.
pub type Plan = Vec<Op>;

/// Counters describing what a committed plan did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyStats {
    /// Ops applied from the plan.
    pub ops_applied: usize,

    /// Cells allocated while applying.
    pub cells_allocated: u64,

    /// Cells freed while applying.
    pub cells_freed: u64,

    /// Bytes the arena grew by while applying.
    pub bytes_grown: u64,

    /// Deferred parent/child links flushed before commit.
    pub deferred_flushed: usize,
}

/// Single-writer session over one hive file.
pub struct Session {
    pub(crate) arena: Arena,
    pub(crate) alloc: CellAllocator,
    pub(crate) dirty: DirtyPages,
    pub(crate) strategy: Strategy,
    root_offset: u32,
    /// Pending parent -> children links while deferred mode is active.
    pub(crate) deferred: Option<HashMap<u32, Vec<u32>>>,
    in_tx: bool,
    poisoned: bool,
}

impl Session {
    /// Opens an existing hive file for writing.
    ///
    /// # Errors
    ///
    /// Surfaces header parse failures (bad signature, checksum mismatch,
    /// unsupported version) and refuses torn files: a hive whose sequence
    /// numbers differ needs recovery and is rejected with `Corrupt`.
    #[instrument(skip(path), fields(path = %path.as_ref().display()))]
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let arena = Arena::open(&path)?;
        let base = BaseBlock::parse(arena.bytes())?;

        if !base.is_consistent() {
            return Err(RegistryError::corrupt(format!(
                "Torn transaction: primary sequence {} != secondary {}",
                base.primary_sequence, base.secondary_sequence
            )));
        }
        if base.file_type != 0 {
            return Err(RegistryError::InvalidFormat(format!(
                "Not a normal hive (file type {})",
                base.file_type
            )));
        }

        let alloc = CellAllocator::from_arena(&arena)?;
        let dirty = DirtyPages::new(arena.len());
        let root_offset = base.root_cell_offset;

        let session = Session {
            arena,
            alloc,
            dirty,
            strategy: Strategy::default(),
            root_offset,
            deferred: None,
            in_tx: false,
            poisoned: false,
        };

        // The root must be a readable key node.
        session.read_key(root_offset)?;
        info!(root = %format!("{:#x}", root_offset), "Session opened");
        Ok(session)
    }

    /// Creates the smallest valid hive at `path` and opens a session on it.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        create_minimal_hive(&path)?;
        Self::open(path)
    }

    /// Replaces the reuse strategy for subsequent ops.
    pub fn set_strategy(&mut self, strategy: Strategy) {
        self.strategy = strategy;
    }

    /// Returns the current reuse strategy.
    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    /// Returns the root key cell offset.
    pub fn root_offset(&self) -> u32 {
        self.root_offset
    }

    /// Returns the current arena length in bytes.
    pub fn arena_len(&self) -> usize {
        self.arena.len()
    }

    /// Switches subkey-list maintenance into deferred mode: child links
    /// accumulate in memory and are written in bulk before each commit.
    pub fn enable_deferred_subkeys(&mut self) {
        self.deferred.get_or_insert_with(HashMap::new);
    }

    /// Returns true if deferred mode is active.
    pub fn deferred_enabled(&self) -> bool {
        self.deferred.is_some()
    }

    /// Preallocates `pages` pages of free space to avoid repeated growth
    /// during bulk builds.
    pub fn grow_by_pages(&mut self, pages: usize) -> Result<()> {
        self.check_usable()?;
        self.alloc
            .grow_by_pages(&mut self.arena, &mut self.dirty, pages)?;
        Ok(())
    }

    /// Applies a plan as a single transaction.
    ///
    /// The header's primary sequence is bumped, each op is executed in
    /// order, pending deferred links are flushed, and the transaction is
    /// committed. An op failure aborts the plan: already-applied ops remain
    /// on disk, the file stays torn, and the session is poisoned.
    #[instrument(skip(self, plan), fields(ops = plan.len()))]
    pub fn apply_with_tx(&mut self, plan: Plan) -> Result<ApplyStats> {
        self.check_usable()?;
        if plan.is_empty() {
            return Ok(ApplyStats::default());
        }

        let len_before = self.arena.len();
        let (allocs_before, frees_before) = self.alloc.counters();
        let ops = plan.len();

        self.begin()?;
        for op in plan {
            if let Err(err) = self.apply_op(op) {
                self.poisoned = true;
                return Err(err);
            }
        }
        let deferred_flushed = match self.flush_deferred_subkeys() {
            Ok(count) => count,
            Err(err) => {
                self.poisoned = true;
                return Err(err);
            }
        };
        self.commit()?;

        let (allocs_after, frees_after) = self.alloc.counters();
        let stats = ApplyStats {
            ops_applied: ops,
            cells_allocated: allocs_after - allocs_before,
            cells_freed: frees_after - frees_before,
            bytes_grown: (self.arena.len() - len_before) as u64,
            deferred_flushed,
        };
        debug!(?stats, "Plan committed");
        Ok(stats)
    }

    /// Writes every pending deferred parent/child link to disk.
    ///
    /// For each parent, the existing on-disk children and the pending ones
    /// are merged into a single sorted bulk build of a fresh leaf (or index
    /// root over several leaves); the old list structure is freed.
    ///
    /// Returns the number of links flushed.
    pub fn flush_deferred_subkeys(&mut self) -> Result<usize> {
        let Some(map) = self.deferred.as_mut() else {
            return Ok(0);
        };
        if map.is_empty() {
            return Ok(0);
        }

        let parents: Vec<(u32, Vec<u32>)> = map.drain().collect();
        let mut flushed = 0;
        for (parent, pending) in parents {
            flushed += pending.len();
            self.rebuild_subkey_list(parent, pending)?;
        }
        debug!(flushed, "Deferred subkey links flushed");
        Ok(flushed)
    }

    /// Commits any open work and closes the session.
    ///
    /// A poisoned session closes without committing, leaving the torn file
    /// on disk for recovery.
    pub fn close(mut self) -> Result<()> {
        if self.poisoned {
            return Ok(());
        }

        let pending = self.deferred.as_ref().is_some_and(|d| !d.is_empty());
        if pending && !self.in_tx {
            self.begin()?;
        }
        if self.in_tx {
            self.flush_deferred_subkeys()?;
            self.commit()?;
        }
        self.arena.sync_all()?;
        info!("Session closed");
        Ok(())
    }

    /// Abandons the session without committing.
    ///
    /// Best-effort rollback only: transactions already committed by earlier
    /// applies remain on disk, and an open transaction leaves the file torn
    /// (and detectable as such on the next open).
    pub fn close_without_commit(self) {
        drop(self);
    }

    pub(crate) fn check_usable(&self) -> Result<()> {
        if self.poisoned {
            return Err(RegistryError::corrupt(
                "Session poisoned by an earlier write failure".to_string(),
            ));
        }
        Ok(())
    }

    fn begin(&mut self) -> Result<()> {
        header::begin_transaction(self.arena.bytes_mut())?;
        self.dirty.add(0, BASE_BLOCK_SIZE);
        self.in_tx = true;
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        let data_size = (self.arena.len() - BASE_BLOCK_SIZE) as u32;
        header::commit_transaction(self.arena.bytes_mut(), data_size)?;
        self.dirty.add(0, BASE_BLOCK_SIZE);

        for range in self.dirty.drain() {
            self.arena.sync_range(range.start, range.end - range.start)?;
        }
        self.in_tx = false;
        Ok(())
    }

    fn apply_op(&mut self, op: Op) -> Result<()> {
        match op {
            Op::EnsureKey { path } => {
                self.ensure_key(&path)?;
                Ok(())
            }
            Op::DeleteKey { path } => self.delete_key(&path),
            Op::SetValue {
                path,
                name,
                data_type,
                data,
            } => {
                let key = self.ensure_key(&path)?;
                self.set_value(key, &name, data_type, &data)
            }
            Op::DeleteValue { path, name } => match self.find_key(&path) {
                Ok(key) => self.delete_value(key, &name),
                // A missing key means the value is already gone.
                Err(RegistryError::NotFound(_)) => Ok(()),
                Err(err) => Err(err),
            },
        }
    }

    pub(crate) fn read_key(&self, cell: u32) -> Result<KeyNode> {
        let payload = crate::alloc::cell_payload(self.arena.bytes(), cell)?;
        KeyNode::parse(payload, cell)
    }
}

/// Writes the smallest valid hive image to `path`: a 4 KiB header plus one
/// 4 KiB bin holding an empty root key and a master free cell.
#[instrument(skip(path), fields(path = %path.as_ref().display()))]
pub fn create_minimal_hive<P: AsRef<Path>>(path: P) -> Result<()> {
    std::fs::write(&path, minimal_hive_image()?)?;
    info!("Created minimal hive");
    Ok(())
}

/// Builds the minimal 8 KiB hive image in memory.
pub fn minimal_hive_image() -> Result<Vec<u8>> {
    let mut image = vec![0u8; 2 * PAGE_SIZE];

    // First bin with the empty root key
    let root_payload = KeyNode::build(
        "",
        NO_CELL,
        NO_CELL,
        filetime_now(),
        KeyNodeFlags::ROOT_KEY | KeyNodeFlags::NO_DELETE,
    )?;
    let root_cell_size = align8(4 + root_payload.len());

    HbinHeader::write(
        &mut image[PAGE_SIZE..],
        0,
        PAGE_SIZE as u32,
        filetime_now(),
    )?;

    let root_abs = PAGE_SIZE + MINIMAL_ROOT_OFFSET as usize;
    write_i32_le(&mut image, root_abs, -(root_cell_size as i32))?;
    image[root_abs + 4..root_abs + 4 + root_payload.len()].copy_from_slice(&root_payload);

    // Master free cell fills the rest of the bin
    let free_abs = root_abs + root_cell_size;
    let free_size = 2 * PAGE_SIZE - free_abs;
    write_i32_le(&mut image, free_abs, free_size as i32)?;

    // Header last so the data-region length is final
    BaseBlock::new_empty(MINIMAL_ROOT_OFFSET, PAGE_SIZE as u32).serialize(&mut image)?;

    Ok(image)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hive_path(dir: &tempfile::TempDir) -> std::path::PathBuf {
        dir.path().join("session.hive")
    }

    #[test]
    fn test_minimal_image_shape() {
        let image = minimal_hive_image().unwrap();
        assert_eq!(image.len(), 2 * PAGE_SIZE);

        let base = BaseBlock::parse(&image).unwrap();
        assert!(base.is_consistent());
        assert_eq!(base.root_cell_offset, MINIMAL_ROOT_OFFSET);
        assert_eq!(base.hive_length, PAGE_SIZE as u32);

        HbinHeader::parse(&image[PAGE_SIZE..], 0).unwrap();
    }

    #[test]
    fn test_create_open_close() {
        let dir = tempfile::tempdir().unwrap();
        let path = hive_path(&dir);

        let session = Session::create(&path).unwrap();
        let root = session.read_key(session.root_offset()).unwrap();
        assert!(root.is_root());
        assert_eq!(root.name, "");
        assert_eq!(root.subkey_count, 0);
        assert_eq!(root.value_count, 0);
        session.close().unwrap();

        // A clean reopen works
        Session::open(&path).unwrap().close().unwrap();
    }

    #[test]
    fn test_open_rejects_torn_hive() {
        let dir = tempfile::tempdir().unwrap();
        let path = hive_path(&dir);
        create_minimal_hive(&path).unwrap();

        let mut image = std::fs::read(&path).unwrap();
        header::begin_transaction(&mut image).unwrap();
        std::fs::write(&path, &image).unwrap();

        assert!(matches!(
            Session::open(&path),
            Err(RegistryError::Corrupt(_))
        ));
    }

    #[test]
    fn test_empty_plan_leaves_bytes_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = hive_path(&dir);
        create_minimal_hive(&path).unwrap();
        let before = std::fs::read(&path).unwrap();

        let mut session = Session::open(&path).unwrap();
        let stats = session.apply_with_tx(Vec::new()).unwrap();
        assert_eq!(stats, ApplyStats::default());
        session.close().unwrap();

        let after = std::fs::read(&path).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_commit_restores_consistency() {
        let dir = tempfile::tempdir().unwrap();
        let path = hive_path(&dir);

        let mut session = Session::create(&path).unwrap();
        session
            .apply_with_tx(vec![Op::EnsureKey {
                path: vec!["Software".to_string()],
            }])
            .unwrap();
        session.close().unwrap();

        let image = std::fs::read(&path).unwrap();
        let base = BaseBlock::parse(&image).unwrap();
        assert!(base.is_consistent());
        assert_eq!(base.primary_sequence, 2);
    }
}
