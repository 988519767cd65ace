//! Key and value editors.
//!
//! These `Session` methods translate plan ops into cell allocations and
//! in-place mutations: walking and growing the key tree, maintaining the
//! sorted subkey lists (with splits under an index root past the leaf
//! fanout), editing value lists, and routing oversized payloads through the
//! big data store. All mutations go through the allocator and mark their
//! pages dirty.

use crate::alloc::{cell_payload, cell_payload_mut, cell_total_size};
use crate::bigdata::{free_big_data, write_big_data, MAX_DIRECT_DATA_SIZE};
use crate::cell::{CellClass, ValueType, CELL_HEADER_SIZE, VALUE_DATA_INLINE};
use crate::error::{RegistryError, Result};
use crate::key::{
    KeyNode, NK_MAX_VALUE_DATA_LEN, NK_MAX_VALUE_NAME_LEN, NK_SUBKEY_COUNT, NK_SUBKEY_LIST,
    NK_TIMESTAMP, NK_VALUE_COUNT, NK_VALUE_LIST,
};
use crate::security::{SecurityKey, SK_BLINK, SK_FLINK, SK_REFCOUNT};
use crate::session::Session;
use crate::subkey_list::{build_hash_leaf, build_index_root, lh_hash, SubkeyList, LEAF_FANOUT};
use crate::utils::{
    align8, filetime_now, name_cmp, name_eq, read_u32_le, write_u32_le, write_u64_le,
    HBIN_START_OFFSET, NO_CELL,
};
use crate::value::{pack_inline, ValueKey};
use std::cmp::Ordering;
use tracing::trace;

/// Outcome of inserting into a single leaf.
enum LeafInsert {
    /// The leaf absorbed the entry; holds its (possibly reallocated) cell.
    Single(u32),

    /// The leaf overflowed and was split into two.
    Split(u32, u32),
}

impl Session {
    // ---- path resolution ----------------------------------------------

    /// Walks `path` from the root, failing with `NotFound` on the first
    /// missing segment.
    pub(crate) fn find_key(&self, path: &[String]) -> Result<u32> {
        let mut cur = self.root_offset();
        for seg in path {
            cur = self
                .lookup_child(cur, seg)?
                .ok_or_else(|| RegistryError::not_found("key", seg))?;
        }
        Ok(cur)
    }

    /// Walks `path` from the root, creating every missing segment.
    /// Idempotent: an existing path is returned unchanged.
    pub(crate) fn ensure_key(&mut self, path: &[String]) -> Result<u32> {
        let mut cur = self.root_offset();
        for seg in path {
            if seg.is_empty() {
                return Err(RegistryError::InvalidArgument(
                    "Empty key path segment".to_string(),
                ));
            }
            cur = match self.lookup_child(cur, seg)? {
                Some(child) => child,
                None => self.create_key(cur, seg)?,
            };
        }
        Ok(cur)
    }

    /// Deletes the key at `path` and its entire subtree.
    pub(crate) fn delete_key(&mut self, path: &[String]) -> Result<()> {
        let Some((last, parent_path)) = path.split_last() else {
            return Err(RegistryError::InvalidArgument(
                "Cannot delete the root key".to_string(),
            ));
        };

        let parent = self.find_key(parent_path)?;
        let target = self
            .lookup_child(parent, last)?
            .ok_or_else(|| RegistryError::not_found("key", last))?;

        self.remove_subkey(parent, last)?;
        self.delete_subtree(target)?;
        self.touch_key(parent)?;
        Ok(())
    }

    fn create_key(&mut self, parent: u32, name: &str) -> Result<u32> {
        let parent_node = self.read_key(parent)?;
        let security = parent_node.security_offset;

        let payload = KeyNode::build(name, parent, security, filetime_now(), 0)?;
        let child = self.alloc_and_write(&payload, CellClass::Node)?;

        if security != NO_CELL {
            self.sk_addref(security)?;
        }
        self.insert_subkey(parent, child, name)?;
        self.touch_key(parent)?;
        trace!(parent, child, name, "created key");
        Ok(child)
    }

    fn delete_subtree(&mut self, cell: u32) -> Result<()> {
        let node = self.read_key(cell)?;

        // Values and their data resources
        let refs = self.read_value_refs(&node)?;
        for vk in refs {
            self.free_value(vk)?;
        }
        if node.value_list_offset != NO_CELL && node.value_count > 0 {
            self.alloc
                .free(&mut self.arena, &mut self.dirty, node.value_list_offset)?;
        }

        // Children, both on disk and still pending in deferred mode
        let mut children = Vec::new();
        if node.subkey_list_offset != NO_CELL {
            self.collect_leaf_children(node.subkey_list_offset, &mut children)?;
        }
        if let Some(map) = &mut self.deferred {
            if let Some(pending) = map.remove(&cell) {
                children.extend(pending);
            }
        }
        for child in children {
            self.delete_subtree(child)?;
        }

        if node.subkey_list_offset != NO_CELL {
            self.free_list_tree(node.subkey_list_offset)?;
        }
        if node.security_offset != NO_CELL {
            self.sk_release(node.security_offset)?;
        }
        self.alloc.free(&mut self.arena, &mut self.dirty, cell)
    }

    // ---- subkey lists --------------------------------------------------

    /// Finds a child by case-insensitive name, consulting both the on-disk
    /// list and any links still pending in deferred mode.
    pub(crate) fn lookup_child(&self, parent: u32, name: &str) -> Result<Option<u32>> {
        let node = self.read_key(parent)?;
        if node.subkey_list_offset != NO_CELL && node.subkey_count > 0 {
            if let Some(hit) = self.lookup_in_list(node.subkey_list_offset, name)? {
                return Ok(Some(hit));
            }
        }
        if let Some(map) = &self.deferred {
            if let Some(pending) = map.get(&parent) {
                for &child in pending {
                    if name_eq(&self.read_key(child)?.name, name) {
                        return Ok(Some(child));
                    }
                }
            }
        }
        Ok(None)
    }

    fn lookup_in_list(&self, list_cell: u32, name: &str) -> Result<Option<u32>> {
        let list = self.parse_list(list_cell)?;
        match list {
            SubkeyList::IndexRoot(subs) => {
                for sub in subs {
                    if let Some(hit) = self.lookup_in_list(sub, name)? {
                        return Ok(Some(hit));
                    }
                }
                Ok(None)
            }
            leaf => {
                let offsets: Vec<u32> = leaf.offsets_iter().collect();
                Ok(self.child_position(&offsets, name)?.ok().map(|(_, cell)| cell))
            }
        }
    }

    /// Binary search over a sorted run of child offsets.
    ///
    /// Returns `Ok((index, cell))` on a hit, `Err(insert_position)` on a
    /// miss.
    fn child_position(
        &self,
        offsets: &[u32],
        name: &str,
    ) -> Result<std::result::Result<(usize, u32), usize>> {
        let mut lo = 0;
        let mut hi = offsets.len();
        while lo < hi {
            let mid = (lo + hi) / 2;
            let mid_name = self.read_key(offsets[mid])?.name;
            match name_cmp(name, &mid_name) {
                Ordering::Less => hi = mid,
                Ordering::Greater => lo = mid + 1,
                Ordering::Equal => return Ok(Ok((mid, offsets[mid]))),
            }
        }
        Ok(Err(lo))
    }

    fn insert_subkey(&mut self, parent: u32, child: u32, name: &str) -> Result<()> {
        if let Some(map) = &mut self.deferred {
            map.entry(parent).or_default().push(child);
            return Ok(());
        }
        self.list_insert(parent, child, name)
    }

    fn list_insert(&mut self, parent: u32, child: u32, name: &str) -> Result<()> {
        let node = self.read_key(parent)?;
        let hash = lh_hash(name);

        let new_list = if node.subkey_list_offset == NO_CELL || node.subkey_count == 0 {
            let payload = build_hash_leaf(&[(child, hash)])?;
            self.alloc_and_write(&payload, CellClass::List)?
        } else {
            self.insert_into_list(node.subkey_list_offset, child, name, hash)?
        };

        self.patch_cell_u32(parent, NK_SUBKEY_LIST, new_list)?;
        self.patch_cell_u32(parent, NK_SUBKEY_COUNT, node.subkey_count + 1)?;
        Ok(())
    }

    fn insert_into_list(&mut self, list_cell: u32, child: u32, name: &str, hash: u32) -> Result<u32> {
        match self.parse_list(list_cell)? {
            SubkeyList::IndexRoot(mut leaves) => {
                // Pick the first leaf whose last entry sorts at or after the
                // new name; past the end, append to the last leaf.
                let mut idx = leaves.len() - 1;
                for (i, &leaf) in leaves.iter().enumerate() {
                    if let Some(last) = self.leaf_last_name(leaf)? {
                        if name_cmp(name, &last) != Ordering::Greater {
                            idx = i;
                            break;
                        }
                    }
                }

                match self.insert_into_leaf(leaves[idx], child, name, hash)? {
                    LeafInsert::Single(cell) if cell == leaves[idx] => Ok(list_cell),
                    LeafInsert::Single(cell) => {
                        leaves[idx] = cell;
                        let payload = build_index_root(&leaves)?;
                        self.rewrite_cell(list_cell, &payload, CellClass::List)
                    }
                    LeafInsert::Split(a, b) => {
                        leaves[idx] = a;
                        leaves.insert(idx + 1, b);
                        let payload = build_index_root(&leaves)?;
                        self.rewrite_cell(list_cell, &payload, CellClass::List)
                    }
                }
            }
            _ => match self.insert_into_leaf(list_cell, child, name, hash)? {
                LeafInsert::Single(cell) => Ok(cell),
                LeafInsert::Split(a, b) => {
                    let payload = build_index_root(&[a, b])?;
                    self.alloc_and_write(&payload, CellClass::List)
                }
            },
        }
    }

    fn insert_into_leaf(
        &mut self,
        leaf_cell: u32,
        child: u32,
        name: &str,
        hash: u32,
    ) -> Result<LeafInsert> {
        let mut entries = self.leaf_entries_hashed(leaf_cell)?;
        let offsets: Vec<u32> = entries.iter().map(|&(off, _)| off).collect();

        let pos = match self.child_position(&offsets, name)? {
            Err(pos) => pos,
            Ok(_) => {
                return Err(RegistryError::corrupt(format!(
                    "Duplicate subkey insert for '{}'",
                    name
                )))
            }
        };
        entries.insert(pos, (child, hash));

        if entries.len() <= LEAF_FANOUT {
            let payload = build_hash_leaf(&entries)?;
            Ok(LeafInsert::Single(self.rewrite_cell(
                leaf_cell,
                &payload,
                CellClass::List,
            )?))
        } else {
            let mid = entries.len() / 2;
            let left = build_hash_leaf(&entries[..mid])?;
            let right = build_hash_leaf(&entries[mid..])?;
            let a = self.alloc_and_write(&left, CellClass::List)?;
            let b = self.alloc_and_write(&right, CellClass::List)?;
            self.alloc.free(&mut self.arena, &mut self.dirty, leaf_cell)?;
            trace!(leaf_cell, a, b, "split leaf");
            Ok(LeafInsert::Split(a, b))
        }
    }

    /// Removes `name` from the parent's subkey list, handling both the
    /// pending deferred links and the on-disk structure.
    fn remove_subkey(&mut self, parent: u32, name: &str) -> Result<()> {
        // A child created in deferred mode may not be on disk yet.
        let pending_idx = if let Some(map) = &self.deferred {
            match map.get(&parent) {
                Some(pending) => {
                    let mut found = None;
                    for (i, &child) in pending.iter().enumerate() {
                        if name_eq(&self.read_key(child)?.name, name) {
                            found = Some(i);
                            break;
                        }
                    }
                    found
                }
                None => None,
            }
        } else {
            None
        };
        if let Some(i) = pending_idx {
            if let Some(map) = &mut self.deferred {
                if let Some(pending) = map.get_mut(&parent) {
                    pending.remove(i);
                }
            }
            return Ok(());
        }

        let node = self.read_key(parent)?;
        if node.subkey_list_offset == NO_CELL || node.subkey_count == 0 {
            return Err(RegistryError::not_found("subkey", name));
        }

        let new_list = self.remove_from_list(node.subkey_list_offset, name)?;
        self.patch_cell_u32(parent, NK_SUBKEY_LIST, new_list.unwrap_or(NO_CELL))?;
        self.patch_cell_u32(parent, NK_SUBKEY_COUNT, node.subkey_count - 1)?;
        Ok(())
    }

    fn remove_from_list(&mut self, list_cell: u32, name: &str) -> Result<Option<u32>> {
        match self.parse_list(list_cell)? {
            SubkeyList::IndexRoot(mut leaves) => {
                let mut idx = None;
                for (i, &leaf) in leaves.iter().enumerate() {
                    if let Some(last) = self.leaf_last_name(leaf)? {
                        if name_cmp(name, &last) != Ordering::Greater {
                            idx = Some(i);
                            break;
                        }
                    }
                }
                let idx = idx.ok_or_else(|| RegistryError::not_found("subkey", name))?;
                let leaf = leaves[idx];

                match self.remove_from_leaf(leaf, name)? {
                    Some(cell) if cell == leaf => Ok(Some(list_cell)),
                    Some(cell) => {
                        leaves[idx] = cell;
                        let payload = build_index_root(&leaves)?;
                        Ok(Some(self.rewrite_cell(list_cell, &payload, CellClass::List)?))
                    }
                    None => {
                        leaves.remove(idx);
                        match leaves.len() {
                            0 => {
                                self.alloc.free(&mut self.arena, &mut self.dirty, list_cell)?;
                                Ok(None)
                            }
                            1 => {
                                // Collapse the index root onto its last leaf
                                let only = leaves[0];
                                self.alloc.free(&mut self.arena, &mut self.dirty, list_cell)?;
                                Ok(Some(only))
                            }
                            _ => {
                                let payload = build_index_root(&leaves)?;
                                Ok(Some(self.rewrite_cell(list_cell, &payload, CellClass::List)?))
                            }
                        }
                    }
                }
            }
            _ => self.remove_from_leaf(list_cell, name),
        }
    }

    fn remove_from_leaf(&mut self, leaf_cell: u32, name: &str) -> Result<Option<u32>> {
        let mut entries = self.leaf_entries_hashed(leaf_cell)?;
        let offsets: Vec<u32> = entries.iter().map(|&(off, _)| off).collect();

        let pos = match self.child_position(&offsets, name)? {
            Ok((pos, _)) => pos,
            Err(_) => return Err(RegistryError::not_found("subkey", name)),
        };
        entries.remove(pos);

        if entries.is_empty() {
            self.alloc.free(&mut self.arena, &mut self.dirty, leaf_cell)?;
            return Ok(None);
        }

        let payload = build_hash_leaf(&entries)?;
        Ok(Some(self.rewrite_cell(leaf_cell, &payload, CellClass::List)?))
    }

    /// Bulk-rebuilds a parent's subkey list from its on-disk children plus
    /// `pending` deferred ones: everything is sorted once and written as a
    /// fresh leaf, or several leaves under an index root past the fanout.
    pub(crate) fn rebuild_subkey_list(&mut self, parent: u32, pending: Vec<u32>) -> Result<()> {
        let node = self.read_key(parent)?;

        let mut offsets = Vec::new();
        if node.subkey_list_offset != NO_CELL {
            self.collect_leaf_children(node.subkey_list_offset, &mut offsets)?;
        }
        offsets.extend(pending);

        let mut entries = Vec::with_capacity(offsets.len());
        for off in offsets {
            let name = self.read_key(off)?.name;
            entries.push((off, name));
        }
        entries.sort_by(|a, b| name_cmp(&a.1, &b.1));

        let hashed: Vec<(u32, u32)> = entries
            .iter()
            .map(|(off, name)| (*off, lh_hash(name)))
            .collect();

        // Free the old structure first so the bulk build can reuse its cells.
        if node.subkey_list_offset != NO_CELL {
            self.free_list_tree(node.subkey_list_offset)?;
        }

        let new_list = if hashed.is_empty() {
            NO_CELL
        } else if hashed.len() <= LEAF_FANOUT {
            let payload = build_hash_leaf(&hashed)?;
            self.alloc_and_write(&payload, CellClass::List)?
        } else {
            let mut leaves = Vec::new();
            for chunk in hashed.chunks(LEAF_FANOUT) {
                let payload = build_hash_leaf(chunk)?;
                leaves.push(self.alloc_and_write(&payload, CellClass::List)?);
            }
            let payload = build_index_root(&leaves)?;
            self.alloc_and_write(&payload, CellClass::List)?
        };

        self.patch_cell_u32(parent, NK_SUBKEY_LIST, new_list)?;
        self.patch_cell_u32(parent, NK_SUBKEY_COUNT, hashed.len() as u32)?;
        self.touch_key(parent)
    }

    /// Collects every key-node offset under a list structure.
    fn collect_leaf_children(&self, list_cell: u32, out: &mut Vec<u32>) -> Result<()> {
        match self.parse_list(list_cell)? {
            SubkeyList::IndexRoot(subs) => {
                for sub in subs {
                    self.collect_leaf_children(sub, out)?;
                }
                Ok(())
            }
            leaf => {
                out.extend(leaf.offsets_iter());
                Ok(())
            }
        }
    }

    /// Frees a list structure: leaves first, then the index root.
    fn free_list_tree(&mut self, list_cell: u32) -> Result<()> {
        if let SubkeyList::IndexRoot(subs) = self.parse_list(list_cell)? {
            for sub in subs {
                self.free_list_tree(sub)?;
            }
        }
        self.alloc.free(&mut self.arena, &mut self.dirty, list_cell)
    }

    /// Reads a leaf's entries as `(offset, lh hash)` pairs, recomputing the
    /// hashes when the leaf is an li/lf carrying other hint kinds.
    fn leaf_entries_hashed(&self, leaf_cell: u32) -> Result<Vec<(u32, u32)>> {
        let payload = cell_payload(self.arena.bytes(), leaf_cell)?;
        let is_lh = payload.len() >= 2 && &payload[0..2] == b"lh";

        match self.parse_list(leaf_cell)? {
            SubkeyList::LeafWithHints(list_entries) if is_lh => {
                Ok(list_entries.iter().map(|e| (e.key_offset, e.name_hint)).collect())
            }
            SubkeyList::IndexRoot(_) => Err(RegistryError::corrupt(format!(
                "Expected a leaf at {:#x}, found an index root",
                leaf_cell
            ))),
            leaf => {
                let mut entries = Vec::with_capacity(leaf.len());
                for off in leaf.offsets_iter() {
                    let name = self.read_key(off)?.name;
                    entries.push((off, lh_hash(&name)));
                }
                Ok(entries)
            }
        }
    }

    fn leaf_last_name(&self, list_cell: u32) -> Result<Option<String>> {
        match self.parse_list(list_cell)? {
            SubkeyList::IndexRoot(subs) => match subs.last() {
                Some(&last) => self.leaf_last_name(last),
                None => Ok(None),
            },
            leaf => match leaf.offsets_iter().last() {
                Some(off) => Ok(Some(self.read_key(off)?.name)),
                None => Ok(None),
            },
        }
    }

    fn parse_list(&self, list_cell: u32) -> Result<SubkeyList> {
        SubkeyList::parse(cell_payload(self.arena.bytes(), list_cell)?, list_cell)
    }

    // ---- security descriptors -----------------------------------------

    fn sk_addref(&mut self, sk: u32) -> Result<()> {
        let payload = cell_payload(self.arena.bytes(), sk)?;
        let count = read_u32_le(payload, SK_REFCOUNT)?;
        self.patch_cell_u32(sk, SK_REFCOUNT, count + 1)
    }

    fn sk_release(&mut self, sk: u32) -> Result<()> {
        let parsed = SecurityKey::parse(cell_payload(self.arena.bytes(), sk)?, sk)?;
        if parsed.reference_count > 1 {
            return self.patch_cell_u32(sk, SK_REFCOUNT, parsed.reference_count - 1);
        }

        // Last reference: unlink from the flink/blink ring, then free.
        if parsed.flink != NO_CELL && parsed.flink != sk {
            self.patch_cell_u32(parsed.flink, SK_BLINK, parsed.blink)?;
            self.patch_cell_u32(parsed.blink, SK_FLINK, parsed.flink)?;
        }
        self.alloc.free(&mut self.arena, &mut self.dirty, sk)
    }

    // ---- values --------------------------------------------------------

    /// Adds or updates a value under `key`.
    pub(crate) fn set_value(
        &mut self,
        key: u32,
        name: &str,
        data_type: ValueType,
        data: &[u8],
    ) -> Result<()> {
        let node = self.read_key(key)?;
        let refs = self.read_value_refs(&node)?;

        let mut existing = None;
        for (i, &vk_cell) in refs.iter().enumerate() {
            if name_eq(&self.read_value_key(vk_cell)?.name, name) {
                existing = Some((i, vk_cell));
                break;
            }
        }

        match existing {
            Some((idx, vk_cell)) => {
                self.update_value(node.value_list_offset, idx, vk_cell, name, data_type, data)?
            }
            None => self.append_value(key, &node, refs, name, data_type, data)?,
        }

        self.update_value_maxlens(key, &node, name, data.len() as u32)?;
        self.touch_key(key)
    }

    /// Deletes a value under `key`. A missing value is success.
    pub(crate) fn delete_value(&mut self, key: u32, name: &str) -> Result<()> {
        let node = self.read_key(key)?;
        let refs = self.read_value_refs(&node)?;

        let mut found = None;
        for (i, &vk_cell) in refs.iter().enumerate() {
            if name_eq(&self.read_value_key(vk_cell)?.name, name) {
                found = Some((i, vk_cell));
                break;
            }
        }
        let Some((idx, vk_cell)) = found else {
            return Ok(());
        };

        self.free_value(vk_cell)?;

        let mut new_refs = refs;
        new_refs.remove(idx);

        if new_refs.is_empty() {
            self.alloc
                .free(&mut self.arena, &mut self.dirty, node.value_list_offset)?;
            self.patch_cell_u32(key, NK_VALUE_LIST, NO_CELL)?;
            self.patch_cell_u32(key, NK_VALUE_COUNT, 0)?;
        } else {
            let list_cell =
                self.write_value_list(Some(node.value_list_offset), &new_refs)?;
            self.patch_cell_u32(key, NK_VALUE_LIST, list_cell)?;
            self.patch_cell_u32(key, NK_VALUE_COUNT, new_refs.len() as u32)?;
        }
        self.touch_key(key)
    }

    fn append_value(
        &mut self,
        key: u32,
        node: &KeyNode,
        refs: Vec<u32>,
        name: &str,
        data_type: ValueType,
        data: &[u8],
    ) -> Result<()> {
        let data_field = self.write_value_data(data)?;
        let payload = ValueKey::build(name, data_type, data.len() as u32, data_field)?;
        let vk_cell = self.alloc_and_write(&payload, CellClass::Value)?;

        let mut new_refs = refs;
        new_refs.push(vk_cell);

        let old_list = (node.value_list_offset != NO_CELL && node.value_count > 0)
            .then_some(node.value_list_offset);
        let list_cell = self.write_value_list(old_list, &new_refs)?;

        self.patch_cell_u32(key, NK_VALUE_LIST, list_cell)?;
        self.patch_cell_u32(key, NK_VALUE_COUNT, new_refs.len() as u32)
    }

    fn update_value(
        &mut self,
        value_list: u32,
        idx: usize,
        vk_cell: u32,
        name: &str,
        data_type: ValueType,
        data: &[u8],
    ) -> Result<()> {
        let old_vk = self.read_value_key(vk_cell)?;
        let data_field = self.replace_value_data(&old_vk, data)?;

        let new_len = data.len() as u32;
        let length_field = if data.len() <= 4 {
            new_len | VALUE_DATA_INLINE
        } else {
            new_len
        };

        let needed = align8(CELL_HEADER_SIZE + crate::value::VALUE_KEY_MIN_SIZE + old_vk.name_length as usize);
        let old_total = cell_total_size(self.arena.bytes(), vk_cell)?;
        if self.strategy.permits_reuse(old_total, needed) {
            // Same name, so the record shape is unchanged; patch in place.
            self.patch_cell_u32(vk_cell, crate::value::VK_DATA_LENGTH, length_field)?;
            self.patch_cell_u32(vk_cell, crate::value::VK_DATA_OFFSET, data_field)?;
            self.patch_cell_u32(vk_cell, crate::value::VK_TYPE, data_type.code())?;
        } else {
            let payload = ValueKey::build(name, data_type, new_len, data_field)?;
            let new_vk = self.alloc_and_write(&payload, CellClass::Value)?;
            self.alloc.free(&mut self.arena, &mut self.dirty, vk_cell)?;
            self.patch_value_list_entry(value_list, idx, new_vk)?;
        }
        Ok(())
    }

    /// Frees or reuses the old data storage of a value and writes the new
    /// payload, returning the new vk data-offset field.
    fn replace_value_data(&mut self, old_vk: &ValueKey, data: &[u8]) -> Result<u32> {
        let old_small = !old_vk.inline
            && old_vk.data_length > 0
            && old_vk.data_length <= MAX_DIRECT_DATA_SIZE
            && old_vk.data_offset != NO_CELL;
        let old_big = !old_vk.inline && old_vk.data_length > MAX_DIRECT_DATA_SIZE;

        if data.len() <= 4 {
            if old_small {
                self.alloc
                    .free(&mut self.arena, &mut self.dirty, old_vk.data_offset)?;
            } else if old_big {
                free_big_data(&mut self.alloc, &mut self.arena, &mut self.dirty, old_vk.data_offset)?;
            }
            return Ok(pack_inline(data));
        }

        if data.len() <= MAX_DIRECT_DATA_SIZE as usize {
            if old_small {
                let old_total = cell_total_size(self.arena.bytes(), old_vk.data_offset)?;
                let needed = align8(CELL_HEADER_SIZE + data.len());
                if old_total >= CELL_HEADER_SIZE + data.len()
                    && self.strategy.permits_reuse(old_total, needed)
                {
                    let payload = cell_payload_mut(self.arena.bytes_mut(), old_vk.data_offset)?;
                    payload[..data.len()].copy_from_slice(data);
                    let abs = old_vk.data_offset as usize + HBIN_START_OFFSET as usize;
                    self.dirty.add(abs, CELL_HEADER_SIZE + data.len());
                    return Ok(old_vk.data_offset);
                }
                // Fresh-then-free keeps the old cell out of this allocation.
                let new_cell = self.alloc_and_write(data, CellClass::Raw)?;
                self.alloc
                    .free(&mut self.arena, &mut self.dirty, old_vk.data_offset)?;
                return Ok(new_cell);
            }
            if old_big {
                free_big_data(&mut self.alloc, &mut self.arena, &mut self.dirty, old_vk.data_offset)?;
            }
            return self.alloc_and_write(data, CellClass::Raw);
        }

        // New payload goes through the big data store; free the old
        // resource first so the same batch can reuse its cells.
        if old_small {
            self.alloc
                .free(&mut self.arena, &mut self.dirty, old_vk.data_offset)?;
        } else if old_big {
            free_big_data(&mut self.alloc, &mut self.arena, &mut self.dirty, old_vk.data_offset)?;
        }
        write_big_data(&mut self.alloc, &mut self.arena, &mut self.dirty, data)
    }

    fn write_value_data(&mut self, data: &[u8]) -> Result<u32> {
        if data.len() <= 4 {
            return Ok(pack_inline(data));
        }
        if data.len() <= MAX_DIRECT_DATA_SIZE as usize {
            return self.alloc_and_write(data, CellClass::Raw);
        }
        write_big_data(&mut self.alloc, &mut self.arena, &mut self.dirty, data)
    }

    fn free_value(&mut self, vk_cell: u32) -> Result<()> {
        let vk = self.read_value_key(vk_cell)?;
        if !vk.inline && vk.data_length > 0 && vk.data_offset != NO_CELL {
            if vk.data_length > MAX_DIRECT_DATA_SIZE {
                free_big_data(&mut self.alloc, &mut self.arena, &mut self.dirty, vk.data_offset)?;
            } else {
                self.alloc
                    .free(&mut self.arena, &mut self.dirty, vk.data_offset)?;
            }
        }
        self.alloc.free(&mut self.arena, &mut self.dirty, vk_cell)
    }

    pub(crate) fn read_value_refs(&self, node: &KeyNode) -> Result<Vec<u32>> {
        if node.value_count == 0 || node.value_list_offset == NO_CELL {
            return Ok(Vec::new());
        }
        let list = cell_payload(self.arena.bytes(), node.value_list_offset)?;
        let count = node.value_count as usize;
        if list.len() < count * 4 {
            return Err(RegistryError::TruncatedData {
                offset: node.value_list_offset,
                expected: count * 4,
                actual: list.len(),
            });
        }
        (0..count).map(|i| read_u32_le(list, i * 4)).collect()
    }

    pub(crate) fn read_value_key(&self, cell: u32) -> Result<ValueKey> {
        ValueKey::parse(cell_payload(self.arena.bytes(), cell)?, cell)
    }

    fn write_value_list(&mut self, old: Option<u32>, refs: &[u32]) -> Result<u32> {
        let mut payload = Vec::with_capacity(refs.len() * 4);
        for &r in refs {
            payload.extend_from_slice(&r.to_le_bytes());
        }
        match old {
            Some(cell) => self.rewrite_cell(cell, &payload, CellClass::List),
            None => self.alloc_and_write(&payload, CellClass::List),
        }
    }

    fn patch_value_list_entry(&mut self, list_cell: u32, idx: usize, vk: u32) -> Result<()> {
        let abs = list_cell as usize + HBIN_START_OFFSET as usize + CELL_HEADER_SIZE + idx * 4;
        write_u32_le(self.arena.bytes_mut(), abs, vk)?;
        self.dirty.add(abs, 4);
        Ok(())
    }

    fn update_value_maxlens(&mut self, key: u32, node: &KeyNode, name: &str, data_len: u32) -> Result<()> {
        let name_len = (name.encode_utf16().count() * 2) as u32;
        if name_len > node.max_value_name_len {
            self.patch_cell_u32(key, NK_MAX_VALUE_NAME_LEN, name_len)?;
        }
        if data_len > node.max_value_data_len {
            self.patch_cell_u32(key, NK_MAX_VALUE_DATA_LEN, data_len)?;
        }
        Ok(())
    }

    // ---- low-level helpers --------------------------------------------

    /// Allocates a cell for `payload` and copies it in.
    fn alloc_and_write(&mut self, payload: &[u8], class: CellClass) -> Result<u32> {
        let cell = self.alloc.alloc(
            &mut self.arena,
            &mut self.dirty,
            CELL_HEADER_SIZE + payload.len(),
            class,
        )?;
        cell_payload_mut(self.arena.bytes_mut(), cell)?[..payload.len()].copy_from_slice(payload);
        Ok(cell)
    }

    /// Rewrites a cell's payload in place when the cell fits and the
    /// strategy permits reuse; otherwise allocates fresh and frees the old
    /// cell. Returns the surviving cell offset.
    fn rewrite_cell(&mut self, old_cell: u32, payload: &[u8], class: CellClass) -> Result<u32> {
        let old_total = cell_total_size(self.arena.bytes(), old_cell)?;
        let needed = align8(CELL_HEADER_SIZE + payload.len());
        if old_total >= CELL_HEADER_SIZE + payload.len()
            && self.strategy.permits_reuse(old_total, needed)
        {
            let p = cell_payload_mut(self.arena.bytes_mut(), old_cell)?;
            p[..payload.len()].copy_from_slice(payload);
            let abs = old_cell as usize + HBIN_START_OFFSET as usize;
            self.dirty.add(abs, CELL_HEADER_SIZE + payload.len());
            Ok(old_cell)
        } else {
            let new_cell = self.alloc_and_write(payload, class)?;
            self.alloc.free(&mut self.arena, &mut self.dirty, old_cell)?;
            Ok(new_cell)
        }
    }

    fn patch_cell_u32(&mut self, cell: u32, field: usize, value: u32) -> Result<()> {
        let abs = cell as usize + HBIN_START_OFFSET as usize + CELL_HEADER_SIZE + field;
        write_u32_le(self.arena.bytes_mut(), abs, value)?;
        self.dirty.add(abs, 4);
        Ok(())
    }

    fn touch_key(&mut self, cell: u32) -> Result<()> {
        let abs = cell as usize + HBIN_START_OFFSET as usize + CELL_HEADER_SIZE + NK_TIMESTAMP;
        write_u64_le(self.arena.bytes_mut(), abs, filetime_now())?;
        self.dirty.add(abs, 8);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::NK_SECURITY;
    use crate::session::{Op, Session};

    fn session(dir: &tempfile::TempDir) -> Session {
        Session::create(dir.path().join("edit.hive")).unwrap()
    }

    /// Gives the root key a security descriptor so created children
    /// exercise the refcount chain.
    fn attach_root_sk(session: &mut Session) -> u32 {
        let root = session.root_offset();
        let payload = SecurityKey::build(&[0xA1; 24], 0).unwrap();
        let sk = session.alloc_and_write(&payload, CellClass::Security).unwrap();
        // A lone sk points at itself
        session.patch_cell_u32(sk, SK_FLINK, sk).unwrap();
        session.patch_cell_u32(sk, SK_BLINK, sk).unwrap();
        session.patch_cell_u32(root, NK_SECURITY, sk).unwrap();
        sk
    }

    fn sk_refcount(session: &Session, sk: u32) -> u32 {
        SecurityKey::parse(cell_payload(session.arena.bytes(), sk).unwrap(), sk)
            .unwrap()
            .reference_count
    }

    #[test]
    fn test_children_share_parent_security() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = session(&dir);
        let sk = attach_root_sk(&mut session);
        assert_eq!(sk_refcount(&session, sk), 1);

        let path: Vec<String> = vec!["A".into(), "B".into(), "C".into()];
        let leaf = session.ensure_key(&path).unwrap();
        assert_eq!(session.read_key(leaf).unwrap().security_offset, sk);
        // Root + three descendants
        assert_eq!(sk_refcount(&session, sk), 4);

        session.delete_key(&path[..1]).unwrap();
        assert_eq!(sk_refcount(&session, sk), 1);
    }

    #[test]
    fn test_last_sk_reference_frees_cell() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = session(&dir);
        let sk = attach_root_sk(&mut session);

        session.sk_addref(sk).unwrap();
        assert_eq!(sk_refcount(&session, sk), 2);

        session.sk_release(sk).unwrap();
        assert_eq!(sk_refcount(&session, sk), 1);

        session.sk_release(sk).unwrap();
        // Cell is free now
        assert!(cell_payload(session.arena.bytes(), sk).is_err());
    }

    #[test]
    fn test_deferred_create_then_delete_in_one_plan() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = session(&dir);
        session.enable_deferred_subkeys();

        session
            .apply_with_tx(vec![
                Op::EnsureKey {
                    path: vec!["A".into(), "B".into()],
                },
                Op::DeleteKey {
                    path: vec!["A".into(), "B".into()],
                },
            ])
            .unwrap();

        let root = session.root_offset();
        let a = session.lookup_child(root, "A").unwrap().expect("A survives");
        let node = session.read_key(a).unwrap();
        assert_eq!(node.subkey_count, 0);
        assert_eq!(node.subkey_list_offset, NO_CELL);
        session.close().unwrap();
    }

    #[test]
    fn test_deferred_lookup_sees_pending_children() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = session(&dir);
        session.enable_deferred_subkeys();

        // Both ops resolve "A" to the same pending key rather than
        // creating a duplicate.
        session
            .apply_with_tx(vec![
                Op::SetValue {
                    path: vec!["A".into()],
                    name: "x".into(),
                    data_type: ValueType::Dword,
                    data: 1u32.to_le_bytes().to_vec(),
                },
                Op::SetValue {
                    path: vec!["A".into()],
                    name: "y".into(),
                    data_type: ValueType::Dword,
                    data: 2u32.to_le_bytes().to_vec(),
                },
            ])
            .unwrap();

        let root_node = session.read_key(session.root_offset()).unwrap();
        assert_eq!(root_node.subkey_count, 1);

        let a = session
            .lookup_child(session.root_offset(), "a")
            .unwrap()
            .expect("pending child visible");
        assert_eq!(session.read_key(a).unwrap().value_count, 2);
        session.close().unwrap();
    }

    #[test]
    fn test_value_list_compacts_on_delete() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = session(&dir);
        let root = session.root_offset();

        for (name, v) in [("one", 1u32), ("two", 2), ("three", 3)] {
            session
                .set_value(root, name, ValueType::Dword, &v.to_le_bytes())
                .unwrap();
        }
        session.delete_value(root, "TWO").unwrap();

        let node = session.read_key(root).unwrap();
        assert_eq!(node.value_count, 2);
        let refs = session.read_value_refs(&node).unwrap();
        let names: Vec<String> = refs
            .iter()
            .map(|&r| session.read_value_key(r).unwrap().name)
            .collect();
        assert_eq!(names, vec!["one", "three"]);

        // Deleting the rest drops the list cell entirely
        session.delete_value(root, "one").unwrap();
        session.delete_value(root, "three").unwrap();
        let node = session.read_key(root).unwrap();
        assert_eq!(node.value_count, 0);
        assert_eq!(node.value_list_offset, NO_CELL);
        session.close().unwrap();
    }

    #[test]
    fn test_max_value_lens_track_peaks() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = session(&dir);
        let root = session.root_offset();

        session
            .set_value(root, "LongValueName", ValueType::Binary, &[0u8; 300])
            .unwrap();
        let node = session.read_key(root).unwrap();
        assert_eq!(node.max_value_name_len, 13 * 2);
        assert_eq!(node.max_value_data_len, 300);

        // Smaller follow-ups never shrink the maxima
        session.set_value(root, "x", ValueType::Dword, &[1, 0, 0, 0]).unwrap();
        let node = session.read_key(root).unwrap();
        assert_eq!(node.max_value_name_len, 26);
        assert_eq!(node.max_value_data_len, 300);
        session.close().unwrap();
    }
}
