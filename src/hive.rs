//! Read-only registry hive access with memory-mapped file support.
//!
//! This is the verification surface of the crate: after a session commits,
//! a `Hive` walks the emitted file through the same cell structures the
//! writer produced.

use crate::bigdata::{read_big_data, MAX_DIRECT_DATA_SIZE};
use crate::error::{RegistryError, Result};
use crate::hbin::HbinHeader;
use crate::header::{BaseBlock, BASE_BLOCK_SIZE};
use crate::key::KeyNode;
use crate::subkey_list::SubkeyList;
use crate::utils::{cell_offset_to_absolute, name_eq, NO_CELL};
use crate::value::{ValueData, ValueKey};
use memmap2::Mmap;
use std::collections::HashMap;
use std::fs::File;
use std::path::Path;
use std::sync::RwLock;
use tracing::{debug, info, instrument};

/// Read-only registry hive.
///
/// Provides access to a hive file using memory-mapped I/O for efficient,
/// zero-copy traversal.
///
/// # Caching
///
/// The hive maintains an internal cache of parsed key nodes to avoid
/// redundant parsing during traversal. The cache uses interior mutability
/// via `RwLock` to allow caching while keeping the API immutable.
pub struct Hive {
    /// Memory-mapped hive data.
    data: Mmap,

    /// Parsed base block header.
    base_block: BaseBlock,

    /// Cache of parsed key nodes (offset -> KeyNode).
    key_cache: RwLock<HashMap<u32, KeyNode>>,
}

impl Hive {
    /// Opens a registry hive file read-only.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened, is too small, or its
    /// header fails validation (signature, checksum, version). A torn file
    /// (sequence mismatch) still opens; check
    /// [`BaseBlock::is_consistent`] before trusting the contents.
    #[instrument(skip(path), fields(path = %path.as_ref().display()))]
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        info!("Opening registry hive");
        let file = File::open(&path)?;

        let metadata = file.metadata()?;
        let file_size = metadata.len() as usize;
        if file_size < BASE_BLOCK_SIZE {
            return Err(RegistryError::HiveTooSmall {
                size: file_size,
                minimum: BASE_BLOCK_SIZE,
            });
        }

        // SAFETY: read-only mapping of a file we never mutate through this
        // handle; all access is bounds-checked via read_cell().
        let mmap = unsafe { Mmap::map(&file)? };
        debug!(size = mmap.len(), "Memory mapped hive file");

        let base_block = BaseBlock::parse(&mmap)?;

        Ok(Self {
            data: mmap,
            base_block,
            key_cache: RwLock::new(HashMap::new()),
        })
    }

    /// Returns a reference to the base block header.
    pub fn base_block(&self) -> &BaseBlock {
        &self.base_block
    }

    /// Returns the root key of the hive.
    #[instrument(skip(self))]
    pub fn root_key(&self) -> Result<RegistryKey> {
        self.get_key(self.base_block.root_cell_offset)
    }

    /// Finds a key by a backslash-separated path below the root.
    ///
    /// Segment comparison is case-insensitive; an empty path returns the
    /// root itself.
    pub fn key_by_path(&self, path: &str) -> Result<RegistryKey> {
        let mut key = self.root_key()?;
        for segment in path.trim_matches('\\').split('\\') {
            if segment.is_empty() {
                continue;
            }
            key = key.subkey(segment)?;
        }
        Ok(key)
    }

    /// Gets a key node by its cell offset.
    ///
    /// # Caching
    ///
    /// This method uses an internal cache to avoid re-parsing the same key
    /// node multiple times during traversal.
    pub fn get_key(&self, offset: u32) -> Result<RegistryKey> {
        if let Some(key_node) = self
            .key_cache
            .read()
            .expect("key cache lock poisoned")
            .get(&offset)
        {
            return Ok(RegistryKey {
                hive: self,
                offset,
                key_node: key_node.clone(),
            });
        }

        let key_node = self.parse_key_node(offset)?;
        self.key_cache
            .write()
            .expect("key cache lock poisoned")
            .insert(offset, key_node.clone());

        Ok(RegistryKey {
            hive: self,
            offset,
            key_node,
        })
    }

    /// Parses a key node at the given offset.
    fn parse_key_node(&self, offset: u32) -> Result<KeyNode> {
        let cell_data = self.read_cell(offset)?;
        KeyNode::parse(cell_data, offset)
    }

    /// Reads a cell at the given offset.
    ///
    /// # Arguments
    ///
    /// * `offset` - Cell offset (relative to first hbin).
    ///
    /// # Returns
    ///
    /// Returns the cell data (excluding the size field).
    fn read_cell(&self, offset: u32) -> Result<&[u8]> {
        let abs_offset = cell_offset_to_absolute(offset)? as usize;
        let data = &self.data[..];

        if abs_offset >= data.len() {
            return Err(RegistryError::invalid_offset(offset, data.len()));
        }

        if abs_offset + 4 > data.len() {
            return Err(RegistryError::TruncatedData {
                offset,
                expected: 4,
                actual: data.len() - abs_offset,
            });
        }

        let size_bytes = &data[abs_offset..abs_offset + 4];
        let size = i32::from_le_bytes([size_bytes[0], size_bytes[1], size_bytes[2], size_bytes[3]]);

        let abs_size = size.unsigned_abs() as usize;

        if abs_size < 4 {
            return Err(RegistryError::invalid_cell_size(size, offset));
        }

        let data_start = abs_offset + 4;
        let data_end = abs_offset + abs_size;

        if data_end > data.len() {
            return Err(RegistryError::TruncatedData {
                offset,
                expected: abs_size,
                actual: data.len() - abs_offset,
            });
        }

        Ok(&data[data_start..data_end])
    }

    /// Parses a subkey list at the given offset.
    fn parse_subkey_list(&self, offset: u32) -> Result<SubkeyList> {
        let cell_data = self.read_cell(offset)?;
        SubkeyList::parse(cell_data, offset)
    }

    /// Parses a value key at the given offset.
    fn parse_value_key(&self, offset: u32) -> Result<ValueKey> {
        let cell_data = self.read_cell(offset)?;
        ValueKey::parse(cell_data, offset)
    }

    /// Reads value data at the given offset.
    ///
    /// Handles both regular values and big data blocks (values > 16 KiB).
    fn read_value_data(&self, offset: u32, length: u32) -> Result<Vec<u8>> {
        if length == 0 {
            return Ok(Vec::new());
        }

        if length > MAX_DIRECT_DATA_SIZE {
            return read_big_data(&self.data, offset, length);
        }

        let cell = self.read_cell(offset)?;
        if cell.len() < length as usize {
            return Err(RegistryError::TruncatedData {
                offset,
                expected: length as usize,
                actual: cell.len(),
            });
        }
        Ok(cell[..length as usize].to_vec())
    }

    /// Iterates over all hbins in the hive.
    pub fn hbins(&self) -> HbinIterator {
        HbinIterator {
            data: &self.data[BASE_BLOCK_SIZE..],
            offset: 0,
        }
    }
}

/// Iterator over hbins in a hive.
pub struct HbinIterator<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Iterator for HbinIterator<'a> {
    type Item = Result<HbinHeader>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.data.len() {
            return None;
        }

        let hbin_data = &self.data[self.offset..];
        let result = HbinHeader::parse(hbin_data, self.offset as u32);

        match result {
            Ok(ref header) => {
                self.offset += header.size as usize;
                Some(Ok(header.clone()))
            }
            Err(RegistryError::InvalidSignature { .. }) => {
                // Stop iteration when we hit invalid signatures (padding/EOF)
                None
            }
            Err(e) => Some(Err(e)),
        }
    }
}

/// A registry key with access to its hive.
pub struct RegistryKey<'a> {
    hive: &'a Hive,
    /// Cell offset of this key (relative to first hbin).
    pub offset: u32,
    key_node: KeyNode,
}

impl<'a> RegistryKey<'a> {
    fn key_node(&self) -> &KeyNode {
        &self.key_node
    }

    /// Returns the parsed key node record.
    pub fn node(&self) -> &KeyNode {
        &self.key_node
    }

    /// Returns the key name (empty for a nameless root).
    pub fn name(&self) -> &str {
        &self.key_node.name
    }

    /// Returns the number of subkeys.
    pub fn subkey_count(&self) -> u32 {
        self.key_node.subkey_count
    }

    /// Returns the number of values.
    pub fn value_count(&self) -> u32 {
        self.key_node.value_count
    }

    /// Returns the subkeys of this key.
    pub fn subkeys(&self) -> Result<Vec<RegistryKey<'a>>> {
        let key_node = self.key_node();

        if !key_node.has_subkeys() || key_node.subkey_list_offset == NO_CELL {
            return Ok(Vec::new());
        }

        let mut subkey_offsets = Vec::new();
        self.collect_subkey_offsets(key_node.subkey_list_offset, &mut subkey_offsets)?;

        let mut subkeys = Vec::new();
        for offset in subkey_offsets {
            subkeys.push(self.hive.get_key(offset)?);
        }

        Ok(subkeys)
    }

    /// Finds a direct subkey by case-insensitive name.
    pub fn subkey(&self, name: &str) -> Result<RegistryKey<'a>> {
        for candidate in self.subkeys()? {
            if name_eq(candidate.name(), name) {
                return Ok(candidate);
            }
        }
        Err(RegistryError::not_found("key", name))
    }

    /// Recursively collects subkey offsets from subkey lists.
    fn collect_subkey_offsets(&self, list_offset: u32, offsets: &mut Vec<u32>) -> Result<()> {
        if list_offset == NO_CELL || list_offset == 0 {
            return Ok(());
        }

        let subkey_list = self.hive.parse_subkey_list(list_offset)?;

        if subkey_list.is_index_root() {
            for offset in subkey_list.offsets_iter() {
                self.collect_subkey_offsets(offset, offsets)?;
            }
        } else {
            offsets.extend(subkey_list.offsets_iter());
        }

        Ok(())
    }

    /// Returns the values of this key.
    pub fn values(&self) -> Result<Vec<RegistryValue<'a>>> {
        let key_node = self.key_node();

        if !key_node.has_values()
            || key_node.value_list_offset == NO_CELL
            || key_node.value_list_offset == 0
        {
            return Ok(Vec::new());
        }

        // Value list is an array of offsets
        let list_data = self.hive.read_cell(key_node.value_list_offset)?;
        let value_count = key_node.value_count as usize;

        if list_data.len() < value_count * 4 {
            return Err(RegistryError::TruncatedData {
                offset: key_node.value_list_offset,
                expected: value_count * 4,
                actual: list_data.len(),
            });
        }

        let mut values = Vec::new();
        for i in 0..value_count {
            let offset_pos = i * 4;
            let offset = u32::from_le_bytes([
                list_data[offset_pos],
                list_data[offset_pos + 1],
                list_data[offset_pos + 2],
                list_data[offset_pos + 3],
            ]);

            let value_key = self.hive.parse_value_key(offset)?;
            values.push(RegistryValue {
                hive: self.hive,
                value_key,
            });
        }

        Ok(values)
    }

    /// Gets a specific value by case-insensitive name.
    pub fn value(&self, name: &str) -> Result<RegistryValue<'a>> {
        for value in self.values()? {
            if name_eq(&value.value_key.name, name) {
                return Ok(value);
            }
        }

        Err(RegistryError::not_found("value", name))
    }
}

/// A registry value.
pub struct RegistryValue<'a> {
    hive: &'a Hive,
    value_key: ValueKey,
}

impl<'a> RegistryValue<'a> {
    /// Returns the value name (empty for the default value).
    pub fn name(&self) -> &str {
        &self.value_key.name
    }

    /// Returns the parsed value key record.
    pub fn value_key(&self) -> &ValueKey {
        &self.value_key
    }

    /// Returns the value data type.
    pub fn data_type(&self) -> crate::cell::ValueType {
        self.value_key.data_type
    }

    /// Returns the parsed value data.
    pub fn data(&self) -> Result<ValueData> {
        let raw_data = self.raw_data()?;
        ValueData::parse(&raw_data, self.value_key.data_type, self.value_key.data_offset)
    }

    /// Returns the raw value data as bytes.
    pub fn raw_data(&self) -> Result<Vec<u8>> {
        if self.value_key.is_inline_data() {
            Ok(self.value_key.inline_data())
        } else if self.value_key.data_offset == NO_CELL || self.value_key.data_length == 0 {
            Ok(Vec::new())
        } else {
            self.hive
                .read_value_data(self.value_key.data_offset, self.value_key.data_length)
        }
    }
}
