//! # Windows Registry Hive Writer
//!
//! A transactional writer (and verifying reader) for Windows registry hive
//! files, built on memory-mapped I/O.
//!
//! ## Features
//!
//! - **Transactional edits**: every applied plan commits atomically through
//!   the format's dual-sequence protocol
//! - **Cell allocator**: segregated free lists with splitting, coalescing,
//!   and in-place reuse over 4 KiB-aligned hive bins
//! - **Big data support**: values over 16 KiB are chunked through `db`
//!   blocks with all space reserved up front
//! - **Bulk builds in bounded memory**: deferred subkey lists plus
//!   auto-flushing keep resident memory constant while building
//!   arbitrarily large hives
//! - **Type-safe values**: strong typing for registry values and structures
//!
//! ## Architecture
//!
//! The writer is built on several layers:
//!
//! 1. **Arena**: growable read-write memory mapping of the hive file
//! 2. **Base Block (Header)**: hive metadata, sequence numbers, checksum
//! 3. **Hive Bins (hbin)**: 4KB-aligned blocks containing cells
//! 4. **Cell allocator**: size-classed free lists over the bins
//! 5. **Cells**: key nodes (nk), value keys (vk), security descriptors
//!    (sk), subkey lists (lf/lh/li/ri), big data blocks (db)
//! 6. **Session**: applies ordered edit plans under begin/commit
//! 7. **Builder**: buffered, typed façade for bulk construction
//!
//! ## Binary Layout
//!
//! Registry hives follow this structure:
//!
//! ```text
//! [Base Block - 4KB]
//!   - Signature: "regf"
//!   - Sequence numbers, version, timestamp, root offset
//!   - Checksum
//!
//! [Hive Bins - variable size, 4KB aligned]
//!   [Hbin Header - 32 bytes]
//!     - Signature: "hbin"
//!     - Offset, size
//!
//!   [Cells - variable size]
//!     [Cell Size - 4 bytes, negative if allocated]
//!     [Cell Data]
//!       - Key nodes (nk)
//!       - Value keys (vk)
//!       - Subkey lists (lf/lh/li/ri)
//!       - Security descriptors (sk)
//!       - Big data blocks (db)
//! ```
//!
//! ## Examples
//!
//! ### Building a hive
//!
//! ```no_run
//! use hive_writer::HiveBuilder;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut builder = HiveBuilder::create("settings.hive")?;
//! builder.set_string("Software\\MyApp", "Version", "1.0.0")?;
//! builder.set_dword("Software\\MyApp", "Timeout", 30)?;
//! builder.close()?;
//! # Ok(())
//! # }
//! ```
//!
//! ### Reading it back
//!
//! ```no_run
//! use hive_writer::{Hive, ValueData};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let hive = Hive::open("settings.hive")?;
//! let key = hive.key_by_path("Software\\MyApp")?;
//!
//! match key.value("Version")?.data()? {
//!     ValueData::String(s) => println!("Version = {}", s),
//!     other => println!("Unexpected: {:?}", other),
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod alloc;
pub mod arena;
pub mod bigdata;
pub mod builder;
pub mod cell;
pub mod dirty;
mod edit;
pub mod error;
pub mod hbin;
pub mod header;
pub mod hive;
pub mod key;
pub mod security;
pub mod session;
pub mod strategy;
pub mod subkey_list;
pub mod utils;
pub mod value;

// Re-export main types for convenience
pub use alloc::CellAllocator;
pub use arena::Arena;
pub use builder::{BuilderConfig, HiveBuilder};
pub use cell::{CellClass, CellType, KeyNodeFlags, ValueType};
pub use dirty::DirtyPages;
pub use error::{RegistryError, Result};
pub use hbin::HbinHeader;
pub use header::BaseBlock;
pub use hive::{HbinIterator, Hive, RegistryKey, RegistryValue};
pub use key::KeyNode;
pub use security::SecurityKey;
pub use session::{ApplyStats, Op, Plan, Session};
pub use strategy::Strategy;
pub use subkey_list::{SubkeyList, SubkeyListEntry, SubkeyListType};
pub use value::{ValueData, ValueKey};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
