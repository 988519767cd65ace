//! High-level hive builder.
//!
//! A thin façade over [`Session`]: typed `set_*` helpers translate paths
//! and values into plan ops, which are buffered and applied as a
//! transaction whenever the buffer reaches the auto-flush threshold or the
//! caller commits. For bulk loads, deferred subkey mode and page
//! preallocation keep both memory and file growth bounded.

use crate::cell::ValueType;
use crate::error::Result;
use crate::session::{ApplyStats, Op, Plan, Session};
use crate::strategy::Strategy;
use crate::utils::name_eq;
use crate::value::ValueData;
use std::path::Path;
use tracing::{debug, instrument};

/// Well-known hive root prefixes stripped from incoming paths when
/// [`BuilderConfig::strip_hive_prefix`] is set.
const HIVE_ROOT_PREFIXES: &[&str] = &[
    "HKEY_LOCAL_MACHINE",
    "HKLM",
    "HKEY_CURRENT_USER",
    "HKCU",
    "HKEY_USERS",
    "HKU",
    "HKEY_CLASSES_ROOT",
    "HKCR",
    "HKEY_CURRENT_CONFIG",
    "HKCC",
];

/// Builder tuning knobs.
#[derive(Debug, Clone)]
pub struct BuilderConfig {
    /// Apply the buffered plan once it reaches this many ops.
    pub auto_flush_threshold: usize,

    /// Strip `HKLM\`-style root prefixes from incoming paths.
    pub strip_hive_prefix: bool,

    /// Pages to preallocate at open, avoiding repeated growth during bulk
    /// builds.
    pub prealloc_pages: usize,

    /// Buffer subkey-list updates in memory and write them in bulk at each
    /// flush.
    pub deferred_subkeys: bool,

    /// Cell reuse strategy for the session.
    pub strategy: Strategy,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        BuilderConfig {
            auto_flush_threshold: 1000,
            strip_hive_prefix: true,
            prealloc_pages: 0,
            deferred_subkeys: false,
            strategy: Strategy::default(),
        }
    }
}

/// Buffered, transactional hive writer.
pub struct HiveBuilder {
    session: Session,
    pending: Plan,
    config: BuilderConfig,
    last_stats: ApplyStats,
}

impl HiveBuilder {
    /// Creates a fresh minimal hive at `path` with default configuration.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::create_with(path, BuilderConfig::default())
    }

    /// Creates a fresh minimal hive at `path`.
    #[instrument(skip(path, config), fields(path = %path.as_ref().display()))]
    pub fn create_with<P: AsRef<Path>>(path: P, config: BuilderConfig) -> Result<Self> {
        Self::with_session(Session::create(path)?, config)
    }

    /// Opens an existing hive at `path` with default configuration.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with(path, BuilderConfig::default())
    }

    /// Opens an existing hive at `path`.
    #[instrument(skip(path, config), fields(path = %path.as_ref().display()))]
    pub fn open_with<P: AsRef<Path>>(path: P, config: BuilderConfig) -> Result<Self> {
        Self::with_session(Session::open(path)?, config)
    }

    fn with_session(mut session: Session, config: BuilderConfig) -> Result<Self> {
        session.set_strategy(config.strategy);
        if config.deferred_subkeys {
            session.enable_deferred_subkeys();
        }
        if config.prealloc_pages > 0 {
            session.grow_by_pages(config.prealloc_pages)?;
        }
        Ok(HiveBuilder {
            session,
            pending: Plan::new(),
            config,
            last_stats: ApplyStats::default(),
        })
    }

    /// Ensures every segment of `path` exists.
    pub fn ensure_key(&mut self, path: &str) -> Result<()> {
        let path = self.parse_path(path);
        self.push(Op::EnsureKey { path })
    }

    /// Deletes the key at `path` and its subtree.
    pub fn delete_key(&mut self, path: &str) -> Result<()> {
        let path = self.parse_path(path);
        self.push(Op::DeleteKey { path })
    }

    /// Deletes a value; missing values are ignored.
    pub fn delete_value(&mut self, path: &str, name: &str) -> Result<()> {
        let path = self.parse_path(path);
        self.push(Op::DeleteValue {
            path,
            name: name.to_string(),
        })
    }

    /// Sets a typed value, encoding it per its registry type.
    pub fn set_value(&mut self, path: &str, name: &str, value: ValueData) -> Result<()> {
        let data_type = value.value_type();
        let data = value.encode();
        self.set_raw_value(path, name, data_type, data)
    }

    /// Sets a value from already-encoded bytes.
    pub fn set_raw_value(
        &mut self,
        path: &str,
        name: &str,
        data_type: ValueType,
        data: Vec<u8>,
    ) -> Result<()> {
        let path = self.parse_path(path);
        self.push(Op::SetValue {
            path,
            name: name.to_string(),
            data_type,
            data,
        })
    }

    /// Sets a `REG_SZ` value.
    pub fn set_string(&mut self, path: &str, name: &str, value: &str) -> Result<()> {
        self.set_value(path, name, ValueData::String(value.to_string()))
    }

    /// Sets a `REG_EXPAND_SZ` value.
    pub fn set_expand_string(&mut self, path: &str, name: &str, value: &str) -> Result<()> {
        self.set_value(path, name, ValueData::ExpandString(value.to_string()))
    }

    /// Sets a `REG_DWORD` value.
    pub fn set_dword(&mut self, path: &str, name: &str, value: u32) -> Result<()> {
        self.set_value(path, name, ValueData::Dword(value))
    }

    /// Sets a `REG_DWORD_BIG_ENDIAN` value.
    pub fn set_dword_be(&mut self, path: &str, name: &str, value: u32) -> Result<()> {
        self.set_value(path, name, ValueData::DwordBigEndian(value))
    }

    /// Sets a `REG_QWORD` value.
    pub fn set_qword(&mut self, path: &str, name: &str, value: u64) -> Result<()> {
        self.set_value(path, name, ValueData::Qword(value))
    }

    /// Sets a `REG_MULTI_SZ` value.
    pub fn set_multi_string(&mut self, path: &str, name: &str, values: &[&str]) -> Result<()> {
        self.set_value(
            path,
            name,
            ValueData::MultiString(values.iter().map(|s| s.to_string()).collect()),
        )
    }

    /// Sets a `REG_BINARY` value.
    pub fn set_binary(&mut self, path: &str, name: &str, data: Vec<u8>) -> Result<()> {
        self.set_value(path, name, ValueData::Binary(data))
    }

    /// Applies all buffered ops as one transaction.
    pub fn commit(&mut self) -> Result<()> {
        self.flush()
    }

    /// Stats from the most recent flushed transaction.
    pub fn last_stats(&self) -> ApplyStats {
        self.last_stats
    }

    /// Number of ops currently buffered.
    pub fn pending_ops(&self) -> usize {
        self.pending.len()
    }

    /// Commits any remaining ops and closes the underlying session.
    pub fn close(mut self) -> Result<()> {
        self.flush()?;
        self.session.close()
    }

    /// Abandons buffered ops and the session without committing.
    ///
    /// Transactions flushed earlier remain on disk.
    pub fn abandon(self) {
        self.session.close_without_commit();
    }

    fn push(&mut self, op: Op) -> Result<()> {
        self.pending.push(op);
        if self.pending.len() >= self.config.auto_flush_threshold {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let plan = std::mem::take(&mut self.pending);
        debug!(ops = plan.len(), "Flushing builder plan");
        self.last_stats = self.session.apply_with_tx(plan)?;
        Ok(())
    }

    fn parse_path(&self, path: &str) -> Vec<String> {
        let mut segments: Vec<String> = path
            .trim_matches('\\')
            .split('\\')
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
            .collect();

        if self.config.strip_hive_prefix {
            if let Some(first) = segments.first() {
                if HIVE_ROOT_PREFIXES.iter().any(|p| name_eq(p, first)) {
                    segments.remove(0);
                }
            }
        }
        segments
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builder(dir: &tempfile::TempDir) -> HiveBuilder {
        HiveBuilder::create(dir.path().join("builder.hive")).unwrap()
    }

    #[test]
    fn test_parse_path_strips_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let b = builder(&dir);

        assert_eq!(
            b.parse_path("HKEY_LOCAL_MACHINE\\Software\\MyApp"),
            vec!["Software".to_string(), "MyApp".to_string()]
        );
        assert_eq!(
            b.parse_path("hklm\\Software"),
            vec!["Software".to_string()]
        );
        assert_eq!(
            b.parse_path("\\Software\\MyApp\\"),
            vec!["Software".to_string(), "MyApp".to_string()]
        );
        assert_eq!(b.parse_path(""), Vec::<String>::new());
    }

    #[test]
    fn test_parse_path_keeps_prefix_when_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let config = BuilderConfig {
            strip_hive_prefix: false,
            ..BuilderConfig::default()
        };
        let b = HiveBuilder::create_with(dir.path().join("noprefix.hive"), config).unwrap();

        assert_eq!(
            b.parse_path("HKLM\\Software"),
            vec!["HKLM".to_string(), "Software".to_string()]
        );
    }

    #[test]
    fn test_auto_flush_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let config = BuilderConfig {
            auto_flush_threshold: 3,
            ..BuilderConfig::default()
        };
        let mut b = HiveBuilder::create_with(dir.path().join("flush.hive"), config).unwrap();

        b.ensure_key("A").unwrap();
        b.ensure_key("B").unwrap();
        assert_eq!(b.pending_ops(), 2);

        // Third op hits the threshold and flushes everything
        b.ensure_key("C").unwrap();
        assert_eq!(b.pending_ops(), 0);
        assert_eq!(b.last_stats().ops_applied, 3);

        b.close().unwrap();
    }
}
