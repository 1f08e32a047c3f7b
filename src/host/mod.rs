//! Host-side collaborators
//!
//! The access method never owns table rows. It reads them through
//! `HeapSource`, reports results as `RecordLocator`s, checks
//! `InterruptFlag` at safe points and refuses scans whose `Snapshot` is not
//! a point-in-time view. `MemoryHeap` is a small in-process table used by
//! embedders and tests.

mod heap;

pub use heap::MemoryHeap;

use crate::vector::{Vector, VectorType};
use crate::{Result, StorageError};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Locator of a row in the source table (block, 1-based line)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordLocator {
    pub block: u32,
    pub offset: u16,
}

impl RecordLocator {
    /// Encoded size on an index page
    pub const ENCODED_LEN: usize = 6;

    pub fn new(block: u32, offset: u16) -> Self {
        Self { block, offset }
    }

    pub fn encode(&self) -> [u8; Self::ENCODED_LEN] {
        let mut out = [0u8; Self::ENCODED_LEN];
        out[..4].copy_from_slice(&self.block.to_le_bytes());
        out[4..].copy_from_slice(&self.offset.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::ENCODED_LEN {
            return Err(StorageError::Corruption(format!(
                "record locator needs {} bytes, got {}",
                Self::ENCODED_LEN,
                bytes.len()
            )));
        }
        Ok(Self {
            block: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            offset: u16::from_le_bytes([bytes[4], bytes[5]]),
        })
    }
}

impl std::fmt::Display for RecordLocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({},{})", self.block, self.offset)
    }
}

/// The indexed column
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDesc {
    pub name: String,
    pub vector_type: VectorType,
    /// Declared dimensions; negative when the column has none
    pub typmod: i32,
}

impl ColumnDesc {
    pub fn new(name: impl Into<String>, vector_type: VectorType, typmod: i32) -> Self {
        Self { name: name.into(), vector_type, typmod }
    }
}

/// One live row handed to the build callback
#[derive(Debug, Clone)]
pub struct HeapRow {
    pub locator: RecordLocator,
    /// `None` for SQL NULL
    pub value: Option<Vector>,
}

/// Source table the index is built over
pub trait HeapSource: Send + Sync {
    fn column(&self) -> &ColumnDesc;

    /// Feed every live row to `visit`, stopping at the first error
    fn scan_rows(&self, visit: &mut dyn FnMut(HeapRow) -> Result<()>) -> Result<()>;
}

/// Visibility rules a scan runs under
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Snapshot {
    Mvcc,
    HistoricMvcc,
    SelfVisible,
    Any,
    Dirty,
    NonVacuumable,
}

impl Snapshot {
    /// Point-in-time view; the only kind the flat scan supports
    pub fn is_mvcc(&self) -> bool {
        matches!(self, Snapshot::Mvcc | Snapshot::HistoricMvcc)
    }
}

/// Cooperative cancellation shared between the caller and long operations
#[derive(Debug, Clone, Default)]
pub struct InterruptFlag(Arc<AtomicBool>);

impl InterruptFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn interrupt(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// `Err(Interrupted)` if cancellation was requested
    pub fn check(&self) -> Result<()> {
        if self.is_set() {
            return Err(StorageError::Interrupted);
        }
        Ok(())
    }
}

/// An ORDER BY key: the query vector, or NULL
#[derive(Debug, Clone, PartialEq)]
pub struct ScanKey {
    pub argument: Option<Vector>,
}

impl ScanKey {
    pub fn order_by(query: Vector) -> Self {
        Self { argument: Some(query) }
    }

    pub fn null() -> Self {
        Self { argument: None }
    }

    pub fn is_null(&self) -> bool {
        self.argument.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_locator_encoding() {
        let loc = RecordLocator::new(70_000, 12);
        let bytes = loc.encode();
        assert_eq!(RecordLocator::decode(&bytes).unwrap(), loc);
        assert!(RecordLocator::decode(&bytes[..5]).is_err());
        assert_eq!(loc.to_string(), "(70000,12)");
    }

    #[test]
    fn test_interrupt_flag_is_shared() {
        let flag = InterruptFlag::new();
        let other = flag.clone();
        assert!(flag.check().is_ok());
        other.interrupt();
        assert!(matches!(flag.check(), Err(StorageError::Interrupted)));
        flag.clear();
        assert!(!other.is_set());
    }

    #[test]
    fn test_snapshot_kinds() {
        assert!(Snapshot::Mvcc.is_mvcc());
        assert!(Snapshot::HistoricMvcc.is_mvcc());
        assert!(!Snapshot::Dirty.is_mvcc());
        assert!(!Snapshot::Any.is_mvcc());
    }
}
