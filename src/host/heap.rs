//! In-memory source table
//!
//! Values are kept in their encoded form, the way a host keeps stored
//! datums; `scan_rows` decodes them on the way out, so a damaged datum
//! surfaces as a materialization error during build.

use super::{ColumnDesc, HeapRow, HeapSource, RecordLocator};
use crate::vector::{Vector, VectorType};
use crate::Result;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashSet};

/// Rows per heap block when assigning locators
const ROWS_PER_BLOCK: u32 = 64;

#[derive(Default)]
struct HeapInner {
    rows: BTreeMap<RecordLocator, Option<Vec<u8>>>,
    dead: HashSet<RecordLocator>,
    next: u32,
}

pub struct MemoryHeap {
    column: ColumnDesc,
    inner: RwLock<HeapInner>,
}

impl MemoryHeap {
    pub fn new(column: ColumnDesc) -> Self {
        Self { column, inner: RwLock::new(HeapInner::default()) }
    }

    /// `vector(dims)` column named `embedding`
    pub fn with_float_column(dims: i32) -> Self {
        Self::new(ColumnDesc::new("embedding", VectorType::Float, dims))
    }

    /// Append a row; returns its locator
    pub fn insert(&self, value: Option<Vector>) -> RecordLocator {
        self.insert_raw(value.map(|v| v.encode()))
    }

    /// Append a row holding an already encoded datum
    pub fn insert_raw(&self, datum: Option<Vec<u8>>) -> RecordLocator {
        let mut inner = self.inner.write();
        let n = inner.next;
        inner.next += 1;
        let locator = RecordLocator::new(n / ROWS_PER_BLOCK, (n % ROWS_PER_BLOCK) as u16 + 1);
        inner.rows.insert(locator, datum);
        locator
    }

    /// Mark a row dead; it stays until `prune` but is no longer live
    pub fn delete(&self, locator: RecordLocator) -> bool {
        let mut inner = self.inner.write();
        inner.rows.contains_key(&locator) && inner.dead.insert(locator)
    }

    /// Vacuum predicate: the row was deleted
    pub fn is_dead(&self, locator: RecordLocator) -> bool {
        self.inner.read().dead.contains(&locator)
    }

    /// Forget dead rows once the index no longer references them
    pub fn prune(&self) -> usize {
        let mut inner = self.inner.write();
        let dead: Vec<RecordLocator> = inner.dead.drain().collect();
        for locator in &dead {
            inner.rows.remove(locator);
        }
        dead.len()
    }

    pub fn live_rows(&self) -> usize {
        let inner = self.inner.read();
        inner.rows.len() - inner.dead.len()
    }

    /// Decoded value of a live row
    pub fn fetch(&self, locator: RecordLocator) -> Result<Option<Vector>> {
        let inner = self.inner.read();
        if inner.dead.contains(&locator) {
            return Ok(None);
        }
        match inner.rows.get(&locator) {
            Some(Some(bytes)) => Ok(Some(Vector::decode(bytes)?)),
            _ => Ok(None),
        }
    }
}

impl HeapSource for MemoryHeap {
    fn column(&self) -> &ColumnDesc {
        &self.column
    }

    fn scan_rows(&self, visit: &mut dyn FnMut(HeapRow) -> Result<()>) -> Result<()> {
        // 先拷贝快照，回调期间不持有锁
        let rows: Vec<(RecordLocator, Option<Vec<u8>>)> = {
            let inner = self.inner.read();
            inner
                .rows
                .iter()
                .filter(|(loc, _)| !inner.dead.contains(*loc))
                .map(|(loc, datum)| (*loc, datum.clone()))
                .collect()
        };
        for (locator, datum) in rows {
            let value = match datum {
                Some(bytes) => Some(Vector::decode(&bytes)?),
                None => None,
            };
            visit(HeapRow { locator, value })?;
        }
        Ok(())
    }
}
