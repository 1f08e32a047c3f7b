//! K-way merge over sorted sources
//!
//! A min-heap holds the current head of every source; `next()` pops the
//! smallest item and refills from the source it came from. Memory use is one
//! item per source plus the reader buffers.

use super::run::RunReader;
use crate::{Result, StorageError};
use serde::de::DeserializeOwned;
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

/// One sorted input: a spilled run or the in-memory tail
pub(crate) enum Source<T> {
    Run(RunReader<T>),
    Memory(std::vec::IntoIter<T>),
}

impl<T: DeserializeOwned> Iterator for Source<T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            Source::Run(run) => run.next(),
            Source::Memory(items) => items.next().map(Ok),
        }
    }
}

struct HeapItem<T> {
    item: T,
    source_id: usize,
}

impl<T: Ord> PartialEq for HeapItem<T> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<T: Ord> Eq for HeapItem<T> {}

impl<T: Ord> PartialOrd for HeapItem<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T: Ord> Ord for HeapItem<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        // 相同的项按数据源编号出堆，输出确定
        self.item.cmp(&other.item).then(self.source_id.cmp(&other.source_id))
    }
}

/// Ascending merge of several sorted sources
pub struct MergeDrain<T> {
    heap: BinaryHeap<Reverse<HeapItem<T>>>,
    sources: Vec<Source<T>>,
    /// Read error from a refill, reported on the following `next()`
    pending_error: Option<StorageError>,
}

impl<T: Ord + DeserializeOwned> MergeDrain<T> {
    pub(crate) fn new(sources: Vec<Source<T>>) -> Result<Self> {
        let mut merge = Self {
            heap: BinaryHeap::with_capacity(sources.len()),
            sources,
            pending_error: None,
        };
        for source_id in 0..merge.sources.len() {
            merge.refill(source_id)?;
        }
        Ok(merge)
    }

    fn refill(&mut self, source_id: usize) -> Result<()> {
        if let Some(next) = self.sources[source_id].next() {
            self.heap.push(Reverse(HeapItem { item: next?, source_id }));
        }
        Ok(())
    }
}

impl<T: Ord + DeserializeOwned> Iterator for MergeDrain<T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(e) = self.pending_error.take() {
            self.heap.clear();
            return Some(Err(e));
        }
        let Reverse(HeapItem { item, source_id }) = self.heap.pop()?;
        if let Err(e) = self.refill(source_id) {
            self.pending_error = Some(e);
        }
        Some(Ok(item))
    }
}
