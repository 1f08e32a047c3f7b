//! k-NN scan
//!
//! ```text
//! NotStarted --first get_tuple--> Scanning --round with no candidates--> Exhausted
//!                 ^                   |
//!                 +----- rescan ------+
//! ```
//!
//! A round walks the whole entry chain once under short shared locks and
//! pushes `(distance, locator)` into an `ExternalSorter`. Results stream out
//! of the sorter in ascending distance. When a round is drained the scan
//! walks the chain again and ranks only records it has not returned yet
//! (rows inserted meanwhile); a round that finds none ends the scan.
//!
//! Memory: ranking spills past `work_mem`, but the set of returned locators
//! stays in memory, one 8-byte `RecordLocator` per row handed out plus hash
//! overhead.
//! A full drain of an index with N rows holds N locators until `rescan` or
//! `end_scan`; k-NN queries that stop after a LIMIT hold only k.

use super::head::read_scan_head;
use super::meta::read_meta_page;
use super::pages::next_block;
use super::tuple::EntryTuple;
use crate::host::{RecordLocator, ScanKey, Snapshot};
use crate::sort::{ExternalSorter, MergeDrain, SpillBuffer};
use crate::storage::{Fork, IndexRelation, FIRST_OFFSET, INVALID_BLOCK};
use crate::vector::{OpClass, Vector};
use crate::{Result, StorageError};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    NotStarted,
    Scanning,
    Exhausted,
}

/// One row returned by the scan
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScanResult {
    pub locator: RecordLocator,
    pub distance: f32,
    /// Distances are exact, never lossy
    pub recheck: bool,
}

/// Sort item: ascending distance, ties broken by locator
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct RankedEntry {
    distance: f32,
    locator: RecordLocator,
}

impl Ord for RankedEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.distance
            .total_cmp(&other.distance)
            .then_with(|| self.locator.cmp(&other.locator))
    }
}

impl PartialOrd for RankedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for RankedEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for RankedEntry {}

pub struct FlatScan<'a> {
    rel: &'a IndexRelation,
    opclass: &'a OpClass,
    snapshot: Snapshot,
    index_scans: &'a AtomicU64,
    keys: Vec<ScanKey>,
    order_bys: Vec<ScanKey>,
    state: ScanState,
    /// Prepared query; `None` ranks everything at distance 0
    query: Option<Vector>,
    drain: Option<MergeDrain<RankedEntry>>,
    /// Locators handed out since the last rescan; grows by one per row
    returned: HashSet<RecordLocator>,
    rounds: usize,
}

impl<'a> FlatScan<'a> {
    pub(crate) fn new(
        rel: &'a IndexRelation,
        opclass: &'a OpClass,
        snapshot: Snapshot,
        index_scans: &'a AtomicU64,
    ) -> Self {
        Self {
            rel,
            opclass,
            snapshot,
            index_scans,
            keys: Vec::new(),
            order_bys: Vec::new(),
            state: ScanState::NotStarted,
            query: None,
            drain: None,
            returned: HashSet::new(),
            rounds: 0,
        }
    }

    /// Install new scan keys and ORDER BY keys and start over
    pub fn rescan(&mut self, keys: &[ScanKey], order_bys: &[ScanKey]) {
        self.keys = keys.to_vec();
        self.order_bys = order_bys.to_vec();
        self.state = ScanState::NotStarted;
        self.query = None;
        self.drain = None;
        // 释放内存，而不只是清空
        self.returned = HashSet::new();
        self.rounds = 0;
    }

    pub fn state(&self) -> ScanState {
        self.state
    }

    /// Filter keys of the last rescan; the index does not evaluate them
    pub fn keys(&self) -> &[ScanKey] {
        &self.keys
    }

    /// Rows returned since the last rescan (size of the in-memory seen set)
    pub fn returned_count(&self) -> usize {
        self.returned.len()
    }

    /// Chain walks performed since the last rescan
    pub fn rounds(&self) -> usize {
        self.rounds
    }

    /// Next row in ascending distance, `None` once exhausted
    pub fn get_tuple(&mut self) -> Result<Option<ScanResult>> {
        loop {
            match self.state {
                ScanState::NotStarted => {
                    self.start()?;
                    self.state = ScanState::Scanning;
                    if !self.rank_round()? {
                        self.state = ScanState::Exhausted;
                    }
                }
                ScanState::Scanning => {
                    if let Some(drain) = self.drain.as_mut() {
                        if let Some(entry) = drain.next() {
                            let entry = entry?;
                            self.returned.insert(entry.locator);
                            return Ok(Some(ScanResult {
                                locator: entry.locator,
                                distance: entry.distance,
                                recheck: false,
                            }));
                        }
                    }
                    self.drain = None;
                    if !self.rank_round()? {
                        self.state = ScanState::Exhausted;
                    }
                }
                ScanState::Exhausted => return Ok(None),
            }
        }
    }

    /// Release the sorter and its spill files
    pub fn end_scan(self) {
        tracing::trace!(rounds = self.rounds, returned = self.returned.len(), "flat scan ended");
    }

    fn start(&mut self) -> Result<()> {
        self.index_scans.fetch_add(1, AtomicOrdering::Relaxed);

        let Some(order_by) = self.order_bys.first() else {
            return Err(StorageError::Usage("cannot scan flat index without order".into()));
        };
        if !self.snapshot.is_mvcc() {
            return Err(StorageError::Usage(
                "non-MVCC snapshots are not supported with flat".into(),
            ));
        }

        self.query = match &order_by.argument {
            None => None,
            Some(value) => {
                let meta = read_meta_page(self.rel, Fork::Main)?;
                if value.vector_type() != self.opclass.input_type()
                    || value.dims() != meta.dimensions as usize
                    || !value.is_well_formed()
                {
                    return Err(StorageError::Usage(format!(
                        "expected {} dimensions of type {}, not {} of type {}",
                        meta.dimensions,
                        self.opclass.input_type().name(),
                        value.dims(),
                        value.vector_type().name()
                    )));
                }
                Some(self.opclass.normalize(value.clone()))
            }
        };
        Ok(())
    }

    /// Walk the chain once and rank every record not returned yet.
    /// Returns whether anything was ranked.
    fn rank_round(&mut self) -> Result<bool> {
        self.rounds += 1;
        let distance = self.opclass.distance_fn();
        let mut sorter = ExternalSorter::new(self.rel.config().work_mem).with_spill_dir(self.rel.dir());

        let pool = self.rel.pool(Fork::Main);
        let mut blkno = read_scan_head(self.rel, Fork::Main)?.start_page;
        let mut batch = Vec::new();
        while blkno != INVALID_BLOCK {
            let next = {
                let page = pool.read_page(blkno)?;
                for offno in FIRST_OFFSET..=page.max_offset() {
                    let tuple = EntryTuple::decode(page.item(offno)?)?;
                    if self.returned.contains(&tuple.locator) {
                        continue;
                    }
                    let d = match &self.query {
                        Some(query) => distance(&tuple.vector, query)?,
                        None => 0.0,
                    };
                    batch.push(RankedEntry { distance: d, locator: tuple.locator });
                }
                next_block(&page, blkno)?
            };
            // 页锁已释放，再写入排序器（可能溢写到磁盘）
            for entry in batch.drain(..) {
                sorter.push(entry)?;
            }
            blkno = next;
        }

        let candidates = sorter.len();
        if sorter.spilled_runs() > 0 {
            tracing::debug!(candidates, runs = sorter.spilled_runs(), "scan ranking spilled to disk");
        }
        if candidates == 0 {
            return Ok(false);
        }
        self.drain = Some(flat_bench!("rank candidates", sorter.drain())?);
        Ok(true)
    }
}
