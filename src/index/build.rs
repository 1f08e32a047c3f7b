//! Index build
//!
//! Strictly ordered:
//! 1. validate the column (fixed dimensions, indexable type)
//! 2. metapage
//! 3. scan head, both pointers unset
//! 4. stage every live non-null heap row in a `SpillQueue`
//! 5. drain the queue into a fresh entry chain
//! 6. point the scan head at the chain
//! 7. for an unlogged fork, log full images of every block written
//!
//! Interrupts are checked between tuples. Whatever was committed before an
//! interrupt or a row error stays on disk; the scan head is only set once
//! the chain is complete, so such an index is never usable.

use super::head::{create_scan_head, update_scan_head};
use super::meta::create_meta_page;
use super::pages::{append_page, init_register_page, OPAQUE_SIZE};
use super::tuple::EntryTuple;
use crate::config::FlatOptions;
use crate::host::{ColumnDesc, HeapRow, HeapSource, InterruptFlag};
use crate::sort::{SpillBuffer, SpillQueue};
use crate::storage::page::max_align;
use crate::storage::{Fork, IndexRelation, Page, INVALID_BLOCK};
use crate::vector::{OpClass, VectorType};
use crate::{Result, StorageError};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BuildResult {
    /// Live heap rows visited
    pub heap_tuples: u64,
    /// Entry tuples written
    pub index_tuples: u64,
}

/// Reported build phases
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildPhase {
    Initializing = 1,
    LoadingTuples = 2,
}

impl BuildPhase {
    pub fn from_number(phase: i64) -> Option<Self> {
        match phase {
            1 => Some(BuildPhase::Initializing),
            2 => Some(BuildPhase::LoadingTuples),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            BuildPhase::Initializing => "initializing",
            BuildPhase::LoadingTuples => "loading tuples",
        }
    }
}

/// Name of a build phase number, `None` for unknown phases
pub fn build_phase_name(phase: i64) -> Option<&'static str> {
    BuildPhase::from_number(phase).map(|p| p.name())
}

/// Progress counters a monitor may poll while a build runs
#[derive(Debug, Default)]
pub struct BuildProgress {
    phase: AtomicU8,
    tuples_total: AtomicU64,
    tuples_done: AtomicU64,
}

impl BuildProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> Option<BuildPhase> {
        BuildPhase::from_number(self.phase.load(Ordering::Relaxed) as i64)
    }

    /// Heap rows scanned so far
    pub fn tuples_total(&self) -> u64 {
        self.tuples_total.load(Ordering::Relaxed)
    }

    /// Entry tuples written so far
    pub fn tuples_done(&self) -> u64 {
        self.tuples_done.load(Ordering::Relaxed)
    }

    fn set_phase(&self, phase: BuildPhase) {
        self.phase.store(phase as u8, Ordering::Relaxed);
    }
}

/// Check that `column` can be indexed with `opclass`; returns its dimensions
pub fn validate_column(column: &ColumnDesc, opclass: &OpClass) -> Result<u16> {
    if column.vector_type == VectorType::VarBit {
        return Err(StorageError::Config("type not supported for flat index".into()));
    }
    if column.vector_type != opclass.input_type() {
        return Err(StorageError::Config(format!(
            "operator class \"{}\" does not accept data type {}",
            opclass.name(),
            column.vector_type.name()
        )));
    }
    if column.typmod < 0 {
        return Err(StorageError::Config(format!(
            "column \"{}\" does not have dimensions",
            column.name
        )));
    }
    let max = opclass.type_info().max_dimensions;
    if column.typmod as usize > max {
        return Err(StorageError::Config(format!(
            "column cannot have more than {} dimensions for flat index",
            max
        )));
    }
    Ok(column.typmod as u16)
}

/// Build the index into `fork`. `heap == None` builds the empty structure.
pub(crate) fn build_index(
    rel: &IndexRelation,
    heap: Option<&dyn HeapSource>,
    column: &ColumnDesc,
    opclass: &OpClass,
    options: &FlatOptions,
    fork: Fork,
    interrupt: &InterruptFlag,
    progress: &BuildProgress,
) -> Result<BuildResult> {
    let dimensions = validate_column(column, opclass)?;
    options.validate()?;

    progress.set_phase(BuildPhase::Initializing);
    create_meta_page(rel, fork, dimensions, options.check as u16)?;
    create_scan_head(rel, fork)?;

    let mut result = BuildResult::default();
    let mut queue = SpillQueue::new(rel.config().work_mem).with_spill_dir(rel.dir());

    progress.set_phase(BuildPhase::LoadingTuples);
    if let Some(heap) = heap {
        let mut stage = |row: HeapRow| -> Result<()> {
            result.heap_tuples += 1;
            progress.tuples_total.fetch_add(1, Ordering::Relaxed);

            let Some(value) = row.value else {
                return Ok(());
            };
            if value.vector_type() != column.vector_type
                || value.dims() != dimensions as usize
                || !value.is_well_formed()
            {
                return Err(StorageError::Config(format!(
                    "expected {} dimensions of type {}, not {} of type {} (row {})",
                    dimensions,
                    column.vector_type.name(),
                    value.dims(),
                    value.vector_type().name(),
                    row.locator
                )));
            }
            match opclass.prepare(value) {
                Some(value) => queue.push(EntryTuple::new(row.locator, value)),
                None => Ok(()),
            }
        };
        flat_bench!("scan heap", heap.scan_rows(&mut stage))?;
    }
    if queue.spilled_runs() > 0 {
        tracing::debug!(runs = queue.spilled_runs(), "build staging spilled to disk");
    }

    let (start_page, insert_page) = flat_bench!(
        "create entry pages",
        write_entry_pages(rel, queue, fork, interrupt, progress, &mut result)
    )?;
    update_scan_head(rel, fork, insert_page, INVALID_BLOCK, start_page)?;

    if !fork.is_logged() {
        rel.log_new_page_range(fork, 0, rel.nblocks(fork))?;
    }

    tracing::info!(
        ?fork,
        heap_tuples = result.heap_tuples,
        index_tuples = result.index_tuples,
        pages = rel.nblocks(fork),
        "flat index built"
    );
    Ok(result)
}

/// Pack staged tuples into a new chain; returns (first, last) block
fn write_entry_pages(
    rel: &IndexRelation,
    queue: SpillQueue<EntryTuple>,
    fork: Fork,
    interrupt: &InterruptFlag,
    progress: &BuildProgress,
    result: &mut BuildResult,
) -> Result<(u32, u32)> {
    let max_item = Page::max_item_size(rel.page_size(), OPAQUE_SIZE);
    let (mut mutation, mut slot) = init_register_page(rel, fork)?;
    let start_page = mutation.blkno(slot);

    for tuple in queue.drain()? {
        if interrupt.is_set() {
            mutation.commit()?;
            return Err(StorageError::Interrupted);
        }

        let bytes = tuple?.encode();
        if bytes.len() > max_item {
            return Err(StorageError::ResourceExhausted(format!(
                "index row size {} exceeds maximum {} for flat index",
                bytes.len(),
                max_item
            )));
        }

        if mutation.page(slot).free_space() < max_align(bytes.len()) {
            (mutation, slot) = append_page(rel, mutation, slot, fork)?;
        }
        if mutation.page_mut(slot).add_item(&bytes).is_none() {
            return Err(StorageError::ResourceExhausted(format!(
                "failed to add index item to block {}",
                mutation.blkno(slot)
            )));
        }

        result.index_tuples += 1;
        progress.tuples_done.fetch_add(1, Ordering::Relaxed);
    }

    let insert_page = mutation.blkno(slot);
    mutation.commit()?;
    Ok((start_page, insert_page))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IndexConfig;
    use crate::host::MemoryHeap;
    use crate::index::head::read_scan_head;
    use crate::index::meta::read_meta_page;
    use crate::index::pages::next_block;
    use crate::vector::Vector;

    fn relation(dir: &std::path::Path) -> IndexRelation {
        IndexRelation::open(dir, IndexConfig { page_size: 1024, ..IndexConfig::for_testing() }).unwrap()
    }

    fn l2() -> OpClass {
        OpClass::lookup("vector_l2_ops").unwrap()
    }

    fn count_chain(rel: &IndexRelation, fork: Fork) -> (usize, usize) {
        let head = read_scan_head(rel, fork).unwrap();
        let (mut pages, mut tuples) = (0, 0);
        let mut blkno = head.start_page;
        while blkno != INVALID_BLOCK {
            let page = rel.pool(fork).read_page(blkno).unwrap();
            pages += 1;
            tuples += page.max_offset() as usize;
            blkno = next_block(&page, blkno).unwrap();
        }
        (pages, tuples)
    }

    #[test]
    fn test_build_packs_chain() {
        let dir = tempfile::tempdir().unwrap();
        let rel = relation(dir.path());
        let heap = MemoryHeap::with_float_column(16);
        for i in 0..100 {
            heap.insert(Some(Vector::Float(vec![i as f32; 16])));
        }
        heap.insert(None);

        let progress = BuildProgress::new();
        let result = build_index(
            &rel,
            Some(&heap),
            heap.column(),
            &l2(),
            &FlatOptions::default(),
            Fork::Main,
            &InterruptFlag::new(),
            &progress,
        )
        .unwrap();

        assert_eq!(result, BuildResult { heap_tuples: 101, index_tuples: 100 });
        assert_eq!(progress.tuples_done(), 100);
        assert_eq!(progress.phase(), Some(BuildPhase::LoadingTuples));

        // 8 + 4 + 64 = 76 -> 80 aligned + 4 line pointer = 84 per tuple; (1024-24-8)/84 = 11
        let (pages, tuples) = count_chain(&rel, Fork::Main);
        assert_eq!(tuples, 100);
        assert_eq!(pages, 10);

        let head = read_scan_head(&rel, Fork::Main).unwrap();
        assert_eq!(head.start_page, 2);
        assert_eq!(head.insert_page, 11);
        assert_eq!(read_meta_page(&rel, Fork::Main).unwrap().dimensions, 16);
    }

    #[test]
    fn test_build_rejects_bad_columns() {
        let dir = tempfile::tempdir().unwrap();
        let rel = relation(dir.path());
        let run = |column: ColumnDesc| {
            build_index(
                &rel,
                None,
                &column,
                &l2(),
                &FlatOptions::default(),
                Fork::Main,
                &InterruptFlag::new(),
                &BuildProgress::new(),
            )
        };

        let err = run(ColumnDesc::new("v", VectorType::VarBit, 8)).unwrap_err();
        assert!(matches!(err, StorageError::Config(_)));
        assert!(matches!(run(ColumnDesc::new("v", VectorType::Float, -1)), Err(StorageError::Config(_))));
        assert!(matches!(run(ColumnDesc::new("v", VectorType::Float, 2001)), Err(StorageError::Config(_))));
        assert!(matches!(run(ColumnDesc::new("v", VectorType::Half, 3)), Err(StorageError::Config(_))));
        // 配置错误发生在写任何页之前
        assert_eq!(rel.nblocks(Fork::Main), 0);
    }

    #[test]
    fn test_row_error_aborts_build() {
        let dir = tempfile::tempdir().unwrap();
        let rel = relation(dir.path());
        let heap = MemoryHeap::with_float_column(2);
        heap.insert(Some(Vector::Float(vec![1.0, 2.0])));
        heap.insert(Some(Vector::Float(vec![1.0, 2.0, 3.0])));

        let err = build_index(
            &rel,
            Some(&heap),
            heap.column(),
            &l2(),
            &FlatOptions::default(),
            Fork::Main,
            &InterruptFlag::new(),
            &BuildProgress::new(),
        )
        .unwrap_err();
        assert!(matches!(err, StorageError::Config(_)));
        assert_eq!(read_scan_head(&rel, Fork::Main).unwrap().start_page, INVALID_BLOCK);
    }

    #[test]
    fn test_interrupt_stops_drain() {
        let dir = tempfile::tempdir().unwrap();
        let rel = relation(dir.path());
        let heap = MemoryHeap::with_float_column(2);
        heap.insert(Some(Vector::Float(vec![1.0, 2.0])));

        let interrupt = InterruptFlag::new();
        interrupt.interrupt();
        let err = build_index(
            &rel,
            Some(&heap),
            heap.column(),
            &l2(),
            &FlatOptions::default(),
            Fork::Main,
            &interrupt,
            &BuildProgress::new(),
        )
        .unwrap_err();
        assert!(matches!(err, StorageError::Interrupted));
    }

    #[test]
    fn test_build_empty_into_init_fork_is_logged() {
        let dir = tempfile::tempdir().unwrap();
        let rel = relation(dir.path());
        let column = ColumnDesc::new("v", VectorType::Float, 3);
        build_index(
            &rel,
            None,
            &column,
            &l2(),
            &FlatOptions::default(),
            Fork::Init,
            &InterruptFlag::new(),
            &BuildProgress::new(),
        )
        .unwrap();

        assert_eq!(rel.nblocks(Fork::Init), 3);
        assert_eq!(rel.nblocks(Fork::Main), 0);
        let images = rel
            .wal()
            .read_all()
            .unwrap()
            .into_iter()
            .filter(|(_, r)| matches!(r, crate::storage::WalRecord::PageImage { fork: Fork::Init, .. }))
            .count();
        assert_eq!(images, 3);
        assert_eq!(count_chain(&rel, Fork::Init), (1, 0));
    }

    #[test]
    fn test_phase_names() {
        assert_eq!(build_phase_name(1), Some("initializing"));
        assert_eq!(build_phase_name(2), Some("loading tuples"));
        assert_eq!(build_phase_name(3), None);
    }
}
