//! `FlatIndex`: the access-method surface the host calls
//!
//! The host owns the catalog: it tells `open` which column and operator
//! class the index was built with. Everything else (dimensions, `check`)
//! is read back from the metapage.

use super::build::{build_index, validate_column, BuildProgress, BuildResult};
use super::cost::{cost_estimate, CostEstimate, CostParams, IndexPath};
use super::insert::insert_tuple;
use super::meta::{get_meta_page_info, MetaPageInfo};
use super::scan::FlatScan;
use super::vacuum::{bulk_delete, vacuum_cleanup, BulkDeleteStats, VacuumInfo};
use super::FLAT_SUPPORT_PROCS;
use crate::config::{FlatOptions, FlatSettings, IndexConfig};
use crate::host::{ColumnDesc, HeapSource, InterruptFlag, RecordLocator, Snapshot};
use crate::storage::{Fork, IndexRelation};
use crate::vector::{OpClass, Vector};
use crate::{Result, StorageError};
use serde::Serialize;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

/// Static properties the planner and executor consult
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AmCapabilities {
    pub strategies: u16,
    pub support_procs: u16,
    pub can_order: bool,
    pub can_order_by_op: bool,
    pub can_backward: bool,
    pub can_unique: bool,
    pub can_multi_column: bool,
    pub optional_key: bool,
    pub search_array: bool,
    pub search_nulls: bool,
    pub can_parallel_build: bool,
    /// Bulk delete may run in a parallel vacuum worker
    pub parallel_bulk_delete: bool,
}

pub const FLAT_CAPABILITIES: AmCapabilities = AmCapabilities {
    strategies: 0,
    support_procs: FLAT_SUPPORT_PROCS,
    can_order: false,
    can_order_by_op: true,
    can_backward: false,
    can_unique: false,
    can_multi_column: false,
    optional_key: true,
    search_array: false,
    search_nulls: false,
    can_parallel_build: false,
    parallel_bulk_delete: true,
};

/// How an index is (or was) defined
#[derive(Debug, Clone, Default)]
pub struct IndexDefinition {
    /// Operator class name; `None` picks the default for the column type
    pub opclass: Option<String>,
    pub options: FlatOptions,
    pub settings: FlatSettings,
    pub storage: IndexConfig,
}

impl IndexDefinition {
    pub fn with_opclass(name: impl Into<String>) -> Self {
        Self { opclass: Some(name.into()), ..Default::default() }
    }

    fn resolve_opclass(&self, column: &ColumnDesc) -> Result<OpClass> {
        match &self.opclass {
            Some(name) => OpClass::lookup(name),
            None => OpClass::default_for(column.vector_type),
        }
    }
}

pub struct FlatIndex {
    rel: IndexRelation,
    column: ColumnDesc,
    opclass: OpClass,
    options: FlatOptions,
    settings: FlatSettings,
    /// Scans started on this handle
    index_scans: AtomicU64,
}

impl FlatIndex {
    /// Build a new index in `dir` over every live row of `heap`
    pub fn build(
        dir: impl AsRef<Path>,
        heap: &dyn HeapSource,
        definition: &IndexDefinition,
        interrupt: &InterruptFlag,
        progress: &BuildProgress,
    ) -> Result<(Self, BuildResult)> {
        let column = heap.column().clone();
        let opclass = definition.resolve_opclass(&column)?;
        validate_column(&column, &opclass)?;
        definition.options.validate()?;

        let rel = IndexRelation::open(dir, definition.storage.clone())?;
        if rel.nblocks(Fork::Main) != 0 {
            return Err(StorageError::Usage(format!(
                "flat index already exists in {}",
                rel.dir().display()
            )));
        }

        tracing::info!(
            dir = %rel.dir().display(),
            column = %column.name,
            opclass = opclass.name(),
            "building flat index"
        );
        let result = build_index(
            &rel,
            Some(heap),
            &column,
            &opclass,
            &definition.options,
            Fork::Main,
            interrupt,
            progress,
        )?;
        rel.flush_wal()?;

        let index = Self {
            rel,
            column,
            opclass,
            options: definition.options,
            settings: definition.settings,
            index_scans: AtomicU64::new(0),
        };
        Ok((index, result))
    }

    /// Open an existing index; replays the WAL and checks the metapage
    pub fn open(dir: impl AsRef<Path>, column: ColumnDesc, definition: &IndexDefinition) -> Result<Self> {
        let opclass = definition.resolve_opclass(&column)?;
        let dimensions = validate_column(&column, &opclass)?;

        let rel = IndexRelation::open(dir, definition.storage.clone())?;
        let meta = get_meta_page_info(&rel)?;
        if meta.dimensions != dimensions {
            return Err(StorageError::Config(format!(
                "column \"{}\" has {} dimensions but the index was built with {}",
                column.name, dimensions, meta.dimensions
            )));
        }

        Ok(Self {
            rel,
            column,
            opclass,
            options: FlatOptions { check: meta.config as i32 },
            settings: definition.settings,
            index_scans: AtomicU64::new(0),
        })
    }

    /// Write the empty index image into the init fork
    pub fn build_empty(&self) -> Result<()> {
        build_index(
            &self.rel,
            None,
            &self.column,
            &self.opclass,
            &self.options,
            Fork::Init,
            &InterruptFlag::new(),
            &BuildProgress::new(),
        )?;
        self.rel.flush_wal()
    }

    /// Index one row. `Ok(false)` when the value was skipped.
    pub fn insert(&self, value: Option<&Vector>, locator: RecordLocator) -> Result<bool> {
        insert_tuple(&self.rel, &self.opclass, value, locator)
    }

    /// Start a scan; call `rescan` with the ORDER BY key before fetching
    pub fn begin_scan(&self, snapshot: Snapshot) -> FlatScan<'_> {
        FlatScan::new(&self.rel, &self.opclass, snapshot, &self.index_scans)
    }

    pub fn bulk_delete(
        &self,
        stats: Option<BulkDeleteStats>,
        should_delete: &dyn Fn(RecordLocator) -> bool,
        interrupt: &InterruptFlag,
    ) -> Result<BulkDeleteStats> {
        bulk_delete(&self.rel, stats, should_delete, interrupt)
    }

    pub fn vacuum_cleanup(&self, info: VacuumInfo, stats: Option<BulkDeleteStats>) -> Option<BulkDeleteStats> {
        vacuum_cleanup(&self.rel, info, stats)
    }

    pub fn cost_estimate(&self, path: &IndexPath, params: &CostParams) -> CostEstimate {
        cost_estimate(path, &self.settings, params)
    }

    pub fn capabilities() -> AmCapabilities {
        FLAT_CAPABILITIES
    }

    /// Parse reloptions (`check=N`)
    pub fn validate_options<'a, I>(pairs: I, validate: bool) -> Result<FlatOptions>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        FlatOptions::parse(pairs, validate)
    }

    /// Operator class validation hook
    pub fn validate_opclass(name: &str) -> bool {
        OpClass::lookup(name).map(|opclass| opclass.validate()).unwrap_or(false)
    }

    pub fn meta_page_info(&self) -> Result<MetaPageInfo> {
        get_meta_page_info(&self.rel)
    }

    pub fn index_scans(&self) -> u64 {
        self.index_scans.load(Ordering::Relaxed)
    }

    /// Flush the WAL and every dirty page, then truncate the WAL
    pub fn checkpoint(&self) -> Result<()> {
        self.rel.checkpoint()
    }

    pub fn relation(&self) -> &IndexRelation {
        &self.rel
    }

    pub fn column(&self) -> &ColumnDesc {
        &self.column
    }

    pub fn opclass(&self) -> &OpClass {
        &self.opclass
    }

    pub fn options(&self) -> FlatOptions {
        self.options
    }

    pub fn settings(&self) -> FlatSettings {
        self.settings
    }
}
