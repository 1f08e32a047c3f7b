//! Flat (brute-force) vector index access method
//!
//! ## Block layout
//! ```text
//! block 0   metapage     {magic, version, dimensions, config}
//! block 1   scan head    item 1 = {start_page, insert_page}
//! block 2.. entry pages  items = EntryTuple, linked by opaque.next
//! ```
//!
//! Every block ends with an 8-byte opaque area
//! `{next: u32, unused: u16, page_id: u16}`; `page_id` must be
//! `FLAT_PAGE_ID` on every page the index reads.

pub mod build;
pub mod cost;
pub mod handler;
pub mod head;
pub mod insert;
pub mod meta;
pub mod pages;
pub mod scan;
pub mod tuple;
pub mod vacuum;

pub use build::{build_phase_name, BuildPhase, BuildProgress, BuildResult};
pub use cost::{cost_estimate, CostEstimate, CostParams, IndexPath};
pub use handler::{AmCapabilities, FlatIndex, IndexDefinition, FLAT_CAPABILITIES};
pub use head::ScanHead;
pub use meta::MetaPageInfo;
pub use scan::{FlatScan, ScanResult, ScanState};
pub use tuple::EntryTuple;
pub use vacuum::{BulkDeleteStats, VacuumInfo};

use crate::storage::BlockNumber;

pub const FLAT_MAGIC_NUMBER: u32 = 0x2BCA_1387;
pub const FLAT_VERSION: u32 = 1;
/// Tag in the opaque area of every index page
pub const FLAT_PAGE_ID: u16 = 0xFFAC;

pub const METAPAGE_BLKNO: BlockNumber = 0;
pub const HEAD_BLKNO: BlockNumber = 1;

/// Number of support procedure slots
pub const FLAT_SUPPORT_PROCS: u16 = 5;
