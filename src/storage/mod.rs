//! Storage layer implementation
//!
//! Provides the page-level services the index is built on: slotted pages,
//! a buffer pool with shared / exclusive / cleanup locks, a redo log and
//! the durable-mutation scope that ties them together.

pub mod checksum;
pub mod page;
pub mod wal;
pub mod buffer;
pub mod mutation;
pub mod relation;

use serde::{Deserialize, Serialize};

pub use buffer::{BufferPool, PageReadGuard, PageWriteGuard, PinnedPage};
pub use checksum::{Checksum, ChecksumError};
pub use mutation::PageMutation;
pub use page::{OffsetNumber, Page, FIRST_OFFSET};
pub use relation::IndexRelation;
pub use wal::{Lsn, Wal, WalRecord};

/// Block number within one fork of an index file
pub type BlockNumber = u32;

/// Sentinel for "no page"
pub const INVALID_BLOCK: BlockNumber = u32::MAX;

/// Physical file ("fork") of an index.
///
/// `Main` holds the live index; `Init` holds the empty image an unlogged
/// index is reset to after a crash. Mutations of the `Init` fork are not
/// logged page by page; whoever writes it must log the finished pages
/// explicitly (see `IndexRelation::log_new_page_range`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Fork {
    Main,
    Init,
}

impl Fork {
    pub fn file_name(&self) -> &'static str {
        match self {
            Fork::Main => "main.flat",
            Fork::Init => "init.flat",
        }
    }

    /// Whether per-mutation commits write WAL records for this fork
    pub fn is_logged(&self) -> bool {
        matches!(self, Fork::Main)
    }
}
