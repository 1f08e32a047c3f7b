//! MoteFlat: 磁盘常驻的 flat（穷举）向量索引
//!
//! 每条记录的向量存放在按块链接的页中，查询时遍历整条链并按距离排序，
//! 结果精确，不需要训练或聚类。
//!
//! ## 架构
//! - 存储层: slotted page + 缓冲池（共享 / 排他 / cleanup 锁）+ 整页镜像 WAL
//! - 排序层: 可溢写到临时文件的外部排序（构建暂存 / 扫描排序）
//! - 向量层: vector / halfvec / bit 三种类型，9 个操作符类
//! - 索引层: metapage + scan head + entry 页链；build / insert / scan / vacuum
//!
//! ```ignore
//! let heap = MemoryHeap::with_float_column(3);
//! heap.insert(Some(Vector::Float(vec![1.0, 2.0, 3.0])));
//! let (index, _) = FlatIndex::build(dir, &heap, &IndexDefinition::default(),
//!                                   &InterruptFlag::new(), &BuildProgress::new())?;
//! let mut scan = index.begin_scan(Snapshot::Mvcc);
//! scan.rescan(&[], &[ScanKey::order_by(Vector::Float(vec![1.0, 1.0, 1.0]))]);
//! while let Some(row) = scan.get_tuple()? { /* nearest first */ }
//! ```

/// Time a phase when the `bench-timing` feature is on
#[cfg(feature = "bench-timing")]
macro_rules! flat_bench {
    ($name:expr, $code:expr) => {{
        let start = std::time::Instant::now();
        let result = $code;
        tracing::info!(phase = $name, elapsed_ms = start.elapsed().as_secs_f64() * 1000.0, "flat bench");
        result
    }};
}

#[cfg(not(feature = "bench-timing"))]
macro_rules! flat_bench {
    ($name:expr, $code:expr) => {
        $code
    };
}

pub mod config;
pub mod storage;
pub mod sort;
pub mod vector;
pub mod host;
pub mod index;

mod error;

pub use config::{DurabilityLevel, FlatOptions, FlatSettings, IndexConfig};
pub use error::{Result, StorageError};

// 主要对外 API
pub use host::{ColumnDesc, HeapRow, HeapSource, InterruptFlag, MemoryHeap, RecordLocator, ScanKey, Snapshot};
pub use index::{
    build_phase_name, AmCapabilities, BuildPhase, BuildProgress, BuildResult, BulkDeleteStats, CostEstimate,
    CostParams, FlatIndex, FlatScan, IndexDefinition, IndexPath, MetaPageInfo, ScanResult, ScanState, VacuumInfo,
};
pub use vector::{OpClass, Vector, VectorType};
