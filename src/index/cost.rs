//! Planner cost estimate
//!
//! A flat scan always reads every entry page and ranks every tuple, so the
//! generic index cost is simply all pages plus per-tuple CPU. The startup
//! cost (before the first row) is the `random_ratio` share of the total.

use crate::config::FlatSettings;
use serde::{Deserialize, Serialize};

/// Unit costs, same meaning as the host planner's GUCs
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CostParams {
    pub random_page_cost: f64,
    pub seq_page_cost: f64,
    pub cpu_index_tuple_cost: f64,
    pub cpu_operator_cost: f64,
}

impl Default for CostParams {
    fn default() -> Self {
        Self {
            random_page_cost: 4.0,
            seq_page_cost: 1.0,
            cpu_index_tuple_cost: 0.005,
            cpu_operator_cost: 0.0025,
        }
    }
}

/// What the planner knows about the candidate path
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct IndexPath {
    /// ORDER BY operators; 0 means the index cannot be used
    pub order_by_count: usize,
    pub index_tuples: f64,
    pub index_pages: f64,
    /// Pages of the indexed table
    pub heap_pages: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CostEstimate {
    pub startup_cost: f64,
    pub total_cost: f64,
    pub selectivity: f64,
    pub correlation: f64,
    pub pages: f64,
    /// Planner penalty nodes; 2 marks the path as unusable
    pub disabled_nodes: u32,
}

impl CostEstimate {
    fn disabled() -> Self {
        Self {
            startup_cost: f64::INFINITY,
            total_cost: f64::INFINITY,
            selectivity: 0.0,
            correlation: 0.0,
            pages: 0.0,
            disabled_nodes: 2,
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled_nodes > 0
    }
}

pub fn cost_estimate(path: &IndexPath, settings: &FlatSettings, params: &CostParams) -> CostEstimate {
    // 没有 ORDER BY 时不使用索引
    if path.order_by_count == 0 {
        return CostEstimate::disabled();
    }

    let pages = path.index_pages.max(1.0).ceil();
    let tuples = path.index_tuples.max(0.0);
    let per_tuple = params.cpu_index_tuple_cost + path.order_by_count as f64 * params.cpu_operator_cost;
    let total_cost = pages * params.random_page_cost + tuples * per_tuple;

    let ratio = (settings.random_ratio as f64 / 100.0).min(1.0);
    let mut startup_cost = total_cost * ratio;

    // TOAST pages are not part of a sequential heap scan's cost
    let startup_pages = pages * ratio;
    if startup_pages > path.heap_pages && ratio < 0.5 {
        startup_cost -= (startup_pages - path.heap_pages) * params.seq_page_cost;
    }

    CostEstimate {
        startup_cost,
        total_cost,
        selectivity: 1.0,
        correlation: 0.0,
        pages,
        disabled_nodes: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path() -> IndexPath {
        IndexPath { order_by_count: 1, index_tuples: 1000.0, index_pages: 20.0, heap_pages: 50.0 }
    }

    #[test]
    fn test_without_order_is_disabled() {
        let est = cost_estimate(
            &IndexPath { order_by_count: 0, ..path() },
            &FlatSettings::default(),
            &CostParams::default(),
        );
        assert!(est.total_cost.is_infinite());
        assert!(est.startup_cost.is_infinite());
        assert_eq!(est.disabled_nodes, 2);
        assert!(est.is_disabled());
    }

    #[test]
    fn test_generic_costs() {
        let est = cost_estimate(&path(), &FlatSettings::default(), &CostParams::default());
        // 20 * 4.0 + 1000 * (0.005 + 0.0025)
        assert!((est.total_cost - 87.5).abs() < 1e-9);
        assert!((est.startup_cost - 43.75).abs() < 1e-9);
        assert_eq!(est.selectivity, 1.0);
        assert_eq!(est.pages, 20.0);
        assert!(!est.is_disabled());
    }

    #[test]
    fn test_toast_adjustment() {
        let settings = FlatSettings::with_random_ratio(25).unwrap();
        let small_heap = IndexPath { heap_pages: 2.0, ..path() };
        let est = cost_estimate(&small_heap, &settings, &CostParams::default());
        // startup pages 5 > 2 heap pages: minus 3 * seq_page_cost
        assert!((est.startup_cost - (87.5 * 0.25 - 3.0)).abs() < 1e-9);

        let est = cost_estimate(&path(), &settings, &CostParams::default());
        assert!((est.startup_cost - 87.5 * 0.25).abs() < 1e-9);
    }
}
