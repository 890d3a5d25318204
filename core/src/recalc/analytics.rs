//! Analytics snapshot fold: sales and views are last-write-wins, each with its
//! own sequence marker.

use super::{Step, older_than};
use crate::product::SalesMetrics;

/// Apply `analytics.sales.updated`.
pub fn apply_sales(
    metrics: &mut SalesMetrics,
    units_last_30_days: u64,
    category_rank: u32,
    sequence: u64,
) -> Step {
    if let Some(stale) = older_than(metrics.last_sales_seq, sequence) {
        return stale;
    }
    metrics.units_last_30_days = units_last_30_days;
    metrics.category_rank = Some(category_rank);
    metrics.last_sales_seq = Some(sequence);
    Step::Changed
}

/// Apply `analytics.views.updated`.
pub fn apply_views(metrics: &mut SalesMetrics, view_growth_percent: f64, sequence: u64) -> Step {
    if let Some(stale) = older_than(metrics.last_views_seq, sequence) {
        return stale;
    }
    metrics.view_growth_percent = view_growth_percent;
    metrics.last_views_seq = Some(sequence);
    Step::Changed
}
