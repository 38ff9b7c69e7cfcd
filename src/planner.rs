//! Batch Planner - Memory-Bounded Partitioning
//!
//! Runs before any canvas is allocated. The planner is pure arithmetic over
//! estimates: same items and budget always produce the same partition, and a
//! design too large to ever fit the budget is failed here, fast, instead of
//! half-allocated later.

use crate::config::{EngineConfig, MemoryBudget, BYTES_PER_PIXEL};
use crate::job::{OrderLineItem, SkipReason, SkippedItem};
use serde::Serialize;
use std::collections::HashSet;

/// One memory-bounded slice of the job, processed to completion before the
/// next begins. Items keep their original order.
#[derive(Debug, Clone, Serialize)]
pub struct SubBatch {
    pub items: Vec<OrderLineItem>,
    /// Planner's estimate for this sub-batch: unique designs + one canvas +
    /// fixed overhead.
    pub estimated_bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchPlan {
    pub sub_batches: Vec<SubBatch>,
    /// Items that failed planning. Never silently dropped: each carries a
    /// reason for the job summary.
    pub skipped: Vec<SkippedItem>,
    pub planning_budget_bytes: u64,
}

impl BatchPlan {
    pub fn total_planned_items(&self) -> usize {
        self.sub_batches.iter().map(|b| b.items.len()).sum()
    }
}

pub struct BatchPlanner<'a> {
    budget: &'a MemoryBudget,
    config: &'a EngineConfig,
    canvas_bytes: u64,
}

impl<'a> BatchPlanner<'a> {
    pub fn new(budget: &'a MemoryBudget, config: &'a EngineConfig, canvas_bytes: u64) -> Self {
        Self {
            budget,
            config,
            canvas_bytes,
        }
    }

    /// Estimated decoded size for one design: declared dimensions when the
    /// source can answer, the configured average otherwise.
    fn estimate_design_bytes(&self, declared: Option<(u32, u32)>) -> u64 {
        match declared {
            Some((w, h)) => w as u64 * h as u64 * BYTES_PER_PIXEL,
            None => self.config.avg_decoded_bytes_estimate,
        }
    }

    /// Partition `items` into consecutive sub-batches fitting the planning
    /// budget. `dimensions_of` is a cheap metadata peek (ImageSource), not a
    /// fetch.
    pub fn plan(
        &self,
        items: &[OrderLineItem],
        dimensions_of: impl Fn(&str) -> Option<(u32, u32)>,
    ) -> BatchPlan {
        let budget = self.budget.planning_budget();
        let fixed = self.canvas_bytes + self.config.fixed_overhead_bytes;

        let mut sub_batches = Vec::new();
        let mut skipped = Vec::new();

        let mut current: Vec<OrderLineItem> = Vec::new();
        let mut current_refs: HashSet<String> = HashSet::new();
        let mut current_design_bytes: u64 = 0;

        for item in items {
            let est = self.estimate_design_bytes(dimensions_of(&item.design_reference));

            // A design whose estimate alone busts the budget can never be
            // packed; fail it before any allocation is attempted.
            if est + fixed > budget {
                skipped.push(SkippedItem::new(
                    &item.design_reference,
                    SkipReason::OutOfMemory,
                    format!(
                        "estimated decoded size {} bytes plus canvas/overhead {} exceeds planning budget {}",
                        est, fixed, budget
                    ),
                ));
                continue;
            }

            let already_counted = current_refs.contains(&item.design_reference);
            let added_bytes = if already_counted { 0 } else { est };

            let over_memory =
                !current.is_empty() && current_design_bytes + added_bytes + fixed > budget;
            let over_count = self
                .config
                .max_items_per_sub_batch
                .map_or(false, |max| !current.is_empty() && current.len() >= max);

            if over_memory || over_count {
                sub_batches.push(SubBatch {
                    estimated_bytes: current_design_bytes + fixed,
                    items: std::mem::take(&mut current),
                });
                current_refs.clear();
                current_design_bytes = 0;
            }

            if current_refs.insert(item.design_reference.clone()) {
                current_design_bytes += est;
            }
            current.push(item.clone());
        }

        if !current.is_empty() {
            sub_batches.push(SubBatch {
                estimated_bytes: current_design_bytes + fixed,
                items: current,
            });
        }

        tracing::debug!(
            sub_batches = sub_batches.len(),
            skipped = skipped.len(),
            budget,
            "batch plan complete"
        );

        BatchPlan {
            sub_batches,
            skipped,
            planning_budget_bytes: budget,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(reference: &str, quantity: u32) -> OrderLineItem {
        OrderLineItem {
            design_reference: reference.to_string(),
            quantity,
            target_size: None,
        }
    }

    fn config(avg: u64, overhead: u64) -> EngineConfig {
        EngineConfig {
            avg_decoded_bytes_estimate: avg,
            fixed_overhead_bytes: overhead,
            ..EngineConfig::default()
        }
    }

    #[test]
    fn everything_fits_one_sub_batch() {
        let budget = MemoryBudget::new(10_000);
        let cfg = config(1_000, 0);
        let planner = BatchPlanner::new(&budget, &cfg, 1_000);
        let items = vec![item("a", 3), item("b", 2), item("c", 1)];
        let plan = planner.plan(&items, |_| None);
        assert_eq!(plan.sub_batches.len(), 1);
        assert_eq!(plan.sub_batches[0].items.len(), 3);
        assert!(plan.skipped.is_empty());
    }

    #[test]
    fn splits_preserve_input_order() {
        // budget 7000 * 0.7 = 4900; canvas 1000; each design 1000.
        // Three unique designs fit per sub-batch, not four.
        let budget = MemoryBudget::new(7_000);
        let cfg = config(1_000, 0);
        let planner = BatchPlanner::new(&budget, &cfg, 1_000);
        let items: Vec<_> = ["a", "b", "c", "d", "e"]
            .iter()
            .map(|r| item(r, 1))
            .collect();
        let plan = planner.plan(&items, |_| None);
        assert_eq!(plan.sub_batches.len(), 2);
        let order: Vec<_> = plan
            .sub_batches
            .iter()
            .flat_map(|b| b.items.iter().map(|i| i.design_reference.as_str()))
            .collect();
        assert_eq!(order, vec!["a", "b", "c", "d", "e"]);
    }

    #[test]
    fn duplicate_references_counted_once() {
        let budget = MemoryBudget::new(7_000);
        let cfg = config(1_000, 0);
        let planner = BatchPlanner::new(&budget, &cfg, 1_000);
        // Five line items, two unique designs: one sub-batch.
        let items = vec![item("a", 1), item("b", 1), item("a", 2), item("a", 1), item("b", 3)];
        let plan = planner.plan(&items, |_| None);
        assert_eq!(plan.sub_batches.len(), 1);
        assert_eq!(plan.sub_batches[0].items.len(), 5);
    }

    #[test]
    fn oversized_design_fails_fast() {
        let budget = MemoryBudget::new(10_000);
        let cfg = config(1_000, 0);
        let planner = BatchPlanner::new(&budget, &cfg, 1_000);
        let items = vec![item("small", 1), item("huge", 4), item("small2", 1)];
        // "huge" declares 100x100 RGBA = 40_000 bytes > 7_000 budget.
        let plan = planner.plan(&items, |r| (r == "huge").then_some((100, 100)));
        assert_eq!(plan.skipped.len(), 1);
        assert_eq!(plan.skipped[0].design_reference, "huge");
        assert_eq!(plan.skipped[0].reason, SkipReason::OutOfMemory);
        assert_eq!(plan.total_planned_items(), 2);
    }

    #[test]
    fn max_items_per_sub_batch_caps_count() {
        let budget = MemoryBudget::new(1 << 40);
        let mut cfg = config(1, 0);
        cfg.max_items_per_sub_batch = Some(2);
        let planner = BatchPlanner::new(&budget, &cfg, 1);
        let items: Vec<_> = (0..5).map(|i| item(&format!("d{i}"), 1)).collect();
        let plan = planner.plan(&items, |_| None);
        assert_eq!(plan.sub_batches.len(), 3);
        assert_eq!(plan.sub_batches[2].items.len(), 1);
    }

    #[test]
    fn planning_is_idempotent() {
        let budget = MemoryBudget::new(9_000);
        let cfg = config(2_000, 500);
        let planner = BatchPlanner::new(&budget, &cfg, 1_500);
        let items: Vec<_> = (0..8).map(|i| item(&format!("d{i}"), i + 1)).collect();
        let a = planner.plan(&items, |_| None);
        let b = planner.plan(&items, |_| None);
        assert_eq!(a.sub_batches.len(), b.sub_batches.len());
        for (x, y) in a.sub_batches.iter().zip(&b.sub_batches) {
            assert_eq!(x.estimated_bytes, y.estimated_bytes);
            let xs: Vec<_> = x.items.iter().map(|i| &i.design_reference).collect();
            let ys: Vec<_> = y.items.iter().map(|i| &i.design_reference).collect();
            assert_eq!(xs, ys);
        }
    }
}
