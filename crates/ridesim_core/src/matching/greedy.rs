//! Greedy nearest-neighbor matching.
//!
//! Per customer: collect candidate vehicles within pickup range from the
//! grid, try them nearest first, and commit the first insertion that
//! satisfies time windows and capacity.

use tracing::info;

use super::{CandidateIndex, MatchCtx, Strategy};
use crate::kernel::check_capacity;
use crate::models::{Customer, Vehicle};

#[derive(Default)]
pub struct GreedyNearest {
    index: Option<CandidateIndex>,
    matched: u64,
}

impl GreedyNearest {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Strategy for GreedyNearest {
    fn name(&self) -> &'static str {
        "greedy"
    }

    fn begin(&mut self, ctx: &mut MatchCtx) {
        let index = self
            .index
            .get_or_insert_with(|| CandidateIndex::new(ctx.net().bbox()));
        index.clear();
    }

    fn handle_vehicle(&mut self, vehl: &Vehicle, ctx: &mut MatchCtx) {
        if let Some(index) = self.index.as_mut() {
            index.insert(ctx.net(), vehl);
        }
    }

    fn handle_customer(&mut self, cust: &Customer, ctx: &mut MatchCtx) {
        let Some(index) = self.index.as_mut() else {
            return;
        };
        let kernel = ctx.kernel();
        let range = kernel.pickup_range(cust).max(0) as f64;

        for cand_id in index.within(ctx.net(), range, cust.orig) {
            let Some(cand) = index.get(cand_id) else {
                continue;
            };
            let cand = cand.clone();
            let ins = kernel.insert_customer(&cand, cust);
            if !kernel.check_time_windows(&ins.schedule, &ins.route)
                || !check_capacity(cand.seats_free(), &ins.schedule)
            {
                continue;
            }
            if let Some(ok) =
                ctx.assign_or_delay(&[cust.clone()], &[], &cand, &ins.route, &ins.schedule)
            {
                index.apply(cand_id, &ok, 1);
                self.matched += 1;
            }
            return;
        }
        ctx.delay(cust.id);
    }

    fn end(&mut self, _ctx: &mut MatchCtx) {
        info!(matches = self.matched, "greedy nearest-neighbor finished");
    }
}
