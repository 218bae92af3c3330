//! Tunable attributes.
//!
//! The runtime-adjustable knobs of the scheduler, with the stock
//! defaults. Time values are ticks (milliseconds); `back_seek_max` is
//! KiB; budgets are sectors. The system max budget is not here: it is
//! learned from the peak-rate estimator unless pinned through
//! [`BfqData::set_max_budget`].

use crate::sched::{BfqData, DEFAULT_MAX_BUDGET};
use crate::time::ms_to_ticks;

/// Runtime-adjustable scheduler parameters.
#[derive(Debug, Clone)]
pub struct Tunables {
    /// Requests a sync queue may push per dispatch round.
    pub quantum: u32,
    /// FIFO aging deadlines, `[async, sync]`, in ticks.
    pub fifo_expire: [u64; 2],
    /// Maximum useful backward seek, in KiB.
    pub back_seek_max: u64,
    /// Cost multiplier of a backward seek.
    pub back_seek_penalty: u64,
    /// Post-completion idle window, in ticks.
    pub slice_idle: u64,
    /// Dispatch cap of async queues per budget.
    pub max_budget_async_rq: u32,
    /// Budget wall-clock timeouts, `[async, sync]`, in ticks.
    pub timeout: [u64; 2],
    /// Favor latency: keep idling for seeky producers even on NCQ.
    pub desktop: bool,
}

impl Default for Tunables {
    fn default() -> Self {
        Tunables {
            quantum: 4,
            fifo_expire: [ms_to_ticks(250), ms_to_ticks(125)],
            back_seek_max: 16 * 1024,
            back_seek_penalty: 2,
            slice_idle: ms_to_ticks(8),
            max_budget_async_rq: 4,
            timeout: [ms_to_ticks(40), ms_to_ticks(125)],
            desktop: false,
        }
    }
}

impl Tunables {
    /// Backward-seek horizon in sectors.
    pub fn back_max_sectors(&self) -> u64 {
        self.back_seek_max * 2
    }
}

impl BfqData {
    pub fn tunables(&self) -> &Tunables {
        &self.tunables
    }

    /// Current system-wide max budget (sectors).
    pub fn max_budget(&self) -> u64 {
        self.max_budget
    }

    /// Pin the system max budget, or pass 0 to return to autotuning
    /// from the peak-rate estimator.
    pub fn set_max_budget(&mut self, sectors: u64) {
        self.user_max_budget = sectors;
        if sectors == 0 {
            self.max_budget = if self.peak_rate_samples > 0 {
                self.calc_max_budget()
            } else {
                DEFAULT_MAX_BUDGET
            };
        } else {
            self.max_budget = sectors;
        }
    }

    /// Sync budget timeout, in ticks. In auto mode the max budget is
    /// derived from it, so it is recomputed here.
    pub fn set_timeout_sync(&mut self, ticks: u64) {
        self.tunables.timeout[1] = ticks.max(1);
        if self.user_max_budget == 0 && self.peak_rate_samples > 0 {
            self.max_budget = self.calc_max_budget();
        }
    }

    pub fn set_timeout_async(&mut self, ticks: u64) {
        self.tunables.timeout[0] = ticks.max(1);
    }

    pub fn set_quantum(&mut self, quantum: u32) {
        self.tunables.quantum = quantum.max(1);
    }

    pub fn set_fifo_expire_sync(&mut self, ticks: u64) {
        self.tunables.fifo_expire[1] = ticks.max(1);
    }

    pub fn set_fifo_expire_async(&mut self, ticks: u64) {
        self.tunables.fifo_expire[0] = ticks.max(1);
    }

    pub fn set_back_seek_max(&mut self, kib: u64) {
        self.tunables.back_seek_max = kib;
    }

    pub fn set_back_seek_penalty(&mut self, penalty: u64) {
        self.tunables.back_seek_penalty = penalty.max(1);
    }

    pub fn set_slice_idle(&mut self, ticks: u64) {
        self.tunables.slice_idle = ticks;
    }

    pub fn set_max_budget_async_rq(&mut self, rq: u32) {
        self.tunables.max_budget_async_rq = rq.max(1);
    }

    pub fn set_desktop(&mut self, desktop: bool) {
        self.tunables.desktop = desktop;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let t = Tunables::default();
        assert_eq!(t.quantum, 4);
        assert_eq!(t.fifo_expire, [250, 125]);
        assert_eq!(t.timeout, [40, 125]);
        assert_eq!(t.slice_idle, 8);
        assert_eq!(t.back_max_sectors(), 32 * 1024);
    }

    #[test]
    fn test_pin_and_auto_budget() {
        let mut bfqd = BfqData::new(Tunables::default());
        assert_eq!(bfqd.max_budget(), DEFAULT_MAX_BUDGET);
        bfqd.set_max_budget(4096);
        assert_eq!(bfqd.max_budget(), 4096);
        // back to auto: without peak-rate samples the safe default holds
        bfqd.set_max_budget(0);
        assert_eq!(bfqd.max_budget(), DEFAULT_MAX_BUDGET);
    }
}
