//! Budget Fair Queueing I/O scheduler core.
//!
//! Proportional-share scheduling of one block device among many
//! producers (processes, priority classes, groups). Every producer
//! gets its own queue; queues compete through hierarchical service
//! trees ordered by virtual finish time, and the winner is served for
//! a budget of sectors bounded by a wall-clock timeout. Expirations
//! feed budgets, the peak-rate estimate and the queue-depth detector,
//! so the scheduler adapts to both the device and the workload.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │           Block layer / driver          │
//! │   set_request · insert · dispatch ·     │
//! │   complete · merge · may_queue          │
//! ├─────────────────────────────────────────┤
//! │          Dispatch engine (sched)        │
//! │   active queue, budgets, timeouts,      │
//! │   idling, feedback, estimators          │
//! ├─────────────────────────────────────────┤
//! │     Service trees (entity/service)      │
//! │   per-class augmented RB-trees,         │
//! │   virtual time, hierarchy walks         │
//! ├─────────────────────────────────────────┤
//! │     Queues (queue/request/ioctx)        │
//! │   sector order, FIFO aging, profiling   │
//! └─────────────────────────────────────────┘
//! ```
//!
//! The scheduler state is single-threaded under the device lock; the
//! [`Bfq`] wrapper holds that lock and is the only public entry point
//! external actors (submission, completion, timers) should use.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod entity;
pub mod group;
mod hierarchy;
pub mod ioctx;
pub mod ioprio;
pub mod queue;
pub mod rbtree;
pub mod request;
pub mod sched;
pub mod service;
pub mod time;
pub mod tunables;

pub use entity::{GroupId, QueueId};
pub use ioctx::{live_contexts, Pid};
pub use ioprio::IoprioClass;
pub use request::{RequestId, Sector};
pub use sched::{BfqData, BfqStats, ExpireReason, MayQueue};
pub use tunables::Tunables;

use spin::Mutex;

/// Errors surfaced at the block-layer boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedError {
    /// The request handle does not resolve to a live request.
    UnknownRequest,
    /// The operation needs a request that is still queued.
    NotQueued,
}

pub type SchedResult<T> = core::result::Result<T, SchedError>;

/// A scheduler instance for one backing device, behind its lock.
///
/// Mirrors the locking model of the core: every external actor takes
/// the device lock before touching scheduler state. Operations not
/// forwarded here are reachable through [`Bfq::lock`].
pub struct Bfq {
    inner: Mutex<BfqData>,
}

impl Bfq {
    pub fn new(tunables: Tunables) -> Self {
        Bfq {
            inner: Mutex::new(BfqData::new(tunables)),
        }
    }

    /// Full access to the scheduler state under the device lock.
    pub fn lock(&self) -> spin::MutexGuard<'_, BfqData> {
        self.inner.lock()
    }

    /// Allocate and insert a request in one step.
    pub fn submit(&self, pid: Pid, sector: Sector, nr_sectors: u32, sync: bool, meta: bool) -> RequestId {
        let mut b = self.inner.lock();
        let rid = b.set_request(pid, sector, nr_sectors, sync, meta);
        b.insert_request(rid).expect("freshly allocated request");
        rid
    }

    pub fn may_queue(&self, pid: Pid, sync: bool) -> MayQueue {
        self.inner.lock().may_queue(pid, sync)
    }

    pub fn dispatch(&self, force: bool) -> usize {
        self.inner.lock().dispatch(force)
    }

    pub fn pop_dispatched(&self) -> Option<RequestId> {
        self.inner.lock().pop_dispatched()
    }

    pub fn complete_request(&self, rid: RequestId) -> SchedResult<()> {
        self.inner.lock().complete_request(rid)
    }

    pub fn advance_clock_us(&self, delta_us: u64) {
        self.inner.lock().advance_clock_us(delta_us);
    }

    /// Timer tick: fires the idle timer if due; true means the
    /// embedder should run a dispatch round.
    pub fn poll(&self) -> bool {
        self.inner.lock().poll()
    }

    pub fn create_group(&self, parent: Option<GroupId>, weight: u32) -> GroupId {
        self.inner.lock().create_group(parent, weight)
    }

    pub fn bind_producer(&self, pid: Pid, group: GroupId) {
        self.inner.lock().bind_producer(pid, group);
    }

    pub fn set_ioprio(&self, pid: Pid, class: u8, level: u8) {
        self.inner.lock().set_ioprio(pid, class, level);
    }

    pub fn producer_exit(&self, pid: Pid) {
        self.inner.lock().producer_exit(pid);
    }

    pub fn queue_empty(&self) -> bool {
        self.inner.lock().queue_empty()
    }

    pub fn stats(&self) -> BfqStats {
        self.inner.lock().stats().clone()
    }

    /// Synchronous teardown: cancel timers, drain every queue.
    pub fn exit(&self) -> usize {
        self.inner.lock().exit()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_locked_wrapper_basic_flow() {
        let bfq = Bfq::new(Tunables::default());
        let rid = bfq.submit(1, 4096, 8, true, false);
        assert_eq!(bfq.dispatch(false), 1);
        assert_eq!(bfq.pop_dispatched(), Some(rid));
        bfq.advance_clock_us(500);
        bfq.complete_request(rid).unwrap();
        assert!(bfq.queue_empty());
        assert_eq!(bfq.stats().completed, 1);
    }
}
