//! Device-wide scheduler state and the dispatch engine.
//!
//! One [`BfqData`] exists per backing device. It owns the queue and
//! group arenas, the request records, the per-producer contexts, and
//! the top-level policy: pick an active queue through the hierarchy,
//! bound its service by budget and wall clock, idle briefly after sync
//! completions, and feed every expiration back into the budget,
//! peak-rate and queue-depth estimators.
//!
//! All entry points assume the caller holds the device lock (the
//! [`crate::Bfq`] wrapper enforces that); nothing here blocks.

use alloc::collections::btree_map::BTreeMap;
use alloc::collections::vec_deque::VecDeque;
use alloc::vec::Vec;

use crate::entity::{EntityId, GroupId, QueueId, TreeKind};
use crate::group::BfqGroup;
use crate::ioctx::{IoContext, Pid};
use crate::ioprio::{ioprio_from_nice, ioprio_to_weight, parse_ioprio, IoprioClass, IOPRIO_NORM};
use crate::queue::{choose_req, BfqQueue, QueueFlags};
use crate::request::{Request, RequestFlags, RequestId, Sector};
use crate::time::Clock;
use crate::tunables::Tunables;
use crate::{SchedError, SchedResult};

/// Fixed-point shift of the peak-rate estimator (sectors per µs).
pub const RATE_SHIFT: u32 = 16;

/// Budget increment/decrement unit, in sectors.
pub const BUDGET_STEP: u64 = 128;

/// Safe system max budget until the peak-rate estimator warms up.
pub const DEFAULT_MAX_BUDGET: u64 = 16 * 1024;

/// Warm-up gate: the budget counter converges towards 256, and the
/// learned limits are only trusted past this value (about ten
/// activations in).
pub const BUDGET_TRUST_THRESHOLD: u64 = 194;

/// Samples of the peak-rate window.
pub const PEAK_RATE_SAMPLES: u32 = 32;

/// Queue-depth detection: threshold and window.
pub const HW_QUEUE_THRESHOLD: u32 = 4;
pub const HW_QUEUE_SAMPLES: u32 = 32;

/// Shortened idle window for seeky producers, in ticks.
pub const MIN_TT_TICKS: u64 = 2;

/// Below this many sectors, a request arriving while idling is too
/// small to justify unplugging the device.
const SMALL_REQUEST_SECTORS: u32 = 32;

/// Why the active queue was expired; drives the budget feedback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpireReason {
    /// The idle window elapsed without a new request.
    TooIdle = 0,
    /// The budget's wall-clock timeout fired.
    BudgetTimeout = 1,
    /// The next request would not fit the remaining budget.
    BudgetExhausted = 2,
    /// Nothing left to serve and no reason to wait.
    NoMoreRequests = 3,
}

impl ExpireReason {
    pub fn index(self) -> usize {
        self as usize
    }
}

/// Backpressure answer of the may-queue protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MayQueue {
    May,
    /// The producer was promised a slice and must be allowed to queue.
    Must,
}

/// Running counters, exposed read-only.
#[derive(Debug, Clone, Default)]
pub struct BfqStats {
    pub submitted: u64,
    pub merged: u64,
    pub dispatched: u64,
    pub completed: u64,
    /// Expirations indexed by [`ExpireReason`].
    pub expired: [u64; 4],
    pub idle_timer_fired: u64,
    pub forced_dispatches: u64,
}

/// Per-device scheduler state.
#[derive(Debug)]
pub struct BfqData {
    pub(crate) queues: Vec<Option<BfqQueue>>,
    pub(crate) free_queues: Vec<u32>,
    pub(crate) groups: Vec<BfqGroup>,
    pub(crate) requests: BTreeMap<RequestId, Request>,
    next_rq_id: u64,
    pub(crate) io_contexts: BTreeMap<Pid, IoContext>,

    pub(crate) root_group: GroupId,
    pub(crate) active_queue: Option<QueueId>,
    pub(crate) active_ioc: Option<Pid>,

    pub(crate) busy_queues: u32,
    /// Requests queued in the scheduler, device-wide.
    pub(crate) queued: u32,
    /// Requests at the driver, `[async, sync]`.
    pub(crate) rq_in_driver: [u32; 2],
    pub(crate) sync_flight: u32,

    // Queue-depth (NCQ) detection.
    pub(crate) max_rq_in_driver: u32,
    pub(crate) hw_tag_samples: u32,
    pub(crate) hw_tag: bool,

    /// Warm-up counter for budget trust; converges towards 256.
    pub(crate) budgets_assigned: u64,

    /// Tick at which the idle-slice timer fires, when armed.
    pub(crate) idle_timer: Option<u64>,
    /// Deferred dispatch kick for the embedder.
    pub(crate) unplug_pending: bool,

    pub(crate) last_position: Sector,
    pub(crate) last_budget_start_us: u64,
    pub(crate) last_idling_start_us: u64,

    // Peak-rate estimator (sectors per µs, fixed point).
    pub(crate) peak_rate: u64,
    pub(crate) peak_rate_samples: u32,
    /// Current system-wide max budget, in sectors.
    pub(crate) max_budget: u64,
    /// User-pinned max budget; 0 means autotune.
    pub(crate) user_max_budget: u64,

    pub(crate) tunables: Tunables,
    pub(crate) dispatch_list: VecDeque<RequestId>,
    pub(crate) clock: Clock,
    /// Injected probe: does the submitting context hold
    /// filesystem-exclusive resources?
    pub(crate) fs_excl: Option<fn() -> bool>,
    pub(crate) stats: BfqStats,
    prio_parse_warned: bool,
}

impl BfqData {
    pub fn new(tunables: Tunables) -> Self {
        let mut groups = Vec::new();
        groups.push(BfqGroup::root());
        BfqData {
            queues: Vec::new(),
            free_queues: Vec::new(),
            groups,
            requests: BTreeMap::new(),
            next_rq_id: 1,
            io_contexts: BTreeMap::new(),
            root_group: GroupId(0),
            active_queue: None,
            active_ioc: None,
            busy_queues: 0,
            queued: 0,
            rq_in_driver: [0, 0],
            sync_flight: 0,
            max_rq_in_driver: 0,
            hw_tag_samples: 0,
            hw_tag: false,
            budgets_assigned: 0,
            idle_timer: None,
            unplug_pending: false,
            last_position: 0,
            last_budget_start_us: 0,
            last_idling_start_us: 0,
            peak_rate: 0,
            peak_rate_samples: 0,
            max_budget: DEFAULT_MAX_BUDGET,
            user_max_budget: 0,
            tunables,
            dispatch_list: VecDeque::new(),
            clock: Clock::new(),
            fs_excl: None,
            stats: BfqStats::default(),
            prio_parse_warned: false,
        }
    }

    // ---- clock and deferred work ----

    pub fn advance_clock_us(&mut self, delta_us: u64) {
        self.clock.advance_us(delta_us);
    }

    pub fn now_ticks(&self) -> u64 {
        self.clock.now_ticks()
    }

    /// Fire the idle timer if due, and report whether a deferred
    /// dispatch kick is pending. Called from the embedder's tick path.
    pub fn poll(&mut self) -> bool {
        if let Some(expiry) = self.idle_timer {
            if self.clock.now_ticks() >= expiry {
                self.idle_timer_expired();
            }
        }
        self.take_unplug()
    }

    pub fn take_unplug(&mut self) -> bool {
        core::mem::take(&mut self.unplug_pending)
    }

    /// Idle-slice timer callback. The active queue may have been
    /// replaced since the timer was armed; expiring the current one a
    /// little early is safe, so no further checking is done.
    pub fn idle_timer_expired(&mut self) {
        self.idle_timer = None;
        self.stats.idle_timer_fired += 1;
        if let Some(q) = self.active_queue {
            let reason = if self.may_expire_for_budg_timeout(q) {
                ExpireReason::BudgetTimeout
            } else {
                ExpireReason::TooIdle
            };
            self.queue_mut(q).flags.remove(QueueFlags::WAIT_REQUEST);
            self.expire(q, true, reason);
        }
        self.unplug_pending = true;
    }

    pub fn stats(&self) -> &BfqStats {
        &self.stats
    }

    pub fn queue_empty(&self) -> bool {
        self.queued == 0 && self.dispatch_list.is_empty()
    }

    pub fn busy_queue_count(&self) -> u32 {
        self.busy_queues
    }

    pub fn hw_tag(&self) -> bool {
        self.hw_tag
    }

    pub fn peak_rate(&self) -> u64 {
        self.peak_rate
    }

    /// Inject the probe consulted by the priority boost.
    pub fn set_fs_excl_probe(&mut self, probe: fn() -> bool) {
        self.fs_excl = Some(probe);
    }

    /// Learned budget cap of a producer's queue, if it exists.
    pub fn queue_max_budget(&self, pid: Pid, sync: bool) -> Option<u64> {
        let q = self.io_contexts.get(&pid)?.queues[sync as usize]?;
        Some(self.queue(q).max_budget)
    }

    /// Sector of the queue's current next-serve candidate.
    pub fn next_request_sector(&self, pid: Pid, sync: bool) -> Option<Sector> {
        let q = self.io_contexts.get(&pid)?.queues[sync as usize]?;
        let rid = self.queue(q).next_rq?;
        Some(self.requests.get(&rid)?.sector)
    }

    /// Virtual time of a class tree at the root group.
    pub fn root_vtime(&self, class: IoprioClass) -> u64 {
        self.st_ref(self.root_group, class.index()).vtime
    }

    // ---- groups and producers ----

    /// Create a group under `parent` (root if `None`) with an explicit
    /// weight.
    pub fn create_group(&mut self, parent: Option<GroupId>, weight: u32) -> GroupId {
        let parent = parent.unwrap_or(self.root_group);
        let g = GroupId(self.groups.len() as u32);
        self.groups.push(BfqGroup::new(parent, weight));
        g
    }

    /// Route a producer's future queues into a group.
    pub fn bind_producer(&mut self, pid: Pid, group: GroupId) {
        self.ioc_get(pid);
        self.io_contexts.get_mut(&pid).expect("just created").group = group;
    }

    pub fn set_producer_nice(&mut self, pid: Pid, nice: i8) {
        self.ioc_get(pid);
        let ioc = self.io_contexts.get_mut(&pid).expect("just created");
        ioc.nice = nice;
        let queues = ioc.queues;
        for q in queues.into_iter().flatten() {
            self.queue_mut(q).flags.insert(QueueFlags::PRIO_CHANGED);
        }
    }

    /// Change a producer's I/O priority. Invalid input falls back to
    /// the nice-derived priority (logged once). Takes effect at the
    /// queues' next (re)activation.
    pub fn set_ioprio(&mut self, pid: Pid, class: u8, level: u8) {
        self.ioc_get(pid);
        let parsed = parse_ioprio(class, level);
        if parsed.is_none() && !self.prio_parse_warned {
            self.prio_parse_warned = true;
            log::warn!(target: "bfq", "bad io priority ({}, {}) for pid {}, using nice-derived", class, level, pid);
        }
        let ioc = self.io_contexts.get_mut(&pid).expect("just created");
        ioc.ioprio = parsed;
        let queues = ioc.queues;
        for q in queues.into_iter().flatten() {
            self.queue_mut(q).flags.insert(QueueFlags::PRIO_CHANGED);
        }
    }

    /// The producer's tasks are gone: stop idling on it, drop its
    /// queue associations. Pending requests keep the queues alive.
    pub fn producer_exit(&mut self, pid: Pid) {
        let Some(ioc) = self.io_contexts.get_mut(&pid) else {
            return;
        };
        ioc.nr_tasks = 0;
        let queues = ioc.queues;
        for (i, slot) in queues.iter().enumerate() {
            if let Some(q) = *slot {
                if self.active_queue == Some(q) {
                    self.expire_bare(q);
                }
                if let Some(ioc) = self.io_contexts.get_mut(&pid) {
                    ioc.queues[i] = None;
                }
                self.put_queue(q);
            }
        }
        if self.active_ioc == Some(pid) {
            self.active_ioc = None;
        }
        self.io_contexts.remove(&pid);
    }

    fn ioc_get(&mut self, pid: Pid) -> GroupId {
        if let Some(ioc) = self.io_contexts.get(&pid) {
            return ioc.group;
        }
        let root = self.root_group;
        self.io_contexts.insert(pid, IoContext::new(pid, root));
        root
    }

    fn effective_prio(&self, pid: Pid) -> (IoprioClass, u8) {
        match self.io_contexts.get(&pid) {
            Some(ioc) => ioc
                .ioprio
                .unwrap_or((IoprioClass::Be, ioprio_from_nice(ioc.nice))),
            None => (IoprioClass::Be, IOPRIO_NORM),
        }
    }

    // ---- queue allocation ----

    fn alloc_queue(&mut self, pid: Pid, group: GroupId, sync: bool, class: IoprioClass, level: u8) -> QueueId {
        let mut bq = BfqQueue::new(pid, group, sync, class, level);
        bq.max_budget = self.default_budget();
        let q = if let Some(i) = self.free_queues.pop() {
            self.queues[i as usize] = Some(bq);
            QueueId(i)
        } else {
            self.queues.push(Some(bq));
            QueueId((self.queues.len() - 1) as u32)
        };
        log::trace!(target: "bfq", "allocated {} queue {:?} for pid {}", if sync { "sync" } else { "async" }, q, pid);
        q
    }

    /// Find or create the queue for (producer, direction). Async
    /// queues are shared per (group, class, level) and pinned by the
    /// group.
    fn get_queue(&mut self, pid: Pid, group: GroupId, sync: bool) -> QueueId {
        let (class, level) = self.effective_prio(pid);
        if !sync {
            if let Some(q) = *self.async_slot(group, class, level) {
                return q;
            }
        }
        let q = self.alloc_queue(pid, group, sync, class, level);
        if !sync {
            *self.async_slot_mut(group, class, level) = Some(q);
            self.queue_mut(q).refcnt += 1; // group pin
        }
        q
    }

    fn async_slot(&self, group: GroupId, class: IoprioClass, level: u8) -> &Option<QueueId> {
        let g = self.group(group);
        match class {
            IoprioClass::Rt => &g.async_queues[0][level as usize],
            IoprioClass::Be => &g.async_queues[1][level as usize],
            IoprioClass::Idle => &g.async_idle_queue,
        }
    }

    fn async_slot_mut(&mut self, group: GroupId, class: IoprioClass, level: u8) -> &mut Option<QueueId> {
        let g = self.group_mut(group);
        match class {
            IoprioClass::Rt => &mut g.async_queues[0][level as usize],
            IoprioClass::Be => &mut g.async_queues[1][level as usize],
            IoprioClass::Idle => &mut g.async_idle_queue,
        }
    }

    /// Drop one reference; the last one frees the queue, which by then
    /// must be empty and off every tree.
    pub(crate) fn put_queue(&mut self, q: QueueId) {
        let qq = self.queue_mut(q);
        debug_assert!(qq.refcnt > 0);
        qq.refcnt -= 1;
        if qq.refcnt > 0 {
            return;
        }
        debug_assert!(qq.sort_list.is_empty());
        debug_assert!(qq.fifo.is_empty());
        debug_assert!(!qq.is_busy());
        debug_assert_eq!(qq.entity.tree, TreeKind::None);
        debug_assert_eq!(qq.allocated, [0, 0]);
        debug_assert!(self.active_queue != Some(q));
        log::trace!(target: "bfq", "freed queue {:?}", q);
        self.queues[q.0 as usize] = None;
        self.free_queues.push(q.0);
    }

    // ---- priority data ----

    /// Refresh a queue's pending priority from its producer's context.
    fn init_prio_data(&mut self, q: QueueId, pid: Pid) {
        if !self.queue(q).flags.contains(QueueFlags::PRIO_CHANGED) {
            return;
        }
        let (class, level) = self.effective_prio(pid);
        let qq = self.queue_mut(q);
        qq.entity.new_ioprio = level;
        qq.entity.new_ioprio_class = class;
        qq.entity.new_weight = ioprio_to_weight(level);
        qq.entity.prio_changed = true;
        qq.org_ioprio = level;
        qq.org_ioprio_class = class;
        if class == IoprioClass::Idle {
            qq.flags.remove(QueueFlags::IDLE_WINDOW);
        }
        qq.flags.remove(QueueFlags::PRIO_CHANGED);
    }

    /// While the caller holds filesystem-exclusive resources, idle
    /// producers are lifted into the best-effort class and capped at
    /// normal priority, so they cannot stall others on shared locks.
    fn prio_boost(&mut self, q: QueueId) {
        let boosted = self.fs_excl.map(|probe| probe()).unwrap_or(false);
        let qq = self.queue_mut(q);
        let (mut class, mut level) = (qq.entity.new_ioprio_class, qq.entity.new_ioprio);
        if boosted {
            if class == IoprioClass::Idle {
                class = IoprioClass::Be;
            }
            if level > IOPRIO_NORM {
                level = IOPRIO_NORM;
            }
        } else {
            class = qq.org_ioprio_class;
            level = qq.org_ioprio;
        }
        if class != qq.entity.new_ioprio_class || level != qq.entity.new_ioprio {
            qq.entity.new_ioprio_class = class;
            qq.entity.new_ioprio = level;
            qq.entity.new_weight = ioprio_to_weight(level);
            qq.entity.prio_changed = true;
        }
    }

    // ---- request lifecycle ----

    /// Allocate scheduler state for a request: resolve (or create) the
    /// producer's queue and take the per-request reference.
    pub fn set_request(&mut self, pid: Pid, sector: Sector, nr_sectors: u32, sync: bool, meta: bool) -> RequestId {
        let group = self.ioc_get(pid);
        let dir = sync as usize;
        let q = match self.io_contexts.get(&pid).expect("just created").queues[dir] {
            Some(q) => q,
            None => {
                let q = self.get_queue(pid, group, sync);
                self.queue_mut(q).refcnt += 1; // context association
                self.io_contexts.get_mut(&pid).expect("just created").queues[dir] = Some(q);
                q
            }
        };
        self.queue_mut(q).allocated[dir] += 1;
        self.queue_mut(q).refcnt += 1;
        self.queue_mut(q).flags.remove(QueueFlags::MUST_ALLOC);

        let id = RequestId(self.next_rq_id);
        self.next_rq_id += 1;
        let mut flags = RequestFlags::empty();
        if sync {
            flags |= RequestFlags::SYNC;
        }
        if meta {
            flags |= RequestFlags::META;
        }
        self.requests.insert(
            id,
            Request {
                id,
                sector,
                nr_sectors,
                flags,
                pid,
                fifo_deadline: 0,
                queue: Some(q),
                queued: false,
            },
        );
        id
    }

    /// Insert an allocated request into the scheduler.
    pub fn insert_request(&mut self, rid: RequestId) -> SchedResult<()> {
        let rq = self.requests.get(&rid).ok_or(SchedError::UnknownRequest)?;
        debug_assert!(!rq.queued);
        let q = rq.queue.ok_or(SchedError::UnknownRequest)?;
        let pid = rq.pid;
        let sync = rq.is_sync();

        self.init_prio_data(q, pid);
        self.prio_boost(q);

        let deadline = self.clock.now_ticks() + self.tunables.fifo_expire[sync as usize];
        {
            let rq = self.requests.get_mut(&rid).expect("checked above");
            rq.fifo_deadline = deadline;
            rq.queued = true;
        }
        self.add_rq(rid, q);
        self.queue_mut(q).fifo.push_back(rid);
        self.rq_enqueued(q, rid);
        self.stats.submitted += 1;
        Ok(())
    }

    /// Core insertion: sector tree, counters, next-request candidate,
    /// activation of a previously empty queue.
    fn add_rq(&mut self, rid: RequestId, q: QueueId) {
        let (sector, sync, meta) = {
            let rq = &self.requests[&rid];
            (rq.sector, rq.is_sync(), rq.is_meta())
        };
        self.queue_mut(q).queued[sync as usize] += 1;
        self.queued += 1;
        if meta {
            self.queue_mut(q).meta_pending += 1;
        }

        // An alias (identical start sector) cannot live in the sector
        // tree; push it straight to the driver, unscheduled.
        while let Some(&alias) = self.queue(q).sort_list.get(&sector) {
            self.dispatch_insert(alias);
        }
        self.queue_mut(q).sort_list.insert(sector, rid);

        let prev = self.queue(q).next_rq;
        let next = {
            let last_pos = self.last_position;
            let back_max = self.tunables.back_max_sectors();
            let penalty = self.tunables.back_seek_penalty;
            let r1 = prev.and_then(|r| self.requests.get(&r));
            let r2 = self.requests.get(&rid);
            choose_req(last_pos, back_max, penalty, r1, r2)
                .map(|r| r.id)
                .expect("at least the new request")
        };
        self.queue_mut(q).next_rq = Some(next);

        if !self.queue(q).is_busy() {
            let charge = self.requests[&next].serv_to_charge();
            let qq = self.queue_mut(q);
            qq.entity.budget = qq.max_budget.max(charge);
            self.add_busy_queue(q);
        } else if prev != Some(next) {
            self.updated_next_req(q);
        }
    }

    /// The best candidate of a queue changed while it was queued:
    /// resize its budget and reactivate so the finish time is honest.
    /// Never touches the in-service queue.
    fn updated_next_req(&mut self, q: QueueId) {
        if self.active_queue == Some(q) || !self.queue(q).is_busy() {
            return;
        }
        let Some(next) = self.queue(q).next_rq else {
            return;
        };
        let charge = self.requests[&next].serv_to_charge();
        let qq = self.queue_mut(q);
        let new_budget = qq.max_budget.max(charge);
        qq.entity.budget = new_budget;
        log::trace!(target: "bfq", "queue {:?}: next request changed, budget {}", q, new_budget);
        self.activate_entity(EntityId::Queue(q));
    }

    /// Profiling and idling decisions at enqueue time.
    fn rq_enqueued(&mut self, q: QueueId, rid: RequestId) {
        let (sector, nr, pid) = {
            let rq = &self.requests[&rid];
            (rq.sector, rq.nr_sectors, rq.pid)
        };
        let now = self.clock.now_ticks();
        let slice_idle = self.tunables.slice_idle;
        if let Some(ioc) = self.io_contexts.get_mut(&pid) {
            ioc.update_think_time(now, slice_idle);
        }
        self.queue_mut(q).update_seek(sector);
        self.update_idle_window(q, pid);
        self.queue_mut(q).last_request_pos = sector + nr as u64;

        if self.active_queue == Some(q) && self.queue(q).flags.contains(QueueFlags::WAIT_REQUEST) {
            // Idling paid off. A single small request is not worth
            // unplugging for; stay parked and let more accumulate.
            let queued_total = self.queue(q).queued[0] + self.queue(q).queued[1];
            if queued_total == 1 && nr < SMALL_REQUEST_SECTORS {
                return;
            }
            self.queue_mut(q).flags.remove(QueueFlags::WAIT_REQUEST);
            self.idle_timer = None;
            if self.may_expire_for_budg_timeout(q) {
                self.expire(q, false, ExpireReason::BudgetTimeout);
            }
            self.unplug_pending = true;
        }
    }

    /// Re-evaluate whether idling on this producer is worthwhile.
    fn update_idle_window(&mut self, q: QueueId, pid: Pid) {
        if !self.queue(q).is_sync() || self.queue(q).class_idle() {
            return;
        }
        let Some(ioc) = self.io_contexts.get(&pid) else {
            return;
        };
        let mut enable = self.queue(q).flags.contains(QueueFlags::IDLE_WINDOW);
        let seeky = self.queue(q).is_seeky();
        if ioc.nr_tasks == 0
            || self.tunables.slice_idle == 0
            || (self.hw_tag && seeky && !self.tunables.desktop)
        {
            enable = false;
        } else if ioc.samples_valid() {
            enable = ioc.ttime_mean <= self.tunables.slice_idle;
        }
        if enable {
            self.queue_mut(q).flags.insert(QueueFlags::IDLE_WINDOW);
        } else {
            self.queue_mut(q).flags.remove(QueueFlags::IDLE_WINDOW);
        }
    }

    /// Take a request out of the scheduler (dispatch, merge, drain).
    pub(crate) fn remove_request(&mut self, rid: RequestId) {
        let (q, sector, sync, meta) = {
            let rq = &self.requests[&rid];
            (rq.queue.expect("queued request"), rq.sector, rq.is_sync(), rq.is_meta())
        };
        if self.queue(q).next_rq == Some(rid) {
            let next = self.find_next_rq(q, rid);
            self.queue_mut(q).next_rq = next;
            self.updated_next_req(q);
        }
        if let Some(pos) = self.queue(q).fifo.iter().position(|r| *r == rid) {
            self.queue_mut(q).fifo.remove(pos);
        }
        self.queue_mut(q).sort_list.remove(&sector);
        self.queue_mut(q).queued[sync as usize] -= 1;
        self.queued -= 1;
        if meta {
            debug_assert!(self.queue(q).meta_pending > 0);
            self.queue_mut(q).meta_pending -= 1;
        }
        self.requests.get_mut(&rid).expect("present").queued = false;

        if self.queue(q).sort_list.is_empty()
            && self.queue(q).is_busy()
            && self.active_queue != Some(q)
        {
            self.del_busy_queue(q, true);
        }
    }

    /// Next-serve candidate after `rid` leaves: its sector-tree
    /// neighbours, run through the head-biased chooser.
    fn find_next_rq(&self, q: QueueId, rid: RequestId) -> Option<RequestId> {
        let sector = self.requests[&rid].sector;
        let qq = self.queue(q);
        let succ = qq
            .sort_list
            .range(sector + 1..)
            .next()
            .map(|(_, r)| *r);
        let pred = qq.sort_list.range(..sector).next_back().map(|(_, r)| *r);
        choose_req(
            self.last_position,
            self.tunables.back_max_sectors(),
            self.tunables.back_seek_penalty,
            succ.and_then(|r| self.requests.get(&r)),
            pred.and_then(|r| self.requests.get(&r)),
        )
        .map(|r| r.id)
    }

    /// FIFO aging: serve the queue head past its deadline, at most
    /// once per activation.
    fn check_fifo(&mut self, q: QueueId) -> Option<RequestId> {
        if self.queue(q).flags.contains(QueueFlags::FIFO_EXPIRE) {
            return None;
        }
        let head = *self.queue(q).fifo.front()?;
        if self.clock.now_ticks() < self.requests[&head].fifo_deadline {
            return None;
        }
        self.queue_mut(q).flags.insert(QueueFlags::FIFO_EXPIRE);
        Some(head)
    }

    // ---- merging ----

    /// Find a request in the producer's queue ending exactly at
    /// `bio_sector`, the candidate the block layer may merge into.
    pub fn find_merge(&self, pid: Pid, sync: bool, bio_sector: Sector) -> Option<RequestId> {
        let ioc = self.io_contexts.get(&pid)?;
        let q = ioc.queues[sync as usize]?;
        let (_, &rid) = self.queue(q).sort_list.range(..bio_sector).next_back()?;
        let rq = self.requests.get(&rid)?;
        (rq.end_sector() == bio_sector).then_some(rid)
    }

    /// No sync bio may merge into an async request, and only into a
    /// request of the queue the submitting producer would use.
    pub fn allow_merge(&self, pid: Pid, bio_sync: bool, rid: RequestId) -> bool {
        let Some(rq) = self.requests.get(&rid) else {
            return false;
        };
        if bio_sync && !rq.is_sync() {
            return false;
        }
        let Some(ioc) = self.io_contexts.get(&pid) else {
            return false;
        };
        ioc.queues[bio_sync as usize] == rq.queue
    }

    /// The block layer grew a request; reposition it if its start
    /// sector moved and refresh the next-serve candidate.
    pub fn merged_request(&mut self, rid: RequestId, new_sector: Sector, new_nr: u32) -> SchedResult<()> {
        let rq = self.requests.get(&rid).ok_or(SchedError::UnknownRequest)?;
        if !rq.queued {
            return Err(SchedError::NotQueued);
        }
        let q = rq.queue.ok_or(SchedError::UnknownRequest)?;
        let old_sector = rq.sector;
        {
            let rq = self.requests.get_mut(&rid).expect("checked above");
            rq.sector = new_sector;
            rq.nr_sectors = new_nr;
        }
        if new_sector != old_sector {
            self.queue_mut(q).sort_list.remove(&old_sector);
            while let Some(&alias) = self.queue(q).sort_list.get(&new_sector) {
                self.dispatch_insert(alias);
            }
            self.queue_mut(q).sort_list.insert(new_sector, rid);
        }
        let prev = self.queue(q).next_rq;
        let next = {
            let r1 = prev.and_then(|r| self.requests.get(&r));
            let r2 = self.requests.get(&rid);
            choose_req(
                self.last_position,
                self.tunables.back_max_sectors(),
                self.tunables.back_seek_penalty,
                r1,
                r2,
            )
            .map(|r| r.id)
        };
        self.queue_mut(q).next_rq = next;
        if prev != next {
            self.updated_next_req(q);
        }
        Ok(())
    }

    /// Two requests were merged; the survivor inherits the older FIFO
    /// deadline (and position) and the metadata marking, the loser is
    /// released.
    pub fn merge_requests(&mut self, rid: RequestId, next_rid: RequestId) -> SchedResult<()> {
        let (rq_deadline, rq_meta) = {
            let rq = self.requests.get(&rid).ok_or(SchedError::UnknownRequest)?;
            (rq.fifo_deadline, rq.is_meta())
        };
        let (next_q, next_deadline, next_dir, next_meta) = {
            let nx = self.requests.get(&next_rid).ok_or(SchedError::UnknownRequest)?;
            if !nx.queued {
                return Err(SchedError::NotQueued);
            }
            (nx.queue.expect("queued request"), nx.fifo_deadline, nx.dir(), nx.is_meta())
        };
        let q = self.requests[&rid].queue.ok_or(SchedError::UnknownRequest)?;

        if self.requests[&rid].queued && next_deadline < rq_deadline && q == next_q {
            let fifo = &mut self.queue_mut(q).fifo;
            let pos_rq = fifo.iter().position(|r| *r == rid);
            let pos_next = fifo.iter().position(|r| *r == next_rid);
            if let (Some(pr), Some(pn)) = (pos_rq, pos_next) {
                fifo.remove(pr);
                let pn = if pr < pn { pn - 1 } else { pn };
                fifo.insert(pn, rid);
            }
            self.requests.get_mut(&rid).expect("present").fifo_deadline = next_deadline;
        }
        if next_meta && !rq_meta {
            self.requests.get_mut(&rid).expect("present").flags |= RequestFlags::META;
            self.queue_mut(q).meta_pending += 1;
        }

        self.remove_request(next_rid);
        self.requests.remove(&next_rid);
        self.queue_mut(next_q).allocated[next_dir] -= 1;
        self.put_queue(next_q);
        self.stats.merged += 1;
        Ok(())
    }

    // ---- may-queue protocol ----

    /// Backpressure hint: a producer the scheduler is idling for has
    /// been promised a slice and must be allowed to queue.
    pub fn may_queue(&mut self, pid: Pid, sync: bool) -> MayQueue {
        let Some(ioc) = self.io_contexts.get(&pid) else {
            return MayQueue::May;
        };
        let Some(q) = ioc.queues[sync as usize] else {
            return MayQueue::May;
        };
        self.init_prio_data(q, pid);
        self.prio_boost(q);
        let qq = self.queue_mut(q);
        if qq.flags.contains(QueueFlags::WAIT_REQUEST) && qq.flags.contains(QueueFlags::MUST_ALLOC) {
            qq.flags.remove(QueueFlags::MUST_ALLOC);
            return MayQueue::Must;
        }
        MayQueue::May
    }

    // ---- budgets ----

    pub(crate) fn default_budget(&self) -> u64 {
        let budget = if self.budgets_assigned < BUDGET_TRUST_THRESHOLD && self.user_max_budget == 0 {
            DEFAULT_MAX_BUDGET
        } else {
            self.max_budget
        };
        budget - budget / 4
    }

    fn min_budget(&self) -> u64 {
        self.max_budget / 2
    }

    /// Sectors transferable at the measured peak rate in 3/4 of a sync
    /// timeout.
    pub(crate) fn calc_max_budget(&self) -> u64 {
        (self.peak_rate * 1000 * self.tunables.timeout[1] * 3 / 4) >> RATE_SHIFT
    }

    /// Start the wall clock of a freshly granted budget.
    fn set_budget_timeout(&mut self, q: QueueId) {
        self.last_budget_start_us = self.clock.now_us();
        let sync = self.queue(q).is_sync();
        let deadline = self.clock.now_ticks() + self.tunables.timeout[sync as usize];
        let qq = self.queue_mut(q);
        qq.flags.remove(QueueFlags::BUDGET_NEW);
        qq.budget_timeout = deadline;
    }

    fn may_expire_for_budg_timeout(&self, q: QueueId) -> bool {
        let qq = self.queue(q);
        !qq.flags.contains(QueueFlags::BUDGET_NEW) && self.clock.now_ticks() > qq.budget_timeout
    }

    /// A queue that pays like a timeout has its finish time reflect
    /// the wall time it occupied, not the few sectors it moved.
    fn charge_full_budget(&mut self, q: QueueId) {
        let ent = &mut self.queue_mut(q).entity;
        ent.service = ent.budget;
    }

    /// The budget feedback table.
    fn recalc_budget(&mut self, q: QueueId, reason: ExpireReason) {
        let mut budget = self.queue(q).max_budget;
        let min_budget = self.min_budget();

        if self.queue(q).is_sync() {
            match reason {
                ExpireReason::TooIdle => {
                    // latency-sensitive producer, shrink towards
                    // request-sized budgets
                    if budget > min_budget + BUDGET_STEP {
                        budget -= BUDGET_STEP;
                    } else {
                        budget = min_budget;
                    }
                }
                ExpireReason::BudgetTimeout => {
                    budget = self.default_budget();
                }
                ExpireReason::BudgetExhausted => {
                    // greedy sequential reader, feed it more
                    if budget < self.max_budget.saturating_sub(8 * BUDGET_STEP) {
                        budget += 8 * BUDGET_STEP;
                    } else {
                        budget = self.max_budget;
                    }
                }
                ExpireReason::NoMoreRequests => return,
            }
        } else {
            // async queues always run at the system max; their dispatch
            // cap does the limiting
            budget = self.max_budget;
        }

        self.queue_mut(q).max_budget = budget;
        if self.budgets_assigned >= BUDGET_TRUST_THRESHOLD
            && self.user_max_budget == 0
            && self.queue(q).max_budget > self.max_budget
        {
            let cap = self.max_budget;
            self.queue_mut(q).max_budget = cap;
        }

        // The entity budget (and so the finish time) must cover the
        // next request, whatever the learned cap says.
        let next_charge = self
            .queue(q)
            .next_rq
            .map(|r| self.requests[&r].serv_to_charge());
        let qq = self.queue_mut(q);
        qq.entity.budget = match next_charge {
            Some(c) => qq.max_budget.max(c),
            None => qq.max_budget,
        };
        log::trace!(target: "bfq", "queue {:?}: budget {} ({:?})", q, qq.entity.budget, reason);
    }

    // ---- estimators ----

    /// Update the peak-rate estimate from a finished service slice and
    /// classify the queue: "slow" means its measured rate would not
    /// have finished the budget within the sync timeout.
    fn update_peak_rate(&mut self, q: QueueId, compensate: bool) -> bool {
        if !self.queue(q).is_sync() || self.queue(q).flags.contains(QueueFlags::BUDGET_NEW) {
            return false;
        }
        let end = if compensate {
            self.last_idling_start_us
        } else {
            self.clock.now_us()
        };
        let usecs = end.saturating_sub(self.last_budget_start_us);
        if usecs < 100 {
            return false;
        }
        let service = self.queue(q).entity.service;
        let bw = (service << RATE_SHIFT) / usecs;

        // only long slices say anything about the device's peak
        if usecs > 20_000 {
            let mut update = false;
            if bw > self.peak_rate {
                self.peak_rate = bw;
                update = true;
                log::debug!(target: "bfq", "new peak rate {}", bw);
            }
            if self.peak_rate_samples == PEAK_RATE_SAMPLES - 1 {
                update = true;
            }
            if self.peak_rate_samples < PEAK_RATE_SAMPLES {
                self.peak_rate_samples += 1;
            }
            if self.peak_rate_samples == PEAK_RATE_SAMPLES && update && self.user_max_budget == 0 {
                self.max_budget = self.calc_max_budget();
                log::debug!(target: "bfq", "autotuned max budget {}", self.max_budget);
            }
        }

        let expected = (bw * 1000 * self.tunables.timeout[1]) >> RATE_SHIFT;
        expected < self.queue(q).entity.budget
    }

    /// Track the device's effective queue depth; a deep device makes
    /// idling on seeky producers pointless.
    fn update_hw_tag(&mut self) {
        let in_driver = self.rq_in_driver[0] + self.rq_in_driver[1];
        self.max_rq_in_driver = self.max_rq_in_driver.max(in_driver);
        if in_driver + self.queued < HW_QUEUE_THRESHOLD {
            return;
        }
        self.hw_tag_samples += 1;
        if self.hw_tag_samples < HW_QUEUE_SAMPLES {
            return;
        }
        self.hw_tag = self.max_rq_in_driver > HW_QUEUE_THRESHOLD;
        log::debug!(target: "bfq", "hw_tag = {}", self.hw_tag);
        self.max_rq_in_driver = 0;
        self.hw_tag_samples = 0;
    }

    // ---- expiration ----

    /// Expire the active queue: profile the slice, punish slow and
    /// timed-out queues with a full-budget charge, run the feedback,
    /// and requeue or park the entity.
    pub(crate) fn expire(&mut self, q: QueueId, compensate: bool, reason: ExpireReason) {
        debug_assert_eq!(self.active_queue, Some(q));
        let slow = self.update_peak_rate(q, compensate);

        // A queue that idled its slice away at a crawl is a seeky
        // producer in disguise; account it like a timeout.
        let reason = if slow && reason == ExpireReason::TooIdle {
            ExpireReason::BudgetTimeout
        } else {
            reason
        };
        if slow || reason == ExpireReason::BudgetTimeout {
            self.charge_full_budget(q);
        }
        log::trace!(target: "bfq", "expire queue {:?}: {:?} slow={}", q, reason, slow);
        self.recalc_budget(q, reason);
        self.stats.expired[reason.index()] += 1;
        self.expire_bare(q);
    }

    /// Expiration without feedback: detach from service and either
    /// drop the queue from the busy set or requeue its remaining work.
    pub(crate) fn expire_bare(&mut self, q: QueueId) {
        if self.active_queue == Some(q) {
            self.reset_active();
        }
        if self.queue(q).sort_list.is_empty() {
            if self.queue(q).is_busy() {
                self.del_busy_queue(q, true);
            }
        } else {
            self.activate_entity(EntityId::Queue(q));
        }
    }

    fn reset_active(&mut self) {
        if let Some(pid) = self.active_ioc.take() {
            if let Some(ioc) = self.io_contexts.get_mut(&pid) {
                debug_assert!(ioc.refcnt > 0);
                ioc.refcnt -= 1;
            }
        }
        if let Some(q) = self.active_queue.take() {
            self.queue_mut(q).flags.remove(QueueFlags::WAIT_REQUEST);
        }
        self.idle_timer = None;
    }

    // ---- selection and dispatch ----

    fn set_active_queue(&mut self) -> Option<QueueId> {
        debug_assert!(self.active_queue.is_none());
        let q = self.get_next_queue();
        if let Some(q) = q {
            let qq = self.queue_mut(q);
            qq.flags.insert(QueueFlags::MUST_ALLOC | QueueFlags::BUDGET_NEW);
            qq.flags.remove(QueueFlags::FIFO_EXPIRE);
            self.budgets_assigned = (self.budgets_assigned * 7 + 256) / 8;
            log::trace!(target: "bfq", "queue {:?} set active", q);
        }
        self.active_queue = q;
        q
    }

    /// The select-queue state machine: keep, park, or expire-and-pick.
    fn select_queue(&mut self) -> Option<QueueId> {
        let Some(q) = self.active_queue else {
            return self.set_active_queue();
        };

        if self.may_expire_for_budg_timeout(q) {
            self.expire(q, false, ExpireReason::BudgetTimeout);
            return self.set_active_queue();
        }

        if let Some(next) = self.queue(q).next_rq {
            let charge = self.requests[&next].serv_to_charge();
            if charge > self.queue(q).budget_left() {
                self.expire(q, false, ExpireReason::BudgetExhausted);
                return self.set_active_queue();
            }
            // If the idle timer is still pending, the arrivals were too
            // small to unplug on; the block layer has unplugged now, so
            // stop waiting and serve them.
            if self.idle_timer.is_some() {
                self.queue_mut(q).flags.remove(QueueFlags::WAIT_REQUEST);
                self.idle_timer = None;
            }
            return Some(q);
        }

        // Empty queue: stay parked while idling, or while in-flight
        // requests may pull more out of this producer.
        if self.idle_timer.is_some()
            || (self.queue(q).dispatched > 0 && self.queue(q).flags.contains(QueueFlags::IDLE_WINDOW))
        {
            return None;
        }

        self.expire(q, false, ExpireReason::NoMoreRequests);
        self.set_active_queue()
    }

    /// One dispatch round. Returns the number of requests moved to the
    /// driver's list; `force` drains everything (barrier, scheduler
    /// swap).
    pub fn dispatch(&mut self, force: bool) -> usize {
        if force {
            return self.forced_dispatch();
        }
        if self.busy_queues == 0 {
            return 0;
        }
        let Some(q) = self.select_queue() else {
            return 0;
        };

        let mut max_dispatch = self.tunables.quantum;
        if !self.queue(q).is_sync() {
            max_dispatch = self.tunables.max_budget_async_rq;
        }
        if self.queue(q).class_idle() {
            max_dispatch = 1;
        }
        if self.queue(q).dispatched >= max_dispatch {
            if self.busy_queues > 1 {
                return 0;
            }
            if self.queue(q).dispatched >= 4 * max_dispatch {
                return 0;
            }
        }
        // keep async out of the way while sync work is in flight
        if self.sync_flight > 0 && !self.queue(q).is_sync() {
            return 0;
        }
        // and drain async before committing to an idling sync queue
        if self.queue(q).is_sync()
            && self.queue(q).flags.contains(QueueFlags::IDLE_WINDOW)
            && self.rq_in_driver[0] > 0
        {
            return 0;
        }

        self.queue_mut(q).flags.remove(QueueFlags::WAIT_REQUEST);
        debug_assert!(self.idle_timer.is_none());
        if self.queue(q).flags.contains(QueueFlags::BUDGET_NEW) {
            self.set_budget_timeout(q);
        }
        self.dispatch_from(q, max_dispatch)
    }

    fn dispatch_from(&mut self, q: QueueId, max_dispatch: u32) -> usize {
        let mut dispatched = 0usize;
        loop {
            let rid = match self.check_fifo(q) {
                Some(r) => r,
                None => match self.queue(q).next_rq {
                    Some(r) => r,
                    None => break,
                },
            };
            let charge = self.requests[&rid].serv_to_charge();
            if charge > self.queue(q).budget_left() {
                // ensure the budget resize at expiration covers this
                // request, wherever it came from
                self.queue_mut(q).next_rq = Some(rid);
                self.expire(q, false, ExpireReason::BudgetExhausted);
                break;
            }

            self.entity_served(q, charge);
            let pid = self.requests[&rid].pid;
            self.dispatch_insert(rid);
            self.stats.dispatched += 1;
            dispatched += 1;

            if self.active_ioc.is_none() {
                if let Some(ioc) = self.io_contexts.get_mut(&pid) {
                    ioc.refcnt += 1;
                    self.active_ioc = Some(pid);
                }
            }

            if dispatched >= max_dispatch as usize {
                break;
            }
            if self.queue(q).next_rq.is_none() {
                break;
            }
        }
        dispatched
    }

    /// Move a request from its queue to the driver's dispatch list and
    /// account it as in flight. No budget is charged here.
    fn dispatch_insert(&mut self, rid: RequestId) {
        let (q, sync, dir, end) = {
            let rq = &self.requests[&rid];
            (rq.queue.expect("queued request"), rq.is_sync(), rq.dir(), rq.end_sector())
        };
        self.remove_request(rid);
        self.queue_mut(q).dispatched += 1;
        if sync {
            self.sync_flight += 1;
        }
        self.rq_in_driver[dir] += 1;
        self.last_position = end;
        self.dispatch_list.push_back(rid);
    }

    /// Drain everything: expire the active queue, flush every busy
    /// queue past its budget, reset the learned caps, prune the idle
    /// trees.
    fn forced_dispatch(&mut self) -> usize {
        if let Some(q) = self.active_queue {
            self.expire_bare(q);
        }
        let mut dispatched = 0usize;
        let busy: Vec<QueueId> = self
            .queues
            .iter()
            .enumerate()
            .filter(|(_, s)| s.as_ref().map(|qq| qq.is_busy()).unwrap_or(false))
            .map(|(i, _)| QueueId(i as u32))
            .collect();
        for q in busy {
            while let Some(rid) = self.queue(q).next_rq {
                self.dispatch_insert(rid);
                dispatched += 1;
            }
            let cap = self.max_budget;
            let (container, class) = {
                let e = &self.queue(q).entity;
                (e.parent.expect("queues always have a parent"), e.ioprio_class.index())
            };
            self.queue_mut(q).max_budget = cap;
            self.prune_idle(container, class);
        }
        debug_assert_eq!(self.busy_queues, 0);
        self.stats.forced_dispatches += dispatched as u64;
        dispatched
    }

    // ---- idling ----

    /// Park the device for the active sync queue after its last
    /// pending request completed. Seeky producers only get a token
    /// window; producers with no live tasks get none.
    fn arm_slice_timer(&mut self) {
        let Some(q) = self.active_queue else {
            return;
        };
        debug_assert!(self.queue(q).sort_list.is_empty());
        if self.tunables.slice_idle == 0 || !self.queue(q).flags.contains(QueueFlags::IDLE_WINDOW) {
            return;
        }
        let Some(pid) = self.active_ioc else {
            return;
        };
        let Some(ioc) = self.io_contexts.get(&pid) else {
            return;
        };
        if ioc.nr_tasks == 0 {
            return;
        }
        self.queue_mut(q).flags.insert(QueueFlags::WAIT_REQUEST);
        let mut sl = self.tunables.slice_idle;
        if self.queue(q).seek_samples_valid() && self.queue(q).is_seeky() {
            sl = sl.min(MIN_TT_TICKS);
        }
        self.last_idling_start_us = self.clock.now_us();
        self.idle_timer = Some(self.clock.now_ticks() + sl);
        log::trace!(target: "bfq", "arm idle timer for queue {:?} ({} ticks)", q, sl);
    }

    // ---- driver surface ----

    /// Driver pulls the next request to submit to hardware.
    pub fn pop_dispatched(&mut self) -> Option<RequestId> {
        self.dispatch_list.pop_front()
    }

    /// Driver retries a request it previously backed out of.
    pub fn activate_request(&mut self, rid: RequestId) -> SchedResult<()> {
        let rq = self.requests.get(&rid).ok_or(SchedError::UnknownRequest)?;
        let dir = rq.dir();
        self.rq_in_driver[dir] += 1;
        self.last_position = self.requests[&rid].end_sector();
        Ok(())
    }

    /// Driver backs a request out; it returns to the dispatch list.
    pub fn deactivate_request(&mut self, rid: RequestId) -> SchedResult<()> {
        let rq = self.requests.get(&rid).ok_or(SchedError::UnknownRequest)?;
        let dir = rq.dir();
        debug_assert!(self.rq_in_driver[dir] > 0);
        self.rq_in_driver[dir] -= 1;
        self.dispatch_list.push_front(rid);
        Ok(())
    }

    /// Completion: accounting, producer profiling, idling or expiry of
    /// the active queue, and release of the request's reference.
    pub fn complete_request(&mut self, rid: RequestId) -> SchedResult<()> {
        let (q, sync, dir, pid) = {
            let rq = self.requests.get(&rid).ok_or(SchedError::UnknownRequest)?;
            debug_assert!(!rq.queued);
            (rq.queue.ok_or(SchedError::UnknownRequest)?, rq.is_sync(), rq.dir(), rq.pid)
        };

        self.update_hw_tag();

        debug_assert!(self.rq_in_driver[dir] > 0);
        debug_assert!(self.queue(q).dispatched > 0);
        self.rq_in_driver[dir] -= 1;
        self.queue_mut(q).dispatched -= 1;
        if sync {
            debug_assert!(self.sync_flight > 0);
            self.sync_flight -= 1;
            let now = self.clock.now_ticks();
            if let Some(ioc) = self.io_contexts.get_mut(&pid) {
                ioc.last_end_request = now;
            }
        }
        self.stats.completed += 1;

        if self.active_queue == Some(q) {
            if self.queue(q).flags.contains(QueueFlags::BUDGET_NEW) {
                self.set_budget_timeout(q);
            }
            if self.queue(q).is_sync() && self.queue(q).sort_list.is_empty() {
                self.arm_slice_timer();
            } else if self.may_expire_for_budg_timeout(q) {
                self.expire(q, false, ExpireReason::BudgetTimeout);
            }
        }

        if self.rq_in_driver[0] + self.rq_in_driver[1] == 0 {
            self.unplug_pending = true;
        }

        self.requests.remove(&rid);
        self.queue_mut(q).allocated[dir] -= 1;
        self.put_queue(q);
        Ok(())
    }

    // ---- shutdown ----

    /// Drain and detach everything; used at scheduler swap or device
    /// teardown. In-flight requests must still be completed by the
    /// driver afterwards.
    pub fn exit(&mut self) -> usize {
        self.idle_timer = None;
        let drained = self.forced_dispatch();
        // with the active trees drained the class clocks can walk over
        // every parked entity
        for gi in 0..self.groups.len() {
            for class in 0..crate::ioprio::NR_IOPRIO_CLASSES {
                while self.prune_idle(GroupId(gi as u32), class) {}
            }
        }
        let pids: Vec<Pid> = self.io_contexts.keys().copied().collect();
        for pid in pids {
            self.producer_exit(pid);
        }
        for gi in 0..self.groups.len() {
            let mut pins: Vec<QueueId> = Vec::new();
            {
                let g = &mut self.groups[gi];
                for row in g.async_queues.iter_mut() {
                    for slot in row.iter_mut() {
                        if let Some(q) = slot.take() {
                            pins.push(q);
                        }
                    }
                }
                if let Some(q) = g.async_idle_queue.take() {
                    pins.push(q);
                }
            }
            for q in pins {
                self.put_queue(q);
            }
        }
        drained
    }
}
