//! Per-producer queues.
//!
//! A queue is a leaf entity plus the request bookkeeping: a
//! sector-sorted map of pending requests, a FIFO list for deadline
//! aging, and a cached `next_rq` chosen by the head-biased chooser.
//! Queues also carry the producer's seek profile, the learned budget
//! cap, and the state flags driving the dispatch engine.

use alloc::collections::btree_map::BTreeMap;
use alloc::collections::vec_deque::VecDeque;
use bitflags::bitflags;

use crate::entity::{Entity, GroupId};
use crate::ioctx::Pid;
use crate::ioprio::IoprioClass;
use crate::request::{Request, RequestId, Sector};

/// Seek-mean threshold for a "seeky" producer: 8 KiB in sectors.
pub const SEEKY_THRESHOLD: u64 = 16;

/// An EWMA sample count is trusted past this (counts scale by 256/8).
pub const SAMPLE_VALID: u32 = 80;

bitflags! {
    /// Queue state flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct QueueFlags: u16 {
        /// Has pending requests; entity is activated.
        const BUSY = 1 << 0;
        /// Serves sync requests.
        const SYNC = 1 << 1;
        /// Post-completion idling is worthwhile for this producer.
        const IDLE_WINDOW = 1 << 2;
        /// Idling right now: the idle timer was armed for this queue.
        const WAIT_REQUEST = 1 << 3;
        /// Promised a slice; the next may-queue answers MUST.
        const MUST_ALLOC = 1 << 4;
        /// Budget granted but its wall clock not started yet.
        const BUDGET_NEW = 1 << 5;
        /// FIFO override already consumed this activation.
        const FIFO_EXPIRE = 1 << 6;
        /// Priority data must be refreshed from the I/O context.
        const PRIO_CHANGED = 1 << 7;
    }
}

/// A leaf queue.
#[derive(Debug)]
pub struct BfqQueue {
    pub entity: Entity,
    pub pid: Pid,
    pub group: GroupId,
    pub flags: QueueFlags,

    /// Pending requests keyed by starting sector.
    pub sort_list: BTreeMap<Sector, RequestId>,
    /// Insertion order, for deadline aging.
    pub fifo: VecDeque<RequestId>,
    /// Cached best next-serve candidate.
    pub next_rq: Option<RequestId>,

    /// Pending counts, `[async, sync]`.
    pub queued: [u32; 2],
    /// Requests allocated through set-request, `[async, sync]`.
    pub allocated: [u32; 2],
    /// Requests handed to the driver and not yet completed.
    pub dispatched: u32,
    pub meta_pending: u32,

    /// Learned budget cap (sectors).
    pub max_budget: u64,
    /// Wall-clock deadline of the current budget, in ticks.
    pub budget_timeout: u64,

    /// External references: requests, context association, group pin.
    pub refcnt: u32,

    /// Priority before a boost, for restoration.
    pub org_ioprio: u8,
    pub org_ioprio_class: IoprioClass,

    // Seek profile (EWMA, counts scaled by 256/8).
    pub seek_samples: u32,
    pub seek_total: u64,
    pub seek_mean: u64,
    pub last_request_pos: Sector,
}

impl BfqQueue {
    pub fn new(pid: Pid, group: GroupId, sync: bool, class: IoprioClass, ioprio: u8) -> Self {
        let mut flags = QueueFlags::PRIO_CHANGED | QueueFlags::BUDGET_NEW;
        if sync {
            flags |= QueueFlags::SYNC | QueueFlags::IDLE_WINDOW;
        }
        BfqQueue {
            entity: Entity::new(Some(group), class, ioprio),
            pid,
            group,
            flags,
            sort_list: BTreeMap::new(),
            fifo: VecDeque::new(),
            next_rq: None,
            queued: [0, 0],
            allocated: [0, 0],
            dispatched: 0,
            meta_pending: 0,
            max_budget: 0,
            budget_timeout: 0,
            refcnt: 0,
            org_ioprio: ioprio,
            org_ioprio_class: class,
            seek_samples: 0,
            seek_total: 0,
            seek_mean: 0,
            last_request_pos: 0,
        }
    }

    pub fn is_sync(&self) -> bool {
        self.flags.contains(QueueFlags::SYNC)
    }

    pub fn is_busy(&self) -> bool {
        self.flags.contains(QueueFlags::BUSY)
    }

    pub fn class_idle(&self) -> bool {
        self.entity.ioprio_class == IoprioClass::Idle
    }

    /// Budget remaining in the current activation, in sectors.
    pub fn budget_left(&self) -> u64 {
        self.entity.budget_left()
    }

    /// Feed one request position into the seek profile.
    ///
    /// The first positioned request of a producer is not a seek: it
    /// contributes distance zero. Early samples are clamped so one odd
    /// pagein cannot blow up the mean.
    pub fn update_seek(&mut self, pos: Sector) {
        let raw = if self.last_request_pos > pos {
            self.last_request_pos - pos
        } else {
            pos - self.last_request_pos
        };
        let sdist = if self.seek_samples == 0 {
            0
        } else if self.seek_samples <= 60 {
            raw.min(self.seek_mean * 4 + 2 * 1024 * 1024)
        } else {
            raw.min(self.seek_mean * 4 + 2 * 1024 * 64)
        };
        self.seek_samples = (7 * self.seek_samples + 256) / 8;
        self.seek_total = (7 * self.seek_total + 256 * sdist) / 8;
        self.seek_mean = (self.seek_total + self.seek_samples as u64 / 2) / self.seek_samples as u64;
    }

    pub fn seek_samples_valid(&self) -> bool {
        self.seek_samples > SAMPLE_VALID
    }

    pub fn is_seeky(&self) -> bool {
        self.seek_mean > SEEKY_THRESHOLD
    }
}

/// Head-biased chooser between two candidate requests.
///
/// `back_max` is in sectors; a request behind the head but within it
/// pays `back_penalty` per sector of back seek, anything further
/// behind "wraps". The total order: sync beats async, meta beats
/// non-meta, then shortest penalized distance, with wrapping requests
/// last.
pub(crate) fn choose_req<'a>(
    last_pos: Sector,
    back_max: u64,
    back_penalty: u64,
    r1: Option<&'a Request>,
    r2: Option<&'a Request>,
) -> Option<&'a Request> {
    let (r1, r2) = match (r1, r2) {
        (None, None) => return None,
        (Some(r), None) => return Some(r),
        (None, Some(r)) => return Some(r),
        (Some(a), Some(b)) => (a, b),
    };
    if r1.id == r2.id {
        return Some(r1);
    }

    if r1.is_sync() != r2.is_sync() {
        return Some(if r1.is_sync() { r1 } else { r2 });
    }
    if r1.is_meta() != r2.is_meta() {
        return Some(if r1.is_meta() { r1 } else { r2 });
    }

    let (d1, wrap1) = head_distance(last_pos, r1.sector, back_max, back_penalty);
    let (d2, wrap2) = head_distance(last_pos, r2.sector, back_max, back_penalty);

    match (wrap1, wrap2) {
        (false, false) => {
            if d1 < d2 {
                Some(r1)
            } else if d2 < d1 {
                Some(r2)
            } else if r1.sector >= r2.sector {
                Some(r1)
            } else {
                Some(r2)
            }
        }
        (false, true) => Some(r1),
        (true, false) => Some(r2),
        // both behind the horizon: the higher sector needs the
        // shorter back seek
        (true, true) => {
            if r1.sector >= r2.sector {
                Some(r1)
            } else {
                Some(r2)
            }
        }
    }
}

fn head_distance(last: Sector, s: Sector, back_max: u64, back_penalty: u64) -> (u64, bool) {
    if s >= last {
        (s - last, false)
    } else if last - s <= back_max {
        ((last - s) * back_penalty, false)
    } else {
        (0, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::RequestFlags;

    fn rq(id: u64, sector: Sector, flags: RequestFlags) -> Request {
        Request {
            id: RequestId(id),
            sector,
            nr_sectors: 8,
            flags,
            pid: 1,
            fifo_deadline: 0,
            queue: None,
            queued: true,
        }
    }

    const BACK_MAX: u64 = 16 * 1024 * 2; // 16 MiB of sectors
    const PENALTY: u64 = 2;

    fn pick(last: Sector, a: &Request, b: &Request) -> RequestId {
        choose_req(last, BACK_MAX, PENALTY, Some(a), Some(b)).unwrap().id
    }

    #[test]
    fn test_sync_beats_async() {
        let s = rq(1, 1_000_000, RequestFlags::SYNC);
        let a = rq(2, 100, RequestFlags::empty());
        assert_eq!(pick(90, &s, &a), RequestId(1));
    }

    #[test]
    fn test_meta_beats_plain() {
        let m = rq(1, 1_000_000, RequestFlags::SYNC | RequestFlags::META);
        let p = rq(2, 100, RequestFlags::SYNC);
        assert_eq!(pick(90, &m, &p), RequestId(1));
    }

    #[test]
    fn test_forward_wins_over_penalized_back_seek() {
        // head at 1000: 400 sectors forward vs 300 behind at 2x penalty
        let fwd = rq(1, 1400, RequestFlags::SYNC);
        let back = rq(2, 700, RequestFlags::SYNC);
        assert_eq!(pick(1000, &fwd, &back), RequestId(1));
        // a close back seek still beats a distant forward one
        let far = rq(3, 3000, RequestFlags::SYNC);
        let near_back = rq(4, 900, RequestFlags::SYNC);
        assert_eq!(pick(1000, &far, &near_back), RequestId(4));
    }

    #[test]
    fn test_wrapping_loses() {
        let behind_horizon = rq(1, 0, RequestFlags::SYNC);
        let ahead = rq(2, BACK_MAX * 4, RequestFlags::SYNC);
        assert_eq!(pick(BACK_MAX * 2, &behind_horizon, &ahead), RequestId(2));
    }

    #[test]
    fn test_both_wrap_higher_sector_wins() {
        let low = rq(1, 10, RequestFlags::SYNC);
        let high = rq(2, 500, RequestFlags::SYNC);
        let head = BACK_MAX + 100_000;
        assert_eq!(pick(head, &low, &high), RequestId(2));
    }

    #[test]
    fn test_seek_profile_first_sample_is_free() {
        let mut q = BfqQueue::new(1, GroupId(0), true, IoprioClass::Be, 4);
        q.update_seek(1_000_000);
        assert_eq!(q.seek_mean, 0);
        q.last_request_pos = 1_000_000;
        // sequential submissions keep the producer non-seeky
        for pos in (1_000_008..1_002_008).step_by(8) {
            q.update_seek(pos);
            q.last_request_pos = pos + 8;
        }
        assert!(!q.is_seeky());
        assert!(q.seek_samples_valid());
    }

    #[test]
    fn test_seek_profile_flags_random_producer() {
        let mut q = BfqQueue::new(1, GroupId(0), true, IoprioClass::Be, 4);
        let mut pos: Sector = 0;
        for i in 0..100 {
            q.update_seek(pos);
            q.last_request_pos = pos;
            pos += if i % 2 == 0 { 100_000 } else { 50_000 };
        }
        assert!(q.is_seeky());
    }
}
