//! Groups and per-group scheduler data.
//!
//! A group is an inner entity: it competes in its parent's service
//! trees like a queue does, and owns one service tree per priority
//! class for its children. Groups also hold the shared async queues:
//! all producers of a group writing asynchronously at a given priority
//! share a single queue, pinned by the group itself.

use crate::entity::{Entity, EntityId, GroupId, QueueId};
use crate::ioprio::{IOPRIO_BE_NR, NR_IOPRIO_CLASSES};
use crate::service::ServiceTree;

/// Scheduler state a parent keeps for its children.
#[derive(Debug)]
pub struct SchedData {
    /// Child entity currently under service, off any tree.
    pub active_entity: Option<EntityId>,
    /// Cached candidate for the next service round.
    pub next_active: Option<EntityId>,
    /// One service tree per priority class, in class order.
    pub service_tree: [ServiceTree; NR_IOPRIO_CLASSES],
}

impl SchedData {
    pub const fn new() -> Self {
        SchedData {
            active_entity: None,
            next_active: None,
            service_tree: [ServiceTree::new(), ServiceTree::new(), ServiceTree::new()],
        }
    }
}

/// An inner node of the scheduling hierarchy.
#[derive(Debug)]
pub struct BfqGroup {
    pub entity: Entity,
    pub sched_data: SchedData,
    /// Shared async queues: `[RT | BE][level]`.
    pub async_queues: [[Option<QueueId>; IOPRIO_BE_NR as usize]; 2],
    /// Shared async queue of the idle class.
    pub async_idle_queue: Option<QueueId>,
}

impl BfqGroup {
    /// Root group: no parent, never scheduled itself.
    pub fn root() -> Self {
        BfqGroup {
            entity: Entity::with_weight(None, 1),
            sched_data: SchedData::new(),
            async_queues: [[None; IOPRIO_BE_NR as usize]; 2],
            async_idle_queue: None,
        }
    }

    /// Child group competing in `parent` with the given weight.
    pub fn new(parent: GroupId, weight: u32) -> Self {
        BfqGroup {
            entity: Entity::with_weight(Some(parent), weight),
            sched_data: SchedData::new(),
            async_queues: [[None; IOPRIO_BE_NR as usize]; 2],
            async_idle_queue: None,
        }
    }
}
