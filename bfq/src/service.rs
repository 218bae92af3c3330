//! Per-class service trees.
//!
//! Each group owns one service tree per I/O priority class. A tree
//! keeps the class's virtual time, the weight sum of entities counted
//! on it, and two finish-ordered trees: `active` for entities with
//! pending work and `idle` for entities whose finish time lies in the
//! future, kept around so a reactivation cannot gain virtual time by
//! leaving and re-entering.

use crate::entity::{vt_after, Entity, EntityId, TreeKind};
use crate::rbtree::VtimeTree;

/// Service tree of one priority class inside one group.
#[derive(Debug)]
pub struct ServiceTree {
    pub active: VtimeTree,
    pub idle: VtimeTree,
    /// Virtual time of the class; advances monotonically.
    pub vtime: u64,
    /// Weight sum of all entities counted on this tree.
    pub wsum: u64,
}

impl ServiceTree {
    pub const fn new() -> Self {
        ServiceTree {
            active: VtimeTree::new(),
            idle: VtimeTree::new(),
            vtime: 0,
            wsum: 0,
        }
    }

    /// Insert an entity into the active tree. `finish`/`start` must be
    /// final: tree keys are frozen until extraction.
    pub fn active_insert(&mut self, id: EntityId, ent: &mut Entity) {
        debug_assert_eq!(ent.tree, TreeKind::None);
        let node = self.active.insert(ent.finish, ent.start, id);
        ent.node = Some(node);
        ent.tree = TreeKind::Active;
    }

    /// Remove an entity from the active tree.
    pub fn active_extract(&mut self, ent: &mut Entity) {
        debug_assert_eq!(ent.tree, TreeKind::Active);
        let node = ent.node.take().expect("active entity without a node");
        self.active.remove(node);
        ent.tree = TreeKind::None;
    }

    /// Insert an entity into the idle tree.
    pub fn idle_insert(&mut self, id: EntityId, ent: &mut Entity) {
        debug_assert_eq!(ent.tree, TreeKind::None);
        let node = self.idle.insert(ent.finish, ent.start, id);
        ent.node = Some(node);
        ent.tree = TreeKind::Idle;
    }

    /// Remove an entity from the idle tree.
    pub fn idle_extract(&mut self, ent: &mut Entity) {
        debug_assert_eq!(ent.tree, TreeKind::Idle);
        let node = ent.node.take().expect("idle entity without a node");
        self.idle.remove(node);
        ent.tree = TreeKind::None;
    }

    /// Advance the class virtual time to the earliest start still on
    /// the active tree, so at least one entity is always eligible.
    pub fn update_vtime(&mut self) {
        if let Some(min_start) = self.active.min_start() {
            if vt_after(min_start, self.vtime) {
                self.vtime = min_start;
            }
        }
    }

    /// Pop one idle entity whose finish time the class clock already
    /// passed, if any. With a drained active tree, first jump the
    /// clock over the whole idle tree. The caller finalizes the
    /// returned entity (clears membership, drops the reference).
    pub fn pop_forgettable_idle(&mut self) -> Option<EntityId> {
        if self.active.is_empty() {
            // nobody is competing: the clock may walk forward over the
            // whole idle tree
            if let Some(last) = self.idle.last() {
                let last_finish = self.idle.finish(last);
                if vt_after(last_finish, self.vtime) {
                    self.vtime = last_finish;
                }
            }
        }
        let first = self.idle.first()?;
        if vt_after(self.idle.finish(first), self.vtime) {
            return None;
        }
        Some(self.idle.item(first))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{QueueId, SERVICE_SHIFT};
    use crate::ioprio::IoprioClass;

    fn ent(start: u64, finish: u64) -> Entity {
        let mut e = Entity::new(None, IoprioClass::Be, 4);
        e.start = start;
        e.finish = finish;
        e
    }

    #[test]
    fn test_membership_roundtrip() {
        let mut st = ServiceTree::new();
        let id = EntityId::Queue(QueueId(1));
        let mut e = ent(0, 10 << SERVICE_SHIFT);
        st.active_insert(id, &mut e);
        assert_eq!(e.tree, TreeKind::Active);
        st.active_extract(&mut e);
        assert_eq!(e.tree, TreeKind::None);
        assert!(e.node.is_none());
        st.idle_insert(id, &mut e);
        assert_eq!(e.tree, TreeKind::Idle);
        st.idle_extract(&mut e);
        assert_eq!(e.tree, TreeKind::None);
        assert!(st.active.is_empty() && st.idle.is_empty());
    }

    #[test]
    fn test_vtime_jumps_to_min_start() {
        let mut st = ServiceTree::new();
        let mut e = ent(5 << SERVICE_SHIFT, 9 << SERVICE_SHIFT);
        st.active_insert(EntityId::Queue(QueueId(1)), &mut e);
        st.update_vtime();
        assert_eq!(st.vtime, 5 << SERVICE_SHIFT);
        // vtime never moves backwards
        st.vtime = 7 << SERVICE_SHIFT;
        st.update_vtime();
        assert_eq!(st.vtime, 7 << SERVICE_SHIFT);
    }

    #[test]
    fn test_idle_forgetting() {
        let mut st = ServiceTree::new();
        let id = EntityId::Queue(QueueId(1));
        let mut e = ent(0, 4 << SERVICE_SHIFT);
        st.idle_insert(id, &mut e);

        st.vtime = 2 << SERVICE_SHIFT;
        // active tree empty: the clock may jump over the idle tree
        assert_eq!(st.pop_forgettable_idle(), Some(id));
        assert_eq!(st.vtime, 4 << SERVICE_SHIFT);

        st.idle_extract(&mut e);
        assert_eq!(st.pop_forgettable_idle(), None);
    }

    #[test]
    fn test_idle_kept_while_finish_ahead() {
        let mut st = ServiceTree::new();
        let mut active = ent(0, 1 << SERVICE_SHIFT);
        st.active_insert(EntityId::Queue(QueueId(1)), &mut active);
        let mut idle = ent(0, 10 << SERVICE_SHIFT);
        st.idle_insert(EntityId::Queue(QueueId(2)), &mut idle);
        // finish ahead of the clock: the idle entity must be kept
        assert_eq!(st.pop_forgettable_idle(), None);
    }
}
