//! Hierarchy walks.
//!
//! Activation, deactivation and service charging start at a leaf and
//! propagate towards the root, one containing group at a time. Each
//! step follows the same rules: an entity under service is requeued by
//! charging only the service it actually received; an entity leaving
//! with a finish time still ahead of its class clock parks on the idle
//! tree so it cannot regain virtual time by bouncing.

use crate::entity::{vt_after, vt_delta, vt_max, Entity, EntityId, GroupId, QueueId, TreeKind};
use crate::group::BfqGroup;
use crate::ioprio::NR_IOPRIO_CLASSES;
use crate::queue::{BfqQueue, QueueFlags};
use crate::sched::BfqData;
use crate::service::ServiceTree;

impl BfqData {
    // ---- arena access ----

    pub(crate) fn queue(&self, q: QueueId) -> &BfqQueue {
        self.queues[q.0 as usize].as_ref().expect("stale queue handle")
    }

    pub(crate) fn queue_mut(&mut self, q: QueueId) -> &mut BfqQueue {
        self.queues[q.0 as usize].as_mut().expect("stale queue handle")
    }

    pub(crate) fn group(&self, g: GroupId) -> &BfqGroup {
        &self.groups[g.0 as usize]
    }

    pub(crate) fn group_mut(&mut self, g: GroupId) -> &mut BfqGroup {
        &mut self.groups[g.0 as usize]
    }

    pub(crate) fn ent(&self, id: EntityId) -> &Entity {
        match id {
            EntityId::Queue(q) => &self.queue(q).entity,
            EntityId::Group(g) => &self.group(g).entity,
        }
    }

    pub(crate) fn ent_mut(&mut self, id: EntityId) -> &mut Entity {
        match id {
            EntityId::Queue(q) => &mut self.queue_mut(q).entity,
            EntityId::Group(g) => &mut self.group_mut(g).entity,
        }
    }

    pub(crate) fn st_mut(&mut self, g: GroupId, class: usize) -> &mut ServiceTree {
        &mut self.groups[g.0 as usize].sched_data.service_tree[class]
    }

    pub(crate) fn st_ref(&self, g: GroupId, class: usize) -> &ServiceTree {
        &self.groups[g.0 as usize].sched_data.service_tree[class]
    }

    // ---- activation ----

    /// Activate an entity and propagate towards the root. Propagation
    /// stops at a level that already has an entity under service: that
    /// level will be requeued when its service ends.
    pub(crate) fn activate_entity(&mut self, mut id: EntityId) {
        loop {
            let Some(container) = self.ent(id).parent else {
                break;
            };
            if let EntityId::Group(g) = id {
                // a group is billed for the child it will serve next;
                // refresh the candidate before computing its finish
                self.update_next_active(g);
            }
            self.activate_one(id, container);
            if self.group(container).sched_data.active_entity.is_some() {
                break;
            }
            id = EntityId::Group(container);
        }
    }

    fn activate_one(&mut self, id: EntityId, container: GroupId) {
        let mut ent = *self.ent(id);
        let old_class = ent.ioprio_class.index();
        let in_service = self.group(container).sched_data.active_entity == Some(id);

        if in_service {
            debug_assert_eq!(ent.tree, TreeKind::None);
            // requeue of the entity under service: charge only what it
            // actually received
            ent.calc_finish(ent.service);
            ent.start = ent.finish;
            self.group_mut(container).sched_data.active_entity = None;
        } else {
            match ent.tree {
                TreeKind::Active => {
                    // requeue caused by a next-request change below;
                    // the old start time is kept
                    self.st_mut(container, old_class).active_extract(&mut ent);
                }
                TreeKind::Idle => {
                    let st = self.st_mut(container, old_class);
                    st.idle_extract(&mut ent);
                    ent.start = vt_max(st.vtime, ent.finish);
                }
                TreeKind::None => {
                    debug_assert!(!ent.on_st);
                    let st = self.st_mut(container, old_class);
                    ent.start = st.vtime;
                    st.wsum += ent.weight as u64;
                    ent.on_st = true;
                    if let EntityId::Queue(q) = id {
                        self.queue_mut(q).refcnt += 1;
                    }
                }
            }
        }

        self.apply_pending_prio(&mut ent, container);
        ent.calc_finish(ent.budget);
        let class = ent.ioprio_class.index();
        self.st_mut(container, class).active_insert(id, &mut ent);
        *self.ent_mut(id) = ent;
    }

    /// Apply a deferred priority/weight change while the entity is off
    /// both trees, moving its weight between class trees as needed.
    fn apply_pending_prio(&mut self, ent: &mut Entity, container: GroupId) {
        if !ent.prio_changed {
            return;
        }
        let old_class = ent.ioprio_class.index();
        let sd = &mut self.groups[container.0 as usize].sched_data;
        sd.service_tree[old_class].wsum -= ent.weight as u64;
        ent.ioprio = ent.new_ioprio;
        ent.ioprio_class = ent.new_ioprio_class;
        ent.weight = ent.new_weight;
        ent.prio_changed = false;
        let new_class = ent.ioprio_class.index();
        sd.service_tree[new_class].wsum += ent.weight as u64;
        if new_class != old_class {
            ent.start = sd.service_tree[new_class].vtime;
        }
    }

    // ---- deactivation ----

    /// Deactivate an entity; with `requeue`, entities whose finish lies
    /// ahead of the class clock park on the idle tree. An emptied
    /// parent is deactivated in turn; a still-backlogged parent is
    /// requeued so its budget reflects the new next child.
    pub(crate) fn deactivate_entity(&mut self, mut id: EntityId, mut requeue: bool) {
        loop {
            let Some(container) = self.ent(id).parent else {
                return;
            };
            if !self.deactivate_one(id, container, requeue) {
                // this level is still under service; nothing above
                // changes
                return;
            }
            if self.group(container).sched_data.next_active.is_some() {
                // the parent stays backlogged: requeue it up the path
                // so budgets track the new candidate
                self.activate_entity(EntityId::Group(container));
                return;
            }
            requeue = true;
            id = EntityId::Group(container);
        }
    }

    fn deactivate_one(&mut self, id: EntityId, container: GroupId, requeue: bool) -> bool {
        let mut ent = *self.ent(id);
        if !ent.on_st {
            return false;
        }
        let class = ent.ioprio_class.index();
        let in_service = self.group(container).sched_data.active_entity == Some(id);
        debug_assert!(!(in_service && ent.tree != TreeKind::None));

        if in_service {
            ent.calc_finish(ent.service);
            self.group_mut(container).sched_data.active_entity = None;
        } else if ent.tree == TreeKind::Active {
            self.st_mut(container, class).active_extract(&mut ent);
        } else if ent.tree == TreeKind::Idle {
            self.st_mut(container, class).idle_extract(&mut ent);
        }
        *self.ent_mut(id) = ent;

        let mut propagate = false;
        if in_service || self.group(container).sched_data.next_active == Some(id) {
            propagate = self.update_next_active(container);
        }

        let mut ent = *self.ent(id);
        let vtime = self.st_ref(container, class).vtime;
        if !requeue || !vt_after(ent.finish, vtime) {
            self.forget_entity(id, &mut ent, container, class);
        } else {
            self.st_mut(container, class).idle_insert(id, &mut ent);
            *self.ent_mut(id) = ent;
        }

        debug_assert!(self.group(container).sched_data.active_entity != Some(id));
        debug_assert!(self.group(container).sched_data.next_active != Some(id));
        propagate
    }

    /// Drop an entity from its service tree entirely.
    fn forget_entity(&mut self, id: EntityId, ent: &mut Entity, container: GroupId, class: usize) {
        debug_assert!(ent.on_st);
        self.st_mut(container, class).wsum -= ent.weight as u64;
        ent.on_st = false;
        *self.ent_mut(id) = *ent;
        if let EntityId::Queue(q) = id {
            self.put_queue(q);
        }
    }

    /// Let the class clock walk over spent idle entities, one per call.
    /// True if an entity was forgotten.
    pub(crate) fn prune_idle(&mut self, container: GroupId, class: usize) -> bool {
        let Some(id) = self.st_mut(container, class).pop_forgettable_idle() else {
            return false;
        };
        let mut ent = *self.ent(id);
        self.st_mut(container, class).idle_extract(&mut ent);
        self.forget_entity(id, &mut ent, container, class);
        true
    }

    // ---- selection ----

    /// Refresh the cached next candidate of a group whose service just
    /// changed. Returns false while the group still has an entity
    /// under service.
    pub(crate) fn update_next_active(&mut self, g: GroupId) -> bool {
        if self.group(g).sched_data.active_entity.is_some() {
            return false;
        }
        let next = self.lookup_next_entity(g, false);
        self.group_mut(g).sched_data.next_active = next;
        if let Some(ne) = next {
            // a group inherits the budget of the child it will serve
            let budget = self.ent(ne).budget;
            if self.group(g).entity.parent.is_some() {
                self.group_mut(g).entity.budget = budget;
            }
        }
        true
    }

    /// Find (and with `extract`, take into service) the next entity of
    /// a group, scanning classes in strict priority order.
    pub(crate) fn lookup_next_entity(&mut self, g: GroupId, extract: bool) -> Option<EntityId> {
        debug_assert!(self.group(g).sched_data.active_entity.is_none());

        let mut found = None;
        if extract {
            found = self.group(g).sched_data.next_active;
        }
        if found.is_none() {
            for class in 0..NR_IOPRIO_CLASSES {
                if self.st_ref(g, class).active.is_empty() {
                    continue;
                }
                self.st_mut(g, class).update_vtime();
                self.prune_idle(g, class);
                let st = self.st_ref(g, class);
                if let Some(node) = st.active.first_eligible(st.vtime) {
                    found = Some(st.active.item(node));
                    break;
                }
            }
        }

        let id = found?;
        if extract {
            self.group_mut(g).sched_data.next_active = None;
            let mut ent = *self.ent(id);
            let class = ent.ioprio_class.index();
            let st = self.st_mut(g, class);
            st.vtime = vt_max(st.vtime, ent.start);
            st.active_extract(&mut ent);
            *self.ent_mut(id) = ent;
            self.group_mut(g).sched_data.active_entity = Some(id);
        }
        Some(id)
    }

    /// Walk the hierarchy from the root down to the leaf queue that
    /// should be served next, taking every entity on the path into
    /// service and resetting its service counter.
    pub(crate) fn get_next_queue(&mut self) -> Option<QueueId> {
        if self.busy_queues == 0 {
            return None;
        }
        debug_assert!(self.active_queue.is_none());
        let mut g = self.root_group;
        loop {
            let Some(id) = self.lookup_next_entity(g, true) else {
                // §7: recoverable inconsistency, log and let the
                // dispatcher retry
                log::warn!(target: "bfq", "no schedulable entity with {} busy queues", self.busy_queues);
                return None;
            };
            self.ent_mut(id).service = 0;
            match id {
                EntityId::Queue(q) => return Some(q),
                EntityId::Group(child) => g = child,
            }
        }
    }

    // ---- charging ----

    /// Charge `served` sectors to a queue and every ancestor on its
    /// path, advancing each class clock by the weighted delta.
    pub(crate) fn entity_served(&mut self, q: QueueId, served: u64) {
        let mut id = EntityId::Queue(q);
        loop {
            let Some(container) = self.ent(id).parent else {
                break;
            };
            let class = {
                let ent = self.ent_mut(id);
                ent.service += served;
                debug_assert!(ent.service <= ent.budget);
                ent.ioprio_class.index()
            };
            let st = self.st_mut(container, class);
            debug_assert!(st.wsum > 0);
            st.vtime = st.vtime.wrapping_add(vt_delta(served, st.wsum));
            self.prune_idle(container, class);
            id = EntityId::Group(container);
        }
    }

    // ---- busy bookkeeping ----

    pub(crate) fn add_busy_queue(&mut self, q: QueueId) {
        debug_assert!(!self.queue(q).is_busy());
        debug_assert!(self.active_queue != Some(q));
        self.queue_mut(q).flags.insert(QueueFlags::BUSY);
        self.busy_queues += 1;
        self.activate_entity(EntityId::Queue(q));
    }

    pub(crate) fn del_busy_queue(&mut self, q: QueueId, requeue: bool) {
        debug_assert!(self.queue(q).is_busy());
        debug_assert!(self.queue(q).sort_list.is_empty());
        self.queue_mut(q).flags.remove(QueueFlags::BUSY);
        self.busy_queues -= 1;
        self.deactivate_entity(EntityId::Queue(q), requeue);
    }

    // ---- consistency checking ----

    /// Structural self-check over every group: tree validity, weight
    /// sums, and tree-membership bookkeeping. Debug/test support.
    pub fn validate_invariants(&self) -> Result<(), &'static str> {
        for (gi, group) in self.groups.iter().enumerate() {
            for class in 0..NR_IOPRIO_CLASSES {
                let st = &group.sched_data.service_tree[class];
                st.active.validate()?;
                st.idle.validate()?;
                let mut wsum = 0u64;
                let container = GroupId(gi as u32);
                for qs in self.queues.iter().flatten() {
                    let e = &qs.entity;
                    if e.parent == Some(container) && e.on_st && e.ioprio_class.index() == class {
                        wsum += e.weight as u64;
                    }
                }
                for other in self.groups.iter() {
                    let e = &other.entity;
                    if e.parent == Some(container) && e.on_st && e.ioprio_class.index() == class {
                        wsum += e.weight as u64;
                    }
                }
                if wsum != st.wsum {
                    return Err("weight sum out of sync");
                }
            }
        }
        for qs in self.queues.iter().flatten() {
            match qs.entity.tree {
                TreeKind::None => {
                    if qs.entity.node.is_some() {
                        return Err("off-tree entity holding a node");
                    }
                }
                TreeKind::Active | TreeKind::Idle => {
                    if qs.entity.node.is_none() {
                        return Err("on-tree entity without a node");
                    }
                }
            }
        }
        Ok(())
    }
}
