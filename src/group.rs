//! Task groups: a tree of run-queues joined by group entities.
//!
//! Every group owns one [`FairRunQueue`] per CPU. A non-root group is also
//! represented by a group entity queued in its parent's run-queue, so CPU
//! time is divided among sibling groups by group weight first and only
//! then among the members of the chosen group.
//!
//! A group entity is on its parent's queue exactly when its own queue holds
//! at least one runnable entity. `enqueue_task` and `dequeue_task` walk
//! from the task toward the root to keep that true.

use std::collections::BTreeMap;
use std::ops::{Index, IndexMut};

use tracing::{debug, error};

use crate::config::SchedConfig;
use crate::entity::{EntityArena, EntityKind, EntityState, SchedEntity};
use crate::error::{Result, SchedError};
use crate::rq::FairRunQueue;
use crate::types::{EntityId, GroupId, Pid, RqIdx, TimeNs};
use crate::weight::LoadWeight;

#[derive(Debug, Clone)]
pub(crate) struct GroupNode {
    pub parent: Option<GroupId>,
    /// `None` for the root group.
    pub entity: Option<EntityId>,
    pub queue: RqIdx,
    pub nr_tasks: usize,
    pub nr_children: usize,
}

#[derive(Debug, Default)]
pub(crate) struct QueueArena {
    slots: Vec<Option<FairRunQueue>>,
}

impl QueueArena {
    fn insert_with(&mut self, make: impl FnOnce(RqIdx) -> FairRunQueue) -> RqIdx {
        let free = self.slots.iter().position(Option::is_none);
        let idx = RqIdx(free.unwrap_or(self.slots.len()) as u32);
        let rq = make(idx);
        match free {
            Some(i) => self.slots[i] = Some(rq),
            None => self.slots.push(Some(rq)),
        }
        idx
    }

    fn remove(&mut self, idx: RqIdx) -> Option<FairRunQueue> {
        self.slots.get_mut(idx.0 as usize)?.take()
    }
}

impl Index<RqIdx> for QueueArena {
    type Output = FairRunQueue;

    fn index(&self, idx: RqIdx) -> &FairRunQueue {
        match self.slots.get(idx.0 as usize) {
            Some(Some(rq)) => rq,
            _ => panic!("stale run-queue handle {}", idx.0),
        }
    }
}

impl IndexMut<RqIdx> for QueueArena {
    fn index_mut(&mut self, idx: RqIdx) -> &mut FairRunQueue {
        match self.slots.get_mut(idx.0 as usize) {
            Some(Some(rq)) => rq,
            _ => panic!("stale run-queue handle {}", idx.0),
        }
    }
}

/// All scheduling state of one CPU below the driver.
#[derive(Debug)]
pub(crate) struct GroupHierarchy {
    pub entities: EntityArena,
    pub queues: QueueArena,
    pub groups: BTreeMap<GroupId, GroupNode>,
    pub tasks: BTreeMap<Pid, EntityId>,
    pub root: RqIdx,
}

impl GroupHierarchy {
    pub fn new(now: TimeNs) -> Self {
        let mut queues = QueueArena::default();
        let root = queues.insert_with(|idx| FairRunQueue::new(idx, GroupId::ROOT, None, now));
        let mut groups = BTreeMap::new();
        groups.insert(
            GroupId::ROOT,
            GroupNode {
                parent: None,
                entity: None,
                queue: root,
                nr_tasks: 0,
                nr_children: 0,
            },
        );
        Self {
            entities: EntityArena::default(),
            queues,
            groups,
            tasks: BTreeMap::new(),
            root,
        }
    }

    pub fn group(&self, id: GroupId) -> Result<&GroupNode> {
        self.groups.get(&id).ok_or(SchedError::UnknownGroup(id))
    }

    pub fn task(&self, pid: Pid) -> Result<EntityId> {
        self.tasks
            .get(&pid)
            .copied()
            .ok_or(SchedError::UnknownTask(pid))
    }

    pub fn queue_of(&self, id: EntityId) -> &FairRunQueue {
        &self.queues[self.entities[id].rq]
    }

    /// Group entity that owns `rq`, and the depth of entities queued on it.
    fn owner_and_depth(&self, rq: RqIdx) -> (Option<EntityId>, u32) {
        match self.queues[rq].owner {
            Some(owner) => (Some(owner), self.entities[owner].depth + 1),
            None => (None, 0),
        }
    }

    pub fn create_group(
        &mut self,
        id: GroupId,
        parent: GroupId,
        load: LoadWeight,
        now: TimeNs,
    ) -> Result<()> {
        if self.groups.contains_key(&id) {
            return Err(SchedError::DuplicateGroup(id));
        }
        let parent_rq = self.group(parent)?.queue;
        let (grandparent, depth) = self.owner_and_depth(parent_rq);

        let mut se = SchedEntity::new(EntityKind::Group(id), load, parent_rq, now);
        se.parent = grandparent;
        se.depth = depth;
        let entity = self.entities.insert(se);
        let queue = self
            .queues
            .insert_with(|idx| FairRunQueue::new(idx, id, Some(entity), now));
        self.entities[entity].my_q = Some(queue);

        self.groups.insert(
            id,
            GroupNode {
                parent: Some(parent),
                entity: Some(entity),
                queue,
                nr_tasks: 0,
                nr_children: 0,
            },
        );
        if let Some(node) = self.groups.get_mut(&parent) {
            node.nr_children += 1;
        }
        debug!(group = %id, parent = %parent, weight = load.weight, "create group");
        Ok(())
    }

    pub fn destroy_group(&mut self, id: GroupId) -> Result<()> {
        if id == GroupId::ROOT {
            return Err(SchedError::GroupNotEmpty(id));
        }
        let node = self.group(id)?;
        if node.nr_tasks > 0 || node.nr_children > 0 || !self.queues[node.queue].is_empty() {
            return Err(SchedError::GroupNotEmpty(id));
        }
        let node = node.clone();
        if let Some(entity) = node.entity {
            self.entities.remove(entity);
        }
        self.queues.remove(node.queue);
        self.groups.remove(&id);
        if let Some(parent) = node.parent.and_then(|p| self.groups.get_mut(&p)) {
            parent.nr_children -= 1;
        }
        debug!(group = %id, "destroy group");
        Ok(())
    }

    /// Insert a task entity into `group` without queueing it.
    pub fn attach_task(&mut self, pid: Pid, mut se: SchedEntity, group: GroupId) -> Result<EntityId> {
        if self.tasks.contains_key(&pid) {
            return Err(SchedError::DuplicateTask(pid));
        }
        let rq = self.group(group)?.queue;
        let (parent, depth) = self.owner_and_depth(rq);
        se.rq = rq;
        se.parent = parent;
        se.depth = depth;
        se.state = EntityState::Off;
        let id = self.entities.insert(se);
        self.tasks.insert(pid, id);
        if let Some(node) = self.groups.get_mut(&group) {
            node.nr_tasks += 1;
        }
        Ok(id)
    }

    /// Remove an off-queue task entity and hand it back.
    pub fn detach_task(&mut self, pid: Pid) -> Result<SchedEntity> {
        let id = self.task(pid)?;
        if self.entities[id].state != EntityState::Off {
            return Err(SchedError::TaskRunnable(pid));
        }
        let group = self.queue_of(id).group();
        self.tasks.remove(&pid);
        if let Some(node) = self.groups.get_mut(&group) {
            node.nr_tasks -= 1;
        }
        self.entities
            .remove(id)
            .ok_or(SchedError::UnknownTask(pid))
    }

    /// Queue a task and every ancestor group entity that was not queued.
    pub fn enqueue_task(&mut self, leaf: EntityId, config: &SchedConfig, now: TimeNs) -> Result<()> {
        if self.entities[leaf].state != EntityState::Off {
            return Err(SchedError::DoubleEnqueue(leaf));
        }
        let mut se = Some(leaf);
        while let Some(id) = se {
            if self.entities[id].state != EntityState::Off {
                break;
            }
            let rq = self.entities[id].rq;
            self.queues[rq].enqueue(&mut self.entities, id, config, now)?;
            self.queues[rq].h_nr_running += 1;
            se = self.entities[id].parent;
        }
        // Ancestors that were already queued still gain a runnable task.
        while let Some(id) = se {
            let rq = self.entities[id].rq;
            self.queues[rq].h_nr_running += 1;
            se = self.entities[id].parent;
        }
        Ok(())
    }

    /// Dequeue a task and every ancestor group entity left with an empty
    /// queue.
    pub fn dequeue_task(&mut self, leaf: EntityId, config: &SchedConfig, now: TimeNs) -> Result<()> {
        if self.entities[leaf].state == EntityState::Off {
            return Err(SchedError::DequeueNotEnqueued(leaf));
        }
        let mut se = Some(leaf);
        while let Some(id) = se {
            let rq = self.entities[id].rq;
            self.queues[rq].dequeue(&mut self.entities, id, config, now)?;
            self.queues[rq].h_nr_running -= 1;
            se = self.entities[id].parent;
            if !self.queues[rq].is_empty() {
                break;
            }
        }
        while let Some(id) = se {
            let rq = self.entities[id].rq;
            self.queues[rq].h_nr_running -= 1;
            se = self.entities[id].parent;
        }
        Ok(())
    }

    /// Pick from the root down to a task, making every entity on the path
    /// the running one of its queue.
    pub fn pick_next_task(&mut self, config: &SchedConfig, now: TimeNs) -> Option<EntityId> {
        let mut rq = self.root;
        loop {
            let Some(se) = self.queues[rq].pick_next(&self.entities, config) else {
                if rq != self.root {
                    error!(rq = %self.queues[rq].group(), "queued group has nothing to run");
                }
                return None;
            };
            self.queues[rq].set_next(&mut self.entities, se, config, now);
            match self.entities[se].my_q {
                Some(child) => rq = child,
                None => return Some(se),
            }
        }
    }

    /// Put every running entity from `leaf` up to the root back on its
    /// queue. Entities already dequeued are skipped.
    pub fn put_prev_task(&mut self, leaf: EntityId, config: &SchedConfig, now: TimeNs) {
        let mut se = Some(leaf);
        while let Some(id) = se {
            let rq = self.entities[id].rq;
            self.queues[rq].put_prev(&mut self.entities, id, config, now);
            se = self.entities[id].parent;
        }
    }

    /// Charge elapsed time to every running entity from `leaf` to the
    /// root. Returns true if any of them was granted a new slice while
    /// others were waiting on its queue.
    pub fn update_curr_chain(&mut self, leaf: EntityId, config: &SchedConfig, now: TimeNs) -> bool {
        let mut renewed = false;
        let mut se = Some(leaf);
        while let Some(id) = se {
            let rq = self.entities[id].rq;
            if self.queues[rq].curr() == Some(id)
                && self.queues[rq].update_curr(&mut self.entities, config, now)
                && self.queues[rq].nr_running() > 1
            {
                renewed = true;
            }
            se = self.entities[id].parent;
        }
        renewed
    }

    /// Walk `a` and `b` up to the first queue they share and return their
    /// representatives on it.
    pub fn matching_level(&self, a: EntityId, b: EntityId) -> Option<(EntityId, EntityId)> {
        let (mut a, mut b) = (a, b);
        while self.entities[a].depth > self.entities[b].depth {
            a = self.entities[a].parent?;
        }
        while self.entities[b].depth > self.entities[a].depth {
            b = self.entities[b].parent?;
        }
        while self.entities[a].rq != self.entities[b].rq {
            a = self.entities[a].parent?;
            b = self.entities[b].parent?;
        }
        Some((a, b))
    }

    /// Move an off-queue task into another group on the same CPU,
    /// preserving its standing relative to the queues' `min_vruntime`.
    pub fn move_task(&mut self, pid: Pid, to: GroupId) -> Result<EntityId> {
        let id = self.task(pid)?;
        let dst = self.group(to)?.queue;
        if self.entities[id].state != EntityState::Off {
            return Err(SchedError::TaskRunnable(pid));
        }
        let src = self.entities[id].rq;
        let from = self.queues[src].group();
        let (parent, depth) = self.owner_and_depth(dst);
        let (src_min, dst_min) = (self.queues[src].min_vruntime(), self.queues[dst].min_vruntime());

        let se = &mut self.entities[id];
        se.vruntime = se.vruntime.rebase(src_min, dst_min);
        se.rq = dst;
        se.parent = parent;
        se.depth = depth;
        se.nr_migrations += 1;

        if let Some(node) = self.groups.get_mut(&from) {
            node.nr_tasks -= 1;
        }
        if let Some(node) = self.groups.get_mut(&to) {
            node.nr_tasks += 1;
        }
        debug!(pid = %pid, from = %from, to = %to, "move task");
        Ok(id)
    }

    /// Runnable tasks on this CPU.
    pub fn nr_running(&self) -> u32 {
        self.queues[self.root].h_nr_running
    }
}
